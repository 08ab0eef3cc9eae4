use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Parser, ValueEnum};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::{Number, Value};
use trainloop::{
    logging, Executor, ExecutorOptions, InMemoryLoader, LinearClassifier, LoaderBundle, RunConfig,
    TrainError,
};

const FEATURE_DIM: usize = 16;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Linear classifier training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to run config file"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(
        long,
        value_enum,
        default_value = "train",
        help = "Run training or checkpoint-backed prediction"
    )]
    mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Train,
    Predict,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainError> {
    let args = Args::parse();

    let mut config = RunConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let _log_guard = logging::init(&config)?;

    let loaders = build_loaders(&config)?;
    let options = ExecutorOptions {
        resume: args.resume,
    };
    let mut executor = Executor::new(config, loaders, options, |config: &RunConfig| {
        LinearClassifier::new(
            config.num_classes,
            FEATURE_DIM,
            config.learning_rate,
            config.seed,
        )
    })?;

    match args.mode {
        Mode::Train => {
            let shutdown_flag = Arc::new(AtomicBool::new(false));
            let handler_flag = shutdown_flag.clone();
            ctrlc::set_handler(move || {
                handler_flag.store(true, Ordering::Relaxed);
            })
            .map_err(|err| {
                TrainError::runtime(format!("failed to install signal handler: {err}"))
            })?;

            executor.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
        }
        Mode::Predict => {
            let report = executor.predict()?;
            match report.rank5 {
                Some(rank5) => println!(
                    "prediction accuracy {:.2}% (top-5 {:.2}%) over {} examples",
                    report.rank1, rank5, report.examples
                ),
                None => println!(
                    "prediction accuracy {:.2}% over {} examples",
                    report.rank1, report.examples
                ),
            }
        }
    }

    Ok(())
}

/// Builds balanced train/valid/test splits of a synthetic clustered dataset.
/// Every split draws its class centers from `config.seed`, so the splits
/// describe the same underlying classes while their noise differs.
fn build_loaders(config: &RunConfig) -> Result<LoaderBundle, TrainError> {
    let train = synthetic_split(
        config,
        512,
        config.seed.wrapping_add(1),
        config.shuffle,
        config.drop_last,
    )?;
    let valid = synthetic_split(config, 128, config.seed.wrapping_add(2), false, false)?;
    let test = synthetic_split(config, 128, config.seed.wrapping_add(3), false, false)?;

    Ok(LoaderBundle {
        train: Box::new(train),
        valid: Box::new(valid),
        test: Some(Box::new(test)),
    })
}

fn synthetic_split(
    config: &RunConfig,
    examples: usize,
    noise_seed: u64,
    shuffle: bool,
    drop_last: bool,
) -> Result<InMemoryLoader, TrainError> {
    let mut center_rng = StdRng::seed_from_u64(config.seed);
    let centers: Vec<Vec<f32>> = (0..config.num_classes)
        .map(|_| {
            (0..FEATURE_DIM)
                .map(|_| center_rng.gen_range(-1.0f32..1.0))
                .collect()
        })
        .collect();

    let mut noise_rng = StdRng::seed_from_u64(noise_seed);
    let mut features = Vec::with_capacity(examples * FEATURE_DIM);
    let mut labels = Vec::with_capacity(examples);
    for example in 0..examples {
        let class = example % config.num_classes;
        for &component in &centers[class] {
            features.push(component + noise_rng.gen_range(-0.35f32..0.35));
        }
        labels.push(class as u32);
    }

    InMemoryLoader::new(
        features,
        labels,
        FEATURE_DIM,
        config.batch_size,
        shuffle,
        drop_last,
        noise_seed,
    )
}

fn apply_overrides(config: RunConfig, overrides: &[OverrideArg]) -> Result<RunConfig, TrainError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainError::runtime(format!(
            "override path '{path}' contains an empty segment"
        )));
    }

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        let is_last = idx + 1 == segments.len();
        let Some(map) = current.as_object_mut() else {
            return Err(TrainError::runtime(format!(
                "override path segment '{segment}' points to a non-object value"
            )));
        };

        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if is_last {
            *entry = new_value;
            return Ok(());
        }
        if entry.is_null() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry;
    }

    Ok(())
}
