use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::tempdir;
use trainloop::{
    DeviceKind, Executor, ExecutorOptions, InMemoryLoader, LinearClassifier, LoaderBundle,
    LogLevel, ModelStrategy, Phase, RunConfig, SchedulerConfig, TrainError,
};

const FEATURE_DIM: usize = 4;

fn run_config(root: &Path) -> RunConfig {
    RunConfig {
        project_name: "demo".to_string(),
        input_dir: root.to_path_buf(),
        train_dir: None,
        valid_dir: None,
        train_csv: None,
        valid_csv: None,
        checkpoint_interval: 1,
        num_classes: 3,
        epochs: 2,
        learning_rate: 0.05,
        device: DeviceKind::Cpu,
        multi_gpu: false,
        mixed_precision: false,
        batch_size: 8,
        shuffle: false,
        drop_last: false,
        seed: 7,
        checkpoint_dir: None,
        run_log_dir: None,
        max_keep: None,
        logfile: root.join("output.log"),
        loglevel: LogLevel::Info,
        scheduler: SchedulerConfig::default(),
    }
}

fn clustered_split(
    config: &RunConfig,
    examples: usize,
    noise_seed: u64,
) -> InMemoryLoader {
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
            features.push(component + noise_rng.gen_range(-0.2f32..0.2));
        }
        labels.push(class as u32);
    }

    InMemoryLoader::new(
        features,
        labels,
        FEATURE_DIM,
        config.batch_size,
        config.shuffle,
        config.drop_last,
        noise_seed,
    )
    .unwrap()
}

fn bundle(config: &RunConfig) -> LoaderBundle {
    LoaderBundle {
        train: Box::new(clustered_split(config, 32, config.seed.wrapping_add(1))),
        valid: Box::new(clustered_split(config, 16, config.seed.wrapping_add(2))),
        test: Some(Box::new(clustered_split(config, 16, config.seed.wrapping_add(3)))),
    }
}

fn build_executor(config: &RunConfig, resume: bool) -> Executor<LinearClassifier> {
    Executor::new(
        config.clone(),
        bundle(config),
        ExecutorOptions { resume },
        |config: &RunConfig| {
            LinearClassifier::new(
                config.num_classes,
                FEATURE_DIM,
                config.learning_rate,
                config.seed,
            )
        },
    )
    .unwrap()
}

fn pointer_lines(root: &Path) -> Vec<String> {
    fs::read_to_string(root.join("last.checkpoint"))
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn stamped_dirs(parent: &Path) -> Vec<PathBuf> {
    if !parent.exists() {
        return Vec::new();
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(parent)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn event_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("events.out.tfevents."))
        })
        .collect();
    files.sort();
    files
}

/// Walks the length-prefixed record framing and counts the records.
fn count_events(path: &Path) -> usize {
    let bytes = fs::read(path).unwrap();
    let mut offset = 0usize;
    let mut events = 0usize;
    while offset < bytes.len() {
        let header: [u8; 8] = bytes[offset..offset + 8].try_into().unwrap();
        let len = u64::from_le_bytes(header) as usize;
        offset += 8 + 4 + len + 4;
        events += 1;
    }
    assert_eq!(offset, bytes.len(), "event framing misaligned in {}", path.display());
    events
}

#[test]
fn training_writes_interval_checkpoints_and_pointer() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut runner = build_executor(&config, false);
    runner.train().unwrap();
    assert_eq!(runner.phase(), Phase::Completed);

    let lines = pointer_lines(root);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("demo_checkpoint_2.ckpt"));

    let run_dir = PathBuf::from(&lines[0]).parent().unwrap().to_path_buf();
    assert_eq!(
        file_names(&run_dir),
        vec!["demo_checkpoint_1.ckpt", "demo_checkpoint_2.ckpt"]
    );

    let log_dir = PathBuf::from(&lines[1]);
    let events = event_files(&log_dir);
    assert_eq!(events.len(), 1);
    // 4 batches of loss per epoch plus the two accuracy curves, twice
    assert_eq!(count_events(&events[0]), 12);
}

#[test]
fn resume_continues_from_next_epoch() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut first = build_executor(&config, false);
    first.train().unwrap();
    let first_log_dir = PathBuf::from(&pointer_lines(root)[1]);

    // run directories are stamped to the second
    thread::sleep(Duration::from_millis(1100));

    let mut longer = run_config(root);
    longer.epochs = 4;
    let mut second = build_executor(&longer, true);
    second.build().unwrap();
    assert_eq!(second.start_epoch(), 3);

    second.train().unwrap();
    assert_eq!(second.phase(), Phase::Completed);

    let lines = pointer_lines(root);
    assert!(lines[0].ends_with("demo_checkpoint_4.ckpt"));
    assert_eq!(PathBuf::from(&lines[1]), first_log_dir);

    let second_run_dir = PathBuf::from(&lines[0]).parent().unwrap().to_path_buf();
    assert_eq!(
        file_names(&second_run_dir),
        vec!["demo_checkpoint_3.ckpt", "demo_checkpoint_4.ckpt"]
    );
    assert_eq!(stamped_dirs(&root.join("checkpoint")).len(), 2);

    // plots for the continued run land next to the first run's
    assert_eq!(stamped_dirs(&root.join("runs")).len(), 1);
    assert_eq!(event_files(&first_log_dir).len(), 2);
}

#[test]
fn resume_past_final_epoch_trains_nothing() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut first = build_executor(&config, false);
    first.train().unwrap();
    let pointer_before = pointer_lines(root);

    let mut second = build_executor(&config, true);
    second.build().unwrap();
    assert_eq!(second.start_epoch(), 3);

    second.train().unwrap();
    assert_eq!(second.phase(), Phase::Completed);
    assert_eq!(pointer_lines(root), pointer_before);
    assert_eq!(stamped_dirs(&root.join("checkpoint")).len(), 1);
}

#[test]
fn conflicting_precision_and_parallelism_rejected() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let mut config = run_config(root);
    config.multi_gpu = true;
    config.mixed_precision = true;

    assert!(matches!(
        config.validate(),
        Err(TrainError::ConfigConflict { .. })
    ));

    let result = Executor::new(
        config.clone(),
        bundle(&config),
        ExecutorOptions::default(),
        |config: &RunConfig| {
            LinearClassifier::new(
                config.num_classes,
                FEATURE_DIM,
                config.learning_rate,
                config.seed,
            )
        },
    );
    match result {
        Ok(_) => panic!("conflicting flags must be rejected at construction"),
        Err(err) => assert!(matches!(err, TrainError::ConfigConflict { .. })),
    }
}

#[test]
fn validation_leaves_parameters_untouched() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut runner = build_executor(&config, false);
    runner.build().unwrap();
    let before = runner.model().unwrap().model_state().unwrap();
    let was_training = runner.model().unwrap().is_training();

    let accuracy = runner.validation_accuracy().unwrap();
    assert!((0.0..=100.0).contains(&accuracy));

    let model = runner.model().unwrap();
    assert_eq!(model.model_state().unwrap(), before);
    assert_eq!(model.is_training(), was_training);
}

#[test]
fn predict_without_checkpoint_is_resume_required() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut runner = build_executor(&config, false);
    match runner.predict() {
        Err(TrainError::ResumeRequired { pointer }) => {
            assert_eq!(pointer, root.join("last.checkpoint"));
        }
        other => panic!("expected ResumeRequired, got {other:?}"),
    }
}

#[test]
fn predict_reports_rank_metrics() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let mut config = run_config(root);
    config.num_classes = 6;

    let mut trainer = build_executor(&config, false);
    trainer.train().unwrap();

    let mut predictor = build_executor(&config, false);
    let report = predictor.predict().unwrap();
    assert_eq!(report.examples, 16);
    assert!((0.0..=100.0).contains(&report.rank1));
    let rank5 = report.rank5.expect("six classes must report top-5");
    assert!(rank5 >= report.rank1);
    assert_eq!(predictor.phase(), Phase::Built);
}

#[test]
fn corrupt_checkpoint_falls_back_to_fresh_run() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut first = build_executor(&config, false);
    first.train().unwrap();

    let record = PathBuf::from(&pointer_lines(root)[0]);
    fs::write(&record, b"scrambled bytes").unwrap();

    let mut second = build_executor(&config, true);
    second.build().unwrap();
    assert_eq!(second.start_epoch(), 1);
}

#[test]
fn malformed_pointer_is_ignored_on_resume() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);
    fs::write(root.join("last.checkpoint"), "only one line").unwrap();

    let mut runner = build_executor(&config, true);
    runner.build().unwrap();
    assert_eq!(runner.start_epoch(), 1);
}

#[test]
fn shutdown_request_abandons_run() {
    let tmp = tempdir().unwrap();
    let root = tmp.path();
    let config = run_config(root);

    let mut runner = build_executor(&config, false);
    runner.train_with_shutdown(|| true).unwrap();

    assert_eq!(runner.phase(), Phase::Completed);
    assert!(!root.join("checkpoint").exists());
    assert!(!root.join("last.checkpoint").exists());
}
