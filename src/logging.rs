//! Process-wide logging, built explicitly from the run configuration
//! rather than from environment variables.

use std::{
    ffi::OsStr,
    fs,
    path::Path,
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::RunConfig;
use crate::error::{Result, TrainError};

/// Keeps the background file writer alive; dropping it flushes pending
/// log lines. Hold it for the life of the program.
pub struct LogGuard {
    _file: WorkerGuard,
}

/// Installs the global subscriber: a human-readable console layer plus a
/// plain file sink at `config.logfile`, both filtered at `config.loglevel`.
pub fn init(config: &RunConfig) -> Result<LogGuard> {
    let filter = config.loglevel.as_filter();

    let console_layer = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let (dir, name) = split_logfile(&config.logfile)?;
    fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| TrainError::initialization(format!("failed to install logger: {err}")))?;

    Ok(LogGuard { _file: guard })
}

fn split_logfile(logfile: &Path) -> Result<(&Path, &OsStr)> {
    let name = logfile.file_name().ok_or_else(|| {
        TrainError::initialization(format!("logfile {} has no file name", logfile.display()))
    })?;
    let dir = logfile
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn bare_file_name_lands_in_current_dir() {
        let (dir, name) = split_logfile(Path::new("output.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "output.log");
    }

    #[test]
    fn nested_logfile_keeps_its_directory() {
        let path = PathBuf::from("/var/log/runs/output.log");
        let (dir, name) = split_logfile(&path).unwrap();
        assert_eq!(dir, Path::new("/var/log/runs"));
        assert_eq!(name, "output.log");
    }

    #[test]
    fn directory_path_is_rejected() {
        assert!(split_logfile(Path::new("/")).is_err());
    }
}
