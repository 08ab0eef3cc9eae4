//! Checkpoint records and the resume pointer.
//!
//! Each record is a single bincode file named
//! `{project}_checkpoint_{epoch}.ckpt` inside a per-run directory. The
//! pointer file holds two lines, the newest record path and the
//! visualization directory it was flushed with, so a resumed run can
//! reopen both.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::RunConfig,
    error::{Result, TrainError},
    sink::ScalarSink,
};

pub const CHECKPOINT_VERSION: u32 = 1;

const RECORD_SUFFIX: &str = ".ckpt";

/// Restorable training state. The blobs are opaque to the manager and
/// only interpreted by the strategy that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    pub model: Vec<u8>,
    pub optimizer: Vec<u8>,
    pub scheduler: Option<Vec<u8>>,
}

/// What the resume pointer names.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeTarget {
    pub checkpoint: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    version: u32,
    project: String,
    epoch: usize,
    created_unix: u64,
    model_state: Vec<u8>,
    optimizer_state: Vec<u8>,
    scheduler_state: Option<Vec<u8>>,
    payload_sha256: String,
}

pub struct CheckpointManager {
    project: String,
    interval: usize,
    pointer_path: PathBuf,
    run_dir: PathBuf,
    max_keep: Option<usize>,
}

impl CheckpointManager {
    pub fn new(
        project: impl Into<String>,
        interval: usize,
        pointer_path: PathBuf,
        run_dir: PathBuf,
        max_keep: Option<usize>,
    ) -> Self {
        Self {
            project: project.into(),
            interval,
            pointer_path,
            run_dir,
            max_keep,
        }
    }

    /// Names a fresh per-run directory under the configured checkpoint
    /// root. The directory is only created once a record is written.
    pub fn from_config(config: &RunConfig) -> Self {
        let stamp = chrono::Local::now().format("%b-%d-%Y-%H-%M-%S").to_string();
        Self::new(
            config.project_name.clone(),
            config.checkpoint_interval,
            config.pointer_path(),
            config.checkpoint_dir().join(stamp),
            config.max_keep,
        )
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn pointer_path(&self) -> &Path {
        &self.pointer_path
    }

    /// Records `state` if its epoch falls on the checkpoint interval,
    /// updates the resume pointer, prunes old records, and flushes the
    /// sink so plots never get ahead of restorable state.
    ///
    /// Off-interval epochs return `Ok(None)` without touching disk.
    pub fn save(&self, state: &TrainingState, sink: &mut ScalarSink) -> Result<Option<PathBuf>> {
        if self.interval == 0 || state.epoch % self.interval != 0 {
            return Ok(None);
        }

        fs::create_dir_all(&self.run_dir).map_err(|err| {
            TrainError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.run_dir.display()
            ))
        })?;

        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            project: self.project.clone(),
            epoch: state.epoch,
            created_unix: unix_timestamp(),
            model_state: state.model.clone(),
            optimizer_state: state.optimizer.clone(),
            scheduler_state: state.scheduler.clone(),
            payload_sha256: payload_digest(state),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|err| TrainError::runtime(format!("failed to encode checkpoint: {err}")))?;

        let path = self.record_path(state.epoch);
        write_atomic(&path, &bytes)?;

        let pointer = format!("{}\n{}", path.display(), sink.log_dir().display());
        write_atomic(&self.pointer_path, pointer.as_bytes())?;

        if let Some(limit) = self.max_keep {
            self.prune(limit)?;
        }

        sink.flush()?;
        tracing::info!("saved checkpoint for epoch {} at {}", state.epoch, path.display());
        Ok(Some(path))
    }

    /// Resolves the resume pointer. Absent pointer means no run has
    /// checkpointed yet; an unreadable one is reported as corrupt.
    pub fn latest(&self) -> Result<Option<ResumeTarget>> {
        let contents = match fs::read_to_string(&self.pointer_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match parse_pointer(&contents) {
            Some(target) => Ok(Some(target)),
            None => Err(TrainError::corrupt(
                &self.pointer_path,
                "malformed resume pointer",
            )),
        }
    }

    fn record_path(&self, epoch: usize) -> PathBuf {
        self.run_dir
            .join(format!("{}_checkpoint_{}{}", self.project, epoch, RECORD_SUFFIX))
    }

    fn prune(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Ok(());
        }
        let mut records = self.record_entries()?;
        records.sort_by_key(|(epoch, _)| *epoch);
        while records.len() > limit {
            let (_, victim) = records.remove(0);
            fs::remove_file(&victim).map_err(|err| {
                TrainError::runtime(format!(
                    "failed to prune checkpoint {}: {err}",
                    victim.display()
                ))
            })?;
        }
        Ok(())
    }

    fn record_entries(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut records = Vec::new();
        if !self.run_dir.exists() {
            return Ok(records);
        }
        let prefix = format!("{}_checkpoint_", self.project);
        let entries = fs::read_dir(&self.run_dir).map_err(|err| {
            TrainError::runtime(format!(
                "failed to read checkpoint directory {}: {err}",
                self.run_dir.display()
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                TrainError::runtime(format!("failed to read checkpoint entry: {err}"))
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(epoch_text) = rest.strip_suffix(RECORD_SUFFIX) else {
                continue;
            };
            if let Ok(epoch) = epoch_text.parse::<usize>() {
                records.push((epoch, entry.path()));
            }
        }
        Ok(records)
    }
}

/// Reads a record back, verifying the version and payload checksum.
/// Returns the state and the epoch the resumed run should start at.
pub fn load_checkpoint(path: &Path) -> Result<(TrainingState, usize)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(TrainError::not_found(path));
        }
        Err(err) => return Err(err.into()),
    };

    let record: CheckpointRecord = bincode::deserialize(&bytes)
        .map_err(|err| TrainError::corrupt(path, format!("undecodable record: {err}")))?;

    if record.version != CHECKPOINT_VERSION {
        return Err(TrainError::corrupt(
            path,
            format!(
                "unsupported version {} (expected {})",
                record.version, CHECKPOINT_VERSION
            ),
        ));
    }

    let state = TrainingState {
        epoch: record.epoch,
        model: record.model_state,
        optimizer: record.optimizer_state,
        scheduler: record.scheduler_state,
    };
    if payload_digest(&state) != record.payload_sha256 {
        return Err(TrainError::corrupt(
            path,
            "payload failed checksum validation",
        ));
    }

    let start_epoch = state.epoch + 1;
    Ok((state, start_epoch))
}

fn payload_digest(state: &TrainingState) -> String {
    let mut hasher = Sha256::new();
    hasher.update((state.epoch as u64).to_le_bytes());
    hasher.update(&state.model);
    hasher.update(&state.optimizer);
    if let Some(scheduler) = &state.scheduler {
        hasher.update(scheduler);
    }
    hex_encode(hasher.finalize())
}

fn parse_pointer(contents: &str) -> Option<ResumeTarget> {
    let mut lines = contents.lines();
    let checkpoint = lines.next()?.trim();
    let log_dir = lines.next()?.trim();
    if checkpoint.is_empty() || log_dir.is_empty() {
        return None;
    }
    Some(ResumeTarget {
        checkpoint: PathBuf::from(checkpoint),
        log_dir: PathBuf::from(log_dir),
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .map_err(|err| TrainError::runtime(format!("failed to write {}: {err}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|err| {
        TrainError::runtime(format!(
            "failed to move {} into place: {err}",
            tmp.display()
        ))
    })?;
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
