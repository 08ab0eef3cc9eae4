//! Scalar visualization sink writing the TensorBoard event-file format.
//!
//! Samples are buffered in memory and only hit disk on `flush`, which the
//! executor calls when a checkpoint is recorded. A crash between
//! checkpoints therefore loses the buffered samples along with the epoch
//! they belong to, keeping plots and restorable state in agreement.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::error::{Result, TrainError};

/// A buffered scalar observation.
#[derive(Debug, Clone)]
struct MetricSample {
    tag: String,
    value: f64,
    step: i64,
}

pub struct ScalarSink {
    log_dir: PathBuf,
    pending: Vec<MetricSample>,
    writer: TensorBoardWriter,
}

impl ScalarSink {
    /// Starts a fresh run directory named after the current local time
    /// under `base_dir` and opens an event file inside it.
    pub fn create(base_dir: &Path) -> Result<Self> {
        let stamp = chrono::Local::now().format("%b-%d-%Y-%H-%M-%S").to_string();
        let log_dir = base_dir.join(stamp);
        let writer = TensorBoardWriter::create(&log_dir)?;
        Ok(Self {
            log_dir,
            pending: Vec::new(),
            writer,
        })
    }

    /// Reopens an existing run directory, appending a new event file so a
    /// resumed run continues the same plots.
    pub fn open(log_dir: &Path) -> Result<Self> {
        let writer = TensorBoardWriter::create(log_dir)?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            pending: Vec::new(),
            writer,
        })
    }

    pub fn append(&mut self, tag: &str, value: f64, step: i64) {
        self.pending.push(MetricSample {
            tag: tag.to_string(),
            value,
            step,
        });
    }

    /// Writes all buffered samples in arrival order and clears the buffer.
    pub fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for sample in &pending {
            self.writer
                .write_scalar(&sample.tag, sample.step, sample.value)?;
        }
        self.writer.flush()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
}

impl TensorBoardWriter {
    fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainError::runtime(format!(
                "failed to create event directory {}: {err}",
                dir.display()
            ))
        })?;
        let hostname = hostname();
        let mut timestamp = current_unix_timestamp();
        let mut path = dir.join(format!("events.out.tfevents.{timestamp}.{hostname}"));
        // a resumed run in the same second must not clobber the previous file
        while path.exists() {
            timestamp += 1;
            path = dir.join(format!("events.out.tfevents.{timestamp}.{hostname}"));
        }
        let file = File::create(&path).map_err(|err| {
            TrainError::runtime(format!(
                "failed to create event file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<()> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<()> {
        let mut buffer = BytesMut::with_capacity(128);
        event
            .encode(&mut buffer)
            .map_err(|err| TrainError::runtime(format!("failed to encode event: {err}")))?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        let len_crc_bytes = len_crc.to_le_bytes();
        let data_crc_bytes = data_crc.to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| TrainError::runtime(format!("failed to write event: {err}")))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|err| TrainError::runtime(format!("failed to flush event file: {err}")))
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
