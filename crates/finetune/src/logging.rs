use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::Serialize;

use crate::{config::TrackingConfig, distributed::ProcessContext, TrainingError};

pub const SAMPLES_FILENAME: &str = "samples.jsonl";

/// One generated sample logged during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRecord {
    pub step: usize,
    pub prompt: String,
    pub sample: String,
}

/// Destination for scalar metrics and sample tables. Only the coordinator logs.
pub trait TrackingSink: Send {
    fn log_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: usize,
    ) -> Result<(), TrainingError>;

    fn log_samples(&mut self, samples: &[SampleRecord]) -> Result<(), TrainingError>;

    fn flush(&mut self) -> Result<(), TrainingError>;
}

/// Discards everything; used when tracking is disabled and on non-coordinator workers.
#[derive(Debug, Default)]
pub struct NullSink;

impl TrackingSink for NullSink {
    fn log_metrics(&mut self, _: &BTreeMap<String, f64>, _: usize) -> Result<(), TrainingError> {
        Ok(())
    }

    fn log_samples(&mut self, _: &[SampleRecord]) -> Result<(), TrainingError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        Ok(())
    }
}

pub fn build_sink(
    config: &TrackingConfig,
    run_dir: &Path,
    ctx: &ProcessContext,
) -> Result<Box<dyn TrackingSink>, TrainingError> {
    if !config.enabled || !ctx.is_coordinator() {
        return Ok(Box::new(NullSink));
    }
    let tensorboard_dir = config
        .tensorboard_dir
        .clone()
        .unwrap_or_else(|| run_dir.join("tensorboard"));
    Ok(Box::new(TensorBoardSink::create(
        &tensorboard_dir,
        run_dir.join(SAMPLES_FILENAME),
        config.flush_every_n,
    )?))
}

/// Scalars go to a TensorBoard event file, sample tables to a JSON lines file.
pub struct TensorBoardSink {
    events: TensorBoardWriter,
    samples_path: PathBuf,
    samples: Option<BufWriter<File>>,
}

impl TensorBoardSink {
    pub fn create(
        tensorboard_dir: &Path,
        samples_path: PathBuf,
        flush_every: usize,
    ) -> Result<Self, TrainingError> {
        Ok(Self {
            events: TensorBoardWriter::create(tensorboard_dir, flush_every)?,
            samples_path,
            samples: None,
        })
    }

    fn samples_writer(&mut self) -> Result<&mut BufWriter<File>, TrainingError> {
        if self.samples.is_none() {
            if let Some(parent) = self.samples_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.samples_path)
                .map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to open samples file {}: {err}",
                        self.samples_path.display()
                    ))
                })?;
            self.samples = Some(BufWriter::new(file));
        }
        self.samples
            .as_mut()
            .ok_or_else(|| TrainingError::runtime("samples writer unavailable"))
    }
}

impl TrackingSink for TensorBoardSink {
    fn log_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: usize,
    ) -> Result<(), TrainingError> {
        let step = step as i64;
        for (tag, value) in metrics {
            self.events.write_scalar(tag, step, *value)?;
        }
        Ok(())
    }

    fn log_samples(&mut self, samples: &[SampleRecord]) -> Result<(), TrainingError> {
        let writer = self.samples_writer()?;
        for record in samples {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.events.flush()?;
        if let Some(samples) = self.samples.as_mut() {
            samples.flush()?;
        }
        Ok(())
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
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
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
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
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn read_records(path: &Path) -> Vec<Vec<u8>> {
        let bytes = fs::read(path).unwrap();
        let mut records = Vec::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let len = u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap()) as usize;
            let len_crc = u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&bytes[offset..offset + 8]));
            let data = &bytes[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                bytes[offset + 12 + len..offset + 16 + len]
                    .try_into()
                    .unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(data));
            records.push(data.to_vec());
            offset += 16 + len;
        }
        records
    }

    #[test]
    fn scalars_are_framed_event_records() {
        let dir = tempdir().unwrap();
        let tb_dir = dir.path().join("tb");
        let mut sink =
            TensorBoardSink::create(&tb_dir, dir.path().join(SAMPLES_FILENAME), 1).unwrap();
        let metrics = BTreeMap::from([
            ("loss/train".to_string(), 2.5),
            ("counters/examples".to_string(), 64.0),
        ]);
        sink.log_metrics(&metrics, 64).unwrap();
        sink.flush().unwrap();

        let file = fs::read_dir(&tb_dir).unwrap().next().unwrap().unwrap().path();
        let records = read_records(&file);
        assert_eq!(records.len(), 3);

        let header = Event::decode(records[0].as_slice()).unwrap();
        assert_eq!(header.file_version.as_deref(), Some("brain.Event:2"));

        let event = Event::decode(records[2].as_slice()).unwrap();
        assert_eq!(event.step, 64);
        let value = &event.summary.unwrap().value[0];
        assert_eq!(value.tag, "loss/train");
        assert_eq!(value.simple_value, Some(2.5));
    }

    #[test]
    fn samples_append_as_json_lines() {
        let dir = tempdir().unwrap();
        let samples_path = dir.path().join(SAMPLES_FILENAME);
        let mut sink =
            TensorBoardSink::create(&dir.path().join("tb"), samples_path.clone(), 1).unwrap();
        let record = SampleRecord {
            step: 0,
            prompt: "hello".to_string(),
            sample: "world".to_string(),
        };
        sink.log_samples(&[record.clone()]).unwrap();
        sink.log_samples(&[record]).unwrap();

        let contents = fs::read_to_string(samples_path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["prompt"], "hello");
        assert_eq!(parsed["step"], 0);
    }

    #[test]
    fn disabled_tracking_builds_null_sink() {
        let dir = tempdir().unwrap();
        let ctx = ProcessContext::solo(0);
        let mut sink = build_sink(&TrackingConfig::default(), dir.path(), &ctx).unwrap();
        sink.log_metrics(&BTreeMap::new(), 0).unwrap();
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
