//! Stdout lines and TensorBoard event files for training and evaluation.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    DistillError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl From<&LoggingConfig> for LoggingSettings {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, DistillError> {
        let tensorboard = settings
            .tensorboard_dir
            .as_deref()
            .map(|dir| TensorBoardWriter::create(dir, settings.tensorboard_flush_every_n))
            .transpose()?;
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, snapshot: &StepSnapshot) {
        let terms = &snapshot.terms;
        if self.settings.enable_stdout {
            println!(
                "train step={} loss={:.5} kl={:.5} probs={:.5} scores={:.5} context={:.5} tok/s={:.1} grad_norm={:.3} lr={:.3e}",
                step,
                snapshot.step_loss,
                terms.kl,
                terms.probs_mse,
                terms.scores_mse,
                terms.context_mse,
                snapshot.tokens_per_sec,
                snapshot.grad_norm,
                lr
            );
        }

        self.write_scalars(
            step,
            &[
                ("train/loss", snapshot.step_loss),
                ("train/loss_ema", snapshot.loss),
                ("train/kl", terms.kl as f64),
                ("train/probs_mse", terms.probs_mse as f64),
                ("train/scores_mse", terms.scores_mse as f64),
                ("train/context_mse", terms.context_mse as f64),
                ("train/tokens_per_sec", snapshot.tokens_per_sec),
                ("train/grad_norm", snapshot.grad_norm),
                ("train/learning_rate", lr),
            ],
        );
    }

    pub fn log_skipped_step(&mut self, step: usize, loss_scale: f32, skipped: u64) {
        if self.settings.enable_stdout {
            println!(
                "train step={} skipped=non-finite-gradients loss_scale={} total_skipped={}",
                step, loss_scale, skipped
            );
        }
        self.write_scalars(step, &[("train/loss_scale", loss_scale as f64)]);
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            println!(
                "eval step={} context_mse={:.5} probs_mse={:.6} batches={} tokens={}",
                step, summary.context_mse, summary.probs_mse, summary.batches, summary.tokens
            );
        }
        self.write_scalars(
            step,
            &[
                ("eval/context_mse", summary.context_mse),
                ("eval/probs_mse", summary.probs_mse),
            ],
        );
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }

    fn write_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (tag, value) in scalars {
            if let Err(err) = writer.write_scalar(tag, step as i64, *value) {
                log::warn!("dropping tensorboard scalar {tag}: {err}");
                return;
            }
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, DistillError> {
        fs::create_dir_all(dir).map_err(|err| {
            DistillError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            unix_time().as_secs(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            DistillError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), DistillError> {
        let event = Event {
            wall_time: unix_time().as_secs_f64(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        let record = encode_record(&event)?;
        self.writer.write_all(&record).map_err(|err| {
            DistillError::runtime(format!("failed to write tensorboard event: {err}"))
        })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DistillError> {
        self.writer.flush().map_err(|err| {
            DistillError::runtime(format!("failed to flush tensorboard file: {err}"))
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

/// TFRecord framing: length, masked crc of the length, payload, masked crc of the payload.
fn encode_record(event: &Event) -> Result<Vec<u8>, DistillError> {
    let mut payload = BytesMut::with_capacity(event.encoded_len());
    event.encode(&mut payload).map_err(|err| {
        DistillError::runtime(format!("failed to encode tensorboard event: {err}"))
    })?;

    let len_bytes = (payload.len() as u64).to_le_bytes();
    let mut record = Vec::with_capacity(payload.len() + 16);
    record.extend_from_slice(&len_bytes);
    record.extend_from_slice(&masked_crc32(&len_bytes).to_le_bytes());
    record.extend_from_slice(&payload);
    record.extend_from_slice(&masked_crc32(&payload).to_le_bytes());
    Ok(record)
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_time() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
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
