//! Checkpoint directories: model tensors, optimizer and scaler state, and a
//! manifest carrying sha256 digests of every file plus the config fingerprint.
//!
//! Directories are named `step_{optimizer_step}_global_{micro_batch}` with
//! zero-padded counters so lexical order is chronological.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors, Device, Tensor};
use hex::encode as hex_encode;
use perlin::PerlinAttention;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::to_runtime_error,
    optimizer::{DistillOptimizer, GradientScaler, GradientScalerState, OptimizerState},
    DistillConfig, DistillError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
/// Parameter and buffer names inside `model.safetensors` start with this scope.
pub const MODEL_SCOPE: &str = "perlin";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressSnapshot {
    pub optimizer_step: usize,
    /// Micro-batches consumed so far.
    pub global_step: usize,
    pub epoch: usize,
    pub micro_batches_per_step: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    /// Digest of the sections that shape tensors and data; must match on resume.
    pub compatibility_sha256: String,
    pub seed: u64,
    pub model: FileRecord,
    pub optimizer: FileRecord,
    pub scaler: FileRecord,
    pub progress: ProgressSnapshot,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a DistillConfig,
    pub model: &'a PerlinAttention,
    pub optimizer: &'a DistillOptimizer,
    pub scaler: &'a GradientScaler,
    pub progress: ProgressSnapshot,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scaler_state: GradientScalerState,
    pub model_weights_path: PathBuf,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, DistillError> {
    fs::create_dir_all(request.base_dir)
        .map_err(io_context("create checkpoint directory", request.base_dir))?;

    let checkpoint_dir = request.base_dir.join(format!(
        "step_{:012}_global_{:012}",
        request.progress.optimizer_step, request.progress.global_step
    ));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir)
            .map_err(io_context("replace checkpoint", &checkpoint_dir))?;
    }
    fs::create_dir(&checkpoint_dir).map_err(io_context("create checkpoint", &checkpoint_dir))?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;

    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        config_sha256: fingerprint(request.config)?,
        compatibility_sha256: compatibility_fingerprint(request.config)?,
        seed: request.config.runtime.seed,
        model: file_record(&model_path)?,
        optimizer: file_record(&optimizer_path)?,
        scaler: file_record(&scaler_path)?,
        progress: request.progress,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    prune_checkpoints(request.base_dir, request.max_keep)?;
    log::debug!("checkpoint written to {}", checkpoint_dir.display());

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, DistillError> {
    let Some(directory) = checkpoint_directories(base_dir)?.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&directory)?;
    Ok(Some(CheckpointDescriptor {
        directory,
        manifest,
    }))
}

/// Reads a checkpoint, verifying every digest. Fails when the model, attention,
/// data or precision settings differ from the ones the checkpoint was written with.
pub fn load_checkpoint(
    directory: &Path,
    config: &DistillConfig,
) -> Result<LoadOutcome, DistillError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(DistillError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    if manifest.compatibility_sha256 != compatibility_fingerprint(config)? {
        return Err(DistillError::runtime(format!(
            "checkpoint {} was written with incompatible model, perlin, data or precision settings",
            directory.display()
        )));
    }

    let model_weights_path = verified_path(directory, &manifest.model)?;
    let optimizer_state = read_json(&verified_path(directory, &manifest.optimizer)?)?;
    let scaler_state = read_json(&verified_path(directory, &manifest.scaler)?)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scaler_state,
        model_weights_path,
    })
}

/// Copies saved parameters into the module's variables and restores its buffers.
pub fn apply_model_weights(
    model: &PerlinAttention,
    weights_path: &Path,
    device: &Device,
) -> Result<(), DistillError> {
    let mut tensors: HashMap<String, Tensor> =
        safetensors::load(weights_path, device).map_err(to_runtime_error)?;

    for (name, var) in model.named_parameters(MODEL_SCOPE) {
        let tensor = tensors
            .remove(&name)
            .ok_or_else(|| DistillError::runtime(format!("checkpoint missing parameter {name}")))?;
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(to_runtime_error)?;
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    let mut unused = Vec::new();
    for (name, tensor) in tensors {
        if !model.load_buffer(MODEL_SCOPE, &name, &tensor)? {
            unused.push(name);
        }
    }
    if !unused.is_empty() {
        unused.sort();
        return Err(DistillError::runtime(format!(
            "checkpoint contains unused tensors: {}",
            unused.join(", ")
        )));
    }
    Ok(())
}

fn save_model_weights(model: &PerlinAttention, path: &Path) -> Result<(), DistillError> {
    let mut tensors: HashMap<String, Tensor> = model
        .named_parameters(MODEL_SCOPE)
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    tensors.extend(model.named_buffers(MODEL_SCOPE)?);
    safetensors::save(&tensors, path).map_err(|err| {
        DistillError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, DistillError> {
    let json = serde_json::to_vec(value)
        .map_err(|err| DistillError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn compatibility_fingerprint(config: &DistillConfig) -> Result<String, DistillError> {
    fingerprint(&(
        &config.model,
        &config.perlin,
        &config.data,
        config.runtime.precision,
        config.runtime.seed,
    ))
}

fn file_record(path: &Path) -> Result<FileRecord, DistillError> {
    let bytes = path
        .metadata()
        .map_err(io_context("stat", path))?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            DistillError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes,
    })
}

fn verified_path(directory: &Path, record: &FileRecord) -> Result<PathBuf, DistillError> {
    let path = directory.join(&record.filename);
    if sha256_file(&path)? != record.sha256 {
        return Err(DistillError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(path)
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, DistillError> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(base).map_err(io_context("read checkpoint directory", base))? {
        let entry = entry.map_err(io_context("read checkpoint entry in", base))?;
        let is_dir = entry
            .file_type()
            .map_err(io_context("inspect", &entry.path()))?
            .is_dir();
        if is_dir && entry.file_name().to_string_lossy().starts_with("step_") {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, DistillError> {
    let path = directory.join(MANIFEST_FILENAME);
    if !path.is_file() {
        return Err(DistillError::runtime(format!(
            "checkpoint manifest not found at {}",
            path.display()
        )));
    }
    read_json(&path)
}

fn sha256_file(path: &Path) -> Result<String, DistillError> {
    let mut file = File::open(path).map_err(io_context("open", path))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buffer).map_err(io_context("read", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DistillError> {
    let mut data = serde_json::to_vec_pretty(value)
        .map_err(|err| DistillError::runtime(format!("failed to serialize JSON: {err}")))?;
    data.push(b'\n');
    File::create(path)
        .and_then(|mut file| file.write_all(&data))
        .map_err(io_context("write", path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, DistillError> {
    let file = File::open(path).map_err(io_context("open", path))?;
    serde_json::from_reader(file).map_err(|err| {
        DistillError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), DistillError> {
    let Some(limit) = max_keep.filter(|&limit| limit > 0) else {
        return Ok(());
    };
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    let excess = dirs.len().saturating_sub(limit);
    for victim in dirs.into_iter().take(excess) {
        fs::remove_dir_all(&victim).map_err(io_context("prune checkpoint", &victim))?;
    }
    Ok(())
}

fn io_context<'a>(action: &'a str, path: &'a Path) -> impl FnOnce(io::Error) -> DistillError + 'a {
    move |err| DistillError::runtime(format!("failed to {action} {}: {err}", path.display()))
}
