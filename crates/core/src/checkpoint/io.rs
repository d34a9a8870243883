//! Training checkpoints on disk.
//!
//! A checkpoint is a single safetensors file. Tensors are namespaced by the
//! component they belong to (`model.`, `optimizer.`, `scheduler.`,
//! `scaler.`) and the epoch is stored as a one-element `epoch` tensor.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use super::state::{
    strip_module_prefix, take_section, LoadReport, ParamStore, StateDict, StateDictError,
    Stateful,
};

const EPOCH_KEY: &str = "epoch";
const MODEL: &str = "model";
const OPTIMIZER: &str = "optimizer";
const SCHEDULER: &str = "scheduler";
const SCALER: &str = "scaler";

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found at {0}")]
    NotFound(PathBuf),

    #[error("{0} is not a training checkpoint: no `epoch` entry")]
    MissingEpoch(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Load(#[from] StateDictError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Everything needed to resume training.
#[derive(Debug, Clone, Default)]
pub struct TrainingCheckpoint {
    pub epoch: u64,
    pub model: StateDict,
    pub optimizer: StateDict,
    pub scheduler: StateDict,
    pub scaler: StateDict,
}

impl TrainingCheckpoint {
    /// Capture the current state of all four components.
    pub fn capture(
        epoch: u64,
        model: &dyn ParamStore,
        optimizer: &dyn Stateful,
        scheduler: &dyn Stateful,
        scaler: &dyn Stateful,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            epoch,
            model: model.state_dict()?,
            optimizer: optimizer.state_dict()?,
            scheduler: scheduler.state_dict()?,
            scaler: scaler.state_dict()?,
        })
    }

    fn flatten(&self) -> candle_core::Result<HashMap<String, Tensor>> {
        let mut flat = HashMap::new();
        for (section, state) in [
            (MODEL, &self.model),
            (OPTIMIZER, &self.optimizer),
            (SCHEDULER, &self.scheduler),
            (SCALER, &self.scaler),
        ] {
            for (name, tensor) in state {
                flat.insert(format!("{section}.{name}"), tensor.clone());
            }
        }
        flat.insert(
            EPOCH_KEY.to_string(),
            Tensor::new(&[self.epoch as i64], &Device::Cpu)?,
        );
        Ok(flat)
    }
}

/// Sibling path for the best-so-far copy: `ckpt.safetensors` becomes
/// `ckpt.best.safetensors`.
pub fn best_checkpoint_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.best.{}", ext.to_string_lossy()),
        None => format!("{stem}.best"),
    };
    path.with_file_name(name)
}

/// Write `checkpoint` to `path`, and copy it to [`best_checkpoint_path`]
/// when `is_best`.
///
/// Returns the path of the best copy, if one was written.
pub fn save_checkpoint(
    checkpoint: &TrainingCheckpoint,
    is_best: bool,
    path: impl AsRef<Path>,
) -> Result<Option<PathBuf>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    candle_core::safetensors::save(&checkpoint.flatten()?, path)?;
    tracing::info!(path = %path.display(), epoch = checkpoint.epoch, "checkpoint saved");

    if !is_best {
        return Ok(None);
    }
    let best = best_checkpoint_path(path);
    fs::copy(path, &best)?;
    tracing::info!(path = %best.display(), "best checkpoint updated");
    Ok(Some(best))
}

fn read_flat(path: &Path) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(CheckpointError::NotFound(path.to_path_buf()));
    }
    Ok(candle_core::safetensors::load(path, &Device::Cpu)?)
}

fn read_epoch(flat: &HashMap<String, Tensor>, path: &Path) -> Result<u64> {
    let epoch = flat
        .get(EPOCH_KEY)
        .ok_or_else(|| CheckpointError::MissingEpoch(path.to_path_buf()))?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;
    epoch
        .first()
        .map(|&e| e.max(0) as u64)
        .ok_or_else(|| CheckpointError::MissingEpoch(path.to_path_buf()))
}

/// Read a full training checkpoint onto the CPU.
pub fn read_checkpoint(path: impl AsRef<Path>) -> Result<TrainingCheckpoint> {
    let path = path.as_ref();
    let flat = read_flat(path)?;
    Ok(TrainingCheckpoint {
        epoch: read_epoch(&flat, path)?,
        model: take_section(&flat, MODEL),
        optimizer: take_section(&flat, OPTIMIZER),
        scheduler: take_section(&flat, SCHEDULER),
        scaler: take_section(&flat, SCALER),
    })
}

/// Restore model, optimizer, scheduler and scaler from `path`.
///
/// The model load is strict. Returns the stored epoch.
pub fn load_checkpoint(
    model: &dyn ParamStore,
    optimizer: &mut dyn Stateful,
    scheduler: &mut dyn Stateful,
    scaler: &mut dyn Stateful,
    path: impl AsRef<Path>,
) -> Result<u64> {
    let path = path.as_ref();
    let checkpoint = read_checkpoint(path)?;

    model.load_state_dict(&checkpoint.model, true)?;
    optimizer.load_state_dict(&checkpoint.optimizer)?;
    scheduler.load_state_dict(&checkpoint.scheduler)?;
    scaler.load_state_dict(&checkpoint.scaler)?;

    tracing::info!(path = %path.display(), epoch = checkpoint.epoch, "resumed from checkpoint");
    Ok(checkpoint.epoch)
}

/// Read model weights from either a training checkpoint or a bare weights
/// file, with any `module.` prefix removed.
pub fn load_pretrained(path: impl AsRef<Path>) -> Result<StateDict> {
    let path = path.as_ref();
    let flat = read_flat(path)?;
    let model = take_section(&flat, MODEL);
    let state = if model.is_empty() {
        tracing::debug!(path = %path.display(), "no `model.` section, reading as bare weights");
        flat.into_iter().filter(|(k, _)| k != EPOCH_KEY).collect()
    } else {
        model
    };
    Ok(strip_module_prefix(state))
}

/// Load only the model weights from `path`, strictly.
pub fn load_model(model: &dyn ParamStore, path: impl AsRef<Path>) -> Result<LoadReport> {
    let state = load_pretrained(path)?;
    Ok(model.load_state_dict(&state, true)?)
}

/// Write a bare weights file (no sections, no epoch).
pub fn save_weights(state: &StateDict, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    candle_core::safetensors::save(state, path)?;
    Ok(())
}
