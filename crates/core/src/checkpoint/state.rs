//! Named parameter maps and the traits that produce and consume them.

use std::collections::HashMap;

use candle_core::Tensor;
use thiserror::Error;

/// Parameter name to tensor, as stored in a checkpoint file.
pub type StateDict = HashMap<String, Tensor>;

/// Prefix left behind by data-parallel wrappers.
pub const MODULE_PREFIX: &str = "module.";

/// Strip a leading `module.` from every key.
///
/// Keys without the prefix pass through unchanged.
pub fn strip_module_prefix(state: StateDict) -> StateDict {
    state
        .into_iter()
        .map(|(key, value)| {
            let key = key
                .strip_prefix(MODULE_PREFIX)
                .map(str::to_string)
                .unwrap_or(key);
            (key, value)
        })
        .collect()
}

/// Split a flat map into the entries under `prefix.`, with the prefix removed.
pub(crate) fn take_section(state: &StateDict, prefix: &str) -> StateDict {
    let prefix = format!("{prefix}.");
    state
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|rest| (rest.to_string(), value.clone()))
        })
        .collect()
}

/// A model whose parameters can be exported and overwritten by name.
pub trait ParamStore {
    /// Snapshot of every parameter. Later loads do not alter the snapshot.
    fn state_dict(&self) -> candle_core::Result<StateDict>;

    /// Copy matching tensors into the model's parameters.
    ///
    /// With `strict`, any missing, unexpected or shape-mismatched key fails
    /// the whole load before anything is written. Otherwise those keys are
    /// only reported and the model keeps its current values for them.
    fn load_state_dict(&self, params: &StateDict, strict: bool)
        -> Result<LoadReport, StateDictError>;
}

/// Anything whose state round-trips through a [`StateDict`]: optimizers,
/// LR schedulers, loss scalers.
pub trait Stateful {
    fn state_dict(&self) -> candle_core::Result<StateDict>;

    fn load_state_dict(&mut self, state: &StateDict) -> candle_core::Result<()>;
}

/// Outcome of loading a [`StateDict`] into a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Present in the model, absent from the source.
    pub missing_keys: Vec<String>,
    /// Present in the source, unknown to the model.
    pub unexpected_keys: Vec<String>,
    /// Present in both with different shapes; the model value was kept.
    pub mismatched_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty()
            && self.unexpected_keys.is_empty()
            && self.mismatched_keys.is_empty()
    }

    /// Reject the load unless every key lined up.
    pub fn into_strict(self) -> Result<Self, StateDictError> {
        if self.is_clean() {
            return Ok(self);
        }
        Err(StateDictError::Strict {
            missing: self.missing_keys,
            unexpected: self.unexpected_keys,
            mismatched: self.mismatched_keys,
        })
    }

    pub(crate) fn sort(&mut self) {
        self.missing_keys.sort();
        self.unexpected_keys.sort();
        self.mismatched_keys.sort();
    }
}

/// Errors raised while applying a [`StateDict`] to a model.
#[derive(Debug, Error)]
pub enum StateDictError {
    /// A strict load found keys that do not line up with the model.
    #[error("strict load rejected: missing {missing:?}, unexpected {unexpected:?}, mismatched {mismatched:?}")]
    Strict {
        missing: Vec<String>,
        unexpected: Vec<String>,
        mismatched: Vec<String>,
    },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}
