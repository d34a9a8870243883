//! Error types for distributed setup.

use thiserror::Error;

/// Errors that can occur while resolving or joining a process group.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Launch environment or GPU list could not be turned into a config.
    #[error("invalid distributed configuration: {0}")]
    Config(String),

    /// Init method is neither `env://` nor `tcp://host:port`.
    #[error("invalid endpoint {0:?}: expected env:// or tcp://host:port")]
    InvalidEndpoint(String),

    /// Backend name parsed, but it is not compiled into this build.
    #[error("backend {0} is not available in this build")]
    BackendUnavailable(String),

    /// Peers disagreed during rendezvous.
    #[error("rendezvous failed: {0}")]
    Rendezvous(String),

    /// Communication timeout.
    #[error("communication timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
