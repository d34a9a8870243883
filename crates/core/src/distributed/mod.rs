//! Multi-process setup for data-parallel runs.
//!
//! - [`DistributedConfig`] - rank, world size and device, resolved from a
//!   [`LaunchEnv`] snapshot or a GPU list
//! - [`ProcessGroup`] - membership and a barrier
//!
//! # Architecture
//!
//! - Single process: [`LocalProcessGroup`], every collective is a no-op
//! - Multi process: [`TcpProcessGroup`], a star over `std::net` sockets
//!   rooted at rank 0
//!
//! # Usage
//!
//! ```ignore
//! use vit_tune_core::distributed::{ProcessGroup, LocalProcessGroup};
//!
//! let pg = LocalProcessGroup::new();
//! assert_eq!(pg.world_size(), 1);
//! ```

mod error;
mod launcher;
mod process_group;
mod tcp;

pub use error::{DistributedError, Result};
pub use launcher::{
    init_process_group, parse_gpu_list, Backend, DistributedConfig, Endpoint, LaunchEnv,
    DEFAULT_MASTER_ADDR, DEFAULT_MASTER_PORT, DEFAULT_TIMEOUT, ENV_LOCAL_RANK, ENV_MASTER_ADDR,
    ENV_MASTER_PORT, ENV_RANK, ENV_WORLD_SIZE,
};
pub use process_group::{LocalProcessGroup, ProcessGroup};
pub use tcp::TcpProcessGroup;
