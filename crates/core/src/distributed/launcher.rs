//! Launch configuration and process-group initialisation.
//!
//! # Environment Variables
//!
//! The standard distributed launch variables are read once into a
//! [`LaunchEnv`]:
//! - `RANK`: Global rank of this process (0..WORLD_SIZE)
//! - `WORLD_SIZE`: Total number of processes
//! - `LOCAL_RANK`: Local rank on this node, used as the device ordinal
//! - `MASTER_ADDR`: Address of rank 0 for coordination (default: 127.0.0.1)
//! - `MASTER_PORT`: Port for coordination (default: 29500)
//!
//! # Usage
//!
//! ```ignore
//! use vit_tune_core::distributed::{init_process_group, DistributedConfig, LaunchEnv};
//!
//! let config = DistributedConfig::resolve(&LaunchEnv::from_env(), args.gpus.as_deref())?;
//! let pg = init_process_group(&config)?;
//! pg.barrier()?;
//! ```

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::{DistributedError, Result};
use super::process_group::{LocalProcessGroup, ProcessGroup};
use super::tcp::TcpProcessGroup;

pub const ENV_RANK: &str = "RANK";
pub const ENV_WORLD_SIZE: &str = "WORLD_SIZE";
pub const ENV_LOCAL_RANK: &str = "LOCAL_RANK";
pub const ENV_MASTER_ADDR: &str = "MASTER_ADDR";
pub const ENV_MASTER_PORT: &str = "MASTER_PORT";

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Rendezvous and collective timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Raw launch variables, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    pub rank: Option<String>,
    pub world_size: Option<String>,
    pub local_rank: Option<String>,
    pub master_addr: Option<String>,
    pub master_port: Option<String>,
}

impl LaunchEnv {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self {
            rank: env::var(ENV_RANK).ok(),
            world_size: env::var(ENV_WORLD_SIZE).ok(),
            local_rank: env::var(ENV_LOCAL_RANK).ok(),
            master_addr: env::var(ENV_MASTER_ADDR).ok(),
            master_port: env::var(ENV_MASTER_PORT).ok(),
        }
    }

    /// Build from `(name, value)` pairs; unknown names are ignored.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut launch = Self::default();
        for (name, value) in pairs {
            let slot = match name {
                ENV_RANK => &mut launch.rank,
                ENV_WORLD_SIZE => &mut launch.world_size,
                ENV_LOCAL_RANK => &mut launch.local_rank,
                ENV_MASTER_ADDR => &mut launch.master_addr,
                ENV_MASTER_PORT => &mut launch.master_port,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        launch
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DistributedError::Config(format!("{name}={value:?} is not a valid number")))
}

fn require_var<T: FromStr>(name: &str, value: Option<&String>) -> Result<T> {
    match value {
        Some(v) => parse_var(name, v),
        None => Err(DistributedError::Config(format!(
            "{name} must be set when {ENV_WORLD_SIZE} > 1"
        ))),
    }
}

/// Parse a comma-separated GPU list such as `"0,1,2"`.
pub fn parse_gpu_list(gpus: &str) -> Result<Vec<usize>> {
    gpus.split(',')
        .map(|id| {
            id.trim()
                .parse()
                .map_err(|_| DistributedError::Config(format!("invalid GPU id {id:?} in {gpus:?}")))
        })
        .collect()
}

/// Collective communication backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    /// Plain TCP sockets; always available.
    #[default]
    Tcp,
    Nccl,
}

impl FromStr for Backend {
    type Err = DistributedError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "gloo" => Ok(Self::Tcp),
            "nccl" => Ok(Self::Nccl),
            other => Err(DistributedError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Nccl => f.write_str("nccl"),
        }
    }
}

/// Where rank 0 can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Endpoint {
    /// `env://`: use `MASTER_ADDR` / `MASTER_PORT`.
    #[default]
    Env,
    /// `tcp://host:port`
    Tcp { host: String, port: u16 },
}

impl FromStr for Endpoint {
    type Err = DistributedError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "env://" {
            return Ok(Self::Env);
        }
        let invalid = || DistributedError::InvalidEndpoint(s.to_string());
        let addr = s.strip_prefix("tcp://").ok_or_else(invalid)?;
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Tcp {
            host: host.to_string(),
            port: port.parse().map_err(|_| invalid())?,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env => f.write_str("env://"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Resolved distributed configuration for this process.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedConfig {
    /// Global rank of this process.
    pub rank: usize,
    /// Total number of processes.
    pub world_size: usize,
    /// Local rank on this node; the device ordinal.
    pub local_rank: usize,
    /// Whether a process group must be joined.
    pub distributed: bool,
    /// GPU ids to expose to workers when this process launches them.
    pub visible_devices: Option<Vec<usize>>,
    pub backend: Backend,
    pub endpoint: Endpoint,
    /// Master address for `env://`.
    pub master_addr: String,
    /// Master port for `env://`.
    pub master_port: u16,
    pub timeout: Duration,
}

impl DistributedConfig {
    /// Single-process configuration on device 0.
    pub fn single_process() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            distributed: false,
            visible_devices: None,
            backend: Backend::default(),
            endpoint: Endpoint::default(),
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Decide rank, world size and device from the launch environment,
    /// falling back to an explicit GPU list.
    pub fn resolve(launch: &LaunchEnv, gpus: Option<&str>) -> Result<Self> {
        let mut config = Self::single_process();
        if let Some(addr) = &launch.master_addr {
            config.master_addr = addr.clone();
        }
        if let Some(port) = &launch.master_port {
            config.master_port = parse_var(ENV_MASTER_PORT, port)?;
        }

        if let Some(world_size) = &launch.world_size {
            let world_size: usize = parse_var(ENV_WORLD_SIZE, world_size)?;
            if world_size == 0 {
                return Err(DistributedError::Config(format!(
                    "{ENV_WORLD_SIZE} must be at least 1"
                )));
            }
            config.world_size = world_size;
            if world_size > 1 {
                let rank = require_var(ENV_RANK, launch.rank.as_ref())?;
                if rank >= world_size {
                    return Err(DistributedError::InvalidRank { rank, world_size });
                }
                config.rank = rank;
                config.local_rank = require_var(ENV_LOCAL_RANK, launch.local_rank.as_ref())?;
                config.distributed = true;
            }
        } else if let Some(gpus) = gpus {
            let ids = parse_gpu_list(gpus)?;
            if ids.len() > 1 {
                config.world_size = ids.len();
                config.distributed = true;
                config.visible_devices = Some(ids);
            } else if let Some(&id) = ids.first() {
                config.local_rank = id;
            }
        }

        Ok(config)
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether this process must start the workers itself: a multi-GPU
    /// list was given and no launcher set `WORLD_SIZE`.
    pub fn needs_spawn(&self) -> bool {
        self.distributed && self.visible_devices.is_some()
    }

    /// Host and port rank 0 listens on.
    pub fn rendezvous_addr(&self) -> (String, u16) {
        match &self.endpoint {
            Endpoint::Env => (self.master_addr.clone(), self.master_port),
            Endpoint::Tcp { host, port } => (host.clone(), *port),
        }
    }
}

/// Join the process group described by `config`.
///
/// Non-distributed runs get a [`LocalProcessGroup`]. Distributed runs
/// rendezvous with their peers and pass one barrier before returning.
pub fn init_process_group(config: &DistributedConfig) -> Result<Box<dyn ProcessGroup>> {
    if !config.distributed {
        tracing::info!(device = config.local_rank, "Not using distributed mode");
        return Ok(Box::new(LocalProcessGroup::on_device(config.local_rank)));
    }

    match config.backend {
        Backend::Tcp => {}
        Backend::Nccl => return Err(DistributedError::BackendUnavailable(Backend::Nccl.to_string())),
    }

    let (host, port) = config.rendezvous_addr();
    tracing::info!(
        rank = config.rank,
        world_size = config.world_size,
        local_rank = config.local_rank,
        backend = %config.backend,
        endpoint = %config.endpoint,
        "Initializing process group"
    );
    let pg = TcpProcessGroup::init(
        &host,
        port,
        config.world_size,
        config.rank,
        config.local_rank,
        config.timeout,
    )?;
    Ok(Box::new(pg))
}
