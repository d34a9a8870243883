//! Multi-process launcher for data-parallel benchmarking.
//!
//! When `--gpus 0,1,...` lists more than one device and no external launcher
//! set `WORLD_SIZE`, this process becomes rank 0 and spawns ranks
//! 1..N as re-executions of the same binary with the same arguments,
//! distinguished by the standard distributed environment variables.
//!
//! | Variable               | Set by launcher     |
//! |------------------------|---------------------|
//! | `RANK`                 | 1..N-1              |
//! | `WORLD_SIZE`           | N                   |
//! | `LOCAL_RANK`           | 1..N-1              |
//! | `MASTER_ADDR`          | rendezvous host     |
//! | `MASTER_PORT`          | rendezvous port     |
//! | `CUDA_VISIBLE_DEVICES` | the `--gpus` list   |

use std::process::{Child, Command};

use vit_tune_core::distributed::{
    DistributedConfig, ENV_LOCAL_RANK, ENV_MASTER_ADDR, ENV_MASTER_PORT, ENV_RANK, ENV_WORLD_SIZE,
};

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// `CUDA_VISIBLE_DEVICES` value for a GPU id list.
pub fn visible_devices_value(ids: &[usize]) -> String {
    ids.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Environment for worker `rank`.
///
/// Single node: `LOCAL_RANK == RANK`, which indexes into the visible
/// device list.
pub fn worker_env(config: &DistributedConfig, rank: usize) -> Vec<(&'static str, String)> {
    let (host, port) = config.rendezvous_addr();
    let mut env = vec![
        (ENV_RANK, rank.to_string()),
        (ENV_WORLD_SIZE, config.world_size.to_string()),
        (ENV_LOCAL_RANK, rank.to_string()),
        (ENV_MASTER_ADDR, host),
        (ENV_MASTER_PORT, port.to_string()),
    ];
    if let Some(ids) = &config.visible_devices {
        env.push((CUDA_VISIBLE_DEVICES, visible_devices_value(ids)));
    }
    env
}

/// Spawned worker processes.
///
/// Workers not reaped through [`Workers::wait`] are killed on drop, so an
/// early error on rank 0 does not leave them blocked in the rendezvous.
#[derive(Debug, Default)]
pub struct Workers {
    children: Vec<Child>,
}

impl Workers {
    pub fn new(children: Vec<Child>) -> Self {
        Self { children }
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Wait for every worker to exit; returns the number that failed.
    pub fn wait(mut self) -> usize {
        wait_for_workers(std::mem::take(&mut self.children))
    }

    /// Kill and reap workers still running. Returns how many were killed.
    pub fn kill_all(&mut self) -> usize {
        let mut killed = 0;
        for (i, mut child) in self.children.drain(..).enumerate() {
            if let Ok(Some(_)) = child.try_wait() {
                continue;
            }
            if let Err(e) = child.kill() {
                tracing::warn!(rank = i + 1, error = %e, "failed to kill worker");
            }
            let _ = child.wait();
            killed += 1;
        }
        killed
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        if !self.children.is_empty() {
            let killed = self.kill_all();
            tracing::warn!(killed, "terminated workers after rank 0 failed");
        }
    }
}

/// Spawn ranks `1..world_size`.
///
/// Also restricts this process to the visible device list so rank 0's
/// ordinal 0 is the first listed GPU. Call before any device is created.
pub fn spawn_workers(config: &DistributedConfig) -> anyhow::Result<Workers> {
    if config.world_size < 2 {
        anyhow::bail!("no workers to spawn for world_size={}", config.world_size);
    }

    if let Some(ids) = &config.visible_devices {
        std::env::set_var(CUDA_VISIBLE_DEVICES, visible_devices_value(ids));
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("failed to determine current executable: {e}"))?;
    let args: Vec<std::ffi::OsString> = std::env::args_os().skip(1).collect();

    let mut workers = Workers::new(Vec::with_capacity(config.world_size - 1));
    for rank in 1..config.world_size {
        tracing::info!(rank, world_size = config.world_size, "spawning worker");
        let child = Command::new(&current_exe)
            .args(&args)
            .envs(worker_env(config, rank))
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn worker rank {rank}: {e}"))?;
        workers.children.push(child);
    }

    tracing::info!(count = workers.len(), "all workers spawned");
    Ok(workers)
}

/// Wait for all worker processes to exit.
///
/// Returns the number of workers that failed; each failure is logged.
pub fn wait_for_workers(mut workers: Vec<Child>) -> usize {
    let mut failed = 0;
    for (i, child) in workers.iter_mut().enumerate() {
        match child.wait() {
            Ok(status) if status.success() => {
                tracing::debug!(rank = i + 1, "worker exited cleanly");
            }
            Ok(status) => {
                failed += 1;
                tracing::warn!(rank = i + 1, ?status, "worker exited with non-zero status");
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(rank = i + 1, error = %e, "error waiting for worker");
            }
        }
    }
    failed
}
