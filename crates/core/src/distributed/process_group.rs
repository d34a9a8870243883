//! Process group abstractions for data-parallel runs.
//!
//! A process group represents the set of processes launched for one job.
//! Each process drives one device.

use super::error::Result;

/// Abstraction over process groups.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Local rank on this node; also the device ordinal.
    fn local_rank(&self) -> usize;

    /// Block until every process in the group has reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Process group for a single-process run.
///
/// World size is 1 and the barrier returns immediately.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessGroup {
    local_rank: usize,
}

impl LocalProcessGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single process pinned to a specific device ordinal.
    pub fn on_device(local_rank: usize) -> Self {
        Self { local_rank }
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_pg_defaults() {
        let pg = LocalProcessGroup::new();
        assert_eq!(pg.rank(), 0);
        assert_eq!(pg.world_size(), 1);
        assert_eq!(pg.local_rank(), 0);
        assert!(pg.is_coordinator());
        assert!(pg.is_single());
    }

    #[test]
    fn local_pg_on_device() {
        let pg = LocalProcessGroup::on_device(3);
        assert_eq!(pg.local_rank(), 3);
        assert_eq!(pg.rank(), 0);
    }

    #[test]
    fn local_barrier_is_noop() {
        let pg = LocalProcessGroup::new();
        pg.barrier().unwrap();
        pg.barrier().unwrap();
    }

    #[test]
    fn trait_object_works() {
        let pg: Box<dyn ProcessGroup> = Box::new(LocalProcessGroup::new());
        assert!(pg.is_single());
    }
}
