//! Process group over plain TCP sockets.
//!
//! Star topology: rank 0 listens, every other rank connects to it and
//! announces its rank. The barrier is a gather of one-byte tokens at rank 0
//! followed by a release message to every peer.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{DistributedError, Result};
use super::process_group::ProcessGroup;

const RETRY_DELAY: Duration = Duration::from_millis(100);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

const BARRIER_ARRIVE: u8 = 0xA1;
const BARRIER_RELEASE: u8 = 0xA2;

enum Links {
    /// Rank 0: one stream per peer, indexed by `rank - 1`.
    Coordinator(Vec<TcpStream>),
    /// Other ranks: the stream to rank 0.
    Worker(TcpStream),
}

pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    local_rank: usize,
    timeout: Duration,
    links: Links,
}

impl TcpProcessGroup {
    /// Rendezvous at `host:port` and pass one barrier.
    ///
    /// Rank 0 binds the port on all interfaces; the others retry the
    /// connection until `timeout` elapses.
    pub fn init(
        host: &str,
        port: u16,
        world_size: usize,
        rank: usize,
        local_rank: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(DistributedError::InvalidRank { rank, world_size });
        }

        let links = if rank == 0 {
            Links::Coordinator(accept_peers(port, world_size, timeout)?)
        } else {
            Links::Worker(connect_to_coordinator(host, port, rank, timeout)?)
        };

        let pg = Self {
            rank,
            world_size,
            local_rank,
            timeout,
            links,
        };
        pg.barrier()?;
        tracing::info!(rank, world_size, "Process group ready");
        Ok(pg)
    }

    fn io_error(&self, e: io::Error) -> DistributedError {
        stream_error(e, self.timeout)
    }

    fn expect_token(&self, mut stream: &TcpStream, token: u8) -> Result<()> {
        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).map_err(|e| self.io_error(e))?;
        if buf[0] != token {
            return Err(DistributedError::Rendezvous(format!(
                "unexpected barrier token {:#x}",
                buf[0]
            )));
        }
        Ok(())
    }
}

fn timeout_error(timeout: Duration) -> DistributedError {
    DistributedError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    }
}

/// A read or write that hit the socket timeout is a rendezvous timeout.
fn stream_error(e: io::Error, timeout: Duration) -> DistributedError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => timeout_error(timeout),
        _ => DistributedError::Io(e),
    }
}

fn configure(stream: &TcpStream, timeout: Duration) -> Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(())
}

fn accept_peers(port: u16, world_size: usize, timeout: Duration) -> Result<Vec<TcpStream>> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    tracing::debug!(port, peers = world_size - 1, "Rank 0 waiting for peers");

    let deadline = Instant::now() + timeout;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut connected = 0;

    while connected < world_size - 1 {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                stream.set_nonblocking(false)?;
                configure(&stream, timeout)?;

                let mut buf = [0u8; 8];
                stream
                    .read_exact(&mut buf)
                    .map_err(|e| stream_error(e, timeout))?;
                let peer_rank = u64::from_le_bytes(buf) as usize;
                let slot = peer_rank
                    .checked_sub(1)
                    .and_then(|i| slots.get_mut(i))
                    .ok_or(DistributedError::InvalidRank {
                        rank: peer_rank,
                        world_size,
                    })?;
                if slot.is_some() {
                    return Err(DistributedError::Rendezvous(format!(
                        "rank {peer_rank} joined twice"
                    )));
                }
                tracing::trace!(peer = %peer, rank = peer_rank, "Peer joined");
                *slot = Some(stream);
                connected += 1;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(timeout_error(timeout));
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(slots.into_iter().flatten().collect())
}

fn connect_to_coordinator(
    host: &str,
    port: u16,
    rank: usize,
    timeout: Duration,
) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;
    loop {
        match TcpStream::connect((host, port)) {
            Ok(mut stream) => {
                configure(&stream, timeout)?;
                stream
                    .write_all(&(rank as u64).to_le_bytes())
                    .map_err(|e| stream_error(e, timeout))?;
                tracing::trace!(host, port, rank, "Connected to rank 0");
                return Ok(stream);
            }
            Err(e) if Instant::now() < deadline => {
                tracing::trace!(
                    attempt = attempt,
                    host,
                    port,
                    error = %e,
                    "Retrying connection to rank 0"
                );
                attempt += 1;
                thread::sleep(RETRY_DELAY);
            }
            Err(e) => {
                tracing::warn!(host, port, attempts = attempt + 1, error = %e, "Rendezvous failed");
                return Err(timeout_error(timeout));
            }
        }
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn barrier(&self) -> Result<()> {
        match &self.links {
            Links::Coordinator(peers) => {
                for peer in peers {
                    self.expect_token(peer, BARRIER_ARRIVE)?;
                }
                for mut peer in peers {
                    peer.write_all(&[BARRIER_RELEASE])
                        .map_err(|e| self.io_error(e))?;
                }
            }
            Links::Worker(coordinator) => {
                let mut stream: &TcpStream = coordinator;
                stream
                    .write_all(&[BARRIER_ARRIVE])
                    .map_err(|e| self.io_error(e))?;
                self.expect_token(coordinator, BARRIER_RELEASE)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn spawn_group(port: u16, world_size: usize, timeout: Duration) -> Vec<TcpProcessGroup> {
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                thread::spawn(move || {
                    TcpProcessGroup::init("127.0.0.1", port, world_size, rank, rank, timeout)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect()
    }

    #[test]
    fn two_rank_rendezvous_and_barrier() {
        let groups = spawn_group(free_port(), 2, Duration::from_secs(10));
        assert_eq!(groups[0].rank(), 0);
        assert_eq!(groups[1].rank(), 1);
        assert!(groups.iter().all(|pg| pg.world_size() == 2));
        assert!(groups[0].is_coordinator());

        // Further barriers on both sides.
        let mut groups = groups.into_iter();
        let (coordinator, worker) = (groups.next().unwrap(), groups.next().unwrap());
        let handle = thread::spawn(move || {
            worker.barrier().unwrap();
            worker.barrier().unwrap();
        });
        coordinator.barrier().unwrap();
        coordinator.barrier().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn four_rank_rendezvous() {
        let groups = spawn_group(free_port(), 4, Duration::from_secs(10));
        let ranks: Vec<_> = groups.iter().map(|pg| pg.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn worker_times_out_without_coordinator() {
        let err = TcpProcessGroup::init(
            "127.0.0.1",
            free_port(),
            2,
            1,
            1,
            Duration::from_millis(300),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DistributedError::Timeout { .. }));
    }

    #[test]
    fn coordinator_times_out_without_peers() {
        let err = TcpProcessGroup::init(
            "127.0.0.1",
            free_port(),
            2,
            0,
            0,
            Duration::from_millis(200),
        )
        .err()
        .unwrap();
        assert!(matches!(err, DistributedError::Timeout { .. }));
    }

    #[test]
    fn silent_peer_times_out_handshake() {
        let port = free_port();
        let handle = thread::spawn(move || {
            TcpProcessGroup::init("127.0.0.1", port, 2, 0, 0, Duration::from_millis(300))
        });

        // Connect but never announce a rank.
        let deadline = Instant::now() + Duration::from_secs(5);
        let _silent = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Err(e) => panic!("coordinator never listened: {e}"),
            }
        };

        let err = handle.join().unwrap().err().unwrap();
        assert!(matches!(err, DistributedError::Timeout { timeout_ms: 300 }));
    }

    #[test]
    fn rank_out_of_range() {
        let err = TcpProcessGroup::init("127.0.0.1", 1, 2, 2, 0, Duration::from_millis(10))
            .err()
            .unwrap();
        assert!(matches!(err, DistributedError::InvalidRank { .. }));
    }
}
