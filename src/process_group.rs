use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{bytes_to_f32s, f32s_to_bytes, CommunicationBackend, ReduceOp};
use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::transport::{LocalFabric, TcpFabric};

/// Rank that owns checkpoint writes and evaluation.
pub const COORDINATOR: usize = 0;

#[derive(Debug, Clone)]
pub struct ProcessGroupConfig {
    pub rank: usize,
    pub world_size: usize,
    pub master_addr: String,
    pub master_port: u16,
    pub init_timeout: Duration,
    pub collective_timeout: Duration,
}

impl ProcessGroupConfig {
    pub fn from_train_config(config: &TrainConfig) -> Self {
        Self {
            rank: config.distributed.local_rank,
            world_size: config.distributed.world_size,
            master_addr: config.distributed.master_addr.clone(),
            master_port: config.distributed.master_port,
            init_timeout: config.init_timeout(),
            collective_timeout: config.collective_timeout(),
        }
    }
}

/// The set of cooperating ranks and the fabric joining them.
pub struct ProcessGroup {
    backend: Box<dyn CommunicationBackend>,
}

impl ProcessGroup {
    /// Performs the rendezvous. Failures are returned, never swallowed; the
    /// caller decides whether to abort or retry.
    pub fn init(config: &ProcessGroupConfig) -> Result<Self> {
        if config.world_size == 0 || config.rank >= config.world_size {
            return Err(Error::Initialization(format!(
                "rank {} is not a member of a group of {}",
                config.rank, config.world_size
            )));
        }

        if config.world_size == 1 {
            let fabric = LocalFabric::ring(1, config.collective_timeout)
                .pop()
                .ok_or_else(|| Error::Initialization("empty single-rank ring".into()))?;
            return Ok(Self::from_backend(fabric));
        }

        if config.master_addr.is_empty() {
            return Err(Error::Initialization("no master address for rendezvous".into()));
        }
        let master = format!("{}:{}", config.master_addr, config.master_port);
        info!(
            "🔗 Rank {}/{} joining process group at {}",
            config.rank, config.world_size, master
        );
        let fabric = TcpFabric::connect(
            &master,
            config.rank,
            config.world_size,
            config.init_timeout,
            config.collective_timeout,
        )?;
        Ok(Self::from_backend(fabric))
    }

    pub fn from_backend(backend: impl CommunicationBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
        }
    }

    /// In-process group of `world_size` ranks, one handle per rank.
    pub fn local(world_size: usize, collective_timeout: Duration) -> Vec<ProcessGroup> {
        LocalFabric::ring(world_size, collective_timeout)
            .into_iter()
            .map(Self::from_backend)
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.backend.rank()
    }

    pub fn world_size(&self) -> usize {
        self.backend.world_size()
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn all_reduce(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        debug!("rank {}: all_reduce {:?} over {} values", self.rank(), op, data.len());
        self.backend.all_reduce(data, op)
    }

    pub fn broadcast(&self, data: &[f32], src: usize) -> Result<Vec<f32>> {
        let bytes = self.broadcast_bytes(f32s_to_bytes(data), src)?;
        bytes_to_f32s(&bytes)
    }

    pub fn broadcast_bytes(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>> {
        if src >= self.world_size() {
            return Err(Error::Transport(format!(
                "broadcast source {} outside group of {}",
                src,
                self.world_size()
            )));
        }
        debug!("rank {}: broadcast from {} ({} bytes)", self.rank(), src, data.len());
        self.backend.broadcast_bytes(data, src)
    }

    pub fn barrier(&self) -> Result<()> {
        self.backend.all_reduce(&[], ReduceOp::Sum).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_rank_group_short_circuits() {
        let config = ProcessGroupConfig {
            rank: 0,
            world_size: 1,
            master_addr: String::new(),
            master_port: 0,
            init_timeout: Duration::from_secs(1),
            collective_timeout: Duration::from_secs(1),
        };
        let group = ProcessGroup::init(&config).unwrap();
        assert!(group.is_coordinator());
        assert_eq!(group.all_reduce(&[1.5, 2.5], ReduceOp::Sum).unwrap(), vec![1.5, 2.5]);
        assert_eq!(group.broadcast(&[7.0], 0).unwrap(), vec![7.0]);
        group.barrier().unwrap();
    }

    #[test]
    fn init_failure_is_surfaced() {
        let config = ProcessGroupConfig {
            rank: 1,
            world_size: 2,
            master_addr: String::new(),
            master_port: 0,
            init_timeout: Duration::from_millis(10),
            collective_timeout: Duration::from_millis(10),
        };
        let err = ProcessGroup::init(&config).err().unwrap();
        assert!(matches!(err, Error::Initialization(_)));
    }

    #[test]
    fn local_group_broadcasts_floats() {
        let handles: Vec<_> = ProcessGroup::local(3, Duration::from_secs(5))
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mine = vec![group.rank() as f32; 2];
                    group.barrier().unwrap();
                    group.broadcast(&mine, 1).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![1.0, 1.0]);
        }
    }

    #[test]
    fn broadcast_from_outside_the_group_is_rejected() {
        let group = ProcessGroup::local(1, Duration::from_secs(1)).pop().unwrap();
        assert!(group.broadcast_bytes(vec![1], 3).is_err());
    }
}
