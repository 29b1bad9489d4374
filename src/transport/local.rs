//! In-process ring fabric.
//!
//! Each endpoint receives from its left neighbour and sends to its right one.
//! All-reduce runs the classic two-phase ring: reduce-scatter leaves every
//! rank with one fully reduced chunk, all-gather circulates those chunks.
//! Each chunk is reduced exactly once, so every rank ends with the same bits.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::backend::{CommunicationBackend, ReduceOp};
use crate::error::{Error, Result};

#[derive(Debug)]
enum Message {
    Floats(Vec<f32>),
    Bytes(Vec<u8>),
}

pub struct LocalFabric {
    rank: usize,
    world_size: usize,
    left_rx: Receiver<Message>,
    right_tx: Sender<Message>,
    timeout: Duration,
}

impl LocalFabric {
    /// Builds `world_size` connected endpoints; endpoint `i` belongs to rank `i`.
    pub fn ring(world_size: usize, timeout: Duration) -> Vec<LocalFabric> {
        // Channel i carries traffic from rank i to rank i + 1.
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..world_size).map(|_| unbounded()).unzip();

        (0..world_size)
            .map(|rank| LocalFabric {
                rank,
                world_size,
                left_rx: rxs[(rank + world_size - 1) % world_size].clone(),
                right_tx: txs[rank].clone(),
                timeout,
            })
            .collect()
    }

    fn send(&self, message: Message) -> Result<()> {
        self.right_tx.send(message).map_err(|_| {
            Error::Transport(format!(
                "rank {}: right neighbour {} hung up",
                self.rank,
                (self.rank + 1) % self.world_size
            ))
        })
    }

    fn recv(&self) -> Result<Message> {
        let left = (self.rank + self.world_size - 1) % self.world_size;
        self.left_rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Transport(format!(
                "rank {}: timed out after {:?} waiting for rank {}",
                self.rank, self.timeout, left
            )),
            RecvTimeoutError::Disconnected => {
                Error::Transport(format!("rank {}: left neighbour {} hung up", self.rank, left))
            }
        })
    }

    fn recv_floats(&self) -> Result<Vec<f32>> {
        match self.recv()? {
            Message::Floats(values) => Ok(values),
            Message::Bytes(_) => Err(self.diverged("all_reduce", "broadcast")),
        }
    }

    fn recv_bytes(&self) -> Result<Vec<u8>> {
        match self.recv()? {
            Message::Bytes(bytes) => Ok(bytes),
            Message::Floats(_) => Err(self.diverged("broadcast", "all_reduce")),
        }
    }

    fn diverged(&self, expected: &str, got: &str) -> Error {
        Error::Transport(format!(
            "rank {}: collective sequence diverged (expected {}, peer issued {})",
            self.rank, expected, got
        ))
    }

    fn chunk(&self, index: usize, chunk_size: usize, len: usize) -> std::ops::Range<usize> {
        let start = (index * chunk_size).min(len);
        let end = (start + chunk_size).min(len);
        start..end
    }
}

impl CommunicationBackend for LocalFabric {
    fn name(&self) -> &str {
        "local-ring"
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        let n = self.world_size;
        let mut buf = data.to_vec();
        if n == 1 {
            return Ok(buf);
        }

        let len = buf.len();
        let chunk_size = len.div_ceil(n);

        // Phase 1: reduce-scatter.
        for step in 0..n - 1 {
            let send_idx = (self.rank + n - step) % n;
            let recv_idx = (self.rank + n - step - 1) % n;

            let range = self.chunk(send_idx, chunk_size, len);
            self.send(Message::Floats(buf[range].to_vec()))?;

            let incoming = self.recv_floats()?;
            let range = self.chunk(recv_idx, chunk_size, len);
            if incoming.len() != range.len() {
                return Err(Error::Transport(format!(
                    "rank {}: all_reduce length mismatch ({} vs {})",
                    self.rank,
                    incoming.len(),
                    range.len()
                )));
            }
            op.combine_into(&mut buf[range], &incoming);
        }

        // Phase 2: all-gather.
        for step in 0..n - 1 {
            let send_idx = (self.rank + 1 + n - step) % n;
            let recv_idx = (self.rank + n - step) % n;

            let range = self.chunk(send_idx, chunk_size, len);
            self.send(Message::Floats(buf[range].to_vec()))?;

            let incoming = self.recv_floats()?;
            let range = self.chunk(recv_idx, chunk_size, len);
            if incoming.len() != range.len() {
                return Err(Error::Transport(format!(
                    "rank {}: all_gather length mismatch ({} vs {})",
                    self.rank,
                    incoming.len(),
                    range.len()
                )));
            }
            buf[range].copy_from_slice(&incoming);
        }

        Ok(buf)
    }

    fn broadcast_bytes(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>> {
        let n = self.world_size;
        if n == 1 {
            return Ok(data);
        }
        if self.rank == src {
            self.send(Message::Bytes(data.clone()))?;
            return Ok(data);
        }

        // Pass the payload around the ring until it would return to the source.
        let payload = self.recv_bytes()?;
        if (self.rank + 1) % n != src {
            self.send(Message::Bytes(payload.clone()))?;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_ring<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalFabric) -> T + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = LocalFabric::ring(world_size, Duration::from_secs(5))
            .into_iter()
            .map(|fabric| {
                let f = f.clone();
                thread::spawn(move || f(fabric))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn ring_all_reduce_sums_across_ranks() {
        let results = run_ring(4, |fabric| {
            // Rank r contributes (r + 1) everywhere; the sum is 1 + 2 + 3 + 4.
            let data = vec![(fabric.rank() + 1) as f32; 10];
            fabric.all_reduce(&data, ReduceOp::Sum).unwrap()
        });
        for result in results {
            assert_eq!(result, vec![10.0; 10]);
        }
    }

    #[test]
    fn ring_all_reduce_handles_short_buffers() {
        // Fewer elements than ranks leaves some chunks empty.
        let results = run_ring(3, |fabric| {
            let data = vec![fabric.rank() as f32, -(fabric.rank() as f32)];
            fabric.all_reduce(&data, ReduceOp::Max).unwrap()
        });
        for result in results {
            assert_eq!(result, vec![2.0, 0.0]);
        }
    }

    #[test]
    fn ring_results_are_bit_identical() {
        let results = run_ring(3, |fabric| {
            let data: Vec<f32> = (0..17).map(|i| 0.1 * (i as f32 + fabric.rank() as f32) / 3.0).collect();
            fabric.all_reduce(&data, ReduceOp::Sum).unwrap()
        });
        let first: Vec<u32> = results[0].iter().map(|v| v.to_bits()).collect();
        for result in &results[1..] {
            let bits: Vec<u32> = result.iter().map(|v| v.to_bits()).collect();
            assert_eq!(bits, first);
        }
    }

    #[test]
    fn broadcast_delivers_source_payload() {
        let results = run_ring(4, |fabric| {
            let payload = vec![fabric.rank() as u8; 3];
            fabric.broadcast_bytes(payload, 2).unwrap()
        });
        for result in results {
            assert_eq!(result, vec![2u8; 3]);
        }
    }

    #[test]
    fn missing_peer_times_out() {
        let mut endpoints = LocalFabric::ring(2, Duration::from_millis(50));
        let lonely = endpoints.remove(0);
        let err = lonely.all_reduce(&[1.0], ReduceOp::Sum).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.is_retryable());
    }
}
