//! TCP hub-and-spoke fabric for multi-process groups.
//!
//! Rank 0 listens at the master address and every other rank connects to it.
//! The hub folds contributions in rank order and sends the result back, so
//! the reduced bits are identical everywhere.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::backend::{bytes_to_f32s, f32s_to_bytes, CommunicationBackend, ReduceOp};
use crate::error::{Error, Result};

const MSG_HELLO: u8 = 1;
const MSG_READY: u8 = 2;
const MSG_FLOATS: u8 = 3;
const MSG_BYTES: u8 = 4;

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Largest payload a peer may announce; bigger headers mean a broken stream.
const MAX_FRAME_BYTES: u64 = 4 << 30;

fn write_frame(stream: &mut TcpStream, tag: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut header = [0u8; 9];
    header[0] = tag;
    header[1..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn read_frame(stream: &mut impl Read) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header)?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[1..]);
    let len = u64::from_le_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_BYTES),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok((header[0], payload))
}

fn transport_error(rank: usize, peer: usize, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Transport(format!(
            "rank {}: timed out waiting for rank {}",
            rank, peer
        )),
        _ => Error::Transport(format!("rank {}: link to rank {} failed: {}", rank, peer, e)),
    }
}

enum Role {
    /// Streams to ranks 1..world_size, indexed by `rank - 1`.
    Hub(Vec<TcpStream>),
    Spoke(TcpStream),
}

pub struct TcpFabric {
    rank: usize,
    world_size: usize,
    role: Mutex<Role>,
}

impl TcpFabric {
    /// Joins the group. Rank 0 binds `master`; the other ranks dial it.
    pub fn connect(
        master: &str,
        rank: usize,
        world_size: usize,
        init_timeout: Duration,
        collective_timeout: Duration,
    ) -> Result<Self> {
        if rank == 0 {
            let listener = TcpListener::bind(master).map_err(|e| {
                Error::Initialization(format!("rank 0 cannot listen on {}: {}", master, e))
            })?;
            Self::host(listener, world_size, init_timeout, collective_timeout)
        } else {
            let addr = master
                .to_socket_addrs()
                .map_err(|e| Error::Initialization(format!("bad master address {}: {}", master, e)))?
                .next()
                .ok_or_else(|| Error::Initialization(format!("master address {} did not resolve", master)))?;
            Self::join(addr, rank, world_size, init_timeout, collective_timeout)
        }
    }

    /// Rank 0 side of the rendezvous on an already bound listener.
    pub fn host(
        listener: TcpListener,
        world_size: usize,
        init_timeout: Duration,
        collective_timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + init_timeout;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("listener setup failed: {}", e)))?;

        let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 0;
        while joined < world_size - 1 {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    stream
                        .set_nonblocking(false)
                        .and_then(|_| stream.set_nodelay(true))
                        .and_then(|_| stream.set_read_timeout(Some(init_timeout)))
                        .map_err(|e| Error::Initialization(format!("peer {} setup failed: {}", addr, e)))?;

                    let (tag, payload) = read_frame(&mut stream)
                        .map_err(|e| Error::Initialization(format!("handshake with {} failed: {}", addr, e)))?;
                    if tag != MSG_HELLO || payload.len() != 16 {
                        return Err(Error::Initialization(format!("malformed handshake from {}", addr)));
                    }
                    let peer_rank = u64::from_le_bytes(payload[..8].try_into().unwrap_or_default()) as usize;
                    let peer_world = u64::from_le_bytes(payload[8..].try_into().unwrap_or_default()) as usize;

                    if peer_world != world_size {
                        return Err(Error::Initialization(format!(
                            "rank {} expects world size {}, hub has {}",
                            peer_rank, peer_world, world_size
                        )));
                    }
                    if peer_rank == 0 || peer_rank >= world_size {
                        return Err(Error::Initialization(format!("rank {} out of range", peer_rank)));
                    }
                    let slot = &mut peers[peer_rank - 1];
                    if slot.is_some() {
                        return Err(Error::Initialization(format!("rank {} joined twice", peer_rank)));
                    }
                    debug!("🤝 Rank {} joined from {}", peer_rank, addr);
                    *slot = Some(stream);
                    joined += 1;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::Initialization(format!(
                            "only {}/{} ranks joined within {:?}",
                            joined + 1,
                            world_size,
                            init_timeout
                        )));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(Error::Initialization(format!("accept failed: {}", e))),
            }
        }

        // Everyone is in: release the spokes.
        let mut streams = Vec::with_capacity(world_size - 1);
        for (i, stream) in peers.into_iter().enumerate() {
            let mut stream = stream.ok_or_else(|| Error::Initialization(format!("rank {} missing", i + 1)))?;
            stream
                .set_read_timeout(Some(collective_timeout))
                .and_then(|_| stream.set_write_timeout(Some(collective_timeout)))
                .and_then(|_| write_frame(&mut stream, MSG_READY, &[]))
                .map_err(|e| Error::Initialization(format!("releasing rank {} failed: {}", i + 1, e)))?;
            streams.push(stream);
        }

        info!("🌐 TCP process group ready: {} ranks", world_size);
        Ok(Self {
            rank: 0,
            world_size,
            role: Mutex::new(Role::Hub(streams)),
        })
    }

    fn join(
        addr: SocketAddr,
        rank: usize,
        world_size: usize,
        init_timeout: Duration,
        collective_timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + init_timeout;
        let mut stream = loop {
            match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
                Ok(stream) => break stream,
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Initialization(format!(
                            "rank {} could not reach master {} within {:?}: {}",
                            rank, addr, init_timeout, e
                        )));
                    }
                    thread::sleep(CONNECT_RETRY);
                }
            }
        };

        let mut hello = Vec::with_capacity(16);
        hello.extend_from_slice(&(rank as u64).to_le_bytes());
        hello.extend_from_slice(&(world_size as u64).to_le_bytes());

        let remaining = deadline.saturating_duration_since(Instant::now()).max(Duration::from_millis(1));
        stream
            .set_nodelay(true)
            .and_then(|_| stream.set_read_timeout(Some(remaining)))
            .and_then(|_| write_frame(&mut stream, MSG_HELLO, &hello))
            .map_err(|e| Error::Initialization(format!("rank {} handshake failed: {}", rank, e)))?;

        match read_frame(&mut stream) {
            Ok((MSG_READY, _)) => {}
            Ok((tag, _)) => {
                return Err(Error::Initialization(format!("unexpected handshake reply {}", tag)));
            }
            Err(e) => {
                return Err(Error::Initialization(format!(
                    "rank {} never released by master: {}",
                    rank, e
                )));
            }
        }

        stream
            .set_read_timeout(Some(collective_timeout))
            .and_then(|_| stream.set_write_timeout(Some(collective_timeout)))
            .map_err(|e| Error::Initialization(format!("rank {} socket setup failed: {}", rank, e)))?;

        debug!("🌐 Rank {} joined TCP process group", rank);
        Ok(Self {
            rank,
            world_size,
            role: Mutex::new(Role::Spoke(stream)),
        })
    }

    fn expect(&self, peer: usize, frame: (u8, Vec<u8>), tag: u8) -> Result<Vec<u8>> {
        if frame.0 != tag {
            return Err(Error::Transport(format!(
                "rank {}: collective sequence diverged with rank {} (frame {} vs {})",
                self.rank, peer, frame.0, tag
            )));
        }
        Ok(frame.1)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Role>> {
        self.role
            .lock()
            .map_err(|_| Error::Transport(format!("rank {}: fabric lock poisoned", self.rank)))
    }
}

impl CommunicationBackend for TcpFabric {
    fn name(&self) -> &str {
        "tcp"
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce(&self, data: &[f32], op: ReduceOp) -> Result<Vec<f32>> {
        let mut role = self.lock()?;
        match &mut *role {
            Role::Hub(streams) => {
                let mut acc = data.to_vec();
                for (i, stream) in streams.iter_mut().enumerate() {
                    let peer = i + 1;
                    let frame = read_frame(stream).map_err(|e| transport_error(0, peer, e))?;
                    let values = bytes_to_f32s(&self.expect(peer, frame, MSG_FLOATS)?)?;
                    if values.len() != acc.len() {
                        return Err(Error::Transport(format!(
                            "rank {} contributed {} values, expected {}",
                            peer,
                            values.len(),
                            acc.len()
                        )));
                    }
                    op.combine_into(&mut acc, &values);
                }
                let payload = f32s_to_bytes(&acc);
                for (i, stream) in streams.iter_mut().enumerate() {
                    write_frame(stream, MSG_FLOATS, &payload).map_err(|e| transport_error(0, i + 1, e))?;
                }
                Ok(acc)
            }
            Role::Spoke(stream) => {
                write_frame(stream, MSG_FLOATS, &f32s_to_bytes(data))
                    .map_err(|e| transport_error(self.rank, 0, e))?;
                let frame = read_frame(stream).map_err(|e| transport_error(self.rank, 0, e))?;
                let values = bytes_to_f32s(&self.expect(0, frame, MSG_FLOATS)?)?;
                if values.len() != data.len() {
                    return Err(Error::Transport(format!(
                        "rank {}: reduced length {} differs from contribution {}",
                        self.rank,
                        values.len(),
                        data.len()
                    )));
                }
                Ok(values)
            }
        }
    }

    fn broadcast_bytes(&self, data: Vec<u8>, src: usize) -> Result<Vec<u8>> {
        let mut role = self.lock()?;
        match &mut *role {
            Role::Hub(streams) => {
                let payload = if src == 0 {
                    data
                } else {
                    let frame = read_frame(&mut streams[src - 1]).map_err(|e| transport_error(0, src, e))?;
                    self.expect(src, frame, MSG_BYTES)?
                };
                for (i, stream) in streams.iter_mut().enumerate() {
                    if i + 1 != src {
                        write_frame(stream, MSG_BYTES, &payload).map_err(|e| transport_error(0, i + 1, e))?;
                    }
                }
                Ok(payload)
            }
            Role::Spoke(stream) => {
                if self.rank == src {
                    write_frame(stream, MSG_BYTES, &data).map_err(|e| transport_error(self.rank, 0, e))?;
                    return Ok(data);
                }
                let frame = read_frame(stream).map_err(|e| transport_error(self.rank, 0, e))?;
                self.expect(0, frame, MSG_BYTES)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn spawn_group(world_size: usize) -> Vec<TcpFabric> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let master = listener.local_addr().unwrap().to_string();

        let spokes: Vec<_> = (1..world_size)
            .map(|rank| {
                let master = master.clone();
                thread::spawn(move || TcpFabric::connect(&master, rank, world_size, TIMEOUT, TIMEOUT).unwrap())
            })
            .collect();

        let hub = TcpFabric::host(listener, world_size, TIMEOUT, TIMEOUT).unwrap();
        let mut fabrics = vec![hub];
        fabrics.extend(spokes.into_iter().map(|h| h.join().unwrap()));
        fabrics
    }

    #[test]
    fn tcp_all_reduce_and_broadcast() {
        let handles: Vec<_> = spawn_group(3)
            .into_iter()
            .map(|fabric| {
                thread::spawn(move || {
                    let rank = fabric.rank();
                    let sum = fabric.all_reduce(&[rank as f32, 1.0], ReduceOp::Sum).unwrap();
                    let min = fabric.all_reduce(&[rank as f32], ReduceOp::Min).unwrap();
                    let bytes = fabric.broadcast_bytes(vec![rank as u8; 4], 1).unwrap();
                    (sum, min, bytes)
                })
            })
            .collect();

        for handle in handles {
            let (sum, min, bytes) = handle.join().unwrap();
            assert_eq!(sum, vec![3.0, 3.0]);
            assert_eq!(min, vec![0.0]);
            assert_eq!(bytes, vec![1u8; 4]);
        }
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut header = vec![MSG_BYTES];
        header.extend_from_slice(&u64::MAX.to_le_bytes());
        let err = read_frame(&mut std::io::Cursor::new(header)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(matches!(transport_error(1, 0, err), Error::Transport(_)));

        let mut frame = vec![MSG_BYTES];
        frame.extend_from_slice(&3u64.to_le_bytes());
        frame.extend_from_slice(b"abc");
        let (tag, payload) = read_frame(&mut std::io::Cursor::new(frame)).unwrap();
        assert_eq!((tag, payload.as_slice()), (MSG_BYTES, &b"abc"[..]));
    }

    #[test]
    fn hub_reports_missing_ranks() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = TcpFabric::host(listener, 2, Duration::from_millis(100), TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Initialization(_)));
    }

    #[test]
    fn spoke_reports_unreachable_master() {
        // Bind then drop to get a port nobody is listening on.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let err = TcpFabric::connect(&addr.to_string(), 1, 2, Duration::from_millis(300), TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Initialization(_)));
    }
}
