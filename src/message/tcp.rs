use std::collections::hash_map::{Entry, HashMap};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};

use crate::error::Error;
use super::backoff::{self, ExponentialBackoff};
use super::comm::Communicator;
use super::util;

const RETRY_WAIT: Duration = Duration::from_millis(50);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(2000);
const MAX_CONNECT_ATTEMPTS: usize = 40;

/// Frame length reserved to tell a peer that the job is being torn down.
const ABORT_FRAME: usize = usize::MAX;

/// A communicator whose ranks are processes (or threads) reachable over TCP.
/// Every rank listens on its own address; outgoing connections are opened
/// lazily, one per peer, so messages between a pair of ranks stay ordered.
/// Incoming frames are drained by reader threads into an unbounded channel,
/// which keeps `send` from ever waiting on a matching `recv`.
///
pub struct TcpCommunicator {
    rank: usize,
    peers: Vec<SocketAddr>,
    streams: Mutex<HashMap<usize, TcpStream>>,
    loopback: Sender<Vec<u8>>,
    inbox: Receiver<Vec<u8>>,
}

impl TcpCommunicator {
    /// Create the communicator for `rank`. The listener must already be bound
    /// to `peers[rank]`; binding before any rank starts connecting avoids a
    /// startup race.
    ///
    pub fn new(rank: usize, listener: TcpListener, peers: Vec<SocketAddr>) -> io::Result<Self> {
        let (loopback, inbox) = crossbeam_channel::unbounded();
        let sink = loopback.clone();

        info!("rank {} listening on {}", rank, listener.local_addr()?);

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => Self::spawn_reader(stream, sink.clone()),
                    Err(e) => warn!("failed to accept connection: {}", e),
                }
            }
        });

        Ok(Self {
            rank,
            peers,
            streams: Mutex::new(HashMap::new()),
            loopback,
            inbox,
        })
    }

    fn spawn_reader(mut stream: TcpStream, sink: Sender<Vec<u8>>) {
        let remote = stream.peer_addr().ok();
        debug!("receiving connection from {:?}", remote);

        thread::spawn(move || loop {
            let frame = util::read_usize(&mut stream).and_then(|size| {
                if size == ABORT_FRAME {
                    error!("peer {:?} aborted the job", remote);
                    std::process::exit(1)
                }
                util::read_bytes_vec(&mut stream, size)
            });
            match frame {
                Ok(bytes) => {
                    if sink.send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!("connection from {:?} failed: {}", remote, e);
                    break;
                }
            }
        });
    }

    fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        let delays = ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2).take(MAX_CONNECT_ATTEMPTS);

        let stream = backoff::retry(delays, || TcpStream::connect(addr), |e, delay| {
            debug!("connect to {} failed ({}), retrying in {:?}", addr, e, delay)
        })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn write_to(&self, rank: usize, message: &[u8]) -> io::Result<()> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());

        let stream = match streams.entry(rank) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Self::connect(self.peers[rank])?),
        };
        util::write_frame(stream, message)
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        if rank == self.rank {
            // The inbox is owned by self, so this send cannot fail.
            let _ = self.loopback.send(message);
            return;
        }
        if let Err(e) = self.write_to(rank, &message) {
            self.abort(&Error::Io(e))
        }
    }

    fn recv(&self) -> Vec<u8> {
        match self.inbox.recv() {
            Ok(bytes) => bytes,
            Err(_) => unreachable!("the inbox sender is held by self"),
        }
    }

    fn abort(&self, error: &Error) -> ! {
        error!("rank {} aborting: {}", self.rank, error);

        for rank in (0..self.size()).filter(|&r| r != self.rank) {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            let stream = match streams.remove(&rank) {
                Some(stream) => Ok(stream),
                None => TcpStream::connect(self.peers[rank]),
            };
            if let Ok(mut stream) = stream {
                let _ = io::Write::write_all(&mut stream, &ABORT_FRAME.to_le_bytes());
            }
        }
        std::process::exit(1)
    }
}

#[cfg(test)]
mod test {

    use std::net::TcpListener;
    use std::thread;
    use super::TcpCommunicator;
    use crate::message::comm::Communicator;

    #[test]
    fn all_reduce_over_tcp_works() {
        let listeners: Vec<_> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let peers: Vec<_> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let peers = peers.clone();
                thread::spawn(move || {
                    let comm = TcpCommunicator::new(rank, listener, peers).unwrap();
                    let sum = comm.all_reduce_sum(&[rank as f64, 1.0]);
                    comm.barrier();
                    sum
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), vec![3.0, 3.0]);
        }
    }
}
