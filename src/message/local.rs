use crossbeam_channel::{Receiver, Sender};
use super::comm::Communicator;

/// A communicator between ranks living in the same process, typically one
/// thread per rank. Messages travel over unbounded crossbeam channels, so
/// `send` never blocks and per-pair ordering is preserved.
///
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Vec<u8>>>,
    inbox: Receiver<Vec<u8>>,
}

impl LocalCommunicator {
    /// Create a fully connected group of `size` communicators; element `r`
    /// of the returned vector has rank `r`.
    ///
    pub fn group(size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| Self {
                rank,
                peers: senders.clone(),
                inbox,
            })
            .collect()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        // The receiving end is owned by a peer that always outlives the
        // collectives it takes part in.
        self.peers[rank]
            .send(message)
            .expect("local peer hung up during a collective")
    }

    fn recv(&self) -> Vec<u8> {
        self.inbox
            .recv()
            .expect("local peers hung up during a collective")
    }
}
