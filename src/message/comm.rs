use log::error;
use crate::error::Error;
use super::util;

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can be TCP, in-process channels, or a
/// higher level abstraction like MPI. Implementors provide point-to-point
/// `send` and `recv`; the trait supplies the collectives the obstacle
/// coupling needs.
///
/// Messages between any two ranks must be delivered in the order they were
/// sent. Every rank must enter the collectives in the same order.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Must be implemented to receive a message from any of the peers. This
    /// method is allowed to block until a message is ready to be received
    fn recv(&self) -> Vec<u8>;

    /// Terminate the whole job, not only this rank. Returning early from a
    /// collective would leave the peers blocked inside it, so fatal errors
    /// end up here. Transports that can reach their peers should override
    /// this to notify them before exiting.
    fn abort(&self, error: &Error) -> ! {
        error!("rank {} aborting: {}", self.rank(), error);
        std::process::exit(1)
    }

    /// Implements a binomial tree broadcast from rank 0. The message buffer
    /// must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv(),
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, value.clone())
            }
        }
        value
    }

    /// Implements a binomial tree reduce onto rank 0. All ranks return `None`
    /// except for the root. The operator must be commutative and
    /// associative, since partial results arrive in any order.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv())
                }
            } else {
                self.send(r - one, value);
                return None;
            }
        }
        Some(value)
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Vec<u8>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        self.broadcast(self.reduce(f, value))
    }

    /// Element-wise sum of a vector of reals over all ranks.
    ///
    fn all_reduce_sum(&self, values: &[f64]) -> Vec<f64> {
        self.all_reduce_with(values, |a, b| a + b)
    }

    /// Element-wise maximum of a vector of reals over all ranks.
    ///
    fn all_reduce_max(&self, values: &[f64]) -> Vec<f64> {
        self.all_reduce_with(values, f64::max)
    }

    /// Element-wise fold of a vector of reals over all ranks, with the
    /// payload encoded as MessagePack.
    ///
    fn all_reduce_with<G>(&self, values: &[f64], g: G) -> Vec<f64>
    where
        G: Fn(f64, f64) -> f64,
    {
        let f = |a: Vec<u8>, b: Vec<u8>| {
            let a = decode(&a);
            let b = decode(&b);
            encode(&a.iter().zip(b).map(|(x, y)| g(*x, y)).collect::<Vec<_>>())
        };
        decode(&self.all_reduce(f, encode(values)))
    }

    /// Block until every rank has entered the barrier.
    ///
    fn barrier(&self) {
        self.all_reduce_sum(&[]);
    }
}

fn encode(values: &[f64]) -> Vec<u8> {
    rmp_serde::to_vec(values).expect("a vector of reals is always encodable")
}

fn decode(bytes: &[u8]) -> Vec<f64> {
    rmp_serde::from_slice(bytes).expect("collective payload from a peer is malformed")
}
