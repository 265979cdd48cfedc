//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send` and
//! `recv` operations for a given transport layer; an in-process channel
//! transport and a pure-Rust TCP transport are included. The trait then
//! provides default implementations for broadcast, reduce, all-reduce,
//! barrier, and job-wide abort.
//!

mod backoff;
pub mod comm;
pub mod local;
pub mod tcp;
pub mod util;

pub use comm::Communicator;
pub use local::LocalCommunicator;
pub use tcp::TcpCommunicator;
