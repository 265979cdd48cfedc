//! Driftwood couples immersed rigid and deforming bodies to a block-structured
//! incompressible flow solver. Bodies are represented on the fluid grid by a
//! mollified characteristic function; each time step they solve for their
//! rigid-body velocities from the momentum of the fluid they cover, integrate
//! surface forces, and advance their pose.
//!
//! The grid is split into cubic blocks distributed over ranks. Kernels are
//! applied block by block by a per-rank worker pool, first on blocks whose
//! neighbors are all local, then on the remaining blocks once their ghost
//! data has arrived. Collective reductions go through the
//! [`message::Communicator`] trait, so the coupling runs the same way over
//! in-process channels or TCP.

pub mod block;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod index_space;
pub mod kernels;
pub mod lab;
pub mod math;
pub mod message;
pub mod moments;
pub mod obstacle;
pub mod obstacle_vector;
pub mod overlap;
pub mod persistence;
pub mod profiler;
