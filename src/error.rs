use std::error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::block::BlockId;

#[derive(Debug)]

/**
 * Error to represent invalid configuration, numerical breakdown, or corrupt
 * restart data. Everything except `Io` on a best-effort diagnostics write is
 * fatal to the whole distributed job; see [`Error::is_fatal`].
 */
pub enum Error {
    Configuration(String),
    NumericalDivergence { block: BlockId, field: &'static str },
    SingularSystem { obstacle: usize, determinant: f64 },
    MissingGhost(BlockId),
    PhaseOrder { obstacle: usize, expected: &'static str, found: &'static str },
    ResidualMomentum { linear: [f64; 3], angular: [f64; 3] },
    RestartCorrupt { path: PathBuf, reason: String },
    Io(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error must bring down every rank. A rank that returns
    /// early from a collective leaves its peers blocked, so the driver is
    /// expected to call [`crate::message::comm::Communicator::abort`] on
    /// these.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Io(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> std::result::Result<(), fmt::Error> {
        use Error::*;

        match self {
            Configuration(what) => write!(fmt, "invalid configuration: {}", what),
            NumericalDivergence { block, field } => {
                write!(fmt, "non-finite {} value in block {}", field, block.0)
            }
            SingularSystem { obstacle, determinant } => write!(
                fmt,
                "singular inertia system for obstacle {} (det = {:e})",
                obstacle, determinant
            ),
            MissingGhost(id) => write!(fmt, "no owned or ghost data for block {}", id.0),
            PhaseOrder { obstacle, expected, found } => write!(
                fmt,
                "obstacle {} phase out of order: expected {}, found {}",
                obstacle, expected, found
            ),
            ResidualMomentum { linear, angular } => write!(
                fmt,
                "deformation velocity not momentum free: lin {:?} ang {:?}",
                linear, angular
            ),
            RestartCorrupt { path, reason } => {
                write!(fmt, "corrupt restart file {}: {}", path.display(), reason)
            }
            Io(e) => write!(fmt, "i/o error: {}", e),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
