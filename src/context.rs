use std::path::PathBuf;
use crate::diagnostics::Diagnostics;
use crate::profiler::Profiler;




/**
 * The per-step arguments of every obstacle phase.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepContext {
    pub step: u64,
    pub time: f64,
    pub dt: f64,
    /// Velocity of the background flow relative to the grid.
    pub uinf: [f64; 3],
    /// Penalization coefficient.
    pub lambda: f64,
    /// Kinematic viscosity.
    pub nu: f64,
    /// Whether this step dumps surface data.
    pub dump: bool,
}

impl Default for StepContext {
    fn default() -> Self {
        Self {
            step: 0,
            time: 0.0,
            dt: 0.0,
            uinf: [0.0; 3],
            lambda: 1.0,
            nu: 0.0,
            dump: false,
        }
    }
}




/**
 * Driver-owned services passed explicitly to each phase.
 */
pub struct Context {
    pub rank: usize,
    pub output: PathBuf,
    pub profiler: Profiler,
    pub diagnostics: Diagnostics,
}

impl Context {
    /**
     * A context writing diagnostics and dumps under `output`. Diagnostics
     * tables are written by rank 0 only.
     */
    pub fn new(output: PathBuf, rank: usize) -> Self {
        Self {
            rank,
            diagnostics: Diagnostics::new(output.clone(), rank),
            output,
            profiler: Profiler::default(),
        }
    }

    /**
     * A context that records timings but writes no diagnostics.
     */
    pub fn quiet(rank: usize) -> Self {
        Self {
            rank,
            output: std::env::temp_dir(),
            profiler: Profiler::default(),
            diagnostics: Diagnostics::disabled(),
        }
    }
}
