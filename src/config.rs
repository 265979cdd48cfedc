use std::f64::consts::SQRT_2;
use serde::{Deserialize, Serialize};
use crate::error::{Error, Result};
use crate::math::DBLEPS;




/// Upper bound on the worker pool size, to catch garbage configuration.
pub const MAX_WORKERS: usize = 4096;




/**
 * Worker pool configuration for the kernel execution engine.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads; zero picks one per available core.
    pub num_threads: usize,
    /// Pin each worker to a core.
    pub pin_threads: bool,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_threads > MAX_WORKERS {
            return Err(Error::Configuration(format!(
                "{} worker threads requested, at most {} are supported",
                self.num_threads, MAX_WORKERS)));
        }
        Ok(())
    }
}




/**
 * Parameters shared by all obstacles: the half-width of the characteristic
 * function's transition band, and the margin around an obstacle's bounding
 * box within which blocks are allocated. Both are in units of the grid
 * spacing.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObstacleConfig {
    pub mollification_width: f64,
    pub safety_cells: f64,
}

impl Default for ObstacleConfig {
    fn default() -> Self {
        Self {
            mollification_width: SQRT_2,
            safety_cells: 2.0,
        }
    }
}

impl ObstacleConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.mollification_width > 0.0) {
            return Err(Error::Configuration(format!(
                "mollification width must be positive, got {}", self.mollification_width)));
        }
        // A surface point sits up to one cell beyond the band; its block
        // reaches half a cell closer to the shape than its center.
        if self.safety_cells < self.mollification_width + 0.5 {
            return Err(Error::Configuration(format!(
                "safety margin ({} cells) must exceed the mollification band ({} cells) by half a cell",
                self.safety_cells, self.mollification_width)));
        }
        Ok(())
    }
}




/**
 * The externally configurable parameters of a single obstacle.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObstacleArguments {
    /// Characteristic length scale.
    pub length: f64,
    pub position: [f64; 3],
    /// Initial orientation `(w, x, y, z)`; must have unit norm.
    pub quaternion: [f64; 4],
    /// Axes along which the body moves with `enforced_velocity` regardless
    /// of the flow. Forcing any axis also blocks all rotation.
    pub forced: [bool; 3],
    pub enforced_velocity: [f64; 3],
    /// Axes along which the computational frame follows this body.
    pub fix_frame_of_reference: [bool; 3],
    /// Restrict the body to translation in the x-y plane and rotation about z.
    pub fix_to_planar: bool,
    pub compute_forces: bool,
}

impl Default for ObstacleArguments {
    fn default() -> Self {
        Self {
            length: 0.0,
            position: [0.0; 3],
            quaternion: [1.0, 0.0, 0.0, 0.0],
            forced: [false; 3],
            enforced_velocity: [0.0; 3],
            fix_frame_of_reference: [false; 3],
            fix_to_planar: false,
            compute_forces: true,
        }
    }
}

impl ObstacleArguments {
    pub fn validate(&self) -> Result<()> {
        let norm = self.quaternion.iter().map(|q| q * q).sum::<f64>().sqrt();

        if !((norm - 1.0).abs() <= 5.0 * DBLEPS) {
            return Err(Error::Configuration(format!(
                "initial quaternion {:?} does not have unit norm (|q| = {})", self.quaternion, norm)));
        }
        if !(self.length > 0.0 && self.length.is_finite()) {
            return Err(Error::Configuration(format!(
                "obstacle length scale must be positive, got {}", self.length)));
        }
        if self.position.iter().chain(&self.enforced_velocity).any(|x| !x.is_finite()) {
            return Err(Error::Configuration("obstacle position and velocity must be finite".into()));
        }
        Ok(())
    }

    pub fn is_forced(&self) -> bool {
        self.forced.iter().any(|&f| f)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn obstacle_arguments_are_validated() {
        let args = ObstacleArguments { length: 1.0, ..Default::default() };
        assert!(args.validate().is_ok());
        assert!(ObstacleArguments::default().validate().is_err());

        let tilted = ObstacleArguments { quaternion: [1.0, 0.0, 0.0, 1e-6], ..args.clone() };
        assert!(matches!(tilted.validate(), Err(Error::Configuration(_))));

        let s = 0.5_f64.sqrt();
        let turned = ObstacleArguments { quaternion: [s, 0.0, 0.0, s], ..args };
        assert!(turned.validate().is_ok());
    }

    #[test]
    fn mollification_band_must_fit_in_the_safety_margin() {
        assert!(ObstacleConfig::default().validate().is_ok());
        let wide = ObstacleConfig { mollification_width: 3.0, safety_cells: 2.0 };
        assert!(wide.validate().is_err());
        let flush = ObstacleConfig { mollification_width: 2.0, safety_cells: 2.0 };
        assert!(matches!(flush.validate(), Err(Error::Configuration(_))));
        let snug = ObstacleConfig { mollification_width: 1.5, safety_cells: 2.0 };
        assert!(snug.validate().is_ok());
        assert!(EngineConfig { num_threads: MAX_WORKERS + 1, pin_threads: false }.validate().is_err());
    }
}
