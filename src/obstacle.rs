use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter};
use std::ops::AddAssign;
use std::path::Path;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::block::{field, BlockId, BlockInfo};
use crate::config::{ObstacleArguments, ObstacleConfig};
use crate::context::{Context, StepContext};
use crate::engine::{Engine, Integral};
use crate::error::{Error, Result};
use crate::geometry::{mollify, Geometry, Pose};
use crate::grid::BlockSource;
use crate::index_space::IndexSpace;
use crate::kernels::{SurfaceForces, VelocityMoments};
use crate::math::{self, Quaternion, SymmetricTensor, EPS};
use crate::message::Communicator;
use crate::moments::RigidBodyMoments;
use crate::persistence::BodyRecord;




/// Relative size of the momentum left in a deformation velocity after it
/// was made momentum free, above which the correction is considered failed.
const RESIDUAL_TOLERANCE: f64 = 1e-9;

/// Largest discrepancy between the heading recovered from the quaternion and
/// the one implied by the angular velocity that goes unreported.
const HEADING_TOLERANCE: f64 = 1e-10;




/**
 * A cell in the characteristic function's transition band, where the
 * surface integrals are evaluated.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfacePoint {
    pub index: (i64, i64, i64),
    pub position: [f64; 3],
    pub grad_chi: [f64; 3],
    pub udef: [f64; 3],
    pub pressure_force: [f64; 3],
    pub viscous_force: [f64; 3],
}




/**
 * Surface-integrated quantities of one obstacle (or one block of it, before
 * the reduction).
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurfaceQoi {
    pub force: [f64; 3],
    pub pres_force: [f64; 3],
    pub visc_force: [f64; 3],
    pub torque: [f64; 3],
    pub gamma: [f64; 3],
    pub drag: f64,
    pub thrust: f64,
    pub p_out: f64,
    pub p_out_bnd: f64,
    pub def_power: f64,
    pub def_power_bnd: f64,
    pub p_locom: f64,
    pub area: f64,
}

impl SurfaceQoi {
    pub const LEN: usize = 23;

    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(Self::LEN);

        for a in [self.force, self.pres_force, self.visc_force, self.torque, self.gamma] {
            v.extend(a);
        }
        v.extend([
            self.drag,
            self.thrust,
            self.p_out,
            self.p_out_bnd,
            self.def_power,
            self.def_power_bnd,
            self.p_locom,
            self.area,
        ]);
        v
    }

    pub fn from_slice(v: &[f64]) -> Self {
        assert_eq!(v.len(), Self::LEN, "surface quantities have {} entries", Self::LEN);
        let a3 = |i: usize| [v[i], v[i + 1], v[i + 2]];
        Self {
            force: a3(0),
            pres_force: a3(3),
            visc_force: a3(6),
            torque: a3(9),
            gamma: a3(12),
            drag: v[15],
            thrust: v[16],
            p_out: v[17],
            p_out_bnd: v[18],
            def_power: v[19],
            def_power_bnd: v[20],
            p_locom: v[21],
            area: v[22],
        }
    }
}

impl AddAssign for SurfaceQoi {
    fn add_assign(&mut self, b: Self) {
        let sum: Vec<_> = self.to_vec().iter().zip(b.to_vec()).map(|(x, y)| x + y).collect();
        *self = Self::from_slice(&sum);
    }
}




/**
 * One obstacle's data on one block: the signed distance (with a one-cell
 * halo, for gradients), the characteristic function, the deformation
 * velocity, the surface points, and the block's share of the surface
 * quantities.
 */
#[derive(Clone, Debug)]
pub struct ObstacleBlock {
    pub info: BlockInfo,
    pub sdf: Vec<f64>,
    pub chi: Vec<f64>,
    pub udef: Vec<[f64; 3]>,
    pub surface: Vec<SurfacePoint>,
    pub qoi: SurfaceQoi,
    cells: IndexSpace,
    padded: IndexSpace,
}




// ============================================================================
impl ObstacleBlock {


    /**
     * Evaluate the shape on the block: signed distance on the cells and their
     * halo, and the deformation velocity for self-propelled shapes. The
     * characteristic function is left at zero until [`Self::compute_chi`].
     */
    pub fn new(info: BlockInfo, geometry: &dyn Geometry, pose: &Pose, time: f64) -> Self {
        let cells = info.cells();
        let padded = cells.extend_all(1);
        let sdf = padded
            .iter()
            .map(|index| geometry.signed_distance(pose, info.cell_center(index)))
            .collect();
        let udef = if geometry.is_self_propelled() {
            cells
                .iter()
                .map(|index| geometry.deformation_velocity(pose, info.cell_center(index), time))
                .collect()
        } else {
            vec![[0.0; 3]; cells.len()]
        };

        Self {
            chi: vec![0.0; cells.len()],
            info,
            sdf,
            udef,
            surface: Vec::new(),
            qoi: SurfaceQoi::default(),
            cells,
            padded,
        }
    }


    pub fn cells(&self) -> &IndexSpace {
        &self.cells
    }


    pub fn chi_at(&self, index: (i64, i64, i64)) -> f64 {
        self.chi[self.cells.row_major_offset(index)]
    }


    pub fn udef_at(&self, index: (i64, i64, i64)) -> [f64; 3] {
        self.udef[self.cells.row_major_offset(index)]
    }


    pub fn sdf_at(&self, index: (i64, i64, i64)) -> f64 {
        self.sdf[self.padded.row_major_offset(index)]
    }


    /**
     * Mollify the signed distance into the characteristic function, and
     * collect the cells where its gradient is non-zero as surface points.
     */
    pub fn compute_chi(&mut self, half_band: f64) {
        let h = self.info.h;
        let mut surface = Vec::new();

        for (n, index) in self.cells.iter().enumerate() {
            self.chi[n] = mollify(self.sdf_at(index), half_band);

            let (i, j, k) = index;
            let g = |a, b| (mollify(self.sdf_at(a), half_band) - mollify(self.sdf_at(b), half_band)) / (2.0 * h);
            let grad_chi = [
                g((i + 1, j, k), (i - 1, j, k)),
                g((i, j + 1, k), (i, j - 1, k)),
                g((i, j, k + 1), (i, j, k - 1)),
            ];

            if grad_chi.iter().any(|&x| x != 0.0) {
                surface.push(SurfacePoint {
                    index,
                    position: self.info.cell_center(index),
                    grad_chi,
                    udef: self.udef[n],
                    pressure_force: [0.0; 3],
                    viscous_force: [0.0; 3],
                });
            }
        }
        self.surface = surface;
    }


    /**
     * Moments of the deformation velocity about `reference`, plus the sum of
     * `chi |u| (1 + |r|) dV`, used to scale the residual check.
     */
    fn udef_moments(&self, reference: [f64; 3]) -> (RigidBodyMoments, f64) {
        let dv = self.info.cell_volume();
        let mut moments = RigidBodyMoments::default();
        let mut magnitude = 0.0;

        for (n, index) in self.cells.iter().enumerate() {
            let chi = self.chi[n];

            if chi > 0.0 {
                let r = math::sub(self.info.cell_center(index), reference);
                moments.add_cell(chi, dv, r, self.udef[n]);
                magnitude += chi * dv * math::norm(self.udef[n]) * (1.0 + math::norm(r));
            }
        }
        (moments, magnitude)
    }
}




/**
 * The lifecycle position of an obstacle within a time step.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Created,
    ChiReady,
    Finalized,
    VelocitiesComputed,
    ForcesComputed,
    Updated,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Created => "created",
            Stage::ChiReady => "chi ready",
            Stage::Finalized => "finalized",
            Stage::VelocitiesComputed => "velocities computed",
            Stage::ForcesComputed => "forces computed",
            Stage::Updated => "updated",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}




/**
 * Penalization diagnostics from the latest velocity solve.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Penalization {
    pub mass: f64,
    pub force: [f64; 3],
    pub torque: [f64; 3],
}




/**
 * Surface diagnostics from the latest force computation.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SurfaceDiagnostics {
    pub qoi: SurfaceQoi,
    pub p_thrust: f64,
    pub p_drag: f64,
    pub eff_p_def: f64,
    pub eff_p_def_bnd: f64,
}




/**
 * Kinematic state of an obstacle, plus the diagnostics of the latest step.
 */
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObstacleState {
    pub position: [f64; 3],
    pub abs_position: [f64; 3],
    pub quaternion: Quaternion,
    pub trans_vel: [f64; 3],
    pub ang_vel: [f64; 3],
    pub volume: f64,
    pub inertia: SymmetricTensor,
    pub angle_2d: f64,
    pub trans_vel_computed: [f64; 3],
    pub ang_vel_computed: [f64; 3],
    pub penalization: Penalization,
    pub surface: SurfaceDiagnostics,
}

impl ObstacleState {
    pub fn pose(&self) -> Pose {
        Pose { position: self.position, quaternion: self.quaternion }
    }

    pub fn record(&self, time: f64) -> BodyRecord {
        BodyRecord {
            time,
            position: self.position,
            abs_position: self.abs_position,
            quaternion: self.quaternion.0,
            trans_vel: self.trans_vel,
            ang_vel: self.ang_vel,
            angle_2d: self.angle_2d,
        }
    }

    /**
     * Velocity of the rigid body motion at lab-frame point `x`.
     */
    pub fn rigid_velocity(&self, x: [f64; 3]) -> [f64; 3] {
        math::add(self.trans_vel, math::cross(self.ang_vel, math::sub(x, self.position)))
    }
}




/**
 * An immersed body coupled to the flow. Each time step runs, in order:
 * [`create`](Self::create), [`compute_chi`](Self::compute_chi),
 * [`finalize`](Self::finalize), [`compute_velocities`](Self::compute_velocities),
 * optionally [`compute_forces`](Self::compute_forces), and
 * [`update`](Self::update). Calling a phase out of order is an error.
 *
 * The collective phases (`finalize`, `compute_velocities`,
 * `compute_forces`) must be called by every rank.
 */
pub struct Obstacle {
    id: usize,
    args: ObstacleArguments,
    config: ObstacleConfig,
    geometry: Box<dyn Geometry>,
    state: ObstacleState,
    blocks: BTreeMap<BlockId, ObstacleBlock>,
    blocked_rotation: [bool; 3],
    stage: Stage,
}




// ============================================================================
impl Obstacle {


    pub fn new(id: usize, args: ObstacleArguments, geometry: Box<dyn Geometry>, config: ObstacleConfig) -> Result<Self> {
        args.validate()?;
        config.validate()?;

        let quaternion = Quaternion(args.quaternion);
        let mut blocked_rotation = geometry.blocked_rotation();

        if args.is_forced() {
            blocked_rotation = [true; 3];
        }

        let mut trans_vel = [0.0; 3];

        for d in 0..3 {
            if args.forced[d] {
                trans_vel[d] = args.enforced_velocity[d];
                debug!("obstacle {} forced to move with constant velocity {} along axis {}", id, trans_vel[d], d);
            }
        }

        let state = ObstacleState {
            position: args.position,
            quaternion,
            angle_2d: quaternion.heading(),
            trans_vel,
            ..Default::default()
        };

        Ok(Self {
            id,
            args,
            config,
            geometry,
            state,
            blocks: BTreeMap::new(),
            blocked_rotation,
            stage: Stage::Idle,
        })
    }


    pub fn id(&self) -> usize {
        self.id
    }


    pub fn args(&self) -> &ObstacleArguments {
        &self.args
    }


    pub fn state(&self) -> &ObstacleState {
        &self.state
    }


    pub fn state_mut(&mut self) -> &mut ObstacleState {
        &mut self.state
    }


    pub fn stage(&self) -> Stage {
        self.stage
    }


    pub fn length(&self) -> f64 {
        self.args.length
    }


    pub fn is_self_propelled(&self) -> bool {
        self.geometry.is_self_propelled()
    }


    pub fn blocked_rotation(&self) -> [bool; 3] {
        self.blocked_rotation
    }


    pub fn blocks(&self) -> &BTreeMap<BlockId, ObstacleBlock> {
        &self.blocks
    }


    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }


    fn expect_stage(&self, allowed: &[Stage], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(Error::PhaseOrder {
                obstacle: self.id,
                expected,
                found: self.stage.name(),
            })
        }
    }


    /**
     * Allocate this obstacle's data on every local block whose extent
     * intersects the shape's bounding box grown by the safety margin, and
     * evaluate the shape there. Blocks from the previous step are discarded.
     */
    pub fn create<G: BlockSource>(&mut self, engine: &Engine, grid: &G, step: &StepContext) -> Result<()> {
        let h = grid.spec().h;
        let pose = self.state.pose();
        let region = self.geometry.bounding_box(&pose).expand(self.config.safety_cells * h);
        let geometry = &*self.geometry;
        let infos = grid.local_blocks();

        let blocks: Vec<_> = engine.install(|| {
            infos
                .par_iter()
                .filter(|info| info.bounds().intersects(&region))
                .map(|info| ObstacleBlock::new(info.clone(), geometry, &pose, step.time))
                .collect()
        });

        self.blocks = blocks.into_iter().map(|b| (b.info.id, b)).collect();
        self.stage = Stage::Created;

        debug!("obstacle {} touches {} local blocks", self.id, self.blocks.len());
        Ok(())
    }


    /**
     * Turn the signed distance into the mollified characteristic function
     * and extract the surface points. Local work only.
     */
    pub fn compute_chi(&mut self, engine: &Engine) -> Result<()> {
        self.expect_stage(&[Stage::Created], "created")?;

        let h = self.blocks.values().next().map(|b| b.info.h);

        if let Some(h) = h {
            let half_band = self.config.mollification_width * h;
            engine.install(|| {
                self.blocks.par_iter_mut().for_each(|(_, b)| b.compute_chi(half_band))
            });
        }
        self.stage = Stage::ChiReady;
        Ok(())
    }


    /**
     * Complete the create phase once the characteristic function is known:
     * remove the rigid motion from a self-propelled body's deformation
     * velocity, then run the shape's own finalize hook. Collective.
     */
    pub fn finalize<C: Communicator>(&mut self, engine: &Engine, comm: &C, step: &StepContext) -> Result<()> {
        self.expect_stage(&[Stage::ChiReady], "chi ready")?;

        if self.geometry.is_self_propelled() {
            self.make_deformation_momentum_free(engine, comm)?;
        }
        self.geometry.finalize(step);
        self.stage = Stage::Finalized;
        Ok(())
    }


    fn udef_moments<C: Communicator>(&self, engine: &Engine, comm: &C, reference: [f64; 3]) -> (RigidBodyMoments, f64) {
        let (moments, magnitude) = engine.install(|| {
            self.blocks
                .par_iter()
                .map(|(_, b)| b.udef_moments(reference))
                .reduce(|| (RigidBodyMoments::default(), 0.0), |a, b| (a.0 + b.0, a.1 + b.1))
        });
        let mut local = moments.to_vec();
        local.push(magnitude);

        let mut global = comm.all_reduce_sum(&local);
        let magnitude = global.pop().unwrap_or_default();
        (RigidBodyMoments::from_slice(&global), magnitude)
    }


    /**
     * Subtract from the deformation velocity the rigid translation and
     * rotation it implies, measured about the chi-weighted centroid, so that
     * deformation alone carries no linear or angular momentum.
     */
    fn make_deformation_momentum_free<C: Communicator>(&mut self, engine: &Engine, comm: &C) -> Result<()> {
        let (first, _) = self.udef_moments(engine, comm, self.state.position);

        if !(first.volume > 0.0) {
            return Err(Error::SingularSystem { obstacle: self.id, determinant: 0.0 });
        }
        let centroid = math::add(self.state.position, first.centroid_offset());
        let (about_centroid, _) = self.udef_moments(engine, comm, centroid);

        let inverse = about_centroid.inertia.inverse().ok_or(Error::SingularSystem {
            obstacle: self.id,
            determinant: about_centroid.inertia.determinant(),
        })?;
        let trans = math::scale(1.0 / about_centroid.volume, about_centroid.linear);
        let ang = inverse.mul_vec(about_centroid.angular);

        engine.install(|| {
            self.blocks.par_iter_mut().for_each(|(_, b)| {
                for (n, index) in b.cells.iter().enumerate() {
                    let r = math::sub(b.info.cell_center(index), centroid);
                    let rigid = math::add(trans, math::cross(ang, r));
                    b.udef[n] = math::sub(b.udef[n], rigid);
                }
                for p in &mut b.surface {
                    p.udef = b.udef[b.cells.row_major_offset(p.index)];
                }
            })
        });

        if cfg!(debug_assertions) {
            let (residual, magnitude) = self.udef_moments(engine, comm, centroid);
            let tolerance = RESIDUAL_TOLERANCE * magnitude.max(EPS);

            if math::norm(residual.linear) > tolerance || math::norm(residual.angular) > tolerance {
                return Err(Error::ResidualMomentum { linear: residual.linear, angular: residual.angular });
            }
        }
        debug!("obstacle {} deformation correction: trans {:?} ang {:?}", self.id, trans, ang);
        Ok(())
    }


    /**
     * Solve for the rigid-body velocities from the flow inside the body.
     * Integrates the chi-weighted moments of the mismatch between the fluid
     * velocity and the body velocity (rigid plus deformation) over all ranks,
     * then corrects the translational and angular velocity by `dt * lambda`
     * times the mean mismatch, honoring forced axes, planar motion, blocked
     * rotation axes, and any prescribed velocity. Collective.
     */
    pub fn compute_velocities<G, C>(&mut self, engine: &Engine, grid: &mut G, comm: &C, step: &StepContext) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
    {
        self.expect_stage(
            &[Stage::Finalized, Stage::VelocitiesComputed, Stage::ForcesComputed],
            "finalized")?;

        let prototype = VelocityMoments::new(self.state.position, self.state.trans_vel, self.state.ang_vel);
        let mut kernels = engine.kernels(|| prototype.clone());
        engine.compute_restricted(grid, comm, &mut kernels, &mut self.blocks, Integral::Volume)?;

        let local: RigidBodyMoments = kernels.iter().map(|k| k.moments).sum();
        let global = local.all_reduce(comm);
        let v = global.volume;

        if !(v > 0.0) {
            return Err(Error::SingularSystem { obstacle: self.id, determinant: 0.0 });
        }
        let lambda = step.lambda;
        let force = math::scale(lambda, global.linear);
        let torque = math::scale(lambda, global.angular);
        let dt = step.dt;

        let state = &mut self.state;
        state.volume = v;
        state.inertia = global.inertia;
        state.penalization = Penalization { mass: v, force, torque };

        for d in 0..3 {
            state.trans_vel_computed[d] = state.trans_vel[d] + dt * force[d] / v;

            state.trans_vel[d] = if self.args.forced[d] {
                self.args.enforced_velocity[d]
            } else if d == 2 && self.args.fix_to_planar {
                0.0
            } else {
                state.trans_vel_computed[d]
            };
        }

        if let Some(u) = self.geometry.prescribed_velocity(step.time) {
            state.trans_vel = u;
        }

        if self.args.fix_to_planar {
            let jzz = global.inertia.0[2];

            if !(jzz > 0.0) {
                return Err(Error::SingularSystem { obstacle: self.id, determinant: jzz });
            }
            state.ang_vel_computed = [0.0, 0.0, state.ang_vel[2] + dt * torque[2] / jzz];
            state.ang_vel = [0.0, 0.0, if self.blocked_rotation[2] { 0.0 } else { state.ang_vel_computed[2] }];
        } else {
            let inverse = global.inertia.inverse().ok_or(Error::SingularSystem {
                obstacle: self.id,
                determinant: global.inertia.determinant(),
            })?;
            let dw = inverse.mul_vec(torque);

            for d in 0..3 {
                state.ang_vel_computed[d] = state.ang_vel[d] + dt * dw[d];
                state.ang_vel[d] = if self.blocked_rotation[d] { 0.0 } else { state.ang_vel_computed[d] };
            }
        }
        self.stage = Stage::VelocitiesComputed;
        Ok(())
    }


    /**
     * Integrate pressure and viscous stress over the body surface into
     * forces, torque, circulation, and power, and derive the thrust, drag,
     * and efficiency figures. Skipped for bodies that neither move by
     * themselves nor ask for forces. Collective.
     */
    pub fn compute_forces<G, C>(
        &mut self,
        engine: &Engine,
        grid: &mut G,
        comm: &C,
        step: &StepContext,
        ctx: &mut Context,
    ) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
    {
        self.expect_stage(&[Stage::VelocitiesComputed, Stage::ForcesComputed], "velocities computed")?;

        if !self.args.compute_forces && !self.geometry.is_self_propelled() {
            self.stage = Stage::ForcesComputed;
            return Ok(());
        }

        let speed = math::norm(self.state.trans_vel);
        let vel_unit = if speed > 1e-9 {
            math::scale(1.0 / speed, self.state.trans_vel)
        } else {
            [0.0; 3]
        };
        let prototype = SurfaceForces {
            nu: step.nu,
            uinf: step.uinf,
            center: self.state.position,
            trans_vel: self.state.trans_vel,
            ang_vel: self.state.ang_vel,
            vel_unit,
        };
        let mut kernels = engine.kernels(|| prototype.clone());
        engine.compute_restricted(grid, comm, &mut kernels, &mut self.blocks, Integral::Surface)?;

        let mut local = SurfaceQoi::default();

        for block in self.blocks.values() {
            local += block.qoi;
        }
        let qoi = SurfaceQoi::from_slice(&comm.all_reduce_sum(&local.to_vec()));
        let p_thrust = qoi.thrust * speed;
        let p_drag = qoi.drag * speed;

        self.state.surface = SurfaceDiagnostics {
            qoi,
            p_thrust,
            p_drag,
            eff_p_def: p_thrust / (p_thrust - qoi.def_power.min(0.0) + EPS),
            eff_p_def_bnd: p_thrust / (p_thrust - qoi.def_power_bnd + EPS),
        };

        if step.dump {
            if let Err(e) = self.dump_surface(&ctx.output, comm.rank(), step.step) {
                warn!("obstacle {} surface dump failed: {}", self.id, e);
            }
        }
        self.write_surface_diagnostics(step, ctx);
        self.stage = Stage::ForcesComputed;
        Ok(())
    }


    fn dump_surface(&self, directory: &Path, rank: usize, step: u64) -> Result<()> {
        let name = format!("surface_{:02}_{:07}_rank{:03}.cbor", self.id, step, rank);
        std::fs::create_dir_all(directory)?;
        let file = BufWriter::new(File::create(directory.join(name))?);
        let points: Vec<&SurfacePoint> = self.blocks.values().flat_map(|b| &b.surface).collect();

        ciborium::ser::into_writer(&points, file)
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))
    }


    /**
     * Advance the pose by `dt`: position by the body velocity plus the
     * background flow, orientation by the angular velocity. The planar
     * heading is recovered from the new quaternion.
     */
    pub fn update(&mut self, step: &StepContext, ctx: &mut Context) -> Result<()> {
        self.expect_stage(&[Stage::VelocitiesComputed, Stage::ForcesComputed], "velocities computed")?;

        let dt = step.dt;
        let state = &mut self.state;

        for d in 0..3 {
            state.position[d] += dt * (state.trans_vel[d] + step.uinf[d]);
            state.abs_position[d] += dt * state.trans_vel[d];
        }
        state.quaternion = state.quaternion.integrate(state.ang_vel, dt);

        let previous = state.angle_2d;
        state.angle_2d = state.quaternion.heading();

        if state.ang_vel[0] == 0.0 && state.ang_vel[1] == 0.0 {
            let error = math::wrap_angle(state.angle_2d - previous - dt * state.ang_vel[2]).abs();

            if error > HEADING_TOLERANCE && ctx.rank == 0 {
                warn!(
                    "obstacle {}: heading from quaternion disagrees with angular velocity by {:e} ({} vs {})",
                    self.id, error, (state.angle_2d - previous) / dt, state.ang_vel[2]);
            }
        }

        self.write_velocity_diagnostics(step, ctx);
        self.stage = Stage::Updated;
        Ok(())
    }


    /**
     * Write this obstacle's share of the characteristic function into the
     * grid, keeping the larger of the two values in every cell.
     */
    pub fn characteristic_function<G: BlockSource>(&self, grid: &mut G) -> Result<()> {
        self.expect_stage(
            &[Stage::ChiReady, Stage::Finalized, Stage::VelocitiesComputed, Stage::ForcesComputed, Stage::Updated],
            "chi ready")?;

        for (id, block) in &self.blocks {
            let fluid = grid.block_mut(*id).ok_or(Error::MissingGhost(*id))?;

            for (n, index) in block.cells.iter().enumerate() {
                let chi = fluid.get_mut(index, field::CHI);
                *chi = chi.max(block.chi[n]);
            }
        }
        Ok(())
    }


    pub fn save(&self, time: f64, path: &Path) -> Result<()> {
        self.state.record(time).write(path)
    }


    /**
     * Restore the kinematic state from a restart file. Returns `Ok(false)`,
     * keeping the current state, if there is no file.
     */
    pub fn restart(&mut self, path: &Path) -> Result<bool> {
        match BodyRecord::read(path)? {
            Some(record) => {
                let state = &mut self.state;
                state.position = record.position;
                state.abs_position = record.abs_position;
                state.quaternion = Quaternion(record.quaternion);
                state.trans_vel = record.trans_vel;
                state.ang_vel = record.ang_vel;
                state.angle_2d = record.angle_2d;

                info!(
                    "obstacle {} restarted at t = {}: position {:?} quaternion {:?}",
                    self.id, record.time, record.position, record.quaternion);
                Ok(true)
            }
            None => {
                warn!("obstacle {}: no restart file at {}, keeping initial state", self.id, path.display());
                Ok(false)
            }
        }
    }


    fn write_velocity_diagnostics(&self, step: &StepContext, ctx: &mut Context) {
        let s = &self.state;
        let q = s.quaternion.0;
        let j = s.inertia.0;
        let velocity = [
            step.time, s.position[0], s.position[1], s.position[2],
            q[0], q[1], q[2], q[3],
            s.trans_vel[0], s.trans_vel[1], s.trans_vel[2],
            s.ang_vel[0], s.ang_vel[1], s.ang_vel[2], s.volume,
            j[0], j[1], j[2], j[3], j[4], j[5],
        ];
        let p = &s.penalization;
        let forces = [
            step.time, p.mass,
            p.force[0], p.force[1], p.force[2],
            p.torque[0], p.torque[1], p.torque[2],
        ];
        let force_table = if self.is_self_propelled() {
            format!("forceValues_penalization_{}.dat", self.id)
        } else {
            format!("forceValues_{}.dat", self.id)
        };

        let results = [
            ctx.diagnostics.write_row(
                &format!("computedVelocity_{}.dat", self.id),
                &[
                    "time", "CMx", "CMy", "CMz", "quat_0", "quat_1", "quat_2", "quat_3",
                    "vel_x", "vel_y", "vel_z", "angvel_x", "angvel_y", "angvel_z", "volume",
                    "J0", "J1", "J2", "J3", "J4", "J5",
                ],
                step.step,
                &velocity),
            ctx.diagnostics.write_row(
                &force_table,
                &["time", "mass", "force_x", "force_y", "force_z", "torque_x", "torque_y", "torque_z"],
                step.step,
                &forces),
        ];

        for e in results.into_iter().filter_map(|r| r.err()) {
            warn!("obstacle {} diagnostics not written: {}", self.id, e);
        }
    }


    fn write_surface_diagnostics(&self, step: &StepContext, ctx: &mut Context) {
        let s = &self.state.surface;
        let q = &s.qoi;
        let mut forces = vec![step.time, self.state.volume];

        for a in [q.force, q.torque, q.pres_force, q.visc_force, q.gamma] {
            forces.extend(a);
        }
        forces.extend([q.drag, q.thrust, q.area]);

        let power = [
            step.time, s.p_thrust, s.p_drag, q.p_out, -q.def_power, s.eff_p_def,
            q.p_locom, q.p_out_bnd, -q.def_power_bnd, s.eff_p_def_bnd,
        ];
        let prefix = if self.is_self_propelled() { "" } else { "surface_" };

        let results = [
            ctx.diagnostics.write_row(
                &format!("forceValues_{}{}.dat", prefix, self.id),
                &[
                    "time", "mass", "force_x", "force_y", "force_z", "torque_x", "torque_y", "torque_z",
                    "presF_x", "presF_y", "presF_z", "viscF_x", "viscF_y", "viscF_z",
                    "gamma_x", "gamma_y", "gamma_z", "drag", "thrust", "area",
                ],
                step.step,
                &forces),
            ctx.diagnostics.write_row(
                &format!("powerValues_{}{}.dat", prefix, self.id),
                &[
                    "time", "Pthrust", "Pdrag", "Pout", "pDef", "etaPDef",
                    "pLocom", "PoutBnd", "defPowerBnd", "etaPDefBnd",
                ],
                step.step,
                &power),
        ];

        for e in results.into_iter().filter_map(|r| r.err()) {
            warn!("obstacle {} diagnostics not written: {}", self.id, e);
        }
    }
}
