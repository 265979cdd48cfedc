use crate::block::{field, BlockInfo};
use crate::engine::{Engine, Kernel, ObstacleKernel, Stencil};
use crate::error::Result;
use crate::grid::{BlockSource, SyncToken};
use crate::lab::Lab;
use crate::math;
use crate::message::Communicator;
use crate::moments::RigidBodyMoments;
use crate::obstacle::{ObstacleBlock, SurfaceQoi};




/**
 * Largest speed `|u + uinf|` over the cells of the visited blocks.
 */
#[derive(Clone, Debug, Default)]
pub struct MaxVelocity {
    pub uinf: [f64; 3],
    pub max: f64,
}

impl MaxVelocity {
    pub fn new(uinf: [f64; 3]) -> Self {
        Self { uinf, max: 0.0 }
    }
}

impl Kernel for MaxVelocity {
    fn stencil(&self) -> Stencil {
        Stencil::new(0, vec![field::U, field::V, field::W])
    }

    fn apply(&mut self, lab: &Lab, info: &BlockInfo) {
        for index in info.cells().iter() {
            let speed = math::norm(math::add(lab.velocity(index), self.uinf));
            self.max = self.max.max(speed);
        }
    }
}




/**
 * The global maximum fluid speed in the frame where the background flow is
 * `uinf`, for choosing a stable time step.
 */
pub fn max_velocity<G, C>(engine: &Engine, grid: &mut G, comm: &C, uinf: [f64; 3]) -> Result<f64>
where
    G: BlockSource + Sync,
    C: Communicator,
{
    let mut kernels = engine.kernels(|| MaxVelocity::new(uinf));
    engine.compute(grid, comm, &mut kernels)?;

    let local = kernels.iter().map(|k| k.max).fold(0.0, f64::max);
    Ok(comm.all_reduce_max(&[local])[0])
}




/**
 * Half the integral of the squared vorticity over the visited blocks.
 */
#[derive(Clone, Debug, Default)]
pub struct Enstrophy {
    pub sum: f64,
}

impl Kernel for Enstrophy {
    fn stencil(&self) -> Stencil {
        Stencil::new(1, vec![field::U, field::V, field::W])
    }

    fn apply(&mut self, lab: &Lab, info: &BlockInfo) {
        let dv = info.cell_volume();

        for index in info.cells().iter() {
            let g = lab.velocity_gradient(index, info.h);
            let w = [g[2][1] - g[1][2], g[0][2] - g[2][0], g[1][0] - g[0][1]];
            self.sum += 0.5 * math::dot(w, w) * dv;
        }
    }
}




/**
 * The global enstrophy. If `issued` holds a halo exchange started earlier
 * for a stencil covering [`Enstrophy`]'s, the sweep redeems it instead of
 * starting its own.
 */
pub fn enstrophy<G, C>(engine: &Engine, grid: &mut G, comm: &C, issued: Option<SyncToken>) -> Result<f64>
where
    G: BlockSource + Sync,
    C: Communicator,
{
    let mut kernels = engine.kernels(Enstrophy::default);

    match issued {
        Some(token) => engine.compute_issued(grid, comm, &mut kernels, token)?,
        None => engine.compute(grid, comm, &mut kernels)?,
    }
    let local: f64 = kernels.iter().map(|k| k.sum).sum();
    Ok(comm.all_reduce_sum(&[local])[0])
}




/**
 * Chi-weighted moments of the mismatch between the fluid velocity and the
 * body velocity (rigid motion about `center` plus deformation).
 */
#[derive(Clone, Debug)]
pub struct VelocityMoments {
    pub center: [f64; 3],
    pub trans_vel: [f64; 3],
    pub ang_vel: [f64; 3],
    pub moments: RigidBodyMoments,
}

impl VelocityMoments {
    pub fn new(center: [f64; 3], trans_vel: [f64; 3], ang_vel: [f64; 3]) -> Self {
        Self { center, trans_vel, ang_vel, moments: RigidBodyMoments::default() }
    }
}

impl ObstacleKernel for VelocityMoments {
    fn stencil(&self) -> Stencil {
        Stencil::new(0, vec![field::U, field::V, field::W])
    }

    fn apply(&mut self, lab: &Lab, info: &BlockInfo, block: &mut ObstacleBlock) {
        let dv = info.cell_volume();

        for (n, index) in block.cells().iter().enumerate() {
            let chi = block.chi[n];

            if chi <= 0.0 {
                continue;
            }
            let r = math::sub(info.cell_center(index), self.center);
            let rigid = math::add(self.trans_vel, math::cross(self.ang_vel, r));
            let udiff = math::sub(math::sub(lab.velocity(index), rigid), block.udef[n]);
            self.moments.add_cell(chi, dv, r, udiff);
        }
    }
}




/**
 * Integrates the pressure and viscous traction over the surface points of a
 * block. With `n = -grad chi / |grad chi|` the outward normal and
 * `dA = |grad chi| dV`, the pressure force is `p grad chi dV` and the viscous
 * force is `-2 nu D grad chi dV`, where `D` is the strain rate. The sum of
 * `dA` over the surface points is the wetted area.
 */
#[derive(Clone, Debug)]
pub struct SurfaceForces {
    pub nu: f64,
    pub uinf: [f64; 3],
    pub center: [f64; 3],
    pub trans_vel: [f64; 3],
    pub ang_vel: [f64; 3],
    pub vel_unit: [f64; 3],
}

impl ObstacleKernel for SurfaceForces {
    fn stencil(&self) -> Stencil {
        Stencil::new(1, vec![field::U, field::V, field::W, field::P])
    }

    fn apply(&mut self, lab: &Lab, info: &BlockInfo, block: &mut ObstacleBlock) {
        let h = info.h;
        let dv = info.cell_volume();
        let mut qoi = SurfaceQoi::default();

        for point in &mut block.surface {
            let gc = point.grad_chi;
            let g = lab.velocity_gradient(point.index, h);
            let p = lab.pressure(point.index);

            let mut fp = [0.0; 3];
            let mut fv = [0.0; 3];

            for c in 0..3 {
                fp[c] = p * gc[c] * dv;

                for d in 0..3 {
                    let strain = 0.5 * (g[c][d] + g[d][c]);
                    fv[c] -= 2.0 * self.nu * strain * gc[d] * dv;
                }
            }
            let f = math::add(fp, fv);
            let r = math::sub(point.position, self.center);
            let u = math::add(lab.velocity(point.index), self.uinf);
            let rigid = math::add(self.trans_vel, math::cross(self.ang_vel, r));
            let torque = math::cross(r, f);
            let gamma = math::scale(dv, math::cross(u, gc));

            for d in 0..3 {
                qoi.pres_force[d] += fp[d];
                qoi.visc_force[d] += fv[d];
                qoi.force[d] += f[d];
                qoi.torque[d] += torque[d];
                qoi.gamma[d] += gamma[d];
            }

            let parallel = math::dot(f, self.vel_unit);
            qoi.thrust += 0.5 * (parallel + parallel.abs());
            qoi.drag -= 0.5 * (parallel - parallel.abs());

            let p_out = math::dot(f, u);
            let def_power = math::dot(f, point.udef);
            qoi.p_out += p_out;
            qoi.p_out_bnd += p_out.min(0.0);
            qoi.def_power += def_power;
            qoi.def_power_bnd += def_power.min(0.0);
            qoi.p_locom += math::dot(f, rigid);
            qoi.area += math::norm(gc) * dv;

            point.pressure_force = fp;
            point.viscous_force = fv;
        }
        block.qoi = qoi;
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::collections::BTreeMap;
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Integral;
    use crate::geometry::{Pose, Sphere};
    use crate::grid::{BlockGrid, Boundary, GridSpec};
    use crate::message::LocalCommunicator;

    fn spec() -> GridSpec {
        GridSpec {
            blocks_per_dim: [2, 2, 2],
            block_size: 8,
            h: 0.125,
            origin: [0.0; 3],
            boundary: Boundary::ZeroGradient,
        }
    }

    fn sphere_blocks(grid: &BlockGrid) -> BTreeMap<crate::block::BlockId, ObstacleBlock> {
        let sphere = Sphere::new(0.5);
        let pose = Pose { position: [1.0; 3], ..Default::default() };

        grid.local_blocks()
            .into_iter()
            .map(|info| {
                let mut block = ObstacleBlock::new(info.clone(), &sphere, &pose, 0.0);
                block.compute_chi(std::f64::consts::SQRT_2 * info.h);
                (info.id, block)
            })
            .collect()
    }

    fn chi_volume(blocks: &BTreeMap<crate::block::BlockId, ObstacleBlock>) -> f64 {
        blocks.values().map(|b| b.chi.iter().sum::<f64>() * b.info.cell_volume()).sum()
    }

    #[test]
    fn max_velocity_includes_the_background_flow() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        grid.fill(|x| [x[0], 0.0, 0.0, 0.0, 0.0]);

        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let umax = max_velocity(&engine, &mut grid, &comm, [0.0, 3.0, 4.0]).unwrap();
        let top = 2.0 - 0.0625;
        assert!((umax - (top * top + 25.0f64).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn solid_body_rotation_has_uniform_vorticity() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        grid.fill(|x| [1.0 - x[1], x[0] - 1.0, 0.0, 0.0, 0.0]);

        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let token = grid.begin_halo_exchange(&Stencil::new(1, vec![field::U, field::V, field::W, field::P]));
        let total = enstrophy(&engine, &mut grid, &comm, Some(token)).unwrap();

        // Zero-gradient ghosts halve the one-sided differences on the edges.
        let a = |i: usize| -> f64 { if i == 0 || i == 15 { 0.5 } else { 1.0 } };
        let dv = 0.125f64.powi(3);
        let expected: f64 = (0..16)
            .flat_map(|i| (0..16).map(move |j| (a(i) + a(j)).powi(2)))
            .map(|w2| 0.5 * w2 * 16.0 * dv)
            .sum();
        assert!((total - expected).abs() < 1e-9 * expected);
        assert!((enstrophy(&engine, &mut grid, &comm, None).unwrap() - total).abs() < 1e-9 * expected);
    }

    #[test]
    fn uniform_flow_has_momentum_proportional_to_volume() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        grid.fill(|_| [0.5, -1.0, 0.0, 0.0, 0.0]);
        let mut blocks = sphere_blocks(&grid);

        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut kernels = engine.kernels(|| VelocityMoments::new([1.0; 3], [0.0; 3], [0.0; 3]));
        engine.compute_restricted(&mut grid, &comm, &mut kernels, &mut blocks, Integral::Volume).unwrap();

        let m: RigidBodyMoments = kernels.iter().map(|k| k.moments).sum();
        let v = chi_volume(&blocks);
        assert!((m.volume - v).abs() < 1e-12);
        assert!((m.linear[0] - 0.5 * v).abs() < 1e-12);
        assert!((m.linear[1] + v).abs() < 1e-12);
        assert!(m.angular.iter().all(|a| a.abs() < 1e-12));
        assert!(m.centroid_offset().iter().all(|x| x.abs() < 1e-12));
    }

    #[test]
    fn linear_pressure_gives_buoyancy() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        grid.fill(|x| [0.0, 0.0, 0.0, x[0], 0.0]);
        let mut blocks = sphere_blocks(&grid);

        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let prototype = SurfaceForces {
            nu: 0.1,
            uinf: [0.0; 3],
            center: [1.0; 3],
            trans_vel: [0.0; 3],
            ang_vel: [0.0; 3],
            vel_unit: [0.0; 3],
        };
        let mut kernels = engine.kernels(|| prototype.clone());
        engine.compute_restricted(&mut grid, &comm, &mut kernels, &mut blocks, Integral::Surface).unwrap();

        let mut qoi = SurfaceQoi::default();
        for b in blocks.values() {
            qoi += b.qoi;
        }
        let v = chi_volume(&blocks);
        assert!((qoi.pres_force[0] + v).abs() < 1e-9);
        assert!(qoi.pres_force[1].abs() < 1e-9);
        assert!(qoi.visc_force.iter().all(|f| f.abs() < 1e-12));
        assert!(qoi.torque.iter().all(|t| t.abs() < 1e-9));
        assert_eq!(qoi.thrust, 0.0);

        let sphere_area = 4.0 * std::f64::consts::PI * 0.25;
        assert!((qoi.area - sphere_area).abs() < 0.05 * sphere_area);
    }
}
