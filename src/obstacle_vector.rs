use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{debug, info};

use crate::block::{field, BlockId};
use crate::context::{Context, StepContext};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::grid::BlockSource;
use crate::message::Communicator;
use crate::obstacle::Obstacle;
use crate::profiler::MetricEvent;




/**
 * An ordered collection of obstacles, driven through each phase of the time
 * step together. An obstacle is identified by its position in the vector,
 * which also names its restart file.
 */
#[derive(Default)]
pub struct ObstacleVector {
    obstacles: Vec<Obstacle>,
}




// ============================================================================
impl ObstacleVector {


    pub fn new() -> Self {
        Self::default()
    }


    pub fn push(&mut self, obstacle: Obstacle) {
        debug!("obstacle {} added at position {}", obstacle.id(), self.obstacles.len());
        self.obstacles.push(obstacle);
    }


    pub fn len(&self) -> usize {
        self.obstacles.len()
    }


    pub fn is_empty(&self) -> bool {
        self.obstacles.is_empty()
    }


    pub fn get(&self, ordinal: usize) -> Option<&Obstacle> {
        self.obstacles.get(ordinal)
    }


    pub fn get_mut(&mut self, ordinal: usize) -> Option<&mut Obstacle> {
        self.obstacles.get_mut(ordinal)
    }


    pub fn iter(&self) -> impl Iterator<Item = &Obstacle> {
        self.obstacles.iter()
    }


    /**
     * Run the create phase of every obstacle. Once every obstacle's
     * characteristic function is ready on this rank, and before any of them
     * is finalized, `issue` is called exactly once with the grid; it is the
     * place to start long-latency communication (such as the halo exchange
     * of the next operator) so that it overlaps the collective finalize
     * step. Its result is returned to the caller.
     */
    pub fn create<G, C, T, F>(
        &mut self,
        engine: &Engine,
        grid: &mut G,
        comm: &C,
        step: &StepContext,
        ctx: &mut Context,
        issue: F,
    ) -> Result<T>
    where
        G: BlockSource,
        C: Communicator,
        F: FnOnce(&mut G) -> T,
    {
        let start = Instant::now();

        for obstacle in &mut self.obstacles {
            obstacle.create(engine, &*grid, step)?;
            obstacle.compute_chi(engine)?;
        }
        let issued = issue(grid);

        for obstacle in &mut self.obstacles {
            obstacle.finalize(engine, comm, step)?;
        }
        ctx.profiler.record(MetricEvent::Work("create", start, Instant::now()));
        Ok(issued)
    }


    /**
     * Reset the grid's characteristic function, then rasterize every
     * obstacle into it. Where obstacles overlap, the larger value wins.
     */
    pub fn characteristic_function<G: BlockSource>(&self, grid: &mut G) -> Result<()> {
        for info in grid.local_blocks() {
            grid.block_mut(info.id).ok_or(Error::MissingGhost(info.id))?.fill(field::CHI, 0.0);
        }
        for obstacle in &self.obstacles {
            obstacle.characteristic_function(grid)?;
        }
        Ok(())
    }


    pub fn compute_velocities<G, C>(
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
        let start = Instant::now();

        for obstacle in &mut self.obstacles {
            obstacle.compute_velocities(engine, grid, comm, step)?;
        }
        ctx.profiler.record(MetricEvent::Work("compute velocities", start, Instant::now()));
        Ok(())
    }


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
        let start = Instant::now();

        for obstacle in &mut self.obstacles {
            obstacle.compute_forces(engine, grid, comm, step, ctx)?;
        }
        ctx.profiler.record(MetricEvent::Work("compute forces", start, Instant::now()));
        Ok(())
    }


    pub fn update(&mut self, step: &StepContext, ctx: &mut Context) -> Result<()> {
        let start = Instant::now();

        for obstacle in &mut self.obstacles {
            obstacle.update(step, ctx)?;
        }
        ctx.profiler.record(MetricEvent::Work("update", start, Instant::now()));
        Ok(())
    }


    /**
     * The first pair of obstacles `(i, j)`, with `j < i`, whose block maps on
     * this rank share a block.
     */
    pub fn colliding_obstacles(&self) -> Option<(usize, usize)> {
        self.pairs().find(|&(i, j)| self.collide(i, j))
    }


    /**
     * Like [`Self::colliding_obstacles`], but over the block maps of all
     * ranks, so that every rank reports the same pair. Collective.
     */
    pub fn colliding_obstacles_global<C: Communicator>(&self, comm: &C, ctx: &mut Context) -> Option<(usize, usize)> {
        let pairs: Vec<_> = self.pairs().collect();
        let local: Vec<_> = pairs
            .iter()
            .map(|&(i, j)| if self.collide(i, j) { 1.0 } else { 0.0 })
            .collect();

        let start = Instant::now();
        let global = comm.all_reduce_max(&local);
        ctx.profiler.record(MetricEvent::Network(start, Instant::now()));

        pairs.into_iter().zip(global).find(|(_, flag)| *flag > 0.0).map(|(pair, _)| pair)
    }


    fn pairs(&self) -> impl Iterator<Item = (usize, usize)> {
        (1..self.obstacles.len()).flat_map(|i| (0..i).map(move |j| (i, j)))
    }


    fn collide(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.obstacles[i].blocks(), self.obstacles[j].blocks());
        a.keys().any(|id| b.contains_key(id))
    }


    /**
     * The blocks on this rank touched by any obstacle, sorted and without
     * repetitions.
     */
    pub fn intersecting_block_ids(&self) -> Vec<BlockId> {
        self.obstacles
            .iter()
            .flat_map(|o| o.block_ids())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }


    /**
     * The largest characteristic length among the obstacles, or zero if
     * there are none.
     */
    pub fn length(&self) -> f64 {
        self.obstacles.iter().map(|o| o.length()).fold(0.0, f64::max)
    }


    /**
     * Background flow velocity that keeps the computational frame attached
     * to the obstacles that ask for it: on an axis where an obstacle fixes
     * the frame of reference, the flow moves at minus its velocity. If more
     * than one obstacle fixes the same axis, the first one wins.
     */
    pub fn frame_velocity(&self) -> [f64; 3] {
        let mut uinf = [0.0; 3];

        for d in 0..3 {
            if let Some(o) = self.obstacles.iter().find(|o| o.args().fix_frame_of_reference[d]) {
                uinf[d] = -o.state().trans_vel[d];
            }
        }
        uinf
    }


    fn restart_path(prefix: &Path, ordinal: usize) -> PathBuf {
        PathBuf::from(format!("{}_{:02}", prefix.display(), ordinal))
    }


    /**
     * Write one restart record per obstacle, at `{prefix}_{ordinal}`.
     */
    pub fn save(&self, time: f64, prefix: &Path) -> Result<()> {
        for (n, obstacle) in self.obstacles.iter().enumerate() {
            obstacle.save(time, &Self::restart_path(prefix, n))?;
        }
        Ok(())
    }


    /**
     * Restore every obstacle from the files written by [`Self::save`].
     * Returns the number of obstacles that found a record; the others keep
     * their initial state.
     */
    pub fn restart(&mut self, prefix: &Path, rank: usize) -> Result<usize> {
        let mut restored = 0;

        for (n, obstacle) in self.obstacles.iter_mut().enumerate() {
            if obstacle.restart(&Self::restart_path(prefix, n))? {
                restored += 1;
            }
        }
        if rank == 0 {
            info!("restarted {} of {} obstacles from {}", restored, self.obstacles.len(), prefix.display());
        }
        Ok(restored)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::{Arc, Mutex};
    use std::thread;
    use super::*;
    use crate::config::{EngineConfig, ObstacleArguments, ObstacleConfig};
    use crate::engine::Kernel;
    use crate::geometry::{BoundingBox, Cylinder, Geometry, Pose, Section, Sphere};
    use crate::grid::{BlockGrid, Boundary, GridSpec};
    use crate::kernels::{self, Enstrophy};
    use crate::message::LocalCommunicator;
    use crate::obstacle::Stage;

    fn spec() -> GridSpec {
        GridSpec {
            blocks_per_dim: [4, 4, 4],
            block_size: 4,
            h: 0.125,
            origin: [0.0; 3],
            boundary: Boundary::ZeroGradient,
        }
    }

    fn sphere(id: usize, position: [f64; 3], radius: f64) -> Obstacle {
        let args = ObstacleArguments { length: 2.0 * radius, position, ..Default::default() };
        Obstacle::new(id, args, Box::new(Sphere::new(radius)), ObstacleConfig::default()).unwrap()
    }

    fn engine() -> Engine {
        Engine::new(&EngineConfig { num_threads: 2, pin_threads: false }).unwrap()
    }

    fn vector(obstacles: Vec<Obstacle>) -> ObstacleVector {
        let mut v = ObstacleVector::new();
        for o in obstacles {
            v.push(o);
        }
        v
    }

    struct Recording {
        sphere: Sphere,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Geometry for Recording {
        fn bounding_box(&self, pose: &Pose) -> BoundingBox {
            self.sphere.bounding_box(pose)
        }

        fn signed_distance(&self, pose: &Pose, x: [f64; 3]) -> f64 {
            self.sphere.signed_distance(pose, x)
        }

        fn length(&self) -> f64 {
            self.sphere.length()
        }

        fn finalize(&mut self, _: &StepContext) {
            self.log.lock().unwrap().push("finalize");
        }
    }

    #[test]
    fn issue_runs_once_between_chi_and_finalize() {
        let engine = engine();
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let mut ctx = Context::quiet(0);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut v = ObstacleVector::new();
        for (id, position) in [[0.5; 3], [1.5; 3]].into_iter().enumerate() {
            let geometry = Recording { sphere: Sphere::new(0.3), log: log.clone() };
            let args = ObstacleArguments { length: 0.6, position, ..Default::default() };
            v.push(Obstacle::new(id, args, Box::new(geometry), ObstacleConfig::default()).unwrap());
        }

        let stencil = Enstrophy::default().stencil();
        let token = v
            .create(&engine, &mut grid, &comm, &StepContext::default(), &mut ctx, |grid| {
                log.lock().unwrap().push("issue");
                grid.begin_halo_exchange(&stencil)
            })
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["issue", "finalize", "finalize"]);
        assert_eq!(token.num_inner() + token.num_halo(), grid.local_blocks().len());
        assert!(v.iter().all(|o| o.stage() == Stage::Finalized));
        assert_eq!(ctx.profiler.total("create").map(|t| t.0), Some(1));

        let epoch = token.epoch();
        assert_eq!(kernels::enstrophy(&engine, &mut grid, &comm, Some(token)).unwrap(), 0.0);
        assert_eq!(grid.halo_epoch(), epoch);
    }

    #[test]
    fn collisions_are_detected_from_shared_blocks() {
        let engine = engine();
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let mut ctx = Context::quiet(0);
        let step = StepContext::default();

        let mut apart = vector(vec![sphere(0, [0.25; 3], 0.1), sphere(1, [1.75; 3], 0.1)]);
        apart.create(&engine, &mut grid, &comm, &step, &mut ctx, |_| ()).unwrap();
        assert_eq!(apart.colliding_obstacles(), None);
        assert_eq!(apart.colliding_obstacles_global(&comm, &mut ctx), None);

        let mut close = vector(vec![
            sphere(0, [0.25; 3], 0.1),
            sphere(1, [1.75; 3], 0.1),
            sphere(2, [1.6; 3], 0.1),
        ]);
        close.create(&engine, &mut grid, &comm, &step, &mut ctx, |_| ()).unwrap();
        assert_eq!(close.colliding_obstacles(), Some((2, 1)));
        assert_eq!(close.colliding_obstacles_global(&comm, &mut ctx), Some((2, 1)));
    }

    #[test]
    fn global_collisions_agree_across_ranks() {
        let comms = LocalCommunicator::group(2);
        let grids = BlockGrid::partitioned(spec(), 2).unwrap();

        let handles: Vec<_> = comms
            .into_iter()
            .zip(grids)
            .map(|(comm, mut grid)| {
                thread::spawn(move || {
                    let engine = engine();
                    let mut ctx = Context::quiet(comm.rank());
                    let mut v = vector(vec![sphere(0, [0.3, 1.0, 1.0], 0.1), sphere(1, [0.6, 1.0, 1.0], 0.1)]);
                    v.create(&engine, &mut grid, &comm, &StepContext::default(), &mut ctx, |_| ()).unwrap();
                    (comm.rank(), v.colliding_obstacles(), v.colliding_obstacles_global(&comm, &mut ctx))
                })
            })
            .collect();

        for handle in handles {
            let (rank, local, global) = handle.join().unwrap();
            assert_eq!(global, Some((1, 0)));
            assert_eq!(local, if rank == 0 { Some((1, 0)) } else { None });
        }
    }

    #[test]
    fn block_ids_length_and_frame_velocity() {
        let engine = engine();
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let mut ctx = Context::quiet(0);

        let cylinder = Cylinder { radius: 0.2, halflength: 0.3, section: Section::D };
        let args = ObstacleArguments {
            length: 0.4,
            position: [1.0; 3],
            fix_frame_of_reference: [true, false, false],
            ..Default::default()
        };
        let mut moving = Obstacle::new(1, args, Box::new(cylinder), ObstacleConfig::default()).unwrap();
        moving.state_mut().trans_vel = [0.75, 0.5, 0.0];

        let mut v = vector(vec![sphere(0, [0.25; 3], 0.1), moving, sphere(2, [0.3; 3], 0.15)]);
        v.create(&engine, &mut grid, &comm, &StepContext::default(), &mut ctx, |_| ()).unwrap();

        let ids = v.intersecting_block_ids();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
        assert!(v.iter().all(|o| o.block_ids().all(|id| ids.contains(&id))));

        assert_eq!(v.length(), 0.4);
        assert_eq!(v.frame_velocity(), [-0.75, 0.0, 0.0]);
        assert_eq!(ObstacleVector::new().length(), 0.0);
    }

    #[test]
    fn characteristic_function_covers_all_obstacles() {
        let engine = engine();
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        grid.fill(|_| [0.0, 0.0, 0.0, 0.0, 0.7]);
        let mut ctx = Context::quiet(0);

        let mut v = vector(vec![sphere(0, [0.5625; 3], 0.25), sphere(1, [1.4375; 3], 0.25)]);
        v.create(&engine, &mut grid, &comm, &StepContext::default(), &mut ctx, |_| ()).unwrap();
        v.characteristic_function(&mut grid).unwrap();

        let chi = |global| {
            let (block, local) = grid.spec().resolve_cell(global);
            grid.block(grid.spec().block_id(block)).unwrap().get(local, field::CHI)
        };
        assert_eq!(chi((4, 4, 4)), 1.0);
        assert_eq!(chi((11, 11, 11)), 1.0);
        assert_eq!(chi((0, 15, 0)), 0.0);
    }

    #[test]
    fn restart_files_are_indexed_by_position() {
        let dir = std::env::temp_dir().join(format!("driftwood-vector-{}", std::process::id()));
        let prefix = dir.join("restart_obstacle");

        let mut a = vector(vec![sphere(7, [0.5; 3], 0.2), sphere(3, [1.5; 3], 0.2)]);
        a.get_mut(1).unwrap().state_mut().ang_vel = [0.0, 0.0, 2.0];
        a.save(0.25, &prefix).unwrap();
        assert!(dir.join("restart_obstacle_00").exists());
        assert!(dir.join("restart_obstacle_01").exists());

        let mut b = vector(vec![sphere(7, [0.0; 3], 0.2), sphere(3, [0.0; 3], 0.2), sphere(9, [0.0; 3], 0.2)]);
        assert_eq!(b.restart(&prefix, 0).unwrap(), 2);
        assert_eq!(b.get(0).unwrap().state().position, [0.5; 3]);
        assert_eq!(b.get(1).unwrap().state().ang_vel, [0.0, 0.0, 2.0]);
        assert_eq!(b.get(2).unwrap().state().position, [0.0; 3]);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
