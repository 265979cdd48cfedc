use std::collections::{BTreeMap, HashMap};
use log::{debug, warn};
use crate::block::{BlockId, BlockInfo};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::grid::{BlockSource, SyncToken};
use crate::lab::Lab;
use crate::message::Communicator;
use crate::obstacle::ObstacleBlock;




/**
 * The two halves of a kernel sweep. Inner blocks depend only on data owned
 * by this rank; halo blocks need ghost data from peers.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Inner,
    Halo,
}




/**
 * Restriction of an obstacle kernel sweep: every block the obstacle touches,
 * or only those containing surface points.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Integral {
    Volume,
    Surface,
}




/**
 * The neighborhood a kernel reads: the half-width of the stencil (the same
 * on every axis) and the fields it accesses.
 */
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stencil {
    pub half_width: usize,
    pub fields: Vec<usize>,
}

impl Stencil {
    pub fn new(half_width: usize, fields: Vec<usize>) -> Self {
        Self { half_width, fields }
    }

    /// Whether data exchanged for this stencil is enough for `other`.
    pub fn covers(&self, other: &Stencil) -> bool {
        self.half_width >= other.half_width && other.fields.iter().all(|f| self.fields.contains(f))
    }
}




/**
 * A kernel applied to every block owned by this rank. Each worker thread owns
 * one instance, so kernels may accumulate into their own fields; the caller
 * combines the instances after the sweep returns.
 */
pub trait Kernel {
    fn stencil(&self) -> Stencil;
    fn apply(&mut self, lab: &Lab, info: &BlockInfo);
}




/**
 * A kernel applied to the blocks an obstacle touches. The kernel is handed
 * exclusive access to that obstacle's data for the block.
 */
pub trait ObstacleKernel {
    fn stencil(&self) -> Stencil;
    fn apply(&mut self, lab: &Lab, info: &BlockInfo, block: &mut ObstacleBlock);
}




/**
 * Executes kernels over the local blocks with a fixed pool of worker
 * threads, overlapping the halo exchange with work on the inner blocks.
 */
pub struct Engine {
    pool: rayon::ThreadPool,
}




// ============================================================================
impl Engine {


    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("driftwood-worker-{}", i));

        if config.pin_threads {
            let cores = core_affinity::get_core_ids().unwrap_or_default();

            if cores.is_empty() {
                warn!("core pinning requested but no core ids are available");
            } else {
                builder = builder.start_handler(move |i| core_affinity::set_for_current(cores[i % cores.len()]));
            }
        }

        let pool = builder
            .build()
            .map_err(|e| Error::Configuration(format!("could not start worker pool: {}", e)))?;

        Ok(Self { pool })
    }


    pub fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }


    /**
     * Create one kernel instance per worker.
     */
    pub fn kernels<K, F: Fn() -> K>(&self, f: F) -> Vec<K> {
        (0..self.num_workers()).map(|_| f()).collect()
    }


    /**
     * Run a closure inside the worker pool, so that rayon parallel iterators
     * it uses are executed by the engine's workers.
     */
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }


    /**
     * Apply the kernels to every block owned by this rank. Each block is
     * visited by exactly one kernel instance. Returns after every worker has
     * finished and all ranks have passed the closing barrier.
     */
    pub fn compute<G, C, K>(&self, grid: &mut G, comm: &C, kernels: &mut [K]) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
        K: Kernel + Send,
    {
        let stencil = Self::common_stencil(kernels.iter().map(|k| k.stencil()))?;

        self.execute(grid, comm, &stencil, None, kernels, |_| Some(()), |kernel, lab, info, ()| {
            kernel.apply(lab, info)
        })
    }


    /**
     * Like [`Self::compute`], but redeems a halo exchange the caller started
     * earlier with [`BlockSource::begin_halo_exchange`], so that the
     * exchange could overlap other work. The token's stencil must cover the
     * kernels' stencil, and no other exchange may have been started since.
     */
    pub fn compute_issued<G, C, K>(&self, grid: &mut G, comm: &C, kernels: &mut [K], token: SyncToken) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
        K: Kernel + Send,
    {
        let stencil = Self::common_stencil(kernels.iter().map(|k| k.stencil()))?;

        if !token.stencil().covers(&stencil) {
            return Err(Error::Configuration(format!(
                "halo exchange issued for {:?} cannot serve a kernel reading {:?}",
                token.stencil(), stencil)));
        }
        self.execute(grid, comm, &stencil, Some(token), kernels, |_| Some(()), |kernel, lab, info, ()| {
            kernel.apply(lab, info)
        })
    }


    /**
     * Apply obstacle kernels to the blocks present in `blocks`; in surface
     * mode, blocks without surface points are skipped as well.
     */
    pub fn compute_restricted<G, C, K>(
        &self,
        grid: &mut G,
        comm: &C,
        kernels: &mut [K],
        blocks: &mut BTreeMap<BlockId, ObstacleBlock>,
        integral: Integral,
    ) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
        K: ObstacleKernel + Send,
    {
        let stencil = Self::common_stencil(kernels.iter().map(|k| k.stencil()))?;

        let mut pending: HashMap<BlockId, &mut ObstacleBlock> = blocks
            .iter_mut()
            .filter(|(_, b)| integral == Integral::Volume || !b.surface.is_empty())
            .map(|(id, b)| (*id, b))
            .collect();

        self.execute(grid, comm, &stencil, None, kernels, |info| pending.remove(&info.id), |kernel, lab, info, block| {
            kernel.apply(lab, info, block)
        })
    }


    fn common_stencil<I: Iterator<Item = Stencil>>(mut stencils: I) -> Result<Stencil> {
        let first = stencils
            .next()
            .ok_or_else(|| Error::Configuration("at least one kernel instance is required".into()))?;

        if stencils.any(|s| s != first) {
            return Err(Error::Configuration("kernel instances disagree on their stencil".into()));
        }
        Ok(first)
    }


    /**
     * Drive the inner and halo phases, starting a halo exchange unless one
     * was issued already. `select` decides whether a ready block is visited
     * and yields the payload handed to the worker with it; `visit` runs on a
     * worker thread.
     */
    fn execute<G, C, W, P, S, F>(
        &self,
        grid: &mut G,
        comm: &C,
        stencil: &Stencil,
        issued: Option<SyncToken>,
        workers: &mut [W],
        mut select: S,
        visit: F,
    ) -> Result<()>
    where
        G: BlockSource + Sync,
        C: Communicator,
        W: Send,
        P: Send,
        S: FnMut(&BlockInfo) -> Option<P>,
        F: Fn(&mut W, &Lab, &BlockInfo, P) + Sync,
    {
        let block_size = grid.spec().block_size;

        // Ghosts are taken from adjacent blocks only.
        if stencil.half_width > block_size {
            return Err(Error::Configuration(format!(
                "stencil half-width {} exceeds the block size {}", stencil.half_width, block_size)));
        }
        let mut labs: Vec<_> = workers.iter().map(|_| Lab::new(stencil, block_size)).collect();

        let mut token = match issued {
            Some(token) => token,
            None => grid.begin_halo_exchange(stencil),
        };
        comm.barrier();

        let inner: Vec<_> = grid
            .blocks_ready(&mut token, Phase::Inner)?
            .into_iter()
            .filter_map(|info| select(&info).map(|p| (info, p)))
            .collect();
        let num_inner = inner.len();
        let inner_result = self.run_phase(&*grid, workers, &mut labs, inner, &visit);

        let halo: Vec<_> = grid
            .blocks_ready(&mut token, Phase::Halo)?
            .into_iter()
            .filter_map(|info| select(&info).map(|p| (info, p)))
            .collect();
        let num_halo = halo.len();
        let halo_result = self.run_phase(&*grid, workers, &mut labs, halo, &visit);

        comm.barrier();
        debug!("rank {} visited {} inner and {} halo blocks", comm.rank(), num_inner, num_halo);

        inner_result.and(halo_result)
    }


    fn run_phase<G, W, P, F>(
        &self,
        grid: &G,
        workers: &mut [W],
        labs: &mut [Lab],
        items: Vec<(BlockInfo, P)>,
        visit: &F,
    ) -> Result<()>
    where
        G: BlockSource + Sync,
        W: Send,
        P: Send,
        F: Fn(&mut W, &Lab, &BlockInfo, P) + Sync,
    {
        if items.is_empty() {
            return Ok(());
        }
        let (work_sink, work_source) = crossbeam_channel::unbounded();
        let (error_sink, error_source) = crossbeam_channel::unbounded();

        for item in items {
            // The receiving end is held above, so the send cannot fail.
            let _ = work_sink.send(item);
        }
        drop(work_sink);

        self.pool.scope(|scope| {
            for (worker, lab) in workers.iter_mut().zip(labs.iter_mut()) {
                let work_source = work_source.clone();
                let error_sink = error_sink.clone();

                scope.spawn(move |_| {
                    for (info, payload) in work_source {
                        match lab.load(grid, &info) {
                            Ok(()) => visit(worker, lab, &info, payload),
                            Err(e) => {
                                let _ = error_sink.send(e);
                            }
                        }
                    }
                });
            }
        });
        drop(error_sink);

        match error_source.try_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::collections::BTreeSet;
    use std::thread;
    use super::*;
    use crate::block::field;
    use crate::config::EngineConfig;
    use crate::geometry::{Pose, Sphere};
    use crate::grid::{BlockGrid, Boundary, GridSpec};
    use crate::message::LocalCommunicator;

    struct Visits {
        seen: Vec<BlockId>,
        sum: f64,
    }

    impl Kernel for Visits {
        fn stencil(&self) -> Stencil {
            Stencil::new(1, vec![field::U])
        }

        fn apply(&mut self, lab: &Lab, info: &BlockInfo) {
            self.seen.push(info.id);
            self.sum += lab.get((-1, 0, 0), field::U);
        }
    }

    struct Wide;

    impl Kernel for Wide {
        fn stencil(&self) -> Stencil {
            Stencil::new(5, vec![field::U])
        }

        fn apply(&mut self, _: &Lab, _: &BlockInfo) {}
    }

    #[derive(Default)]
    struct Touches {
        seen: Vec<(BlockId, BlockId)>,
    }

    impl ObstacleKernel for Touches {
        fn stencil(&self) -> Stencil {
            Stencil::new(1, vec![field::U])
        }

        fn apply(&mut self, _: &Lab, info: &BlockInfo, block: &mut ObstacleBlock) {
            self.seen.push((info.id, block.info.id));
        }
    }

    fn spec() -> GridSpec {
        GridSpec {
            blocks_per_dim: [4, 2, 2],
            block_size: 4,
            h: 0.25,
            origin: [0.0; 3],
            boundary: Boundary::Periodic,
        }
    }

    #[test]
    fn each_block_is_visited_exactly_once_across_ranks() {
        let comms = LocalCommunicator::group(2);
        let grids = BlockGrid::partitioned(spec(), 2).unwrap();

        let handles: Vec<_> = comms
            .into_iter()
            .zip(grids)
            .map(|(comm, mut grid)| {
                thread::spawn(move || {
                    grid.fill(|_| [1.0, 0.0, 0.0, 0.0, 0.0]);
                    let engine = Engine::new(&EngineConfig { num_threads: 3, pin_threads: false }).unwrap();
                    let mut kernels = engine.kernels(|| Visits { seen: Vec::new(), sum: 0.0 });
                    engine.compute(&mut grid, &comm, &mut kernels).unwrap();

                    let seen: Vec<_> = kernels.iter().flat_map(|k| k.seen.iter().cloned()).collect();
                    let sum: f64 = kernels.iter().map(|k| k.sum).sum();
                    let local: BTreeSet<_> = grid.local_blocks().iter().map(|b| b.id).collect();
                    assert_eq!(seen.len(), local.len());
                    assert_eq!(seen.iter().cloned().collect::<BTreeSet<_>>(), local);
                    assert_eq!(sum, local.len() as f64);
                    seen
                })
            })
            .collect();

        let all: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 16);
        assert_eq!(unique.len(), 16);
    }

    #[test]
    fn non_finite_field_is_reported_after_the_sweep() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let id = grid.local_blocks()[5].id;
        *grid.block_mut(id).unwrap().get_mut((0, 0, 0), field::U) = f64::NAN;

        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut kernels = engine.kernels(|| Visits { seen: Vec::new(), sum: 0.0 });
        let result = engine.compute(&mut grid, &comm, &mut kernels);
        assert!(matches!(result, Err(Error::NumericalDivergence { block, .. }) if block == id));
    }

    #[test]
    fn kernels_must_share_a_stencil() {
        assert!(Engine::common_stencil(std::iter::empty()).is_err());
        let a = Stencil::new(1, vec![field::U]);
        let b = Stencil::new(0, vec![field::U]);
        assert!(Engine::common_stencil(vec![a.clone(), a.clone()].into_iter()).is_ok());
        assert!(Engine::common_stencil(vec![a, b].into_iter()).is_err());
    }

    #[test]
    fn restricted_sweeps_visit_only_the_selected_blocks() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let sphere = Sphere::new(0.4);
        let pose = Pose { position: [1.0; 3], ..Default::default() };

        let mut blocks: BTreeMap<_, _> = grid
            .local_blocks()
            .into_iter()
            .filter(|info| info.index.0 < 3)
            .map(|info| {
                let mut block = ObstacleBlock::new(info.clone(), &sphere, &pose, 0.0);
                block.compute_chi(std::f64::consts::SQRT_2 * info.h);
                (info.id, block)
            })
            .collect();
        let surface: BTreeSet<_> = blocks.iter().filter(|(_, b)| !b.surface.is_empty()).map(|(id, _)| *id).collect();
        assert_eq!(blocks.len(), 12);
        assert!(!surface.is_empty() && surface.len() < blocks.len());
        assert!(blocks.len() < grid.local_blocks().len());

        let engine = Engine::new(&EngineConfig { num_threads: 3, pin_threads: false }).unwrap();

        for (integral, expected) in [
            (Integral::Surface, surface),
            (Integral::Volume, blocks.keys().cloned().collect()),
        ] {
            let mut kernels = engine.kernels(Touches::default);
            engine.compute_restricted(&mut grid, &comm, &mut kernels, &mut blocks, integral).unwrap();

            let seen: Vec<_> = kernels.iter().flat_map(|k| k.seen.iter().cloned()).collect();
            assert!(seen.iter().all(|(a, b)| a == b));
            assert_eq!(seen.len(), expected.len());
            assert_eq!(seen.iter().map(|(a, _)| *a).collect::<BTreeSet<_>>(), expected);
        }
    }

    #[test]
    fn pre_issued_exchange_is_redeemed_by_the_sweep() {
        let comms = LocalCommunicator::group(2);
        let grids = BlockGrid::partitioned(spec(), 2).unwrap();

        let handles: Vec<_> = comms
            .into_iter()
            .zip(grids)
            .map(|(comm, mut grid)| {
                thread::spawn(move || {
                    grid.fill(|_| [1.0, 0.0, 0.0, 0.0, 0.0]);
                    let engine = Engine::new(&EngineConfig { num_threads: 2, pin_threads: false }).unwrap();
                    let token = grid.begin_halo_exchange(&Stencil::new(1, vec![field::U, field::P]));
                    let epoch = token.epoch();

                    let mut kernels = engine.kernels(|| Visits { seen: Vec::new(), sum: 0.0 });
                    engine.compute_issued(&mut grid, &comm, &mut kernels, token).unwrap();

                    let sum: f64 = kernels.iter().map(|k| k.sum).sum();
                    assert_eq!(grid.halo_epoch(), epoch);
                    assert_eq!(sum, grid.local_blocks().len() as f64);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn issued_exchange_must_cover_the_kernel_stencil() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let token = grid.begin_halo_exchange(&Stencil::new(0, vec![field::U]));

        let mut kernels = engine.kernels(|| Visits { seen: Vec::new(), sum: 0.0 });
        let result = engine.compute_issued(&mut grid, &comm, &mut kernels, token);
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(kernels.iter().all(|k| k.seen.is_empty()));
    }

    #[test]
    fn stencils_wider_than_a_block_are_rejected() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mut grid = BlockGrid::new(spec()).unwrap();
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let mut kernels = engine.kernels(|| Wide);
        assert!(matches!(engine.compute(&mut grid, &comm, &mut kernels), Err(Error::Configuration(_))));
    }
}
