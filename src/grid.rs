use std::collections::{BTreeSet, HashMap, HashSet};
use crossbeam_channel::{Receiver, Sender};
use log::debug;
use serde::{Deserialize, Serialize};
use crate::block::{field, BlockId, BlockInfo, FluidBlock};
use crate::engine::{Phase, Stencil};
use crate::error::{Error, Result};
use crate::index_space::IndexSpace;




/**
 * Treatment of stencil points that fall outside the domain.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Boundary {
    /// Copy the nearest cell inside the domain.
    ZeroGradient,
    /// Wrap around to the opposite side of the domain.
    Periodic,
}




/**
 * Describes a uniform, block-structured grid: the number of blocks on each
 * axis, the number of cells per block side, the grid spacing, the physical
 * position of the domain's lower corner, and the boundary treatment.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub blocks_per_dim: [usize; 3],
    pub block_size: usize,
    pub h: f64,
    pub origin: [f64; 3],
    pub boundary: Boundary,
}




// ============================================================================
impl GridSpec {


    pub fn validate(&self) -> Result<()> {
        if self.blocks_per_dim.iter().any(|&n| n == 0) || self.block_size == 0 {
            return Err(Error::Configuration("grid must have at least one cell".into()));
        }
        if !(self.h > 0.0 && self.h.is_finite()) {
            return Err(Error::Configuration(format!("grid spacing must be positive, got {}", self.h)));
        }
        Ok(())
    }


    /**
     * The index space of block coordinates.
     */
    pub fn block_space(&self) -> IndexSpace {
        let [l, m, n] = self.blocks_per_dim.map(|n| n as i64);
        IndexSpace::new(0..l, 0..m, 0..n)
    }


    /**
     * The index space of global cell indexes.
     */
    pub fn cell_space(&self) -> IndexSpace {
        let b = self.block_size as i64;
        let [l, m, n] = self.blocks_per_dim.map(|n| n as i64 * b);
        IndexSpace::new(0..l, 0..m, 0..n)
    }


    pub fn num_blocks(&self) -> usize {
        self.block_space().len()
    }


    /**
     * Physical extent of the domain on each axis.
     */
    pub fn extent(&self) -> [f64; 3] {
        self.blocks_per_dim.map(|n| (n * self.block_size) as f64 * self.h)
    }


    pub fn block_id(&self, index: (i64, i64, i64)) -> BlockId {
        BlockId(self.block_space().row_major_offset(index))
    }


    pub fn block_info(&self, index: (i64, i64, i64)) -> BlockInfo {
        let s = self.block_size as f64 * self.h;
        BlockInfo {
            id: self.block_id(index),
            index,
            origin: [
                self.origin[0] + index.0 as f64 * s,
                self.origin[1] + index.1 as f64 * s,
                self.origin[2] + index.2 as f64 * s,
            ],
            h: self.h,
            size: self.block_size,
        }
    }


    /**
     * The block at offset `delta` (each component in -1..=1) from the given
     * block, after applying the boundary condition. Returns `None` if the
     * neighbor lies outside a non-periodic domain.
     */
    pub fn neighbor(&self, index: (i64, i64, i64), delta: (i64, i64, i64)) -> Option<(i64, i64, i64)> {
        let [l, m, n] = self.blocks_per_dim.map(|n| n as i64);
        let wrap = |i: i64, n: i64| match self.boundary {
            Boundary::Periodic => Some(i.rem_euclid(n)),
            Boundary::ZeroGradient if (0..n).contains(&i) => Some(i),
            Boundary::ZeroGradient => None,
        };
        Some((
            wrap(index.0 + delta.0, l)?,
            wrap(index.1 + delta.1, m)?,
            wrap(index.2 + delta.2, n)?,
        ))
    }


    /**
     * The distinct blocks (other than itself) that a stencil evaluated on
     * the given block may read.
     */
    pub fn neighbors(&self, index: (i64, i64, i64)) -> BTreeSet<(i64, i64, i64)> {
        IndexSpace::new(-1..2, -1..2, -1..2)
            .iter()
            .filter_map(|delta| self.neighbor(index, delta))
            .filter(|&n| n != index)
            .collect()
    }


    /**
     * Map a global cell index, possibly outside the domain, to the block
     * coordinates and block-local index of the cell that supplies its value.
     */
    pub fn resolve_cell(&self, index: (i64, i64, i64)) -> ((i64, i64, i64), (i64, i64, i64)) {
        let b = self.block_size as i64;
        let [l, m, n] = self.blocks_per_dim.map(|n| n as i64 * b);
        let fold = |i: i64, n: i64| match self.boundary {
            Boundary::Periodic => i.rem_euclid(n),
            Boundary::ZeroGradient => i.clamp(0, n - 1),
        };
        let (i, j, k) = (fold(index.0, l), fold(index.1, m), fold(index.2, n));
        ((i / b, j / b, k / b), (i % b, j % b, k % b))
    }
}




/**
 * Returned by [`BlockSource::begin_halo_exchange`], and redeemed for ready
 * blocks in each phase.
 */
#[derive(Debug)]
pub struct SyncToken {
    epoch: u64,
    stencil: Stencil,
    inner: Vec<BlockInfo>,
    halo: Vec<BlockInfo>,
    awaited: HashSet<BlockId>,
}

impl SyncToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The stencil the exchange was started for.
    pub fn stencil(&self) -> &Stencil {
        &self.stencil
    }

    pub fn num_inner(&self) -> usize {
        self.inner.len()
    }

    pub fn num_halo(&self) -> usize {
        self.halo.len()
    }
}




/**
 * Interface to the partitioned grid and its halo exchange, as seen from one
 * rank. Blocks owned by this rank are readable and writable; blocks owned by
 * other ranks are readable after their delivery by a halo exchange.
 */
pub trait BlockSource {

    fn spec(&self) -> &GridSpec;

    /// The blocks owned by this rank, in ascending id order.
    fn local_blocks(&self) -> Vec<BlockInfo>;

    /// Read access to an owned block, or a ghost delivered by the most
    /// recent halo exchange.
    fn block(&self, id: BlockId) -> Option<&FluidBlock>;

    /// Write access to an owned block.
    fn block_mut(&mut self, id: BlockId) -> Option<&mut FluidBlock>;

    /// Start delivering the blocks that peers' stencils will need. The
    /// exchange is collective: every rank calls this in the same order.
    fn begin_halo_exchange(&mut self, stencil: &Stencil) -> SyncToken;

    /// The blocks that may be processed in the given phase. Inner blocks
    /// depend on no remote data. Asking for the halo blocks waits until all
    /// remote data they depend on has arrived.
    fn blocks_ready(&mut self, token: &mut SyncToken, phase: Phase) -> Result<Vec<BlockInfo>>;
}




type Envelope = (u64, BlockId, FluidBlock);




/**
 * An in-process implementation of [`BlockSource`]. The domain is cut into
 * slabs of blocks along the x axis, one slab per rank, and halo data travels
 * between ranks over crossbeam channels.
 */
pub struct BlockGrid {
    spec: GridSpec,
    rank: usize,
    num_ranks: usize,
    infos: Vec<BlockInfo>,
    blocks: HashMap<BlockId, FluidBlock>,
    ghosts: HashMap<BlockId, FluidBlock>,
    deferred: Vec<Envelope>,
    inbox: Receiver<Envelope>,
    outboxes: Vec<Sender<Envelope>>,
    epoch: u64,
}




// ============================================================================
impl BlockGrid {


    /**
     * A grid owned entirely by a single rank.
     */
    pub fn new(spec: GridSpec) -> Result<Self> {
        let mut grids = Self::partitioned(spec, 1)?;
        Ok(grids.remove(0))
    }


    /**
     * Partition the grid over `num_ranks` ranks. Element `r` of the returned
     * vector is the grid as seen from rank `r`.
     */
    pub fn partitioned(spec: GridSpec, num_ranks: usize) -> Result<Vec<Self>> {
        spec.validate()?;

        if num_ranks == 0 || spec.blocks_per_dim[0] < num_ranks {
            return Err(Error::Configuration(format!(
                "cannot partition {} block slabs over {} ranks",
                spec.blocks_per_dim[0], num_ranks)));
        }

        let (outboxes, inboxes): (Vec<_>, Vec<_>) =
            (0..num_ranks).map(|_| crossbeam_channel::unbounded()).unzip();

        let grids = inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                let infos: Vec<_> = spec
                    .block_space()
                    .iter()
                    .filter(|index| Self::owner_for(&spec, num_ranks, *index) == rank)
                    .map(|index| spec.block_info(index))
                    .collect();
                let blocks = infos
                    .iter()
                    .map(|info| (info.id, FluidBlock::zeros(spec.block_size)))
                    .collect();
                Self {
                    spec: spec.clone(),
                    rank,
                    num_ranks,
                    infos,
                    blocks,
                    ghosts: HashMap::new(),
                    deferred: Vec::new(),
                    inbox,
                    outboxes: outboxes.clone(),
                    epoch: 0,
                }
            })
            .collect();

        Ok(grids)
    }


    fn owner_for(spec: &GridSpec, num_ranks: usize, index: (i64, i64, i64)) -> usize {
        index.0 as usize * num_ranks / spec.blocks_per_dim[0]
    }


    /**
     * The rank owning the block with the given block coordinates.
     */
    pub fn owner(&self, index: (i64, i64, i64)) -> usize {
        Self::owner_for(&self.spec, self.num_ranks, index)
    }


    pub fn rank(&self) -> usize {
        self.rank
    }


    /// The number of halo exchanges started so far.
    pub fn halo_epoch(&self) -> u64 {
        self.epoch
    }


    /**
     * Set every field of every owned cell from a function of the cell
     * center.
     */
    pub fn fill<F>(&mut self, f: F)
    where
        F: Fn([f64; 3]) -> [f64; field::NUM_FIELDS],
    {
        for info in &self.infos {
            if let Some(block) = self.blocks.get_mut(&info.id) {
                *block = FluidBlock::from_function(info.size, |index| f(info.cell_center(index)));
            }
        }
    }
}




// ============================================================================
impl BlockSource for BlockGrid {

    fn spec(&self) -> &GridSpec {
        &self.spec
    }

    fn local_blocks(&self) -> Vec<BlockInfo> {
        self.infos.clone()
    }

    fn block(&self, id: BlockId) -> Option<&FluidBlock> {
        self.blocks.get(&id).or_else(|| self.ghosts.get(&id))
    }

    fn block_mut(&mut self, id: BlockId) -> Option<&mut FluidBlock> {
        self.blocks.get_mut(&id)
    }

    fn begin_halo_exchange(&mut self, stencil: &Stencil) -> SyncToken {
        self.epoch += 1;
        self.ghosts.clear();

        let mut token = SyncToken {
            epoch: self.epoch,
            stencil: stencil.clone(),
            inner: Vec::new(),
            halo: Vec::new(),
            awaited: HashSet::new(),
        };

        if stencil.half_width == 0 {
            token.inner = self.infos.clone();
            return token;
        }

        for info in &self.infos {
            let remote: Vec<_> = self
                .spec
                .neighbors(info.index)
                .into_iter()
                .filter(|&n| self.owner(n) != self.rank)
                .collect();

            let destinations: BTreeSet<_> = remote.iter().map(|&n| self.owner(n)).collect();

            for rank in destinations {
                let block = self.blocks[&info.id].clone();
                // A peer only hangs up once its grid is dropped, after the
                // last collective; nothing is waiting for this message then.
                let _ = self.outboxes[rank].send((self.epoch, info.id, block));
            }

            if remote.is_empty() {
                token.inner.push(info.clone());
            } else {
                token.awaited.extend(remote.iter().map(|&n| self.spec.block_id(n)));
                token.halo.push(info.clone());
            }
        }

        let epoch = self.epoch;
        for (e, id, block) in std::mem::take(&mut self.deferred) {
            if e == epoch {
                self.ghosts.insert(id, block);
            } else if e > epoch {
                self.deferred.push((e, id, block));
            }
        }

        debug!(
            "rank {} halo exchange {}: {} inner, {} halo, {} ghosts awaited",
            self.rank, self.epoch, token.inner.len(), token.halo.len(), token.awaited.len());

        token
    }

    fn blocks_ready(&mut self, token: &mut SyncToken, phase: Phase) -> Result<Vec<BlockInfo>> {
        if token.epoch != self.epoch {
            return Err(Error::Configuration(format!(
                "halo exchange {} was superseded by exchange {}", token.epoch, self.epoch)));
        }
        match phase {
            Phase::Inner => Ok(std::mem::take(&mut token.inner)),
            Phase::Halo => {
                token.awaited.retain(|id| !self.ghosts.contains_key(id));

                loop {
                    let missing = match token.awaited.iter().next() {
                        Some(&id) => id,
                        None => break,
                    };
                    let (epoch, id, block) = self.inbox.recv().map_err(|_| Error::MissingGhost(missing))?;

                    if epoch == token.epoch {
                        token.awaited.remove(&id);
                        self.ghosts.insert(id, block);
                    } else if epoch > token.epoch {
                        self.deferred.push((epoch, id, block));
                    }
                }
                Ok(std::mem::take(&mut token.halo))
            }
        }
    }
}
