use crate::block::{field, BlockInfo};
use crate::engine::Stencil;
use crate::error::{Error, Result};
use crate::grid::BlockSource;
use crate::index_space::IndexSpace;




/**
 * A worker's private stencil cache. Loading a block copies its cells, plus a
 * layer of halo cells as wide as the stencil, into a contiguous buffer that
 * kernels address with block-local indexes. Indexes in the halo layer are
 * negative or at least the block size.
 */
pub struct Lab {
    stencil: Stencil,
    space: IndexSpace,
    data: Vec<f64>,
}




// ============================================================================
impl Lab {


    pub fn new(stencil: &Stencil, block_size: usize) -> Self {
        let space = IndexSpace::cube(block_size).extend_all(stencil.half_width as i64);
        let data = vec![0.0; space.len() * field::NUM_FIELDS];
        Self { stencil: stencil.clone(), space, data }
    }


    pub fn stencil(&self) -> &Stencil {
        &self.stencil
    }


    /**
     * Refresh the cache for the given block. Fails if a field the stencil
     * reads holds a non-finite value in the block, or if a neighbor block is
     * neither owned nor delivered by the halo exchange.
     */
    pub fn load<G: BlockSource + ?Sized>(&mut self, grid: &G, info: &BlockInfo) -> Result<()> {
        let block = grid.block(info.id).ok_or(Error::MissingGhost(info.id))?;
        let interior = block.space();

        for &f in &self.stencil.fields {
            if interior.iter().any(|index| !block.get(index, f).is_finite()) {
                return Err(Error::NumericalDivergence { block: info.id, field: field::name(f) });
            }
        }

        let n = info.size as i64;
        let offset = (info.index.0 * n, info.index.1 * n, info.index.2 * n);
        let spec = grid.spec();

        for index in self.space.iter() {
            let cell = if interior.contains(index) {
                block.cell(index)
            } else {
                let global = (index.0 + offset.0, index.1 + offset.1, index.2 + offset.2);
                let (block_index, local) = spec.resolve_cell(global);
                let id = spec.block_id(block_index);
                grid.block(id).ok_or(Error::MissingGhost(id))?.cell(local)
            };
            let m = self.space.row_major_offset(index) * field::NUM_FIELDS;
            self.data[m..m + field::NUM_FIELDS].copy_from_slice(cell);
        }
        Ok(())
    }


    pub fn get(&self, index: (i64, i64, i64), field: usize) -> f64 {
        self.data[self.space.row_major_offset(index) * field::NUM_FIELDS + field]
    }


    pub fn velocity(&self, index: (i64, i64, i64)) -> [f64; 3] {
        let m = self.space.row_major_offset(index) * field::NUM_FIELDS;
        [self.data[m + field::U], self.data[m + field::V], self.data[m + field::W]]
    }


    pub fn pressure(&self, index: (i64, i64, i64)) -> f64 {
        self.get(index, field::P)
    }


    /**
     * Central-difference velocity gradient `du_i/dx_j` at a cell. Requires a
     * stencil half-width of at least one.
     */
    pub fn velocity_gradient(&self, index: (i64, i64, i64), h: f64) -> [[f64; 3]; 3] {
        let (i, j, k) = index;
        let neighbors = [
            ((i + 1, j, k), (i - 1, j, k)),
            ((i, j + 1, k), (i, j - 1, k)),
            ((i, j, k + 1), (i, j, k - 1)),
        ];
        let mut g = [[0.0; 3]; 3];

        for (d, (plus, minus)) in neighbors.iter().enumerate() {
            let up = self.velocity(*plus);
            let um = self.velocity(*minus);
            for c in 0..3 {
                g[c][d] = (up[c] - um[c]) / (2.0 * h);
            }
        }
        g
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Lab;
    use crate::block::field;
    use crate::engine::Stencil;
    use crate::error::Error;
    use crate::grid::{BlockGrid, BlockSource, Boundary, GridSpec};

    fn grid(boundary: Boundary) -> BlockGrid {
        let mut grid = BlockGrid::new(GridSpec {
            blocks_per_dim: [2, 2, 2],
            block_size: 4,
            h: 0.125,
            origin: [0.0; 3],
            boundary,
        })
        .unwrap();
        grid.fill(|x| [x[0], x[1], x[2], 1.0, 0.0]);
        grid
    }

    #[test]
    fn lab_reads_across_block_boundaries() {
        let grid = grid(Boundary::ZeroGradient);
        let info = &grid.local_blocks()[0];
        let mut lab = Lab::new(&Stencil::new(1, vec![field::U, field::V, field::W]), 4);
        lab.load(&grid, info).unwrap();

        assert_eq!(lab.get((4, 0, 0), field::U), 4.5 * 0.125);
        assert_eq!(lab.get((-1, 0, 0), field::U), 0.5 * 0.125);
        let g = lab.velocity_gradient((3, 1, 1), 0.125);
        assert!((g[0][0] - 1.0).abs() < 1e-14 && g[0][1].abs() < 1e-14 && (g[2][2] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn periodic_lab_wraps_around() {
        let grid = grid(Boundary::Periodic);
        let info = &grid.local_blocks()[0];
        let mut lab = Lab::new(&Stencil::new(1, vec![field::U]), 4);
        lab.load(&grid, info).unwrap();
        assert_eq!(lab.get((-1, 0, 0), field::U), 7.5 * 0.125);
    }

    #[test]
    fn non_finite_values_are_reported() {
        let mut grid = grid(Boundary::Periodic);
        let info = grid.local_blocks()[3].clone();
        *grid.block_mut(info.id).unwrap().get_mut((1, 2, 3), field::P) = f64::INFINITY;

        let mut lab = Lab::new(&Stencil::new(0, vec![field::U]), 4);
        assert!(lab.load(&grid, &info).is_ok());

        let mut lab = Lab::new(&Stencil::new(0, vec![field::P]), 4);
        assert!(matches!(lab.load(&grid, &info), Err(Error::NumericalDivergence { field: "p", .. })));
    }
}
