use serde::{Deserialize, Serialize};
use crate::geometry::BoundingBox;
use crate::index_space::IndexSpace;




/// Field slots stored per cell in a [`FluidBlock`].
pub mod field {
    pub const U: usize = 0;
    pub const V: usize = 1;
    pub const W: usize = 2;
    pub const P: usize = 3;
    pub const CHI: usize = 4;
    pub const NUM_FIELDS: usize = 5;

    pub fn name(field: usize) -> &'static str {
        match field {
            U => "u",
            V => "v",
            W => "w",
            P => "p",
            CHI => "chi",
            _ => "unknown",
        }
    }
}




/**
 * Globally unique identifier of a block in the grid. Identifiers are the
 * row-major offset of the block coordinates in the grid's block index space,
 * so every rank agrees on them without communication.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub usize);




/**
 * Opaque handle to a block: its identifier, block coordinates, the physical
 * position of its lower corner, the grid spacing `h`, and the number of cells
 * per side.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub index: (i64, i64, i64),
    pub origin: [f64; 3],
    pub h: f64,
    pub size: usize,
}




// ============================================================================
impl BlockInfo {


    /**
     * The cells of this block, in block-local indexes.
     */
    pub fn cells(&self) -> IndexSpace {
        IndexSpace::cube(self.size)
    }


    /**
     * The cells of this block, in global cell indexes.
     */
    pub fn global_cells(&self) -> IndexSpace {
        let n = self.size as i64;
        self.cells().translate((self.index.0 * n, self.index.1 * n, self.index.2 * n))
    }


    /**
     * Physical position of the center of a (block-local) cell. The index may
     * lie outside the block, which is useful for stencil points in the halo.
     */
    pub fn cell_center(&self, index: (i64, i64, i64)) -> [f64; 3] {
        [
            self.origin[0] + (index.0 as f64 + 0.5) * self.h,
            self.origin[1] + (index.1 as f64 + 0.5) * self.h,
            self.origin[2] + (index.2 as f64 + 0.5) * self.h,
        ]
    }


    pub fn cell_volume(&self) -> f64 {
        self.h * self.h * self.h
    }


    /**
     * The physical extent covered by this block's cells.
     */
    pub fn bounds(&self) -> BoundingBox {
        let extent = self.h * self.size as f64;
        BoundingBox::new(self.origin, [
            self.origin[0] + extent,
            self.origin[1] + extent,
            self.origin[2] + extent,
        ])
    }
}




/**
 * Per-cell fluid state of one block: velocity, pressure, and the
 * characteristic function rasterized by the obstacles. Data is stored
 * cell-major, with all fields of a cell adjacent in memory.
 */
#[derive(Clone, Debug)]
pub struct FluidBlock {
    space: IndexSpace,
    data: Vec<f64>,
}




// ============================================================================
impl FluidBlock {


    pub fn zeros(size: usize) -> Self {
        let space = IndexSpace::cube(size);
        let data = vec![0.0; space.len() * field::NUM_FIELDS];
        Self { space, data }
    }


    /**
     * Generate a block with values defined from a closure of the block-local
     * cell index.
     */
    pub fn from_function<F>(size: usize, f: F) -> Self
    where
        F: Fn((i64, i64, i64)) -> [f64; field::NUM_FIELDS],
    {
        let space = IndexSpace::cube(size);
        let data = space.iter().flat_map(|index| f(index)).collect();
        Self { space, data }
    }


    pub fn space(&self) -> &IndexSpace {
        &self.space
    }


    pub fn size(&self) -> usize {
        self.space.dim().0
    }


    pub fn get(&self, index: (i64, i64, i64), field: usize) -> f64 {
        self.data[self.space.row_major_offset(index) * field::NUM_FIELDS + field]
    }


    pub fn get_mut(&mut self, index: (i64, i64, i64), field: usize) -> &mut f64 {
        let n = self.space.row_major_offset(index) * field::NUM_FIELDS + field;
        &mut self.data[n]
    }


    /**
     * All fields of the cell at the given block-local index.
     */
    pub fn cell(&self, index: (i64, i64, i64)) -> &[f64] {
        let n = self.space.row_major_offset(index) * field::NUM_FIELDS;
        &self.data[n..n + field::NUM_FIELDS]
    }


    pub fn velocity(&self, index: (i64, i64, i64)) -> [f64; 3] {
        let c = self.cell(index);
        [c[field::U], c[field::V], c[field::W]]
    }


    pub fn set_velocity(&mut self, index: (i64, i64, i64), u: [f64; 3]) {
        let n = self.space.row_major_offset(index) * field::NUM_FIELDS;
        self.data[n + field::U] = u[0];
        self.data[n + field::V] = u[1];
        self.data[n + field::W] = u[2];
    }


    /**
     * Set one field to a constant value in every cell.
     */
    pub fn fill(&mut self, field: usize, value: f64) {
        for cell in self.data.chunks_exact_mut(field::NUM_FIELDS) {
            cell[field] = value
        }
    }


    /**
     * Return the first field (if any) holding a non-finite value, scanning
     * the whole block.
     */
    pub fn first_non_finite(&self) -> Option<usize> {
        self.data
            .iter()
            .position(|x| !x.is_finite())
            .map(|n| n % field::NUM_FIELDS)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{field, BlockId, BlockInfo, FluidBlock};

    fn info() -> BlockInfo {
        BlockInfo { id: BlockId(3), index: (1, 0, 2), origin: [0.5, 0.0, 1.0], h: 0.125, size: 4 }
    }

    #[test]
    fn block_geometry_is_consistent() {
        let info = info();
        let bounds = info.bounds();
        assert_eq!(bounds.lower, [0.5, 0.0, 1.0]);
        assert_eq!(bounds.upper, [1.0, 0.5, 1.5]);
        assert_eq!(info.cell_center((0, 0, 0)), [0.5625, 0.0625, 1.0625]);
        assert_eq!(info.global_cells().start(), (4, 0, 8));
    }

    #[test]
    fn block_fields_are_addressable() {
        let mut block = FluidBlock::from_function(4, |(i, j, k)| {
            [i as f64, j as f64, k as f64, 1.0, 0.0]
        });
        assert_eq!(block.velocity((1, 2, 3)), [1.0, 2.0, 3.0]);
        *block.get_mut((0, 0, 1), field::CHI) = 0.5;
        assert_eq!(block.get((0, 0, 1), field::CHI), 0.5);
        assert_eq!(block.first_non_finite(), None);
        *block.get_mut((3, 3, 3), field::P) = f64::NAN;
        assert_eq!(block.first_non_finite(), Some(field::P));
        block.fill(field::P, 0.0);
        assert_eq!(block.first_non_finite(), None);
    }
}
