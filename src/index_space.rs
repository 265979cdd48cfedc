use core::ops::Range;




/**
 * Identifier for a Cartesian axis
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    I,
    J,
    K,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::I, Axis::J, Axis::K];

    pub fn unit(self) -> (i64, i64, i64) {
        match self {
            Axis::I => (1, 0, 0),
            Axis::J => (0, 1, 0),
            Axis::K => (0, 0, 1),
        }
    }
}




#[derive(Clone, Debug, PartialEq, Eq)]


/**
 * Represents a rectangular region in a discrete 3D index space
 */
pub struct IndexSpace {
    di: Range<i64>,
    dj: Range<i64>,
    dk: Range<i64>,
}




/**
 * Describes a rectangular index space. The index type is signed 64-bit integer.
 */
impl IndexSpace {


    pub fn new(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> Self {

        assert!(
            di.start <= di.end && dj.start <= dj.end && dk.start <= dk.end,
            "index space has negative volume");

        Self { di, dj, dk }
    }


    /**
     * A cube of `n` indexes per axis starting at the origin.
     */
    pub fn cube(n: usize) -> Self {
        let n = n as i64;
        Self::new(0..n, 0..n, 0..n)
    }


    /**
     * Return the number of indexes on each axis.
     */
    pub fn dim(&self) -> (usize, usize, usize) {
        ((self.di.end - self.di.start) as usize,
         (self.dj.end - self.dj.start) as usize,
         (self.dk.end - self.dk.start) as usize)
    }


    /**
     * Return the number of elements in this index space.
     */
    pub fn len(&self) -> usize {
        let (l, m, n) = self.dim();
        l * m * n
    }


    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }


    /**
     * Return the minimum index (inclusive).
     */
    pub fn start(&self) -> (i64, i64, i64) {
        (self.di.start, self.dj.start, self.dk.start)
    }


    /**
     * Return the maximum index (exclusive).
     */
    pub fn end(&self) -> (i64, i64, i64) {
        (self.di.end, self.dj.end, self.dk.end)
    }


    /**
     * Determine whether this index space contains the given index.
     */
    pub fn contains(&self, index: (i64, i64, i64)) -> bool {
        self.di.contains(&index.0) && self.dj.contains(&index.1) && self.dk.contains(&index.2)
    }


    /**
     * Expand this index space by a (possibly different) number of elements on
     * each axis, on both the lower and upper side.
     */
    pub fn extend(&self, delta: (i64, i64, i64)) -> Self {
        Self::new(
            self.di.start - delta.0 .. self.di.end + delta.0,
            self.dj.start - delta.1 .. self.dj.end + delta.1,
            self.dk.start - delta.2 .. self.dk.end + delta.2)
    }


    /**
     * Expand this index space by the given number of elements on each axis.
     */
    pub fn extend_all(&self, delta: i64) -> Self {
        self.extend((delta, delta, delta))
    }


    /**
     * Shift this index space by the given offset.
     */
    pub fn translate(&self, offset: (i64, i64, i64)) -> Self {
        Self::new(
            self.di.start + offset.0 .. self.di.end + offset.0,
            self.dj.start + offset.1 .. self.dj.end + offset.1,
            self.dk.start + offset.2 .. self.dk.end + offset.2)
    }


    /**
     * Return the linear offset for the given index, in a row-major memory
     * buffer aligned with the start of this index space. The final index
     * increases fastest.
     */
    pub fn row_major_offset(&self, index: (i64, i64, i64)) -> usize {
        let i = (index.0 - self.di.start) as usize;
        let j = (index.1 - self.dj.start) as usize;
        let k = (index.2 - self.dk.start) as usize;
        let (_, m, n) = self.dim();
        (i * m + j) * n + k
    }


    /**
     * Inverse of `row_major_offset`.
     */
    pub fn index_at(&self, offset: usize) -> (i64, i64, i64) {
        let (_, m, n) = self.dim();
        let k = offset % n;
        let j = (offset / n) % m;
        let i = offset / (m * n);
        (self.di.start + i as i64, self.dj.start + j as i64, self.dk.start + k as i64)
    }


    /**
     * Return an iterator which traverses the index space in row-major order
     * (C-like; the final index increases fastest).
     */
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, i64)> + '_ {
        self.di.clone().flat_map(move |i| {
            self.dj.clone().flat_map(move |j| self.dk.clone().map(move |k| (i, j, k)))
        })
    }
}




// ============================================================================
impl From<(Range<i64>, Range<i64>, Range<i64>)> for IndexSpace {
    fn from(range: (Range<i64>, Range<i64>, Range<i64>)) -> Self {
        Self::new(range.0, range.1, range.2)
    }
}




/**
 * Less imposing factory function to construct an IndexSpace object.
 */
pub fn range3d(di: Range<i64>, dj: Range<i64>, dk: Range<i64>) -> IndexSpace {
    IndexSpace::new(di, dj, dk)
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{range3d, IndexSpace};

    #[test]
    fn traversal_is_row_major_and_covers_the_space() {
        let space = range3d(-1..3, 0..2, 5..8);
        let indexes: Vec<_> = space.iter().collect();
        assert_eq!(indexes.len(), space.len());
        assert_eq!(indexes[0], (-1, 0, 5));
        assert_eq!(indexes[1], (-1, 0, 6));
        for (n, index) in indexes.iter().enumerate() {
            assert_eq!(space.row_major_offset(*index), n);
            assert_eq!(space.index_at(n), *index);
        }
    }

    #[test]
    fn extension_grows_every_axis() {
        let space = IndexSpace::cube(8).extend((1, 2, 0));
        assert_eq!(space.dim(), (10, 12, 8));
        assert!(space.contains((-1, -2, 0)));
        assert!(!space.contains((-1, -2, -1)));
    }
}
