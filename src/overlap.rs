use core::ops::RangeBounds;
use core::ops::Bound;




/**
 * Extension trait to determine whether two range bounds objects overlap. Two
 * ranges that line up end-to-end do not overlap, regardless of whether the
 * endpoints that touch are included or excluded. Works for any partially
 * ordered type, so floating point extents (block bounds, obstacle bounding
 * boxes) can be tested the same way as integer index ranges.
 */
pub trait Overlap<T>: RangeBounds<T> {
    fn overlaps<S: Overlap<T>>(&self, s: &S) -> bool;
}




// ============================================================================
fn bound_value<T>(bound: Bound<&T>) -> Option<&T> {
    match bound {
        Bound::Included(x) | Bound::Excluded(x) => Some(x),
        Bound::Unbounded => None,
    }
}

fn greater<'a, T: PartialOrd>(a: &'a T, b: &'a T) -> &'a T {
    if a > b { a } else { b }
}

fn lesser<'a, T: PartialOrd>(a: &'a T, b: &'a T) -> &'a T {
    if a < b { a } else { b }
}




// ============================================================================
impl<R, T> Overlap<T> for R
where
    R: RangeBounds<T>,
    T: PartialOrd,
{
    fn overlaps<S: Overlap<T>>(&self, s: &S) -> bool {
        let lower = match (bound_value(self.start_bound()), bound_value(s.start_bound())) {
            (None, None) => None,
            (Some(l), None) | (None, Some(l)) => Some(l),
            (Some(l0), Some(l1)) => Some(greater(l0, l1)),
        };

        let upper = match (bound_value(self.end_bound()), bound_value(s.end_bound())) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r),
            (Some(r0), Some(r1)) => Some(lesser(r0, r1)),
        };

        match (lower, upper) {
            (Some(l), Some(r)) => l < r,
            _ => true,
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::Overlap;

    #[test]
    fn overlapping_ranges_works() {
        assert!((0..2).overlaps(&(1..3)));
        assert!((..).overlaps(&(..2)));
        assert!(!(..=2).overlaps(&(2..)));
        assert!(!(0..2).overlaps(&(2..3)));
        assert!(!(..=2).overlaps(&(3..)));
        assert!(!(4..).overlaps(&(..2)));
    }

    #[test]
    fn floating_point_extents_touching_end_to_end_do_not_overlap() {
        assert!((0.0..1.0).overlaps(&(0.5..2.0)));
        assert!(!(0.0..1.0).overlaps(&(1.0..2.0)));
        assert!(!(-1.0..=-0.25).overlaps(&(0.0..0.5)));
    }
}
