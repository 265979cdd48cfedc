use std::ops::{Add, AddAssign};
use crate::math::SymmetricTensor;
use crate::message::Communicator;




/**
 * Chi-weighted integrals over an obstacle: volume, first moment (for the
 * centroid), linear and angular momentum of some velocity field, and the
 * inertia tensor. Computed per block, summed over workers and ranks, and
 * discarded once the step that needed them is done.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RigidBodyMoments {
    pub volume: f64,
    pub first: [f64; 3],
    pub linear: [f64; 3],
    pub angular: [f64; 3],
    pub inertia: SymmetricTensor,
}

const LEN: usize = 1 + 3 + 3 + 3 + 6;




// ============================================================================
impl RigidBodyMoments {


    /**
     * Accumulate a cell of weight `chi * dv` at offset `r` from the reference
     * point, carrying velocity `u`.
     */
    pub fn add_cell(&mut self, chi: f64, dv: f64, r: [f64; 3], u: [f64; 3]) {
        let m = chi * dv;
        self.volume += m;

        for d in 0..3 {
            self.first[d] += m * r[d];
            self.linear[d] += m * u[d];
        }
        let t = crate::math::cross(r, u);

        for d in 0..3 {
            self.angular[d] += m * t[d];
        }
        self.inertia += SymmetricTensor::point_inertia(m, r);
    }


    /**
     * The chi-weighted centroid, as an offset from the reference point.
     */
    pub fn centroid_offset(&self) -> [f64; 3] {
        if self.volume > 0.0 {
            self.first.map(|x| x / self.volume)
        } else {
            [0.0; 3]
        }
    }


    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(LEN);
        v.push(self.volume);
        v.extend(self.first);
        v.extend(self.linear);
        v.extend(self.angular);
        v.extend(self.inertia.0);
        v
    }


    pub fn from_slice(v: &[f64]) -> Self {
        assert_eq!(v.len(), LEN, "rigid body moments have {} entries", LEN);
        let a3 = |i: usize| [v[i], v[i + 1], v[i + 2]];
        Self {
            volume: v[0],
            first: a3(1),
            linear: a3(4),
            angular: a3(7),
            inertia: SymmetricTensor([v[10], v[11], v[12], v[13], v[14], v[15]]),
        }
    }


    /**
     * Sum the moments over all ranks.
     */
    pub fn all_reduce<C: Communicator>(&self, comm: &C) -> Self {
        Self::from_slice(&comm.all_reduce_sum(&self.to_vec()))
    }
}




// ============================================================================
impl Add for RigidBodyMoments {
    type Output = Self;

    fn add(mut self, b: Self) -> Self {
        self += b;
        self
    }
}

impl AddAssign for RigidBodyMoments {
    fn add_assign(&mut self, b: Self) {
        self.volume += b.volume;

        for d in 0..3 {
            self.first[d] += b.first[d];
            self.linear[d] += b.linear[d];
            self.angular[d] += b.angular[d];
        }
        self.inertia += b.inertia;
    }
}

impl std::iter::Sum for RigidBodyMoments {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |a, b| a + b)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::RigidBodyMoments;

    #[test]
    fn moments_pack_and_accumulate() {
        let mut a = RigidBodyMoments::default();
        a.add_cell(1.0, 2.0, [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);
        let mut b = RigidBodyMoments::default();
        b.add_cell(0.5, 2.0, [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]);

        let c: RigidBodyMoments = vec![a, b].into_iter().sum();
        assert_eq!(c.volume, 3.0);
        assert_eq!(c.linear, [0.0, 3.0, 0.0]);
        assert_eq!(c.angular, [0.0, 0.0, 1.0]);
        assert_eq!(c.inertia.0[1], 3.0);
        assert_eq!(c.centroid_offset(), [1.0 / 3.0, 0.0, 0.0]);
        assert_eq!(RigidBodyMoments::from_slice(&c.to_vec()), c);
    }
}
