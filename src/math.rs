use std::f64::consts::{FRAC_PI_4, PI};
use std::ops::{Add, AddAssign, Mul};
use serde::{Deserialize, Serialize};




/// Machine epsilon for double precision.
pub const DBLEPS: f64 = f64::EPSILON;

/// Small floor used to guard divisions, e.g. in efficiency ratios.
pub const EPS: f64 = 1e-13;

/// Relative determinant below which an inertia tensor is considered singular.
pub const SINGULAR_TOLERANCE: f64 = 1e-12;




// ============================================================================
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

pub fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn scale(s: f64, a: [f64; 3]) -> [f64; 3] {
    [s * a[0], s * a[1], s * a[2]]
}

/// Wrap an angle into the interval (-pi, pi].
pub fn wrap_angle(a: f64) -> f64 {
    let b = (a + PI).rem_euclid(2.0 * PI) - PI;
    if b == -PI { PI } else { b }
}




/**
 * A rotation quaternion, stored as `(w, x, y, z)`. Orientation quaternions
 * are kept at unit norm by [`Quaternion::integrate`].
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quaternion(pub [f64; 4]);




// ============================================================================
impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Quaternion {
    type Output = Self;

    fn mul(self, b: Self) -> Self {
        let [a0, a1, a2, a3] = self.0;
        let [b0, b1, b2, b3] = b.0;
        Self([
            a0 * b0 - a1 * b1 - a2 * b2 - a3 * b3,
            a0 * b1 + a1 * b0 + a2 * b3 - a3 * b2,
            a0 * b2 - a1 * b3 + a2 * b0 + a3 * b1,
            a0 * b3 + a1 * b2 - a2 * b1 + a3 * b0,
        ])
    }
}




// ============================================================================
impl Quaternion {

    pub const IDENTITY: Self = Self([1.0, 0.0, 0.0, 0.0]);


    /**
     * Rotation by `angle` radians about the z axis.
     */
    pub fn from_heading(angle: f64) -> Self {
        Self([(0.5 * angle).cos(), 0.0, 0.0, (0.5 * angle).sin()])
    }


    /**
     * The exact rotation `exp(v / 2)` for a rotation vector `v`.
     */
    pub fn from_rotation_vector(v: [f64; 3]) -> Self {
        let angle = norm(v);
        if angle <= DBLEPS {
            return Self::IDENTITY;
        }
        let s = (0.5 * angle).sin() / angle;
        Self([(0.5 * angle).cos(), s * v[0], s * v[1], s * v[2]])
    }


    pub fn norm(&self) -> f64 {
        self.0.iter().map(|q| q * q).sum::<f64>().sqrt()
    }


    pub fn normalize(&self) -> Self {
        let n = self.norm();
        Self(self.0.map(|q| q / n))
    }


    /**
     * Time derivative of this orientation under the lab-frame angular
     * velocity `w`: `dq/dt = 1/2 (0, w) * q`.
     */
    pub fn derivative(&self, w: [f64; 3]) -> [f64; 4] {
        let [q0, q1, q2, q3] = self.0;
        [
            0.5 * (-w[0] * q1 - w[1] * q2 - w[2] * q3),
            0.5 * ( w[0] * q0 + w[1] * q3 - w[2] * q2),
            0.5 * (-w[0] * q3 + w[1] * q0 + w[2] * q1),
            0.5 * ( w[0] * q2 - w[1] * q1 + w[2] * q0),
        ]
    }


    /**
     * Advance this orientation by `dt` under the angular velocity `w`. The
     * increment `dq = dt * dq/dt` is scaled by `tan(|dq|) / |dq|` before it
     * is added, and the sum is renormalized; this lands on the unit sphere
     * at the same point as the exact exponential map. The tangent blows up
     * as `|dq|` approaches pi/2, so from pi/4 on the exponential map is
     * applied directly.
     */
    pub fn integrate(&self, w: [f64; 3], dt: f64) -> Self {
        let dq = self.derivative(w).map(|d| d * dt);
        let dq_norm = dq.iter().map(|d| d * d).sum::<f64>().sqrt();

        if dq_norm <= DBLEPS {
            *self
        } else if dq_norm < FRAC_PI_4 {
            let f = dq_norm.tan() / dq_norm;
            let [q0, q1, q2, q3] = self.0;
            Self([q0 + f * dq[0], q1 + f * dq[1], q2 + f * dq[2], q3 + f * dq[3]]).normalize()
        } else {
            (Self::from_rotation_vector(scale(dt, w)) * *self).normalize()
        }
    }


    /**
     * The rotation angle about z for a quaternion describing planar motion.
     */
    pub fn heading(&self) -> f64 {
        2.0 * self.0[3].atan2(self.0[0])
    }


    /**
     * Rotate a vector from the body frame into the lab frame.
     */
    pub fn rotate(&self, v: [f64; 3]) -> [f64; 3] {
        let p = Quaternion([0.0, v[0], v[1], v[2]]);
        let r = *self * p * self.conjugate();
        [r.0[1], r.0[2], r.0[3]]
    }


    /**
     * Rotate a vector from the lab frame into the body frame.
     */
    pub fn rotate_inverse(&self, v: [f64; 3]) -> [f64; 3] {
        self.conjugate().rotate(v)
    }


    pub fn conjugate(&self) -> Self {
        let [q0, q1, q2, q3] = self.0;
        Self([q0, -q1, -q2, -q3])
    }
}




/**
 * Symmetric 3x3 tensor stored as `[xx, yy, zz, xy, xz, yz]`, the layout used
 * for moments of inertia.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SymmetricTensor(pub [f64; 6]);




// ============================================================================
impl Add for SymmetricTensor {
    type Output = Self;

    fn add(mut self, b: Self) -> Self {
        self += b;
        self
    }
}

impl AddAssign for SymmetricTensor {
    fn add_assign(&mut self, b: Self) {
        for (a, b) in self.0.iter_mut().zip(b.0) {
            *a += b
        }
    }
}




// ============================================================================
impl SymmetricTensor {


    /**
     * The inertia contribution of a point of mass `m` at offset `r` from the
     * reference point.
     */
    pub fn point_inertia(m: f64, r: [f64; 3]) -> Self {
        Self([
            m * (r[1] * r[1] + r[2] * r[2]),
            m * (r[0] * r[0] + r[2] * r[2]),
            m * (r[0] * r[0] + r[1] * r[1]),
            -m * r[0] * r[1],
            -m * r[0] * r[2],
            -m * r[1] * r[2],
        ])
    }


    pub fn determinant(&self) -> f64 {
        let [j0, j1, j2, j3, j4, j5] = self.0;
        j0 * (j1 * j2 - j5 * j5) + j3 * (j4 * j5 - j2 * j3) + j4 * (j3 * j5 - j1 * j4)
    }


    /**
     * Return the inverse tensor, or `None` if the determinant is not finite
     * or is negligible relative to the cube of the largest diagonal entry.
     */
    pub fn inverse(&self) -> Option<Self> {
        let [j0, j1, j2, j3, j4, j5] = self.0;
        let det = self.determinant();
        let scale = j0.abs().max(j1.abs()).max(j2.abs());

        if !det.is_finite() || det.abs() <= SINGULAR_TOLERANCE * scale * scale * scale || det == 0.0 {
            return None;
        }
        Some(Self([
            (j1 * j2 - j5 * j5) / det,
            (j0 * j2 - j4 * j4) / det,
            (j0 * j1 - j3 * j3) / det,
            (j4 * j5 - j2 * j3) / det,
            (j3 * j5 - j1 * j4) / det,
            (j3 * j4 - j0 * j5) / det,
        ]))
    }


    pub fn mul_vec(&self, v: [f64; 3]) -> [f64; 3] {
        let [j0, j1, j2, j3, j4, j5] = self.0;
        [
            j0 * v[0] + j3 * v[1] + j4 * v[2],
            j3 * v[0] + j1 * v[1] + j5 * v[2],
            j4 * v[0] + j5 * v[1] + j2 * v[2],
        ]
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn quaternion_norm_does_not_drift() {
        let mut q = Quaternion([0.5, 0.5, 0.5, 0.5]);
        let w = [0.3, -1.7, 2.9];

        for n in 0..10000 {
            q = q.integrate(w, 1e-3 * (1.0 + (n % 7) as f64));
            assert!((q.norm() - 1.0).abs() < 5e-15);
        }
    }

    #[test]
    fn retraction_is_exact_for_planar_rotation() {
        let q0 = Quaternion::from_heading(0.4);
        let q1 = q0.integrate([0.0, 0.0, 2.5], 0.01);
        assert!((wrap_angle(q1.heading() - q0.heading()) - 0.025).abs() < 1e-12);
    }

    #[test]
    fn retraction_agrees_with_exponential_map_below_switch() {
        let q = Quaternion([0.9, 0.1, -0.3, 0.2]).normalize();
        let w = [1.0, 2.0, -0.5];
        let dt = 0.2;
        let a = q.integrate(w, dt);
        let b = (Quaternion::from_rotation_vector(scale(dt, w)) * q).normalize();
        for (x, y) in a.0.iter().zip(b.0) {
            assert!((x - y).abs() < 1e-12);
        }
    }

    #[test]
    fn large_steps_stay_on_the_unit_sphere() {
        let q = Quaternion::IDENTITY.integrate([0.0, 0.0, 3.0], 1.0);
        assert!((q.norm() - 1.0).abs() < 1e-15);
        assert!((q.heading() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rotation_round_trips() {
        let q = Quaternion::from_heading(std::f64::consts::FRAC_PI_2);
        let v = q.rotate([1.0, 0.0, 0.0]);
        assert!((v[0]).abs() < 1e-15 && (v[1] - 1.0).abs() < 1e-15);
        let u = q.rotate_inverse(v);
        assert!((u[0] - 1.0).abs() < 1e-15);
    }

    #[test]
    fn inertia_inverse_works() {
        let j = SymmetricTensor([4.0, 5.0, 6.0, 0.5, -0.25, 1.0]);
        let inv = j.inverse().unwrap();
        for e in [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]] {
            let x = j.mul_vec(inv.mul_vec(e));
            for d in 0..3 {
                assert!((x[d] - e[d]).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn singular_inertia_is_rejected() {
        assert!(SymmetricTensor::default().inverse().is_none());
        assert!(SymmetricTensor([1.0, 1.0, 1.0, 1.0, 1.0, 1.0]).inverse().is_none());
        assert!(SymmetricTensor([f64::NAN, 1.0, 1.0, 0.0, 0.0, 0.0]).inverse().is_none());
    }

    #[test]
    fn angle_wrapping_works() {
        assert!((wrap_angle(3.0 * PI) - PI).abs() < 1e-12);
        assert!((wrap_angle(-0.5) + 0.5).abs() < 1e-15);
    }
}
