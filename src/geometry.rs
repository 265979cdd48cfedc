use std::f64::consts::PI;
use crate::context::StepContext;
use crate::math::{self, Quaternion};
use crate::overlap::Overlap;




/**
 * Axis-aligned box in physical space.
 */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub lower: [f64; 3],
    pub upper: [f64; 3],
}




// ============================================================================
impl BoundingBox {


    pub fn new(lower: [f64; 3], upper: [f64; 3]) -> Self {
        Self { lower, upper }
    }


    /**
     * A box centered on `center` with the given half-extent on each axis.
     */
    pub fn centered(center: [f64; 3], half: [f64; 3]) -> Self {
        Self::new(math::sub(center, half), math::add(center, half))
    }


    /**
     * Grow the box by `margin` on every side.
     */
    pub fn expand(&self, margin: f64) -> Self {
        Self::new(
            self.lower.map(|x| x - margin),
            [self.upper[0] + margin, self.upper[1] + margin, self.upper[2] + margin])
    }


    /**
     * Two boxes intersect if they overlap by a strictly positive length on
     * every axis. Boxes that only touch along a face do not intersect.
     */
    pub fn intersects(&self, other: &Self) -> bool {
        (0..3).all(|d| (self.lower[d]..self.upper[d]).overlaps(&(other.lower[d]..other.upper[d])))
    }


    pub fn contains(&self, x: [f64; 3]) -> bool {
        (0..3).all(|d| self.lower[d] <= x[d] && x[d] <= self.upper[d])
    }
}




/**
 * Position of a body's reference point and its orientation.
 */
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Pose {
    pub position: [f64; 3],
    pub quaternion: Quaternion,
}




// ============================================================================
impl Pose {

    /**
     * Express a lab-frame point in body-frame coordinates.
     */
    pub fn to_body(&self, x: [f64; 3]) -> [f64; 3] {
        self.quaternion.rotate_inverse(math::sub(x, self.position))
    }
}




/**
 * Shape capability of an obstacle. A shape provides a signed distance
 * (positive inside the body) and a conservative bounding box; deformable
 * shapes additionally provide a deformation velocity field. Every method
 * except the distance and the box has a default suited to rigid bodies.
 */
pub trait Geometry: Send + Sync {

    /// Box containing every point where the signed distance is positive.
    fn bounding_box(&self, pose: &Pose) -> BoundingBox;

    /// Signed distance from the body surface; positive inside.
    fn signed_distance(&self, pose: &Pose, x: [f64; 3]) -> f64;

    /// Shape-change velocity at a lab-frame point inside the body.
    fn deformation_velocity(&self, _pose: &Pose, _x: [f64; 3], _time: f64) -> [f64; 3] {
        [0.0; 3]
    }

    /// Whether the body moves by deforming, in which case its deformation
    /// velocity is made momentum free after every create phase.
    fn is_self_propelled(&self) -> bool {
        false
    }

    /// Characteristic length of the shape.
    fn length(&self) -> f64;

    /// A translational velocity imposed on the body at time `t`, overriding
    /// the fluid-coupled solve.
    fn prescribed_velocity(&self, _time: f64) -> Option<[f64; 3]> {
        None
    }

    /// Rotation axes this shape cannot turn about.
    fn blocked_rotation(&self) -> [bool; 3] {
        [false; 3]
    }

    /// Invoked once per step after the characteristic function is ready.
    fn finalize(&mut self, _ctx: &StepContext) {}
}




/**
 * Cosine-mollified indicator of a signed distance. The transition band has
 * half-width `half_band`; the result is exactly 1/2 on the surface.
 */
pub fn mollify(signed_distance: f64, half_band: f64) -> f64 {
    let eps = 2.0 * half_band;

    if signed_distance >= half_band {
        1.0
    } else if signed_distance <= -half_band {
        0.0
    } else {
        0.5 * (1.0 + (PI * (-signed_distance / eps + 0.5)).cos())
    }
}




// ============================================================================
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelDecel {
    pub umax: f64,
    pub tmax: f64,
}

impl AccelDecel {

    /**
     * Uniform acceleration to `umax` over `tmax`, then uniform deceleration
     * back to rest over the same time.
     */
    pub fn velocity(&self, t: f64) -> f64 {
        if t < self.tmax {
            self.umax * t / self.tmax
        } else if t < 2.0 * self.tmax {
            self.umax * (2.0 * self.tmax - t) / self.tmax
        } else {
            0.0
        }
    }
}




/**
 * A sphere, or the half of it lying at negative body-frame x.
 */
#[derive(Clone, Debug)]
pub struct Sphere {
    pub radius: f64,
    pub hemisphere: bool,
    pub accel_decel: Option<AccelDecel>,
}

impl Sphere {
    pub fn new(radius: f64) -> Self {
        Self { radius, hemisphere: false, accel_decel: None }
    }
}

impl Geometry for Sphere {
    fn bounding_box(&self, pose: &Pose) -> BoundingBox {
        BoundingBox::centered(pose.position, [self.radius; 3])
    }

    fn signed_distance(&self, pose: &Pose, x: [f64; 3]) -> f64 {
        let p = pose.to_body(x);
        let d = self.radius - math::norm(p);

        if self.hemisphere {
            d.min(-p[0])
        } else {
            d
        }
    }

    fn length(&self) -> f64 {
        2.0 * self.radius
    }

    fn prescribed_velocity(&self, time: f64) -> Option<[f64; 3]> {
        self.accel_decel.map(|a| [a.velocity(time), 0.0, 0.0])
    }
}




// ============================================================================
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Circular,
    /// Half disk lying at negative x: the flat face points downstream.
    D,
}




/**
 * Cylinder with its axis along z. Cylinders may translate but not rotate.
 */
#[derive(Clone, Debug)]
pub struct Cylinder {
    pub radius: f64,
    pub halflength: f64,
    pub section: Section,
}

impl Geometry for Cylinder {
    fn bounding_box(&self, pose: &Pose) -> BoundingBox {
        let (r, l) = (self.radius, self.halflength);

        if pose.quaternion != Quaternion::IDENTITY {
            return BoundingBox::centered(pose.position, [(r * r + l * l).sqrt(); 3]);
        }
        let p = pose.position;

        match self.section {
            Section::Circular => BoundingBox::centered(p, [r, r, l]),
            Section::D => BoundingBox::new([p[0] - r, p[1] - r, p[2] - l], [p[0], p[1] + r, p[2] + l]),
        }
    }

    fn signed_distance(&self, pose: &Pose, x: [f64; 3]) -> f64 {
        let [x, y, z] = pose.to_body(x);
        let radial = self.radius - (x * x + y * y).sqrt();
        let vertical = self.halflength - z.abs();

        match self.section {
            Section::Circular => radial.min(vertical),
            Section::D => radial.min(-x).min(vertical),
        }
    }

    fn length(&self) -> f64 {
        2.0 * self.radius
    }

    fn blocked_rotation(&self) -> [bool; 3] {
        [true; 3]
    }
}




/**
 * A deformable body: the shape of `base` carrying a deformation velocity
 * given by a closure of the lab-frame offset from the body's reference point
 * and the time.
 */
pub struct Deforming {
    pub base: Box<dyn Geometry>,
    pub velocity: Box<dyn Fn([f64; 3], f64) -> [f64; 3] + Send + Sync>,
}

impl Geometry for Deforming {
    fn bounding_box(&self, pose: &Pose) -> BoundingBox {
        self.base.bounding_box(pose)
    }

    fn signed_distance(&self, pose: &Pose, x: [f64; 3]) -> f64 {
        self.base.signed_distance(pose, x)
    }

    fn deformation_velocity(&self, pose: &Pose, x: [f64; 3], time: f64) -> [f64; 3] {
        (self.velocity)(math::sub(x, pose.position), time)
    }

    fn is_self_propelled(&self) -> bool {
        true
    }

    fn length(&self) -> f64 {
        self.base.length()
    }

    fn blocked_rotation(&self) -> [bool; 3] {
        self.base.blocked_rotation()
    }

    fn finalize(&mut self, ctx: &StepContext) {
        self.base.finalize(ctx)
    }
}
