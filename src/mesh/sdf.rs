use crate::mesh::types::{Pt3, Vec3};

/// Signed distance function for a sphere, negative inside
pub fn sphere_sdf(point: &Pt3, center: &Pt3, radius: f32) -> f32 {
    (point - center).magnitude() - radius
}

/// Signed distance function for a plane through `origin` with unit `normal`.
/// Positive on the side the normal points to.
pub fn plane_sdf(point: &Pt3, origin: &Pt3, normal: &Vec3) -> f32 {
    (point - origin).dot(normal)
}
