//! Depth images, pinhole intrinsics and the frustum box that sizes every grid.

use crate::error::{FusionError, Result};
use crate::mesh::types::{Aabb, Pt3, Vec3};
use nalgebra::Matrix3;

/// Row-major depth image in metres. Zero or non-finite samples are invalid.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        let expected = width * height;
        if data.len() != expected {
            return Err(FusionError::DepthImageSize {
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: usize, height: usize, depth: f32) -> Self {
        Self {
            width,
            height,
            data: vec![depth; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn get(&self, u: usize, v: usize) -> f32 {
        self.data[v * self.width + u]
    }

    /// Depth at pixel `(u, v)` given as already-rounded floats, `None` off-image.
    pub fn sample(&self, u: f32, v: f32) -> Option<f32> {
        if !(u >= 0.0 && v >= 0.0) {
            return None;
        }
        let (u, v) = (u as usize, v as usize);
        if u >= self.width || v >= self.height {
            return None;
        }
        Some(self.get(u, v))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Pinhole intrinsic matrix `[fx 0 cx; 0 fy cy; 0 0 1]`.
pub fn intrinsic_matrix(fx: f32, fy: f32, cx: f32, cy: f32) -> Matrix3<f32> {
    Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0)
}

/// Camera-space point seen at pixel `(u, v)` with the given depth.
pub fn back_project(intrinsics_inv: &Matrix3<f32>, u: f32, v: f32, depth: f32) -> Pt3 {
    let ray = intrinsics_inv * Vec3::new(u, v, 1.0);
    Pt3::from(ray * depth)
}

/// Axis-aligned box around the viewing frustum of a camera at the origin.
///
/// The four image corners are back-projected at `min_depth` and at `max_depth`;
/// the box spans those eight points. Computed once per stream so that every
/// frame's grid shares one world region.
pub fn frustum_bounds(
    width: usize,
    height: usize,
    intrinsics: &Matrix3<f32>,
    min_depth: f32,
    max_depth: f32,
) -> Result<Aabb> {
    let inv = intrinsics.try_inverse().ok_or_else(|| {
        FusionError::InvalidConfig("depth intrinsic matrix is not invertible".to_string())
    })?;
    let (w, h) = ((width.max(1) - 1) as f32, (height.max(1) - 1) as f32);
    let pixels = [(0.0, 0.0), (0.0, h), (w, h), (w, 0.0)];

    let corners: Vec<Pt3> = [min_depth, max_depth]
        .iter()
        .flat_map(|&depth| {
            pixels
                .iter()
                .map(move |&(u, v)| back_project(&inv, u, v, depth))
        })
        .collect();

    Aabb::from_points(&corners)
        .ok_or_else(|| FusionError::InvalidConfig("empty frustum".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn depth_image_checks_size() {
        assert!(matches!(
            DepthImage::new(2, 2, vec![1.0; 3]),
            Err(FusionError::DepthImageSize {
                expected: 4,
                found: 3
            })
        ));
    }

    #[test]
    fn sample_rejects_off_image_pixels() {
        let image = DepthImage::filled(4, 3, 1.5);
        assert_eq!(image.sample(3.0, 2.0), Some(1.5));
        assert_eq!(image.sample(4.0, 0.0), None);
        assert_eq!(image.sample(-1.0, 0.0), None);
        assert_eq!(image.sample(f32::NAN, 0.0), None);
    }

    #[test]
    fn frustum_of_centred_camera() {
        // 101 x 101 image, principal point in the middle, focal length 50:
        // half-width at depth d is d.
        let k = intrinsic_matrix(50.0, 50.0, 50.0, 50.0);
        let bounds = frustum_bounds(101, 101, &k, 0.5, 2.0).unwrap();
        assert_relative_eq!(bounds.min, Pt3::new(-2.0, -2.0, 0.5), epsilon = 1e-5);
        assert_relative_eq!(bounds.max, Pt3::new(2.0, 2.0, 2.0), epsilon = 1e-5);
    }
}
