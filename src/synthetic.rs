//! Synthetic inputs: a ray-traced moving sphere and analytic sphere grids.

use crate::camera::{intrinsic_matrix, DepthImage};
use crate::config::VolumeConfig;
use crate::error::{FusionError, Result};
use crate::fusion::{DepthFrame, FrameSource};
use crate::mesh::sdf::{plane_sdf, sphere_sdf};
use crate::mesh::{Aabb, Pt3, Vec3, VoxelGrid};
use nalgebra::{Matrix3, Matrix4};

/// A sphere sliding across the view of a fixed pinhole camera at the origin,
/// looking down +z. Frame `i` shows the sphere at `start + i * step`.
#[derive(Debug, Clone)]
pub struct MovingSphere {
    pub width: usize,
    pub height: usize,
    pub focal_length: f32,
    pub min_depth: f32,
    pub max_depth: f32,
    pub start: Pt3,
    pub step: Vec3,
    pub radius: f32,
    pub frames: usize,
}

impl Default for MovingSphere {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            focal_length: 60.0,
            min_depth: 0.5,
            max_depth: 1.5,
            start: Pt3::new(-0.05, 0.0, 1.0),
            step: Vec3::new(0.01, 0.0, 0.0),
            radius: 0.25,
            frames: 10,
        }
    }
}

impl MovingSphere {
    pub fn center(&self, index: usize) -> Pt3 {
        self.start + self.step * index as f32
    }

    /// Depth image of frame `index`. Pixels that miss the sphere read 0.
    pub fn render(&self, index: usize) -> Result<DepthImage> {
        let center = self.center(index);
        let (cx, cy) = self.principal_point();
        let mut data = Vec::with_capacity(self.width * self.height);
        for v in 0..self.height {
            for u in 0..self.width {
                let ray = Vec3::new(
                    (u as f32 - cx) / self.focal_length,
                    (v as f32 - cy) / self.focal_length,
                    1.0,
                );
                data.push(ray_sphere_depth(&ray, &center, self.radius).unwrap_or(0.0));
            }
        }
        DepthImage::new(self.width, self.height, data)
    }

    fn principal_point(&self) -> (f32, f32) {
        ((self.width as f32 - 1.0) * 0.5, (self.height as f32 - 1.0) * 0.5)
    }
}

impl FrameSource for MovingSphere {
    fn depth_width(&self) -> usize {
        self.width
    }

    fn depth_height(&self) -> usize {
        self.height
    }

    fn depth_intrinsics(&self) -> Matrix3<f32> {
        let (cx, cy) = self.principal_point();
        intrinsic_matrix(self.focal_length, self.focal_length, cx, cy)
    }

    fn min_depth(&self) -> f32 {
        self.min_depth
    }

    fn max_depth(&self) -> f32 {
        self.max_depth
    }

    fn frame_count(&self) -> usize {
        self.frames
    }

    fn frame(&self, index: usize) -> Result<DepthFrame> {
        if index >= self.frames {
            return Err(FusionError::MissingFrame(index));
        }
        Ok(DepthFrame {
            depth: self.render(index)?,
            camera_to_world: Matrix4::identity(),
        })
    }
}

/// Depth (camera z) of the first hit along `ray`, whose z component is 1.
fn ray_sphere_depth(ray: &Vec3, center: &Pt3, radius: f32) -> Option<f32> {
    let a = ray.norm_squared();
    let b = ray.dot(&center.coords);
    let c = center.coords.norm_squared() - radius * radius;
    let disc = b * b - a * c;
    if disc < 0.0 {
        return None;
    }
    let t = (b - disc.sqrt()) / a;
    (t > 0.0).then_some(t)
}

/// Fully observed grid of a sphere's signed distance.
pub fn sphere_grid(bounds: Aabb, volume: &VolumeConfig, center: Pt3, radius: f32) -> VoxelGrid {
    VoxelGrid::from_fn(bounds, volume, move |p| sphere_sdf(p, &center, radius))
}

/// Fully observed grid of a plane through `origin`, positive along `normal`.
pub fn plane_grid(bounds: Aabb, volume: &VolumeConfig, origin: Pt3, normal: Vec3) -> VoxelGrid {
    let normal = normal.normalize();
    VoxelGrid::from_fn(bounds, volume, move |p| plane_sdf(p, &origin, &normal))
}

/// Two spheres of equal radius, the second shifted by `offset_voxels` along x,
/// centred in a cube sized so the truncation band never reaches the border.
pub fn shifted_sphere_pair(
    volume: &VolumeConfig,
    radius: f32,
    offset_voxels: f32,
) -> (VoxelGrid, VoxelGrid) {
    let half = radius + offset_voxels.abs() * volume.voxel_size + 2.0 * volume.truncation_distance;
    let bounds = Aabb::new(Pt3::new(-half, -half, -half), Pt3::new(half, half, half));
    // Centre on a voxel so the pair is symmetric about the grid axes.
    let layout = VoxelGrid::new(bounds, volume);
    let mid = layout.grid_size().map(|n| n / 2);
    let center = layout.world_position(&mid);
    let shifted = center + Vec3::new(offset_voxels * volume.voxel_size, 0.0, 0.0);
    (
        sphere_grid(bounds, volume, center, radius),
        sphere_grid(bounds, volume, shifted, radius),
    )
}
