use crate::camera::DepthImage;
use crate::config::VolumeConfig;
use crate::error::{FusionError, Result};
use crate::mesh::grid_trait::{lerp_weight, Displacements};
use crate::mesh::marching;
use crate::mesh::types::{Aabb, Index3, MeshData, Pt3, Vec3};
use nalgebra::{Matrix3, Matrix4};
use rayon::prelude::*;

/// Dense truncated signed distance field over an axis-aligned world region.
///
/// Every voxel holds a `(distance, weight)` pair. Both are stored in flat arrays
/// indexed by `x + y*nx + z*nx*ny`. Grid locations are continuous voxel
/// coordinates: voxel `(i, j, k)` sits at location `(i, j, k)` and its world
/// centre is `min + (index + 0.5) * voxel_size`.
#[derive(Debug, Clone)]
pub struct VoxelGrid {
    grid_size: Index3,
    bounds: Aabb,
    voxel_size: f32,
    unknown_clip_distance: f32,
    truncation_distance: f32,
    distance: Vec<f32>,
    weight: Vec<i64>,
}

impl VoxelGrid {
    /// Allocates an unobserved grid covering `bounds`.
    ///
    /// Dimensions are `ceil(extent / voxel_size)` per axis and never change.
    /// Distances start at the unknown-clip distance and weights at zero.
    pub fn new(bounds: Aabb, volume: &VolumeConfig) -> Self {
        let extent = bounds.extent();
        let cells = |len: f32| ((len / volume.voxel_size).ceil() as usize).max(1);
        let grid_size = Index3::new(cells(extent.x), cells(extent.y), cells(extent.z));
        let total = grid_size.x * grid_size.y * grid_size.z;

        Self {
            grid_size,
            bounds,
            voxel_size: volume.voxel_size,
            unknown_clip_distance: volume.unknown_clip_distance,
            truncation_distance: volume.truncation_distance,
            distance: vec![volume.unknown_clip_distance; total],
            weight: vec![0; total],
        }
    }

    /// Same shape and bounds as `self`, with fresh unobserved contents.
    /// Used to allocate scratch grids; `clone` copies the values instead.
    pub fn empty_like(&self) -> Self {
        let total = self.distance.len();
        Self {
            distance: vec![self.unknown_clip_distance; total],
            weight: vec![0; total],
            ..*self
        }
    }

    /// Builds a fully observed grid (weight 1) from an analytic distance function
    /// evaluated in parallel at every voxel centre.
    pub fn from_fn<F>(bounds: Aabb, volume: &VolumeConfig, sdf: F) -> Self
    where
        F: Fn(&Pt3) -> f32 + Sync,
    {
        let mut grid = Self::new(bounds, volume);
        let size = grid.grid_size;
        let min = grid.bounds.min;
        let voxel_size = grid.voxel_size;
        let (lo, hi) = (-grid.unknown_clip_distance, grid.truncation_distance);

        grid.distance
            .par_iter_mut()
            .zip(grid.weight.par_iter_mut())
            .enumerate()
            .for_each(|(i, (distance, weight))| {
                let idx = unflatten(i, &size);
                let pos = voxel_center(&min, voxel_size, &idx);
                *distance = sdf(&pos).clamp(lo, hi);
                *weight = 1;
            });
        grid
    }

    pub fn grid_size(&self) -> Index3 {
        self.grid_size
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn unknown_clip_distance(&self) -> f32 {
        self.unknown_clip_distance
    }

    pub fn truncation_distance(&self) -> f32 {
        self.truncation_distance
    }

    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    /// Distances in storage order (x fastest, then y, then z).
    pub fn distances(&self) -> &[f32] {
        &self.distance
    }

    /// Weights in storage order.
    pub fn weights(&self) -> &[i64] {
        &self.weight
    }

    #[inline]
    pub fn linear_index(&self, index: &Index3) -> usize {
        index.x + index.y * self.grid_size.x + index.z * self.grid_size.x * self.grid_size.y
    }

    #[inline]
    pub fn spatial_index(&self, linear: usize) -> Index3 {
        unflatten(linear, &self.grid_size)
    }

    pub fn index_in_grid_bounds(&self, x: isize, y: isize, z: isize) -> bool {
        x >= 0
            && y >= 0
            && z >= 0
            && (x as usize) < self.grid_size.x
            && (y as usize) < self.grid_size.y
            && (z as usize) < self.grid_size.z
    }

    pub fn in_bounds(&self, index: &Index3) -> bool {
        index.x < self.grid_size.x && index.y < self.grid_size.y && index.z < self.grid_size.z
    }

    /// World-space centre of a voxel.
    pub fn world_position(&self, index: &Index3) -> Pt3 {
        voxel_center(&self.bounds.min, self.voxel_size, index)
    }

    /// World point for a continuous grid location.
    pub fn location_to_world(&self, location: &Vec3) -> Pt3 {
        self.bounds.min + (location + Vec3::repeat(0.5)) * self.voxel_size
    }

    /// Continuous grid location of a world point.
    pub fn world_to_location(&self, point: &Pt3) -> Vec3 {
        (point - self.bounds.min) / self.voxel_size - Vec3::repeat(0.5)
    }

    /// Direct lookup. Panics when `index` is outside the grid; check
    /// [`VoxelGrid::in_bounds`] first.
    pub fn distance_at_index(&self, index: &Index3) -> f32 {
        self.distance[self.linear_index(index)]
    }

    /// Direct lookup. Panics when `index` is outside the grid.
    pub fn weight_at_index(&self, index: &Index3) -> i64 {
        self.weight[self.linear_index(index)]
    }

    /// Overwrites a voxel; the distance is clamped into the truncation band.
    pub fn set_voxel(&mut self, index: &Index3, distance: f32, weight: i64) {
        let i = self.linear_index(index);
        self.distance[i] = distance.clamp(-self.unknown_clip_distance, self.truncation_distance);
        self.weight[i] = weight;
    }

    /// Trilinear interpolation of the distance at a continuous grid location.
    /// Corners outside the grid read as the unknown-clip distance.
    pub fn distance_at(&self, location: &Vec3) -> f32 {
        self.trilinear(location, |i| self.distance[i], self.unknown_clip_distance)
    }

    /// Trilinear interpolation of the weight. Corners outside the grid read as 0.
    pub fn weight_at(&self, location: &Vec3) -> f32 {
        self.trilinear(location, |i| self.weight[i] as f32, 0.0)
    }

    fn trilinear(&self, location: &Vec3, value: impl Fn(usize) -> f32, outside: f32) -> f32 {
        let base = location.map(f32::floor);
        let t = location - base;
        let x0 = base.x as isize;
        let y0 = base.y as isize;
        let z0 = base.z as isize;

        let mut acc = 0.0;
        for corner in 0..8 {
            let (dx, dy, dz) = (corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let w = lerp_weight(t.x, dx) * lerp_weight(t.y, dy) * lerp_weight(t.z, dz);
            if w == 0.0 {
                continue;
            }
            let (x, y, z) = (
                x0.saturating_add(dx),
                y0.saturating_add(dy),
                z0.saturating_add(dz),
            );
            let v = if self.index_in_grid_bounds(x, y, z) {
                value(x as usize + y as usize * self.grid_size.x
                    + z as usize * self.grid_size.x * self.grid_size.y)
            } else {
                outside
            };
            acc += w * v;
        }
        acc
    }

    /// Location reached from `index` by following the displacement field.
    pub fn displaced_location<F: Displacements + ?Sized>(&self, index: &Index3, field: &F) -> Vec3 {
        index.cast::<f32>() + field.grid_offset(index)
    }

    /// Distance sampled at `index + displacement(index)`.
    pub fn distance_through<F: Displacements + ?Sized>(&self, index: &Index3, field: &F) -> f32 {
        self.distance_at(&self.displaced_location(index, field))
    }

    /// Weight sampled at `index + displacement(index)`.
    pub fn weight_through<F: Displacements + ?Sized>(&self, index: &Index3, field: &F) -> f32 {
        self.weight_at(&self.displaced_location(index, field))
    }

    /// Central-difference distance gradient with a one-voxel step.
    /// Voxel units: divide by the voxel size for metres.
    pub fn distance_gradient(&self, location: &Vec3) -> Vec3 {
        let mut grad = Vec3::zeros();
        for axis in 0..3 {
            let step = Vec3::ith(axis, 1.0);
            grad[axis] = (self.distance_at(&(location + step))
                - self.distance_at(&(location - step)))
                * 0.5;
        }
        grad
    }

    pub fn distance_gradient_through<F: Displacements + ?Sized>(
        &self,
        index: &Index3,
        field: &F,
    ) -> Vec3 {
        self.distance_gradient(&self.displaced_location(index, field))
    }

    /// Central-difference distance Hessian (symmetric) with a one-voxel step.
    /// Voxel units: divide by the squared voxel size for metres.
    pub fn distance_hessian(&self, location: &Vec3) -> Matrix3<f32> {
        let d = |offset: Vec3| self.distance_at(&(location + offset));
        let center = d(Vec3::zeros());
        let mut hessian = Matrix3::zeros();
        for a in 0..3 {
            let ea = Vec3::ith(a, 1.0);
            hessian[(a, a)] = d(ea) - 2.0 * center + d(-ea);
            for b in (a + 1)..3 {
                let eb = Vec3::ith(b, 1.0);
                let mixed = (d(ea + eb) - d(ea - eb) - d(-ea + eb) + d(-ea - eb)) * 0.25;
                hessian[(a, b)] = mixed;
                hessian[(b, a)] = mixed;
            }
        }
        hessian
    }

    pub fn distance_hessian_through<F: Displacements + ?Sized>(
        &self,
        index: &Index3,
        field: &F,
    ) -> Matrix3<f32> {
        self.distance_hessian(&self.displaced_location(index, field))
    }

    /// Integrates one depth frame with a weighted running average.
    ///
    /// Each voxel centre is projected into the image through `camera_to_world`
    /// (inverted) and the pinhole `intrinsics`. Voxels that fall outside the
    /// image, hit an invalid depth, lie outside `[min_depth, max_depth]`, or sit
    /// further than the unknown-clip distance behind the surface are untouched.
    pub fn integrate_depth_frame(
        &mut self,
        depth: &DepthImage,
        camera_to_world: &Matrix4<f32>,
        intrinsics: &Matrix3<f32>,
        min_depth: f32,
        max_depth: f32,
    ) -> Result<()> {
        let world_to_camera = camera_to_world
            .try_inverse()
            .ok_or(FusionError::SingularPose)?;
        let (fx, fy) = (intrinsics[(0, 0)], intrinsics[(1, 1)]);
        let (cx, cy) = (intrinsics[(0, 2)], intrinsics[(1, 2)]);
        let size = self.grid_size;
        let min = self.bounds.min;
        let voxel_size = self.voxel_size;
        let (lo, hi) = (-self.unknown_clip_distance, self.truncation_distance);

        self.distance
            .par_iter_mut()
            .zip(self.weight.par_iter_mut())
            .enumerate()
            .for_each(|(i, (distance, weight))| {
                let world = voxel_center(&min, voxel_size, &unflatten(i, &size));
                let cam = world_to_camera.transform_point(&world);
                if cam.z <= 0.0 {
                    return;
                }
                let u = (fx * cam.x / cam.z + cx).round();
                let v = (fy * cam.y / cam.z + cy).round();
                let Some(measured) = depth.sample(u, v) else {
                    return;
                };
                if !measured.is_finite() || measured < min_depth || measured > max_depth {
                    return;
                }

                let sdf = measured - cam.z;
                if sdf < lo {
                    return;
                }
                let sdf = sdf.min(hi);
                let old = *weight as f32;
                *distance = ((*distance * old + sdf) / (old + 1.0)).clamp(lo, hi);
                *weight += 1;
            });
        Ok(())
    }

    /// Fuses `other` voxel by voxel; both grids must share a shape.
    pub fn fuse(&mut self, other: &VoxelGrid) -> Result<()> {
        self.check_shape(&other.grid_size)?;
        let (lo, hi) = (-self.unknown_clip_distance, self.truncation_distance);

        self.distance
            .par_iter_mut()
            .zip(self.weight.par_iter_mut())
            .zip(other.distance.par_iter().zip(other.weight.par_iter()))
            .for_each(|((distance, weight), (&other_distance, &other_weight))| {
                blend(distance, weight, other_distance, other_weight as f32, lo, hi);
            });
        Ok(())
    }

    /// Fuses `other` deformed by `field`: voxel `i` takes `other` sampled at
    /// `i + field(i)` instead of at `i`.
    pub fn fuse_displaced<F: Displacements + ?Sized>(
        &mut self,
        other: &VoxelGrid,
        field: &F,
    ) -> Result<()> {
        self.check_shape(&other.grid_size)?;
        self.check_shape(&field.grid_size())?;
        let size = self.grid_size;
        let (lo, hi) = (-self.unknown_clip_distance, self.truncation_distance);

        self.distance
            .par_iter_mut()
            .zip(self.weight.par_iter_mut())
            .enumerate()
            .for_each(|(i, (distance, weight))| {
                let location = other.displaced_location(&unflatten(i, &size), field);
                let sample_weight = other.weight_at(&location);
                if sample_weight <= 0.0 {
                    return;
                }
                blend(
                    distance,
                    weight,
                    other.distance_at(&location),
                    sample_weight,
                    lo,
                    hi,
                );
            });
        Ok(())
    }

    /// Resamples this grid through `field` in place: voxel `i` takes the
    /// distance and weight found at `i + field(i)`.
    pub fn update<F: Displacements + ?Sized>(&mut self, field: &F) -> Result<()> {
        self.check_shape(&field.grid_size())?;
        let size = self.grid_size;

        let resampled: Vec<(f32, i64)> = (0..self.len())
            .into_par_iter()
            .map(|i| {
                let location = self.displaced_location(&unflatten(i, &size), field);
                (
                    self.distance_at(&location),
                    self.weight_at(&location).round() as i64,
                )
            })
            .collect();

        for (i, (distance, weight)) in resampled.into_iter().enumerate() {
            self.distance[i] = distance;
            self.weight[i] = weight;
        }
        Ok(())
    }

    /// Zero-isosurface of the grid.
    pub fn mesh(&self) -> MeshData {
        marching::extract_isosurface(self, |idx| {
            (self.distance_at_index(idx), self.weight_at_index(idx) as f32)
        })
    }

    /// Zero-isosurface of the grid deformed by `field`.
    pub fn mesh_displaced<F: Displacements + ?Sized>(&self, field: &F) -> MeshData {
        marching::extract_isosurface(self, |idx| {
            (self.distance_through(idx, field), self.weight_through(idx, field))
        })
    }

    /// Number of voxels with a positive weight.
    pub fn observed_count(&self) -> usize {
        self.weight.iter().filter(|&&w| w > 0).count()
    }

    pub fn check_shape(&self, other: &Index3) -> Result<()> {
        if self.grid_size != *other {
            return Err(FusionError::ShapeMismatch {
                expected: self.grid_size.into(),
                found: (*other).into(),
            });
        }
        Ok(())
    }
}

/// Weighted running average of one sample into a voxel.
#[inline]
fn blend(distance: &mut f32, weight: &mut i64, sample: f32, sample_weight: f32, lo: f32, hi: f32) {
    if sample_weight <= 0.0 {
        return;
    }
    let old = *weight as f32;
    *distance = ((*distance * old + sample * sample_weight) / (old + sample_weight)).clamp(lo, hi);
    *weight += (sample_weight.round() as i64).max(1);
}

#[inline]
fn unflatten(linear: usize, size: &Index3) -> Index3 {
    Index3::new(
        linear % size.x,
        (linear / size.x) % size.y,
        linear / (size.x * size.y),
    )
}

#[inline]
fn voxel_center(min: &Pt3, voxel_size: f32, index: &Index3) -> Pt3 {
    min + (index.cast::<f32>() + Vec3::repeat(0.5)) * voxel_size
}
