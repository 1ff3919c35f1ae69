// Trait for abstracting over different displacement storage implementations
// Lets the energy terms read both the dense field and the shared atomic mirror

use crate::mesh::types::{Index3, Vec3};
use nalgebra::Matrix3;

/// Read access to a per-voxel displacement store, co-indexed with a voxel grid.
/// Must be Sync for parallel registration passes
pub trait Displacements: Sync {
    /// Grid dimensions `(nx, ny, nz)`
    fn grid_size(&self) -> Index3;

    /// Voxel edge length of the associated grid, in metres
    fn voxel_size(&self) -> f32;

    /// Displacement (metres) stored at an in-bounds voxel
    fn get(&self, x: usize, y: usize, z: usize) -> Vec3;

    fn at(&self, index: &Index3) -> Vec3 {
        self.get(index.x, index.y, index.z)
    }

    /// Lookup with each coordinate clamped into the grid, never wrapped
    fn get_clamped(&self, x: isize, y: isize, z: isize) -> Vec3 {
        let size = self.grid_size();
        self.get(
            clamp_axis(x, size.x),
            clamp_axis(y, size.y),
            clamp_axis(z, size.z),
        )
    }

    /// Displacement at `index` expressed in voxel units
    fn grid_offset(&self, index: &Index3) -> Vec3 {
        self.at(index) / self.voxel_size()
    }

    /// Trilinear interpolation over the 8 surrounding vectors.
    /// At integer locations this returns the stored vector exactly.
    fn sample(&self, location: &Vec3) -> Vec3 {
        let base = location.map(f32::floor);
        let t = location - base;
        let x0 = base.x as isize;
        let y0 = base.y as isize;
        let z0 = base.z as isize;

        let mut acc = Vec3::zeros();
        for corner in 0..8 {
            let (dx, dy, dz) = (corner & 1, (corner >> 1) & 1, (corner >> 2) & 1);
            let w = lerp_weight(t.x, dx) * lerp_weight(t.y, dy) * lerp_weight(t.z, dz);
            if w == 0.0 {
                continue;
            }
            acc += self.get_clamped(
                x0.saturating_add(dx),
                y0.saturating_add(dy),
                z0.saturating_add(dz),
            ) * w;
        }
        acc
    }

    /// Central-difference Jacobian at a voxel, in metres per voxel.
    /// Column `k` holds the derivative along axis `k`; one-sided at the grid border.
    fn jacobian(&self, index: &Index3) -> Matrix3<f32> {
        let size = self.grid_size();
        let mut jac = Matrix3::zeros();
        for axis in 0..3 {
            let lo = index[axis].saturating_sub(1);
            let hi = (index[axis] + 1).min(size[axis] - 1);
            if hi == lo {
                continue;
            }
            let mut lo_index = *index;
            let mut hi_index = *index;
            lo_index[axis] = lo;
            hi_index[axis] = hi;
            let derivative = (self.at(&hi_index) - self.at(&lo_index)) / (hi - lo) as f32;
            jac.set_column(axis, &derivative);
        }
        jac
    }

    /// Per-voxel Killing energy `‖J‖² + γ·tr(J·J)`
    fn killing_energy(&self, index: &Index3, gamma: f32) -> f32 {
        let jac = self.jacobian(index);
        jac.norm_squared() + gamma * (jac * jac).trace()
    }

    /// Gradient of the summed Killing energy with respect to the displacement at `index`.
    ///
    /// With `D_k = J(p - e_k) - J(p + e_k)` the gradient is
    /// `Σ_k ((1 + γ)·S_k + (1 - γ)·R_k)·e_k`, where `S_k` and `R_k` are the
    /// strain and rotation parts of `D_k`.
    fn killing_gradient(&self, index: &Index3, gamma: f32) -> Vec3 {
        let size = self.grid_size();
        let mut grad = Vec3::zeros();
        for axis in 0..3 {
            let mut lo_index = *index;
            let mut hi_index = *index;
            lo_index[axis] = index[axis].saturating_sub(1);
            hi_index[axis] = (index[axis] + 1).min(size[axis] - 1);

            let delta = self.jacobian(&lo_index) - self.jacobian(&hi_index);
            let (strain, rotation) = strain_rotation(&delta);
            let combined = strain * (1.0 + gamma) + rotation * (1.0 - gamma);
            grad += combined.column(axis);
        }
        grad
    }
}

/// Splits a matrix into its symmetric (strain) and antisymmetric (rotation) parts.
pub fn strain_rotation(m: &Matrix3<f32>) -> (Matrix3<f32>, Matrix3<f32>) {
    let transposed = m.transpose();
    ((m + transposed) * 0.5, (m - transposed) * 0.5)
}

#[inline]
pub(crate) fn clamp_axis(value: isize, len: usize) -> usize {
    value.clamp(0, len as isize - 1) as usize
}

#[inline]
pub(crate) fn lerp_weight(t: f32, upper: isize) -> f32 {
    if upper == 1 {
        t
    } else {
        1.0 - t
    }
}
