//! Per-voxel energy terms of the registration.
//!
//! Gradients are taken with respect to the displacement in voxel units over
//! distances normalised by the voxel size, then scaled back to metres. A step
//! of `-alpha * gradient` therefore moves a voxel by metres directly, and
//! `alpha` means the same thing for every term and every voxel size.
//! Everything is accumulated in `f64`; a step too large for `f32` surfaces as
//! a non-finite displacement when it is stored.

use crate::config::RegistrationConfig;
use crate::mesh::grid_trait::Displacements;
use crate::mesh::types::Index3;
use crate::mesh::voxel_grid::VoxelGrid;
use nalgebra::{Matrix3, Vector3};
use serde::Serialize;

pub type Gradient = Vector3<f64>;

/// Energy of one voxel (or a sum over voxels), split by term. Unweighted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EnergyBreakdown {
    pub data: f64,
    pub level_set: f64,
    pub killing: f64,
}

impl EnergyBreakdown {
    /// Weighted sum over the enabled terms.
    pub fn total(&self, config: &RegistrationConfig) -> f64 {
        let mut total = 0.0;
        if config.energies.data {
            total += self.data;
        }
        if config.energies.level_set {
            total += config.omega_level_set * self.level_set;
        }
        if config.energies.killing {
            total += config.omega_killing * self.killing;
        }
        total
    }
}

impl std::ops::Add for EnergyBreakdown {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            data: self.data + other.data,
            level_set: self.level_set + other.level_set,
            killing: self.killing + other.killing,
        }
    }
}

/// Whether a voxel takes part in registration: its displaced source distance
/// must lie inside the band where the distance field carries a gradient.
pub fn is_active(src_distance: f32, src: &VoxelGrid, epsilon: f64) -> bool {
    let distance = src_distance as f64;
    distance <= src.truncation_distance() as f64 - epsilon
        && distance >= -(src.unknown_clip_distance() as f64)
}

/// Data term: pulls the displaced source distance onto the destination's.
pub fn data_gradient<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    index: &Index3,
) -> Gradient {
    let vs = src.voxel_size() as f64;
    let residual = src.distance_through(index, field) as f64 - dest.distance_at_index(index) as f64;
    let slope = src.distance_gradient_through(index, field).cast::<f64>() / vs;
    slope * residual
}

/// Level-set term: drives the source gradient magnitude towards 1.
pub fn level_set_gradient<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    field: &F,
    index: &Index3,
    epsilon: f64,
) -> Gradient {
    let vs = src.voxel_size() as f64;
    let slope = src.distance_gradient_through(index, field).cast::<f64>() / vs;
    let hessian: Matrix3<f64> = src.distance_hessian_through(index, field).cast::<f64>() / vs;
    let norm = slope.norm();
    hessian * slope * ((norm - 1.0) / (norm + epsilon)) * vs
}

/// Killing term: penalises non-rigid local motion of the field.
pub fn killing_gradient<F: Displacements + ?Sized>(field: &F, index: &Index3, gamma: f64) -> Gradient {
    field.killing_gradient(index, gamma as f32).cast::<f64>()
}

/// Weighted sum of the enabled gradients at `index`.
pub fn energy_gradient<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    index: &Index3,
    config: &RegistrationConfig,
) -> Gradient {
    let mut gradient = Gradient::zeros();
    if config.energies.data {
        gradient += data_gradient(src, dest, field, index);
    }
    if config.energies.level_set {
        gradient += level_set_gradient(src, field, index, config.epsilon) * config.omega_level_set;
    }
    if config.energies.killing {
        gradient += killing_gradient(field, index, config.killing_gamma) * config.omega_killing;
    }
    gradient
}

/// All three energies at `index`, whether or not they are enabled.
///
/// Data energy is `½(φs − φd)²` in square metres, level-set energy
/// `½(|∇φs| − 1)²` and Killing energy uses the unitless Jacobian.
pub fn voxel_energy<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    index: &Index3,
    gamma: f64,
) -> EnergyBreakdown {
    let vs = src.voxel_size() as f64;
    let residual = src.distance_through(index, field) as f64 - dest.distance_at_index(index) as f64;
    let slope = src.distance_gradient_through(index, field).cast::<f64>() / vs;
    let jacobian: Matrix3<f64> = field.jacobian(index).cast::<f64>() / vs;

    EnergyBreakdown {
        data: 0.5 * residual * residual,
        level_set: 0.5 * (slope.norm() - 1.0).powi(2),
        killing: jacobian.norm_squared() + gamma * (jacobian * jacobian).trace(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::mesh::displacement::DisplacementField;
    use crate::mesh::types::{Aabb, Pt3, Vec3};
    use crate::synthetic::plane_grid;
    use approx::assert_relative_eq;

    fn volume() -> VolumeConfig {
        VolumeConfig {
            voxel_size: 0.1,
            unknown_clip_distance: 0.4,
            truncation_distance: 0.4,
        }
    }

    fn plane(offset: f32) -> VoxelGrid {
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.0, 1.0, 1.0));
        plane_grid(bounds, &volume(), Pt3::new(offset, 0.0, 0.0), Vec3::x())
    }

    #[test]
    fn data_gradient_vanishes_for_identical_grids() {
        let grid = plane(0.5);
        let field = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());
        let g = data_gradient(&grid, &grid, &field, &Index3::new(4, 5, 5));
        assert_relative_eq!(g.norm(), 0.0);
    }

    #[test]
    fn data_gradient_points_along_residual() {
        // Source plane sits 0.1 m further along +x than the destination.
        let src = plane(0.6);
        let dest = plane(0.5);
        let field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let g = data_gradient(&src, &dest, &field, &Index3::new(5, 5, 5));
        // residual -0.1 m, unit slope along x
        assert_relative_eq!(g, Gradient::new(-0.1, 0.0, 0.0), epsilon = 1e-6);

        // Stepping against the gradient moves the voxel onto the source plane.
        let step = -g * 1.0;
        let mut moved = field.clone();
        moved.set(&Index3::new(5, 5, 5), step.cast::<f32>());
        let residual = src.distance_through(&Index3::new(5, 5, 5), &moved)
            - dest.distance_at_index(&Index3::new(5, 5, 5));
        assert_relative_eq!(residual, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn level_set_gradient_vanishes_on_true_distance_field() {
        let grid = plane(0.5);
        let field = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());
        let g = level_set_gradient(&grid, &field, &Index3::new(5, 4, 4), 1e-5);
        assert_relative_eq!(g.norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn killing_gradient_of_translation_is_zero() {
        let field = DisplacementField::uniform(Index3::new(5, 5, 5), 0.1, Vec3::new(0.02, -0.01, 0.0));
        let g = killing_gradient(&field, &Index3::new(2, 2, 2), 0.1);
        assert_relative_eq!(g.norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn disabled_terms_do_not_contribute() {
        let src = plane(0.6);
        let dest = plane(0.5);
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        field.set(&Index3::new(5, 5, 5), Vec3::new(0.03, 0.0, 0.0));
        let idx = Index3::new(5, 5, 5);

        let mut config = RegistrationConfig {
            energies: crate::config::EnergyTerms::data_only(),
            ..RegistrationConfig::default()
        };
        let data_only = energy_gradient(&src, &dest, &field, &idx, &config);
        assert_relative_eq!(data_only, data_gradient(&src, &dest, &field, &idx));

        config.energies.killing = true;
        let with_killing = energy_gradient(&src, &dest, &field, &idx, &config);
        let killing = killing_gradient(&field, &idx, config.killing_gamma) * config.omega_killing;
        assert_relative_eq!(with_killing, data_only + killing, epsilon = 1e-9);
        assert!(killing.norm() > 0.0);
    }

    #[test]
    fn voxel_energy_of_matching_grids() {
        let grid = plane(0.5);
        let field = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());
        let energy = voxel_energy(&grid, &grid, &field, &Index3::new(5, 5, 5), 0.1);
        assert_relative_eq!(energy.data, 0.0);
        assert_relative_eq!(energy.level_set, 0.0, epsilon = 1e-9);
        assert_relative_eq!(energy.killing, 0.0);
    }

    #[test]
    fn selection_skips_far_voxels() {
        let grid = plane(0.5);
        assert!(is_active(0.0, &grid, 1e-5));
        assert!(is_active(-0.4, &grid, 1e-5));
        assert!(!is_active(0.4, &grid, 1e-5));
        assert!(!is_active(-0.41, &grid, 1e-5));
    }
}
