//! Properties of the voxel grid that fusion relies on: single-frame
//! integration, fusing a grid with itself, and trilinear sampling.

use approx::assert_relative_eq;
use killing_fusion::camera::{frustum_bounds, intrinsic_matrix, DepthImage};
use killing_fusion::mesh::{DisplacementField, Displacements, Index3, Pt3, Vec3};
use killing_fusion::synthetic::sphere_grid;
use killing_fusion::{VolumeConfig, VoxelGrid};
use nalgebra::Matrix4;

fn volume() -> VolumeConfig {
    VolumeConfig {
        voxel_size: 0.05,
        unknown_clip_distance: 0.1,
        truncation_distance: 0.1,
    }
}

fn sphere() -> VoxelGrid {
    let bounds = killing_fusion::mesh::Aabb::new(Pt3::new(-0.5, -0.5, -0.5), Pt3::new(0.5, 0.5, 0.5));
    sphere_grid(bounds, &volume(), Pt3::new(0.01, -0.02, 0.0), 0.3)
}

#[test]
fn test_single_frame_integration_observes_truncated_distance() {
    // A fronto-parallel wall one metre in front of the camera.
    let k = intrinsic_matrix(10.0, 10.0, 5.0, 5.0);
    let depth = DepthImage::filled(11, 11, 1.0);
    let bounds = frustum_bounds(11, 11, &k, 0.5, 1.5).expect("frustum");
    let mut grid = VoxelGrid::new(bounds, &volume());
    grid.integrate_depth_frame(&depth, &Matrix4::identity(), &k, 0.5, 1.5)
        .expect("integration");

    let mut observed = 0;
    for z in 0..grid.grid_size().z {
        let idx = Index3::new(15, 15, z);
        let p = grid.world_position(&idx);
        let sdf = 1.0 - p.z;
        if sdf < -0.1 {
            assert_eq!(grid.weight_at_index(&idx), 0, "voxel at z={} is behind the clip", p.z);
            assert_eq!(grid.distance_at_index(&idx), 0.1);
        } else {
            observed += 1;
            assert_eq!(grid.weight_at_index(&idx), 1);
            assert_relative_eq!(grid.distance_at_index(&idx), sdf.min(0.1), epsilon = 1e-5);
        }
    }
    assert!(observed > 5);
}

#[test]
fn test_fusing_grid_with_itself_keeps_distances() {
    let mut grid = sphere();
    let copy = grid.clone();
    grid.fuse(&copy).expect("same shape");

    for (a, b) in grid.distances().iter().zip(copy.distances()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-6);
    }
    // Weights accumulate: each voxel has now been seen twice.
    assert!(grid.weights().iter().all(|&w| w == 2));
}

#[test]
fn test_fusing_through_zero_field_keeps_distances_and_counts_the_observation() {
    let mut grid = sphere();
    let copy = grid.clone();
    let zero = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());
    grid.fuse_displaced(&copy, &zero).expect("same shape");

    // Exact: every voxel samples its own copy at an integer location.
    assert_eq!(grid.distances(), copy.distances());
    // The running average counts the fused copy as a second observation.
    for (after, before) in grid.weights().iter().zip(copy.weights()) {
        assert_eq!(*after, 2 * *before);
    }
}

#[test]
fn test_sampling_at_voxel_index_matches_lookup() {
    let grid = sphere();
    let mut field = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());
    for (i, idx) in [Index3::new(0, 0, 0), Index3::new(7, 9, 3), Index3::new(19, 19, 19)]
        .iter()
        .enumerate()
    {
        assert_eq!(grid.distance_at(&idx.cast::<f32>()), grid.distance_at_index(idx));
        assert_eq!(grid.weight_at(&idx.cast::<f32>()), 1.0);

        let d = Vec3::new(0.01 * i as f32, -0.02, 0.03);
        field.set(idx, d);
        assert_eq!(field.sample(&idx.cast::<f32>()), d);
    }
}

#[test]
fn test_sampling_halfway_returns_mean() {
    let grid = sphere();
    let a = Index3::new(8, 10, 10);
    let b = Index3::new(9, 10, 10);
    let halfway = Vec3::new(8.5, 10.0, 10.0);
    let expected = 0.5 * (grid.distance_at_index(&a) + grid.distance_at_index(&b));
    assert_relative_eq!(grid.distance_at(&halfway), expected, epsilon = 1e-6);
}

#[test]
fn test_copy_shape_resets_contents() {
    let grid = sphere();
    let scratch = grid.empty_like();
    assert_eq!(scratch.grid_size(), grid.grid_size());
    assert!(scratch.weights().iter().all(|&w| w == 0));
    assert!(scratch.distances().iter().all(|&d| d == 0.1));
}
