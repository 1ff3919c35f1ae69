pub mod displacement;
pub mod grid_trait;
pub mod marching;
pub mod sdf;
pub mod types;
pub mod voxel_grid;

// Re-export commonly used items
pub use displacement::DisplacementField;
pub use grid_trait::Displacements;
pub use marching::extract_isosurface;
pub use types::{Aabb, Index3, MeshData, Pt3, Vec3};
pub use voxel_grid::VoxelGrid;
