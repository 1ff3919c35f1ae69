//! Non-rigid volumetric fusion.
//!
//! Depth frames become truncated signed distance grids ([`VoxelGrid`]). Each
//! grid is registered against a canonical model by a per-voxel
//! [`DisplacementField`] that minimises a data term, a level-set term and a
//! Killing rigidity term, then fused into the model.

pub mod camera;
pub mod config;
pub mod error;
pub mod export;
pub mod fusion;
pub mod mesh;
pub mod registration;
pub mod synthetic;

pub use config::{EnergyTerms, FusionConfig, IterationDiscipline, RegistrationConfig, VolumeConfig};
pub use error::{FusionError, Result};
pub use fusion::{DepthFrame, FrameReport, FrameSource, KillingFusion};
pub use mesh::{DisplacementField, Displacements, MeshData, VoxelGrid};
pub use registration::{compute_displacement_field, RegistrationReport};
