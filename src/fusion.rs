//! Frame sequencing: build each frame's SDF, register it against the canonical
//! model, resample it through the field and fuse.

use crate::camera::{frustum_bounds, DepthImage};
use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::mesh::{Aabb, DisplacementField, MeshData, VoxelGrid};
use crate::registration::{compute_displacement_field, RegistrationReport};
use nalgebra::{Matrix3, Matrix4};
use serde::Serialize;
use std::time::Instant;
use tracing::info;

/// One captured depth frame and the camera pose it was taken from.
#[derive(Debug, Clone)]
pub struct DepthFrame {
    pub depth: DepthImage,
    pub camera_to_world: Matrix4<f32>,
}

/// Anything that can hand out depth frames with fixed intrinsics.
pub trait FrameSource {
    fn depth_width(&self) -> usize;
    fn depth_height(&self) -> usize;
    fn depth_intrinsics(&self) -> Matrix3<f32>;
    /// Depth readings below this are ignored.
    fn min_depth(&self) -> f32;
    /// Depth readings above this are ignored.
    fn max_depth(&self) -> f32;
    fn frame_count(&self) -> usize;
    fn frame(&self, index: usize) -> Result<DepthFrame>;
}

/// Timings in seconds and the registration outcome for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame: usize,
    pub sdf_seconds: f64,
    pub registration_seconds: f64,
    pub fusion_seconds: f64,
    pub total_seconds: f64,
    /// `None` for the seeding frame and when every energy term is off.
    pub registration: Option<RegistrationReport>,
}

/// Surfaces produced while processing one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameMeshes {
    /// The frame's own SDF, before registration.
    pub input: MeshData,
    /// The frame's SDF after resampling through the displacement field.
    pub registered: MeshData,
    /// The canonical model after fusion.
    pub canonical: MeshData,
}

#[derive(Debug)]
pub struct FrameOutput {
    pub report: FrameReport,
    pub meshes: FrameMeshes,
}

/// Non-rigid fusion of a frame stream into one canonical SDF.
///
/// The first processed frame seeds the canonical grid. Every later frame is
/// registered against the canonical grid, resampled through the resulting
/// field and fused into it. Frames run strictly one after another.
pub struct KillingFusion<S: FrameSource> {
    source: S,
    config: FusionConfig,
    bounds: Aabb,
    canonical: Option<VoxelGrid>,
    field: Option<DisplacementField>,
    next_frame: usize,
    end_frame: usize,
}

impl<S: FrameSource> KillingFusion<S> {
    /// Validates `config` and sizes every grid from the source's frustum.
    pub fn new(source: S, config: FusionConfig) -> Result<Self> {
        config.validate()?;
        let bounds = frustum_bounds(
            source.depth_width(),
            source.depth_height(),
            &source.depth_intrinsics(),
            source.min_depth(),
            source.max_depth(),
        )?;
        let end_frame = config
            .end_frame
            .map_or(source.frame_count(), |end| end.min(source.frame_count()));

        let layout = VoxelGrid::new(bounds, &config.volume);
        info!(
            grid_size = ?layout.grid_size(),
            voxels = layout.len(),
            start = config.start_frame,
            end = end_frame,
            "fusion volume allocated"
        );

        Ok(Self {
            next_frame: config.start_frame,
            source,
            config,
            bounds,
            canonical: None,
            field: None,
            end_frame,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    pub fn bounds(&self) -> Aabb {
        self.bounds
    }

    /// The canonical model, once the first frame has been processed.
    pub fn canonical(&self) -> Option<&VoxelGrid> {
        self.canonical.as_ref()
    }

    /// The field that registered the most recent frame.
    pub fn displacement_field(&self) -> Option<&DisplacementField> {
        self.field.as_ref()
    }

    pub fn into_canonical(self) -> Option<VoxelGrid> {
        self.canonical
    }

    pub fn next_frame_index(&self) -> usize {
        self.next_frame
    }

    pub fn remaining_frames(&self) -> usize {
        let stride = self.config.stride.max(1);
        self.end_frame.saturating_sub(self.next_frame).div_ceil(stride)
    }

    pub fn is_finished(&self) -> bool {
        self.next_frame >= self.end_frame
    }

    /// Integrates frame `index` into a fresh grid over the shared bounds.
    pub fn compute_sdf(&self, index: usize) -> Result<VoxelGrid> {
        if index >= self.source.frame_count() {
            return Err(FusionError::MissingFrame(index));
        }
        let frame = self.source.frame(index)?;
        let mut grid = VoxelGrid::new(self.bounds, &self.config.volume);
        grid.integrate_depth_frame(
            &frame.depth,
            &frame.camera_to_world,
            &self.source.depth_intrinsics(),
            self.source.min_depth(),
            self.source.max_depth(),
        )?;
        Ok(grid)
    }

    /// Processes the next frame of the configured range, or returns `None`
    /// once the range is exhausted.
    ///
    /// A divergence during registration is returned as an error. The
    /// canonical model is left as it was before the frame in that case.
    pub fn process_next_frame(&mut self) -> Result<Option<FrameOutput>> {
        if self.is_finished() {
            return Ok(None);
        }
        let index = self.next_frame;
        let total = Instant::now();

        let timer = Instant::now();
        let mut current = self.compute_sdf(index)?;
        let sdf_seconds = timer.elapsed().as_secs_f64();

        let output = match self.canonical.as_mut() {
            None => {
                let field = DisplacementField::zeros(current.grid_size(), current.voxel_size());
                let meshes = FrameMeshes {
                    input: current.mesh(),
                    registered: current.mesh_displaced(&field),
                    canonical: current.mesh(),
                };
                self.canonical = Some(current);
                self.field = Some(field);
                FrameOutput {
                    report: FrameReport {
                        frame: index,
                        sdf_seconds,
                        registration_seconds: 0.0,
                        fusion_seconds: 0.0,
                        total_seconds: total.elapsed().as_secs_f64(),
                        registration: None,
                    },
                    meshes,
                }
            }
            Some(canonical) => {
                let mut field = match self.field.take() {
                    Some(previous) if self.config.reuse_previous_field => previous,
                    _ => DisplacementField::zeros(current.grid_size(), current.voxel_size()),
                };

                let timer = Instant::now();
                let registration = if self.config.registration.energies.any() {
                    let report = compute_displacement_field(
                        &current,
                        canonical,
                        &mut field,
                        &self.config.registration,
                    )?;
                    if let Some(dir) = &self.config.field_output_dir {
                        field.dump_to_bin_file(&dir.join(format!("{:03}.bin", index)))?;
                    }
                    Some(report)
                } else {
                    None
                };
                let registration_seconds = timer.elapsed().as_secs_f64();

                let timer = Instant::now();
                let input = current.mesh();
                current.update(&field)?;
                canonical.fuse(&current)?;
                let registered = current.mesh();
                let fusion_seconds = timer.elapsed().as_secs_f64();

                let meshes = FrameMeshes {
                    input,
                    registered,
                    canonical: canonical.mesh(),
                };
                self.field = Some(field);
                FrameOutput {
                    report: FrameReport {
                        frame: index,
                        sdf_seconds,
                        registration_seconds,
                        fusion_seconds,
                        total_seconds: total.elapsed().as_secs_f64(),
                        registration,
                    },
                    meshes,
                }
            }
        };

        let report = &output.report;
        info!(
            frame = index,
            sdf_s = report.sdf_seconds,
            registration_s = report.registration_seconds,
            fusion_s = report.fusion_seconds,
            total_s = report.total_seconds,
            iterations = report.registration.map(|r| r.iterations),
            "frame processed"
        );

        self.next_frame += self.config.stride.max(1);
        Ok(Some(output))
    }
}
