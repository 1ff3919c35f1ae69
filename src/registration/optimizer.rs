use crate::config::{IterationDiscipline, RegistrationConfig};
use crate::error::Result;
use crate::mesh::displacement::{ensure_bounded, ensure_finite, DisplacementField};
use crate::mesh::grid_trait::Displacements;
use crate::mesh::types::{Index3, Vec3};
use crate::mesh::voxel_grid::VoxelGrid;
use crate::registration::atomic_field::AtomicDisplacementField;
use crate::registration::energy::{energy_gradient, is_active, voxel_energy, EnergyBreakdown, Gradient};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, trace, warn};

const TRUST_REGION_SHRINK: f64 = 1.5;
const TRUST_REGION_MIN_STEP: f64 = 1e-7;
/// Longest single step, in band widths, before a run counts as diverged.
pub const MAX_STEP_BANDS: f32 = 4.0;

/// Outcome of one registration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RegistrationReport {
    /// Full-grid passes (synchronous) or the longest per-voxel loop (asynchronous).
    pub iterations: usize,
    /// Stopped on the convergence threshold rather than the iteration cap.
    pub converged: bool,
    /// Largest per-voxel update of the last pass, in metres.
    pub max_update: f64,
    pub active_voxels: usize,
    /// Voxels whose trust-region backtracking found no improving step.
    pub stalled_voxels: usize,
    /// Energy of the final field over the active voxels.
    pub energy: EnergyBreakdown,
}

/// Refines `field` so that `src` seen through it matches `dest`.
///
/// `field` is the initial guess and receives the result. All three must share
/// a shape. With no energy term enabled the field is returned untouched.
///
/// Fails with `Diverged` as soon as any displacement turns non-finite or a
/// single step spans more than [`MAX_STEP_BANDS`] band widths
/// (`truncation + unknown_clip`). The distance field carries no gradient
/// information that far out. The synchronous discipline then
/// leaves the field as of the last completed pass; the asynchronous one
/// leaves it untouched.
///
/// A run is only reported as converged while voxels remain in the band. If
/// every active voxel was pushed out of it, `converged` is false.
pub fn compute_displacement_field(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &mut DisplacementField,
    config: &RegistrationConfig,
) -> Result<RegistrationReport> {
    src.check_shape(&dest.grid_size())?;
    src.check_shape(&field.grid_size())?;
    if !config.energies.any() {
        return Ok(RegistrationReport {
            converged: true,
            ..RegistrationReport::default()
        });
    }

    let result = match config.discipline {
        IterationDiscipline::Synchronous => synchronous(src, dest, field, config),
        IterationDiscipline::Asynchronous => asynchronous(src, dest, field, config),
    };

    match result {
        Ok(mut report) => {
            report.energy = total_energy(src, dest, field, config);
            Ok(report)
        }
        Err(err) => {
            warn!(error = %err, "registration aborted");
            Err(err)
        }
    }
}

/// Summed energy over the voxels that currently take part in registration.
pub fn total_energy<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    config: &RegistrationConfig,
) -> EnergyBreakdown {
    (0..src.len())
        .into_par_iter()
        .filter_map(|i| {
            let index = src.spatial_index(i);
            is_active(src.distance_through(&index, field), src, config.epsilon)
                .then(|| voxel_energy(src, dest, field, &index, config.killing_gamma))
        })
        .reduce(EnergyBreakdown::default, |a, b| a + b)
}

#[derive(Debug, Clone, Copy, Default)]
struct PassStats {
    max_update: f64,
    active: usize,
    stalled: usize,
    iterations: usize,
    capped: usize,
    /// Voxels that moved and then left the band (asynchronous only).
    escaped: usize,
}

impl PassStats {
    fn combine(self, other: Self) -> Self {
        Self {
            max_update: self.max_update.max(other.max_update),
            active: self.active + other.active,
            stalled: self.stalled + other.stalled,
            iterations: self.iterations.max(other.iterations),
            capped: self.capped + other.capped,
            escaped: self.escaped + other.escaped,
        }
    }
}

enum Step {
    Skipped,
    Stalled,
    Moved { delta: Vec3, gradient_norm: f64 },
}

/// Every pass reads the field as it was after the previous pass and writes
/// into a zeroed scratch field, merged once all workers are done.
fn synchronous(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &mut DisplacementField,
    config: &RegistrationConfig,
) -> Result<RegistrationReport> {
    let mut report = RegistrationReport::default();
    let limit = step_limit(src);

    for iteration in 0..config.max_iterations {
        let mut scratch = DisplacementField::zeros(field.grid_size(), field.voxel_size());
        let current: &DisplacementField = field;

        let stats = scratch
            .as_mut_slice()
            .par_iter_mut()
            .enumerate()
            .map(|(i, slot)| -> Result<PassStats> {
                let index = current.spatial_index(i);
                Ok(match voxel_step(src, dest, current, &index, config, limit)? {
                    Step::Skipped => PassStats::default(),
                    Step::Stalled => PassStats {
                        active: 1,
                        stalled: 1,
                        ..PassStats::default()
                    },
                    Step::Moved { delta, .. } => {
                        *slot = delta;
                        PassStats {
                            max_update: delta.norm() as f64,
                            active: 1,
                            ..PassStats::default()
                        }
                    }
                })
            })
            .try_reduce(PassStats::default, |a, b| Ok(a.combine(b)))?;

        field.merge(&scratch)?;

        let previously_active = report.active_voxels;
        report.iterations = iteration + 1;
        report.max_update = stats.max_update;
        report.active_voxels = stats.active;
        report.stalled_voxels = stats.stalled;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let energy = total_energy(src, dest, field, config).total(config);
            debug!(
                iteration,
                max_update = stats.max_update,
                active = stats.active,
                stalled = stats.stalled,
                energy,
                "registration pass"
            );
        }

        if stats.active == 0 && previously_active > 0 {
            warn!(
                iteration,
                previously_active, "every active voxel left the band; not converged"
            );
            break;
        }
        if stats.max_update < config.convergence_threshold {
            report.converged = true;
            break;
        }
    }

    Ok(report)
}

/// Every voxel runs its own descent to convergence, in parallel, reading and
/// writing one shared field. Neighbouring voxels see each other's updates in
/// whatever order the scheduler produces, so results vary between runs
/// whenever a term couples neighbours.
fn asynchronous(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &mut DisplacementField,
    config: &RegistrationConfig,
) -> Result<RegistrationReport> {
    let shared = AtomicDisplacementField::from_field(field);
    let limit = step_limit(src);

    let stats = (0..src.len())
        .into_par_iter()
        .map(|i| converge_voxel(src, dest, &shared, &src.spatial_index(i), config, limit))
        .try_reduce(PassStats::default, |a, b| Ok(a.combine(b)))?;

    *field = shared.into_field();

    debug!(
        iterations = stats.iterations,
        max_update = stats.max_update,
        active = stats.active,
        capped = stats.capped,
        escaped = stats.escaped,
        "asynchronous registration finished"
    );

    Ok(RegistrationReport {
        iterations: stats.iterations,
        // Every active voxel stepping out of the band is not convergence.
        converged: stats.capped == 0 && !(stats.active > 0 && stats.escaped == stats.active),
        max_update: stats.max_update,
        active_voxels: stats.active,
        stalled_voxels: stats.stalled,
        energy: EnergyBreakdown::default(),
    })
}

fn converge_voxel(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    shared: &AtomicDisplacementField,
    index: &Index3,
    config: &RegistrationConfig,
    limit: f32,
) -> Result<PassStats> {
    let mut stats = PassStats::default();

    for iteration in 0..config.max_iterations {
        stats.iterations = iteration + 1;
        match voxel_step(src, dest, shared, index, config, limit)? {
            Step::Skipped => {
                stats.escaped = stats.active;
                return Ok(stats);
            }
            Step::Stalled => {
                stats.active = 1;
                stats.stalled = 1;
                return Ok(stats);
            }
            Step::Moved {
                delta,
                gradient_norm,
            } => {
                stats.active = 1;
                shared.update(index, &delta)?;
                stats.max_update = delta.norm() as f64;
                if stats.max_update <= config.convergence_threshold
                    || gradient_norm <= config.convergence_threshold
                {
                    return Ok(stats);
                }
            }
        }
    }

    stats.capped = 1;
    Ok(stats)
}

/// Gradient step for one voxel, not yet applied.
fn voxel_step<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    index: &Index3,
    config: &RegistrationConfig,
    limit: f32,
) -> Result<Step> {
    let distance = src.distance_through(index, field);
    if !is_active(distance, src, config.epsilon) {
        return Ok(Step::Skipped);
    }

    let gradient = energy_gradient(src, dest, field, index, config);
    let delta = if config.trust_region_active() {
        match trust_region_step(src, dest, field, index, &gradient, config.alpha) {
            Some(delta) => delta,
            None => {
                trace!(index = ?index, "trust region found no improving step");
                return Ok(Step::Stalled);
            }
        }
    } else {
        -gradient * config.alpha
    };

    // An oversized step shows up as overflow to infinity or a jump out of the band.
    let delta = delta.cast::<f32>();
    ensure_bounded(index, &delta, limit)?;
    ensure_finite(index, &(field.at(index) + delta))?;
    Ok(Step::Moved {
        delta,
        gradient_norm: gradient.norm(),
    })
}

fn step_limit(src: &VoxelGrid) -> f32 {
    MAX_STEP_BANDS * (src.truncation_distance() + src.unknown_clip_distance())
}

/// Shrinks the step until the data residual at the displaced location is
/// strictly smaller than before, or gives up below the minimum step.
fn trust_region_step<F: Displacements + ?Sized>(
    src: &VoxelGrid,
    dest: &VoxelGrid,
    field: &F,
    index: &Index3,
    gradient: &Gradient,
    alpha: f64,
) -> Option<Gradient> {
    let target = dest.distance_at_index(index) as f64;
    let location = src.displaced_location(index, field).cast::<f64>();
    let voxel_size = src.voxel_size() as f64;
    let residual = |delta: &Gradient| {
        let moved = (location + delta / voxel_size).cast::<f32>();
        (src.distance_at(&moved) as f64 - target).abs()
    };

    let before = residual(&Gradient::zeros());
    let mut step = alpha;
    loop {
        let delta = -gradient * step;
        if residual(&delta) < before {
            return Some(delta);
        }
        step /= TRUST_REGION_SHRINK;
        if step < TRUST_REGION_MIN_STEP {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnergyTerms, VolumeConfig};
    use crate::error::FusionError;
    use crate::mesh::sdf::sphere_sdf;
    use crate::mesh::types::{Aabb, Pt3};
    use crate::synthetic::plane_grid;
    use approx::assert_relative_eq;

    /// Sphere of radius 0.3 in a 13^3 grid of 0.1 m voxels. With the unknown
    /// clip equal to the truncation, reads past the border match the far field.
    fn sphere(center_x: f32) -> VoxelGrid {
        let volume = VolumeConfig {
            voxel_size: 0.1,
            unknown_clip_distance: 0.2,
            truncation_distance: 0.2,
        };
        let bounds = Aabb::new(Pt3::new(0.0, 0.0, 0.0), Pt3::new(1.3, 1.3, 1.3));
        let center = Pt3::new(center_x, 0.65, 0.65);
        VoxelGrid::from_fn(bounds, &volume, move |p| sphere_sdf(p, &center, 0.3))
    }

    /// Source shifted one voxel along +x from the destination.
    fn shifted_pair() -> (VoxelGrid, VoxelGrid) {
        (sphere(0.75), sphere(0.65))
    }

    /// On the x axis through both centres, where the shift is purely normal.
    fn on_axis() -> Index3 {
        Index3::new(9, 6, 6)
    }

    fn data_only(alpha: f64) -> RegistrationConfig {
        RegistrationConfig {
            alpha,
            max_iterations: 200,
            energies: EnergyTerms::data_only(),
            ..RegistrationConfig::default()
        }
    }

    #[test]
    fn no_terms_leaves_field_alone() {
        let (src, dest) = shifted_pair();
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let config = RegistrationConfig {
            energies: EnergyTerms {
                data: false,
                level_set: false,
                killing: false,
            },
            ..RegistrationConfig::default()
        };
        let report = compute_displacement_field(&src, &dest, &mut field, &config).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
        assert_eq!(field.max_norm(), 0.0);
    }

    #[test]
    fn shift_is_recovered_along_the_normal() {
        let (src, dest) = shifted_pair();
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let report = compute_displacement_field(&src, &dest, &mut field, &data_only(0.5)).unwrap();
        assert!(report.converged);
        assert!(report.active_voxels > 0);

        let d = field.at(&on_axis());
        assert_relative_eq!(d.x, 0.1, epsilon = 1e-3);
        assert_relative_eq!(d.y, 0.0, epsilon = 1e-5);
        assert!(report.energy.data < 1e-3);
    }

    #[test]
    fn trust_region_reaches_the_same_answer() {
        let (src, dest) = shifted_pair();
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let config = RegistrationConfig {
            use_trust_region: true,
            ..data_only(0.5)
        };
        let report = compute_displacement_field(&src, &dest, &mut field, &config).unwrap();
        assert!(report.converged);
        assert_relative_eq!(field.at(&on_axis()).x, 0.1, epsilon = 1e-3);
    }

    #[test]
    fn trust_region_backtracks_an_overshooting_step() {
        let (src, dest) = shifted_pair();
        let field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let gradient = energy_gradient(&src, &dest, &field, &on_axis(), &data_only(1.0));

        // The right step is 0.1 m. Alpha 4 lands at 0.4 m, then 0.267 m, both
        // worse than standing still; 0.178 m is the first improvement.
        let step = trust_region_step(&src, &dest, &field, &on_axis(), &gradient, 4.0).unwrap();
        assert_relative_eq!(step.x, 0.4 / 2.25, epsilon = 1e-5);
    }

    /// Source voxel (5, 5, 5) is a local minimum along x and the destination
    /// lies below it, so every step the descent direction allows makes the
    /// residual worse.
    fn local_minimum_pair() -> (VoxelGrid, VoxelGrid) {
        let volume = VolumeConfig {
            voxel_size: 0.1,
            unknown_clip_distance: 0.2,
            truncation_distance: 0.2,
        };
        let bounds = Aabb::new(Pt3::origin(), Pt3::new(1.0, 1.0, 1.0));
        let mut src = VoxelGrid::from_fn(bounds, &volume, |_| 0.1);
        src.set_voxel(&Index3::new(4, 5, 5), 0.15, 1);
        src.set_voxel(&Index3::new(5, 5, 5), -0.1, 1);
        src.set_voxel(&Index3::new(6, 5, 5), 0.0, 1);
        let dest = VoxelGrid::from_fn(bounds, &volume, |_| -0.15);
        (src, dest)
    }

    #[test]
    fn trust_region_gives_up_when_no_step_improves() {
        // The plane passes through the voxel, so the residual starts at zero,
        // and the smallest allowed multiplier still moves a full voxel.
        let volume = VolumeConfig {
            voxel_size: 0.1,
            unknown_clip_distance: 0.2,
            truncation_distance: 0.2,
        };
        let bounds = Aabb::new(Pt3::origin(), Pt3::new(1.3, 1.3, 1.3));
        let index = Index3::new(6, 6, 6);
        let origin = VoxelGrid::new(bounds, &volume).world_position(&index);
        let grid = plane_grid(bounds, &volume, origin, Vec3::x());
        let field = DisplacementField::zeros(grid.grid_size(), grid.voxel_size());

        let gradient = Gradient::new(-1e6, 0.0, 0.0);
        assert!(trust_region_step(&grid, &grid, &field, &index, &gradient, 1.0).is_none());
    }

    #[test]
    fn stalled_voxel_keeps_its_displacement() {
        let (src, dest) = local_minimum_pair();
        let index = Index3::new(5, 5, 5);
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let config = RegistrationConfig {
            use_trust_region: true,
            max_iterations: 10,
            ..data_only(0.5)
        };
        let limit = step_limit(&src);
        assert!(matches!(
            voxel_step(&src, &dest, &field, &index, &config, limit).unwrap(),
            Step::Stalled
        ));

        let report = compute_displacement_field(&src, &dest, &mut field, &config).unwrap();
        assert!(report.stalled_voxels >= 1);
        assert_eq!(field.at(&index), Vec3::zeros());
    }

    #[test]
    fn asynchronous_matches_synchronous_for_data_term() {
        let (src, dest) = shifted_pair();
        let mut sync_field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let mut async_field = sync_field.clone();

        compute_displacement_field(&src, &dest, &mut sync_field, &data_only(0.5)).unwrap();
        let config = RegistrationConfig {
            discipline: IterationDiscipline::Asynchronous,
            ..data_only(0.5)
        };
        let report = compute_displacement_field(&src, &dest, &mut async_field, &config).unwrap();
        assert!(report.converged);

        assert_relative_eq!(sync_field.at(&on_axis()), async_field.at(&on_axis()), epsilon = 1e-3);
    }

    #[test]
    fn oversized_step_diverges() {
        let (src, dest) = shifted_pair();
        let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
        let result = compute_displacement_field(&src, &dest, &mut field, &data_only(1e300));
        assert!(matches!(result, Err(FusionError::Diverged { .. })));
        assert_eq!(field.max_norm(), 0.0);
    }

    #[test]
    fn step_past_the_band_diverges() {
        // Finite steps of ten to a hundred metres; the limit is 1.6 m.
        let (src, dest) = shifted_pair();
        for (alpha, discipline) in [
            (1e2, IterationDiscipline::Synchronous),
            (1e3, IterationDiscipline::Synchronous),
            (1e3, IterationDiscipline::Asynchronous),
        ] {
            let mut field = DisplacementField::zeros(src.grid_size(), src.voxel_size());
            let config = RegistrationConfig {
                discipline,
                ..data_only(alpha)
            };
            let result = compute_displacement_field(&src, &dest, &mut field, &config);
            match result {
                Err(FusionError::Diverged { value, .. }) => {
                    assert!(value.iter().all(|c| c.is_finite()));
                }
                other => panic!("expected divergence, got {:?}", other),
            }
            assert_eq!(field.max_norm(), 0.0);
        }
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let (src, dest) = shifted_pair();
        let mut field = DisplacementField::zeros(Index3::new(2, 2, 2), 0.1);
        let result = compute_displacement_field(&src, &dest, &mut field, &data_only(0.5));
        assert!(matches!(result, Err(FusionError::ShapeMismatch { .. })));
    }
}
