use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FusionError, Result};

/// Geometry of every voxel grid built during a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Voxel edge length in metres.
    pub voxel_size: f32,
    /// How far behind an observed surface integration is trusted. Also the
    /// distance stored in unobserved voxels.
    pub unknown_clip_distance: f32,
    /// Positive truncation band in front of the surface ("max surface voxel distance").
    pub truncation_distance: f32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.01,
            unknown_clip_distance: 0.05,
            truncation_distance: 0.05,
        }
    }
}

/// Which energy terms contribute to the registration gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyTerms {
    pub data: bool,
    pub level_set: bool,
    pub killing: bool,
}

impl Default for EnergyTerms {
    fn default() -> Self {
        Self {
            data: true,
            level_set: true,
            killing: true,
        }
    }
}

impl EnergyTerms {
    pub fn data_only() -> Self {
        Self {
            data: true,
            level_set: false,
            killing: false,
        }
    }

    pub fn any(&self) -> bool {
        self.data || self.level_set || self.killing
    }
}

/// How a registration pass schedules its per-voxel updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationDiscipline {
    /// Full-grid passes against the previous pass's field; updates go to a
    /// scratch field merged after the pass. Deterministic.
    #[default]
    Synchronous,
    /// Each voxel converges on its own, writing straight into the shared
    /// field. Results depend on thread scheduling.
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Gradient descent step size.
    pub alpha: f64,
    /// Stop once the largest per-voxel update (metres) falls below this.
    pub convergence_threshold: f64,
    pub max_iterations: usize,
    pub energies: EnergyTerms,
    pub omega_level_set: f64,
    pub omega_killing: f64,
    /// Damping of the Killing term towards a pure Killing field.
    pub killing_gamma: f64,
    pub epsilon: f64,
    pub discipline: IterationDiscipline,
    /// Step-size backtracking; only valid with the data term alone.
    pub use_trust_region: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            convergence_threshold: 1e-4,
            max_iterations: 100,
            energies: EnergyTerms::default(),
            omega_level_set: 0.2,
            omega_killing: 0.5,
            killing_gamma: 0.1,
            epsilon: 1e-5,
            discipline: IterationDiscipline::Synchronous,
            use_trust_region: false,
        }
    }
}

impl RegistrationConfig {
    /// True when backtracking applies: trust region on and data as the sole term.
    pub fn trust_region_active(&self) -> bool {
        self.use_trust_region
            && self.energies.data
            && !self.energies.level_set
            && !self.energies.killing
    }
}

/// Top-level session configuration, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub volume: VolumeConfig,
    pub registration: RegistrationConfig,
    /// Start each frame from the previous frame's field instead of a zero field.
    pub reuse_previous_field: bool,
    pub start_frame: usize,
    /// Exclusive; `None` runs to the end of the frame source.
    pub end_frame: Option<usize>,
    pub stride: usize,
    /// When set, every registered field is written here as `NNN.bin`.
    pub field_output_dir: Option<PathBuf>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            volume: VolumeConfig::default(),
            registration: RegistrationConfig::default(),
            reuse_previous_field: false,
            start_frame: 0,
            end_frame: None,
            stride: 1,
            field_output_dir: None,
        }
    }
}

impl FusionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: FusionConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let volume = &self.volume;
        if !(volume.voxel_size > 0.0) {
            return Err(invalid("voxel_size must be positive"));
        }
        if !(volume.unknown_clip_distance > 0.0) || !(volume.truncation_distance > 0.0) {
            return Err(invalid(
                "unknown_clip_distance and truncation_distance must be positive",
            ));
        }

        let reg = &self.registration;
        if !(reg.alpha > 0.0) {
            return Err(invalid("alpha must be positive"));
        }
        if !(reg.convergence_threshold >= 0.0) {
            return Err(invalid("convergence_threshold must not be negative"));
        }
        if reg.use_trust_region && (!reg.energies.data || reg.energies.level_set || reg.energies.killing)
        {
            return Err(invalid(
                "trust region requires the data term to be the only enabled energy",
            ));
        }
        if self.stride == 0 {
            return Err(invalid("stride must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> FusionError {
    FusionError::InvalidConfig(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        FusionConfig::default().validate().unwrap();
    }

    #[test]
    fn trust_region_needs_data_only() {
        let mut config = FusionConfig::default();
        config.registration.use_trust_region = true;
        assert!(matches!(
            config.validate(),
            Err(FusionError::InvalidConfig(_))
        ));

        config.registration.energies = EnergyTerms::data_only();
        config.validate().unwrap();
        assert!(config.registration.trust_region_active());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: FusionConfig =
            serde_json::from_str(r#"{ "registration": { "discipline": "asynchronous" } }"#)
                .unwrap();
        assert_eq!(
            config.registration.discipline,
            IterationDiscipline::Asynchronous
        );
        assert_eq!(config.volume, VolumeConfig::default());
        assert_eq!(config.registration.max_iterations, 100);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.json");
        let mut config = FusionConfig::default();
        config.volume.voxel_size = 0.02;
        config.reuse_previous_field = true;
        config.save(&path).unwrap();
        assert_eq!(FusionConfig::load(&path).unwrap(), config);
    }
}
