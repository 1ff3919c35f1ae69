pub(crate) mod atomic_field;
pub mod energy;
pub mod optimizer;

pub use energy::EnergyBreakdown;
pub use optimizer::{compute_displacement_field, total_energy, RegistrationReport, MAX_STEP_BANDS};
