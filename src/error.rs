use thiserror::Error;

/// Errors raised by the fusion core.
#[derive(Debug, Error)]
pub enum FusionError {
    /// A displacement component became non-finite during registration.
    /// Never retried: the instability comes from parameters or data.
    #[error("displacement field diverged at voxel {index:?}: {value:?}")]
    Diverged { index: [usize; 3], value: [f32; 3] },

    /// Two grids or fields that must share a shape do not.
    #[error("grid shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: [usize; 3],
        found: [usize; 3],
    },

    #[error("camera pose is not invertible")]
    SingularPose,

    #[error("depth image has {found} samples, expected {expected}")]
    DepthImageSize { expected: usize, found: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("frame {0} is not available from the frame source")]
    MissingFrame(usize),

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FusionError>;
