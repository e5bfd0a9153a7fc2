use std::time::Duration;
use thiserror::Error;

/// Typed failures that callers branch on. Provider APIs return
/// `anyhow::Result`; these travel inside and are recovered with
/// [`OpsError::find`].
#[derive(Debug, Error)]
pub enum OpsError {
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("volume {0} not found")]
    VolumeNotFound(String),

    #[error("security group '{0}' not found")]
    SecurityGroupNotFound(String),

    #[error("{resource} '{name}' belongs to {actual}, expected {expected}")]
    Mismatch {
        resource: String,
        name: String,
        expected: String,
        actual: String,
    },

    #[error("{operation} timed out after {attempts} attempts ({elapsed:?})")]
    Timeout {
        operation: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{operation} reached failure state '{state}'")]
    Failed { operation: String, state: String },

    #[error("{0}")]
    Environment(String),

    #[error("invalid port specification '{0}'")]
    InvalidPort(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}

impl OpsError {
    pub fn unsupported(op: impl Into<String>) -> anyhow::Error {
        OpsError::Unsupported(op.into()).into()
    }

    /// First typed error in the chain, looking through any added context.
    pub fn find(err: &anyhow::Error) -> Option<&OpsError> {
        err.chain().find_map(|e| e.downcast_ref::<OpsError>())
    }

    pub fn is_not_found(err: &anyhow::Error) -> bool {
        matches!(
            Self::find(err),
            Some(
                OpsError::InstanceNotFound(_)
                    | OpsError::ImageNotFound(_)
                    | OpsError::VolumeNotFound(_)
                    | OpsError::SecurityGroupNotFound(_)
            )
        )
    }

    pub fn is_timeout(err: &anyhow::Error) -> bool {
        matches!(Self::find(err), Some(OpsError::Timeout { .. }))
    }
}
