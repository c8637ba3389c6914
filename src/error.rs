//! Typed errors of the transport layer.
//!
//! Every pool primitive returns `ZfsResult<T>`. The adapter classifies the
//! tool's "does not exist" diagnostic as `NotFound`; everything else that
//! exits non-zero is `Fatal`. Callers that expect an absence (diff baseline
//! missing on a dataset, snapshot missing on the destination) branch on
//! `NotFound`; every other caller propagates with `?`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZfsError {
    /// The named object (dataset, snapshot, pool) is absent.
    #[error("{object} does not exist")]
    NotFound { object: String },

    /// The tool exited non-zero for any other reason.
    #[error("error in \"{command}\": {stderr}")]
    Fatal { command: String, stderr: String },
}

impl ZfsError {
    pub fn not_found(object: impl Into<String>) -> Self {
        ZfsError::NotFound {
            object: object.into(),
        }
    }

    pub fn fatal(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        ZfsError::Fatal {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ZfsError::NotFound { .. })
    }
}

pub type ZfsResult<T> = std::result::Result<T, ZfsError>;
