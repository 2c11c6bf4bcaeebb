//! Error taxonomy for the registry surface.

use std::io;

/// Errors returned by registry operations.
///
/// Transport failures on a single connection are handled internally by
/// disconnecting that connection; [`NetError::Io`] only surfaces from
/// operations the caller invoked directly, such as a direct send or an
/// initial connect.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A parameter failed validation, e.g. replacing a hash with itself.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation referenced a hash absent from the relevant map.
    #[error("no entry for hash {0}")]
    HashNotFound(String),

    /// The operation requires a feature that is not enabled.
    #[error("feature not enabled: {0}")]
    FeatureNotUsed(&'static str),

    /// A bounded wait for a state transition elapsed. The operation's
    /// effect is unknown; the caller should treat the target as closed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A transport-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
