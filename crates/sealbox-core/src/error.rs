use std::path::PathBuf;

use transport_http::RemoteError;

/// Errors surfaced by transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The OS refused to hand out random bytes. Nothing secret was created.
    #[error("system entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The remote store could not be reached or rejected the request, even
    /// after the configured retries.
    #[error("transfer failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("no record found for {0}")]
    NotFound(String),

    /// The server answered a resumed request with data that does not line up
    /// with what was already received.
    #[error("resume position rejected by server: expected {want}, got {got}")]
    RangeMismatch { want: u64, got: u64 },

    /// Decryption failed. A wrong passphrase and tampered ciphertext are
    /// indistinguishable here.
    #[error("authentication failed: wrong passphrase or corrupted data")]
    AuthenticationFailed,

    /// The upload acknowledgement named a different record than we submitted.
    #[error("server acknowledged {got} instead of submitted id {want}")]
    AckMismatch { want: String, got: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A background task died before reporting a result.
    #[error("background task failed: {0}")]
    Task(String),
}

impl TransferError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        TransferError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Io {
            path: path.into(),
            source,
        }
    }
}
