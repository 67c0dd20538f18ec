use thiserror::Error;

/// Canonical error type shared by the storage, provider and export adapters.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Entity was not found in the provider or the object store.
    #[error("{entity} `{id}` was not found")]
    NotFound {
        /// Entity type name (e.g. `"object"`).
        entity: &'static str,
        /// Identifier of the missing entity.
        id: String,
    },

    /// Entity already exists and cannot be created again.
    #[error("{entity} `{id}` already exists")]
    AlreadyExists {
        /// Entity type name (e.g. `"snapshot"`).
        entity: &'static str,
        /// Identifier that conflicts.
        id: String,
    },

    /// Operation violates current state machine rules.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Human-readable explanation of the invalid state.
        message: String,
    },

    /// Unexpected internal error occurred.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable details for debugging purposes.
        message: String,
    },

    /// I/O error occurred during file, pipe or process operations.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Output of an external tool could not be decoded.
    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Object storage backend error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// Snapshot provider rejected or failed an operation.
    #[error("snapshot provider error: {0}")]
    ProviderError(String),

    /// The export process exited unsuccessfully.
    #[error("`{command}` failed ({status}): {stderr}")]
    ExportFailed {
        /// Full command line that was run.
        command: String,
        /// Exit cause as reported by the OS.
        status: String,
        /// Captured standard error of the process.
        stderr: String,
    },

    /// Compression codec reported an error.
    #[error("compression error: {0}")]
    CompressionError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates a `NotFound` variant.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `AlreadyExists` variant.
    #[must_use]
    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    /// Creates an `InvalidState` variant.
    #[must_use]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an `Internal` variant.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializationError(err.to_string())
    }
}

/// Convenient result alias for adapter operations.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_failure_message_carries_stderr() {
        let err = CoreError::ExportFailed {
            command: "/sbin/zfs send tank/containers/web@snapshot-x".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "dataset does not exist".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("/sbin/zfs send"));
        assert!(msg.contains("exit status: 1"));
        assert!(msg.contains("dataset does not exist"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::IoError(_)));
    }
}
