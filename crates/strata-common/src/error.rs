//! Common error types for the Strata layer store.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type StrataResult<T> = Result<T, StrataError>;

/// Errors raised by the layer store and its collaborators.
#[derive(Error, Diagnostic, Debug)]
pub enum StrataError {
    /// A layer is not present in the graph.
    #[error("Layer not found: {id}")]
    #[diagnostic(code(strata::layer::not_found))]
    NotFound {
        /// Graph id of the missing layer.
        id: String,
    },

    /// A namespaced layer already exists for the same parent and cache key.
    #[error("{id} already exists")]
    #[diagnostic(code(strata::layer::already_exists))]
    AlreadyExists {
        /// Graph id of the existing layer.
        id: String,
    },

    /// The image is larger than the disk quota allotted to it.
    #[error("quota exceeded: image needs {required} bytes, quota is {quota} bytes")]
    #[diagnostic(
        code(strata::quota::exceeded),
        help("Raise the disk limit or use the exclusive quota scope")
    )]
    QuotaExceeded {
        /// Cumulative image size.
        required: i64,
        /// Quota that was requested.
        quota: i64,
    },

    /// A downloaded blob did not match its declared digest.
    #[error("digest verification failed: expected {expected}, got {actual}")]
    #[diagnostic(code(strata::fetch::digest_mismatch))]
    DigestMismatch {
        /// Declared digest.
        expected: String,
        /// Digest computed from the received bytes.
        actual: String,
    },

    /// A mount or unmount operation failed.
    #[error("mount error at {path}: {message}")]
    #[diagnostic(code(strata::mount))]
    Mount {
        /// Path being mounted or unmounted.
        path: String,
        /// Failure description.
        message: String,
    },

    /// The registry or the network failed.
    #[error("could not fetch image {repository} from registry {registry}: {message}")]
    #[diagnostic(code(strata::fetch::upstream))]
    Upstream {
        /// Registry host.
        registry: String,
        /// Repository path.
        repository: String,
        /// Failure description.
        message: String,
    },

    /// A garbage collection pass stopped at the first removal failure.
    #[error("garbage collection aborted removing {id}: {source}")]
    #[diagnostic(code(strata::gc::aborted))]
    GcAborted {
        /// Graph id that could not be removed.
        id: String,
        /// The removal error.
        #[source]
        source: Box<StrataError>,
    },

    /// A quota that can never be satisfied.
    #[error("invalid quota: {quota}")]
    #[diagnostic(
        code(strata::quota::invalid),
        help("Quotas must be greater than zero bytes")
    )]
    InvalidQuota {
        /// The rejected quota.
        quota: i64,
    },

    /// The graph driver cannot enforce quotas.
    #[error("quotas are not supported for the {driver} driver")]
    #[diagnostic(
        code(strata::quota::unsupported),
        help("Use the overlay driver to enable disk quotas")
    )]
    QuotasUnsupported {
        /// Name of the graph driver.
        driver: String,
    },

    /// A rootfs reference could not be interpreted.
    #[error("invalid rootfs reference {reference}: {reason}")]
    #[diagnostic(code(strata::reference::invalid))]
    InvalidReference {
        /// The reference as given.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// An external command exited unsuccessfully.
    #[error("{program} failed: {message}")]
    #[diagnostic(code(strata::command))]
    Command {
        /// Program that was run.
        program: String,
        /// Exit status and captured output.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(strata::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(strata::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(strata::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(strata::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl StrataError {
    /// Shorthand for [`StrataError::NotFound`].
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Shorthand for [`StrataError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true for errors that mean a layer is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StrataError::not_found("abc123");
        assert_eq!(err.to_string(), "Layer not found: abc123");
        assert!(err.is_not_found());
    }

    #[test]
    fn digest_mismatch_mentions_verification() {
        let err = StrataError::DigestMismatch {
            expected: "sha256:aa".to_string(),
            actual: "sha256:bb".to_string(),
        };
        assert!(err.to_string().contains("digest verification failed"));
    }

    #[test]
    fn gc_aborted_keeps_source() {
        let err = StrataError::GcAborted {
            id: "abc".to_string(),
            source: Box::new(StrataError::internal("disk on fire")),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("Internal error: disk on fire"));
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
    }
}
