//! Error types for the registry cache extension
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the upstream, secret, path or extension it concerns
//! so a failed reconcile can be acted on without reading code.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for registry cache operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid or missing configuration
    #[error("validation error for {extension}: {message}")]
    Validation {
        /// Extension (or shoot) whose configuration is invalid
        extension: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "providerConfig.caches[0].upstream")
        field: Option<String>,
    },

    /// Upstream credential secret is missing, unresolvable or malformed
    #[error("credential error for secret {secret}: {message}")]
    Credential {
        /// Namespace/name of the secret or the reference name that failed
        secret: String,
        /// Description of what failed
        message: String,
    },

    /// Observed state has not converged with the desired state yet
    #[error("consistency error [{context}]: {message}")]
    Consistency {
        /// Where the mismatch was observed (e.g., "status", "extension")
        context: String,
        /// Description of the mismatch
        message: String,
    },

    /// A teardown did not complete within its bounded wait
    #[error("timed out after {timeout:?} waiting for {resource} to be deleted")]
    TeardownTimeout {
        /// Resource being torn down
        resource: String,
        /// The wait bound that elapsed
        timeout: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error without extension context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific extension
    pub fn validation_for(extension: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            extension: extension.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific extension and field path
    pub fn validation_for_field(
        extension: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            extension: extension.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a credential error for a secret
    pub fn credential(secret: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            secret: secret.into(),
            message: msg.into(),
        }
    }

    /// Create a consistency error with context
    pub fn consistency(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Consistency {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create a teardown timeout error
    pub fn teardown_timeout(resource: impl Into<String>, timeout: Duration) -> Self {
        Self::TeardownTimeout {
            resource: resource.into(),
            timeout,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, credential and serialization errors need a configuration
    /// change. Consistency errors and teardown timeouts resolve on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Validation { .. } => false,
            Error::Credential { .. } => false,
            Error::Consistency { .. } => true,
            Error::TeardownTimeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this is a bounded teardown wait that elapsed
    pub fn is_teardown_timeout(&self) -> bool {
        matches!(self, Error::TeardownTimeout { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Consistency { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
