//! Error types for the distributed compute operator
//!
//! Errors are structured so that reconcile failures stay inspectable after they
//! have been collected across components. Several component failures in one pass
//! are kept together in an [`AggregateError`] rather than flattened to a string.

use std::fmt;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// The diff between a live and a desired object could not be computed
    #[error("patch error for {kind} {name}: {message}")]
    Patch {
        /// Kind of the object being diffed
        kind: String,
        /// Name of the object being diffed
        name: String,
        /// Description of what failed
        message: String,
    },

    /// A controller was assembled incorrectly; fatal at startup
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's wrong
        message: String,
    },

    /// A custom resource carries a spec the operator cannot act on
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// The offending resource (`namespace/name`)
        resource: String,
        /// Description of what's invalid
        message: String,
    },

    /// An error with a static descriptive prefix
    #[error("{context}: {source}")]
    Context {
        /// What was being attempted (e.g. "cannot create service")
        context: String,
        /// The underlying cause
        source: Box<Error>,
    },

    /// Several independent failures from a single reconcile pass
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "reconciler", "leader-election")
        context: String,
    },
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error for a specific resource kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a patch calculation error
    pub fn patch(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Patch {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a build-time configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a validation error for a resource
    pub fn validation(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
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

    /// Prefix this error with a description of what was being attempted
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Fold a list of collected errors into a single reportable error.
    ///
    /// No errors yields `None`; a single error passes through untouched.
    pub fn combine(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Aggregate(AggregateError { errors })),
        }
    }

    /// The innermost error once every context prefix is peeled off
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_status(&self) -> Option<u16> {
        match self.root() {
            Self::Kube {
                source: kube::Error::Api(response),
            } => Some(response.code),
            _ => None,
        }
    }

    /// True when the API server answered 404 Not Found
    pub fn is_not_found(&self) -> bool {
        self.api_status() == Some(404)
    }

    /// True when the API server rejected a write on a stale resourceVersion
    pub fn is_conflict(&self) -> bool {
        self.api_status() == Some(409)
    }

    /// Whether retrying the same operation later can succeed.
    ///
    /// An aggregate is retryable when any of its members is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => match source {
                kube::Error::Api(response) => {
                    response.code == 409 || response.code == 429 || response.code >= 500
                }
                _ => true,
            },
            Self::Context { source, .. } => source.is_retryable(),
            Self::Aggregate(aggregate) => aggregate.errors.iter().any(Error::is_retryable),
            Self::Internal { .. } => true,
            Self::Serialization { .. }
            | Self::Patch { .. }
            | Self::Configuration { .. }
            | Self::Validation { .. } => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Structured container for several errors raised in the same reconcile pass.
///
/// Renders every message on one line so a single log entry shows all failures.
#[derive(Debug)]
pub struct AggregateError {
    errors: Vec<Error>,
}

impl AggregateError {
    /// Every underlying error, in the order it was raised
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Consume the container, yielding the underlying errors
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
