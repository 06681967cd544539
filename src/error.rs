//! Error types for the convergence engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error returned by a remote management API.
///
/// The message is kept verbatim so it can be surfaced to the operator
/// unchanged. The optional code is the machine-readable error code
/// (for example `InvalidArgumentException`) when the API provides one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable error code, if any.
    pub code: Option<String>,
    /// Human-readable message as returned by the API.
    pub message: String,
}

impl RemoteError {
    /// Create an error with a message and no code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Create an error with both a code and a message.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Whether the error carries exactly the given code.
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    /// Whether the message contains the given substring.
    pub fn message_contains(&self, needle: &str) -> bool {
        self.message.contains(needle)
    }

    /// Whether the code follows the usual naming for "no such resource".
    pub fn is_not_found(&self) -> bool {
        self.code.as_deref().is_some_and(|code| {
            code.ends_with("NotFoundException")
                || code.ends_with("NotFound")
                || code.starts_with("NoSuch")
        })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// The lifecycle step an error occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Creating a resource.
    Create,
    /// Reading a resource.
    Read,
    /// Updating a resource's fields.
    Update,
    /// Deleting a resource.
    Delete,
    /// Adding labels to a resource.
    Tag,
    /// Removing labels from a resource.
    Untag,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Self::Create => "creating",
            Self::Read => "reading",
            Self::Update => "updating",
            Self::Delete => "deleting",
            Self::Tag => "tagging",
            Self::Untag => "untagging",
        };
        f.write_str(verb)
    }
}

/// Errors produced by the lifecycle orchestrator.
///
/// None of these are retried by the engine itself. [`ConvergeError::TimedOut`]
/// is the only variant where re-running the whole operation later may help.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// The resource never reached its target state within the budget.
    #[error(
        "timeout while {operation} {resource}: expected state {target} \
         (last state: {last}, last error: {err}, elapsed: {elapsed:?})",
        target = join_states(.target),
        last = .last_status.as_deref().unwrap_or("none"),
        err = .last_error.as_deref().unwrap_or("none"),
    )]
    TimedOut {
        /// The resource being converged.
        resource: String,
        /// The operation in progress.
        operation: Operation,
        /// The states that would have been accepted.
        target: Vec<String>,
        /// The most recently observed status, if any was observed.
        last_status: Option<String>,
        /// The most recent transient error, if any.
        last_error: Option<String>,
        /// How long the engine waited.
        elapsed: Duration,
    },

    /// The remote API rejected a request in a way retrying cannot fix.
    #[error("error {operation} {resource}: {source}")]
    Fatal {
        /// The resource being converged.
        resource: String,
        /// The mutation or probe being attempted.
        operation: Operation,
        /// The remote error, verbatim.
        #[source]
        source: RemoteError,
    },

    /// The resource reported a status outside both the pending and target sets.
    #[error("unexpected state '{status}' for {resource}, wanted target {target}", target = join_states(.target))]
    UnexpectedState {
        /// The resource being converged.
        resource: String,
        /// The observed status.
        status: String,
        /// The states that would have been accepted.
        target: Vec<String>,
    },

    /// The resource disappeared while its presence was required.
    #[error("{0} not found")]
    NotFound(String),

    /// No profile is registered for the resource type.
    #[error("Unknown resource type: {0}")]
    UnknownResource(String),

    /// The caller cancelled the operation.
    #[error("{operation} {resource} cancelled")]
    Cancelled {
        /// The resource being converged.
        resource: String,
        /// The operation in progress.
        operation: Operation,
    },

    /// The engine was configured inconsistently.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A state document could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConvergeError {
    /// Whether this is a timeout. Timeouts are the only failures where
    /// re-running the whole operation later is expected to help.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// The remote error behind a fatal failure, if that is what this is.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Fatal { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn join_states(states: &[String]) -> String {
    if states.is_empty() {
        "[gone]".to_string()
    } else {
        format!("[{}]", states.join(", "))
    }
}

impl From<ConvergeError> for tonic::Status {
    fn from(err: ConvergeError) -> Self {
        let message = err.to_string();
        match err {
            ConvergeError::TimedOut { .. } => tonic::Status::deadline_exceeded(message),
            ConvergeError::Fatal { source, .. } => {
                let code = source.code.as_deref().unwrap_or_default();
                if source.is_not_found() {
                    tonic::Status::not_found(message)
                } else if code.starts_with("AccessDenied") || code == "UnauthorizedOperation" {
                    tonic::Status::permission_denied(message)
                } else if code.starts_with("Throttling") || code.contains("LimitExceeded") {
                    tonic::Status::resource_exhausted(message)
                } else {
                    tonic::Status::internal(message)
                }
            },
            ConvergeError::UnexpectedState { .. } => tonic::Status::failed_precondition(message),
            ConvergeError::NotFound(_) => tonic::Status::not_found(message),
            ConvergeError::UnknownResource(_) => tonic::Status::not_found(message),
            ConvergeError::Cancelled { .. } => tonic::Status::cancelled(message),
            ConvergeError::Configuration(_) => tonic::Status::failed_precondition(message),
            ConvergeError::Serialization(_) => tonic::Status::invalid_argument(message),
        }
    }
}
