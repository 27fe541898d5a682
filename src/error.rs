use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Failures of the remote API. Every variant goes through the same rollback path; the distinction only matters for
/// what the user is told and, for [`ApiError::Auth`], which cache keys stop being trustworthy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields:  BTreeMap<String, Vec<String>>,
    },

    #[error("not authorized ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("malformed response from {endpoint}: {message}")]
    Parse { endpoint: &'static str, message: String },
}

/// Taxonomy class of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transport,
    Validation,
    Auth,
    Parse,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::Transport => "transport",
            FailureClass::Validation => "validation",
            FailureClass::Auth => "auth",
            FailureClass::Parse => "parse",
        })
    }
}

impl ApiError {
    pub fn class(&self) -> FailureClass {
        match self {
            ApiError::Transport(_) | ApiError::Timeout | ApiError::Server { .. } => FailureClass::Transport,
            ApiError::Validation { .. } => FailureClass::Validation,
            ApiError::Auth { .. } => FailureClass::Auth,
            ApiError::Parse { .. } => FailureClass::Parse,
        }
    }

    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    /// Text suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Validation { message, fields } => {
                let details = fields.values().flatten().cloned().collect::<Vec<_>>();
                if details.is_empty() {
                    message.clone()
                }
                else {
                    details.join("\n")
                }
            }
            ApiError::Auth { .. } => "Your session has expired. Please sign in again.".to_string(),
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        }
        else {
            ApiError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("failed to build {what}: {source}")]
    Builder {
        what:   &'static str,
        #[source]
        source: fieldx::error::FieldXError,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("mutation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl SyncError {
    pub fn builder(what: &'static str) -> impl FnOnce(fieldx::error::FieldXError) -> Self {
        move |source| SyncError::Builder { what, source }
    }
}
