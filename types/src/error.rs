//! Error taxonomy surfaced to callers.

use std::path::PathBuf;
use std::time::Duration;

use crate::binding::BoundaryError;
use crate::event::EngineError;
use crate::ids::{AppRequestId, ContextId, RequestId};

/// Everything a client operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The engine reported failure.
    #[error("{0}")]
    Engine(EngineError),
    /// We could not make sense of what the engine sent.
    #[error("protocol error: {message}")]
    Protocol { message: String, raw: String },
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Boundary(BoundaryError),
    /// Only raised when the caller asked for a timeout.
    #[error("request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    pub fn protocol(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// The engine error, if this is one.
    #[must_use]
    pub fn engine(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(err) => Some(err),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Lifecycle(_))
    }
}

impl From<BoundaryError> for ClientError {
    fn from(err: BoundaryError) -> Self {
        match err {
            BoundaryError::ContextNotFound(id) => {
                Self::Lifecycle(LifecycleError::ContextNotFound(id))
            }
            other => Self::Boundary(other),
        }
    }
}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

/// Operation attempted against something that no longer (or never) existed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("context {0} has been destroyed")]
    ContextDestroyed(ContextId),
    #[error("context {0} not found")]
    ContextNotFound(ContextId),
    #[error("app request {0} is unknown or already resolved")]
    UnknownAppRequest(AppRequestId),
    #[error("request id {0} is already outstanding")]
    RequestIdInUse(RequestId),
    #[error("no async runtime available for the worker pool")]
    NoRuntime,
}

/// Failure raised by a locally supplied App Object handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ClientError> for HandlerError {
    fn from(err: ClientError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
