//! Core domain types for Conduit.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Identifiers, response events, the error taxonomy, the App Object tagged unions,
//! and the engine boundary traits all live here so that both the client core and
//! engine bindings can depend on them without pulling in a runtime.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

pub mod app;
mod binding;
mod error;
mod event;
mod ids;

pub use app::{
    AppRequest, AppRequestResult, DebotBrowserNotify, DebotBrowserRequest, DebotBrowserResponse,
    EncryptionBoxRequest, EncryptionBoxResponse, SigningBoxRequest, SigningBoxResponse,
};
pub use binding::{BoundaryError, EngineBinding, ResponseHandler};
pub use error::{ClientError, ConfigError, HandlerError, LifecycleError};
pub use event::{EngineError, Payload, ResponseEvent, ResponseKind};
pub use ids::{AppRequestId, ContextId, Handle, RequestId};
