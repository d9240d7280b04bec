//! The narrow synchronous boundary to the remote engine.
//!
//! An engine binding exposes exactly three calls; everything else happens
//! through the [`ResponseHandler`] registered when the context is created.
//! Implementations must only marshal data: `on_response` may be invoked from
//! any engine-owned thread, concurrently, and must return promptly.

use std::sync::Arc;

use crate::ids::{ContextId, RequestId};

/// Callback contract the engine invokes for every response event.
pub trait ResponseHandler: Send + Sync {
    fn on_response(&self, request_id: u32, params_json: &str, response_type: u32, finished: bool);
}

/// The engine's call surface.
pub trait EngineBinding: Send + Sync {
    /// Create an engine instance. `handler` receives every event for the
    /// context until it is destroyed.
    fn create_context(
        &self,
        config_json: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<ContextId, BoundaryError>;

    fn destroy_context(&self, context: ContextId);

    /// Issue `method` asynchronously. Results arrive later through the
    /// context's handler, tagged with `request_id`.
    fn request(
        &self,
        context: ContextId,
        method: &str,
        params_json: &str,
        request_id: RequestId,
    ) -> Result<(), BoundaryError>;
}

/// Immediate failure of a boundary call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundaryError {
    #[error("context {0} not found")]
    ContextNotFound(ContextId),
    #[error("engine rejected context config: {0}")]
    InvalidConfig(String),
    #[error("boundary call failed: {0}")]
    Call(String),
}
