//! Request/response multiplexing over a callback-driven engine.
//!
//! Callers issue named calls against a [`Context`]; the engine answers
//! through a single callback from threads it owns. The Correlator routes
//! each event to the queue of the request that caused it, the Result
//! Adapter turns that queue into a blocking value, a future or a stream,
//! and App Objects answer the calls the engine makes back into local code.

mod adapter;
pub mod app;
mod config;
mod context;
mod correlator;
mod dispatcher;
mod worker;

#[cfg(test)]
mod test_support;

pub use adapter::{BlockingEvents, EventStream, RequestHandle};
pub use app::{
    AppFut, AppObject, AppObjects, DebotBrowser, EncryptionBoxHandler, HandlerFailure,
    RegistrationScope, SigningBoxHandler,
};
pub use config::{ClientConfig, StreamConfig, WorkerConfig};
pub use context::{Context, ContextGuard};
pub use correlator::Correlator;
pub use dispatcher::{Dispatcher, RESOLVE_APP_REQUEST};
pub use worker::{Job, TokioWorkerPool, WorkerPool};

pub use conduit_types::{
    AppRequestId, AppRequestResult, BoundaryError, ClientError, ConfigError, ContextId,
    EngineBinding, EngineError, Handle, HandlerError, LifecycleError, Payload, RequestId,
    ResponseEvent, ResponseHandler, ResponseKind,
};
