//! Context lifecycle.
//!
//! A [`Context`] owns one engine context together with its Correlator,
//! Dispatcher and App Object registry. Destroying it fails every
//! outstanding request with `LifecycleError::ContextDestroyed` before the
//! engine context itself goes away.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use conduit_types::{
    AppRequestId, AppRequestResult, ClientError, ContextId, EngineBinding, Handle,
    LifecycleError, ResponseHandler,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::adapter::{EventStream, RequestHandle};
use crate::app::{
    AppObject, AppObjects, DEBOT_INIT, DEBOT_REMOVE, DebotBrowser, EncryptionBoxHandler,
    HandlerFailure, REGISTER_ENCRYPTION_BOX, REGISTER_SIGNING_BOX, REMOVE_ENCRYPTION_BOX,
    REMOVE_SIGNING_BOX, SigningBoxHandler,
};
use crate::config::ClientConfig;
use crate::correlator::{AppEventRouter, Correlator};
use crate::dispatcher::Dispatcher;
use crate::worker::{TokioWorkerPool, WorkerPool};

/// A live engine context. Cheap to clone; clones share the context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    binding: Arc<dyn EngineBinding>,
    dispatcher: Arc<Dispatcher>,
    app: Arc<AppObjects>,
    failures: Mutex<Option<mpsc::UnboundedReceiver<HandlerFailure>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Create a context whose App Object handlers run on the current tokio
    /// runtime.
    pub fn create(binding: Arc<dyn EngineBinding>, config: &ClientConfig) -> Result<Self, ClientError> {
        let pool = TokioWorkerPool::current(config.workers.max_concurrent_handlers)?;
        Self::create_with_pool(binding, config, Arc::new(pool))
    }

    pub fn create_with_pool(
        binding: Arc<dyn EngineBinding>,
        config: &ClientConfig,
        pool: Arc<dyn WorkerPool>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        // The callback must exist before the engine context does.
        let correlator = Arc::new(Correlator::new());
        let id = binding.create_context(
            &config.engine_json(),
            Arc::clone(&correlator) as Arc<dyn ResponseHandler>,
        )?;

        let dispatcher = Arc::new(Dispatcher::new(
            id,
            Arc::clone(&binding),
            Arc::clone(&correlator),
            config.streams.unsubscribe_on_drop,
        ));
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let app = AppObjects::new(Arc::clone(&dispatcher), pool, failures_tx);
        correlator.install_router(Arc::clone(&app) as Arc<dyn AppEventRouter>);

        tracing::debug!(context = %id, "context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                id,
                binding,
                dispatcher,
                app,
                failures: Mutex::new(Some(failures_rx)),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        self.inner.dispatcher.correlator()
    }

    #[must_use]
    pub fn app_objects(&self) -> &Arc<AppObjects> {
        &self.inner.app
    }

    fn live(&self) -> Result<&Arc<Dispatcher>, ClientError> {
        if self.is_destroyed() {
            return Err(LifecycleError::ContextDestroyed(self.inner.id).into());
        }
        Ok(&self.inner.dispatcher)
    }

    /// Call `method` and block until its result arrives.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn call_sync(&self, method: &str, params: &Value) -> Result<Value, ClientError> {
        self.live()?.call_sync(method, params)
    }

    pub fn call_async(&self, method: &str, params: &Value) -> Result<RequestHandle, ClientError> {
        self.live()?.call_async(method, params)
    }

    pub async fn call(&self, method: &str, params: &Value) -> Result<Value, ClientError> {
        self.live()?.call(method, params).await
    }

    /// Start a subscription. Dropping the returned stream before it finishes
    /// calls `unsubscribe_method` with the handle the engine returned.
    pub fn subscribe(
        &self,
        method: &str,
        params: &Value,
        unsubscribe_method: &str,
    ) -> Result<EventStream, ClientError> {
        Ok(self
            .call_async(method, params)?
            .into_stream_with_unsubscribe(unsubscribe_method))
    }

    pub fn resolve(
        &self,
        app_request_id: AppRequestId,
        result: AppRequestResult,
    ) -> Result<RequestHandle, ClientError> {
        self.live()?.resolve(app_request_id, result)
    }

    pub async fn register_signing_box(
        &self,
        handler: Arc<dyn SigningBoxHandler>,
    ) -> Result<Handle, ClientError> {
        self.live()?;
        self.inner
            .app
            .register(
                AppObject::SigningBox(handler),
                REGISTER_SIGNING_BOX,
                &serde_json::json!({}),
                "handle",
            )
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn remove_signing_box(&self, handle: Handle) -> Result<(), ClientError> {
        self.live()?;
        self.inner
            .app
            .remove(handle, REMOVE_SIGNING_BOX, "handle")
            .await
    }

    pub async fn register_encryption_box(
        &self,
        handler: Arc<dyn EncryptionBoxHandler>,
    ) -> Result<Handle, ClientError> {
        self.live()?;
        self.inner
            .app
            .register(
                AppObject::EncryptionBox(handler),
                REGISTER_ENCRYPTION_BOX,
                &serde_json::json!({}),
                "handle",
            )
            .await
            .map(|(handle, _)| handle)
    }

    pub async fn remove_encryption_box(&self, handle: Handle) -> Result<(), ClientError> {
        self.live()?;
        self.inner
            .app
            .remove(handle, REMOVE_ENCRYPTION_BOX, "handle")
            .await
    }

    /// Start the debot at `address` with `browser` as its host. Returns the
    /// debot handle and the full `debot.init` result.
    pub async fn debot_init(
        &self,
        address: &str,
        browser: Arc<dyn DebotBrowser>,
    ) -> Result<(Handle, Value), ClientError> {
        self.live()?;
        self.inner
            .app
            .register(
                AppObject::DebotBrowser(browser),
                DEBOT_INIT,
                &serde_json::json!({ "address": address }),
                "debot_handle",
            )
            .await
    }

    pub async fn debot_remove(&self, handle: Handle) -> Result<(), ClientError> {
        self.live()?;
        self.inner
            .app
            .remove(handle, DEBOT_REMOVE, "debot_handle")
            .await
    }

    /// Object that answers AppRequests matching no registration.
    pub fn set_default_app_object(&self, object: Option<AppObject>) {
        self.inner.app.set_default(object);
    }

    /// Failures of notification handlers, which have nobody to resolve.
    /// Available once; later calls return `None`.
    pub fn take_handler_failures(&self) -> Option<mpsc::UnboundedReceiver<HandlerFailure>> {
        self.inner
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Destroy the context. Outstanding requests fail with
    /// `LifecycleError::ContextDestroyed`; so does every later call,
    /// including a second `destroy`.
    pub fn destroy(&self) -> Result<(), ClientError> {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::ContextDestroyed(inner.id).into());
        }

        let failed = inner.dispatcher.correlator().close();
        let registrations = inner.app.clear();
        let unresolved = inner.dispatcher.clear_app_requests();
        inner.binding.destroy_context(inner.id);

        tracing::debug!(
            context = %inner.id,
            failed,
            registrations,
            unresolved,
            "context destroyed"
        );
        Ok(())
    }
}

/// Destroys its context when dropped.
#[derive(Debug)]
pub struct ContextGuard {
    context: Context,
}

impl ContextGuard {
    #[must_use]
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

impl Deref for ContextGuard {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if self.context.is_destroyed() {
            return;
        }
        if let Err(err) = self.context.destroy() {
            tracing::warn!(context = %self.context.id(), error = %err, "failed to destroy context");
        }
    }
}
