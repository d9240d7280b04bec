//! Scripted in-process engine for tests.
//!
//! Records every boundary call and replays scripted events for a method on a
//! thread of its own, the way a real engine delivers from threads it owns.
//! Only depends on `conduit_types` so the integration suite can include it
//! by path.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use conduit_types::{
    BoundaryError, ContextId, EngineBinding, RequestId, ResponseHandler, ResponseKind,
};
use serde_json::Value;

/// One event the engine will deliver.
#[derive(Debug, Clone)]
pub struct Emit {
    pub kind: u32,
    pub payload: String,
    pub finished: bool,
}

impl Emit {
    pub fn raw(kind: u32, payload: &str, finished: bool) -> Self {
        Self {
            kind,
            payload: payload.to_string(),
            finished,
        }
    }

    pub fn success(payload: Value) -> Self {
        Self::raw(ResponseKind::SUCCESS, &payload.to_string(), false)
    }

    pub fn error(code: i64, message: &str) -> Self {
        let payload = serde_json::json!({ "code": code, "message": message });
        Self::raw(ResponseKind::ERROR, &payload.to_string(), false)
    }

    pub fn custom(code: u32, payload: Value) -> Self {
        Self::raw(code, &payload.to_string(), false)
    }

    pub fn nop() -> Self {
        Self::raw(ResponseKind::NOP, "", false)
    }

    pub fn app_request(app_request_id: u32, request_data: Value) -> Self {
        let payload = serde_json::json!({
            "app_request_id": app_request_id,
            "request_data": request_data,
        });
        Self::raw(ResponseKind::APP_REQUEST, &payload.to_string(), false)
    }

    pub fn app_notify(data: Value) -> Self {
        Self::raw(ResponseKind::APP_NOTIFY, &data.to_string(), false)
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub context: ContextId,
    pub method: String,
    pub params: Value,
    pub request_id: RequestId,
}

const RESOLVE_APP_REQUEST: &str = "client.resolve_app_request";

type Script = Arc<dyn Fn(&Value) -> Vec<Emit> + Send + Sync>;

#[derive(Default)]
struct State {
    next_context: u32,
    handlers: HashMap<ContextId, Arc<dyn ResponseHandler>>,
    scripts: HashMap<String, Script>,
    rejections: HashMap<String, BoundaryError>,
    calls: Vec<RecordedCall>,
    destroyed: Vec<ContextId>,
}

pub struct ScriptedEngine {
    state: Mutex<State>,
    call_made: Condvar,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            call_made: Condvar::new(),
        })
    }

    /// Reply to every call of `method` with the events `script` returns.
    pub fn on(&self, method: &str, script: impl Fn(&Value) -> Vec<Emit> + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(method.to_string(), Arc::new(script));
    }

    /// Make the boundary call for `method` fail synchronously.
    pub fn reject(&self, method: &str, err: BoundaryError) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .insert(method.to_string(), err);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Block until at least `count` calls to `method` were made, or panic
    /// after `timeout`.
    pub fn wait_for_calls(&self, method: &str, count: usize, timeout: Duration) -> Vec<RecordedCall> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            let matching: Vec<RecordedCall> = state
                .calls
                .iter()
                .filter(|call| call.method == method)
                .cloned()
                .collect();
            if matching.len() >= count {
                return matching;
            }
            let now = Instant::now();
            assert!(
                now < deadline,
                "timed out waiting for {count} call(s) to {method}; saw {}",
                matching.len()
            );
            state = self.call_made.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Deliver one event now, on the calling thread.
    pub fn emit(&self, context: ContextId, request_id: RequestId, emit: &Emit) {
        let handler = self.state.lock().unwrap().handlers.get(&context).cloned();
        if let Some(handler) = handler {
            handler.on_response(request_id.value(), &emit.payload, emit.kind, emit.finished);
        }
    }

    pub fn destroyed_contexts(&self) -> Vec<ContextId> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }
}

impl EngineBinding for ScriptedEngine {
    fn create_context(
        &self,
        config_json: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<ContextId, BoundaryError> {
        let config: Value = serde_json::from_str(config_json)
            .map_err(|e| BoundaryError::InvalidConfig(e.to_string()))?;
        if config.get("reject").and_then(Value::as_bool) == Some(true) {
            return Err(BoundaryError::InvalidConfig("rejected by script".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.next_context += 1;
        let context = ContextId::new(state.next_context);
        state.handlers.insert(context, handler);
        Ok(context)
    }

    fn destroy_context(&self, context: ContextId) {
        let mut state = self.state.lock().unwrap();
        state.handlers.remove(&context);
        state.destroyed.push(context);
    }

    fn request(
        &self,
        context: ContextId,
        method: &str,
        params_json: &str,
        request_id: RequestId,
    ) -> Result<(), BoundaryError> {
        let mut state = self.state.lock().unwrap();
        let Some(handler) = state.handlers.get(&context).cloned() else {
            return Err(BoundaryError::ContextNotFound(context));
        };
        let params: Value = serde_json::from_str(params_json).unwrap_or(Value::Null);
        state.calls.push(RecordedCall {
            context,
            method: method.to_string(),
            params: params.clone(),
            request_id,
        });
        self.call_made.notify_all();

        if let Some(err) = state.rejections.get(method) {
            return Err(err.clone());
        }
        let emits = match state.scripts.get(method).cloned() {
            Some(script) => {
                drop(state);
                script(&params)
            }
            // The engine acknowledges every resolution unless told otherwise.
            None if method == RESOLVE_APP_REQUEST => vec![Emit::success(Value::Null).finished()],
            None => return Ok(()),
        };

        std::thread::spawn(move || {
            for emit in emits {
                handler.on_response(request_id.value(), &emit.payload, emit.kind, emit.finished);
            }
        });
        Ok(())
    }
}
