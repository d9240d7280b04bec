//! Response events delivered by the engine callback.
//!
//! The engine reports every outcome as `(request_id, payload, kind, finished)`.
//! [`ResponseEvent::from_raw`] is the only decode step: it classifies the kind
//! code and attempts to parse the payload, keeping unparseable text as
//! [`Payload::Opaque`] so the consumer can report it instead of losing it.

use serde::Deserialize;
use serde_json::Value;

use crate::ids::RequestId;

/// Classification of a response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Success,
    Error,
    /// Payload-less marker; usually carries `finished` to close a stream.
    Nop,
    /// Nested request that local code must resolve.
    AppRequest,
    /// One-way notification for local code.
    AppNotify,
    /// Engine-defined stream event (codes >= 100 by convention).
    Custom(u32),
}

impl ResponseKind {
    pub const SUCCESS: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const NOP: u32 = 2;
    pub const APP_REQUEST: u32 = 3;
    pub const APP_NOTIFY: u32 = 4;
    pub const CUSTOM_BASE: u32 = 100;

    #[must_use]
    pub fn from_code(code: u32) -> Self {
        match code {
            Self::SUCCESS => Self::Success,
            Self::ERROR => Self::Error,
            Self::NOP => Self::Nop,
            Self::APP_REQUEST => Self::AppRequest,
            Self::APP_NOTIFY => Self::AppNotify,
            other => Self::Custom(other),
        }
    }

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::Success => Self::SUCCESS,
            Self::Error => Self::ERROR,
            Self::Nop => Self::NOP,
            Self::AppRequest => Self::APP_REQUEST,
            Self::AppNotify => Self::APP_NOTIFY,
            Self::Custom(code) => code,
        }
    }

    /// AppRequest and AppNotify go to the App Object protocol, not to a
    /// request queue.
    #[must_use]
    pub fn is_app(self) -> bool {
        matches!(self, Self::AppRequest | Self::AppNotify)
    }
}

/// Event payload as delivered on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Empty string; typical for `Nop`.
    Empty,
    Json(Value),
    /// Text that failed to parse as JSON.
    Opaque(String),
}

impl Payload {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::Empty;
        }
        match serde_json::from_str(raw) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Opaque(raw.to_string()),
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Empty | Self::Opaque(_) => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// One event for one request id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub request_id: RequestId,
    pub kind: ResponseKind,
    pub payload: Payload,
    pub finished: bool,
}

impl ResponseEvent {
    #[must_use]
    pub fn new(request_id: RequestId, kind: ResponseKind, payload: Payload, finished: bool) -> Self {
        Self {
            request_id,
            kind,
            payload,
            finished,
        }
    }

    /// Decode the raw callback arguments.
    #[must_use]
    pub fn from_raw(request_id: u32, payload: &str, kind: u32, finished: bool) -> Self {
        Self {
            request_id: RequestId::new(request_id),
            kind: ResponseKind::from_code(kind),
            payload: Payload::parse(payload),
            finished,
        }
    }

    /// Error kind or `finished` ends consumption for the id.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.finished || self.kind == ResponseKind::Error
    }
}

/// Structured failure reported by the engine in an Error-kind event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl EngineError {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }

    /// `None` when the payload does not have the `{code, message}` shape.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine error {}: {}", self.code, self.message)
    }
}
