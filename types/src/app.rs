//! App Object wire types.
//!
//! Each capability family is a pair of `type`-tagged enums: the request the
//! engine sends and the response local code resolves it with. Decoding goes
//! through serde so the set of message types is closed and every `match`
//! over it is exhaustive.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{AppRequestId, Handle};

/// Envelope of an AppRequest-kind event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRequest {
    pub app_request_id: AppRequestId,
    pub request_data: Value,
}

/// Outcome submitted back through `client.resolve_app_request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AppRequestResult {
    Ok { result: Value },
    Error { text: String },
}

impl AppRequestResult {
    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

// ============================================================================
// Signing box
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SigningBoxRequest {
    GetPublicKey,
    Sign { unsigned: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SigningBoxResponse {
    GetPublicKey { public_key: String },
    Sign { signature: String },
}

// ============================================================================
// Encryption box
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncryptionBoxRequest {
    GetInfo,
    Encrypt { data: String },
    Decrypt { data: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EncryptionBoxResponse {
    GetInfo { info: Value },
    Encrypt { data: String },
    Decrypt { data: String },
}

// ============================================================================
// Debot browser
// ============================================================================

/// Requests a debot browser must answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebotBrowserRequest {
    Input { prompt: String },
    GetSigningBox,
    InvokeDebot { debot_addr: String, action: Value },
    Approve { activity: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebotBrowserResponse {
    Input { value: String },
    GetSigningBox { signing_box: Handle },
    InvokeDebot,
    Approve { approved: bool },
}

/// One-way notifications to a debot browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebotBrowserNotify {
    Log { msg: String },
    Switch { context_id: u8 },
    SwitchCompleted,
    ShowAction { action: Value },
    Send { message: String },
}
