//! ChatRelay wire envelopes
//!
//! Message bodies exchanged over the broker. Both directions are UTF-8 JSON
//! objects. The broker has no native request/response correlation, so the
//! response echoes the request's `chat_uuid` and `socketio_session_id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel `user_uuid` stamped on every response unless configured otherwise.
pub const DEFAULT_USER_UUID: &str = "95a952c4-0deb-4382-9a51-1932c31c9bc0";

/// Parsed form of [`DEFAULT_USER_UUID`].
pub const fn default_user_uuid() -> Uuid {
    Uuid::from_u128(0x95a952c4_0deb_4382_9a51_1932c31c9bc0)
}

/// Inbound chat request published by the upstream gateway.
///
/// Unknown fields are ignored; the three fields below must be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Opaque conversation identifier
    pub chat_uuid: String,

    /// Opaque client-session identifier
    pub socketio_session_id: String,

    /// Prompt text
    pub message: String,
}

impl ChatRequest {
    /// Decode a raw delivery body
    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Outbound reply routed back to the originating conversation.
///
/// Field order is part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    pub user_uuid: Uuid,
    pub chat_uuid: String,
    pub socketio_session_id: String,
    pub message: String,
}

impl ChatResponse {
    /// Build the reply to `request`, copying its correlation fields.
    pub fn reply_to(request: &ChatRequest, user_uuid: Uuid, message: impl Into<String>) -> Self {
        Self {
            user_uuid,
            chat_uuid: request.chat_uuid.clone(),
            socketio_session_id: request.socketio_session_id.clone(),
            message: message.into(),
        }
    }

    /// Serialize to the JSON body published on the response queue
    pub fn to_vec(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}
