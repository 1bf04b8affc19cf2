//! WebSocket wire codec
//!
//! Three message families share the `_tag` discriminator: inbound
//! (client → server), outbound (server → client), and the transport envelope
//! that crosses nodes. Encode and decode are symmetric for every valid
//! value; malformed JSON and unknown tags are rejected at decode.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use super::error::WsReason;
use crate::context::TenantId;

/// Decode failure
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    #[error("parse error: {detail}")]
    Parse { detail: String },
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum Inbound {
    #[serde(rename = "join")]
    Join { room_id: String },
    #[serde(rename = "leave")]
    Leave { room_id: String },
    #[serde(rename = "send")]
    Send {
        room_id: String,
        data: serde_json::Value,
    },
    #[serde(rename = "direct")]
    Direct {
        target: String,
        data: serde_json::Value,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "meta.get")]
    MetaGet,
    #[serde(rename = "meta.set")]
    MetaSet { data: serde_json::Value },
}

/// Inbound subdivision: commands mutate state, signals do not
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Command,
    Signal,
}

impl Inbound {
    pub fn kind(&self) -> InboundKind {
        match self {
            Self::Pong => InboundKind::Signal,
            _ => InboundKind::Command,
        }
    }
}

/// Server → client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum Outbound {
    #[serde(rename = "error")]
    Error { reason: WsReason },
    #[serde(rename = "ping")]
    Ping { server_time: i64 },
    #[serde(rename = "room.message")]
    RoomMessage {
        room_id: String,
        data: serde_json::Value,
    },
    #[serde(rename = "direct.message")]
    DirectMessage {
        data: serde_json::Value,
        from_socket_id: String,
    },
    #[serde(rename = "meta.data")]
    MetaData { data: serde_json::Value },
}

/// Inter-node transport envelope on the broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_tag", rename_all_fields = "camelCase")]
pub enum Envelope {
    #[serde(rename = "room")]
    Room {
        tenant_id: TenantId,
        node_id: String,
        room_id: String,
        data: serde_json::Value,
    },
    #[serde(rename = "direct")]
    Direct {
        tenant_id: TenantId,
        node_id: String,
        target_socket_id: String,
        data: serde_json::Value,
        from_socket_id: String,
    },
    #[serde(rename = "broadcast")]
    Broadcast {
        tenant_id: TenantId,
        node_id: String,
        data: serde_json::Value,
    },
}

impl Envelope {
    pub fn tenant_id(&self) -> TenantId {
        match self {
            Self::Room { tenant_id, .. }
            | Self::Direct { tenant_id, .. }
            | Self::Broadcast { tenant_id, .. } => *tenant_id,
        }
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::Parse {
        detail: e.to_string(),
    })
}

fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Parse {
        detail: e.to_string(),
    })
}

pub fn decode_inbound(raw: &str) -> Result<Inbound, CodecError> {
    decode(raw)
}

pub fn encode_inbound(message: &Inbound) -> Result<String, CodecError> {
    encode(message)
}

pub fn decode_outbound(raw: &str) -> Result<Outbound, CodecError> {
    decode(raw)
}

pub fn encode_outbound(message: &Outbound) -> Result<String, CodecError> {
    encode(message)
}

pub fn decode_envelope(raw: &str) -> Result<Envelope, CodecError> {
    decode(raw)
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    encode(envelope)
}
