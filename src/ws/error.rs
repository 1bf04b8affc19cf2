//! WebSocket error algebra

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::codec::Outbound;

/// Failure reasons, with derived retry/terminal flags
///
/// | reason          | retryable | terminal |
/// |-----------------|-----------|----------|
/// | send_failed     | yes       | no       |
/// | room_limit      | no        | no       |
/// | not_in_room     | no        | no       |
/// | invalid_message | no        | yes      |
/// | disconnecting   | no        | yes      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsReason {
    SendFailed,
    RoomLimit,
    NotInRoom,
    InvalidMessage,
    Disconnecting,
}

impl WsReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendFailed => "send_failed",
            Self::RoomLimit => "room_limit",
            Self::NotInRoom => "not_in_room",
            Self::InvalidMessage => "invalid_message",
            Self::Disconnecting => "disconnecting",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SendFailed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::InvalidMessage | Self::Disconnecting)
    }
}

/// A WebSocket-layer failure
#[derive(Debug, Clone, Error)]
#[error("ws {}: {}", .reason.as_str(), .cause.as_deref().unwrap_or("-"))]
pub struct WsError {
    pub reason: WsReason,
    pub socket_id: Option<String>,
    pub cause: Option<String>,
}

impl WsError {
    pub fn new(reason: WsReason) -> Self {
        Self {
            reason,
            socket_id: None,
            cause: None,
        }
    }

    pub fn with_socket(mut self, socket_id: impl Into<String>) -> Self {
        self.socket_id = Some(socket_id.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }

    pub fn is_terminal(&self) -> bool {
        self.reason.is_terminal()
    }
}

/// Collapse any failure to the outbound error payload
///
/// A [`WsError`] keeps its reason; anything else reads as
/// `invalid_message`.
pub fn to_payload<E: std::any::Any>(err: &E) -> Outbound {
    let reason = (err as &dyn std::any::Any)
        .downcast_ref::<WsError>()
        .map(|ws| ws.reason)
        .unwrap_or(WsReason::InvalidMessage);
    Outbound::Error { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_table() {
        let table = [
            (WsReason::SendFailed, true, false),
            (WsReason::RoomLimit, false, false),
            (WsReason::NotInRoom, false, false),
            (WsReason::InvalidMessage, false, true),
            (WsReason::Disconnecting, false, true),
        ];
        for (reason, retryable, terminal) in table {
            assert_eq!(reason.is_retryable(), retryable, "{}", reason.as_str());
            assert_eq!(reason.is_terminal(), terminal, "{}", reason.as_str());
        }
    }

    #[test]
    fn test_to_payload_keeps_ws_reason() {
        let err = WsError::new(WsReason::RoomLimit).with_socket("sock-1");
        match to_payload(&err) {
            Outbound::Error { reason } => assert_eq!(reason, WsReason::RoomLimit),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_to_payload_collapses_foreign_errors() {
        let err = crate::error::Error::not_found("room");
        match to_payload(&err) {
            Outbound::Error { reason } => assert_eq!(reason, WsReason::InvalidMessage),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_reason_wire_form() {
        assert_eq!(
            serde_json::to_string(&WsReason::SendFailed).unwrap(),
            "\"send_failed\""
        );
    }
}
