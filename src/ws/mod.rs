//! WebSocket fabric: codec, presence, rooms, cross-node routing, reaper
//!
//! Connections upgrade from HTTP and are driven by [`WsService::serve`];
//! room membership and presence live in Redis so any node can route, and
//! the shared broadcast channel fans messages out across the fleet.

mod codec;
mod config;
mod error;
mod service;

pub use codec::{
    decode_envelope, decode_inbound, decode_outbound, encode_envelope, encode_inbound,
    encode_outbound, CodecError, Envelope, Inbound, InboundKind, Outbound,
};
pub use config::WsSettings;
pub use error::{to_payload, WsError, WsReason};
pub use service::{
    meta_key, room_key, AxumSocketIo, SocketHandle, SocketId, SocketIo, WsService,
    BROADCAST_ROOM, WS_BROADCAST_CHANNEL,
};
