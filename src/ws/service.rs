//! WebSocket socket service: registry, read loop, ping scheduler, reaper,
//! and cross-node routing
//!
//! Each socket is owned by its serve loop; other components reach it only
//! through the service API. Room membership and presence live in Redis so
//! any node can route; delivery to local sockets happens through the shared
//! broadcast channel, which every node subscribes to.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::codec::{self, Envelope, Inbound, Outbound};
use super::config::WsSettings;
use super::error::{WsError, WsReason};
use crate::cache::presence::{Presence, PresenceEntry};
use crate::cache::{CacheService, RedisDriver};
use crate::context::TenantId;
use crate::error::{Error, Result};

/// Shared channel carrying transport envelopes between nodes
pub const WS_BROADCAST_CHANNEL: &str = "ws:broadcast";

/// Membership set for a room
pub fn room_key(tenant: TenantId, room_id: &str) -> String {
    format!("room:{tenant}:{room_id}")
}

/// Per-socket metadata entry
pub fn meta_key(socket_id: &SocketId) -> String {
    format!("ws:meta:{socket_id}")
}

/// Room id used when a tenant-wide broadcast is delivered to a socket
pub const BROADCAST_ROOM: &str = "*";

/// Socket identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport abstraction so tests can drive sockets without a network
#[async_trait]
pub trait SocketIo: Send {
    /// Next text frame; `None` when the peer closed, `Err` on transport
    /// failure
    async fn next_text(&mut self) -> Option<std::result::Result<String, WsError>>;
    async fn send_text(&mut self, text: String) -> std::result::Result<(), WsError>;
}

/// Axum WebSocket adapter
pub struct AxumSocketIo(pub axum::extract::ws::WebSocket);

#[async_trait]
impl SocketIo for AxumSocketIo {
    async fn next_text(&mut self) -> Option<std::result::Result<String, WsError>> {
        use axum::extract::ws::Message;
        loop {
            match self.0.recv().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => {
                    return Some(Err(
                        WsError::new(WsReason::SendFailed).with_cause(err.to_string())
                    ))
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> std::result::Result<(), WsError> {
        use axum::extract::ws::Message;
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| WsError::new(WsReason::SendFailed).with_cause(err.to_string()))
    }
}

/// Live socket record, owned by its serve loop
pub struct SocketHandle {
    id: SocketId,
    tenant_id: TenantId,
    user_id: String,
    outbound: mpsc::Sender<Outbound>,
    rooms: Mutex<HashSet<String>>,
    last_pong_at: Mutex<Instant>,
    cancel: CancellationToken,
}

impl SocketHandle {
    pub fn id(&self) -> &SocketId {
        &self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn rooms(&self) -> HashSet<String> {
        match self.rooms.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn in_room(&self, room_id: &str) -> bool {
        match self.rooms.lock() {
            Ok(guard) => guard.contains(room_id),
            Err(poisoned) => poisoned.into_inner().contains(room_id),
        }
    }

    fn touch_pong(&self) {
        let now = Instant::now();
        match self.last_pong_at.lock() {
            Ok(mut guard) => *guard = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    fn pong_age(&self) -> Duration {
        match self.last_pong_at.lock() {
            Ok(guard) => guard.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }
}

enum LoopStep {
    Stop,
    Incoming(Option<std::result::Result<String, WsError>>),
    Outgoing(Option<Outbound>),
    Ping,
}

/// The socket service
pub struct WsService {
    settings: WsSettings,
    cache: CacheService,
    presence: Presence,
    sockets: DashMap<SocketId, Arc<SocketHandle>>,
    cancel: CancellationToken,
}

impl WsService {
    pub fn new(settings: WsSettings, cache: CacheService) -> Result<Arc<Self>> {
        settings.validate()?;
        let presence = Presence::new(cache.clone(), settings.presence_ttl());
        Ok(Arc::new(Self {
            settings,
            cache,
            presence,
            sockets: DashMap::new(),
            cancel: CancellationToken::new(),
        }))
    }

    pub fn settings(&self) -> &WsSettings {
        &self.settings
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Stop every socket and background task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run one socket to completion
    ///
    /// Registers presence, drives the read loop and the ping scheduler, and
    /// runs the full cleanup on any exit path.
    pub async fn serve<S: SocketIo>(
        &self,
        mut io: S,
        tenant_id: TenantId,
        user_id: String,
    ) -> Result<SocketId> {
        tenant_id.require_specified()?;
        let socket_id = SocketId::generate();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);
        let handle = Arc::new(SocketHandle {
            id: socket_id.clone(),
            tenant_id,
            user_id: user_id.clone(),
            outbound: outbound_tx,
            rooms: Mutex::new(HashSet::new()),
            last_pong_at: Mutex::new(Instant::now()),
            cancel: self.cancel.child_token(),
        });
        self.sockets.insert(socket_id.clone(), Arc::clone(&handle));
        if let Err(err) = self
            .presence
            .set(
                tenant_id,
                socket_id.as_str(),
                &PresenceEntry {
                    user_id,
                    connected_at: Utc::now(),
                },
            )
            .await
        {
            self.sockets.remove(&socket_id);
            return Err(err);
        }
        tracing::debug!(socket = %socket_id, tenant = %tenant_id, "socket connected");

        let mut ping = tokio::time::interval(self.settings.ping_interval());
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let step = tokio::select! {
                _ = handle.cancel.cancelled() => LoopStep::Stop,
                incoming = io.next_text() => LoopStep::Incoming(incoming),
                outgoing = outbound_rx.recv() => LoopStep::Outgoing(outgoing),
                _ = ping.tick() => LoopStep::Ping,
            };
            match step {
                LoopStep::Stop => break,
                LoopStep::Incoming(None) => break,
                LoopStep::Incoming(Some(Err(err))) => {
                    tracing::debug!(socket = %handle.id, error = %err, "transport error");
                    break;
                }
                LoopStep::Incoming(Some(Ok(text))) => {
                    let reply = match codec::decode_inbound(&text) {
                        // Decode failure answers with an error payload and
                        // keeps the socket open.
                        Err(err) => Some(super::error::to_payload(&err)),
                        Ok(message) => self.handle_inbound(&handle, message).await,
                    };
                    if let Some(reply) = reply {
                        if self.send_frame(&mut io, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                LoopStep::Outgoing(None) => break,
                LoopStep::Outgoing(Some(message)) => {
                    if self.send_frame(&mut io, &message).await.is_err() {
                        break;
                    }
                }
                LoopStep::Ping => {
                    let ping = Outbound::Ping {
                        server_time: Utc::now().timestamp_millis(),
                    };
                    if self.send_frame(&mut io, &ping).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.cleanup(&handle).await;
        Ok(socket_id)
    }

    async fn send_frame<S: SocketIo>(
        &self,
        io: &mut S,
        message: &Outbound,
    ) -> std::result::Result<(), WsError> {
        let text = codec::encode_outbound(message).map_err(|err| {
            WsError::new(WsReason::InvalidMessage).with_cause(err.to_string())
        })?;
        io.send_text(text).await
    }

    async fn handle_inbound(
        &self,
        handle: &Arc<SocketHandle>,
        message: Inbound,
    ) -> Option<Outbound> {
        match message {
            Inbound::Join { room_id } => {
                if handle.rooms().len() >= self.settings.max_rooms_per_socket {
                    return Some(Outbound::Error {
                        reason: WsReason::RoomLimit,
                    });
                }
                let key = room_key(handle.tenant_id, &room_id);
                if let Err(err) = self
                    .cache
                    .sadd(&key, &[handle.id.to_string()])
                    .await
                {
                    tracing::warn!(socket = %handle.id, error = %err, "room join failed");
                    return Some(Outbound::Error {
                        reason: WsReason::SendFailed,
                    });
                }
                let _ = self.cache.touch(&key, self.settings.room_ttl()).await;
                match handle.rooms.lock() {
                    Ok(mut rooms) => {
                        rooms.insert(room_id);
                    }
                    Err(poisoned) => {
                        poisoned.into_inner().insert(room_id);
                    }
                }
                None
            }
            Inbound::Leave { room_id } => {
                let was_member = match handle.rooms.lock() {
                    Ok(mut rooms) => rooms.remove(&room_id),
                    Err(poisoned) => poisoned.into_inner().remove(&room_id),
                };
                if !was_member {
                    return Some(Outbound::Error {
                        reason: WsReason::NotInRoom,
                    });
                }
                let key = room_key(handle.tenant_id, &room_id);
                let _ = self.cache.srem(&key, &[handle.id.to_string()]).await;
                None
            }
            Inbound::Send { room_id, data } => {
                if !handle.in_room(&room_id) {
                    return Some(Outbound::Error {
                        reason: WsReason::NotInRoom,
                    });
                }
                let envelope = Envelope::Room {
                    tenant_id: handle.tenant_id,
                    node_id: self.settings.node_id.clone(),
                    room_id,
                    data,
                };
                self.publish(handle, envelope).await
            }
            Inbound::Direct { target, data } => {
                let envelope = Envelope::Direct {
                    tenant_id: handle.tenant_id,
                    node_id: self.settings.node_id.clone(),
                    target_socket_id: target,
                    data,
                    from_socket_id: handle.id.to_string(),
                };
                self.publish(handle, envelope).await
            }
            Inbound::MetaGet => {
                let data = match self.cache.driver().get(&meta_key(&handle.id)).await {
                    Ok(Some(raw)) => {
                        serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
                    }
                    _ => serde_json::Value::Null,
                };
                Some(Outbound::MetaData { data })
            }
            Inbound::MetaSet { data } => {
                let raw = data.to_string();
                if let Err(err) = self
                    .cache
                    .driver()
                    .set(
                        &meta_key(&handle.id),
                        &raw,
                        Some(self.settings.meta_ttl()),
                    )
                    .await
                {
                    tracing::warn!(socket = %handle.id, error = %err, "meta write failed");
                    return Some(Outbound::Error {
                        reason: WsReason::SendFailed,
                    });
                }
                None
            }
            Inbound::Pong => {
                handle.touch_pong();
                None
            }
        }
    }

    async fn publish(&self, handle: &Arc<SocketHandle>, envelope: Envelope) -> Option<Outbound> {
        match self.cache.publish(WS_BROADCAST_CHANNEL, &envelope).await {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(socket = %handle.id, error = %err, "publish failed");
                Some(Outbound::Error {
                    reason: WsReason::SendFailed,
                })
            }
        }
    }

    async fn cleanup(&self, handle: &Arc<SocketHandle>) {
        self.sockets.remove(&handle.id);
        let _ = self
            .presence
            .remove(handle.tenant_id, handle.id.as_str())
            .await;
        for room_id in handle.rooms() {
            let key = room_key(handle.tenant_id, &room_id);
            let _ = self.cache.srem(&key, &[handle.id.to_string()]).await;
        }
        handle.cancel.cancel();
        tracing::debug!(socket = %handle.id, "socket cleaned up");
    }

    /// Listen on the broadcast channel and deliver to local sockets
    pub async fn spawn_router(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let mut rx = self.cache.driver().subscribe(WS_BROADCAST_CHANNEL).await?;
        let service = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    payload = rx.recv() => {
                        let Some(payload) = payload else { break };
                        let Ok(envelope) = codec::decode_envelope(&payload) else {
                            tracing::debug!("dropping undecodable envelope");
                            continue;
                        };
                        service.deliver(envelope);
                    }
                }
            }
        }))
    }

    /// Deliver one envelope to the sockets this node hosts
    fn deliver(&self, envelope: Envelope) {
        match envelope {
            Envelope::Room {
                tenant_id,
                room_id,
                data,
                ..
            } => {
                for entry in self.sockets.iter() {
                    let handle = entry.value();
                    if handle.tenant_id == tenant_id && handle.in_room(&room_id) {
                        Self::offer(
                            handle,
                            Outbound::RoomMessage {
                                room_id: room_id.clone(),
                                data: data.clone(),
                            },
                        );
                    }
                }
            }
            Envelope::Direct {
                tenant_id,
                target_socket_id,
                data,
                from_socket_id,
                ..
            } => {
                let target = SocketId(target_socket_id);
                if let Some(handle) = self.sockets.get(&target) {
                    if handle.tenant_id == tenant_id {
                        Self::offer(
                            &handle,
                            Outbound::DirectMessage {
                                data,
                                from_socket_id,
                            },
                        );
                    }
                }
            }
            Envelope::Broadcast {
                tenant_id, data, ..
            } => {
                for entry in self.sockets.iter() {
                    let handle = entry.value();
                    if handle.tenant_id == tenant_id {
                        // Tenant-wide fan-out delivers on the wildcard room.
                        Self::offer(
                            handle,
                            Outbound::RoomMessage {
                                room_id: BROADCAST_ROOM.to_string(),
                                data: data.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    fn offer(handle: &Arc<SocketHandle>, message: Outbound) {
        // A socket that cannot keep up loses messages rather than stalling
        // the router.
        if handle.outbound.try_send(message).is_err() {
            tracing::warn!(socket = %handle.id, "outbound queue full, dropping frame");
        }
    }

    /// Close sockets that stopped answering pings; refresh presence TTLs
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(service.settings.reaper_interval());
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = service.cancel.cancelled() => break,
                    _ = sweep.tick() => {
                        let timeout = service.settings.pong_timeout();
                        let mut tenants = HashSet::new();
                        for entry in service.sockets.iter() {
                            let handle = entry.value();
                            tenants.insert(handle.tenant_id);
                            if handle.pong_age() > timeout {
                                tracing::info!(socket = %handle.id, "reaping unresponsive socket");
                                handle.cancel.cancel();
                            }
                        }
                        for tenant in tenants {
                            let _ = service.presence.refresh(tenant).await;
                        }
                    }
                }
            }
        })
    }

    /// Members of a room, from the authoritative membership set
    pub async fn room_members(&self, tenant: TenantId, room_id: &str) -> Vec<String> {
        self.cache.smembers(&room_key(tenant, room_id)).await
    }

    /// Force-close a socket by id
    pub fn close_socket(&self, socket_id: &SocketId) -> Result<()> {
        let handle = self
            .sockets
            .get(socket_id)
            .ok_or_else(|| Error::not_found_id("socket", socket_id.to_string()))?;
        handle.cancel.cancel();
        Ok(())
    }
}
