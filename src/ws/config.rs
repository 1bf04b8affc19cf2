//! WebSocket fabric configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// WebSocket service settings
///
/// Duration ordering is validated at load: the pong timeout must exceed the
/// ping interval, metadata must outlive rooms, and presence must survive at
/// least three missed pings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsSettings {
    /// Ping cadence per socket
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Close sockets whose last pong is older than this
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,

    /// Reaper sweep cadence
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Maximum rooms a single socket may join
    #[serde(default = "default_max_rooms_per_socket")]
    pub max_rooms_per_socket: usize,

    /// Room membership TTL in seconds
    #[serde(default = "default_room_ttl_secs")]
    pub room_ttl_secs: u64,

    /// Per-socket metadata TTL in seconds
    #[serde(default = "default_meta_ttl_secs")]
    pub meta_ttl_secs: u64,

    /// Presence map TTL in seconds
    #[serde(default = "default_presence_ttl_secs")]
    pub presence_ttl_secs: u64,

    /// This node's identity on the broadcast channel
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            max_rooms_per_socket: default_max_rooms_per_socket(),
            room_ttl_secs: default_room_ttl_secs(),
            meta_ttl_secs: default_meta_ttl_secs(),
            presence_ttl_secs: default_presence_ttl_secs(),
            node_id: default_node_id(),
        }
    }
}

impl WsSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn room_ttl(&self) -> Duration {
        Duration::from_secs(self.room_ttl_secs)
    }

    pub fn meta_ttl(&self) -> Duration {
        Duration::from_secs(self.meta_ttl_secs)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    /// Enforce the duration-ordering invariants
    pub fn validate(&self) -> Result<()> {
        if self.pong_timeout_ms <= self.ping_interval_ms {
            return Err(Error::validation(
                "ws.pong_timeout_ms",
                "must exceed ping_interval_ms",
            ));
        }
        if self.meta_ttl_secs <= self.room_ttl_secs {
            return Err(Error::validation(
                "ws.meta_ttl_secs",
                "must exceed room_ttl_secs",
            ));
        }
        if self.presence_ttl_secs * 1000 < self.ping_interval_ms * 3 {
            return Err(Error::validation(
                "ws.presence_ttl_secs",
                "must be at least three ping intervals",
            ));
        }
        Ok(())
    }
}

const fn default_ping_interval_ms() -> u64 {
    30_000
}

const fn default_pong_timeout_ms() -> u64 {
    75_000
}

const fn default_reaper_interval_ms() -> u64 {
    10_000
}

const fn default_max_rooms_per_socket() -> usize {
    10
}

const fn default_room_ttl_secs() -> u64 {
    3_600
}

const fn default_meta_ttl_secs() -> u64 {
    7_200
}

const fn default_presence_ttl_secs() -> u64 {
    120
}

fn default_node_id() -> String {
    format!("node-{}", Uuid::new_v4())
}
