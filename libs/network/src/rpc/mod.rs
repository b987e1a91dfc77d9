//! RPC socket protocol
//!
//! A session-oriented request/response protocol over plain TCP, independent
//! of the broker path. Frames are `[u32 LE length][u8 tag][bincode body]`
//! (see [`codec::rpc`]).
//!
//! - [`RpcSocket`]: one connection with handshake, reconnect, keepalive and
//!   a single retry on timeout
//! - [`RpcClient`]: several sockets to one server, round-robin
//! - [`RpcServer`]: the accepting side, dispatching to an [`RpcHandler`]

pub mod client;
pub mod io;
pub mod server;
pub mod socket;

pub use client::RpcClient;
pub use io::{FrameReader, FrameWriter};
pub use server::{RpcHandler, RpcServer, SessionInfo};
pub use socket::{NotificationHub, RpcNotification, RpcSession, RpcSocket, RpcStatus};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Notification ids remembered for de-duplication
pub const DEFAULT_RECENT_IDS: usize = 1024;

/// Timing and sizing for RPC sockets and servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcOptions {
    /// Hub name presented in the session handshake
    pub hub: String,
    pub client_name: String,
    pub invoke_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Ping once nothing has crossed the wire for this long
    pub keepalive_idle_ms: u64,
    pub keepalive_check_ms: u64,
    pub max_message_size: usize,
    pub recent_id_capacity: usize,
    /// Sockets per client
    pub socket_count: usize,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            hub: "default".to_string(),
            client_name: "switchboard".to_string(),
            invoke_timeout_ms: 20_000,
            handshake_timeout_ms: 10_000,
            reconnect_delay_ms: 5_000,
            keepalive_idle_ms: 40_000,
            keepalive_check_ms: 45_000,
            max_message_size: codec::DEFAULT_MAX_RPC_MESSAGE_SIZE,
            recent_id_capacity: DEFAULT_RECENT_IDS,
            socket_count: 2,
        }
    }
}

impl RpcOptions {
    pub fn new(hub: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            hub: hub.into(),
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_millis(self.keepalive_idle_ms)
    }

    pub fn keepalive_check(&self) -> Duration {
        Duration::from_millis(self.keepalive_check_ms)
    }
}
