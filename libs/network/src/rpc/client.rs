//! Several RPC sockets to one server behind a single call surface

use super::socket::{NotificationHub, RpcNotification, RpcSocket, RpcStatus};
use super::RpcOptions;
use crate::{Result, TransportError};
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

pub struct RpcClient {
    sockets: Vec<RpcSocket>,
    next: AtomicUsize,
    connected_signal: Arc<Notify>,
    notifications: Arc<NotificationHub>,
    options: RpcOptions,
}

impl RpcClient {
    /// Create `options.socket_count` sockets to `address` and start them
    pub fn connect(address: impl Into<String>, options: RpcOptions) -> Self {
        let address = address.into();
        let notifications = Arc::new(NotificationHub::new(options.recent_id_capacity));
        let connected_signal = Arc::new(Notify::new());

        let sockets: Vec<RpcSocket> = (0..options.socket_count.max(1))
            .map(|_| {
                RpcSocket::with_shared(
                    address.clone(),
                    options.clone(),
                    notifications.clone(),
                    connected_signal.clone(),
                )
            })
            .collect();
        for socket in &sockets {
            socket.start();
        }

        info!(address = %address, sockets = sockets.len(), hub = %options.hub, "rpc client started");
        Self {
            sockets,
            next: AtomicUsize::new(0),
            connected_signal,
            notifications,
            options,
        }
    }

    pub fn sockets(&self) -> &[RpcSocket] {
        &self.sockets
    }

    pub fn connected_count(&self) -> usize {
        self.sockets
            .iter()
            .filter(|s| s.status() == RpcStatus::Connected)
            .count()
    }

    /// Server-initiated events and pushes, de-duplicated across sockets
    pub fn notifications(&self) -> broadcast::Receiver<RpcNotification> {
        self.notifications.subscribe()
    }

    fn next_connected(&self) -> Option<&RpcSocket> {
        let count = self.sockets.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|offset| &self.sockets[(start + offset) % count])
            .find(|socket| socket.status() == RpcStatus::Connected)
    }

    /// Next connected socket in round-robin order, waiting until `deadline`
    async fn pick_socket(&self, deadline: Instant) -> Result<&RpcSocket> {
        loop {
            // Register interest before checking so a connect in between is not missed
            let mut notified = pin!(self.connected_signal.notified());
            notified.as_mut().enable();

            if let Some(socket) = self.next_connected() {
                return Ok(socket);
            }

            debug!("no rpc socket connected, waiting");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TransportError::timeout(
                    "waiting for a connected rpc socket",
                    self.options.invoke_timeout_ms,
                ));
            }
        }
    }

    pub async fn invoke_method(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.options.invoke_timeout();
        let socket = self.pick_socket(deadline).await?;
        socket.invoke_method(method, payload).await
    }

    pub async fn close(&self) {
        for socket in &self.sockets {
            socket.close().await;
        }
        debug!(sockets = self.sockets.len(), "rpc client closed");
    }
}
