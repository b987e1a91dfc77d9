//! One client-side RPC connection
//!
//! Status moves `Disconnected -> Connecting -> Connected`. Connecting means
//! a TCP connect followed by a session handshake; only a completed handshake
//! counts as connected. While the socket is started, a supervisor task keeps
//! trying to get back to `Connected` whenever the link drops, waiting a fixed
//! delay after each failed attempt.
//!
//! Every established link gets a generation number. Tasks tied to an old
//! link check it before touching shared state, so a late reader exit cannot
//! tear down the link that replaced it.

use super::io::{FrameReader, FrameWriter};
use super::RpcOptions;
use crate::correlation::{CorrelationRegistry, WaitOutcome};
use crate::{Result, TransportError};
use codec::{
    CorrelationId, EventMessage, PushMessage, RpcMessage, RpcRequest, SessionRequest,
};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const NOTIFICATION_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Session granted by the server's handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcSession {
    pub session_id: CorrelationId,
    pub hub: String,
}

/// Server-initiated message delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcNotification {
    Event(EventMessage),
    Push(PushMessage),
}

impl RpcNotification {
    pub fn message_id(&self) -> CorrelationId {
        match self {
            RpcNotification::Event(m) => m.message_id,
            RpcNotification::Push(m) => m.message_id,
        }
    }
}

/// Fans notifications out to subscribers, dropping repeated ids
///
/// Shared by every socket of a client so a message seen on two sockets is
/// delivered once. Seen ids live in a bounded LRU; a repeat refreshes its
/// entry so the least recently seen id is the one evicted.
pub struct NotificationHub {
    sender: broadcast::Sender<RpcNotification>,
    recent: Mutex<LruCache<CorrelationId, ()>>,
}

impl NotificationHub {
    pub fn new(recent_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let capacity = NonZeroUsize::new(recent_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            sender,
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcNotification> {
        self.sender.subscribe()
    }

    /// Returns false when the id was seen recently and the message dropped
    pub fn deliver(&self, notification: RpcNotification) -> bool {
        let id = notification.message_id();
        {
            let mut recent = self.recent.lock();
            if recent.get(&id).is_some() {
                debug!(message_id = %id, "duplicate notification dropped");
                return false;
            }
            recent.put(id, ());
        }
        // No receivers is not an error; nobody is listening yet
        let _ = self.sender.send(notification);
        true
    }
}

struct SocketInner {
    address: String,
    options: RpcOptions,
    registry: CorrelationRegistry<CorrelationId, RpcMessage>,
    status: watch::Sender<RpcStatus>,
    writer: tokio::sync::Mutex<Option<FrameWriter<OwnedWriteHalf>>>,
    session: Mutex<Option<RpcSession>>,
    link: Mutex<CancellationToken>,
    generation: AtomicU64,
    last_activity: Mutex<Instant>,
    reset_count: AtomicU64,
    started: AtomicBool,
    shutdown: CancellationToken,
    notifications: Arc<NotificationHub>,
    connected_signal: Arc<Notify>,
}

/// Client end of one RPC connection
#[derive(Clone)]
pub struct RpcSocket {
    inner: Arc<SocketInner>,
}

impl RpcSocket {
    pub fn new(address: impl Into<String>, options: RpcOptions) -> Self {
        let notifications = Arc::new(NotificationHub::new(options.recent_id_capacity));
        Self::with_shared(address, options, notifications, Arc::new(Notify::new()))
    }

    /// Socket sharing a notification hub and connected signal with siblings
    pub fn with_shared(
        address: impl Into<String>,
        options: RpcOptions,
        notifications: Arc<NotificationHub>,
        connected_signal: Arc<Notify>,
    ) -> Self {
        let (status, _) = watch::channel(RpcStatus::Disconnected);
        Self {
            inner: Arc::new(SocketInner {
                address: address.into(),
                options,
                registry: CorrelationRegistry::new(),
                status,
                writer: tokio::sync::Mutex::new(None),
                session: Mutex::new(None),
                link: Mutex::new(CancellationToken::new()),
                generation: AtomicU64::new(0),
                last_activity: Mutex::new(Instant::now()),
                reset_count: AtomicU64::new(0),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                notifications,
                connected_signal,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn status(&self) -> RpcStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RpcStatus> {
        self.inner.status.subscribe()
    }

    pub fn session(&self) -> Option<RpcSession> {
        self.inner.session.lock().clone()
    }

    /// Number of resets performed after timed-out calls or on request
    pub fn reset_count(&self) -> u64 {
        self.inner.reset_count.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> broadcast::Receiver<RpcNotification> {
        self.inner.notifications.subscribe()
    }

    /// Start the supervisor and keepalive tasks; later calls do nothing
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.inner.clone().supervise());
        tokio::spawn(self.inner.clone().keepalive());
    }

    /// Wait until the socket reports `Connected`
    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut status = self.inner.status.subscribe();
        let waited =
            tokio::time::timeout(timeout, wait_for_status(&mut status, RpcStatus::Connected)).await;

        match waited {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::cancelled("rpc socket closed")),
            Err(_) => Err(TransportError::timeout(
                format!("connect to {}", self.inner.address),
                timeout.as_millis() as u64,
            )),
        }
    }

    /// Call `method`, retrying once through a fresh link if the first try times out
    pub async fn invoke_method(&self, method: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let timeout = self.inner.options.invoke_timeout();

        match self.inner.invoke_once(method, payload.clone(), timeout).await {
            Err(TransportError::Timeout { .. }) => {
                warn!(
                    address = %self.inner.address,
                    method,
                    "rpc call timed out, resetting socket and retrying once"
                );
                self.reset().await;
                self.wait_connected(timeout).await?;
                self.inner.invoke_once(method, payload, timeout).await
            }
            other => other,
        }
    }

    /// Drop the current link; the supervisor reconnects
    pub async fn reset(&self) {
        self.inner.reset_count.fetch_add(1, Ordering::SeqCst);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        info!(address = %self.inner.address, generation, "resetting rpc socket");
        self.inner.link_lost(generation).await;
    }

    /// Stop reconnecting and close the link
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let generation = self.inner.generation.load(Ordering::SeqCst);
        self.inner.link_lost(generation).await;
        debug!(address = %self.inner.address, "rpc socket closed");
    }
}

/// Resolves once `rx` shows `target`; false if the sender is gone
async fn wait_for_status(rx: &mut watch::Receiver<RpcStatus>, target: RpcStatus) -> bool {
    loop {
        if *rx.borrow_and_update() == target {
            return true;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

impl SocketInner {
    fn set_status(&self, status: RpcStatus) {
        self.status.send_replace(status);
        if status == RpcStatus::Connected {
            self.connected_signal.notify_waiters();
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    async fn supervise(self: Arc<Self>) {
        let mut status = self.status.subscribe();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.establish().await {
                Ok(()) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = wait_for_status(&mut status, RpcStatus::Disconnected) => {
                            debug!(address = %self.address, "rpc link dropped, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "rpc connect to {} failed: {}, retrying in {:?}",
                        self.address,
                        e,
                        self.options.reconnect_delay()
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.reconnect_delay()) => {}
                    }
                }
            }
        }

        self.set_status(RpcStatus::Disconnected);
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        self.set_status(RpcStatus::Connecting);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let stream = match tokio::time::timeout(
            self.options.handshake_timeout(),
            TcpStream::connect(self.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_status(RpcStatus::Disconnected);
                return Err(TransportError::connection_with_source(
                    format!("Failed to connect to {}", self.address),
                    None,
                    e,
                ));
            }
            Err(_) => {
                self.set_status(RpcStatus::Disconnected);
                return Err(TransportError::timeout(
                    format!("connect to {}", self.address),
                    self.options.handshake_timeout_ms,
                ));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %self.address, "failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let link = self.shutdown.child_token();
        *self.link.lock() = link.clone();
        *self.writer.lock().await = Some(FrameWriter::new(write_half));
        self.touch();

        let reader = FrameReader::new(read_half, self.options.max_message_size);
        tokio::spawn(self.clone().read_loop(reader, generation, link.clone()));

        match self.handshake(&link).await {
            Ok(session) => {
                info!(
                    address = %self.address,
                    session_id = %session.session_id,
                    hub = %session.hub,
                    generation,
                    "rpc session established"
                );
                *self.session.lock() = Some(session);
                self.set_status(RpcStatus::Connected);
                Ok(())
            }
            Err(e) => {
                self.link_lost(generation).await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, link: &CancellationToken) -> Result<RpcSession> {
        let message_id = CorrelationId::new();
        self.registry.get_or_create(message_id);
        let request = RpcMessage::SessionRequest(SessionRequest {
            message_id,
            hub: self.options.hub.clone(),
            client_name: self.options.client_name.clone(),
        });

        if let Err(e) = self.send(&request).await {
            self.registry.remove(&message_id);
            return Err(e);
        }

        let timeout = self.options.handshake_timeout();
        match self.registry.wait(&message_id, timeout, link).await {
            WaitOutcome::Completed(Some(RpcMessage::SessionResponse(response))) => {
                if response.accepted {
                    Ok(RpcSession {
                        session_id: response.session_id,
                        hub: response.hub,
                    })
                } else {
                    Err(TransportError::connection(
                        format!(
                            "session rejected by {}: {}",
                            self.address,
                            response.error.unwrap_or_default()
                        ),
                        None,
                    ))
                }
            }
            WaitOutcome::Completed(other) => Err(TransportError::protocol(format!(
                "unexpected handshake reply: {:?}",
                other.map(|m| m.message_type())
            ))),
            WaitOutcome::TimedOut => Err(TransportError::timeout(
                "rpc session handshake",
                timeout.as_millis() as u64,
            )),
            WaitOutcome::Cancelled => Err(TransportError::cancelled("rpc session handshake")),
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader<tokio::net::tcp::OwnedReadHalf>,
        generation: u64,
        link: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = link.cancelled() => break,
                message = reader.read_message() => message,
            };

            match message {
                Ok(Some(message)) => {
                    self.touch();
                    self.dispatch(message).await;
                }
                Ok(None) => {
                    info!(address = %self.address, generation, "rpc server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(address = %self.address, generation, "rpc read failed: {}", e);
                    break;
                }
            }
        }

        self.link_lost(generation).await;
    }

    async fn dispatch(&self, message: RpcMessage) {
        match message {
            RpcMessage::SessionResponse(ref response) => {
                self.registry.complete(response.message_id, Some(message.clone()));
            }
            RpcMessage::Response(ref response) => {
                self.registry.complete(response.message_id, Some(message.clone()));
            }
            RpcMessage::Event(event) => {
                self.notifications.deliver(RpcNotification::Event(event));
            }
            RpcMessage::Push(push) => {
                self.notifications.deliver(RpcNotification::Push(push));
            }
            RpcMessage::Ping => {
                if let Err(e) = self.send(&RpcMessage::Pong).await {
                    debug!(address = %self.address, "failed to answer ping: {}", e);
                }
            }
            RpcMessage::Pong => trace!(address = %self.address, "pong"),
            other => warn!(
                address = %self.address,
                kind = ?other.message_type(),
                "unexpected rpc message from server"
            ),
        }
    }

    /// Tear down link `generation` if it is still the current one
    async fn link_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        self.link.lock().cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!(address = %self.address, "shutdown of rpc stream failed: {}", e);
            }
        }
        self.session.lock().take();

        if *self.status.borrow() != RpcStatus::Disconnected {
            debug!(address = %self.address, generation, "rpc socket disconnected");
            self.set_status(RpcStatus::Disconnected);
        }
    }

    async fn send(&self, message: &RpcMessage) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => {
                writer.write_message(message).await?;
                self.touch();
                Ok(())
            }
            None => Err(TransportError::connection(
                format!("rpc socket to {} is not connected", self.address),
                None,
            )),
        }
    }

    async fn invoke_once(&self, method: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        if *self.status.borrow() != RpcStatus::Connected {
            return Err(TransportError::connection(
                format!("rpc socket to {} is not connected", self.address),
                None,
            ));
        }

        let message_id = CorrelationId::new();
        self.registry.get_or_create(message_id);
        let request = RpcMessage::Request(RpcRequest {
            message_id,
            method: method.to_string(),
            payload,
        });

        if let Err(e) = self.send(&request).await {
            self.registry.remove(&message_id);
            return Err(e);
        }
        debug!(address = %self.address, method, message_id = %message_id, "rpc request sent");

        match self.registry.wait(&message_id, timeout, &self.shutdown).await {
            WaitOutcome::Completed(Some(RpcMessage::Response(response))) => match response.error {
                Some(error) => Err(TransportError::remote(method, error)),
                None => Ok(response.payload),
            },
            WaitOutcome::Completed(Some(other)) => Err(TransportError::protocol(format!(
                "expected a response to {}, got {:?}",
                method,
                other.message_type()
            ))),
            WaitOutcome::Completed(None) => Err(TransportError::empty_body(message_id)),
            WaitOutcome::TimedOut => Err(TransportError::timeout(
                format!("rpc {}", method),
                timeout.as_millis() as u64,
            )),
            WaitOutcome::Cancelled => Err(TransportError::cancelled(format!("rpc {}", method))),
        }
    }

    async fn keepalive(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.keepalive_check());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if *self.status.borrow() != RpcStatus::Connected {
                continue;
            }
            let idle = self.last_activity.lock().elapsed();
            if idle > self.options.keepalive_idle() {
                debug!(address = %self.address, idle_ms = idle.as_millis() as u64, "sending keepalive ping");
                if let Err(e) = self.send(&RpcMessage::Ping).await {
                    warn!(address = %self.address, "keepalive ping failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: CorrelationId) -> RpcNotification {
        RpcNotification::Event(EventMessage {
            message_id: id,
            name: "price".to_string(),
            payload: Vec::new(),
        })
    }

    #[test]
    fn test_repeated_notification_is_dropped() {
        let hub = NotificationHub::new(4);
        let mut rx = hub.subscribe();
        let id = CorrelationId::new();

        assert!(hub.deliver(event(id)));
        assert!(!hub.deliver(event(id)));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_repeat_refreshes_recency() {
        let hub = NotificationHub::new(2);
        let (a, b, c) = (CorrelationId::new(), CorrelationId::new(), CorrelationId::new());

        assert!(hub.deliver(event(a)));
        assert!(hub.deliver(event(b)));
        // Seeing `a` again makes `b` the eviction candidate
        assert!(!hub.deliver(event(a)));
        assert!(hub.deliver(event(c)));

        assert!(!hub.deliver(event(a)));
        assert!(hub.deliver(event(b)));
    }

    #[test]
    fn test_zero_capacity_still_remembers_last_id() {
        let hub = NotificationHub::new(0);
        let id = CorrelationId::new();
        assert!(hub.deliver(event(id)));
        assert!(!hub.deliver(event(id)));
    }
}
