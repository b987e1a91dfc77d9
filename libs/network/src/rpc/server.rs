//! Accepting side of the RPC socket protocol
//!
//! Every connection must open with a `SessionRequest` naming this server's
//! hub (compared case-insensitively). Accepted connections get a fresh
//! session id; requests are handed to the [`RpcHandler`] on their own task
//! so a slow call never blocks pings or other requests on the same session.

use super::io::{FrameReader, FrameWriter};
use super::RpcOptions;
use crate::{Result, TransportError};
use async_trait::async_trait;
use codec::{
    CorrelationId, EventMessage, PushMessage, RpcMessage, RpcRequest, RpcResponse,
    SessionResponse,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Who is calling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: CorrelationId,
    pub client_name: String,
    pub peer: SocketAddr,
}

/// Application logic behind an [`RpcServer`]
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle one call; an `Err` is sent back as the response's error text
    async fn handle(
        &self,
        session: &SessionInfo,
        method: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, String>;
}

type SharedWriter = Arc<Mutex<FrameWriter<OwnedWriteHalf>>>;

struct SessionEntry {
    info: SessionInfo,
    writer: SharedWriter,
}

struct ServerInner {
    hub: String,
    options: RpcOptions,
    handler: Arc<dyn RpcHandler>,
    sessions: DashMap<CorrelationId, SessionEntry>,
    sessions_opened: AtomicU64,
    requests_received: AtomicU64,
    pings_received: AtomicU64,
    shutdown: CancellationToken,
}

pub struct RpcServer {
    inner: Arc<ServerInner>,
    local_addr: SocketAddr,
}

impl RpcServer {
    /// Bind to `addr` and start accepting; `options.hub` names this server
    pub async fn bind(
        addr: impl ToSocketAddrs,
        options: RpcOptions,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::network_with_source("Failed to bind rpc listener", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::network_with_source("Failed to read local address", e))?;

        let inner = Arc::new(ServerInner {
            hub: options.hub.clone(),
            options,
            handler,
            sessions: DashMap::new(),
            sessions_opened: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            pings_received: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(inner.clone().accept_loop(listener));
        info!(address = %local_addr, hub = %inner.hub, "rpc server listening");

        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sessions currently open
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Sessions accepted since start, including closed ones
    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn requests_received(&self) -> u64 {
        self.inner.requests_received.load(Ordering::SeqCst)
    }

    /// Keepalive pings answered, over all sessions
    pub fn pings_received(&self) -> u64 {
        self.inner.pings_received.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub async fn push_event(
        &self,
        session_id: CorrelationId,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let message = RpcMessage::Event(EventMessage {
            message_id: CorrelationId::new(),
            name: name.to_string(),
            payload,
        });
        self.inner.send_to(session_id, &message).await
    }

    /// Send one event to every session; returns how many took it
    pub async fn broadcast_event(&self, name: &str, payload: Vec<u8>) -> usize {
        let message = RpcMessage::Event(EventMessage {
            message_id: CorrelationId::new(),
            name: name.to_string(),
            payload,
        });
        self.inner.broadcast(&message).await
    }

    pub async fn push(&self, session_id: CorrelationId, payload: Vec<u8>) -> Result<()> {
        let message = RpcMessage::Push(PushMessage {
            message_id: CorrelationId::new(),
            payload,
        });
        self.inner.send_to(session_id, &message).await
    }

    pub async fn broadcast_push(&self, payload: Vec<u8>) -> usize {
        let message = RpcMessage::Push(PushMessage {
            message_id: CorrelationId::new(),
            payload,
        });
        self.inner.broadcast(&message).await
    }

    /// Stop accepting and close every session
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let writers: Vec<SharedWriter> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.writer.clone())
            .collect();
        self.inner.sessions.clear();
        for writer in writers {
            let _ = writer.lock().await.shutdown().await;
        }
        info!(address = %self.local_addr, "rpc server stopped");
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "rpc connection accepted");
                    tokio::spawn(self.clone().serve_connection(stream, peer));
                }
                Err(e) => {
                    error!("rpc accept failed: {}", e);
                }
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, "failed to set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, self.options.max_message_size);
        let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(write_half)));

        let session = match self.open_session(&mut reader, &writer, peer).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(peer = %peer, "rpc handshake failed: {}", e);
                return;
            }
        };

        let session_cancel = self.shutdown.child_token();
        self.read_requests(reader, &writer, &session, &session_cancel)
            .await;

        session_cancel.cancel();
        self.sessions.remove(&session.session_id);
        info!(peer = %peer, session_id = %session.session_id, "rpc session closed");
    }

    async fn open_session(
        &self,
        reader: &mut FrameReader<OwnedReadHalf>,
        writer: &SharedWriter,
        peer: SocketAddr,
    ) -> Result<Option<SessionInfo>> {
        let first = tokio::time::timeout(self.options.handshake_timeout(), reader.read_message())
            .await
            .map_err(|_| {
                TransportError::timeout("rpc session handshake", self.options.handshake_timeout_ms)
            })??;

        let request = match first {
            Some(RpcMessage::SessionRequest(request)) => request,
            Some(other) => {
                return Err(TransportError::protocol(format!(
                    "expected a session request, got {:?}",
                    other.message_type()
                )))
            }
            None => return Ok(None),
        };

        if !request.hub.eq_ignore_ascii_case(&self.hub) {
            warn!(peer = %peer, requested = %request.hub, hub = %self.hub, "rejecting session for unknown hub");
            let rejection = RpcMessage::SessionResponse(SessionResponse {
                message_id: request.message_id,
                session_id: CorrelationId::nil(),
                hub: self.hub.clone(),
                accepted: false,
                error: Some(format!("unknown hub '{}'", request.hub)),
            });
            writer.lock().await.write_message(&rejection).await?;
            return Ok(None);
        }

        let info = SessionInfo {
            session_id: CorrelationId::new(),
            client_name: request.client_name,
            peer,
        };
        let response = RpcMessage::SessionResponse(SessionResponse {
            message_id: request.message_id,
            session_id: info.session_id,
            hub: self.hub.clone(),
            accepted: true,
            error: None,
        });
        writer.lock().await.write_message(&response).await?;

        self.sessions.insert(
            info.session_id,
            SessionEntry {
                info: info.clone(),
                writer: writer.clone(),
            },
        );
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        info!(
            peer = %peer,
            session_id = %info.session_id,
            client = %info.client_name,
            "rpc session opened"
        );
        Ok(Some(info))
    }

    async fn read_requests(
        self: &Arc<Self>,
        mut reader: FrameReader<OwnedReadHalf>,
        writer: &SharedWriter,
        session: &SessionInfo,
        cancel: &CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = reader.read_message() => message,
            };

            match message {
                Ok(Some(RpcMessage::Request(request))) => {
                    self.requests_received.fetch_add(1, Ordering::SeqCst);
                    let server = self.clone();
                    let writer = writer.clone();
                    let session = session.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = server.answer(request, &writer, &session) => {}
                        }
                    });
                }
                Ok(Some(RpcMessage::Ping)) => {
                    self.pings_received.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = writer.lock().await.write_message(&RpcMessage::Pong).await {
                        debug!(session_id = %session.session_id, "failed to answer ping: {}", e);
                        break;
                    }
                }
                Ok(Some(RpcMessage::Pong)) => {}
                Ok(Some(other)) => warn!(
                    session_id = %session.session_id,
                    kind = ?other.message_type(),
                    "unexpected rpc message from client"
                ),
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id = %session.session_id, "rpc read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn answer(&self, request: RpcRequest, writer: &SharedWriter, session: &SessionInfo) {
        debug!(session_id = %session.session_id, method = %request.method, "rpc request received");
        let outcome = self
            .handler
            .handle(session, &request.method, request.payload)
            .await;

        let response = match outcome {
            Ok(payload) => RpcResponse {
                message_id: request.message_id,
                payload,
                error: None,
            },
            Err(message) => {
                warn!(method = %request.method, "rpc handler failed: {}", message);
                RpcResponse {
                    message_id: request.message_id,
                    payload: Vec::new(),
                    error: Some(message),
                }
            }
        };

        if let Err(e) = writer
            .lock()
            .await
            .write_message(&RpcMessage::Response(response))
            .await
        {
            warn!(session_id = %session.session_id, "failed to send rpc response: {}", e);
        }
    }

    async fn send_to(&self, session_id: CorrelationId, message: &RpcMessage) -> Result<()> {
        let writer = self
            .sessions
            .get(&session_id)
            .map(|entry| entry.writer.clone())
            .ok_or_else(|| {
                TransportError::connection(format!("no rpc session {}", session_id), None)
            })?;
        let result = writer.lock().await.write_message(message).await;
        result
    }

    async fn broadcast(&self, message: &RpcMessage) -> usize {
        let writers: Vec<(CorrelationId, SharedWriter)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.writer.clone()))
            .collect();

        let mut delivered = 0;
        for (session_id, writer) in writers {
            let result = writer.lock().await.write_message(message).await;
            match result {
                Ok(()) => delivered += 1,
                Err(e) => warn!(session_id = %session_id, "rpc broadcast failed: {}", e),
            }
        }
        delivered
    }
}
