//! Server receive and send paths
//!
//! A [`QueueServer`] runs one [`QueueListener`] per receive route and turns
//! each delivery into a request (or, for a response-role server, a response)
//! for its [`RequestHandler`]. Replies go out through a [`ResponseSender`],
//! which fans out to every reply destination with per-destination producers.

use crate::listener::{
    InboundMessage, ListenerHandle, ListenerStatus, MessageProcessor, QueueListener,
};
use crate::message::{RequestMessage, ResponseMessage};
use async_trait::async_trait;
use bytes::Bytes;
use codec::{encode_frame, CorrelationId, FrameVariant, Serializer};
use futures::future::join_all;
use network::{Broker, ProducerCache, Result, TransportError};
use queue_config::{
    select, ReceiverOptions, RouteDescriptor, SelectionContext, ServerOptions, ServerRole,
    ServerRouteSet,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 256;

/// Where and how to answer one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyContext {
    pub correlation_id: CorrelationId,
    pub destinations: Vec<RouteDescriptor>,
    /// Reply-name hint carried by the request (raw frames)
    pub reply_to: Option<String>,
    pub client_name: Option<String>,
    pub response_expected: bool,
}

impl ReplyContext {
    /// A context with nowhere to reply to
    pub fn none(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            destinations: Vec::new(),
            reply_to: None,
            client_name: None,
            response_expected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Typed(RequestMessage),
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    pub route: RouteDescriptor,
    pub context: ReplyContext,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    Typed(ResponseMessage),
    Raw(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerResponse {
    pub route: RouteDescriptor,
    pub correlation_id: CorrelationId,
    pub reply_to: Option<String>,
    pub body: ResponseBody,
}

/// Application logic behind a [`QueueServer`]
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request
    ///
    /// `Ok(None)` answers with an empty body, which the client reports as
    /// [`TransportError::EmptyBody`]. An `Err` pauses the listener.
    async fn on_request(&self, request: &ServerRequest) -> Result<Option<Bytes>>;

    /// Called for every delivery on a response-role server
    async fn on_response(&self, _response: &ServerResponse) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle notifications for the hosting process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    RequestReceived {
        route: String,
        correlation_id: CorrelationId,
    },
    ResponseReceived {
        route: String,
        correlation_id: CorrelationId,
    },
    BeforeSendResponse {
        correlation_id: CorrelationId,
        destinations: Vec<String>,
    },
    ResponseSent {
        correlation_id: CorrelationId,
        bytes: Option<usize>,
        error: Option<String>,
    },
}

/// Name to publish a reply under, given a destination and the request's hint
///
/// No hint keeps the destination name. A hint that already starts with the
/// destination name is used as is; any other hint is appended after `_`.
pub fn reply_name(destination: &str, hint: Option<&str>) -> String {
    match hint {
        None | Some("") => destination.to_string(),
        Some(hint) if hint.starts_with(destination) => hint.to_string(),
        Some(hint) => format!("{}_{}", destination, hint),
    }
}

/// Publishes replies to their destinations
pub struct ResponseSender {
    server_name: String,
    producers: ProducerCache,
}

impl ResponseSender {
    pub fn new(server_name: impl Into<String>, producers: ProducerCache) -> Self {
        Self {
            server_name: server_name.into(),
            producers,
        }
    }

    /// Publish `payload` in a typed frame to every destination in `context`
    ///
    /// Returns `Ok(None)` when there is nowhere to send, otherwise the frame
    /// size. Every destination is attempted; if any failed the result is
    /// [`TransportError::FanoutFailed`].
    pub async fn send(
        &self,
        correlation_id: CorrelationId,
        payload: &[u8],
        context: &ReplyContext,
    ) -> Result<Option<usize>> {
        if context.destinations.is_empty() {
            debug!(correlation_id = %correlation_id, "no reply destinations, nothing sent");
            return Ok(None);
        }

        let frame = encode_frame(correlation_id, payload);
        let mut errors = Vec::new();

        for destination in &context.destinations {
            let target = destination.with_name(reply_name(&destination.name, context.reply_to.as_deref()));
            match self.producers.publish(&target, frame.clone()).await {
                Ok(()) => debug!(
                    server = %self.server_name,
                    destination = %target,
                    correlation_id = %correlation_id,
                    bytes = frame.len(),
                    "response published"
                ),
                Err(e) => {
                    warn!(
                        server = %self.server_name,
                        destination = %target,
                        correlation_id = %correlation_id,
                        category = e.category(),
                        "response publish failed: {}",
                        e
                    );
                    errors.push(format!("{}: {}", target, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(Some(frame.len()))
        } else {
            Err(TransportError::fanout_failed(
                context.destinations.len(),
                errors,
            ))
        }
    }

    pub async fn close(&self) {
        self.producers.close_all().await;
    }
}

/// Shared state behind every listener of one server
struct ServerCore {
    name: String,
    serializer: Serializer,
    role: ServerRole,
    variant: FrameVariant,
    send_routes: Vec<RouteDescriptor>,
    handler: Arc<dyn RequestHandler>,
    responder: Option<Arc<ResponseSender>>,
    events: broadcast::Sender<ServerEvent>,
}

impl ServerCore {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn handle_request(&self, message: InboundMessage) -> Result<()> {
        let request = match self.variant {
            FrameVariant::Typed => {
                let typed: RequestMessage = match self.serializer.deserialize(&message.payload) {
                    Ok(typed) => typed,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            route = %message.route,
                            correlation_id = %message.correlation_id,
                            "dropping undecodable request: {}",
                            e
                        );
                        return Ok(());
                    }
                };
                if let Some(server_name) = &typed.header.server_name {
                    if server_name != &self.name {
                        warn!(
                            server = %self.name,
                            addressed_to = %server_name,
                            correlation_id = %message.correlation_id,
                            "request addressed to a different server"
                        );
                    }
                }
                let response_expected = typed.header.response_expected;
                ServerRequest {
                    route: message.route,
                    context: ReplyContext {
                        correlation_id: message.correlation_id,
                        destinations: if response_expected {
                            typed.header.reply_routes.clone()
                        } else {
                            Vec::new()
                        },
                        reply_to: None,
                        client_name: Some(typed.header.client_name.clone()),
                        response_expected,
                    },
                    body: RequestBody::Typed(typed),
                }
            }
            FrameVariant::Raw => {
                let response_expected = message.reply_name.is_some();
                ServerRequest {
                    route: message.route,
                    context: ReplyContext {
                        correlation_id: message.correlation_id,
                        destinations: if response_expected {
                            self.send_routes.clone()
                        } else {
                            Vec::new()
                        },
                        reply_to: message.reply_name,
                        client_name: None,
                        response_expected,
                    },
                    body: RequestBody::Raw(message.payload),
                }
            }
        };

        self.emit(ServerEvent::RequestReceived {
            route: request.route.to_string(),
            correlation_id: request.context.correlation_id,
        });

        match self.handler.on_request(&request).await {
            Ok(body) => {
                if request.context.response_expected {
                    let body = body.unwrap_or_default();
                    let payload = match &request.body {
                        RequestBody::Typed(_) => self.serializer.serialize(&ResponseMessage::new(
                            &self.name,
                            request.context.client_name.as_deref().unwrap_or_default(),
                            body.to_vec(),
                        ))?,
                        RequestBody::Raw(_) => body,
                    };
                    self.reply(&request.context, &payload).await?;
                }
                Ok(())
            }
            Err(e) => {
                error!(
                    server = %self.name,
                    correlation_id = %request.context.correlation_id,
                    "request handler failed: {}",
                    e
                );
                if request.context.response_expected {
                    if let RequestBody::Typed(_) = &request.body {
                        let failed = ResponseMessage::failed(
                            &self.name,
                            request.context.client_name.as_deref().unwrap_or_default(),
                            e.to_string(),
                        );
                        let payload = self.serializer.serialize(&failed)?;
                        if let Err(send_error) = self.reply(&request.context, &payload).await {
                            warn!(server = %self.name, "failed to send error response: {}", send_error);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn reply(&self, context: &ReplyContext, payload: &[u8]) -> Result<Option<usize>> {
        let responder = self.responder.as_ref().ok_or_else(|| {
            TransportError::configuration(
                format!("server '{}' has no sender options", self.name),
                Some("sender"),
            )
        })?;

        self.emit(ServerEvent::BeforeSendResponse {
            correlation_id: context.correlation_id,
            destinations: context.destinations.iter().map(|d| d.to_string()).collect(),
        });

        let result = responder
            .send(context.correlation_id, payload, context)
            .await;

        self.emit(ServerEvent::ResponseSent {
            correlation_id: context.correlation_id,
            bytes: result.as_ref().ok().copied().flatten(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    async fn handle_response(&self, message: InboundMessage) -> Result<()> {
        let body = match self.variant {
            FrameVariant::Typed => {
                let typed: ResponseMessage = match self.serializer.deserialize(&message.payload) {
                    Ok(typed) => typed,
                    Err(e) => {
                        warn!(
                            server = %self.name,
                            route = %message.route,
                            correlation_id = %message.correlation_id,
                            "dropping undecodable response: {}",
                            e
                        );
                        return Ok(());
                    }
                };
                if typed.header.client_name != self.name {
                    warn!(
                        server = %self.name,
                        addressed_to = %typed.header.client_name,
                        correlation_id = %message.correlation_id,
                        "response addressed to a different client"
                    );
                }
                ResponseBody::Typed(typed)
            }
            FrameVariant::Raw => ResponseBody::Raw(message.payload),
        };

        let response = ServerResponse {
            route: message.route,
            correlation_id: message.correlation_id,
            reply_to: message.reply_name,
            body,
        };
        self.emit(ServerEvent::ResponseReceived {
            route: response.route.to_string(),
            correlation_id: response.correlation_id,
        });
        self.handler.on_response(&response).await
    }
}

#[async_trait]
impl MessageProcessor for ServerCore {
    async fn process(&self, message: InboundMessage) -> Result<()> {
        match self.role {
            ServerRole::Request => self.handle_request(message).await,
            ServerRole::Response => self.handle_response(message).await,
        }
    }
}

pub struct QueueServer {
    core: Arc<ServerCore>,
    broker: Arc<dyn Broker>,
    routes: ServerRouteSet,
    receiver: Option<ReceiverOptions>,
    listeners: Mutex<Vec<ListenerHandle>>,
}

impl QueueServer {
    pub fn new(
        options: ServerOptions,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn RequestHandler>,
        context: SelectionContext,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;
        let serializer = options
            .serializer()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), Some("serializer")))?;

        let routes = select(&options.routes, &context)
            .cloned()
            .ok_or_else(|| {
                TransportError::configuration(
                    format!(
                        "server '{}' has no route set for environment {:?} machine {:?}",
                        options.name, context.environment, context.machine_name
                    ),
                    Some("routes"),
                )
            })?;

        let responder = options.sender.clone().map(|sender| {
            Arc::new(ResponseSender::new(
                options.name.clone(),
                ProducerCache::new(broker.clone(), sender),
            ))
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let core = Arc::new(ServerCore {
            name: options.name.clone(),
            serializer,
            role: options.role,
            variant: options.variant,
            send_routes: routes.send.clone(),
            handler,
            responder,
            events,
        });

        Ok(Self {
            core,
            broker,
            routes,
            receiver: options.receiver,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.core.events.subscribe()
    }

    pub fn response_sender(&self) -> Option<Arc<ResponseSender>> {
        self.core.responder.clone()
    }

    /// Start one listener per receive route; a no-op when already running
    pub async fn start_listeners(&self) -> Result<()> {
        let receiver = self.receiver.clone().ok_or_else(|| {
            TransportError::configuration(
                format!("server '{}' has no receiver options", self.core.name),
                Some("receiver"),
            )
        })?;
        if self.routes.receive.is_empty() {
            return Err(TransportError::configuration(
                format!("server '{}' has no receive routes", self.core.name),
                Some("routes.receive"),
            ));
        }
        if self.core.role == ServerRole::Request && self.core.responder.is_none() {
            return Err(TransportError::configuration(
                format!("server '{}' has no sender options", self.core.name),
                Some("sender"),
            ));
        }

        let mut listeners = self.listeners.lock().await;
        if !listeners.is_empty() {
            return Ok(());
        }
        for route in &self.routes.receive {
            let listener = QueueListener::new(
                route.clone(),
                receiver.clone(),
                self.core.variant,
                self.broker.clone(),
                self.core.clone(),
            );
            listeners.push(ListenerHandle::spawn(listener));
        }
        info!(
            server = %self.core.name,
            role = ?self.core.role,
            listeners = listeners.len(),
            "listeners started"
        );
        Ok(())
    }

    /// Stop every listener and wait for each to tear down
    pub async fn stop_listeners(&self) {
        let handles: Vec<ListenerHandle> = self.listeners.lock().await.drain(..).collect();
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        join_all(handles.into_iter().map(|handle| handle.stop())).await;
        info!(server = %self.core.name, listeners = count, "listeners stopped");
    }

    pub async fn listener_statuses(&self) -> Vec<(String, ListenerStatus)> {
        self.listeners
            .lock()
            .await
            .iter()
            .map(|handle| (handle.listener().route().to_string(), handle.status()))
            .collect()
    }

    /// Wait until every listener is subscribed
    pub async fn wait_listening(&self, timeout: std::time::Duration) -> bool {
        let listeners = self.listeners.lock().await;
        let waits = listeners
            .iter()
            .map(|handle| handle.wait_for_status(ListenerStatus::Listening, timeout));
        join_all(waits).await.into_iter().all(|ok| ok)
    }

    pub async fn close(&self) {
        self.stop_listeners().await;
        if let Some(responder) = &self.core.responder {
            responder.close().await;
        }
    }
}
