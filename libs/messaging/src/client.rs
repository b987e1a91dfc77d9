//! Request path
//!
//! A [`QueueClient`] publishes request frames to every configured send route
//! and awaits the reply through the correlation registry. Replies come back in
//! one of two ways:
//!
//! - **per-correlation** (default): each request gets its own reply name,
//!   `<receive name>_<correlation id>`, subscribed at send time and torn down
//!   once `receive` finishes, whatever the outcome
//! - **single response queue**: one long-lived listener on the receive route
//!   demultiplexes every reply by correlation id

use crate::listener::{InboundMessage, ListenerHandle, ListenerStatus, MessageProcessor, QueueListener};
use crate::message::{RequestMessage, ResponseMessage};
use async_trait::async_trait;
use bytes::Bytes;
use codec::{decode_frame, encode_frame, encode_raw_frame, CorrelationId, FrameVariant, Serializer};
use dashmap::DashMap;
use network::{
    connect_with_retry, unix_millis, Broker, BrokerConnection, CorrelationRegistry,
    DeliveryHandler, ProducerCache, Result, RetryPolicy, SubscriptionHandle, TransportError,
    WaitOutcome,
};
use queue_config::{
    select, ClientOptions, ReceiverOptions, RouteDescriptor, SelectionContext, SenderOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ephemeral reply subscription held between send and receive
struct PendingReply {
    connection: Arc<dyn BrokerConnection>,
    handle: SubscriptionHandle,
}

/// Completes registry slots from the shared response listener
struct ReplyCollector {
    registry: Arc<CorrelationRegistry<CorrelationId, Bytes>>,
}

#[async_trait]
impl MessageProcessor for ReplyCollector {
    async fn process(&self, message: InboundMessage) -> Result<()> {
        let body = Some(message.payload).filter(|p| !p.is_empty());
        self.registry.complete(message.correlation_id, body);
        Ok(())
    }
}

/// Whether a shared response listener has subscribed at least once
///
/// Throttled and paused listeners resume on their own; replies wait in the
/// broker meanwhile.
fn has_started(status: ListenerStatus) -> bool {
    matches!(
        status,
        ListenerStatus::Listening | ListenerStatus::Throttled | ListenerStatus::Paused
    )
}

pub struct QueueClient {
    name: String,
    serializer: Serializer,
    single_response_queue: bool,
    send_routes: Vec<RouteDescriptor>,
    receive_route: Option<RouteDescriptor>,
    sender: Option<SenderOptions>,
    receiver: Option<ReceiverOptions>,
    broker: Arc<dyn Broker>,
    producers: Option<ProducerCache>,
    registry: Arc<CorrelationRegistry<CorrelationId, Bytes>>,
    pending: DashMap<CorrelationId, PendingReply>,
    reply_connections: DashMap<String, Arc<dyn BrokerConnection>>,
    shared_listener: Mutex<Option<ListenerHandle>>,
    shutdown: CancellationToken,
}

impl QueueClient {
    /// Build a client from options, picking the route set that matches `context`
    pub fn new(
        options: ClientOptions,
        broker: Arc<dyn Broker>,
        context: SelectionContext,
    ) -> Result<Self> {
        options
            .validate()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), None))?;
        let serializer = options
            .serializer()
            .map_err(|e| TransportError::configuration(format!("{:#}", e), Some("serializer")))?;

        let routes = select(&options.routes, &context).ok_or_else(|| {
            TransportError::configuration(
                format!(
                    "client '{}' has no route set for environment {:?} machine {:?}",
                    options.name, context.environment, context.machine_name
                ),
                Some("routes"),
            )
        })?;

        let producers = options
            .sender
            .clone()
            .map(|sender| ProducerCache::new(broker.clone(), sender));

        info!(
            client = %options.name,
            send_routes = routes.send.len(),
            receive = ?routes.receive.as_ref().map(|r| r.to_string()),
            single_response_queue = options.single_response_queue,
            "queue client created"
        );

        Ok(Self {
            name: options.name,
            serializer,
            single_response_queue: options.single_response_queue,
            send_routes: routes.send.clone(),
            receive_route: routes.receive.clone(),
            sender: options.sender,
            receiver: options.receiver,
            broker,
            producers,
            registry: Arc::new(CorrelationRegistry::new()),
            pending: DashMap::new(),
            reply_connections: DashMap::new(),
            shared_listener: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Outstanding per-correlation reply subscriptions
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reply route a request with `correlation_id` should carry
    fn reply_route_for(&self, correlation_id: CorrelationId) -> Option<RouteDescriptor> {
        let base = self.receive_route.as_ref()?;
        if self.single_response_queue {
            Some(base.clone())
        } else {
            Some(base.with_name(format!("{}_{}", base.name, correlation_id)))
        }
    }

    fn check_send_preconditions(&self) -> Result<&ProducerCache> {
        if self.send_routes.is_empty() {
            return Err(TransportError::configuration(
                format!("client '{}' has no send routes", self.name),
                Some("routes.send"),
            ));
        }
        self.producers.as_ref().ok_or_else(|| {
            TransportError::configuration(
                format!("client '{}' has no sender options", self.name),
                Some("sender"),
            )
        })
    }

    fn receiver_options(&self) -> Result<&ReceiverOptions> {
        self.receiver.as_ref().ok_or_else(|| {
            TransportError::configuration(
                format!("client '{}' has no receiver options", self.name),
                Some("receiver"),
            )
        })
    }

    /// Publish a typed request; returns the id to pass to [`receive`](Self::receive)
    pub async fn send(&self, request: &RequestMessage) -> Result<CorrelationId> {
        let producers = self.check_send_preconditions()?;
        let correlation_id = CorrelationId::new();

        let mut request = request.clone();
        request.header.client_name = self.name.clone();
        request.header.sent_at_ms = unix_millis();
        if request.header.response_expected && request.header.reply_routes.is_empty() {
            let reply = self.reply_route_for(correlation_id).ok_or_else(|| {
                TransportError::configuration(
                    format!("client '{}' expects a response but has no receive route", self.name),
                    Some("routes.receive"),
                )
            })?;
            request.header.reply_routes.push(reply);
        }

        let envelope = self.serializer.serialize(&request)?;
        let frame = encode_frame(correlation_id, &envelope);

        if request.header.response_expected {
            self.prepare_reply(correlation_id, &request.header.reply_routes[0])
                .await?;
        }
        self.publish_all(producers, correlation_id, frame).await?;
        Ok(correlation_id)
    }

    /// Publish an opaque payload in a raw frame carrying the reply name
    ///
    /// Without a receive route the reply name is empty and no reply is expected.
    pub async fn send_raw(&self, payload: Bytes) -> Result<CorrelationId> {
        let producers = self.check_send_preconditions()?;
        let correlation_id = CorrelationId::new();

        let reply = self.reply_route_for(correlation_id);
        let reply_name = reply.as_ref().map(|r| r.name.as_str()).unwrap_or("");
        let frame = encode_raw_frame(correlation_id, reply_name, &payload);

        if let Some(reply) = &reply {
            self.prepare_reply(correlation_id, reply).await?;
        }
        self.publish_all(producers, correlation_id, frame).await?;
        Ok(correlation_id)
    }

    async fn publish_all(
        &self,
        producers: &ProducerCache,
        correlation_id: CorrelationId,
        frame: Bytes,
    ) -> Result<()> {
        for route in &self.send_routes {
            if let Err(e) = producers.publish(route, frame.clone()).await {
                warn!(
                    client = %self.name,
                    route = %route,
                    correlation_id = %correlation_id,
                    category = e.category(),
                    "request publish failed: {}",
                    e
                );
                self.release_reply(correlation_id).await;
                return Err(e);
            }
            debug!(
                client = %self.name,
                route = %route,
                correlation_id = %correlation_id,
                bytes = frame.len(),
                "request published"
            );
        }
        Ok(())
    }

    /// Make sure a reply to `correlation_id` on `reply` will be caught
    async fn prepare_reply(&self, correlation_id: CorrelationId, reply: &RouteDescriptor) -> Result<()> {
        if self.single_response_queue {
            return self.ensure_shared_listener().await;
        }

        let connection = self.reply_connection(reply).await?;
        let registry = self.registry.clone();
        let name = reply.name.clone();
        let handler: DeliveryHandler = Arc::new(move |payload: Bytes| match decode_frame(&payload) {
            Ok(frame) => {
                let body = Some(frame.payload).filter(|p| !p.is_empty());
                registry.complete(frame.correlation_id, body);
            }
            Err(e) => {
                warn!(reply = %name, bytes = payload.len(), "dropping malformed reply frame: {}", e);
            }
        });

        let handle = connection.subscribe(&reply.name, handler).await?;
        debug!(client = %self.name, reply = %reply, correlation_id = %correlation_id, "reply subscription opened");
        self.pending
            .insert(correlation_id, PendingReply { connection, handle });
        Ok(())
    }

    async fn reply_connection(&self, reply: &RouteDescriptor) -> Result<Arc<dyn BrokerConnection>> {
        if let Some(existing) = self.reply_connections.get(&reply.route) {
            if existing.is_connected() {
                return Ok(existing.clone());
            }
        }

        let policy = match &self.sender {
            Some(sender) => RetryPolicy::from(sender),
            None => RetryPolicy::from(self.receiver_options()?),
        };
        let connection = connect_with_retry(&*self.broker, reply, &policy, &self.shutdown).await?;
        self.reply_connections
            .insert(reply.route.clone(), connection.clone());
        Ok(connection)
    }

    async fn ensure_shared_listener(&self) -> Result<()> {
        let receiver = self.receiver_options()?.clone();
        let route = self.receive_route.clone().ok_or_else(|| {
            TransportError::configuration(
                format!("client '{}' has no receive route", self.name),
                Some("routes.receive"),
            )
        })?;

        let mut status = {
            let mut shared = self.shared_listener.lock().await;
            let handle = shared.get_or_insert_with(|| {
                info!(client = %self.name, route = %route, "starting shared response listener");
                let listener = QueueListener::new(
                    route.clone(),
                    receiver.clone(),
                    FrameVariant::Typed,
                    self.broker.clone(),
                    Arc::new(ReplyCollector {
                        registry: self.registry.clone(),
                    }),
                );
                ListenerHandle::spawn(listener)
            });
            handle.listener().watch_status()
        };

        let started = tokio::time::timeout(receiver.timeout(), async {
            loop {
                let current = *status.borrow_and_update();
                if has_started(current) {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        if started {
            Ok(())
        } else {
            Err(TransportError::timeout(
                "shared response listener start",
                receiver.timeout_ms,
            ))
        }
    }

    /// Tear down the per-correlation reply subscription, if any
    async fn release_reply(&self, correlation_id: CorrelationId) {
        let Some((_, pending)) = self.pending.remove(&correlation_id) else {
            return;
        };
        if let Err(e) = pending.connection.unsubscribe(&pending.handle).await {
            warn!(reply = %pending.handle, "reply unsubscribe failed: {}", e);
        }
        if let Err(e) = pending.connection.delete_queue(pending.handle.name()).await {
            warn!(reply = %pending.handle, "reply queue delete failed: {}", e);
        }
        debug!(client = %self.name, correlation_id = %correlation_id, "reply subscription released");
    }

    /// Wait for the raw reply bytes using the configured receive timeout
    pub async fn receive_raw(&self, correlation_id: CorrelationId) -> Result<Bytes> {
        let timeout = self.receiver_options()?.timeout();
        self.receive_raw_with(correlation_id, timeout, &CancellationToken::new())
            .await
    }

    /// Wait for the raw reply bytes, up to `timeout` or until `cancel` fires
    pub async fn receive_raw_with(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let token = self.shutdown.child_token();
        let outcome = {
            let mut wait = pin!(self.registry.wait(&correlation_id, timeout, &token));
            tokio::select! {
                outcome = &mut wait => outcome,
                _ = cancel.cancelled() => {
                    token.cancel();
                    wait.await
                }
            }
        };

        self.release_reply(correlation_id).await;
        self.registry.sweep(timeout);

        match outcome {
            WaitOutcome::Completed(Some(body)) => Ok(body),
            WaitOutcome::Completed(None) => Err(TransportError::empty_body(correlation_id)),
            WaitOutcome::TimedOut => {
                warn!(client = %self.name, correlation_id = %correlation_id, "response timed out");
                Err(TransportError::timeout(
                    format!("response to {}", correlation_id),
                    timeout.as_millis() as u64,
                ))
            }
            WaitOutcome::Cancelled => Err(TransportError::cancelled(format!(
                "response to {}",
                correlation_id
            ))),
        }
    }

    /// Wait for and decode the typed response envelope
    pub async fn receive(&self, correlation_id: CorrelationId) -> Result<ResponseMessage> {
        let timeout = self.receiver_options()?.timeout();
        self.receive_with(correlation_id, timeout, &CancellationToken::new())
            .await
    }

    pub async fn receive_with(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResponseMessage> {
        let bytes = self
            .receive_raw_with(correlation_id, timeout, cancel)
            .await?;
        let response: ResponseMessage = self.serializer.deserialize(&bytes)?;
        if response.header.client_name != self.name {
            warn!(
                client = %self.name,
                addressed_to = %response.header.client_name,
                correlation_id = %correlation_id,
                "response names a different client"
            );
        }
        if response.body.is_empty() && !response.is_error() {
            return Err(TransportError::empty_body(correlation_id));
        }
        Ok(response)
    }

    /// Send `body`, wait for the reply and decode it
    pub async fn request<T, R>(&self, body: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = RequestMessage::with_body(self.serializer, body)?;
        let correlation_id = self.send(&request).await?;
        let response = self.receive(correlation_id).await?;
        if let Some(error) = response.header.error {
            return Err(TransportError::remote(response.header.server_name, error));
        }
        response.body_as(self.serializer)
    }

    /// Cancel waits, release reply subscriptions and close every connection
    pub async fn close(&self) {
        self.shutdown.cancel();

        if let Some(handle) = self.shared_listener.lock().await.take() {
            handle.stop().await;
        }

        let outstanding: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        for correlation_id in outstanding {
            self.release_reply(correlation_id).await;
        }

        if let Some(producers) = &self.producers {
            producers.close_all().await;
        }

        let connections: Vec<Arc<dyn BrokerConnection>> = self
            .reply_connections
            .iter()
            .map(|e| e.value().clone())
            .collect();
        self.reply_connections.clear();
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(client = %self.name, "error closing reply connection: {}", e);
            }
        }
        info!(client = %self.name, "queue client closed");
    }
}
