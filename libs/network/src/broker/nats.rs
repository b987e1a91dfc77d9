//! NATS backend
//!
//! Names map directly onto subjects. A `queue_group` route parameter turns
//! subscriptions into queue subscriptions so several listeners share load.

use super::{Broker, BrokerConnection, DeliveryHandler, SubscriptionHandle};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use queue_config::RouteDescriptor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKEND: &str = "nats";
const QUEUE_GROUP_PARAMETER: &str = "queue_group";

#[derive(Debug, Default, Clone, Copy)]
pub struct NatsBroker;

impl NatsBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self, route: &RouteDescriptor) -> Result<Arc<dyn BrokerConnection>> {
        let client = async_nats::connect(route.route.as_str()).await.map_err(|e| {
            TransportError::message_queue(
                BACKEND,
                format!("failed to connect to {}: {}", route.route, e),
            )
        })?;

        debug!(endpoint = %route.route, "connected to NATS");
        Ok(Arc::new(NatsConnection {
            endpoint: route.route.clone(),
            queue_group: route.parameter(QUEUE_GROUP_PARAMETER).map(str::to_string),
            client,
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct NatsConnection {
    endpoint: String,
    queue_group: Option<String>,
    client: async_nats::Client,
    next_id: AtomicU64,
    subscriptions: DashMap<u64, CancellationToken>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for NatsConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(name.to_string(), payload)
            .await
            .map_err(|e| {
                TransportError::message_queue(BACKEND, format!("publish to {} failed: {}", name, e))
            })
    }

    async fn subscribe(&self, name: &str, handler: DeliveryHandler) -> Result<SubscriptionHandle> {
        let subscribed = match &self.queue_group {
            Some(group) => {
                self.client
                    .queue_subscribe(name.to_string(), group.clone())
                    .await
            }
            None => self.client.subscribe(name.to_string()).await,
        };
        let mut subscriber = subscribed.map_err(|e| {
            TransportError::message_queue(BACKEND, format!("subscribe to {} failed: {}", name, e))
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.subscriptions.insert(id, cancel.clone());

        let subject = name.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = subscriber.unsubscribe().await {
                            warn!(subject = %subject, "NATS unsubscribe failed: {}", e);
                        }
                        break;
                    }
                    message = subscriber.next() => match message {
                        Some(message) => handler(message.payload),
                        None => {
                            debug!(subject = %subject, "NATS subscription stream ended");
                            break;
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(id, name))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        if let Some((_, cancel)) = self.subscriptions.remove(&handle.id()) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, cancel)) = self.subscriptions.remove(&id) {
                cancel.cancel();
            }
        }
        self.client.flush().await.map_err(|e| {
            TransportError::message_queue(BACKEND, format!("flush on close failed: {}", e))
        })
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.client.connection_state() == async_nats::connection::State::Connected
    }
}
