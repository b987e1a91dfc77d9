//! Redis pub/sub backend
//!
//! Publishes go through one multiplexed connection. Every subscription owns
//! a dedicated pub/sub connection driven by its own task, since a Redis
//! connection in subscribe mode cannot issue other commands.

use super::{Broker, BrokerConnection, DeliveryHandler, SubscriptionHandle};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use queue_config::RouteDescriptor;
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const BACKEND: &str = "redis";

#[derive(Debug, Default, Clone, Copy)]
pub struct RedisBroker;

impl RedisBroker {
    pub fn new() -> Self {
        Self
    }
}

fn redis_error(context: impl std::fmt::Display, e: redis::RedisError) -> TransportError {
    TransportError::message_queue(BACKEND, format!("{}: {}", context, e))
}

#[async_trait]
impl Broker for RedisBroker {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self, route: &RouteDescriptor) -> Result<Arc<dyn BrokerConnection>> {
        let client = redis::Client::open(route.route.as_str())
            .map_err(|e| redis_error(format!("invalid endpoint {}", route.route), e))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| redis_error(format!("failed to connect to {}", route.route), e))?;

        debug!(endpoint = %route.route, "connected to Redis");
        Ok(Arc::new(RedisConnection {
            endpoint: route.route.clone(),
            client,
            publisher,
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            connected: Arc::new(AtomicBool::new(true)),
        }))
    }
}

pub struct RedisConnection {
    endpoint: String,
    client: redis::Client,
    publisher: MultiplexedConnection,
    next_id: AtomicU64,
    subscriptions: DashMap<u64, CancellationToken>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.publisher.clone();
        let result: redis::RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(name)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(redis_error(format!("publish to {} failed", name), e))
            }
        }
    }

    #[allow(deprecated)]
    async fn subscribe(&self, name: &str, handler: DeliveryHandler) -> Result<SubscriptionHandle> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| redis_error("failed to open subscriber connection", e))?;
        let mut pubsub = conn.into_pubsub();
        pubsub
            .subscribe(name)
            .await
            .map_err(|e| redis_error(format!("subscribe to {} failed", name), e))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        self.subscriptions.insert(id, cancel.clone());

        let channel = name.to_string();
        let connected = self.connected.clone();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => match message {
                        Some(message) => handler(Bytes::copy_from_slice(message.get_payload_bytes())),
                        None => {
                            warn!(channel = %channel, "Redis subscription connection closed");
                            connected.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(id, name))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        // Dropping the pub/sub connection ends the server-side subscription
        if let Some((_, cancel)) = self.subscriptions.remove(&handle.id()) {
            cancel.cancel();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        let ids: Vec<u64> = self.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, cancel)) = self.subscriptions.remove(&id) {
                cancel.cancel();
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
