//! In-process broker
//!
//! Pub/sub semantics over a shared in-memory bus, keyed by endpoint and name.
//! Used for single-process deployments and as the test double for every
//! listener and client scenario: connects, subscribes and publishes can be
//! made to fail on demand, and every publish and subscription change is
//! recorded for later inspection.

use super::{Broker, BrokerConnection, DeliveryHandler, SubscriptionHandle};
use crate::{Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use queue_config::RouteDescriptor;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, trace};

const BACKEND: &str = "memory";

type QueueKey = (String, String);

/// One publish attempt as seen by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRecord {
    pub endpoint: String,
    pub name: String,
    pub payload: Bytes,
    /// False when an injected fault rejected the publish
    pub accepted: bool,
}

/// Active subscription count for a name right after it changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub at: Instant,
    pub name: String,
    pub active: usize,
}

struct Subscriber {
    id: u64,
    handler: DeliveryHandler,
}

#[derive(Default)]
struct Faults {
    failing_connects: usize,
    failing_subscribes: usize,
    failing_publish_names: HashSet<String>,
}

struct Bus {
    subscribers: RwLock<HashMap<QueueKey, Vec<Subscriber>>>,
    retained: Mutex<HashMap<QueueKey, VecDeque<Bytes>>>,
    retain_undelivered: bool,
    next_id: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    faults: Mutex<Faults>,
    publish_log: Mutex<Vec<PublishRecord>>,
    subscription_changes: Mutex<Vec<SubscriptionChange>>,
    deleted: Mutex<Vec<String>>,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
}

impl Bus {
    fn active_for(&self, subscribers: &HashMap<QueueKey, Vec<Subscriber>>, name: &str) -> usize {
        subscribers
            .iter()
            .filter(|((_, n), _)| n == name)
            .map(|(_, subs)| subs.len())
            .sum()
    }

    fn record_change(&self, name: &str, active: usize) {
        trace!(name, active, "memory subscription count changed");
        self.subscription_changes.lock().push(SubscriptionChange {
            at: Instant::now(),
            name: name.to_string(),
            active,
        });
    }

    fn remove_subscriber(&self, key: &QueueKey, id: u64) -> bool {
        let (removed, active) = {
            let mut subscribers = self.subscribers.write();
            let removed = match subscribers.get_mut(key) {
                Some(subs) => {
                    let before = subs.len();
                    subs.retain(|s| s.id != id);
                    let removed = subs.len() != before;
                    if subs.is_empty() {
                        subscribers.remove(key);
                    }
                    removed
                }
                None => false,
            };
            (removed, self.active_for(&subscribers, &key.1))
        };
        if removed {
            self.record_change(&key.1, active);
        }
        removed
    }
}

/// Shared in-process bus
#[derive(Clone)]
pub struct InMemoryBroker {
    bus: Arc<Bus>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Fire-and-forget pub/sub: publishes with no subscriber are dropped
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Queue semantics: publishes with no subscriber wait for the next one
    pub fn queueing() -> Self {
        Self::build(true)
    }

    fn build(retain_undelivered: bool) -> Self {
        Self {
            bus: Arc::new(Bus {
                subscribers: RwLock::new(HashMap::new()),
                retained: Mutex::new(HashMap::new()),
                retain_undelivered,
                next_id: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                faults: Mutex::new(Faults::default()),
                publish_log: Mutex::new(Vec::new()),
                subscription_changes: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next_connects(&self, count: usize) {
        self.bus.faults.lock().failing_connects = count;
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_next_subscribes(&self, count: usize) {
        self.bus.faults.lock().failing_subscribes = count;
    }

    /// Reject every publish to `name` until restored
    pub fn fail_publish_to(&self, name: impl Into<String>) {
        self.bus.faults.lock().failing_publish_names.insert(name.into());
    }

    pub fn restore_publish_to(&self, name: &str) {
        self.bus.faults.lock().failing_publish_names.remove(name);
    }

    /// Drop every live connection as if the broker went away
    pub fn disconnect_all(&self) {
        let connections: Vec<_> = self
            .bus
            .connections
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .collect();

        for connection in connections {
            connection.drop_link();
        }
    }

    /// Publish without a connection, as an external producer would
    pub fn inject(&self, endpoint: &str, name: &str, payload: Bytes) {
        deliver(&self.bus, endpoint, name, payload);
    }

    pub fn publish_log(&self) -> Vec<PublishRecord> {
        self.bus.publish_log.lock().clone()
    }

    /// Accepted payloads published to `name` on any endpoint
    pub fn published_to(&self, name: &str) -> Vec<Bytes> {
        self.bus
            .publish_log
            .lock()
            .iter()
            .filter(|r| r.accepted && r.name == name)
            .map(|r| r.payload.clone())
            .collect()
    }

    pub fn subscription_count(&self, name: &str) -> usize {
        let subscribers = self.bus.subscribers.read();
        self.bus.active_for(&subscribers, name)
    }

    /// Active counts for `name`, one entry per change, oldest first
    pub fn subscription_history(&self, name: &str) -> Vec<usize> {
        self.subscription_changes(name)
            .into_iter()
            .map(|c| c.active)
            .collect()
    }

    pub fn subscription_changes(&self, name: &str) -> Vec<SubscriptionChange> {
        self.bus
            .subscription_changes
            .lock()
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.bus.connects.load(Ordering::SeqCst)
    }

    /// Calls to `close` on any connection, including already dropped ones
    pub fn close_count(&self) -> usize {
        self.bus.closes.load(Ordering::SeqCst)
    }

    pub fn deleted_queues(&self) -> Vec<String> {
        self.bus.deleted.lock().clone()
    }
}

fn deliver(bus: &Bus, endpoint: &str, name: &str, payload: Bytes) -> usize {
    let key = (endpoint.to_string(), name.to_string());
    let handlers: Vec<DeliveryHandler> = bus
        .subscribers
        .read()
        .get(&key)
        .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
        .unwrap_or_default();

    if handlers.is_empty() {
        if bus.retain_undelivered {
            bus.retained.lock().entry(key).or_default().push_back(payload);
        } else {
            trace!(endpoint, name, "no subscribers, message dropped");
        }
        return 0;
    }

    for handler in &handlers {
        handler(payload.clone());
    }
    handlers.len()
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self, route: &RouteDescriptor) -> Result<Arc<dyn BrokerConnection>> {
        self.bus.connects.fetch_add(1, Ordering::SeqCst);

        {
            let mut faults = self.bus.faults.lock();
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(TransportError::connection(
                    format!("injected connect failure for {}", route.route),
                    None,
                ));
            }
        }

        let connection = Arc::new(MemoryConnection {
            id: self.bus.next_id.fetch_add(1, Ordering::SeqCst),
            endpoint: route.route.clone(),
            bus: self.bus.clone(),
            connected: AtomicBool::new(true),
            subscriptions: Mutex::new(HashMap::new()),
        });

        {
            let mut connections = self.bus.connections.lock();
            connections.retain(|weak| weak.strong_count() > 0);
            connections.push(Arc::downgrade(&connection));
        }

        debug!(endpoint = %route.route, connection = connection.id, "memory broker connected");
        Ok(connection)
    }
}

/// Connection to the in-process bus
pub struct MemoryConnection {
    id: u64,
    endpoint: String,
    bus: Arc<Bus>,
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<u64, QueueKey>>,
}

impl MemoryConnection {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::connection(
                format!("memory connection {} to {} is closed", self.id, self.endpoint),
                None,
            ))
        }
    }

    fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let subscriptions: Vec<_> = self.subscriptions.lock().drain().collect();
        for (id, key) in subscriptions {
            self.bus.remove_subscriber(&key, id);
        }
        debug!(endpoint = %self.endpoint, connection = self.id, "memory connection dropped");
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        self.ensure_connected()?;

        let rejected = self.bus.faults.lock().failing_publish_names.contains(name);
        self.bus.publish_log.lock().push(PublishRecord {
            endpoint: self.endpoint.clone(),
            name: name.to_string(),
            payload: payload.clone(),
            accepted: !rejected,
        });

        if rejected {
            return Err(TransportError::message_queue(
                BACKEND,
                format!("injected publish failure for {}", name),
            ));
        }

        let receivers = deliver(&self.bus, &self.endpoint, name, payload);
        trace!(endpoint = %self.endpoint, name, receivers, "memory publish");
        Ok(())
    }

    async fn subscribe(&self, name: &str, handler: DeliveryHandler) -> Result<SubscriptionHandle> {
        self.ensure_connected()?;

        {
            let mut faults = self.bus.faults.lock();
            if faults.failing_subscribes > 0 {
                faults.failing_subscribes -= 1;
                return Err(TransportError::message_queue(
                    BACKEND,
                    format!("injected subscribe failure for {}", name),
                ));
            }
        }

        let id = self.bus.next_id.fetch_add(1, Ordering::SeqCst);
        let key = (self.endpoint.clone(), name.to_string());

        let active = {
            let mut subscribers = self.bus.subscribers.write();
            subscribers.entry(key.clone()).or_default().push(Subscriber {
                id,
                handler: handler.clone(),
            });
            self.bus.active_for(&subscribers, name)
        };
        self.subscriptions.lock().insert(id, key.clone());
        self.bus.record_change(name, active);

        let backlog = self.bus.retained.lock().remove(&key).unwrap_or_default();
        if !backlog.is_empty() {
            debug!(name, messages = backlog.len(), "flushing retained messages to new subscriber");
        }
        for payload in backlog {
            handler(payload);
        }

        Ok(SubscriptionHandle::new(id, name))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let key = self.subscriptions.lock().remove(&handle.id());
        match key {
            Some(key) => {
                self.bus.remove_subscriber(&key, handle.id());
            }
            None => debug!(subscription = %handle, "unsubscribe for unknown subscription ignored"),
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.bus
            .retained
            .lock()
            .remove(&(self.endpoint.clone(), name.to_string()));
        self.bus.deleted.lock().push(name.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.bus.closes.fetch_add(1, Ordering::SeqCst);
        if self.connected.load(Ordering::SeqCst) {
            self.drop_link();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let subscriptions: Vec<_> = self.subscriptions.lock().drain().collect();
        for (id, key) in subscriptions {
            self.bus.remove_subscriber(&key, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> (DeliveryHandler, Arc<Mutex<Vec<Bytes>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |payload: Bytes| sink.lock().push(payload));
        (handler, seen)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber_on_same_endpoint_only() {
        let broker = InMemoryBroker::new();
        let a = broker.connect(&RouteDescriptor::new("memory://a", "q")).await.unwrap();
        let b = broker.connect(&RouteDescriptor::new("memory://b", "q")).await.unwrap();

        let (handler, seen) = collector();
        a.subscribe("q", handler).await.unwrap();

        a.publish("q", Bytes::from_static(b"one")).await.unwrap();
        b.publish("q", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(seen.lock().as_slice(), &[Bytes::from_static(b"one")]);
        assert_eq!(broker.publish_log().len(), 2);
    }

    #[tokio::test]
    async fn test_subscription_history_tracks_changes() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect(&RouteDescriptor::new("memory://a", "q")).await.unwrap();

        let (handler, _) = collector();
        let first = conn.subscribe("q", handler.clone()).await.unwrap();
        conn.unsubscribe(&first).await.unwrap();
        conn.subscribe("q", handler).await.unwrap();

        assert_eq!(broker.subscription_history("q"), vec![1, 0, 1]);
        assert_eq!(broker.subscription_count("q"), 1);
    }

    #[tokio::test]
    async fn test_queueing_mode_holds_messages_for_late_subscriber() {
        let broker = InMemoryBroker::queueing();
        let conn = broker.connect(&RouteDescriptor::new("memory://a", "q")).await.unwrap();
        conn.publish("q", Bytes::from_static(b"early")).await.unwrap();

        let (handler, seen) = collector();
        conn.subscribe("q", handler).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let broker = InMemoryBroker::new();
        let route = RouteDescriptor::new("memory://a", "q");

        broker.fail_next_connects(1);
        assert!(broker.connect(&route).await.is_err());
        let conn = broker.connect(&route).await.unwrap();

        broker.fail_publish_to("q");
        assert!(conn.publish("q", Bytes::new()).await.is_err());
        assert!(!broker.publish_log()[0].accepted);
        broker.restore_publish_to("q");
        assert!(conn.publish("q", Bytes::new()).await.is_ok());

        broker.fail_next_subscribes(1);
        let (handler, _) = collector();
        assert!(conn.subscribe("q", handler.clone()).await.is_err());
        assert!(conn.subscribe("q", handler).await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_all_drops_subscriptions() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect(&RouteDescriptor::new("memory://a", "q")).await.unwrap();
        let (handler, _) = collector();
        conn.subscribe("q", handler).await.unwrap();

        broker.disconnect_all();

        assert!(!conn.is_connected());
        assert_eq!(broker.subscription_count("q"), 0);
        assert!(conn.publish("q", Bytes::new()).await.is_err());
    }
}
