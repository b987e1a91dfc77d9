//! Broker abstraction
//!
//! Every backend reduces to the same capability set: connect to an endpoint,
//! publish bytes to a name, subscribe a callback to a name, unsubscribe, and
//! close. Listener and client logic is written once against these traits.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use queue_config::RouteDescriptor;
use std::fmt;
use std::sync::Arc;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{InMemoryBroker, PublishRecord};

/// Callback invoked for every delivery on a subscription
///
/// Runs on the broker's delivery task, so it must hand work off rather than
/// process inline.
pub type DeliveryHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Opaque token identifying one subscription on one connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    name: String,
}

impl SubscriptionHandle {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Factory for connections to one kind of broker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name used in logs and errors
    fn backend(&self) -> &'static str;

    async fn connect(&self, route: &RouteDescriptor) -> Result<Arc<dyn BrokerConnection>>;
}

/// A live connection to one broker endpoint
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn publish(&self, name: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, name: &str, handler: DeliveryHandler) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Remove an ephemeral queue server-side
    ///
    /// Only brokers that persist per-name state need this.
    async fn delete_queue(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Identity comparison for trait-object connections
pub fn same_connection(a: &Arc<dyn BrokerConnection>, b: &Arc<dyn BrokerConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
