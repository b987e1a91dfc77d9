//! Network Infrastructure
//!
//! Transport plumbing shared by queue clients and servers:
//!
//! - **broker**: one capability set (publish, subscribe, unsubscribe, close)
//!   over every supported broker, plus an in-process bus
//! - **connection** / **pool**: connect with retry, pooled send connections
//! - **correlation**: matching replies to outstanding requests by id
//! - **rpc**: the session-oriented RPC socket protocol over TCP
//!
//! Every fallible operation returns [`TransportError`].

pub mod broker;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod pool;
pub mod rpc;

// Re-export commonly used types
pub use broker::{Broker, BrokerConnection, DeliveryHandler, InMemoryBroker, SubscriptionHandle};
pub use connection::{connect_with_retry, ConnectionState, RetryPolicy};
pub use correlation::{Completion, CorrelationRegistry, PendingResponse, WaitOutcome};
pub use error::{Result, TransportError};
pub use pool::{ConnectionPool, PooledConnection, ProducerCache};
pub use rpc::{RpcClient, RpcHandler, RpcOptions, RpcServer, RpcSocket, RpcStatus};

#[cfg(feature = "nats")]
pub use broker::nats::NatsBroker;
#[cfg(feature = "redis")]
pub use broker::redis::RedisBroker;

/// Milliseconds since the Unix epoch, zero if the clock is before it
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
