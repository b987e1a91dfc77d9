//! Send-side connection pooling
//!
//! One [`ConnectionPool`] per broker endpoint. Connections are created lazily
//! on first use, handed out through an RAII guard, and returned to the idle
//! list when the guard drops. A semaphore bounds how many are checked out at
//! once; disconnected connections are discarded instead of returned.
//!
//! [`ConnectionPool::state`] reports the endpoint's [`ConnectionState`]:
//! connected while any pooled connection is up, connecting while a connect
//! attempt runs, disconnected otherwise. Reconnecting is left to the next
//! checkout.

use crate::broker::{same_connection, Broker, BrokerConnection};
use crate::connection::{connect_with_retry, ConnectionState, RetryPolicy};
use crate::{Result, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use queue_config::{RouteDescriptor, SenderOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum time to wait for a free connection
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

pub struct ConnectionPool {
    broker: Arc<dyn Broker>,
    endpoint: RouteDescriptor,
    policy: RetryPolicy,
    semaphore: Semaphore,
    idle: Mutex<Vec<Arc<dyn BrokerConnection>>>,
    live: Mutex<Vec<Arc<dyn BrokerConnection>>>,
    connecting: AtomicUsize,
    cancel: CancellationToken,
    max_wait: Duration,
}

/// Counts a connect attempt for as long as it runs
struct ConnectingGuard<'a>(&'a AtomicUsize);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Checked-out connection, returned to the pool on drop
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Arc<dyn BrokerConnection>>,
    _permit: SemaphorePermit<'a>,
}

impl ConnectionPool {
    pub fn new(
        broker: Arc<dyn Broker>,
        endpoint: RouteDescriptor,
        size: usize,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            broker,
            endpoint,
            policy,
            semaphore: Semaphore::new(size.max(1)),
            idle: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            connecting: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint.route
    }

    /// Connections currently open, idle or checked out
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn state(&self) -> ConnectionState {
        if self.live.lock().iter().any(|c| c.is_connected()) {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::SeqCst) > 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Check out a connection, connecting if no idle one is usable
    pub async fn acquire(&self) -> Result<PooledConnection<'_>> {
        let permit = match tokio::time::timeout(self.max_wait, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransportError::resource_exhausted(
                    "connection_pool",
                    format!("pool for {} is closed", self.endpoint.route),
                ))
            }
            Err(_) => {
                return Err(TransportError::resource_exhausted(
                    "connection_pool",
                    format!(
                        "no connection to {} available within {:?}",
                        self.endpoint.route, self.max_wait
                    ),
                ))
            }
        };

        if let Some(connection) = self.take_idle() {
            return Ok(PooledConnection {
                pool: self,
                connection: Some(connection),
                _permit: permit,
            });
        }

        let connection = {
            self.connecting.fetch_add(1, Ordering::SeqCst);
            let _connecting = ConnectingGuard(&self.connecting);
            debug!(endpoint = %self.endpoint.route, "pool connecting");
            connect_with_retry(&*self.broker, &self.endpoint, &self.policy, &self.cancel).await?
        };
        self.live.lock().push(connection.clone());
        debug!(
            endpoint = %self.endpoint.route,
            live = self.live_count(),
            state = ?self.state(),
            "pool opened connection"
        );

        Ok(PooledConnection {
            pool: self,
            connection: Some(connection),
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<Arc<dyn BrokerConnection>> {
        let mut idle = self.idle.lock();
        while let Some(connection) = idle.pop() {
            if connection.is_connected() {
                return Some(connection);
            }
            self.forget(&connection);
        }
        None
    }

    fn forget(&self, connection: &Arc<dyn BrokerConnection>) {
        let remaining = {
            let mut live = self.live.lock();
            live.retain(|c| !same_connection(c, connection));
            live.len()
        };
        if remaining == 0 {
            debug!(endpoint = %self.endpoint.route, state = ?self.state(), "pool has no live connections");
        }
    }

    fn release(&self, connection: Arc<dyn BrokerConnection>) {
        if connection.is_connected() {
            self.idle.lock().push(connection);
        } else {
            debug!(endpoint = %self.endpoint.route, "discarding disconnected pooled connection");
            self.forget(&connection);
        }
    }

    /// Publish `payload` to `name` on a pooled connection
    pub async fn publish(&self, name: &str, payload: Bytes) -> Result<()> {
        let pooled = self.acquire().await?;
        match pooled.publish(name, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !pooled.is_connected() {
                    pooled.invalidate().await;
                }
                Err(e)
            }
        }
    }

    /// Close every connection and refuse further checkouts
    pub async fn close_all(&self) {
        self.cancel.cancel();
        self.semaphore.close();
        self.idle.lock().clear();
        let connections: Vec<_> = self.live.lock().drain(..).collect();
        for connection in connections {
            if let Err(e) = connection.close().await {
                warn!(endpoint = %self.endpoint.route, "error closing pooled connection: {}", e);
            }
        }
    }
}

impl PooledConnection<'_> {
    /// Close this connection and remove it from the pool
    pub async fn invalidate(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.forget(&connection);
            if let Err(e) = connection.close().await {
                debug!(endpoint = %self.pool.endpoint.route, "error closing invalidated connection: {}", e);
            }
        }
    }
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = dyn BrokerConnection;

    fn deref(&self) -> &Self::Target {
        match &self.connection {
            Some(connection) => connection.as_ref(),
            None => unreachable!("pooled connection used after invalidate"),
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Pools for every send endpoint, created on demand
pub struct ProducerCache {
    broker: Arc<dyn Broker>,
    options: SenderOptions,
    pools: DashMap<String, Arc<ConnectionPool>>,
}

impl ProducerCache {
    pub fn new(broker: Arc<dyn Broker>, options: SenderOptions) -> Self {
        Self {
            broker,
            options,
            pools: DashMap::new(),
        }
    }

    pub fn pool_for(&self, route: &RouteDescriptor) -> Arc<ConnectionPool> {
        self.pools
            .entry(route.route.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionPool::new(
                    self.broker.clone(),
                    route.clone(),
                    self.options.pool_size,
                    RetryPolicy::from(&self.options),
                ))
            })
            .clone()
    }

    /// Publish to the route's name on its endpoint
    pub async fn publish(&self, route: &RouteDescriptor, payload: Bytes) -> Result<()> {
        self.pool_for(route).publish(&route.name, payload).await
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub async fn close_all(&self) {
        let pools: Vec<_> = self.pools.iter().map(|p| p.value().clone()).collect();
        self.pools.clear();
        for pool in pools {
            pool.close_all().await;
        }
    }
}
