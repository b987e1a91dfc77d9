//! Connection establishment with retry
//!
//! Connect attempts repeat with a fixed delay until one succeeds, the attempt
//! limit is reached, or the caller cancels. Cancellation interrupts both the
//! attempt in progress and the delay between attempts.

use crate::broker::{Broker, BrokerConnection};
use crate::{Result, TransportError};
use queue_config::{ReceiverOptions, RouteDescriptor, SenderOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries until cancelled
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            delay,
            max_attempts,
        }
    }

    pub fn forever(delay: Duration) -> Self {
        Self::new(delay, None)
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl From<&SenderOptions> for RetryPolicy {
    fn from(options: &SenderOptions) -> Self {
        Self::new(options.connect_retry_delay(), options.connect_max_attempts)
    }
}

impl From<&ReceiverOptions> for RetryPolicy {
    fn from(options: &ReceiverOptions) -> Self {
        Self::forever(options.connect_retry_delay())
    }
}

/// Connect to `route`, retrying per `policy`
pub async fn connect_with_retry(
    broker: &dyn Broker,
    route: &RouteDescriptor,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Arc<dyn BrokerConnection>> {
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        debug!(endpoint = %route.route, backend = broker.backend(), attempt, "connecting");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::cancelled(format!("connect to {}", route.route))),
            result = broker.connect(route) => result,
        };

        match result {
            Ok(connection) => {
                if attempt > 1 {
                    info!(endpoint = %route.route, attempt, "connected after retrying");
                }
                return Ok(connection);
            }
            Err(e) if policy.allows(attempt) => {
                warn!(
                    category = e.category(),
                    "connection attempt {} to {} failed: {}, retrying in {:?}",
                    attempt, route.route, e, policy.delay
                );
            }
            Err(e) => {
                warn!(
                    category = e.category(),
                    "connection attempt {} to {} failed: {}, giving up",
                    attempt, route.route, e
                );
                return Err(e);
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::cancelled(format!("connect to {}", route.route))),
            _ = tokio::time::sleep(policy.delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    #[tokio::test]
    async fn test_retries_until_connected() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let route = RouteDescriptor::new("memory://a", "q");

        let connection = connect_with_retry(
            &broker,
            &route,
            &RetryPolicy::forever(Duration::from_millis(5)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(connection.is_connected());
        assert_eq!(broker.connect_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(5);
        let route = RouteDescriptor::new("memory://a", "q");

        let result = connect_with_retry(
            &broker,
            &route,
            &RetryPolicy::new(Duration::from_millis(1), Some(2)),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(TransportError::Connection { .. })));
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_delay() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(100);
        let route = RouteDescriptor::new("memory://a", "q");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = connect_with_retry(
            &broker,
            &route,
            &RetryPolicy::forever(Duration::from_secs(30)),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(TransportError::Cancelled { .. })));
    }
}
