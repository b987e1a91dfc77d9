//! Resilient queue listener
//!
//! One listener owns one receive route. Deliveries are decoded in the broker
//! callback and handed over an unbounded channel to a dispatcher, which takes
//! a concurrency permit *before* spawning each processing task. A monitor
//! loop, ticking every `monitor_interval`, drives the rest:
//!
//! - reconnects (with fixed-delay retry) when the connection drops
//! - unsubscribes while in-flight work is at the ceiling and resubscribes
//!   once it falls below
//! - after a processing failure, unsubscribes, sleeps `sleep_on_exception`,
//!   then resubscribes
//!
//! Stopping unsubscribes first. Deliveries already handed over are still
//! dispatched and in-flight work drains, together bounded by `drain_timeout`;
//! whatever is left at the deadline is abandoned with a warning. The
//! connection closes last. [`QueueListener::run`] returns only after all of it.

use async_trait::async_trait;
use bytes::Bytes;
use codec::{decode_frame, decode_raw_frame, CorrelationId, FrameVariant};
use network::{
    connect_with_retry, Broker, BrokerConnection, DeliveryHandler, Result, RetryPolicy,
    SubscriptionHandle,
};
use queue_config::{ReceiverOptions, RouteDescriptor};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A decoded delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub route: RouteDescriptor,
    pub correlation_id: CorrelationId,
    /// Reply name carried by raw frames
    pub reply_name: Option<String>,
    pub payload: Bytes,
}

/// Work done for each delivery
///
/// An `Err` (or a panic) pauses the whole listener for `sleep_on_exception`.
#[async_trait]
pub trait MessageProcessor: Send + Sync + 'static {
    async fn process(&self, message: InboundMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Disconnected,
    Connecting,
    Listening,
    /// Unsubscribed because in-flight work reached the ceiling
    Throttled,
    /// Unsubscribed after a processing failure
    Paused,
    Stopping,
    Stopped,
}

#[derive(Debug, Default)]
pub struct ListenerStats {
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped_frames: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStatsSnapshot {
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped_frames: u64,
}

impl ListenerStats {
    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            subscribes: self.subscribes.load(Ordering::Relaxed),
            unsubscribes: self.unsubscribes.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight count when a processing task ends, however it ends
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
    faulted: Arc<AtomicBool>,
    idle: Arc<Notify>,
    finished: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            // Processing task panicked
            self.faulted.store(true, Ordering::SeqCst);
        }
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct QueueListener {
    route: RouteDescriptor,
    options: ReceiverOptions,
    variant: FrameVariant,
    broker: Arc<dyn Broker>,
    processor: Arc<dyn MessageProcessor>,
    status: watch::Sender<ListenerStatus>,
    stats: Arc<ListenerStats>,
    in_flight: Arc<AtomicUsize>,
    faulted: Arc<AtomicBool>,
    idle: Arc<Notify>,
    permits: Arc<Semaphore>,
}

impl QueueListener {
    pub fn new(
        route: RouteDescriptor,
        options: ReceiverOptions,
        variant: FrameVariant,
        broker: Arc<dyn Broker>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let (status, _) = watch::channel(ListenerStatus::Disconnected);
        let ceiling = options.max_simultaneous_messages_per_queue.max(1);
        Self {
            route,
            options,
            variant,
            broker,
            processor,
            status,
            stats: Arc::new(ListenerStats::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            faulted: Arc::new(AtomicBool::new(false)),
            idle: Arc::new(Notify::new()),
            permits: Arc::new(Semaphore::new(ceiling)),
        }
    }

    pub fn route(&self) -> &RouteDescriptor {
        &self.route
    }

    pub fn status(&self) -> ListenerStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    fn ceiling(&self) -> usize {
        self.options.max_simultaneous_messages_per_queue.max(1)
    }

    fn set_status(&self, status: ListenerStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            debug!(route = %self.route, ?previous, ?status, "listener status changed");
        }
    }

    /// Listen until `cancel` fires, then tear down in order
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closing = CancellationToken::new();
        let abandon = CancellationToken::new();
        let _abandon_on_exit = abandon.clone().drop_guard();
        let mut dispatcher =
            tokio::spawn(self.clone().dispatch(rx, closing.clone(), abandon.clone()));

        let mut connection: Option<Arc<dyn BrokerConnection>> = None;
        let mut subscription: Option<SubscriptionHandle> = None;
        let mut ticker = tokio::time::interval(self.options.monitor_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let policy = RetryPolicy::from(&self.options);

        info!(route = %self.route, ceiling = self.ceiling(), "listener starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let healthy = connection.as_ref().filter(|c| c.is_connected()).cloned();
            let active = match healthy {
                Some(c) => c,
                None => {
                    if let Some(lost) = connection.take() {
                        warn!(route = %self.route, "listener connection lost, reconnecting");
                        if let Err(e) = lost.close().await {
                            warn!(
                                route = %self.route,
                                category = e.category(),
                                "error closing lost connection: {}",
                                e
                            );
                        }
                    }
                    subscription = None;
                    self.set_status(ListenerStatus::Connecting);
                    match connect_with_retry(&*self.broker, &self.route, &policy, &cancel).await {
                        Ok(c) => {
                            connection = Some(c.clone());
                            c
                        }
                        // Unbounded retry only ends on cancellation
                        Err(_) => break,
                    }
                }
            };

            if self.faulted.load(Ordering::SeqCst) {
                if let Some(handle) = subscription.take() {
                    self.unsubscribe(&active, &handle).await;
                }
                self.set_status(ListenerStatus::Paused);
                warn!(
                    route = %self.route,
                    pause_ms = self.options.sleep_on_exception_ms,
                    "processing failed, pausing listener"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.sleep_on_exception()) => {}
                }
                self.faulted.store(false, Ordering::SeqCst);
                info!(route = %self.route, "resuming after fault pause");
            }

            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight >= self.ceiling() {
                if let Some(handle) = subscription.take() {
                    info!(route = %self.route, in_flight, "in-flight ceiling reached, throttling");
                    self.unsubscribe(&active, &handle).await;
                }
                self.set_status(ListenerStatus::Throttled);
            } else if subscription.is_none() {
                match self.subscribe(&active, tx.clone()).await {
                    Ok(handle) => {
                        subscription = Some(handle);
                        self.set_status(ListenerStatus::Listening);
                    }
                    Err(e) => {
                        warn!(
                            category = e.category(),
                            "subscribe to {} failed: {}, retrying in {:?}",
                            self.route,
                            e,
                            self.options.connect_retry_delay()
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.options.connect_retry_delay()) => {}
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }

        self.set_status(ListenerStatus::Stopping);
        if let (Some(active), Some(handle)) = (&connection, subscription.take()) {
            self.unsubscribe(active, &handle).await;
        }
        drop(tx);
        closing.cancel();

        let deadline = tokio::time::Instant::now() + self.options.drain_timeout();
        let joined = match tokio::time::timeout_at(deadline, &mut dispatcher).await {
            Ok(joined) => joined,
            Err(_) => {
                abandon.cancel();
                dispatcher.await
            }
        };
        if let Err(e) = joined {
            error!(route = %self.route, "listener dispatcher failed: {}", e);
        }

        self.drain(deadline).await;

        if let Some(active) = connection.take() {
            if let Err(e) = active.close().await {
                warn!(route = %self.route, "error closing listener connection: {}", e);
            }
        }
        self.set_status(ListenerStatus::Stopped);
        info!(route = %self.route, stats = ?self.stats.snapshot(), "listener stopped");
    }

    async fn subscribe(
        &self,
        connection: &Arc<dyn BrokerConnection>,
        tx: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<SubscriptionHandle> {
        let handle = connection
            .subscribe(&self.route.name, self.delivery_handler(tx))
            .await?;
        self.stats.subscribes.fetch_add(1, Ordering::Relaxed);
        debug!(route = %self.route, subscription = %handle, "subscribed");
        Ok(handle)
    }

    async fn unsubscribe(&self, connection: &Arc<dyn BrokerConnection>, handle: &SubscriptionHandle) {
        if let Err(e) = connection.unsubscribe(handle).await {
            warn!(
                route = %self.route,
                subscription = %handle,
                category = e.category(),
                "unsubscribe failed: {}",
                e
            );
        }
        self.stats.unsubscribes.fetch_add(1, Ordering::Relaxed);
        debug!(route = %self.route, subscription = %handle, "unsubscribed");
    }

    fn delivery_handler(&self, tx: mpsc::UnboundedSender<InboundMessage>) -> DeliveryHandler {
        let route = self.route.clone();
        let variant = self.variant;
        let stats = self.stats.clone();

        Arc::new(move |payload: Bytes| {
            stats.received.fetch_add(1, Ordering::Relaxed);

            let decoded = match variant {
                FrameVariant::Typed => {
                    decode_frame(&payload).map(|f| (f.correlation_id, None, f.payload))
                }
                FrameVariant::Raw => decode_raw_frame(&payload).map(|f| {
                    let reply_name = Some(f.reply_name).filter(|n| !n.is_empty());
                    (f.correlation_id, reply_name, f.payload)
                }),
            };

            match decoded {
                Ok((correlation_id, reply_name, payload)) => {
                    let message = InboundMessage {
                        route: route.clone(),
                        correlation_id,
                        reply_name,
                        payload,
                    };
                    if tx.send(message).is_err() {
                        debug!(route = %route, "listener stopped, delivery dropped");
                    }
                }
                Err(e) => {
                    stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %route, bytes = payload.len(), "dropping malformed frame: {}", e);
                }
            }
        })
    }

    /// Hand deliveries to processing tasks, at most `ceiling` at a time
    ///
    /// Runs until `closing` fires and everything queued before it has been
    /// dispatched, or until `abandon` fires.
    async fn dispatch(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<InboundMessage>,
        closing: CancellationToken,
        abandon: CancellationToken,
    ) {
        let mut intake_open = true;
        let mut held = 0usize;

        loop {
            let message = tokio::select! {
                biased;
                _ = abandon.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = closing.cancelled(), if intake_open => {
                    // Queued deliveries are still received; new sends fail
                    rx.close();
                    intake_open = false;
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = abandon.cancelled() => {
                    held = 1;
                    break;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        held = 1;
                        break;
                    }
                },
            };

            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let mut guard = InFlightGuard {
                in_flight: self.in_flight.clone(),
                faulted: self.faulted.clone(),
                idle: self.idle.clone(),
                finished: false,
            };
            let listener = self.clone();

            tokio::spawn(async move {
                let correlation_id = message.correlation_id;
                match listener.processor.process(message).await {
                    Ok(()) => {
                        listener.stats.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        listener.stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            route = %listener.route,
                            correlation_id = %correlation_id,
                            category = e.category(),
                            "message processing failed: {}",
                            e
                        );
                        listener.faulted.store(true, Ordering::SeqCst);
                    }
                }
                guard.finished = true;
                drop(guard);
                drop(permit);
            });
        }

        rx.close();
        let mut abandoned = held;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(
                route = %self.route,
                abandoned,
                timeout_ms = self.options.drain_timeout_ms,
                "drain timed out, accepted deliveries abandoned"
            );
        }
    }

    async fn drain(&self, deadline: tokio::time::Instant) {
        let drained = tokio::time::timeout_at(deadline, async {
            loop {
                let mut notified = pin!(self.idle.notified());
                notified.as_mut().enable();
                if self.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                route = %self.route,
                in_flight = self.in_flight.load(Ordering::SeqCst),
                timeout_ms = self.options.drain_timeout_ms,
                "drain timed out with work still in flight"
            );
        }
    }
}

/// A running listener and the means to stop it
pub struct ListenerHandle {
    listener: Arc<QueueListener>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn spawn(listener: QueueListener) -> Self {
        let listener = Arc::new(listener);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.clone().run(cancel.clone()));
        Self {
            listener,
            cancel,
            task,
        }
    }

    pub fn listener(&self) -> &Arc<QueueListener> {
        &self.listener
    }

    pub fn status(&self) -> ListenerStatus {
        self.listener.status()
    }

    pub fn stats(&self) -> ListenerStatsSnapshot {
        self.listener.stats()
    }

    /// Wait until the listener reports `target`, up to `timeout`
    pub async fn wait_for_status(&self, target: ListenerStatus, timeout: Duration) -> bool {
        let mut status = self.listener.watch_status();
        tokio::time::timeout(timeout, async {
            loop {
                if *status.borrow_and_update() == target {
                    return true;
                }
                if status.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Cancel and wait for teardown to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(route = %self.listener.route, "listener task failed: {}", e);
        }
    }
}
