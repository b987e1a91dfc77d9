//! Correlation Registry
//!
//! Maps a correlation id to a waitable slot that the receive path fills in
//! once the reply arrives. Either side may create the slot first: a reply
//! that lands before anybody waits is kept in the slot and picked up by the
//! waiter later, so there is no lost wake-up.
//!
//! Registries are owned by the client or socket that uses them; nothing here
//! is process-global.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of waiting on a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<V> {
    /// The slot was completed; `None` means the completer supplied no body
    Completed(Option<V>),
    TimedOut,
    Cancelled,
}

/// What a `complete` call did to its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    First,
    /// A body was already stored and has been replaced
    Overwrote,
}

#[derive(Debug)]
struct SlotState<V> {
    completed: bool,
    body: Option<V>,
    completions: u32,
}

/// One pending exchange
#[derive(Debug)]
pub struct PendingResponse<V> {
    state: Mutex<SlotState<V>>,
    ready: Notify,
    created_at: Instant,
}

impl<V> PendingResponse<V> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                completed: false,
                body: None,
                completions: 0,
            }),
            ready: Notify::new(),
            created_at: Instant::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn complete(&self, body: Option<V>) -> Completion {
        let previous = {
            let mut state = self.state.lock();
            state.completed = true;
            state.body = body;
            state.completions += 1;
            state.completions - 1
        };
        // notify_one stores a permit when nobody is waiting yet
        self.ready.notify_one();

        if previous == 0 {
            Completion::First
        } else {
            Completion::Overwrote
        }
    }

    fn try_take(&self) -> Option<Option<V>> {
        let mut state = self.state.lock();
        if state.completed {
            Some(state.body.take())
        } else {
            None
        }
    }

    async fn ready(&self) -> Option<V> {
        loop {
            if let Some(body) = self.try_take() {
                return body;
            }
            self.ready.notified().await;
        }
    }
}

/// Concurrent map of pending exchanges
#[derive(Debug)]
pub struct CorrelationRegistry<K, V>
where
    K: Eq + Hash,
{
    slots: DashMap<K, Arc<PendingResponse<V>>>,
}

impl<K, V> Default for CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Return the slot for `id`, creating it if needed
    pub fn get_or_create(&self, id: K) -> Arc<PendingResponse<V>> {
        self.slots
            .entry(id)
            .or_insert_with(|| Arc::new(PendingResponse::new()))
            .clone()
    }

    /// Store `body` for `id` and wake its waiter
    ///
    /// A second completion before the waiter consumed the slot replaces the
    /// first body; it is logged and reported as [`Completion::Overwrote`].
    pub fn complete(&self, id: K, body: Option<V>) -> Completion {
        let slot = self.get_or_create(id.clone());
        let completion = slot.complete(body);
        if completion == Completion::Overwrote {
            warn!(correlation_id = ?id, "duplicate completion, replacing earlier body");
        }
        completion
    }

    /// Wait for `id` to complete, up to `timeout` or until `cancel` fires
    ///
    /// The slot is removed on every outcome, but only if the map still holds
    /// the instance this call waited on.
    pub async fn wait(
        &self,
        id: &K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WaitOutcome<V> {
        let slot = self.get_or_create(id.clone());

        let outcome = tokio::select! {
            biased;
            body = slot.ready() => WaitOutcome::Completed(body),
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
        };

        self.slots.remove_if(id, |_, current| Arc::ptr_eq(current, &slot));

        match &outcome {
            WaitOutcome::Completed(_) => debug!(correlation_id = ?id, "correlation completed"),
            WaitOutcome::TimedOut => {
                debug!(correlation_id = ?id, timeout_ms = timeout.as_millis() as u64, "correlation timed out")
            }
            WaitOutcome::Cancelled => debug!(correlation_id = ?id, "correlation wait cancelled"),
        }
        outcome
    }

    /// Drop the slot for `id`, whatever its state
    pub fn remove(&self, id: &K) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Drop completed slots nobody collected within `max_age`
    ///
    /// Late duplicates of an already consumed reply recreate a slot that no
    /// waiter will ever read; this reclaims them.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| !(slot.is_completed() && slot.age() > max_age));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed, "swept orphaned correlation slots");
        }
        removed
    }

    pub fn contains(&self, id: &K) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
