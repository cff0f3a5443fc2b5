//! Connection pool and request queue.
//!
//! One reqwest client per provider, keep-alive on, sockets capped at the
//! provider's configured maximum. Admission to a provider goes through a
//! bounded priority queue: three levels, FIFO within a level, released
//! slots always wake the most important waiter first. A global in-flight
//! cap sits above the per-provider caps; overflow of either bound is an
//! immediate capacity rejection, never an unbounded wait list.

use dashmap::DashMap;
use reqwest::Client;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::AdapterError;

/// Why admission failed.
#[derive(Debug)]
pub enum AdmitError {
    /// The waiting room is full; the gateway maps this to a 503 with a
    /// retry hint rather than retrying another candidate.
    AtCapacity,
    /// The caller went away while queued.
    Cancelled,
}

impl From<AdmitError> for AdapterError {
    fn from(err: AdmitError) -> Self {
        match err {
            AdmitError::AtCapacity => AdapterError::transient("request queue at capacity"),
            AdmitError::Cancelled => AdapterError::Cancelled,
        }
    }
}

/// Queue priority; lower is more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    fn index(self) -> usize {
        self as usize
    }
}

/// Shared HTTP clients, one per provider id.
pub struct ConnectionPool {
    clients: DashMap<String, Client>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
        }
    }

    /// Client for a provider, built on first use. `max_sockets` bounds the
    /// keep-alive pool per host.
    pub fn client_for(
        &self,
        provider_id: &str,
        max_sockets: usize,
    ) -> Result<Client, AdapterError> {
        if let Some(client) = self.clients.get(provider_id) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(max_sockets)
            .pool_idle_timeout(self.idle_timeout)
            .build()
            .map_err(|e| AdapterError::config(format!("failed to build HTTP client: {e}")))?;
        self.clients
            .insert(provider_id.to_string(), client.clone());
        Ok(client)
    }

    /// Drop a provider's client so the next request rebuilds it from
    /// fresh config.
    pub fn evict(&self, provider_id: &str) {
        self.clients.remove(provider_id);
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    /// Concurrent in-flight requests per provider.
    pub per_provider_concurrency: usize,
    /// Queued waiters per provider before rejection.
    pub per_provider_pending: usize,
    /// Concurrent in-flight requests across all providers.
    pub global_concurrency: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            per_provider_concurrency: 16,
            per_provider_pending: 64,
            global_concurrency: 256,
        }
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    /// Receiving on this transfers the active slot to the waiter.
    slot: oneshot::Sender<()>,
}

#[derive(Default, Debug)]
struct QueueState {
    active: usize,
    next_waiter_id: u64,
    pending: [VecDeque<Waiter>; 3],
}

impl QueueState {
    fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }
}

#[derive(Debug)]
struct SlotGate {
    concurrency: usize,
    max_pending: usize,
    state: Mutex<QueueState>,
}

enum SlotOutcome {
    /// Slot acquired immediately.
    Acquired,
    /// Queued; the receiver resolves when a slot is handed over.
    Queued(u64, oneshot::Receiver<()>),
}

impl SlotGate {
    fn new(concurrency: usize, max_pending: usize) -> Self {
        Self {
            concurrency,
            max_pending,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn try_enter(&self, priority: Priority) -> Result<SlotOutcome, AdmitError> {
        let mut guard = self.state.lock().expect("queue lock poisoned");
        if guard.active < self.concurrency {
            guard.active += 1;
            return Ok(SlotOutcome::Acquired);
        }
        if guard.pending_len() >= self.max_pending {
            return Err(AdmitError::AtCapacity);
        }
        let id = guard.next_waiter_id;
        guard.next_waiter_id += 1;
        let (tx, rx) = oneshot::channel();
        guard.pending[priority.index()].push_back(Waiter { id, slot: tx });
        Ok(SlotOutcome::Queued(id, rx))
    }

    /// Give an active slot back, handing it to the most important live
    /// waiter if there is one.
    fn release(&self) {
        let mut guard = self.state.lock().expect("queue lock poisoned");
        loop {
            let waiter = guard.pending.iter_mut().find_map(VecDeque::pop_front);
            match waiter {
                // The send happens under the lock, so a cancelling waiter
                // that re-acquires the lock observes a settled channel.
                Some(waiter) => match waiter.slot.send(()) {
                    Ok(()) => return, // slot transferred, `active` unchanged
                    Err(()) => continue, // waiter gave up; try the next one
                },
                None => {
                    guard.active = guard.active.saturating_sub(1);
                    return;
                }
            }
        }
    }

    /// Wait for a handed-over slot or cancellation.
    async fn wait(
        &self,
        priority: Priority,
        id: u64,
        mut rx: oneshot::Receiver<()>,
        cancel: &CancellationToken,
    ) -> Result<(), AdmitError> {
        tokio::select! {
            handed = &mut rx => {
                match handed {
                    Ok(()) => Ok(()),
                    // The gate never drops senders without sending.
                    Err(_) => Err(AdmitError::AtCapacity),
                }
            }
            _ = cancel.cancelled() => {
                // Withdraw under the lock; if we are no longer queued, a
                // hand-off raced us and the slot must be released.
                let withdrawn = {
                    let mut guard = self.state.lock().expect("queue lock poisoned");
                    let level = &mut guard.pending[priority.index()];
                    match level.iter().position(|w| w.id == id) {
                        Some(pos) => {
                            level.remove(pos);
                            true
                        }
                        None => false,
                    }
                };
                if !withdrawn && rx.try_recv().is_ok() {
                    self.release();
                }
                Err(AdmitError::Cancelled)
            }
        }
    }

    async fn acquire(
        &self,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<(), AdmitError> {
        match self.try_enter(priority)? {
            SlotOutcome::Acquired => Ok(()),
            SlotOutcome::Queued(id, rx) => self.wait(priority, id, rx, cancel).await,
        }
    }

    fn depth(&self) -> usize {
        let guard = self.state.lock().expect("queue lock poisoned");
        guard.active + guard.pending_len()
    }
}

/// Per-provider admission gates plus a global in-flight gate.
#[derive(Debug)]
pub struct RequestQueue {
    limits: QueueLimits,
    gates: DashMap<String, Arc<SlotGate>>,
    global: SlotGate,
}

/// Releases its provider slot and the global slot on drop.
#[derive(Debug)]
pub struct QueuePermit {
    gate: Arc<SlotGate>,
    queue: Arc<RequestQueue>,
}

impl RequestQueue {
    pub fn new(limits: QueueLimits) -> Arc<Self> {
        Arc::new(Self {
            limits,
            gates: DashMap::new(),
            // The global gate has no waiting room of its own; saturation
            // there is already an overload signal.
            global: SlotGate::new(limits.global_concurrency, 0),
        })
    }

    /// Admit one request against a provider. Holds both a global and a
    /// per-provider slot until the returned permit is dropped.
    pub async fn admit(
        self: &Arc<Self>,
        provider_id: &str,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<QueuePermit, AdmitError> {
        self.global.acquire(priority, cancel).await?;

        let gate = self
            .gates
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(SlotGate::new(
                    self.limits.per_provider_concurrency,
                    self.limits.per_provider_pending,
                ))
            })
            .value()
            .clone();

        match gate.acquire(priority, cancel).await {
            Ok(()) => Ok(QueuePermit {
                gate,
                queue: Arc::clone(self),
            }),
            Err(e) => {
                self.global.release();
                Err(e)
            }
        }
    }

    /// In-flight plus queued work for one provider, consumed by
    /// resolution ordering.
    pub fn depth(&self, provider_id: &str) -> usize {
        self.gates.get(provider_id).map(|g| g.depth()).unwrap_or(0)
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        self.gate.release();
        self.queue.global.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(concurrency: usize, pending: usize) -> QueueLimits {
        QueueLimits {
            per_provider_concurrency: concurrency,
            per_provider_pending: pending,
            global_concurrency: 64,
        }
    }

    #[tokio::test]
    async fn admits_up_to_concurrency() {
        let queue = RequestQueue::new(limits(2, 4));
        let cancel = CancellationToken::new();
        let _a = queue.admit("p", Priority::Normal, &cancel).await.unwrap();
        let _b = queue.admit("p", Priority::Normal, &cancel).await.unwrap();
        assert_eq!(queue.depth("p"), 2);
    }

    #[tokio::test]
    async fn overflow_is_rejected_immediately() {
        let queue = RequestQueue::new(limits(1, 0));
        let cancel = CancellationToken::new();
        let _held = queue.admit("p", Priority::Normal, &cancel).await.unwrap();
        let err = queue.admit("p", Priority::Normal, &cancel).await.unwrap_err();
        assert!(matches!(err, AdmitError::AtCapacity));
    }

    #[tokio::test]
    async fn released_slot_admits_a_waiter() {
        let queue = RequestQueue::new(limits(1, 4));
        let cancel = CancellationToken::new();
        let held = queue.admit("p", Priority::Normal, &cancel).await.unwrap();

        let queue2 = Arc::clone(&queue);
        let cancel2 = cancel.clone();
        let waiter =
            tokio::spawn(async move { queue2.admit("p", Priority::Normal, &cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let permit = waiter.await.unwrap();
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn higher_priority_waiter_wakes_first() {
        let queue = RequestQueue::new(limits(1, 4));
        let cancel = CancellationToken::new();
        let held = queue.admit("p", Priority::Normal, &cancel).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let spawn_waiter = |priority: Priority, tag: &'static str| {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let permit = queue.admit("p", priority, &cancel).await.unwrap();
                order.lock().unwrap().push(tag);
                permit
            })
        };

        let low = spawn_waiter(Priority::Low, "low");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let high = spawn_waiter(Priority::High, "high");
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        let high_permit = high.await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &["high"]);

        drop(high_permit);
        low.await.unwrap();
        assert_eq!(order.lock().unwrap().as_slice(), &["high", "low"]);
    }

    #[tokio::test]
    async fn cancelled_waiter_fails_fast_and_leaks_nothing() {
        let queue = RequestQueue::new(limits(1, 4));
        let cancel = CancellationToken::new();
        let held = queue.admit("p", Priority::Normal, &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let queue2 = Arc::clone(&queue);
        let waiter_cancel2 = waiter_cancel.clone();
        let waiter =
            tokio::spawn(async move { queue2.admit("p", Priority::Normal, &waiter_cancel2).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter_cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, AdmitError::Cancelled));

        // The held slot is still usable and releasable.
        drop(held);
        let cancel2 = CancellationToken::new();
        let _next = queue.admit("p", Priority::Normal, &cancel2).await.unwrap();
    }

    #[tokio::test]
    async fn providers_queue_independently() {
        let queue = RequestQueue::new(limits(1, 0));
        let cancel = CancellationToken::new();
        let _a = queue.admit("a", Priority::Normal, &cancel).await.unwrap();
        // Provider b has its own gate.
        let _b = queue.admit("b", Priority::Normal, &cancel).await.unwrap();
    }
}
