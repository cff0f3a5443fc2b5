//! Asynchronous usage recording.
//!
//! Handlers emit one event per completed request; a background task
//! drains the channel into the store. Delivery is at-least-once, so the
//! recorder dedups by request id over a bounded recent-id set before
//! writing. A client that disconnects mid-stream is billed for the
//! tokens emitted up to the disconnect.

use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::ProviderStore;

/// How many settled request ids are remembered for deduplication.
const DEDUP_WINDOW: usize = 4096;

#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub request_id: String,
    pub key_id: String,
    pub tokens: u64,
}

#[derive(Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<UsageEvent>,
}

impl UsageRecorder {
    /// Spawn the drain task and hand back the sending side.
    pub fn spawn(store: Arc<dyn ProviderStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<UsageEvent>(1024);
        tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            let mut order: VecDeque<String> = VecDeque::new();
            while let Some(event) = rx.recv().await {
                if !seen.insert(event.request_id.clone()) {
                    continue;
                }
                order.push_back(event.request_id.clone());
                if order.len() > DEDUP_WINDOW {
                    if let Some(evicted) = order.pop_front() {
                        seen.remove(&evicted);
                    }
                }
                if let Err(e) = store
                    .increment_usage(&event.key_id, 1, event.tokens, Utc::now())
                    .await
                {
                    tracing::warn!(
                        request_id = %event.request_id,
                        error = %e,
                        "usage write failed"
                    );
                }
            }
        });
        Self { tx }
    }

    /// Fire-and-forget; a full channel drops the event rather than
    /// blocking the request path.
    pub fn record(&self, event: UsageEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "usage channel full, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn events_land_in_the_store() {
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::spawn(store.clone());

        recorder.record(UsageEvent {
            request_id: "r1".into(),
            key_id: "k1".into(),
            tokens: 42,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let usage = store.usage_of("k1");
        assert_eq!(usage.total_requests, 1);
        assert_eq!(usage.total_tokens, 42);
    }

    #[tokio::test]
    async fn duplicate_request_ids_count_once() {
        let store = Arc::new(MemoryStore::new());
        let recorder = UsageRecorder::spawn(store.clone());

        for _ in 0..3 {
            recorder.record(UsageEvent {
                request_id: "same".into(),
                key_id: "k1".into(),
                tokens: 10,
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let usage = store.usage_of("k1");
        assert_eq!(usage.total_requests, 1);
        assert_eq!(usage.total_tokens, 10);
    }
}
