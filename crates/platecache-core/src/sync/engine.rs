//! Drains the pending write queue against the network.
//!
//! One drain attempt delivers queued operations oldest first and stops at the
//! first failure, so a later operation is never delivered before an earlier
//! one. Malformed entries are purged without being sent. Drain attempts are
//! serialised: concurrent callers wait for the running attempt and then make
//! their own pass over whatever is still queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::Transport;
use crate::context::Context;
use crate::error::Result;

use super::backoff::{Backoff, RetryConfig};
use super::queue::{OperationId, PendingQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Idle,
    Draining,
}

/// How a drain attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// The queue is empty.
    Empty,
    /// Delivery of `id` failed; it and everything after it remain queued.
    Blocked {
        id: OperationId,
        reason: String,
        retry_after: Option<DateTime<Utc>>,
    },
    /// Skipped because the backoff deadline has not passed yet.
    Deferred { retry_after: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
    pub delivered: Vec<OperationId>,
    pub purged: Vec<OperationId>,
    pub outcome: DrainOutcome,
}

impl DrainReport {
    fn new() -> Self {
        Self {
            delivered: Vec::new(),
            purged: Vec::new(),
            outcome: DrainOutcome::Empty,
        }
    }

    /// True when the queue was left empty.
    pub fn is_complete(&self) -> bool {
        self.outcome == DrainOutcome::Empty
    }
}

/// Marks the engine as draining for as long as it is alive.
struct DrainingGuard<'a>(&'a AtomicBool);

impl<'a> DrainingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    queue: PendingQueue,
    transport: Arc<dyn Transport>,
    /// Held for the whole drain; also owns the backoff state.
    drain_lock: Mutex<Backoff>,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(ctx: &Context) -> Self {
        Self::with_retry(
            PendingQueue::new(ctx.store.clone()),
            ctx.transport.clone(),
            ctx.config.retry.clone(),
        )
    }

    pub fn with_retry(queue: PendingQueue, transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self {
            queue,
            transport,
            drain_lock: Mutex::new(Backoff::new(retry)),
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn state(&self) -> SyncState {
        if self.draining.load(Ordering::SeqCst) {
            SyncState::Draining
        } else {
            SyncState::Idle
        }
    }

    /// When the next opportunistic drain may run, if a failed round set a deadline.
    pub async fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.drain_lock.lock().await.retry_after()
    }

    /// Forget previous failures, e.g. because connectivity just came back.
    pub async fn reset_backoff(&self) {
        self.drain_lock.lock().await.reset();
    }

    /// Opportunistic drain (page load, after a mutation). Respects the backoff deadline.
    pub async fn trigger(&self) -> Result<DrainReport> {
        self.drain(true).await
    }

    /// Explicit retry. Ignores the backoff deadline.
    pub async fn drain_now(&self) -> Result<DrainReport> {
        self.drain(false).await
    }

    async fn drain(&self, respect_backoff: bool) -> Result<DrainReport> {
        let mut backoff = self.drain_lock.lock().await;
        let mut report = DrainReport::new();

        if respect_backoff && !backoff.is_ready(Utc::now()) && !self.queue.is_empty().await? {
            if let Some(retry_after) = backoff.retry_after() {
                debug!(%retry_after, "Drain deferred by backoff");
                report.outcome = DrainOutcome::Deferred { retry_after };
                return Ok(report);
            }
        }

        let _draining = DrainingGuard::enter(&self.draining);
        loop {
            let Some(op) = self.queue.peek_oldest().await? else {
                backoff.reset();
                report.outcome = DrainOutcome::Empty;
                break;
            };

            let request = match op.to_request() {
                Ok(request) => request,
                Err(e) => {
                    warn!(id = %op.id, url = %op.url, error = %e, "Purging malformed pending operation");
                    self.queue.remove_oldest(op.id).await?;
                    report.purged.push(op.id);
                    continue;
                }
            };

            let failure = match self.transport.send(&request).await {
                Ok(response) if response.is_success() => None,
                Ok(response) => Some(format!("status {}", response.status)),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    if let Err(e) = self.queue.remove_oldest(op.id).await {
                        warn!(
                            id = %op.id,
                            url = %request.url,
                            error = %e,
                            "Delivered but could not dequeue; it will be sent again"
                        );
                        return Err(e);
                    }
                    backoff.reset();
                    info!(id = %op.id, method = %request.method, url = %request.url, "Delivered pending operation");
                    report.delivered.push(op.id);
                }
                Some(reason) => {
                    let delay = backoff.record_failure(Utc::now());
                    warn!(
                        id = %op.id,
                        url = %request.url,
                        reason = %reason,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "Delivery failed, leaving queue intact"
                    );
                    report.outcome = DrainOutcome::Blocked {
                        id: op.id,
                        reason,
                        retry_after: backoff.retry_after(),
                    };
                    break;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Method, MockTransport};
    use crate::store::{MemoryBackend, Store, PENDING};
    use serde_json::json;
    use std::time::Duration;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: 0.0,
            ..RetryConfig::default()
        }
    }

    fn engine() -> (Store, Arc<MockTransport>, SyncEngine) {
        let store = Store::in_memory().unwrap();
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::with_retry(
            PendingQueue::new(store.clone()),
            transport.clone(),
            no_jitter(),
        );
        (store, transport, engine)
    }

    #[tokio::test]
    async fn test_empty_queue_is_terminal_success() {
        let (_, transport, engine) = engine();
        let report = engine.drain_now().await.unwrap();
        assert!(report.is_complete());
        assert_eq!(transport.request_count(), 0);
        assert_eq!(engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_stops_at_first_failure_preserving_order() {
        let (_, transport, engine) = engine();
        let queue = engine.queue().clone();
        let mut ids = Vec::new();
        for n in 1..=5 {
            let url = format!("/restaurants/{}/?is_favorite=true", n);
            ids.push(queue.enqueue(&url, Method::Put, None).await.unwrap());
            let status = if n <= 2 { 200 } else { 503 };
            transport.respond(Method::Put, &url, status, json!({}));
        }

        let report = engine.drain_now().await.unwrap();
        assert_eq!(report.delivered, ids[..2].to_vec());
        assert!(matches!(report.outcome, DrainOutcome::Blocked { id, .. } if id == ids[2]));

        let remaining: Vec<OperationId> = queue.list().await.unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());
        // Nothing after the failed operation was attempted
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_purged_without_network_call() {
        let (store, transport, engine) = engine();
        store
            .add(PENDING, json!({"url": "", "method": "PUT"}))
            .await
            .unwrap();
        store
            .add(PENDING, json!({"url": "/reviews", "method": "POST"}))
            .await
            .unwrap();

        let report = engine.drain_now().await.unwrap();
        assert_eq!(report.purged.len(), 2);
        assert!(report.is_complete());
        assert_eq!(transport.request_count(), 0);
        assert!(engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_redirect_counts_as_delivered() {
        let (_, transport, engine) = engine();
        engine
            .queue()
            .enqueue("/reviews", Method::Post, Some(json!({"name": "a"})))
            .await
            .unwrap();
        transport.respond(Method::Post, "/reviews", 302, json!({}));

        let report = engine.drain_now().await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_backoff_defers_trigger_but_not_drain_now() {
        let (_, transport, engine) = engine();
        engine
            .queue()
            .enqueue("/reviews", Method::Post, Some(json!({"name": "a"})))
            .await
            .unwrap();
        transport.set_online(false);

        let first = engine.trigger().await.unwrap();
        assert!(matches!(first.outcome, DrainOutcome::Blocked { .. }));
        assert!(engine.retry_after().await.is_some());

        let deferred = engine.trigger().await.unwrap();
        assert!(matches!(deferred.outcome, DrainOutcome::Deferred { .. }));
        assert_eq!(transport.request_count(), 1);

        transport.set_online(true);
        transport.respond(Method::Post, "/reviews", 201, json!({"id": 1}));
        let forced = engine.drain_now().await.unwrap();
        assert!(forced.is_complete());
        assert_eq!(engine.retry_after().await, None);
    }

    #[tokio::test]
    async fn test_reset_backoff_allows_trigger() {
        let (_, transport, engine) = engine();
        engine
            .queue()
            .enqueue("/restaurants/1/?is_favorite=false", Method::Put, None)
            .await
            .unwrap();
        transport.set_online(false);
        engine.trigger().await.unwrap();

        transport.set_online(true);
        transport.respond(Method::Put, "/restaurants/1/?is_favorite=false", 200, json!({}));
        engine.reset_backoff().await;
        let report = engine.trigger().await.unwrap();
        assert_eq!(report.delivered.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_drains_deliver_each_operation_once() {
        let (_, transport, engine) = engine();
        let engine = Arc::new(engine);
        transport.set_latency(Duration::from_millis(5));
        for n in 0..6 {
            let url = format!("/restaurants/{}/?is_favorite=true", n);
            engine.queue().enqueue(&url, Method::Put, None).await.unwrap();
            transport.respond(Method::Put, &url, 200, json!({}));
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.drain_now().await })
            })
            .collect();

        let mut delivered = Vec::new();
        for handle in handles {
            let report = handle.await.unwrap().unwrap();
            delivered.extend(report.delivered);
        }
        delivered.sort();
        delivered.dedup();
        assert_eq!(delivered.len(), 6);
        assert_eq!(transport.request_count(), 6);
        assert!(engine.queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_dequeue_after_delivery_keeps_operation() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::open(backend.clone()).unwrap();
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::with_retry(PendingQueue::new(store), transport.clone(), no_jitter());
        engine
            .queue()
            .enqueue("/restaurants/1/?is_favorite=true", Method::Put, None)
            .await
            .unwrap();
        transport.respond(Method::Put, "/restaurants/1/?is_favorite=true", 200, json!({}));

        backend.set_fail_partition(PENDING, true);
        assert!(engine.drain_now().await.is_err());
        assert_eq!(transport.request_count(), 1);
        assert_eq!(engine.queue().len().await.unwrap(), 1);

        // Once the store recovers the operation goes out again and is dequeued
        backend.set_fail_partition(PENDING, false);
        let report = engine.drain_now().await.unwrap();
        assert_eq!(report.delivered.len(), 1);
        assert_eq!(transport.request_count(), 2);
        assert!(engine.queue().is_empty().await.unwrap());
    }
}
