// Event router: pattern-matched fan-out with a durable outbox

//! # Event Router
//!
//! Connects event producers to handlers through structural pattern
//! matching on source and detail-type. Every matching handler receives
//! the event — fan-out, not first-match — and handler order among
//! matches is unspecified, so handlers must be idempotent and
//! independent.
//!
//! ## Durable outbox
//!
//! `publish` appends the event to a persistent outbox **before** any
//! dispatch and returns without waiting on handlers (fire-and-forward).
//! A dispatcher drains the outbox in sequence order, retrying failed
//! deliveries on the configured backoff schedule. A delivery that
//! exhausts its retries moves the event to a dead-letter record and
//! publishes an `ErrorOccurred` event describing the failure — events
//! are never silently dropped. Sequential draining preserves publish
//! order per handler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::models::{detail_types, Event, EventPattern};
use crate::storage::{keys, KeyValueStore, PutCondition, ScanOrder, StoredItem};
use crate::{ConductorError, Result};

/// Error code carried by delivery-failure events
pub const ERROR_CODE_DELIVERY_FAILED: &str = "EVENT_DELIVERY_FAILED";

/// A subscriber invoked for every event matching its pattern
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct Subscription {
    id: Uuid,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

/// Persisted outbox entry awaiting dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxEntry {
    sequence: u64,
    event: Event,
    enqueued_at: DateTime<Utc>,
}

/// Persisted record of an undeliverable event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub sequence: u64,
    pub event: Event,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Pattern-matching event router with at-least-once delivery
pub struct EventRouter {
    store: Arc<dyn KeyValueStore>,
    subscriptions: RwLock<Vec<Subscription>>,
    delivery: RetryPolicy,
    next_sequence: AtomicU64,
    notify: Notify,
    dispatch_lock: Mutex<()>,
}

impl EventRouter {
    /// Create a router over the given store, resuming the outbox
    /// sequence from whatever was persisted before a restart.
    pub async fn new(store: Arc<dyn KeyValueStore>, delivery: RetryPolicy) -> Result<Self> {
        let next_sequence = Self::recover_sequence(store.as_ref()).await?;
        Ok(Self {
            store,
            subscriptions: RwLock::new(Vec::new()),
            delivery,
            next_sequence: AtomicU64::new(next_sequence),
            notify: Notify::new(),
            dispatch_lock: Mutex::new(()),
        })
    }

    async fn recover_sequence(store: &dyn KeyValueStore) -> Result<u64> {
        let mut next = 0u64;
        for prefix in [keys::SK_OUTBOX, keys::SK_DEADLETTER] {
            let latest = store
                .query_prefix(keys::PK_ROUTER, prefix, ScanOrder::Descending, Some(1))
                .await?;
            if let Some(item) = latest.first() {
                let sequence = item.body["sequence"].as_u64().unwrap_or(0);
                next = next.max(sequence + 1);
            }
        }
        Ok(next)
    }

    /// Register a handler for every event matching `pattern`.
    /// Returns the subscription ID.
    pub async fn subscribe(&self, pattern: EventPattern, handler: Arc<dyn EventHandler>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscriptions.write().await.push(Subscription {
            id,
            pattern,
            handler,
        });
        id
    }

    pub async fn unsubscribe(&self, id: Uuid) {
        self.subscriptions
            .write()
            .await
            .retain(|subscription| subscription.id != id);
    }

    /// Persist the event to the outbox and wake the dispatcher.
    ///
    /// Returns once the event is durable; never waits on handlers.
    pub async fn publish(&self, event: Event) -> Result<()> {
        loop {
            let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
            let entry = OutboxEntry {
                sequence,
                event: event.clone(),
                enqueued_at: Utc::now(),
            };
            let item = StoredItem::encode(
                keys::PK_ROUTER.to_string(),
                keys::outbox_sk(sequence),
                &entry,
            )?;
            match self.store.put(item, PutCondition::IfNotExists).await {
                Ok(()) => break,
                // Another writer claimed this sequence number; take the next
                Err(ConductorError::ConditionalCheck { .. }) => continue,
                Err(other) => return Err(other),
            }
        }

        debug!(
            source = %event.source,
            detail_type = %event.detail_type,
            "event enqueued"
        );
        self.notify.notify_one();
        Ok(())
    }

    /// Drain every pending outbox entry, delivering to all matching
    /// handlers. Returns the number of entries processed.
    pub async fn dispatch_pending(&self) -> Result<usize> {
        let _guard = self.dispatch_lock.lock().await;
        let mut processed = 0;

        loop {
            let pending = self
                .store
                .query_prefix(keys::PK_ROUTER, keys::SK_OUTBOX, ScanOrder::Ascending, None)
                .await?;
            if pending.is_empty() {
                return Ok(processed);
            }

            for item in pending {
                let entry: OutboxEntry = item.decode()?;
                self.deliver(&entry).await?;
                self.store.delete(keys::PK_ROUTER, &item.sk).await?;
                processed += 1;
            }
        }
    }

    /// Run the dispatcher until cancelled, draining on every publish
    pub fn start_dispatcher(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.dispatch_pending().await {
                    error!(%err, "outbox dispatch failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.notify.notified() => {}
                }
            }
        })
    }

    /// Deliver one entry to every matching handler, each with its own
    /// retry budget. Exhausted deliveries are dead-lettered.
    async fn deliver(&self, entry: &OutboxEntry) -> Result<()> {
        let matching: Vec<(Uuid, Arc<dyn EventHandler>)> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|subscription| subscription.pattern.matches(&entry.event))
                .map(|subscription| (subscription.id, subscription.handler.clone()))
                .collect()
        };

        for (subscription_id, handler) in matching {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match handler.handle(&entry.event).await {
                    Ok(()) => break,
                    Err(err) if attempt < self.delivery.max_attempts => {
                        let delay = self.delivery.delay_for(attempt);
                        warn!(
                            %subscription_id,
                            detail_type = %entry.event.detail_type,
                            attempt,
                            ?delay,
                            %err,
                            "event delivery failed, retrying"
                        );
                        sleep(delay).await;
                    }
                    Err(err) => {
                        self.dead_letter(entry, attempt, &err.to_string()).await?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: &OutboxEntry, attempts: u32, last_error: &str) -> Result<()> {
        error!(
            sequence = entry.sequence,
            detail_type = %entry.event.detail_type,
            attempts,
            last_error,
            "event delivery exhausted retries, dead-lettering"
        );

        let record = DeadLetterEntry {
            sequence: entry.sequence,
            event: entry.event.clone(),
            attempts,
            last_error: last_error.to_string(),
            failed_at: Utc::now(),
        };
        let item = StoredItem::encode(
            keys::PK_ROUTER.to_string(),
            keys::deadletter_sk(entry.sequence),
            &record,
        )?;
        self.store.put(item, PutCondition::None).await?;

        // Announce the failure, but never recurse on a failed
        // announcement's own delivery failure
        let is_delivery_failure_event = entry.event.detail_type == detail_types::ERROR_OCCURRED
            && entry.event.detail["errorCode"] == ERROR_CODE_DELIVERY_FAILED;
        if !is_delivery_failure_event {
            let announcement = Event::error_occurred(
                ERROR_CODE_DELIVERY_FAILED,
                &format!(
                    "delivery of {}/{} (sequence {}) failed after {} attempts: {}",
                    entry.event.source, entry.event.detail_type, entry.sequence, attempts, last_error
                ),
                None,
                None,
            )?;
            self.publish(announcement).await?;
        }
        Ok(())
    }

    /// Dead-letter records, oldest first
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let items = self
            .store
            .query_prefix(
                keys::PK_ROUTER,
                keys::SK_DEADLETTER,
                ScanOrder::Ascending,
                None,
            )
            .await?;
        items.iter().map(|item| item.decode()).collect()
    }

    /// Number of events persisted but not yet dispatched
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self
            .store
            .query_prefix(keys::PK_ROUTER, keys::SK_OUTBOX, ScanOrder::Ascending, None)
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sources;
    use crate::storage::InMemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Capture {
        seen: Mutex<Vec<Event>>,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        async fn seen(&self) -> Vec<Event> {
            self.seen.lock().await.clone()
        }
    }

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().await.push(event.clone());
            Ok(())
        }
    }

    struct Flaky {
        failures_remaining: AtomicU32,
        successes: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient handler failure")
            }
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl EventHandler for AlwaysFails {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("handler is broken")
        }
    }

    async fn router_over(store: Arc<InMemoryStore>) -> Arc<EventRouter> {
        Arc::new(
            EventRouter::new(store, RetryPolicy::default())
                .await
                .unwrap(),
        )
    }

    fn sample_event(detail_type: &str) -> Event {
        Event::new(sources::TASKS, detail_type, json!({"n": 1}))
    }

    #[tokio::test]
    async fn test_publish_persists_before_dispatch() {
        let store = Arc::new(InMemoryStore::new());
        let router = router_over(store).await;

        router.publish(sample_event("TaskCreated")).await.unwrap();
        assert_eq!(router.pending_count().await.unwrap(), 1);

        router.dispatch_pending().await.unwrap();
        assert_eq!(router.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_matching_patterns() {
        let router = router_over(Arc::new(InMemoryStore::new())).await;
        let by_source = Capture::new();
        let by_type = Capture::new();
        let unrelated = Capture::new();

        router
            .subscribe(EventPattern::for_source(sources::TASKS), by_source.clone())
            .await;
        router
            .subscribe(EventPattern::for_detail_type("TaskCreated"), by_type.clone())
            .await;
        router
            .subscribe(EventPattern::for_source(sources::ERRORS), unrelated.clone())
            .await;

        router.publish(sample_event("TaskCreated")).await.unwrap();
        router.dispatch_pending().await.unwrap();

        assert_eq!(by_source.seen().await.len(), 1);
        assert_eq!(by_type.seen().await.len(), 1);
        assert!(unrelated.seen().await.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_order_preserved_per_source_detail_type() {
        let router = router_over(Arc::new(InMemoryStore::new())).await;
        let capture = Capture::new();
        router
            .subscribe(EventPattern::for_source(sources::TASKS), capture.clone())
            .await;

        for n in 0..5 {
            router
                .publish(Event::new(sources::TASKS, "TaskProgress", json!({ "n": n })))
                .await
                .unwrap();
        }
        router.dispatch_pending().await.unwrap();

        let seen = capture.seen().await;
        let ns: Vec<i64> = seen.iter().map(|e| e.detail["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_to_success() {
        let router = router_over(Arc::new(InMemoryStore::new())).await;
        let flaky = Arc::new(Flaky {
            failures_remaining: AtomicU32::new(2),
            successes: AtomicU32::new(0),
        });
        router
            .subscribe(EventPattern::any(), flaky.clone())
            .await;

        router.publish(sample_event("TaskCreated")).await.unwrap();
        router.dispatch_pending().await.unwrap();

        assert_eq!(flaky.successes.load(Ordering::SeqCst), 1);
        assert!(router.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_delivery_dead_letters_and_announces() {
        let router = router_over(Arc::new(InMemoryStore::new())).await;
        let errors = Capture::new();
        router
            .subscribe(
                EventPattern::new(sources::ERRORS, detail_types::ERROR_OCCURRED),
                errors.clone(),
            )
            .await;
        router
            .subscribe(EventPattern::for_source(sources::TASKS), Arc::new(AlwaysFails))
            .await;

        router.publish(sample_event("TaskCreated")).await.unwrap();
        router.dispatch_pending().await.unwrap();

        let dead = router.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event.detail_type, "TaskCreated");
        assert_eq!(dead[0].attempts, 3);

        // The failure announcement was itself delivered
        let seen = errors.seen().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].detail["errorCode"], ERROR_CODE_DELIVERY_FAILED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_announcement_does_not_recurse() {
        let router = router_over(Arc::new(InMemoryStore::new())).await;
        // Every event fails delivery, including the announcement itself
        router
            .subscribe(EventPattern::any(), Arc::new(AlwaysFails))
            .await;

        router.publish(sample_event("TaskCreated")).await.unwrap();
        router.dispatch_pending().await.unwrap();

        // Original plus the one announcement, no runaway chain
        let dead = router.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_resumes_sequence_and_pending_events() {
        let store = Arc::new(InMemoryStore::new());
        {
            let router = router_over(store.clone()).await;
            router.publish(sample_event("TaskCreated")).await.unwrap();
            router.publish(sample_event("TaskProgress")).await.unwrap();
            // Crash before dispatch
        }

        let restarted = router_over(store).await;
        let capture = Capture::new();
        restarted
            .subscribe(EventPattern::for_source(sources::TASKS), capture.clone())
            .await;

        restarted.dispatch_pending().await.unwrap();
        assert_eq!(capture.seen().await.len(), 2);

        // New publishes continue after the recovered sequence
        restarted.publish(sample_event("TaskCompleted")).await.unwrap();
        restarted.dispatch_pending().await.unwrap();
        assert_eq!(capture.seen().await.len(), 3);
    }
}
