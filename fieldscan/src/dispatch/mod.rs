//! Output fan-out.
//!
//! Workers push every find onto one ingress queue; the [`OutputDispatcher`]
//! deduplicates them by each kind's natural key and forwards unique items
//! to a pool of stateless delivery workers. Delivery is fire-and-forget —
//! a failed post is logged, never retried — and backpressure is purely
//! observational: a deep delivery queue logs a warning, nothing blocks.
//!
//! The dedup set is bounded by a rolling sweep: every five minutes, keys
//! whose event expired more than a minute ago are evicted.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::queue::SharedQueue;
use crate::rpc::{BoxFuture, EntityState, PointEvent};
use crate::scheduler::unix_now;
use crate::telemetry::ScanMetrics;

/// Interval between dedup-set eviction sweeps, seconds.
pub const SWEEP_INTERVAL_SECS: u64 = 300;

/// Grace period an expired key survives past its event, seconds.
pub const SWEEP_GRACE_SECS: u64 = 60;

/// Kind tag of an outgoing item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OutputKind {
    /// A point event (something appeared at a spawn location).
    PointEvent,
    /// A periodic entity-state update.
    EntityState,
    /// Anything else; passed through without deduplication.
    Other(String),
}

impl OutputKind {
    /// Wire tag used in delivered payloads.
    pub fn tag(&self) -> &str {
        match self {
            OutputKind::PointEvent => "point_event",
            OutputKind::EntityState => "entity_state",
            OutputKind::Other(tag) => tag,
        }
    }
}

/// One item on its way out to the webhook sinks.
#[derive(Clone, Debug)]
pub struct OutputItem {
    /// Kind tag.
    pub kind: OutputKind,
    /// Payload forwarded verbatim to the sink.
    pub payload: Value,
    dedup: Option<DedupKey>,
}

/// Natural key identifying one unique delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    kind: OutputKind,
    primary: String,
    secondary: String,
}

impl OutputItem {
    /// Builds the outgoing item for a point event.
    ///
    /// Dedup key is `(spatial_id, event_id)`; the key is retained until the
    /// event's own expiry passes.
    pub fn point_event(event: &PointEvent) -> Self {
        let mut payload = json!({
            "spatial_id": event.spatial_id,
            "event_id": event.event_id,
            "latitude": event.lat,
            "longitude": event.lng,
            "expires_at": event.expires_at,
        });
        merge_payload(&mut payload, &event.payload);

        Self {
            kind: OutputKind::PointEvent,
            payload,
            dedup: Some(DedupKey {
                kind: OutputKind::PointEvent,
                primary: event.spatial_id.clone(),
                secondary: event.event_id.clone(),
            }),
        }
    }

    /// Builds the outgoing item for an entity-state update.
    ///
    /// Dedup key is `(entity_id, last_modified)` — an unchanged entity is
    /// only delivered once.
    pub fn entity_state(state: &EntityState) -> Self {
        let mut payload = json!({
            "entity_id": state.entity_id,
            "last_modified": state.last_modified,
            "latitude": state.lat,
            "longitude": state.lng,
        });
        merge_payload(&mut payload, &state.payload);

        Self {
            kind: OutputKind::EntityState,
            payload,
            dedup: Some(DedupKey {
                kind: OutputKind::EntityState,
                primary: state.entity_id.clone(),
                secondary: state.last_modified.to_string(),
            }),
        }
    }

    /// Builds a pass-through item with no deduplication.
    pub fn other(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: OutputKind::Other(tag.into()),
            payload,
            dedup: None,
        }
    }

    /// Unix timestamp after which this item's dedup key may be evicted.
    fn retain_until(&self, now: u64) -> u64 {
        match self.kind {
            OutputKind::PointEvent => self
                .payload
                .get("expires_at")
                .and_then(Value::as_u64)
                .unwrap_or(now),
            _ => now,
        }
    }
}

fn merge_payload(target: &mut Value, extra: &Value) {
    if let (Some(target_map), Some(extra_map)) = (target.as_object_mut(), extra.as_object()) {
        for (key, value) in extra_map {
            target_map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

// =============================================================================
// Webhook sink
// =============================================================================

/// A failed delivery attempt.
#[derive(Debug, Error)]
#[error("webhook delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// Destination for unique output items.
///
/// Implementations must be cheap to call and must not retry internally;
/// the dispatcher's contract is fire-and-forget.
pub trait WebhookSink: Send + Sync {
    /// Delivers one item. Errors are logged by the caller, not retried.
    fn deliver<'a>(
        &'a self,
        kind: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

/// HTTP sink posting `{"type": kind, "message": payload}` to each endpoint.
pub struct HttpWebhookSink {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpWebhookSink {
    /// Creates a sink for the given endpoint URLs with a short timeout.
    pub fn new(endpoints: Vec<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap_or_default();
        Self { client, endpoints }
    }
}

impl WebhookSink for HttpWebhookSink {
    fn deliver<'a>(
        &'a self,
        kind: &'a str,
        payload: &'a Value,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async move {
            let body = json!({ "type": kind, "message": payload });
            for endpoint in &self.endpoints {
                if let Err(e) = self.client.post(endpoint).json(&body).send().await {
                    debug!(endpoint = %endpoint, error = %e, "Webhook post failed");
                    return Err(DeliveryError(e.to_string()));
                }
            }
            Ok(())
        })
    }
}

/// Sink that drops everything; used when no webhooks are configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl WebhookSink for NullSink {
    fn deliver<'a>(
        &'a self,
        _kind: &'a str,
        _payload: &'a Value,
    ) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Deduplicating fan-out from the ingress queue to the delivery workers.
pub struct OutputDispatcher {
    ingress: Arc<SharedQueue<OutputItem>>,
    delivery: Arc<SharedQueue<OutputItem>>,
    seen: DashMap<DedupKey, u64>,
    metrics: Arc<ScanMetrics>,
}

impl OutputDispatcher {
    /// Creates a dispatcher between the two queues.
    pub fn new(
        ingress: Arc<SharedQueue<OutputItem>>,
        delivery: Arc<SharedQueue<OutputItem>>,
        metrics: Arc<ScanMetrics>,
    ) -> Self {
        Self {
            ingress,
            delivery,
            seen: DashMap::new(),
            metrics,
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Output dispatcher starting");
        let mut next_sweep = unix_now() + SWEEP_INTERVAL_SECS;

        loop {
            let Some(item) = self.ingress.pop_cancellable(&shutdown).await else {
                break;
            };

            if self.admit(&item) {
                self.delivery.push(item);
            } else {
                self.metrics.duplicate_suppressed();
            }

            let now = unix_now();
            if now >= next_sweep {
                self.sweep(now);
                next_sweep = now + SWEEP_INTERVAL_SECS;
            }
        }

        info!("Output dispatcher stopped");
    }

    /// Returns true when the item has not been seen before (or carries no
    /// dedup key), registering it as seen.
    fn admit(&self, item: &OutputItem) -> bool {
        let Some(key) = item.dedup.clone() else {
            return true;
        };

        let retain_until = item.retain_until(unix_now());
        match self.seen.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(retain_until);
                true
            }
        }
    }

    /// Evicts dedup keys whose events expired more than the grace period
    /// ago, bounding the set's memory.
    fn sweep(&self, now: u64) {
        let before = self.seen.len();
        self.seen
            .retain(|_, retain_until| *retain_until + SWEEP_GRACE_SECS >= now);
        debug!(
            evicted = before - self.seen.len(),
            remaining = self.seen.len(),
            "Swept dedup set"
        );
    }

    /// Number of dedup keys currently held.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Spawns `count` delivery workers draining `delivery` into `sink`.
///
/// Returns their join handles; they stop when `shutdown` fires.
pub fn spawn_delivery_workers(
    count: usize,
    delivery: Arc<SharedQueue<OutputItem>>,
    sink: Arc<dyn WebhookSink>,
    config: DispatchConfig,
    metrics: Arc<ScanMetrics>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let delivery = Arc::clone(&delivery);
            let sink = Arc::clone(&sink);
            let metrics = Arc::clone(&metrics);
            let shutdown = shutdown.clone();
            let warning_depth = config.queue_warning_depth;

            tokio::spawn(async move {
                debug!(worker = index, "Delivery worker starting");
                loop {
                    let Some(item) = delivery.pop_cancellable(&shutdown).await else {
                        break;
                    };

                    metrics.delivery_attempted();
                    if let Err(e) = sink.deliver(item.kind.tag(), &item.payload).await {
                        metrics.delivery_failed();
                        debug!(error = %e, "Delivery failed");
                    }

                    let depth = delivery.len();
                    if depth > warning_depth {
                        warn!(
                            depth,
                            "Delivery queue is backed up; consider more delivery workers"
                        );
                    }
                }
                debug!(worker = index, "Delivery worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(spatial: &str, event_id: &str, expires_at: u64) -> PointEvent {
        PointEvent {
            spatial_id: spatial.to_string(),
            event_id: event_id.to_string(),
            lat: 40.0,
            lng: -75.0,
            expires_at,
            payload: json!({"kind_id": 16}),
        }
    }

    fn state(entity: &str, last_modified: u64) -> EntityState {
        EntityState {
            entity_id: entity.to_string(),
            last_modified,
            lat: 40.0,
            lng: -75.0,
            payload: json!({}),
        }
    }

    fn dispatcher() -> (
        OutputDispatcher,
        Arc<SharedQueue<OutputItem>>,
        Arc<SharedQueue<OutputItem>>,
    ) {
        let ingress = Arc::new(SharedQueue::new());
        let delivery = Arc::new(SharedQueue::new());
        let dispatcher = OutputDispatcher::new(
            Arc::clone(&ingress),
            Arc::clone(&delivery),
            Arc::new(ScanMetrics::new()),
        );
        (dispatcher, ingress, delivery)
    }

    #[test]
    fn test_point_event_payload_carries_natural_key() {
        let item = OutputItem::point_event(&event("sp1", "ev1", 1000));
        assert_eq!(item.kind, OutputKind::PointEvent);
        assert_eq!(item.payload["spatial_id"], "sp1");
        assert_eq!(item.payload["event_id"], "ev1");
        // Extra decoded fields merged in.
        assert_eq!(item.payload["kind_id"], 16);
    }

    #[test]
    fn test_admit_suppresses_duplicate_point_events() {
        let (dispatcher, _, _) = dispatcher();

        let first = OutputItem::point_event(&event("sp1", "ev1", 1000));
        let duplicate = OutputItem::point_event(&event("sp1", "ev1", 1000));
        let different = OutputItem::point_event(&event("sp1", "ev2", 1000));

        assert!(dispatcher.admit(&first));
        assert!(!dispatcher.admit(&duplicate));
        assert!(dispatcher.admit(&different));
    }

    #[test]
    fn test_admit_entity_state_keyed_on_modification() {
        let (dispatcher, _, _) = dispatcher();

        assert!(dispatcher.admit(&OutputItem::entity_state(&state("gym1", 100))));
        assert!(!dispatcher.admit(&OutputItem::entity_state(&state("gym1", 100))));
        // A newer modification is a new delivery.
        assert!(dispatcher.admit(&OutputItem::entity_state(&state("gym1", 200))));
    }

    #[test]
    fn test_other_kind_passes_through() {
        let (dispatcher, _, _) = dispatcher();
        let item = OutputItem::other("heartbeat", json!({"n": 1}));
        assert!(dispatcher.admit(&item));
        assert!(dispatcher.admit(&item), "no dedup for unknown kinds");
    }

    #[test]
    fn test_sweep_evicts_expired_keys() {
        let (dispatcher, _, _) = dispatcher();
        let now = unix_now();

        // Expired long ago vs still-live event.
        dispatcher.admit(&OutputItem::point_event(&event("old", "ev", now - 500)));
        dispatcher.admit(&OutputItem::point_event(&event(
            "fresh",
            "ev",
            now + 500,
        )));
        assert_eq!(dispatcher.seen_count(), 2);

        dispatcher.sweep(now);
        assert_eq!(dispatcher.seen_count(), 1);

        // After eviction the old key is deliverable again.
        assert!(dispatcher.admit(&OutputItem::point_event(&event("old", "ev", now - 500))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_forwards_unique_items() {
        let (dispatcher, ingress, delivery) = dispatcher();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(shutdown.clone()));

        ingress.push(OutputItem::point_event(&event("sp1", "ev1", 1000)));
        ingress.push(OutputItem::point_event(&event("sp1", "ev1", 1000)));
        ingress.push(OutputItem::point_event(&event("sp2", "ev1", 1000)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivery.len(), 2, "one duplicate must be suppressed");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_workers_drain_queue() {
        struct CountingSink(AtomicUsize);
        impl WebhookSink for CountingSink {
            fn deliver<'a>(
                &'a self,
                _kind: &'a str,
                _payload: &'a Value,
            ) -> BoxFuture<'a, Result<(), DeliveryError>> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Box::pin(async { Ok(()) })
            }
        }

        let delivery = Arc::new(SharedQueue::new());
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let metrics = Arc::new(ScanMetrics::new());
        let shutdown = CancellationToken::new();

        let handles = spawn_delivery_workers(
            2,
            Arc::clone(&delivery),
            Arc::clone(&sink) as Arc<dyn WebhookSink>,
            DispatchConfig::default(),
            Arc::clone(&metrics),
            shutdown.clone(),
        );

        for i in 0..10 {
            delivery.push(OutputItem::other("test", json!({ "i": i })));
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.0.load(Ordering::Relaxed), 10);
        assert_eq!(metrics.snapshot().deliveries_attempted, 10);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_failing_sink_counts_failures() {
        // DeliveryError formatting sanity.
        let err = DeliveryError("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
