//! Service wiring and lifecycle.
//!
//! [`ScanService`] assembles the whole pipeline — account pool, target
//! queue, overseer, workers, output dispatcher, delivery workers — starts
//! every task, and owns the master cancellation token. After startup the
//! only fatal condition has already passed: no failure inside the pipeline
//! terminates the service, it runs until [`ScanService::shutdown`].
//!
//! # Startup sequence
//!
//! 1. Validate preconditions (identities, workers, spawn data).
//! 2. Register the account set and build the strategy.
//! 3. Spawn the overseer, then one coordinator per worker slot.
//! 4. Spawn the output dispatcher and its delivery workers.
//! 5. Optionally spawn the status-snapshot and hourly-reset tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::accounts::{AccountCredentials, AccountPool, AccountPoolError};
use crate::config::ScanConfig;
use crate::dispatch::{spawn_delivery_workers, OutputDispatcher, OutputItem, WebhookSink};
use crate::geo::Location;
use crate::queue::SharedQueue;
use crate::rpc::{ProxyRing, ScanClientFactory, UpsertBatch};
use crate::scheduler::{Overseer, ScanStrategy, ScanTarget, SharedOverseerState};
use crate::spawns::{load_spawn_file, SpawnPoint, SpawnSourceError};
use crate::telemetry::{MetricsSnapshot, ScanMetrics};
use crate::worker::status::{OverseerStatus, WorkerStatus, WorkerStatusSnapshot};
use crate::worker::{WorkerCoordinator, WorkerHandles};

/// Errors that can stop the service from starting.
///
/// These are the only fatal conditions in the system; everything after a
/// successful start is absorbed by the pipeline.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No usable identities were supplied.
    #[error("no usable identities supplied")]
    NoUsableIdentities,

    /// Worker count is zero.
    #[error("worker count must be at least 1")]
    NoWorkers,

    /// The selected mode needs spawn data but no file was configured.
    #[error("scan mode '{0}' requires a spawn file")]
    MissingSpawnFile(String),

    /// The spawn file could not be loaded.
    #[error(transparent)]
    SpawnSource(#[from] SpawnSourceError),

    /// Account set registration failed.
    #[error(transparent)]
    Pool(#[from] AccountPoolError),
}

/// A running scanning instance.
pub struct ScanService {
    config: ScanConfig,
    accounts: Arc<AccountPool>,
    target_queue: Arc<SharedQueue<ScanTarget>>,
    persistence_queue: Arc<SharedQueue<UpsertBatch>>,
    output_queue: Arc<SharedQueue<OutputItem>>,
    delivery_queue: Arc<SharedQueue<OutputItem>>,
    pause: Arc<AtomicBool>,
    center: Arc<RwLock<Option<Location>>>,
    location_tx: mpsc::UnboundedSender<Location>,
    overseer_status: Arc<OverseerStatus>,
    overseer_state: SharedOverseerState,
    worker_statuses: Vec<Arc<WorkerStatus>>,
    metrics: Arc<ScanMetrics>,
    cancellation: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ScanService {
    /// Starts every pipeline task. Must be called within a tokio runtime.
    pub fn start(
        config: ScanConfig,
        identities: Vec<AccountCredentials>,
        client_factory: Arc<dyn ScanClientFactory>,
        webhook_sink: Arc<dyn WebhookSink>,
        proxies: Option<Arc<ProxyRing>>,
    ) -> Result<Self, ServiceError> {
        if config.worker_count == 0 {
            return Err(ServiceError::NoWorkers);
        }
        if identities.is_empty() {
            return Err(ServiceError::NoUsableIdentities);
        }
        if config.worker_count > identities.len() {
            warn!(
                workers = config.worker_count,
                identities = identities.len(),
                "More workers than identities; some workers will wait for a free identity"
            );
        }

        let spawn_points = Self::load_spawn_points(&config)?;

        info!(
            mode = config.mode.method_name(),
            workers = config.worker_count,
            identities = identities.len(),
            "Starting scan service"
        );

        let accounts = Arc::new(AccountPool::new(config.pacing.max_speed_kmph));
        accounts.create_set(&config.account_set, identities)?;

        let target_queue = Arc::new(SharedQueue::new());
        let persistence_queue = Arc::new(SharedQueue::new());
        let output_queue = Arc::new(SharedQueue::new());
        let delivery_queue = Arc::new(SharedQueue::new());
        let pause = Arc::new(AtomicBool::new(false));
        let center = Arc::new(RwLock::new(config.center));
        let metrics = Arc::new(ScanMetrics::new());
        let cancellation = CancellationToken::new();
        let (location_tx, location_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();

        // Overseer.
        let strategy = ScanStrategy::from_config(&config, spawn_points);
        let overseer_status = Arc::new(OverseerStatus::new(config.mode.method_name()));
        let overseer = Overseer::new(
            strategy,
            Arc::clone(&target_queue),
            Arc::clone(&pause),
            location_rx,
            Arc::clone(&overseer_status),
            config.spawns.scan_current,
        );
        let overseer_state = overseer.state_handle();
        handles.push(tokio::spawn(overseer.run(cancellation.clone())));

        // Workers.
        let worker_handles = WorkerHandles {
            accounts: Arc::clone(&accounts),
            account_set: config.account_set.clone(),
            target_queue: Arc::clone(&target_queue),
            persistence_queue: Arc::clone(&persistence_queue),
            output_queue: Arc::clone(&output_queue),
            pause: Arc::clone(&pause),
            center: Arc::clone(&center),
            metrics: Arc::clone(&metrics),
            client_factory,
            proxies,
        };

        let mut worker_statuses = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let status = Arc::new(WorkerStatus::new());
            worker_statuses.push(Arc::clone(&status));

            let coordinator = WorkerCoordinator::new(
                index,
                config.worker_count,
                worker_handles.clone(),
                status,
                config.pacing.clone(),
                config.login.clone(),
                config.max_failures,
            );
            handles.push(tokio::spawn(coordinator.run(cancellation.clone())));
        }

        // Output fan-out.
        let dispatcher = OutputDispatcher::new(
            Arc::clone(&output_queue),
            Arc::clone(&delivery_queue),
            Arc::clone(&metrics),
        );
        handles.push(tokio::spawn(dispatcher.run(cancellation.clone())));
        handles.extend(spawn_delivery_workers(
            config.dispatch.delivery_workers,
            Arc::clone(&delivery_queue),
            webhook_sink,
            config.dispatch.clone(),
            Arc::clone(&metrics),
            cancellation.clone(),
        ));

        let service = Self {
            config,
            accounts,
            target_queue,
            persistence_queue,
            output_queue,
            delivery_queue,
            pause,
            center,
            location_tx,
            overseer_status,
            overseer_state,
            worker_statuses,
            metrics,
            cancellation,
            handles,
        };

        service.spawn_status_snapshot_task();
        service.spawn_hourly_reset_task();
        Ok(service)
    }

    fn load_spawn_points(config: &ScanConfig) -> Result<Vec<SpawnPoint>, ServiceError> {
        if !config.mode.needs_spawn_data() {
            return Ok(Vec::new());
        }
        let path = config.spawns.file.as_ref().ok_or_else(|| {
            ServiceError::MissingSpawnFile(config.mode.method_name().to_string())
        })?;
        Ok(load_spawn_file(path)?)
    }

    /// Pushes aggregate status records onto the persistence queue at the
    /// configured interval, tagged with the instance name.
    fn spawn_status_snapshot_task(&self) {
        let Some(instance) = self.config.instance_name.clone() else {
            return;
        };

        let interval = Duration::from_secs(self.config.status_snapshot_secs.max(1));
        let persistence_queue = Arc::clone(&self.persistence_queue);
        let overseer_status = Arc::clone(&self.overseer_status);
        let worker_statuses = self.worker_statuses.clone();
        let cancel = self.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                persistence_queue.push(UpsertBatch::StatusSnapshot {
                    instance: instance.clone(),
                    overseer_message: overseer_status.message(),
                    workers: worker_statuses.iter().map(|s| s.snapshot()).collect(),
                });
            }
        });
    }

    /// Resets the pool's hourly counters at the top of every cycle.
    fn spawn_hourly_reset_task(&self) {
        let accounts = Arc::clone(&self.accounts);
        let set_name = self.config.account_set.clone();
        let cancel = self.cancellation.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {
                        accounts.reset_hourly_counters(&set_name);
                    }
                }
            }
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control surface
    // ─────────────────────────────────────────────────────────────────────

    /// Pauses scanning. The overseer drains the queue; workers idle.
    pub fn pause(&self) {
        info!("Scanning paused");
        self.pause.store(true, Ordering::Relaxed);
    }

    /// Resumes scanning; the overseer refills on its next tick.
    pub fn resume(&self) {
        info!("Scanning resumed");
        self.pause.store(false, Ordering::Relaxed);
    }

    /// Whether the pause signal is set.
    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Relaxed)
    }

    /// Moves the scan area. The overseer drains and refills around the new
    /// center on its next tick.
    pub fn set_location(&self, location: Location) {
        *self.center.write() = Some(location);
        // Send only fails when the overseer is gone, i.e. during shutdown.
        let _ = self.location_tx.send(location);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Observability
    // ─────────────────────────────────────────────────────────────────────

    /// Depths of the target, output, and delivery queues.
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (
            self.target_queue.len(),
            self.output_queue.len(),
            self.delivery_queue.len(),
        )
    }

    /// The queue the persistence sink should drain.
    pub fn persistence_queue(&self) -> Arc<SharedQueue<UpsertBatch>> {
        Arc::clone(&self.persistence_queue)
    }

    /// Current overseer state.
    pub fn overseer_state(&self) -> crate::scheduler::OverseerState {
        self.overseer_state.get()
    }

    /// Current overseer status message.
    pub fn overseer_message(&self) -> String {
        self.overseer_status.message()
    }

    /// Point-in-time status of every worker.
    pub fn worker_statuses(&self) -> Vec<WorkerStatusSnapshot> {
        self.worker_statuses.iter().map(|s| s.snapshot()).collect()
    }

    /// Aggregate metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The account pool, for external captcha/rehabilitation tooling.
    pub fn accounts(&self) -> Arc<AccountPool> {
        Arc::clone(&self.accounts)
    }

    /// Cancels every task and waits for them to stop.
    pub async fn shutdown(mut self) {
        info!("Shutting down scan service");
        self.cancellation.cancel();

        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("Scan service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanMode;
    use crate::dispatch::NullSink;
    use crate::rpc::{
        AreaResponse, AuthError, BoxFuture, FetchError, PointEvent, ProxyEndpoint, ScanClient,
    };
    use crate::scheduler::{unix_now, OverseerState};
    use std::io::Write;

    struct StubClient;

    impl ScanClient for StubClient {
        fn authenticate<'a>(
            &'a self,
            _credentials: &'a AccountCredentials,
            _proxy: Option<&'a ProxyEndpoint>,
        ) -> BoxFuture<'a, Result<(), AuthError>> {
            Box::pin(async { Ok(()) })
        }

        fn fetch_area<'a>(
            &'a self,
            location: &'a Location,
        ) -> BoxFuture<'a, Result<AreaResponse, FetchError>> {
            let location = *location;
            Box::pin(async move {
                Ok(AreaResponse {
                    point_events: vec![PointEvent {
                        spatial_id: format!("{:.4},{:.4}", location.lat, location.lng),
                        event_id: format!("ev-{}", unix_now()),
                        lat: location.lat,
                        lng: location.lng,
                        expires_at: unix_now() + 600,
                        payload: serde_json::json!({}),
                    }],
                    entity_states: Vec::new(),
                })
            })
        }

        fn ticket_expires_at(&self) -> Option<u64> {
            // Long-lived ticket: no re-authentication needed.
            Some(unix_now() + 3600)
        }
    }

    struct StubFactory;

    impl ScanClientFactory for StubFactory {
        fn create_client(&self) -> Box<dyn ScanClient> {
            Box::new(StubClient)
        }
    }

    fn creds(n: usize) -> Vec<AccountCredentials> {
        (0..n)
            .map(|i| AccountCredentials {
                username: format!("scout-{}", i),
                password: "secret".to_string(),
                auth_service: "ptc".to_string(),
            })
            .collect()
    }

    fn hex_config(workers: usize) -> ScanConfig {
        let mut config = ScanConfig::new(ScanMode::HexGrid)
            .with_center(Location::new(40.0, -75.0))
            .with_workers(workers);
        config.hex.ring_count = 2;
        config.pacing.jitter_metres = None;
        config
    }

    fn start(config: ScanConfig, identities: usize) -> Result<ScanService, ServiceError> {
        ScanService::start(
            config,
            creds(identities),
            Arc::new(StubFactory),
            Arc::new(NullSink),
            None,
        )
    }

    #[tokio::test]
    async fn test_start_rejects_zero_workers() {
        let err = start(hex_config(0), 1).err().unwrap();
        assert!(matches!(err, ServiceError::NoWorkers));
    }

    #[tokio::test]
    async fn test_start_rejects_zero_identities() {
        let err = start(hex_config(1), 0).err().unwrap();
        assert!(matches!(err, ServiceError::NoUsableIdentities));
    }

    #[tokio::test]
    async fn test_start_requires_spawn_file_for_spawn_modes() {
        let config = ScanConfig::new(ScanMode::SpawnTimed)
            .with_center(Location::new(40.0, -75.0));
        let err = start(config, 1).err().unwrap();
        assert!(matches!(err, ServiceError::MissingSpawnFile(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hex_service_scans_end_to_end() {
        let service = start(hex_config(2), 3).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        let metrics = service.metrics();
        assert!(
            metrics.scans_succeeded > 0,
            "expected successful scans, got {:?}",
            metrics
        );
        // Stub returns unique events, so deliveries flow through.
        assert!(metrics.events_dispatched > 0);

        // Persistence batches were produced.
        assert!(!service.persistence_queue().is_empty());

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume() {
        let service = start(hex_config(1), 1).unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        service.pause();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(service.is_paused());
        assert_eq!(service.overseer_state(), OverseerState::Paused);
        let (targets, _, _) = service.queue_depths();
        assert_eq!(targets, 0, "pause must drain the target queue");

        service.resume();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(service.overseer_state(), OverseerState::QueueActive);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_mode_with_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"lat": 40.0, "lng": -75.0, "spawnpoint_id": "sp1", "time": 100}}]"#
        )
        .unwrap();

        let mut config = ScanConfig::new(ScanMode::SpawnTimed)
            .with_center(Location::new(40.0, -75.0))
            .with_workers(1)
            .with_spawn_file(file.path().to_path_buf());
        config.pacing.jitter_metres = None;

        let service = start(config, 1).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The queue was filled with the projected spawn target (or already
        // claimed by the worker waiting on its window).
        assert_ne!(service.overseer_state(), OverseerState::Initializing);

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_snapshot_task_emits_batches() {
        let mut config = hex_config(1);
        config.instance_name = Some("test-instance".to_string());
        config.status_snapshot_secs = 1;

        let service = start(config, 1).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let persistence = service.persistence_queue();
        let mut saw_snapshot = false;
        while let Some(batch) = persistence.try_pop() {
            if let UpsertBatch::StatusSnapshot { instance, workers, .. } = batch {
                assert_eq!(instance, "test-instance");
                assert_eq!(workers.len(), 1);
                saw_snapshot = true;
            }
        }
        assert!(saw_snapshot, "expected at least one status snapshot");

        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_relocation_updates_center() {
        let service = start(hex_config(1), 1).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        service.set_location(Location::new(41.0, -74.0));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(
            (*service.center.read()).map(|c| (c.lat, c.lng)),
            Some((41.0, -74.0))
        );

        service.shutdown().await;
    }
}
