//! Scan workers.
//!
//! One [`WorkerCoordinator`] per worker slot. Each holds a claimed identity
//! and loops: pull a target from the shared queue, wait out its validity
//! window, fetch the area through the remote-client stub, hand results to
//! the output queues, then pace. Failures never cross worker boundaries —
//! a worker that keeps failing swaps its identity out and carries on.
//!
//! Every sleep is sliced at one-second granularity so the pause signal and
//! shutdown token stay responsive.

pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::accounts::{AccountPool, ClaimedAccount};
use crate::config::{LoginConfig, PacingConfig};
use crate::dispatch::OutputItem;
use crate::geo::{self, Location};
use crate::queue::SharedQueue;
use crate::rpc::{AreaResponse, FetchError, ProxyEndpoint, ScanClient, ScanClientFactory, UpsertBatch};
use crate::scheduler::{unix_now, ScanTarget};
use crate::telemetry::ScanMetrics;

use status::WorkerStatus;

/// Everything a worker shares with the rest of the service.
#[derive(Clone)]
pub struct WorkerHandles {
    /// Identity registry.
    pub accounts: Arc<AccountPool>,
    /// Account set this worker claims from.
    pub account_set: String,
    /// Shared scan-target queue.
    pub target_queue: Arc<SharedQueue<ScanTarget>>,
    /// Queue of batched upserts for the persistence sink.
    pub persistence_queue: Arc<SharedQueue<UpsertBatch>>,
    /// Ingress queue of the output dispatcher.
    pub output_queue: Arc<SharedQueue<OutputItem>>,
    /// Global pause signal.
    pub pause: Arc<AtomicBool>,
    /// Current scan center, used when claiming identities.
    pub center: Arc<RwLock<Option<Location>>>,
    /// Aggregate metrics.
    pub metrics: Arc<ScanMetrics>,
    /// Factory for per-lease client sessions.
    pub client_factory: Arc<dyn ScanClientFactory>,
    /// Proxy list, if any.
    pub proxies: Option<Arc<crate::rpc::ProxyRing>>,
}

/// Why an identity lease ended.
enum LeaseEnd {
    /// Too many consecutive failures; the identity must be replaced.
    Escalated,
    /// Shutdown was signalled.
    Shutdown,
}

/// Outcome of waiting for a target's window to open.
enum WindowWait {
    /// The window is open (or was never in the future).
    Ready,
    /// The pause signal fired mid-wait; the target is forfeited.
    Paused,
    /// Shutdown was signalled.
    Shutdown,
}

/// Result of making sure the session is authenticated.
enum LoginResult {
    Ok,
    AttemptsExceeded,
    Shutdown,
}

/// One scan worker's control loop.
pub struct WorkerCoordinator {
    index: usize,
    total_workers: usize,
    handles: WorkerHandles,
    status: Arc<WorkerStatus>,
    pacing: PacingConfig,
    login: LoginConfig,
    max_failures: u32,
}

impl WorkerCoordinator {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        total_workers: usize,
        handles: WorkerHandles,
        status: Arc<WorkerStatus>,
        pacing: PacingConfig,
        login: LoginConfig,
        max_failures: u32,
    ) -> Self {
        Self {
            index,
            total_workers,
            handles,
            status,
            pacing,
            login,
            max_failures,
        }
    }

    /// Runs until `shutdown` fires.
    ///
    /// Acquires an identity, runs scan leases on it, and replaces it
    /// whenever a lease escalates. No failure inside a lease ever
    /// terminates the worker.
    pub async fn run(self, shutdown: CancellationToken) {
        self.stagger_start(&shutdown).await;
        debug!(worker = self.index, "Search worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let Some(account) = self.acquire_identity(&shutdown).await else {
                break;
            };

            self.status.set_username(account.username());
            // Fresh lease: the consecutive-failure window starts over.
            self.status.reset_counters();

            let client = self.handles.client_factory.create_client();
            let proxy = self.handles.proxies.as_ref().and_then(|ring| ring.get_proxy());
            self.status
                .set_proxy(proxy.as_ref().map(|p| p.0.clone()));
            if let Some(ref proxy) = proxy {
                debug!(
                    worker = self.index,
                    proxy = %proxy,
                    username = account.username(),
                    "Using proxy for identity"
                );
            }

            match self
                .run_lease(&account, client.as_ref(), proxy.as_ref(), &shutdown)
                .await
            {
                LeaseEnd::Escalated => {
                    // Deactivation clears the claim; the loop acquires a
                    // replacement.
                    self.handles
                        .accounts
                        .deactivate(&account.set_name, account.username());
                }
                LeaseEnd::Shutdown => {
                    self.handles
                        .accounts
                        .release(&account.set_name, account.username());
                    break;
                }
            }
        }

        debug!(worker = self.index, "Search worker stopped");
    }

    /// Spreads worker start-up so logins arrive roughly one second apart.
    async fn stagger_start(&self, shutdown: &CancellationToken) {
        if self.total_workers <= 1 || self.index == 0 {
            return;
        }
        let spread = (rand::random::<f64>() - 0.5) / 2.0;
        let delay = (self.index as f64 + spread).max(0.0);
        debug!(
            worker = self.index,
            delay = format!("{:.2}", delay),
            "Delaying worker startup"
        );

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
        }
    }

    /// Polls the pool until an identity is available.
    ///
    /// Returns `None` only on shutdown.
    async fn acquire_identity(&self, shutdown: &CancellationToken) -> Option<ClaimedAccount> {
        loop {
            if shutdown.is_cancelled() {
                return None;
            }

            let near = (*self.handles.center.read()).unwrap_or(Location::new(0.0, 0.0));

            if let Some(account) = self.handles.accounts.next(&self.handles.account_set, &near) {
                return Some(account);
            }

            self.status.set_message("Waiting for a free identity");
            if !sleep_secs(1, shutdown).await {
                return None;
            }
        }
    }

    /// Scans targets on one identity until escalation or shutdown.
    async fn run_lease(
        &self,
        account: &ClaimedAccount,
        client: &dyn ScanClient,
        proxy: Option<&ProxyEndpoint>,
        shutdown: &CancellationToken,
    ) -> LeaseEnd {
        let mut consecutive_failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return LeaseEnd::Shutdown;
            }

            if consecutive_failures >= self.max_failures {
                let message = format!(
                    "Worker {} failed more than {} scans; identity may be flagged",
                    account.username(),
                    self.max_failures
                );
                error!("{}", message);
                self.status.set_message(message);
                return LeaseEnd::Escalated;
            }

            while self.handles.pause.load(Ordering::Relaxed) {
                self.status.set_message("Scanning paused");
                if !sleep_secs(2, shutdown).await {
                    return LeaseEnd::Shutdown;
                }
            }

            self.status.set_message("Waiting for item from queue");
            let Some(target) = self
                .handles
                .target_queue
                .pop_cancellable(shutdown)
                .await
            else {
                return LeaseEnd::Shutdown;
            };

            if let Some(appears) = target.appears_at {
                match self.await_window(&target, appears, shutdown).await {
                    WindowWait::Ready => {}
                    // Forfeit the target; the overseer is draining anyway.
                    WindowWait::Paused => continue,
                    WindowWait::Shutdown => return LeaseEnd::Shutdown,
                }
            }

            if let Some(leaves) = target.leaves_at {
                if unix_now() > leaves.saturating_sub(self.pacing.min_seconds_left) {
                    self.status.record_skip();
                    self.handles.metrics.target_skipped();
                    let message =
                        format!("Too late for location {}; skipping", target.location);
                    info!("{}", message);
                    self.status.set_message(message);
                    // No pacing sleep: nothing was requested, and the lane
                    // is clearly behind.
                    continue;
                }
            }

            self.status
                .set_message(format!("Searching at {}", target.location));

            match self.ensure_login(account, client, proxy, shutdown).await {
                LoginResult::Ok => {}
                LoginResult::AttemptsExceeded => {
                    consecutive_failures += 1;
                    self.status.record_fail();
                    self.handles
                        .accounts
                        .record_failure(&account.set_name, account.username());
                    if !self.cooldown(shutdown).await {
                        return LeaseEnd::Shutdown;
                    }
                    continue;
                }
                LoginResult::Shutdown => return LeaseEnd::Shutdown,
            }

            let scan_location = self.jittered(&target.location);
            match client.fetch_area(&scan_location).await {
                Ok(response) => {
                    consecutive_failures = 0;
                    self.on_response(&target, response);
                }
                Err(FetchError::Malformed(detail)) => {
                    // Distinct from transport noise: repeated parse failures
                    // usually mean the identity was invalidated server-side.
                    consecutive_failures += 1;
                    self.status.record_fail();
                    self.handles.metrics.scan_failed();
                    self.handles
                        .accounts
                        .record_failure(&account.set_name, account.username());
                    let message = format!(
                        "Response parse failed at {}, abandoning location; {} may be invalid",
                        target.location,
                        account.username()
                    );
                    error!(detail = %detail, "{}", message);
                    self.status.set_message(message);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.status.record_fail();
                    self.handles.metrics.scan_failed();
                    self.handles
                        .accounts
                        .record_failure(&account.set_name, account.username());
                    let message = format!(
                        "Invalid response at {}, abandoning location",
                        target.location
                    );
                    error!(error = %e, "{}", message);
                    self.status.set_message(message);
                }
            }

            // Pacing runs after every execution attempt, success or not.
            if !self.cooldown(shutdown).await {
                return LeaseEnd::Shutdown;
            }
        }
    }

    /// Sleeps until the target's window opens, watching pause and shutdown.
    async fn await_window(
        &self,
        target: &ScanTarget,
        appears: u64,
        shutdown: &CancellationToken,
    ) -> WindowWait {
        let mut first_loop = true;
        while unix_now() < appears {
            if self.handles.pause.load(Ordering::Relaxed) {
                return WindowWait::Paused;
            }

            let remaining = appears - unix_now();
            let message = format!(
                "Early for {}; waiting {}s",
                target.location, remaining
            );
            if first_loop {
                info!("{}", message);
                first_loop = false;
            }
            self.status.set_message(message);

            if !sleep_secs(1, shutdown).await {
                return WindowWait::Shutdown;
            }
        }
        WindowWait::Ready
    }

    /// Re-authenticates only when the current ticket is about to lapse.
    async fn ensure_login(
        &self,
        account: &ClaimedAccount,
        client: &dyn ScanClient,
        proxy: Option<&ProxyEndpoint>,
        shutdown: &CancellationToken,
    ) -> LoginResult {
        if let Some(expiry) = client.ticket_expires_at() {
            let remaining = expiry.saturating_sub(unix_now());
            if remaining > 60 {
                debug!(
                    remaining,
                    "Credentials remain valid, skipping re-authentication"
                );
                return LoginResult::Ok;
            }
        }

        let mut attempts: u32 = 0;
        loop {
            match client.authenticate(&account.credentials, proxy).await {
                Ok(()) => {
                    debug!(username = account.username(), "Login successful");
                    return LoginResult::Ok;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts > self.login.retries {
                        error!(
                            username = account.username(),
                            attempts, "Exceeded login attempts, giving up on identity"
                        );
                        return LoginResult::AttemptsExceeded;
                    }
                    error!(
                        username = account.username(),
                        error = %e,
                        retry_in = self.login.delay_secs,
                        "Failed to login, trying again"
                    );
                    if !sleep_secs(self.login.delay_secs, shutdown).await {
                        return LoginResult::Shutdown;
                    }
                }
            }
        }
    }

    /// Pushes a successful response into the persistence and output queues.
    fn on_response(&self, target: &ScanTarget, response: AreaResponse) {
        let finds = response.find_count();
        if finds > 0 {
            self.status.record_success();
            self.handles.metrics.scan_succeeded();
        } else {
            self.status.record_empty();
            self.handles.metrics.scan_empty();
        }

        if !response.point_events.is_empty() {
            for event in &response.point_events {
                self.handles.output_queue.push(OutputItem::point_event(event));
            }
            self.handles
                .persistence_queue
                .push(UpsertBatch::PointEvents(response.point_events));
        }
        if !response.entity_states.is_empty() {
            for state in &response.entity_states {
                self.handles.output_queue.push(OutputItem::entity_state(state));
            }
            self.handles
                .persistence_queue
                .push(UpsertBatch::EntityStates(response.entity_states));
        }

        self.handles.metrics.events_dispatched(finds as u64);
        self.status.set_message(format!(
            "Search at {} completed with {} finds",
            target.location, finds
        ));
    }

    /// Unconditional pacing delay; false means shutdown fired.
    async fn cooldown(&self, shutdown: &CancellationToken) -> bool {
        sleep_secs(self.pacing.scan_delay_secs, shutdown).await
    }

    fn jittered(&self, location: &Location) -> Location {
        match self.pacing.jitter_metres {
            Some(max_metres) => {
                let jittered = geo::jitter(location, max_metres, &mut rand::rng());
                debug!(from = %location, to = %jittered, "Jittered scan position");
                jittered
            }
            None => *location,
        }
    }
}

/// Sleeps `secs` seconds in one-second slices; false means shutdown fired.
async fn sleep_secs(secs: u64, shutdown: &CancellationToken) -> bool {
    for _ in 0..secs {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
    true
}
