//! Scan scheduling.
//!
//! The [`Overseer`] owns the shared target queue and keeps it fed. It never
//! performs network I/O itself — its entire job is reacting to three
//! signals at one-second granularity:
//!
//! - **pause**: drain the queue and idle until resumed,
//! - **relocation**: drain, hand the new center to the strategy, refill,
//! - **queue empty**: every target was claimed; start the next cycle.
//!
//! Targets flow one way: strategy → queue → workers. Re-delivery only
//! happens when a whole cycle is regenerated.

pub mod strategy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::geo::Location;
use crate::queue::SharedQueue;
use crate::worker::status::OverseerStatus;

pub use strategy::{ScanStrategy, SCAN_ALTITUDE_M};

/// Overseer tick interval.
const TICK: Duration = Duration::from_secs(1);

/// One coordinate to visit, with an optional validity window.
///
/// Immutable once enqueued; consumed exactly once per scheduling cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanTarget {
    /// Position in the generation order, 1-based. Display only.
    pub step: usize,

    /// Where to scan.
    pub location: Location,

    /// Unix timestamp before which the scan is premature, if any.
    pub appears_at: Option<u64>,

    /// Unix timestamp after which the scan is pointless, if any.
    pub leaves_at: Option<u64>,
}

/// Overseer lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverseerState {
    /// Not yet running.
    Initializing,
    /// Generating targets and filling the queue.
    FillingQueue,
    /// Queue has targets; workers are draining it.
    QueueActive,
    /// Pause signal set; queue held empty.
    Paused,
    /// A new center arrived; strategy is being re-aimed.
    Relocating,
}

/// Shared, externally readable overseer state.
#[derive(Clone, Debug)]
pub struct SharedOverseerState(Arc<Mutex<OverseerState>>);

impl SharedOverseerState {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(OverseerState::Initializing)))
    }

    fn set(&self, state: OverseerState) {
        *self.0.lock() = state;
    }

    /// Current overseer state.
    pub fn get(&self) -> OverseerState {
        *self.0.lock()
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// The scheduling control task.
pub struct Overseer {
    strategy: ScanStrategy,
    queue: Arc<SharedQueue<ScanTarget>>,
    pause: Arc<AtomicBool>,
    location_rx: mpsc::UnboundedReceiver<Location>,
    status: Arc<OverseerStatus>,
    state: SharedOverseerState,
    scan_current_enabled: bool,
    include_current: bool,
}

impl Overseer {
    /// Creates an overseer over the given strategy and queue.
    ///
    /// `scan_current_enabled` arms the include-already-started-events
    /// behavior for the first fill after startup, pause, or relocation.
    pub fn new(
        strategy: ScanStrategy,
        queue: Arc<SharedQueue<ScanTarget>>,
        pause: Arc<AtomicBool>,
        location_rx: mpsc::UnboundedReceiver<Location>,
        status: Arc<OverseerStatus>,
        scan_current_enabled: bool,
    ) -> Self {
        Self {
            strategy,
            queue,
            pause,
            location_rx,
            status,
            state: SharedOverseerState::new(),
            scan_current_enabled,
            include_current: scan_current_enabled,
        }
    }

    /// Handle for reading the overseer's state from other tasks.
    pub fn state_handle(&self) -> SharedOverseerState {
        self.state.clone()
    }

    /// Runs until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Search overseer starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if self.pause.load(Ordering::Relaxed) {
                self.on_paused();
                if !tick(&shutdown).await {
                    break;
                }
                continue;
            }

            if let Some(location) = self.latest_location() {
                self.on_relocated(location);
            }

            if self.queue.is_empty() {
                self.fill_queue();
            } else {
                self.report_next_target();
            }

            if !tick(&shutdown).await {
                break;
            }
        }

        info!("Search overseer stopped");
    }

    fn on_paused(&mut self) {
        let drained = self.queue.drain();
        if drained > 0 {
            debug!(drained, "Drained queue for pause");
        }
        self.strategy.scanning_paused();
        self.status.set_message("Scanning is paused");
        self.state.set(OverseerState::Paused);
        if self.scan_current_enabled {
            self.include_current = true;
        }
    }

    /// Most recent location from the channel, discarding older ones.
    fn latest_location(&mut self) -> Option<Location> {
        let mut newest = None;
        while let Ok(location) = self.location_rx.try_recv() {
            newest = Some(location);
        }
        newest
    }

    fn on_relocated(&mut self, location: Location) {
        info!(%location, "New location caught, moving scan area");
        self.state.set(OverseerState::Relocating);
        if self.scan_current_enabled {
            self.include_current = true;
        }

        let drained = self.queue.drain();
        if drained > 0 {
            debug!(drained, "Drained queue for relocation");
        }
        self.strategy.location_changed(location);
    }

    fn fill_queue(&mut self) {
        debug!("Scan queue empty, starting next cycle");
        self.state.set(OverseerState::FillingQueue);
        self.status.set_message("Queuing steps");

        let queued = self
            .strategy
            .schedule(&self.queue, unix_now(), self.include_current);

        if queued == 0 {
            warn!("Nothing to scan!");
        }
        if self.strategy.is_time_windowed() {
            self.include_current = false;
        }

        self.state.set(OverseerState::QueueActive);
    }

    fn report_next_target(&mut self) {
        self.state.set(OverseerState::QueueActive);

        let message = self.queue.peek_front_with(|front| {
            front.map(|target| {
                let mut message = format!(
                    "Processing search queue, next item is {}",
                    target.location
                );
                if let Some(appears) = target.appears_at {
                    let now = unix_now();
                    if appears > now {
                        message.push_str(&format!(" ({}s ahead)", appears - now));
                    } else {
                        message.push_str(&format!(" ({}s behind)", now - appears));
                    }
                }
                message
            })
        });

        if let Some(message) = message {
            self.status.set_message(message);
        }
    }
}

/// Sleeps one tick; returns `false` when shutdown fired instead.
async fn tick(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;

        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(TICK) => true,
    }
}
