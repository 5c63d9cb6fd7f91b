//! Shared status records for workers and the overseer.
//!
//! Each record is written only by its owning task and read by external
//! collectors (status snapshots, telemetry). Counters are atomics; the
//! free-form message sits behind a short-lived mutex.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Live status of one scan worker.
#[derive(Debug, Default)]
pub struct WorkerStatus {
    username: Mutex<String>,
    proxy: Mutex<Option<String>>,
    message: Mutex<String>,
    success: AtomicU64,
    fail: AtomicU64,
    empty: AtomicU64,
    skip: AtomicU64,
}

impl WorkerStatus {
    /// Creates an empty status record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the identity shown for this worker.
    pub fn set_username(&self, username: &str) {
        *self.username.lock() = username.to_string();
    }

    /// Replaces the proxy shown for this worker.
    pub fn set_proxy(&self, proxy: Option<String>) {
        *self.proxy.lock() = proxy;
    }

    /// Replaces the status message.
    pub fn set_message(&self, message: impl Into<String>) {
        *self.message.lock() = message.into();
    }

    /// Records a scan with finds.
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed scan attempt.
    pub fn record_fail(&self) {
        self.fail.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a scan that found nothing.
    pub fn record_empty(&self) {
        self.empty.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a skipped target.
    pub fn record_skip(&self) {
        self.skip.fetch_add(1, Ordering::Relaxed);
    }

    /// Consecutive-failure window reset on a fresh identity lease.
    pub fn reset_counters(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.fail.store(0, Ordering::Relaxed);
        self.empty.store(0, Ordering::Relaxed);
        self.skip.store(0, Ordering::Relaxed);
    }

    /// Current failure count for this lease.
    pub fn failures(&self) -> u64 {
        self.fail.load(Ordering::Relaxed)
    }

    /// Takes a point-in-time copy for display or persistence.
    pub fn snapshot(&self) -> WorkerStatusSnapshot {
        WorkerStatusSnapshot {
            username: self.username.lock().clone(),
            proxy: self.proxy.lock().clone(),
            message: self.message.lock().clone(),
            success: self.success.load(Ordering::Relaxed),
            fail: self.fail.load(Ordering::Relaxed),
            empty: self.empty.load(Ordering::Relaxed),
            skip: self.skip.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a worker's status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerStatusSnapshot {
    /// Identity the worker currently holds.
    pub username: String,
    /// Proxy in use, if any.
    pub proxy: Option<String>,
    /// Last status message.
    pub message: String,
    /// Scans with finds this lease.
    pub success: u64,
    /// Failed attempts this lease.
    pub fail: u64,
    /// Empty scans this lease.
    pub empty: u64,
    /// Skipped targets this lease.
    pub skip: u64,
}

/// Live status of the overseer.
#[derive(Debug)]
pub struct OverseerStatus {
    method: Mutex<String>,
    message: Mutex<String>,
}

impl OverseerStatus {
    /// Creates a status record announcing the given scheduling method.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: Mutex::new(method.into()),
            message: Mutex::new("Initializing".to_string()),
        }
    }

    /// Replaces the status message.
    pub fn set_message(&self, message: impl Into<String>) {
        *self.message.lock() = message.into();
    }

    /// The scheduling method name.
    pub fn method(&self) -> String {
        self.method.lock().clone()
    }

    /// The current status message.
    pub fn message(&self) -> String {
        self.message.lock().clone()
    }
}
