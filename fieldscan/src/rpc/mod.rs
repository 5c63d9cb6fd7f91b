//! External collaborator interfaces.
//!
//! The scanning core never talks to the remote service, a database, or a
//! proxy list directly; it goes through the traits defined here. The remote
//! client is an opaque request/response stub — the wire protocol, session
//! simulation, and anti-automation concerns all live behind [`ScanClient`].
//!
//! Trait methods that do I/O return boxed futures so implementations stay
//! object-safe and mockable in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

use crate::accounts::AccountCredentials;
use crate::geo::Location;
use crate::worker::status::WorkerStatusSnapshot;

/// Boxed future alias for trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// =============================================================================
// Remote client stub
// =============================================================================

/// Authentication failures from the remote service.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The service rejected the credentials.
    #[error("authentication rejected for {username}")]
    Rejected {
        /// Identity that was refused.
        username: String,
    },

    /// The request never completed.
    #[error("authentication transport failure: {0}")]
    Transport(String),
}

/// Area-fetch failures from the remote service.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Timeout, connection reset, or similar transport-level failure.
    #[error("fetch transport failure: {0}")]
    Transport(String),

    /// The service answered with no usable content.
    #[error("empty response")]
    Empty,

    /// The response arrived but could not be decoded. Repeated occurrences
    /// usually mean the identity has been invalidated server-side.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A point event observed in a scan: something appeared at a spawn location
/// and will disappear at a known time.
#[derive(Clone, Debug, PartialEq)]
pub struct PointEvent {
    /// Spawn location identifier.
    pub spatial_id: String,
    /// Identifier of this particular occurrence.
    pub event_id: String,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Unix timestamp when the event disappears.
    pub expires_at: u64,
    /// Remaining decoded fields, forwarded verbatim to sinks.
    pub payload: Value,
}

/// Periodic state observed for a long-lived entity (e.g. a station).
#[derive(Clone, Debug, PartialEq)]
pub struct EntityState {
    /// Stable entity identifier.
    pub entity_id: String,
    /// Unix timestamp of the entity's last server-side modification.
    pub last_modified: u64,
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Remaining decoded fields, forwarded verbatim to sinks.
    pub payload: Value,
}

/// Decoded result of one area fetch.
#[derive(Clone, Debug, Default)]
pub struct AreaResponse {
    /// Point events visible in the scanned cell.
    pub point_events: Vec<PointEvent>,
    /// Entity states visible in the scanned cell.
    pub entity_states: Vec<EntityState>,
}

impl AreaResponse {
    /// Total number of decoded finds.
    pub fn find_count(&self) -> usize {
        self.point_events.len() + self.entity_states.len()
    }
}

/// Opaque remote-service client held by one worker.
///
/// One instance per worker session; a replacement identity gets a fresh
/// client from the [`ScanClientFactory`].
pub trait ScanClient: Send + Sync {
    /// Authenticates the session for `credentials`, optionally through a
    /// proxy.
    fn authenticate<'a>(
        &'a self,
        credentials: &'a AccountCredentials,
        proxy: Option<&'a ProxyEndpoint>,
    ) -> BoxFuture<'a, Result<(), AuthError>>;

    /// Fetches everything visible around `location`.
    fn fetch_area<'a>(&'a self, location: &'a Location) -> BoxFuture<'a, Result<AreaResponse, FetchError>>;

    /// Unix timestamp when the current authentication ticket expires, or
    /// `None` when no valid ticket is held. Lets workers skip needless
    /// re-authentication.
    fn ticket_expires_at(&self) -> Option<u64>;
}

/// Creates per-worker [`ScanClient`] sessions.
pub trait ScanClientFactory: Send + Sync {
    /// Builds a fresh client session.
    fn create_client(&self) -> Box<dyn ScanClient>;
}

// =============================================================================
// Proxy provider
// =============================================================================

/// One proxy endpoint URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEndpoint(pub String);

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How proxies are handed out across identity acquisitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProxyRotation {
    /// Every acquisition keeps the first proxy.
    #[default]
    None,
    /// Cycle through the list in order.
    RoundRobin,
    /// Pick uniformly at random.
    Random,
}

/// A fixed proxy list with a rotation policy.
///
/// Loading and health-checking the list is an external concern; the ring
/// only decides which entry the next worker session gets.
#[derive(Debug)]
pub struct ProxyRing {
    proxies: Vec<ProxyEndpoint>,
    rotation: ProxyRotation,
    cursor: AtomicUsize,
}

impl ProxyRing {
    /// Creates a ring over `proxies` with the given rotation policy.
    pub fn new(proxies: Vec<ProxyEndpoint>, rotation: ProxyRotation) -> Self {
        Self {
            proxies,
            rotation,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Returns the next proxy per the rotation policy, or `None` when the
    /// list is empty.
    pub fn get_proxy(&self) -> Option<ProxyEndpoint> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = match self.rotation {
            ProxyRotation::None => 0,
            ProxyRotation::RoundRobin => {
                self.cursor.fetch_add(1, Ordering::Relaxed) % self.proxies.len()
            }
            ProxyRotation::Random => rand::rng().random_range(0..self.proxies.len()),
        };
        Some(self.proxies[index].clone())
    }

    /// Number of configured proxies.
    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    /// True when no proxies are configured.
    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

// =============================================================================
// Persistence handoff
// =============================================================================

/// One batched upsert request for the persistence sink.
///
/// The sink (out of scope here) consumes these from a shared queue and is
/// expected to key upserts by each item's natural identifier.
#[derive(Clone, Debug)]
pub enum UpsertBatch {
    /// Point events from one scan.
    PointEvents(Vec<PointEvent>),
    /// Entity states from one scan.
    EntityStates(Vec<EntityState>),
    /// Periodic aggregate of worker/overseer status records.
    StatusSnapshot {
        /// Instance name the snapshot belongs to.
        instance: String,
        /// Overseer message at snapshot time.
        overseer_message: String,
        /// Per-worker counters and messages.
        workers: Vec<WorkerStatusSnapshot>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies(n: usize) -> Vec<ProxyEndpoint> {
        (0..n)
            .map(|i| ProxyEndpoint(format!("http://proxy-{}:3128", i)))
            .collect()
    }

    #[test]
    fn test_proxy_ring_empty() {
        let ring = ProxyRing::new(Vec::new(), ProxyRotation::RoundRobin);
        assert!(ring.get_proxy().is_none());
        assert!(ring.is_empty());
    }

    #[test]
    fn test_proxy_rotation_none_sticks_to_first() {
        let ring = ProxyRing::new(proxies(3), ProxyRotation::None);
        for _ in 0..5 {
            assert_eq!(ring.get_proxy().unwrap().0, "http://proxy-0:3128");
        }
    }

    #[test]
    fn test_proxy_rotation_round_robin_cycles() {
        let ring = ProxyRing::new(proxies(3), ProxyRotation::RoundRobin);
        let picked: Vec<String> = (0..6).map(|_| ring.get_proxy().unwrap().0).collect();
        assert_eq!(picked[0], "http://proxy-0:3128");
        assert_eq!(picked[1], "http://proxy-1:3128");
        assert_eq!(picked[2], "http://proxy-2:3128");
        assert_eq!(picked[3], "http://proxy-0:3128");
    }

    #[test]
    fn test_proxy_rotation_random_stays_in_range() {
        let ring = ProxyRing::new(proxies(4), ProxyRotation::Random);
        for _ in 0..50 {
            let proxy = ring.get_proxy().unwrap();
            assert!(proxy.0.starts_with("http://proxy-"));
        }
    }

    #[test]
    fn test_area_response_find_count() {
        let response = AreaResponse {
            point_events: vec![PointEvent {
                spatial_id: "sp1".into(),
                event_id: "ev1".into(),
                lat: 0.0,
                lng: 0.0,
                expires_at: 100,
                payload: serde_json::json!({}),
            }],
            entity_states: Vec::new(),
        };
        assert_eq!(response.find_count(), 1);
        assert_eq!(AreaResponse::default().find_count(), 0);
    }
}
