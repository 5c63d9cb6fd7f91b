//! FieldScan - coordinated geographic scanning with a pooled worker fleet.
//!
//! This library schedules visits to geographic coordinates and coordinates a
//! pool of worker identities that carry them out against a remote service,
//! respecting per-identity travel-speed cooldowns, re-authentication, and
//! anti-detection pacing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   targets   ┌──────────────┐   results   ┌─────────────┐
//! │ Overseer │ ──────────► │ Worker fleet │ ──────────► │ Dispatcher  │
//! │ (refill, │   queue     │ (identity,   │   queues    │ (dedup,     │
//! │  pause,  │             │  window,     │             │  delivery   │
//! │  move)   │             │  fetch,pace) │             │  fan-out)   │
//! └──────────┘             └──────┬───────┘             └─────────────┘
//!                                 │ claims
//!                          ┌──────▼──────┐
//!                          │ AccountPool │
//!                          └─────────────┘
//! ```
//!
//! Targets come from one of the [`config::ScanMode`] strategies: a static
//! hexagonal lattice around a center, or hour-periodic spawn points — in
//! plain appearance order or packed onto per-worker lanes under a maximum
//! travel speed by the [`planner`].
//!
//! The remote protocol, persistence schema, and webhook mechanics live
//! behind the traits in [`rpc`] and [`dispatch`]; the core never performs
//! wire I/O of its own.

pub mod accounts;
pub mod config;
pub mod dispatch;
pub mod geo;
pub mod planner;
pub mod queue;
pub mod rpc;
pub mod scheduler;
pub mod service;
pub mod spawns;
pub mod steps;
pub mod telemetry;
pub mod worker;

pub use accounts::{AccountCredentials, AccountPool, ClaimedAccount};
pub use config::{ScanConfig, ScanMode};
pub use geo::Location;
pub use scheduler::{OverseerState, ScanTarget};
pub use service::{ScanService, ServiceError};
pub use spawns::SpawnPoint;
