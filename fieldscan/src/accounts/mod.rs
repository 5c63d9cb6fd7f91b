//! Worker identity registry.
//!
//! The [`AccountPool`] owns every worker identity and hands them out one at
//! a time. Identities are grouped into named sets (e.g. a regular set and a
//! high-tier set); a claim scans the requested set in stored order and
//! returns the first identity that is free, unflagged, and physically able
//! to reach the target coordinates without exceeding the configured travel
//! speed since its last scan.
//!
//! The eligibility check and the claim are a single critical section — two
//! concurrent callers can never walk away with the same identity. "No
//! identity available" is an ordinary outcome, not an error; callers back
//! off and retry.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::geo::{self, Location};

/// Credentials for one remote identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountCredentials {
    /// Login name, unique within a set.
    pub username: String,
    /// Login secret.
    pub password: String,
    /// Authentication backend identifier (e.g. "ptc", "google").
    pub auth_service: String,
}

/// A claimed identity, valid until released or deactivated.
///
/// Carries everything a worker needs to authenticate; bookkeeping stays
/// inside the pool.
#[derive(Clone, Debug)]
pub struct ClaimedAccount {
    /// Set the identity was claimed from.
    pub set_name: String,
    /// The identity's credentials.
    pub credentials: AccountCredentials,
}

impl ClaimedAccount {
    /// The claimed identity's username.
    pub fn username(&self) -> &str {
        &self.credentials.username
    }
}

/// Errors from pool-set management.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AccountPoolError {
    /// A set with this name already exists.
    #[error("account set '{0}' is being created twice")]
    DuplicateSet(String),

    /// No set with this name exists.
    #[error("unknown account set '{0}'")]
    UnknownSet(String),
}

/// Internal per-identity state.
#[derive(Clone, Debug)]
struct Account {
    credentials: AccountCredentials,
    in_use: bool,
    captcha_flagged: bool,
    active: bool,
    failures: u32,
    last_scan_time: Option<f64>,
    last_scan_location: Option<Location>,
    scans_this_hour: u32,
    spins_this_hour: u32,
}

impl Account {
    fn new(credentials: AccountCredentials) -> Self {
        Self {
            credentials,
            in_use: false,
            captcha_flagged: false,
            active: true,
            failures: 0,
            last_scan_time: None,
            last_scan_location: None,
            scans_this_hour: 0,
            spins_this_hour: 0,
        }
    }
}

/// Point-in-time view of one identity, for status display.
#[derive(Clone, Debug)]
pub struct AccountSnapshot {
    /// Login name.
    pub username: String,
    /// Currently claimed by a worker.
    pub in_use: bool,
    /// Flagged by a captcha challenge.
    pub captcha_flagged: bool,
    /// Still in rotation.
    pub active: bool,
    /// Cumulative failure count.
    pub failures: u32,
    /// Scans performed in the current hour.
    pub scans_this_hour: u32,
}

/// Thread-safe registry of worker identities.
pub struct AccountPool {
    sets: Mutex<HashMap<String, Vec<Account>>>,
    max_speed_kmph: f64,
    epoch: Instant,
}

impl AccountPool {
    /// Creates an empty pool with the given travel-speed limit.
    pub fn new(max_speed_kmph: f64) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            max_speed_kmph,
            epoch: Instant::now(),
        }
    }

    /// Registers a named set of identities.
    pub fn create_set(
        &self,
        name: &str,
        identities: Vec<AccountCredentials>,
    ) -> Result<(), AccountPoolError> {
        let mut sets = self.sets.lock();
        if sets.contains_key(name) {
            return Err(AccountPoolError::DuplicateSet(name.to_string()));
        }

        info!(set = name, count = identities.len(), "Registered account set");
        sets.insert(
            name.to_string(),
            identities.into_iter().map(Account::new).collect(),
        );
        Ok(())
    }

    /// Claims the next identity able to scan `target`.
    ///
    /// Returns `None` when every identity is busy, flagged, out of rotation,
    /// or still cooling down from its last scan. The caller should back off
    /// and poll again.
    pub fn next(&self, set_name: &str, target: &Location) -> Option<ClaimedAccount> {
        self.next_at(set_name, target, self.now_secs())
    }

    /// Deterministic claim entry point; `now_secs` is seconds since the
    /// pool's epoch. [`Self::next`] delegates here with the wall clock.
    pub fn next_at(&self, set_name: &str, target: &Location, now_secs: f64) -> Option<ClaimedAccount> {
        let mut sets = self.sets.lock();
        let accounts = match sets.get_mut(set_name) {
            Some(accounts) => accounts,
            None => {
                error!(set = set_name, "Claim against unknown account set");
                return None;
            }
        };

        for account in accounts.iter_mut() {
            if account.in_use || account.captcha_flagged || !account.active {
                continue;
            }

            // Travel-speed cooldown: an identity cannot plausibly reach the
            // target faster than max_speed_kmph allows.
            if let Some(last_time) = account.last_scan_time {
                let from = account.last_scan_location.unwrap_or(*target);
                let distance_km = geo::equirect_distance(&from, target);
                let cooldown_secs = distance_km / self.max_speed_kmph * 3600.0;

                if now_secs - last_time < cooldown_secs {
                    continue;
                }
            }

            account.in_use = true;
            account.last_scan_time = Some(now_secs);
            account.last_scan_location = Some(*target);
            account.scans_this_hour += 1;

            debug!(
                set = set_name,
                username = %account.credentials.username,
                "Claimed identity"
            );
            return Some(ClaimedAccount {
                set_name: set_name.to_string(),
                credentials: account.credentials.clone(),
            });
        }

        None
    }

    /// Releases a claimed identity back to the pool.
    ///
    /// Releasing an identity that is not marked in use is a programmer
    /// error; it is logged and otherwise ignored.
    pub fn release(&self, set_name: &str, username: &str) {
        let mut sets = self.sets.lock();
        let Some(account) = Self::find(&mut sets, set_name, username) else {
            error!(set = set_name, username, "Released an unknown identity");
            return;
        };

        if !account.in_use {
            error!(
                set = set_name,
                username, "Released an identity that wasn't claimed"
            );
            return;
        }
        account.in_use = false;
    }

    /// Removes an identity from rotation.
    ///
    /// Deactivated identities are never claimed again; re-enabling is a
    /// manual operation outside this process.
    pub fn deactivate(&self, set_name: &str, username: &str) {
        let mut sets = self.sets.lock();
        if let Some(account) = Self::find(&mut sets, set_name, username) {
            account.active = false;
            account.in_use = false;
            info!(set = set_name, username, "Deactivated identity");
        } else {
            error!(set = set_name, username, "Deactivated an unknown identity");
        }
    }

    /// Flags an identity as captcha-challenged and takes it out of rotation.
    pub fn flag_captcha(&self, set_name: &str, username: &str) {
        let mut sets = self.sets.lock();
        if let Some(account) = Self::find(&mut sets, set_name, username) {
            account.captcha_flagged = true;
            account.in_use = false;
            info!(set = set_name, username, "Identity flagged by captcha");
        }
    }

    /// Records a scan failure against an identity.
    pub fn record_failure(&self, set_name: &str, username: &str) {
        let mut sets = self.sets.lock();
        if let Some(account) = Self::find(&mut sets, set_name, username) {
            account.failures += 1;
        }
    }

    /// Resets the hourly scan/spin counters for every identity in the set.
    ///
    /// Called at pool-cycle start.
    pub fn reset_hourly_counters(&self, set_name: &str) {
        let mut sets = self.sets.lock();
        if let Some(accounts) = sets.get_mut(set_name) {
            for account in accounts.iter_mut() {
                account.scans_this_hour = 0;
                account.spins_this_hour = 0;
            }
        }
    }

    /// Number of identities in a set still in rotation and unflagged.
    pub fn usable_count(&self, set_name: &str) -> usize {
        let sets = self.sets.lock();
        sets.get(set_name)
            .map(|accounts| {
                accounts
                    .iter()
                    .filter(|a| a.active && !a.captcha_flagged)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Snapshots every identity in a set for status display.
    pub fn snapshot(&self, set_name: &str) -> Vec<AccountSnapshot> {
        let sets = self.sets.lock();
        sets.get(set_name)
            .map(|accounts| {
                accounts
                    .iter()
                    .map(|a| AccountSnapshot {
                        username: a.credentials.username.clone(),
                        in_use: a.in_use,
                        captcha_flagged: a.captcha_flagged,
                        active: a.active,
                        failures: a.failures,
                        scans_this_hour: a.scans_this_hour,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Seconds elapsed since the pool was created.
    pub fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn find<'a>(
        sets: &'a mut HashMap<String, Vec<Account>>,
        set_name: &str,
        username: &str,
    ) -> Option<&'a mut Account> {
        sets.get_mut(set_name)?
            .iter_mut()
            .find(|a| a.credentials.username == username)
    }
}

impl std::fmt::Debug for AccountPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sets = self.sets.lock();
        let mut dbg = f.debug_struct("AccountPool");
        dbg.field("max_speed_kmph", &self.max_speed_kmph);
        for (name, accounts) in sets.iter() {
            dbg.field(name, &accounts.len());
        }
        dbg.finish()
    }
}
