//! Advisory resource leases.
//!
//! The scheduler treats resource tags as obstructions owned by someone else: it
//! asks a [`LockAuthority`] which keys are currently leased and skips any job
//! carrying one of them. It never acquires or releases a lease itself.
//!
//! [`LockManager`] is an in-process authority with TTL leases. Other systems
//! (a database, a coordination service) plug in by implementing
//! [`LockAuthority`].
//!
//! # Examples
//!
//! ```rust
//! use batchwork::lock::{LockAuthority, LockManager};
//! use std::time::Duration;
//!
//! let locks = LockManager::new();
//! let lease = locks.acquire("warehouse-db", Duration::from_secs(30)).unwrap();
//!
//! assert!(locks.is_locked("warehouse-db"));
//! assert!(locks.acquire("warehouse-db", Duration::from_secs(30)).is_err());
//!
//! locks.release(&lease).unwrap();
//! assert!(!locks.is_locked("warehouse-db"));
//! ```

use crate::{
    BatchworkError, Result,
    clock::{Clock, SystemClock},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use uuid::Uuid;

/// Remaining lifetime of one lease as reported by a [`LockAuthority`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub key: String,
    /// Zero once the lease has expired but has not been reaped yet.
    pub remaining: Duration,
}

impl LeaseStatus {
    pub fn is_active(&self) -> bool {
        !self.remaining.is_zero()
    }
}

/// Read-only view of externally held leases.
pub trait LockAuthority: Send + Sync {
    fn status(&self) -> Vec<LeaseStatus>;

    /// Keys with time left on their lease.
    fn locked_keys(&self) -> HashSet<String> {
        self.status()
            .into_iter()
            .filter(LeaseStatus::is_active)
            .map(|lease| lease.key)
            .collect()
    }

    fn is_locked(&self, key: &str) -> bool {
        self.status()
            .iter()
            .any(|lease| lease.key == key && lease.is_active())
    }
}

/// A tokenized, time-bounded claim on a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub key: String,
    pub expires_at: DateTime<Utc>,
    pub token: Uuid,
}

/// In-memory lease table.
#[derive(Debug, Clone)]
pub struct LockManager {
    leases: Arc<Mutex<HashMap<String, Lease>>>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take `key` for `ttl`. Fails while an unexpired lease exists; an
    /// expired one is replaced.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let mut leases = self.table();
        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Err(BatchworkError::LockHeld {
                    key: key.to_string(),
                });
            }
        }

        let lease = Lease {
            key: key.to_string(),
            expires_at: expiry(now, ttl),
            token: Uuid::new_v4(),
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(lease)
    }

    /// Drop a lease. Releasing a key that is no longer leased is a no-op; a
    /// lease replaced by another holder is rejected.
    pub fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.table();
        match leases.get(&lease.key) {
            None => Ok(()),
            Some(current) if current.token == lease.token => {
                leases.remove(&lease.key);
                Ok(())
            }
            Some(_) => Err(BatchworkError::LeaseMismatch {
                key: lease.key.clone(),
            }),
        }
    }

    /// Push the expiry of a held lease to `now + ttl`.
    pub fn extend(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = self.clock.now();
        let mut leases = self.table();
        match leases.get_mut(&lease.key) {
            Some(current) if current.token == lease.token => {
                current.expires_at = expiry(now, ttl);
                Ok(current.clone())
            }
            _ => Err(BatchworkError::LeaseMismatch {
                key: lease.key.clone(),
            }),
        }
    }

    /// Remove expired leases, returning how many were dropped.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now();
        let mut leases = self.table();
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at > now);
        before - leases.len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockAuthority for LockManager {
    fn status(&self) -> Vec<LeaseStatus> {
        let now = self.clock.now();
        self.table()
            .values()
            .map(|lease| LeaseStatus {
                key: lease.key.clone(),
                remaining: (lease.expires_at - now).to_std().unwrap_or(Duration::ZERO),
            })
            .collect()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
