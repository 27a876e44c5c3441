//! In-memory vault for resident data keys.
//!
//! A user's DEK is resident only while that user has at least one unlocked
//! session. Entries are reference counted by session; the count reaching
//! zero wipes the entry, and an idle watchdog evicts entries nobody has
//! touched (default 30 minutes). Key bytes are zeroized before the memory
//! is released.
//!
//! Locking: the map itself is sharded (`DashMap`); a separate per-user
//! `tokio::Mutex` is handed out by [`DekVault::user_lock`] so password
//! changes can serialize against other requests of the same user without
//! blocking other tenants.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::wrap::Dek;
use crate::types::UserId;

/// Default idle eviction window (30 minutes).
pub const DEFAULT_IDLE_EVICT: Duration = Duration::from_secs(30 * 60);

struct VaultEntry {
    /// The resident data key (zeroized when the entry drops).
    dek: Dek,
    /// Last get/install touch, drives the idle watchdog.
    last_touch: Instant,
    /// Number of unlocked sessions holding this entry.
    ref_count: u32,
}

/// Per-user DEK residency with session reference counting.
pub struct DekVault {
    entries: DashMap<UserId, VaultEntry>,
    /// Per-user serialization locks (password change vs. in-flight requests).
    user_locks: DashMap<UserId, Arc<tokio::sync::Mutex<()>>>,
    idle_evict: Duration,
}

impl DekVault {
    pub fn new(idle_evict: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            user_locks: DashMap::new(),
            idle_evict,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_IDLE_EVICT)
    }

    /// Install a DEK for a user, incrementing the session reference count.
    ///
    /// A second unlocked session for the same user re-installs the same DEK;
    /// the entry is refreshed rather than duplicated.
    pub fn install(&self, user_id: &UserId, dek: Dek) {
        let mut entry = self.entries.entry(user_id.clone()).or_insert_with(|| VaultEntry {
            dek: dek.clone(),
            last_touch: Instant::now(),
            ref_count: 0,
        });
        entry.dek = dek;
        entry.ref_count += 1;
        entry.last_touch = Instant::now();
        debug!(user_id = %user_id, ref_count = entry.ref_count, "Installed data key");
    }

    /// Release one session's hold. The entry is wiped when the count hits zero.
    ///
    /// Returns true if the entry was evicted.
    pub fn release(&self, user_id: &UserId) -> bool {
        let evict = {
            let Some(mut entry) = self.entries.get_mut(user_id) else {
                return false;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.ref_count == 0
        };

        if evict {
            // Dek zeroizes on drop.
            self.entries.remove(user_id);
            debug!(user_id = %user_id, "Evicted data key (last session released)");
        }
        evict
    }

    /// Fetch the resident DEK, refreshing the idle clock. Returns None when
    /// the user has no unlocked session (the `locked-data` condition).
    pub fn get(&self, user_id: &UserId) -> Option<Dek> {
        let mut entry = self.entries.get_mut(user_id)?;
        entry.last_touch = Instant::now();
        Some(entry.dek.clone())
    }

    /// Whether a DEK is resident without touching the idle clock.
    pub fn contains(&self, user_id: &UserId) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Drop a user's entry regardless of reference count (revoke-all,
    /// password change, destructive reset).
    ///
    /// Returns true if an entry was present.
    pub fn evict(&self, user_id: &UserId) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Evict entries idle past the watchdog window. Returns the evicted user
    /// ids so the caller can cancel the unlocked bit on their sessions.
    pub fn sweep_idle(&self) -> Vec<UserId> {
        let cutoff = self.idle_evict;
        let mut evicted = Vec::new();
        self.entries.retain(|user_id, entry| {
            if entry.last_touch.elapsed() >= cutoff {
                evicted.push(user_id.clone());
                false
            } else {
                true
            }
        });
        for user_id in &evicted {
            debug!(user_id = %user_id, "Evicted idle data key");
        }
        evicted
    }

    /// Per-user serialization lock. Held across DEK re-wraps so a password
    /// change cannot interleave with requests decrypting under the old wrap.
    pub fn user_lock(&self, user_id: &UserId) -> Arc<tokio::sync::Mutex<()>> {
        self.user_locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
