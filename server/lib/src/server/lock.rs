//! Per DN read/write locks for the write pipelines.
//!
//! A lock is taken by DN and held through a [`LockGuard`]. Several readers may
//! share a DN, a writer excludes everyone else. Acquisition is attempted a
//! bounded number of times, waiting up to the configured backoff between
//! attempts for another holder to release, and reports contention as `None`
//! rather than blocking indefinitely. Slots are created on first use and
//! removed when their last holder releases, so the table only ever holds DNs
//! that are currently locked.
//!
//! When an operation needs two locks the pre-existing entry is always locked
//! first, then the entry being created or moved into.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockKind::Read => "read",
            LockKind::Write => "write",
        })
    }
}

#[derive(Debug, Default)]
struct LockSlot {
    readers: u32,
    writer: bool,
}

impl LockSlot {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }

    fn try_take(&mut self, kind: LockKind) -> bool {
        match kind {
            LockKind::Read if !self.writer => {
                self.readers += 1;
                true
            }
            LockKind::Write if self.is_free() => {
                self.writer = true;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, kind: LockKind) {
        match kind {
            LockKind::Read => self.readers = self.readers.saturating_sub(1),
            LockKind::Write => self.writer = false,
        }
    }
}

struct LockTable {
    slots: Mutex<HashMap<Dn, LockSlot>>,
    changed: Condvar,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Counters of lock activity. Once every operation has finished the two are
/// equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    pub acquired: u64,
    pub released: u64,
}

pub struct LockManager {
    table: Arc<LockTable>,
    attempts: u32,
    backoff: Duration,
}

/// A held lock. Dropping the guard releases it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    table: Arc<LockTable>,
    dn: Dn,
    kind: LockKind,
}

impl LockGuard {
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("dn", &self.dn.to_string())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut slots = self.table.slots.lock();
        if let Some(slot) = slots.get_mut(&self.dn) {
            slot.release(self.kind);
            if slot.is_free() {
                slots.remove(&self.dn);
            }
        }
        drop(slots);
        self.table.released.fetch_add(1, Ordering::Relaxed);
        self.table.changed.notify_all();
        lock_trace!(dn = %self.dn, kind = %self.kind, "lock released");
    }
}

impl LockManager {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        LockManager {
            table: Arc::new(LockTable {
                slots: Mutex::new(HashMap::new()),
                changed: Condvar::new(),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn lock_read(&self, dn: &Dn) -> Option<LockGuard> {
        self.acquire(dn, LockKind::Read)
    }

    pub fn lock_write(&self, dn: &Dn) -> Option<LockGuard> {
        self.acquire(dn, LockKind::Write)
    }

    /// Release a lock. Equivalent to dropping the guard.
    pub fn unlock(&self, guard: LockGuard) {
        drop(guard)
    }

    fn acquire(&self, dn: &Dn, kind: LockKind) -> Option<LockGuard> {
        let mut slots = self.table.slots.lock();
        for attempt in 1..=self.attempts {
            let taken = slots.entry(dn.clone()).or_default().try_take(kind);
            if taken {
                self.table.acquired.fetch_add(1, Ordering::Relaxed);
                lock_trace!(%dn, %kind, attempt, "lock acquired");
                return Some(LockGuard {
                    table: self.table.clone(),
                    dn: dn.clone(),
                    kind,
                });
            }
            if attempt < self.attempts {
                let _ = self.table.changed.wait_for(&mut slots, self.backoff);
            }
        }
        lock_trace!(%dn, %kind, attempts = self.attempts, "lock contention");
        None
    }

    /// The number of DNs that currently have at least one holder.
    pub fn held(&self) -> usize {
        self.table.slots.lock().len()
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquired: self.table.acquired.load(Ordering::Relaxed),
            released: self.table.released.load(Ordering::Relaxed),
        }
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new(LOCK_ATTEMPTS, Duration::from_millis(10))
    }
}
