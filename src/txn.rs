//! Transaction ids and snapshot visibility.
//!
//! Ids are allocated from a global counter. A snapshot captures the id
//! horizon and the set of transactions running at capture time; an update
//! is visible when its writer committed before the horizon and was not
//! concurrent. Aborted updates overwrite their id with a sentinel so
//! readers skip them without consulting any table.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Update id for aborted writes.
pub const TXN_ABORTED: u64 = u64::MAX;

/// Id visible to everyone (checkpoint-written data, recovery replays).
pub const TXN_NONE: u64 = 0;

#[derive(Debug, Default)]
pub struct TxnGlobal {
    /// Next id to hand out; ids start at 1.
    current: AtomicU64,
    /// Ids of transactions currently running.
    active: Mutex<BTreeSet<u64>>,
}

impl TxnGlobal {
    pub fn new() -> Self {
        Self {
            current: AtomicU64::new(1),
            active: Mutex::new(BTreeSet::new()),
        }
    }

    /// Start a transaction: allocate an id and mark it active.
    pub fn begin(&self) -> u64 {
        let id = self.current.fetch_add(1, Ordering::AcqRel);
        self.active.lock().insert(id);
        id
    }

    /// End a transaction (commit and rollback both retire the id; rollback
    /// additionally marks its updates aborted).
    pub fn end(&self, id: u64) {
        self.active.lock().remove(&id);
    }

    /// Capture a snapshot for a reader.
    pub fn snapshot(&self) -> Snapshot {
        // Order matters: the horizon must not move past ids captured as
        // concurrent, so read the active set first.
        let concurrent: Vec<u64> = self.active.lock().iter().copied().collect();
        let snap_max = self.current.load(Ordering::Acquire);
        Snapshot {
            snap_max,
            concurrent,
        }
    }

    /// Oldest id any current or future snapshot could consider running;
    /// updates older than this are visible to everyone.
    pub fn oldest(&self) -> u64 {
        let active = self.active.lock();
        active
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.current.load(Ordering::Acquire))
    }
}

/// A reader's view of update visibility.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Ids at or past this horizon are invisible.
    pub snap_max: u64,
    /// Ids running when the snapshot was taken, also invisible.
    pub concurrent: Vec<u64>,
}

impl Snapshot {
    /// A snapshot that sees every committed update.
    pub fn all_committed() -> Snapshot {
        Snapshot {
            snap_max: TXN_ABORTED,
            concurrent: Vec::new(),
        }
    }

    pub fn visible(&self, id: u64) -> bool {
        if id == TXN_ABORTED {
            return false;
        }
        if id == TXN_NONE {
            return true;
        }
        id < self.snap_max && !self.concurrent.contains(&id)
    }
}
