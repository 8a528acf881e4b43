//! Sessions: the per-thread handle carrying hazard pointers, transaction
//! state, and scratch buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::hazard::HazardArray;
use crate::page::insert::Update;
use crate::txn::{Snapshot, TxnGlobal};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub struct Session {
    id: u64,
    pub hazard: Arc<HazardArray>,
    txn: Arc<TxnGlobal>,
    /// Explicitly begun transaction, if any.
    state: Mutex<TxnState>,
}

struct TxnState {
    running: Option<u64>,
    snapshot: Option<Snapshot>,
    /// Updates written by the running transaction, for rollback.
    mods: Vec<*const Update>,
}

// Update pointers stay valid while their transaction runs: eviction refuses
// pages carrying uncommitted updates.
unsafe impl Send for TxnState {}

impl Session {
    pub fn new(txn: Arc<TxnGlobal>, hazard_cap: usize) -> Arc<Session> {
        Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            hazard: Arc::new(HazardArray::new(hazard_cap)),
            txn,
            state: Mutex::new(TxnState {
                running: None,
                snapshot: None,
                mods: Vec::new(),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn txn_global(&self) -> &Arc<TxnGlobal> {
        &self.txn
    }

    /// Begin an explicit transaction.
    pub fn begin(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.running.is_some() {
            return Err(Error::Config("transaction already running".into()));
        }
        let id = self.txn.begin();
        state.snapshot = Some(self.txn.snapshot());
        state.running = Some(id);
        state.mods.clear();
        Ok(())
    }

    pub fn commit(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let id = state
            .running
            .take()
            .ok_or_else(|| Error::Config("no transaction running".into()))?;
        state.snapshot = None;
        state.mods.clear();
        self.txn.end(id);
        Ok(id)
    }

    /// Roll back: every update the transaction wrote is marked aborted so
    /// readers and reconciliation skip it.
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock();
        let id = state
            .running
            .take()
            .ok_or_else(|| Error::Config("no transaction running".into()))?;
        for &upd in &state.mods {
            unsafe { (*upd).abort() };
        }
        state.mods.clear();
        state.snapshot = None;
        self.txn.end(id);
        Ok(())
    }

    /// Id to stamp on a new update: the running transaction, or a
    /// single-shot transaction committed on the spot.
    pub fn mutation_txn(&self) -> u64 {
        let state = self.state.lock();
        match state.running {
            Some(id) => id,
            None => {
                let id = self.txn.begin();
                self.txn.end(id);
                id
            }
        }
    }

    pub fn in_txn(&self) -> bool {
        self.state.lock().running.is_some()
    }

    /// Track an update for rollback, when a transaction is running.
    pub fn record_mod(&self, upd: &Update) {
        let mut state = self.state.lock();
        if state.running.is_some() {
            state.mods.push(upd as *const Update);
        }
    }

    /// The visibility snapshot for a read on this session: the running
    /// transaction's fixed snapshot, or a fresh one.
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        match (&state.running, &state.snapshot) {
            (Some(_), Some(snap)) => snap.clone(),
            _ => self.txn.snapshot(),
        }
    }

    pub fn close(&self) {
        if self.in_txn() {
            let _ = self.rollback();
        }
        self.hazard.close();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_txn_lifecycle() {
        let global = Arc::new(TxnGlobal::new());
        let s = Session::new(global.clone(), 64);
        s.begin().unwrap();
        assert!(s.in_txn());
        assert!(s.begin().is_err());
        let id = s.mutation_txn();
        assert_eq!(s.commit().unwrap(), id);
        assert!(!s.in_txn());
        assert!(s.commit().is_err());
    }

    #[test]
    fn rollback_aborts_mods() {
        let global = Arc::new(TxnGlobal::new());
        let s = Session::new(global.clone(), 64);
        s.begin().unwrap();
        let id = s.mutation_txn();
        let upd = Update::new(id, Some(b"x".to_vec()));
        let raw = Box::leak(upd);
        s.record_mod(raw);
        s.rollback().unwrap();
        assert_eq!(raw.txn_id(), crate::txn::TXN_ABORTED);
        // Reclaim the leaked update.
        let _ = unsafe { Box::from_raw(raw as *mut Update) };
    }

    #[test]
    fn implicit_mutations_are_immediately_visible() {
        let global = Arc::new(TxnGlobal::new());
        let s = Session::new(global.clone(), 64);
        let id = s.mutation_txn();
        assert!(s.snapshot().visible(id));
    }

    #[test]
    fn txn_snapshot_is_stable() {
        let global = Arc::new(TxnGlobal::new());
        let reader = Session::new(global.clone(), 64);
        let writer = Session::new(global.clone(), 64);
        reader.begin().unwrap();
        let id = writer.mutation_txn();
        // Started after the reader's snapshot: invisible to it.
        assert!(!reader.snapshot().visible(id));
        reader.commit().unwrap();
        assert!(reader.snapshot().visible(id));
    }
}
