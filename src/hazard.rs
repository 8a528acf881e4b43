//! Hazard pointers: the lock-free reachability proof for cached pages.
//!
//! Before dereferencing a page a thread publishes its arena id in one of
//! its session's hazard slots, issues a full fence, and re-reads the
//! reference cell; only if the cell still names that page in `Mem` state
//! does the protection hold. Eviction scans every session's slots and
//! skips pages with a live hazard.
//!
//! The array grows in fixed chunks that are never moved or freed, so a
//! scanner racing a grow observes a monotone prefix of the slots.

use std::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::page::{PageId, Ref, RefState, INVALID_PAGE};

/// Slots per growth increment.
pub const HAZARD_INCR: usize = 16;

type Chunk = Arc<[AtomicU32; HAZARD_INCR]>;

fn new_chunk() -> Chunk {
    Arc::new(std::array::from_fn(|_| AtomicU32::new(INVALID_PAGE)))
}

pub struct HazardArray {
    chunks: RwLock<Vec<Chunk>>,
    /// Published slot count; always a chunk boundary.
    size: AtomicUsize,
    /// Live hazard count, for the fast empty check on close.
    active: AtomicUsize,
    cap: usize,
}

impl HazardArray {
    pub fn new(cap: usize) -> HazardArray {
        HazardArray {
            chunks: RwLock::new(vec![new_chunk()]),
            size: AtomicUsize::new(HAZARD_INCR),
            active: AtomicUsize::new(0),
            cap: cap.max(HAZARD_INCR),
        }
    }

    fn slot(&self, i: usize) -> Chunk {
        self.chunks.read()[i / HAZARD_INCR].clone()
    }

    /// Publish a hazard on the page `r` names. On success the protected
    /// page id is returned and must be passed to [`Self::clear`]; `None`
    /// means the cell changed under us and the caller must retry its
    /// descent.
    pub fn set(&self, r: &Ref) -> Result<Option<PageId>> {
        let page = r.page_id();
        let mut i = 0;
        loop {
            let size = self.size.load(Ordering::Acquire);
            if i >= size {
                if size >= self.cap {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::OutOfMemory,
                        "hazard pointer table is full",
                    )));
                }
                self.grow(size);
                continue;
            }
            let chunk = self.slot(i);
            let cell = &chunk[i % HAZARD_INCR];
            if cell
                .compare_exchange(INVALID_PAGE, page, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                i += 1;
                continue;
            }
            // Publish before re-validating: eviction must either see the
            // hazard or win the cell first.
            fence(Ordering::SeqCst);
            if r.state() == RefState::Mem && r.page_id() == page {
                self.active.fetch_add(1, Ordering::AcqRel);
                return Ok(Some(page));
            }
            cell.store(INVALID_PAGE, Ordering::Release);
            return Ok(None);
        }
    }

    fn grow(&self, expected: usize) {
        let mut chunks = self.chunks.write();
        if chunks.len() * HAZARD_INCR != expected {
            return; // someone else grew
        }
        let new_size = (expected + HAZARD_INCR).min(self.cap);
        if new_size == expected {
            return;
        }
        chunks.push(new_chunk());
        self.size.store(chunks.len() * HAZARD_INCR, Ordering::Release);
        log::trace!("hazard array grown to {} slots", chunks.len() * HAZARD_INCR);
    }

    /// Drop the hazard on `page`.
    pub fn clear(&self, page: PageId) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        for i in 0..size {
            let chunk = self.slot(i);
            let cell = &chunk[i % HAZARD_INCR];
            if cell
                .compare_exchange(page, INVALID_PAGE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.active.fetch_sub(1, Ordering::AcqRel);
                return Ok(());
            }
        }
        // Clearing a hazard that was never set is a caller logic error.
        Err(Error::corrupt("hazard", page as u64, "hazard pointer not found"))
    }

    /// Whether any slot currently protects `page`.
    pub fn protects(&self, page: PageId) -> bool {
        let size = self.size.load(Ordering::Acquire);
        for i in 0..size {
            let chunk = self.slot(i);
            if chunk[i % HAZARD_INCR].load(Ordering::Acquire) == page {
                return true;
            }
        }
        false
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Session teardown: every slot must already be clear; stragglers are
    /// swept and logged.
    pub fn close(&self) {
        if self.active() == 0 {
            return;
        }
        let size = self.size.load(Ordering::Acquire);
        let mut leaked = 0;
        for i in 0..size {
            let chunk = self.slot(i);
            let cell = &chunk[i % HAZARD_INCR];
            if cell.swap(INVALID_PAGE, Ordering::AcqRel) != INVALID_PAGE {
                leaked += 1;
            }
        }
        if leaked != 0 {
            log::warn!("session closed with {leaked} live hazard pointers");
            self.active.store(0, Ordering::Release);
        }
    }
}
