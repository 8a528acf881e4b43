//! Group-commit slots.
//!
//! A slot's state is one signed 64-bit word. The numeric protocol comes
//! from the consolidation-array design: writers join a READY slot by
//! adding their size, the closer captures the joined total when it flips
//! the slot to PENDING, and release works against a negative base so the
//! state reaches DONE exactly when the last joiner finishes its copy:
//!
//! - `state == DONE (0)`   every copy has landed
//! - `state == FREE (1)`   available to become the active slot
//! - `state == PENDING (2)` closing, between capture and notify
//! - `state == WRITTEN (3)` handed to the writer thread
//! - `state == READY (4)`  joinable, no bytes yet
//! - `state > READY`       READY plus the joined byte count
//! - `state < DONE`        DONE minus the bytes still being copied

use std::cell::UnsafeCell;
use std::fs::File;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backoff::Backoff;
use crate::error::{Error, Result};

use super::Lsn;

pub const SLOT_POOL: usize = 16;
pub const SLOT_ACTIVE: usize = 1;
pub const SLOT_BUF_INIT_SIZE: usize = 64 * 1024;

pub const SLOT_DONE: i64 = 0;
pub const SLOT_FREE: i64 = 1;
pub const SLOT_PENDING: i64 = 2;
pub const SLOT_WRITTEN: i64 = 3;
pub const SLOT_READY: i64 = 4;

pub const SLOT_FLAG_BUF_GROW: u32 = 0x01;
pub const SLOT_FLAG_SYNC: u32 = 0x02;

/// A writer's claim on a slot: which slot and at what buffer offset.
#[derive(Debug, Clone, Copy)]
pub struct SlotClaim {
    pub slot: usize,
    pub offset: u64,
}

pub struct Slot {
    state: AtomicI64,
    flags: AtomicU32,
    /// Joined byte count, captured at close.
    group_size: AtomicU64,
    /// Where this group lands in the log, assigned at close.
    start_file: AtomicU32,
    start_offset: AtomicU64,
    /// Backing log file for the group's write.
    pub(super) fh: Mutex<Option<Arc<File>>>,
    /// Joiners copy into disjoint ranges concurrently; the writer thread
    /// reads it back only after the state reaches WRITTEN.
    buf: UnsafeCell<Vec<u8>>,
}

unsafe impl Sync for Slot {}

impl Slot {
    fn new(state: i64) -> Slot {
        Slot {
            state: AtomicI64::new(state),
            flags: AtomicU32::new(0),
            group_size: AtomicU64::new(0),
            start_file: AtomicU32::new(0),
            start_offset: AtomicU64::new(0),
            fh: Mutex::new(None),
            buf: UnsafeCell::new(vec![0u8; SLOT_BUF_INIT_SIZE]),
        }
    }

    pub fn state(&self) -> i64 {
        self.state.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn buf_len(&self) -> usize {
        unsafe { (*self.buf.get()).len() }
    }

    /// Copy a record into the slot buffer. Only legal between the claim and
    /// the matching release; ranges of concurrent joiners are disjoint.
    pub fn copy_in(&self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        debug_assert!(offset + data.len() <= self.buf_len());
        unsafe {
            let buf = &mut *self.buf.get();
            buf[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    /// The group's bytes, for the writer thread.
    pub fn group(&self) -> (&[u8], Lsn, Lsn) {
        let size = self.group_size.load(Ordering::Acquire);
        let start = Lsn {
            file: self.start_file.load(Ordering::Acquire),
            offset: self.start_offset.load(Ordering::Acquire),
        };
        let end = Lsn {
            file: start.file,
            offset: start.offset + size,
        };
        let buf = unsafe { &(&*self.buf.get())[..size as usize] };
        (buf, start, end)
    }

    pub fn start_lsn(&self) -> Lsn {
        Lsn {
            file: self.start_file.load(Ordering::Acquire),
            offset: self.start_offset.load(Ordering::Acquire),
        }
    }

    pub fn end_lsn(&self) -> Lsn {
        let start = self.start_lsn();
        Lsn {
            file: start.file,
            offset: start.offset + self.group_size.load(Ordering::Acquire),
        }
    }
}

pub struct SlotPool {
    pool: Vec<Slot>,
    /// Index of the active (joinable) slot.
    active: AtomicU64,
    /// Next pool index the closer probes for a FREE replacement.
    pool_cursor: Mutex<usize>,
}

impl SlotPool {
    pub fn new() -> SlotPool {
        let mut pool: Vec<Slot> = (0..SLOT_POOL).map(|_| Slot::new(SLOT_FREE)).collect();
        pool[0].state.store(SLOT_READY, Ordering::Release);
        SlotPool {
            pool,
            active: AtomicU64::new(0),
            pool_cursor: Mutex::new(1),
        }
    }

    pub fn slot(&self, i: usize) -> &Slot {
        &self.pool[i]
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire) as usize
    }

    /// Join the active slot with `size` bytes: fetch-add into the state
    /// word via CAS so a closing slot (state below READY) is never joined.
    pub fn join(&self, size: u64, sync: bool) -> Result<SlotClaim> {
        let mut grow_attempts = 0;
        let mut backoff = Backoff::default();
        loop {
            let idx = self.active_index();
            let slot = &self.pool[idx];
            let old = slot.state();
            if old < SLOT_READY {
                // The slot is closing; wait for the replacement.
                backoff.wait();
                continue;
            }
            let new = old + size as i64;
            if new < old {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "log record overflows the slot state",
                )));
            }
            if (new - SLOT_READY) as usize > slot.buf_len() {
                slot.set_flag(SLOT_FLAG_BUF_GROW);
                grow_attempts += 1;
                if grow_attempts > 5 {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::OutOfMemory,
                        "log record too large for the slot buffers",
                    )));
                }
                self.grow_buffers((size as usize).next_power_of_two());
                continue;
            }
            if slot
                .state
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            if sync {
                slot.set_flag(SLOT_FLAG_SYNC);
            }
            return Ok(SlotClaim {
                slot: idx,
                offset: (old - SLOT_READY) as u64,
            });
        }
    }

    /// Wait until the closer has assigned the slot's file range (the state
    /// drops to DONE minus the outstanding copies).
    pub fn wait_assigned(&self, claim: &SlotClaim) {
        let slot = &self.pool[claim.slot];
        let mut backoff = Backoff::default();
        while slot.state() > SLOT_DONE {
            backoff.wait();
        }
    }

    /// Account a finished copy. Returns true when this release was the last
    /// one and the slot is ready for the writer thread.
    pub fn release(&self, claim: &SlotClaim, size: u64) -> bool {
        let slot = &self.pool[claim.slot];
        let new = slot.state.fetch_add(size as i64, Ordering::AcqRel) + size as i64;
        debug_assert!(new <= SLOT_DONE);
        if new == SLOT_DONE {
            slot.state.store(SLOT_WRITTEN, Ordering::Release);
            return true;
        }
        false
    }

    /// Close the active slot: capture its joined size, promote a FREE slot
    /// to READY in its place, and assign the group's position in the log.
    /// Returns the closed slot's index, or `None` when the slot was empty.
    pub fn close_active(&self, assign: impl FnOnce(u64) -> (Arc<File>, Lsn)) -> Option<usize> {
        let idx = self.active_index();
        let slot = &self.pool[idx];
        let joined = slot.state();
        if joined <= SLOT_READY {
            return None; // nothing joined, nothing to do
        }

        // Find a FREE replacement before taking the active slot away.
        let replacement = {
            let mut cursor = self.pool_cursor.lock();
            let mut found = None;
            for probe in 0..SLOT_POOL {
                let cand = (*cursor + probe) % SLOT_POOL;
                if cand == idx {
                    continue;
                }
                if self.pool[cand]
                    .state
                    .compare_exchange(SLOT_FREE, SLOT_READY, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    *cursor = (cand + 1) % SLOT_POOL;
                    found = Some(cand);
                    break;
                }
            }
            found?
        };
        self.active.store(replacement as u64, Ordering::Release);

        // Capture the joined size; joins racing this swap retry against the
        // replacement slot.
        let old = slot.state.swap(SLOT_PENDING, Ordering::AcqRel);
        let group = (old - SLOT_READY) as u64;
        slot.group_size.store(group, Ordering::Release);
        let (fh, start) = assign(group);
        slot.start_file.store(start.file, Ordering::Release);
        slot.start_offset.store(start.offset, Ordering::Release);
        *slot.fh.lock() = Some(fh);
        // Notify: joiners may now copy; the last release lands on DONE.
        slot.state.store(SLOT_DONE - group as i64, Ordering::Release);
        Some(idx)
    }

    /// Return a written slot to the pool, growing its buffer when a join
    /// asked for it.
    pub fn free_slot(&self, idx: usize) {
        let slot = &self.pool[idx];
        debug_assert_eq!(slot.state(), SLOT_WRITTEN);
        if slot.flags() & SLOT_FLAG_BUF_GROW != 0 {
            // Exclusive here: no joiner can hold a claim on a WRITTEN slot.
            unsafe {
                let buf = &mut *slot.buf.get();
                let new_len = buf.len() * 2;
                buf.resize(new_len, 0);
            }
        }
        slot.flags.store(0, Ordering::Release);
        *slot.fh.lock() = None;
        slot.state.store(SLOT_FREE, Ordering::Release);
    }

    /// Grow idle slot buffers so an oversized record can eventually join.
    fn grow_buffers(&self, need: usize) {
        for slot in &self.pool {
            // Only park FREE or empty READY slots; anything else is in use.
            let parked = slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_PENDING, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
                || slot
                    .state
                    .compare_exchange(
                        SLOT_READY,
                        SLOT_PENDING,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok();
            if !parked {
                continue;
            }
            unsafe {
                let buf = &mut *slot.buf.get();
                if buf.len() < need {
                    let new_len = (buf.len() * 2).max(need);
                    buf.resize(new_len, 0);
                }
            }
            slot.flags
                .fetch_and(!SLOT_FLAG_BUF_GROW, Ordering::AcqRel);
            // A READY slot is only parked when empty, so FREE is a safe
            // state to hand back; the active slot is re-promoted below.
            slot.state.store(SLOT_FREE, Ordering::Release);
        }
        // The active slot may have been parked to FREE; make sure one slot
        // is joinable again.
        let idx = self.active_index();
        let _ = self.pool[idx].state.compare_exchange(
            SLOT_FREE,
            SLOT_READY,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;

    fn fake_assign() -> (Arc<File>, Lsn) {
        let tmp = tempfile::tempfile().unwrap();
        (
            Arc::new(tmp),
            Lsn {
                file: 1,
                offset: 128,
            },
        )
    }

    #[test]
    fn join_copy_release_cycle() {
        let pool = SlotPool::new();
        let claim_a = pool.join(128, false).unwrap();
        let claim_b = pool.join(256, false).unwrap();
        assert_eq!(claim_a.slot, claim_b.slot);
        assert_eq!(claim_a.offset, 0);
        assert_eq!(claim_b.offset, 128);

        let closed = pool.close_active(|group| {
            assert_eq!(group, 384);
            fake_assign()
        });
        let closed = closed.unwrap();
        assert_eq!(closed, claim_a.slot);
        // The replacement slot is joinable immediately.
        let other = pool.join(64, false).unwrap();
        assert_ne!(other.slot, closed);

        pool.wait_assigned(&claim_a);
        pool.slot(claim_a.slot).copy_in(claim_a.offset, &[1u8; 128]);
        assert!(!pool.release(&claim_a, 128));
        pool.slot(claim_b.slot).copy_in(claim_b.offset, &[2u8; 256]);
        assert!(pool.release(&claim_b, 256));

        let slot = pool.slot(closed);
        assert_eq!(slot.state(), SLOT_WRITTEN);
        let (buf, start, end) = slot.group();
        assert_eq!(buf.len(), 384);
        assert_eq!(start.offset, 128);
        assert_eq!(end.offset, 512);
        assert!(buf[..128].iter().all(|&b| b == 1));
        assert!(buf[128..].iter().all(|&b| b == 2));
        pool.free_slot(closed);
        assert_eq!(slot.state(), SLOT_FREE);
    }

    #[test]
    fn empty_slot_does_not_close() {
        let pool = SlotPool::new();
        assert!(pool.close_active(|_| fake_assign()).is_none());
    }

    #[test]
    fn grow_flag_doubles_buffer_on_free() {
        let pool = SlotPool::new();
        let claim = pool.join(64, false).unwrap();
        pool.slot(claim.slot).set_flag(SLOT_FLAG_BUF_GROW);
        pool.close_active(|_| fake_assign()).unwrap();
        pool.wait_assigned(&claim);
        pool.slot(claim.slot).copy_in(claim.offset, &[0u8; 64]);
        assert!(pool.release(&claim, 64));
        let before = pool.slot(claim.slot).buf_len();
        pool.free_slot(claim.slot);
        assert_eq!(pool.slot(claim.slot).buf_len(), before * 2);
    }

    #[test]
    fn concurrent_joiners_fill_disjoint_ranges() {
        let pool = Arc::new(SlotPool::new());
        let total = Arc::new(TestCounter::new(0));
        let mut handles = Vec::new();
        for t in 0..8u8 {
            let pool = pool.clone();
            let total = total.clone();
            handles.push(std::thread::spawn(move || {
                let claim = pool.join(200, false).unwrap();
                total.fetch_add(200, Ordering::Relaxed);
                pool.wait_assigned(&claim);
                pool.slot(claim.slot).copy_in(claim.offset, &[t + 1; 200]);
                pool.release(&claim, 200)
            }));
        }
        // Give the joiners time to pile into one slot, then close it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let closed = pool
            .close_active(|group| {
                assert_eq!(group, 1600);
                fake_assign()
            })
            .unwrap();
        let mut last = 0;
        for h in handles {
            if h.join().unwrap() {
                last += 1;
            }
        }
        assert_eq!(last, 1, "exactly one releaser lands on DONE");
        let (buf, _, _) = pool.slot(closed).group();
        // Every 200-byte range is one thread's fill byte.
        for chunk in buf.chunks(200) {
            assert!(chunk.iter().all(|&b| b == chunk[0] && b != 0));
        }
    }
}
