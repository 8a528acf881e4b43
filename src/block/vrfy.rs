//! Block-file verification.
//!
//! Two bitmaps, one bit per allocation unit past the descriptor block:
//! `frag_file` collects every range seen while walking the checkpoint, and
//! must end all-ones (no unreferenced gaps); `frag_ckpt` starts from the
//! checkpoint's `alloc` list and is cleared as blocks are visited, and must
//! end all-zeros (no leaked allocations).

use crate::error::{Error, Result};
use crate::ext::ExtentList;

use super::addr::CheckpointDesc;
use super::BlockFile;

pub struct VerifyState {
    /// Bits for `[allocation_unit, file_size)`, one per unit.
    frag_file: Vec<u64>,
    frag_ckpt: Vec<u64>,
    units: u64,
    file_size: u64,
}

fn set_bits(bits: &mut [u64], first: u64, count: u64) {
    for unit in first..first + count {
        bits[(unit / 64) as usize] |= 1 << (unit % 64);
    }
}

fn clear_bits(bits: &mut [u64], first: u64, count: u64) {
    for unit in first..first + count {
        bits[(unit / 64) as usize] &= !(1 << (unit % 64));
    }
}

fn bits_set(bits: &[u64], units: u64) -> u64 {
    let mut total: u64 = bits.iter().map(|w| w.count_ones() as u64).sum();
    // Mask the unused tail of the final word.
    let tail = units % 64;
    if tail != 0 {
        let last = bits[bits.len() - 1];
        total -= (last >> tail).count_ones() as u64;
    }
    total
}

impl VerifyState {
    fn range(&self, unit: u64, off: u64, size: u64) -> Result<(u64, u64)> {
        if off < unit || off % unit != 0 || size % unit != 0 || off + size > self.file_size {
            return Err(Error::corrupt("verify", off, "extent outside the file"));
        }
        Ok((off / unit - 1, size / unit))
    }
}

impl BlockFile {
    /// Begin verification against `desc`. Every extent the checkpoint names
    /// is seeded into the bitmaps; subsequent [`BlockFile::read`] calls
    /// mark the blocks they visit.
    pub fn verify_start(&self, desc: &CheckpointDesc) -> Result<()> {
        let unit = self.allocation_unit();
        let file_size = desc.file_size;
        if file_size < unit || file_size % unit != 0 {
            return Err(Error::corrupt("verify", 0, "file size not unit-aligned"));
        }
        let units = file_size / unit - 1;
        let words = ((units + 63) / 64) as usize;
        let mut state = VerifyState {
            frag_file: vec![0u64; words.max(1)],
            frag_ckpt: vec![0u64; words.max(1)],
            units,
            file_size,
        };

        // Free space is accounted as seen: gaps must come only from ranges
        // nothing references at all.
        let mut avail = ExtentList::new("verify.avail", false);
        self.extlist_read(desc.avail, &mut avail)?;
        for ext in avail.iter() {
            let (first, count) = state.range(unit, ext.off, ext.size)?;
            set_bits(&mut state.frag_file, first, count);
        }
        let mut discard = ExtentList::new("verify.discard", false);
        self.extlist_read(desc.discard, &mut discard)?;
        for ext in discard.iter() {
            let (first, count) = state.range(unit, ext.off, ext.size)?;
            set_bits(&mut state.frag_file, first, count);
        }
        let mut alloc = ExtentList::new("verify.alloc", false);
        self.extlist_read(desc.alloc, &mut alloc)?;
        for ext in alloc.iter() {
            let (first, count) = state.range(unit, ext.off, ext.size)?;
            set_bits(&mut state.frag_ckpt, first, count);
        }

        *self.verify.lock() = Some(state);

        // The extent-list blocks and the root block count as visited.
        for cookie in [desc.alloc, desc.avail, desc.discard, desc.root] {
            if !cookie.is_none() {
                let mut verify = self.verify.lock();
                let state = verify.as_mut().unwrap();
                state.visit_locked(unit, cookie.off, u64::from(cookie.size))?;
            }
        }
        Ok(())
    }

    /// Finish verification: all of the file seen, none of the checkpoint's
    /// allocations leaked.
    pub fn verify_end(&self) -> Result<()> {
        let state = self
            .verify
            .lock()
            .take()
            .ok_or_else(|| Error::corrupt("verify", 0, "verification not started"))?;
        let seen = bits_set(&state.frag_file, state.units);
        if seen != state.units {
            log::warn!(
                "{}: {} of {} units never verified",
                self.name(),
                state.units - seen,
                state.units
            );
            return Err(Error::corrupt("verify", 0, "file ranges never verified"));
        }
        let leaked = bits_set(&state.frag_ckpt, state.units);
        if leaked != 0 {
            return Err(Error::corrupt(
                "verify",
                0,
                "checkpoint references unverified blocks",
            ));
        }
        Ok(())
    }
}

impl VerifyState {
    /// Mark a visited block: seen in the file, discharged from the
    /// checkpoint's allocation list.
    pub(crate) fn visit(&mut self, unit: u64, off: u64, size: u64) -> Result<()> {
        self.visit_locked(unit, off, size)
    }

    fn visit_locked(&mut self, unit: u64, off: u64, size: u64) -> Result<()> {
        let (first, count) = self.range(unit, off, size)?;
        set_bits(&mut self.frag_file, first, count);
        clear_bits(&mut self.frag_ckpt, first, count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{BlockConfig, BlockFile, OpenMode, BLOCK_HEADER_BYTE_SIZE};
    use crate::error::PanicCell;

    fn payload(fill: u8, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_HEADER_BYTE_SIZE];
        buf.resize(BLOCK_HEADER_BYTE_SIZE + len, fill);
        buf
    }

    #[test]
    fn verify_accepts_clean_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        };
        let path = dir.path().join("v.bt");
        BlockFile::create(&path, &cfg).unwrap();
        let (desc, cookies) = {
            let file =
                BlockFile::open(&path, &cfg, OpenMode::Normal, Arc::new(PanicCell::new()))
                    .unwrap();
            let mut cookies = Vec::new();
            for i in 0..5u8 {
                let mut buf = payload(i, 600);
                cookies.push(file.write(&mut buf, true).unwrap());
            }
            let mut root = payload(9, 100);
            let desc = file.checkpoint(Some(&mut root), true).unwrap();
            file.checkpoint_resolve().unwrap();
            (desc, cookies)
        };

        let file =
            BlockFile::open(&path, &cfg, OpenMode::Verify, Arc::new(PanicCell::new()))
                .unwrap();
        file.checkpoint_load(&desc).unwrap();
        file.verify_start(&desc).unwrap();
        for c in cookies {
            file.read(c).unwrap();
        }
        file.verify_end().unwrap();
    }

    #[test]
    fn verify_flags_unvisited_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        };
        let path = dir.path().join("v.bt");
        BlockFile::create(&path, &cfg).unwrap();
        let desc = {
            let file =
                BlockFile::open(&path, &cfg, OpenMode::Normal, Arc::new(PanicCell::new()))
                    .unwrap();
            let mut buf = payload(1, 600);
            // Written, referenced by the checkpoint's alloc list, but the
            // verifier below never visits it.
            let _orphan = file.write(&mut buf, true).unwrap();
            let mut root = payload(9, 100);
            let desc = file.checkpoint(Some(&mut root), true).unwrap();
            file.checkpoint_resolve().unwrap();
            desc
        };

        let file =
            BlockFile::open(&path, &cfg, OpenMode::Verify, Arc::new(PanicCell::new()))
                .unwrap();
        file.checkpoint_load(&desc).unwrap();
        file.verify_start(&desc).unwrap();
        assert!(file.verify_end().is_err());
    }

    #[test]
    fn file_size_on_unit_boundary_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        };
        let path = dir.path().join("v.bt");
        BlockFile::create(&path, &cfg).unwrap();
        let desc = {
            let file =
                BlockFile::open(&path, &cfg, OpenMode::Normal, Arc::new(PanicCell::new()))
                    .unwrap();
            let mut root = payload(9, 100);
            let desc = file.checkpoint(Some(&mut root), true).unwrap();
            file.checkpoint_resolve().unwrap();
            desc
        };
        assert_eq!(desc.file_size % 512, 0);
        let file =
            BlockFile::open(&path, &cfg, OpenMode::Verify, Arc::new(PanicCell::new()))
                .unwrap();
        file.checkpoint_load(&desc).unwrap();
        file.verify_start(&desc).unwrap();
        file.verify_end().unwrap();
    }
}
