//! Checkpointing a block file: serialize the live extent lists as
//! self-describing blocks and roll the live state forward.
//!
//! The extent-list blocks are reserved before the lists are serialized so
//! the `alloc` list can describe its own storage; the reservation keeps its
//! full padded size rather than shrinking afterward, which would disturb
//! the images already built. The previous checkpoint's list blocks are
//! freed at the start of the next checkpoint.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::ext::{Extent, ExtentList};
use crate::io;

use super::{
    checksum, BlockFile, BlockHeader, Cookie, Live, BLOCK_HEADER_BYTE_SIZE, EXTLIST_MAGIC,
    PAGE_HEADER_SIZE,
};
use super::addr::CheckpointDesc;

impl BlockFile {
    /// Upper bound on the serialized size of a list with `entries` extents,
    /// aligned to the allocation unit. The slack covers the list blocks
    /// allocated while this checkpoint is being assembled.
    fn extlist_estimate(&self, entries: usize) -> u64 {
        let bytes = BLOCK_HEADER_BYTE_SIZE + (entries + 8) * 20 + 2;
        (bytes as u64 + self.alloc_unit - 1) / self.alloc_unit * self.alloc_unit
    }

    /// Serialize `image` into the extent reserved for it.
    fn extlist_write(&self, image: &ExtentList, reserved: Extent) -> Result<Cookie> {
        let mut buf = vec![0u8; BLOCK_HEADER_BYTE_SIZE];
        LittleEndian::write_u32(&mut buf[..4], EXTLIST_MAGIC);
        image.write_to(&mut buf);
        if buf.len() as u64 > reserved.size {
            return Err(Error::corrupt(
                "extent list",
                reserved.off,
                "serialized list overflows its reservation",
            ));
        }
        buf.resize(reserved.size as usize, 0);
        let header = BlockHeader {
            disk_size: reserved.size as u32,
            checksum: 0,
            flags: super::BLOCK_DATA_CKSUM,
            unused: [0; 3],
        };
        buf[PAGE_HEADER_SIZE..BLOCK_HEADER_BYTE_SIZE]
            .copy_from_slice(bytemuck::bytes_of(&header));
        let cksum = checksum(&buf);
        buf[super::BLOCK_CKSUM_FIELD].copy_from_slice(&cksum.to_le_bytes());
        io::write_at(&self.file, reserved.off, &buf)?;
        Ok(Cookie {
            off: reserved.off,
            size: reserved.size as u32,
            checksum: cksum,
        })
    }

    /// Parse a block produced by [`Self::extlist_write`] into `into`.
    pub(crate) fn extlist_read(&self, cookie: Cookie, into: &mut ExtentList) -> Result<()> {
        if cookie.is_none() {
            return Ok(());
        }
        let buf = self.read(cookie)?;
        if LittleEndian::read_u32(&buf[..4]) != EXTLIST_MAGIC {
            return Err(Error::corrupt(
                "extent list",
                cookie.off,
                "bad extent-list magic",
            ));
        }
        into.read_from(&buf[BLOCK_HEADER_BYTE_SIZE..])
    }

    /// Write `root` as the checkpoint's root block, serialize the live
    /// extent lists, and return the descriptor the caller must persist.
    /// Space freed by the superseded checkpoint stays on `ckpt_avail` until
    /// [`Self::checkpoint_resolve`] confirms the checkpoint's writers have
    /// drained.
    pub fn checkpoint(
        &self,
        root: Option<&mut Vec<u8>>,
        data_checksum: bool,
    ) -> Result<CheckpointDesc> {
        if self.live.lock().ckpt_inprogress {
            return Err(Error::Busy);
        }
        let root_cookie = match root {
            Some(buf) => self.write(buf, data_checksum)?,
            None => Cookie::NONE,
        };

        let mut live = self.live.lock();
        if live.ckpt_inprogress {
            return Err(Error::Busy);
        }

        // The previous checkpoint is about to be superseded: its extent-list
        // blocks and everything on `discard` become free once the new
        // descriptor lands.
        let prev = std::mem::take(&mut live.prev_ckpt_blocks);
        for ext in prev {
            self.off_free(&mut live, ext.off, ext.size)?;
        }

        // Reserve list storage first so the alloc image covers it.
        let r_alloc = {
            let size = self.extlist_estimate(live.alloc.entries());
            let off = self.alloc_off(&mut live, size)?;
            Extent { off, size }
        };
        let r_avail = {
            let size =
                self.extlist_estimate(live.avail.entries() + live.discard.entries());
            let off = self.alloc_off(&mut live, size)?;
            Extent { off, size }
        };
        let r_discard = {
            let size = self.extlist_estimate(live.discard.entries());
            let off = self.alloc_off(&mut live, size)?;
            Extent { off, size }
        };
        let end = r_discard.off + r_discard.size;
        self.extend(&mut live, end)?;

        // The durable avail image includes `discard`: the moment this
        // checkpoint is the one recovery would load, the prior references
        // are dead and that space is free on disk.
        let mut avail_image = ExtentList::new("ckpt.avail", false);
        for ext in live.avail.iter() {
            avail_image.free(ext.off, ext.size)?;
        }
        for ext in live.discard.iter() {
            avail_image.free(ext.off, ext.size)?;
        }

        let alloc_cookie = self.extlist_write(&live.alloc, r_alloc)?;
        let avail_cookie = self.extlist_write(&avail_image, r_avail)?;
        let discard_cookie = self.extlist_write(&live.discard, r_discard)?;

        let ckpt_size = live
            .file_size
            .saturating_sub(avail_image.bytes() + self.alloc_unit);
        live.ckpt_size = ckpt_size;

        let desc = CheckpointDesc {
            root: root_cookie,
            alloc: alloc_cookie,
            avail: avail_cookie,
            discard: discard_cookie,
            file_size: live.file_size,
            ckpt_size,
        };

        // Roll the live state: allocations are now owned by the checkpoint,
        // discarded space waits for the resolve barrier.
        live.prev_ckpt_blocks = vec![r_alloc, r_avail, r_discard];
        live.alloc.drain();
        for ext in live.discard.drain() {
            live.ckpt_avail.free(ext.off, ext.size)?;
        }
        live.ckpt_inprogress = true;
        drop(live);

        self.sync()?;
        log::debug!(
            "{}: checkpoint written (root {:?}, file size {})",
            self.name(),
            desc.root,
            desc.file_size
        );
        Ok(desc)
    }

    /// Merge space released by the completed checkpoint back into the
    /// allocatable pool. Called once every writer that started before the
    /// checkpoint has drained.
    pub fn checkpoint_resolve(&self) -> Result<()> {
        let mut live = self.live.lock();
        if !live.ckpt_inprogress {
            return Ok(());
        }
        let Live {
            ref mut avail,
            ref mut ckpt_avail,
            ..
        } = *live;
        avail.merge_from(ckpt_avail)?;
        live.ckpt_inprogress = false;
        Ok(())
    }

    /// Prime the live state from a persisted checkpoint descriptor.
    pub fn checkpoint_load(&self, desc: &CheckpointDesc) -> Result<()> {
        {
            let mut live = self.live.lock();
            if desc.file_size < self.alloc_unit || desc.file_size % self.alloc_unit != 0 {
                return Err(Error::corrupt(
                    "checkpoint",
                    0,
                    "bad file size in checkpoint",
                ));
            }
            live.file_size = desc.file_size;
            live.ckpt_size = desc.ckpt_size;
        }
        let mut avail = ExtentList::new("live.avail", true);
        self.extlist_read(desc.avail, &mut avail)?;
        let mut live = self.live.lock();
        live.avail = avail;
        live.prev_ckpt_blocks.clear();
        for c in [desc.alloc, desc.avail, desc.discard] {
            if !c.is_none() {
                live.prev_ckpt_blocks.push(Extent {
                    off: c.off,
                    size: u64::from(c.size),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{BlockConfig, BlockFile, OpenMode, BLOCK_HEADER_BYTE_SIZE};
    use crate::error::PanicCell;

    fn cfg() -> BlockConfig {
        BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        }
    }

    fn payload(fill: u8, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_HEADER_BYTE_SIZE];
        buf.resize(BLOCK_HEADER_BYTE_SIZE + len, fill);
        buf
    }

    #[test]
    fn checkpoint_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bt");
        BlockFile::create(&path, &cfg()).unwrap();

        let desc = {
            let file =
                BlockFile::open(&path, &cfg(), OpenMode::Normal, Arc::new(PanicCell::new()))
                    .unwrap();
            let mut live1 = payload(1, 700);
            let keep = file.write(&mut live1, true).unwrap();
            let mut dead = payload(2, 700);
            let freed = file.write(&mut dead, true).unwrap();
            file.free(freed).unwrap();
            let mut root = payload(9, 300);
            let desc = file.checkpoint(Some(&mut root), true).unwrap();
            file.checkpoint_resolve().unwrap();
            // The kept block must still read back.
            assert_eq!(file.read(keep).unwrap()[BLOCK_HEADER_BYTE_SIZE], 1);
            (desc, keep)
        };

        let file =
            BlockFile::open(&path, &cfg(), OpenMode::Normal, Arc::new(PanicCell::new()))
                .unwrap();
        file.checkpoint_load(&desc.0).unwrap();
        assert_eq!(file.read(desc.0.root).unwrap()[BLOCK_HEADER_BYTE_SIZE], 9);
        assert_eq!(file.read(desc.1).unwrap()[BLOCK_HEADER_BYTE_SIZE], 1);
        // Freed space was carried into the reloaded avail list.
        assert!(file.avail_bytes() > 0);
    }

    #[test]
    fn second_checkpoint_reclaims_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bt");
        BlockFile::create(&path, &cfg()).unwrap();
        let file =
            BlockFile::open(&path, &cfg(), OpenMode::Normal, Arc::new(PanicCell::new()))
                .unwrap();

        let mut root = payload(1, 100);
        let d1 = file.checkpoint(Some(&mut root), true).unwrap();
        file.checkpoint_resolve().unwrap();
        let size_after_first = file.file_size();

        // Ten more checkpoints: list blocks from superseded checkpoints are
        // recycled, so the file reaches a steady state instead of growing
        // without bound.
        let mut last = d1;
        for i in 0..10u8 {
            let mut root = payload(i, 100);
            last = file.checkpoint(Some(&mut root), true).unwrap();
            file.checkpoint_resolve().unwrap();
        }
        assert!(file.file_size() <= size_after_first * 3);
        assert_ne!(last.root, d1.root);
    }

    #[test]
    fn checkpoint_requires_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.bt");
        BlockFile::create(&path, &cfg()).unwrap();
        let file =
            BlockFile::open(&path, &cfg(), OpenMode::Normal, Arc::new(PanicCell::new()))
                .unwrap();
        let mut root = payload(1, 100);
        file.checkpoint(Some(&mut root), true).unwrap();
        let mut root2 = payload(2, 100);
        assert!(matches!(
            file.checkpoint(Some(&mut root2), true),
            Err(crate::error::Error::Busy)
        ));
        file.checkpoint_resolve().unwrap();
        let mut root3 = payload(3, 100);
        assert!(file.checkpoint(Some(&mut root3), true).is_ok());
    }
}
