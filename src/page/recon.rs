//! Reconciliation: rewriting an in-memory page as one or more blocks.
//!
//! The merged entry stream (disk slots overlaid with their update chains,
//! insert lists interleaved in key order) is cut into chunks at the split
//! size. Zero chunks means the page died; one chunk replaces the page's
//! block; several chunks hand the parent a set of boundary keys to split
//! on. Values past the overflow threshold move to their own blocks.
//!
//! Overflow accounting: every overflow cookie the new image references is
//! collected, and afterwards any cookie the previous image or previous
//! pass held that the new image dropped is reported to the caller, which
//! caches the value and frees the block.

use std::collections::HashSet;

use bytemuck::bytes_of;

use crate::block::{BlockFile, Cookie, BLOCK_HEADER_BYTE_SIZE};
use crate::compress::Compressor;
use crate::error::Result;
use crate::txn::Snapshot;

use super::cell;
use super::col::{ColFixPage, ColValue, ColVarPage};
use super::row::{RowLeafPage, SlotValue};
use super::{PageHeader, PageType, Ref, RefKey};

/// Outcome of reconciling one page.
#[derive(Debug)]
pub enum ReconResult {
    /// Nothing survived; the parent drops its reference.
    Empty,
    /// One replacement block.
    Replace(Cookie),
    /// The page outgrew one block; the parent splits on these keys.
    Split(Vec<(RefKey, Cookie)>),
}

/// Reconciliation output: the block outcome plus overflow blocks whose
/// values were superseded in this pass.
#[derive(Debug)]
pub struct Reconciled {
    pub result: ReconResult,
    pub discarded_ovfl: Vec<Cookie>,
}

/// Which overflow blocks the pass referenced and which it wrote.
#[derive(Default)]
struct OvflTracker {
    referenced: HashSet<u64>,
    written: Vec<Cookie>,
}

impl OvflTracker {
    fn reference(&mut self, cookie: Cookie) {
        self.referenced.insert(cookie.off);
    }

    fn wrote(&mut self, cookie: Cookie) {
        self.referenced.insert(cookie.off);
        self.written.push(cookie);
    }
}

pub struct Reconciler<'a> {
    block: &'a BlockFile,
    snap: Snapshot,
    /// Target payload size of output blocks.
    split_size: usize,
    /// Values past this size become overflow blocks.
    ovfl_size: usize,
    /// Write generation for the new images.
    gen: u64,
    data_checksum: bool,
    /// Force a single output block regardless of size; used when the
    /// caller cannot restructure the parent.
    no_split: bool,
    compressor: &'a dyn Compressor,
}

struct ChunkWriter<'a, 'b> {
    rec: &'a Reconciler<'b>,
    page_type: PageType,
    buf: Vec<u8>,
    entries: u32,
    first_key: Option<RefKey>,
    prev_key: Vec<u8>,
    out: Vec<(RefKey, Cookie)>,
    mem_size: u64,
}

impl<'a, 'b> ChunkWriter<'a, 'b> {
    fn new(rec: &'a Reconciler<'b>, page_type: PageType, mem_size: u64) -> Self {
        ChunkWriter {
            rec,
            page_type,
            buf: vec![0u8; BLOCK_HEADER_BYTE_SIZE],
            entries: 0,
            first_key: None,
            prev_key: Vec::new(),
            out: Vec::new(),
            mem_size,
        }
    }

    fn have_room(&self, need: usize) -> bool {
        self.entries == 0
            || self.rec.no_split
            || self.buf.len() + need <= self.rec.split_size
    }

    /// Close the current chunk and write its block.
    fn finish_chunk(&mut self) -> Result<()> {
        if self.entries == 0 {
            return Ok(());
        }
        let first_key = self.first_key.take().expect("chunk without a first key");
        let recno = match &first_key {
            RefKey::Recno(r) => *r,
            RefKey::Row(_) => 0,
        };
        let header = PageHeader {
            recno,
            gen: self.rec.gen,
            mem_size: self.mem_size.min(u32::MAX as u64) as u32,
            entries: self.entries,
            page_type: self.page_type as u8,
            flags: 0,
            unused: [0; 6],
        };
        self.buf[..super::PAGE_HEADER_SIZE].copy_from_slice(bytes_of(&header));
        self.rec.compressor.compress(&mut self.buf)?;
        let cookie = self.rec.block.write(&mut self.buf, self.rec.data_checksum)?;
        self.out.push((first_key, cookie));
        self.buf = vec![0u8; BLOCK_HEADER_BYTE_SIZE];
        self.entries = 0;
        self.prev_key.clear();
        Ok(())
    }

    fn into_result(mut self) -> Result<ReconResult> {
        self.finish_chunk()?;
        Ok(match self.out.len() {
            0 => ReconResult::Empty,
            1 => ReconResult::Replace(self.out.remove(0).1),
            _ => ReconResult::Split(self.out),
        })
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(
        block: &'a BlockFile,
        snap: Snapshot,
        split_size: usize,
        ovfl_size: usize,
        gen: u64,
        data_checksum: bool,
        compressor: &'a dyn Compressor,
    ) -> Reconciler<'a> {
        debug_assert!(ovfl_size <= split_size);
        Reconciler {
            block,
            snap,
            split_size,
            ovfl_size,
            gen,
            data_checksum,
            no_split: false,
            compressor,
        }
    }

    /// A copy of this reconciler that emits one block no matter the size.
    pub fn unsplit(&self) -> Reconciler<'a> {
        Reconciler {
            block: self.block,
            snap: self.snap.clone(),
            split_size: self.split_size,
            ovfl_size: self.ovfl_size,
            gen: self.gen,
            data_checksum: self.data_checksum,
            no_split: true,
            compressor: self.compressor,
        }
    }

    /// Write an overflow block holding one oversized value.
    fn write_ovfl(&self, data: &[u8]) -> Result<Cookie> {
        let mut buf = vec![0u8; BLOCK_HEADER_BYTE_SIZE];
        buf.extend_from_slice(data);
        let header = PageHeader {
            recno: 0,
            gen: self.gen,
            mem_size: data.len().min(u32::MAX as usize) as u32,
            entries: 1,
            page_type: PageType::Ovfl as u8,
            flags: 0,
            unused: [0; 6],
        };
        buf[..super::PAGE_HEADER_SIZE].copy_from_slice(bytes_of(&header));
        self.compressor.compress(&mut buf)?;
        self.block.write(&mut buf, self.data_checksum)
    }

    /// Reconcile a row-store leaf.
    pub fn row_leaf(&self, page: &RowLeafPage) -> Result<Reconciled> {
        let mut writer = ChunkWriter::new(self, PageType::RowLeaf, page.footprint());
        let mut ovfl = OvflTracker::default();
        let prev_written = page.take_pending_ovfl();

        // One ordered pass: the insert list before each slot, then the slot
        // itself, then the trailing insert list.
        let entries = page.entries();
        for slot in 0..=entries {
            for node in page.insert_list(slot).iter() {
                if let Some(upd) = node.upd.visible(&self.snap) {
                    if let Some(data) = &upd.data {
                        self.row_emit(&mut writer, &mut ovfl, &node.key, data)?;
                    }
                }
            }
            if slot == entries {
                break;
            }
            match page.updates(slot).visible(&self.snap) {
                Some(upd) => {
                    if let Some(data) = &upd.data {
                        let key = page.key(slot).to_vec();
                        self.row_emit(&mut writer, &mut ovfl, &key, data)?;
                    }
                }
                None => {
                    let key = page.key(slot).to_vec();
                    match page.value(slot) {
                        SlotValue::Plain(v) => {
                            let v = v.clone();
                            self.row_emit(&mut writer, &mut ovfl, &key, &v)?;
                        }
                        SlotValue::Ovfl(c) => {
                            let c = *c;
                            ovfl.reference(c);
                            self.row_emit_ovfl(&mut writer, &key, c)?;
                        }
                    }
                }
            }
        }

        // Sweep: previous-pass blocks and on-disk slot blocks the new
        // image no longer references are discards.
        let mut discarded = Vec::new();
        for c in prev_written {
            if !ovfl.referenced.contains(&c.off) {
                discarded.push(c);
            }
        }
        for slot in 0..entries {
            if let SlotValue::Ovfl(c) = page.value(slot) {
                if !ovfl.referenced.contains(&c.off) && page.claim_ovfl_discard(slot) {
                    discarded.push(*c);
                }
            }
        }
        page.set_pending_ovfl(ovfl.written);
        Ok(Reconciled {
            result: writer.into_result()?,
            discarded_ovfl: discarded,
        })
    }

    fn row_emit(
        &self,
        w: &mut ChunkWriter<'_, '_>,
        ovfl: &mut OvflTracker,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        if value.len() > self.ovfl_size {
            let cookie = self.write_ovfl(value)?;
            ovfl.wrote(cookie);
            return self.row_emit_ovfl(w, key, cookie);
        }
        let need = key.len() + value.len() + 16;
        if !w.have_room(need) {
            w.finish_chunk()?;
        }
        let prefix = if w.entries == 0 {
            0
        } else {
            cell::common_prefix(&w.prev_key, key)
        };
        cell::pack_key(&mut w.buf, prefix as u64, &key[prefix..]);
        cell::pack_value(&mut w.buf, value);
        self.row_note_key(w, key);
        Ok(())
    }

    fn row_emit_ovfl(
        &self,
        w: &mut ChunkWriter<'_, '_>,
        key: &[u8],
        cookie: Cookie,
    ) -> Result<()> {
        let need = key.len() + 24;
        if !w.have_room(need) {
            w.finish_chunk()?;
        }
        let prefix = if w.entries == 0 {
            0
        } else {
            cell::common_prefix(&w.prev_key, key)
        };
        cell::pack_key(&mut w.buf, prefix as u64, &key[prefix..]);
        cell::pack_value_ovfl(&mut w.buf, cookie, self.block.allocation_unit());
        self.row_note_key(w, key);
        Ok(())
    }

    fn row_note_key(&self, w: &mut ChunkWriter<'_, '_>, key: &[u8]) {
        if w.entries == 0 {
            w.first_key = Some(RefKey::Row(key.to_vec()));
        }
        w.prev_key.clear();
        w.prev_key.extend_from_slice(key);
        w.entries += 1;
    }

    /// Reconcile an internal page from its child index. Children must
    /// already carry their final addresses; empty children are dropped.
    pub fn internal(
        &self,
        page_type: PageType,
        children: &[std::sync::Arc<Ref>],
    ) -> Result<Reconciled> {
        debug_assert!(matches!(page_type, PageType::RowInt | PageType::ColInt));
        let mut writer = ChunkWriter::new(self, page_type, 0);
        let unit = self.block.allocation_unit();
        for child in children {
            let addr = child.addr();
            if addr.is_none() {
                continue;
            }
            match &child.key {
                RefKey::Row(key) => {
                    let need = key.len() + 24;
                    if !writer.have_room(need) {
                        writer.finish_chunk()?;
                    }
                    let prefix = if writer.entries == 0 {
                        0
                    } else {
                        cell::common_prefix(&writer.prev_key, key)
                    };
                    cell::pack_key(&mut writer.buf, prefix as u64, &key[prefix..]);
                    cell::pack_addr(&mut writer.buf, addr, unit);
                    self.row_note_key(&mut writer, key);
                }
                RefKey::Recno(recno) => {
                    if !writer.have_room(24) {
                        writer.finish_chunk()?;
                    }
                    crate::pack::pack_uint(&mut writer.buf, *recno);
                    cell::pack_addr(&mut writer.buf, addr, unit);
                    if writer.entries == 0 {
                        writer.first_key = Some(RefKey::Recno(*recno));
                    }
                    writer.entries += 1;
                }
            }
        }
        Ok(Reconciled {
            result: writer.into_result()?,
            discarded_ovfl: Vec::new(),
        })
    }

    /// Reconcile a fixed-length column leaf starting at `recno`.
    pub fn col_fix(&self, page: &ColFixPage, recno: u64) -> Result<Reconciled> {
        let width = page.width() as usize;
        let disk_entries = page.entries();
        // Appends may extend past the on-disk record range.
        let last_plus_one = page
            .updates()
            .iter()
            .map(|n| n.key + 1)
            .fold(recno + disk_entries, u64::max);

        let mut writer = ChunkWriter::new(self, PageType::ColFix, page.footprint());
        let zeroes = vec![0u8; width];
        for r in recno..last_plus_one {
            let mut bytes: Vec<u8> = match page.updates().search(&r) {
                Some(node) => match node.upd.visible(&self.snap) {
                    Some(upd) => match &upd.data {
                        Some(d) => d.clone(),
                        None => zeroes.clone(),
                    },
                    None => self.col_fix_disk(page, recno, r, &zeroes),
                },
                None => self.col_fix_disk(page, recno, r, &zeroes),
            };
            bytes.resize(width, 0);
            if !writer.have_room(width) {
                writer.finish_chunk()?;
            }
            if writer.entries == 0 {
                writer.first_key = Some(RefKey::Recno(r));
            }
            writer.buf.extend_from_slice(&bytes);
            writer.entries += 1;
        }
        Ok(Reconciled {
            result: writer.into_result()?,
            discarded_ovfl: Vec::new(),
        })
    }

    fn col_fix_disk(&self, page: &ColFixPage, start: u64, r: u64, zeroes: &[u8]) -> Vec<u8> {
        if r >= start {
            if let Some(v) = page.value(r - start) {
                return v.to_vec();
            }
        }
        zeroes.to_vec()
    }

    /// Reconcile a variable-length column leaf starting at `recno`.
    pub fn col_var(&self, page: &ColVarPage, recno: u64) -> Result<Reconciled> {
        let disk_entries = page.entries();
        let last_plus_one = page
            .updates()
            .iter()
            .map(|n| n.key + 1)
            .fold(recno + disk_entries, u64::max);

        let mut writer = ChunkWriter::new(self, PageType::ColVar, page.footprint());
        let mut ovfl = OvflTracker::default();
        let prev_written = page.take_pending_ovfl();
        let mut run: Option<(u64, u64, ColValue)> = None; // (start, count, value)
        for r in recno..last_plus_one {
            let value: ColValue = match page.updates().search(&r) {
                Some(node) => match node.upd.visible(&self.snap) {
                    Some(upd) => match &upd.data {
                        Some(d) => ColValue::Plain(d.clone()),
                        None => ColValue::Del,
                    },
                    None => self.col_var_disk(page, recno, r),
                },
                None => self.col_var_disk(page, recno, r),
            };
            match &mut run {
                Some((_, count, v)) if *v == value => *count += 1,
                _ => {
                    if let Some((start, count, v)) = run.take() {
                        self.col_var_flush(&mut writer, &mut ovfl, start, count, &v)?;
                    }
                    run = Some((r, 1, value));
                }
            }
        }
        if let Some((start, count, v)) = run.take() {
            self.col_var_flush(&mut writer, &mut ovfl, start, count, &v)?;
        }

        let mut discarded = Vec::new();
        for c in prev_written {
            if !ovfl.referenced.contains(&c.off) {
                discarded.push(c);
            }
        }
        for (idx, r) in page.runs().iter().enumerate() {
            if let ColValue::Ovfl(c) = r.value {
                if !ovfl.referenced.contains(&c.off) && page.claim_ovfl_discard(idx) {
                    discarded.push(c);
                }
            }
        }
        page.set_pending_ovfl(ovfl.written);
        Ok(Reconciled {
            result: writer.into_result()?,
            discarded_ovfl: discarded,
        })
    }

    fn col_var_disk(&self, page: &ColVarPage, start: u64, r: u64) -> ColValue {
        page.value(r - start).cloned().unwrap_or(ColValue::Del)
    }

    fn col_var_flush(
        &self,
        w: &mut ChunkWriter<'_, '_>,
        ovfl: &mut OvflTracker,
        start: u64,
        count: u64,
        value: &ColValue,
    ) -> Result<()> {
        let value = match value {
            ColValue::Plain(d) if d.len() > self.ovfl_size => {
                let cookie = self.write_ovfl(d)?;
                ovfl.wrote(cookie);
                ColValue::Ovfl(cookie)
            }
            ColValue::Ovfl(c) => {
                ovfl.reference(*c);
                ColValue::Ovfl(*c)
            }
            other => other.clone(),
        };
        let need = 24 + match &value {
            ColValue::Plain(d) => d.len(),
            _ => 16,
        };
        if !w.have_room(need) {
            w.finish_chunk()?;
        }
        if w.entries == 0 {
            w.first_key = Some(RefKey::Recno(start));
        }
        super::col::pack_run(&mut w.buf, count, &value, self.block.allocation_unit());
        w.entries += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::{BlockConfig, BlockFile, OpenMode};
    use crate::error::PanicCell;
    use crate::page::insert::Update;
    use crate::page::PAGE_HEADER_SIZE;

    fn block(dir: &tempfile::TempDir) -> BlockFile {
        let cfg = BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        };
        let path = dir.path().join("r.bt");
        BlockFile::create(&path, &cfg).unwrap();
        BlockFile::open(&path, &cfg, OpenMode::Normal, Arc::new(PanicCell::new())).unwrap()
    }

    fn recon(block: &BlockFile) -> Reconciler<'_> {
        Reconciler::new(
            block,
            Snapshot::all_committed(),
            4096,
            1024,
            1,
            true,
            &crate::compress::NoopCompressor,
        )
    }

    fn parse_header(image: &[u8]) -> PageHeader {
        *bytemuck::from_bytes(&image[..PAGE_HEADER_SIZE])
    }

    #[test]
    fn empty_page_reconciles_empty() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = RowLeafPage::empty();
        let r = recon(&block).row_leaf(&page).unwrap();
        assert!(matches!(r.result, ReconResult::Empty));
    }

    #[test]
    fn inserts_and_tombstones_merge() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = RowLeafPage::empty();
        for k in ["b", "d", "a", "c"] {
            page.insert_list(0)
                .insert(k.as_bytes().to_vec(), Update::new(1, Some(k.as_bytes().to_vec())));
        }
        // Remove "c" again.
        page.insert_list(0)
            .update(&b"c"[..], Update::new(2, None))
            .unwrap();

        let r = recon(&block).row_leaf(&page).unwrap();
        let cookie = match r.result {
            ReconResult::Replace(c) => c,
            other => panic!("expected replace, got {other:?}"),
        };
        let image = block.read(cookie).unwrap();
        let header = parse_header(&image);
        assert_eq!(header.page_type, PageType::RowLeaf as u8);
        assert_eq!(header.entries, 3);
        let page2 = RowLeafPage::from_image(
            &image[crate::block::BLOCK_HEADER_BYTE_SIZE..],
            header.entries,
            512,
            4,
        )
        .unwrap();
        assert_eq!(page2.key(0), b"a");
        assert_eq!(page2.key(1), b"b");
        assert_eq!(page2.key(2), b"d");
    }

    #[test]
    fn big_pages_split_with_boundary_keys() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = RowLeafPage::empty();
        for i in 0..200 {
            let key = format!("key{i:05}").into_bytes();
            page.insert_list(0)
                .insert(key, Update::new(1, Some(vec![7u8; 100])));
        }
        let r = recon(&block).row_leaf(&page).unwrap();
        let chunks = match r.result {
            ReconResult::Split(chunks) => chunks,
            other => panic!("expected split, got {other:?}"),
        };
        assert!(chunks.len() > 1);
        // Boundary keys ascend and the first one is the smallest key.
        assert_eq!(chunks[0].0, RefKey::Row(b"key00000".to_vec()));
        let mut prev: Option<Vec<u8>> = None;
        let mut total = 0;
        for (key, cookie) in &chunks {
            let key = match key {
                RefKey::Row(k) => k.clone(),
                _ => unreachable!(),
            };
            if let Some(p) = &prev {
                assert!(key > *p);
            }
            prev = Some(key);
            let image = block.read(*cookie).unwrap();
            total += parse_header(&image).entries;
        }
        assert_eq!(total, 200);
    }

    #[test]
    fn oversized_values_go_to_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = RowLeafPage::empty();
        let big = vec![0x5Au8; 5000];
        page.insert_list(0)
            .insert(b"big".to_vec(), Update::new(1, Some(big.clone())));
        let r = recon(&block).row_leaf(&page).unwrap();
        assert!(r.discarded_ovfl.is_empty());
        let cookie = match r.result {
            ReconResult::Replace(c) => c,
            other => panic!("expected replace, got {other:?}"),
        };
        let image = block.read(cookie).unwrap();
        let header = parse_header(&image);
        let page2 = RowLeafPage::from_image(
            &image[crate::block::BLOCK_HEADER_BYTE_SIZE..],
            header.entries,
            512,
            4,
        )
        .unwrap();
        let ovfl = match page2.value(0) {
            SlotValue::Ovfl(c) => *c,
            other => panic!("expected overflow, got {other:?}"),
        };
        let ovfl_image = block.read(ovfl).unwrap();
        assert_eq!(parse_header(&ovfl_image).page_type, PageType::Ovfl as u8);
        assert_eq!(
            &ovfl_image[crate::block::BLOCK_HEADER_BYTE_SIZE
                ..crate::block::BLOCK_HEADER_BYTE_SIZE + 5000],
            &big[..]
        );
    }

    #[test]
    fn superseded_overflow_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = RowLeafPage::empty();
        let big = vec![1u8; 4000];
        page.insert_list(0)
            .insert(b"k".to_vec(), Update::new(1, Some(big)));
        // First pass writes the overflow block.
        let r1 = recon(&block).row_leaf(&page).unwrap();
        assert!(r1.discarded_ovfl.is_empty());
        // Replace the value with a small one: the next pass must hand the
        // old overflow block back exactly once.
        page.insert_list(0)
            .update(&b"k"[..], Update::new(2, Some(b"small".to_vec())))
            .unwrap();
        let r2 = recon(&block).row_leaf(&page).unwrap();
        assert_eq!(r2.discarded_ovfl.len(), 1);
        let r3 = recon(&block).row_leaf(&page).unwrap();
        assert!(r3.discarded_ovfl.is_empty());
    }

    #[test]
    fn col_var_runs_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let page = ColVarPage::empty();
        for r in 1..=10u64 {
            page.updates()
                .insert(r, Update::new(1, Some(vec![if r <= 5 { 1 } else { 2 }])));
        }
        let r = recon(&block).col_var(&page, 1).unwrap();
        let cookie = match r.result {
            ReconResult::Replace(c) => c,
            other => panic!("expected replace, got {other:?}"),
        };
        let image = block.read(cookie).unwrap();
        let header = parse_header(&image);
        assert_eq!(header.recno, 1);
        // Two runs of five, not ten entries.
        assert_eq!(header.entries, 2);
        let page2 = ColVarPage::from_image(
            &image[crate::block::BLOCK_HEADER_BYTE_SIZE..],
            header.entries,
            512,
        )
        .unwrap();
        assert_eq!(page2.entries(), 10);
        assert_eq!(page2.value(0), Some(&ColValue::Plain(vec![1])));
        assert_eq!(page2.value(9), Some(&ColValue::Plain(vec![2])));
    }

    #[test]
    fn col_fix_updates_override() {
        let dir = tempfile::tempdir().unwrap();
        let block = block(&dir);
        let data = vec![9u8; 8];
        let page = ColFixPage::from_image(&data, 8, 1).unwrap();
        page.updates().insert(3, Update::new(1, Some(vec![42])));
        // Append one record past the disk range.
        page.updates().insert(9, Update::new(1, Some(vec![7])));
        let r = recon(&block).col_fix(&page, 1).unwrap();
        let cookie = match r.result {
            ReconResult::Replace(c) => c,
            other => panic!("expected replace, got {other:?}"),
        };
        let image = block.read(cookie).unwrap();
        let header = parse_header(&image);
        assert_eq!(header.entries, 9);
        let page2 = ColFixPage::from_image(
            &image[crate::block::BLOCK_HEADER_BYTE_SIZE..],
            header.entries,
            1,
        )
        .unwrap();
        assert_eq!(page2.value(2), Some(&[42u8][..]));
        assert_eq!(page2.value(0), Some(&[9u8][..]));
        // The gap introduced by the append is zero-filled.
        assert_eq!(page2.value(7), Some(&[0u8][..]));
        assert_eq!(page2.value(8), Some(&[7u8][..]));
    }
}
