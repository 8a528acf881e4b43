//! The B-tree: page-in, search, mutation, tree-wide checkpoint, and the
//! per-page half of eviction.
//!
//! All traversal couples hazard pointers: a walker protects the child
//! before dropping the parent's protection, and restarts from the root
//! when it observes a `Split` cell.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backoff::Backoff;
use crate::block::{BlockFile, CheckpointDesc, Cookie, BLOCK_HEADER_BYTE_SIZE};
use crate::compress::{Compressor, NoopCompressor};
use crate::error::{Error, PanicCell, Result};
use crate::evict::Cache;
use crate::hazard::HazardArray;
use crate::page::col::ColValue;
use crate::page::insert::Update;
use crate::page::recon::{ReconResult, Reconciler};
use crate::page::row::{RowSearch, SlotValue};
use crate::page::{
    ColFixPage, ColIntPage, ColVarPage, DelState, Page, PageHeader, PageKind, PageType, Ref,
    RefKey, RefState, RowIntPage, RowLeafPage, INVALID_PAGE, PAGE_HEADER_SIZE,
};
use crate::session::Session;
use crate::txn::{Snapshot, TxnGlobal};

/// Which store shape this tree holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Row,
    ColFix,
    ColVar,
}

#[derive(Debug, Clone)]
pub struct BtreeConfig {
    pub store: StoreKind,
    /// Row keys are instantiated at page-in every `key_gap` slots.
    pub key_gap: usize,
    /// Target payload size of reconciled blocks.
    pub split_size: usize,
    /// Values past this size move to overflow blocks.
    pub ovfl_size: usize,
    /// Value width of fixed-length column stores.
    pub fix_width: u32,
    pub data_checksum: bool,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        BtreeConfig {
            store: StoreKind::Row,
            key_gap: 10,
            split_size: 32 * 1024,
            ovfl_size: 8 * 1024,
            fix_width: 1,
            data_checksum: true,
        }
    }
}

/// An overflow value cached while old readers may still need it.
struct CachedOvfl {
    data: Vec<u8>,
    /// Discard horizon: reclaimable once the oldest running transaction is
    /// past it.
    txn: u64,
}

pub struct Btree {
    name: String,
    block: Arc<BlockFile>,
    cache: Arc<Cache>,
    txn: Arc<TxnGlobal>,
    cfg: BtreeConfig,
    root: RwLock<Arc<Ref>>,
    /// Highest record number handed out (column stores).
    last_recno: AtomicU64,
    write_gen: AtomicU64,
    ovfl_cache: RwLock<HashMap<u64, CachedOvfl>>,
    /// Page images pass through here on the way to and from disk; the
    /// default is the identity.
    compressor: Arc<dyn Compressor>,
    /// Excludes eviction while a checkpoint restructures the tree.
    ckpt_lock: Mutex<()>,
    panic: Arc<PanicCell>,
}

impl Btree {
    /// Create an empty tree: the root is a fresh leaf, dirty in memory.
    pub fn create(
        name: String,
        block: Arc<BlockFile>,
        cache: Arc<Cache>,
        txn: Arc<TxnGlobal>,
        cfg: BtreeConfig,
        panic: Arc<PanicCell>,
    ) -> Arc<Btree> {
        let tree = Arc::new(Btree {
            name,
            block,
            cache,
            txn,
            cfg,
            root: RwLock::new(Ref::new_disk(RefKey::Row(Vec::new()), Cookie::NONE)),
            last_recno: AtomicU64::new(0),
            write_gen: AtomicU64::new(0),
            ovfl_cache: RwLock::new(HashMap::new()),
            compressor: Arc::new(NoopCompressor),
            ckpt_lock: Mutex::new(()),
            panic,
        });
        *tree.root.write() = tree.empty_root_ref();
        tree
    }

    /// Open a tree from a checkpoint's root cookie.
    pub fn open(
        name: String,
        block: Arc<BlockFile>,
        cache: Arc<Cache>,
        txn: Arc<TxnGlobal>,
        cfg: BtreeConfig,
        panic: Arc<PanicCell>,
        root: Cookie,
    ) -> Arc<Btree> {
        let tree = Btree::create(name, block, cache, txn, cfg, panic);
        if !root.is_none() {
            let key = tree.min_key();
            *tree.root.write() = Ref::new_disk(key, root);
        }
        tree
    }

    fn min_key(&self) -> RefKey {
        match self.cfg.store {
            StoreKind::Row => RefKey::Row(Vec::new()),
            _ => RefKey::Recno(1),
        }
    }

    fn empty_leaf(&self) -> PageKind {
        match self.cfg.store {
            StoreKind::Row => PageKind::RowLeaf(RowLeafPage::empty()),
            StoreKind::ColFix => PageKind::ColFix(ColFixPage::empty(self.cfg.fix_width)),
            StoreKind::ColVar => PageKind::ColVar(ColVarPage::empty()),
        }
    }

    fn empty_root_ref(&self) -> Arc<Ref> {
        let page = Page::new(self.empty_leaf(), 1);
        page.set_dirty();
        let (id, page) = self.cache.arena.alloc(page);
        self.cache.add_bytes(128);
        page.add_footprint(128);
        let r = Ref::new_mem(self.min_key(), id);
        *page.own_ref.lock() = Some(r.clone());
        r
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block(&self) -> &Arc<BlockFile> {
        &self.block
    }

    pub fn root(&self) -> Arc<Ref> {
        self.root.read().clone()
    }

    pub fn store(&self) -> StoreKind {
        self.cfg.store
    }

    /// Next record number for a column-store append.
    pub fn next_recno(&self) -> u64 {
        self.last_recno.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn note_recno(&self, recno: u64) {
        self.last_recno.fetch_max(recno, Ordering::AcqRel);
    }

    // ---------------------------------------------------------------- page-in

    /// Materialise the page a cell names, following the cell state machine.
    pub fn page_in(&self, r: &Arc<Ref>) -> Result<Arc<Page>> {
        let mut backoff = Backoff::default();
        loop {
            match r.state() {
                RefState::Mem => {
                    if let Some(page) = self.cache.arena.get(r.page_id()) {
                        page.bump_read_gen(self.cache.tick());
                        return Ok(page);
                    }
                    // Raced with eviction swapping the cell; go around.
                    backoff.wait();
                }
                RefState::Reading | RefState::Locked => backoff.wait(),
                RefState::Split => return Err(Error::Restart),
                RefState::Disk => {
                    if !r.cas_state(RefState::Disk, RefState::Reading) {
                        continue;
                    }
                    match self.read_page(r, None) {
                        Ok(page) => {
                            r.publish(RefState::Mem);
                            return Ok(page);
                        }
                        Err(e) => {
                            r.publish(RefState::Disk);
                            return Err(e);
                        }
                    }
                }
                RefState::Deleted => {
                    if !r.cas_state(RefState::Deleted, RefState::Locked) {
                        continue;
                    }
                    let del = r.del.lock().clone();
                    match self.read_page(r, del) {
                        Ok(page) => {
                            r.publish(RefState::Mem);
                            return Ok(page);
                        }
                        Err(e) => {
                            r.publish(RefState::Deleted);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Read and decode a page image; a zero-size address synthesises an
    /// empty leaf. `del` overlays fast-truncate tombstones so readers with
    /// older snapshots still see the children.
    fn read_page(&self, r: &Arc<Ref>, del: Option<DelState>) -> Result<Arc<Page>> {
        let addr = r.addr();
        let page = if addr.is_none() {
            let recno = match &r.key {
                RefKey::Recno(n) => *n,
                RefKey::Row(_) => 0,
            };
            Page::new(self.empty_leaf(), recno.max(1))
        } else {
            let mut image = self.block.read(addr)?;
            self.compressor.decompress(&mut image)?;
            let header: PageHeader = *bytemuck::from_bytes(&image[..PAGE_HEADER_SIZE]);
            let payload = &image[BLOCK_HEADER_BYTE_SIZE..];
            let unit = self.block.allocation_unit();
            let kind = match PageType::from_u8(header.page_type) {
                Some(PageType::RowLeaf) => PageKind::RowLeaf(RowLeafPage::from_image(
                    payload,
                    header.entries,
                    unit,
                    self.cfg.key_gap,
                )?),
                Some(PageType::RowInt) => {
                    PageKind::RowInt(RowIntPage::from_image(payload, header.entries, unit)?)
                }
                Some(PageType::ColInt) => {
                    PageKind::ColInt(ColIntPage::from_image(payload, header.entries, unit)?)
                }
                Some(PageType::ColFix) => PageKind::ColFix(ColFixPage::from_image(
                    payload,
                    header.entries,
                    self.cfg.fix_width,
                )?),
                Some(PageType::ColVar) => {
                    PageKind::ColVar(ColVarPage::from_image(payload, header.entries, unit)?)
                }
                _ => return Err(Error::corrupt("btree", addr.off, "unexpected page type")),
            };
            Page::new(kind, header.recno.max(1))
        };

        if let Some(del) = del {
            Self::apply_fast_delete(&page, del.txn);
            // The tombstones must reach disk for the truncate to stick.
            page.set_dirty();
        }

        let footprint = self.page_footprint(&page);
        let (id, page) = self.cache.arena.alloc(page);
        page.add_footprint(footprint);
        self.cache.add_bytes(footprint);
        *page.own_ref.lock() = Some(r.clone());
        r.set_page_id(id);
        page.bump_read_gen(self.cache.tick());
        Ok(page)
    }

    fn page_footprint(&self, page: &Page) -> u64 {
        match &page.kind {
            PageKind::RowLeaf(p) => p.footprint(),
            PageKind::RowInt(p) => p.footprint(),
            PageKind::ColInt(p) => p.footprint(),
            PageKind::ColFix(p) => p.footprint(),
            PageKind::ColVar(p) => p.footprint(),
        }
    }

    /// Overlay a committed delete on every entry of a truncated page.
    fn apply_fast_delete(page: &Page, txn: u64) {
        match &page.kind {
            PageKind::RowLeaf(leaf) => {
                for i in 0..leaf.entries() {
                    leaf.updates(i).prepend(Update::new(txn, None));
                }
            }
            PageKind::ColFix(p) => {
                let start = page.recno;
                for i in 0..p.entries() {
                    p.updates().insert(start + i, Update::new(txn, None));
                }
            }
            PageKind::ColVar(p) => {
                let start = page.recno;
                for i in 0..p.entries() {
                    p.updates().insert(start + i, Update::new(txn, None));
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------- traversal

    /// Descend to the leaf owning `key`/`recno`, hazard-coupled. On return
    /// the leaf's hazard is held on the returned page id and must be
    /// cleared by the caller.
    fn descend(
        &self,
        session: &Session,
        key: Option<&[u8]>,
        recno: u64,
    ) -> Result<(Arc<Ref>, Arc<Page>, crate::page::PageId)> {
        'restart: loop {
            let mut cur = self.root();
            let mut held: Option<u32> = None;
            loop {
                let page = match self.page_in(&cur) {
                    Err(Error::Restart) => {
                        if let Some(id) = held.take() {
                            session.hazard.clear(id)?;
                        }
                        continue 'restart;
                    }
                    other => other?,
                };
                let id = match session.hazard.set(&cur)? {
                    Some(id) => id,
                    None => continue, // cell moved; re-run page_in
                };
                if let Some(prev) = held.take() {
                    session.hazard.clear(prev)?;
                }
                held = Some(id);
                match &page.kind {
                    PageKind::RowInt(int) => {
                        let (_, child) = int.search(key.expect("row key"));
                        cur = child;
                    }
                    PageKind::ColInt(int) => {
                        let (_, child) = int.search(recno);
                        cur = child;
                    }
                    _ => return Ok((cur, page, id)),
                }
            }
        }
    }

    // ------------------------------------------------------------------ read

    pub fn get(&self, session: &Session, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.panic.check()?;
        let snap = session.snapshot();
        let (_r, page, held) = self.descend(session, Some(key), 0)?;
        let result = self.leaf_get(&page, key, &snap);
        session.hazard.clear(held)?;
        result
    }

    fn leaf_get(&self, page: &Page, key: &[u8], snap: &Snapshot) -> Result<Option<Vec<u8>>> {
        let leaf = match &page.kind {
            PageKind::RowLeaf(l) => l,
            _ => return Err(Error::corrupt("btree", 0, "row read reached a column page")),
        };
        match leaf.search(key) {
            RowSearch::Match(i) => match leaf.updates(i).visible(snap) {
                Some(upd) => Ok(upd.data.clone()),
                None => match leaf.value(i) {
                    SlotValue::Plain(v) => Ok(Some(v.clone())),
                    SlotValue::Ovfl(c) => Ok(Some(self.ovfl_read(*c)?)),
                },
            },
            RowSearch::Gap(i) => match leaf.insert_list(i).search(key) {
                Some(node) => match node.upd.visible(snap) {
                    Some(upd) => Ok(upd.data.clone()),
                    None => Ok(None),
                },
                None => Ok(None),
            },
        }
    }

    pub fn get_col(&self, session: &Session, recno: u64) -> Result<Option<Vec<u8>>> {
        self.panic.check()?;
        let snap = session.snapshot();
        let (_r, page, held) = self.descend(session, None, recno)?;
        let result = self.leaf_get_col(&page, recno, &snap);
        session.hazard.clear(held)?;
        result
    }

    fn leaf_get_col(&self, page: &Page, recno: u64, snap: &Snapshot) -> Result<Option<Vec<u8>>> {
        let start = page.recno;
        match &page.kind {
            PageKind::ColFix(p) => {
                if let Some(node) = p.updates().search(&recno) {
                    if let Some(upd) = node.upd.visible(snap) {
                        return Ok(upd.data.clone());
                    }
                }
                if recno < start {
                    return Ok(None);
                }
                Ok(p.value(recno - start).map(|v| v.to_vec()))
            }
            PageKind::ColVar(p) => {
                if let Some(node) = p.updates().search(&recno) {
                    if let Some(upd) = node.upd.visible(snap) {
                        return Ok(upd.data.clone());
                    }
                }
                if recno < start {
                    return Ok(None);
                }
                match p.value(recno - start) {
                    Some(ColValue::Plain(v)) => Ok(Some(v.clone())),
                    Some(ColValue::Ovfl(c)) => Ok(Some(self.ovfl_read(*c)?)),
                    Some(ColValue::Del) | None => Ok(None),
                }
            }
            _ => Err(Error::corrupt("btree", 0, "column read reached a row page")),
        }
    }

    // ----------------------------------------------------------------- write

    /// Insert or update a row; `overwrite = false` fails on a visible
    /// duplicate.
    pub fn put(
        &self,
        session: &Session,
        key: &[u8],
        value: Option<&[u8]>,
        overwrite: bool,
    ) -> Result<()> {
        self.panic.check()?;
        self.cache.backpressure(self)?;
        let snap = session.snapshot();
        let (_r, page, held) = self.descend(session, Some(key), 0)?;
        let result = self.leaf_put(session, &page, key, value, overwrite, &snap, held);
        session.hazard.clear(held)?;
        result
    }

    fn leaf_put(
        &self,
        session: &Session,
        page: &Arc<Page>,
        key: &[u8],
        value: Option<&[u8]>,
        overwrite: bool,
        snap: &Snapshot,
        page_id: crate::page::PageId,
    ) -> Result<()> {
        let leaf = match &page.kind {
            PageKind::RowLeaf(l) => l,
            _ => return Err(Error::corrupt("btree", 0, "row write reached a column page")),
        };
        let _lock = self.cache.page_lock(page_id);
        let txn_id = session.mutation_txn();
        let delta = key.len() + value.map(|v| v.len()).unwrap_or(0) + 96;
        match leaf.search(key) {
            RowSearch::Match(i) => {
                if !overwrite && value.is_some() && self.slot_live(leaf, i, snap)? {
                    return Err(Error::DuplicateKey);
                }
                if value.is_none() && !self.slot_live(leaf, i, snap)? {
                    return Err(Error::NotFound);
                }
                let upd = leaf
                    .updates(i)
                    .prepend(Update::new(txn_id, value.map(|v| v.to_vec())));
                session.record_mod(upd);
                // Trim history no snapshot can reach; reclaim is deferred
                // to the page's teardown.
                page.defer_obsolete(leaf.updates(i).obsolete_check(self.txn.oldest()));
            }
            RowSearch::Gap(i) => {
                let list = leaf.insert_list(i);
                let live = list
                    .search(key)
                    .and_then(|n| n.upd.visible(snap))
                    .map(|u| u.data.is_some())
                    .unwrap_or(false);
                if !overwrite && value.is_some() && live {
                    return Err(Error::DuplicateKey);
                }
                if value.is_none() && !live {
                    return Err(Error::NotFound);
                }
                let node = list.insert(
                    key.to_vec(),
                    Update::new(txn_id, value.map(|v| v.to_vec())),
                );
                session.record_mod(node.upd.newest().expect("fresh update"));
                page.defer_obsolete(node.upd.obsolete_check(self.txn.oldest()));
            }
        }
        page.set_dirty();
        page.add_footprint(delta as u64);
        self.cache.add_bytes(delta as u64);
        Ok(())
    }

    fn slot_live(&self, leaf: &RowLeafPage, i: usize, snap: &Snapshot) -> Result<bool> {
        Ok(match leaf.updates(i).visible(snap) {
            Some(upd) => upd.data.is_some(),
            None => true, // the disk value stands
        })
    }

    pub fn remove(&self, session: &Session, key: &[u8]) -> Result<()> {
        self.put(session, key, None, true)
    }

    /// Insert or update one record of a column store.
    pub fn put_col(&self, session: &Session, recno: u64, value: Option<&[u8]>) -> Result<()> {
        self.panic.check()?;
        self.cache.backpressure(self)?;
        let (_r, page, held) = self.descend(session, None, recno)?;
        let updates = match &page.kind {
            PageKind::ColFix(p) => p.updates(),
            PageKind::ColVar(p) => p.updates(),
            _ => {
                session.hazard.clear(held)?;
                return Err(Error::corrupt("btree", 0, "column write reached a row page"));
            }
        };
        let result = (|| {
            let _lock = self.cache.page_lock(held);
            let txn_id = session.mutation_txn();
            let node = updates.insert(recno, Update::new(txn_id, value.map(|v| v.to_vec())));
            session.record_mod(node.upd.newest().expect("fresh update"));
            page.defer_obsolete(node.upd.obsolete_check(self.txn.oldest()));
            self.note_recno(recno);
            let delta = value.map(|v| v.len()).unwrap_or(0) as u64 + 96;
            page.set_dirty();
            page.add_footprint(delta);
            self.cache.add_bytes(delta);
        })();
        session.hazard.clear(held)?;
        Ok(result)
    }

    // -------------------------------------------------------------- overflow

    /// Read an overflow value, preferring the removal cache so old readers
    /// survive the block being freed.
    fn ovfl_read(&self, cookie: Cookie) -> Result<Vec<u8>> {
        if let Some(hit) = self.ovfl_cache.read().get(&cookie.off) {
            return Ok(hit.data.clone());
        }
        let mut image = self.block.read(cookie)?;
        self.compressor.decompress(&mut image)?;
        let header: PageHeader = *bytemuck::from_bytes(&image[..PAGE_HEADER_SIZE]);
        let len = header.mem_size as usize;
        let payload = &image[BLOCK_HEADER_BYTE_SIZE..];
        if payload.len() < len {
            return Err(Error::corrupt("overflow", cookie.off, "short overflow block"));
        }
        Ok(payload[..len].to_vec())
    }

    /// Cache a superseded overflow value, then free its block.
    fn ovfl_discard(&self, cookie: Cookie) -> Result<()> {
        let data = self.ovfl_read(cookie)?;
        self.ovfl_cache.write().insert(
            cookie.off,
            CachedOvfl {
                data,
                txn: self.txn.snapshot().snap_max,
            },
        );
        self.block.free(cookie)
    }

    /// Drop cached overflow values no running transaction can still need.
    pub fn ovfl_cache_sweep(&self) {
        let oldest = self.txn.oldest();
        self.ovfl_cache.write().retain(|_, v| v.txn >= oldest);
    }

    // --------------------------------------------------------- fast truncate

    /// Fast-truncate the subtree at `r`: flip the cell to `Deleted` and
    /// record the deleting transaction; children materialise on demand for
    /// older snapshots.
    pub fn truncate_ref(&self, session: &Session, r: &Arc<Ref>) -> Result<()> {
        let txn_id = session.mutation_txn();
        if !r.cas_state(RefState::Disk, RefState::Locked) {
            return Err(Error::Busy);
        }
        *r.del.lock() = Some(DelState { txn: txn_id });
        r.publish(RefState::Deleted);
        log::debug!("{}: fast-truncated subtree (txn {txn_id})", self.name);
        Ok(())
    }

    // ------------------------------------------------------------ checkpoint

    /// Reconcile every dirty page and write a checkpoint of the backing
    /// file. Returns the descriptor for the caller to persist.
    pub fn checkpoint(&self) -> Result<CheckpointDesc> {
        self.panic.check()?;
        let _g = self.ckpt_lock.lock();
        let snap = self.txn.snapshot();
        let gen = self.write_gen.fetch_add(1, Ordering::AcqRel) + 1;
        let rec = Reconciler::new(
            &self.block,
            snap.clone(),
            self.cfg.split_size,
            self.cfg.ovfl_size,
            gen,
            self.cfg.data_checksum,
            self.compressor.as_ref(),
        );

        let root = self.root();
        let mut refs = self.sync_ref(&rec, &root, &snap)?;

        // Collapse multi-block roots under new internal pages until a
        // single root remains.
        while refs.len() > 1 {
            let int_type = match self.cfg.store {
                StoreKind::Row => PageType::RowInt,
                _ => PageType::ColInt,
            };
            let done = rec.internal(int_type, &refs)?;
            match done.result {
                ReconResult::Replace(cookie) => {
                    let first = refs[0].key.clone();
                    let kind = match int_type {
                        PageType::RowInt => PageKind::RowInt(RowIntPage::new(refs.clone())),
                        _ => PageKind::ColInt(ColIntPage::new(refs.clone())),
                    };
                    let page = Page::new(kind, 1);
                    let footprint = self.page_footprint(&page);
                    let (id, page) = self.cache.arena.alloc(page);
                    page.add_footprint(footprint);
                    self.cache.add_bytes(footprint);
                    let new_root = Ref::new_mem(first, id);
                    new_root.set_addr(cookie);
                    *page.own_ref.lock() = Some(new_root.clone());
                    refs = vec![new_root];
                }
                ReconResult::Split(chunks) => {
                    refs = chunks
                        .into_iter()
                        .map(|(key, cookie)| Ref::new_disk(key, cookie))
                        .collect();
                }
                ReconResult::Empty => {
                    refs.clear();
                }
            }
        }

        let root_ref = match refs.pop() {
            Some(r) => r,
            None => self.empty_root_ref(),
        };
        *self.root.write() = root_ref.clone();
        let root_cookie = root_ref.addr();

        let mut desc = self.block.checkpoint(None, self.cfg.data_checksum)?;
        desc.root = root_cookie;
        self.ovfl_cache_sweep();
        Ok(desc)
    }

    /// Reconcile the subtree at `r`, returning the cells that replace it in
    /// the parent: one normally, several after a split, none when the
    /// subtree died.
    fn sync_ref(
        &self,
        rec: &Reconciler<'_>,
        r: &Arc<Ref>,
        snap: &Snapshot,
    ) -> Result<Vec<Arc<Ref>>> {
        match r.state() {
            RefState::Disk => return Ok(vec![r.clone()]),
            RefState::Deleted => {
                let del = r.del.lock().clone();
                let visible_to_all = del
                    .map(|d| d.txn != crate::txn::TXN_ABORTED && d.txn < self.txn.oldest())
                    .unwrap_or(true);
                if visible_to_all {
                    // The whole subtree is dead: discard its backing blocks.
                    let addr = r.addr();
                    self.discard_subtree_blocks(addr)?;
                    return Ok(vec![]);
                }
                return Ok(vec![r.clone()]);
            }
            _ => {}
        }

        let page = self.page_in(r)?;

        // Internal pages: sync the children first; splits and empties
        // rewrite the child index.
        if let Some(index) = page.index() {
            let mut new_children: Vec<Arc<Ref>> = Vec::with_capacity(index.len());
            let mut changed = false;
            for child in index.iter() {
                let replacements = self.sync_ref(rec, child, snap)?;
                if replacements.len() != 1 || !Arc::ptr_eq(&replacements[0], child) {
                    changed = true;
                }
                new_children.extend(replacements);
            }
            if changed {
                if new_children.is_empty() {
                    // Every child died: this internal page dies with them.
                    self.unlink_page(r, &page, RefState::Split)?;
                    let old = r.addr();
                    if !old.is_none() {
                        self.block.free(old)?;
                    }
                    return Ok(vec![]);
                }
                match &page.kind {
                    PageKind::RowInt(p) => p.replace_index(new_children),
                    PageKind::ColInt(p) => p.replace_index(new_children),
                    _ => unreachable!(),
                }
                page.set_dirty();
            }
        }

        if !page.is_dirty() {
            return Ok(vec![r.clone()]);
        }

        let fully_visible = self.page_fully_visible(&page, self.txn.oldest());
        let mut discards = Vec::new();
        let mut done = self.reconcile_page(rec, &page)?;
        if matches!(done.result, ReconResult::Split(_)) && !fully_visible {
            // Splitting would discard in-memory history an old snapshot
            // still needs; fall back to one oversized block and keep the
            // page.
            discards.append(&mut done.discarded_ovfl);
            if let ReconResult::Split(chunks) = done.result {
                for (_, cookie) in chunks {
                    self.block.free(cookie)?;
                }
            }
            done = self.reconcile_page(&rec.unsplit(), &page)?;
        }
        discards.append(&mut done.discarded_ovfl);
        for cookie in discards {
            self.ovfl_discard(cookie)?;
        }
        let old = r.addr();
        match done.result {
            ReconResult::Empty => {
                if !old.is_none() {
                    self.block.free(old)?;
                }
                if !fully_visible {
                    // Nothing committed survives, but old snapshots still
                    // read through this cell: keep it with no backing
                    // block, excluded from the parent's image.
                    r.set_addr(Cookie::NONE);
                    page.set_dirty();
                    return Ok(vec![r.clone()]);
                }
                self.unlink_page(r, &page, RefState::Split)?;
                Ok(vec![])
            }
            ReconResult::Replace(cookie) => {
                if !old.is_none() {
                    self.block.free(old)?;
                }
                r.set_addr(cookie);
                if self.page_has_invisible(&page, snap) {
                    // Uncommitted updates stayed behind; the page is still
                    // dirty for the next pass.
                    page.set_dirty();
                } else {
                    page.clear_dirty();
                    // A leaf whose whole history is visible to everyone can
                    // drop out of cache: the fresh image carries all of it,
                    // and no snapshot needs the in-memory chains. Pages a
                    // reader currently protects stay put.
                    let id = r.page_id();
                    if page.index().is_none()
                        && fully_visible
                        && !self.cache.hazard_tables().iter().any(|h| h.protects(id))
                    {
                        self.unlink_page(r, &page, RefState::Disk)?;
                    }
                }
                Ok(vec![r.clone()])
            }
            ReconResult::Split(chunks) => {
                if !old.is_none() {
                    self.block.free(old)?;
                }
                let refs: Vec<Arc<Ref>> = chunks
                    .into_iter()
                    .map(|(key, cookie)| Ref::new_disk(key, cookie))
                    .collect();
                self.unlink_page(r, &page, RefState::Split)?;
                Ok(refs)
            }
        }
    }

    /// Dispatch a page to the reconciler for its kind.
    fn reconcile_page(
        &self,
        rec: &Reconciler<'_>,
        page: &Page,
    ) -> Result<crate::page::recon::Reconciled> {
        Ok(match &page.kind {
            PageKind::RowLeaf(leaf) => rec.row_leaf(leaf)?,
            PageKind::ColFix(p) => rec.col_fix(p, page.recno)?,
            PageKind::ColVar(p) => rec.col_var(p, page.recno)?,
            PageKind::RowInt(p) => rec.internal(PageType::RowInt, &p.index())?,
            PageKind::ColInt(p) => rec.internal(PageType::ColInt, &p.index())?,
        })
    }

    /// Remove a page from the cache and flip its cell so concurrent
    /// walkers restart.
    fn unlink_page(&self, r: &Arc<Ref>, page: &Arc<Page>, state: RefState) -> Result<()> {
        let id = r.page_id();
        if self.cache.arena.remove(id).is_some() {
            self.cache.sub_bytes(page.footprint.load(Ordering::Acquire));
        }
        r.set_page_id(INVALID_PAGE);
        r.publish(state);
        Ok(())
    }

    /// Free the blocks of an un-materialised subtree (fast-truncate
    /// resolution). Internal pages are read to find their children.
    fn discard_subtree_blocks(&self, addr: Cookie) -> Result<()> {
        if addr.is_none() {
            return Ok(());
        }
        let image = self.block.read(addr)?;
        let header: PageHeader = *bytemuck::from_bytes(&image[..PAGE_HEADER_SIZE]);
        let payload = &image[BLOCK_HEADER_BYTE_SIZE..];
        let unit = self.block.allocation_unit();
        match PageType::from_u8(header.page_type) {
            Some(PageType::RowInt) => {
                let page = RowIntPage::from_image(payload, header.entries, unit)?;
                for child in page.index().iter() {
                    self.discard_subtree_blocks(child.addr())?;
                }
            }
            Some(PageType::ColInt) => {
                let page = ColIntPage::from_image(payload, header.entries, unit)?;
                for child in page.index().iter() {
                    self.discard_subtree_blocks(child.addr())?;
                }
            }
            _ => {}
        }
        self.block.free(addr)
    }

    /// True when every update on the page is either aborted or visible to
    /// every current and future snapshot: nothing in memory says more than
    /// the freshly written image does.
    fn page_fully_visible(&self, page: &Page, oldest: u64) -> bool {
        let chain_ok = |chain: &crate::page::insert::UpdateChain| {
            chain.iter().all(|u| {
                let id = u.txn_id();
                id == crate::txn::TXN_ABORTED || id < oldest
            })
        };
        match &page.kind {
            PageKind::RowLeaf(leaf) => {
                for i in 0..leaf.entries() {
                    if !chain_ok(leaf.updates(i)) {
                        return false;
                    }
                }
                for gap in 0..=leaf.entries() {
                    for node in leaf.insert_list(gap).iter() {
                        if !chain_ok(&node.upd) {
                            return false;
                        }
                    }
                }
                true
            }
            PageKind::ColFix(p) => p.updates().iter().all(|n| chain_ok(&n.upd)),
            PageKind::ColVar(p) => p.updates().iter().all(|n| chain_ok(&n.upd)),
            _ => false,
        }
    }

    /// Any update chain whose newest entry is invisible to `snap` keeps the
    /// page dirty and blocks eviction.
    pub fn page_has_invisible(&self, page: &Page, snap: &Snapshot) -> bool {
        let chain_blocked = |chain: &crate::page::insert::UpdateChain| match chain.newest() {
            Some(upd) => {
                let id = upd.txn_id();
                id != crate::txn::TXN_ABORTED && !snap.visible(id)
            }
            None => false,
        };
        match &page.kind {
            PageKind::RowLeaf(leaf) => {
                for i in 0..leaf.entries() {
                    if chain_blocked(leaf.updates(i)) {
                        return true;
                    }
                }
                for gap in 0..=leaf.entries() {
                    for node in leaf.insert_list(gap).iter() {
                        if chain_blocked(&node.upd) {
                            return true;
                        }
                    }
                }
                false
            }
            PageKind::ColFix(p) => p.updates().iter().any(|n| chain_blocked(&n.upd)),
            PageKind::ColVar(p) => p.updates().iter().any(|n| chain_blocked(&n.upd)),
            _ => false,
        }
    }

    // -------------------------------------------------------------- eviction

    /// Attempt to evict the page at `r`. Returns `Ok(true)` when the page
    /// left the cache.
    pub fn evict_ref(&self, r: &Arc<Ref>, hazards: &[Arc<HazardArray>]) -> Result<bool> {
        let Some(_g) = self.ckpt_lock.try_lock() else {
            return Ok(false);
        };
        if Arc::ptr_eq(&self.root(), r) {
            return Ok(false); // the root stays pinned
        }
        if !r.cas_state(RefState::Mem, RefState::Locked) {
            return Ok(false);
        }
        let id = r.page_id();
        // The full fence in hazard publication pairs with this scan: either
        // the reader's hazard is visible here, or the reader revalidates
        // and sees our Locked state.
        if hazards.iter().any(|h| h.protects(id)) {
            r.publish(RefState::Mem);
            return Ok(false);
        }
        let Some(page) = self.cache.arena.get(id) else {
            r.publish(RefState::Mem);
            return Ok(false);
        };

        // Internal pages with in-memory children stay put.
        if let Some(index) = page.index() {
            let active = index.iter().any(|c| {
                !matches!(c.state(), RefState::Disk | RefState::Deleted)
            });
            if active {
                r.publish(RefState::Mem);
                return Ok(false);
            }
        }

        // Evicting drops the in-memory update chains, so every update must
        // already be visible to every snapshot (this also rules out
        // uncommitted work).
        if !self.page_fully_visible(&page, self.txn.oldest()) {
            r.publish(RefState::Mem);
            return Ok(false);
        }

        if page.is_dirty() {
            let snap = self.txn.snapshot();
            let gen = self.write_gen.fetch_add(1, Ordering::AcqRel) + 1;
            let rec = Reconciler::new(
                &self.block,
                snap,
                self.cfg.split_size,
                self.cfg.ovfl_size,
                gen,
                self.cfg.data_checksum,
                self.compressor.as_ref(),
            );
            let done = self.reconcile_page(&rec, &page)?;
            for cookie in done.discarded_ovfl {
                self.ovfl_discard(cookie)?;
            }
            let old = r.addr();
            match done.result {
                ReconResult::Replace(cookie) => {
                    if !old.is_none() {
                        self.block.free(old)?;
                    }
                    r.set_addr(cookie);
                }
                ReconResult::Empty => {
                    if !old.is_none() {
                        self.block.free(old)?;
                    }
                    r.set_addr(Cookie::NONE);
                }
                ReconResult::Split(chunks) => {
                    // Splits restructure the parent; leave that to the
                    // checkpoint path and give the page back.
                    for (_, cookie) in chunks {
                        self.block.free(cookie)?;
                    }
                    r.publish(RefState::Mem);
                    return Ok(false);
                }
            }
            page.clear_dirty();
        }

        // Clean: unlink and publish the on-disk state.
        if self.cache.arena.remove(id).is_some() {
            self.cache.sub_bytes(page.footprint.load(Ordering::Acquire));
        }
        r.set_page_id(INVALID_PAGE);
        r.publish(RefState::Disk);
        log::trace!("{}: evicted page {id}", self.name);
        Ok(true)
    }

    /// Collect in-memory pages for the eviction scan, cheapest first.
    pub fn evict_candidates(&self, out: &mut Vec<(Arc<Ref>, u64)>) {
        fn walk(tree: &Btree, r: &Arc<Ref>, out: &mut Vec<(Arc<Ref>, u64)>) {
            if r.state() != RefState::Mem {
                return;
            }
            let Some(page) = tree.cache.arena.get(r.page_id()) else {
                return;
            };
            if let Some(index) = page.index() {
                for child in index.iter() {
                    walk(tree, child, out);
                }
            }
            out.push((r.clone(), page.read_gen.load(Ordering::Acquire)));
        }
        let root = self.root();
        if root.state() != RefState::Mem {
            return;
        }
        let Some(page) = self.cache.arena.get(root.page_id()) else {
            return;
        };
        // The root itself is never a candidate, only its descendants.
        if let Some(index) = page.index() {
            for child in index.iter() {
                walk(self, child, out);
            }
        }
    }

    // ------------------------------------------------------------------ scan

    /// In-order scan of every visible row, hazard-coupled per leaf. A split
    /// observed mid-walk restarts the scan.
    pub fn scan(&self, session: &Session) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let snap = session.snapshot();
        loop {
            let mut out = Vec::new();
            let root = self.root();
            match self.scan_ref(session, &root, &snap, &mut out) {
                Err(Error::Restart) => continue,
                Err(e) => return Err(e),
                Ok(()) => return Ok(out),
            }
        }
    }

    fn scan_ref(
        &self,
        session: &Session,
        r: &Arc<Ref>,
        snap: &Snapshot,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        if r.state() == RefState::Deleted {
            let del = r.del.lock().clone();
            if let Some(del) = del {
                if snap.visible(del.txn) {
                    return Ok(()); // truncated before our snapshot
                }
            }
        }
        let mut backoff = Backoff::default();
        let (page, held) = loop {
            let page = self.page_in(r)?;
            if let Some(id) = session.hazard.set(r)? {
                break (page, id);
            }
            backoff.wait();
        };
        let result = (|| {
            if let Some(index) = page.index() {
                for child in index.iter() {
                    self.scan_ref(session, child, snap, out)?;
                }
                return Ok(());
            }
            match &page.kind {
                PageKind::RowLeaf(leaf) => {
                    for slot in 0..=leaf.entries() {
                        for node in leaf.insert_list(slot).iter() {
                            if let Some(upd) = node.upd.visible(snap) {
                                if let Some(data) = &upd.data {
                                    out.push((node.key.clone(), data.clone()));
                                }
                            }
                        }
                        if slot == leaf.entries() {
                            break;
                        }
                        match leaf.updates(slot).visible(snap) {
                            Some(upd) => {
                                if let Some(data) = &upd.data {
                                    out.push((leaf.key(slot).to_vec(), data.clone()));
                                }
                            }
                            None => {
                                let value = match leaf.value(slot) {
                                    SlotValue::Plain(v) => v.clone(),
                                    SlotValue::Ovfl(c) => self.ovfl_read(*c)?,
                                };
                                out.push((leaf.key(slot).to_vec(), value));
                            }
                        }
                    }
                    Ok(())
                }
                _ => Err(Error::corrupt("btree", 0, "row scan reached a column page")),
            }
        })();
        session.hazard.clear(held)?;
        result
    }

    /// Discard the whole in-memory tree (close path); pages must already be
    /// checkpointed or the caller loses them deliberately.
    pub fn discard(&self) {
        fn walk(tree: &Btree, r: &Arc<Ref>) {
            if r.state() != RefState::Mem {
                return;
            }
            let Some(page) = tree.cache.arena.get(r.page_id()) else {
                return;
            };
            if let Some(index) = page.index() {
                for child in index.iter() {
                    walk(tree, child);
                }
            }
            if tree.cache.arena.remove(r.page_id()).is_some() {
                tree.cache
                    .sub_bytes(page.footprint.load(Ordering::Acquire));
            }
            r.set_page_id(INVALID_PAGE);
            r.publish(RefState::Disk);
        }
        let root = self.root();
        walk(self, &root);
    }
}
