//! In-memory pages and the reference-cell state machine.
//!
//! Pages are arena-allocated and named by stable `u32` ids; the tree never
//! holds direct pointers between pages. A parent reaches a child through a
//! [`Ref`] cell whose atomic state drives every transition a concurrent
//! reader can observe: `Disk -> Reading -> Mem` on page-in, and
//! `Mem -> Locked -> {Mem, Disk, Deleted, Split}` for eviction, splits, and
//! fast-truncate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::block::Cookie;

pub mod cell;
pub mod col;
pub mod insert;
pub mod recon;
pub mod row;

pub use col::{ColFixPage, ColIntPage, ColVarPage};
pub use insert::{InsertList, Update, UpdateChain};
pub use row::{RowIntPage, RowLeafPage};

/// Stable arena index of a page.
pub type PageId = u32;

pub const INVALID_PAGE: PageId = u32::MAX;

/// On-disk page type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    RowInt = 1,
    RowLeaf = 2,
    ColInt = 3,
    ColFix = 4,
    ColVar = 5,
    /// A single oversized item in its own blocks.
    Ovfl = 6,
}

impl PageType {
    pub fn from_u8(v: u8) -> Option<PageType> {
        Some(match v {
            1 => PageType::RowInt,
            2 => PageType::RowLeaf,
            3 => PageType::ColInt,
            4 => PageType::ColFix,
            5 => PageType::ColVar,
            6 => PageType::Ovfl,
            _ => return None,
        })
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageType::RowLeaf | PageType::ColFix | PageType::ColVar)
    }
}

/// Fixed header at the front of every on-disk page image; the block header
/// follows it.
#[derive(Debug, Clone, Copy, bytemuck::Zeroable, bytemuck::Pod)]
#[repr(C)]
pub struct PageHeader {
    /// First record number (column stores; zero for row stores).
    pub recno: u64,
    /// Write generation, advanced on every reconciliation.
    pub gen: u64,
    /// In-memory footprint hint captured at reconciliation time.
    pub mem_size: u32,
    pub entries: u32,
    pub page_type: u8,
    pub flags: u8,
    pub unused: [u8; 6],
}

pub const PAGE_HEADER_SIZE: usize = std::mem::size_of::<PageHeader>();

/// States of a reference cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RefState {
    /// On disk only; `addr` holds the cookie.
    Disk = 0,
    /// A thread is materialising the page.
    Reading = 1,
    /// Exclusively held for eviction, split, or delete.
    Locked = 2,
    /// In memory; `page` holds the arena id.
    Mem = 3,
    /// The page was split; restart from the parent.
    Split = 4,
    /// Fast-truncated; children instantiate on demand for old snapshots.
    Deleted = 5,
}

impl RefState {
    fn from_u8(v: u8) -> RefState {
        match v {
            0 => RefState::Disk,
            1 => RefState::Reading,
            2 => RefState::Locked,
            3 => RefState::Mem,
            4 => RefState::Split,
            5 => RefState::Deleted,
            _ => unreachable!("invalid ref state"),
        }
    }
}

/// The key a parent stores for a child: a row-store boundary key or a
/// column-store starting record number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefKey {
    Row(Vec<u8>),
    Recno(u64),
}

impl RefKey {
    pub fn row(&self) -> &[u8] {
        match self {
            RefKey::Row(k) => k,
            RefKey::Recno(_) => panic!("row key requested from a column-store cell"),
        }
    }

    pub fn recno(&self) -> u64 {
        match self {
            RefKey::Recno(r) => *r,
            RefKey::Row(_) => panic!("record number requested from a row-store cell"),
        }
    }
}

/// Fast-truncate bookkeeping attached to a `Deleted` cell.
#[derive(Debug, Clone)]
pub struct DelState {
    /// The deleting transaction; readers with older snapshots instantiate
    /// the children on demand.
    pub txn: u64,
}

/// A parent's reference to one child page.
#[derive(Debug)]
pub struct Ref {
    state: AtomicU8,
    /// Arena id, meaningful in `Mem`, `Locked`, and `Split` states.
    page: AtomicU32,
    /// Backing block; [`Cookie::NONE`] for pages created in memory.
    addr: Mutex<Cookie>,
    pub key: RefKey,
    pub del: Mutex<Option<DelState>>,
}

impl Ref {
    pub fn new_disk(key: RefKey, addr: Cookie) -> Arc<Ref> {
        Arc::new(Ref {
            state: AtomicU8::new(RefState::Disk as u8),
            page: AtomicU32::new(INVALID_PAGE),
            addr: Mutex::new(addr),
            key,
            del: Mutex::new(None),
        })
    }

    pub fn new_mem(key: RefKey, page: PageId) -> Arc<Ref> {
        Arc::new(Ref {
            state: AtomicU8::new(RefState::Mem as u8),
            page: AtomicU32::new(page),
            addr: Mutex::new(Cookie::NONE),
            key,
            del: Mutex::new(None),
        })
    }

    pub fn state(&self) -> RefState {
        RefState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Try to move `from -> to`; both sides of the transition are published
    /// with acquire/release so the winner owns the cell.
    pub fn cas_state(&self, from: RefState, to: RefState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish a new state; only legal for the thread that won the
    /// preceding CAS into an exclusive state.
    pub fn publish(&self, state: RefState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn page_id(&self) -> PageId {
        self.page.load(Ordering::Acquire)
    }

    pub fn set_page_id(&self, id: PageId) {
        self.page.store(id, Ordering::Release);
    }

    pub fn addr(&self) -> Cookie {
        *self.addr.lock()
    }

    pub fn set_addr(&self, cookie: Cookie) {
        *self.addr.lock() = cookie;
    }
}

/// Typed body of an in-memory page.
pub enum PageKind {
    RowInt(RowIntPage),
    RowLeaf(RowLeafPage),
    ColInt(ColIntPage),
    ColFix(ColFixPage),
    ColVar(ColVarPage),
}

/// One materialised page.
pub struct Page {
    pub kind: PageKind,
    /// Starting record number for column pages.
    pub recno: u64,
    /// Eviction recency; low values are eviction candidates.
    pub read_gen: AtomicU64,
    /// Bytes this page pins in cache.
    pub footprint: AtomicU64,
    dirty: AtomicBool,
    /// The cell naming this page, once linked into a tree.
    pub own_ref: Mutex<Option<Arc<Ref>>>,
    /// Detached obsolete update chains, reclaimed when the page dies.
    obsolete: Mutex<Vec<*mut Update>>,
}

// Raw update pointers in `obsolete` are exclusively owned once detached.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub fn new(kind: PageKind, recno: u64) -> Page {
        Page {
            kind,
            recno,
            read_gen: AtomicU64::new(0),
            footprint: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            own_ref: Mutex::new(None),
            obsolete: Mutex::new(Vec::new()),
        }
    }

    pub fn page_type(&self) -> PageType {
        match &self.kind {
            PageKind::RowInt(_) => PageType::RowInt,
            PageKind::RowLeaf(_) => PageType::RowLeaf,
            PageKind::ColInt(_) => PageType::ColInt,
            PageKind::ColFix(_) => PageType::ColFix,
            PageKind::ColVar(_) => PageType::ColVar,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn bump_read_gen(&self, gen: u64) {
        // Monotone: never move a page backward toward eviction.
        self.read_gen.fetch_max(gen, Ordering::AcqRel);
    }

    pub fn add_footprint(&self, bytes: u64) {
        self.footprint.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Take ownership of a detached obsolete update chain; freed on drop.
    pub fn defer_obsolete(&self, chain: *mut Update) {
        if !chain.is_null() {
            self.obsolete.lock().push(chain);
        }
    }

    /// Child index of an internal page, `None` for leaves.
    pub fn index(&self) -> Option<Arc<Vec<Arc<Ref>>>> {
        match &self.kind {
            PageKind::RowInt(p) => Some(p.index()),
            PageKind::ColInt(p) => Some(p.index()),
            _ => None,
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        for chain in self.obsolete.get_mut().drain(..) {
            unsafe { insert::free_update_chain(chain) };
        }
    }
}

/// The page arena: stable ids, `Arc` slots, freelist reuse.
pub struct PageArena {
    slots: RwLock<Vec<Option<Arc<Page>>>>,
    free: Mutex<Vec<PageId>>,
}

impl Default for PageArena {
    fn default() -> Self {
        Self::new()
    }
}

impl PageArena {
    pub fn new() -> PageArena {
        PageArena {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn alloc(&self, page: Page) -> (PageId, Arc<Page>) {
        let page = Arc::new(page);
        let mut slots = self.slots.write();
        let id = match self.free.lock().pop() {
            Some(id) => {
                debug_assert!(slots[id as usize].is_none());
                slots[id as usize] = Some(page.clone());
                id
            }
            None => {
                slots.push(Some(page.clone()));
                (slots.len() - 1) as PageId
            }
        };
        (id, page)
    }

    pub fn get(&self, id: PageId) -> Option<Arc<Page>> {
        self.slots.read().get(id as usize)?.clone()
    }

    /// Unlink a page from the arena. The `Arc` keeps existing references
    /// alive; the id is recycled.
    pub fn remove(&self, id: PageId) -> Option<Arc<Page>> {
        let page = self.slots.write().get_mut(id as usize)?.take()?;
        self.free.lock().push(id);
        Some(page)
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
