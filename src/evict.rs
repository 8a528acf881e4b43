//! The shared page cache and the eviction server.
//!
//! The cache owns the page arena, the byte accounting, and the bounded
//! candidate queue. A dedicated server thread scans open trees round-robin
//! for pages with low read generations, queues them, and evicts: clean
//! pages are unlinked, dirty pages are reconciled first. Application
//! threads over the trigger assist with a bounded number of candidates;
//! over the hard cap they wait on the eviction condition variable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::btree::Btree;
use crate::error::{Error, Result};
use crate::hazard::HazardArray;
use crate::page::{PageArena, PageId, Ref};

/// Queue bound: candidates beyond this wait for the next pass.
pub const EVICT_QUEUE_MAX: usize = 400;

/// Candidates an application thread helps with before proceeding.
const EVICT_ASSIST: usize = 10;

const PAGE_LOCKS: usize = 64;

pub struct CacheConfig {
    pub max_bytes: u64,
    /// Percentage of `max_bytes` at which application threads assist.
    pub trigger_pct: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: 100 << 20,
            trigger_pct: 80,
        }
    }
}

type Candidate = (Weak<Btree>, Arc<Ref>);

pub struct Cache {
    pub arena: PageArena,
    bytes: AtomicU64,
    max: u64,
    trigger: u64,
    clock: AtomicU64,
    /// Registered per-session hazard tables the evictor must consult; weak
    /// so short-lived internal sessions don't accumulate.
    hazards: RwLock<Vec<Weak<HazardArray>>>,
    /// Rotating pool of page-modify locks, indexed by page id.
    page_locks: Vec<Mutex<()>>,
    queue: Mutex<VecDeque<Candidate>>,
    space_mtx: Mutex<()>,
    space_cond: Condvar,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Arc<Cache> {
        let trigger = config.max_bytes * config.trigger_pct.clamp(1, 100) / 100;
        Arc::new(Cache {
            arena: PageArena::new(),
            bytes: AtomicU64::new(0),
            max: config.max_bytes,
            trigger,
            clock: AtomicU64::new(1),
            hazards: RwLock::new(Vec::new()),
            page_locks: (0..PAGE_LOCKS).map(|_| Mutex::new(())).collect(),
            queue: Mutex::new(VecDeque::new()),
            space_mtx: Mutex::new(()),
            space_cond: Condvar::new(),
        })
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::AcqRel);
    }

    pub fn sub_bytes(&self, n: u64) {
        self.bytes.fetch_sub(n.min(self.bytes()), Ordering::AcqRel);
        self.space_cond.notify_all();
    }

    /// Read-generation clock tick.
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel)
    }

    pub fn over_trigger(&self) -> bool {
        self.bytes() > self.trigger
    }

    pub fn over_max(&self) -> bool {
        self.bytes() > self.max
    }

    pub fn page_lock(&self, id: PageId) -> MutexGuard<'_, ()> {
        self.page_locks[id as usize % PAGE_LOCKS].lock()
    }

    pub fn register_hazards(&self, h: Arc<HazardArray>) {
        let mut hazards = self.hazards.write();
        hazards.retain(|w| w.strong_count() > 0);
        hazards.push(Arc::downgrade(&h));
    }

    pub fn hazard_tables(&self) -> Vec<Arc<HazardArray>> {
        self.hazards
            .read()
            .iter()
            .filter_map(|w| w.upgrade())
            .collect()
    }

    fn pop_candidate(&self) -> Option<Candidate> {
        self.queue.lock().pop_front()
    }

    fn push_candidates(&self, batch: Vec<Candidate>) {
        let mut queue = self.queue.lock();
        for c in batch {
            if queue.len() >= EVICT_QUEUE_MAX {
                break;
            }
            queue.push_back(c);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Evict one queued candidate; `Ok(false)` when the queue is empty or
    /// the page couldn't be evicted.
    fn evict_one(&self) -> Result<bool> {
        let Some((tree, r)) = self.pop_candidate() else {
            return Ok(false);
        };
        let Some(tree) = tree.upgrade() else {
            return Ok(false);
        };
        let hazards = self.hazard_tables();
        tree.evict_ref(&r, &hazards)
    }

    /// Called by application threads before insert-class operations: over
    /// the trigger they help evict, over the cap they wait for the server.
    pub fn backpressure(&self, _tree: &Btree) -> Result<()> {
        if !self.over_trigger() {
            return Ok(());
        }
        for _ in 0..EVICT_ASSIST {
            if !self.over_trigger() {
                return Ok(());
            }
            let _ = self.evict_one()?;
        }
        let mut waited = Duration::ZERO;
        while self.over_max() {
            let mut guard = self.space_mtx.lock();
            if !self.over_max() {
                break;
            }
            self.space_cond
                .wait_for(&mut guard, Duration::from_millis(10));
            waited += Duration::from_millis(10);
            if waited > Duration::from_secs(5) {
                log::warn!("cache stayed over capacity; letting the operation through");
                return Err(Error::Busy);
            }
        }
        Ok(())
    }
}

/// The dedicated eviction worker (plus optional helpers).
pub struct EvictServer {
    stop: Arc<AtomicBool>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

pub type TreeRegistry = Arc<RwLock<Vec<Weak<Btree>>>>;

impl EvictServer {
    pub fn spawn(cache: Arc<Cache>, trees: TreeRegistry, helpers: usize) -> EvictServer {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        {
            let cache = cache.clone();
            let trees = trees.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("burrow-evict".into())
                    .spawn(move || Self::server(cache, trees, stop))
                    .expect("spawn eviction server"),
            );
        }
        for i in 0..helpers {
            let cache = cache.clone();
            let stop = stop.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("burrow-evict-{i}"))
                    .spawn(move || Self::helper(cache, stop))
                    .expect("spawn eviction helper"),
            );
        }
        EvictServer { stop, threads }
    }

    fn server(cache: Arc<Cache>, trees: TreeRegistry, stop: Arc<AtomicBool>) {
        log::debug!("eviction server started");
        let mut cursor = 0usize;
        while !stop.load(Ordering::Acquire) {
            if !cache.over_trigger() {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            Self::fill_queue(&cache, &trees, &mut cursor);
            let mut progress = false;
            while cache.over_trigger() {
                match cache.evict_one() {
                    Ok(true) => progress = true,
                    Ok(false) => break,
                    Err(e) => {
                        log::warn!("eviction pass failed: {e}");
                        break;
                    }
                }
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            if !progress {
                // Nothing evictable this pass; give readers time to move.
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        log::debug!("eviction server stopped");
    }

    fn helper(cache: Arc<Cache>, stop: Arc<AtomicBool>) {
        while !stop.load(Ordering::Acquire) {
            if !cache.over_trigger() {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            match cache.evict_one() {
                Ok(true) => {}
                _ => std::thread::sleep(Duration::from_millis(2)),
            }
        }
    }

    /// One round-robin pass over the open trees, queueing the coldest
    /// pages first.
    fn fill_queue(cache: &Arc<Cache>, trees: &TreeRegistry, cursor: &mut usize) {
        let room = EVICT_QUEUE_MAX.saturating_sub(cache.queue_len());
        if room == 0 {
            return;
        }
        let trees: Vec<Arc<Btree>> = {
            let list = trees.read();
            list.iter().filter_map(|w| w.upgrade()).collect()
        };
        if trees.is_empty() {
            return;
        }
        let mut batch: Vec<(Weak<Btree>, Arc<Ref>, u64)> = Vec::new();
        for i in 0..trees.len() {
            let tree = &trees[(*cursor + i) % trees.len()];
            let mut candidates = Vec::new();
            tree.evict_candidates(&mut candidates);
            for (r, gen) in candidates {
                batch.push((Arc::downgrade(tree), r, gen));
            }
        }
        *cursor = cursor.wrapping_add(1);
        // Cold pages first.
        batch.sort_by_key(|(_, _, gen)| *gen);
        cache.push_candidates(
            batch
                .into_iter()
                .take(room)
                .map(|(t, r, _)| (t, r))
                .collect(),
        );
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for EvictServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockConfig, BlockFile, OpenMode};
    use crate::btree::{BtreeConfig, StoreKind};
    use crate::error::PanicCell;
    use crate::page::RefState;
    use crate::session::Session;
    use crate::txn::TxnGlobal;

    fn tree_fixture(
        dir: &tempfile::TempDir,
        cache: Arc<Cache>,
    ) -> (Arc<Btree>, Arc<Session>) {
        let cfg = BlockConfig {
            allocation_unit: 512,
            ..Default::default()
        };
        let path = dir.path().join("e.bt");
        BlockFile::create(&path, &cfg).unwrap();
        let panic = Arc::new(PanicCell::new());
        let block = Arc::new(
            BlockFile::open(&path, &cfg, OpenMode::Normal, panic.clone()).unwrap(),
        );
        let txn = Arc::new(TxnGlobal::new());
        let session = Session::new(txn.clone(), 256);
        cache.register_hazards(session.hazard.clone());
        let tree = Btree::create(
            "e.bt".into(),
            block,
            cache,
            txn,
            BtreeConfig {
                store: StoreKind::Row,
                split_size: 2048,
                ovfl_size: 1024,
                ..Default::default()
            },
            panic,
        );
        (tree, session)
    }

    fn fill(tree: &Arc<Btree>, session: &Session, n: usize) {
        for i in 0..n {
            let key = format!("key{i:05}").into_bytes();
            tree.put(session, &key, Some(&[7u8; 64]), true).unwrap();
        }
        tree.checkpoint().unwrap();
        tree.block().checkpoint_resolve().unwrap();
    }

    #[test]
    fn hazard_blocks_eviction_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(CacheConfig::default());
        let (tree, session) = tree_fixture(&dir, cache.clone());
        fill(&tree, &session, 500);

        // Find a leaf and pin it with a hazard.
        let root = tree.root();
        let root_page = tree.page_in(&root).unwrap();
        let index = root_page.index().expect("tree should have split");
        let leaf_ref = index[0].clone();
        let _leaf = tree.page_in(&leaf_ref).unwrap();
        let held = session.hazard.set(&leaf_ref).unwrap().expect("hazard");

        let hazards = cache.hazard_tables();
        assert!(!tree.evict_ref(&leaf_ref, &hazards).unwrap());
        assert_eq!(leaf_ref.state(), RefState::Mem);

        session.hazard.clear(held).unwrap();
        assert!(tree.evict_ref(&leaf_ref, &hazards).unwrap());
        assert_eq!(leaf_ref.state(), RefState::Disk);

        // The evicted page reads back on demand.
        let got = tree.get(&session, b"key00000").unwrap();
        assert_eq!(got, Some(vec![7u8; 64]));
    }

    #[test]
    fn dirty_pages_reconcile_on_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(CacheConfig::default());
        let (tree, session) = tree_fixture(&dir, cache.clone());
        fill(&tree, &session, 500);

        // Dirty one leaf, then evict it: the write must survive.
        tree.put(&session, b"key00001", Some(b"fresh"), true).unwrap();
        let root = tree.root();
        let root_page = tree.page_in(&root).unwrap();
        let leaf_ref = root_page.index().unwrap()[0].clone();
        let hazards = cache.hazard_tables();
        assert!(tree.evict_ref(&leaf_ref, &hazards).unwrap());
        assert_eq!(
            tree.get(&session, b"key00001").unwrap(),
            Some(b"fresh".to_vec())
        );
    }

    #[test]
    fn server_reclaims_cold_pages() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(CacheConfig {
            max_bytes: 64 * 1024,
            trigger_pct: 50,
        });
        let (tree, session) = tree_fixture(&dir, cache.clone());
        let trees: TreeRegistry = Arc::new(RwLock::new(vec![Arc::downgrade(&tree)]));
        fill(&tree, &session, 800);
        // Fault every leaf back in; the clean pages pile up past the
        // trigger.
        for i in 0..800 {
            let key = format!("key{i:05}").into_bytes();
            assert!(tree.get(&session, &key).unwrap().is_some());
        }
        assert!(cache.over_trigger());

        let server = EvictServer::spawn(cache.clone(), trees, 1);
        let mut waited = 0;
        while cache.over_trigger() && waited < 5000 {
            std::thread::sleep(Duration::from_millis(10));
            waited += 10;
        }
        server.stop();
        assert!(
            !cache.over_trigger(),
            "eviction never brought the cache under its trigger"
        );
        // Everything must still be readable.
        assert_eq!(
            tree.get(&session, b"key00700").unwrap(),
            Some(vec![7u8; 64])
        );
    }
}
