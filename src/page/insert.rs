//! In-memory mutation structures: per-slot insert skip lists and update
//! chains.
//!
//! Writers are serialized by the owning page's lock; readers traverse
//! without any lock. A new node becomes reachable through a single
//! release CAS on the deepest (level zero) forward pointer, and readers
//! pair it with acquire loads, so a reader that sees the node sees it
//! fully built. Nodes are only reclaimed when the whole list is dropped,
//! and update chains detached by the obsolete check are parked on the page
//! for the same deferred reclaim.

use std::borrow::Borrow;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use rand::Rng;

use crate::txn::{Snapshot, TXN_ABORTED};

pub const INSERT_MAX_DEPTH: usize = 10;

/// One update in a chain, newest first.
pub struct Update {
    /// Writing transaction; rewritten to [`TXN_ABORTED`] on rollback.
    pub txn: AtomicU64,
    /// `None` is a tombstone.
    pub data: Option<Vec<u8>>,
    pub next: AtomicPtr<Update>,
}

impl Update {
    pub fn new(txn: u64, data: Option<Vec<u8>>) -> Box<Update> {
        Box::new(Update {
            txn: AtomicU64::new(txn),
            data,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub fn txn_id(&self) -> u64 {
        self.txn.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.txn.store(TXN_ABORTED, Ordering::Release);
    }
}

/// Free a raw chain; the caller must exclusively own it.
pub(crate) unsafe fn free_update_chain(mut chain: *mut Update) {
    while !chain.is_null() {
        let boxed = Box::from_raw(chain);
        chain = boxed.next.load(Ordering::Relaxed);
    }
}

/// Head of an update chain.
pub struct UpdateChain {
    head: AtomicPtr<Update>,
}

impl Default for UpdateChain {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateChain {
    pub fn new() -> UpdateChain {
        UpdateChain {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Prepend an update and return a reference with the chain's lifetime.
    pub fn prepend(&self, upd: Box<Update>) -> &Update {
        let raw = Box::into_raw(upd);
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, raw, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return unsafe { &*raw };
            }
        }
    }

    /// First update visible to `snap`, walking newest to oldest.
    pub fn visible(&self, snap: &Snapshot) -> Option<&Update> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let upd = unsafe { &*cur };
            if snap.visible(upd.txn_id()) {
                return Some(upd);
            }
            cur = upd.next.load(Ordering::Acquire);
        }
        None
    }

    /// Newest update regardless of visibility (reconciliation helper).
    pub fn newest(&self) -> Option<&Update> {
        let cur = self.head.load(Ordering::Acquire);
        if cur.is_null() {
            None
        } else {
            Some(unsafe { &*cur })
        }
    }

    /// Detach everything older than the first update visible to every live
    /// snapshot. Returns the detached tail, which the caller must park for
    /// deferred reclaim; freeing it in place would race readers that
    /// loaded the link before the detach.
    pub fn obsolete_check(&self, oldest: u64) -> *mut Update {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let upd = unsafe { &*cur };
            let txn = upd.txn_id();
            if txn != TXN_ABORTED && txn < oldest {
                let tail = upd.next.load(Ordering::Acquire);
                if tail.is_null() {
                    return ptr::null_mut();
                }
                if upd
                    .next
                    .compare_exchange(tail, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return tail;
                }
                return ptr::null_mut();
            }
            cur = upd.next.load(Ordering::Acquire);
        }
        ptr::null_mut()
    }

    pub fn iter(&self) -> UpdateIter<'_> {
        UpdateIter {
            cur: self.head.load(Ordering::Acquire),
            _chain: self,
        }
    }
}

impl Drop for UpdateChain {
    fn drop(&mut self) {
        unsafe { free_update_chain(*self.head.get_mut()) };
    }
}

pub struct UpdateIter<'a> {
    cur: *mut Update,
    _chain: &'a UpdateChain,
}

impl<'a> Iterator for UpdateIter<'a> {
    type Item = &'a Update;

    fn next(&mut self) -> Option<&'a Update> {
        if self.cur.is_null() {
            return None;
        }
        let upd = unsafe { &*self.cur };
        self.cur = upd.next.load(Ordering::Acquire);
        Some(upd)
    }
}

/// One key's entry in an insert list.
pub struct InsertNode<K> {
    pub key: K,
    pub upd: UpdateChain,
    next: Box<[AtomicPtr<InsertNode<K>>]>,
}

impl<K> InsertNode<K> {
    fn new(key: K, depth: usize) -> Box<InsertNode<K>> {
        let next = (0..depth)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(InsertNode {
            key,
            upd: UpdateChain::new(),
            next,
        })
    }
}

fn choose_depth() -> usize {
    let mut rng = rand::thread_rng();
    let mut depth = 1;
    while depth < INSERT_MAX_DEPTH && rng.gen_range(0u32..4) == 0 {
        depth += 1;
    }
    depth
}

/// A skip list of keys that landed in one slot gap of a page.
pub struct InsertList<K> {
    head: [AtomicPtr<InsertNode<K>>; INSERT_MAX_DEPTH],
}

unsafe impl<K: Send> Send for InsertList<K> {}
unsafe impl<K: Send + Sync> Sync for InsertList<K> {}

impl<K: Ord> Default for InsertList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> InsertList<K> {
    pub fn new() -> InsertList<K> {
        InsertList {
            head: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head[0].load(Ordering::Acquire).is_null()
    }

    /// Per level, the last node with key strictly below `key`.
    fn search_path<Q>(&self, key: &Q) -> [*mut InsertNode<K>; INSERT_MAX_DEPTH]
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut path = [ptr::null_mut(); INSERT_MAX_DEPTH];
        let mut prev: *mut InsertNode<K> = ptr::null_mut();
        for level in (0..INSERT_MAX_DEPTH).rev() {
            let mut cur = if prev.is_null() {
                self.head[level].load(Ordering::Acquire)
            } else {
                unsafe { &*prev }.next[level].load(Ordering::Acquire)
            };
            while !cur.is_null() {
                let node = unsafe { &*cur };
                if node.key.borrow() >= key {
                    break;
                }
                prev = cur;
                cur = node.next[level].load(Ordering::Acquire);
            }
            path[level] = prev;
        }
        path
    }

    pub fn search<Q>(&self, key: &Q) -> Option<&InsertNode<K>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let path = self.search_path(key);
        let cand = if path[0].is_null() {
            self.head[0].load(Ordering::Acquire)
        } else {
            unsafe { &*path[0] }.next[0].load(Ordering::Acquire)
        };
        if cand.is_null() {
            return None;
        }
        let node = unsafe { &*cand };
        (node.key.borrow() == key).then_some(node)
    }

    /// Insert an update for `key`, reusing the node when the key is already
    /// present. The caller holds the page lock; readers are fenced by the
    /// level-zero release CAS.
    pub fn insert(&self, key: K, upd: Box<Update>) -> &InsertNode<K> {
        let path = self.search_path(key.borrow());
        let next0 = if path[0].is_null() {
            self.head[0].load(Ordering::Acquire)
        } else {
            unsafe { &*path[0] }.next[0].load(Ordering::Acquire)
        };
        if !next0.is_null() {
            let node = unsafe { &*next0 };
            if node.key == key {
                node.upd.prepend(upd);
                return node;
            }
        }

        let depth = choose_depth();
        let node = InsertNode::new(key, depth);
        let raw = Box::into_raw(node);
        // Wire the node's own forward pointers before it becomes reachable.
        for level in 0..depth {
            let next = if path[level].is_null() {
                self.head[level].load(Ordering::Acquire)
            } else {
                unsafe { &*path[level] }.next[level].load(Ordering::Acquire)
            };
            unsafe { &*raw }.next[level].store(next, Ordering::Relaxed);
        }
        // The level-zero splice publishes the node.
        let slot0 = if path[0].is_null() {
            &self.head[0]
        } else {
            &unsafe { &*path[0] }.next[0]
        };
        let expected = unsafe { &*raw }.next[0].load(Ordering::Relaxed);
        slot0
            .compare_exchange(expected, raw, Ordering::Release, Ordering::Acquire)
            .expect("level-zero splice raced despite the page lock");
        let node = unsafe { &*raw };
        for level in 1..depth {
            let slot = if path[level].is_null() {
                &self.head[level]
            } else {
                &unsafe { &*path[level] }.next[level]
            };
            slot.store(raw, Ordering::Release);
        }
        node
    }

    /// Prepend an update to an existing key; `None` when the key is absent.
    pub fn update<Q>(&self, key: &Q, upd: Box<Update>) -> Option<&InsertNode<K>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let node = self.search(key)?;
        node.upd.prepend(upd);
        Some(node)
    }

    pub fn iter(&self) -> InsertIter<'_, K> {
        InsertIter {
            cur: self.head[0].load(Ordering::Acquire),
            _list: self,
        }
    }
}

impl<K> Drop for InsertList<K> {
    fn drop(&mut self) {
        let mut cur = *self.head[0].get_mut();
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next[0].load(Ordering::Relaxed);
        }
    }
}

pub struct InsertIter<'a, K> {
    cur: *mut InsertNode<K>,
    _list: &'a InsertList<K>,
}

impl<'a, K> Iterator for InsertIter<'a, K> {
    type Item = &'a InsertNode<K>;

    fn next(&mut self) -> Option<&'a InsertNode<K>> {
        if self.cur.is_null() {
            return None;
        }
        let node = unsafe { &*self.cur };
        self.cur = node.next[0].load(Ordering::Acquire);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Snapshot;

    #[test]
    fn chain_visibility() {
        let chain = UpdateChain::new();
        chain.prepend(Update::new(1, Some(b"a".to_vec())));
        chain.prepend(Update::new(5, Some(b"b".to_vec())));
        let snap = Snapshot {
            snap_max: 4,
            concurrent: vec![],
        };
        let upd = chain.visible(&snap).unwrap();
        assert_eq!(upd.data.as_deref(), Some(&b"a"[..]));
        let all = Snapshot::all_committed();
        assert_eq!(
            chain.visible(&all).unwrap().data.as_deref(),
            Some(&b"b"[..])
        );
    }

    #[test]
    fn aborted_updates_skipped() {
        let chain = UpdateChain::new();
        chain.prepend(Update::new(1, Some(b"a".to_vec())));
        let upd = chain.prepend(Update::new(2, Some(b"bad".to_vec())));
        upd.abort();
        assert_eq!(
            chain.visible(&Snapshot::all_committed()).unwrap().data.as_deref(),
            Some(&b"a"[..])
        );
    }

    #[test]
    fn obsolete_detaches_tail() {
        let chain = UpdateChain::new();
        chain.prepend(Update::new(1, Some(b"a".to_vec())));
        chain.prepend(Update::new(2, Some(b"b".to_vec())));
        chain.prepend(Update::new(3, Some(b"c".to_vec())));
        // Everyone can see txn 3: everything older is unreachable.
        let tail = chain.obsolete_check(10);
        assert!(!tail.is_null());
        assert_eq!(chain.iter().count(), 1);
        unsafe { free_update_chain(tail) };
        // Nothing further to detach.
        assert!(chain.obsolete_check(10).is_null());
    }

    #[test]
    fn skiplist_ordering_and_reuse() {
        let list: InsertList<Vec<u8>> = InsertList::new();
        for k in [b"m".to_vec(), b"c".to_vec(), b"x".to_vec(), b"a".to_vec()] {
            list.insert(k.clone(), Update::new(1, Some(k)));
        }
        let keys: Vec<_> = list.iter().map(|n| n.key.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"m".to_vec(), b"x".to_vec()]);

        // Same key again chains a second update on the same node.
        list.insert(b"c".to_vec(), Update::new(2, None));
        assert_eq!(list.iter().count(), 4);
        let node = list.search(&b"c"[..]).unwrap();
        assert_eq!(node.upd.iter().count(), 2);
        assert!(node.upd.newest().unwrap().data.is_none());
    }

    #[test]
    fn search_misses() {
        let list: InsertList<u64> = InsertList::new();
        list.insert(10, Update::new(1, Some(vec![1])));
        list.insert(20, Update::new(1, Some(vec![2])));
        assert!(list.search(&15).is_none());
        assert!(list.search(&10).is_some());
        assert!(list.update(&15, Update::new(2, None)).is_none());
    }

    #[test]
    fn concurrent_readers_see_monotone_prefix() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let list: Arc<InsertList<u64>> = Arc::new(InsertList::new());
        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let list = list.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut max_seen = 0;
                while !stop.load(Ordering::Relaxed) {
                    let count = list.iter().count();
                    assert!(count >= max_seen, "reader saw the list shrink");
                    max_seen = count;
                    // Keys must always come out sorted.
                    let mut prev = None;
                    for node in list.iter() {
                        if let Some(p) = prev {
                            assert!(node.key > p);
                        }
                        prev = Some(node.key);
                    }
                }
            })
        };
        for k in 0..2000u64 {
            // Scatter the keys so the tree shape keeps changing.
            list.insert(k.wrapping_mul(2654435761) % 100_000, Update::new(1, None));
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();
    }
}
