//! Row-store pages.
//!
//! A leaf holds the decoded disk entries plus the in-memory mutation
//! structures: one update chain per disk slot and one insert skip list per
//! slot gap. Full keys are instantiated lazily: every K-th key is
//! materialised at page-in and the rest are rolled forward from the
//! nearest instantiated key on first use.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::block::Cookie;
use crate::error::{Error, Result};

use super::cell::{self, Cell};
use super::insert::{InsertList, UpdateChain};
use super::{Ref, RefKey};

/// A value stored in a leaf slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotValue {
    Plain(Vec<u8>),
    /// Single values larger than a page live in their own blocks.
    Ovfl(Cookie),
}

pub struct RowSlot {
    prefix: u32,
    suffix: Vec<u8>,
    key: OnceLock<Vec<u8>>,
    pub value: SlotValue,
}

/// Result of a leaf search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSearch {
    /// Exact match on a disk slot.
    Match(usize),
    /// The key falls in the gap before slot `i` (or past the last slot when
    /// `i == entries`); mutations go to insert list `i`.
    Gap(usize),
}

pub struct RowLeafPage {
    slots: Vec<RowSlot>,
    updates: Vec<UpdateChain>,
    inserts: Vec<InsertList<Vec<u8>>>,
    /// Per slot: the on-disk overflow value was superseded and its block
    /// already handed to the discard path. Guards against freeing twice
    /// when the page is reconciled again.
    ovfl_dead: Vec<AtomicBool>,
    /// Overflow blocks the previous reconciliation wrote for in-memory
    /// values; the next pass discards the ones its image dropped.
    pending_ovfl: parking_lot::Mutex<Vec<Cookie>>,
}

impl RowLeafPage {
    pub fn empty() -> RowLeafPage {
        RowLeafPage {
            slots: Vec::new(),
            updates: Vec::new(),
            inserts: vec![InsertList::new()],
            ovfl_dead: Vec::new(),
            pending_ovfl: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Decode a leaf image's cell run. `key_gap` controls which keys are
    /// instantiated now rather than on demand.
    pub fn from_image(
        mut buf: &[u8],
        entries: u32,
        unit: u64,
        key_gap: usize,
    ) -> Result<RowLeafPage> {
        let entries = entries as usize;
        let mut slots = Vec::with_capacity(entries);
        let mut prev_key: Vec<u8> = Vec::new();
        let gap = key_gap.max(1);
        for i in 0..entries {
            let (kcell, rest) = cell::unpack(buf, unit)?;
            let (prefix, suffix) = match kcell {
                Cell::Key { prefix, suffix } => (prefix as u32, suffix.to_vec()),
                _ => return Err(Error::corrupt("row leaf", 0, "expected a key cell")),
            };
            let (vcell, rest) = cell::unpack(rest, unit)?;
            let value = match vcell {
                Cell::Value(v) => SlotValue::Plain(v.to_vec()),
                Cell::ValueOvfl(c) => SlotValue::Ovfl(c),
                _ => return Err(Error::corrupt("row leaf", 0, "expected a value cell")),
            };
            buf = rest;

            if prefix as usize > prev_key.len() {
                return Err(Error::corrupt("row leaf", 0, "key prefix overruns"));
            }
            prev_key.truncate(prefix as usize);
            prev_key.extend_from_slice(&suffix);

            let slot = RowSlot {
                prefix,
                suffix,
                key: OnceLock::new(),
                value,
            };
            if i % gap == 0 {
                let _ = slot.key.set(prev_key.clone());
            }
            slots.push(slot);
        }
        let updates = (0..entries).map(|_| UpdateChain::new()).collect();
        let inserts = (0..=entries).map(|_| InsertList::new()).collect();
        let ovfl_dead = (0..entries).map(|_| AtomicBool::new(false)).collect();
        Ok(RowLeafPage {
            slots,
            updates,
            inserts,
            ovfl_dead,
            pending_ovfl: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    /// Full key of slot `i`, instantiating from the nearest materialised
    /// predecessor.
    pub fn key(&self, i: usize) -> &[u8] {
        if let Some(k) = self.slots[i].key.get() {
            return k;
        }
        // Find the closest instantiated key at or before `i`. Slot zero is
        // always instantiated (it has no prefix to lean on).
        let mut j = i;
        while self.slots[j].key.get().is_none() {
            debug_assert!(j > 0, "slot zero must be instantiated");
            j -= 1;
        }
        let mut full = self.slots[j].key.get().cloned().unwrap_or_default();
        for k in j + 1..=i {
            let slot = &self.slots[k];
            full.truncate(slot.prefix as usize);
            full.extend_from_slice(&slot.suffix);
            let _ = self.slots[k].key.set(full.clone());
        }
        self.slots[i].key.get().unwrap()
    }

    pub fn value(&self, i: usize) -> &SlotValue {
        &self.slots[i].value
    }

    pub fn updates(&self, i: usize) -> &UpdateChain {
        &self.updates[i]
    }

    pub fn insert_list(&self, gap: usize) -> &InsertList<Vec<u8>> {
        &self.inserts[gap]
    }

    /// Claim the right to discard slot `i`'s overflow block; true exactly
    /// once.
    pub fn claim_ovfl_discard(&self, i: usize) -> bool {
        !self.ovfl_dead[i].swap(true, std::sync::atomic::Ordering::AcqRel)
    }

    pub fn take_pending_ovfl(&self) -> Vec<Cookie> {
        std::mem::take(&mut *self.pending_ovfl.lock())
    }

    pub fn set_pending_ovfl(&self, blocks: Vec<Cookie>) {
        *self.pending_ovfl.lock() = blocks;
    }

    pub fn search(&self, key: &[u8]) -> RowSearch {
        let mut lo = 0usize;
        let mut hi = self.slots.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match self.key(mid).cmp(key) {
                std::cmp::Ordering::Equal => return RowSearch::Match(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        RowSearch::Gap(lo)
    }

    /// Rough cache footprint of the decoded page.
    pub fn footprint(&self) -> u64 {
        let slots: usize = self
            .slots
            .iter()
            .map(|s| {
                s.suffix.len()
                    + match &s.value {
                        SlotValue::Plain(v) => v.len(),
                        SlotValue::Ovfl(_) => 16,
                    }
                    + 64
            })
            .sum();
        slots as u64 + 128
    }
}

/// Row-store internal page: boundary keys and child cells. The index array
/// is replaced wholesale on splits so walkers can hold a consistent
/// snapshot.
pub struct RowIntPage {
    index: RwLock<Arc<Vec<Arc<Ref>>>>,
}

impl RowIntPage {
    pub fn new(children: Vec<Arc<Ref>>) -> RowIntPage {
        RowIntPage {
            index: RwLock::new(Arc::new(children)),
        }
    }

    pub fn from_image(mut buf: &[u8], entries: u32, unit: u64) -> Result<RowIntPage> {
        let mut children = Vec::with_capacity(entries as usize);
        let mut prev_key: Vec<u8> = Vec::new();
        for _ in 0..entries {
            let (kcell, rest) = cell::unpack(buf, unit)?;
            let (prefix, suffix) = match kcell {
                Cell::Key { prefix, suffix } => (prefix as usize, suffix),
                _ => return Err(Error::corrupt("row internal", 0, "expected a key cell")),
            };
            if prefix > prev_key.len() {
                return Err(Error::corrupt("row internal", 0, "key prefix overruns"));
            }
            prev_key.truncate(prefix);
            prev_key.extend_from_slice(suffix);
            let (acell, rest) = cell::unpack(rest, unit)?;
            let cookie = match acell {
                Cell::Addr(c) => c,
                _ => return Err(Error::corrupt("row internal", 0, "expected a child address")),
            };
            buf = rest;
            children.push(Ref::new_disk(RefKey::Row(prev_key.clone()), cookie));
        }
        if children.is_empty() {
            return Err(Error::corrupt("row internal", 0, "internal page with no children"));
        }
        Ok(RowIntPage::new(children))
    }

    pub fn index(&self) -> Arc<Vec<Arc<Ref>>> {
        self.index.read().clone()
    }

    pub fn replace_index(&self, children: Vec<Arc<Ref>>) {
        *self.index.write() = Arc::new(children);
    }

    /// Child that owns `key`: the last child whose boundary key is at most
    /// `key`; the first child catches everything below its boundary.
    pub fn search(&self, key: &[u8]) -> (usize, Arc<Ref>) {
        let index = self.index();
        let mut lo = 1usize;
        let mut hi = index.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if index[mid].key.row() <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let slot = lo - 1;
        (slot, index[slot].clone())
    }

    pub fn footprint(&self) -> u64 {
        let index = self.index();
        let keys: usize = index.iter().map(|r| r.key.row().len() + 96).sum();
        keys as u64 + 128
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::cell;

    fn build_leaf_image(pairs: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut prev: &[u8] = b"";
        for (k, v) in pairs {
            let prefix = cell::common_prefix(prev, k);
            cell::pack_key(&mut buf, prefix as u64, &k[prefix..]);
            cell::pack_value(&mut buf, v);
            prev = k;
        }
        buf
    }

    #[test]
    fn parse_and_search() {
        let pairs: Vec<(&[u8], &[u8])> = vec![
            (b"alpha", b"1"),
            (b"alpine", b"2"),
            (b"beta", b"3"),
            (b"betamax", b"4"),
            (b"gamma", b"5"),
        ];
        let image = build_leaf_image(&pairs);
        let page = RowLeafPage::from_image(&image, 5, 512, 3).unwrap();
        assert_eq!(page.entries(), 5);
        for (i, (k, v)) in pairs.iter().enumerate() {
            assert_eq!(page.key(i), *k);
            assert_eq!(page.value(i), &SlotValue::Plain(v.to_vec()));
        }
        assert_eq!(page.search(b"beta"), RowSearch::Match(2));
        assert_eq!(page.search(b"a"), RowSearch::Gap(0));
        assert_eq!(page.search(b"bet"), RowSearch::Gap(2));
        assert_eq!(page.search(b"zzz"), RowSearch::Gap(5));
    }

    #[test]
    fn lazy_keys_roll_forward() {
        let pairs: Vec<(&[u8], &[u8])> = (0..20)
            .map(|i| -> (&[u8], &[u8]) {
                let k: &'static [u8] = Box::leak(format!("key{i:04}").into_bytes().into_boxed_slice());
                (k, b"v")
            })
            .collect();
        let image = build_leaf_image(&pairs);
        let page = RowLeafPage::from_image(&image, 20, 512, 7).unwrap();
        // Ask for a key in the middle of a gap run; the roll-forward must
        // reconstruct it from the last instantiated slot.
        assert_eq!(page.key(12), b"key0012");
        assert_eq!(page.key(19), b"key0019");
        assert_eq!(page.key(1), b"key0001");
    }

    #[test]
    fn internal_search_boundaries() {
        let refs = vec![
            Ref::new_disk(RefKey::Row(b"a".to_vec()), Cookie::NONE),
            Ref::new_disk(RefKey::Row(b"m".to_vec()), Cookie::NONE),
            Ref::new_disk(RefKey::Row(b"t".to_vec()), Cookie::NONE),
        ];
        let page = RowIntPage::new(refs);
        assert_eq!(page.search(b"c").0, 0);
        assert_eq!(page.search(b"m").0, 1);
        assert_eq!(page.search(b"z").0, 2);
        // Keys below the first boundary still land on the first child.
        assert_eq!(page.search(b"0").0, 0);
    }

    #[test]
    fn corrupt_images_rejected() {
        // A value cell where a key is expected.
        let mut buf = Vec::new();
        cell::pack_value(&mut buf, b"v");
        assert!(RowLeafPage::from_image(&buf, 1, 512, 4).is_err());
        // Prefix pointing past the previous key.
        let mut buf = Vec::new();
        cell::pack_key(&mut buf, 10, b"x");
        cell::pack_value(&mut buf, b"v");
        assert!(RowLeafPage::from_image(&buf, 1, 512, 4).is_err());
    }
}
