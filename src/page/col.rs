//! Column-store pages, keyed by record number.
//!
//! Fixed-length leaves are a flat array of equal-width values.
//! Variable-length leaves are run-length encoded; the per-run start
//! numbers are expanded on demand the first time a page is searched.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::block::Cookie;
use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_uint};

use super::cell::{self, Cell};
use super::insert::InsertList;
use super::{Ref, RefKey};

/// A value in a variable-length column leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColValue {
    Plain(Vec<u8>),
    Ovfl(Cookie),
    /// The record exists but its value was deleted.
    Del,
}

pub struct ColRun {
    pub count: u64,
    pub value: ColValue,
}

pub struct ColFixPage {
    width: u32,
    data: Vec<u8>,
    /// Updates and appends, keyed by record number.
    updates: InsertList<u64>,
}

impl ColFixPage {
    pub fn empty(width: u32) -> ColFixPage {
        ColFixPage {
            width,
            data: Vec::new(),
            updates: InsertList::new(),
        }
    }

    pub fn from_image(buf: &[u8], entries: u32, width: u32) -> Result<ColFixPage> {
        let need = entries as usize * width as usize;
        if buf.len() < need {
            return Err(Error::corrupt("column leaf", 0, "truncated fixed-length data"));
        }
        Ok(ColFixPage {
            width,
            data: buf[..need].to_vec(),
            updates: InsertList::new(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn entries(&self) -> u64 {
        (self.data.len() / self.width as usize) as u64
    }

    /// On-disk value of the `i`-th record on this page.
    pub fn value(&self, i: u64) -> Option<&[u8]> {
        let w = self.width as usize;
        let start = i as usize * w;
        self.data.get(start..start + w)
    }

    pub fn updates(&self) -> &InsertList<u64> {
        &self.updates
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn footprint(&self) -> u64 {
        self.data.len() as u64 + 128
    }
}

pub struct ColVarPage {
    runs: Vec<ColRun>,
    /// Start offset of each run relative to the page's first record;
    /// built the first time a search needs it.
    starts: OnceLock<Vec<u64>>,
    entries: u64,
    updates: InsertList<u64>,
    /// Per run: its overflow block was already handed to the discard path.
    ovfl_dead: Vec<AtomicBool>,
    /// Overflow blocks the previous reconciliation wrote for in-memory
    /// values.
    pending_ovfl: parking_lot::Mutex<Vec<Cookie>>,
}

impl ColVarPage {
    pub fn empty() -> ColVarPage {
        ColVarPage {
            runs: Vec::new(),
            starts: OnceLock::new(),
            entries: 0,
            updates: InsertList::new(),
            ovfl_dead: Vec::new(),
            pending_ovfl: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn from_image(mut buf: &[u8], nruns: u32, unit: u64) -> Result<ColVarPage> {
        let mut runs = Vec::with_capacity(nruns as usize);
        let mut entries = 0u64;
        for _ in 0..nruns {
            let (count, rest) = unpack_uint(buf)?;
            if count == 0 {
                return Err(Error::corrupt("column leaf", 0, "empty run"));
            }
            let (vcell, rest) = cell::unpack(rest, unit)?;
            let value = match vcell {
                Cell::Value(v) => ColValue::Plain(v.to_vec()),
                Cell::ValueOvfl(c) => ColValue::Ovfl(c),
                Cell::Del => ColValue::Del,
                _ => return Err(Error::corrupt("column leaf", 0, "expected a value cell")),
            };
            buf = rest;
            entries += count;
            runs.push(ColRun { count, value });
        }
        let ovfl_dead = (0..runs.len()).map(|_| AtomicBool::new(false)).collect();
        Ok(ColVarPage {
            runs,
            starts: OnceLock::new(),
            entries,
            updates: InsertList::new(),
            ovfl_dead,
            pending_ovfl: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn runs(&self) -> &[ColRun] {
        &self.runs
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn starts(&self) -> &[u64] {
        self.starts.get_or_init(|| {
            let mut starts = Vec::with_capacity(self.runs.len());
            let mut at = 0u64;
            for run in &self.runs {
                starts.push(at);
                at += run.count;
            }
            starts
        })
    }

    /// Run index of the `i`-th record on this page.
    pub fn run_of(&self, i: u64) -> Option<usize> {
        if i >= self.entries {
            return None;
        }
        let starts = self.starts();
        Some(match starts.binary_search(&i) {
            Ok(r) => r,
            Err(r) => r - 1,
        })
    }

    /// On-disk value of the `i`-th record on this page.
    pub fn value(&self, i: u64) -> Option<&ColValue> {
        self.run_of(i).map(|run| &self.runs[run].value)
    }

    /// Claim the right to discard a run's overflow block; true exactly
    /// once.
    pub fn claim_ovfl_discard(&self, run: usize) -> bool {
        !self.ovfl_dead[run].swap(true, std::sync::atomic::Ordering::AcqRel)
    }

    pub fn take_pending_ovfl(&self) -> Vec<Cookie> {
        std::mem::take(&mut *self.pending_ovfl.lock())
    }

    pub fn set_pending_ovfl(&self, blocks: Vec<Cookie>) {
        *self.pending_ovfl.lock() = blocks;
    }

    pub fn updates(&self) -> &InsertList<u64> {
        &self.updates
    }

    pub fn footprint(&self) -> u64 {
        let runs: usize = self
            .runs
            .iter()
            .map(|r| {
                32 + match &r.value {
                    ColValue::Plain(v) => v.len(),
                    _ => 16,
                }
            })
            .sum();
        runs as u64 + 128
    }
}

/// Serialize one run for a page image.
pub fn pack_run(out: &mut Vec<u8>, count: u64, value: &ColValue, unit: u64) {
    pack_uint(out, count);
    match value {
        ColValue::Plain(v) => cell::pack_value(out, v),
        ColValue::Ovfl(c) => cell::pack_value_ovfl(out, *c, unit),
        ColValue::Del => cell::pack_del(out),
    }
}

/// Column-store internal page; children keyed by starting record number.
pub struct ColIntPage {
    index: RwLock<Arc<Vec<Arc<Ref>>>>,
}

impl ColIntPage {
    pub fn new(children: Vec<Arc<Ref>>) -> ColIntPage {
        ColIntPage {
            index: RwLock::new(Arc::new(children)),
        }
    }

    pub fn from_image(mut buf: &[u8], entries: u32, unit: u64) -> Result<ColIntPage> {
        let mut children = Vec::with_capacity(entries as usize);
        for _ in 0..entries {
            let (recno, rest) = unpack_uint(buf)?;
            let (acell, rest) = cell::unpack(rest, unit)?;
            let cookie = match acell {
                Cell::Addr(c) => c,
                _ => {
                    return Err(Error::corrupt(
                        "column internal",
                        0,
                        "expected a child address",
                    ))
                }
            };
            buf = rest;
            children.push(Ref::new_disk(RefKey::Recno(recno), cookie));
        }
        if children.is_empty() {
            return Err(Error::corrupt(
                "column internal",
                0,
                "internal page with no children",
            ));
        }
        Ok(ColIntPage::new(children))
    }

    pub fn index(&self) -> Arc<Vec<Arc<Ref>>> {
        self.index.read().clone()
    }

    pub fn replace_index(&self, children: Vec<Arc<Ref>>) {
        *self.index.write() = Arc::new(children);
    }

    /// Child owning `recno`: the last child starting at or below it.
    pub fn search(&self, recno: u64) -> (usize, Arc<Ref>) {
        let index = self.index();
        let mut lo = 1usize;
        let mut hi = index.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if index[mid].key.recno() <= recno {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let slot = lo - 1;
        (slot, index[slot].clone())
    }

    pub fn footprint(&self) -> u64 {
        self.index().len() as u64 * 96 + 128
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_length_values() {
        let data: Vec<u8> = (0..40).collect();
        let page = ColFixPage::from_image(&data, 10, 4).unwrap();
        assert_eq!(page.entries(), 10);
        assert_eq!(page.value(0), Some(&[0u8, 1, 2, 3][..]));
        assert_eq!(page.value(9), Some(&[36u8, 37, 38, 39][..]));
        assert_eq!(page.value(10), None);
        assert!(ColFixPage::from_image(&data, 11, 4).is_err());
    }

    #[test]
    fn rle_runs_expand_on_demand() {
        let mut buf = Vec::new();
        pack_run(&mut buf, 3, &ColValue::Plain(b"x".to_vec()), 512);
        pack_run(&mut buf, 1, &ColValue::Del, 512);
        pack_run(&mut buf, 5, &ColValue::Plain(b"y".to_vec()), 512);
        let page = ColVarPage::from_image(&buf, 3, 512).unwrap();
        assert_eq!(page.entries(), 9);
        assert!(page.starts.get().is_none());
        assert_eq!(page.value(0), Some(&ColValue::Plain(b"x".to_vec())));
        assert!(page.starts.get().is_some());
        assert_eq!(page.value(2), Some(&ColValue::Plain(b"x".to_vec())));
        assert_eq!(page.value(3), Some(&ColValue::Del));
        assert_eq!(page.value(4), Some(&ColValue::Plain(b"y".to_vec())));
        assert_eq!(page.value(8), Some(&ColValue::Plain(b"y".to_vec())));
        assert_eq!(page.value(9), None);
    }

    #[test]
    fn internal_recno_search() {
        let refs = vec![
            Ref::new_disk(RefKey::Recno(1), Cookie::NONE),
            Ref::new_disk(RefKey::Recno(100), Cookie::NONE),
            Ref::new_disk(RefKey::Recno(500), Cookie::NONE),
        ];
        let page = ColIntPage::new(refs);
        assert_eq!(page.search(1).0, 0);
        assert_eq!(page.search(99).0, 0);
        assert_eq!(page.search(100).0, 1);
        assert_eq!(page.search(9999).0, 2);
    }
}
