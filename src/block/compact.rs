//! Compaction policy.
//!
//! Compaction rewrites blocks from the tail of the file into free space
//! near the front, so a later truncate can return the tail to the
//! filesystem. The block manager only answers two policy questions; the
//! B-tree drives the actual rewrites with first-fit allocation switched on.

use super::{BlockFile, Cookie};

impl BlockFile {
    /// Ninety percent of the file; blocks above this are rewrite
    /// candidates.
    fn compact_limit(&self, file_size: u64) -> u64 {
        file_size - file_size / 10
    }

    /// Whether compacting this file is worth starting: at least ten percent
    /// of the file must be available in its first ninety percent.
    pub fn compact_skip(&self) -> bool {
        let live = self.live.lock();
        let limit = self.compact_limit(live.file_size);
        let avail_below = live.avail.bytes_below(limit);
        let worth_it = avail_below >= live.file_size / 10;
        log::debug!(
            "{}: compaction check, {avail_below} bytes available below {limit} ({})",
            self.name(),
            if worth_it { "proceed" } else { "skip" }
        );
        !worth_it
    }

    /// Whether rewriting the page at `cookie` is useless: it must sit past
    /// the compaction limit with an equal-or-larger extent free below it.
    pub fn compact_page_skip(&self, cookie: Cookie) -> bool {
        if cookie.is_none() {
            return true;
        }
        let live = self.live.lock();
        let limit = self.compact_limit(live.file_size);
        if cookie.off < limit {
            return true;
        }
        !live.avail.fits_below(u64::from(cookie.size), limit)
    }
}
