//! The block manager: cookie-addressed, checksummed, aligned file I/O with
//! per-file checkpoint metadata.
//!
//! Every managed file starts with a descriptor block of one allocation
//! unit. The remainder is a sequence of unit-aligned blocks, each laid out
//! `{page header, block header, payload}`; the block header is stamped and
//! verified here, the page header belongs to the B-tree layer.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::error::{Error, PanicCell, Result};
use crate::ext::{Extent, ExtentList};
use crate::io;

pub mod addr;
mod ckpt;
mod compact;
mod vrfy;

pub use addr::{CheckpointDesc, Cookie};
pub use vrfy::VerifyState;

pub const BLOCK_MAGIC: u32 = 120_897;
pub const BLOCK_MAJOR_VERSION: u16 = 1;
pub const BLOCK_MINOR_VERSION: u16 = 0;

/// Magic stamped into the page-header slot of extent-list blocks.
pub const EXTLIST_MAGIC: u32 = 71_002;

/// Fixed size of the page header the B-tree stamps ahead of the block
/// header; the block manager only needs its length.
pub const PAGE_HEADER_SIZE: usize = 32;

/// The block header the manager owns, directly after the page header.
pub const BLOCK_HEADER_SIZE: usize = 12;

/// Total header bytes a caller must reserve at the front of a write buffer.
pub const BLOCK_HEADER_BYTE_SIZE: usize = PAGE_HEADER_SIZE + BLOCK_HEADER_SIZE;

/// When a block is not fully checksummed, only this prefix is covered, so
/// compressed payloads can be rewritten in place by salvage tooling.
pub const COMPRESS_SKIP: usize = 64;

/// Hard cap on an on-disk block; the header stores the size in 32 bits and
/// the margin keeps header arithmetic clear of overflow.
pub const WRITE_SIZE_MAX: u64 = u32::MAX as u64 - 1024;

const BLOCK_DATA_CKSUM: u8 = 0x01;

/// 32-bit content checksum used for blocks and descriptors.
pub fn checksum(buf: &[u8]) -> u32 {
    xxhash_rust::xxh3::xxh3_64(buf) as u32
}

/// On-disk descriptor at offset zero of every block file.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
struct FileDesc {
    magic: u32,
    majorv: u16,
    minorv: u16,
    checksum: u32,
    unused: u32,
}

/// Per-block header, stamped at [`PAGE_HEADER_SIZE`] in each block.
#[derive(Debug, Clone, Copy, Zeroable, Pod)]
#[repr(C)]
pub struct BlockHeader {
    pub disk_size: u32,
    pub checksum: u32,
    pub flags: u8,
    pub unused: [u8; 3],
}

const BLOCK_CKSUM_FIELD: std::ops::Range<usize> =
    (PAGE_HEADER_SIZE + 4)..(PAGE_HEADER_SIZE + 8);

/// How the file was opened; decides corruption handling and mmap use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Normal,
    Verify,
    Salvage,
}

/// Open-time tuning for one block file.
#[derive(Debug, Clone)]
pub struct BlockConfig {
    /// Minimum I/O granularity; offsets and sizes are multiples of this.
    pub allocation_unit: u64,
    /// File growth happens in jumps of this many bytes.
    pub extend_stride: u64,
    /// Prefer the lowest-offset fit over the best fit.
    pub alloc_first: bool,
    /// Map the file read-only and serve reads from the mapping when the
    /// request falls inside it.
    pub mmap: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            allocation_unit: 4096,
            extend_stride: 4 << 20,
            alloc_first: false,
            mmap: false,
        }
    }
}

impl BlockConfig {
    fn validate(&self) -> Result<()> {
        let unit = self.allocation_unit;
        if !(512..=(128 << 10)).contains(&unit) || !unit.is_power_of_two() {
            return Err(Error::Config(format!(
                "allocation unit {unit} must be a power of two in [512, 128KB]"
            )));
        }
        if self.extend_stride % unit != 0 {
            return Err(Error::Config(
                "extend stride must be a multiple of the allocation unit".into(),
            ));
        }
        Ok(())
    }
}

/// The live checkpoint's bookkeeping, under the file's one lock.
pub(crate) struct Live {
    /// Extents allocated since the previous checkpoint.
    pub(crate) alloc: ExtentList,
    /// Free, immediately reusable extents.
    pub(crate) avail: ExtentList,
    /// Freed extents the previous checkpoint still references.
    pub(crate) discard: ExtentList,
    /// Extents released by the running checkpoint, reusable after resolve.
    pub(crate) ckpt_avail: ExtentList,
    /// Logical end of file, always a multiple of the allocation unit.
    pub(crate) file_size: u64,
    /// Physical size the file has been extended to.
    pub(crate) extend_size: u64,
    pub(crate) ckpt_size: u64,
    pub(crate) ckpt_inprogress: bool,
    /// Extent-list blocks of the previous checkpoint, freed when the next
    /// checkpoint supersedes it.
    pub(crate) prev_ckpt_blocks: Vec<Extent>,
}

/// One managed block file.
pub struct BlockFile {
    name: String,
    path: PathBuf,
    file: File,
    alloc_unit: u64,
    extend_stride: u64,
    /// Counted, not boolean: checkpoints and compaction both toggle
    /// first-fit and must not clobber each other.
    alloc_first: AtomicI32,
    mode: OpenMode,
    map: Option<memmap2::Mmap>,
    pub(crate) live: Mutex<Live>,
    pub(crate) verify: Mutex<Option<VerifyState>>,
    panic: Arc<PanicCell>,
}

impl BlockFile {
    /// Create a new block file: truncate, stamp the descriptor, sync.
    pub fn create(path: &Path, config: &BlockConfig) -> Result<()> {
        config.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::desc_init(&file, config.allocation_unit)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn open(
        path: &Path,
        config: &BlockConfig,
        mode: OpenMode,
        panic: Arc<PanicCell>,
    ) -> Result<BlockFile> {
        config.validate()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let unit = config.allocation_unit;
        if mode != OpenMode::Salvage {
            Self::desc_read(&file, unit, &name)?;
        }
        let physical = file.metadata()?.len();
        // Ignore a torn tail shorter than one allocation unit.
        let file_size = (physical / unit * unit).max(unit);
        let map = if config.mmap && mode == OpenMode::Normal {
            // Serving reads from the map is fine: blocks are immutable once
            // written and reads re-verify the checksum.
            Some(unsafe { memmap2::Mmap::map(&file)? })
        } else {
            None
        };
        log::debug!("block open: {name} (size {file_size}, unit {unit})");
        Ok(BlockFile {
            name,
            path: path.to_path_buf(),
            file,
            alloc_unit: unit,
            extend_stride: config.extend_stride,
            alloc_first: AtomicI32::new(if config.alloc_first { 1 } else { 0 }),
            mode,
            map,
            live: Mutex::new(Live {
                alloc: ExtentList::new("live.alloc", false),
                avail: ExtentList::new("live.avail", true),
                discard: ExtentList::new("live.discard", false),
                ckpt_avail: ExtentList::new("live.ckpt_avail", false),
                file_size,
                extend_size: physical,
                ckpt_size: 0,
                ckpt_inprogress: false,
                prev_ckpt_blocks: Vec::new(),
            }),
            verify: Mutex::new(None),
            panic,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn allocation_unit(&self) -> u64 {
        self.alloc_unit
    }

    pub fn file_size(&self) -> u64 {
        self.live.lock().file_size
    }

    pub fn avail_bytes(&self) -> u64 {
        self.live.lock().avail.bytes()
    }

    /// Switch first-fit allocation on or off; counted so concurrent
    /// requesters compose.
    pub fn configure_first_fit(&self, on: bool) {
        if on {
            self.alloc_first.fetch_add(1, Ordering::AcqRel);
        } else {
            self.alloc_first.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn first_fit(&self) -> bool {
        self.alloc_first.load(Ordering::Acquire) > 0
    }

    fn desc_init(file: &File, unit: u64) -> Result<()> {
        let mut buf = vec![0u8; unit as usize];
        let mut desc = FileDesc {
            magic: BLOCK_MAGIC,
            majorv: BLOCK_MAJOR_VERSION,
            minorv: BLOCK_MINOR_VERSION,
            checksum: 0,
            unused: 0,
        };
        buf[..std::mem::size_of::<FileDesc>()].copy_from_slice(bytemuck::bytes_of(&desc));
        desc.checksum = checksum(&buf);
        buf[..std::mem::size_of::<FileDesc>()].copy_from_slice(bytemuck::bytes_of(&desc));
        io::write_at(file, 0, &buf)?;
        Ok(())
    }

    fn desc_read(file: &File, unit: u64, name: &str) -> Result<()> {
        let mut buf = vec![0u8; unit as usize];
        io::read_at(file, 0, &mut buf)?;
        let mut desc: FileDesc =
            *bytemuck::from_bytes(&buf[..std::mem::size_of::<FileDesc>()]);
        let saved = desc.checksum;
        desc.checksum = 0;
        buf[..std::mem::size_of::<FileDesc>()].copy_from_slice(bytemuck::bytes_of(&desc));
        if desc.magic != BLOCK_MAGIC || saved != checksum(&buf) {
            log::error!("{name}: descriptor magic/checksum mismatch");
            return Err(Error::corrupt("block file", 0, "bad descriptor block"));
        }
        if desc.majorv > BLOCK_MAJOR_VERSION
            || (desc.majorv == BLOCK_MAJOR_VERSION && desc.minorv > BLOCK_MINOR_VERSION)
        {
            return Err(Error::corrupt("block file", 0, "unsupported file version"));
        }
        Ok(())
    }

    fn align(&self, len: u64) -> u64 {
        (len + self.alloc_unit - 1) / self.alloc_unit * self.alloc_unit
    }

    /// Allocate `size` bytes, recording the grant in `live.alloc`.
    pub(crate) fn alloc_off(&self, live: &mut Live, size: u64) -> Result<u64> {
        let off = match live.avail.alloc(size, self.first_fit()) {
            Some(off) => off,
            None => {
                let off = live.file_size;
                live.file_size += size;
                off
            }
        };
        live.alloc.free(off, size)?;
        Ok(off)
    }

    /// Return an extent to the free pools: freshly allocated space goes
    /// straight back to `avail`, anything the previous checkpoint may still
    /// reference waits on `discard`.
    pub(crate) fn off_free(&self, live: &mut Live, off: u64, size: u64) -> Result<()> {
        if live.alloc.overlaps(off, size) {
            live.alloc.remove_overlap(off, size)?;
            live.avail.free(off, size)
        } else if live.ckpt_inprogress {
            live.ckpt_avail.free(off, size)
        } else {
            live.discard.free(off, size)
        }
    }

    fn extend(&self, live: &mut Live, end: u64) -> Result<()> {
        if end <= live.extend_size {
            return Ok(());
        }
        let stride = self.extend_stride.max(self.alloc_unit);
        let target = (end + stride - 1) / stride * stride;
        self.file.set_len(target)?;
        live.extend_size = target;
        Ok(())
    }

    /// Align `buf`, stamp the block header, checksum, allocate an offset,
    /// and write. The buffer must reserve [`BLOCK_HEADER_BYTE_SIZE`] bytes
    /// of header at the front.
    pub fn write(&self, buf: &mut Vec<u8>, data_checksum: bool) -> Result<Cookie> {
        self.panic.check()?;
        let (off, size, cksum) = self.write_off(buf, data_checksum, None)?;
        Ok(Cookie {
            off,
            size: size as u32,
            checksum: cksum,
        })
    }

    /// Write with the live lock already held (checkpoint path).
    pub(crate) fn write_off(
        &self,
        buf: &mut Vec<u8>,
        data_checksum: bool,
        locked: Option<&mut Live>,
    ) -> Result<(u64, u64, u32)> {
        assert!(buf.len() >= BLOCK_HEADER_BYTE_SIZE);
        let align_size = self.align(buf.len() as u64);
        if align_size > WRITE_SIZE_MAX {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "block exceeds the maximum on-disk size",
            )));
        }
        buf.resize(align_size as usize, 0);

        let header = BlockHeader {
            disk_size: align_size as u32,
            checksum: 0,
            flags: if data_checksum { BLOCK_DATA_CKSUM } else { 0 },
            unused: [0; 3],
        };
        let hdr_at = PAGE_HEADER_SIZE..BLOCK_HEADER_BYTE_SIZE;
        buf[hdr_at.clone()].copy_from_slice(bytemuck::bytes_of(&header));
        let cksum = if data_checksum {
            checksum(buf)
        } else {
            checksum(&buf[..COMPRESS_SKIP.min(buf.len())])
        };
        buf[BLOCK_CKSUM_FIELD].copy_from_slice(&cksum.to_le_bytes());

        let offset = match locked {
            Some(live) => {
                let offset = self.alloc_off(live, align_size)?;
                self.extend(live, offset + align_size)?;
                offset
            }
            None => {
                let mut live = self.live.lock();
                let offset = self.alloc_off(&mut live, align_size)?;
                self.extend(&mut live, offset + align_size)?;
                offset
            }
        };

        if let Err(e) = io::write_at(&self.file, offset, buf) {
            // Hand the extent back before surfacing the failure.
            let mut live = self.live.lock();
            let _ = self.off_free(&mut live, offset, align_size);
            return Err(e.into());
        }
        log::trace!(
            "{}: write off {offset}, size {align_size}, cksum {cksum:#x}",
            self.name
        );
        Ok((offset, align_size, cksum))
    }

    /// Read and verify the block `cookie` names.
    pub fn read(&self, cookie: Cookie) -> Result<Vec<u8>> {
        self.panic.check()?;
        if cookie.is_none() {
            return Err(Error::corrupt("block", 0, "read of the null cookie"));
        }
        let size = u64::from(cookie.size);
        {
            let live = self.live.lock();
            if cookie.off + size > live.file_size
                || cookie.off % self.alloc_unit != 0
                || size % self.alloc_unit != 0
            {
                return Err(self.corrupt(cookie.off, "cookie outside the file"));
            }
        }
        let mut buf = vec![0u8; size as usize];
        match &self.map {
            Some(map) if (cookie.off + size) as usize <= map.len() => {
                buf.copy_from_slice(&map[cookie.off as usize..(cookie.off + size) as usize]);
            }
            _ => io::read_at(&self.file, cookie.off, &mut buf)?,
        }

        let header: BlockHeader =
            *bytemuck::from_bytes(&buf[PAGE_HEADER_SIZE..BLOCK_HEADER_BYTE_SIZE]);
        if u64::from(header.disk_size) != size || header.checksum != cookie.checksum {
            return Err(self.corrupt(cookie.off, "block header does not match cookie"));
        }
        buf[BLOCK_CKSUM_FIELD].copy_from_slice(&[0; 4]);
        let computed = if header.flags & BLOCK_DATA_CKSUM != 0 {
            checksum(&buf)
        } else {
            checksum(&buf[..COMPRESS_SKIP.min(buf.len())])
        };
        buf[BLOCK_CKSUM_FIELD].copy_from_slice(&header.checksum.to_le_bytes());
        if computed != cookie.checksum {
            return Err(self.corrupt(cookie.off, "block checksum mismatch"));
        }
        if let Some(vrfy) = self.verify.lock().as_mut() {
            vrfy.visit(self.alloc_unit, cookie.off, size)?;
        }
        Ok(buf)
    }

    /// Discard the block `cookie` names.
    pub fn free(&self, cookie: Cookie) -> Result<()> {
        self.panic.check()?;
        if cookie.is_none() {
            return Ok(());
        }
        let mut live = self.live.lock();
        self.off_free(&mut live, cookie.off, u64::from(cookie.size))
    }

    /// Corruption escalation: soft error for verify/salvage handles, engine
    /// poison otherwise.
    fn corrupt(&self, offset: u64, detail: &'static str) -> Error {
        if self.mode == OpenMode::Normal {
            log::error!("{}: {} at offset {:#x}", self.name, detail, offset);
            self.panic.poison()
        } else {
            Error::corrupt("block", offset, detail)
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
