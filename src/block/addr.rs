//! Block cookies and the checkpoint descriptor.
//!
//! A cookie is the only reference to a block that ever leaves the block
//! manager: `(offset_in_units - 1, size_in_units, checksum)` as varints. A
//! size of zero encodes "no block" and decodes to all-zero fields.

use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_uint};

/// Packed reference to one on-disk block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cookie {
    pub off: u64,
    pub size: u32,
    pub checksum: u32,
}

impl Cookie {
    /// The "no block" cookie.
    pub const NONE: Cookie = Cookie {
        off: 0,
        size: 0,
        checksum: 0,
    };

    pub fn is_none(&self) -> bool {
        self.size == 0
    }

    /// Append the cookie to `out`. `unit` is the file's allocation unit;
    /// offset and size must be multiples of it.
    pub fn pack(&self, unit: u64, out: &mut Vec<u8>) {
        if self.size == 0 {
            pack_uint(out, 0);
            pack_uint(out, 0);
            pack_uint(out, 0);
        } else {
            debug_assert!(self.off % unit == 0 && u64::from(self.size) % unit == 0);
            pack_uint(out, self.off / unit - 1);
            pack_uint(out, u64::from(self.size) / unit);
            pack_uint(out, u64::from(self.checksum));
        }
    }

    /// Decode a cookie from the front of `buf`, returning the remainder.
    pub fn unpack(unit: u64, buf: &[u8]) -> Result<(Cookie, &[u8])> {
        let (o, rest) = unpack_uint(buf)?;
        let (s, rest) = unpack_uint(rest)?;
        let (c, rest) = unpack_uint(rest)?;
        if s == 0 {
            return Ok((Cookie::NONE, rest));
        }
        let off = (o + 1)
            .checked_mul(unit)
            .ok_or_else(|| Error::corrupt("block cookie", o, "offset overflow"))?;
        let size = s
            .checked_mul(unit)
            .filter(|v| *v <= u64::from(u32::MAX))
            .ok_or_else(|| Error::corrupt("block cookie", off, "size overflow"))? as u32;
        Ok((
            Cookie {
                off,
                size,
                checksum: c as u32,
            },
            rest,
        ))
    }
}

/// Version byte stored at the front of a checkpoint descriptor.
pub const CHECKPOINT_VERSION: u8 = 1;

/// The per-file checkpoint descriptor: the root block plus the three extent
/// lists, the logical file size, and the checkpoint's byte footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointDesc {
    pub root: Cookie,
    pub alloc: Cookie,
    pub avail: Cookie,
    pub discard: Cookie,
    pub file_size: u64,
    pub ckpt_size: u64,
}

impl CheckpointDesc {
    pub fn pack(&self, unit: u64, out: &mut Vec<u8>) {
        out.push(CHECKPOINT_VERSION);
        self.root.pack(unit, out);
        self.alloc.pack(unit, out);
        self.avail.pack(unit, out);
        self.discard.pack(unit, out);
        pack_uint(out, self.file_size);
        pack_uint(out, self.ckpt_size);
    }

    pub fn unpack(unit: u64, buf: &[u8]) -> Result<CheckpointDesc> {
        let (&version, rest) = buf
            .split_first()
            .ok_or_else(|| Error::corrupt("checkpoint", 0, "empty descriptor"))?;
        if version != CHECKPOINT_VERSION {
            return Err(Error::corrupt(
                "checkpoint",
                0,
                "unsupported checkpoint version",
            ));
        }
        let (root, rest) = Cookie::unpack(unit, rest)?;
        let (alloc, rest) = Cookie::unpack(unit, rest)?;
        let (avail, rest) = Cookie::unpack(unit, rest)?;
        let (discard, rest) = Cookie::unpack(unit, rest)?;
        let (file_size, rest) = unpack_uint(rest)?;
        let (ckpt_size, _) = unpack_uint(rest)?;
        Ok(CheckpointDesc {
            root,
            alloc,
            avail,
            discard,
            file_size,
            ckpt_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_roundtrip() {
        let c = Cookie {
            off: 4096,
            size: 8192,
            checksum: 0xdead_beef,
        };
        let mut buf = Vec::new();
        c.pack(512, &mut buf);
        let (got, rest) = Cookie::unpack(512, &buf).unwrap();
        assert_eq!(got, c);
        assert!(rest.is_empty());
    }

    #[test]
    fn none_cookie() {
        let mut buf = Vec::new();
        Cookie::NONE.pack(512, &mut buf);
        assert_eq!(buf, [0, 0, 0]);
        let (got, _) = Cookie::unpack(512, &buf).unwrap();
        assert!(got.is_none());
        assert_eq!(got, Cookie::NONE);
    }

    #[test]
    fn descriptor_roundtrip() {
        let desc = CheckpointDesc {
            root: Cookie {
                off: 512,
                size: 4096,
                checksum: 1,
            },
            alloc: Cookie {
                off: 8192,
                size: 512,
                checksum: 2,
            },
            avail: Cookie {
                off: 8704,
                size: 512,
                checksum: 3,
            },
            discard: Cookie::NONE,
            file_size: 1 << 20,
            ckpt_size: 12_800,
        };
        let mut buf = Vec::new();
        desc.pack(512, &mut buf);
        assert_eq!(CheckpointDesc::unpack(512, &buf).unwrap(), desc);
    }

    #[test]
    fn bad_version_rejected() {
        let mut buf = Vec::new();
        CheckpointDesc {
            root: Cookie::NONE,
            alloc: Cookie::NONE,
            avail: Cookie::NONE,
            discard: Cookie::NONE,
            file_size: 0,
            ckpt_size: 0,
        }
        .pack(512, &mut buf);
        buf[0] = 9;
        assert!(CheckpointDesc::unpack(512, &buf).is_err());
    }
}
