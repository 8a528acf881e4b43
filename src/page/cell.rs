//! Cell codec for page images.
//!
//! A page image is the page header, the block header, then a run of cells.
//! Keys carry a prefix-compression count against the previous key; values
//! and child addresses are length-prefixed; items too large for a page are
//! stored as overflow blocks and referenced by cookie.

use crate::block::Cookie;
use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_uint};

const CELL_KEY: u8 = 0;
const CELL_KEY_OVFL: u8 = 1;
const CELL_VALUE: u8 = 2;
const CELL_VALUE_OVFL: u8 = 3;
const CELL_ADDR: u8 = 4;
const CELL_DEL: u8 = 5;

/// A decoded cell borrowing the page image.
#[derive(Debug, PartialEq, Eq)]
pub enum Cell<'a> {
    /// Key with `prefix` bytes shared with the previous key.
    Key { prefix: u64, suffix: &'a [u8] },
    KeyOvfl(Cookie),
    Value(&'a [u8]),
    ValueOvfl(Cookie),
    /// Child block address.
    Addr(Cookie),
    /// Deleted value placeholder (column stores keep their record slots).
    Del,
}

pub fn pack_key(out: &mut Vec<u8>, prefix: u64, suffix: &[u8]) {
    out.push(CELL_KEY);
    pack_uint(out, prefix);
    pack_uint(out, suffix.len() as u64);
    out.extend_from_slice(suffix);
}

pub fn pack_key_ovfl(out: &mut Vec<u8>, cookie: Cookie, unit: u64) {
    out.push(CELL_KEY_OVFL);
    cookie.pack(unit, out);
}

pub fn pack_value(out: &mut Vec<u8>, data: &[u8]) {
    out.push(CELL_VALUE);
    pack_uint(out, data.len() as u64);
    out.extend_from_slice(data);
}

pub fn pack_value_ovfl(out: &mut Vec<u8>, cookie: Cookie, unit: u64) {
    out.push(CELL_VALUE_OVFL);
    cookie.pack(unit, out);
}

pub fn pack_addr(out: &mut Vec<u8>, cookie: Cookie, unit: u64) {
    out.push(CELL_ADDR);
    cookie.pack(unit, out);
}

pub fn pack_del(out: &mut Vec<u8>) {
    out.push(CELL_DEL);
}

/// Decode one cell from the front of `buf`, returning the remainder.
pub fn unpack(buf: &[u8], unit: u64) -> Result<(Cell<'_>, &[u8])> {
    let (&ty, rest) = buf
        .split_first()
        .ok_or_else(|| Error::corrupt("page cell", 0, "truncated cell"))?;
    match ty {
        CELL_KEY => {
            let (prefix, rest) = unpack_uint(rest)?;
            let (len, rest) = unpack_uint(rest)?;
            let len = len as usize;
            if rest.len() < len {
                return Err(Error::corrupt("page cell", 0, "truncated key"));
            }
            let (suffix, rest) = rest.split_at(len);
            Ok((Cell::Key { prefix, suffix }, rest))
        }
        CELL_KEY_OVFL => {
            let (cookie, rest) = Cookie::unpack(unit, rest)?;
            Ok((Cell::KeyOvfl(cookie), rest))
        }
        CELL_VALUE => {
            let (len, rest) = unpack_uint(rest)?;
            let len = len as usize;
            if rest.len() < len {
                return Err(Error::corrupt("page cell", 0, "truncated value"));
            }
            let (data, rest) = rest.split_at(len);
            Ok((Cell::Value(data), rest))
        }
        CELL_VALUE_OVFL => {
            let (cookie, rest) = Cookie::unpack(unit, rest)?;
            Ok((Cell::ValueOvfl(cookie), rest))
        }
        CELL_ADDR => {
            let (cookie, rest) = Cookie::unpack(unit, rest)?;
            Ok((Cell::Addr(cookie), rest))
        }
        CELL_DEL => Ok((Cell::Del, rest)),
        _ => Err(Error::corrupt("page cell", 0, "unknown cell type")),
    }
}

/// Shared-prefix length of two keys, the basis of key compression.
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_roundtrip() {
        let cookie = Cookie {
            off: 4096,
            size: 512,
            checksum: 7,
        };
        let mut buf = Vec::new();
        pack_key(&mut buf, 3, b"fix");
        pack_value(&mut buf, b"hello");
        pack_addr(&mut buf, cookie, 512);
        pack_value_ovfl(&mut buf, cookie, 512);
        pack_del(&mut buf);

        let (c, rest) = unpack(&buf, 512).unwrap();
        assert_eq!(
            c,
            Cell::Key {
                prefix: 3,
                suffix: b"fix"
            }
        );
        let (c, rest) = unpack(rest, 512).unwrap();
        assert_eq!(c, Cell::Value(b"hello"));
        let (c, rest) = unpack(rest, 512).unwrap();
        assert_eq!(c, Cell::Addr(cookie));
        let (c, rest) = unpack(rest, 512).unwrap();
        assert_eq!(c, Cell::ValueOvfl(cookie));
        let (c, rest) = unpack(rest, 512).unwrap();
        assert_eq!(c, Cell::Del);
        assert!(rest.is_empty());
    }

    #[test]
    fn junk_rejected() {
        assert!(unpack(&[], 512).is_err());
        assert!(unpack(&[99], 512).is_err());
        // Key claiming more bytes than remain.
        let mut buf = Vec::new();
        pack_key(&mut buf, 0, b"abcdef");
        buf.truncate(buf.len() - 2);
        assert!(unpack(&buf, 512).is_err());
    }

    #[test]
    fn prefix_helper() {
        assert_eq!(common_prefix(b"apple", b"apply"), 4);
        assert_eq!(common_prefix(b"", b"x"), 0);
        assert_eq!(common_prefix(b"same", b"same"), 4);
    }
}
