//! Log record framing and the typed operation payloads.
//!
//! A framed record is `{header, payload, pad}` aligned to [`LOG_ALIGN`];
//! the checksum covers the whole aligned record with the checksum field
//! zeroed. Payloads carry either one committed transaction's operations
//! or a marker (checkpoint, file sync).

use crate::block::checksum;
use crate::error::{Error, Result};
use crate::pack::{pack_uint, unpack_uint};

use super::{Lsn, RecordHeader, LOG_ALIGN, RECORD_HEADER_SIZE};

const REC_COMMIT: u8 = 1;
const REC_CHECKPOINT: u8 = 2;
const REC_FILE_SYNC: u8 = 3;

const OP_ROW_PUT: u8 = 1;
const OP_ROW_REMOVE: u8 = 2;
const OP_COL_PUT: u8 = 3;
const OP_COL_REMOVE: u8 = 4;

/// One logged operation inside a commit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    RowPut {
        uri: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    RowRemove {
        uri: String,
        key: Vec<u8>,
    },
    ColPut {
        uri: String,
        recno: u64,
        value: Vec<u8>,
    },
    ColRemove {
        uri: String,
        recno: u64,
    },
}

/// A decoded record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// A committed transaction and its operations.
    Commit { txn: u64, ops: Vec<LogOp> },
    /// A checkpoint completed; recovery may start here.
    Checkpoint { lsn: Lsn },
    /// A file was synced to disk (directory-entry durability marker).
    FileSync { uri: String },
}

fn pack_bytes(out: &mut Vec<u8>, data: &[u8]) {
    pack_uint(out, data.len() as u64);
    out.extend_from_slice(data);
}

fn unpack_bytes(buf: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let (len, rest) = unpack_uint(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::corrupt("log record", 0, "truncated field"));
    }
    let (data, rest) = rest.split_at(len);
    Ok((data.to_vec(), rest))
}

fn unpack_string(buf: &[u8]) -> Result<(String, &[u8])> {
    let (bytes, rest) = unpack_bytes(buf)?;
    let s = String::from_utf8(bytes)
        .map_err(|_| Error::corrupt("log record", 0, "invalid UTF-8 uri"))?;
    Ok((s, rest))
}

impl LogPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            LogPayload::Commit { txn, ops } => {
                out.push(REC_COMMIT);
                pack_uint(&mut out, *txn);
                pack_uint(&mut out, ops.len() as u64);
                for op in ops {
                    match op {
                        LogOp::RowPut { uri, key, value } => {
                            out.push(OP_ROW_PUT);
                            pack_bytes(&mut out, uri.as_bytes());
                            pack_bytes(&mut out, key);
                            pack_bytes(&mut out, value);
                        }
                        LogOp::RowRemove { uri, key } => {
                            out.push(OP_ROW_REMOVE);
                            pack_bytes(&mut out, uri.as_bytes());
                            pack_bytes(&mut out, key);
                        }
                        LogOp::ColPut { uri, recno, value } => {
                            out.push(OP_COL_PUT);
                            pack_bytes(&mut out, uri.as_bytes());
                            pack_uint(&mut out, *recno);
                            pack_bytes(&mut out, value);
                        }
                        LogOp::ColRemove { uri, recno } => {
                            out.push(OP_COL_REMOVE);
                            pack_bytes(&mut out, uri.as_bytes());
                            pack_uint(&mut out, *recno);
                        }
                    }
                }
            }
            LogPayload::Checkpoint { lsn } => {
                out.push(REC_CHECKPOINT);
                pack_uint(&mut out, u64::from(lsn.file));
                pack_uint(&mut out, lsn.offset);
            }
            LogPayload::FileSync { uri } => {
                out.push(REC_FILE_SYNC);
                pack_bytes(&mut out, uri.as_bytes());
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<LogPayload> {
        let (&ty, rest) = buf
            .split_first()
            .ok_or_else(|| Error::corrupt("log record", 0, "empty payload"))?;
        match ty {
            REC_COMMIT => {
                let (txn, rest) = unpack_uint(rest)?;
                let (nops, mut rest) = unpack_uint(rest)?;
                let mut ops = Vec::with_capacity(nops as usize);
                for _ in 0..nops {
                    let (&opty, r) = rest
                        .split_first()
                        .ok_or_else(|| Error::corrupt("log record", 0, "truncated op"))?;
                    match opty {
                        OP_ROW_PUT => {
                            let (uri, r) = unpack_string(r)?;
                            let (key, r) = unpack_bytes(r)?;
                            let (value, r) = unpack_bytes(r)?;
                            ops.push(LogOp::RowPut { uri, key, value });
                            rest = r;
                        }
                        OP_ROW_REMOVE => {
                            let (uri, r) = unpack_string(r)?;
                            let (key, r) = unpack_bytes(r)?;
                            ops.push(LogOp::RowRemove { uri, key });
                            rest = r;
                        }
                        OP_COL_PUT => {
                            let (uri, r) = unpack_string(r)?;
                            let (recno, r) = unpack_uint(r)?;
                            let (value, r) = unpack_bytes(r)?;
                            ops.push(LogOp::ColPut { uri, recno, value });
                            rest = r;
                        }
                        OP_COL_REMOVE => {
                            let (uri, r) = unpack_string(r)?;
                            let (recno, r) = unpack_uint(r)?;
                            ops.push(LogOp::ColRemove { uri, recno });
                            rest = r;
                        }
                        _ => return Err(Error::corrupt("log record", 0, "unknown op type")),
                    }
                }
                Ok(LogPayload::Commit { txn, ops })
            }
            REC_CHECKPOINT => {
                let (file, rest) = unpack_uint(rest)?;
                let (offset, _) = unpack_uint(rest)?;
                Ok(LogPayload::Checkpoint {
                    lsn: Lsn {
                        file: file as u32,
                        offset,
                    },
                })
            }
            REC_FILE_SYNC => {
                let (uri, _) = unpack_string(rest)?;
                Ok(LogPayload::FileSync { uri })
            }
            _ => Err(Error::corrupt("log record", 0, "unknown record type")),
        }
    }
}

/// Aligned on-disk size of a record with a `payload_len`-byte payload.
pub fn framed_len(payload_len: usize) -> usize {
    let raw = RECORD_HEADER_SIZE + payload_len;
    (raw + LOG_ALIGN as usize - 1) / LOG_ALIGN as usize * LOG_ALIGN as usize
}

/// Frame a payload: header, payload, zero pad, checksum stamped.
pub fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    let total = framed_len(payload.len());
    if total > u32::MAX as usize {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "log record too large",
        )));
    }
    let mut buf = vec![0u8; total];
    buf[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let header = RecordHeader {
        len: total as u32,
        checksum: 0,
        flags: 0,
        unused: [0; 2],
        mem_len: (RECORD_HEADER_SIZE + payload.len()) as u32,
    };
    buf[..RECORD_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
    let sum = checksum(&buf);
    buf[4..8].copy_from_slice(&sum.to_le_bytes());
    Ok(buf)
}

/// Validate a framed record in place; returns `(payload, aligned_len)`.
pub fn unframe(buf: &[u8]) -> Result<(&[u8], usize)> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Err(Error::corrupt("log record", 0, "short record"));
    }
    let header: RecordHeader = *bytemuck::from_bytes(&buf[..RECORD_HEADER_SIZE]);
    let total = header.len as usize;
    if total == 0
        || total % LOG_ALIGN as usize != 0
        || total > buf.len()
        || (header.mem_len as usize) > total
        || (header.mem_len as usize) < RECORD_HEADER_SIZE
    {
        return Err(Error::corrupt("log record", 0, "bad record length"));
    }
    let mut copy = buf[..total].to_vec();
    copy[4..8].copy_from_slice(&[0; 4]);
    let sum = checksum(&copy);
    if sum != header.checksum {
        return Err(Error::corrupt("log record", 0, "record checksum mismatch"));
    }
    Ok((
        &buf[RECORD_HEADER_SIZE..header.mem_len as usize],
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_aligns_and_roundtrips() {
        let rec = frame(b"payload bytes").unwrap();
        assert_eq!(rec.len() % LOG_ALIGN as usize, 0);
        let (payload, len) = unframe(&rec).unwrap();
        assert_eq!(payload, b"payload bytes");
        assert_eq!(len, rec.len());
    }

    #[test]
    fn corrupt_frame_rejected() {
        let mut rec = frame(b"payload").unwrap();
        rec[40] ^= 0xFF;
        assert!(unframe(&rec).is_err());
        // All-zero region reads as end-of-log, not a record.
        let zeros = vec![0u8; 256];
        assert!(unframe(&zeros).is_err());
    }

    #[test]
    fn payload_roundtrip() {
        let payload = LogPayload::Commit {
            txn: 42,
            ops: vec![
                LogOp::RowPut {
                    uri: "table:a".into(),
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                },
                LogOp::RowRemove {
                    uri: "table:a".into(),
                    key: b"dead".to_vec(),
                },
                LogOp::ColPut {
                    uri: "table:c".into(),
                    recno: 9,
                    value: b"cv".to_vec(),
                },
                LogOp::ColRemove {
                    uri: "table:c".into(),
                    recno: 10,
                },
            ],
        };
        let enc = payload.encode();
        assert_eq!(LogPayload::decode(&enc).unwrap(), payload);

        let ckpt = LogPayload::Checkpoint {
            lsn: Lsn {
                file: 3,
                offset: 4096,
            },
        };
        assert_eq!(LogPayload::decode(&ckpt.encode()).unwrap(), ckpt);
    }
}
