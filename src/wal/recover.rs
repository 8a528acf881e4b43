//! Crash-recovery scan.
//!
//! The scan walks records forward from a starting LSN and stops at the
//! first record whose checksum fails or whose length runs past the file;
//! the tail is truncated at that boundary so appends continue cleanly.
//! All-zero space (the untouched remainder of a pre-allocated file) reads
//! as a clean end, not corruption.

use std::fs::OpenOptions;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::io;

use super::{record, LogConfig, LogPayload, Lsn, LOG_FIRST_RECORD, RECORD_HEADER_SIZE};

pub struct LogScanner {
    cfg: LogConfig,
}

impl LogScanner {
    pub fn new(cfg: LogConfig) -> LogScanner {
        LogScanner { cfg }
    }

    fn file_path(&self, id: u32) -> PathBuf {
        self.cfg.dir.join(super::log_file_name(id))
    }

    /// Scan from `start`, invoking `visit` with each record's LSN and
    /// decoded payload. Returns the end LSN: the position after the last
    /// valid record.
    pub fn scan(
        &self,
        start: Lsn,
        mut visit: impl FnMut(Lsn, LogPayload) -> Result<()>,
    ) -> Result<Lsn> {
        let mut cur = if start == Lsn::ZERO { Lsn::FIRST } else { start };
        if cur.offset < LOG_FIRST_RECORD {
            cur.offset = LOG_FIRST_RECORD;
        }
        loop {
            let path = self.file_path(cur.file);
            if !path.exists() {
                return Ok(cur);
            }
            let file = OpenOptions::new().read(true).write(true).open(&path)?;
            let len = file.metadata()?.len();
            let mut data = vec![0u8; len as usize];
            io::read_at(&file, 0, &mut data)?;

            // Validate the descriptor record up front.
            match record::unframe(&data) {
                Ok((desc, _)) => super::Log::check_file_desc(&self.cfg, desc)?,
                Err(_) => {
                    return Err(Error::corrupt("log", 0, "bad log file descriptor"));
                }
            }

            let mut off = cur.offset.max(LOG_FIRST_RECORD);
            loop {
                if off + RECORD_HEADER_SIZE as u64 > len {
                    break;
                }
                let slice = &data[off as usize..];
                // A zeroed header is the end of the written region.
                if slice[..RECORD_HEADER_SIZE.min(slice.len())]
                    .iter()
                    .all(|&b| b == 0)
                {
                    break;
                }
                match record::unframe(slice) {
                    Ok((payload, total)) => {
                        let payload = match LogPayload::decode(payload) {
                            Ok(p) => p,
                            Err(e) => {
                                log::warn!(
                                    "log record at {}/{off} undecodable: {e}; truncating",
                                    cur.file
                                );
                                file.set_len(off)?;
                                return Ok(Lsn {
                                    file: cur.file,
                                    offset: off,
                                });
                            }
                        };
                        let lsn = Lsn {
                            file: cur.file,
                            offset: off,
                        };
                        visit(lsn, payload)?;
                        off += total as u64;
                    }
                    Err(_) => {
                        // Torn or corrupt tail: truncate and stop the scan.
                        log::warn!(
                            "log scan stopped at {}/{off}: bad record; truncating tail",
                            cur.file
                        );
                        file.set_len(off)?;
                        return Ok(Lsn {
                            file: cur.file,
                            offset: off,
                        });
                    }
                }
            }
            cur = Lsn {
                file: cur.file,
                offset: off,
            };
            // Move to the next file, if any.
            let next = Lsn {
                file: cur.file + 1,
                offset: LOG_FIRST_RECORD,
            };
            if !self.file_path(next.file).exists() {
                return Ok(cur);
            }
            cur = next;
        }
    }

    /// Position appends should continue from: the end of the last valid
    /// record in the newest log file.
    pub fn find_end(&self) -> Result<Lsn> {
        let mut max_file = 0u32;
        if self.cfg.dir.exists() {
            for entry in std::fs::read_dir(&self.cfg.dir)? {
                let name = entry?.file_name();
                let name = name.to_string_lossy();
                if let Some(id) = name
                    .strip_prefix(&format!("{}.", super::LOG_FILE_PREFIX))
                    .and_then(|s| s.parse::<u32>().ok())
                {
                    max_file = max_file.max(id);
                }
            }
        }
        if max_file == 0 {
            return Ok(Lsn::FIRST);
        }
        self.scan(
            Lsn {
                file: max_file,
                offset: LOG_FIRST_RECORD,
            },
            |_, _| Ok(()),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{Log, LogServer, SyncLevel};
    use super::*;
    use crate::error::PanicCell;
    use crate::wal::LogOp;

    fn cfg(dir: &std::path::Path) -> LogConfig {
        LogConfig {
            dir: dir.to_path_buf(),
            file_size: 8 * 1024,
            prealloc: 1,
            archive: false,
        }
    }

    fn commit(txn: u64, n: u64) -> Vec<u8> {
        LogPayload::Commit {
            txn,
            ops: vec![LogOp::RowPut {
                uri: "table:t".into(),
                key: format!("k{n}").into_bytes(),
                value: format!("v{n}").into_bytes(),
            }],
        }
        .encode()
    }

    #[test]
    fn scan_replays_written_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = Log::open(cfg(dir.path()), Arc::new(PanicCell::new())).unwrap();
            let server = LogServer::spawn(log.clone());
            for i in 0..40u64 {
                log.append(&commit(i, i), SyncLevel::Fsync).unwrap();
            }
            server.stop();
        }
        let scanner = LogScanner::new(cfg(dir.path()));
        let mut seen = Vec::new();
        let end = scanner
            .scan(Lsn::ZERO, |lsn, payload| {
                if let LogPayload::Commit { txn, .. } = payload {
                    seen.push((lsn, txn));
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.len(), 40);
        // LSNs are strictly increasing.
        for pair in seen.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert!(end > seen.last().unwrap().0);
        assert_eq!(scanner.find_end().unwrap(), end);
    }

    #[test]
    fn corrupt_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let (third_lsn, end_before) = {
            let log = Log::open(cfg(dir.path()), Arc::new(PanicCell::new())).unwrap();
            let server = LogServer::spawn(log.clone());
            let mut lsns = Vec::new();
            for i in 0..5u64 {
                lsns.push(log.append(&commit(i, i), SyncLevel::Fsync).unwrap());
            }
            server.stop();
            (lsns[2], lsns[4])
        };
        // Flip a byte in the fourth record's payload.
        let path = dir.path().join(super::super::log_file_name(third_lsn.file));
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        io::write_at(&file, third_lsn.offset + 40, &[0xFF]).unwrap();
        drop(file);

        let scanner = LogScanner::new(cfg(dir.path()));
        let mut count = 0;
        let end = scanner
            .scan(Lsn::ZERO, |_, _| {
                count += 1;
                Ok(())
            })
            .unwrap();
        // The two records before the damage survive; the tail is gone.
        assert_eq!(count, 3);
        assert_eq!(end, third_lsn);
        assert!(end < end_before);

        // A rescan sees a clean log ending at the truncation point.
        let mut count2 = 0;
        let end2 = scanner
            .scan(Lsn::ZERO, |_, _| {
                count2 += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!((count2, end2), (3, end));
    }

    #[test]
    fn scan_from_mid_lsn_skips_earlier_records() {
        let dir = tempfile::tempdir().unwrap();
        let lsns = {
            let log = Log::open(cfg(dir.path()), Arc::new(PanicCell::new())).unwrap();
            let server = LogServer::spawn(log.clone());
            let mut lsns = Vec::new();
            for i in 0..10u64 {
                lsns.push(log.append(&commit(i, i), SyncLevel::Fsync).unwrap());
            }
            server.stop();
            lsns
        };
        let scanner = LogScanner::new(cfg(dir.path()));
        // Start at the end LSN of the fifth record = start of the sixth.
        let mut seen = Vec::new();
        scanner
            .scan(lsns[4], |_, payload| {
                if let LogPayload::Commit { txn, .. } = payload {
                    seen.push(txn);
                }
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![5, 6, 7, 8, 9]);
    }
}
