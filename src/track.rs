//! Deferred-work tracking for compound operations.
//!
//! A `MetaTrack` records each structural mutation (file created, file
//! removed to a temporary name, turtle rewritten) as it happens. On error
//! the list is played backward to restore the filesystem; on success
//! `commit()` disarms it and discards salvage copies.

use std::path::PathBuf;

use crate::error::Result;

enum UndoOp {
    /// A file was created; undo deletes it.
    Created(PathBuf),
    /// A file was moved aside; undo moves it back.
    Renamed { from: PathBuf, to: PathBuf },
}

#[derive(Default)]
pub struct MetaTrack {
    ops: Vec<UndoOp>,
    committed: bool,
}

impl MetaTrack {
    pub fn new() -> MetaTrack {
        MetaTrack::default()
    }

    /// Record a file this operation created.
    pub fn created(&mut self, path: PathBuf) {
        self.ops.push(UndoOp::Created(path));
    }

    /// Move a file aside instead of deleting it, so the undo can restore
    /// it.
    pub fn remove_via_rename(&mut self, path: PathBuf) -> Result<()> {
        let mut aside = path.clone();
        aside.set_extension("deleted");
        std::fs::rename(&path, &aside)?;
        self.ops.push(UndoOp::Renamed {
            from: path,
            to: aside,
        });
        Ok(())
    }

    /// The operation succeeded: drop undo state, delete set-aside files.
    pub fn commit(mut self) {
        self.committed = true;
        for op in self.ops.drain(..) {
            if let UndoOp::Renamed { to, .. } = op {
                let _ = std::fs::remove_file(to);
            }
        }
    }
}

impl Drop for MetaTrack {
    /// Played backward so later mutations unwind before the ones they
    /// depended on.
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for op in self.ops.drain(..).rev() {
            match op {
                UndoOp::Created(path) => {
                    let _ = std::fs::remove_file(&path);
                    log::debug!("rolled back created file {path:?}");
                }
                UndoOp::Renamed { from, to } => {
                    let _ = std::fs::rename(&to, &from);
                    log::debug!("restored {from:?}");
                }
            }
        }
    }
}
