//! An embedded transactional key-value storage engine.
//!
//! The crate is organised around six cooperating pieces: the extent
//! allocator ([`ext`]), the block manager ([`block`]), the B-tree page
//! cache ([`page`], [`btree`]), hazard-pointer-based eviction ([`hazard`],
//! [`evict`]), the group-commit write-ahead log ([`wal`]), and the async
//! operation pipeline ([`async_ops`]). An [`Engine`] handle ties one
//! database home's instances of all of them together; nothing lives in
//! process-wide state.
//!
//! ```no_run
//! use burrowdb::{Engine, EngineConfig, StoreKind};
//!
//! let engine = Engine::open("/tmp/db", EngineConfig::default())?;
//! engine.create_table("names", StoreKind::Row)?;
//! let table = engine.open_table("names")?;
//! let session = engine.open_session();
//! table.put(&session, b"key", b"value")?;
//! assert_eq!(table.get(&session, b"key")?, Some(b"value".to_vec()));
//! engine.close()?;
//! # Ok::<(), burrowdb::Error>(())
//! ```

pub mod async_ops;
mod backoff;
pub mod block;
pub mod btree;
pub mod compress;
mod conn;
pub mod error;
pub mod evict;
pub mod ext;
pub mod hazard;
mod io;
pub mod pack;
pub mod page;
pub mod session;
mod track;
pub mod turtle;
pub mod txn;
pub mod wal;

pub use async_ops::OpKind;
pub use block::Cookie;
pub use btree::{Btree, BtreeConfig, StoreKind};
pub use conn::{Engine, EngineConfig, Table};
pub use error::{Error, Result};
pub use session::Session;
pub use wal::{Lsn, SyncLevel};
