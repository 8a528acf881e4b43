//! The engine handle: one database home, every subsystem behind it.
//!
//! An [`Engine`] owns the block files, the shared page cache and eviction
//! server, the write-ahead log and its background threads, the async op
//! pipeline, and the metadata tree named by the turtle file. There is no
//! process-wide state: everything hangs off the handle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use fs4::fs_std::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::async_ops::{AsyncConfig, AsyncExec, AsyncSystem, OpCallback, OpKind};
use crate::block::{BlockConfig, BlockFile, CheckpointDesc, OpenMode, BLOCK_HEADER_BYTE_SIZE};
use crate::btree::{Btree, BtreeConfig, StoreKind};
use crate::error::{Error, PanicCell, Result};
use crate::evict::{Cache, CacheConfig, EvictServer, TreeRegistry};
use crate::wal::{Log, LogConfig, LogOp, LogPayload, LogScanner, LogServer, Lsn, SyncLevel};
use crate::pack::Format;
use crate::page::{PageHeader, PageType, PAGE_HEADER_SIZE};
use crate::session::Session;
use crate::track::MetaTrack;
use crate::turtle::{Turtle, KEY_CHECKPOINT_LSN, KEY_META_CHECKPOINT, KEY_VERSION};
use crate::txn::TxnGlobal;

const DESC_FILE: &str = "BURROW";
const LOCK_FILE: &str = "lock";
const META_FILE: &str = "meta.bt";
const VERSION_STRING: &str = "burrowdb 0.1.0";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cache_size: u64,
    pub cache_trigger_pct: u64,
    pub eviction_workers: usize,
    pub hazard_max: usize,
    pub allocation_unit: u64,
    pub extend_stride: u64,
    pub alloc_first: bool,
    pub mmap: bool,
    pub log_file_size: u64,
    pub log_prealloc: usize,
    /// Log directory override; defaults to the database home.
    pub log_dir: Option<PathBuf>,
    pub async_ops_max: usize,
    pub async_workers: usize,
    pub key_gap: usize,
    pub split_size: usize,
    /// Durability of implicit (auto-committed) operations.
    pub commit_sync: SyncLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            cache_size: 100 << 20,
            cache_trigger_pct: 80,
            eviction_workers: 1,
            hazard_max: 1024,
            allocation_unit: 4096,
            extend_stride: 4 << 20,
            alloc_first: false,
            mmap: false,
            log_file_size: 10 << 20,
            log_prealloc: 2,
            log_dir: None,
            async_ops_max: 1024,
            async_workers: 2,
            key_gap: 10,
            split_size: 32 * 1024,
            commit_sync: SyncLevel::Fsync,
        }
    }
}

/// A handle to one table; cheap to clone.
#[derive(Clone)]
pub struct Table {
    name: String,
    uri: String,
    tree: Arc<Btree>,
    engine: Arc<EngineInner>,
}

pub struct Engine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    home: PathBuf,
    cfg: EngineConfig,
    panic: Arc<PanicCell>,
    txn: Arc<TxnGlobal>,
    cache: Arc<Cache>,
    log: Arc<Log>,
    log_server: Mutex<Option<LogServer>>,
    evict_server: Mutex<Option<EvictServer>>,
    async_sys: OnceLock<Arc<AsyncSystem>>,
    trees: RwLock<HashMap<String, Arc<Btree>>>,
    registry: TreeRegistry,
    meta: OnceLock<Arc<Btree>>,
    turtle: Mutex<Turtle>,
    /// Per-session operation buffers for explicit transactions.
    pending_log: Mutex<HashMap<u64, Vec<LogOp>>>,
    ckpt_mutex: Mutex<()>,
    /// Captures the file list atomically for hot backup.
    backup_lock: Mutex<()>,
    closed: AtomicBool,
    _home_lock: File,
}

impl Engine {
    pub fn open(home: impl AsRef<Path>, cfg: EngineConfig) -> Result<Engine> {
        let home = home.as_ref().to_path_buf();
        std::fs::create_dir_all(&home)?;

        // Exclusive home lock: a second opener fails fast.
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(home.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(Error::HomeLock)?;

        let desc_path = home.join(DESC_FILE);
        if !desc_path.exists() {
            std::fs::write(&desc_path, format!("{VERSION_STRING}\n"))?;
        }

        let panic = Arc::new(PanicCell::new());
        let txn = Arc::new(TxnGlobal::new());
        let cache = Cache::new(CacheConfig {
            max_bytes: cfg.cache_size,
            trigger_pct: cfg.cache_trigger_pct,
        });
        let log_dir = cfg.log_dir.clone().unwrap_or_else(|| home.clone());
        let log = Log::open(
            LogConfig {
                dir: log_dir,
                file_size: cfg.log_file_size,
                prealloc: cfg.log_prealloc,
                archive: true,
            },
            panic.clone(),
        )?;
        let mut turtle = Turtle::load(&home)?;
        if turtle.get(KEY_VERSION).is_none() {
            turtle.set(KEY_VERSION, VERSION_STRING.to_string());
        }

        let inner = Arc::new(EngineInner {
            home,
            panic,
            txn,
            cache,
            log,
            log_server: Mutex::new(None),
            evict_server: Mutex::new(None),
            async_sys: OnceLock::new(),
            trees: RwLock::new(HashMap::new()),
            registry: Arc::new(RwLock::new(Vec::new())),
            meta: OnceLock::new(),
            turtle: Mutex::new(turtle),
            pending_log: Mutex::new(HashMap::new()),
            ckpt_mutex: Mutex::new(()),
            backup_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            _home_lock: lock_file,
            cfg,
        });

        *inner.log_server.lock() = Some(LogServer::spawn(inner.log.clone()));
        inner.open_meta()?;
        inner.recover()?;
        *inner.evict_server.lock() = Some(EvictServer::spawn(
            inner.cache.clone(),
            inner.registry.clone(),
            inner.cfg.eviction_workers.saturating_sub(1),
        ));
        let async_sys = AsyncSystem::new(
            AsyncConfig {
                ops_max: inner.cfg.async_ops_max,
                workers: inner.cfg.async_workers,
            },
            Arc::new(AsyncBridge {
                inner: Arc::downgrade(&inner),
            }),
        );
        let _ = inner.async_sys.set(async_sys);
        log::info!("engine open at {:?}", inner.home);
        Ok(Engine { inner })
    }

    pub fn open_session(&self) -> Arc<Session> {
        self.inner.open_session()
    }

    pub fn close_session(&self, session: &Arc<Session>) {
        if let Some(async_sys) = self.inner.async_sys.get() {
            async_sys.cancel_session(session.id());
        }
        session.close();
    }

    pub fn create_table(&self, name: &str, store: StoreKind) -> Result<()> {
        self.inner.create_table(name, store)
    }

    pub fn open_table(&self, name: &str) -> Result<Table> {
        let tree = self.inner.open_tree(name)?;
        Ok(Table {
            uri: format!("table:{name}"),
            name: name.to_string(),
            tree,
            engine: self.inner.clone(),
        })
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.inner.drop_table(name)
    }

    /// Engine-wide checkpoint: every open tree, the metadata tree, the
    /// turtle, and a log marker.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }

    /// Verify a table's on-disk structure against its last checkpoint.
    pub fn verify_table(&self, name: &str) -> Result<()> {
        self.inner.verify_table(name)
    }

    /// Enqueue an async operation against a table URI.
    pub fn async_submit(
        &self,
        session: &Session,
        uri: &str,
        cfg: &str,
        op: OpKind,
        callback: OpCallback,
    ) -> Result<()> {
        self.inner.panic.check()?;
        self.inner
            .async_sys
            .get()
            .ok_or(Error::Shutdown)?
            .submit(session, uri, cfg, op, callback)
    }

    /// Wait for every async op enqueued before this call.
    pub fn async_flush(&self, session: &Session) -> Result<()> {
        self.inner
            .async_sys
            .get()
            .ok_or(Error::Shutdown)?
            .flush(session)
    }

    /// Copy a consistent snapshot of the database into `dest`. Log
    /// archival is held off while the copy runs.
    pub fn backup(&self, dest: impl AsRef<Path>) -> Result<()> {
        self.inner.backup(dest.as_ref())
    }

    pub fn commit_session(&self, session: &Session) -> Result<()> {
        self.inner.commit_session(session)
    }

    pub fn rollback_session(&self, session: &Session) -> Result<()> {
        self.inner.pending_log.lock().remove(&session.id());
        session.rollback()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.inner.log.durable_lsn()
    }

    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    /// Tear the engine down the way a crash would: background threads are
    /// stopped but nothing is checkpointed or flushed. Reopening the home
    /// runs recovery. Intended for crash testing.
    pub fn crash(self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(async_sys) = self.inner.async_sys.get() {
            async_sys.shutdown();
        }
        if let Some(server) = self.inner.evict_server.lock().take() {
            server.stop();
        }
        if let Some(server) = self.inner.log_server.lock().take() {
            server.stop();
        }
        log::warn!("engine torn down without checkpoint (crash simulation)");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            let _ = self.inner.close();
        }
    }
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn put(&self, session: &Session, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine.apply_row(
            session,
            &self.tree,
            &self.uri,
            key,
            Some(value),
            true,
        )
    }

    /// Insert-only variant: a visible duplicate fails.
    pub fn insert(&self, session: &Session, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine.apply_row(
            session,
            &self.tree,
            &self.uri,
            key,
            Some(value),
            false,
        )
    }

    pub fn remove(&self, session: &Session, key: &[u8]) -> Result<()> {
        self.engine
            .apply_row(session, &self.tree, &self.uri, key, None, true)
    }

    pub fn get(&self, session: &Session, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(session, key)
    }

    pub fn scan(&self, session: &Session) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree.scan(session)
    }

    /// Append one record to a column store, returning its record number.
    pub fn append(&self, session: &Session, value: &[u8]) -> Result<u64> {
        let recno = self.tree.next_recno();
        self.engine
            .apply_col(session, &self.tree, &self.uri, recno, Some(value))?;
        Ok(recno)
    }

    pub fn put_col(&self, session: &Session, recno: u64, value: &[u8]) -> Result<()> {
        self.engine
            .apply_col(session, &self.tree, &self.uri, recno, Some(value))
    }

    pub fn remove_col(&self, session: &Session, recno: u64) -> Result<()> {
        self.engine
            .apply_col(session, &self.tree, &self.uri, recno, None)
    }

    pub fn get_col(&self, session: &Session, recno: u64) -> Result<Option<Vec<u8>>> {
        self.tree.get_col(session, recno)
    }

    pub fn tree(&self) -> &Arc<Btree> {
        &self.tree
    }
}

impl EngineInner {
    fn block_config(&self) -> BlockConfig {
        BlockConfig {
            allocation_unit: self.cfg.allocation_unit,
            extend_stride: self.cfg.extend_stride,
            alloc_first: self.cfg.alloc_first,
            mmap: self.cfg.mmap,
        }
    }

    fn btree_config(&self, store: StoreKind) -> BtreeConfig {
        BtreeConfig {
            store,
            key_gap: self.cfg.key_gap,
            split_size: self.cfg.split_size,
            ovfl_size: self.cfg.split_size / 4,
            fix_width: 1,
            data_checksum: true,
        }
    }

    fn open_session(&self) -> Arc<Session> {
        let session = Session::new(self.txn.clone(), self.cfg.hazard_max);
        self.cache.register_hazards(session.hazard.clone());
        session
    }

    fn meta(&self) -> &Arc<Btree> {
        self.meta.get().expect("metadata tree not open")
    }

    /// Open or create the metadata tree named by the turtle.
    fn open_meta(&self) -> Result<()> {
        let path = self.home.join(META_FILE);
        let meta_desc = {
            let turtle = self.turtle.lock();
            match turtle.get(KEY_META_CHECKPOINT) {
                Some(hex) => {
                    let bytes = Turtle::decode_bytes(hex)?;
                    Some(CheckpointDesc::unpack(self.cfg.allocation_unit, &bytes)?)
                }
                None => None,
            }
        };
        if !path.exists() {
            let mut track = MetaTrack::new();
            BlockFile::create(&path, &self.block_config())?;
            track.created(path.clone());
            track.commit();
        }
        let block = Arc::new(BlockFile::open(
            &path,
            &self.block_config(),
            OpenMode::Normal,
            self.panic.clone(),
        )?);
        let tree = match meta_desc {
            Some(desc) => {
                block.checkpoint_load(&desc)?;
                Btree::open(
                    META_FILE.into(),
                    block,
                    self.cache.clone(),
                    self.txn.clone(),
                    self.btree_config(StoreKind::Row),
                    self.panic.clone(),
                    desc.root,
                )
            }
            None => Btree::create(
                META_FILE.into(),
                block,
                self.cache.clone(),
                self.txn.clone(),
                self.btree_config(StoreKind::Row),
                self.panic.clone(),
            ),
        };
        self.registry.write().push(Arc::downgrade(&tree));
        let _ = self.meta.set(tree);
        Ok(())
    }

    // -------------------------------------------------------------- recovery

    /// Replay the log from the last checkpoint. Operations are idempotent
    /// against checkpointed state; removes of already-gone keys are
    /// ignored.
    fn recover(&self) -> Result<()> {
        let start = {
            let turtle = self.turtle.lock();
            match turtle.get(KEY_CHECKPOINT_LSN) {
                Some(text) => parse_lsn(text)?,
                None => Lsn::ZERO,
            }
        };
        let scanner = LogScanner::new(LogConfig {
            dir: self.log.dir().to_path_buf(),
            file_size: self.cfg.log_file_size,
            prealloc: 0,
            archive: false,
        });
        let session = self.open_session();
        let mut replayed = 0usize;
        let end = scanner.scan(start, |_lsn, payload| {
            match payload {
                LogPayload::Commit { ops, .. } => {
                    for op in ops {
                        self.replay_op(&session, &op)?;
                        replayed += 1;
                    }
                }
                LogPayload::Checkpoint { lsn } => {
                    self.log.set_checkpoint_lsn(lsn);
                }
                LogPayload::FileSync { .. } => {}
            }
            Ok(())
        })?;
        if replayed > 0 {
            log::info!("recovery replayed {replayed} operations up to {end:?}");
            // Everything replayed is now in the trees; checkpoint so the
            // next open doesn't repeat the work.
            self.checkpoint()?;
        }
        Ok(())
    }

    fn replay_op(&self, session: &Session, op: &LogOp) -> Result<()> {
        let apply = |uri: &str, f: &dyn Fn(&Arc<Btree>) -> Result<()>| -> Result<()> {
            let name = uri.strip_prefix("table:").unwrap_or(uri);
            match self.open_tree(name) {
                Ok(tree) => f(&tree),
                // The table vanished after these records were written.
                Err(Error::NotFound) => Ok(()),
                Err(e) => Err(e),
            }
        };
        match op {
            LogOp::RowPut { uri, key, value } => apply(uri, &|tree| {
                tree.put(session, key, Some(value), true)
            }),
            LogOp::RowRemove { uri, key } => apply(uri, &|tree| {
                match tree.put(session, key, None, true) {
                    Err(Error::NotFound) => Ok(()),
                    other => other,
                }
            }),
            LogOp::ColPut { uri, recno, value } => apply(uri, &|tree| {
                tree.note_recno(*recno);
                tree.put_col(session, *recno, Some(value))
            }),
            LogOp::ColRemove { uri, recno } => apply(uri, &|tree| {
                tree.put_col(session, *recno, None)
            }),
        }
    }

    // ---------------------------------------------------------------- tables

    /// Metadata row for a table: store kind byte, then the packed
    /// checkpoint descriptor.
    fn encode_meta(&self, store: StoreKind, desc: Option<&CheckpointDesc>) -> Vec<u8> {
        let mut out = vec![match store {
            StoreKind::Row => 1u8,
            StoreKind::ColFix => 2,
            StoreKind::ColVar => 3,
        }];
        if let Some(desc) = desc {
            desc.pack(self.cfg.allocation_unit, &mut out);
        }
        out
    }

    fn decode_meta(&self, buf: &[u8]) -> Result<(StoreKind, Option<CheckpointDesc>)> {
        let (&kind, rest) = buf
            .split_first()
            .ok_or_else(|| Error::corrupt("metadata", 0, "empty table entry"))?;
        let store = match kind {
            1 => StoreKind::Row,
            2 => StoreKind::ColFix,
            3 => StoreKind::ColVar,
            _ => return Err(Error::corrupt("metadata", 0, "unknown store kind")),
        };
        let desc = if rest.is_empty() {
            None
        } else {
            Some(CheckpointDesc::unpack(self.cfg.allocation_unit, rest)?)
        };
        Ok((store, desc))
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.home.join(format!("{name}.bt"))
    }

    fn create_table(&self, name: &str, store: StoreKind) -> Result<()> {
        self.panic.check()?;
        if name.is_empty() || name.contains('/') || name.contains('.') {
            return Err(Error::Config(format!("invalid table name \"{name}\"")));
        }
        let session = self.open_session();
        if self.meta().get(&session, name.as_bytes())?.is_some() {
            return Err(Error::DuplicateKey);
        }
        let mut track = MetaTrack::new();
        let path = self.table_path(name);
        BlockFile::create(&path, &self.block_config())?;
        track.created(path);
        self.meta()
            .put(&session, name.as_bytes(), Some(&self.encode_meta(store, None)), false)?;
        // Make the creation durable before handing the table out.
        self.checkpoint()?;
        track.commit();
        log::info!("created table {name}");
        Ok(())
    }

    fn open_tree(&self, name: &str) -> Result<Arc<Btree>> {
        if let Some(tree) = self.trees.read().get(name) {
            return Ok(tree.clone());
        }
        let session = self.open_session();
        let meta_row = self
            .meta()
            .get(&session, name.as_bytes())?
            .ok_or(Error::NotFound)?;
        let (store, desc) = self.decode_meta(&meta_row)?;

        let mut trees = self.trees.write();
        if let Some(tree) = trees.get(name) {
            return Ok(tree.clone());
        }
        let path = self.table_path(name);
        let block = Arc::new(BlockFile::open(
            &path,
            &self.block_config(),
            OpenMode::Normal,
            self.panic.clone(),
        )?);
        let tree = match desc {
            Some(desc) => {
                block.checkpoint_load(&desc)?;
                Btree::open(
                    name.to_string(),
                    block,
                    self.cache.clone(),
                    self.txn.clone(),
                    self.btree_config(store),
                    self.panic.clone(),
                    desc.root,
                )
            }
            None => Btree::create(
                name.to_string(),
                block,
                self.cache.clone(),
                self.txn.clone(),
                self.btree_config(store),
                self.panic.clone(),
            ),
        };
        trees.insert(name.to_string(), tree.clone());
        self.registry.write().push(Arc::downgrade(&tree));
        Ok(tree)
    }

    fn drop_table(&self, name: &str) -> Result<()> {
        self.panic.check()?;
        let session = self.open_session();
        if self.meta().get(&session, name.as_bytes())?.is_none() {
            return Err(Error::NotFound);
        }
        {
            let mut trees = self.trees.write();
            if let Some(tree) = trees.remove(name) {
                tree.discard();
            }
        }
        let mut track = MetaTrack::new();
        track.remove_via_rename(self.table_path(name))?;
        self.meta().put(&session, name.as_bytes(), None, true)?;
        self.checkpoint()?;
        track.commit();
        log::info!("dropped table {name}");
        Ok(())
    }

    // ------------------------------------------------------------- data path

    /// Row mutation: the operation reaches the log before the page dirties,
    /// unless a transaction is open, in which case it is buffered and
    /// logged at commit.
    fn apply_row(
        &self,
        session: &Session,
        tree: &Arc<Btree>,
        uri: &str,
        key: &[u8],
        value: Option<&[u8]>,
        overwrite: bool,
    ) -> Result<()> {
        self.panic.check()?;
        let op = match value {
            Some(v) => LogOp::RowPut {
                uri: uri.to_string(),
                key: key.to_vec(),
                value: v.to_vec(),
            },
            None => LogOp::RowRemove {
                uri: uri.to_string(),
                key: key.to_vec(),
            },
        };
        if session.in_txn() {
            tree.put(session, key, value, overwrite)?;
            self.pending_log
                .lock()
                .entry(session.id())
                .or_default()
                .push(op);
            return Ok(());
        }
        // Single-shot: apply under a short transaction, then log it as
        // committed; a failed apply never reaches the log.
        session.begin()?;
        let txn_id = session.mutation_txn();
        if let Err(e) = tree.put(session, key, value, overwrite) {
            let _ = session.rollback();
            return Err(e);
        }
        if let Err(e) = self.log.append(
            &LogPayload::Commit {
                txn: txn_id,
                ops: vec![op],
            }
            .encode(),
            self.cfg.commit_sync,
        ) {
            // A failed append must unwind the transaction too, or the id
            // stays active forever and pins the reclaim horizon.
            let _ = session.rollback();
            return Err(e);
        }
        session.commit()?;
        Ok(())
    }

    fn apply_col(
        &self,
        session: &Session,
        tree: &Arc<Btree>,
        uri: &str,
        recno: u64,
        value: Option<&[u8]>,
    ) -> Result<()> {
        self.panic.check()?;
        let op = match value {
            Some(v) => LogOp::ColPut {
                uri: uri.to_string(),
                recno,
                value: v.to_vec(),
            },
            None => LogOp::ColRemove {
                uri: uri.to_string(),
                recno,
            },
        };
        if session.in_txn() {
            tree.put_col(session, recno, value)?;
            self.pending_log
                .lock()
                .entry(session.id())
                .or_default()
                .push(op);
            return Ok(());
        }
        session.begin()?;
        let txn_id = session.mutation_txn();
        if let Err(e) = tree.put_col(session, recno, value) {
            let _ = session.rollback();
            return Err(e);
        }
        if let Err(e) = self.log.append(
            &LogPayload::Commit {
                txn: txn_id,
                ops: vec![op],
            }
            .encode(),
            self.cfg.commit_sync,
        ) {
            let _ = session.rollback();
            return Err(e);
        }
        session.commit()?;
        Ok(())
    }

    fn commit_session(&self, session: &Session) -> Result<()> {
        let ops = self.pending_log.lock().remove(&session.id());
        // The record precedes the commit: a crash in between replays a
        // transaction whose effects were about to become visible anyway.
        if let Some(ops) = ops {
            if !ops.is_empty() {
                let txn_id = session.mutation_txn();
                if let Err(e) = self.log.append(
                    &LogPayload::Commit { txn: txn_id, ops }.encode(),
                    self.cfg.commit_sync,
                ) {
                    // Nothing durable exists for this transaction; abort it
                    // rather than leave the session wedged mid-commit.
                    let _ = session.rollback();
                    return Err(e);
                }
            }
        }
        session.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------ checkpoint

    fn checkpoint(&self) -> Result<()> {
        self.panic.check()?;
        let _g = self.ckpt_mutex.lock();
        // Everything logged before this point is what the checkpoint
        // covers; recovery resumes here.
        let start_lsn = self.log.flush(SyncLevel::Fsync)?;

        let session = self.open_session();
        let tables: Vec<(String, Arc<Btree>)> = self
            .trees
            .read()
            .iter()
            .map(|(n, t)| (n.clone(), t.clone()))
            .collect();
        for (name, tree) in &tables {
            let desc = tree.checkpoint()?;
            tree.block().checkpoint_resolve()?;
            let (store, _) = self
                .decode_meta(&self.meta().get(&session, name.as_bytes())?.ok_or_else(
                    || Error::corrupt("metadata", 0, "open table missing from metadata"),
                )?)?;
            self.meta().put(
                &session,
                name.as_bytes(),
                Some(&self.encode_meta(store, Some(&desc))),
                true,
            )?;
        }

        let meta_desc = self.meta().checkpoint()?;
        self.meta().block().checkpoint_resolve()?;

        {
            let mut turtle = self.turtle.lock();
            let mut bytes = Vec::new();
            meta_desc.pack(self.cfg.allocation_unit, &mut bytes);
            turtle.set(KEY_META_CHECKPOINT, Turtle::encode_bytes(&bytes));
            turtle.set(
                KEY_CHECKPOINT_LSN,
                format!("{}/{}", start_lsn.file, start_lsn.offset),
            );
            turtle.store()?;
        }

        self.log.append(
            &LogPayload::Checkpoint { lsn: start_lsn }.encode(),
            SyncLevel::Fsync,
        )?;
        self.log.set_checkpoint_lsn(start_lsn);
        let _ = self.log.archive()?;
        log::debug!("checkpoint complete at {start_lsn:?}");
        Ok(())
    }

    // ---------------------------------------------------------------- verify

    fn verify_table(&self, name: &str) -> Result<()> {
        // Verify against the durable checkpoint, so flush in-memory state
        // first.
        self.checkpoint()?;
        let session = self.open_session();
        let meta_row = self
            .meta()
            .get(&session, name.as_bytes())?
            .ok_or(Error::NotFound)?;
        let (_, desc) = self.decode_meta(&meta_row)?;
        let desc = desc.ok_or_else(|| Error::corrupt("verify", 0, "table never checkpointed"))?;

        let block = BlockFile::open(
            &self.table_path(name),
            &self.block_config(),
            OpenMode::Verify,
            self.panic.clone(),
        )?;
        block.checkpoint_load(&desc)?;
        block.verify_start(&desc)?;
        if !desc.root.is_none() {
            verify_page(&block, desc.root, self.cfg.allocation_unit)?;
        }
        block.verify_end()?;
        Ok(())
    }

    // ---------------------------------------------------------------- backup

    fn backup(&self, dest: &Path) -> Result<()> {
        let _b = self.backup_lock.lock();
        // Keep archival away while we copy log files.
        let _hold = self.log.archive_hold();
        self.checkpoint()?;
        std::fs::create_dir_all(dest)?;

        // Capture the file list in one shot.
        let mut files: Vec<PathBuf> = vec![
            self.home.join(DESC_FILE),
            self.home.join(crate::turtle::TURTLE_FILE),
            self.home.join(META_FILE),
        ];
        for entry in std::fs::read_dir(&self.home)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".bt") && name != META_FILE {
                files.push(entry.path());
            }
        }
        for entry in std::fs::read_dir(self.log.dir())? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("log.") {
                files.push(entry.path());
            }
        }
        for file in files {
            if let Some(fname) = file.file_name() {
                std::fs::copy(&file, dest.join(fname))?;
            }
        }
        log::info!("backup complete to {dest:?}");
        Ok(())
    }

    // ----------------------------------------------------------------- close

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(async_sys) = self.async_sys.get() {
            async_sys.shutdown();
        }
        if let Some(server) = self.evict_server.lock().take() {
            server.stop();
        }
        let result = if self.panic.is_poisoned() {
            Err(Error::Panic)
        } else {
            self.checkpoint()
        };
        if let Some(server) = self.log_server.lock().take() {
            server.stop();
        }
        for (_, tree) in self.trees.write().drain() {
            tree.discard();
        }
        if let Some(meta) = self.meta.get() {
            meta.discard();
        }
        log::info!("engine closed");
        result
    }
}

/// Weak bridge from the async workers back to the engine, so the worker
/// pool doesn't keep a closed engine alive.
struct AsyncBridge {
    inner: Weak<EngineInner>,
}

impl AsyncExec for AsyncBridge {
    fn resolve(&self, uri: &str, cfg: &str) -> Result<(Arc<Btree>, Format, Format)> {
        self.inner
            .upgrade()
            .ok_or(Error::Shutdown)?
            .resolve(uri, cfg)
    }

    fn execute(
        &self,
        session: &Session,
        tree: &Arc<Btree>,
        op: &OpKind,
    ) -> Result<Option<Vec<u8>>> {
        self.inner
            .upgrade()
            .ok_or(Error::Shutdown)?
            .execute(session, tree, op)
    }

    fn session(&self) -> Arc<Session> {
        // Workers are joined before the engine drops; the bridge outlives
        // them only as an empty shell.
        self.inner
            .upgrade()
            .expect("async worker outlived its engine")
            .open_session()
    }
}

impl EngineInner {
    fn resolve(&self, uri: &str, cfg: &str) -> Result<(Arc<Btree>, Format, Format)> {
        let name = uri.strip_prefix("table:").unwrap_or(uri);
        let tree = self.open_tree(name)?;
        let (kf, vf) = match tree.store() {
            StoreKind::Row => (Format::parse("u")?, Format::parse("u")?),
            _ => (Format::parse("r")?, Format::parse("u")?),
        };
        let _ = cfg;
        Ok((tree, kf, vf))
    }

    fn execute(
        &self,
        session: &Session,
        tree: &Arc<Btree>,
        op: &OpKind,
    ) -> Result<Option<Vec<u8>>> {
        let uri = format!("table:{}", tree.name());
        match op {
            OpKind::Put { key, value } => {
                self.apply_row(session, tree, &uri, key, Some(value), true)?;
                Ok(None)
            }
            OpKind::Remove { key } => {
                self.apply_row(session, tree, &uri, key, None, true)?;
                Ok(None)
            }
            OpKind::Get { key } => tree.get(session, key),
            OpKind::ColPut { recno, value } => {
                self.apply_col(session, tree, &uri, *recno, Some(value))?;
                Ok(None)
            }
            OpKind::ColRemove { recno } => {
                self.apply_col(session, tree, &uri, *recno, None)?;
                Ok(None)
            }
            OpKind::Flush => Ok(None),
        }
    }
}

fn parse_lsn(text: &str) -> Result<Lsn> {
    let (file, offset) = text
        .split_once('/')
        .ok_or_else(|| Error::corrupt("turtle", 0, "bad checkpoint LSN"))?;
    Ok(Lsn {
        file: file
            .parse()
            .map_err(|_| Error::corrupt("turtle", 0, "bad checkpoint LSN"))?,
        offset: offset
            .parse()
            .map_err(|_| Error::corrupt("turtle", 0, "bad checkpoint LSN"))?,
    })
}

/// Recursively read every block a page references, so verification marks
/// the whole checkpoint.
fn verify_page(block: &BlockFile, cookie: crate::block::Cookie, unit: u64) -> Result<()> {
    use crate::page::cell::{self, Cell};

    let image = block.read(cookie)?;
    let header: PageHeader = *bytemuck::from_bytes(&image[..PAGE_HEADER_SIZE]);
    let payload = &image[BLOCK_HEADER_BYTE_SIZE..];
    match PageType::from_u8(header.page_type) {
        Some(PageType::RowInt) | Some(PageType::ColInt) => {
            let mut buf = payload;
            for _ in 0..header.entries {
                // Skip the key portion, then follow the child address.
                if PageType::from_u8(header.page_type) == Some(PageType::RowInt) {
                    let (_, rest) = cell::unpack(buf, unit)?;
                    buf = rest;
                } else {
                    let (_, rest) = crate::pack::unpack_uint(buf)?;
                    buf = rest;
                }
                let (acell, rest) = cell::unpack(buf, unit)?;
                buf = rest;
                match acell {
                    Cell::Addr(child) => verify_page(block, child, unit)?,
                    _ => return Err(Error::corrupt("verify", cookie.off, "expected an address")),
                }
            }
        }
        Some(PageType::RowLeaf) => {
            let mut buf = payload;
            for _ in 0..header.entries {
                let (_, rest) = cell::unpack(buf, unit)?;
                let (vcell, rest) = cell::unpack(rest, unit)?;
                buf = rest;
                if let Cell::ValueOvfl(c) = vcell {
                    let _ = block.read(c)?;
                }
            }
        }
        Some(PageType::ColVar) => {
            let mut buf = payload;
            for _ in 0..header.entries {
                let (_, rest) = crate::pack::unpack_uint(buf)?;
                let (vcell, rest) = cell::unpack(rest, unit)?;
                buf = rest;
                if let Cell::ValueOvfl(c) = vcell {
                    let _ = block.read(c)?;
                }
            }
        }
        Some(PageType::ColFix) | Some(PageType::Ovfl) => {}
        _ => return Err(Error::corrupt("verify", cookie.off, "unknown page type")),
    }
    Ok(())
}
