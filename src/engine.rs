//! The engine value: volume, log, buffer pool, lock table, and the
//! background cleaner, wired together in a fixed order (volume → log →
//! buffer pool → locks → recovery) and torn down in reverse.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::{debug, info};

use crate::{
    btree::{BTree, Cursor},
    buffer::{BufferPool, Cleaner, EvictPolicy},
    error::DbError,
    transaction::{LockTable, Xct},
    types::DbResult,
    utils::HandyRwLock,
    vol::{
        alloc_cache::AllocCache,
        store_table::{StoreOp, StoreTable},
        PageId, StoreId, Volume, VolumeId,
    },
    wal::{log_page_update, LogManager, LogRecord, Lsn},
};

/// Engine configuration. Besides the typed fields, `set` accepts the
/// classic `sm_*` option names.
#[derive(Debug, Clone)]
pub struct Options {
    /// Buffer-pool frame count. Required; no default is sensible.
    pub buf_pool_frames: usize,
    pub cleaner_threads: usize,
    pub cleaner_interval_ms: u64,
    pub background_flush: bool,
    pub swizzling: bool,
    pub policy: EvictPolicy,
    pub logdir: Option<PathBuf>,
    pub logsize: u32,
    pub lock_timeout_ms: u64,
    /// Volume size in pages when formatting a new volume.
    pub num_pages: u32,
    /// Page-driven REDO (single-page recovery per in-doubt page)
    /// instead of the log-driven scan.
    pub page_driven_redo: bool,
    // fake-latency knobs for testing
    pub read_delay_ms: u64,
    pub write_delay_ms: u64,
}

impl Options {
    pub fn new(buf_pool_frames: usize) -> Self {
        Self {
            buf_pool_frames,
            cleaner_threads: 1,
            cleaner_interval_ms: 250,
            background_flush: true,
            swizzling: false,
            policy: EvictPolicy::Clock,
            logdir: None,
            logsize: 64 << 20,
            lock_timeout_ms: 3000,
            num_pages: 16384,
            page_driven_redo: false,
            read_delay_ms: 0,
            write_delay_ms: 0,
        }
    }

    /// Set an option by its `sm_*` name.
    pub fn set(&mut self, key: &str, value: &str) -> DbResult {
        let parse_usize = |v: &str| {
            v.parse::<usize>()
                .map_err(|_| DbError::internal(&format!("option {}: bad number {:?}", key, v)))
        };
        let parse_bool = |v: &str| matches!(v, "1" | "true" | "yes" | "on");
        match key {
            "sm_bufpoolsize" => self.buf_pool_frames = parse_usize(value)?,
            "sm_num_page_writers" => self.cleaner_threads = parse_usize(value)?,
            "sm_backgroundflush" => self.background_flush = parse_bool(value),
            "sm_logdir" => self.logdir = Some(PathBuf::from(value)),
            "sm_logsize" => self.logsize = parse_usize(value)? as u32,
            "sm_locktablesize" => {
                // the lock table grows on demand; accepted for
                // compatibility
                debug!("sm_locktablesize = {} accepted (table is dynamic)", value);
            }
            "sm_swizzling" => self.swizzling = parse_bool(value),
            "sm_replacement_policy" => {
                self.policy = match value {
                    "clock" => EvictPolicy::Clock,
                    "clock_priority" => EvictPolicy::ClockPriority,
                    "random" => EvictPolicy::Random,
                    other => {
                        return Err(DbError::internal(&format!(
                            "unknown replacement policy {:?}",
                            other
                        )))
                    }
                }
            }
            "sm_archiving" | "sm_archdir" | "sm_restore_segsize" => {
                info!("option {} accepted but archiving is not built in", key);
            }
            other => {
                return Err(DbError::internal(&format!("unrecognized option {:?}", other)));
            }
        }
        Ok(())
    }
}

pub(crate) struct EngineInner {
    options: Options,
    vid: VolumeId,
    volume: Arc<Volume>,
    wal: Arc<LogManager>,
    alloc: Mutex<AllocCache>,
    stores: RwLock<StoreTable>,
    pool: Arc<BufferPool>,
    locks: LockTable,
    cleaner: Mutex<Option<Cleaner>>,
    next_tid: AtomicU64,
    /// (last_lsn, undo_nxt, first_lsn) per active transaction, for
    /// fuzzy checkpoints.
    active_xcts: Mutex<HashMap<u64, (Lsn, Lsn, Lsn)>>,
    stopped: AtomicBool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(cleaner) = self.cleaner.lock().unwrap().take() {
            cleaner.shutdown();
        }
    }
}

/// Handle to one storage engine instance. Cheap to clone; background
/// tasks and transactions hold clones.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Open (creating and formatting on first use) the engine rooted at
    /// `path`. Runs restart recovery before returning.
    pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Engine, DbError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let vol_path = path.join("volume.db");

        let mut volume = if vol_path.exists() {
            Volume::open(&vol_path)?
        } else {
            Volume::format(&vol_path, 1, options.num_pages)?
        };
        volume.read_delay_ms = options.read_delay_ms;
        volume.write_delay_ms = options.write_delay_ms;
        let vid = volume.vid();
        let volume = Arc::new(volume);

        let logdir = options
            .logdir
            .clone()
            .unwrap_or_else(|| path.join("log"));
        let wal = Arc::new(LogManager::open(logdir, options.logsize)?);

        let alloc = AllocCache::load(&volume)?;
        let stores = StoreTable::load(&volume)?;

        let pool = Arc::new(BufferPool::new(
            options.buf_pool_frames,
            Arc::clone(&volume),
            Arc::clone(&wal),
            options.swizzling,
            options.policy,
        ));
        for snum in stores.used_stores() {
            if let Ok(root) = stores.get_store_root(snum, vid) {
                pool.register_store_root(root);
            }
        }

        let locks = LockTable::new(options.lock_timeout_ms);
        let cleaner_threads = options.cleaner_threads;
        let cleaner_interval = options.cleaner_interval_ms;
        let background_flush = options.background_flush;

        let engine = Engine {
            inner: Arc::new(EngineInner {
                options,
                vid,
                volume,
                wal,
                alloc: Mutex::new(alloc),
                stores: RwLock::new(stores),
                pool,
                locks,
                cleaner: Mutex::new(None),
                next_tid: AtomicU64::new(1),
                active_xcts: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
        };

        crate::recovery::restart(&engine)?;

        let mut rec = LogRecord::mount_vol(vid, &vol_path.to_string_lossy());
        engine.wal().append(&mut rec)?;

        if background_flush {
            let cleaner = Cleaner::spawn(
                Arc::clone(&engine.inner.pool),
                cleaner_threads,
                cleaner_interval,
            );
            *engine.inner.cleaner.lock().unwrap() = Some(cleaner);
        }

        engine.checkpoint()?;
        info!("engine open at {:?} (volume {})", path, vid);
        Ok(engine)
    }

    // ------------------------------------------------------------------
    // crate-internal accessors
    // ------------------------------------------------------------------

    pub fn wal(&self) -> &LogManager {
        &self.inner.wal
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn locks(&self) -> &LockTable {
        &self.inner.locks
    }

    pub(crate) fn alloc(&self) -> &Mutex<AllocCache> {
        &self.inner.alloc
    }

    pub(crate) fn stores(&self) -> &RwLock<StoreTable> {
        &self.inner.stores
    }

    pub(crate) fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn vid(&self) -> VolumeId {
        self.inner.vid
    }

    pub(crate) fn set_next_tid(&self, tid: u64) {
        let cur = self.inner.next_tid.load(Ordering::Acquire);
        if tid > cur {
            self.inner.next_tid.store(tid, Ordering::Release);
        }
    }

    pub(crate) fn btree(&self, store: StoreId) -> Result<BTree<'_>, DbError> {
        let root = self.inner.stores.rl().get_store_root(store, self.inner.vid)?;
        Ok(BTree::new(
            &self.inner.pool,
            &self.inner.wal,
            &self.inner.locks,
            &self.inner.alloc,
            store,
            root,
        ))
    }

    pub(crate) fn update_xct_entry(&self, tid: u64, last: Lsn, undo: Lsn, first: Lsn) {
        self.inner
            .active_xcts
            .lock()
            .unwrap()
            .insert(tid, (last, undo, first));
    }

    pub(crate) fn end_xct(&self, tid: u64) {
        self.inner.active_xcts.lock().unwrap().remove(&tid);
    }

    /// Apply a store-table mutation, logged under the transaction.
    pub(crate) fn apply_store_op(
        &self,
        tx: Option<&Xct>,
        store: StoreId,
        op: StoreOp,
    ) -> DbResult {
        if let Some(tx) = tx {
            let mut rec = LogRecord::store_operation(store, op);
            tx.log_plain(&mut rec)?;
        }
        self.inner.stores.wl().apply(store, op);
        Ok(())
    }

    // ------------------------------------------------------------------
    // public surface
    // ------------------------------------------------------------------

    pub fn begin(&self) -> Xct {
        let tid = self.inner.next_tid.fetch_add(1, Ordering::AcqRel);
        self.inner
            .active_xcts
            .lock()
            .unwrap()
            .insert(tid, (Lsn::NULL, Lsn::NULL, Lsn::NULL));
        Xct::new(self.clone(), tid)
    }

    pub(crate) fn create_index(&self, tx: &Xct) -> Result<StoreId, DbError> {
        let snum = self.inner.stores.rl().next_free_store()?;
        self.apply_store_op(Some(tx), snum, StoreOp::CreateStore { flags: 0 })?;

        // allocate and format the root leaf
        let root_pid = {
            let mut alloc = self.inner.alloc.lock().unwrap();
            let page_no = alloc.alloc_page()?;
            let pid = PageId::new(self.inner.vid, page_no);
            let mut rec = LogRecord::alloc_page(pid);
            self.wal().append(&mut rec)?;
            pid
        };
        {
            let mut root = self.inner.pool.fix_virgin(root_pid)?;
            root.page_mut().btree_format(
                root_pid,
                snum,
                root_pid.page_no,
                1,
                b"",
                b"",
                b"",
                None,
            );
            let mut rec = LogRecord::page_img_format(root.page());
            log_page_update(self.wal(), &mut rec, root.page_mut())?;
            root.mark_dirty();
        }
        self.apply_store_op(
            Some(tx),
            snum,
            StoreOp::SetRoot {
                root: root_pid.page_no,
                prev_root: 0,
            },
        )?;
        self.inner.pool.register_store_root(root_pid);
        info!("created index: store {} rooted at {}", snum, root_pid);
        Ok(snum)
    }

    pub(crate) fn open_index(&self, store: StoreId) -> Result<Index, DbError> {
        // existence check
        let _ = self.inner.stores.rl().get(store)?;
        Ok(Index {
            engine: self.clone(),
            store,
        })
    }

    /// Fuzzy checkpoint: dirty-page and transaction tables into the
    /// log, master record advanced. Does not force pages.
    pub fn checkpoint(&self) -> DbResult {
        let mut begin = LogRecord::chkpt_begin();
        let begin_lsn = self.wal().append(&mut begin)?;

        let bf_entries = self.inner.pool.checkpoint_dirty_table();
        let min_rec_lsn = bf_entries
            .iter()
            .map(|(_, rec_lsn, _)| *rec_lsn)
            .min()
            .unwrap_or_else(|| self.wal().curr_lsn());
        let mut rec = LogRecord::chkpt_bf_tab(&crate::wal::record::ChkptBfTabBody {
            entries: bf_entries,
        });
        self.wal().append(&mut rec)?;

        let xct_entries: Vec<(u64, Lsn, Lsn, Lsn)> = self
            .inner
            .active_xcts
            .lock()
            .unwrap()
            .iter()
            .map(|(&tid, &(last, undo, first))| (tid, last, undo, first))
            .collect();
        let min_xct_lsn = xct_entries
            .iter()
            .map(|(_, _, _, first)| *first)
            .filter(|l| !l.is_null())
            .min()
            .unwrap_or_else(|| self.wal().curr_lsn());
        let mut rec = LogRecord::chkpt_xct_tab(&crate::wal::record::ChkptXctTabBody {
            entries: xct_entries,
        });
        self.wal().append(&mut rec)?;

        let mut rec = LogRecord::chkpt_end(&crate::wal::record::ChkptEndBody {
            master: begin_lsn,
            min_rec_lsn,
            min_xct_lsn,
        });
        let end_lsn = self.wal().append(&mut rec)?;
        self.wal().flush(end_lsn)?;
        self.wal().set_master_lsn(begin_lsn)?;

        // metadata pages ride along (their log is durable now)
        self.inner.alloc.lock().unwrap().flush(&self.inner.volume)?;
        self.inner.stores.rl().flush(&self.inner.volume)?;
        debug!("checkpoint at {}", begin_lsn);
        Ok(())
    }

    /// Write every dirty page to disk and fsync the volume.
    pub fn force_all(&self) -> DbResult {
        self.inner.pool.force_all()?;
        self.inner.alloc.lock().unwrap().flush(&self.inner.volume)?;
        self.inner.stores.rl().flush(&self.inner.volume)?;
        self.inner.volume.sync()
    }

    /// Force one volume. This engine mounts a single volume, so the
    /// distinction is the fsync contract, which is honored.
    pub fn force_volume(&self, vid: VolumeId) -> DbResult {
        assert_eq!(vid, self.inner.vid, "force_volume on unmounted volume");
        self.force_all()
    }

    pub fn dismount(&self, vid: VolumeId) -> DbResult {
        assert_eq!(vid, self.inner.vid, "dismount of unmounted volume");
        self.force_all()?;
        let mut rec = LogRecord::dismount_vol(vid);
        self.wal().append(&mut rec)?;
        self.wal().flush_all()
    }

    /// Append a comment record (test instrumentation).
    pub fn log_comment(&self, msg: &str) -> DbResult {
        let mut rec = LogRecord::comment(msg);
        self.wal().append(&mut rec)?;
        Ok(())
    }

    /// Orderly shutdown: checkpoint, stop background tasks, force
    /// pages, dismount. Dropping the engine without calling this
    /// simulates a crash (recovery will run on the next open).
    pub fn shutdown(&self) -> DbResult {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(cleaner) = self.inner.cleaner.lock().unwrap().take() {
            cleaner.shutdown();
        }
        self.checkpoint()?;
        self.dismount(self.inner.vid)?;
        info!("engine shut down");
        Ok(())
    }

    // introspection for tests
    pub fn store_root(&self, store: StoreId) -> Result<PageId, DbError> {
        self.inner.stores.rl().get_store_root(store, self.inner.vid)
    }

    pub fn buffer_dirty_count(&self) -> usize {
        self.inner.pool.dirty_count()
    }

    pub fn buffer_resident_count(&self) -> usize {
        self.inner.pool.resident_count()
    }

    pub fn verify_swizzled_pointers(&self) {
        self.inner.pool.verify_swizzled_pointers()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.wal().durable_lsn()
    }
}

/// Handle to one B-tree index inside a store.
pub struct Index {
    engine: Engine,
    store: StoreId,
}

impl Index {
    pub fn store_id(&self) -> StoreId {
        self.store
    }

    pub fn get(&self, tx: &Xct, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        self.engine.btree(self.store)?.get(tx, key)
    }

    pub fn insert(&self, tx: &Xct, key: &[u8], value: &[u8]) -> DbResult {
        self.engine.btree(self.store)?.insert(tx, key, value)
    }

    pub fn update(&self, tx: &Xct, key: &[u8], value: &[u8]) -> DbResult {
        self.engine.btree(self.store)?.update(tx, key, value)
    }

    pub fn overwrite(&self, tx: &Xct, key: &[u8], offset: usize, bytes: &[u8]) -> DbResult {
        self.engine.btree(self.store)?.overwrite(tx, key, offset, bytes)
    }

    pub fn remove(&self, tx: &Xct, key: &[u8]) -> DbResult {
        self.engine.btree(self.store)?.remove(tx, key)
    }

    /// Scan `[low, high)`; an empty `high` is unbounded.
    pub fn range<'a>(
        &'a self,
        tx: &'a Xct,
        low: &[u8],
        high: &[u8],
    ) -> Result<Cursor<'a>, DbError> {
        let tree = self.engine.btree(self.store)?;
        Ok(Cursor::new(tree, tx, low, high))
    }

    /// Tree-wide invariant check; returns pages visited.
    pub fn verify(&self) -> Result<usize, DbError> {
        self.engine.btree(self.store)?.verify()
    }

    /// Height of the tree (1 = single leaf).
    pub fn height(&self) -> Result<u16, DbError> {
        self.engine.btree(self.store)?.height()
    }

    pub fn defrag(&self) -> DbResult {
        self.engine.btree(self.store)?.defrag_tree()
    }
}
