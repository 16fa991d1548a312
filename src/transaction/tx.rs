//! Transaction descriptors and rollback.
//!
//! A transaction's log records form a chain through `tid_prv`; the
//! `undo_nxt` cursor walks that chain backward during rollback, hopping
//! over already-compensated stretches via compensation records. UNDO of
//! key-level operations is logical: the inverse operation re-descends
//! the tree instead of latching the original page.

use std::cell::Cell;

use log::{debug, info};

use crate::{
    engine::Engine,
    error::DbError,
    types::DbResult,
    vol::{store_table::StoreTable, PageBuf},
    wal::{record::RecordKind, LogRecord, Lsn},
};

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XctState {
    Active,
    Aborting,
    Committed,
    FreeSpace,
    Prepared,
}

pub struct Xct {
    engine: Engine,
    tid: TransactionId,
    state: Cell<XctState>,
    first_lsn: Cell<Lsn>,
    last_lsn: Cell<Lsn>,
    undo_nxt: Cell<Lsn>,
    ended: Cell<bool>,
}

impl Xct {
    pub(crate) fn new(engine: Engine, tid: TransactionId) -> Self {
        Self {
            engine,
            tid,
            state: Cell::new(XctState::Active),
            first_lsn: Cell::new(Lsn::NULL),
            last_lsn: Cell::new(Lsn::NULL),
            undo_nxt: Cell::new(Lsn::NULL),
            ended: Cell::new(false),
        }
    }

    /// Rebuild a descriptor for an in-flight transaction found by log
    /// analysis.
    pub(crate) fn resurrect(
        engine: Engine,
        tid: TransactionId,
        first_lsn: Lsn,
        last_lsn: Lsn,
        undo_nxt: Lsn,
    ) -> Self {
        let xct = Self::new(engine, tid);
        xct.first_lsn.set(first_lsn);
        xct.last_lsn.set(last_lsn);
        xct.undo_nxt.set(undo_nxt);
        xct
    }

    pub fn tid(&self) -> TransactionId {
        self.tid
    }

    pub fn state(&self) -> XctState {
        self.state.get()
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn.get()
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.get()
    }

    pub fn undo_nxt(&self) -> Lsn {
        self.undo_nxt.get()
    }

    // ------------------------------------------------------------------
    // logging
    // ------------------------------------------------------------------

    fn attach(&self, rec: &mut LogRecord) {
        assert!(!rec.is_ssx(), "system transactions carry no tid");
        rec.tid = self.tid;
        if !rec.is_cpsn() {
            rec.tid_prv = self.last_lsn.get();
        }
    }

    fn note_log(&self, rec: &LogRecord, lsn: Lsn) {
        self.last_lsn.set(lsn);
        if self.first_lsn.get().is_null() {
            self.first_lsn.set(lsn);
        }
        if rec.is_cpsn() {
            self.undo_nxt.set(rec.undo_nxt());
        } else if rec.is_undo() {
            self.undo_nxt.set(lsn);
        }
        self.engine.update_xct_entry(
            self.tid,
            self.last_lsn.get(),
            self.undo_nxt.get(),
            self.first_lsn.get(),
        );
    }

    /// Log a page update under this transaction, maintaining both the
    /// transaction chain and the page's LSN chain.
    pub(crate) fn log_page(&self, rec: &mut LogRecord, page: &mut PageBuf) -> Result<Lsn, DbError> {
        self.attach(rec);
        let lsn = crate::wal::log_page_update(self.engine.wal(), rec, page)?;
        self.note_log(rec, lsn);
        Ok(lsn)
    }

    /// Log a record with no page (status, store operations).
    pub(crate) fn log_plain(&self, rec: &mut LogRecord) -> Result<Lsn, DbError> {
        self.attach(rec);
        let lsn = self.engine.wal().append(rec)?;
        self.note_log(rec, lsn);
        Ok(lsn)
    }

    // ------------------------------------------------------------------
    // public surface
    // ------------------------------------------------------------------

    pub fn create_index(&self) -> Result<crate::vol::StoreId, DbError> {
        self.engine.create_index(self)
    }

    pub fn open_index(&self, store: crate::vol::StoreId) -> Result<crate::engine::Index, DbError> {
        self.engine.open_index(store)
    }

    /// Commit: the end record must be durable before success. If the
    /// flush fails the transaction is aborted, so the call is atomic
    /// either way.
    pub fn commit(self) -> DbResult {
        assert_eq!(self.state.get(), XctState::Active, "commit on ended xct");
        if self.first_lsn.get().is_null() {
            // read-only
            self.finish(XctState::Committed);
            return Ok(());
        }
        let mut rec = LogRecord::xct_end();
        self.attach(&mut rec);
        let lsn = self.engine.wal().append(&mut rec)?;
        match self.engine.wal().flush(lsn) {
            Ok(()) => {
                debug!("xct {} committed at {}", self.tid, lsn);
                self.finish(XctState::Committed);
                Ok(())
            }
            Err(e) => {
                info!("commit flush failed for xct {}; aborting", self.tid);
                self.do_abort()?;
                Err(e)
            }
        }
    }

    pub fn abort(self) -> DbResult {
        self.do_abort()
    }

    fn do_abort(&self) -> DbResult {
        if self.ended.get() {
            return Ok(());
        }
        self.state.set(XctState::Aborting);
        self.rollback(Lsn::NULL)?;

        if !self.first_lsn.get().is_null() {
            let mut rec = LogRecord::xct_abort();
            self.attach(&mut rec);
            let lsn = self.engine.wal().append(&mut rec)?;
            self.note_log(&rec, lsn);
            let mut rec = LogRecord::xct_end();
            self.attach(&mut rec);
            self.engine.wal().append(&mut rec)?;
        }
        debug!("xct {} aborted", self.tid);
        self.finish(XctState::Aborting);
        Ok(())
    }

    fn finish(&self, state: XctState) {
        self.state.set(state);
        self.engine.locks().release_all(self.tid);
        self.engine.end_xct(self.tid);
        self.ended.set(true);
    }

    // ------------------------------------------------------------------
    // rollback
    // ------------------------------------------------------------------

    /// Walk the undo chain back to `stop` (NULL = the whole way),
    /// applying logical inverses and writing compensation records.
    pub(crate) fn rollback(&self, stop: Lsn) -> DbResult {
        let mut cur = self.undo_nxt.get();
        while !cur.is_null() && cur > stop && cur >= self.first_lsn.get() {
            let rec = self
                .engine
                .wal()
                .read_record(cur)?
                .ok_or_else(|| DbError::storage(&format!("undo chain broken at {}", cur)))?;
            assert_eq!(rec.tid, self.tid, "undo chain crossed transactions");

            if rec.is_cpsn() {
                cur = rec.undo_nxt();
                self.undo_nxt.set(cur);
                continue;
            }
            if rec.is_undo() {
                self.apply_undo(&rec)?;
                // the compensation record makes the undo itself
                // re-crash-safe: recovery resumes past both records
                let mut cpsn = LogRecord::compensate(rec.tid_prv);
                cpsn.tid = self.tid;
                let lsn = self.engine.wal().append(&mut cpsn)?;
                self.note_log(&cpsn, lsn);
            }
            cur = rec.tid_prv;
            self.undo_nxt.set(cur);
        }
        Ok(())
    }

    /// Logical UNDO dispatch. Only undoable kinds may arrive here;
    /// anything else is an invariant violation.
    fn apply_undo(&self, rec: &LogRecord) -> DbResult {
        assert!(
            !rec.is_ssx(),
            "UNDO invoked on a single-log system transaction record"
        );
        match rec.kind {
            RecordKind::BtreeInsert | RecordKind::BtreeInsertNonghost => {
                let body = rec.decode_insert();
                let tree = self.engine.btree(rec.store)?;
                tree.remove_as_undo(self, &body.key)
            }
            RecordKind::BtreeUpdate => {
                let body = rec.decode_update();
                let tree = self.engine.btree(rec.store)?;
                tree.update_as_undo(self, &body.key, &body.old_value)
            }
            RecordKind::BtreeOverwrite => {
                let body = rec.decode_overwrite();
                let tree = self.engine.btree(rec.store)?;
                tree.overwrite_as_undo(self, &body.key, body.offset as usize, &body.old_bytes)
            }
            RecordKind::BtreeGhostMark => {
                let body = rec.decode_ghost_mark();
                let tree = self.engine.btree(rec.store)?;
                tree.undo_ghost_mark(self, &body.key, &body.value)
            }
            RecordKind::StoreOperation => {
                let op = rec.decode_store_op();
                match StoreTable::invert(op) {
                    Some(inverse) => self.engine.apply_store_op(Some(self), rec.store, inverse),
                    // content destruction is not undoable
                    None => Ok(()),
                }
            }
            RecordKind::PageSetToBeDeleted => {
                // advisory flag; clearing it needs no log record
                let mut guard =
                    self.engine
                        .pool()
                        .fix(rec.pid, crate::buffer::LatchMode::X, false)?;
                guard
                    .page_mut()
                    .clear_flag(crate::vol::page_flags::TO_BE_DELETED);
                guard.mark_dirty();
                Ok(())
            }
            other => panic!("UNDO on non-undoable record kind {:?}", other),
        }
    }
}

impl Drop for Xct {
    fn drop(&mut self) {
        if !self.ended.get() {
            if let Err(e) = self.do_abort() {
                e.show_backtrace();
            }
        }
    }
}
