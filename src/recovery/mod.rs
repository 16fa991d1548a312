//! Restart recovery: log analysis, REDO (log-driven or page-driven),
//! and UNDO with compensation, in that order.

pub mod spr;

use std::collections::HashMap;

use log::{debug, info};

use crate::{
    buffer::LatchMode,
    engine::Engine,
    error::DbError,
    transaction::Xct,
    types::DbResult,
    utils::HandyRwLock,
    vol::{PageId, NULL_PID},
    wal::{record::RecordKind, LogRecord, Lsn, FIRST_LSN},
};

#[derive(Debug, Clone, Copy)]
struct XctEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo_nxt: Lsn,
}

#[derive(Debug, Clone, Copy)]
struct DirtyEntry {
    /// First LSN that dirtied the page ("in doubt" until REDO confirms
    /// the disk image).
    rec_lsn: Lsn,
    /// Last LSN that mentions the page; the page-driven REDO target.
    last_lsn: Lsn,
}

struct AnalysisState {
    active: HashMap<u64, XctEntry>,
    dirty: HashMap<PageId, DirtyEntry>,
    mounted_vols: Vec<u32>,
    max_tid: u64,
    redo_start: Lsn,
}

/// Full restart sequence. Called once by `Engine::open`, before any
/// user transaction.
pub fn restart(engine: &Engine) -> DbResult {
    let state = log_analysis(engine)?;
    // the allocation bitmap and store table were last flushed by the
    // master checkpoint; anything since replays through their caches,
    // dirty pages or not
    redo_metadata(engine, analysis_start(engine))?;
    if state.dirty.is_empty() && state.active.is_empty() {
        info!("restart: log is clean, nothing to recover");
        engine.set_next_tid(state.max_tid + 1);
        return Ok(());
    }
    info!(
        "restart: {} in-doubt pages, {} loser transactions, redo from {}",
        state.dirty.len(),
        state.active.len(),
        state.redo_start
    );

    if engine.options().page_driven_redo {
        redo_page_pass(engine, &state)?;
    } else {
        redo_log_pass(engine, &state)?;
    }
    undo_pass(engine, &state)?;
    engine.set_next_tid(state.max_tid + 1);
    info!("restart complete");
    Ok(())
}

// ----------------------------------------------------------------------
// pass 1: log analysis
// ----------------------------------------------------------------------

/// Where scans begin: the last complete checkpoint, or the log's start.
fn analysis_start(engine: &Engine) -> Lsn {
    let master = engine.wal().master_lsn();
    if master.is_null() {
        FIRST_LSN
    } else {
        master
    }
}

fn log_analysis(engine: &Engine) -> Result<AnalysisState, DbError> {
    let wal = engine.wal();
    let start = analysis_start(engine);
    debug!("analysis scanning from {}", start);

    let mut state = AnalysisState {
        active: HashMap::new(),
        dirty: HashMap::new(),
        mounted_vols: vec![],
        max_tid: 0,
        redo_start: Lsn::NULL,
    };

    for (lsn, rec) in wal.scan_from(start) {
        match rec.kind {
            RecordKind::ChkptBfTab => {
                for (pid, rec_lsn, page_lsn) in rec.decode_bf_tab().entries {
                    state.dirty.entry(pid).or_insert(DirtyEntry {
                        rec_lsn,
                        last_lsn: page_lsn,
                    });
                }
            }
            RecordKind::ChkptXctTab => {
                for (tid, last, undo, first) in rec.decode_xct_tab().entries {
                    state.max_tid = state.max_tid.max(tid);
                    state.active.entry(tid).or_insert(XctEntry {
                        first_lsn: first,
                        last_lsn: last,
                        undo_nxt: undo,
                    });
                }
            }
            RecordKind::XctEnd => {
                state.active.remove(&rec.tid);
            }
            RecordKind::MountVol => {
                state.mounted_vols.push(rec.store);
            }
            RecordKind::DismountVol => {
                state.mounted_vols.retain(|&v| v != rec.store);
            }
            _ => {}
        }

        // transaction chains
        if !rec.is_ssx() && rec.tid != 0 && rec.kind != RecordKind::XctEnd {
            state.max_tid = state.max_tid.max(rec.tid);
            let entry = state.active.entry(rec.tid).or_insert(XctEntry {
                first_lsn: lsn,
                last_lsn: Lsn::NULL,
                undo_nxt: Lsn::NULL,
            });
            entry.last_lsn = lsn;
            if rec.is_cpsn() {
                entry.undo_nxt = rec.undo_nxt();
            } else if rec.is_undo() {
                entry.undo_nxt = lsn;
            }
        }

        // dirty-page table
        if is_page_redo(&rec) {
            note_dirty(&mut state.dirty, rec.pid, lsn);
            if rec.is_multi_page() {
                note_dirty(&mut state.dirty, rec.page2_pid, lsn);
            }
        }
    }

    state.redo_start = state
        .dirty
        .values()
        .map(|e| e.rec_lsn)
        .min()
        .unwrap_or_else(|| wal.curr_lsn());
    debug!(
        "analysis: {} volumes in the mount table",
        state.mounted_vols.len()
    );
    Ok(state)
}

/// REDO records that target a real data page (allocation bitmap and
/// store-table records replay through their caches instead).
fn is_page_redo(rec: &LogRecord) -> bool {
    rec.is_redo()
        && rec.pid != NULL_PID
        && !matches!(
            rec.kind,
            RecordKind::AllocPage
                | RecordKind::AllocConsecutivePages
                | RecordKind::DeallocPage
                | RecordKind::StoreOperation
        )
}

fn note_dirty(dirty: &mut HashMap<PageId, DirtyEntry>, pid: PageId, lsn: Lsn) {
    let entry = dirty.entry(pid).or_insert(DirtyEntry {
        rec_lsn: lsn,
        last_lsn: lsn,
    });
    entry.last_lsn = lsn;
}

// ----------------------------------------------------------------------
// pass 2: REDO
// ----------------------------------------------------------------------

/// Replay allocation and store-table records; both REDO modes need
/// this before touching pages.
fn redo_metadata(engine: &Engine, from: Lsn) -> DbResult {
    for (_, rec) in engine.wal().scan_from(from) {
        match rec.kind {
            RecordKind::AllocPage | RecordKind::AllocConsecutivePages => {
                let count = rec.decode_alloc().count;
                engine
                    .alloc()
                    .lock()
                    .unwrap()
                    .apply_alloc(rec.pid.page_no, count);
            }
            RecordKind::DeallocPage => {
                engine.alloc().lock().unwrap().apply_dealloc(rec.pid.page_no);
            }
            RecordKind::StoreOperation => {
                let op = rec.decode_store_op();
                let mut stores = engine.stores().wl();
                stores.apply(rec.store, op);
                if let crate::vol::store_table::StoreOp::SetRoot { root, .. } = op {
                    if root != 0 {
                        engine
                            .pool()
                            .register_store_root(PageId::new(engine.vid(), root));
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn redo_log_pass(engine: &Engine, state: &AnalysisState) -> DbResult {
    let mut redone = 0usize;
    for (_, rec) in engine.wal().scan_from(state.redo_start) {
        if !is_page_redo(&rec) {
            continue;
        }
        redone += redo_one(engine, &rec, rec.pid)? as usize;
        if rec.is_multi_page() {
            redone += redo_one(engine, &rec, rec.page2_pid)? as usize;
        }
    }
    debug!("log-driven REDO applied {} record-page pairs", redone);
    Ok(())
}

/// Apply one record to one of its target pages, if the page has not
/// seen it yet.
fn redo_one(engine: &Engine, rec: &LogRecord, target: PageId) -> Result<bool, DbError> {
    let pool = engine.pool();
    let mut guard = if !pool.is_resident(target) && spr::formats_page_pub(rec, target) {
        // the record rebuilds the page from nothing; skip the read
        pool.fix_virgin(target)?
    } else {
        pool.fix(target, LatchMode::X, false)?
    };
    guard.set_in_doubt(true);
    let applied = if guard.page().page_lsn() < rec.lsn {
        rec.redo(target, guard.page_mut());
        guard.page_mut().set_page_lsn(rec.lsn);
        guard.mark_dirty();
        true
    } else {
        false
    };
    guard.set_in_doubt(false);
    Ok(applied)
}

/// Page-driven REDO: each in-doubt page is brought to its last logged
/// LSN by single-page recovery over its log chain.
fn redo_page_pass(engine: &Engine, state: &AnalysisState) -> DbResult {
    let mut pids: Vec<_> = state.dirty.iter().collect();
    pids.sort_by_key(|(pid, _)| **pid);
    for (pid, entry) in pids {
        let mut guard = engine.pool().fix(*pid, LatchMode::X, false)?;
        guard.set_in_doubt(true);
        let before = guard.page().page_lsn();
        // the tailed variant also covers updates a fuzzy checkpoint's
        // busy-frame entries understated
        spr::recover_single_page_to_current(engine.wal(), guard.page_mut(), *pid, entry.last_lsn)?;
        if guard.page().page_lsn() > before {
            guard.mark_dirty();
        }
        guard.set_in_doubt(false);
    }
    debug!("page-driven REDO recovered {} pages", state.dirty.len());
    Ok(())
}

// ----------------------------------------------------------------------
// pass 3: UNDO
// ----------------------------------------------------------------------

fn undo_pass(engine: &Engine, state: &AnalysisState) -> DbResult {
    for (&tid, entry) in &state.active {
        info!(
            "rolling back loser transaction {} (undo from {})",
            tid, entry.undo_nxt
        );
        let xct = Xct::resurrect(
            engine.clone(),
            tid,
            entry.first_lsn,
            entry.last_lsn,
            entry.undo_nxt,
        );
        xct.abort()?;
    }
    Ok(())
}
