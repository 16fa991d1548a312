//! Single-page recovery: rebuild one page by replaying its per-page log
//! chain, without touching any other page.
//!
//! Every log record carries the previous LSN of each page it mentions
//! (`page_prv`, and `page2_prv` for multi-page records), so the chain
//! can be walked backward from a known upper bound (the parent's EMLSN,
//! or the end of the log) down to either the page's last good LSN or a
//! `page_img_format` record that reconstructs it from nothing.
//!
//! All multi-page records are self-contained: either side can be redone
//! without the peer page, so the walk never has to branch.

use log::{info, warn};

use crate::{
    error::DbError,
    types::DbResult,
    vol::{PageBuf, PageId},
    wal::{record::RecordKind, LogManager, LogRecord, Lsn, FIRST_LSN},
};

/// Recover `page` (holding the possibly-corrupt on-disk image of `pid`)
/// up to `emlsn`. On success the page verifies and carries the LSN of
/// the last applied record.
pub fn recover_single_page(
    wal: &LogManager,
    page: &mut PageBuf,
    pid: PageId,
    emlsn: Lsn,
) -> DbResult {
    // a torn page's own header cannot be trusted
    let cur = if page.checksum_ok() && page.pid() == pid {
        page.page_lsn()
    } else {
        Lsn::NULL
    };

    if emlsn.is_null() {
        return recover_by_scan(wal, page, pid, cur);
    }
    if !cur.is_null() && cur >= emlsn {
        // already at or past the target; nothing to replay
        return Ok(());
    }

    info!("SPR on page {}: current {}, target {}", pid, cur, emlsn);

    // walk backward collecting the chain
    let mut chain: Vec<LogRecord> = Vec::new();
    let mut at = emlsn;
    loop {
        let rec = wal.read_record(at)?.ok_or_else(|| {
            DbError::storage(&format!("log truncated at {}; page {} unrecoverable", at, pid))
        })?;
        if !rec.mentions(pid) {
            return Err(DbError::storage(&format!(
                "page-lsn chain of {} broken at {} ({:?})",
                pid, at, rec.kind
            )));
        }
        let prv = rec.prev_lsn_for(pid);
        let is_base = formats_page(&rec, pid);
        chain.push(rec);
        if is_base && cur.is_null() {
            // a full-image or self-contained formatting record; the
            // chain below it is not needed when starting from nothing
            break;
        }
        if prv.is_null() || (!cur.is_null() && prv <= cur) {
            break;
        }
        at = prv;
    }

    if cur.is_null() {
        // rebuild from nothing: the oldest collected record must be able
        // to format the page on its own
        let base = chain.last().unwrap();
        if !formats_page(base, pid) {
            return Err(DbError::storage(&format!(
                "page {} chain reaches {} without a formatting record",
                pid, base.lsn
            )));
        }
        for b in page.bytes_mut().iter_mut() {
            *b = 0;
        }
    }

    apply_chain(page, pid, chain)
}

/// The buffer pool's repair entry point. An EMLSN read from a parent
/// slot is only a lower bound: eviction refreshes it, but a page
/// cleaned without eviction can be ahead of its parent's knowledge. So
/// after the bounded chain walk, top up with whatever the log still
/// holds for this page.
pub fn recover_single_page_to_current(
    wal: &LogManager,
    page: &mut PageBuf,
    pid: PageId,
    emlsn_hint: Lsn,
) -> DbResult {
    recover_single_page(wal, page, pid, emlsn_hint)?;
    if emlsn_hint.is_null() {
        // the scan fallback already covered the whole log
        return Ok(());
    }
    apply_tail(wal, page, pid, emlsn_hint)
}

/// Forward pass over `[from, end-of-log)` applying stragglers for the
/// page beyond what the backward chain walk covered.
fn apply_tail(wal: &LogManager, page: &mut PageBuf, pid: PageId, from: Lsn) -> DbResult {
    for (_, rec) in wal.scan_from(from) {
        if rec.is_redo() && rec.mentions(pid) && rec.lsn > page.page_lsn() {
            rec.redo(pid, page);
            page.set_page_lsn(rec.lsn);
        }
    }
    page.update_checksum();
    Ok(())
}

/// Records whose destination-side REDO rebuilds the page without any
/// prior content.
pub(crate) fn formats_page_pub(rec: &LogRecord, pid: PageId) -> bool {
    formats_page(rec, pid)
}

fn formats_page(rec: &LogRecord, pid: PageId) -> bool {
    if rec.pid != pid {
        return false;
    }
    // rebalance REDO rebuilds the destination's records but not its
    // foster pointer, so it cannot serve as a chain base
    matches!(
        rec.kind,
        RecordKind::PageImgFormat | RecordKind::BtreeNorecAlloc | RecordKind::BtreeSplit
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        vol::{PageBuf, PageId},
        wal::{log_page_update, LogManager, LogRecord},
    };

    fn test_wal(name: &str) -> LogManager {
        let dir = std::env::temp_dir().join(format!(
            "foster-spr-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        LogManager::open(dir, 1 << 20).unwrap()
    }

    fn build_page(wal: &LogManager, pid: PageId, updates: usize) -> (PageBuf, Vec<Lsn>) {
        let mut page = PageBuf::new();
        page.btree_format(pid, 1, pid.page_no, 1, b"a", b"z", b"z", None);
        let mut rec = LogRecord::page_img_format(&page);
        log_page_update(wal, &mut rec, &mut page).unwrap();

        let mut lsns = vec![page.page_lsn()];
        for i in 0..updates {
            let key = format!("k{:02}", i).into_bytes();
            let mut rec = LogRecord::btree_ghost_reserve(&page, &key, 8);
            log_page_update(wal, &mut rec, &mut page).unwrap();
            page.reserve_ghost(&key, 8).unwrap();
            lsns.push(page.page_lsn());
        }
        page.update_checksum();
        (page, lsns)
    }

    /// Rebuilding a wrecked page from its chain reproduces the exact
    /// final image.
    #[test]
    fn test_spr_rebuilds_from_nothing() {
        let wal = test_wal("rebuild");
        let pid = PageId::new(1, 42);
        let (page, lsns) = build_page(&wal, pid, 10);

        let mut broken = PageBuf::new();
        for (i, b) in broken.bytes_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        recover_single_page(&wal, &mut broken, pid, *lsns.last().unwrap()).unwrap();
        assert_eq!(broken.bytes(), page.bytes());
    }

    /// SPR to an intermediate LSN equals a forward replay of the chain
    /// prefix, and the tailed variant lands on the final image.
    #[test]
    fn test_spr_matches_chain_replay() {
        let wal = test_wal("midpoint");
        let pid = PageId::new(1, 43);
        let (full, lsns) = build_page(&wal, pid, 10);

        // forward replay up to lsns[4], straight off the log
        let mut expected = PageBuf::new();
        for (_, rec) in wal.scan_from(crate::wal::FIRST_LSN) {
            if rec.is_redo() && rec.mentions(pid) && rec.lsn <= lsns[4] {
                rec.redo(pid, &mut expected);
                expected.set_page_lsn(rec.lsn);
            }
        }
        expected.update_checksum();

        // backward-walking SPR to the same bound
        let mut partial = PageBuf::new();
        recover_single_page(&wal, &mut partial, pid, lsns[4]).unwrap();
        assert_eq!(partial.page_lsn(), lsns[4]);
        assert_eq!(partial.bytes(), expected.bytes());

        // the pool's repair path also picks up the tail past the bound
        recover_single_page_to_current(&wal, &mut partial, pid, lsns[4]).unwrap();
        assert_eq!(partial.bytes(), full.bytes());
    }

    #[test]
    fn test_spr_noop_when_current() {
        let wal = test_wal("noop");
        let pid = PageId::new(1, 44);
        let (mut page, lsns) = build_page(&wal, pid, 5);
        let snapshot = page.bytes().to_vec();
        recover_single_page(&wal, &mut page, pid, lsns[2]).unwrap();
        assert_eq!(page.bytes(), &snapshot[..]);
    }
}

/// Fallback when no EMLSN is known: scan the whole log forward and
/// replay everything that mentions the page.
fn recover_by_scan(wal: &LogManager, page: &mut PageBuf, pid: PageId, cur: Lsn) -> DbResult {
    warn!("SPR on page {} without EMLSN; scanning the log", pid);
    if cur.is_null() {
        for b in page.bytes_mut().iter_mut() {
            *b = 0;
        }
    }
    let mut chain: Vec<LogRecord> = Vec::new();
    for (_, rec) in wal.scan_from(FIRST_LSN) {
        if rec.is_redo() && rec.mentions(pid) && rec.lsn > cur {
            chain.push(rec);
        }
    }
    chain.reverse(); // apply_chain applies in reverse collection order
    apply_chain(page, pid, chain)
}

/// Apply collected records oldest-first (the vector is newest-first).
/// Idempotent: records at or below the page's LSN are skipped.
fn apply_chain(page: &mut PageBuf, pid: PageId, chain: Vec<LogRecord>) -> DbResult {
    for rec in chain.into_iter().rev() {
        if !rec.is_redo() {
            continue;
        }
        if !page.page_lsn().is_null() && page.page_lsn() >= rec.lsn {
            continue;
        }
        rec.redo(pid, page);
        page.set_page_lsn(rec.lsn);
    }
    page.update_checksum();
    if page.pid() != pid {
        return Err(DbError::storage(&format!(
            "SPR produced page {} while recovering {}",
            page.pid(),
            pid
        )));
    }
    Ok(())
}
