//! Typed write-ahead log records.
//!
//! Wire format (little-endian, total length 8-byte aligned):
//!
//! ```text
//! 0   len        u16   total record length
//! 2   kind       u8
//! 3   cat        u8    category bit flags
//! 4   store      u32
//! 8   pid        u64   primary page
//! 16  page_prv   u64   previous LSN of the primary page's chain
//! 24  tid        u64   -- absent for single-log system transactions
//! 32  tid_prv    u64   -- absent for single-log system transactions
//! ..  [page2_pid u64, page2_prv u64]   -- multi-page records only
//! ..  payload
//! len-8  lsn     u64   the record's own LSN, echoed for verification
//! ```
//!
//! A system-transaction record reuses the 16 transaction-chain bytes for
//! payload, the same trick the record cap (`3 × page_size`) assumes.

use std::io::{Cursor, Read};

use crate::{
    error::DbError,
    io::{get_u16, get_u64, Decodeable, Encodeable, SmallWriter},
    vol::{page_flags, store_table::StoreOp, PageBuf, PageId, StoreId, NULL_PID},
    wal::lsn::Lsn,
};

pub const HDR_BASE: usize = 24;
pub const HDR_XCT: usize = 16;
pub const MULTI_SUB: usize = 16;
const TRAILER: usize = 8;

/// Category bit flags.
pub mod cat {
    pub const STATUS: u8 = 0x01;
    pub const UNDO: u8 = 0x02;
    pub const REDO: u8 = 0x04;
    pub const MULTI: u8 = 0x08;
    pub const LOGICAL: u8 = 0x10;
    pub const CPSN: u8 = 0x20;
    pub const ROLLBACK: u8 = 0x40;
    pub const SSX: u8 = 0x80;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Comment = 0,
    Skip = 1,
    XctEnd = 2,
    XctAbort = 3,
    Compensate = 4,
    ChkptBegin = 5,
    ChkptEnd = 6,
    ChkptBfTab = 7,
    ChkptXctTab = 8,
    MountVol = 9,
    DismountVol = 10,
    AllocPage = 11,
    AllocConsecutivePages = 12,
    DeallocPage = 13,
    StoreOperation = 14,
    PageImgFormat = 15,
    PageSetToBeDeleted = 16,
    BtreeInsert = 17,
    BtreeInsertNonghost = 18,
    BtreeUpdate = 19,
    BtreeOverwrite = 20,
    BtreeGhostMark = 21,
    BtreeGhostReclaim = 22,
    BtreeGhostReserve = 23,
    BtreeNorecAlloc = 24,
    BtreeSplit = 25,
    BtreeFosterMerge = 26,
    BtreeFosterRebalance = 27,
    BtreeFosterRebalanceNorec = 28,
    BtreeFosterAdopt = 29,
    BtreeFosterDeadopt = 30,
    BtreeCompressPage = 31,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => RecordKind::Comment,
            1 => RecordKind::Skip,
            2 => RecordKind::XctEnd,
            3 => RecordKind::XctAbort,
            4 => RecordKind::Compensate,
            5 => RecordKind::ChkptBegin,
            6 => RecordKind::ChkptEnd,
            7 => RecordKind::ChkptBfTab,
            8 => RecordKind::ChkptXctTab,
            9 => RecordKind::MountVol,
            10 => RecordKind::DismountVol,
            11 => RecordKind::AllocPage,
            12 => RecordKind::AllocConsecutivePages,
            13 => RecordKind::DeallocPage,
            14 => RecordKind::StoreOperation,
            15 => RecordKind::PageImgFormat,
            16 => RecordKind::PageSetToBeDeleted,
            17 => RecordKind::BtreeInsert,
            18 => RecordKind::BtreeInsertNonghost,
            19 => RecordKind::BtreeUpdate,
            20 => RecordKind::BtreeOverwrite,
            21 => RecordKind::BtreeGhostMark,
            22 => RecordKind::BtreeGhostReclaim,
            23 => RecordKind::BtreeGhostReserve,
            24 => RecordKind::BtreeNorecAlloc,
            25 => RecordKind::BtreeSplit,
            26 => RecordKind::BtreeFosterMerge,
            27 => RecordKind::BtreeFosterRebalance,
            28 => RecordKind::BtreeFosterRebalanceNorec,
            29 => RecordKind::BtreeFosterAdopt,
            30 => RecordKind::BtreeFosterDeadopt,
            31 => RecordKind::BtreeCompressPage,
            _ => panic!("corrupt log record kind: {}", value),
        }
    }

    /// The fixed category of each record kind.
    pub fn category(&self) -> u8 {
        use cat::*;
        match self {
            RecordKind::Comment
            | RecordKind::Skip
            | RecordKind::XctEnd
            | RecordKind::XctAbort
            | RecordKind::ChkptBegin
            | RecordKind::ChkptEnd
            | RecordKind::ChkptBfTab
            | RecordKind::ChkptXctTab
            | RecordKind::MountVol
            | RecordKind::DismountVol => STATUS,
            RecordKind::Compensate => STATUS | CPSN,
            RecordKind::AllocPage
            | RecordKind::AllocConsecutivePages
            | RecordKind::DeallocPage
            | RecordKind::PageImgFormat
            | RecordKind::BtreeGhostReclaim
            | RecordKind::BtreeGhostReserve
            | RecordKind::BtreeCompressPage => REDO | SSX,
            RecordKind::StoreOperation | RecordKind::PageSetToBeDeleted => REDO | UNDO,
            RecordKind::BtreeInsert
            | RecordKind::BtreeInsertNonghost
            | RecordKind::BtreeUpdate
            | RecordKind::BtreeOverwrite
            | RecordKind::BtreeGhostMark => REDO | UNDO | LOGICAL,
            RecordKind::BtreeNorecAlloc
            | RecordKind::BtreeSplit
            | RecordKind::BtreeFosterMerge
            | RecordKind::BtreeFosterRebalance
            | RecordKind::BtreeFosterRebalanceNorec
            | RecordKind::BtreeFosterAdopt
            | RecordKind::BtreeFosterDeadopt => REDO | SSX | MULTI,
        }
    }
}

pub struct LogRecord {
    pub kind: RecordKind,
    pub cat: u8,
    pub store: StoreId,
    pub pid: PageId,
    pub page_prv: Lsn,
    pub tid: u64,
    pub tid_prv: Lsn,
    /// Secondary page of a multi-page record ("page2" is the source
    /// side of the operation, "pid" the destination).
    pub page2_pid: PageId,
    pub page2_prv: Lsn,
    pub payload: Vec<u8>,
    /// Stamped at append time.
    pub lsn: Lsn,
}

impl LogRecord {
    pub fn new(kind: RecordKind, pid: PageId, payload: Vec<u8>) -> Self {
        Self {
            kind,
            cat: kind.category(),
            store: 0,
            pid,
            page_prv: Lsn::NULL,
            tid: 0,
            tid_prv: Lsn::NULL,
            page2_pid: NULL_PID,
            page2_prv: Lsn::NULL,
            payload,
            lsn: Lsn::NULL,
        }
    }

    pub fn new_multi(kind: RecordKind, pid: PageId, page2_pid: PageId, payload: Vec<u8>) -> Self {
        let mut rec = Self::new(kind, pid, payload);
        assert!(rec.is_multi_page(), "{:?} is not a multi-page kind", kind);
        rec.page2_pid = page2_pid;
        rec
    }

    // --- category predicates ---

    pub fn is_redo(&self) -> bool {
        self.cat & cat::REDO != 0
    }

    pub fn is_undo(&self) -> bool {
        self.cat & cat::UNDO != 0
    }

    pub fn is_logical(&self) -> bool {
        self.cat & cat::LOGICAL != 0
    }

    pub fn is_ssx(&self) -> bool {
        self.cat & cat::SSX != 0
    }

    pub fn is_multi_page(&self) -> bool {
        self.cat & cat::MULTI != 0
    }

    pub fn is_cpsn(&self) -> bool {
        self.cat & cat::CPSN != 0
    }

    pub fn is_rollback(&self) -> bool {
        self.cat & cat::ROLLBACK != 0
    }

    pub fn is_page_update(&self) -> bool {
        self.is_redo() && !self.is_cpsn() && !self.pid.is_null()
    }

    /// Turn this record into a compensating one: it can no longer be
    /// undone, and its transaction-chain pointer becomes the undo-next
    /// hop.
    pub fn set_clr(&mut self, undo_nxt: Lsn) {
        assert!(!self.is_ssx(), "UNDO of a single-log system transaction");
        self.cat &= !cat::UNDO;
        self.cat |= cat::CPSN;
        self.tid_prv = undo_nxt;
    }

    pub fn set_rollback(&mut self) {
        self.cat |= cat::ROLLBACK;
    }

    /// For compensation records, the transaction-chain field doubles as
    /// undo-next.
    pub fn undo_nxt(&self) -> Lsn {
        self.tid_prv
    }

    // --- size and wire format ---

    pub fn header_size(&self) -> usize {
        if self.is_ssx() {
            HDR_BASE
        } else {
            HDR_BASE + HDR_XCT
        }
    }

    pub fn encoded_len(&self) -> usize {
        let raw = self.header_size()
            + if self.is_multi_page() { MULTI_SUB } else { 0 }
            + self.payload.len()
            + TRAILER;
        (raw + 7) & !7
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut buf = vec![0u8; len];
        buf[0..2].copy_from_slice(&(len as u16).to_le_bytes());
        buf[2] = self.kind as u8;
        buf[3] = self.cat;
        buf[4..8].copy_from_slice(&self.store.to_le_bytes());
        buf[8..16].copy_from_slice(&self.pid.to_u64().to_le_bytes());
        buf[16..24].copy_from_slice(&self.page_prv.to_u64().to_le_bytes());
        let mut off = HDR_BASE;
        if !self.is_ssx() {
            buf[24..32].copy_from_slice(&self.tid.to_le_bytes());
            buf[32..40].copy_from_slice(&self.tid_prv.to_u64().to_le_bytes());
            off += HDR_XCT;
        }
        if self.is_multi_page() {
            buf[off..off + 8].copy_from_slice(&self.page2_pid.to_u64().to_le_bytes());
            buf[off + 8..off + 16].copy_from_slice(&self.page2_prv.to_u64().to_le_bytes());
            off += MULTI_SUB;
        }
        buf[off..off + self.payload.len()].copy_from_slice(&self.payload);
        buf[len - TRAILER..].copy_from_slice(&self.lsn.to_u64().to_le_bytes());
        buf
    }

    /// Decode a record from `buf` (which must hold the full record).
    /// The trailing LSN echo is checked against `at`.
    pub fn decode(buf: &[u8], at: Lsn) -> Result<LogRecord, DbError> {
        if buf.len() < HDR_BASE + TRAILER {
            return Err(DbError::new(
                crate::error::ErrorKind::Integrity,
                "log record shorter than header",
            ));
        }
        let len = get_u16(buf, 0) as usize;
        if len > buf.len() || len % 8 != 0 {
            return Err(DbError::new(
                crate::error::ErrorKind::Integrity,
                &format!("log record length {} corrupt", len),
            ));
        }
        let kind = RecordKind::from_u8(buf[2]);
        let cat_bits = buf[3];
        let mut rec = LogRecord::new(kind, PageId::from_u64(get_u64(buf, 8)), vec![]);
        rec.cat = cat_bits;
        rec.store = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        rec.page_prv = Lsn::from_u64(get_u64(buf, 16));
        let mut off = HDR_BASE;
        if !rec.is_ssx() {
            rec.tid = get_u64(buf, 24);
            rec.tid_prv = Lsn::from_u64(get_u64(buf, 32));
            off += HDR_XCT;
        }
        if rec.is_multi_page() {
            rec.page2_pid = PageId::from_u64(get_u64(buf, off));
            rec.page2_prv = Lsn::from_u64(get_u64(buf, off + 8));
            off += MULTI_SUB;
        }
        rec.payload = buf[off..len - TRAILER].to_vec();
        rec.lsn = Lsn::from_u64(get_u64(buf, len - TRAILER));
        if rec.lsn != at {
            return Err(DbError::new(
                crate::error::ErrorKind::Integrity,
                &format!("log record at {} echoes lsn {}", at, rec.lsn),
            ));
        }
        Ok(rec)
    }

    /// The LSN chain hop for the given page: `page_prv` for the primary
    /// page, `page2_prv` for the secondary.
    pub fn prev_lsn_for(&self, pid: PageId) -> Lsn {
        if pid == self.pid {
            self.page_prv
        } else if self.is_multi_page() && pid == self.page2_pid {
            self.page2_prv
        } else {
            panic!("record {:?} at {} does not mention page {}", self.kind, self.lsn, pid);
        }
    }

    pub fn mentions(&self, pid: PageId) -> bool {
        pid == self.pid || (self.is_multi_page() && pid == self.page2_pid)
    }

    fn payload_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.payload)
    }

    // ------------------------------------------------------------------
    // REDO
    // ------------------------------------------------------------------

    /// Apply this record's effect to `page`, which the caller has
    /// identified as `target`. Idempotence is enforced by the caller
    /// comparing the page LSN against `self.lsn` beforehand.
    pub fn redo(&self, target: PageId, page: &mut PageBuf) {
        assert!(self.is_redo(), "REDO on non-redoable {:?}", self.kind);
        let mut r = self.payload_reader();
        match self.kind {
            RecordKind::PageImgFormat => {
                page.bytes_mut().copy_from_slice(&self.payload);
            }
            RecordKind::PageSetToBeDeleted => {
                page.set_flag(page_flags::TO_BE_DELETED);
            }
            RecordKind::BtreeInsert => {
                let body = InsertBody::decode_from(&mut r);
                match page.search(&body.key) {
                    Ok(idx) => {
                        if page.is_ghost(idx) {
                            page.set_user_value(idx, &body.value)
                                .expect("REDO insert must fit");
                            page.unmark_ghost(idx);
                        }
                    }
                    Err(_) => {
                        page.insert_user(&body.key, &body.value, false)
                            .expect("REDO insert must fit");
                    }
                }
            }
            RecordKind::BtreeInsertNonghost => {
                let body = InsertBody::decode_from(&mut r);
                if page.search(&body.key).is_err() {
                    page.insert_user(&body.key, &body.value, false)
                        .expect("REDO insert must fit");
                }
            }
            RecordKind::BtreeUpdate => {
                let body = UpdateBody::decode_from(&mut r);
                let idx = page
                    .search(&body.key)
                    .unwrap_or_else(|_| panic!("REDO update: key missing on {}", target));
                page.set_user_value(idx, &body.new_value)
                    .expect("REDO update must fit");
            }
            RecordKind::BtreeOverwrite => {
                let body = OverwriteBody::decode_from(&mut r);
                let idx = page
                    .search(&body.key)
                    .unwrap_or_else(|_| panic!("REDO overwrite: key missing on {}", target));
                page.overwrite_user_value(idx, body.offset as usize, &body.new_bytes);
            }
            RecordKind::BtreeGhostMark => {
                let body = GhostMarkBody::decode_from(&mut r);
                if let Ok(idx) = page.search(&body.key) {
                    if !page.is_ghost(idx) {
                        page.mark_ghost(idx);
                    }
                }
            }
            RecordKind::BtreeGhostReserve => {
                let body = GhostReserveBody::decode_from(&mut r);
                if page.search(&body.key).is_err() {
                    page.reserve_ghost(&body.key, body.payload_len as usize)
                        .expect("REDO ghost reserve must fit");
                }
            }
            RecordKind::BtreeGhostReclaim => {
                let body = GhostReclaimBody::decode_from(&mut r);
                page.reclaim_ghosts(&body.keys);
            }
            RecordKind::BtreeCompressPage => {
                let body = CompressBody::decode_from(&mut r);
                page.compress(&body.low, &body.high, &body.chain_high);
            }
            RecordKind::BtreeNorecAlloc => {
                let body = NorecAllocBody::decode_from(&mut r);
                if target == self.pid {
                    // destination: the freshly allocated empty foster
                    // child, inheriting the source's old foster pointer
                    let foster = if body.foster == 0 {
                        None
                    } else {
                        Some(PageId::from_u64(body.foster))
                    };
                    page.btree_format(
                        self.pid,
                        self.store,
                        body.btree_root,
                        body.level,
                        &body.fence_low,
                        &body.fence_high,
                        &body.chain_high,
                        foster,
                    );
                    page.set_foster_emlsn(Lsn::from_u64(body.foster_emlsn));
                } else {
                    // source: install the foster pointer
                    page.set_foster_child_pid(Some(self.pid));
                    page.set_foster_emlsn(self.lsn);
                }
            }
            RecordKind::BtreeSplit => {
                let body = SplitBody::decode_from(&mut r);
                if target == self.pid {
                    page.bytes_mut().copy_from_slice(&body.page_image);
                } else {
                    // source: shed the moved records, then bound the page
                    // at the split key and chain to the new child
                    let keep = page.user_slot_count() - body.move_count as usize;
                    let records = page.extract_records(0, keep);
                    let low = page.low_fence().to_vec();
                    page.rebuild(&low, &body.new_high_fence, &body.new_chain_high, &records);
                    page.set_foster_child_pid(Some(self.pid));
                    page.set_foster_emlsn(self.lsn);
                }
            }
            RecordKind::BtreeFosterRebalance => {
                let body = RebalanceBody::decode_from(&mut r);
                if target == self.pid {
                    // destination is reconstructed entirely from the record
                    let foster = page.foster_child();
                    page.rebuild(
                        &body.boundary,
                        &body.dest_high,
                        &body.chain_high,
                        &body.records,
                    );
                    page.set_foster_child_pid(foster);
                } else {
                    let mut keep = page.user_slot_count();
                    while keep > 0 && page.user_key(keep - 1).as_slice() >= body.boundary.as_slice()
                    {
                        keep -= 1;
                    }
                    let records = page.extract_records(0, keep);
                    let low = page.low_fence().to_vec();
                    let chain = page.chain_high_fence().to_vec();
                    page.rebuild(&low, &body.boundary, &chain, &records);
                }
            }
            RecordKind::BtreeFosterRebalanceNorec => {
                let body = RebalanceNorecBody::decode_from(&mut r);
                if target == self.pid {
                    let high = page.high_fence().to_vec();
                    let chain = page.chain_high_fence().to_vec();
                    page.compress(&body.new_fence, &high, &chain);
                } else {
                    let low = page.low_fence().to_vec();
                    let chain = page.chain_high_fence().to_vec();
                    page.compress(&low, &body.new_fence, &chain);
                }
            }
            RecordKind::BtreeFosterMerge => {
                let body = MergeBody::decode_from(&mut r);
                if target == self.pid {
                    // destination absorbs the source's records
                    let mut records = page.extract_all_records();
                    records.extend(body.records.iter().cloned());
                    records.sort_by(|a, b| a.key.cmp(&b.key));
                    let low = page.low_fence().to_vec();
                    page.rebuild(&low, &body.new_high, &body.new_chain_high, &records);
                    let foster = if body.new_foster == 0 {
                        None
                    } else {
                        Some(PageId::from_u64(body.new_foster))
                    };
                    page.set_foster_child_pid(foster);
                    page.set_foster_emlsn(Lsn::from_u64(body.new_foster_emlsn));
                } else {
                    // source is empty after the merge and pending delete
                    page.set_flag(page_flags::TO_BE_DELETED);
                }
            }
            RecordKind::BtreeFosterAdopt => {
                let body = AdoptBody::decode_from(&mut r);
                if target == self.pid {
                    // real parent gains the child entry
                    if page.search(&body.child_key).is_err() {
                        let value = PageBuf::branch_value(body.child_pid, body.child_emlsn);
                        page.insert_user(&body.child_key, &value, false)
                            .expect("REDO adopt must fit");
                    }
                } else {
                    // foster parent sheds the pointer; its chain ends at
                    // its own high fence again
                    let low = page.low_fence().to_vec();
                    let high = page.high_fence().to_vec();
                    page.compress(&low, &high, &high);
                    page.set_foster_child_pid(None);
                    page.set_foster_emlsn(Lsn::NULL);
                }
            }
            RecordKind::BtreeFosterDeadopt => {
                let body = DeadoptBody::decode_from(&mut r);
                if target == self.pid {
                    // left sibling becomes foster parent of the child
                    let low = page.low_fence().to_vec();
                    let high = page.high_fence().to_vec();
                    page.compress(&low, &high, &body.new_chain_high);
                    page.set_foster_child_pid(Some(body.child_pid));
                    page.set_foster_emlsn(body.child_emlsn);
                } else {
                    // real parent loses the child entry
                    if let Ok(idx) = page.search(&body.child_key) {
                        page.remove_user_slot(idx);
                    }
                }
            }
            other => panic!("redo() on {:?}, which has no page REDO", other),
        }
    }

    // --- payload decoding for interpretation elsewhere ---

    pub fn decode_insert(&self) -> InsertBody {
        InsertBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_update(&self) -> UpdateBody {
        UpdateBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_overwrite(&self) -> OverwriteBody {
        OverwriteBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_ghost_mark(&self) -> GhostMarkBody {
        GhostMarkBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_alloc(&self) -> AllocBody {
        AllocBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_store_op(&self) -> StoreOp {
        StoreOp::decode_from(&mut self.payload_reader())
    }

    pub fn decode_chkpt_end(&self) -> ChkptEndBody {
        ChkptEndBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_bf_tab(&self) -> ChkptBfTabBody {
        ChkptBfTabBody::decode_from(&mut self.payload_reader())
    }

    pub fn decode_xct_tab(&self) -> ChkptXctTabBody {
        ChkptXctTabBody::decode_from(&mut self.payload_reader())
    }

    // ------------------------------------------------------------------
    // constructors for each kind
    // ------------------------------------------------------------------

    pub fn comment(msg: &str) -> LogRecord {
        LogRecord::new(RecordKind::Comment, NULL_PID, msg.as_bytes().to_vec())
    }

    pub fn skip() -> LogRecord {
        LogRecord::new(RecordKind::Skip, NULL_PID, vec![])
    }

    pub fn xct_end() -> LogRecord {
        LogRecord::new(RecordKind::XctEnd, NULL_PID, vec![])
    }

    pub fn xct_abort() -> LogRecord {
        LogRecord::new(RecordKind::XctAbort, NULL_PID, vec![])
    }

    pub fn compensate(undo_nxt: Lsn) -> LogRecord {
        let mut rec = LogRecord::new(RecordKind::Compensate, NULL_PID, vec![]);
        rec.cat |= cat::CPSN;
        rec.tid_prv = undo_nxt;
        rec
    }

    pub fn chkpt_begin() -> LogRecord {
        LogRecord::new(RecordKind::ChkptBegin, NULL_PID, vec![])
    }

    pub fn chkpt_end(body: &ChkptEndBody) -> LogRecord {
        LogRecord::new(RecordKind::ChkptEnd, NULL_PID, body.encode())
    }

    pub fn chkpt_bf_tab(body: &ChkptBfTabBody) -> LogRecord {
        LogRecord::new(RecordKind::ChkptBfTab, NULL_PID, body.encode())
    }

    pub fn chkpt_xct_tab(body: &ChkptXctTabBody) -> LogRecord {
        LogRecord::new(RecordKind::ChkptXctTab, NULL_PID, body.encode())
    }

    pub fn mount_vol(vid: u32, path: &str) -> LogRecord {
        let mut w = SmallWriter::new();
        w.write(&vid);
        w.write(&path.as_bytes().to_vec());
        let mut rec = LogRecord::new(RecordKind::MountVol, NULL_PID, w.to_bytes());
        // the store field doubles as the volume id for mount records
        rec.store = vid;
        rec
    }

    pub fn dismount_vol(vid: u32) -> LogRecord {
        let mut rec = LogRecord::new(RecordKind::DismountVol, NULL_PID, vid.encode());
        rec.store = vid;
        rec
    }

    pub fn alloc_page(pid: PageId) -> LogRecord {
        LogRecord::new(RecordKind::AllocPage, pid, AllocBody { count: 1 }.encode())
    }

    pub fn alloc_consecutive_pages(pid: PageId, count: u32) -> LogRecord {
        LogRecord::new(
            RecordKind::AllocConsecutivePages,
            pid,
            AllocBody { count }.encode(),
        )
    }

    pub fn dealloc_page(pid: PageId) -> LogRecord {
        LogRecord::new(RecordKind::DeallocPage, pid, AllocBody { count: 1 }.encode())
    }

    pub fn store_operation(store: StoreId, op: StoreOp) -> LogRecord {
        let mut rec = LogRecord::new(RecordKind::StoreOperation, NULL_PID, op.encode());
        rec.store = store;
        rec
    }

    pub fn page_img_format(page: &PageBuf) -> LogRecord {
        let mut rec = LogRecord::new(
            RecordKind::PageImgFormat,
            page.pid(),
            page.bytes().to_vec(),
        );
        rec.store = page.store();
        rec
    }

    pub fn page_set_to_be_deleted(pid: PageId) -> LogRecord {
        LogRecord::new(RecordKind::PageSetToBeDeleted, pid, vec![])
    }

    pub fn btree_insert(page: &PageBuf, key: &[u8], value: &[u8]) -> LogRecord {
        let body = InsertBody {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeInsert, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_insert_nonghost(page: &PageBuf, key: &[u8], value: &[u8]) -> LogRecord {
        let body = InsertBody {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeInsertNonghost, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_update(page: &PageBuf, key: &[u8], old: &[u8], new: &[u8]) -> LogRecord {
        let body = UpdateBody {
            key: key.to_vec(),
            old_value: old.to_vec(),
            new_value: new.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeUpdate, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_overwrite(
        page: &PageBuf,
        key: &[u8],
        offset: usize,
        old: &[u8],
        new: &[u8],
    ) -> LogRecord {
        let body = OverwriteBody {
            key: key.to_vec(),
            offset: offset as u16,
            old_bytes: old.to_vec(),
            new_bytes: new.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeOverwrite, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_ghost_mark(page: &PageBuf, key: &[u8], value: &[u8]) -> LogRecord {
        let body = GhostMarkBody {
            key: key.to_vec(),
            value: value.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeGhostMark, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_ghost_reserve(page: &PageBuf, key: &[u8], payload_len: usize) -> LogRecord {
        let body = GhostReserveBody {
            key: key.to_vec(),
            payload_len: payload_len as u16,
        };
        let mut rec = LogRecord::new(RecordKind::BtreeGhostReserve, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_ghost_reclaim(page: &PageBuf, keys: Vec<Vec<u8>>) -> LogRecord {
        let body = GhostReclaimBody { keys };
        let mut rec = LogRecord::new(RecordKind::BtreeGhostReclaim, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_compress_page(
        page: &PageBuf,
        low: &[u8],
        high: &[u8],
        chain_high: &[u8],
    ) -> LogRecord {
        let body = CompressBody {
            low: low.to_vec(),
            high: high.to_vec(),
            chain_high: chain_high.to_vec(),
        };
        let mut rec = LogRecord::new(RecordKind::BtreeCompressPage, page.pid(), body.encode());
        rec.store = page.store();
        rec
    }

    pub fn btree_norec_alloc(
        new_pid: PageId,
        parent: &PageBuf,
        body: &NorecAllocBody,
    ) -> LogRecord {
        let mut rec =
            LogRecord::new_multi(RecordKind::BtreeNorecAlloc, new_pid, parent.pid(), body.encode());
        rec.store = parent.store();
        rec
    }

    pub fn btree_split(child_pid: PageId, parent: &PageBuf, body: &SplitBody) -> LogRecord {
        let mut rec =
            LogRecord::new_multi(RecordKind::BtreeSplit, child_pid, parent.pid(), body.encode());
        rec.store = parent.store();
        rec
    }

    pub fn btree_foster_rebalance(
        dest: &PageBuf,
        src: &PageBuf,
        body: &RebalanceBody,
    ) -> LogRecord {
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterRebalance,
            dest.pid(),
            src.pid(),
            body.encode(),
        );
        rec.store = src.store();
        rec
    }

    pub fn btree_foster_rebalance_norec(
        dest: &PageBuf,
        src: &PageBuf,
        new_fence: &[u8],
    ) -> LogRecord {
        let body = RebalanceNorecBody {
            new_fence: new_fence.to_vec(),
        };
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterRebalanceNorec,
            dest.pid(),
            src.pid(),
            body.encode(),
        );
        rec.store = src.store();
        rec
    }

    pub fn btree_foster_merge(dest: &PageBuf, src: &PageBuf, body: &MergeBody) -> LogRecord {
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterMerge,
            dest.pid(),
            src.pid(),
            body.encode(),
        );
        rec.store = src.store();
        rec
    }

    pub fn btree_foster_adopt(
        real_parent: &PageBuf,
        foster_parent: &PageBuf,
        body: &AdoptBody,
    ) -> LogRecord {
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterAdopt,
            real_parent.pid(),
            foster_parent.pid(),
            body.encode(),
        );
        rec.store = real_parent.store();
        rec
    }

    pub fn btree_foster_deadopt(
        foster_parent: &PageBuf,
        real_parent: &PageBuf,
        body: &DeadoptBody,
    ) -> LogRecord {
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterDeadopt,
            foster_parent.pid(),
            real_parent.pid(),
            body.encode(),
        );
        rec.store = real_parent.store();
        rec
    }
}

impl std::fmt::Debug for LogRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{} pid={} prv={}",
            self.kind, self.lsn, self.pid, self.page_prv
        )?;
        if self.is_multi_page() {
            write!(f, " pid2={} prv2={}", self.page2_pid, self.page2_prv)?;
        }
        if !self.is_ssx() {
            write!(f, " tid={}", self.tid)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// payload bodies
// ----------------------------------------------------------------------

macro_rules! body_codec {
    ($name:ident { $($(#[$meta:meta])* $field:ident : $t:ty),+ $(,)? }) => {
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $($(#[$meta])* pub $field: $t),+
        }

        impl Encodeable for $name {
            fn encode(&self) -> Vec<u8> {
                let mut w = SmallWriter::new();
                $(w.write(&self.$field);)+
                w.to_bytes()
            }
        }

        impl Decodeable for $name {
            fn decode_from<R: Read>(reader: &mut R) -> Self {
                $(let $field = <$t>::decode_from(reader);)+
                Self { $($field),+ }
            }
        }
    };
}

body_codec!(InsertBody {
    key: Vec<u8>,
    value: Vec<u8>,
});

body_codec!(UpdateBody {
    key: Vec<u8>,
    old_value: Vec<u8>,
    new_value: Vec<u8>,
});

body_codec!(OverwriteBody {
    key: Vec<u8>,
    offset: u16,
    old_bytes: Vec<u8>,
    new_bytes: Vec<u8>,
});

body_codec!(GhostMarkBody {
    key: Vec<u8>,
    /// The payload at mark time; UNDO restores it even if a later
    /// same-transaction insert reused the ghost.
    value: Vec<u8>,
});

body_codec!(GhostReserveBody {
    key: Vec<u8>,
    payload_len: u16,
});

body_codec!(AllocBody { count: u32 });

body_codec!(CompressBody {
    low: Vec<u8>,
    high: Vec<u8>,
    chain_high: Vec<u8>,
});

body_codec!(NorecAllocBody {
    btree_root: u32,
    level: u16,
    /// The source's current foster pointer moves onto the new page, so
    /// a crash between norec_alloc and the following split leaves the
    /// chain intact.
    foster: u64,
    foster_emlsn: u64,
    fence_low: Vec<u8>,
    fence_high: Vec<u8>,
    chain_high: Vec<u8>,
});

body_codec!(RebalanceNorecBody { new_fence: Vec<u8> });

body_codec!(ChkptEndBody {
    master: Lsn,
    min_rec_lsn: Lsn,
    min_xct_lsn: Lsn,
});

#[derive(Debug, Clone, PartialEq)]
pub struct GhostReclaimBody {
    pub keys: Vec<Vec<u8>>,
}

impl Encodeable for GhostReclaimBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&(self.keys.len() as u16));
        for key in &self.keys {
            w.write(key);
        }
        w.to_bytes()
    }
}

impl Decodeable for GhostReclaimBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let count = u16::decode_from(reader);
        let keys = (0..count).map(|_| Vec::<u8>::decode_from(reader)).collect();
        Self { keys }
    }
}

/// `btree_split`: the child side carries a complete page image so the
/// new page needs nothing but this record.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitBody {
    pub move_count: u16,
    pub new_high_fence: Vec<u8>,
    pub new_chain_high: Vec<u8>,
    pub page_image: Vec<u8>,
}

impl Encodeable for SplitBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&self.move_count);
        w.write(&self.new_high_fence);
        w.write(&self.new_chain_high);
        w.write(&(self.page_image.len() as u32));
        w.write_bytes(&self.page_image);
        w.to_bytes()
    }
}

impl Decodeable for SplitBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let move_count = u16::decode_from(reader);
        let new_high_fence = Vec::<u8>::decode_from(reader);
        let new_chain_high = Vec::<u8>::decode_from(reader);
        let img_len = u32::decode_from(reader) as usize;
        let page_image = crate::io::read_exact(reader, img_len);
        Self {
            move_count,
            new_high_fence,
            new_chain_high,
            page_image,
        }
    }
}

use crate::btree::page::RecEntry;

fn encode_rec_entries(w: &mut SmallWriter, records: &[RecEntry]) {
    w.write(&(records.len() as u16));
    for rec in records {
        w.write_bytes(&rec.encode());
    }
}

fn decode_rec_entries<R: Read>(reader: &mut R) -> Vec<RecEntry> {
    let count = u16::decode_from(reader);
    (0..count).map(|_| RecEntry::decode_from(reader)).collect()
}

/// `btree_foster_rebalance`: `records` is the complete post-state record
/// set of the destination page, so either page can be reconstructed
/// without the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceBody {
    pub move_count: u16,
    pub boundary: Vec<u8>,
    pub dest_high: Vec<u8>,
    pub chain_high: Vec<u8>,
    pub records: Vec<RecEntry>,
}

impl Encodeable for RebalanceBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&self.move_count);
        w.write(&self.boundary);
        w.write(&self.dest_high);
        w.write(&self.chain_high);
        encode_rec_entries(&mut w, &self.records);
        w.to_bytes()
    }
}

impl Decodeable for RebalanceBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let move_count = u16::decode_from(reader);
        let boundary = Vec::<u8>::decode_from(reader);
        let dest_high = Vec::<u8>::decode_from(reader);
        let chain_high = Vec::<u8>::decode_from(reader);
        let records = decode_rec_entries(reader);
        Self {
            move_count,
            boundary,
            dest_high,
            chain_high,
            records,
        }
    }
}

/// `btree_foster_merge`: `records` are the source page's records being
/// folded into the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeBody {
    pub new_high: Vec<u8>,
    pub new_chain_high: Vec<u8>,
    pub new_foster: u64,
    pub new_foster_emlsn: u64,
    pub records: Vec<RecEntry>,
}

impl Encodeable for MergeBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&self.new_high);
        w.write(&self.new_chain_high);
        w.write(&self.new_foster);
        w.write(&self.new_foster_emlsn);
        encode_rec_entries(&mut w, &self.records);
        w.to_bytes()
    }
}

impl Decodeable for MergeBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let new_high = Vec::<u8>::decode_from(reader);
        let new_chain_high = Vec::<u8>::decode_from(reader);
        let new_foster = u64::decode_from(reader);
        let new_foster_emlsn = u64::decode_from(reader);
        let records = decode_rec_entries(reader);
        Self {
            new_high,
            new_chain_high,
            new_foster,
            new_foster_emlsn,
            records,
        }
    }
}

body_codec!(AdoptBody {
    child_pid: PageId,
    child_emlsn: Lsn,
    child_key: Vec<u8>,
});

body_codec!(DeadoptBody {
    child_pid: PageId,
    child_emlsn: Lsn,
    child_key: Vec<u8>,
    new_chain_high: Vec<u8>,
});

/// Dirty-page table entry carried by `chkpt_bf_tab`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChkptBfTabBody {
    pub entries: Vec<(PageId, Lsn, Lsn)>, // (pid, rec_lsn, page_lsn)
}

impl Encodeable for ChkptBfTabBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&(self.entries.len() as u32));
        for (pid, rec_lsn, page_lsn) in &self.entries {
            w.write(pid);
            w.write(rec_lsn);
            w.write(page_lsn);
        }
        w.to_bytes()
    }
}

impl Decodeable for ChkptBfTabBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let count = u32::decode_from(reader);
        let entries = (0..count)
            .map(|_| {
                (
                    PageId::decode_from(reader),
                    Lsn::decode_from(reader),
                    Lsn::decode_from(reader),
                )
            })
            .collect();
        Self { entries }
    }
}

/// Active-transaction table entry carried by `chkpt_xct_tab`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChkptXctTabBody {
    pub entries: Vec<(u64, Lsn, Lsn, Lsn)>, // (tid, last_lsn, undo_nxt, first_lsn)
}

impl Encodeable for ChkptXctTabBody {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&(self.entries.len() as u32));
        for (tid, last, undo, first) in &self.entries {
            w.write(tid);
            w.write(last);
            w.write(undo);
            w.write(first);
        }
        w.to_bytes()
    }
}

impl Decodeable for ChkptXctTabBody {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let count = u32::decode_from(reader);
        let entries = (0..count)
            .map(|_| {
                (
                    u64::decode_from(reader),
                    Lsn::decode_from(reader),
                    Lsn::decode_from(reader),
                    Lsn::decode_from(reader),
                )
            })
            .collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vol::PageId;

    #[test]
    fn test_record_round_trip() {
        let mut rec = LogRecord::new(
            RecordKind::BtreeInsert,
            PageId::new(1, 9),
            InsertBody {
                key: b"k00001".to_vec(),
                value: b"v".to_vec(),
            }
            .encode(),
        );
        rec.store = 2;
        rec.tid = 77;
        rec.tid_prv = Lsn::new(1, 24);
        rec.page_prv = Lsn::new(1, 48);
        rec.lsn = Lsn::new(1, 96);

        let bytes = rec.encode();
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(bytes.len(), rec.encoded_len());

        let back = LogRecord::decode(&bytes, Lsn::new(1, 96)).unwrap();
        assert_eq!(back.kind, RecordKind::BtreeInsert);
        assert_eq!(back.tid, 77);
        assert_eq!(back.pid, PageId::new(1, 9));
        assert_eq!(back.page_prv, Lsn::new(1, 48));
        let body = back.decode_insert();
        assert_eq!(body.key, b"k00001");
        assert_eq!(body.value, b"v");
    }

    #[test]
    fn test_trailing_lsn_mismatch_rejected() {
        let mut rec = LogRecord::comment("hello");
        rec.lsn = Lsn::new(1, 0);
        let bytes = rec.encode();
        assert!(LogRecord::decode(&bytes, Lsn::new(1, 8)).is_err());
    }

    #[test]
    fn test_ssx_header_is_smaller() {
        let mut ssx = LogRecord::alloc_page(PageId::new(1, 5));
        ssx.lsn = Lsn::new(1, 0);
        let mut user = LogRecord::new(RecordKind::BtreeGhostMark, PageId::new(1, 5), vec![0u8; 4]);
        user.lsn = Lsn::new(1, 0);
        assert!(ssx.is_ssx());
        assert!(!user.is_ssx());
        assert_eq!(ssx.header_size(), HDR_BASE);
        assert_eq!(user.header_size(), HDR_BASE + HDR_XCT);
    }

    #[test]
    fn test_multi_page_fields_survive() {
        let body = AdoptBody {
            child_pid: PageId::new(1, 33),
            child_emlsn: Lsn::new(2, 16),
            child_key: b"m".to_vec(),
        };
        let mut rec = LogRecord::new_multi(
            RecordKind::BtreeFosterAdopt,
            PageId::new(1, 2),
            PageId::new(1, 3),
            body.encode(),
        );
        rec.page_prv = Lsn::new(1, 8);
        rec.page2_prv = Lsn::new(1, 16);
        rec.lsn = Lsn::new(3, 0);

        let back = LogRecord::decode(&rec.encode(), Lsn::new(3, 0)).unwrap();
        assert!(back.is_multi_page() && back.is_ssx());
        assert_eq!(back.page2_pid, PageId::new(1, 3));
        assert_eq!(back.prev_lsn_for(PageId::new(1, 3)), Lsn::new(1, 16));
        assert_eq!(back.prev_lsn_for(PageId::new(1, 2)), Lsn::new(1, 8));
    }

    #[test]
    fn test_set_clr_disables_undo() {
        let page = {
            let mut p = crate::vol::PageBuf::new();
            p.btree_format(PageId::new(1, 4), 1, 4, 1, b"a", b"z", b"z", None);
            p
        };
        let mut rec = LogRecord::btree_ghost_mark(&page, b"k1", b"v1");
        assert!(rec.is_undo());
        rec.set_clr(Lsn::new(1, 40));
        assert!(!rec.is_undo());
        assert!(rec.is_cpsn());
        assert_eq!(rec.undo_nxt(), Lsn::new(1, 40));
    }
}
