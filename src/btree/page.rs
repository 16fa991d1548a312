//! Slotted-page layout for Foster B-tree pages.
//!
//! After the generic header comes the slot vector (growing up) and the
//! record region (growing down from the end of the page). A slot is a
//! u16: bit 15 is the ghost flag, bits 0..15 the byte offset of the
//! record. A record is `key_len u16, val_len u16, key-tail, value`.
//!
//! The first three slots hold the fence records: low fence, high fence,
//! chain-high fence. User records start at slot index 3 and stay sorted.
//! User keys store only the tail after the common prefix of the low and
//! high fences. A high or chain-high fence of length zero means
//! "positive infinity"; the empty low fence is the ordinary minimum key.
//!
//! Branch-page values are `child_ptr u64 || emlsn u64`; the child
//! pointer's low word may carry the swizzle bit while resident.

use std::io::Read;

use crate::{
    error::{DbError, ErrorKind},
    io::{get_u16, get_u64, put_u16, put_u64, Decodeable, Encodeable, SmallWriter},
    vol::{
        get_page_size, tag, PageBuf, PageId, StoreId, OFF_BODY_HI, OFF_BODY_LO,
        OFF_CHAIN_HIGH_LEN, OFF_FENCE_HIGH_LEN, OFF_FENCE_LOW_LEN, OFF_GHOST_COUNT, OFF_N_SLOTS,
        OFF_PREFIX_LEN, PAGE_HEADER_SIZE,
    },
    wal::lsn::Lsn,
};

const GHOST_BIT: u16 = 1 << 15;
const SLOT_BYTES: usize = 2;
const REC_HDR: usize = 4;

/// Fence slots occupy indices 0..3; user slots follow.
pub const FENCE_SLOTS: usize = 3;

/// One record lifted off a page, used by rebalance/merge log payloads
/// and page rebuilds. `key` is the full key (prefix restored).
#[derive(Debug, Clone, PartialEq)]
pub struct RecEntry {
    pub ghost: bool,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Encodeable for RecEntry {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        w.write(&self.ghost);
        w.write(&self.key);
        w.write(&self.value);
        w.to_bytes()
    }
}

impl Decodeable for RecEntry {
    fn decode_from<R: Read>(reader: &mut R) -> Self {
        let ghost = bool::decode_from(reader);
        let key = Vec::<u8>::decode_from(reader);
        let value = Vec::<u8>::decode_from(reader);
        Self { ghost, key, value }
    }
}

/// Compare a search key against a fence: a zero-length fence means
/// +infinity.
pub fn below_fence(key: &[u8], fence: &[u8]) -> bool {
    fence.is_empty() || key < fence
}

impl PageBuf {
    // ------------------------------------------------------------------
    // formatting
    // ------------------------------------------------------------------

    /// Format this buffer as an empty B-tree page. Emits no log; the
    /// caller logs `page_img_format` or a self-contained system
    /// transaction that reproduces the call.
    pub fn btree_format(
        &mut self,
        pid: PageId,
        store: StoreId,
        btree_root: u32,
        level: u16,
        low: &[u8],
        high: &[u8],
        chain_high: &[u8],
        foster: Option<PageId>,
    ) {
        for b in self.bytes_mut().iter_mut() {
            *b = 0;
        }
        self.set_pid(pid);
        self.set_store(store);
        self.set_tag(tag::T_BTREE);
        self.set_level(level);
        self.set_btree_root(btree_root);
        self.set_foster_child_pid(foster);
        self.set_foster_emlsn(Lsn::NULL);

        self.set_n_slots(0);
        self.set_body_lo(PAGE_HEADER_SIZE as u16);
        self.set_body_hi(get_page_size() as u16);

        let prefix = common_prefix(low, high);
        self.set_fence_lens(low.len(), high.len(), chain_high.len(), prefix);

        // fence records are full keys, never truncated
        self.raw_insert(0, low, &[], false);
        self.raw_insert(1, high, &[], false);
        self.raw_insert(2, chain_high, &[], false);
    }

    // ------------------------------------------------------------------
    // header fields beyond the generic accessors
    // ------------------------------------------------------------------

    pub fn n_slots(&self) -> usize {
        get_u16(self.bytes(), OFF_N_SLOTS) as usize
    }

    fn set_n_slots(&mut self, n: usize) {
        put_u16(self.bytes_mut(), OFF_N_SLOTS, n as u16);
    }

    pub fn ghost_count(&self) -> usize {
        get_u16(self.bytes(), OFF_GHOST_COUNT) as usize
    }

    fn set_ghost_count(&mut self, n: usize) {
        put_u16(self.bytes_mut(), OFF_GHOST_COUNT, n as u16);
    }

    fn body_lo(&self) -> usize {
        get_u16(self.bytes(), OFF_BODY_LO) as usize
    }

    fn set_body_lo(&mut self, v: u16) {
        put_u16(self.bytes_mut(), OFF_BODY_LO, v);
    }

    fn body_hi(&self) -> usize {
        get_u16(self.bytes(), OFF_BODY_HI) as usize
    }

    fn set_body_hi(&mut self, v: u16) {
        put_u16(self.bytes_mut(), OFF_BODY_HI, v);
    }

    pub fn prefix_len(&self) -> usize {
        get_u16(self.bytes(), OFF_PREFIX_LEN) as usize
    }

    fn set_fence_lens(&mut self, low: usize, high: usize, chain: usize, prefix: usize) {
        put_u16(self.bytes_mut(), OFF_FENCE_LOW_LEN, low as u16);
        put_u16(self.bytes_mut(), OFF_FENCE_HIGH_LEN, high as u16);
        put_u16(self.bytes_mut(), OFF_CHAIN_HIGH_LEN, chain as u16);
        put_u16(self.bytes_mut(), OFF_PREFIX_LEN, prefix as u16);
    }

    // ------------------------------------------------------------------
    // slots
    // ------------------------------------------------------------------

    fn slot_raw(&self, idx: usize) -> u16 {
        debug_assert!(idx < self.n_slots());
        get_u16(self.bytes(), PAGE_HEADER_SIZE + idx * SLOT_BYTES)
    }

    fn set_slot_raw(&mut self, idx: usize, v: u16) {
        put_u16(self.bytes_mut(), PAGE_HEADER_SIZE + idx * SLOT_BYTES, v);
    }

    fn rec_offset(&self, idx: usize) -> usize {
        (self.slot_raw(idx) & !GHOST_BIT) as usize
    }

    fn rec_key_len(&self, idx: usize) -> usize {
        get_u16(self.bytes(), self.rec_offset(idx)) as usize
    }

    fn rec_val_len(&self, idx: usize) -> usize {
        get_u16(self.bytes(), self.rec_offset(idx) + 2) as usize
    }

    fn rec_size(&self, idx: usize) -> usize {
        REC_HDR + self.rec_key_len(idx) + self.rec_val_len(idx)
    }

    /// Key bytes as stored (tail for user slots, full for fence slots).
    fn rec_key_bytes(&self, idx: usize) -> &[u8] {
        let off = self.rec_offset(idx);
        let klen = self.rec_key_len(idx);
        &self.bytes()[off + REC_HDR..off + REC_HDR + klen]
    }

    fn rec_value_bytes(&self, idx: usize) -> &[u8] {
        let off = self.rec_offset(idx);
        let klen = self.rec_key_len(idx);
        let vlen = self.rec_val_len(idx);
        &self.bytes()[off + REC_HDR + klen..off + REC_HDR + klen + vlen]
    }

    /// Number of user records (fence slots excluded).
    pub fn user_slot_count(&self) -> usize {
        let n = self.n_slots();
        if n < FENCE_SLOTS {
            0
        } else {
            n - FENCE_SLOTS
        }
    }

    pub fn is_ghost(&self, user_idx: usize) -> bool {
        self.slot_raw(FENCE_SLOTS + user_idx) & GHOST_BIT != 0
    }

    pub fn user_key(&self, user_idx: usize) -> Vec<u8> {
        let mut key = self.prefix().to_vec();
        key.extend_from_slice(self.rec_key_bytes(FENCE_SLOTS + user_idx));
        key
    }

    pub fn user_value(&self, user_idx: usize) -> &[u8] {
        self.rec_value_bytes(FENCE_SLOTS + user_idx)
    }

    // ------------------------------------------------------------------
    // fences
    // ------------------------------------------------------------------

    pub fn low_fence(&self) -> &[u8] {
        self.rec_key_bytes(0)
    }

    pub fn high_fence(&self) -> &[u8] {
        self.rec_key_bytes(1)
    }

    pub fn chain_high_fence(&self) -> &[u8] {
        self.rec_key_bytes(2)
    }

    fn prefix(&self) -> &[u8] {
        let plen = self.prefix_len();
        &self.rec_key_bytes(0)[..plen]
    }

    /// `[low, high)` membership.
    pub fn fence_contains(&self, key: &[u8]) -> bool {
        key >= self.low_fence() && below_fence(key, self.high_fence())
    }

    // ------------------------------------------------------------------
    // search
    // ------------------------------------------------------------------

    /// Binary search among user slots. `Ok(i)` exact match (ghost or
    /// not), `Err(i)` insertion point.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.user_slot_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_key = self.user_key(mid);
            match mid_key.as_slice().cmp(key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    /// Branch descent: the user slot whose child covers `key`, i.e. the
    /// rightmost entry with key ≤ search key. The leftmost entry's key
    /// equals the page's low fence, so a covering slot always exists.
    pub fn search_branch(&self, key: &[u8]) -> usize {
        debug_assert!(!self.is_leaf());
        match self.search(key) {
            Ok(i) => i,
            Err(0) => panic!(
                "branch page {} has no child covering key {:?}",
                self.pid(),
                key
            ),
            Err(i) => i - 1,
        }
    }

    // ------------------------------------------------------------------
    // branch child access
    // ------------------------------------------------------------------

    pub fn child_ptr_at(&self, user_idx: usize) -> u64 {
        debug_assert!(!self.is_leaf());
        get_u64(self.user_value(user_idx), 0)
    }

    pub fn set_child_ptr_at(&mut self, user_idx: usize, ptr: u64) {
        let off = self.rec_offset(FENCE_SLOTS + user_idx);
        let klen = self.rec_key_len(FENCE_SLOTS + user_idx);
        put_u64(self.bytes_mut(), off + REC_HDR + klen, ptr);
    }

    pub fn emlsn_at(&self, user_idx: usize) -> Lsn {
        Lsn::from_u64(get_u64(self.user_value(user_idx), 8))
    }

    pub fn set_emlsn_at(&mut self, user_idx: usize, emlsn: Lsn) {
        let off = self.rec_offset(FENCE_SLOTS + user_idx);
        let klen = self.rec_key_len(FENCE_SLOTS + user_idx);
        put_u64(self.bytes_mut(), off + REC_HDR + klen + 8, emlsn.to_u64());
    }

    pub fn branch_value(child: PageId, emlsn: Lsn) -> Vec<u8> {
        let mut v = Vec::with_capacity(16);
        v.extend_from_slice(&child.to_u64().to_le_bytes());
        v.extend_from_slice(&emlsn.to_u64().to_le_bytes());
        v
    }

    // ------------------------------------------------------------------
    // space accounting
    // ------------------------------------------------------------------

    pub fn contiguous_free(&self) -> usize {
        self.body_hi() - self.body_lo()
    }

    /// Dead bytes recoverable by `defrag`: record-region bytes not
    /// referenced by any live slot.
    pub fn reclaimable(&self) -> usize {
        let mut live = 0usize;
        for idx in 0..self.n_slots() {
            live += self.rec_size(idx);
        }
        (get_page_size() - self.body_hi()) - live
    }

    pub fn fits(&self, key: &[u8], val_len: usize) -> bool {
        let tail_len = key.len().saturating_sub(self.prefix_len());
        self.contiguous_free() >= SLOT_BYTES + REC_HDR + tail_len + val_len
    }

    pub fn fits_after_defrag(&self, key: &[u8], val_len: usize) -> bool {
        let tail_len = key.len().saturating_sub(self.prefix_len());
        self.contiguous_free() + self.reclaimable()
            >= SLOT_BYTES + REC_HDR + tail_len + val_len
    }

    // ------------------------------------------------------------------
    // mutation
    // ------------------------------------------------------------------

    /// Insert at an absolute slot index, raw bytes (no prefix handling,
    /// no sort-order check).
    fn raw_insert(&mut self, idx: usize, key_bytes: &[u8], value: &[u8], ghost: bool) {
        let rec_size = REC_HDR + key_bytes.len() + value.len();
        assert!(
            self.contiguous_free() >= rec_size + SLOT_BYTES,
            "page {} out of space: {} free, {} needed",
            self.pid(),
            self.contiguous_free(),
            rec_size + SLOT_BYTES
        );

        let new_hi = self.body_hi() - rec_size;
        {
            let buf = self.bytes_mut();
            put_u16(buf, new_hi, key_bytes.len() as u16);
            put_u16(buf, new_hi + 2, value.len() as u16);
            buf[new_hi + REC_HDR..new_hi + REC_HDR + key_bytes.len()].copy_from_slice(key_bytes);
            buf[new_hi + REC_HDR + key_bytes.len()..new_hi + rec_size].copy_from_slice(value);
        }
        self.set_body_hi(new_hi as u16);

        // shift the slot vector right of idx
        let n = self.n_slots();
        let vec_start = PAGE_HEADER_SIZE;
        {
            let buf = self.bytes_mut();
            buf.copy_within(
                vec_start + idx * SLOT_BYTES..vec_start + n * SLOT_BYTES,
                vec_start + (idx + 1) * SLOT_BYTES,
            );
        }
        let mut slot = new_hi as u16;
        if ghost {
            slot |= GHOST_BIT;
        }
        self.set_n_slots(n + 1);
        self.set_slot_raw(idx, slot);
        self.set_body_lo((vec_start + (n + 1) * SLOT_BYTES) as u16);
        if ghost {
            let g = self.ghost_count();
            self.set_ghost_count(g + 1);
        }
    }

    /// Insert a user record in sorted position. The key must fall in
    /// the page's fence range; a violation is an integrity bug.
    pub fn insert_user(&mut self, key: &[u8], value: &[u8], ghost: bool) -> Result<usize, DbError> {
        if !self.fence_contains(key) {
            panic!(
                "fence violation on page {}: key {:?} outside [{:?}, {:?})",
                self.pid(),
                key,
                self.low_fence(),
                self.high_fence()
            );
        }
        let user_idx = match self.search(key) {
            Ok(_) => {
                return Err(DbError::new(ErrorKind::DuplicateKey, "key already present"));
            }
            Err(i) => i,
        };
        if !self.fits(key, value.len()) {
            return Err(DbError::out_of_space("page full"));
        }
        let tail = key[self.prefix_len()..].to_vec();
        self.raw_insert(FENCE_SLOTS + user_idx, &tail, value, ghost);
        Ok(user_idx)
    }

    /// Remove a user slot; the record bytes become dead space until the
    /// next defragment.
    pub fn remove_user_slot(&mut self, user_idx: usize) {
        let idx = FENCE_SLOTS + user_idx;
        if self.slot_raw(idx) & GHOST_BIT != 0 {
            let g = self.ghost_count();
            self.set_ghost_count(g - 1);
        }
        let n = self.n_slots();
        let vec_start = PAGE_HEADER_SIZE;
        {
            let buf = self.bytes_mut();
            buf.copy_within(
                vec_start + (idx + 1) * SLOT_BYTES..vec_start + n * SLOT_BYTES,
                vec_start + idx * SLOT_BYTES,
            );
        }
        self.set_n_slots(n - 1);
        self.set_body_lo((vec_start + (n - 1) * SLOT_BYTES) as u16);
    }

    /// Logically delete: flip the ghost bit on.
    pub fn mark_ghost(&mut self, user_idx: usize) {
        let idx = FENCE_SLOTS + user_idx;
        let raw = self.slot_raw(idx);
        assert!(raw & GHOST_BIT == 0, "slot already a ghost");
        self.set_slot_raw(idx, raw | GHOST_BIT);
        let g = self.ghost_count();
        self.set_ghost_count(g + 1);
    }

    /// UNDO of `mark_ghost`.
    pub fn unmark_ghost(&mut self, user_idx: usize) {
        let idx = FENCE_SLOTS + user_idx;
        let raw = self.slot_raw(idx);
        assert!(raw & GHOST_BIT != 0, "slot is not a ghost");
        self.set_slot_raw(idx, raw & !GHOST_BIT);
        let g = self.ghost_count();
        self.set_ghost_count(g - 1);
    }

    /// Insert a ghost slot reserving `payload_len` bytes of value space.
    pub fn reserve_ghost(&mut self, key: &[u8], payload_len: usize) -> Result<usize, DbError> {
        let zeros = vec![0u8; payload_len];
        self.insert_user(key, &zeros, true)
    }

    /// Flip a ghost to live, writing the value into the reserved space.
    pub fn replace_ghost(&mut self, user_idx: usize, value: &[u8]) {
        let idx = FENCE_SLOTS + user_idx;
        let raw = self.slot_raw(idx);
        assert!(raw & GHOST_BIT != 0, "replace_ghost on live slot");
        let reserved = self.rec_val_len(idx);
        assert!(
            value.len() <= reserved,
            "ghost reserved {} bytes, value needs {}",
            reserved,
            value.len()
        );
        let off = self.rec_offset(idx);
        let klen = self.rec_key_len(idx);
        {
            let buf = self.bytes_mut();
            put_u16(buf, off + 2, value.len() as u16);
            buf[off + REC_HDR + klen..off + REC_HDR + klen + value.len()].copy_from_slice(value);
        }
        self.set_slot_raw(idx, raw & !GHOST_BIT);
        let g = self.ghost_count();
        self.set_ghost_count(g - 1);
    }

    /// Overwrite a live value. Same-or-smaller length patches in place;
    /// growing relocates the record bytes within the page.
    pub fn set_user_value(&mut self, user_idx: usize, value: &[u8]) -> Result<(), DbError> {
        let idx = FENCE_SLOTS + user_idx;
        let reserved = self.rec_val_len(idx);
        let off = self.rec_offset(idx);
        let klen = self.rec_key_len(idx);
        if value.len() <= reserved {
            let buf = self.bytes_mut();
            put_u16(buf, off + 2, value.len() as u16);
            buf[off + REC_HDR + klen..off + REC_HDR + klen + value.len()].copy_from_slice(value);
            return Ok(());
        }
        let rec_size = REC_HDR + klen + value.len();
        if self.contiguous_free() < rec_size {
            return Err(DbError::out_of_space("no room to grow value"));
        }
        let tail = self.rec_key_bytes(idx).to_vec();
        let ghost = self.slot_raw(idx) & GHOST_BIT;
        let new_hi = self.body_hi() - rec_size;
        {
            let buf = self.bytes_mut();
            put_u16(buf, new_hi, tail.len() as u16);
            put_u16(buf, new_hi + 2, value.len() as u16);
            buf[new_hi + REC_HDR..new_hi + REC_HDR + tail.len()].copy_from_slice(&tail);
            buf[new_hi + REC_HDR + tail.len()..new_hi + rec_size].copy_from_slice(value);
        }
        self.set_body_hi(new_hi as u16);
        self.set_slot_raw(idx, new_hi as u16 | ghost);
        Ok(())
    }

    /// Patch a fixed-offset slice of a live value (the `overwrite`
    /// operation). The slice must stay inside the current value.
    pub fn overwrite_user_value(&mut self, user_idx: usize, offset: usize, bytes: &[u8]) {
        let idx = FENCE_SLOTS + user_idx;
        let vlen = self.rec_val_len(idx);
        assert!(
            offset + bytes.len() <= vlen,
            "overwrite slice {}..{} beyond value length {}",
            offset,
            offset + bytes.len(),
            vlen
        );
        let off = self.rec_offset(idx);
        let klen = self.rec_key_len(idx);
        let start = off + REC_HDR + klen + offset;
        self.bytes_mut()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    // ------------------------------------------------------------------
    // bulk operations
    // ------------------------------------------------------------------

    /// Lift user records `[from, to)` off the page, prefix restored.
    pub fn extract_records(&self, from: usize, to: usize) -> Vec<RecEntry> {
        (from..to)
            .map(|i| RecEntry {
                ghost: self.is_ghost(i),
                key: self.user_key(i),
                value: self.user_value(i).to_vec(),
            })
            .collect()
    }

    pub fn extract_all_records(&self) -> Vec<RecEntry> {
        self.extract_records(0, self.user_slot_count())
    }

    /// Rebuild the page in place with new fences and the given records
    /// (sorted). Keeps pid, store, level, root, foster fields and
    /// page_lsn; recomputes prefix truncation. This is the shared
    /// engine under defrag, compress, truncate, and rebalance REDO.
    pub fn rebuild(&mut self, low: &[u8], high: &[u8], chain_high: &[u8], records: &[RecEntry]) {
        let pid = self.pid();
        let store = self.store();
        let level = self.level();
        let root = self.btree_root();
        let foster = self.foster_child();
        let foster_emlsn = self.foster_emlsn();
        let lsn = self.page_lsn();

        self.btree_format(pid, store, root, level, low, high, chain_high, foster);
        self.set_foster_emlsn(foster_emlsn);
        self.set_page_lsn(lsn);

        for rec in records {
            debug_assert!(rec.key.as_slice() >= low && below_fence(&rec.key, high));
            let tail = rec.key[self.prefix_len()..].to_vec();
            let n = self.n_slots();
            self.raw_insert(n, &tail, &rec.value, rec.ghost);
        }
    }

    /// Compact the record region. Idempotent: rebuilding an already
    /// compact page does not change its content.
    pub fn defrag(&mut self) {
        let low = self.low_fence().to_vec();
        let high = self.high_fence().to_vec();
        let chain = self.chain_high_fence().to_vec();
        let records = self.extract_all_records();
        self.rebuild(&low, &high, &chain, &records);
    }

    /// Physically remove the given ghost keys, then defragment. REDO of
    /// `btree_ghost_reclaim` replays exactly this.
    pub fn reclaim_ghosts(&mut self, keys: &[Vec<u8>]) {
        for key in keys {
            if let Ok(idx) = self.search(key) {
                if self.is_ghost(idx) {
                    self.remove_user_slot(idx);
                }
            }
        }
        self.defrag();
    }

    /// Replace the fence records (re-prefixing all user keys).
    pub fn compress(&mut self, low: &[u8], high: &[u8], chain_high: &[u8]) {
        let records = self.extract_all_records();
        self.rebuild(low, high, chain_high, &records);
    }

    /// Install a foster child: header pointer plus new high/chain-high
    /// bounds.
    pub fn set_foster_child(&mut self, pid: PageId, high: &[u8], chain_high: &[u8]) {
        let records = self.extract_all_records();
        let low = self.low_fence().to_vec();
        self.rebuild(&low, high, chain_high, &records);
        self.set_foster_child_pid(Some(pid));
        self.set_foster_emlsn(Lsn::NULL);
    }

    // ------------------------------------------------------------------
    // verification
    // ------------------------------------------------------------------

    /// Page-local invariants: sorted keys, keys within fences, ghost
    /// count consistent. Panics on violation (integrity class).
    pub fn verify_page(&self) {
        let mut ghosts = 0;
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..self.user_slot_count() {
            let key = self.user_key(i);
            assert!(
                key.as_slice() >= self.low_fence(),
                "page {}: key below low fence",
                self.pid()
            );
            assert!(
                below_fence(&key, self.high_fence()),
                "page {}: key at/above high fence",
                self.pid()
            );
            if let Some(p) = &prev {
                assert!(p < &key, "page {}: keys out of order", self.pid());
            }
            prev = Some(key);
            if self.is_ghost(i) {
                ghosts += 1;
            }
        }
        assert_eq!(
            ghosts,
            self.ghost_count(),
            "page {}: ghost count",
            self.pid()
        );
    }
}

pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() || b.is_empty() {
        // an infinite fence shares no prefix
        return 0;
    }
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vol::PageBuf;

    fn leaf() -> PageBuf {
        let mut page = PageBuf::new();
        page.btree_format(PageId::new(1, 10), 1, 10, 1, b"k0", b"k9", b"k9", None);
        page
    }

    #[test]
    fn test_insert_sorted_and_search() {
        let mut page = leaf();
        page.insert_user(b"k5", b"five", false).unwrap();
        page.insert_user(b"k1", b"one", false).unwrap();
        page.insert_user(b"k3", b"three", false).unwrap();

        assert_eq!(page.user_slot_count(), 3);
        assert_eq!(page.user_key(0), b"k1");
        assert_eq!(page.user_key(2), b"k5");
        assert_eq!(page.search(b"k3"), Ok(1));
        assert_eq!(page.search(b"k4"), Err(2));
        assert_eq!(page.user_value(1), b"three");
        page.verify_page();
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut page = leaf();
        page.insert_user(b"k1", b"a", false).unwrap();
        let err = page.insert_user(b"k1", b"b", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);
    }

    #[test]
    fn test_prefix_truncation() {
        let mut page = PageBuf::new();
        page.btree_format(
            PageId::new(1, 11),
            1,
            11,
            1,
            b"user100",
            b"user200",
            b"user200",
            None,
        );
        assert_eq!(page.prefix_len(), 4); // "user"
        page.insert_user(b"user150", b"v", false).unwrap();
        // only the tail is stored
        assert_eq!(page.rec_key_bytes(FENCE_SLOTS), b"150");
        assert_eq!(page.user_key(0), b"user150");
    }

    #[test]
    fn test_ghost_lifecycle() {
        let mut page = leaf();
        let idx = page.reserve_ghost(b"k2", 8).unwrap();
        assert!(page.is_ghost(idx));
        page.replace_ghost(idx, b"val");
        assert!(!page.is_ghost(idx));
        assert_eq!(page.user_value(idx), b"val");

        page.mark_ghost(idx);
        assert!(page.is_ghost(idx));
        page.unmark_ghost(idx);
        assert!(!page.is_ghost(idx));
        page.verify_page();
    }

    #[test]
    fn test_reclaim_idempotent() {
        let mut page = leaf();
        page.insert_user(b"k1", b"a", false).unwrap();
        page.insert_user(b"k2", b"b", false).unwrap();
        page.mark_ghost(0);

        page.reclaim_ghosts(&[b"k1".to_vec()]);
        let first = page.bytes().to_vec();
        page.reclaim_ghosts(&[b"k1".to_vec()]);
        // replaying the reclaim leaves the page unchanged
        assert_eq!(page.bytes(), &first[..]);
        assert_eq!(page.user_slot_count(), 1);
        assert_eq!(page.user_key(0), b"k2");
    }

    #[test]
    fn test_defrag_reclaims_dead_space() {
        let mut page = leaf();
        page.insert_user(b"k1", &vec![1u8; 100], false).unwrap();
        page.insert_user(b"k2", &vec![2u8; 100], false).unwrap();
        page.remove_user_slot(0);
        let before = page.contiguous_free();
        assert!(page.reclaimable() > 0);
        page.defrag();
        assert!(page.contiguous_free() > before);
        assert_eq!(page.reclaimable(), 0);
        assert_eq!(page.user_key(0), b"k2");
    }

    #[test]
    fn test_overwrite_slice() {
        let mut page = leaf();
        page.insert_user(b"k1", b"0123456789", false).unwrap();
        page.overwrite_user_value(0, 4, b"QQ");
        assert_eq!(page.user_value(0), b"0123QQ6789");
    }

    #[test]
    fn test_set_foster_child_rewrites_bounds() {
        let mut page = leaf();
        page.insert_user(b"k1", b"a", false).unwrap();
        page.insert_user(b"k4", b"b", false).unwrap();
        page.set_foster_child(PageId::new(1, 77), b"k5", b"k9");
        assert_eq!(page.foster_child(), Some(PageId::new(1, 77)));
        assert_eq!(page.high_fence(), b"k5");
        assert_eq!(page.chain_high_fence(), b"k9");
        assert_eq!(page.user_slot_count(), 2);
        page.verify_page();
    }

    #[test]
    fn test_branch_entries() {
        let mut page = PageBuf::new();
        page.btree_format(PageId::new(1, 20), 1, 20, 2, b"", b"", b"", None);
        let v1 = PageBuf::branch_value(PageId::new(1, 30), Lsn::new(1, 64));
        let v2 = PageBuf::branch_value(PageId::new(1, 31), Lsn::new(1, 128));
        page.insert_user(b"", &v1, false).unwrap();
        page.insert_user(b"m", &v2, false).unwrap();

        assert_eq!(page.search_branch(b"a"), 0);
        assert_eq!(page.search_branch(b"m"), 1);
        assert_eq!(page.search_branch(b"z"), 1);
        assert_eq!(page.child_ptr_at(1), PageId::new(1, 31).to_u64());
        assert_eq!(page.emlsn_at(0), Lsn::new(1, 64));

        page.set_emlsn_at(0, Lsn::new(2, 8));
        assert_eq!(page.emlsn_at(0), Lsn::new(2, 8));
    }
}
