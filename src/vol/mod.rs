pub mod alloc_cache;
pub mod page_id;
pub mod store_table;
pub mod volume;

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    io::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64},
    wal::lsn::Lsn,
};
pub use page_id::{PageId, StoreId, VolumeId, NULL_PID};
pub use volume::Volume;

pub const DEFAULT_PAGE_SIZE: usize = 8192;
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_PAGE_SIZE);

/// Set the process-wide page size. Must happen before any engine is
/// opened; tests use small pages to force splits cheaply.
pub fn set_page_size(page_size: usize) {
    PAGE_SIZE.store(page_size, Ordering::Relaxed);
}

pub fn get_page_size() -> usize {
    PAGE_SIZE.load(Ordering::Relaxed)
}

/// Page tags. Stored in the generic header; an unknown tag on a page
/// read from disk is an integrity violation.
pub mod tag {
    pub const T_NONE: u16 = 0;
    pub const T_BTREE: u16 = 1;
    pub const T_ALLOC: u16 = 2;
    pub const T_STNODE: u16 = 3;
}

/// Generic page header layout (fixed offsets, little-endian):
///
/// ```text
/// 0   checksum        u64   fold over bytes[8..page_size]
/// 8   pid             u64
/// 16  page_lsn        u64   LSN of the last logged write
/// 24  store           u32
/// 28  tag             u16
/// 30  level           u16   1 = leaf, counting up toward the root
/// 32  n_slots         u16   includes the three fence slots
/// 34  ghost_count     u16
/// 36  body_lo         u16   end of the slot vector (grows up)
/// 38  body_hi         u16   start of the record region (grows down)
/// 40  fence_low_len   u16
/// 42  fence_high_len  u16
/// 44  chain_high_len  u16
/// 46  prefix_len      u16
/// 48  btree_root      u32   page number of this tree's root
/// 52  (reserved)      u32
/// 56  foster_child    u64   pid, 0 = none; never swizzled
/// 64  foster_emlsn    u64
/// 72  slot vector ...
/// ```
pub const PAGE_HEADER_SIZE: usize = 72;

pub const OFF_CHECKSUM: usize = 0;
pub const OFF_PID: usize = 8;
pub const OFF_PAGE_LSN: usize = 16;
pub const OFF_STORE: usize = 24;
pub const OFF_TAG: usize = 28;
pub const OFF_LEVEL: usize = 30;
pub const OFF_N_SLOTS: usize = 32;
pub const OFF_GHOST_COUNT: usize = 34;
pub const OFF_BODY_LO: usize = 36;
pub const OFF_BODY_HI: usize = 38;
pub const OFF_FENCE_LOW_LEN: usize = 40;
pub const OFF_FENCE_HIGH_LEN: usize = 42;
pub const OFF_CHAIN_HIGH_LEN: usize = 44;
pub const OFF_PREFIX_LEN: usize = 46;
pub const OFF_BTREE_ROOT: usize = 48;
pub const OFF_PAGE_FLAGS: usize = 52;
pub const OFF_FOSTER_CHILD: usize = 56;

/// Page-flag bits (header offset 52).
pub mod page_flags {
    pub const TO_BE_DELETED: u32 = 0x1;
}
pub const OFF_FOSTER_EMLSN: usize = 64;

/// One fixed-size page worth of bytes. The buffer pool owns one per
/// frame; the volume reads and writes whole pages.
pub struct PageBuf {
    data: Box<[u8]>,
}

impl PageBuf {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; get_page_size()].into_boxed_slice(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), get_page_size());
        Self {
            data: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn copy_from(&mut self, other: &PageBuf) {
        self.data.copy_from_slice(&other.data);
    }

    // --- generic header accessors ---

    pub fn pid(&self) -> PageId {
        PageId::from_u64(get_u64(&self.data, OFF_PID))
    }

    pub fn set_pid(&mut self, pid: PageId) {
        put_u64(&mut self.data, OFF_PID, pid.to_u64());
    }

    pub fn page_lsn(&self) -> Lsn {
        Lsn::from_u64(get_u64(&self.data, OFF_PAGE_LSN))
    }

    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        put_u64(&mut self.data, OFF_PAGE_LSN, lsn.to_u64());
    }

    pub fn store(&self) -> StoreId {
        get_u32(&self.data, OFF_STORE)
    }

    pub fn set_store(&mut self, store: StoreId) {
        put_u32(&mut self.data, OFF_STORE, store);
    }

    pub fn tag(&self) -> u16 {
        get_u16(&self.data, OFF_TAG)
    }

    pub fn set_tag(&mut self, tag: u16) {
        put_u16(&mut self.data, OFF_TAG, tag);
    }

    pub fn level(&self) -> u16 {
        get_u16(&self.data, OFF_LEVEL)
    }

    pub fn set_level(&mut self, level: u16) {
        put_u16(&mut self.data, OFF_LEVEL, level);
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 1
    }

    pub fn btree_root(&self) -> u32 {
        get_u32(&self.data, OFF_BTREE_ROOT)
    }

    pub fn set_btree_root(&mut self, root: u32) {
        put_u32(&mut self.data, OFF_BTREE_ROOT, root);
    }

    pub fn flags(&self) -> u32 {
        get_u32(&self.data, OFF_PAGE_FLAGS)
    }

    pub fn set_flag(&mut self, flag: u32) {
        let f = self.flags() | flag;
        put_u32(&mut self.data, OFF_PAGE_FLAGS, f);
    }

    pub fn clear_flag(&mut self, flag: u32) {
        let f = self.flags() & !flag;
        put_u32(&mut self.data, OFF_PAGE_FLAGS, f);
    }

    pub fn is_to_be_deleted(&self) -> bool {
        self.flags() & page_flags::TO_BE_DELETED != 0
    }

    pub fn foster_child(&self) -> Option<PageId> {
        let raw = get_u64(&self.data, OFF_FOSTER_CHILD);
        if raw == 0 {
            None
        } else {
            Some(PageId::from_u64(raw))
        }
    }

    pub fn set_foster_child_pid(&mut self, pid: Option<PageId>) {
        let raw = pid.map(|p| p.to_u64()).unwrap_or(0);
        put_u64(&mut self.data, OFF_FOSTER_CHILD, raw);
    }

    pub fn foster_emlsn(&self) -> Lsn {
        Lsn::from_u64(get_u64(&self.data, OFF_FOSTER_EMLSN))
    }

    pub fn set_foster_emlsn(&mut self, lsn: Lsn) {
        put_u64(&mut self.data, OFF_FOSTER_EMLSN, lsn.to_u64());
    }

    // --- checksum ---

    pub fn stored_checksum(&self) -> u64 {
        get_u64(&self.data, OFF_CHECKSUM)
    }

    pub fn computed_checksum(&self) -> u64 {
        checksum64(&self.data[8..])
    }

    pub fn update_checksum(&mut self) {
        let sum = self.computed_checksum();
        put_u64(&mut self.data, OFF_CHECKSUM, sum);
    }

    pub fn checksum_ok(&self) -> bool {
        self.stored_checksum() == self.computed_checksum()
    }
}

/// 64-bit fold across a byte slice. Not cryptographic; detects torn
/// writes and bit rot.
pub fn checksum64(buf: &[u8]) -> u64 {
    let mut acc: u64 = 0x9e37_79b9_7f4a_7c15;
    for chunk in buf.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        acc = (acc ^ u64::from_le_bytes(word))
            .rotate_left(13)
            .wrapping_mul(0x2545_f491_4f6c_dd1d);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_detects_flip() {
        let mut page = PageBuf::new();
        page.set_pid(PageId::new(1, 42));
        page.update_checksum();
        assert!(page.checksum_ok());

        let body_off = PAGE_HEADER_SIZE + 10;
        page.bytes_mut()[body_off] ^= 0xff;
        assert!(!page.checksum_ok());
    }

    #[test]
    fn test_header_round_trip() {
        let mut page = PageBuf::new();
        let pid = PageId::new(3, 7);
        page.set_pid(pid);
        page.set_store(5);
        page.set_tag(tag::T_BTREE);
        page.set_level(2);
        page.set_foster_child_pid(Some(PageId::new(3, 8)));
        assert_eq!(page.pid(), pid);
        assert_eq!(page.store(), 5);
        assert_eq!(page.tag(), tag::T_BTREE);
        assert_eq!(page.level(), 2);
        assert_eq!(page.foster_child(), Some(PageId::new(3, 8)));
    }
}
