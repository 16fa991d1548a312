use bit_vec::BitVec;
use log::debug;

use crate::{
    error::DbError,
    types::DbResult,
    vol::{tag, volume::bits_per_page, PageBuf, PageId, Volume, PAGE_HEADER_SIZE},
};

/// In-memory image of the volume's allocation bitmap pages.
///
/// One bit per page, least significant bit first within each byte; bit
/// set means allocated. Mutations are logged by the caller as system
/// transactions (`alloc_a_page` and friends), so every change here is
/// redoable from the page id in the record alone.
pub struct AllocCache {
    bits: BitVec,
    num_pages: u32,
    first_data_page: u32,
    /// Search hint: no free page below this.
    hint: u32,
}

impl AllocCache {
    /// Rebuild the cache from the volume's bitmap pages.
    pub fn load(volume: &Volume) -> Result<AllocCache, DbError> {
        let num_pages = volume.num_pages();
        let mut bits = BitVec::from_elem(num_pages as usize, false);

        let per_page = bits_per_page();
        let mut page = PageBuf::new();
        for (idx, bitmap_pno) in volume.alloc_page_range().enumerate() {
            volume.read_page(PageId::new(volume.vid(), bitmap_pno), &mut page)?;
            let body = &page.bytes()[PAGE_HEADER_SIZE..];
            let base = idx * per_page;
            for bit in 0..per_page {
                if base + bit >= num_pages as usize {
                    break;
                }
                let byte = body[bit / 8];
                if byte & (1 << (bit % 8)) != 0 {
                    bits.set(base + bit, true);
                }
            }
        }

        // header pages are permanently allocated
        for pno in 0..volume.first_data_page() {
            bits.set(pno as usize, true);
        }

        let first_data_page = volume.first_data_page();
        Ok(AllocCache {
            bits,
            num_pages,
            first_data_page,
            hint: first_data_page,
        })
    }

    pub fn is_allocated(&self, page_no: u32) -> bool {
        self.bits.get(page_no as usize).unwrap_or(false)
    }

    pub fn allocated_count(&self) -> usize {
        self.bits.iter().filter(|b| *b).count()
    }

    /// Find and claim one free page. The caller logs `alloc_a_page`
    /// before the claim becomes visible to anyone else.
    pub fn alloc_page(&mut self) -> Result<u32, DbError> {
        for pno in self.hint..self.num_pages {
            if !self.bits[pno as usize] {
                self.bits.set(pno as usize, true);
                self.hint = pno + 1;
                return Ok(pno);
            }
        }
        Err(DbError::out_of_space("no free page in volume"))
    }

    /// Claim `count` consecutive pages, first-fit.
    pub fn alloc_consecutive(&mut self, count: u32) -> Result<u32, DbError> {
        let mut run_start = self.first_data_page;
        let mut run_len = 0u32;
        for pno in self.first_data_page..self.num_pages {
            if self.bits[pno as usize] {
                run_start = pno + 1;
                run_len = 0;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for p in run_start..run_start + count {
                    self.bits.set(p as usize, true);
                }
                return Ok(run_start);
            }
        }
        Err(DbError::out_of_space(&format!(
            "no run of {} consecutive free pages",
            count
        )))
    }

    pub fn dealloc_page(&mut self, page_no: u32) {
        assert!(
            page_no >= self.first_data_page,
            "deallocating header page {}",
            page_no
        );
        self.bits.set(page_no as usize, false);
        if page_no < self.hint {
            self.hint = page_no;
        }
        debug!("deallocated page {}", page_no);
    }

    /// REDO entry points: idempotent bit set/clear from the log record's
    /// page id.
    pub fn apply_alloc(&mut self, page_no: u32, count: u32) {
        for p in page_no..page_no + count {
            self.bits.set(p as usize, true);
        }
        if self.hint <= page_no {
            self.hint = page_no + count;
        }
    }

    pub fn apply_dealloc(&mut self, page_no: u32) {
        self.bits.set(page_no as usize, false);
        if page_no < self.hint && page_no >= self.first_data_page {
            self.hint = page_no;
        }
    }

    /// Write the bitmap back to its pages. Called under checkpoint and
    /// at clean shutdown; the WAL must already be durable past the last
    /// allocation record.
    pub fn flush(&self, volume: &Volume) -> DbResult {
        let per_page = bits_per_page();
        for (idx, bitmap_pno) in volume.alloc_page_range().enumerate() {
            let pid = PageId::new(volume.vid(), bitmap_pno);
            let mut page = PageBuf::new();
            page.set_pid(pid);
            page.set_tag(tag::T_ALLOC);

            let base = idx * per_page;
            {
                let body = &mut page.bytes_mut()[PAGE_HEADER_SIZE..];
                for bit in 0..per_page {
                    if base + bit >= self.num_pages as usize {
                        break;
                    }
                    if self.bits[base + bit] {
                        body[bit / 8] |= 1 << (bit % 8);
                    }
                }
            }
            page.update_checksum();
            volume.write_page(pid, &page)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume(name: &str, pages: u32) -> Volume {
        let dir = std::env::temp_dir().join(format!("foster-alloc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        Volume::format(&path, 1, pages).unwrap()
    }

    #[test]
    fn test_alloc_dealloc_round_trip() {
        let vol = test_volume("alloc-rt.db", 256);
        let mut cache = AllocCache::load(&vol).unwrap();

        let a = cache.alloc_page().unwrap();
        let b = cache.alloc_page().unwrap();
        assert_eq!(b, a + 1);
        assert!(cache.is_allocated(a));

        cache.dealloc_page(a);
        assert!(!cache.is_allocated(a));
        // freed page is reused first
        assert_eq!(cache.alloc_page().unwrap(), a);
    }

    #[test]
    fn test_alloc_survives_flush() {
        let vol = test_volume("alloc-flush.db", 256);
        let mut cache = AllocCache::load(&vol).unwrap();
        let a = cache.alloc_page().unwrap();
        let _ = cache.alloc_consecutive(4).unwrap();
        cache.flush(&vol).unwrap();

        let reloaded = AllocCache::load(&vol).unwrap();
        assert!(reloaded.is_allocated(a));
        assert_eq!(reloaded.allocated_count(), cache.allocated_count());
    }

    #[test]
    fn test_consecutive_run() {
        let vol = test_volume("alloc-consec.db", 256);
        let mut cache = AllocCache::load(&vol).unwrap();
        let start = cache.alloc_consecutive(8).unwrap();
        for p in start..start + 8 {
            assert!(cache.is_allocated(p));
        }
    }
}
