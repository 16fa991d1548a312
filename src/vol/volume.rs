use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::{
    error::DbError,
    io::{get_u32, get_u64, put_u32, put_u64, DbFile},
    types::DbResult,
    utils::ceil_div,
    vol::{get_page_size, PageBuf, PageId, VolumeId},
};

const VOLUME_MAGIC: u64 = 0x464f_5354_4552_4442; // "FOSTERDB"
const VOLUME_VERSION: u32 = 1;

/// Sector-safe offset of the replicated header copy inside page 0.
const HEADER_COPY_OFFSET: usize = 4096;

/// Bits available per allocation bitmap page (the generic header is
/// left in place so bitmap pages carry pid/tag/checksum like any other
/// page).
pub fn bits_per_page() -> usize {
    (get_page_size() - super::PAGE_HEADER_SIZE) * 8
}

/// The volume header, written twice inside page 0.
///
/// On-disk layout per copy: magic u64, version u32, vid u32, num_pages
/// u32, hdr_pages u32, alloc_start u32, stnode_pid u32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeHeader {
    pub vid: VolumeId,
    pub num_pages: u32,
    pub hdr_pages: u32,
    pub alloc_start: u32,
    pub stnode_pid: u32,
}

impl VolumeHeader {
    fn write_to(&self, buf: &mut [u8], offset: usize) {
        put_u64(buf, offset, VOLUME_MAGIC);
        put_u32(buf, offset + 8, VOLUME_VERSION);
        put_u32(buf, offset + 12, self.vid);
        put_u32(buf, offset + 16, self.num_pages);
        put_u32(buf, offset + 20, self.hdr_pages);
        put_u32(buf, offset + 24, self.alloc_start);
        put_u32(buf, offset + 28, self.stnode_pid);
    }

    fn read_from(buf: &[u8], offset: usize) -> Option<VolumeHeader> {
        if get_u64(buf, offset) != VOLUME_MAGIC {
            return None;
        }
        if get_u32(buf, offset + 8) != VOLUME_VERSION {
            return None;
        }
        Some(VolumeHeader {
            vid: get_u32(buf, offset + 12),
            num_pages: get_u32(buf, offset + 16),
            hdr_pages: get_u32(buf, offset + 20),
            alloc_start: get_u32(buf, offset + 24),
            stnode_pid: get_u32(buf, offset + 28),
        })
    }
}

/// The page store: maps page ids to disk offsets and performs whole-page
/// reads and grouped writes. Allocation state lives in `AllocCache`,
/// store roots in `StoreTable`; both persist through pages owned by this
/// volume.
pub struct Volume {
    path: PathBuf,
    file: DbFile,
    header: VolumeHeader,

    // fake-latency knobs for testing
    pub read_delay_ms: u64,
    pub write_delay_ms: u64,
}

impl Volume {
    /// Create and format a new volume file. Layout: page 0 header,
    /// pages `1..=K` allocation bitmaps, page `K+1` the store table,
    /// data pages after that.
    pub fn format<P: AsRef<Path>>(path: P, vid: VolumeId, num_pages: u32) -> Result<Volume, DbError> {
        let page_size = get_page_size();
        let alloc_pages = ceil_div(num_pages as usize, bits_per_page()) as u32;
        let stnode_pid = 1 + alloc_pages;
        let hdr_pages = stnode_pid + 1;

        let header = VolumeHeader {
            vid,
            num_pages,
            hdr_pages,
            alloc_start: 1,
            stnode_pid,
        };

        let file = DbFile::open(&path)?;
        file.set_len(num_pages as u64 * page_size as u64)?;

        // page 0: replicated header
        let mut page0 = vec![0u8; page_size];
        header.write_to(&mut page0, 0);
        header.write_to(&mut page0, HEADER_COPY_OFFSET);
        file.write_at(0, &page0)?;

        // bitmap pages and the stnode page start zeroed; their generic
        // headers are stamped on first write-back
        file.sync()?;

        debug!(
            "formatted volume {} at {:?}: {} pages, {} bitmap pages, stnode at {}",
            vid,
            path.as_ref(),
            num_pages,
            alloc_pages,
            stnode_pid
        );

        Ok(Volume {
            path: path.as_ref().to_path_buf(),
            file,
            header,
            read_delay_ms: 0,
            write_delay_ms: 0,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Volume, DbError> {
        let page_size = get_page_size();
        let file = DbFile::open(&path)?;

        let mut page0 = vec![0u8; page_size];
        file.read_at(0, &mut page0)?;

        let header = match VolumeHeader::read_from(&page0, 0) {
            Some(h) => h,
            None => {
                // primary copy torn; fall back to the replica
                warn!("volume header primary copy unreadable, trying replica");
                VolumeHeader::read_from(&page0, HEADER_COPY_OFFSET)
                    .ok_or_else(|| DbError::storage("volume header corrupt in both copies"))?
            }
        };

        Ok(Volume {
            path: path.as_ref().to_path_buf(),
            file,
            header,
            read_delay_ms: 0,
            write_delay_ms: 0,
        })
    }

    pub fn vid(&self) -> VolumeId {
        self.header.vid
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_pages(&self) -> u32 {
        self.header.num_pages
    }

    /// First page number usable for data.
    pub fn first_data_page(&self) -> u32 {
        self.header.hdr_pages
    }

    pub fn stnode_pid(&self) -> PageId {
        PageId::new(self.header.vid, self.header.stnode_pid)
    }

    pub fn alloc_page_range(&self) -> std::ops::Range<u32> {
        self.header.alloc_start..self.header.stnode_pid
    }

    fn offset_of(&self, pid: PageId) -> Result<u64, DbError> {
        if pid.vid != self.header.vid {
            panic!("page {} is not on volume {}", pid, self.header.vid);
        }
        if pid.page_no >= self.header.num_pages {
            return Err(DbError::storage(&format!(
                "page {} beyond volume end ({} pages)",
                pid, self.header.num_pages
            )));
        }
        Ok(pid.page_no as u64 * get_page_size() as u64)
    }

    /// Read one page. The caller validates the checksum; a mismatch is
    /// the single-page-recovery trigger, not an I/O error.
    pub fn read_page(&self, pid: PageId, buf: &mut PageBuf) -> DbResult {
        if self.read_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.read_delay_ms));
        }
        let offset = self.offset_of(pid)?;
        self.file.read_at(offset, buf.bytes_mut())
    }

    pub fn write_page(&self, pid: PageId, buf: &PageBuf) -> DbResult {
        if self.write_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(self.write_delay_ms));
        }
        let offset = self.offset_of(pid)?;
        self.file.write_at(offset, buf.bytes())
    }

    /// Grouped write. Consecutive pids are not coalesced here; the OS
    /// page cache absorbs the pattern well enough.
    pub fn write_many(&self, pages: &[(PageId, &PageBuf)]) -> DbResult {
        for (pid, buf) in pages {
            self.write_page(*pid, buf)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> DbResult {
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_then_open() {
        let dir = std::env::temp_dir().join(format!("foster-vol-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vol-fmt.db");
        let _ = std::fs::remove_file(&path);

        let vol = Volume::format(&path, 1, 128).unwrap();
        let header = *vol.header();
        drop(vol);

        let vol = Volume::open(&path).unwrap();
        assert_eq!(*vol.header(), header);
        assert_eq!(vol.vid(), 1);
        assert!(vol.first_data_page() >= 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_page_round_trip() {
        let dir = std::env::temp_dir().join(format!("foster-vol-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("vol-rw.db");
        let _ = std::fs::remove_file(&path);

        let vol = Volume::format(&path, 1, 64).unwrap();
        let pid = PageId::new(1, vol.first_data_page());

        let mut page = PageBuf::new();
        page.set_pid(pid);
        page.bytes_mut()[100] = 0xab;
        page.update_checksum();
        vol.write_page(pid, &page).unwrap();

        let mut back = PageBuf::new();
        vol.read_page(pid, &mut back).unwrap();
        assert!(back.checksum_ok());
        assert_eq!(back.pid(), pid);
        assert_eq!(back.bytes()[100], 0xab);

        std::fs::remove_file(&path).unwrap();
    }
}
