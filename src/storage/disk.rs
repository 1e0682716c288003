// File and page layer: fixed-size page I/O on a single database file.
//
// Page 0 is the database header (magic, page size, format version, page
// count, free-list head, schema version, checksum). Free pages form a
// singly linked list threaded through their link field and anchored in
// the header. All header integers are big-endian; row payloads inside
// cells are little-endian and none of this layer's business.

use crate::common::{PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageType};
use log::debug;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// 16-byte file marker, distinct from other engines.
pub const MAGIC: [u8; 16] = *b"anchordb-file-1\0";

/// On-disk format version stamped into the header.
pub const FORMAT_VERSION: u32 = 1;

/// Smallest page that can hold the header plus a useful cell area.
pub const MIN_PAGE_SIZE: usize = 512;

/// Slot offsets are u16, so pages cannot exceed 32 KiB.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Parsed copy of page 0.
#[derive(Debug, Clone)]
pub struct DatabaseHeader {
    pub page_size: u32,
    pub format_version: u32,
    pub page_count: u32,
    pub free_list_head: PageId,
    pub schema_version: u32,
}

impl DatabaseHeader {
    const CHECKSUM_OFFSET: usize = 36;

    fn encode(&self, buf: &mut [u8]) {
        buf[..16].copy_from_slice(&MAGIC);
        buf[16..20].copy_from_slice(&self.page_size.to_be_bytes());
        buf[20..24].copy_from_slice(&self.format_version.to_be_bytes());
        buf[24..28].copy_from_slice(&self.page_count.to_be_bytes());
        buf[28..32].copy_from_slice(&self.free_list_head.to_be_bytes());
        buf[32..36].copy_from_slice(&self.schema_version.to_be_bytes());
        let crc = crc32fast::hash(&buf[..Self::CHECKSUM_OFFSET]);
        buf[36..40].copy_from_slice(&crc.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf[..16] != MAGIC {
            return Err(DbError::Corrupt(0, "bad magic".into()));
        }
        let stored = u32::from_be_bytes(buf[36..40].try_into().unwrap());
        let actual = crc32fast::hash(&buf[..Self::CHECKSUM_OFFSET]);
        if stored != actual {
            return Err(DbError::Corrupt(0, "header checksum mismatch".into()));
        }
        Ok(Self {
            page_size: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            format_version: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            page_count: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            free_list_head: u32::from_be_bytes(buf[28..32].try_into().unwrap()),
            schema_version: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
        })
    }
}

struct DiskInner {
    file: File,
    header: DatabaseHeader,
}

/// Thread-safe page I/O on one file. A single internal mutex serializes
/// every operation; callers layer caching and locking above this.
pub struct DiskManager {
    inner: Mutex<DiskInner>,
    page_size: usize,
    path: PathBuf,
}

impl DiskManager {
    /// Open an existing database file or create a new one.
    ///
    /// On an existing file `page_size` must match the size recorded in
    /// page 0; on a fresh file it becomes the database's page size for
    /// the rest of its life.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(DbError::Storage(format!(
                "page size {} out of range [{}, {}] or not a power of two",
                page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();

        let header = if len == 0 {
            let header = DatabaseHeader {
                page_size: page_size as u32,
                format_version: FORMAT_VERSION,
                page_count: 1,
                free_list_head: INVALID_PAGE_ID,
                schema_version: 0,
            };
            let mut buf = vec![0u8; page_size];
            header.encode(&mut buf);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buf)?;
            file.sync_all()?;
            header
        } else {
            let mut buf = vec![0u8; page_size];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header = DatabaseHeader::decode(&buf)?;
            if header.page_size as usize != page_size {
                return Err(DbError::Storage(format!(
                    "configured page size {} does not match file page size {}",
                    page_size, header.page_size
                )));
            }
            if header.format_version != FORMAT_VERSION {
                return Err(DbError::Storage(format!(
                    "unsupported format version {}",
                    header.format_version
                )));
            }
            header
        };

        Ok(Self {
            inner: Mutex::new(DiskInner { file, header }),
            page_size,
            path,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> u32 {
        self.inner.lock().header.page_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.inner.lock().header.schema_version
    }

    /// Bump the schema version and persist the header. Returns the new
    /// value. Called once per successful DDL.
    pub fn bump_schema_version(&self) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.header.schema_version += 1;
        let version = inner.header.schema_version;
        Self::write_header(&mut inner, self.page_size)?;
        Ok(version)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut inner = self.inner.lock();
        if page_id >= inner.header.page_count {
            return Err(DbError::Storage(format!(
                "read of page {} beyond end of file ({} pages)",
                page_id, inner.header.page_count
            )));
        }
        let mut page = Page::new(page_id, self.page_size);
        let offset = page_id as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(page.data_mut())?;
        Ok(page)
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        debug_assert_eq!(page.data().len(), self.page_size);
        let mut inner = self.inner.lock();
        if page.id() >= inner.header.page_count {
            return Err(DbError::Storage(format!(
                "write of unallocated page {}",
                page.id()
            )));
        }
        let offset = page.id() as u64 * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(page.data())?;
        Ok(())
    }

    /// Pop a page off the free list, or extend the file by one page.
    /// Contents of reused pages are undefined; callers must initialize.
    pub fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let page_id = if inner.header.free_list_head != INVALID_PAGE_ID {
            let id = inner.header.free_list_head;
            let offset = id as u64 * self.page_size as u64;
            let mut buf = vec![0u8; self.page_size];
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.file.read_exact(&mut buf)?;
            inner.header.free_list_head = u32::from_be_bytes(buf[2..6].try_into().unwrap());
            id
        } else {
            let id = inner.header.page_count;
            inner.header.page_count += 1;
            let zero = vec![0u8; self.page_size];
            let offset = id as u64 * self.page_size as u64;
            let extended = inner
                .file
                .seek(SeekFrom::Start(offset))
                .and_then(|_| inner.file.write_all(&zero));
            match extended {
                Ok(()) => id,
                Err(e) => {
                    inner.header.page_count -= 1;
                    return Err(DbError::OutOfSpace(format!(
                        "cannot extend database file: {}",
                        e
                    )));
                }
            }
        };
        Self::write_header(&mut inner, self.page_size)?;
        debug!("allocated page {}", page_id);
        Ok(page_id)
    }

    /// Push a page onto the free list. Contents are not zeroed; only the
    /// page type and link field are rewritten.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<()> {
        let mut inner = self.inner.lock();
        if page_id == 0 || page_id >= inner.header.page_count {
            return Err(DbError::Storage(format!(
                "deallocate of invalid page {}",
                page_id
            )));
        }
        let offset = page_id as u64 * self.page_size as u64;
        let mut page = Page::new(page_id, self.page_size);
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.read_exact(page.data_mut())?;
        page.set_page_type(PageType::Free);
        let head = inner.header.free_list_head;
        page.data_mut()[2..6].copy_from_slice(&head.to_be_bytes());
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(page.data())?;
        inner.header.free_list_head = page_id;
        Self::write_header(&mut inner, self.page_size)?;
        debug!("freed page {}", page_id);
        Ok(())
    }

    /// Flush OS buffers. Must complete before commit reports success.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }

    fn write_header(inner: &mut DiskInner, page_size: usize) -> Result<()> {
        let mut buf = vec![0u8; page_size];
        inner.header.encode(&mut buf);
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_disk(dir: &tempfile::TempDir) -> DiskManager {
        DiskManager::open(dir.path().join("test.adb"), 4096).unwrap()
    }

    #[test]
    fn test_create_and_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.adb");
        {
            let dm = DiskManager::open(&path, 4096)?;
            assert_eq!(dm.page_count(), 1);
            assert_eq!(dm.schema_version(), 0);
        }
        let dm = DiskManager::open(&path, 4096)?;
        assert_eq!(dm.page_count(), 1);
        Ok(())
    }

    #[test]
    fn test_page_size_must_match() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.adb");
        DiskManager::open(&path, 4096).unwrap();
        assert!(DiskManager::open(&path, 8192).is_err());
    }

    #[test]
    fn test_page_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = open_disk(&dir);
        let id = dm.allocate_page()?;
        let mut page = Page::new(id, 4096);
        page.data_mut()[100] = 0xAB;
        dm.write_page(&page)?;
        let back = dm.read_page(id)?;
        assert_eq!(back.data()[100], 0xAB);
        Ok(())
    }

    #[test]
    fn test_free_list_reuse() -> Result<()> {
        let dir = tempdir().unwrap();
        let dm = open_disk(&dir);
        let a = dm.allocate_page()?;
        let b = dm.allocate_page()?;
        assert_ne!(a, b);
        dm.deallocate_page(a)?;
        dm.deallocate_page(b)?;
        // LIFO: b comes back first, then a, then a fresh extension.
        assert_eq!(dm.allocate_page()?, b);
        assert_eq!(dm.allocate_page()?, a);
        let c = dm.allocate_page()?;
        assert_eq!(c, b + 1);
        Ok(())
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.adb");
        DiskManager::open(&path, 4096).unwrap();
        // Flip a byte inside the checksummed region.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();
        match DiskManager::open(&path, 4096) {
            Err(DbError::Corrupt(0, _)) => {}
            other => panic!("expected corrupt header, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_schema_version_persists() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.adb");
        {
            let dm = DiskManager::open(&path, 4096)?;
            dm.bump_schema_version()?;
            dm.bump_schema_version()?;
        }
        let dm = DiskManager::open(&path, 4096)?;
        assert_eq!(dm.schema_version(), 2);
        Ok(())
    }
}
