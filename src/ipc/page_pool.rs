//! Capacity-bounded page pool shared across processes.
//!
//! The pool is a formatted file: a fixed header, a free-stack of page
//! numbers, a per-page state byte map, then the page bytes themselves.
//! Every multi-field mutation happens under an exclusive advisory lock on
//! the pool file; cooperating processes see each other's updates through
//! the shared page cache. All fields are explicit little-endian at named
//! offsets; there is no unsafe reinterpretation anywhere.
//!
//! Lifecycle: the master process formats the file and holds the one
//! `PoolOwner` token; workers `attach` and get `PagePool` handles that
//! only detach. `destroy` refuses to run while attachments remain.

use std::collections::hash_map::DefaultHasher;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};

use fs2::FileExt as _;
use thiserror::Error;
use tracing::warn;

use crate::error::{Effect, Transience};

const MAGIC: [u8; 8] = *b"REMORAPG";
const VERSION: u32 = 1;

/// Byte offsets for the pool header.
mod offsets {
    /// `[u8;8]` - `"REMORAPG"`.
    pub const MAGIC: u64 = 0;

    /// `u32` - layout version.
    pub const VERSION: u64 = 8;

    /// `u32` - bytes per page.
    pub const PAGE_SIZE: u64 = 12;

    /// `u32` - total pages in the pool.
    pub const CAPACITY: u64 = 16;

    /// `u32` - entries currently on the free stack.
    pub const FREE_TOP: u64 = 20;

    /// `u32` - live worker attachments.
    pub const ATTACH_COUNT: u64 = 24;

    /// `u32` - pool tag, stamped into every `PageId`.
    pub const POOL_TAG: u64 = 28;

    /// Free stack (`capacity` u32 entries) starts here.
    pub const HEADER_LEN: u64 = 4096;
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("page pool io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("page pool {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("page pool {path} still has {attached} attached workers")]
    Busy { path: PathBuf, attached: u32 },

    #[error("page pool capacity must be at least one page")]
    ZeroCapacity,
}

impl PoolError {
    pub fn transience(&self) -> Transience {
        match self {
            PoolError::Io { .. } => Transience::Unknown,
            PoolError::Corrupt { .. } => Transience::Permanent,
            PoolError::Busy { .. } => Transience::Retryable,
            PoolError::ZeroCapacity => Transience::Permanent,
        }
    }

    pub fn effect(&self) -> Effect {
        match self {
            PoolError::Io { .. } => Effect::Unknown,
            _ => Effect::None,
        }
    }
}

/// A checked-out page: its number plus the tag of the pool it came from.
/// Owned by exactly one holder until `put` back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageId {
    pub pool: u32,
    pub number: u32,
}

/// Owner token for one pool file. Non-clonable; whoever holds it formats
/// the pool and is responsible for destroying it. One per pool id.
pub struct PoolOwner {
    path: PathBuf,
    file: File,
    destroyed: bool,
}

/// A worker's attachment to the pool.
pub struct PagePool {
    path: PathBuf,
    file: File,
    page_size: u32,
    capacity: u32,
    tag: u32,
    detached: bool,
}

fn io_err(path: &Path, source: io::Error) -> PoolError {
    PoolError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> PoolError {
    PoolError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn pool_tag(path: &Path) -> u32 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish() as u32
}

fn read_u32_at(file: &File, path: &Path, offset: u64) -> Result<u32, PoolError> {
    let mut buf = [0u8; 4];
    file.read_exact_at(&mut buf, offset)
        .map_err(|e| io_err(path, e))?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u32_at(file: &File, path: &Path, offset: u64, value: u32) -> Result<(), PoolError> {
    file.write_all_at(&value.to_le_bytes(), offset)
        .map_err(|e| io_err(path, e))
}

/// Exclusive advisory lock, released on drop.
struct FileLock<'a>(&'a File);

impl<'a> FileLock<'a> {
    fn acquire(file: &'a File, path: &Path) -> Result<Self, PoolError> {
        file.lock_exclusive().map_err(|e| io_err(path, e))?;
        Ok(FileLock(file))
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

fn stack_slot(index: u32) -> u64 {
    offsets::HEADER_LEN + u64::from(index) * 4
}

fn state_offset(capacity: u32, number: u32) -> u64 {
    offsets::HEADER_LEN + u64::from(capacity) * 4 + u64::from(number)
}

fn pages_offset(capacity: u32) -> u64 {
    offsets::HEADER_LEN + u64::from(capacity) * 5
}

impl PoolOwner {
    /// Format `path` as a pool of `capacity` pages of `page_size` bytes.
    /// Re-initializing an existing file reformats it; stale pools left by
    /// a crashed master are reclaimed this way.
    pub fn init(path: &Path, capacity: u32, page_size: u32) -> Result<PoolOwner, PoolError> {
        if capacity == 0 || page_size == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        let total = pages_offset(capacity) + u64::from(capacity) * u64::from(page_size);
        file.set_len(total).map_err(|e| io_err(path, e))?;

        let mut header = [0u8; 32];
        header[0..8].copy_from_slice(&MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&page_size.to_le_bytes());
        header[16..20].copy_from_slice(&capacity.to_le_bytes());
        header[20..24].copy_from_slice(&capacity.to_le_bytes()); // free_top: all free
        header[24..28].copy_from_slice(&0u32.to_le_bytes()); // attach_count
        header[28..32].copy_from_slice(&pool_tag(path).to_le_bytes());
        file.write_all_at(&header, offsets::MAGIC)
            .map_err(|e| io_err(path, e))?;

        // free stack holds every page; state bytes are already zero (free)
        let mut stack = Vec::with_capacity(capacity as usize * 4);
        for number in 0..capacity {
            stack.extend_from_slice(&number.to_le_bytes());
        }
        file.write_all_at(&stack, offsets::HEADER_LEN)
            .map_err(|e| io_err(path, e))?;
        file.sync_all().map_err(|e| io_err(path, e))?;

        Ok(PoolOwner {
            path: path.to_path_buf(),
            file,
            destroyed: false,
        })
    }

    /// Remove the pool. Fails while worker attachments remain.
    pub fn destroy(&mut self) -> Result<(), PoolError> {
        if self.destroyed {
            return Ok(());
        }
        let attached = {
            let _lock = FileLock::acquire(&self.file, &self.path)?;
            read_u32_at(&self.file, &self.path, offsets::ATTACH_COUNT)?
        };
        if attached > 0 {
            return Err(PoolError::Busy {
                path: self.path.clone(),
                attached,
            });
        }
        std::fs::remove_file(&self.path).map_err(|e| io_err(&self.path, e))?;
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for PoolOwner {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(target: "ipc", "failed to destroy page pool: {e}");
        }
    }
}

impl PagePool {
    /// Attach to a pool the owner has already initialized.
    pub fn attach(path: &Path) -> Result<PagePool, PoolError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        let mut header = [0u8; 32];
        file.read_exact_at(&mut header, offsets::MAGIC)
            .map_err(|e| io_err(path, e))?;
        if header[0..8] != MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != VERSION {
            return Err(corrupt(path, format!("unsupported version {version}")));
        }
        let page_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let capacity = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        if page_size == 0 || capacity == 0 {
            return Err(corrupt(path, "zero page size or capacity"));
        }
        let tag = u32::from_le_bytes([header[28], header[29], header[30], header[31]]);

        let expected = pages_offset(capacity) + u64::from(capacity) * u64::from(page_size);
        let actual = file.metadata().map_err(|e| io_err(path, e))?.len();
        if actual < expected {
            return Err(corrupt(
                path,
                format!("file is {actual} bytes, layout needs {expected}"),
            ));
        }

        {
            let _lock = FileLock::acquire(&file, path)?;
            let attached = read_u32_at(&file, path, offsets::ATTACH_COUNT)?;
            write_u32_at(&file, path, offsets::ATTACH_COUNT, attached + 1)?;
        }

        Ok(PagePool {
            path: path.to_path_buf(),
            file,
            page_size,
            capacity,
            tag,
            detached: false,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Free pages remaining right now; an instantaneous snapshot.
    pub fn size(&self) -> Result<u32, PoolError> {
        read_u32_at(&self.file, &self.path, offsets::FREE_TOP)
    }

    /// Check a page out of the pool, or None when the pool is exhausted.
    pub fn get(&mut self) -> Result<Option<PageId>, PoolError> {
        let _lock = FileLock::acquire(&self.file, &self.path)?;
        let top = read_u32_at(&self.file, &self.path, offsets::FREE_TOP)?;
        if top == 0 {
            return Ok(None);
        }
        if top > self.capacity {
            return Err(corrupt(
                &self.path,
                format!("free stack top {top} exceeds capacity {}", self.capacity),
            ));
        }
        let number = read_u32_at(&self.file, &self.path, stack_slot(top - 1))?;
        if number >= self.capacity {
            return Err(corrupt(&self.path, format!("free page {number} out of range")));
        }
        write_u32_at(&self.file, &self.path, offsets::FREE_TOP, top - 1)?;
        self.file
            .write_all_at(&[1], state_offset(self.capacity, number))
            .map_err(|e| io_err(&self.path, e))?;
        Ok(Some(PageId {
            pool: self.tag,
            number,
        }))
    }

    /// Return a page. Returning a page this pool does not recognize as
    /// checked out is a programmer error.
    pub fn put(&mut self, page: PageId) -> Result<(), PoolError> {
        assert_eq!(
            page.pool, self.tag,
            "page {page:?} returned to the wrong pool"
        );
        assert!(
            page.number < self.capacity,
            "page {} out of range for capacity {}",
            page.number,
            self.capacity
        );
        let _lock = FileLock::acquire(&self.file, &self.path)?;
        let mut state = [0u8; 1];
        self.file
            .read_exact_at(&mut state, state_offset(self.capacity, page.number))
            .map_err(|e| io_err(&self.path, e))?;
        assert_eq!(state[0], 1, "page {} is not checked out", page.number);

        let top = read_u32_at(&self.file, &self.path, offsets::FREE_TOP)?;
        if top >= self.capacity {
            return Err(corrupt(&self.path, "free stack overflow"));
        }
        self.file
            .write_all_at(&[0], state_offset(self.capacity, page.number))
            .map_err(|e| io_err(&self.path, e))?;
        write_u32_at(&self.file, &self.path, stack_slot(top), page.number)?;
        write_u32_at(&self.file, &self.path, offsets::FREE_TOP, top + 1)?;
        Ok(())
    }

    /// Read from a checked-out page into `buf`, which must fit in one page.
    pub fn read_page(&self, page: PageId, buf: &mut [u8]) -> Result<(), PoolError> {
        self.check_page_access(page, buf.len());
        self.file
            .read_exact_at(buf, self.page_start(page))
            .map_err(|e| io_err(&self.path, e))
    }

    /// Write `data` at the start of a checked-out page.
    pub fn write_page(&self, page: PageId, data: &[u8]) -> Result<(), PoolError> {
        self.check_page_access(page, data.len());
        self.file
            .write_all_at(data, self.page_start(page))
            .map_err(|e| io_err(&self.path, e))
    }

    fn check_page_access(&self, page: PageId, len: usize) {
        assert_eq!(page.pool, self.tag, "page {page:?} is from another pool");
        assert!(page.number < self.capacity, "page {} out of range", page.number);
        assert!(
            len <= self.page_size as usize,
            "access of {len} bytes exceeds page size {}",
            self.page_size
        );
    }

    fn page_start(&self, page: PageId) -> u64 {
        pages_offset(self.capacity) + u64::from(page.number) * u64::from(self.page_size)
    }

    /// Drop this worker's attachment.
    pub fn detach(&mut self) -> Result<(), PoolError> {
        if self.detached {
            return Ok(());
        }
        let _lock = FileLock::acquire(&self.file, &self.path)?;
        let attached = read_u32_at(&self.file, &self.path, offsets::ATTACH_COUNT)?;
        write_u32_at(
            &self.file,
            &self.path,
            offsets::ATTACH_COUNT,
            attached.saturating_sub(1),
        )?;
        self.detached = true;
        Ok(())
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!(target: "ipc", "failed to detach from page pool: {e}");
        }
    }
}
