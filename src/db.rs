//! Database Module
//!
//! Owns the file, its memory map, the free list and the transaction
//! bookkeeping.
//!
//! ## Responsibilities
//! - Create and validate the database file
//! - Map the file read-only and remap it as it grows
//! - Hand out one writer at a time and any number of readers
//! - Release pages once no reader can observe them
//!
//! ## Concurrency Model: Single-Writer / Multiple-Reader (SWMR)
//!
//! - **Writer permit**: held from `begin_write` until commit/rollback
//! - **state** (Mutex): meta, free list, open readers, stats
//! - **mmap** (RwLock): shared for every page read, exclusive for a remap
//!
//! Lock order is writer permit → state → mmap. Page reads hold the mmap
//! lock only while a closure inspects the page, so readers never block a
//! remap for longer than one lookup, and no borrowed page outlives it.
//!
//! ## File Layout
//! ```text
//! ┌────────┬────────┬──────────┬──────────┬─────────────────────────┐
//! │ meta 0 │ meta 1 │ freelist │ root leaf│ branch/leaf/overflow ... │
//! └────────┴────────┴──────────┴──────────┴─────────────────────────┘
//!   page 0   page 1   page 2     page 3     (initial layout)
//! ```

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt as LockExt;
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::error::{BoltError, Result};
use crate::freelist::FreeList;
use crate::page::{
    write_header, Meta, Page, Pgid, Txid, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, META_PAGE_FLAG, META_SIZE,
    PAGE_HEADER_SIZE,
};
use crate::tx::{Tx, TxStats};

/// Largest mapping ever created
pub const MAX_MAP_SIZE: usize = 0xFFFF_FFFF_FFFF;

/// Growth step once the mapping passes 1 GiB
const MAX_MMAP_STEP: usize = 1 << 30;

/// File growth increment once the mapping passes this size
const ALLOC_SIZE: usize = 16 * 1024 * 1024;

/// Smallest page size accepted for new files
const MIN_PAGE_SIZE: usize = 1024;

/// Database-wide statistics
#[derive(Debug, Clone, Default)]
pub struct DbStats {
    // -------------------------------------------------------------------------
    // Free List
    // -------------------------------------------------------------------------
    /// Allocatable pages
    pub free_page_n: usize,
    /// Pages waiting for readers to finish
    pub pending_page_n: usize,
    /// Bytes held by free pages
    pub free_alloc: usize,
    /// Bytes of the serialized free list
    pub freelist_inuse: usize,

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------
    /// Read transactions started
    pub tx_n: usize,
    /// Read transactions currently open
    pub open_tx_n: usize,
    /// Accumulated statistics of finished transactions
    pub tx_stats: TxStats,
}

// =============================================================================
// Shared State
// =============================================================================

pub(crate) struct DbState {
    pub opened: bool,
    /// Latest committed meta
    pub meta: Meta,
    pub freelist: FreeList,
    /// Transaction ids of open readers
    readers: Vec<Txid>,
    file_size: usize,
    stats: DbStats,
}

impl DbState {
    /// Copy the free list counters into the stats snapshot
    fn refresh_freelist_stats(&mut self, page_size: usize) {
        self.stats.free_page_n = self.freelist.free_count();
        self.stats.pending_page_n = self.freelist.pending_count();
        self.stats.free_alloc = self.freelist.free_count() * page_size;
        self.stats.freelist_inuse = self.freelist.size();
    }
}

struct MmapState {
    map: Option<Mmap>,
    size: usize,
}

/// Single-writer permit, released explicitly on commit or rollback
struct WriterLock {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl WriterLock {
    fn acquire(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.cond.wait(&mut busy);
        }
        *busy = true;
    }

    fn release(&self) {
        *self.busy.lock() = false;
        self.cond.notify_one();
    }
}

pub(crate) struct DbInner {
    path: PathBuf,
    options: Options,
    file: File,
    pub(crate) page_size: usize,
    writer: WriterLock,
    pub(crate) state: Mutex<DbState>,
    mmap: RwLock<MmapState>,
}

impl DbInner {
    /// Run `f` against page `pgid` of the mapped file
    pub(crate) fn with_page<R>(&self, pgid: Pgid, f: impl FnOnce(Page<'_>) -> Result<R>) -> Result<R> {
        let mmap = self.mmap.read();
        let map = mmap.map.as_ref().ok_or(BoltError::DatabaseNotOpen)?;

        let offset = (pgid as usize)
            .checked_mul(self.page_size)
            .ok_or(BoltError::PageOutOfBounds { pgid })?;
        let header = map
            .get(offset..offset + PAGE_HEADER_SIZE)
            .ok_or(BoltError::PageOutOfBounds { pgid })?;
        let overflow = Page::new(header)?.overflow() as usize;
        let end = offset + (overflow + 1) * self.page_size;
        let buf = map.get(offset..end).ok_or(BoltError::PageOutOfBounds { pgid })?;
        f(Page::new(buf)?)
    }

    /// Reserve `count` contiguous pages, from the free list first and by
    /// raising `high_water` otherwise
    pub(crate) fn allocate(&self, count: usize, high_water: &mut Pgid) -> Result<Pgid> {
        let mut state = self.state.lock();
        let pgid = state.freelist.allocate(count);
        if pgid != 0 {
            return Ok(pgid);
        }

        let pgid = *high_water;
        let min_size = (pgid as usize + count + 1) * self.page_size;
        let mapped = self.mmap.read().size;
        if min_size >= mapped {
            self.remap(min_size)?;
        }
        *high_water += count as Pgid;
        Ok(pgid)
    }

    /// Replace the mapping with one covering at least `min_size` bytes
    fn remap(&self, min_size: usize) -> Result<()> {
        let mut mmap = self.mmap.write();

        let file_size = self.file.metadata()?.len() as usize;
        if file_size < self.page_size * 2 {
            return Err(BoltError::Invalid(format!("file size too small: {} bytes", file_size)));
        }
        let size = mmap_size(file_size.max(min_size), self.page_size)?;

        mmap.map = None;
        let mut opts = MmapOptions::new();
        opts.len(size);
        if self.options.mmap_populate {
            opts.populate();
        }
        // SAFETY: the mapping is read-only and only this handle writes the
        // file, through pwrite on pages no live reader can observe. The file
        // lock keeps other processes from opening it for writing. Slices of
        // the map are only handed out under the mmap read lock, which this
        // remap holds exclusively.
        let map = unsafe { opts.map(&self.file)? };

        debug!(path = %self.path.display(), size, "mapped database");
        mmap.map = Some(map);
        mmap.size = size;
        Ok(())
    }

    /// Make sure the file covers `size` bytes
    pub(crate) fn grow(&self, size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if size <= state.file_size {
            return Ok(());
        }

        let mapped = self.mmap.read().size;
        let size = if mapped < ALLOC_SIZE { mapped.max(size) } else { size + ALLOC_SIZE };

        if !self.options.no_grow_sync && !self.options.read_only {
            self.file.set_len(size as u64)?;
            self.file.sync_all()?;
        }
        debug!(from = state.file_size, to = size, "grew database file");
        state.file_size = size;
        Ok(())
    }

    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// fdatasync unless disabled
    pub(crate) fn sync(&self) -> Result<()> {
        if !self.options.no_sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Read both meta pages and return the newest valid one
    fn load_meta(&self) -> Result<Meta> {
        let read = |pgid: Pgid| -> Result<Meta> {
            let meta = self.with_page(pgid, |page| page.meta())?;
            meta.validate()?;
            Ok(meta)
        };

        match (read(0), read(1)) {
            (Ok(a), Ok(b)) => Ok(if b.txid > a.txid { b } else { a }),
            (Ok(meta), Err(err)) | (Err(err), Ok(meta)) => {
                warn!(txid = meta.txid, error = %err, "one meta page is invalid, using the other");
                Ok(meta)
            }
            (Err(err), Err(_)) => Err(err),
        }
    }

    /// Finish a transaction: release the writer or deregister the reader
    pub(crate) fn close_tx(&self, writable: bool, txid: Txid, stats: &TxStats) {
        let mut state = self.state.lock();
        state.stats.tx_stats.add(stats);
        if writable {
            state.refresh_freelist_stats(self.page_size);
            drop(state);
            self.writer.release();
        } else {
            if let Some(pos) = state.readers.iter().position(|id| *id == txid) {
                state.readers.swap_remove(pos);
            }
            state.stats.open_tx_n = state.readers.len();
        }
    }
}

/// Mapping size for at least `size` bytes: powers of two from 32 KiB to
/// 1 GiB, then whole 1 GiB steps
fn mmap_size(size: usize, page_size: usize) -> Result<usize> {
    for shift in 15..=30 {
        if size <= 1 << shift {
            return Ok(1 << shift);
        }
    }
    if size > MAX_MAP_SIZE {
        return Err(BoltError::MmapTooLarge { size });
    }

    let mut sz = size;
    let remainder = sz % MAX_MMAP_STEP;
    if remainder > 0 {
        sz += MAX_MMAP_STEP - remainder;
    }
    if sz % page_size != 0 {
        sz = (sz / page_size + 1) * page_size;
    }
    Ok(sz.min(MAX_MAP_SIZE))
}

/// Write the initial four pages: two metas, an empty free list and an
/// empty root leaf
fn init_file(file: &File, page_size: usize) -> Result<()> {
    let mut buf = vec![0u8; page_size * 4];
    for txid in 0..2u64 {
        let page = &mut buf[txid as usize * page_size..(txid as usize + 1) * page_size];
        let mut meta = Meta::new(page_size as u32, txid, 2, 3, 4);
        meta.write(page)?;
    }
    write_header(&mut buf[page_size * 2..], 2, FREELIST_PAGE_FLAG, 0, 0);
    write_header(&mut buf[page_size * 3..], 3, LEAF_PAGE_FLAG, 0, 0);

    file.write_all_at(&buf, 0)?;
    file.sync_data()?;
    Ok(())
}

/// Page size recorded in meta page 0, if it is readable
fn recorded_page_size(file: &File) -> Option<usize> {
    let mut buf = [0u8; PAGE_HEADER_SIZE + META_SIZE];
    file.read_exact_at(&mut buf, 0).ok()?;
    let page = Page::new(&buf).ok()?;
    if page.flags() & META_PAGE_FLAG == 0 {
        return None;
    }
    let meta = page.meta().ok()?;
    meta.validate().ok()?;
    Some(meta.page_size as usize)
}

// =============================================================================
// Public Handle
// =============================================================================

/// Handle to an open database. Cheap to clone; every clone shares the file.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl Db {
    /// Open or create the database at `path`
    ///
    /// On startup:
    /// 1. Open the file and take the advisory lock
    /// 2. Initialize a new file with two metas, a free list and a root leaf
    /// 3. Map the file and pick the newest valid meta
    /// 4. Load the free list
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .create(!options.read_only)
            .open(&path)?;

        let locked = if options.read_only {
            LockExt::try_lock_shared(&file)
        } else {
            LockExt::try_lock_exclusive(&file)
        };
        if let Err(err) = locked {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(BoltError::DatabaseLocked(path));
            }
            return Err(err.into());
        }

        let mut file_size = file.metadata()?.len() as usize;
        let page_size = if file_size == 0 {
            if options.read_only {
                return Err(BoltError::Invalid("cannot initialize a read-only database".to_string()));
            }
            if options.page_size < MIN_PAGE_SIZE || !options.page_size.is_power_of_two() {
                return Err(BoltError::Invalid(format!("unsupported page size {}", options.page_size)));
            }
            init_file(&file, options.page_size)?;
            file_size = options.page_size * 4;
            info!(path = %path.display(), page_size = options.page_size, "initialized database");
            options.page_size
        } else {
            // An unreadable first meta falls back to the configured size.
            recorded_page_size(&file).unwrap_or(options.page_size)
        };

        let inner = Arc::new(DbInner {
            path,
            options: options.clone(),
            file,
            page_size,
            writer: WriterLock {
                busy: Mutex::new(false),
                cond: Condvar::new(),
            },
            state: Mutex::new(DbState {
                opened: false,
                meta: Meta::new(page_size as u32, 0, 2, 3, 4),
                freelist: FreeList::new(),
                readers: Vec::new(),
                file_size,
                stats: DbStats::default(),
            }),
            mmap: RwLock::new(MmapState { map: None, size: 0 }),
        });

        inner.remap(options.initial_mmap_size)?;
        let meta = inner.load_meta()?;
        let mut freelist = FreeList::new();
        inner.with_page(meta.freelist, |page| freelist.read(&page))?;

        {
            let mut state = inner.state.lock();
            state.meta = meta;
            state.freelist = freelist;
            state.refresh_freelist_stats(page_size);
            state.opened = true;
        }
        info!(
            path = %inner.path.display(),
            txid = meta.txid,
            pages = meta.pgid,
            read_only = options.read_only,
            "opened database"
        );
        Ok(Self { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.options.read_only
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction
    pub fn begin(&self, writable: bool) -> Result<Tx> {
        if writable {
            self.begin_write()
        } else {
            self.begin_read()
        }
    }

    /// Start a read-only transaction on the latest committed snapshot
    pub fn begin_read(&self) -> Result<Tx> {
        let mut state = self.inner.state.lock();
        if !state.opened {
            return Err(BoltError::DatabaseNotOpen);
        }
        let meta = state.meta;
        state.readers.push(meta.txid);
        state.stats.tx_n += 1;
        state.stats.open_tx_n = state.readers.len();
        drop(state);

        Ok(Tx::new(Arc::clone(&self.inner), meta, false))
    }

    /// Start the read-write transaction, blocking while another is open
    pub fn begin_write(&self) -> Result<Tx> {
        if self.inner.options.read_only {
            return Err(BoltError::DatabaseReadOnly);
        }

        self.inner.writer.acquire();
        let mut state = self.inner.state.lock();
        if !state.opened {
            drop(state);
            self.inner.writer.release();
            return Err(BoltError::DatabaseNotOpen);
        }

        let mut meta = state.meta;
        meta.txid += 1;

        // Pages freed at or before the oldest reader's snapshot are safe.
        let min_reader = state.readers.iter().copied().min().unwrap_or(Txid::MAX);
        if min_reader > 0 {
            state.freelist.release(min_reader - 1);
        }
        drop(state);

        Ok(Tx::new(Arc::clone(&self.inner), meta, true))
    }

    /// Run `f` in a read-write transaction. Commits when `f` succeeds and
    /// rolls back when it fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx) -> Result<T>,
    {
        let mut tx = self.begin_write()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "rollback after failed update failed");
                }
                Err(err)
            }
        }
    }

    /// Run `f` in a read-only transaction
    pub fn view<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Tx) -> Result<T>,
    {
        let mut tx = self.begin_read()?;
        let result = f(&mut tx);
        tx.rollback()?;
        result
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Snapshot of database statistics
    pub fn stats(&self) -> DbStats {
        let state = self.inner.state.lock();
        let mut stats = state.stats.clone();
        stats.open_tx_n = state.readers.len();
        stats
    }

    /// Wait for the writer, unmap the file and release the file lock. Later
    /// transactions fail with `DatabaseNotOpen`.
    pub fn close(&self) -> Result<()> {
        self.inner.writer.acquire();
        let result = self.close_locked();
        self.inner.writer.release();
        result
    }

    fn close_locked(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.opened {
            return Ok(());
        }
        state.opened = false;
        state.freelist = FreeList::new();

        let mut mmap = self.inner.mmap.write();
        mmap.map = None;
        mmap.size = 0;

        LockExt::unlock(&self.inner.file)?;
        info!(path = %self.inner.path.display(), "closed database");
        Ok(())
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .field("page_size", &self.inner.page_size)
            .field("read_only", &self.inner.options.read_only)
            .finish()
    }
}
