//! Configuration for BoltKV
//!
//! Options consumed when a database file is opened.

/// Default page size for newly created database files
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Options for opening a database
#[derive(Debug, Clone)]
pub struct Options {
    // -------------------------------------------------------------------------
    // Access Mode
    // -------------------------------------------------------------------------
    /// Open the file read-only under a shared lock. Write transactions fail.
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Durability
    // -------------------------------------------------------------------------
    /// Skip truncate + fsync when the file grows
    pub no_grow_sync: bool,

    /// Skip fdatasync after each commit. Only for tests and bulk loads.
    pub no_sync: bool,

    // -------------------------------------------------------------------------
    // Memory Map
    // -------------------------------------------------------------------------
    /// Pre-fault the mapping (MAP_POPULATE on Linux)
    pub mmap_populate: bool,

    /// Minimum size of the first mapping (in bytes). Readers never block a
    /// remap, so this only saves remap work for files expected to grow.
    pub initial_mmap_size: usize,

    // -------------------------------------------------------------------------
    // Layout
    // -------------------------------------------------------------------------
    /// Page size used when creating a new file. Existing files keep the page
    /// size recorded in their meta page.
    pub page_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            no_grow_sync: false,
            no_sync: false,
            mmap_populate: false,
            initial_mmap_size: 0,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Options {
    /// Create a new options builder
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

/// Builder for Options
#[derive(Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Open the database read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.read_only = read_only;
        self
    }

    /// Skip truncate + fsync on file growth
    pub fn no_grow_sync(mut self, no_grow_sync: bool) -> Self {
        self.options.no_grow_sync = no_grow_sync;
        self
    }

    /// Skip fdatasync on commit
    pub fn no_sync(mut self, no_sync: bool) -> Self {
        self.options.no_sync = no_sync;
        self
    }

    /// Pre-fault the memory map
    pub fn mmap_populate(mut self, populate: bool) -> Self {
        self.options.mmap_populate = populate;
        self
    }

    /// Set the initial mmap size (in bytes)
    pub fn initial_mmap_size(mut self, size: usize) -> Self {
        self.options.initial_mmap_size = size;
        self
    }

    /// Set the page size for new files (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.options.page_size = size;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}
