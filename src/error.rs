use thiserror::Error;

/// Errors produced by every layer of the store: directory/meta handling (C1),
/// the paged and small-object allocators (C2/C4), the handle table (C3), and
/// the higher-level bitmap/trie structures (C6/C7).
///
/// The store is single-writer and single-process, so there is no
/// partial-failure boundary to police between concurrent workers: a mutating
/// API either succeeds or the condition is fatal (see
/// [`crate::fatal::FatalHandler`]). Queries never return `Err`; they return
/// sentinel values (`None`, [`crate::handle::Handle::NULL`],
/// [`crate::PageHandle::NULL`]) instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QpsError {
    /// Couldn't open, create, or stat the backing directory or a map file.
    #[error("opening the backing store failed")]
    Open(#[source] std::io::Error),
    /// Couldn't acquire the directory lock for exclusive writer access.
    #[error("failed to lock the store directory for exclusive use")]
    Lock(#[source] std::io::Error),
    /// A write, fsync, or rename failed.
    #[error("synchronizing store data to disk failed")]
    Sync(#[source] std::io::Error),
    /// A map file (or the directory) could not be grown to the requested size.
    #[error("can't resize backing storage: have 0x{size:x} bytes, wanted 0x{requested:x}")]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// A new map could not be created or mapped.
    #[error("can't allocate a new memory map of 0x{requested:x} bytes")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// A signature didn't match the kind/version expected for the file.
    #[error("signature mismatch: expected `{expected}`, found `{found}`")]
    BadSignature { expected: String, found: String },
    /// The meta file, a map header, or a trie/bitmap root failed structural
    /// validation (bad lengths, a checksum mismatch, an out-of-range index).
    #[error("store data is corrupted: {0}")]
    Corruption(&'static str),
    /// No map index is free for growth, or `map_index` space is exhausted.
    #[error("no map index available for growth")]
    MapIndexExhausted,
    /// The paged allocator had no run of `pages` free pages and could not
    /// grow.
    #[error("paged allocator is out of space: requested {pages} pages")]
    OutOfPages { pages: u32 },
    /// The small-object allocator could not satisfy a request of `size`
    /// bytes even after growing its backing memory map.
    #[error("small-object allocator is out of space: requested {size} bytes")]
    OutOfSmallSpace { size: usize },
    /// A requested allocation exceeds `ALLOC_MAX`.
    #[error("allocation of {requested} bytes exceeds the maximum of {max} bytes")]
    AllocTooLarge { requested: usize, max: usize },
    /// An operation referenced a handle not currently allocated.
    #[error("invalid handle {0:?}")]
    InvalidHandle(crate::handle::Handle),
    /// Two live maps claimed the same `map_index`.
    #[error("duplicate map index {0}")]
    DuplicateMapIndex(u16),
    /// Catch-all for conditions that don't warrant their own variant.
    #[error("{0}")]
    Other(&'static str),
}

impl QpsError {
    /// True for conditions the spec classifies as *fatal disk* errors: ones
    /// that should route through the store's [`crate::fatal::FatalHandler`]
    /// rather than be returned to an ordinary caller.
    pub fn is_fatal_disk(&self) -> bool {
        matches!(
            self,
            QpsError::ResizeFailed { .. }
                | QpsError::MapFailed { .. }
                | QpsError::Sync(_)
                | QpsError::OutOfPages { .. }
                | QpsError::OutOfSmallSpace { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QpsError>;
