//! C1: the store/spool manager. Owns a directory on a local filesystem,
//! holding an advisory exclusive lock for the lifetime of the open store,
//! and orchestrating the meta file, map files, and crash recovery.

pub mod map;
mod meta;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use fs4::FileExt;

use crate::error::{QpsError, Result};
use crate::fatal::{AbortingFatalHandler, FatalHandler};
use crate::handle::HandleTable;
use crate::paged::MapFreeList;
use crate::small_alloc::MemFreeList;
use crate::{Generation, PAGE_SIZE};

/// Per-map free-list bookkeeping, keyed to [`MapKind`]: a page map's runs are
/// tracked by [`paged::MapFreeList`](crate::paged::MapFreeList), a memory
/// map's byte-granular heap by
/// [`small_alloc::MemFreeList`](crate::small_alloc::MemFreeList). Kept as one
/// enum, parallel-indexed with `StoreInner::maps`, rather than two separate
/// vectors, so a map's slot always has exactly one free-list entry.
pub(crate) enum MapFreeListState {
    Page(MapFreeList),
    Memory(MemFreeList),
}

impl MapFreeListState {
    fn rebuild(map: &Map) -> Self {
        match map.kind {
            MapKind::Page => MapFreeListState::Page(MapFreeList::rebuild(map)),
            MapKind::Memory => MapFreeListState::Memory(MemFreeList::rebuild(map)),
        }
    }

    pub fn as_page_mut(&mut self) -> Option<&mut MapFreeList> {
        match self {
            MapFreeListState::Page(l) => Some(l),
            MapFreeListState::Memory(_) => None,
        }
    }

    pub fn as_memory_mut(&mut self) -> Option<&mut MemFreeList> {
        match self {
            MapFreeListState::Memory(l) => Some(l),
            MapFreeListState::Page(_) => None,
        }
    }
}

pub use map::{Map, MapHeader, MapKind};
pub use meta::{MapCatalogEntry, Meta};

const META_FILE_NAME: &str = "meta";
const META_TMP_NAME: &str = "meta.tmp";
const LOCK_FILE_NAME: &str = "lock";

/// Options controlling how a store is opened or created; the generalisation
/// of the teacher's `OpenOptions` to the whole store rather than just the
/// allocator.
#[derive(Clone)]
pub struct StoreOptions {
    mode: u32,
    fatal: Arc<dyn FatalHandler>,
    snapshot_max_duration: std::time::Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            mode: 0o644,
            fatal: Arc::new(AbortingFatalHandler),
            snapshot_max_duration: std::time::Duration::from_secs(3600),
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Inject a [`FatalHandler`] so tests can observe rather than abort on
    /// unrecoverable disk errors.
    pub fn fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = handler;
        self
    }

    pub fn snapshot_max_duration(mut self, duration: std::time::Duration) -> Self {
        self.snapshot_max_duration = duration;
        self
    }

    /// Create a brand new store directory. Fails if the directory already
    /// contains a meta file.
    pub fn create(&self, path: impl AsRef<Path>, name: &str, preamble: &[u8]) -> Result<Store> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(QpsError::Open)?;

        let meta_path = path.join(META_FILE_NAME);
        if meta_path.exists() {
            return Err(QpsError::Other("store already exists at this path"));
        }

        let lock_file = open_lock_file(path, self.mode)?;
        lock_file.try_lock().map_err(|e| QpsError::Lock(e.into()))?;

        let mut meta = Meta::new(name);
        meta.preamble = preamble.to_vec();

        let mut inner = StoreInner {
            dir: path.to_path_buf(),
            lock_file,
            meta,
            maps: Vec::new(),
            free_lists: Vec::new(),
            handles: HandleTable::new(),
            snapshot_max_duration: self.snapshot_max_duration,
            in_flight_snapshot: None,
            frozen_maps: std::collections::HashMap::new(),
        };
        inner.write_meta()?;
        log::debug!("created store `{}` at {}", name, path.display());

        Ok(Store {
            inner: Arc::new(Mutex::new(inner)),
            fatal: self.fatal.clone(),
        })
    }

    /// Open an existing store directory, recovering from any half-written
    /// snapshot generation left over from a crash.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<(Store, Vec<u8>)> {
        let path = path.as_ref();
        if page_size::get() != PAGE_SIZE {
            log::warn!(
                "host page size {} differs from QPS_PAGE_SIZE {PAGE_SIZE}; mmap granularity may differ",
                page_size::get()
            );
        }

        let lock_file = open_lock_file(path, self.mode)?;
        lock_file.try_lock().map_err(|e| QpsError::Lock(e.into()))?;

        let meta_path = path.join(META_FILE_NAME);
        let meta_bytes = fs::read(&meta_path).map_err(QpsError::Open)?;
        let meta = Meta::decode(&meta_bytes)?;

        let mut maps = Vec::with_capacity(meta.catalog.len());
        let mut free_lists = Vec::with_capacity(meta.catalog.len());
        for entry in &meta.catalog {
            let file_name = Map::file_name(entry.kind, entry.map_index, entry.generation);
            let map_path = path.join(file_name);
            let map = Map::open(&map_path)?;
            if map.header().generation() != entry.generation {
                return Err(QpsError::Corruption(
                    "map generation does not match meta catalog",
                ));
            }
            free_lists.push(MapFreeListState::rebuild(&map));
            maps.push(map);
        }

        recover_orphan_generations(path, &meta)?;

        let preamble = meta.preamble.clone();
        let mut inner = StoreInner {
            dir: path.to_path_buf(),
            lock_file,
            meta,
            maps,
            free_lists,
            handles: HandleTable::new(),
            snapshot_max_duration: self.snapshot_max_duration,
            in_flight_snapshot: None,
            frozen_maps: std::collections::HashMap::new(),
        };
        inner.rebuild_handle_table()?;
        log::debug!(
            "opened store `{}` at generation {}",
            inner.meta.name,
            inner.meta.generation.0
        );

        Ok((
            Store {
                inner: Arc::new(Mutex::new(inner)),
                fatal: self.fatal.clone(),
            },
            preamble,
        ))
    }
}

fn open_lock_file(dir: &Path, mode: u32) -> Result<File> {
    let lock_path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode_or(mode)
        .open(&lock_path)
        .map_err(QpsError::Open)?;
    Ok(file)
}

/// Cheap portability shim so this reads the same on every target: we only
/// actually set the Unix mode bits on Unix.
trait OpenOptionsModeExt {
    fn mode_or(&mut self, mode: u32) -> &mut Self;
}

impl OpenOptionsModeExt for OpenOptions {
    #[cfg(unix)]
    fn mode_or(&mut self, mode: u32) -> &mut Self {
        use std::os::unix::fs::OpenOptionsExt;
        self.mode(mode)
    }

    #[cfg(not(unix))]
    fn mode_or(&mut self, _mode: u32) -> &mut Self {
        self
    }
}

/// Delete any map file whose generation is newer than what the committed
/// meta references: these are the tail of a snapshot that crashed before
/// its meta rename, per §4.C1 open protocol / §7 recovery policy.
fn recover_orphan_generations(dir: &Path, meta: &Meta) -> Result<()> {
    let known: std::collections::HashSet<(MapKind, u16, u32)> = meta
        .catalog
        .iter()
        .map(|e| (e.kind, e.map_index, e.generation.0))
        .collect();

    for entry in fs::read_dir(dir).map_err(QpsError::Open)? {
        let entry = entry.map_err(QpsError::Open)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some((kind, index, gen)) = parse_map_file_name(&name) else {
            continue;
        };
        if !known.contains(&(kind, index, gen)) {
            log::warn!("removing orphaned snapshot artefact {name}");
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}

fn parse_map_file_name(name: &str) -> Option<(MapKind, u16, u32)> {
    let mut parts = name.split('.');
    let prefix = parts.next()?;
    let kind = match prefix {
        "pg" => MapKind::Page,
        "mem" => MapKind::Memory,
        _ => return None,
    };
    let index: u16 = parts.next()?.parse().ok()?;
    let generation: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((kind, index, generation))
}

/// Aggregate usage statistics returned by [`Store::get_usage`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageStats {
    pub page_maps: usize,
    pub memory_maps: usize,
    pub total_pages_allocated: u64,
    pub total_bytes_on_disk: u64,
}

pub(crate) struct StoreInner {
    pub dir: PathBuf,
    pub lock_file: File,
    pub meta: Meta,
    pub maps: Vec<Map>,
    pub(crate) free_lists: Vec<MapFreeListState>,
    pub handles: HandleTable,
    pub snapshot_max_duration: std::time::Duration,
    pub in_flight_snapshot: Option<crate::snapshot::InFlight>,
    /// Maps frozen by an in-progress or already-committed snapshot, keyed by
    /// `map_index`, recording the generation each was frozen at. A frozen
    /// map's on-disk file must never be mutated again; the first write
    /// reaching it goes through [`StoreInner::promote_if_frozen`] instead.
    /// Cleared per-entry as each map is promoted.
    pub(crate) frozen_maps: std::collections::HashMap<u16, Generation>,
}

impl StoreInner {
    pub fn map_slot(&self, index: u16) -> Option<usize> {
        self.maps.iter().position(|m| m.index == index)
    }

    pub fn map(&self, index: u16) -> Option<&Map> {
        self.map_slot(index).map(|i| &self.maps[i])
    }

    pub fn map_mut(&mut self, index: u16) -> Option<&mut Map> {
        self.map_slot(index).map(|i| &mut self.maps[i])
    }

    /// Number of map slots currently registered, for callers (consistency
    /// checking, usage stats) that need to iterate every map by slot index
    /// rather than by its stable `index`.
    pub(crate) fn map_slot_count(&self) -> usize {
        self.maps.len()
    }

    pub(crate) fn map_kind_at(&self, slot: usize) -> Option<MapKind> {
        self.maps.get(slot).map(|m| m.kind)
    }

    pub fn next_free_map_index(&self) -> Result<u16> {
        let used: std::collections::HashSet<u16> = self.maps.iter().map(|m| m.index).collect();
        (1..=u16::MAX)
            .find(|candidate| !used.contains(candidate))
            .ok_or(QpsError::MapIndexExhausted)
    }

    /// Create and register a brand new map file, growing the store.
    pub fn create_map(&mut self, kind: MapKind) -> Result<u16> {
        let index = self.next_free_map_index()?;
        let generation = self.meta.generation;
        let file_name = Map::file_name(kind, index, generation);
        let path = self.dir.join(&file_name);
        let map = Map::create(&path, index, kind, generation)?;
        self.free_lists.push(MapFreeListState::rebuild(&map));
        self.maps.push(map);
        self.meta.catalog.push(MapCatalogEntry {
            map_index: index,
            kind,
            generation,
        });
        log::debug!("created new {:?} map {index} at generation {}", kind, generation.0);
        Ok(index)
    }

    /// True if `map_index` must not be mutated in place: a snapshot has
    /// frozen it and no write has promoted it to a sibling file yet.
    pub(crate) fn is_frozen(&self, map_index: u16) -> bool {
        self.frozen_maps.contains_key(&map_index)
    }

    /// The write barrier's core: if `map_index` is frozen, fork its current
    /// file onto a brand new one at the live generation before the caller is
    /// allowed to mutate it, per §4.C5's "all subsequent writes on such a map
    /// must copy-on-write into a sibling map at the new generation". A no-op
    /// if the map was never frozen, or was already promoted by an earlier
    /// write since the freeze.
    ///
    /// The promoted file keeps the same `map_index`, so every existing
    /// `RelPtr`/`PageHandle` anywhere in the store (compact/flat trie nodes,
    /// bitmap dispatch arrays, allocator block headers) keeps resolving
    /// correctly with no repointing step: addressing goes through
    /// `map_index`, never through generation. The promotion itself is left
    /// out of `self.meta.catalog` on purpose — it only becomes durable and
    /// visible to a reopen at the next `Store::snapshot`/`snapshot_wait`,
    /// the same way an ordinary write between two snapshots is never on its
    /// own crash-durable.
    pub(crate) fn promote_if_frozen(&mut self, map_index: u16) -> Result<()> {
        if !self.frozen_maps.contains_key(&map_index) {
            return Ok(());
        }
        let slot = self
            .map_slot(map_index)
            .ok_or(QpsError::Other("promote_if_frozen: unknown map index"))?;
        let kind = self.maps[slot].kind;
        let target_generation = self.meta.generation;

        let file_name = Map::file_name(kind, map_index, target_generation);
        let path = self.dir.join(&file_name);
        let old_bytes = self.maps[slot].bytes().to_vec();
        let mut sibling = Map::create(&path, map_index, kind, target_generation)?;
        sibling.bytes_mut().copy_from_slice(&old_bytes);
        sibling.header_mut().set_generation(target_generation);
        sibling.flush()?;

        self.maps[slot] = sibling;
        self.frozen_maps.remove(&map_index);
        // Same bytes as the map they were rebuilt from, so the free list
        // carries over as-is; nothing besides the backing file changed.
        self.handles.invalidate_cache();
        log::debug!("promoted frozen map {map_index} to generation {}", target_generation.0);
        Ok(())
    }

    pub fn rebuild_handle_table(&mut self) -> Result<()> {
        self.handles.rebuild(&self.maps);
        Ok(())
    }

    pub fn write_meta(&mut self) -> Result<()> {
        let bytes = self.meta.encode()?;
        let tmp_path = self.dir.join(META_TMP_NAME);
        {
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(QpsError::Open)?;
            f.write_all(&bytes).map_err(QpsError::Sync)?;
            f.sync_data().map_err(QpsError::Sync)?;
        }
        fs::rename(&tmp_path, self.dir.join(META_FILE_NAME)).map_err(QpsError::Open)?;
        Ok(())
    }

    pub fn flush_all(&self) -> Result<()> {
        for map in &self.maps {
            map.flush()?;
        }
        Ok(())
    }
}

/// A handle to an open store. Cheap to clone; all clones share the same
/// underlying directory, lock, and in-memory state via an internal mutex,
/// matching the spec's single-writer-thread concurrency model (§5).
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<Mutex<StoreInner>>,
    pub(crate) fatal: Arc<dyn FatalHandler>,
}

impl Store {
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().join(META_FILE_NAME).exists()
    }

    pub fn create(path: impl AsRef<Path>, name: &str, preamble: &[u8]) -> Result<Store> {
        StoreOptions::default().create(path, name, preamble)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<(Store, Vec<u8>)> {
        StoreOptions::default().open(path)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn fatal(&self, context: &str, error: QpsError) -> ! {
        self.fatal.fatal(context, &error)
    }

    /// Unmap all maps and release the directory lock. There is no implicit
    /// snapshot on close, per §4.C1.
    pub fn close(self) -> Result<()> {
        let inner = self.lock();
        let _ = inner.lock_file.unlock();
        Ok(())
    }

    /// Remove a store directory entirely. The store must not currently be
    /// open in this process.
    pub fn unlink(path: impl AsRef<Path>) -> Result<()> {
        fs::remove_dir_all(path).map_err(QpsError::Open)
    }

    /// Copy (or hard-link, if `hardlink_if_possible` and the destination is
    /// on the same filesystem) every file currently referenced by the
    /// committed meta into `destination_dir`.
    pub fn backup(&self, destination_dir: impl AsRef<Path>, hardlink_if_possible: bool) -> Result<()> {
        let destination_dir = destination_dir.as_ref();
        fs::create_dir_all(destination_dir).map_err(QpsError::Open)?;
        let inner = self.lock();
        inner.flush_all()?;

        let meta_bytes = inner.meta.encode()?;
        fs::write(destination_dir.join(META_FILE_NAME), meta_bytes).map_err(QpsError::Open)?;

        for entry in &inner.meta.catalog {
            let file_name = Map::file_name(entry.kind, entry.map_index, entry.generation);
            let src = inner.dir.join(&file_name);
            let dst = destination_dir.join(&file_name);
            let linked = hardlink_if_possible && fs::hard_link(&src, &dst).is_ok();
            if !linked {
                fs::copy(&src, &dst).map_err(QpsError::Open)?;
            }
        }
        Ok(())
    }

    pub fn get_usage(&self) -> UsageStats {
        let inner = self.lock();
        let mut stats = UsageStats::default();
        for map in &inner.maps {
            match map.kind {
                MapKind::Page => stats.page_maps += 1,
                MapKind::Memory => stats.memory_maps += 1,
            }
            stats.total_pages_allocated += map.header().allocated_pages() as u64;
            stats.total_bytes_on_disk += map.header().mem_disk_usage() as u64;
        }
        stats
    }

    pub fn generation(&self) -> Generation {
        self.lock().meta.generation
    }
}
