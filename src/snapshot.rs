//! C5: the copy-on-write snapshot engine.
//!
//! The original takes a consistent point-in-time snapshot by `fork()`-ing a
//! child process that shares the parent's dirty pages via the kernel's COW
//! page tables: the child streams every page to a sibling generation file
//! while the parent keeps mutating its own copies, the kernel forking off a
//! private copy of any page either side writes. That mechanism doesn't
//! translate to Rust without `unsafe` `libc::fork` and a child process
//! re-entering a half-initialized allocator, so this follows the design
//! notes' suggested substitution (§9): instead of process-level COW, every
//! map gets frozen read-only in place, and [`StoreInner::promote_if_frozen`]
//! (see `crate::store`) is the software write barrier that stands in for the
//! kernel's page-fault handler — the first write reaching a frozen map
//! forks its whole backing file onto a fresh one at the next generation
//! before the write is allowed through.
//!
//! The commit point is the same as the original design: `meta` is rewritten
//! and renamed (`StoreInner::write_meta`) before any map is frozen, so a
//! crash at any point afterwards leaves the previous generation's meta
//! untouched. Once that rename lands, every current map is frozen and the
//! live generation counter is bumped in memory so the first write (if any)
//! to reach each frozen map knows which generation to fork into — that fork
//! is deliberately *not* written back into `meta.catalog` here. It only
//! becomes durable at the *next* snapshot, whose catalogue is rebuilt from
//! each map's own on-disk header generation rather than a shared scalar, so
//! it naturally picks up whichever maps were forked since. A reopen between
//! two snapshots therefore always sees exactly the data as of the older of
//! the two, the same way any other write between snapshots is not on its
//! own crash-durable.
//!
//! The background thread this spawns does real confirmatory I/O rather than
//! writing the catalogue itself (which now happens synchronously on the
//! calling thread, before any map is frozen): it reopens each just-frozen
//! file and `fsync`s it, a belt-and-suspenders durability check beyond the
//! `mmap::flush` the calling thread already did. [`Store::snapshot_wait`]
//! blocks on that thread the same way it always has, including the existing
//! watchdog/[`crate::fatal::FatalHandler`] semantics for a stuck or failed
//! worker.

use std::fs::File;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{QpsError, Result};
use crate::store::{Map, MapCatalogEntry, MapKind, Store};

/// State tracked while a background thread confirms the durability of the
/// files a snapshot just froze. The catalogue commit itself has already
/// happened by the time this exists; see the module docs.
pub struct InFlight {
    started_at: Instant,
    done: mpsc::Receiver<Result<()>>,
}

impl Store {
    /// Take a snapshot. Flushes every map, rebuilds the meta catalogue from
    /// each live map's own header generation (picking up any fork left over
    /// from a write to a map frozen by a previous snapshot), and commits
    /// that catalogue by rewriting and renaming `meta` — all synchronously,
    /// on the calling thread, before this function returns. Only then is
    /// every map frozen and the live generation counter bumped, so no
    /// freeze is visible to a write until the catalogue that predates it is
    /// already durable.
    ///
    /// Returns once the commit above is durable, not once the background
    /// confirmatory fsync has finished — see [`Store::snapshot_wait`].
    pub fn snapshot(&self) -> Result<()> {
        let frozen_paths = {
            let mut inner = self.lock();
            if inner.in_flight_snapshot.is_some() {
                return Err(QpsError::Other("a snapshot is already in progress"));
            }
            inner.flush_all()?;

            let catalog: Vec<MapCatalogEntry> = inner
                .maps
                .iter()
                .map(|m| MapCatalogEntry {
                    map_index: m.index,
                    kind: m.kind,
                    generation: m.header().generation(),
                })
                .collect();
            inner.meta.catalog = catalog;
            inner.write_meta()?;

            let mut frozen_paths = Vec::with_capacity(inner.maps.len());
            let frozen: Vec<(u16, MapKind, crate::Generation)> = inner
                .maps
                .iter()
                .map(|map| (map.index, map.kind, map.header().generation()))
                .collect();
            for (index, kind, generation) in frozen {
                inner.frozen_maps.insert(index, generation);
                frozen_paths.push(inner.dir.join(Map::file_name(kind, index, generation)));
            }
            // Bump in memory only: the first write to reach a frozen map,
            // or the next brand new map, gets this as its generation. Not
            // durable until the next snapshot commits a catalogue that
            // actually references it.
            inner.meta.generation = inner.meta.generation.next();
            frozen_paths
        };

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = confirm_durable(&frozen_paths);
            let _ = tx.send(result);
        });

        let mut inner = self.lock();
        inner.in_flight_snapshot = Some(InFlight {
            started_at: Instant::now(),
            done: rx,
        });
        Ok(())
    }

    /// Block until the in-flight snapshot (if any) finishes confirming its
    /// frozen files are durable. Returns `Ok(false)` if no snapshot was in
    /// flight. Fails fatally (through the store's
    /// [`crate::fatal::FatalHandler`]) if the background thread hit a disk
    /// error, or if it overran `snapshot_max_duration` without finishing
    /// (the design notes' "commit watchdog": a stuck snapshot must not be
    /// allowed to block forever).
    pub fn snapshot_wait(&self) -> Result<bool> {
        let timeout = {
            let inner = self.lock();
            let Some(in_flight) = &inner.in_flight_snapshot else {
                return Ok(false);
            };
            inner.snapshot_max_duration.saturating_sub(in_flight.started_at.elapsed())
        };

        let result = {
            let inner = self.lock();
            let in_flight = inner.in_flight_snapshot.as_ref().unwrap();
            match in_flight.done.recv_timeout(timeout) {
                Ok(result) => result,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    drop(inner);
                    self.fatal(
                        "snapshot watchdog",
                        QpsError::Other("snapshot exceeded snapshot_max_duration"),
                    );
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    drop(inner);
                    self.fatal(
                        "snapshot worker",
                        QpsError::Other("snapshot worker thread panicked"),
                    );
                }
            }
        };

        let mut inner = self.lock();
        inner.in_flight_snapshot = None;
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_fatal_disk() => {
                drop(inner);
                self.fatal("confirming snapshot durability", e);
            }
            Err(e) => Err(e),
        }
    }
}

/// Reopen each file a snapshot just froze and `fsync` it. The calling
/// thread already flushed these maps' mmaps before committing `meta`; this
/// is the extra confirmatory round-trip through the filesystem that the
/// background thread exists to do.
fn confirm_durable(paths: &[PathBuf]) -> Result<()> {
    for path in paths {
        let file = File::open(path).map_err(QpsError::Open)?;
        file.sync_all().map_err(QpsError::Sync)?;
    }
    Ok(())
}

/// How long a caller is willing to wait for `snapshot_wait` to notice a hung
/// worker, matching the design notes' default watchdog period.
pub const DEFAULT_SNAPSHOT_MAX_DURATION: Duration = Duration::from_secs(3600);
