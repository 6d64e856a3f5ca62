//! C2: the paged allocator. Hands out contiguous runs of pages from the
//! store's page maps, growing the store with a fresh page map when no
//! existing one has a big enough run free.
//!
//! Grounded in the teacher's `WriteUnitInner` free lists (`available_4k`,
//! `available_16k`, `available_blocks`): plain per-size-class vectors of
//! free run starts rather than a literal in-page linked free list. Runs are
//! segregated by size class (`class = floor(log2(len_pages))`, 18 classes
//! cover every run length that fits in one map), with an `occupied_classes`
//! bitmask so the next-fit search skips empty classes in one `u32` op.

use std::collections::HashMap;

use crate::error::{QpsError, Result};
use crate::store::map::{Map, MapKind};
use crate::store::StoreInner;
use crate::{PageHandle, MAP_PAGES};

/// Fetch the page free list for a map slot, panicking if that slot turns out
/// to hold a memory map's byte-granular free list instead: callers always
/// check `maps[slot].kind == MapKind::Page` first.
fn page_list(inner: &mut StoreInner, slot: usize) -> &mut MapFreeList {
    inner.free_lists[slot]
        .as_page_mut()
        .expect("page_list called on a non-page map slot")
}

const CLASSES: usize = 18;

fn class_of(len_pages: u32) -> usize {
    debug_assert!(len_pages > 0);
    (31 - len_pages.leading_zeros()) as usize
}

/// The in-memory free-run bookkeeping for one page map. Not persisted: on
/// reopen every map's free list is rebuilt from its header's
/// `allocated_pages` high-water mark alone (see [`MapFreeList::rebuild`]),
/// which is conservative (pages freed in a previous session but never
/// reused stay unreclaimed) but always safe, since it can never claim a
/// page is free that is actually still in use.
pub struct MapFreeList {
    classes: [Vec<u32>; CLASSES],
    /// run start page -> run length, for runs currently in `classes`.
    run_len: HashMap<u32, u32>,
    occupied_classes: u32,
    /// run start page -> run length, for runs currently handed out. Backs
    /// `pg_sizeof`/`pg_remap`: unlike a free run (self-describing nowhere),
    /// an allocated run has no header of its own to record its length in,
    /// so the allocator is the only place that can answer "how long is
    /// this handle's run".
    allocated: HashMap<u32, u32>,
}

impl MapFreeList {
    fn empty() -> Self {
        Self {
            classes: std::array::from_fn(|_| Vec::new()),
            run_len: HashMap::new(),
            occupied_classes: 0,
            allocated: HashMap::new(),
        }
    }

    pub fn rebuild(map: &Map) -> Self {
        let mut list = Self::empty();
        let usable = Map::usable_pages();
        let high_water = map.header().allocated_pages().max(usable.start);
        if high_water < usable.end {
            list.insert(high_water, usable.end - high_water);
        }
        list
    }

    fn insert(&mut self, start: u32, len: u32) {
        if len == 0 {
            return;
        }
        let class = class_of(len).min(CLASSES - 1);
        self.classes[class].push(start);
        self.run_len.insert(start, len);
        self.occupied_classes |= 1 << class;
    }

    fn remove_from_class(&mut self, class: usize, start: u32) {
        if let Some(pos) = self.classes[class].iter().position(|&s| s == start) {
            self.classes[class].swap_remove(pos);
        }
        if self.classes[class].is_empty() {
            self.occupied_classes &= !(1 << class);
        }
    }

    /// Best-effort segregated fit: classes strictly above `class_of(needed)`
    /// hold only runs guaranteed long enough, so the first one found there is
    /// taken immediately; the exact class is scanned linearly since a run's
    /// length only has a lower bound there.
    fn take_fit(&mut self, needed: u32) -> Option<(u32, u32)> {
        let exact_class = class_of(needed);
        if exact_class < CLASSES && self.occupied_classes & (1 << exact_class) != 0 {
            if let Some(pos) = self.classes[exact_class]
                .iter()
                .position(|&start| self.run_len[&start] >= needed)
            {
                let start = self.classes[exact_class].swap_remove(pos);
                if self.classes[exact_class].is_empty() {
                    self.occupied_classes &= !(1 << exact_class);
                }
                let len = self.run_len.remove(&start).unwrap();
                return Some((start, len));
            }
        }
        let higher = self.occupied_classes & !((1 << (exact_class + 1)) - 1);
        if higher != 0 {
            let class = higher.trailing_zeros() as usize;
            let start = self.classes[class].pop().unwrap();
            if self.classes[class].is_empty() {
                self.occupied_classes &= !(1 << class);
            }
            let len = self.run_len.remove(&start).unwrap();
            return Some((start, len));
        }
        None
    }

    fn free(&mut self, start: u32, len: u32) {
        self.insert(start, len);
    }

    /// If a free run starts exactly where an allocated run of `old_len`
    /// pages ends, and is long enough to cover `extra`, consume it (and
    /// re-free any leftover) so the allocated run can grow in place.
    fn try_extend(&mut self, start: u32, old_len: u32, extra: u32) -> bool {
        let next_start = start + old_len;
        let Some(&len) = self.run_len.get(&next_start) else {
            return false;
        };
        if len < extra {
            return false;
        }
        let class = class_of(len).min(CLASSES - 1);
        self.remove_from_class(class, next_start);
        self.run_len.remove(&next_start);
        if len > extra {
            self.insert(next_start + extra, len - extra);
        }
        true
    }

    fn largest_free_run(&self) -> u32 {
        (0..CLASSES)
            .rev()
            .find(|&c| self.occupied_classes & (1 << c) != 0)
            .and_then(|c| self.classes[c].iter().map(|s| self.run_len[s]).max())
            .unwrap_or(0)
    }
}

impl StoreInner {
    /// Allocate `pages` contiguous pages, growing the store with a new page
    /// map if no existing one can satisfy the request. `pages` must be
    /// nonzero and fit in a single map (`< MAP_PAGES - HEADER_PAGES`).
    pub fn pg_alloc(&mut self, pages: u32) -> Result<PageHandle> {
        if pages == 0 || pages as usize >= MAP_PAGES {
            return Err(QpsError::OutOfPages { pages });
        }

        for slot in 0..self.maps.len() {
            if self.maps[slot].kind != MapKind::Page || self.is_frozen(self.maps[slot].index) {
                continue;
            }
            if let Some((start, len)) = page_list(self, slot).take_fit(pages) {
                return Ok(self.commit_run(slot, start, len, pages));
            }
        }

        let index = self.create_map(MapKind::Page)?;
        let slot = self
            .map_slot(index)
            .expect("just-created map must be registered");
        let (start, len) = page_list(self, slot)
            .take_fit(pages)
            .expect("a freshly created page map always has one run covering its usable range");
        Ok(self.commit_run(slot, start, len, pages))
    }

    fn commit_run(&mut self, slot: usize, start: u32, len: u32, pages: u32) -> PageHandle {
        if len > pages {
            page_list(self, slot).free(start + pages, len - pages);
        }
        page_list(self, slot).allocated.insert(start, pages);
        let map = &mut self.maps[slot];
        mark_occupancy(map, start, pages, true);
        let high_water = map.header().allocated_pages().max(start + pages);
        map.header_mut().set_allocated_pages(high_water);
        PageHandle::new(map.index, start as u16)
    }

    /// Return a previously allocated run to the owning map's free list. No
    /// coalescing is performed with adjacent free runs; see module docs.
    pub fn pg_free(&mut self, handle: PageHandle) -> Result<()> {
        self.promote_if_frozen(handle.map_index)?;
        let slot = self
            .map_slot(handle.map_index)
            .ok_or(QpsError::Other("pg_free: unknown map index"))?;
        let start = handle.page_index as u32;
        let pages = page_list(self, slot)
            .allocated
            .remove(&start)
            .ok_or(QpsError::Other("pg_free: handle is not a live allocation"))?;
        mark_occupancy(&mut self.maps[slot], start, pages, false);
        page_list(self, slot).free(start, pages);
        Ok(())
    }

    /// Grow or shrink a page run, trying to do so in place (shrinking always
    /// succeeds in place; growing succeeds in place only if the pages
    /// immediately following the run are free) before falling back to a
    /// fresh allocation, copy, and free of the old run — in which case the
    /// returned handle differs from `handle` and callers must repoint
    /// whatever referenced the old one.
    pub fn pg_remap(&mut self, handle: PageHandle, new_pages: u32) -> Result<PageHandle> {
        if new_pages == 0 || new_pages as usize >= MAP_PAGES {
            return Err(QpsError::OutOfPages { pages: new_pages });
        }
        self.promote_if_frozen(handle.map_index)?;
        let slot = self
            .map_slot(handle.map_index)
            .ok_or(QpsError::Other("pg_remap: unknown map index"))?;
        let start = handle.page_index as u32;
        let old_pages = page_list(self, slot)
            .allocated
            .get(&start)
            .copied()
            .ok_or(QpsError::Other("pg_remap: handle is not a live allocation"))?;

        if new_pages == old_pages {
            return Ok(handle);
        }
        if new_pages < old_pages {
            let shrink_by = old_pages - new_pages;
            mark_occupancy(&mut self.maps[slot], start + new_pages, shrink_by, false);
            page_list(self, slot).free(start + new_pages, shrink_by);
            page_list(self, slot).allocated.insert(start, new_pages);
            return Ok(handle);
        }

        let extra = new_pages - old_pages;
        if page_list(self, slot).try_extend(start, old_pages, extra) {
            mark_occupancy(&mut self.maps[slot], start + old_pages, extra, true);
            let map = &mut self.maps[slot];
            let high_water = map.header().allocated_pages().max(start + new_pages);
            map.header_mut().set_allocated_pages(high_water);
            page_list(self, slot).allocated.insert(start, new_pages);
            return Ok(handle);
        }

        let fresh = self.pg_alloc(new_pages)?;
        let byte_start = start as usize * crate::PAGE_SIZE;
        let byte_len = old_pages as usize * crate::PAGE_SIZE;
        let old_bytes = self.maps[slot].bytes()[byte_start..byte_start + byte_len].to_vec();
        // Copy directly rather than through `pg_w_deref`, which only ever
        // hands back a single page: a multi-page run's bytes don't fit in
        // that slice once `old_pages > 1`.
        let fresh_slot = self
            .map_slot(fresh.map_index)
            .expect("pg_alloc just returned a live handle");
        let fresh_byte_start = fresh.page_index as usize * crate::PAGE_SIZE;
        self.maps[fresh_slot].bytes_mut()[fresh_byte_start..fresh_byte_start + old_bytes.len()]
            .copy_from_slice(&old_bytes);
        self.pg_free(handle)?;
        Ok(fresh)
    }

    /// The length, in pages, of the run starting at `handle`. Only
    /// answerable for runs allocated in the current process's lifetime: a
    /// page run carries no self-describing length the way a small-object
    /// block's boundary tags do, so a run's length is forgotten across a
    /// reopen along with the rest of the conservative free-list rebuild
    /// (see module docs).
    pub fn pg_sizeof(&self, handle: PageHandle) -> Result<u32> {
        let slot = self
            .map_slot(handle.map_index)
            .ok_or(QpsError::Other("pg_sizeof: unknown map index"))?;
        match &self.free_lists[slot] {
            crate::store::MapFreeListState::Page(list) => list
                .allocated
                .get(&(handle.page_index as u32))
                .copied()
                .ok_or(QpsError::Other("pg_sizeof: handle is not a live allocation")),
            crate::store::MapFreeListState::Memory(_) => {
                Err(QpsError::Other("pg_sizeof: not a page map"))
            }
        }
    }

    /// Borrow the raw bytes of an allocated page run. Callers index past
    /// `page_index` themselves for runs longer than one page.
    pub fn pg_deref(&self, handle: PageHandle) -> Result<&[u8]> {
        let map = self
            .map(handle.map_index)
            .ok_or(QpsError::InvalidHandle(crate::handle::Handle(handle.to_u32())))?;
        Ok(map.page(handle.page_index))
    }

    /// Mutable dereference: the explicit write barrier for page-granularity
    /// data. Unlike the original's SIGSEGV-driven copy-on-write, callers are
    /// required to call this (rather than mutate through a cached read
    /// reference) any time they intend to write, per §4's "explicit write
    /// barriers" design note. If `handle`'s map is frozen by an in-progress
    /// or already-committed snapshot, this forks it onto a fresh sibling
    /// file first (`StoreInner::promote_if_frozen`), so the write never
    /// touches bytes a snapshot is relying on staying put.
    pub fn pg_w_deref(&mut self, handle: PageHandle) -> Result<&mut [u8]> {
        self.promote_if_frozen(handle.map_index)?;
        let map = self
            .map_mut(handle.map_index)
            .ok_or(QpsError::InvalidHandle(crate::handle::Handle(handle.to_u32())))?;
        Ok(map.page_mut(handle.page_index))
    }

    pub fn pg_zero(&mut self, handle: PageHandle) -> Result<()> {
        self.pg_w_deref(handle)?.fill(0);
        Ok(())
    }

    /// Total free pages across every page map, used by [`StoreInner`]'s
    /// usage accounting and by the consistency checker.
    pub fn pg_largest_free_run(&self) -> u32 {
        self.free_lists
            .iter()
            .filter_map(|l| match l {
                crate::store::MapFreeListState::Page(l) => Some(l.largest_free_run()),
                crate::store::MapFreeListState::Memory(_) => None,
            })
            .max()
            .unwrap_or(0)
    }
}

fn mark_occupancy(map: &mut Map, start: u32, pages: u32, allocated: bool) {
    let bitmap = map.occupancy_bitmap_mut();
    for p in start..start + pages {
        let byte = (p / 8) as usize;
        let bit = 1u8 << (p % 8);
        if byte >= bitmap.len() {
            break;
        }
        if allocated {
            bitmap[byte] |= bit;
        } else {
            bitmap[byte] &= !bit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_of_matches_floor_log2() {
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(2), 1);
        assert_eq!(class_of(3), 1);
        assert_eq!(class_of(4), 2);
        assert_eq!(class_of(1 << 16), 16);
    }

    #[test]
    fn take_fit_returns_none_when_empty() {
        let mut list = MapFreeList::empty();
        assert!(list.take_fit(4).is_none());
    }

    #[test]
    fn take_fit_prefers_exact_class_before_spilling_up() {
        let mut list = MapFreeList::empty();
        list.insert(100, 4);
        list.insert(200, 64);
        let (start, len) = list.take_fit(4).unwrap();
        assert_eq!((start, len), (100, 4));
    }

    fn test_store() -> (tempfile::TempDir, crate::Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::Store::create(dir.path(), "paged-tests", b"").unwrap();
        (dir, store)
    }

    #[test]
    fn pg_alloc_free_round_trips_through_sizeof() {
        let (_dir, store) = test_store();
        let mut inner = store.lock();
        let handle = inner.pg_alloc(4).unwrap();
        assert_eq!(inner.pg_sizeof(handle).unwrap(), 4);
        inner.pg_free(handle).unwrap();
        assert!(inner.pg_sizeof(handle).is_err());
    }

    #[test]
    fn pg_remap_grows_in_place_into_adjacent_free_space() {
        let (_dir, store) = test_store();
        let mut inner = store.lock();
        let handle = inner.pg_alloc(4).unwrap();
        let grown = inner.pg_remap(handle, 8).unwrap();
        // The run immediately follows the first allocation in a freshly
        // created map, so growing fits in place and the handle is unchanged.
        assert_eq!(grown, handle);
        assert_eq!(inner.pg_sizeof(grown).unwrap(), 8);
    }

    #[test]
    fn pg_remap_shrink_frees_the_tail() {
        let (_dir, store) = test_store();
        let mut inner = store.lock();
        let handle = inner.pg_alloc(8).unwrap();
        let shrunk = inner.pg_remap(handle, 3).unwrap();
        assert_eq!(shrunk, handle);
        assert_eq!(inner.pg_sizeof(shrunk).unwrap(), 3);
        // The freed tail is available again for a fresh allocation.
        let reused = inner.pg_alloc(5).unwrap();
        assert_eq!(inner.pg_sizeof(reused).unwrap(), 5);
    }

    #[test]
    fn pg_remap_falls_back_to_a_fresh_run_when_boxed_in() {
        let (_dir, store) = test_store();
        let mut inner = store.lock();
        let first = inner.pg_alloc(4).unwrap();
        // Leaves no room immediately after `first` for it to grow in place.
        let _blocker = inner.pg_alloc(4).unwrap();
        let moved = inner.pg_remap(first, 8).unwrap();
        assert_ne!(moved, first);
        assert_eq!(inner.pg_sizeof(moved).unwrap(), 8);
        assert!(inner.pg_sizeof(first).is_err(), "the old run must be freed");
    }

    #[test]
    fn pg_alloc_skips_a_frozen_map_even_with_room_to_spare() {
        let (_dir, store) = test_store();
        let map_index = {
            let mut inner = store.lock();
            inner.pg_alloc(4).unwrap().map_index
        };
        store.snapshot().unwrap();
        assert!(store.snapshot_wait().unwrap());

        let mut inner = store.lock();
        let second = inner.pg_alloc(4).unwrap();
        assert_ne!(
            second.map_index, map_index,
            "a frozen map's free space must not be carved into"
        );
    }

    #[test]
    fn pg_w_deref_promotes_a_frozen_map_before_writing() {
        let (_dir, store) = test_store();
        let handle = {
            let mut inner = store.lock();
            let handle = inner.pg_alloc(4).unwrap();
            inner.pg_w_deref(handle).unwrap()[0] = 7;
            handle
        };
        store.snapshot().unwrap();
        assert!(store.snapshot_wait().unwrap());

        let mut inner = store.lock();
        assert!(inner.is_frozen(handle.map_index));
        inner.pg_w_deref(handle).unwrap()[0] = 9;
        assert!(!inner.is_frozen(handle.map_index), "the write must promote the map");
        assert_eq!(inner.pg_deref(handle).unwrap()[0], 9);
    }
}
