//! C3: stable relocatable handles. A [`Handle`] is a small integer that
//! indirects to a [`crate::RelPtr`], so the owner of a handle survives a
//! relocation (a HAT-trie node splitting from compact to flat, a
//! small-object realloc moving a block) without every parent pointer in the
//! tree needing to be patched: only the one slot in the table changes.
//!
//! Handles are a volatile, process-local indirection layer, not themselves a
//! disk format: what's durable across a reopen is the `RelPtr`/`PageHandle`
//! each structure's *root* holds directly (see the map catalog in
//! [`crate::store::meta`]). On open, [`HandleTable::rebuild`] starts empty
//! and [`crate::hat::HatTrie`] / [`crate::bitmap::Bitmap`] register the
//! handles for the nodes they touch as they walk down from their root, the
//! same way [`crate::consistency`]'s reachability check walks the tree from
//! its roots. This mirrors the teacher's `IdTracker`, which also keeps no
//! on-disk form and is reconstructed from the checked-out root on open.

use crate::RelPtr;

/// A stable, process-local reference to a relocatable object. `Handle(0)` is
/// reserved as the null handle and is never returned by [`HandleTable::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub u32);

impl Handle {
    pub const NULL: Handle = Handle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

enum Slot {
    Free { next: u32 },
    Used { target: RelPtr, generation: u32 },
}

const NO_NEXT: u32 = u32::MAX;

/// A cache-line-sized direct-mapped cache from handle to its last-known
/// `RelPtr`, invalidated on a per-entry basis by comparing the table's
/// current generation for that slot. Matches the design notes' "a
/// dereference cache invalidated by a GC generation counter": rather than
/// flushing the whole cache on every relocation, each cache line remembers
/// the generation it was filled at and is checked against the live slot.
const CACHE_LINES: usize = 64;

#[derive(Clone, Copy)]
struct CacheLine {
    handle: u32,
    target: RelPtr,
    generation: u32,
}

const EMPTY_LINE: CacheLine = CacheLine {
    handle: u32::MAX,
    target: RelPtr::NULL,
    generation: 0,
};

pub struct HandleTable {
    slots: Vec<Slot>,
    free_head: u32,
    cache: [CacheLine; CACHE_LINES],
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            // slot 0 is permanently reserved for Handle::NULL.
            slots: vec![Slot::Used {
                target: RelPtr::NULL,
                generation: 0,
            }],
            free_head: NO_NEXT,
            cache: [EMPTY_LINE; CACHE_LINES],
        }
    }

    /// Discard all handle state. Called on store open; see module docs for
    /// why there's nothing to load from disk.
    pub fn rebuild(&mut self, _maps: &[crate::store::map::Map]) {
        *self = Self::new();
    }

    pub fn alloc(&mut self, target: RelPtr) -> Handle {
        if self.free_head != NO_NEXT {
            let index = self.free_head;
            let generation = match self.slots[index as usize] {
                Slot::Free { next } => {
                    self.free_head = next;
                    self.next_generation(index)
                }
                Slot::Used { .. } => unreachable!("free list points at a used slot"),
            };
            self.slots[index as usize] = Slot::Used { target, generation };
            return Handle(index);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Used {
            target,
            generation: 0,
        });
        Handle(index)
    }

    fn next_generation(&self, index: u32) -> u32 {
        match self.slots.get(index as usize) {
            Some(Slot::Used { generation, .. }) => generation.wrapping_add(1),
            _ => 0,
        }
    }

    pub fn free(&mut self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        let Some(slot) = self.slots.get_mut(handle.0 as usize) else {
            return;
        };
        *slot = Slot::Free {
            next: self.free_head,
        };
        self.free_head = handle.0;
    }

    pub fn deref(&mut self, handle: Handle) -> Option<RelPtr> {
        if handle.is_null() {
            return Some(RelPtr::NULL);
        }
        let line = &mut self.cache[handle.0 as usize % CACHE_LINES];
        match self.slots.get(handle.0 as usize) {
            Some(Slot::Used { target, generation }) => {
                if line.handle == handle.0 && line.generation == *generation {
                    return Some(line.target);
                }
                *line = CacheLine {
                    handle: handle.0,
                    target: *target,
                    generation: *generation,
                };
                Some(*target)
            }
            _ => None,
        }
    }

    /// Update a handle's target after the object it names has been moved,
    /// bumping its generation so any stale cache line misses next lookup.
    pub fn relocate(&mut self, handle: Handle, new_target: RelPtr) {
        if let Some(Slot::Used { target, generation }) = self.slots.get_mut(handle.0 as usize) {
            *target = new_target;
            *generation = generation.wrapping_add(1);
        }
    }

    /// Discard every cache line without touching any slot's target or
    /// generation. Called by a copy-on-write promotion, which moves an
    /// object's backing bytes to a new map without going through
    /// [`HandleTable::relocate`] for any individual slot — see
    /// `StoreInner::promote_if_frozen`.
    pub fn invalidate_cache(&mut self) {
        self.cache = [EMPTY_LINE; CACHE_LINES];
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Used { .. }))
            .count()
            .saturating_sub(1) // exclude the reserved null slot
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageHandle;

    fn ptr(offset: u16) -> RelPtr {
        RelPtr {
            page: PageHandle::new(1, 2),
            offset,
        }
    }

    #[test]
    fn alloc_deref_round_trips() {
        let mut table = HandleTable::new();
        let h = table.alloc(ptr(10));
        assert_eq!(table.deref(h), Some(ptr(10)));
    }

    #[test]
    fn freed_slot_is_reused_with_bumped_generation() {
        let mut table = HandleTable::new();
        let h1 = table.alloc(ptr(1));
        table.free(h1);
        let h2 = table.alloc(ptr(2));
        assert_eq!(h1, h2);
        assert_eq!(table.deref(h2), Some(ptr(2)));
    }

    #[test]
    fn relocate_invalidates_cached_value() {
        let mut table = HandleTable::new();
        let h = table.alloc(ptr(1));
        assert_eq!(table.deref(h), Some(ptr(1)));
        table.relocate(h, ptr(99));
        assert_eq!(table.deref(h), Some(ptr(99)));
    }

    #[test]
    fn null_handle_derefs_to_null_relptr() {
        let mut table = HandleTable::new();
        assert_eq!(table.deref(Handle::NULL), Some(RelPtr::NULL));
    }

    #[test]
    fn invalidate_cache_clears_lines_without_losing_slots() {
        let mut table = HandleTable::new();
        let h = table.alloc(ptr(7));
        assert_eq!(table.deref(h), Some(ptr(7)));
        table.invalidate_cache();
        assert_eq!(table.deref(h), Some(ptr(7)));
    }
}
