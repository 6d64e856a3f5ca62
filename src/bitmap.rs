//! C6: a sparse bitmap over the full 32-bit key space, organized as a
//! three-level trie — `root[64] -> dispatch[2048] -> leaf` — so that setting
//! a handful of scattered keys costs a handful of small allocations rather
//! than one 512 MiB array.
//!
//! A 32-bit key splits as `root(6) | dispatch(11) | leaf(15)`, matching
//! [`crate::BITMAP_ROOTS`] * [`crate::BITMAP_DISPATCH`] * leaf-bits ==
//! 2^32. Root and dispatch levels are arrays of [`crate::RelPtr`] (packed via
//! [`crate::RelPtr::to_u64`]) to the next level down, small-object allocated
//! through [`crate::small_alloc`] rather than bit-packed directly into page
//! bytes, per the design ledger's node-allocation simplification.
//!
//! The *nullable* flavour reserves two bits per key (absent / false / true)
//! instead of one, for maps that need to distinguish "never set" from
//! "explicitly set to false" — the bitmap behind a [`crate::hat::HatTrie`]'s
//! "is this key present" tracking when values are not densely packed.

use crate::error::Result;
use crate::store::Store;
use crate::{RelPtr, BITMAP_DISPATCH, BITMAP_LEAF_BITS, BITMAP_ROOTS};

const ROOT_ARRAY_BYTES: usize = BITMAP_ROOTS * 8;
const DISPATCH_ARRAY_BYTES: usize = BITMAP_DISPATCH * 8;
const LEAF_BYTES_PLAIN: usize = BITMAP_LEAF_BITS / 8;
const LEAF_BYTES_NULLABLE: usize = BITMAP_LEAF_BITS / 4; // 2 bits/key

const DISPATCH_BITS: u32 = 11;
const LEAF_BITS: u32 = 15;
const ROOT_SHIFT: u32 = DISPATCH_BITS + LEAF_BITS;
const DISPATCH_SHIFT: u32 = LEAF_BITS;
const DISPATCH_MASK: u32 = (1 << DISPATCH_BITS) - 1;
const LEAF_MASK: u32 = (1 << LEAF_BITS) - 1;

fn split(key: u32) -> (usize, usize, usize) {
    let root = (key >> ROOT_SHIFT) as usize;
    let dispatch = ((key >> DISPATCH_SHIFT) & DISPATCH_MASK) as usize;
    let leaf = (key & LEAF_MASK) as usize;
    (root, dispatch, leaf)
}

/// A handle to a bitmap's on-disk structure. Cheap to clone; all clones
/// share the same `root` pointer and the same underlying [`Store`].
#[derive(Clone)]
pub struct Bitmap {
    store: Store,
    nullable: bool,
    root: RelPtr,
}

impl Bitmap {
    /// Allocate a fresh, empty bitmap in `store`.
    pub fn create(store: &Store, nullable: bool) -> Result<Self> {
        let root = {
            let mut inner = store.lock();
            let root = inner.sm_alloc(ROOT_ARRAY_BYTES)?;
            inner.sm_w_deref(root)?.fill(0);
            root
        };
        Ok(Self {
            store: store.clone(),
            nullable,
            root,
        })
    }

    /// Re-attach to a bitmap previously created with [`Bitmap::create`],
    /// given the root pointer the caller persisted (e.g. in the HAT-trie
    /// node that owns it).
    pub fn open(store: &Store, root: RelPtr, nullable: bool) -> Self {
        Self {
            store: store.clone(),
            nullable,
            root,
        }
    }

    pub fn root(&self) -> RelPtr {
        self.root
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    fn leaf_bytes(&self) -> usize {
        if self.nullable {
            LEAF_BYTES_NULLABLE
        } else {
            LEAF_BYTES_PLAIN
        }
    }

    fn read_slot(&self, array: RelPtr, index: usize) -> Result<RelPtr> {
        let inner = self.store.lock();
        let bytes = inner.sm_deref(array)?;
        let raw = u64::from_le_bytes(bytes[index * 8..index * 8 + 8].try_into().unwrap());
        Ok(RelPtr::from_u64(raw))
    }

    fn write_slot(&self, array: RelPtr, index: usize, value: RelPtr) -> Result<()> {
        let mut inner = self.store.lock();
        let bytes = inner.sm_w_deref(array)?;
        bytes[index * 8..index * 8 + 8].copy_from_slice(&value.to_u64().to_le_bytes());
        Ok(())
    }

    fn dispatch_for(&self, root_index: usize, create: bool) -> Result<Option<RelPtr>> {
        let slot = self.read_slot(self.root, root_index)?;
        if !slot.is_null() || !create {
            return Ok(if slot.is_null() { None } else { Some(slot) });
        }
        let fresh = {
            let mut inner = self.store.lock();
            let ptr = inner.sm_alloc(DISPATCH_ARRAY_BYTES)?;
            inner.sm_w_deref(ptr)?.fill(0);
            ptr
        };
        self.write_slot(self.root, root_index, fresh)?;
        Ok(Some(fresh))
    }

    fn leaf_for(&self, dispatch: RelPtr, dispatch_index: usize, create: bool) -> Result<Option<RelPtr>> {
        let slot = self.read_slot(dispatch, dispatch_index)?;
        if !slot.is_null() || !create {
            return Ok(if slot.is_null() { None } else { Some(slot) });
        }
        let fresh = {
            let mut inner = self.store.lock();
            let ptr = inner.sm_alloc(self.leaf_bytes())?;
            inner.sm_w_deref(ptr)?.fill(0);
            ptr
        };
        self.write_slot(dispatch, dispatch_index, fresh)?;
        Ok(Some(fresh))
    }

    /// Non-nullable read: absent keys read as `false`.
    pub fn get(&self, key: u32) -> Result<bool> {
        Ok(self.get_nullable(key)?.unwrap_or(false))
    }

    /// Nullable read: `None` for a key that was never set (or was
    /// [`Bitmap::remove`]d).
    pub fn get_nullable(&self, key: u32) -> Result<Option<bool>> {
        let (root_index, dispatch_index, leaf_index) = split(key);
        let Some(dispatch) = self.dispatch_for(root_index, false)? else {
            return Ok(None);
        };
        let Some(leaf) = self.leaf_for(dispatch, dispatch_index, false)? else {
            return Ok(None);
        };
        let inner = self.store.lock();
        let bytes = inner.sm_deref(leaf)?;
        Ok(Some(read_bit(bytes, leaf_index, self.nullable).unwrap_or(false)))
    }

    pub fn set(&self, key: u32, value: bool) -> Result<()> {
        let (root_index, dispatch_index, leaf_index) = split(key);
        let dispatch = self.dispatch_for(root_index, true)?.unwrap();
        let leaf = self.leaf_for(dispatch, dispatch_index, true)?.unwrap();
        let mut inner = self.store.lock();
        let bytes = inner.sm_w_deref(leaf)?;
        write_bit(bytes, leaf_index, Some(value), self.nullable);
        Ok(())
    }

    /// Nullable-only: reset a key to "never set". A no-op on a non-nullable
    /// bitmap beyond clearing the bit to `false`, since it has no null state.
    pub fn remove(&self, key: u32) -> Result<()> {
        let (root_index, dispatch_index, leaf_index) = split(key);
        let Some(dispatch) = self.dispatch_for(root_index, false)? else {
            return Ok(());
        };
        let Some(leaf) = self.leaf_for(dispatch, dispatch_index, false)? else {
            return Ok(());
        };
        let mut inner = self.store.lock();
        let bytes = inner.sm_w_deref(leaf)?;
        write_bit(bytes, leaf_index, None, self.nullable);
        Ok(())
    }

    pub fn clear_all(&self, key: u32) -> Result<()> {
        self.set(key, false)
    }

    /// Free every array this bitmap owns. The `Bitmap` must not be used
    /// afterwards.
    pub fn destroy(self) -> Result<()> {
        let mut inner = self.store.lock();
        for root_index in 0..BITMAP_ROOTS {
            let dispatch = RelPtr::from_u64(u64::from_le_bytes(
                inner.sm_deref(self.root)?[root_index * 8..root_index * 8 + 8]
                    .try_into()
                    .unwrap(),
            ));
            if dispatch.is_null() {
                continue;
            }
            for dispatch_index in 0..BITMAP_DISPATCH {
                let leaf = RelPtr::from_u64(u64::from_le_bytes(
                    inner.sm_deref(dispatch)?[dispatch_index * 8..dispatch_index * 8 + 8]
                        .try_into()
                        .unwrap(),
                ));
                if !leaf.is_null() {
                    inner.sm_free(leaf)?;
                }
            }
            inner.sm_free(dispatch)?;
        }
        inner.sm_free(self.root)?;
        Ok(())
    }

    /// A restartable enumerator positioned at the first set key at or after
    /// `from`.
    pub fn enumerate_from(&self, from: u32) -> Enumerator<'_> {
        Enumerator {
            bitmap: self,
            next_key: Some(from),
        }
    }
}

fn read_bit(leaf_bytes: &[u8], index: usize, nullable: bool) -> Option<bool> {
    if nullable {
        let byte = leaf_bytes[index / 4];
        let shift = (index % 4) * 2;
        match (byte >> shift) & 0b11 {
            0 => None,
            1 => Some(false),
            _ => Some(true),
        }
    } else {
        let byte = leaf_bytes[index / 8];
        Some(byte & (1 << (index % 8)) != 0)
    }
}

fn write_bit(leaf_bytes: &mut [u8], index: usize, value: Option<bool>, nullable: bool) {
    if nullable {
        let code: u8 = match value {
            None => 0b00,
            Some(false) => 0b01,
            Some(true) => 0b10,
        };
        let byte_index = index / 4;
        let shift = (index % 4) * 2;
        leaf_bytes[byte_index] = (leaf_bytes[byte_index] & !(0b11 << shift)) | (code << shift);
    } else {
        let byte_index = index / 8;
        let bit = 1 << (index % 8);
        if value.unwrap_or(false) {
            leaf_bytes[byte_index] |= bit;
        } else {
            leaf_bytes[byte_index] &= !bit;
        }
    }
}

/// A forward, restartable iterator over a bitmap's set (or, for a nullable
/// bitmap, non-null) keys. "Restartable" because it holds no borrow across
/// calls to [`Enumerator::next`] beyond `bitmap`'s shared reference — a
/// caller that mutates the bitmap between calls just sees the new state, it
/// never observes a torn read, matching the single-writer concurrency model.
pub struct Enumerator<'a> {
    bitmap: &'a Bitmap,
    next_key: Option<u32>,
}

impl<'a> Enumerator<'a> {
    /// Jump directly to `key`, discarding any in-progress position. Cheap:
    /// `next()` recomputes the root/dispatch/leaf path from scratch anyway.
    pub fn goto(&mut self, key: u32) {
        self.next_key = Some(key);
    }

    pub fn next(&mut self) -> Result<Option<(u32, bool)>> {
        loop {
            let Some(key) = self.next_key else {
                return Ok(None);
            };
            if self.bitmap.get_nullable(key)?.is_some() {
                self.next_key = key.checked_add(1);
                return Ok(Some((key, self.bitmap.get(key)?)));
            }
            let Some(next) = key.checked_add(1) else {
                self.next_key = None;
                return Ok(None);
            };
            self.next_key = Some(next);
        }
    }
}

/// Every page handle a bitmap currently owns, for [`crate::consistency`]'s
/// root-set reachability sweep.
pub fn roots(bitmap: &Bitmap) -> Result<Vec<RelPtr>> {
    let mut out = vec![bitmap.root];
    let inner = bitmap.store.lock();
    for root_index in 0..BITMAP_ROOTS {
        let dispatch = RelPtr::from_u64(u64::from_le_bytes(
            inner.sm_deref(bitmap.root)?[root_index * 8..root_index * 8 + 8]
                .try_into()
                .unwrap(),
        ));
        if dispatch.is_null() {
            continue;
        }
        out.push(dispatch);
        for dispatch_index in 0..BITMAP_DISPATCH {
            let leaf = RelPtr::from_u64(u64::from_le_bytes(
                inner.sm_deref(dispatch)?[dispatch_index * 8..dispatch_index * 8 + 8]
                    .try_into()
                    .unwrap(),
            ));
            if !leaf.is_null() {
                out.push(leaf);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_covers_the_full_key_space() {
        assert_eq!(split(0), (0, 0, 0));
        let (r, d, l) = split(u32::MAX);
        assert_eq!(r, BITMAP_ROOTS - 1);
        assert_eq!(d, BITMAP_DISPATCH - 1);
        assert_eq!(l, (1 << LEAF_BITS) - 1);
    }

    #[test]
    fn plain_bit_round_trips() {
        let mut leaf = vec![0u8; LEAF_BYTES_PLAIN];
        write_bit(&mut leaf, 10, Some(true), false);
        assert_eq!(read_bit(&leaf, 10, false), Some(true));
        write_bit(&mut leaf, 10, Some(false), false);
        assert_eq!(read_bit(&leaf, 10, false), Some(false));
    }

    #[test]
    fn nullable_bit_distinguishes_absent_from_false() {
        let mut leaf = vec![0u8; LEAF_BYTES_NULLABLE];
        assert_eq!(read_bit(&leaf, 5, true), None);
        write_bit(&mut leaf, 5, Some(false), true);
        assert_eq!(read_bit(&leaf, 5, true), Some(false));
        write_bit(&mut leaf, 5, None, true);
        assert_eq!(read_bit(&leaf, 5, true), None);
    }
}
