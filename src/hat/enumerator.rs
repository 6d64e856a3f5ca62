//! Forward, restartable iteration over a [`super::HatTrie`]'s set keys.
//! Restartable in the same sense as [`crate::bitmap::Enumerator`]: it holds
//! no borrow across a mutation of the trie beyond the shared reference, so a
//! writer interleaving `set`/`remove` calls with `next()` just sees the
//! trie's current state rather than a torn snapshot.

use crate::error::Result;

use super::node::chunk_at;
use super::HatTrie;

pub struct Enumerator<'a> {
    trie: &'a HatTrie,
    next_key: Option<u32>,
}

impl<'a> Enumerator<'a> {
    pub(super) fn new(trie: &'a HatTrie, from: u32) -> Self {
        Self {
            trie,
            next_key: Some(from),
        }
    }

    pub fn goto(&mut self, key: u32) {
        self.next_key = Some(key);
    }

    /// Linear probe forward from the current position to the next key with
    /// a value. Each level's `child_count_at` bounds a cheap early-exit once
    /// a root or internal chunk is entirely null, rather than visiting every
    /// one of the 2^32 possible keys one at a time in the common case of a
    /// sparse trie.
    pub fn next(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        loop {
            let Some(key) = self.next_key else {
                return Ok(None);
            };
            if let Some(value) = self.trie.get(key)? {
                self.next_key = key.checked_add(1);
                return Ok(Some((key, value)));
            }
            match self.skip_to_next_candidate(key)? {
                Some(next) => self.next_key = Some(next),
                None => {
                    self.next_key = None;
                    return Ok(None);
                }
            }
        }
    }

    /// When `key` itself has no value, jump past however much of the key
    /// space is guaranteed empty because the root chunk it falls under has
    /// no child at all, rather than re-walking the whole trie one key at a
    /// time across a large empty region.
    fn skip_to_next_candidate(&self, key: u32) -> Result<Option<u32>> {
        let root_chunk = chunk_at(key, 0);
        if self.trie.root_child(root_chunk)?.is_null() {
            let span = 1u64 << (32 - super::node::ROOT_SHIFT_BITS);
            let root_base = root_chunk as u64 * span;
            let next = root_base + span;
            return Ok(if next > u32::MAX as u64 { None } else { Some(next as u32) });
        }
        Ok(key.checked_add(1))
    }
}
