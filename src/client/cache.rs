//! Client-side tag descriptor cache.
//!
//! Lookups by name or index hit the server once; the handful of tags a
//! module works with stay cached until the tag is deleted or the entry is
//! evicted. The cache is intentionally tiny: modules touch few tags, and a
//! stale descriptor is re-fetched on the first failed access.

use crate::tagbase::TagDesc;

/// Default number of cached descriptors.
pub const CACHE_SIZE: usize = 8;

#[derive(Debug)]
struct CacheEntry {
    desc: TagDesc,
    used: u64,
}

/// Small least-recently-used descriptor cache.
#[derive(Debug)]
pub struct TagCache {
    entries: Vec<CacheEntry>,
    capacity: usize,
    tick: u64,
}

impl TagCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self, pos: usize) -> &TagDesc {
        self.tick += 1;
        self.entries[pos].used = self.tick;
        &self.entries[pos].desc
    }

    pub fn get_by_name(&mut self, name: &str) -> Option<TagDesc> {
        let pos = self.entries.iter().position(|e| e.desc.name == name)?;
        Some(self.touch(pos).clone())
    }

    pub fn get_by_index(&mut self, index: u32) -> Option<TagDesc> {
        let pos = self.entries.iter().position(|e| e.desc.index == index)?;
        Some(self.touch(pos).clone())
    }

    /// Insert a descriptor, evicting the least recently used entry when
    /// full.
    pub fn insert(&mut self, desc: TagDesc) {
        self.tick += 1;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.desc.index == desc.index) {
            entry.desc = desc;
            entry.used = self.tick;
            return;
        }
        if self.entries.len() == self.capacity {
            if let Some(pos) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.used)
                .map(|(i, _)| i)
            {
                self.entries.swap_remove(pos);
            }
        }
        self.entries.push(CacheEntry {
            desc,
            used: self.tick,
        });
    }

    /// Drop a cached tag, typically after a delete.
    pub fn invalidate(&mut self, index: u32) {
        self.entries.retain(|e| e.desc.index != index);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
