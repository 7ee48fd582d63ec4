//! Mapping engine: directed copy rules between tag regions.
//!
//! A write overlapping a mapping's source handle fans the intersecting
//! bytes out into the destination handle synchronously, which may trigger
//! further mappings and events. The server core carries a per-write
//! visited set keyed by tag index; a repeated visit terminates propagation
//! silently.

use std::collections::HashMap;

use crate::error::{DaxResult, ErrorCode};
use crate::tagbase::TagHandle;

/// One copy rule.
#[derive(Debug, Clone)]
pub struct TagMap {
    pub id: u32,
    /// Connection that created the rule
    pub owner: u32,
    pub src: TagHandle,
    pub dst: TagHandle,
}

/// All registered mappings, with a source-tag index for the write path.
#[derive(Debug, Default)]
pub struct MapTable {
    maps: HashMap<u32, TagMap>,
    by_src: HashMap<u32, Vec<u32>>,
    next_id: u32,
}

impl MapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Register a mapping. The handles must describe regions of equal
    /// shape: equal bit counts for bit regions, equal byte sizes
    /// otherwise.
    pub fn add(&mut self, owner: u32, src: TagHandle, dst: TagHandle) -> DaxResult<u32> {
        let compatible = if src.is_bit() || dst.is_bit() {
            src.is_bit() && dst.is_bit() && src.count == dst.count
        } else {
            src.size == dst.size
        };
        if !compatible {
            return Err(ErrorCode::Arg);
        }
        if src.index == dst.index && src.byte == dst.byte && src.bit == dst.bit {
            return Err(ErrorCode::Arg);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.maps.insert(id, TagMap { id, owner, src, dst });
        self.by_src.entry(src.index).or_default().push(id);
        Ok(id)
    }

    pub fn del(&mut self, owner: u32, id: u32) -> DaxResult<()> {
        match self.maps.get(&id) {
            Some(m) if m.owner == owner => {}
            _ => return Err(ErrorCode::NotFound),
        }
        let map = self.maps.remove(&id).ok_or(ErrorCode::NotFound)?;
        if let Some(ids) = self.by_src.get_mut(&map.src.index) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.by_src.remove(&map.src.index);
            }
        }
        Ok(())
    }

    pub fn get(&self, id: u32) -> DaxResult<&TagMap> {
        self.maps.get(&id).ok_or(ErrorCode::NotFound)
    }

    /// Mappings whose source region lies in `tag`, in creation order.
    pub fn for_src_tag(&self, tag: u32) -> Vec<TagMap> {
        let mut out: Vec<TagMap> = self
            .by_src
            .get(&tag)
            .into_iter()
            .flatten()
            .filter_map(|id| self.maps.get(id).cloned())
            .collect();
        out.sort_by_key(|m| m.id);
        out
    }

    /// Remove every mapping owned by a disconnecting connection.
    pub fn drop_connection(&mut self, owner: u32) {
        let ids: Vec<u32> = self
            .maps
            .values()
            .filter(|m| m.owner == owner)
            .map(|m| m.id)
            .collect();
        for id in ids {
            let _ = self.del(owner, id);
        }
    }

    /// Remove every mapping that reads from or writes to a deleted tag.
    pub fn drop_tag(&mut self, tag: u32) {
        let ids: Vec<u32> = self
            .maps
            .values()
            .filter(|m| m.src.index == tag || m.dst.index == tag)
            .map(|m| m.id)
            .collect();
        for id in ids {
            if let Some(map) = self.maps.remove(&id) {
                if let Some(list) = self.by_src.get_mut(&map.src.index) {
                    list.retain(|&i| i != id);
                    if list.is_empty() {
                        self.by_src.remove(&map.src.index);
                    }
                }
            }
        }
    }
}
