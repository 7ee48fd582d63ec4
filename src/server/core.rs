//! Shared server state and the write orchestration path.
//!
//! One `ServerCore` sits behind the coarse database lock. Every mutation
//! funnels through here so events, mappings, retention, and override
//! visibility stay consistent: a write applies to the tag, event
//! predicates evaluate on the post-write visible value, then mappings fan
//! out depth-first with a per-write visited set stopping cycles.

use std::collections::{HashMap, HashSet};

use crate::error::{DaxResult, ErrorCode};
use crate::events::{EventKind, EventTable, Notification};
use crate::groups::GroupTable;
use crate::logger::Topics;
use crate::mapping::{MapTable, TagMap};
use crate::retention::RetentionStore;
use crate::tagbase::{
    atomic_apply, AtomicOp, TagAttr, TagBase, TagData, TagHandle, TagOverride,
};
use crate::topic_log;
use crate::types::{element_type, TypeCode, TypeRegistry, DAX_BOOL};

/// A registered module connection.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    pub name: String,
    pub registered_ms: i64,
}

/// All state guarded by the database lock.
pub struct ServerCore {
    pub types: TypeRegistry,
    pub tags: TagBase,
    pub events: EventTable,
    pub maps: MapTable,
    pub groups: GroupTable,
    pub retention: RetentionStore,
    pub modules: HashMap<u32, ModuleInfo>,
    max_message_size: u32,
}

impl ServerCore {
    pub fn new(
        tags: TagBase,
        retention: RetentionStore,
        max_message_size: u32,
    ) -> Self {
        Self {
            types: TypeRegistry::new(),
            tags,
            events: EventTable::new(),
            maps: MapTable::new(),
            groups: GroupTable::new(),
            retention,
            modules: HashMap::new(),
            max_message_size,
        }
    }

    /// Payload ceiling for group registration and message sanity checks.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    // ------------------------------------------------------------------
    // modules

    pub fn module_register(&mut self, conn: u32, name: String, now_ms: i64) -> DaxResult<()> {
        if name.len() > 254 {
            return Err(ErrorCode::TooBig);
        }
        if self.modules.contains_key(&conn) {
            return Err(ErrorCode::Dupl);
        }
        topic_log!(Topics::MODULE, "module '{}' registered on connection {}", name, conn);
        self.modules.insert(
            conn,
            ModuleInfo {
                name,
                registered_ms: now_ms,
            },
        );
        Ok(())
    }

    pub fn module_unregister(&mut self, conn: u32) -> DaxResult<()> {
        match self.modules.remove(&conn) {
            Some(info) => {
                topic_log!(Topics::MODULE, "module '{}' unregistered", info.name);
                Ok(())
            }
            None => Err(ErrorCode::NotFound),
        }
    }

    pub fn module_registered(&self, conn: u32) -> bool {
        self.modules.contains_key(&conn)
    }

    // ------------------------------------------------------------------
    // tags

    /// Create a tag, restoring a retained value when one is stored.
    pub fn tag_add(
        &mut self,
        name: &str,
        type_code: TypeCode,
        count: u32,
        attr: TagAttr,
    ) -> DaxResult<u32> {
        let existed = self.tags.index_of(name).is_ok();
        let index = self.tags.add(&self.types, name, type_code, count, attr)?;
        if !existed && attr.contains(TagAttr::RETAIN) && !attr.contains(TagAttr::QUEUE) {
            let elem = element_type(type_code);
            let size = self.types.tag_data_size(elem, count)?;
            if let Some(data) = self.retention.restore(name, elem, count, size) {
                self.tags.write_bytes(index, 0, &data)?;
            }
        }
        Ok(index)
    }

    /// Delete a tag along with every event, mapping, override, and group
    /// that references it.
    pub fn tag_del(&mut self, index: u32) -> DaxResult<()> {
        let tag = self.tags.del(index)?;
        self.events.drop_tag(index);
        self.maps.drop_tag(index);
        self.groups.drop_tag(index);
        self.retention.forget(&tag.name, index);
        Ok(())
    }

    /// Read a region of a tag's visible payload; queue tags pop their
    /// oldest element instead.
    pub fn tag_read(
        &mut self,
        index: u32,
        offset: u32,
        len: u32,
        now_ms: i64,
    ) -> DaxResult<Vec<u8>> {
        let attr = self.tags.get(index)?.attr;
        if attr.contains(TagAttr::QUEUE) {
            return self.tags.queue_pop(index).map_err(|e| match e {
                ErrorCode::Empty => ErrorCode::NotFound,
                other => other,
            });
        }
        self.tags.read(index, offset, len, now_ms)
    }

    /// Apply a write (or masked write) through the full orchestration
    /// path. Returns the notifications captured along the way.
    pub fn tag_write(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        mask: Option<&[u8]>,
        now_ms: i64,
    ) -> DaxResult<Vec<Notification>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        self.apply_write(index, offset, data, mask, now_ms, true, &mut visited, &mut out)?;
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_write(
        &mut self,
        index: u32,
        offset: u32,
        data: &[u8],
        mask: Option<&[u8]>,
        now_ms: i64,
        check_readonly: bool,
        visited: &mut HashSet<u32>,
        out: &mut Vec<Notification>,
    ) -> DaxResult<()> {
        let attr = self.tags.get(index)?.attr;
        if check_readonly && attr.contains(TagAttr::READONLY) {
            return Err(ErrorCode::ReadOnly);
        }

        if attr.contains(TagAttr::QUEUE) {
            self.tags.queue_push(index, data)?;
            self.events.evaluate_push(index, data, out);
            return Ok(());
        }

        match mask {
            Some(m) => self.tags.mask_write_bytes(index, offset, data, m)?,
            None => self.tags.write_bytes(index, offset, data)?,
        }

        // events see the post-write visible value of this tag first
        let new_visible = self.tags.visible_payload(index, now_ms)?;
        self.events
            .evaluate(index, offset, data.len() as u32, &new_visible, out);

        if attr.contains(TagAttr::RETAIN) {
            self.retention.mark_dirty(index);
        }

        // then mappings fan out depth-first
        visited.insert(index);
        for map in self.maps.for_src_tag(index) {
            if visited.contains(&map.dst.index) {
                continue;
            }
            if let Err(e) = self.propagate(&map, offset, data.len() as u32, &new_visible, now_ms, visited, out)
            {
                topic_log!(
                    Topics::ERROR,
                    "mapping {}: propagation to tag {} failed: {}",
                    map.id,
                    map.dst.index,
                    e
                );
            }
        }
        Ok(())
    }

    /// Copy the bytes of a write that intersect a mapping's source region
    /// into its destination.
    fn propagate(
        &mut self,
        map: &TagMap,
        offset: u32,
        len: u32,
        src_visible: &[u8],
        now_ms: i64,
        visited: &mut HashSet<u32>,
        out: &mut Vec<Notification>,
    ) -> DaxResult<()> {
        if map.src.is_bit() {
            // bit regions copy bit-aligned through a masked write
            let src_start = map.src.byte as u64 * 8 + map.src.bit as u64;
            let src_end = src_start + map.src.count as u64;
            let w_start = offset as u64 * 8;
            let w_end = (offset + len) as u64 * 8;
            let o_start = src_start.max(w_start);
            let o_end = src_end.min(w_end);
            if o_start >= o_end {
                return Ok(());
            }
            let dst_base = map.dst.byte as u64 * 8 + map.dst.bit as u64;
            let mut first_byte = u64::MAX;
            let mut last_byte = 0u64;
            for pos in o_start..o_end {
                let d = dst_base + (pos - src_start);
                first_byte = first_byte.min(d / 8);
                last_byte = last_byte.max(d / 8);
            }
            let span = (last_byte - first_byte + 1) as usize;
            let mut bits = vec![0u8; span];
            let mut maskbuf = vec![0u8; span];
            for pos in o_start..o_end {
                let s_byte = (pos / 8) as usize;
                if s_byte >= src_visible.len() {
                    break;
                }
                let bit = src_visible[s_byte] >> (pos % 8) & 1;
                let d = dst_base + (pos - src_start);
                let rel = (d / 8 - first_byte) as usize;
                maskbuf[rel] |= 1 << (d % 8);
                if bit != 0 {
                    bits[rel] |= 1 << (d % 8);
                }
            }
            self.apply_write(
                map.dst.index,
                first_byte as u32,
                &bits,
                Some(&maskbuf),
                now_ms,
                false,
                visited,
                out,
            )
        } else {
            let src_start = map.src.byte;
            let src_end = map.src.byte + map.src.size;
            let o_start = src_start.max(offset);
            let o_end = src_end.min(offset + len);
            if o_start >= o_end {
                return Ok(());
            }
            let start = o_start as usize;
            let end = (o_end as usize).min(src_visible.len());
            if start >= end {
                return Ok(());
            }
            let dst_offset = map.dst.byte + (o_start - src_start);
            let chunk = src_visible[start..end].to_vec();
            self.apply_write(
                map.dst.index,
                dst_offset,
                &chunk,
                None,
                now_ms,
                false,
                visited,
                out,
            )
        }
    }

    // ------------------------------------------------------------------
    // atomic operations

    /// Read-modify-write on a region, under the lock, routed through the
    /// normal write path so events and mappings observe the result.
    pub fn atomic_op(
        &mut self,
        handle: &TagHandle,
        op: AtomicOp,
        operand: &[u8],
        now_ms: i64,
    ) -> DaxResult<Vec<Notification>> {
        let tag = self.tags.get(handle.index)?;
        if tag.attr.contains(TagAttr::READONLY) {
            return Err(ErrorCode::ReadOnly);
        }
        if tag.attr.contains(TagAttr::QUEUE) {
            return Err(ErrorCode::Illegal);
        }
        let raw = tag.raw_data();
        let start = handle.byte as usize;
        let end = start + handle.size as usize;
        if end > raw.len() {
            return Err(ErrorCode::TooBig);
        }
        let new = atomic_apply(
            handle.type_code,
            op,
            &raw[start..end],
            operand,
            handle.count,
        )?;
        self.tag_write(handle.index, handle.byte, &new, None, now_ms)
    }

    // ------------------------------------------------------------------
    // overrides

    fn override_transition(
        &mut self,
        index: u32,
        before: Vec<u8>,
        now_ms: i64,
        out: &mut Vec<Notification>,
    ) -> DaxResult<()> {
        let after = self.tags.visible_payload(index, now_ms)?;
        if before != after {
            self.events
                .evaluate(index, 0, after.len() as u32, &after, out);
        }
        Ok(())
    }

    /// Store (or replace) a tag's override shadow without arming it.
    pub fn override_add(
        &mut self,
        conn: u32,
        index: u32,
        data: Vec<u8>,
        now_ms: i64,
    ) -> DaxResult<Vec<Notification>> {
        let before = self.tags.visible_payload(index, now_ms)?;
        let tag = self.tags.get_mut(index)?;
        if tag.attr.contains(TagAttr::SPECIAL) {
            return Err(ErrorCode::ReadOnly);
        }
        if matches!(tag.data, TagData::Queue(_)) {
            return Err(ErrorCode::Illegal);
        }
        if data.len() != tag.raw_data().len() {
            return Err(ErrorCode::Arg);
        }
        let armed = tag.ovr.as_ref().map(|o| o.armed).unwrap_or(false);
        tag.ovr = Some(Box::new(TagOverride {
            data,
            armed,
            owner: conn,
        }));
        let mut out = Vec::new();
        self.override_transition(index, before, now_ms, &mut out)?;
        Ok(out)
    }

    /// Arm an override; the shadow becomes the visible value.
    pub fn override_set(&mut self, index: u32, now_ms: i64) -> DaxResult<Vec<Notification>> {
        let before = self.tags.visible_payload(index, now_ms)?;
        let tag = self.tags.get_mut(index)?;
        let ovr = tag.ovr.as_mut().ok_or(ErrorCode::NotFound)?;
        ovr.armed = true;
        let mut out = Vec::new();
        self.override_transition(index, before, now_ms, &mut out)?;
        Ok(out)
    }

    /// Disarm an override, keeping the shadow for later re-arming.
    pub fn override_clr(&mut self, index: u32, now_ms: i64) -> DaxResult<Vec<Notification>> {
        let before = self.tags.visible_payload(index, now_ms)?;
        let tag = self.tags.get_mut(index)?;
        let ovr = tag.ovr.as_mut().ok_or(ErrorCode::NotFound)?;
        ovr.armed = false;
        let mut out = Vec::new();
        self.override_transition(index, before, now_ms, &mut out)?;
        Ok(out)
    }

    /// Drop an override entirely.
    pub fn override_del(&mut self, index: u32, now_ms: i64) -> DaxResult<Vec<Notification>> {
        let before = self.tags.visible_payload(index, now_ms)?;
        let tag = self.tags.get_mut(index)?;
        if tag.ovr.take().is_none() {
            return Err(ErrorCode::NotFound);
        }
        let mut out = Vec::new();
        self.override_transition(index, before, now_ms, &mut out)?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // events

    /// Register an event watching a region described by `handle`.
    #[allow(clippy::too_many_arguments)]
    pub fn event_add(
        &mut self,
        conn: u32,
        handle: &TagHandle,
        kind: EventKind,
        data: Option<Vec<u8>>,
        udata: u32,
        now_ms: i64,
    ) -> DaxResult<u32> {
        let tag = self.tags.get(handle.index)?;
        if !tag.attr.contains(TagAttr::QUEUE) {
            let size = tag.raw_data().len();
            if handle.byte as usize + handle.size as usize > size {
                return Err(ErrorCode::TooBig);
            }
        }
        let current = if tag.attr.contains(TagAttr::QUEUE) {
            Vec::new()
        } else {
            self.tags.visible_payload(handle.index, now_ms)?
        };
        let id = self.events.add(
            conn,
            handle.index,
            handle.byte,
            handle.bit,
            handle.count,
            handle.size,
            handle.type_code,
            kind,
            data,
            udata,
            &current,
        )?;
        if let Ok(tag) = self.tags.get_mut(handle.index) {
            tag.attr |= TagAttr::EVENT_ATTACHED;
        }
        Ok(id)
    }

    pub fn event_del(&mut self, conn: u32, tag: u32, id: u32) -> DaxResult<()> {
        self.events.del(conn, tag, id)?;
        if !self.events.watches(tag) {
            if let Ok(t) = self.tags.get_mut(tag) {
                t.attr.remove(TagAttr::EVENT_ATTACHED);
            }
        }
        Ok(())
    }

    pub fn event_mod(
        &mut self,
        conn: u32,
        tag: u32,
        id: u32,
        kind: EventKind,
        data: Option<Vec<u8>>,
        now_ms: i64,
    ) -> DaxResult<()> {
        let current = self.tags.visible_payload(tag, now_ms).unwrap_or_default();
        self.events.modify(conn, tag, id, kind, data, &current)
    }

    // ------------------------------------------------------------------
    // groups

    /// Register a group after validating every member against the live
    /// schema.
    pub fn group_add(&mut self, conn: u32, members: Vec<TagHandle>) -> DaxResult<u32> {
        for h in &members {
            let tag = self.tags.get(h.index)?;
            if tag.attr.contains(TagAttr::QUEUE) {
                return Err(ErrorCode::Illegal);
            }
            if h.byte as usize + h.size as usize > tag.raw_data().len() {
                return Err(ErrorCode::TooBig);
            }
        }
        self.groups.add(conn, members, self.max_message_size)
    }

    /// Concatenate the members' visible bytes in registration order.
    pub fn group_read(&mut self, conn: u32, id: u32, now_ms: i64) -> DaxResult<Vec<u8>> {
        let group = self.groups.get(conn, id)?.clone();
        let mut out = Vec::with_capacity(group.size as usize);
        for h in &group.members {
            let bytes = self.tags.read(h.index, h.byte, h.size, now_ms)?;
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Write the members from one concatenated buffer, each member going
    /// through the full write path.
    pub fn group_write(
        &mut self,
        conn: u32,
        id: u32,
        buf: &[u8],
        now_ms: i64,
    ) -> DaxResult<Vec<Notification>> {
        let group = self.groups.get(conn, id)?.clone();
        if buf.len() != group.size as usize {
            return Err(ErrorCode::Arg);
        }
        let mut notifications = Vec::new();
        let mut pos = 0usize;
        for h in &group.members {
            let chunk = &buf[pos..pos + h.size as usize];
            pos += h.size as usize;
            let result = if element_type(h.type_code) == DAX_BOOL
                && (h.bit != 0 || h.count % 8 != 0)
            {
                let mask = bit_mask(h.bit, h.count, h.size);
                self.tag_write(h.index, h.byte, chunk, Some(&mask), now_ms)
            } else {
                self.tag_write(h.index, h.byte, chunk, None, now_ms)
            };
            notifications.extend(result?);
        }
        Ok(notifications)
    }

    // ------------------------------------------------------------------
    // connection cleanup

    /// Release everything a disconnecting connection owns.
    pub fn drop_connection(&mut self, conn: u32, now_ms: i64) -> Vec<Notification> {
        let mut out = Vec::new();
        self.modules.remove(&conn);
        for tag in self.events.drop_connection(conn) {
            if let Ok(t) = self.tags.get_mut(tag) {
                t.attr.remove(TagAttr::EVENT_ATTACHED);
            }
        }
        self.maps.drop_connection(conn);
        self.groups.drop_connection(conn);
        // armed overrides owned by the connection unmask their tags
        let owned: Vec<u32> = (0..self.tags.next_index())
            .filter(|&i| {
                self.tags
                    .get(i)
                    .ok()
                    .and_then(|t| t.ovr.as_ref())
                    .map(|o| o.owner == conn)
                    .unwrap_or(false)
            })
            .collect();
        for index in owned {
            if let Ok(mut notes) = self.override_del(index, now_ms) {
                out.append(&mut notes);
            }
        }
        out
    }
}

/// Byte mask covering `count` bits starting at `bit`, over `size` bytes.
fn bit_mask(bit: u8, count: u32, size: u32) -> Vec<u8> {
    let mut mask = vec![0u8; size as usize];
    for n in 0..count as u64 {
        let pos = bit as u64 + n;
        let byte = (pos / 8) as usize;
        if byte < mask.len() {
            mask[byte] |= 1 << (pos % 8);
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retention::RetentionStore;
    use crate::tagbase::parse_address;
    use crate::types::{DAX_DINT, DAX_INT};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_path(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "dax_core_{}_{}_{}.db",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn core() -> ServerCore {
        let tags = TagBase::new(64, 32, 0);
        let retention = RetentionStore::open(&temp_path("core"));
        ServerCore::new(tags, retention, 65536)
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut c = core();
        let i = c.tag_add("dummy", DAX_INT, 1, TagAttr::empty()).unwrap();
        c.tag_write(i, 0, &1234i16.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(i, 0, 2, 0).unwrap();
        assert_eq!(i16::from_le_bytes(buf.try_into().unwrap()), 1234);
    }

    #[test]
    fn test_virtual_tag_write_rejected() {
        let mut c = core();
        assert_eq!(
            c.tag_write(crate::tagbase::TAG_INDEX_TIME, 0, &[0u8; 8], None, 0),
            Err(ErrorCode::ReadOnly)
        );
    }

    #[test]
    fn test_mapping_fanout_and_del() {
        let mut c = core();
        let t1 = c.tag_add("TEST1", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let t2 = c.tag_add("TEST2", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let src = parse_address(&c.types, &c.tags, "TEST1", 0).unwrap();
        let dst = parse_address(&c.types, &c.tags, "TEST2", 0).unwrap();
        let id = c.maps.add(1, src, dst).unwrap();

        c.tag_write(t1, 0, &1200i32.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(t2, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 1200);

        c.maps.del(1, id).unwrap();
        c.tag_write(t1, 0, &1400i32.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(t2, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 1200);
    }

    #[test]
    fn test_mapping_cycle_terminates() {
        let mut c = core();
        let a = c.tag_add("A", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let b = c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        c.maps.add(1, ha, hb).unwrap();
        c.maps.add(1, hb, ha).unwrap();

        c.tag_write(a, 0, &7i32.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(b, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 7);
    }

    #[test]
    fn test_mapping_chain_propagates() {
        let mut c = core();
        let a = c.tag_add("A", DAX_DINT, 1, TagAttr::empty()).unwrap();
        c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let t3 = c.tag_add("C", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        let hc = parse_address(&c.types, &c.tags, "C", 0).unwrap();
        c.maps.add(1, ha, hb).unwrap();
        c.maps.add(1, hb, hc).unwrap();

        c.tag_write(a, 0, &55i32.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(t3, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 55);
    }

    #[test]
    fn test_mapping_bool_bits() {
        let mut c = core();
        let a = c
            .tag_add("ABits", crate::types::DAX_BOOL, 10, TagAttr::empty())
            .unwrap();
        let b = c
            .tag_add("BBits", crate::types::DAX_BOOL, 10, TagAttr::empty())
            .unwrap();
        // map ABits[2..5) onto BBits[6..9)
        let src = parse_address(&c.types, &c.tags, "ABits[2]", 3).unwrap();
        let dst = parse_address(&c.types, &c.tags, "BBits[6]", 3).unwrap();
        c.maps.add(1, src, dst).unwrap();

        // set bits 2 and 4 of A
        c.tag_write(a, 0, &[0b0001_0100, 0], Some(&[0xFF, 0x03]), 0)
            .unwrap();
        let buf = c.tag_read(b, 0, 2, 0).unwrap();
        // bits 6 and 8 of B
        assert_eq!(buf, vec![0b0100_0000, 0b0000_0001]);
    }

    #[test]
    fn test_events_fire_before_mappings_reach_destinations() {
        let mut c = core();
        let a = c.tag_add("A", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let b = c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        c.maps.add(1, ha, hb).unwrap();
        c.event_add(10, &ha, EventKind::Write, None, 0, 0).unwrap();
        c.event_add(10, &hb, EventKind::Write, None, 1, 0).unwrap();

        let notes = c.tag_write(a, 0, &5i32.to_le_bytes(), None, 0).unwrap();
        assert_eq!(notes.len(), 2);
        // the directly-written tag reports first
        assert_eq!(notes[0].tag, a);
        assert_eq!(notes[1].tag, b);
    }

    #[test]
    fn test_override_masks_reads_and_fires_change() {
        let mut c = core();
        let i = c.tag_add("T", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let h = parse_address(&c.types, &c.tags, "T", 0).unwrap();
        c.tag_write(i, 0, &12i32.to_le_bytes(), None, 0).unwrap();
        c.event_add(10, &h, EventKind::Change, None, 0, 0).unwrap();
        // prime the change comparison
        c.tag_write(i, 0, &12i32.to_le_bytes(), None, 0).unwrap();

        let notes = c
            .override_add(10, i, (-15i32).to_le_bytes().to_vec(), 0)
            .unwrap();
        assert!(notes.is_empty());
        let buf = c.tag_read(i, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 12);

        // arming changes the visible value
        let notes = c.override_set(i, 0).unwrap();
        assert_eq!(notes.len(), 1);
        let buf = c.tag_read(i, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), -15);

        // writes land underneath without firing CHANGE
        let notes = c.tag_write(i, 0, &99i32.to_le_bytes(), None, 0).unwrap();
        assert!(notes.is_empty());

        // disarm restores the latest underlying write
        let notes = c.override_clr(i, 0).unwrap();
        assert_eq!(notes.len(), 1);
        let buf = c.tag_read(i, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 99);
    }

    #[test]
    fn test_atomic_inc() {
        let mut c = core();
        c.tag_add("Test1", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let h = parse_address(&c.types, &c.tags, "Test1", 0).unwrap();
        c.tag_write(h.index, 0, &12i32.to_le_bytes(), None, 0).unwrap();
        c.atomic_op(&h, AtomicOp::Inc, &2i32.to_le_bytes(), 0).unwrap();
        let buf = c.tag_read(h.index, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 14);
    }

    #[test]
    fn test_queue_through_core() {
        let mut c = core();
        let q = c
            .tag_add("queue_test", DAX_DINT, 1, TagAttr::QUEUE)
            .unwrap();
        for n in 1..=24i32 {
            c.tag_write(q, 0, &n.to_le_bytes(), None, 0).unwrap();
        }
        for n in 1..=24i32 {
            assert_eq!(c.tag_read(q, 0, 4, 0).unwrap(), n.to_le_bytes());
        }
        assert_eq!(c.tag_read(q, 0, 4, 0), Err(ErrorCode::NotFound));
        for n in 10..=15i32 {
            c.tag_write(q, 0, &n.to_le_bytes(), None, 0).unwrap();
        }
        for n in 10..=15i32 {
            assert_eq!(c.tag_read(q, 0, 4, 0).unwrap(), n.to_le_bytes());
        }
    }

    #[test]
    fn test_tag_del_cleans_up() {
        let mut c = core();
        let a = c.tag_add("A", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let b = c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        c.event_add(10, &ha, EventKind::Write, None, 0, 0).unwrap();
        c.maps.add(10, ha, hb).unwrap();
        c.group_add(10, vec![ha, hb]).unwrap();

        c.tag_del(a).unwrap();
        assert!(c.events.is_empty());
        assert!(c.maps.is_empty());
        assert!(c.groups.is_empty());
        assert_eq!(c.tags.index_of("A"), Err(ErrorCode::NotFound));
        // B is untouched
        assert!(c.tags.get(b).is_ok());
    }

    #[test]
    fn test_group_read_write() {
        let mut c = core();
        let a = c.tag_add("A", DAX_INT, 2, TagAttr::empty()).unwrap();
        let b = c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        let id = c.group_add(5, vec![ha, hb]).unwrap();

        let mut buf = Vec::new();
        buf.extend_from_slice(&10i16.to_le_bytes());
        buf.extend_from_slice(&20i16.to_le_bytes());
        buf.extend_from_slice(&30i32.to_le_bytes());
        c.group_write(5, id, &buf, 0).unwrap();

        assert_eq!(c.group_read(5, id, 0).unwrap(), buf);
        let b_val = c.tag_read(b, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(b_val.try_into().unwrap()), 30);
        assert_eq!(c.tag_read(a, 2, 2, 0).unwrap(), 20i16.to_le_bytes());
    }

    #[test]
    fn test_retention_restore_on_add() {
        let path = temp_path("restore");
        {
            let tags = TagBase::new(64, 32, 0);
            let retention = RetentionStore::open(&path);
            let mut c = ServerCore::new(tags, retention, 65536);
            let i = c
                .tag_add("keep", DAX_DINT, 1, TagAttr::RETAIN)
                .unwrap();
            c.tag_write(i, 0, &777i32.to_le_bytes(), None, 0).unwrap();
            // flush what the background task would have written
            for idx in c.retention.take_dirty() {
                let tag = c.tags.get(idx).unwrap();
                let data = tag.raw_data().to_vec();
                let (name, t, count) = (tag.name.clone(), tag.type_code, tag.count);
                c.retention.update(&name, t, count, data);
            }
            c.retention.save().unwrap();
        }
        {
            let tags = TagBase::new(64, 32, 0);
            let retention = RetentionStore::open(&path);
            let mut c = ServerCore::new(tags, retention, 65536);
            let i = c
                .tag_add("keep", DAX_DINT, 1, TagAttr::RETAIN)
                .unwrap();
            let buf = c.tag_read(i, 0, 4, 0).unwrap();
            assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 777);
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_drop_connection_releases_resources() {
        let mut c = core();
        let a = c.tag_add("A", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let b = c.tag_add("B", DAX_DINT, 1, TagAttr::empty()).unwrap();
        let ha = parse_address(&c.types, &c.tags, "A", 0).unwrap();
        let hb = parse_address(&c.types, &c.tags, "B", 0).unwrap();
        c.module_register(10, "mod".to_string(), 0).unwrap();
        c.event_add(10, &ha, EventKind::Write, None, 0, 0).unwrap();
        c.maps.add(10, ha, hb).unwrap();
        c.group_add(10, vec![ha]).unwrap();
        c.override_add(10, a, 5i32.to_le_bytes().to_vec(), 0).unwrap();
        c.override_set(a, 0).unwrap();

        c.drop_connection(10, 0);
        assert!(c.events.is_empty());
        assert!(c.maps.is_empty());
        assert!(c.groups.is_empty());
        assert!(!c.module_registered(10));
        // the override is gone; reads see the underlying value
        c.tag_write(a, 0, &1i32.to_le_bytes(), None, 0).unwrap();
        let buf = c.tag_read(a, 0, 4, 0).unwrap();
        assert_eq!(i32::from_le_bytes(buf.try_into().unwrap()), 1);
        let _ = b;
    }
}
