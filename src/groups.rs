//! Group engine: bundles of handles transferred in one request.
//!
//! Groups amortize round trips; members are read and written in
//! registration order with no atomicity across them. Each group belongs to
//! the connection that registered it.

use std::collections::HashMap;

use crate::error::{DaxResult, ErrorCode};
use crate::tagbase::TagHandle;

/// Most members one group may carry.
pub const GROUP_MEMBER_MAX: usize = 64;

/// One registered group.
#[derive(Debug, Clone)]
pub struct TagGroup {
    pub id: u32,
    pub owner: u32,
    /// Members in registration order
    pub members: Vec<TagHandle>,
    /// Total transfer size in bytes, fixed at creation
    pub size: u32,
}

/// All registered groups.
#[derive(Debug, Default)]
pub struct GroupTable {
    groups: HashMap<u32, TagGroup>,
    next_id: u32,
}

impl GroupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Register a group. The concatenated size must fit in `max_size`
    /// so a read or write always fits one message.
    pub fn add(&mut self, owner: u32, members: Vec<TagHandle>, max_size: u32) -> DaxResult<u32> {
        if members.is_empty() || members.len() > GROUP_MEMBER_MAX {
            return Err(ErrorCode::Arg);
        }
        let mut size: u32 = 0;
        for h in &members {
            if h.size == 0 {
                return Err(ErrorCode::Arg);
            }
            size = size.checked_add(h.size).ok_or(ErrorCode::TooBig)?;
        }
        if size > max_size {
            return Err(ErrorCode::TooBig);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.groups.insert(
            id,
            TagGroup {
                id,
                owner,
                members,
                size,
            },
        );
        Ok(id)
    }

    /// Look up a group; a foreign connection's id reads as absent.
    pub fn get(&self, owner: u32, id: u32) -> DaxResult<&TagGroup> {
        match self.groups.get(&id) {
            Some(g) if g.owner == owner => Ok(g),
            _ => Err(ErrorCode::NotFound),
        }
    }

    pub fn del(&mut self, owner: u32, id: u32) -> DaxResult<()> {
        match self.groups.get(&id) {
            Some(g) if g.owner == owner => {
                self.groups.remove(&id);
                Ok(())
            }
            _ => Err(ErrorCode::NotFound),
        }
    }

    /// Remove every group owned by a disconnecting connection.
    pub fn drop_connection(&mut self, owner: u32) {
        self.groups.retain(|_, g| g.owner != owner);
    }

    /// Remove every group with a member in a deleted tag.
    pub fn drop_tag(&mut self, tag: u32) {
        self.groups
            .retain(|_, g| !g.members.iter().any(|h| h.index == tag));
    }
}
