//! Event engine: predicate-driven subscriptions over tag writes.
//!
//! Every write runs the matcher for the written tag under the database
//! lock; matching events produce notifications that the dispatcher routes
//! onto the owning connection's outbound queue. The writer never blocks on
//! a slow consumer.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::error::{DaxResult, ErrorCode};
use crate::types::{element_type, TagValue, TypeCode, DAX_BOOL};

/// Hard cap on one connection's pending notification queue.
pub const QUEUE_MAX: usize = 1024;

/// Initial notification queue capacity; grows by doubling up to the cap.
pub const QUEUE_START: usize = 8;

/// Event kind selectors, stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Any write touching the watched region
    Write = 1,
    /// Write that changes the watched region
    Change = 2,
    /// A bit in the region transitions 0 to 1
    Set = 3,
    /// A bit in the region transitions 1 to 0
    Reset = 4,
    /// The value becomes equal to the configured operand
    Equal = 5,
    /// The value becomes different from the configured operand
    NotEqual = 6,
    /// The value crosses above the configured operand
    Greater = 7,
    /// The value crosses below the configured operand
    Less = 8,
    /// The value moves at least the operand away from the last report
    Deadband = 9,
}

impl EventKind {
    pub fn from_wire(v: u8) -> DaxResult<Self> {
        Ok(match v {
            1 => EventKind::Write,
            2 => EventKind::Change,
            3 => EventKind::Set,
            4 => EventKind::Reset,
            5 => EventKind::Equal,
            6 => EventKind::NotEqual,
            7 => EventKind::Greater,
            8 => EventKind::Less,
            9 => EventKind::Deadband,
            _ => return Err(ErrorCode::Arg),
        })
    }

    /// Whether the kind compares against a configured operand.
    pub fn needs_data(self) -> bool {
        matches!(
            self,
            EventKind::Equal
                | EventKind::NotEqual
                | EventKind::Greater
                | EventKind::Less
                | EventKind::Deadband
        )
    }
}

/// Per-event private state between evaluations.
#[derive(Debug, Clone)]
enum EventState {
    /// WRITE needs no memory
    Stateless,
    /// CHANGE: last written region; the first write primes it silently
    Change(Option<Vec<u8>>),
    /// SET/RESET: last seen region bits, zero until the first write
    Bits(Vec<u8>),
    /// Whether the predicate held after the last write (comparison kinds)
    Satisfied(bool),
    /// Value at the last notification (DEADBAND)
    Deadband(f64),
}

/// One registered event.
#[derive(Debug, Clone)]
pub struct EventDef {
    /// Server-assigned id, unique per connection
    pub id: u32,
    /// Owning connection
    pub owner: u32,
    /// Watched tag
    pub tag: u32,
    /// Watched region
    pub byte: u32,
    pub bit: u8,
    pub count: u32,
    pub size: u32,
    /// Element type of the watched region
    pub type_code: TypeCode,
    pub kind: EventKind,
    /// Comparison operand for the kinds that take one
    pub data: Option<Vec<u8>>,
    /// Opaque cookie echoed in notifications
    pub udata: u32,
    state: EventState,
}

/// A matched event captured under the lock, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Destination connection
    pub conn: u32,
    pub event_id: u32,
    pub tag: u32,
    pub udata: u32,
    /// Watched region bytes after the write (bit regions packed from bit 0)
    pub data: Vec<u8>,
}

/// Extract a watched region from a full tag payload. Bit regions are
/// packed down to bit 0 of the output; byte regions copy straight through.
/// Out-of-range bytes read as zero.
fn extract_region(payload: &[u8], byte: u32, bit: u8, count: u32, t: TypeCode, size: u32) -> Vec<u8> {
    if element_type(t) == DAX_BOOL {
        let mut out = vec![0u8; ((count + 7) / 8) as usize];
        let base = byte as u64 * 8 + bit as u64;
        for n in 0..count as u64 {
            let pos = base + n;
            let src = (pos / 8) as usize;
            if src >= payload.len() {
                break;
            }
            if payload[src] >> (pos % 8) & 1 != 0 {
                out[(n / 8) as usize] |= 1 << (n % 8);
            }
        }
        out
    } else {
        let start = (byte as usize).min(payload.len());
        let end = (byte as usize + size as usize).min(payload.len());
        let mut out = payload[start..end].to_vec();
        out.resize(size as usize, 0);
        out
    }
}

impl EventDef {
    fn operand_value(&self) -> DaxResult<f64> {
        let data = self.data.as_ref().ok_or(ErrorCode::Arg)?;
        Ok(TagValue::decode(self.type_code, data)?.as_f64())
    }

    /// Whether any element of the region satisfies the comparison.
    fn compare(&self, region: &[u8]) -> DaxResult<bool> {
        let operand = self.operand_value()?;
        let esize = if element_type(self.type_code) == DAX_BOOL {
            1
        } else {
            (crate::types::base_type_bits(self.type_code) / 8).max(1) as usize
        };
        for n in 0..self.count as usize {
            let off = n * esize;
            if off + esize > region.len() {
                break;
            }
            let v = TagValue::decode(self.type_code, &region[off..])?.as_f64();
            let hit = match self.kind {
                EventKind::Equal => v == operand,
                EventKind::NotEqual => v != operand,
                EventKind::Greater => v > operand,
                EventKind::Less => v < operand,
                _ => false,
            };
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn init_state(&mut self, current: &[u8]) -> DaxResult<()> {
        let region = extract_region(current, self.byte, self.bit, self.count, self.type_code, self.size);
        self.state = match self.kind {
            EventKind::Write => EventState::Stateless,
            // the comparison value is the last WRITTEN region, so the first
            // write after registration primes it without firing
            EventKind::Change => EventState::Change(None),
            // bit transitions count from an all-clear baseline
            EventKind::Set | EventKind::Reset => EventState::Bits(vec![0u8; region.len()]),
            EventKind::Equal | EventKind::NotEqual | EventKind::Greater | EventKind::Less => {
                EventState::Satisfied(self.compare(&region)?)
            }
            EventKind::Deadband => {
                // deadband distance is measured from here until the first report
                self.operand_value()?;
                let v = TagValue::decode(self.type_code, &region)?.as_f64();
                EventState::Deadband(v)
            }
        };
        Ok(())
    }

    /// Evaluate against the post-write payload; returns the notification
    /// payload when the event fires.
    fn evaluate(&mut self, new_payload: &[u8]) -> Option<Vec<u8>> {
        let region = extract_region(
            new_payload,
            self.byte,
            self.bit,
            self.count,
            self.type_code,
            self.size,
        );
        match self.kind {
            EventKind::Write => Some(region),
            EventKind::Change => {
                let EventState::Change(prev) = &mut self.state else {
                    return None;
                };
                match prev {
                    None => {
                        *prev = Some(region);
                        None
                    }
                    Some(p) if *p != region => {
                        *p = region.clone();
                        Some(region)
                    }
                    Some(_) => None,
                }
            }
            EventKind::Set => {
                let EventState::Bits(prev) = &mut self.state else {
                    return None;
                };
                let hit = region.iter().zip(prev.iter()).any(|(n, o)| n & !o != 0);
                *prev = region.clone();
                hit.then_some(region)
            }
            EventKind::Reset => {
                let EventState::Bits(prev) = &mut self.state else {
                    return None;
                };
                let hit = region.iter().zip(prev.iter()).any(|(n, o)| !n & o != 0);
                *prev = region.clone();
                hit.then_some(region)
            }
            EventKind::Equal | EventKind::NotEqual | EventKind::Greater | EventKind::Less => {
                let now = self.compare(&region).unwrap_or(false);
                let EventState::Satisfied(was) = &mut self.state else {
                    return None;
                };
                let fire = now && !*was;
                *was = now;
                fire.then_some(region)
            }
            EventKind::Deadband => {
                let band = self.operand_value().ok()?;
                let v = TagValue::decode(self.type_code, &region).ok()?.as_f64();
                let EventState::Deadband(last) = &mut self.state else {
                    return None;
                };
                if (v - *last).abs() >= band {
                    *last = v;
                    Some(region)
                } else {
                    None
                }
            }
        }
    }
}

/// All registered events, indexed by watched tag.
#[derive(Debug, Default)]
pub struct EventTable {
    by_tag: HashMap<u32, SmallVec<[EventDef; 2]>>,
    next_id: u32,
}

impl EventTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total registered events.
    pub fn len(&self) -> usize {
        self.by_tag.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any event watches `tag`.
    pub fn watches(&self, tag: u32) -> bool {
        self.by_tag.get(&tag).map(|v| !v.is_empty()).unwrap_or(false)
    }

    /// Register an event. `current` is the watched tag's visible payload,
    /// used to seed the event's private state.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        owner: u32,
        tag: u32,
        byte: u32,
        bit: u8,
        count: u32,
        size: u32,
        type_code: TypeCode,
        kind: EventKind,
        data: Option<Vec<u8>>,
        udata: u32,
        current: &[u8],
    ) -> DaxResult<u32> {
        if kind.needs_data() && data.is_none() {
            return Err(ErrorCode::Arg);
        }
        let id = self.next_id;
        let mut def = EventDef {
            id,
            owner,
            tag,
            byte,
            bit,
            count,
            size,
            type_code,
            kind,
            data,
            udata,
            state: EventState::Stateless,
        };
        def.init_state(current)?;
        self.next_id += 1;
        self.by_tag.entry(tag).or_default().push(def);
        Ok(id)
    }

    /// Remove one event owned by `owner`.
    pub fn del(&mut self, owner: u32, tag: u32, id: u32) -> DaxResult<()> {
        let list = self.by_tag.get_mut(&tag).ok_or(ErrorCode::NotFound)?;
        let pos = list
            .iter()
            .position(|e| e.id == id && e.owner == owner)
            .ok_or(ErrorCode::NotFound)?;
        list.remove(pos);
        if list.is_empty() {
            self.by_tag.remove(&tag);
        }
        Ok(())
    }

    /// Change the kind or operand of an existing event; private state is
    /// reseeded from `current`.
    pub fn modify(
        &mut self,
        owner: u32,
        tag: u32,
        id: u32,
        kind: EventKind,
        data: Option<Vec<u8>>,
        current: &[u8],
    ) -> DaxResult<()> {
        if kind.needs_data() && data.is_none() {
            return Err(ErrorCode::Arg);
        }
        let list = self.by_tag.get_mut(&tag).ok_or(ErrorCode::NotFound)?;
        let def = list
            .iter_mut()
            .find(|e| e.id == id && e.owner == owner)
            .ok_or(ErrorCode::NotFound)?;
        def.kind = kind;
        def.data = data;
        def.init_state(current)
    }

    /// Drop every event owned by a disconnecting connection. Returns the
    /// tags that no longer carry events.
    pub fn drop_connection(&mut self, owner: u32) -> Vec<u32> {
        let mut cleared = Vec::new();
        self.by_tag.retain(|&tag, list| {
            list.retain(|e| e.owner != owner);
            if list.is_empty() {
                cleared.push(tag);
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Drop every event watching a deleted tag.
    pub fn drop_tag(&mut self, tag: u32) {
        self.by_tag.remove(&tag);
    }

    /// Run the matcher for a write to `[start, start+len)` of `tag`.
    /// `new_payload` is the full visible payload after the write.
    pub fn evaluate(
        &mut self,
        tag: u32,
        start: u32,
        len: u32,
        new_payload: &[u8],
        out: &mut Vec<Notification>,
    ) {
        let Some(list) = self.by_tag.get_mut(&tag) else {
            return;
        };
        for def in list.iter_mut() {
            // byte-granular intersection with the watched region
            if start >= def.byte + def.size || def.byte >= start + len {
                continue;
            }
            if let Some(data) = def.evaluate(new_payload) {
                out.push(Notification {
                    conn: def.owner,
                    event_id: def.id,
                    tag,
                    udata: def.udata,
                    data,
                });
            }
        }
    }

    /// Run the matcher for a queue push; only WRITE events apply to queue
    /// tags.
    pub fn evaluate_push(&mut self, tag: u32, element: &[u8], out: &mut Vec<Notification>) {
        let Some(list) = self.by_tag.get_mut(&tag) else {
            return;
        };
        for def in list.iter_mut() {
            if def.kind == EventKind::Write {
                out.push(Notification {
                    conn: def.owner,
                    event_id: def.id,
                    tag,
                    udata: def.udata,
                    data: element.to_vec(),
                });
            }
        }
    }
}
