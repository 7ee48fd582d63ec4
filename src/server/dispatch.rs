//! Request routing: decode, run under the database lock, encode.
//!
//! Each connection task hands complete frames here. The handler decodes
//! the payload, takes the core lock for the critical section only, and
//! returns a complete response frame; notifications captured by the write
//! path are routed to their owners after the lock is released.

use parking_lot::RwLock;

use crate::error::{DaxResult, ErrorCode};
use crate::events::{EventKind, Notification};
use crate::logger::Topics;
use crate::protocol::{cmd, error_frame, response_frame, MessageHeader, PayloadReader, PayloadWriter};
use crate::server::connection::Connections;
use crate::server::core::ServerCore;
use crate::tagbase::{AtomicOp, TagAttr};
use crate::topic_log;
use crate::types::element_type;

/// Timeout advertised to registering modules.
const ADVERTISED_TIMEOUT_MS: u32 = 1000;

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle one request frame, returning the complete response frame.
pub fn dispatch(
    core: &RwLock<ServerCore>,
    conns: &Connections,
    conn_id: u32,
    header: MessageHeader,
    payload: &[u8],
) -> Vec<u8> {
    let command = header.base_command();
    let mut notifications = Vec::new();
    let result = handle(core, conn_id, command, payload, &mut notifications);
    // outbound queues are per-connection locks; the database lock is
    // already released here
    conns.route(notifications);
    match result {
        Ok(reply) => response_frame(command, header.id, &reply),
        Err(code) => {
            topic_log!(
                Topics::MSGERR,
                "connection {}: command {} failed: {}",
                conn_id,
                command,
                code
            );
            error_frame(command, header.id, code)
        }
    }
}

fn handle(
    core: &RwLock<ServerCore>,
    conn_id: u32,
    command: u32,
    payload: &[u8],
    notifications: &mut Vec<Notification>,
) -> DaxResult<Vec<u8>> {
    let mut r = PayloadReader::new(payload);
    let now = now_ms();

    // everything except registration requires a registered module
    if command != cmd::MOD_REG && !core.read().module_registered(conn_id) {
        return Err(ErrorCode::Auth);
    }

    match command {
        cmd::MOD_REG => {
            let name = r.get_str()?;
            let _flags = r.get_u32()?;
            core.write().module_register(conn_id, name, now)?;
            let mut w = PayloadWriter::new();
            w.put_u32(conn_id).put_u32(ADVERTISED_TIMEOUT_MS);
            Ok(w.into_bytes())
        }
        cmd::MOD_UNREG => {
            core.write().module_unregister(conn_id)?;
            Ok(Vec::new())
        }
        cmd::TAG_ADD => {
            let type_code = r.get_u32()?;
            let count = r.get_u32()?;
            let attr = TagAttr::from_bits_truncate(r.get_u32()?);
            let name = r.get_str()?;
            let index = core.write().tag_add(&name, type_code, count, attr)?;
            let mut w = PayloadWriter::new();
            w.put_u32(index);
            Ok(w.into_bytes())
        }
        cmd::TAG_DEL => {
            let index = r.get_u32()?;
            core.write().tag_del(index)?;
            Ok(Vec::new())
        }
        cmd::TAG_GET => {
            let by_name = r.get_u8()? != 0;
            let core = core.read();
            let desc = if by_name {
                core.tags.desc_by_name(&r.get_str()?)?
            } else {
                core.tags.desc_by_index(r.get_u32()?)?
            };
            let mut w = PayloadWriter::new();
            w.put_u32(desc.index)
                .put_u32(desc.type_code)
                .put_u32(desc.count)
                .put_u32(desc.attr.bits())
                .put_str(&desc.name);
            Ok(w.into_bytes())
        }
        cmd::TAG_LIST => {
            let after = r.get_u32()?;
            let core = core.read();
            let limit = core.max_message_size() as usize;
            let mut w = PayloadWriter::new();
            w.put_u16(0);
            let mut count: u16 = 0;
            for desc in core.tags.list() {
                if desc.index < after {
                    continue;
                }
                // each record: three u32 words, the attr word, the name
                let record = 16 + 2 + desc.name.len();
                if w.len() + record > limit || count == u16::MAX {
                    break;
                }
                w.put_u32(desc.index)
                    .put_u32(desc.type_code)
                    .put_u32(desc.count)
                    .put_u32(desc.attr.bits())
                    .put_str(&desc.name);
                count += 1;
            }
            let mut out = w.into_bytes();
            out[0..2].copy_from_slice(&count.to_le_bytes());
            Ok(out)
        }
        cmd::TAG_READ => {
            let index = r.get_u32()?;
            let offset = r.get_u32()?;
            let size = r.get_u32()?;
            core.write().tag_read(index, offset, size, now)
        }
        cmd::TAG_WRITE => {
            let index = r.get_u32()?;
            let offset = r.get_u32()?;
            let data = r.get_rest();
            *notifications = core.write().tag_write(index, offset, &data, None, now)?;
            Ok(Vec::new())
        }
        cmd::TAG_MWRITE => {
            let index = r.get_u32()?;
            let offset = r.get_u32()?;
            let len = r.get_u32()? as usize;
            let data = r.get_bytes(len)?;
            let mask = r.get_bytes(len)?;
            *notifications = core
                .write()
                .tag_write(index, offset, &data, Some(&mask), now)?;
            Ok(Vec::new())
        }
        cmd::CDT_CREATE => {
            let name = r.get_str()?;
            let count = r.get_u8()? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let mname = r.get_str()?;
                let mtype = r.get_u32()?;
                let mcount = r.get_u32()?;
                members.push((mname, mtype, mcount));
            }
            let type_code = core.write().types.create(&name, &members)?;
            let mut w = PayloadWriter::new();
            w.put_u32(type_code);
            Ok(w.into_bytes())
        }
        cmd::CDT_GET => {
            let by_name = r.get_u8()? != 0;
            let core = core.read();
            let (type_code, cdt) = if by_name {
                let name = r.get_str()?;
                let (index, cdt) = core.types.get_by_name(&name).ok_or(ErrorCode::NotFound)?;
                (crate::types::custom_type(index), cdt)
            } else {
                let t = r.get_u32()?;
                let cdt = core.types.resolve(t).map_err(|_| ErrorCode::NotFound)?;
                (element_type(t), cdt)
            };
            let mut w = PayloadWriter::new();
            w.put_u32(type_code).put_str(&cdt.name).put_u8(cdt.members.len() as u8);
            for m in &cdt.members {
                w.put_str(&m.name).put_u32(m.type_code).put_u32(m.count);
            }
            Ok(w.into_bytes())
        }
        cmd::EVENT_ADD => {
            let handle = r.get_handle()?;
            let kind = EventKind::from_wire(r.get_u8()?)?;
            let udata = r.get_u32()?;
            let data_len = r.get_u16()? as usize;
            let data = if data_len > 0 {
                Some(r.get_bytes(data_len)?)
            } else {
                None
            };
            let id = core
                .write()
                .event_add(conn_id, &handle, kind, data, udata, now)?;
            let mut w = PayloadWriter::new();
            w.put_u32(id);
            Ok(w.into_bytes())
        }
        cmd::EVENT_DEL => {
            let tag = r.get_u32()?;
            let id = r.get_u32()?;
            core.write().event_del(conn_id, tag, id)?;
            Ok(Vec::new())
        }
        cmd::EVENT_MOD => {
            let tag = r.get_u32()?;
            let id = r.get_u32()?;
            let kind = EventKind::from_wire(r.get_u8()?)?;
            let data_len = r.get_u16()? as usize;
            let data = if data_len > 0 {
                Some(r.get_bytes(data_len)?)
            } else {
                None
            };
            core.write().event_mod(conn_id, tag, id, kind, data, now)?;
            Ok(Vec::new())
        }
        cmd::MAP_ADD => {
            let src = r.get_handle()?;
            let dst = r.get_handle()?;
            let mut core = core.write();
            // both ends must resolve against the live schema
            core.tags.get(src.index)?;
            core.tags.get(dst.index)?;
            let id = core.maps.add(conn_id, src, dst)?;
            let mut w = PayloadWriter::new();
            w.put_u32(id);
            Ok(w.into_bytes())
        }
        cmd::MAP_DEL => {
            let id = r.get_u32()?;
            core.write().maps.del(conn_id, id)?;
            Ok(Vec::new())
        }
        cmd::MAP_GET => {
            let id = r.get_u32()?;
            let core = core.read();
            let map = core.maps.get(id)?;
            let mut w = PayloadWriter::new();
            w.put_handle(&map.src).put_handle(&map.dst);
            Ok(w.into_bytes())
        }
        cmd::GROUP_ADD => {
            let count = r.get_u8()? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                members.push(r.get_handle()?);
            }
            let mut core = core.write();
            let id = core.group_add(conn_id, members)?;
            let size = core.groups.get(conn_id, id)?.size;
            let mut w = PayloadWriter::new();
            w.put_u32(id).put_u32(size);
            Ok(w.into_bytes())
        }
        cmd::GROUP_READ => {
            let id = r.get_u32()?;
            core.write().group_read(conn_id, id, now)
        }
        cmd::GROUP_WRITE => {
            let id = r.get_u32()?;
            let data = r.get_rest();
            *notifications = core.write().group_write(conn_id, id, &data, now)?;
            Ok(Vec::new())
        }
        cmd::GROUP_DEL => {
            let id = r.get_u32()?;
            core.write().groups.del(conn_id, id)?;
            Ok(Vec::new())
        }
        cmd::OVR_ADD => {
            let index = r.get_u32()?;
            let data = r.get_rest();
            *notifications = core.write().override_add(conn_id, index, data, now)?;
            Ok(Vec::new())
        }
        cmd::OVR_DEL => {
            let index = r.get_u32()?;
            *notifications = core.write().override_del(index, now)?;
            Ok(Vec::new())
        }
        cmd::OVR_SET => {
            let index = r.get_u32()?;
            *notifications = core.write().override_set(index, now)?;
            Ok(Vec::new())
        }
        cmd::OVR_CLR => {
            let index = r.get_u32()?;
            *notifications = core.write().override_clr(index, now)?;
            Ok(Vec::new())
        }
        cmd::ATOMIC_OP => {
            let handle = r.get_handle()?;
            let op = AtomicOp::from_wire(r.get_u16()?)?;
            let operand = r.get_rest();
            *notifications = core.write().atomic_op(&handle, op, &operand, now)?;
            Ok(Vec::new())
        }
        _ => Err(ErrorCode::NotImplemented),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ERROR_FLAG, HEADER_SIZE};
    use crate::retention::RetentionStore;
    use crate::tagbase::TagBase;
    use crate::types::DAX_DINT;
    use std::path::PathBuf;

    fn temp_path() -> PathBuf {
        use std::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "dax_dispatch_{}_{}.db",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ))
    }

    fn setup() -> (RwLock<ServerCore>, Connections) {
        let core = ServerCore::new(
            TagBase::new(64, 32, 0),
            RetentionStore::open(&temp_path()),
            65536,
        );
        (RwLock::new(core), Connections::new())
    }

    fn call(
        core: &RwLock<ServerCore>,
        conns: &Connections,
        conn: u32,
        command: u32,
        payload: Vec<u8>,
    ) -> (MessageHeader, Vec<u8>) {
        let header = MessageHeader {
            command,
            size: payload.len() as u32,
            id: 42,
        };
        let frame = dispatch(core, conns, conn, header, &payload);
        let hdr = MessageHeader::decode(&frame[..HEADER_SIZE].try_into().unwrap());
        (hdr, frame[HEADER_SIZE..].to_vec())
    }

    fn register(core: &RwLock<ServerCore>, conns: &Connections, conn: u32) {
        let mut w = PayloadWriter::new();
        w.put_str("test").put_u32(0);
        let (hdr, _) = call(core, conns, conn, cmd::MOD_REG, w.into_bytes());
        assert!(!hdr.is_error());
    }

    #[test]
    fn test_unregistered_connection_rejected() {
        let (core, conns) = setup();
        let mut w = PayloadWriter::new();
        w.put_u32(DAX_DINT).put_u32(1).put_u32(0).put_str("t");
        let (hdr, body) = call(&core, &conns, 1, cmd::TAG_ADD, w.into_bytes());
        assert!(hdr.is_error());
        let mut r = PayloadReader::new(&body);
        assert_eq!(
            ErrorCode::from_code(r.get_i32().unwrap()),
            ErrorCode::Auth
        );
    }

    #[test]
    fn test_tag_add_get_round_trip() {
        let (core, conns) = setup();
        register(&core, &conns, 1);
        let mut w = PayloadWriter::new();
        w.put_u32(DAX_DINT).put_u32(5).put_u32(0).put_str("dummy");
        let (hdr, body) = call(&core, &conns, 1, cmd::TAG_ADD, w.into_bytes());
        assert!(!hdr.is_error());
        let mut r = PayloadReader::new(&body);
        let index = r.get_u32().unwrap();

        let mut w = PayloadWriter::new();
        w.put_u8(1).put_str("dummy");
        let (hdr, body) = call(&core, &conns, 1, cmd::TAG_GET, w.into_bytes());
        assert!(!hdr.is_error());
        let mut r = PayloadReader::new(&body);
        assert_eq!(r.get_u32().unwrap(), index);
        assert_eq!(r.get_u32().unwrap(), DAX_DINT);
        assert_eq!(r.get_u32().unwrap(), 5);
        r.get_u32().unwrap();
        assert_eq!(r.get_str().unwrap(), "dummy");
    }

    #[test]
    fn test_write_then_read() {
        let (core, conns) = setup();
        register(&core, &conns, 1);
        let mut w = PayloadWriter::new();
        w.put_u32(DAX_DINT).put_u32(1).put_u32(0).put_str("v");
        let (_, body) = call(&core, &conns, 1, cmd::TAG_ADD, w.into_bytes());
        let index = PayloadReader::new(&body).get_u32().unwrap();

        let mut w = PayloadWriter::new();
        w.put_u32(index).put_u32(0).put_bytes(&1200i32.to_le_bytes());
        let (hdr, _) = call(&core, &conns, 1, cmd::TAG_WRITE, w.into_bytes());
        assert!(!hdr.is_error());

        let mut w = PayloadWriter::new();
        w.put_u32(index).put_u32(0).put_u32(4);
        let (hdr, body) = call(&core, &conns, 1, cmd::TAG_READ, w.into_bytes());
        assert!(!hdr.is_error());
        assert_eq!(i32::from_le_bytes(body.try_into().unwrap()), 1200);
    }

    #[test]
    fn test_error_echoes_id_and_flag() {
        let (core, conns) = setup();
        register(&core, &conns, 1);
        let mut w = PayloadWriter::new();
        w.put_u32(9999);
        let (hdr, body) = call(&core, &conns, 1, cmd::TAG_DEL, w.into_bytes());
        assert!(hdr.is_error());
        assert_eq!(hdr.base_command(), cmd::TAG_DEL);
        assert_eq!(hdr.id, 42);
        let mut r = PayloadReader::new(&body);
        assert_eq!(
            ErrorCode::from_code(r.get_i32().unwrap()),
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_notifications_routed_to_owner_queue() {
        let (core, conns) = setup();
        let a = conns.register();
        let b = conns.register();
        register(&core, &conns, a.id);
        register(&core, &conns, b.id);

        // connection B watches a tag created by A
        let mut w = PayloadWriter::new();
        w.put_u32(DAX_DINT).put_u32(1).put_u32(0).put_str("watched");
        let (_, body) = call(&core, &conns, a.id, cmd::TAG_ADD, w.into_bytes());
        let index = PayloadReader::new(&body).get_u32().unwrap();

        let mut w = PayloadWriter::new();
        w.put_handle(&crate::tagbase::TagHandle {
            index,
            type_code: DAX_DINT,
            byte: 0,
            bit: 0,
            count: 1,
            size: 4,
        });
        w.put_u8(1).put_u32(77).put_u16(0);
        let (hdr, _) = call(&core, &conns, b.id, cmd::EVENT_ADD, w.into_bytes());
        assert!(!hdr.is_error());

        let mut w = PayloadWriter::new();
        w.put_u32(index).put_u32(0).put_bytes(&5i32.to_le_bytes());
        call(&core, &conns, a.id, cmd::TAG_WRITE, w.into_bytes());

        let (note, missed) = b.notify.pop().unwrap();
        assert_eq!(note.tag, index);
        assert_eq!(note.udata, 77);
        assert_eq!(missed, 0);
        assert!(a.notify.pop().is_none());
    }

    #[test]
    fn test_unknown_command() {
        let (core, conns) = setup();
        register(&core, &conns, 1);
        let (hdr, body) = call(&core, &conns, 1, 999, Vec::new());
        assert!(hdr.is_error());
        assert_eq!(hdr.command & ERROR_FLAG, ERROR_FLAG);
        let mut r = PayloadReader::new(&body);
        assert_eq!(
            ErrorCode::from_code(r.get_i32().unwrap()),
            ErrorCode::NotImplemented
        );
    }
}
