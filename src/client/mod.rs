//! Module-side client library.
//!
//! Every surrounding module (protocol drivers, the scripting host, the
//! command line tools, the test harness) talks to the tag server through
//! this synchronous API: connect, register, then issue framed requests
//! with a bounded timeout. Event notifications arrive out-of-band between
//! responses and queue locally until polled.

pub mod cache;
pub mod events;

pub use self::events::ClientEvent;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::error::ErrorCode;
use crate::events::EventKind;
use crate::protocol::{cmd, MessageHeader, PayloadReader, PayloadWriter, HEADER_SIZE};
use crate::tagbase::{leading_name, resolve_address, AtomicOp, TagAttr, TagDesc, TagHandle};
use crate::types::{cdt_index, custom_type, element_type, Cdt, TagValue, TypeCode, TypeRegistry};
use self::cache::{TagCache, CACHE_SIZE};
use self::events::EventFifo;

/// Default request timeout.
pub const TIMEOUT_DEFAULT_MS: u64 = 1000;
/// Smallest accepted request timeout.
pub const TIMEOUT_MIN_MS: u64 = 500;
/// Largest accepted request timeout.
pub const TIMEOUT_MAX_MS: u64 = 30000;

/// Client library errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server error: {0}")]
    Server(ErrorCode),

    #[error("not connected")]
    NotConnected,

    #[error("request timed out")]
    Timeout,

    #[error("malformed reply")]
    BadReply,

    #[error("bad configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// The wire code behind a server-reported failure.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<crate::protocol::ProtocolError> for ClientError {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        match e {
            crate::protocol::ProtocolError::Io(io) => ClientError::Io(io),
            _ => ClientError::BadReply,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Identifier of a registered event: the watched tag plus the
/// server-assigned id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId {
    pub tag: u32,
    pub id: u32,
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    /// Connect over TCP instead of the UNIX socket
    pub tcp: Option<(String, u16)>,
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/opendax"),
            tcp: None,
            timeout_ms: TIMEOUT_DEFAULT_MS,
        }
    }
}

impl ClientConfig {
    /// Parse module command line arguments:
    /// `-s <socket>`, `-H <host>`, `-p <port>`, `-t <timeout_ms>`.
    pub fn from_args(args: &[String]) -> ClientResult<Self> {
        let mut config = Self::default();
        let mut host: Option<String> = None;
        let mut port: Option<u16> = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let mut value = |flag: &str| {
                iter.next()
                    .cloned()
                    .ok_or_else(|| ClientError::Config(format!("missing value for {}", flag)))
            };
            match arg.as_str() {
                "-s" => config.socket_path = PathBuf::from(value("-s")?),
                "-H" => host = Some(value("-H")?),
                "-p" => {
                    port = Some(value("-p")?.parse().map_err(|_| {
                        ClientError::Config("bad port".to_string())
                    })?)
                }
                "-t" => {
                    config.timeout_ms = value("-t")?.parse().map_err(|_| {
                        ClientError::Config("bad timeout".to_string())
                    })?
                }
                other => return Err(ClientError::Config(format!("unknown option '{}'", other))),
            }
        }
        if host.is_some() || port.is_some() {
            config.tcp = Some((
                host.unwrap_or_else(|| "127.0.0.1".to_string()),
                port.unwrap_or(7777),
            ));
        }
        Ok(config)
    }
}

enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_read_timeout(timeout),
            Stream::Tcp(s) => s.set_read_timeout(timeout),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.write_all(buf),
            Stream::Tcp(s) => s.write_all(buf),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Unix(s) => s.read_exact(buf),
            Stream::Tcp(s) => s.read_exact(buf),
        }
    }
}

type Callback = Box<dyn FnMut(&ClientEvent) + Send>;

/// A module's connection to the tag server.
pub struct DaxClient {
    name: String,
    config: ClientConfig,
    stream: Option<Stream>,
    next_id: u32,
    timeout: Duration,
    /// Mirror of the server's CDT registry, fetched on demand in index
    /// order so type codes and layouts line up exactly
    types: TypeRegistry,
    cache: TagCache,
    fifo: EventFifo,
    callbacks: HashMap<u32, Callback>,
    last_data: Option<Vec<u8>>,
    conn_id: u32,
}

impl DaxClient {
    /// Create an unconnected client for the named module.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: ClientConfig::default(),
            stream: None,
            next_id: 1,
            timeout: Duration::from_millis(TIMEOUT_DEFAULT_MS),
            types: TypeRegistry::new(),
            cache: TagCache::new(CACHE_SIZE),
            fifo: EventFifo::new(),
            callbacks: HashMap::new(),
            last_data: None,
            conn_id: 0,
        }
    }

    /// Apply a configuration (typically parsed from the module's command
    /// line) before connecting.
    pub fn configure(&mut self, config: ClientConfig) {
        self.set_timeout_ms(config.timeout_ms);
        self.config = config;
    }

    /// Set the request timeout, clamped to the supported range.
    pub fn set_timeout_ms(&mut self, ms: u64) {
        let ms = ms.clamp(TIMEOUT_MIN_MS, TIMEOUT_MAX_MS);
        self.timeout = Duration::from_millis(ms);
    }

    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connection id assigned by the server at registration.
    pub fn connection_id(&self) -> u32 {
        self.conn_id
    }

    /// Connect and register the module with the server.
    pub fn connect(&mut self) -> ClientResult<()> {
        let stream = match &self.config.tcp {
            Some((host, port)) => {
                let s = TcpStream::connect((host.as_str(), *port))?;
                s.set_nodelay(true)?;
                Stream::Tcp(s)
            }
            None => Stream::Unix(UnixStream::connect(&self.config.socket_path)?),
        };
        self.stream = Some(stream);

        let mut w = PayloadWriter::new();
        w.put_str(&self.name).put_u32(0);
        let body = match self.request(cmd::MOD_REG, w.into_bytes()) {
            Ok(body) => body,
            Err(e) => {
                self.stream = None;
                return Err(e);
            }
        };
        let mut r = PayloadReader::new(&body);
        self.conn_id = r.get_u32()?;
        let _server_timeout = r.get_u32()?;
        Ok(())
    }

    /// Unregister and drop the connection. Local caches and pending
    /// events are discarded.
    pub fn disconnect(&mut self) {
        if self.stream.is_some() {
            let _ = self.request(cmd::MOD_UNREG, Vec::new());
        }
        self.stream = None;
        self.conn_id = 0;
        self.cache.clear();
        self.fifo.clear();
        self.callbacks.clear();
        self.last_data = None;
    }

    // ------------------------------------------------------------------
    // request plumbing

    fn request(&mut self, command: u32, payload: Vec<u8>) -> ClientResult<Vec<u8>> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let fifo = &mut self.fifo;

        let header = MessageHeader {
            command,
            size: payload.len() as u32,
            id,
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&payload);
        stream.write_all(&frame)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ClientError::Timeout);
            }
            stream.set_read_timeout(Some(remaining))?;
            let (hdr, body) = read_frame(stream)?;
            if hdr.command == cmd::EVENT_NOTIFY {
                fifo.push(parse_event(&body)?);
                continue;
            }
            if hdr.id != id {
                // stale response from an abandoned request
                continue;
            }
            if hdr.is_error() {
                let mut r = PayloadReader::new(&body);
                let code = ErrorCode::from_code(r.get_i32()?);
                return Err(ClientError::Server(code));
            }
            return Ok(body);
        }
    }

    /// Read frames off the socket for up to `wait`, parking notifications
    /// locally. Returns as soon as one notification arrives.
    fn pump(&mut self, wait: Duration) -> ClientResult<bool> {
        let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
        let fifo = &mut self.fifo;
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // even a zero wait does one short poll of the socket
            stream.set_read_timeout(Some(remaining.max(Duration::from_millis(1))))?;
            match read_frame(stream) {
                Ok((hdr, body)) => {
                    if hdr.command == cmd::EVENT_NOTIFY {
                        fifo.push(parse_event(&body)?);
                        return Ok(true);
                    }
                    // stale response; drop it
                }
                Err(ClientError::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }
    }

    // ------------------------------------------------------------------
    // tags

    /// Create (or idempotently re-open) a tag and return a handle
    /// covering the whole of it.
    pub fn tag_add(
        &mut self,
        name: &str,
        type_code: TypeCode,
        count: u32,
        attr: TagAttr,
    ) -> ClientResult<TagHandle> {
        let mut w = PayloadWriter::new();
        w.put_u32(type_code)
            .put_u32(count)
            .put_u32(attr.bits())
            .put_str(name);
        let body = self.request(cmd::TAG_ADD, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        let index = r.get_u32()?;
        self.whole_tag_handle(index, type_code, count)
    }

    fn whole_tag_handle(
        &mut self,
        index: u32,
        type_code: TypeCode,
        count: u32,
    ) -> ClientResult<TagHandle> {
        let elem = element_type(type_code);
        self.ensure_types_for(elem)?;
        let size = self
            .types
            .tag_data_size(elem, count)
            .map_err(ClientError::Server)?;
        Ok(TagHandle {
            index,
            type_code: elem,
            byte: 0,
            bit: 0,
            count,
            size,
        })
    }

    pub fn tag_del(&mut self, index: u32) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(index);
        self.request(cmd::TAG_DEL, w.into_bytes())?;
        self.cache.invalidate(index);
        Ok(())
    }

    pub fn tag_get_name(&mut self, name: &str) -> ClientResult<TagDesc> {
        if let Some(desc) = self.cache.get_by_name(name) {
            return Ok(desc);
        }
        let mut w = PayloadWriter::new();
        w.put_u8(1).put_str(name);
        let body = self.request(cmd::TAG_GET, w.into_bytes())?;
        let desc = parse_desc(&body)?;
        self.cache.insert(desc.clone());
        Ok(desc)
    }

    pub fn tag_get_index(&mut self, index: u32) -> ClientResult<TagDesc> {
        if let Some(desc) = self.cache.get_by_index(index) {
            return Ok(desc);
        }
        let mut w = PayloadWriter::new();
        w.put_u8(0).put_u32(index);
        let body = self.request(cmd::TAG_GET, w.into_bytes())?;
        let desc = parse_desc(&body)?;
        self.cache.insert(desc.clone());
        Ok(desc)
    }

    /// Fetch every live tag descriptor.
    pub fn tag_list(&mut self) -> ClientResult<Vec<TagDesc>> {
        let mut out = Vec::new();
        let mut after = 0u32;
        loop {
            let mut w = PayloadWriter::new();
            w.put_u32(after);
            let body = self.request(cmd::TAG_LIST, w.into_bytes())?;
            let mut r = PayloadReader::new(&body);
            let count = r.get_u16()?;
            if count == 0 {
                return Ok(out);
            }
            for _ in 0..count {
                let desc = read_desc(&mut r)?;
                after = desc.index + 1;
                out.push(desc);
            }
        }
    }

    /// Resolve a textual address (`Dummy[5]`, `foo[2].bar[3]`, `Dummy.2`)
    /// into a handle. `count` of 0 takes the whole remainder.
    pub fn tag_handle(&mut self, addr: &str, count: u32) -> ClientResult<TagHandle> {
        let name = leading_name(addr).map_err(ClientError::Server)?;
        let desc = self.tag_get_name(name)?;
        self.ensure_types_for(desc.type_code)?;
        resolve_address(&self.types, &desc, addr, count).map_err(ClientError::Server)
    }

    // ------------------------------------------------------------------
    // typed data access

    /// Read the region a handle describes. Bit regions come back packed
    /// from bit 0.
    pub fn tag_read(&mut self, handle: &TagHandle) -> ClientResult<Vec<u8>> {
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index)
            .put_u32(handle.byte)
            .put_u32(handle.size);
        let raw = self.request(cmd::TAG_READ, w.into_bytes())?;
        if handle.is_bit() {
            Ok(unpack_bits(&raw, handle.bit, handle.count))
        } else {
            Ok(raw)
        }
    }

    /// Write the region a handle describes. Bit regions take packed bits
    /// and go out as a masked write so neighboring bits survive.
    pub fn tag_write(&mut self, handle: &TagHandle, data: &[u8]) -> ClientResult<()> {
        if handle.is_bit() {
            let needed = ((handle.count + 7) / 8) as usize;
            if data.len() < needed {
                return Err(ClientError::Server(ErrorCode::Arg));
            }
            let (buf, mask) = pack_bits(data, handle.bit, handle.count, handle.size);
            let mut w = PayloadWriter::new();
            w.put_u32(handle.index)
                .put_u32(handle.byte)
                .put_u32(handle.size)
                .put_bytes(&buf)
                .put_bytes(&mask);
            self.request(cmd::TAG_MWRITE, w.into_bytes())?;
        } else {
            if data.len() != handle.size as usize {
                return Err(ClientError::Server(ErrorCode::Arg));
            }
            let mut w = PayloadWriter::new();
            w.put_u32(handle.index).put_u32(handle.byte).put_bytes(data);
            self.request(cmd::TAG_WRITE, w.into_bytes())?;
        }
        Ok(())
    }

    /// Masked write: `new = (old & !mask) | (data & mask)`.
    pub fn tag_mask_write(
        &mut self,
        handle: &TagHandle,
        data: &[u8],
        mask: &[u8],
    ) -> ClientResult<()> {
        if data.len() != handle.size as usize || mask.len() != data.len() {
            return Err(ClientError::Server(ErrorCode::Arg));
        }
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index)
            .put_u32(handle.byte)
            .put_u32(handle.size)
            .put_bytes(data)
            .put_bytes(mask);
        self.request(cmd::TAG_MWRITE, w.into_bytes())?;
        Ok(())
    }

    /// Read a single-element handle as a typed value.
    pub fn read_value(&mut self, handle: &TagHandle) -> ClientResult<TagValue> {
        let raw = self.tag_read(handle)?;
        TagValue::decode(handle.type_code, &raw).map_err(ClientError::Server)
    }

    /// Write a typed value through a single-element handle.
    pub fn write_value(&mut self, handle: &TagHandle, value: TagValue) -> ClientResult<()> {
        if element_type(handle.type_code) != value.type_code() {
            return Err(ClientError::Server(ErrorCode::BadType));
        }
        self.tag_write(handle, &value.encode())
    }

    // ------------------------------------------------------------------
    // custom data types

    /// Create a CDT on the server and mirror it locally.
    pub fn cdt_create(&mut self, builder: CdtBuilder) -> ClientResult<TypeCode> {
        let mut w = PayloadWriter::new();
        w.put_str(&builder.name).put_u8(builder.members.len() as u8);
        for (name, t, count) in &builder.members {
            w.put_str(name).put_u32(*t).put_u32(*count);
        }
        let body = self.request(cmd::CDT_CREATE, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        let type_code = r.get_u32()?;
        self.ensure_types_for(type_code)?;
        Ok(type_code)
    }

    /// Fetch a CDT definition (structure and layout).
    pub fn cdt_get(&mut self, type_code: TypeCode) -> ClientResult<Cdt> {
        self.ensure_types_for(type_code)?;
        self.types
            .resolve(type_code)
            .cloned()
            .map_err(ClientError::Server)
    }

    /// Resolve a type name (base mnemonic or CDT name) to its code.
    pub fn cdt_lookup(&mut self, name: &str) -> ClientResult<TypeCode> {
        if let Some(t) = self.types.parse_type_name(name) {
            return Ok(t);
        }
        let mut w = PayloadWriter::new();
        w.put_u8(1).put_str(name);
        let body = self.request(cmd::CDT_GET, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        let type_code = r.get_u32()?;
        self.ensure_types_for(type_code)?;
        Ok(type_code)
    }

    /// Mirror every server CDT up to and including the one `t` names.
    /// CDT indices are monotonic and members only reference earlier
    /// types, so fetching in index order reproduces the layouts exactly.
    fn ensure_types_for(&mut self, t: TypeCode) -> ClientResult<()> {
        let Some(index) = cdt_index(element_type(t)) else {
            return Ok(());
        };
        while self.types.len() <= index as usize {
            let next = custom_type(self.types.len() as u16);
            let mut w = PayloadWriter::new();
            w.put_u8(0).put_u32(next);
            let body = self.request(cmd::CDT_GET, w.into_bytes())?;
            let mut r = PayloadReader::new(&body);
            let _type_code = r.get_u32()?;
            let name = r.get_str()?;
            let count = r.get_u8()? as usize;
            let mut members = Vec::with_capacity(count);
            for _ in 0..count {
                let mname = r.get_str()?;
                let mtype = r.get_u32()?;
                let mcount = r.get_u32()?;
                members.push((mname, mtype, mcount));
            }
            self.types
                .create(&name, &members)
                .map_err(ClientError::Server)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // events

    /// Register an event on the watched region, with an optional callback
    /// run by `event_poll`/`event_wait` on delivery.
    pub fn event_add(
        &mut self,
        handle: &TagHandle,
        kind: EventKind,
        data: Option<&[u8]>,
        udata: u32,
        callback: Option<Callback>,
    ) -> ClientResult<EventId> {
        let mut w = PayloadWriter::new();
        w.put_handle(handle);
        w.put_u8(kind as u8).put_u32(udata);
        match data {
            Some(d) => {
                w.put_u16(d.len() as u16);
                w.put_bytes(d);
            }
            None => {
                w.put_u16(0);
            }
        }
        let body = self.request(cmd::EVENT_ADD, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        let id = r.get_u32()?;
        if let Some(cb) = callback {
            self.callbacks.insert(id, cb);
        }
        Ok(EventId {
            tag: handle.index,
            id,
        })
    }

    pub fn event_del(&mut self, id: EventId) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(id.tag).put_u32(id.id);
        self.request(cmd::EVENT_DEL, w.into_bytes())?;
        self.callbacks.remove(&id.id);
        Ok(())
    }

    pub fn event_mod(
        &mut self,
        id: EventId,
        kind: EventKind,
        data: Option<&[u8]>,
    ) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(id.tag).put_u32(id.id).put_u8(kind as u8);
        match data {
            Some(d) => {
                w.put_u16(d.len() as u16);
                w.put_bytes(d);
            }
            None => {
                w.put_u16(0);
            }
        }
        self.request(cmd::EVENT_MOD, w.into_bytes())?;
        Ok(())
    }

    /// Deliver one pending notification if any is available, without
    /// blocking beyond a short socket poll.
    pub fn event_poll(&mut self) -> ClientResult<Option<ClientEvent>> {
        if self.fifo.is_empty() {
            self.pump(Duration::ZERO)?;
        }
        match self.fifo.pop() {
            Some(event) => Ok(Some(self.deliver(event))),
            None => Ok(None),
        }
    }

    /// Block up to `timeout_ms` for a notification. Zero polls once;
    /// negative waits forever.
    pub fn event_wait(&mut self, timeout_ms: i64) -> ClientResult<Option<ClientEvent>> {
        if let Some(event) = self.fifo.pop() {
            return Ok(Some(self.deliver(event)));
        }
        if timeout_ms < 0 {
            loop {
                self.pump(Duration::from_millis(1000))?;
                if let Some(event) = self.fifo.pop() {
                    return Ok(Some(self.deliver(event)));
                }
            }
        }
        self.pump(Duration::from_millis(timeout_ms as u64))?;
        match self.fifo.pop() {
            Some(event) => Ok(Some(self.deliver(event))),
            None => Ok(None),
        }
    }

    /// Payload of the most recently delivered notification, for use from
    /// inside callbacks.
    pub fn event_get_data(&self) -> Option<&[u8]> {
        self.last_data.as_deref()
    }

    fn deliver(&mut self, event: ClientEvent) -> ClientEvent {
        self.last_data = Some(event.data.clone());
        if let Some(cb) = self.callbacks.get_mut(&event.id) {
            cb(&event);
        }
        event
    }

    // ------------------------------------------------------------------
    // groups

    /// Register a read/write group; returns the group id.
    pub fn group_add(&mut self, handles: &[TagHandle]) -> ClientResult<u32> {
        let mut w = PayloadWriter::new();
        w.put_u8(handles.len() as u8);
        for h in handles {
            w.put_handle(h);
        }
        let body = self.request(cmd::GROUP_ADD, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        let id = r.get_u32()?;
        let _size = r.get_u32()?;
        Ok(id)
    }

    pub fn group_read(&mut self, id: u32) -> ClientResult<Vec<u8>> {
        let mut w = PayloadWriter::new();
        w.put_u32(id);
        self.request(cmd::GROUP_READ, w.into_bytes())
    }

    pub fn group_write(&mut self, id: u32, data: &[u8]) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(id).put_bytes(data);
        self.request(cmd::GROUP_WRITE, w.into_bytes())?;
        Ok(())
    }

    pub fn group_del(&mut self, id: u32) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(id);
        self.request(cmd::GROUP_DEL, w.into_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // mappings

    pub fn map_add(&mut self, src: &TagHandle, dst: &TagHandle) -> ClientResult<u32> {
        let mut w = PayloadWriter::new();
        w.put_handle(src).put_handle(dst);
        let body = self.request(cmd::MAP_ADD, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        Ok(r.get_u32()?)
    }

    pub fn map_del(&mut self, id: u32) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(id);
        self.request(cmd::MAP_DEL, w.into_bytes())?;
        Ok(())
    }

    pub fn map_get(&mut self, id: u32) -> ClientResult<(TagHandle, TagHandle)> {
        let mut w = PayloadWriter::new();
        w.put_u32(id);
        let body = self.request(cmd::MAP_GET, w.into_bytes())?;
        let mut r = PayloadReader::new(&body);
        Ok((r.get_handle()?, r.get_handle()?))
    }

    // ------------------------------------------------------------------
    // overrides

    /// Store a whole-tag override shadow without arming it.
    pub fn tag_add_override(&mut self, handle: &TagHandle, data: &[u8]) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index).put_bytes(data);
        self.request(cmd::OVR_ADD, w.into_bytes())?;
        Ok(())
    }

    pub fn tag_set_override(&mut self, handle: &TagHandle) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index);
        self.request(cmd::OVR_SET, w.into_bytes())?;
        Ok(())
    }

    pub fn tag_clr_override(&mut self, handle: &TagHandle) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index);
        self.request(cmd::OVR_CLR, w.into_bytes())?;
        Ok(())
    }

    pub fn tag_del_override(&mut self, handle: &TagHandle) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_u32(handle.index);
        self.request(cmd::OVR_DEL, w.into_bytes())?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // atomic operations

    /// Server-side read-modify-write over the handle's region.
    pub fn atomic_op(
        &mut self,
        handle: &TagHandle,
        op: AtomicOp,
        operand: &[u8],
    ) -> ClientResult<()> {
        let mut w = PayloadWriter::new();
        w.put_handle(handle);
        w.put_u16(op as u16).put_bytes(operand);
        self.request(cmd::ATOMIC_OP, w.into_bytes())?;
        Ok(())
    }
}

/// Builder for a CDT creation request.
#[derive(Debug, Clone)]
pub struct CdtBuilder {
    name: String,
    members: Vec<(String, TypeCode, u32)>,
}

impl CdtBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Vec::new(),
        }
    }

    /// Append a member.
    pub fn member(mut self, name: &str, type_code: TypeCode, count: u32) -> Self {
        self.members.push((name.to_string(), type_code, count));
        self
    }
}

fn read_frame(stream: &mut Stream) -> ClientResult<(MessageHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    if let Err(e) = stream.read_exact(&mut header_buf) {
        return Err(map_io(e));
    }
    let header = MessageHeader::decode(&header_buf);
    // the header may have arrived during a short poll; give the payload a
    // real timeout so the frame never splits
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut payload = vec![0u8; header.size as usize];
    if let Err(e) = stream.read_exact(&mut payload) {
        return Err(map_io(e));
    }
    Ok((header, payload))
}

fn map_io(e: std::io::Error) -> ClientError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ClientError::Timeout,
        std::io::ErrorKind::UnexpectedEof => ClientError::Server(ErrorCode::Disconnected),
        _ => ClientError::Io(e),
    }
}

fn parse_event(body: &[u8]) -> ClientResult<ClientEvent> {
    let mut r = PayloadReader::new(body);
    Ok(ClientEvent {
        id: r.get_u32()?,
        tag: r.get_u32()?,
        missed: r.get_u32()?,
        udata: r.get_u32()?,
        data: r.get_rest(),
    })
}

fn read_desc(r: &mut PayloadReader<'_>) -> ClientResult<TagDesc> {
    let index = r.get_u32()?;
    let type_code = r.get_u32()?;
    let count = r.get_u32()?;
    let attr = TagAttr::from_bits_truncate(r.get_u32()?);
    let name = r.get_str()?;
    Ok(TagDesc {
        index,
        name,
        type_code,
        count,
        attr,
    })
}

fn parse_desc(body: &[u8]) -> ClientResult<TagDesc> {
    let mut r = PayloadReader::new(body);
    read_desc(&mut r)
}

/// Extract `count` bits starting at `bit` of a raw region, packed from
/// bit 0 of the output.
fn unpack_bits(raw: &[u8], bit: u8, count: u32) -> Vec<u8> {
    let mut out = vec![0u8; ((count + 7) / 8) as usize];
    for n in 0..count as u64 {
        let pos = bit as u64 + n;
        let byte = (pos / 8) as usize;
        if byte >= raw.len() {
            break;
        }
        if raw[byte] >> (pos % 8) & 1 != 0 {
            out[(n / 8) as usize] |= 1 << (n % 8);
        }
    }
    out
}

/// Spread packed bits across `size` bytes starting at `bit`, with the
/// matching write mask.
fn pack_bits(packed: &[u8], bit: u8, count: u32, size: u32) -> (Vec<u8>, Vec<u8>) {
    let mut data = vec![0u8; size as usize];
    let mut mask = vec![0u8; size as usize];
    for n in 0..count as u64 {
        let src = (n / 8) as usize;
        if src >= packed.len() {
            break;
        }
        let value = packed[src] >> (n % 8) & 1;
        let pos = bit as u64 + n;
        let byte = (pos / 8) as usize;
        if byte >= data.len() {
            break;
        }
        mask[byte] |= 1 << (pos % 8);
        if value != 0 {
            data[byte] |= 1 << (pos % 8);
        }
    }
    (data, mask)
}
