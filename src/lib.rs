//! # OpenDAX - Open Data Acquisition and Control System
//!
//! A tag server for distributed control: one long-lived process owns a
//! typed in-memory database of named signals and structured values and
//! mediates reads, writes, custom type definitions, events, groups,
//! overrides, and mappings for many concurrent client modules.
//!
//! ## Architecture
//!
//! - `types`: base scalar types and custom data types (CDTs)
//! - `tagbase`: the tag database, address parsing, queue tags, overrides
//! - `events`: predicate-driven subscriptions over tag writes
//! - `mapping`: directed copy rules between tag regions
//! - `groups`: handle bundles transferred in one request
//! - `retention`: best-effort persistence of RETAIN-flagged tags
//! - `protocol`: the little-endian framed wire contract
//! - `server`: socket listeners, dispatch, and lifecycle
//! - `client`: the synchronous module-side library
//! - `error`: the wire-level result taxonomy
//! - `logger`: topic-mask filtering over the `log` facade

#![warn(clippy::all)]

pub mod client;
pub mod error;
pub mod events;
pub mod groups;
pub mod logger;
pub mod mapping;
pub mod protocol;
pub mod retention;
pub mod server;
pub mod tagbase;
pub mod types;

pub use client::{ClientConfig, ClientError, ClientResult, DaxClient};
pub use error::{DaxResult, ErrorCode};
pub use events::EventKind;
pub use server::{ServerConfig, TagServer};
pub use tagbase::{AtomicOp, TagAttr, TagDesc, TagHandle};
pub use types::{TagValue, TypeCode};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
