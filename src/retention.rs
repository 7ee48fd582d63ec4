//! Retention: best-effort persistence of RETAIN-flagged tags.
//!
//! The store is a flat keyed file (`retentive.db` by default): magic
//! `DAXR`, a version byte, then one record per tag. It loads once at boot;
//! a tag created with the RETAIN attribute picks its saved value up at
//! creation when the stored shape still matches. Writes mark the tag
//! dirty; a background flusher rewrites the file periodically and on
//! clean shutdown.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::logger::Topics;
use crate::topic_log;
use crate::types::TypeCode;

const MAGIC: &[u8; 4] = b"DAXR";
const VERSION: u8 = 1;

/// Retention file errors.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("not a retention file")]
    BadMagic,

    #[error("unsupported retention file version {0}")]
    BadVersion(u8),
}

/// One persisted tag value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedRecord {
    pub name: String,
    pub type_code: TypeCode,
    pub count: u32,
    pub data: Vec<u8>,
}

/// Serialize records into the on-disk layout.
pub fn encode_store(records: &[RetainedRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 * records.len() + 5);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    for rec in records {
        let name = rec.name.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&rec.type_code.to_le_bytes());
        out.extend_from_slice(&rec.count.to_le_bytes());
        out.extend_from_slice(&(rec.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&rec.data);
    }
    out
}

/// Parse the on-disk layout. Truncated trailing records are skipped.
pub fn decode_store(buf: &[u8]) -> Result<Vec<RetainedRecord>, RetentionError> {
    if buf.len() < 5 || &buf[..4] != MAGIC {
        return Err(RetentionError::BadMagic);
    }
    if buf[4] != VERSION {
        return Err(RetentionError::BadVersion(buf[4]));
    }
    let mut records = Vec::new();
    let mut pos = 5usize;
    while pos + 2 <= buf.len() {
        let name_len = u16::from_le_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2;
        if pos + name_len + 12 > buf.len() {
            break;
        }
        let name = match std::str::from_utf8(&buf[pos..pos + name_len]) {
            Ok(s) => s.to_string(),
            Err(_) => break,
        };
        pos += name_len;
        let type_code = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let count = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
        let size = u32::from_le_bytes(buf[pos + 8..pos + 12].try_into().unwrap()) as usize;
        pos += 12;
        if pos + size > buf.len() {
            break;
        }
        records.push(RetainedRecord {
            name,
            type_code,
            count,
            data: buf[pos..pos + size].to_vec(),
        });
        pos += size;
    }
    Ok(records)
}

/// The in-memory retention state.
#[derive(Debug)]
pub struct RetentionStore {
    path: PathBuf,
    records: HashMap<String, RetainedRecord>,
    dirty: HashSet<u32>,
}

impl RetentionStore {
    /// Open the store, loading any existing file. A missing file is a
    /// fresh store; an unreadable one is logged and ignored.
    pub fn open(path: &Path) -> Self {
        let mut records = HashMap::new();
        match std::fs::read(path) {
            Ok(buf) => match decode_store(&buf) {
                Ok(recs) => {
                    topic_log!(Topics::MAJOR, "retention: loaded {} records from {}", recs.len(), path.display());
                    for rec in recs {
                        records.insert(rec.name.clone(), rec);
                    }
                }
                Err(e) => {
                    topic_log!(Topics::ERROR, "retention: ignoring {}: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                topic_log!(Topics::ERROR, "retention: cannot read {}: {}", path.display(), e);
            }
        }
        Self {
            path: path.to_path_buf(),
            records,
            dirty: HashSet::new(),
        }
    }

    /// Saved payload for a tag being created, when the stored shape
    /// matches. A mismatched record is discarded.
    pub fn restore(
        &mut self,
        name: &str,
        type_code: TypeCode,
        count: u32,
        size: u32,
    ) -> Option<Vec<u8>> {
        let rec = self.records.get(name)?;
        if rec.type_code == type_code && rec.count == count && rec.data.len() == size as usize {
            Some(rec.data.clone())
        } else {
            topic_log!(
                Topics::ERROR,
                "retention: stored shape for '{}' no longer matches, discarding",
                name
            );
            self.records.remove(name);
            None
        }
    }

    /// Note a write to a retained tag.
    pub fn mark_dirty(&mut self, index: u32) {
        self.dirty.insert(index);
    }

    /// Take and clear the dirty set.
    pub fn take_dirty(&mut self) -> Vec<u32> {
        self.dirty.drain().collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Refresh the stored record for one tag.
    pub fn update(&mut self, name: &str, type_code: TypeCode, count: u32, data: Vec<u8>) {
        self.records.insert(
            name.to_string(),
            RetainedRecord {
                name: name.to_string(),
                type_code,
                count,
                data,
            },
        );
    }

    /// Forget a deleted tag.
    pub fn forget(&mut self, name: &str, index: u32) {
        self.records.remove(name);
        self.dirty.remove(&index);
    }

    /// Serialize the current records; the caller writes the bytes outside
    /// the database lock.
    pub fn serialize(&self) -> Vec<u8> {
        let mut records: Vec<&RetainedRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        encode_store(&records.iter().map(|r| (*r).clone()).collect::<Vec<_>>())
    }

    /// Path the store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the store to disk now. Used at shutdown.
    pub fn save(&self) -> Result<(), RetentionError> {
        std::fs::write(&self.path, self.serialize())?;
        Ok(())
    }
}
