//! Extended attribute tables: a shared key/value stream plus a per-inode id index.
//!
//! Values repeated across different xattr sets are stored once, in a separate
//! value stream, and referenced from the entry stream by a metadata ref — the
//! same content-addressing idea the block writer and fragment table apply to
//! file data, just at xattr-value scale. Keeping values in their own stream (as
//! opposed to self-referencing the entry stream) means a reader never needs to
//! interleave two read positions in the same stream to resolve one entry.

use std::io::{Seek, Write};

use rustc_hash::FxHashMap;
use tracing::instrument;

use crate::block::fingerprint;
use crate::codec::Codec;
use crate::error::BackhandError;
use crate::metadata::{pack_ref, MetadataWriter};

pub const NO_XATTR: u32 = 0xffff_ffff;
const OOL_VALUE_THRESHOLD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum XattrPrefix {
    User = 0,
    Trusted = 1,
    Security = 2,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct XattrKey {
    pub prefix: XattrPrefix,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct XattrEntry {
    pub key: XattrKey,
    pub value: Vec<u8>,
}

/// Sort by key and drop exact-duplicate keys, so two xattr sets that differ only
/// in insertion order canonicalize to the same id.
pub fn canonicalize(mut entries: Vec<XattrEntry>) -> Vec<XattrEntry> {
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries.dedup_by(|a, b| a.key == b.key);
    entries
}

fn set_fingerprint(entries: &[XattrEntry]) -> u64 {
    let mut buf = Vec::new();
    for entry in entries {
        buf.push(entry.key.prefix as u8);
        buf.extend_from_slice(&(entry.key.name.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry.key.name);
        buf.extend_from_slice(&(entry.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&entry.value);
    }
    fingerprint(&buf)
}

struct XattrId {
    kv_ref: u64,
    count: u32,
    size: u32,
}

pub struct XattrWriter {
    kv_stream: MetadataWriter,
    value_stream: MetadataWriter,
    id_codec: Box<dyn Codec>,
    ids: Vec<XattrId>,
    value_dedup: FxHashMap<Vec<u8>, u64>,
    set_dedup: FxHashMap<u64, u32>,
}

impl XattrWriter {
    pub fn new(codec: Box<dyn Codec>) -> Self {
        Self {
            kv_stream: MetadataWriter::new(codec.clone_box()),
            value_stream: MetadataWriter::new(codec.clone_box()),
            id_codec: codec,
            ids: Vec::new(),
            value_dedup: FxHashMap::default(),
            set_dedup: FxHashMap::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Store a canonicalized xattr set, returning its index for the owning inode's
    /// `xattr_index` field, or [`NO_XATTR`] for an empty set. Identical sets reuse
    /// the same index.
    #[instrument(skip_all)]
    pub fn add_set(&mut self, entries: Vec<XattrEntry>) -> Result<u32, BackhandError> {
        let entries = canonicalize(entries);
        if entries.is_empty() {
            return Ok(NO_XATTR);
        }

        let fp = set_fingerprint(&entries);
        if let Some(&idx) = self.set_dedup.get(&fp) {
            return Ok(idx);
        }

        let (start, offset) = self.kv_stream.position();
        let kv_ref = pack_ref(start, offset);
        let mut count = 0u32;
        let mut size = 0u32;

        for entry in &entries {
            let type_tag = entry.key.prefix as u16;
            self.kv_stream.write_all(&type_tag.to_le_bytes())?;
            self.kv_stream
                .write_all(&(entry.key.name.len() as u16).to_le_bytes())?;
            self.kv_stream.write_all(&entry.key.name)?;
            size += 4 + entry.key.name.len() as u32;

            size += self.store_value(&entry.value)?;
            count += 1;
        }

        let idx = self.ids.len() as u32;
        self.ids.push(XattrId {
            kv_ref,
            count,
            size,
        });
        self.set_dedup.insert(fp, idx);
        Ok(idx)
    }

    /// Write one value field into the entry stream, returning the number of bytes
    /// it took up there.
    ///
    /// The field is a one-byte tag followed by either an inline `len: u32` plus
    /// that many bytes (`tag == 0`), or an 8-byte metadata ref into the value
    /// stream (`tag == 1`) where an earlier, `>= 16`-byte occurrence of the same
    /// value already lives.
    fn store_value(&mut self, value: &[u8]) -> Result<u32, BackhandError> {
        if value.len() >= OOL_VALUE_THRESHOLD {
            let vref = if let Some(&existing) = self.value_dedup.get(value) {
                existing
            } else {
                let (start, offset) = self.value_stream.position();
                let vref = pack_ref(start, offset);
                self.value_stream
                    .write_all(&(value.len() as u32).to_le_bytes())?;
                self.value_stream.write_all(value)?;
                self.value_dedup.insert(value.to_vec(), vref);
                vref
            };
            self.kv_stream.write_all(&[1u8])?;
            self.kv_stream.write_all(&vref.to_le_bytes())?;
            return Ok(9);
        }
        self.kv_stream.write_all(&[0u8])?;
        self.kv_stream
            .write_all(&(value.len() as u32).to_le_bytes())?;
        self.kv_stream.write_all(value)?;
        Ok(1 + 4 + value.len() as u32)
    }

    /// Write the entry stream, the value stream, the id records, and the id
    /// offset index, in that order, followed by a small header naming the two
    /// streams' starts and the id count. Returns the header's offset, the value
    /// stored in the superblock's `xattr_table` field.
    #[instrument(skip_all)]
    pub fn write_table<W: Write + Seek>(&mut self, out: &mut W) -> Result<u64, BackhandError> {
        let kv_start = out.stream_position()?;
        self.kv_stream.finalize(out)?;

        let value_start = out.stream_position()?;
        self.value_stream.finalize(out)?;

        let mut id_meta = MetadataWriter::new(self.id_codec.clone_box());
        for id in &self.ids {
            id_meta.write_all(&id.kv_ref.to_le_bytes())?;
            id_meta.write_all(&id.count.to_le_bytes())?;
            id_meta.write_all(&id.size.to_le_bytes())?;
        }
        let id_offsets = id_meta.finalize(out)?;

        let header_start = out.stream_position()?;
        out.write_all(&kv_start.to_le_bytes())?;
        out.write_all(&value_start.to_le_bytes())?;
        out.write_all(&(self.ids.len() as u32).to_le_bytes())?;
        out.write_all(&[0u8; 4])?;
        for offset in &id_offsets {
            out.write_all(&offset.to_le_bytes())?;
        }
        Ok(header_start)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::default_codec;

    fn entry(prefix: XattrPrefix, name: &str, value: &str) -> XattrEntry {
        XattrEntry {
            key: XattrKey { prefix, name: name.as_bytes().to_vec() },
            value: value.as_bytes().to_vec(),
        }
    }

    #[test]
    fn canonicalize_sorts_and_dedups_by_key() {
        let entries = vec![
            entry(XattrPrefix::User, "b", "2"),
            entry(XattrPrefix::User, "a", "1"),
            entry(XattrPrefix::User, "a", "stale"),
        ];
        let sorted = canonicalize(entries);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].key.name, b"a");
        assert_eq!(sorted[0].value, b"1");
        assert_eq!(sorted[1].key.name, b"b");
    }

    #[test]
    fn identical_sets_reuse_one_index() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let mut writer = XattrWriter::new(codec);
        let a = vec![entry(XattrPrefix::User, "k", "short")];
        let b = vec![entry(XattrPrefix::User, "k", "short")];
        let idx_a = writer.add_set(a).unwrap();
        let idx_b = writer.add_set(b).unwrap();
        assert_eq!(idx_a, idx_b);
    }

    #[test]
    fn empty_set_maps_to_no_xattr() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let mut writer = XattrWriter::new(codec);
        assert_eq!(writer.add_set(vec![]).unwrap(), NO_XATTR);
        assert!(writer.is_empty());
    }

    #[test]
    fn long_values_deduplicate_across_sets() {
        let codec = default_codec(crate::codec::Compressor::Xz).unwrap();
        let mut writer = XattrWriter::new(codec);
        let long_value = "x".repeat(64);
        let a = vec![entry(XattrPrefix::User, "one", &long_value)];
        let b = vec![entry(XattrPrefix::Trusted, "two", &long_value)];
        writer.add_set(a).unwrap();
        writer.add_set(b).unwrap();
        // Both sets reference the same out-of-line value, so only one copy should
        // have been appended to the value stream.
        assert_eq!(writer.value_dedup.len(), 1);

        let mut out = Cursor::new(Vec::new());
        writer.write_table(&mut out).unwrap();
        assert!(!out.get_ref().is_empty());
    }
}
