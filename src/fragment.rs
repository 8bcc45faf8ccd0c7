//! Fragment descriptor, the fragment table, and tail-fragment deduplication.
//!
//! The block processor hands the fragment table the tail bytes of files shorter
//! than a full block. This module hashes them by `(size, fingerprint)`, verifies
//! candidates byte-for-byte, and packs misses into the currently-open fragment
//! block.

use std::io::{Read, Seek, Write};

use deku::prelude::*;
use deku::DekuContainerWrite;
use rustc_hash::FxHashMap;
use tracing::{instrument, trace};

use crate::block::{fingerprint, BlockWriter, CompletedBlock};
use crate::codec::Codec;
use crate::error::BackhandError;
use crate::metadata::MetadataWriter;

pub const FRAGMENT_SIZE: usize = 16;
pub const NO_FRAGMENT: u32 = 0xffff_ffff;
const UNCOMPRESSED_SIZE_BIT: u32 = 1 << 24;

/// 16-byte on-disk fragment table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fragment {
    pub start: u64,
    pub size: u32,
    pub unused: u32,
}

/// Where a file's tail landed: which fragment block, and at what byte offset in it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FragmentLocation {
    pub frag_index: u32,
    pub frag_offset: u32,
}

struct OpenBlock {
    bytes: Vec<u8>,
    /// `(fingerprint, size, offset_in_block)` for each tail already packed in, so an
    /// in-flight (not yet flushed) candidate can still be byte-compared in memory.
    entries: Vec<(u64, u32, u32)>,
}

pub struct FragmentTable {
    block_size: u32,
    table: Vec<Fragment>,
    /// index by (fingerprint, size) -> (frag_index, frag_offset) of an already-stamped tail
    dedup: FxHashMap<(u64, u32), Vec<FragmentLocation>>,
    current: Option<OpenBlock>,
}

impl FragmentTable {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            table: Vec::new(),
            dedup: FxHashMap::default(),
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty() && self.current.is_none()
    }

    pub fn len(&self) -> usize {
        self.table.len() + usize::from(self.current.is_some())
    }

    /// Stamp `tail` with a fragment location, deduping against already-packed tails
    /// (in the currently-open block, byte-compared in memory) and previously-written
    /// fragment blocks (byte-compared via read-back through `out`).
    #[instrument(skip(self, out, block_writer, codec, tail))]
    pub fn add_tail<W: Read + Write + Seek>(
        &mut self,
        tail: &[u8],
        out: &mut W,
        block_writer: &mut BlockWriter,
        codec: &dyn Codec,
    ) -> Result<FragmentLocation, BackhandError> {
        let fp = fingerprint(tail);
        let key = (fp, tail.len() as u32);

        if let Some(candidates) = self.dedup.get(&key) {
            for &loc in candidates {
                if self.verify_candidate(loc, tail, out, codec)? {
                    trace!(?loc, "fragment dedup hit");
                    return Ok(loc);
                }
            }
        }

        if self
            .current
            .as_ref()
            .map(|b| b.bytes.len() + tail.len() > self.block_size as usize)
            .unwrap_or(false)
        {
            self.finalize_current(out, block_writer, codec)?;
        }

        let block = self.current.get_or_insert_with(|| OpenBlock {
            bytes: Vec::with_capacity(self.block_size as usize),
            entries: Vec::new(),
        });
        let frag_index = self.table.len() as u32;
        let frag_offset = block.bytes.len() as u32;
        block.bytes.extend_from_slice(tail);
        block.entries.push((fp, tail.len() as u32, frag_offset));

        let loc = FragmentLocation {
            frag_index,
            frag_offset,
        };
        self.dedup.entry(key).or_default().push(loc);
        Ok(loc)
    }

    fn verify_candidate<W: Read + Write + Seek>(
        &self,
        loc: FragmentLocation,
        tail: &[u8],
        out: &mut W,
        codec: &dyn Codec,
    ) -> Result<bool, BackhandError> {
        // still-open block: compare in memory, no I/O needed
        if loc.frag_index as usize == self.table.len() {
            if let Some(block) = &self.current {
                let start = loc.frag_offset as usize;
                return Ok(block.bytes.get(start..start + tail.len()) == Some(tail));
            }
            return Ok(false);
        }

        // already flushed: read the host fragment block back and decompress it
        let entry = self.table[loc.frag_index as usize];
        let cur = out.stream_position()?;
        out.seek(std::io::SeekFrom::Start(entry.start))?;
        let on_disk_size = (entry.size & !UNCOMPRESSED_SIZE_BIT) as usize;
        let mut raw = vec![0u8; on_disk_size];
        out.read_exact(&mut raw)?;
        out.seek(std::io::SeekFrom::Start(cur))?;

        let decompressed = if entry.size & UNCOMPRESSED_SIZE_BIT != 0 {
            raw
        } else {
            let mut buf = Vec::new();
            codec.decompress(&raw, &mut buf)?;
            buf
        };

        let start = loc.frag_offset as usize;
        Ok(decompressed.get(start..start + tail.len()) == Some(tail))
    }

    /// Flush the currently-open fragment block through the block writer and codec,
    /// assigning it its I/O sequence at this point (spec.md §4.4).
    #[instrument(skip_all)]
    pub fn finalize_current<W: Read + Write + Seek>(
        &mut self,
        out: &mut W,
        block_writer: &mut BlockWriter,
        codec: &dyn Codec,
    ) -> Result<(), BackhandError> {
        let Some(block) = self.current.take() else {
            return Ok(());
        };
        let compressed = codec.compress(&block.bytes)?;
        let (stored_compressed, bytes) = match compressed {
            Some(c) if c.len() < block.bytes.len() => (true, c),
            _ => (false, block.bytes.clone()),
        };

        let completed = CompletedBlock {
            bytes,
            compressed: stored_compressed,
            fingerprint: fingerprint(&block.bytes),
            align: false,
        };
        // fragment blocks bypass the writer-layer dedup lookup, but are still
        // recorded so a later data block can collide against them (spec.md §4.2)
        let offset = block_writer.write_block(out, &completed, false)?;

        let size = completed.bytes.len() as u32
            | if stored_compressed {
                0
            } else {
                UNCOMPRESSED_SIZE_BIT
            };
        self.table.push(Fragment {
            start: offset,
            size,
            unused: 0,
        });
        Ok(())
    }

    /// Write the fragment-table metadata blocks, then the second-level 64-bit
    /// block-offset index, returning the offset of that index (the value stored in
    /// the superblock's `frag_table` field).
    #[instrument(skip_all)]
    pub fn write_table<W: Write + Seek>(
        &mut self,
        out: &mut W,
        codec: &dyn Codec,
    ) -> Result<u64, BackhandError> {
        let mut meta = MetadataWriter::new(codec.clone_box());
        for frag in &self.table {
            meta.write_all(&frag.to_bytes()?)?;
        }
        let block_offsets = meta.finalize(out)?;

        let index_start = out.stream_position()?;
        for offset in block_offsets {
            out.write_all(&offset.to_le_bytes())?;
        }
        Ok(index_start)
    }
}
