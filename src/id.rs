//! Deduplicated 32-bit UID/GID table. Inodes store 16-bit indices into this table.

use std::io::{Seek, Write};

use deku::prelude::*;
use deku::DekuContainerWrite;

use crate::codec::Codec;
use crate::error::BackhandError;
use crate::metadata::MetadataWriter;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct Id {
    pub num: u32,
}

impl Id {
    pub const SIZE: usize = (u32::BITS / 8) as usize;

    pub fn new(num: u32) -> Id {
        Id { num }
    }
}

/// Collects distinct UID/GID values in first-seen order and hands out 16-bit indices.
#[derive(Default)]
pub struct IdTable {
    ids: Vec<u32>,
}

impl IdTable {
    pub fn new() -> Self {
        Self { ids: vec![0] } // index 0 is always root/0, mirroring squashfs-tools
    }

    /// Look up `id`, inserting it if this is the first time it's been seen.
    pub fn lookup_add(&mut self, id: u32) -> Result<u16, BackhandError> {
        if let Some(pos) = self.ids.iter().position(|&x| x == id) {
            return u16::try_from(pos).map_err(|_| BackhandError::Overflow("id table index"));
        }
        self.ids.push(id);
        u16::try_from(self.ids.len() - 1).map_err(|_| BackhandError::Overflow("id table index"))
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Serialize the id metadata blocks, then the second-level 64-bit offset index;
    /// returns the offset of that index (the superblock's `id_table` field).
    pub fn write_table<W: std::io::Write + std::io::Seek>(
        &self,
        out: &mut W,
        codec: &dyn Codec,
    ) -> Result<u64, BackhandError> {
        let mut meta = MetadataWriter::new(codec.clone_box());
        for &num in &self.ids {
            meta.write_all(&Id::new(num).to_bytes()?)?;
        }
        let block_offsets = meta.finalize(out)?;

        let index_start = out.stream_position()?;
        for offset in block_offsets {
            out.write_all(&offset.to_le_bytes())?;
        }
        Ok(index_start)
    }
}
