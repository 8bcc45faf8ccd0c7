//! NFS export table: a dense array of inode metadata refs, indexed by
//! `inode_number - 1`, letting a kernel NFS export reconstruct a path-independent
//! file handle straight from an inode number.

use std::io::{Seek, Write};

use tracing::instrument;

use crate::codec::Codec;
use crate::error::BackhandError;
use crate::metadata::MetadataWriter;

pub struct ExportTable {
    /// `refs[inode_number - 1]` is the packed `(start, offset)` metadata ref of
    /// that inode, as returned by [`crate::inode::Inode::write`].
    refs: Vec<u64>,
}

impl ExportTable {
    pub fn new(inode_count: u32) -> Self {
        Self {
            refs: vec![0; inode_count as usize],
        }
    }

    /// Record where inode `inode_number` landed in the inode metadata stream.
    pub fn set(&mut self, inode_number: u32, inode_ref: u64) -> Result<(), BackhandError> {
        let idx = inode_number
            .checked_sub(1)
            .ok_or(BackhandError::OutOfBounds("export table inode number"))? as usize;
        *self
            .refs
            .get_mut(idx)
            .ok_or(BackhandError::OutOfBounds("export table inode number"))? = inode_ref;
        Ok(())
    }

    /// Write the export table's metadata blocks, then the second-level 64-bit
    /// block-offset index, returning the offset stored in the superblock's
    /// `export_table` field.
    #[instrument(skip_all)]
    pub fn write_table<W: Write + Seek>(
        &self,
        out: &mut W,
        codec: &dyn Codec,
    ) -> Result<u64, BackhandError> {
        let mut meta = MetadataWriter::new(codec.clone_box());
        for &reference in &self.refs {
            meta.write_all(&reference.to_le_bytes())?;
        }
        let block_offsets = meta.finalize(out)?;

        let index_start = out.stream_position()?;
        for offset in block_offsets {
            out.write_all(&offset.to_le_bytes())?;
        }
        Ok(index_start)
    }
}
