//! Metadata block writer: the 8 KiB, length-prefixed stream backing every table
//! except raw file data (directory table, inode table, fragment/id/xattr tables).

use std::collections::VecDeque;
use std::io::{self, Read, Seek, Write};

use tracing::{instrument, trace};

use crate::codec::Codec;
use crate::error::BackhandError;

pub const METADATA_MAXSIZE: usize = 0x2000;
const METADATA_UNCOMPRESSED: u16 = 1 << 15;

/// `(block_start << 16) | offset` reference into a metadata stream.
pub fn pack_ref(block_start: u32, offset: u16) -> u64 {
    ((block_start as u64) << 16) | offset as u64
}

pub fn unpack_ref(reference: u64) -> (u32, u16) {
    ((reference >> 16) as u32, (reference & 0xffff) as u16)
}

/// Batches arbitrary byte streams into 8 KiB metadata blocks.
pub struct MetadataWriter {
    codec: Box<dyn Codec>,
    /// Offset, from the start of this writer's eventual on-disk run, that the next
    /// sealed block will begin at.
    pub metadata_start: u32,
    pub uncompressed_bytes: VecDeque<u8>,
    final_bytes: Vec<(bool, Vec<u8>)>,
}

impl MetadataWriter {
    pub fn new(codec: Box<dyn Codec>) -> Self {
        Self {
            codec,
            metadata_start: 0,
            uncompressed_bytes: VecDeque::new(),
            final_bytes: vec![],
        }
    }

    /// Current write position, usable as an inode/directory/id-table reference.
    pub fn position(&self) -> (u32, u16) {
        (self.metadata_start, self.uncompressed_bytes.len() as u16)
    }

    #[instrument(skip_all)]
    fn add_block(&mut self) -> Result<(), BackhandError> {
        let uncompressed_len = self.uncompressed_bytes.len().min(METADATA_MAXSIZE);
        if uncompressed_len == 0 {
            return Ok(());
        }

        if self.uncompressed_bytes.as_slices().0.len() < uncompressed_len {
            self.uncompressed_bytes.make_contiguous();
        }
        let uncompressed = &self.uncompressed_bytes.as_slices().0[0..uncompressed_len];
        let compressed = self.codec.compress(uncompressed)?;

        let (stored_compressed, bytes) = match compressed {
            Some(c) if c.len() < uncompressed_len => (true, c),
            _ => (false, uncompressed.to_vec()),
        };
        self.uncompressed_bytes.drain(0..uncompressed_len);

        self.metadata_start += 2 + bytes.len() as u32;
        trace!("metadata block sealed, new start: {:#x}", self.metadata_start);
        self.final_bytes.push((stored_compressed, bytes));
        Ok(())
    }

    /// Force emission of whatever partial block remains, even if under the cap.
    pub fn flush_partial(&mut self) -> Result<(), BackhandError> {
        while !self.uncompressed_bytes.is_empty() {
            self.add_block()?;
        }
        Ok(())
    }

    /// Write all sealed blocks consecutively, returning the file offset at which
    /// each block's length-prefix began (the "second-level" index many tables need).
    #[instrument(skip_all)]
    pub fn finalize<W: Write + Seek>(&mut self, out: &mut W) -> Result<Vec<u64>, BackhandError> {
        self.flush_partial()?;
        let mut offsets = Vec::with_capacity(self.final_bytes.len());
        for (compressed, cb) in &self.final_bytes {
            offsets.push(out.stream_position()?);
            let len = cb.len() as u16 | if *compressed { 0 } else { METADATA_UNCOMPRESSED };
            out.write_all(&len.to_le_bytes())?;
            out.write_all(cb)?;
        }
        Ok(offsets)
    }
}

impl Write for MetadataWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.uncompressed_bytes.write_all(buf)?;
        while self.uncompressed_bytes.len() >= METADATA_MAXSIZE {
            self.add_block().map_err(io::Error::from)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read a single metadata block back, used only by the dedup read-back path and by
/// tooling that walks an already-built image (`sqfs2tar`, `sqfsinfo`).
#[instrument(skip_all)]
pub fn read_block<R: Read + ?Sized>(
    reader: &mut R,
    codec: &dyn Codec,
) -> Result<Vec<u8>, BackhandError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf)?;
    let raw_len = u16::from_le_bytes(len_buf);
    let compressed = is_compressed(raw_len);
    let byte_len = len(raw_len);

    let mut buf = vec![0u8; byte_len as usize];
    reader.read_exact(&mut buf)?;

    if compressed {
        let mut out = Vec::with_capacity(METADATA_MAXSIZE);
        codec.decompress(&buf, &mut out)?;
        Ok(out)
    } else {
        Ok(buf)
    }
}

pub fn is_compressed(len: u16) -> bool {
    len & METADATA_UNCOMPRESSED == 0
}

pub fn len(len: u16) -> u16 {
    len & !METADATA_UNCOMPRESSED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_roundtrip() {
        for (start, offset) in [(0u32, 0u16), (1, 0), (0, 8191), (0xabcdef, 1234)] {
            let packed = pack_ref(start, offset);
            assert_eq!(unpack_ref(packed), (start, offset));
        }
    }

    #[test]
    fn len_strips_uncompressed_bit() {
        assert!(is_compressed(100));
        assert!(!is_compressed(100 | METADATA_UNCOMPRESSED));
        assert_eq!(len(100 | METADATA_UNCOMPRESSED), 100);
        assert_eq!(len(100), 100);
    }
}
