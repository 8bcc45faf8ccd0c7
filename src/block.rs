//! Block writer: appends compressed/uncompressed data and fragment blocks to the
//! output file, returning the resulting file offset, with whole-block dedup by
//! fingerprint and byte-for-byte read-back verification.

use std::io::{Read, Seek, SeekFrom, Write};

use rustc_hash::FxHashMap;
use tracing::{instrument, trace, warn};

use crate::error::BackhandError;

/// A completed block ready to be appended, as produced by the block processor.
#[derive(Debug, Clone)]
pub struct CompletedBlock {
    pub bytes: Vec<u8>,
    pub compressed: bool,
    pub fingerprint: u64,
    /// Pad to the device block size before appending this block.
    pub align: bool,
}

struct WrittenBlock {
    offset: u64,
    size: u32,
}

/// Appends blocks to an output file that supports random reads (spec.md §6), tracking
/// previously-written `(fingerprint, size)` pairs for whole-block deduplication.
pub struct BlockWriter {
    device_block_size: u32,
    dedup: FxHashMap<(u64, u32), Vec<WrittenBlock>>,
    /// Set when a read-back comparison fails to decode; per spec.md §7 this is not
    /// fatal, we just skip dedup for that block and surface a warning.
    warning_sink: Option<Box<dyn Fn(BackhandError) + Send + Sync>>,
}

impl BlockWriter {
    pub fn new(
        device_block_size: u32,
        warning_sink: Option<Box<dyn Fn(BackhandError) + Send + Sync>>,
    ) -> Self {
        Self {
            device_block_size,
            dedup: FxHashMap::default(),
            warning_sink,
        }
    }

    /// Append `block` to `out`, returning the file offset at which its bytes begin.
    ///
    /// `dedup_eligible` is false for fragment blocks: spec.md §4.2 says fragment
    /// blocks bypass the dedup *lookup* but are still recorded so a later data block
    /// can collide against a fragment block's body.
    #[instrument(skip_all)]
    pub fn write_block<W: Read + Write + Seek>(
        &mut self,
        out: &mut W,
        block: &CompletedBlock,
        dedup_eligible: bool,
    ) -> Result<u64, BackhandError> {
        let key = (block.fingerprint, block.bytes.len() as u32);

        if dedup_eligible {
            if let Some(candidates) = self.dedup.get(&key) {
                for candidate in candidates {
                    match self.verify_candidate(out, candidate, &block.bytes) {
                        Ok(true) => {
                            trace!(offset = candidate.offset, "block dedup hit");
                            return Ok(candidate.offset);
                        }
                        Ok(false) => continue,
                        Err(e) => {
                            // format-corrupted read-back: assume no match, keep going
                            if let Some(sink) = &self.warning_sink {
                                sink(e);
                            } else {
                                warn!("dedup read-back failed, assuming no match");
                            }
                            continue;
                        }
                    }
                }
            }
        }

        if block.align {
            self.pad_to_device_block(out)?;
        }

        let offset = out.seek(SeekFrom::End(0))?;
        out.write_all(&block.bytes)?;

        self.dedup.entry(key).or_default().push(WrittenBlock {
            offset,
            size: block.bytes.len() as u32,
        });

        Ok(offset)
    }

    fn verify_candidate<W: Read + Seek>(
        &self,
        out: &mut W,
        candidate: &WrittenBlock,
        bytes: &[u8],
    ) -> Result<bool, BackhandError> {
        if candidate.size as usize != bytes.len() {
            return Ok(false);
        }
        let cur = out.stream_position()?;
        out.seek(SeekFrom::Start(candidate.offset))?;
        let mut existing = vec![0u8; bytes.len()];
        out.read_exact(&mut existing)?;
        out.seek(SeekFrom::Start(cur))?;
        Ok(existing == bytes)
    }

    fn pad_to_device_block<W: Write + Seek>(&self, out: &mut W) -> Result<(), BackhandError> {
        let pos = out.seek(SeekFrom::End(0))?;
        let remainder = pos % self.device_block_size as u64;
        if remainder != 0 {
            let pad = self.device_block_size as u64 - remainder;
            out.write_all(&vec![0u8; pad as usize])?;
        }
        Ok(())
    }
}

pub fn fingerprint(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

pub fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}
