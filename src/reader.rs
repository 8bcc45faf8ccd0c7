//! Reading an on-disk image back: table lookups and file-data assembly for
//! `sqfs2tar`/`sqfsinfo`. Shares [`crate::metadata::read_block`] with the writer's
//! dedup read-back path.

use std::io::{Cursor, Read, Seek, SeekFrom};

use deku::ctx::Endian;
use deku::prelude::*;
use deku::reader::Reader as DekuReader;
use tracing::instrument;

use crate::codec::{default_codec, Codec, CompressionOptions};
use crate::dir::Dir;
use crate::error::BackhandError;
use crate::fragment::{Fragment, NO_FRAGMENT};
use crate::inode::{DataSize, Inode};
use crate::metadata::{pack_ref, read_block, unpack_ref, METADATA_MAXSIZE};
use crate::superblock::{Flags, SuperBlock, NOT_SET};
use crate::xattr::{XattrEntry, XattrKey, XattrPrefix, NO_XATTR};

/// A directory entry resolved against its header: enough to recurse into the
/// child (`inode_ref`) without re-reading the parent header.
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: Vec<u8>,
    pub inode_number: u32,
    pub inode_type: u16,
    pub inode_ref: u64,
}

/// Walks metadata blocks as one continuous byte stream starting at a
/// `(block_start, offset)` ref, decompressing each block in turn as the cursor
/// runs past the end of the one before it. This is how squashfs inode and
/// directory records are meant to be read: a record may span a block boundary,
/// and the boundary itself carries no structural meaning.
struct MetadataCursor<'a, R: Read + Seek> {
    reader: &'a mut R,
    codec: &'a dyn Codec,
    buf: Vec<u8>,
    pos: usize,
    consumed: usize,
}

impl<'a, R: Read + Seek> MetadataCursor<'a, R> {
    fn new(
        reader: &'a mut R,
        codec: &'a dyn Codec,
        base: u64,
        start: u32,
        offset: u16,
    ) -> Result<Self, BackhandError> {
        reader.seek(SeekFrom::Start(base + start as u64))?;
        let buf = read_block(reader, codec)?;
        Ok(Self {
            reader,
            codec,
            buf,
            pos: offset as usize,
            consumed: 0,
        })
    }

    fn ensure(&mut self, n: usize) -> Result<(), BackhandError> {
        while self.buf.len() - self.pos < n {
            let mut next = read_block(self.reader, self.codec)?;
            self.buf.drain(..self.pos);
            self.pos = 0;
            self.buf.append(&mut next);
        }
        Ok(())
    }
}

impl<R: Read + Seek> Read for MetadataCursor<'_, R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        self.ensure(out.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        out.copy_from_slice(&self.buf[self.pos..self.pos + out.len()]);
        self.pos += out.len();
        self.consumed += out.len();
        Ok(out.len())
    }
}

/// Random access over an already-built image.
pub struct SqfsReader<R: Read + Seek> {
    reader: R,
    pub superblock: SuperBlock,
    codec: Box<dyn Codec>,
    ids: Vec<u32>,
    fragments: Vec<Fragment>,
}

impl<R: Read + Seek> SqfsReader<R> {
    #[instrument(skip_all)]
    pub fn open(mut reader: R) -> Result<Self, BackhandError> {
        reader.seek(SeekFrom::Start(0))?;
        let mut deku_reader = DekuReader::new(&mut reader);
        let superblock = SuperBlock::from_reader_with_ctx(&mut deku_reader, ())?;
        if superblock.magic != *b"hsqs" {
            return Err(BackhandError::CorruptedOrInvalidSquashfs);
        }

        let mut codec = default_codec(superblock.compressor)?;
        if superblock.flags().contains(Flags::COMPRESSOR_OPTIONS_PRESENT) {
            reader.seek(SeekFrom::Start(SuperBlock::SIZE as u64))?;
            let opt_bytes = read_block(&mut reader, codec.as_ref())?;
            let mut cursor = Cursor::new(opt_bytes);
            let mut opt_reader = DekuReader::new(&mut cursor);
            let options = CompressionOptions::from_reader_with_ctx(
                &mut opt_reader,
                (Endian::Little, superblock.compressor),
            )?;
            codec.configure(Some(options))?;
        }

        let ids = read_indexed_table(
            &mut reader,
            codec.as_ref(),
            superblock.id_table,
            superblock.id_count as usize,
            4,
            |chunk| Ok(u32::from_le_bytes(chunk.try_into().unwrap())),
        )?;

        let fragments = read_indexed_table(
            &mut reader,
            codec.as_ref(),
            superblock.frag_table,
            superblock.frag_count as usize,
            crate::fragment::FRAGMENT_SIZE,
            |chunk| {
                Ok(Fragment {
                    start: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                    size: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                    unused: u32::from_le_bytes(chunk[12..16].try_into().unwrap()),
                })
            },
        )?;

        Ok(Self {
            reader,
            superblock,
            codec,
            ids,
            fragments,
        })
    }

    pub fn lookup_id(&self, index: u16) -> u32 {
        self.ids.get(index as usize).copied().unwrap_or(0)
    }

    /// Read a single inode by its packed `(block_start, offset)` ref into the
    /// inode table.
    #[instrument(skip(self))]
    pub fn read_inode(&mut self, inode_ref: u64) -> Result<Inode, BackhandError> {
        let (start, offset) = unpack_ref(inode_ref);
        let block_size = self.superblock.block_size;
        let block_log = self.superblock.block_log;
        let base = self.superblock.inode_table;
        let mut cursor =
            MetadataCursor::new(&mut self.reader, self.codec.as_ref(), base, start, offset)?;
        let mut deku_reader = DekuReader::new(&mut cursor);
        Inode::from_reader_with_ctx(&mut deku_reader, (block_size, block_log)).map_err(Into::into)
    }

    pub fn read_root(&mut self) -> Result<Inode, BackhandError> {
        self.read_inode(self.superblock.root_inode)
    }

    /// Read every entry of a directory, given the `(block_index, block_offset,
    /// file_size)` triple from its `BasicDirectory`/`ExtendedDirectory` inode.
    #[instrument(skip(self))]
    pub fn read_dir(
        &mut self,
        block_index: u32,
        block_offset: u16,
        file_size: u32,
    ) -> Result<Vec<Entry>, BackhandError> {
        // An empty directory's `file_size` covers only the (absent) header,
        // nothing to decode.
        if file_size == 0 {
            return Ok(Vec::new());
        }

        let base = self.superblock.dir_table;
        let mut cursor = MetadataCursor::new(
            &mut self.reader,
            self.codec.as_ref(),
            base,
            block_index,
            block_offset,
        )?;
        let mut entries = Vec::new();
        while cursor.consumed < file_size as usize {
            let mut deku_reader = DekuReader::new(&mut cursor);
            let dir = Dir::from_reader_with_ctx(&mut deku_reader, ())?;
            for e in &dir.dir_entries {
                let inode_number = (dir.inode_num as i64 + e.inode_offset as i64) as u32;
                entries.push(Entry {
                    name: e.name.clone(),
                    inode_number,
                    inode_type: e.t,
                    inode_ref: pack_ref(dir.start, e.offset),
                });
            }
        }
        Ok(entries)
    }

    /// Assemble a regular file's full contents from its block list and, if
    /// present, its fragment tail.
    #[instrument(skip(self, block_sizes))]
    pub fn read_file_data(
        &mut self,
        blocks_start: u64,
        block_offset: u32,
        frag_index: u32,
        file_size: u64,
        block_sizes: &[DataSize],
    ) -> Result<Vec<u8>, BackhandError> {
        let block_size = self.superblock.block_size as u64;
        let mut out = Vec::with_capacity(file_size as usize);
        let mut pos = blocks_start;

        for ds in block_sizes {
            if ds.is_sparse() {
                out.resize(out.len() + block_size as usize, 0);
                continue;
            }
            let len = ds.size() as usize;
            self.reader.seek(SeekFrom::Start(pos))?;
            let mut raw = vec![0u8; len];
            self.reader.read_exact(&mut raw)?;
            pos += len as u64;
            if ds.is_compressed() {
                self.codec.decompress(&raw, &mut out)?;
            } else {
                out.extend_from_slice(&raw);
            }
        }

        if frag_index != NO_FRAGMENT {
            let frag = *self
                .fragments
                .get(frag_index as usize)
                .ok_or(BackhandError::OutOfBounds("fragment index"))?;
            const UNCOMPRESSED_SIZE_BIT: u32 = 1 << 24;
            self.reader.seek(SeekFrom::Start(frag.start))?;
            let on_disk_size = (frag.size & !UNCOMPRESSED_SIZE_BIT) as usize;
            let mut raw = vec![0u8; on_disk_size];
            self.reader.read_exact(&mut raw)?;
            let decompressed = if frag.size & UNCOMPRESSED_SIZE_BIT != 0 {
                raw
            } else {
                let mut buf = Vec::new();
                self.codec.decompress(&raw, &mut buf)?;
                buf
            };
            let tail_len = (file_size - out.len() as u64) as usize;
            let start = block_offset as usize;
            out.extend_from_slice(
                decompressed
                    .get(start..start + tail_len)
                    .ok_or(BackhandError::CorruptedOrInvalidSquashfs)?,
            );
        }

        out.truncate(file_size as usize);
        Ok(out)
    }

    /// Look up xattr set `index`, or an empty set for [`NO_XATTR`].
    #[instrument(skip(self))]
    pub fn read_xattrs(&mut self, index: u32) -> Result<Vec<XattrEntry>, BackhandError> {
        if index == NO_XATTR || self.superblock.xattr_table == NOT_SET {
            return Ok(Vec::new());
        }

        self.reader
            .seek(SeekFrom::Start(self.superblock.xattr_table))?;
        let mut header = [0u8; 24];
        self.reader.read_exact(&mut header)?;
        let kv_start = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let value_start = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let ids_count = u32::from_le_bytes(header[16..20].try_into().unwrap());
        if index >= ids_count {
            return Err(BackhandError::OutOfBounds("xattr index"));
        }

        const RECORD_SIZE: usize = 16; // kv_ref: u64, count: u32, size: u32
        let id_index_base = self.superblock.xattr_table + 24;
        let block_num = (index as usize * RECORD_SIZE) / METADATA_MAXSIZE;
        let intra_offset = (index as usize * RECORD_SIZE) % METADATA_MAXSIZE;

        self.reader
            .seek(SeekFrom::Start(id_index_base + block_num as u64 * 8))?;
        let mut offset_buf = [0u8; 8];
        self.reader.read_exact(&mut offset_buf)?;
        let id_block_offset = u64::from_le_bytes(offset_buf);

        self.reader.seek(SeekFrom::Start(id_block_offset))?;
        let id_block = read_block(&mut self.reader, self.codec.as_ref())?;
        let record = &id_block[intra_offset..intra_offset + RECORD_SIZE];
        let kv_ref = u64::from_le_bytes(record[0..8].try_into().unwrap());
        let count = u32::from_le_bytes(record[8..12].try_into().unwrap());

        // Read the whole entry-stream region for this set up front (its exact byte
        // length is the id record's `size` field), then parse it as plain bytes —
        // any out-of-line value ref is resolved with its own short-lived cursor
        // afterward, so only one cursor into the underlying reader is ever open
        // at a time.
        let size = u32::from_le_bytes(record[12..16].try_into().unwrap()) as usize;
        let (kv_block_start, kv_offset) = unpack_ref(kv_ref);
        let raw = {
            let mut cursor = MetadataCursor::new(
                &mut self.reader,
                self.codec.as_ref(),
                kv_start,
                kv_block_start,
                kv_offset,
            )?;
            let mut buf = vec![0u8; size];
            cursor.read_exact(&mut buf)?;
            buf
        };

        let mut pos = 0usize;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let prefix = match u16::from_le_bytes(raw[pos..pos + 2].try_into().unwrap()) {
                0 => XattrPrefix::User,
                1 => XattrPrefix::Trusted,
                _ => XattrPrefix::Security,
            };
            pos += 2;
            let name_len = u16::from_le_bytes(raw[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            let name = raw[pos..pos + name_len].to_vec();
            pos += name_len;

            let tag = raw[pos];
            pos += 1;
            let value = if tag == 1 {
                let vref = u64::from_le_bytes(raw[pos..pos + 8].try_into().unwrap());
                pos += 8;
                self.read_value_at(value_start, vref)?
            } else {
                let len = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                let value = raw[pos..pos + len].to_vec();
                pos += len;
                value
            };

            entries.push(XattrEntry {
                key: XattrKey { prefix, name },
                value,
            });
        }
        Ok(entries)
    }

    fn read_value_at(&mut self, value_base: u64, vref: u64) -> Result<Vec<u8>, BackhandError> {
        let (start, offset) = unpack_ref(vref);
        let mut cursor =
            MetadataCursor::new(&mut self.reader, self.codec.as_ref(), value_base, start, offset)?;
        let mut len_buf = [0u8; 4];
        cursor.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut value = vec![0u8; len];
        cursor.read_exact(&mut value)?;
        Ok(value)
    }
}

/// Read a two-level indexed table (id/fragment/export): a list of `u64` file
/// offsets to metadata blocks at `index_at`, each holding `entry_count` fixed-size
/// records packed end to end across blocks.
fn read_indexed_table<R: Read + Seek, T>(
    reader: &mut R,
    codec: &dyn Codec,
    index_at: u64,
    entry_count: usize,
    entry_size: usize,
    mut parse_entry: impl FnMut(&[u8]) -> Result<T, BackhandError>,
) -> Result<Vec<T>, BackhandError> {
    if entry_count == 0 || index_at == NOT_SET {
        return Ok(Vec::new());
    }
    let total_bytes = entry_count * entry_size;
    let num_blocks = total_bytes.div_ceil(METADATA_MAXSIZE);

    reader.seek(SeekFrom::Start(index_at))?;
    let mut block_offsets = Vec::with_capacity(num_blocks);
    for _ in 0..num_blocks {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        block_offsets.push(u64::from_le_bytes(buf));
    }

    let mut out = Vec::with_capacity(entry_count);
    for offset in block_offsets {
        reader.seek(SeekFrom::Start(offset))?;
        let data = read_block(reader, codec)?;
        for chunk in data.chunks(entry_size) {
            if out.len() >= entry_count {
                break;
            }
            out.push(parse_entry(chunk)?);
        }
    }
    Ok(out)
}

/// Read every entry in a tree rooted at the image's root inode, yielding
/// `(absolute path, inode)` pairs in the same order `sqfs2tar`/`sqfsinfo` want
/// them: a directory's own entry first, then its children depth-first.
pub struct TreeWalker<'a, R: Read + Seek> {
    reader: &'a mut SqfsReader<R>,
    stack: Vec<(std::path::PathBuf, Inode)>,
}

impl<'a, R: Read + Seek> TreeWalker<'a, R> {
    /// Reborrow the underlying reader, e.g. to resolve file data or xattrs for a
    /// node just yielded by [`Self::next_node`].
    pub fn reader_mut(&mut self) -> &mut SqfsReader<R> {
        self.reader
    }

    pub fn new(reader: &'a mut SqfsReader<R>) -> Result<Self, BackhandError> {
        let root = reader.read_root()?;
        Ok(Self {
            reader,
            stack: vec![(std::path::PathBuf::from("/"), root)],
        })
    }

    pub fn next_node(&mut self) -> Result<Option<(std::path::PathBuf, Inode)>, BackhandError> {
        let Some((path, inode)) = self.stack.pop() else {
            return Ok(None);
        };

        if let crate::inode::InodeInner::BasicDirectory(dir) = &inode.inner {
            let entries = self
                .reader
                .read_dir(dir.block_index, dir.block_offset, dir.file_size as u32)?;
            for entry in entries.into_iter().rev() {
                let child_inode = self.reader.read_inode(entry.inode_ref)?;
                self.stack
                    .push((path.join(String::from_utf8_lossy(&entry.name).into_owned()), child_inode));
            }
        } else if let crate::inode::InodeInner::ExtendedDirectory(dir) = &inode.inner {
            let entries = self
                .reader
                .read_dir(dir.block_index, dir.block_offset, dir.file_size)?;
            for entry in entries.into_iter().rev() {
                let child_inode = self.reader.read_inode(entry.inode_ref)?;
                self.stack
                    .push((path.join(String::from_utf8_lossy(&entry.name).into_owned()), child_inode));
            }
        }

        Ok(Some((path, inode)))
    }
}
