//! Top-level image writer: orchestrates every table writer into one on-disk image.
//!
//! Construction order mirrors the on-disk layout: superblock placeholder,
//! compressor options, file data + fragments (streamed through the [`Pipeline`]),
//! inode table, directory table, fragment table, export table, id table, xattr
//! tables, then the superblock is rewritten in place with the final offsets.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom, Write};

use deku::ctx::Endian;
use deku::prelude::*;
use deku::writer::Writer;
use deku::DekuContainerWrite;
use tracing::{info, instrument};

use crate::block::{BlockWriter, CompletedBlock};
use crate::codec::{default_codec, Codec, CompressionOptions, Compressor};
use crate::dir::{Dir, DirEntry, DIR_ENTRIES_PER_HEADER};
use crate::error::BackhandError;
use crate::export::ExportTable;
use crate::fragment::{FragmentTable, NO_FRAGMENT};
use crate::id::IdTable;
use crate::inode::{
    BasicDeviceSpecialFile, BasicDirectory, BasicFile, BasicIpc, BasicSymlink, DataSize,
    ExtendedDeviceSpecialFile, ExtendedDirectory, ExtendedFile, ExtendedIpc, ExtendedSymlink,
    Inode, InodeHeader, InodeId, InodeInner,
};
use crate::metadata::{pack_ref, MetadataWriter};
use crate::pipeline::{BlockFlags, Pipeline};
use crate::superblock::{Flags, SuperBlock};
use crate::tree::{FileSource, NodeHeader, NodeId as TreeNodeId, NodeKind, Tree};
use crate::xattr::{XattrEntry, XattrWriter, NO_XATTR};

/// Every builder-tunable knob, mirroring what `gensquashfs`/`tar2sqfs`/`mksquashfs`
/// expose as CLI flags.
pub struct WriterConfig {
    pub block_size: u32,
    pub device_block_size: u32,
    pub compressor: Compressor,
    pub compression_options: Option<CompressionOptions>,
    pub workers: usize,
    pub exportable: bool,
    pub no_xattrs: bool,
    pub default_mtime: u32,
    /// Called with non-fatal warnings (a dedup read-back that couldn't be decoded,
    /// for instance) instead of the default `tracing::warn!`.
    pub warning_sink: Option<Box<dyn Fn(BackhandError) + Send + Sync>>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            block_size: 128 * 1024,
            device_block_size: 4096,
            compressor: Compressor::Xz,
            compression_options: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            exportable: false,
            no_xattrs: false,
            default_mtime: 0,
            warning_sink: None,
        }
    }
}

impl WriterConfig {
    /// Apply `SOURCE_DATE_EPOCH` (https://reproducible-builds.org/specs/source-date-epoch/)
    /// as the default mtime, if set and parseable, for reproducible images.
    pub fn with_source_date_epoch_env(mut self) -> Self {
        if let Ok(value) = std::env::var("SOURCE_DATE_EPOCH") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.default_mtime = parsed;
            }
        }
        self
    }
}

struct WrittenNode {
    start: u32,
    offset: u16,
    inode_number: u32,
    type_id: InodeId,
}

/// A regular file whose blocks have all been submitted to the [`Pipeline`] but may
/// still be in flight. Kept in a FIFO alongside every other in-flight file: since
/// files are submitted to the pipeline strictly in order, the file at the front of
/// the queue always owns the next sequence number the pipeline hands back.
struct PendingFile {
    id: TreeNodeId,
    link_count: u32,
    xattr_index: u32,
    file_size: u64,
    block_sizes: Vec<DataSize>,
    offsets: Vec<Option<u64>>,
    seq_to_idx: HashMap<u64, usize>,
    remaining: usize,
    frag_index: u32,
    block_offset: u32,
}

pub struct SqfsWriter<W: Read + Write + Seek> {
    out: W,
    config: WriterConfig,
    codec: Box<dyn Codec>,
    block_writer: BlockWriter,
    fragment_table: FragmentTable,
    id_table: IdTable,
    xattr_writer: XattrWriter,
    pipeline: Pipeline,
    inode_meta: MetadataWriter,
    dir_meta: MetadataWriter,
    tree: Tree,
}

impl<W: Read + Write + Seek> SqfsWriter<W> {
    #[instrument(skip_all)]
    pub fn new(mut out: W, mut config: WriterConfig, tree: Tree) -> Result<Self, BackhandError> {
        let mut codec = default_codec(config.compressor)?;
        codec.configure(config.compression_options)?;

        out.seek(SeekFrom::Start(SuperBlock::SIZE as u64))?;
        if let Some(opts) = codec.write_options() {
            let mut opt_bytes = Writer::new(Vec::new());
            opts.to_writer(&mut opt_bytes, (Endian::Little, config.compressor))?;
            let mut meta = MetadataWriter::new(codec.clone_box());
            meta.write_all(&opt_bytes.inner)?;
            meta.finalize(&mut out)?;
        }

        let warning_sink = config.warning_sink.take();
        let pipeline = Pipeline::new(codec.clone_box(), config.workers)?;

        Ok(Self {
            block_writer: BlockWriter::new(config.device_block_size, warning_sink),
            fragment_table: FragmentTable::new(config.block_size),
            id_table: IdTable::new(),
            xattr_writer: XattrWriter::new(codec.clone_box()),
            inode_meta: MetadataWriter::new(codec.clone_box()),
            dir_meta: MetadataWriter::new(codec.clone_box()),
            pipeline,
            codec,
            out,
            config,
            tree,
        })
    }

    /// Attach an xattr set to a node, returning the index to store as its
    /// `xattr_index`. Call before [`SqfsWriter::finish`].
    pub fn add_xattrs(
        &mut self,
        entries: Vec<XattrEntry>,
    ) -> Result<u32, BackhandError> {
        if self.config.no_xattrs {
            return Ok(NO_XATTR);
        }
        self.xattr_writer.add_set(entries)
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Walk the tree, write every table, patch the superblock, and return the
    /// underlying output handle.
    #[instrument(skip_all)]
    pub fn finish(mut self) -> Result<W, BackhandError> {
        let block_log = self.config.block_size.trailing_zeros() as u16;
        let processed = self.tree.post_process()?;

        let mut link_counts: HashMap<TreeNodeId, u32> = HashMap::new();
        for id in 0..self.tree.len() {
            if let NodeKind::HardLink {
                resolved: Some(target),
                ..
            } = &self.tree.node(id).kind
            {
                *link_counts.entry(*target).or_insert(1) += 1;
            }
        }

        let mut written: HashMap<TreeNodeId, WrittenNode> = HashMap::new();
        let mut export_table = self
            .config
            .exportable
            .then(|| ExportTable::new(processed.inode_count));

        // Pass 1a: every leaf that isn't a regular file writes its inode immediately;
        // none of these touch the block pipeline.
        let other_leaf_ids: Vec<TreeNodeId> = (0..self.tree.len())
            .filter(|&id| {
                !matches!(
                    self.tree.node(id).kind,
                    NodeKind::Directory { .. } | NodeKind::HardLink { .. } | NodeKind::File { .. }
                )
            })
            .collect();
        for id in other_leaf_ids {
            let link_count = link_counts.get(&id).copied().unwrap_or(1);
            let w = self.write_leaf(id, link_count, block_log)?;
            if let Some(table) = export_table.as_mut() {
                table.set(w.inode_number, pack_ref(w.start, w.offset))?;
            }
            written.insert(id, w);
        }

        // Pass 1b: regular files, streamed through the block pipeline in the order
        // `Tree::post_process` assigned. Each file's bytes are read and submitted in
        // fixed-size chunks rather than buffered whole, and a file is only finalized
        // once its blocks drain back out; submitting the next file doesn't wait on
        // that, so compressing file N and reading/submitting file N+1 overlap.
        let mut pending: VecDeque<PendingFile> = VecDeque::new();
        for id in processed.file_order {
            let link_count = link_counts.get(&id).copied().unwrap_or(1);
            let xattr_index = self.tree.node(id).xattr_index.unwrap_or(NO_XATTR);
            let source = match &self.tree.node(id).kind {
                NodeKind::File { source } => source.open()?,
                _ => return Err(BackhandError::Unreachable),
            };
            let pf = self.begin_file_leaf(id, link_count, xattr_index, source)?;
            pending.push_back(pf);
            self.drain_ready(&mut pending, &mut written, export_table.as_mut(), block_log)?;
        }
        self.drain_all(&mut pending, &mut written, export_table.as_mut(), block_log)?;

        // Pass 2: directories bottom-up (post-order), now that every child's
        // inode reference is known.
        self.write_directory_subtree(self.tree.root(), &mut written, block_log)?;
        let root_written = &written[&self.tree.root()];
        let root_inode_ref = pack_ref(root_written.start, root_written.offset);
        if let Some(table) = export_table.as_mut() {
            table.set(root_written.inode_number, root_inode_ref)?;
        }

        self.fragment_table
            .finalize_current(&mut self.out, &mut self.block_writer, self.codec.as_ref())?;

        let mut sb = SuperBlock::new(self.config.compressor, self.config.block_size);
        sb.inode_count = processed.inode_count;
        sb.mod_time = self.config.default_mtime;
        sb.root_inode = root_inode_ref;
        sb.set_flag(Flags::NFS_EXPORT_TABLE_EXISTS, self.config.exportable);
        sb.set_flag(Flags::NO_XATTRS, self.xattr_writer.is_empty());
        sb.set_flag(
            Flags::COMPRESSOR_OPTIONS_PRESENT,
            self.codec.write_options().is_some(),
        );

        let inode_table_start = self.out.stream_position()?;
        self.inode_meta.finalize(&mut self.out)?;
        sb.inode_table = inode_table_start;

        let dir_table_start = self.out.stream_position()?;
        self.dir_meta.finalize(&mut self.out)?;
        sb.dir_table = dir_table_start;

        if !self.fragment_table.is_empty() {
            sb.frag_table = self
                .fragment_table
                .write_table(&mut self.out, self.codec.as_ref())?;
        }
        sb.frag_count = self.fragment_table.len() as u32;

        if let Some(table) = export_table {
            sb.export_table = table.write_table(&mut self.out, self.codec.as_ref())?;
        }

        sb.id_table = self.id_table.write_table(&mut self.out, self.codec.as_ref())?;
        sb.id_count = self.id_table.len() as u16;

        if !self.xattr_writer.is_empty() {
            sb.xattr_table = self.xattr_writer.write_table(&mut self.out)?;
        }

        sb.bytes_used = self.out.stream_position()?;
        self.pad_to_device_block()?;

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&sb.to_bytes()?)?;

        info!(
            inodes = sb.inode_count,
            bytes = sb.bytes_used,
            "squashfs image written"
        );
        Ok(self.out)
    }

    fn pad_to_device_block(&mut self) -> Result<(), BackhandError> {
        let pos = self.out.seek(SeekFrom::End(0))?;
        let remainder = pos % self.config.device_block_size as u64;
        if remainder != 0 {
            let pad = self.config.device_block_size as u64 - remainder;
            self.out.write_all(&vec![0u8; pad as usize])?;
        }
        Ok(())
    }

    fn header_for(&mut self, header: NodeHeader, inode_number: u32) -> Result<InodeHeader, BackhandError> {
        let uid = self.id_table.lookup_add(header.uid)?;
        let gid = self.id_table.lookup_add(header.gid)?;
        Ok(InodeHeader {
            permissions: header.permissions,
            uid,
            gid,
            mtime: header.mtime,
            inode_number,
        })
    }

    /// Write the inode for any leaf node that isn't a regular file (those go through
    /// [`SqfsWriter::begin_file_leaf`]/the pipeline instead).
    #[instrument(skip(self, link_count))]
    fn write_leaf(
        &mut self,
        id: TreeNodeId,
        link_count: u32,
        block_log: u16,
    ) -> Result<WrittenNode, BackhandError> {
        let node_header = self.tree.node(id).header;
        let xattr_index = self.tree.node(id).xattr_index.unwrap_or(NO_XATTR);
        let inode_number = self.tree.node(id).inode_number;
        let header = self.header_for(node_header, inode_number)?;

        let (type_id, inner) = match &self.tree.node(id).kind {
            NodeKind::Symlink { target } => {
                let target = target.clone();
                if xattr_index == NO_XATTR {
                    (
                        InodeId::BasicSymlink,
                        InodeInner::BasicSymlink(BasicSymlink {
                            link_count,
                            target_size: target.len() as u32,
                            target_path: target,
                        }),
                    )
                } else {
                    (
                        InodeId::ExtendedSymlink,
                        InodeInner::ExtendedSymlink(ExtendedSymlink {
                            link_count,
                            target_size: target.len() as u32,
                            target_path: target,
                            xattr_index,
                        }),
                    )
                }
            }
            NodeKind::BlockDevice { device_number } => device_inode(
                InodeId::BasicBlockDevice,
                InodeId::ExtendedBlockDevice,
                *device_number,
                link_count,
                xattr_index,
            ),
            NodeKind::CharDevice { device_number } => device_inode(
                InodeId::BasicCharacterDevice,
                InodeId::ExtendedCharDevice,
                *device_number,
                link_count,
                xattr_index,
            ),
            NodeKind::Fifo => {
                ipc_inode(InodeId::BasicFifo, InodeId::ExtendedFifo, link_count, xattr_index)
            }
            NodeKind::Socket => {
                ipc_inode(InodeId::BasicSocket, InodeId::ExtendedSocket, link_count, xattr_index)
            }
            NodeKind::File { .. } | NodeKind::Directory { .. } | NodeKind::HardLink { .. } => {
                return Err(BackhandError::Unreachable)
            }
        };

        let inode = Inode {
            id: type_id,
            header,
            inner,
        };
        let (start, offset) = inode.write(&mut self.inode_meta, self.config.block_size, block_log)?;
        Ok(WrittenNode {
            start,
            offset,
            inode_number,
            type_id,
        })
    }

    /// Stream a regular file's bytes through the pipeline's per-file assembly buffer:
    /// reads happen in fixed `block_size` chunks so at most one block's worth of the
    /// file is ever held in memory, and each full chunk is submitted for compression
    /// as soon as it's read rather than waiting on the whole file.
    fn begin_file_leaf(
        &mut self,
        id: TreeNodeId,
        link_count: u32,
        xattr_index: u32,
        mut source: Box<dyn Read>,
    ) -> Result<PendingFile, BackhandError> {
        let block_size = self.config.block_size as usize;
        let flags = BlockFlags::empty();
        let mut assembly = self.pipeline.begin_file(flags);
        let mut file_size: u64 = 0;
        let mut buf = vec![0u8; block_size];
        loop {
            let n = read_fill(source.as_mut(), &mut buf)?;
            if n == 0 {
                break;
            }
            file_size += n as u64;
            self.pipeline.append(&mut assembly, &buf[..n], block_size)?;
        }
        let ended = self.pipeline.end_file(assembly);

        let mut block_sizes = vec![DataSize::sparse(); ended.sequences.len()];
        let mut seq_to_idx: HashMap<u64, usize> = HashMap::new();
        let mut remaining = 0usize;
        for (idx, seq) in ended.sequences.iter().enumerate() {
            if let Some(seq) = seq {
                seq_to_idx.insert(*seq, idx);
                remaining += 1;
            }
        }

        let dont_fragment = ended.flags.contains(BlockFlags::DONT_FRAGMENT);
        let tail_empty = ended.tail.is_empty();
        let (frag_index, block_offset) = if tail_empty {
            (NO_FRAGMENT, 0)
        } else if dont_fragment {
            let idx = block_sizes.len();
            block_sizes.push(DataSize::sparse());
            let seq = self.pipeline.submit_block(ended.tail, ended.flags)?;
            seq_to_idx.insert(seq, idx);
            remaining += 1;
            (NO_FRAGMENT, 0)
        } else {
            let loc = self.fragment_table.add_tail(
                &ended.tail,
                &mut self.out,
                &mut self.block_writer,
                self.codec.as_ref(),
            )?;
            (loc.frag_index, loc.frag_offset)
        };

        Ok(PendingFile {
            id,
            link_count,
            xattr_index,
            file_size,
            offsets: vec![None; block_sizes.len()],
            block_sizes,
            seq_to_idx,
            remaining,
            frag_index,
            block_offset,
        })
    }

    /// Drain whatever block completions are immediately available, without blocking.
    /// Called after every file is submitted so the in-flight `pending` queue doesn't
    /// grow without bound while later files are still being read and submitted.
    fn drain_ready(
        &mut self,
        pending: &mut VecDeque<PendingFile>,
        written: &mut HashMap<TreeNodeId, WrittenNode>,
        mut export_table: Option<&mut ExportTable>,
        block_log: u16,
    ) -> Result<(), BackhandError> {
        while let Some(result) = self.pipeline.try_next_completed() {
            self.route_completed(result?, pending, written, export_table.as_deref_mut(), block_log)?;
        }
        Ok(())
    }

    /// Block until every still-pending file has had all of its blocks drained and its
    /// inode finalized.
    fn drain_all(
        &mut self,
        pending: &mut VecDeque<PendingFile>,
        written: &mut HashMap<TreeNodeId, WrittenNode>,
        mut export_table: Option<&mut ExportTable>,
        block_log: u16,
    ) -> Result<(), BackhandError> {
        while !pending.is_empty() {
            let result = self
                .pipeline
                .next_completed()
                .ok_or(BackhandError::Unreachable)?;
            self.route_completed(result?, pending, written, export_table.as_deref_mut(), block_log)?;
        }
        Ok(())
    }

    /// Write one completed block to the image and credit it to whichever pending
    /// file it belongs to. Sequence numbers are assigned to files strictly in
    /// submission order, so the file at the front of `pending` always owns the next
    /// sequence the pipeline hands back.
    fn route_completed(
        &mut self,
        (seq, block): (u64, CompletedBlock),
        pending: &mut VecDeque<PendingFile>,
        written: &mut HashMap<TreeNodeId, WrittenNode>,
        export_table: Option<&mut ExportTable>,
        block_log: u16,
    ) -> Result<(), BackhandError> {
        let front = pending.front_mut().ok_or(BackhandError::Unreachable)?;
        let idx = *front
            .seq_to_idx
            .get(&seq)
            .ok_or(BackhandError::Unreachable)?;
        let offset = self.block_writer.write_block(&mut self.out, &block, true)?;
        front.offsets[idx] = Some(offset);
        front.block_sizes[idx] = if block.compressed {
            DataSize::compressed(block.bytes.len() as u32)
        } else {
            DataSize::uncompressed(block.bytes.len() as u32)
        };
        front.remaining -= 1;

        if front.remaining == 0 {
            let pf = pending.pop_front().unwrap();
            let id = pf.id;
            let w = self.finalize_pending_file(pf, block_log)?;
            if let Some(table) = export_table {
                table.set(w.inode_number, pack_ref(w.start, w.offset))?;
            }
            written.insert(id, w);
        }
        Ok(())
    }

    fn finalize_pending_file(
        &mut self,
        pf: PendingFile,
        block_log: u16,
    ) -> Result<WrittenNode, BackhandError> {
        let node_header = self.tree.node(pf.id).header;
        let inode_number = self.tree.node(pf.id).inode_number;
        let header = self.header_for(node_header, inode_number)?;

        let blocks_start = pf.offsets.iter().flatten().copied().next().unwrap_or(0);
        let use_extended = pf.file_size > u32::MAX as u64
            || blocks_start > u32::MAX as u64
            || pf.xattr_index != NO_XATTR;

        let (type_id, inner) = if use_extended {
            (
                InodeId::ExtendedFile,
                InodeInner::ExtendedFile(ExtendedFile {
                    blocks_start,
                    file_size: pf.file_size,
                    sparse: 0,
                    link_count: pf.link_count,
                    frag_index: pf.frag_index,
                    block_offset: pf.block_offset,
                    xattr_index: pf.xattr_index,
                    block_sizes: pf.block_sizes,
                }),
            )
        } else {
            (
                InodeId::BasicFile,
                InodeInner::BasicFile(BasicFile {
                    blocks_start: blocks_start as u32,
                    frag_index: pf.frag_index,
                    block_offset: pf.block_offset,
                    file_size: pf.file_size as u32,
                    block_sizes: pf.block_sizes,
                }),
            )
        };

        let inode = Inode {
            id: type_id,
            header,
            inner,
        };
        let (start, offset) =
            inode.write(&mut self.inode_meta, self.config.block_size, block_log)?;
        Ok(WrittenNode {
            start,
            offset,
            inode_number,
            type_id,
        })
    }

    fn write_directory_subtree(
        &mut self,
        id: TreeNodeId,
        written: &mut HashMap<TreeNodeId, WrittenNode>,
        block_log: u16,
    ) -> Result<(), BackhandError> {
        let children = self.tree.children(id);
        for (_, child) in &children {
            if matches!(self.tree.node(*child).kind, NodeKind::Directory { .. }) {
                self.write_directory_subtree(*child, written, block_log)?;
            }
        }

        let parent_inode_number = match self.tree.node(id).parent {
            Some(parent) => written
                .get(&parent)
                .map(|w| w.inode_number)
                .unwrap_or(self.tree.node(id).inode_number),
            None => self.tree.node(id).inode_number,
        };

        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in &children {
            let canonical = self.tree.canonical(*child);
            let w = written
                .get(&canonical)
                .ok_or(BackhandError::UnexpectedInode)?;
            entries.push((name.clone(), w.start, w.offset, w.inode_number, w.type_id.basic_type()));
        }

        let dir_start_pos = self.dir_meta.position();
        let mut total_bytes = 0u32;
        for header_group in batch_dir_entries(&entries) {
            let header_inode_num = header_group[0].3;
            let start = header_group[0].1;
            let dir_entries: Vec<DirEntry> = header_group
                .iter()
                .map(|(name, _, offset, inode_number, t)| DirEntry {
                    offset: *offset,
                    inode_offset: (*inode_number as i64 - header_inode_num as i64) as i16,
                    t: *t,
                    name_size: name.len() as u16 - 1,
                    name: name.clone(),
                })
                .collect();
            let dir = Dir {
                count: dir_entries.len() as u32 - 1,
                start,
                inode_num: header_inode_num,
                dir_entries,
            };
            let mut w = Writer::new(Vec::new());
            dir.to_writer(&mut w, ())?;
            total_bytes += w.inner.len() as u32;
            self.dir_meta.write_all(&w.inner)?;
        }

        let node_header = self.tree.node(id).header;
        let xattr_index = self.tree.node(id).xattr_index.unwrap_or(NO_XATTR);
        let inode_number = self.tree.node(id).inode_number;
        // A directory's link count is 2 (itself, plus its own "." entry) plus one
        // ".." for every child subdirectory. Directories can't be hard-linked, so
        // `link_counts` (built from `NodeKind::HardLink` targets) doesn't apply here.
        let child_dir_count = children
            .iter()
            .filter(|(_, child)| matches!(self.tree.node(*child).kind, NodeKind::Directory { .. }))
            .count() as u32;
        let link_count = 2 + child_dir_count;
        let header = self.header_for(node_header, inode_number)?;

        let (type_id, inner) = if total_bytes <= u16::MAX as u32 && xattr_index == NO_XATTR {
            (
                InodeId::BasicDirectory,
                InodeInner::BasicDirectory(BasicDirectory {
                    block_index: dir_start_pos.0,
                    link_count,
                    file_size: total_bytes as u16,
                    block_offset: dir_start_pos.1,
                    parent_inode: parent_inode_number,
                }),
            )
        } else {
            (
                InodeId::ExtendedDirectory,
                InodeInner::ExtendedDirectory(ExtendedDirectory {
                    link_count,
                    file_size: total_bytes,
                    block_index: dir_start_pos.0,
                    parent_inode: parent_inode_number,
                    index_count: 0,
                    block_offset: dir_start_pos.1,
                    xattr_index,
                    dir_index: Vec::new(),
                }),
            )
        };

        let inode = Inode {
            id: type_id,
            header,
            inner,
        };
        let (start, offset) =
            inode.write(&mut self.inode_meta, self.config.block_size, block_log)?;
        written.insert(
            id,
            WrittenNode {
                start,
                offset,
                inode_number,
                type_id,
            },
        );
        Ok(())
    }
}

/// Fill `buf` as far as possible from `source`, returning the number of bytes read
/// (less than `buf.len()` only at EOF).
fn read_fill(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize, BackhandError> {
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

fn device_inode(
    basic: InodeId,
    extended: InodeId,
    device_number: u32,
    link_count: u32,
    xattr_index: u32,
) -> (InodeId, InodeInner) {
    if xattr_index == NO_XATTR {
        let body = BasicDeviceSpecialFile {
            link_count,
            device_number,
        };
        let inner = match basic {
            InodeId::BasicBlockDevice => InodeInner::BasicBlockDevice(body),
            _ => InodeInner::BasicCharacterDevice(body),
        };
        (basic, inner)
    } else {
        let body = ExtendedDeviceSpecialFile {
            link_count,
            device_number,
            xattr_index,
        };
        let inner = match extended {
            InodeId::ExtendedBlockDevice => InodeInner::ExtendedBlockDevice(body),
            _ => InodeInner::ExtendedCharDevice(body),
        };
        (extended, inner)
    }
}

fn ipc_inode(basic: InodeId, extended: InodeId, link_count: u32, xattr_index: u32) -> (InodeId, InodeInner) {
    if xattr_index == NO_XATTR {
        let inner = match basic {
            InodeId::BasicFifo => InodeInner::BasicFifo(BasicIpc { link_count }),
            _ => InodeInner::BasicSocket(BasicIpc { link_count }),
        };
        (basic, inner)
    } else {
        let body = ExtendedIpc { link_count, xattr_index };
        let inner = match extended {
            InodeId::ExtendedFifo => InodeInner::ExtendedFifo(body),
            _ => InodeInner::ExtendedSocket(body),
        };
        (extended, inner)
    }
}

type DirEntryTuple = (Vec<u8>, u32, u16, u32, u16);

/// Group sorted directory entries into headers of at most 256 entries that share
/// the same inode metadata block and stay within a signed 16-bit inode delta.
fn batch_dir_entries(entries: &[DirEntryTuple]) -> Vec<Vec<DirEntryTuple>> {
    let mut groups: Vec<Vec<DirEntryTuple>> = Vec::new();
    for entry in entries {
        let fits_current = groups.last().is_some_and(|group: &Vec<DirEntryTuple>| {
            let head = &group[0];
            group.len() < DIR_ENTRIES_PER_HEADER
                && head.1 == entry.1
                && (entry.3 as i64 - head.3 as i64).unsigned_abs() <= i16::MAX as u64
        });
        if fits_current {
            groups.last_mut().unwrap().push(entry.clone());
        } else {
            groups.push(vec![entry.clone()]);
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(start: u32, inode_number: u32) -> DirEntryTuple {
        (b"n".to_vec(), start, 0u16, inode_number, 1u16)
    }

    proptest! {
        /// No header may carry more than `DIR_ENTRIES_PER_HEADER` entries, and
        /// batching must neither drop nor reorder anything.
        #[test]
        fn groups_never_exceed_256_and_preserve_every_entry(
            count in 0usize..600,
            break_every in 1usize..50,
        ) {
            let entries: Vec<DirEntryTuple> = (0..count)
                .map(|i| entry((i / break_every) as u32, i as u32))
                .collect();

            let groups = batch_dir_entries(&entries);
            for group in &groups {
                prop_assert!(!group.is_empty());
                prop_assert!(group.len() <= DIR_ENTRIES_PER_HEADER);
            }

            let flattened: Vec<_> = groups.into_iter().flatten().collect();
            prop_assert_eq!(flattened, entries);
        }
    }
}
