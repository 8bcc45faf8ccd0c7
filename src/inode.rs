//! On-disk inode bodies: one [`Inode`] per filesystem object, written into the
//! inode metadata stream by the tree walk.

use core::fmt;

use deku::prelude::*;
use deku::writer::Writer;

use crate::dir::DirectoryIndex;
use crate::error::BackhandError;
use crate::metadata::MetadataWriter;

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "block_size: u32, block_log: u16")]
#[deku(endian = "little")]
pub struct Inode {
    pub id: InodeId,
    pub header: InodeHeader,
    #[deku(ctx = "*id, block_size, block_log")]
    pub inner: InodeInner,
}

impl Inode {
    /// Serialize into `m_writer`, returning the `(start, offset)` reference to store
    /// in this inode's directory entry.
    pub fn write(
        &self,
        m_writer: &mut MetadataWriter,
        block_size: u32,
        block_log: u16,
    ) -> Result<(u32, u16), BackhandError> {
        let (start, offset) = m_writer.position();
        let mut writer = Writer::new(Vec::new());
        self.to_writer(&mut writer, (block_size, block_log))?;
        m_writer.write_all(&writer.inner)?;
        Ok((start, offset))
    }
}

/// On-disk inode type tag. Squashfs numbers the "extended" variant of a type ten
/// above its basic counterpart, except directory/file which are offset by 7.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(type = "u16")]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[rustfmt::skip]
pub enum InodeId {
    BasicDirectory       = 1,
    BasicFile            = 2,
    BasicSymlink         = 3,
    BasicBlockDevice     = 4,
    BasicCharacterDevice = 5,
    BasicFifo            = 6,
    BasicSocket          = 7,
    ExtendedDirectory    = 8,
    ExtendedFile         = 9,
    ExtendedSymlink      = 10,
    ExtendedBlockDevice  = 11,
    ExtendedCharDevice   = 12,
    ExtendedFifo         = 13,
    ExtendedSocket       = 14,
}

impl InodeId {
    /// The directory-entry `t` field always uses the basic (1-7) type number, even
    /// when the inode itself was written as an extended variant.
    pub fn basic_type(self) -> u16 {
        match self {
            InodeId::BasicDirectory | InodeId::ExtendedDirectory => 1,
            InodeId::BasicFile | InodeId::ExtendedFile => 2,
            InodeId::BasicSymlink | InodeId::ExtendedSymlink => 3,
            InodeId::BasicBlockDevice | InodeId::ExtendedBlockDevice => 4,
            InodeId::BasicCharacterDevice | InodeId::ExtendedCharDevice => 5,
            InodeId::BasicFifo | InodeId::ExtendedFifo => 6,
            InodeId::BasicSocket | InodeId::ExtendedSocket => 7,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(ctx = "endian: deku::ctx::Endian, id: InodeId, block_size: u32, block_log: u16")]
#[deku(endian = "endian")]
#[deku(id = "id")]
pub enum InodeInner {
    #[deku(id = "InodeId::BasicDirectory")]
    BasicDirectory(BasicDirectory),

    #[deku(id = "InodeId::BasicFile")]
    BasicFile(#[deku(ctx = "block_size, block_log")] BasicFile),

    #[deku(id = "InodeId::BasicSymlink")]
    BasicSymlink(BasicSymlink),

    #[deku(id = "InodeId::BasicBlockDevice")]
    BasicBlockDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::BasicCharacterDevice")]
    BasicCharacterDevice(BasicDeviceSpecialFile),

    #[deku(id = "InodeId::BasicFifo")]
    BasicFifo(BasicIpc),

    #[deku(id = "InodeId::BasicSocket")]
    BasicSocket(BasicIpc),

    #[deku(id = "InodeId::ExtendedDirectory")]
    ExtendedDirectory(ExtendedDirectory),

    #[deku(id = "InodeId::ExtendedFile")]
    ExtendedFile(#[deku(ctx = "block_size, block_log")] ExtendedFile),

    #[deku(id = "InodeId::ExtendedSymlink")]
    ExtendedSymlink(ExtendedSymlink),

    #[deku(id = "InodeId::ExtendedBlockDevice")]
    ExtendedBlockDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedCharDevice")]
    ExtendedCharDevice(ExtendedDeviceSpecialFile),

    #[deku(id = "InodeId::ExtendedFifo")]
    ExtendedFifo(ExtendedIpc),

    #[deku(id = "InodeId::ExtendedSocket")]
    ExtendedSocket(ExtendedIpc),
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct InodeHeader {
    pub permissions: u16,
    pub uid: u16,
    pub gid: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicDirectory {
    pub block_index: u32,
    pub link_count: u32,
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

impl From<&ExtendedDirectory> for BasicDirectory {
    fn from(ex_dir: &ExtendedDirectory) -> Self {
        Self {
            block_index: ex_dir.block_index,
            link_count: ex_dir.link_count,
            file_size: ex_dir.file_size as u16,
            block_offset: ex_dir.block_offset,
            parent_inode: ex_dir.parent_inode,
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedDirectory {
    pub link_count: u32,
    pub file_size: u32,
    pub block_index: u32,
    pub parent_inode: u32,
    pub index_count: u16,
    pub block_offset: u16,
    pub xattr_index: u32,
    #[deku(count = "*index_count")]
    pub dir_index: Vec<DirectoryIndex>,
}

/// One block-size table entry. The top bit marks the block stored uncompressed; a
/// value of `0` marks a sparse (hole) block that occupies no space on disk.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DataSize(pub u32);

const DATA_SIZE_UNCOMPRESSED_BIT: u32 = 1 << 24;

impl DataSize {
    pub fn compressed(size: u32) -> Self {
        Self(size)
    }

    pub fn uncompressed(size: u32) -> Self {
        Self(size | DATA_SIZE_UNCOMPRESSED_BIT)
    }

    pub fn sparse() -> Self {
        Self(0)
    }

    pub fn is_sparse(&self) -> bool {
        self.0 == 0
    }

    pub fn is_compressed(&self) -> bool {
        !self.is_sparse() && self.0 & DATA_SIZE_UNCOMPRESSED_BIT == 0
    }

    pub fn size(&self) -> u32 {
        self.0 & !DATA_SIZE_UNCOMPRESSED_BIT
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, block_size: u32, block_log: u16"
)]
pub struct BasicFile {
    pub blocks_start: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub file_size: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size as u64)")]
    pub block_sizes: Vec<DataSize>,
}

impl From<&ExtendedFile> for BasicFile {
    fn from(ex_file: &ExtendedFile) -> Self {
        Self {
            blocks_start: ex_file.blocks_start as u32,
            frag_index: ex_file.frag_index,
            block_offset: ex_file.block_offset,
            file_size: ex_file.file_size as u32,
            block_sizes: ex_file.block_sizes.clone(),
        }
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, block_size: u32, block_log: u16"
)]
pub struct ExtendedFile {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub block_offset: u32,
    pub xattr_index: u32,
    #[deku(count = "block_count(block_size, block_log, *frag_index, *file_size)")]
    pub block_sizes: Vec<DataSize>,
}

pub fn block_count(block_size: u32, block_log: u16, fragment: u32, file_size: u64) -> u64 {
    const NO_FRAGMENT: u32 = 0xffff_ffff;

    if fragment == NO_FRAGMENT {
        (file_size + u64::from(block_size) - 1) >> block_log
    } else {
        file_size >> block_log
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "target_size")]
    pub target_path: Vec<u8>,
}

impl fmt::Debug for BasicSymlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicSymlink")
            .field("link_count", &self.link_count)
            .field("target_size", &self.target_size)
            .field("target_path", &self.target())
            .finish()
    }
}

impl BasicSymlink {
    pub fn target(&self) -> String {
        String::from_utf8_lossy(&self.target_path).into_owned()
    }
}

#[derive(DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedSymlink {
    pub link_count: u32,
    pub target_size: u32,
    #[deku(count = "target_size")]
    pub target_path: Vec<u8>,
    pub xattr_index: u32,
}

impl fmt::Debug for ExtendedSymlink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedSymlink")
            .field("link_count", &self.link_count)
            .field("target_size", &self.target_size)
            .field("xattr_index", &self.xattr_index)
            .finish()
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedDeviceSpecialFile {
    pub link_count: u32,
    pub device_number: u32,
    pub xattr_index: u32,
}

/// Shared body for fifo and socket basic inodes: just a link count.
#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct BasicIpc {
    pub link_count: u32,
}

#[derive(Debug, DekuRead, DekuWrite, Clone, Copy, PartialEq, Eq)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ExtendedIpc {
    pub link_count: u32,
    pub xattr_index: u32,
}
