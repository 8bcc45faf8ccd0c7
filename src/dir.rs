//! [`Dir`] and [`DirEntry`]: the directory-table wire format.
//!
//! A directory is a sequence of headers, each introducing up to 256 entries that
//! share the same inode metadata block (`start`) and are close enough in inode
//! number to the header's `inode_num` to fit a signed 16-bit delta.

use deku::prelude::*;

pub const DIR_ENTRIES_PER_HEADER: usize = 256;

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little")]
pub struct Dir {
    pub count: u32,
    pub start: u32,
    pub inode_num: u32,
    #[deku(count = "*count + 1")]
    pub dir_entries: Vec<DirEntry>,
}

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirEntry {
    pub offset: u16,
    pub inode_offset: i16,
    pub t: u16,
    pub name_size: u16,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}

impl DirEntry {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug, DekuRead, DekuWrite, Clone)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DirectoryIndex {
    pub index: u32,
    pub start: u32,
    pub name_size: u32,
    #[deku(count = "*name_size + 1")]
    pub name: Vec<u8>,
}
