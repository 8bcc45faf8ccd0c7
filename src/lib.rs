#![doc = include_str!("../README.md")]

mod block;
pub mod codec;
mod dir;
pub mod error;
mod export;
mod fragment;
mod id;
pub mod inode;
mod metadata;
mod pipeline;
mod reader;
mod superblock;
pub mod tree;
mod writer;
mod xattr;

pub use crate::codec::{Compressor, CompressionOptions};
pub use crate::error::BackhandError;
pub use crate::fragment::NO_FRAGMENT;
pub use crate::inode::{Inode, InodeInner};
pub use crate::reader::{Entry, SqfsReader, TreeWalker};
pub use crate::superblock::{Flags, SuperBlock};
pub use crate::tree::{FileSource, NodeHeader, NodeId, NodeKind, Tree};
pub use crate::writer::{SqfsWriter, WriterConfig};
pub use crate::xattr::{XattrEntry, XattrKey, XattrPrefix, NO_XATTR};
