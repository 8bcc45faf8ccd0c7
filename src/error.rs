//! Errors

use std::{io, string};

use thiserror::Error;

use crate::codec::Compressor;

/// Errors generated from the library
#[derive(Error, Debug)]
pub enum BackhandError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("string error: {0:?}")]
    StringUtf8(#[from] string::FromUtf8Error),

    #[error("string error: {0:?}")]
    StrUtf8(#[from] std::str::Utf8Error),

    #[error("unsupported compression: {0:?}")]
    UnsupportedCompression(Compressor),

    #[error("file not found")]
    FileNotFound,

    #[error("branch was thought to be unreachable")]
    Unreachable,

    #[error("inode was unexpected in this position")]
    UnexpectedInode,

    #[error("corrupted or invalid squashfs image")]
    CorruptedOrInvalidSquashfs,

    #[error("invalid squashfs compression options")]
    InvalidCompressionOption,

    #[error("Invalid file path in the squashfs image")]
    InvalidFilePath,

    #[error("file inside squashfs image have no name")]
    UndefineFileName,

    #[error("file duplicated in squashfs image")]
    DuplicatedFileName,

    /// A size or count computation would not fit in its on-disk field.
    #[error("value overflows its on-disk representation: {0}")]
    Overflow(&'static str),

    /// An index computed to address a table fell outside the table.
    #[error("index out of bounds: {0}")]
    OutOfBounds(&'static str),

    /// The producer-side API was called out of order (e.g. `append` with no open file).
    #[error("API misuse: {0}")]
    Sequence(&'static str),

    /// A hard link ultimately resolves back to itself.
    #[error("hard link loop detected at {0:?}")]
    LinkLoop(std::path::PathBuf),

    /// A hard link names a target that does not exist in the tree.
    #[error("hard link target not found: {0:?}")]
    NotFound(std::path::PathBuf),

    /// A worker thread or the block writer could not allocate a buffer.
    #[error("allocation failure: {0}")]
    AllocFailure(&'static str),

    /// The pool has been poisoned by an earlier worker error; this is the stored cause.
    #[error("worker pool poisoned: {0}")]
    PoolPoisoned(Box<BackhandError>),
}

impl From<BackhandError> for io::Error {
    fn from(value: BackhandError) -> Self {
        use BackhandError::*;
        match value {
            StdIo(io) => io,
            Deku(e) => e.into(),
            StringUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            StrUtf8(e) => Self::new(io::ErrorKind::InvalidData, e),
            e @ UnsupportedCompression(_) => Self::new(io::ErrorKind::Unsupported, e),
            e @ FileNotFound => Self::new(io::ErrorKind::NotFound, e),
            e @ NotFound(_) => Self::new(io::ErrorKind::NotFound, e),
            e @ (Unreachable
            | UnexpectedInode
            | CorruptedOrInvalidSquashfs
            | InvalidCompressionOption
            | InvalidFilePath
            | UndefineFileName
            | DuplicatedFileName
            | Overflow(_)
            | OutOfBounds(_)
            | Sequence(_)
            | LinkLoop(_)
            | AllocFailure(_)
            | PoolPoisoned(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
