//! Block compressor abstraction
//!
//! Each [`Compressor`] variant is backed by a [`Codec`] instance. A `Codec` is cheap to
//! clone and owns whatever scratch state its underlying library needs; the block
//! processor gives every worker thread its own clone so no compressor state is ever
//! shared across threads.

use std::io::{Cursor, Read};

use deku::prelude::*;
#[cfg(feature = "gzip")]
use flate2::{
    read::{ZlibDecoder, ZlibEncoder},
    Compression,
};
#[cfg(feature = "xz")]
use xz2::{
    read::{XzDecoder, XzEncoder},
    stream::{Check, Filters, LzmaOptions, MtStreamBuilder, Stream},
};

use crate::error::BackhandError;

/// On-disk compressor id, stored in the superblock.
#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite, Default)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
#[deku(id_type = "u16")]
#[rustfmt::skip]
pub enum Compressor {
    None = 0,
    Gzip = 1,
    Lzma = 2,
    Lzo  = 3,
    #[default]
    Xz   = 4,
    Lz4  = 5,
    Zstd = 6,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian, compressor: Compressor"
)]
#[deku(id = "compressor")]
pub enum CompressionOptions {
    #[deku(id = "Compressor::Gzip")]
    Gzip(GzipOptions),
    #[deku(id = "Compressor::Lzo")]
    Lzo(LzoOptions),
    #[deku(id = "Compressor::Xz")]
    Xz(XzOptions),
    #[deku(id = "Compressor::Lz4")]
    Lz4(Lz4Options),
    #[deku(id = "Compressor::Zstd")]
    Zstd(ZstdOptions),
    #[deku(id = "Compressor::Lzma")]
    Lzma,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct GzipOptions {
    pub compression_level: u32,
    pub window_size: u16,
    pub strategies: u16,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct LzoOptions {
    pub algorithm: u32,
    pub compression_level: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct XzOptions {
    pub dictionary_size: u32,
    pub filters: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct Lz4Options {
    pub version: u32,
    pub flags: u32,
}

#[derive(Debug, DekuRead, DekuWrite, PartialEq, Eq, Clone, Copy)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct ZstdOptions {
    pub compression_level: u32,
}

/// Per-codec, per-worker compression action.
///
/// `compress` returns `Ok(None)` (not an error) when the compressed form is not
/// smaller than `block_size`, per the "store uncompressed" rule; callers must then
/// keep the original bytes and flag the block uncompressed on disk.
pub trait Codec: Send {
    fn id(&self) -> Compressor;

    fn configure(&mut self, options: Option<CompressionOptions>) -> Result<(), BackhandError>;

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError>;

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError>;

    /// Non-default options to be persisted right after the superblock, or `None` if this
    /// codec instance is configured with its documented defaults.
    fn write_options(&self) -> Option<CompressionOptions>;

    fn clone_box(&self) -> Box<dyn Codec>;
}

impl Clone for Box<dyn Codec> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

pub fn default_codec(compressor: Compressor) -> Result<Box<dyn Codec>, BackhandError> {
    match compressor {
        #[cfg(feature = "gzip")]
        Compressor::Gzip => Ok(Box::new(GzipCodec::default())),
        #[cfg(feature = "xz")]
        Compressor::Xz => Ok(Box::new(XzCodec::default())),
        #[cfg(feature = "xz")]
        Compressor::Lzma => Ok(Box::new(LzmaCodec::default())),
        #[cfg(feature = "lzo")]
        Compressor::Lzo => Ok(Box::new(LzoCodec::default())),
        #[cfg(feature = "zstd")]
        Compressor::Zstd => Ok(Box::new(ZstdCodec::default())),
        #[cfg(feature = "lz4")]
        Compressor::Lz4 => Ok(Box::new(Lz4Codec::default())),
        other => Err(BackhandError::UnsupportedCompression(other)),
    }
}

#[cfg(feature = "gzip")]
#[derive(Clone)]
pub struct GzipCodec {
    level: u32,
}

#[cfg(feature = "gzip")]
impl Default for GzipCodec {
    fn default() -> Self {
        Self { level: 9 }
    }
}

#[cfg(feature = "gzip")]
impl Codec for GzipCodec {
    fn id(&self) -> Compressor {
        Compressor::Gzip
    }

    fn configure(&mut self, options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        if let Some(CompressionOptions::Gzip(o)) = options {
            // deflate window is clamped to [8, 15] per the format; squashfs-tools only
            // ever emits 15, but a foreign image may claim a smaller one.
            let _window = o.window_size.clamp(8, 15);
            self.level = o.compression_level.clamp(1, 9);
        }
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let mut encoder = ZlibEncoder::new(Cursor::new(input), Compression::new(self.level));
        let mut buf = Vec::with_capacity(input.len());
        encoder.read_to_end(&mut buf)?;
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        let mut decoder = ZlibDecoder::new(input);
        decoder
            .read_to_end(out)
            .map_err(|_| BackhandError::CorruptedOrInvalidSquashfs)?;
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        (self.level != 9).then_some(CompressionOptions::Gzip(GzipOptions {
            compression_level: self.level,
            window_size: 15,
            strategies: 0,
        }))
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "xz")]
#[derive(Clone)]
pub struct XzCodec {
    level: u32,
    dict_size: Option<u32>,
}

#[cfg(feature = "xz")]
impl Default for XzCodec {
    fn default() -> Self {
        Self {
            level: 6,
            dict_size: None,
        }
    }
}

#[cfg(feature = "xz")]
impl Codec for XzCodec {
    fn id(&self) -> Compressor {
        Compressor::Xz
    }

    fn configure(&mut self, options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        if let Some(CompressionOptions::Xz(o)) = options {
            // XZ dictionary must be a power of two, or 2^n + 2^(n-1).
            self.dict_size = Some(o.dictionary_size);
        }
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let dict_size = self.dict_size.unwrap_or(input.len().max(4096) as u32);
        let mut opts = LzmaOptions::new_preset(self.level)
            .map_err(|_| BackhandError::InvalidCompressionOption)?;
        opts.dict_size(dict_size);
        let mut filters = Filters::new();
        filters.lzma2(&opts);
        let stream = MtStreamBuilder::new()
            .threads(1)
            .filters(filters)
            .check(Check::Crc32)
            .encoder()
            .map_err(|_| BackhandError::InvalidCompressionOption)?;
        let mut encoder = XzEncoder::new_stream(Cursor::new(input), stream);
        let mut buf = Vec::with_capacity(input.len());
        encoder.read_to_end(&mut buf)?;
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        let mut decoder = XzDecoder::new(input);
        decoder.read_to_end(out)?;
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        self.dict_size.map(|d| {
            CompressionOptions::Xz(XzOptions {
                dictionary_size: d,
                filters: 0,
            })
        })
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

/// Dictionary size used by the raw (container-less) LZMA2 filter chain. Unlike
/// [`XzCodec`], a raw stream carries no block header to persist a per-image
/// dictionary size in, so encoder and decoder must agree on one up front; this is
/// sized generously above any block size squashfs actually uses.
#[cfg(feature = "xz")]
const LZMA_RAW_DICT_SIZE: u32 = 1 << 24;

#[cfg(feature = "xz")]
fn lzma_raw_filters(level: u32) -> Result<Filters, BackhandError> {
    let mut opts = LzmaOptions::new_preset(level).map_err(|_| BackhandError::InvalidCompressionOption)?;
    opts.dict_size(LZMA_RAW_DICT_SIZE);
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    Ok(filters)
}

/// Raw LZMA2 (`Compressor::Lzma`), distinct from [`XzCodec`]'s LZMA2-framed-as-XZ:
/// no xz container, just the filter's own stream.
#[cfg(feature = "xz")]
#[derive(Clone)]
pub struct LzmaCodec {
    level: u32,
}

#[cfg(feature = "xz")]
impl Default for LzmaCodec {
    fn default() -> Self {
        Self { level: 6 }
    }
}

#[cfg(feature = "xz")]
impl Codec for LzmaCodec {
    fn id(&self) -> Compressor {
        Compressor::Lzma
    }

    fn configure(&mut self, _options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        // CompressionOptions::Lzma carries no fields on disk; nothing to apply.
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let filters = lzma_raw_filters(self.level)?;
        let stream = Stream::new_raw_encoder(&filters)
            .map_err(|_| BackhandError::InvalidCompressionOption)?;
        let mut encoder = XzEncoder::new_stream(Cursor::new(input), stream);
        let mut buf = Vec::with_capacity(input.len());
        encoder.read_to_end(&mut buf)?;
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        let filters = lzma_raw_filters(self.level)?;
        let stream =
            Stream::new_raw_decoder(&filters).map_err(|_| BackhandError::CorruptedOrInvalidSquashfs)?;
        let mut decoder = XzDecoder::new_stream(Cursor::new(input), stream);
        decoder.read_to_end(out)?;
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        None
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "lzo")]
#[derive(Clone, Default)]
pub struct LzoCodec;

#[cfg(feature = "lzo")]
impl Codec for LzoCodec {
    fn id(&self) -> Compressor {
        Compressor::Lzo
    }

    fn configure(&mut self, _options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let mut lzo = rust_lzo::LZOContext::new();
        let mut buf = vec![0; rust_lzo::worst_compress(input.len())];
        let error = lzo.compress(input, &mut buf);
        if error != rust_lzo::LZOError::OK {
            return Err(BackhandError::CorruptedOrInvalidSquashfs);
        }
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        out.resize(out.capacity().max(input.len() * 8), 0);
        let (decompressed, error) = rust_lzo::LZOContext::decompress_to_slice(input, out);
        let out_size = decompressed.len();
        if error != rust_lzo::LZOError::OK {
            return Err(BackhandError::CorruptedOrInvalidSquashfs);
        }
        out.truncate(out_size);
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        None
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "zstd")]
#[derive(Clone)]
pub struct ZstdCodec {
    level: i32,
}

#[cfg(feature = "zstd")]
impl Default for ZstdCodec {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "zstd")]
impl Codec for ZstdCodec {
    fn id(&self) -> Compressor {
        Compressor::Zstd
    }

    fn configure(&mut self, options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        if let Some(CompressionOptions::Zstd(o)) = options {
            self.level = (o.compression_level as i32).clamp(1, 22);
        }
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let mut encoder = zstd::bulk::Compressor::new(self.level)
            .map_err(|_| BackhandError::InvalidCompressionOption)?;
        let mut buf = Vec::with_capacity(input.len());
        encoder.compress_to_buffer(input, &mut buf)?;
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        let mut decoder =
            zstd::bulk::Decompressor::new().map_err(|_| BackhandError::CorruptedOrInvalidSquashfs)?;
        decoder.decompress_to_buffer(input, out)?;
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        (self.level != 3).then_some(CompressionOptions::Zstd(ZstdOptions {
            compression_level: self.level as u32,
        }))
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}

#[cfg(feature = "lz4")]
#[derive(Clone, Default)]
pub struct Lz4Codec;

#[cfg(feature = "lz4")]
impl Codec for Lz4Codec {
    fn id(&self) -> Compressor {
        Compressor::Lz4
    }

    fn configure(&mut self, _options: Option<CompressionOptions>) -> Result<(), BackhandError> {
        Ok(())
    }

    fn compress(&self, input: &[u8]) -> Result<Option<Vec<u8>>, BackhandError> {
        let buf = lz4_flex::block::compress(input);
        if buf.len() < input.len() {
            Ok(Some(buf))
        } else {
            Ok(None)
        }
    }

    fn decompress(&self, input: &[u8], out: &mut Vec<u8>) -> Result<(), BackhandError> {
        let cap = out.capacity().max(input.len() * 4).max(4096);
        let decompressed = lz4_flex::block::decompress(input, cap)
            .map_err(|_| BackhandError::CorruptedOrInvalidSquashfs)?;
        out.extend_from_slice(&decompressed);
        Ok(())
    }

    fn write_options(&self) -> Option<CompressionOptions> {
        None
    }

    fn clone_box(&self) -> Box<dyn Codec> {
        Box::new(self.clone())
    }
}
