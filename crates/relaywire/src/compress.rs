//! # Body Compressors
//!
//! Optional compression applied to body frames after serialization. Headers
//! are never compressed. Empty input always maps to empty output, so error
//! responses with no body stay zero length on the wire.

use std::io::Read;
use std::io::Write;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::read::ZlibDecoder;
use flate2::write::GzEncoder;
use flate2::write::ZlibEncoder;

use crate::error::Error;
use crate::error::Result;

/// A symmetric byte transform.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(input.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(input).map_err(compression_error)?;
        enc.finish().map_err(compression_error)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        GzDecoder::new(input).read_to_end(&mut out).map_err(compression_error)?;
        Ok(out)
    }
}

/// Raw deflate stream with zlib framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZlibCompressor;

impl Compressor for ZlibCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(input).map_err(compression_error)?;
        enc.finish().map_err(compression_error)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        ZlibDecoder::new(input).read_to_end(&mut out).map_err(compression_error)?;
        Ok(out)
    }
}

/// Fast block compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZstdCompressor;

impl Compressor for ZstdCompressor {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        zstd::encode_all(input, 0).map_err(compression_error)
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        zstd::decode_all(input).map_err(compression_error)
    }
}

fn compression_error(e: std::io::Error) -> Error {
    Error::Compression(e.to_string())
}

/// The compressor negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CompressType {
    #[default]
    Noop = 0,
    Gzip = 1,
    Zstd = 2,
    Zlib = 3,
}

impl CompressType {
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Resolves a handshake id.
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(Self::Noop),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Zstd),
            3 => Ok(Self::Zlib),
            other => Err(Error::UnknownCompressor(other)),
        }
    }

    pub fn compressor(self) -> &'static dyn Compressor {
        match self {
            Self::Noop => &NoopCompressor,
            Self::Gzip => &GzipCompressor,
            Self::Zstd => &ZstdCompressor,
            Self::Zlib => &ZlibCompressor,
        }
    }
}
