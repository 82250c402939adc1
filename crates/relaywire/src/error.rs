//! # Error Definitions
//!
//! The central ledger of handshake, framing and encoding failures.

/// Operational failures within the wire layer.
///
/// I/O causes are flattened to strings so the error stays `Clone`; a broken
/// connection fails every call pending on it with the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The peer opened with something other than our protocol magic.
    #[error("invalid magic number: {0:#x}")]
    BadMagic(u32),
    /// The handshake named a codec this build does not provide.
    #[error("invalid codec type: {0}")]
    UnknownCodec(u16),
    /// The handshake named a compressor this build does not provide.
    #[error("invalid compress type: {0}")]
    UnknownCompressor(u16),
    /// The stream ended cleanly between frames.
    #[error("end of stream")]
    Eof,
    /// The codec was closed locally while a read was in flight.
    #[error("codec closed")]
    Closed,
    /// Socket level failure.
    #[error("i/o error: {0}")]
    Io(String),
    /// Encoding a header or body failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// Decoding a header or body failed.
    #[error("decode error: {0}")]
    Decode(String),
    /// Compressing or decompressing a body failed.
    #[error("compression error: {0}")]
    Compression(String),
}

impl Error {
    /// True for the clean ways a connection can end.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof | Self::Closed)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::Eof,
            _ => Self::Io(e.to_string()),
        }
    }
}

/// A specialized Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;
