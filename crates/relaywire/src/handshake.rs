//! # Connection Handshake
//!
//! The dialing side writes one fixed-width `Options` record before any framed
//! traffic. The accepting side reads it straight off the raw stream.
//!
//! ## Wire Format (big-endian, 24 bytes)
//! - `magic: u32`
//! - `codec: u16`
//! - `compress: u16`
//! - `connect_timeout_ms: u64`
//! - `handle_timeout_ms: u64`

use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::compress::CompressType;
use crate::error::Error;
use crate::error::Result;
use crate::serializer::CodecType;

/// Identifies a relay rpc peer.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Size of the encoded handshake.
pub const HANDSHAKE_LEN: usize = 24;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-level parameters, sent once and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: CodecType,
    pub compress_type: CompressType,
    /// Zero disables the dial timeout.
    pub connect_timeout: Duration,
    /// Zero leaves the choice to the server.
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            compress_type: CompressType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_compress(mut self, compress_type: CompressType) -> Self {
        self.compress_type = compress_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0..4].copy_from_slice(&self.magic_number.to_be_bytes());
        buf[4..6].copy_from_slice(&self.codec_type.id().to_be_bytes());
        buf[6..8].copy_from_slice(&self.compress_type.id().to_be_bytes());
        buf[8..16].copy_from_slice(&millis(self.connect_timeout).to_be_bytes());
        buf[16..24].copy_from_slice(&millis(self.handle_timeout).to_be_bytes());
        buf
    }

    /// Decodes and validates a handshake record.
    ///
    /// Fails on a foreign magic number or an id this build cannot resolve.
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        let magic_number = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic_number != MAGIC_NUMBER {
            return Err(Error::BadMagic(magic_number));
        }
        let codec_type = CodecType::from_id(u16::from_be_bytes([buf[4], buf[5]]))?;
        let compress_type = CompressType::from_id(u16::from_be_bytes([buf[6], buf[7]]))?;
        let connect_timeout = read_millis(&buf[8..16]);
        let handle_timeout = read_millis(&buf[16..24]);

        Ok(Self {
            magic_number,
            codec_type,
            compress_type,
            connect_timeout,
            handle_timeout,
        })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn read_millis(bytes: &[u8]) -> Duration {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Duration::from_millis(u64::from_be_bytes(raw))
}
