//! # Framed Codec
//!
//! Moves `(Header, Body)` pairs over a byte stream once the handshake is done.
//!
//! ## Invariants
//! - **Atomic Pairs**: A header and its body are written under one writer lock,
//!   so concurrent writers never interleave partial frames.
//! - **Aligned Reads**: `read_body` always consumes a whole frame, even when the
//!   caller drops the result. Discarding a body never desynchronizes the stream.
//! - **Prompt Close**: `close` wakes a reader parked in `read_header`.

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;

use crate::compress::CompressType;
use crate::error::Error;
use crate::error::Result;
use crate::handshake::Options;
use crate::header::Header;
use crate::serializer::CodecType;
use crate::serializer::Serializer;

/// Largest single frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// The capability set both ends of a connection drive.
///
/// Bodies cross this boundary already serialized; use [`Codec::codec_type`] to
/// marshal and unmarshal them. Compression is the codec's own business.
#[async_trait::async_trait]
pub trait Codec: Send + Sync + 'static {
    async fn read_header(&self) -> Result<Header>;

    /// Reads the next body frame. Drop the result to discard it.
    async fn read_body(&self) -> Result<Bytes>;

    async fn write(&self, header: &Header, body: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn codec_type(&self) -> CodecType;
}

/// Length-delimited implementation of [`Codec`] over any duplex stream.
pub struct FrameCodec<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, LengthDelimitedCodec>>,
    codec_type: CodecType,
    compress_type: CompressType,
    closed: CancellationToken,
}

impl<S> FrameCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a stream whose handshake has already been exchanged.
    pub fn new(stream: S, opt: &Options) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(rd, frame_codec())),
            writer: Mutex::new(FramedWrite::new(wr, frame_codec())),
            codec_type: opt.codec_type,
            compress_type: opt.compress_type,
            closed: CancellationToken::new(),
        }
    }

    async fn next_frame(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            frame = reader.next() => match frame {
                None => Err(Error::Eof),
                Some(Err(e)) => Err(e.into()),
                Some(Ok(frame)) => Ok(frame.freeze()),
            },
        }
    }
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[async_trait::async_trait]
impl<S> Codec for FrameCodec<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_header(&self) -> Result<Header> {
        let frame = self.next_frame().await?;
        self.codec_type.unmarshal(&frame)
    }

    async fn read_body(&self) -> Result<Bytes> {
        let frame = self.next_frame().await?;
        let body = self.compress_type.compressor().decompress(&frame)?;
        Ok(Bytes::from(body))
    }

    async fn write(&self, header: &Header, body: &[u8]) -> Result<()> {
        let head = Bytes::from(self.codec_type.marshal(header)?);
        let body = Bytes::from(self.compress_type.compressor().compress(body)?);

        let mut writer = self.writer.lock().await;
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        if let Err(e) = writer.feed(head).await {
            tracing::warn!(seq = header.seq, "codec: failed to write header: {}", e);
            return Err(e.into());
        }
        if let Err(e) = writer.send(body).await {
            tracing::warn!(seq = header.seq, "codec: failed to flush frame: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        // a second close finds the write half already shut down
        match <_ as SinkExt<Bytes>>::close(&mut *writer).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn codec_type(&self) -> CodecType {
        self.codec_type
    }
}
