//! # RelayWire
//!
//! The byte-level contract shared by relay rpc clients and servers.
//!
//! ## Architecture
//!
//! A connection opens with a fixed-width [`Options`] handshake naming the
//! protocol magic, the body serializer and the body compressor. After that both
//! sides trade `(Header, Body)` pairs through a [`Codec`]. The runtime crate
//! only ever talks to the `Codec` trait, so encodings stay swappable.

pub mod codec;
pub mod compress;
pub mod error;
pub mod handshake;
pub mod header;
pub mod serializer;

pub use codec::Codec;
pub use codec::FrameCodec;
pub use compress::CompressType;
pub use compress::Compressor;
pub use error::Error;
pub use error::Result;
pub use handshake::MAGIC_NUMBER;
pub use handshake::Options;
pub use header::Header;
pub use serializer::CodecType;
pub use serializer::Serializer;
