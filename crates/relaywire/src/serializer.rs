//! # Body Serializers
//!
//! Turns typed values into body bytes and back. A connection picks its
//! serializer once, in the handshake, by a small integer id.
//!
//! ## Ids
//! - `1`: MessagePack, the compact binary struct encoding (default).
//! - `2`: JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;

/// Strategy for encoding values to bytes.
///
/// Not object safe on purpose: dispatch happens through [`CodecType`], which is
/// a closed set resolved from the handshake id.
pub trait Serializer {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;
    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// MessagePack with named struct fields, so peers may add fields freely.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        rmp_serde::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// The serializer negotiated for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CodecType {
    #[default]
    MsgPack = 1,
    Json = 2,
}

impl CodecType {
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Resolves a handshake id.
    pub fn from_id(id: u16) -> Result<Self> {
        match id {
            1 => Ok(Self::MsgPack),
            2 => Ok(Self::Json),
            other => Err(Error::UnknownCodec(other)),
        }
    }
}

impl Serializer for CodecType {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::MsgPack => MsgPackSerializer.marshal(value),
            Self::Json => JsonSerializer.marshal(value),
        }
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            Self::MsgPack => MsgPackSerializer.unmarshal(data),
            Self::Json => JsonSerializer.unmarshal(data),
        }
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MsgPack => write!(f, "msgpack"),
            Self::Json => write!(f, "json"),
        }
    }
}
