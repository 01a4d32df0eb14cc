//! Opaque message bodies
//!
//! The engine moves bodies as bytes tagged with the codec that produced them;
//! only the caller and the invoker ever turn them into typed values.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{CodecResult, CodecType};

/// Encoded body plus the format it is encoded in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    codec_type: CodecType,
    bytes: Bytes,
}

impl Payload {
    pub fn new(codec_type: CodecType, bytes: impl Into<Bytes>) -> Self {
        Self {
            codec_type,
            bytes: bytes.into(),
        }
    }

    /// Placeholder body sent alongside an error header
    pub fn empty(codec_type: CodecType) -> Self {
        Self::new(codec_type, Bytes::new())
    }

    /// Serialize a value into a payload
    pub fn encode<T: Serialize + ?Sized>(codec_type: CodecType, value: &T) -> CodecResult<Self> {
        Ok(Self::new(codec_type, codec_type.encode(value)?))
    }

    /// Deserialize the payload into a value
    pub fn decode<T: DeserializeOwned>(&self) -> CodecResult<T> {
        self.codec_type.decode(&self.bytes)
    }

    /// Encode a reply in the same format as this payload
    pub fn reply<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Self> {
        Self::encode(self.codec_type, value)
    }

    pub fn codec_type(&self) -> CodecType {
        self.codec_type
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
