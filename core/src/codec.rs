use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;

/// Deserialization scheme named in [`crate::config::ConsumerProperties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Integer,
    Long,
    String,
    Bytes,
    Json,
}

impl Codec {
    /// Name used for the `key.deserializer` / `value.deserializer` options.
    pub fn deserializer_name(&self) -> &'static str {
        match self {
            Codec::Integer => "integer",
            Codec::Long => "long",
            Codec::String => "string",
            Codec::Bytes => "bytes",
            Codec::Json => "json",
        }
    }
}

/// Decodes a raw record key or value.
///
/// Integers use the big-endian layout written by Kafka's integer serializers.
pub trait FromPayload: Sized {
    const CODEC: Codec;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl FromPayload for String {
    const CODEC: Codec = Codec::String;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Utf8 {
            reason: e.to_string(),
        })
    }
}

impl FromPayload for i32 {
    const CODEC: Codec = Codec::Integer;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; 4] = bytes.try_into().map_err(|_| CodecError::Size {
            type_name: "i32",
            expected: 4,
            actual: bytes.len(),
        })?;
        Ok(i32::from_be_bytes(raw))
    }
}

impl FromPayload for i64 {
    const CODEC: Codec = Codec::Long;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| CodecError::Size {
            type_name: "i64",
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}

impl FromPayload for Vec<u8> {
    const CODEC: Codec = Codec::Bytes;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl FromPayload for Value {
    const CODEC: Codec = Codec::Json;

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
