//! Payload serialization for fan-out.
//!
//! A group encodes each payload exactly once and hands the same [`Bytes`] to
//! every recipient, so the codec is a group-wide setting rather than a
//! per-session one.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Wire encoding of application payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// JSON text.
    #[default]
    Json,
    /// CBOR binary.
    Cbor,
}

impl Codec {
    /// Encode `value` into a shareable buffer.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| CodecError::Encode(e.to_string())),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
                Ok(Bytes::from(buf))
            },
        }
    }

    /// Decode a value previously produced by [`Codec::encode`].
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string())),
            Self::Cbor => ciborium::from_reader(data).map_err(|e| CodecError::Decode(e.to_string())),
        }
    }
}

/// Payload serialization errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes did not decode into the requested type.
    #[error("decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        name: String,
        content: String,
    }

    #[test]
    fn json_is_plain_text() {
        let chat = Chat { name: "ada".into(), content: "hi".into() };
        let bytes = Codec::Json.encode(&chat).unwrap();

        assert_eq!(&bytes[..], br#"{"name":"ada","content":"hi"}"#);
        assert_eq!(Codec::Json.decode::<Chat>(&bytes).unwrap(), chat);
    }

    #[test]
    fn cbor_decodes_what_it_encodes() {
        let chat = Chat { name: "ada".into(), content: "hi".into() };
        let bytes = Codec::Cbor.encode(&chat).unwrap();

        assert_eq!(Codec::Cbor.decode::<Chat>(&bytes).unwrap(), chat);
    }

    #[test]
    fn json_rejects_non_string_map_keys() {
        let mut map = BTreeMap::new();
        map.insert((1u8, 2u8), "tuple key");

        assert!(matches!(Codec::Json.encode(&map), Err(CodecError::Encode(_))));
    }

    #[test]
    fn decode_reports_malformed_input() {
        assert!(matches!(Codec::Json.decode::<Chat>(b"{"), Err(CodecError::Decode(_))));
        assert!(matches!(Codec::Cbor.decode::<Chat>(&[0xff]), Err(CodecError::Decode(_))));
    }
}
