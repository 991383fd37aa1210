//! Payload codec.
//!
//! Engines never see concrete payload types: they hand a `serde_json::Value`
//! to a `Serializer` together with a text encoding and get bytes back, and the
//! reverse on receive. Turning the value into the concrete type is the job of
//! the `MessageRegistration` captured at subscription time.

use encoding_rs::Encoding;
use serde_json::Value;

/// Encoding used when none is configured.
pub const DEFAULT_ENCODING: &str = "utf-8";

/// Errors produced by the codec.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Unknown text encoding '{0}'")]
    UnknownEncoding(String),

    #[error("Text encoding '{0}' can only be decoded")]
    DecodeOnly(String),

    #[error("Payload cannot be represented in {0}")]
    Unmappable(&'static str),

    #[error("Payload is not valid {0}")]
    Malformed(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolve an outbound encoding label (`utf-8`, `iso-8859-1`,
/// `windows-1252`, ...).
///
/// Labels that can only be decoded, such as UTF-16, are rejected.
pub fn resolve_encoding(label: &str) -> Result<&'static Encoding, SerializationError> {
    let encoding = Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| SerializationError::UnknownEncoding(label.to_string()))?;
    if encoding.output_encoding() != encoding {
        return Err(SerializationError::DecodeOnly(label.to_string()));
    }
    Ok(encoding)
}

/// Resolve an inbound content-encoding label, keeping decode-only encodings.
pub fn resolve_inbound_encoding(label: &str) -> Option<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
}

/// Codec contract: value + encoding in, bytes out, and back.
pub trait Serializer: Send + Sync {
    fn serialize(
        &self,
        value: &Value,
        encoding: &'static Encoding,
    ) -> Result<Vec<u8>, SerializationError>;

    fn deserialize(
        &self,
        bytes: &[u8],
        encoding: &'static Encoding,
    ) -> Result<Value, SerializationError>;
}

/// JSON text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(
        &self,
        value: &Value,
        encoding: &'static Encoding,
    ) -> Result<Vec<u8>, SerializationError> {
        let text = serde_json::to_string(value)?;
        let (bytes, used, unmappable) = encoding.encode(&text);
        if unmappable {
            return Err(SerializationError::Unmappable(used.name()));
        }
        Ok(bytes.into_owned())
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        encoding: &'static Encoding,
    ) -> Result<Value, SerializationError> {
        let (text, had_errors) = encoding.decode_without_bom_handling(bytes);
        if had_errors {
            return Err(SerializationError::Malformed(encoding.name()));
        }
        Ok(serde_json::from_str(&text)?)
    }
}
