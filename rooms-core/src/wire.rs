//! Payload codec: one JSON document per data-channel message.

use crate::protocol::Payload;

const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode a payload into a single data-channel message.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, PayloadEncodeError> {
    let bytes = serde_json::to_vec(payload).map_err(PayloadEncodeError::Encode)?;
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(PayloadEncodeError::TooLarge);
    }
    Ok(bytes)
}

/// Error encoding a payload (serializer or size limit).
#[derive(Debug, thiserror::Error)]
pub enum PayloadEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("payload too large")]
    TooLarge,
}

/// Decode one payload. Rejects anything without a known `type` discriminant
/// and a numeric `timestamp`.
pub fn decode_payload(bytes: &[u8]) -> Result<Payload, PayloadDecodeError> {
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(PayloadDecodeError::TooLarge);
    }
    serde_json::from_slice(bytes).map_err(PayloadDecodeError::Malformed)
}

/// Error decoding a payload (too large or not a well-formed payload).
#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("payload too large")]
    TooLarge,
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),
}
