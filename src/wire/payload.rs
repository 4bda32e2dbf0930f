use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;

use super::frame::{Frame, FrameKind};
use super::{DecodeError, MAX_FRAME_BYTES};
use crate::protocol::canonical::StreamUnit;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const EMPTY_OBJECT: &[u8] = b"{}";

/// Protobuf body of a message frame.
#[derive(Clone, PartialEq, Message)]
pub struct MessagePayload {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[inline]
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    GzDecoder::new(bytes)
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|err| DecodeError::Gzip(err.to_string()))?;
    if out.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::FrameTooLarge(out.len()));
    }
    Ok(out)
}

fn decompressed(bytes: &Bytes) -> Result<Bytes, DecodeError> {
    if is_gzip(bytes) {
        gunzip(bytes).map(Bytes::from)
    } else {
        Ok(bytes.clone())
    }
}

/// Convert one frame into a stream unit.
///
/// Returns `Ok(None)` for heartbeats and empty message frames, which carry
/// nothing for the relay.
///
/// # Errors
///
/// Returns [`DecodeError::Gzip`], [`DecodeError::Protobuf`] or
/// [`DecodeError::ErrorPayload`] when the payload cannot be decoded.
pub fn decode_frame(frame: &Frame) -> Result<Option<StreamUnit>, DecodeError> {
    let payload = decompressed(&frame.bytes)?;
    let is_empty_object = payload.as_ref() == EMPTY_OBJECT;

    match frame.kind {
        FrameKind::MessagePayload => {
            if is_empty_object {
                return Ok(None);
            }
            let message = MessagePayload::decode(payload)
                .map_err(|err| DecodeError::Protobuf(err.to_string()))?;
            if message.message.is_empty() || message.message.as_bytes() == EMPTY_OBJECT {
                return Ok(None);
            }
            Ok(Some(StreamUnit::Content(message.message)))
        }
        FrameKind::ErrorPayload => {
            if is_empty_object {
                return Ok(Some(StreamUnit::End));
            }
            serde_json::from_slice::<serde::de::IgnoredAny>(&payload)
                .map_err(|err| DecodeError::ErrorPayload(err.to_string()))?;
            Ok(Some(StreamUnit::ErrorNotice(
                String::from_utf8_lossy(&payload).into_owned(),
            )))
        }
    }
}

/// Gzip-compress a payload the way backends do for large frames.
#[must_use]
pub fn gzip_payload(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2 + 32), Compression::fast());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(bytes);
    encoder.finish().unwrap_or_default()
}

/// Protobuf-encode a message payload.
#[must_use]
pub fn encode_message_payload(text: &str) -> Vec<u8> {
    MessagePayload {
        message: text.to_string(),
    }
    .encode_to_vec()
}
