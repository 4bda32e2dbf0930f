//! Backend wire decoding: binary framing, payload decoding and the nested
//! error envelope carried by error frames.
//!
//! Frame layout: `magic:u8 | length:u32 (big-endian) | payload[length]`.
//! `magic == 1` is a message frame (optionally gzip, then protobuf with a
//! single text field), `magic == 3` is an error frame (optionally gzip, then
//! JSON). A literal `{}` payload is a heartbeat on message frames and a clean
//! end-of-stream on error frames.

pub mod error_chain;
pub mod frame;
pub mod payload;
pub mod source;

pub use error_chain::{describe_error_payload, ErrorCause, ErrorEnvelope, ErrorLeaf};
pub use frame::{encode_frame, Frame, FrameDecoder, FrameKind};
pub use payload::{decode_frame, encode_message_payload, gzip_payload, MessagePayload};
pub use source::{UnitSender, UnitSource};

/// Largest declared frame length or decompressed payload size accepted (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Failure while turning backend bytes into stream units. Terminal for the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown frame magic byte {0:#04x}")]
    UnknownMagic(u8),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),
    #[error("stream ended inside a frame: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },
    #[error("gzip decompression failed: {0}")]
    Gzip(String),
    #[error("protobuf payload decode failed: {0}")]
    Protobuf(String),
    #[error("error payload is not valid JSON: {0}")]
    ErrorPayload(String),
    #[error("backend byte stream failed: {0}")]
    Io(String),
}
