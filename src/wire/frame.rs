use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{DecodeError, MAX_FRAME_BYTES};

const HEADER_LEN: usize = 5;
const MAGIC_MESSAGE: u8 = 1;
const MAGIC_ERROR: u8 = 3;

/// Payload kind announced by a frame's magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    MessagePayload,
    ErrorPayload,
}

impl FrameKind {
    fn from_magic(magic: u8) -> Result<Self, DecodeError> {
        match magic {
            MAGIC_MESSAGE => Ok(FrameKind::MessagePayload),
            MAGIC_ERROR => Ok(FrameKind::ErrorPayload),
            other => Err(DecodeError::UnknownMagic(other)),
        }
    }

    #[must_use]
    pub fn magic(self) -> u8 {
        match self {
            FrameKind::MessagePayload => MAGIC_MESSAGE,
            FrameKind::ErrorPayload => MAGIC_ERROR,
        }
    }
}

/// One complete wire frame, payload still encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Bytes,
}

impl Frame {
    #[must_use]
    pub fn length(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    kind: FrameKind,
    length: usize,
}

/// Incremental frame decoder.
///
/// Feed it byte chunks as they arrive, then call [`FrameDecoder::next_frame`]
/// until it returns `Ok(None)`. Chunk boundaries never matter: the header is
/// only inspected once all five header bytes are buffered, and a frame is
/// only extracted once its whole payload is buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    pending: Option<FrameHeader>,
    frames: u64,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            pending: None,
            frames: 0,
        }
    }

    /// Append raw bytes read from the backend.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of frames extracted so far.
    #[must_use]
    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }

    /// Advance the decoder by at most one frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::UnknownMagic`] for a header with an unsupported
    /// magic byte and [`DecodeError::FrameTooLarge`] when the declared length
    /// exceeds [`MAX_FRAME_BYTES`].
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if self.buffer.len() < HEADER_LEN {
                    return Ok(None);
                }
                let kind = FrameKind::from_magic(self.buffer[0])?;
                let length = u32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;
                if length > MAX_FRAME_BYTES {
                    return Err(DecodeError::FrameTooLarge(length));
                }
                self.buffer.advance(HEADER_LEN);
                let header = FrameHeader { kind, length };
                self.pending = Some(header);
                header
            }
        };

        if self.buffer.len() < header.length {
            return Ok(None);
        }

        self.pending = None;
        self.frames += 1;
        Ok(Some(Frame {
            kind: header.kind,
            bytes: self.buffer.split_to(header.length).freeze(),
        }))
    }

    /// Check the decoder state once the byte stream is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] when a partial header or payload is
    /// still buffered.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.pending {
            Some(header) => Err(DecodeError::Truncated {
                expected: header.length,
                available: self.buffer.len(),
            }),
            None if !self.buffer.is_empty() => Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                available: self.buffer.len(),
            }),
            None => Ok(()),
        }
    }
}

/// Encode one frame in wire layout.
#[must_use]
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(kind.magic());
    out.put_u32(u32::try_from(payload.len()).unwrap_or(u32::MAX));
    out.extend_from_slice(payload);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frame_split_at_every_byte() {
        let wire = encode_frame(FrameKind::MessagePayload, b"abcdef");
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire.iter() {
            decoder.feed(&[*byte]);
            while let Some(frame) = decoder.next_frame().expect("decode") {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::MessagePayload);
        assert_eq!(frames[0].bytes.as_ref(), b"abcdef");
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn decodes_multiple_frames_from_one_chunk() {
        let mut wire = encode_frame(FrameKind::MessagePayload, b"one").to_vec();
        wire.extend_from_slice(&encode_frame(FrameKind::ErrorPayload, b"{}"));
        let mut decoder = FrameDecoder::new();
        decoder.feed(&wire);

        let first = decoder.next_frame().expect("decode").expect("first frame");
        let second = decoder.next_frame().expect("decode").expect("second frame");
        assert_eq!(first.bytes.as_ref(), b"one");
        assert_eq!(second.kind, FrameKind::ErrorPayload);
        assert_eq!(second.length(), 2);
        assert!(decoder.next_frame().expect("decode").is_none());
        assert_eq!(decoder.frames_decoded(), 2);
    }

    #[test]
    fn header_waits_for_five_bytes() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[1, 0, 0, 0]);
        assert!(decoder.next_frame().expect("decode").is_none());
        decoder.feed(&[0]);
        let frame = decoder.next_frame().expect("decode").expect("empty frame");
        assert_eq!(frame.length(), 0);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[2, 0, 0, 0, 1, b'x']);
        assert_eq!(decoder.next_frame(), Err(DecodeError::UnknownMagic(2)));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[1, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            decoder.next_frame(),
            Err(DecodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn truncated_payload_is_reported_on_finish() {
        let wire = encode_frame(FrameKind::MessagePayload, b"abcdef");
        let mut decoder = FrameDecoder::new();
        decoder.feed(&wire[..8]);
        assert!(decoder.next_frame().expect("decode").is_none());
        assert_eq!(
            decoder.finish(),
            Err(DecodeError::Truncated {
                expected: 6,
                available: 3
            })
        );
    }

    #[test]
    fn truncated_header_is_reported_on_finish() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[1, 0]);
        assert!(decoder.next_frame().expect("decode").is_none());
        assert!(matches!(
            decoder.finish(),
            Err(DecodeError::Truncated { expected: 5, .. })
        ));
    }
}
