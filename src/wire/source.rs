use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::frame::FrameDecoder;
use super::payload::decode_frame;
use super::DecodeError;
use crate::protocol::canonical::StreamUnit;

const UNIT_QUEUE_CAPACITY: usize = 64;

type UnitItem = Result<StreamUnit, DecodeError>;

/// Queue of decoded units for one backend response.
///
/// Owns the task reading the backend body. Closing (or dropping) the source
/// aborts that task, which drops the byte stream and releases the connection
/// without reading it to completion.
pub struct UnitSource {
    receiver: mpsc::Receiver<UnitItem>,
    reader: Option<JoinHandle<()>>,
    finished: bool,
}

/// Producer half for backends that push already-decoded units.
#[derive(Clone)]
pub struct UnitSender {
    sender: mpsc::Sender<UnitItem>,
}

impl UnitSender {
    /// Push a unit. Returns `false` once the consumer is gone.
    pub async fn send(&self, unit: StreamUnit) -> bool {
        self.sender.send(Ok(unit)).await.is_ok()
    }

    /// Push a decode failure. Returns `false` once the consumer is gone.
    pub async fn fail(&self, err: DecodeError) -> bool {
        self.sender.send(Err(err)).await.is_ok()
    }
}

impl UnitSource {
    /// Spawn a reader task decoding a framed backend byte stream.
    pub fn from_byte_stream<S, B, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel(UNIT_QUEUE_CAPACITY);
        let reader = tokio::spawn(read_frames(byte_stream, sender));
        Self {
            receiver,
            reader: Some(reader),
            finished: false,
        }
    }

    /// Create a source fed through a [`UnitSender`].
    #[must_use]
    pub fn channel() -> (UnitSender, Self) {
        let (sender, receiver) = mpsc::channel(UNIT_QUEUE_CAPACITY);
        (
            UnitSender { sender },
            Self {
                receiver,
                reader: None,
                finished: false,
            },
        )
    }

    /// Source yielding a fixed list of units followed by `End`.
    #[must_use]
    pub fn from_units(units: Vec<StreamUnit>) -> Self {
        let (sender, receiver) = mpsc::channel(units.len() + 1);
        for unit in units {
            let _ = sender.try_send(Ok(unit));
        }
        let _ = sender.try_send(Ok(StreamUnit::End));
        Self {
            receiver,
            reader: None,
            finished: false,
        }
    }

    /// Wait for the next unit.
    ///
    /// A closed queue is reported as `End`; after `End` or an error the
    /// source yields `None`.
    pub async fn next_unit(&mut self) -> Option<UnitItem> {
        if self.finished {
            return None;
        }
        let item = self.receiver.recv().await.unwrap_or(Ok(StreamUnit::End));
        if matches!(item, Ok(StreamUnit::End) | Err(_)) {
            self.finished = true;
        }
        Some(item)
    }

    /// Stop reading and release the backend stream.
    pub fn close(&mut self) {
        self.finished = true;
        self.receiver.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl Drop for UnitSource {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_frames<S, B, E>(byte_stream: S, sender: mpsc::Sender<UnitItem>)
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let mut byte_stream = std::pin::pin!(byte_stream);
    let mut decoder = FrameDecoder::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = sender.send(Err(DecodeError::Io(err.to_string()))).await;
                return;
            }
        };
        decoder.feed(chunk.as_ref());

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    let _ = sender.send(Err(err)).await;
                    return;
                }
            };
            let unit = match decode_frame(&frame) {
                Ok(Some(unit)) => unit,
                Ok(None) => continue,
                Err(err) => {
                    let _ = sender.send(Err(err)).await;
                    return;
                }
            };
            let is_end = unit == StreamUnit::End;
            if sender.send(Ok(unit)).await.is_err() || is_end {
                return;
            }
        }
    }

    let last = match decoder.finish() {
        Ok(()) => Ok(StreamUnit::End),
        Err(err) => Err(err),
    };
    tracing::debug!(frames = decoder.frames_decoded(), "backend stream exhausted");
    let _ = sender.send(last).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_frame, encode_message_payload, gzip_payload, FrameKind};
    use bytes::Bytes;

    fn byte_source(chunks: Vec<Bytes>) -> UnitSource {
        UnitSource::from_byte_stream(futures_util::stream::iter(
            chunks
                .into_iter()
                .map(Ok::<Bytes, std::convert::Infallible>),
        ))
    }

    async fn drain(source: &mut UnitSource) -> Vec<UnitItem> {
        let mut items = Vec::new();
        while let Some(item) = source.next_unit().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn decodes_units_in_order_and_skips_heartbeats() {
        let mut wire = encode_frame(
            FrameKind::MessagePayload,
            &encode_message_payload("Hi"),
        )
        .to_vec();
        wire.extend_from_slice(&encode_frame(FrameKind::MessagePayload, b"{}"));
        wire.extend_from_slice(&encode_frame(
            FrameKind::MessagePayload,
            &gzip_payload(&encode_message_payload("!")),
        ));
        let (head, tail) = wire.split_at(7);
        let mut source = byte_source(vec![Bytes::copy_from_slice(head), Bytes::copy_from_slice(tail)]);

        let items = drain(&mut source).await;
        assert_eq!(
            items,
            vec![
                Ok(StreamUnit::Content("Hi".to_string())),
                Ok(StreamUnit::Content("!".to_string())),
                Ok(StreamUnit::End),
            ]
        );
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_decode_error() {
        let wire = encode_frame(FrameKind::MessagePayload, &encode_message_payload("hello"));
        let mut source = byte_source(vec![wire.slice(..wire.len() - 2)]);

        let items = drain(&mut source).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(DecodeError::Truncated { .. })));
    }

    #[tokio::test]
    async fn empty_error_frame_ends_stream_before_trailing_frames() {
        let mut wire = encode_frame(FrameKind::ErrorPayload, b"{}").to_vec();
        wire.extend_from_slice(&encode_frame(
            FrameKind::MessagePayload,
            &encode_message_payload("late"),
        ));
        let mut source = byte_source(vec![Bytes::from(wire)]);

        assert_eq!(drain(&mut source).await, vec![Ok(StreamUnit::End)]);
    }

    #[tokio::test]
    async fn channel_source_reports_closed_queue_as_end() {
        let (sender, mut source) = UnitSource::channel();
        assert!(sender.send(StreamUnit::Content("a".to_string())).await);
        drop(sender);

        assert_eq!(
            drain(&mut source).await,
            vec![Ok(StreamUnit::Content("a".to_string())), Ok(StreamUnit::End)]
        );
    }
}
