use bytes::Bytes;
use chatwire_relay::error::RelayError;
use chatwire_relay::protocol::canonical::{Termination, TokenUsage};
use chatwire_relay::stream::{
    MatcherPipeline, RelaySink, RewriteMatcher, SinkClosed, StreamRelay, StripMarkerMatcher,
};
use chatwire_relay::wire::{
    encode_frame, encode_message_payload, gzip_payload, DecodeError, FrameKind, UnitSource,
    MAX_FRAME_BYTES,
};

#[derive(Default)]
struct CollectingSink {
    deltas: Vec<String>,
    finished: Option<TokenUsage>,
    body: Option<String>,
    errors: Vec<String>,
}

impl RelaySink for CollectingSink {
    fn is_committed(&self) -> bool {
        !self.deltas.is_empty() || self.body.is_some() || !self.errors.is_empty()
    }

    fn emit_delta(&mut self, text: &str) -> Result<(), SinkClosed> {
        self.deltas.push(text.to_string());
        Ok(())
    }

    fn emit_finish(&mut self, usage: TokenUsage) {
        self.finished = Some(usage);
    }

    fn emit_body(&mut self, content: &str, _usage: TokenUsage) {
        self.body = Some(content.to_string());
    }

    fn emit_error(&mut self, err: &RelayError) {
        self.errors.push(err.to_string());
    }
}

fn wire(texts: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, text) in texts.iter().enumerate() {
        let payload = encode_message_payload(text);
        let payload = if index % 2 == 1 {
            gzip_payload(&payload)
        } else {
            payload
        };
        out.extend_from_slice(&encode_frame(FrameKind::MessagePayload, &payload));
    }
    out
}

fn source_from_chunks(bytes: &[u8], chunk_size: usize) -> UnitSource {
    let chunks: Vec<Result<Bytes, std::io::Error>> = bytes
        .chunks(chunk_size)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    UnitSource::from_byte_stream(futures_util::stream::iter(chunks))
}

#[tokio::test]
async fn chunk_boundaries_do_not_change_relayed_content() {
    let bytes = wire(&["alpha ", "beta ", "gamma"]);
    for chunk_size in [1, 2, 5, 7, 64, bytes.len()] {
        let mut units = source_from_chunks(&bytes, chunk_size);
        let mut sink = CollectingSink::default();
        let result = StreamRelay::new("m", true, 0)
            .run(&mut units, None, &mut MatcherPipeline::new(), &mut sink)
            .await;

        assert_eq!(result.terminated_by, Termination::Eof, "chunk size {chunk_size}");
        assert_eq!(result.content, "alpha beta gamma");
        assert_eq!(sink.deltas, vec!["alpha ", "beta ", "gamma"]);
        assert!(sink.finished.is_some());
    }
}

#[tokio::test]
async fn matchers_run_in_order_over_decoded_units() {
    let bytes = wire(&["Sure! [[END", "]] As an AI, ", "here it is."]);
    let mut units = source_from_chunks(&bytes, 3);
    let mut pipeline = MatcherPipeline::new()
        .with(StripMarkerMatcher::new("[[END]]"))
        .with(RewriteMatcher::new(r"As an AI,\s*", "").expect("pattern"));
    let mut sink = CollectingSink::default();

    let result = StreamRelay::new("m", false, 5)
        .run(&mut units, None, &mut pipeline, &mut sink)
        .await;

    assert_eq!(result.content, "Sure!  here it is.");
    assert_eq!(sink.body.as_deref(), Some("Sure!  here it is."));
    assert_eq!(result.usage.prompt_tokens, 5);
}

#[tokio::test]
async fn unknown_magic_aborts_with_single_error() {
    let mut bytes = wire(&["partial"]);
    bytes.extend_from_slice(&[7, 0, 0, 0, 1, b'x']);
    let mut units = source_from_chunks(&bytes, 4);
    let mut sink = CollectingSink::default();

    let result = StreamRelay::new("m", false, 0)
        .run(&mut units, None, &mut MatcherPipeline::new(), &mut sink)
        .await;

    assert_eq!(result.terminated_by, Termination::Errored);
    assert!(matches!(
        result.error,
        Some(RelayError::Decode(DecodeError::UnknownMagic(7)))
    ));
    assert_eq!(sink.errors.len(), 1);
    assert!(sink.body.is_none());
}

#[tokio::test]
async fn oversized_frame_header_is_rejected_before_buffering() {
    let len = u32::try_from(MAX_FRAME_BYTES + 1).expect("fits u32");
    let mut bytes = vec![1];
    bytes.extend_from_slice(&len.to_be_bytes());
    let mut units = source_from_chunks(&bytes, bytes.len());
    let mut sink = CollectingSink::default();

    let result = StreamRelay::new("m", true, 0)
        .run(&mut units, None, &mut MatcherPipeline::new(), &mut sink)
        .await;

    assert!(matches!(
        result.error,
        Some(RelayError::Decode(DecodeError::FrameTooLarge(_)))
    ));
    assert_eq!(sink.errors.len(), 1);
}

#[tokio::test]
async fn clean_end_frame_stops_before_trailing_bytes() {
    let mut bytes = wire(&["done"]);
    bytes.extend_from_slice(&encode_frame(FrameKind::ErrorPayload, b"{}"));
    bytes.extend_from_slice(&[9, 9, 9]);
    let mut units = source_from_chunks(&bytes, 2);
    let mut sink = CollectingSink::default();

    let result = StreamRelay::new("m", false, 0)
        .run(&mut units, None, &mut MatcherPipeline::new(), &mut sink)
        .await;

    assert_eq!(result.terminated_by, Termination::Eof);
    assert_eq!(result.content, "done");
    assert!(sink.errors.is_empty());
}
