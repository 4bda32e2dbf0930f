use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info_span, warn, Instrument};

use crate::error::RelayError;
use crate::fc::{maybe_handle_tool, no_backend_for, ToolCallReporter};
use crate::history::{compact, CompactedHistory};
use crate::protocol::canonical::{
    CanonicalMessage, ChatRequest, DetectedToolCall, RoleBucket, StreamUnit, TokenUsage, TurnRole,
};
use crate::protocol::openai_chat::decoder::decode_openai_chat_request;
use crate::protocol::openai_chat::response_encoder::{
    encode_chat_response, encode_content_chunk, encode_finish_chunk, encode_tool_calls_chunk,
    CompletionMeta, FINISH_STOP, FINISH_TOOL_CALLS,
};
use crate::protocol::openai_chat::{OpenAiChatRequest, OpenAiChatResponse, OpenAiStreamChunk};
use crate::state::AppState;
use crate::stream::sse::{done_frame, openai_sse_frame};
use crate::stream::{MatcherPipeline, RelayControl, RelaySink, SinkClosed, StreamRelay};
use crate::transport::{BackendRequest, BackendTransport};
use crate::util::{next_completion_id, unix_now_secs};
use crate::wire::UnitSource;

const ECHO_TOOLS_SEPARATOR: &str = "\n----------toolCallMessages----------\n";
const EMPTY_RESULT_MESSAGE: &str = "backend returned an empty response";

/// How the HTTP response starts; decided by the first emission.
enum Head {
    Stream(mpsc::UnboundedReceiver<Bytes>),
    Json(Bytes),
    Error(RelayError),
}

/// `POST /v1/chat/completions`.
///
/// The relay runs on its own task; this handler waits only for the response
/// head. If the client goes away before that, the relay is told to stop.
pub async fn handler(state: Arc<AppState>, body: Bytes) -> Response {
    let wire: OpenAiChatRequest = match serde_json::from_slice(&body) {
        Ok(wire) => wire,
        Err(err) => {
            return RelayError::InvalidRequest(format!("invalid JSON body: {err}")).into_response();
        }
    };
    let request = match decode_openai_chat_request(wire) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let meta = CompletionMeta {
        id: next_completion_id(),
        model: request.model.clone(),
        created: unix_now_secs(),
    };
    let (writer, head) = ResponseWriter::new(meta, request.stream);
    let (control_tx, control_rx) = mpsc::channel(1);
    let mut stop_on_drop = StopOnDrop(Some(control_tx));
    let span = info_span!("chat", request_id = %state.next_request_id(), model = %request.model);
    tokio::spawn(run_chat(state, request, writer, control_rx).instrument(span));

    let response = match head.await {
        Ok(Head::Stream(chunks)) => sse_ok_response(chunks),
        Ok(Head::Json(body)) => ok_json_response(body),
        Ok(Head::Error(err)) => err.into_response(),
        Err(_) => empty_result_response(),
    };
    stop_on_drop.disarm();
    response
}

async fn run_chat(
    state: Arc<AppState>,
    request: ChatRequest,
    mut writer: ResponseWriter,
    mut control: mpsc::Receiver<RelayControl>,
) {
    let features = &state.config.features;
    let history = compact(&request.turns);
    debug!(
        model = %request.model,
        messages = history.messages.len(),
        prompt_tokens = history.prompt_tokens,
        standalone = history.standalone,
        "compacted conversation"
    );

    let mut pipeline = match MatcherPipeline::from_features(features) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            writer.emit_error(&err);
            return;
        }
    };

    let backend = state.config.backend_for_model(&request.model);
    if maybe_handle_tool(
        &request,
        &history,
        backend,
        features,
        &state.transport,
        &mut writer,
    )
    .await
    {
        return;
    }

    let mut units = if features.echo {
        UnitSource::from_units(vec![StreamUnit::Content(render_echo(&request, &history))])
    } else {
        let Some(backend) = backend else {
            writer.emit_error(&no_backend_for(&request.model));
            return;
        };
        let backend_request = BackendRequest {
            model: request.model.clone(),
            messages: history.messages.clone(),
            prompt: history.trailing_prompt.clone(),
            stream: request.stream,
        };
        match state.transport.open(backend, backend_request).await {
            Ok(units) => units,
            Err(err) => {
                warn!(model = %request.model, backend = %backend.name, error = %err, "backend request failed");
                writer.emit_error(&err);
                return;
            }
        }
    };

    StreamRelay::new(request.model.as_str(), request.stream, history.prompt_tokens)
        .run(&mut units, Some(&mut control), &mut pipeline, &mut writer)
        .await;
}

/// Echo-mode body: the conversation as the backend would see it, then the
/// declared tools.
fn render_echo(request: &ChatRequest, history: &CompactedHistory) -> String {
    let mut content = match request.turns.as_slice() {
        [system, user] if system.role == TurnRole::System => {
            format!("{}\n\n{}", system.content, user.content)
        }
        _ => {
            let mut messages = history.messages.clone();
            messages.push(CanonicalMessage {
                bucket: RoleBucket::User,
                content: history.trailing_prompt.clone(),
            });
            serde_json::to_string_pretty(&messages).unwrap_or_default()
        }
    };

    if !request.tools.is_empty() {
        let tools: Vec<serde_json::Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect();
        content.push_str(ECHO_TOOLS_SEPARATOR);
        content.push_str(&serde_json::to_string_pretty(&tools).unwrap_or_default());
    }
    content
}

/// Sends `Stop` to the relay unless disarmed once the response head is out.
struct StopOnDrop(Option<mpsc::Sender<RelayControl>>);

impl StopOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if let Some(control) = self.0.take() {
            let _ = control.try_send(RelayControl::Stop);
        }
    }
}

/// Relay sink writing OpenAI-shaped output to the waiting handler.
struct ResponseWriter {
    meta: CompletionMeta,
    streaming: bool,
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::UnboundedSender<Bytes>>,
}

impl ResponseWriter {
    fn new(meta: CompletionMeta, streaming: bool) -> (Self, oneshot::Receiver<Head>) {
        let (head_tx, head_rx) = oneshot::channel();
        (
            Self {
                meta,
                streaming,
                head: Some(head_tx),
                body: None,
            },
            head_rx,
        )
    }

    fn commit(&mut self, head: Head) -> Result<(), SinkClosed> {
        let sender = self.head.take().ok_or(SinkClosed)?;
        sender.send(head).map_err(|_| SinkClosed)
    }

    fn send_chunk(&mut self, chunk: &OpenAiStreamChunk) -> Result<(), SinkClosed> {
        let json = serde_json::to_string(chunk).map_err(|err| {
            error!(error = %err, "failed to encode stream chunk");
            SinkClosed
        })?;
        if self.head.is_some() {
            let (body_tx, body_rx) = mpsc::unbounded_channel();
            self.commit(Head::Stream(body_rx))?;
            self.body = Some(body_tx);
        }
        let body = self.body.as_ref().ok_or(SinkClosed)?;
        body.send(openai_sse_frame(&json)).map_err(|_| SinkClosed)
    }

    fn finish_stream(&mut self, finish_reason: &str, usage: TokenUsage) {
        let chunk = encode_finish_chunk(&self.meta, finish_reason, usage);
        if self.send_chunk(&chunk).is_err() {
            return;
        }
        if let Some(body) = self.body.take() {
            let _ = body.send(done_frame());
        }
    }

    fn send_json(&mut self, response: &OpenAiChatResponse) {
        let head = match serde_json::to_vec(response) {
            Ok(body) => Head::Json(Bytes::from(body)),
            Err(err) => Head::Error(RelayError::Internal(format!(
                "failed to encode response: {err}"
            ))),
        };
        let _ = self.commit(head);
    }
}

impl RelaySink for ResponseWriter {
    fn is_committed(&self) -> bool {
        self.head.is_none()
    }

    fn emit_delta(&mut self, text: &str) -> Result<(), SinkClosed> {
        let chunk = encode_content_chunk(&self.meta, text);
        self.send_chunk(&chunk)
    }

    fn emit_finish(&mut self, usage: TokenUsage) {
        self.finish_stream(FINISH_STOP, usage);
    }

    fn emit_body(&mut self, content: &str, usage: TokenUsage) {
        let response = encode_chat_response(&self.meta, Some(content), &[], usage);
        self.send_json(&response);
    }

    fn emit_error(&mut self, err: &RelayError) {
        let _ = self.commit(Head::Error(err.clone()));
    }
}

impl ToolCallReporter for ResponseWriter {
    fn report_tool_calls(&mut self, calls: Vec<DetectedToolCall>, usage: TokenUsage) {
        if self.streaming {
            let chunk = encode_tool_calls_chunk(&self.meta, &calls);
            if self.send_chunk(&chunk).is_ok() {
                self.finish_stream(FINISH_TOOL_CALLS, usage);
            }
        } else {
            let response = encode_chat_response(&self.meta, None, &calls, usage);
            self.send_json(&response);
        }
    }

    fn report_error(&mut self, err: &RelayError) {
        if self.is_committed() {
            error!(error = %err, "tool round-trip error after response was committed");
        } else {
            self.emit_error(err);
        }
    }
}

fn sse_ok_response(mut chunks: mpsc::UnboundedReceiver<Bytes>) -> Response {
    let stream = futures_util::stream::poll_fn(move |cx| {
        chunks
            .poll_recv(cx)
            .map(|chunk| chunk.map(Ok::<Bytes, Infallible>))
    });
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

fn ok_json_response(body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    response
}

fn empty_result_response() -> Response {
    let body = json!({
        "error": {
            "message": EMPTY_RESULT_MESSAGE,
            "type": "upstream_error",
            "code": 502,
        }
    });
    (http::StatusCode::BAD_GATEWAY, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{ConversationTurn, ToolChoice, ToolSpec};
    use crate::stream::sse::collect_sse_data;

    fn meta() -> CompletionMeta {
        CompletionMeta {
            id: "chatcmpl-test".to_string(),
            model: "m".to_string(),
            created: 1,
        }
    }

    fn request(turns: Vec<ConversationTurn>, tools: Vec<ToolSpec>) -> ChatRequest {
        ChatRequest {
            model: "m".to_string(),
            stream: false,
            turns,
            tools,
            tool_choice: ToolChoice::Auto,
        }
    }

    async fn drain(mut chunks: mpsc::UnboundedReceiver<Bytes>) -> String {
        let mut out = String::new();
        while let Some(chunk) = chunks.recv().await {
            out.push_str(&String::from_utf8_lossy(&chunk));
        }
        out
    }

    #[test]
    fn echo_joins_system_user_pair() {
        let turns = vec![
            ConversationTurn::new(TurnRole::System, "be brief"),
            ConversationTurn::new(TurnRole::User, "hi"),
        ];
        let request = request(turns.clone(), Vec::new());
        assert_eq!(render_echo(&request, &compact(&turns)), "be brief\n\nhi");
    }

    #[test]
    fn echo_lists_messages_and_tools() {
        let turns = vec![
            ConversationTurn::new(TurnRole::User, "a"),
            ConversationTurn::new(TurnRole::Assistant, "b"),
            ConversationTurn::new(TurnRole::User, "c"),
        ];
        let tools = vec![ToolSpec {
            name: "lookup".to_string(),
            description: None,
            parameters: json!({"type": "object"}),
        }];
        let request = request(turns.clone(), tools);
        let echo = render_echo(&request, &compact(&turns));

        let (messages, tools) = echo.split_once(ECHO_TOOLS_SEPARATOR).expect("separator");
        let messages: serde_json::Value = serde_json::from_str(messages).expect("messages json");
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"], "b");
        assert_eq!(messages[2]["content"], "c");
        let tools: serde_json::Value = serde_json::from_str(tools).expect("tools json");
        assert_eq!(tools[0]["name"], "lookup");
    }

    #[tokio::test]
    async fn streaming_writer_commits_on_first_delta() {
        let (mut writer, head) = ResponseWriter::new(meta(), true);
        assert!(!writer.is_committed());
        writer.emit_delta("Hel").expect("delta");
        writer.emit_delta("lo").expect("delta");
        writer.emit_finish(TokenUsage::new(3, 1));
        assert!(writer.is_committed());
        drop(writer);

        let Ok(Head::Stream(chunks)) = head.await else {
            panic!("expected stream head");
        };
        let events = collect_sse_data(&drain(chunks).await);
        assert_eq!(events.len(), 4);
        let first: serde_json::Value = serde_json::from_str(&events[0]).expect("chunk");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
        let finish: serde_json::Value = serde_json::from_str(&events[2]).expect("chunk");
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["total_tokens"], 4);
        assert_eq!(events[3], "[DONE]");
    }

    #[tokio::test]
    async fn dropped_stream_receiver_closes_sink() {
        let (mut writer, head) = ResponseWriter::new(meta(), true);
        writer.emit_delta("a").expect("delta");
        drop(head.await);
        assert_eq!(writer.emit_delta("b"), Err(SinkClosed));
    }

    #[tokio::test]
    async fn buffered_tool_calls_use_tool_calls_finish_reason() {
        let (mut writer, head) = ResponseWriter::new(meta(), false);
        writer.report_tool_calls(
            vec![DetectedToolCall {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                arguments: "{}".to_string(),
            }],
            TokenUsage::new(1, 1),
        );

        let Ok(Head::Json(body)) = head.await else {
            panic!("expected json head");
        };
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(body["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(body["choices"][0]["message"]["tool_calls"][0]["function"]["name"], "lookup");
    }

    #[tokio::test]
    async fn error_after_commit_is_not_reported() {
        let (mut writer, head) = ResponseWriter::new(meta(), false);
        writer.emit_body("done", TokenUsage::default());
        writer.report_error(&RelayError::Internal("late".to_string()));
        assert!(matches!(head.await, Ok(Head::Json(_))));
    }
}
