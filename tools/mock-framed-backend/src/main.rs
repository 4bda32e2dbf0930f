use std::convert::Infallible;
use std::env;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use prost::Message;
use tokio::net::TcpListener;

const DEFAULT_BACKEND_PORT: u16 = 19_101;
const MESSAGE_MAGIC: u8 = 1;
const ERROR_MAGIC: u8 = 3;

#[derive(Clone, PartialEq, Message)]
struct MessagePayload {
    #[prost(string, tag = "1")]
    message: String,
}

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Gzip,
    Tool,
    Error,
    Rejected,
}

struct MockState {
    scenario: MockScenario,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("BACKEND_PORT", DEFAULT_BACKEND_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock backend on 127.0.0.1:{port}: {err}"));
    let conn_builder = AutoBuilder::new(TokioExecutor::new());

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock backend connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("gzip") => MockScenario::Gzip,
        Ok("tool") => MockScenario::Tool,
        Ok("error") => MockScenario::Error,
        Ok("rejected") => MockScenario::Rejected,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &MockState) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let body_len = collect_body_len(body).await;
    let seq = state.requests.fetch_add(1, Ordering::Relaxed) + 1;
    eprintln!("request #{seq}: {} {} ({body_len} bytes)", parts.method, parts.uri.path());

    if parts.method != Method::POST {
        return simple_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            Bytes::from_static(br#"{"error":"method_not_allowed"}"#),
        );
    }

    match state.scenario {
        MockScenario::Rejected => simple_response(
            StatusCode::TOO_MANY_REQUESTS,
            "application/json",
            Bytes::from_static(br#"{"error":"mock_rate_limited"}"#),
        ),
        MockScenario::Text => framed_response(&text_frames(false)),
        MockScenario::Gzip => framed_response(&text_frames(true)),
        MockScenario::Tool => framed_response(&tool_frames()),
        MockScenario::Error => framed_response(&error_frames()),
    }
}

async fn collect_body_len(body: Incoming) -> usize {
    match body.collect().await {
        Ok(collected) => collected.to_bytes().len(),
        Err(_) => 0,
    }
}

fn text_frames(gzip: bool) -> Vec<Bytes> {
    let mut frames = vec![heartbeat()];
    for (index, text) in ["Hello", " from", " the mock backend."].iter().enumerate() {
        frames.push(message_frame(text, gzip && index % 2 == 0));
    }
    frames.push(end_frame());
    frames
}

fn tool_frames() -> Vec<Bytes> {
    let trigger = env::var("MOCK_TRIGGER").unwrap_or_else(|_| "<Function_Mock_Start/>".to_string());
    let directive = format!(
        "{trigger}\n<function_calls>\n    <function_call>\n        <tool>get_weather</tool>\n        <args_json><![CDATA[{{\"city\":\"Paris\"}}]]></args_json>\n    </function_call>\n</function_calls>"
    );
    vec![
        message_frame("Let me check.\n", false),
        message_frame(&directive, true),
        end_frame(),
    ]
}

fn error_frames() -> Vec<Bytes> {
    let payload = br#"{"error":{"code":"resource_exhausted","message":"request failed","details":[{"debug":{"wrapper":{"message":"outer","cause":{"leaf":{"message":"quota exceeded"}}}}}]}}"#;
    vec![
        message_frame("partial", false),
        frame(ERROR_MAGIC, payload),
    ]
}

fn heartbeat() -> Bytes {
    frame(MESSAGE_MAGIC, b"{}")
}

fn end_frame() -> Bytes {
    frame(ERROR_MAGIC, b"{}")
}

fn message_frame(text: &str, gzip: bool) -> Bytes {
    let payload = MessagePayload {
        message: text.to_string(),
    }
    .encode_to_vec();
    if gzip {
        frame(MESSAGE_MAGIC, &gzip_bytes(&payload))
    } else {
        frame(MESSAGE_MAGIC, &payload)
    }
}

fn gzip_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    if encoder.write_all(bytes).is_err() {
        return bytes.to_vec();
    }
    encoder.finish().unwrap_or_else(|_| bytes.to_vec())
}

fn frame(magic: u8, payload: &[u8]) -> Bytes {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut out = BytesMut::with_capacity(5 + payload.len());
    out.put_u8(magic);
    out.put_u32(len);
    out.put_slice(payload);
    out.freeze()
}

fn framed_response(frames: &[Bytes]) -> Response<Full<Bytes>> {
    let mut body = BytesMut::new();
    for frame in frames {
        body.extend_from_slice(frame);
    }
    simple_response(StatusCode::OK, "application/connect+proto", body.freeze())
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
