use bytes::Bytes;
use memchr::memmem;

/// Terminal sentinel of an OpenAI-style event stream.
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Format one OpenAI-style SSE event (no event type, just data).
#[must_use]
pub fn openai_sse_frame(json: &str) -> Bytes {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME.as_bytes())
}

/// Split a complete SSE body into the payloads of its `data:` lines.
///
/// Events are separated by a blank line; multi-line data is joined with `\n`.
#[must_use]
pub fn collect_sse_data(body: &str) -> Vec<String> {
    let body = body.replace("\r\n", "\n");
    let mut events = Vec::new();
    let mut rest = body.as_str();
    let separator = memmem::Finder::new(b"\n\n");

    while !rest.is_empty() {
        let (block, next) = match separator.find(rest.as_bytes()) {
            Some(pos) => (&rest[..pos], &rest[pos + 2..]),
            None => (rest, ""),
        };
        rest = next;

        let data: Vec<&str> = block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|value| value.strip_prefix(' ').unwrap_or(value))
            .collect();
        if !data.is_empty() {
            events.push(data.join("\n"));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_use_data_prefix_and_blank_line() {
        assert_eq!(openai_sse_frame("{}").as_ref(), b"data: {}\n\n");
        assert_eq!(done_frame().as_ref(), b"data: [DONE]\n\n");
    }

    #[test]
    fn collects_data_payloads_in_order() {
        let body = "data: {\"a\":1}\n\n: keepalive\n\ndata: line1\ndata: line2\r\n\r\ndata: [DONE]\n\n";
        assert_eq!(
            collect_sse_data(body),
            vec!["{\"a\":1}", "line1\nline2", "[DONE]"]
        );
    }
}
