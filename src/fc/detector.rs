use std::sync::LazyLock;

use memchr::{memchr_iter, memmem};

// Tool directive detection over accumulated model output.
//
// Trigger signals inside reasoning blocks (`<think>`, `<thinking>`,
// `<reasoning>`, `<analysis>`) do not count; models rehearse the directive
// there before emitting it.

const REASONING_TAGS: [(&str, &str); 4] = [
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<reasoning>", "</reasoning>"),
    ("<analysis>", "</analysis>"),
];
pub(crate) const FC_OPEN: &str = "<function_calls>";
pub(crate) const FC_CLOSE: &str = "</function_calls>";
static FC_CLOSE_FINDER: LazyLock<memmem::Finder<'static>> =
    LazyLock::new(|| memmem::Finder::new(FC_CLOSE.as_bytes()));

/// Bytes of plain answer after which the model is taken not to call a tool.
pub const MAX_PROSE_WITHOUT_TRIGGER: usize = 4096;

/// Result of scanning accumulated output for the trigger signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerScan {
    /// Byte offset of the last trigger outside reasoning blocks.
    pub last_trigger: Option<usize>,
    /// Whether the text ends inside an unclosed reasoning block.
    pub in_reasoning: bool,
}

/// Scan `text` for `trigger`, skipping reasoning blocks (which may nest).
#[must_use]
pub fn scan_for_trigger(text: &str, trigger: &str) -> TriggerScan {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut last_trigger = None;
    let mut skip_until = 0usize;

    for pos in memchr_iter(b'<', bytes) {
        if pos < skip_until {
            continue;
        }
        let rest = &bytes[pos..];
        if let Some((open, _)) = REASONING_TAGS
            .iter()
            .find(|(open, _)| rest.starts_with(open.as_bytes()))
        {
            depth += 1;
            skip_until = pos + open.len();
        } else if let Some((_, close)) = REASONING_TAGS
            .iter()
            .find(|(_, close)| rest.starts_with(close.as_bytes()))
        {
            depth = depth.saturating_sub(1);
            skip_until = pos + close.len();
        } else if depth == 0 && rest.starts_with(trigger.as_bytes()) {
            last_trigger = Some(pos);
            skip_until = pos + trigger.len();
        }
    }

    TriggerScan {
        last_trigger,
        in_reasoning: depth > 0,
    }
}

/// Whether relaying can stop: a complete directive follows the last trigger,
/// or enough plain answer accumulated without any trigger.
#[must_use]
pub fn directive_settled(text: &str, trigger: &str) -> bool {
    let scan = scan_for_trigger(text, trigger);
    match scan.last_trigger {
        Some(pos) => FC_CLOSE_FINDER.find(&text.as_bytes()[pos..]).is_some(),
        None => !scan.in_reasoning && text.len() >= MAX_PROSE_WITHOUT_TRIGGER,
    }
}
