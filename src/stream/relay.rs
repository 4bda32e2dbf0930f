use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::matcher::MatcherPipeline;
use crate::error::RelayError;
use crate::observability::{log_relay_complete, token_counter::estimate_tokens};
use crate::protocol::canonical::{RelayResult, StreamUnit, TokenUsage, Termination};
use crate::wire::{describe_error_payload, UnitSource};

/// The client-facing side of a relay went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Where relayed output goes.
///
/// The first successful emission commits the response; later errors can no
/// longer be reported to the client.
pub trait RelaySink: Send {
    fn is_committed(&self) -> bool;

    /// Incremental content delta (streaming mode).
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] when the client is gone.
    fn emit_delta(&mut self, text: &str) -> Result<(), SinkClosed>;

    /// Usage marker and terminal sentinel after the last delta (streaming mode).
    fn emit_finish(&mut self, usage: TokenUsage);

    /// Single response body (non-streaming mode).
    fn emit_body(&mut self, content: &str, usage: TokenUsage);

    /// Error response; only called while nothing is committed.
    fn emit_error(&mut self, err: &RelayError);
}

/// Out-of-band signal observed between units.
#[derive(Debug, Clone)]
pub enum RelayControl {
    /// Stop silently; the client cancelled.
    Stop,
    /// Abort with an error.
    Fail(RelayError),
}

/// Predicate over the accumulated content that ends the relay early.
pub type EarlyStop = Box<dyn Fn(&str) -> bool + Send + Sync>;

enum Outcome {
    Eof,
    EarlyStop,
    ClientCancel,
    Errored(RelayError),
}

enum Next {
    Control(RelayControl),
    Unit(Option<Result<StreamUnit, crate::wire::DecodeError>>),
}

/// Drives one backend response to the client.
pub struct StreamRelay {
    model: String,
    streaming: bool,
    prompt_tokens: u64,
    early_stop: Option<EarlyStop>,
}

impl StreamRelay {
    #[must_use]
    pub fn new(model: impl Into<String>, streaming: bool, prompt_tokens: u64) -> Self {
        Self {
            model: model.into(),
            streaming,
            prompt_tokens,
            early_stop: None,
        }
    }

    #[must_use]
    pub fn with_early_stop(mut self, predicate: EarlyStop) -> Self {
        self.early_stop = Some(predicate);
        self
    }

    /// Consume `units` until the stream ends, an error arrives, the control
    /// queue fires or the early-stop predicate matches.
    ///
    /// Control signals take priority over queued units. The unit source is
    /// closed on every exit path.
    pub async fn run<S: RelaySink>(
        &self,
        units: &mut UnitSource,
        mut control: Option<&mut mpsc::Receiver<RelayControl>>,
        pipeline: &mut MatcherPipeline,
        sink: &mut S,
    ) -> RelayResult {
        let started = Instant::now();
        let mut content = String::new();

        let mut outcome = loop {
            let next = tokio::select! {
                biased;
                Some(signal) = next_control(&mut control) => Next::Control(signal),
                unit = units.next_unit() => Next::Unit(unit),
            };

            let text = match next {
                Next::Control(RelayControl::Stop) => break Outcome::ClientCancel,
                Next::Control(RelayControl::Fail(err)) => break Outcome::Errored(err),
                Next::Unit(None | Some(Ok(StreamUnit::End))) => break Outcome::Eof,
                Next::Unit(Some(Err(err))) => break Outcome::Errored(err.into()),
                Next::Unit(Some(Ok(StreamUnit::ErrorNotice(payload)))) => {
                    break Outcome::Errored(describe_error_payload(&payload));
                }
                Next::Unit(Some(Ok(StreamUnit::LimitNotice(notice)))) => {
                    debug!(model = %self.model, notice = %notice, "skipping limit notice");
                    continue;
                }
                Next::Unit(Some(Ok(StreamUnit::Content(text)))) => text,
            };

            debug!(model = %self.model, raw = %text, "backend content");
            let out = pipeline.apply(&text, false);
            if out.is_empty() {
                continue;
            }
            content.push_str(&out);
            if self.streaming && sink.emit_delta(&out).is_err() {
                break Outcome::ClientCancel;
            }
            if self
                .early_stop
                .as_ref()
                .is_some_and(|predicate| predicate(&content))
            {
                break Outcome::EarlyStop;
            }
        };
        units.close();

        if matches!(outcome, Outcome::Eof) {
            let residual = pipeline.apply("", true);
            if !residual.is_empty() {
                content.push_str(&residual);
                if self.streaming && sink.emit_delta(&residual).is_err() {
                    outcome = Outcome::ClientCancel;
                }
            }
        }

        let usage = TokenUsage::new(self.prompt_tokens, estimate_tokens(&content));
        let (terminated_by, error) = match outcome {
            Outcome::Eof | Outcome::EarlyStop => {
                self.complete(&content, usage, sink);
                let terminated_by = if matches!(outcome, Outcome::Eof) {
                    Termination::Eof
                } else {
                    Termination::Cancelled
                };
                (terminated_by, None)
            }
            Outcome::ClientCancel => (Termination::Cancelled, None),
            Outcome::Errored(err) => {
                if sink.is_committed() {
                    error!(model = %self.model, error = %err, "backend error after response was committed");
                } else {
                    sink.emit_error(&err);
                }
                (Termination::Errored, Some(err))
            }
        };

        let result = RelayResult {
            content,
            usage,
            terminated_by,
            error,
        };
        log_relay_complete(&self.model, &result, started);
        result
    }

    fn complete<S: RelaySink>(&self, content: &str, usage: TokenUsage, sink: &mut S) {
        if content.is_empty() && !sink.is_committed() {
            return;
        }
        if self.streaming {
            sink.emit_finish(usage);
        } else {
            sink.emit_body(content, usage);
        }
    }
}

async fn next_control(
    control: &mut Option<&mut mpsc::Receiver<RelayControl>>,
) -> Option<RelayControl> {
    match control {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
