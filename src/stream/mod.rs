//! Relay engine: content matchers, the relay loop and SSE encoding.

pub mod matcher;
pub mod relay;
pub mod sse;

pub use matcher::{ContentMatcher, MatcherPipeline, RewriteMatcher, StripMarkerMatcher};
pub use relay::{EarlyStop, RelayControl, RelaySink, SinkClosed, StreamRelay};
