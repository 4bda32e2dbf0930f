use memchr::memmem;
use regex_lite::Regex;

use crate::config::{FeaturesConfig, RewriteRule};
use crate::error::RelayError;

/// Text transform applied to each content unit before it reaches the client.
///
/// Instances belong to one request. They may buffer text between calls; the
/// call with `is_final == true` comes once, after the stream ended, and must
/// return whatever is still held back.
pub trait ContentMatcher: Send {
    fn apply(&mut self, text: &str, is_final: bool) -> String;
}

/// Ordered set of matchers for one request.
#[derive(Default)]
pub struct MatcherPipeline {
    matchers: Vec<Box<dyn ContentMatcher>>,
}

impl MatcherPipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, matcher: impl ContentMatcher + 'static) {
        self.matchers.push(Box::new(matcher));
    }

    #[must_use]
    pub fn with(mut self, matcher: impl ContentMatcher + 'static) -> Self {
        self.push(matcher);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Build the per-request pipeline from configured rewrite rules.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a pattern does not compile.
    pub fn from_rules(rules: &[RewriteRule]) -> Result<Self, RelayError> {
        let mut pipeline = Self::new();
        for rule in rules {
            pipeline.push(RewriteMatcher::new(&rule.pattern, &rule.replacement)?);
        }
        Ok(pipeline)
    }

    /// Per-request pipeline for the configured features: rewrite rules first,
    /// then marker stripping.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a rewrite pattern does not compile.
    pub fn from_features(features: &FeaturesConfig) -> Result<Self, RelayError> {
        let mut pipeline = Self::from_rules(&features.rewrite_rules)?;
        for marker in &features.strip_markers {
            pipeline.push(StripMarkerMatcher::new(marker.as_str()));
        }
        Ok(pipeline)
    }

    /// Run `text` through every matcher in order.
    ///
    /// A non-final call stops as soon as a matcher suppresses the text. The
    /// final call always reaches every matcher so each can flush, and each
    /// matcher sees the flushed output of the ones before it.
    pub fn apply(&mut self, text: &str, is_final: bool) -> String {
        if is_final && self.matchers.is_empty() {
            return String::new();
        }
        let mut current = text.to_string();
        for matcher in &mut self.matchers {
            current = matcher.apply(&current, is_final);
            if current.is_empty() && !is_final {
                break;
            }
        }
        current
    }
}

/// Regex replacement on each unit. Holds no state across calls.
pub struct RewriteMatcher {
    pattern: Regex,
    replacement: String,
}

impl RewriteMatcher {
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when `pattern` is not a valid regex.
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, RelayError> {
        let pattern = Regex::new(pattern).map_err(|err| {
            RelayError::Config(format!("invalid rewrite pattern '{pattern}': {err}"))
        })?;
        Ok(Self {
            pattern,
            replacement: replacement.to_string(),
        })
    }
}

impl ContentMatcher for RewriteMatcher {
    fn apply(&mut self, text: &str, _is_final: bool) -> String {
        if text.is_empty() {
            return String::new();
        }
        self.pattern
            .replace_all(text, self.replacement.as_str())
            .into_owned()
    }
}

/// Removes a literal marker even when the backend splits it across units.
///
/// A tail that could be the start of the marker is held back until the next
/// unit decides it, or released unchanged by the final flush.
pub struct StripMarkerMatcher {
    marker: String,
    pending: String,
}

impl StripMarkerMatcher {
    #[must_use]
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            pending: String::new(),
        }
    }

    fn held_back_len(&self, text: &str) -> usize {
        let max = self.marker.len().saturating_sub(1).min(text.len());
        (1..=max)
            .rev()
            .find(|&len| {
                let start = text.len() - len;
                text.is_char_boundary(start) && self.marker.starts_with(&text[start..])
            })
            .unwrap_or(0)
    }
}

impl ContentMatcher for StripMarkerMatcher {
    fn apply(&mut self, text: &str, is_final: bool) -> String {
        let mut combined = std::mem::take(&mut self.pending);
        combined.push_str(text);
        if self.marker.is_empty() {
            return combined;
        }

        let finder = memmem::Finder::new(self.marker.as_bytes());
        let mut out = String::with_capacity(combined.len());
        let mut rest = combined.as_str();
        while let Some(pos) = finder.find(rest.as_bytes()) {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + self.marker.len()..];
        }

        if is_final {
            out.push_str(rest);
            return out;
        }
        let keep = self.held_back_len(rest);
        let split = rest.len() - keep;
        out.push_str(&rest[..split]);
        self.pending = rest[split..].to_string();
        out
    }
}
