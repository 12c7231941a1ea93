//! Message headers and W3C trace-context propagation.
//!
//! Headers travel next to the payload through the broker. Trace context is
//! injected at publish time and extracted at consume time so spans on both
//! sides of the broker link into one trace.

use rand::Rng;
use std::collections::BTreeMap;

/// W3C traceparent header
pub const TRACE_PARENT_HEADER: &str = "traceparent";
/// W3C tracestate header
pub const TRACE_STATE_HEADER: &str = "tracestate";
/// Correlation ID propagated from the producing business transaction
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
/// Diagnostic copy of the envelope's event id
pub const EVENT_ID_HEADER: &str = "event-id";
/// Diagnostic copy of the envelope's event name
pub const EVENT_NAME_HEADER: &str = "event-name";
/// Diagnostic copy of the envelope's event version
pub const EVENT_VERSION_HEADER: &str = "event-version";

/// String key/value headers attached to a broker message.
///
/// Ordered so serialized header sets are deterministic in tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHeaders {
    entries: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Parsed W3C trace context (`traceparent` version 00).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 16-byte trace id, lowercase hex
    pub trace_id: String,
    /// 8-byte span id, lowercase hex
    pub span_id: String,
    /// Sampled flag from the trace-flags byte
    pub sampled: bool,
}

impl TraceContext {
    /// Mint a fresh root context with random, non-zero ids.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let trace_id: u128 = rng.gen_range(1..=u128::MAX);
        let span_id: u64 = rng.gen_range(1..=u64::MAX);
        Self {
            trace_id: format!("{trace_id:032x}"),
            span_id: format!("{span_id:016x}"),
            sampled: true,
        }
    }

    /// Derive a child context: same trace, fresh span id.
    pub fn child(&self) -> Self {
        let span_id: u64 = rand::thread_rng().gen_range(1..=u64::MAX);
        Self {
            trace_id: self.trace_id.clone(),
            span_id: format!("{span_id:016x}"),
            sampled: self.sampled,
        }
    }

    /// Parse a `traceparent` value: `00-{trace-id}-{parent-id}-{flags}`.
    ///
    /// Returns `None` for unknown versions, malformed fields, or all-zero
    /// ids (which W3C trace context treats as invalid).
    pub fn parse(traceparent: &str) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        if version != "00" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            sampled,
        })
    }

    /// Format as a `traceparent` header value.
    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }

    /// Inject this context into outgoing message headers.
    pub fn inject(&self, headers: &mut MessageHeaders) {
        headers.insert(TRACE_PARENT_HEADER, self.to_traceparent());
    }

    /// Extract a context from incoming message headers.
    pub fn extract(headers: &MessageHeaders) -> Option<Self> {
        headers.get(TRACE_PARENT_HEADER).and_then(Self::parse)
    }
}

fn is_lower_hex(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_all_zero(s: &str) -> bool {
    s.chars().all(|c| c == '0')
}
