//! profiler-streams: decoders that turn a finished chunk into records.
//!
//! Each decoder consumes one chunk front to back and returns a `Decoded`:
//! the records produced, a newline-joined text rendering for export tooling,
//! and the error that stopped decoding, if any. Records produced before a
//! fault are always kept.

pub mod calls;
pub mod dictionary;
pub mod params;
pub mod pod_dump;
pub mod strings;
pub mod suspend;
pub mod traces;

use chrono::{DateTime, Utc};
use profiler_core::CodecError;

pub use calls::{read_calls, Call, CallRecord, CallStream, Calls};
pub use dictionary::{read_dictionary, read_dictionary_until, DictWord, Dictionary, DictionaryPrefix};
pub use params::{read_params, Param, Params};
pub use pod_dump::{ChunkSummary, ParsedStreams, PodDump};
pub use strings::{read_string_stream, StringRecord};
pub use suspend::{read_suspend, Suspend, Suspends};
pub use traces::{read_traces, TraceRecord, Traces};

// ── Decode result ─────────────────────────────────────────────────────────────

/// Output of one decoder run.
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    pub records: T,
    /// Human-readable rendering, one line per record.
    pub text: String,
    /// The fault that ended decoding early. `records` holds everything
    /// produced before it.
    pub error: Option<DecodeError>,
}

impl<T> Decoded<T> {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{stream} stream: {source}")]
pub struct DecodeError {
    pub stream: &'static str,
    #[source]
    pub source: CodecError,
}

impl DecodeError {
    pub fn new(stream: &'static str, source: CodecError) -> Self {
        Self { stream, source }
    }

    /// Byte offset inside the chunk where decoding stopped.
    pub fn pos(&self) -> u64 {
        self.source.pos()
    }
}

// ── Time helpers ──────────────────────────────────────────────────────────────

/// Milliseconds since the epoch as a UTC timestamp, if representable.
pub fn utc_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// `2023-07-24 12:26:17.657 UTC`, or the raw number when out of range.
pub(crate) fn fmt_millis(ms: i64) -> String {
    match utc_millis(ms) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("{ms} ms"),
    }
}
