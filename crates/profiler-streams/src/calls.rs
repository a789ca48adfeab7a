//! Calls stream: one record per finished top-level call.
//!
//! The chunk opens with `[startTime:long]`, optionally preceded by a long
//! whose top 32 bits are `CALLS_FORMAT_MARKER` and whose low 32 bits give
//! the record generation (no marker means generation 0). Field groups are
//! strictly additive by generation:
//!
//! | gen | fields |
//! |-----|--------|
//! | 1 | time, method, duration, calls, thread, logs, trace locator |
//! | 2 | cpu time, wait time, memory |
//! | 3 | file and network i/o |
//! | 4 | transactions, queue wait |
//!
//! A parameter map (`tagId → strings`) follows every record.
//!
//! `CallStream` yields records lazily. It is finite, cannot be restarted,
//! and keeps the first fatal error on the side so that everything produced
//! before it survives.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::FusedIterator;

use chrono::{DateTime, Utc};
use profiler_core::wire::CALLS_FORMAT_MARKER;
use profiler_core::{BlobReader, BlobWriter, Chunk, CodecError};
use serde::Serialize;

use crate::{utc_millis, Decoded, DecodeError};

/// Highest record generation this decoder understands.
pub const LATEST_FORMAT: u32 = 4;

// ── Records ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Call {
    /// Offset from the stream start time, millis.
    pub time: i64,
    pub method: i32,
    pub duration: i32,
    pub calls: i32,
    pub thread_name: String,
    pub logs_written: i64,
    pub logs_generated: i64,
    pub trace_file_index: i32,
    pub buffer_offset: i32,
    pub record_index: i32,

    pub cpu_time: i64,
    pub wait_time: i64,
    pub memory_used: i64,

    pub file_read: i64,
    pub file_written: i64,
    pub net_read: i64,
    pub net_written: i64,

    pub transactions: i32,
    pub queue_wait_duration: i32,
    /// Not carried on the wire; kept for the export layout.
    pub suspend_duration: i32,

    pub params: BTreeMap<i32, Vec<String>>,
}

impl Call {
    /// Locator of the call's trace: `file_offset_record`.
    pub fn trace_index(&self) -> String {
        format!("{}_{}_{}", self.trace_file_index, self.buffer_offset, self.record_index)
    }

    /// One row of the calls export, aligned with `csv_header`.
    pub fn csv(&self) -> String {
        format!(
            "{:>8}; {:>7}; {:>7}; {:>8}; {:>6}; {:>7}; {:>7}; {:>7}; {:>6}; {:>5}; {:>5}; {:>5}; {:>5}; \
             {:>7}; {:>7}; {:>7}; {:>7}; {:>7}; {:>7}; {:>12}; {}",
            self.time,
            self.cpu_time,
            self.wait_time,
            self.memory_used,
            self.method,
            self.duration,
            self.queue_wait_duration,
            self.suspend_duration,
            self.calls,
            self.trace_file_index,
            self.buffer_offset,
            self.record_index,
            self.transactions,
            self.logs_generated,
            self.logs_written,
            self.file_read,
            self.file_written,
            self.net_read,
            self.net_written,
            self.thread_name,
            ParamsDisplay(&self.params),
        )
    }
}

pub fn csv_header() -> &'static str {
    "#    n;     time; cpuTime;waitTime;memoryUsed;method;duration;queueWait;suspend; \
     calls;trFile;bufOffst;recordIdx; transactions; \
     logsGenerated; logsWritten; fileRead; fileWritten; netRead; netWritten; threadName; params\n"
}

/// `map[12:[a b] 40:[c]]`
struct ParamsDisplay<'a>(&'a BTreeMap<i32, Vec<String>>);

impl fmt::Display for ParamsDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("map[")?;
        for (i, (id, values)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}:[{}]", id, values.join(" "))?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRecord {
    pub pos: u64,
    pub bytes: u64,
    /// Absolute start of the call, epoch millis.
    pub time_ms: i64,
    pub call: Call,
}

impl CallRecord {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        utc_millis(self.time_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Calls {
    pub format: u32,
    pub start_ms: i64,
    pub list: Vec<CallRecord>,
    /// Every dictionary id referenced by a method or parameter.
    pub required_ids: BTreeSet<i32>,
}

// ── Pull decoder ──────────────────────────────────────────────────────────────

pub struct CallStream<'a> {
    r: BlobReader<'a>,
    format: u32,
    start_ms: i64,
    thread_names: Vec<String>,
    error: Option<DecodeError>,
    finished: bool,
}

impl<'a> CallStream<'a> {
    /// Reads the stream header. A header fault is reported through
    /// `error()` and the stream yields nothing.
    pub fn new(data: &'a [u8]) -> Self {
        let mut stream = Self {
            r: BlobReader::new(data),
            format: 0,
            start_ms: 0,
            thread_names: Vec::new(),
            error: None,
            finished: false,
        };
        if let Err(e) = stream.read_header() {
            stream.fail(e);
        }
        stream
    }

    fn read_header(&mut self) -> Result<(), CodecError> {
        let first = self.r.read_long()?;
        if (first as u64) >> 32 == CALLS_FORMAT_MARKER {
            self.format = (first as u64 & 0xffff_ffff) as u32;
            self.start_ms = self.r.read_long()?;
        } else {
            self.start_ms = first;
        }
        if self.format > LATEST_FORMAT {
            tracing::warn!(format = self.format, "calls generation newer than decoder");
        }
        tracing::debug!(format = self.format, start_ms = self.start_ms, "calls header");
        Ok(())
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    /// First fatal error, once the stream has stopped because of it.
    pub fn error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    pub fn take_error(&mut self) -> Option<DecodeError> {
        self.error.take()
    }

    fn fail(&mut self, e: CodecError) {
        tracing::warn!(pos = e.pos(), error = %e, "calls decode stopped");
        self.error = Some(DecodeError::new("calls", e));
        self.finished = true;
    }

    fn read_call(&mut self) -> Result<CallRecord, CodecError> {
        let r = &mut self.r;
        let pos = r.pos();
        let mut call = Call::default();

        if self.format >= 1 {
            call.time = r.read_var_int_zigzag()? as i64;
            call.method = r.read_var_int()?;
            call.duration = r.read_var_int()?;
            call.calls = r.read_var_int()?;

            let thread_index = r.read_var_int()?;
            if usize::try_from(thread_index).ok() == Some(self.thread_names.len()) {
                let name = r.read_var_string()?;
                self.thread_names.push(name);
            }
            call.thread_name = match usize::try_from(thread_index).ok().and_then(|i| self.thread_names.get(i)) {
                Some(name) => name.clone(),
                None => format!("unknown # {thread_index}"),
            };

            call.logs_written = r.read_var_int()? as i64;
            call.logs_generated = r.read_var_int()? as i64 + call.logs_written;
            call.trace_file_index = r.read_var_int()?;
            call.buffer_offset = r.read_var_int()?;
            call.record_index = r.read_var_int()?;
        }
        if self.format >= 2 {
            call.cpu_time = r.read_var_long()?;
            call.wait_time = r.read_var_long()?;
            call.memory_used = r.read_var_long()?;
        }
        if self.format >= 3 {
            call.file_read = r.read_var_long()?;
            call.file_written = r.read_var_long()?;
            call.net_read = r.read_var_long()?;
            call.net_written = r.read_var_long()?;
        }
        if self.format >= 4 {
            call.transactions = r.read_var_int()?;
            call.queue_wait_duration = r.read_var_int()?;
        }

        let n_params = r.read_var_int()?;
        for _ in 0..n_params.max(0) {
            let id = r.read_var_int()?;
            let size = r.read_var_int()?;
            let mut values = Vec::new();
            for _ in 0..size.max(0) {
                values.push(r.read_var_string()?);
            }
            // Multi-valued params arrive last value first.
            values.reverse();
            call.params.insert(id, values);
        }

        Ok(CallRecord {
            pos,
            bytes: r.pos() - pos,
            time_ms: self.start_ms + call.time,
            call,
        })
    }
}

impl Iterator for CallStream<'_> {
    type Item = CallRecord;

    fn next(&mut self) -> Option<CallRecord> {
        if self.finished || self.r.is_eof() {
            self.finished = true;
            return None;
        }
        match self.read_call() {
            Ok(record) => Some(record),
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }
}

impl FusedIterator for CallStream<'_> {}

/// Decodes a whole calls chunk. Text: the CSV header, then
/// `call#n: <csv>` per call.
pub fn read_calls(chunk: &Chunk) -> Decoded<Calls> {
    tracing::debug!(chunk = %chunk, "reading calls");

    let mut stream = CallStream::new(chunk.bytes());
    let mut parsed = Calls {
        format: stream.format(),
        start_ms: stream.start_ms(),
        ..Calls::default()
    };
    parsed.list.extend(stream.by_ref());
    let error = stream.take_error();

    let mut text = String::from(csv_header());
    for (i, record) in parsed.list.iter().enumerate() {
        parsed.required_ids.insert(record.call.method);
        parsed.required_ids.extend(record.call.params.keys().copied());
        text.push_str(&format!("call#{}: {}\n", i + 1, record.call.csv()));
    }

    tracing::debug!(
        calls = parsed.list.len(),
        format = parsed.format,
        chunk_bytes = chunk.size(),
        "calls read"
    );

    Decoded {
        records: parsed,
        text,
        error,
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Builds a calls stream in a given generation, interning thread names the
/// way agents do.
#[derive(Debug)]
pub struct CallEncoder {
    w: BlobWriter,
    format: u32,
    thread_names: Vec<String>,
}

impl CallEncoder {
    pub fn new(format: u32, start_ms: i64) -> Self {
        let mut w = BlobWriter::new();
        if format > 0 {
            w.write_long(((CALLS_FORMAT_MARKER << 32) | format as u64) as i64);
        }
        w.write_long(start_ms);
        Self {
            w,
            format,
            thread_names: Vec::new(),
        }
    }

    pub fn push(&mut self, call: &Call) -> &mut Self {
        let w = &mut self.w;
        if self.format >= 1 {
            w.write_var_int_zigzag(call.time as i32)
                .write_var_int(call.method)
                .write_var_int(call.duration)
                .write_var_int(call.calls);
            match self.thread_names.iter().position(|n| *n == call.thread_name) {
                Some(i) => {
                    w.write_var_int(i as i32);
                }
                None => {
                    w.write_var_int(self.thread_names.len() as i32)
                        .write_var_string(&call.thread_name);
                    self.thread_names.push(call.thread_name.clone());
                }
            }
            w.write_var_int(call.logs_written as i32)
                .write_var_int((call.logs_generated - call.logs_written) as i32)
                .write_var_int(call.trace_file_index)
                .write_var_int(call.buffer_offset)
                .write_var_int(call.record_index);
        }
        if self.format >= 2 {
            w.write_var_long(call.cpu_time)
                .write_var_long(call.wait_time)
                .write_var_long(call.memory_used);
        }
        if self.format >= 3 {
            w.write_var_long(call.file_read)
                .write_var_long(call.file_written)
                .write_var_long(call.net_read)
                .write_var_long(call.net_written);
        }
        if self.format >= 4 {
            w.write_var_int(call.transactions)
                .write_var_int(call.queue_wait_duration);
        }
        w.write_var_int(call.params.len() as i32);
        for (id, values) in &call.params {
            w.write_var_int(*id).write_var_int(values.len() as i32);
            for v in values.iter().rev() {
                w.write_var_string(v);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.w.len()
    }

    pub fn is_empty(&self) -> bool {
        self.w.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.w.into_vec()
    }
}
