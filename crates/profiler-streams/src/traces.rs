//! Trace stream: per-thread call trees.
//!
//! Layout: `[timerStart:long]`, then blocks of
//! `[threadId:long][realTime:long]` followed by events until a FINISH
//! marker. An event header byte packs the event type in bits 0-1 and a
//! 5-bit time delta in bits 2-6; bit 7 means the delta continues in a
//! varint shifted left by 5.
//!
//! ENTER and TAG events carry a tag id. TAG events add a parameter-type
//! byte: inline/indexed values are varstrings, big values are references
//! (`traceIndex`, `offset`) into another trace block.

use chrono::{DateTime, Utc};
use profiler_core::{BlobReader, Chunk, CodecError};
use serde::Serialize;

use crate::dictionary::{Dictionary, UNKNOWN_WORD};
use crate::{fmt_millis, utc_millis, Decoded, DecodeError};

pub const EVENT_ENTER: u8 = 0;
pub const EVENT_EXIT: u8 = 1;
pub const EVENT_TAG: u8 = 2;
pub const EVENT_FINISH: u8 = 3;

pub const PARAM_INLINE: u8 = 0;
pub const PARAM_BIG: u8 = 1;
pub const PARAM_INDEX: u8 = 2;
pub const PARAM_BIG_DEDUP: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    pub pos: u64,
    pub bytes: u64,
    pub thread_id: i64,
    /// Wall-clock start of the block, epoch millis.
    pub time_ms: i64,
    /// Events read, FINISH included.
    pub events: usize,
    /// Sum of event time deltas in the block.
    pub elapsed: i64,
    /// Exits seen at depth 0.
    pub anomalies: usize,
}

impl TraceRecord {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        utc_millis(self.time_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Traces {
    pub start_ms: i64,
    pub list: Vec<TraceRecord>,
}

fn rt_time(ms: i64) -> String {
    format!("{} - {}", ms, fmt_millis(ms))
}

fn repeat(s: &str, count: i64) -> String {
    if count <= 0 {
        return format!("[?|{count}]");
    }
    s.repeat(count as usize)
}

struct BlockReader<'r, 'd> {
    r: &'r mut BlobReader<'d>,
    dict: Option<&'r Dictionary>,
    text: &'r mut String,
}

impl BlockReader<'_, '_> {
    fn word(&self, tag: i32) -> &str {
        self.dict.map(|d| d.get(tag)).unwrap_or(UNKNOWN_WORD)
    }

    /// Reads one block. `Ok(None)` when the input ends before a block header.
    fn read_block(&mut self, block: usize) -> Result<Option<TraceRecord>, CodecError> {
        let pos = self.r.pos();
        let thread_id = self.r.read_long()?;
        let real_time = self.r.read_long()?;
        if self.r.is_eof() {
            return Ok(None);
        }
        self.text.push_str(&format!(
            "\nblock #{}. threadId={:4}, real time: {} , offset={} / {:X}\n",
            block,
            thread_id,
            rt_time(real_time),
            pos,
            pos
        ));

        let mut events = 0usize;
        let mut elapsed = 0i64;
        let mut anomalies = 0usize;
        let mut sp: i64 = 0;
        while !self.r.is_eof() {
            events += 1;
            let j = events - 1;
            let event_pos = self.r.pos();
            let header = self.r.read_byte()?;
            let typ = header & 0x3;
            if typ == EVENT_FINISH {
                break;
            }

            let mut etime = ((header & 0x7f) >> 2) as i64;
            if header & 0x80 != 0 {
                etime |= (self.r.read_var_int()? as i64) << 5;
            }
            elapsed += etime;

            let mut tag = 0;
            if typ != EVENT_EXIT {
                tag = self.r.read_var_int()?;
                if typ == EVENT_TAG {
                    self.read_tag_value(block, j, tag)?;
                }
            }

            match typ {
                EVENT_ENTER => {
                    sp += 1;
                    let line = if sp == 1 {
                        format!("call  [{:3}:{:2}] tagId={}|'{}'\n", block, j, tag, self.word(tag))
                    } else {
                        format!(
                            "call  [{:3}:{:2}] {} -> tagId={}|'{}'\n",
                            block,
                            j,
                            repeat(" | ", sp - 1),
                            tag,
                            self.word(tag)
                        )
                    };
                    self.text.push_str(&line);
                }
                EVENT_EXIT => {
                    let line = if sp == 1 {
                        format!("call  [{:3}:{:2}] tagId={}|'{}'\n", block, j, tag, self.word(tag))
                    } else if sp == 0 {
                        anomalies += 1;
                        tracing::warn!(pos = event_pos, block, event = j, "exit at depth 0");
                        format!(
                            "ERROR [{:3}:{:2}] {} [tagId={}|{}]\n",
                            block,
                            j,
                            repeat(" | ", sp),
                            tag,
                            self.word(tag)
                        )
                    } else {
                        format!(
                            "call  [{:3}:{:2}] {} <- tagId={}|'{}'\n",
                            block,
                            j,
                            repeat(" | ", sp - 1),
                            tag,
                            self.word(tag)
                        )
                    };
                    self.text.push_str(&line);
                    if sp > 0 {
                        sp -= 1;
                    }
                }
                _ => {}
            }
        }

        self.text.push_str(&format!("trace {}. {} tag lines\n", block, events));
        Ok(Some(TraceRecord {
            pos,
            bytes: self.r.pos() - pos,
            thread_id,
            time_ms: real_time,
            events,
            elapsed,
            anomalies,
        }))
    }

    fn read_tag_value(&mut self, block: usize, j: usize, tag: i32) -> Result<(), CodecError> {
        let param_type = self.r.read_byte()?;
        match param_type {
            PARAM_INLINE | PARAM_INDEX => {
                let value = self.r.read_var_string()?;
                self.text.push_str(&format!(
                    "trace [{:3}:{:2}] tagId={}, string value '{}'\n",
                    block, j, tag, value
                ));
            }
            PARAM_BIG | PARAM_BIG_DEDUP => {
                let trace_index = self.r.read_var_int()?;
                let offset = self.r.read_var_int()?;
                self.text.push_str(&format!(
                    "trace [{:3}:{:2}] tagId={}, clob: traceIdx={}, offset={}\n",
                    block, j, tag, trace_index, offset
                ));
            }
            other => {
                tracing::debug!(pos = self.r.pos(), param_type = other, tag, "unknown tag parameter type");
            }
        }
        Ok(())
    }
}

/// Decodes a trace chunk. `dictionary` only affects the text rendering.
pub fn read_traces(chunk: &Chunk, dictionary: Option<&Dictionary>) -> Decoded<Traces> {
    tracing::debug!(chunk = %chunk, "reading traces");

    let mut r = chunk.reader();
    let mut parsed = Traces::default();
    let mut text = String::new();
    let mut error = None;

    match r.read_long() {
        Ok(start) => parsed.start_ms = start,
        Err(e) => {
            return Decoded {
                records: parsed,
                text,
                error: Some(DecodeError::new("trace", e)),
            }
        }
    }

    let mut block = 0usize;
    while !r.is_eof() {
        block += 1;
        let mut reader = BlockReader {
            r: &mut r,
            dict: dictionary,
            text: &mut text,
        };
        match reader.read_block(block) {
            Ok(Some(record)) => parsed.list.push(record),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(pos = e.pos(), block, error = %e, "trace decode stopped");
                error = Some(DecodeError::new("trace", e));
                break;
            }
        }
    }

    tracing::debug!(blocks = parsed.list.len(), chunk_bytes = chunk.size(), "traces read");

    Decoded {
        records: parsed,
        text,
        error,
    }
}
