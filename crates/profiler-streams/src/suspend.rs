//! Suspend stream: JVM-wide pauses (GC, safepoints) observed by the agent.
//!
//! Layout: phrases of `[phraseLength:int]`; the first phrase additionally
//! carries `[startTime:long]`. Entries are `[deltaMs:varint][pause:varint]`
//! and the absolute time is rebuilt by summing deltas from the start time.

use chrono::{DateTime, Utc};
use profiler_core::{BlobReader, Chunk, CodecError};
use serde::Serialize;

use crate::{fmt_millis, utc_millis, Decoded, DecodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suspend {
    pub pos: u64,
    pub bytes: u64,
    /// Absolute time of the pause, epoch millis.
    pub time_ms: i64,
    pub delta: i32,
    /// Pause duration in millis.
    pub amount: i32,
}

impl Suspend {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        utc_millis(self.time_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Suspends {
    pub start_ms: i64,
    pub end_ms: i64,
    pub list: Vec<Suspend>,
}

impl Suspends {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        utc_millis(self.start_ms)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        utc_millis(self.end_ms)
    }

    /// Sum of all pause durations, in millis.
    pub fn total_pause_ms(&self) -> i64 {
        self.list.iter().map(|s| s.amount as i64).sum()
    }
}

fn read_entry(r: &mut BlobReader<'_>) -> Result<(u64, i32, i32), CodecError> {
    let pos = r.pos();
    let delta = r.read_var_int()?;
    let amount = r.read_var_int()?;
    Ok((pos, delta, amount))
}

/// Decodes a suspend chunk. Text: `cTime:  delta, amount  \t utc` per line.
pub fn read_suspend(chunk: &Chunk) -> Decoded<Suspends> {
    tracing::debug!(chunk = %chunk, "reading suspend");

    let mut r = chunk.reader();
    let mut parsed = Suspends::default();
    let mut text = String::new();
    let mut error = None;

    let mut start: Option<i64> = None;
    let mut c_time: i64 = 0;
    let mut phrase_len: i64 = -1;
    while !r.is_eof() {
        if phrase_len <= 0 {
            match r.read_int() {
                Ok(len) => phrase_len = len as i64,
                Err(e) => {
                    error = Some(DecodeError::new("suspend", e));
                    break;
                }
            }
            if r.is_eof() {
                break;
            }
            if start.is_none() {
                match r.read_long() {
                    Ok(t) => {
                        start = Some(t);
                        c_time = t;
                    }
                    Err(e) => {
                        error = Some(DecodeError::new("suspend", e));
                        break;
                    }
                }
                if r.is_eof() {
                    break;
                }
            }
        }

        let (pos, delta, amount) = match read_entry(&mut r) {
            Ok(entry) => entry,
            Err(e) => {
                error = Some(DecodeError::new("suspend", e));
                break;
            }
        };
        let bytes = r.pos() - pos;
        phrase_len -= bytes as i64;
        c_time += delta as i64;

        text.push_str(&format!("{}:  {}, {}  \t {}\n", c_time, delta, amount, fmt_millis(c_time)));
        parsed.list.push(Suspend {
            pos,
            bytes,
            time_ms: c_time,
            delta,
            amount,
        });
    }

    parsed.start_ms = start.unwrap_or(0);
    parsed.end_ms = c_time;

    tracing::debug!(
        entries = parsed.list.len(),
        start = %fmt_millis(parsed.start_ms),
        end = %fmt_millis(parsed.end_ms),
        chunk_bytes = chunk.size(),
        "suspend read"
    );
    if let Some(err) = &error {
        tracing::warn!(pos = err.pos(), error = %err, "suspend decode stopped");
    }

    Decoded {
        records: parsed,
        text,
        error,
    }
}
