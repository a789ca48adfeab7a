//! SQL and XML streams: large string values referenced from traces.
//!
//! Same framing as the dictionary: `[phraseLength:int][varstring]*`.

use profiler_core::Chunk;
use serde::Serialize;

use crate::{Decoded, DecodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringRecord {
    pub pos: u64,
    pub bytes: u64,
    pub value: String,
}

/// Decodes a sql/xml chunk. Text: `pos: value` per line.
pub fn read_string_stream(chunk: &Chunk) -> Decoded<Vec<StringRecord>> {
    let stream = match chunk.stream_type.as_str() {
        "xml" => "xml",
        _ => "sql",
    };
    tracing::debug!(chunk = %chunk, "reading {stream}");

    let mut r = chunk.reader();
    let mut list = Vec::new();
    let mut text = String::new();
    let mut error = None;

    let mut phrase_len: i64 = -1;
    while !r.is_eof() {
        if phrase_len <= 0 {
            match r.read_int() {
                Ok(len) => phrase_len = len as i64,
                Err(e) => {
                    error = Some(DecodeError::new(stream, e));
                    break;
                }
            }
            if r.is_eof() {
                break;
            }
        }
        let pos = r.pos();
        let value = match r.read_var_string() {
            Ok(v) => v,
            Err(e) => {
                error = Some(DecodeError::new(stream, e));
                break;
            }
        };
        let bytes = r.pos() - pos;
        phrase_len -= bytes as i64;
        text.push_str(&format!("{}: {}\n", pos, value));
        list.push(StringRecord { pos, bytes, value });
    }

    if let Some(err) = &error {
        tracing::warn!(pos = err.pos(), error = %err, "{stream} decode stopped");
    }
    Decoded {
        records: list,
        text,
        error,
    }
}
