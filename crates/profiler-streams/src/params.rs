//! Params stream: metadata for every parameter tag an agent can attach.
//!
//! Layout: `[phraseLength:int]`, then a format version byte that appears
//! once at the head of the first phrase only, then per parameter
//! `[name:varstring][isIndex:byte][isList:byte][order:varint][signature:varstring]`.

use profiler_core::{BlobReader, Chunk, CodecError};
use serde::Serialize;

use crate::{Decoded, DecodeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Param {
    pub pos: u64,
    pub bytes: u64,
    pub name: String,
    pub is_index: bool,
    pub is_list: bool,
    pub order: i32,
    pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Params {
    /// Format version from the first phrase. `None` when the chunk is empty.
    pub version: Option<u8>,
    pub list: Vec<Param>,
}

impl Params {
    pub fn find(&self, name: &str) -> Option<&Param> {
        self.list.iter().find(|p| p.name == name)
    }
}

fn read_param(r: &mut BlobReader<'_>) -> Result<Param, CodecError> {
    let pos = r.pos();
    let name = r.read_var_string()?;
    let is_index = r.read_byte()? == 1;
    let is_list = r.read_byte()? == 1;
    let order = r.read_var_int()?;
    let signature = r.read_var_string()?;
    Ok(Param {
        pos,
        bytes: r.pos() - pos,
        name,
        is_index,
        is_list,
        order,
        signature,
    })
}

/// Decodes a params chunk. Text: `name [isIndex,isList,order,signature]`
/// per `\r\n`-terminated line.
pub fn read_params(chunk: &Chunk) -> Decoded<Params> {
    tracing::debug!(chunk = %chunk, "reading params");

    let mut r = chunk.reader();
    let mut parsed = Params::default();
    let mut text = String::new();
    let mut error = None;
    let mut phrases = 0usize;

    let mut phrase_len: i64 = -1;
    while !r.is_eof() {
        if phrase_len <= 0 {
            match r.read_int() {
                Ok(len) => phrase_len = len as i64,
                Err(e) => {
                    error = Some(DecodeError::new("params", e));
                    break;
                }
            }
            if r.is_eof() {
                break;
            }
            phrases += 1;
            if parsed.version.is_none() {
                match r.read_byte() {
                    Ok(v) => parsed.version = Some(v),
                    Err(e) => {
                        error = Some(DecodeError::new("params", e));
                        break;
                    }
                }
                if r.is_eof() {
                    break;
                }
            }
        }

        let param = match read_param(&mut r) {
            Ok(p) => p,
            Err(e) => {
                error = Some(DecodeError::new("params", e));
                break;
            }
        };
        phrase_len -= param.bytes as i64;
        text.push_str(&format!(
            "{} [{},{},{},{}]\r\n",
            param.name, param.is_index, param.is_list, param.order, param.signature
        ));
        parsed.list.push(param);
    }

    tracing::debug!(
        version = ?parsed.version,
        params = parsed.list.len(),
        phrases,
        chunk_bytes = chunk.size(),
        "params read"
    );
    if let Some(err) = &error {
        tracing::warn!(pos = err.pos(), error = %err, "params decode stopped");
    }

    Decoded {
        records: parsed,
        text,
        error,
    }
}
