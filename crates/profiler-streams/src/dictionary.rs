//! Dictionary stream: the string table that calls and traces reference by
//! tag id.
//!
//! Layout: repeated phrases of `[phraseLength:int][varstring]*`, where
//! `phraseLength` counts the bytes of the varstrings that follow it.

use profiler_core::{BlobReader, Chunk};
use serde::Serialize;

use crate::{Decoded, DecodeError};

/// Returned by `Dictionary::get` for ids outside the table.
pub const UNKNOWN_WORD: &str = "<unknown>";

/// Phrase cap for a full decode.
const MAX_PHRASES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DictWord {
    pub pos: u64,
    pub bytes: u64,
    pub word: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Dictionary {
    pub words: Vec<DictWord>,
}

impl Dictionary {
    /// Word for tag `id`. Never fails; unknown ids map to `UNKNOWN_WORD`.
    pub fn get(&self, id: i32) -> &str {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.words.get(i))
            .map(|w| w.word.as_str())
            .unwrap_or(UNKNOWN_WORD)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Leading part of a dictionary chunk, as selected by `read_dictionary_until`.
#[derive(Debug, Clone)]
pub struct DictionaryPrefix {
    pub dictionary: Dictionary,
    /// Offset just past the last word inside the limits.
    pub pos: usize,
    pub error: Option<DecodeError>,
}

struct Scan {
    dictionary: Dictionary,
    lines: usize,
    phrases: usize,
    error: Option<DecodeError>,
}

fn scan(
    data: &[u8],
    limit_phrases: usize,
    mut on_word: impl FnMut(&BlobReader<'_>, usize, &str) -> bool,
) -> Scan {
    let mut r = BlobReader::new(data);
    let mut dictionary = Dictionary::default();
    let mut lines = 0;
    let mut phrases = 0;
    let mut error = None;

    let mut phrase_len: i64 = -1;
    while !r.is_eof() {
        lines += 1;
        if phrase_len <= 0 {
            phrases += 1;
            if phrases > limit_phrases {
                break;
            }
            match r.read_int() {
                Ok(len) => phrase_len = len as i64,
                Err(e) => {
                    error = Some(DecodeError::new("dictionary", e));
                    break;
                }
            }
            if r.is_eof() {
                break;
            }
        }

        let pos = r.pos();
        let word = match r.read_var_string() {
            Ok(word) => word,
            Err(e) => {
                error = Some(DecodeError::new("dictionary", e));
                break;
            }
        };
        let bytes = r.pos() - pos;
        phrase_len -= bytes as i64;

        let keep = on_word(&r, lines, &word);
        dictionary.words.push(DictWord { pos, bytes, word });
        if !keep {
            break;
        }
    }

    Scan {
        dictionary,
        lines,
        phrases,
        error,
    }
}

/// Decodes a whole dictionary chunk. Text: one word per `\r\n`-terminated line.
pub fn read_dictionary(chunk: &Chunk) -> Decoded<Dictionary> {
    tracing::debug!(chunk = %chunk, "reading dictionary");

    let mut text = String::new();
    let mut str_len = 0usize;
    let scan = scan(chunk.bytes(), MAX_PHRASES, |_, _, word| {
        text.push_str(word);
        text.push_str("\r\n");
        str_len += word.len();
        true
    });

    tracing::debug!(
        lines = scan.lines,
        phrases = scan.phrases,
        string_bytes = 2 * str_len,
        chunk_bytes = chunk.size(),
        "dictionary read"
    );
    if let Some(err) = &scan.error {
        tracing::warn!(pos = err.pos(), error = %err, "dictionary decode stopped");
    }

    Decoded {
        records: scan.dictionary,
        text,
        error: scan.error,
    }
}

/// Scans at most `limit_phrases` phrases and `limit_words` words and reports
/// the offset just past the last word kept. A limit of 0 means unlimited.
///
/// Used to replay only the head of a dictionary to a collector.
pub fn read_dictionary_until(chunk: &Chunk, limit_phrases: usize, limit_words: usize) -> DictionaryPrefix {
    let limit_phrases = if limit_phrases == 0 { usize::MAX } else { limit_phrases };
    let limit_words = if limit_words == 0 { usize::MAX } else { limit_words };

    let mut pos = 0usize;
    let scan = scan(chunk.bytes(), limit_phrases, |r, n, word| {
        if n > limit_words {
            tracing::debug!(n, word, "dictionary limit reached");
            return false;
        }
        pos = r.pos() as usize;
        true
    });

    let mut dictionary = scan.dictionary;
    dictionary.words.truncate(limit_words.min(dictionary.words.len()));
    DictionaryPrefix {
        dictionary,
        pos,
        error: scan.error,
    }
}
