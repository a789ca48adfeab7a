//! PodDump: everything one pod sent over one connection.
//!
//! Chunks are kept by handle for the lifetime of the dump. A second
//! registration of the same stream type moves the type lookup to the new
//! handle; the earlier chunk stays addressable by its own handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use profiler_core::wire::{DEFAULT_PROTOCOL_VERSION, POS_DICTIONARY_STREAM, POS_DICTIONARY_VERSION};
use profiler_core::{Chunk, Handle, StreamType};
use serde::Serialize;

use crate::{
    read_calls, read_dictionary, read_params, read_string_stream, read_suspend, read_traces, Calls, Decoded,
    Dictionary, Params, StringRecord, Suspends, Traces,
};

#[derive(Debug, Clone)]
pub struct PodDump {
    pub protocol_version: i64,
    pub namespace: String,
    pub service: String,
    pub pod: String,
    streams: HashMap<Handle, Chunk>,
    latest: HashMap<StreamType, Handle>,
}

impl Default for PodDump {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            namespace: "unknown".into(),
            service: "unknown".into(),
            pod: "unknown".into(),
            streams: HashMap::new(),
            latest: HashMap::new(),
        }
    }
}

/// Summary of one chunk, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub handle: String,
    pub stream_type: String,
    pub sequence_id: i32,
    pub bytes: usize,
}

impl PodDump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pod(&mut self, version: i64, namespace: &str, service: &str, pod: &str) {
        self.protocol_version = version;
        self.namespace = namespace.to_string();
        self.service = service.to_string();
        self.pod = pod.to_string();
    }

    /// Adds a chunk and makes it the latest of its type.
    pub fn register_stream(&mut self, chunk: Chunk) {
        self.latest.insert(chunk.stream_type.clone(), chunk.handle);
        self.streams.insert(chunk.handle, chunk);
    }

    /// Appends to the chunk behind `handle`. Returns bytes appended, 0 for
    /// an unknown handle.
    pub fn append(&mut self, handle: &Handle, data: &[u8]) -> usize {
        match self.streams.get_mut(handle) {
            Some(chunk) => {
                chunk.append(data);
                data.len()
            }
            None => {
                tracing::debug!(%handle, bytes = data.len(), "data for unknown handle");
                0
            }
        }
    }

    pub fn chunk(&self, handle: &Handle) -> Option<&Chunk> {
        self.streams.get(handle)
    }

    /// Latest chunk registered for `stream_type`.
    pub fn by_type(&self, stream_type: &StreamType) -> Option<&Chunk> {
        self.latest.get(stream_type).and_then(|h| self.streams.get(h))
    }

    pub fn latest_handle(&self, stream_type: &StreamType) -> Option<Handle> {
        self.latest.get(stream_type).copied()
    }

    /// Dictionary chunk, honouring the `posDictionary` name newer agents use.
    pub fn dictionary_chunk(&self) -> Option<&Chunk> {
        if self.protocol_version == POS_DICTIONARY_VERSION {
            if let Some(chunk) = self.by_type(&StreamType::Other(POS_DICTIONARY_STREAM.into())) {
                return Some(chunk);
            }
        }
        self.by_type(&StreamType::Dictionary)
    }

    /// `namespace:service:pod`
    pub fn name(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.service, self.pod)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.streams.values()
    }

    pub fn chunk_count(&self) -> usize {
        self.streams.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.streams.values().map(Chunk::size).sum()
    }

    /// Stream types present, sorted by name.
    pub fn stream_types(&self) -> Vec<StreamType> {
        let mut list: Vec<StreamType> = self.latest.keys().cloned().collect();
        list.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        list
    }

    pub fn summaries(&self) -> Vec<ChunkSummary> {
        let mut list: Vec<ChunkSummary> = self
            .streams
            .values()
            .map(|c| ChunkSummary {
                handle: c.handle.to_string(),
                stream_type: c.stream_type.to_string(),
                sequence_id: c.sequence_id,
                bytes: c.size(),
            })
            .collect();
        list.sort_by(|a, b| (&a.stream_type, a.sequence_id).cmp(&(&b.stream_type, b.sequence_id)));
        list
    }

    /// Decodes the latest chunk of every known stream type. The dictionary
    /// goes first so trace rendering can resolve tag names.
    pub fn parse_streams(&self) -> ParsedStreams {
        tracing::debug!(pod = %self.name(), chunks = self.streams.len(), "parsing streams");

        let dictionary = self.dictionary_chunk().map(read_dictionary);
        let dict_ref = dictionary.as_ref().map(|d| &d.records);
        let parsed = ParsedStreams {
            params: self.by_type(&StreamType::Params).map(read_params),
            suspend: self.by_type(&StreamType::Suspend).map(read_suspend),
            calls: self.by_type(&StreamType::Calls).map(read_calls),
            traces: self.by_type(&StreamType::Trace).map(|c| read_traces(c, dict_ref)),
            sql: self.by_type(&StreamType::Sql).map(read_string_stream),
            xml: self.by_type(&StreamType::Xml).map(read_string_stream),
            dictionary,
        };

        for (stream, err) in parsed.errors() {
            tracing::warn!(pod = %self.name(), stream, pos = err.pos(), error = %err, "partial decode");
        }
        parsed
    }

    /// `base/<namespace>/<service>`, with each agent-supplied name reduced
    /// to one plain path component.
    pub fn dump_dir(&self, base: &Path) -> PathBuf {
        base.join(path_component(&self.namespace))
            .join(path_component(&self.service))
    }

    /// Writes `<pod>.<type>.<seq>.bin` for the latest chunk of each type and
    /// `<pod>.<type>.<seq>.<handle>.bin` for superseded ones, plus the `.txt`
    /// rendering for decoded streams. Returns the files written.
    pub fn write_files(&self, dir: &Path, parsed: &ParsedStreams) -> std::io::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let pod = path_component(&self.pod);
        let mut written = Vec::new();
        for chunk in self.streams.values() {
            let kind = path_component(chunk.stream_type.as_str());
            let latest = self.latest.get(&chunk.stream_type) == Some(&chunk.handle);
            let stem = if latest {
                format!("{pod}.{kind}.{}", chunk.sequence_id)
            } else {
                format!("{pod}.{kind}.{}.{}", chunk.sequence_id, hex::encode(chunk.handle.as_bytes()))
            };
            let bin = dir.join(format!("{stem}.bin"));
            std::fs::write(&bin, chunk.bytes())?;
            written.push(bin);

            if !latest {
                continue;
            }
            if let Some(text) = parsed.text_for(&chunk.stream_type) {
                let txt = dir.join(format!("{stem}.txt"));
                std::fs::write(&txt, text)?;
                written.push(txt);
            }
        }
        tracing::info!(pod = %self.name(), dir = %dir.display(), files = written.len(), "pod dump written");
        Ok(written)
    }
}

/// Decoder output for the latest chunk of each stream type.
#[derive(Debug, Clone, Default)]
pub struct ParsedStreams {
    pub dictionary: Option<Decoded<Dictionary>>,
    pub params: Option<Decoded<Params>>,
    pub suspend: Option<Decoded<Suspends>>,
    pub calls: Option<Decoded<Calls>>,
    pub traces: Option<Decoded<Traces>>,
    pub sql: Option<Decoded<Vec<StringRecord>>>,
    pub xml: Option<Decoded<Vec<StringRecord>>>,
}

impl ParsedStreams {
    pub fn text_for(&self, stream_type: &StreamType) -> Option<&str> {
        let text = match stream_type {
            StreamType::Dictionary => self.dictionary.as_ref().map(|d| &d.text),
            StreamType::Params => self.params.as_ref().map(|d| &d.text),
            StreamType::Suspend => self.suspend.as_ref().map(|d| &d.text),
            StreamType::Calls => self.calls.as_ref().map(|d| &d.text),
            StreamType::Trace => self.traces.as_ref().map(|d| &d.text),
            StreamType::Sql => self.sql.as_ref().map(|d| &d.text),
            StreamType::Xml => self.xml.as_ref().map(|d| &d.text),
            StreamType::Other(name) if name == POS_DICTIONARY_STREAM => self.dictionary.as_ref().map(|d| &d.text),
            StreamType::Other(_) => None,
        };
        text.map(String::as_str)
    }

    /// Every stream that stopped early, with its error.
    pub fn errors(&self) -> Vec<(&'static str, &crate::DecodeError)> {
        [
            self.dictionary.as_ref().and_then(|d| d.error.as_ref()),
            self.params.as_ref().and_then(|d| d.error.as_ref()),
            self.suspend.as_ref().and_then(|d| d.error.as_ref()),
            self.calls.as_ref().and_then(|d| d.error.as_ref()),
            self.traces.as_ref().and_then(|d| d.error.as_ref()),
            self.sql.as_ref().and_then(|d| d.error.as_ref()),
            self.xml.as_ref().and_then(|d| d.error.as_ref()),
        ]
        .into_iter()
        .flatten()
        .map(|e| (e.stream, e))
        .collect()
    }
}

/// Maps a name from the wire onto a single file name: separators become `_`
/// and names made only of dots (or empty) are replaced.
fn path_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}
