//! Chunk: the byte buffer behind one stream registration.
//!
//! A chunk is created when an agent opens a stream and grows with every
//! RCV_DATA delivered for its handle. The only in-place mutation is the
//! `replace_*` family, which patches bytes that were already appended and
//! never extends the buffer: whatever part of a patch falls past the current
//! size is dropped.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::BlobReader;
use crate::wire::{Handle, StreamType};

#[derive(Debug, Clone)]
pub struct Chunk {
    pub handle: Handle,
    pub stream_type: StreamType,
    pub sequence_id: i32,
    pub rotation_period: i64,
    pub rotation_size: i64,
    buf: BytesMut,
}

impl Chunk {
    pub fn new(
        handle: Handle,
        stream_type: StreamType,
        sequence_id: i32,
        rotation_period: i64,
        rotation_size: i64,
    ) -> Self {
        Self {
            handle,
            stream_type,
            sequence_id,
            rotation_period,
            rotation_size,
            buf: BytesMut::new(),
        }
    }

    /// Convenience for tests and replay: a chunk pre-filled with `data`.
    pub fn with_data(handle: Handle, stream_type: StreamType, data: &[u8]) -> Self {
        let mut chunk = Self::new(handle, stream_type, 0, 0, 0);
        chunk.append(data);
        chunk
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reader(&self) -> BlobReader<'_> {
        BlobReader::new(&self.buf)
    }

    /// Read-only snapshot of the current contents.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    // ── In-place patches ─────────────────────────────────────────────────────

    pub fn replace_byte(&mut self, pos: usize, v: u8) {
        self.replace(pos, &[v]);
    }

    pub fn replace_int(&mut self, pos: usize, v: i32) {
        self.replace(pos, &v.to_be_bytes());
    }

    pub fn replace_long(&mut self, pos: usize, v: i64) {
        self.replace(pos, &v.to_be_bytes());
    }

    pub fn replace_uuid(&mut self, pos: usize, v: Handle) {
        self.replace(pos, v.as_bytes());
    }

    fn replace(&mut self, pos: usize, value: &[u8]) {
        let size = self.buf.len();
        let end = pos.saturating_add(value.len()).min(size);
        if end < pos.saturating_add(value.len()) {
            tracing::debug!(
                handle = %self.handle,
                pos,
                width = value.len(),
                size,
                "patch clamped to written region"
            );
        }
        if pos >= end {
            return;
        }
        self.buf[pos..end].copy_from_slice(&value[..end - pos]);
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk[{}, {}] ({}, {} bytes)",
            self.stream_type,
            self.sequence_id,
            self.handle,
            self.size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk::new(Handle([0xAB; 16]), StreamType::Calls, 3, 3_600_000, 2_097_152)
    }

    #[test]
    fn append_grows_and_bytes_reflect_live_state() {
        let mut c = chunk();
        assert!(c.is_empty());
        c.append(b"abc");
        let before = c.size();
        c.append(b"de");
        assert!(c.size() >= before);
        assert_eq!(c.bytes(), b"abcde");
    }

    #[test]
    fn in_bounds_replace_touches_exact_range() {
        let mut c = chunk();
        c.append(&[0u8; 16]);
        c.replace_int(4, 0x0102_0304);
        assert_eq!(&c.bytes()[..4], &[0, 0, 0, 0]);
        assert_eq!(&c.bytes()[4..8], &[1, 2, 3, 4]);
        assert_eq!(&c.bytes()[8..], &[0u8; 8]);
        assert_eq!(c.size(), 16);
    }

    #[test]
    fn replace_long_stamps_timestamp() {
        let mut c = chunk();
        c.append(&[0u8; 20]);
        c.replace_long(8, 1_700_000_000_000);
        let mut r = c.reader();
        r.read_long().unwrap();
        assert_eq!(r.read_long().unwrap(), 1_700_000_000_000);
    }

    #[test]
    fn replace_past_end_is_clamped_not_extended() {
        let mut c = chunk();
        c.append(&[0u8; 6]);
        c.replace_int(4, 0x0102_0304);
        assert_eq!(c.bytes(), &[0, 0, 0, 0, 1, 2]);
        assert_eq!(c.size(), 6);
    }

    #[test]
    fn replace_at_or_beyond_size_is_noop() {
        let mut c = chunk();
        c.append(&[9u8; 4]);
        c.replace_int(4, -1);
        c.replace_byte(100, 1);
        c.replace_uuid(usize::MAX, Handle([1; 16]));
        assert_eq!(c.bytes(), &[9u8; 4]);
    }

    #[test]
    fn replace_uuid_and_byte() {
        let mut c = chunk();
        c.append(&[0u8; 17]);
        c.replace_byte(0, 0x15);
        c.replace_uuid(1, Handle([0xEE; 16]));
        assert_eq!(c.bytes()[0], 0x15);
        assert_eq!(&c.bytes()[1..], &[0xEE; 16]);
    }

    #[test]
    fn display_names_type_sequence_handle_and_size() {
        let mut c = chunk();
        c.append(&[1, 2, 3]);
        let s = c.to_string();
        assert!(s.starts_with("Chunk[calls, 3] (AB:AB:"), "{s}");
        assert!(s.ends_with(", 3 bytes)"), "{s}");
    }
}
