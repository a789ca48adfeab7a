//! Binary primitive codec.
//!
//! Fixed-width fields (byte, int, long, uuid) are big-endian. Strings on the
//! command channel are a 4-byte length followed by that many bytes. Stream
//! payloads additionally use LEB128-style varints, zigzag folding, and
//! varstrings (varint char count + UTF-16BE code units).
//!
//! `FieldReader` / `FieldWriter` are the transport-agnostic capability the
//! protocol state machine runs on. `BlobReader` / `BlobWriter` implement them
//! over in-memory buffers; the socket-backed pair lives in profiler-net.
//!
//! Every successful read advances the cursor by exactly the bytes consumed.
//! A failed read leaves the cursor untouched, and end of input is sticky.

use std::future::{ready, Future};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::wire::{Handle, MAX_VAR_STRING_CHARS};

/// Largest length prefix accepted for a fixed string or blob.
pub const MAX_BLOB_LEN: usize = 64 * 1024 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    #[error("end of input at pos {pos}")]
    Eof { pos: u64 },

    #[error("i/o error at pos {pos}: {source}")]
    Io {
        pos: u64,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{op} timed out after {timeout:?} at pos {pos}")]
    Timeout {
        op: &'static str,
        pos: u64,
        timeout: Duration,
    },

    #[error("length prefix {len} exceeds limit {} at pos {pos}", MAX_BLOB_LEN)]
    Oversize { len: usize, pos: u64 },
}

impl CodecError {
    /// Stream offset at which the error was observed.
    pub fn pos(&self) -> u64 {
        match self {
            CodecError::Eof { pos }
            | CodecError::Io { pos, .. }
            | CodecError::Timeout { pos, .. }
            | CodecError::Oversize { pos, .. } => *pos,
        }
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Eof { .. })
    }

    pub fn io(pos: u64, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return CodecError::Eof { pos };
        }
        CodecError::Io {
            pos,
            source: Arc::new(err),
        }
    }
}

// ── Capability traits ─────────────────────────────────────────────────────────

/// Read side of the fixed-field codec.
pub trait FieldReader: Send {
    /// Bytes consumed so far.
    fn pos(&self) -> u64;

    /// True once input is exhausted or a terminal condition was observed.
    fn is_eof(&self) -> bool;

    /// Marks the reader finished. Later reads report end of input.
    fn done(&mut self);

    fn read_byte(&mut self) -> impl Future<Output = Result<u8, CodecError>> + Send;

    fn read_int(&mut self) -> impl Future<Output = Result<i32, CodecError>> + Send;

    fn read_long(&mut self) -> impl Future<Output = Result<i64, CodecError>> + Send;

    fn read_uuid(&mut self) -> impl Future<Output = Result<Handle, CodecError>> + Send;

    /// 4-byte length prefix followed by raw bytes.
    fn read_blob(&mut self) -> impl Future<Output = Result<Vec<u8>, CodecError>> + Send;

    /// A blob interpreted as UTF-8 text. Invalid sequences are replaced.
    fn read_string(&mut self) -> impl Future<Output = Result<String, CodecError>> + Send {
        async move {
            let raw = self.read_blob().await?;
            Ok(String::from_utf8_lossy(&raw).into_owned())
        }
    }
}

/// Write side of the fixed-field codec.
pub trait FieldWriter: Send {
    /// Bytes accepted so far (buffered or on the wire).
    fn sent(&self) -> u64;

    fn write_byte(&mut self, v: u8) -> impl Future<Output = Result<(), CodecError>> + Send;

    fn write_int(&mut self, v: i32) -> impl Future<Output = Result<(), CodecError>> + Send;

    fn write_long(&mut self, v: i64) -> impl Future<Output = Result<(), CodecError>> + Send;

    fn write_uuid(&mut self, v: Handle) -> impl Future<Output = Result<(), CodecError>> + Send;

    fn write_blob(&mut self, v: &[u8]) -> impl Future<Output = Result<(), CodecError>> + Send;

    fn write_string(&mut self, v: &str) -> impl Future<Output = Result<(), CodecError>> + Send {
        self.write_blob(v.as_bytes())
    }

    fn flush(&mut self) -> impl Future<Output = Result<(), CodecError>> + Send;
}

// ── Varint arithmetic ─────────────────────────────────────────────────────────

/// Decodes a varint at the head of `buf` without consuming anything.
/// Returns the value and its encoded width, or `None` if `buf` is too short.
///
/// At most five bytes are read; the fifth contributes its bits unconditionally.
fn decode_var_int(buf: &[u8]) -> Option<(i32, usize)> {
    let mut res: u32 = 0;
    for i in 0..4 {
        let b = *buf.get(i)? as u32;
        if b & 0x80 == 0 {
            return Some(((res | b << (7 * i)) as i32, i + 1));
        }
        res |= (b & 0x7f) << (7 * i);
    }
    let b = *buf.get(4)? as u32;
    Some(((res | b << 28) as i32, 5))
}

/// Like `decode_var_int`, but a fifth byte with its continuation bit set is
/// followed by a nested varint carrying bits 35 and up.
fn decode_var_long(buf: &[u8]) -> Option<(i64, usize)> {
    let mut res: i64 = 0;
    for i in 0..4 {
        let b = *buf.get(i)? as i64;
        if b & 0x80 == 0 {
            return Some((res | b << (7 * i), i + 1));
        }
        res |= (b & 0x7f) << (7 * i);
    }
    let b = *buf.get(4)? as i64;
    if b & 0x80 == 0 {
        return Some((res | b << 28, 5));
    }
    res |= (b & 0x7f) << 28;
    let (high, width) = decode_var_int(buf.get(5..)?)?;
    Some((res | (high as i64) << 35, 5 + width))
}

pub fn zigzag_decode(v: i32) -> i32 {
    ((v as u32) >> 1) as i32 ^ -(v & 1)
}

pub fn zigzag_encode(v: i32) -> i32 {
    (v << 1) ^ (v >> 31)
}

pub fn zigzag_decode_long(v: i64) -> i64 {
    ((v as u64) >> 1) as i64 ^ -(v & 1)
}

pub fn zigzag_encode_long(v: i64) -> i64 {
    (v << 1) ^ (v >> 63)
}

// ── BlobReader ────────────────────────────────────────────────────────────────

/// Cursor over an in-memory byte slice: a finished chunk, or a capture file.
#[derive(Debug, Clone)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            done: false,
        }
    }

    pub fn pos(&self) -> u64 {
        self.pos as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.done || self.pos >= self.data.len()
    }

    pub fn done(&mut self) {
        self.done = true;
    }

    fn eof(&mut self) -> CodecError {
        self.done = true;
        CodecError::Eof {
            pos: self.pos as u64,
        }
    }

    /// Unconsumed input, or `None` once the reader is finished.
    fn head(&self) -> Option<&'a [u8]> {
        let data: &'a [u8] = self.data;
        if self.done {
            None
        } else {
            Some(&data[self.pos..])
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        match self.head() {
            Some(head) if head.len() >= n => {
                self.pos += n;
                Ok(&head[..n])
            }
            _ => Err(self.eof()),
        }
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_int(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_long(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_uuid(&mut self) -> Result<Handle, CodecError> {
        Ok(Handle(self.take_array()?))
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let head = self.head().ok_or_else(|| self.eof_at_pos())?;
        if head.len() < 4 {
            return Err(self.eof());
        }
        let len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        if len > MAX_BLOB_LEN {
            return Err(CodecError::Oversize {
                len,
                pos: self.pos as u64,
            });
        }
        if head.len() < 4 + len {
            return Err(self.eof());
        }
        self.pos += 4 + len;
        Ok(head[4..4 + len].to_vec())
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let raw = self.read_blob()?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn eof_at_pos(&self) -> CodecError {
        CodecError::Eof {
            pos: self.pos as u64,
        }
    }

    pub fn read_var_int(&mut self) -> Result<i32, CodecError> {
        let head = self.head().ok_or_else(|| self.eof_at_pos())?;
        match decode_var_int(head) {
            Some((v, width)) => {
                self.pos += width;
                Ok(v)
            }
            None => Err(self.eof()),
        }
    }

    pub fn read_var_long(&mut self) -> Result<i64, CodecError> {
        let head = self.head().ok_or_else(|| self.eof_at_pos())?;
        match decode_var_long(head) {
            Some((v, width)) => {
                self.pos += width;
                Ok(v)
            }
            None => Err(self.eof()),
        }
    }

    pub fn read_var_int_zigzag(&mut self) -> Result<i32, CodecError> {
        self.read_var_int().map(zigzag_decode)
    }

    pub fn read_var_long_zigzag(&mut self) -> Result<i64, CodecError> {
        self.read_var_long().map(zigzag_decode_long)
    }

    /// Varint char count followed by UTF-16BE code units.
    ///
    /// A count above `MAX_VAR_STRING_CHARS` yields an empty string; only the
    /// count itself is consumed in that case.
    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let head = self.head().ok_or_else(|| self.eof_at_pos())?;
        let (len, width) = match decode_var_int(head) {
            Some(v) => v,
            None => return Err(self.eof()),
        };
        let chars = len as u32 as usize;
        if len < 0 || chars > MAX_VAR_STRING_CHARS {
            tracing::debug!(pos = self.pos, len, "varstring length over limit");
            self.pos += width;
            return Ok(String::new());
        }
        let body = match head.get(width..width + 2 * chars) {
            Some(body) => body,
            None => return Err(self.eof()),
        };
        let units: Vec<u16> = body
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.pos += width + 2 * chars;
        Ok(String::from_utf16_lossy(&units))
    }
}

impl FieldReader for BlobReader<'_> {
    fn pos(&self) -> u64 {
        BlobReader::pos(self)
    }

    fn is_eof(&self) -> bool {
        BlobReader::is_eof(self)
    }

    fn done(&mut self) {
        BlobReader::done(self)
    }

    fn read_byte(&mut self) -> impl Future<Output = Result<u8, CodecError>> + Send {
        ready(BlobReader::read_byte(self))
    }

    fn read_int(&mut self) -> impl Future<Output = Result<i32, CodecError>> + Send {
        ready(BlobReader::read_int(self))
    }

    fn read_long(&mut self) -> impl Future<Output = Result<i64, CodecError>> + Send {
        ready(BlobReader::read_long(self))
    }

    fn read_uuid(&mut self) -> impl Future<Output = Result<Handle, CodecError>> + Send {
        ready(BlobReader::read_uuid(self))
    }

    fn read_blob(&mut self) -> impl Future<Output = Result<Vec<u8>, CodecError>> + Send {
        ready(BlobReader::read_blob(self))
    }
}

// ── BlobWriter ────────────────────────────────────────────────────────────────

/// Growable in-memory encoder. Used to build chunk payloads and captures.
#[derive(Debug, Default, Clone)]
pub struct BlobWriter {
    buf: BytesMut,
}

impl BlobWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn write_byte(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_int(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn write_long(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }

    pub fn write_uuid(&mut self, v: Handle) -> &mut Self {
        self.buf.put_slice(v.as_bytes());
        self
    }

    pub fn write_blob(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_u32(v.len() as u32);
        self.buf.put_slice(v);
        self
    }

    pub fn write_string(&mut self, v: &str) -> &mut Self {
        self.write_blob(v.as_bytes())
    }

    pub fn write_raw(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn write_var_int(&mut self, v: i32) -> &mut Self {
        let mut u = v as u32;
        while u >= 0x80 {
            self.buf.put_u8((u as u8 & 0x7f) | 0x80);
            u >>= 7;
        }
        self.buf.put_u8(u as u8);
        self
    }

    /// Seven bits per byte for the low 35 bits, then the remainder as a
    /// nested varint. Matches `read_var_long`.
    pub fn write_var_long(&mut self, v: i64) -> &mut Self {
        let mut u = v as u64;
        for _ in 0..4 {
            if u < 0x80 {
                self.buf.put_u8(u as u8);
                return self;
            }
            self.buf.put_u8((u as u8 & 0x7f) | 0x80);
            u >>= 7;
        }
        if u < 0x80 {
            self.buf.put_u8(u as u8);
            return self;
        }
        self.buf.put_u8((u as u8 & 0x7f) | 0x80);
        self.write_var_int((u >> 7) as i32)
    }

    pub fn write_var_int_zigzag(&mut self, v: i32) -> &mut Self {
        self.write_var_int(zigzag_encode(v))
    }

    pub fn write_var_long_zigzag(&mut self, v: i64) -> &mut Self {
        self.write_var_long(zigzag_encode_long(v))
    }

    pub fn write_var_string(&mut self, v: &str) -> &mut Self {
        let units: Vec<u16> = v.encode_utf16().collect();
        self.write_var_int(units.len() as i32);
        for unit in units {
            self.buf.put_u16(unit);
        }
        self
    }
}

impl FieldWriter for BlobWriter {
    fn sent(&self) -> u64 {
        self.buf.len() as u64
    }

    fn write_byte(&mut self, v: u8) -> impl Future<Output = Result<(), CodecError>> + Send {
        BlobWriter::write_byte(self, v);
        ready(Ok(()))
    }

    fn write_int(&mut self, v: i32) -> impl Future<Output = Result<(), CodecError>> + Send {
        BlobWriter::write_int(self, v);
        ready(Ok(()))
    }

    fn write_long(&mut self, v: i64) -> impl Future<Output = Result<(), CodecError>> + Send {
        BlobWriter::write_long(self, v);
        ready(Ok(()))
    }

    fn write_uuid(&mut self, v: Handle) -> impl Future<Output = Result<(), CodecError>> + Send {
        BlobWriter::write_uuid(self, v);
        ready(Ok(()))
    }

    fn write_blob(&mut self, v: &[u8]) -> impl Future<Output = Result<(), CodecError>> + Send {
        BlobWriter::write_blob(self, v);
        ready(Ok(()))
    }

    fn flush(&mut self) -> impl Future<Output = Result<(), CodecError>> + Send {
        ready(Ok(()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_known_vectors() {
        let mut r = BlobReader::new(&[34]);
        assert_eq!(r.read_var_int().unwrap(), 34);
        assert_eq!(r.pos(), 1);

        let mut r = BlobReader::new(&[130, 36]);
        assert_eq!(r.read_var_int().unwrap(), 4610);
        assert_eq!(r.pos(), 2);

        let mut r = BlobReader::new(&[0x90, 0xA4, 54]);
        assert_eq!(r.read_var_int().unwrap(), 889_360);
        assert_eq!(r.pos(), 3);

        let mut r = BlobReader::new(&[0x90, 0xA4, 0xE3, 40]);
        assert_eq!(r.read_var_int().unwrap(), 85_512_720);
        assert_eq!(r.pos(), 4);
    }

    #[test]
    fn var_long_known_vectors() {
        let mut r = BlobReader::new(&[0x93, 0xA4, 54]);
        assert_eq!(r.read_var_long().unwrap(), 889_363);
        assert_eq!(r.pos(), 3);
    }

    #[test]
    fn zigzag_folds_signs() {
        assert_eq!(zigzag_decode(34), 17);
        assert_eq!(zigzag_decode(1), -1);
        assert_eq!(zigzag_decode(3), -2);
        assert_eq!(zigzag_decode(zigzag_encode(i32::MIN)), i32::MIN);
        assert_eq!(zigzag_decode_long(zigzag_encode_long(-123_456_789_012)), -123_456_789_012);
    }

    #[test]
    fn var_int_round_trip_and_width() {
        for v in [0, 1, 0x7f, 0x80, 300, 16_383, 16_384, 2_097_151, i32::MAX, -1, i32::MIN] {
            let mut w = BlobWriter::new();
            w.write_var_int(v);
            let mut r = BlobReader::new(w.as_slice());
            assert_eq!(r.read_var_int().unwrap(), v);
            assert_eq!(r.pos() as usize, w.len());
            if (0..0x80).contains(&v) {
                assert_eq!(w.len(), 1);
            }
        }
    }

    #[test]
    fn var_long_round_trip_past_35_bits() {
        for v in [0i64, 0x7f, 1 << 34, (1 << 35) + 5, 12_406_297_107, i64::MAX, -1, i64::MIN] {
            let mut w = BlobWriter::new();
            w.write_var_long(v);
            let mut r = BlobReader::new(w.as_slice());
            assert_eq!(r.read_var_long().unwrap(), v, "value {v}");
            assert!(r.is_eof());
        }
    }

    #[test]
    fn var_string_known_vector() {
        let data = [4, 0, 33, 0, 32, 0, 56, 0, 58];
        let mut r = BlobReader::new(&data);
        assert_eq!(r.read_var_string().unwrap(), "! 8:");
        assert_eq!(r.pos(), 9);
    }

    #[test]
    fn var_string_over_limit_is_empty() {
        let mut w = BlobWriter::new();
        w.write_var_int(MAX_VAR_STRING_CHARS as i32 + 1);
        w.write_raw(&[0, 65]);
        let mut r = BlobReader::new(w.as_slice());
        assert_eq!(r.read_var_string().unwrap(), "");
        assert_eq!(r.pos(), 4);
    }

    #[test]
    fn var_string_handles_non_ascii() {
        let mut w = BlobWriter::new();
        w.write_var_string("héllo wörld ✓");
        let mut r = BlobReader::new(w.as_slice());
        assert_eq!(r.read_var_string().unwrap(), "héllo wörld ✓");
    }

    #[test]
    fn fixed_fields_round_trip_and_advance() {
        let handle = Handle([7u8; 16]);
        let mut w = BlobWriter::new();
        w.write_byte(0xAB)
            .write_int(-5)
            .write_long(1_700_000_000_000)
            .write_uuid(handle)
            .write_string("pod-1");

        let mut r = BlobReader::new(w.as_slice());
        assert_eq!(r.read_byte().unwrap(), 0xAB);
        assert_eq!(r.pos(), 1);
        assert_eq!(r.read_int().unwrap(), -5);
        assert_eq!(r.pos(), 5);
        assert_eq!(r.read_long().unwrap(), 1_700_000_000_000);
        assert_eq!(r.pos(), 13);
        assert_eq!(r.read_uuid().unwrap(), handle);
        assert_eq!(r.pos(), 29);
        assert_eq!(r.read_string().unwrap(), "pod-1");
        assert_eq!(r.pos(), 29 + 4 + 5);
        assert!(r.is_eof());
    }

    #[test]
    fn fixed_int_is_big_endian() {
        let mut r = BlobReader::new(&[4, 0, 0, 1]);
        assert_eq!(r.read_int().unwrap(), 67_108_865);
    }

    #[test]
    fn eof_is_sticky_and_keeps_cursor() {
        let mut r = BlobReader::new(&[1, 2, 3]);
        assert_eq!(r.read_byte().unwrap(), 1);
        let err = r.read_int().unwrap_err();
        assert!(err.is_eof());
        assert_eq!(err.pos(), 1);
        assert_eq!(r.pos(), 1);

        // Enough bytes remain for a single byte, but the reader is finished.
        assert!(r.read_byte().unwrap_err().is_eof());
        assert!(r.read_var_int().unwrap_err().is_eof());
        assert_eq!(r.pos(), 1);
        assert!(r.is_eof());
    }

    #[test]
    fn truncated_var_int_does_not_advance() {
        let mut r = BlobReader::new(&[0x90, 0xA4]);
        assert!(r.read_var_int().unwrap_err().is_eof());
        assert_eq!(r.pos(), 0);
    }

    #[test]
    fn oversize_blob_is_rejected() {
        let mut w = BlobWriter::new();
        w.write_int((MAX_BLOB_LEN + 1) as i32);
        let mut r = BlobReader::new(w.as_slice());
        assert!(matches!(r.read_blob(), Err(CodecError::Oversize { .. })));
        assert_eq!(r.pos(), 0);
    }

    #[tokio::test]
    async fn field_traits_delegate_to_blob_codec() {
        let mut w = BlobWriter::new();
        FieldWriter::write_long(&mut w, 42).await.unwrap();
        FieldWriter::write_string(&mut w, "svc").await.unwrap();
        FieldWriter::flush(&mut w).await.unwrap();
        assert_eq!(w.sent(), 8 + 4 + 3);

        let bytes = w.into_vec();
        let mut r = BlobReader::new(&bytes);
        assert_eq!(FieldReader::read_long(&mut r).await.unwrap(), 42);
        assert_eq!(FieldReader::read_string(&mut r).await.unwrap(), "svc");
        assert!(FieldReader::is_eof(&r));
    }
}
