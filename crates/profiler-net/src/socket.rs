//! Socket-backed codec.
//!
//! `SocketReader` / `SocketWriter` implement the fixed-field capability over
//! buffered tokio streams. Every read and every write runs under a fresh
//! deadline, so a stalled peer fails the operation instead of hanging it.
//! The first error is stored; later calls return it without touching the
//! socket.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use profiler_core::codec::MAX_BLOB_LEN;
use profiler_core::{CodecError, FieldReader, FieldWriter, Handle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::observer::Observer;

const READ_BUFFER: usize = 4 * 1024;
const WRITE_BUFFER: usize = 8 * 1024;

// ── SocketReader ──────────────────────────────────────────────────────────────

pub struct SocketReader<R> {
    inner: BufReader<R>,
    pos: u64,
    timeout: Duration,
    done: bool,
    error: Option<CodecError>,
    observer: Arc<dyn Observer>,
}

impl<R: AsyncRead + Unpin + Send> SocketReader<R> {
    pub fn new(inner: R, timeout: Duration, observer: Arc<dyn Observer>) -> Self {
        Self {
            inner: BufReader::with_capacity(READ_BUFFER, inner),
            pos: 0,
            timeout,
            done: false,
            error: None,
            observer,
        }
    }

    /// The stored terminal error, if any.
    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    async fn fill(&mut self, buf: &mut [u8], op: &'static str) -> Result<(), CodecError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.done {
            return Err(CodecError::Eof { pos: self.pos });
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.inner.read_exact(buf)).await {
            Err(_) => Err(CodecError::Timeout {
                op,
                pos: self.pos,
                timeout: self.timeout,
            }),
            Ok(Err(e)) => Err(CodecError::io(self.pos, e)),
            Ok(Ok(_)) => Ok(()),
        };
        let n = if result.is_ok() { buf.len() } else { 0 };
        self.observer.read(n, started.elapsed(), result.as_ref().err());

        match result {
            Ok(()) => {
                tracing::trace!(pos = self.pos, bytes = buf.len(), op, "<-");
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(err) => {
                tracing::debug!(pos = self.pos, op, error = %err, "socket read failed");
                if err.is_eof() {
                    self.done = true;
                }
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn read_array<const N: usize>(&mut self, op: &'static str) -> Result<[u8; N], CodecError> {
        let mut buf = [0u8; N];
        self.fill(&mut buf, op).await?;
        Ok(buf)
    }
}

impl<R: AsyncRead + Unpin + Send> FieldReader for SocketReader<R> {
    fn pos(&self) -> u64 {
        self.pos
    }

    fn is_eof(&self) -> bool {
        self.done || self.error.is_some()
    }

    fn done(&mut self) {
        self.done = true;
    }

    fn read_byte(&mut self) -> impl Future<Output = Result<u8, CodecError>> + Send {
        async move { Ok(self.read_array::<1>("read_byte").await?[0]) }
    }

    fn read_int(&mut self) -> impl Future<Output = Result<i32, CodecError>> + Send {
        async move { Ok(i32::from_be_bytes(self.read_array("read_int").await?)) }
    }

    fn read_long(&mut self) -> impl Future<Output = Result<i64, CodecError>> + Send {
        async move { Ok(i64::from_be_bytes(self.read_array("read_long").await?)) }
    }

    fn read_uuid(&mut self) -> impl Future<Output = Result<Handle, CodecError>> + Send {
        async move { Ok(Handle(self.read_array("read_uuid").await?)) }
    }

    fn read_blob(&mut self) -> impl Future<Output = Result<Vec<u8>, CodecError>> + Send {
        async move {
            let at = self.pos;
            let len = u32::from_be_bytes(self.read_array("read_blob").await?) as usize;
            if len > MAX_BLOB_LEN {
                let err = CodecError::Oversize { len, pos: at };
                self.error = Some(err.clone());
                return Err(err);
            }
            let mut data = vec![0u8; len];
            self.fill(&mut data, "read_blob").await?;
            Ok(data)
        }
    }
}

// ── SocketWriter ──────────────────────────────────────────────────────────────

pub struct SocketWriter<W> {
    inner: BufWriter<W>,
    sent: u64,
    timeout: Duration,
    error: Option<CodecError>,
    observer: Arc<dyn Observer>,
}

impl<W: AsyncWrite + Unpin + Send> SocketWriter<W> {
    pub fn new(inner: W, timeout: Duration, observer: Arc<dyn Observer>) -> Self {
        Self {
            inner: BufWriter::with_capacity(WRITE_BUFFER, inner),
            sent: 0,
            timeout,
            error: None,
            observer,
        }
    }

    pub fn error(&self) -> Option<&CodecError> {
        self.error.as_ref()
    }

    /// Flushes and shuts down the write half.
    pub async fn shutdown(&mut self) -> Result<(), CodecError> {
        let result = tokio::time::timeout(self.timeout, self.inner.shutdown()).await;
        match result {
            Err(_) => Err(CodecError::Timeout {
                op: "shutdown",
                pos: self.sent,
                timeout: self.timeout,
            }),
            Ok(r) => r.map_err(|e| CodecError::io(self.sent, e)),
        }
    }

    async fn put(&mut self, data: &[u8], op: &'static str) -> Result<(), CodecError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.inner.write_all(data)).await {
            Err(_) => Err(CodecError::Timeout {
                op,
                pos: self.sent,
                timeout: self.timeout,
            }),
            Ok(Err(e)) => Err(CodecError::io(self.sent, e)),
            Ok(Ok(())) => Ok(()),
        };
        let n = if result.is_ok() { data.len() } else { 0 };
        self.observer.write(n, started.elapsed(), result.as_ref().err());

        match result {
            Ok(()) => {
                tracing::trace!(pos = self.sent, bytes = data.len(), op, "->");
                self.sent += data.len() as u64;
                Ok(())
            }
            Err(err) => {
                tracing::debug!(pos = self.sent, op, error = %err, "socket write failed");
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> FieldWriter for SocketWriter<W> {
    fn sent(&self) -> u64 {
        self.sent
    }

    fn write_byte(&mut self, v: u8) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move { self.put(&[v], "write_byte").await }
    }

    fn write_int(&mut self, v: i32) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move { self.put(&v.to_be_bytes(), "write_int").await }
    }

    fn write_long(&mut self, v: i64) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move { self.put(&v.to_be_bytes(), "write_long").await }
    }

    fn write_uuid(&mut self, v: Handle) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move { self.put(v.as_bytes(), "write_uuid").await }
    }

    fn write_blob(&mut self, v: &[u8]) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move {
            self.put(&(v.len() as u32).to_be_bytes(), "write_blob").await?;
            self.put(v, "write_blob").await
        }
    }

    fn flush(&mut self) -> impl Future<Output = Result<(), CodecError>> + Send {
        async move {
            if let Some(err) = &self.error {
                return Err(err.clone());
            }
            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, self.inner.flush()).await {
                Err(_) => Err(CodecError::Timeout {
                    op: "flush",
                    pos: self.sent,
                    timeout: self.timeout,
                }),
                Ok(r) => r.map_err(|e| CodecError::io(self.sent, e)),
            };
            self.observer.write(0, started.elapsed(), result.as_ref().err());
            if let Err(err) = &result {
                tracing::debug!(pos = self.sent, error = %err, "socket flush failed");
                self.error = Some(err.clone());
            }
            result
        }
    }
}
