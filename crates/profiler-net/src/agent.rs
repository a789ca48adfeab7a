//! AgentConnection: the agent side of the protocol.
//!
//! Drives an agent session against a collector: handshake, stream opening,
//! segmented data delivery with acknowledgement accounting, and close. Used by
//! the emulator and by integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use profiler_core::wire::{ACK_OK, MAX_BUF_SIZE};
use profiler_core::{Chunk, Command, FieldReader, FieldWriter, Handle, StreamType};
use profiler_streams::{read_dictionary_until, PodDump};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::observer::Observer;
use crate::protocol::{Request, StreamOpened};
use crate::server::ConnectionOptions;
use crate::socket::{SocketReader, SocketWriter};
use crate::ProtocolError;

/// Pause between dictionary segments, matching a live agent's cadence.
const DICTIONARY_PACE: Duration = Duration::from_micros(10);

pub struct AgentConnection {
    reader: Option<SocketReader<OwnedReadHalf>>,
    writer: Option<SocketWriter<OwnedWriteHalf>>,
    peer: SocketAddr,
    pod: String,
    pending_acks: usize,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
}

impl AgentConnection {
    /// Dials the collector, bounded by the connect timeout.
    pub async fn connect(
        addr: &str,
        opts: ConnectionOptions,
        observer: Arc<dyn Observer>,
        cancel: CancellationToken,
    ) -> Result<Self, ProtocolError> {
        tracing::debug!(addr, timeout = ?opts.connect_timeout, "connecting");
        let stream = match tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ProtocolError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: opts.connect_timeout,
                })
            }
            Ok(Err(source)) => {
                return Err(ProtocolError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let peer = stream.peer_addr().map_err(|source| ProtocolError::Connect {
            addr: addr.to_string(),
            source,
        })?;
        let (r, w) = stream.into_split();

        Ok(Self {
            reader: Some(SocketReader::new(r, opts.read_timeout, observer.clone())),
            writer: Some(SocketWriter::new(w, opts.write_timeout, observer.clone())),
            peer,
            pod: String::new(),
            pending_acks: 0,
            observer,
            cancel,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Acks the collector still owes us.
    pub fn pending_acks(&self) -> usize {
        self.pending_acks
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some() && self.writer.is_some()
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// GET_PROTOCOL_VERSION_V2. Returns the collector's version.
    pub async fn initialize_connection(
        &mut self,
        version: i64,
        namespace: &str,
        service: &str,
        pod: &str,
    ) -> Result<i64, ProtocolError> {
        self.pod = pod.to_string();
        let req = Request::GetProtocolVersionV2 {
            version,
            pod: pod.to_string(),
            service: service.to_string(),
            namespace: namespace.to_string(),
        };
        let started = self.begin(&req, true).await?;
        let result = self.reader()?.read_long().await.map_err(ProtocolError::from);
        self.finish(Command::GetProtocolVersionV2, started, &result);
        let server = result?;
        tracing::debug!(client = version, server, pod, "protocol handshake");
        Ok(server)
    }

    /// INIT_STREAM_V2. Drains outstanding acks before reading the response.
    pub async fn init_stream(
        &mut self,
        stream_type: &str,
        requested_seq: i32,
        reset_required: bool,
    ) -> Result<StreamOpened, ProtocolError> {
        let req = Request::InitStreamV2 {
            stream_type: stream_type.to_string(),
            requested_seq,
            reset_required: i32::from(reset_required),
        };
        let started = self.begin(&req, true).await?;
        let result = match self.drain_acks().await {
            Ok(()) => StreamOpened::read_from(self.reader()?).await,
            Err(e) => Err(e),
        };
        self.finish(Command::InitStreamV2, started, &result);
        let opened = result?;
        tracing::debug!(
            pod = %self.pod,
            stream_type,
            requested_seq,
            handle = %opened.handle,
            rotation_period = opened.rotation_period,
            rotation_size = opened.rotation_size,
            rolling_seq = opened.rolling_seq,
            "stream opened"
        );
        Ok(opened)
    }

    /// RCV_DATA followed by a REQUEST_ACK_FLUSH byte. Two acks become
    /// pending. Nothing is flushed.
    pub async fn rcv_data(&mut self, handle: Handle, payload: &[u8]) -> Result<(), ProtocolError> {
        let req = Request::RcvData {
            handle,
            payload: payload.to_vec(),
        };
        let started = self.begin(&req, false).await?;
        let result = self.writer()?.write_byte(Command::RequestAckFlush.into()).await.map_err(ProtocolError::from);
        if result.is_ok() {
            self.pending_acks += 2;
        }
        self.finish(Command::RcvData, started, &result);
        result
    }

    pub async fn request_flush(&mut self) -> Result<(), ProtocolError> {
        let started = self.begin(&Request::RequestAckFlush, true).await?;
        self.pending_acks += 1;
        self.report(Command::RequestAckFlush, started, None);
        Ok(())
    }

    pub async fn report_command_result(&mut self, command_id: Handle, success: bool) -> Result<(), ProtocolError> {
        let req = Request::ReportCommandResult {
            command_id,
            success: u8::from(success),
        };
        let started = self.begin(&req, true).await?;
        self.report(Command::ReportCommandResult, started, None);
        Ok(())
    }

    /// Sends CLOSE, releases the socket, and cancels the connection's token.
    /// Later sends fail with `NotConnected`.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        let result = match self.begin(&Request::Close, true).await {
            Ok(started) => {
                self.report(Command::Close, started, None);
                Ok(())
            }
            Err(ProtocolError::NotConnected) => return Ok(()),
            Err(ProtocolError::Cancelled) => Ok(()),
            Err(e) => Err(e),
        };
        if let Some(mut w) = self.writer.take() {
            if let Err(e) = w.shutdown().await {
                tracing::debug!(error = %e, "shutdown failed");
            }
        }
        self.reader = None;
        self.cancel.cancel();
        result
    }

    /// Flushes anything buffered, then reads ack bytes until none are
    /// pending.
    pub async fn wait_for_acks(&mut self) -> Result<(), ProtocolError> {
        self.check_alive()?;
        self.writer()?.flush().await?;
        self.drain_acks().await
    }

    // ── Chunk delivery ───────────────────────────────────────────────────────

    /// Opens a stream and sends the first `len` bytes of `data` in
    /// `MAX_BUF_SIZE` segments, pausing `pace` between segments, then flushes.
    pub async fn send_chunk_bytes(
        &mut self,
        stream_type: &StreamType,
        requested_seq: i32,
        data: &[u8],
        pace: Duration,
    ) -> Result<Handle, ProtocolError> {
        let opened = self.init_stream(stream_type.as_str(), requested_seq, false).await?;
        for segment in data.chunks(MAX_BUF_SIZE) {
            self.rcv_data(opened.handle, segment).await?;
            if !pace.is_zero() {
                tokio::time::sleep(pace).await;
            }
        }
        self.writer()?.flush().await?;
        tracing::debug!(
            pod = %self.pod,
            stream_type = %stream_type,
            handle = %opened.handle,
            bytes = data.len(),
            "chunk sent"
        );
        Ok(opened.handle)
    }

    /// Sends the whole chunk without pacing.
    pub async fn send_stream(&mut self, requested_seq: i32, chunk: &Chunk) -> Result<Handle, ProtocolError> {
        tracing::trace!(pod = %self.pod, chunk = %chunk, "sending chunk");
        self.send_chunk_bytes(&chunk.stream_type, requested_seq, chunk.bytes(), Duration::ZERO)
            .await
    }

    /// Sends the dictionary prefix that fits the limits (0 = unlimited).
    pub async fn send_dictionary(
        &mut self,
        requested_seq: i32,
        chunk: &Chunk,
        limit_phrases: usize,
        limit_words: usize,
    ) -> Result<Handle, ProtocolError> {
        let prefix = read_dictionary_until(chunk, limit_phrases, limit_words);
        let end = prefix.pos.min(chunk.size());
        self.send_chunk_bytes(&chunk.stream_type, requested_seq, &chunk.bytes()[..end], DICTIONARY_PACE)
            .await
    }

    /// Re-stamps the calls start time to `emulated_ts` and spreads the
    /// segments evenly over `period`.
    pub async fn send_calls(
        &mut self,
        requested_seq: i32,
        chunk: &mut Chunk,
        emulated_ts: i64,
        period: Duration,
    ) -> Result<Handle, ProtocolError> {
        chunk.replace_long(8, emulated_ts);
        let pace = segment_pace(chunk.size(), period);
        self.send_chunk_bytes(&chunk.stream_type, requested_seq, chunk.bytes(), pace)
            .await
    }

    /// Sends a trace chunk spread evenly over `period`.
    pub async fn send_traces(&mut self, requested_seq: i32, chunk: &Chunk, period: Duration) -> Result<Handle, ProtocolError> {
        let pace = segment_pace(chunk.size(), period);
        self.send_chunk_bytes(&chunk.stream_type, requested_seq, chunk.bytes(), pace)
            .await
    }

    /// Sends every stream of `dump`, dictionary first, then waits until the
    /// collector has acknowledged all of it. Calls are re-stamped to
    /// `emulated_ts`; calls and traces are spread over `period`.
    pub async fn send_pod_dump(
        &mut self,
        dump: &PodDump,
        emulated_ts: i64,
        period: Duration,
    ) -> Result<Vec<(StreamType, Handle)>, ProtocolError> {
        let mut sent = Vec::new();
        let dictionary = dump.dictionary_chunk();
        if let Some(chunk) = dictionary {
            let handle = self.send_dictionary(chunk.sequence_id, chunk, 0, 0).await?;
            sent.push((chunk.stream_type.clone(), handle));
        }

        for stream_type in dump.stream_types() {
            let Some(chunk) = dump.by_type(&stream_type) else {
                continue;
            };
            if dictionary.is_some_and(|d| d.handle == chunk.handle) {
                continue;
            }
            let handle = match stream_type {
                StreamType::Calls => {
                    let mut calls = chunk.clone();
                    self.send_calls(chunk.sequence_id, &mut calls, emulated_ts, period)
                        .await?
                }
                StreamType::Trace => self.send_traces(chunk.sequence_id, chunk, period).await?,
                _ => self.send_stream(chunk.sequence_id, chunk).await?,
            };
            sent.push((stream_type, handle));
        }

        self.wait_for_acks().await?;
        tracing::info!(pod = %self.pod, streams = sent.len(), "pod dump sent");
        Ok(sent)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn check_alive(&self) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        if self.cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        if !self.observer.is_alive() {
            return Err(ProtocolError::NotAlive);
        }
        Ok(())
    }

    fn reader(&mut self) -> Result<&mut SocketReader<OwnedReadHalf>, ProtocolError> {
        self.reader.as_mut().ok_or(ProtocolError::NotConnected)
    }

    fn writer(&mut self) -> Result<&mut SocketWriter<OwnedWriteHalf>, ProtocolError> {
        self.writer.as_mut().ok_or(ProtocolError::NotConnected)
    }

    /// Aliveness check, then the request itself. A failed write is
    /// reported to the observer before it is returned.
    async fn begin(&mut self, req: &Request, flush: bool) -> Result<Instant, ProtocolError> {
        self.check_alive()?;
        let started = Instant::now();
        match self.write_request(req, flush).await {
            Ok(()) => Ok(started),
            Err(e) => {
                self.report(req.command(), started, Some(&e));
                Err(e)
            }
        }
    }

    async fn write_request(&mut self, req: &Request, flush: bool) -> Result<(), ProtocolError> {
        let w = self.writer()?;
        req.write_to(w).await?;
        if flush {
            w.flush().await?;
        }
        Ok(())
    }

    fn finish<T>(&self, cmd: Command, started: Instant, result: &Result<T, ProtocolError>) {
        self.report(cmd, started, result.as_ref().err());
    }

    fn report(&self, cmd: Command, started: Instant, err: Option<&ProtocolError>) {
        self.observer.command(cmd, started.elapsed(), err);
        if let Some(e) = err {
            tracing::debug!(pod = %self.pod, command = %cmd, error = %e, "command failed");
            self.observer.error(e);
        }
    }

    async fn drain_acks(&mut self) -> Result<(), ProtocolError> {
        while self.pending_acks > 0 {
            let r = self.reader()?;
            let at = r.pos();
            let byte = r.read_byte().await?;
            if byte != ACK_OK {
                return Err(ProtocolError::InvalidAck { byte, pos: at });
            }
            self.pending_acks -= 1;
        }
        Ok(())
    }
}

/// Delay between segments so `size` bytes take roughly `period` to send.
fn segment_pace(size: usize, period: Duration) -> Duration {
    let segments = size / MAX_BUF_SIZE;
    period / (segments as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pace_spreads_period_over_segments() {
        assert_eq!(segment_pace(0, Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(segment_pace(3 * MAX_BUF_SIZE, Duration::from_secs(4)), Duration::from_secs(1));
        assert_eq!(segment_pace(10_000, Duration::ZERO), Duration::ZERO);
    }
}
