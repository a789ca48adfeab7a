//! Protocol state machine shared by every role.
//!
//! `Request::read_from` decodes one opcode and its request fields from any
//! `FieldReader`; `Request::write_to` is the agent's encoder for the same
//! layout. Responses travel the other way and only exist for the version
//! handshake and stream opening.
//!
//! Roles differ in where the response comes from. The server computes it and
//! writes it back; offline replay reads it from the capture, since a capture
//! holds both directions in arrival order.

use std::time::Instant;

use profiler_core::{Chunk, Command, FieldReader, FieldWriter, Handle, StreamType};
use profiler_streams::PodDump;

use crate::ProtocolError;

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Skip,
    /// Deprecated stream open, carries identity only.
    InitStream {
        namespace: String,
        service: String,
        pod: String,
    },
    RcvData {
        handle: Handle,
        payload: Vec<u8>,
    },
    Close,
    /// Deprecated version exchange.
    GetProtocolVersion {
        version: i64,
    },
    RequestAckFlush,
    ReportCommandResult {
        command_id: Handle,
        success: u8,
    },
    GetProtocolVersionV2 {
        version: i64,
        pod: String,
        service: String,
        namespace: String,
    },
    InitStreamV2 {
        stream_type: String,
        requested_seq: i32,
        reset_required: i32,
    },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Skip => Command::Skip,
            Request::InitStream { .. } => Command::InitStream,
            Request::RcvData { .. } => Command::RcvData,
            Request::Close => Command::Close,
            Request::GetProtocolVersion { .. } => Command::GetProtocolVersion,
            Request::RequestAckFlush => Command::RequestAckFlush,
            Request::ReportCommandResult { .. } => Command::ReportCommandResult,
            Request::GetProtocolVersionV2 { .. } => Command::GetProtocolVersionV2,
            Request::InitStreamV2 { .. } => Command::InitStreamV2,
        }
    }

    /// Reads one opcode and its request fields.
    ///
    /// An unrecognised opcode marks the reader done and is returned as
    /// `UnknownOpcode`; the caller decides whether that is fatal.
    pub async fn read_from<R: FieldReader>(r: &mut R) -> Result<Request, ProtocolError> {
        let at = r.pos();
        let op = r.read_byte().await?;
        let cmd = match Command::try_from(op) {
            Ok(cmd) => cmd,
            Err(_) => {
                r.done();
                return Err(ProtocolError::UnknownOpcode { op, pos: at });
            }
        };

        let req = match cmd {
            Command::Skip => Request::Skip,
            Command::Close => Request::Close,
            Command::RequestAckFlush => Request::RequestAckFlush,
            Command::InitStream => Request::InitStream {
                namespace: r.read_string().await?,
                service: r.read_string().await?,
                pod: r.read_string().await?,
            },
            Command::RcvData => Request::RcvData {
                handle: r.read_uuid().await?,
                payload: r.read_blob().await?,
            },
            Command::GetProtocolVersion => Request::GetProtocolVersion {
                version: r.read_long().await?,
            },
            Command::ReportCommandResult => Request::ReportCommandResult {
                command_id: r.read_uuid().await?,
                success: r.read_byte().await?,
            },
            Command::GetProtocolVersionV2 => Request::GetProtocolVersionV2 {
                version: r.read_long().await?,
                pod: r.read_string().await?,
                service: r.read_string().await?,
                namespace: r.read_string().await?,
            },
            Command::InitStreamV2 => Request::InitStreamV2 {
                stream_type: r.read_string().await?,
                requested_seq: r.read_int().await?,
                reset_required: r.read_int().await?,
            },
        };
        Ok(req)
    }

    /// Writes the opcode and request fields. Does not flush.
    pub async fn write_to<W: FieldWriter>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_byte(self.command().into()).await?;
        match self {
            Request::Skip | Request::Close | Request::RequestAckFlush => {}
            Request::InitStream {
                namespace,
                service,
                pod,
            } => {
                w.write_string(namespace).await?;
                w.write_string(service).await?;
                w.write_string(pod).await?;
            }
            Request::RcvData { handle, payload } => {
                w.write_uuid(*handle).await?;
                w.write_blob(payload).await?;
            }
            Request::GetProtocolVersion { version } => w.write_long(*version).await?,
            Request::ReportCommandResult { command_id, success } => {
                w.write_uuid(*command_id).await?;
                w.write_byte(*success).await?;
            }
            Request::GetProtocolVersionV2 {
                version,
                pod,
                service,
                namespace,
            } => {
                w.write_long(*version).await?;
                w.write_string(pod).await?;
                w.write_string(service).await?;
                w.write_string(namespace).await?;
            }
            Request::InitStreamV2 {
                stream_type,
                requested_seq,
                reset_required,
            } => {
                w.write_string(stream_type).await?;
                w.write_int(*requested_seq).await?;
                w.write_int(*reset_required).await?;
            }
        }
        Ok(())
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// The collector's answer to INIT_STREAM_V2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOpened {
    pub handle: Handle,
    pub rotation_period: i64,
    pub rotation_size: i64,
    pub rolling_seq: i32,
}

impl StreamOpened {
    pub async fn read_from<R: FieldReader>(r: &mut R) -> Result<Self, ProtocolError> {
        Ok(Self {
            handle: r.read_uuid().await?,
            rotation_period: r.read_long().await?,
            rotation_size: r.read_long().await?,
            rolling_seq: r.read_int().await?,
        })
    }

    pub async fn write_to<W: FieldWriter>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_uuid(self.handle).await?;
        w.write_long(self.rotation_period).await?;
        w.write_long(self.rotation_size).await?;
        w.write_int(self.rolling_seq).await?;
        Ok(())
    }
}

/// A stream open with both halves of the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRegistration {
    pub stream_type: StreamType,
    pub requested_seq: i32,
    pub reset_required: bool,
    pub opened: StreamOpened,
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Receives what the state machine learns about one pod.
pub trait PodSink: Send {
    fn register_pod(&mut self, version: i64, namespace: &str, service: &str, pod: &str);

    fn register_stream(&mut self, stream: &StreamRegistration);

    /// Returns the number of bytes accepted; 0 for an unknown handle.
    fn append_data(&mut self, handle: &Handle, data: &[u8]) -> usize;
}

impl PodSink for PodDump {
    fn register_pod(&mut self, version: i64, namespace: &str, service: &str, pod: &str) {
        PodDump::register_pod(self, version, namespace, service, pod);
    }

    fn register_stream(&mut self, stream: &StreamRegistration) {
        let chunk = Chunk::new(
            stream.opened.handle,
            stream.stream_type.clone(),
            stream.opened.rolling_seq,
            stream.opened.rotation_period,
            stream.opened.rotation_size,
        );
        tracing::debug!(
            stream_type = %stream.stream_type,
            handle = %stream.opened.handle,
            requested_seq = stream.requested_seq,
            rolling_seq = stream.opened.rolling_seq,
            reset = stream.reset_required,
            "stream registered"
        );
        PodDump::register_stream(self, chunk);
    }

    fn append_data(&mut self, handle: &Handle, data: &[u8]) -> usize {
        PodDump::append(self, handle, data)
    }
}

// ── Replay role ───────────────────────────────────────────────────────────────

/// What one pass over a capture saw.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub commands: u64,
    pub data_bytes: u64,
    /// Field error that cut the capture short. Unknown opcodes end the
    /// replay without one.
    pub error: Option<ProtocolError>,
}

/// Runs the command loop over a capture until end of input, feeding `sink`.
///
/// Nothing here is fatal: a field error is logged with its offset and ends
/// the replay, keeping everything registered so far.
pub async fn replay<R: FieldReader, S: PodSink>(r: &mut R, sink: &mut S) -> ReplaySummary {
    let started = Instant::now();
    let mut summary = ReplaySummary::default();

    while !r.is_eof() {
        let req = match Request::read_from(r).await {
            Ok(req) => req,
            Err(ProtocolError::UnknownOpcode { op, pos }) => {
                tracing::debug!(op = format_args!("0x{op:02x}"), pos, "unknown command, ending replay");
                break;
            }
            Err(e) => {
                tracing::error!(pos = r.pos(), error = %e, "invalid capture");
                summary.error = Some(e);
                break;
            }
        };
        summary.commands += 1;

        if let Err(e) = replay_one(r, sink, req, &mut summary).await {
            tracing::error!(pos = r.pos(), error = %e, "invalid capture");
            summary.error = Some(e);
            break;
        }
    }

    tracing::debug!(
        commands = summary.commands,
        data_bytes = summary.data_bytes,
        elapsed = ?started.elapsed(),
        "replay finished"
    );
    summary
}

async fn replay_one<R: FieldReader, S: PodSink>(
    r: &mut R,
    sink: &mut S,
    req: Request,
    summary: &mut ReplaySummary,
) -> Result<(), ProtocolError> {
    match req {
        Request::Skip | Request::RequestAckFlush => {}
        Request::Close => tracing::debug!("close"),
        Request::ReportCommandResult { command_id, success } => {
            tracing::debug!(%command_id, success, "command result");
        }
        Request::GetProtocolVersion { version } => {
            tracing::debug!(version, "client protocol");
        }
        Request::GetProtocolVersionV2 {
            version,
            pod,
            service,
            namespace,
        } => {
            let server_version = r.read_long().await?;
            tracing::debug!(client = version, server = server_version, %namespace, %service, %pod, "protocol handshake");
            sink.register_pod(version, &namespace, &service, &pod);
        }
        Request::InitStream {
            namespace,
            service,
            pod,
        } => {
            tracing::debug!(%namespace, %service, %pod, "deprecated stream init");
            sink.register_pod(0, &namespace, &service, &pod);
        }
        Request::InitStreamV2 {
            stream_type,
            requested_seq,
            reset_required,
        } => {
            let opened = StreamOpened::read_from(r).await?;
            sink.register_stream(&StreamRegistration {
                stream_type: StreamType::from(stream_type.as_str()),
                requested_seq,
                reset_required: reset_required > 0,
                opened,
            });
        }
        Request::RcvData { handle, payload } => {
            summary.data_bytes += sink.append_data(&handle, &payload) as u64;
        }
    }
    Ok(())
}
