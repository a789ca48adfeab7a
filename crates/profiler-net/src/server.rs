//! ConnectionHandler: the collector side of one agent connection.
//!
//! One handler owns one socket and runs the command loop until the agent
//! closes, an error tears the connection down, or the cancellation token
//! fires. All pod state for the connection lives in its sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use profiler_core::config::{NetworkConfig, ProtocolConfig};
use profiler_core::wire::ACK_OK;
use profiler_core::{Command, FieldReader, FieldWriter, Handle, StreamType};
use profiler_streams::PodDump;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::observer::Observer;
use crate::protocol::{PodSink, Request, StreamOpened, StreamRegistration};
use crate::socket::{SocketReader, SocketWriter};
use crate::ProtocolError;

/// Per-I/O deadlines for one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for ConnectionOptions {
    fn from(net: &NetworkConfig) -> Self {
        Self {
            connect_timeout: net.connect_timeout(),
            read_timeout: net.read_timeout(),
            write_timeout: net.write_timeout(),
        }
    }
}

/// What the collector answers to handshakes and stream opens.
#[derive(Debug, Clone, Copy)]
pub struct ServerParams {
    pub server_version: i64,
    pub rotation_period: i64,
    pub rotation_size: i64,
}

impl Default for ServerParams {
    fn default() -> Self {
        Self::from(&ProtocolConfig::default())
    }
}

impl From<&ProtocolConfig> for ServerParams {
    fn from(p: &ProtocolConfig) -> Self {
        Self {
            server_version: p.server_version,
            rotation_period: p.rotation_period_ms,
            rotation_size: p.rotation_size,
        }
    }
}

/// Result of a finished connection. The sink is returned whatever the
/// reason the loop ended.
#[derive(Debug)]
pub struct ServeOutcome<S> {
    pub sink: S,
    pub commands: u64,
    pub data_bytes: u64,
    /// The error that tore the connection down. `None` for a clean close.
    pub error: Option<ProtocolError>,
}

pub struct ConnectionHandler<R, W, S = PodDump> {
    reader: SocketReader<R>,
    writer: SocketWriter<W>,
    peer: Option<SocketAddr>,
    params: ServerParams,
    observer: Arc<dyn Observer>,
    cancel: CancellationToken,
    sink: S,
    commands: u64,
    data_bytes: u64,
}

impl<S: PodSink> ConnectionHandler<OwnedReadHalf, OwnedWriteHalf, S> {
    pub fn from_tcp(
        stream: TcpStream,
        opts: ConnectionOptions,
        params: ServerParams,
        observer: Arc<dyn Observer>,
        cancel: CancellationToken,
        sink: S,
    ) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let (r, w) = stream.into_split();
        let mut handler = Self::new(r, w, opts, params, observer, cancel, sink);
        handler.peer = peer;
        handler
    }
}

impl<R, W, S> ConnectionHandler<R, W, S>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
    S: PodSink,
{
    pub fn new(
        reader: R,
        writer: W,
        opts: ConnectionOptions,
        params: ServerParams,
        observer: Arc<dyn Observer>,
        cancel: CancellationToken,
        sink: S,
    ) -> Self {
        Self {
            reader: SocketReader::new(reader, opts.read_timeout, observer.clone()),
            writer: SocketWriter::new(writer, opts.write_timeout, observer.clone()),
            peer: None,
            params,
            observer,
            cancel,
            sink,
            commands: 0,
            data_bytes: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs the command loop to completion.
    pub async fn serve(mut self) -> ServeOutcome<S> {
        tracing::debug!(peer = ?self.peer, "agent connected");
        let cancel = self.cancel.clone();
        let mut error = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(peer = ?self.peer, "connection cancelled");
                    break;
                }
                result = self.handle_command() => match result {
                    Ok(Some(Command::Close)) | Ok(None) => break,
                    Ok(Some(_)) => {}
                    Err(e) => {
                        tracing::error!(peer = ?self.peer, pos = ?e.pos(), error = %e, "connection aborted");
                        self.observer.error(&e);
                        error = Some(e);
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(peer = ?self.peer, error = %e, "shutdown failed");
        }
        tracing::debug!(
            peer = ?self.peer,
            commands = self.commands,
            data_bytes = self.data_bytes,
            "agent disconnected"
        );
        ServeOutcome {
            sink: self.sink,
            commands: self.commands,
            data_bytes: self.data_bytes,
            error,
        }
    }

    /// Reads and answers one command. `Ok(None)` means the agent hung up
    /// between commands.
    pub async fn handle_command(&mut self) -> Result<Option<Command>, ProtocolError> {
        let at = self.reader.pos();
        let req = match Request::read_from(&mut self.reader).await {
            Ok(req) => req,
            Err(e) if e.is_eof() && e.pos() == Some(at) => return Ok(None),
            Err(e) => return Err(e),
        };
        let cmd = req.command();
        self.commands += 1;

        let started = Instant::now();
        let result = self.respond(req).await;
        self.observer.command(cmd, started.elapsed(), result.as_ref().err());
        result.map(|()| Some(cmd))
    }

    async fn respond(&mut self, req: Request) -> Result<(), ProtocolError> {
        match req {
            Request::Skip => {}
            Request::Close => tracing::debug!(peer = ?self.peer, "close"),
            Request::RequestAckFlush => {
                self.writer.write_byte(ACK_OK).await?;
                self.writer.flush().await?;
            }
            Request::ReportCommandResult { command_id, success } => {
                tracing::debug!(%command_id, success, "command result");
            }
            Request::GetProtocolVersion { version } => {
                tracing::debug!(version, "deprecated version exchange");
            }
            Request::InitStream {
                namespace,
                service,
                pod,
            } => {
                tracing::debug!(%namespace, %service, %pod, "deprecated stream init");
                self.sink.register_pod(0, &namespace, &service, &pod);
            }
            Request::GetProtocolVersionV2 {
                version,
                pod,
                service,
                namespace,
            } => {
                self.writer.write_long(self.params.server_version).await?;
                self.writer.flush().await?;
                tracing::info!(
                    client = version,
                    server = self.params.server_version,
                    %namespace,
                    %service,
                    %pod,
                    "pod connected"
                );
                self.sink.register_pod(version, &namespace, &service, &pod);
            }
            Request::InitStreamV2 {
                stream_type,
                requested_seq,
                reset_required,
            } => {
                let opened = StreamOpened {
                    handle: Handle::random(),
                    rotation_period: self.params.rotation_period,
                    rotation_size: self.params.rotation_size,
                    rolling_seq: requested_seq,
                };
                opened.write_to(&mut self.writer).await?;
                self.writer.flush().await?;
                self.sink.register_stream(&StreamRegistration {
                    stream_type: StreamType::from(stream_type.as_str()),
                    requested_seq,
                    reset_required: reset_required > 0,
                    opened,
                });
            }
            Request::RcvData { handle, payload } => {
                self.data_bytes += self.sink.append_data(&handle, &payload) as u64;
                self.writer.write_byte(ACK_OK).await?;
            }
        }
        Ok(())
    }
}
