//! Profiler integration test harness.
//!
//! Every test runs a real collector and a real agent connection over
//! loopback TCP. Nothing needs to be set up beforehand; each test binds its
//! own ephemeral port and tears down whatever it started.

mod aliveness;
mod emulate;
mod handshake;
mod infra;
mod streams;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use profiler_collector::{CollectorListener, PodRegistry};
use profiler_core::config::CollectorConfig;
use profiler_net::{
    AgentConnection, ConnectionHandler, ConnectionOptions, CountingObserver, NoopObserver, Observer,
    ServeOutcome, ServerParams,
};
use profiler_streams::PodDump;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const NAMESPACE: &str = "it-ns";
pub const SERVICE: &str = "it-svc";
pub const AGENT_VERSION: i64 = 100_605;

/// Short timeouts so a stuck test fails instead of hanging.
pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
    }
}

pub fn test_params() -> ServerParams {
    ServerParams {
        server_version: 100_705,
        rotation_period: 60_000,
        rotation_size: 4096,
    }
}

/// A unique scratch directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!("profiler-it-{tag}-{}-{nanos}", std::process::id()))
}

/// Accepts exactly one agent on an ephemeral port and serves it into a
/// `PodDump`.
pub async fn serve_one(
    observer: Arc<dyn Observer>,
) -> Result<(SocketAddr, JoinHandle<Result<ServeOutcome<PodDump>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.context("accept failed")?;
        let handler = ConnectionHandler::from_tcp(
            stream,
            test_options(),
            test_params(),
            observer,
            CancellationToken::new(),
            PodDump::new(),
        );
        Ok(handler.serve().await)
    });
    Ok((addr, task))
}

/// Dials `addr` with a no-op observer and a fresh token.
pub async fn agent(addr: SocketAddr) -> Result<AgentConnection> {
    let conn = AgentConnection::connect(
        &addr.to_string(),
        test_options(),
        Arc::new(NoopObserver),
        CancellationToken::new(),
    )
    .await?;
    Ok(conn)
}

/// A collector daemon running on loopback.
pub struct Collector {
    pub addr: SocketAddr,
    pub registry: PodRegistry,
    pub observer: Arc<CountingObserver>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl Collector {
    pub async fn start(dump_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = CollectorConfig::default();
        config.network.bind = "127.0.0.1:0".into();
        config.network.read_timeout_ms = 5_000;
        config.network.write_timeout_ms = 5_000;
        config.storage.dump_dir = dump_dir;

        let registry = PodRegistry::new();
        let observer = Arc::new(CountingObserver::new());
        let (shutdown_tx, _) = broadcast::channel(1);
        let listener = CollectorListener::bind(
            &config,
            registry.clone(),
            observer.clone() as Arc<dyn Observer>,
            shutdown_tx.subscribe(),
        )
        .await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(listener.run());
        Ok(Self {
            addr,
            registry,
            observer,
            shutdown_tx,
            task,
        })
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.context("listener task panicked")?
    }
}

/// Polls `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
