//! Emulates a profiled pod by sending a recorded capture to a live collector.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use profiler_net::{replay_capture, AgentConnection, ConnectionOptions, TracingObserver};

pub struct EmulateOptions {
    pub addr: String,
    /// Time over which calls and traces are spread. Zero sends at full speed.
    pub period: Duration,
}

pub async fn cmd_emulate(path: &Path, opts: &EmulateOptions) -> Result<()> {
    let (dump, summary) = replay_capture(path)
        .await
        .with_context(|| format!("failed to replay {}", path.display()))?;
    if let Some(e) = &summary.error {
        eprintln!("warning: capture ends early: {}", e);
    }

    let mut conn = AgentConnection::connect(
        &opts.addr,
        ConnectionOptions::default(),
        Arc::new(TracingObserver),
        CancellationToken::new(),
    )
    .await?;

    let server_version = conn
        .initialize_connection(dump.protocol_version, &dump.namespace, &dump.service, &dump.pod)
        .await
        .context("handshake failed")?;
    println!("Connected to {} (collector protocol {})", conn.peer(), server_version);

    let started = Instant::now();
    let emulated_ts = chrono::Utc::now().timestamp_millis();
    let sent = conn
        .send_pod_dump(&dump, emulated_ts, opts.period)
        .await
        .context("failed to send capture")?;
    conn.close().await.context("failed to close connection")?;

    for (stream_type, handle) in &sent {
        println!("  {:<12} → {}", stream_type.as_str(), handle);
    }
    println!(
        "Sent {} streams, {} bytes for {} in {:.1}s",
        sent.len(),
        dump.total_bytes(),
        dump.name(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
