//! Agent listener: accepts profiler agents and serves each on its own task.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use profiler_core::config::CollectorConfig;
use profiler_net::{ConnectionHandler, ConnectionOptions, Observer, ServeOutcome, ServerParams};
use profiler_streams::PodDump;

use crate::registry::{PodRegistry, RegistrySink};

pub struct CollectorListener {
    listener: TcpListener,
    opts: ConnectionOptions,
    params: ServerParams,
    registry: PodRegistry,
    observer: Arc<dyn Observer>,
    dump_dir: Option<PathBuf>,
    shutdown: broadcast::Receiver<()>,
    cancel: CancellationToken,
}

impl CollectorListener {
    pub async fn bind(
        config: &CollectorConfig,
        registry: PodRegistry,
        observer: Arc<dyn Observer>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.network.bind)
            .await
            .with_context(|| format!("failed to bind agent listener on {}", config.network.bind))?;
        Ok(Self {
            listener,
            opts: ConnectionOptions::from(&config.network),
            params: ServerParams::from(&config.protocol),
            registry,
            observer,
            dump_dir: config.storage.dump_dir.clone(),
            shutdown,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "agent listener ready");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(active = connections.len(), "agent listener shutting down");
                    break;
                }

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "connection task panicked");
                    }
                }

                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%peer, "agent connected");

                    let sink = RegistrySink::new(self.registry.clone(), Some(peer));
                    let handler = ConnectionHandler::from_tcp(
                        stream,
                        self.opts,
                        self.params,
                        self.observer.clone(),
                        self.cancel.child_token(),
                        sink,
                    );
                    let registry = self.registry.clone();
                    let dump_dir = self.dump_dir.clone();
                    connections.spawn(async move {
                        let outcome = handler.serve().await;
                        finish_connection(outcome, &registry, dump_dir).await;
                    });
                }
            }
        }

        self.cancel.cancel();
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "connection task panicked");
            }
        }
        Ok(())
    }
}

async fn finish_connection(outcome: ServeOutcome<RegistrySink>, registry: &PodRegistry, dump_dir: Option<PathBuf>) {
    let error = outcome.error.as_ref().map(|e| e.to_string());
    let Some(name) = outcome.sink.name().map(str::to_string) else {
        tracing::debug!(commands = outcome.commands, "connection closed before handshake");
        return;
    };
    registry.disconnect(&name, outcome.commands, error);

    let dump = outcome.sink.into_dump();
    tracing::info!(
        pod = %name,
        chunks = dump.chunk_count(),
        bytes = dump.total_bytes(),
        "pod disconnected"
    );

    if let Some(dir) = dump_dir {
        let written = tokio::task::spawn_blocking(move || write_dump(&dump, &dir)).await;
        match written {
            Ok(Ok(n)) => tracing::debug!(pod = %name, files = n, "pod dump stored"),
            Ok(Err(e)) => tracing::warn!(pod = %name, error = %e, "failed to store pod dump"),
            Err(e) => tracing::warn!(pod = %name, error = %e, "dump task failed"),
        }
    }
}

fn write_dump(dump: &PodDump, dir: &std::path::Path) -> std::io::Result<usize> {
    let parsed = dump.parse_streams();
    Ok(dump.write_files(&dump.dump_dir(dir), &parsed)?.len())
}
