use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use profiler_collector::{api, ApiState, CollectorListener, PodRegistry};
use profiler_core::config::CollectorConfig;
use profiler_net::{CountingObserver, Observer};

#[tokio::main]
async fn main() -> Result<()> {
    // Load config first so its level can seed the log filter.
    if let Err(e) = CollectorConfig::write_default_if_missing() {
        eprintln!("failed to write default config: {e}");
    }
    let (mut config, load_error) = match CollectorConfig::load() {
        Ok(c) => (c, None),
        Err(e) => (CollectorConfig::default(), Some(e)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();
    if let Some(e) = load_error {
        tracing::warn!(error = %e, "failed to load config, using defaults");
    }

    if let Some(bind) = std::env::args().nth(1) {
        config.network.bind = bind;
    }
    tracing::info!(
        bind = %config.network.bind,
        server_version = config.protocol.server_version,
        dump_dir = ?config.storage.dump_dir,
        "profiler-collector starting"
    );

    let registry = PodRegistry::new();
    let observer = Arc::new(CountingObserver::new());

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("ctrl-c received");
            let _ = tx.send(());
        });
    }

    // ── Agent listener ───────────────────────────────────────────────────────
    let listener = CollectorListener::bind(
        &config,
        registry.clone(),
        observer.clone() as Arc<dyn Observer>,
        shutdown_tx.subscribe(),
    )
    .await?;
    let mut listener_task = tokio::spawn(listener.run());

    // ── Status API ───────────────────────────────────────────────────────────
    if config.network.status_port != 0 {
        let state = ApiState {
            registry: registry.clone(),
            observer: observer.clone(),
            started: Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.network.status_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => {
            tracing::info!("shutting down");
            // The listener saw the same signal and is draining connections.
            match listener_task.await {
                Ok(Err(e)) => tracing::error!(error = %e, "agent listener failed"),
                Err(e) => tracing::error!(error = %e, "agent listener panicked"),
                Ok(Ok(())) => {}
            }
        }
        r = &mut listener_task => tracing::error!("agent listener exited: {:?}", r),
    }

    let stats = registry.stats();
    tracing::info!(
        pods = stats.pods_total,
        streams = stats.streams,
        bytes = stats.data_bytes,
        "profiler-collector stopped"
    );
    Ok(())
}
