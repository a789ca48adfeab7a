use crate::*;

#[tokio::test]
async fn test_collector_starts_and_stops_idle() -> Result<()> {
    let collector = Collector::start(None).await?;
    assert_ne!(collector.addr.port(), 0);
    assert_eq!(collector.registry.stats().pods_total, 0);
    collector.stop().await
}

/// A socket that closes before the handshake leaves no trace in the
/// registry and counts as a clean disconnect.
#[tokio::test]
async fn test_hangup_before_handshake_is_not_registered() -> Result<()> {
    let collector = Collector::start(None).await?;

    let stream = tokio::net::TcpStream::connect(collector.addr).await?;
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.registry.stats().pods_total, 0);
    assert_eq!(collector.observer.errors(), 0);
    collector.stop().await
}

/// Shutdown cancels connections that are still open.
#[tokio::test]
async fn test_shutdown_cancels_open_connections() -> Result<()> {
    let collector = Collector::start(None).await?;
    let mut conn = agent(collector.addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-idle")
        .await?;

    let registry = collector.registry.clone();
    tokio::time::timeout(Duration::from_secs(5), collector.stop())
        .await
        .context("listener did not stop")??;

    let entry = registry
        .get(&format!("{NAMESPACE}:{SERVICE}:pod-idle"))
        .context("pod missing")?;
    assert!(!entry.live);
    assert!(entry.last_error.is_none());
    Ok(())
}
