use crate::*;

use profiler_core::Command;

#[tokio::test]
async fn test_handshake_reports_identity_and_server_version() -> Result<()> {
    let observer = Arc::new(CountingObserver::new());
    let (addr, server) = serve_one(observer.clone()).await?;

    let mut conn = agent(addr).await?;
    let server_version = conn
        .initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-1")
        .await?;
    assert_eq!(server_version, test_params().server_version);
    conn.close().await?;

    let outcome = server.await??;
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.commands, 2);

    let dump = outcome.sink;
    assert_eq!(dump.protocol_version, AGENT_VERSION);
    assert_eq!(dump.namespace, NAMESPACE);
    assert_eq!(dump.service, SERVICE);
    assert_eq!(dump.pod, "pod-1");
    assert_eq!(dump.chunk_count(), 0);

    assert_eq!(observer.commands(Command::GetProtocolVersionV2), 1);
    assert_eq!(observer.commands(Command::Close), 1);
    assert_eq!(observer.command_errors(), 0);
    Ok(())
}

#[tokio::test]
async fn test_collector_tracks_pod_lifecycle() -> Result<()> {
    let collector = Collector::start(None).await?;
    let name = format!("{NAMESPACE}:{SERVICE}:pod-2");

    let mut conn = agent(collector.addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-2")
        .await?;
    {
        let registry = collector.registry.clone();
        let name = name.clone();
        wait_until(Duration::from_secs(2), move || registry.get(&name).is_some_and(|e| e.live)).await?;
    }

    let opened = conn.init_stream("params", 3, false).await?;
    assert_eq!(opened.rolling_seq, 3);
    conn.rcv_data(opened.handle, b"0123456789").await?;
    conn.wait_for_acks().await?;
    assert_eq!(conn.pending_acks(), 0);
    conn.close().await?;

    {
        let registry = collector.registry.clone();
        let name = name.clone();
        wait_until(Duration::from_secs(2), move || registry.get(&name).is_some_and(|e| !e.live)).await?;
    }
    let entry = collector.registry.get(&name).context("pod missing")?;
    assert_eq!(entry.protocol_version, AGENT_VERSION);
    assert_eq!(entry.streams, 1);
    assert_eq!(entry.data_bytes, 10);
    // handshake, stream open, data, ack flush, close
    assert_eq!(entry.commands, 5);
    assert!(entry.peer.is_some());
    assert!(entry.last_error.is_none());

    let stats = collector.registry.stats();
    assert_eq!(stats.pods_total, 1);
    assert_eq!(stats.pods_live, 0);
    assert!(collector.observer.bytes_read() > 10);

    collector.stop().await
}
