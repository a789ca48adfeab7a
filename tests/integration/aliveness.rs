use crate::*;

use profiler_core::Handle;
use profiler_net::ProtocolError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_not_alive_rejects_before_writing() -> Result<()> {
    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let observer = Arc::new(CountingObserver::new());
    let mut conn = AgentConnection::connect(
        &addr.to_string(),
        test_options(),
        observer.clone(),
        CancellationToken::new(),
    )
    .await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-dead")
        .await?;
    let written = observer.bytes_written();

    observer.set_alive(false);
    let err = conn.rcv_data(Handle::random(), b"payload").await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotAlive), "{err}");
    assert_eq!(observer.bytes_written(), written);
    assert_eq!(conn.pending_acks(), 0);

    observer.set_alive(true);
    conn.close().await?;
    let outcome = server.await??;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.data_bytes, 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_rejects_and_close_still_releases() -> Result<()> {
    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let cancel = CancellationToken::new();
    let mut conn = AgentConnection::connect(
        &addr.to_string(),
        test_options(),
        Arc::new(NoopObserver),
        cancel.clone(),
    )
    .await?;

    cancel.cancel();
    let err = conn
        .initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-cancel")
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Cancelled), "{err}");

    conn.close().await?;
    assert!(!conn.is_connected());

    // The collector only saw the socket close.
    let outcome = server.await??;
    assert!(outcome.error.is_none());
    assert_eq!(outcome.commands, 0);
    assert_eq!(outcome.sink.pod, "unknown");
    Ok(())
}

#[tokio::test]
async fn test_closed_connection_rejects_sends() -> Result<()> {
    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let mut conn = agent(addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-closed")
        .await?;
    conn.close().await?;

    let err = conn.request_flush().await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotConnected), "{err}");
    let err = conn.init_stream("calls", 0, false).await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotConnected), "{err}");
    // closing twice is harmless
    conn.close().await?;

    server.await??;
    Ok(())
}

/// A collector that answers with anything but 0x00 breaks delivery.
#[tokio::test]
async fn test_invalid_ack_is_reported_with_offset() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let fake = tokio::spawn(async move {
        let (mut s, _) = listener.accept().await?;
        let mut buf = [0u8; 256];
        let n = s.read(&mut buf).await?;
        anyhow::ensure!(n > 0, "agent sent nothing");
        s.write_all(&[0x07]).await?;
        // hold the socket until the agent hangs up
        while s.read(&mut buf).await? > 0 {}
        Ok::<_, anyhow::Error>(())
    });

    let mut conn = agent(addr).await?;
    conn.rcv_data(Handle::random(), b"abc").await?;
    assert_eq!(conn.pending_acks(), 2);
    let err = conn.wait_for_acks().await.unwrap_err();
    match err {
        ProtocolError::InvalidAck { byte, pos } => {
            assert_eq!(byte, 0x07);
            assert_eq!(pos, 0);
        }
        other => bail!("expected InvalidAck, got {other}"),
    }
    assert_eq!(conn.pending_acks(), 2);

    conn.close().await?;
    fake.await??;
    Ok(())
}

#[tokio::test]
async fn test_connect_refused_names_address() -> Result<()> {
    // Bind then drop to get a port nothing listens on.
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").await?;
        l.local_addr()?
    };
    let err = match agent(addr).await {
        Ok(_) => bail!("connect should fail"),
        Err(e) => e,
    };
    let err = err.downcast::<ProtocolError>()?;
    assert!(matches!(err, ProtocolError::Connect { .. }), "{err}");
    assert!(err.to_string().contains(&addr.to_string()), "{err}");
    Ok(())
}
