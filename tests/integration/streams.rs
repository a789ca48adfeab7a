use crate::*;

use std::collections::BTreeMap;

use profiler_core::StreamType;
use profiler_streams::calls::CallEncoder;
use profiler_streams::{read_calls, Call};

const START_MS: i64 = 1_700_000_000_000;

fn sample_call() -> Call {
    Call {
        time: 1_500,
        method: 42,
        duration: 250,
        calls: 3,
        thread_name: "http-nio-8080-exec-1".into(),
        logs_written: 100,
        logs_generated: 120,
        trace_file_index: 2,
        buffer_offset: 4_096,
        record_index: 7,
        cpu_time: 90,
        wait_time: 5,
        memory_used: 1_048_576,
        file_read: 10,
        file_written: 20,
        net_read: 30,
        net_written: 40,
        transactions: 2,
        queue_wait_duration: 1,
        suspend_duration: 0,
        params: BTreeMap::from([(5, vec!["GET /orders".to_string()])]),
    }
}

/// One encoded call delivered in two RCV_DATA parts decodes back to exactly
/// that call.
#[tokio::test]
async fn test_call_split_across_two_deliveries() -> Result<()> {
    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let mut enc = CallEncoder::new(4, START_MS);
    enc.push(&sample_call());
    let bytes = enc.finish();
    let (head, tail) = bytes.split_at(bytes.len() / 2);

    let mut conn = agent(addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-calls")
        .await?;
    let opened = conn.init_stream("calls", 0, false).await?;
    assert_eq!(opened.rotation_period, test_params().rotation_period);
    assert_eq!(opened.rotation_size, test_params().rotation_size);

    conn.rcv_data(opened.handle, head).await?;
    conn.rcv_data(opened.handle, tail).await?;
    conn.wait_for_acks().await?;
    conn.close().await?;

    let outcome = server.await??;
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.data_bytes, bytes.len() as u64);

    let chunk = outcome
        .sink
        .by_type(&StreamType::Calls)
        .context("calls stream missing")?;
    assert_eq!(chunk.handle, opened.handle);
    assert_eq!(chunk.bytes(), &bytes[..]);

    let decoded = read_calls(chunk);
    assert!(decoded.is_complete(), "{:?}", decoded.error);
    assert_eq!(decoded.records.start_ms, START_MS);
    assert_eq!(decoded.records.list.len(), 1);
    assert_eq!(decoded.records.list[0].call, sample_call());
    assert_eq!(decoded.records.list[0].time_ms, START_MS + 1_500);
    Ok(())
}

/// Reopening a stream type points the type lookup at the new handle while
/// the first chunk keeps its data.
#[tokio::test]
async fn test_reopened_stream_supersedes_previous() -> Result<()> {
    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let mut conn = agent(addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-rotate")
        .await?;

    let first = conn
        .send_chunk_bytes(&StreamType::Trace, 1, b"first", Duration::ZERO)
        .await?;
    let second = conn
        .send_chunk_bytes(&StreamType::Trace, 2, b"second", Duration::ZERO)
        .await?;
    assert_ne!(first, second);
    conn.wait_for_acks().await?;
    conn.close().await?;

    let dump = server.await??.sink;
    assert_eq!(dump.chunk_count(), 2);
    assert_eq!(dump.latest_handle(&StreamType::Trace), Some(second));
    assert_eq!(dump.chunk(&first).context("first chunk")?.bytes(), b"first");
    let latest = dump.by_type(&StreamType::Trace).context("trace missing")?;
    assert_eq!(latest.bytes(), b"second");
    assert_eq!(latest.sequence_id, 2);
    Ok(())
}

/// Segments larger than one buffer are split and reassembled in order.
#[tokio::test]
async fn test_large_chunk_is_segmented_in_order() -> Result<()> {
    let observer = Arc::new(CountingObserver::new());
    let (addr, server) = serve_one(observer.clone()).await?;
    let data: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();

    let mut conn = agent(addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-big")
        .await?;
    conn.send_chunk_bytes(&StreamType::Sql, 0, &data, Duration::ZERO)
        .await?;
    conn.wait_for_acks().await?;
    conn.close().await?;

    let dump = server.await??.sink;
    let chunk = dump.by_type(&StreamType::Sql).context("sql missing")?;
    assert_eq!(chunk.bytes(), &data[..]);
    // 5000 bytes in 1024-byte segments
    assert_eq!(observer.commands(profiler_core::Command::RcvData), 5);
    Ok(())
}

/// With a dump directory configured, a finished pod is written to disk.
#[tokio::test]
async fn test_collector_writes_finished_pod() -> Result<()> {
    let dir = temp_dir("dump");
    let collector = Collector::start(Some(dir.clone())).await?;

    let mut enc = CallEncoder::new(4, START_MS);
    enc.push(&sample_call());
    let bytes = enc.finish();

    let mut conn = agent(collector.addr).await?;
    conn.initialize_connection(AGENT_VERSION, NAMESPACE, SERVICE, "pod-disk")
        .await?;
    conn.send_chunk_bytes(&StreamType::Calls, 9, &bytes, Duration::ZERO)
        .await?;
    conn.wait_for_acks().await?;
    conn.close().await?;

    let pod_dir = dir.join(NAMESPACE).join(SERVICE);
    let bin = pod_dir.join("pod-disk.calls.9.bin");
    let txt = pod_dir.join("pod-disk.calls.9.txt");
    {
        let txt = txt.clone();
        wait_until(Duration::from_secs(3), move || {
            std::fs::read_to_string(&txt).is_ok_and(|t| t.contains("call#1:"))
        })
        .await?;
    }
    assert_eq!(std::fs::read(&bin)?, bytes);

    collector.stop().await?;
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

/// Names from the handshake never lead the collector outside its dump directory.
#[tokio::test]
async fn test_collector_dump_stays_under_dir() -> Result<()> {
    let root = temp_dir("dump-escape");
    let dir = root.join("dumps");
    let collector = Collector::start(Some(dir.clone())).await?;

    let mut conn = agent(collector.addr).await?;
    conn.initialize_connection(AGENT_VERSION, "../..", "/tmp", "../pod")
        .await?;
    conn.send_chunk_bytes(&StreamType::Sql, 0, b"payload", Duration::ZERO)
        .await?;
    conn.wait_for_acks().await?;
    conn.close().await?;

    let bin = dir.join(".._..").join("_tmp").join(".._pod.sql.0.bin");
    {
        let bin = bin.clone();
        wait_until(Duration::from_secs(3), move || bin.exists()).await?;
    }
    assert_eq!(std::fs::read(&bin)?, b"payload");
    let entries: Vec<_> = std::fs::read_dir(&root)?
        .map(|e| e.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    assert_eq!(entries, ["dumps"]);

    collector.stop().await?;
    let _ = std::fs::remove_dir_all(&root);
    Ok(())
}
