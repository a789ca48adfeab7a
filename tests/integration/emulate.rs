use crate::*;

use profiler_core::{BlobWriter, Handle, StreamType};
use profiler_net::{replay_capture, Request, StreamOpened};
use profiler_streams::calls::CallEncoder;
use profiler_streams::{read_calls, read_dictionary, Call};

const CAPTURED_START: i64 = 1_690_000_000_000;
const EMULATED_START: i64 = 1_760_000_000_000;

fn dictionary_bytes(words: &[&str]) -> Vec<u8> {
    let mut body = BlobWriter::new();
    for w in words {
        body.write_var_string(w);
    }
    let mut out = BlobWriter::new();
    out.write_int(body.len() as i32).write_raw(body.as_slice());
    out.into_vec()
}

fn calls_bytes() -> Vec<u8> {
    let mut enc = CallEncoder::new(2, CAPTURED_START);
    enc.push(&Call {
        time: 10,
        method: 1,
        duration: 5,
        calls: 1,
        thread_name: "main".into(),
        ..Call::default()
    })
    .push(&Call {
        time: 20,
        method: 2,
        duration: 7,
        calls: 2,
        thread_name: "main".into(),
        ..Call::default()
    });
    enc.finish()
}

fn opened(handle: Handle) -> StreamOpened {
    StreamOpened {
        handle,
        rotation_period: 300_000,
        rotation_size: 1024,
        rolling_seq: 0,
    }
}

/// A recorded session: each request followed by what the collector
/// answered.
async fn build_capture(dictionary: &[u8], calls: &[u8]) -> Result<Vec<u8>> {
    let dict_handle = Handle::random();
    let calls_handle = Handle::random();
    let (head, tail) = calls.split_at(calls.len() / 2);
    let mut w = BlobWriter::new();

    Request::GetProtocolVersionV2 {
        version: AGENT_VERSION,
        pod: "pod-emu".into(),
        service: SERVICE.into(),
        namespace: NAMESPACE.into(),
    }
    .write_to(&mut w)
    .await?;
    w.write_long(100_605);

    for (stream, handle, parts) in [
        ("dictionary", dict_handle, vec![dictionary]),
        ("calls", calls_handle, vec![head, tail]),
    ] {
        Request::InitStreamV2 {
            stream_type: stream.into(),
            requested_seq: 0,
            reset_required: 0,
        }
        .write_to(&mut w)
        .await?;
        opened(handle).write_to(&mut w).await?;
        for part in parts {
            Request::RcvData {
                handle,
                payload: part.to_vec(),
            }
            .write_to(&mut w)
            .await?;
        }
    }
    Request::Close.write_to(&mut w).await?;
    Ok(w.into_vec())
}

#[tokio::test]
async fn test_capture_replays_into_pod_dump() -> Result<()> {
    let dictionary = dictionary_bytes(&["java.lang.Thread.run", "doGet"]);
    let calls = calls_bytes();
    let dir = temp_dir("capture");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("session.bin");
    std::fs::write(&path, build_capture(&dictionary, &calls).await?)?;

    let (dump, summary) = replay_capture(&path).await?;
    assert!(summary.error.is_none(), "{:?}", summary.error);
    assert_eq!(summary.commands, 7);
    assert_eq!(summary.data_bytes, (dictionary.len() + calls.len()) as u64);
    assert_eq!(dump.name(), format!("{NAMESPACE}:{SERVICE}:pod-emu"));

    let parsed = dump.parse_streams();
    let words = parsed.dictionary.as_ref().context("dictionary missing")?;
    assert_eq!(words.records.get(1), "doGet");
    let decoded = parsed.calls.as_ref().context("calls missing")?;
    assert_eq!(decoded.records.list.len(), 2);
    assert_eq!(decoded.records.start_ms, CAPTURED_START);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

/// Sending a replayed capture to a collector reproduces its streams, with
/// the calls re-stamped to the emulated start time.
#[tokio::test]
async fn test_emulated_pod_matches_capture() -> Result<()> {
    let dictionary = dictionary_bytes(&["java.lang.Thread.run", "doGet"]);
    let calls = calls_bytes();
    let dir = temp_dir("emulate");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("session.bin");
    std::fs::write(&path, build_capture(&dictionary, &calls).await?)?;
    let (captured, _) = replay_capture(&path).await?;

    let (addr, server) = serve_one(Arc::new(NoopObserver)).await?;
    let mut conn = agent(addr).await?;
    conn.initialize_connection(
        captured.protocol_version,
        &captured.namespace,
        &captured.service,
        &captured.pod,
    )
    .await?;
    let sent = conn
        .send_pod_dump(&captured, EMULATED_START, Duration::ZERO)
        .await?;
    assert_eq!(conn.pending_acks(), 0);
    conn.close().await?;

    let kinds: Vec<_> = sent.iter().map(|(t, _)| t.clone()).collect();
    assert_eq!(kinds, [StreamType::Dictionary, StreamType::Calls]);

    let received = server.await??.sink;
    assert_eq!(received.name(), captured.name());

    let dict = received.dictionary_chunk().context("dictionary missing")?;
    assert_eq!(dict.bytes(), &dictionary[..]);
    assert_eq!(read_dictionary(dict).records.len(), 2);

    let calls_chunk = received.by_type(&StreamType::Calls).context("calls missing")?;
    assert_eq!(calls_chunk.size(), calls.len());
    let decoded = read_calls(calls_chunk);
    assert!(decoded.is_complete(), "{:?}", decoded.error);
    assert_eq!(decoded.records.start_ms, EMULATED_START);
    assert_eq!(decoded.records.list.len(), 2);
    assert_eq!(decoded.records.list[1].time_ms, EMULATED_START + 20);

    // the capture itself is left untouched
    let original = read_calls(captured.by_type(&StreamType::Calls).context("calls")?);
    assert_eq!(original.records.start_ms, CAPTURED_START);

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
