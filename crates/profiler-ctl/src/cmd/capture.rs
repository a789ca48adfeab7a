//! Offline capture commands: replay a recorded agent session and decode it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use profiler_core::StreamType;
use profiler_net::replay_capture;
use profiler_streams::ChunkSummary;

#[derive(Serialize)]
struct ReplayReport {
    pod: String,
    protocol_version: i64,
    commands: u64,
    data_bytes: u64,
    error: Option<String>,
    streams: Vec<ChunkSummary>,
}

pub async fn cmd_replay(path: &Path, json: bool) -> Result<()> {
    let (dump, summary) = replay_capture(path)
        .await
        .with_context(|| format!("failed to replay {}", path.display()))?;

    if json {
        let report = ReplayReport {
            pod: dump.name(),
            protocol_version: dump.protocol_version,
            commands: summary.commands,
            data_bytes: summary.data_bytes,
            error: summary.error.as_ref().map(|e| e.to_string()),
            streams: dump.summaries(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Capture {}", path.display());
    println!("═══════════════════════════════════════");
    println!("  Pod              : {}", dump.name());
    println!("  Protocol version : {}", dump.protocol_version);
    println!("  Commands         : {}", summary.commands);
    println!("  Data bytes       : {}", summary.data_bytes);
    if let Some(e) = &summary.error {
        println!("  Stopped early    : {}", e);
    }

    let chunks = dump.summaries();
    if chunks.is_empty() {
        println!("\n  No streams registered.");
    } else {
        println!("\n  Streams:");
        for c in &chunks {
            println!("  ┌─ {}", c.handle);
            println!("  │  type     : {}", c.stream_type);
            println!("  │  sequence : {}", c.sequence_id);
            println!("  └─ bytes    : {}", c.bytes);
        }
    }
    Ok(())
}

/// Decodes every known stream, or only `only` when given, and prints the
/// text rendering.
pub async fn cmd_decode(path: &Path, only: Option<&str>) -> Result<()> {
    let (dump, summary) = replay_capture(path)
        .await
        .with_context(|| format!("failed to replay {}", path.display()))?;
    if let Some(e) = &summary.error {
        eprintln!("warning: capture ends early: {}", e);
    }

    let parsed = dump.parse_streams();
    let types: Vec<StreamType> = match only {
        Some(name) => vec![StreamType::from(name)],
        None => dump.stream_types(),
    };

    for t in &types {
        match parsed.text_for(t) {
            Some(text) => {
                println!("── {} ──", t);
                println!("{}", text);
            }
            None if only.is_some() => anyhow::bail!("no decodable {} stream in capture", t),
            None => {}
        }
    }

    for (stream, e) in parsed.errors() {
        eprintln!("warning: {} decoding stopped at byte {}: {}", stream, e.pos(), e);
    }
    Ok(())
}
