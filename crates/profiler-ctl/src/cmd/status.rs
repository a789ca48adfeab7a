//! Collector status, pods, shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    uptime_secs: u64,
    pods: PodStats,
    io: IoInfo,
}

#[derive(Deserialize)]
struct PodStats {
    pods_total: usize,
    pods_live: usize,
    streams: u64,
    data_bytes: u64,
}

#[derive(Deserialize)]
struct IoInfo {
    commands: u64,
    command_errors: u64,
    bytes_read: u64,
    bytes_written: u64,
    errors: u64,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct PodInfo {
    name: String,
    namespace: String,
    service: String,
    pod: String,
    protocol_version: i64,
    peer: Option<String>,
    connected_at: String,
    disconnected_at: Option<String>,
    live: bool,
    streams: u64,
    data_bytes: u64,
    commands: u64,
    last_error: Option<String>,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Profiler Collector Status");
    println!("═══════════════════════════════════════");
    println!("  Uptime           : {}s", resp.uptime_secs);
    println!("  Pods (live/all)  : {}/{}", resp.pods.pods_live, resp.pods.pods_total);
    println!("  Streams opened   : {}", resp.pods.streams);
    println!("  Data received    : {} bytes", resp.pods.data_bytes);
    println!();
    println!("  Commands         : {} ({} failed)", resp.io.commands, resp.io.command_errors);
    println!("  Bytes read       : {}", resp.io.bytes_read);
    println!("  Bytes written    : {}", resp.io.bytes_written);
    println!("  Connection errors: {}", resp.io.errors);

    Ok(())
}

pub async fn cmd_pods(port: u16) -> Result<()> {
    let pods: Vec<PodInfo> = get_json(&format!("{}/pods", base_url(port))).await?;

    if pods.is_empty() {
        println!("No pods have connected yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Pods ({})", pods.len());
    println!("═══════════════════════════════════════");
    for p in &pods {
        print_pod(p);
    }
    Ok(())
}

pub async fn cmd_pod(port: u16, name: &str) -> Result<()> {
    let pod: PodInfo = get_json(&format!("{}/pods/{}", base_url(port), name)).await?;
    print_pod(&pod);
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/collector/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

fn print_pod(p: &PodInfo) {
    let state = if p.live { "live" } else { "gone" };
    println!("  ┌─ {} [{}]", p.name, state);
    println!("  │  peer      : {}", p.peer.as_deref().unwrap_or("-"));
    println!("  │  protocol  : {}", p.protocol_version);
    println!("  │  connected : {}", p.connected_at);
    println!("  │  streams   : {}", p.streams);
    println!("  │  data      : {} bytes", p.data_bytes);
    if let Some(e) = &p.last_error {
        println!("  │  error     : {}", e);
    }
    println!("  └─ commands  : {}", p.commands);
}
