//! profiler-ctl: command-line interface for the profiler collector and
//! recorded agent captures.

mod cmd;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use cmd::emulate::EmulateOptions;

const DEFAULT_PORT: u16 = 9715;
const DEFAULT_ADDR: &str = "127.0.0.1:1715";

fn print_usage() {
    println!("Usage: profiler-ctl [options] <command>");
    println!();
    println!("Commands:");
    println!("  status                     Show collector status");
    println!("  pods                       List pods seen by the collector");
    println!("  pod <ns:svc:pod>           Show one pod");
    println!("  shutdown                   Stop the collector");
    println!("  replay <capture>           Summarise a recorded agent session");
    println!("  decode <capture>           Print decoded streams of a capture");
    println!("  emulate <capture>          Send a capture to a collector as a live agent");
    println!();
    println!("Options:");
    println!("  --port <port>        Status API port (default: {})", DEFAULT_PORT);
    println!("  --json               replay: print the summary as JSON");
    println!("  --stream <type>      decode: only this stream type");
    println!("  --addr <host:port>   emulate: collector address (default: {})", DEFAULT_ADDR);
    println!("  --period-ms <ms>     emulate: spread calls and traces over this long (default: 0)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut stream: Option<String> = None;
    let mut addr = DEFAULT_ADDR.to_string();
    let mut period_ms: u64 = 0;
    let mut json = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--stream" => {
                i += 1;
                stream = Some(args.get(i).context("--stream requires a value")?.clone());
            }
            "--addr" => {
                i += 1;
                addr = args.get(i).context("--addr requires a value")?.clone();
            }
            "--period-ms" => {
                i += 1;
                period_ms = args
                    .get(i)
                    .context("--period-ms requires a value")?
                    .parse()
                    .context("--period-ms must be a number")?;
            }
            "--json" => json = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["pods"] => cmd::status::cmd_pods(port).await,
        ["pod", name] => cmd::status::cmd_pod(port, name).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["replay", path] => cmd::capture::cmd_replay(Path::new(path), json).await,
        ["decode", path] => cmd::capture::cmd_decode(Path::new(path), stream.as_deref()).await,
        ["emulate", path] => {
            let opts = EmulateOptions {
                addr,
                period: Duration::from_millis(period_ms),
            };
            cmd::emulate::cmd_emulate(Path::new(path), &opts).await
        }
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
