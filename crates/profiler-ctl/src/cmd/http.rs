//! Shared HTTP request helpers for CLI commands.

use anyhow::{Context, Result};
use serde::Deserialize;

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}/api", port)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to profiler-collector at {} (is it running?)", url))?;
    if !resp.status().is_success() {
        anyhow::bail!("{} returned {}", url, resp.status());
    }
    resp.json::<T>().await.context("failed to parse response")
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| format!("failed to connect to profiler-collector at {} (is it running?)", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}
