//! The `status` command: query a running instance's readiness endpoint.

use anyhow::{Context, Result};

/// Fetch and print the readiness state of a running instance.
pub async fn run(url: &str) -> Result<()> {
    let ready_url = format!("{}/ready", url.trim_end_matches('/'));
    let response = reqwest::get(&ready_url)
        .await
        .with_context(|| format!("failed to reach {ready_url}"))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    if status.is_success() {
        println!("ready");
    } else {
        println!("not ready ({status})");
        if !body.is_empty() {
            print!("{body}");
        }
    }
    Ok(())
}
