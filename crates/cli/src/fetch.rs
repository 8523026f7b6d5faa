//! Thin download glue for patch files referenced by URL.

use anyhow::Context;

pub fn is_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

pub async fn fetch_patch_from_url(url: &str) -> anyhow::Result<String> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| format!("request to {url} failed"))?
        .error_for_status()
        .with_context(|| format!("server rejected {url}"))?;
    resp.text()
        .await
        .with_context(|| format!("could not read body from {url}"))
}
