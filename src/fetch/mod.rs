//! HTTP retrieval of raw feed payloads.

mod auth;
mod basic;
mod client;

pub use auth::{Authenticated, FeedAuth};
pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::Result;

/// Fetches `url` and returns the body, failing on non-success statuses.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}
