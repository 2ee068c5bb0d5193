use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

use super::client::HttpClient;

/// How a feed expects its API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedAuth {
    /// Sent as an HTTP header, e.g. `x-api-key`.
    Header { name: String, key: String },
    /// Appended as a URL query parameter, e.g. `?api_key=...`.
    UrlParam { name: String, key: String },
}

impl FeedAuth {
    /// Adds the key to `req`.
    ///
    /// An invalid header name or value is left off; the feed then answers 401
    /// and the poll is skipped like any other fetch failure.
    pub fn apply(&self, req: &mut reqwest::Request) {
        match self {
            FeedAuth::Header { name, key } => {
                if let (Ok(name), Ok(value)) =
                    (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(key))
                {
                    req.headers_mut().insert(name, value);
                }
            }
            FeedAuth::UrlParam { name, key } => {
                req.url_mut().query_pairs_mut().append_pair(name, key);
            }
        }
    }
}

/// An [`HttpClient`] wrapper that injects a feed's API key into every request.
pub struct Authenticated<C> {
    inner: C,
    auth: Option<FeedAuth>,
}

impl<C> Authenticated<C> {
    pub fn new(inner: C, auth: Option<FeedAuth>) -> Self {
        Self { inner, auth }
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for Authenticated<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        if let Some(auth) = &self.auth {
            auth.apply(&mut req);
        }
        self.inner.execute(req).await
    }
}
