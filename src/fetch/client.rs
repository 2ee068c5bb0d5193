use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes one HTTP request against a feed endpoint.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
