use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
};
use bytes::Bytes;
use tracing::{debug, error};

use crate::error::{ProxyError, Result};

/// Executes a fully formed outbound request.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, req: Request<Bytes>) -> Result<Response<Body>>;
}

/// Default executor backed by a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    /// `request_timeout` bounds the whole exchange, body included. No default
    /// user-agent is set, so callers that sent none forward none.
    pub fn new(request_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        Self::build(reqwest::Client::builder().timeout(request_timeout), connect_timeout)
    }

    /// Executor for relaying: `read_timeout` bounds each read of the response
    /// instead of the whole transfer, so long streamed bodies are not cut off.
    pub fn relaying(read_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        Self::build(reqwest::Client::builder().read_timeout(read_timeout), connect_timeout)
    }

    fn build(builder: reqwest::ClientBuilder, connect_timeout: Duration) -> Result<Self> {
        let client = builder
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ProxyError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    async fn execute(&self, req: Request<Bytes>) -> Result<Response<Body>> {
        let target = req.uri().to_string();
        let request = reqwest::Request::try_from(req)?;

        debug!("Sending {} {}", request.method(), target);
        let response = self.client.execute(request).await.map_err(|e| {
            error!("Upstream request to {} failed: {}", target, e);
            ProxyError::Upstream(format!("Request failed: {}", e))
        })?;

        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            *headers = response.headers().clone();
        }

        Ok(builder.body(Body::from_stream(response.bytes_stream()))?)
    }
}

/// Collect a response body, failing with the body text when the status is
/// not a success.
pub async fn read_success_body(response: Response<Body>) -> Result<Bytes> {
    use http_body_util::BodyExt;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::Upstream(format!("Failed to read response body: {}", e)))?
        .to_bytes();

    if !status.is_success() {
        return Err(ProxyError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    Ok(body)
}
