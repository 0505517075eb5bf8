use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header::CONTENT_TYPE, Method, Request};
use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::proxy::upstream::{read_success_body, RequestExecutor};

/// Per-search request options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Target index pattern. Ignored for point in time searches, where the
    /// PIT already names the indices.
    pub index: Option<String>,
    pub track_total_hits: bool,
    pub filter_path: Option<String>,
}

/// The three Elasticsearch operations the paginator needs.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn open_point_in_time(&self, indices: &[String], keep_alive: &str) -> Result<String>;

    /// Run a search and return the raw response body.
    async fn search(&self, body: Option<Bytes>, options: &SearchOptions) -> Result<Bytes>;

    async fn close_point_in_time(&self, id: &str) -> Result<()>;
}

/// Elasticsearch REST calls issued through a [`RequestExecutor`], normally the
/// console proxy tunnel.
pub struct SearchClient {
    executor: Arc<dyn RequestExecutor>,
}

#[derive(Deserialize)]
struct OpenPitResponse {
    id: String,
}

impl SearchClient {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self { executor }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, &str)],
        body: Option<Bytes>,
    ) -> Result<Bytes> {
        let target = request_target(path, params)?;
        debug!("Elasticsearch {} {}", method, target);

        let mut builder = Request::builder().method(method).uri(target);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let request = builder.body(body.unwrap_or_default())?;

        let response = self.executor.execute(request).await?;
        read_success_body(response).await
    }
}

#[async_trait]
impl SearchApi for SearchClient {
    async fn open_point_in_time(&self, indices: &[String], keep_alive: &str) -> Result<String> {
        let path = format!("/{}/_pit", indices.join(","));
        let body = self
            .send(Method::POST, &path, &[("keep_alive", keep_alive)], None)
            .await?;

        let pit: OpenPitResponse = serde_json::from_slice(&body)?;
        Ok(pit.id)
    }

    async fn search(&self, body: Option<Bytes>, options: &SearchOptions) -> Result<Bytes> {
        let path = match &options.index {
            Some(index) if !index.is_empty() => format!("/{}/_search", index),
            _ => "/_search".to_string(),
        };

        let track_total_hits = options.track_total_hits.to_string();
        let mut params = vec![("track_total_hits", track_total_hits.as_str())];
        if let Some(filter_path) = &options.filter_path {
            params.push(("filter_path", filter_path.as_str()));
        }

        // Search with a body is sent as POST, mirroring what Elasticsearch clients do.
        let method = if body.is_some() { Method::POST } else { Method::GET };
        self.send(method, &path, &params, body).await
    }

    async fn close_point_in_time(&self, id: &str) -> Result<()> {
        let body = serde_json::to_vec(&json!({ "id": id }))?;
        self.send(Method::DELETE, "/_pit", &[], Some(Bytes::from(body)))
            .await?;
        Ok(())
    }
}

/// Build an origin-form target (`/path?query`) with form-encoded parameters.
fn request_target(path: &str, params: &[(&str, &str)]) -> Result<String> {
    let mut url = Url::parse("http://elasticsearch")
        .and_then(|base| base.join(path))
        .map_err(|e| ProxyError::config(format!("Invalid request path {}: {}", path, e)))?;

    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    })
}
