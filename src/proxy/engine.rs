use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header::HOST, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
    Router,
};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use super::upstream::RequestExecutor;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Matches Elasticsearch's default `http.max_content_length`.
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Reverse proxy front end: every inbound request is handed to the tunneling
/// transport and the upstream response is relayed back.
pub struct ReverseProxy {
    transport: Arc<dyn RequestExecutor>,
    host: HeaderValue,
    max_body_bytes: usize,
}

#[derive(Clone)]
struct AppState {
    proxy: Arc<ReverseProxy>,
}

impl ReverseProxy {
    /// `target_host` is sent as the Host header of every outbound request.
    pub fn new(transport: Arc<dyn RequestExecutor>, target_host: &str) -> Result<Self> {
        let host = HeaderValue::from_str(target_host)
            .map_err(|e| ProxyError::config(format!("Invalid target host {}: {}", target_host, e)))?;

        Ok(Self {
            transport,
            host,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Inbound bodies larger than `limit` are answered with 413.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handle_request)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .into_inner(),
            )
            .with_state(AppState { proxy: self })
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn start<F>(self: Arc<Self>, addr: &str, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::config(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("starting on http://{}", addr);
        self.serve(listener, shutdown).await
    }

    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }

    /// Process a single proxy request
    #[instrument(skip(self, req), fields(request_id))]
    pub async fn handle_proxy_request(&self, req: Request, client: SocketAddr) -> Result<Response> {
        let request_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("request_id", &request_id);

        info!("{} {} {}", client, req.method(), req.uri());

        let (parts, body) = req.into_parts();
        let body = Limited::new(body, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    ProxyError::PayloadTooLarge(self.max_body_bytes)
                } else {
                    ProxyError::ClientBody(e.to_string())
                }
            })?
            .to_bytes();

        let mut headers = HeaderMap::with_capacity(parts.headers.len() + 2);
        for (name, value) in parts.headers.iter() {
            if !is_hop_by_hop_header(name) && name != HOST {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.insert(HOST, self.host.clone());
        append_forwarded_for(&mut headers, client);

        let mut outbound = axum::http::Request::builder()
            .method(parts.method)
            .uri(parts.uri)
            .body(body)?;
        *outbound.headers_mut() = headers;

        let upstream = self.transport.execute(outbound).await?;
        debug!("Request {} answered with {}", request_id, upstream.status());

        Ok(build_response(upstream))
    }
}

async fn handle_request(
    State(state): State<AppState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    match state.proxy.handle_proxy_request(req, client).await {
        Ok(response) => response,
        Err(e) => {
            error!("Proxy request from {} failed: {}", client, e);
            e.into_response()
        }
    }
}

fn build_response(upstream: Response<Body>) -> Response {
    let (mut parts, body) = upstream.into_parts();
    let headers = std::mem::take(&mut parts.headers);
    for (name, value) in headers.iter() {
        if !is_hop_by_hop_header(name) {
            parts.headers.append(name.clone(), value.clone());
        }
    }
    Response::from_parts(parts, body)
}

fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

// Helper function to identify hop-by-hop headers
fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-authenticate" | "proxy-authorization" |
        "te" | "trailers" | "transfer-encoding" | "upgrade"
    )
}
