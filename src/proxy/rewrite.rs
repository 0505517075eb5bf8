use axum::http::{header::HeaderValue, HeaderMap, Method, Request};
use bytes::Bytes;
use reqwest::Url;

use crate::error::Result;

/// Fixed path of the Kibana console proxy endpoint.
pub const PROXY_PATH: &str = "/api/console/proxy";

/// Kibana refuses console proxy calls without this header.
pub const XSRF_HEADER: &str = "kbn-xsrf";
pub const XSRF_VALUE: &str = "kibana-elasticsearch-proxy";

pub const DEFAULT_KIBANA_URL: &str = "http://localhost:5601";

/// Immutable description of how inbound requests are tunneled.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    url: Url,
    headers: HeaderMap,
}

impl Default for RewriteRule {
    fn default() -> Self {
        let base = Url::parse(DEFAULT_KIBANA_URL).expect("default Kibana URL is valid");
        Self::new(&base)
    }
}

impl RewriteRule {
    /// Derive the tunnel endpoint from a Kibana base URL. Any trailing slash
    /// on the base path is dropped before the proxy path is appended.
    pub fn new(base: &Url) -> Self {
        let mut url = base.clone();
        let path = format!("{}{}", base.path().trim_end_matches('/'), PROXY_PATH);
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        // Credentials travel as an Authorization header, never in the URL.
        let _ = url.set_username("");
        let _ = url.set_password(None);

        Self {
            url,
            headers: HeaderMap::new(),
        }
    }

    /// Headers appended to every tunneled request.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `host[:port]` of the Kibana target, as sent in the Host header.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Build the console proxy form of `inbound`. The inbound request is left
    /// untouched; headers and body are copied into the new request.
    pub fn rewrite(&self, inbound: &Request<Bytes>) -> Result<Request<Bytes>> {
        let tunneled_path = inbound
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("method", inbound.method().as_str())
            .append_pair("path", tunneled_path);

        let mut headers = inbound.headers().clone();
        for (name, value) in self.headers.iter() {
            headers.append(name, value.clone());
        }
        // insert replaces every prior value, so the header is present exactly once
        headers.insert(XSRF_HEADER, HeaderValue::from_static(XSRF_VALUE));

        let mut outbound = Request::builder()
            .method(Method::POST)
            .uri(url.as_str())
            .body(inbound.body().clone())?;
        *outbound.headers_mut() = headers;

        Ok(outbound)
    }
}
