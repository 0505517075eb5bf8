use std::fmt::Write as _;
use std::sync::Arc;

use axum::http::{header::HOST, Request};
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Severity of a message handed to a [`LogSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Notice,
    Warn,
}

/// Destination for the operational messages produced by the tunnel and the
/// paginator. Injected at construction so callers can capture output.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);
}

/// Default sink, forwarding everything to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => debug!(target: "kibana_es_proxy", "{}", message),
            Level::Notice => info!(target: "kibana_es_proxy", "{}", message),
            Level::Warn => warn!(target: "kibana_es_proxy", "{}", message),
        }
    }
}

pub fn default_sink() -> Arc<dyn LogSink> {
    Arc::new(TracingSink)
}

/// Observer of the request before and after the console proxy rewrite.
pub trait DebugRecorder: Send + Sync {
    fn record(&self, original: &Request<Bytes>, rewritten: &Request<Bytes>);
}

/// Writes HTTP/1.1-style dumps of both requests to a [`LogSink`]. The original
/// is dumped without its body, the rewritten request with it.
pub struct DumpRecorder {
    sink: Arc<dyn LogSink>,
}

impl DumpRecorder {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl DebugRecorder for DumpRecorder {
    fn record(&self, original: &Request<Bytes>, rewritten: &Request<Bytes>) {
        if let Some(dump) = dump_request(original, false) {
            self.sink.log(Level::Debug, &format!("original {}", dump));
        }
        if let Some(dump) = dump_request(rewritten, true) {
            self.sink.log(Level::Debug, &format!("outgoing {}", dump));
        }
    }
}

/// Render a request as it would appear on the wire. Returns `None` when the
/// dump cannot be produced; callers treat that as nothing to log.
pub fn dump_request(req: &Request<Bytes>, include_body: bool) -> Option<String> {
    let uri = req.uri();
    let target = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut out = String::new();
    write!(out, "{} {} HTTP/1.1\r\n", req.method(), target).ok()?;

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = uri.authority() {
            write!(out, "Host: {}\r\n", authority).ok()?;
        }
    }
    for (name, value) in req.headers() {
        write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes())).ok()?;
    }
    out.push_str("\r\n");

    if include_body && !req.body().is_empty() {
        out.push_str(&String::from_utf8_lossy(req.body()));
    }

    Some(out)
}
