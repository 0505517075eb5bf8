use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, Request, Response},
};
use bytes::Bytes;
use reqwest::Url;

use crate::error::Result;
use crate::observability::{default_sink, DebugRecorder, DumpRecorder, LogSink};
use super::rewrite::RewriteRule;
use super::upstream::{ReqwestExecutor, RequestExecutor};

/// Request executor that tunnels every request through the Kibana console
/// proxy before handing it to the wrapped executor.
pub struct TunnelingTransport {
    rule: RewriteRule,
    recorder: Option<Arc<dyn DebugRecorder>>,
    inner: Arc<dyn RequestExecutor>,
}

impl TunnelingTransport {
    pub fn builder() -> TunnelingTransportBuilder {
        TunnelingTransportBuilder::default()
    }

    pub fn rule(&self) -> &RewriteRule {
        &self.rule
    }
}

#[async_trait]
impl RequestExecutor for TunnelingTransport {
    async fn execute(&self, req: Request<Bytes>) -> Result<Response<Body>> {
        let rewritten = self.rule.rewrite(&req)?;

        if let Some(recorder) = &self.recorder {
            recorder.record(&req, &rewritten);
        }

        self.inner.execute(rewritten).await
    }
}

/// Independent, composable options for [`TunnelingTransport`].
#[derive(Default)]
pub struct TunnelingTransportBuilder {
    url: Option<Url>,
    headers: HeaderMap,
    debug: bool,
    sink: Option<Arc<dyn LogSink>>,
    recorder: Option<Arc<dyn DebugRecorder>>,
    executor: Option<Arc<dyn RequestExecutor>>,
}

impl TunnelingTransportBuilder {
    /// Kibana base URL; the console proxy path is derived from it.
    pub fn url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Sink used by the default debug recorder.
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the default dump recorder. Only consulted when debug is on.
    pub fn recorder(mut self, recorder: Arc<dyn DebugRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<TunnelingTransport> {
        let rule = match &self.url {
            Some(url) => RewriteRule::new(url),
            None => RewriteRule::default(),
        }
        .with_headers(self.headers);

        let recorder = if self.debug {
            let sink = self.sink.unwrap_or_else(default_sink);
            Some(
                self.recorder
                    .unwrap_or_else(|| Arc::new(DumpRecorder::new(sink)) as Arc<dyn DebugRecorder>),
            )
        } else {
            None
        };

        let inner = match self.executor {
            Some(executor) => executor,
            None => Arc::new(ReqwestExecutor::new(
                Duration::from_secs(30),
                Duration::from_secs(10),
            )?),
        };

        Ok(TunnelingTransport {
            rule,
            recorder,
            inner,
        })
    }
}
