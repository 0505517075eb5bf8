use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::format_duration;
use crate::error::{ProxyError, Result};
use crate::observability::{default_sink, Level, LogSink};
use super::client::{SearchApi, SearchOptions};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Upper bound for the PIT close issued on the way out, independent of the
/// cancellation token.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Index pattern used when the caller names none.
const ALL_INDICES: &str = "*";

/// Outcome of a completed paginated run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationSummary {
    pub pages: usize,
    pub pit_rotations: usize,
}

/// The subset of a search response needed to request the next page.
#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    pit_id: Option<String>,
    #[serde(default)]
    hits: Hits,
}

#[derive(Debug, Default, Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(default)]
    sort: Option<Value>,
}

/// Where a run currently is. PIT-closed and failed are terminal and live
/// outside the loop, on the [`PointInTime`] handle and the returned result.
enum Phase {
    PitOpen,
    PageInFlight,
    PageDecoded(SearchPage),
    Exhausted,
}

/// An open point in time. `close` consumes the handle; dropping one that was
/// never closed means the server keeps it until its keep-alive lapses.
struct PointInTime {
    id: String,
    open: bool,
}

impl PointInTime {
    fn new(id: String) -> Self {
        Self { id, open: true }
    }

    async fn close(mut self, api: &dyn SearchApi, sink: &dyn LogSink) {
        self.open = false;
        let closing = api.close_point_in_time(&self.id);
        match tokio::time::timeout(CLEANUP_TIMEOUT, closing).await {
            Ok(Ok(())) => debug!("Closed point in time {}", self.id),
            Ok(Err(e)) => sink.log(
                Level::Warn,
                &format!("failed to close PIT {}: {}", self.id, e),
            ),
            Err(_) => sink.log(
                Level::Warn,
                &format!("timed out closing PIT {}", self.id),
            ),
        }
    }
}

impl Drop for PointInTime {
    fn drop(&mut self) {
        if self.open {
            warn!("point in time {} dropped without being closed", self.id);
        }
    }
}

/// Walks search results with a point in time and `search_after`, writing each
/// page to the output as soon as it arrives.
pub struct PaginationController {
    api: Arc<dyn SearchApi>,
    sink: Arc<dyn LogSink>,
    keep_alive: Duration,
    options: SearchOptions,
    cancel: CancellationToken,
}

impl PaginationController {
    pub fn new(api: Arc<dyn SearchApi>) -> Self {
        Self {
            api,
            sink: default_sink(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            options: SearchOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Options applied to every page. The index is dropped since the PIT
    /// carries it.
    pub fn with_options(mut self, options: SearchOptions) -> Self {
        self.options = SearchOptions {
            index: None,
            ..options
        };
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch up to `page_count` pages of `query` across `indices`.
    ///
    /// The query must carry a `sort` clause; without it nothing is sent.
    /// Fewer pages are returned when a page comes back without hits.
    pub async fn run<W>(
        &self,
        mut query: Map<String, Value>,
        indices: &[String],
        page_count: usize,
        out: &mut W,
    ) -> Result<PaginationSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !query.contains_key("sort") {
            return Err(ProxyError::config("missing sort in query"));
        }
        if page_count == 0 {
            return Ok(PaginationSummary::default());
        }
        if let Some(filter_path) = &self.options.filter_path {
            if !filter_path.contains("pit_id") {
                self.sink.log(
                    Level::Notice,
                    "filter_path does not include pit_id; PIT rotations will not be followed",
                );
            }
        }

        let indices: Vec<String> = if indices.is_empty() {
            vec![ALL_INDICES.to_string()]
        } else {
            indices.to_vec()
        };
        let keep_alive = format_duration(&self.keep_alive);

        let id = self
            .guarded(self.api.open_point_in_time(&indices, &keep_alive))
            .await
            .map_err(|e| match e {
                ProxyError::Status { status, body } => ProxyError::Status {
                    status,
                    body: format!("while creating PIT: {}", body),
                },
                other => other,
            })?;
        debug!("Opened point in time {}", id);

        let mut pit = PointInTime::new(id);
        let outcome = self
            .drive(&mut pit, &mut query, &keep_alive, page_count, out)
            .await;
        pit.close(self.api.as_ref(), self.sink.as_ref()).await;

        outcome
    }

    async fn drive<W>(
        &self,
        pit: &mut PointInTime,
        query: &mut Map<String, Value>,
        keep_alive: &str,
        page_count: usize,
        out: &mut W,
    ) -> Result<PaginationSummary>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut summary = PaginationSummary::default();
        let mut phase = Phase::PitOpen;

        loop {
            phase = match phase {
                Phase::PitOpen => {
                    query.insert("pit".to_string(), json!({ "id": pit.id, "keep_alive": keep_alive }));
                    Phase::PageInFlight
                }
                Phase::PageInFlight => {
                    let body = Bytes::from(serde_json::to_vec(&*query)?);
                    let page = self.guarded(self.api.search(Some(body), &self.options)).await?;
                    write_page(out, &page, true).await?;
                    summary.pages += 1;

                    if summary.pages >= page_count {
                        Phase::Exhausted
                    } else {
                        Phase::PageDecoded(serde_json::from_slice(&page)?)
                    }
                }
                Phase::PageDecoded(page) => match page.hits.hits.last() {
                    None => Phase::Exhausted,
                    Some(last) => {
                        let search_after = last.sort.clone().ok_or_else(|| {
                            <serde_json::Error as serde::de::Error>::custom(
                                "last hit has no sort values",
                            )
                        })?;
                        query.insert("search_after".to_string(), search_after);

                        match page.pit_id {
                            Some(new_id) if new_id != pit.id => {
                                self.sink.log(
                                    Level::Notice,
                                    &format!("PIT changed, old: {}, new: {}", pit.id, new_id),
                                );
                                pit.id = new_id;
                                summary.pit_rotations += 1;
                            }
                            Some(_) => {}
                            None => self.sink.log(
                                Level::Notice,
                                &format!("response carried no pit_id, keeping {}", pit.id),
                            ),
                        }
                        query.insert("pit".to_string(), json!({ "id": pit.id, "keep_alive": keep_alive }));
                        Phase::PageInFlight
                    }
                },
                Phase::Exhausted => break,
            };
        }

        Ok(summary)
    }

    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(ProxyError::Cancelled("pagination cancelled".to_string()))
            }
            result = call => result,
        }
    }
}

/// Issue a single search without a point in time and write the response.
pub async fn search_once<W>(
    api: &dyn SearchApi,
    query: Option<Bytes>,
    options: &SearchOptions,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let page = api.search(query, options).await?;
    write_page(out, &page, false).await
}

/// Write a response body as received. With `separate`, a missing trailing
/// newline is added so consecutive pages stay separable.
async fn write_page<W>(out: &mut W, page: &[u8], separate: bool) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    out.write_all(page).await?;
    if separate && !page.ends_with(b"\n") {
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::logger::tests::CaptureSink;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Open(Vec<String>, String),
        Search(Value),
        Close(String),
    }

    /// Search API double: records every call and replays scripted pages.
    #[derive(Default)]
    struct FakeSearchApi {
        calls: Mutex<Vec<Call>>,
        pages: Mutex<VecDeque<Result<Bytes>>>,
        fail_open: bool,
        fail_close: bool,
        cancel_after_search: Option<CancellationToken>,
    }

    impl FakeSearchApi {
        fn with_pages(pages: Vec<Result<Bytes>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn searches(&self) -> Vec<Value> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Search(body) => Some(body),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl SearchApi for FakeSearchApi {
        async fn open_point_in_time(&self, indices: &[String], keep_alive: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Open(indices.to_vec(), keep_alive.to_string()));
            if self.fail_open {
                return Err(ProxyError::Upstream("connection refused".to_string()));
            }
            Ok("pit-1".to_string())
        }

        async fn search(&self, body: Option<Bytes>, _options: &SearchOptions) -> Result<Bytes> {
            let body = body
                .map(|b| serde_json::from_slice(&b).unwrap())
                .unwrap_or(Value::Null);
            self.calls.lock().unwrap().push(Call::Search(body));
            if let Some(token) = &self.cancel_after_search {
                token.cancel();
            }
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProxyError::Upstream("no more pages".to_string())))
        }

        async fn close_point_in_time(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Call::Close(id.to_string()));
            if self.fail_close {
                return Err(ProxyError::Status {
                    status: 404,
                    body: "{}".to_string(),
                });
            }
            Ok(())
        }
    }

    fn page(pit_id: &str, sorts: &[i64]) -> Result<Bytes> {
        let hits: Vec<Value> = sorts
            .iter()
            .map(|s| json!({ "_id": s.to_string(), "sort": [s, "tiebreak"] }))
            .collect();
        Ok(Bytes::from(
            json!({ "pit_id": pit_id, "hits": { "hits": hits } }).to_string(),
        ))
    }

    fn sorted_query() -> Map<String, Value> {
        match json!({ "query": { "match_all": {} }, "sort": [{ "@timestamp": "asc" }] }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn indices(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_sort_fails_without_network_calls() {
        let api = Arc::new(FakeSearchApi::default());
        let controller = PaginationController::new(api.clone());
        let mut query = sorted_query();
        query.remove("sort");
        let mut out = Vec::new();

        let err = controller.run(query, &[], 3, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Config(_)));
        assert!(api.calls().is_empty());
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_stops_after_empty_page() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![
            page("pit-1", &[1, 2]),
            page("pit-1", &[3]),
            page("pit-1", &[]),
        ]));
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let summary = controller
            .run(sorted_query(), &indices(&["logs-*"]), 5, &mut out)
            .await
            .unwrap();

        assert_eq!(summary, PaginationSummary { pages: 3, pit_rotations: 0 });
        let calls = api.calls();
        assert_eq!(calls.len(), 5);
        assert_eq!(calls[0], Call::Open(indices(&["logs-*"]), "1m".to_string()));
        assert!(matches!(calls[1], Call::Search(_)));
        assert!(matches!(calls[2], Call::Search(_)));
        assert!(matches!(calls[3], Call::Search(_)));
        assert_eq!(calls[4], Call::Close("pit-1".to_string()));

        let searches = api.searches();
        assert!(searches[0].get("search_after").is_none());
        assert_eq!(searches[0]["pit"], json!({ "id": "pit-1", "keep_alive": "1m" }));
        assert_eq!(searches[1]["search_after"], json!([2, "tiebreak"]));
        assert_eq!(searches[2]["search_after"], json!([3, "tiebreak"]));
        assert_eq!(searches[2]["sort"], json!([{ "@timestamp": "asc" }]));

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_page_budget_limits_searches() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![
            page("pit-1", &[1]),
            // never decoded: the budget is spent after this page
            Ok(Bytes::from_static(b"not json")),
        ]));
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let summary = controller.run(sorted_query(), &[], 2, &mut out).await.unwrap();

        assert_eq!(summary.pages, 2);
        assert_eq!(api.searches().len(), 2);
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-1".to_string())));
    }

    #[tokio::test]
    async fn test_defaults_to_all_indices() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![page("pit-1", &[])]));
        let controller = PaginationController::new(api.clone())
            .with_keep_alive(Duration::from_secs(90));
        let mut out = Vec::new();

        controller.run(sorted_query(), &[], 2, &mut out).await.unwrap();

        assert_eq!(api.calls()[0], Call::Open(indices(&["*"]), "90s".to_string()));
    }

    #[tokio::test]
    async fn test_adopts_rotated_pit_id() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![
            page("pit-2", &[1]),
            page("pit-2", &[2]),
            page("pit-3", &[3]),
        ]));
        let sink = Arc::new(CaptureSink::default());
        let controller = PaginationController::new(api.clone()).with_log_sink(sink.clone());
        let mut out = Vec::new();

        let summary = controller.run(sorted_query(), &[], 3, &mut out).await.unwrap();

        assert_eq!(summary.pit_rotations, 1);
        let searches = api.searches();
        assert_eq!(searches[0]["pit"]["id"], "pit-1");
        assert_eq!(searches[1]["pit"]["id"], "pit-2");
        assert_eq!(searches[2]["pit"]["id"], "pit-2");
        // the third response is not decoded, so pit-3 is never seen
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-2".to_string())));

        let notices = sink.messages(Level::Notice);
        assert_eq!(notices, vec!["PIT changed, old: pit-1, new: pit-2".to_string()]);
    }

    #[tokio::test]
    async fn test_closes_pit_when_search_fails() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![
            page("pit-7", &[1]),
            Err(ProxyError::Upstream("connection reset".to_string())),
        ]));
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let err = controller.run(sorted_query(), &[], 3, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(api.searches().len(), 2);
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-7".to_string())));
        // the first page was already delivered
        assert!(String::from_utf8(out).unwrap().contains("pit-7"));
    }

    #[tokio::test]
    async fn test_closes_pit_on_decode_error() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![Ok(Bytes::from_static(
            b"{\"hits\": [",
        ))]));
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let err = controller.run(sorted_query(), &[], 2, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Decode(_)));
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-1".to_string())));
        assert!(!out.is_empty());
    }

    #[tokio::test]
    async fn test_hit_without_sort_is_decode_error() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![Ok(Bytes::from(
            json!({ "pit_id": "pit-1", "hits": { "hits": [{ "_id": "a" }] } }).to_string(),
        ))]));
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let err = controller.run(sorted_query(), &[], 2, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Decode(_)));
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-1".to_string())));
    }

    #[tokio::test]
    async fn test_open_failure_makes_no_further_calls() {
        let api = Arc::new(FakeSearchApi {
            fail_open: true,
            ..Default::default()
        });
        let controller = PaginationController::new(api.clone());
        let mut out = Vec::new();

        let err = controller.run(sorted_query(), &[], 3, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Upstream(_)));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_is_logged_not_raised() {
        let api = Arc::new(FakeSearchApi {
            fail_close: true,
            ..FakeSearchApi::with_pages(vec![page("pit-1", &[1]), page("pit-1", &[])])
        });
        let sink = Arc::new(CaptureSink::default());
        let controller = PaginationController::new(api.clone()).with_log_sink(sink.clone());
        let mut out = Vec::new();

        let summary = controller.run(sorted_query(), &[], 3, &mut out).await.unwrap();

        assert_eq!(summary.pages, 2);
        let warnings = sink.messages(Level::Warn);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("failed to close PIT pit-1"));
    }

    #[tokio::test]
    async fn test_cancellation_still_closes_pit() {
        let token = CancellationToken::new();
        let api = Arc::new(FakeSearchApi {
            cancel_after_search: Some(token.clone()),
            ..FakeSearchApi::with_pages(vec![page("pit-1", &[1]), page("pit-1", &[2])])
        });
        let controller = PaginationController::new(api.clone()).with_cancellation(token);
        let mut out = Vec::new();

        let err = controller.run(sorted_query(), &[], 3, &mut out).await.unwrap_err();

        assert!(matches!(err, ProxyError::Cancelled(_)));
        assert_eq!(api.searches().len(), 1);
        assert_eq!(api.calls().last(), Some(&Call::Close("pit-1".to_string())));
    }

    #[tokio::test]
    async fn test_missing_pit_id_keeps_current() {
        let api = Arc::new(FakeSearchApi::with_pages(vec![
            Ok(Bytes::from(
                json!({ "hits": { "hits": [{ "sort": [5] }] } }).to_string(),
            )),
            page("pit-1", &[]),
        ]));
        let sink = Arc::new(CaptureSink::default());
        let controller = PaginationController::new(api.clone())
            .with_log_sink(sink.clone())
            .with_options(SearchOptions {
                index: Some("ignored".to_string()),
                track_total_hits: false,
                filter_path: Some("hits.hits.sort".to_string()),
            });
        let mut out = Vec::new();

        controller.run(sorted_query(), &[], 3, &mut out).await.unwrap();

        let searches = api.searches();
        assert_eq!(searches[1]["pit"]["id"], "pit-1");
        assert_eq!(searches[1]["search_after"], json!([5]));
        assert_eq!(sink.messages(Level::Notice).len(), 2);
    }

    #[tokio::test]
    async fn test_search_once_writes_single_page() {
        let api = FakeSearchApi::with_pages(vec![Ok(Bytes::from_static(b"{\"took\":3}\n"))]);
        let mut out = Vec::new();

        search_once(&api, None, &SearchOptions::default(), &mut out)
            .await
            .unwrap();

        assert_eq!(out, b"{\"took\":3}\n");
        assert!(api.calls().iter().all(|c| !matches!(c, Call::Open(..) | Call::Close(_))));
    }

    #[tokio::test]
    async fn test_search_once_writes_body_unchanged() {
        let api = FakeSearchApi::with_pages(vec![Ok(Bytes::from_static(b"{\"took\":3}"))]);
        let mut out = Vec::new();

        search_once(&api, None, &SearchOptions::default(), &mut out)
            .await
            .unwrap();

        assert_eq!(out, b"{\"took\":3}");
    }
}
