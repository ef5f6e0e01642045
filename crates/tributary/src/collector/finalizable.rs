//! Collection of entities that stop changing once finished (closed issues,
//! merged pull requests, completed builds).
//!
//! Phase 1 lists records newest first and stops at the first one created
//! before the last successful run. Phase 2, on incremental runs only,
//! refreshes the records that were still open last time by fetching their
//! details one input at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use crate::BoxFuture;
use crate::client::{AfterResponseHook, AsyncApiClient, Query};
use crate::collector::api_collector::{
    ApiCollector, ApiCollectorArgs, BodyBuilder, NextPageFn, ResponseParser, TotalPagesFn,
};
use crate::collector::iterator::InputIterator;
use crate::collector::state::CollectorStateManager;
use crate::collector::{ParsedPage, RawDataSubTaskArgs, RequestData};
use crate::error::Result;
use crate::http::{HttpHeaders, HttpMethod};

/// Query builder that also receives the created-after cutoff.
pub type FinalizableQueryBuilder =
    Arc<dyn Fn(&RequestData, Option<DateTime<Utc>>) -> Result<Query> + Send + Sync>;

/// Header builder that also receives the created-after cutoff.
pub type FinalizableHeaderBuilder =
    Arc<dyn Fn(&RequestData, Option<DateTime<Utc>>) -> Result<HttpHeaders> + Send + Sync>;

/// Reads the creation time of one listed item.
pub type CreatedAtFn = Arc<dyn Fn(&JsonValue) -> Result<DateTime<Utc>> + Send + Sync>;

/// Builds the iterator over unfinished records.
pub type InputIteratorBuilder =
    Box<dyn FnOnce() -> BoxFuture<'static, Result<Box<dyn InputIterator>>> + Send>;

/// Phase 1: list new records.
pub struct FinalizableListArgs {
    pub url_template: String,
    pub method: HttpMethod,
    pub query: Option<FinalizableQueryBuilder>,
    pub header: Option<FinalizableHeaderBuilder>,
    pub request_body: Option<BodyBuilder>,
    pub min_tick_interval: Option<Duration>,
    pub after_response: Option<AfterResponseHook>,
    pub response_parser: ResponseParser,
    /// Leave unset when the API filters by date itself (through `query`).
    pub get_created: Option<CreatedAtFn>,
    pub page_size: u32,
    pub concurrency: usize,
    pub get_next_page_custom_data: Option<NextPageFn>,
    pub get_total_pages: Option<TotalPagesFn>,
}

impl FinalizableListArgs {
    pub fn new(url_template: impl Into<String>, page_size: u32, response_parser: ResponseParser) -> Self {
        Self {
            url_template: url_template.into(),
            method: HttpMethod::Get,
            query: None,
            header: None,
            request_body: None,
            min_tick_interval: None,
            after_response: None,
            response_parser,
            get_created: None,
            page_size,
            concurrency: 0,
            get_next_page_custom_data: None,
            get_total_pages: None,
        }
    }
}

/// Phase 2: refresh unfinished records.
pub struct FinalizableDetailArgs {
    pub url_template: String,
    pub method: HttpMethod,
    pub query: Option<FinalizableQueryBuilder>,
    pub header: Option<FinalizableHeaderBuilder>,
    pub request_body: Option<BodyBuilder>,
    pub min_tick_interval: Option<Duration>,
    pub after_response: Option<AfterResponseHook>,
    pub response_parser: ResponseParser,
    /// Called once, when phase 2 starts.
    pub build_input_iterator: InputIteratorBuilder,
}

impl FinalizableDetailArgs {
    pub fn new(
        url_template: impl Into<String>,
        response_parser: ResponseParser,
        build_input_iterator: InputIteratorBuilder,
    ) -> Self {
        Self {
            url_template: url_template.into(),
            method: HttpMethod::Get,
            query: None,
            header: None,
            request_body: None,
            min_tick_interval: None,
            after_response: None,
            response_parser,
            build_input_iterator,
        }
    }
}

/// Two-phase stateful collector for finalizable entities.
pub struct FinalizableApiCollector {
    raw: RawDataSubTaskArgs,
    client: AsyncApiClient,
    list: FinalizableListArgs,
    detail: Option<FinalizableDetailArgs>,
    state: CollectorStateManager,
}

impl std::fmt::Debug for FinalizableApiCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizableApiCollector")
            .field("table", &self.raw.table)
            .field("list", &self.list.url_template)
            .field("detail", &self.detail.as_ref().map(|d| &d.url_template))
            .field("state", &self.state.decision())
            .finish_non_exhaustive()
    }
}

impl FinalizableApiCollector {
    pub async fn new(
        raw: RawDataSubTaskArgs,
        client: AsyncApiClient,
        list: FinalizableListArgs,
        detail: Option<FinalizableDetailArgs>,
    ) -> Result<Self> {
        let state = CollectorStateManager::new(&raw.ctx, &raw.table, &raw.params_string()).await?;
        Ok(Self {
            raw,
            client,
            list,
            detail,
            state,
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.state.is_incremental()
    }

    /// Created-after cutoff of phase 1.
    pub fn created_after(&self) -> Option<DateTime<Utc>> {
        self.state.since()
    }

    pub async fn execute(self) -> Result<()> {
        let incremental = self.state.is_incremental();
        let created_after = self.state.since();

        let list = self.list;
        let mut args = ApiCollectorArgs::new(
            self.raw.clone(),
            self.client.clone(),
            list.url_template,
            created_after_cutoff(list.response_parser, list.get_created, created_after),
        )
        .page_size(list.page_size)
        .concurrency(list.concurrency)
        .incremental(incremental);
        args.method = list.method;
        args.request_body = list.request_body;
        args.query = list.query.map(|q| bind_query(q, created_after));
        args.header = list.header.map(|h| bind_header(h, created_after));
        args.get_next_page_custom_data = list.get_next_page_custom_data;
        args.get_total_pages = list.get_total_pages;
        args.min_tick_interval = list.min_tick_interval;
        args.after_response = list.after_response;
        ApiCollector::new(args)?.execute().await?;

        match self.detail {
            Some(detail) if incremental => {
                tracing::info!(table = %self.raw.table, "Refreshing unfinished records");
                let input = (detail.build_input_iterator)().await?;
                let mut args = ApiCollectorArgs::new(
                    self.raw.clone(),
                    self.client.clone(),
                    detail.url_template,
                    detail.response_parser,
                )
                .page_size(0)
                .input(input)
                .incremental(true);
                args.method = detail.method;
                args.request_body = detail.request_body;
                args.query = detail.query.map(|q| bind_query(q, created_after));
                args.header = detail.header.map(|h| bind_header(h, created_after));
                args.min_tick_interval = detail.min_tick_interval;
                args.after_response = detail.after_response;
                ApiCollector::new(args)?.execute().await?;
            }
            Some(_) => {
                tracing::debug!(table = %self.raw.table, "Full collection, skipping detail refresh");
            }
            None => {}
        }

        self.state.close().await?;
        Ok(())
    }
}

fn bind_query(
    query: FinalizableQueryBuilder,
    created_after: Option<DateTime<Utc>>,
) -> crate::collector::api_collector::QueryBuilder {
    Arc::new(move |data| query(data, created_after))
}

fn bind_header(
    header: FinalizableHeaderBuilder,
    created_after: Option<DateTime<Utc>>,
) -> crate::collector::api_collector::HeaderBuilder {
    Arc::new(move |data| header(data, created_after))
}

/// Ends the listing at the first item created before `created_after`.
///
/// Items are expected newest first. A page whose first item is already too
/// old yields nothing; a page whose last item is too old is kept whole.
fn created_after_cutoff(
    parser: ResponseParser,
    get_created: Option<CreatedAtFn>,
    created_after: Option<DateTime<Utc>>,
) -> ResponseParser {
    let (Some(get_created), Some(created_after)) = (get_created, created_after) else {
        return parser;
    };
    Arc::new(move |response| {
        let page = parser(response)?;
        let (Some(first), Some(last)) = (page.items.first(), page.items.last()) else {
            return Ok(page);
        };
        if get_created(first)? < created_after {
            return Ok(ParsedPage::last(Vec::new()));
        }
        if get_created(last)? < created_after {
            return Ok(ParsedPage::last(page.items));
        }
        Ok(page)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use serde_json::json;

    use crate::client::ApiClient;
    use crate::collector::iterator::VecInputIterator;
    use crate::context::{Shutdown, TaskContext};
    use crate::dal::Filter;
    use crate::error::HarvestError;
    use crate::http::{HttpResponse, MockTransport};
    use crate::scheduler::WorkerScheduler;

    const BASE: &str = "https://api.example.com/";

    fn created() -> CreatedAtFn {
        Arc::new(|item| {
            item["created"]
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc))
                .ok_or_else(|| HarvestError::parse("missing created"))
        })
    }

    fn response(body: JsonValue) -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: body.to_string().into_bytes(),
            url: format!("{BASE}items"),
        }
    }

    #[test]
    fn cutoff_stops_at_older_items() {
        let after = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("date");
        let parser = created_after_cutoff(
            Arc::new(|r| ParsedPage::from_json(r, None)),
            Some(created()),
            Some(after),
        );

        let fresh = parser(&response(json!([
            {"created": "2024-07-02T00:00:00Z"},
            {"created": "2024-07-01T00:00:00Z"},
        ])))
        .expect("parse");
        assert_eq!(fresh.items.len(), 2);
        assert!(!fresh.finished);

        let boundary = parser(&response(json!([
            {"created": "2024-07-01T00:00:00Z"},
            {"created": "2024-05-01T00:00:00Z"},
        ])))
        .expect("parse");
        assert_eq!(boundary.items.len(), 2);
        assert!(boundary.finished);

        let stale = parser(&response(json!([{"created": "2024-05-01T00:00:00Z"}]))).expect("parse");
        assert!(stale.items.is_empty());
        assert!(stale.finished);
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn detail_phase_runs_only_incrementally() {
        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        let ctx = TaskContext::builder().database(db).build().expect("context");
        let transport = MockTransport::new();
        let list_url = format!("{BASE}items?page=1&per_page=2");
        transport.push_response(
            crate::http::HttpMethod::Get,
            list_url.clone(),
            200,
            r#"[{"id":1,"created":"2000-01-01T00:00:00Z"}]"#,
        );
        transport.push_response(
            crate::http::HttpMethod::Get,
            list_url,
            200,
            r#"[{"id":3,"created":"2999-01-01T00:00:00Z"},{"id":2,"created":"2000-01-01T00:00:00Z"}]"#,
        );
        transport.push_response(
            crate::http::HttpMethod::Get,
            format!("{BASE}items/1"),
            200,
            r#"{"id":1,"state":"closed"}"#,
        );

        let builds = Arc::new(AtomicUsize::new(0));
        let run = || {
            let ctx = ctx.clone();
            let transport = transport.clone();
            let builds = Arc::clone(&builds);
            async move {
                let raw = RawDataSubTaskArgs::new(ctx, "items", json!({"project": 1})).expect("raw");
                let api = ApiClient::new(BASE, Arc::new(transport)).expect("client");
                let client =
                    AsyncApiClient::from_parts(api, WorkerScheduler::new(2, None, Shutdown::new()), 0);

                let mut list = FinalizableListArgs::new(
                    "items",
                    2,
                    Arc::new(|r| ParsedPage::from_json(r, None)),
                );
                list.concurrency = 1;
                list.get_created = Some(created());
                list.query = Some(Arc::new(|data, _| {
                    Ok(vec![
                        ("page".to_string(), data.pager.page.to_string()),
                        ("per_page".to_string(), data.pager.size.to_string()),
                    ])
                }));
                let detail = FinalizableDetailArgs::new(
                    "items/{Input.id}",
                    Arc::new(|r| Ok(ParsedPage::new(vec![crate::client::unmarshal(r)?]))),
                    Box::new(move || {
                        builds.fetch_add(1, Ordering::SeqCst);
                        Box::pin(async {
                            Ok(Box::new(VecInputIterator::new([json!({"id": 1})]))
                                as Box<dyn InputIterator>)
                        })
                    }),
                );

                let collector = FinalizableApiCollector::new(raw, client, list, Some(detail))
                    .await
                    .expect("collector");
                let incremental = collector.is_incremental();
                collector.execute().await.expect("collect");
                incremental
            }
        };

        assert!(!run().await);
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        assert!(run().await);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let rows = ctx
            .dal()
            .count("_raw_items", &Filter::new())
            .await
            .expect("count");
        assert_eq!(rows, 4);
        assert_eq!(transport.count(&format!("{BASE}items/1")), 1);
    }
}
