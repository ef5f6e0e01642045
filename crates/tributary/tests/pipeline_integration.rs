//! End-to-end pipeline tests: collect → extract → convert.
//!
//! A hand-written transport serves a small paginated issues API so the whole
//! chain runs against a real in-memory SQLite database.
//!
//! Key scenarios tested:
//! - Every page is collected once and stored as one raw row per item
//! - Extracted and converted rows carry the lineage of their raw row
//! - Re-running the pipeline replaces rows instead of duplicating them

#![cfg(all(feature = "sqlite", feature = "migrate"))]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::ConnectionTrait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tributary::client::ApiClient;
use tributary::collector::api_collector::{QueryBuilder, TotalPagesFn};
use tributary::converter::ConvertFn;
use tributary::extractor::ExtractFn;
use tributary::http::{HttpError, HttpRequest};
use tributary::record::to_row;
use tributary::scheduler::WorkerScheduler;
use tributary::{
    ApiCollector, ApiCollectorArgs, ApiExtractor, ApiExtractorArgs, AsyncApiClient,
    DataConverter, DataConverterArgs, DomainIdGenerator, Filter, HttpResponse, HttpTransport,
    ParsedPage, RawDataOrigin, RawDataSubTaskArgs, Record, RecordShape, Row, RowQuery, Shutdown,
    TaskContext, connect_and_migrate,
};

/// If exceeded, a stage is most likely hung.
const STAGE_TIMEOUT: Duration = Duration::from_secs(10);

const ENDPOINT: &str = "https://tracker.example.com/api/";
const PAGE_SIZE: usize = 2;

/// Serves `GET issues?page=N&per_page=M` from a fixed list.
#[derive(Clone)]
struct IssueApi {
    issues: Arc<Vec<serde_json::Value>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl IssueApi {
    fn new(count: u64) -> Self {
        let issues = (1..=count)
            .map(|id| json!({"id": id, "title": format!("issue {id}"), "state": "open"}))
            .collect();
        Self {
            issues: Arc::new(issues),
            requests: Arc::default(),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl HttpTransport for IssueApi {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.url.clone());

        let url = url::Url::parse(&request.url).map_err(|e| HttpError::Transport(e.to_string()))?;
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.parse::<usize>().ok())
        };
        let page = param("page").unwrap_or(1).max(1);
        let per_page = param("per_page").unwrap_or(PAGE_SIZE).max(1);
        let total_pages = self.issues.len().div_ceil(per_page);

        let items: Vec<_> = self
            .issues
            .iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();
        let body = serde_json::to_vec(&items).map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(HttpResponse {
            status: 200,
            headers: vec![("X-Total-Pages".to_string(), total_pages.to_string())],
            body,
            url: request.url,
        })
    }
}

#[derive(Deserialize)]
struct ApiIssue {
    id: i64,
    title: String,
    state: String,
}

#[derive(Serialize, Deserialize)]
struct ToolIssue {
    id: i64,
    title: String,
    state: String,
    #[serde(flatten)]
    origin: RawDataOrigin,
}

tributary::impl_has_lineage!(ToolIssue, origin);

impl Record for ToolIssue {
    fn shape(&self) -> RecordShape {
        RecordShape::new("tool_issues", &["id"])
    }

    fn to_row(&self) -> tributary::Result<Row> {
        to_row(self)
    }
}

#[derive(Serialize)]
struct Issue {
    id: String,
    title: String,
    status: String,
    #[serde(flatten)]
    origin: RawDataOrigin,
}

tributary::impl_has_lineage!(Issue, origin);

impl Record for Issue {
    fn shape(&self) -> RecordShape {
        RecordShape::new("issues", &["id"])
    }

    fn to_row(&self) -> tributary::Result<Row> {
        to_row(self)
    }
}

const LINEAGE: &str =
    "_raw_data_table TEXT, _raw_data_id INTEGER, _raw_data_params TEXT, _raw_data_remark TEXT";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn setup() -> TaskContext {
    init_tracing();
    let db = connect_and_migrate("sqlite::memory:")
        .await
        .expect("connect");
    for sql in [
        format!("CREATE TABLE tool_issues (id INTEGER PRIMARY KEY, title TEXT, state TEXT, {LINEAGE})"),
        format!("CREATE TABLE issues (id TEXT PRIMARY KEY, title TEXT, status TEXT, {LINEAGE})"),
    ] {
        db.execute_unprepared(&sql).await.expect("create table");
    }
    TaskContext::builder()
        .database(db)
        .plugin("tracker")
        .build()
        .expect("context")
}

async fn collect(ctx: &TaskContext, api: &IssueApi) {
    let raw = RawDataSubTaskArgs::new(ctx.for_subtask("collect_issues"), "tracker_issues", json!({"project": 7}))
        .expect("raw args");
    let client = AsyncApiClient::from_parts(
        ApiClient::new(ENDPOINT, Arc::new(api.clone())).expect("api client"),
        WorkerScheduler::new(4, None, Shutdown::new()),
        1,
    );
    let query: QueryBuilder = Arc::new(|data| {
        Ok(vec![
            ("page".to_string(), data.pager.page.to_string()),
            ("per_page".to_string(), data.pager.size.to_string()),
        ])
    });
    let total_pages: TotalPagesFn = Arc::new(|response, _| {
        Ok(response
            .header("X-Total-Pages")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1))
    });
    let args = ApiCollectorArgs::new(raw, client, "issues", Arc::new(|r| ParsedPage::from_json(r, None)))
        .page_size(PAGE_SIZE as u32)
        .query(query)
        .total_pages(total_pages);

    let collector = ApiCollector::new(args).expect("collector");
    tokio::time::timeout(STAGE_TIMEOUT, collector.execute())
        .await
        .expect("collection timed out")
        .expect("collection");
}

async fn extract(ctx: &TaskContext) -> usize {
    let raw = RawDataSubTaskArgs::new(ctx.for_subtask("extract_issues"), "tracker_issues", json!({"project": 7}))
        .expect("raw args");
    let extract: ExtractFn = Arc::new(|raw| {
        let issue: ApiIssue = raw.decode()?;
        Ok(vec![Box::new(ToolIssue {
            id: issue.id,
            title: issue.title,
            state: issue.state,
            origin: RawDataOrigin::default(),
        }) as Box<dyn Record>])
    });
    let extractor = ApiExtractor::new(ApiExtractorArgs::new(raw, extract)).expect("extractor");
    tokio::time::timeout(STAGE_TIMEOUT, extractor.execute())
        .await
        .expect("extraction timed out")
        .expect("extraction")
        .rows_written
}

async fn convert(ctx: &TaskContext) -> usize {
    let raw = RawDataSubTaskArgs::new(ctx.for_subtask("convert_issues"), "tracker_issues", json!({"project": 7}))
        .expect("raw args");
    let input = RowQuery::new("tool_issues").filter(
        Filter::new()
            .eq("_raw_data_table", raw.table.clone())
            .eq("_raw_data_params", raw.params_string()),
    );
    let ids = DomainIdGenerator::new("tracker:ToolIssue");
    let convert: ConvertFn<ToolIssue> = Arc::new(move |issue| {
        Ok(vec![Box::new(Issue {
            id: ids.generate(&[&7, &issue.id]),
            title: issue.title.clone(),
            status: issue.state.to_uppercase(),
            origin: RawDataOrigin::default(),
        }) as Box<dyn Record>])
    });
    let converter = DataConverter::new(DataConverterArgs::new(raw, input, convert)).expect("converter");
    tokio::time::timeout(STAGE_TIMEOUT, converter.execute())
        .await
        .expect("conversion timed out")
        .expect("conversion")
        .rows_written
}

async fn count(ctx: &TaskContext, table: &str) -> u64 {
    ctx.dal().count(table, &Filter::new()).await.expect("count")
}

#[tokio::test]
async fn test_pipeline_collects_extracts_and_converts() {
    let ctx = setup().await;
    let api = IssueApi::new(5);

    collect(&ctx, &api).await;
    assert_eq!(api.request_count(), 3);
    assert_eq!(count(&ctx, "_raw_tracker_issues").await, 5);

    assert_eq!(extract(&ctx).await, 5);
    assert_eq!(convert(&ctx).await, 5);
    assert_eq!(count(&ctx, "issues").await, 5);

    let converted = ctx
        .dal()
        .count(
            "issues",
            &Filter::new()
                .eq("id", "tracker:ToolIssue:7:3")
                .eq("status", "OPEN")
                .eq("_raw_data_table", "_raw_tracker_issues")
                .eq("_raw_data_params", r#"{"project":7}"#),
        )
        .await
        .expect("count");
    assert_eq!(converted, 1);
}

#[tokio::test]
async fn test_pipeline_rerun_replaces_rows() {
    let ctx = setup().await;
    let api = IssueApi::new(5);

    for _ in 0..2 {
        collect(&ctx, &api).await;
        extract(&ctx).await;
        convert(&ctx).await;
    }

    assert_eq!(api.request_count(), 6);
    assert_eq!(count(&ctx, "_raw_tracker_issues").await, 5);
    assert_eq!(count(&ctx, "tool_issues").await, 5);
    assert_eq!(count(&ctx, "issues").await, 5);
}

#[tokio::test]
async fn test_pipeline_empty_api_writes_nothing() {
    let ctx = setup().await;
    let api = IssueApi::new(0);

    collect(&ctx, &api).await;
    assert_eq!(api.request_count(), 1);
    assert_eq!(extract(&ctx).await, 0);
    assert_eq!(convert(&ctx).await, 0);
    assert_eq!(count(&ctx, "issues").await, 0);
}
