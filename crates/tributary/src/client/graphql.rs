//! GraphQL clients.
//!
//! [`GraphqlClient`] sends one query at a time. [`GraphqlAsyncClient`] adds
//! flow control: a shared "rate remaining" counter gates every query, queries
//! run one at a time, and an optional background task re-reads the quota at
//! the provider's reset time (or every [`RATE_REFRESH_INTERVAL`]).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::BoxFuture;
use crate::client::api_client::ApiClient;
use crate::context::{Shutdown, TaskContext};
use crate::error::{HarvestError, Result};
use crate::http::HttpMethod;
use crate::progress::ProgressCallback;
use crate::retry::{RetryConfig, with_retry};
use crate::scheduler::WorkerScheduler;

/// Quota assumed when no quota check is supplied.
pub const DEFAULT_RATE_REMAINING: i64 = 5000;

/// Quota refresh interval when the provider gives no reset time.
pub const RATE_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

/// Workers for continuation tasks.
pub const DEFAULT_GRAPHQL_WORKERS: usize = 10;

/// One entry of a GraphQL `errors` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlDataError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<JsonValue>,
}

impl std::fmt::Display for GraphqlDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A decoded GraphQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: JsonValue,
    #[serde(default)]
    pub errors: Vec<GraphqlDataError>,
}

/// Remaining quota reported by a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRemaining {
    pub remaining: i64,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Plugin check for the remaining quota.
pub type RateCheck =
    Arc<dyn Fn(Arc<GraphqlClient>) -> BoxFuture<'static, Result<RateRemaining>> + Send + Sync>;

/// Plugin function computing the quota cost of a response.
pub type QueryCost = Arc<dyn Fn(&GraphqlResponse) -> i64 + Send + Sync>;

/// Sends GraphQL queries over an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    api: ApiClient,
    path: String,
}

impl GraphqlClient {
    /// Client posting to the API client's endpoint itself.
    pub fn new(api: ApiClient) -> Self {
        Self::with_path(api, "")
    }

    /// Client posting to `path` below the endpoint, e.g. `graphql`.
    pub fn with_path(api: ApiClient, path: impl Into<String>) -> Self {
        Self {
            api,
            path: path.into(),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Send `{query, variables}` and decode `{data, errors}`.
    ///
    /// Data errors are returned inside the response, not as `Err`.
    pub async fn query(&self, query: &str, variables: &JsonValue) -> Result<GraphqlResponse> {
        let body = json!({ "query": query, "variables": variables });
        let Some(response) = self
            .api
            .request(HttpMethod::Post, &self.path, &[], &[], Some(&body))
            .await?
        else {
            return Ok(GraphqlResponse::default());
        };

        if !response.is_success() {
            return Err(HarvestError::HttpStatus {
                status: response.status,
                url: response.url.clone(),
                body: response.text(),
            });
        }
        crate::client::api_client::unmarshal(&response)
    }
}

// ─── Rate gate ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct RateGate {
    remaining: Mutex<i64>,
    notify: Notify,
}

impl RateGate {
    fn new(remaining: i64) -> Self {
        Self {
            remaining: Mutex::new(remaining),
            notify: Notify::new(),
        }
    }

    fn remaining(&self) -> i64 {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, remaining: i64) {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner()) = remaining;
        self.notify.notify_waiters();
    }

    fn consume(&self, cost: i64) {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner()) -= cost;
    }

    /// Wait until quota is available or shutdown is requested.
    async fn acquire(&self, shutdown: &Shutdown) -> Result<()> {
        let mut logged = false;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.remaining() > 0 {
                return Ok(());
            }
            shutdown.check()?;
            if !logged {
                tracing::info!("GraphQL rate limit exhausted, waiting for quota refresh");
                logged = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.requested() => return Err(HarvestError::Cancelled),
            }
        }
    }
}

// ─── Async client ───────────────────────────────────────────────────────────

/// Rate-gated GraphQL client.
///
/// Cheap to clone. The background refresher stops on shutdown, on
/// [`GraphqlAsyncClient::release`], or when the last clone is dropped.
#[derive(Clone)]
pub struct GraphqlAsyncClient {
    inner: Arc<GraphqlInner>,
}

struct GraphqlInner {
    client: Arc<GraphqlClient>,
    scheduler: WorkerScheduler,
    gate: Arc<RateGate>,
    query_lock: tokio::sync::Mutex<()>,
    max_retry: usize,
    query_cost: Option<QueryCost>,
    shutdown: Shutdown,
    on_progress: Option<Arc<ProgressCallback>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for GraphqlInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .refresher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for GraphqlAsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlAsyncClient")
            .field("client", &self.inner.client)
            .field("remaining", &self.inner.gate.remaining())
            .field("max_retry", &self.inner.max_retry)
            .finish_non_exhaustive()
    }
}

impl GraphqlAsyncClient {
    /// Create the client and, when `quota_check` is given, read the initial quota
    /// and start the background refresher.
    pub async fn new(
        ctx: &TaskContext,
        client: GraphqlClient,
        quota_check: Option<RateCheck>,
    ) -> Result<Self> {
        let shutdown = ctx.shutdown().clone();
        let api = client.api.clone().with_shutdown(shutdown.clone());
        let api = match api.timeout() {
            Some(_) => api,
            None => api.with_timeout(ctx.settings().api.timeout()),
        };
        let client = Arc::new(GraphqlClient {
            api,
            path: client.path,
        });

        let initial = match &quota_check {
            Some(quota_check) => quota_check(Arc::clone(&client)).await?,
            None => RateRemaining {
                remaining: DEFAULT_RATE_REMAINING,
                reset_at: None,
            },
        };
        tracing::info!(
            remaining = initial.remaining,
            reset_at = ?initial.reset_at,
            "GraphQL rate limit"
        );

        let gate = Arc::new(RateGate::new(initial.remaining));
        let refresher = quota_check.map(|quota_check| {
            tokio::spawn(refresh_loop(
                quota_check,
                Arc::clone(&client),
                Arc::clone(&gate),
                shutdown.clone(),
                initial.reset_at,
            ))
        });

        let workers = ctx
            .settings()
            .collector
            .concurrency
            .unwrap_or(DEFAULT_GRAPHQL_WORKERS);
        Ok(Self {
            inner: Arc::new(GraphqlInner {
                client,
                scheduler: WorkerScheduler::new(workers, None, shutdown.clone()),
                gate,
                query_lock: tokio::sync::Mutex::new(()),
                max_retry: ctx.settings().api.retry,
                query_cost: None,
                shutdown,
                on_progress: ctx.progress_callback(),
                refresher: Mutex::new(refresher),
            }),
        })
    }

    /// Set the quota cost function. Must be called before the client is cloned.
    ///
    /// # Errors
    /// Returns [`HarvestError::Internal`] when the client is already shared.
    pub fn set_query_cost(&mut self, cost: QueryCost) -> Result<()> {
        let inner = Arc::get_mut(&mut self.inner)
            .ok_or_else(|| HarvestError::internal("query cost must be set before sharing the client"))?;
        inner.query_cost = Some(cost);
        Ok(())
    }

    /// Run a query once quota is available.
    ///
    /// Queries are serialized, and a query waiting for quota holds the
    /// others back. Transport and HTTP status failures are retried
    /// up to the configured retry count.
    pub async fn query(&self, query: &str, variables: &JsonValue) -> Result<GraphqlResponse> {
        let inner = &self.inner;
        // The quota check and the decrement happen under the same lock.
        let _guard = tokio::select! {
            guard = inner.query_lock.lock() => guard,
            _ = inner.shutdown.requested() => return Err(HarvestError::Cancelled),
        };
        inner.gate.acquire(&inner.shutdown).await?;

        let response = with_retry(
            || inner.client.query(query, variables),
            RetryConfig::with_max_retries(inner.max_retry),
            inner.client.api.endpoint().as_str(),
            inner.on_progress.as_deref(),
        )
        .await?;

        let cost = inner.query_cost.as_ref().map_or(1, |f| f(&response));
        inner.gate.consume(cost);
        Ok(response)
    }

    /// Quota left before queries start waiting.
    pub fn rate_remaining(&self) -> i64 {
        self.inner.gate.remaining()
    }

    /// Overwrite the remaining quota and wake waiting queries.
    pub fn set_rate_remaining(&self, remaining: i64) {
        self.inner.gate.set(remaining);
    }

    pub fn next_tick<F>(&self, task: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.scheduler.next_tick(task)
    }

    pub async fn wait(&self) -> Result<()> {
        self.inner.scheduler.wait().await
    }

    pub fn has_error(&self) -> bool {
        self.inner.scheduler.has_error()
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.inner.shutdown
    }

    pub fn client(&self) -> &GraphqlClient {
        &self.inner.client
    }

    /// Stop the refresher and reject further continuations.
    pub fn release(&self) {
        if let Some(handle) = self
            .inner
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.inner.scheduler.release();
    }
}

async fn refresh_loop(
    quota_check: RateCheck,
    client: Arc<GraphqlClient>,
    gate: Arc<RateGate>,
    shutdown: Shutdown,
    mut reset_at: Option<DateTime<Utc>>,
) {
    loop {
        let delay = reset_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|d| !d.is_zero())
            .unwrap_or(RATE_REFRESH_INTERVAL);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.requested() => break,
        }

        match quota_check(Arc::clone(&client)).await {
            Ok(rate) => {
                tracing::info!(
                    remaining = rate.remaining,
                    reset_at = ?rate.reset_at,
                    "GraphQL rate limit refreshed"
                );
                gate.set(rate.remaining);
                reset_at = rate.reset_at;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to refresh GraphQL rate limit");
                reset_at = None;
            }
        }
    }
    tracing::debug!("GraphQL rate refresher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sea_orm::{DatabaseBackend, MockDatabase};

    use crate::http::MockTransport;

    const ENDPOINT: &str = "https://api.example.com/graphql";

    fn ctx() -> TaskContext {
        TaskContext::builder()
            .database(MockDatabase::new(DatabaseBackend::Sqlite).into_connection())
            .build()
            .expect("context")
    }

    fn graphql(transport: &MockTransport) -> GraphqlClient {
        GraphqlClient::new(ApiClient::new(ENDPOINT, Arc::new(transport.clone())).expect("client"))
    }

    fn push_ok(transport: &MockTransport, body: &str) {
        transport.push_response(HttpMethod::Post, "https://api.example.com/graphql/", 200, body);
    }

    #[tokio::test]
    async fn query_posts_query_and_variables() {
        let transport = MockTransport::new();
        push_ok(
            &transport,
            r#"{"data":{"repository":{"id":"R_1"}},"errors":[{"message":"partial","path":["x"]}]}"#,
        );

        let response = graphql(&transport)
            .query("query { repository { id } }", &json!({"owner": "a"}))
            .await
            .expect("response");
        assert_eq!(response.data["repository"]["id"], "R_1");
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].to_string(), "partial");

        let sent: JsonValue =
            serde_json::from_slice(&transport.requests()[0].body).expect("json body");
        assert_eq!(sent["query"], "query { repository { id } }");
        assert_eq!(sent["variables"]["owner"], "a");
    }

    #[tokio::test]
    async fn async_query_consumes_default_cost() {
        let transport = MockTransport::new();
        push_ok(&transport, r#"{"data":{}}"#);
        push_ok(&transport, r#"{"data":{}}"#);

        let mut client = GraphqlAsyncClient::new(&ctx(), graphql(&transport), None)
            .await
            .expect("client");
        assert_eq!(client.rate_remaining(), DEFAULT_RATE_REMAINING);

        client.query("{a}", &JsonValue::Null).await.expect("first");
        assert_eq!(client.rate_remaining(), DEFAULT_RATE_REMAINING - 1);

        client
            .set_query_cost(Arc::new(|_| 10))
            .expect("not shared yet");
        client.query("{a}", &JsonValue::Null).await.expect("second");
        assert_eq!(client.rate_remaining(), DEFAULT_RATE_REMAINING - 11);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_waits_for_refresh() {
        let transport = MockTransport::new();
        push_ok(&transport, r#"{"data":{"ok":true}}"#);

        let checks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&checks);
        let quota_check: RateCheck = Arc::new(move |_client| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Ok(RateRemaining {
                    remaining: if n == 0 { 0 } else { 100 },
                    reset_at: None,
                })
            })
        });

        let client = GraphqlAsyncClient::new(&ctx(), graphql(&transport), Some(quota_check))
            .await
            .expect("client");
        assert_eq!(client.rate_remaining(), 0);

        let response = client.query("{ok}", &JsonValue::Null).await.expect("query");
        assert_eq!(response.data["ok"], true);
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert_eq!(client.rate_remaining(), 99);
        client.release();
    }

    #[tokio::test]
    async fn waiting_query_is_cancelled_by_shutdown() {
        let transport = MockTransport::new();
        let shutdown = Shutdown::new();
        let ctx = TaskContext::builder()
            .database(MockDatabase::new(DatabaseBackend::Sqlite).into_connection())
            .shutdown(shutdown.clone())
            .build()
            .expect("context");

        let client = GraphqlAsyncClient::new(&ctx, graphql(&transport), None)
            .await
            .expect("client");
        client.set_rate_remaining(0);

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.query("{a}", &JsonValue::Null).await })
        };
        tokio::task::yield_now().await;
        shutdown.request();

        let err = waiter
            .await
            .expect("join")
            .expect_err("cancelled while waiting");
        assert!(err.is_cancelled());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn contending_queries_never_overdraw_quota() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            push_ok(&transport, r#"{"data":{}}"#);
        }
        let shutdown = Shutdown::new();
        let ctx = TaskContext::builder()
            .database(MockDatabase::new(DatabaseBackend::Sqlite).into_connection())
            .shutdown(shutdown.clone())
            .build()
            .expect("context");

        let client = GraphqlAsyncClient::new(&ctx, graphql(&transport), None)
            .await
            .expect("client");
        client.set_rate_remaining(1);

        let held = client.inner.query_lock.lock().await;
        let queries: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.query("{a}", &JsonValue::Null).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queries.iter().filter(|q| q.is_finished()).count(), 1);
        assert_eq!(client.rate_remaining(), 0);
        assert_eq!(transport.requests().len(), 1);

        shutdown.request();
        let mut completed = 0;
        for query in queries {
            match query.await.expect("join") {
                Ok(_) => completed += 1,
                Err(e) => assert!(e.is_cancelled()),
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(client.rate_remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/graphql/";
        transport.push_response(HttpMethod::Post, url, 502, "bad gateway");
        push_ok(&transport, r#"{"data":{"n":1}}"#);

        let client = GraphqlAsyncClient::new(&ctx(), graphql(&transport), None)
            .await
            .expect("client");
        let response = client.query("{n}", &JsonValue::Null).await.expect("retried");
        assert_eq!(response.data["n"], 1);
        assert_eq!(transport.count(url), 2);
    }
}
