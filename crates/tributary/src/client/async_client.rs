//! Rate-paced asynchronous REST client.
//!
//! Every request runs as a scheduler task. A transport failure or a status
//! of 400 and above is retried by resubmitting the request through the same
//! scheduler, so retries are paced like any other request. Errors raised by
//! the response handler or by the after-response hook are returned as is.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::BoxFuture;
use crate::client::api_client::{AfterResponse, AfterResponseHook, ApiClient, Query};
use crate::context::TaskContext;
use crate::error::{HarvestError, Result, short_error_message};
use crate::http::{HttpHeaders, HttpMethod, HttpResponse};
use crate::progress::{self, HarvestProgress, ProgressCallback};
use crate::rate_limit::RateLimitCalculator;
use crate::scheduler::WorkerScheduler;

/// Lowest status treated as a failed request.
pub const HTTP_MIN_STATUS_RETRY_CODE: u16 = 400;

/// Callback receiving a successful response.
pub type ResponseHandler =
    Box<dyn FnOnce(HttpResponse) -> BoxFuture<'static, Result<()>> + Send + 'static>;

/// A request submitted through [`AsyncApiClient::do_async`].
#[derive(Clone, Default)]
pub struct AsyncRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Query,
    pub headers: HttpHeaders,
    pub body: Option<JsonValue>,
    /// Overrides the client's after-response hook for this request.
    pub after_response: Option<AfterResponseHook>,
}

impl AsyncRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl std::fmt::Debug for AsyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

/// [`ApiClient`] wrapped with a rate-paced [`WorkerScheduler`].
///
/// Cheap to clone.
#[derive(Clone)]
pub struct AsyncApiClient {
    inner: Arc<AsyncInner>,
}

struct AsyncInner {
    client: ApiClient,
    scheduler: WorkerScheduler,
    max_retry: usize,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for AsyncApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncApiClient")
            .field("client", &self.inner.client)
            .field("scheduler", &self.inner.scheduler)
            .field("max_retry", &self.inner.max_retry)
            .finish()
    }
}

impl AsyncApiClient {
    /// Create an async client whose pace comes from `calculator`.
    ///
    /// Retry count, fallback budget and (when the client has none) the
    /// request timeout come from the context's `[api]` settings.
    pub async fn new(
        ctx: &TaskContext,
        client: ApiClient,
        calculator: Option<RateLimitCalculator>,
    ) -> Result<Self> {
        let api = &ctx.settings().api;
        let timeout = client.timeout().or_else(|| api.timeout());
        let client = client
            .with_timeout(timeout)
            .with_shutdown(ctx.shutdown().clone());

        let mut calculator = calculator.unwrap_or_default();
        calculator.global_rate_limit_per_hour = api.requests_per_hour;
        calculator.max_retry = api.retry;

        let budget = calculator.calculate(&client).await?;
        let workers = budget.workers();
        let tick_interval = budget.tick_interval()?;

        tracing::info!(
            endpoint = %client.endpoint(),
            workers,
            requests = budget.requests,
            per = ?budget.per,
            interval = ?tick_interval,
            "Creating scheduler for api"
        );

        let scheduler = WorkerScheduler::new(workers, Some(tick_interval), ctx.shutdown().clone());
        Ok(Self {
            inner: Arc::new(AsyncInner {
                client,
                scheduler,
                max_retry: api.retry,
                on_progress: ctx.progress_callback(),
            }),
        })
    }

    /// Assemble a client from an existing scheduler.
    pub fn from_parts(client: ApiClient, scheduler: WorkerScheduler, max_retry: usize) -> Self {
        Self {
            inner: Arc::new(AsyncInner {
                client,
                scheduler,
                max_retry,
                on_progress: None,
            }),
        }
    }

    /// Submit `request`; `handler` runs once with the successful response.
    ///
    /// # Errors
    /// Only submission failures are returned here. Request and handler
    /// failures surface from [`AsyncApiClient::wait`].
    pub fn do_async(&self, request: AsyncRequest, handler: ResponseHandler) -> Result<()> {
        let task = attempt(Arc::clone(&self.inner), request, handler, 0);
        self.inner.scheduler.submit(task)
    }

    pub fn get_async(
        &self,
        path: impl Into<String>,
        query: Query,
        headers: HttpHeaders,
        handler: ResponseHandler,
    ) -> Result<()> {
        self.do_async(
            AsyncRequest {
                method: HttpMethod::Get,
                path: path.into(),
                query,
                headers,
                ..AsyncRequest::default()
            },
            handler,
        )
    }

    pub fn post_async(
        &self,
        path: impl Into<String>,
        query: Query,
        body: JsonValue,
        headers: HttpHeaders,
        handler: ResponseHandler,
    ) -> Result<()> {
        self.do_async(
            AsyncRequest {
                method: HttpMethod::Post,
                path: path.into(),
                query,
                headers,
                body: Some(body),
                after_response: None,
            },
            handler,
        )
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

    pub fn release(&self) {
        self.inner.scheduler.release();
    }

    pub fn reset(&self, tick_interval: Option<Duration>) {
        self.inner.scheduler.reset(tick_interval);
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.inner.scheduler.tick_interval()
    }

    pub fn workers(&self) -> usize {
        self.inner.scheduler.workers()
    }

    pub fn max_retry(&self) -> usize {
        self.inner.max_retry
    }

    pub fn client(&self) -> &ApiClient {
        &self.inner.client
    }

    pub fn scheduler(&self) -> &WorkerScheduler {
        &self.inner.scheduler
    }
}

fn attempt(
    inner: Arc<AsyncInner>,
    request: AsyncRequest,
    handler: ResponseHandler,
    retry: usize,
) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let client = &inner.client;
        let url = client
            .resolve_url(&request.path, &request.query)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| request.path.clone());

        let sent = client
            .send(
                request.method,
                &request.path,
                &request.query,
                &request.headers,
                request.body.as_ref(),
            )
            .await;

        let failure = match sent {
            Ok(response) => {
                if client.apply_after_response(&response, request.after_response.as_ref())?
                    == AfterResponse::Ignore
                {
                    return Ok(());
                }
                if response.status < HTTP_MIN_STATUS_RETRY_CODE {
                    return handler(response).await;
                }
                HarvestError::HttpStatus {
                    status: response.status,
                    url: url.clone(),
                    body: response.text(),
                }
            }
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        if retry < inner.max_retry {
            let next = retry + 1;
            tracing::warn!(
                url = %url,
                attempt = next,
                max_retry = inner.max_retry,
                error = %short_error_message(&failure),
                "Retrying request"
            );
            progress::emit(
                inner.on_progress.as_deref(),
                HarvestProgress::RequestRetry {
                    url,
                    attempt: next,
                    max_retry: inner.max_retry,
                },
            );
            let scheduler = inner.scheduler.clone();
            return scheduler.submit(attempt(inner, request, handler, next));
        }

        tracing::error!(url = %url, retries = retry, "Retry exceeded");
        Err(HarvestError::RetryExceeded {
            retries: retry,
            url,
            source: Box::new(failure),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::context::Shutdown;
    use crate::http::MockTransport;

    const BASE: &str = "https://api.example.com/";

    fn async_client(transport: &MockTransport, max_retry: usize) -> AsyncApiClient {
        let client = ApiClient::new(BASE, Arc::new(transport.clone())).expect("client");
        let scheduler = WorkerScheduler::new(4, None, Shutdown::new());
        AsyncApiClient::from_parts(client, scheduler, max_retry)
    }

    fn collect_into(sink: &Arc<Mutex<Vec<String>>>) -> ResponseHandler {
        let sink = Arc::clone(sink);
        Box::new(move |response| {
            Box::pin(async move {
                sink.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(response.text());
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/items";
        transport.push_response(HttpMethod::Get, url, 502, "bad gateway");
        transport.push_error(HttpMethod::Get, url, "connection reset");
        transport.push_response(HttpMethod::Get, url, 200, "[1,2]");

        let client = async_client(&transport, 3);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        client
            .get_async("items", Vec::new(), Vec::new(), collect_into(&bodies))
            .expect("submit");
        client.wait().await.expect("eventually succeeds");

        assert_eq!(transport.count(url), 3);
        assert_eq!(*bodies.lock().unwrap_or_else(|e| e.into_inner()), vec!["[1,2]"]);
    }

    #[tokio::test]
    async fn gives_up_with_retry_exceeded() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/items";
        for _ in 0..3 {
            transport.push_response(HttpMethod::Get, url, 500, "boom");
        }

        let client = async_client(&transport, 2);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        client
            .get_async("items", Vec::new(), Vec::new(), collect_into(&bodies))
            .expect("submit");
        let err = client.wait().await.expect_err("retries exhausted");

        match err {
            HarvestError::RetryExceeded { retries, source, .. } => {
                assert_eq!(retries, 2);
                assert!(matches!(*source, HarvestError::HttpStatus { status: 500, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.count(url), 3);
        assert!(bodies.lock().unwrap_or_else(|e| e.into_inner()).is_empty());
        assert!(client.has_error());
    }

    #[tokio::test]
    async fn handler_errors_are_not_retried() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/items";
        transport.push_response(HttpMethod::Get, url, 200, "not json");

        let client = async_client(&transport, 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        client
            .get_async(
                "items",
                Vec::new(),
                Vec::new(),
                Box::new(move |_| {
                    Box::pin(async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Err(HarvestError::parse("bad payload"))
                    })
                }),
            )
            .expect("submit");

        let err = client.wait().await.expect_err("handler failure");
        assert!(matches!(err, HarvestError::Parse { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.count(url), 1);
    }

    #[tokio::test]
    async fn unauthorized_is_not_retried() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/private";
        transport.push_response(HttpMethod::Get, url, 401, "");

        let client = async_client(&transport, 3);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        client
            .get_async("private", Vec::new(), Vec::new(), collect_into(&bodies))
            .expect("submit");
        let err = client.wait().await.expect_err("unauthorized");
        assert!(err.is_unauthorized());
        assert_eq!(transport.count(url), 1);
    }

    #[tokio::test]
    async fn ignored_responses_skip_the_handler() {
        let transport = MockTransport::new();
        let url = "https://api.example.com/missing";
        transport.push_response(HttpMethod::Get, url, 404, "");

        let client = async_client(&transport, 3);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let request = AsyncRequest {
            after_response: Some(Arc::new(|resp: &HttpResponse| {
                Ok(if resp.status == 404 {
                    AfterResponse::Ignore
                } else {
                    AfterResponse::Continue
                })
            })),
            ..AsyncRequest::get("missing")
        };
        client
            .do_async(request, collect_into(&bodies))
            .expect("submit");
        client.wait().await.expect("ignored");
        assert!(bodies.lock().unwrap_or_else(|e| e.into_inner()).is_empty());
        assert_eq!(transport.count(url), 1);
    }

    #[tokio::test]
    async fn new_derives_pace_from_calculator_and_settings() {
        let db = sea_orm::MockDatabase::new(sea_orm::DatabaseBackend::Sqlite).into_connection();
        let ctx = TaskContext::builder()
            .database(db)
            .build()
            .expect("context");
        let client = ApiClient::new(BASE, Arc::new(MockTransport::new())).expect("client");

        let async_client = AsyncApiClient::new(&ctx, client, Some(RateLimitCalculator::fixed(3600)))
            .await
            .expect("async client");
        assert_eq!(async_client.tick_interval(), Some(Duration::from_secs(1)));
        assert_eq!(async_client.workers(), 5);
        assert_eq!(async_client.max_retry(), 3);
        assert_eq!(async_client.client().timeout(), Some(Duration::from_secs(120)));
    }
}
