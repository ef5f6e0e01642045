//! Paginated REST collection into a raw table.
//!
//! One fetch cycle runs per input item (or once without an iterator). The
//! pagination strategy is picked from the arguments:
//!
//! | arguments                   | strategy                                   |
//! |-----------------------------|--------------------------------------------|
//! | `page_size == 0`            | single request                             |
//! | `get_next_page_custom_data` | sequential, each page built from the last  |
//! | `get_total_pages`           | page 1 first, then pages `2..=T` at once   |
//! | neither                     | `concurrency` strided streams              |
//!
//! Every page's items are stored as raw rows. A non-incremental run first
//! deletes the raw rows of the same params.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::Notify;

use crate::client::{AfterResponseHook, AsyncApiClient, AsyncRequest, Query};
use crate::collector::iterator::InputIterator;
use crate::collector::raw::NewRawRecord;
use crate::collector::template::UrlTemplate;
use crate::collector::{Pager, ParsedPage, RawDataSubTaskArgs, RequestData};
use crate::context::{Shutdown, TaskContext};
use crate::dal::{Dal, Filter};
use crate::error::{HarvestError, Result};
use crate::http::{HttpHeaders, HttpMethod, HttpResponse};
use crate::progress::{HarvestProgress, UNKNOWN_TOTAL};
use crate::rate_limit::RateBudget;
use crate::scheduler::WorkerScheduler;

/// Builds the query string of a request.
pub type QueryBuilder = Arc<dyn Fn(&RequestData) -> Result<Query> + Send + Sync>;

/// Builds extra headers of a request.
pub type HeaderBuilder = Arc<dyn Fn(&RequestData) -> Result<HttpHeaders> + Send + Sync>;

/// Builds the JSON body of a request.
pub type BodyBuilder = Arc<dyn Fn(&RequestData) -> Result<JsonValue> + Send + Sync>;

/// Reads the total page count from the first page.
pub type TotalPagesFn = Arc<dyn Fn(&HttpResponse, &RequestData) -> Result<u32> + Send + Sync>;

/// Reads the custom data (e.g. a cursor) for the next page. `None`, `null`
/// or an empty string ends the collection.
pub type NextPageFn =
    Arc<dyn Fn(&RequestData, &HttpResponse) -> Result<Option<JsonValue>> + Send + Sync>;

/// Extracts the items of a response.
pub type ResponseParser = Arc<dyn Fn(&HttpResponse) -> Result<ParsedPage> + Send + Sync>;

/// Streams per input item when no concurrency is given.
pub const DEFAULT_INPUT_STREAMS: usize = 2;

/// Lower bound of the default stream count without an input iterator.
pub const MIN_DEFAULT_STREAMS: usize = 10;

/// Arguments of an [`ApiCollector`].
pub struct ApiCollectorArgs {
    pub raw: RawDataSubTaskArgs,
    pub client: AsyncApiClient,
    /// Request path, e.g. `repos/{Params.owner}/{Params.repo}/issues`.
    pub url_template: String,
    pub query: Option<QueryBuilder>,
    pub header: Option<HeaderBuilder>,
    pub method: HttpMethod,
    pub request_body: Option<BodyBuilder>,
    /// Items per page; `0` disables pagination.
    pub page_size: u32,
    pub get_total_pages: Option<TotalPagesFn>,
    pub get_next_page_custom_data: Option<NextPageFn>,
    /// Strided streams for the undetermined strategy; `0` picks a default.
    pub concurrency: usize,
    pub input: Option<Box<dyn InputIterator>>,
    /// Pace of input cycles.
    pub input_rate_limit: Option<RateBudget>,
    /// Input cycles in flight; `0` uses the client's worker count.
    pub input_concurrency: usize,
    /// Log and skip items whose responses fail to parse.
    pub isolate_input_failures: bool,
    /// Keep existing raw rows of the same params.
    pub incremental: bool,
    /// Slow the client down to at most one request per interval while
    /// this collector runs.
    pub min_tick_interval: Option<Duration>,
    pub response_parser: ResponseParser,
    /// Overrides the client's after-response hook for this collector.
    pub after_response: Option<AfterResponseHook>,
}

impl std::fmt::Debug for ApiCollectorArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCollectorArgs")
            .field("table", &self.raw.table)
            .field("url_template", &self.url_template)
            .field("method", &self.method)
            .field("page_size", &self.page_size)
            .field("concurrency", &self.concurrency)
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl ApiCollectorArgs {
    pub fn new(
        raw: RawDataSubTaskArgs,
        client: AsyncApiClient,
        url_template: impl Into<String>,
        response_parser: ResponseParser,
    ) -> Self {
        let page_size = raw.ctx.settings().collector.page_size;
        Self {
            raw,
            client,
            url_template: url_template.into(),
            query: None,
            header: None,
            method: HttpMethod::Get,
            request_body: None,
            page_size,
            get_total_pages: None,
            get_next_page_custom_data: None,
            concurrency: 0,
            input: None,
            input_rate_limit: None,
            input_concurrency: 0,
            isolate_input_failures: false,
            incremental: false,
            min_tick_interval: None,
            response_parser,
            after_response: None,
        }
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn query(mut self, query: QueryBuilder) -> Self {
        self.query = Some(query);
        self
    }

    #[must_use]
    pub fn header(mut self, header: HeaderBuilder) -> Self {
        self.header = Some(header);
        self
    }

    #[must_use]
    pub fn post(mut self, body: BodyBuilder) -> Self {
        self.method = HttpMethod::Post;
        self.request_body = Some(body);
        self
    }

    #[must_use]
    pub fn total_pages(mut self, f: TotalPagesFn) -> Self {
        self.get_total_pages = Some(f);
        self
    }

    #[must_use]
    pub fn next_page(mut self, f: NextPageFn) -> Self {
        self.get_next_page_custom_data = Some(f);
        self
    }

    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn input(mut self, input: Box<dyn InputIterator>) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn input_rate_limit(mut self, budget: RateBudget, concurrency: usize) -> Self {
        self.input_rate_limit = Some(budget);
        self.input_concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn isolate_input_failures(mut self, isolate: bool) -> Self {
        self.isolate_input_failures = isolate;
        self
    }

    #[must_use]
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    #[must_use]
    pub fn min_tick_interval(mut self, interval: Duration) -> Self {
        self.min_tick_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn after_response(mut self, hook: AfterResponseHook) -> Self {
        self.after_response = Some(hook);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FollowUp {
    None,
    Determined,
    Sequential,
    Undetermined(u32),
}

/// Outstanding pages of one fetch cycle.
#[derive(Default)]
struct Cycle {
    pending: AtomicUsize,
    idle: Notify,
}

struct CycleGuard(Arc<Cycle>);

impl Cycle {
    fn enter(self: &Arc<Self>) -> CycleGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        CycleGuard(Arc::clone(self))
    }

    async fn idle(&self, shutdown: &Shutdown) -> Result<()> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.requested() => return Err(HarvestError::Cancelled),
            }
        }
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Shared {
    ctx: TaskContext,
    dal: Dal,
    client: AsyncApiClient,
    table: String,
    params: JsonValue,
    params_string: String,
    template: UrlTemplate,
    query: Option<QueryBuilder>,
    header: Option<HeaderBuilder>,
    method: HttpMethod,
    request_body: Option<BodyBuilder>,
    page_size: u32,
    get_total_pages: Option<TotalPagesFn>,
    get_next_page_custom_data: Option<NextPageFn>,
    streams: u32,
    has_input: bool,
    isolate_input_failures: bool,
    response_parser: ResponseParser,
    after_response: Option<AfterResponseHook>,
}

/// Collects paginated API responses into a raw table.
pub struct ApiCollector {
    shared: Arc<Shared>,
    input: Option<Box<dyn InputIterator>>,
    input_rate_limit: Option<RateBudget>,
    input_concurrency: usize,
    incremental: bool,
    min_tick_interval: Option<Duration>,
}

impl std::fmt::Debug for ApiCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCollector")
            .field("table", &self.shared.table)
            .field("params", &self.shared.params_string)
            .field("url_template", &self.shared.template.as_str())
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl ApiCollector {
    /// # Errors
    /// Fails on an empty or malformed URL template (a POST collector may
    /// leave the template empty and post to the endpoint itself).
    pub fn new(args: ApiCollectorArgs) -> Result<Self> {
        if args.url_template.is_empty() && args.method == HttpMethod::Get {
            return Err(HarvestError::config("url template is required"));
        }
        let template = UrlTemplate::parse(&args.url_template)?;

        let has_input = args.input.is_some();
        let streams = match args.concurrency {
            0 if has_input => DEFAULT_INPUT_STREAMS,
            0 => (args.client.workers() / 10).max(MIN_DEFAULT_STREAMS),
            n => n,
        };
        let streams = u32::try_from(streams)
            .map_err(|_| HarvestError::config(format!("concurrency {streams} is too large")))?;

        let input_concurrency = match args.input_concurrency {
            0 => args.client.workers(),
            n => n,
        };

        let params_string = args.raw.params_string();
        Ok(Self {
            shared: Arc::new(Shared {
                dal: args.raw.ctx.dal().clone(),
                ctx: args.raw.ctx,
                client: args.client,
                table: args.raw.table,
                params: args.raw.params,
                params_string,
                template,
                query: args.query,
                header: args.header,
                method: args.method,
                request_body: args.request_body,
                page_size: args.page_size,
                get_total_pages: args.get_total_pages,
                get_next_page_custom_data: args.get_next_page_custom_data,
                streams,
                has_input,
                isolate_input_failures: args.isolate_input_failures,
                response_parser: args.response_parser,
                after_response: args.after_response,
            }),
            input: args.input,
            input_rate_limit: args.input_rate_limit,
            input_concurrency,
            incremental: args.incremental,
            min_tick_interval: args.min_tick_interval,
        })
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Run the collection and wait for every page.
    pub async fn execute(mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        tracing::info!(
            table = %shared.table,
            params = %shared.params_string,
            incremental = self.incremental,
            "Start api collection"
        );

        shared.dal.ensure_raw_table(&shared.table).await?;
        if !self.incremental {
            let deleted = shared
                .dal
                .delete(
                    &shared.table,
                    &Filter::new().eq("params", shared.params_string.clone()),
                )
                .await?;
            tracing::debug!(table = %shared.table, deleted, "Deleted previously collected raw rows");
        }

        let restore = self.raise_tick_interval()?;
        shared.ctx.set_progress(0, UNKNOWN_TOTAL);

        let launched = self.launch().await;
        tracing::debug!(table = %shared.table, "Waiting for async requests to finish");
        let waited = shared.client.wait().await;

        if let Some(old) = restore {
            tracing::info!(interval = ?old, "Restoring tick interval");
            shared.client.reset(old);
        }

        let result = launched.and(waited);
        match &result {
            Ok(()) => tracing::info!(table = %shared.table, "End api collection without error"),
            Err(e) => tracing::error!(table = %shared.table, error = %e, "End api collection with error"),
        }
        result
    }

    /// Returns the interval to restore when the client was slowed down.
    fn raise_tick_interval(&self) -> Result<Option<Option<Duration>>> {
        let Some(min) = self.min_tick_interval else {
            return Ok(None);
        };
        if min.is_zero() {
            return Err(HarvestError::config("min tick interval must be positive"));
        }
        let old = self.shared.client.tick_interval();
        if old.is_some_and(|old| old >= min) {
            return Ok(None);
        }
        tracing::info!(interval = ?min, "Raising tick interval");
        self.shared.client.reset(Some(min));
        Ok(Some(old))
    }

    async fn launch(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let Some(mut input) = self.input.take() else {
            return shared.exec(JsonValue::Null, &Arc::new(Cycle::default()));
        };

        let shutdown = shared.ctx.shutdown().clone();
        let tick = self
            .input_rate_limit
            .as_ref()
            .map(RateBudget::tick_interval)
            .transpose()?;
        let scheduler = WorkerScheduler::new(self.input_concurrency, tick, shutdown.clone());

        let mut fed = Ok(());
        loop {
            if let Err(e) = shutdown.check() {
                fed = Err(e);
                break;
            }
            if shared.client.has_error() {
                tracing::debug!(table = %shared.table, "Api client failed, no more inputs");
                break;
            }
            let item = match input.next_input().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    fed = Err(e);
                    break;
                }
            };

            let cycle_shared = Arc::clone(&shared);
            let submitted = scheduler.submit(async move {
                let cycle = Arc::new(Cycle::default());
                cycle_shared.exec(item, &cycle)?;
                cycle.idle(cycle_shared.ctx.shutdown()).await
            });
            if let Err(e) = submitted {
                fed = Err(e);
                break;
            }
        }

        let cycles = scheduler.wait().await;
        let closed = input.close().await;
        fed.and(cycles).and(closed)
    }
}

impl Shared {
    /// Start one fetch cycle.
    fn exec(self: &Arc<Self>, input: JsonValue, cycle: &Arc<Cycle>) -> Result<()> {
        let data = RequestData {
            pager: Pager::first(self.page_size),
            params: self.params.clone(),
            input,
            custom_data: JsonValue::Null,
        };

        if self.page_size == 0 {
            self.fetch(data, FollowUp::None, cycle)
        } else if self.get_next_page_custom_data.is_some() {
            self.fetch(data, FollowUp::Sequential, cycle)
        } else if self.get_total_pages.is_some() {
            self.fetch(data, FollowUp::Determined, cycle)
        } else {
            for stream in 0..self.streams {
                let mut stream_data = data.clone();
                stream_data.pager = data.pager.advance(stream);
                self.fetch(stream_data, FollowUp::Undetermined(self.streams), cycle)?;
            }
            Ok(())
        }
    }

    /// Enqueue one page request.
    fn fetch(self: &Arc<Self>, data: RequestData, follow: FollowUp, cycle: &Arc<Cycle>) -> Result<()> {
        let path = self.template.render(&data.template_context())?;
        let query = match &self.query {
            Some(build) => build(&data)?,
            None => Query::new(),
        };
        let headers = match &self.header {
            Some(build) => build(&data)?,
            None => HttpHeaders::new(),
        };
        let body = self.request_body.as_ref().map(|build| build(&data)).transpose()?;

        tracing::debug!(path = %path, page = data.pager.page, "Enqueueing page");
        let request = AsyncRequest {
            method: self.method,
            path,
            query,
            headers,
            body,
            after_response: self.after_response.clone(),
        };

        let shared = Arc::clone(self);
        let guard = cycle.enter();
        let cycle = Arc::clone(cycle);
        self.client.do_async(
            request,
            Box::new(move |response| {
                Box::pin(async move {
                    let _guard = guard;
                    shared.handle_page(data, response, follow, cycle).await
                })
            }),
        )
    }

    async fn handle_page(
        self: Arc<Self>,
        data: RequestData,
        response: HttpResponse,
        follow: FollowUp,
        cycle: Arc<Cycle>,
    ) -> Result<()> {
        match self.store_page(&data, &response, follow, &cycle).await {
            Err(e) if self.isolate_input_failures && self.has_input && is_item_failure(&e) => {
                tracing::warn!(
                    url = %response.url,
                    input = %data.input,
                    error = %e,
                    "Skipping input whose response failed to parse"
                );
                self.ctx.emit(HarvestProgress::Warning {
                    message: format!("skipped input {}: {e}", data.input),
                });
                Ok(())
            }
            other => other,
        }
    }

    async fn store_page(
        self: &Arc<Self>,
        data: &RequestData,
        response: &HttpResponse,
        follow: FollowUp,
        cycle: &Arc<Cycle>,
    ) -> Result<()> {
        self.ctx.shutdown().check()?;

        let page = (self.response_parser)(response)?;
        let count = page.items.len();
        if count > 0 {
            let input = data.input_json()?;
            let records = page
                .items
                .iter()
                .map(|item| {
                    Ok(NewRawRecord::new(
                        &self.params_string,
                        serde_json::to_vec(item)?,
                        &response.url,
                        input.as_deref(),
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            self.dal.insert_raw(&self.table, records).await?;
            self.ctx.emit(HarvestProgress::RawPersisted {
                table: self.table.clone(),
                count,
            });
            tracing::debug!(url = %response.url, count, "Saved raw rows");
        }
        self.ctx.inc_progress(1);

        if page.finished {
            tracing::info!(url = %response.url, "Collection stopped by response parser");
            return Ok(());
        }
        if count == 0 {
            return Ok(());
        }

        match follow {
            FollowUp::None => Ok(()),
            FollowUp::Determined => {
                let Some(total_pages) = &self.get_total_pages else {
                    return Ok(());
                };
                let total = total_pages(response, data)?;
                if !self.has_input {
                    self.ctx.set_progress_total(i64::from(total));
                }
                if total < 2 {
                    return Ok(());
                }
                let shared = Arc::clone(self);
                let first = data.clone();
                let guard = cycle.enter();
                let cycle = Arc::clone(cycle);
                self.client.next_tick(async move {
                    let _guard = guard;
                    for page in 2..=total {
                        shared.ctx.shutdown().check()?;
                        let mut page_data = first.clone();
                        page_data.pager = first.pager.at(page);
                        shared.fetch(page_data, FollowUp::None, &cycle)?;
                    }
                    Ok(())
                })
            }
            FollowUp::Sequential => {
                if count < self.page_size as usize {
                    return Ok(());
                }
                let Some(next_page) = &self.get_next_page_custom_data else {
                    return Ok(());
                };
                let custom = match next_page(data, response)? {
                    None | Some(JsonValue::Null) => return Ok(()),
                    Some(JsonValue::String(s)) if s.is_empty() => return Ok(()),
                    Some(custom) => custom,
                };
                let mut next = data.clone();
                next.custom_data = custom;
                next.pager = data.pager.advance(1);
                self.follow_with(next, follow, cycle)
            }
            FollowUp::Undetermined(streams) => {
                if count < self.page_size as usize {
                    return Ok(());
                }
                let mut next = data.clone();
                next.pager = data.pager.advance(streams);
                self.follow_with(next, follow, cycle)
            }
        }
    }

    /// Enqueue the next page of a chain from a fresh task.
    fn follow_with(self: &Arc<Self>, next: RequestData, follow: FollowUp, cycle: &Arc<Cycle>) -> Result<()> {
        let shared = Arc::clone(self);
        let guard = cycle.enter();
        let cycle = Arc::clone(cycle);
        self.client.next_tick(async move {
            let _guard = guard;
            shared.fetch(next, follow, &cycle)
        })
    }
}

/// Failures confined to one input item.
fn is_item_failure(e: &HarvestError) -> bool {
    matches!(
        e,
        HarvestError::Parse { .. } | HarvestError::EmptyResponse { .. } | HarvestError::Serialization(_)
    )
}
