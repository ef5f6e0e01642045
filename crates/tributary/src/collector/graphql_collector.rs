//! Cursor-paginated GraphQL collection into a raw table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::BoxFuture;
use crate::client::{GraphqlAsyncClient, GraphqlResponse};
use crate::collector::iterator::InputIterator;
use crate::collector::raw::NewRawRecord;
use crate::collector::{ParsedPage, RawDataSubTaskArgs};
use crate::context::TaskContext;
use crate::dal::{Dal, Filter};
use crate::error::{HarvestError, Result};
use crate::progress::{HarvestProgress, UNKNOWN_TOTAL};

/// Raw rows buffered before an insert when no batch size is given.
pub const DEFAULT_GRAPHQL_BATCH_SIZE: usize = 100;

/// Data error of a node that moved away, e.g. a transferred issue.
const UNRESOLVED_ISSUE: &str = "Could not resolve to an Issue";

/// Cursor position of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CursorPager {
    /// `endCursor` of the previous page, `None` for the first one.
    pub skip_cursor: Option<String>,
    pub size: u32,
}

/// Everything known about a query before it is built.
#[derive(Debug, Clone, Default)]
pub struct GraphqlRequestData {
    pub pager: CursorPager,
    pub params: JsonValue,
    /// Input item, an array of items when `input_step > 1`, `Null`
    /// without an iterator.
    pub input: JsonValue,
}

/// A query and its variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphqlQuery {
    pub query: String,
    pub variables: JsonValue,
}

/// The `pageInfo` of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlPageInfo {
    #[serde(default)]
    pub end_cursor: Option<String>,
    #[serde(default)]
    pub has_next_page: bool,
}

impl GraphqlPageInfo {
    /// Read a `pageInfo` object at `pointer` inside the response data,
    /// e.g. `/repository/issues/pageInfo`.
    pub fn at(response: &GraphqlResponse, pointer: &str) -> Result<Self> {
        let info = response
            .data
            .pointer(pointer)
            .ok_or_else(|| HarvestError::parse(format!("no pageInfo at {pointer}")))?;
        serde_json::from_value(info.clone())
            .map_err(|e| HarvestError::parse(format!("pageInfo at {pointer}: {e}")))
    }
}

pub type GraphqlQueryBuilder = Arc<dyn Fn(&GraphqlRequestData) -> Result<GraphqlQuery> + Send + Sync>;

pub type PageInfoFn = Arc<dyn Fn(&GraphqlResponse) -> Result<GraphqlPageInfo> + Send + Sync>;

pub type GraphqlResponseParser = Arc<dyn Fn(&GraphqlResponse) -> Result<ParsedPage> + Send + Sync>;

/// Arguments of a [`GraphqlCollector`].
pub struct GraphqlCollectorArgs {
    pub raw: RawDataSubTaskArgs,
    pub client: GraphqlAsyncClient,
    pub build_query: GraphqlQueryBuilder,
    /// Follow cursors while `hasNextPage`. Without it one query runs per
    /// input item.
    pub get_page_info: Option<PageInfoFn>,
    /// Splits a response into raw rows. Without it the whole `data`
    /// object is stored as one row.
    pub response_parser: Option<GraphqlResponseParser>,
    pub page_size: u32,
    pub input: Option<Box<dyn InputIterator>>,
    /// Input items per query.
    pub input_step: usize,
    /// Raw rows buffered before an insert.
    pub batch_size: usize,
    /// Log data errors and still parse, store and follow the page.
    pub ignore_query_errors: bool,
    pub incremental: bool,
}

impl std::fmt::Debug for GraphqlCollectorArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlCollectorArgs")
            .field("table", &self.raw.table)
            .field("page_size", &self.page_size)
            .field("input_step", &self.input_step)
            .field("batch_size", &self.batch_size)
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl GraphqlCollectorArgs {
    pub fn new(
        raw: RawDataSubTaskArgs,
        client: GraphqlAsyncClient,
        build_query: GraphqlQueryBuilder,
    ) -> Self {
        let settings = &raw.ctx.settings().collector;
        let page_size = settings.page_size;
        let batch_size = usize::try_from(settings.graphql_batch_size).unwrap_or(DEFAULT_GRAPHQL_BATCH_SIZE);
        Self {
            raw,
            client,
            build_query,
            get_page_info: None,
            response_parser: None,
            page_size,
            input: None,
            input_step: 1,
            batch_size,
            ignore_query_errors: false,
            incremental: false,
        }
    }

    #[must_use]
    pub fn page_info(mut self, f: PageInfoFn) -> Self {
        self.get_page_info = Some(f);
        self
    }

    #[must_use]
    pub fn response_parser(mut self, parser: GraphqlResponseParser) -> Self {
        self.response_parser = Some(parser);
        self
    }

    #[must_use]
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn input(mut self, input: Box<dyn InputIterator>, step: usize) -> Self {
        self.input = Some(input);
        self.input_step = step;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn ignore_query_errors(mut self, ignore: bool) -> Self {
        self.ignore_query_errors = ignore;
        self
    }

    #[must_use]
    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }
}

struct Shared {
    ctx: TaskContext,
    dal: Dal,
    client: GraphqlAsyncClient,
    table: String,
    params: JsonValue,
    params_string: String,
    build_query: GraphqlQueryBuilder,
    get_page_info: Option<PageInfoFn>,
    response_parser: Option<GraphqlResponseParser>,
    page_size: u32,
    batch_size: usize,
    ignore_query_errors: bool,
    buffer: tokio::sync::Mutex<Vec<NewRawRecord>>,
}

/// Collects GraphQL query results into a raw table.
pub struct GraphqlCollector {
    shared: Arc<Shared>,
    input: Option<Box<dyn InputIterator>>,
    input_step: usize,
    incremental: bool,
}

impl std::fmt::Debug for GraphqlCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphqlCollector")
            .field("table", &self.shared.table)
            .field("params", &self.shared.params_string)
            .field("incremental", &self.incremental)
            .finish_non_exhaustive()
    }
}

impl GraphqlCollector {
    pub fn new(args: GraphqlCollectorArgs) -> Result<Self> {
        let batch_size = match args.batch_size {
            0 => DEFAULT_GRAPHQL_BATCH_SIZE,
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
                build_query: args.build_query,
                get_page_info: args.get_page_info,
                response_parser: args.response_parser,
                page_size: args.page_size,
                batch_size,
                ignore_query_errors: args.ignore_query_errors,
                buffer: tokio::sync::Mutex::new(Vec::new()),
            }),
            input: args.input,
            input_step: args.input_step.max(1),
            incremental: args.incremental,
        })
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    pub async fn execute(mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        tracing::info!(
            table = %shared.table,
            params = %shared.params_string,
            incremental = self.incremental,
            "Start graphql collection"
        );

        shared.dal.ensure_raw_table(&shared.table).await?;
        if !self.incremental {
            shared
                .dal
                .delete(
                    &shared.table,
                    &Filter::new().eq("params", shared.params_string.clone()),
                )
                .await?;
        }
        shared.ctx.set_progress(0, UNKNOWN_TOTAL);

        let launched = self.launch().await;
        tracing::debug!(table = %shared.table, "Waiting for graphql queries to finish");
        let waited = shared.client.wait().await;
        let flushed = shared.flush().await;

        let result = launched.and(waited).and(flushed);
        match &result {
            Ok(()) => tracing::info!(table = %shared.table, "End graphql collection without error"),
            Err(e) => tracing::error!(table = %shared.table, error = %e, "End graphql collection with error"),
        }
        result
    }

    async fn launch(&mut self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let Some(mut input) = self.input.take() else {
            return shared.exec(JsonValue::Null).await;
        };

        let mut result = Ok(());
        'inputs: loop {
            if let Err(e) = shared.ctx.shutdown().check() {
                result = Err(e);
                break;
            }
            if shared.client.has_error() {
                break;
            }

            let mut batch = Vec::with_capacity(self.input_step);
            while batch.len() < self.input_step {
                match input.next_input().await {
                    Ok(Some(item)) => batch.push(item),
                    Ok(None) => break,
                    Err(e) => {
                        result = Err(e);
                        break 'inputs;
                    }
                }
            }
            let item = match (self.input_step, batch.len()) {
                (_, 0) => break,
                (1, _) => batch.remove(0),
                _ => JsonValue::Array(batch),
            };

            if let Err(e) = shared.exec(item).await {
                result = Err(e);
                break;
            }
        }

        result.and(input.close().await)
    }
}

impl Shared {
    async fn exec(self: &Arc<Self>, input: JsonValue) -> Result<()> {
        let data = GraphqlRequestData {
            pager: CursorPager {
                skip_cursor: None,
                size: self.page_size,
            },
            params: self.params.clone(),
            input,
        };
        Arc::clone(self).fetch(data).await
    }

    /// Run one query, store its rows and chain the next cursor page.
    fn fetch(self: Arc<Self>, data: GraphqlRequestData) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            self.ctx.shutdown().check()?;

            let built = (self.build_query)(&data)?;
            let response = self.client.query(&built.query, &built.variables).await?;

            if !response.errors.is_empty() {
                if !self.ignore_query_errors {
                    return self.check_data_errors(&response);
                }
                // The parser sees `response.errors` and decides what to keep.
                for error in &response.errors {
                    tracing::warn!(error = %error, variables = %built.variables, "Ignoring graphql data error");
                    self.ctx.emit(HarvestProgress::Warning {
                        message: format!("graphql data error: {error}"),
                    });
                }
            }

            let page = match &self.response_parser {
                Some(parser) => parser(&response)?,
                None if response.data.is_null() => ParsedPage::default(),
                None => ParsedPage::new(vec![response.data.clone()]),
            };
            let count = page.items.len();
            if count > 0 {
                let variables = serde_json::to_vec(&built.variables)?;
                let records = page
                    .items
                    .iter()
                    .map(|item| {
                        Ok(NewRawRecord::new(
                            &self.params_string,
                            serde_json::to_vec(item)?,
                            &built.query,
                            Some(&variables),
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.buffer_rows(records).await?;
            }
            self.ctx.inc_progress(1);

            if page.finished {
                tracing::info!(table = %self.table, "Collection stopped by response parser");
                return Ok(());
            }

            let Some(page_info) = &self.get_page_info else {
                return Ok(());
            };
            let info = page_info(&response)?;
            if !info.has_next_page {
                return Ok(());
            }
            let Some(cursor) = info.end_cursor.filter(|c| !c.is_empty()) else {
                return Err(HarvestError::parse("hasNextPage without endCursor"));
            };

            let mut next = data;
            next.pager.skip_cursor = Some(cursor);
            let chained = Arc::clone(&self);
            self.client.next_tick(chained.fetch(next))
        })
    }

    /// Fail on data errors, except for nodes that moved away.
    fn check_data_errors(&self, response: &GraphqlResponse) -> Result<()> {
        let mut fatal = Vec::new();
        for error in &response.errors {
            if error.message.contains(UNRESOLVED_ISSUE) {
                tracing::warn!(error = %error, "Issue may have been transferred");
            } else {
                fatal.push(error.message.clone());
            }
        }
        if fatal.is_empty() {
            return Ok(());
        }
        Err(HarvestError::Graphql {
            message: fatal.join("; "),
        })
    }

    async fn buffer_rows(&self, records: Vec<NewRawRecord>) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        buffer.extend(records);
        if buffer.len() < self.batch_size {
            return Ok(());
        }
        let rows = std::mem::take(&mut *buffer);
        self.insert(rows).await
    }

    async fn flush(&self) -> Result<()> {
        let rows = std::mem::take(&mut *self.buffer.lock().await);
        if rows.is_empty() {
            return Ok(());
        }
        self.insert(rows).await
    }

    async fn insert(&self, rows: Vec<NewRawRecord>) -> Result<()> {
        let count = rows.len();
        self.dal.insert_raw(&self.table, rows).await?;
        self.ctx.emit(HarvestProgress::RawPersisted {
            table: self.table.clone(),
            count,
        });
        tracing::debug!(table = %self.table, count, "Saved raw rows");
        Ok(())
    }
}
