//! Raw-to-tool extraction.
//!
//! An [`ApiExtractor`] streams the raw rows of one collection, hands each to
//! a plugin `extract` function, stamps the resulting records with their
//! lineage and batch writes them. Before the first record of a destination
//! table is buffered, rows previously extracted from the same raw table and
//! params are deleted, unless the run is incremental.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::FromQueryResult;
use serde_json::Value as JsonValue;

use crate::batch::{BatchWriter, BatchWriterStats, DEFAULT_BATCH_SIZE, WriteMode};
use crate::collector::{RawDataSubTaskArgs, RawRecord};
use crate::dal::{Dal, Filter, RowQuery};
use crate::error::Result;
use crate::record::{RAW_DATA_PARAMS_COLUMN, RAW_DATA_TABLE_COLUMN, RawDataOrigin, Record};
use crate::subtask_state::SubtaskStateManager;

/// Turns one raw row into tool-layer records.
pub type ExtractFn = Arc<dyn Fn(&RawRecord) -> Result<Vec<Box<dyn Record>>> + Send + Sync>;

/// Arguments of an [`ApiExtractor`].
pub struct ApiExtractorArgs {
    pub raw: RawDataSubTaskArgs,
    pub extract: ExtractFn,
    pub batch_size: usize,
    pub write_mode: WriteMode,
    /// Makes the extractor stateful: a run after a successful one with the
    /// same configuration only processes raw rows collected since.
    pub subtask_config: Option<JsonValue>,
}

impl ApiExtractorArgs {
    pub fn new(raw: RawDataSubTaskArgs, extract: ExtractFn) -> Self {
        let batch_size = match raw.ctx.settings().collector.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        };
        Self {
            raw,
            extract,
            batch_size,
            write_mode: WriteMode::default(),
            subtask_config: None,
        }
    }

    #[must_use]
    pub fn stateful(mut self, config: JsonValue) -> Self {
        self.subtask_config = Some(config);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }
}

/// Extracts tool-layer records from a raw table.
pub struct ApiExtractor {
    args: ApiExtractorArgs,
}

impl std::fmt::Debug for ApiExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiExtractor")
            .field("table", &self.args.raw.table)
            .field("params", &self.args.raw.params)
            .field("batch_size", &self.args.batch_size)
            .field("stateful", &self.args.subtask_config.is_some())
            .finish_non_exhaustive()
    }
}

impl ApiExtractor {
    pub fn new(args: ApiExtractorArgs) -> Result<Self> {
        if args.batch_size == 0 {
            return Err(crate::error::HarvestError::config("batch size must be positive"));
        }
        Ok(Self { args })
    }

    pub async fn execute(self) -> Result<BatchWriterStats> {
        let args = self.args;
        let ctx = &args.raw.ctx;
        let table = args.raw.table.clone();
        let params = args.raw.params_string();

        let state = match &args.subtask_config {
            Some(config) => Some(SubtaskStateManager::new(ctx, &params, config).await?),
            None => None,
        };
        let incremental = state.as_ref().is_some_and(SubtaskStateManager::is_incremental);
        let until = state.as_ref().map_or_else(Utc::now, SubtaskStateManager::until);

        tracing::info!(table = %table, params = %params, incremental, "Start extraction");

        let mut filter = Filter::new().eq("params", params.clone());
        if incremental && let Some(since) = state.as_ref().and_then(SubtaskStateManager::since) {
            filter = filter.gte("created_at", since);
        }
        filter = filter.lt("created_at", until);

        let dal = ctx.dal().clone();
        dal.ensure_raw_table(&table).await?;
        let total = dal.count(&table, &filter).await?;
        ctx.set_progress(0, i64::try_from(total).unwrap_or(i64::MAX));

        let mut writer = BatchWriter::new(dal.clone(), args.batch_size, args.write_mode)?
            .with_progress(ctx.progress_callback());
        if !incremental {
            writer = writer.on_new_destination(delete_previous(dal.clone(), table.clone(), params.clone()));
        }

        let mut cursor = dal.cursor(RowQuery::new(table.as_str()).filter(filter));
        while let Some(result) = cursor.next().await? {
            ctx.shutdown().check()?;
            let raw = RawRecord::from_query_result(&result, "")?;

            let records = match (args.extract)(&raw) {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(table = %table, raw_id = raw.id, error = %e, "Extraction failed");
                    writer.flush().await?;
                    return Err(e);
                }
            };

            let origin = RawDataOrigin::new(table.as_str(), raw.id.max(0) as u64, params.as_str());
            for mut record in records {
                record.set_lineage(origin.clone());
                writer.add(record.as_ref()).await?;
            }
            ctx.inc_progress(1);
        }

        let stats = writer.close().await?;
        if let Some(state) = state {
            state.close().await?;
        }
        tracing::info!(
            table = %table,
            rows = stats.rows_written,
            tables = stats.tables,
            "End extraction"
        );
        Ok(stats)
    }
}

/// Delete rows derived from `raw_table` + `params` in each new destination.
pub(crate) fn delete_previous(
    dal: Dal,
    raw_table: String,
    params: String,
) -> crate::batch::NewDestinationHook {
    Box::new(move |shape| {
        let dal = dal.clone();
        let filter = Filter::new()
            .eq(RAW_DATA_TABLE_COLUMN, raw_table.clone())
            .eq(RAW_DATA_PARAMS_COLUMN, params.clone());
        Box::pin(async move {
            let deleted = dal.delete(shape.table, &filter).await?;
            tracing::debug!(table = shape.table, deleted, "Deleted previously extracted rows");
            Ok(())
        })
    })
}
