//! Tool-to-domain conversion and in-place enrichment.

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::batch::{BatchWriter, BatchWriterStats, DEFAULT_BATCH_SIZE, WriteMode};
use crate::collector::RawDataSubTaskArgs;
use crate::context::TaskContext;
use crate::dal::{Filter, Row, RowQuery, query_result_to_row};
use crate::error::{HarvestError, Result};
use crate::record::{RAW_DATA_PARAMS_COLUMN, RAW_DATA_TABLE_COLUMN, RawDataOrigin, Record, RecordShape};
use crate::subtask_state::SubtaskStateManager;

/// Column compared with `since` on incremental runs.
pub const DEFAULT_CREATED_AT_COLUMN: &str = "created_at";

/// Converts one input row into domain records.
pub type ConvertFn<T> = Arc<dyn Fn(&T) -> Result<Vec<Box<dyn Record>>> + Send + Sync>;

/// Rows of a destination to delete before the first write into it.
pub type DeleteFilterFn = Arc<dyn Fn(RecordShape) -> Filter + Send + Sync>;

fn decode_row<T: DeserializeOwned>(table: &str, row: &Row) -> Result<T> {
    serde_json::from_value(JsonValue::Object(row.clone()))
        .map_err(|e| HarvestError::parse(format!("row of {table}: {e}")))
}

/// Arguments of a [`DataConverter`].
pub struct DataConverterArgs<T> {
    /// Raw table and params the input rows were extracted from.
    pub raw: RawDataSubTaskArgs,
    pub input: RowQuery,
    pub convert: ConvertFn<T>,
    pub batch_size: usize,
    pub write_mode: WriteMode,
    /// Defaults to rows derived from the same raw table and params.
    pub delete_filter: Option<DeleteFilterFn>,
    /// Makes the converter stateful.
    pub subtask_config: Option<JsonValue>,
    /// Input column compared with `since` on incremental runs.
    pub created_at_column: String,
}

impl<T> DataConverterArgs<T> {
    pub fn new(raw: RawDataSubTaskArgs, input: RowQuery, convert: ConvertFn<T>) -> Self {
        let batch_size = match raw.ctx.settings().collector.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        };
        Self {
            raw,
            input,
            convert,
            batch_size,
            write_mode: WriteMode::default(),
            delete_filter: None,
            subtask_config: None,
            created_at_column: DEFAULT_CREATED_AT_COLUMN.to_string(),
        }
    }

    #[must_use]
    pub fn stateful(mut self, config: JsonValue) -> Self {
        self.subtask_config = Some(config);
        self
    }

    #[must_use]
    pub fn created_at_column(mut self, column: impl Into<String>) -> Self {
        self.created_at_column = column.into();
        self
    }

    #[must_use]
    pub fn delete_filter(mut self, filter: DeleteFilterFn) -> Self {
        self.delete_filter = Some(filter);
        self
    }

    #[must_use]
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

/// Converts tool-layer rows into domain records.
///
/// Each output inherits the lineage of its input row unless `convert`
/// already set one.
pub struct DataConverter<T> {
    args: DataConverterArgs<T>,
    _row: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for DataConverter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataConverter")
            .field("input", &self.args.input)
            .field("batch_size", &self.args.batch_size)
            .field("stateful", &self.args.subtask_config.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> DataConverter<T> {
    pub fn new(args: DataConverterArgs<T>) -> Result<Self> {
        if args.batch_size == 0 {
            return Err(HarvestError::config("batch size must be positive"));
        }
        Ok(Self {
            args,
            _row: PhantomData,
        })
    }

    pub async fn execute(self) -> Result<BatchWriterStats> {
        let args = self.args;
        let ctx = &args.raw.ctx;
        let params = args.raw.params_string();

        let state = match &args.subtask_config {
            Some(config) => Some(SubtaskStateManager::new(ctx, &params, config).await?),
            None => None,
        };
        let incremental = state.as_ref().is_some_and(SubtaskStateManager::is_incremental);

        let mut input = args.input;
        if incremental && let Some(since) = state.as_ref().and_then(SubtaskStateManager::since) {
            input.filter = input.filter.gte(args.created_at_column.as_str(), since);
        }
        tracing::info!(input = %input.table, incremental, "Start conversion");

        let dal = ctx.dal().clone();
        let total = dal.count(&input.table, &input.filter).await?;
        ctx.set_progress(0, i64::try_from(total).unwrap_or(i64::MAX));

        let mut writer = BatchWriter::new(dal.clone(), args.batch_size, args.write_mode)?
            .with_progress(ctx.progress_callback());
        if !incremental {
            let delete_filter = args.delete_filter.unwrap_or_else(|| {
                let raw_table = args.raw.table.clone();
                let params = params.clone();
                Arc::new(move |_| {
                    Filter::new()
                        .eq(RAW_DATA_TABLE_COLUMN, raw_table.clone())
                        .eq(RAW_DATA_PARAMS_COLUMN, params.clone())
                })
            });
            let hook_dal = dal.clone();
            writer = writer.on_new_destination(Box::new(move |shape| {
                let dal = hook_dal.clone();
                let filter = delete_filter(shape);
                Box::pin(async move {
                    let deleted = dal.delete(shape.table, &filter).await?;
                    tracing::debug!(table = shape.table, deleted, "Deleted previously converted rows");
                    Ok(())
                })
            }));
        }

        let input_table = input.table.clone();
        let mut cursor = dal.cursor(input);
        while let Some(result) = cursor.next().await? {
            ctx.shutdown().check()?;
            let row = query_result_to_row(&result)?;
            let origin = RawDataOrigin::from_row(&row);

            let converted = decode_row::<T>(&input_table, &row).and_then(|item| (args.convert)(&item));
            let records = match converted {
                Ok(records) => records,
                Err(e) => {
                    tracing::error!(input = %input_table, error = %e, "Conversion failed");
                    writer.flush().await?;
                    return Err(e);
                }
            };
            for mut record in records {
                if record.lineage().is_empty() {
                    record.set_lineage(origin.clone());
                }
                writer.add(record.as_ref()).await?;
            }
            ctx.inc_progress(1);
        }

        let stats = writer.close().await?;
        if let Some(state) = state {
            state.close().await?;
        }
        tracing::info!(input = %input_table, rows = stats.rows_written, "End conversion");
        Ok(stats)
    }
}

/// Streams domain rows, derives records from them and upserts the results.
/// Nothing is deleted.
pub struct DataEnricher<T> {
    ctx: TaskContext,
    input: RowQuery,
    enrich: ConvertFn<T>,
    batch_size: usize,
    _row: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for DataEnricher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEnricher")
            .field("input", &self.input)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> DataEnricher<T> {
    pub fn new(ctx: TaskContext, input: RowQuery, enrich: ConvertFn<T>) -> Self {
        let batch_size = match ctx.settings().collector.batch_size {
            0 => DEFAULT_BATCH_SIZE,
            n => n,
        };
        Self {
            ctx,
            input,
            enrich,
            batch_size,
            _row: PhantomData,
        }
    }

    pub async fn execute(self) -> Result<BatchWriterStats> {
        let dal = self.ctx.dal().clone();
        let table = self.input.table.clone();
        let total = dal.count(&table, &self.input.filter).await?;
        self.ctx.set_progress(0, i64::try_from(total).unwrap_or(i64::MAX));

        let mut writer = BatchWriter::new(dal.clone(), self.batch_size, WriteMode::Upsert)?
            .with_progress(self.ctx.progress_callback());
        let mut cursor = dal.cursor(self.input);
        while let Some(result) = cursor.next().await? {
            self.ctx.shutdown().check()?;
            let row = query_result_to_row(&result)?;
            let records = match decode_row::<T>(&table, &row).and_then(|item| (self.enrich)(&item)) {
                Ok(records) => records,
                Err(e) => {
                    writer.flush().await?;
                    return Err(e);
                }
            };
            for record in records {
                writer.add(record.as_ref()).await?;
            }
            self.ctx.inc_progress(1);
        }

        let stats = writer.close().await?;
        tracing::info!(input = %table, rows = stats.rows_written, "End enrichment");
        Ok(stats)
    }
}

/// Builds stable domain ids such as `github:GithubIssue:1:42`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainIdGenerator {
    prefix: String,
}

impl DomainIdGenerator {
    /// `prefix` names the plugin and source type, e.g. `github:GithubIssue`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn generate(&self, parts: &[&dyn Display]) -> String {
        let mut id = self.prefix.clone();
        for part in parts {
            id.push(':');
            id.push_str(&part.to_string());
        }
        id
    }
}
