//! Type-dispatched batch persistence.
//!
//! [`BatchWriter`] routes records to one [`BatchSave`] buffer per
//! [`RecordShape`]. Buffers flush automatically when they reach the batch
//! size; [`BatchWriter::close`] flushes whatever is left.
//!
//! ```text
//! extract/convert → BatchWriter::add → BatchSave (per table) → Dal upsert
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::BoxFuture;
use crate::dal::{Dal, Row};
use crate::error::{HarvestError, Result};
use crate::progress::{self, HarvestProgress, ProgressCallback};
use crate::record::{Record, RecordShape};

/// Default rows per batch for extractors and converters.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// How a buffer is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Plain insert; a duplicate key fails the flush.
    Insert,
    /// Insert or update every non-key column on key conflict.
    #[default]
    Upsert,
}

/// Called once per shape before its first record is buffered.
pub type NewDestinationHook = Box<dyn FnMut(RecordShape) -> BoxFuture<'static, Result<()>> + Send>;

/// Buffer of rows for one destination table.
pub struct BatchSave {
    dal: Dal,
    shape: RecordShape,
    mode: WriteMode,
    size: usize,
    rows: Vec<Row>,
    /// Row position by key, for deduplication.
    positions: HashMap<String, usize>,
    on_progress: Option<Arc<ProgressCallback>>,
    flushed: usize,
}

impl std::fmt::Debug for BatchSave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSave")
            .field("shape", &self.shape)
            .field("mode", &self.mode)
            .field("size", &self.size)
            .field("buffered", &self.rows.len())
            .field("flushed", &self.flushed)
            .finish()
    }
}

impl BatchSave {
    /// # Errors
    /// Returns [`HarvestError::Config`] for a zero `size`, or for upsert mode
    /// on a shape without key columns.
    pub fn new(dal: Dal, shape: RecordShape, size: usize, mode: WriteMode) -> Result<Self> {
        if size == 0 {
            return Err(HarvestError::config(format!(
                "batch size for {} must be positive",
                shape.table
            )));
        }
        if mode == WriteMode::Upsert && shape.key_columns.is_empty() {
            return Err(HarvestError::config(format!(
                "upserting into {} requires key columns",
                shape.table
            )));
        }
        Ok(Self {
            dal,
            shape,
            mode,
            size,
            rows: Vec::with_capacity(size),
            positions: HashMap::new(),
            on_progress: None,
            flushed: 0,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: Option<Arc<ProgressCallback>>) -> Self {
        self.on_progress = on_progress;
        self
    }

    pub fn shape(&self) -> RecordShape {
        self.shape
    }

    /// Rows waiting to be flushed.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows written so far.
    pub fn flushed(&self) -> usize {
        self.flushed
    }

    /// Buffer a row, flushing when the buffer is full.
    ///
    /// A row whose key is already buffered replaces the earlier row in place.
    pub async fn add(&mut self, row: Row) -> Result<()> {
        match self.key_of(&row) {
            Some(key) => match self.positions.get(&key) {
                Some(&pos) => self.rows[pos] = row,
                None => {
                    self.positions.insert(key, self.rows.len());
                    self.rows.push(row);
                }
            },
            None => self.rows.push(row),
        }

        if self.rows.len() >= self.size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write buffered rows. Returns the number of rows written.
    pub async fn flush(&mut self) -> Result<usize> {
        if self.rows.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(&mut self.rows);
        self.positions.clear();
        let count = rows.len();

        match self.mode {
            WriteMode::Insert => self.dal.insert_rows(self.shape.table, &rows).await?,
            WriteMode::Upsert => {
                self.dal
                    .upsert_rows(self.shape.table, self.shape.key_columns, &rows)
                    .await?
            }
        };

        self.flushed += count;
        tracing::debug!(table = self.shape.table, count, "Flushed batch");
        progress::emit(
            self.on_progress.as_deref(),
            HarvestProgress::BatchFlushed {
                table: self.shape.table.to_string(),
                count,
            },
        );
        Ok(count)
    }

    fn key_of(&self, row: &Row) -> Option<String> {
        if self.shape.key_columns.is_empty() {
            return None;
        }
        let key: Vec<&serde_json::Value> = self
            .shape
            .key_columns
            .iter()
            .map(|c| row.get(*c).unwrap_or(&serde_json::Value::Null))
            .collect();
        serde_json::to_string(&key).ok()
    }
}

/// Totals reported by [`BatchWriter::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct BatchWriterStats {
    /// Rows written across all tables.
    pub rows_written: usize,
    /// Destination tables that received at least one record.
    pub tables: usize,
}

/// Routes records to per-table buffers.
///
/// Single producer: every method takes `&mut self`.
pub struct BatchWriter {
    dal: Dal,
    size: usize,
    mode: WriteMode,
    saves: HashMap<&'static str, BatchSave>,
    on_new_destination: Option<NewDestinationHook>,
    on_progress: Option<Arc<ProgressCallback>>,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("size", &self.size)
            .field("mode", &self.mode)
            .field("saves", &self.saves)
            .finish_non_exhaustive()
    }
}

impl BatchWriter {
    /// # Errors
    /// Returns [`HarvestError::Config`] for a zero `size`.
    pub fn new(dal: Dal, size: usize, mode: WriteMode) -> Result<Self> {
        if size == 0 {
            return Err(HarvestError::config("batch size must be positive"));
        }
        Ok(Self {
            dal,
            size,
            mode,
            saves: HashMap::new(),
            on_new_destination: None,
            on_progress: None,
        })
    }

    #[must_use]
    pub fn on_new_destination(mut self, hook: NewDestinationHook) -> Self {
        self.on_new_destination = Some(hook);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: Option<Arc<ProgressCallback>>) -> Self {
        self.on_progress = on_progress;
        self
    }

    /// Buffer a record in the buffer for its shape.
    pub async fn add(&mut self, record: &dyn Record) -> Result<()> {
        let row = record.to_row()?;
        self.add_row(record.shape(), row).await
    }

    /// Buffer an already serialized row.
    pub async fn add_row(&mut self, shape: RecordShape, row: Row) -> Result<()> {
        if !self.saves.contains_key(shape.table) {
            if let Some(hook) = self.on_new_destination.as_mut() {
                hook(shape).await?;
            }
            let save = BatchSave::new(self.dal.clone(), shape, self.size, self.mode)?
                .with_progress(self.on_progress.clone());
            self.saves.insert(shape.table, save);
        }

        match self.saves.get_mut(shape.table) {
            Some(save) => save.add(row).await,
            None => Err(HarvestError::internal(format!(
                "no batch buffer for {}",
                shape.table
            ))),
        }
    }

    /// Flush every buffer.
    pub async fn flush(&mut self) -> Result<()> {
        for save in self.saves.values_mut() {
            save.flush().await?;
        }
        Ok(())
    }

    /// Flush the remainders and return totals.
    pub async fn close(mut self) -> Result<BatchWriterStats> {
        self.flush().await?;
        let stats = BatchWriterStats {
            rows_written: self.saves.values().map(BatchSave::flushed).sum(),
            tables: self.saves.len(),
        };
        tracing::debug!(
            rows = stats.rows_written,
            tables = stats.tables,
            "Closed batch writer"
        );
        Ok(stats)
    }
}
