//! Tributary - a generic API harvesting and ETL engine.
//!
//! Data flows through three layers:
//!
//! 1. **Collect**: [`collector`]s fetch paginated REST or GraphQL APIs through
//!    a rate-paced [`AsyncApiClient`] and store every page verbatim in a
//!    `_raw_*` table.
//! 2. **Extract**: an [`ApiExtractor`] turns raw rows into tool-layer records
//!    that remember which raw row they came from.
//! 3. **Convert**: a [`DataConverter`] maps tool-layer rows into domain rows.
//!
//! Each stage can run incrementally: collector and subtask state rows track
//! what was already processed.
//!
//! # Features
//!
//! - `sqlite` (default) / `postgres` - database backend.
//! - `migrate` (default) - enables [`connect_and_migrate`] which creates the
//!   state tables.
//!
//! # Example
//!
//! ```ignore
//! use tributary::{connect_and_migrate, ApiCollector, ApiCollectorArgs, RawDataSubTaskArgs, TaskContext};
//!
//! let db = connect_and_migrate("sqlite://harvest.db?mode=rwc").await?;
//! let ctx = TaskContext::builder().database(db).plugin("github").build()?;
//! let raw = RawDataSubTaskArgs::new(ctx.for_subtask("collect_issues"), "github_issues", params)?;
//! ApiCollector::new(ApiCollectorArgs::new(raw, client, "repos/{Params.name}/issues", parser))?
//!     .execute()
//!     .await?;
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod batch;
pub mod client;
pub mod collector;
pub mod context;
pub mod converter;
pub mod dal;
pub mod db;
pub mod entity;
pub mod error;
pub mod extractor;
pub mod graph;
pub mod http;
pub mod progress;
pub mod rate_limit;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod subtask_state;

#[cfg(feature = "migrate")]
pub mod migration;

/// Boxed, sendable future used by hooks and callbacks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use batch::{BatchWriter, BatchWriterStats, WriteMode};
pub use client::{ApiClient, AsyncApiClient, AsyncRequest, GraphqlAsyncClient, GraphqlClient};
pub use collector::{
    ApiCollector, ApiCollectorArgs, FinalizableApiCollector, GraphqlCollector,
    GraphqlCollectorArgs, ParsedPage, RawDataSubTaskArgs, RawRecord, RequestData,
    StatefulApiCollector,
};
pub use context::{Shutdown, SyncPolicy, TaskContext};
pub use converter::{DataConverter, DataConverterArgs, DataEnricher, DomainIdGenerator};
pub use dal::{Dal, Filter, Row, RowQuery};
pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use entity::prelude::*;
pub use error::{HarvestError, Result};
pub use extractor::{ApiExtractor, ApiExtractorArgs};
pub use graph::CommitAncestryGraph;
pub use http::{HttpMethod, HttpResponse, HttpTransport, ReqwestTransport};
pub use progress::HarvestProgress;
pub use rate_limit::RateBudget;
pub use record::{HasLineage, RawDataOrigin, Record, RecordShape};
pub use settings::HarvestSettings;
