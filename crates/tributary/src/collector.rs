//! Collectors: fetch API pages and store them verbatim in raw tables.
//!
//! - [`ApiCollector`]: paginated REST collection with four strategies
//!   (single, determined, sequential, undetermined)
//! - [`GraphqlCollector`]: cursor-paginated GraphQL collection
//! - [`CollectorStateManager`] / [`StatefulApiCollector`]: incremental runs
//!   driven by the stored high-water mark
//! - [`FinalizableApiCollector`]: created-after cutoff plus detail refresh for
//!   entities that stop changing once finished

pub mod api_collector;
pub mod finalizable;
pub mod graphql_collector;
pub mod iterator;
pub mod raw;
pub mod state;
pub mod stateful;
pub mod template;

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::context::TaskContext;
use crate::error::{HarvestError, Result};
use crate::http::HttpResponse;

pub use api_collector::{ApiCollector, ApiCollectorArgs};
pub use finalizable::{FinalizableApiCollector, FinalizableDetailArgs, FinalizableListArgs};
pub use graphql_collector::{GraphqlCollector, GraphqlCollectorArgs};
pub use iterator::{DalInputIterator, InputIterator, VecInputIterator};
pub use raw::{NewRawRecord, RawRecord, raw_table_name};
pub use state::{CollectorStateManager, IncrementalDecision, decide_incremental};
pub use stateful::StatefulApiCollector;
pub use template::UrlTemplate;

/// Where a collection stores its raw rows.
#[derive(Debug, Clone)]
pub struct RawDataSubTaskArgs {
    pub ctx: TaskContext,
    /// Raw table name, always `_raw_` prefixed.
    pub table: String,
    /// Scope of the collection, e.g. `{"connection_id": 1, "repo_id": 2}`.
    pub params: JsonValue,
}

impl RawDataSubTaskArgs {
    /// # Errors
    /// Returns [`HarvestError::Config`] when `params` serializes to `null`
    /// or an empty object, since every raw row must be attributable to a
    /// scope.
    pub fn new(ctx: TaskContext, table: &str, params: impl Serialize) -> Result<Self> {
        let params = serde_json::to_value(params)?;
        let empty = match &params {
            JsonValue::Null => true,
            JsonValue::Object(map) => map.is_empty(),
            _ => false,
        };
        if empty {
            return Err(HarvestError::config(format!("params for {table} must not be empty")));
        }
        Ok(Self {
            ctx,
            table: raw_table_name(table),
            params,
        })
    }

    /// Params fingerprint stored with every raw row.
    pub fn params_string(&self) -> String {
        self.params.to_string()
    }
}

/// Page coordinates of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Pager {
    /// 1-based page number.
    pub page: u32,
    /// Items before this page.
    pub skip: u32,
    pub size: u32,
}

impl Pager {
    pub fn first(size: u32) -> Self {
        Self {
            page: 1,
            skip: 0,
            size,
        }
    }

    /// The page `step` pages further on.
    #[must_use]
    pub fn advance(self, step: u32) -> Self {
        Self {
            page: self.page + step,
            skip: self.skip + self.size * step,
            size: self.size,
        }
    }

    /// The page numbered `page`.
    #[must_use]
    pub fn at(self, page: u32) -> Self {
        Self {
            page,
            skip: self.size * page.saturating_sub(1),
            size: self.size,
        }
    }
}

/// Everything known about a request before it is sent.
///
/// Query, header and body builders receive it; URL templates are rendered
/// against [`RequestData::template_context`].
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub pager: Pager,
    pub params: JsonValue,
    /// Input item, `Null` without an iterator.
    pub input: JsonValue,
    /// Value returned by the next-page function for the previous page.
    pub custom_data: JsonValue,
}

impl RequestData {
    /// `{"Params", "Input", "Pager", "CustomData"}`.
    pub fn template_context(&self) -> JsonValue {
        serde_json::json!({
            "Params": self.params,
            "Input": self.input,
            "Pager": self.pager,
            "CustomData": self.custom_data,
        })
    }

    /// JSON of the input item, stored with raw rows.
    pub fn input_json(&self) -> Result<Option<Vec<u8>>> {
        if self.input.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_vec(&self.input)?))
    }
}

/// Items parsed out of one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub items: Vec<JsonValue>,
    /// Stop paginating after this page. Its items are still stored.
    pub finished: bool,
}

impl ParsedPage {
    pub fn new(items: Vec<JsonValue>) -> Self {
        Self {
            items,
            finished: false,
        }
    }

    /// A page that ends the collection.
    pub fn last(items: Vec<JsonValue>) -> Self {
        Self {
            items,
            finished: true,
        }
    }

    /// Parse a body that is a JSON array, or an object holding one at
    /// `pointer` (RFC 6901, e.g. `/values`). A missing or `null` member
    /// yields an empty page.
    pub fn from_json(response: &HttpResponse, pointer: Option<&str>) -> Result<Self> {
        let body: JsonValue = crate::client::unmarshal(response)?;
        let target = match pointer {
            Some(pointer) => body.pointer(pointer).cloned().unwrap_or(JsonValue::Null),
            None => body,
        };
        match target {
            JsonValue::Array(items) => Ok(Self::new(items)),
            JsonValue::Null => Ok(Self::default()),
            other => Err(HarvestError::parse(format!(
                "expected a JSON array from {}, got {other}",
                response.url
            ))),
        }
    }
}
