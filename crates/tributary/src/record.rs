//! Record shapes and lineage.
//!
//! Tool-layer and domain-layer records are plugin types. They describe where
//! they are stored through [`Record::shape`] and carry a [`RawDataOrigin`]
//! pointing back at the raw row they were derived from.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::dal::Row;
use crate::error::{HarvestError, Result};

/// Destination table and key columns of a record type.
///
/// Records are routed by `table`, so two types writing the same table must
/// declare the same key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordShape {
    pub table: &'static str,
    pub key_columns: &'static [&'static str],
}

impl RecordShape {
    pub const fn new(table: &'static str, key_columns: &'static [&'static str]) -> Self {
        Self { table, key_columns }
    }
}

pub const RAW_DATA_TABLE_COLUMN: &str = "_raw_data_table";
pub const RAW_DATA_ID_COLUMN: &str = "_raw_data_id";
pub const RAW_DATA_PARAMS_COLUMN: &str = "_raw_data_params";
pub const RAW_DATA_REMARK_COLUMN: &str = "_raw_data_remark";

/// Lineage marker: the raw row a record was derived from.
///
/// Embed it with `#[serde(flatten)]` so it round-trips through the
/// `_raw_data_*` columns. `NULL` columns read back as empty values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataOrigin {
    #[serde(rename = "_raw_data_table", default, deserialize_with = "null_as_default")]
    pub raw_data_table: String,
    #[serde(rename = "_raw_data_id", default, deserialize_with = "null_as_default")]
    pub raw_data_id: u64,
    #[serde(rename = "_raw_data_params", default, deserialize_with = "null_as_default")]
    pub raw_data_params: String,
    #[serde(rename = "_raw_data_remark", default, deserialize_with = "null_as_default")]
    pub raw_data_remark: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl RawDataOrigin {
    pub fn new(table: impl Into<String>, id: u64, params: impl Into<String>) -> Self {
        Self {
            raw_data_table: table.into(),
            raw_data_id: id,
            raw_data_params: params.into(),
            raw_data_remark: String::new(),
        }
    }

    /// `true` when no raw table is recorded.
    pub fn is_empty(&self) -> bool {
        self.raw_data_table.is_empty()
    }

    /// Read lineage columns from a row. Missing or malformed columns are
    /// treated as empty.
    pub fn from_row(row: &Row) -> Self {
        let text = |column: &str| match row.get(column) {
            Some(JsonValue::String(s)) => s.clone(),
            _ => String::new(),
        };
        let id = match row.get(RAW_DATA_ID_COLUMN) {
            Some(JsonValue::Number(n)) => n.as_u64().unwrap_or_default(),
            Some(JsonValue::String(s)) => s.parse().unwrap_or_default(),
            _ => 0,
        };
        Self {
            raw_data_table: text(RAW_DATA_TABLE_COLUMN),
            raw_data_id: id,
            raw_data_params: text(RAW_DATA_PARAMS_COLUMN),
            raw_data_remark: text(RAW_DATA_REMARK_COLUMN),
        }
    }

    /// Write the lineage columns into `row`, replacing existing values.
    pub fn write_to(&self, row: &mut Row) {
        row.insert(RAW_DATA_TABLE_COLUMN.into(), self.raw_data_table.clone().into());
        row.insert(RAW_DATA_ID_COLUMN.into(), self.raw_data_id.into());
        row.insert(RAW_DATA_PARAMS_COLUMN.into(), self.raw_data_params.clone().into());
        row.insert(RAW_DATA_REMARK_COLUMN.into(), self.raw_data_remark.clone().into());
    }
}

/// Access to a record's lineage marker.
pub trait HasLineage {
    fn lineage(&self) -> &RawDataOrigin;
    fn set_lineage(&mut self, origin: RawDataOrigin);
}

/// A tool-layer or domain-layer record that can be batch written.
pub trait Record: HasLineage + Send + Sync {
    fn shape(&self) -> RecordShape;

    /// Serialize into column/value pairs. Column names must match the
    /// destination table.
    fn to_row(&self) -> Result<Row>;
}

/// Serialize any `Serialize` struct into a [`Row`].
///
/// # Errors
/// Returns [`HarvestError::Internal`] when `value` does not serialize to a
/// JSON object.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(HarvestError::internal(format!(
            "record serialized to {} instead of an object",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Implement [`HasLineage`] for a struct with a `RawDataOrigin` field.
///
/// ```ignore
/// #[derive(Serialize)]
/// struct GithubIssue {
///     id: i64,
///     #[serde(flatten)]
///     origin: RawDataOrigin,
/// }
/// tributary::impl_has_lineage!(GithubIssue, origin);
/// ```
#[macro_export]
macro_rules! impl_has_lineage {
    ($ty:ty, $field:ident) => {
        impl $crate::record::HasLineage for $ty {
            fn lineage(&self) -> &$crate::record::RawDataOrigin {
                &self.$field
            }

            fn set_lineage(&mut self, origin: $crate::record::RawDataOrigin) {
                self.$field = origin;
            }
        }
    };
}
