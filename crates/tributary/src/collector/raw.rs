//! Raw records: API payloads stored verbatim.

use chrono::{DateTime, Utc};
use sea_orm::FromQueryResult;
use serde::de::DeserializeOwned;

use crate::error::{HarvestError, Result};

/// Prefix of raw table names.
pub const RAW_TABLE_PREFIX: &str = "_raw_";

/// Raw table name for a plugin table name, e.g. `github_issues` becomes
/// `_raw_github_issues`. Names that already carry the prefix are kept.
pub fn raw_table_name(name: &str) -> String {
    if name.starts_with(RAW_TABLE_PREFIX) {
        name.to_string()
    } else {
        format!("{RAW_TABLE_PREFIX}{name}")
    }
}

/// A stored raw row.
#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct RawRecord {
    pub id: i64,
    /// Params fingerprint of the collection that produced the row.
    pub params: String,
    pub data: Vec<u8>,
    pub url: String,
    /// JSON of the input item the request was made for.
    pub input: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl RawRecord {
    /// Decode the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| {
            HarvestError::parse(format!("raw row {} in payload: {e}", self.id))
        })
    }

    /// Decode the input item, if any.
    pub fn decode_input<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.input
            .as_deref()
            .map(|input| {
                serde_json::from_slice(input).map_err(|e| {
                    HarvestError::parse(format!("raw row {} in input: {e}", self.id))
                })
            })
            .transpose()
    }
}

/// A raw row about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRawRecord {
    pub params: String,
    pub data: Vec<u8>,
    pub url: String,
    pub input: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

impl NewRawRecord {
    pub fn new(params: &str, data: Vec<u8>, url: &str, input: Option<&[u8]>) -> Self {
        Self {
            params: params.to_string(),
            data,
            url: url.to_string(),
            input: input.map(<[u8]>::to_vec),
            created_at: Utc::now(),
        }
    }
}
