//! CollectorState entity - the high-water mark of a raw-table collection.
//!
//! One row exists per `(raw_data_table, raw_data_params)` pair. It is written
//! only after a collection finished without error, and decides whether the
//! next run can be incremental.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "_collector_latest_state")]
pub struct Model {
    /// Internal UUID primary key.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Raw table the collector writes into.
    pub raw_data_table: String,

    /// Params fingerprint of the collection.
    #[sea_orm(column_type = "Text")]
    pub raw_data_params: String,

    /// Start time of the last successful run.
    pub latest_success_start: Option<DateTimeUtc>,

    /// Lower bound applied by the last successful run.
    pub created_date_after: Option<DateTimeUtc>,

    /// `time_after` boundary the stored data covers.
    pub time_after: Option<DateTimeUtc>,

    /// When this row was last written.
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
