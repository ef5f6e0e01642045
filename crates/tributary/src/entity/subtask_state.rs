//! SubtaskState entity - bookkeeping for stateful extractors and converters.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "_subtask_state")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub plugin: String,

    pub subtask: String,

    /// Params fingerprint the subtask ran for.
    #[sea_orm(column_type = "Text")]
    pub params: String,

    /// `time_after` boundary of the last full run.
    pub time_after: Option<DateTimeUtc>,

    /// Start time of the last successful run.
    pub prev_started_at: Option<DateTimeUtc>,

    /// Serialized subtask configuration of the last successful run.
    /// A change forces the next run to be a full one.
    #[sea_orm(column_type = "Text")]
    pub prev_config: String,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
