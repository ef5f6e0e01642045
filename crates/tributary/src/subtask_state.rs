//! Incremental bookkeeping for extractors and converters.
//!
//! Each `(plugin, subtask, params)` keeps the start of its last successful
//! run and the configuration it ran with. A run is incremental unless a
//! full sync is requested, nothing ran before, the configuration changed, or
//! the policy reaches further back than the previous full run.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde::Serialize;
use uuid::Uuid;

use crate::context::{SyncPolicy, TaskContext};
use crate::entity::subtask_state::{ActiveModel, Column, Entity as SubtaskState, Model};
use crate::error::Result;

/// Decide whether a subtask runs incrementally, and from when.
///
/// `prev` is the stored state, `config` the JSON of the current subtask
/// configuration.
pub fn decide_subtask_mode(
    policy: &SyncPolicy,
    prev: Option<&Model>,
    config: &str,
) -> (bool, Option<DateTime<Utc>>) {
    let full = (false, policy.time_after);
    if policy.full_sync {
        return full;
    }
    let Some(prev) = prev else {
        return full;
    };
    let Some(prev_started_at) = prev.prev_started_at else {
        return full;
    };
    if !prev.prev_config.is_empty() && prev.prev_config != config {
        return full;
    }
    if let (Some(requested), Some(covered)) = (policy.time_after, prev.time_after)
        && requested < covered
    {
        return full;
    }
    (true, Some(prev_started_at))
}

/// Loads and stores the state of one subtask run.
#[derive(Debug, Clone)]
pub struct SubtaskStateManager {
    ctx: TaskContext,
    params: String,
    previous: Option<Model>,
    policy: SyncPolicy,
    incremental: bool,
    since: Option<DateTime<Utc>>,
    until: DateTime<Utc>,
    config: String,
}

impl SubtaskStateManager {
    /// Load the previous state of the context's plugin and subtask for
    /// `params`. The run is considered started now.
    pub async fn new<C: Serialize + ?Sized>(ctx: &TaskContext, params: &str, config: &C) -> Result<Self> {
        let policy = ctx.sync_policy().cloned().unwrap_or_default();
        let config = serde_json::to_string(config)?;
        let previous = SubtaskState::find()
            .filter(Column::Plugin.eq(ctx.plugin()))
            .filter(Column::Subtask.eq(ctx.subtask()))
            .filter(Column::Params.eq(params))
            .one(ctx.db())
            .await?;

        let (incremental, since) = decide_subtask_mode(&policy, previous.as_ref(), &config);
        let since = since.or_else(|| previous.as_ref().and_then(|p| p.time_after));

        tracing::info!(
            plugin = ctx.plugin(),
            subtask = ctx.subtask(),
            incremental,
            since = ?since,
            "Loaded subtask state"
        );

        Ok(Self {
            ctx: ctx.clone(),
            params: params.to_string(),
            previous,
            policy,
            incremental,
            since,
            until: Utc::now(),
            config,
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental
    }

    /// Start of the time range to process.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    /// End of the time range to process, the start of this run.
    pub fn until(&self) -> DateTime<Utc> {
        self.until
    }

    /// Record a successful run.
    pub async fn close(self) -> Result<Model> {
        let time_after = match (self.incremental, self.policy.time_after) {
            (false, Some(after)) => Some(after),
            _ => self.previous.as_ref().and_then(|p| p.time_after),
        };
        let now = Utc::now();

        let saved = match self.previous {
            Some(previous) => {
                let mut model: ActiveModel = previous.into();
                model.time_after = Set(time_after);
                model.prev_started_at = Set(Some(self.until));
                model.prev_config = Set(self.config);
                model.updated_at = Set(now);
                model.update(self.ctx.db()).await?
            }
            None => {
                ActiveModel {
                    id: Set(Uuid::new_v4()),
                    plugin: Set(self.ctx.plugin().to_string()),
                    subtask: Set(self.ctx.subtask().to_string()),
                    params: Set(self.params),
                    time_after: Set(time_after),
                    prev_started_at: Set(Some(self.until)),
                    prev_config: Set(self.config),
                    updated_at: Set(now),
                }
                .insert(self.ctx.db())
                .await?
            }
        };
        Ok(saved)
    }
}
