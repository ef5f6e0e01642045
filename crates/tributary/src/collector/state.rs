//! High-water mark of raw-table collections.
//!
//! A collection is identified by its raw table and params fingerprint. After
//! a successful run the start time of that run is stored, so the next run
//! only has to fetch what changed since then.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use crate::collector::raw::raw_table_name;
use crate::context::{SyncPolicy, TaskContext};
use crate::entity::collector_state::{ActiveModel, Column, Entity as CollectorState, Model};
use crate::error::Result;

/// Outcome of comparing the sync policy with the stored state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalDecision {
    /// Keep existing raw rows and only fetch newer data.
    pub incremental: bool,
    /// Lower bound for the data to fetch.
    pub since: Option<DateTime<Utc>>,
    /// `time_after` to store once the run succeeds.
    pub time_after: Option<DateTime<Utc>>,
}

/// Decide how a collection runs.
///
/// - full sync: everything from the policy's `time_after` (or the stored one)
/// - no successful run yet: everything from the policy's `time_after`
/// - the policy reaches further back than the stored data: same as a
///   first run
/// - otherwise: incremental from the start of the last successful run
pub fn decide_incremental(
    policy: Option<&SyncPolicy>,
    old: Option<&Model>,
) -> IncrementalDecision {
    let policy_after = policy.and_then(|p| p.time_after);
    let old_after = old.and_then(|o| o.time_after);

    if policy.is_some_and(|p| p.full_sync) {
        let since = policy_after.or(old_after);
        return IncrementalDecision {
            incremental: false,
            since,
            time_after: since,
        };
    }

    let Some(last_success) = old.and_then(|o| o.latest_success_start) else {
        return IncrementalDecision {
            incremental: false,
            since: policy_after,
            time_after: policy_after,
        };
    };

    let reaches_back = matches!(
        (policy_after, old_after),
        (Some(requested), Some(covered)) if requested < covered
    );
    if reaches_back {
        return IncrementalDecision {
            incremental: false,
            since: policy_after,
            time_after: policy_after,
        };
    }

    IncrementalDecision {
        incremental: true,
        since: Some(last_success),
        time_after: old_after,
    }
}

/// Loads and stores the state of one collection.
#[derive(Debug, Clone)]
pub struct CollectorStateManager {
    ctx: TaskContext,
    table: String,
    params: String,
    existing: Option<Model>,
    decision: IncrementalDecision,
    started_at: DateTime<Utc>,
}

impl CollectorStateManager {
    /// Load the stored state and decide how this run goes. The run is
    /// considered started now.
    pub async fn new(ctx: &TaskContext, table: &str, params: &str) -> Result<Self> {
        let started_at = Utc::now();
        let table = raw_table_name(table);
        let existing = CollectorState::find()
            .filter(Column::RawDataTable.eq(table.as_str()))
            .filter(Column::RawDataParams.eq(params))
            .one(ctx.db())
            .await?;

        let decision = decide_incremental(ctx.sync_policy(), existing.as_ref());
        tracing::info!(
            table = %table,
            params,
            incremental = decision.incremental,
            since = ?decision.since,
            "Loaded collector state"
        );

        Ok(Self {
            ctx: ctx.clone(),
            table,
            params: params.to_string(),
            existing,
            decision,
            started_at,
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.decision.incremental
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.decision.since
    }

    pub fn decision(&self) -> IncrementalDecision {
        self.decision
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Stored state as loaded, `None` before the first successful run.
    pub fn previous(&self) -> Option<&Model> {
        self.existing.as_ref()
    }

    /// Record a successful run.
    pub async fn close(self) -> Result<Model> {
        let now = Utc::now();
        let saved = match self.existing {
            Some(existing) => {
                let mut model: ActiveModel = existing.into();
                model.latest_success_start = Set(Some(self.started_at));
                model.created_date_after = Set(self.decision.since);
                model.time_after = Set(self.decision.time_after);
                model.updated_at = Set(now);
                model.update(self.ctx.db()).await?
            }
            None => {
                ActiveModel {
                    id: Set(Uuid::new_v4()),
                    raw_data_table: Set(self.table.clone()),
                    raw_data_params: Set(self.params.clone()),
                    latest_success_start: Set(Some(self.started_at)),
                    created_date_after: Set(self.decision.since),
                    time_after: Set(self.decision.time_after),
                    updated_at: Set(now),
                }
                .insert(self.ctx.db())
                .await?
            }
        };
        tracing::debug!(table = %self.table, params = %self.params, "Saved collector state");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().expect("valid date")
    }

    fn state(time_after: Option<DateTime<Utc>>, last: Option<DateTime<Utc>>) -> Model {
        Model {
            id: Uuid::nil(),
            raw_data_table: "_raw_issues".into(),
            raw_data_params: "{}".into(),
            latest_success_start: last,
            created_date_after: None,
            time_after,
            updated_at: t(28),
        }
    }

    fn policy(time_after: Option<DateTime<Utc>>, full_sync: bool) -> SyncPolicy {
        SyncPolicy {
            time_after,
            full_sync,
        }
    }

    fn decision(incremental: bool, since: Option<DateTime<Utc>>, time_after: Option<DateTime<Utc>>) -> IncrementalDecision {
        IncrementalDecision {
            incremental,
            since,
            time_after,
        }
    }

    #[test]
    fn incremental_decisions() {
        let (t0, t1, t2) = (t(1), t(2), t(3));
        let cases = [
            ("first run", None, None, decision(false, None, None)),
            (
                "second run",
                None,
                Some(state(None, Some(t1))),
                decision(true, Some(t1), None),
            ),
            (
                "policy after unbounded data",
                Some(policy(Some(t1), false)),
                Some(state(None, Some(t1))),
                decision(true, Some(t1), None),
            ),
            (
                "first run with time_after",
                Some(policy(Some(t1), false)),
                None,
                decision(false, Some(t1), Some(t1)),
            ),
            (
                "time_after moved forward",
                Some(policy(Some(t2), false)),
                Some(state(Some(t1), Some(t2))),
                decision(true, Some(t2), Some(t1)),
            ),
            (
                "time_after moved back",
                Some(policy(Some(t0), false)),
                Some(state(Some(t1), Some(t1))),
                decision(false, Some(t0), Some(t0)),
            ),
            (
                "time_after unchanged",
                Some(policy(Some(t1), false)),
                Some(state(Some(t1), Some(t2))),
                decision(true, Some(t2), Some(t1)),
            ),
            (
                "full sync keeps stored time_after",
                Some(policy(None, true)),
                Some(state(Some(t1), Some(t2))),
                decision(false, Some(t1), Some(t1)),
            ),
            (
                "full sync later",
                Some(policy(Some(t2), true)),
                Some(state(Some(t1), Some(t2))),
                decision(false, Some(t2), Some(t2)),
            ),
            (
                "full sync earlier",
                Some(policy(Some(t0), true)),
                Some(state(Some(t1), Some(t2))),
                decision(false, Some(t0), Some(t0)),
            ),
            (
                "full sync from scratch",
                Some(policy(None, true)),
                Some(state(None, Some(t2))),
                decision(false, None, None),
            ),
        ];

        for (name, policy, old, expected) in cases {
            assert_eq!(
                decide_incremental(policy.as_ref(), old.as_ref()),
                expected,
                "{name}"
            );
        }
    }

    #[test]
    fn state_without_success_is_a_first_run() {
        let old = state(Some(t(2)), None);
        assert_eq!(
            decide_incremental(None, Some(&old)),
            decision(false, None, None)
        );
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn close_makes_next_run_incremental() {
        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        let ctx = TaskContext::builder().database(db).build().expect("context");

        let first = CollectorStateManager::new(&ctx, "issues", r#"{"board":1}"#)
            .await
            .expect("load");
        assert!(!first.is_incremental());
        assert!(first.previous().is_none());
        let started = first.started_at();
        let saved = first.close().await.expect("close");
        assert_eq!(saved.raw_data_table, "_raw_issues");

        let second = CollectorStateManager::new(&ctx, "_raw_issues", r#"{"board":1}"#)
            .await
            .expect("load");
        assert!(second.is_incremental());
        let since = second.since().expect("since");
        assert!((since - started).num_milliseconds().abs() < 1);
        second.close().await.expect("close again");

        let rows = CollectorState::find().all(ctx.db()).await.expect("rows");
        assert_eq!(rows.len(), 1);

        let other = CollectorStateManager::new(&ctx, "issues", r#"{"board":2}"#)
            .await
            .expect("load");
        assert!(!other.is_incremental());
    }
}
