//! Collectors sharing one incremental state.

use chrono::{DateTime, Utc};

use crate::collector::api_collector::{ApiCollector, ApiCollectorArgs};
use crate::collector::graphql_collector::{GraphqlCollector, GraphqlCollectorArgs};
use crate::collector::state::CollectorStateManager;
use crate::collector::RawDataSubTaskArgs;
use crate::error::{HarvestError, Result};

enum Collector {
    Api(ApiCollector),
    Graphql(GraphqlCollector),
}

/// Runs one or more collectors of the same raw table and params, and
/// records the high-water mark once all of them succeeded.
///
/// ```ignore
/// let mut stateful = StatefulApiCollector::new(raw.clone()).await?;
/// let since = stateful.since();
/// stateful.add_collector(
///     ApiCollectorArgs::new(raw, client, "issues", parser)
///         .query(Arc::new(move |data| Ok(updated_since(data, since)))),
/// )?;
/// stateful.execute().await?;
/// ```
pub struct StatefulApiCollector {
    raw: RawDataSubTaskArgs,
    state: CollectorStateManager,
    collectors: Vec<Collector>,
}

impl std::fmt::Debug for StatefulApiCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulApiCollector")
            .field("table", &self.raw.table)
            .field("state", &self.state.decision())
            .field("collectors", &self.collectors.len())
            .finish()
    }
}

impl StatefulApiCollector {
    pub async fn new(raw: RawDataSubTaskArgs) -> Result<Self> {
        let state = CollectorStateManager::new(&raw.ctx, &raw.table, &raw.params_string()).await?;
        Ok(Self {
            raw,
            state,
            collectors: Vec::new(),
        })
    }

    pub fn is_incremental(&self) -> bool {
        self.state.is_incremental()
    }

    /// Lower bound for query builders, e.g. an `updated_since` parameter.
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.state.since()
    }

    pub fn raw_args(&self) -> &RawDataSubTaskArgs {
        &self.raw
    }

    pub fn state(&self) -> &CollectorStateManager {
        &self.state
    }

    /// Add a REST collector. Its incremental flag is taken from the state.
    pub fn add_collector(&mut self, args: ApiCollectorArgs) -> Result<()> {
        self.check_target(&args.raw)?;
        let incremental = self.is_incremental();
        let collector = ApiCollector::new(args.incremental(incremental))?;
        self.collectors.push(Collector::Api(collector));
        Ok(())
    }

    /// Add a GraphQL collector. Its incremental flag is taken from the state.
    pub fn add_graphql_collector(&mut self, args: GraphqlCollectorArgs) -> Result<()> {
        self.check_target(&args.raw)?;
        let incremental = self.is_incremental();
        let collector = GraphqlCollector::new(args.incremental(incremental))?;
        self.collectors.push(Collector::Graphql(collector));
        Ok(())
    }

    fn check_target(&self, raw: &RawDataSubTaskArgs) -> Result<()> {
        if raw.table != self.raw.table || raw.params != self.raw.params {
            return Err(HarvestError::config(format!(
                "collector for {} {} does not match {} {}",
                raw.table,
                raw.params,
                self.raw.table,
                self.raw.params
            )));
        }
        Ok(())
    }

    /// Run every collector in order. The state is saved only when all of
    /// them succeed.
    pub async fn execute(self) -> Result<()> {
        if self.collectors.is_empty() {
            return Err(HarvestError::config(format!(
                "no collector added for {}",
                self.raw.table
            )));
        }
        for collector in self.collectors {
            match collector {
                Collector::Api(c) => c.execute().await?,
                Collector::Graphql(c) => c.execute().await?,
            }
        }
        self.state.close().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "sqlite", feature = "migrate"))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use sea_orm::EntityTrait;
    use serde_json::json;

    use crate::client::{ApiClient, AsyncApiClient};
    use crate::collector::ParsedPage;
    use crate::collector::api_collector::{QueryBuilder, ResponseParser};
    use crate::context::{Shutdown, TaskContext};
    use crate::dal::Filter;
    use crate::entity::prelude::CollectorState;
    use crate::http::{HttpMethod, MockTransport};
    use crate::scheduler::WorkerScheduler;

    const BASE: &str = "https://api.example.com/";

    fn client(transport: &MockTransport) -> AsyncApiClient {
        let api = ApiClient::new(BASE, Arc::new(transport.clone())).expect("client");
        AsyncApiClient::from_parts(api, WorkerScheduler::new(2, None, Shutdown::new()), 0)
    }

    fn parser() -> ResponseParser {
        Arc::new(|r| ParsedPage::from_json(r, None))
    }

    async fn run(ctx: &TaskContext, transport: &MockTransport) -> Result<bool> {
        let raw = RawDataSubTaskArgs::new(ctx.clone(), "tickets", json!({"org": 1}))?;
        let mut stateful = StatefulApiCollector::new(raw.clone()).await?;
        let incremental = stateful.is_incremental();
        let since = stateful.since();
        let query: QueryBuilder = Arc::new(move |_| {
            Ok(since
                .map(|s| vec![("since".to_string(), s.timestamp().to_string())])
                .unwrap_or_default())
        });
        stateful.add_collector(
            ApiCollectorArgs::new(raw, client(transport), "tickets", parser())
                .page_size(0)
                .query(query),
        )?;
        stateful.execute().await?;
        Ok(incremental)
    }

    #[tokio::test]
    async fn second_run_is_incremental_and_keeps_rows() {
        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        let ctx = TaskContext::builder().database(db).build().expect("context");
        let transport = MockTransport::new();
        transport.push_response(HttpMethod::Get, format!("{BASE}tickets"), 200, r#"[{"id":1}]"#);

        assert!(!run(&ctx, &transport).await.expect("first run"));

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        let state = CollectorState::find()
            .one(ctx.db())
            .await
            .expect("query")
            .expect("state saved");
        let since = state.latest_success_start.expect("success start").timestamp();
        let url = format!("{BASE}tickets?since={since}");
        transport.push_response(HttpMethod::Get, url, 200, r#"[{"id":2}]"#);

        assert!(run(&ctx, &transport).await.expect("second run"));
        let rows = ctx
            .dal()
            .count("_raw_tickets", &Filter::new())
            .await
            .expect("count");
        assert_eq!(rows, 2);
    }

    #[tokio::test]
    async fn failed_run_does_not_save_state() {
        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        let ctx = TaskContext::builder().database(db).build().expect("context");
        let transport = MockTransport::new();
        transport.push_response(HttpMethod::Get, format!("{BASE}tickets"), 500, "down");
        transport.push_response(HttpMethod::Get, format!("{BASE}tickets"), 200, "[]");

        assert!(run(&ctx, &transport).await.is_err());
        assert!(!run(&ctx, &transport).await.expect("retry from scratch"));
    }

    #[tokio::test]
    async fn rejects_collectors_of_other_tables() {
        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        let ctx = TaskContext::builder().database(db).build().expect("context");
        let transport = MockTransport::new();

        let raw = RawDataSubTaskArgs::new(ctx.clone(), "tickets", json!({"org": 1})).expect("raw");
        let other = RawDataSubTaskArgs::new(ctx.clone(), "users", json!({"org": 1})).expect("raw");
        let mut stateful = StatefulApiCollector::new(raw).await.expect("stateful");
        let err = stateful
            .add_collector(ApiCollectorArgs::new(other, client(&transport), "users", parser()))
            .expect_err("mismatch");
        assert!(matches!(err, HarvestError::Config { .. }));
    }
}
