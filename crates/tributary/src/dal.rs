//! Dynamic-table data access on top of sea-orm.
//!
//! Raw, tool-layer and domain-layer tables are named at runtime by plugins, so
//! they cannot be typed sea-orm entities. This module builds sea-query
//! statements against those tables instead:
//!
//! - [`Dal::cursor`] iterates rows in ascending key order with keyset paging
//! - [`Dal::insert_rows`] / [`Dal::upsert_rows`] write JSON rows in bulk
//! - [`Dal::delete`] / [`Dal::count`] apply a conjunctive [`Filter`]
//!
//! # Example
//!
//! ```ignore
//! use tributary::dal::{Filter, RowQuery};
//!
//! let filter = Filter::new().eq("params", params.clone());
//! let mut cursor = dal.cursor(RowQuery::new("_raw_github_issues").filter(filter));
//! while let Some(row) = cursor.next().await? {
//!     let raw = RawRecord::from_query_result(&row, "")?;
//! }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use sea_orm::sea_query::{
    Alias, Asterisk, ColumnDef, Condition, Expr, Index, OnConflict, Order, Query, SimpleExpr,
    Table,
};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, QueryResult, Statement, StatementBuilder,
    Value,
};
use serde_json::Value as JsonValue;

use crate::collector::raw::{NewRawRecord, RawRecord};
use crate::error::{HarvestError, Result};

/// A record serialized into column/value pairs.
pub type Row = serde_json::Map<String, JsonValue>;

/// Rows fetched per round-trip by [`RowCursor`].
pub const CURSOR_PAGE_SIZE: u64 = 500;

/// Maximum rows per insert statement.
///
/// Keeps bound parameters under SQLite's limit for wide rows.
pub const INSERT_CHUNK_SIZE: usize = 100;

// ─── Filters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    In(String, Vec<Value>),
    IsNull(String),
}

/// Conjunction of simple column predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn gt(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gt(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Gte(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn lt(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Lt(column.into(), value.into()));
        self
    }

    #[must_use]
    pub fn is_in<V: Into<Value>>(
        mut self,
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(Clause::In(
            column.into(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    #[must_use]
    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.clauses.push(Clause::IsNull(column.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    fn condition(&self) -> Condition {
        self.clauses
            .iter()
            .fold(Condition::all(), |cond, clause| {
                let expr: SimpleExpr = match clause {
                    Clause::Eq(c, v) => Expr::col(Alias::new(c)).eq(v.clone()),
                    Clause::Gt(c, v) => Expr::col(Alias::new(c)).gt(v.clone()),
                    Clause::Gte(c, v) => Expr::col(Alias::new(c)).gte(v.clone()),
                    Clause::Lt(c, v) => Expr::col(Alias::new(c)).lt(v.clone()),
                    Clause::In(c, vs) => Expr::col(Alias::new(c)).is_in(vs.clone()),
                    Clause::IsNull(c) => Expr::col(Alias::new(c)).is_null(),
                };
                cond.add(expr)
            })
    }
}

/// Rows of one table, filtered and ordered by a unique key column.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub table: String,
    pub filter: Filter,
    /// Unique, sortable column used for keyset paging.
    pub order_by: String,
}

impl RowQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::new(),
            order_by: "id".to_string(),
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = column.into();
        self
    }
}

// ─── Cursor ─────────────────────────────────────────────────────────────────

/// Streams rows in ascending key order.
///
/// Rows are fetched in pages of [`CURSOR_PAGE_SIZE`] using `key > last_key`,
/// so no connection is held between calls and concurrent writers on the same
/// connection pool never deadlock against an open cursor.
pub struct RowCursor {
    dal: Dal,
    query: RowQuery,
    page_size: u64,
    buffer: VecDeque<QueryResult>,
    last_key: Option<Value>,
    exhausted: bool,
}

impl RowCursor {
    /// Fetch the next row, or `None` once the query is drained.
    pub async fn next(&mut self) -> Result<Option<QueryResult>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_page().await?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let mut condition = self.query.filter.condition();
        if let Some(last) = &self.last_key {
            condition = condition.add(Expr::col(Alias::new(&self.query.order_by)).gt(last.clone()));
        }
        let select = Query::select()
            .column(Asterisk)
            .from(Alias::new(&self.query.table))
            .cond_where(condition)
            .order_by(Alias::new(&self.query.order_by), Order::Asc)
            .limit(self.page_size)
            .to_owned();

        let rows = self
            .dal
            .db
            .query_all(self.dal.build(&select))
            .await?;

        if (rows.len() as u64) < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_key = Some(key_value(last, &self.query.order_by)?);
        }
        self.buffer.extend(rows);
        Ok(())
    }
}

/// Read a key column as either an integer or a string.
fn key_value(row: &QueryResult, column: &str) -> Result<Value> {
    if let Ok(v) = row.try_get::<i64>("", column) {
        return Ok(Value::from(v));
    }
    row.try_get::<String>("", column)
        .map(Value::from)
        .map_err(|e| HarvestError::internal(format!("unusable cursor key {column}: {e}")))
}

// ─── Dal ────────────────────────────────────────────────────────────────────

/// Data access layer for tables named at runtime.
#[derive(Debug, Clone)]
pub struct Dal {
    db: Arc<DatabaseConnection>,
}

impl Dal {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.db.get_database_backend()
    }

    fn build<S: StatementBuilder>(&self, statement: &S) -> Statement {
        self.backend().build(statement)
    }

    /// Iterate rows matching `query` in ascending `order_by` order.
    pub fn cursor(&self, query: RowQuery) -> RowCursor {
        self.cursor_with_page_size(query, CURSOR_PAGE_SIZE)
    }

    pub fn cursor_with_page_size(&self, query: RowQuery, page_size: u64) -> RowCursor {
        RowCursor {
            dal: self.clone(),
            query,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
        }
    }

    /// Count rows matching `filter`.
    pub async fn count(&self, table: &str, filter: &Filter) -> Result<u64> {
        let select = Query::select()
            .expr_as(Expr::col(Asterisk).count(), Alias::new("count"))
            .from(Alias::new(table))
            .cond_where(filter.condition())
            .to_owned();

        let row = self
            .db
            .query_one(self.build(&select))
            .await?
            .ok_or_else(|| HarvestError::internal(format!("count on {table} returned no row")))?;
        let count: i64 = row.try_get("", "count")?;
        Ok(count.max(0) as u64)
    }

    /// Delete rows matching `filter`. Returns the number of deleted rows.
    pub async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        let delete = Query::delete()
            .from_table(Alias::new(table))
            .cond_where(filter.condition())
            .to_owned();
        let result = self.db.execute(self.build(&delete)).await?;
        Ok(result.rows_affected())
    }

    /// Insert rows, failing on duplicate keys.
    pub async fn insert_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.write_rows(table, rows, None).await
    }

    /// Insert rows, updating every non-key column when `key_columns` conflict.
    pub async fn upsert_rows(&self, table: &str, key_columns: &[&str], rows: &[Row]) -> Result<u64> {
        if key_columns.is_empty() {
            return Err(HarvestError::internal(format!(
                "upsert into {table} requires key columns"
            )));
        }
        self.write_rows(table, rows, Some(key_columns)).await
    }

    async fn write_rows(
        &self,
        table: &str,
        rows: &[Row],
        key_columns: Option<&[&str]>,
    ) -> Result<u64> {
        // Union of keys in first-seen order; a row missing a column writes NULL.
        let mut seen = HashSet::new();
        let columns: Vec<&str> = rows
            .iter()
            .flat_map(|row| row.keys())
            .map(String::as_str)
            .filter(|column| seen.insert(*column))
            .collect();
        if columns.is_empty() {
            return Ok(0);
        }

        let mut affected = 0;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let mut insert = Query::insert();
            insert
                .into_table(Alias::new(table))
                .columns(columns.iter().map(|c| Alias::new(*c)));

            for row in chunk {
                let values = columns
                    .iter()
                    .map(|c| SimpleExpr::from(json_to_value(row.get(*c).unwrap_or(&JsonValue::Null))));
                insert
                    .values(values)
                    .map_err(|e| HarvestError::internal(format!("invalid row for {table}: {e}")))?;
            }

            if let Some(keys) = key_columns {
                let updates: Vec<Alias> = columns
                    .iter()
                    .filter(|c| !keys.contains(c))
                    .map(|c| Alias::new(*c))
                    .collect();
                let mut on_conflict = OnConflict::columns(keys.iter().map(|k| Alias::new(*k)));
                if updates.is_empty() {
                    on_conflict.do_nothing();
                } else {
                    on_conflict.update_columns(updates);
                }
                insert.on_conflict(on_conflict);
            }

            let result = self.db.execute(self.build(&insert)).await?;
            affected += result.rows_affected();
        }

        Ok(affected)
    }

    // ─── Raw tables ─────────────────────────────────────────────────────────

    /// Create a raw table (and its params index) if it does not exist yet.
    pub async fn ensure_raw_table(&self, table: &str) -> Result<()> {
        let mut id = ColumnDef::new(Alias::new("id"));
        match self.backend() {
            // Only `integer primary key` aliases the rowid in SQLite.
            DatabaseBackend::Sqlite => id.integer(),
            _ => id.big_integer(),
        };
        id.not_null().auto_increment().primary_key();

        let create = Table::create()
            .table(Alias::new(table))
            .if_not_exists()
            .col(&mut id)
            .col(ColumnDef::new(Alias::new("params")).string().not_null())
            .col(ColumnDef::new(Alias::new("data")).blob().not_null())
            .col(ColumnDef::new(Alias::new("url")).text().not_null())
            .col(ColumnDef::new(Alias::new("input")).blob().null())
            .col(
                ColumnDef::new(Alias::new("created_at"))
                    .timestamp_with_time_zone()
                    .not_null(),
            )
            .to_owned();
        self.db.execute(self.build(&create)).await?;

        let index = Index::create()
            .if_not_exists()
            .name(format!("idx_{}_params", table.trim_start_matches('_')))
            .table(Alias::new(table))
            .col(Alias::new("params"))
            .to_owned();
        self.db.execute(self.build(&index)).await?;

        Ok(())
    }

    /// Append raw records to a raw table.
    pub async fn insert_raw(&self, table: &str, records: Vec<NewRawRecord>) -> Result<u64> {
        let mut affected = 0;
        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut insert = Query::insert();
            insert.into_table(Alias::new(table)).columns([
                Alias::new("params"),
                Alias::new("data"),
                Alias::new("url"),
                Alias::new("input"),
                Alias::new("created_at"),
            ]);
            for record in chunk {
                insert
                    .values([
                        SimpleExpr::from(record.params.clone()),
                        SimpleExpr::from(record.data.clone()),
                        SimpleExpr::from(record.url.clone()),
                        SimpleExpr::from(record.input.clone()),
                        SimpleExpr::from(record.created_at),
                    ])
                    .map_err(|e| HarvestError::internal(format!("invalid raw row: {e}")))?;
            }
            let result = self.db.execute(self.build(&insert)).await?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    /// Load every raw record matching `filter`, in id order.
    ///
    /// Meant for small result sets such as tests and diagnostics; use
    /// [`Dal::cursor`] for streaming.
    pub async fn raw_records(&self, table: &str, filter: Filter) -> Result<Vec<RawRecord>> {
        use sea_orm::FromQueryResult;

        let mut cursor = self.cursor(RowQuery::new(table).filter(filter));
        let mut records = Vec::new();
        while let Some(row) = cursor.next().await? {
            records.push(RawRecord::from_query_result(&row, "")?);
        }
        Ok(records)
    }
}

/// Read every column of a query result into a [`Row`].
///
/// Column types follow the driver's JSON mapping: integers and reals become
/// numbers, text becomes strings.
pub fn query_result_to_row(result: &QueryResult) -> Result<Row> {
    use sea_orm::FromQueryResult;

    match JsonValue::from_query_result(result, "")? {
        JsonValue::Object(row) => Ok(row),
        other => Err(HarvestError::internal(format!(
            "query result decoded to {other} instead of an object"
        ))),
    }
}

/// Convert a JSON value into a bindable database value.
///
/// Objects and arrays are bound as JSON; everything else maps to the closest
/// scalar type.
pub fn json_to_value(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::String(None),
        JsonValue::Bool(b) => Value::from(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        JsonValue::String(s) => Value::from(s.clone()),
        JsonValue::Array(_) | JsonValue::Object(_) => Value::Json(Some(Box::new(value.clone()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    async fn memory_dal() -> Dal {
        let db = crate::db::connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        Dal::new(Arc::new(db))
    }

    async fn create_people(dal: &Dal) {
        dal.connection()
            .execute_unprepared(
                "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT NOT NULL, team TEXT)",
            )
            .await
            .expect("create table");
    }

    fn person(id: i64, name: &str, team: &str) -> Row {
        json!({ "id": id, "name": name, "team": team })
            .as_object()
            .cloned()
            .expect("object")
    }

    #[test]
    fn json_to_value_maps_scalars() {
        assert_eq!(json_to_value(&json!(true)), Value::from(true));
        assert_eq!(json_to_value(&json!(7)), Value::from(7i64));
        assert_eq!(json_to_value(&json!(1.5)), Value::from(1.5f64));
        assert_eq!(json_to_value(&json!("x")), Value::from("x".to_string()));
        assert_eq!(json_to_value(&JsonValue::Null), Value::String(None));
        assert!(matches!(json_to_value(&json!({"a": 1})), Value::Json(Some(_))));
    }

    #[tokio::test]
    async fn insert_count_and_delete_rows() {
        let dal = memory_dal().await;
        create_people(&dal).await;

        let rows = vec![person(1, "ada", "core"), person(2, "bob", "web"), person(3, "cy", "core")];
        assert_eq!(dal.insert_rows("people", &rows).await.expect("insert"), 3);

        let core = Filter::new().eq("team", "core");
        assert_eq!(dal.count("people", &core).await.expect("count"), 2);
        assert_eq!(dal.delete("people", &core).await.expect("delete"), 2);
        assert_eq!(dal.count("people", &Filter::new()).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn later_rows_may_add_columns() {
        let dal = memory_dal().await;
        create_people(&dal).await;

        let first: Row = json!({ "id": 1, "name": "ada" })
            .as_object()
            .cloned()
            .expect("object");
        let rows = vec![first, person(2, "bob", "web")];
        assert_eq!(dal.insert_rows("people", &rows).await.expect("insert"), 2);

        assert_eq!(
            dal.count("people", &Filter::new().eq("team", "web"))
                .await
                .expect("count"),
            1
        );
        assert_eq!(
            dal.count("people", &Filter::new().eq("name", "ada"))
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn insert_fails_on_duplicate_key_but_upsert_updates() {
        let dal = memory_dal().await;
        create_people(&dal).await;

        dal.insert_rows("people", &[person(1, "ada", "core")])
            .await
            .expect("first insert");
        dal.insert_rows("people", &[person(1, "ada", "web")])
            .await
            .expect_err("duplicate insert should fail");

        dal.upsert_rows("people", &["id"], &[person(1, "ada", "web")])
            .await
            .expect("upsert");
        assert_eq!(
            dal.count("people", &Filter::new().eq("team", "web"))
                .await
                .expect("count"),
            1
        );
    }

    #[tokio::test]
    async fn cursor_pages_in_ascending_order() {
        let dal = memory_dal().await;
        create_people(&dal).await;
        let rows: Vec<Row> = [5, 1, 4, 2, 3]
            .into_iter()
            .map(|i| person(i, &format!("p{i}"), if i % 2 == 0 { "even" } else { "odd" }))
            .collect();
        dal.insert_rows("people", &rows).await.expect("insert");

        let mut cursor = dal.cursor_with_page_size(RowQuery::new("people"), 2);
        let mut ids = Vec::new();
        while let Some(row) = cursor.next().await.expect("next row") {
            ids.push(row.try_get::<i64>("", "id").expect("id"));
        }
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let mut odd = dal.cursor_with_page_size(
            RowQuery::new("people").filter(Filter::new().eq("team", "odd")),
            1,
        );
        let mut names = Vec::new();
        while let Some(row) = odd.next().await.expect("next row") {
            names.push(row.try_get::<String>("", "name").expect("name"));
        }
        assert_eq!(names, vec!["p1", "p3", "p5"]);
    }

    #[tokio::test]
    async fn raw_table_round_trip() {
        let dal = memory_dal().await;
        dal.ensure_raw_table("_raw_test_items").await.expect("create");
        dal.ensure_raw_table("_raw_test_items")
            .await
            .expect("create is idempotent");

        let now = Utc::now();
        let records = (0..3)
            .map(|i| NewRawRecord {
                params: if i < 2 { "{\"repo\":1}" } else { "{\"repo\":2}" }.to_string(),
                data: format!("{{\"n\":{i}}}").into_bytes(),
                url: format!("https://api.example.com/items?page={i}"),
                input: None,
                created_at: now,
            })
            .collect();
        assert_eq!(dal.insert_raw("_raw_test_items", records).await.expect("insert"), 3);

        let repo1 = dal
            .raw_records("_raw_test_items", Filter::new().eq("params", "{\"repo\":1}"))
            .await
            .expect("load");
        assert_eq!(repo1.len(), 2);
        assert!(repo1[0].id < repo1[1].id);
        assert_eq!(repo1[1].data, b"{\"n\":1}".to_vec());
        assert!(repo1[0].input.is_none());
    }
}
