//! Input iterators feeding collectors one item per fetch cycle.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::dal::{Dal, Row, RowCursor, RowQuery, query_result_to_row};
use crate::error::Result;

/// Source of input items for a collector.
#[async_trait]
pub trait InputIterator: Send {
    /// The next item, or `None` once exhausted.
    async fn next_input(&mut self) -> Result<Option<JsonValue>>;

    /// Release resources. Called once after the last item.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Items held in memory.
#[derive(Debug, Clone, Default)]
pub struct VecInputIterator {
    items: VecDeque<JsonValue>,
}

impl VecInputIterator {
    pub fn new(items: impl IntoIterator<Item = JsonValue>) -> Self {
        Self {
            items: items.into_iter().collect(),
        }
    }

    /// Serialize each item.
    pub fn from_serialize<T: Serialize>(items: &[T]) -> Result<Self> {
        let items = items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<VecDeque<_>, _>>()?;
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl InputIterator for VecInputIterator {
    async fn next_input(&mut self) -> Result<Option<JsonValue>> {
        Ok(self.items.pop_front())
    }
}

/// Maps a database row to an input item.
pub type RowMapper = Box<dyn Fn(Row) -> Result<JsonValue> + Send + Sync>;

/// Rows of a table streamed through a keyset cursor.
///
/// Without a mapper each row is yielded as a JSON object of its columns.
pub struct DalInputIterator {
    cursor: RowCursor,
    mapper: Option<RowMapper>,
}

impl std::fmt::Debug for DalInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DalInputIterator")
            .field("mapper", &self.mapper.is_some())
            .finish_non_exhaustive()
    }
}

impl DalInputIterator {
    pub fn new(dal: &Dal, query: RowQuery) -> Self {
        Self {
            cursor: dal.cursor(query),
            mapper: None,
        }
    }

    #[must_use]
    pub fn with_mapper(mut self, mapper: RowMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }
}

#[async_trait]
impl InputIterator for DalInputIterator {
    async fn next_input(&mut self) -> Result<Option<JsonValue>> {
        let Some(result) = self.cursor.next().await? else {
            return Ok(None);
        };
        let row = query_result_to_row(&result)?;
        match &self.mapper {
            Some(mapper) => mapper(row).map(Some),
            None => Ok(Some(JsonValue::Object(row))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn vec_iterator_yields_in_order() {
        #[derive(Serialize)]
        struct Issue {
            id: u32,
        }

        let mut iter = VecInputIterator::from_serialize(&[Issue { id: 1 }, Issue { id: 2 }])
            .expect("serialize");
        assert_eq!(iter.len(), 2);
        assert_eq!(iter.next_input().await.expect("next"), Some(json!({"id": 1})));
        assert_eq!(iter.next_input().await.expect("next"), Some(json!({"id": 2})));
        assert_eq!(iter.next_input().await.expect("next"), None);
        iter.close().await.expect("close");
    }

    #[cfg(all(feature = "sqlite", feature = "migrate"))]
    #[tokio::test]
    async fn dal_iterator_streams_and_maps_rows() {
        use sea_orm::ConnectionTrait;
        use std::sync::Arc;

        let db = crate::db::connect_and_migrate("sqlite::memory:")
            .await
            .expect("db");
        db.execute_unprepared("CREATE TABLE issues (id INTEGER PRIMARY KEY, issue_key TEXT)")
            .await
            .expect("table");
        db.execute_unprepared("INSERT INTO issues VALUES (2, 'B'), (1, 'A'), (3, 'C')")
            .await
            .expect("rows");
        let dal = Dal::new(Arc::new(db));

        let mut plain = DalInputIterator::new(&dal, RowQuery::new("issues"));
        let first = plain.next_input().await.expect("next").expect("row");
        assert_eq!(first["id"], 1);
        assert_eq!(first["issue_key"], "A");

        let mut keys = DalInputIterator::new(&dal, RowQuery::new("issues")).with_mapper(Box::new(
            |row| Ok(row.get("issue_key").cloned().unwrap_or(JsonValue::Null)),
        ));
        let mut seen = Vec::new();
        while let Some(key) = keys.next_input().await.expect("next") {
            seen.push(key);
        }
        assert_eq!(seen, vec![json!("A"), json!("B"), json!("C")]);
    }
}
