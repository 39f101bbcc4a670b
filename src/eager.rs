//! Eager loading of relations named through `with`.
//!
//! Each backend supplies a [`RelatedFetcher`]; the key matching and row
//! stitching is shared so that every backend nests related rows the same way.

use crate::context::Context;
use crate::error::DbResult;
use crate::models::{LoadPlan, LoadStrategy, Model, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

#[async_trait]
pub trait RelatedFetcher: Send + Sync {
    /// Rows of `table` whose `column` holds one of `values`.
    ///
    /// Rows with a non-null `scope_column` are excluded when it is set.
    async fn fetch_in(
        &self,
        ctx: &Context,
        table: &str,
        column: &str,
        values: &[Value],
        scope_column: Option<&str>,
    ) -> DbResult<Vec<Row>>;
}

/// Load plans for the requested relation names. Unknown names are skipped.
pub fn plans(model: &dyn Model, names: &[String]) -> Vec<LoadPlan> {
    if names.is_empty() {
        return Vec::new();
    }
    let relationships = model.relationships();
    names
        .iter()
        .filter_map(|name| match relationships.get(name) {
            Some(relationship) => Some(relationship.plan(name, model)),
            None => {
                warn!(
                    table = model.table_name(),
                    relation = %name,
                    "Unknown relation requested for eager loading"
                );
                None
            }
        })
        .collect()
}

/// Attach related rows to `rows` under each plan's name.
///
/// Single-valued relations get an object or `null`; many-valued relations get an array.
pub async fn load(
    ctx: &Context,
    fetcher: &dyn RelatedFetcher,
    plans: &[LoadPlan],
    rows: &mut [Row],
) -> DbResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    for plan in plans {
        debug!(relation = %plan.name, table = %plan.target.table, "Eager loading relation");
        match &plan.strategy {
            LoadStrategy::Direct {
                parent_column,
                related_column,
                many,
            } => {
                let keys = distinct_keys(rows, parent_column);
                let related = if keys.is_empty() {
                    Vec::new()
                } else {
                    fetcher
                        .fetch_in(
                            ctx,
                            &plan.target.table,
                            related_column,
                            &keys,
                            plan.target.soft_delete_column.as_deref(),
                        )
                        .await?
                };
                let grouped = group_by_key(related, related_column);
                for row in rows.iter_mut() {
                    let matches = row
                        .get(parent_column.as_str())
                        .and_then(key_of)
                        .and_then(|key| grouped.get(&key))
                        .cloned()
                        .unwrap_or_default();
                    row.insert(plan.name.clone(), nest(matches, *many));
                }
            }
            LoadStrategy::Pivot {
                join_table,
                parent_column,
                join_parent_column,
                join_related_column,
                related_column,
            } => {
                let keys = distinct_keys(rows, parent_column);
                let links = if keys.is_empty() {
                    Vec::new()
                } else {
                    fetcher
                        .fetch_in(ctx, join_table, join_parent_column, &keys, None)
                        .await?
                };
                let related_keys = distinct_keys(&links, join_related_column);
                let related = if related_keys.is_empty() {
                    Vec::new()
                } else {
                    fetcher
                        .fetch_in(
                            ctx,
                            &plan.target.table,
                            related_column,
                            &related_keys,
                            plan.target.soft_delete_column.as_deref(),
                        )
                        .await?
                };
                let by_key: HashMap<String, Row> = related
                    .into_iter()
                    .filter_map(|row| {
                        let key = row.get(related_column.as_str()).and_then(key_of)?;
                        Some((key, row))
                    })
                    .collect();

                let mut per_parent: HashMap<String, Vec<Row>> = HashMap::new();
                for link in &links {
                    let parent = link.get(join_parent_column.as_str()).and_then(key_of);
                    let target = link.get(join_related_column.as_str()).and_then(key_of);
                    if let (Some(parent), Some(target)) = (parent, target) {
                        if let Some(row) = by_key.get(&target) {
                            per_parent.entry(parent).or_default().push(row.clone());
                        }
                    }
                }
                for row in rows.iter_mut() {
                    let matches = row
                        .get(parent_column.as_str())
                        .and_then(key_of)
                        .and_then(|key| per_parent.get(&key))
                        .cloned()
                        .unwrap_or_default();
                    row.insert(plan.name.clone(), nest(matches, true));
                }
            }
        }
    }
    Ok(())
}

/// Comparable form of a key value. Numbers and numeric strings compare equal.
pub fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => i.to_string(),
            None => n.to_string(),
        }),
        other => Some(other.to_string()),
    }
}

fn distinct_keys(rows: &[Row], column: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter_map(|row| row.get(column))
        .filter(|value| key_of(value).is_some_and(|key| seen.insert(key)))
        .cloned()
        .collect()
}

fn group_by_key(rows: Vec<Row>, column: &str) -> HashMap<String, Vec<Row>> {
    let mut grouped: HashMap<String, Vec<Row>> = HashMap::new();
    for row in rows {
        if let Some(key) = row.get(column).and_then(key_of) {
            grouped.entry(key).or_default().push(row);
        }
    }
    grouped
}

fn nest(rows: Vec<Row>, many: bool) -> Value {
    if many {
        Value::Array(rows.into_iter().map(Value::Object).collect())
    } else {
        rows.into_iter()
            .next()
            .map(Value::Object)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relationship;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Author;
    struct Book;
    struct Tag;

    impl Model for Author {
        fn table_name(&self) -> &str {
            "authors"
        }
        fn id(&self) -> Value {
            Value::Null
        }
        fn set_id(&mut self, _: Value) {}
        fn relationships(&self) -> HashMap<String, Relationship> {
            HashMap::from([
                (
                    "books".to_string(),
                    Relationship::has_many(Book, "author_id", "id"),
                ),
                ("tags".to_string(), Relationship::belongs_to_many(Tag, "author_tags")),
            ])
        }
    }

    impl Model for Book {
        fn table_name(&self) -> &str {
            "books"
        }
        fn id(&self) -> Value {
            Value::Null
        }
        fn set_id(&mut self, _: Value) {}
    }

    impl Model for Tag {
        fn table_name(&self) -> &str {
            "tags"
        }
        fn id(&self) -> Value {
            Value::Null
        }
        fn set_id(&mut self, _: Value) {}
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[derive(Default)]
    struct FakeFetcher {
        tables: HashMap<&'static str, Vec<Row>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RelatedFetcher for FakeFetcher {
        async fn fetch_in(
            &self,
            _ctx: &Context,
            table: &str,
            column: &str,
            values: &[Value],
            _scope_column: Option<&str>,
        ) -> DbResult<Vec<Row>> {
            self.calls.lock().unwrap().push(table.to_string());
            let keys: Vec<String> = values.iter().filter_map(key_of).collect();
            Ok(self
                .tables
                .get(table)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|r| {
                    r.get(column)
                        .and_then(key_of)
                        .is_some_and(|k| keys.contains(&k))
                })
                .collect())
        }
    }

    #[test]
    fn test_unknown_relation_is_skipped() {
        let plans = plans(&Author, &["books".to_string(), "ghosts".to_string()]);
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].name, "books");
    }

    #[tokio::test]
    async fn test_has_many_nests_arrays() {
        let mut fetcher = FakeFetcher::default();
        fetcher.tables.insert(
            "books",
            vec![
                row(json!({"id": 10, "author_id": 1})),
                row(json!({"id": 11, "author_id": 1})),
                row(json!({"id": 12, "author_id": 3})),
            ],
        );
        let mut rows = vec![row(json!({"id": 1})), row(json!({"id": 2}))];
        let plans = plans(&Author, &["books".to_string()]);
        load(&Context::background(), &fetcher, &plans, &mut rows)
            .await
            .unwrap();

        assert_eq!(rows[0]["books"].as_array().unwrap().len(), 2);
        assert_eq!(rows[1]["books"], json!([]));
    }

    #[tokio::test]
    async fn test_pivot_goes_through_join_table() {
        let mut fetcher = FakeFetcher::default();
        fetcher.tables.insert(
            "author_tags",
            vec![
                row(json!({"author_id": 1, "tag_id": 7})),
                row(json!({"author_id": 1, "tag_id": 8})),
            ],
        );
        fetcher.tables.insert(
            "tags",
            vec![
                row(json!({"id": 7, "name": "rust"})),
                row(json!({"id": 8, "name": "sql"})),
            ],
        );
        let mut rows = vec![row(json!({"id": 1}))];
        let plans = plans(&Author, &["tags".to_string()]);
        load(&Context::background(), &fetcher, &plans, &mut rows)
            .await
            .unwrap();

        let tags = rows[0]["tags"].as_array().unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0]["name"], json!("rust"));
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec!["author_tags".to_string(), "tags".to_string()]
        );
    }

    #[test]
    fn test_key_of_normalizes_numbers() {
        assert_eq!(key_of(&json!(5)), Some("5".to_string()));
        assert_eq!(key_of(&json!("5")), Some("5".to_string()));
        assert_eq!(key_of(&Value::Null), None);
    }
}
