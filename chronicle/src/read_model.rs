use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use crate::error::{ProjectionError, Result};

/// One row of a projected table.
///
/// `last_position` is the global position of the last event that touched the
/// row; mutations coming from an event at or below it are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "pg", derive(sqlx::FromRow))]
pub struct Row {
    pub table_name: String,
    #[cfg_attr(feature = "pg", sqlx(rename = "row_key"))]
    pub key: String,
    pub data: Value,
    pub last_position: i64,
}

impl Row {
    pub fn to_data<D: DeserializeOwned>(&self) -> Result<D> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Integer field of `data`, 0 when missing.
    pub fn count(&self, field: &str) -> i64 {
        self.data.get(field).and_then(Value::as_i64).unwrap_or(0)
    }
}

/// A change a projector asks for in reaction to one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Replaces the whole row.
    Upsert {
        table: String,
        key: String,
        data: Value,
    },
    /// Overwrites the given top-level fields, creating the row if missing.
    Merge {
        table: String,
        key: String,
        data: Value,
    },
    /// Adds `by` to an integer field. A missing row starts as `{"key": key}`.
    Increment {
        table: String,
        key: String,
        field: String,
        by: i64,
    },
    Delete {
        table: String,
        key: String,
    },
}

impl Mutation {
    pub fn upsert(table: impl Into<String>, key: impl Into<String>, data: Value) -> Self {
        Self::Upsert {
            table: table.into(),
            key: key.into(),
            data,
        }
    }

    pub fn merge(table: impl Into<String>, key: impl Into<String>, data: Value) -> Self {
        Self::Merge {
            table: table.into(),
            key: key.into(),
            data,
        }
    }

    pub fn increment(
        table: impl Into<String>,
        key: impl Into<String>,
        field: impl Into<String>,
        by: i64,
    ) -> Self {
        Self::Increment {
            table: table.into(),
            key: key.into(),
            field: field.into(),
            by,
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Delete {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Upsert { table, .. }
            | Mutation::Merge { table, .. }
            | Mutation::Increment { table, .. }
            | Mutation::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Mutation::Upsert { key, .. }
            | Mutation::Merge { key, .. }
            | Mutation::Increment { key, .. }
            | Mutation::Delete { key, .. } => key,
        }
    }

    /// Shape checks that do not need the current row.
    pub fn check(&self) -> Result<()> {
        if self.key().is_empty() {
            return Err(ProjectionError::InvalidMutation(format!(
                "empty key for table {}",
                self.table()
            )));
        }

        match self {
            Mutation::Upsert { data, .. } | Mutation::Merge { data, .. } if !data.is_object() => {
                Err(ProjectionError::InvalidMutation(format!(
                    "{}#{} data must be an object",
                    self.table(),
                    self.key()
                )))
            }
            Mutation::Increment { field, .. } if field.is_empty() => Err(
                ProjectionError::InvalidMutation(format!("{}#{} empty field", self.table(), self.key())),
            ),
            _ => Ok(()),
        }
    }

    fn apply(self, current: Option<Row>, position: i64) -> Result<Option<Row>> {
        self.check()?;

        let row = match self {
            Mutation::Upsert { table, key, data } => Row {
                table_name: table,
                key,
                data,
                last_position: position,
            },
            Mutation::Merge { table, key, data } => {
                let mut merged = current
                    .and_then(|row| match row.data {
                        Value::Object(fields) => Some(fields),
                        _ => None,
                    })
                    .unwrap_or_default();

                if let Value::Object(fields) = data {
                    merged.extend(fields);
                }

                Row {
                    table_name: table,
                    key,
                    data: Value::Object(merged),
                    last_position: position,
                }
            }
            Mutation::Increment {
                table,
                key,
                field,
                by,
            } => {
                let mut fields = match current.map(|row| row.data) {
                    Some(Value::Object(fields)) => fields,
                    _ => {
                        let mut fields = Map::new();
                        fields.insert("key".to_owned(), Value::String(key.to_owned()));
                        fields
                    }
                };

                let value = match fields.get(&field) {
                    None | Some(Value::Null) => 0,
                    Some(value) => value.as_i64().ok_or_else(|| {
                        ProjectionError::InvalidMutation(format!(
                            "{table}#{key} field {field} is not an integer"
                        ))
                    })?,
                };

                let total = value.checked_add(by).ok_or_else(|| {
                    ProjectionError::InvalidMutation(format!(
                        "{table}#{key} field {field} overflows adding {by}"
                    ))
                })?;

                fields.insert(field, Value::from(total));

                Row {
                    table_name: table,
                    key,
                    data: Value::Object(fields),
                    last_position: position,
                }
            }
            Mutation::Delete { .. } => return Ok(None),
        };

        Ok(Some(row))
    }
}

/// `(table, key)` of a row.
pub type Slot = (String, String);

/// Folds the mutations of the event at `position` over the rows they touch.
///
/// `existing` holds the stored rows of those slots before the event. A slot
/// whose stored row was already written at or after `position` is left
/// alone; mutations of the same event on one slot chain on each other.
/// Returns the new content of every changed slot, `None` meaning deleted.
pub(crate) fn plan(
    existing: HashMap<Slot, Row>,
    position: i64,
    mutations: Vec<Mutation>,
) -> Result<BTreeMap<Slot, Option<Row>>> {
    let mut changes: BTreeMap<Slot, Option<Row>> = BTreeMap::new();

    for mutation in mutations {
        let slot = (mutation.table().to_owned(), mutation.key().to_owned());
        let stored = existing.get(&slot);

        if stored.is_some_and(|row| row.last_position >= position) {
            tracing::debug!(
                "skip mutation table='{}' key='{}' position='{position}', row already at '{}'",
                slot.0,
                slot.1,
                stored.map(|row| row.last_position).unwrap_or_default()
            );

            continue;
        }

        let current = match changes.get(&slot) {
            Some(staged) => staged.clone(),
            None => stored.cloned(),
        };

        let next = mutation.apply(current, position)?;
        changes.insert(slot, next);
    }

    Ok(changes)
}
