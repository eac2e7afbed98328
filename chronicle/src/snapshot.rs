//! Order-independent fingerprints of projected tables.
//!
//! Row hash: `SHA3-256(key ‖ 0x1F ‖ canonical_json(data))` in lowercase hex.
//! Table checksum: `SHA3-256` of the sorted row hashes joined by `\n`.
//! `canonical_json` writes object keys sorted at every depth and no
//! whitespace. `last_position` is not part of the hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Sha3_256};
use std::{collections::BTreeMap, fmt};

use crate::read_model::Row;

const KEY_SEPARATOR: u8 = 0x1F;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tables: Vec<TableSnapshot>,
}

impl ProjectionSnapshot {
    pub fn new(tables: Vec<TableSnapshot>) -> Self {
        Self {
            taken_at: Utc::now(),
            tables,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.iter().find(|table| table.table_name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub table_name: String,
    pub row_count: u64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rows: Option<Vec<Row>>,
}

impl TableSnapshot {
    pub fn new(table_name: impl Into<String>, row_count: u64, checksum: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            row_count,
            checksum: checksum.into(),
            sample_rows: None,
        }
    }

    /// Fingerprints `rows`, keeping the first `sample_size` rows by key.
    pub fn from_rows(table_name: impl Into<String>, rows: &[Row], sample_size: Option<usize>) -> Self {
        let sample_rows = sample_size.map(|size| {
            let mut sample = rows.to_vec();
            sample.sort_by(|a, b| a.key.cmp(&b.key));
            sample.truncate(size);
            sample
        });

        Self {
            table_name: table_name.into(),
            row_count: rows.len() as u64,
            checksum: table_checksum(rows),
            sample_rows,
        }
    }
}

pub fn row_hash(key: &str, data: &Value) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(key.as_bytes());
    hasher.update([KEY_SEPARATOR]);
    hasher.update(canonical_json(data).as_bytes());

    format!("{:x}", hasher.finalize())
}

pub fn table_checksum(rows: &[Row]) -> String {
    let mut hashes = rows
        .iter()
        .map(|row| row_hash(&row.key, &row.data))
        .collect::<Vec<_>>();

    hashes.sort();

    let mut hasher = Sha3_256::new();
    hasher.update(hashes.join("\n").as_bytes());

    format!("{:x}", hasher.finalize())
}

pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);

    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let sorted = fields.iter().collect::<BTreeMap<_, _>>();

            out.push('{');

            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }

                out.push_str(&Value::String(key.to_owned()).to_string());
                out.push(':');
                write_canonical(value, out);
            }

            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');

            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }

                write_canonical(item, out);
            }

            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Difference {
    MissingFromAfter {
        table: String,
    },
    MissingFromBefore {
        table: String,
    },
    RowCount {
        table: String,
        before: u64,
        after: u64,
    },
    Checksum {
        table: String,
        before: String,
        after: String,
    },
}

impl Difference {
    pub fn table(&self) -> &str {
        match self {
            Difference::MissingFromAfter { table }
            | Difference::MissingFromBefore { table }
            | Difference::RowCount { table, .. }
            | Difference::Checksum { table, .. } => table,
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::MissingFromAfter { table } => {
                write!(f, "{table}: present before, missing after")
            }
            Difference::MissingFromBefore { table } => {
                write!(f, "{table}: missing before, present after")
            }
            Difference::RowCount {
                table,
                before,
                after,
            } => write!(f, "{table}: row_count {before} -> {after}"),
            Difference::Checksum {
                table,
                before,
                after,
            } => write!(f, "{table}: checksum {before} -> {after}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    pub equal: bool,
    pub differences: Vec<Difference>,
}

/// Table-by-table diff of two snapshots.
///
/// A checksum difference is only reported for tables whose row counts agree.
pub fn compare(before: &ProjectionSnapshot, after: &ProjectionSnapshot) -> Comparison {
    let before_tables = by_name(before);
    let after_tables = by_name(after);
    let mut differences = Vec::new();

    for (name, left) in before_tables.iter() {
        let Some(right) = after_tables.get(name) else {
            differences.push(Difference::MissingFromAfter {
                table: name.to_string(),
            });
            continue;
        };

        if left.row_count != right.row_count {
            differences.push(Difference::RowCount {
                table: name.to_string(),
                before: left.row_count,
                after: right.row_count,
            });
        } else if left.checksum != right.checksum {
            differences.push(Difference::Checksum {
                table: name.to_string(),
                before: left.checksum.to_owned(),
                after: right.checksum.to_owned(),
            });
        }
    }

    for name in after_tables.keys() {
        if !before_tables.contains_key(name) {
            differences.push(Difference::MissingFromBefore {
                table: name.to_string(),
            });
        }
    }

    Comparison {
        equal: differences.is_empty(),
        differences,
    }
}

fn by_name(snapshot: &ProjectionSnapshot) -> BTreeMap<&str, &TableSnapshot> {
    snapshot
        .tables
        .iter()
        .map(|table| (table.table_name.as_str(), table))
        .collect()
}
