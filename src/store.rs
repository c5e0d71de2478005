//! Relational store adapter.
//!
//! Read access to the allow-listed tables: listing, schema introspection,
//! bounded previews and execution of gate-validated queries. Rows come back
//! as JSON objects; BLOB cells are base64 text.

use base64::Engine;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, SqlitePool, TypeInfo, ValueRef};

use crate::error::{Error, Result};
use crate::gate::{QueryGate, QueryPolicy, ValidatedQuery};
use crate::models::Row;

#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub table: String,
    pub row_count: i64,
    pub schema_uri: String,
    pub preview_uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub declared_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexInfo>,
}

/// Result of an ad-hoc query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub row_count: usize,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct RelationalStore {
    pool: SqlitePool,
    gate: QueryGate,
}

impl RelationalStore {
    pub fn new(pool: SqlitePool, policy: QueryPolicy) -> Self {
        Self {
            pool,
            gate: QueryGate::new(policy),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn gate(&self) -> &QueryGate {
        &self.gate
    }

    fn require_allowed(&self, table: &str) -> Result<String> {
        if self.gate.policy().is_allowed(table) {
            Ok(table.to_ascii_lowercase())
        } else {
            Err(Error::UnknownTable(table.to_string()))
        }
    }

    /// Allow-listed tables with their row counts and resource URIs.
    pub async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        let mut tables = Vec::new();
        for table in self.gate.policy().allowed_tables() {
            // Allow-listed names are plain identifiers.
            let (row_count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{}\"", table))
                .fetch_one(&self.pool)
                .await?;
            tables.push(TableDescriptor {
                table: table.to_string(),
                row_count,
                schema_uri: format!("db://schema/{}", table),
                preview_uri: format!("db://preview/{}?limit=50", table),
            });
        }
        Ok(tables)
    }

    pub async fn describe(&self, table: &str) -> Result<TableSchema> {
        let table = self.require_allowed(table)?;

        let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
            sqlx::query_as(&format!("PRAGMA table_info(\"{}\")", table))
                .fetch_all(&self.pool)
                .await?;
        if columns.is_empty() {
            return Err(Error::UnknownTable(table));
        }

        let mut pk: Vec<(i64, String)> = columns
            .iter()
            .filter(|c| c.5 > 0)
            .map(|c| (c.5, c.1.clone()))
            .collect();
        pk.sort();

        let columns = columns
            .into_iter()
            .map(|(_cid, name, declared_type, notnull, default, pk)| ColumnInfo {
                name,
                declared_type,
                nullable: notnull == 0 && pk == 0,
                default,
                primary_key: pk > 0,
            })
            .collect();

        let mut foreign_keys = Vec::new();
        let fk_rows = sqlx::query(&format!("PRAGMA foreign_key_list(\"{}\")", table))
            .fetch_all(&self.pool)
            .await?;
        for row in fk_rows {
            foreign_keys.push(ForeignKey {
                column: row.try_get("from")?,
                references_table: row.try_get("table")?,
                references_column: row.try_get("to")?,
            });
        }

        let mut indexes = Vec::new();
        let index_rows = sqlx::query(&format!("PRAGMA index_list(\"{}\")", table))
            .fetch_all(&self.pool)
            .await?;
        for row in index_rows {
            let name: String = row.try_get("name")?;
            let unique: i64 = row.try_get("unique")?;
            let cols: Vec<(i64, i64, Option<String>)> =
                sqlx::query_as(&format!("PRAGMA index_info(\"{}\")", name.replace('"', "\"\"")))
                    .fetch_all(&self.pool)
                    .await?;
            indexes.push(IndexInfo {
                name,
                unique: unique != 0,
                columns: cols.into_iter().filter_map(|(_, _, c)| c).collect(),
            });
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(TableSchema {
            table,
            columns,
            primary_key: pk.into_iter().map(|(_, name)| name).collect(),
            foreign_keys,
            indexes,
        })
    }

    /// At most `min(limit, max_rows)` rows of `table`, in rowid order.
    pub async fn preview(&self, table: &str, limit: Option<u32>) -> Result<Vec<Row>> {
        let table = self.require_allowed(table)?;
        let query = self
            .gate
            .validate(&format!("SELECT * FROM {} ORDER BY rowid", table), limit)?;
        self.execute(&query).await
    }

    /// Validate and run ad-hoc query text.
    pub async fn query(&self, raw: &str, limit: Option<u32>) -> Result<QueryOutput> {
        let query = self.gate.validate(raw, limit)?;
        tracing::debug!(tables = ?query.tables(), limit = query.limit(), "running validated query");
        let rows = self.execute(&query).await?;
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        Ok(QueryOutput {
            columns,
            row_count: rows.len(),
            rows,
            limit: query.limit(),
        })
    }

    /// Run a query the gate has already accepted.
    pub async fn execute(&self, query: &ValidatedQuery) -> Result<Vec<Row>> {
        let rows = sqlx::query(query.sql())
            .fetch_all(&self.pool)
            .await
            .map_err(|source| Error::QueryExecution {
                query: query.statement().to_string(),
                source,
            })?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// Convert a row to a JSON object, dispatching on each cell's storage class.
pub(crate) fn row_to_json(row: &SqliteRow) -> Row {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => serde_json::Value::Null,
            Ok(raw) => {
                let storage = raw.type_info().name().to_string();
                cell_to_json(row, i, &storage)
            }
            Err(_) => serde_json::Value::Null,
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

fn cell_to_json(row: &SqliteRow, i: usize, storage: &str) -> serde_json::Value {
    match storage {
        "INTEGER" | "BOOLEAN" => row
            .try_get_unchecked::<i64, _>(i)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "REAL" | "NUMERIC" => row
            .try_get_unchecked::<f64, _>(i)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(i)
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes).into())
            .unwrap_or(serde_json::Value::Null),
        _ => row
            .try_get_unchecked::<String, _>(i)
            .map(serde_json::Value::from)
            .unwrap_or(serde_json::Value::Null),
    }
}
