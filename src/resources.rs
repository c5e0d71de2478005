//! `db://` resources.
//!
//! Read-only views of the relational store addressable by URI:
//!
//! - `db://tables`: the table listing
//! - `db://schema/{table}`: one table's schema
//! - `db://preview/{table}?limit=N`: first rows (default 50)

use anyhow::{bail, Result};
use serde::Serialize;
use std::str::FromStr;

use crate::tools::ToolContext;

pub const DEFAULT_PREVIEW_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceUri {
    Tables,
    Schema(String),
    Preview { table: String, limit: u32 },
}

impl FromStr for ResourceUri {
    type Err = anyhow::Error;

    fn from_str(uri: &str) -> Result<Self> {
        let Some(rest) = uri.strip_prefix("db://") else {
            bail!("unsupported resource URI (expected db://...): {}", uri);
        };
        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        match path.split_once('/') {
            None if path == "tables" && query.is_none() => Ok(ResourceUri::Tables),
            Some(("schema", table)) if valid_table(table) && query.is_none() => {
                Ok(ResourceUri::Schema(table.to_string()))
            }
            Some(("preview", table)) if valid_table(table) => {
                let mut limit = DEFAULT_PREVIEW_LIMIT;
                for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some(("limit", value)) => {
                            limit = value
                                .parse()
                                .map_err(|_| anyhow::anyhow!("invalid limit in {}: {}", uri, value))?;
                        }
                        _ => bail!("unsupported query parameter in {}: {}", uri, pair),
                    }
                }
                Ok(ResourceUri::Preview {
                    table: table.to_string(),
                    limit,
                })
            }
            _ => bail!("unknown resource: {}", uri),
        }
    }
}

fn valid_table(table: &str) -> bool {
    !table.is_empty() && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A resource advertised to clients.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEntry {
    pub uri: String,
    pub name: String,
    pub description: String,
    pub mime_type: &'static str,
}

/// Every concrete resource: the listing plus schema and preview per table.
pub fn list_resources(ctx: &ToolContext) -> Vec<ResourceEntry> {
    let mut entries = vec![ResourceEntry {
        uri: "db://tables".to_string(),
        name: "tables".to_string(),
        description: "Queryable tables with row counts".to_string(),
        mime_type: "application/json",
    }];
    for table in ctx.store().gate().policy().allowed_tables() {
        entries.push(ResourceEntry {
            uri: format!("db://schema/{}", table),
            name: format!("{} schema", table),
            description: format!("Columns, keys and indexes of {}", table),
            mime_type: "application/json",
        });
        entries.push(ResourceEntry {
            uri: format!("db://preview/{}?limit={}", table, DEFAULT_PREVIEW_LIMIT),
            name: format!("{} preview", table),
            description: format!("First {} rows of {}", DEFAULT_PREVIEW_LIMIT, table),
            mime_type: "application/json",
        });
    }
    entries
}

/// Resolve a URI to its JSON document.
pub async fn read_resource(ctx: &ToolContext, uri: &str) -> Result<serde_json::Value> {
    let value = match uri.parse::<ResourceUri>()? {
        ResourceUri::Tables => {
            let tables = ctx.store().list_tables().await?;
            serde_json::json!({ "tables": tables })
        }
        ResourceUri::Schema(table) => serde_json::to_value(ctx.store().describe(&table).await?)?,
        ResourceUri::Preview { table, limit } => {
            let rows = ctx.store().preview(&table, Some(limit)).await?;
            serde_json::json!({ "table": table, "row_count": rows.len(), "rows": rows })
        }
    };
    Ok(value)
}
