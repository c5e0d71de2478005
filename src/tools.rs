//! Tool surface for agents.
//!
//! Every capability an agent can invoke is a [`Tool`] in a [`ToolRegistry`].
//! The same registry backs the JSON API (`POST /tools/{name}`), the MCP
//! bridge, and nothing else: no natural-language routing happens here. The
//! agent picks a tool from the names and descriptions.
//!
//! | Tool | Side | Effect |
//! |------|------|--------|
//! | `list_tables` | SQL | read |
//! | `describe_table` | SQL | read |
//! | `preview_table` | SQL | read |
//! | `run_select` | SQL | read, through the query gate |
//! | `list_collections` | semantic | read |
//! | `search_collection` | semantic | read |
//! | `rebuild_collection` | semantic | rebuilds a collection |
//! | `check_consistency` | semantic | read |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::index::{SearchMode, SemanticIndex};
use crate::store::RelationalStore;
use crate::sync::{CollectionView, Synchronizer};
use crate::{db, migrate};

/// A named, schema-described operation an agent can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable name; also the route path (`POST /tools/{name}`).
    fn name(&self) -> &str;

    /// One-line description the agent uses to choose between tools.
    fn description(&self) -> &str;

    fn is_builtin(&self) -> bool {
        true
    }

    /// Whether calling the tool leaves every store unchanged.
    fn read_only(&self) -> bool {
        true
    }

    /// JSON Schema (`type: "object"`) for the parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with parameters already checked by [`validate_params`].
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Listing entry for `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub read_only: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            read_only: tool.read_only(),
            parameters: tool.parameters_schema(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Handles to the stores, shared by every tool call. Cheap to clone.
#[derive(Clone)]
pub struct ToolContext {
    store: RelationalStore,
    sync: Synchronizer,
    default_top_k: usize,
    default_search: SearchMode,
}

impl ToolContext {
    pub fn new(
        store: RelationalStore,
        sync: Synchronizer,
        default_top_k: usize,
        default_search: SearchMode,
    ) -> Self {
        Self {
            store,
            sync,
            default_top_k,
            default_search,
        }
    }

    /// Open the database, apply migrations and wire up the configured embedder.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        let embedder = Arc::from(create_provider(&config.embedding)?);
        let store = RelationalStore::new(pool.clone(), config.query.policy());
        let sync = Synchronizer::new(
            pool.clone(),
            SemanticIndex::new(pool),
            embedder,
            config.index.distance,
            config.embedding.batch_size,
        )
        .with_hybrid(config.index.hybrid())
        .with_lease_ttl(Duration::from_secs(config.index.lease_ttl_secs));
        Ok(Self::new(
            store,
            sync,
            config.index.default_top_k,
            config.index.search_type,
        ))
    }

    pub fn store(&self) -> &RelationalStore {
        &self.store
    }

    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn index(&self) -> &SemanticIndex {
        self.sync.index()
    }

    pub fn default_top_k(&self) -> usize {
        self.default_top_k
    }

    pub fn default_search(&self) -> SearchMode {
        self.default_search
    }
}

// ═══════════════════════════════════════════════════════════════════════
// SQL tools
// ═══════════════════════════════════════════════════════════════════════

pub struct ListTablesTool;

#[async_trait]
impl Tool for ListTablesTool {
    fn name(&self) -> &str {
        "list_tables"
    }

    fn description(&self) -> &str {
        "List queryable tables (blocks, legislators, issues, votes) with row counts and resource URIs"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let tables = ctx.store().list_tables().await?;
        Ok(json!({ "tables": tables }))
    }
}

pub struct DescribeTableTool;

#[async_trait]
impl Tool for DescribeTableTool {
    fn name(&self) -> &str {
        "describe_table"
    }

    fn description(&self) -> &str {
        "Columns, types, primary key, foreign keys and indexes of one table. Call before writing SQL"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string", "description": "Table name" }
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let table = non_empty(&params, "table")?;
        let schema = ctx.store().describe(table).await?;
        Ok(serde_json::to_value(schema)?)
    }
}

pub struct PreviewTableTool;

#[async_trait]
impl Tool for PreviewTableTool {
    fn name(&self) -> &str {
        "preview_table"
    }

    fn description(&self) -> &str {
        "First rows of a table, to see what the data looks like"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": { "type": "string", "description": "Table name" },
                "limit": { "type": "integer", "description": "Max rows (capped by the server)", "default": 50 }
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let table = non_empty(&params, "table")?;
        let limit = limit_param(&params, "limit")?;
        let rows = ctx.store().preview(table, limit).await?;
        Ok(json!({ "table": table, "row_count": rows.len(), "rows": rows }))
    }
}

pub struct RunSelectTool;

#[async_trait]
impl Tool for RunSelectTool {
    fn name(&self) -> &str {
        "run_select"
    }

    fn description(&self) -> &str {
        "Run one read-only SELECT (or WITH ... SELECT) over blocks, legislators, issues and votes. \
         Use for exact filters, counts and joins. Results are row-limited"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "sql": { "type": "string", "description": "A single SELECT statement" },
                "limit": { "type": "integer", "description": "Max rows; omitted or 0 means the server maximum" }
            },
            "required": ["sql"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let sql = non_empty(&params, "sql")?;
        let limit = limit_param(&params, "limit")?;
        let output = ctx.store().query(sql, limit).await?;
        Ok(serde_json::to_value(output)?)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Semantic tools
// ═══════════════════════════════════════════════════════════════════════

pub struct ListCollectionsTool;

#[async_trait]
impl Tool for ListCollectionsTool {
    fn name(&self) -> &str {
        "list_collections"
    }

    fn description(&self) -> &str {
        "List semantic collections with record counts, and the collection names that can be built"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let collections = ctx.index().list_collections().await?;
        let available: Vec<String> = CollectionView::all().into_iter().map(|v| v.name).collect();
        Ok(json!({ "collections": collections, "available": available }))
    }
}

pub struct SearchCollectionTool;

#[async_trait]
impl Tool for SearchCollectionTool {
    fn name(&self) -> &str {
        "search_collection"
    }

    fn description(&self) -> &str {
        "Search legislators, blocks or issues of one chamber by meaning, keywords or approximate \
         name. Returns record keys (table:id) to follow up with run_select"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string", "description": "e.g. issues-deputies, legislators-senators" },
                "query": { "type": "string", "description": "Free text" },
                "k": { "type": "integer", "description": "Number of results" },
                "search_type": {
                    "type": "string",
                    "enum": SearchMode::NAMES,
                    "description": "hybrid (dense + BM25 keywords), dense, or keyword. Server default when omitted"
                }
            },
            "required": ["collection", "query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = non_empty(&params, "collection")?;
        let query = non_empty(&params, "query")?;
        let k = match params.get("k").and_then(|v| v.as_i64()) {
            Some(k) if k < 1 => bail!("k must be >= 1"),
            Some(k) => k as usize,
            None => ctx.default_top_k(),
        };
        let mode = match params.get("search_type").and_then(|v| v.as_str()) {
            Some(name) => name.parse::<SearchMode>().map_err(anyhow::Error::msg)?,
            None => ctx.default_search(),
        };
        let results = ctx.sync().search(collection, query, k, mode).await?;
        Ok(json!({
            "collection": collection,
            "query": query,
            "search_type": mode,
            "results": results
        }))
    }
}

pub struct RebuildCollectionTool;

#[async_trait]
impl Tool for RebuildCollectionTool {
    fn name(&self) -> &str {
        "rebuild_collection"
    }

    fn description(&self) -> &str {
        "Rebuild a semantic collection from the relational data (or \"all\"). \
         The previous contents stay searchable until the rebuild commits"
    }

    fn read_only(&self) -> bool {
        false
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string", "description": "Collection name, or \"all\"" }
            },
            "required": ["collection"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = non_empty(&params, "collection")?;
        let reports = if collection == "all" {
            ctx.sync().rebuild_all().await?
        } else {
            vec![ctx.sync().rebuild(collection).await?]
        };
        Ok(json!({ "rebuilt": reports }))
    }
}

pub struct CheckConsistencyTool;

#[async_trait]
impl Tool for CheckConsistencyTool {
    fn name(&self) -> &str {
        "check_consistency"
    }

    fn description(&self) -> &str {
        "Report semantic records whose relational row is gone (dangling) or rows not yet indexed (missing)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string", "description": "Collection name" }
            },
            "required": ["collection"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = non_empty(&params, "collection")?;
        let report = ctx.sync().check(collection).await?;
        Ok(serde_json::to_value(report)?)
    }
}

fn non_empty<'a>(params: &'a Value, name: &str) -> Result<&'a str> {
    let value = params[name].as_str().unwrap_or("").trim();
    if value.is_empty() {
        bail!("{} must not be empty", name);
    }
    Ok(value)
}

fn limit_param(params: &Value, name: &str) -> Result<Option<u32>> {
    match params.get(name).and_then(|v| v.as_i64()) {
        Some(n) if n < 0 => bail!("{} must be >= 0", name),
        Some(n) => Ok(Some(u32::try_from(n).unwrap_or(u32::MAX))),
        None => Ok(None),
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry with every built-in tool.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ListTablesTool));
        registry.register(Box::new(DescribeTableTool));
        registry.register(Box::new(PreviewTableTool));
        registry.register(Box::new(RunSelectTool));
        registry.register(Box::new(ListCollectionsTool));
        registry.register(Box::new(SearchCollectionTool));
        registry.register(Box::new(RebuildCollectionTool));
        registry.register(Box::new(CheckConsistencyTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Parameter Validation
// ═══════════════════════════════════════════════════════════════════════

/// Check `params` against a tool's object schema and fill in defaults.
///
/// Only the schema features the tools use are understood: `required`,
/// per-property `type` and `enum`, and `default`.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let mut checked = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => bail!("parameters must be a JSON object, got {}", json_type_name(other)),
    };

    let required = schema["required"].as_array().into_iter().flatten();
    if let Some(missing) = required
        .filter_map(Value::as_str)
        .find(|name| !checked.contains_key(*name))
    {
        bail!("missing required parameter: {}", missing);
    }

    let Some(properties) = schema["properties"].as_object() else {
        return Ok(Value::Object(checked));
    };
    for (name, spec) in properties {
        if !checked.contains_key(name) {
            if let Some(default) = spec.get("default") {
                checked.insert(name.clone(), default.clone());
            }
            continue;
        }
        let value = &checked[name];
        if let Some(expected) = spec["type"].as_str() {
            if !type_matches(expected, value) {
                bail!(
                    "parameter '{}' must be of type '{}', got {}",
                    name,
                    expected,
                    json_type_name(value)
                );
            }
        }
        if let Some(allowed) = spec["enum"].as_array() {
            if !allowed.contains(value) {
                bail!(
                    "parameter '{}' must be one of {}, got {}",
                    name,
                    Value::Array(allowed.clone()),
                    value
                );
            }
        }
    }

    Ok(Value::Object(checked))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
