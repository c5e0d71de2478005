//! HTTP server: MCP endpoint plus a plain JSON API.
//!
//! Both surfaces dispatch into the same [`ToolRegistry`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `*`    | `/mcp` | MCP Streamable HTTP (JSON-RPC) |
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool by name |
//! | `GET`  | `/resources` | List `db://` resources |
//! | `GET`  | `/resources/read?uri=...` | Read one resource |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unsafe_query", "message": "unsafe query: ..." } }
//! ```
//!
//! Codes: `bad_request`, `unsafe_query`, `query_execution` (400),
//! `not_found` (404), `collection_exists`, `rebuild_in_progress`,
//! `incomplete_rebuild`, `consistency_violation` (409), `embedding_provider` (502),
//! `dimension_mismatch`, `tool_error`, `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::mcp::McpBridge;
use crate::resources::{list_resources, read_resource, ResourceEntry, ResourceUri};
use crate::tools::{validate_params, ToolContext, ToolInfo, ToolRegistry};

#[derive(Clone)]
struct AppState {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

/// Bind to `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = ToolContext::from_config(config).await?;
    let tools = Arc::new(ToolRegistry::with_builtins());

    println!("Registered {} tools:", tools.len());
    for t in tools.tools() {
        let mode = if t.read_only() { "read-only" } else { "writes" };
        println!("  POST /tools/{} ({})", t.name(), mode);
    }

    let app = router(ctx, tools);

    let bind_addr = &config.server.bind;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    println!("MCP endpoint: http://{}/mcp", bind_addr);
    tracing::info!(bind = %bind_addr, "server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

/// The full application router. Exposed for embedding and tests.
pub fn router(ctx: ToolContext, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(ctx.clone(), tools.clone());
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/resources", get(handle_list_resources))
        .route("/resources/read", get(handle_read_resource))
        .route("/health", get(handle_health))
        .nest_service("/mcp", mcp_service)
        .layer(cors)
        .with_state(AppState { ctx, tools })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Machine-readable code and message for a failed tool call.
///
/// Typed library errors keep their own code; anything else is a parameter
/// problem when it reads like one, otherwise a generic tool error.
pub fn describe_tool_error(err: &anyhow::Error) -> (&'static str, String) {
    if let Some(e) = err.downcast_ref::<crate::error::Error>() {
        return (e.code(), e.to_string());
    }
    let msg = err.to_string();
    if msg.contains("must not be empty") || msg.contains("must be >=") {
        ("bad_request", msg)
    } else {
        ("tool_error", msg)
    }
}

fn status_for(code: &str) -> StatusCode {
    match code {
        "bad_request" | "unsafe_query" | "query_execution" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "collection_exists"
        | "rebuild_in_progress"
        | "incomplete_rebuild"
        | "consistency_violation" => StatusCode::CONFLICT,
        "embedding_provider" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let (code, message) = describe_tool_error(&err);
    AppError {
        status: status_for(code),
        code: code.to_string(),
        message: format!("{}: {}", tool_name, message),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Tools ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo::from_tool(t.as_ref()))
        .collect();
    Json(ToolListResponse { tools })
}

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state
        .tools
        .find(&name)
        .ok_or_else(|| not_found(format!("no tool registered with name: {}", name)))?;

    let validated_params = validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| bad_request(e.to_string()))?;

    let result = tool
        .execute(validated_params, &state.ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(serde_json::json!({ "result": result })))
}

// ============ Resources ============

#[derive(Serialize)]
struct ResourceListResponse {
    resources: Vec<ResourceEntry>,
}

async fn handle_list_resources(State(state): State<AppState>) -> Json<ResourceListResponse> {
    Json(ResourceListResponse {
        resources: list_resources(&state.ctx),
    })
}

#[derive(Deserialize)]
struct ReadResourceQuery {
    uri: String,
}

async fn handle_read_resource(
    State(state): State<AppState>,
    Query(query): Query<ReadResourceQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    query
        .uri
        .parse::<ResourceUri>()
        .map_err(|e| bad_request(e.to_string()))?;
    let contents = read_resource(&state.ctx, &query.uri)
        .await
        .map_err(|e| classify_tool_error(&query.uri, e))?;
    Ok(Json(serde_json::json!({ "uri": query.uri, "contents": contents })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_typed_errors_keep_their_code() {
        let err: anyhow::Error = Error::unsafe_query("only read-only SELECT statements are permitted").into();
        let (code, message) = describe_tool_error(&err);
        assert_eq!(code, "unsafe_query");
        assert!(message.contains("read-only"));
        assert_eq!(status_for(code), StatusCode::BAD_REQUEST);

        let err: anyhow::Error = Error::RebuildInProgress("issues-deputies".into()).into();
        assert_eq!(status_for(describe_tool_error(&err).0), StatusCode::CONFLICT);

        let err: anyhow::Error = Error::UnknownTable("secrets".into()).into();
        assert_eq!(status_for(describe_tool_error(&err).0), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_untyped_errors() {
        let (code, _) = describe_tool_error(&anyhow::anyhow!("sql must not be empty"));
        assert_eq!(code, "bad_request");
        let (code, _) = describe_tool_error(&anyhow::anyhow!("boom"));
        assert_eq!(code, "tool_error");
        assert_eq!(status_for(code), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
