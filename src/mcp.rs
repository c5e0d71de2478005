//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] and the `db://` resources to the Model
//! Context Protocol, served over Streamable HTTP by [`crate::server`].
//!
//! * **Tools** via `list_tools` / `call_tool`. A failing tool comes back as a
//!   tool result with `is_error` set, so the agent can read the message and
//!   try again.
//! * **Resources** via `list_resources` / `read_resource`.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::resources::{list_resources, read_resource, ResourceUri};
use crate::server::describe_tool_error;
use crate::tools::{validate_params, ToolContext, ToolRegistry};

/// Each MCP session receives a clone; everything inside is shared.
#[derive(Clone)]
pub struct McpBridge {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(ctx: ToolContext, tools: Arc<ToolRegistry>) -> Self {
        Self { ctx, tools }
    }

    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(tool.read_only())),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "cparla".to_string(),
                title: Some("Parliamentary voting records".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Voting records of both chambers (deputies, senators): blocks, legislators, \
                 issues and individual votes. Use describe_table and run_select for exact \
                 filters, counts and joins. Use search_collection when you only know a name \
                 approximately or want issues by topic, then follow the returned table:id keys \
                 with run_select."
                    .to_string(),
            ),
        }
    }

    // ── Tools ────────────────────────────────────────────────────────────

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let params = match validate_params(&tool.parameters_schema(), &params) {
            Ok(params) => params,
            Err(e) => return Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        };

        match tool.execute(params, &self.ctx).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                let (code, message) = describe_tool_error(&e);
                tracing::debug!(tool = %request.name, code, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "{}: {}",
                    code, message
                ))]))
            }
        }
    }

    // ── Resources ────────────────────────────────────────────────────────

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let resources: Vec<Resource> = list_resources(&self.ctx)
            .into_iter()
            .map(|entry| {
                let mut raw = RawResource::new(entry.uri, entry.name);
                raw.description = Some(entry.description);
                raw.mime_type = Some(entry.mime_type.to_string());
                raw.no_annotation()
            })
            .collect();
        std::future::ready(Ok(ListResourcesResult::with_all_items(resources)))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        let value = read_resource(&self.ctx, &request.uri)
            .await
            .map_err(|e| resource_error(&request.uri, &e))?;
        let text = serde_json::to_string_pretty(&value).unwrap_or_default();
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(text, request.uri.clone())],
        })
    }
}

/// Map a failed resource read onto a JSON-RPC error with the same code
/// the HTTP surface reports.
fn resource_error(uri: &str, err: &anyhow::Error) -> McpError {
    let (code, message) = if uri.parse::<ResourceUri>().is_err() {
        ("bad_request", err.to_string())
    } else {
        describe_tool_error(err)
    };
    let rpc_code = match code {
        "not_found" => ErrorCode::RESOURCE_NOT_FOUND,
        "bad_request" | "unsafe_query" | "query_execution" => ErrorCode::INVALID_PARAMS,
        _ => ErrorCode::INTERNAL_ERROR,
    };
    McpError::new(
        rpc_code,
        format!("{}: {}", uri, message),
        Some(serde_json::json!({ "code": code })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tools::RunSelectTool;
    use tempfile::TempDir;

    #[test]
    fn test_tool_schema_and_annotations() {
        let tool = McpBridge::to_mcp_tool(&RunSelectTool);
        assert_eq!(tool.name, "run_select");
        assert!(tool.input_schema.contains_key("properties"));
        let annotations = tool.annotations.unwrap();
        assert_eq!(annotations.read_only_hint, Some(true));
    }

    #[tokio::test]
    async fn test_bridge_advertises_tools_and_resources() {
        let tmp = TempDir::new().unwrap();
        let ctx = ToolContext::from_config(&Config::with_db_path(tmp.path().join("t.sqlite")))
            .await
            .unwrap();
        let bridge = McpBridge::new(ctx, Arc::new(ToolRegistry::with_builtins()));

        let info = bridge.get_info();
        assert!(info.capabilities.tools.is_some());
        assert!(info.capabilities.resources.is_some());
        assert_eq!(info.server_info.name, "cparla");

        assert!(bridge.get_tool("rebuild_collection").is_some());
        assert!(bridge.get_tool("drop_table").is_none());
    }

    #[tokio::test]
    async fn test_resource_errors_keep_their_code() {
        let tmp = TempDir::new().unwrap();
        let ctx = ToolContext::from_config(&Config::with_db_path(tmp.path().join("t.sqlite")))
            .await
            .unwrap();

        let uri = "db://schema/semantic_records";
        let err = read_resource(&ctx, uri).await.unwrap_err();
        let mcp = resource_error(uri, &err);
        assert_eq!(mcp.code, ErrorCode::RESOURCE_NOT_FOUND);

        let uri = "file:///etc/passwd";
        let err = read_resource(&ctx, uri).await.unwrap_err();
        let mcp = resource_error(uri, &err);
        assert_eq!(mcp.code, ErrorCode::INVALID_PARAMS);
        assert_eq!(mcp.data.unwrap()["code"], "bad_request");

        ctx.store().pool().close().await;
        let uri = "db://tables";
        let err = read_resource(&ctx, uri).await.unwrap_err();
        let mcp = resource_error(uri, &err);
        assert_eq!(mcp.code, ErrorCode::INTERNAL_ERROR);
        assert_eq!(mcp.data.unwrap()["code"], "internal");
    }
}
