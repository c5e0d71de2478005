//! End-to-end tests of the HTTP tool surface.
//!
//! Each test serves the real router on an ephemeral port, with a hash
//! embedder so collections can be built offline.

use anyhow::Result;
use async_trait::async_trait;
use cparla::config::Config;
use cparla::ingest;
use cparla::server::router;
use cparla::tools::{Tool, ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ─── Test Tool ──────────────────────────────────────────────────────

/// Counts votes of one choice through the gated store.
struct CountVotesTool;

#[async_trait]
impl Tool for CountVotesTool {
    fn name(&self) -> &str {
        "count_votes"
    }

    fn description(&self) -> &str {
        "Count votes with a given choice"
    }

    fn is_builtin(&self) -> bool {
        false
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "choice": { "type": "string" } },
            "required": ["choice"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let choice = params["choice"].as_str().unwrap_or("");
        if !choice.chars().all(|c| c.is_ascii_alphabetic()) {
            anyhow::bail!("invalid choice: {}", choice);
        }
        let output = ctx
            .store()
            .query(
                &format!("SELECT COUNT(*) AS n FROM votes WHERE choice = '{}'", choice),
                None,
            )
            .await?;
        Ok(json!({ "choice": choice, "count": output.rows[0]["n"] }))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn test_config(tmp: &TempDir) -> Config {
    let config_content = format!(
        r#"
[db]
path = "{}"

[query]
max_rows = 5

[embedding]
provider = "hash"
model = "feature-hash"
dims = 256
"#,
        tmp.path().join("cparla.sqlite").display()
    );
    toml::from_str(&config_content).unwrap()
}

struct TestServer {
    base: String,
    handle: tokio::task::JoinHandle<()>,
    _tmp: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn start_server(tools: ToolRegistry) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let cfg = test_config(&tmp);
    let ctx = ToolContext::from_config(&cfg).await.unwrap();

    let dataset = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/dataset.json");
    ingest::load_file(ctx.store().pool(), &dataset).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(ctx, Arc::new(tools));
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    TestServer {
        base: format!("http://{}", addr),
        handle,
        _tmp: tmp,
    }
}

async fn call(server: &TestServer, tool: &str, params: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/{}", server.base, tool))
        .json(&params)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_tool_list() {
    let server = start_server(ToolRegistry::with_builtins()).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let body: Value = client
        .get(format!("{}/tools/list", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = body["tools"].as_array().unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
    for expected in [
        "list_tables",
        "describe_table",
        "preview_table",
        "run_select",
        "list_collections",
        "search_collection",
        "rebuild_collection",
        "check_consistency",
    ] {
        assert!(names.contains(&expected), "missing {}: {:?}", expected, names);
    }
    let rebuild = tools
        .iter()
        .find(|t| t["name"] == "rebuild_collection")
        .unwrap();
    assert_eq!(rebuild["read_only"], false);
    let select = tools.iter().find(|t| t["name"] == "run_select").unwrap();
    assert_eq!(select["read_only"], true);
}

#[tokio::test]
async fn test_run_select_and_rejections() {
    let server = start_server(ToolRegistry::with_builtins()).await;

    let (status, body) = call(&server, "run_select", json!({ "sql": "SELECT id FROM votes" })).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["row_count"], 5);
    assert_eq!(body["result"]["limit"], 5);

    let (status, body) = call(
        &server,
        "run_select",
        json!({ "sql": "SELECT * FROM votes; DROP TABLE votes;" }),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "unsafe_query");

    let (status, body) = call(&server, "run_select", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(&server, "run_select", json!({ "sql": "SELECT nope FROM votes" })).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "query_execution");

    let (status, body) = call(&server, "describe_table", json!({ "table": "secrets" })).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = call(&server, "nonexistent", json!({})).await;
    assert_eq!(status, 404);

    // The server is still serving after every failure above.
    let (status, body) = call(&server, "list_tables", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["tables"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_rebuild_search_and_check_via_tools() {
    let server = start_server(ToolRegistry::with_builtins()).await;

    let (status, body) = call(&server, "search_collection", json!({
        "collection": "legislators-deputies", "query": "Ana"
    }))
    .await;
    assert_eq!(status, 404, "{}", body);

    let (status, body) = call(
        &server,
        "rebuild_collection",
        json!({ "collection": "legislators-deputies" }),
    )
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["rebuilt"][0]["records"], 3);

    let (status, body) = call(&server, "search_collection", json!({
        "collection": "legislators-deputies", "query": "Carla Ruiz Córdoba", "k": 2
    }))
    .await;
    assert_eq!(status, 200, "{}", body);
    let results = body["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["key"], "legislators:12");
    assert_eq!(body["result"]["search_type"], "hybrid");

    let (status, body) = call(&server, "search_collection", json!({
        "collection": "legislators-deputies", "query": "mendoza", "search_type": "keyword"
    }))
    .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["search_type"], "keyword");
    let results = body["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["key"], "legislators:11");

    let (status, body) = call(&server, "search_collection", json!({
        "collection": "legislators-deputies", "query": "Ana", "search_type": "sparse"
    }))
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = call(
        &server,
        "check_consistency",
        json!({ "collection": "legislators-deputies" }),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["consistent"], true);

    let (_, body) = call(&server, "list_collections", json!({})).await;
    assert_eq!(body["result"]["collections"].as_array().unwrap().len(), 1);
    assert_eq!(body["result"]["available"].as_array().unwrap().len(), 6);
}

#[tokio::test]
async fn test_resources() {
    let server = start_server(ToolRegistry::with_builtins()).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/resources", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let uris: Vec<&str> = body["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert!(uris.contains(&"db://tables"));
    assert!(uris.contains(&"db://schema/votes"));

    let resp = client
        .get(format!("{}/resources/read", server.base))
        .query(&[("uri", "db://preview/votes?limit=2")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["contents"]["row_count"], 2);

    let resp = client
        .get(format!("{}/resources/read", server.base))
        .query(&[("uri", "file:///etc/passwd")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_custom_tool_via_http_server() {
    let mut tools = ToolRegistry::with_builtins();
    tools.register(Box::new(CountVotesTool));
    let server = start_server(tools).await;

    let (status, body) = call(&server, "count_votes", json!({ "choice": "negative" })).await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["result"]["count"], 3);

    let (status, body) = call(&server, "count_votes", json!({ "choice": "x' OR '1'='1" })).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], "tool_error");
}
