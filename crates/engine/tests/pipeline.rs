use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use toolflow_engine::{
    ConnectorResponse, ConnectorSet, EngineConfig, Protocol, ResolvedRequest, RunOptions, RunStatus, StaticCredentialStore,
    StepConnector, ToolExecutor, parse_tool_str,
};
use toolflow_types::{RequestStepConfig, Tool};

/// Returns `{"id": <last path segment>}` and fails for the ids listed in `fail_ids`.
struct EchoConnector {
    fail_ids: Vec<&'static str>,
    calls: AtomicUsize,
}

impl EchoConnector {
    fn new(fail_ids: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            fail_ids,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl StepConnector for EchoConnector {
    async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = request.url.rsplit('/').next().unwrap_or_default().to_string();
        if self.fail_ids.contains(&id.as_str()) {
            return ConnectorResponse::failed(format!("upstream rejected {id}"));
        }
        ConnectorResponse::ok(json!({"id": id, "auth": request.headers.get("Authorization")}))
    }
}

/// Sleeps for `delay_ms` query parameter (default one minute) before answering.
struct SlowConnector;

#[async_trait::async_trait]
impl StepConnector for SlowConnector {
    async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        let delay = request
            .query_params
            .get("delay_ms")
            .and_then(|delay| delay.parse().ok())
            .unwrap_or(60_000);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        ConnectorResponse::ok(json!({"url": request.url}))
    }
}

/// Serves `total` numbered items through offset/limit query parameters.
struct OffsetConnector {
    total: u64,
}

#[async_trait::async_trait]
impl StepConnector for OffsetConnector {
    async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
        let number = |name: &str| request.query_params.get(name).and_then(|value| value.parse::<u64>().ok());
        let (Some(offset), Some(limit)) = (number("offset"), number("limit")) else {
            return ConnectorResponse::failed("missing offset or limit");
        };
        let items: Vec<Value> = (offset..(offset + limit).min(self.total)).map(|id| json!({"id": id})).collect();
        ConnectorResponse::ok(json!({"items": items}))
    }
}

fn executor_with(connector: Arc<dyn StepConnector>, config: EngineConfig) -> ToolExecutor {
    ToolExecutor::new(config).with_connectors(ConnectorSet::new().with_connector(Protocol::Http, connector))
}

fn tool(document: Value) -> Tool {
    parse_tool_str(&document.to_string()).expect("tool document")
}

#[tokio::test]
async fn selector_array_loops_once_per_element_in_order() {
    let tool = tool(json!({
        "id": "per-user",
        "steps": [{
            "id": "profiles",
            "dataSelector": "(ctx) => ctx.users",
            "config": {"type": "request", "systemId": "crm", "url": "https://crm.example.com/users/<<(ctx) => ctx.currentItem.id>>"}
        }]
    }));
    let connector = EchoConnector::new(Vec::new());
    let executor = executor_with(connector.clone(), EngineConfig::default());

    let result = executor
        .run_tool(&tool, json!({"users": [{"id": 1}, {"id": 2}]}), RunOptions::default())
        .await;

    assert_eq!(result.status, RunStatus::Succeeded, "{:?}", result.error);
    let entries = result.step_results["profiles"].entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].current_item, json!({"id": 1}));
    assert_eq!(entries[1].current_item, json!({"id": 2}));
    assert_eq!(entries[1].data["id"], json!("2"));
    assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn element_failure_is_captured_without_aborting_siblings() {
    let tool = tool(json!({
        "id": "per-order",
        "steps": [
            {
                "id": "orders",
                "dataSelector": "orders",
                "config": {"type": "request", "systemId": "shop", "url": "https://shop.example.com/orders/<<(ctx) => ctx.currentItem.id>>"}
            },
            {
                "id": "summary",
                "config": {"type": "transform", "transformCode": "(ctx) => ctx.orders.map(entry => entry.success)"}
            }
        ]
    }));
    let executor = executor_with(EchoConnector::new(vec!["b"]), EngineConfig::default());

    let result = executor
        .run_tool(&tool, json!({"orders": [{"id": "a"}, {"id": "b"}, {"id": "c"}]}), RunOptions::default())
        .await;

    assert!(result.is_success(), "{:?}", result.error);
    let entries = result.step_results["orders"].entries();
    assert_eq!(entries.len(), 3);
    assert!(entries[0].success);
    assert!(!entries[1].success);
    assert_eq!(entries[1].error.as_deref(), Some("upstream rejected b"));
    assert!(entries[2].success);
    assert_eq!(result.step_results["summary"].data(), json!([true, false, true]));
}

#[tokio::test]
async fn concurrent_loops_keep_input_order() {
    let tool = tool(json!({
        "id": "fan-out",
        "steps": [{
            "id": "calls",
            "dataSelector": "(ctx) => ctx.delays",
            "config": {
                "type": "request",
                "systemId": "svc",
                "url": "https://svc.example.com/<<(ctx) => ctx.currentItem.name>>",
                "queryParams": {"delay_ms": "<<(ctx) => ctx.currentItem.delay>>"}
            }
        }]
    }));
    let config = EngineConfig {
        loop_concurrency: 4,
        ..EngineConfig::default()
    };
    let executor = executor_with(Arc::new(SlowConnector), config);
    let delays = json!([{"name": "a", "delay": 80}, {"name": "b", "delay": 40}, {"name": "c", "delay": 5}]);

    let result = executor.run_tool(&tool, json!({"delays": delays}), RunOptions::default()).await;

    assert!(result.is_success(), "{:?}", result.error);
    let urls: Vec<Value> = result.step_results["calls"]
        .entries()
        .iter()
        .map(|entry| entry.data["url"].clone())
        .collect();
    assert_eq!(
        urls,
        vec![
            json!("https://svc.example.com/a"),
            json!("https://svc.example.com/b"),
            json!("https://svc.example.com/c")
        ]
    );
}

#[tokio::test]
async fn cancellation_by_run_id_keeps_completed_steps() {
    let tool = tool(json!({
        "id": "slow",
        "steps": [
            {"id": "prepare", "config": {"type": "transform", "transformCode": "(ctx) => 42"}},
            {"id": "wait", "config": {"type": "request", "systemId": "svc", "url": "https://svc.example.com/slow"}}
        ]
    }));
    let executor = executor_with(Arc::new(SlowConnector), EngineConfig::default());
    let options = RunOptions {
        run_id: Some("run-cancel".into()),
        ..RunOptions::default()
    };

    let (result, cancelled) = tokio::join!(executor.run_tool(&tool, json!({}), options), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        executor.cancel("run-cancel")
    });

    assert!(cancelled);
    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(result.step_results.keys().collect::<Vec<_>>(), vec!["prepare"]);
    assert_eq!(result.step_results["prepare"].data(), json!(42));
    assert!(!executor.runs().is_active("run-cancel"));
}

#[tokio::test]
async fn timeout_behaves_like_cancellation() {
    let tool = tool(json!({
        "id": "slow",
        "steps": [{"id": "wait", "config": {"type": "request", "systemId": "svc", "url": "https://svc.example.com/slow"}}]
    }));
    let executor = executor_with(Arc::new(SlowConnector), EngineConfig::default());
    let options = RunOptions {
        timeout: Some(Duration::from_millis(30)),
        ..RunOptions::default()
    };

    let result = executor.run_tool(&tool, json!({}), options).await;

    assert_eq!(result.status, RunStatus::Aborted);
    assert!(result.step_results.is_empty());
    let error = result.error.expect("aborted error");
    assert_eq!(error.error_code(), "ABORTED");
    assert!(error.to_string().contains("timed out"));
}

#[tokio::test]
async fn timeout_interrupts_a_running_transform() {
    let busy = tool(json!({
        "id": "busy",
        "steps": [
            {"id": "prepare", "config": {"type": "transform", "transformCode": "(ctx) => 1"}},
            {"id": "spin", "config": {"type": "transform", "transformCode": "(ctx) => { let n = 0; while (true) { n += 1; } }"}}
        ]
    }));
    let mut config = EngineConfig::default();
    config.sandbox.max_steps = u64::MAX;
    config.sandbox.timeout_ms = 60_000;
    let executor = ToolExecutor::new(config);
    let options = RunOptions {
        timeout: Some(Duration::from_millis(30)),
        ..RunOptions::default()
    };

    let started = std::time::Instant::now();
    let result = executor.run_tool(&busy, json!({}), options).await;

    assert_eq!(result.status, RunStatus::Aborted, "{:?}", result.error);
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert!(result.error.expect("aborted error").to_string().contains("timed out"));
    assert_eq!(result.step_results.keys().collect::<Vec<_>>(), vec!["prepare"]);

    let quick = tool(json!({
        "id": "quick",
        "steps": [{"id": "one", "config": {"type": "transform", "transformCode": "(ctx) => 1"}}]
    }));
    let follow_up = executor.run_tool(&quick, json!({}), RunOptions::default()).await;
    assert!(follow_up.is_success(), "{:?}", follow_up.error);
}

#[tokio::test]
async fn offset_pagination_merges_pages() {
    let tool = tool(json!({
        "id": "all-items",
        "steps": [{
            "id": "items",
            "config": {
                "type": "request",
                "systemId": "svc",
                "url": "https://svc.example.com/items",
                "queryParams": {"offset": "<<offset>>", "limit": "<<limit>>"},
                "pagination": {"type": "OFFSET_BASED", "pageSize": 2}
            }
        }],
        "outputTransform": "(ctx) => ctx.items.data.items.map(item => item.id)"
    }));
    let executor = executor_with(Arc::new(OffsetConnector { total: 5 }), EngineConfig::default());

    let result = executor.run_tool(&tool, json!({}), RunOptions::default()).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.output, Some(json!([0, 1, 2, 3, 4])));
}

#[tokio::test]
async fn credentials_are_namespaced_and_basic_auth_is_encoded() {
    let tool = tool(json!({
        "id": "auth",
        "steps": [{
            "id": "me",
            "config": {
                "type": "request",
                "systemId": "crm",
                "url": "https://crm.example.com/me",
                "headers": {"Authorization": "Basic <<crm_user>>:<<crm_password>>"}
            }
        }],
        "outputTransform": "(ctx) => ctx.me.data.auth"
    }));
    let mut credentials = StaticCredentialStore::new();
    credentials.insert("crm", "user", "ada");
    credentials.insert("crm", "password", "secret");
    let executor = executor_with(EchoConnector::new(Vec::new()), EngineConfig::default()).with_credentials(Arc::new(credentials));

    let result = executor.run_tool(&tool, json!({}), RunOptions::default()).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.output, Some(json!("Basic YWRhOnNlY3JldA==")));
}

#[tokio::test]
async fn schemas_and_filters_guard_the_output() {
    let tool = tool(json!({
        "id": "guarded",
        "inputSchema": {"type": "object", "required": ["name"]},
        "outputSchema": {"type": "object", "required": ["greeting"]},
        "responseFilters": [{"id": "no-secrets", "target": "VALUES", "pattern": "sk_[a-z0-9]+", "action": "MASK"}],
        "steps": [{"id": "hello", "config": {"type": "transform", "transformCode": "(ctx) => `hi ${ctx.name}, key sk_abc123`"}}],
        "outputTransform": "(ctx) => ({ greeting: ctx.hello.data })"
    }));
    let executor = ToolExecutor::new(EngineConfig::default());

    let rejected = executor.run_tool(&tool, json!({}), RunOptions::default()).await;
    assert_eq!(rejected.error.as_ref().map(|error| error.error_code()), Some("SCHEMA_VALIDATION_FAILED"));

    let result = executor.run_tool(&tool, json!({"name": "ada"}), RunOptions::default()).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.output, Some(json!({"greeting": "hi ada, key [filtered]"})));
}

#[tokio::test]
async fn selector_type_error_is_step_fatal() {
    let tool = tool(json!({
        "id": "bad-selector",
        "steps": [
            {"id": "first", "config": {"type": "transform", "transformCode": "(ctx) => 'ok'"}},
            {"id": "second", "dataSelector": "(ctx) => 3", "config": {"type": "transform", "transformCode": "(ctx) => 1"}}
        ]
    }));
    let executor = ToolExecutor::new(EngineConfig::default());

    let result = executor.run_tool(&tool, json!({}), RunOptions::default()).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.failed_step_id.as_deref(), Some("second"));
    assert_eq!(result.step_results.len(), 1);
    let diagnostic = result.error.expect("selector error").diagnostic();
    assert_eq!(diagnostic["error_code"], json!("SELECTOR_TYPE"));
}
