//! Pagination sub-loop of request steps.
//!
//! Each page re-resolves the request with fresh `page`/`offset`/`cursor`/`limit`/`pageSize`
//! variables, then decides whether to continue: through the configured stop condition when
//! there is one, otherwise by inspecting the page. A hard page ceiling bounds the loop.

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use toolflow_types::{PaginationConfig, PaginationType, RequestStepConfig};
use toolflow_util::select_path;
use tracing::{debug, info, warn};

use super::connector::{ConnectorResponse, ConnectorSet};
use crate::context::{PaginationVars, VariableContext};
use crate::error::EngineError;
use crate::resolve::ExpressionResolver;

/// Fields checked for the next cursor when `cursorPath` is not configured.
const DEFAULT_CURSOR_FIELDS: [&str; 4] = ["next_cursor", "nextCursor", "cursor", "next"];
/// Fields checked for the page's item list when a response is an object.
const ITEM_LIST_FIELDS: [&str; 5] = ["data", "results", "items", "records", "values"];
/// Parameters of a stop condition, in call order.
const STOP_CONDITION_ARGS: [&str; 2] = ["response", "pageInfo"];

pub(crate) struct PaginatedRequest<'a> {
    pub step_id: &'a str,
    pub config: &'a RequestStepConfig,
    pub pagination: &'a PaginationConfig,
    pub max_pages: u32,
    pub default_page_size: u32,
}

/// Fetches pages until the stop rule fires. Returns `Ok(None)` when cancelled.
///
/// A failed page ends the loop with `success: false` and the data merged so far (or the
/// failed page's data when it was the first).
pub(crate) async fn fetch_pages<C>(
    request: PaginatedRequest<'_>,
    resolver: &ExpressionResolver,
    connectors: &ConnectorSet,
    cancel: &CancellationToken,
    build_context: C,
) -> Result<Option<ConnectorResponse>, EngineError>
where
    C: Fn(&PaginationVars) -> VariableContext,
{
    let pagination = request.pagination;
    let page_size = u64::from(pagination.page_size.unwrap_or(request.default_page_size).max(1));
    let max_pages = request.max_pages.max(1);
    let mut vars = PaginationVars::first(page_size);
    let mut merged: Option<Value> = None;
    let mut previous_page: Option<Value> = None;
    let mut fetched = 0u32;

    info!(
        step_id = %request.step_id,
        strategy = ?pagination.pagination_type,
        page_size,
        has_stop_condition = pagination.stop_condition.is_some(),
        "pagination started"
    );

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let context = build_context(&vars);
        let config = request.config.clone();
        let resolved = resolver
            .spawn(move |resolver| resolver.resolve_request(&config, &context))
            .await?;
        fetched += 1;
        debug!(step_id = %request.step_id, page = vars.page, offset = vars.offset, "fetching page");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            response = connectors.execute(request.config, &resolved) => response,
        };

        if !response.success {
            let error = response.error.unwrap_or_else(|| "connector reported failure".to_string());
            warn!(step_id = %request.step_id, page = vars.page, error = %error, "page request failed");
            let data = merged.unwrap_or(response.data);
            return Ok(Some(ConnectorResponse::failed_with_data(data, error)));
        }

        let page_data = response.data;
        if previous_page.as_ref() == Some(&page_data) {
            debug!(step_id = %request.step_id, page = vars.page, "page repeats the previous one; stopping");
            break;
        }

        let next_cursor = next_cursor(&page_data, pagination);
        let stop = match pagination.stop_condition.as_deref().filter(|condition| !condition.trim().is_empty()) {
            Some(condition) => {
                let page_info = json!({
                    "page": vars.page,
                    "offset": vars.offset,
                    "cursor": vars.cursor,
                    "limit": vars.limit,
                    "pageSize": vars.limit,
                    "totalFetched": fetched,
                });
                let condition = condition.to_string();
                let page = page_data.clone();
                let verdict = resolver
                    .spawn(move |resolver| resolver.call_function(&condition, &STOP_CONDITION_ARGS, &[page, page_info]))
                    .await?;
                is_truthy(verdict.as_ref()) || (pagination.pagination_type == PaginationType::CursorBased && next_cursor.is_none())
            }
            None => default_stop(&page_data, pagination.pagination_type, page_size, next_cursor.as_ref()),
        };

        merged = Some(merge_pages(merged, page_data.clone()));
        if stop {
            break;
        }
        if fetched >= max_pages {
            warn!(step_id = %request.step_id, max_pages, "pagination page ceiling reached; keeping pages fetched so far");
            break;
        }

        vars.page += 1;
        vars.offset += page_size;
        vars.cursor = next_cursor.unwrap_or(Value::Null);
        previous_page = Some(page_data);
    }

    info!(step_id = %request.step_id, pages = fetched, "pagination finished");
    Ok(Some(ConnectorResponse::ok(merged.unwrap_or(Value::Null))))
}

fn next_cursor(page: &Value, pagination: &PaginationConfig) -> Option<Value> {
    if pagination.pagination_type != PaginationType::CursorBased {
        return None;
    }
    let candidate = match pagination.cursor_path.as_deref().filter(|path| !path.trim().is_empty()) {
        Some(path) => select_path(page, path).cloned(),
        None => DEFAULT_CURSOR_FIELDS.iter().find_map(|field| page.get(field).cloned()),
    };
    candidate.filter(|cursor| match cursor {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        Value::Bool(flag) => *flag,
        _ => true,
    })
}

fn default_stop(page: &Value, strategy: PaginationType, page_size: u64, next_cursor: Option<&Value>) -> bool {
    if strategy == PaginationType::CursorBased && next_cursor.is_none() {
        return true;
    }
    match item_count(page) {
        Some(0) => true,
        Some(count) => strategy != PaginationType::CursorBased && (count as u64) < page_size,
        None => page.is_null(),
    }
}

fn item_count(page: &Value) -> Option<usize> {
    match page {
        Value::Array(items) => Some(items.len()),
        Value::Object(fields) => ITEM_LIST_FIELDS
            .iter()
            .find_map(|field| fields.get(*field).and_then(Value::as_array))
            .or_else(|| fields.values().find_map(Value::as_array))
            .map(Vec::len),
        _ => None,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|number| number != 0.0 && !number.is_nan()),
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Arrays concatenate; objects merge with array-valued fields concatenated and other fields
/// taken from the latest page.
pub(crate) fn merge_pages(accumulated: Option<Value>, page: Value) -> Value {
    match (accumulated, page) {
        (None, page) => page,
        (Some(Value::Array(mut items)), Value::Array(more)) => {
            items.extend(more);
            Value::Array(items)
        }
        (Some(Value::Object(mut fields)), Value::Object(more)) => {
            merge_object_fields(&mut fields, more);
            Value::Object(fields)
        }
        (Some(_), page) => page,
    }
}

fn merge_object_fields(fields: &mut Map<String, Value>, more: Map<String, Value>) {
    for (key, value) in more {
        match (fields.get_mut(&key), value) {
            (Some(Value::Array(existing)), Value::Array(extra)) => existing.extend(extra),
            (_, value) => {
                fields.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::context::VariableContextBuilder;
    use crate::executor::connector::{Protocol, StepConnector};
    use crate::resolve::ResolvedRequest;

    /// Serves `total` numbered items, honoring `offset`/`limit` or `cursor` query params.
    struct ItemsConnector {
        total: u64,
        requests: Mutex<Vec<ResolvedRequest>>,
        fail_on_call: Option<usize>,
    }

    impl ItemsConnector {
        fn new(total: u64) -> Self {
            Self {
                total,
                requests: Mutex::new(Vec::new()),
                fail_on_call: None,
            }
        }

        fn call_count(&self) -> usize {
            self.requests.lock().map(|requests| requests.len()).unwrap_or(0)
        }
    }

    #[async_trait::async_trait]
    impl StepConnector for ItemsConnector {
        async fn execute(&self, _config: &RequestStepConfig, request: &ResolvedRequest) -> ConnectorResponse {
            let call_index = {
                let mut requests = self.requests.lock().expect("lock");
                requests.push(request.clone());
                requests.len()
            };
            if self.fail_on_call == Some(call_index) {
                return ConnectorResponse::failed("upstream unavailable");
            }
            let param = |name: &str| request.query_params.get(name).and_then(|value| value.parse::<u64>().ok());
            let limit = param("limit").unwrap_or(10);
            let start = param("offset").or_else(|| param("cursor")).unwrap_or(0);
            let end = (start + limit).min(self.total);
            let items: Vec<Value> = (start..end).map(|index| json!({ "id": index })).collect();
            let next = if end < self.total { json!(end.to_string()) } else { Value::Null };
            ConnectorResponse::ok(json!({ "items": items, "meta": { "next": next } }))
        }
    }

    fn config(query: &[(&str, &str)]) -> RequestStepConfig {
        let mut config = RequestStepConfig {
            system_id: "crm".into(),
            url: "https://crm.example.com/items".into(),
            ..Default::default()
        };
        for (name, value) in query {
            config.query_params.insert(name.to_string(), value.to_string());
        }
        config
    }

    fn pagination(strategy: PaginationType, page_size: u32) -> PaginationConfig {
        PaginationConfig {
            pagination_type: strategy,
            page_size: Some(page_size),
            cursor_path: Some("meta.next".into()),
            stop_condition: None,
        }
    }

    async fn try_run(
        connector: Arc<ItemsConnector>,
        config: &RequestStepConfig,
        pagination: &PaginationConfig,
        max_pages: u32,
    ) -> Result<Option<ConnectorResponse>, EngineError> {
        let connectors = ConnectorSet::new().with_connector(Protocol::Http, connector);
        let payload = Map::new();
        let request = PaginatedRequest {
            step_id: "items",
            config,
            pagination,
            max_pages,
            default_page_size: 50,
        };
        fetch_pages(
            request,
            &ExpressionResolver::default(),
            &connectors,
            &CancellationToken::new(),
            |vars| VariableContextBuilder::new(&payload).pagination(Some(vars)).build(),
        )
        .await
    }

    async fn run(
        connector: Arc<ItemsConnector>,
        config: &RequestStepConfig,
        pagination: &PaginationConfig,
        max_pages: u32,
    ) -> ConnectorResponse {
        try_run(connector, config, pagination, max_pages)
            .await
            .expect("resolved")
            .expect("not cancelled")
    }

    fn ids(response: &ConnectorResponse) -> Vec<u64> {
        response.data["items"]
            .as_array()
            .map(|items| items.iter().filter_map(|item| item["id"].as_u64()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn offset_pagination_stops_on_short_page() {
        let connector = Arc::new(ItemsConnector::new(5));
        let response = run(
            connector.clone(),
            &config(&[("offset", "<<offset>>"), ("limit", "<<limit>>")]),
            &pagination(PaginationType::OffsetBased, 2),
            100,
        )
        .await;
        assert!(response.success);
        assert_eq!(ids(&response), vec![0, 1, 2, 3, 4]);
        assert_eq!(connector.call_count(), 3);
    }

    #[tokio::test]
    async fn cursor_pagination_follows_cursor_path() {
        let connector = Arc::new(ItemsConnector::new(4));
        let response = run(
            connector.clone(),
            &config(&[("cursor", "<<cursor>>"), ("limit", "<<pageSize>>")]),
            &pagination(PaginationType::CursorBased, 3),
            100,
        )
        .await;
        assert_eq!(ids(&response), vec![0, 1, 2, 3]);
        assert_eq!(connector.call_count(), 2);
        let first = &connector.requests.lock().expect("lock")[0];
        assert!(!first.query_params.contains_key("cursor"), "null cursor must be dropped");
    }

    #[tokio::test]
    async fn page_ceiling_keeps_fetched_pages() {
        let connector = Arc::new(ItemsConnector::new(100));
        let response = run(
            connector.clone(),
            &config(&[("offset", "<<offset>>"), ("limit", "<<limit>>")]),
            &pagination(PaginationType::OffsetBased, 10),
            3,
        )
        .await;
        assert!(response.success);
        assert_eq!(ids(&response).len(), 30);
        assert_eq!(connector.call_count(), 3);
    }

    #[tokio::test]
    async fn stop_condition_sees_response_and_page_info() {
        let connector = Arc::new(ItemsConnector::new(100));
        let mut pagination = pagination(PaginationType::PageBased, 10);
        pagination.stop_condition = Some("(response, pageInfo) => pageInfo.page >= 2".into());
        let response = run(
            connector.clone(),
            &config(&[("offset", "<<(ctx) => (ctx.page - 1) * ctx.pageSize>>"), ("limit", "<<limit>>")]),
            &pagination,
            100,
        )
        .await;
        assert_eq!(ids(&response), (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn stop_condition_errors_list_its_arguments() {
        let connector = Arc::new(ItemsConnector::new(100));
        let mut pagination = pagination(PaginationType::PageBased, 10);
        pagination.stop_condition = Some("(response, pageInfo) => response.paging.done".into());
        let error = try_run(connector, &config(&[("limit", "<<limit>>")]), &pagination, 100)
            .await
            .expect_err("paging is not a response field");
        match error {
            EngineError::Resolution { available_keys, .. } => {
                assert!(available_keys.contains(&"response".to_string()));
                assert!(available_keys.contains(&"response.items".to_string()));
                assert!(available_keys.contains(&"pageInfo.page".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failure_on_later_page_keeps_accumulated_data() {
        let mut connector = ItemsConnector::new(100);
        connector.fail_on_call = Some(2);
        let response = run(
            Arc::new(connector),
            &config(&[("offset", "<<offset>>"), ("limit", "<<limit>>")]),
            &pagination(PaginationType::OffsetBased, 10),
            100,
        )
        .await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("upstream unavailable"));
        assert_eq!(ids(&response).len(), 10);
    }

    #[test]
    fn merge_concatenates_arrays_and_array_fields() {
        assert_eq!(merge_pages(Some(json!([1])), json!([2, 3])), json!([1, 2, 3]));
        assert_eq!(
            merge_pages(Some(json!({"items": [1], "total": 3})), json!({"items": [2], "total": 4})),
            json!({"items": [1, 2], "total": 4})
        );
        assert_eq!(merge_pages(None, json!("x")), json!("x"));
    }
}
