//! Strongly typed tool document definitions shared across the engine, registry, and CLI.
//!
//! A tool is authored as JSON (or YAML) and deserialized into these types. Field names follow
//! the camelCase wire format so that documents round-trip byte-for-byte through the patch engine.
//! Steps and headers use order-preserving collections because execution and request
//! construction are order sensitive.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod validation;

/// Declarative multi-step integration executed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Canonical tool identifier; identity of the document.
    pub id: String,
    /// Ordered execution steps.
    #[serde(default)]
    pub steps: Vec<ToolStep>,
    /// Expression evaluated against the final variable context to produce the tool output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_transform: Option<String>,
    /// JSON schema the run payload must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
    /// JSON schema the final output must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<JsonValue>,
    /// Filters applied to the final output before it is returned.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_filters: Vec<ResponseFilter>,
    /// Natural-language description of what the tool does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl Tool {
    /// Returns the step with the given identifier.
    pub fn step(&self, step_id: &str) -> Option<&ToolStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Distinct system identifiers referenced by request steps, in declaration order.
    pub fn system_ids(&self) -> Vec<&str> {
        let mut system_ids: Vec<&str> = Vec::new();
        for step in &self.steps {
            if let StepConfig::Request(request) = &step.config
                && !system_ids.contains(&request.system_id.as_str())
            {
                system_ids.push(request.system_id.as_str());
            }
        }
        system_ids
    }
}

/// One unit of work within a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolStep {
    /// Identifier, unique within the tool. Results are stored under this key.
    pub id: String,
    /// Execution configuration; `config.type` selects request or transform execution.
    pub config: StepConfig,
    /// Optional selector deciding single versus loop execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_selector: Option<String>,
    /// Natural-language description of the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Hint that the step has side effects on the remote system.
    #[serde(default)]
    pub modify: bool,
    /// What the pipeline does when this step hits a fatal error.
    #[serde(default)]
    pub failure_behavior: FailureBehavior,
}

/// Tagged step configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepConfig {
    /// Request against an external system through a connector.
    Request(RequestStepConfig),
    /// In-process transform evaluated by the expression sandbox.
    Transform(TransformStepConfig),
}

impl StepConfig {
    /// Wire name of the configuration type.
    pub fn kind(&self) -> &'static str {
        match self {
            StepConfig::Request(_) => "request",
            StepConfig::Transform(_) => "transform",
        }
    }
}

/// Connector request template. String fields may embed `<<expr>>` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestStepConfig {
    /// System whose connector and credentials serve this request.
    pub system_id: String,
    /// Target URL; the scheme selects the connector protocol.
    pub url: String,
    /// Request method (ignored by non-HTTP connectors).
    #[serde(default)]
    pub method: HttpMethod,
    /// Header templates keyed by header name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    /// Query parameter templates keyed by parameter name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub query_params: IndexMap<String, String>,
    /// Body template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Optional pagination sub-loop configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationConfig>,
}

/// In-process transform configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TransformStepConfig {
    /// Function expression (or bare context key) evaluated against the variable context.
    pub transform_code: String,
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

/// Pagination sub-loop configuration of a request step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaginationConfig {
    /// Strategy used to advance between pages.
    #[serde(rename = "type")]
    pub pagination_type: PaginationType,
    /// Page size injected as `limit` and `pageSize`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    /// Dot path to the next cursor inside a response (cursor strategy only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_path: Option<String>,
    /// Function expression `(response, pageInfo) => boolean`; `true` stops the loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_condition: Option<String>,
}

/// Strategy used to advance between pages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaginationType {
    OffsetBased,
    PageBased,
    CursorBased,
    Disabled,
}

/// Behavior of the pipeline when a step fails fatally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureBehavior {
    /// Abort the remaining pipeline, keeping earlier results.
    #[default]
    Fail,
    /// Record the failure in the step envelope and continue with the next step.
    Continue,
}

/// Output filter applied after the output transform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFilter {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub target: ResponseFilterTarget,
    /// Regular expression matched against keys and/or string values.
    pub pattern: String,
    #[serde(default)]
    pub action: ResponseFilterAction,
    /// Replacement used by the `MASK` action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_value: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseFilterTarget {
    Keys,
    #[default]
    Values,
    Both,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseFilterAction {
    Remove,
    #[default]
    Mask,
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_request_and_transform_steps() {
        let tool: Tool = serde_json::from_value(json!({
            "id": "list-users",
            "steps": [
                {
                    "id": "users",
                    "config": {
                        "type": "request",
                        "systemId": "crm",
                        "url": "https://crm.example.com/users",
                        "headers": { "Authorization": "Bearer <<crm_token>>" }
                    }
                },
                {
                    "id": "names",
                    "config": { "type": "transform", "transformCode": "(ctx) => ctx.users.data.map(u => u.name)" },
                    "failureBehavior": "CONTINUE"
                }
            ],
            "outputTransform": "(ctx) => ctx.names.data"
        }))
        .expect("tool deserializes");

        assert_eq!(tool.steps.len(), 2);
        assert_eq!(tool.steps[0].config.kind(), "request");
        assert_eq!(tool.steps[1].failure_behavior, FailureBehavior::Continue);
        let StepConfig::Request(request) = &tool.steps[0].config else {
            panic!("expected request config");
        };
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(tool.system_ids(), vec!["crm"]);
    }

    #[test]
    fn serialization_omits_unset_optionals() {
        let tool = Tool {
            id: "t".into(),
            output_transform: Some("(ctx) => ctx".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&tool).expect("serialize");
        assert_eq!(value, json!({ "id": "t", "steps": [], "outputTransform": "(ctx) => ctx" }));
    }

    #[test]
    fn pagination_round_trips_through_yaml() {
        let yaml = r#"
type: CURSOR_BASED
pageSize: 25
cursorPath: meta.next
"#;
        let pagination: PaginationConfig = serde_yaml::from_str(yaml).expect("yaml");
        assert_eq!(pagination.pagination_type, PaginationType::CursorBased);
        assert_eq!(pagination.page_size, Some(25));
        assert_eq!(pagination.cursor_path.as_deref(), Some("meta.next"));
    }
}
