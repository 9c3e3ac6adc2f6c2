//! Final output handling: output transform, response filters and schema validation.

use regex::{NoExpand, Regex};
use serde_json::{Map, Value};
use toolflow_types::{ResponseFilter, ResponseFilterAction, ResponseFilterTarget};
use tracing::debug;

use crate::context::VariableContext;
use crate::error::EngineError;
use crate::resolve::ExpressionResolver;

const DEFAULT_MASK: &str = "[filtered]";

/// Evaluates `outputTransform` against the final context.
///
/// Without a transform the output maps each step id to its `.data`.
pub(crate) fn apply_output_transform(
    transform: Option<&str>,
    context: &VariableContext,
    step_data: Map<String, Value>,
    resolver: &ExpressionResolver,
) -> Result<Value, EngineError> {
    match transform.map(str::trim).filter(|transform| !transform.is_empty()) {
        Some(transform) => Ok(resolver.evaluate(transform, context)?.unwrap_or(Value::Null)),
        None => Ok(Value::Object(step_data)),
    }
}

/// Validates `instance` against a JSON schema, collecting every violation.
pub(crate) fn validate_against_schema(schema: &Value, instance: &Value, target: &str) -> Result<(), EngineError> {
    let validator = jsonschema::validator_for(schema).map_err(|error| EngineError::SchemaValidation {
        target: target.to_string(),
        violations: vec![format!("invalid schema: {error}")],
    })?;
    let violations: Vec<String> = validator.iter_errors(instance).map(|error| error.to_string()).collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SchemaValidation {
            target: target.to_string(),
            violations,
        })
    }
}

/// Applies the enabled filters in declaration order.
pub(crate) fn apply_response_filters(filters: &[ResponseFilter], output: Value) -> Result<Value, EngineError> {
    let mut output = output;
    for filter in filters.iter().filter(|filter| filter.enabled) {
        let pattern = Regex::new(&filter.pattern).map_err(|error| EngineError::ResponseFilter {
            filter_id: filter.id.clone(),
            message: format!("invalid pattern: {error}"),
        })?;
        let compiled = CompiledFilter { filter, pattern };
        output = match compiled.apply(output)? {
            Some(value) => value,
            None => Value::Null,
        };
        debug!(filter_id = %filter.id, "response filter applied");
    }
    Ok(output)
}

struct CompiledFilter<'a> {
    filter: &'a ResponseFilter,
    pattern: Regex,
}

impl CompiledFilter<'_> {
    fn checks_keys(&self) -> bool {
        matches!(self.filter.target, ResponseFilterTarget::Keys | ResponseFilterTarget::Both)
    }

    fn checks_values(&self) -> bool {
        matches!(self.filter.target, ResponseFilterTarget::Values | ResponseFilterTarget::Both)
    }

    fn mask(&self) -> &str {
        self.filter.mask_value.as_deref().unwrap_or(DEFAULT_MASK)
    }

    fn reject(&self, matched: &str) -> EngineError {
        EngineError::ResponseFilter {
            filter_id: self.filter.id.clone(),
            message: format!("pattern '{}' matched '{}'", self.filter.pattern, matched),
        }
    }

    /// Returns `None` when the value itself is removed.
    fn apply(&self, value: Value) -> Result<Option<Value>, EngineError> {
        match value {
            Value::Object(entries) => {
                let mut filtered = Map::new();
                for (key, entry) in entries {
                    if self.checks_keys() && self.pattern.is_match(&key) {
                        match self.filter.action {
                            ResponseFilterAction::Remove => continue,
                            ResponseFilterAction::Mask => {
                                filtered.insert(key, Value::String(self.mask().to_string()));
                                continue;
                            }
                            ResponseFilterAction::Fail => return Err(self.reject(&key)),
                        }
                    }
                    if let Some(entry) = self.apply(entry)? {
                        filtered.insert(key, entry);
                    }
                }
                Ok(Some(Value::Object(filtered)))
            }
            Value::Array(items) => {
                let mut filtered = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(item) = self.apply(item)? {
                        filtered.push(item);
                    }
                }
                Ok(Some(Value::Array(filtered)))
            }
            Value::String(text) if self.checks_values() && self.pattern.is_match(&text) => match self.filter.action {
                ResponseFilterAction::Remove => Ok(None),
                ResponseFilterAction::Mask => Ok(Some(Value::String(self.pattern.replace_all(&text, NoExpand(self.mask())).into_owned()))),
                ResponseFilterAction::Fail => Err(self.reject(&text)),
            },
            other => Ok(Some(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(target: ResponseFilterTarget, action: ResponseFilterAction, pattern: &str) -> ResponseFilter {
        ResponseFilter {
            id: "f".into(),
            enabled: true,
            target,
            pattern: pattern.into(),
            action,
            mask_value: None,
        }
    }

    #[test]
    fn masks_matching_values_and_removes_matching_keys() {
        let output = json!({
            "users": [{"email": "ada@example.com", "ssn": "123-45-6789", "name": "Ada"}]
        });
        let filters = vec![
            filter(ResponseFilterTarget::Values, ResponseFilterAction::Mask, r"\d{3}-\d{2}-\d{4}"),
            filter(ResponseFilterTarget::Keys, ResponseFilterAction::Remove, "^email$"),
        ];
        let filtered = apply_response_filters(&filters, output).expect("filtered");
        assert_eq!(filtered, json!({"users": [{"ssn": "[filtered]", "name": "Ada"}]}));
    }

    #[test]
    fn disabled_filters_are_skipped_and_fail_action_rejects() {
        let mut disabled = filter(ResponseFilterTarget::Both, ResponseFilterAction::Fail, "secret");
        disabled.enabled = false;
        let output = json!({"note": "secret"});
        assert_eq!(apply_response_filters(std::slice::from_ref(&disabled), output.clone()).expect("skip"), output);

        let failing = filter(ResponseFilterTarget::Values, ResponseFilterAction::Fail, "secret");
        let error = apply_response_filters(&[failing], output).expect_err("fail");
        assert_eq!(error.error_code(), "RESPONSE_FILTER_REJECTED");
    }

    #[test]
    fn removed_array_values_are_dropped() {
        let filters = vec![filter(ResponseFilterTarget::Values, ResponseFilterAction::Remove, "^tmp-")];
        let filtered = apply_response_filters(&filters, json!(["tmp-1", "keep", 3])).expect("filtered");
        assert_eq!(filtered, json!(["keep", 3]));
    }

    #[test]
    fn schema_violations_are_listed() {
        let schema = json!({"type": "object", "required": ["id"], "properties": {"id": {"type": "integer"}}});
        assert!(validate_against_schema(&schema, &json!({"id": 1}), "payload").is_ok());
        let error = validate_against_schema(&schema, &json!({"id": "x"}), "payload").expect_err("invalid");
        match error {
            EngineError::SchemaValidation { target, violations } => {
                assert_eq!(target, "payload");
                assert_eq!(violations.len(), 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_transform_returns_step_data() {
        let context = VariableContext::default();
        let mut data = Map::new();
        data.insert("users".into(), json!([1]));
        let output = apply_output_transform(None, &context, data, &ExpressionResolver::default()).expect("output");
        assert_eq!(output, json!({"users": [1]}));
    }
}
