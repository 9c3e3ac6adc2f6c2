//! Result envelopes produced by every executed step.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Uniform wrapper around one step invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    /// The element (or synthetic single object) the invocation operated on.
    pub current_item: JsonValue,
    /// Connector or transform output.
    pub data: JsonValue,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub fn ok(current_item: JsonValue, data: JsonValue) -> Self {
        Self {
            current_item,
            data,
            success: true,
            error: None,
        }
    }

    pub fn failed(current_item: JsonValue, data: JsonValue, error: impl Into<String>) -> Self {
        Self {
            current_item,
            data,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Stored result of a step: one envelope for single execution, an ordered sequence for loops.
///
/// Serializes untagged so that downstream expressions see exactly the wire shape
/// `{currentItem, data, success, error?}` or an array of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StepOutcome {
    Loop(Vec<ResultEnvelope>),
    Single(ResultEnvelope),
}

impl StepOutcome {
    /// Envelopes in input order.
    pub fn entries(&self) -> &[ResultEnvelope] {
        match self {
            StepOutcome::Single(envelope) => std::slice::from_ref(envelope),
            StepOutcome::Loop(entries) => entries,
        }
    }

    /// `.data` for single results; an array of every entry's `.data` for loops.
    pub fn data(&self) -> JsonValue {
        match self {
            StepOutcome::Single(envelope) => envelope.data.clone(),
            StepOutcome::Loop(entries) => JsonValue::Array(entries.iter().map(|entry| entry.data.clone()).collect()),
        }
    }

    /// True when every entry succeeded. An empty loop counts as success.
    pub fn is_success(&self) -> bool {
        self.entries().iter().all(|entry| entry.success)
    }

    /// Errors reported by failed entries, in order.
    pub fn errors(&self) -> Vec<&str> {
        self.entries().iter().filter_map(|entry| entry.error.as_deref()).collect()
    }

    pub fn is_loop(&self) -> bool {
        matches!(self, StepOutcome::Loop(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            StepOutcome::Single(envelope) => envelope_to_json(envelope),
            StepOutcome::Loop(entries) => JsonValue::Array(entries.iter().map(envelope_to_json).collect()),
        }
    }
}

fn envelope_to_json(envelope: &ResultEnvelope) -> JsonValue {
    let mut map = serde_json::Map::new();
    map.insert("currentItem".into(), envelope.current_item.clone());
    map.insert("data".into(), envelope.data.clone());
    map.insert("success".into(), JsonValue::Bool(envelope.success));
    if let Some(error) = &envelope.error {
        map.insert("error".into(), JsonValue::String(error.clone()));
    }
    JsonValue::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_serializes_as_plain_envelope() {
        let outcome = StepOutcome::Single(ResultEnvelope::ok(json!({}), json!({"id": 1})));
        assert_eq!(
            serde_json::to_value(&outcome).expect("serialize"),
            json!({"currentItem": {}, "data": {"id": 1}, "success": true})
        );
        assert_eq!(outcome.to_json(), serde_json::to_value(&outcome).expect("serialize"));
    }

    #[test]
    fn loop_accessors_preserve_order() {
        let outcome = StepOutcome::Loop(vec![
            ResultEnvelope::ok(json!({"id": 1}), json!("a")),
            ResultEnvelope::failed(json!({"id": 2}), JsonValue::Null, "boom"),
        ]);
        assert_eq!(outcome.data(), json!(["a", null]));
        assert!(!outcome.is_success());
        assert_eq!(outcome.errors(), vec!["boom"]);

        let decoded: StepOutcome = serde_json::from_value(outcome.to_json()).expect("decode");
        assert!(decoded.is_loop());
        assert_eq!(decoded, outcome);
    }
}
