//! Patch engine for tool documents.
//!
//! A batch of RFC 6902 operations is validated as a whole, then folded over the tool's JSON
//! form one operation at a time: operation *k* sees the document produced by operations
//! `0..k`. The result must deserialize back into a [`Tool`] without losing any member the
//! batch wrote, and pass the structural rules; any failure rejects the batch and leaves the
//! caller's document untouched.
//!
//! Array index shifts caused by earlier `remove`/`add` operations in the same batch are the
//! caller's responsibility.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use toolflow_types::{PatchOp, StructuralViolation, Tool, ToolDiff, validate_tool_structure};
use tracing::debug;

/// Errors emitted while validating or applying a patch batch.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PatchError {
    /// The batch is malformed; nothing was applied.
    #[error("patch {index} is invalid: {message}")]
    Validation { index: usize, message: String },
    /// The operation needs an existing value at `path`.
    #[error("patch {index} ({}) targets '{path}', which does not resolve to a value", .op.as_str())]
    PathUnresolvable { index: usize, op: PatchOp, path: String },
    /// A `test` operation did not match.
    #[error("patch {index} test failed at '{path}'")]
    TestFailed {
        index: usize,
        path: String,
        expected: Value,
        actual: Option<Value>,
    },
    /// The target exists but cannot take the operation (wrong container, bad index).
    #[error("patch {index} ({}) cannot be applied at '{path}': {message}", .op.as_str())]
    InvalidTarget {
        index: usize,
        op: PatchOp,
        path: String,
        message: String,
    },
    /// The patched document breaks the tool's structural rules.
    #[error("patched tool violates {} structural rule(s)", .violations.len())]
    StructuralInvalid { violations: Vec<StructuralViolation> },
    /// The patched JSON no longer has the shape of a tool.
    #[error("patched document is not a valid tool: {message}")]
    Document { message: String },
    /// Members the tool format does not define; they would be dropped silently.
    #[error("patched document has fields the tool format does not define: {}", .paths.join(", "))]
    UnknownFields { paths: Vec<String> },
}

impl PatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            PatchError::Validation { .. } => "PATCH_VALIDATION",
            PatchError::PathUnresolvable { .. } => "PATH_UNRESOLVABLE",
            PatchError::TestFailed { .. } => "PATCH_TEST_FAILED",
            PatchError::InvalidTarget { .. } => "PATCH_TARGET_INVALID",
            PatchError::StructuralInvalid { .. } => "STRUCTURAL_INVALID",
            PatchError::Document { .. } => "DOCUMENT_INVALID",
            PatchError::UnknownFields { .. } => "UNKNOWN_FIELDS",
        }
    }

    fn suggested_action(&self) -> &'static str {
        match self {
            PatchError::Validation { .. } => "Give every operation an op and a path starting with '/', plus value or from as the op requires.",
            PatchError::PathUnresolvable {
                op: PatchOp::Replace, ..
            } => "Use 'add' for fields that may be unset; 'replace' only targets existing values.",
            PatchError::PathUnresolvable { .. } => "Point the operation at an existing field or array element.",
            PatchError::TestFailed { .. } => "Re-read the document; it no longer holds the tested value.",
            PatchError::InvalidTarget { .. } => "Check the parent container type and array bounds, accounting for earlier operations.",
            PatchError::StructuralInvalid { .. } => "Fix the listed fields so the tool keeps an id, its steps and their required config.",
            PatchError::Document { .. } => "Keep field types consistent with the tool document format.",
            PatchError::UnknownFields { .. } => "Check the listed paths for typos; only fields of the tool document format are kept.",
        }
    }

    fn context(&self) -> Value {
        match self {
            PatchError::Validation { index, .. } => json!({ "index": index }),
            PatchError::PathUnresolvable { index, op, path } | PatchError::InvalidTarget { index, op, path, .. } => {
                json!({ "index": index, "op": op, "path": path })
            }
            PatchError::TestFailed {
                index,
                path,
                expected,
                actual,
            } => json!({ "index": index, "path": path, "expected": expected, "actual": actual }),
            PatchError::StructuralInvalid { violations } => json!({ "violations": violations }),
            PatchError::Document { .. } => json!({}),
            PatchError::UnknownFields { paths } => json!({ "paths": paths }),
        }
    }

    /// Machine-readable payload describing the failure.
    pub fn diagnostic(&self) -> Value {
        json!({
            "error_code": self.error_code(),
            "category": "patch",
            "message": self.to_string(),
            "context": self.context(),
            "suggested_action": self.suggested_action(),
        })
    }
}

/// Result of a successfully applied batch.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatchOutcome {
    pub document: Tool,
    /// The applied operations, one per input patch, without members their op ignores.
    pub diffs: Vec<ToolDiff>,
}

/// Parses a JSON array of patch operations. Malformed entries reject the whole batch.
pub fn parse_patches(value: Value) -> Result<Vec<ToolDiff>, PatchError> {
    let Value::Array(entries) = value else {
        return Err(PatchError::Validation {
            index: 0,
            message: "patch batch must be a JSON array".to_string(),
        });
    };
    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_value(entry).map_err(|error| PatchError::Validation {
                index,
                message: error.to_string(),
            })
        })
        .collect()
}

/// Checks every operation before anything is applied.
pub fn validate_batch(patches: &[ToolDiff]) -> Result<(), PatchError> {
    for (index, patch) in patches.iter().enumerate() {
        let invalid = |message: String| PatchError::Validation { index, message };
        if !patch.path.starts_with('/') {
            return Err(invalid(format!("path '{}' must start with '/'", patch.path)));
        }
        if patch.op.requires_value() && patch.value.is_none() {
            return Err(invalid(format!("'{}' requires a value", patch.op.as_str())));
        }
        if patch.op.requires_from() {
            match patch.from.as_deref() {
                Some(from) if from.starts_with('/') => {}
                Some(from) => return Err(invalid(format!("from '{from}' must start with '/'"))),
                None => return Err(invalid(format!("'{}' requires from", patch.op.as_str()))),
            }
        }
    }
    Ok(())
}

/// Applies `patches` to `tool` and returns the patched document.
pub fn apply_patches(tool: &Tool, patches: &[ToolDiff]) -> Result<PatchOutcome, PatchError> {
    validate_batch(patches)?;

    let mut document = serde_json::to_value(tool).map_err(|error| PatchError::Document {
        message: error.to_string(),
    })?;
    for (index, patch) in patches.iter().enumerate() {
        apply_operation(&mut document, index, patch)?;
    }

    let patched = Tool::deserialize(&document).map_err(|error| PatchError::Document {
        message: error.to_string(),
    })?;
    let kept = serde_json::to_value(&patched).map_err(|error| PatchError::Document {
        message: error.to_string(),
    })?;
    let mut dropped = Vec::new();
    collect_dropped_fields(&document, &kept, "", &mut dropped);
    if !dropped.is_empty() {
        return Err(PatchError::UnknownFields { paths: dropped });
    }
    validate_tool_structure(&patched).map_err(|violations| PatchError::StructuralInvalid { violations })?;

    debug!(tool_id = %patched.id, patch_count = patches.len(), "patch batch applied");
    Ok(PatchOutcome {
        document: patched,
        diffs: patches.iter().map(normalize).collect(),
    })
}

/// Pointers of members present in `patched` but gone from `kept`.
///
/// Members holding `null`, `[]` or `{}` are skipped: the typed document omits empty optional
/// fields when it serializes.
fn collect_dropped_fields(patched: &Value, kept: &Value, pointer: &str, dropped: &mut Vec<String>) {
    match (patched, kept) {
        (Value::Object(patched), Value::Object(kept)) => {
            for (key, value) in patched {
                let child = format!("{pointer}/{}", key.replace('~', "~0").replace('/', "~1"));
                match kept.get(key) {
                    Some(kept_value) => collect_dropped_fields(value, kept_value, &child, dropped),
                    None if is_empty_member(value) => {}
                    None => dropped.push(child),
                }
            }
        }
        (Value::Array(patched), Value::Array(kept)) => {
            for (index, (value, kept_value)) in patched.iter().zip(kept).enumerate() {
                collect_dropped_fields(value, kept_value, &format!("{pointer}/{index}"), dropped);
            }
        }
        _ => {}
    }
}

fn is_empty_member(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn normalize(patch: &ToolDiff) -> ToolDiff {
    ToolDiff {
        op: patch.op,
        path: patch.path.clone(),
        value: patch.value.clone().filter(|_| patch.op.requires_value()),
        from: patch.from.clone().filter(|_| patch.op.requires_from()),
    }
}

fn apply_operation(document: &mut Value, index: usize, patch: &ToolDiff) -> Result<(), PatchError> {
    let op = patch.op;
    let path = patch.path.as_str();
    let unresolvable = || PatchError::PathUnresolvable {
        index,
        op,
        path: path.to_string(),
    };
    // Validation guarantees value/from for the ops that need them.
    let value = || patch.value.clone().unwrap_or(Value::Null);
    let from = patch.from.as_deref().unwrap_or_default();

    match op {
        PatchOp::Add => add(document, index, op, path, value()),
        PatchOp::Remove => remove(document, index, op, path).map(drop),
        PatchOp::Replace => match document.pointer_mut(path) {
            Some(target) if !target.is_null() => {
                *target = value();
                Ok(())
            }
            _ => Err(unresolvable()),
        },
        PatchOp::Move => {
            if from == path {
                return document.pointer(from).map(drop).ok_or_else(unresolvable);
            }
            if path.starts_with(&format!("{from}/")) {
                return Err(PatchError::InvalidTarget {
                    index,
                    op,
                    path: path.to_string(),
                    message: format!("cannot move '{from}' into one of its own children"),
                });
            }
            let moved = remove(document, index, op, from)?;
            add(document, index, op, path, moved)
        }
        PatchOp::Copy => {
            let copied = document.pointer(from).cloned().ok_or_else(|| PatchError::PathUnresolvable {
                index,
                op,
                path: from.to_string(),
            })?;
            add(document, index, op, path, copied)
        }
        PatchOp::Test => {
            let expected = value();
            let actual = document.pointer(path);
            if actual == Some(&expected) {
                Ok(())
            } else {
                Err(PatchError::TestFailed {
                    index,
                    path: path.to_string(),
                    expected,
                    actual: actual.cloned(),
                })
            }
        }
    }
}

/// Splits a pointer into its parent pointer and unescaped last token.
fn split_pointer(path: &str) -> (&str, String) {
    let (parent, token) = path.rsplit_once('/').unwrap_or(("", path));
    (parent, token.replace("~1", "/").replace("~0", "~"))
}

fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) || !token.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

fn add(document: &mut Value, index: usize, op: PatchOp, path: &str, value: Value) -> Result<(), PatchError> {
    let invalid = |message: String| PatchError::InvalidTarget {
        index,
        op,
        path: path.to_string(),
        message,
    };
    let (parent, token) = split_pointer(path);
    let Some(container) = document.pointer_mut(parent) else {
        return Err(invalid(format!("parent '{parent}' does not exist")));
    };
    match container {
        Value::Object(fields) => {
            fields.insert(token, value);
            Ok(())
        }
        Value::Array(items) if token == "-" => {
            items.push(value);
            Ok(())
        }
        Value::Array(items) => match parse_index(&token) {
            Some(position) if position <= items.len() => {
                items.insert(position, value);
                Ok(())
            }
            Some(position) => Err(invalid(format!("index {position} is beyond the array length {}", items.len()))),
            None => Err(invalid(format!("'{token}' is not an array index"))),
        },
        _ => Err(invalid(format!("parent '{parent}' is not an object or array"))),
    }
}

fn remove(document: &mut Value, index: usize, op: PatchOp, path: &str) -> Result<Value, PatchError> {
    let unresolvable = || PatchError::PathUnresolvable {
        index,
        op,
        path: path.to_string(),
    };
    let (parent, token) = split_pointer(path);
    match document.pointer_mut(parent) {
        Some(Value::Object(fields)) => fields.remove(&token).ok_or_else(unresolvable),
        Some(Value::Array(items)) => match parse_index(&token) {
            Some(position) if position < items.len() => Ok(items.remove(position)),
            _ => Err(unresolvable()),
        },
        _ => Err(unresolvable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolflow_types::{FailureBehavior, StepConfig, ToolStep, TransformStepConfig};

    fn sample_tool() -> Tool {
        Tool {
            id: "sample".into(),
            steps: vec![ToolStep {
                id: "shape".into(),
                config: StepConfig::Transform(TransformStepConfig {
                    transform_code: "(ctx) => ctx.items".into(),
                }),
                data_selector: None,
                instruction: None,
                modify: false,
                failure_behavior: FailureBehavior::Fail,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn replace_on_unset_field_is_unresolvable() {
        let tool = sample_tool();
        let error = apply_patches(&tool, &[ToolDiff::replace("/outputTransform", json!("(ctx) => 1"))]).expect_err("unset");
        assert_eq!(error.error_code(), "PATH_UNRESOLVABLE");
        assert_eq!(error.diagnostic()["context"]["path"], json!("/outputTransform"));

        let added = apply_patches(&tool, &[ToolDiff::add("/outputTransform", json!("(ctx) => 1"))]).expect("add");
        assert_eq!(added.document.output_transform.as_deref(), Some("(ctx) => 1"));
    }

    #[test]
    fn operations_see_earlier_results() {
        let patches = vec![
            ToolDiff::add("/instruction", json!("first")),
            ToolDiff::copy_from("/instruction", "/steps/0/instruction"),
            ToolDiff::replace("/instruction", json!("second")),
            ToolDiff::test("/steps/0/instruction", json!("first")),
        ];
        let outcome = apply_patches(&sample_tool(), &patches).expect("apply");
        assert_eq!(outcome.document.instruction.as_deref(), Some("second"));
        assert_eq!(outcome.document.steps[0].instruction.as_deref(), Some("first"));
        assert_eq!(outcome.diffs, patches);
    }

    #[test]
    fn malformed_batch_is_rejected_before_applying() {
        let patches = vec![
            ToolDiff::add("/instruction", json!("ok")),
            ToolDiff {
                op: PatchOp::Move,
                path: "/x".into(),
                value: None,
                from: None,
            },
        ];
        let error = apply_patches(&sample_tool(), &patches).expect_err("missing from");
        assert_eq!(error, PatchError::Validation {
            index: 1,
            message: "'move' requires from".into(),
        });

        let error = validate_batch(&[ToolDiff::remove("steps/0")]).expect_err("relative path");
        assert_eq!(error.error_code(), "PATCH_VALIDATION");
    }

    #[test]
    fn explicit_null_value_is_accepted() {
        let patches = parse_patches(json!([{"op": "add", "path": "/steps/0/instruction", "value": null}])).expect("parse");
        assert_eq!(patches[0].value, Some(Value::Null));
        apply_patches(&sample_tool(), &patches).expect("null instruction is allowed");

        let error = parse_patches(json!([{"op": "add", "path": "/a", "value": 1}, {"path": "/b"}])).expect_err("missing op");
        assert!(matches!(error, PatchError::Validation { index: 1, .. }));
    }

    #[test]
    fn structurally_invalid_results_are_rejected() {
        let tool = sample_tool();
        let error = apply_patches(&tool, &[ToolDiff::remove("/steps/0")]).expect_err("no steps left");
        let PatchError::StructuralInvalid { violations } = &error else {
            panic!("unexpected error {error:?}");
        };
        assert_eq!(violations[0].rule, "steps_or_transform_required");
        assert_eq!(tool, sample_tool());

        let error = apply_patches(&tool, &[ToolDiff::replace("/steps/0/config/type", json!("shell"))]).expect_err("bad type");
        assert_eq!(error.error_code(), "DOCUMENT_INVALID");
    }

    #[test]
    fn members_outside_the_tool_format_are_rejected() {
        let tool = sample_tool();
        let error = apply_patches(&tool, &[ToolDiff::add("/steps/0/dataSelectr", json!("<<items>>"))]).expect_err("typo");
        assert_eq!(error, PatchError::UnknownFields {
            paths: vec!["/steps/0/dataSelectr".to_string()],
        });
        assert_eq!(error.diagnostic()["context"]["paths"], json!(["/steps/0/dataSelectr"]));

        let error = apply_patches(&tool, &[ToolDiff::add("/steps/0/config/transformCod", json!("(ctx) => 1"))]).expect_err("nested typo");
        assert_eq!(error.error_code(), "UNKNOWN_FIELDS");

        let outcome = apply_patches(&tool, &[ToolDiff::add("/steps/0/dataSelector", json!("<<items>>"))]).expect("known field");
        assert_eq!(outcome.document.steps[0].data_selector.as_deref(), Some("<<items>>"));
    }

    #[test]
    fn array_targets_and_moves() {
        let mut step = serde_json::to_value(&sample_tool().steps[0]).expect("step");
        step["id"] = json!("second");
        let outcome = apply_patches(
            &sample_tool(),
            &[
                ToolDiff::add("/steps/-", step),
                ToolDiff::move_from("/steps/1", "/steps/0"),
            ],
        )
        .expect("apply");
        let ids: Vec<&str> = outcome.document.steps.iter().map(|step| step.id.as_str()).collect();
        assert_eq!(ids, vec!["second", "shape"]);

        let error = apply_patches(&sample_tool(), &[ToolDiff::add("/steps/5", json!({}))]).expect_err("out of bounds");
        assert_eq!(error.error_code(), "PATCH_TARGET_INVALID");

        let error = apply_patches(&sample_tool(), &[ToolDiff::move_from("/steps", "/steps/0/extra")]).expect_err("into child");
        assert_eq!(error.error_code(), "PATCH_TARGET_INVALID");
    }

    #[test]
    fn escaped_tokens_address_header_names() {
        let mut tool = sample_tool();
        tool.steps[0].config = StepConfig::Request(toolflow_types::RequestStepConfig {
            system_id: "crm".into(),
            url: "https://crm.example.com".into(),
            ..Default::default()
        });
        let outcome = apply_patches(&tool, &[ToolDiff::add("/steps/0/config/headers", json!({"a/b": "1"}))]).expect("headers");
        let outcome = apply_patches(&outcome.document, &[ToolDiff::replace("/steps/0/config/headers/a~1b", json!("2"))]).expect("escaped");
        let StepConfig::Request(request) = &outcome.document.steps[0].config else {
            panic!("request step expected");
        };
        assert_eq!(request.headers.get("a/b").map(String::as_str), Some("2"));
    }
}
