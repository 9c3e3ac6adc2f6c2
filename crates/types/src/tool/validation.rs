//! Structural validation shared by the engine (before a run) and the patch engine (after a patch).
//!
//! The rules are intentionally shallow: they guarantee that a tool can be scheduled, not that
//! its expressions resolve. Each violation carries the JSON pointer of the offending field so
//! an external editor can target it with a follow-up patch.

use std::collections::HashSet;

use serde::Serialize;

use super::{StepConfig, Tool};

/// One broken structural rule.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StructuralViolation {
    /// JSON pointer of the offending field.
    pub path: String,
    /// Stable rule identifier.
    pub rule: &'static str,
    /// Human-readable explanation.
    pub message: String,
}

impl StructuralViolation {
    fn new(path: impl Into<String>, rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rule,
            message: message.into(),
        }
    }
}

/// Validate a tool against the structural invariants.
///
/// Returns every violation rather than the first one so that callers can fix a document in
/// a single round trip.
pub fn validate_tool_structure(tool: &Tool) -> Result<(), Vec<StructuralViolation>> {
    let mut violations = Vec::new();

    if tool.id.trim().is_empty() {
        violations.push(StructuralViolation::new("/id", "tool_id_required", "tool id must be a non-empty string"));
    }

    let has_output_transform = tool
        .output_transform
        .as_deref()
        .is_some_and(|transform| !transform.trim().is_empty());
    if tool.steps.is_empty() && !has_output_transform {
        violations.push(StructuralViolation::new(
            "/steps",
            "steps_or_transform_required",
            "tool must declare at least one step or a non-empty outputTransform",
        ));
    }

    let mut seen_step_ids = HashSet::new();
    for (index, step) in tool.steps.iter().enumerate() {
        let step_path = format!("/steps/{index}");
        if step.id.trim().is_empty() {
            violations.push(StructuralViolation::new(
                format!("{step_path}/id"),
                "step_id_required",
                format!("step {index} must have a non-empty id"),
            ));
        } else if !seen_step_ids.insert(step.id.as_str()) {
            violations.push(StructuralViolation::new(
                format!("{step_path}/id"),
                "step_id_unique",
                format!("duplicate step identifier detected: '{}'", step.id),
            ));
        }

        match &step.config {
            StepConfig::Request(request) => {
                if request.system_id.trim().is_empty() {
                    violations.push(StructuralViolation::new(
                        format!("{step_path}/config/systemId"),
                        "request_system_required",
                        format!("request step '{}' must reference a systemId", step.id),
                    ));
                }
                if request.url.trim().is_empty() {
                    violations.push(StructuralViolation::new(
                        format!("{step_path}/config/url"),
                        "request_url_required",
                        format!("request step '{}' must declare a url", step.id),
                    ));
                }
            }
            StepConfig::Transform(transform) => {
                if transform.transform_code.trim().is_empty() {
                    violations.push(StructuralViolation::new(
                        format!("{step_path}/config/transformCode"),
                        "transform_code_required",
                        format!("transform step '{}' must declare transformCode", step.id),
                    ));
                }
            }
        }
    }

    if violations.is_empty() { Ok(()) } else { Err(violations) }
}
