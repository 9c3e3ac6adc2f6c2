//! Error taxonomy of the execution engine.
//!
//! Every variant is step-fatal at worst: the orchestrator reports it together with the results
//! of the steps that completed before it. [`EngineError::diagnostic`] renders the payload an
//! external caller (human or model) uses to correct the tool document.

use serde_json::{Value, json};
use thiserror::Error;
use toolflow_types::StructuralViolation;

use crate::sandbox::SandboxError;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("syntax error in expression '{expression}': {message}")]
    ExpressionSyntax { expression: String, message: String },

    #[error("{}", resolution_message(expression, message, available_keys))]
    Resolution {
        expression: String,
        message: String,
        available_keys: Vec<String>,
    },

    #[error("expression '{expression}' exceeded its evaluation budget: {message}")]
    SandboxTimeout { expression: String, message: String },

    #[error("data selector of step '{step_id}' must return an object or an array, got {found}")]
    SelectorType { step_id: String, found: String },

    #[error("connector failed for step '{step_id}': {message}")]
    Connector { step_id: String, message: String },

    #[error("payload must be a JSON object, got {found}")]
    InvalidPayload { found: String },

    #[error("{target} failed schema validation: {}", violations.join("; "))]
    SchemaValidation { target: String, violations: Vec<String> },

    #[error("tool '{tool_id}' is structurally invalid: {}", describe_violations(violations))]
    StructuralInvalid {
        tool_id: String,
        violations: Vec<StructuralViolation>,
    },

    #[error("response filter '{filter_id}' rejected the output: {message}")]
    ResponseFilter { filter_id: String, message: String },

    #[error("run '{run_id}' aborted: {reason}")]
    Aborted { run_id: String, reason: String },
}

fn resolution_message(expression: &str, message: &str, available_keys: &[String]) -> String {
    let keys = if available_keys.is_empty() {
        "(none)".to_string()
    } else {
        available_keys.join(", ")
    };
    format!("failed to resolve '{expression}': {message}. Available keys: {keys}")
}

fn describe_violations(violations: &[StructuralViolation]) -> String {
    violations
        .iter()
        .map(|violation| format!("{} ({})", violation.message, violation.path))
        .collect::<Vec<_>>()
        .join("; ")
}

impl EngineError {
    /// Classifies a sandbox failure raised while evaluating `expression`.
    pub fn from_sandbox(expression: &str, error: SandboxError, available_keys: Vec<String>) -> Self {
        let expression = expression.to_string();
        if error.is_syntax() || matches!(error, SandboxError::NotAFunction) {
            EngineError::ExpressionSyntax {
                expression,
                message: error.to_string(),
            }
        } else if error.is_budget_exhausted() || matches!(error, SandboxError::Cancelled | SandboxError::Worker(_)) {
            EngineError::SandboxTimeout {
                expression,
                message: error.to_string(),
            }
        } else {
            EngineError::Resolution {
                expression,
                message: error.to_string(),
                available_keys,
            }
        }
    }

    /// Stable identifier of the error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::ExpressionSyntax { .. } => "EXPRESSION_SYNTAX",
            EngineError::Resolution { .. } => "RESOLUTION_FAILED",
            EngineError::SandboxTimeout { .. } => "SANDBOX_TIMEOUT",
            EngineError::SelectorType { .. } => "SELECTOR_TYPE",
            EngineError::Connector { .. } => "CONNECTOR_FAILED",
            EngineError::InvalidPayload { .. } => "INVALID_PAYLOAD",
            EngineError::SchemaValidation { .. } => "SCHEMA_VALIDATION_FAILED",
            EngineError::StructuralInvalid { .. } => "STRUCTURAL_INVALID",
            EngineError::ResponseFilter { .. } => "RESPONSE_FILTER_REJECTED",
            EngineError::Aborted { .. } => "ABORTED",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            EngineError::ExpressionSyntax { .. } | EngineError::Resolution { .. } | EngineError::SandboxTimeout { .. } => "expression",
            EngineError::SelectorType { .. } => "selector",
            EngineError::Connector { .. } => "connector",
            EngineError::InvalidPayload { .. } | EngineError::SchemaValidation { .. } | EngineError::ResponseFilter { .. } => "validation",
            EngineError::StructuralInvalid { .. } => "structure",
            EngineError::Aborted { .. } => "cancellation",
        }
    }

    /// True for cancellation and timeout outcomes.
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted { .. })
    }

    fn suggested_action(&self) -> &'static str {
        match self {
            EngineError::ExpressionSyntax { .. } => {
                "Use a bare top-level key or a single-parameter arrow function such as (ctx) => ctx.key."
            }
            EngineError::Resolution { .. } => "Reference only the available keys listed in the context; guard optional fields.",
            EngineError::SandboxTimeout { .. } => "Simplify the expression or reduce the amount of data it iterates over.",
            EngineError::SelectorType { .. } => "Make the data selector return an object for single execution or an array to loop.",
            EngineError::Connector { .. } => "Check the request url, credentials and the remote system's response.",
            EngineError::InvalidPayload { .. } => "Pass the payload as a JSON object.",
            EngineError::SchemaValidation { .. } => "Adjust the payload or output to satisfy the declared schema.",
            EngineError::StructuralInvalid { .. } => "Fix the listed fields and submit the tool again.",
            EngineError::ResponseFilter { .. } => "Remove the matched data from the output or relax the filter pattern.",
            EngineError::Aborted { .. } => "Re-run the tool or raise the run timeout.",
        }
    }

    fn context(&self) -> Value {
        match self {
            EngineError::ExpressionSyntax { expression, .. } | EngineError::SandboxTimeout { expression, .. } => {
                json!({ "expression": expression })
            }
            EngineError::Resolution {
                expression,
                available_keys,
                ..
            } => json!({ "expression": expression, "available_keys": available_keys }),
            EngineError::SelectorType { step_id, found } => json!({ "step_id": step_id, "found": found }),
            EngineError::Connector { step_id, .. } => json!({ "step_id": step_id }),
            EngineError::InvalidPayload { found } => json!({ "found": found }),
            EngineError::SchemaValidation { target, violations } => json!({ "target": target, "violations": violations }),
            EngineError::StructuralInvalid { tool_id, violations } => json!({ "tool_id": tool_id, "violations": violations }),
            EngineError::ResponseFilter { filter_id, .. } => json!({ "filter_id": filter_id }),
            EngineError::Aborted { run_id, reason } => json!({ "run_id": run_id, "reason": reason }),
        }
    }

    /// Machine-readable payload describing the failure.
    pub fn diagnostic(&self) -> Value {
        json!({
            "error_code": self.error_code(),
            "category": self.category(),
            "message": self.to_string(),
            "context": self.context(),
            "suggested_action": self.suggested_action(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_message_lists_available_keys() {
        let error = EngineError::Resolution {
            expression: "missing".into(),
            message: "no such key".into(),
            available_keys: vec!["users".into(), "page".into()],
        };
        assert_eq!(error.to_string(), "failed to resolve 'missing': no such key. Available keys: users, page");
        let diagnostic = error.diagnostic();
        assert_eq!(diagnostic["error_code"], "RESOLUTION_FAILED");
        assert_eq!(diagnostic["context"]["available_keys"], json!(["users", "page"]));
    }

    #[test]
    fn sandbox_errors_are_classified() {
        let syntax = EngineError::from_sandbox(
            "(ctx) =>",
            SandboxError::Syntax {
                message: "unexpected end".into(),
                position: 8,
            },
            vec![],
        );
        assert_eq!(syntax.error_code(), "EXPRESSION_SYNTAX");

        let budget = EngineError::from_sandbox("(ctx) => 1", SandboxError::StepBudgetExceeded { max_steps: 10 }, vec![]);
        assert_eq!(budget.error_code(), "SANDBOX_TIMEOUT");

        let reference = EngineError::from_sandbox("(ctx) => x", SandboxError::Reference("x is not defined".into()), vec!["a".into()]);
        assert_eq!(reference.error_code(), "RESOLUTION_FAILED");
        assert!(reference.to_string().contains("Available keys: a"));
    }
}
