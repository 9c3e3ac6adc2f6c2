//! Shared type definitions for Toolflow.
//!
//! The engine, the registry and the CLI all speak in terms of the documents defined here:
//! a [`Tool`] with its ordered [`ToolStep`]s, the [`ResultEnvelope`] every step produces,
//! the [`ToolDiff`] patch operations used to edit tools, and the confirmation vocabulary
//! shared by agent-facing tool calls.

pub mod confirmation;
pub mod diff;
pub mod envelope;
pub mod tool;

pub use confirmation::{ConfirmationAction, ConfirmationStatus, ExecutionMode};
pub use diff::{PatchOp, ToolDiff};
pub use envelope::{ResultEnvelope, StepOutcome};
pub use tool::validation::{StructuralViolation, validate_tool_structure};
pub use tool::{
    FailureBehavior, HttpMethod, PaginationConfig, PaginationType, RequestStepConfig, ResponseFilter, ResponseFilterAction,
    ResponseFilterTarget, StepConfig, Tool, ToolStep, TransformStepConfig,
};
