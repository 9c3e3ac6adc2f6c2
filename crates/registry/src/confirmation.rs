//! Confirmation state machine for agent-facing tool calls.
//!
//! Every call is tracked by a [`ConfirmationRecord`] keyed by call id:
//!
//! ```text
//! auto, confirm_after_execution:
//!   pending -> running -> completed
//!                      -> awaiting_confirmation -> completed | declined
//!                      -> error
//!
//! confirm_before_execution:
//!   pending -> awaiting_confirmation -> running -> completed | error
//!                                    -> declined
//! ```
//!
//! The [`ConfirmationPolicy`] of a tool type decides where a call waits. After-execution calls
//! run their action and park the result; before-execution calls are parked by
//! [`ConfirmationRegistry::mark_running`] and their action only runs once `confirmed` releases
//! them. A call whose action failed goes straight to `error`. Edit calls may be resolved with
//! `partial`, which replays only the approved patches against the original document. The registry is owned by its session and passed by reference; there is no
//! process-wide state.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use toolflow_types::{ConfirmationAction, ConfirmationStatus, ExecutionMode, Tool, ToolDiff};
use tracing::{debug, info, warn};

use crate::patch::{PatchError, apply_patches};
use crate::policy::{AUTHENTICATE_OAUTH, ConfirmationPolicy, EDIT_TOOL};

/// Shape of the action behind a call, which decides the resolutions it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Edit,
    Oauth,
    Generic,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Edit => "edit",
            CallKind::Oauth => "oauth",
            CallKind::Generic => "generic",
        }
    }

    fn for_tool_type(tool_type: &str) -> Self {
        match tool_type {
            EDIT_TOOL => CallKind::Edit,
            AUTHENTICATE_OAUTH => CallKind::Oauth,
            _ => CallKind::Generic,
        }
    }

    fn accepts(&self, action: ConfirmationAction) -> bool {
        match action {
            ConfirmationAction::Declined => true,
            ConfirmationAction::Confirmed => *self != CallKind::Oauth,
            ConfirmationAction::Partial => *self == CallKind::Edit,
            ConfirmationAction::OauthSuccess | ConfirmationAction::OauthFailure => *self == CallKind::Oauth,
        }
    }
}

/// External event resolving a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Confirmed,
    Declined,
    /// Indices into the proposed patch batch that the caller approved.
    Partial { approved: Vec<usize> },
    /// Token payload of a completed authorization.
    OauthSuccess(Value),
    OauthFailure(String),
}

impl Resolution {
    pub fn action(&self) -> ConfirmationAction {
        match self {
            Resolution::Confirmed => ConfirmationAction::Confirmed,
            Resolution::Declined => ConfirmationAction::Declined,
            Resolution::Partial { .. } => ConfirmationAction::Partial,
            Resolution::OauthSuccess(_) => ConfirmationAction::OauthSuccess,
            Resolution::OauthFailure(_) => ConfirmationAction::OauthFailure,
        }
    }

    /// Builds a resolution from its wire form. `partial` needs the approved indices.
    pub fn from_action(action: ConfirmationAction, approved: Option<Vec<usize>>, payload: Option<Value>) -> Result<Self, ConfirmationError> {
        Ok(match action {
            ConfirmationAction::Confirmed => Resolution::Confirmed,
            ConfirmationAction::Declined => Resolution::Declined,
            ConfirmationAction::Partial => Resolution::Partial {
                approved: approved.ok_or(ConfirmationError::MissingApproval)?,
            },
            ConfirmationAction::OauthSuccess => Resolution::OauthSuccess(payload.unwrap_or(Value::Null)),
            ConfirmationAction::OauthFailure => Resolution::OauthFailure(match payload {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => "authorization failed".to_string(),
            }),
        })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfirmationError {
    #[error("unknown tool call '{call_id}'")]
    UnknownCall { call_id: String },
    #[error("tool call '{call_id}' already exists")]
    DuplicateCall { call_id: String },
    #[error("tool call '{call_id}' is {status} and cannot {event}")]
    InvalidTransition {
        call_id: String,
        status: ConfirmationStatus,
        event: String,
    },
    #[error("'{action}' does not apply to {} call '{call_id}'", .kind.as_str())]
    ActionNotApplicable {
        call_id: String,
        action: ConfirmationAction,
        kind: CallKind,
    },
    #[error("a partial resolution needs the list of approved patches")]
    MissingApproval,
    #[error("approved patch {index} of call '{call_id}' is out of range ({len} proposed)")]
    ApprovalOutOfRange { call_id: String, index: usize, len: usize },
    #[error("patches of call '{call_id}' could not be applied: {source}")]
    Patch {
        call_id: String,
        #[source]
        source: PatchError,
    },
}

impl ConfirmationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ConfirmationError::UnknownCall { .. } => "UNKNOWN_CALL",
            ConfirmationError::DuplicateCall { .. } => "DUPLICATE_CALL",
            ConfirmationError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ConfirmationError::ActionNotApplicable { .. } => "ACTION_NOT_APPLICABLE",
            ConfirmationError::MissingApproval => "MISSING_APPROVAL",
            ConfirmationError::ApprovalOutOfRange { .. } => "APPROVAL_OUT_OF_RANGE",
            ConfirmationError::Patch { source, .. } => source.error_code(),
        }
    }

    /// Machine-readable payload describing the failure. Patch failures carry the patch
    /// diagnostic under `context.patch`.
    pub fn diagnostic(&self) -> Value {
        let context = match self {
            ConfirmationError::UnknownCall { call_id } | ConfirmationError::DuplicateCall { call_id } => json!({ "call_id": call_id }),
            ConfirmationError::InvalidTransition { call_id, status, event } => {
                json!({ "call_id": call_id, "status": status, "event": event })
            }
            ConfirmationError::ActionNotApplicable { call_id, action, kind } => {
                json!({ "call_id": call_id, "action": action, "kind": kind })
            }
            ConfirmationError::MissingApproval => json!({}),
            ConfirmationError::ApprovalOutOfRange { call_id, index, len } => {
                json!({ "call_id": call_id, "index": index, "proposed": len })
            }
            ConfirmationError::Patch { call_id, source } => json!({ "call_id": call_id, "patch": source.diagnostic() }),
        };
        let suggested_action = match self {
            ConfirmationError::UnknownCall { .. } => "Start the call before resolving it.",
            ConfirmationError::DuplicateCall { .. } => "Use a new call id for every tool call.",
            ConfirmationError::InvalidTransition { .. } => "Only calls awaiting confirmation can be confirmed, declined or partially approved.",
            ConfirmationError::ActionNotApplicable { .. } => "Use partial only for edit calls and oauth actions only for OAuth calls.",
            ConfirmationError::MissingApproval => "Pass the indices of the approved patches.",
            ConfirmationError::ApprovalOutOfRange { .. } => "Approve indices within the proposed patch list.",
            ConfirmationError::Patch { .. } => "Approve a subset whose patches do not depend on rejected ones.",
        };
        json!({
            "error_code": self.error_code(),
            "category": "confirmation",
            "message": self.to_string(),
            "context": context,
            "suggested_action": suggested_action,
        })
    }
}

#[derive(Debug, Clone)]
struct EditProposal {
    original: Tool,
    patches: Vec<ToolDiff>,
    proposed: Option<Tool>,
    committed: Option<Tool>,
}

/// Lifecycle record of one tool call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRecord {
    pub call_id: String,
    pub tool_type: String,
    pub kind: CallKind,
    pub mode: ExecutionMode,
    pub status: ConfirmationStatus,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub applied_diffs: Vec<ToolDiff>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected_diffs: Vec<ToolDiff>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    edit: Option<EditProposal>,
}

impl ConfirmationRecord {
    fn new(call_id: String, tool_type: String, mode: ExecutionMode, input: Value) -> Self {
        let now = Utc::now();
        Self {
            kind: CallKind::for_tool_type(&tool_type),
            call_id,
            tool_type,
            mode,
            status: ConfirmationStatus::Pending,
            input,
            output: None,
            error: None,
            applied_diffs: Vec::new(),
            rejected_diffs: Vec::new(),
            created_at: now,
            updated_at: now,
            edit: None,
        }
    }

    /// Patched document of an edit call, once it completed.
    pub fn committed_document(&self) -> Option<&Tool> {
        self.edit.as_ref().and_then(|edit| edit.committed.as_ref())
    }

    /// Patched document proposed by an edit call that has not been resolved yet.
    pub fn proposed_document(&self) -> Option<&Tool> {
        self.edit.as_ref().and_then(|edit| edit.proposed.as_ref())
    }

    /// Patches proposed by an edit call, in submission order.
    pub fn proposed_patches(&self) -> &[ToolDiff] {
        self.edit.as_ref().map(|edit| edit.patches.as_slice()).unwrap_or_default()
    }

    fn transition(&mut self, status: ConfirmationStatus) {
        debug!(call_id = %self.call_id, from = %self.status, to = %status, "tool call transition");
        self.status = status;
        self.updated_at = Utc::now();
    }

    fn invalid(&self, event: &str) -> ConfirmationError {
        ConfirmationError::InvalidTransition {
            call_id: self.call_id.clone(),
            status: self.status,
            event: event.to_string(),
        }
    }

    fn commit_edit(&mut self, document: Tool, applied: Vec<ToolDiff>, rejected: Vec<ToolDiff>) {
        self.output = Some(json!({ "document": document, "diffs": applied }));
        self.applied_diffs = applied;
        self.rejected_diffs = rejected;
        if let Some(edit) = self.edit.as_mut() {
            edit.committed = Some(document);
        }
    }
}

/// Records of the tool calls of one session, keyed by call id.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationRegistry {
    policy: ConfirmationPolicy,
    records: IndexMap<String, ConfirmationRecord>,
}

impl ConfirmationRegistry {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            policy,
            records: IndexMap::new(),
        }
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub fn get(&self, call_id: &str) -> Option<&ConfirmationRecord> {
        self.records.get(call_id)
    }

    /// Drops the record of a call, typically once the caller has read its outcome.
    pub fn remove(&mut self, call_id: &str) -> Option<ConfirmationRecord> {
        self.records.shift_remove(call_id)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Calls waiting for a confirmation action, oldest first.
    pub fn awaiting(&self) -> Vec<&ConfirmationRecord> {
        self.records
            .values()
            .filter(|record| record.status == ConfirmationStatus::AwaitingConfirmation)
            .collect()
    }

    /// Registers a new call in `pending`.
    pub fn start_call(&mut self, call_id: &str, tool_type: &str, input: Value) -> Result<&ConfirmationRecord, ConfirmationError> {
        if self.records.contains_key(call_id) {
            return Err(ConfirmationError::DuplicateCall {
                call_id: call_id.to_string(),
            });
        }
        let mode = self.policy.mode_for(tool_type);
        let record = ConfirmationRecord::new(call_id.to_string(), tool_type.to_string(), mode, input);
        info!(call_id = %call_id, tool_type = %tool_type, mode = ?mode, "tool call started");
        Ok(&*self.records.entry(call_id.to_string()).or_insert(record))
    }

    /// Registers an edit call proposing `patches` against `original`.
    pub fn start_edit(&mut self, call_id: &str, original: Tool, patches: Vec<ToolDiff>) -> Result<&ConfirmationRecord, ConfirmationError> {
        let input = json!({ "toolId": original.id, "patches": patches });
        self.start_call(call_id, EDIT_TOOL, input)?;
        let record = self.record_mut(call_id)?;
        record.edit = Some(EditProposal {
            original,
            patches,
            proposed: None,
            committed: None,
        });
        Ok(&*record)
    }

    /// Moves a pending call towards its action. Before-execution calls are parked in
    /// `awaiting_confirmation` instead; callers run the action only once the record is `running`.
    pub fn mark_running(&mut self, call_id: &str) -> Result<&ConfirmationRecord, ConfirmationError> {
        let record = self.record_mut(call_id)?;
        if record.status != ConfirmationStatus::Pending {
            return Err(record.invalid("start running"));
        }
        if record.mode.confirms_before() {
            info!(call_id = %call_id, tool_type = %record.tool_type, "tool call waiting for confirmation before execution");
            record.transition(ConfirmationStatus::AwaitingConfirmation);
        } else {
            record.transition(ConfirmationStatus::Running);
        }
        Ok(&*record)
    }

    /// Records the outcome of a running call's action. Failures end in `error`; successes
    /// wait for confirmation in after-execution mode and complete otherwise.
    pub fn complete_call(&mut self, call_id: &str, outcome: Result<Value, String>) -> Result<&ConfirmationRecord, ConfirmationError> {
        let record = self.record_mut(call_id)?;
        if record.status != ConfirmationStatus::Running {
            return Err(record.invalid("complete"));
        }
        match outcome {
            Err(error) => {
                warn!(call_id = %call_id, error = %error, "tool call failed");
                record.error = Some(error);
                record.transition(ConfirmationStatus::Error);
            }
            Ok(output) => {
                record.output = Some(output);
                if record.mode.confirms_after() {
                    record.transition(ConfirmationStatus::AwaitingConfirmation);
                } else {
                    if let Some(edit) = record.edit.as_mut() {
                        edit.committed = edit.proposed.clone();
                        record.applied_diffs = edit.patches.clone();
                    }
                    record.transition(ConfirmationStatus::Completed);
                }
            }
        }
        Ok(&*record)
    }

    /// Runs the patch engine for a started edit call and records the proposal. Before-execution
    /// edits stay parked without touching the document until they are confirmed.
    pub fn run_edit(&mut self, call_id: &str) -> Result<&ConfirmationRecord, ConfirmationError> {
        if self.record_mut(call_id)?.status == ConfirmationStatus::Pending {
            self.mark_running(call_id)?;
        }
        let parked = {
            let record = self.record_mut(call_id)?;
            record.mode.confirms_before() && record.status == ConfirmationStatus::AwaitingConfirmation
        };
        if parked {
            return self.record_mut(call_id).map(|record| &*record);
        }
        self.apply_edit(call_id)
    }

    fn apply_edit(&mut self, call_id: &str) -> Result<&ConfirmationRecord, ConfirmationError> {
        let record = self.record_mut(call_id)?;
        let Some(edit) = record.edit.as_mut() else {
            return Err(ConfirmationError::ActionNotApplicable {
                call_id: call_id.to_string(),
                action: ConfirmationAction::Confirmed,
                kind: record.kind,
            });
        };

        match apply_patches(&edit.original, &edit.patches) {
            Ok(outcome) => {
                let output = json!({ "document": outcome.document, "diffs": outcome.diffs });
                edit.proposed = Some(outcome.document);
                self.complete_call(call_id, Ok(output))
            }
            Err(source) => {
                let record = self.record_mut(call_id)?;
                record.output = Some(source.diagnostic());
                if record.status == ConfirmationStatus::Running {
                    record.error = Some(source.to_string());
                    record.transition(ConfirmationStatus::Error);
                }
                Err(ConfirmationError::Patch {
                    call_id: call_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Applies an external confirmation action.
    ///
    /// Confirming a before-execution call releases it to `running`; edit calls then apply their
    /// patches right away. A `partial` replay that fails leaves the call in
    /// `awaiting_confirmation` so that the caller can resolve it again.
    pub fn resolve(&mut self, call_id: &str, resolution: Resolution) -> Result<&ConfirmationRecord, ConfirmationError> {
        let action = resolution.action();
        let release = {
            let record = self.record_mut(call_id)?;
            if !record.kind.accepts(action) {
                return Err(ConfirmationError::ActionNotApplicable {
                    call_id: call_id.to_string(),
                    action,
                    kind: record.kind,
                });
            }
            action == ConfirmationAction::Confirmed
                && record.mode.confirms_before()
                && record.status == ConfirmationStatus::AwaitingConfirmation
        };
        if release {
            return self.release(call_id);
        }

        let record = self.record_mut(call_id)?;

        match resolution {
            Resolution::OauthSuccess(token) => {
                ensure_status(record, &[ConfirmationStatus::Running, ConfirmationStatus::AwaitingConfirmation], action)?;
                record.output = Some(token);
                record.transition(ConfirmationStatus::Completed);
            }
            Resolution::OauthFailure(message) => {
                ensure_status(record, &[ConfirmationStatus::Running, ConfirmationStatus::AwaitingConfirmation], action)?;
                record.error = Some(message);
                record.transition(ConfirmationStatus::Error);
            }
            Resolution::Confirmed => {
                ensure_status(record, &[ConfirmationStatus::AwaitingConfirmation], action)?;
                if let Some(edit) = record.edit.clone()
                    && let Some(proposed) = edit.proposed
                {
                    record.commit_edit(proposed, edit.patches, Vec::new());
                }
                record.transition(ConfirmationStatus::Completed);
            }
            Resolution::Declined => {
                ensure_status(record, &[ConfirmationStatus::AwaitingConfirmation], action)?;
                record.rejected_diffs = record.proposed_patches().to_vec();
                record.output = None;
                record.transition(ConfirmationStatus::Declined);
            }
            Resolution::Partial { approved } => {
                ensure_status(record, &[ConfirmationStatus::AwaitingConfirmation], action)?;
                let (original, patches) = match &record.edit {
                    Some(edit) => (edit.original.clone(), edit.patches.clone()),
                    None => (Tool::default(), Vec::new()),
                };
                let (approved_patches, rejected_patches) = split_approved(call_id, &patches, approved)?;
                let outcome = apply_patches(&original, &approved_patches).map_err(|source| {
                    warn!(call_id = %call_id, error_code = source.error_code(), "partial replay failed");
                    ConfirmationError::Patch {
                        call_id: call_id.to_string(),
                        source,
                    }
                })?;
                record.commit_edit(outcome.document, outcome.diffs, rejected_patches);
                record.transition(ConfirmationStatus::Completed);
            }
        }

        info!(
            call_id = %call_id,
            action = %action,
            status = %record.status,
            applied = record.applied_diffs.len(),
            rejected = record.rejected_diffs.len(),
            "tool call resolved"
        );
        Ok(&*record)
    }

    fn release(&mut self, call_id: &str) -> Result<&ConfirmationRecord, ConfirmationError> {
        let is_edit = {
            let record = self.record_mut(call_id)?;
            record.transition(ConfirmationStatus::Running);
            info!(call_id = %call_id, tool_type = %record.tool_type, "tool call released for execution");
            record.edit.is_some()
        };
        if is_edit {
            self.apply_edit(call_id)
        } else {
            self.record_mut(call_id).map(|record| &*record)
        }
    }

    fn record_mut(&mut self, call_id: &str) -> Result<&mut ConfirmationRecord, ConfirmationError> {
        self.records.get_mut(call_id).ok_or_else(|| ConfirmationError::UnknownCall {
            call_id: call_id.to_string(),
        })
    }
}

fn ensure_status(record: &ConfirmationRecord, allowed: &[ConfirmationStatus], action: ConfirmationAction) -> Result<(), ConfirmationError> {
    if allowed.contains(&record.status) {
        Ok(())
    } else {
        Err(record.invalid(&format!("be resolved with '{action}'")))
    }
}

/// Splits the proposed batch into approved and rejected operations, both in submission order.
fn split_approved(call_id: &str, patches: &[ToolDiff], mut approved: Vec<usize>) -> Result<(Vec<ToolDiff>, Vec<ToolDiff>), ConfirmationError> {
    approved.sort_unstable();
    approved.dedup();
    if let Some(&index) = approved.iter().find(|&&index| index >= patches.len()) {
        return Err(ConfirmationError::ApprovalOutOfRange {
            call_id: call_id.to_string(),
            index,
            len: patches.len(),
        });
    }
    let (approved, rejected): (Vec<_>, Vec<_>) = patches
        .iter()
        .enumerate()
        .partition(|(index, _)| approved.binary_search(index).is_ok());
    let strip = |entries: Vec<(usize, &ToolDiff)>| -> Vec<ToolDiff> { entries.into_iter().map(|(_, patch)| patch.clone()).collect() };
    Ok((strip(approved), strip(rejected)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolflow_types::{FailureBehavior, StepConfig, ToolStep, TransformStepConfig};

    fn tool() -> Tool {
        Tool {
            id: "sample".into(),
            steps: vec![ToolStep {
                id: "shape".into(),
                config: StepConfig::Transform(TransformStepConfig {
                    transform_code: "(ctx) => 1".into(),
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
    fn failed_actions_never_wait_for_confirmation() {
        let mut registry = ConfirmationRegistry::new(ConfirmationPolicy::default().with_mode("run_tool", ExecutionMode::ConfirmAfterExecution));
        registry.start_call("call-1", "run_tool", json!({"toolId": "sample"})).expect("start");
        registry.mark_running("call-1").expect("running");
        let record = registry.complete_call("call-1", Err("connector refused".into())).expect("complete");
        assert_eq!(record.status, ConfirmationStatus::Error);
        assert!(registry.awaiting().is_empty());

        let error = registry.resolve("call-1", Resolution::Confirmed).expect_err("terminal");
        assert_eq!(error.error_code(), "INVALID_TRANSITION");
    }

    #[test]
    fn auto_mode_completes_immediately() {
        let mut registry = ConfirmationRegistry::new(ConfirmationPolicy::auto());
        registry.start_edit("edit-1", tool(), vec![ToolDiff::add("/instruction", json!("hi"))]).expect("start");
        let record = registry.run_edit("edit-1").expect("run");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert_eq!(record.committed_document().and_then(|tool| tool.instruction.as_deref()), Some("hi"));
        assert_eq!(record.applied_diffs.len(), 1);
    }

    #[test]
    fn confirm_and_decline_edit_calls() {
        let mut registry = ConfirmationRegistry::default();
        let patches = vec![ToolDiff::add("/instruction", json!("hi"))];
        registry.start_edit("edit-1", tool(), patches.clone()).expect("start");
        let record = registry.run_edit("edit-1").expect("run");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
        assert!(record.committed_document().is_none());
        assert!(record.proposed_document().is_some());

        let record = registry.resolve("edit-1", Resolution::Confirmed).expect("confirm");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert_eq!(record.applied_diffs, patches);

        registry.start_edit("edit-2", tool(), patches.clone()).expect("start");
        registry.run_edit("edit-2").expect("run");
        let record = registry.resolve("edit-2", Resolution::Declined).expect("decline");
        assert_eq!(record.status, ConfirmationStatus::Declined);
        assert_eq!(record.rejected_diffs, patches);
        assert!(record.committed_document().is_none());
    }

    #[test]
    fn after_execution_parks_the_result() {
        let mut registry = ConfirmationRegistry::new(ConfirmationPolicy::auto().with_mode("run_tool", ExecutionMode::ConfirmAfterExecution));
        registry.start_call("call-1", "run_tool", json!({"toolId": "sample"})).expect("start");
        let record = registry.mark_running("call-1").expect("running");
        assert_eq!(record.status, ConfirmationStatus::Running);

        let record = registry.complete_call("call-1", Ok(json!({"rows": 3}))).expect("complete");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
        assert_eq!(record.output, Some(json!({"rows": 3})));

        let record = registry.resolve("call-1", Resolution::Confirmed).expect("confirm");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert_eq!(record.output, Some(json!({"rows": 3})));
    }

    #[test]
    fn before_execution_holds_the_action_until_confirmed() {
        let mut registry = ConfirmationRegistry::new(ConfirmationPolicy::auto().with_mode("run_tool", ExecutionMode::ConfirmBeforeExecution));
        registry.start_call("call-1", "run_tool", json!({"toolId": "sample"})).expect("start");
        let record = registry.mark_running("call-1").expect("parked");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
        assert!(record.output.is_none());

        let error = registry.complete_call("call-1", Ok(json!({}))).expect_err("action has not been released");
        assert_eq!(error.error_code(), "INVALID_TRANSITION");

        let record = registry.resolve("call-1", Resolution::Confirmed).expect("release");
        assert_eq!(record.status, ConfirmationStatus::Running);
        let record = registry.complete_call("call-1", Ok(json!({"rows": 3}))).expect("complete");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert!(registry.awaiting().is_empty());

        registry.start_call("call-2", "run_tool", Value::Null).expect("start");
        registry.mark_running("call-2").expect("parked");
        let record = registry.resolve("call-2", Resolution::Declined).expect("decline");
        assert_eq!(record.status, ConfirmationStatus::Declined);
        assert!(registry.complete_call("call-2", Ok(Value::Null)).is_err());
    }

    #[test]
    fn before_execution_edits_patch_only_on_confirmation() {
        let mut registry = ConfirmationRegistry::new(ConfirmationPolicy::auto().with_mode(EDIT_TOOL, ExecutionMode::ConfirmBeforeExecution));
        let patches = vec![ToolDiff::add("/instruction", json!("hi"))];
        registry.start_edit("edit-1", tool(), patches.clone()).expect("start");
        let record = registry.run_edit("edit-1").expect("parked");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
        assert!(record.proposed_document().is_none());
        assert!(record.committed_document().is_none());

        let record = registry.resolve("edit-1", Resolution::Confirmed).expect("confirm");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert_eq!(record.applied_diffs, patches);
        assert_eq!(record.committed_document().and_then(|tool| tool.instruction.as_deref()), Some("hi"));

        registry
            .start_edit("edit-2", tool(), vec![ToolDiff::replace("/outputTransform", json!("x"))])
            .expect("start");
        registry.run_edit("edit-2").expect("parked");
        let error = registry.resolve("edit-2", Resolution::Confirmed).expect_err("unresolvable");
        assert_eq!(error.error_code(), "PATH_UNRESOLVABLE");
        assert_eq!(registry.get("edit-2").map(|record| record.status), Some(ConfirmationStatus::Error));
    }

    #[test]
    fn failing_partial_replay_stays_awaiting() {
        let mut registry = ConfirmationRegistry::default();
        let patches = vec![
            ToolDiff::add("/instruction", json!("hi")),
            ToolDiff::replace("/instruction", json!("bye")),
        ];
        registry.start_edit("edit-1", tool(), patches).expect("start");
        registry.run_edit("edit-1").expect("run");

        let error = registry
            .resolve("edit-1", Resolution::Partial { approved: vec![1] })
            .expect_err("replace depends on the rejected add");
        assert_eq!(error.error_code(), "PATH_UNRESOLVABLE");
        assert_eq!(registry.get("edit-1").map(|record| record.status), Some(ConfirmationStatus::AwaitingConfirmation));

        let error = registry.resolve("edit-1", Resolution::Partial { approved: vec![7] }).expect_err("range");
        assert_eq!(error.error_code(), "APPROVAL_OUT_OF_RANGE");
    }

    #[test]
    fn patch_failures_end_edit_calls_in_error() {
        let mut registry = ConfirmationRegistry::default();
        registry
            .start_edit("edit-1", tool(), vec![ToolDiff::replace("/outputTransform", json!("x"))])
            .expect("start");
        let error = registry.run_edit("edit-1").expect_err("unresolvable");
        assert_eq!(error.diagnostic()["context"]["patch"]["error_code"], json!("PATH_UNRESOLVABLE"));
        assert_eq!(registry.get("edit-1").map(|record| record.status), Some(ConfirmationStatus::Error));
    }

    #[test]
    fn oauth_calls_resolve_with_token_or_error() {
        let mut registry = ConfirmationRegistry::default();
        registry.start_call("oauth-1", AUTHENTICATE_OAUTH, json!({"systemId": "crm"})).expect("start");
        let record = registry.mark_running("oauth-1").expect("parked");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);

        let error = registry.resolve("oauth-1", Resolution::Confirmed).expect_err("oauth needs oauth actions");
        assert_eq!(error.error_code(), "ACTION_NOT_APPLICABLE");

        let record = registry
            .resolve("oauth-1", Resolution::OauthSuccess(json!({"access_token": "t"})))
            .expect("success");
        assert_eq!(record.status, ConfirmationStatus::Completed);
        assert_eq!(record.output, Some(json!({"access_token": "t"})));

        registry.start_call("oauth-2", AUTHENTICATE_OAUTH, Value::Null).expect("start");
        registry.mark_running("oauth-2").expect("parked");
        let resolution = Resolution::from_action(ConfirmationAction::OauthFailure, None, Some(json!("denied"))).expect("resolution");
        let record = registry.resolve("oauth-2", resolution).expect("failure");
        assert_eq!(record.status, ConfirmationStatus::Error);
        assert_eq!(record.error.as_deref(), Some("denied"));
    }

    #[test]
    fn duplicate_and_unknown_calls_are_rejected() {
        let mut registry = ConfirmationRegistry::default();
        registry.start_call("call-1", "run_tool", Value::Null).expect("start");
        assert_eq!(
            registry.start_call("call-1", "run_tool", Value::Null).expect_err("duplicate").error_code(),
            "DUPLICATE_CALL"
        );
        assert_eq!(registry.resolve("nope", Resolution::Declined).expect_err("unknown").error_code(), "UNKNOWN_CALL");
        assert_eq!(
            Resolution::from_action(ConfirmationAction::Partial, None, None).expect_err("missing"),
            ConfirmationError::MissingApproval
        );
        assert!(registry.remove("call-1").is_some());
        assert!(registry.is_empty());
    }
}
