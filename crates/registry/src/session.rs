//! Edit sessions: drafts under active edit plus the confirmation records of their calls.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use toolflow_types::{ConfirmationStatus, Tool, ToolDiff};
use tracing::info;

use crate::confirmation::{ConfirmationError, ConfirmationRecord, ConfirmationRegistry, Resolution};
use crate::policy::ConfirmationPolicy;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("unknown draft '{draft_id}'")]
    UnknownDraft { draft_id: String },
    #[error(transparent)]
    Confirmation(#[from] ConfirmationError),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::UnknownDraft { .. } => "UNKNOWN_DRAFT",
            SessionError::Confirmation(error) => error.error_code(),
        }
    }

    pub fn diagnostic(&self) -> Value {
        match self {
            SessionError::UnknownDraft { draft_id } => serde_json::json!({
                "error_code": self.error_code(),
                "category": "session",
                "message": self.to_string(),
                "context": { "draft_id": draft_id },
                "suggested_action": "Create the draft before editing it.",
            }),
            SessionError::Confirmation(error) => error.diagnostic(),
        }
    }
}

/// Tool documents under edit, keyed by transient draft id.
#[derive(Debug, Clone, Default)]
pub struct DraftStore {
    drafts: IndexMap<String, Tool>,
    next_id: u64,
}

impl DraftStore {
    /// Stores `tool` under a new draft id.
    pub fn create(&mut self, tool: Tool) -> String {
        self.next_id += 1;
        let draft_id = format!("draft-{}-{}", self.next_id, tool.id);
        self.drafts.insert(draft_id.clone(), tool);
        draft_id
    }

    pub fn get(&self, draft_id: &str) -> Option<&Tool> {
        self.drafts.get(draft_id)
    }

    pub fn update(&mut self, draft_id: &str, tool: Tool) -> Result<(), SessionError> {
        match self.drafts.get_mut(draft_id) {
            Some(draft) => {
                *draft = tool;
                Ok(())
            }
            None => Err(SessionError::UnknownDraft {
                draft_id: draft_id.to_string(),
            }),
        }
    }

    pub fn remove(&mut self, draft_id: &str) -> Option<Tool> {
        self.drafts.shift_remove(draft_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.drafts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }
}

/// Owns the drafts and confirmation records of one editing conversation.
///
/// Completed edits are written back into their draft; declined or failed edits leave the
/// draft as it was.
#[derive(Debug, Clone, Default)]
pub struct EditSession {
    drafts: DraftStore,
    confirmations: ConfirmationRegistry,
    edit_targets: HashMap<String, String>,
}

impl EditSession {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            drafts: DraftStore::default(),
            confirmations: ConfirmationRegistry::new(policy),
            edit_targets: HashMap::new(),
        }
    }

    pub fn drafts(&self) -> &DraftStore {
        &self.drafts
    }

    pub fn drafts_mut(&mut self) -> &mut DraftStore {
        &mut self.drafts
    }

    pub fn confirmations(&self) -> &ConfirmationRegistry {
        &self.confirmations
    }

    pub fn confirmations_mut(&mut self) -> &mut ConfirmationRegistry {
        &mut self.confirmations
    }

    pub fn create_draft(&mut self, tool: Tool) -> String {
        self.drafts.create(tool)
    }

    /// Proposes `patches` against a draft as edit call `call_id`.
    ///
    /// The patch engine runs immediately. Depending on the edit policy the record either
    /// waits for confirmation or completes, in which case the draft is updated.
    pub fn propose_edit(&mut self, call_id: &str, draft_id: &str, patches: Vec<ToolDiff>) -> Result<&ConfirmationRecord, SessionError> {
        let original = self
            .drafts
            .get(draft_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownDraft {
                draft_id: draft_id.to_string(),
            })?;
        info!(call_id = %call_id, draft_id = %draft_id, patch_count = patches.len(), "edit proposed");

        self.confirmations.start_edit(call_id, original, patches)?;
        self.edit_targets.insert(call_id.to_string(), draft_id.to_string());
        let status = self.confirmations.run_edit(call_id)?.status;
        if status == ConfirmationStatus::Completed {
            self.write_back(call_id)?;
        }
        self.record(call_id)
    }

    /// Resolves a call and writes a completed edit back into its draft.
    pub fn resolve(&mut self, call_id: &str, resolution: Resolution) -> Result<&ConfirmationRecord, SessionError> {
        let status = self.confirmations.resolve(call_id, resolution)?.status;
        if status == ConfirmationStatus::Completed {
            self.write_back(call_id)?;
        }
        self.record(call_id)
    }

    fn write_back(&mut self, call_id: &str) -> Result<(), SessionError> {
        let Some(draft_id) = self.edit_targets.get(call_id) else {
            return Ok(());
        };
        let Some(document) = self.confirmations.get(call_id).and_then(ConfirmationRecord::committed_document) else {
            return Ok(());
        };
        self.drafts.update(draft_id, document.clone())?;
        info!(call_id = %call_id, draft_id = %draft_id, "draft updated");
        Ok(())
    }

    fn record(&self, call_id: &str) -> Result<&ConfirmationRecord, SessionError> {
        self.confirmations.get(call_id).ok_or_else(|| {
            SessionError::Confirmation(ConfirmationError::UnknownCall {
                call_id: call_id.to_string(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
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
    fn confirmed_edits_update_the_draft() {
        let mut session = EditSession::default();
        let draft_id = session.create_draft(tool());

        let record = session
            .propose_edit("edit-1", &draft_id, vec![ToolDiff::add("/instruction", json!("hi"))])
            .expect("propose");
        assert_eq!(record.status, ConfirmationStatus::AwaitingConfirmation);
        assert!(session.drafts().get(&draft_id).is_some_and(|draft| draft.instruction.is_none()));

        session.resolve("edit-1", Resolution::Confirmed).expect("confirm");
        assert_eq!(
            session.drafts().get(&draft_id).and_then(|draft| draft.instruction.as_deref()),
            Some("hi")
        );
    }

    #[test]
    fn auto_policy_writes_back_immediately_and_declines_keep_drafts() {
        let mut session = EditSession::new(ConfirmationPolicy::auto());
        let draft_id = session.create_draft(tool());
        session
            .propose_edit("edit-1", &draft_id, vec![ToolDiff::add("/instruction", json!("hi"))])
            .expect("propose");
        assert_eq!(
            session.drafts().get(&draft_id).and_then(|draft| draft.instruction.as_deref()),
            Some("hi")
        );

        let mut session = EditSession::default();
        let draft_id = session.create_draft(tool());
        session
            .propose_edit("edit-2", &draft_id, vec![ToolDiff::add("/instruction", json!("hi"))])
            .expect("propose");
        session.resolve("edit-2", Resolution::Declined).expect("decline");
        assert_eq!(session.drafts().get(&draft_id), Some(&tool()));
    }

    #[test]
    fn unknown_drafts_are_reported() {
        let mut session = EditSession::default();
        let error = session.propose_edit("edit-1", "draft-404", Vec::new()).expect_err("unknown");
        assert_eq!(error.error_code(), "UNKNOWN_DRAFT");
        assert!(session.confirmations().is_empty());
    }
}
