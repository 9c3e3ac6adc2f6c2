//! Vocabulary of the tool-call confirmation lifecycle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Running,
    AwaitingConfirmation,
    Completed,
    Declined,
    Error,
}

impl ConfirmationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConfirmationStatus::Completed | ConfirmationStatus::Declined | ConfirmationStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationStatus::Pending => "pending",
            ConfirmationStatus::Running => "running",
            ConfirmationStatus::AwaitingConfirmation => "awaiting_confirmation",
            ConfirmationStatus::Completed => "completed",
            ConfirmationStatus::Declined => "declined",
            ConfirmationStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConfirmationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External action resolving an `awaiting_confirmation` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationAction {
    Confirmed,
    Declined,
    Partial,
    OauthSuccess,
    OauthFailure,
}

impl ConfirmationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationAction::Confirmed => "confirmed",
            ConfirmationAction::Declined => "declined",
            ConfirmationAction::Partial => "partial",
            ConfirmationAction::OauthSuccess => "oauth_success",
            ConfirmationAction::OauthFailure => "oauth_failure",
        }
    }
}

impl fmt::Display for ConfirmationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When (if ever) a tool type asks for confirmation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Auto,
    ConfirmBeforeExecution,
    ConfirmAfterExecution,
}

impl ExecutionMode {
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, ExecutionMode::Auto)
    }

    /// The call is parked before its action runs; confirming it releases the action.
    pub fn confirms_before(&self) -> bool {
        matches!(self, ExecutionMode::ConfirmBeforeExecution)
    }

    /// The action runs first and its result is parked until confirmed.
    pub fn confirms_after(&self) -> bool {
        matches!(self, ExecutionMode::ConfirmAfterExecution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConfirmationStatus::AwaitingConfirmation).expect("status"),
            "\"awaiting_confirmation\""
        );
        let action: ConfirmationAction = serde_json::from_str("\"oauth_failure\"").expect("action");
        assert_eq!(action, ConfirmationAction::OauthFailure);
        let mode: ExecutionMode = serde_json::from_str("\"confirm_before_execution\"").expect("mode");
        assert!(mode.requires_confirmation());
        assert!(mode.confirms_before() && !mode.confirms_after());
        assert!(!ExecutionMode::Auto.confirms_before() && !ExecutionMode::Auto.confirms_after());
        assert!(ConfirmationStatus::Declined.is_terminal());
        assert!(!ConfirmationStatus::AwaitingConfirmation.is_terminal());
    }
}
