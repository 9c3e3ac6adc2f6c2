//! Per tool-type execution modes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use toolflow_types::ExecutionMode;

/// Tool type of calls that propose patches to a tool document.
pub const EDIT_TOOL: &str = "edit_tool";
/// Tool type of calls that execute a tool.
pub const RUN_TOOL: &str = "run_tool";
/// Tool type of calls that complete an OAuth authorization.
pub const AUTHENTICATE_OAUTH: &str = "authenticate_oauth";

/// What kind of confirmation each tool type asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationPolicy {
    /// Mode of tool types without an explicit entry.
    #[serde(default)]
    pub default_mode: ExecutionMode,
    #[serde(default)]
    pub modes: HashMap<String, ExecutionMode>,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::Auto,
            modes: HashMap::from([
                (EDIT_TOOL.to_string(), ExecutionMode::ConfirmAfterExecution),
                (AUTHENTICATE_OAUTH.to_string(), ExecutionMode::ConfirmBeforeExecution),
            ]),
        }
    }
}

impl ConfirmationPolicy {
    /// Policy where no tool type asks for confirmation.
    pub fn auto() -> Self {
        Self {
            default_mode: ExecutionMode::Auto,
            modes: HashMap::new(),
        }
    }

    pub fn with_mode(mut self, tool_type: impl Into<String>, mode: ExecutionMode) -> Self {
        self.modes.insert(tool_type.into(), mode);
        self
    }

    pub fn mode_for(&self, tool_type: &str) -> ExecutionMode {
        self.modes.get(tool_type).copied().unwrap_or(self.default_mode)
    }
}
