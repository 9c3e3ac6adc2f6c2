//! JSON Patch operations used to edit tool documents.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// RFC 6902 operation kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
    Replace,
    Move,
    Copy,
    Test,
}

impl PatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatchOp::Add => "add",
            PatchOp::Remove => "remove",
            PatchOp::Replace => "replace",
            PatchOp::Move => "move",
            PatchOp::Copy => "copy",
            PatchOp::Test => "test",
        }
    }

    /// Whether the operation requires a `value` member.
    pub fn requires_value(&self) -> bool {
        matches!(self, PatchOp::Add | PatchOp::Replace | PatchOp::Test)
    }

    /// Whether the operation requires a `from` member.
    pub fn requires_from(&self) -> bool {
        matches!(self, PatchOp::Move | PatchOp::Copy)
    }
}

/// One patch operation. Also serves as the normalized diff entry returned after application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDiff {
    pub op: PatchOp,
    pub path: String,
    /// `Some(Null)` for an explicit `"value": null`, `None` when the member is absent.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

impl ToolDiff {
    pub fn add(path: impl Into<String>, value: JsonValue) -> Self {
        Self::with_value(PatchOp::Add, path, value)
    }

    pub fn replace(path: impl Into<String>, value: JsonValue) -> Self {
        Self::with_value(PatchOp::Replace, path, value)
    }

    pub fn test(path: impl Into<String>, value: JsonValue) -> Self {
        Self::with_value(PatchOp::Test, path, value)
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
            from: None,
        }
    }

    pub fn move_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Move,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    pub fn copy_from(from: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Copy,
            path: path.into(),
            value: None,
            from: Some(from.into()),
        }
    }

    fn with_value(op: PatchOp, path: impl Into<String>, value: JsonValue) -> Self {
        Self {
            op,
            path: path.into(),
            value: Some(value),
            from: None,
        }
    }
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn explicit_null_value_is_kept() {
        let with_null: ToolDiff = serde_json::from_value(json!({"op": "add", "path": "/a", "value": null})).expect("diff");
        assert_eq!(with_null.value, Some(JsonValue::Null));

        let without: ToolDiff = serde_json::from_value(json!({"op": "remove", "path": "/a"})).expect("diff");
        assert_eq!(without.value, None);
    }

    #[test]
    fn serializes_only_present_members() {
        let diff = ToolDiff::move_from("/steps/0", "/steps/1");
        assert_eq!(
            serde_json::to_value(&diff).expect("serialize"),
            json!({"op": "move", "path": "/steps/1", "from": "/steps/0"})
        );
    }
}
