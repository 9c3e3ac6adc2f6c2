//! Credential lookup keyed by system id.

use indexmap::IndexMap;
use serde_json::Value;
use toolflow_util::canonical_string;

use crate::context::SystemCredentials;

/// Source of per-system credentials.
pub trait CredentialStore: Send + Sync {
    /// Credentials of `system_id`, or `None` when the system has none.
    fn credentials(&self, system_id: &str) -> Option<SystemCredentials>;
}

/// In-memory credential store.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    systems: IndexMap<String, SystemCredentials>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, system_id: impl Into<String>, key: impl Into<String>, value: impl Into<String>) {
        self.systems.entry(system_id.into()).or_default().insert(key.into(), value.into());
    }

    pub fn with_system(mut self, system_id: impl Into<String>, credentials: SystemCredentials) -> Self {
        self.systems.insert(system_id.into(), credentials);
        self
    }

    /// Builds a store from `{"<systemId>": {"<key>": value}}`. Non-string values are stored
    /// as their JSON text.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        let systems: IndexMap<String, IndexMap<String, Value>> = serde_json::from_value(value)?;
        let systems = systems
            .into_iter()
            .map(|(system_id, values)| {
                let credentials = values.into_iter().map(|(key, value)| (key, canonical_string(&value))).collect();
                (system_id, credentials)
            })
            .collect();
        Ok(Self { systems })
    }
}

impl CredentialStore for StaticCredentialStore {
    fn credentials(&self, system_id: &str) -> Option<SystemCredentials> {
        self.systems.get(system_id).cloned()
    }
}

/// Credentials of every listed system that has any.
pub(crate) fn collect_credentials(store: &dyn CredentialStore, system_ids: &[&str]) -> IndexMap<String, SystemCredentials> {
    system_ids
        .iter()
        .filter_map(|system_id| store.credentials(system_id).map(|credentials| (system_id.to_string(), credentials)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loads_nested_json_and_stringifies_scalars() {
        let store = StaticCredentialStore::from_json(json!({"crm": {"token": "abc", "port": 5432}})).expect("store");
        let credentials = store.credentials("crm").expect("crm");
        assert_eq!(credentials.get("token").map(String::as_str), Some("abc"));
        assert_eq!(credentials.get("port").map(String::as_str), Some("5432"));
        assert!(store.credentials("erp").is_none());
        assert!(StaticCredentialStore::from_json(json!(["nope"])).is_err());
    }

    #[test]
    fn collects_only_known_systems() {
        let mut store = StaticCredentialStore::new();
        store.insert("crm", "token", "abc");
        let collected = collect_credentials(&store, &["crm", "erp"]);
        assert_eq!(collected.len(), 1);
        assert!(collected.contains_key("crm"));
    }
}
