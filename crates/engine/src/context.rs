//! Variable context ("sourceData") assembly.
//!
//! The context is one flat JSON object. Sources are layered in a fixed order and later layers
//! win on key collisions:
//!
//! 1. credentials, namespaced as `<systemId>_<key>`
//! 2. prior step results keyed by step id
//! 3. pagination variables (`page`, `offset`, `cursor`, `limit`, `pageSize`)
//! 4. `currentItem`, only while a step evaluates its own configuration
//! 5. payload fields at the root

use indexmap::IndexMap;
use serde_json::{Map, Value};
use toolflow_types::StepOutcome;

/// Credentials of one system, keyed by credential name.
pub type SystemCredentials = IndexMap<String, String>;

/// Flat, read-only mapping handed to the expression resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableContext {
    entries: Map<String, Value>,
}

impl VariableContext {
    /// Wraps a JSON object. Returns `None` for any other JSON type.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(entries) => Some(Self { entries }),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Top-level keys, as listed in resolution diagnostics.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.entries.clone())
    }
}

/// Pagination counters injected before each page request.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationVars {
    /// One-based page number.
    pub page: u64,
    pub offset: u64,
    /// Cursor returned by the previous page; `null` before the first page.
    pub cursor: Value,
    pub limit: u64,
}

impl PaginationVars {
    pub fn first(page_size: u64) -> Self {
        Self {
            page: 1,
            offset: 0,
            cursor: Value::Null,
            limit: page_size,
        }
    }

    pub fn page_size(&self) -> u64 {
        self.limit
    }

    fn write_into(&self, entries: &mut Map<String, Value>) {
        entries.insert("page".into(), Value::from(self.page));
        entries.insert("offset".into(), Value::from(self.offset));
        entries.insert("cursor".into(), self.cursor.clone());
        entries.insert("limit".into(), Value::from(self.limit));
        entries.insert("pageSize".into(), Value::from(self.limit));
    }
}

/// Layers the context sources in override order.
///
/// ```rust
/// use indexmap::IndexMap;
/// use serde_json::json;
/// use toolflow_engine::context::VariableContextBuilder;
///
/// let payload = json!({"userId": 7}).as_object().cloned().unwrap();
/// let mut credentials = IndexMap::new();
/// credentials.insert("crm".to_string(), IndexMap::from([("token".to_string(), "secret".to_string())]));
///
/// let context = VariableContextBuilder::new(&payload).credentials(&credentials).build();
/// assert_eq!(context.get("crm_token"), Some(&json!("secret")));
/// assert_eq!(context.get("userId"), Some(&json!(7)));
/// ```
#[derive(Debug, Clone)]
pub struct VariableContextBuilder<'a> {
    payload: &'a Map<String, Value>,
    credentials: Option<&'a IndexMap<String, SystemCredentials>>,
    step_results: Option<&'a IndexMap<String, StepOutcome>>,
    pagination: Option<&'a PaginationVars>,
    current_item: Option<&'a Value>,
}

impl<'a> VariableContextBuilder<'a> {
    pub fn new(payload: &'a Map<String, Value>) -> Self {
        Self {
            payload,
            credentials: None,
            step_results: None,
            pagination: None,
            current_item: None,
        }
    }

    /// Credentials keyed by system id.
    pub fn credentials(mut self, credentials: &'a IndexMap<String, SystemCredentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn step_results(mut self, step_results: &'a IndexMap<String, StepOutcome>) -> Self {
        self.step_results = Some(step_results);
        self
    }

    pub fn pagination(mut self, pagination: Option<&'a PaginationVars>) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn current_item(mut self, current_item: Option<&'a Value>) -> Self {
        self.current_item = current_item;
        self
    }

    pub fn build(&self) -> VariableContext {
        let mut entries = Map::new();

        if let Some(credentials) = self.credentials {
            for (system_id, values) in credentials {
                for (key, value) in values {
                    entries.insert(format!("{system_id}_{key}"), Value::String(value.clone()));
                }
            }
        }

        if let Some(step_results) = self.step_results {
            for (step_id, outcome) in step_results {
                entries.insert(step_id.clone(), outcome.to_json());
            }
        }

        if let Some(pagination) = self.pagination {
            pagination.write_into(&mut entries);
        }

        if let Some(current_item) = self.current_item {
            entries.insert("currentItem".into(), current_item.clone());
        }

        for (key, value) in self.payload {
            entries.insert(key.clone(), value.clone());
        }

        VariableContext { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolflow_types::ResultEnvelope;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let payload = object(json!({"page": "from-payload", "name": "n"}));
        let mut credentials = IndexMap::new();
        credentials.insert(
            "crm".to_string(),
            IndexMap::from([("token".to_string(), "t".to_string()), ("users".to_string(), "cred".to_string())]),
        );
        let mut results = IndexMap::new();
        results.insert(
            "crm_users".to_string(),
            StepOutcome::Single(ResultEnvelope::ok(json!({}), json!([1, 2]))),
        );
        let pagination = PaginationVars::first(25);
        let item = json!({"id": 3});

        let context = VariableContextBuilder::new(&payload)
            .credentials(&credentials)
            .step_results(&results)
            .pagination(Some(&pagination))
            .current_item(Some(&item))
            .build();

        assert_eq!(context.get("crm_token"), Some(&json!("t")));
        assert_eq!(context.get("crm_users").and_then(|value| value.get("data")), Some(&json!([1, 2])));
        assert_eq!(context.get("page"), Some(&json!("from-payload")));
        assert_eq!(context.get("pageSize"), Some(&json!(25)));
        assert_eq!(context.get("cursor"), Some(&Value::Null));
        assert_eq!(context.get("currentItem"), Some(&item));
        assert_eq!(context.get("name"), Some(&json!("n")));
    }

    #[test]
    fn current_item_is_absent_unless_supplied() {
        let payload = Map::new();
        let context = VariableContextBuilder::new(&payload).build();
        assert!(context.is_empty());
        assert!(!context.contains_key("currentItem"));
        assert!(VariableContext::from_json(json!([1])).is_none());
    }
}
