//! # Expression Resolution
//!
//! Resolves the `<<expr>>` placeholders embedded in step configuration against a
//! [`VariableContext`]. An expression is either
//!
//! - a bare top-level key of the context, returned as-is, or
//! - a one-parameter function expression, called in the [`Sandbox`] with the whole context.
//!
//! The key lookup always wins; the sandbox is only consulted when no key matches.
//!
//! ```rust
//! use serde_json::json;
//! use toolflow_engine::context::VariableContext;
//! use toolflow_engine::resolve::ExpressionResolver;
//!
//! let context = VariableContext::from_json(json!({"userId": 42, "user": {"name": "Ada"}})).unwrap();
//! let resolver = ExpressionResolver::default();
//!
//! assert_eq!(resolver.interpolate("/users/<<userId>>", &context).unwrap(), "/users/42");
//! assert_eq!(resolver.interpolate("<<(ctx) => ctx.user.name>>", &context).unwrap(), "Ada");
//! ```

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use toolflow_types::{HttpMethod, RequestStepConfig};
use toolflow_util::canonical_string;

use crate::context::VariableContext;
use crate::error::EngineError;
use crate::sandbox::{Sandbox, SandboxError, SandboxLimits, run_on_worker};
use crate::templates::{TemplateSegment, parse_template, sole_placeholder};

/// `Basic <<user>>:<<pass>>` header values, encoded as a whole.
static BASIC_AUTH_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Basic\s+<<(?P<user>.+?)>>:<<(?P<pass>.+?)>>\s*$").expect("basic auth regex should compile"));

/// Connector request with every placeholder substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub system_id: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: IndexMap<String, String>,
    pub query_params: IndexMap<String, String>,
    pub body: Option<String>,
}

/// Evaluates expressions against a variable context.
#[derive(Debug, Clone, Default)]
pub struct ExpressionResolver {
    sandbox: Sandbox,
}

impl ExpressionResolver {
    pub fn new(limits: SandboxLimits) -> Self {
        Self {
            sandbox: Sandbox::new(limits),
        }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Copy whose evaluations stop once `token` is cancelled.
    pub fn with_abort(&self, token: CancellationToken) -> Self {
        Self {
            sandbox: self.sandbox.with_abort(token),
        }
    }

    /// Runs resolution work on a sandbox worker and awaits it.
    ///
    /// The calling task stays free while expressions evaluate, so a surrounding timeout or
    /// cancellation can fire. Dropping the future leaves the work to finish on its own; use a
    /// resolver from [`ExpressionResolver::with_abort`] to stop it early.
    pub async fn spawn<T, F>(&self, job: F) -> Result<T, EngineError>
    where
        F: FnOnce(&ExpressionResolver) -> Result<T, EngineError> + Send + 'static,
        T: Send + 'static,
    {
        let resolver = self.clone();
        run_on_worker(move || job(&resolver))
            .await
            .map_err(|error| EngineError::from_sandbox("", error, Vec::new()))?
    }

    /// Resolves one expression. `None` stands for `undefined`.
    pub fn evaluate(&self, expression: &str, context: &VariableContext) -> Result<Option<Value>, EngineError> {
        let expression = expression.trim();
        if let Some(value) = context.get(expression) {
            return Ok(Some(value.clone()));
        }

        if let Err(error) = self.sandbox.check(expression) {
            return Err(self.unusable_expression(expression, error, context));
        }

        self.sandbox
            .call(expression, &[context.to_json()])
            .map_err(|error| EngineError::from_sandbox(expression, error, context.keys()))
    }

    /// Calls a function expression with explicit arguments, e.g. `(response, pageInfo) => ...`.
    ///
    /// `names` labels `args` positionally; failures list each name together with the top-level
    /// fields of object arguments (`response.items`, `pageInfo.page`, ...).
    pub fn call_function(&self, source: &str, names: &[&str], args: &[Value]) -> Result<Option<Value>, EngineError> {
        let source = source.trim();
        self.sandbox
            .call(source, args)
            .map_err(|error| EngineError::from_sandbox(source, error, argument_keys(names, args)))
    }

    /// Resolves a template. A template made of exactly one placeholder yields the raw value;
    /// any other template yields the interpolated string.
    pub fn resolve_template(&self, template: &str, context: &VariableContext) -> Result<Option<Value>, EngineError> {
        match sole_placeholder(template) {
            Some(expression) => self.evaluate(expression, context),
            None => self.interpolate(template, context).map(|text| Some(Value::String(text))),
        }
    }

    /// Substitutes every placeholder of `template`.
    ///
    /// Strings are inserted verbatim, structured values as compact JSON, `undefined` as the word
    /// `undefined`.
    pub fn interpolate(&self, template: &str, context: &VariableContext) -> Result<String, EngineError> {
        let mut output = String::with_capacity(template.len());
        for segment in parse_template(template) {
            match segment {
                TemplateSegment::Literal(text) => output.push_str(text),
                TemplateSegment::Placeholder(expression) => {
                    let value = self.evaluate(expression, context)?;
                    output.push_str(&stringify(value.as_ref()));
                }
            }
        }
        Ok(output)
    }

    /// Resolves every string field of a request step configuration.
    ///
    /// Header and query entries whose value resolves to `undefined` or `null` are dropped.
    pub fn resolve_request(&self, config: &RequestStepConfig, context: &VariableContext) -> Result<ResolvedRequest, EngineError> {
        let url = self.interpolate(&config.url, context)?;

        let mut headers = IndexMap::new();
        for (name, template) in &config.headers {
            let value = match self.resolve_basic_auth(template, context)? {
                Some(encoded) => encoded,
                None => self.interpolate(template, context)?,
            };
            if !is_absent(&value) {
                headers.insert(name.clone(), value);
            }
        }

        let mut query_params = IndexMap::new();
        for (name, template) in &config.query_params {
            let value = self.interpolate(template, context)?;
            if !is_absent(&value) {
                query_params.insert(name.clone(), value);
            }
        }

        let body = match &config.body {
            Some(template) if !template.trim().is_empty() => Some(self.interpolate(template, context)?),
            _ => None,
        };

        Ok(ResolvedRequest {
            system_id: config.system_id.clone(),
            url,
            method: config.method,
            headers,
            query_params,
            body,
        })
    }

    fn resolve_basic_auth(&self, template: &str, context: &VariableContext) -> Result<Option<String>, EngineError> {
        let Some(captures) = BASIC_AUTH_TEMPLATE.captures(template) else {
            return Ok(None);
        };
        let (Some(user), Some(pass)) = (captures.name("user"), captures.name("pass")) else {
            return Ok(None);
        };
        let user = self.evaluate(user.as_str(), context)?;
        let pass = self.evaluate(pass.as_str(), context)?;
        let credentials = format!("{}:{}", stringify(user.as_ref()), stringify(pass.as_ref()));
        Ok(Some(format!("Basic {}", STANDARD.encode(credentials))))
    }

    fn unusable_expression(&self, expression: &str, error: SandboxError, context: &VariableContext) -> EngineError {
        if error.is_syntax() && looks_like_function(expression) {
            return EngineError::ExpressionSyntax {
                expression: expression.to_string(),
                message: error.to_string(),
            };
        }
        EngineError::Resolution {
            expression: expression.to_string(),
            message: "not a top-level context key or a function expression".to_string(),
            available_keys: context.keys(),
        }
    }
}

fn argument_keys(names: &[&str], args: &[Value]) -> Vec<String> {
    let mut keys = Vec::new();
    for (name, arg) in names.iter().zip(args) {
        keys.push(name.to_string());
        if let Value::Object(fields) = arg {
            keys.extend(fields.keys().map(|field| format!("{name}.{field}")));
        }
    }
    keys
}

fn looks_like_function(expression: &str) -> bool {
    expression.contains("=>") || expression.starts_with("function")
}

/// String form used for substitution.
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(value) => canonical_string(value),
    }
}

fn is_absent(value: &str) -> bool {
    matches!(value.trim(), "undefined" | "null")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: Value) -> VariableContext {
        VariableContext::from_json(value).expect("object")
    }

    #[test]
    fn bare_keys_win_over_function_evaluation() {
        let resolver = ExpressionResolver::default();
        let ctx = context(json!({"users": [{"id": 1}], "(ctx) => 1": "literal"}));
        assert_eq!(resolver.evaluate("users", &ctx).expect("users"), Some(json!([{"id": 1}])));
        assert_eq!(resolver.evaluate("(ctx) => 1", &ctx).expect("key"), Some(json!("literal")));
        assert_eq!(resolver.evaluate("(c) => c.users.length", &ctx).expect("fn"), Some(json!(1)));
    }

    #[test]
    fn nested_dotted_keys_are_not_simple_lookups() {
        let resolver = ExpressionResolver::default();
        let ctx = context(json!({"user": {"id": 1}}));
        let error = resolver.evaluate("user.id", &ctx).expect_err("dotted");
        match error {
            EngineError::Resolution { available_keys, .. } => assert_eq!(available_keys, vec!["user".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_property_reports_available_keys() {
        let resolver = ExpressionResolver::default();
        let ctx = context(json!({"alpha": 1, "beta": 2}));
        let error = resolver.interpolate("<<(ctx) => ctx.missingKey.x>>", &ctx).expect_err("missing");
        assert_eq!(error.error_code(), "RESOLUTION_FAILED");
        let message = error.to_string();
        assert!(message.contains("alpha, beta"), "message: {message}");
    }

    #[test]
    fn syntax_and_budget_errors_are_distinguished() {
        let resolver = ExpressionResolver::new(SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        });
        let ctx = context(json!({}));
        let syntax = resolver.evaluate("(ctx) => ctx.(", &ctx).expect_err("syntax");
        assert_eq!(syntax.error_code(), "EXPRESSION_SYNTAX");
        let budget = resolver.evaluate("(ctx) => { while (true) {} }", &ctx).expect_err("budget");
        assert_eq!(budget.error_code(), "SANDBOX_TIMEOUT");
    }

    #[tokio::test]
    async fn spawned_resolution_stops_when_aborted() {
        let token = CancellationToken::new();
        let resolver = ExpressionResolver::new(SandboxLimits {
            max_steps: u64::MAX,
            timeout: std::time::Duration::from_secs(60),
            ..SandboxLimits::default()
        })
        .with_abort(token.clone());
        let ctx = context(json!({"n": 2}));

        let doubled = resolver.spawn(move |resolver| resolver.evaluate("(c) => c.n * 2", &ctx)).await;
        assert_eq!(doubled.expect("evaluates"), Some(json!(4)));

        let spinning = resolver.spawn(|resolver| resolver.evaluate("(c) => { for (;;) {} }", &context(json!({}))));
        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            token.cancel();
        };
        let (error, ()) = tokio::join!(spinning, cancel);
        assert_eq!(error.expect_err("cancelled").error_code(), "SANDBOX_TIMEOUT");
    }

    #[test]
    fn function_arguments_are_listed_on_failure() {
        let resolver = ExpressionResolver::default();
        let error = resolver
            .call_function("(response, pageInfo) => response.meta.next", &["response", "pageInfo"], &[json!({"items": []}), json!({"page": 1})])
            .expect_err("meta is missing");
        match error {
            EngineError::Resolution { available_keys, .. } => assert_eq!(
                available_keys,
                vec!["response", "response.items", "pageInfo", "pageInfo.page"]
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn template_with_single_placeholder_keeps_structure() {
        let resolver = ExpressionResolver::default();
        let ctx = context(json!({"ids": [1, 2]}));
        assert_eq!(resolver.resolve_template("<<ids>>", &ctx).expect("raw"), Some(json!([1, 2])));
        assert_eq!(resolver.resolve_template("ids=<<ids>>", &ctx).expect("text"), Some(json!("ids=[1,2]")));
        assert_eq!(resolver.interpolate("<<(ctx) => undefined>>", &ctx).expect("undefined"), "undefined");
    }

    #[test]
    fn request_resolution_encodes_basic_auth_and_drops_absent_values() {
        let resolver = ExpressionResolver::default();
        let ctx = context(json!({
            "crm_user": "ada",
            "crm_password": "s3cret",
            "limit": 10,
            "cursor": null,
            "filter": {"status": "open"}
        }));
        let mut config = RequestStepConfig {
            system_id: "crm".into(),
            url: "https://crm.example.com/items".into(),
            body: Some(r#"{"filter": <<filter>>}"#.into()),
            ..Default::default()
        };
        config.headers.insert("Authorization".into(), "Basic <<crm_user>>:<<crm_password>>".into());
        config.headers.insert("X-Trace".into(), "<<(ctx) => ctx.trace>>".into());
        config.query_params.insert("limit".into(), "<<limit>>".into());
        config.query_params.insert("cursor".into(), "<<cursor>>".into());

        let request = resolver.resolve_request(&config, &ctx).expect("resolve");
        assert_eq!(request.headers.get("Authorization").map(String::as_str), Some("Basic YWRhOnMzY3JldA=="));
        assert!(!request.headers.contains_key("X-Trace"));
        assert_eq!(request.query_params.get("limit").map(String::as_str), Some("10"));
        assert!(!request.query_params.contains_key("cursor"));
        assert_eq!(request.body.as_deref(), Some(r#"{"filter": {"status":"open"}}"#));
    }
}
