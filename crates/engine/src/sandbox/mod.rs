//! Isolated evaluator for the function expressions embedded in tool documents.
//!
//! The sandbox understands a JavaScript subset: arrow and `function` expressions, `const`/`let`,
//! control flow, destructuring, spread, optional chaining, template literals, regular
//! expressions and the common array, string, number and date methods. Each evaluation runs on a
//! sandbox worker thread with a fresh global scope, under a step budget, a wall-clock timeout, a
//! call-depth limit and an optional cancellation token. There is no I/O and no state shared
//! between evaluations.
//!
//! ```rust
//! use serde_json::json;
//! use toolflow_engine::sandbox::{Sandbox, SandboxLimits};
//!
//! let sandbox = Sandbox::new(SandboxLimits::default());
//! let result = sandbox.call("(ctx) => ctx.users.map(u => u.id)", &[json!({"users": [{"id": 1}, {"id": 2}]})]);
//! assert_eq!(result.unwrap(), Some(json!([1, 2])));
//! ```

mod ast;
mod builtins;
mod interpreter;
mod lexer;
mod methods;
mod parser;
mod value;
mod worker;

use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use self::ast::Expr;
use self::interpreter::{Abrupt, Interpreter};
use self::value::JsValue;

pub use worker::run_on_worker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_steps: u64,
    pub timeout: Duration,
    pub max_call_depth: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            timeout: Duration::from_millis(1_000),
            max_call_depth: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { message: String, position: usize },

    #[error("expression does not evaluate to a function")]
    NotAFunction,

    #[error("ReferenceError: {0}")]
    Reference(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("RangeError: {0}")]
    Range(String),

    #[error("uncaught exception: {0}")]
    Thrown(String),

    #[error("evaluation exceeded the step budget of {max_steps}")]
    StepBudgetExceeded { max_steps: u64 },

    #[error("evaluation exceeded the time limit of {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("maximum call depth of {max_depth} exceeded")]
    CallDepthExceeded { max_depth: usize },

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("sandbox worker failed: {0}")]
    Worker(String),
}

impl SandboxError {
    /// Moves a syntax error position by `offset`, for sources parsed out of a larger text.
    pub fn shifted(self, offset: usize) -> Self {
        match self {
            SandboxError::Syntax { message, position } => SandboxError::Syntax {
                message,
                position: position + offset,
            },
            other => other,
        }
    }

    /// True when evaluation was stopped by a resource limit rather than by the code itself.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(
            self,
            SandboxError::StepBudgetExceeded { .. } | SandboxError::Timeout { .. } | SandboxError::CallDepthExceeded { .. }
        )
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, SandboxError::Syntax { .. })
    }
}

/// Entry point for evaluating function-expression strings.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
    abort: Option<CancellationToken>,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits, abort: None }
    }

    /// Copy whose evaluations stop with [`SandboxError::Cancelled`] once `token` is cancelled.
    pub fn with_abort(&self, token: CancellationToken) -> Self {
        Self {
            limits: self.limits.clone(),
            abort: Some(token),
        }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Parses `source` without running it. Fails unless it is a single function expression.
    pub fn check(&self, source: &str) -> Result<(), SandboxError> {
        match parser::parse_expression_source(source)? {
            Expr::Function(_) => Ok(()),
            _ => Err(SandboxError::NotAFunction),
        }
    }

    /// Evaluates the function expression in `source` and calls it with `args`.
    ///
    /// Returns `Ok(None)` when the function returns `undefined` (or a function), otherwise the
    /// result converted to JSON.
    ///
    /// Blocks the calling thread; async code should wrap the call in [`run_on_worker`].
    pub fn call(&self, source: &str, args: &[JsonValue]) -> Result<Option<JsonValue>, SandboxError> {
        if worker::on_worker() {
            return evaluate(source, args, self.limits.clone(), self.abort.clone());
        }
        let sandbox = self.clone();
        let source = source.to_string();
        let args = args.to_vec();
        worker::run_blocking(move || sandbox.call(&source, &args))?
    }
}

fn evaluate(
    source: &str,
    args: &[JsonValue],
    limits: SandboxLimits,
    abort: Option<CancellationToken>,
) -> Result<Option<JsonValue>, SandboxError> {
    let expr = parser::parse_expression_source(source)?;
    if !matches!(expr, Expr::Function(_)) {
        return Err(SandboxError::NotAFunction);
    }
    let mut interpreter = Interpreter::new(limits, abort);
    let result = interpreter.run_function(&expr, args).map_err(into_sandbox_error)?;
    result
        .to_json()
        .map_err(|_| SandboxError::Type("Converting circular structure to JSON".to_string()))
}

fn into_sandbox_error(abrupt: Abrupt) -> SandboxError {
    match abrupt {
        Abrupt::Fatal(error) => error,
        Abrupt::Throw(value) => {
            let (name, message) = match &value {
                JsValue::Object(entries) => {
                    let entries = entries.borrow();
                    let field = |key: &str| entries.get(key).map(JsValue::to_display_string);
                    (field("name"), field("message"))
                }
                _ => (None, None),
            };
            match (name.as_deref(), message) {
                (Some("ReferenceError"), Some(message)) => SandboxError::Reference(message),
                (Some("TypeError"), Some(message)) => SandboxError::Type(message),
                (Some("RangeError"), Some(message)) => SandboxError::Range(message),
                (Some(name), Some(message)) => SandboxError::Thrown(format!("{name}: {message}")),
                _ => SandboxError::Thrown(match value.to_json() {
                    Ok(Some(JsonValue::String(text))) => text,
                    Ok(Some(json)) => json.to_string(),
                    _ => value.to_display_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, arg: JsonValue) -> Result<Option<JsonValue>, SandboxError> {
        Sandbox::default().call(source, &[arg])
    }

    fn eval(source: &str, arg: JsonValue) -> JsonValue {
        run(source, arg).expect("evaluation succeeds").unwrap_or(JsonValue::Null)
    }

    #[test]
    fn maps_and_filters_arrays() {
        let ctx = json!({"users": [{"id": 1, "active": true}, {"id": 2, "active": false}, {"id": 3, "active": true}]});
        assert_eq!(eval("(ctx) => ctx.users.filter(u => u.active).map(u => u.id)", ctx), json!([1, 3]));
    }

    #[test]
    fn block_bodies_with_loops_and_destructuring() {
        let source = r#"
            function (ctx) {
                const totals = {};
                for (const { region, amount = 0 } of ctx.sales) {
                    totals[region] = (totals[region] ?? 0) + amount;
                }
                return Object.entries(totals).sort(([a], [b]) => a.localeCompare(b));
            }
        "#;
        let ctx = json!({"sales": [
            {"region": "west", "amount": 5},
            {"region": "east", "amount": 2},
            {"region": "west"},
            {"region": "east", "amount": 3}
        ]});
        assert_eq!(eval(source, ctx), json!([["east", 5], ["west", 5]]));
    }

    #[test]
    fn template_literals_and_string_methods() {
        let ctx = json!({"name": "  Ada  ", "tags": ["x", "y"]});
        assert_eq!(
            eval("(c) => `${c.name.trim().toUpperCase()}:${c.tags.join('|')}`", ctx),
            json!("ADA:x|y")
        );
    }

    #[test]
    fn regex_replace_with_groups() {
        assert_eq!(
            eval(r#"(c) => c.date.replace(/(\d+)-(\d+)-(\d+)/, "$3/$2/$1")"#, json!({"date": "2024-03-01"})),
            json!("01/03/2024")
        );
        assert_eq!(
            eval("(c) => c.text.replace(/o/g, m => m.toUpperCase())", json!({"text": "foo boo"})),
            json!("fOO bOO")
        );
    }

    #[test]
    fn optional_chaining_short_circuits() {
        assert_eq!(eval("(c) => c.user?.profile.name ?? 'anon'", json!({})), json!("anon"));
        assert_eq!(run("(c) => c.missing?.()", json!({})), Ok(None));
    }

    #[test]
    fn integers_stay_integers_in_json() {
        assert_eq!(eval("(c) => c.n * 2", json!({"n": 21})), json!(42));
        assert_eq!(eval("(c) => c.n / 4", json!({"n": 1})), json!(0.25));
        assert_eq!(eval("(c) => JSON.stringify({a: [1, 'b']})", json!({})), json!(r#"{"a":[1,"b"]}"#));
    }

    #[test]
    fn helpers_encode_values() {
        assert_eq!(eval("(c) => btoa(c.u + ':' + c.p)", json!({"u": "user", "p": "pass"})), json!("dXNlcjpwYXNz"));
        assert_eq!(eval("(c) => atob('dXNlcjpwYXNz')", json!({})), json!("user:pass"));
        assert_eq!(eval("(c) => encodeURIComponent(c.q)", json!({"q": "a b&c"})), json!("a%20b%26c"));
        assert_eq!(eval("(c) => Math.max(...c.xs)", json!({"xs": [3, 9, 4]})), json!(9));
        assert_eq!(eval("(c) => (1.005).toFixed(2)", json!({})), json!("1.00"));
        assert_eq!(eval("(c) => parseInt('42px') + parseFloat('.5')", json!({})), json!(42.5));
    }

    #[test]
    fn dates_are_supported() {
        assert_eq!(
            eval("(c) => new Date(c.ts).toISOString()", json!({"ts": "2024-01-02T03:04:05Z"})),
            json!("2024-01-02T03:04:05.000Z")
        );
        assert_eq!(eval("(c) => new Date(0).getUTCFullYear()", json!({})), json!(1970));
    }

    #[test]
    fn reading_through_undefined_is_a_type_error() {
        let error = run("(ctx) => ctx.missingKey.x", json!({"a": 1})).expect_err("must fail");
        assert_eq!(
            error,
            SandboxError::Type("Cannot read properties of undefined (reading 'x')".to_string())
        );
    }

    #[test]
    fn unknown_identifier_is_a_reference_error() {
        let error = run("(ctx) => missing + 1", json!({})).expect_err("must fail");
        assert!(matches!(error, SandboxError::Reference(message) if message == "missing is not defined"));
    }

    #[test]
    fn thrown_values_are_reported() {
        let error = run("(c) => { throw new Error('bad input') }", json!({})).expect_err("must fail");
        assert_eq!(error, SandboxError::Thrown("Error: bad input".to_string()));
        assert_eq!(
            eval("(c) => { try { null.x } catch (e) { return e.name } }", json!({})),
            json!("TypeError")
        );
    }

    #[test]
    fn infinite_loop_hits_the_step_budget() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        });
        let error = sandbox.call("(c) => { while (true) {} }", &[json!({})]).expect_err("must stop");
        assert!(error.is_budget_exhausted());
        assert_eq!(error, SandboxError::StepBudgetExceeded { max_steps: 10_000 });
    }

    #[test]
    fn infinite_loop_hits_the_timeout() {
        let sandbox = Sandbox::new(SandboxLimits {
            max_steps: u64::MAX,
            timeout: Duration::from_millis(50),
            ..SandboxLimits::default()
        });
        let error = sandbox.call("(c) => { for (;;) {} }", &[json!({})]).expect_err("must stop");
        assert_eq!(error, SandboxError::Timeout { timeout_ms: 50 });
    }

    #[test]
    fn cancelled_token_stops_a_running_loop() {
        let token = CancellationToken::new();
        let sandbox = Sandbox::new(SandboxLimits {
            max_steps: u64::MAX,
            timeout: Duration::from_secs(30),
            ..SandboxLimits::default()
        })
        .with_abort(token.clone());
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            token.cancel();
        });
        let started = std::time::Instant::now();
        let error = sandbox.call("(c) => { while (true) {} }", &[json!({})]).expect_err("must stop");
        canceller.join().expect("canceller thread");
        assert_eq!(error, SandboxError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unbounded_recursion_hits_the_call_depth_limit() {
        let error = run("(c) => { const f = (n) => f(n + 1); return f(0); }", json!({})).expect_err("must stop");
        assert_eq!(error, SandboxError::CallDepthExceeded { max_depth: 64 });
    }

    #[test]
    fn non_function_sources_are_rejected() {
        assert_eq!(run("1 + 2", json!({})), Err(SandboxError::NotAFunction));
        assert_eq!(Sandbox::default().check("ctx"), Err(SandboxError::NotAFunction));
        assert!(Sandbox::default().check("(ctx) => ctx.a").is_ok());
        assert!(Sandbox::default().check("(ctx) => ctx.a +").expect_err("syntax").is_syntax());
    }

    #[test]
    fn circular_results_are_rejected() {
        let error = run("(c) => { const a = []; a.push(a); return a; }", json!({})).expect_err("must fail");
        assert!(matches!(error, SandboxError::Type(_)));
    }

    #[test]
    fn closures_capture_their_scope() {
        let source = "(c) => { const add = (x) => (y) => x + y; const inc = add(1); return c.xs.map(inc); }";
        assert_eq!(eval(source, json!({"xs": [1, 2]})), json!([2, 3]));
    }

    #[test]
    fn sort_is_stable_with_comparator() {
        let source = "(c) => c.items.sort((a, b) => a.rank - b.rank).map(i => i.id)";
        let ctx = json!({"items": [{"id": "a", "rank": 2}, {"id": "b", "rank": 1}, {"id": "c", "rank": 2}]});
        assert_eq!(eval(source, ctx), json!(["b", "a", "c"]));
    }
}
