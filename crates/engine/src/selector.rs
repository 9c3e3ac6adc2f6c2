//! Data selector evaluation and single/loop dispatch.
//!
//! A step's `dataSelector` decides how often its configuration is executed: once with
//! `currentItem = {}` when absent, once with the object it returns, or once per element of the
//! array it returns. Loop entries are always reported in input order, whatever the concurrency.

use std::future::Future;
use std::pin::pin;

use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use toolflow_types::{ResultEnvelope, StepOutcome, ToolStep};
use tracing::debug;

use crate::context::VariableContext;
use crate::error::EngineError;
use crate::resolve::ExpressionResolver;
use crate::templates::sole_placeholder;

/// How a step is going to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionPlan {
    /// One invocation with the given `currentItem`.
    Single(Value),
    /// One invocation per element, in order. May be empty.
    Loop(Vec<Value>),
}

impl ExecutionPlan {
    pub fn invocation_count(&self) -> usize {
        match self {
            ExecutionPlan::Single(_) => 1,
            ExecutionPlan::Loop(items) => items.len(),
        }
    }
}

/// Evaluates the step's data selector and classifies its result.
pub fn plan_execution(step: &ToolStep, context: &VariableContext, resolver: &ExpressionResolver) -> Result<ExecutionPlan, EngineError> {
    let Some(selector) = step.data_selector.as_deref().filter(|selector| !selector.trim().is_empty()) else {
        return Ok(ExecutionPlan::Single(Value::Object(Map::new())));
    };
    let expression = sole_placeholder(selector).unwrap_or(selector);

    match resolver.evaluate(expression, context)? {
        Some(Value::Object(item)) => Ok(ExecutionPlan::Single(Value::Object(item))),
        Some(Value::Array(items)) => {
            debug!(step_id = %step.id, item_count = items.len(), "data selector produced loop items");
            Ok(ExecutionPlan::Loop(items))
        }
        other => Err(EngineError::SelectorType {
            step_id: step.id.clone(),
            found: describe_kind(other.as_ref()).to_string(),
        }),
    }
}

/// Runs `invoke` according to `plan` and assembles the step outcome.
///
/// At most `concurrency` loop invocations are in flight at once. An invocation error is
/// step-fatal and drops the invocations still in flight. Returns `Ok(None)` when `cancel` fires
/// before every invocation finished.
pub async fn drive_plan<F, Fut>(
    plan: ExecutionPlan,
    concurrency: usize,
    cancel: &CancellationToken,
    mut invoke: F,
) -> Result<Option<StepOutcome>, EngineError>
where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = Result<ResultEnvelope, EngineError>>,
{
    match plan {
        ExecutionPlan::Single(current_item) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            envelope = invoke(current_item) => Ok(Some(StepOutcome::Single(envelope?))),
        },
        ExecutionPlan::Loop(items) => {
            let mut entries = Vec::with_capacity(items.len());
            let mut pending = pin!(stream::iter(items).map(invoke).buffered(concurrency.max(1)));
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(None),
                    next = pending.next() => match next {
                        Some(envelope) => entries.push(envelope?),
                        None => break,
                    },
                }
            }
            Ok(Some(StepOutcome::Loop(entries)))
        }
    }
}

fn describe_kind(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}
