//! # Step Pipeline Execution
//!
//! [`ToolExecutor::run_tool`] runs the steps of a [`Tool`] in declaration order. Before each
//! step the variable context is rebuilt from the payload, credentials and every result written
//! so far; the step's data selector then decides between one invocation and a loop, and the
//! resulting envelope(s) are stored under the step id before the next step starts. Finally the
//! output transform, response filters and output schema are applied.
//!
//! A step-fatal error stops the pipeline but the run result keeps every envelope written before
//! it. Cancellation (by run id or through a caller token) and the run timeout drop in-flight
//! connector calls, stop running expressions and report an `aborted` run with the same partial
//! results. Expressions are evaluated on sandbox workers, never on the runtime thread, so the
//! timeout and cancellation stay live while a transform or selector runs.

pub mod connector;
pub mod credentials;
pub mod http;
mod output;
mod pagination;
pub mod registry;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use toolflow_types::{
    FailureBehavior, PaginationType, ResultEnvelope, StepConfig, StepOutcome, Tool, ToolStep, validate_tool_structure,
};
use tracing::{debug, info, warn};

pub use connector::{ConnectorResponse, ConnectorSet, NoopConnector, Protocol, StepConnector};
pub use credentials::{CredentialStore, StaticCredentialStore};
pub use http::HttpConnector;
pub use registry::{RunGuard, RunRegistry};

use self::credentials::collect_credentials;
use self::output::{apply_output_transform, apply_response_filters, validate_against_schema};
use self::pagination::{PaginatedRequest, fetch_pages};
use crate::config::EngineConfig;
use crate::context::{PaginationVars, SystemCredentials, VariableContext, VariableContextBuilder};
use crate::error::EngineError;
use crate::resolve::ExpressionResolver;
use crate::selector::{ExecutionPlan, drive_plan, plan_execution};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Externally chosen run identifier; generated when absent.
    pub run_id: Option<String>,
    /// Overrides the configured run timeout.
    pub timeout: Option<Duration>,
    /// Caller-owned token; cancelling it aborts the run.
    pub cancellation: Option<CancellationToken>,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub run_id: String,
    pub tool_id: String,
    pub status: RunStatus,
    /// Envelopes of every step that completed, in execution order.
    pub step_results: IndexMap<String, StepOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_error")]
    pub error: Option<EngineError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn serialize_error<S: Serializer>(error: &Option<EngineError>, serializer: S) -> Result<S::Ok, S::Error> {
    error.as_ref().map(EngineError::diagnostic).serialize(serializer)
}

impl RunResult {
    fn started(run_id: String, tool_id: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            tool_id,
            status: RunStatus::Failed,
            step_results: IndexMap::new(),
            output: None,
            error: None,
            failed_step_id: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self, outcome: Result<Value, EngineError>) -> Self {
        self.finished_at = Utc::now();
        match outcome {
            Ok(output) => {
                self.status = RunStatus::Succeeded;
                self.output = Some(output);
            }
            Err(error) => {
                self.status = if error.is_aborted() { RunStatus::Aborted } else { RunStatus::Failed };
                self.error = Some(error);
            }
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at).to_std().unwrap_or_default()
    }
}

/// Read-only view of the run handed to each step.
#[derive(Clone, Copy)]
struct StepScope<'a> {
    run_id: &'a str,
    payload: &'a Map<String, Value>,
    credentials: &'a IndexMap<String, SystemCredentials>,
    step_results: &'a IndexMap<String, StepOutcome>,
    cancel: &'a CancellationToken,
    resolver: &'a ExpressionResolver,
}

impl StepScope<'_> {
    fn context(&self, current_item: Option<&Value>, pagination: Option<&PaginationVars>) -> VariableContext {
        VariableContextBuilder::new(self.payload)
            .credentials(self.credentials)
            .step_results(self.step_results)
            .pagination(pagination)
            .current_item(current_item)
            .build()
    }

    fn aborted(&self) -> EngineError {
        EngineError::Aborted {
            run_id: self.run_id.to_string(),
            reason: "cancelled".to_string(),
        }
    }
}

/// Run-wide inputs shared by every step.
#[derive(Clone, Copy)]
struct RunSteps<'a> {
    run_id: &'a str,
    payload: &'a Map<String, Value>,
    credentials: &'a IndexMap<String, SystemCredentials>,
    cancel: &'a CancellationToken,
    resolver: &'a ExpressionResolver,
}

impl RunSteps<'_> {
    fn scope<'s>(&'s self, step_results: &'s IndexMap<String, StepOutcome>) -> StepScope<'s> {
        StepScope {
            run_id: self.run_id,
            payload: self.payload,
            credentials: self.credentials,
            step_results,
            cancel: self.cancel,
            resolver: self.resolver,
        }
    }
}

enum PipelineEnd {
    Finished(Result<Value, EngineError>),
    Cancelled,
    TimedOut(Duration),
}

/// Executes tools against registered connectors and a credential store.
pub struct ToolExecutor {
    config: EngineConfig,
    resolver: ExpressionResolver,
    connectors: ConnectorSet,
    credentials: Arc<dyn CredentialStore>,
    runs: RunRegistry,
}

impl ToolExecutor {
    /// Executor without connectors; register them with [`ToolExecutor::with_connectors`].
    pub fn new(config: EngineConfig) -> Self {
        Self {
            resolver: ExpressionResolver::new(config.sandbox_limits()),
            config,
            connectors: ConnectorSet::new(),
            credentials: Arc::new(StaticCredentialStore::new()),
            runs: RunRegistry::new(),
        }
    }

    /// Executor with the reference HTTP connector registered.
    pub fn with_http(config: EngineConfig) -> anyhow::Result<Self> {
        let http = HttpConnector::new(config.http_timeout())?;
        Ok(Self::new(config).with_connectors(ConnectorSet::new().with_connector(Protocol::Http, Arc::new(http))))
    }

    pub fn with_connectors(mut self, connectors: ConnectorSet) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialStore>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ExpressionResolver {
        &self.resolver
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Cancels a live run. Returns `false` when the run id is unknown or already finished.
    pub fn cancel(&self, run_id: &str) -> bool {
        self.runs.cancel(run_id)
    }

    /// Runs `tool` with `payload` and reports the outcome with every completed step result.
    pub async fn run_tool(&self, tool: &Tool, payload: Value, options: RunOptions) -> RunResult {
        let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
        let result = RunResult::started(run_id.clone(), tool.id.clone());

        let Some(guard) = self.runs.register(&run_id, options.cancellation.as_ref()) else {
            warn!(run_id = %run_id, "run id is already active");
            return result.finish(Err(EngineError::Aborted {
                run_id,
                reason: "a run with this id is already active".to_string(),
            }));
        };

        let payload = match self.prepare_run(tool, payload) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(run_id = %run_id, tool_id = %tool.id, error_code = error.error_code(), "tool run rejected");
                return result.finish(Err(error));
            }
        };

        let credentials = collect_credentials(self.credentials.as_ref(), &tool.system_ids());
        let timeout = options.timeout.or_else(|| self.config.run_timeout());
        info!(
            run_id = %run_id,
            tool_id = %tool.id,
            step_count = tool.steps.len(),
            timeout_ms = timeout.map(|timeout| timeout.as_millis() as u64),
            "tool run started"
        );

        let token = guard.token().clone();
        let resolver = self.resolver.with_abort(token.clone());
        let mut step_results = IndexMap::new();
        let mut failed_step_id = None;
        let end = {
            let steps = RunSteps {
                run_id: &run_id,
                payload: &payload,
                credentials: &credentials,
                cancel: &token,
                resolver: &resolver,
            };
            let results = &mut step_results;
            let failed = &mut failed_step_id;
            let pipeline = async move {
                self.execute_steps(tool, steps, &mut *results, failed).await?;
                self.finalize_output(tool, steps, results).await
            };
            tokio::select! {
                biased;
                finished = pipeline => PipelineEnd::Finished(finished),
                _ = token.cancelled() => PipelineEnd::Cancelled,
                _ = deadline(timeout) => PipelineEnd::TimedOut(timeout.unwrap_or_default()),
            }
        };

        let outcome = match end {
            PipelineEnd::Finished(outcome) => outcome,
            PipelineEnd::Cancelled => Err(EngineError::Aborted {
                run_id: run_id.clone(),
                reason: "cancelled".to_string(),
            }),
            PipelineEnd::TimedOut(timeout) => {
                token.cancel();
                Err(EngineError::Aborted {
                    run_id: run_id.clone(),
                    reason: format!("run timed out after {} ms", timeout.as_millis()),
                })
            }
        };

        let mut result = result.finish(outcome);
        result.step_results = step_results;
        result.failed_step_id = failed_step_id;
        match &result.error {
            None => info!(
                run_id = %run_id,
                steps = result.step_results.len(),
                duration_ms = result.duration().as_millis() as u64,
                "tool run succeeded"
            ),
            Some(error) => warn!(
                run_id = %run_id,
                status = ?result.status,
                error_code = error.error_code(),
                completed_steps = result.step_results.len(),
                failed_step_id = result.failed_step_id.as_deref().unwrap_or(""),
                "tool run did not succeed"
            ),
        }
        drop(guard);
        result
    }

    fn prepare_run(&self, tool: &Tool, payload: Value) -> Result<Map<String, Value>, EngineError> {
        validate_tool_structure(tool).map_err(|violations| EngineError::StructuralInvalid {
            tool_id: tool.id.clone(),
            violations,
        })?;

        let payload = match payload {
            Value::Null => Map::new(),
            Value::Object(fields) => fields,
            other => {
                return Err(EngineError::InvalidPayload {
                    found: json_kind(&other).to_string(),
                });
            }
        };

        if let Some(schema) = &tool.input_schema {
            validate_against_schema(schema, &Value::Object(payload.clone()), "payload")?;
        }
        Ok(payload)
    }

    async fn execute_steps(
        &self,
        tool: &Tool,
        steps: RunSteps<'_>,
        step_results: &mut IndexMap<String, StepOutcome>,
        failed_step_id: &mut Option<String>,
    ) -> Result<(), EngineError> {
        let RunSteps { run_id, cancel, .. } = steps;
        for step in &tool.steps {
            let scope = steps.scope(&*step_results);
            if cancel.is_cancelled() {
                return Err(scope.aborted());
            }
            debug!(run_id = %run_id, step_id = %step.id, kind = step.config.kind(), "step started");

            match self.execute_step(step, scope).await {
                Ok(outcome) => {
                    let single_failure = match &outcome {
                        StepOutcome::Single(envelope) if !envelope.success => Some(EngineError::Connector {
                            step_id: step.id.clone(),
                            message: envelope.error.clone().unwrap_or_else(|| "invocation failed".to_string()),
                        }),
                        _ => None,
                    };
                    info!(
                        run_id = %run_id,
                        step_id = %step.id,
                        entries = outcome.entries().len(),
                        failed_entries = outcome.errors().len(),
                        "step finished"
                    );
                    step_results.insert(step.id.clone(), outcome);
                    if let Some(error) = single_failure
                        && step.failure_behavior == FailureBehavior::Fail
                    {
                        *failed_step_id = Some(step.id.clone());
                        return Err(error);
                    }
                }
                Err(error) if error.is_aborted() => return Err(error),
                Err(error) => match step.failure_behavior {
                    FailureBehavior::Continue => {
                        warn!(run_id = %run_id, step_id = %step.id, error = %error, "step failed; continuing");
                        let envelope = ResultEnvelope::failed(Value::Object(Map::new()), Value::Null, error.to_string());
                        step_results.insert(step.id.clone(), StepOutcome::Single(envelope));
                    }
                    FailureBehavior::Fail => {
                        warn!(run_id = %run_id, step_id = %step.id, error_code = error.error_code(), "step failed");
                        *failed_step_id = Some(step.id.clone());
                        return Err(error);
                    }
                },
            }
        }
        Ok(())
    }

    async fn execute_step(&self, step: &ToolStep, scope: StepScope<'_>) -> Result<StepOutcome, EngineError> {
        let context = scope.context(None, None);
        let planned = step.clone();
        let plan = scope
            .resolver
            .spawn(move |resolver| plan_execution(&planned, &context, resolver))
            .await?;
        if let ExecutionPlan::Loop(items) = &plan {
            debug!(step_id = %step.id, iterations = items.len(), concurrency = self.config.loop_concurrency, "looping step");
        }

        drive_plan(plan, self.config.loop_concurrency, scope.cancel, move |current_item| {
            self.invoke(step, current_item, scope)
        })
        .await?
        .ok_or_else(|| scope.aborted())
    }

    /// One execution of the step's configuration for `current_item`.
    async fn invoke(&self, step: &ToolStep, current_item: Value, scope: StepScope<'_>) -> Result<ResultEnvelope, EngineError> {
        match &step.config {
            StepConfig::Transform(transform) => {
                let context = scope.context(Some(&current_item), None);
                let code = transform.transform_code.clone();
                let data = scope
                    .resolver
                    .spawn(move |resolver| resolver.evaluate(&code, &context))
                    .await?
                    .unwrap_or(Value::Null);
                Ok(ResultEnvelope::ok(current_item, data))
            }
            StepConfig::Request(request) => {
                let pagination = request
                    .pagination
                    .as_ref()
                    .filter(|pagination| pagination.pagination_type != PaginationType::Disabled);
                let response = match pagination {
                    Some(pagination) => {
                        let paginated = PaginatedRequest {
                            step_id: &step.id,
                            config: request,
                            pagination,
                            max_pages: self.config.max_pages,
                            default_page_size: self.config.default_page_size,
                        };
                        fetch_pages(paginated, scope.resolver, &self.connectors, scope.cancel, |vars| {
                            scope.context(Some(&current_item), Some(vars))
                        })
                        .await?
                    }
                    None => {
                        let context = scope.context(Some(&current_item), None);
                        let config = request.clone();
                        let resolved = scope
                            .resolver
                            .spawn(move |resolver| resolver.resolve_request(&config, &context))
                            .await?;
                        if scope.cancel.is_cancelled() {
                            None
                        } else {
                            Some(self.connectors.execute(request, &resolved).await)
                        }
                    }
                };
                let response = response.ok_or_else(|| scope.aborted())?;
                Ok(match response.success {
                    true => ResultEnvelope::ok(current_item, response.data),
                    false => {
                        let error = response.error.unwrap_or_else(|| "connector reported failure".to_string());
                        ResultEnvelope::failed(current_item, response.data, error)
                    }
                })
            }
        }
    }

    async fn finalize_output(
        &self,
        tool: &Tool,
        steps: RunSteps<'_>,
        step_results: &IndexMap<String, StepOutcome>,
    ) -> Result<Value, EngineError> {
        let context = steps.scope(step_results).context(None, None);
        let step_data = step_results
            .iter()
            .map(|(step_id, outcome)| (step_id.clone(), outcome.data()))
            .collect();
        let transform = tool.output_transform.clone();
        let output = steps
            .resolver
            .spawn(move |resolver| apply_output_transform(transform.as_deref(), &context, step_data, resolver))
            .await?;
        let output = apply_response_filters(&tool.response_filters, output)?;
        if let Some(schema) = &tool.output_schema {
            validate_against_schema(schema, &output, "output")?;
        }
        Ok(output)
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending::<()>().await,
    }
}

fn generate_run_id() -> String {
    let sequence = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{sequence}", Utc::now().format("%Y%m%dT%H%M%S%.6fZ"))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
