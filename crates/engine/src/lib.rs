//! # Toolflow Engine
//!
//! The engine executes declarative multi-step tools. Each step either calls an external
//! system through a connector or evaluates a sandboxed transform, and every step result is
//! threaded forward into a shared variable context that later steps reference through
//! `<<expression>>` templates.
//!
//! ## Usage
//!
//! ```rust
//! use toolflow_engine::{EngineConfig, RunOptions, ToolExecutor, parse_tool_str};
//!
//! let tool = parse_tool_str(r#"{
//!     "id": "greet",
//!     "steps": [{
//!         "id": "hello",
//!         "config": { "type": "transform", "transformCode": "(ctx) => `hello ${ctx.name}`" }
//!     }]
//! }"#)?;
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let executor = ToolExecutor::new(EngineConfig::default());
//! let result = runtime.block_on(executor.run_tool(&tool, serde_json::json!({"name": "ada"}), RunOptions::default()));
//! assert_eq!(result.output, Some(serde_json::json!({"hello": "hello ada"})));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`templates`**: `<<...>>` placeholder parsing and unresolved-reference reporting
//! - **`sandbox`**: bounded interpreter for expression and transform code
//! - **`context`**: variable context assembly from payload, credentials and step results
//! - **`resolve`**: template resolution and request construction
//! - **`selector`**: single versus loop execution planning
//! - **`executor`**: the step pipeline, connectors, pagination and run registry
//! - **`config`**: engine settings from files and the environment

use std::{fs, path::Path};

use anyhow::{Context, Result};
use toolflow_types::Tool;

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod resolve;
pub mod sandbox;
pub mod selector;
pub mod templates;

pub use config::{ConfigError, EngineConfig, SandboxConfig};
pub use context::{PaginationVars, SystemCredentials, VariableContext, VariableContextBuilder};
pub use error::EngineError;
pub use executor::{
    ConnectorResponse, ConnectorSet, CredentialStore, HttpConnector, NoopConnector, Protocol, RunGuard, RunOptions, RunRegistry,
    RunResult, RunStatus, StaticCredentialStore, StepConnector, ToolExecutor,
};
pub use resolve::{ExpressionResolver, ResolvedRequest};
pub use sandbox::{Sandbox, SandboxError, SandboxLimits};
pub use selector::{ExecutionPlan, drive_plan, plan_execution};
pub use templates::{UnresolvedTemplateRef, collect_unresolved_templates, extract_template_expressions};

/// Loads a tool document from the filesystem.
///
/// Files ending in `.json` are parsed as JSON; everything else is parsed as YAML, which also
/// accepts JSON documents.
pub fn parse_tool_file(file_path: impl AsRef<Path>) -> Result<Tool> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read tool file: {}", file_path.display()))?;

    let is_json = file_path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if is_json {
        return serde_json::from_str(&content).with_context(|| format!("Failed to parse tool JSON: {}", file_path.display()));
    }
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse tool document: {}", file_path.display()))
}

/// Parses a tool document held in memory, trying JSON first and then YAML.
pub fn parse_tool_str(content: &str) -> Result<Tool> {
    match serde_json::from_str::<Tool>(content) {
        Ok(tool) => Ok(tool),
        Err(json_error) => serde_yaml::from_str(content)
            .with_context(|| format!("Unsupported tool document format (not JSON: {json_error})")),
    }
}
