use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use toolflow_engine::{EngineConfig, RunOptions, StaticCredentialStore, ToolExecutor, parse_tool_file};
use toolflow_registry::{apply_patches, parse_patches};
use toolflow_types::validate_tool_structure;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let matches = build_cli().get_matches();

    match matches.subcommand() {
        Some(("run", sub)) => run_tool_cmd(sub).await,
        Some(("patch", sub)) => patch_tool_cmd(sub),
        Some(("validate", sub)) => validate_tool_cmd(sub),
        _ => {
            build_cli().print_help()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_cli() -> Command {
    let tool_arg = Arg::new("tool")
        .long("tool")
        .short('t')
        .required(true)
        .action(ArgAction::Set)
        .help("Path to the tool document (JSON or YAML)");

    Command::new("toolflow")
        .about("Run, patch and validate declarative multi-step tools")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand(
            Command::new("run")
                .about("Execute a tool and print the run result")
                .arg(tool_arg.clone())
                .arg(Arg::new("payload").long("payload").short('p').action(ArgAction::Set).help("Path to the JSON/YAML payload"))
                .arg(
                    Arg::new("credentials")
                        .long("credentials")
                        .action(ArgAction::Set)
                        .help("Path to credentials keyed by system id"),
                )
                .arg(Arg::new("config").long("config").action(ArgAction::Set).help("Path to the engine config"))
                .arg(
                    Arg::new("timeout-ms")
                        .long("timeout-ms")
                        .action(ArgAction::Set)
                        .value_parser(value_parser!(u64))
                        .help("Overall run timeout in milliseconds"),
                )
                .arg(Arg::new("run-id").long("run-id").action(ArgAction::Set).help("Explicit run identifier")),
        )
        .subcommand(
            Command::new("patch")
                .about("Apply a JSON Patch batch to a tool and print the patched document")
                .arg(tool_arg.clone())
                .arg(
                    Arg::new("patches")
                        .long("patches")
                        .required(true)
                        .action(ArgAction::Set)
                        .help("Path to a JSON array of patch operations"),
                ),
        )
        .subcommand(Command::new("validate").about("Check a tool against the structural rules").arg(tool_arg))
}

fn read_document(path: &str) -> Result<Value> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let is_json = Path::new(path)
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Failed to parse JSON in {path}"))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {path}"))
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

async fn run_tool_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let tool_path = matches.get_one::<String>("tool").context("--tool is required")?;
    let tool = parse_tool_file(tool_path)?;

    let config = match matches.get_one::<String>("config") {
        Some(path) => EngineConfig::load_from_path(path),
        None => EngineConfig::from_env(),
    }
    .context("Failed to load engine config")?;

    let payload = match matches.get_one::<String>("payload") {
        Some(path) => read_document(path)?,
        None => Value::Null,
    };

    let mut executor = ToolExecutor::with_http(config)?;
    if let Some(path) = matches.get_one::<String>("credentials") {
        let credentials = StaticCredentialStore::from_json(read_document(path)?).context("Credentials must map system ids to key/value objects")?;
        executor = executor.with_credentials(Arc::new(credentials));
    }

    let cancellation = cancel_on_ctrl_c();
    let options = RunOptions {
        run_id: matches.get_one::<String>("run-id").cloned(),
        timeout: matches.get_one::<u64>("timeout-ms").map(|millis| Duration::from_millis(*millis)),
        cancellation: Some(cancellation),
    };

    info!(tool_id = %tool.id, "running tool");
    let result = executor.run_tool(&tool, payload, options).await;
    print_json(&result)?;
    Ok(exit_code(result.is_success()))
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            on_signal.cancel();
        }
    });
    token
}

fn patch_tool_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let tool_path = matches.get_one::<String>("tool").context("--tool is required")?;
    let patches_path = matches.get_one::<String>("patches").context("--patches is required")?;
    let tool = parse_tool_file(tool_path)?;

    let outcome = parse_patches(read_document(patches_path)?).and_then(|patches| apply_patches(&tool, &patches));
    match outcome {
        Ok(outcome) => {
            print_json(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(error) => {
            warn!(error_code = error.error_code(), "patch batch rejected");
            print_json(&json!({ "error": error.diagnostic() }))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

fn validate_tool_cmd(matches: &ArgMatches) -> Result<ExitCode> {
    let tool_path = matches.get_one::<String>("tool").context("--tool is required")?;
    let tool = parse_tool_file(tool_path)?;
    let report = match validate_tool_structure(&tool) {
        Ok(()) => json!({ "toolId": tool.id, "valid": true }),
        Err(violations) => json!({ "toolId": tool.id, "valid": false, "violations": violations }),
    };
    let valid = report["valid"] == json!(true);
    print_json(&report)?;
    Ok(exit_code(valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn run_accepts_all_documented_flags() {
        let matches = build_cli()
            .try_get_matches_from([
                "toolflow",
                "run",
                "--tool",
                "tool.json",
                "--payload",
                "payload.json",
                "--credentials",
                "creds.yaml",
                "--config",
                "engine.yaml",
                "--timeout-ms",
                "2500",
            ])
            .expect("parse run");
        let (name, sub) = matches.subcommand().expect("subcommand");
        assert_eq!(name, "run");
        assert_eq!(sub.get_one::<u64>("timeout-ms"), Some(&2500));
        assert!(build_cli().try_get_matches_from(["toolflow", "patch", "--tool", "t.json"]).is_err());
    }

    #[test]
    fn read_document_accepts_json_and_yaml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let json_path = dir.path().join("payload.json");
        std::fs::write(&json_path, r#"{"name": "ada"}"#).expect("write json");
        let yaml_path = dir.path().join("payload.yaml");
        std::fs::write(&yaml_path, "name: ada\n").expect("write yaml");

        let from_json = read_document(json_path.to_str().expect("utf8 path")).expect("json");
        let from_yaml = read_document(yaml_path.to_str().expect("utf8 path")).expect("yaml");
        assert_eq!(from_json, from_yaml);
    }
}
