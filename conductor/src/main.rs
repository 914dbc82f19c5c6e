//! Sub-agent orchestration CLI.
//!
//! Agent specifications live in `.conductor/agents/`; session records and the
//! knowledge base are persisted under `.conductor/state/`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;

use conductor::core::fingerprint::TaskFingerprint;
use conductor::core::loop_guard::CallTrackingRecord;
use conductor::core::types::{ExecutionContext, SessionId, TaskRequest};
use conductor::exit_codes;
use conductor::io::catalog::load_catalog;
use conductor::io::config::load_config;
use conductor::io::init::{ConductorPaths, InitOptions, init_conductor};
use conductor::io::prompt::{self, InstructionPayload};
use conductor::io::store::{FileStateStore, StateStore};
use conductor::{Conductor, ConductorError, logging};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Spawn, bound and validate sub-agent sessions"
)]
struct Cli {
    /// Project root containing `.conductor/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct TaskArgs {
    /// Agent type to run.
    agent: String,
    /// Task description.
    #[arg(short, long)]
    description: String,
    /// Task input as a JSON object.
    #[arg(short, long, default_value = "{}")]
    input: String,
    /// Entity the task is about; memory proposals naming it are related.
    #[arg(short, long)]
    subject: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.conductor/` with a default config and a sample agent.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Load every agent specification and report all problems.
    Check,
    /// Print the instructions an agent would receive, without calling it.
    Preview(TaskArgs),
    /// Run an agent, validate its output and apply its memory proposals.
    Run(TaskArgs),
    /// List persisted session records.
    Sessions {
        /// Print full records as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            let code = match err.downcast_ref::<ConductorError>() {
                Some(err) if !err.is_fatal() => exit_codes::REQUEST_FAILED,
                _ => exit_codes::INVALID,
            };
            exit(code)
        }
    }
}

fn exit(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli) -> Result<i32> {
    let paths = ConductorPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => cmd_init(&cli.root, force),
        Command::Check => cmd_check(&paths),
        Command::Preview(args) => cmd_preview(&paths, &args),
        Command::Run(args) => cmd_run(&paths, &args),
        Command::Sessions { json } => cmd_sessions(&paths, json),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_conductor(root, &InitOptions { force })?;
    println!("initialized {}", paths.conductor_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_check(paths: &ConductorPaths) -> Result<i32> {
    load_config(&paths.config_path)?;
    let catalog = load_catalog(&paths.agents_dir)?;
    for agent in catalog.iter() {
        match &agent.spec.operation {
            Some(operation) => println!("{} (tool: {operation})", agent.spec.id),
            None => println!("{}", agent.spec.id),
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_preview(paths: &ConductorPaths, args: &TaskArgs) -> Result<i32> {
    let payload = preview_payload(paths, args)?;
    println!("{}", payload.text);
    Ok(exit_codes::OK)
}

/// Render the instructions a fresh root spawn of `args` would receive,
/// including the depth and budget its admission would assign.
fn preview_payload(paths: &ConductorPaths, args: &TaskArgs) -> Result<InstructionPayload> {
    let config = load_config(&paths.config_path)?;
    let catalog = load_catalog(&paths.agents_dir)?;
    let agent = catalog.get(&args.agent)?;
    let mut request = task_request(args, ExecutionContext::root(config.max_calls))?;
    let violations = agent.validate_input(&request.input);
    if !violations.is_empty() {
        bail!("input does not match the schema:\n- {}", violations.join("\n- "));
    }
    let admission = CallTrackingRecord::new(request.context.root)
        .admit(
            &config.limits(),
            SessionId::new(),
            None,
            0,
            &TaskFingerprint::of(&request),
        )
        .map_err(|err| anyhow!("{} would be refused: {err}", args.agent))?;
    request.context.depth = admission.depth;
    request.context.remaining_budget = admission.remaining_budget;
    Ok(prompt::build(&agent.spec, &request, &paths.read_principles()?)?)
}

fn cmd_run(paths: &ConductorPaths, args: &TaskArgs) -> Result<i32> {
    let runtime = tokio::runtime::Runtime::new().context("start tokio runtime")?;
    runtime.block_on(async {
        let conductor = Conductor::open(paths)?;
        let request = task_request(args, conductor.new_root())?;
        let root = request.context.root;
        let outcome = conductor.run(&args.agent, request).await;
        if let Err(err) = conductor.close_root(root) {
            tracing::warn!(%root, error = %err, "failed to close root");
        }
        conductor.shutdown().await;

        let code = match outcome {
            Ok(outcome) => {
                print_json(&outcome.to_json())?;
                exit_codes::OK
            }
            Err(failure) if failure.error.is_fatal() => return Err(failure.error.into()),
            Err(failure) => {
                print_json(&failure.to_json())?;
                match failure.error {
                    ConductorError::ValidationRejected { .. } => exit_codes::REJECTED,
                    _ => exit_codes::REQUEST_FAILED,
                }
            }
        };
        Ok::<_, anyhow::Error>(code)
    })
}

fn cmd_sessions(paths: &ConductorPaths, json: bool) -> Result<i32> {
    let sessions = FileStateStore::new(&paths.state_dir).list_sessions()?;
    if json {
        print_json(&serde_json::to_value(&sessions).context("serialize sessions")?)?;
        return Ok(exit_codes::OK);
    }
    for session in sessions {
        println!(
            "{}  {:<20}  {:<12}  depth={}  {}",
            session.id,
            session.state.as_str(),
            session.agent_type,
            session.depth,
            session.created_at.to_rfc3339()
        );
    }
    Ok(exit_codes::OK)
}

fn task_request(args: &TaskArgs, context: ExecutionContext) -> Result<TaskRequest> {
    let input: Value = serde_json::from_str(&args.input).context("parse --input as JSON")?;
    let Value::Object(input) = input else {
        bail!("--input must be a JSON object");
    };
    let mut request = TaskRequest::new(args.agent.clone(), args.description.clone(), context);
    request.input = input;
    request.subject = args.subject.clone();
    Ok(request)
}

fn print_json(value: &Value) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor::test_support::{ScriptedCompletion, TempWorkspace, envelope, spec};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["conductor", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_input() {
        let cli = Cli::parse_from([
            "conductor",
            "--root",
            "/tmp/project",
            "run",
            "reviewer",
            "--description",
            "review auth",
            "--input",
            r#"{"target":"src/auth.rs"}"#,
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.agent, "reviewer");
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
        let request = task_request(&args, ExecutionContext::root(20)).expect("request");
        assert_eq!(request.input["target"], "src/auth.rs");
    }

    #[test]
    fn non_object_input_is_refused() {
        let args = TaskArgs {
            agent: "reviewer".to_string(),
            description: "x".to_string(),
            input: "[1,2]".to_string(),
            subject: None,
        };
        assert!(task_request(&args, ExecutionContext::root(20)).is_err());
    }

    #[tokio::test]
    async fn preview_matches_what_a_live_root_spawn_receives() {
        let workspace = TempWorkspace::with_specs(&[spec("analyst")]);
        let args = TaskArgs {
            agent: "analyst".to_string(),
            description: "summarize auth".to_string(),
            input: r#"{"topic":"auth"}"#.to_string(),
            subject: None,
        };
        let preview = preview_payload(&workspace.paths, &args).expect("preview");

        let config = load_config(&workspace.paths.config_path).expect("config");
        let completion = ScriptedCompletion::with_fallback(envelope(json!({"summary": "ok"})));
        let conductor =
            Conductor::open_with(&workspace.paths, config, Arc::new(completion.clone()))
                .expect("open conductor");
        let request = task_request(&args, conductor.new_root()).expect("request");
        conductor.spawn("analyst", request).await.expect("spawn");
        conductor.shutdown().await;

        let requests = completion.requests();
        assert_eq!(requests[0].messages[0].content, preview.text);
    }

    #[test]
    fn preview_renders_sample_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_conductor(temp.path(), &InitOptions { force: false }).expect("init");
        let args = TaskArgs {
            agent: "reviewer".to_string(),
            description: "review auth".to_string(),
            input: r#"{"target":"src/auth.rs"}"#.to_string(),
            subject: None,
        };
        assert_eq!(cmd_preview(&paths, &args).expect("preview"), exit_codes::OK);
        assert_eq!(cmd_check(&paths).expect("check"), exit_codes::OK);
    }
}
