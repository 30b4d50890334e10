use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};

use codeact::agent::{CycleOrchestrator, CycleRequest, Role, RunRecord, RunStore};
use codeact::config::Settings;
use codeact::llm::{build_model, ModelSpec};
use codeact::session::{OutputSink, RunConfig, SessionRegistry};
use codeact::tracing::{init_tracing, shutdown_tracing};

#[derive(Parser, Debug)]
#[command(name = "codeact")]
#[command(about = "Thought-Code-Observation agent with persistent Python sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a task to completion
    Run(RunArgs),
    /// Inspect saved runs
    Runs {
        #[command(subcommand)]
        command: RunsCommand,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    task: String,
    /// Supporting document (.md or .txt)
    #[arg(long)]
    document: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    thread_id: Option<String>,
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    workspace_name: Option<String>,
    #[arg(long)]
    max_steps: Option<usize>,
    /// provider:model, overrides LLM_MODEL_NAME
    #[arg(long)]
    model: Option<String>,
    #[arg(long = "no-save", action = ArgAction::SetTrue)]
    no_save: bool,
    /// Write report sections to reports/report-<run_id>.md in the workspace
    #[arg(long, action = ArgAction::SetTrue)]
    write_report: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    print_metrics: bool,
}

#[derive(Subcommand, Debug)]
enum RunsCommand {
    List,
    Show { id: String },
    Delete { id: String },
}

/// Mirrors script output to the terminal as it arrives
struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn write_chunk(&mut self, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();
    let cli = Cli::parse();

    if let Err(e) = init_tracing("codeact", settings.otlp_endpoint.as_deref(), settings.log_json) {
        eprintln!("warning: tracing disabled: {}", e);
    }

    let result = match cli.command {
        Commands::Run(args) => run_command(settings.clone(), args).await,
        Commands::Runs { command } => runs_command(&settings, command),
    };

    if settings.otlp_endpoint.is_some() {
        shutdown_tracing();
    }

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {}", error);
            ExitCode::from(1)
        }
    }
}

async fn run_command(mut settings: Settings, args: RunArgs) -> Result<ExitCode, String> {
    if let Some(model) = args.model {
        settings.model = model;
    }

    let spec = ModelSpec::parse(&settings.model).map_err(|e| e.to_string())?;
    let model = build_model(&spec, &settings).map_err(|e| e.to_string())?;
    let registry = Arc::new(SessionRegistry::new(settings.registry_config()));
    let orchestrator =
        CycleOrchestrator::new(model.clone(), registry.clone(), settings.cycle_config());

    let request = CycleRequest {
        task: args.task,
        document: args.document,
        run: RunConfig {
            session_id: args.session_id,
            thread_id: args.thread_id,
            user_id: args.user_id,
            workspace_name: args.workspace_name,
        },
        max_steps: args.max_steps,
    };

    let mut run = orchestrator.start(&request).map_err(|e| e.to_string())?;
    eprintln!(
        "run {}  session {}  model {}",
        run.run_id,
        run.session_key,
        model.name()
    );
    eprintln!("workspace {}", run.session_key.workspace.display());

    let result = orchestrator.drive(&mut run, &mut ConsoleSink).await;
    registry.shutdown().await;

    let error = result.as_ref().err().map(|e| e.to_string());
    let record = RunRecord::from_run(&run, model.name(), error);

    if let Some(reply) = run.state.final_reply() {
        println!("\n{}", reply.trim());
    }

    if !args.no_save {
        let store = RunStore::new(&settings.runs_dir).map_err(|e| e.to_string())?;
        let path = store.save(&record).map_err(|e| e.to_string())?;
        eprintln!("saved {}", path.display());
    }

    if args.write_report {
        let path = run
            .session_key
            .workspace
            .join("reports")
            .join(format!("report-{}.md", run.run_id));
        std::fs::write(&path, record.report_markdown()).map_err(|e| e.to_string())?;
        eprintln!("report {}", path.display());
    }

    if args.print_metrics {
        let text = codeact::metrics::render().map_err(|e| e.to_string())?;
        println!("\n{}", text);
    }

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            eprintln!("run failed: {}", e);
            Ok(ExitCode::from(2))
        }
    }
}

fn runs_command(settings: &Settings, command: RunsCommand) -> Result<ExitCode, String> {
    let store = RunStore::new(&settings.runs_dir).map_err(|e| e.to_string())?;

    match command {
        RunsCommand::List => {
            let runs = store.list().map_err(|e| e.to_string())?;
            if runs.is_empty() {
                println!("No saved runs in {}", store.base_dir().display());
            }
            for run in runs {
                println!(
                    "{}  {}  {:>2} steps  {:<10}  {}",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.steps,
                    if run.complete { "complete" } else { "incomplete" },
                    run.task
                );
            }
        }
        RunsCommand::Show { id } => {
            let record = store.load(&id).map_err(|e| format!("{}: {}", id, e))?;
            print_record(&record);
        }
        RunsCommand::Delete { id } => {
            store.delete(&id).map_err(|e| format!("{}: {}", id, e))?;
            println!("Deleted {}", id);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn print_record(record: &RunRecord) {
    println!("Run:       {}", record.id);
    println!("Task:      {}", record.task);
    println!("Model:     {}", record.model);
    println!("Workspace: {}", record.workspace.display());
    println!("Steps:     {}", record.steps);
    match &record.error {
        Some(error) => println!("Status:    failed ({})", error),
        None => println!("Status:    complete"),
    }

    for turn in &record.transcript {
        let label = match turn.role {
            Role::Human => "HUMAN",
            Role::Agent => "AGENT",
            Role::Observation => "OBSERVATION",
        };
        println!("\n── {} ──\n{}", label, turn.content.trim_end());
    }

    if !record.bindings.is_empty() {
        println!("\nBindings from the last execution:");
        for (name, value) in record.bindings.iter() {
            println!("  {} ({})", name, value.type_name());
        }
    }
}
