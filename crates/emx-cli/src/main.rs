use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use emx_core::{Design, Experiment, ExperimentStore, JsonStore, ParamValue, RunSelection, Scope};
use emx_runner::{
    CoreModel, ExecutionContext, ModelConfig, Progress, Scheduler, WorkspaceManager,
};

#[derive(Parser)]
#[command(name = "emx", version, about = "Experiment pipeline for file-based simulation models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a design end to end and record every run in the store.
    Run {
        /// Model configuration YAML.
        config: PathBuf,
        #[arg(long, default_value = "store")]
        store: PathBuf,
        /// Design name within the store.
        #[arg(long)]
        design: String,
        /// Create the design from this YAML file before running it.
        #[arg(long)]
        design_file: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Workspace staging root; defaults to <store>/staging.
        #[arg(long)]
        staging: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Run the single all-defaults reference experiment.
    Reference {
        config: PathBuf,
        #[arg(long, default_value = "store")]
        store: PathBuf,
        #[arg(long)]
        staging: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Bind parameters into a fresh workspace without running the model,
    /// to inspect what setup would produce.
    Setup {
        config: PathBuf,
        #[arg(long, default_value = "staging")]
        staging: PathBuf,
        /// Parameter overrides as Name=value; omitted names take defaults.
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show recorded experiments and runs for a design.
    Show {
        #[arg(long, default_value = "store")]
        store: PathBuf,
        #[arg(long)]
        scope: String,
        #[arg(long)]
        design: String,
        /// Every recorded run per experiment, not just the latest.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            store,
            design,
            design_file,
            workers,
            staging,
            json,
        } => {
            let (config, scope) = load_model(&config)?;
            let store = JsonStore::open(&store).context("opening store")?;
            if let Some(file) = &design_file {
                let parsed = Design::from_yaml_file(file, &scope)
                    .with_context(|| format!("loading design file {}", file.display()))?;
                if parsed.name != design {
                    anyhow::bail!(
                        "design file is named '{}' but --design is '{}'",
                        parsed.name,
                        design
                    );
                }
                store.create_design(&scope, &parsed.name, &parsed.experiments)?;
            }
            let design = store.read_design(&scope.name, &design)?;
            let staging = staging.unwrap_or_else(|| store.root().join("staging"));
            let report = run_design(&config, &scope, &store, &design, workers, &staging)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.failures.is_empty(),
                    "command": "run",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_report(&report);
            if !report.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Reference {
            config,
            store,
            staging,
            json,
        } => {
            let (config, scope) = load_model(&config)?;
            let store = JsonStore::open(&store).context("opening store")?;
            let design = match store.read_design(&scope.name, "reference") {
                Ok(design) => design,
                Err(_) => {
                    let reference = Design::reference(&scope);
                    store.create_design(&scope, &reference.name, &reference.experiments)?;
                    reference
                }
            };
            let staging = staging.unwrap_or_else(|| store.root().join("staging"));
            let report = run_design(&config, &scope, &store, &design, 1, &staging)?;
            if json {
                return Ok(Some(json!({
                    "ok": report.failures.is_empty(),
                    "command": "reference",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            print_report(&report);
            if !report.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Setup {
            config,
            staging,
            params,
            json,
        } => {
            let (config, scope) = load_model(&config)?;
            let experiment = parse_params(&params)?;
            let mut manager = WorkspaceManager::new(
                &config.model_source,
                &config.model_path,
                &staging,
                ExecutionContext::Master,
            );
            let workspace = manager.workspace()?.to_path_buf();
            let mut model = CoreModel::new(config, scope, &workspace);
            model.setup(&experiment)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "setup",
                    "workspace": workspace.display().to_string(),
                    "phase": model.phase().to_string(),
                })));
            }
            println!("workspace: {}", workspace.display());
            println!("phase: {}", model.phase());
        }
        Commands::Show {
            store,
            scope,
            design,
            all,
            json,
        } => {
            let store = JsonStore::open(&store).context("opening store")?;
            let selection = if all {
                RunSelection::All
            } else {
                RunSelection::Latest
            };
            let rows = store.read_experiments(&scope, &design, selection)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "scope": scope,
                    "design": design,
                    "experiments": serde_json::to_value(&rows)?,
                })));
            }
            for row in &rows {
                println!("experiment: {}", row.experiment_id);
                for (name, value) in &row.parameters {
                    println!("  {}: {}", name, value);
                }
                for run in &row.runs {
                    let status = match serde_json::to_value(run.status)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    println!("  run {} [{}] {}", run.run_id, status, run.recorded_at);
                    for (name, value) in &run.measures {
                        println!("    {}: {}", name, value);
                    }
                    if let Some(kind) = &run.error_kind {
                        println!("    error: {}", kind);
                    }
                }
            }
        }
    }
    Ok(None)
}

fn load_model(path: &Path) -> Result<(ModelConfig, Scope)> {
    let config = ModelConfig::from_yaml_file(path)
        .with_context(|| format!("loading model config {}", path.display()))?;
    let scope = Scope::from_yaml_file(&config.scope_file)
        .with_context(|| format!("loading scope {}", config.scope_file.display()))?;
    Ok((config, scope))
}

fn run_design(
    config: &ModelConfig,
    scope: &Scope,
    store: &JsonStore,
    design: &Design,
    workers: usize,
    staging: &Path,
) -> Result<emx_runner::DesignReport> {
    let progress = Progress::new();
    let scheduler = Scheduler::new(config, scope, store);
    let report = if workers > 1 {
        scheduler.run_concurrent(staging, design, workers, &progress)?
    } else {
        let mut manager = WorkspaceManager::new(
            &config.model_source,
            &config.model_path,
            staging,
            ExecutionContext::Master,
        );
        let workspace = manager.workspace()?.to_path_buf();
        scheduler.run_sequential(&workspace, design, &progress)?
    };
    Ok(report)
}

fn print_report(report: &emx_runner::DesignReport) {
    println!("design: {}", report.design);
    println!("completed: {}", report.completed.len());
    println!("failed: {}", report.failures.len());
    for failure in &report.failures {
        println!(
            "  {} [{}] {}",
            failure.experiment_id, failure.kind, failure.message
        );
    }
}

fn parse_params(values: &[String]) -> Result<Experiment> {
    let mut out = Experiment::new();
    for raw in values {
        let (key, val_raw) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("invalid --param '{}': expected Name=value", raw))?;
        if key.trim().is_empty() {
            anyhow::bail!("invalid --param '{}': name cannot be empty", raw);
        }
        let value = match val_raw.parse::<f64>() {
            Ok(n) => ParamValue::Number(n),
            Err(_) => ParamValue::Text(val_raw.to_string()),
        };
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Reference { json, .. }
        | Commands::Setup { json, .. }
        | Commands::Show { json, .. } => *json,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}
