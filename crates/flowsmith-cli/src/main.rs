//! flowsmith CLI - natural-language workflow synthesis
//!
//! Usage:
//!   flowsmith init                     Write a default .flowsmith/config.toml
//!   flowsmith generate <prompt>        Generate a workflow document
//!   flowsmith fix <file>               Repair a document
//!   flowsmith loop <prompt>            Run the autonomous tool-calling loop
//!   flowsmith create <prompt>          Multi-agent synthesis (coordinator/coder/reviewer)
//!   flowsmith coordinate <prompt>      Plan, then write and review each step in turn
//!   flowsmith regen <file> <index>     Regenerate one step
//!   flowsmith simulate <file>          Dry-run summary of a document
//!   flowsmith risk <file>              Normalize and risk-scan a document
//!   flowsmith migrate <script>         Wrap a shell script as a one-step document
//!   flowsmith report <input>           Effectiveness report from telemetry

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flowsmith_agent::{CommandRunner, HttpChatClient};
use flowsmith_core::{Event, EventSink, FlowConfig, ValidationEnv};
use flowsmith_metrics::{generate_report, ReportInput, SessionTelemetry, TelemetryLog};
use flowsmith_orchestrator::{
    LoopProfile, MultiCheckpoint, Pipeline, RunError, RunOptions, SynthesisState,
};
use flowsmith_validation::{convert_script_to_yaml, simulate, Normalizer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_DIR: &str = ".flowsmith";
const TELEMETRY_FILE: &str = "telemetry.jsonl";
const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Parser)]
#[command(name = "flowsmith")]
#[command(author, version, about = "Natural-language workflow synthesis and validation")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root holding .flowsmith/
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Print progress events as JSON lines on stderr
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the synthesis commands
#[derive(clap::Args, Debug, Default)]
struct SynthArgs {
    /// Extra context for the model
    #[arg(long, default_value = "")]
    context: String,

    /// Base document whose header, inventory and plan are kept
    #[arg(long, value_name = "FILE")]
    base: Option<PathBuf>,

    /// Validation environment name (enables the runner)
    #[arg(long)]
    env: Option<String>,

    /// Never execute, even with a runner and environment
    #[arg(long)]
    skip_execute: bool,

    /// Write the document here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Generate a workflow document from a request
    Generate {
        prompt: String,

        /// Fix attempts after the first draft
        #[arg(long)]
        max_retries: Option<usize>,

        #[command(flatten)]
        synth: SynthArgs,
    },

    /// Repair a document given its issues
    Fix {
        file: PathBuf,

        /// Known issue (repeatable); the normalizer's issues are used when absent
        #[arg(long = "issue")]
        issues: Vec<String>,

        #[arg(long)]
        max_retries: Option<usize>,

        #[command(flatten)]
        synth: SynthArgs,
    },

    /// Run the autonomous tool-calling loop
    Loop {
        prompt: String,

        #[arg(long, value_enum, default_value = "default")]
        profile: CliProfile,

        #[arg(short = 'n', long)]
        max_iterations: Option<usize>,

        /// Completion check (repeatable)
        #[arg(long = "check")]
        checks: Vec<String>,

        /// Text a final answer must contain
        #[arg(long, default_value = "")]
        completion_token: String,

        /// Session key for loop memory
        #[arg(long, default_value = "")]
        session: String,

        #[arg(long, default_value = "0")]
        max_tool_calls: usize,

        /// Iterations plus tool calls
        #[arg(long, default_value = "0")]
        max_budget_units: usize,

        /// Per-iteration timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Run the plain pipeline if the loop fails
        #[arg(long)]
        fallback: bool,

        /// Task class recorded in telemetry
        #[arg(long, default_value = "")]
        task_class: String,

        #[command(flatten)]
        synth: SynthArgs,
    },

    /// Multi-agent synthesis over a draft
    Create {
        /// Request (may be empty when resuming)
        #[arg(default_value = "")]
        prompt: String,

        #[arg(long, default_value = "")]
        draft: String,

        /// Stop after this plan step and leave a checkpoint
        #[arg(long, default_value = "")]
        pause_after: String,

        /// Checkpoint id to write when pausing
        #[arg(long, default_value = "")]
        checkpoint: String,

        /// Checkpoint id to resume from
        #[arg(long, default_value = "")]
        resume: String,

        #[command(flatten)]
        synth: SynthArgs,
    },

    /// Plan the request, then write and review each step in a short sub-loop
    Coordinate {
        prompt: String,

        #[command(flatten)]
        synth: SynthArgs,
    },

    /// Regenerate one step of a document
    Regen {
        file: PathBuf,

        /// Zero-based step index
        index: usize,

        /// What the new step should do differently
        #[arg(long, default_value = "")]
        intent: String,

        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Dry-run summary of a document
    Simulate { file: PathBuf },

    /// Normalize a document and report issues and risk
    Risk { file: PathBuf },

    /// Wrap a shell script as a one-step document
    Migrate {
        script: PathBuf,

        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Effectiveness report from baseline and treatment telemetry
    Report {
        /// Report input as JSON
        input: PathBuf,

        /// Read baseline sessions from this telemetry log instead
        #[arg(long, value_name = "FILE")]
        baseline_log: Option<PathBuf>,

        /// Read treatment sessions from this telemetry log instead
        #[arg(long, value_name = "FILE")]
        treatment_log: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProfile {
    Default,
    Ralph,
}

impl From<CliProfile> for LoopProfile {
    fn from(p: CliProfile) -> Self {
        match p {
            CliProfile::Default => LoopProfile::Default,
            CliProfile::Ralph => LoopProfile::Ralph,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let app = App::new(&cli, cancel)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.root, force),
        Commands::Generate {
            prompt,
            max_retries,
            synth,
        } => cmd_generate(&app, &prompt, max_retries, &synth).await,
        Commands::Fix {
            file,
            issues,
            max_retries,
            synth,
        } => cmd_fix(&app, &file, issues, max_retries, &synth).await,
        Commands::Loop {
            prompt,
            profile,
            max_iterations,
            checks,
            completion_token,
            session,
            max_tool_calls,
            max_budget_units,
            timeout_secs,
            fallback,
            task_class,
            synth,
        } => {
            let mut opts = app
                .run_options(&synth)?
                .with_profile(profile.into())
                .with_completion_checks(checks)
                .with_completion_token(completion_token)
                .with_session_key(session)
                .with_max_tool_calls(max_tool_calls)
                .with_max_budget_units(max_budget_units);
            if let Some(n) = max_iterations {
                opts = opts.with_max_iterations(n);
            }
            if let Some(secs) = timeout_secs {
                opts = opts.with_per_iteration_timeout(Duration::from_secs(secs));
            }
            if fallback {
                opts = opts.with_fallback_to_pipeline();
            }
            if let Some(root) = app.memory_root() {
                opts = opts.with_memory_root(root);
            }
            cmd_loop(&app, &prompt, &opts, &task_class, synth.output.as_deref()).await
        }
        Commands::Create {
            prompt,
            draft,
            pause_after,
            checkpoint,
            resume,
            synth,
        } => {
            let opts = app
                .run_options(&synth)?
                .with_draft_id(draft)
                .with_pause_after_step(pause_after)
                .with_checkpoint_id(checkpoint)
                .with_resume_checkpoint_id(resume);
            cmd_create(&app, &prompt, &opts, synth.output.as_deref()).await
        }
        Commands::Coordinate { prompt, synth } => {
            let opts = app.run_options(&synth)?;
            cmd_coordinate(&app, &prompt, &opts, synth.output.as_deref()).await
        }
        Commands::Regen {
            file,
            index,
            intent,
            output,
        } => cmd_regen(&app, &file, index, &intent, output.as_deref()).await,
        Commands::Simulate { file } => cmd_simulate(&file),
        Commands::Risk { file } => cmd_risk(&file),
        Commands::Migrate { script, output } => cmd_migrate(&script, output.as_deref()),
        Commands::Report {
            input,
            baseline_log,
            treatment_log,
        } => cmd_report(&input, baseline_log, treatment_log).await,
    }
}

/// Everything a command needs from the environment
struct App {
    root: PathBuf,
    config: FlowConfig,
    cancel: CancellationToken,
    events: bool,
}

impl App {
    fn new(cli: &Cli, cancel: CancellationToken) -> Result<Self> {
        let config = FlowConfig::load_or_default(&cli.root)
            .with_context(|| format!("Failed to load config under {:?}", cli.root))?;
        Ok(Self {
            root: cli.root.clone(),
            config,
            cancel,
            events: cli.events,
        })
    }

    fn config_dir(&self) -> PathBuf {
        self.root.join(CONFIG_DIR)
    }

    /// Configured memory root, relative paths resolved against the project root
    fn memory_root(&self) -> Option<PathBuf> {
        let root = self.config.memory.root.as_deref()?.trim();
        if root.is_empty() {
            return None;
        }
        Some(resolve(&self.root, Path::new(root)))
    }

    /// A pipeline with the HTTP chat backend and, if configured, the command runner
    fn pipeline(&self) -> Result<Pipeline> {
        let client = HttpChatClient::from_config(&self.config.chat).with_context(|| {
            format!(
                "Chat backend needs an API key in ${}",
                self.config.chat.api_key_env
            )
        })?;
        let mut pipeline = Pipeline::new(self.config.clone())?.with_client(Arc::new(client));

        if let Some(command) = self.config.runner.command.as_deref() {
            let runner = CommandRunner::from_command_line(command)
                .context("Invalid runner command")?
                .with_scratch_dir(self.config_dir().join("scratch"));
            pipeline = pipeline.with_runner(Arc::new(runner));
        }
        Ok(pipeline)
    }

    fn run_options(&self, synth: &SynthArgs) -> Result<RunOptions> {
        let mut opts = RunOptions::new()
            .with_context(synth.context.clone())
            .with_cancel(self.cancel.clone());
        if let Some(base) = &synth.base {
            opts = opts.with_base_yaml(read_text(base)?);
        }
        if let Some(env) = &synth.env {
            opts = opts.with_env(ValidationEnv::new(env.clone()));
        }
        if synth.skip_execute {
            opts = opts.skip_execution();
        }
        if self.events {
            opts = opts.with_event_sink(stderr_sink());
        }
        Ok(opts)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
}

fn stderr_sink() -> EventSink {
    Arc::new(|event: Event| {
        if let Ok(line) = serde_json::to_string(&event) {
            eprintln!("{}", line);
        }
    })
}

fn write_document(yaml: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", yaml.trim_end()))
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Wrote {:?}", path);
        }
        None => println!("{}", yaml.trim_end()),
    }
    Ok(())
}

fn print_state(state: &SynthesisState) {
    eprintln!("Summary: {}", state.summary);
    eprintln!("  Risk: {}", state.risk_level);
    if !state.risk_notes.is_empty() {
        eprintln!("  Risk notes: {}", state.risk_notes.join(", "));
    }
    eprintln!("  Retries: {}", state.retry_count);
    eprintln!(
        "  Execution: {}",
        if state.execution_skipped { "skipped" } else { "ran" }
    );
    eprintln!("  Needs review: {}", state.needs_review);
    for issue in &state.issues {
        eprintln!("  Issue: {}", issue);
    }
    for question in &state.questions {
        eprintln!("  Question: {}", question);
    }
}

/// Print what a failed run got to, then surface the error
fn fail(err: RunError) -> anyhow::Error {
    if !err.state.yaml.is_empty() {
        eprintln!("Last document:\n{}", err.state.yaml.trim_end());
    }
    print_state(&err.state);
    anyhow::Error::new(err)
}

fn cmd_init(root: &Path, force: bool) -> Result<()> {
    let config_path = root.join(CONFIG_DIR).join("config.toml");
    if config_path.exists() && !force {
        println!("Config already exists at {:?} (use --force to overwrite)", config_path);
        return Ok(());
    }

    FlowConfig::write_default(root).context("Failed to write default config")?;
    std::fs::create_dir_all(root.join(CONFIG_DIR).join("memory"))?;
    std::fs::create_dir_all(root.join(CONFIG_DIR).join(CHECKPOINT_DIR))?;

    println!("Initialized flowsmith in {:?}", root);
    println!("Created:");
    println!("  {}/config.toml", CONFIG_DIR);
    println!("  {}/memory/", CONFIG_DIR);
    println!("  {}/{}/", CONFIG_DIR, CHECKPOINT_DIR);
    Ok(())
}

async fn cmd_generate(
    app: &App,
    prompt: &str,
    max_retries: Option<usize>,
    synth: &SynthArgs,
) -> Result<()> {
    let mut opts = app.run_options(synth)?;
    if let Some(n) = max_retries {
        opts = opts.with_max_retries(n);
    }
    info!("Generating workflow");
    let state = app
        .pipeline()?
        .run_generate(prompt, &opts)
        .await
        .map_err(fail)?;
    write_document(&state.yaml, synth.output.as_deref())?;
    print_state(&state);
    Ok(())
}

async fn cmd_fix(
    app: &App,
    file: &Path,
    issues: Vec<String>,
    max_retries: Option<usize>,
    synth: &SynthArgs,
) -> Result<()> {
    let yaml = read_text(file)?;
    let issues = if issues.is_empty() {
        Normalizer::default().normalize(&yaml).issues
    } else {
        issues
    };
    if issues.is_empty() {
        println!("No issues found in {:?}", file);
        return Ok(());
    }

    let mut opts = app.run_options(synth)?;
    if let Some(n) = max_retries {
        opts = opts.with_max_retries(n);
    }
    info!("Fixing {:?} ({} issues)", file, issues.len());
    let state = app
        .pipeline()?
        .run_fix(&yaml, &issues, &opts)
        .await
        .map_err(fail)?;
    write_document(&state.yaml, synth.output.as_deref())?;
    print_state(&state);
    Ok(())
}

async fn cmd_loop(
    app: &App,
    prompt: &str,
    opts: &RunOptions,
    task_class: &str,
    output: Option<&Path>,
) -> Result<()> {
    info!("Starting {} loop", opts.profile);
    let result = app.pipeline()?.run_loop(prompt, opts).await;

    let metrics = match &result {
        Ok(state) => state.loop_metrics.clone(),
        Err(err) => err.state.loop_metrics.clone(),
    };
    if let Some(metrics) = metrics {
        eprintln!("Loop {}:", metrics.loop_id);
        eprintln!("  Iterations: {}", metrics.iterations);
        eprintln!(
            "  Tool calls: {} ({} failed)",
            metrics.tool_calls, metrics.tool_failures
        );
        eprintln!("  Stop reason: {}", metrics.terminal);

        let log = TelemetryLog::new(app.config_dir().join(TELEMETRY_FILE));
        let entry = SessionTelemetry::from_loop_metrics(&metrics, task_class);
        if let Err(e) = log.append(&entry).await {
            warn!("Failed to record telemetry: {}", e);
        }
    }

    let state = result.map_err(fail)?;
    write_document(&state.yaml, output)?;
    print_state(&state);
    Ok(())
}

fn checkpoint_path(app: &App, checkpoint_id: &str) -> PathBuf {
    app.config_dir()
        .join(CHECKPOINT_DIR)
        .join(format!("{}.json", checkpoint_id))
}

async fn cmd_create(
    app: &App,
    prompt: &str,
    opts: &RunOptions,
    output: Option<&Path>,
) -> Result<()> {
    let pipeline = app.pipeline()?;

    // Checkpoints live in memory; carry them across invocations on disk
    let resume_id = opts.resume_checkpoint_id.trim();
    if !resume_id.is_empty() {
        let path = checkpoint_path(app, resume_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("No checkpoint at {:?}", path))?;
        pipeline.checkpoints().set(resume_id, &bytes);
    }

    let state = pipeline
        .run_multi_create(prompt, opts)
        .await
        .map_err(fail)?;

    if state.paused {
        let checkpoint_id = match opts.checkpoint_id.trim() {
            "" => state.draft_id.as_str(),
            id => id,
        };
        let bytes = pipeline
            .checkpoints()
            .get(checkpoint_id)
            .ok_or_else(|| anyhow::anyhow!("Checkpoint {} was not recorded", checkpoint_id))?;
        let checkpoint: MultiCheckpoint = serde_json::from_slice(&bytes)?;

        let path = checkpoint_path(app, checkpoint_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        println!(
            "Paused before step {} of {}; resume with --resume {}",
            checkpoint.next_index + 1,
            checkpoint.draft.plan.len(),
            checkpoint_id
        );
    }

    println!("Plan ({} steps):", state.plan.len());
    for step in &state.plan {
        println!("  [{}] {} {}", step.status, step.id, step.step_name);
    }
    if !state.yaml.is_empty() {
        write_document(&state.yaml, output)?;
    }
    print_state(&state);
    Ok(())
}

async fn cmd_coordinate(
    app: &App,
    prompt: &str,
    opts: &RunOptions,
    output: Option<&Path>,
) -> Result<()> {
    info!("Running coordinator loop");
    let state = app
        .pipeline()?
        .run_coordinator_loop(prompt, opts)
        .await
        .map_err(fail)?;

    println!("Plan ({} steps):", state.plan.len());
    for step in &state.plan {
        println!("  [{}] {} {}", step.status, step.id, step.step_name);
    }
    write_document(&state.yaml, output)?;
    print_state(&state);
    Ok(())
}

async fn cmd_regen(
    app: &App,
    file: &Path,
    index: usize,
    intent: &str,
    output: Option<&Path>,
) -> Result<()> {
    let yaml = read_text(file)?;
    let opts = app.run_options(&SynthArgs::default())?;
    let outcome = app
        .pipeline()?
        .regenerate_step(&yaml, index, intent, &opts)
        .await
        .with_context(|| format!("Failed to regenerate step {}", index))?;

    write_document(&outcome.yaml, output)?;
    eprintln!("Regenerated step {}: {}", index, outcome.step.name);
    for issue in &outcome.issues {
        eprintln!("  Issue: {}", issue);
    }
    for question in &outcome.questions {
        eprintln!("  Question: {}", question);
    }
    Ok(())
}

fn cmd_simulate(file: &Path) -> Result<()> {
    let result = simulate(&read_text(file)?).context("Simulation failed")?;
    println!("{}", result.summary);
    println!("Hosts: {}", result.hosts.join(", "));
    for step in &result.steps {
        if step.targets.is_empty() {
            println!("  {}. {} ({})", step.index + 1, step.name, step.action);
        } else {
            println!(
                "  {}. {} ({}) -> {}",
                step.index + 1,
                step.name,
                step.action,
                step.targets.join(", ")
            );
        }
    }
    Ok(())
}

fn cmd_risk(file: &Path) -> Result<()> {
    let outcome = Normalizer::default().normalize(&read_text(file)?);
    println!("Risk: {}", outcome.risk.level);
    for note in &outcome.risk.notes {
        println!("  Note: {}", note);
    }
    if outcome.issues.is_empty() {
        println!("No issues");
    } else {
        println!("Issues ({}):", outcome.issues.len());
        for issue in &outcome.issues {
            println!("  {}", issue);
        }
    }
    for notice in &outcome.notices {
        println!("  Notice: {}", notice);
    }
    Ok(())
}

fn cmd_migrate(script: &Path, output: Option<&Path>) -> Result<()> {
    let yaml = convert_script_to_yaml(&read_text(script)?)
        .with_context(|| format!("Failed to migrate {:?}", script))?;
    write_document(&yaml, output)
}

async fn cmd_report(
    input: &Path,
    baseline_log: Option<PathBuf>,
    treatment_log: Option<PathBuf>,
) -> Result<()> {
    let mut report_input: ReportInput =
        serde_json::from_str(&read_text(input)?).context("Failed to parse report input")?;
    if let Some(path) = baseline_log {
        report_input.baseline = TelemetryLog::new(path).load_all().await?;
    }
    if let Some(path) = treatment_log {
        report_input.treatment = TelemetryLog::new(path).load_all().await?;
    }

    let report = generate_report(&report_input)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.release_decision.pass {
        warn!("Release gate not met");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loop_flags() {
        let cli = Cli::try_parse_from([
            "flowsmith",
            "loop",
            "install nginx",
            "--profile",
            "ralph",
            "--check",
            "has_steps",
            "--check",
            "no_high_risk",
            "--env",
            "sandbox",
        ])
        .unwrap();
        match cli.command {
            Commands::Loop {
                prompt,
                profile,
                checks,
                synth,
                ..
            } => {
                assert_eq!(prompt, "install nginx");
                assert_eq!(LoopProfile::from(profile), LoopProfile::Ralph);
                assert_eq!(checks, vec!["has_steps", "no_high_risk"]);
                assert_eq!(synth.env.as_deref(), Some("sandbox"));
            }
            _ => panic!("expected loop command"),
        }
    }

    #[test]
    fn test_create_resume_without_prompt() {
        let cli = Cli::try_parse_from(["flowsmith", "create", "--resume", "cp-1"]).unwrap();
        match cli.command {
            Commands::Create { prompt, resume, .. } => {
                assert!(prompt.is_empty());
                assert_eq!(resume, "cp-1");
            }
            _ => panic!("expected create command"),
        }
    }

    #[test]
    fn test_migrate_writes_document() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("deploy.sh");
        let output = dir.path().join("deploy.yaml");
        std::fs::write(&script, "systemctl restart nginx\n").unwrap();

        cmd_migrate(&script, Some(&output)).unwrap();
        let wf = flowsmith_core::Workflow::load(&read_text(&output).unwrap()).unwrap();
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].with["cmd"], serde_json::json!("systemctl restart nginx"));

        std::fs::write(&script, "\n").unwrap();
        assert!(cmd_migrate(&script, None).is_err());
    }

    #[test]
    fn test_parse_coordinate() {
        let cli = Cli::try_parse_from(["flowsmith", "coordinate", "install nginx", "--skip-execute"])
            .unwrap();
        match cli.command {
            Commands::Coordinate { prompt, synth } => {
                assert_eq!(prompt, "install nginx");
                assert!(synth.skip_execute);
            }
            _ => panic!("expected coordinate command"),
        }
    }

    #[test]
    fn test_memory_root_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = App {
            root: dir.path().to_path_buf(),
            config: FlowConfig::default(),
            cancel: CancellationToken::new(),
            events: false,
        };
        assert_eq!(app.memory_root(), None);

        app.config.memory.root = Some(".flowsmith/memory".to_string());
        assert_eq!(
            app.memory_root(),
            Some(dir.path().join(".flowsmith/memory"))
        );

        app.config.memory.root = Some("/var/lib/flowsmith".to_string());
        assert_eq!(app.memory_root(), Some(PathBuf::from("/var/lib/flowsmith")));
    }

    #[test]
    fn test_init_writes_config() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path(), false).unwrap();
        assert!(dir.path().join(".flowsmith/config.toml").exists());
        assert!(dir.path().join(".flowsmith/checkpoints").is_dir());

        let config = FlowConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.loop_defaults.max_iterations, 6);
    }
}
