//! planex - plan-execute runs from the command line

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use planex::{
    config::{ApiKeyResolver, ConfigManager},
    execution::{LocalToolbox, ModelContentProducer, RecoveryDecision, ToolFacility},
    llm::{LlmProviderFactory, MessageRole, ModelClient, Phase, PhaseEvent, PhaseParser},
    planning::{prompt::build_plan_prompt, Plan, PlanExecuteDriver, RunReport},
    ui::{ConsoleRenderer, FailurePolicy},
    utils::{errors::PlanexError, text::chunk_chars},
    Result,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// planex: let a language model plan and execute multi-step tool tasks
#[derive(Parser)]
#[command(name = "planex")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Plan and execute a request
    Run {
        /// The request to fulfil
        query: String,
        /// How failed steps continue
        #[arg(long, value_enum, default_value_t = OnFailure::Ask)]
        on_failure: OnFailure,
        /// Output format of the final report
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Workspace root for the file tools
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// Model override
        #[arg(short, long)]
        model: Option<String>,
        /// Hide thought and action blocks
        #[arg(long)]
        quiet: bool,
    },
    /// Print the planning prompt for a request without calling a model
    Preview {
        query: String,
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// Include execute_command in the catalog
        #[arg(long)]
        allow_commands: bool,
    },
    /// Feed a recorded model response through the phase parser
    Replay {
        file: PathBuf,
        /// Characters per simulated stream chunk
        #[arg(long, default_value_t = 16)]
        chunk_size: usize,
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },
    /// Update a configuration value, e.g. `orchestration.tool_call_timeout_secs 30`
    Set { key: String, value: String },
    /// Check configuration and provider readiness
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OnFailure {
    Ask,
    Retry,
    Skip,
    Regenerate,
    Halt,
}

impl From<OnFailure> for FailurePolicy {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::Ask => FailurePolicy::Interactive,
            OnFailure::Retry => FailurePolicy::Auto(RecoveryDecision::Retry),
            OnFailure::Skip => FailurePolicy::Auto(RecoveryDecision::Skip),
            OnFailure::Regenerate => FailurePolicy::Auto(RecoveryDecision::Regenerate),
            OnFailure::Halt => FailurePolicy::Halt,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config.clone() {
        Some(path) => path,
        None => ConfigManager::default_config_path()?,
    };
    let manager = ConfigManager::load(&config_path)?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| manager.config().logging.level.clone());
    init_logging(&level)?;
    info!("Starting planex v{}", planex::VERSION);

    match cli.command {
        Commands::Run {
            query,
            on_failure,
            format,
            workdir,
            model,
            quiet,
        } => run_query(manager, query, on_failure.into(), format, workdir, model, quiet).await,
        Commands::Preview {
            query,
            workdir,
            allow_commands,
        } => preview(&manager, &query, workdir, allow_commands),
        Commands::Replay {
            file,
            chunk_size,
            format,
        } => replay(&manager, &file, chunk_size, format),
        Commands::Init { force } => init_config(manager, force),
        Commands::Set { key, value } => set_value(manager, &key, &value),
        Commands::Status => show_status(&manager),
    }
}

/// Initialize logging
fn init_logging(log_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(log_level).map_err(|e| PlanexError::unknown(format!("Invalid log level: {}", e)))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| PlanexError::unknown(format!("Failed to set logger: {}", e)))?;

    Ok(())
}

fn toolbox_for(manager: &ConfigManager, workdir: Option<PathBuf>, allow_commands: bool) -> LocalToolbox {
    let workspace = &manager.config().workspace;
    let root = workdir.unwrap_or_else(|| workspace.root_dir());
    LocalToolbox::new(root, allow_commands || workspace.allow_commands)
}

async fn run_query(
    manager: ConfigManager,
    query: String,
    policy: FailurePolicy,
    format: OutputFormat,
    workdir: Option<PathBuf>,
    model_override: Option<String>,
    quiet: bool,
) -> Result<()> {
    let mut config = manager.config().clone();
    if let Some(model) = model_override {
        config.active_model = model;
    }
    config.validate()?;

    let provider = config.active_provider.clone();
    let mut settings = HashMap::new();
    if let Some(api_key) = config.api_key_for(&provider) {
        settings.insert("api_key".to_string(), api_key);
    }
    if let Some(base_url) = config.get_active_provider_config().and_then(|p| p.base_url.clone()) {
        settings.insert("base_url".to_string(), base_url);
    }
    let model: Arc<dyn ModelClient> =
        Arc::from(LlmProviderFactory::create_client(&provider, &config.effective_model(), settings)?);
    debug!("Using provider {} with model {}", model.name(), config.effective_model());

    let tools = Arc::new(toolbox_for(&manager, workdir, false));
    let producer = Arc::new(ModelContentProducer::new(model.clone(), query.clone()));

    let (events, receiver) = mpsc::unbounded_channel();
    let mut driver = PlanExecuteDriver::new(model, tools, config.orchestration.clone(), events)
        .with_content_producer(producer);

    let abort = driver.abort_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.cancel();
        }
    });

    // Events go to stdout for text output and to stderr when stdout carries the report
    let renderer = if format == OutputFormat::Text {
        tokio::spawn(async move {
            ConsoleRenderer::new(std::io::stdout(), policy)
                .with_phases(!quiet)
                .run(receiver)
                .await
                .map(|_| ())
        })
    } else {
        tokio::spawn(async move {
            ConsoleRenderer::new(std::io::stderr(), policy)
                .with_phases(!quiet)
                .run(receiver)
                .await
                .map(|_| ())
        })
    };

    let report = driver.run(&query).await;
    drop(driver);
    renderer
        .await
        .map_err(|e| PlanexError::ui(format!("Renderer task failed: {}", e)))??;

    print_report(&report, format)?;
    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(report)?),
        OutputFormat::Text => {
            let succeeded = report.results.iter().filter(|r| r.success).count();
            let line = format!(
                "{} | {} steps, {} succeeded | run {}",
                report.state,
                report.results.len(),
                succeeded,
                report.run_id
            );
            println!();
            if report.succeeded() {
                println!("{}", line.bright_green());
            } else {
                println!("{}", line.bright_red());
            }
        }
    }
    Ok(())
}

fn preview(manager: &ConfigManager, query: &str, workdir: Option<PathBuf>, allow_commands: bool) -> Result<()> {
    let tools = toolbox_for(manager, workdir, allow_commands);
    let messages = build_plan_prompt(query, &tools.describe_tools())?;

    for message in messages {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        println!("{}", format!("=== {} ===", role).bright_cyan().bold());
        println!("{}\n", message.content);
    }
    Ok(())
}

fn replay(manager: &ConfigManager, file: &Path, chunk_size: usize, format: OutputFormat) -> Result<()> {
    let transcript = std::fs::read_to_string(file).map_err(|e| PlanexError::file_system(file, e))?;
    let mut parser = PhaseParser::new(manager.config().orchestration.action_tick_threshold);

    let mut events = Vec::new();
    for chunk in chunk_chars(&transcript, chunk_size.max(1)) {
        events.extend(parser.push(&chunk));
    }
    events.extend(parser.finish());

    match format {
        OutputFormat::Json => {
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
        }
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&events)?),
        OutputFormat::Text => {
            for event in &events {
                match event {
                    PhaseEvent::Phase { phase, content } => {
                        println!("{} {}", format!("[{}]", phase).bright_blue().bold(), content.trim());
                        if *phase == Phase::Plan {
                            match Plan::from_phase_content(content) {
                                Ok(plan) => {
                                    let tools: Vec<&str> = plan.steps.iter().map(|s| s.tool.as_str()).collect();
                                    println!("  {} steps: {}", plan.len(), tools.join(", "));
                                }
                                Err(e) => println!("  {}", format!("invalid plan: {}", e).red()),
                            }
                        }
                    }
                    PhaseEvent::FinalAnswerDelta { .. } => {}
                    PhaseEvent::FinalAnswerComplete { text } => {
                        println!("{} {}", "[final_answer]".bright_green().bold(), text);
                    }
                }
            }
        }
    }
    Ok(())
}

fn init_config(mut manager: ConfigManager, force: bool) -> Result<()> {
    if manager.path().exists() && !force {
        println!("Configuration already exists at {}", manager.path().display());
        println!("Use --force to overwrite it");
        return Ok(());
    }

    *manager.config_mut() = Default::default();
    manager.save()?;

    println!("{} {}", "Wrote configuration to".bright_green(), manager.path().display());
    println!();
    println!("Next steps:");
    println!(
        "   1. Export {} (or set providers.openrouter.api_key)",
        ApiKeyResolver::env_key_name(&manager.config().active_provider)
    );
    println!("   2. planex status");
    println!("   3. planex run \"<request>\"");
    Ok(())
}

fn set_value(mut manager: ConfigManager, key: &str, value: &str) -> Result<()> {
    manager.set(key, value)?;
    manager.save()?;
    println!("{} = {}", key, value);
    Ok(())
}

fn show_status(manager: &ConfigManager) -> Result<()> {
    let config = manager.config();
    let exists = if manager.path().exists() { "" } else { " (not created, using defaults)" };

    println!("{}", "planex status".bright_cyan().bold());
    println!("  config:   {}{}", manager.path().display(), exists);
    println!("  provider: {}", config.active_provider);
    println!("  model:    {}", config.effective_model());
    println!("  workspace: {}", config.workspace.root_dir().display());
    println!(
        "  commands: {}",
        if config.workspace.allow_commands { "enabled" } else { "disabled" }
    );

    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    println!("  providers:");
    for name in names {
        let readiness = if config.is_provider_ready(name) {
            "ready".green()
        } else {
            format!("missing key ({})", ApiKeyResolver::env_key_name(name)).yellow()
        };
        println!("    {}: {}", name, readiness);
    }

    match config.validate() {
        Ok(()) => println!("  {}", "configuration is valid".green()),
        Err(e) => println!("  {}", format!("configuration problem: {}", e).yellow()),
    }
    Ok(())
}
