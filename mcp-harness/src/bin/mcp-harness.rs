//! Command-line tool for validating a fleet of MCP targets

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pulseengine_mcp_harness::{
    CancelHandle, HarnessConfig, Report, ReportWriter, TargetRegistry, ValidationRunner,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "harness.toml";

#[derive(Parser)]
#[command(name = "mcp-harness")]
#[command(about = "Validate remote MCP tool servers and report on each")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML, or YAML by extension)
    #[arg(long, short, global = true, env = "MCP_HARNESS_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Validate every configured target and write the artifacts (default)
    Run(RunArgs),
    /// List configured targets
    Targets,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Directory receiving the artifacts
    #[arg(long, short)]
    output_dir: Option<PathBuf>,

    /// Maximum number of concurrent target passes
    #[arg(long, short)]
    workers: Option<usize>,

    /// Output format for stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Exit with an error code unless every target is healthy
    #[arg(long)]
    strict: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Some(Command::Targets) => list_targets(&config),
        Some(Command::Run(args)) => run(config, &args).await,
        None => run(config, &RunArgs::default()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let config = match path {
        Some(path) => HarnessConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            HarnessConfig::from_file(DEFAULT_CONFIG_FILE)
                .with_context(|| format!("Failed to load {}", DEFAULT_CONFIG_FILE))?
        }
        None => HarnessConfig::from_env().context("Failed to load configuration")?,
    };

    Ok(config)
}

fn list_targets(config: &HarnessConfig) -> Result<ExitCode> {
    let registry = TargetRegistry::from_config(config)?;

    if registry.is_empty() {
        println!("No targets configured");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<24} {:<14} {:<12} ENDPOINT", "NAME", "TRANSPORT", "CREDENTIAL");
    for (target, entry) in registry.iter().zip(&config.targets) {
        let credential = match (&entry.credential_env, &target.credential) {
            (None, _) => "none".to_string(),
            (Some(var), Some(_)) => format!("{} (set)", var),
            (Some(var), None) => format!("{} (unset)", var),
        };
        println!(
            "{:<24} {:<14} {:<12} {}",
            target.name,
            target.transport,
            credential,
            target.endpoint_url()
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn run(mut config: HarnessConfig, args: &RunArgs) -> Result<ExitCode> {
    if let Some(ref dir) = args.output_dir {
        config.run.output_dir = dir.clone();
    }
    if let Some(workers) = args.workers {
        config.run.workers = workers;
    }
    config.validate().context("Invalid configuration")?;

    let registry = TargetRegistry::from_config(&config)?;
    if registry.is_empty() {
        bail!("No targets configured");
    }

    let runner = ValidationRunner::new(config.run.clone())?;

    let cancel = CancelHandle::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight calls");
            interrupt.cancel();
        }
    });

    let report = runner.run_with_cancel(&registry, &cancel).await;

    let writer = ReportWriter::new(&config.run.output_dir);
    let written = writer
        .write(&report)
        .with_context(|| {
            format!(
                "Failed to write artifacts to {}",
                writer.output_dir().display()
            )
        })?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Yaml => println!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Text => print_text_report(&report, &written),
    }

    if args.strict && !report.all_healthy() {
        error!("Not every target is healthy and strict checking is enabled");
        return Ok(ExitCode::FAILURE);
    }

    info!("{}", report.summary_line());
    Ok(ExitCode::SUCCESS)
}

fn print_text_report(report: &Report, written: &[PathBuf]) {
    println!("MCP Harness Report");
    println!("==================");
    println!("Generated: {}", report.generated_at.to_rfc3339());
    println!();

    println!(
        "{:<24} {:<14} {:<20} {:>6} {:>10}",
        "NAME", "TRANSPORT", "STATUS", "TOOLS", "MS"
    );
    for row in &report.summary {
        println!(
            "{:<24} {:<14} {:<20} {:>6} {:>10}",
            row.name,
            row.transport.as_str(),
            row.status.as_str(),
            row.tool_count,
            row.duration_ms
        );
    }
    println!();

    for result in &report.results {
        for note in &result.notes {
            println!("  {}: {}", result.target, note);
        }
    }

    println!("Artifacts:");
    for path in written {
        println!("  {}", path.display());
    }
}
