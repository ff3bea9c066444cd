//! splitrun CLI - parallel test orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use splitrun::config::{self, Config};
use splitrun::discovery::{CommandDiscovery, UnitLoader, UnitSource};
use splitrun::orchestrator::{Delayer, Orchestrator, OrchestratorError, Phase, PhasedUnits};
use splitrun::provider::local::LocalLauncher;
use splitrun::statistics::{JsonFileStatistics, StatisticsBackend};
use splitrun::unit::{BoxedUnit, UnitContext, UnitFactory};

#[derive(Parser)]
#[command(name = "splitrun")]
#[command(about = "Parallel test orchestrator with continuous reruns", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "splitrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        /// Override the number of parallel processes
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the rerun count
        #[arg(long)]
        reruns: Option<usize>,

        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Discover units and show their phases without running them
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Write a starter configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            parallel,
            reruns,
            no_progress,
        } => run_tests(&cli.config, parallel, reruns, !no_progress).await,
        Commands::Collect { format } => collect_units(&cli.config, &format).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { force } => init_config(&cli.config, force),
    }
}

async fn run_tests(
    config_path: &Path,
    parallel_override: Option<usize>,
    reruns_override: Option<usize>,
    progress: bool,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    // Apply overrides
    if let Some(parallel) = parallel_override {
        config.splitrun.process_count = parallel;
    }
    if let Some(reruns) = reruns_override {
        config.splitrun.rerun_count = reruns;
    }
    config::validate(&config)?;

    info!("Loaded configuration from {}", config_path.display());

    let delayer = Delayer::new(config.splitrun.parallel_delay());
    let units = discover_units(&config, &delayer).await?;
    let statistics = statistics_backend(&config)?;
    let show_progress = progress && console::Term::stderr().is_term();

    let mut orchestrator = Orchestrator::new(config, delayer)
        .with_statistics(statistics)
        .with_progress(show_progress);

    match orchestrator.run(units).await {
        Ok(result) => {
            result.print_summary();
            std::process::exit(result.exit_code());
        }
        Err(OrchestratorError::SerialBeforeFailed {
            failed,
            report_path,
        }) => {
            eprintln!(
                "{}",
                console::style(format!(
                    "Serial before phase failed for {} unit(s), stopping the run",
                    failed
                ))
                .red()
                .bold()
            );
            if let Some(path) = report_path {
                eprintln!("Failure report: {}", path.display());
            }
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

async fn discover_units(config: &Config, delayer: &Delayer) -> Result<Vec<BoxedUnit>> {
    let launcher = LocalLauncher::default().with_working_dir(config.splitrun.working_dir.clone());
    let ctx = UnitContext::from_config(config, Arc::new(launcher))
        .context("Failed to prepare the test tool command")?;
    let factory = UnitFactory::new(Arc::new(ctx), delayer.clone());

    let discovery = CommandDiscovery::new(
        &config.tool.discover_command,
        config.splitrun.working_dir.clone(),
    );
    let files = discovery.discover().await?;
    let units = UnitLoader::new(factory, &config.units).load(&files);
    info!("Discovered {} unit(s) in {} file(s)", units.len(), files.len());
    Ok(units)
}

fn statistics_backend(config: &Config) -> Result<Option<Box<dyn StatisticsBackend>>> {
    let Some(stats) = &config.statistics else {
        return Ok(None);
    };
    let path = config::expand_path(&stats.path)?;
    info!("Using statistics file {}", path.display());
    Ok(Some(Box::new(JsonFileStatistics::new(
        path,
        &stats.project,
        &stats.environment,
    ))))
}

async fn collect_units(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let delayer = Delayer::new(config.splitrun.parallel_delay());
    let units = discover_units(&config, &delayer).await?;
    let phased = PhasedUnits::assign(units, &config.phases);

    match format {
        "json" => {
            let listing: Vec<serde_json::Value> = Phase::ALL
                .iter()
                .flat_map(|&phase| {
                    phased.get(phase).iter().map(move |unit| {
                        serde_json::json!({
                            "phase": phase.to_string(),
                            "id": unit.id(),
                            "kind": format!("{:?}", unit.kind()),
                        })
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        _ => {
            println!("Discovered {} units:", phased.len());
            for phase in Phase::ALL {
                let units = phased.get(phase);
                if units.is_empty() {
                    continue;
                }
                println!("{} ({}):", phase, units.len());
                for unit in units {
                    println!("  {} [{:?}]", unit.id(), unit.kind());
                }
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Processes: {}", config.splitrun.process_count);
            println!("  Rerun count: {}", config.splitrun.rerun_count);
            println!("  Continuous rerun: {}", config.splitrun.continuous_rerun);
            println!("  Batch mode: {:?}", config.units.batch_mode);
            println!("  Log format: {:?}", config.tool.log_format);
            let statistics = match &config.statistics {
                Some(stats) => stats.path.as_str(),
                None => "disabled",
            };
            println!("  Statistics: {}", statistics);

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_config(config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists, use --force to overwrite it",
            config_path.display()
        );
    }

    std::fs::write(config_path, config::TEMPLATE)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("Created {}", config_path.display());

    Ok(())
}
