//! Cadence scheduler server entrypoint.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

mod commands;
mod config;
mod logging;
mod server;

use commands::Commands;
use config::ServerConfig;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about = "Cadence job scheduler", long_about = None)]
struct Cli {
    /// Server configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init_tracing(cli.json_logs);

    let config = ServerConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Validate { show } => validate(&config, show),
        Commands::Describe {
            pipeline,
            pipelines,
        } => describe(&config, &pipeline, pipelines.as_deref()),
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let cruise = config.cruise_config()?;
    for problem in server::configuration_problems(&cruise) {
        warn!(problem = %problem, "Configuration problem");
    }
    info!(
        pipelines = cruise.pipelines.len(),
        environments = cruise.environments.len(),
        "Loaded pipeline configuration"
    );

    let scheduler = Arc::new(server::build_scheduler(&config, cruise));
    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let timers = scheduler.spawn_timers(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("All scheduler loops already stopped");
    }
    timers.join().await;
    info!("Cadence stopped");
    Ok(())
}

fn validate(config: &ServerConfig, show: bool) -> Result<()> {
    let cruise = config.cruise_config()?;
    if show {
        println!("{}", serde_json::to_string_pretty(&config.scheduler)?);
    }
    let problems = server::configuration_problems(&cruise);
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        bail!("{} configuration problem(s) found", problems.len());
    }
    println!(
        "Configuration OK: {} pipeline(s), {} environment(s), {} elastic profile(s)",
        cruise.pipelines.len(),
        cruise.environments.len(),
        cruise.elastic_profiles.len()
    );
    Ok(())
}

fn describe(config: &ServerConfig, pipeline: &str, pipelines: Option<&Path>) -> Result<()> {
    let cruise = match pipelines {
        Some(path) => config::load_cruise_config(path)?,
        None => config.cruise_config()?,
    };
    let pipeline = cruise.pipeline_or_err(pipeline)?;

    println!("{} (group {})", pipeline.name, pipeline.group);
    if let Some(environment) = cruise.environment_for_pipeline(&pipeline.name) {
        println!("  environment: {}", environment.name);
    }
    for stage in &pipeline.stages {
        let approval = if stage.requires_approval() { "manual" } else { "success" };
        println!("  stage {} [{approval}]", stage.name);
        for job in &stage.jobs {
            let resources: Vec<&str> = job.resources.iter().map(String::as_str).collect();
            match &job.elastic_profile_id {
                Some(profile) => println!("    job {} (elastic profile {profile})", job.name),
                None if resources.is_empty() => println!("    job {}", job.name),
                None => println!("    job {} (resources {})", job.name, resources.join(", ")),
            }
        }
    }
    Ok(())
}
