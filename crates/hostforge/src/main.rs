//! hostforge CLI
//!
//! Provisions the configured components onto one host and bootstraps the
//! secret service

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use hostforge::config::Config;
use hostforge::driver::{self, DeploymentSummary};
use hostforge::{BootstrapOutcome, GeneratedValues};

#[derive(Parser)]
#[command(name = "hostforge")]
#[command(about = "Dependency-ordered host provisioning", long_about = None)]
struct Cli {
    /// Configuration file (default: HOSTFORGE_CONFIG, ./hostforge.toml, ...)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Run on this machine, placing copied files below this directory
    #[arg(long, global = true)]
    local_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply every component and bootstrap secrets
    Deploy,
    /// Show what a deployment would change without touching the host
    Plan,
    /// Print one rendered artifact
    Render {
        /// Component name
        component: String,
        /// Artifact name
        artifact: String,
    },
    /// List components in deployment order
    #[command(name = "components")]
    Components,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.deploy.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let generated = GeneratedValues::load_or_create(
        &config.deploy.state_dir().join("generated.json"),
        &config.generated,
    )?;

    match cli.command {
        Commands::Deploy => deploy(&config, &generated, cli.local_root.as_deref(), false).await?,
        Commands::Plan => deploy(&config, &generated, cli.local_root.as_deref(), true).await?,
        Commands::Render {
            component,
            artifact,
        } => {
            let bytes = driver::render_artifact(&config, &generated, &component, &artifact).await?;
            std::io::stdout().write_all(&bytes)?;
        }
        Commands::Components => {
            for name in driver::component_order(&config, &generated)? {
                println!("{name}");
            }
        }
    }

    Ok(())
}

async fn deploy(
    config: &Config,
    generated: &GeneratedValues,
    local_root: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let executor = driver::create_executor(&config.connection, local_root)?;
    let summary = driver::deploy(config, generated, executor, dry_run).await?;

    if !dry_run {
        summary.write(&config.deploy.report_file).await?;
    }
    print_summary(&summary);

    if !summary.is_success() {
        summary.report.clone().into_result()?;
        eyre::bail!("secret bootstrap failed");
    }
    Ok(())
}

fn print_summary(summary: &DeploymentSummary) {
    let mode = if summary.report.dry_run { "plan" } else { "deploy" };
    println!("{mode}: {} step(s) changed", summary.report.applied_count());

    for step in &summary.report.steps {
        println!("  {:<32} {}", step.step.to_string(), step.status.label());
    }
    for secret in &summary.secrets {
        match &secret.outcome {
            BootstrapOutcome::Stored { secret: owned } => println!(
                "  {:<32} stored at {} (version {})",
                secret.component,
                owned.path(),
                owned.version
            ),
            BootstrapOutcome::Skipped { reason } => {
                println!("  {:<32} bootstrap skipped: {reason}", secret.component);
            }
            BootstrapOutcome::Failed(failure) => {
                println!("  {:<32} bootstrap failed: {failure}", secret.component);
            }
        }
    }
}
