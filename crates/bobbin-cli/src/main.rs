mod demo;

use std::path::PathBuf;

use bobbin_core::domain::JobStatus;
use bobbin_core::{EngineBuilder, EngineConfig, JobFilter};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bobbin", about = "Job scheduling and execution engine")]
struct Cli {
    /// Engine config (TOML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher with the built-in jobs until Ctrl-C
    Run,
    /// List stored jobs
    Jobs {
        /// Only active jobs
        #[arg(long)]
        active: bool,

        /// Only jobs whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Show the run history of a job
    Runs {
        /// Job name
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            let engine = demo::register(EngineBuilder::new().config(config))
                .build()
                .await?;
            demo::add_inline_job(&engine).await?;

            let runner = engine.start();
            tracing::info!("bobbin running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown requested");
            runner.shutdown_and_join().await;
        }
        Commands::Jobs { active, prefix } => {
            let engine = EngineBuilder::new().config(config).build().await?;
            let filter = JobFilter {
                status: active.then_some(JobStatus::Active),
                name_prefix: prefix,
            };
            let jobs = engine.list_jobs(filter).await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
        Commands::Runs { name } => {
            let engine = EngineBuilder::new().config(config).build().await?;
            let runs = engine.runs(&name).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
    }

    Ok(())
}
