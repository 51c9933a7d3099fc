//! prowctl - operator CLI for the prow controllers
//!
//! Lists ProwJobs, previews what sinker and horologium would do on their
//! next pass, and probes the running controllers.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::jobs::JobFilter;
use prow_lib::config::ConfigAgent;
use prow_lib::horologium::{CronScheduler, Horologium};
use prow_lib::sinker::Sinker;
use prow_lib::{ConfigProvider, ProwJobState, ProwJobType};
use std::path::PathBuf;
use std::sync::Arc;

/// Operator CLI for the prow controllers
#[derive(Parser)]
#[command(name = "prowctl")]
#[command(author, version, about = "Operator CLI for the prow sinker and horologium controllers", long_about = None)]
pub struct Cli {
    /// Prow config document (defaults to ~/.config/prowctl, then /etc/config/config.yaml)
    #[arg(long, env = "PROWCTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Kubeconfig whose contexts name the build clusters
    #[arg(long, env = "PROWCTL_BUILD_CLUSTERS")]
    pub build_clusters: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect ProwJobs
    #[command(subcommand)]
    Jobs(JobsCommands),

    /// Garbage collector commands
    #[command(subcommand)]
    Sinker(PlanCommands),

    /// Periodic scheduler commands
    #[command(subcommand)]
    Horologium(PlanCommands),

    /// Show health and readiness of the running controllers
    Status {
        /// Sinker probe endpoint
        #[arg(long, env = "PROWCTL_SINKER_URL")]
        sinker_url: Option<String>,

        /// Horologium probe endpoint
        #[arg(long, env = "PROWCTL_HOROLOGIUM_URL")]
        horologium_url: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum JobsCommands {
    /// List ProwJobs, newest first
    List {
        /// Only runs of this job
        #[arg(long, short)]
        job: Option<String>,

        /// Only jobs of this type
        #[arg(long = "type", value_enum)]
        job_type: Option<JobTypeArg>,

        /// Only jobs in this state
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Show what the next pass would do without changing anything
    Plan,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JobTypeArg {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

impl From<JobTypeArg> for ProwJobType {
    fn from(arg: JobTypeArg) -> Self {
        match arg {
            JobTypeArg::Presubmit => ProwJobType::Presubmit,
            JobTypeArg::Postsubmit => ProwJobType::Postsubmit,
            JobTypeArg::Periodic => ProwJobType::Periodic,
            JobTypeArg::Batch => ProwJobType::Batch,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StateArg {
    Scheduling,
    Triggered,
    Pending,
    Success,
    Failure,
    Aborted,
    Error,
}

impl From<StateArg> for ProwJobState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Scheduling => ProwJobState::Scheduling,
            StateArg::Triggered => ProwJobState::Triggered,
            StateArg::Pending => ProwJobState::Pending,
            StateArg::Success => ProwJobState::Success,
            StateArg::Failure => ProwJobState::Failure,
            StateArg::Aborted => ProwJobState::Aborted,
            StateArg::Error => ProwJobState::Error,
        }
    }
}

fn load_prow_config(path: PathBuf) -> Result<Arc<ConfigAgent>> {
    let agent = ConfigAgent::load(path.clone())
        .with_context(|| format!("Failed to load prow config from {}", path.display()))?;
    Ok(Arc::new(agent))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::CliConfig::load()?;
    let build_clusters = settings.build_clusters(cli.build_clusters.clone());

    match cli.command {
        Commands::Jobs(JobsCommands::List {
            job,
            job_type,
            state,
        }) => {
            let agent = load_prow_config(settings.prow_config(cli.config))?;
            let (prow_jobs, _) = commands::connect(build_clusters.as_deref()).await?;
            let filter = JobFilter {
                job,
                job_type: job_type.map(Into::into),
                state: state.map(Into::into),
            };
            let namespace = agent.current().prowjob_namespace.clone();
            commands::jobs::list_jobs(&prow_jobs, &namespace, &filter, cli.format).await?;
        }
        Commands::Sinker(PlanCommands::Plan) => {
            let agent = load_prow_config(settings.prow_config(cli.config))?;
            let (prow_jobs, pods) = commands::connect(build_clusters.as_deref()).await?;
            let sinker = Sinker::new(prow_jobs, pods, agent).with_dry_run(true);
            commands::sinker::plan(&sinker, cli.format).await?;
        }
        Commands::Horologium(PlanCommands::Plan) => {
            let agent = load_prow_config(settings.prow_config(cli.config))?;
            let (prow_jobs, _) = commands::connect(build_clusters.as_deref()).await?;
            let horologium = Horologium::new(prow_jobs, agent, Arc::new(CronScheduler::new()));
            commands::horologium::plan(&horologium, cli.format).await?;
        }
        Commands::Status {
            sinker_url,
            horologium_url,
        } => {
            let targets = [
                ("sinker", settings.sinker_url(sinker_url)),
                ("horologium", settings.horologium_url(horologium_url)),
            ];
            commands::status::show_status(&targets, cli.format).await?;
        }
    }

    Ok(())
}
