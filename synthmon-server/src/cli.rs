use std::path::PathBuf;

use anyhow::Result;
use argh::FromArgs;

use crate::config::Config;
use crate::{healthcheck, observability, state, web};

/// Synthetic monitor for S3-compatible object storage.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Healthcheck(HealthcheckCommand),
    RunTest(RunTestCommand),
}

/// run the scheduler and the metric exposition server
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// probe a running monitor's health endpoint
///
/// This command checks if the monitor is available on the configured host and
/// port. This is used for Docker healthchecks.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "healthcheck")]
struct HealthcheckCommand {}

/// run a single named test immediately, bypassing schedule and jitter
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run-test")]
struct RunTestCommand {
    /// name of the test to run
    #[argh(option)]
    name: String,
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();
    let config = Config::load(args.config.as_deref())?;

    // Ensure a rustls crypto provider is installed, required on distroless.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    runtime.block_on(async move {
        match args.command {
            Command::Run(RunCommand {}) => web::server(config).await,
            Command::Healthcheck(HealthcheckCommand {}) => {
                healthcheck::healthcheck(config).await
            }
            Command::RunTest(RunTestCommand { name }) => run_single_test(config, &name).await,
        }
    })
}

async fn run_single_test(config: Config, name: &str) -> Result<()> {
    let state = state::Services::build(config)?;
    state.scheduler.run_now(name).await?;
    // Point-in-time metrics are the only output of a one-shot run.
    print!("{}", state.collector.export()?);
    Ok(())
}
