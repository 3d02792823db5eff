use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cfbot_lib::config::Config;
use cfbot_lib::db::App;
use cfbot_lib::{patch, queue, server, tick};

#[derive(Parser)]
#[command(name = "cfbot")]
#[command(about = "Patch-testing robot: mailing list -> git branches -> CI results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one minute tick: poll, sweep, materialise at most one branch,
    /// regenerate pages (singleton via the lock file)
    Tick,

    /// Run a work queue consumer
    Worker,

    /// Run the CI webhook endpoint
    Server,

    /// Run the hourly maintenance (statistics refresh)
    Hourly,

    /// Run the daily maintenance (garbage collection)
    Daily,

    /// Materialise one submission right now, ignoring the scheduler
    Process {
        commitfest_id: i32,
        submission_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Tick => {
            let app = App::connect(config, "cfbot_tick").await?;
            app.migrate().await?;
            tick::run(&app).await
        }
        Commands::Worker => {
            let app = App::connect(config, "cfbot_queue_worker").await?;
            queue::run_worker(&app).await
        }
        Commands::Server => {
            let app = App::connect(config, "cfbot_webhook").await?;
            server::run_server(app).await
        }
        Commands::Hourly => {
            let app = App::connect(config, "cfbot_hourly").await?;
            tick::run_hourly(&app).await
        }
        Commands::Daily => {
            let app = App::connect(config, "cfbot_daily").await?;
            tick::run_daily(&app).await
        }
        Commands::Process {
            commitfest_id,
            submission_id,
        } => {
            let app = App::connect(config, "cfbot_process").await?;
            patch::process_submission(&app, commitfest_id, submission_id).await
        }
    }
}
