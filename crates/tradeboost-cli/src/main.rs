use anyhow::Result;
use clap::{Parser, Subcommand};
use tradeboost_storage::Store;
use tradeboost_sync::{Services, SyncConfig, SyncError, SyncOutcome};

#[derive(Debug, Parser)]
#[command(name = "tradeboost")]
#[command(about = "TradeBoost metrics backend command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API server.
    Serve,
    /// Refresh the current month's ad-spend snapshots for one account.
    Sync {
        #[arg(long)]
        user: String,
    },
    /// Print the current-month dashboard metrics for one account.
    Metrics {
        #[arg(long)]
        user: String,
    },
    /// Apply the database schema.
    Migrate,
    /// Scan ad copy against the compliance rule set.
    Scan { text: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            tradeboost_web::serve_from_env().await?;
        }
        Commands::Sync { user } => {
            let services = Services::from_config(&config).await?;
            let sync = services
                .spend_sync
                .ok_or(SyncError::Auth(
                    "ads platform credentials are not configured".to_string(),
                ))?;
            match sync.refresh_current_month_if_stale(&user).await? {
                SyncOutcome::Skipped { reason } => {
                    println!("sync skipped: {}", serde_json::to_string(&reason)?);
                }
                SyncOutcome::Completed { days } => {
                    println!("sync complete: {days} day(s) of spend persisted");
                }
            }
        }
        Commands::Metrics { user } => {
            let services = Services::from_config(&config).await?;
            let metrics = services.metrics.dashboard_metrics(&user).await?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Migrate => {
            let store = Store::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("schema applied to {}", config.database_url);
        }
        Commands::Scan { text } => {
            let services = Services::from_config(&config).await?;
            let report = services.scanner.scan(&text);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
