use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meteo_storage::{SqliteStore, WeatherStore};
use meteo_sync::SyncConfig;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meteo-cli")]
#[command(about = "ANM weather ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both sources once and exit.
    Sync,
    /// Run the schedule and the JSON API.
    Serve,
    /// Print stored source health and data counts.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let outcomes = meteo_sync::run_sync_once_from_env().await?;
            for outcome in &outcomes {
                println!(
                    "{}: success={} added={} total={} quality={} {}ms{}",
                    outcome.source_name,
                    outcome.success,
                    outcome.entries_added,
                    outcome.total_entries,
                    outcome.data_quality,
                    outcome.response_time_ms,
                    outcome
                        .error_message
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default(),
                );
            }
        }
        Commands::Serve => meteo_web::serve_from_env().await?,
        Commands::Status => {
            let config = SyncConfig::from_env();
            let store = SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening weather store at {}", config.database_url))?;
            let summary = store.data_summary().await?;
            println!(
                "forecasts={} alerts={} cities={}",
                summary.forecast_entries, summary.alert_entries, summary.city_count
            );
            for source in store.source_health_snapshot().await? {
                println!(
                    "{} [{}]: status={} quality={} reliability={:.1}% failures_in_a_row={} last_error={}",
                    source.source_name,
                    source.source_type.as_str(),
                    source.status,
                    source.data_quality,
                    source.reliability_percent(),
                    source.consecutive_failures,
                    source.last_error.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    Ok(())
}
