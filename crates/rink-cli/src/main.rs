use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rink_core::{Event, ExternalId, GameStatus, TeamRef};
use rink_ingest::{DateSelection, IngestConfig, IngestError};
use rink_store::{PostgresBackend, StoreAdapter, EVENTS_COLLECTION, TEAM_STATS_COLLECTION};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rink-cli")]
#[command(about = "Schedule-feed ingestion into the rink document store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch and store events for a date window (the default command).
    Sync {
        /// Specific date (YYYY-MM-DD); takes precedence over --days.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Number of trailing days ending today.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Insert a couple of fixture events for manual testing.
    Seed,
    /// Delete every document in a collection.
    Wipe {
        #[arg(long, default_value = EVENTS_COLLECTION)]
        collection: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync {
        date: None,
        days: None,
    }) {
        Commands::Sync { date, days } => {
            let summary = rink_ingest::run_from_env(DateSelection { date, days }).await?;
            if summary.is_degraded() {
                warn!("run degraded; inspect the summary for partial failures");
            }
            println!(
                "sync complete: run_id={} dates={}/{} events={} upserted={} failed={} stats_applied={}",
                summary.run_id,
                summary.fetched_dates,
                summary.requested_dates,
                summary.total_events,
                summary.upserted,
                summary.failed_upserts,
                summary.stats_applied
            );
        }
        Commands::Seed => {
            let store = store_from_env().await?;
            let fixtures = sample_events();
            let outcome = store.upsert_batch(&fixtures).await;
            println!(
                "seeded {} fixture events ({} failed)",
                outcome.succeeded, outcome.failed
            );
        }
        Commands::Wipe { collection } => {
            anyhow::ensure!(
                collection == EVENTS_COLLECTION || collection == TEAM_STATS_COLLECTION,
                "unknown collection {collection}"
            );
            let store = store_from_env().await?;
            let removed = store.wipe_collection(&collection).await?;
            println!("removed {removed} documents from {collection}");
        }
    }

    Ok(())
}

async fn store_from_env() -> Result<StoreAdapter<PostgresBackend>, IngestError> {
    let config = IngestConfig::from_env()?;
    let backend = PostgresBackend::connect(&config.database_url).await?;
    Ok(StoreAdapter::new(backend))
}

fn sample_events() -> Vec<Event> {
    let now = Utc::now();
    let team = |id: &str, name: &str, score: Option<i64>| TeamRef {
        team_id: Some(id.to_string()),
        team_name: name.to_string(),
        score,
        logo_url: None,
    };
    vec![
        Event {
            external_id: Some(ExternalId::new("9990000001")),
            start_time: Some(now - Duration::hours(6)),
            home: team("10", "Toronto Maple Leafs", Some(4)),
            away: team("6", "Boston Bruins", Some(1)),
            status: GameStatus::Final,
            season: Some("20232024".to_string()),
            event_type: Some("R".to_string()),
            venue: None,
            extra: serde_json::Map::new(),
            stats_applied: false,
            created_at: None,
            updated_at: None,
        },
        Event {
            external_id: Some(ExternalId::new("9990000002")),
            start_time: Some(now + Duration::hours(6)),
            home: team("22", "Edmonton Oilers", None),
            away: team("20", "Calgary Flames", None),
            status: GameStatus::Scheduled,
            season: Some("20232024".to_string()),
            event_type: Some("R".to_string()),
            venue: None,
            extra: serde_json::Map::new(),
            stats_applied: false,
            created_at: None,
            updated_at: None,
        },
    ]
}
