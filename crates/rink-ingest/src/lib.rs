//! Run-to-completion ingestion orchestrator: select dates, fetch and store,
//! report.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Days, NaiveDate, Utc};
use rink_feed::{FeedClient, FeedConfig, ScheduleSource};
use rink_store::{DocumentBackend, PostgresBackend, StatsOutcome, StoreAdapter};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rink-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    /// Missing or malformed required settings; fatal before any I/O.
    #[error("configuration error: {0}")]
    Config(String),
    /// Every requested date failed to fetch; the run has nothing to work on.
    #[error("all {requested} requested dates failed to fetch")]
    AllDatesFailed { requested: usize },
    #[error(transparent)]
    Store(#[from] rink_store::StoreError),
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub feed_base_url: String,
    pub database_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl IngestConfig {
    /// Reads settings from the environment. The database URL is the one
    /// required setting; everything else has a default.
    pub fn from_env() -> Result<Self, IngestError> {
        let database_url = std::env::var("RINK_DATABASE_URL").map_err(|_| {
            IngestError::Config("RINK_DATABASE_URL must be set to the document store".to_string())
        })?;
        Ok(Self {
            feed_base_url: std::env::var("RINK_FEED_BASE_URL")
                .unwrap_or_else(|_| "https://statsapi.web.nhl.com/api/v1".to_string()),
            database_url,
            http_timeout_secs: std::env::var("RINK_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("RINK_USER_AGENT")
                .unwrap_or_else(|_| "rink-ingest/0.1".to_string()),
        })
    }
}

/// Caller intent for the date window. An explicit date beats a day count;
/// absent both, the window is yesterday plus today so one run captures both
/// finalized and scheduled/live events.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateSelection {
    pub date: Option<NaiveDate>,
    pub days: Option<u32>,
}

pub fn resolve_dates(today: NaiveDate, selection: DateSelection) -> BTreeSet<NaiveDate> {
    if let Some(date) = selection.date {
        return BTreeSet::from([date]);
    }
    if let Some(days) = selection.days {
        let span = days.max(1);
        return (0..span)
            .filter_map(|back| today.checked_sub_days(Days::new(back.into())))
            .collect();
    }
    [today.checked_sub_days(Days::new(1)), Some(today)]
        .into_iter()
        .flatten()
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_dates: usize,
    pub fetched_dates: usize,
    pub failed_dates: Vec<NaiveDate>,
    pub total_events: usize,
    pub valid_events: usize,
    pub dropped_events: usize,
    pub upserted: usize,
    pub failed_upserts: usize,
    pub stats_applied: usize,
    pub stats_anomalies: usize,
}

impl RunSummary {
    /// A run degrades to a warning on partial failure; only the all-dates
    /// case (handled upstream as an error) is fatal.
    pub fn is_degraded(&self) -> bool {
        !self.failed_dates.is_empty() || self.failed_upserts > 0 || self.dropped_events > 0
    }
}

pub struct Ingestor<S, B> {
    source: S,
    store: StoreAdapter<B>,
}

impl<S: ScheduleSource, B: DocumentBackend> Ingestor<S, B> {
    pub fn new(source: S, store: StoreAdapter<B>) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &StoreAdapter<B> {
        &self.store
    }

    /// Three phases, strictly sequential: the dates are already selected by
    /// the caller; this fetches, stores, derives stats, and reports.
    pub async fn run_once(&self, dates: BTreeSet<NaiveDate>) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, dates = dates.len(), "starting ingestion run");

        if !self.source.check_connectivity().await {
            warn!("feed connectivity probe failed; attempting fetches anyway");
        }

        let outcome = self.source.fetch_for_dates(&dates).await;
        if !dates.is_empty() && outcome.failed.len() == dates.len() {
            return Err(IngestError::AllDatesFailed {
                requested: dates.len(),
            });
        }
        if !outcome.failed.is_empty() {
            warn!(failed = ?outcome.failed, "some dates failed to fetch");
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            requested_dates: dates.len(),
            fetched_dates: outcome.by_date.len(),
            failed_dates: outcome.failed.iter().copied().collect(),
            total_events: 0,
            valid_events: 0,
            dropped_events: 0,
            upserted: 0,
            failed_upserts: 0,
            stats_applied: 0,
            stats_anomalies: 0,
        };

        for (date, events) in &outcome.by_date {
            summary.total_events += events.len();

            let mut valid = Vec::with_capacity(events.len());
            for event in events {
                match event.validate() {
                    Ok(()) => valid.push(event.clone()),
                    Err(err) => {
                        warn!(%date, error = %err, "dropping invalid event");
                        summary.dropped_events += 1;
                    }
                }
            }
            summary.valid_events += valid.len();

            let batch = self.store.upsert_batch(&valid).await;
            summary.upserted += batch.succeeded;
            summary.failed_upserts += batch.failed;
            info!(%date, events = valid.len(), succeeded = batch.succeeded, failed = batch.failed, "date stored");

            // Stats are derived from the authoritative stored form, not the
            // raw feed payload.
            for event in &valid {
                let Some(id) = event.external_id.as_ref() else {
                    continue;
                };
                match self.store.get_by_external_id(id).await {
                    Ok(Some(stored)) if stored.status.is_final() => {
                        match self.store.update_stats_for_final(&stored).await {
                            Ok(StatsOutcome::Applied) => summary.stats_applied += 1,
                            Ok(StatsOutcome::Anomaly) => summary.stats_anomalies += 1,
                            Ok(_) => {}
                            Err(err) => {
                                warn!(external_id = %id, error = %err, "team stats update failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(external_id = %id, error = %err, "re-reading stored event failed");
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            total = summary.total_events,
            upserted = summary.upserted,
            failed = summary.failed_upserts,
            stats_applied = summary.stats_applied,
            "ingestion run complete"
        );
        if summary.is_degraded() {
            warn!(
                failed_dates = summary.failed_dates.len(),
                dropped = summary.dropped_events,
                failed_upserts = summary.failed_upserts,
                "run completed with partial failures"
            );
        }
        Ok(summary)
    }
}

/// Wire the real feed and Postgres-backed store from the environment and run
/// one ingestion over the selected window.
pub async fn run_from_env(selection: DateSelection) -> Result<RunSummary, IngestError> {
    let config = IngestConfig::from_env()?;
    let source = FeedClient::new(FeedConfig {
        base_url: config.feed_base_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..FeedConfig::default()
    })
    .map_err(|err| IngestError::Config(err.to_string()))?;
    let backend = PostgresBackend::connect(&config.database_url).await?;
    let ingestor = Ingestor::new(source, StoreAdapter::new(backend));
    let dates = resolve_dates(Utc::now().date_naive(), selection);
    ingestor.run_once(dates).await
}
