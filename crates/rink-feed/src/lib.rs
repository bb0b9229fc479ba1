//! Schedule-feed client: fetches a day's events and normalizes the feed's
//! unstable payload shape into the canonical model.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use rink_core::{Event, ExternalId, GameStatus, TeamRef, Venue};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "rink-feed";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparseable schedule payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Aggregate of a multi-date fetch. Every requested date appears exactly once,
/// either in `by_date` or in `failed`, never both.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub by_date: BTreeMap<NaiveDate, Vec<Event>>,
    pub failed: BTreeSet<NaiveDate>,
}

/// Seam between the orchestrator and the upstream feed.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    /// Liveness hint only; never gates ingestion and never errors.
    async fn check_connectivity(&self) -> bool;

    /// A valid response with no games is `Ok(vec![])`; only transport, DNS,
    /// or HTTP-status problems are errors.
    async fn fetch_for_date(&self, date: NaiveDate) -> Result<Vec<Event>, FetchError>;

    async fn fetch_for_dates(&self, dates: &BTreeSet<NaiveDate>) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub fetch_concurrency: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://statsapi.web.nhl.com/api/v1".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: "rink-ingest/0.1".to_string(),
            fetch_concurrency: 8,
        }
    }
}

#[derive(Debug)]
pub struct FeedClient {
    client: reqwest::Client,
    base_url: String,
    fetch_limit: Arc<Semaphore>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            fetch_limit: Arc::new(Semaphore::new(config.fetch_concurrency.max(1))),
        })
    }

    fn schedule_url(&self, date: NaiveDate) -> String {
        format!(
            "{}/schedule?date={}&expand=schedule.linescore",
            self.base_url,
            date.format("%Y-%m-%d")
        )
    }

    async fn fetch_schedule_text(&self, date: NaiveDate) -> Result<String, FetchError> {
        let url = self.schedule_url(date);
        let resp = self.client.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl ScheduleSource for FeedClient {
    async fn check_connectivity(&self) -> bool {
        match self.fetch_schedule_text(Utc::now().date_naive()).await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "feed connectivity probe failed");
                false
            }
        }
    }

    async fn fetch_for_date(&self, date: NaiveDate) -> Result<Vec<Event>, FetchError> {
        let text = self.fetch_schedule_text(date).await?;
        parse_schedule(&text)
    }

    async fn fetch_for_dates(&self, dates: &BTreeSet<NaiveDate>) -> FetchOutcome {
        let fetches = dates.iter().map(|&date| {
            let limit = Arc::clone(&self.fetch_limit);
            async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                (date, self.fetch_for_date(date).await)
            }
        });

        let mut outcome = FetchOutcome::default();
        for (date, result) in join_all(fetches).await {
            match result {
                Ok(events) => {
                    debug!(%date, count = events.len(), "fetched schedule date");
                    outcome.by_date.insert(date, events);
                }
                Err(err) => {
                    warn!(%date, error = %err, "schedule fetch failed");
                    outcome.failed.insert(date);
                }
            }
        }
        outcome
    }
}

/// Parse a raw schedule payload into normalized events. Absent nested fields
/// are treated as absent; nothing here panics on feed drift.
pub fn parse_schedule(text: &str) -> Result<Vec<Event>, FetchError> {
    let schedule: RawSchedule = serde_json::from_str(text)?;
    Ok(schedule
        .dates
        .into_iter()
        .flat_map(|bucket| bucket.games)
        .map(normalize_game)
        .collect())
}

#[derive(Debug, Deserialize)]
struct RawSchedule {
    #[serde(default)]
    dates: Vec<RawDateBucket>,
}

#[derive(Debug, Deserialize)]
struct RawDateBucket {
    #[serde(default)]
    games: Vec<RawGame>,
}

/// Raw upstream game. Recognized fields are typed; everything else flattens
/// into `extra` so feed additions are preserved rather than dropped. The
/// bulky expand payloads are captured by name so they do not bloat `extra`.
#[derive(Debug, Deserialize)]
struct RawGame {
    #[serde(default, rename = "gamePk")]
    game_pk: Option<ExternalId>,
    #[serde(default, rename = "gameType")]
    game_type: Option<String>,
    #[serde(default)]
    season: Option<String>,
    #[serde(default, rename = "gameDate")]
    game_date: Option<String>,
    #[serde(default)]
    status: Option<RawStatus>,
    #[serde(default)]
    teams: Option<RawTeams>,
    #[serde(default)]
    venue: Option<RawVenue>,
    #[serde(default)]
    #[allow(dead_code)]
    linescore: Option<Value>,
    #[serde(default, rename = "liveData")]
    #[allow(dead_code)]
    live_data: Option<Value>,
    #[serde(default)]
    #[allow(dead_code)]
    copyright: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default, rename = "detailedState")]
    detailed_state: Option<String>,
    #[serde(default, rename = "abstractGameState")]
    abstract_game_state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTeams {
    #[serde(default)]
    home: Option<RawTeamScore>,
    #[serde(default)]
    away: Option<RawTeamScore>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTeamScore {
    #[serde(default)]
    team: Option<RawTeam>,
    #[serde(default)]
    score: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTeam {
    #[serde(default, deserialize_with = "de_lenient_id")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "teamName")]
    team_name: Option<String>,
    #[serde(default, rename = "locationName")]
    location_name: Option<String>,
    #[serde(default)]
    abbreviation: Option<String>,
    #[serde(default, rename = "logoUrl")]
    logo_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVenue {
    #[serde(default, deserialize_with = "de_lenient_id")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Ids arrive as integers or strings depending on feed era.
fn de_lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

fn normalize_game(raw: RawGame) -> Event {
    let status_raw = raw
        .status
        .as_ref()
        .and_then(|s| s.detailed_state.as_deref().or(s.abstract_game_state.as_deref()))
        .unwrap_or_default();

    let (home, away) = match raw.teams {
        Some(teams) => (
            normalize_side(teams.home),
            normalize_side(teams.away),
        ),
        None => (TeamRef::default(), TeamRef::default()),
    };

    Event {
        external_id: raw.game_pk,
        start_time: raw.game_date.as_deref().and_then(parse_start_time),
        home,
        away,
        status: GameStatus::normalize(status_raw),
        season: raw.season,
        event_type: raw.game_type,
        // A venue without a name carries no useful information.
        venue: raw.venue.and_then(|v| {
            v.name.map(|name| Venue { id: v.id, name })
        }),
        extra: raw.extra,
        stats_applied: false,
        created_at: None,
        updated_at: None,
    }
}

fn normalize_side(side: Option<RawTeamScore>) -> TeamRef {
    let side = side.unwrap_or_default();
    let team = side.team.unwrap_or_default();
    TeamRef {
        team_id: team.id.clone(),
        team_name: display_name(&team),
        score: side.score,
        logo_url: team.logo_url.clone(),
    }
}

/// Assemble a display name from whichever parts the feed provided:
/// full name, then location + nickname, then abbreviation, else empty.
fn display_name(team: &RawTeam) -> String {
    if let Some(name) = team.name.as_deref().filter(|s| !s.trim().is_empty()) {
        return name.trim().to_string();
    }
    let parts: Vec<&str> = [team.location_name.as_deref(), team.team_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if !parts.is_empty() {
        return parts.join(" ");
    }
    team.abbreviation
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn parse_start_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
