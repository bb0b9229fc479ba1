//! Canonical game model shared by the feed, store, and ingest crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "rink-core";

/// Upstream feed identifier for an event, used as the store's primary key.
///
/// The feed has shipped this both as an integer and as a string; either form
/// deserializes into the same stable string key and is never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ExternalId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = ExternalId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an event id as string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ExternalId, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ExternalId, E> {
                Ok(ExternalId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ExternalId, E> {
                Ok(ExternalId(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// Canonical event status. Upstream vocabulary is mapped through a fixed
/// table; anything unrecognized passes through lower-cased instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameStatus {
    Scheduled,
    Live,
    Final,
    Other(String),
}

impl GameStatus {
    pub fn normalize(raw: &str) -> Self {
        match raw.trim() {
            "Scheduled" | "Pre-Game" | "Preview" | "OK" => Self::Scheduled,
            "In Progress" | "In Progress - Critical" | "Live" => Self::Live,
            "Game Over" | "Final" => Self::Final,
            other => Self::Other(other.to_lowercase()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Live => "live",
            Self::Final => "final",
            Self::Other(s) => s,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final)
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for GameStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GameStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "scheduled" => Self::Scheduled,
            "live" => Self::Live,
            "final" => Self::Final,
            _ => Self::Other(raw),
        })
    }
}

impl Default for GameStatus {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

/// One side of a game as persisted on the event document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TeamRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub team_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Venue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

/// Canonical game record. `external_id` uniquely identifies an event;
/// re-ingesting the same id updates in place and keeps the first writer's
/// `created_at` and `stats_applied`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub home: TeamRef,
    pub away: TeamRef,
    #[serde(default)]
    pub status: GameStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<Venue>,
    /// Upstream fields the canonical schema does not model, keyed by their
    /// original names. New feed fields land here instead of being dropped.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    /// Set once the final result has been counted into team stats.
    #[serde(default)]
    pub stats_applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Structural validation applied before anything is written. Events that
    /// fail are dropped and logged by the caller, never fatal.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let Some(external_id) = &self.external_id else {
            return Err(ValidationError::MissingExternalId);
        };
        let id = external_id.clone();
        if self.home.team_id.is_none() || self.away.team_id.is_none() {
            return Err(ValidationError::MissingTeamId(id));
        }
        if self.home.team_name.is_empty() || self.away.team_name.is_empty() {
            return Err(ValidationError::MissingTeamName(id));
        }
        if self.start_time.is_none() {
            return Err(ValidationError::MissingStartTime(id));
        }
        Ok(())
    }
}

/// Derived per-team win/loss aggregate, keyed by team id. Counters only move
/// forward, and only when an event's final result is counted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamStats {
    pub team_id: String,
    pub team_name: String,
    pub wins: u32,
    pub losses: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ot_losses: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("event missing external id")]
    MissingExternalId,
    #[error("event {0} missing a team id")]
    MissingTeamId(ExternalId),
    #[error("event {0} missing a team name")]
    MissingTeamName(ExternalId),
    #[error("event {0} missing start time")]
    MissingStartTime(ExternalId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn valid_event() -> Event {
        Event {
            external_id: Some(ExternalId::new("2023020001")),
            start_time: Some(Utc.with_ymd_and_hms(2023, 10, 10, 23, 0, 0).single().unwrap()),
            home: TeamRef {
                team_id: Some("10".into()),
                team_name: "Toronto Maple Leafs".into(),
                score: Some(3),
                logo_url: None,
            },
            away: TeamRef {
                team_id: Some("8".into()),
                team_name: "Montreal Canadiens".into(),
                score: Some(2),
                logo_url: None,
            },
            status: GameStatus::Final,
            season: Some("20232024".into()),
            event_type: Some("R".into()),
            venue: None,
            extra: Map::new(),
            stats_applied: false,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn status_table_maps_known_vocabulary() {
        assert_eq!(GameStatus::normalize("Final"), GameStatus::Final);
        assert_eq!(GameStatus::normalize("Game Over"), GameStatus::Final);
        assert_eq!(GameStatus::normalize("In Progress"), GameStatus::Live);
        assert_eq!(
            GameStatus::normalize("In Progress - Critical"),
            GameStatus::Live
        );
        assert_eq!(GameStatus::normalize("Scheduled"), GameStatus::Scheduled);
        assert_eq!(GameStatus::normalize("Pre-Game"), GameStatus::Scheduled);
        assert_eq!(GameStatus::normalize("OK"), GameStatus::Scheduled);
    }

    #[test]
    fn unrecognized_status_passes_through_lowercased() {
        assert_eq!(
            GameStatus::normalize("Unknown"),
            GameStatus::Other("unknown".into())
        );
        assert_eq!(GameStatus::normalize(" Postponed "), GameStatus::Other("postponed".into()));
    }

    #[test]
    fn external_id_accepts_integer_and_string_forms() {
        let from_int: ExternalId = serde_json::from_str("2023020001").unwrap();
        let from_str: ExternalId = serde_json::from_str("\"2023020001\"").unwrap();
        assert_eq!(from_int, from_str);
        assert_eq!(from_int.as_str(), "2023020001");
    }

    #[test]
    fn validation_accepts_complete_event() {
        assert!(valid_event().validate().is_ok());
    }

    #[test]
    fn validation_rejects_structural_gaps() {
        let mut e = valid_event();
        e.external_id = None;
        assert_eq!(e.validate(), Err(ValidationError::MissingExternalId));

        let mut e = valid_event();
        e.away.team_id = None;
        assert!(matches!(e.validate(), Err(ValidationError::MissingTeamId(_))));

        let mut e = valid_event();
        e.home.team_name = String::new();
        assert!(matches!(e.validate(), Err(ValidationError::MissingTeamName(_))));

        let mut e = valid_event();
        e.start_time = None;
        assert!(matches!(e.validate(), Err(ValidationError::MissingStartTime(_))));
    }

    #[test]
    fn event_serializes_with_store_field_names() {
        let mut event = valid_event();
        event
            .extra
            .insert("broadcasts".into(), serde_json::json!(["TV1"]));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["externalId"], "2023020001");
        assert_eq!(value["home"]["teamName"], "Toronto Maple Leafs");
        assert_eq!(value["status"], "final");
        assert_eq!(value["extra"]["broadcasts"][0], "TV1");

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn passthrough_status_survives_a_store_round_trip() {
        let mut event = valid_event();
        event.status = GameStatus::normalize("Postponed");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["status"], "postponed");
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back.status, GameStatus::Other("postponed".into()));
    }
}
