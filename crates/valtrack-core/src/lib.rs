//! Core domain model and identity hashing for valtrack.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "valtrack-core";

/// Number of hex characters kept from the SHA-256 digest.
pub const IDENTITY_LEN: usize = 16;

/// Deterministic, opaque identity token over an ordered list of parts.
///
/// Each part is length-prefixed before hashing so that moving a character
/// across a part boundary always yields a different token.
pub fn identity<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update(part.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    let mut token = hex::encode(hasher.finalize());
    token.truncate(IDENTITY_LEN);
    token
}

/// Round to `places` decimals; exact halves go to the even neighbour.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round_ties_even() / factor
}

/// Kills per death, rounded to 2 decimals; kills when deaths is zero.
pub fn kd_ratio(kills: i32, deaths: i32) -> f64 {
    if deaths == 0 {
        f64::from(kills)
    } else {
        round_to(f64::from(kills) / f64::from(deaths), 2)
    }
}

/// Chat-platform user that receives notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriberId {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(SubscriberId)
            .map_err(|_| IdentityParseError::Subscriber(s.to_string()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityParseError {
    #[error("expected `name#tag`, got `{0}`")]
    MissingSeparator(String),
    #[error("both name and tag are required, got `{0}`")]
    EmptyPart(String),
    #[error("invalid subscriber id `{0}`")]
    Subscriber(String),
}

/// A player as known to the stats provider: handle plus discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerRef {
    pub handle: String,
    pub tag: String,
}

impl PlayerRef {
    pub fn new(handle: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            tag: tag.into(),
        }
    }

    /// Case-insensitive comparison against a roster entry.
    pub fn matches(&self, handle: &str, tag: &str) -> bool {
        self.handle.to_lowercase() == handle.to_lowercase()
            && self.tag.to_lowercase() == tag.to_lowercase()
    }
}

impl fmt::Display for PlayerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.handle, self.tag)
    }
}

impl FromStr for PlayerRef {
    type Err = IdentityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((handle, tag)) = s.split_once('#') else {
            return Err(IdentityParseError::MissingSeparator(s.to_string()));
        };
        let handle = handle.trim();
        let tag = tag.trim();
        if handle.is_empty() || tag.is_empty() {
            return Err(IdentityParseError::EmptyPart(s.to_string()));
        }
        Ok(Self::new(handle, tag))
    }
}

/// A subscriber's opt-in to notifications for one player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPlayer {
    pub handle: String,
    pub tag: String,
    pub subscriber_id: SubscriberId,
}

impl TrackedPlayer {
    pub fn new(player: PlayerRef, subscriber_id: SubscriberId) -> Self {
        Self {
            handle: player.handle,
            tag: player.tag,
            subscriber_id,
        }
    }

    /// Uniqueness key: one row per (handle, tag, subscriber).
    pub fn identity_hash(&self) -> String {
        tracked_identity(&self.handle, &self.tag, self.subscriber_id)
    }

    pub fn player(&self) -> PlayerRef {
        PlayerRef::new(self.handle.clone(), self.tag.clone())
    }
}

pub fn tracked_identity(handle: &str, tag: &str, subscriber_id: SubscriberId) -> String {
    identity(&[handle, tag, &subscriber_id.to_string()])
}

/// Subscriber-independent: one record per player per provider match.
pub fn match_identity(provider_match_id: &str, handle: &str, tag: &str) -> String {
    identity(&[provider_match_id, handle, tag])
}

/// One player's normalized performance in one provider match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: String,
    pub provider_match_id: String,
    pub handle: String,
    pub tag: String,
    pub agent: String,
    pub game_score: String,
    pub kills: i32,
    pub deaths: i32,
    pub assists: i32,
    pub damage_delta: i64,
    pub headshot_percentage: f64,
    pub adr: f64,
    pub acs: f64,
    pub team_placement: u32,
    pub map_name: Option<String>,
    pub match_result: Option<String>,
}

impl MatchRecord {
    pub fn kd_ratio(&self) -> f64 {
        kd_ratio(self.kills, self.deaths)
    }

    pub fn player(&self) -> PlayerRef {
        PlayerRef::new(self.handle.clone(), self.tag.clone())
    }

    pub fn is_victory(&self) -> bool {
        self.match_result.as_deref() == Some("Victory")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Uniform outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobExecutionRecord {
    pub job_id: String,
    pub run_id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub result: serde_json::Value,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_is_stable_and_fixed_length() {
        let a = identity(&["match-1", "Fruit", "PEPE"]);
        let b = identity(&["match-1", "Fruit", "PEPE"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), IDENTITY_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_changes_when_any_part_changes() {
        let mut seen = HashSet::new();
        for m in 0..20 {
            for p in 0..20 {
                let token = identity(&[format!("m{m}"), format!("p{p}"), "tag".to_string()]);
                assert!(seen.insert(token), "collision at m{m} p{p}");
            }
        }
        assert_ne!(identity(&["ab", "c"]), identity(&["a", "bc"]));
        assert_ne!(identity(&["a#b", "c"]), identity(&["a", "b#c"]));
    }

    #[test]
    fn tracked_identity_includes_subscriber_match_identity_does_not() {
        let p = PlayerRef::new("Fruit", "PEPE");
        let one = TrackedPlayer::new(p.clone(), SubscriberId(1));
        let two = TrackedPlayer::new(p, SubscriberId(2));
        assert_ne!(one.identity_hash(), two.identity_hash());
        assert_eq!(
            match_identity("m-1", "Fruit", "PEPE"),
            match_identity("m-1", "Fruit", "PEPE")
        );
    }

    #[test]
    fn kd_ratio_handles_zero_deaths_and_rounds() {
        assert_eq!(kd_ratio(10, 0), 10.0);
        assert_eq!(kd_ratio(25, 15), 1.67);
        assert_eq!(kd_ratio(0, 4), 0.0);
        assert_eq!(kd_ratio(1, 8), 0.12);
        assert_eq!(kd_ratio(3, 8), 0.38);
        assert_eq!(round_to(2525.0 / 20.0, 1), 126.2);
    }

    #[test]
    fn player_ref_parses_name_and_tag() {
        let p: PlayerRef = " AGreenFruit # PEPE ".parse().unwrap();
        assert_eq!(p, PlayerRef::new("AGreenFruit", "PEPE"));
        assert_eq!(p.to_string(), "AGreenFruit#PEPE");

        let with_hash: PlayerRef = "a#b#c".parse().unwrap();
        assert_eq!(with_hash.tag, "b#c");

        assert!(matches!(
            "nohash".parse::<PlayerRef>(),
            Err(IdentityParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "#tag".parse::<PlayerRef>(),
            Err(IdentityParseError::EmptyPart(_))
        ));
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
