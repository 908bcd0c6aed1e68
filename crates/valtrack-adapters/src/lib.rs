//! Stats-provider adapter: request building + tolerant match normalization.

use std::cmp::Ordering;

use reqwest::Url;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use valtrack_core::{match_identity, round_to, MatchRecord, PlayerRef};
use valtrack_storage::{FetchRequest, FetchResult};

pub const CRATE_NAME: &str = "valtrack-adapters";

/// Placement reported when the player cannot be ranked within their team.
pub const FALLBACK_TEAM_PLACEMENT: u32 = 5;
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid provider base url `{url}`: {reason}")]
    BaseUrl { url: String, reason: String },
}

/// Why a response produced no record. Never escapes [`MatchProvider::normalize`].
#[derive(Debug, Error, PartialEq)]
pub enum NormalizeMiss {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider returned status {0:?}")]
    Status(Option<u16>),
    #[error("response body is not a JSON document")]
    NotJson,
    #[error("response has no match list")]
    NoMatches,
    #[error("latest match is not an object")]
    MalformedMatch,
    #[error("match has no provider id")]
    MissingMatchId,
    #[error("match roster has an unexpected shape")]
    MalformedRoster,
    #[error("player not present in match roster")]
    PlayerNotFound,
}

/// A provider that can be polled for a player's latest match.
pub trait MatchProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    fn match_request(&self, player: &PlayerRef) -> Result<FetchRequest, AdapterError>;

    /// Total: every failure is logged and turned into `None`.
    fn normalize(&self, response: &FetchResult, player: &PlayerRef) -> Option<MatchRecord> {
        match normalize_match(response, player) {
            Ok(record) => Some(record),
            Err(miss) => {
                warn!(provider = self.provider_id(), %player, reason = %miss, "no match record");
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HenrikConfig {
    pub base_url: String,
    pub region: String,
    pub platform: String,
    pub api_key: Option<String>,
}

impl Default for HenrikConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.henrikdev.xyz/valorant/v4".to_string(),
            region: "na".to_string(),
            platform: "pc".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HenrikAdapter {
    config: HenrikConfig,
}

impl HenrikAdapter {
    pub fn new(config: HenrikConfig) -> Self {
        Self { config }
    }

    /// `<base>/matches/{region}/{platform}/{name}/{tag}?mode=competitive&size=1`
    pub fn match_url(&self, player: &PlayerRef) -> Result<Url, AdapterError> {
        let base = &self.config.base_url;
        let bad_base = |reason: String| AdapterError::BaseUrl {
            url: base.clone(),
            reason,
        };
        let mut url = Url::parse(base).map_err(|e| bad_base(e.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| bad_base("cannot be a base".to_string()))?;
            segments.pop_if_empty().extend([
                "matches",
                self.config.region.as_str(),
                self.config.platform.as_str(),
                player.handle.as_str(),
                player.tag.as_str(),
            ]);
        }
        url.query_pairs_mut()
            .append_pair("mode", "competitive")
            .append_pair("size", "1");
        Ok(url)
    }
}

impl MatchProvider for HenrikAdapter {
    fn provider_id(&self) -> &'static str {
        "henrik"
    }

    fn match_request(&self, player: &PlayerRef) -> Result<FetchRequest, AdapterError> {
        let request = FetchRequest::get(self.match_url(player)?.to_string());
        Ok(match &self.config.api_key {
            Some(key) => request.with_header("Authorization", key.clone()),
            None => request,
        })
    }
}

/// Read-only view over an untrusted JSON document. Every accessor is total:
/// a missing key or a wrong shape yields an absent view, never a panic.
#[derive(Debug, Clone, Copy)]
pub struct Doc<'a>(Option<&'a JsonValue>);

impl<'a> Doc<'a> {
    pub fn new(value: &'a JsonValue) -> Self {
        Self(Some(value))
    }

    pub fn missing() -> Self {
        Self(None)
    }

    pub fn get(self, key: &str) -> Doc<'a> {
        Doc(self.0.and_then(|v| v.as_object()).and_then(|o| o.get(key)))
    }

    pub fn path(self, keys: &[&str]) -> Doc<'a> {
        keys.iter().fold(self, |doc, key| doc.get(key))
    }

    pub fn at(self, index: usize) -> Doc<'a> {
        Doc(self.0.and_then(|v| v.as_array()).and_then(|a| a.get(index)))
    }

    pub fn raw(self) -> Option<&'a JsonValue> {
        self.0
    }

    pub fn is_object(self) -> bool {
        matches!(self.0, Some(JsonValue::Object(_)))
    }

    pub fn items(self) -> Option<&'a [JsonValue]> {
        self.0.and_then(|v| v.as_array()).map(Vec::as_slice)
    }

    pub fn as_str(self) -> Option<&'a str> {
        self.0.and_then(|v| v.as_str())
    }

    pub fn as_f64(self) -> Option<f64> {
        self.0.and_then(|v| v.as_f64())
    }

    pub fn as_bool(self) -> Option<bool> {
        self.0.and_then(|v| v.as_bool())
    }

    pub fn str_or(self, default: &'a str) -> &'a str {
        self.as_str().unwrap_or(default)
    }

    pub fn f64_or(self, default: f64) -> f64 {
        self.as_f64().unwrap_or(default)
    }
}

fn count(value: f64) -> i32 {
    value as i32
}

fn roster_matches(entry: Doc<'_>, player: &PlayerRef) -> bool {
    player.matches(entry.get("name").str_or(""), entry.get("tag").str_or(""))
}

/// A missing, empty or non-string team id means "no team".
fn team_id(entry: Doc<'_>) -> Option<&str> {
    entry.get("team_id").as_str().filter(|id| !id.is_empty())
}

/// 1-based rank by in-match score among the player's teammates; ties keep
/// roster order.
fn team_placement(roster: &[&JsonValue], me: &JsonValue) -> u32 {
    let Some(mine) = team_id(Doc::new(me)) else {
        return FALLBACK_TEAM_PLACEMENT;
    };
    let mut team: Vec<&JsonValue> = roster
        .iter()
        .copied()
        .filter(|p| team_id(Doc::new(p)) == Some(mine))
        .collect();
    let score = |p: &JsonValue| Doc::new(p).path(&["stats", "score"]).f64_or(0.0);
    team.sort_by(|a, b| score(*b).partial_cmp(&score(*a)).unwrap_or(Ordering::Equal));
    team.iter()
        .position(|p| std::ptr::eq(*p, me))
        .and_then(|idx| u32::try_from(idx + 1).ok())
        .unwrap_or(FALLBACK_TEAM_PLACEMENT)
}

/// Turn one provider response into the player's latest match record.
pub fn normalize_match(response: &FetchResult, player: &PlayerRef) -> Result<MatchRecord, NormalizeMiss> {
    if let Some(err) = &response.error {
        return Err(NormalizeMiss::Transport(err.clone()));
    }
    if response.status != Some(200) {
        return Err(NormalizeMiss::Status(response.status));
    }
    let body = response.json().ok_or(NormalizeMiss::NotJson)?;

    let latest = match Doc::new(body).get("data").items() {
        Some([first, ..]) => Doc::new(first),
        _ => return Err(NormalizeMiss::NoMatches),
    };
    if !latest.is_object() {
        return Err(NormalizeMiss::MalformedMatch);
    }

    let players = latest.get("players");
    let roster_doc = if players.is_object() {
        players.get("all_players")
    } else {
        players
    };
    let roster: Vec<&JsonValue> = roster_doc
        .items()
        .ok_or(NormalizeMiss::MalformedRoster)?
        .iter()
        .filter(|p| p.is_object())
        .collect();

    let me = roster
        .iter()
        .copied()
        .find(|p| roster_matches(Doc::new(p), player))
        .ok_or(NormalizeMiss::PlayerNotFound)?;
    let me_doc = Doc::new(me);
    let stats = me_doc.get("stats");
    let metadata = latest.get("metadata");

    let provider_match_id = metadata
        .get("match_id")
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or(NormalizeMiss::MissingMatchId)?;

    let placement = team_placement(&roster, me);

    let my_team = team_id(me_doc);
    let team = latest
        .get("teams")
        .items()
        .zip(my_team)
        .and_then(|(teams, mine)| teams.iter().find(|t| team_id(Doc::new(t)) == Some(mine)))
        .map(Doc::new)
        .unwrap_or_else(Doc::missing);
    let rounds_won = team.path(&["rounds", "won"]).f64_or(0.0) as i64;
    let rounds_lost = team.path(&["rounds", "lost"]).f64_or(0.0) as i64;
    let total_rounds = (rounds_won + rounds_lost).max(1) as f64;

    let damage_dealt = stats.path(&["damage", "dealt"]).f64_or(0.0);
    let damage_received = stats.path(&["damage", "received"]).f64_or(0.0);

    let headshots = stats.get("headshots").f64_or(0.0);
    let bodyshots = stats.get("bodyshots").f64_or(0.0);
    let legshots = stats.get("legshots").f64_or(0.0);
    let total_shots = headshots + bodyshots + legshots;
    let headshot_percentage = if total_shots > 0.0 {
        round_to(headshots / total_shots * 100.0, 1)
    } else {
        0.0
    };

    let map_name = metadata.path(&["map", "name"]).str_or(UNKNOWN).to_string();
    let match_result = if team.get("won").as_bool().unwrap_or(false) {
        "Victory"
    } else {
        "Defeat"
    };

    let record = MatchRecord {
        id: match_identity(provider_match_id, &player.handle, &player.tag),
        provider_match_id: provider_match_id.to_string(),
        handle: player.handle.clone(),
        tag: player.tag.clone(),
        agent: me_doc.path(&["agent", "name"]).str_or(UNKNOWN).to_string(),
        game_score: format!("{rounds_won}-{rounds_lost}"),
        kills: count(stats.get("kills").f64_or(0.0)),
        deaths: count(stats.get("deaths").f64_or(1.0)),
        assists: count(stats.get("assists").f64_or(0.0)),
        damage_delta: (damage_dealt - damage_received) as i64,
        headshot_percentage,
        adr: round_to(damage_dealt / total_rounds, 1),
        acs: round_to(stats.get("score").f64_or(0.0) / total_rounds, 1),
        team_placement: placement,
        map_name: Some(map_name),
        match_result: Some(match_result.to_string()),
    };
    debug!(%player, record = %record.id, "normalized match");
    Ok(record)
}
