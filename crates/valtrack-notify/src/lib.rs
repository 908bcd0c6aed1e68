//! Best-effort notification delivery for newly observed match records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use valtrack_core::{MatchRecord, SubscriberId};

pub const CRATE_NAME: &str = "valtrack-notify";

pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const VICTORY_COLOR: u32 = 0x2E_CC_71;
const DEFEAT_COLOR: u32 = 0xE7_4C_3C;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("subscriber {0} is unreachable (direct messages blocked)")]
    Unreachable(SubscriberId),
    #[error("subscriber {0} not found")]
    SubscriberNotFound(SubscriberId),
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl From<reqwest::Error> for NotifyError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

pub fn classify_status(status: StatusCode, subscriber: SubscriberId) -> NotifyError {
    match status {
        StatusCode::FORBIDDEN => NotifyError::Unreachable(subscriber),
        StatusCode::NOT_FOUND => NotifyError::SubscriberNotFound(subscriber),
        other => NotifyError::Transient(format!("http status {}", other.as_u16())),
    }
}

/// A delivery channel for one (subscriber, record) pair.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn notify(&self, subscriber: SubscriberId, record: &MatchRecord) -> Result<(), NotifyError>;
}

/// Attempt every pair concurrently and return how many were delivered.
///
/// A failed or panicked delivery is logged and counted as not delivered; it
/// never stops the other pairs.
pub async fn dispatch_all(notifier: Arc<dyn Notifier>, pairs: Vec<(SubscriberId, MatchRecord)>) -> usize {
    if pairs.is_empty() {
        return 0;
    }

    let handles = pairs
        .into_iter()
        .map(|(subscriber, record)| {
            let notifier = Arc::clone(&notifier);
            let span = info_span!("notify", channel = notifier.channel(), %subscriber, record = %record.id);
            tokio::spawn(
                async move {
                    match notifier.notify(subscriber, &record).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(error = %err, "notification not delivered");
                            false
                        }
                    }
                }
                .instrument(span),
            )
        })
        .collect::<Vec<_>>();

    join_all(handles)
        .await
        .into_iter()
        .filter(|joined| match joined {
            Ok(delivered) => *delivered,
            Err(join_err) => {
                warn!(error = %join_err, "notification task did not complete");
                false
            }
        })
        .count()
}

/// Builds the rich embed shown to the subscriber.
pub fn match_embed(record: &MatchRecord) -> JsonValue {
    let result = record.match_result.as_deref().unwrap_or("Unknown");
    let map = record.map_name.as_deref().unwrap_or("Unknown");
    let color = if record.is_victory() { VICTORY_COLOR } else { DEFEAT_COLOR };
    let field = |name: &str, value: String| json!({ "name": name, "value": value, "inline": true });

    json!({
        "title": format!("{}#{}: {result} on {map}", record.handle, record.tag),
        "color": color,
        "fields": [
            field("Agent", record.agent.clone()),
            field("Score", record.game_score.clone()),
            field("K/D/A", format!("{}/{}/{}", record.kills, record.deaths, record.assists)),
            field("K/D", format!("{:.2}", record.kd_ratio())),
            field("ACS", format!("{:.1}", record.acs)),
            field("ADR", format!("{:.1}", record.adr)),
            field("HS%", format!("{:.1}%", record.headshot_percentage)),
            field("Damage Δ", format!("{:+}", record.damage_delta)),
            field("Team Rank", format!("#{}", record.team_placement)),
        ],
        "footer": { "text": format!("match {}", record.provider_match_id) }
    })
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub api_base: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: String,
}

/// Delivers records as direct-message embeds through the Discord REST API.
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    client: reqwest::Client,
    api_base: String,
    authorization: String,
}

impl DiscordNotifier {
    pub fn new(config: DiscordConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            authorization: format!("Bot {}", config.bot_token),
        })
    }

    async fn open_dm(&self, subscriber: SubscriberId) -> Result<String, NotifyError> {
        let response = self
            .client
            .post(format!("{}/users/@me/channels", self.api_base))
            .header("Authorization", &self.authorization)
            .json(&json!({ "recipient_id": subscriber.to_string() }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), subscriber));
        }
        Ok(response.json::<DmChannel>().await?.id)
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn channel(&self) -> &'static str {
        "discord"
    }

    async fn notify(&self, subscriber: SubscriberId, record: &MatchRecord) -> Result<(), NotifyError> {
        let channel_id = self.open_dm(subscriber).await?;
        let response = self
            .client
            .post(format!("{}/channels/{channel_id}/messages", self.api_base))
            .header("Authorization", &self.authorization)
            .json(&json!({ "embeds": [match_embed(record)] }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(classify_status(response.status(), subscriber));
        }
        info!("delivered match notification");
        Ok(())
    }
}

/// Writes notifications to the log. Used when no bot token is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, subscriber: SubscriberId, record: &MatchRecord) -> Result<(), NotifyError> {
        info!(
            %subscriber,
            player = %record.player(),
            agent = %record.agent,
            score = %record.game_score,
            kd = record.kd_ratio(),
            result = record.match_result.as_deref().unwrap_or("Unknown"),
            "new match"
        );
        Ok(())
    }
}
