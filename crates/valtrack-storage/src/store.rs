//! Tracked-player registration and match ingestion with uniqueness-based dedup.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use valtrack_core::{tracked_identity, MatchRecord, PlayerRef, SubscriberId, TrackedPlayer};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("subscriber id {0} does not fit the storage column")]
    SubscriberRange(String),
    #[error("store handle is closed")]
    Closed,
}

/// Persistence contract for the tracker pipeline.
///
/// Duplicate registrations and duplicate match records are not errors: they
/// surface as `false` / an empty subscriber list.
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// `true` if the (handle, tag, subscriber) triple was newly stored.
    async fn register(&self, player: &TrackedPlayer) -> Result<bool, StoreError>;

    /// `true` only if a matching row existed and was removed.
    async fn unregister(&self, player: &PlayerRef, subscriber: SubscriberId) -> Result<bool, StoreError>;

    /// Distinct players tracked by anyone, in first-tracked order.
    async fn tracked_players(&self) -> Result<Vec<PlayerRef>, StoreError>;

    async fn subscriptions(&self, subscriber: SubscriberId) -> Result<Vec<TrackedPlayer>, StoreError>;

    /// Insert `record` if its identity is new and return the subscribers to
    /// notify; an already-known record yields an empty list.
    async fn ingest(&self, record: &MatchRecord) -> Result<Vec<SubscriberId>, StoreError>;

    async fn close(&self) {}
}

fn subscriber_to_db(id: SubscriberId) -> Result<i64, StoreError> {
    i64::try_from(id.0).map_err(|_| StoreError::SubscriberRange(id.to_string()))
}

fn subscriber_from_db(raw: i64) -> Result<SubscriberId, StoreError> {
    u64::try_from(raw)
        .map(SubscriberId)
        .map_err(|_| StoreError::SubscriberRange(raw.to_string()))
}

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        info!("connected to match store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("match store migrations applied");
        Ok(())
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn register(&self, player: &TrackedPlayer) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tracked_players (hash, handle, tag, subscriber_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (hash) DO NOTHING
            RETURNING hash
            "#,
        )
        .bind(player.identity_hash())
        .bind(&player.handle)
        .bind(&player.tag)
        .bind(subscriber_to_db(player.subscriber_id)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn unregister(&self, player: &PlayerRef, subscriber: SubscriberId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tracked_players WHERE hash = $1")
            .bind(tracked_identity(&player.handle, &player.tag, subscriber))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tracked_players(&self) -> Result<Vec<PlayerRef>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT handle, tag
              FROM tracked_players
             GROUP BY handle, tag
             ORDER BY MIN(tracked_at), handle, tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PlayerRef, StoreError> {
                Ok(PlayerRef::new(
                    row.try_get::<String, _>("handle")?,
                    row.try_get::<String, _>("tag")?,
                ))
            })
            .collect()
    }

    async fn subscriptions(&self, subscriber: SubscriberId) -> Result<Vec<TrackedPlayer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT handle, tag, subscriber_id
              FROM tracked_players
             WHERE subscriber_id = $1
             ORDER BY tracked_at, hash
            "#,
        )
        .bind(subscriber_to_db(subscriber)?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<TrackedPlayer, StoreError> {
                Ok(TrackedPlayer {
                    handle: row.try_get("handle")?,
                    tag: row.try_get("tag")?,
                    subscriber_id: subscriber_from_db(row.try_get("subscriber_id")?)?,
                })
            })
            .collect()
    }

    async fn ingest(&self, record: &MatchRecord) -> Result<Vec<SubscriberId>, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO match_stats (
                hash, provider_match_id, handle, tag, agent, game_score,
                kills, deaths, assists, damage_delta, headshot_percentage,
                adr, acs, team_placement, map_name, match_result, kd_ratio
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (hash) DO NOTHING
            RETURNING hash
            "#,
        )
        .bind(&record.id)
        .bind(&record.provider_match_id)
        .bind(&record.handle)
        .bind(&record.tag)
        .bind(&record.agent)
        .bind(&record.game_score)
        .bind(record.kills)
        .bind(record.deaths)
        .bind(record.assists)
        .bind(record.damage_delta)
        .bind(record.headshot_percentage)
        .bind(record.adr)
        .bind(record.acs)
        .bind(i32::try_from(record.team_placement).unwrap_or(i32::MAX))
        .bind(&record.map_name)
        .bind(&record.match_result)
        .bind(record.kd_ratio())
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            debug!(record = %record.id, "match already recorded");
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT subscriber_id
              FROM tracked_players
             WHERE handle = $1 AND tag = $2
             ORDER BY tracked_at, hash
            "#,
        )
        .bind(&record.handle)
        .bind(&record.tag)
        .fetch_all(&self.pool)
        .await?;

        let subscribers = rows
            .iter()
            .map(|row| subscriber_from_db(row.try_get("subscriber_id")?))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            player = %record.player(),
            record = %record.id,
            subscribers = subscribers.len(),
            "new match recorded"
        );
        Ok(subscribers)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("match store connection closed");
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tracked: Vec<(String, TrackedPlayer)>,
    records: HashMap<String, MatchRecord>,
    closed: bool,
}

/// Process-local store with the same uniqueness semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    state: Mutex<MemoryState>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn register(&self, player: &TrackedPlayer) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let hash = player.identity_hash();
        if state.tracked.iter().any(|(h, _)| *h == hash) {
            return Ok(false);
        }
        state.tracked.push((hash, player.clone()));
        Ok(true)
    }

    async fn unregister(&self, player: &PlayerRef, subscriber: SubscriberId) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let hash = tracked_identity(&player.handle, &player.tag, subscriber);
        let before = state.tracked.len();
        state.tracked.retain(|(h, _)| *h != hash);
        Ok(state.tracked.len() < before)
    }

    async fn tracked_players(&self) -> Result<Vec<PlayerRef>, StoreError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        let mut players: Vec<PlayerRef> = Vec::new();
        for (_, tracked) in &state.tracked {
            let player = tracked.player();
            if !players.contains(&player) {
                players.push(player);
            }
        }
        Ok(players)
    }

    async fn subscriptions(&self, subscriber: SubscriberId) -> Result<Vec<TrackedPlayer>, StoreError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state
            .tracked
            .iter()
            .filter(|(_, t)| t.subscriber_id == subscriber)
            .map(|(_, t)| t.clone())
            .collect())
    }

    async fn ingest(&self, record: &MatchRecord) -> Result<Vec<SubscriberId>, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::Closed);
        }
        if state.records.contains_key(&record.id) {
            return Ok(Vec::new());
        }
        state.records.insert(record.id.clone(), record.clone());
        Ok(state
            .tracked
            .iter()
            .filter(|(_, t)| t.handle == record.handle && t.tag == record.tag)
            .map(|(_, t)| t.subscriber_id)
            .collect())
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use valtrack_core::match_identity;

    fn record(match_id: &str, handle: &str, tag: &str) -> MatchRecord {
        MatchRecord {
            id: match_identity(match_id, handle, tag),
            provider_match_id: match_id.to_string(),
            handle: handle.to_string(),
            tag: tag.to_string(),
            agent: "Jett".into(),
            game_score: "13-11".into(),
            kills: 20,
            deaths: 10,
            assists: 4,
            damage_delta: 900,
            headshot_percentage: 25.0,
            adr: 160.0,
            acs: 240.0,
            team_placement: 1,
            map_name: Some("Ascent".into()),
            match_result: Some("Victory".into()),
        }
    }

    fn tracked(handle: &str, tag: &str, sub: u64) -> TrackedPlayer {
        TrackedPlayer::new(PlayerRef::new(handle, tag), SubscriberId(sub))
    }

    async fn exercise_store(store: &dyn MatchStore, p: &str, q: &str) {
        for sub in [11, 12, 13] {
            assert!(store.register(&tracked(p, "NA1", sub)).await.unwrap());
        }
        assert!(store.register(&tracked(q, "EU1", 21)).await.unwrap());
        assert!(!store.register(&tracked(p, "NA1", 11)).await.unwrap());

        let players = store
            .tracked_players()
            .await
            .unwrap()
            .into_iter()
            .filter(|player| player.handle == p || player.handle == q)
            .collect::<Vec<_>>();
        assert_eq!(
            players,
            vec![PlayerRef::new(p, "NA1"), PlayerRef::new(q, "EU1")]
        );

        let first = store.ingest(&record("m-1", p, "NA1")).await.unwrap();
        let first: HashSet<_> = first.into_iter().collect();
        assert_eq!(
            first,
            HashSet::from([SubscriberId(11), SubscriberId(12), SubscriberId(13)])
        );
        assert!(store.ingest(&record("m-1", p, "NA1")).await.unwrap().is_empty());
        assert!(store.ingest(&record("m-1", p, "NA1")).await.unwrap().is_empty());

        assert_eq!(
            store.ingest(&record("m-1", q, "EU1")).await.unwrap(),
            vec![SubscriberId(21)]
        );

        assert_eq!(store.subscriptions(SubscriberId(12)).await.unwrap().len(), 1);
        assert!(store.unregister(&PlayerRef::new(p, "NA1"), SubscriberId(12)).await.unwrap());
        assert!(!store.unregister(&PlayerRef::new(p, "NA1"), SubscriberId(12)).await.unwrap());
        assert!(store.subscriptions(SubscriberId(12)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_dedups_and_fans_out() {
        let store = MemoryMatchStore::new();
        exercise_store(&store, "Fruit", "Other").await;
        assert_eq!(store.record_count().await, 2);
    }

    #[tokio::test]
    async fn memory_store_has_single_winner_for_concurrent_ingest() {
        let store = Arc::new(MemoryMatchStore::new());
        store.register(&tracked("Fruit", "NA1", 1)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.ingest(&record("m-race", "Fruit", "NA1")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if !handle.await.unwrap().is_empty() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_use_after_close() {
        let store = MemoryMatchStore::new();
        store.close().await;
        assert!(store.is_closed().await);
        assert!(matches!(
            store.tracked_players().await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn postgres_store_dedups_and_fans_out() {
        let Ok(url) = std::env::var("VALTRACK_TEST_DATABASE_URL") else {
            eprintln!("VALTRACK_TEST_DATABASE_URL not set; skipping postgres store test");
            return;
        };
        let store = PgMatchStore::connect(&url, 2).await.expect("connect");
        store.migrate().await.expect("migrate");

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let p = format!("P{suffix}");
        let q = format!("Q{suffix}");
        exercise_store(&store, &p, &q).await;
        store.close().await;
    }
}
