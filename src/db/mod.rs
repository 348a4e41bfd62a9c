//! Durable order-history store: the single source of truth preventing
//! duplicate execution.
//!
//! One record per symbol holding the last-seen order identifiers and the
//! follow state, plus an append-only event log. All mutations come from the
//! tick (one logical writer); writes are awaited so a crash between order
//! placement and history update cannot re-issue filled entries on restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::str::FromStr;

use crate::models::MirrorEvent;

/// Follow state of a symbol in the history store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowState {
    /// Never followed, or reset after an exit with re-entry permitted
    Unfollowed,
    /// Entry order confirmed; the position mirrors the agent's
    Following,
    /// The agent closed and we mirrored the close; identifiers retained
    Exited,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unfollowed => "UNFOLLOWED",
            Self::Following => "FOLLOWING",
            Self::Exited => "EXITED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "FOLLOWING" => Self::Following,
            "EXITED" => Self::Exited,
            _ => Self::Unfollowed,
        }
    }
}

impl std::fmt::Display for FollowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-symbol history record.
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub symbol: String,
    pub entry_oid: Option<String>,
    pub tp_oid: Option<String>,
    pub sl_oid: Option<String>,
    pub state: FollowState,
    pub updated_at: DateTime<Utc>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct HistoryRow {
    symbol: String,
    entry_oid: Option<String>,
    tp_oid: Option<String>,
    sl_oid: Option<String>,
    state: String,
    updated_at: DateTime<Utc>,
    last_event_at: Option<DateTime<Utc>>,
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        Self {
            symbol: row.symbol,
            entry_oid: row.entry_oid,
            tp_oid: row.tp_oid,
            sl_oid: row.sl_oid,
            state: FollowState::parse(&row.state),
            updated_at: row.updated_at,
            last_event_at: row.last_event_at,
        }
    }
}

/// Stored mirror event, as read back for status/history views.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: String,
    pub symbol: String,
    pub kind: String,
    pub side: Option<String>,
    pub price: Option<String>,
    pub order_id: Option<String>,
    pub detail: String,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredEvent {
    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.as_deref().and_then(|p| Decimal::from_str(p).ok())
    }
}

/// SQLite-backed history store.
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open (or create) the store and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_history (
                symbol TEXT PRIMARY KEY,
                entry_oid TEXT,
                tp_oid TEXT,
                sl_oid TEXT,
                state TEXT NOT NULL DEFAULT 'UNFOLLOWED',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                last_event_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                side TEXT,
                price TEXT,
                order_id TEXT,
                detail TEXT NOT NULL DEFAULT '',
                dry_run INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_symbol ON events(symbol)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Order History ====================

    /// Current record for a symbol, if one exists.
    pub async fn record(&self, symbol: &str) -> Result<Option<HistoryRecord>> {
        let row: Option<HistoryRow> =
            sqlx::query_as("SELECT * FROM order_history WHERE symbol = ?")
                .bind(symbol)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read history record")?;

        Ok(row.map(HistoryRecord::from))
    }

    /// All records, ordered by symbol.
    pub async fn all_records(&self) -> Result<Vec<HistoryRecord>> {
        let rows: Vec<HistoryRow> =
            sqlx::query_as("SELECT * FROM order_history ORDER BY symbol")
                .fetch_all(&self.pool)
                .await
                .context("Failed to read history records")?;

        Ok(rows.into_iter().map(HistoryRecord::from).collect())
    }

    /// Atomically replace a symbol's record.
    pub async fn upsert_record(
        &self,
        symbol: &str,
        entry_oid: &str,
        tp_oid: Option<&str>,
        sl_oid: Option<&str>,
        state: FollowState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO order_history (symbol, entry_oid, tp_oid, sl_oid, state, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(symbol) DO UPDATE SET
                entry_oid = excluded.entry_oid,
                tp_oid = excluded.tp_oid,
                sl_oid = excluded.sl_oid,
                state = excluded.state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(symbol)
        .bind(entry_oid)
        .bind(tp_oid)
        .bind(sl_oid)
        .bind(state.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to upsert history record")?;

        Ok(())
    }

    /// Clear a symbol's identifiers and tag it UNFOLLOWED. The row and its
    /// accumulated event timestamps survive.
    pub async fn reset_record(&self, symbol: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE order_history SET
                entry_oid = NULL,
                tp_oid = NULL,
                sl_oid = NULL,
                state = 'UNFOLLOWED',
                updated_at = ?
            WHERE symbol = ?
            "#,
        )
        .bind(Utc::now())
        .bind(symbol)
        .execute(&self.pool)
        .await
        .context("Failed to reset history record")?;

        Ok(())
    }

    /// Change only the follow-state tag, keeping stored identifiers.
    pub async fn mark_state(&self, symbol: &str, state: FollowState) -> Result<()> {
        sqlx::query("UPDATE order_history SET state = ?, updated_at = ? WHERE symbol = ?")
            .bind(state.as_str())
            .bind(Utc::now())
            .bind(symbol)
            .execute(&self.pool)
            .await
            .context("Failed to update follow state")?;

        Ok(())
    }

    // ==================== Events ====================

    /// Append a mirror event. Events are never updated or deleted.
    pub async fn insert_event(&self, event: &MirrorEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, symbol, kind, side, price, order_id, detail, dry_run, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.symbol)
        .bind(event.kind.as_str())
        .bind(event.side.map(|s| s.as_str()))
        .bind(event.price.map(|p| p.to_string()))
        .bind(&event.order_id)
        .bind(&event.detail)
        .bind(event.dry_run)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to insert event")?;

        sqlx::query("UPDATE order_history SET last_event_at = ? WHERE symbol = ?")
            .bind(event.timestamp)
            .bind(&event.symbol)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        sqlx::query_as::<_, StoredEvent>(
            "SELECT * FROM events ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch events")
    }

    /// Total number of recorded events.
    pub async fn event_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, MirrorEvent};

    async fn store() -> HistoryStore {
        HistoryStore::new("sqlite::memory:").await.expect("in-memory store")
    }

    #[tokio::test]
    async fn upsert_then_read() {
        let store = store().await;

        store
            .upsert_record("BTCUSDT", "e-1", Some("t-1"), None, FollowState::Following)
            .await
            .unwrap();

        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.entry_oid.as_deref(), Some("e-1"));
        assert_eq!(rec.tp_oid.as_deref(), Some("t-1"));
        assert_eq!(rec.state, FollowState::Following);

        // Replace wholesale
        store
            .upsert_record("BTCUSDT", "e-2", None, None, FollowState::Following)
            .await
            .unwrap();
        let rec = store.record("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(rec.entry_oid.as_deref(), Some("e-2"));
        assert_eq!(rec.tp_oid, None);
    }

    #[tokio::test]
    async fn reset_clears_ids_but_keeps_row() {
        let store = store().await;

        store
            .upsert_record("ETHUSDT", "e-9", None, None, FollowState::Following)
            .await
            .unwrap();
        store
            .insert_event(&MirrorEvent::new("ETHUSDT", EventKind::Entered))
            .await
            .unwrap();
        store.reset_record("ETHUSDT").await.unwrap();

        let rec = store.record("ETHUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Unfollowed);
        assert_eq!(rec.entry_oid, None);
        assert!(rec.last_event_at.is_some());
    }

    #[tokio::test]
    async fn mark_state_keeps_identifiers() {
        let store = store().await;

        store
            .upsert_record("SOLUSDT", "e-3", None, None, FollowState::Following)
            .await
            .unwrap();
        store.mark_state("SOLUSDT", FollowState::Exited).await.unwrap();

        let rec = store.record("SOLUSDT").await.unwrap().unwrap();
        assert_eq!(rec.state, FollowState::Exited);
        assert_eq!(rec.entry_oid.as_deref(), Some("e-3"));
    }

    #[tokio::test]
    async fn events_append_only() {
        let store = store().await;

        store
            .insert_event(&MirrorEvent::new("BTCUSDT", EventKind::Entered))
            .await
            .unwrap();
        store
            .insert_event(&MirrorEvent::new("BTCUSDT", EventKind::ProfitExit))
            .await
            .unwrap();

        assert_eq!(store.event_count().await.unwrap(), 2);
        let events = store.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 2);
    }
}
