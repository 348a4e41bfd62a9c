//! HTTP adapter for the agent signal feed.
//!
//! Owns a snapshot cache with explicit `invalidate`/`stats` operations so
//! cache lifetime and test isolation stay visible to callers. Transient
//! network failures are retried with exponential backoff before the tick
//! gives up and skips.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use chrono::Utc;
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::{AgentPosition, ExitPlan};

use super::types::{AgentRow, FeedPositionRow, SnapshotResponse};
use super::{AgentMeta, SignalSource};

const SIGNAL_API_BASE: &str = "https://signals.nofx.ai/api";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a "latest" snapshot stays servable from cache. Historical
/// snapshots (explicit marker) never expire; the feed treats them as
/// immutable.
const LIVE_CACHE_TTL: Duration = Duration::from_secs(2);

struct CachedSnapshot {
    fetched_at: Instant,
    positions: BTreeMap<String, AgentPosition>,
}

/// Cache counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Client for the agent signal feed (read-only).
pub struct SignalClient {
    client: Client,
    base_url: String,
    cache: RwLock<HashMap<String, CachedSnapshot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SignalClient {
    /// Create a new signal client with default settings.
    pub fn new() -> Result<Self> {
        Self::with_base_url(SIGNAL_API_BASE.to_string())
    }

    /// Create with custom base URL (for testing).
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            cache: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Drop all cached snapshots.
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }

    /// Current cache counters.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.cache.read().await.len(),
        }
    }

    fn cache_key(agent_id: &str, marker: Option<&str>) -> String {
        match marker {
            Some(m) => format!("{}@{}", agent_id, m),
            None => agent_id.to_string(),
        }
    }

    /// GET with exponential backoff on transport errors and 5xx.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(15)),
            ..Default::default()
        };

        let body = backoff::future::retry(policy, || async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))?;

            let status = response.status();
            if status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                warn!(url = %url, status = %status, "Feed returned server error, retrying");
                return Err(backoff::Error::transient(anyhow::anyhow!(
                    "Feed request failed: {} - {}",
                    status,
                    text
                )));
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(backoff::Error::permanent(anyhow::anyhow!(
                    "Feed request failed: {} - {}",
                    status,
                    text
                )));
            }

            response
                .text()
                .await
                .map_err(|e| backoff::Error::transient(anyhow::Error::from(e)))
        })
        .await?;

        serde_json::from_str(&body).context("Failed to parse feed response")
    }

    fn convert_row(row: FeedPositionRow) -> Option<AgentPosition> {
        if row.quantity.is_zero() {
            return None;
        }

        let exit_plan = row
            .exit_plan
            .map(|p| ExitPlan {
                profit_target: p.profit_target,
                stop_loss: p.stop_loss,
                invalidation: p.invalidation,
            })
            .unwrap_or_default();

        Some(AgentPosition {
            symbol: row.symbol,
            quantity: row.quantity,
            entry_price: row.entry_price,
            leverage: row.leverage,
            mark_price: row.current_price,
            unrealized_pnl: row.unrealized_pnl,
            margin: row.margin,
            entry_oid: row.entry_oid,
            tp_oid: row.tp_oid,
            sl_oid: row.sl_oid,
            exit_plan,
            observed_at: Utc::now(),
        })
    }
}

#[async_trait]
impl SignalSource for SignalClient {
    async fn fetch_snapshot(
        &self,
        agent_id: &str,
        marker: Option<&str>,
    ) -> Result<BTreeMap<String, AgentPosition>> {
        let key = Self::cache_key(agent_id, marker);

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(&key) {
                let fresh = marker.is_some() || cached.fetched_at.elapsed() < LIVE_CACHE_TTL;
                if fresh {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(cached.positions.clone());
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let mut url = format!("{}/agents/{}/positions", self.base_url, agent_id);
        if let Some(m) = marker {
            url = format!("{}?marker={}", url, m);
        }

        debug!(url = %url, "Fetching agent snapshot");

        let response: SnapshotResponse = self.get_json(&url).await?;

        let positions: BTreeMap<String, AgentPosition> = response
            .positions
            .into_iter()
            .filter_map(Self::convert_row)
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let mut cache = self.cache.write().await;
        cache.insert(
            key,
            CachedSnapshot {
                fetched_at: Instant::now(),
                positions: positions.clone(),
            },
        );

        Ok(positions)
    }

    async fn list_agents(&self) -> Result<Vec<AgentMeta>> {
        let url = format!("{}/agents", self.base_url);

        debug!(url = %url, "Fetching agent list");

        let rows: Vec<AgentRow> = self.get_json(&url).await?;

        Ok(rows
            .into_iter()
            .map(|r| AgentMeta {
                id: r.id,
                name: r.name,
            })
            .collect())
    }
}
