//! Mirror bot: the polling scheduler that drives one reconciliation pass
//! per tick. Ticks never overlap; a slow pass delays the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::api::{Exchange, SignalSource};
use crate::config::MirrorConfig;
use crate::db::{FollowState, HistoryStore};
use crate::engine::{CapitalAllocator, ExecutionMode, ExitMonitor, OrderExecutor, SignalDetector};
use crate::notify::Notifier;

/// Counters accumulated over the bot's lifetime.
#[derive(Debug, Clone, Default)]
pub struct BotStats {
    pub ticks: u64,
    pub actions_executed: u64,
    pub feed_failures: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Mirror Bot Stats ===")?;
        writeln!(f, "Ticks:         {}", self.ticks)?;
        writeln!(f, "Actions:       {}", self.actions_executed)?;
        writeln!(f, "Feed failures: {}", self.feed_failures)?;
        if let Some(t) = self.started_at {
            writeln!(f, "Started:       {}", t.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        if let Some(t) = self.last_tick_at {
            writeln!(f, "Last tick:     {}", t.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        Ok(())
    }
}

/// What a single tick did.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub actions: usize,
    pub followed: usize,
    /// Snapshot unavailable; nothing was decided this tick
    pub skipped: bool,
}

pub struct Bot {
    config: MirrorConfig,
    source: Arc<dyn SignalSource>,
    exchange: Arc<dyn Exchange>,
    store: HistoryStore,
    detector: SignalDetector,
    allocator: CapitalAllocator,
    executor: OrderExecutor,
    monitor: ExitMonitor,
    notifier: Notifier,
    running: Arc<AtomicBool>,
    stats: BotStats,
}

impl Bot {
    pub async fn new(
        config: MirrorConfig,
        source: Arc<dyn SignalSource>,
        exchange: Arc<dyn Exchange>,
    ) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let store = HistoryStore::new(&config.database_url)
            .await
            .context("Failed to open history store")?;

        let mode = if config.dry_run {
            ExecutionMode::DryRun
        } else {
            ExecutionMode::Live
        };

        let detector = SignalDetector::new(config.auto_re_follow);
        let allocator = CapitalAllocator::new(config.funding_mode());
        let executor = OrderExecutor::new(
            exchange.clone(),
            mode,
            config.margin_mode,
            config.price_tolerance_percent,
        );
        let monitor = ExitMonitor::new(
            exchange.clone(),
            mode,
            config.profit_target_percent,
            config.auto_re_follow,
        );
        let notifier = Notifier::new(config.quiet);

        Ok(Self {
            config,
            source,
            exchange,
            store,
            detector,
            allocator,
            executor,
            monitor,
            notifier,
            running: Arc::new(AtomicBool::new(false)),
            stats: BotStats::default(),
        })
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn stats(&self) -> &BotStats {
        &self.stats
    }

    /// Poll until shutdown, or run a single pass when no interval is
    /// configured. Tick errors are logged and the loop continues; only
    /// startup errors escape.
    pub async fn run(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.stats.started_at = Some(Utc::now());

        let Some(interval_secs) = self.config.poll_interval_secs else {
            info!(agent = %self.config.agent_id, "Running single reconciliation pass");
            let outcome = self.tick().await?;
            self.notifier.tick_summary(1, outcome.actions, outcome.followed);
            return Ok(());
        };

        let running = self.running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                running.store(false, Ordering::SeqCst);
            }
        });

        info!(
            agent = %self.config.agent_id,
            interval_secs,
            dry_run = self.config.dry_run,
            "Mirror bot started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            match self.tick().await {
                Ok(outcome) => {
                    if !outcome.skipped {
                        self.notifier
                            .tick_summary(self.stats.ticks, outcome.actions, outcome.followed);
                    }
                }
                Err(e) => {
                    // History write failed mid-tick; state on disk is still
                    // consistent, so the next tick re-derives the rest
                    error!(error = %e, "Tick aborted");
                }
            }
        }

        info!("Mirror bot stopped");
        Ok(())
    }

    /// One reconciliation pass: fetch, classify, fund, execute, then sweep
    /// exit triggers.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.stats.ticks += 1;
        self.stats.last_tick_at = Some(Utc::now());

        let snapshot = match self
            .source
            .fetch_snapshot(&self.config.agent_id, self.config.snapshot_marker.as_deref())
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Snapshot fetch failed, skipping tick");
                self.stats.feed_failures += 1;
                return Ok(TickOutcome {
                    skipped: true,
                    ..TickOutcome::default()
                });
            }
        };

        let records: HashMap<String, _> = self
            .store
            .all_records()
            .await?
            .into_iter()
            .map(|r| (r.symbol.clone(), r))
            .collect();

        let plans = self.detector.build_plans(&records, &snapshot);

        let funded_symbols: Vec<String> = plans
            .iter()
            .filter(|p| p.needs_capital())
            .map(|p| p.symbol.clone())
            .collect();

        let balance = if self.allocator.needs_balance() && !funded_symbols.is_empty() {
            match self.exchange.available_balance().await {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "Balance unavailable, skipping tick");
                    return Ok(TickOutcome {
                        skipped: true,
                        ..TickOutcome::default()
                    });
                }
            }
        } else {
            Decimal::ZERO
        };

        let allocations = self.allocator.allocate(&funded_symbols, balance);

        let mut actions = 0;
        for plan in &plans {
            let margin = allocations
                .get(&plan.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);

            if let Some(event) = self.executor.execute(&self.store, plan, margin).await? {
                self.notifier.announce(&event);
                actions += 1;
            }
        }

        for event in self.monitor.check(&self.store, &snapshot).await? {
            self.notifier.announce(&event);
            actions += 1;
        }

        self.stats.actions_executed += actions as u64;

        let followed = self
            .store
            .all_records()
            .await?
            .iter()
            .filter(|r| r.state == FollowState::Following)
            .count();

        Ok(TickOutcome {
            actions,
            followed,
            skipped: false,
        })
    }
}
