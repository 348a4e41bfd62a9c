//! Agent Mirror
//!
//! Follows a remote agent's simulated leveraged-futures positions and
//! reissues them on a real exchange account, with deduplicated order
//! issuance and account-level exit triggers.

mod api;
mod bot;
mod config;
mod db;
mod engine;
mod models;
mod notify;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{FuturesClient, SignalClient, SignalSource};
use crate::bot::Bot;
use crate::config::MirrorConfig;
use crate::db::HistoryStore;

/// Agent mirroring CLI.
#[derive(Parser)]
#[command(name = "agentmirror")]
#[command(about = "Mirror an agent's futures positions onto an exchange account", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./agentmirror.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List followable agents on the signal feed
    Agents,

    /// Start mirroring an agent
    Run {
        /// Agent identifier to follow
        #[arg(short, long)]
        agent: String,

        /// Total margin pool in USDT, split across open symbols
        #[arg(short, long, conflicts_with = "fixed_margin")]
        margin: Option<f64>,

        /// Fixed margin per symbol instead of the shared pool
        #[arg(long)]
        fixed_margin: Option<f64>,

        /// Polling interval in seconds; omit to run a single pass
        #[arg(short, long)]
        interval: Option<u64>,

        /// Snapshot marker to replay a fixed point in time
        #[arg(long)]
        marker: Option<String>,

        /// Max deviation from the agent's entry price, in percent
        #[arg(long, default_value = "1.0")]
        tolerance: f64,

        /// Close at this leveraged return, in percent
        #[arg(long)]
        profit_target: Option<f64>,

        /// Re-enter a symbol after it was closed manually
        #[arg(long)]
        auto_refollow: bool,

        /// Log intents without placing orders
        #[arg(long)]
        dry_run: bool,

        /// Suppress the console blotter; structured logs only
        #[arg(long, short)]
        quiet: bool,

        /// Use the exchange testnet
        #[arg(long)]
        testnet: bool,
    },

    /// Show per-symbol follow state
    Status,

    /// Show recent mirror events
    History {
        /// Number of events to show
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Agents => {
            let client = SignalClient::new()?;
            let agents = client.list_agents().await?;

            println!("\n{:<24} {:<32}", "ID", "NAME");
            println!("{}", "-".repeat(56));
            for agent in agents {
                println!("{:<24} {:<32}", agent.id, agent.name);
            }
        }

        Commands::Run {
            agent,
            margin,
            fixed_margin,
            interval,
            marker,
            tolerance,
            profit_target,
            auto_refollow,
            dry_run,
            quiet,
            testnet,
        } => {
            let mut config = MirrorConfig {
                agent_id: agent,
                poll_interval_secs: interval,
                dry_run,
                database_url: cli.database.clone(),
                snapshot_marker: marker,
                price_tolerance_percent: Decimal::try_from(tolerance)?,
                auto_re_follow: auto_refollow,
                quiet,
                testnet,
                ..MirrorConfig::default()
            };
            if let Some(pool) = margin {
                config.total_margin = Decimal::try_from(pool)?;
            }
            if let Some(amount) = fixed_margin {
                config.fixed_margin_per_coin = Some(Decimal::try_from(amount)?);
            }
            if let Some(target) = profit_target {
                config.profit_target_percent = Some(Decimal::try_from(target)?);
            }
            config.apply_env()?;

            let signal = Arc::new(SignalClient::new()?);
            let source = signal.clone();
            let exchange = Arc::new(FuturesClient::from_env(config.testnet)?);

            println!("\n=== Agent Mirror ===");
            println!("Agent:            {}", config.agent_id);
            match config.poll_interval_secs {
                Some(secs) => println!("Polling interval: {}s", secs),
                None => println!("Polling interval: single pass"),
            }
            match config.fixed_margin_per_coin {
                Some(amount) => println!("Funding:          fixed ${} per symbol", amount),
                None => println!("Funding:          ${} pool", config.total_margin),
            }
            println!(
                "Mode:             {}",
                if config.dry_run { "RISK ONLY (no orders)" } else { "LIVE ORDERS" }
            );
            if config.poll_interval_secs.is_some() {
                println!("\nPress Ctrl+C to stop.\n");
            }

            let mut bot = Bot::new(config, source, exchange).await?;
            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            let cache = signal.stats().await;
            info!(hits = cache.hits, misses = cache.misses, "Feed cache stats");

            println!("\n{}", bot.stats());
        }

        Commands::Status => {
            let store = HistoryStore::new(&cli.database).await?;
            let records = store.all_records().await?;

            if records.is_empty() {
                println!("No symbols tracked yet. Use 'agentmirror run' to start.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<12} {:<24} {:<20}",
                "SYMBOL", "STATE", "ENTRY OID", "UPDATED"
            );
            println!("{}", "-".repeat(68));
            for rec in records {
                println!(
                    "{:<12} {:<12} {:<24} {:<20}",
                    rec.symbol,
                    rec.state.as_str(),
                    rec.entry_oid.as_deref().unwrap_or("-"),
                    rec.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }

            let events = store.event_count().await?;
            println!("\nTotal events: {}", events);
        }

        Commands::History { limit } => {
            let store = HistoryStore::new(&cli.database).await?;
            let events = store.recent_events(i64::from(limit)).await?;

            if events.is_empty() {
                println!("No events recorded yet.");
                return Ok(());
            }

            println!(
                "\n{:<20} {:<12} {:<18} {:<10} {}",
                "TIME", "SYMBOL", "EVENT", "PRICE", "DETAIL"
            );
            println!("{}", "-".repeat(84));
            for event in events {
                let price = event
                    .price_decimal()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<20} {:<12} {:<18} {:<10} {}",
                    event.created_at.format("%Y-%m-%d %H:%M:%S"),
                    event.symbol,
                    event.kind,
                    price,
                    event.detail
                );
            }
        }
    }

    info!("Done");
    Ok(())
}
