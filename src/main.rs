use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tradeguard::broker::{BarSource, Broker, DryRunBroker, HttpBroker};
use tradeguard::cache::{spawn_refreshers, MarketDataCache};
use tradeguard::config::Settings;
use tradeguard::execution::{restore_exit_states, Arbiter, CommandInbox, ExitController, OcoMonitor};
use tradeguard::feed::{pump_broker_quotes, ExchangeTicker, FeedSynchronizer};
use tradeguard::indicators::VolatilityEstimator;
use tradeguard::notify::{notifier_from_config, NotificationDispatcher};
use tradeguard::persistence::{MemoryStateStore, RedisStateStore, StateStore};
use tradeguard::{ControlCommand, Intent, OrderId, Owner, Ticket};
use uuid::Uuid;

const TICK_CHANNEL_SIZE: usize = 1024;
const FEED_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "tradeguard", version, about = "Autonomous exit management for open positions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every background loop until Ctrl+C
    Run {
        /// Config file (TOML); environment variables override it
        #[arg(long)]
        config: Option<String>,
        /// Log broker mutations instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print persisted exit states and OCO pairs
    Status {
        #[arg(long)]
        config: Option<String>,
    },
    /// Linked order pairs in the running service
    Oco {
        #[arg(long)]
        config: Option<String>,
        #[command(subcommand)]
        action: OcoAction,
    },
    /// Record the trade intent behind a ticket that is about to open
    Intent {
        #[arg(long)]
        config: Option<String>,
        ticket: Ticket,
        /// Intent as JSON, e.g. '{"symbol":"XAUUSD","direction":"Buy","entry":2000,"stop_loss":1990,"take_profit":2020,"strategy_tag":"scalper"}'
        intent: String,
    },
    /// Tag a ticket that is about to open with its strategy
    Tag {
        #[arg(long)]
        config: Option<String>,
        ticket: Ticket,
        tag: String,
    },
    /// Claim a generically managed ticket for a strategy at its breakeven
    Claim {
        #[arg(long)]
        config: Option<String>,
        ticket: Ticket,
        tag: String,
    },
}

#[derive(Subcommand)]
enum OcoAction {
    /// Watch two pending orders as one-cancels-other
    Register {
        symbol: String,
        order_a: OrderId,
        order_b: OrderId,
    },
    /// Clear a BOTH_FILLED pair after manual review
    Ack { group_id: Uuid },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    match Cli::parse().command {
        Command::Run { config, dry_run } => run(config.as_deref(), dry_run).await,
        Command::Status { config } => status(config.as_deref()).await,
        Command::Oco { config, action } => {
            let command = match action {
                OcoAction::Register {
                    symbol,
                    order_a,
                    order_b,
                } => ControlCommand::RegisterOco {
                    symbol,
                    order_a,
                    order_b,
                },
                OcoAction::Ack { group_id } => ControlCommand::AcknowledgeOco { group_id },
            };
            enqueue(config.as_deref(), command).await
        }
        Command::Intent {
            config,
            ticket,
            intent,
        } => {
            let intent: Intent = serde_json::from_str(&intent)
                .map_err(|e| anyhow::anyhow!("invalid intent JSON: {}", e))?;
            enqueue(config.as_deref(), ControlCommand::RegisterIntent { ticket, intent }).await
        }
        Command::Tag { config, ticket, tag } => {
            enqueue(config.as_deref(), ControlCommand::Preregister { ticket, tag }).await
        }
        Command::Claim { config, ticket, tag } => {
            enqueue(config.as_deref(), ControlCommand::Claim { ticket, tag }).await
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradeguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// One broker handle per component, each with its own backoff state
fn broker_handle(settings: &Settings, name: &str, dry_run: bool) -> anyhow::Result<Arc<dyn Broker>> {
    let http = HttpBroker::new(&settings.broker, name)?;
    Ok(if dry_run {
        Arc::new(DryRunBroker::new(http))
    } else {
        Arc::new(http)
    })
}

async fn connect_store(settings: &Settings) -> Arc<dyn StateStore> {
    match RedisStateStore::new(&settings.redis.url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(
                "Redis unavailable ({}), state will not survive a restart and queued commands cannot arrive",
                e
            );
            Arc::new(MemoryStateStore::new())
        }
    }
}

async fn run(config_path: Option<&str>, dry_run: bool) -> anyhow::Result<()> {
    let settings = Settings::load(config_path)?;

    tracing::info!("🚀 TradeGuard starting");
    tracing::info!("📊 Configuration:");
    tracing::info!("  Broker: {}", settings.broker.base_url);
    tracing::info!("  Symbols: {:?}", settings.cache.symbols);
    tracing::info!("  Timeframes: {:?}", settings.cache.timeframes);
    tracing::info!("  Strategy profiles: {:?}", settings.exit.strategy_profiles.keys().collect::<Vec<_>>());
    if dry_run {
        tracing::warn!("  DRY RUN: broker mutations are logged, not sent");
    }
    for timeframe in settings.volatility.timeframe_set() {
        if !settings.cache.timeframes.contains(&timeframe) {
            tracing::warn!(%timeframe, "Volatility timeframe is not cached, it will never qualify");
        }
    }

    let store = connect_store(&settings).await;
    let (notifier, notify_task) =
        NotificationDispatcher::spawn(notifier_from_config(&settings.notify), &settings.notify);

    // Market data
    let cache = MarketDataCache::new(settings.cache.clone());
    let bar_source: Arc<dyn BarSource> = Arc::new(HttpBroker::new(&settings.broker, "bars")?);
    let refreshers = spawn_refreshers(bar_source, &cache, &settings.cache);

    // Price feeds
    let feed = FeedSynchronizer::new(settings.feed.clone());
    let (tick_tx, tick_rx) = mpsc::channel(TICK_CHANNEL_SIZE);
    let feed_task = tokio::spawn(feed.clone().run(tick_rx));
    let quote_task = tokio::spawn(pump_broker_quotes(
        broker_handle(&settings, "quotes", false)?,
        settings.cache.symbols.clone(),
        Duration::from_millis(settings.broker.quote_poll_ms),
        tick_tx.clone(),
    ));
    match ExchangeTicker::from_config(&settings.exchange, settings.broker.request_timeout()) {
        Some(ticker) => {
            tokio::spawn(ticker.run(
                settings.cache.symbols.clone(),
                Duration::from_millis(settings.exchange.poll_interval_ms),
                tick_tx,
            ));
        }
        None => tracing::warn!("No exchange ticker configured, feed health will stay CRITICAL"),
    }

    tokio::spawn(report_feed_health(feed.clone(), settings.cache.symbols.clone()));

    // Exit management
    let estimator = VolatilityEstimator::new(cache.clone(), settings.volatility.clone());
    let arbiter = Arc::new(Arbiter::new(settings.exit.strategy_profiles.keys().cloned()));

    let generic_broker = broker_handle(&settings, "exit-generic", dry_run)?;
    match restore_exit_states(generic_broker.as_ref(), store.as_ref(), &arbiter).await {
        Ok(count) => tracing::info!("✅ Reconciled {} exit states", count),
        Err(e) => tracing::error!("Exit state reconciliation failed: {}", e),
    }

    let controller = |role: Owner, broker: Arc<dyn Broker>| {
        ExitController::new(
            role,
            broker,
            arbiter.clone(),
            estimator.clone(),
            feed.clone(),
            store.clone(),
            notifier.clone(),
            settings.exit.clone(),
        )
    };
    let generic_task = tokio::spawn(controller(Owner::Generic, generic_broker).run());
    let strategy_task = tokio::spawn(
        controller(
            Owner::StrategySpecific,
            broker_handle(&settings, "exit-strategy", dry_run)?,
        )
        .run(),
    );

    // Linked orders
    let oco = Arc::new(OcoMonitor::new(
        broker_handle(&settings, "oco", dry_run)?,
        store.clone(),
        notifier.clone(),
        Duration::from_secs(settings.oco.poll_interval_secs),
    ));
    if let Err(e) = oco.restore().await {
        tracing::error!("OCO restore failed: {}", e);
    }
    let oco_task = tokio::spawn(oco.clone().run());

    let inbox = CommandInbox::new(store.clone(), arbiter.clone(), oco.clone(), COMMAND_POLL_INTERVAL);
    let inbox_task = tokio::spawn(inbox.run());

    tracing::info!("✅ All loops spawned ({} bar refreshers)", refreshers.len());
    tracing::info!("\nPress Ctrl+C to stop...\n");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        result = generic_task => log_exit("Generic exit controller", result),
        result = strategy_task => log_exit("Strategy exit controller", result),
        result = oco_task => log_exit("OCO monitor", result),
        result = inbox_task => log_exit("Command inbox", result),
        result = feed_task => log_exit("Feed synchronizer", result),
        result = quote_task => log_exit("Quote pump", result),
        result = notify_task => log_exit("Notification delivery", result),
    }

    for refresher in refreshers {
        refresher.abort();
    }
    tracing::info!("👋 TradeGuard stopped");
    Ok(())
}

/// Periodic feed diagnostics
async fn report_feed_health(feed: FeedSynchronizer, symbols: Vec<String>) {
    let mut ticker = tokio::time::interval(FEED_REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        for symbol in &symbols {
            match feed.snapshot(symbol, chrono::Utc::now()) {
                Some(snapshot) => tracing::info!(
                    symbol = %symbol,
                    health = ?snapshot.health,
                    offset = snapshot.estimate.as_ref().map(|e| e.offset),
                    confidence = snapshot.estimate.as_ref().map(|e| e.confidence),
                    outliers = snapshot.outliers_rejected,
                    "📡 Feed status"
                ),
                None => tracing::warn!(symbol = %symbol, "📡 No ticks received yet"),
            }
        }
    }
}

fn log_exit(name: &str, result: Result<(), tokio::task::JoinError>) {
    tracing::error!("{} exited: {:?}", name, result);
}

/// Queue a command for the running service; needs the same Redis as `run`
async fn enqueue(config_path: Option<&str>, command: ControlCommand) -> anyhow::Result<()> {
    let settings = Settings::load(config_path)?;
    let store = RedisStateStore::new(&settings.redis.url).await?;
    store.push_command(&command).await?;
    println!("✅ Queued {:?}", command);
    Ok(())
}

async fn status(config_path: Option<&str>) -> anyhow::Result<()> {
    let settings = Settings::load(config_path)?;
    let store = RedisStateStore::new(&settings.redis.url).await?;

    let states = store.load_exit_states().await?;
    println!("\n═══ Exit states ({}) ═══", states.len());
    for s in &states {
        println!(
            "  #{:<10} {:<10} {:<14} owner={:<17} tag={:<10} failures={} updated={}",
            s.ticket,
            s.symbol,
            s.stage.to_string(),
            s.owner.to_string(),
            s.strategy_tag.as_deref().unwrap_or("-"),
            s.consecutive_failures,
            s.last_update_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let pairs = store.load_oco_pairs().await?;
    println!("\n═══ OCO pairs ({}) ═══", pairs.len());
    for p in &pairs {
        let flag = if p.status == tradeguard::OcoStatus::BothFilled {
            "  ⚠️  MANUAL REVIEW"
        } else {
            ""
        };
        println!(
            "  {} {:<10} {} / {} {}{}",
            p.group_id, p.symbol, p.order_a, p.order_b, p.status, flag
        );
    }
    println!();

    Ok(())
}
