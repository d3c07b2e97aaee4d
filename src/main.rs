use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use perpbot::cache::{CacheStore, InMemoryCacheStore, RedisCacheStore};
use perpbot::config::Settings;
use perpbot::execution::{PaperExchange, PositionManager};
use perpbot::indicators::IndicatorEngine;
use perpbot::market_data::{
    BinanceFuturesClient, MarketDataProvider, MarketScenario, SyntheticMarketData,
};
use perpbot::models::Direction;
use perpbot::risk::LiquidationRiskModel;
use perpbot::{ExitEngine, IndicatorCache};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perpbot", version, about = "Perpetual futures exit engine")]
struct Cli {
    /// Config file (extension optional)
    #[arg(long, global = true, default_value = perpbot::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the configured paper positions and watch them until they exit
    Run,
    /// Print liquidation price and exit threshold for a position
    Liquidation {
        #[arg(long)]
        entry: f64,
        #[arg(long)]
        leverage: f64,
        #[arg(long, default_value = "long")]
        direction: Direction,
        #[arg(long)]
        safety_margin: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)?;

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Liquidation {
            entry,
            leverage,
            direction,
            safety_margin,
        } => {
            let model = LiquidationRiskModel::new(
                safety_margin.unwrap_or(settings.safety_margin_percent),
            )?;
            let liquidation = LiquidationRiskModel::liquidation_price(entry, leverage, direction)?;

            println!("{} entry {:.2} at {}x", direction, entry, leverage);
            println!("  liquidation price: {:.2}", liquidation);
            println!(
                "  exit threshold:    {:.2} ({:.1}% margin)",
                model.exit_threshold(liquidation, direction),
                model.safety_margin_percent() * 100.0
            );
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("Starting perpbot");

    let market = create_market_data(&settings)?;
    let store = create_cache_store(&settings).await;
    let fetch_timeout = Duration::from_secs(settings.fetch_timeout_secs);

    let cache = Arc::new(
        IndicatorCache::new(store, market.clone(), IndicatorEngine::default())
            .with_window(settings.candle_window)
            .with_fetch_timeout(fetch_timeout),
    );
    let positions = Arc::new(PositionManager::new(settings.trailing_percent));
    let exchange = Arc::new(PaperExchange::new());
    let risk = LiquidationRiskModel::new(settings.safety_margin_percent)?;
    let every = Duration::from_secs(settings.eval_interval_secs);

    tracing::info!(
        bots = settings.bots.len(),
        interval_secs = settings.eval_interval_secs,
        candle_window = settings.candle_window,
        safety_margin = settings.safety_margin_percent,
        "Configuration loaded"
    );

    let mut loops = JoinSet::new();
    for bot in settings.bots {
        let engine = ExitEngine::new(
            market.clone(),
            cache.clone(),
            positions.clone(),
            exchange.clone(),
            bot.exit_chain(risk),
            bot.timeframe,
        )
        .with_price_timeout(fetch_timeout);

        if let Err(e) = engine
            .enter_position(&bot.symbol, bot.direction, bot.quantity, bot.leverage)
            .await
        {
            tracing::error!(
                symbol = %bot.symbol,
                direction = %bot.direction,
                error = %e,
                "Failed to open position"
            );
            continue;
        }

        loops.spawn(async move {
            let closed = engine.run_until_closed(&bot.symbol, bot.direction, every).await;
            (bot.symbol, bot.direction, closed)
        });
    }

    if loops.is_empty() {
        anyhow::bail!("No positions could be opened");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(
                    open = positions.open_positions().len(),
                    "Received Ctrl+C, shutting down"
                );
                loops.abort_all();
                break;
            }
            finished = loops.join_next() => match finished {
                Some(Ok((symbol, direction, Some(closed)))) => {
                    tracing::info!(
                        symbol = %symbol,
                        direction = %direction,
                        exit_price = closed.exit_price,
                        pnl = closed.realized_pnl,
                        reason = ?closed.exit_reason,
                        "Bot finished"
                    );
                }
                Some(Ok((symbol, direction, None))) => {
                    tracing::warn!(
                        symbol = %symbol,
                        direction = %direction,
                        "Position disappeared"
                    );
                }
                Some(Err(e)) => tracing::error!(error = %e, "Bot loop panicked"),
                None => break,
            },
        }
    }

    tracing::info!(orders = exchange.orders().len(), "perpbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("perpbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_market_data(settings: &Settings) -> Result<Arc<dyn MarketDataProvider>> {
    match &settings.market_data_base_url {
        Some(base_url) => {
            let client = BinanceFuturesClient::with_base_url(
                base_url,
                Duration::from_secs(settings.fetch_timeout_secs),
            )
            .context("Failed to create Binance client")?;
            tracing::info!(base_url = %base_url, "Using Binance futures market data");
            Ok(Arc::new(client))
        }
        None => {
            let scenario: MarketScenario = settings
                .synthetic_scenario
                .parse()
                .map_err(anyhow::Error::msg)?;
            tracing::info!(
                seed = settings.synthetic_seed,
                scenario = ?scenario,
                "Using synthetic market data"
            );
            Ok(Arc::new(SyntheticMarketData::new(
                settings.synthetic_seed,
                scenario,
                settings.synthetic_base_price,
            )))
        }
    }
}

/// Redis when configured and reachable, otherwise the in-memory store
async fn create_cache_store(settings: &Settings) -> Arc<dyn CacheStore> {
    let Some(redis_url) = &settings.redis_url else {
        tracing::info!("Using in-memory indicator cache");
        return Arc::new(InMemoryCacheStore::new());
    };

    match RedisCacheStore::new(redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, falling back to in-memory cache");
            Arc::new(InMemoryCacheStore::new())
        }
    }
}
