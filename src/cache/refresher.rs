use super::MarketDataCache;
use crate::broker::BarSource;
use crate::config::CacheConfig;
use crate::models::{Bar, Timeframe};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Start of the next bar for `timeframe` strictly after `now`
pub fn next_bar_boundary(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    let period = timeframe.seconds();
    let ts = now.timestamp();
    let next = (ts.div_euclid(period) + 1) * period;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}

/// Keeps one (symbol, timeframe) series of the cache fresh.
///
/// Polls on the series' own bar period, aligned to the bar boundary plus a
/// settle delay, so slow series are never polled at a fast cadence.
pub struct BarRefresher {
    source: Arc<dyn BarSource>,
    cache: MarketDataCache,
    symbol: String,
    timeframe: Timeframe,
    settle_delay: Duration,
}

impl BarRefresher {
    pub fn new(
        source: Arc<dyn BarSource>,
        cache: MarketDataCache,
        symbol: String,
        timeframe: Timeframe,
        settle_delay: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            symbol,
            timeframe,
            settle_delay,
        }
    }

    /// Fill the buffer up to capacity; used at startup so restarts resume warm
    pub async fn backfill(&self, now: DateTime<Utc>) -> usize {
        let capacity = self.cache.capacity_for(self.timeframe);
        self.pull(capacity, now).await
    }

    /// Fetch whatever closed bars are missing since the newest stored one
    pub async fn refresh_once(&self, now: DateTime<Utc>) -> usize {
        let capacity = self.cache.capacity_for(self.timeframe);
        let count = match self.cache.newest_open_time(&self.symbol, self.timeframe) {
            Some(newest) => {
                let missing = (now - newest).num_seconds() / self.timeframe.seconds();
                (missing.max(1) as usize + 1).min(capacity)
            }
            None => capacity,
        };
        self.pull(count, now).await
    }

    async fn pull(&self, count: usize, now: DateTime<Utc>) -> usize {
        match self.source.fetch_bars(&self.symbol, self.timeframe, count).await {
            Ok(bars) => {
                let closed: Vec<Bar> = bars.into_iter().filter(|b| b.is_closed_at(now)).collect();
                let appended = self.cache.ingest_all(closed);
                tracing::debug!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    appended,
                    "Refreshed bars"
                );
                appended
            }
            Err(e) => {
                // Upstream unreachable: skip this cycle, staleness is visible to readers
                tracing::warn!(
                    symbol = %self.symbol,
                    timeframe = %self.timeframe,
                    "Bar refresh skipped: {}",
                    e
                );
                0
            }
        }
    }

    /// Refresh forever on the bar period
    pub async fn run(self) {
        let appended = self.backfill(Utc::now()).await;
        tracing::info!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            appended,
            "Backfilled bar history"
        );

        let now = Utc::now();
        let until_boundary = (next_bar_boundary(now, self.timeframe) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let period = refresh_cadence(self.timeframe)
            .to_std()
            .unwrap_or(Duration::from_secs(60));

        let mut ticker = interval_at(Instant::now() + until_boundary + self.settle_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.refresh_once(Utc::now()).await;
        }
    }
}

/// Spawn one refresher per configured (symbol, timeframe)
pub fn spawn_refreshers(
    source: Arc<dyn BarSource>,
    cache: &MarketDataCache,
    config: &CacheConfig,
) -> Vec<JoinHandle<()>> {
    let settle = Duration::from_secs(config.settle_delay_secs);
    let mut handles = Vec::new();

    for symbol in &config.symbols {
        for timeframe in &config.timeframes {
            let refresher = BarRefresher::new(
                source.clone(),
                cache.clone(),
                symbol.clone(),
                *timeframe,
                settle,
            );
            handles.push(tokio::spawn(refresher.run()));
        }
    }

    handles
}

/// How long one refresher sleeps between polls
pub fn refresh_cadence(timeframe: Timeframe) -> ChronoDuration {
    timeframe.period()
}
