use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;

use crate::config::FeedConfig;
use crate::error::GuardError;
use crate::models::{FeedSource, PriceTick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedHealth {
    Healthy,
    Degraded,
    Critical,
}

/// Calibrated broker-minus-exchange offset for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetEstimate {
    pub symbol: String,
    pub offset: f64,
    pub confidence: f64,
    pub sample_count: u32,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// Not newer than the last tick from the same source
    Ignored,
    /// Stored, no counterpart within the pairing window
    Stored,
    /// Paired and folded into the estimate
    Calibrated { offset: f64 },
    /// Paired but discarded as an outlier
    Outlier { instantaneous: f64 },
    /// Too many consecutive outliers; the estimate restarted from this pair
    Recalibrated { offset: f64 },
}

/// Diagnostic view of one symbol's feed state
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub symbol: String,
    pub health: FeedHealth,
    pub estimate: Option<OffsetEstimate>,
    pub last_broker_tick: Option<DateTime<Utc>>,
    pub last_exchange_tick: Option<DateTime<Utc>>,
    pub outliers_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
struct LastTick {
    price: f64,
    timestamp: DateTime<Utc>,
    paired: bool,
}

#[derive(Debug, Default)]
struct SymbolFeed {
    broker: Option<LastTick>,
    exchange: Option<LastTick>,
    estimate: Option<OffsetEstimate>,
    accepted: VecDeque<f64>,
    outliers_rejected: u64,
    consecutive_outliers: u32,
}

impl SymbolFeed {
    fn last_mut(&mut self, source: FeedSource) -> &mut Option<LastTick> {
        match source {
            FeedSource::Broker => &mut self.broker,
            FeedSource::Exchange => &mut self.exchange,
        }
    }

    fn stddev(&self) -> f64 {
        let n = self.accepted.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.accepted.iter().sum::<f64>() / n as f64;
        let var = self
            .accepted
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / (n - 1) as f64;
        var.sqrt()
    }
}

/// Confidence of an estimate: ramps up with samples, halves every half-life
fn confidence_at(estimate: &OffsetEstimate, config: &FeedConfig, now: DateTime<Utc>) -> f64 {
    let sample_factor = (estimate.sample_count as f64 / config.min_samples.max(1) as f64).min(1.0);
    let age_secs = (now - estimate.last_updated).num_milliseconds().max(0) as f64 / 1000.0;
    let decay = if config.confidence_half_life_secs > 0.0 {
        0.5f64.powf(age_secs / config.confidence_half_life_secs)
    } else {
        1.0
    };
    sample_factor * decay
}

/// Reconciles the broker and exchange price feeds.
///
/// Push-driven: every inbound tick goes through `on_tick`. Reads never block
/// on I/O; consumers that need freshness check `health_at`.
#[derive(Clone)]
pub struct FeedSynchronizer {
    feeds: Arc<RwLock<HashMap<String, SymbolFeed>>>,
    config: Arc<FeedConfig>,
}

impl FeedSynchronizer {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            feeds: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SymbolFeed>> {
        self.feeds.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SymbolFeed>> {
        self.feeds.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_tick(&self, tick: PriceTick) -> TickOutcome {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return TickOutcome::Ignored;
        }

        let config = &self.config;
        let mut feeds = self.write();
        let feed = feeds.entry(tick.symbol.clone()).or_default();

        let slot = feed.last_mut(tick.source);
        if let Some(previous) = slot {
            if tick.timestamp <= previous.timestamp {
                return TickOutcome::Ignored;
            }
        }
        *slot = Some(LastTick {
            price: tick.price,
            timestamp: tick.timestamp,
            paired: false,
        });

        let (Some(broker), Some(exchange)) = (feed.broker, feed.exchange) else {
            return TickOutcome::Stored;
        };
        if broker.paired || exchange.paired {
            return TickOutcome::Stored;
        }
        let gap = (broker.timestamp - exchange.timestamp).num_milliseconds().abs();
        if gap > config.pair_window_ms {
            return TickOutcome::Stored;
        }

        // Each tick takes part in at most one pair
        if let Some(b) = feed.broker.as_mut() {
            b.paired = true;
        }
        if let Some(e) = feed.exchange.as_mut() {
            e.paired = true;
        }

        let instantaneous = broker.price - exchange.price;
        let pair_time = broker.timestamp.max(exchange.timestamp);

        let mut recalibrate = false;
        if let Some(estimate) = &feed.estimate {
            if feed.accepted.len() >= config.min_samples as usize {
                let floor = exchange.price * config.outlier_floor_fraction;
                let band = config.outlier_k * feed.stddev().max(floor);
                if (instantaneous - estimate.offset).abs() > band {
                    if feed.consecutive_outliers < config.max_consecutive_outliers {
                        feed.outliers_rejected += 1;
                        feed.consecutive_outliers += 1;
                        tracing::debug!(
                            symbol = %tick.symbol,
                            instantaneous,
                            offset = estimate.offset,
                            band,
                            "Rejected outlier offset"
                        );
                        return TickOutcome::Outlier { instantaneous };
                    }
                    tracing::warn!(
                        symbol = %tick.symbol,
                        old_offset = estimate.offset,
                        instantaneous,
                        rejected = feed.consecutive_outliers,
                        "Offset moved, discarding estimate and recalibrating"
                    );
                    recalibrate = true;
                }
            }
        }
        if recalibrate {
            feed.estimate = None;
            feed.accepted.clear();
        }
        feed.consecutive_outliers = 0;

        let (offset, sample_count) = match &feed.estimate {
            Some(estimate) => (
                config.ewma_alpha * instantaneous + (1.0 - config.ewma_alpha) * estimate.offset,
                estimate.sample_count.saturating_add(1),
            ),
            None => (instantaneous, 1),
        };

        feed.accepted.push_back(instantaneous);
        while feed.accepted.len() > config.outlier_window.max(2) {
            feed.accepted.pop_front();
        }

        let mut estimate = OffsetEstimate {
            symbol: tick.symbol.clone(),
            offset,
            confidence: 0.0,
            sample_count,
            last_updated: pair_time,
        };
        estimate.confidence = confidence_at(&estimate, config, pair_time);
        feed.estimate = Some(estimate);

        if recalibrate {
            TickOutcome::Recalibrated { offset }
        } else {
            TickOutcome::Calibrated { offset }
        }
    }

    /// Current estimate with confidence decayed to `now`
    pub fn estimate_at(&self, symbol: &str, now: DateTime<Utc>) -> Option<OffsetEstimate> {
        let feeds = self.read();
        let mut estimate = feeds.get(symbol)?.estimate.clone()?;
        estimate.confidence = confidence_at(&estimate, &self.config, now);
        Some(estimate)
    }

    pub fn estimate(&self, symbol: &str) -> Option<OffsetEstimate> {
        self.estimate_at(symbol, Utc::now())
    }

    pub fn health_at(&self, symbol: &str, now: DateTime<Utc>) -> FeedHealth {
        let feeds = self.read();
        let Some(feed) = feeds.get(symbol) else {
            return FeedHealth::Critical;
        };

        let stale_after = Duration::milliseconds(self.config.stale_after_ms);
        let fresh = |tick: &Option<LastTick>| {
            tick.map(|t| now - t.timestamp <= stale_after)
                .unwrap_or(false)
        };
        let broker_fresh = fresh(&feed.broker);
        let exchange_fresh = fresh(&feed.exchange);

        if !broker_fresh && !exchange_fresh {
            return FeedHealth::Critical;
        }

        let Some(estimate) = &feed.estimate else {
            return FeedHealth::Critical;
        };
        if estimate.sample_count < self.config.min_samples {
            return FeedHealth::Critical;
        }

        let confidence = confidence_at(estimate, &self.config, now);
        if broker_fresh && exchange_fresh && confidence >= self.config.healthy_confidence {
            FeedHealth::Healthy
        } else {
            FeedHealth::Degraded
        }
    }

    pub fn get_health(&self, symbol: &str) -> FeedHealth {
        self.health_at(symbol, Utc::now())
    }

    /// Exchange price expressed in the broker's frame; `None` before any calibration.
    /// Callers needing a trustworthy value check health first or use `translated_exchange_price`.
    pub fn translate(&self, exchange_price: f64, symbol: &str) -> Option<f64> {
        let feeds = self.read();
        feeds
            .get(symbol)?
            .estimate
            .as_ref()
            .map(|e| exchange_price + e.offset)
    }

    /// Translate the latest exchange price.
    ///
    /// Refused when health is critical, when the estimate's confidence is
    /// below `healthy_confidence`, or while the most recent pairs disagree
    /// with the estimate.
    pub fn translated_exchange_price(
        &self,
        symbol: &str,
        now: DateTime<Utc>,
    ) -> Result<f64, GuardError> {
        let health = self.health_at(symbol, now);
        let refused = || GuardError::FeedDegraded {
            symbol: symbol.to_string(),
            health,
        };
        if health == FeedHealth::Critical {
            return Err(refused());
        }

        let exchange_price = {
            let feeds = self.read();
            let feed = feeds.get(symbol).ok_or_else(refused)?;
            let trusted = feed.consecutive_outliers == 0
                && feed
                    .estimate
                    .as_ref()
                    .map(|e| confidence_at(e, &self.config, now) >= self.config.healthy_confidence)
                    .unwrap_or(false);
            if !trusted {
                return Err(refused());
            }
            feed.exchange
                .filter(|t| now - t.timestamp <= Duration::milliseconds(self.config.stale_after_ms))
                .map(|t| t.price)
        };

        exchange_price
            .and_then(|price| self.translate(price, symbol))
            .ok_or_else(refused)
    }

    pub fn snapshot(&self, symbol: &str, now: DateTime<Utc>) -> Option<FeedSnapshot> {
        let health = self.health_at(symbol, now);
        let estimate = self.estimate_at(symbol, now);
        let feeds = self.read();
        let feed = feeds.get(symbol)?;
        Some(FeedSnapshot {
            symbol: symbol.to_string(),
            health,
            estimate,
            last_broker_tick: feed.broker.map(|t| t.timestamp),
            last_exchange_tick: feed.exchange.map(|t| t.timestamp),
            outliers_rejected: feed.outliers_rejected,
        })
    }

    /// Consume ticks until every sender is dropped
    pub async fn run(self, mut ticks: mpsc::Receiver<PriceTick>) {
        while let Some(tick) = ticks.recv().await {
            let symbol = tick.symbol.clone();
            match self.on_tick(tick) {
                TickOutcome::Outlier { instantaneous } => {
                    tracing::warn!(symbol = %symbol, instantaneous, "Discarded outlier price pair");
                }
                TickOutcome::Recalibrated { offset } => {
                    tracing::info!(symbol = %symbol, offset, "Offset re-seeded");
                }
                _ => {}
            }
        }
        tracing::info!("Tick stream closed, synchronizer stopping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap()
    }

    fn tick(source: FeedSource, price: f64, ms: i64) -> PriceTick {
        PriceTick {
            source,
            symbol: "XAUUSD".to_string(),
            price,
            timestamp: base_time() + Duration::milliseconds(ms),
        }
    }

    /// Broker/exchange pairs one second apart with the given offsets
    fn paired_sequence(offsets: &[f64]) -> Vec<PriceTick> {
        offsets
            .iter()
            .enumerate()
            .flat_map(|(i, offset)| {
                let ms = i as i64 * 1000;
                let exchange = 2000.0 + i as f64 * 0.1;
                vec![
                    tick(FeedSource::Exchange, exchange, ms),
                    tick(FeedSource::Broker, exchange + offset, ms + 100),
                ]
            })
            .collect()
    }

    fn calibrated_sync() -> FeedSynchronizer {
        let sync = FeedSynchronizer::new(FeedConfig::default());
        let offsets: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 0.49 } else { 0.51 }).collect();
        for t in paired_sequence(&offsets) {
            sync.on_tick(t);
        }
        sync
    }

    #[test]
    fn test_first_pair_seeds_offset() {
        let sync = FeedSynchronizer::new(FeedConfig::default());

        assert_eq!(sync.on_tick(tick(FeedSource::Exchange, 2000.0, 0)), TickOutcome::Stored);
        let outcome = sync.on_tick(tick(FeedSource::Broker, 2000.5, 300));
        assert!(matches!(outcome, TickOutcome::Calibrated { offset } if (offset - 0.5).abs() < 1e-9));

        let estimate = sync.estimate_at("XAUUSD", base_time()).unwrap();
        assert_eq!(estimate.sample_count, 1);
    }

    #[test]
    fn test_ticks_outside_window_do_not_pair() {
        let sync = FeedSynchronizer::new(FeedConfig::default());

        sync.on_tick(tick(FeedSource::Exchange, 2000.0, 0));
        assert_eq!(sync.on_tick(tick(FeedSource::Broker, 2000.5, 2500)), TickOutcome::Stored);
        assert!(sync.estimate_at("XAUUSD", base_time()).is_none());
    }

    #[test]
    fn test_tick_pairs_only_once() {
        let sync = FeedSynchronizer::new(FeedConfig::default());

        sync.on_tick(tick(FeedSource::Exchange, 2000.0, 0));
        sync.on_tick(tick(FeedSource::Broker, 2000.5, 100));
        // Second broker tick must not re-use the consumed exchange tick
        assert_eq!(sync.on_tick(tick(FeedSource::Broker, 2000.6, 200)), TickOutcome::Stored);
        assert_eq!(sync.estimate_at("XAUUSD", base_time()).unwrap().sample_count, 1);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let offsets: Vec<f64> = (0..12).map(|i| 0.5 + (i % 3) as f64 * 0.01).collect();
        let sequence = paired_sequence(&offsets);

        let first = FeedSynchronizer::new(FeedConfig::default());
        for t in sequence.clone() {
            first.on_tick(t);
        }
        let once = first.estimate_at("XAUUSD", base_time()).unwrap();

        for t in sequence.clone() {
            assert_eq!(first.on_tick(t), TickOutcome::Ignored);
        }
        assert_eq!(first.estimate_at("XAUUSD", base_time()).unwrap(), once);

        let second = FeedSynchronizer::new(FeedConfig::default());
        for t in sequence {
            second.on_tick(t);
        }
        assert_eq!(second.estimate_at("XAUUSD", base_time()).unwrap(), once);
    }

    #[test]
    fn test_single_outlier_is_rejected() {
        let sync = calibrated_sync();
        let before = sync.estimate_at("XAUUSD", base_time()).unwrap();

        sync.on_tick(tick(FeedSource::Exchange, 2003.0, 30_000));
        let outcome = sync.on_tick(tick(FeedSource::Broker, 2013.0, 30_100));
        assert!(matches!(outcome, TickOutcome::Outlier { .. }));

        let after = sync.estimate_at("XAUUSD", base_time()).unwrap();
        assert_eq!(after.offset, before.offset);
        assert_eq!(after.sample_count, before.sample_count);

        // Normal pairs keep calibrating afterwards
        sync.on_tick(tick(FeedSource::Exchange, 2003.1, 31_000));
        let outcome = sync.on_tick(tick(FeedSource::Broker, 2003.6, 31_100));
        assert!(matches!(outcome, TickOutcome::Calibrated { offset } if (offset - 0.5).abs() < 0.02));

        let snapshot = sync.snapshot("XAUUSD", base_time() + Duration::seconds(31)).unwrap();
        assert_eq!(snapshot.outliers_rejected, 1);
    }

    #[test]
    fn test_lasting_offset_shift_recalibrates() {
        let sync = calibrated_sync();
        let config = FeedConfig::default();
        let mut outliers = 0;
        let mut recalibrated = false;

        // The broker re-prices 1.0 above its old offset and stays there
        for i in 20..50 {
            let ms = i as i64 * 1000;
            let exchange = 2000.0 + i as f64 * 0.1;
            sync.on_tick(tick(FeedSource::Exchange, exchange, ms));
            match sync.on_tick(tick(FeedSource::Broker, exchange + 1.5, ms + 100)) {
                TickOutcome::Outlier { .. } => outliers += 1,
                TickOutcome::Recalibrated { offset } => {
                    assert!((offset - 1.5).abs() < 1e-9);
                    recalibrated = true;
                }
                _ => {}
            }

            // Never serve a price built on the abandoned offset
            let now = base_time() + Duration::milliseconds(ms + 100);
            if let Ok(price) = sync.translated_exchange_price("XAUUSD", now) {
                assert!((price - (exchange + 1.5)).abs() < 0.02, "stale translation {}", price);
            }
        }

        assert!(recalibrated);
        assert_eq!(outliers, config.max_consecutive_outliers);

        let now = base_time() + Duration::milliseconds(49_100);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Healthy);
        let estimate = sync.estimate_at("XAUUSD", now).unwrap();
        assert!((estimate.offset - 1.5).abs() < 1e-9);
        let price = sync.translated_exchange_price("XAUUSD", now).unwrap();
        assert!((price - (2004.9 + 1.5)).abs() < 1e-6);
    }

    #[test]
    fn test_recent_outlier_blocks_translation() {
        let sync = calibrated_sync();

        sync.on_tick(tick(FeedSource::Exchange, 2002.0, 20_000));
        sync.on_tick(tick(FeedSource::Broker, 2012.0, 20_100));
        let now = base_time() + Duration::milliseconds(20_100);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Healthy);
        assert!(sync.translated_exchange_price("XAUUSD", now).is_err());

        // One agreeing pair restores it
        sync.on_tick(tick(FeedSource::Exchange, 2002.1, 21_000));
        sync.on_tick(tick(FeedSource::Broker, 2002.6, 21_100));
        let now = base_time() + Duration::milliseconds(21_100);
        assert!(sync.translated_exchange_price("XAUUSD", now).is_ok());
    }

    #[test]
    fn test_low_confidence_refuses_translation() {
        let sync = calibrated_sync();

        // Exchange keeps ticking, broker is silent: no new pairs, confidence decays
        for i in 20..45 {
            sync.on_tick(tick(FeedSource::Exchange, 2002.0, i * 1000));
        }
        let now = base_time() + Duration::seconds(44);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Degraded);
        assert!(sync.estimate_at("XAUUSD", now).unwrap().confidence < 0.6);
        assert!(matches!(
            sync.translated_exchange_price("XAUUSD", now),
            Err(GuardError::FeedDegraded { health: FeedHealth::Degraded, .. })
        ));
    }

    #[test]
    fn test_health_transitions() {
        let sync = calibrated_sync();
        // Last pair landed at ~19.1s
        let now = base_time() + Duration::seconds(20);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Healthy);

        // Exchange goes quiet while broker keeps ticking
        sync.on_tick(tick(FeedSource::Broker, 2002.5, 28_000));
        let now = base_time() + Duration::seconds(30);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Degraded);

        // Both stale
        let now = base_time() + Duration::seconds(60);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Critical);
    }

    #[test]
    fn test_uncalibrated_is_critical() {
        let sync = FeedSynchronizer::new(FeedConfig::default());
        sync.on_tick(tick(FeedSource::Exchange, 2000.0, 0));
        sync.on_tick(tick(FeedSource::Broker, 2000.5, 100));

        assert_eq!(sync.health_at("XAUUSD", base_time()), FeedHealth::Critical);
        assert_eq!(sync.health_at("EURUSD", base_time()), FeedHealth::Critical);
    }

    #[test]
    fn test_translate() {
        let sync = calibrated_sync();
        let translated = sync.translate(2100.0, "XAUUSD").unwrap();
        assert!((translated - 2100.5).abs() < 0.02);
        assert!(sync.translate(1.1, "EURUSD").is_none());
    }

    #[test]
    fn test_translated_exchange_price_gated_by_health() {
        let sync = calibrated_sync();
        let now = base_time() + Duration::seconds(20);
        let price = sync.translated_exchange_price("XAUUSD", now).unwrap();
        assert!((price - (2001.9 + 0.5)).abs() < 0.02);

        let later = base_time() + Duration::seconds(90);
        assert!(matches!(
            sync.translated_exchange_price("XAUUSD", later),
            Err(GuardError::FeedDegraded { health: FeedHealth::Critical, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_prices() {
        let sync = FeedSynchronizer::new(FeedConfig::default());
        assert_eq!(sync.on_tick(tick(FeedSource::Broker, f64::NAN, 0)), TickOutcome::Ignored);
        assert_eq!(sync.on_tick(tick(FeedSource::Broker, -1.0, 0)), TickOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_run_consumes_channel() {
        let sync = FeedSynchronizer::new(FeedConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(sync.clone().run(rx));

        tx.send(tick(FeedSource::Exchange, 2000.0, 0)).await.unwrap();
        tx.send(tick(FeedSource::Broker, 2000.5, 100)).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(sync.estimate_at("XAUUSD", base_time()).is_some());
    }
}
