use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};

use super::atr::calculate_atr;
use crate::cache::MarketDataCache;
use crate::config::{TimeframeWeight, VolatilityConfig};

/// Trailing distance, or an explicit signal that none can be computed safely
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopDistance {
    Available(f64),
    Unavailable,
}

impl StopDistance {
    pub fn value(&self) -> Option<f64> {
        match self {
            StopDistance::Available(d) => Some(*d),
            StopDistance::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, StopDistance::Available(_))
    }
}

/// Blends ATR across timeframes from the market data cache.
///
/// Reads only already-cached bars; never fetches.
#[derive(Clone)]
pub struct VolatilityEstimator {
    cache: MarketDataCache,
    config: Arc<VolatilityConfig>,
    external_scalar: Arc<RwLock<Option<f64>>>,
}

impl VolatilityEstimator {
    pub fn new(cache: MarketDataCache, config: VolatilityConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
            external_scalar: Arc::new(RwLock::new(None)),
        }
    }

    /// Configured timeframe blend
    pub fn timeframes(&self) -> &[TimeframeWeight] {
        &self.config.timeframes
    }

    /// External volatility multiplier, clamped into the configured range on use
    pub fn set_external_scalar(&self, scalar: Option<f64>) {
        *self
            .external_scalar
            .write()
            .unwrap_or_else(|e| e.into_inner()) = scalar.filter(|s| s.is_finite());
    }

    fn scalar(&self) -> f64 {
        let scalar = *self.external_scalar.read().unwrap_or_else(|e| e.into_inner());
        scalar
            .map(|s| s.clamp(self.config.scalar_min, self.config.scalar_max))
            .unwrap_or(1.0)
    }

    /// ATR of one timeframe if it has enough fresh history
    fn qualifying_atr(&self, symbol: &str, weight: &TimeframeWeight, now: DateTime<Utc>) -> Option<f64> {
        let period = self.config.atr_period;
        if self.cache.is_stale(symbol, weight.timeframe, now) {
            return None;
        }
        let bars = self.cache.get_bars(symbol, weight.timeframe, self.cache.capacity_for(weight.timeframe));
        calculate_atr(&bars, period).filter(|atr| atr.is_finite() && *atr > 0.0)
    }

    pub fn stop_distance(&self, symbol: &str, timeframe_set: &[TimeframeWeight]) -> StopDistance {
        self.stop_distance_at(symbol, timeframe_set, Utc::now())
    }

    /// Weighted blend of multiplier * ATR over qualifying timeframes.
    ///
    /// If the fastest timeframe lacks history, the first slower one that has
    /// it is used alone.
    pub fn stop_distance_at(
        &self,
        symbol: &str,
        timeframe_set: &[TimeframeWeight],
        now: DateTime<Utc>,
    ) -> StopDistance {
        let mut ordered: Vec<&TimeframeWeight> =
            timeframe_set.iter().filter(|w| w.weight > 0.0).collect();
        ordered.sort_by_key(|w| w.timeframe.seconds());

        let measured: Vec<(&TimeframeWeight, Option<f64>)> = ordered
            .into_iter()
            .map(|w| (w, self.qualifying_atr(symbol, w, now)))
            .collect();

        let fastest_ready = measured.first().map(|(_, atr)| atr.is_some()).unwrap_or(false);

        let raw = if fastest_ready {
            let (weighted, total_weight) = measured
                .iter()
                .filter_map(|(w, atr)| atr.map(|a| (w.weight * w.multiplier * a, w.weight)))
                .fold((0.0, 0.0), |(sum, weights), (v, w)| (sum + v, weights + w));
            (total_weight > 0.0).then(|| weighted / total_weight)
        } else {
            measured
                .iter()
                .find_map(|(w, atr)| atr.map(|a| w.multiplier * a))
        };

        match raw {
            Some(distance) => {
                let distance = distance * self.scalar();
                if distance.is_finite() && distance > 0.0 {
                    StopDistance::Available(distance)
                } else {
                    StopDistance::Unavailable
                }
            }
            None => {
                tracing::debug!(symbol = %symbol, "Stop distance unavailable: insufficient bar history");
                StopDistance::Unavailable
            }
        }
    }
}
