// Market data cache: bounded per-(symbol, timeframe) bar history
pub mod bar_buffer;
pub mod refresher;

pub use bar_buffer::{IngestOutcome, SymbolTimeframeBuffer};
pub use refresher::{next_bar_boundary, spawn_refreshers, BarRefresher};

use crate::config::CacheConfig;
use crate::models::{Bar, Timeframe};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type SeriesKey = (String, Timeframe);

/// Thread-safe store of bar buffers.
///
/// Each (symbol, timeframe) buffer gets its capacity once, when first
/// touched, from the cache configuration.
#[derive(Clone)]
pub struct MarketDataCache {
    data: Arc<RwLock<HashMap<SeriesKey, SymbolTimeframeBuffer>>>,
    config: Arc<CacheConfig>,
}

impl MarketDataCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SeriesKey, SymbolTimeframeBuffer>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SeriesKey, SymbolTimeframeBuffer>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity_for(&self, timeframe: Timeframe) -> usize {
        self.config.capacity_for(timeframe)
    }

    /// Append a closed bar; redelivered or older bars are ignored
    pub fn ingest(&self, bar: Bar) -> IngestOutcome {
        let capacity = self.capacity_for(bar.timeframe);
        let mut data = self.write();
        data.entry((bar.symbol.clone(), bar.timeframe))
            .or_insert_with(|| SymbolTimeframeBuffer::with_capacity(capacity))
            .ingest(bar)
    }

    /// Ingest a batch in order; returns how many bars were appended
    pub fn ingest_all(&self, bars: Vec<Bar>) -> usize {
        bars.into_iter()
            .filter(|bar| matches!(self.ingest(bar.clone()), IngestOutcome::Appended { .. }))
            .count()
    }

    /// Up to `limit` most recent bars, oldest first
    pub fn get_bars(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Vec<Bar> {
        self.read()
            .get(&(symbol.to_string(), timeframe))
            .map(|buffer| buffer.recent(limit))
            .unwrap_or_default()
    }

    pub fn bar_count(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.read()
            .get(&(symbol.to_string(), timeframe))
            .map(|buffer| buffer.len())
            .unwrap_or(0)
    }

    pub fn newest_open_time(&self, symbol: &str, timeframe: Timeframe) -> Option<DateTime<Utc>> {
        self.read()
            .get(&(symbol.to_string(), timeframe))
            .and_then(|buffer| buffer.newest_open_time())
    }

    /// Age of the newest bar's open time
    pub fn newest_age(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        self.newest_open_time(symbol, timeframe)
            .map(|open_time| now - open_time)
    }

    /// True when there is no bar or the newest one is more than three periods old
    pub fn is_stale(&self, symbol: &str, timeframe: Timeframe, now: DateTime<Utc>) -> bool {
        match self.newest_age(symbol, timeframe, now) {
            Some(age) => age > timeframe.period() * 3,
            None => true,
        }
    }

    /// All series currently held
    pub fn series(&self) -> Vec<(String, Timeframe)> {
        let mut keys: Vec<_> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear_symbol(&self, symbol: &str) {
        self.write().retain(|(s, _), _| s != symbol);
    }
}
