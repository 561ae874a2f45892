use crate::models::Bar;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored; `evicted` is true when the oldest bar was dropped to make room
    Appended { evicted: bool },
    /// Not newer than the last stored bar (redelivery or out of order)
    Ignored,
}

/// Fixed-capacity ring of bars for one (symbol, timeframe).
///
/// open_time is strictly increasing; eviction of the oldest bar is O(1).
#[derive(Debug, Clone)]
pub struct SymbolTimeframeBuffer {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl SymbolTimeframeBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            bars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a bar if it is newer than the last stored one
    pub fn ingest(&mut self, bar: Bar) -> IngestOutcome {
        if let Some(last) = self.bars.back() {
            if bar.open_time <= last.open_time {
                return IngestOutcome::Ignored;
            }
        }

        let evicted = if self.bars.len() == self.capacity {
            self.bars.pop_front();
            true
        } else {
            false
        };

        self.bars.push_back(bar);
        IngestOutcome::Appended { evicted }
    }

    /// The `limit` most recent bars, oldest first
    pub fn recent(&self, limit: usize) -> Vec<Bar> {
        let skip = self.bars.len().saturating_sub(limit);
        self.bars.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn newest_open_time(&self) -> Option<DateTime<Utc>> {
        self.bars.back().map(|b| b.open_time)
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
