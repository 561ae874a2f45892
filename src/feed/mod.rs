// Broker/exchange price feed reconciliation
pub mod sources;
pub mod synchronizer;

pub use sources::{pump_broker_quotes, ExchangeTicker};
pub use synchronizer::{FeedHealth, FeedSnapshot, FeedSynchronizer, OffsetEstimate, TickOutcome};
