// Broker execution API: trait seam plus HTTP bridge and paper implementations
pub mod backoff;
pub mod dry_run;
pub mod http;
pub mod paper;

pub use backoff::ExponentialBackoff;
pub use dry_run::DryRunBroker;
pub use http::HttpBroker;
pub use paper::PaperBroker;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Bar, Order, OrderId, Position, Quote, SymbolSpec, Ticket, Timeframe};

/// Transport-level broker failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker request timed out")]
    Timeout,
    #[error("broker rejected request: {0}")]
    Rejected(String),
    #[error("malformed broker response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else if e.is_decode() {
            BrokerError::Decode(e.to_string())
        } else {
            BrokerError::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModifyOutcome {
    Applied,
    /// Requested levels equal the current ones
    NoChange,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed { closed_volume: f64 },
    AlreadyClosed,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled,
    /// The order filled before the cancel landed
    AlreadyFilled,
    AlreadyGone,
    Rejected(String),
}

/// Broker execution API. The broker is the only source of truth for
/// position and order existence.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Pending orders plus recently finished ones. A filled, cancelled or
    /// expired order must stay listed with that state for at least a few
    /// OCO poll intervals; an order missing from the listing is read as
    /// cancelled.
    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError>;

    async fn modify_stop(
        &self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<ModifyOutcome, BrokerError>;

    async fn close(&self, ticket: Ticket, volume_fraction: f64)
        -> Result<CloseOutcome, BrokerError>;

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, BrokerError>;

    /// Fresh view of a single position, `None` once the broker no longer reports it
    async fn get_position(&self, ticket: Ticket) -> Result<Option<Position>, BrokerError> {
        Ok(self
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.ticket == ticket))
    }
}

/// Historical bar source feeding the market data cache
#[async_trait]
pub trait BarSource: Send + Sync {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, BrokerError>;
}
