use thiserror::Error;

use crate::broker::BrokerError;
use crate::models::{OrderId, Owner, Ticket};

/// Failure taxonomy for the position-management core
#[derive(Debug, Error)]
pub enum GuardError {
    /// Not enough history to compute a value; the dependent mutation is skipped
    #[error("data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    /// Price translation refused because the feeds are not trustworthy
    #[error("feed {health:?} for {symbol}")]
    FeedDegraded {
        symbol: String,
        health: crate::feed::FeedHealth,
    },

    /// Broker refused a mutation (stale price, invalid stops...)
    #[error("broker rejected ticket {ticket}: {reason}")]
    BrokerRejected { ticket: Ticket, reason: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A controller tried to mutate a ticket it does not own
    #[error("ownership conflict on ticket {ticket}: {attempted} attempted, {owner} owns it")]
    OwnershipConflict {
        ticket: Ticket,
        attempted: Owner,
        owner: Owner,
    },

    /// Both legs of a linked pair filled
    #[error("race lost on linked pair: orders {order_a} and {order_b} both filled")]
    RaceLoss { order_a: OrderId, order_b: OrderId },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("config error: {0}")]
    Config(String),

    /// A queued control command that cannot be applied
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl GuardError {
    pub fn data_unavailable(symbol: &str, reason: impl Into<String>) -> Self {
        GuardError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for GuardError {
    fn from(e: redis::RedisError) -> Self {
        GuardError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(e: serde_json::Error) -> Self {
        GuardError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for GuardError {
    fn from(e: config::ConfigError) -> Self {
        GuardError::Config(e.to_string())
    }
}
