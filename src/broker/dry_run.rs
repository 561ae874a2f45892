use async_trait::async_trait;

use super::{Broker, BrokerError, CancelOutcome, CloseOutcome, ModifyOutcome};
use crate::models::{Order, OrderId, Position, Quote, SymbolSpec, Ticket};

/// Read-through broker that logs mutations instead of sending them.
///
/// Reads hit the real broker, so every decision is computed from live
/// positions and quotes.
pub struct DryRunBroker<B> {
    inner: B,
}

impl<B: Broker> DryRunBroker<B> {
    pub fn new(inner: B) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<B: Broker> Broker for DryRunBroker<B> {
    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.inner.get_positions().await
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.inner.get_orders().await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.inner.get_quote(symbol).await
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError> {
        self.inner.symbol_spec(symbol).await
    }

    async fn modify_stop(
        &self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<ModifyOutcome, BrokerError> {
        tracing::info!(ticket, stop_loss, ?take_profit, "[dry-run] modify_stop");
        Ok(ModifyOutcome::Applied)
    }

    async fn close(
        &self,
        ticket: Ticket,
        volume_fraction: f64,
    ) -> Result<CloseOutcome, BrokerError> {
        tracing::info!(ticket, volume_fraction, "[dry-run] close");
        Ok(CloseOutcome::Closed { closed_volume: 0.0 })
    }

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, BrokerError> {
        tracing::info!(order_id, "[dry-run] cancel");
        Ok(CancelOutcome::Cancelled)
    }
}
