use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BarSource, Broker, BrokerError, CancelOutcome, CloseOutcome, ModifyOutcome};
use crate::models::{
    Bar, Order, OrderId, OrderState, Position, Quote, SymbolSpec, Ticket, Timeframe,
};

/// In-memory broker with failure injection.
///
/// Clones share state, so a test can hold one handle while a controller
/// drives another.
#[derive(Clone, Default)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
}

#[derive(Default)]
struct PaperState {
    positions: BTreeMap<Ticket, Position>,
    orders: BTreeMap<OrderId, Order>,
    quotes: HashMap<String, Quote>,
    specs: HashMap<String, SymbolSpec>,
    bars: HashMap<(String, Timeframe), Vec<Bar>>,
    unavailable: bool,
    rejects_pending: u32,
    /// Orders that fill in the instant before a cancel lands
    racing_fills: HashSet<OrderId>,
    modify_calls: Vec<(Ticket, f64, Option<f64>)>,
    close_calls: Vec<(Ticket, f64)>,
    cancel_calls: Vec<OrderId>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.lock().unavailable {
            return Err(BrokerError::Unavailable("paper broker offline".to_string()));
        }
        Ok(())
    }

    pub fn open_position(&self, position: Position) {
        self.lock().positions.insert(position.ticket, position);
    }

    /// Simulate a broker-side close (stop hit, manual close...)
    pub fn remove_position(&self, ticket: Ticket) {
        self.lock().positions.remove(&ticket);
    }

    pub fn position(&self, ticket: Ticket) -> Option<Position> {
        self.lock().positions.get(&ticket).cloned()
    }

    pub fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        self.set_quote_at(symbol, bid, ask, Utc::now());
    }

    /// Quote stamped by the broker's own clock
    pub fn set_quote_at(&self, symbol: &str, bid: f64, ask: f64, time: DateTime<Utc>) {
        self.lock().quotes.insert(
            symbol.to_string(),
            Quote {
                symbol: symbol.to_string(),
                bid,
                ask,
                time,
            },
        );
    }

    pub fn set_symbol_spec(&self, spec: SymbolSpec) {
        self.lock().specs.insert(spec.symbol.clone(), spec);
    }

    pub fn add_order(&self, order: Order) {
        self.lock().orders.insert(order.id, order);
    }

    pub fn set_order_state(&self, order_id: OrderId, state: OrderState) {
        if let Some(order) = self.lock().orders.get_mut(&order_id) {
            order.state = state;
        }
    }

    pub fn remove_order(&self, order_id: OrderId) {
        self.lock().orders.remove(&order_id);
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.lock().orders.get(&order_id).cloned()
    }

    /// The next cancel of `order_id` loses the race against a fill
    pub fn fill_before_cancel(&self, order_id: OrderId) {
        self.lock().racing_fills.insert(order_id);
    }

    pub fn set_bars(&self, symbol: &str, timeframe: Timeframe, bars: Vec<Bar>) {
        self.lock()
            .bars
            .insert((symbol.to_string(), timeframe), bars);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Reject the next `count` stop modifications
    pub fn reject_next_modifies(&self, count: u32) {
        self.lock().rejects_pending = count;
    }

    pub fn modify_calls(&self) -> Vec<(Ticket, f64, Option<f64>)> {
        self.lock().modify_calls.clone()
    }

    pub fn close_calls(&self) -> Vec<(Ticket, f64)> {
        self.lock().close_calls.clone()
    }

    pub fn cancel_calls(&self) -> Vec<OrderId> {
        self.lock().cancel_calls.clone()
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.ensure_available()?;
        Ok(self.lock().positions.values().cloned().collect())
    }

    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.ensure_available()?;
        Ok(self.lock().orders.values().cloned().collect())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.ensure_available()?;
        self.lock()
            .quotes
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::Rejected(format!("no quote for {}", symbol)))
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError> {
        self.ensure_available()?;
        Ok(self
            .lock()
            .specs
            .get(symbol)
            .cloned()
            .unwrap_or_else(|| SymbolSpec {
                symbol: symbol.to_string(),
                min_volume: 0.01,
                volume_step: 0.01,
                stops_level: 0.0,
            }))
    }

    async fn modify_stop(
        &self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<ModifyOutcome, BrokerError> {
        self.ensure_available()?;
        let mut state = self.lock();
        state.modify_calls.push((ticket, stop_loss, take_profit));

        if state.rejects_pending > 0 {
            state.rejects_pending -= 1;
            return Ok(ModifyOutcome::Rejected("invalid stops".to_string()));
        }

        let Some(position) = state.positions.get_mut(&ticket) else {
            return Ok(ModifyOutcome::Rejected("position not found".to_string()));
        };

        if position.stop_loss == Some(stop_loss) && position.take_profit == take_profit {
            return Ok(ModifyOutcome::NoChange);
        }

        position.stop_loss = Some(stop_loss);
        position.take_profit = take_profit;
        Ok(ModifyOutcome::Applied)
    }

    async fn close(
        &self,
        ticket: Ticket,
        volume_fraction: f64,
    ) -> Result<CloseOutcome, BrokerError> {
        self.ensure_available()?;
        let mut state = self.lock();
        state.close_calls.push((ticket, volume_fraction));

        let step = state
            .positions
            .get(&ticket)
            .and_then(|p| state.specs.get(&p.symbol))
            .map(|s| s.volume_step)
            .unwrap_or(0.01);

        let Some(position) = state.positions.get_mut(&ticket) else {
            return Ok(CloseOutcome::AlreadyClosed);
        };

        if volume_fraction >= 1.0 {
            let closed_volume = position.volume;
            state.positions.remove(&ticket);
            return Ok(CloseOutcome::Closed { closed_volume });
        }

        let closed_volume = ((position.volume * volume_fraction) / step + 1e-9).floor() * step;
        if closed_volume <= 0.0 {
            return Ok(CloseOutcome::Rejected("volume below step".to_string()));
        }
        position.volume -= closed_volume;
        Ok(CloseOutcome::Closed { closed_volume })
    }

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, BrokerError> {
        self.ensure_available()?;
        let mut state = self.lock();
        state.cancel_calls.push(order_id);

        let racing = state.racing_fills.remove(&order_id);
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(CancelOutcome::AlreadyGone);
        };

        if racing {
            order.state = OrderState::Filled;
        }

        Ok(match order.state {
            OrderState::Pending => {
                order.state = OrderState::Cancelled;
                CancelOutcome::Cancelled
            }
            OrderState::Filled => CancelOutcome::AlreadyFilled,
            OrderState::Cancelled | OrderState::Expired => CancelOutcome::AlreadyGone,
        })
    }
}

#[async_trait]
impl BarSource for PaperBroker {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        self.ensure_available()?;
        let state = self.lock();
        let bars = state
            .bars
            .get(&(symbol.to_string(), timeframe))
            .cloned()
            .unwrap_or_default();
        let skip = bars.len().saturating_sub(count);
        Ok(bars.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn create_test_position(ticket: Ticket) -> Position {
        Position {
            ticket,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Buy,
            entry_price: 100.0,
            volume: 1.0,
            stop_loss: Some(95.0),
            take_profit: Some(110.0),
            opened_at: Utc::now(),
            comment: None,
        }
    }

    #[tokio::test]
    async fn test_modify_reports_no_change() {
        let broker = PaperBroker::new();
        broker.open_position(create_test_position(1));

        assert_eq!(
            broker.modify_stop(1, 99.0, Some(110.0)).await.unwrap(),
            ModifyOutcome::Applied
        );
        assert_eq!(
            broker.modify_stop(1, 99.0, Some(110.0)).await.unwrap(),
            ModifyOutcome::NoChange
        );
        assert_eq!(broker.modify_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_close_rounds_to_step() {
        let broker = PaperBroker::new();
        broker.open_position(create_test_position(1));

        let outcome = broker.close(1, 0.5).await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Closed { closed_volume } if (closed_volume - 0.5).abs() < 1e-9));
        assert!((broker.position(1).unwrap().volume - 0.5).abs() < 1e-9);

        let outcome = broker.close(1, 1.0).await.unwrap();
        assert!(matches!(outcome, CloseOutcome::Closed { closed_volume } if (closed_volume - 0.5).abs() < 1e-9));
        assert_eq!(broker.close(1, 1.0).await.unwrap(), CloseOutcome::AlreadyClosed);
    }

    #[tokio::test]
    async fn test_cancel_race() {
        let broker = PaperBroker::new();
        broker.add_order(Order {
            id: 5,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Sell,
            price: 95.0,
            volume: 1.0,
            state: OrderState::Pending,
        });
        broker.fill_before_cancel(5);

        assert_eq!(broker.cancel(5).await.unwrap(), CancelOutcome::AlreadyFilled);
        assert_eq!(broker.order(5).unwrap().state, OrderState::Filled);
        assert_eq!(broker.cancel(99).await.unwrap(), CancelOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let broker = PaperBroker::new();
        broker.set_unavailable(true);
        assert!(matches!(
            broker.get_positions().await,
            Err(BrokerError::Unavailable(_))
        ));
    }
}
