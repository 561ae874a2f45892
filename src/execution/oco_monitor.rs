use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{interval, Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::broker::{Broker, CancelOutcome};
use crate::error::GuardError;
use crate::models::{OcoPair, OcoStatus, Order, OrderId, OrderState};
use crate::notify::{Notification, NotificationDispatcher};
use crate::persistence::StateStore;

/// Broker-side state of one leg; a vanished order counts as cancelled.
/// `run_cycle` double-checks pairs whose legs both vanished.
fn leg_state(orders: &HashMap<OrderId, &Order>, id: OrderId) -> OrderState {
    orders
        .get(&id)
        .map(|o| o.state)
        .unwrap_or(OrderState::Cancelled)
}

fn is_dead(state: OrderState) -> bool {
    matches!(state, OrderState::Cancelled | OrderState::Expired)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    A,
    B,
}

/// Background reconciliation of one-cancels-other pairs.
///
/// Shares nothing mutable with the exit controllers; only the broker.
pub struct OcoMonitor {
    broker: Arc<dyn Broker>,
    store: Arc<dyn StateStore>,
    notifier: NotificationDispatcher,
    pairs: Mutex<HashMap<Uuid, OcoPair>>,
    poll_interval: Duration,
}

impl OcoMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn StateStore>,
        notifier: NotificationDispatcher,
        poll_interval: Duration,
    ) -> Self {
        Self {
            broker,
            store,
            notifier,
            pairs: Mutex::new(HashMap::new()),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, OcoPair>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload active and unacknowledged race pairs after restart
    pub async fn restore(&self) -> Result<usize, GuardError> {
        let pairs = self.store.load_oco_pairs().await?;
        let mut map = self.lock();
        for pair in pairs {
            if pair.status == OcoStatus::Active || pair.status == OcoStatus::BothFilled {
                map.insert(pair.group_id, pair);
            }
        }
        tracing::info!("Restored {} OCO pairs", map.len());
        Ok(map.len())
    }

    /// Start watching two pending orders as a linked pair
    pub async fn register(
        &self,
        symbol: &str,
        order_a: OrderId,
        order_b: OrderId,
    ) -> Result<Uuid, GuardError> {
        let pair = OcoPair::new(symbol, order_a, order_b, Utc::now());
        self.store.save_oco_pair(&pair).await?;
        let group_id = pair.group_id;
        tracing::info!(group_id = %group_id, order_a, order_b, "Registered OCO pair");
        self.lock().insert(group_id, pair);
        Ok(group_id)
    }

    pub fn pair(&self, group_id: Uuid) -> Option<OcoPair> {
        self.lock().get(&group_id).cloned()
    }

    pub fn pairs(&self) -> Vec<OcoPair> {
        let mut pairs: Vec<OcoPair> = self.lock().values().cloned().collect();
        pairs.sort_by_key(|p| p.created_at);
        pairs
    }

    /// Operator sign-off on a terminal pair; returns false if unknown or still active
    pub async fn acknowledge(&self, group_id: Uuid) -> Result<bool, GuardError> {
        let removable = matches!(self.pair(group_id), Some(p) if p.status.is_terminal());
        if !removable {
            return Ok(false);
        }
        self.store.delete_oco_pair(group_id).await?;
        self.lock().remove(&group_id);
        tracing::info!(group_id = %group_id, "OCO pair acknowledged");
        Ok(true)
    }

    /// One reconciliation pass; returns how many pairs changed status
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> usize {
        let active: Vec<OcoPair> = self
            .lock()
            .values()
            .filter(|p| p.status == OcoStatus::Active)
            .cloned()
            .collect();
        if active.is_empty() {
            return 0;
        }

        let orders = match self.broker.get_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!("Skipping OCO cycle, orders unavailable: {}", e);
                return 0;
            }
        };
        let by_id: HashMap<OrderId, &Order> = orders.iter().map(|o| (o.id, o)).collect();

        let mut changed = 0;
        for mut pair in active {
            let before = pair.status;
            self.evaluate(&mut pair, &by_id).await;
            let vanished =
                !by_id.contains_key(&pair.order_a) && !by_id.contains_key(&pair.order_b);
            if pair.status == OcoStatus::Cancelled && vanished && !self.check_vanished(&pair).await {
                pair.status = before;
            }
            if pair.status != before {
                pair.updated_at = now;
                self.settle(pair).await;
                changed += 1;
            }
        }
        changed
    }

    async fn evaluate(&self, pair: &mut OcoPair, orders: &HashMap<OrderId, &Order>) {
        let a = leg_state(orders, pair.order_a);
        let b = leg_state(orders, pair.order_b);

        pair.status = match (a, b) {
            (OrderState::Filled, OrderState::Filled) => OcoStatus::BothFilled,
            (OrderState::Filled, OrderState::Pending) => self.cancel_sibling(pair, Leg::A).await,
            (OrderState::Pending, OrderState::Filled) => self.cancel_sibling(pair, Leg::B).await,
            (OrderState::Filled, _) => OcoStatus::FilledA,
            (_, OrderState::Filled) => OcoStatus::FilledB,
            (dead, OrderState::Pending) if is_dead(dead) => self.cancel_orphan(pair, Leg::B).await,
            (OrderState::Pending, dead) if is_dead(dead) => self.cancel_orphan(pair, Leg::A).await,
            (OrderState::Pending, OrderState::Pending) => OcoStatus::Active,
            _ => OcoStatus::Cancelled,
        };
    }

    /// Both legs dropped out of the order listing. A bridge that forgets
    /// filled orders would make a double fill look like two cancels, so look
    /// for a position opened on the symbol since registration and escalate.
    /// Returns false when positions are unavailable; the pair stays active.
    async fn check_vanished(&self, pair: &OcoPair) -> bool {
        let positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(group_id = %pair.group_id, "Both legs vanished, positions unavailable: {}", e);
                return false;
            }
        };

        let opened: Vec<_> = positions
            .iter()
            .filter(|p| p.symbol == pair.symbol && p.opened_at >= pair.created_at)
            .map(|p| p.ticket)
            .collect();
        if !opened.is_empty() {
            tracing::error!(
                group_id = %pair.group_id,
                symbol = %pair.symbol,
                tickets = ?opened,
                "Both OCO legs vanished with new positions open"
            );
            self.notifier.send(Notification::critical(
                format!("oco:{}:vanished", pair.group_id),
                format!(
                    "OCO {} on {}: orders {} and {} vanished and positions {:?} opened since. Verify this is not a double fill.",
                    pair.group_id, pair.symbol, pair.order_a, pair.order_b, opened
                ),
            ));
        }
        true
    }

    /// `filled` leg filled first: cancel the other one
    async fn cancel_sibling(&self, pair: &OcoPair, filled: Leg) -> OcoStatus {
        let (sibling, won) = match filled {
            Leg::A => (pair.order_b, OcoStatus::FilledA),
            Leg::B => (pair.order_a, OcoStatus::FilledB),
        };

        match self.broker.cancel(sibling).await {
            Ok(CancelOutcome::Cancelled) | Ok(CancelOutcome::AlreadyGone) => won,
            Ok(CancelOutcome::AlreadyFilled) => OcoStatus::BothFilled,
            Ok(CancelOutcome::Rejected(reason)) => {
                tracing::warn!(group_id = %pair.group_id, order = sibling, "Sibling cancel rejected, retrying: {}", reason);
                OcoStatus::Active
            }
            Err(e) => {
                tracing::warn!(group_id = %pair.group_id, order = sibling, "Sibling cancel failed, retrying: {}", e);
                OcoStatus::Active
            }
        }
    }

    /// The other leg died unfilled: cancel the `pending` one too
    async fn cancel_orphan(&self, pair: &OcoPair, pending: Leg) -> OcoStatus {
        let (order, on_fill) = match pending {
            Leg::A => (pair.order_a, OcoStatus::FilledA),
            Leg::B => (pair.order_b, OcoStatus::FilledB),
        };

        match self.broker.cancel(order).await {
            Ok(CancelOutcome::Cancelled) | Ok(CancelOutcome::AlreadyGone) => OcoStatus::Cancelled,
            // Filled while we were cancelling; its sibling is already dead
            Ok(CancelOutcome::AlreadyFilled) => on_fill,
            Ok(CancelOutcome::Rejected(reason)) => {
                tracing::warn!(group_id = %pair.group_id, order, "Orphan cancel rejected, retrying: {}", reason);
                OcoStatus::Active
            }
            Err(e) => {
                tracing::warn!(group_id = %pair.group_id, order, "Orphan cancel failed, retrying: {}", e);
                OcoStatus::Active
            }
        }
    }

    /// Record a status change: alert, persist, and drop resolved pairs
    async fn settle(&self, mut pair: OcoPair) {
        let group_id = pair.group_id;

        if pair.status == OcoStatus::BothFilled {
            if !pair.alerted {
                let err = GuardError::RaceLoss {
                    order_a: pair.order_a,
                    order_b: pair.order_b,
                };
                tracing::error!(group_id = %group_id, symbol = %pair.symbol, "PROTECTION FAILURE: {}", err);
                self.notifier.send(Notification::critical(
                    format!("oco:{}:both_filled", group_id),
                    format!(
                        "OCO {} on {}: both orders {} and {} filled. Manual review required.",
                        group_id, pair.symbol, pair.order_a, pair.order_b
                    ),
                ));
                pair.alerted = true;
            }
            if let Err(e) = self.store.save_oco_pair(&pair).await {
                tracing::error!(group_id = %group_id, "Failed to persist OCO pair: {}", e);
            }
            self.lock().insert(group_id, pair);
            return;
        }

        tracing::info!(group_id = %group_id, status = %pair.status, "OCO pair resolved");
        self.notifier.send(Notification::info(
            format!("oco:{}:{}", group_id, pair.status),
            format!("OCO {} on {} resolved: {}", group_id, pair.symbol, pair.status),
        ));
        if let Err(e) = self.store.delete_oco_pair(group_id).await {
            tracing::error!(group_id = %group_id, "Failed to remove resolved OCO pair: {}", e);
        }
        self.lock().remove(&group_id);
    }

    /// Poll on the fixed interval forever
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("OCO monitor started");

        loop {
            ticker.tick().await;
            self.run_cycle(Utc::now()).await;
        }
    }
}
