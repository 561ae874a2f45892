use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::{Arbiter, OcoMonitor};
use crate::error::GuardError;
use crate::models::ControlCommand;
use crate::persistence::StateStore;

/// Applies commands queued in the store by the CLI or the signal layer.
///
/// The running service owns the arbiter and the OCO monitor in memory, so
/// other processes reach them only through this queue.
pub struct CommandInbox {
    store: Arc<dyn StateStore>,
    arbiter: Arc<Arbiter>,
    oco: Arc<OcoMonitor>,
    poll_interval: Duration,
}

impl CommandInbox {
    pub fn new(
        store: Arc<dyn StateStore>,
        arbiter: Arc<Arbiter>,
        oco: Arc<OcoMonitor>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            arbiter,
            oco,
            poll_interval,
        }
    }

    pub async fn apply(&self, command: ControlCommand) -> Result<(), GuardError> {
        match command {
            ControlCommand::RegisterOco {
                symbol,
                order_a,
                order_b,
            } => {
                if order_a == order_b {
                    return Err(GuardError::InvalidCommand(format!(
                        "OCO legs must differ, got {} twice",
                        order_a
                    )));
                }
                self.oco.register(&symbol, order_a, order_b).await?;
            }
            ControlCommand::AcknowledgeOco { group_id } => {
                if !self.oco.acknowledge(group_id).await? {
                    return Err(GuardError::InvalidCommand(format!(
                        "OCO {} is unknown or still active",
                        group_id
                    )));
                }
            }
            ControlCommand::RegisterIntent { ticket, intent } => {
                self.arbiter.register_intent(ticket, &intent);
            }
            ControlCommand::Preregister { ticket, tag } => {
                let tag = tag.trim();
                if tag.is_empty() {
                    return Err(GuardError::InvalidCommand(format!(
                        "empty strategy tag for ticket {}",
                        ticket
                    )));
                }
                self.arbiter.preregister(ticket, tag);
            }
            ControlCommand::Claim { ticket, tag } => {
                if !self.arbiter.request_handoff(ticket, tag.as_str()) {
                    return Err(GuardError::InvalidCommand(format!(
                        "claim of ticket {} by '{}' refused",
                        ticket, tag
                    )));
                }
                tracing::info!(ticket, tag = %tag, "Handoff claim queued for breakeven");
            }
        }
        Ok(())
    }

    /// Drain the queue once; returns how many commands were applied
    pub async fn drain_once(&self) -> usize {
        let commands = match self.store.drain_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!("Command queue unavailable: {}", e);
                return 0;
            }
        };

        let mut applied = 0;
        for command in commands {
            let description = format!("{:?}", command);
            match self.apply(command).await {
                Ok(()) => {
                    tracing::info!(command = %description, "Applied command");
                    applied += 1;
                }
                Err(e) => tracing::warn!(command = %description, "Command rejected: {}", e),
            }
        }
        applied
    }

    pub async fn run(self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Command inbox started");

        loop {
            ticker.tick().await;
            self.drain_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::config::NotifyConfig;
    use crate::models::{Direction, Intent, OcoStatus, Order, OrderState, Owner, Position};
    use crate::notify::NotificationDispatcher;
    use crate::persistence::MemoryStateStore;
    use chrono::Utc;

    fn create_test_order(id: u64) -> Order {
        Order {
            id,
            symbol: "XAUUSD".to_string(),
            direction: Direction::Buy,
            price: 2010.0,
            volume: 0.1,
            state: OrderState::Pending,
        }
    }

    fn create_test_position(ticket: u64) -> Position {
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

    fn setup() -> (PaperBroker, MemoryStateStore, Arc<Arbiter>, Arc<OcoMonitor>, CommandInbox) {
        let broker = PaperBroker::new();
        broker.add_order(create_test_order(1));
        broker.add_order(create_test_order(2));
        let store = MemoryStateStore::new();
        let (notifier, _rx) = NotificationDispatcher::channel(&NotifyConfig::default());

        let arbiter = Arc::new(Arbiter::new(["scalper"]));
        let oco = Arc::new(OcoMonitor::new(
            Arc::new(broker.clone()),
            Arc::new(store.clone()),
            notifier,
            Duration::from_secs(3),
        ));
        let inbox = CommandInbox::new(
            Arc::new(store.clone()),
            arbiter.clone(),
            oco.clone(),
            Duration::from_secs(1),
        );
        (broker, store, arbiter, oco, inbox)
    }

    #[tokio::test]
    async fn test_queued_commands_reach_monitor_and_arbiter() {
        let (_broker, store, arbiter, oco, inbox) = setup();

        store
            .push_command(&ControlCommand::RegisterOco {
                symbol: "XAUUSD".into(),
                order_a: 1,
                order_b: 2,
            })
            .await
            .unwrap();
        store
            .push_command(&ControlCommand::RegisterIntent {
                ticket: 40,
                intent: Intent {
                    symbol: "XAUUSD".into(),
                    direction: Direction::Buy,
                    entry: 100.0,
                    stop_loss: 95.0,
                    take_profit: 110.0,
                    strategy_tag: Some("scalper".into()),
                },
            })
            .await
            .unwrap();
        store
            .push_command(&ControlCommand::Claim { ticket: 41, tag: "scalper".into() })
            .await
            .unwrap();

        assert_eq!(inbox.drain_once().await, 3);
        assert_eq!(oco.pairs().len(), 1);
        assert_eq!(oco.pairs()[0].status, OcoStatus::Active);

        let (state, _) = arbiter.observe(&create_test_position(40), Utc::now());
        assert_eq!(state.lock().await.owner, Owner::StrategySpecific);

        // The claim waits for the breakeven transition
        let (state, _) = arbiter.observe(&create_test_position(41), Utc::now());
        let mut state = state.lock().await;
        assert_eq!(state.owner, Owner::Generic);
        assert_eq!(arbiter.try_handoff(&mut state).as_deref(), Some("scalper"));
    }

    #[tokio::test]
    async fn test_invalid_commands_are_skipped() {
        let (_broker, store, _arbiter, oco, inbox) = setup();

        for command in [
            ControlCommand::RegisterOco { symbol: "XAUUSD".into(), order_a: 1, order_b: 1 },
            ControlCommand::AcknowledgeOco { group_id: uuid::Uuid::new_v4() },
            ControlCommand::Preregister { ticket: 5, tag: "  ".into() },
            ControlCommand::Claim { ticket: 5, tag: "unknown".into() },
        ] {
            store.push_command(&command).await.unwrap();
        }

        assert_eq!(inbox.drain_once().await, 0);
        assert!(oco.pairs().is_empty());
        assert!(store.drain_commands().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_clears_both_filled_pair() {
        let (broker, store, _arbiter, oco, inbox) = setup();
        let id = oco.register("XAUUSD", 1, 2).await.unwrap();
        broker.set_order_state(1, OrderState::Filled);
        broker.set_order_state(2, OrderState::Filled);
        oco.run_cycle(Utc::now()).await;
        assert_eq!(oco.pair(id).unwrap().status, OcoStatus::BothFilled);

        store
            .push_command(&ControlCommand::AcknowledgeOco { group_id: id })
            .await
            .unwrap();
        assert_eq!(inbox.drain_once().await, 1);
        assert!(oco.pair(id).is_none());
        assert!(store.oco_pair(id).is_none());
    }
}
