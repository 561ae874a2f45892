use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tradeguard::broker::PaperBroker;
use tradeguard::config::{FeedConfig, NotifyConfig};
use tradeguard::execution::OcoMonitor;
use tradeguard::feed::{FeedHealth, FeedSynchronizer, TickOutcome};
use tradeguard::notify::{Notification, NotificationDispatcher, Severity};
use tradeguard::persistence::MemoryStateStore;
use tradeguard::{Direction, FeedSource, OcoStatus, Order, OrderState, PriceTick};

fn pending(id: u64, direction: Direction, price: f64) -> Order {
    Order {
        id,
        symbol: "EURUSD".to_string(),
        direction,
        price,
        volume: 0.2,
        state: OrderState::Pending,
    }
}

fn monitor(
    broker: &PaperBroker,
    store: &MemoryStateStore,
) -> (OcoMonitor, mpsc::Receiver<Notification>) {
    let (notifier, rx) = NotificationDispatcher::channel(&NotifyConfig::default());
    let monitor = OcoMonitor::new(
        Arc::new(broker.clone()),
        Arc::new(store.clone()),
        notifier,
        std::time::Duration::from_secs(3),
    );
    (monitor, rx)
}

fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_filled_leg_cancels_sibling() {
    let broker = PaperBroker::new();
    broker.add_order(pending(11, Direction::Buy, 1.0850));
    broker.add_order(pending(12, Direction::Sell, 1.0790));
    let store = MemoryStateStore::new();
    let (monitor, mut rx) = monitor(&broker, &store);

    let id = tokio_test::assert_ok!(monitor.register("EURUSD", 11, 12).await);
    assert_eq!(store.oco_pair(id).unwrap().status, OcoStatus::Active);

    broker.set_order_state(11, OrderState::Filled);
    assert_eq!(monitor.run_cycle(Utc::now()).await, 1);

    assert_eq!(broker.cancel_calls(), vec![12]);
    assert_eq!(broker.order(12).unwrap().state, OrderState::Cancelled);
    assert!(monitor.pair(id).is_none());
    assert!(store.oco_pair(id).is_none());

    let notes = drain(&mut rx);
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].severity, Severity::Info);
    assert!(notes[0].message.contains("FILLED_A"));
}

#[tokio::test]
async fn test_both_filled_alerts_once_and_survives_restart() {
    let broker = PaperBroker::new();
    broker.add_order(pending(21, Direction::Buy, 1.0850));
    broker.add_order(pending(22, Direction::Sell, 1.0790));
    let store = MemoryStateStore::new();
    let (first, mut rx) = monitor(&broker, &store);

    let id = first.register("EURUSD", 21, 22).await.unwrap();
    broker.set_order_state(22, OrderState::Filled);
    broker.fill_before_cancel(21);

    first.run_cycle(Utc::now()).await;
    first.run_cycle(Utc::now()).await;

    let pair = first.pair(id).unwrap();
    assert_eq!(pair.status, OcoStatus::BothFilled);
    assert!(pair.alerted);

    let critical: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|n| n.severity == Severity::Critical)
        .collect();
    assert_eq!(critical.len(), 1);

    // A restarted monitor still shows the pair for review without alerting again
    let (second, mut rx) = monitor(&broker, &store);
    assert_eq!(second.restore().await.unwrap(), 1);
    second.run_cycle(Utc::now()).await;
    assert_eq!(second.pair(id).unwrap().status, OcoStatus::BothFilled);
    assert!(drain(&mut rx).is_empty());

    assert!(second.acknowledge(id).await.unwrap());
    assert!(store.oco_pair(id).is_none());
}

#[tokio::test]
async fn test_pairs_resume_after_restart() {
    let broker = PaperBroker::new();
    broker.add_order(pending(31, Direction::Buy, 1.0850));
    broker.add_order(pending(32, Direction::Sell, 1.0790));
    let store = MemoryStateStore::new();

    let (first, _rx) = monitor(&broker, &store);
    let id = first.register("EURUSD", 31, 32).await.unwrap();
    first.run_cycle(Utc::now()).await;
    drop(first);

    // Leg B filled while the monitor was down
    broker.set_order_state(32, OrderState::Filled);

    let (second, _rx) = monitor(&broker, &store);
    second.restore().await.unwrap();
    assert_eq!(second.run_cycle(Utc::now()).await, 1);
    assert_eq!(broker.order(31).unwrap().state, OrderState::Cancelled);
    assert!(second.pair(id).is_none());
}

#[test]
fn test_synchronizer_calibrates_and_rejects_spikes() {
    let sync = FeedSynchronizer::new(FeedConfig::default());
    let start = Utc.with_ymd_and_hms(2026, 3, 2, 14, 0, 0).unwrap();
    let tick = |source, price, at| PriceTick {
        source,
        symbol: "XAUUSD".to_string(),
        price,
        timestamp: at,
    };

    let mut ticks = Vec::new();
    for i in 0..8 {
        let at = start + Duration::seconds(i);
        ticks.push(tick(FeedSource::Exchange, 2000.0, at));
        ticks.push(tick(FeedSource::Broker, 2000.8, at + Duration::milliseconds(200)));
    }
    for t in &ticks {
        sync.on_tick(t.clone());
    }

    let now = start + Duration::seconds(8);
    let estimate = sync.estimate_at("XAUUSD", now).unwrap();
    assert!((estimate.offset - 0.8).abs() < 1e-9);
    assert_eq!(estimate.sample_count, 8);
    assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Healthy);

    // Replaying the same stream changes nothing
    for t in ticks {
        assert_eq!(sync.on_tick(t), TickOutcome::Ignored);
    }
    assert_eq!(sync.estimate_at("XAUUSD", now).unwrap().sample_count, 8);

    // A 20 dollar gap is far outside the band
    let at = start + Duration::seconds(9);
    sync.on_tick(tick(FeedSource::Exchange, 2000.0, at));
    let outcome = sync.on_tick(tick(FeedSource::Broker, 2020.0, at));
    assert!(matches!(outcome, TickOutcome::Outlier { .. }));
    assert!((sync.translate(2000.0, "XAUUSD").unwrap() - 2000.8).abs() < 1e-9);
}
