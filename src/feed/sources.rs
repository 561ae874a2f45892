use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::broker::{Broker, BrokerError};
use crate::config::ExchangeConfig;
use crate::models::{FeedSource, PriceTick, Quote};

#[derive(Debug, Deserialize)]
struct TickerResponse {
    price: TickerPrice,
}

/// Exchanges disagree on whether prices are strings or numbers
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TickerPrice {
    Number(f64),
    Text(String),
}

impl TickerPrice {
    fn value(&self) -> Option<f64> {
        match self {
            TickerPrice::Number(v) => Some(*v),
            TickerPrice::Text(s) => s.parse().ok(),
        }
    }
}

/// REST ticker client for the reference exchange feed
#[derive(Clone)]
pub struct ExchangeTicker {
    client: Client,
    ticker_url: String,
    symbol_map: HashMap<String, String>,
}

impl ExchangeTicker {
    /// `None` when no ticker endpoint is configured
    pub fn from_config(config: &ExchangeConfig, timeout: Duration) -> Option<Self> {
        let ticker_url = config.ticker_url.clone()?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Some(Self {
            client,
            ticker_url,
            symbol_map: config.symbol_map.clone(),
        })
    }

    fn url_for(&self, symbol: &str) -> String {
        let mapped = self
            .symbol_map
            .get(symbol)
            .map(String::as_str)
            .unwrap_or(symbol);
        self.ticker_url.replace("{symbol}", mapped)
    }

    /// Latest exchange price for a broker symbol
    pub async fn fetch_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        let response = self.client.get(self.url_for(symbol)).send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::Unavailable(format!(
                "exchange ticker returned {}",
                response.status()
            )));
        }

        let body: TickerResponse = response.json().await?;
        body.price
            .value()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| BrokerError::Decode(format!("bad ticker price for {}", symbol)))
    }

    /// Poll every symbol on a fixed cadence, forwarding ticks until the receiver closes
    pub async fn run(self, symbols: Vec<String>, poll: Duration, ticks: mpsc::Sender<PriceTick>) {
        let mut ticker = interval(poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            for symbol in &symbols {
                match self.fetch_price(symbol).await {
                    Ok(price) => {
                        let tick = PriceTick {
                            source: FeedSource::Exchange,
                            symbol: symbol.clone(),
                            price,
                            timestamp: Utc::now(),
                        };
                        if ticks.send(tick).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(symbol = %symbol, "Exchange tick unavailable: {}", e);
                    }
                }
            }
        }
    }
}

/// Broker quote as a synchronizer tick, stamped with the local receive time.
///
/// The broker server clock is not trusted for pairing: exchange ticks are
/// stamped locally too, so both sources share one clock.
fn broker_tick(symbol: &str, quote: &Quote, received_at: DateTime<Utc>) -> PriceTick {
    let skew = received_at - quote.time;
    if skew.num_seconds().abs() > 1 {
        tracing::trace!(
            symbol = %symbol,
            skew_ms = skew.num_milliseconds(),
            "Broker clock differs from local clock"
        );
    }
    PriceTick {
        source: FeedSource::Broker,
        symbol: symbol.to_string(),
        price: quote.mid(),
        timestamp: received_at,
    }
}

/// Forward broker mid prices into the synchronizer
pub async fn pump_broker_quotes(
    broker: Arc<dyn Broker>,
    symbols: Vec<String>,
    poll: Duration,
    ticks: mpsc::Sender<PriceTick>,
) {
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        for symbol in &symbols {
            match broker.get_quote(symbol).await {
                Ok(quote) => {
                    let tick = broker_tick(symbol, &quote, Utc::now());
                    if ticks.send(tick).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(symbol = %symbol, "Broker quote unavailable: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::config::FeedConfig;
    use crate::feed::{FeedHealth, FeedSynchronizer, TickOutcome};

    fn ticker_for(server: &mockito::ServerGuard) -> ExchangeTicker {
        let mut symbol_map = HashMap::new();
        symbol_map.insert("XAUUSD".to_string(), "PAXGUSDT".to_string());
        let config = ExchangeConfig {
            ticker_url: Some(format!("{}/ticker/{{symbol}}", server.url())),
            symbol_map,
            poll_interval_ms: 1_000,
        };
        ExchangeTicker::from_config(&config, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(ExchangeTicker::from_config(&ExchangeConfig::default(), Duration::from_secs(1)).is_none());
    }

    #[tokio::test]
    async fn test_fetch_string_price_with_symbol_mapping() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/ticker/PAXGUSDT")
            .with_status(200)
            .with_body(r#"{"symbol":"PAXGUSDT","price":"2034.15"}"#)
            .create_async()
            .await;

        let price = ticker_for(&server).fetch_price("XAUUSD").await.unwrap();
        assert!((price - 2034.15).abs() < 1e-9);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_numeric_price_unmapped_symbol() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ticker/EURUSD")
            .with_status(200)
            .with_body(r#"{"price":1.0842}"#)
            .create_async()
            .await;

        let price = ticker_for(&server).fetch_price("EURUSD").await.unwrap();
        assert!((price - 1.0842).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fetch_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ticker/PAXGUSDT")
            .with_status(503)
            .create_async()
            .await;

        let result = ticker_for(&server).fetch_price("XAUUSD").await;
        assert!(matches!(result, Err(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_pump_broker_quotes_sends_mid() {
        let broker = PaperBroker::new();
        broker.set_quote("XAUUSD", 2000.0, 2001.0);

        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(pump_broker_quotes(
            Arc::new(broker),
            vec!["XAUUSD".to_string()],
            Duration::from_millis(10),
            tx,
        ));

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.source, FeedSource::Broker);
        assert!((tick.price - 2000.5).abs() < 1e-9);

        drop(rx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_skewed_broker_clock_still_pairs() {
        // Broker server runs two hours ahead of local time
        let broker = PaperBroker::new();
        broker.set_quote_at("XAUUSD", 2000.0, 2001.0, Utc::now() + chrono::Duration::hours(2));

        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(pump_broker_quotes(
            Arc::new(broker),
            vec!["XAUUSD".to_string()],
            Duration::from_millis(10),
            tx,
        ));
        let tick = rx.recv().await.unwrap();
        drop(rx);
        task.await.unwrap();

        assert!((Utc::now() - tick.timestamp).num_seconds().abs() < 5);

        let sync = FeedSynchronizer::new(FeedConfig::default());
        sync.on_tick(PriceTick {
            source: FeedSource::Exchange,
            symbol: "XAUUSD".to_string(),
            price: 2000.0,
            timestamp: tick.timestamp - chrono::Duration::milliseconds(200),
        });
        assert!(matches!(sync.on_tick(tick), TickOutcome::Calibrated { .. }));
    }

    #[test]
    fn test_broker_ticks_share_local_clock() {
        let sync = FeedSynchronizer::new(FeedConfig::default());
        let local = Utc::now();
        let skewed = local + chrono::Duration::hours(2);

        for i in 0..20 {
            let at = local + chrono::Duration::seconds(i);
            sync.on_tick(PriceTick {
                source: FeedSource::Exchange,
                symbol: "XAUUSD".to_string(),
                price: 2000.0,
                timestamp: at,
            });
            let quote = Quote {
                symbol: "XAUUSD".to_string(),
                bid: 2000.4,
                ask: 2000.6,
                time: skewed + chrono::Duration::seconds(i),
            };
            sync.on_tick(broker_tick("XAUUSD", &quote, at + chrono::Duration::milliseconds(150)));
        }

        let now = local + chrono::Duration::seconds(20);
        assert_eq!(sync.health_at("XAUUSD", now), FeedHealth::Healthy);
        assert_eq!(sync.estimate_at("XAUUSD", now).unwrap().sample_count, 20);
    }
}
