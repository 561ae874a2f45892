use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    BarSource, Broker, BrokerError, CancelOutcome, CloseOutcome, ExponentialBackoff, ModifyOutcome,
};
use crate::config::BrokerConfig;
use crate::models::{Bar, Order, OrderId, Position, Quote, SymbolSpec, Ticket, Timeframe};

type BridgeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Reconnect state private to one handle
#[derive(Debug)]
struct ConnectionGate {
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

/// REST client for the broker bridge.
///
/// Every component builds its own handle, so a backoff triggered by one
/// component's failures never gates another component's requests.
#[derive(Clone)]
pub struct HttpBroker {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<BridgeRateLimiter>,
    gate: Arc<Mutex<ConnectionGate>>,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    closed_volume: Option<f64>,
}

impl ActionResponse {
    fn reason(&self) -> String {
        self.message.clone().unwrap_or_else(|| self.status.clone())
    }
}

#[derive(Debug, Deserialize)]
struct BarResponse {
    time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

impl HttpBroker {
    /// Create a handle for one component; `name` tags its log lines
    pub fn new(config: &BrokerConfig, name: &str) -> Result<Self, BrokerError> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.rate_limit_per_sec.max(1)).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let backoff = ExponentialBackoff::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            0.1,
        );

        Ok(Self {
            name: name.to_string(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            rate_limiter,
            gate: Arc::new(Mutex::new(ConnectionGate {
                backoff,
                retry_at: None,
            })),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fail fast while this handle is backing off
    fn check_gate(&self) -> Result<(), BrokerError> {
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        match gate.retry_at {
            Some(at) if Instant::now() < at => Err(BrokerError::Unavailable(format!(
                "{} handle backing off after {} failures",
                self.name,
                gate.backoff.attempt()
            ))),
            _ => Ok(()),
        }
    }

    fn record_success(&self) {
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if gate.retry_at.is_some() {
            tracing::info!(handle = %self.name, "Broker bridge reachable again");
        }
        gate.backoff.reset();
        gate.retry_at = None;
    }

    fn record_failure(&self, error: &BrokerError) {
        if !matches!(error, BrokerError::Unavailable(_) | BrokerError::Timeout) {
            return;
        }
        let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        let delay = gate.backoff.next_delay();
        gate.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            handle = %self.name,
            attempt = gate.backoff.attempt(),
            "Broker bridge failure ({}), backing off {:?}",
            error,
            delay
        );
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BrokerError> {
        self.check_gate()?;
        self.rate_limiter.until_ready().await;

        let request = match &self.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        };

        let result = match request.send().await {
            Ok(response) if response.status().is_server_error() => Err(BrokerError::Unavailable(
                format!("bridge returned {}", response.status()),
            )),
            Ok(response) => Ok(response),
            Err(e) => Err(BrokerError::from(e)),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
        result
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BrokerError> {
        let response = self.send(self.client.get(self.url(path))).await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Rejected(format!("{}: {}", status, text)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))
    }

    async fn post_action(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<ActionResponse, BrokerError> {
        let response = self
            .send(self.client.post(self.url(path)).json(&body))
            .await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(ActionResponse {
                status: "not_found".to_string(),
                message: None,
                closed_volume: None,
            });
        }

        response
            .json::<ActionResponse>()
            .await
            .map_err(|e| BrokerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Broker for HttpBroker {
    async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.get_json("/positions").await
    }

    /// `GET /orders` must keep terminal orders listed (state `Filled`,
    /// `Cancelled` or `Expired`) after they leave the pending book
    async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.get_json("/orders").await
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        self.get_json(&format!("/quote/{}", symbol)).await
    }

    async fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError> {
        self.get_json(&format!("/symbols/{}", symbol)).await
    }

    async fn modify_stop(
        &self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: Option<f64>,
    ) -> Result<ModifyOutcome, BrokerError> {
        let response = self
            .post_action(
                &format!("/positions/{}/modify", ticket),
                serde_json::json!({ "sl": stop_loss, "tp": take_profit }),
            )
            .await?;

        Ok(match response.status.as_str() {
            "ok" => ModifyOutcome::Applied,
            "no_change" => ModifyOutcome::NoChange,
            _ => ModifyOutcome::Rejected(response.reason()),
        })
    }

    async fn close(
        &self,
        ticket: Ticket,
        volume_fraction: f64,
    ) -> Result<CloseOutcome, BrokerError> {
        let response = self
            .post_action(
                &format!("/positions/{}/close", ticket),
                serde_json::json!({ "fraction": volume_fraction }),
            )
            .await?;

        Ok(match response.status.as_str() {
            "ok" => CloseOutcome::Closed {
                closed_volume: response.closed_volume.unwrap_or(0.0),
            },
            "already_closed" | "not_found" => CloseOutcome::AlreadyClosed,
            _ => CloseOutcome::Rejected(response.reason()),
        })
    }

    async fn cancel(&self, order_id: OrderId) -> Result<CancelOutcome, BrokerError> {
        let response = self
            .post_action(&format!("/orders/{}/cancel", order_id), serde_json::json!({}))
            .await?;

        Ok(match response.status.as_str() {
            "ok" => CancelOutcome::Cancelled,
            "already_filled" => CancelOutcome::AlreadyFilled,
            "not_found" | "already_cancelled" => CancelOutcome::AlreadyGone,
            _ => CancelOutcome::Rejected(response.reason()),
        })
    }
}

#[async_trait]
impl BarSource for HttpBroker {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, BrokerError> {
        let rows: Vec<BarResponse> = self
            .get_json(&format!("/bars/{}/{}?count={}", symbol, timeframe, count))
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| Bar {
                symbol: symbol.to_string(),
                timeframe,
                open_time: row.time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            })
            .collect())
    }
}
