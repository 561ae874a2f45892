use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Broker-owned position identifier
pub type Ticket = u64;

/// Broker-owned pending order identifier
pub type OrderId = u64;

/// Bar period
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Length of one bar
    pub fn period(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    /// Length of one bar in seconds
    pub fn seconds(&self) -> i64 {
        self.period().num_seconds()
    }

    /// Default buffer capacity: ~24h for fast series, shallower for slow ones
    pub fn default_capacity(&self) -> usize {
        match self {
            Timeframe::M1 => 1440,
            Timeframe::M5 => 576,
            Timeframe::M15 => 384,
            Timeframe::M30 => 240,
            Timeframe::H1 => 168,
            Timeframe::H4 => 50,
            Timeframe::D1 => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "M1" | "1M" => Ok(Timeframe::M1),
            "M5" | "5M" => Ok(Timeframe::M5),
            "M15" | "15M" => Ok(Timeframe::M15),
            "M30" | "30M" => Ok(Timeframe::M30),
            "H1" | "1H" => Ok(Timeframe::H1),
            "H4" | "4H" => Ok(Timeframe::H4),
            "D1" | "1D" => Ok(Timeframe::D1),
            other => Err(format!("Unknown timeframe: {}", other)),
        }
    }
}

/// OHLCV bar, immutable once closed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Time at which this bar stops accepting updates
    pub fn close_time(&self) -> DateTime<Utc> {
        self.open_time + self.timeframe.period()
    }

    pub fn is_closed_at(&self, now: DateTime<Utc>) -> bool {
        self.close_time() <= now
    }
}

/// Which of the two real-time feeds a tick came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FeedSource {
    Broker,
    Exchange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceTick {
    pub source: FeedSource,
    pub symbol: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for longs, -1 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }
}

/// Open position as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub opened_at: DateTime<Utc>,
    /// Free-form order comment; may carry a strategy tag
    #[serde(default)]
    pub comment: Option<String>,
}

impl Position {
    /// Signed price move in the position's favour
    pub fn profit_distance(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.direction.sign()
    }

    /// True if `candidate` is a tighter (more protective) stop than the current one
    pub fn stop_improves(&self, candidate: f64) -> bool {
        match self.stop_loss {
            None => true,
            Some(current) => match self.direction {
                Direction::Buy => candidate > current,
                Direction::Sell => candidate < current,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Filled,
    Cancelled,
    Expired,
}

/// Pending order as reported by the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,
    pub volume: f64,
    pub state: OrderState,
}

/// Top of book from the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub time: DateTime<Utc>,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        (self.ask - self.bid).max(0.0)
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// Price at which a position in `direction` would be closed
    pub fn exit_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Buy => self.bid,
            Direction::Sell => self.ask,
        }
    }
}

/// Broker trading constraints for one instrument
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SymbolSpec {
    pub symbol: String,
    pub min_volume: f64,
    pub volume_step: f64,
    /// Minimum distance between market price and a stop, in price units
    pub stops_level: f64,
}

impl SymbolSpec {
    /// Round a volume down to the broker's lot step
    pub fn round_volume(&self, volume: f64) -> f64 {
        if self.volume_step <= 0.0 {
            return volume;
        }
        let steps = (volume / self.volume_step + 1e-9).floor();
        steps * self.volume_step
    }
}

/// Trade idea from the signal layer; only `strategy_tag` is consumed here
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub strategy_tag: Option<String>,
}

/// Exit management stage; advances forward only
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStage {
    Initial,
    BreakevenSet,
    PartialTaken,
    Trailing,
}

impl fmt::Display for ExitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitStage::Initial => "INITIAL",
            ExitStage::BreakevenSet => "BREAKEVEN_SET",
            ExitStage::PartialTaken => "PARTIAL_TAKEN",
            ExitStage::Trailing => "TRAILING",
        };
        f.write_str(s)
    }
}

/// Which controller may mutate a ticket's stops
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Owner {
    Generic,
    StrategySpecific,
    Unassigned,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Owner::Generic => "GENERIC",
            Owner::StrategySpecific => "STRATEGY_SPECIFIC",
            Owner::Unassigned => "UNASSIGNED",
        };
        f.write_str(s)
    }
}

/// Per-position exit management state, persisted across restarts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExitState {
    pub ticket: Ticket,
    pub symbol: String,
    pub stage: ExitStage,
    pub owner: Owner,
    pub strategy_tag: Option<String>,
    /// Entry to target distance; `None` until it can be derived
    pub planned_distance: Option<f64>,
    pub initial_volume: f64,
    pub consecutive_failures: u32,
    /// Set once the generic controller handed the ticket over
    pub handed_off: bool,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl ExitState {
    pub fn new(position: &Position, owner: Owner, strategy_tag: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            ticket: position.ticket,
            symbol: position.symbol.clone(),
            stage: ExitStage::Initial,
            owner,
            strategy_tag,
            planned_distance: None,
            initial_volume: position.volume,
            consecutive_failures: 0,
            handed_off: false,
            created_at: now,
            last_update_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OcoStatus {
    Active,
    FilledA,
    FilledB,
    Cancelled,
    /// Both sides filled; needs manual review
    BothFilled,
}

impl OcoStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OcoStatus::Active)
    }
}

impl fmt::Display for OcoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OcoStatus::Active => "ACTIVE",
            OcoStatus::FilledA => "FILLED_A",
            OcoStatus::FilledB => "FILLED_B",
            OcoStatus::Cancelled => "CANCELLED",
            OcoStatus::BothFilled => "BOTH_FILLED",
        };
        f.write_str(s)
    }
}

/// Two pending orders where a fill on one cancels the other
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OcoPair {
    pub group_id: Uuid,
    pub symbol: String,
    pub order_a: OrderId,
    pub order_b: OrderId,
    pub status: OcoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Protection-failure alert already raised
    #[serde(default)]
    pub alerted: bool,
}

impl OcoPair {
    pub fn new(symbol: &str, order_a: OrderId, order_b: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            group_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            order_a,
            order_b,
            status: OcoStatus::Active,
            created_at: now,
            updated_at: now,
            alerted: false,
        }
    }
}

/// Operator or signal-layer request queued for the running service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Start watching two pending orders as a linked pair
    RegisterOco {
        symbol: String,
        order_a: OrderId,
        order_b: OrderId,
    },
    /// Clear a BOTH_FILLED pair after manual review
    AcknowledgeOco { group_id: Uuid },
    /// Trade intent behind a ticket that is about to open
    RegisterIntent { ticket: Ticket, intent: Intent },
    /// Strategy tag for a ticket that is about to open
    Preregister { ticket: Ticket, tag: String },
    /// Strategy claim on a generically managed ticket
    Claim { ticket: Ticket, tag: String },
}
