//! Order types, role tags and the broker-side order state machine

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed quantity: positive for buys, negative for sells
    pub fn signed(&self, quantity: i32) -> i32 {
        match self {
            Self::Buy => quantity,
            Self::Sell => -quantity,
        }
    }

    /// Price direction multiplier for a position opened on this side
    pub fn direction(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
}

/// Broker-side order state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Submitted, not yet acknowledged
    PendingSubmit,
    /// Acknowledged by the broker
    Accepted,
    /// Resting at the exchange
    Working,
    /// Order partially filled
    PartiallyFilled,
    /// Order completely filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by broker or exchange
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }

    /// Position in the lifecycle. Updates never legitimately move backwards.
    fn rank(&self) -> u8 {
        match self {
            Self::PendingSubmit => 0,
            Self::Accepted => 1,
            Self::Working => 2,
            Self::PartiallyFilled => 3,
            Self::Filled | Self::Cancelled | Self::Rejected => 4,
        }
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingSubmit => write!(f, "PENDING"),
            Self::Accepted => write!(f, "ACCEPTED"),
            Self::Working => write!(f, "WORKING"),
            Self::PartiallyFilled => write!(f, "PARTIAL"),
            Self::Filled => write!(f, "FILLED"),
            Self::Cancelled => write!(f, "CANCELLED"),
            Self::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Logical role an order plays in a round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderRole {
    Entry,
    StopLoss,
    ProfitTarget,
    SessionExit,
    ManualExit,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::StopLoss => "stop-loss",
            Self::ProfitTarget => "profit-target",
            Self::SessionExit => "session-exit",
            Self::ManualExit => "manual-exit",
        }
    }

    pub fn is_protective(&self) -> bool {
        matches!(self, Self::StopLoss | Self::ProfitTarget)
    }

    /// The other half of the bracket
    pub fn sibling(&self) -> Option<Self> {
        match self {
            Self::StopLoss => Some(Self::ProfitTarget),
            Self::ProfitTarget => Some(Self::StopLoss),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entry" => Ok(Self::Entry),
            "stop-loss" => Ok(Self::StopLoss),
            "profit-target" => Ok(Self::ProfitTarget),
            "session-exit" => Ok(Self::SessionExit),
            "manual-exit" => Ok(Self::ManualExit),
            _ => Err(()),
        }
    }
}

/// Stable name attached to every submitted order: `<role>#<round trip>`.
///
/// Broker callbacks are bound back to their role through this tag, never
/// through object identity. Re-submitted exits within one round trip carry
/// an attempt suffix (`manual-exit#4.1`) so a late callback for a failed
/// attempt can never be mistaken for its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderTag {
    pub role: OrderRole,
    pub round_trip: u64,
    pub attempt: u32,
}

impl OrderTag {
    pub fn new(role: OrderRole, round_trip: u64) -> Self {
        Self { role, round_trip, attempt: 0 }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn parse(name: &str) -> Option<Self> {
        let (role, rest) = name.split_once('#')?;
        let (round_trip, attempt) = match rest.split_once('.') {
            Some((round_trip, attempt)) => (round_trip, attempt.parse().ok()?),
            None => (rest, 0),
        };
        Some(Self {
            role: role.parse().ok()?,
            round_trip: round_trip.parse().ok()?,
            attempt,
        })
    }
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.attempt {
            0 => write!(f, "{}#{}", self.role, self.round_trip),
            n => write!(f, "{}#{}.{}", self.role, self.round_trip, n),
        }
    }
}

/// Request handed to the broker session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub name: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: i32,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    /// Native one-cancels-other group, when the broker supports linked orders
    pub oco_group: Option<String>,
}

impl OrderRequest {
    pub fn market(tag: OrderTag, symbol: &str, side: OrderSide, quantity: i32) -> Self {
        Self {
            name: tag.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            limit_price: None,
            stop_price: None,
            oco_group: None,
        }
    }

    pub fn stop(
        tag: OrderTag,
        symbol: &str,
        side: OrderSide,
        quantity: i32,
        stop_price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::StopMarket,
            stop_price: Some(stop_price),
            ..Self::market(tag, symbol, side, quantity)
        }
    }

    pub fn limit(
        tag: OrderTag,
        symbol: &str,
        side: OrderSide,
        quantity: i32,
        limit_price: f64,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(tag, symbol, side, quantity)
        }
    }

    pub fn with_oco_group(mut self, group: Option<String>) -> Self {
        self.oco_group = group;
        self
    }
}

/// Broker order snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Broker order ID. Not stable across submit/callback boundaries.
    pub id: Uuid,

    /// Role tag (see [`OrderTag`])
    pub name: String,

    pub symbol: String,

    pub side: OrderSide,

    pub order_type: OrderType,

    /// Quantity in contracts
    pub quantity: i32,

    pub filled_quantity: i32,

    /// Limit price (for limit orders)
    pub limit_price: Option<f64>,

    /// Stop price (for stop orders)
    pub stop_price: Option<f64>,

    pub state: OrderState,

    /// Average fill price
    pub avg_fill_price: Option<f64>,

    pub oco_group: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Broker sequence number, bumped on every change to the order
    #[serde(default)]
    pub revision: u64,
}

impl Order {
    /// Build a fresh snapshot for a request, as a broker would on submission
    pub fn from_request(request: &OrderRequest, state: OrderState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            filled_quantity: 0,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            state,
            avg_fill_price: None,
            oco_group: request.oco_group.clone(),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn tag(&self) -> Option<OrderTag> {
        OrderTag::parse(&self.name)
    }

    /// Check if order is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if order can still fill, be cancelled or be amended
    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn remaining(&self) -> i32 {
        (self.quantity - self.filled_quantity).max(0)
    }

    /// Update order state
    pub fn update_state(&mut self, state: OrderState) {
        self.state = state;
        self.touch();
    }

    /// Change quantity and/or working prices. `None` keeps the current price.
    pub fn amend(&mut self, quantity: i32, limit_price: Option<f64>, stop_price: Option<f64>) {
        self.quantity = quantity;
        if limit_price.is_some() {
            self.limit_price = limit_price;
        }
        if stop_price.is_some() {
            self.stop_price = stop_price;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Record a fill
    pub fn record_fill(&mut self, fill_quantity: i32, fill_price: f64) {
        let prev_value = self.avg_fill_price.unwrap_or(0.0) * self.filled_quantity as f64;
        let new_value = fill_price * fill_quantity as f64;
        self.filled_quantity += fill_quantity;
        self.avg_fill_price = Some((prev_value + new_value) / self.filled_quantity as f64);
        self.touch();

        if self.filled_quantity >= self.quantity {
            self.state = OrderState::Filled;
        } else {
            self.state = OrderState::PartiallyFilled;
        }
    }

    /// Whether this snapshot carries newer information than `previous`.
    ///
    /// Terminal snapshots are final, states and fills never move backwards,
    /// and a same-state snapshot only counts when its revision is newer.
    /// Re-delivering an update, late or not, therefore never applies.
    pub fn supersedes(&self, previous: &Order) -> bool {
        if previous.is_terminal() || self.filled_quantity < previous.filled_quantity {
            return false;
        }
        match self.state.rank().cmp(&previous.state.rank()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.revision > previous.revision,
        }
    }
}

/// One broker execution (fill) report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Unique per fill; used to drop duplicate reports
    pub execution_id: String,
    pub order_id: Uuid,
    pub order_name: String,
    pub side: OrderSide,
    pub quantity: i32,
    pub price: f64,
    pub time: DateTime<Utc>,
}

impl Execution {
    pub fn tag(&self) -> Option<OrderTag> {
        OrderTag::parse(&self.order_name)
    }
}
