//! Core types for position protection

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Externally assigned position identifier (primary key of the positions table)
pub type PositionId = i64;

/// Direction of the position at entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that flattens a position of this side
    pub fn closing_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LONG" => Ok(PositionSide::Long),
            "SHORT" => Ok(PositionSide::Short),
            other => anyhow::bail!("unknown position side: {}", other),
        }
    }
}

/// Exchange order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which account the position lives in; selects the order-placement path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountType {
    Spot,
    Margin,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Spot => "SPOT",
            AccountType::Margin => "MARGIN",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SPOT" => Ok(AccountType::Spot),
            "MARGIN" => Ok(AccountType::Margin),
            other => anyhow::bail!("unknown account type: {}", other),
        }
    }
}

/// Persisted position status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "OPEN",
            PositionStatus::Closed => "CLOSED",
        }
    }
}

/// Why a close was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerReason {
    TakeProfit,
    StopLoss,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::TakeProfit => "TAKE_PROFIT",
            TriggerReason::StopLoss => "STOP_LOSS",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position under protection. Immutable once watched: threshold changes
/// re-add a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPosition {
    pub id: PositionId,
    pub portfolio_id: i64,
    pub user_id: Option<i64>,
    /// Exchange trading pair, upper-case (e.g. BTCUSDT)
    pub symbol: String,
    pub side: PositionSide,
    pub account_type: AccountType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    /// quantity x entry price at open
    pub entry_value: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl MonitoredPosition {
    pub fn has_threshold(&self) -> bool {
        self.stop_loss.is_some() || self.take_profit.is_some()
    }

    /// Evaluate a price tick. Take-profit is checked before stop-loss.
    pub fn evaluate(&self, price: Decimal) -> Option<TriggerReason> {
        if let Some(tp) = self.take_profit {
            let hit = match self.side {
                PositionSide::Long => price >= tp,
                PositionSide::Short => price <= tp,
            };
            if hit {
                return Some(TriggerReason::TakeProfit);
            }
        }

        if let Some(sl) = self.stop_loss {
            let hit = match self.side {
                PositionSide::Long => price <= sl,
                PositionSide::Short => price >= sl,
            };
            if hit {
                return Some(TriggerReason::StopLoss);
            }
        }

        None
    }
}

/// Work item for the execution queue
#[derive(Debug, Clone, Serialize)]
pub struct CloseRequest {
    pub position: MonitoredPosition,
    pub trigger_price: Decimal,
    pub reason: TriggerReason,
    pub requested_at: DateTime<Utc>,
}

impl CloseRequest {
    pub fn new(position: MonitoredPosition, trigger_price: Decimal, reason: TriggerReason) -> Self {
        Self {
            position,
            trigger_price,
            reason,
            requested_at: Utc::now(),
        }
    }
}

/// Outcome of a close attempt, reported back to the price stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// Position closed on the exchange and persisted
    Closed(PositionId),
    /// Attempt failed; the position stays watched and may trigger again
    RetryPending(PositionId),
    /// Attempt budget exhausted; stop watching, manual intervention needed
    Abandoned(PositionId),
}

/// Read-only snapshot of the price stream state
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub monitored_positions: usize,
    pub active_symbols: usize,
    pub symbols: Vec<String>,
    pub connected: bool,
    pub reconnect_attempts: u32,
}

/// Read-only snapshot of the execution queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub processing: bool,
    pub pending_position_ids: Vec<PositionId>,
}

/// Position row as persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub portfolio_id: i64,
    pub user_id: Option<i64>,
    pub symbol: String,
    pub side: PositionSide,
    pub account_type: AccountType,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_value: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: PositionStatus,
    pub exit_price: Option<Decimal>,
    pub exit_value: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_percent: Option<Decimal>,
    pub warning_message: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Snapshot for monitoring; `None` when closed or unprotected
    pub fn to_monitored(&self) -> Option<MonitoredPosition> {
        if self.status != PositionStatus::Open {
            return None;
        }
        let monitored = MonitoredPosition {
            id: self.id,
            portfolio_id: self.portfolio_id,
            user_id: self.user_id,
            symbol: self.symbol.to_uppercase(),
            side: self.side,
            account_type: self.account_type,
            quantity: self.quantity,
            entry_price: self.entry_price,
            entry_value: self.entry_value,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
        };
        monitored.has_threshold().then_some(monitored)
    }
}

/// Realised result of closing a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitPnl {
    pub exit_price: Decimal,
    pub exit_value: Decimal,
    pub pnl: Decimal,
    pub pnl_percent: Decimal,
}

impl ExitPnl {
    pub fn compute(position: &MonitoredPosition, exit_price: Decimal, exit_value: Decimal) -> Self {
        let pnl = match position.side {
            PositionSide::Long => (exit_price - position.entry_price) * position.quantity,
            PositionSide::Short => (position.entry_price - exit_price) * position.quantity,
        };
        let pnl_percent = if position.entry_value.is_zero() {
            Decimal::ZERO
        } else {
            pnl / position.entry_value * Decimal::ONE_HUNDRED
        };
        Self {
            exit_price,
            exit_value,
            pnl,
            pnl_percent,
        }
    }
}
