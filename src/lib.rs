//! Position Guard Library
//!
//! Automatic stop-loss / take-profit execution for open exchange positions.
//!
//! A single market data connection watches every symbol referenced by a
//! protected position. When a price tick crosses a position's threshold, the
//! execution queue places a closing market order, records the exit and P&L,
//! and the position stops being watched. Failed closes are retried on later
//! ticks up to a fixed budget before the position is flagged for manual handling.

pub mod api;
pub mod config;
pub mod db;
pub mod services;
pub mod types;
pub mod vault;

pub use config::Config;
pub use db::{Database, PositionStore};
pub use services::GuardCoordinator;
pub use types::{
    AccountType, CloseRequest, MonitorStats, MonitoredPosition, Position, PositionId, PositionSide,
    QueueEvent, QueueStatus, TriggerReason,
};
