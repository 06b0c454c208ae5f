//! TCP endpoint monitoring with threshold-based alerting.
//!
//! A scheduler probes customer-configured `ip:port` targets on their check
//! intervals, a pure state machine turns consecutive failures into alert,
//! escalation and recovery notifications, and a rate-limited delivery
//! queue pushes them out through a Telegram transport.

pub mod audit;
pub mod config;
pub mod delivery;
pub mod monitor;
pub mod store;
