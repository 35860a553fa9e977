//! Tradecore - trading engine core
//!
//! Admission control, position exit monitoring and the durable trade ledger
//! for a multi-user automated trading system. Exchange connectivity and
//! signal generation are plugged in through the `ExchangeClient` and
//! `SignalSource` traits.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod logging;
pub mod persistence;
pub mod rate_limit;
