//! Per-user risk and daily budget state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRiskState {
    pub user_id: String,
    /// Last valuated deposit in the quote currency
    pub deposit: f64,
    pub daily_limit: f64,
    pub daily_used: f64,
    pub trade_volume: f64,
    pub last_reset: DateTime<Utc>,
    /// First valuation seen for this user; baseline for drawdown
    pub initial_deposit: f64,
    pub current_deposit: f64,
    /// Present only while a circuit breaker is open for this user
    pub suspended_until: Option<DateTime<Utc>>,
}

impl UserRiskState {
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            deposit: 0.0,
            daily_limit: 0.0,
            daily_used: 0.0,
            trade_volume: 0.0,
            last_reset: now,
            initial_deposit: 0.0,
            current_deposit: 0.0,
            suspended_until: None,
        }
    }

    pub fn remaining_budget(&self) -> f64 {
        self.daily_limit - self.daily_used
    }

    /// Fractional loss relative to the initial deposit; 0 when undefined.
    pub fn drawdown(&self) -> f64 {
        if self.initial_deposit <= 0.0 {
            return 0.0;
        }
        (self.initial_deposit - self.current_deposit) / self.initial_deposit
    }

    pub fn is_suspended(&self, now: DateTime<Utc>) -> bool {
        self.suspended_until.map(|until| now < until).unwrap_or(false)
    }
}
