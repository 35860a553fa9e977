//! Admission decisions and the reasons a trade is refused

use crate::domain::services::daily_limit::Reservation;
use serde::Serialize;
use thiserror::Error;

/// Why a trade candidate was not admitted.
///
/// These are normal outcomes returned to the caller, never raised.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum RejectionReason {
    /// Drawdown reached the (volatility adjusted) cap
    #[error("Drawdown limit reached: {drawdown:.4} >= {limit:.4}")]
    DrawdownLimit { drawdown: f64, limit: f64 },

    /// Nothing left in the current window, or less than one minimum trade
    #[error("Daily budget exhausted: remaining {remaining:.2}")]
    DailyBudget { remaining: f64 },

    /// Process-wide market pause is active
    #[error("Market circuit breaker open for {remaining_secs}s")]
    MarketPaused { remaining_secs: u64 },

    /// Reference market data could not be fetched for this user
    #[error("User suspended after market data errors for {remaining_secs}s")]
    UserSuspended { remaining_secs: u64 },

    /// Balance fetches exhausted their retries
    #[error("Balance fetch suspended for {remaining_secs}s")]
    BalanceSuspended { remaining_secs: u64 },

    /// No price route for the symbol or an empty deposit valuation
    #[error("Price unavailable: {reason}")]
    PriceUnavailable { reason: String },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Order placement failed: {reason}")]
    OrderFailed { reason: String },

    #[error("Engine is shutting down")]
    ShuttingDown,

    /// The trade ledger stopped accepting writes; fills could not be recorded
    #[error("Ledger unavailable: {reason}")]
    LedgerUnavailable { reason: String },
}

impl RejectionReason {
    /// Short code for logging/monitoring
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::DrawdownLimit { .. } => "ERR_DRAWDOWN_LIMIT",
            RejectionReason::DailyBudget { .. } => "ERR_DAILY_BUDGET",
            RejectionReason::MarketPaused { .. } => "ERR_MARKET_PAUSED",
            RejectionReason::UserSuspended { .. } => "ERR_USER_SUSPENDED",
            RejectionReason::BalanceSuspended { .. } => "ERR_BALANCE_SUSPENDED",
            RejectionReason::PriceUnavailable { .. } => "ERR_PRICE_UNAVAILABLE",
            RejectionReason::InvalidInput { .. } => "ERR_INVALID_INPUT",
            RejectionReason::OrderFailed { .. } => "ERR_ORDER_PLACEMENT",
            RejectionReason::ShuttingDown => "ERR_SHUTTING_DOWN",
            RejectionReason::LedgerUnavailable { .. } => "ERR_LEDGER_UNAVAILABLE",
        }
    }

    /// Whether asking again later may give a different answer
    pub fn is_transient(&self) -> bool {
        match self {
            RejectionReason::MarketPaused { .. }
            | RejectionReason::UserSuspended { .. }
            | RejectionReason::BalanceSuspended { .. }
            | RejectionReason::PriceUnavailable { .. }
            | RejectionReason::DailyBudget { .. }
            | RejectionReason::OrderFailed { .. } => true,

            RejectionReason::DrawdownLimit { .. }
            | RejectionReason::InvalidInput { .. }
            | RejectionReason::ShuttingDown
            | RejectionReason::LedgerUnavailable { .. } => false,
        }
    }
}

/// Outcome of `admit_trade`
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionDecision {
    /// Base-asset amount to order; 0 when not approved
    pub amount: f64,
    pub approved: bool,
    pub reason: Option<RejectionReason>,
    /// Budget held for this trade until the order settles
    pub reservation: Option<Reservation>,
    pub fraction: f64,
}

impl AdmissionDecision {
    pub fn approve(reservation: Reservation, fraction: f64) -> Self {
        Self {
            amount: reservation.amount,
            approved: true,
            reason: None,
            reservation: Some(reservation),
            fraction,
        }
    }

    pub fn reject(reason: RejectionReason) -> Self {
        Self {
            amount: 0.0,
            approved: false,
            reason: Some(reason),
            reservation: None,
            fraction: 0.0,
        }
    }

    /// Human readable reason, empty when approved
    pub fn reason_text(&self) -> String {
        self.reason
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default()
    }
}
