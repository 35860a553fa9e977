use crate::domain::entities::market::MarketConditions;
use crate::domain::entities::order::OrderSide;
use crate::domain::errors::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remaining amounts below this are treated as fully closed
const AMOUNT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Side of the order that opens a position of this side
    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    /// Side of the order that reduces a position of this side
    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    pub fn from_order_side(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

/// Exit levels fixed once at entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitLevels {
    pub stop_loss_fraction: f64,
    pub take_profit_drop_fraction: f64,
}

/// Open trade being watched by a position monitor.
///
/// Invariant: `amount > 0` while `status != Closed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: String,
    pub user_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub amount: f64,
    pub initial_amount: f64,
    /// Best price since entry (highest for longs, lowest for shorts)
    pub peak_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_drop_fraction: f64,
    pub strategy_tag: Option<String>,
    pub market_conditions: MarketConditions,
    pub status: PositionStatus,
    /// Sum of realized PNL over every close event so far
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        trade_id: &str,
        user_id: &str,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        amount: f64,
        levels: ExitLevels,
        strategy_tag: Option<String>,
        market_conditions: MarketConditions,
    ) -> Result<Self, ValidationError> {
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(ValidationError::InvalidPrice(format!(
                "entry price must be positive, got {}",
                entry_price
            )));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(format!(
                "position amount must be positive, got {}",
                amount
            )));
        }

        let stop_loss_price = match side {
            PositionSide::Long => entry_price * (1.0 - levels.stop_loss_fraction),
            PositionSide::Short => entry_price * (1.0 + levels.stop_loss_fraction),
        };

        Ok(Position {
            trade_id: trade_id.to_string(),
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            amount,
            initial_amount: amount,
            peak_price: entry_price,
            stop_loss_price,
            take_profit_drop_fraction: levels.take_profit_drop_fraction,
            strategy_tag,
            market_conditions,
            status: PositionStatus::Open,
            realized_pnl: 0.0,
            opened_at: Utc::now(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed
    }

    /// Unrealized profit as a fraction of entry price
    pub fn profit_fraction(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - price) / self.entry_price,
        }
    }

    pub fn is_stop_loss_hit(&self, price: f64) -> bool {
        match self.side {
            PositionSide::Long => price <= self.stop_loss_price,
            PositionSide::Short => price >= self.stop_loss_price,
        }
    }

    pub fn track_peak(&mut self, price: f64) {
        self.peak_price = match self.side {
            PositionSide::Long => self.peak_price.max(price),
            PositionSide::Short => self.peak_price.min(price),
        };
    }

    /// Retracement from the best price seen, as a fraction of that price
    pub fn retracement(&self, price: f64) -> f64 {
        if self.peak_price <= 0.0 {
            return 0.0;
        }
        match self.side {
            PositionSide::Long => (self.peak_price - price) / self.peak_price,
            PositionSide::Short => (price - self.peak_price) / self.peak_price,
        }
    }

    /// The peak starts at entry, so a retracement straight after entry
    /// counts as well.
    pub fn is_take_profit_hit(&self, price: f64) -> bool {
        self.retracement(price) >= self.take_profit_drop_fraction
    }

    /// Book a close of `closed_amount` that realized `pnl`.
    pub fn apply_close(&mut self, closed_amount: f64, pnl: f64) {
        self.amount = (self.amount - closed_amount).max(0.0);
        self.realized_pnl += pnl;
        if self.amount <= AMOUNT_EPSILON {
            self.amount = 0.0;
            self.status = PositionStatus::Closed;
        } else {
            self.status = PositionStatus::PartiallyClosed;
        }
    }

    /// Terminal transition without an exit fill (e.g. delisted symbol)
    pub fn mark_closed(&mut self) {
        self.status = PositionStatus::Closed;
    }
}
