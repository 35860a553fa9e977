use crate::domain::entities::position::PositionSide;

/// Proportional fee charged on every fill, both legs.
///
/// This is the single PNL formula used by the engine:
/// `gross = (exit - entry) * amount` (mirrored for shorts) minus
/// `fee_rate * (entry * amount + exit * amount)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeModel {
    pub fee_rate: f64,
}

impl Default for FeeModel {
    fn default() -> Self {
        Self { fee_rate: 0.003 }
    }
}

impl FeeModel {
    pub fn new(fee_rate: f64) -> Self {
        Self { fee_rate }
    }

    pub fn fees(&self, entry_price: f64, exit_price: f64, amount: f64) -> f64 {
        self.fee_rate * (entry_price * amount + exit_price * amount)
    }

    pub fn realized_pnl(
        &self,
        side: PositionSide,
        entry_price: f64,
        exit_price: f64,
        amount: f64,
    ) -> f64 {
        let gross = match side {
            PositionSide::Long => (exit_price - entry_price) * amount,
            PositionSide::Short => (entry_price - exit_price) * amount,
        };
        gross - self.fees(entry_price, exit_price, amount)
    }

    /// Smallest notional whose post-fee value still clears `exchange_floor`.
    pub fn min_notional_for(&self, exchange_floor: f64) -> f64 {
        exchange_floor / (1.0 - self.fee_rate)
    }
}
