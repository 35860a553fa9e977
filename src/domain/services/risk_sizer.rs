//! Risk sizing service
//!
//! Decides what fraction of the deposit a user may risk on the next trade:
//! - Drawdown hard stop (max drawdown widened or tightened by volatility)
//! - Volatility scaling of the base fraction
//! - Trailing win-rate scaling from the ledger

use crate::domain::entities::market::MarketConditions;
use crate::domain::services::daily_limit::DailyLimitLedger;
use crate::domain::services::trade_ledger::TradeLedger;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RiskSizerConfig {
    pub max_drawdown: f64,
    pub base_fraction: f64,
    /// Above this volatility the market counts as high-volatility
    pub high_volatility: f64,
    /// Above this volatility the base fraction is trimmed
    pub elevated_volatility: f64,
    /// Below this volatility the drawdown cap is widened
    pub low_volatility: f64,
    pub win_rate_lookback: usize,
    pub low_win_rate: f64,
    pub high_win_rate: f64,
}

impl Default for RiskSizerConfig {
    fn default() -> Self {
        Self {
            max_drawdown: 0.2,
            base_fraction: 0.1,
            high_volatility: 0.1,
            elevated_volatility: 0.05,
            low_volatility: 0.05,
            win_rate_lookback: 50,
            low_win_rate: 0.4,
            high_win_rate: 0.7,
        }
    }
}

/// Sizing verdict for one user
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeFraction {
    pub fraction: f64,
    /// `false` is a hard stop: the drawdown cap has been reached
    pub allowed: bool,
}

impl TradeFraction {
    pub fn blocked() -> Self {
        Self {
            fraction: 0.0,
            allowed: false,
        }
    }
}

/// RiskSizer service
pub struct RiskSizer {
    ledger: Arc<TradeLedger>,
    limits: Arc<DailyLimitLedger>,
    config: RiskSizerConfig,
}

impl RiskSizer {
    pub fn new(
        ledger: Arc<TradeLedger>,
        limits: Arc<DailyLimitLedger>,
        config: RiskSizerConfig,
    ) -> Self {
        Self {
            ledger,
            limits,
            config,
        }
    }

    pub fn config(&self) -> &RiskSizerConfig {
        &self.config
    }

    pub async fn trade_fraction(
        &self,
        user_id: &str,
        market_conditions: &MarketConditions,
    ) -> TradeFraction {
        let drawdown = self
            .limits
            .snapshot(user_id)
            .await
            .map(|state| state.drawdown())
            .unwrap_or(0.0);
        let win_rate = self
            .ledger
            .win_rate(user_id, self.config.win_rate_lookback)
            .await;

        let verdict = self.evaluate(drawdown, market_conditions.volatility, win_rate);
        if !verdict.allowed {
            info!(
                "Drawdown stop for {}: {:.2}% >= {:.2}%",
                user_id,
                drawdown * 100.0,
                self.max_drawdown_for(market_conditions.volatility) * 100.0
            );
        }
        verdict
    }

    /// Pure sizing rule behind [`Self::trade_fraction`].
    pub fn evaluate(&self, drawdown: f64, volatility: f64, win_rate: Option<f64>) -> TradeFraction {
        if drawdown >= self.max_drawdown_for(volatility) {
            return TradeFraction::blocked();
        }

        let mut fraction = self.config.base_fraction;
        if volatility > self.config.high_volatility {
            fraction *= 0.5;
        } else if volatility > self.config.elevated_volatility {
            fraction *= 0.75;
        }

        match win_rate {
            Some(rate) if rate < self.config.low_win_rate => fraction *= 0.5,
            Some(rate) if rate > self.config.high_win_rate => fraction *= 1.5,
            _ => {}
        }

        debug!(
            "Trade fraction {:.4} (drawdown {:.4}, volatility {:.4}, win rate {:?})",
            fraction, drawdown, volatility, win_rate
        );
        TradeFraction {
            fraction,
            allowed: true,
        }
    }

    pub fn max_drawdown_for(&self, volatility: f64) -> f64 {
        if volatility > self.config.high_volatility {
            self.config.max_drawdown * 0.75
        } else if volatility < self.config.low_volatility {
            self.config.max_drawdown * 1.25
        } else {
            self.config.max_drawdown
        }
    }

    /// Multiplier applied to the per-trade budget cap
    pub fn cap_scale(&self, fraction: &TradeFraction) -> f64 {
        if self.config.base_fraction <= 0.0 {
            return 0.0;
        }
        fraction.fraction / self.config.base_fraction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::trade::{NewTrade, TradeStatus};
    use crate::domain::services::daily_limit::DailyLimitConfig;
    use crate::domain::services::trade_ledger::TradeLedgerConfig;
    use crate::persistence::memory::MemoryLedgerStore;

    fn sizer() -> (Arc<TradeLedger>, Arc<DailyLimitLedger>, RiskSizer) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(TradeLedger::new(store, TradeLedgerConfig::default()));
        let limits = Arc::new(DailyLimitLedger::new(
            ledger.clone(),
            DailyLimitConfig::default(),
        ));
        let sizer = RiskSizer::new(ledger.clone(), limits.clone(), RiskSizerConfig::default());
        (ledger, limits, sizer)
    }

    #[tokio::test]
    async fn test_drawdown_hard_stop() {
        let (_, limits, sizer) = sizer();
        limits.update_deposit("u1", 1000.0).await;
        limits.update_deposit("u1", 750.0).await;

        // volatility between the low and high bands keeps the 20% cap
        let verdict = sizer
            .trade_fraction("u1", &MarketConditions::with_volatility(0.07))
            .await;
        assert_eq!(verdict, TradeFraction::blocked());
    }

    #[tokio::test]
    async fn test_unknown_user_gets_base_fraction() {
        let (_, _, sizer) = sizer();
        let verdict = sizer
            .trade_fraction("nobody", &MarketConditions::with_volatility(0.01))
            .await;
        assert!(verdict.allowed);
        assert!((verdict.fraction - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_adjusts_drawdown_cap() {
        let (_, _, sizer) = sizer();
        assert!((sizer.max_drawdown_for(0.2) - 0.15).abs() < 1e-12);
        assert!((sizer.max_drawdown_for(0.01) - 0.25).abs() < 1e-12);
        assert!((sizer.max_drawdown_for(0.07) - 0.2).abs() < 1e-12);

        // 22% drawdown passes in calm markets only
        assert!(sizer.evaluate(0.22, 0.01, None).allowed);
        assert!(!sizer.evaluate(0.22, 0.07, None).allowed);
        assert!(!sizer.evaluate(0.16, 0.2, None).allowed);
    }

    #[test]
    fn test_volatility_and_win_rate_scaling() {
        let (_, _, sizer) = sizer();
        let cases = [
            (0.01, None, 0.1),
            (0.07, None, 0.075),
            (0.2, None, 0.05),
            (0.01, Some(0.3), 0.05),
            (0.01, Some(0.8), 0.15),
            (0.2, Some(0.8), 0.075),
            (0.01, Some(0.5), 0.1),
        ];
        for (volatility, win_rate, expected) in cases {
            let verdict = sizer.evaluate(0.0, volatility, win_rate);
            assert!(
                (verdict.fraction - expected).abs() < 1e-12,
                "vol={} win={:?}: {} != {}",
                volatility,
                win_rate,
                verdict.fraction,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_losing_streak_halves_fraction() {
        let (ledger, limits, sizer) = sizer();
        limits.update_deposit("u1", 1000.0).await;
        for pnl in [-1.0, -2.0, 3.0] {
            let id = ledger
                .create(NewTrade::new("u1", "BTC/USDT", OrderSide::Buy, 1.0, 10.0))
                .await
                .unwrap();
            ledger.update_pnl(&id, pnl, TradeStatus::Completed).await.unwrap();
        }

        let verdict = sizer
            .trade_fraction("u1", &MarketConditions::with_volatility(0.01))
            .await;
        assert!((verdict.fraction - 0.05).abs() < 1e-12);
        assert!((sizer.cap_scale(&verdict) - 0.5).abs() < 1e-12);
    }
}
