//! DailyLimitLedger - per-user trade budget for the current window
//!
//! Owns each user's [`UserRiskState`]. Mutations for one user are serialized;
//! different users proceed independently. State is written through to the
//! ledger store after every change but memory stays authoritative.

use crate::domain::entities::risk_state::UserRiskState;
use crate::domain::repositories::ledger_store::LedgerStore;
use crate::domain::services::resilience::KeyedLocks;
use crate::domain::services::trade_ledger::TradeLedger;
use crate::domain::value_objects::fee_model::FeeModel;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DailyLimitConfig {
    /// Share of the deposit available per window
    pub daily_limit_ratio: f64,
    pub window: chrono::Duration,
    /// Window also resets once traded volume reaches this share of the limit
    pub volume_reset_ratio: f64,
    /// Per-trade cap as a share of the deposit, before risk scaling
    pub per_trade_ratio: f64,
    /// Smallest post-fee notional the exchange accepts
    pub exchange_min_notional: f64,
    pub fee_model: FeeModel,
    pub win_rate_lookback: usize,
    pub high_win_rate: f64,
    pub low_win_rate: f64,
    pub growth_multiplier: f64,
    pub shrink_multiplier: f64,
}

impl Default for DailyLimitConfig {
    fn default() -> Self {
        Self {
            daily_limit_ratio: 0.9,
            window: chrono::Duration::hours(24),
            volume_reset_ratio: 0.5,
            per_trade_ratio: 0.01,
            exchange_min_notional: 10.0,
            fee_model: FeeModel::default(),
            win_rate_lookback: 20,
            high_win_rate: 0.7,
            low_win_rate: 0.3,
            growth_multiplier: 1.1,
            shrink_multiplier: 0.9,
        }
    }
}

impl DailyLimitConfig {
    pub fn min_trade_notional(&self) -> f64 {
        self.fee_model.min_notional_for(self.exchange_min_notional)
    }
}

/// Budget set aside for one order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reservation {
    /// Base-asset amount to order
    pub amount: f64,
    pub notional: f64,
    pub price: f64,
}

pub struct DailyLimitLedger {
    ledger: Arc<TradeLedger>,
    store: Arc<dyn LedgerStore>,
    config: DailyLimitConfig,
    states: Mutex<HashMap<String, UserRiskState>>,
    user_locks: KeyedLocks,
}

impl DailyLimitLedger {
    pub fn new(ledger: Arc<TradeLedger>, config: DailyLimitConfig) -> Self {
        let store = ledger.store();
        Self {
            ledger,
            store,
            config,
            states: Mutex::new(HashMap::new()),
            user_locks: KeyedLocks::default(),
        }
    }

    pub fn config(&self) -> &DailyLimitConfig {
        &self.config
    }

    /// Record a fresh deposit valuation.
    ///
    /// The first valuation also fixes the drawdown baseline and opens the
    /// first budget window.
    pub async fn update_deposit(&self, user_id: &str, deposit: f64) -> UserRiskState {
        self.update_deposit_at(user_id, deposit, Utc::now()).await
    }

    pub async fn update_deposit_at(
        &self,
        user_id: &str,
        deposit: f64,
        now: DateTime<Utc>,
    ) -> UserRiskState {
        let _guard = self.user_locks.lock(user_id).await;
        let mut state = self.load(user_id, now).await;

        state.deposit = deposit;
        state.current_deposit = deposit;
        if state.initial_deposit <= 0.0 {
            state.initial_deposit = deposit;
        }
        if state.daily_limit <= 0.0 {
            state.daily_limit = deposit * self.config.daily_limit_ratio;
            state.last_reset = now;
        }

        debug!(
            "Deposit for {}: {:.2} (limit {:.2}, used {:.2})",
            user_id, deposit, state.daily_limit, state.daily_used
        );
        self.save(state).await
    }

    /// Reserve budget for one trade at `current_price`.
    ///
    /// `None` means no trade this cycle; state is left untouched.
    pub async fn reserve_trade_amount(
        &self,
        user_id: &str,
        current_price: f64,
    ) -> Option<Reservation> {
        self.reserve_scaled_at(user_id, current_price, 1.0, Utc::now())
            .await
    }

    /// Like [`Self::reserve_trade_amount`] with the per-trade cap multiplied by `cap_scale`.
    pub async fn reserve_scaled(
        &self,
        user_id: &str,
        current_price: f64,
        cap_scale: f64,
    ) -> Option<Reservation> {
        self.reserve_scaled_at(user_id, current_price, cap_scale, Utc::now())
            .await
    }

    pub async fn reserve_scaled_at(
        &self,
        user_id: &str,
        current_price: f64,
        cap_scale: f64,
        now: DateTime<Utc>,
    ) -> Option<Reservation> {
        if !current_price.is_finite() || current_price <= 0.0 {
            warn!("Refusing reservation for {} at price {}", user_id, current_price);
            return None;
        }

        let _guard = self.user_locks.lock(user_id).await;
        let mut state = self.load(user_id, now).await;

        if self.reset_due(&state, now) {
            self.reset_window(&mut state, now).await;
            state = self.save(state).await;
        }

        let remaining = state.remaining_budget();
        if remaining <= 0.0 {
            info!("Daily budget exhausted for {}", user_id);
            return None;
        }

        let floor = self.config.min_trade_notional();
        let cap = state.deposit * self.config.per_trade_ratio * cap_scale.max(0.0);
        let notional = cap.min(remaining).max(floor);
        if notional > remaining {
            info!(
                "Remaining budget {:.2} for {} below minimum trade {:.2}",
                remaining, user_id, floor
            );
            return None;
        }

        state.daily_used += notional;
        state.trade_volume += notional;
        debug!(
            "Reserved {:.2} for {} ({:.2}/{:.2} used)",
            notional, user_id, state.daily_used, state.daily_limit
        );
        self.save(state).await;

        Some(Reservation {
            amount: notional / current_price,
            notional,
            price: current_price,
        })
    }

    /// Give back a reservation whose order was never placed.
    pub async fn release(&self, user_id: &str, notional: f64) {
        let _guard = self.user_locks.lock(user_id).await;
        let mut state = self.load(user_id, Utc::now()).await;
        state.daily_used = (state.daily_used - notional).max(0.0);
        state.trade_volume = (state.trade_volume - notional).max(0.0);
        debug!("Released {:.2} for {}", notional, user_id);
        self.save(state).await;
    }

    /// Count a close fill against the window. Not capped by the limit.
    pub async fn record_close(&self, user_id: &str, notional: f64) {
        let _guard = self.user_locks.lock(user_id).await;
        let mut state = self.load(user_id, Utc::now()).await;
        state.daily_used += notional;
        state.trade_volume += notional;
        self.save(state).await;
    }

    /// Mirror a circuit-breaker suspension into the user's state.
    pub async fn set_suspension(&self, user_id: &str, until: Option<DateTime<Utc>>) {
        let _guard = self.user_locks.lock(user_id).await;
        let mut state = self.load(user_id, Utc::now()).await;
        if state.suspended_until == until {
            return;
        }
        state.suspended_until = until;
        self.save(state).await;
    }

    pub async fn snapshot(&self, user_id: &str) -> Option<UserRiskState> {
        if let Some(state) = self.states.lock().await.get(user_id) {
            return Some(state.clone());
        }
        match self.store.load_risk_state(user_id).await {
            Ok(state) => state,
            Err(e) => {
                warn!("Risk state for {} unavailable: {}", user_id, e);
                None
            }
        }
    }

    fn reset_due(&self, state: &UserRiskState, now: DateTime<Utc>) -> bool {
        if state.daily_limit <= 0.0 {
            return false;
        }
        now - state.last_reset >= self.config.window
            || state.trade_volume >= state.daily_limit * self.config.volume_reset_ratio
    }

    async fn reset_window(&self, state: &mut UserRiskState, now: DateTime<Utc>) {
        let win_rate = self
            .ledger
            .win_rate(&state.user_id, self.config.win_rate_lookback)
            .await;
        let multiplier = match win_rate {
            Some(rate) if rate > self.config.high_win_rate => self.config.growth_multiplier,
            Some(rate) if rate < self.config.low_win_rate => self.config.shrink_multiplier,
            _ => 1.0,
        };

        state.daily_limit = state.deposit * self.config.daily_limit_ratio * multiplier;
        state.daily_used = 0.0;
        state.trade_volume = 0.0;
        state.last_reset = now;

        info!(
            "Daily window reset for {}: limit {:.2} (win rate {:?}, x{})",
            state.user_id, state.daily_limit, win_rate, multiplier
        );
    }

    async fn load(&self, user_id: &str, now: DateTime<Utc>) -> UserRiskState {
        if let Some(state) = self.states.lock().await.get(user_id) {
            return state.clone();
        }
        match self.store.load_risk_state(user_id).await {
            Ok(Some(state)) => state,
            Ok(None) => UserRiskState::new(user_id, now),
            Err(e) => {
                warn!("Starting {} from a blank risk state: {}", user_id, e);
                UserRiskState::new(user_id, now)
            }
        }
    }

    async fn save(&self, state: UserRiskState) -> UserRiskState {
        self.states
            .lock()
            .await
            .insert(state.user_id.clone(), state.clone());
        if let Err(e) = self.store.save_risk_state(&state).await {
            warn!("Risk state for {} not persisted: {}", state.user_id, e);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::trade::{NewTrade, TradeStatus};
    use crate::domain::services::trade_ledger::TradeLedgerConfig;
    use crate::persistence::memory::MemoryLedgerStore;

    fn setup() -> (Arc<TradeLedger>, DailyLimitLedger) {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(TradeLedger::new(store, TradeLedgerConfig::default()));
        let limits = DailyLimitLedger::new(ledger.clone(), DailyLimitConfig::default());
        (ledger, limits)
    }

    async fn completed(ledger: &TradeLedger, user: &str, pnl: f64) {
        let id = ledger
            .create(NewTrade::new(user, "BTC/USDT", OrderSide::Buy, 1.0, 10.0))
            .await
            .unwrap();
        ledger.update_pnl(&id, pnl, TradeStatus::Completed).await.unwrap();
    }

    #[tokio::test]
    async fn test_first_deposit_opens_window() {
        let (_, limits) = setup();
        let state = limits.update_deposit("u1", 1000.0).await;
        assert_eq!(state.daily_limit, 900.0);
        assert_eq!(state.initial_deposit, 1000.0);

        let state = limits.update_deposit("u1", 800.0).await;
        assert_eq!(state.initial_deposit, 1000.0);
        assert_eq!(state.current_deposit, 800.0);
        assert_eq!(state.daily_limit, 900.0);
    }

    #[tokio::test]
    async fn test_reservation_uses_fee_adjusted_floor() {
        let (_, limits) = setup();
        limits.update_deposit("u1", 1000.0).await;

        // 1% of 1000 is 10, below the 10/(1-0.003) floor
        let reservation = limits.reserve_trade_amount("u1", 50.0).await.unwrap();
        assert!((reservation.notional - 10.0 / 0.997).abs() < 1e-9);
        assert!((reservation.amount - reservation.notional / 50.0).abs() < 1e-12);

        let state = limits.snapshot("u1").await.unwrap();
        assert_eq!(state.daily_used, reservation.notional);
        assert_eq!(state.trade_volume, reservation.notional);
    }

    #[tokio::test]
    async fn test_cap_scales_with_risk() {
        let (_, limits) = setup();
        limits.update_deposit("u1", 10_000.0).await;

        let full = limits.reserve_scaled("u1", 100.0, 1.0).await.unwrap();
        assert!((full.notional - 100.0).abs() < 1e-9);
        let half = limits.reserve_scaled("u1", 100.0, 0.5).await.unwrap();
        assert!((half.notional - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_budget_below_floor_returns_none_without_mutation() {
        let (_, limits) = setup();
        limits.update_deposit("u1", 10.0).await; // limit 9.0 < floor
        let before = limits.snapshot("u1").await.unwrap();

        assert!(limits.reserve_trade_amount("u1", 100.0).await.is_none());
        assert_eq!(limits.snapshot("u1").await.unwrap(), before);

        // no deposit at all
        assert!(limits.reserve_trade_amount("u2", 100.0).await.is_none());
    }

    #[tokio::test]
    async fn test_daily_used_never_exceeds_limit() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(TradeLedger::new(store, TradeLedgerConfig::default()));
        // only the clock resets this window
        let config = DailyLimitConfig {
            volume_reset_ratio: f64::INFINITY,
            ..Default::default()
        };
        let limits = DailyLimitLedger::new(ledger, config);
        let now = Utc::now();
        limits.update_deposit_at("u1", 2_000.0, now).await;

        let mut refused = 0;
        for i in 0..200 {
            let before = limits.snapshot("u1").await.unwrap();
            let result = limits
                .reserve_scaled_at("u1", 3.0, 1.0 + (i % 7) as f64, now)
                .await;
            let after = limits.snapshot("u1").await.unwrap();
            assert!(after.daily_used <= after.daily_limit + 1e-9);
            if result.is_none() {
                refused += 1;
                assert_eq!(after, before);
            }
        }
        assert!(refused > 0);
    }

    #[tokio::test]
    async fn test_time_reset_applies_performance_multiplier() {
        let (ledger, limits) = setup();
        let start = Utc::now();
        limits.update_deposit_at("u1", 1000.0, start).await;
        limits.reserve_scaled_at("u1", 10.0, 1.0, start).await.unwrap();

        for _ in 0..4 {
            completed(&ledger, "u1", 2.0).await;
        }

        let later = start + chrono::Duration::hours(24);
        limits.reserve_scaled_at("u1", 10.0, 1.0, later).await.unwrap();
        let state = limits.snapshot("u1").await.unwrap();
        assert!((state.daily_limit - 990.0).abs() < 1e-9);
        assert_eq!(state.last_reset, later);
        assert!((state.daily_used - 10.0 / 0.997).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_volume_reset_shrinks_after_losses() {
        let (ledger, limits) = setup();
        let now = Utc::now();
        limits.update_deposit_at("u1", 1000.0, now).await;
        for _ in 0..3 {
            completed(&ledger, "u1", -1.0).await;
        }

        // closes push volume past half the limit
        limits.record_close("u1", 460.0).await;
        limits.reserve_scaled_at("u1", 10.0, 1.0, now).await.unwrap();

        let state = limits.snapshot("u1").await.unwrap();
        assert!((state.daily_limit - 810.0).abs() < 1e-9);
        assert!(state.trade_volume < 20.0);
    }

    #[tokio::test]
    async fn test_release_restores_budget() {
        let (_, limits) = setup();
        limits.update_deposit("u1", 5_000.0).await;
        let reservation = limits.reserve_trade_amount("u1", 20.0).await.unwrap();
        limits.release("u1", reservation.notional).await;

        let state = limits.snapshot("u1").await.unwrap();
        assert!(state.daily_used.abs() < 1e-9);
        assert!(state.trade_volume.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_state_survives_restart_through_store() {
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(TradeLedger::new(store.clone(), TradeLedgerConfig::default()));
        let limits = DailyLimitLedger::new(ledger, DailyLimitConfig::default());
        limits.update_deposit("u1", 3_000.0).await;
        limits.reserve_trade_amount("u1", 10.0).await.unwrap();

        let ledger = Arc::new(TradeLedger::new(store, TradeLedgerConfig::default()));
        let restarted = DailyLimitLedger::new(ledger, DailyLimitConfig::default());
        let state = restarted.snapshot("u1").await.unwrap();
        assert_eq!(state.daily_limit, 2_700.0);
        assert!((state.daily_used - 30.0).abs() < 1e-9);
    }
}
