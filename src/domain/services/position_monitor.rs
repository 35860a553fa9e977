//! PositionMonitor - polling exit state machine for open positions
//!
//! One watch task per position. Each tick reads the price (shared per symbol
//! through a short-lived [`PriceCache`]) and performs at most one close action:
//! 1. stop-loss (full close)
//! 2. trailing take-profit, measured from the best price since entry (full close)
//! 3. partial close of a fraction of the remaining amount when in profit
//!
//! Every close event writes a close leg to the ledger that points back at the
//! opening trade, then overwrites the opening trade with the accumulated
//! realized PNL and its new status.

use crate::domain::entities::order::OrderRequest;
use crate::domain::entities::position::{ExitLevels, Position, PositionStatus};
use crate::domain::entities::trade::{NewTrade, TradeStatus};
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::daily_limit::DailyLimitLedger;
use crate::domain::services::price_cache::PriceCache;
use crate::domain::services::resilience::with_timeout;
use crate::domain::services::trade_ledger::{TradeLedger, UpdateOutcome};
use crate::domain::value_objects::fee_model::FeeModel;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Exit thresholds and polling cadence
#[derive(Debug, Clone)]
pub struct ExitPolicy {
    pub poll_interval: Duration,
    pub stop_loss_volatility_multiplier: f64,
    pub min_stop_loss: f64,
    pub max_stop_loss: f64,
    pub min_take_profit_drop: f64,
    pub max_take_profit_drop: f64,
    /// Unrealized profit that triggers a partial close
    pub partial_close_threshold: f64,
    /// Share of the remaining amount closed by a partial close
    pub partial_close_fraction: f64,
    pub fee_model: FeeModel,
    pub exchange_min_notional: f64,
    pub call_timeout: Duration,
    /// How long one ticker read is reused by other positions on the symbol.
    /// Never more than half the poll interval.
    pub quote_ttl: Duration,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stop_loss_volatility_multiplier: 2.0,
            min_stop_loss: 0.01,
            max_stop_loss: 0.10,
            min_take_profit_drop: 0.005,
            max_take_profit_drop: 0.05,
            partial_close_threshold: 0.05,
            partial_close_fraction: 0.5,
            fee_model: FeeModel::default(),
            exchange_min_notional: 10.0,
            call_timeout: Duration::from_secs(15),
            quote_ttl: Duration::from_secs(5),
        }
    }
}

impl ExitPolicy {
    /// Exit levels for a position opened under `volatility`
    pub fn levels_for(&self, volatility: f64) -> ExitLevels {
        let volatility = if volatility.is_finite() {
            volatility.max(0.0)
        } else {
            0.0
        };
        ExitLevels {
            stop_loss_fraction: (volatility * self.stop_loss_volatility_multiplier)
                .clamp(self.min_stop_loss, self.max_stop_loss),
            take_profit_drop_fraction: volatility
                .clamp(self.min_take_profit_drop, self.max_take_profit_drop),
        }
    }

    fn min_notional(&self) -> f64 {
        self.fee_model.min_notional_for(self.exchange_min_notional)
    }

    fn effective_quote_ttl(&self) -> Duration {
        self.quote_ttl.min(self.poll_interval / 2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    PartialClose,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::PartialClose => "partial_close",
        }
    }
}

/// Close decided for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitAction {
    pub reason: ExitReason,
    pub amount: f64,
}

/// Decide the close action for `price`, tracking the peak on the way.
pub fn evaluate_exit(policy: &ExitPolicy, position: &mut Position, price: f64) -> Option<ExitAction> {
    if position.is_closed() {
        return None;
    }

    if position.is_stop_loss_hit(price) {
        return Some(ExitAction {
            reason: ExitReason::StopLoss,
            amount: position.amount,
        });
    }

    position.track_peak(price);
    if position.is_take_profit_hit(price) {
        return Some(ExitAction {
            reason: ExitReason::TakeProfit,
            amount: position.amount,
        });
    }

    if position.profit_fraction(price) >= policy.partial_close_threshold {
        let partial = position.amount * policy.partial_close_fraction;
        // a remainder too small to sell later is closed now
        let amount = if (position.amount - partial) * price < policy.min_notional() {
            position.amount
        } else {
            partial
        };
        return Some(ExitAction {
            reason: ExitReason::PartialClose,
            amount,
        });
    }

    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Holding { price: f64 },
    PartiallyClosed { closed_amount: f64, remaining: f64, pnl: f64 },
    Closed { reason: ExitReason, closed_amount: f64, pnl: f64 },
    /// Transient problem, try again next tick
    Retry { error: String },
    /// Symbol-level failure; the position is closed as failed
    Failed { error: ExchangeError },
    /// Ledger storage is gone; the engine must stop
    Fatal { error: String },
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TickOutcome::Closed { .. } | TickOutcome::Failed { .. } | TickOutcome::Fatal { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchExit {
    Finished(TickOutcome),
    Shutdown,
}

pub struct PositionMonitor {
    exchange: Arc<dyn ExchangeClient>,
    ledger: Arc<TradeLedger>,
    limits: Arc<DailyLimitLedger>,
    quotes: PriceCache,
    policy: ExitPolicy,
}

impl PositionMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        ledger: Arc<TradeLedger>,
        limits: Arc<DailyLimitLedger>,
        policy: ExitPolicy,
    ) -> Self {
        Self {
            exchange,
            ledger,
            limits,
            quotes: PriceCache::new(policy.effective_quote_ttl(), 1024),
            policy,
        }
    }

    pub fn policy(&self) -> &ExitPolicy {
        &self.policy
    }

    /// Run one poll. The position lock is only held for in-memory updates.
    pub async fn tick(&self, position: &Mutex<Position>) -> TickOutcome {
        let (trade_id, symbol) = {
            let p = position.lock().await;
            if p.is_closed() {
                return TickOutcome::Closed {
                    reason: ExitReason::PartialClose,
                    closed_amount: 0.0,
                    pnl: p.realized_pnl,
                };
            }
            (p.trade_id.clone(), p.symbol.clone())
        };

        let price = match self.current_price(&symbol).await {
            Ok(last) if last.is_finite() && last > 0.0 => last,
            Ok(last) => {
                warn!("Ignoring price {} for {} ({})", last, symbol, trade_id);
                return TickOutcome::Retry {
                    error: format!("invalid price {}", last),
                };
            }
            Err(e) if e.is_unrecoverable_for_symbol() => return self.fail(position, e).await,
            Err(e) => {
                warn!("Price fetch for {} ({}) failed, retrying next tick: {}", symbol, trade_id, e);
                return TickOutcome::Retry {
                    error: e.to_string(),
                };
            }
        };

        let action = {
            let mut p = position.lock().await;
            evaluate_exit(&self.policy, &mut p, price)
        };

        match action {
            Some(action) => self.close(position, action, price).await,
            None => {
                debug!("{} {} holding at {}", trade_id, symbol, price);
                TickOutcome::Holding { price }
            }
        }
    }

    /// Last price for `symbol`, from the quote cache when fresh
    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        if let Some(last) = self.quotes.get(symbol).await {
            debug!("Using cached price {} for {}", last, symbol);
            return Ok(last);
        }
        let ticker =
            with_timeout(self.policy.call_timeout, self.exchange.fetch_ticker(symbol)).await?;
        if ticker.last.is_finite() && ticker.last > 0.0 {
            self.quotes.insert(symbol, ticker.last).await;
        }
        Ok(ticker.last)
    }

    async fn close(&self, position: &Mutex<Position>, action: ExitAction, price: f64) -> TickOutcome {
        let snapshot = position.lock().await.clone();
        let exit_side = snapshot.side.exit_order_side();

        let order = match OrderRequest::market(&snapshot.symbol, exit_side, action.amount) {
            Ok(order) => order,
            Err(e) => {
                warn!("Cannot build close order for {}: {}", snapshot.trade_id, e);
                return TickOutcome::Retry {
                    error: e.to_string(),
                };
            }
        };

        let receipt = match with_timeout(
            self.policy.call_timeout,
            self.exchange.create_order(&snapshot.user_id, &order),
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_unrecoverable_for_symbol() => return self.fail(position, e).await,
            Err(e) => {
                warn!(
                    "{} order for {} failed, retrying next tick: {}",
                    action.reason.as_str(),
                    snapshot.trade_id,
                    e
                );
                return TickOutcome::Retry {
                    error: e.to_string(),
                };
            }
        };

        let exit_price = if receipt.price > 0.0 { receipt.price } else { price };
        let pnl = self.policy.fee_model.realized_pnl(
            snapshot.side,
            snapshot.entry_price,
            exit_price,
            action.amount,
        );

        let (status, remaining, realized) = {
            let mut p = position.lock().await;
            p.apply_close(action.amount, pnl);
            (p.status, p.amount, p.realized_pnl)
        };
        let ledger_status = if status == PositionStatus::Closed {
            TradeStatus::Completed
        } else {
            TradeStatus::PartiallyClosed
        };

        info!(
            "{} {} {}: closed {} @ {} (pnl {:.4}, remaining {})",
            action.reason.as_str(),
            snapshot.trade_id,
            snapshot.symbol,
            action.amount,
            exit_price,
            pnl,
            remaining
        );

        if let Err(error) = self
            .book_close(&snapshot, action, exit_price, pnl, realized, ledger_status)
            .await
        {
            return TickOutcome::Fatal { error };
        }

        self.limits
            .record_close(&snapshot.user_id, action.amount * exit_price)
            .await;

        if status == PositionStatus::Closed {
            TickOutcome::Closed {
                reason: action.reason,
                closed_amount: action.amount,
                pnl,
            }
        } else {
            TickOutcome::PartiallyClosed {
                closed_amount: action.amount,
                remaining,
                pnl,
            }
        }
    }

    async fn book_close(
        &self,
        snapshot: &Position,
        action: ExitAction,
        exit_price: f64,
        pnl: f64,
        realized: f64,
        status: TradeStatus,
    ) -> Result<(), String> {
        let leg = NewTrade::new(
            &snapshot.user_id,
            &snapshot.symbol,
            snapshot.side.exit_order_side(),
            action.amount,
            exit_price,
        )
        .with_status(status)
        .with_pnl(pnl)
        .with_signals(json!({ "signal": action.reason.as_str() }), Value::Null)
        .with_market_conditions(snapshot.market_conditions.to_value())
        .with_strategy(snapshot.strategy_tag.clone())
        .related_to(&snapshot.trade_id);

        if let Err(e) = self.ledger.create(leg).await {
            error!(
                "Close of {} not recorded (user {}, {} {} @ {}, realized {:.4}): {}",
                snapshot.trade_id,
                snapshot.user_id,
                action.amount,
                snapshot.symbol,
                exit_price,
                realized,
                e
            );
            return Err(e.to_string());
        }

        match self.ledger.update_pnl(&snapshot.trade_id, realized, status).await {
            Ok(UpdateOutcome::Updated) => Ok(()),
            Ok(UpdateOutcome::NotFound) => {
                warn!("Opening trade {} no longer in the ledger", snapshot.trade_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    "Outcome of {} not recorded (realized {:.4}, {}): {}",
                    snapshot.trade_id, realized, status, e
                );
                Err(e.to_string())
            }
        }
    }

    async fn fail(&self, position: &Mutex<Position>, error: ExchangeError) -> TickOutcome {
        let (trade_id, realized) = {
            let mut p = position.lock().await;
            p.mark_closed();
            (p.trade_id.clone(), p.realized_pnl)
        };
        error!("Position {} abandoned: {}", trade_id, error);

        match self
            .ledger
            .update_pnl(&trade_id, realized, TradeStatus::Failed)
            .await
        {
            Ok(_) => TickOutcome::Failed { error },
            Err(e) => TickOutcome::Fatal {
                error: e.to_string(),
            },
        }
    }

    /// Poll `position` until it closes or `shutdown` flips to `true`.
    ///
    /// A tick in flight when shutdown is signalled runs to completion.
    pub fn spawn_watch(
        self: &Arc<Self>,
        position: Arc<Mutex<Position>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<WatchExit> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.policy.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    return WatchExit::Shutdown;
                }
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return WatchExit::Shutdown;
                        }
                        continue;
                    }
                }

                let outcome = monitor.tick(&position).await;
                if outcome.is_terminal() {
                    return WatchExit::Finished(outcome);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::MarketConditions;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::position::PositionSide;
    use crate::domain::services::daily_limit::DailyLimitConfig;
    use crate::domain::services::trade_ledger::TradeLedgerConfig;
    use crate::infrastructure::mock_exchange::MockExchangeClient;
    use crate::persistence::memory::MemoryLedgerStore;

    struct Harness {
        exchange: Arc<MockExchangeClient>,
        ledger: Arc<TradeLedger>,
        limits: Arc<DailyLimitLedger>,
        monitor: Arc<PositionMonitor>,
    }

    fn harness() -> Harness {
        let exchange = Arc::new(MockExchangeClient::new("mock"));
        let store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(TradeLedger::new(store, TradeLedgerConfig::default()));
        let limits = Arc::new(DailyLimitLedger::new(
            ledger.clone(),
            DailyLimitConfig::default(),
        ));
        let monitor = Arc::new(PositionMonitor::new(
            exchange.clone(),
            ledger.clone(),
            limits.clone(),
            ExitPolicy::default(),
        ));
        Harness {
            exchange,
            ledger,
            limits,
            monitor,
        }
    }

    fn levels(stop: f64, drop: f64) -> ExitLevels {
        ExitLevels {
            stop_loss_fraction: stop,
            take_profit_drop_fraction: drop,
        }
    }

    fn long(id: &str, amount: f64) -> Position {
        Position::open(
            id,
            "u1",
            "SOL/USDT",
            PositionSide::Long,
            100.0,
            amount,
            levels(0.05, 0.04),
            Some("momentum".into()),
            MarketConditions::with_volatility(0.02),
        )
        .unwrap()
    }

    async fn opened(h: &Harness, side: OrderSide, amount: f64) -> String {
        h.ledger
            .create(
                NewTrade::new("u1", "SOL/USDT", side, amount, 100.0)
                    .with_status(TradeStatus::Filled),
            )
            .await
            .unwrap()
    }

    #[test]
    fn test_levels_scale_with_volatility_and_are_capped() {
        let policy = ExitPolicy::default();
        let calm = policy.levels_for(0.001);
        assert_eq!(calm.stop_loss_fraction, 0.01);
        assert_eq!(calm.take_profit_drop_fraction, 0.005);

        let normal = policy.levels_for(0.02);
        assert!((normal.stop_loss_fraction - 0.04).abs() < 1e-12);
        assert!((normal.take_profit_drop_fraction - 0.02).abs() < 1e-12);

        let wild = policy.levels_for(0.5);
        assert_eq!(wild.stop_loss_fraction, 0.10);
        assert_eq!(wild.take_profit_drop_fraction, 0.05);
    }

    #[test]
    fn test_evaluate_stop_loss() {
        let policy = ExitPolicy::default();
        let mut position = long("t", 2.0);
        assert!((position.stop_loss_price - 95.0).abs() < 1e-9);

        let action = evaluate_exit(&policy, &mut position, 94.0).unwrap();
        assert_eq!(action.reason, ExitReason::StopLoss);
        assert_eq!(action.amount, 2.0);
    }

    #[test]
    fn test_evaluate_trailing_take_profit() {
        let policy = ExitPolicy::default();
        let mut position = long("t", 2.0);
        position.peak_price = 120.0;

        let action = evaluate_exit(&policy, &mut position, 115.0).unwrap();
        assert_eq!(action.reason, ExitReason::TakeProfit);
        assert_eq!(position.peak_price, 120.0);

        // below the drop threshold only the partial close applies
        let mut position = long("t", 2.0);
        position.peak_price = 120.0;
        let action = evaluate_exit(&policy, &mut position, 118.0).unwrap();
        assert_eq!(action.reason, ExitReason::PartialClose);
    }

    #[test]
    fn test_evaluate_trailing_exit_right_after_entry() {
        let policy = ExitPolicy::default();
        let mut position = Position::open(
            "t",
            "u1",
            "SOL/USDT",
            PositionSide::Long,
            100.0,
            2.0,
            levels(0.05, 0.02),
            None,
            MarketConditions::default(),
        )
        .unwrap();

        // 2.5% off the entry peak, above the 95 stop
        let action = evaluate_exit(&policy, &mut position, 97.5).unwrap();
        assert_eq!(action.reason, ExitReason::TakeProfit);
        assert_eq!(action.amount, 2.0);
        assert_eq!(position.peak_price, 100.0);

        let mut position = long("t", 2.0);
        assert_eq!(evaluate_exit(&policy, &mut position, 97.0), None);
    }

    #[test]
    fn test_evaluate_dust_guard_closes_everything() {
        let policy = ExitPolicy::default();
        let mut position = long("t", 0.15);
        let action = evaluate_exit(&policy, &mut position, 106.0).unwrap();
        assert_eq!(action.reason, ExitReason::PartialClose);
        assert_eq!(action.amount, 0.15);
    }

    #[test]
    fn test_evaluate_short_mirrors_long() {
        let policy = ExitPolicy::default();
        let mut short = Position::open(
            "t",
            "u1",
            "SOL/USDT",
            PositionSide::Short,
            100.0,
            2.0,
            levels(0.05, 0.04),
            None,
            MarketConditions::default(),
        )
        .unwrap();
        assert!((short.stop_loss_price - 105.0).abs() < 1e-9);
        assert_eq!(
            evaluate_exit(&policy, &mut short, 106.0).map(|a| a.reason),
            Some(ExitReason::StopLoss)
        );

        short.peak_price = 80.0;
        assert_eq!(
            evaluate_exit(&policy, &mut short, 84.0).map(|a| a.reason),
            Some(ExitReason::TakeProfit)
        );
    }

    #[tokio::test]
    async fn test_stop_loss_tick_closes_once_with_fees() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 2.0).await;
        let position = Mutex::new(long(&id, 2.0));
        h.exchange.set_ticker("SOL/USDT", 94.0);

        let outcome = h.monitor.tick(&position).await;
        let expected = (94.0 - 100.0) * 2.0 - 0.003 * (100.0 * 2.0 + 94.0 * 2.0);
        match outcome {
            TickOutcome::Closed { reason, pnl, closed_amount } => {
                assert_eq!(reason, ExitReason::StopLoss);
                assert_eq!(closed_amount, 2.0);
                assert!((pnl - expected).abs() < 1e-9);
            }
            other => panic!("expected close, got {:?}", other),
        }

        let p = position.lock().await;
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.amount, 0.0);
        drop(p);

        let orders = h.exchange.placed_orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].1.side, OrderSide::Sell);

        let record = h.ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Completed);
        assert!((record.pnl - expected).abs() < 1e-9);

        // a closed position does nothing further
        assert!(h.monitor.tick(&position).await.is_terminal());
        assert_eq!(h.exchange.placed_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_close_then_stop_keeps_lineage() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 10.0).await;
        let position = Mutex::new(long(&id, 10.0));

        h.exchange.set_ticker("SOL/USDT", 106.0);
        let outcome = h.monitor.tick(&position).await;
        assert!(matches!(
            outcome,
            TickOutcome::PartiallyClosed { closed_amount, remaining, .. }
                if closed_amount == 5.0 && remaining == 5.0
        ));
        {
            let p = position.lock().await;
            assert_eq!(p.amount, 5.0);
            assert_eq!(p.status, PositionStatus::PartiallyClosed);
        }
        let opening = h.ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(opening.status, TradeStatus::PartiallyClosed);
        let first_pnl = opening.pnl;
        assert!(first_pnl > 0.0);

        // stop level is fixed at entry
        h.exchange.set_ticker("SOL/USDT", 94.0);
        tokio::time::advance(h.monitor.policy().poll_interval).await;
        assert!(matches!(
            h.monitor.tick(&position).await,
            TickOutcome::Closed { reason: ExitReason::StopLoss, .. }
        ));

        let records = h.ledger.get_by_symbol("SOL/USDT").await.unwrap();
        let legs: Vec<_> = records.iter().filter(|r| !r.is_root()).collect();
        assert_eq!(legs.len(), 2);
        assert!(legs
            .iter()
            .all(|leg| leg.related_trade_id.as_deref() == Some(id.as_str())));

        let opening = h.ledger.get(&id).await.unwrap().unwrap();
        let leg_total: f64 = legs.iter().map(|leg| leg.pnl).sum();
        assert_eq!(opening.status, TradeStatus::Completed);
        assert!((opening.pnl - leg_total).abs() < 1e-9);
        assert!(opening.pnl < first_pnl);

        // both closes count against the budget window
        let state = h.limits.snapshot("u1").await.unwrap();
        assert!((state.trade_volume - (5.0 * 106.0 + 5.0 * 94.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_delisted_symbol_fails_position() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 1.0).await;
        let position = Mutex::new(long(&id, 1.0));
        h.exchange
            .set_ticker_error("SOL/USDT", ExchangeError::InvalidSymbol("SOL/USDT".into()));

        let outcome = h.monitor.tick(&position).await;
        assert!(matches!(outcome, TickOutcome::Failed { .. }));
        assert!(position.lock().await.is_closed());
        assert_eq!(
            h.ledger.get(&id).await.unwrap().unwrap().status,
            TradeStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_transient_errors_keep_watching() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 1.0).await;
        let position = Mutex::new(long(&id, 1.0));

        h.exchange
            .set_ticker_error("SOL/USDT", ExchangeError::Network("reset".into()));
        let outcome = h.monitor.tick(&position).await;
        assert!(matches!(outcome, TickOutcome::Retry { .. }));
        assert!(!outcome.is_terminal());

        // order failure after a trigger is retried too
        h.exchange.set_ticker("SOL/USDT", 94.0);
        h.exchange
            .set_order_error(Some(ExchangeError::Timeout(Duration::from_secs(15))));
        assert!(matches!(h.monitor.tick(&position).await, TickOutcome::Retry { .. }));
        assert_eq!(position.lock().await.amount, 1.0);

        h.exchange.set_order_error(None);
        assert!(matches!(h.monitor.tick(&position).await, TickOutcome::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_polls_until_closed() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 1.0).await;
        let position = Arc::new(Mutex::new(long(&id, 1.0)));
        h.exchange.set_ticker("SOL/USDT", 101.0);

        let (_tx, rx) = watch::channel(false);
        let started = tokio::time::Instant::now();
        let handle = h.monitor.spawn_watch(position.clone(), rx);

        tokio::time::sleep(Duration::from_secs(30)).await;
        h.exchange.set_ticker("SOL/USDT", 90.0);

        let exit = handle.await.unwrap();
        assert!(matches!(
            exit,
            WatchExit::Finished(TickOutcome::Closed { reason: ExitReason::StopLoss, .. })
        ));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(h.exchange.calls("fetch_ticker"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_stops_on_shutdown() {
        let h = harness();
        let id = opened(&h, OrderSide::Buy, 1.0).await;
        let position = Arc::new(Mutex::new(long(&id, 1.0)));
        h.exchange.set_ticker("SOL/USDT", 101.0);

        let (tx, rx) = watch::channel(false);
        let handle = h.monitor.spawn_watch(position.clone(), rx);
        tokio::time::sleep(Duration::from_secs(5)).await;

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), WatchExit::Shutdown);
        assert!(!position.lock().await.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_on_one_symbol_share_a_price_read() {
        let h = harness();
        let first = Mutex::new(long(&opened(&h, OrderSide::Buy, 1.0).await, 1.0));
        let second = Mutex::new(long(&opened(&h, OrderSide::Buy, 1.0).await, 1.0));
        h.exchange.set_ticker("SOL/USDT", 101.0);

        assert!(matches!(h.monitor.tick(&first).await, TickOutcome::Holding { price } if price == 101.0));
        assert!(matches!(h.monitor.tick(&second).await, TickOutcome::Holding { price } if price == 101.0));
        assert_eq!(h.exchange.calls("fetch_ticker"), 1);

        // the next poll always sees a fresh price
        h.exchange.set_ticker("SOL/USDT", 94.0);
        tokio::time::advance(h.monitor.policy().poll_interval).await;
        assert!(matches!(
            h.monitor.tick(&first).await,
            TickOutcome::Closed { reason: ExitReason::StopLoss, .. }
        ));
        assert_eq!(h.exchange.calls("fetch_ticker"), 2);
    }

    #[test]
    fn test_quote_ttl_bounded_by_poll_interval() {
        let policy = ExitPolicy {
            poll_interval: Duration::from_millis(20),
            ..ExitPolicy::default()
        };
        assert_eq!(policy.effective_quote_ttl(), Duration::from_millis(10));
        assert_eq!(ExitPolicy::default().effective_quote_ttl(), Duration::from_secs(5));
    }
}
