//! TradingEngine - admission control and position lifecycle for many users
//!
//! The engine wires the domain services together:
//! - `admit_trade` runs the breakers, valuates the deposit, sizes the trade
//!   and reserves budget
//! - `on_order_filled` records the fill and starts a position monitor
//! - `run_cycle` drives both from a `SignalSource` for a set of users
//!
//! ## Lock Ordering Convention
//!
//! The position registry lock is never held while a position lock is awaited
//! by a monitor tick, and no lock is held across exchange I/O.

use crate::config::EngineConfig;
use crate::domain::entities::market::{MarketConditions, Signal, TradingSignal};
use crate::domain::entities::order::{OrderReceipt, OrderRequest, OrderSide};
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::entities::summary::UserSummary;
use crate::domain::entities::trade::{NewTrade, TradeStatus};
use crate::domain::errors::{EngineError, LedgerError, ValidationError};
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::repositories::ledger_store::LedgerStore;
use crate::domain::repositories::signal_source::SignalSource;
use crate::domain::services::admission::{AdmissionDecision, RejectionReason};
use crate::domain::services::balance_gateway::{BalanceFetch, BalanceGateway};
use crate::domain::services::daily_limit::{DailyLimitLedger, Reservation};
use crate::domain::services::deposit_valuator::DepositValuator;
use crate::domain::services::market_breaker::{MarketCircuitBreaker, MarketGate};
use crate::domain::services::position_monitor::{PositionMonitor, TickOutcome, WatchExit};
use crate::domain::services::price_cache::{PriceCache, PriceResolver};
use crate::domain::services::resilience::with_timeout;
use crate::domain::services::risk_sizer::RiskSizer;
use crate::domain::services::trade_ledger::TradeLedger;
use crate::infrastructure::rate_limited_client::RateLimitedExchange;
use crate::persistence::repository::SqliteLedgerStore;
use crate::persistence::{init_database, DatabaseError};
use crate::rate_limit::create_rate_limiter;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// An executed order handed back by the orchestration layer
#[derive(Debug, Clone)]
pub struct FilledOrder {
    pub user_id: String,
    pub receipt: OrderReceipt,
    /// Signal the order was placed on, stored with the trade
    pub signal: Option<TradingSignal>,
    pub market_conditions: MarketConditions,
}

/// What happened to one (user, symbol) candidate in a trading cycle
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Skipped { reason: String },
    Rejected(RejectionReason),
    Executed { trade_id: String, amount: f64, price: f64 },
    /// The order filled but could not be recorded
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub user_id: String,
    pub symbol: String,
    pub outcome: ExecutionOutcome,
}

/// Actionable signal for one symbol in the current cycle
#[derive(Debug, Clone)]
struct SymbolSignal {
    symbol: String,
    signal: TradingSignal,
    conditions: MarketConditions,
}

struct WatchedPosition {
    user_id: String,
    position: Arc<Mutex<Position>>,
    supervisor: Option<JoinHandle<()>>,
}

/// Validate trading symbol format
///
/// Symbols must be non-empty, at most 20 characters, and contain only
/// alphanumerics, hyphens, underscores or slashes.
fn validate_symbol(symbol: &str) -> Result<(), ValidationError> {
    if symbol.is_empty() || symbol.len() > 20 {
        return Err(ValidationError::InvalidSymbol(format!(
            "invalid symbol length: '{}' (must be 1-20 characters)",
            symbol
        )));
    }

    if !symbol
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '/')
    {
        return Err(ValidationError::InvalidSymbol(format!(
            "invalid symbol format: '{}' (only alphanumeric, -, _, / allowed)",
            symbol
        )));
    }

    Ok(())
}

fn validate_user(user_id: &str) -> Result<(), ValidationError> {
    if user_id.trim().is_empty() {
        return Err(ValidationError::InvalidUser("user id is empty".to_string()));
    }
    Ok(())
}

/// Wait for each handle until `deadline`; returns the ones still running.
async fn join_until(
    deadline: Instant,
    handles: Vec<(String, JoinHandle<()>)>,
) -> Vec<(String, JoinHandle<()>)> {
    let mut running = Vec::new();
    for (id, mut handle) in handles {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Err(e)) => error!("Monitor supervisor for {} aborted: {}", id, e),
            Ok(Ok(())) => {}
            Err(_) => running.push((id, handle)),
        }
    }
    running
}

fn remaining_secs(until: Instant) -> u64 {
    until.saturating_duration_since(Instant::now()).as_secs()
}

fn wall_clock(until: Instant) -> DateTime<Utc> {
    let remaining = until.saturating_duration_since(Instant::now());
    Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
}

pub struct TradingEngine {
    config: EngineConfig,
    exchange: Arc<dyn ExchangeClient>,
    signals: Arc<dyn SignalSource>,
    balances: BalanceGateway,
    valuator: DepositValuator,
    limits: Arc<DailyLimitLedger>,
    risk: RiskSizer,
    market: MarketCircuitBreaker,
    ledger: Arc<TradeLedger>,
    monitor: Arc<PositionMonitor>,
    positions: Arc<Mutex<HashMap<String, WatchedPosition>>>,
    user_slots: Semaphore,
    shutdown: watch::Sender<bool>,
    fatal: Arc<watch::Sender<Option<String>>>,
}

impl TradingEngine {
    /// Engine over an empty ledger view of `store`.
    pub fn new(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn LedgerStore>,
        signals: Arc<dyn SignalSource>,
    ) -> Self {
        let ledger = TradeLedger::new(store, config.ledger.clone());
        Self::assemble(config, exchange, signals, ledger)
    }

    /// Engine whose ledger is rebuilt from what `store` still holds.
    pub async fn open(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        store: Arc<dyn LedgerStore>,
        signals: Arc<dyn SignalSource>,
    ) -> Result<Self, LedgerError> {
        let ledger = TradeLedger::open(store, config.ledger.clone()).await?;
        Ok(Self::assemble(config, exchange, signals, ledger))
    }

    /// Production wiring: SQLite ledger and a rate-limited exchange.
    pub async fn connect(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        signals: Arc<dyn SignalSource>,
    ) -> Result<Self, StartupError> {
        let pool = init_database(&config.database).await?;
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::new(pool));
        let limiter = create_rate_limiter(&config.rate_limit);
        let exchange: Arc<dyn ExchangeClient> =
            Arc::new(RateLimitedExchange::new(exchange, limiter));
        Ok(Self::open(config, exchange, store, signals).await?)
    }

    fn assemble(
        config: EngineConfig,
        exchange: Arc<dyn ExchangeClient>,
        signals: Arc<dyn SignalSource>,
        ledger: TradeLedger,
    ) -> Self {
        let ledger = Arc::new(ledger);
        let cache = Arc::new(PriceCache::new(
            config.price_cache.ttl,
            config.price_cache.capacity,
        ));
        let resolver = Arc::new(PriceResolver::new(
            exchange.clone(),
            cache,
            &config.price_cache,
        ));
        let valuator = DepositValuator::new(resolver, config.deposit.clone());
        let balances = BalanceGateway::new(exchange.clone(), config.balance.clone());
        let limits = Arc::new(DailyLimitLedger::new(
            ledger.clone(),
            config.daily_limits.clone(),
        ));
        let risk = RiskSizer::new(ledger.clone(), limits.clone(), config.risk.clone());
        let market = MarketCircuitBreaker::new(exchange.clone(), config.market.clone());
        let monitor = Arc::new(PositionMonitor::new(
            exchange.clone(),
            ledger.clone(),
            limits.clone(),
            config.exit.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        let (fatal, _) = watch::channel(None);

        info!(
            "Trading engine ready on {} ({} concurrent users, quote {})",
            exchange.name(),
            config.max_concurrent_users,
            config.deposit.quote_currency
        );

        Self {
            user_slots: Semaphore::new(config.max_concurrent_users.max(1)),
            config,
            exchange,
            signals,
            balances,
            valuator,
            limits,
            risk,
            market,
            ledger,
            monitor,
            positions: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
            fatal: Arc::new(fatal),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> Arc<TradeLedger> {
        self.ledger.clone()
    }

    pub fn limits(&self) -> Arc<DailyLimitLedger> {
        self.limits.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ledger failure that should stop the process, if one happened
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal.borrow().clone()
    }

    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<String>> {
        self.fatal.subscribe()
    }

    /// Decide whether `user_id` may open a `side` trade on `symbol`, and how much.
    ///
    /// Every refusal is a normal outcome carried in the decision. An approved
    /// decision holds a budget reservation; call [`Self::release`] if the
    /// order is then not placed.
    pub async fn admit_trade(
        &self,
        user_id: &str,
        symbol: &str,
        side: OrderSide,
        market_conditions: &MarketConditions,
    ) -> AdmissionDecision {
        if self.is_shutting_down() {
            return AdmissionDecision::reject(RejectionReason::ShuttingDown);
        }
        // fills could not be recorded, so nothing new may be opened
        if let Some(reason) = self.fatal_error() {
            return AdmissionDecision::reject(RejectionReason::LedgerUnavailable { reason });
        }
        if let Err(e) = validate_user(user_id).and_then(|_| validate_symbol(symbol)) {
            return AdmissionDecision::reject(RejectionReason::InvalidInput {
                reason: e.to_string(),
            });
        }
        let volatility = market_conditions.volatility;
        if !volatility.is_finite() || volatility < 0.0 {
            return AdmissionDecision::reject(RejectionReason::InvalidInput {
                reason: format!("volatility must be a non-negative number, got {}", volatility),
            });
        }

        match self.market.check(user_id).await {
            MarketGate::Open => {}
            MarketGate::Paused { until } => {
                info!("{} {} {}: market paused", user_id, side, symbol);
                return AdmissionDecision::reject(RejectionReason::MarketPaused {
                    remaining_secs: remaining_secs(until),
                });
            }
            MarketGate::UserSuspended { until } => {
                self.limits
                    .set_suspension(user_id, Some(wall_clock(until)))
                    .await;
                return AdmissionDecision::reject(RejectionReason::UserSuspended {
                    remaining_secs: remaining_secs(until),
                });
            }
        }

        let balances = match self.balances.fetch_balance(user_id, false).await {
            BalanceFetch::Balance(balances) => balances,
            BalanceFetch::Suspended { until } => {
                self.limits
                    .set_suspension(user_id, Some(wall_clock(until)))
                    .await;
                return AdmissionDecision::reject(RejectionReason::BalanceSuspended {
                    remaining_secs: remaining_secs(until),
                });
            }
        };
        self.limits.set_suspension(user_id, None).await;

        let deposit = self.valuator.value_deposit(user_id, &balances).await;
        if deposit <= 0.0 {
            warn!("Nothing to trade for {}: deposit valued at {:.2}", user_id, deposit);
            return AdmissionDecision::reject(RejectionReason::PriceUnavailable {
                reason: format!(
                    "deposit has no value in {}",
                    self.valuator.quote_currency()
                ),
            });
        }
        let state = self.limits.update_deposit(user_id, deposit).await;

        let fraction = self.risk.trade_fraction(user_id, market_conditions).await;
        if !fraction.allowed {
            return AdmissionDecision::reject(RejectionReason::DrawdownLimit {
                drawdown: state.drawdown(),
                limit: self.risk.max_drawdown_for(volatility),
            });
        }

        let price = match with_timeout(self.config.exit.call_timeout, self.exchange.fetch_ticker(symbol))
            .await
        {
            Ok(ticker) if ticker.last.is_finite() && ticker.last > 0.0 => ticker.last,
            Ok(ticker) => {
                warn!("No usable price for {}: {}", symbol, ticker.last);
                return AdmissionDecision::reject(RejectionReason::PriceUnavailable {
                    reason: format!("invalid price {} for {}", ticker.last, symbol),
                });
            }
            Err(e) => {
                warn!("Price for {} unavailable: {}", symbol, e);
                return AdmissionDecision::reject(RejectionReason::PriceUnavailable {
                    reason: e.to_string(),
                });
            }
        };

        let cap_scale = self.risk.cap_scale(&fraction);
        match self.limits.reserve_scaled(user_id, price, cap_scale).await {
            Some(reservation) => {
                info!(
                    "Admitted {} {} {} {:.6} @ {} (notional {:.2}, fraction {:.4})",
                    user_id, side, symbol, reservation.amount, price, reservation.notional, fraction.fraction
                );
                AdmissionDecision::approve(reservation, fraction.fraction)
            }
            None => {
                let remaining = self
                    .limits
                    .snapshot(user_id)
                    .await
                    .map(|s| s.remaining_budget())
                    .unwrap_or(0.0);
                AdmissionDecision::reject(RejectionReason::DailyBudget { remaining })
            }
        }
    }

    /// Give back the budget of an admitted trade whose order was not placed.
    pub async fn release(&self, user_id: &str, reservation: &Reservation) {
        self.limits.release(user_id, reservation.notional).await;
    }

    /// Record an executed order and start watching the resulting position.
    ///
    /// A fill arriving during shutdown is still recorded but not monitored.
    pub async fn on_order_filled(
        &self,
        fill: FilledOrder,
        strategy_tag: Option<String>,
    ) -> Result<String, EngineError> {
        validate_user(&fill.user_id)?;
        validate_symbol(&fill.receipt.symbol)?;
        let receipt = &fill.receipt;

        let (signals, metrics) = fill
            .signal
            .as_ref()
            .map(|s| (s.snapshot(), s.metrics.clone()))
            .unwrap_or((Value::Null, Value::Null));
        let side = PositionSide::from_order_side(receipt.side);
        let levels = self.config.exit.levels_for(fill.market_conditions.volatility);

        // validate before anything is written
        let position = Position::open(
            "",
            &fill.user_id,
            &receipt.symbol,
            side,
            receipt.price,
            receipt.amount,
            levels,
            strategy_tag.clone(),
            fill.market_conditions.clone(),
        )?;

        let record = NewTrade::new(
            &fill.user_id,
            &receipt.symbol,
            receipt.side,
            receipt.amount,
            receipt.price,
        )
        .with_status(TradeStatus::Filled)
        .with_signals(signals, metrics)
        .with_market_conditions(fill.market_conditions.to_value())
        .with_strategy(strategy_tag)
        .with_timestamp(receipt.timestamp);

        let trade_id = match self.ledger.create(record).await {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "Fill not recorded (user {}, {} {} {} @ {}, order {}): {}",
                    fill.user_id,
                    receipt.side,
                    receipt.amount,
                    receipt.symbol,
                    receipt.price,
                    receipt.id,
                    e
                );
                if matches!(e, LedgerError::Unavailable(_)) {
                    self.fatal.send_replace(Some(e.to_string()));
                }
                return Err(e.into());
            }
        };

        let position = Position {
            trade_id: trade_id.clone(),
            ..position
        };
        info!(
            "Opened {} {} {} {} @ {} (stop {:.4}, trail {:.2}%)",
            trade_id,
            side,
            position.symbol,
            position.amount,
            position.entry_price,
            position.stop_loss_price,
            position.take_profit_drop_fraction * 100.0
        );
        self.watch(position).await;

        Ok(trade_id)
    }

    async fn watch(&self, position: Position) {
        let trade_id = position.trade_id.clone();
        let user_id = position.user_id.clone();
        let position = Arc::new(Mutex::new(position));

        // registry lock held until the entry exists so the supervisor's
        // removal always comes after the insert
        let mut registry = self.positions.lock().await;
        if self.is_shutting_down() {
            warn!("Not monitoring {} during shutdown", trade_id);
            registry.insert(
                trade_id,
                WatchedPosition {
                    user_id,
                    position,
                    supervisor: None,
                },
            );
            return;
        }

        let handle = self
            .monitor
            .spawn_watch(position.clone(), self.shutdown.subscribe());
        let positions = self.positions.clone();
        let fatal = self.fatal.clone();
        let id = trade_id.clone();
        let supervisor = tokio::spawn(async move {
            match handle.await {
                Ok(WatchExit::Shutdown) => {
                    debug!("Monitor for {} stopped for shutdown", id);
                    return;
                }
                Ok(WatchExit::Finished(TickOutcome::Fatal { error })) => {
                    error!("Ledger unreachable while closing {}: {}", id, error);
                    fatal.send_replace(Some(error));
                }
                Ok(WatchExit::Finished(outcome)) => {
                    debug!("Monitor for {} finished: {:?}", id, outcome);
                }
                Err(e) => error!("Monitor for {} aborted: {}", id, e),
            }
            positions.lock().await.remove(&id);
        });

        registry.insert(
            trade_id,
            WatchedPosition {
                user_id,
                position,
                supervisor: Some(supervisor),
            },
        );
    }

    pub async fn get_user_summary(&self, user_id: &str) -> Option<UserSummary> {
        self.ledger.summary(user_id).await
    }

    /// Snapshots of the user's positions that are still open
    pub async fn get_open_positions(&self, user_id: &str) -> Vec<Position> {
        let handles: Vec<Arc<Mutex<Position>>> = {
            let registry = self.positions.lock().await;
            registry
                .values()
                .filter(|w| w.user_id == user_id)
                .map(|w| w.position.clone())
                .collect()
        };

        let mut open = Vec::with_capacity(handles.len());
        for handle in handles {
            let position = handle.lock().await;
            if !position.is_closed() {
                open.push(position.clone());
            }
        }
        open.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        open
    }

    /// One trading pass: evaluate `symbols` once, then try every actionable
    /// signal for each user, at most `max_concurrent_users` users at a time.
    pub async fn run_cycle(&self, users: &[String], symbols: &[String]) -> Vec<CycleReport> {
        if self.is_shutting_down() {
            return Vec::new();
        }
        if let Some(error) = self.fatal_error() {
            error!("Skipping trading cycle, ledger unavailable: {}", error);
            return Vec::new();
        }

        let mut actionable = Vec::new();
        for symbol in symbols {
            if let Some(signal) = self.signal_for(symbol).await {
                actionable.push(signal);
            }
        }
        if actionable.is_empty() {
            debug!("No actionable signals this cycle");
            return Vec::new();
        }

        let passes = users.iter().map(|user| self.process_user(user, &actionable));
        let reports: Vec<CycleReport> = join_all(passes).await.into_iter().flatten().collect();

        let executed = reports
            .iter()
            .filter(|r| matches!(r.outcome, ExecutionOutcome::Executed { .. }))
            .count();
        info!(
            "Cycle done: {} users, {} signals, {} trades opened",
            users.len(),
            actionable.len(),
            executed
        );
        reports
    }

    async fn signal_for(&self, symbol: &str) -> Option<SymbolSignal> {
        let candles = match with_timeout(
            self.config.exit.call_timeout,
            self.exchange.fetch_ohlcv(
                symbol,
                &self.config.signal_timeframe,
                self.config.signal_candles,
            ),
        )
        .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!("Skipping {}: candles unavailable: {}", symbol, e);
                return None;
            }
        };

        let Some(signal) = self.signals.evaluate(symbol, &candles).await else {
            debug!("No signal for {}", symbol);
            return None;
        };
        if signal.signal == Signal::Hold || signal.confidence < self.config.min_signal_confidence {
            debug!(
                "Ignoring {} {} (confidence {:.2})",
                signal.signal.as_str(),
                symbol,
                signal.confidence
            );
            return None;
        }

        let conditions = if signal.market_conditions == MarketConditions::default() {
            MarketConditions::from_candles(&candles).unwrap_or_default()
        } else {
            signal.market_conditions.clone()
        };

        Some(SymbolSignal {
            symbol: symbol.to_string(),
            signal,
            conditions,
        })
    }

    async fn process_user(&self, user_id: &str, signals: &[SymbolSignal]) -> Vec<CycleReport> {
        let Ok(_slot) = self.user_slots.acquire().await else {
            return Vec::new();
        };

        let mut reports = Vec::with_capacity(signals.len());
        for candidate in signals {
            if self.is_shutting_down() || self.fatal.borrow().is_some() {
                break;
            }
            let outcome = self
                .execute_signal(
                    user_id,
                    &candidate.symbol,
                    &candidate.signal,
                    &candidate.conditions,
                )
                .await;
            reports.push(CycleReport {
                user_id: user_id.to_string(),
                symbol: candidate.symbol.clone(),
                outcome,
            });
        }
        reports
    }

    /// Admit, place and record one signal for one user.
    pub async fn execute_signal(
        &self,
        user_id: &str,
        symbol: &str,
        signal: &TradingSignal,
        conditions: &MarketConditions,
    ) -> ExecutionOutcome {
        let side = match signal.signal {
            Signal::Buy => OrderSide::Buy,
            Signal::Sell => OrderSide::Sell,
            Signal::Hold => {
                return ExecutionOutcome::Skipped {
                    reason: "hold".to_string(),
                }
            }
        };
        if signal.confidence < self.config.min_signal_confidence {
            return ExecutionOutcome::Skipped {
                reason: format!("confidence {:.2} below threshold", signal.confidence),
            };
        }

        let decision = self.admit_trade(user_id, symbol, side, conditions).await;
        let Some(reservation) = decision.reservation.filter(|_| decision.approved) else {
            let reason = decision.reason.unwrap_or(RejectionReason::DailyBudget { remaining: 0.0 });
            info!("{} {} {} rejected: {} ({})", user_id, side, symbol, reason, reason.code());
            return ExecutionOutcome::Rejected(reason);
        };

        let order = match OrderRequest::market(symbol, side, reservation.amount) {
            Ok(order) => order,
            Err(e) => {
                self.release(user_id, &reservation).await;
                return ExecutionOutcome::Rejected(RejectionReason::InvalidInput {
                    reason: e.to_string(),
                });
            }
        };

        let receipt = match with_timeout(
            self.config.exit.call_timeout,
            self.exchange.create_order(user_id, &order),
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!("{} order for {} on {} failed: {}", side, user_id, symbol, e);
                self.release(user_id, &reservation).await;
                return ExecutionOutcome::Rejected(RejectionReason::OrderFailed {
                    reason: e.to_string(),
                });
            }
        };

        let amount = receipt.amount;
        let price = receipt.price;
        let fill = FilledOrder {
            user_id: user_id.to_string(),
            receipt,
            signal: Some(signal.clone()),
            market_conditions: conditions.clone(),
        };
        match self
            .on_order_filled(fill, Some(self.signals.name().to_string()))
            .await
        {
            Ok(trade_id) => ExecutionOutcome::Executed {
                trade_id,
                amount,
                price,
            },
            Err(e) => ExecutionOutcome::Failed {
                error: e.to_string(),
            },
        }
    }

    /// Drop expired records from the durable ledger.
    pub async fn purge_expired(&self) -> Result<u64, LedgerError> {
        self.ledger.purge_expired().await
    }

    /// Stop admitting trades, let monitors finish their current tick, then
    /// close the exchange connection.
    pub async fn shutdown(&self, grace: Duration) {
        if self.shutdown.send_replace(true) {
            debug!("Shutdown already in progress");
        }
        info!("Shutting down trading engine");

        let supervisors: Vec<(String, JoinHandle<()>)> = {
            let mut registry = self.positions.lock().await;
            registry
                .iter_mut()
                .filter_map(|(id, w)| w.supervisor.take().map(|h| (id.clone(), h)))
                .collect()
        };
        let pending = supervisors.len();

        let mut running = join_until(Instant::now() + grace, supervisors).await;
        if !running.is_empty() {
            // a tick still in flight is bounded by the per-call timeout
            let ids: Vec<&str> = running.iter().map(|(id, _)| id.as_str()).collect();
            warn!(
                "Monitors for {:?} still running after {:?}, waiting for their current tick",
                ids, grace
            );
            running = join_until(Instant::now() + self.config.exit.call_timeout, running).await;
        }
        if !running.is_empty() {
            let ids: Vec<&str> = running.iter().map(|(id, _)| id.as_str()).collect();
            error!(
                "Closing {} with monitors for {:?} still running",
                self.exchange.name(),
                ids
            );
        }

        if let Err(e) = self.exchange.close().await {
            warn!("Closing {} failed: {}", self.exchange.name(), e);
        }
        info!("Trading engine stopped ({} monitors signalled)", pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::market::Candle;
    use crate::domain::errors::ExchangeError;
    use crate::domain::services::daily_limit::DailyLimitConfig;
    use crate::infrastructure::mock_exchange::MockExchangeClient;
    use crate::persistence::memory::MemoryLedgerStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedSignal {
        signal: Signal,
        confidence: f64,
    }

    #[async_trait]
    impl SignalSource for FixedSignal {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn evaluate(&self, _symbol: &str, _candles: &[Candle]) -> Option<TradingSignal> {
            Some(TradingSignal {
                signal: self.signal,
                confidence: self.confidence,
                metrics: json!({ "score": self.confidence }),
                market_conditions: MarketConditions::with_volatility(0.02),
            })
        }
    }

    fn candle(close: f64, range: f64) -> Candle {
        let half = close * range / 2.0;
        Candle::new(Utc::now(), close, close + half, close - half, close, 1.0)
    }

    fn calm() -> Vec<Candle> {
        vec![candle(100.0, 0.01), candle(100.2, 0.01), candle(100.1, 0.01)]
    }

    fn exchange() -> Arc<MockExchangeClient> {
        let exchange = Arc::new(MockExchangeClient::new("mock"));
        exchange.set_balance("u1", "USDT", 1000.0, 0.0);
        exchange.set_ohlcv("BTC/USDT", calm());
        exchange.set_ohlcv("SOL/USDT", calm());
        exchange.set_ticker("SOL/USDT", 100.0);
        exchange
    }

    fn engine_with(
        exchange: Arc<MockExchangeClient>,
        config: EngineConfig,
        signal: Signal,
    ) -> TradingEngine {
        TradingEngine::new(
            config,
            exchange,
            Arc::new(MemoryLedgerStore::new()),
            Arc::new(FixedSignal {
                signal,
                confidence: 0.9,
            }),
        )
    }

    fn engine(exchange: Arc<MockExchangeClient>) -> TradingEngine {
        engine_with(exchange, EngineConfig::default(), Signal::Buy)
    }

    fn conditions() -> MarketConditions {
        MarketConditions::with_volatility(0.02)
    }

    #[tokio::test]
    async fn test_admission_sizes_from_minimum_notional() {
        let engine = engine(exchange());
        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;

        assert!(decision.approved, "{}", decision.reason_text());
        // 1% of 1000 is below the fee-adjusted floor
        let reservation = decision.reservation.unwrap();
        assert!((reservation.notional - 10.0 / 0.997).abs() < 1e-9);
        assert!((decision.amount - reservation.notional / 100.0).abs() < 1e-12);

        let state = engine.limits().snapshot("u1").await.unwrap();
        assert!((state.daily_limit - 900.0).abs() < 1e-9);
        assert!((state.daily_used - reservation.notional).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_io() {
        let exchange = exchange();
        let engine = engine(exchange.clone());

        for (user, symbol) in [("u1", ""), ("u1", "SOL USDT"), ("", "SOL/USDT")] {
            let decision = engine
                .admit_trade(user, symbol, OrderSide::Buy, &conditions())
                .await;
            assert!(matches!(
                decision.reason,
                Some(RejectionReason::InvalidInput { .. })
            ));
        }
        let decision = engine
            .admit_trade(
                "u1",
                "SOL/USDT",
                OrderSide::Buy,
                &MarketConditions::with_volatility(f64::NAN),
            )
            .await;
        assert!(!decision.approved);

        assert_eq!(exchange.calls("fetch_ohlcv"), 0);
        assert_eq!(exchange.calls("fetch_balance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_market_pause_applies_to_every_user() {
        let exchange = exchange();
        exchange.set_balance("u2", "USDT", 1000.0, 0.0);
        exchange.set_ohlcv("BTC/USDT", vec![candle(100.0, 0.01), candle(90.0, 0.01)]);
        let engine = engine(exchange.clone());

        for user in ["u1", "u2"] {
            let decision = engine
                .admit_trade(user, "SOL/USDT", OrderSide::Buy, &conditions())
                .await;
            match decision.reason {
                Some(RejectionReason::MarketPaused { remaining_secs }) => {
                    assert!(remaining_secs > 3500)
                }
                other => panic!("expected market pause, got {:?}", other),
            }
        }
        assert_eq!(exchange.calls("fetch_balance"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_balance_outage_suspends_user() {
        let exchange = exchange();
        exchange.fail_balance("u1", u32::MAX);
        let engine = engine(exchange.clone());

        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;
        assert!(matches!(
            decision.reason,
            Some(RejectionReason::BalanceSuspended { remaining_secs }) if remaining_secs >= 299
        ));
        assert_eq!(exchange.calls("fetch_balance"), 3);

        let state = engine.limits().snapshot("u1").await.unwrap();
        assert!(state.suspended_until.is_some());

        // short-circuits without touching the exchange
        engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;
        assert_eq!(exchange.calls("fetch_balance"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drawdown_blocks_admission() {
        let exchange = exchange();
        let engine = engine(exchange.clone());
        let volatile = MarketConditions::with_volatility(0.07);

        assert!(
            engine
                .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &volatile)
                .await
                .approved
        );

        // past both the balance and the valuation caches
        exchange.set_balance("u1", "USDT", 750.0, 0.0);
        tokio::time::advance(Duration::from_secs(301)).await;

        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &volatile)
            .await;
        match decision.reason {
            Some(RejectionReason::DrawdownLimit { drawdown, limit }) => {
                assert!((drawdown - 0.25).abs() < 1e-9);
                assert!((limit - 0.2).abs() < 1e-9);
            }
            other => panic!("expected drawdown stop, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_is_a_rejection() {
        let config = EngineConfig {
            daily_limits: DailyLimitConfig {
                daily_limit_ratio: 0.015,
                volume_reset_ratio: f64::INFINITY,
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = engine_with(exchange(), config, Signal::Buy);

        assert!(
            engine
                .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
                .await
                .approved
        );
        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;
        match decision.reason {
            Some(RejectionReason::DailyBudget { remaining }) => {
                assert!((remaining - (15.0 - 10.0 / 0.997)).abs() < 1e-9)
            }
            other => panic!("expected budget rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unpriced_symbol_rejected() {
        let exchange = exchange();
        let engine = engine(exchange.clone());
        let decision = engine
            .admit_trade("u1", "DOGE/USDT", OrderSide::Buy, &conditions())
            .await;
        assert!(matches!(
            decision.reason,
            Some(RejectionReason::PriceUnavailable { .. })
        ));
        // nothing reserved
        let state = engine.limits().snapshot("u1").await.unwrap();
        assert_eq!(state.daily_used, 0.0);
    }

    #[tokio::test]
    async fn test_cycle_opens_and_monitors_position() {
        let exchange = exchange();
        let engine = engine(exchange.clone());

        let reports = engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await;
        assert_eq!(reports.len(), 1);
        let ExecutionOutcome::Executed { trade_id, price, .. } = &reports[0].outcome else {
            panic!("expected execution, got {:?}", reports[0].outcome);
        };
        assert_eq!(*price, 100.0);

        let record = engine.ledger().get(trade_id).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::Filled);
        assert_eq!(record.strategy_tag.as_deref(), Some("fixed"));
        assert_eq!(record.signals["signal"], "buy");

        let open = engine.get_open_positions("u1").await;
        assert_eq!(open.len(), 1);
        assert_eq!(&open[0].trade_id, trade_id);
        assert!((open[0].stop_loss_price - 96.0).abs() < 1e-9);
        assert!(engine.get_open_positions("u2").await.is_empty());

        let summary = engine.get_user_summary("u1").await.unwrap();
        assert_eq!(summary.trade_count, 1);
        assert_eq!(summary.pair_counts["SOL/USDT"], 1);

        engine.shutdown(Duration::from_secs(1)).await;
        assert!(exchange.is_closed());
    }

    #[tokio::test]
    async fn test_failed_order_releases_budget() {
        let exchange = exchange();
        exchange.set_order_error(Some(ExchangeError::Rejected("min notional".into())));
        let engine = engine(exchange.clone());

        let reports = engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await;
        assert!(matches!(
            reports[0].outcome,
            ExecutionOutcome::Rejected(RejectionReason::OrderFailed { .. })
        ));

        let state = engine.limits().snapshot("u1").await.unwrap();
        assert!(state.daily_used.abs() < 1e-9);
        assert!(engine.get_open_positions("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_hold_and_weak_signals_are_ignored() {
        let exchange = exchange();
        let engine = engine_with(exchange.clone(), EngineConfig::default(), Signal::Hold);
        let reports = engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await;
        assert!(reports.is_empty());

        let weak = TradingSignal {
            signal: Signal::Buy,
            confidence: 0.4,
            metrics: Value::Null,
            market_conditions: conditions(),
        };
        let outcome = engine
            .execute_signal("u1", "SOL/USDT", &weak, &conditions())
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Skipped { .. }));
        assert!(exchange.placed_orders().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_admissions() {
        let exchange = exchange();
        let engine = engine(exchange.clone());
        engine.shutdown(Duration::from_millis(10)).await;

        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;
        assert_eq!(decision.reason, Some(RejectionReason::ShuttingDown));
        assert!(engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await
            .is_empty());
    }

    fn sol_fill(amount: f64) -> FilledOrder {
        FilledOrder {
            user_id: "u1".to_string(),
            receipt: OrderReceipt {
                id: "o1".to_string(),
                symbol: "SOL/USDT".to_string(),
                side: OrderSide::Buy,
                order_type: crate::domain::entities::order::OrderType::Market,
                amount,
                price: 100.0,
                timestamp: Utc::now(),
            },
            signal: None,
            market_conditions: conditions(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_ledger_stops_admissions() {
        let exchange = exchange();
        let store = Arc::new(MemoryLedgerStore::new());
        let engine = TradingEngine::new(
            EngineConfig::default(),
            exchange.clone(),
            store.clone(),
            Arc::new(FixedSignal {
                signal: Signal::Buy,
                confidence: 0.9,
            }),
        );
        store.fail_writes(u32::MAX);

        let reports = engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await;
        assert!(matches!(reports[0].outcome, ExecutionOutcome::Failed { .. }));
        assert!(engine.fatal_error().is_some());
        let used = engine.limits().snapshot("u1").await.unwrap().daily_used;

        let decision = engine
            .admit_trade("u1", "SOL/USDT", OrderSide::Buy, &conditions())
            .await;
        assert!(!decision.approved);
        assert!(decision.reservation.is_none());
        let reason = decision.reason.unwrap();
        assert!(matches!(reason, RejectionReason::LedgerUnavailable { .. }));
        assert_eq!(reason.code(), "ERR_LEDGER_UNAVAILABLE");

        // no further budget or orders
        assert!(engine
            .run_cycle(&["u1".to_string()], &["SOL/USDT".to_string()])
            .await
            .is_empty());
        assert_eq!(engine.limits().snapshot("u1").await.unwrap().daily_used, used);
        assert_eq!(exchange.placed_orders().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_tick_before_closing() {
        let exchange = exchange();
        exchange.set_latency(Duration::from_secs(5));
        let engine = engine(exchange.clone());

        engine.on_order_filled(sol_fill(1.0), None).await.unwrap();
        while exchange.calls("fetch_ticker") == 0 {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        engine.shutdown(Duration::from_secs(1)).await;

        // the tick outlived the grace period but not the per-call timeout
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(16));
        assert!(exchange.is_closed());
        assert_eq!(engine.get_open_positions("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_fill_with_bad_amount_is_not_recorded() {
        let engine = engine(exchange());
        let result = engine.on_order_filled(sol_fill(0.0), None).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert!(engine.ledger().get_all().await.unwrap().is_empty());
    }
}
