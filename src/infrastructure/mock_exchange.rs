//! Scriptable in-process exchange.
//!
//! Serves balances, tickers and candles from memory, fills market orders at the
//! current ticker price, and lets callers inject failures and latency. Used for
//! paper runs and by the test suites.

use crate::domain::entities::balance::{AssetBalance, Balances};
use crate::domain::entities::market::{Candle, Ticker};
use crate::domain::entities::order::{OrderReceipt, OrderRequest};
use crate::domain::errors::ExchangeError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct MockState {
    balances: HashMap<String, Balances>,
    /// Remaining injected balance failures per user (u32::MAX = forever)
    balance_failures: HashMap<String, u32>,
    tickers: HashMap<String, Ticker>,
    ticker_errors: HashMap<String, ExchangeError>,
    ohlcv: HashMap<String, Vec<Candle>>,
    ohlcv_error: Option<ExchangeError>,
    order_error: Option<ExchangeError>,
    orders: Vec<(String, OrderRequest)>,
    calls: HashMap<&'static str, u32>,
    latency: Duration,
    closed: bool,
}

pub struct MockExchangeClient {
    name: String,
    state: Mutex<MockState>,
}

impl MockExchangeClient {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        // A poisoned lock only means another test thread panicked; keep serving.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_balance(&self, user_id: &str, asset: &str, free: f64, used: f64) {
        self.with_state(|s| {
            s.balances
                .entry(user_id.to_string())
                .or_default()
                .insert(asset.to_string(), AssetBalance::new(free, used));
        });
    }

    /// Fail the next `times` balance fetches for `user_id`.
    pub fn fail_balance(&self, user_id: &str, times: u32) {
        self.with_state(|s| {
            s.balance_failures.insert(user_id.to_string(), times);
        });
    }

    pub fn set_ticker(&self, symbol: &str, last: f64) {
        self.with_state(|s| {
            s.ticker_errors.remove(symbol);
            s.tickers.insert(
                symbol.to_string(),
                Ticker {
                    last,
                    bid: last,
                    ask: last,
                },
            );
        });
    }

    pub fn set_ticker_error(&self, symbol: &str, error: ExchangeError) {
        self.with_state(|s| {
            s.ticker_errors.insert(symbol.to_string(), error);
        });
    }

    pub fn set_ohlcv(&self, symbol: &str, candles: Vec<Candle>) {
        self.with_state(|s| {
            s.ohlcv.insert(symbol.to_string(), candles);
        });
    }

    pub fn set_ohlcv_error(&self, error: Option<ExchangeError>) {
        self.with_state(|s| s.ohlcv_error = error);
    }

    pub fn set_order_error(&self, error: Option<ExchangeError>) {
        self.with_state(|s| s.order_error = error);
    }

    /// Delay applied to every call before it answers.
    pub fn set_latency(&self, latency: Duration) {
        self.with_state(|s| s.latency = latency);
    }

    pub fn calls(&self, method: &str) -> u32 {
        self.with_state(|s| s.calls.get(method).copied().unwrap_or(0))
    }

    pub fn placed_orders(&self) -> Vec<(String, OrderRequest)> {
        self.with_state(|s| s.orders.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    async fn enter(&self, method: &'static str) {
        let latency = self.with_state(|s| {
            *s.calls.entry(method).or_insert(0) += 1;
            s.latency
        });
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchangeClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_balance(&self, user_id: &str) -> ExchangeResult<Balances> {
        self.enter("fetch_balance").await;
        self.with_state(|s| {
            if let Some(remaining) = s.balance_failures.get_mut(user_id) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(ExchangeError::Network("mock balance outage".to_string()));
                }
            }
            Ok(s.balances.get(user_id).cloned().unwrap_or_default())
        })
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.enter("fetch_ticker").await;
        self.with_state(|s| {
            if let Some(error) = s.ticker_errors.get(symbol) {
                return Err(error.clone());
            }
            s.tickers
                .get(symbol)
                .copied()
                .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
        })
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.enter("fetch_ohlcv").await;
        self.with_state(|s| {
            if let Some(error) = &s.ohlcv_error {
                return Err(error.clone());
            }
            let candles = s
                .ohlcv
                .get(symbol)
                .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))?;
            let skip = candles.len().saturating_sub(limit);
            Ok(candles[skip..].to_vec())
        })
    }

    async fn create_order(
        &self,
        user_id: &str,
        order: &OrderRequest,
    ) -> ExchangeResult<OrderReceipt> {
        self.enter("create_order").await;
        self.with_state(|s| {
            if let Some(error) = &s.order_error {
                return Err(error.clone());
            }
            if let Some(error) = s.ticker_errors.get(&order.symbol) {
                return Err(error.clone());
            }
            let price = match order.price {
                Some(price) => price,
                None => s
                    .tickers
                    .get(&order.symbol)
                    .map(|t| t.last)
                    .ok_or_else(|| ExchangeError::InvalidSymbol(order.symbol.clone()))?,
            };
            s.orders.push((user_id.to_string(), order.clone()));
            Ok(OrderReceipt {
                id: Uuid::new_v4().to_string(),
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                amount: order.amount,
                price,
                timestamp: Utc::now(),
            })
        })
    }

    async fn cancel_order(
        &self,
        _user_id: &str,
        _order_id: &str,
        _symbol: &str,
    ) -> ExchangeResult<()> {
        self.enter("cancel_order").await;
        Ok(())
    }

    async fn close(&self) -> ExchangeResult<()> {
        self.with_state(|s| s.closed = true);
        Ok(())
    }
}
