//! `ExchangeClient` decorator sharing one request quota across all callers.
//!
//! Every request waits for a permit before reaching the inner client, so
//! concurrent users and position monitors cannot exceed the exchange's rate
//! limit between them. `close` is never throttled.

use crate::domain::entities::balance::Balances;
use crate::domain::entities::market::{Candle, Ticker};
use crate::domain::entities::order::{OrderReceipt, OrderRequest};
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use crate::rate_limit::ExchangeRateLimiter;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RateLimitedExchange {
    inner: Arc<dyn ExchangeClient>,
    limiter: ExchangeRateLimiter,
}

impl RateLimitedExchange {
    pub fn new(inner: Arc<dyn ExchangeClient>, limiter: ExchangeRateLimiter) -> Self {
        Self { inner, limiter }
    }

    async fn permit(&self) {
        self.limiter.until_ready().await;
    }
}

#[async_trait]
impl ExchangeClient for RateLimitedExchange {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch_balance(&self, user_id: &str) -> ExchangeResult<Balances> {
        self.permit().await;
        self.inner.fetch_balance(user_id).await
    }

    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker> {
        self.permit().await;
        self.inner.fetch_ticker(symbol).await
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.permit().await;
        self.inner.fetch_ohlcv(symbol, timeframe, limit).await
    }

    async fn create_order(
        &self,
        user_id: &str,
        order: &OrderRequest,
    ) -> ExchangeResult<OrderReceipt> {
        self.permit().await;
        self.inner.create_order(user_id, order).await
    }

    async fn cancel_order(
        &self,
        user_id: &str,
        order_id: &str,
        symbol: &str,
    ) -> ExchangeResult<()> {
        self.permit().await;
        self.inner.cancel_order(user_id, order_id, symbol).await
    }

    async fn close(&self) -> ExchangeResult<()> {
        self.inner.close().await
    }
}
