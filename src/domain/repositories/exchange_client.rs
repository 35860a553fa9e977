//! Exchange Client Trait
//!
//! This module defines the `ExchangeClient` trait, the only way the engine talks
//! to an exchange. One client serves every user; implementations route each
//! call to the right account credentials.
//!
//! ## Benefits
//! - Decouples trading logic from exchange-specific code
//! - Enables easy mocking for testing
//! - Makes every exchange round-trip an explicit suspension point

use crate::domain::entities::balance::Balances;
use crate::domain::entities::market::{Candle, Ticker};
use crate::domain::entities::order::{OrderReceipt, OrderRequest};
use crate::domain::errors::ExchangeError;
use async_trait::async_trait;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Exchange client trait providing common interface for all exchanges
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Get the name of this exchange
    fn name(&self) -> &str;

    /// Balances of one user's account keyed by asset
    async fn fetch_balance(&self, user_id: &str) -> ExchangeResult<Balances>;

    /// Last/bid/ask for a symbol such as `BTC/USDT`
    async fn fetch_ticker(&self, symbol: &str) -> ExchangeResult<Ticker>;

    /// Most recent `limit` candles, oldest first
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Place an order on behalf of `user_id`
    ///
    /// # Returns
    /// The executed order as acknowledged by the exchange
    async fn create_order(
        &self,
        user_id: &str,
        order: &OrderRequest,
    ) -> ExchangeResult<OrderReceipt>;

    /// Cancel an order on the exchange
    async fn cancel_order(&self, user_id: &str, order_id: &str, symbol: &str)
        -> ExchangeResult<()>;

    /// Release connections held by the client
    async fn close(&self) -> ExchangeResult<()> {
        // Default implementation - can be overridden
        Ok(())
    }
}
