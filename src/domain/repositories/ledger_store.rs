//! Durable storage behind the trade ledger and per-user risk state.

use crate::domain::entities::risk_state::UserRiskState;
use crate::domain::entities::summary::UserSummary;
use crate::domain::entities::trade::{TradeRecord, TradeStatus};
use crate::domain::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type StoreResult<T> = Result<T, StoreError>;

/// Which records a listing returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeFilter {
    All,
    Symbol(String),
    User(String),
}

/// A record as persisted, with the instant it stops being served
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTrade {
    pub record: TradeRecord,
    pub expires_at: DateTime<Utc>,
}

/// Storage contract. Reads never return records whose expiry is at or before `now`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_trade(&self, record: &TradeRecord, expires_at: DateTime<Utc>)
        -> StoreResult<()>;

    /// Returns `false` when no live record has this id.
    async fn update_trade_outcome(
        &self,
        trade_id: &str,
        pnl: f64,
        status: TradeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn get_trade(&self, trade_id: &str, now: DateTime<Utc>)
        -> StoreResult<Option<TradeRecord>>;

    /// Oldest first
    async fn list_trades(&self, filter: &TradeFilter, now: DateTime<Utc>)
        -> StoreResult<Vec<TradeRecord>>;

    /// Newest `limit` records, oldest first
    async fn latest_trades(&self, limit: usize, now: DateTime<Utc>)
        -> StoreResult<Vec<StoredTrade>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    async fn save_summary(&self, summary: &UserSummary) -> StoreResult<()>;

    async fn load_summaries(&self) -> StoreResult<Vec<UserSummary>>;

    async fn save_risk_state(&self, state: &UserRiskState) -> StoreResult<()>;

    async fn load_risk_state(&self, user_id: &str) -> StoreResult<Option<UserRiskState>>;
}
