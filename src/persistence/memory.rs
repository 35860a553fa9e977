//! In-process [`LedgerStore`] for paper runs and tests.
//!
//! Keeps the same expiry semantics as the SQLite store. Writes can be made to
//! fail on demand to exercise the ledger's retry path.

use crate::domain::entities::risk_state::UserRiskState;
use crate::domain::entities::summary::UserSummary;
use crate::domain::entities::trade::{TradeRecord, TradeStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::ledger_store::{LedgerStore, StoreResult, StoredTrade, TradeFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    /// Insertion order
    trades: Vec<StoredTrade>,
    summaries: HashMap<String, UserSummary>,
    risk_states: HashMap<String, UserRiskState>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: RwLock<Tables>,
    /// Remaining writes to fail (u32::MAX = forever)
    failing_writes: AtomicU32,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` write calls with a backend error.
    pub fn fail_writes(&self, times: u32) {
        self.failing_writes.store(times, Ordering::SeqCst);
    }

    pub async fn stored_count(&self) -> usize {
        self.tables.read().await.trades.len()
    }

    fn check_write(&self) -> StoreResult<()> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != u32::MAX {
            self.failing_writes.fetch_sub(1, Ordering::SeqCst);
        }
        Err(StoreError::Backend("store unavailable".to_string()))
    }
}

fn matches(filter: &TradeFilter, record: &TradeRecord) -> bool {
    match filter {
        TradeFilter::All => true,
        TradeFilter::Symbol(symbol) => &record.symbol == symbol,
        TradeFilter::User(user_id) => &record.user_id == user_id,
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_trade(
        &self,
        record: &TradeRecord,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        if tables.trades.iter().any(|t| t.record.trade_id == record.trade_id) {
            return Err(StoreError::Backend(format!(
                "duplicate trade id {}",
                record.trade_id
            )));
        }
        tables.trades.push(StoredTrade {
            record: record.clone(),
            expires_at,
        });
        Ok(())
    }

    async fn update_trade_outcome(
        &self,
        trade_id: &str,
        pnl: f64,
        status: TradeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        match tables
            .trades
            .iter_mut()
            .find(|t| t.record.trade_id == trade_id && t.expires_at > now)
        {
            Some(stored) => {
                stored.record.pnl = pnl;
                stored.record.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_trade(
        &self,
        trade_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TradeRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .iter()
            .find(|t| t.record.trade_id == trade_id && t.expires_at > now)
            .map(|t| t.record.clone()))
    }

    async fn list_trades(
        &self,
        filter: &TradeFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<TradeRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .trades
            .iter()
            .filter(|t| t.expires_at > now && matches(filter, &t.record))
            .map(|t| t.record.clone())
            .collect())
    }

    async fn latest_trades(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<StoredTrade>> {
        let tables = self.tables.read().await;
        let mut latest: Vec<StoredTrade> = tables
            .trades
            .iter()
            .rev()
            .filter(|t| t.expires_at > now)
            .take(limit)
            .cloned()
            .collect();
        latest.reverse();
        Ok(latest)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check_write()?;
        let mut tables = self.tables.write().await;
        let before = tables.trades.len();
        tables.trades.retain(|t| t.expires_at > now);
        Ok((before - tables.trades.len()) as u64)
    }

    async fn save_summary(&self, summary: &UserSummary) -> StoreResult<()> {
        self.check_write()?;
        self.tables
            .write()
            .await
            .summaries
            .insert(summary.user_id.clone(), summary.clone());
        Ok(())
    }

    async fn load_summaries(&self) -> StoreResult<Vec<UserSummary>> {
        Ok(self.tables.read().await.summaries.values().cloned().collect())
    }

    async fn save_risk_state(&self, state: &UserRiskState) -> StoreResult<()> {
        self.check_write()?;
        self.tables
            .write()
            .await
            .risk_states
            .insert(state.user_id.clone(), state.clone());
        Ok(())
    }

    async fn load_risk_state(&self, user_id: &str) -> StoreResult<Option<UserRiskState>> {
        Ok(self.tables.read().await.risk_states.get(user_id).cloned())
    }
}
