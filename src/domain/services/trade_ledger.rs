//! TradeLedger - the shared, durable record of every trade
//!
//! Three views are kept in step on every write:
//! - the durable store (source of truth, records expire after the retention window)
//! - a bounded ring of the most recent records, indexed by trade id
//! - per-user rolling summaries, which outlive the records they were built from
//!
//! The ledger is the only component allowed to change a record's `pnl` or
//! `status` after creation.

use crate::domain::entities::summary::UserSummary;
use crate::domain::entities::trade::{NewTrade, TradeRecord, TradeStatus};
use crate::domain::errors::{LedgerError, StoreError};
use crate::domain::repositories::ledger_store::{LedgerStore, StoreResult, TradeFilter};
use crate::domain::services::resilience::{attempt_if, KeyedLocks, RetryPolicy};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TradeLedgerConfig {
    pub retention: chrono::Duration,
    pub recent_capacity: usize,
    pub write_retry: RetryPolicy,
}

impl Default for TradeLedgerConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(7),
            recent_capacity: 1000,
            write_retry: RetryPolicy::new(3, Duration::from_millis(200)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
}

#[derive(Debug, Clone)]
struct RecentEntry {
    record: TradeRecord,
    expires_at: DateTime<Utc>,
}

/// Fixed-capacity ring, oldest evicted first.
///
/// Every pushed record gets a monotonically increasing sequence number;
/// `head_seq` is the sequence of the front entry, so a record's slot is
/// `seq - head_seq` and lookups by id never scan.
struct RecentTrades {
    capacity: usize,
    entries: VecDeque<RecentEntry>,
    positions: HashMap<String, u64>,
    head_seq: u64,
}

impl RecentTrades {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
            head_seq: 0,
        }
    }

    fn push(&mut self, record: TradeRecord, expires_at: DateTime<Utc>) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.positions.remove(&evicted.record.trade_id);
            }
            self.head_seq += 1;
        }
        let seq = self.head_seq + self.entries.len() as u64;
        self.positions.insert(record.trade_id.clone(), seq);
        self.entries.push_back(RecentEntry { record, expires_at });
    }

    fn get_mut(&mut self, trade_id: &str) -> Option<&mut TradeRecord> {
        let seq = *self.positions.get(trade_id)?;
        let slot = seq.checked_sub(self.head_seq)? as usize;
        self.entries.get_mut(slot).map(|entry| &mut entry.record)
    }

    /// Newest first
    fn latest(&self, limit: usize, now: DateTime<Utc>) -> Vec<TradeRecord> {
        self.entries
            .iter()
            .rev()
            .filter(|entry| entry.expires_at > now)
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct TradeLedger {
    store: Arc<dyn LedgerStore>,
    config: TradeLedgerConfig,
    recent: Mutex<RecentTrades>,
    summaries: Mutex<HashMap<String, UserSummary>>,
    /// Serializes read-modify-write on one record
    record_locks: KeyedLocks,
    /// Orders summary saves per user so the newest snapshot lands last
    summary_locks: KeyedLocks,
}

impl TradeLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: TradeLedgerConfig) -> Self {
        let recent = RecentTrades::new(config.recent_capacity);
        Self {
            store,
            config,
            recent: Mutex::new(recent),
            summaries: Mutex::new(HashMap::new()),
            record_locks: KeyedLocks::default(),
            summary_locks: KeyedLocks::default(),
        }
    }

    /// Ledger rebuilt from what the store still holds.
    pub async fn open(
        store: Arc<dyn LedgerStore>,
        config: TradeLedgerConfig,
    ) -> Result<Self, LedgerError> {
        let ledger = Self::new(store, config);
        let now = Utc::now();

        let latest = ledger
            .retrying("load latest trades", || {
                ledger.store.latest_trades(ledger.config.recent_capacity, now)
            })
            .await?;
        let restored = latest.len();
        {
            let mut recent = ledger.recent.lock().await;
            for stored in latest {
                recent.push(stored.record, stored.expires_at);
            }
        }

        let summaries = ledger
            .retrying("load summaries", || ledger.store.load_summaries())
            .await?;
        let users = summaries.len();
        {
            let mut map = ledger.summaries.lock().await;
            for summary in summaries {
                map.insert(summary.user_id.clone(), summary);
            }
        }

        info!(
            "Trade ledger opened: {} recent trades, {} user summaries",
            restored, users
        );
        Ok(ledger)
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    /// Persist a new trade and return its id.
    pub async fn create(&self, trade: NewTrade) -> Result<String, LedgerError> {
        let trade_id = Uuid::new_v4().to_string();
        let record = trade.into_record(trade_id.clone());
        let expires_at = Utc::now() + self.config.retention;

        self.retrying("insert trade", || self.store.insert_trade(&record, expires_at))
            .await?;

        self.recent.lock().await.push(record.clone(), expires_at);
        self.update_summary(&record.user_id, |summary| summary.record_created(&record))
            .await;

        info!(
            "Trade {} recorded: {} {} {} {} @ {} ({})",
            trade_id, record.user_id, record.side, record.amount, record.symbol, record.price,
            record.status
        );
        Ok(trade_id)
    }

    /// Overwrite the outcome of a trade. Values replace, they never accumulate.
    pub async fn update_pnl(
        &self,
        trade_id: &str,
        pnl: f64,
        status: TradeStatus,
    ) -> Result<UpdateOutcome, LedgerError> {
        let _guard = self.record_locks.lock(trade_id).await;
        let now = Utc::now();

        let previous = match self
            .retrying("get trade", || self.store.get_trade(trade_id, now))
            .await?
        {
            Some(record) => record,
            None => {
                warn!("PNL update for unknown or expired trade {}", trade_id);
                return Ok(UpdateOutcome::NotFound);
            }
        };

        let updated = self
            .retrying("update trade outcome", || {
                self.store.update_trade_outcome(trade_id, pnl, status, now)
            })
            .await?;
        if !updated {
            warn!("Trade {} expired before its PNL update", trade_id);
            return Ok(UpdateOutcome::NotFound);
        }

        if let Some(cached) = self.recent.lock().await.get_mut(trade_id) {
            cached.pnl = pnl;
            cached.status = status;
        }

        self.update_summary(&previous.user_id, |summary| {
            summary.record_outcome(&previous, pnl, status)
        })
        .await;

        debug!("Trade {} updated: pnl={:.4} status={}", trade_id, pnl, status);
        Ok(UpdateOutcome::Updated)
    }

    pub async fn get(&self, trade_id: &str) -> Result<Option<TradeRecord>, LedgerError> {
        let now = Utc::now();
        self.retrying("get trade", || self.store.get_trade(trade_id, now))
            .await
    }

    pub async fn get_all(&self) -> Result<Vec<TradeRecord>, LedgerError> {
        self.list(TradeFilter::All).await
    }

    /// Up to `limit` most recent trades, newest first.
    pub async fn get_recent(&self, limit: usize) -> Vec<TradeRecord> {
        self.recent.lock().await.latest(limit, Utc::now())
    }

    pub async fn get_by_symbol(&self, symbol: &str) -> Result<Vec<TradeRecord>, LedgerError> {
        self.list(TradeFilter::Symbol(symbol.to_string())).await
    }

    pub async fn get_by_user(&self, user_id: &str) -> Result<Vec<TradeRecord>, LedgerError> {
        self.list(TradeFilter::User(user_id.to_string())).await
    }

    pub async fn summary(&self, user_id: &str) -> Option<UserSummary> {
        self.summaries.lock().await.get(user_id).cloned()
    }

    /// Share of winning trades among the user's last `last_n` completed
    /// opening trades. `None` when there is nothing to judge from.
    pub async fn win_rate(&self, user_id: &str, last_n: usize) -> Option<f64> {
        let trades = match self.get_by_user(user_id).await {
            Ok(trades) => trades,
            Err(e) => {
                warn!("Win rate for {} unavailable: {}", user_id, e);
                return None;
            }
        };

        let completed: Vec<&TradeRecord> = trades
            .iter()
            .rev()
            .filter(|t| t.is_root() && t.status == TradeStatus::Completed)
            .take(last_n)
            .collect();
        if completed.is_empty() {
            return None;
        }

        let wins = completed.iter().filter(|t| t.pnl > 0.0).count();
        Some(wins as f64 / completed.len() as f64)
    }

    /// Drop expired records from the store; summaries are unaffected.
    pub async fn purge_expired(&self) -> Result<u64, LedgerError> {
        let now = Utc::now();
        let purged = self
            .retrying("purge expired trades", || self.store.purge_expired(now))
            .await?;
        if purged > 0 {
            info!("Purged {} expired trades", purged);
        }
        Ok(purged)
    }

    pub async fn recent_len(&self) -> usize {
        self.recent.lock().await.len()
    }

    async fn list(&self, filter: TradeFilter) -> Result<Vec<TradeRecord>, LedgerError> {
        let now = Utc::now();
        self.retrying("list trades", || self.store.list_trades(&filter, now))
            .await
    }

    async fn update_summary<F>(&self, user_id: &str, apply: F)
    where
        F: FnOnce(&mut UserSummary),
    {
        let _guard = self.summary_locks.lock(user_id).await;
        let snapshot = {
            let mut summaries = self.summaries.lock().await;
            let summary = summaries
                .entry(user_id.to_string())
                .or_insert_with(|| UserSummary::new(user_id));
            apply(summary);
            summary.clone()
        };

        if let Err(e) = self
            .retrying("save summary", || self.store.save_summary(&snapshot))
            .await
        {
            error!("Summary for {} kept in memory only: {}", user_id, e);
        }
    }

    /// Backend failures are retried; bad payloads are not.
    async fn retrying<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        attempt_if(
            operation,
            &self.config.write_retry,
            |e: &StoreError| matches!(e, StoreError::Backend(_)),
            f,
        )
        .await
        .map_err(|e| {
            error!("Ledger {} failed: {}", operation, e);
            LedgerError::from(e)
        })
    }
}
