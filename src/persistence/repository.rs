//! Database Repository
//!
//! SQLite implementation of [`LedgerStore`].

use super::models::{to_millis, TradeRow, UserBlobRow};
use super::DbPool;
use crate::domain::entities::risk_state::UserRiskState;
use crate::domain::entities::summary::UserSummary;
use crate::domain::entities::trade::{TradeRecord, TradeStatus};
use crate::domain::errors::StoreError;
use crate::domain::repositories::ledger_store::{LedgerStore, StoreResult, StoredTrade, TradeFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

fn backend(context: &str, e: sqlx::Error) -> StoreError {
    error!("{}: {}", context, e);
    StoreError::Backend(format!("{}: {}", context, e))
}

/// Ledger repository
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: DbPool,
}

impl SqliteLedgerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn save_blob(&self, table: &str, user_id: &str, payload: String) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (user_id, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id) DO UPDATE SET payload = excluded.payload,
                                               updated_at = excluded.updated_at
            "#,
            table
        ))
        .bind(user_id)
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| backend(&format!("Failed to save {} for {}", table, user_id), e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn insert_trade(
        &self,
        record: &TradeRecord,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_records (
                trade_id, user_id, symbol, side, amount, price, timestamp_ms,
                signals, signal_metrics, market_conditions, pnl, status,
                related_trade_id, source, strategy_tag, expires_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&record.trade_id)
        .bind(&record.user_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.amount)
        .bind(record.price)
        .bind(to_millis(record.timestamp))
        .bind(serde_json::to_string(&record.signals)?)
        .bind(serde_json::to_string(&record.signal_metrics)?)
        .bind(serde_json::to_string(&record.market_conditions)?)
        .bind(record.pnl)
        .bind(record.status.as_str())
        .bind(&record.related_trade_id)
        .bind(record.source.as_str())
        .bind(&record.strategy_tag)
        .bind(to_millis(expires_at))
        .execute(&self.pool)
        .await
        .map_err(|e| backend("Failed to insert trade", e))?;

        debug!("Stored trade {} for {}", record.trade_id, record.symbol);
        Ok(())
    }

    async fn update_trade_outcome(
        &self,
        trade_id: &str,
        pnl: f64,
        status: TradeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE trade_records
            SET pnl = ?1, status = ?2
            WHERE trade_id = ?3 AND expires_at_ms > ?4
            "#,
        )
        .bind(pnl)
        .bind(status.as_str())
        .bind(trade_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .map_err(|e| backend(&format!("Failed to update trade {}", trade_id), e))?
        .rows_affected();

        debug!("Updated trade {}: pnl={} status={}", trade_id, pnl, status);
        Ok(rows_affected > 0)
    }

    async fn get_trade(
        &self,
        trade_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TradeRecord>> {
        let row = sqlx::query_as::<_, TradeRow>(
            "SELECT * FROM trade_records WHERE trade_id = ?1 AND expires_at_ms > ?2",
        )
        .bind(trade_id)
        .bind(to_millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(&format!("Failed to get trade {}", trade_id), e))?;

        row.map(TradeRow::into_record).transpose()
    }

    async fn list_trades(
        &self,
        filter: &TradeFilter,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<TradeRecord>> {
        let now_ms = to_millis(now);
        let query = match filter {
            TradeFilter::All => sqlx::query_as::<_, TradeRow>(
                "SELECT * FROM trade_records WHERE expires_at_ms > ?1 ORDER BY seq ASC",
            )
            .bind(now_ms),
            TradeFilter::Symbol(symbol) => sqlx::query_as::<_, TradeRow>(
                "SELECT * FROM trade_records WHERE expires_at_ms > ?1 AND symbol = ?2 ORDER BY seq ASC",
            )
            .bind(now_ms)
            .bind(symbol.clone()),
            TradeFilter::User(user_id) => sqlx::query_as::<_, TradeRow>(
                "SELECT * FROM trade_records WHERE expires_at_ms > ?1 AND user_id = ?2 ORDER BY seq ASC",
            )
            .bind(now_ms)
            .bind(user_id.clone()),
        };

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(&format!("Failed to list trades ({:?})", filter), e))?;

        rows.into_iter().map(TradeRow::into_record).collect()
    }

    async fn latest_trades(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<StoredTrade>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"
            SELECT * FROM (
                SELECT * FROM trade_records WHERE expires_at_ms > ?1
                ORDER BY seq DESC LIMIT ?2
            ) ORDER BY seq ASC
            "#,
        )
        .bind(to_millis(now))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("Failed to load latest trades", e))?;

        rows.into_iter().map(TradeRow::into_stored).collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let purged = sqlx::query("DELETE FROM trade_records WHERE expires_at_ms <= ?1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await
            .map_err(|e| backend("Failed to purge expired trades", e))?
            .rows_affected();

        debug!("Purged {} expired trades", purged);
        Ok(purged)
    }

    async fn save_summary(&self, summary: &UserSummary) -> StoreResult<()> {
        let payload = serde_json::to_string(summary)?;
        self.save_blob("user_summaries", &summary.user_id, payload).await
    }

    async fn load_summaries(&self) -> StoreResult<Vec<UserSummary>> {
        let rows = sqlx::query_as::<_, UserBlobRow>("SELECT user_id, payload FROM user_summaries")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend("Failed to load summaries", e))?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_str(&row.payload).map_err(|e| StoreError::Corrupt {
                    id: row.user_id,
                    reason: format!("summary: {}", e),
                })
            })
            .collect()
    }

    async fn save_risk_state(&self, state: &UserRiskState) -> StoreResult<()> {
        let payload = serde_json::to_string(state)?;
        self.save_blob("user_risk_states", &state.user_id, payload).await
    }

    async fn load_risk_state(&self, user_id: &str) -> StoreResult<Option<UserRiskState>> {
        let row = sqlx::query_as::<_, UserBlobRow>(
            "SELECT user_id, payload FROM user_risk_states WHERE user_id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(&format!("Failed to load risk state for {}", user_id), e))?;

        match row {
            Some(row) => serde_json::from_str(&row.payload)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    id: row.user_id,
                    reason: format!("risk state: {}", e),
                }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::trade::NewTrade;
    use crate::persistence::{init_database, DatabaseConfig};
    use chrono::Duration;

    async fn store() -> SqliteLedgerStore {
        let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
        SqliteLedgerStore::new(pool)
    }

    fn record(id: &str, user: &str, symbol: &str) -> TradeRecord {
        NewTrade::new(user, symbol, OrderSide::Buy, 1.0, 100.0)
            .with_status(TradeStatus::Filled)
            .with_signals(serde_json::json!({"signal": "buy"}), serde_json::json!({"rsi": 30}))
            .into_record(id.to_string())
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = store().await;
        let now = Utc::now();
        let trade = record("t1", "u1", "BTC/USDT");
        store.insert_trade(&trade, now + Duration::days(7)).await.unwrap();

        let loaded = store.get_trade("t1", now).await.unwrap().unwrap();
        assert_eq!(loaded.trade_id, "t1");
        assert_eq!(loaded.signal_metrics["rsi"], 30);
        assert_eq!(to_millis(loaded.timestamp), to_millis(trade.timestamp));
    }

    #[tokio::test]
    async fn test_update_outcome() {
        let store = store().await;
        let now = Utc::now();
        store
            .insert_trade(&record("t1", "u1", "BTC/USDT"), now + Duration::days(7))
            .await
            .unwrap();

        assert!(store
            .update_trade_outcome("t1", 12.5, TradeStatus::Completed, now)
            .await
            .unwrap());
        assert!(!store
            .update_trade_outcome("missing", 1.0, TradeStatus::Completed, now)
            .await
            .unwrap());

        let loaded = store.get_trade("t1", now).await.unwrap().unwrap();
        assert_eq!(loaded.pnl, 12.5);
        assert_eq!(loaded.status, TradeStatus::Completed);
    }

    #[tokio::test]
    async fn test_expired_records_are_hidden_and_purged() {
        let store = store().await;
        let now = Utc::now();
        store
            .insert_trade(&record("old", "u1", "BTC/USDT"), now + Duration::seconds(1))
            .await
            .unwrap();
        store
            .insert_trade(&record("new", "u1", "BTC/USDT"), now + Duration::days(7))
            .await
            .unwrap();

        let later = now + Duration::seconds(2);
        assert!(store.get_trade("old", later).await.unwrap().is_none());
        assert!(!store
            .update_trade_outcome("old", 1.0, TradeStatus::Completed, later)
            .await
            .unwrap());
        assert_eq!(store.list_trades(&TradeFilter::All, later).await.unwrap().len(), 1);

        assert_eq!(store.purge_expired(later).await.unwrap(), 1);
        assert_eq!(store.purge_expired(later).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filters_and_latest() {
        let store = store().await;
        let now = Utc::now();
        let expiry = now + Duration::days(7);
        for (id, user, symbol) in [
            ("t1", "u1", "BTC/USDT"),
            ("t2", "u2", "ETH/USDT"),
            ("t3", "u1", "ETH/USDT"),
        ] {
            store.insert_trade(&record(id, user, symbol), expiry).await.unwrap();
        }

        let eth = store
            .list_trades(&TradeFilter::Symbol("ETH/USDT".into()), now)
            .await
            .unwrap();
        assert_eq!(eth.iter().map(|t| t.trade_id.as_str()).collect::<Vec<_>>(), ["t2", "t3"]);

        let u1 = store
            .list_trades(&TradeFilter::User("u1".into()), now)
            .await
            .unwrap();
        assert_eq!(u1.len(), 2);

        let latest = store.latest_trades(2, now).await.unwrap();
        let ids: Vec<_> = latest.iter().map(|t| t.record.trade_id.as_str()).collect();
        assert_eq!(ids, ["t2", "t3"]);
    }

    #[tokio::test]
    async fn test_summary_and_risk_state_blobs() {
        let store = store().await;

        let mut summary = UserSummary::new("u1");
        summary.trade_count = 3;
        store.save_summary(&summary).await.unwrap();
        summary.trade_count = 4;
        store.save_summary(&summary).await.unwrap();

        let summaries = store.load_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].trade_count, 4);

        let mut state = UserRiskState::new("u1", Utc::now());
        state.daily_limit = 900.0;
        store.save_risk_state(&state).await.unwrap();
        let loaded = store.load_risk_state("u1").await.unwrap().unwrap();
        assert_eq!(loaded.daily_limit, 900.0);
        assert!(store.load_risk_state("u2").await.unwrap().is_none());
    }
}
