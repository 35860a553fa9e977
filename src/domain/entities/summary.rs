//! Rolling per-user aggregate derived from ledger writes.
//!
//! Summaries outlive the trade records they were built from: records expire
//! from the store, the aggregate keeps their contribution.

use crate::domain::entities::trade::{TradeRecord, TradeStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Win,
    Loss,
}

fn outcome(status: TradeStatus, pnl: f64) -> Option<Outcome> {
    if status != TradeStatus::Completed {
        return None;
    }
    if pnl > 0.0 {
        Some(Outcome::Win)
    } else if pnl < 0.0 {
        Some(Outcome::Loss)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: String,
    pub trade_count: u64,
    pub total_pnl: f64,
    /// Sum of positive PNL contributions
    pub total_profit: f64,
    /// Sum of negative PNL contributions (stored as a positive number)
    pub total_loss: f64,
    pub win_count: u64,
    pub loss_count: u64,
    pub signal_counts: HashMap<String, u64>,
    pub pair_counts: HashMap<String, u64>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl UserSummary {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record_created(&mut self, record: &TradeRecord) {
        self.trade_count += 1;
        *self.signal_counts.entry(record.signal_label()).or_insert(0) += 1;
        *self.pair_counts.entry(record.symbol.clone()).or_insert(0) += 1;
        self.last_trade_at = Some(match self.last_trade_at {
            Some(last) if last > record.timestamp => last,
            _ => record.timestamp,
        });

        // PNL buckets follow lineage roots only so close legs never double count
        if record.is_root() {
            self.apply_pnl(0.0, record.pnl);
            self.apply_outcome(None, outcome(record.status, record.pnl));
        }
    }

    /// Replace the contribution of `previous` by the new `(pnl, status)`.
    ///
    /// Applying the same outcome twice leaves the summary unchanged.
    pub fn record_outcome(&mut self, previous: &TradeRecord, pnl: f64, status: TradeStatus) {
        if !previous.is_root() {
            return;
        }
        self.apply_pnl(previous.pnl, pnl);
        self.apply_outcome(
            outcome(previous.status, previous.pnl),
            outcome(status, pnl),
        );
    }

    pub fn win_rate(&self) -> Option<f64> {
        let decided = self.win_count + self.loss_count;
        if decided == 0 {
            None
        } else {
            Some(self.win_count as f64 / decided as f64)
        }
    }

    fn apply_pnl(&mut self, old: f64, new: f64) {
        self.total_pnl += new - old;
        if old > 0.0 {
            self.total_profit -= old;
        } else if old < 0.0 {
            self.total_loss -= old.abs();
        }
        if new > 0.0 {
            self.total_profit += new;
        } else if new < 0.0 {
            self.total_loss += new.abs();
        }
    }

    fn apply_outcome(&mut self, old: Option<Outcome>, new: Option<Outcome>) {
        match old {
            Some(Outcome::Win) => self.win_count = self.win_count.saturating_sub(1),
            Some(Outcome::Loss) => self.loss_count = self.loss_count.saturating_sub(1),
            None => {}
        }
        match new {
            Some(Outcome::Win) => self.win_count += 1,
            Some(Outcome::Loss) => self.loss_count += 1,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::entities::trade::NewTrade;
    use serde_json::json;

    fn opening(id: &str) -> TradeRecord {
        NewTrade::new("u1", "ETH/USDT", OrderSide::Buy, 1.0, 2000.0)
            .with_status(TradeStatus::Filled)
            .with_signals(json!({"signal": "buy"}), json!(null))
            .into_record(id.to_string())
    }

    #[test]
    fn test_created_updates_histograms() {
        let mut summary = UserSummary::new("u1");
        summary.record_created(&opening("a"));
        summary.record_created(&opening("b"));

        assert_eq!(summary.trade_count, 2);
        assert_eq!(summary.signal_counts["buy"], 2);
        assert_eq!(summary.pair_counts["ETH/USDT"], 2);
        assert_eq!(summary.total_pnl, 0.0);
    }

    #[test]
    fn test_outcome_overwrites_and_is_idempotent() {
        let mut summary = UserSummary::new("u1");
        let mut record = opening("a");
        summary.record_created(&record);

        summary.record_outcome(&record, 15.0, TradeStatus::PartiallyClosed);
        record.pnl = 15.0;
        record.status = TradeStatus::PartiallyClosed;
        assert_eq!(summary.total_pnl, 15.0);
        assert_eq!(summary.win_count, 0);

        summary.record_outcome(&record, -5.0, TradeStatus::Completed);
        record.pnl = -5.0;
        record.status = TradeStatus::Completed;
        assert_eq!(summary.total_pnl, -5.0);
        assert_eq!(summary.total_profit, 0.0);
        assert_eq!(summary.total_loss, 5.0);
        assert_eq!(summary.loss_count, 1);

        // same call again
        summary.record_outcome(&record, -5.0, TradeStatus::Completed);
        assert_eq!(summary.total_pnl, -5.0);
        assert_eq!(summary.loss_count, 1);
        assert_eq!(summary.win_rate(), Some(0.0));
    }

    #[test]
    fn test_close_legs_do_not_touch_pnl() {
        let mut summary = UserSummary::new("u1");
        let leg = NewTrade::new("u1", "ETH/USDT", OrderSide::Sell, 1.0, 2100.0)
            .with_pnl(100.0)
            .with_status(TradeStatus::Completed)
            .related_to("a")
            .into_record("b".into());
        summary.record_created(&leg);

        assert_eq!(summary.trade_count, 1);
        assert_eq!(summary.total_pnl, 0.0);
        assert_eq!(summary.win_count, 0);
    }
}
