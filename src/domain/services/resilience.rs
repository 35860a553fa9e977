//! Retry-then-suspend building blocks shared by the gateway, the market
//! breaker and the ledger.
//!
//! - [`attempt`]: bounded retries with a fixed backoff
//! - [`with_timeout`]: turns a slow exchange call into a retryable failure
//! - [`SuspensionMap`]: time-based circuit breaker keyed by subject id
//! - [`KeyedLocks`]: per-key serialization of read-modify-write sequences

use crate::domain::errors::ExchangeError;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{error, warn};

/// Retry configuration for one kind of call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, first one included
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// Run `f` until it succeeds or the policy is exhausted; returns the last error.
pub async fn attempt<F, Fut, T, E>(operation: &str, policy: &RetryPolicy, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    attempt_if(operation, policy, |_| true, f).await
}

/// Like [`attempt`] but stops early on errors `retryable` rejects.
pub async fn attempt_if<F, Fut, T, E, R>(
    operation: &str,
    policy: &RetryPolicy,
    retryable: R,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let mut attempt_no = 1;
    loop {
        match f().await {
            Ok(value) => {
                if attempt_no > 1 {
                    warn!("{} recovered on attempt {}", operation, attempt_no);
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt_no >= policy.max_attempts || !retryable(&e) {
                    error!(
                        "{} failed after {} attempt(s): {}",
                        operation, attempt_no, e
                    );
                    return Err(e);
                }
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation, attempt_no, policy.max_attempts, e, policy.backoff
                );
                sleep(policy.backoff).await;
                attempt_no += 1;
            }
        }
    }
}

/// Bound an exchange call; elapsed time becomes `ExchangeError::Timeout`.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T, ExchangeError>
where
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout(limit)),
    }
}

/// Time-based suspensions keyed by subject (user id, symbol, ...).
///
/// There is no reset call: an entry stops counting once its deadline passes
/// and is dropped on the next lookup.
pub struct SuspensionMap {
    duration: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl SuspensionMap {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Suspend `key` for the configured duration and return the deadline.
    pub async fn suspend(&self, key: &str) -> Instant {
        self.suspend_for(key, self.duration).await
    }

    pub async fn suspend_for(&self, key: &str, duration: Duration) -> Instant {
        let until = Instant::now() + duration;
        self.entries.lock().await.insert(key.to_string(), until);
        until
    }

    /// Deadline of an active suspension, `None` once it has expired.
    pub async fn suspended_until(&self, key: &str) -> Option<Instant> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(until) if Instant::now() < *until => Some(*until),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn is_suspended(&self, key: &str) -> bool {
        self.suspended_until(key).await.is_some()
    }

    pub async fn clear(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

/// One async lock per key. Distinct keys never share a lock, so a slow
/// holder only delays callers for the same key.
///
/// Entries nobody holds or waits on are pruned on the next `lock` call.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.locks.lock().await.len()
    }
}
