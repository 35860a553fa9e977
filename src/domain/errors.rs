use thiserror::Error;

/// Errors surfaced by an `ExchangeClient` implementation.
///
/// The engine only distinguishes three families: transient failures that are
/// retried, symbol/account level failures that end a position, and everything
/// else which is logged and skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Network and timeout failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::Timeout(_))
    }

    /// Delisted symbols and revoked credentials will not heal on retry.
    pub fn is_unrecoverable_for_symbol(&self) -> bool {
        matches!(
            self,
            ExchangeError::InvalidSymbol(_) | ExchangeError::Authentication(_)
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("Invalid user id: {0}")]
    InvalidUser(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),
}

/// Failure of the durable storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Storage could not be reached after all write attempts.
    #[error("Ledger storage unavailable: {0}")]
    Unavailable(String),

    #[error("Ledger serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for LedgerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Serialization(e) => LedgerError::Serialization(e.to_string()),
            other => LedgerError::Unavailable(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl EngineError {
    /// Only a dead ledger should bring the process down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Ledger(LedgerError::Unavailable(_)))
    }
}
