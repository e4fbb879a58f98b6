use rust_decimal::Decimal;
use thiserror::Error;

/// Result alias for ledger operations.
pub(crate) type LedgerResult<T> = Result<T, LedgerError>;

/// Error type surfaced by the ledger engine.
#[derive(Debug, Error)]
pub(crate) enum LedgerError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("transaction {0} not found")]
    TransactionNotFound(i64),
    #[error("invalid transfer target: {0}")]
    InvalidTransferTarget(String),
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    #[error("timed out waiting for locks on accounts {0:?}")]
    LockTimeout(Vec<i64>),
    #[error("operation cancelled")]
    Cancelled,
    #[error("recalculation of account {account_id} touched {rows} rows (limit {limit})")]
    FanOutLimitExceeded {
        account_id: i64,
        rows: usize,
        limit: usize,
    },
    #[error("corrupt ledger data: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl LedgerError {
    /// Caller input was wrong; nothing was changed and retrying as-is will fail again.
    pub(crate) fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::AccountNotFound(_)
                | Self::TransactionNotFound(_)
                | Self::InvalidTransferTarget(_)
                | Self::InvalidAmount(_)
        )
    }

    /// Integrity failures the caller may retry once the contention clears.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            Self::LockTimeout(_) | Self::Cancelled => true,
            Self::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// HTTP-style status for the request layer.
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            Self::AccountNotFound(_) | Self::TransactionNotFound(_) => 404,
            Self::InvalidTransferTarget(_) | Self::InvalidAmount(_) => 400,
            Self::LockTimeout(_) => 503,
            Self::Cancelled => 499,
            Self::FanOutLimitExceeded { .. } => 422,
            Self::Corrupt(_) | Self::Storage(_) => 500,
        }
    }
}
