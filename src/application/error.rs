use thiserror::Error;

use crate::domain::{
    EntryId, EntryStatus, EntryType, GroupId, IncompleteSnapshotError, Money, RideRequestId, UserId, WalletId,
};

/// How a caller should treat a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The referenced wallet, user, entry or hold does not exist
    NotFound,
    /// The request broke a balance or state rule; recoverable by the caller
    Validation,
    /// The request collides with a uniqueness rule
    Conflict,
    /// Infrastructure failure; the operation was rolled back and may be retried
    Unexpected,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Ledger entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Hold not found: {0}")]
    HoldNotFound(String),

    #[error("User already exists: {0}")]
    UserAlreadyExists(String),

    #[error("Wallet already exists for user {0}")]
    WalletAlreadyExists(UserId),

    #[error("Insufficient balance in wallet {wallet_id}: available {available}, required {required}")]
    InsufficientBalance {
        wallet_id: WalletId,
        available: Money,
        required: Money,
    },

    #[error("Wallet is inactive: {0}")]
    WalletInactive(WalletId),

    #[error("Hold {0} has already been released or captured")]
    AlreadyResolved(GroupId),

    #[error("Balance snapshot fields must be set together or not at all")]
    IncompleteSnapshot,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid commission rate: {0} basis points (must be between 0 and 10000)")]
    InvalidCommissionRate(u32),

    #[error("Settlement does not balance: rider pays {rider_pay}, driver gets {driver_payout}, commission {commission}")]
    UnbalancedSettlement {
        rider_pay: Money,
        driver_payout: Money,
        commission: Money,
    },

    #[error("Top-up entries can only be created as PENDING or SUCCESS, got {0}")]
    InvalidTopUpStatus(EntryStatus),

    #[error("Entry {entry_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        entry_id: EntryId,
        from: EntryStatus,
        to: EntryStatus,
    },

    #[error("A pending top-up already uses payment reference {0}")]
    DuplicatePspRef(String),

    #[error("Idempotency key {key} already belongs to a {entry_type} entry")]
    IdempotencyKeyReused { key: String, entry_type: EntryType },

    #[error("Ride request {0} already has a hold")]
    RideAlreadyHeld(RideRequestId),

    #[error("Group {0} already has a hold")]
    HoldAlreadyExists(GroupId),

    #[error("Database error: {0}")]
    Database(anyhow::Error),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::UserNotFound(_)
            | LedgerError::WalletNotFound(_)
            | LedgerError::EntryNotFound(_)
            | LedgerError::HoldNotFound(_) => ErrorKind::NotFound,

            LedgerError::InsufficientBalance { .. }
            | LedgerError::WalletInactive(_)
            | LedgerError::AlreadyResolved(_)
            | LedgerError::IncompleteSnapshot
            | LedgerError::InvalidAmount(_)
            | LedgerError::InvalidCommissionRate(_)
            | LedgerError::UnbalancedSettlement { .. }
            | LedgerError::InvalidTopUpStatus(_)
            | LedgerError::InvalidStateTransition { .. } => ErrorKind::Validation,

            LedgerError::UserAlreadyExists(_)
            | LedgerError::WalletAlreadyExists(_)
            | LedgerError::DuplicatePspRef(_)
            | LedgerError::IdempotencyKeyReused { .. }
            | LedgerError::RideAlreadyHeld(_)
            | LedgerError::HoldAlreadyExists(_) => ErrorKind::Conflict,

            LedgerError::Database(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Unexpected
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        if err.downcast_ref::<IncompleteSnapshotError>().is_some() {
            return LedgerError::IncompleteSnapshot;
        }
        LedgerError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            LedgerError::WalletNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            LedgerError::AlreadyResolved(Uuid::new_v4()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LedgerError::DuplicatePspRef("ORDER-1".into()).kind(),
            ErrorKind::Conflict
        );
        assert!(LedgerError::Database(anyhow::anyhow!("disk full")).is_retryable());
    }

    #[test]
    fn test_incomplete_snapshot_is_a_validation_error() {
        let err: anyhow::Error = Err::<(), _>(IncompleteSnapshotError)
            .context("Failed to decode entry")
            .unwrap_err();
        let err = LedgerError::from(err);
        assert!(matches!(err, LedgerError::IncompleteSnapshot));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
