use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Money, UserId};

pub type WalletId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletKind {
    /// Belongs to a rider or driver
    User,
    /// The platform wallet that collects commission
    System,
}

impl WalletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletKind::User => "USER",
            WalletKind::System => "SYSTEM",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "USER" => Some(WalletKind::User),
            "SYSTEM" => Some(WalletKind::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for WalletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A wallet carries identity, the activation flag and reporting aggregates.
/// It never stores a spendable balance: balances are always derived from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    /// Owning user; `None` only for the system wallet
    pub user_id: Option<UserId>,
    pub kind: WalletKind,
    pub currency: String,
    /// Frozen wallets reject new money movement
    pub is_active: bool,
    /// Informational: sum of completed top-ups
    pub total_topped_up: Money,
    /// Informational: sum of captured fares
    pub total_spent: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn for_user(user_id: UserId, currency: impl Into<String>) -> Self {
        Self::build(Some(user_id), WalletKind::User, currency.into())
    }

    pub fn system(currency: impl Into<String>) -> Self {
        Self::build(None, WalletKind::System, currency.into())
    }

    fn build(user_id: Option<UserId>, kind: WalletKind, currency: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            currency,
            is_active: true,
            total_topped_up: 0,
            total_spent: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_system(&self) -> bool {
        self.kind == WalletKind::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_kind_roundtrip() {
        for kind in [WalletKind::User, WalletKind::System] {
            assert_eq!(WalletKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(WalletKind::from_str("user"), None);
    }

    #[test]
    fn test_user_wallet_starts_active_and_empty() {
        let user_id = Uuid::new_v4();
        let wallet = Wallet::for_user(user_id, "VND");

        assert_eq!(wallet.user_id, Some(user_id));
        assert!(wallet.is_active);
        assert!(!wallet.is_system());
        assert_eq!(wallet.total_topped_up, 0);
        assert_eq!(wallet.total_spent, 0);
    }

    #[test]
    fn test_system_wallet_has_no_owner() {
        let wallet = Wallet::system("VND");
        assert!(wallet.is_system());
        assert_eq!(wallet.user_id, None);
    }
}
