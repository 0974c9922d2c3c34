use sqlx::SqliteConnection;

use crate::domain::{Money, WalletBalance, WalletId};
use crate::storage::Repository;

use super::LedgerError;

/// Derives wallet balances from the ledger. Never writes and never caches:
/// every call reads the current ledger state.
#[derive(Clone)]
pub struct BalanceCalculationService {
    repo: Repository,
}

impl BalanceCalculationService {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Spendable balance of a wallet. A wallet with no entries has zero.
    pub async fn calculate_available_balance(&self, wallet_id: WalletId) -> Result<Money, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.sum_available(&mut conn, wallet_id).await?)
    }

    /// Sum of the wallet's open holds.
    pub async fn calculate_pending_balance(&self, wallet_id: WalletId) -> Result<Money, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.sum_pending(&mut conn, wallet_id).await?)
    }

    /// Both balances, read from the same connection.
    pub async fn calculate_balance(&self, wallet_id: WalletId) -> Result<WalletBalance, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        self.balance_in(&mut conn, wallet_id).await
    }

    /// Balances as seen by an open transaction, used under a wallet lock.
    pub(crate) async fn balance_in(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: WalletId,
    ) -> Result<WalletBalance, LedgerError> {
        let available = self.repo.sum_available(conn, wallet_id).await?;
        let pending = self.repo.sum_pending(conn, wallet_id).await?;
        Ok(WalletBalance { available, pending })
    }
}
