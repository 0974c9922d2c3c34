use std::sync::Arc;

use anyhow::Context;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::domain::{
    Actor, BalanceSnapshot, Direction, EntryId, EntryStatus, EntryType, GroupId, LedgerEntry,
    Money, UserId, Wallet, WalletId,
};
use crate::storage::{Repository, is_unique_violation};

use super::{BalanceCalculationService, LedgerError, UserRepository};

/// One credit leg of a fare capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureCredit {
    pub wallet_id: WalletId,
    pub amount: Money,
    pub actor: Actor,
}

/// The only component that writes ledger entries. Enforces idempotency,
/// balance sufficiency and wallet activity.
#[derive(Clone)]
pub struct WalletLedgerService {
    repo: Repository,
    balances: BalanceCalculationService,
    users: Arc<dyn UserRepository>,
    currency: String,
}

impl WalletLedgerService {
    pub fn new(
        repo: Repository,
        balances: BalanceCalculationService,
        users: Arc<dyn UserRepository>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            balances,
            users,
            currency: currency.into(),
        }
    }

    // ========================
    // Wallet lifecycle
    // ========================

    /// Create the wallet of an existing user.
    pub async fn create_wallet(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        if self.users.find_by_id(user_id).await?.is_none() {
            return Err(LedgerError::UserNotFound(user_id.to_string()));
        }

        let mut conn = self.repo.acquire().await?;
        if self.repo.get_wallet_by_user(&mut conn, user_id).await?.is_some() {
            return Err(LedgerError::WalletAlreadyExists(user_id));
        }

        let wallet = Wallet::for_user(user_id, self.currency.as_str());
        match self.repo.insert_wallet(&mut conn, &wallet).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::WalletAlreadyExists(user_id));
            }
            Err(err) => return Err(err.into()),
        }

        info!(user_id = %user_id, wallet_id = %wallet.id, "wallet created");
        Ok(wallet)
    }

    /// Get the platform wallet, creating it on first use.
    pub async fn ensure_system_wallet(&self) -> Result<Wallet, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        if let Some(wallet) = self.repo.get_system_wallet(&mut conn).await? {
            return Ok(wallet);
        }

        let wallet = Wallet::system(self.currency.as_str());
        match self.repo.insert_wallet(&mut conn, &wallet).await {
            Ok(()) => {
                info!(wallet_id = %wallet.id, "system wallet created");
                Ok(wallet)
            }
            // another instance created it first
            Err(err) if is_unique_violation(&err) => self
                .repo
                .get_system_wallet(&mut conn)
                .await?
                .ok_or_else(|| LedgerError::WalletNotFound("system".to_string())),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_wallet(&self, wallet_id: WalletId) -> Result<Wallet, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        self.repo
            .get_wallet(&mut conn, wallet_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))
    }

    pub async fn get_wallet_for_user(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        self.repo
            .get_wallet_by_user(&mut conn, user_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(format!("user {}", user_id)))
    }

    pub async fn list_wallets(&self) -> Result<Vec<Wallet>, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.list_wallets(&mut conn).await?)
    }

    /// Unfreeze a user's wallet.
    pub async fn activate_wallet(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        self.set_wallet_active(user_id, true).await
    }

    /// Freeze a user's wallet. Existing holds can still be released.
    pub async fn deactivate_wallet(&self, user_id: UserId) -> Result<Wallet, LedgerError> {
        self.set_wallet_active(user_id, false).await
    }

    async fn set_wallet_active(&self, user_id: UserId, active: bool) -> Result<Wallet, LedgerError> {
        let mut wallet = self.get_wallet_for_user(user_id).await?;
        let mut conn = self.repo.acquire().await?;
        self.repo
            .set_wallet_active(&mut conn, wallet.id, active)
            .await?;
        wallet.is_active = active;

        info!(wallet_id = %wallet.id, active, "wallet activation changed");
        Ok(wallet)
    }

    // ========================
    // Top-ups
    // ========================

    /// Record a top-up reported by the payment gateway.
    ///
    /// A repeated call with the same idempotency key returns the entry created by the
    /// first call, unchanged.
    pub async fn create_top_up_transaction(
        &self,
        user_id: UserId,
        amount: Money,
        psp_ref: &str,
        idempotency_key: &str,
        status: EntryStatus,
    ) -> Result<LedgerEntry, LedgerError> {
        if status == EntryStatus::Failed {
            return Err(LedgerError::InvalidTopUpStatus(status));
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(
                "Top-up amount must be positive".to_string(),
            ));
        }

        if let Some(existing) = self.find_by_idempotency_key(idempotency_key).await? {
            return replay(existing, EntryType::TopUp, idempotency_key);
        }

        let wallet = self.get_wallet_for_user(user_id).await?;
        if !wallet.is_active {
            return Err(LedgerError::WalletInactive(wallet.id));
        }

        let mut tx = self.repo.begin_write().await?;

        if let Some(existing) = self.repo.find_by_idempotency_key(&mut tx, idempotency_key).await? {
            return replay(existing, EntryType::TopUp, idempotency_key);
        }
        if self.repo.find_pending_by_psp_ref(&mut tx, psp_ref).await?.is_some() {
            warn!(psp_ref, "pending top-up already uses this payment reference");
            return Err(LedgerError::DuplicatePspRef(psp_ref.to_string()));
        }

        let mut entry = LedgerEntry::new(
            EntryType::TopUp,
            Direction::In,
            Actor::User(user_id),
            wallet.id,
            amount,
            wallet.currency.as_str(),
            status,
        )
        .with_psp_ref(psp_ref)
        .with_idempotency_key(idempotency_key);

        if status == EntryStatus::Success {
            self.repo.lock_wallet(&mut tx, wallet.id).await?;
            let before = self.balances.balance_in(&mut tx, wallet.id).await?;
            entry = entry.with_snapshot(BalanceSnapshot {
                before_available: before.available,
                after_available: before.available + amount,
                before_pending: before.pending,
                after_pending: before.pending,
            });
            self.repo
                .add_wallet_totals(&mut tx, wallet.id, amount, 0)
                .await?;
        }

        match self.repo.insert_entry(&mut tx, &mut entry).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                drop(tx);
                return match self.find_by_idempotency_key(idempotency_key).await? {
                    Some(existing) => replay(existing, EntryType::TopUp, idempotency_key),
                    None => Err(err.into()),
                };
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await.context("Failed to commit top-up")?;

        info!(
            entry_id = %entry.id,
            wallet_id = %wallet.id,
            amount,
            status = %entry.status,
            "top-up recorded"
        );
        Ok(entry)
    }

    /// Mark a pending top-up as paid. The new balance shows up through balance
    /// derivation; no balance field is touched.
    pub async fn complete_top_up_transaction(&self, entry_id: EntryId) -> Result<LedgerEntry, LedgerError> {
        self.finish_top_up(entry_id, EntryStatus::Success, None).await
    }

    /// Mark a pending top-up as failed. Failed entries never count toward a balance.
    pub async fn fail_top_up_transaction(
        &self,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        self.finish_top_up(entry_id, EntryStatus::Failed, Some(reason))
            .await
    }

    async fn finish_top_up(
        &self,
        entry_id: EntryId,
        to: EntryStatus,
        reason: Option<&str>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.repo.begin_write().await?;

        let mut entry = self
            .repo
            .get_entry(&mut tx, entry_id)
            .await?
            .ok_or(LedgerError::EntryNotFound(entry_id))?;

        let invalid = |from| LedgerError::InvalidStateTransition { entry_id, from, to };
        if entry.entry_type != EntryType::TopUp {
            return Err(invalid(entry.status));
        }
        entry
            .status
            .transition_to(to)
            .map_err(|e| invalid(e.from))?;

        let note = reason.map(|r| entry.note_with_failure(r));
        let updated = self
            .repo
            .update_entry_status(&mut tx, entry_id, EntryStatus::Pending, to, note.as_deref())
            .await?;
        if !updated {
            return Err(invalid(entry.status));
        }

        if to == EntryStatus::Success {
            self.repo
                .add_wallet_totals(&mut tx, entry.wallet_id, entry.amount, 0)
                .await?;
        }

        tx.commit().await.context("Failed to commit top-up status")?;

        entry.status = to;
        if note.is_some() {
            entry.note = note;
        }

        info!(entry_id = %entry_id, status = %to, "top-up finished");
        Ok(entry)
    }

    // ========================
    // Holds
    // ========================

    /// Reserve `amount` of a wallet's available balance under `group_id`.
    pub async fn hold_amount(
        &self,
        wallet_id: WalletId,
        amount: Money,
        group_id: GroupId,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.repo.begin_write().await?;
        let entry = self
            .hold_amount_in(&mut tx, wallet_id, amount, group_id, note)
            .await?;
        tx.commit().await.context("Failed to commit hold")?;
        Ok(entry)
    }

    /// The balance check and the insert happen under the wallet lock, so two
    /// concurrent holds can't both pass against the same balance.
    pub(crate) async fn hold_amount_in(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: WalletId,
        amount: Money,
        group_id: GroupId,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(
                "Hold amount must be positive".to_string(),
            ));
        }

        if !self.repo.lock_wallet(conn, wallet_id).await? {
            return Err(LedgerError::WalletNotFound(wallet_id.to_string()));
        }
        let wallet = self
            .repo
            .get_wallet(conn, wallet_id)
            .await?
            .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))?;
        if !wallet.is_active {
            return Err(LedgerError::WalletInactive(wallet_id));
        }

        let before = self.balances.balance_in(conn, wallet_id).await?;
        if amount > before.available {
            warn!(wallet_id = %wallet_id, available = before.available, amount, "hold rejected");
            return Err(LedgerError::InsufficientBalance {
                wallet_id,
                available: before.available,
                required: amount,
            });
        }

        let mut entry = LedgerEntry::new(
            EntryType::HoldCreate,
            Direction::Internal,
            owner_actor(&wallet),
            wallet_id,
            amount,
            wallet.currency.as_str(),
            EntryStatus::Success,
        )
        .with_group(group_id)
        .with_note(note)
        .with_snapshot(BalanceSnapshot {
            before_available: before.available,
            after_available: before.available - amount,
            before_pending: before.pending,
            after_pending: before.pending + amount,
        });

        match self.repo.insert_entry(conn, &mut entry).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::HoldAlreadyExists(group_id));
            }
            Err(err) => return Err(err.into()),
        }

        info!(wallet_id = %wallet_id, group_id = %group_id, amount, "hold created");
        Ok(entry)
    }

    /// Return a hold's full amount to the available balance.
    pub async fn release_hold(
        &self,
        group_id: GroupId,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.repo.begin_write().await?;
        let entry = self.release_hold_in(&mut tx, group_id, note).await?;
        tx.commit().await.context("Failed to commit hold release")?;
        Ok(entry)
    }

    pub(crate) async fn release_hold_in(
        &self,
        conn: &mut SqliteConnection,
        group_id: GroupId,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let hold = self
            .repo
            .find_hold(conn, group_id)
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(group_id.to_string()))?;

        self.repo.lock_wallet(conn, hold.wallet_id).await?;
        if self.repo.find_resolution(conn, group_id).await?.is_some() {
            return Err(LedgerError::AlreadyResolved(group_id));
        }

        let before = self.balances.balance_in(conn, hold.wallet_id).await?;
        let mut entry = LedgerEntry::new(
            EntryType::HoldRelease,
            Direction::Internal,
            hold.actor,
            hold.wallet_id,
            hold.amount,
            hold.currency.as_str(),
            EntryStatus::Success,
        )
        .with_group(group_id)
        .with_note(note)
        .with_snapshot(BalanceSnapshot {
            before_available: before.available,
            after_available: before.available + hold.amount,
            before_pending: before.pending,
            after_pending: before.pending - hold.amount,
        });

        match self.repo.insert_entry(conn, &mut entry).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::AlreadyResolved(group_id));
            }
            Err(err) => return Err(err.into()),
        }

        info!(wallet_id = %hold.wallet_id, group_id = %group_id, amount = hold.amount, "hold released");
        Ok(entry)
    }

    /// Close a hold by charging `rider_pay` to its wallet and crediting `credits`.
    ///
    /// The rider debit is written first so a failure between legs shows up as an
    /// unbalanced group. Any part of the hold above `rider_pay` returns to the
    /// rider's available balance; any shortfall must be covered by it.
    pub(crate) async fn capture_hold_in(
        &self,
        conn: &mut SqliteConnection,
        group_id: GroupId,
        rider_pay: Money,
        credits: &[CaptureCredit],
        note: Option<String>,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        if rider_pay < 0 || credits.iter().any(|c| c.amount < 0) {
            return Err(LedgerError::InvalidAmount(
                "Capture amounts must not be negative".to_string(),
            ));
        }
        let credited: Money = credits.iter().map(|c| c.amount).sum();
        if credited != rider_pay {
            return Err(LedgerError::InvalidAmount(format!(
                "Credits of {} do not match rider debit of {}",
                credited, rider_pay
            )));
        }

        let hold = self
            .repo
            .find_hold(conn, group_id)
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(group_id.to_string()))?;

        // fixed lock order across concurrent settlements
        let mut wallet_ids: Vec<WalletId> = std::iter::once(hold.wallet_id)
            .chain(credits.iter().map(|c| c.wallet_id))
            .collect();
        wallet_ids.sort();
        wallet_ids.dedup();
        let mut wallets = Vec::with_capacity(wallet_ids.len());
        for wallet_id in &wallet_ids {
            if !self.repo.lock_wallet(conn, *wallet_id).await? {
                return Err(LedgerError::WalletNotFound(wallet_id.to_string()));
            }
            let wallet = self
                .repo
                .get_wallet(conn, *wallet_id)
                .await?
                .ok_or_else(|| LedgerError::WalletNotFound(wallet_id.to_string()))?;
            wallets.push(wallet);
        }

        // a resolved hold reports as resolved whatever state the wallets are in now
        if self.repo.find_resolution(conn, group_id).await?.is_some() {
            return Err(LedgerError::AlreadyResolved(group_id));
        }
        if let Some(frozen) = wallets.iter().find(|w| !w.is_active) {
            return Err(LedgerError::WalletInactive(frozen.id));
        }

        let before = self.balances.balance_in(conn, hold.wallet_id).await?;
        let shortfall = rider_pay - hold.amount;
        if shortfall > before.available {
            warn!(group_id = %group_id, shortfall, available = before.available, "capture rejected");
            return Err(LedgerError::InsufficientBalance {
                wallet_id: hold.wallet_id,
                available: before.available,
                required: shortfall,
            });
        }

        let mut debit = LedgerEntry::new(
            EntryType::CaptureFare,
            Direction::Out,
            hold.actor,
            hold.wallet_id,
            rider_pay,
            hold.currency.as_str(),
            EntryStatus::Success,
        )
        .with_group(group_id)
        .with_note(note.clone())
        .with_snapshot(BalanceSnapshot {
            before_available: before.available,
            after_available: before.available - shortfall,
            before_pending: before.pending,
            after_pending: before.pending - hold.amount,
        });

        match self.repo.insert_entry(conn, &mut debit).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::AlreadyResolved(group_id));
            }
            Err(err) => return Err(err.into()),
        }
        self.repo
            .add_wallet_totals(conn, hold.wallet_id, 0, rider_pay)
            .await?;

        let mut entries = Vec::with_capacity(credits.len() + 1);
        entries.push(debit);

        for credit in credits {
            let before = self.balances.balance_in(conn, credit.wallet_id).await?;
            let mut entry = LedgerEntry::new(
                EntryType::CaptureFare,
                Direction::In,
                credit.actor,
                credit.wallet_id,
                credit.amount,
                hold.currency.as_str(),
                EntryStatus::Success,
            )
            .with_group(group_id)
            .with_note(note.clone())
            .with_snapshot(BalanceSnapshot {
                before_available: before.available,
                after_available: before.available + credit.amount,
                before_pending: before.pending,
                after_pending: before.pending,
            });
            self.repo.insert_entry(conn, &mut entry).await?;
            entries.push(entry);
        }

        info!(group_id = %group_id, rider_pay, legs = entries.len(), "hold captured");
        Ok(entries)
    }

    // ========================
    // Payouts
    // ========================

    /// Move money out of a wallet to the user's bank account.
    pub async fn record_payout(
        &self,
        user_id: UserId,
        amount: Money,
        psp_ref: &str,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(
                "Payout amount must be positive".to_string(),
            ));
        }

        if let Some(existing) = self.find_by_idempotency_key(idempotency_key).await? {
            return replay(existing, EntryType::Payout, idempotency_key);
        }

        let wallet = self.get_wallet_for_user(user_id).await?;
        if !wallet.is_active {
            return Err(LedgerError::WalletInactive(wallet.id));
        }

        let mut tx = self.repo.begin_write().await?;
        if let Some(existing) = self.repo.find_by_idempotency_key(&mut tx, idempotency_key).await? {
            return replay(existing, EntryType::Payout, idempotency_key);
        }

        self.repo.lock_wallet(&mut tx, wallet.id).await?;
        let before = self.balances.balance_in(&mut tx, wallet.id).await?;
        if amount > before.available {
            warn!(wallet_id = %wallet.id, available = before.available, amount, "payout rejected");
            return Err(LedgerError::InsufficientBalance {
                wallet_id: wallet.id,
                available: before.available,
                required: amount,
            });
        }

        let mut entry = LedgerEntry::new(
            EntryType::Payout,
            Direction::Out,
            Actor::User(user_id),
            wallet.id,
            amount,
            wallet.currency.as_str(),
            EntryStatus::Success,
        )
        .with_psp_ref(psp_ref)
        .with_idempotency_key(idempotency_key)
        .with_snapshot(BalanceSnapshot {
            before_available: before.available,
            after_available: before.available - amount,
            before_pending: before.pending,
            after_pending: before.pending,
        });

        self.repo.insert_entry(&mut tx, &mut entry).await?;
        tx.commit().await.context("Failed to commit payout")?;

        info!(entry_id = %entry.id, wallet_id = %wallet.id, amount, "payout recorded");
        Ok(entry)
    }

    // ========================
    // Lookups
    // ========================

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.find_by_idempotency_key(&mut conn, key).await?)
    }

    pub async fn get_entry(&self, entry_id: EntryId) -> Result<LedgerEntry, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        self.repo
            .get_entry(&mut conn, entry_id)
            .await?
            .ok_or(LedgerError::EntryNotFound(entry_id))
    }

    pub async fn list_entries(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.list_entries_for_wallet(&mut conn, wallet_id).await?)
    }

    pub async fn list_group(&self, group_id: GroupId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.list_entries_for_group(&mut conn, group_id).await?)
    }

    pub async fn list_all_entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        Ok(self.repo.list_entries(&mut conn).await?)
    }
}

/// Hand back the entry a key already created, as long as it was created by the same
/// kind of request.
fn replay(existing: LedgerEntry, expected: EntryType, key: &str) -> Result<LedgerEntry, LedgerError> {
    if existing.entry_type != expected {
        warn!(key, entry_id = %existing.id, entry_type = %existing.entry_type, "idempotency key reused");
        return Err(LedgerError::IdempotencyKeyReused {
            key: key.to_string(),
            entry_type: existing.entry_type,
        });
    }
    debug!(key, entry_id = %existing.id, entry_type = %expected, "request replayed");
    Ok(existing)
}

fn owner_actor(wallet: &Wallet) -> Actor {
    wallet.user_id.map(Actor::User).unwrap_or(Actor::System)
}
