use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domain::{
    Actor, BalanceSnapshot, Direction, EntryId, EntryStatus, EntryType, GroupId, LedgerEntry,
    Money, RideHold, RideRequestId, User, UserId, Wallet, WalletId, WalletKind,
};

use super::MIGRATION_001_INITIAL;

/// A ledger transaction. Dropping it without `commit` rolls everything back.
pub type LedgerTx = Transaction<'static, Sqlite>;

const WALLET_COLUMNS: &str = "id, user_id, kind, currency, is_active, total_topped_up, total_spent, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, sequence, group_id, entry_type, direction, actor_kind, actor_user_id, wallet_id, amount, currency, status, psp_ref, idempotency_key, before_available, after_available, before_pending, after_pending, note, created_at";

/// Statistics for ledger integrity verification.
#[derive(Debug, Clone)]
pub struct IntegrityStats {
    pub wallet_count: i64,
    pub entry_count: i64,
    pub has_sequence_gaps: bool,
    pub incomplete_snapshots: i64,
    pub pending_top_ups: i64,
}

/// A settlement group whose rider debit does not match its credits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupImbalance {
    pub group_id: GroupId,
    pub debited: Money,
    pub credited: Money,
}

/// Returns true if the error was caused by a unique constraint.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .is_some_and(|e| e.is_unique_violation())
}

/// Repository for persisting and querying wallets and ledger entries.
///
/// Methods that take a `&mut SqliteConnection` can run either on a pooled
/// connection or inside a [`LedgerTx`], which is how services group several
/// writes into one atomic operation.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database.
    /// Pass `?mode=rwc` in the URL to create the file if it doesn't exist.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    /// Borrow a connection for reads outside a transaction.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .context("Failed to acquire database connection")
    }

    /// Begin a transaction that owns the database write lock from its first statement.
    pub async fn begin_write(&self) -> Result<LedgerTx> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        // SQLite upgrades a read snapshot to a write lock only if nobody committed in
        // between, so the lock is taken before anything is read.
        sqlx::query("UPDATE sequence_counter SET value = value WHERE name = 'ledger_sequence'")
            .execute(&mut *tx)
            .await
            .context("Failed to acquire ledger write lock")?;

        Ok(tx)
    }

    // ========================
    // User operations
    // ========================

    /// Save a new user.
    pub async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, display_name, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;
        Ok(())
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, display_name, created_at FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    /// Get a user by email.
    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row =
            sqlx::query("SELECT id, email, display_name, created_at FROM users WHERE email = ?")
                .bind(email)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch user by email")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    /// List all users.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let rows =
            sqlx::query("SELECT id, email, display_name, created_at FROM users ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list users")?;

        rows.iter().map(Self::row_to_user).collect()
    }

    fn row_to_user(row: &SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        let created_at_str: String = row.get("created_at");

        Ok(User {
            id: Uuid::parse_str(&id_str).context("Invalid user ID")?,
            email: row.get("email"),
            display_name: row.get("display_name"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    // ========================
    // Wallet operations
    // ========================

    /// Save a new wallet.
    pub async fn insert_wallet(&self, conn: &mut SqliteConnection, wallet: &Wallet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallets (id, user_id, kind, currency, is_active, total_topped_up, total_spent, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(wallet.id.to_string())
        .bind(wallet.user_id.map(|id| id.to_string()))
        .bind(wallet.kind.as_str())
        .bind(&wallet.currency)
        .bind(wallet.is_active)
        .bind(wallet.total_topped_up)
        .bind(wallet.total_spent)
        .bind(wallet.created_at.to_rfc3339())
        .bind(wallet.updated_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save wallet")?;
        Ok(())
    }

    /// Get a wallet by ID.
    pub async fn get_wallet(&self, conn: &mut SqliteConnection, id: WalletId) -> Result<Option<Wallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch wallet")?;

        row.as_ref().map(Self::row_to_wallet).transpose()
    }

    /// Get the wallet owned by a user.
    pub async fn get_wallet_by_user(
        &self,
        conn: &mut SqliteConnection,
        user_id: UserId,
    ) -> Result<Option<Wallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE user_id = ?");
        let row = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch wallet by user")?;

        row.as_ref().map(Self::row_to_wallet).transpose()
    }

    /// Get the platform wallet, if it has been created.
    pub async fn get_system_wallet(&self, conn: &mut SqliteConnection) -> Result<Option<Wallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE kind = 'SYSTEM'");
        let row = sqlx::query(&sql)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch system wallet")?;

        row.as_ref().map(Self::row_to_wallet).transpose()
    }

    /// List all wallets, oldest first.
    pub async fn list_wallets(&self, conn: &mut SqliteConnection) -> Result<Vec<Wallet>> {
        let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list wallets")?;

        rows.iter().map(Self::row_to_wallet).collect()
    }

    /// Freeze or unfreeze a wallet. Returns false if the wallet doesn't exist.
    pub async fn set_wallet_active(
        &self,
        conn: &mut SqliteConnection,
        id: WalletId,
        active: bool,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE wallets SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to update wallet activation")?;
        Ok(result.rows_affected() > 0)
    }

    /// Take the write lock on a wallet row for the rest of the transaction.
    /// Returns false if the wallet doesn't exist.
    pub async fn lock_wallet(&self, conn: &mut SqliteConnection, id: WalletId) -> Result<bool> {
        let result = sqlx::query("UPDATE wallets SET lock_version = lock_version + 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *conn)
            .await
            .context("Failed to lock wallet")?;
        Ok(result.rows_affected() > 0)
    }

    /// Add to the informational reporting aggregates of a wallet.
    pub async fn add_wallet_totals(
        &self,
        conn: &mut SqliteConnection,
        id: WalletId,
        topped_up: Money,
        spent: Money,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE wallets
            SET total_topped_up = total_topped_up + ?, total_spent = total_spent + ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(topped_up)
        .bind(spent)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *conn)
        .await
        .context("Failed to update wallet totals")?;
        Ok(())
    }

    fn row_to_wallet(row: &SqliteRow) -> Result<Wallet> {
        let id_str: String = row.get("id");
        let user_id_str: Option<String> = row.get("user_id");
        let kind_str: String = row.get("kind");
        let created_at_str: String = row.get("created_at");
        let updated_at_str: String = row.get("updated_at");

        Ok(Wallet {
            id: Uuid::parse_str(&id_str).context("Invalid wallet ID")?,
            user_id: user_id_str
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid wallet owner ID")?,
            kind: WalletKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid wallet kind: {}", kind_str))?,
            currency: row.get("currency"),
            is_active: row.get::<i32, _>("is_active") != 0,
            total_topped_up: row.get("total_topped_up"),
            total_spent: row.get("total_spent"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
            updated_at: parse_timestamp(&updated_at_str).context("Invalid updated_at timestamp")?,
        })
    }

    // ========================
    // Ledger entry operations
    // ========================

    /// Append an entry to the ledger.
    /// Automatically assigns the next sequence number.
    pub async fn insert_entry(&self, conn: &mut SqliteConnection, entry: &mut LedgerEntry) -> Result<()> {
        entry.sequence = self.next_sequence(conn).await?;
        let snapshot = entry.snapshot;

        sqlx::query(
            r#"
            INSERT INTO ledger_entries (id, sequence, group_id, entry_type, direction, actor_kind, actor_user_id, wallet_id, amount, currency, status, psp_ref, idempotency_key, before_available, after_available, before_pending, after_pending, note, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.sequence)
        .bind(entry.group_id.to_string())
        .bind(entry.entry_type.as_str())
        .bind(entry.direction.as_str())
        .bind(entry.actor.kind_str())
        .bind(entry.actor.user_id().map(|id| id.to_string()))
        .bind(entry.wallet_id.to_string())
        .bind(entry.amount)
        .bind(&entry.currency)
        .bind(entry.status.as_str())
        .bind(&entry.psp_ref)
        .bind(&entry.idempotency_key)
        .bind(snapshot.map(|s| s.before_available))
        .bind(snapshot.map(|s| s.after_available))
        .bind(snapshot.map(|s| s.before_pending))
        .bind(snapshot.map(|s| s.after_pending))
        .bind(&entry.note)
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save ledger entry")?;

        Ok(())
    }

    /// Get the next sequence number and increment the counter.
    async fn next_sequence(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'ledger_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    /// Move an entry between statuses if it is still in `from`.
    /// Returns false when the entry was not in `from` any more.
    pub async fn update_entry_status(
        &self,
        conn: &mut SqliteConnection,
        id: EntryId,
        from: EntryStatus,
        to: EntryStatus,
        note: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_entries
            SET status = ?, note = COALESCE(?, note)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to.as_str())
        .bind(note)
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&mut *conn)
        .await
        .context("Failed to update entry status")?;
        Ok(result.rows_affected() > 0)
    }

    /// Get an entry by ID.
    pub async fn get_entry(&self, conn: &mut SqliteConnection, id: EntryId) -> Result<Option<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch ledger entry")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Find the entry created with an idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE idempotency_key = ?");
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch entry by idempotency key")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Find a still-pending entry carrying a payment-gateway reference.
    pub async fn find_pending_by_psp_ref(
        &self,
        conn: &mut SqliteConnection,
        psp_ref: &str,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE psp_ref = ? AND status = 'PENDING' ORDER BY sequence LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(psp_ref)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch entry by psp reference")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Get the HOLD_CREATE entry of a group.
    pub async fn find_hold(&self, conn: &mut SqliteConnection, group_id: GroupId) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE group_id = ? AND entry_type = 'HOLD_CREATE' AND status = 'SUCCESS'"
        );
        let row = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch hold")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// Get the entry that resolved a group's hold, if any.
    pub async fn find_resolution(
        &self,
        conn: &mut SqliteConnection,
        group_id: GroupId,
    ) -> Result<Option<LedgerEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS} FROM ledger_entries
            WHERE group_id = ?
              AND (entry_type = 'HOLD_RELEASE' OR (entry_type = 'CAPTURE_FARE' AND direction = 'OUT'))
            "#
        );
        let row = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch hold resolution")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    /// List all entries, ordered by sequence number.
    pub async fn list_entries(&self, conn: &mut SqliteConnection) -> Result<Vec<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries ORDER BY sequence");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list ledger entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// List entries touching a wallet.
    pub async fn list_entries_for_wallet(
        &self,
        conn: &mut SqliteConnection,
        wallet_id: WalletId,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE wallet_id = ? ORDER BY sequence");
        let rows = sqlx::query(&sql)
            .bind(wallet_id.to_string())
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list entries for wallet")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// List the entries of a group in write order.
    pub async fn list_entries_for_group(
        &self,
        conn: &mut SqliteConnection,
        group_id: GroupId,
    ) -> Result<Vec<LedgerEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE group_id = ? ORDER BY sequence");
        let rows = sqlx::query(&sql)
            .bind(group_id.to_string())
            .fetch_all(&mut *conn)
            .await
            .context("Failed to list entries for group")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    // ========================
    // Balance aggregation
    // ========================

    /// Compute the available balance of a wallet using SQL aggregation.
    /// Mirrors `domain::compute_balance`.
    pub async fn sum_available(&self, conn: &mut SqliteConnection, wallet_id: WalletId) -> Result<Money> {
        let wallet_id_str = wallet_id.to_string();

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE
                    WHEN e.entry_type = 'TOPUP' THEN e.amount
                    WHEN e.entry_type = 'HOLD_CREATE' THEN -e.amount
                    WHEN e.entry_type = 'HOLD_RELEASE' THEN e.amount
                    WHEN e.entry_type = 'CAPTURE_FARE' AND e.direction = 'IN' THEN e.amount
                    WHEN e.entry_type = 'CAPTURE_FARE' AND e.direction = 'OUT' THEN -e.amount
                    WHEN e.entry_type = 'PAYOUT' THEN -e.amount
                    ELSE 0
                END), 0)
                +
                COALESCE((
                    SELECT SUM(h.amount)
                    FROM ledger_entries h
                    WHERE h.wallet_id = ? AND h.entry_type = 'HOLD_CREATE' AND h.status = 'SUCCESS'
                      AND EXISTS (
                          SELECT 1 FROM ledger_entries c
                          WHERE c.group_id = h.group_id AND c.wallet_id = h.wallet_id
                            AND c.entry_type = 'CAPTURE_FARE' AND c.direction = 'OUT' AND c.status = 'SUCCESS'
                      )
                ), 0) AS available
            FROM ledger_entries e
            WHERE e.wallet_id = ? AND e.status = 'SUCCESS'
            "#,
        )
        .bind(&wallet_id_str)
        .bind(&wallet_id_str)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to compute available balance")?;

        Ok(row.get("available"))
    }

    /// Sum the holds of a wallet that are still open.
    pub async fn sum_pending(&self, conn: &mut SqliteConnection, wallet_id: WalletId) -> Result<Money> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(h.amount), 0) AS pending
            FROM ledger_entries h
            WHERE h.wallet_id = ? AND h.entry_type = 'HOLD_CREATE' AND h.status = 'SUCCESS'
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries r
                  WHERE r.group_id = h.group_id AND r.wallet_id = h.wallet_id AND r.status = 'SUCCESS'
                    AND (r.entry_type = 'HOLD_RELEASE' OR (r.entry_type = 'CAPTURE_FARE' AND r.direction = 'OUT'))
              )
            "#,
        )
        .bind(wallet_id.to_string())
        .fetch_one(&mut *conn)
        .await
        .context("Failed to compute pending balance")?;

        Ok(row.get("pending"))
    }

    // ========================
    // Ride hold index
    // ========================

    /// Record which group holds a ride request's funds.
    pub async fn insert_ride_hold(&self, conn: &mut SqliteConnection, hold: &RideHold) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ride_holds (ride_request_id, group_id, rider_id, wallet_id, amount, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(hold.ride_request_id.to_string())
        .bind(hold.group_id.to_string())
        .bind(hold.rider_id.to_string())
        .bind(hold.wallet_id.to_string())
        .bind(hold.amount)
        .bind(hold.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await
        .context("Failed to save ride hold")?;
        Ok(())
    }

    /// Get the hold index row of a ride request.
    pub async fn get_ride_hold(
        &self,
        conn: &mut SqliteConnection,
        ride_request_id: RideRequestId,
    ) -> Result<Option<RideHold>> {
        let row = sqlx::query(
            r#"
            SELECT ride_request_id, group_id, rider_id, wallet_id, amount, created_at
            FROM ride_holds
            WHERE ride_request_id = ?
            "#,
        )
        .bind(ride_request_id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to fetch ride hold")?;

        row.as_ref().map(Self::row_to_ride_hold).transpose()
    }

    fn row_to_ride_hold(row: &SqliteRow) -> Result<RideHold> {
        let ride_str: String = row.get("ride_request_id");
        let group_str: String = row.get("group_id");
        let rider_str: String = row.get("rider_id");
        let wallet_str: String = row.get("wallet_id");
        let created_at_str: String = row.get("created_at");

        Ok(RideHold {
            ride_request_id: Uuid::parse_str(&ride_str).context("Invalid ride request ID")?,
            group_id: Uuid::parse_str(&group_str).context("Invalid group ID")?,
            rider_id: Uuid::parse_str(&rider_str).context("Invalid rider ID")?,
            wallet_id: Uuid::parse_str(&wallet_str).context("Invalid wallet ID")?,
            amount: row.get("amount"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    // ========================
    // Integrity checks
    // ========================

    /// Get statistics for integrity checking.
    pub async fn get_integrity_stats(&self, conn: &mut SqliteConnection) -> Result<IntegrityStats> {
        let wallet_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM wallets")
            .fetch_one(&mut *conn)
            .await?
            .get("count");

        let entry_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM ledger_entries")
            .fetch_one(&mut *conn)
            .await?
            .get("count");

        let sequence_check = sqlx::query(
            r#"
            SELECT
                MIN(sequence) as min_seq,
                MAX(sequence) as max_seq,
                COUNT(*) as count
            FROM ledger_entries
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;

        let min_seq: Option<i64> = sequence_check.get("min_seq");
        let max_seq: Option<i64> = sequence_check.get("max_seq");
        let count: i64 = sequence_check.get("count");

        let has_sequence_gaps = match (min_seq, max_seq) {
            (Some(min), Some(max)) => (max - min + 1) != count,
            _ => false,
        };

        // Rows with some but not all snapshot columns
        let incomplete_snapshots: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM ledger_entries
            WHERE (before_available IS NULL) + (after_available IS NULL)
                + (before_pending IS NULL) + (after_pending IS NULL) NOT IN (0, 4)
            "#,
        )
        .fetch_one(&mut *conn)
        .await?
        .get("count");

        let pending_top_ups: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM ledger_entries WHERE entry_type = 'TOPUP' AND status = 'PENDING'",
        )
        .fetch_one(&mut *conn)
        .await?
        .get("count");

        Ok(IntegrityStats {
            wallet_count,
            entry_count,
            has_sequence_gaps,
            incomplete_snapshots,
            pending_top_ups,
        })
    }

    /// Settlement groups whose capture debit differs from their capture credits.
    pub async fn find_unbalanced_groups(&self, conn: &mut SqliteConnection) -> Result<Vec<GroupImbalance>> {
        let rows = sqlx::query(
            r#"
            SELECT
                group_id,
                COALESCE(SUM(CASE WHEN direction = 'OUT' THEN amount ELSE 0 END), 0) as debited,
                COALESCE(SUM(CASE WHEN direction = 'IN' THEN amount ELSE 0 END), 0) as credited
            FROM ledger_entries
            WHERE entry_type = 'CAPTURE_FARE' AND status = 'SUCCESS'
            GROUP BY group_id
            HAVING debited <> credited
            ORDER BY MIN(sequence)
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .context("Failed to find unbalanced groups")?;

        rows.iter()
            .map(|row| {
                let group_str: String = row.get("group_id");
                Ok(GroupImbalance {
                    group_id: Uuid::parse_str(&group_str).context("Invalid group ID")?,
                    debited: row.get("debited"),
                    credited: row.get("credited"),
                })
            })
            .collect()
    }

    /// Groups resolved without a hold to resolve.
    pub async fn find_orphan_resolutions(&self, conn: &mut SqliteConnection) -> Result<Vec<GroupId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT r.group_id
            FROM ledger_entries r
            WHERE (r.entry_type = 'HOLD_RELEASE' OR (r.entry_type = 'CAPTURE_FARE' AND r.direction = 'OUT'))
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries h
                  WHERE h.group_id = r.group_id AND h.entry_type = 'HOLD_CREATE'
              )
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .context("Failed to find orphan resolutions")?;

        rows.iter()
            .map(|row| {
                let group_str: String = row.get("group_id");
                Uuid::parse_str(&group_str).context("Invalid group ID")
            })
            .collect()
    }

    fn row_to_entry(row: &SqliteRow) -> Result<LedgerEntry> {
        let id_str: String = row.get("id");
        let group_str: String = row.get("group_id");
        let type_str: String = row.get("entry_type");
        let direction_str: String = row.get("direction");
        let actor_kind: String = row.get("actor_kind");
        let actor_user_str: Option<String> = row.get("actor_user_id");
        let wallet_str: String = row.get("wallet_id");
        let status_str: String = row.get("status");
        let created_at_str: String = row.get("created_at");

        let actor_user_id = actor_user_str
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .context("Invalid actor user ID")?;

        let snapshot = BalanceSnapshot::from_parts(
            row.get("before_available"),
            row.get("after_available"),
            row.get("before_pending"),
            row.get("after_pending"),
        )?;

        Ok(LedgerEntry {
            id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
            sequence: row.get("sequence"),
            group_id: Uuid::parse_str(&group_str).context("Invalid group ID")?,
            entry_type: EntryType::from_str(&type_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid entry type: {}", type_str))?,
            direction: Direction::from_str(&direction_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid direction: {}", direction_str))?,
            actor: Actor::from_parts(&actor_kind, actor_user_id)
                .ok_or_else(|| anyhow::anyhow!("Invalid actor: {}", actor_kind))?,
            wallet_id: Uuid::parse_str(&wallet_str).context("Invalid wallet ID")?,
            amount: row.get("amount"),
            currency: row.get("currency"),
            status: EntryStatus::from_str(&status_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid status: {}", status_str))?,
            psp_ref: row.get("psp_ref"),
            idempotency_key: row.get("idempotency_key"),
            snapshot,
            note: row.get("note"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
