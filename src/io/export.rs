use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::application::Engine;
use crate::domain::{LedgerEntry, Money, User, Wallet, WalletBalance, WalletId};

/// Derived balance of one wallet at export time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub wallet_id: WalletId,
    pub available: Money,
    pub pending: Money,
}

/// Database snapshot for full export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub users: Vec<User>,
    pub wallets: Vec<Wallet>,
    pub entries: Vec<LedgerEntry>,
    pub balances: Vec<BalanceRecord>,
}

/// Exporter for converting ledger data to various formats
pub struct Exporter<'a> {
    engine: &'a Engine,
}

impl<'a> Exporter<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Export ledger entries to CSV format, in sequence order
    pub async fn export_entries_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let entries = self.engine.wallets().list_all_entries().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record([
            "sequence",
            "id",
            "created_at",
            "group_id",
            "entry_type",
            "direction",
            "actor",
            "actor_user_id",
            "wallet_id",
            "amount",
            "currency",
            "status",
            "psp_ref",
            "idempotency_key",
            "before_available",
            "after_available",
            "before_pending",
            "after_pending",
            "note",
        ])?;

        let optional = |value: Option<i64>| value.map(|v| v.to_string()).unwrap_or_default();

        for entry in &entries {
            let snapshot = entry.snapshot;
            csv_writer.write_record([
                entry.sequence.to_string(),
                entry.id.to_string(),
                entry.created_at.to_rfc3339(),
                entry.group_id.to_string(),
                entry.entry_type.as_str().to_string(),
                entry.direction.as_str().to_string(),
                entry.actor.kind_str().to_string(),
                entry
                    .actor
                    .user_id()
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                entry.wallet_id.to_string(),
                entry.amount.to_string(),
                entry.currency.clone(),
                entry.status.as_str().to_string(),
                entry.psp_ref.clone().unwrap_or_default(),
                entry.idempotency_key.clone().unwrap_or_default(),
                optional(snapshot.map(|s| s.before_available)),
                optional(snapshot.map(|s| s.after_available)),
                optional(snapshot.map(|s| s.before_pending)),
                optional(snapshot.map(|s| s.after_pending)),
                entry.note.clone().unwrap_or_default(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(entries.len())
    }

    /// Export derived wallet balances to CSV format
    pub async fn export_balances_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let balances = self.collect_balances().await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["wallet_id", "available", "pending"])?;
        for balance in &balances {
            csv_writer.write_record([
                balance.wallet_id.to_string(),
                balance.available.to_string(),
                balance.pending.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(balances.len())
    }

    /// Export full database as JSON snapshot
    pub async fn export_full_json<W: Write>(&self, mut writer: W) -> Result<DatabaseSnapshot> {
        let users = self.engine.repository().list_users().await?;
        let wallets = self.engine.wallets().list_wallets().await?;
        let entries = self.engine.wallets().list_all_entries().await?;
        let balances = self.collect_balances().await?;

        let snapshot = DatabaseSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            users,
            wallets,
            entries,
            balances,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }

    async fn collect_balances(&self) -> Result<Vec<BalanceRecord>> {
        let mut records = Vec::new();
        for wallet in self.engine.wallets().list_wallets().await? {
            let WalletBalance { available, pending } =
                self.engine.balances().calculate_balance(wallet.id).await?;
            records.push(BalanceRecord {
                wallet_id: wallet.id,
                available,
                pending,
            });
        }
        Ok(records)
    }
}
