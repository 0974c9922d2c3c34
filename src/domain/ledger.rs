use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{Direction, EntryStatus, EntryType, GroupId, LedgerEntry, Money, WalletId};

/// Derived balances of one wallet. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    /// Spendable right now
    pub available: Money,
    /// Reserved by open holds
    pub pending: Money,
}

impl WalletBalance {
    pub fn total(&self) -> Money {
        self.available + self.pending
    }
}

/// Compute the balances of a single wallet from ledger entries.
///
/// Only SUCCESS entries count. A hold moves money from available to pending until
/// its group is resolved. A release returns the full hold; a capture debit closes
/// the hold and charges the captured amount, so a captured group nets to
/// `-captured` on available whatever the hold amount was.
pub fn compute_balance(wallet_id: WalletId, entries: &[LedgerEntry]) -> WalletBalance {
    let settled: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.wallet_id == wallet_id && e.status == EntryStatus::Success)
        .collect();

    let resolved: HashSet<GroupId> = settled
        .iter()
        .filter(|e| e.is_hold_resolution())
        .map(|e| e.group_id)
        .collect();
    let captured: HashSet<GroupId> = settled
        .iter()
        .filter(|e| e.entry_type == EntryType::CaptureFare && e.direction == Direction::Out)
        .map(|e| e.group_id)
        .collect();

    settled
        .iter()
        .fold(WalletBalance::default(), |mut balance, entry| {
            match (entry.entry_type, entry.direction) {
                (EntryType::TopUp, _) => balance.available += entry.amount,
                (EntryType::HoldCreate, _) => {
                    // a captured hold is replaced by its capture debit
                    if !captured.contains(&entry.group_id) {
                        balance.available -= entry.amount;
                    }
                    if !resolved.contains(&entry.group_id) {
                        balance.pending += entry.amount;
                    }
                }
                (EntryType::HoldRelease, _) => balance.available += entry.amount,
                (EntryType::CaptureFare, Direction::In) => balance.available += entry.amount,
                (EntryType::CaptureFare, Direction::Out) => balance.available -= entry.amount,
                (EntryType::CaptureFare, Direction::Internal) => {}
                (EntryType::Payout, _) => balance.available -= entry.amount,
            }
            balance
        })
}

/// Money movement of one group, used to audit settlements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub held: Money,
    pub released: Money,
    /// Sum of CAPTURE_FARE OUT legs
    pub debited: Money,
    /// Sum of CAPTURE_FARE IN legs
    pub credited: Money,
    pub capture_legs: usize,
    pub resolutions: usize,
}

impl GroupSummary {
    pub fn is_settlement(&self) -> bool {
        self.capture_legs > 0
    }

    /// A settlement is balanced when the rider debit equals the credits.
    pub fn is_balanced(&self) -> bool {
        self.debited == self.credited
    }
}

/// Summarize the SUCCESS entries of one group.
pub fn summarize_group(group_id: GroupId, entries: &[LedgerEntry]) -> GroupSummary {
    let mut summary = GroupSummary {
        group_id,
        held: 0,
        released: 0,
        debited: 0,
        credited: 0,
        capture_legs: 0,
        resolutions: 0,
    };

    for entry in entries
        .iter()
        .filter(|e| e.group_id == group_id && e.status == EntryStatus::Success)
    {
        if entry.is_hold_resolution() {
            summary.resolutions += 1;
        }
        match (entry.entry_type, entry.direction) {
            (EntryType::HoldCreate, _) => summary.held += entry.amount,
            (EntryType::HoldRelease, _) => summary.released += entry.amount,
            (EntryType::CaptureFare, Direction::Out) => {
                summary.debited += entry.amount;
                summary.capture_legs += 1;
            }
            (EntryType::CaptureFare, Direction::In) => {
                summary.credited += entry.amount;
                summary.capture_legs += 1;
            }
            (EntryType::CaptureFare, Direction::Internal)
            | (EntryType::TopUp, _)
            | (EntryType::Payout, _) => {}
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::Actor;

    fn entry(
        wallet: WalletId,
        group: GroupId,
        entry_type: EntryType,
        direction: Direction,
        amount: Money,
    ) -> LedgerEntry {
        LedgerEntry::new(
            entry_type,
            direction,
            Actor::System,
            wallet,
            amount,
            "VND",
            EntryStatus::Success,
        )
        .with_group(group)
    }

    fn top_up(wallet: WalletId, amount: Money, status: EntryStatus) -> LedgerEntry {
        LedgerEntry {
            status,
            ..entry(wallet, Uuid::new_v4(), EntryType::TopUp, Direction::In, amount)
        }
    }

    #[test]
    fn test_compute_balance_empty() {
        let wallet = Uuid::new_v4();
        assert_eq!(compute_balance(wallet, &[]), WalletBalance::default());
    }

    #[test]
    fn test_only_successful_top_ups_count() {
        let wallet = Uuid::new_v4();
        let entries = vec![
            top_up(wallet, 500000, EntryStatus::Success),
            top_up(wallet, 200000, EntryStatus::Pending),
            top_up(wallet, 100000, EntryStatus::Failed),
        ];

        let balance = compute_balance(wallet, &entries);
        assert_eq!(balance.available, 500000);
        assert_eq!(balance.pending, 0);
    }

    #[test]
    fn test_hold_moves_available_to_pending() {
        let wallet = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let entries = vec![
            top_up(wallet, 500000, EntryStatus::Success),
            entry(wallet, g1, EntryType::HoldCreate, Direction::Internal, 100000),
        ];

        let balance = compute_balance(wallet, &entries);
        assert_eq!(balance.available, 400000);
        assert_eq!(balance.pending, 100000);
        assert_eq!(balance.total(), 500000);
    }

    #[test]
    fn test_release_restores_available() {
        let wallet = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let entries = vec![
            top_up(wallet, 500000, EntryStatus::Success),
            entry(wallet, g1, EntryType::HoldCreate, Direction::Internal, 100000),
            entry(wallet, g1, EntryType::HoldRelease, Direction::Internal, 100000),
        ];

        let balance = compute_balance(wallet, &entries);
        assert_eq!(balance.available, 500000);
        assert_eq!(balance.pending, 0);
    }

    #[test]
    fn test_capture_charges_captured_amount_only() {
        let rider = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let platform = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let entries = vec![
            top_up(rider, 500000, EntryStatus::Success),
            entry(rider, g1, EntryType::HoldCreate, Direction::Internal, 200000),
            entry(rider, g1, EntryType::CaptureFare, Direction::Out, 150000),
            entry(driver, g1, EntryType::CaptureFare, Direction::In, 120000),
            entry(platform, g1, EntryType::CaptureFare, Direction::In, 30000),
        ];

        let rider_balance = compute_balance(rider, &entries);
        assert_eq!(rider_balance.available, 350000);
        assert_eq!(rider_balance.pending, 0);
        assert_eq!(compute_balance(driver, &entries).available, 120000);
        assert_eq!(compute_balance(platform, &entries).available, 30000);
    }

    #[test]
    fn test_payout_debits_available() {
        let wallet = Uuid::new_v4();
        let entries = vec![
            top_up(wallet, 300000, EntryStatus::Success),
            entry(wallet, Uuid::new_v4(), EntryType::Payout, Direction::Out, 100000),
        ];
        assert_eq!(compute_balance(wallet, &entries).available, 200000);
    }

    #[test]
    fn test_compute_balance_is_order_independent() {
        let wallet = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let mut entries = vec![
            top_up(wallet, 500000, EntryStatus::Success),
            entry(wallet, g1, EntryType::HoldCreate, Direction::Internal, 100000),
            entry(wallet, g1, EntryType::CaptureFare, Direction::Out, 80000),
        ];
        let forward = compute_balance(wallet, &entries);
        entries.reverse();
        assert_eq!(compute_balance(wallet, &entries), forward);
    }

    #[test]
    fn test_summarize_settlement_group() {
        let rider = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let platform = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let entries = vec![
            entry(rider, g1, EntryType::HoldCreate, Direction::Internal, 150000),
            entry(rider, g1, EntryType::CaptureFare, Direction::Out, 150000),
            entry(driver, g1, EntryType::CaptureFare, Direction::In, 120000),
            entry(platform, g1, EntryType::CaptureFare, Direction::In, 30000),
        ];

        let summary = summarize_group(g1, &entries);
        assert!(summary.is_settlement());
        assert!(summary.is_balanced());
        assert_eq!(summary.held, 150000);
        assert_eq!(summary.resolutions, 1);
        assert_eq!(summary.capture_legs, 3);
    }

    #[test]
    fn test_summarize_detects_missing_credit() {
        let rider = Uuid::new_v4();
        let driver = Uuid::new_v4();
        let g1 = Uuid::new_v4();
        let entries = vec![
            entry(rider, g1, EntryType::HoldCreate, Direction::Internal, 150000),
            entry(rider, g1, EntryType::CaptureFare, Direction::Out, 150000),
            entry(driver, g1, EntryType::CaptureFare, Direction::In, 120000),
        ];

        let summary = summarize_group(g1, &entries);
        assert!(!summary.is_balanced());
        assert_eq!(summary.debited - summary.credited, 30000);
    }
}
