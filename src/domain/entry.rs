use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Money, UserId, WalletId};

pub type EntryId = Uuid;

/// Correlates every entry written by one logical operation (a hold and its resolution,
/// or a top-up).
pub type GroupId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "TOPUP")]
    TopUp,
    #[serde(rename = "HOLD_CREATE")]
    HoldCreate,
    #[serde(rename = "HOLD_RELEASE")]
    HoldRelease,
    #[serde(rename = "CAPTURE_FARE")]
    CaptureFare,
    #[serde(rename = "PAYOUT")]
    Payout,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::TopUp => "TOPUP",
            EntryType::HoldCreate => "HOLD_CREATE",
            EntryType::HoldRelease => "HOLD_RELEASE",
            EntryType::CaptureFare => "CAPTURE_FARE",
            EntryType::Payout => "PAYOUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TOPUP" => Some(EntryType::TopUp),
            "HOLD_CREATE" => Some(EntryType::HoldCreate),
            "HOLD_RELEASE" => Some(EntryType::HoldRelease),
            "CAPTURE_FARE" => Some(EntryType::CaptureFare),
            "PAYOUT" => Some(EntryType::Payout),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
    /// Moves money between buckets of the same wallet (holds and releases)
    Internal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Internal => "INTERNAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            "INTERNAL" => Some(Direction::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Success,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EntryStatus::Pending),
            "SUCCESS" => Some(EntryStatus::Success),
            "FAILED" => Some(EntryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }

    /// Only PENDING -> SUCCESS and PENDING -> FAILED are allowed.
    pub fn transition_to(self, next: EntryStatus) -> Result<EntryStatus, StatusTransitionError> {
        match (self, next) {
            (EntryStatus::Pending, EntryStatus::Success | EntryStatus::Failed) => Ok(next),
            (from, to) => Err(StatusTransitionError { from, to }),
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransitionError {
    pub from: EntryStatus,
    pub to: EntryStatus,
}

impl std::fmt::Display for StatusTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot move entry from {} to {}", self.from, self.to)
    }
}

impl std::error::Error for StatusTransitionError {}

/// Who caused a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actor {
    User(UserId),
    System,
}

impl Actor {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Actor::User(_) => "USER",
            Actor::System => "SYSTEM",
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::System => None,
        }
    }

    /// Rebuild an actor from its stored columns.
    pub fn from_parts(kind: &str, user_id: Option<UserId>) -> Option<Self> {
        match (kind, user_id) {
            ("USER", Some(id)) => Some(Actor::User(id)),
            ("SYSTEM", None) => Some(Actor::System),
            _ => None,
        }
    }
}

/// Balances of the affected wallet immediately before and after an entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub before_available: Money,
    pub after_available: Money,
    pub before_pending: Money,
    pub after_pending: Money,
}

impl BalanceSnapshot {
    /// Snapshots are all-or-nothing; a row with only some of the four values
    /// cannot be audited and is rejected.
    pub fn from_parts(
        before_available: Option<Money>,
        after_available: Option<Money>,
        before_pending: Option<Money>,
        after_pending: Option<Money>,
    ) -> Result<Option<Self>, IncompleteSnapshotError> {
        match (before_available, after_available, before_pending, after_pending) {
            (None, None, None, None) => Ok(None),
            (Some(before_available), Some(after_available), Some(before_pending), Some(after_pending)) => {
                Ok(Some(Self {
                    before_available,
                    after_available,
                    before_pending,
                    after_pending,
                }))
            }
            _ => Err(IncompleteSnapshotError),
        }
    }

    pub fn available_delta(&self) -> Money {
        self.after_available - self.before_available
    }

    pub fn pending_delta(&self) -> Money {
        self.after_pending - self.before_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompleteSnapshotError;

impl std::fmt::Display for IncompleteSnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "balance snapshot fields must be set together or not at all")
    }
}

impl std::error::Error for IncompleteSnapshotError {}

/// An immutable record of one money movement. Only the status of a PENDING
/// top-up ever changes after the entry is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Monotonically increasing write order, assigned by the repository
    pub sequence: i64,
    pub group_id: GroupId,
    pub entry_type: EntryType,
    pub direction: Direction,
    pub actor: Actor,
    pub wallet_id: WalletId,
    /// Always non-negative; the direction and type carry the sign
    pub amount: Money,
    pub currency: String,
    pub status: EntryStatus,
    /// Payment-gateway reference for top-ups and payouts
    pub psp_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub snapshot: Option<BalanceSnapshot>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create a new entry in its own group. Sequence number must be assigned by the repository.
    pub fn new(
        entry_type: EntryType,
        direction: Direction,
        actor: Actor,
        wallet_id: WalletId,
        amount: Money,
        currency: impl Into<String>,
        status: EntryStatus,
    ) -> Self {
        debug_assert!(amount >= 0, "Ledger entry amount must not be negative");
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            group_id: Uuid::new_v4(),
            entry_type,
            direction,
            actor,
            wallet_id,
            amount,
            currency: currency.into(),
            status,
            psp_ref: None,
            idempotency_key: None,
            snapshot: None,
            note: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn with_psp_ref(mut self, psp_ref: impl Into<String>) -> Self {
        self.psp_ref = Some(psp_ref.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: BalanceSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note.filter(|n| !n.trim().is_empty());
        self
    }

    /// True for the entry that closes a hold: a release, or the rider's capture debit.
    pub fn is_hold_resolution(&self) -> bool {
        match self.entry_type {
            EntryType::HoldRelease => true,
            EntryType::CaptureFare => self.direction == Direction::Out,
            EntryType::TopUp | EntryType::HoldCreate | EntryType::Payout => false,
        }
    }

    /// The note a failed top-up is left with.
    pub fn note_with_failure(&self, reason: &str) -> String {
        match self.note.as_deref() {
            Some(note) => format!("{}; failed: {}", note, reason),
            None => format!("failed: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_type_roundtrip() {
        for t in [
            EntryType::TopUp,
            EntryType::HoldCreate,
            EntryType::HoldRelease,
            EntryType::CaptureFare,
            EntryType::Payout,
        ] {
            assert_eq!(EntryType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(
            serde_json::to_string(&EntryType::TopUp).unwrap(),
            "\"TOPUP\""
        );
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(
            EntryStatus::Pending.transition_to(EntryStatus::Success),
            Ok(EntryStatus::Success)
        );
        assert_eq!(
            EntryStatus::Pending.transition_to(EntryStatus::Failed),
            Ok(EntryStatus::Failed)
        );
        assert!(EntryStatus::Success.transition_to(EntryStatus::Failed).is_err());
        assert!(EntryStatus::Failed.transition_to(EntryStatus::Success).is_err());
        assert!(EntryStatus::Pending.transition_to(EntryStatus::Pending).is_err());
    }

    #[test]
    fn test_snapshot_all_or_nothing() {
        assert_eq!(BalanceSnapshot::from_parts(None, None, None, None), Ok(None));

        let full = BalanceSnapshot::from_parts(Some(500), Some(400), Some(0), Some(100))
            .unwrap()
            .unwrap();
        assert_eq!(full.available_delta(), -100);
        assert_eq!(full.pending_delta(), 100);

        assert_eq!(
            BalanceSnapshot::from_parts(Some(500), Some(400), None, None),
            Err(IncompleteSnapshotError)
        );
        assert_eq!(
            BalanceSnapshot::from_parts(None, None, None, Some(1)),
            Err(IncompleteSnapshotError)
        );
    }

    #[test]
    fn test_actor_from_parts() {
        let id = Uuid::new_v4();
        assert_eq!(Actor::from_parts("USER", Some(id)), Some(Actor::User(id)));
        assert_eq!(Actor::from_parts("SYSTEM", None), Some(Actor::System));
        assert_eq!(Actor::from_parts("USER", None), None);
        assert_eq!(Actor::from_parts("SYSTEM", Some(id)), None);
    }

    #[test]
    fn test_hold_resolution_detection() {
        let wallet = Uuid::new_v4();
        let release = LedgerEntry::new(
            EntryType::HoldRelease,
            Direction::Internal,
            Actor::System,
            wallet,
            100,
            "VND",
            EntryStatus::Success,
        );
        let debit = LedgerEntry::new(
            EntryType::CaptureFare,
            Direction::Out,
            Actor::System,
            wallet,
            100,
            "VND",
            EntryStatus::Success,
        );
        let credit = LedgerEntry { direction: Direction::In, ..debit.clone() };

        assert!(release.is_hold_resolution());
        assert!(debit.is_hold_resolution());
        assert!(!credit.is_hold_resolution());
    }

    #[test]
    fn test_note_with_failure() {
        let wallet = Uuid::new_v4();
        let entry = LedgerEntry::new(
            EntryType::TopUp,
            Direction::In,
            Actor::System,
            wallet,
            100,
            "VND",
            EntryStatus::Pending,
        );
        assert_eq!(entry.note_with_failure("card declined"), "failed: card declined");

        let entry = entry.with_note(Some("top-up via gateway".into()));
        assert_eq!(
            entry.note_with_failure("timeout"),
            "top-up via gateway; failed: timeout"
        );
    }
}
