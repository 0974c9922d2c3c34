use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{GroupId, Money, UserId, WalletId};

pub type RideRequestId = Uuid;

/// Index from a ride request to the ledger group holding its funds,
/// so a ride's hold is found without scanning the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideHold {
    pub ride_request_id: RideRequestId,
    pub group_id: GroupId,
    pub rider_id: UserId,
    pub wallet_id: WalletId,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
}

impl RideHold {
    pub fn new(
        ride_request_id: RideRequestId,
        group_id: GroupId,
        rider_id: UserId,
        wallet_id: WalletId,
        amount: Money,
    ) -> Self {
        Self {
            ride_request_id,
            group_id,
            rider_id,
            wallet_id,
            amount,
            created_at: Utc::now(),
        }
    }
}
