use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{
    Actor, FareBreakdown, LedgerEntry, Money, RideHold, RideRequestId, SettlementResult, UserId,
    WalletBalance, format_money,
};
use crate::storage::{Repository, is_unique_violation};

use super::{
    BalanceCalculationService, CaptureCredit, LedgerError, Notification, NotificationKind,
    NotificationService, PricingService, Priority, WalletLedgerService,
};

/// Turns ride lifecycle events into ledger groups: a hold at booking, a release
/// at cancellation, a three-leg capture at completion.
#[derive(Clone)]
pub struct RideFundCoordinatingService {
    repo: Repository,
    ledger: WalletLedgerService,
    balances: BalanceCalculationService,
    pricing: Arc<dyn PricingService>,
    notifier: Arc<dyn NotificationService>,
}

impl RideFundCoordinatingService {
    pub fn new(
        repo: Repository,
        ledger: WalletLedgerService,
        balances: BalanceCalculationService,
        pricing: Arc<dyn PricingService>,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            repo,
            ledger,
            balances,
            pricing,
            notifier,
        }
    }

    /// Reserve a ride's estimated fare on the rider's wallet.
    pub async fn hold_ride_funds(
        &self,
        rider_id: UserId,
        ride_request_id: RideRequestId,
        amount: Money,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let wallet = self.ledger.get_wallet_for_user(rider_id).await?;

        // Early rejection; the authoritative check runs again under the wallet lock.
        let available = self.balances.calculate_available_balance(wallet.id).await?;
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                wallet_id: wallet.id,
                available,
                required: amount,
            });
        }

        let mut tx = self.repo.begin_write().await?;
        if self.repo.get_ride_hold(&mut tx, ride_request_id).await?.is_some() {
            return Err(LedgerError::RideAlreadyHeld(ride_request_id));
        }

        let group_id = Uuid::new_v4();
        let entry = self
            .ledger
            .hold_amount_in(&mut tx, wallet.id, amount, group_id, note)
            .await?;

        let ride_hold = RideHold::new(ride_request_id, group_id, rider_id, wallet.id, amount);
        match self.repo.insert_ride_hold(&mut tx, &ride_hold).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::RideAlreadyHeld(ride_request_id));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await.context("Failed to commit ride hold")?;
        info!(ride_request_id = %ride_request_id, group_id = %group_id, amount, "ride funds held");

        self.notify(
            Notification::new(
                rider_id,
                NotificationKind::FundsOnHold,
                "Funds on Hold",
                format!(
                    "{} {} is on hold for your ride.",
                    format_money(amount),
                    entry.currency
                ),
            )
            .with_payload(json!({
                "ride_request_id": ride_request_id,
                "group_id": group_id,
                "amount": amount,
            }))
            .with_topic(format!("ride:{}", ride_request_id)),
        )
        .await;

        Ok(entry)
    }

    /// Return a cancelled ride's hold to the rider.
    pub async fn release_ride_funds(
        &self,
        rider_id: UserId,
        ride_request_id: RideRequestId,
        note: Option<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut tx = self.repo.begin_write().await?;
        let ride_hold = self.find_ride_hold(&mut tx, rider_id, ride_request_id).await?;

        let entry = self
            .ledger
            .release_hold_in(&mut tx, ride_hold.group_id, note)
            .await?;

        tx.commit().await.context("Failed to commit ride release")?;
        info!(ride_request_id = %ride_request_id, group_id = %ride_hold.group_id, "ride funds released");

        self.notify(
            Notification::new(
                rider_id,
                NotificationKind::HoldReleased,
                "Hold Released",
                format!(
                    "{} {} is available again.",
                    format_money(entry.amount),
                    entry.currency
                ),
            )
            .with_payload(json!({
                "ride_request_id": ride_request_id,
                "group_id": ride_hold.group_id,
                "amount": entry.amount,
            }))
            .with_topic(format!("ride:{}", ride_request_id)),
        )
        .await;

        Ok(entry)
    }

    /// Capture a completed ride's fare: rider debit, driver credit and platform
    /// commission, all in the hold's group.
    pub async fn settle_ride_funds(
        &self,
        rider_id: UserId,
        driver_id: UserId,
        ride_request_id: RideRequestId,
        fare: &FareBreakdown,
    ) -> Result<SettlementResult, LedgerError> {
        let settlement = self.pricing.settle(fare)?;
        if !settlement.is_conserved() {
            return Err(LedgerError::UnbalancedSettlement {
                rider_pay: settlement.rider_pay,
                driver_payout: settlement.driver_payout,
                commission: settlement.commission,
            });
        }

        let driver_wallet = self.ledger.get_wallet_for_user(driver_id).await?;
        self.ledger.get_wallet_for_user(rider_id).await?;
        let system_wallet = self.ledger.ensure_system_wallet().await?;

        let mut tx = self.repo.begin_write().await?;
        let ride_hold = self.find_ride_hold(&mut tx, rider_id, ride_request_id).await?;

        let credits = [
            CaptureCredit {
                wallet_id: driver_wallet.id,
                amount: settlement.driver_payout,
                actor: Actor::User(driver_id),
            },
            CaptureCredit {
                wallet_id: system_wallet.id,
                amount: settlement.commission,
                actor: Actor::System,
            },
        ];
        let entries = self
            .ledger
            .capture_hold_in(
                &mut tx,
                ride_hold.group_id,
                settlement.rider_pay,
                &credits,
                Some(format!("ride {}", ride_request_id)),
            )
            .await?;

        tx.commit().await.context("Failed to commit settlement")?;
        info!(
            ride_request_id = %ride_request_id,
            group_id = %ride_hold.group_id,
            rider_pay = settlement.rider_pay,
            driver_payout = settlement.driver_payout,
            commission = settlement.commission,
            "ride settled"
        );

        let currency = entries
            .first()
            .map(|e| e.currency.clone())
            .unwrap_or_default();
        let payload = json!({
            "ride_request_id": ride_request_id,
            "group_id": ride_hold.group_id,
            "rider_pay": settlement.rider_pay,
            "driver_payout": settlement.driver_payout,
            "commission": settlement.commission,
        });

        self.notify(
            Notification::new(
                rider_id,
                NotificationKind::PaymentSuccessful,
                "Payment Successful",
                format!(
                    "You paid {} {} for your ride.",
                    format_money(settlement.rider_pay),
                    currency
                ),
            )
            .with_payload(payload.clone())
            .with_topic(format!("ride:{}", ride_request_id)),
        )
        .await;

        self.notify(
            Notification::new(
                driver_id,
                NotificationKind::DriverPaid,
                "You've Been Paid",
                format!(
                    "{} {} was added to your wallet.",
                    format_money(settlement.driver_payout),
                    currency
                ),
            )
            .with_payload(payload)
            .with_priority(Priority::High)
            .with_topic(format!("ride:{}", ride_request_id)),
        )
        .await;

        Ok(settlement)
    }

    /// Available and pending balance of a user's wallet.
    pub async fn get_balance(&self, user_id: UserId) -> Result<WalletBalance, LedgerError> {
        let wallet = self.ledger.get_wallet_for_user(user_id).await?;
        self.balances.calculate_balance(wallet.id).await
    }

    pub async fn get_ride_hold(&self, ride_request_id: RideRequestId) -> Result<RideHold, LedgerError> {
        let mut conn = self.repo.acquire().await?;
        self.repo
            .get_ride_hold(&mut conn, ride_request_id)
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(format!("ride request {}", ride_request_id)))
    }

    /// A hold that belongs to another rider is reported as missing.
    async fn find_ride_hold(
        &self,
        conn: &mut sqlx::SqliteConnection,
        rider_id: UserId,
        ride_request_id: RideRequestId,
    ) -> Result<RideHold, LedgerError> {
        self.repo
            .get_ride_hold(conn, ride_request_id)
            .await?
            .filter(|hold| hold.rider_id == rider_id)
            .ok_or_else(|| LedgerError::HoldNotFound(format!("ride request {}", ride_request_id)))
    }

    async fn notify(&self, notification: Notification) {
        let user_id = notification.user_id;
        let kind = notification.kind;
        if let Err(err) = self.notifier.send_notification(notification).await {
            warn!(user_id = %user_id, kind = ?kind, error = %err, "notification not delivered");
        }
    }
}
