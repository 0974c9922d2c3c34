//! Interfaces of the services this engine depends on but does not own,
//! with the implementations the engine ships for standalone use.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{FareBreakdown, SettlementResult, User, UserId};
use crate::storage::Repository;

use super::LedgerError;
use super::config::MAX_COMMISSION_BPS;

/// Turns a fare into the rider/driver/platform split.
pub trait PricingService: Send + Sync {
    fn settle(&self, fare: &FareBreakdown) -> Result<SettlementResult, LedgerError>;
}

/// Identity lookup used to attribute ledger entries.
#[async_trait::async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;
}

/// Fire-and-forget delivery of user notifications.
#[async_trait::async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_notification(&self, notification: Notification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    FundsOnHold,
    HoldReleased,
    PaymentSuccessful,
    DriverPaid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    Push,
    Email,
    InApp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub delivery_method: DeliveryMethod,
    pub topic: Option<String>,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            kind,
            title: title.into(),
            message: message.into(),
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            delivery_method: DeliveryMethod::Push,
            topic: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Rider pays the whole fare; the platform keeps a fixed share, the driver gets the rest.
#[derive(Debug, Clone, Copy)]
pub struct CommissionPricing {
    commission_bps: u32,
}

impl CommissionPricing {
    pub fn new(commission_bps: u32) -> Result<Self, LedgerError> {
        if commission_bps > MAX_COMMISSION_BPS {
            return Err(LedgerError::InvalidCommissionRate(commission_bps));
        }
        Ok(Self { commission_bps })
    }

    pub fn commission_bps(&self) -> u32 {
        self.commission_bps
    }
}

impl PricingService for CommissionPricing {
    fn settle(&self, fare: &FareBreakdown) -> Result<SettlementResult, LedgerError> {
        let rider_pay = fare
            .total()
            .map_err(|_| LedgerError::InvalidAmount("Fare total is too large".to_string()))?;
        // rounded down so the driver keeps any remainder
        let commission = rider_pay
            .checked_mul(i64::from(self.commission_bps))
            .map(|scaled| scaled / i64::from(MAX_COMMISSION_BPS))
            .ok_or_else(|| {
                LedgerError::InvalidAmount(format!("Fare of {} is too large to price", rider_pay))
            })?;
        Ok(SettlementResult {
            rider_pay,
            driver_payout: rider_pay - commission,
            commission,
        })
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl NotificationService for LogNotifier {
    async fn send_notification(&self, notification: Notification) -> Result<()> {
        info!(
            user_id = %notification.user_id,
            kind = ?notification.kind,
            title = %notification.title,
            "{}",
            notification.message
        );
        Ok(())
    }
}

#[async_trait::async_trait]
impl UserRepository for Repository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<User>> {
        self.get_user(id).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.get_user_by_email(email).await
    }
}
