// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use farebox::application::{
    CommissionPricing, Engine, EngineConfig, LogNotifier, Notification, NotificationKind,
    NotificationService,
};
use farebox::domain::{EntryStatus, LedgerEntry, Money, User, Wallet};
use farebox::storage::Repository;
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create a test engine with a temporary database
pub async fn test_engine() -> Result<(Engine, TempDir)> {
    test_engine_with_notifier(Arc::new(LogNotifier)).await
}

/// Helper to create a test engine that sends notifications to `notifier`
pub async fn test_engine_with_notifier(
    notifier: Arc<dyn NotificationService>,
) -> Result<(Engine, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let repo = Repository::init(&format!("sqlite:{}?mode=rwc", db_path.to_str().unwrap())).await?;

    let config = EngineConfig::default();
    let pricing = Arc::new(CommissionPricing::new(config.commission_bps)?);
    let engine = Engine::with_collaborators(
        repo.clone(),
        config,
        pricing,
        notifier,
        Arc::new(repo),
    )?;
    Ok((engine, temp_dir))
}

/// Register a user with a wallet
pub async fn register(engine: &Engine, email: &str) -> Result<(User, Wallet)> {
    Ok(engine.register_user(email, email).await?)
}

/// Credit a wallet with an already paid top-up
pub async fn fund(engine: &Engine, user: &User, amount: Money) -> Result<LedgerEntry> {
    let entry = engine
        .wallets()
        .create_top_up_transaction(
            user.id,
            amount,
            &format!("PSP-{}", Uuid::new_v4()),
            &Uuid::new_v4().to_string(),
            EntryStatus::Success,
        )
        .await?;
    Ok(entry)
}

/// Notifier that keeps every notification it is given
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent().iter().map(|n| n.kind).collect()
    }
}

#[async_trait::async_trait]
impl NotificationService for RecordingNotifier {
    async fn send_notification(&self, notification: Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}

/// Notifier whose delivery always fails
pub struct FailingNotifier;

#[async_trait::async_trait]
impl NotificationService for FailingNotifier {
    async fn send_notification(&self, _notification: Notification) -> Result<()> {
        anyhow::bail!("push gateway unavailable")
    }
}
