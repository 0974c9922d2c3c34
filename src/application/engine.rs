use std::sync::Arc;

use tracing::info;

use crate::domain::{User, Wallet};
use crate::storage::{Repository, is_unique_violation};

use super::{
    AuditReport, BalanceCalculationService, CommissionPricing, EngineConfig, LedgerAuditor,
    LedgerError, LogNotifier, NotificationService, PricingService, RideFundCoordinatingService,
    UserRepository, WalletLedgerService,
};

/// Entry point wiring the services over one repository.
/// This is the primary interface for any client (CLI, booking service, tests).
#[derive(Clone)]
pub struct Engine {
    repo: Repository,
    config: EngineConfig,
    balances: BalanceCalculationService,
    wallets: WalletLedgerService,
    rides: RideFundCoordinatingService,
    auditor: LedgerAuditor,
}

impl Engine {
    /// Build an engine with the bundled commission pricing, log notifier and the
    /// repository's own user table.
    pub fn new(repo: Repository, config: EngineConfig) -> Result<Self, LedgerError> {
        let pricing = Arc::new(CommissionPricing::new(config.commission_bps)?);
        let users = Arc::new(repo.clone());
        Self::with_collaborators(repo, config, pricing, Arc::new(LogNotifier), users)
    }

    /// Build an engine around externally provided collaborators.
    pub fn with_collaborators(
        repo: Repository,
        config: EngineConfig,
        pricing: Arc<dyn PricingService>,
        notifier: Arc<dyn NotificationService>,
        users: Arc<dyn UserRepository>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;

        let balances = BalanceCalculationService::new(repo.clone());
        let wallets = WalletLedgerService::new(
            repo.clone(),
            balances.clone(),
            users,
            config.currency.clone(),
        );
        let rides = RideFundCoordinatingService::new(
            repo.clone(),
            wallets.clone(),
            balances.clone(),
            pricing,
            notifier,
        );
        let auditor = LedgerAuditor::new(repo.clone());

        Ok(Self {
            repo,
            config,
            balances,
            wallets,
            rides,
            auditor,
        })
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str, config: EngineConfig) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Self::new(repo, config)
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str, config: EngineConfig) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Self::new(repo, config)
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn balances(&self) -> &BalanceCalculationService {
        &self.balances
    }

    pub fn wallets(&self) -> &WalletLedgerService {
        &self.wallets
    }

    pub fn rides(&self) -> &RideFundCoordinatingService {
        &self.rides
    }

    // ========================
    // Users
    // ========================

    /// Register a user and open their wallet.
    pub async fn register_user(
        &self,
        email: &str,
        display_name: &str,
    ) -> Result<(User, Wallet), LedgerError> {
        let email = email.trim().to_lowercase();
        if self.repo.get_user_by_email(&email).await?.is_some() {
            return Err(LedgerError::UserAlreadyExists(email));
        }

        let user = User::new(email.as_str(), display_name);
        match self.repo.save_user(&user).await {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(LedgerError::UserAlreadyExists(email));
            }
            Err(err) => return Err(err.into()),
        }
        info!(user_id = %user.id, email = %user.email, "user registered");

        let wallet = self.wallets.create_wallet(user.id).await?;
        Ok((user, wallet))
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<User, LedgerError> {
        let email = email.trim().to_lowercase();
        self.repo
            .get_user_by_email(&email)
            .await?
            .ok_or(LedgerError::UserNotFound(email))
    }

    // ========================
    // Audit
    // ========================

    /// Check ledger integrity and return a report.
    pub async fn audit_ledger(&self) -> Result<AuditReport, LedgerError> {
        self.auditor.audit().await
    }
}
