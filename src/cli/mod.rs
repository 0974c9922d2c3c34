use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::application::config::{DEFAULT_COMMISSION_BPS, DEFAULT_CURRENCY};
use crate::application::{Engine, EngineConfig};
use crate::domain::{EntryStatus, FareBreakdown, LedgerEntry, Money, format_money, parse_money};

/// Farebox - wallet ledger for ride payments
#[derive(Parser)]
#[command(name = "farebox")]
#[command(about = "Operator tool for a ledger-backed ride payment wallet")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, env = "FAREBOX_DB", default_value = "farebox.db")]
    pub database: String,

    /// Currency of new wallets and entries
    #[arg(long, env = "FAREBOX_CURRENCY", default_value = DEFAULT_CURRENCY, global = true)]
    pub currency: String,

    /// Platform commission in basis points of the fare
    #[arg(long, env = "FAREBOX_COMMISSION_BPS", default_value_t = DEFAULT_COMMISSION_BPS, global = true)]
    pub commission_bps: u32,

    /// Log filter, e.g. "info" or "farebox=debug"
    #[arg(long, env = "FAREBOX_LOG", default_value = "warn", global = true)]
    pub log_level: String,

    /// Enable verbose output (same as --log-level debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// User management commands
    #[command(subcommand)]
    User(UserCommands),

    /// Wallet management commands
    #[command(subcommand)]
    Wallet(WalletCommands),

    /// Top-up lifecycle commands
    #[command(subcommand)]
    Topup(TopUpCommands),

    /// Pay out from a wallet to the user's bank
    Payout {
        /// User email
        email: String,

        /// Amount in minor units (e.g., "150,000")
        amount: String,

        /// Payment gateway reference
        #[arg(long)]
        psp_ref: String,

        /// Idempotency key (defaults to a fresh one)
        #[arg(long)]
        key: Option<String>,
    },

    /// Ride fund commands
    #[command(subcommand)]
    Ride(RideCommands),

    /// Show available and pending balance for a user or all wallets
    Balance {
        /// User email (omit for all wallets)
        email: Option<String>,
    },

    /// List ledger entries
    Entries {
        /// Only entries of this user's wallet
        #[arg(long)]
        email: Option<String>,

        /// Only entries of this group
        #[arg(long)]
        group: Option<String>,

        /// Maximum number of entries to show (most recent)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show a single ledger entry
    Show {
        /// Entry ID
        id: String,
    },

    /// Verify ledger integrity
    Check,

    /// Export data to CSV or JSON
    Export {
        /// What to export: entries, balances, full
        #[arg(default_value = "full")]
        export_type: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Register a user and open their wallet
    Add {
        /// Email address
        email: String,

        /// Display name
        #[arg(short, long)]
        name: String,
    },

    /// List all users
    List,
}

#[derive(Subcommand)]
pub enum WalletCommands {
    /// List all wallets
    List,

    /// Show wallet details
    Show {
        /// User email
        email: String,
    },

    /// Freeze a wallet
    Freeze {
        /// User email
        email: String,
    },

    /// Unfreeze a wallet
    Unfreeze {
        /// User email
        email: String,
    },

    /// Create the platform commission wallet if missing
    System,
}

#[derive(Subcommand)]
pub enum TopUpCommands {
    /// Record a top-up reported by the payment gateway
    Create {
        /// User email
        email: String,

        /// Amount in minor units (e.g., "200,000")
        amount: String,

        /// Payment gateway reference
        #[arg(long)]
        psp_ref: String,

        /// Idempotency key (defaults to a fresh one)
        #[arg(long)]
        key: Option<String>,

        /// Record the top-up as already paid
        #[arg(long)]
        completed: bool,
    },

    /// Mark a pending top-up as paid
    Complete {
        /// Entry ID
        id: String,
    },

    /// Mark a pending top-up as failed
    Fail {
        /// Entry ID
        id: String,

        /// Failure reason
        #[arg(short, long)]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum RideCommands {
    /// Hold a ride's estimated fare on the rider's wallet
    Hold {
        /// Rider email
        rider: String,

        /// Amount in minor units
        amount: String,

        /// Ride request ID (defaults to a fresh one)
        #[arg(long)]
        ride: Option<String>,

        /// Note stored on the hold
        #[arg(long)]
        note: Option<String>,
    },

    /// Release a cancelled ride's hold
    Release {
        /// Rider email
        rider: String,

        /// Ride request ID
        #[arg(long)]
        ride: String,

        /// Note stored on the release
        #[arg(long)]
        note: Option<String>,
    },

    /// Settle a completed ride
    Settle {
        /// Rider email
        rider: String,

        /// Driver email
        #[arg(long)]
        driver: String,

        /// Ride request ID
        #[arg(long)]
        ride: String,

        /// Base fare
        #[arg(long)]
        base: String,

        #[arg(long)]
        distance: Option<String>,

        #[arg(long)]
        time: Option<String>,

        #[arg(long)]
        surge: Option<String>,

        #[arg(long)]
        booking_fee: Option<String>,

        #[arg(long)]
        discount: Option<String>,
    },

    /// Show the hold of a ride request
    Show {
        /// Ride request ID
        ride: String,
    },
}

impl Cli {
    fn init_tracing(&self) {
        let directive = if self.verbose {
            "debug"
        } else {
            self.log_level.as_str()
        };
        let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_currency(self.currency.clone())
            .with_commission_bps(self.commission_bps)
    }

    pub async fn run(self) -> Result<()> {
        self.init_tracing();
        let config = self.config();

        if matches!(self.command, Commands::Init) {
            let engine = Engine::init(&self.database, config).await?;
            engine.wallets().ensure_system_wallet().await?;
            println!("Database initialized: {}", self.database);
            return Ok(());
        }

        let engine = Engine::connect(&self.database, config).await?;

        match self.command {
            Commands::Init => {}

            Commands::User(cmd) => run_user_command(&engine, cmd).await?,

            Commands::Wallet(cmd) => run_wallet_command(&engine, cmd).await?,

            Commands::Topup(cmd) => run_topup_command(&engine, cmd).await?,

            Commands::Payout {
                email,
                amount,
                psp_ref,
                key,
            } => {
                let user = engine.find_user_by_email(&email).await?;
                let amount = parse_amount(&amount)?;
                let key = key.unwrap_or_else(|| Uuid::new_v4().to_string());

                let entry = engine
                    .wallets()
                    .record_payout(user.id, amount, &psp_ref, &key)
                    .await?;
                println!(
                    "Paid out {} {} to {} ({})",
                    format_money(entry.amount),
                    entry.currency,
                    user.email,
                    entry.id
                );
            }

            Commands::Ride(cmd) => run_ride_command(&engine, cmd).await?,

            Commands::Balance { email } => run_balance_command(&engine, email).await?,

            Commands::Entries {
                email,
                group,
                limit,
            } => run_entries_command(&engine, email, group, limit).await?,

            Commands::Show { id } => {
                let entry = engine.wallets().get_entry(parse_id(&id, "entry")?).await?;
                print_entry_details(&entry);
            }

            Commands::Check => run_check_command(&engine).await?,

            Commands::Export {
                export_type,
                output,
            } => run_export_command(&engine, &export_type, output.as_deref()).await?,
        }

        Ok(())
    }
}

async fn run_user_command(engine: &Engine, cmd: UserCommands) -> Result<()> {
    match cmd {
        UserCommands::Add { email, name } => {
            let (user, wallet) = engine.register_user(&email, &name).await?;
            println!("Registered user: {} ({})", user.email, user.id);
            println!("Opened wallet:   {} ({})", wallet.id, wallet.currency);
        }

        UserCommands::List => {
            let users = engine.repository().list_users().await?;
            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<30} {:<20} {:<36}", "EMAIL", "NAME", "ID");
                println!("{}", "-".repeat(88));
                for user in users {
                    println!(
                        "{:<30} {:<20} {:<36}",
                        truncate(&user.email, 30),
                        truncate(&user.display_name, 20),
                        user.id
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_wallet_command(engine: &Engine, cmd: WalletCommands) -> Result<()> {
    match cmd {
        WalletCommands::List => {
            let wallets = engine.wallets().list_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets found.");
            } else {
                println!("{:<36} {:<8} {:<8} {:<8}", "ID", "KIND", "CURRENCY", "ACTIVE");
                println!("{}", "-".repeat(64));
                for wallet in wallets {
                    println!(
                        "{:<36} {:<8} {:<8} {:<8}",
                        wallet.id,
                        wallet.kind.as_str(),
                        wallet.currency,
                        if wallet.is_active { "yes" } else { "no" }
                    );
                }
            }
        }

        WalletCommands::Show { email } => {
            let user = engine.find_user_by_email(&email).await?;
            let wallet = engine.wallets().get_wallet_for_user(user.id).await?;
            let balance = engine.balances().calculate_balance(wallet.id).await?;

            println!("Wallet of {}", user.email);
            println!("  ID:             {}", wallet.id);
            println!("  Currency:       {}", wallet.currency);
            println!(
                "  Active:         {}",
                if wallet.is_active { "yes" } else { "no" }
            );
            println!(
                "  Created:        {}",
                wallet.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!();
            println!(
                "  Available:      {} {}",
                format_money(balance.available),
                wallet.currency
            );
            println!(
                "  Pending:        {} {}",
                format_money(balance.pending),
                wallet.currency
            );
            println!(
                "  Topped up:      {} {}",
                format_money(wallet.total_topped_up),
                wallet.currency
            );
            println!(
                "  Spent:          {} {}",
                format_money(wallet.total_spent),
                wallet.currency
            );
        }

        WalletCommands::Freeze { email } => {
            let user = engine.find_user_by_email(&email).await?;
            let wallet = engine.wallets().deactivate_wallet(user.id).await?;
            println!("Froze wallet {} of {}", wallet.id, user.email);
        }

        WalletCommands::Unfreeze { email } => {
            let user = engine.find_user_by_email(&email).await?;
            let wallet = engine.wallets().activate_wallet(user.id).await?;
            println!("Unfroze wallet {} of {}", wallet.id, user.email);
        }

        WalletCommands::System => {
            let wallet = engine.wallets().ensure_system_wallet().await?;
            println!("System wallet: {} ({})", wallet.id, wallet.currency);
        }
    }
    Ok(())
}

async fn run_topup_command(engine: &Engine, cmd: TopUpCommands) -> Result<()> {
    match cmd {
        TopUpCommands::Create {
            email,
            amount,
            psp_ref,
            key,
            completed,
        } => {
            let user = engine.find_user_by_email(&email).await?;
            let amount = parse_amount(&amount)?;
            let key = key.unwrap_or_else(|| Uuid::new_v4().to_string());
            let status = if completed {
                EntryStatus::Success
            } else {
                EntryStatus::Pending
            };

            let entry = engine
                .wallets()
                .create_top_up_transaction(user.id, amount, &psp_ref, &key, status)
                .await?;
            println!(
                "Top-up {}: {} {} for {} ({})",
                entry.status,
                format_money(entry.amount),
                entry.currency,
                user.email,
                entry.id
            );
        }

        TopUpCommands::Complete { id } => {
            let entry = engine
                .wallets()
                .complete_top_up_transaction(parse_id(&id, "entry")?)
                .await?;
            println!(
                "Completed top-up {}: {} {}",
                entry.id,
                format_money(entry.amount),
                entry.currency
            );
        }

        TopUpCommands::Fail { id, reason } => {
            let entry = engine
                .wallets()
                .fail_top_up_transaction(parse_id(&id, "entry")?, &reason)
                .await?;
            println!("Failed top-up {}: {}", entry.id, reason);
        }
    }
    Ok(())
}

async fn run_ride_command(engine: &Engine, cmd: RideCommands) -> Result<()> {
    match cmd {
        RideCommands::Hold {
            rider,
            amount,
            ride,
            note,
        } => {
            let rider = engine.find_user_by_email(&rider).await?;
            let amount = parse_amount(&amount)?;
            let ride_id = match ride {
                Some(id) => parse_id(&id, "ride request")?,
                None => Uuid::new_v4(),
            };

            let entry = engine
                .rides()
                .hold_ride_funds(rider.id, ride_id, amount, note)
                .await?;
            println!(
                "Held {} {} for ride {} (group {})",
                format_money(entry.amount),
                entry.currency,
                ride_id,
                entry.group_id
            );
        }

        RideCommands::Release { rider, ride, note } => {
            let rider = engine.find_user_by_email(&rider).await?;
            let ride_id = parse_id(&ride, "ride request")?;

            let entry = engine
                .rides()
                .release_ride_funds(rider.id, ride_id, note)
                .await?;
            println!(
                "Released {} {} for ride {}",
                format_money(entry.amount),
                entry.currency,
                ride_id
            );
        }

        RideCommands::Settle {
            rider,
            driver,
            ride,
            base,
            distance,
            time,
            surge,
            booking_fee,
            discount,
        } => {
            let rider = engine.find_user_by_email(&rider).await?;
            let driver = engine.find_user_by_email(&driver).await?;
            let ride_id = parse_id(&ride, "ride request")?;

            let fare = FareBreakdown::new(parse_amount(&base)?)
                .with_distance_fare(parse_optional_amount(distance)?)
                .with_time_fare(parse_optional_amount(time)?)
                .with_surge_fare(parse_optional_amount(surge)?)
                .with_booking_fee(parse_optional_amount(booking_fee)?)
                .with_discount(parse_optional_amount(discount)?);

            let result = engine
                .rides()
                .settle_ride_funds(rider.id, driver.id, ride_id, &fare)
                .await?;

            println!("Settled ride {}", ride_id);
            println!("  Rider paid:     {:>12}", format_money(result.rider_pay));
            println!("  Driver payout:  {:>12}", format_money(result.driver_payout));
            println!("  Commission:     {:>12}", format_money(result.commission));
        }

        RideCommands::Show { ride } => {
            let hold = engine
                .rides()
                .get_ride_hold(parse_id(&ride, "ride request")?)
                .await?;
            let entries = engine.wallets().list_group(hold.group_id).await?;

            println!("Ride {}", hold.ride_request_id);
            println!("  Group:   {}", hold.group_id);
            println!("  Rider:   {}", hold.rider_id);
            println!("  Held:    {}", format_money(hold.amount));
            println!();
            print_entries(&entries);
        }
    }
    Ok(())
}

async fn run_balance_command(engine: &Engine, email: Option<String>) -> Result<()> {
    match email {
        Some(email) => {
            let user = engine.find_user_by_email(&email).await?;
            let balance = engine.rides().get_balance(user.id).await?;
            println!(
                "{}: available {}, pending {}",
                user.email,
                format_money(balance.available),
                format_money(balance.pending)
            );
        }
        None => {
            let wallets = engine.wallets().list_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets found.");
            } else {
                println!(
                    "{:<36} {:<8} {:>14} {:>14}",
                    "WALLET", "KIND", "AVAILABLE", "PENDING"
                );
                println!("{}", "-".repeat(75));
                for wallet in wallets {
                    let balance = engine.balances().calculate_balance(wallet.id).await?;
                    println!(
                        "{:<36} {:<8} {:>14} {:>14}",
                        wallet.id,
                        wallet.kind.as_str(),
                        format_money(balance.available),
                        format_money(balance.pending)
                    );
                }
            }
        }
    }
    Ok(())
}

async fn run_entries_command(
    engine: &Engine,
    email: Option<String>,
    group: Option<String>,
    limit: Option<usize>,
) -> Result<()> {
    let mut entries = match (email, group) {
        (_, Some(group)) => {
            engine
                .wallets()
                .list_group(parse_id(&group, "group")?)
                .await?
        }
        (Some(email), None) => {
            let user = engine.find_user_by_email(&email).await?;
            let wallet = engine.wallets().get_wallet_for_user(user.id).await?;
            engine.wallets().list_entries(wallet.id).await?
        }
        (None, None) => engine.wallets().list_all_entries().await?,
    };

    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        println!("No entries found.");
    } else {
        print_entries(&entries);
    }
    Ok(())
}

fn print_entries(entries: &[LedgerEntry]) {
    println!(
        "{:>6} {:<12} {:<8} {:<8} {:>12} {:<8} NOTE",
        "SEQ", "TYPE", "DIR", "STATUS", "AMOUNT", "WALLET"
    );
    println!("{}", "-".repeat(80));
    for entry in entries {
        let wallet = entry.wallet_id.to_string();
        println!(
            "{:>6} {:<12} {:<8} {:<8} {:>12} {:<8} {}",
            entry.sequence,
            entry.entry_type.as_str(),
            entry.direction.as_str(),
            entry.status.as_str(),
            format_money(entry.amount),
            &wallet[..8],
            truncate(entry.note.as_deref().unwrap_or(""), 30)
        );
    }
}

fn print_entry_details(entry: &LedgerEntry) {
    println!("Entry: {}", entry.id);
    println!("  Sequence:  {}", entry.sequence);
    println!("  Group:     {}", entry.group_id);
    println!("  Type:      {} {}", entry.entry_type, entry.direction);
    println!("  Status:    {}", entry.status);
    println!("  Wallet:    {}", entry.wallet_id);
    match entry.actor.user_id() {
        Some(user_id) => println!("  Actor:     {} {}", entry.actor.kind_str(), user_id),
        None => println!("  Actor:     {}", entry.actor.kind_str()),
    }
    println!(
        "  Amount:    {} {}",
        format_money(entry.amount),
        entry.currency
    );
    if let Some(psp_ref) = &entry.psp_ref {
        println!("  PSP ref:   {}", psp_ref);
    }
    if let Some(key) = &entry.idempotency_key {
        println!("  Key:       {}", key);
    }
    if let Some(snapshot) = &entry.snapshot {
        println!(
            "  Available: {} -> {}",
            format_money(snapshot.before_available),
            format_money(snapshot.after_available)
        );
        println!(
            "  Pending:   {} -> {}",
            format_money(snapshot.before_pending),
            format_money(snapshot.after_pending)
        );
    }
    if let Some(note) = &entry.note {
        println!("  Note:      {}", note);
    }
    println!(
        "  Created:   {}",
        entry.created_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn run_check_command(engine: &Engine) -> Result<()> {
    println!("Checking ledger integrity...\n");

    let report = engine.audit_ledger().await?;

    println!("Wallets:          {}", report.wallet_count);
    println!("Entries:          {}", report.entry_count);
    println!("Pending top-ups:  {}", report.pending_top_ups);
    println!();

    if report.is_healthy() {
        println!("Ledger is consistent.");
    } else {
        println!("Issues found:");
        for issue in &report.issues {
            println!("  - {}", issue);
        }
        anyhow::bail!("Ledger integrity check failed");
    }

    Ok(())
}

async fn run_export_command(engine: &Engine, export_type: &str, output: Option<&str>) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{Write, stdout};

    let exporter = Exporter::new(engine);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "entries" => {
            let count = exporter.export_entries_csv(writer).await?;
            if output.is_some() {
                eprintln!("Exported {} entries", count);
            }
        }
        "balances" => {
            let count = exporter.export_balances_csv(writer).await?;
            if output.is_some() {
                eprintln!("Exported {} balances", count);
            }
        }
        "full" => {
            let snapshot = exporter.export_full_json(writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported full database: {} users, {} wallets, {} entries",
                    snapshot.users.len(),
                    snapshot.wallets.len(),
                    snapshot.entries.len()
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: entries, balances, full",
                export_type
            );
        }
    }

    Ok(())
}

fn parse_amount(input: &str) -> Result<Money> {
    parse_money(input).with_context(|| format!("Invalid amount '{}'. Use '150000' or '150,000'", input))
}

fn parse_optional_amount(input: Option<String>) -> Result<Money> {
    input.as_deref().map(parse_amount).transpose().map(|a| a.unwrap_or(0))
}

fn parse_id(input: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(input).with_context(|| format!("Invalid {} ID: {}", what, input))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
