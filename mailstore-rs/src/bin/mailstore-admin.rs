//! Administrative tool for a mailstore deployment
//!
//! # Usage
//!
//! ```bash
//! # Create an account with its INBOX
//! mailstore-admin provision user@example.com
//!
//! # Delete every read message of one account (or all accounts)
//! mailstore-admin purge-read --user user@example.com
//! mailstore-admin purge-read
//!
//! # Delete every message
//! mailstore-admin purge-all --user user@example.com
//!
//! # Account, mailbox and message counts
//! mailstore-admin stat
//!
//! # Run one retention cycle now
//! mailstore-admin sweep
//! ```

use clap::{Parser, Subcommand};
use mailstore_rs::auth::{AuthStore, SqlAuthStore};
use mailstore_rs::config::Config;
use mailstore_rs::engine::Engine;
use mailstore_rs::retention::RetentionConfig;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "mailstore-admin")]
#[command(about = "Administer a mailstore deployment", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account
    Provision {
        /// Username or address
        username: String,
    },
    /// Delete an account with all its mailboxes and messages
    Delete {
        username: String,
    },
    /// List accounts
    List,
    /// List the mailboxes of an account
    Mailboxes {
        username: String,
    },
    /// Delete read messages
    PurgeRead {
        /// Limit to one account
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Delete all messages
    PurgeAll {
        /// Limit to one account
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Show index statistics
    Stat,
    /// Run one retention cycle
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = if Path::new(&cli.config).exists() {
        Config::from_file(&cli.config)?
    } else {
        Config::default()
    };
    let engine = Engine::open(&config).await?;

    match cli.command {
        Commands::Provision { username } => {
            let account = engine.provision(&username).await?;
            println!("✓ Account {} created", account.username);
        }
        Commands::Delete { username } => {
            engine.delete_account(&username).await?;
            println!("✓ Account {} deleted", username);
        }
        Commands::List => {
            let accounts = engine.index().list_accounts().await?;
            if accounts.is_empty() {
                println!("No accounts found");
            } else {
                for account in accounts {
                    let login = account
                        .first_login_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  {}  created {}  first login {}",
                        account.username,
                        account.created_at.to_rfc3339(),
                        login
                    );
                }
            }
        }
        Commands::Mailboxes { username } => {
            for mailbox in engine.list_mailboxes(&username).await? {
                println!(
                    "  {}  uidvalidity {}  next uid {}  modseq {}",
                    mailbox.name, mailbox.uid_validity, mailbox.next_uid, mailbox.highest_modseq
                );
            }
        }
        Commands::PurgeRead { user } => {
            let summary = engine.purge_read(user.as_deref()).await?;
            println!(
                "✓ Removed {} read message(s) from {} mailbox(es)",
                summary.messages, summary.mailboxes
            );
        }
        Commands::PurgeAll { user } => {
            let summary = engine.purge_all(user.as_deref()).await?;
            println!(
                "✓ Removed {} message(s) from {} mailbox(es)",
                summary.messages, summary.mailboxes
            );
        }
        Commands::Stat => {
            let stats = engine.stats().await?;
            println!("Accounts:  {}", stats.accounts);
            println!("Mailboxes: {}", stats.mailboxes);
            println!("Messages:  {}", stats.messages);
            println!("Size:      {} bytes", stats.total_size);
        }
        Commands::Sweep => {
            let auth: Option<Arc<dyn AuthStore>> = match &config.retention.auth_store {
                Some(dsn) => Some(Arc::new(SqlAuthStore::connect(dsn).await?)),
                None => None,
            };
            let retention = engine.retention(RetentionConfig::from(&config.retention), auth);
            match retention.run_once(chrono::Utc::now()).await {
                Some(report) => println!(
                    "✓ Sweep done: {} message(s) expired, {} account(s) deleted, {} orphan(s) reclaimed, {} failure(s)",
                    report.messages_expired,
                    report.accounts_deleted,
                    report.orphans_reclaimed,
                    report.failures
                ),
                None => println!("A sweep is already running"),
            }
        }
    }

    Ok(())
}
