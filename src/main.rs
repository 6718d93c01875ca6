//! # MailVault CLI (`mvault`)
//!
//! The `mvault` binary is the primary interface for MailVault. It provides
//! commands for database initialization, snapshot collection, snapshot
//! browsing, tenant registry management, and starting the HTTP API server.
//!
//! ## Usage
//!
//! ```bash
//! mvault --config ./config/mailvault.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mvault init` | Create the SQLite database and run schema migrations |
//! | `mvault snapshot` | Collect all tenants and persist one deduplicated snapshot |
//! | `mvault snapshots` | List recent snapshots |
//! | `mvault show <id>` | Show the messages first seen in a snapshot |
//! | `mvault tenants list` | List registered tenants |
//! | `mvault tenants add` | Register a tenant |
//! | `mvault tenants remove <id>` | Deactivate a tenant |
//! | `mvault serve` | Start the JSON HTTP API (and scheduler, if enabled) |

mod auth;
mod collector;
mod config;
mod db;
mod error;
mod graph;
mod hash;
mod indexer;
mod migrate;
mod models;
mod paginator;
mod progress;
mod runner;
mod scheduler;
mod server;
mod store;
mod task;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::models::Tenant;
use crate::progress::ProgressMode;
use crate::runner::RunOptions;
use crate::store::SnapshotStore;
use crate::task::{TaskRegistry, TaskState};

/// MailVault CLI — snapshot-based mailbox collection and archival.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/mailvault.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "mvault",
    about = "MailVault — snapshot-based mailbox collection and archival for Microsoft 365 tenants",
    version,
    long_about = "MailVault harvests mailbox data from a remote paginated mail API per tenant and \
    per user, and persists the results as immutable, globally deduplicated snapshots. \
    Runs are tracked by a task state machine observable from the CLI and the HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mailvault.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (snapshots,
    /// messages, tenants). Idempotent — running it multiple times is safe.
    Init,

    /// Collect all configured tenants and persist one snapshot.
    ///
    /// Acquires a token per tenant, enumerates mailbox-bearing users, pages
    /// their message listings up to the per-user quota, and stores the
    /// aggregated batch as a single deduplicated snapshot.
    Snapshot {
        /// Label recorded on the snapshot row.
        #[arg(long)]
        label: Option<String>,

        /// Collect only the named tenant.
        #[arg(long)]
        tenant: Option<String>,

        /// Override the per-mailbox message quota for this run.
        #[arg(long)]
        mails_per_user: Option<u64>,

        /// Skip attachment fetching for this run.
        #[arg(long)]
        no_attachments: bool,

        /// Progress output on stderr: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// List recent snapshots.
    Snapshots {
        /// Maximum number of snapshots to list.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },

    /// Show the messages first seen in a snapshot.
    Show {
        /// Snapshot id.
        id: i64,
    },

    /// Manage the tenant registry.
    Tenants {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Start the JSON HTTP API server.
    ///
    /// Also starts the background scheduler when `[scheduler].enabled` is
    /// set in the config.
    Serve,
}

/// Tenant registry subcommands.
#[derive(Subcommand)]
enum TenantAction {
    /// List active tenants (secrets are never printed).
    List,
    /// Register a tenant.
    Add {
        /// Display name, used to label collected messages.
        name: String,
        /// Directory (tenant) id.
        #[arg(long)]
        tenant_id: String,
        /// Application (client) id.
        #[arg(long)]
        client_id: String,
        /// Client secret. Prefer passing via environment in scripts.
        #[arg(long)]
        client_secret: String,
    },
    /// Deactivate a tenant (soft delete; its snapshots are kept).
    Remove {
        /// Registry id, as shown by `mvault tenants list`.
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailvault=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized successfully.");
        }

        Commands::Snapshot {
            label,
            tenant,
            mails_per_user,
            no_attachments,
            progress,
        } => {
            let mode = match progress.as_str() {
                "auto" => ProgressMode::default_for_tty(),
                other => ProgressMode::parse(other)
                    .ok_or_else(|| anyhow::anyhow!("invalid progress mode: {}", other))?,
            };

            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = SnapshotStore::new(pool.clone());
            let indexer = indexer::create_indexer(&cfg.indexer)?;
            let registry = TaskRegistry::new();
            let task = registry.create();
            let printer = progress::spawn_printer(mode, &task);

            let opts = RunOptions {
                label,
                tenant,
                mails_per_user,
                include_attachments: if no_attachments { Some(false) } else { None },
            };

            runner::run_collection(
                Arc::new(cfg),
                store,
                indexer,
                task.clone(),
                opts,
            )
            .await;

            if let Some(printer) = printer {
                let _ = printer.await;
            }

            match task.status().state {
                TaskState::Success { result } => {
                    println!("snapshot {}", result["snapshot_id"]);
                    println!("  collected: {} messages", result["messages_collected"]);
                    println!("  inserted:  {} messages", result["messages_inserted"]);
                    if let Some(tenants) = result["tenants"].as_array() {
                        for t in tenants {
                            let errors = t["errors"].as_array().map(Vec::len).unwrap_or(0);
                            println!(
                                "  tenant {}: {} messages, {} errors",
                                t["name"].as_str().unwrap_or("?"),
                                t["messages"],
                                errors
                            );
                        }
                    }
                    println!("ok");
                }
                TaskState::Failure { error } => {
                    eprintln!("Error: {}", error);
                    pool.close().await;
                    std::process::exit(1);
                }
                _ => unreachable!("run_collection always terminates the task"),
            }

            pool.close().await;
        }

        Commands::Snapshots { limit } => {
            let pool = db::connect(&cfg).await?;
            let store = SnapshotStore::new(pool.clone());
            let snapshots = store.list_snapshots(limit).await?;
            println!("{:<6} {:<22} {:>9}   LABEL", "ID", "CREATED", "MESSAGES");
            for snap in &snapshots {
                println!(
                    "{:<6} {:<22} {:>9}   {}",
                    snap.id,
                    snap.created_at,
                    snap.message_count,
                    snap.label.as_deref().unwrap_or("-")
                );
            }
            pool.close().await;
        }

        Commands::Show { id } => {
            let pool = db::connect(&cfg).await?;
            let store = SnapshotStore::new(pool.clone());
            let messages = match store.snapshot_messages(id).await? {
                Some(messages) => messages,
                None => {
                    eprintln!("Error: no snapshot with id {}", id);
                    pool.close().await;
                    std::process::exit(1);
                }
            };
            println!("--- Snapshot {} ({} messages) ---", id, messages.len());
            for msg in &messages {
                println!(
                    "[{}] {}  {}  {}",
                    msg.id,
                    msg.received_at.as_deref().unwrap_or("-"),
                    msg.from_address.as_deref().unwrap_or("-"),
                    msg.subject.as_deref().unwrap_or("(no subject)")
                );
            }
            pool.close().await;
        }

        Commands::Tenants { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = SnapshotStore::new(pool.clone());
            match action {
                TenantAction::List => {
                    let tenants = store.list_tenants().await?;
                    println!("{:<6} {:<20} {:<38} CLIENT", "ID", "NAME", "TENANT");
                    for t in &tenants {
                        println!("{:<6} {:<20} {:<38} {}", t.id, t.name, t.tenant_id, t.client_id);
                    }
                }
                TenantAction::Add {
                    name,
                    tenant_id,
                    client_id,
                    client_secret,
                } => {
                    let id = store
                        .create_tenant(&Tenant {
                            name,
                            tenant_id,
                            client_id,
                            client_secret,
                        })
                        .await?;
                    println!("Tenant registered with id {}.", id);
                }
                TenantAction::Remove { id } => {
                    if store.deactivate_tenant(id).await? {
                        println!("Tenant {} deactivated.", id);
                    } else {
                        eprintln!("Error: no active tenant with id {}", id);
                        pool.close().await;
                        std::process::exit(1);
                    }
                }
            }
            pool.close().await;
        }

        Commands::Serve => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = SnapshotStore::new(pool);
            let indexer = indexer::create_indexer(&cfg.indexer)?;
            let tasks = Arc::new(TaskRegistry::new());
            let cfg = Arc::new(cfg);

            scheduler::start(cfg.clone(), store.clone(), indexer.clone(), tasks.clone());
            server::run_server(cfg, store, tasks, indexer).await?;
        }
    }

    Ok(())
}
