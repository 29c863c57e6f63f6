use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use history_reconcile::{
    load_legacy_csv, Category, Config, ReconcileSettings, ReconciliationOrchestrator,
    ReconciliationReport, SqliteStore,
};

#[derive(Parser)]
#[command(name = "history-reconcile", version, about = "Reconcile legacy date lists with the event log")]
struct Cli {
    /// Config file (defaults to $RECONCILE_CONFIG, then ./reconcile.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a legacy export (user_id,category,date) into the database
    ImportLegacy { csv: PathBuf },

    /// Show the reconciliation report for one or all categories
    Report {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Option<Category>,
    },

    /// Totals across all categories
    Summary {
        #[arg(long)]
        user: String,
    },

    /// Write event-log entries for missing legacy dates
    Backfill {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Category,
    },

    /// Delete duplicate event-log entries, keeping one per date
    Prune {
        #[arg(long)]
        user: String,
        #[arg(long)]
        category: Category,
    },

    /// Show the audit trail of committed batches
    Audit {
        #[arg(long)]
        user: String,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store.db_path = db;
    }

    let store = Arc::new(
        SqliteStore::open(&config.store.db_path)
            .with_context(|| format!("Failed to open {}", config.store.db_path.display()))?,
    );
    let orchestrator = ReconciliationOrchestrator::new(
        store.clone(),
        store.clone(),
        ReconcileSettings::from(&config),
    );

    match cli.command {
        Command::ImportLegacy { csv } => {
            println!("📂 Loading legacy export...");
            let rows = load_legacy_csv(&csv)?;
            let imported = store.import_legacy_rows(&rows)?;
            println!("✓ Imported {} legacy dates", imported);
        }
        Command::Report { user, category } => {
            let reports = match category {
                Some(category) => vec![orchestrator.get_report(&user, category)?],
                None => orchestrator.get_reports(&user)?,
            };
            if cli.json {
                print_json(&reports)?;
            } else {
                reports.iter().for_each(print_report);
            }
        }
        Command::Summary { user } => {
            let summary = orchestrator.summary(&user)?;
            if cli.json {
                print_json(&summary)?;
            } else {
                println!("{}", summary.summary());
                for c in &summary.categories {
                    println!(
                        "  {:<10} migrated {:>5}  missing {:>5}  duplicates {:>5}",
                        c.category.as_str(),
                        c.migrated,
                        c.missing,
                        c.duplicates
                    );
                }
            }
        }
        Command::Backfill { user, category } => {
            let result = orchestrator.run_backfill(&user, category)?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("{}", result.summary());
                if !result.skipped_dates.is_empty() {
                    println!("⚠️  Skipped malformed dates: {:?}", result.skipped_dates);
                }
            }
            if !result.is_complete() {
                eprintln!("❌ Backfill incomplete. Run `report` to see what is still missing.");
                std::process::exit(2);
            }
        }
        Command::Prune { user, category } => {
            let result = orchestrator.run_prune(&user, category)?;
            if cli.json {
                print_json(&result)?;
            } else {
                println!("{}", result.summary());
            }
            if !result.is_complete() {
                eprintln!("❌ Prune incomplete. Run `report` to see what is still duplicated.");
                std::process::exit(2);
            }
        }
        Command::Audit { user } => {
            let events = store.audit_events(&user)?;
            if cli.json {
                print_json(&events)?;
            } else {
                for event in &events {
                    println!(
                        "{}  {:<20} {:<18} {}",
                        event.timestamp.to_rfc3339(),
                        event.event_type,
                        event.actor,
                        event.data
                    );
                }
                println!("✓ {} audit events", events.len());
            }
        }
    }

    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());
    if !report.missing_dates.is_empty() {
        println!("  missing:    {}", report.distinct_missing().join(", "));
    }
    if !report.duplicate_dates.is_empty() {
        println!("  duplicates: {}", report.duplicate_dates.join(", "));
    }
    println!("  generated:  {}", report.generated_at.to_rfc3339());
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RECONCILE_LOG")
        .unwrap_or_else(|_| EnvFilter::new("history_reconcile=info,warn"));

    let format = env::var("RECONCILE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    // Logs go to stderr so --json output stays parseable
    let registry = tracing_subscriber::registry().with(filter);
    match format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}
