// History Reconcile - Core Library
// Legacy date lists → canonical event log: analysis, backfill, duplicate pruning.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod category;
pub mod error;
pub mod config;
pub mod store;          // Store interfaces + in-memory store
pub mod db;             // SQLite store
pub mod reconciliation; // Analyzer
pub mod backfill;       // Backfill executor
pub mod deduplication;  // Duplicate pruner
pub mod orchestrator;

// Re-export commonly used types
pub use category::Category;
pub use error::{FailureKind, ReconcileError, StoreError};
pub use config::{AnalysisConfig, Config, ServerConfig, StoreConfig};
pub use store::{
    BatchOutcome, EventLogEntry, EventLogStore, InMemoryStore, LegacyRecordStore,
    commit_in_batches, midnight_utc, parse_calendar_date, DATE_FORMAT,
};
pub use db::{
    AuditEvent, LegacyRow, SqliteStore,
    insert_audit_event, load_legacy_csv, setup_database,
};
pub use reconciliation::{ObservationScope, ReconciliationAnalyzer, ReconciliationReport};
pub use backfill::{BackfillExecutor, BackfillResult, DEFAULT_MAX_BATCH_SIZE};
pub use deduplication::{DuplicatePruner, PruneResult, select_for_deletion};
pub use orchestrator::{
    CategorySummary, Operation, ReconcileSettings, ReconciliationOrchestrator, UserSummary,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
