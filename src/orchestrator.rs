// 🎛️ Reconciliation Orchestrator - Per-category report, backfill and prune
//
// Every action is fetch → compute → (optionally) write → done. Nothing is
// cached between calls and a mutating action never refreshes the report:
// the caller asks for a new one when it wants to see the effect.
//
// Concurrency: at most one backfill and one prune per (user, category) at a
// time. A second request for the same pair is rejected, not queued.
// Separate invocations are not otherwise coordinated: two operators
// backfilling through different processes can still race at the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::backfill::{BackfillExecutor, BackfillResult, DEFAULT_MAX_BATCH_SIZE};
use crate::category::Category;
use crate::config::Config;
use crate::deduplication::{DuplicatePruner, PruneResult};
use crate::error::ReconcileError;
use crate::reconciliation::{ObservationScope, ReconciliationAnalyzer, ReconciliationReport};
use crate::store::{EventLogStore, LegacyRecordStore};

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub max_batch_size: usize,
    pub scope: ObservationScope,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        ReconcileSettings {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            scope: ObservationScope::default(),
        }
    }
}

impl From<&Config> for ReconcileSettings {
    fn from(config: &Config) -> Self {
        ReconcileSettings {
            max_batch_size: config.store.max_batch_size,
            scope: config.analysis.observation_scope,
        }
    }
}

// ============================================================================
// USER SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: Category,
    /// Distinct dates covered by the event log
    pub migrated: usize,
    /// Distinct legacy dates still without an entry
    pub missing: usize,
    /// Surplus entries (duplicate_count)
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: String,
    pub categories: Vec<CategorySummary>,
    pub total_migrated: usize,
    pub total_missing: usize,
    pub total_duplicates: usize,
    pub generated_at: DateTime<Utc>,
}

impl UserSummary {
    pub fn from_reports(user_id: &str, reports: &[ReconciliationReport]) -> Self {
        let categories: Vec<CategorySummary> = reports
            .iter()
            .map(|r| CategorySummary {
                category: r.category,
                migrated: r.unique_entries,
                missing: r.distinct_missing().len(),
                duplicates: r.duplicate_count,
            })
            .collect();

        UserSummary {
            user_id: user_id.to_string(),
            total_migrated: categories.iter().map(|c| c.migrated).sum(),
            total_missing: categories.iter().map(|c| c.missing).sum(),
            total_duplicates: categories.iter().map(|c| c.duplicates).sum(),
            categories,
            generated_at: Utc::now(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} migrated, {} missing, {} duplicates across {} categories",
            self.user_id,
            self.total_migrated,
            self.total_missing,
            self.total_duplicates,
            self.categories.len()
        )
    }
}

// ============================================================================
// IN-FLIGHT GUARD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Backfill,
    Prune,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Backfill => "backfill",
            Operation::Prune => "prune",
        }
    }
}

type OperationKey = (String, Category, Operation);

#[derive(Default)]
struct InFlight {
    active: Mutex<HashSet<OperationKey>>,
}

impl InFlight {
    fn acquire(
        &self,
        user_id: &str,
        category: Category,
        operation: Operation,
    ) -> Result<OperationGuard<'_>, ReconcileError> {
        let key = (user_id.to_string(), category, operation);
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if !active.insert(key.clone()) {
            return Err(ReconcileError::OperationInProgress {
                user_id: user_id.to_string(),
                category,
                operation: operation.as_str(),
            });
        }
        Ok(OperationGuard {
            registry: self,
            key: Some(key),
        })
    }
}

/// Releases its (user, category, operation) slot on drop
struct OperationGuard<'a> {
    registry: &'a InFlight,
    key: Option<OperationKey>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut active = self.registry.active.lock().unwrap_or_else(|p| p.into_inner());
            active.remove(&key);
        }
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct ReconciliationOrchestrator<L: LegacyRecordStore + ?Sized, E: EventLogStore + ?Sized> {
    legacy: Arc<L>,
    events: Arc<E>,
    settings: ReconcileSettings,
    in_flight: InFlight,
}

impl<L: LegacyRecordStore + ?Sized, E: EventLogStore + ?Sized> ReconciliationOrchestrator<L, E> {
    pub fn new(legacy: Arc<L>, events: Arc<E>, settings: ReconcileSettings) -> Self {
        ReconciliationOrchestrator {
            legacy,
            events,
            settings,
            in_flight: InFlight::default(),
        }
    }

    pub fn settings(&self) -> ReconcileSettings {
        self.settings
    }

    /// Fresh report from freshly fetched legacy and event-log data
    pub fn get_report(
        &self,
        user_id: &str,
        category: Category,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let legacy_dates = self.legacy.legacy_dates(user_id, category)?;
        let entries = self.events.query_entries(user_id, category)?;

        let report = ReconciliationAnalyzer::with_scope(self.settings.scope).analyze(
            user_id,
            category,
            &legacy_dates,
            &entries,
        );
        tracing::debug!(
            user_id,
            %category,
            missing = report.missing_dates.len(),
            duplicates = report.duplicate_count,
            "report computed"
        );
        Ok(report)
    }

    /// One report per category
    pub fn get_reports(&self, user_id: &str) -> Result<Vec<ReconciliationReport>, ReconcileError> {
        Category::ALL
            .iter()
            .map(|category| self.get_report(user_id, *category))
            .collect()
    }

    pub fn summary(&self, user_id: &str) -> Result<UserSummary, ReconcileError> {
        let reports = self.get_reports(user_id)?;
        Ok(UserSummary::from_reports(user_id, &reports))
    }

    /// Analyze, then write entries for every missing date
    pub fn run_backfill(
        &self,
        user_id: &str,
        category: Category,
    ) -> Result<BackfillResult, ReconcileError> {
        let _guard = self.in_flight.acquire(user_id, category, Operation::Backfill)?;

        let report = self.get_report(user_id, category)?;
        let executor = BackfillExecutor::with_batch_size(self.events.as_ref(), self.settings.max_batch_size);
        Ok(executor.backfill(user_id, category, &report.missing_dates))
    }

    /// Analyze, then collapse every duplicate date to one entry
    pub fn run_prune(&self, user_id: &str, category: Category) -> Result<PruneResult, ReconcileError> {
        let _guard = self.in_flight.acquire(user_id, category, Operation::Prune)?;

        let report = self.get_report(user_id, category)?;
        let pruner = DuplicatePruner::with_batch_size(self.events.as_ref(), self.settings.max_batch_size);
        pruner.prune(user_id, category, &report.duplicate_dates)
    }
}

// ============================================================================
// TESTS
// ============================================================================
