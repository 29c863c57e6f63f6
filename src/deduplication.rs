// 🔍 Duplicate Pruner - Collapse repeated event-log entries to one per date
//
// Retention rule: per calendar date (UTC), keep the entry with the earliest
// timestamp; on equal timestamps keep the smallest id. Every other entry on
// that date is deleted, in bounded batches committed one after another.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::backfill::DEFAULT_MAX_BATCH_SIZE;
use crate::category::Category;
use crate::error::{FailureKind, ReconcileError};
use crate::store::{BatchOutcome, EventLogEntry, EventLogStore};

// ============================================================================
// PRUNE RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneResult {
    pub user_id: String,
    pub category: Category,

    /// Entries removed by committed batches
    pub deleted_count: usize,

    /// Entry kept for each pruned date
    pub retained_ids: Vec<String>,

    pub batches_committed: usize,

    /// 1-based index of the batch that failed, if any
    pub failed_at: Option<usize>,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,
}

impl PruneResult {
    fn empty(user_id: &str, category: Category) -> Self {
        PruneResult {
            user_id: user_id.to_string(),
            category,
            deleted_count: 0,
            retained_ids: Vec::new(),
            batches_committed: 0,
            failed_at: None,
            failure_kind: None,
            failure_reason: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }

    pub fn summary(&self) -> String {
        match self.failed_at {
            None => format!(
                "Prune {} / {}: {} duplicates deleted, {} dates now unique",
                self.user_id,
                self.category,
                self.deleted_count,
                self.retained_ids.len()
            ),
            Some(batch) => format!(
                "Prune {} / {}: {} duplicates deleted, stopped at batch {} ({})",
                self.user_id,
                self.category,
                self.deleted_count,
                batch,
                self.failure_reason.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

// ============================================================================
// DUPLICATE PRUNER
// ============================================================================

pub struct DuplicatePruner<'a, E: EventLogStore + ?Sized> {
    store: &'a E,
    max_batch_size: usize,
}

impl<'a, E: EventLogStore + ?Sized> DuplicatePruner<'a, E> {
    pub fn new(store: &'a E) -> Self {
        Self::with_batch_size(store, DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_batch_size(store: &'a E, max_batch_size: usize) -> Self {
        DuplicatePruner {
            store,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Delete all but one entry on each of `duplicate_dates`
    pub fn prune(
        &self,
        user_id: &str,
        category: Category,
        duplicate_dates: &[String],
    ) -> Result<PruneResult, ReconcileError> {
        let mut result = PruneResult::empty(user_id, category);
        if duplicate_dates.is_empty() {
            return Ok(result);
        }

        let entries = self.store.query_entries(user_id, category)?;
        let (retained, doomed) = select_for_deletion(&entries, duplicate_dates);
        result.retained_ids = retained;

        tracing::info!(
            user_id,
            %category,
            dates = result.retained_ids.len(),
            deletions = doomed.len(),
            max_batch_size = self.max_batch_size,
            "starting duplicate prune"
        );

        let outcomes = self
            .store
            .batch_delete(user_id, category, &doomed, self.max_batch_size);
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Committed { operations, .. } => {
                    result.deleted_count += operations;
                    result.batches_committed += 1;
                }
                BatchOutcome::Failed { index, kind, reason, .. } => {
                    result.failed_at = Some(index);
                    result.failure_kind = Some(kind);
                    result.failure_reason = Some(reason);
                    break;
                }
            }
        }

        if result.is_complete() {
            tracing::info!(user_id, %category, deleted = result.deleted_count, "prune complete");
        } else {
            tracing::warn!(
                user_id,
                %category,
                deleted = result.deleted_count,
                failed_at = ?result.failed_at,
                kind = ?result.failure_kind,
                "prune stopped early; re-run analysis to pick up the remainder"
            );
        }

        Ok(result)
    }
}

/// Split the entries on `dates` into (retained ids, ids to delete)
///
/// Retained ids come out in ascending date order; deletions are grouped by
/// date in the same order.
pub fn select_for_deletion(entries: &[EventLogEntry], dates: &[String]) -> (Vec<String>, Vec<String>) {
    let wanted: HashSet<&str> = dates.iter().map(String::as_str).collect();

    let mut by_date: BTreeMap<String, Vec<&EventLogEntry>> = BTreeMap::new();
    for entry in entries {
        let date = entry.calendar_date();
        if wanted.contains(date.as_str()) {
            by_date.entry(date).or_default().push(entry);
        }
    }

    let mut retained = Vec::new();
    let mut doomed = Vec::new();
    for group in by_date.values_mut() {
        group.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        if let Some((keep, rest)) = group.split_first() {
            retained.push(keep.id.clone());
            doomed.extend(rest.iter().map(|e| e.id.clone()));
        }
    }

    (retained, doomed)
}

// ============================================================================
// TESTS
// ============================================================================
