// 📥 Backfill Executor - Write event-log entries for missing legacy dates
//
// One entry per date, stamped at midnight UTC, committed in bounded batches,
// one batch after another. A failed batch ends the run; whatever committed
// before it stays committed. There is no retry and no rollback: the caller
// re-runs the analyzer and backfills whatever is still missing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::category::Category;
use crate::error::FailureKind;
use crate::store::{parse_calendar_date, BatchOutcome, EventLogEntry, EventLogStore};

/// Batch cap used when nothing else is configured
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

// ============================================================================
// BACKFILL RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillResult {
    pub user_id: String,
    pub category: Category,

    /// Dates whose entries are now in the event log
    pub committed_dates: Vec<String>,

    pub batches_committed: usize,

    /// 1-based index of the batch that failed, if any
    pub failed_at: Option<usize>,
    pub failure_kind: Option<FailureKind>,
    pub failure_reason: Option<String>,

    /// Dates that are not valid `YYYY-MM-DD` and were never written
    pub skipped_dates: Vec<String>,
}

impl BackfillResult {
    fn empty(user_id: &str, category: Category) -> Self {
        BackfillResult {
            user_id: user_id.to_string(),
            category,
            committed_dates: Vec::new(),
            batches_committed: 0,
            failed_at: None,
            failure_kind: None,
            failure_reason: None,
            skipped_dates: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }

    pub fn summary(&self) -> String {
        match self.failed_at {
            None => format!(
                "Backfill {} / {}: {} entries written in {} batches",
                self.user_id,
                self.category,
                self.committed_dates.len(),
                self.batches_committed
            ),
            Some(batch) => format!(
                "Backfill {} / {}: {} entries written, stopped at batch {} ({})",
                self.user_id,
                self.category,
                self.committed_dates.len(),
                batch,
                self.failure_reason.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

// ============================================================================
// BACKFILL EXECUTOR
// ============================================================================

pub struct BackfillExecutor<'a, E: EventLogStore + ?Sized> {
    store: &'a E,
    max_batch_size: usize,
}

impl<'a, E: EventLogStore + ?Sized> BackfillExecutor<'a, E> {
    pub fn new(store: &'a E) -> Self {
        Self::with_batch_size(store, DEFAULT_MAX_BATCH_SIZE)
    }

    pub fn with_batch_size(store: &'a E, max_batch_size: usize) -> Self {
        BackfillExecutor {
            store,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Insert one entry per missing date
    ///
    /// Does not look for existing entries. Pass the `missing_dates` of a
    /// fresh report, or the same dates will be written twice.
    pub fn backfill(&self, user_id: &str, category: Category, missing_dates: &[String]) -> BackfillResult {
        let mut result = BackfillResult::empty(user_id, category);
        if missing_dates.is_empty() {
            return result;
        }

        let (entries, dates) = self.plan(user_id, category, missing_dates, &mut result.skipped_dates);
        if !result.skipped_dates.is_empty() {
            tracing::warn!(
                user_id,
                %category,
                skipped = ?result.skipped_dates,
                "skipping legacy dates that are not YYYY-MM-DD"
            );
        }

        tracing::info!(
            user_id,
            %category,
            entries = entries.len(),
            max_batch_size = self.max_batch_size,
            "starting backfill"
        );

        let outcomes = self.store.batch_insert(&entries, self.max_batch_size);

        // Batches are contiguous chunks, so the committed prefix maps
        // straight back onto `dates`.
        let mut committed = 0;
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Committed { operations, .. } => {
                    committed += operations;
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
        result.committed_dates = dates[..committed].to_vec();

        if result.is_complete() {
            tracing::info!(user_id, %category, written = committed, "backfill complete");
        } else {
            tracing::warn!(
                user_id,
                %category,
                written = committed,
                failed_at = ?result.failed_at,
                kind = ?result.failure_kind,
                "backfill stopped early; re-run analysis to pick up the remainder"
            );
        }

        result
    }

    /// Build the entries to write, one per unique (date, category)
    fn plan(
        &self,
        user_id: &str,
        category: Category,
        missing_dates: &[String],
        skipped: &mut Vec<String>,
    ) -> (Vec<EventLogEntry>, Vec<String>) {
        let mut seen: HashSet<(&str, Category)> = HashSet::new();
        let mut entries = Vec::new();
        let mut dates = Vec::new();

        for date in missing_dates {
            if !seen.insert((date.as_str(), category)) {
                continue;
            }
            match parse_calendar_date(date) {
                Some(parsed) => {
                    entries.push(EventLogEntry::for_legacy_date(user_id, category, parsed));
                    dates.push(date.clone());
                }
                None => skipped.push(date.clone()),
            }
        }

        (entries, dates)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn dates(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    fn create_test_dates(count: usize) -> Vec<String> {
        let start = chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        (0..count)
            .map(|i| {
                (start + chrono::Duration::days(i as i64))
                    .format("%Y-%m-%d")
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_backfill_single_date_at_midnight_utc() {
        let store = InMemoryStore::new();
        let executor = BackfillExecutor::new(&store);

        let result = executor.backfill("user-1", Category::MastOnly, &dates(&["2024-01-02"]));

        assert!(result.is_complete());
        assert_eq!(result.committed_dates, dates(&["2024-01-02"]));
        assert_eq!(result.batches_committed, 1);

        let entries = store.entries("user-1", Category::MastOnly);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp.to_rfc3339(), "2024-01-02T00:00:00+00:00");
        assert_eq!(entries[0].category, Category::MastOnly);
        assert_eq!(entries[0].user_id, "user-1");

        println!("✅ Test passed: {}", result.summary());
    }

    #[test]
    fn test_backfill_empty_input_is_noop() {
        let store = InMemoryStore::new();
        let executor = BackfillExecutor::new(&store);

        let result = executor.backfill("user-1", Category::Relapse, &[]);

        assert!(result.is_complete());
        assert!(result.committed_dates.is_empty());
        assert_eq!(result.batches_committed, 0);
        assert_eq!(store.insert_batches_attempted(), 0);
    }

    #[test]
    fn test_backfill_dedupes_repeats_within_run() {
        let store = InMemoryStore::new();
        let executor = BackfillExecutor::new(&store);

        let result = executor.backfill(
            "user-1",
            Category::Relapse,
            &dates(&["2024-01-01", "2024-01-02", "2024-01-01"]),
        );

        assert_eq!(result.committed_dates, dates(&["2024-01-01", "2024-01-02"]));
        assert_eq!(store.entry_count(), 2);
    }

    #[test]
    fn test_backfill_skips_malformed_dates() {
        let store = InMemoryStore::new();
        let executor = BackfillExecutor::new(&store);

        let result = executor.backfill(
            "user-1",
            Category::PornOnly,
            &dates(&["2024-01-01", "not-a-date", "2024-1-2"]),
        );

        assert!(result.is_complete());
        assert_eq!(result.committed_dates, dates(&["2024-01-01"]));
        assert_eq!(result.skipped_dates, dates(&["not-a-date", "2024-1-2"]));
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_backfill_batches_at_cap() {
        let store = InMemoryStore::new();
        let executor = BackfillExecutor::with_batch_size(&store, 500);

        let result = executor.backfill("user-1", Category::Relapse, &create_test_dates(1200));

        assert!(result.is_complete());
        assert_eq!(result.batches_committed, 3);
        assert_eq!(result.committed_dates.len(), 1200);
        assert_eq!(store.insert_batches_attempted(), 3);
    }

    #[test]
    fn test_backfill_partial_failure_keeps_earlier_batches() {
        let store = InMemoryStore::new();
        store.fail_insert_batch(2);
        let executor = BackfillExecutor::with_batch_size(&store, 500);
        let missing = create_test_dates(1200);

        let result = executor.backfill("user-1", Category::Relapse, &missing);

        assert_eq!(result.failed_at, Some(2));
        assert_eq!(result.failure_kind, Some(FailureKind::StoreUnavailable));
        assert!(result.failure_reason.is_some());
        assert_eq!(result.batches_committed, 1);
        assert_eq!(result.committed_dates, missing[..500].to_vec());
        // Batch 3 is never attempted
        assert_eq!(store.insert_batches_attempted(), 2);
        assert_eq!(store.entry_count(), 500);

        println!("✅ Test passed: {}", result.summary());
    }

    #[test]
    fn test_backfill_first_batch_failure_writes_nothing() {
        let store = InMemoryStore::new();
        store.fail_insert_batch(1);
        let executor = BackfillExecutor::with_batch_size(&store, 2);

        let result = executor.backfill(
            "user-1",
            Category::Relapse,
            &dates(&["2024-01-01", "2024-01-02", "2024-01-03"]),
        );

        assert_eq!(result.failed_at, Some(1));
        assert!(result.committed_dates.is_empty());
        assert_eq!(store.entry_count(), 0);
    }

    #[test]
    fn test_backfill_outage_and_rejection_are_distinguishable() {
        let sqlite = crate::db::SqliteStore::open_in_memory().unwrap();
        let existing = EventLogEntry::for_legacy_date(
            "user-1",
            Category::Relapse,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        sqlite.append_entry(&existing).unwrap();

        // Re-inserting a stored id trips the primary key
        let rejected = sqlite.batch_insert(&[existing.clone()], 10);
        assert!(matches!(
            rejected[0],
            BatchOutcome::Failed {
                kind: FailureKind::Rejected,
                ..
            }
        ));

        let store = InMemoryStore::new();
        store.set_unavailable(true);
        let result =
            BackfillExecutor::new(&store).backfill("user-1", Category::Relapse, &dates(&["2024-01-01"]));

        assert_eq!(result.failed_at, Some(1));
        assert_eq!(result.failure_kind, Some(FailureKind::StoreUnavailable));
        assert!(result.committed_dates.is_empty());
    }
}
