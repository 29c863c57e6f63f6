// 🗃️ Store Interfaces - What the engine needs from its data stores
//
// Two collaborators, injected into the orchestrator:
//   LegacyRecordStore → read-only per-user, per-category legacy date lists
//   EventLogStore     → query / bulk insert / bulk delete of event-log entries
//
// Bulk writes are split into batches no larger than the store's operation cap
// and committed one after another. The first failed batch ends the sequence:
// earlier batches stay committed, later ones are never attempted.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::category::Category;
use crate::error::{FailureKind, StoreError};

/// Calendar-date format shared by the legacy lists and the event log
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` string, rejecting anything that does not format back
/// to the same text (e.g. `2024-1-5`), since such a string can never match an
/// observed date.
pub fn parse_calendar_date(date: &str) -> Option<NaiveDate> {
    let parsed = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;
    (parsed.format(DATE_FORMAT).to_string() == date).then_some(parsed)
}

/// Canonical instant for a legacy date: midnight UTC
pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

// ============================================================================
// EVENT LOG ENTRY
// ============================================================================

/// One canonical, immutable history record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub category: Category,
}

impl EventLogEntry {
    pub fn new(user_id: &str, category: Category, timestamp: DateTime<Utc>) -> Self {
        EventLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            timestamp,
            category,
        }
    }

    /// Entry for a legacy date, stamped at midnight UTC
    pub fn for_legacy_date(user_id: &str, category: Category, date: NaiveDate) -> Self {
        Self::new(user_id, category, midnight_utc(date))
    }

    /// UTC calendar date of this entry, as `YYYY-MM-DD`
    pub fn calendar_date(&self) -> String {
        self.timestamp.date_naive().format(DATE_FORMAT).to_string()
    }
}

// ============================================================================
// BATCH OUTCOME
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Batch committed atomically
    Committed { index: usize, operations: usize },

    /// Batch rejected; nothing from it was applied
    Failed {
        index: usize,
        operations: usize,
        kind: FailureKind,
        reason: String,
    },
}

impl BatchOutcome {
    /// 1-based position of the batch in its sequence
    pub fn index(&self) -> usize {
        match self {
            BatchOutcome::Committed { index, .. } | BatchOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, BatchOutcome::Committed { .. })
    }
}

/// Commit `items` in chunks of at most `max_batch_size`, sequentially,
/// stopping after the first failed chunk.
pub fn commit_in_batches<T, F>(items: &[T], max_batch_size: usize, mut commit: F) -> Vec<BatchOutcome>
where
    F: FnMut(&[T]) -> Result<(), StoreError>,
{
    let mut outcomes = Vec::new();

    for (i, batch) in items.chunks(max_batch_size.max(1)).enumerate() {
        let index = i + 1;
        match commit(batch) {
            Ok(()) => {
                tracing::debug!(batch = index, operations = batch.len(), "batch committed");
                outcomes.push(BatchOutcome::Committed {
                    index,
                    operations: batch.len(),
                });
            }
            Err(e) => {
                tracing::warn!(batch = index, operations = batch.len(), error = %e, "batch failed");
                outcomes.push(BatchOutcome::Failed {
                    index,
                    operations: batch.len(),
                    kind: e.kind(),
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    outcomes
}

// ============================================================================
// STORE TRAITS
// ============================================================================

/// Read-only source of the legacy date lists
pub trait LegacyRecordStore: Send + Sync {
    /// Dates in legacy order, repeats and all
    fn legacy_dates(&self, user_id: &str, category: Category) -> Result<Vec<String>, StoreError>;
}

/// Canonical per-user event log
pub trait EventLogStore: Send + Sync {
    fn query_entries(&self, user_id: &str, category: Category)
        -> Result<Vec<EventLogEntry>, StoreError>;

    /// Insert one batch atomically
    fn commit_insert(&self, batch: &[EventLogEntry]) -> Result<(), StoreError>;

    /// Delete one batch of entry ids atomically. Only entries belonging to
    /// `user_id` and `category` are removed.
    fn commit_delete(&self, user_id: &str, category: Category, ids: &[String])
        -> Result<(), StoreError>;

    fn batch_insert(&self, entries: &[EventLogEntry], max_batch_size: usize) -> Vec<BatchOutcome> {
        commit_in_batches(entries, max_batch_size, |batch| self.commit_insert(batch))
    }

    fn batch_delete(
        &self,
        user_id: &str,
        category: Category,
        ids: &[String],
        max_batch_size: usize,
    ) -> Vec<BatchOutcome> {
        commit_in_batches(ids, max_batch_size, |batch| {
            self.commit_delete(user_id, category, batch)
        })
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

#[derive(Default)]
struct MemoryState {
    legacy: HashMap<(String, Category), Vec<String>>,
    entries: Vec<EventLogEntry>,
    unavailable: bool,
    insert_calls: usize,
    delete_calls: usize,
    fail_insert_at: Option<usize>,
    fail_delete_at: Option<usize>,
}

/// Both stores held in memory, with fault injection for exercising the
/// partial-failure paths deterministically.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let state = self
            .state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))?;
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(state)
    }

    // Setup helpers ignore the offline flag and recover a poisoned lock.
    fn state_unchecked(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_legacy_dates(&self, user_id: &str, category: Category, dates: Vec<String>) {
        self.state_unchecked()
            .legacy
            .insert((user_id.to_string(), category), dates);
    }

    pub fn add_entry(&self, entry: EventLogEntry) {
        self.state_unchecked().entries.push(entry);
    }

    /// Snapshot of the stored entries for one user and category
    pub fn entries(&self, user_id: &str, category: Category) -> Vec<EventLogEntry> {
        self.state_unchecked()
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.category == category)
            .cloned()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.state_unchecked().entries.len()
    }

    /// Make every store call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state_unchecked().unavailable = unavailable;
    }

    /// The `nth` insert batch committed from now on (1-based) will fail
    pub fn fail_insert_batch(&self, nth: usize) {
        let mut state = self.state_unchecked();
        state.fail_insert_at = Some(state.insert_calls + nth);
    }

    /// The `nth` delete batch committed from now on (1-based) will fail
    pub fn fail_delete_batch(&self, nth: usize) {
        let mut state = self.state_unchecked();
        state.fail_delete_at = Some(state.delete_calls + nth);
    }

    pub fn insert_batches_attempted(&self) -> usize {
        self.state_unchecked().insert_calls
    }

    pub fn delete_batches_attempted(&self) -> usize {
        self.state_unchecked().delete_calls
    }
}

impl LegacyRecordStore for InMemoryStore {
    fn legacy_dates(&self, user_id: &str, category: Category) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        Ok(state
            .legacy
            .get(&(user_id.to_string(), category))
            .cloned()
            .unwrap_or_default())
    }
}

impl EventLogStore for InMemoryStore {
    fn query_entries(
        &self,
        user_id: &str,
        category: Category,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let state = self.state()?;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.user_id == user_id && e.category == category)
            .cloned()
            .collect())
    }

    fn commit_insert(&self, batch: &[EventLogEntry]) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.insert_calls += 1;
        if state.fail_insert_at == Some(state.insert_calls) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on insert batch {}",
                state.insert_calls
            )));
        }
        state.entries.extend_from_slice(batch);
        Ok(())
    }

    fn commit_delete(
        &self,
        user_id: &str,
        category: Category,
        ids: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.delete_calls += 1;
        if state.fail_delete_at == Some(state.delete_calls) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on delete batch {}",
                state.delete_calls
            )));
        }
        state
            .entries
            .retain(|e| !(e.user_id == user_id && e.category == category && ids.contains(&e.id)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_calendar_date_is_strict() {
        assert!(parse_calendar_date("2024-01-05").is_some());
        assert!(parse_calendar_date("2024-1-5").is_none());
        assert!(parse_calendar_date("2024-02-30").is_none());
        assert!(parse_calendar_date("01/05/2024").is_none());
        assert!(parse_calendar_date("").is_none());
    }

    #[test]
    fn test_legacy_entry_is_midnight_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let entry = EventLogEntry::for_legacy_date("u1", Category::Relapse, date);

        assert_eq!(entry.timestamp.to_rfc3339(), "2024-01-02T00:00:00+00:00");
        assert_eq!(entry.calendar_date(), "2024-01-02");
        assert_eq!(entry.category, Category::Relapse);
        assert!(!entry.id.is_empty());
    }

    #[test]
    fn test_calendar_date_uses_utc() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T23:30:00-05:00")
            .unwrap()
            .with_timezone(&Utc);
        let entry = EventLogEntry::new("u1", Category::PornOnly, ts);

        // 23:30 at UTC-5 is already the next day in UTC
        assert_eq!(entry.calendar_date(), "2024-03-02");
    }

    #[test]
    fn test_commit_in_batches_splits_and_stops() {
        let items: Vec<u32> = (0..12).collect();
        let mut seen = Vec::new();

        let outcomes = commit_in_batches(&items, 5, |batch| {
            seen.push(batch.len());
            if seen.len() == 2 {
                Err(StoreError::Unavailable("boom".to_string()))
            } else {
                Ok(())
            }
        });

        assert_eq!(seen, vec![5, 5]);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[0],
            BatchOutcome::Committed {
                index: 1,
                operations: 5
            }
        );
        assert!(!outcomes[1].is_committed());
        assert_eq!(outcomes[1].index(), 2);
        assert!(matches!(
            outcomes[1],
            BatchOutcome::Failed {
                kind: FailureKind::StoreUnavailable,
                ..
            }
        ));
    }

    #[test]
    fn test_commit_in_batches_empty_and_zero_cap() {
        let empty: Vec<u32> = Vec::new();
        assert!(commit_in_batches(&empty, 500, |_| Ok(())).is_empty());

        // A zero cap is clamped to one operation per batch
        let outcomes = commit_in_batches(&[1, 2, 3], 0, |_| Ok(()));
        assert_eq!(outcomes.len(), 3);
    }

    #[test]
    fn test_memory_store_unavailable() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let err = store.legacy_dates("u1", Category::Relapse).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.query_entries("u1", Category::Relapse).is_err());
    }

    #[test]
    fn test_memory_store_injected_insert_failure() {
        let store = InMemoryStore::new();
        store.fail_insert_batch(2);

        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let entries: Vec<EventLogEntry> = (0..3)
            .map(|_| EventLogEntry::for_legacy_date("u1", Category::MastOnly, date))
            .collect();

        let outcomes = store.batch_insert(&entries, 1);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(store.insert_batches_attempted(), 2);
        assert_eq!(store.entry_count(), 1);
    }

    #[test]
    fn test_memory_delete_only_touches_owner() {
        let store = InMemoryStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let mine = EventLogEntry::for_legacy_date("u1", Category::Relapse, date);
        let mut theirs = EventLogEntry::for_legacy_date("u2", Category::Relapse, date);
        theirs.id = mine.id.clone();
        let mut other_category = EventLogEntry::for_legacy_date("u1", Category::PornOnly, date);
        other_category.id = mine.id.clone();

        store.add_entry(mine.clone());
        store.add_entry(theirs);
        store.add_entry(other_category);

        store
            .commit_delete("u1", Category::Relapse, &[mine.id.clone()])
            .unwrap();

        assert!(store.entries("u1", Category::Relapse).is_empty());
        assert_eq!(store.entries("u2", Category::Relapse).len(), 1);
        assert_eq!(store.entries("u1", Category::PornOnly).len(), 1);
    }
}
