// ⚖️ Reconciliation Analyzer - Compare legacy date lists with the event log
//
// For one user × category:
//   observed  = UTC calendar dates of event-log entries (scope-filtered)
//   missing   = legacy dates with no observed entry
//   duplicate = observed dates carrying more than one entry
//
// Pure computation: no I/O, no mutation, safe to call from any thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::category::Category;
use crate::store::EventLogEntry;

// ============================================================================
// OBSERVATION SCOPE
// ============================================================================

/// Which event-log entries the analyzer looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationScope {
    /// Only entries whose date appears in the legacy list. Duplicates on
    /// other dates are invisible.
    #[default]
    LegacyOnly,

    /// Every entry of the category, so duplicates on dates the legacy list
    /// never recorded are detected too. Missing dates are unaffected.
    AllEntries,
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub user_id: String,
    pub category: Category,

    /// Raw legacy list, repeats included
    pub legacy_dates: Vec<String>,

    /// One date per observed entry, ascending
    pub observed_dates: Vec<String>,

    /// Legacy dates with no observed entry, in legacy order. A date repeated
    /// in the legacy list is repeated here too.
    pub missing_dates: Vec<String>,

    /// Observed dates with more than one entry, ascending
    pub duplicate_dates: Vec<String>,

    /// total_entries - unique_entries
    pub duplicate_count: usize,
    pub total_entries: usize,
    pub unique_entries: usize,

    pub scope: ObservationScope,
    pub generated_at: DateTime<Utc>,
}

impl ReconciliationReport {
    /// Nothing to backfill and nothing to prune
    pub fn is_reconciled(&self) -> bool {
        self.missing_dates.is_empty() && self.duplicate_dates.is_empty()
    }

    /// Missing dates with legacy repeats collapsed, first occurrence wins
    pub fn distinct_missing(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.missing_dates
            .iter()
            .filter(|d| seen.insert(d.as_str()))
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} / {}: {} legacy dates, {} migrated, {} missing, {} duplicate entries on {} dates",
            self.user_id,
            self.category,
            self.legacy_dates.len(),
            self.unique_entries,
            self.distinct_missing().len(),
            self.duplicate_count,
            self.duplicate_dates.len()
        )
    }
}

// ============================================================================
// RECONCILIATION ANALYZER
// ============================================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconciliationAnalyzer {
    pub scope: ObservationScope,
}

impl ReconciliationAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(scope: ObservationScope) -> Self {
        ReconciliationAnalyzer { scope }
    }

    /// Compute the discrepancy between a legacy list and the event log
    ///
    /// `user_id` and `category` only label the report; every computed field
    /// comes from `legacy_dates` and `entries`.
    ///
    /// Example:
    /// ```
    /// use history_reconcile::{Category, EventLogEntry, ReconciliationAnalyzer};
    /// use chrono::NaiveDate;
    ///
    /// let entry = EventLogEntry::for_legacy_date(
    ///     "u1",
    ///     Category::Relapse,
    ///     NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
    /// );
    /// let legacy = vec!["2024-01-01".to_string(), "2024-01-02".to_string()];
    ///
    /// let report = ReconciliationAnalyzer::new().analyze("u1", Category::Relapse, &legacy, &[entry]);
    /// assert_eq!(report.missing_dates, vec!["2024-01-02".to_string()]);
    /// ```
    pub fn analyze(
        &self,
        user_id: &str,
        category: Category,
        legacy_dates: &[String],
        entries: &[EventLogEntry],
    ) -> ReconciliationReport {
        let legacy: HashSet<&str> = legacy_dates.iter().map(String::as_str).collect();

        // date -> entry count, ordered so the report lists dates ascending
        let mut frequency: BTreeMap<String, usize> = BTreeMap::new();
        for entry in entries {
            let date = entry.calendar_date();
            if self.scope == ObservationScope::LegacyOnly && !legacy.contains(date.as_str()) {
                continue;
            }
            *frequency.entry(date).or_insert(0) += 1;
        }

        let unique_entries = frequency.len();
        let total_entries: usize = frequency.values().sum();

        let duplicate_dates: Vec<String> = frequency
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(date, _)| date.clone())
            .collect();

        let missing_dates: Vec<String> = legacy_dates
            .iter()
            .filter(|date| !frequency.contains_key(date.as_str()))
            .cloned()
            .collect();

        let observed_dates: Vec<String> = frequency
            .iter()
            .flat_map(|(date, count)| std::iter::repeat(date.clone()).take(*count))
            .collect();

        ReconciliationReport {
            user_id: user_id.to_string(),
            category,
            legacy_dates: legacy_dates.to_vec(),
            observed_dates,
            missing_dates,
            duplicate_dates,
            duplicate_count: total_entries - unique_entries,
            total_entries,
            unique_entries,
            scope: self.scope,
            generated_at: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
