use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::category::Category;
use crate::error::StoreError;
use crate::store::{EventLogEntry, EventLogStore, LegacyRecordStore};

/// One row of a legacy export: a single date in a user's category list
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LegacyRow {
    pub user_id: String,
    pub category: Category,
    pub date: String,
}

/// Audit trail record, written in the same transaction as the batch it describes
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub user_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl AuditEvent {
    pub fn new(event_type: &str, user_id: &str, data: serde_json::Value, actor: &str) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// Fixed-width nanoseconds so text order in SQLite matches time order
fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Legacy date lists (read-only input; row id keeps legacy order)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS legacy_dates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            category TEXT NOT NULL,
            date TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Event log (canonical, immutable entries)
    // No uniqueness on (user, category, date): concurrent backfills can race.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_log (
            entry_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            category TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Audit trail (one event per committed batch)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            user_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_legacy_user_category ON legacy_dates(user_id, category)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_log_user_category ON event_log(user_id, category)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_events(user_id, timestamp)",
        [],
    )?;

    Ok(())
}

/// Insert audit event
pub fn insert_audit_event(conn: &Connection, event: &AuditEvent) -> Result<(), StoreError> {
    let data_json =
        serde_json::to_string(&event.data).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    conn.execute(
        "INSERT INTO audit_events (
            event_id, timestamp, event_type, user_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            encode_timestamp(event.timestamp),
            event.event_type,
            event.user_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Read a legacy export (`user_id,category,date` with header row)
pub fn load_legacy_csv(csv_path: &Path) -> Result<Vec<LegacyRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row: LegacyRow = result.context("Failed to deserialize legacy row")?;
        rows.push(row);
    }

    Ok(rows)
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// Legacy lists and event log in one SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))
    }

    /// Load legacy rows, appending to each list in file order
    pub fn import_legacy_rows(&self, rows: &[LegacyRow]) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO legacy_dates (user_id, category, date) VALUES (?1, ?2, ?3)",
            )?;
            for row in rows {
                stmt.execute(params![row.user_id, row.category.as_str(), row.date])?;
            }
        }
        tx.commit()?;

        tracing::info!(rows = rows.len(), "imported legacy dates");
        Ok(rows.len())
    }

    pub fn insert_legacy_dates(
        &self,
        user_id: &str,
        category: Category,
        dates: &[String],
    ) -> Result<usize, StoreError> {
        let rows: Vec<LegacyRow> = dates
            .iter()
            .map(|date| LegacyRow {
                user_id: user_id.to_string(),
                category,
                date: date.clone(),
            })
            .collect();
        self.import_legacy_rows(&rows)
    }

    /// Append an entry without an audit record (the primary application flow)
    pub fn append_entry(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event_log (entry_id, user_id, category, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.id,
                entry.user_id,
                entry.category.as_str(),
                encode_timestamp(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn entry_count(&self) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Audit trail for a user, newest first
    pub fn audit_events(&self, user_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, user_id, data, actor
             FROM audit_events
             WHERE user_id = ?1
             ORDER BY id DESC",
        )?;

        let raw = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(event_id, timestamp, event_type, user_id, data, actor)| -> Result<AuditEvent, StoreError> {
                Ok(AuditEvent {
                    event_id,
                    timestamp: decode_timestamp(&timestamp)?,
                    event_type,
                    user_id,
                    data: serde_json::from_str(&data)
                        .map_err(|e| StoreError::Corrupt(format!("audit data: {}", e)))?,
                    actor,
                })
            })
            .collect()
    }
}

impl LegacyRecordStore for SqliteStore {
    fn legacy_dates(&self, user_id: &str, category: Category) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date FROM legacy_dates
             WHERE user_id = ?1 AND category = ?2
             ORDER BY id",
        )?;

        let dates = stmt
            .query_map(params![user_id, category.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(dates)
    }
}

impl EventLogStore for SqliteStore {
    fn query_entries(
        &self,
        user_id: &str,
        category: Category,
    ) -> Result<Vec<EventLogEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT entry_id, user_id, category, timestamp
             FROM event_log
             WHERE user_id = ?1 AND category = ?2
             ORDER BY timestamp, entry_id",
        )?;

        let raw = stmt
            .query_map(params![user_id, category.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(id, user_id, category, timestamp)| -> Result<EventLogEntry, StoreError> {
                Ok(EventLogEntry {
                    id,
                    user_id,
                    category: category
                        .parse()
                        .map_err(|_| StoreError::Corrupt(format!("category {:?}", category)))?,
                    timestamp: decode_timestamp(&timestamp)?,
                })
            })
            .collect()
    }

    fn commit_insert(&self, batch: &[EventLogEntry]) -> Result<(), StoreError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO event_log (entry_id, user_id, category, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in batch {
                stmt.execute(params![
                    entry.id,
                    entry.user_id,
                    entry.category.as_str(),
                    encode_timestamp(entry.timestamp),
                ])?;
            }
        }

        let event = AuditEvent::new(
            "entries_backfilled",
            &first.user_id,
            serde_json::json!({
                "category": first.category,
                "count": batch.len(),
                "dates": batch.iter().map(EventLogEntry::calendar_date).collect::<Vec<_>>(),
            }),
            "backfill_executor",
        );
        insert_audit_event(&tx, &event)?;

        // Dropping an uncommitted transaction rolls the whole batch back
        tx.commit()?;
        Ok(())
    }

    fn commit_delete(
        &self,
        user_id: &str,
        category: Category,
        ids: &[String],
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut deleted = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM event_log WHERE entry_id = ?1 AND user_id = ?2 AND category = ?3",
            )?;
            for id in ids {
                deleted += stmt.execute(params![id, user_id, category.as_str()])?;
            }
        }

        let event = AuditEvent::new(
            "duplicates_pruned",
            user_id,
            serde_json::json!({
                "category": category,
                "requested": ids.len(),
                "deleted": deleted,
                "entry_ids": ids,
            }),
            "duplicate_pruner",
        );
        insert_audit_event(&tx, &event)?;

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::store::BatchOutcome;
    use chrono::{Duration, NaiveDate};

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn create_test_entry(id: &str, date: &str) -> EventLogEntry {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap();
        let mut entry = EventLogEntry::for_legacy_date("user-1", Category::Relapse, date);
        entry.id = id.to_string();
        entry
    }

    fn dates(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_legacy_order_and_repeats_preserved() {
        let store = create_test_store();
        let legacy = dates(&["2024-01-03", "2024-01-01", "2024-01-03"]);

        store
            .insert_legacy_dates("user-1", Category::PornOnly, &legacy)
            .unwrap();
        store
            .insert_legacy_dates("user-2", Category::PornOnly, &dates(&["2023-12-31"]))
            .unwrap();

        assert_eq!(store.legacy_dates("user-1", Category::PornOnly).unwrap(), legacy);
        assert!(store.legacy_dates("user-1", Category::Relapse).unwrap().is_empty());

        println!("✅ Legacy order test PASSED");
    }

    #[test]
    fn test_insert_query_delete_round_trip() {
        let store = create_test_store();
        let entries = vec![
            create_test_entry("a", "2024-01-01"),
            create_test_entry("b", "2024-01-02"),
        ];

        store.commit_insert(&entries).unwrap();
        let stored = store.query_entries("user-1", Category::Relapse).unwrap();
        assert_eq!(stored, entries);

        store
            .commit_delete("user-1", Category::Relapse, &["a".to_string()])
            .unwrap();
        let stored = store.query_entries("user-1", Category::Relapse).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "b");
    }

    #[test]
    fn test_timestamp_precision_survives_storage() {
        let store = create_test_store();
        let ts = DateTime::parse_from_rfc3339("2024-07-04T13:14:15.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = EventLogEntry::new("user-1", Category::MastOnly, ts);

        store.append_entry(&entry).unwrap();

        let stored = store.query_entries("user-1", Category::MastOnly).unwrap();
        assert_eq!(stored[0].timestamp, ts);
    }

    #[test]
    fn test_failed_batch_rolls_back_whole_batch() {
        let store = create_test_store();
        store.append_entry(&create_test_entry("taken", "2023-01-01")).unwrap();

        let entries = vec![
            create_test_entry("n1", "2024-01-01"),
            create_test_entry("n2", "2024-01-02"),
            create_test_entry("n3", "2024-01-03"),
            create_test_entry("taken", "2024-01-04"),
            create_test_entry("n5", "2024-01-05"),
        ];

        let outcomes = store.batch_insert(&entries, 2);

        // [n1, n2] commits; [n3, taken] violates the primary key; [n5] never runs
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_committed());
        assert!(matches!(
            outcomes[1],
            BatchOutcome::Failed {
                index: 2,
                kind: FailureKind::Rejected,
                ..
            }
        ));

        let ids: Vec<String> = store
            .query_entries("user-1", Category::Relapse)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, dates(&["taken", "n1", "n2"]));
        assert_eq!(store.entry_count().unwrap(), 3);
    }

    #[test]
    fn test_audit_event_per_committed_batch() {
        let store = create_test_store();
        let entries = vec![
            create_test_entry("a", "2024-01-01"),
            create_test_entry("b", "2024-01-01"),
            create_test_entry("c", "2024-01-02"),
        ];

        store.batch_insert(&entries, 2);
        store.batch_delete("user-1", Category::Relapse, &["b".to_string()], 2);

        let events = store.audit_events("user-1").unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, "duplicates_pruned");
        assert_eq!(events[0].data["deleted"], 1);
        assert_eq!(events[1].event_type, "entries_backfilled");
        assert_eq!(events[1].data["count"], 1);
        assert_eq!(events[2].data["count"], 2);
        assert_eq!(events[2].actor, "backfill_executor");

        println!("✅ Audit trail test PASSED");
    }

    #[test]
    fn test_csv_import() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("legacy.csv");
        std::fs::write(
            &csv_path,
            "user_id,category,date\nuser-1,relapse,2024-01-01\nuser-1,mastOnly,2024-02-01\nuser-1,relapse,2024-01-05\n",
        )
        .unwrap();

        let rows = load_legacy_csv(&csv_path).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].category, Category::MastOnly);

        let store = SqliteStore::open(&dir.path().join("reconcile.db")).unwrap();
        store.import_legacy_rows(&rows).unwrap();

        assert_eq!(
            store.legacy_dates("user-1", Category::Relapse).unwrap(),
            dates(&["2024-01-01", "2024-01-05"])
        );
    }

    #[test]
    fn test_csv_rejects_unknown_category() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("legacy.csv");
        std::fs::write(&csv_path, "user_id,category,date\nuser-1,gambling,2024-01-01\n").unwrap();

        assert!(load_legacy_csv(&csv_path).is_err());
    }

    #[test]
    fn test_reopen_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconcile.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.append_entry(&create_test_entry("a", "2024-01-01")).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.entry_count().unwrap(), 1);
    }

    #[test]
    fn test_prune_audit_kept_when_first_id_already_gone() {
        let store = create_test_store();
        store.append_entry(&create_test_entry("b", "2024-01-01")).unwrap();

        // "a" was removed by someone else before this batch ran
        store
            .commit_delete("user-1", Category::Relapse, &dates(&["a", "b"]))
            .unwrap();

        assert_eq!(store.entry_count().unwrap(), 0);

        let events = store.audit_events("user-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "duplicates_pruned");
        assert_eq!(events[0].data["requested"], 2);
        assert_eq!(events[0].data["deleted"], 1);
        assert!(store.audit_events("").unwrap().is_empty());
    }

    #[test]
    fn test_delete_ignores_other_users_entries() {
        let store = create_test_store();
        let mut theirs = create_test_entry("x", "2024-01-01");
        theirs.user_id = "user-2".to_string();
        store.append_entry(&theirs).unwrap();

        store
            .commit_delete("user-1", Category::Relapse, &dates(&["x"]))
            .unwrap();

        assert_eq!(store.query_entries("user-2", Category::Relapse).unwrap().len(), 1);
    }

    #[test]
    fn test_entries_come_back_in_time_order() {
        let store = create_test_store();
        let whole = create_test_entry("whole", "2024-01-01");
        let mut half = create_test_entry("half", "2024-01-01");
        half.timestamp = whole.timestamp + Duration::milliseconds(500);

        store.append_entry(&half).unwrap();
        store.append_entry(&whole).unwrap();

        let ids: Vec<String> = store
            .query_entries("user-1", Category::Relapse)
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, dates(&["whole", "half"]));
    }
}
