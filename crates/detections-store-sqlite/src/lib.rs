#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use detections_core::{
    format_detection_date, parse_detection_date, DetectionRecord, DetectionStatus, DetectionStore,
    NewDetection,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const DETECTIONS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_DETECTIONS_V1: &str = r"
CREATE TABLE IF NOT EXISTS detections (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  date TEXT NOT NULL,
  confidence REAL NOT NULL CHECK (confidence BETWEEN 0.0 AND 1.0),
  status TEXT NOT NULL CHECK (status IN ('candidate', 'confirmed', 'rejected')),
  notes TEXT NOT NULL DEFAULT ''
);

CREATE TRIGGER IF NOT EXISTS trg_detections_no_update
BEFORE UPDATE ON detections
BEGIN
  SELECT RAISE(FAIL, 'detections is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_detections_no_delete
BEFORE DELETE ON detections
BEGIN
  SELECT RAISE(FAIL, 'detections is append-only');
END;
";

const SELECT_DETECTION_COLUMNS: &str = "SELECT id, date, confidence, status, notes FROM detections";

/// Durable detection store backed by a single SQLite table.
///
/// Ids come from `AUTOINCREMENT`, so they are never reused even if rows are
/// removed out-of-band. Listing is always ordered by id.
pub struct SqliteDetectionStore {
    conn: Mutex<Connection>,
}

impl SqliteDetectionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens `path` and applies pending migrations.
    pub fn open_and_migrate(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_DETECTIONS_V1)
            .context("failed to apply detections schema")?;

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| anyhow!("failed to format migration timestamp: {err}"))?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![DETECTIONS_MIGRATION_VERSION, now],
            )
            .context("failed to register detections schema migration")?;

        if inserted > 0 {
            tracing::info!(version = DETECTIONS_MIGRATION_VERSION, "applied detections schema migration");
        }
        Ok(())
    }

    /// Highest applied migration, or `None` on a fresh database.
    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.connection()?;
        let table_present: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to inspect sqlite_master")?;
        if table_present.is_none() {
            return Ok(None);
        }

        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .context("failed to read schema version")
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite detection store lock poisoned"))
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn append(&self, detection: NewDetection) -> Result<DetectionRecord> {
        let date = format_detection_date(detection.date)?;

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .context("failed to start detection transaction")?;

        tx.execute(
            "INSERT INTO detections(date, confidence, status, notes) VALUES (?1, ?2, ?3, ?4)",
            params![date, detection.confidence, detection.status.as_str(), detection.notes],
        )
        .context("failed to append detection")?;

        let id = tx.last_insert_rowid();
        tx.commit().context("failed to commit detection transaction")?;

        tracing::debug!(id, status = %detection.status, "appended detection row");
        Ok(DetectionRecord::from_new(id, detection))
    }

    fn list(&self) -> Result<Vec<DetectionRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_DETECTION_COLUMNS} ORDER BY id ASC"))
            .context("failed to prepare detection listing")?;

        let rows = stmt.query_map([], parse_detection_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row.context("failed to decode detection row")?);
        }
        Ok(records)
    }

    fn get(&self, id: i64) -> Result<Option<DetectionRecord>> {
        let conn = self.connection()?;
        conn.query_row(
            &format!("{SELECT_DETECTION_COLUMNS} WHERE id = ?1"),
            params![id],
            parse_detection_row,
        )
        .optional()
        .with_context(|| format!("failed to load detection {id}"))
    }
}

fn parse_detection_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionRecord> {
    let date_raw: String = row.get(1)?;
    let status_raw: String = row.get(3)?;

    let date = parse_detection_date(&date_raw)
        .map_err(|_| invalid_column(1, rusqlite::types::Type::Text, format!("invalid date: {date_raw}")))?;
    let status = DetectionStatus::parse(&status_raw).ok_or_else(|| {
        invalid_column(3, rusqlite::types::Type::Text, format!("invalid status: {status_raw}"))
    })?;

    Ok(DetectionRecord {
        id: row.get(0)?,
        date,
        confidence: row.get(2)?,
        status,
        notes: row.get(4)?,
    })
}

fn invalid_column(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use time::{Date, Month};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteDetectionStore {
        must(SqliteDetectionStore::open_and_migrate(Path::new(":memory:")))
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("detections-store-{}.sqlite3", ulid::Ulid::new()))
    }

    fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn remove_db_files(db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        for suffix in ["-wal", "-shm"] {
            let _ = std::fs::remove_file(sidecar_path(db_path, suffix));
        }
    }

    fn fixture_detection(confidence: f64, status: DetectionStatus, notes: &str) -> NewDetection {
        let date = match Date::from_calendar_date(2024, Month::June, 1) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture date: {err}"),
        };
        NewDetection { date, confidence, status, notes: notes.to_string() }
    }

    fn status_from_code(code: u8) -> DetectionStatus {
        match code % 3 {
            0 => DetectionStatus::Candidate,
            1 => DetectionStatus::Confirmed,
            _ => DetectionStatus::Rejected,
        }
    }

    #[test]
    fn append_assigns_ids_and_round_trips_fields() {
        let store = fixture_store();

        let first = must(store.append(fixture_detection(0.75, DetectionStatus::Candidate, "")));
        let second = must(store.append(fixture_detection(1.0, DetectionStatus::Rejected, "dup")));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let loaded = must(store.get(2));
        assert_eq!(loaded.as_ref(), Some(&second));
        assert_eq!(second.notes, "dup");
        assert_eq!(second.confidence, 1.0);
    }

    #[test]
    fn get_unknown_id_is_none() {
        let store = fixture_store();
        must(store.append(fixture_detection(0.5, DetectionStatus::Confirmed, "")));
        assert_eq!(must(store.get(999)), None);
    }

    #[test]
    fn list_is_ordered_by_id() {
        let store = fixture_store();
        for confidence in [0.1, 0.2, 0.3] {
            must(store.append(fixture_detection(confidence, DetectionStatus::Candidate, "")));
        }

        let listed = must(store.list());
        assert_eq!(listed.iter().map(|record| record.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(listed.iter().map(|record| record.confidence).collect::<Vec<_>>(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn date_is_stored_as_canonical_text() {
        let store = fixture_store();
        must(store.append(fixture_detection(0.5, DetectionStatus::Candidate, "")));

        let conn = must(store.connection());
        let stored: String = match conn.query_row("SELECT date FROM detections WHERE id = 1", [], |row| row.get(0)) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(stored, "2024-06-01");
    }

    #[test]
    fn append_only_triggers_block_update_and_delete() {
        let store = fixture_store();
        let record = must(store.append(fixture_detection(0.5, DetectionStatus::Candidate, "")));

        let conn = must(store.connection());
        let update = conn.execute(
            "UPDATE detections SET status = 'confirmed' WHERE id = ?1",
            params![record.id],
        );
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM detections WHERE id = ?1", params![record.id]);
        assert!(delete.is_err());
    }

    #[test]
    fn check_constraints_reject_out_of_domain_rows() {
        let store = fixture_store();
        let conn = must(store.connection());

        let bad_status = conn.execute(
            "INSERT INTO detections(date, confidence, status) VALUES ('2024-06-01', 0.5, 'Confirmed')",
            [],
        );
        assert!(bad_status.is_err());

        let bad_confidence = conn.execute(
            "INSERT INTO detections(date, confidence, status) VALUES ('2024-06-01', 1.5, 'candidate')",
            [],
        );
        assert!(bad_confidence.is_err());
    }

    #[test]
    fn migrate_is_idempotent_and_reports_schema_version() {
        let store = must(SqliteDetectionStore::open(Path::new(":memory:")));
        assert_eq!(must(store.schema_version()), None);

        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(DETECTIONS_MIGRATION_VERSION));
    }

    #[test]
    fn records_survive_reopen_and_ids_continue() {
        let db_path = unique_temp_db_path();

        {
            let store = must(SqliteDetectionStore::open_and_migrate(&db_path));
            must(store.append(fixture_detection(0.4, DetectionStatus::Candidate, "first")));
            must(store.append(fixture_detection(0.6, DetectionStatus::Confirmed, "second")));
        }

        let reopened = must(SqliteDetectionStore::open_and_migrate(&db_path));
        let listed = must(reopened.list());
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].notes, "first");

        let third = must(reopened.append(fixture_detection(0.8, DetectionStatus::Rejected, "third")));
        assert_eq!(third.id, 3);

        drop(reopened);
        remove_db_files(&db_path);
        for leftover in [db_path.clone(), sidecar_path(&db_path, "-wal"), sidecar_path(&db_path, "-shm")] {
            assert!(!leftover.exists(), "{} was not cleaned up", leftover.display());
        }
    }

    proptest! {
        #[test]
        fn prop_ids_strictly_increase_and_list_matches(
            stream in prop::collection::vec((0.0f64..=1.0, any::<u8>()), 1..40)
        ) {
            let store = fixture_store();
            let mut appended = Vec::new();
            for (confidence, code) in &stream {
                appended.push(must(store.append(fixture_detection(*confidence, status_from_code(*code), ""))));
            }

            for pair in appended.windows(2) {
                prop_assert!(pair[0].id < pair[1].id);
            }
            prop_assert_eq!(must(store.list()), appended);
        }
    }
}
