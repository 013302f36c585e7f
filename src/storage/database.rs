//! SQLite database management with migrations
//!
//! Holds the module and occurrence tables and serves them through
//! [`RecordSource`]. Blocking work runs on tokio's blocking pool.

use super::{ModuleRow, ModuleStatistics, RecordSource, SourceRow};
use crate::deadline::blocking_with_deadline;
use crate::error::{ObsearchError, Result};
use crate::query::{RelationalQuery, SqlParam, MODULE_STATISTICS, RECORD_SELECT};
use crate::records::{RawRecord, Urgency};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params, params_from_iter, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Database manager with migration support
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    query_timeout: Duration,
}

impl Database {
    /// Open (or create) the database file and apply pending migrations
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ObsearchError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        // Pragmas are per connection, so every pooled connection gets them
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                ",
            )
        });

        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| ObsearchError::Config(format!("Failed to create connection pool: {}", e)))?;

        let db = Self {
            pool,
            query_timeout: Duration::from_secs(30),
        };
        db.migrate()?;

        Ok(db)
    }

    /// Deadline applied to every [`RecordSource`] call
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| ObsearchError::Config(format!("Failed to get connection: {}", e)))
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        // Create migrations table
        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        // Get current version
        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )?;

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            // Apply only what this file has not seen
            if version > current_version {
                tracing::info!("Applying migration {}", version);
                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let conn = self.get_conn()?;

        let module_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sub_module", [], |row| row.get(0))?;
        let record_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sub_module_data", [], |row| row.get(0))?;
        let reporter_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM reporter", [], |row| row.get(0))?;

        Ok(DbStats {
            module_count: module_count as usize,
            record_count: record_count as usize,
            reporter_count: reporter_count as usize,
        })
    }

    /// Insert or replace a module definition; `fields` is the stored JSON list
    pub fn insert_module(&self, id: i64, name: &str, description: &str, fields: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sub_module (id, name, description, fields) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, description, fields],
        )?;
        Ok(())
    }

    /// Insert or replace one occurrence record, creating its reporter if any
    pub fn seed_record(&self, record: &RawRecord) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        insert_record(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Overwrite the stored attribute bag text of a record as-is
    pub fn set_raw_form_data(&self, record_id: i64, form_data: Option<&str>) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sub_module_data SET form_data = ?1 WHERE id = ?2",
            params![form_data, record_id],
        )?;
        Ok(())
    }

    /// Overwrite the stored submission timestamp text of a record as-is
    pub fn set_raw_submission_date(&self, record_id: i64, submitted: Option<&str>) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE sub_module_data SET submission_date = ?1 WHERE id = ?2",
            params![submitted, record_id],
        )?;
        Ok(())
    }

    /// Load a fixture in a single transaction
    pub fn seed_fixture(&self, fixture: &SeedFixture) -> Result<DbStats> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        for module in &fixture.modules {
            tx.execute(
                "INSERT OR REPLACE INTO sub_module (id, name, description, fields) VALUES (?1, ?2, ?3, ?4)",
                params![module.id, module.name, module.description, module.fields.to_string()],
            )?;
        }
        for record in &fixture.records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;

        tracing::info!(
            "Seeded {} modules and {} records",
            fixture.modules.len(),
            fixture.records.len()
        );
        self.stats()
    }
}

fn insert_record(conn: &rusqlite::Connection, record: &RawRecord) -> Result<()> {
    let reporter_id = match &record.reporter {
        Some(reporter) => {
            let (first, last) = split_name(reporter.name.as_deref());
            // Reporters are shared across records by national id
            let existing: Option<i64> = match &reporter.id_number {
                Some(id_no) => conn
                    .query_row(
                        "SELECT id FROM reporter WHERE id_no = ?1",
                        params![id_no],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            };
            match existing {
                Some(id) => Some(id),
                None => {
                    conn.execute(
                        "INSERT INTO reporter (first_name, last_name, id_no) VALUES (?1, ?2, ?3)",
                        params![first, last, reporter.id_number],
                    )?;
                    Some(conn.last_insert_rowid())
                }
            }
        }
        None => None,
    };

    // Bag keeps its insertion order through serialization
    let form_data = record.attributes.to_json().to_string();
    let submitted = record
        .submitted_at
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true));

    conn.execute(
        "INSERT OR REPLACE INTO sub_module_data
            (id, ob_number, submission_date, sub_module_id, form_data, location, urgency, narrative, reporter_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.id,
            record.case_number,
            submitted,
            record.module_id,
            form_data,
            record.location,
            record.urgency.as_ref().map(|u| u.as_str().to_string()),
            record.narrative,
            reporter_id,
        ],
    )?;
    Ok(())
}

fn split_name(name: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (None, None);
    };
    match name.split_once(' ') {
        Some((first, last)) => (Some(first.to_string()), Some(last.trim().to_string())),
        None => (Some(name.to_string()), None),
    }
}

fn source_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceRow> {
    Ok(SourceRow {
        id: row.get(0)?,
        case_number: row.get(1)?,
        submitted_at: row.get(2)?,
        module_id: row.get(3)?,
        module_name: row.get(4)?,
        form_data: row.get(5)?,
        location: row.get(6)?,
        urgency: row.get(7)?,
        narrative: row.get(8)?,
        reporter_first_name: row.get(9)?,
        reporter_last_name: row.get(10)?,
        reporter_id_number: row.get(11)?,
    })
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlParam::Text(s) => ToSqlOutput::from(s.as_str()),
            SqlParam::Integer(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
        })
    }
}

#[async_trait]
impl RecordSource for Database {
    async fn module_rows(&self) -> Result<Vec<ModuleRow>> {
        let db = self.clone();
        blocking_with_deadline("module query", self.query_timeout, move || {
            let conn = db.get_conn()?;
            let mut stmt =
                conn.prepare("SELECT id, name, description, fields FROM sub_module ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(ModuleRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        fields: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count_records(&self) -> Result<usize> {
        let db = self.clone();
        blocking_with_deadline("record count", self.query_timeout, move || {
            let conn = db.get_conn()?;
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM sub_module_data", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn fetch_records(&self, offset: usize, limit: usize) -> Result<Vec<SourceRow>> {
        let db = self.clone();
        blocking_with_deadline("record page", self.query_timeout, move || {
            let conn = db.get_conn()?;
            let sql = format!("{} ORDER BY smd.id LIMIT ?1 OFFSET ?2", RECORD_SELECT);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![limit as i64, offset as i64], source_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn run_query(&self, query: &RelationalQuery) -> Result<Vec<SourceRow>> {
        let db = self.clone();
        let query = query.clone();
        blocking_with_deadline("relational query", self.query_timeout, move || {
            let conn = db.get_conn()?;
            let mut stmt = conn.prepare(&query.sql)?;
            let rows = stmt
                .query_map(params_from_iter(query.params.iter()), source_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn module_statistics(&self, since: DateTime<Utc>) -> Result<Vec<ModuleStatistics>> {
        let db = self.clone();
        let since = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        blocking_with_deadline("module statistics", self.query_timeout, move || {
            let conn = db.get_conn()?;
            let mut stmt = conn.prepare(MODULE_STATISTICS)?;
            let rows = stmt
                .query_map(params![since, Urgency::High.as_str()], |row| {
                    Ok(ModuleStatistics {
                        module_id: row.get(0)?,
                        module_name: row.get(1)?,
                        total: row.get::<_, i64>(2)? as usize,
                        recent: row.get::<_, i64>(3)? as usize,
                        high_urgency: row.get::<_, i64>(4)? as usize,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

/// Database statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbStats {
    pub module_count: usize,
    pub record_count: usize,
    pub reporter_count: usize,
}

/// Module entry of a seed fixture; `fields` is the JSON field list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureModule {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Modules and records to load into an empty database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedFixture {
    #[serde(default)]
    pub modules: Vec<FixtureModule>,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: module definitions, reporters and occurrence records
    r#"
    CREATE TABLE sub_module (
        id INTEGER PRIMARY KEY,
        name TEXT,
        description TEXT,
        fields TEXT  -- JSON list of field definitions
    );

    CREATE TABLE reporter (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        first_name TEXT,
        last_name TEXT,
        id_no TEXT
    );

    CREATE INDEX idx_reporter_id_no ON reporter(id_no);

    CREATE TABLE sub_module_data (
        id INTEGER PRIMARY KEY,
        ob_number TEXT,
        submission_date TEXT,  -- RFC 3339, UTC
        sub_module_id INTEGER NOT NULL,
        form_data TEXT,  -- JSON attribute bag
        location TEXT,
        urgency TEXT,
        narrative TEXT,
        reporter_id INTEGER,
        FOREIGN KEY (sub_module_id) REFERENCES sub_module(id),
        FOREIGN KEY (reporter_id) REFERENCES reporter(id) ON DELETE SET NULL
    );

    CREATE INDEX idx_records_module ON sub_module_data(sub_module_id);
    CREATE INDEX idx_records_submission ON sub_module_data(submission_date);
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Reporter, Urgency};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn open() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
        (temp_dir, db)
    }

    #[test]
    fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        let _db = Database::new(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_migrations() {
        let (_dir, db) = open();

        let conn = db.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();

        assert_eq!(version, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_reopen_does_not_reapply_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        drop(Database::new(&db_path).unwrap());
        let db = Database::new(&db_path).unwrap();

        let conn = db.get_conn().unwrap();
        let applied: i32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_schema_exists() {
        let (_dir, db) = open();
        let conn = db.get_conn().unwrap();

        for table in ["sub_module", "sub_module_data", "reporter"] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();

            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_foreign_keys_enabled_on_every_connection() {
        let (_dir, db) = open();
        let first = db.get_conn().unwrap();
        let second = db.get_conn().unwrap();

        for conn in [&first, &second] {
            let fk_enabled: i32 = conn
                .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                .unwrap();
            assert_eq!(fk_enabled, 1);
        }
    }

    #[tokio::test]
    async fn test_seeded_record_reads_back() {
        let (_dir, db) = open();
        db.insert_module(3, "Motor Vehicle Theft", "Stolen vehicles", "[]")
            .unwrap();

        let mut record = RawRecord::new(7, 3);
        record.case_number = Some("OB/7/2025".into());
        record.submitted_at = Some(Utc.with_ymd_and_hms(2025, 6, 9, 10, 30, 0).unwrap());
        record.urgency = Some(Urgency::High);
        record.attributes.insert("Make", "Toyota");
        record.reporter = Some(Reporter {
            name: Some("Jane Wanjiru Doe".into()),
            id_number: Some("12345678".into()),
        });
        db.seed_record(&record).unwrap();

        assert_eq!(db.count_records().await.unwrap(), 1);
        let rows = db.fetch_records(0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);

        let row = &rows[0];
        assert_eq!(row.module_name.as_deref(), Some("Motor Vehicle Theft"));
        assert_eq!(row.submitted_at.as_deref(), Some("2025-06-09T10:30:00Z"));
        assert_eq!(row.form_data.as_deref(), Some(r#"{"Make":"Toyota"}"#));
        assert_eq!(row.reporter_first_name.as_deref(), Some("Jane"));
        assert_eq!(row.reporter_last_name.as_deref(), Some("Wanjiru Doe"));
        assert_eq!(row.urgency.as_deref(), Some("High"));
    }

    #[tokio::test]
    async fn test_fetch_pages_in_id_order() {
        let (_dir, db) = open();
        db.insert_module(1, "Arson", "Fires", "[]").unwrap();
        for id in [5, 1, 3, 2, 4] {
            db.seed_record(&RawRecord::new(id, 1)).unwrap();
        }

        let page: Vec<i64> = db
            .fetch_records(2, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(page, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_run_query_binds_params() {
        let (_dir, db) = open();
        db.insert_module(1, "Arson", "Fires", "[]").unwrap();
        db.insert_module(2, "Death", "Deaths", "[]").unwrap();
        db.seed_record(&RawRecord::new(1, 1)).unwrap();
        db.seed_record(&RawRecord::new(2, 2)).unwrap();

        let query = RelationalQuery {
            sql: format!("{} WHERE sm.name = ?1 LIMIT ?2", RECORD_SELECT),
            params: vec![SqlParam::Text("Death".into()), SqlParam::Integer(10)],
        };
        let rows = db.run_query(&query).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
    }

    #[test]
    fn test_seed_fixture_reuses_reporters() {
        let (_dir, db) = open();
        let fixture: SeedFixture = serde_json::from_value(serde_json::json!({
            "modules": [{"id": 1, "name": "Arson", "fields": []}],
            "records": [
                {"id": 1, "module_id": 1, "case_number": null, "submitted_at": null,
                 "module_name": null, "location": null, "urgency": null, "narrative": null,
                 "attributes": {}, "reporter": {"name": "A B", "id_number": "99"}},
                {"id": 2, "module_id": 1, "case_number": null, "submitted_at": null,
                 "module_name": null, "location": null, "urgency": null, "narrative": null,
                 "attributes": {}, "reporter": {"name": "A B", "id_number": "99"}}
            ]
        }))
        .unwrap();

        let stats = db.seed_fixture(&fixture).unwrap();
        assert_eq!(
            stats,
            DbStats {
                module_count: 1,
                record_count: 2,
                reporter_count: 1
            }
        );
    }

    #[tokio::test]
    async fn test_date_window_agrees_with_engine_filter_across_formats() {
        use crate::flatten::{PromotionRules, RecordFlattener};
        use crate::query::{DateRange, Predicates, StructuredQueryBuilder};
        use chrono::NaiveDate;
        use std::sync::Arc;

        let (_dir, db) = open();
        db.insert_module(1, "Theft", "Stolen property", "[]").unwrap();
        let stored = [
            (1, "2025-06-09 10:00:00"),
            (2, "2025-06-10T01:00:00+03:00"),
            (3, "2025-06-10T00:30:00Z"),
            (4, "2025-06-08T23:59:59+00:00"),
            (5, "2025-06-09T23:30:00-01:00"),
        ];
        for (id, submitted) in stored {
            db.seed_record(&RawRecord::new(id, 1)).unwrap();
            db.set_raw_submission_date(id, Some(submitted)).unwrap();
        }

        let rules = Arc::new(PromotionRules::reference());
        let builder = StructuredQueryBuilder::new(rules.clone());
        let day = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let predicates = Predicates {
            date_range: Some(DateRange::single_day(day)),
            ..Predicates::default()
        };

        // Newest first, compared as instants rather than text
        let relational: Vec<i64> = db
            .run_query(&builder.relational(&predicates, 10))
            .await
            .unwrap()
            .iter()
            .map(|row| row.id)
            .collect();
        assert_eq!(relational, vec![2, 1]);

        let filter = builder.filter_expr(&predicates).unwrap();
        let flattener = RecordFlattener::new(rules);
        let rows = db.fetch_records(0, 10).await.unwrap();
        let mut engine: Vec<i64> = flattener
            .flatten_rows(&rows)
            .value
            .iter()
            .map(|doc| doc.to_json())
            .filter(|json| json.as_object().is_some_and(|doc| filter.matches(doc)))
            .filter_map(|json| json.get("id").and_then(serde_json::Value::as_i64))
            .collect();
        engine.sort();
        assert_eq!(engine, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_module_statistics() {
        let (_dir, db) = open();
        db.insert_module(1, "Arson", "Fires", "[]").unwrap();
        db.insert_module(2, "Theft", "Stolen property", "[]").unwrap();
        db.insert_module(3, "Lost Documents", "Nothing recorded", "[]").unwrap();

        let days = [1, 5, 20, 40, 60];
        for (i, day) in days.iter().enumerate() {
            let mut record = RawRecord::new(i as i64 + 1, 2);
            record.submitted_at = Some(Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap()
                - chrono::Duration::days(*day));
            record.urgency = Some(if i % 2 == 0 { Urgency::High } else { Urgency::Low });
            db.seed_record(&record).unwrap();
        }
        let mut arson = RawRecord::new(10, 1);
        arson.submitted_at = Some(Utc.with_ymd_and_hms(2025, 6, 29, 8, 0, 0).unwrap());
        db.seed_record(&arson).unwrap();
        // Timestamps and urgency as another writer might store them
        db.set_raw_submission_date(10, Some("2025-06-29 08:00:00")).unwrap();
        db.get_conn()
            .unwrap()
            .execute("UPDATE sub_module_data SET urgency = 'high' WHERE id = 10", [])
            .unwrap();

        let since = Utc.with_ymd_and_hms(2025, 5, 31, 0, 0, 0).unwrap();
        let stats = db.module_statistics(since).await.unwrap();

        assert_eq!(
            stats,
            vec![
                ModuleStatistics {
                    module_id: 2,
                    module_name: Some("Theft".into()),
                    total: 5,
                    recent: 3,
                    high_urgency: 3,
                },
                ModuleStatistics {
                    module_id: 1,
                    module_name: Some("Arson".into()),
                    total: 1,
                    recent: 1,
                    high_urgency: 1,
                },
            ]
        );
    }
}
