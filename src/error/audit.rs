/// Durable error audit log
///
/// Every handled error is written with its response, keyed by error id and
/// creation time. The coordinator treats the log as best-effort: a failed
/// write is logged and never changes the response returned to the caller.
use super::handlers::ErrorResponse;
use super::record::ErrorRecord;
use crate::OpguardResult;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// One stored error with the response it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub record: ErrorRecord,
    pub response: ErrorResponse,
    pub recorded_at: DateTime<Utc>,
}

/// Sink for handled errors
pub trait AuditLog: Send + Sync {
    fn record(&self, record: &ErrorRecord, response: &ErrorResponse) -> OpguardResult<()>;

    /// Store the outcome reported after recovery ran
    fn update_outcome(&self, error_id: &str, successful: bool) -> OpguardResult<()>;

    /// Most recent entries, newest first
    fn recent(&self, limit: usize) -> OpguardResult<Vec<AuditEntry>>;

    /// Entries of one operation, oldest first
    fn for_operation(&self, operation_id: &str) -> OpguardResult<Vec<AuditEntry>>;
}

/// SQLite-backed audit log
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteAuditLog {
    /// Create or open the audit database at `path`
    ///
    /// Uses WAL mode; the parent directory is created when missing.
    pub fn open(path: impl AsRef<Path>) -> OpguardResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn, db_path)
    }

    /// In-memory log, mainly for tests and dry runs
    pub fn in_memory() -> OpguardResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> OpguardResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS error_audit (
                error_id TEXT PRIMARY KEY NOT NULL,
                created_at TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                operation_id TEXT,
                agent_id TEXT,
                category TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                escalated INTEGER NOT NULL DEFAULT 0,
                support_reference TEXT,
                recovery_successful INTEGER,
                record TEXT NOT NULL,
                response TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_created ON error_audit(created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_operation ON error_audit(operation_id);
            CREATE INDEX IF NOT EXISTS idx_audit_category ON error_audit(category);
            "#,
        )?;

        tracing::debug!(path = %db_path.display(), "Audit log ready");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Number of stored entries
    pub fn count(&self) -> OpguardResult<u64> {
        let count: i64 = self
            .lock_conn()
            .query_row("SELECT COUNT(*) FROM error_audit", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Look up a single entry
    pub fn get(&self, error_id: &str) -> OpguardResult<Option<AuditEntry>> {
        let row = self
            .lock_conn()
            .query_row(
                "SELECT record, response, recorded_at, recovery_successful
                 FROM error_audit WHERE error_id = ?1",
                params![error_id],
                read_row,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    fn query(&self, sql: &str, param: &dyn rusqlite::ToSql) -> OpguardResult<Vec<AuditEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(std::iter::once(param)), read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type RawRow = (String, String, String, Option<bool>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row((record, response, recorded_at, outcome): RawRow) -> OpguardResult<AuditEntry> {
    let mut record: ErrorRecord = serde_json::from_str(&record)?;
    if let Some(successful) = outcome {
        record.mark_recovery(successful);
    }
    Ok(AuditEntry {
        record,
        response: serde_json::from_str(&response)?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl AuditLog for SqliteAuditLog {
    fn record(&self, record: &ErrorRecord, response: &ErrorResponse) -> OpguardResult<()> {
        let record_json = serde_json::to_string(record)?;
        let response_json = serde_json::to_string(response)?;

        self.lock_conn().execute(
            r#"
            INSERT INTO error_audit (
                error_id, created_at, recorded_at, operation_id, agent_id,
                category, severity, message, escalated, support_reference,
                recovery_successful, record, response
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(error_id) DO UPDATE SET
                recorded_at = excluded.recorded_at,
                escalated = excluded.escalated,
                support_reference = excluded.support_reference,
                recovery_successful = excluded.recovery_successful,
                record = excluded.record,
                response = excluded.response
            "#,
            params![
                record.id,
                record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
                record.operation_id,
                record.agent_id,
                record.category.as_str(),
                record.severity.as_str(),
                record.message,
                response.escalated,
                response.support_reference,
                record.recovery_successful,
                record_json,
                response_json,
            ],
        )?;
        Ok(())
    }

    fn update_outcome(&self, error_id: &str, successful: bool) -> OpguardResult<()> {
        let updated = self.lock_conn().execute(
            "UPDATE error_audit SET recovery_successful = ?1 WHERE error_id = ?2",
            params![successful, error_id],
        )?;
        if updated == 0 {
            tracing::debug!(error_id = error_id, "Outcome for unknown audit entry ignored");
        }
        Ok(())
    }

    fn recent(&self, limit: usize) -> OpguardResult<Vec<AuditEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            "SELECT record, response, recorded_at, recovery_successful
             FROM error_audit ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            &limit,
        )
    }

    fn for_operation(&self, operation_id: &str) -> OpguardResult<Vec<AuditEntry>> {
        self.query(
            "SELECT record, response, recorded_at, recovery_successful
             FROM error_audit WHERE operation_id = ?1 ORDER BY created_at ASC, rowid ASC",
            &operation_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::record::{ErrorCategory, ErrorContext, ErrorSeverity};
    use tempfile::TempDir;

    fn sample(op: &str, message: &str) -> (ErrorRecord, ErrorResponse) {
        let record = ErrorRecord::new(
            ErrorCategory::Network,
            ErrorSeverity::Medium,
            message,
            &ErrorContext::for_operation(op),
        );
        let response = ErrorResponse::for_record(&record, "network");
        (record, response)
    }

    #[test]
    fn test_record_and_read_back() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let (record, response) = sample("op-1", "connection reset");
        log.record(&record, &response).unwrap();

        let entry = log.get(&record.id).unwrap().unwrap();
        assert_eq!(entry.record, record);
        assert_eq!(entry.response, response);
        assert_eq!(log.count().unwrap(), 1);
    }

    #[test]
    fn test_recent_newest_first() {
        let log = SqliteAuditLog::in_memory().unwrap();
        for i in 0..5 {
            let (record, response) = sample("op-1", &format!("failure {}", i));
            log.record(&record, &response).unwrap();
        }

        let recent = log.recent(3).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].record.message, "failure 4");
        assert_eq!(recent[2].record.message, "failure 2");
    }

    #[test]
    fn test_update_outcome() {
        let log = SqliteAuditLog::in_memory().unwrap();
        let (record, response) = sample("op-1", "timeout");
        log.record(&record, &response).unwrap();

        log.update_outcome(&record.id, true).unwrap();
        let entry = log.get(&record.id).unwrap().unwrap();
        assert!(entry.record.recovery_attempted);
        assert_eq!(entry.record.recovery_successful, Some(true));

        // unknown ids are ignored
        log.update_outcome("missing", false).unwrap();
    }

    #[test]
    fn test_for_operation_filters() {
        let log = SqliteAuditLog::in_memory().unwrap();
        for op in ["op-a", "op-b", "op-a"] {
            let (record, response) = sample(op, "reset");
            log.record(&record, &response).unwrap();
        }
        assert_eq!(log.for_operation("op-a").unwrap().len(), 2);
        assert_eq!(log.for_operation("op-c").unwrap().len(), 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit").join("errors.db");
        let (record, response) = sample("op-1", "dns failure");
        {
            let log = SqliteAuditLog::open(&path).unwrap();
            log.record(&record, &response).unwrap();
        }

        let log = SqliteAuditLog::open(&path).unwrap();
        assert_eq!(log.path(), path.as_path());
        assert_eq!(log.recent(10).unwrap()[0].record.id, record.id);
    }
}
