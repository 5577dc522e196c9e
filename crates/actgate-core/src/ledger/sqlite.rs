//! SQLite-backed ledger sink.
//!
//! One append-only table; triggers reject `UPDATE` and `DELETE` so a record,
//! once written, stays as written.

use super::{LedgerError, LedgerRecord, LedgerSink};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// DDL for the decision ledger.
///
/// Schema version: 1
pub const LEDGER_SCHEMA: &str = r#"
-- Every ledger record, in append order
CREATE TABLE IF NOT EXISTS ledger_records (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    record_kind  TEXT NOT NULL,
    session_id   TEXT NOT NULL,
    action_id    TEXT,
    verdict      TEXT,
    recorded_at  TEXT NOT NULL,
    body         TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS ledger_records_no_update
    BEFORE UPDATE ON ledger_records
BEGIN
    SELECT RAISE(ABORT, 'ledger_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS ledger_records_no_delete
    BEFORE DELETE ON ledger_records
BEGIN
    SELECT RAISE(ABORT, 'ledger_records is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ledger_records_session
    ON ledger_records(session_id);
CREATE INDEX IF NOT EXISTS idx_ledger_records_action
    ON ledger_records(action_id);
"#;

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

#[derive(Clone)]
pub struct SqliteLedgerSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerSink {
    /// Open (or create) a ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        // WAL is not available for in-memory databases; ignore failure.
        let _ = conn.execute_batch("PRAGMA journal_mode = WAL");
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// All records in append order.
    pub fn records(&self) -> Result<Vec<LedgerRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare("SELECT body FROM ledger_records ORDER BY seq")?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(LedgerError::from))
            .collect()
    }

    pub fn count_for_session(&self, session_id: &str) -> Result<u64, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_records WHERE session_id = ?",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl LedgerSink for SqliteLedgerSink {
    fn append(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let body = serde_json::to_string(record)?;
        let verdict = match record {
            LedgerRecord::Decision(d) => Some(d.verdict.to_string()),
            _ => None,
        };
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO ledger_records (record_kind, session_id, action_id, verdict, recorded_at, body)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                record.kind(),
                record.session_id(),
                record.action_id(),
                verdict,
                record.timestamp().to_rfc3339(),
                body,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{Decision, Verdict};
    use crate::runtime::Scope;
    use crate::Action;
    use chrono::Utc;

    fn decision(session: &str) -> LedgerRecord {
        let mut d = Decision::new(session, &Scope::new(), &Action::new("search"), Utc::now());
        d.verdict = Verdict::Allow;
        LedgerRecord::Decision(d)
    }

    #[test]
    fn test_sink_bootstraps_schema_and_appends() {
        let sink = SqliteLedgerSink::memory().unwrap();
        sink.append(&decision("s1")).unwrap();
        sink.append(&decision("s1")).unwrap();
        sink.append(&decision("s2")).unwrap();

        assert_eq!(sink.count_for_session("s1").unwrap(), 2);
        let records = sink.records().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].session_id(), "s2");
    }

    #[test]
    fn test_rows_cannot_be_updated_or_deleted() {
        let sink = SqliteLedgerSink::memory().unwrap();
        sink.append(&decision("s1")).unwrap();

        let conn = sink.conn.lock().unwrap();
        assert!(conn
            .execute("UPDATE ledger_records SET verdict = 'block'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM ledger_records", []).is_err());
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        SqliteLedgerSink::open(&path)
            .unwrap()
            .append(&decision("s1"))
            .unwrap();

        let reopened = SqliteLedgerSink::open(&path).unwrap();
        assert_eq!(reopened.records().unwrap().len(), 1);
    }
}
