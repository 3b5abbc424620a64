use rusqlite::{Connection, params};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to open ledger {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("ledger schema setup failed: {0}")]
    Schema(#[source] rusqlite::Error),
    #[error("ledger insert failed: {0}")]
    Insert(#[source] rusqlite::Error),
    #[error("ledger query failed: {0}")]
    Query(#[source] rusqlite::Error),
}

/// One accepted file, as recorded for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord {
    pub upload_time: f64,
    pub content_hash: String,
    pub size_bytes: u64,
    pub landed_filename: String,
    pub original_filename: String,
    pub submitter_name: String,
    pub submitter_email: String,
    pub submitter_address: String,
    pub submitter_agent: String,
    pub permission_claim: String,
    pub suggested_directory: Option<String>,
    pub external_id: Option<String>,
    pub description: Option<String>,
}

/// Append-only upload ledger. Rows are independent, so each append is a
/// single autocommitted insert.
pub struct UploadLedger {
    conn: Connection,
}

impl UploadLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(|source| LedgerError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::with_connection(conn)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|source| LedgerError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(LedgerError::Schema)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS uploads (
                uploadtime REAL,
                md5 TEXT,
                size INTEGER,
                filename TEXT,
                origfilename TEXT,
                donorname TEXT,
                donoremail TEXT,
                donorip TEXT,
                donoruseragent TEXT,
                permission TEXT,
                suggestdir TEXT,
                ifdbid TEXT,
                about TEXT
            );
            ",
        )
        .map_err(LedgerError::Schema)?;
        Ok(Self { conn })
    }

    pub fn append(&self, record: &UploadRecord) -> Result<(), LedgerError> {
        self.conn
            .execute(
                "INSERT INTO uploads
                (uploadtime, md5, size, filename, origfilename, donorname, donoremail,
                 donorip, donoruseragent, permission, suggestdir, ifdbid, about)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.upload_time,
                    record.content_hash,
                    record.size_bytes as i64,
                    record.landed_filename,
                    record.original_filename,
                    record.submitter_name,
                    record.submitter_email,
                    record.submitter_address,
                    record.submitter_agent,
                    record.permission_claim,
                    record.suggested_directory,
                    record.external_id,
                    record.description,
                ],
            )
            .map_err(LedgerError::Insert)?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64, LedgerError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM uploads", [], |row| row.get(0))
            .map_err(LedgerError::Query)?;
        Ok(n.max(0) as u64)
    }

    /// Most recent rows first.
    pub fn recent(&self, limit: usize) -> Result<Vec<UploadRecord>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT uploadtime, md5, size, filename, origfilename, donorname, donoremail,
                        donorip, donoruseragent, permission, suggestdir, ifdbid, about
                 FROM uploads ORDER BY uploadtime DESC, rowid DESC LIMIT ?1",
            )
            .map_err(LedgerError::Query)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(UploadRecord {
                    upload_time: row.get(0)?,
                    content_hash: row.get(1)?,
                    size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
                    landed_filename: row.get(3)?,
                    original_filename: row.get(4)?,
                    submitter_name: row.get(5)?,
                    submitter_email: row.get(6)?,
                    submitter_address: row.get(7)?,
                    submitter_agent: row.get(8)?,
                    permission_claim: row.get(9)?,
                    suggested_directory: row.get(10)?,
                    external_id: row.get(11)?,
                    description: row.get(12)?,
                })
            })
            .map_err(LedgerError::Query)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(LedgerError::Query)?);
        }
        Ok(out)
    }
}
