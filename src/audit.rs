use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::value::TIME_FORMAT;

pub const AUDIT_DB_NAME: &str = "audit.sqlite3";
const SNAPSHOT_DIR: &str = "data";
const SNAPSHOT_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One recorded fetch request. Append-only; for a given item the records
/// are totally ordered by request_time and "latest" is max(request_time).
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AuditRecord {
    pub id: i64,
    pub item_id: String,
    pub item_kind: String,
    pub item_type: String,
    pub request_type: String,
    pub request_url: String,
    pub request_method: String,
    pub request_time: String,
    pub request_headers: String,
    pub request_params: String,
    pub total_features: Option<i64>,
}

/// The fields of a request about to be recorded. Headers and params are
/// stored as JSON text columns.
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub item_id: String,
    pub item_kind: String,
    pub item_type: String,
    pub request_type: String,
    pub request_url: String,
    pub request_method: String,
    pub request_time: DateTime<Utc>,
    pub request_headers: BTreeMap<String, String>,
    pub request_params: BTreeMap<String, String>,
    pub total_features: Option<i64>,
}

/// Durable, queryable history of fetch requests per dataset identifier,
/// backed by one SQLite database per audit folder. A disabled ledger
/// accepts writes as no-ops and reports no history.
pub struct AuditLedger {
    inner: Option<Ledger>,
}

struct Ledger {
    folder: PathBuf,
    conn: Arc<RwLock<Connection>>,
    retain_snapshots: bool,
}

impl AuditLedger {
    /// Opens (creating if necessary) the audit database inside `folder`
    /// and brings its schema up to date.
    pub fn open<P: AsRef<Path>>(folder: P) -> Result<Self, SyncError> {
        let folder = folder.as_ref().to_path_buf();
        fs::create_dir_all(&folder).map_err(|e| SyncError::Storage(e.to_string()))?;
        let mut conn = Connection::open(folder.join(AUDIT_DB_NAME))?;
        migrations().to_latest(&mut conn)?;
        Ok(Self {
            inner: Some(Ledger {
                folder,
                conn: Arc::new(RwLock::new(conn)),
                retain_snapshots: true,
            }),
        })
    }

    /// A ledger that records nothing. Callers must not depend on the write
    /// happening; `latest_request` always reports no history.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Whether successful writes also persist the raw response payload as
    /// a snapshot file. On by default.
    pub fn retain_snapshots(mut self, retain: bool) -> Self {
        if let Some(ledger) = self.inner.as_mut() {
            ledger.retain_snapshots = retain;
        }
        self
    }

    /// Appends one request record. If a payload is given and snapshotting
    /// is retained, the full response is written beside the database as
    /// `data/{request_type}_{item_id}_{request_time}.json`; a snapshot
    /// failure is logged and does not fail the record operation.
    pub fn record_request(
        &self,
        entry: &AuditEntry,
        payload: Option<&serde_json::Value>,
    ) -> Result<(), SyncError> {
        let ledger = match &self.inner {
            Some(ledger) => ledger,
            None => {
                log::debug!("Auditing disabled, not recording request for {}", entry.item_id);
                return Ok(());
            }
        };

        let request_time = entry.request_time.format(TIME_FORMAT).to_string();
        let headers = serde_json::to_string(&entry.request_headers)?;
        let params = serde_json::to_string(&entry.request_params)?;

        let conn = ledger
            .conn
            .write()
            .map_err(|_| SyncError::Storage("failed to acquire write lock".to_string()))?;
        conn.execute(
            "INSERT INTO requests (
                item_id, item_kind, item_type, request_type, request_url,
                request_method, request_time, request_headers, request_params,
                total_features
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                entry.item_id,
                entry.item_kind,
                entry.item_type,
                entry.request_type,
                entry.request_url,
                entry.request_method,
                request_time,
                headers,
                params,
                entry.total_features,
            ],
        )?;
        drop(conn);

        log::debug!(
            "Recorded {} request for item {} at {}",
            entry.request_type,
            entry.item_id,
            request_time
        );

        if ledger.retain_snapshots {
            if let Some(payload) = payload {
                if let Err(e) = self.save_snapshot(entry, payload) {
                    log::warn!(
                        "Failed to snapshot response for item {}: {}",
                        entry.item_id,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// The single record with maximum request_time for the item, optionally
    /// filtered by request_type. The full-vs-delta fetch decision is based
    /// on this.
    pub fn latest_request(
        &self,
        item_id: &str,
        request_type: Option<&str>,
    ) -> Result<Option<AuditRecord>, SyncError> {
        let ledger = match &self.inner {
            Some(ledger) => ledger,
            None => return Ok(None),
        };

        let conn = ledger
            .conn
            .read()
            .map_err(|_| SyncError::Storage("failed to acquire read lock".to_string()))?;

        let sql = match request_type {
            Some(_) => {
                "SELECT * FROM requests
                 WHERE item_id = ? AND request_type = ?
                 ORDER BY request_time DESC LIMIT 1"
            }
            None => {
                "SELECT * FROM requests
                 WHERE item_id = ?
                 ORDER BY request_time DESC LIMIT 1"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let mut rows = match request_type {
            Some(rt) => stmt.query(rusqlite::params![item_id, rt])?,
            None => stmt.query(rusqlite::params![item_id])?,
        };

        match rows.next()? {
            Some(row) => Ok(Some(serde_rusqlite::from_row::<AuditRecord>(row)?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(
        &self,
        entry: &AuditEntry,
        payload: &serde_json::Value,
    ) -> Result<PathBuf, SyncError> {
        let ledger = self
            .inner
            .as_ref()
            .ok_or_else(|| SyncError::Storage("auditing disabled".to_string()))?;
        let data_folder = ledger.folder.join(SNAPSHOT_DIR);
        fs::create_dir_all(&data_folder).map_err(|e| SyncError::Storage(e.to_string()))?;
        // Colon-free timestamp rendering keeps the name filesystem-safe.
        let file_name = format!(
            "{}_{}_{}.json",
            entry.request_type,
            entry.item_id,
            entry.request_time.format(SNAPSHOT_TIME_FORMAT)
        );
        let path = data_folder.join(file_name);
        fs::write(&path, serde_json::to_string(payload)?)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        log::debug!("Saved response snapshot to {}", path.display());
        Ok(path)
    }
}

/// Parses a ledger-format timestamp back into a UTC instant. Accepts the
/// stored naive form (assumed UTC) and offset-bearing RFC 3339 input, which
/// is normalized to UTC.
pub fn parse_request_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = NaiveDateTime::parse_from_str(s, TIME_FORMAT) {
        return Some(t.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE requests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT NOT NULL,
            item_kind TEXT NOT NULL,
            item_type TEXT NOT NULL,
            request_type TEXT NOT NULL,
            request_url TEXT NOT NULL,
            request_method TEXT NOT NULL,
            request_time TEXT NOT NULL,
            request_headers TEXT NOT NULL,
            request_params TEXT NOT NULL,
            total_features INTEGER
        );
        CREATE INDEX idx_requests_item_id ON requests (item_id);
        CREATE INDEX idx_requests_request_time ON requests (request_time);",
    )])
}
