//! SQLite persistence for providers, certificates, logs, sites, routes and
//! settings.
//!
//! One connection is opened per operation; WAL mode lets readers proceed
//! while a writer holds the database.

mod certificates;
mod dns_providers;
mod proxy;

pub use certificates::{CertificateRecord, StoredStatus};
pub use dns_providers::StoredDnsProvider;

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database directory {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("unsupported schema version: {found}")]
    UnsupportedSchemaVersion { found: i32 },
}

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    path: PathBuf,
}

impl SqliteStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&self) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateStoreError::Io(parent.to_path_buf(), e))?;
        }

        let mut conn = self.open_connection()?;
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StateStoreError::UnsupportedSchemaVersion { found: version });
        }

        if version < CURRENT_SCHEMA_VERSION {
            self.migrate(&mut conn, version)?;
        } else {
            ensure_schema_objects(&conn)?;
            upsert_schema_meta(&conn)?;
        }

        Ok(())
    }

    fn open_connection(&self) -> Result<Connection, StateStoreError> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;
             PRAGMA wal_autocheckpoint = 1000;
             PRAGMA journal_size_limit = 67108864;
             PRAGMA cache_size = -20000;
             PRAGMA trusted_schema = OFF;",
        )?;
        Ok(conn)
    }

    fn migrate(&self, conn: &mut Connection, from: i32) -> Result<(), StateStoreError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match from {
            0 => {
                ensure_schema_objects(&tx)?;
                tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
                upsert_schema_meta(&tx)?;
            }
            CURRENT_SCHEMA_VERSION => {}
            other => return Err(StateStoreError::UnsupportedSchemaVersion { found: other }),
        }
        tx.commit()?;
        Ok(())
    }
}

fn ensure_schema_objects(conn: &Connection) -> Result<(), StateStoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            schema_version INTEGER NOT NULL,
            min_binary_version TEXT NOT NULL,
            created_by TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS dns_providers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            config_enc TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS certificates (
            id TEXT PRIMARY KEY,
            domain TEXT NOT NULL,
            domains_json TEXT NOT NULL,
            dns_provider_id TEXT NOT NULL,
            cert_path TEXT,
            key_path TEXT,
            issuer TEXT,
            not_before INTEGER,
            not_after INTEGER,
            status TEXT NOT NULL CHECK(status IN ('pending', 'active', 'error')),
            error TEXT,
            auto_renew INTEGER NOT NULL DEFAULT 1,
            last_renew_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_certificates_domain ON certificates(domain);

        CREATE TABLE IF NOT EXISTS certificate_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            certificate_id TEXT NOT NULL,
            action TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY(certificate_id) REFERENCES certificates(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_certificate_logs_certificate
            ON certificate_logs(certificate_id, id);

        CREATE TABLE IF NOT EXISTS proxy_sites (
            id TEXT PRIMARY KEY,
            site_json TEXT NOT NULL,
            certificate_id TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS stream_routes (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            domain TEXT NOT NULL UNIQUE,
            backend TEXT NOT NULL,
            enabled INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

fn upsert_schema_meta(conn: &Connection) -> Result<(), StateStoreError> {
    conn.execute(
        "INSERT INTO schema_meta (id, schema_version, min_binary_version, created_by)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            schema_version = excluded.schema_version,
            min_binary_version = excluded.min_binary_version,
            created_by = excluded.created_by;",
        rusqlite::params![CURRENT_SCHEMA_VERSION, env!("CARGO_PKG_VERSION"), "hop-server"],
    )?;
    Ok(())
}

pub(crate) fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

pub(crate) fn from_unix_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs.unsigned_abs())
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Unix seconds for the wire; times before the epoch clamp to zero.
pub(crate) fn wire_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
