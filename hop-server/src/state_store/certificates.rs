use hop_core::{CertificateInfo, CertificateLogEntry, CertificateStatus, LogAction};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::PathBuf;
use std::time::SystemTime;

use super::{SqliteStateStore, StateStoreError, from_unix_secs, unix_secs, wire_secs};

const SECS_PER_DAY: i64 = 86_400;

/// Status as persisted. `expired` is never stored; it is derived from
/// `not_after` whenever a record is read for display or scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredStatus {
    Pending,
    Active,
    Error,
}

impl StoredStatus {
    fn as_str(&self) -> &'static str {
        match self {
            StoredStatus::Pending => "pending",
            StoredStatus::Active => "active",
            StoredStatus::Error => "error",
        }
    }

    fn parse(value: &str) -> Result<Self, StateStoreError> {
        match value {
            "pending" => Ok(StoredStatus::Pending),
            "active" => Ok(StoredStatus::Active),
            "error" => Ok(StoredStatus::Error),
            other => Err(StateStoreError::InvalidData(format!(
                "unknown certificate status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub id: String,
    /// Primary domain, always `domains[0]`.
    pub domain: String,
    pub domains: Vec<String>,
    pub dns_provider_id: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub issuer: Option<String>,
    pub not_before: Option<SystemTime>,
    pub not_after: Option<SystemTime>,
    pub status: StoredStatus,
    pub error: Option<String>,
    pub auto_renew: bool,
    pub last_renew_at: Option<SystemTime>,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl CertificateRecord {
    pub fn new(id: String, domains: Vec<String>, dns_provider_id: String, now: SystemTime) -> Self {
        Self {
            id,
            domain: domains.first().cloned().unwrap_or_default(),
            domains,
            dns_provider_id,
            cert_path: None,
            key_path: None,
            issuer: None,
            not_before: None,
            not_after: None,
            status: StoredStatus::Pending,
            error: None,
            auto_renew: true,
            last_renew_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_material(&self) -> bool {
        self.cert_path.is_some() && self.key_path.is_some()
    }

    /// Whole days until `not_after`, rounded toward negative infinity.
    pub fn days_remaining(&self, now: SystemTime) -> Option<i64> {
        self.not_after
            .map(|not_after| (unix_secs(not_after) - unix_secs(now)).div_euclid(SECS_PER_DAY))
    }

    pub fn effective_status(&self, now: SystemTime) -> CertificateStatus {
        match self.status {
            StoredStatus::Pending => CertificateStatus::Pending,
            StoredStatus::Error => CertificateStatus::Error,
            StoredStatus::Active => match self.not_after {
                Some(not_after) if not_after <= now => CertificateStatus::Expired,
                _ => CertificateStatus::Active,
            },
        }
    }

    pub fn to_info(&self, now: SystemTime) -> CertificateInfo {
        CertificateInfo {
            id: self.id.clone(),
            domain: self.domain.clone(),
            domains: self.domains.clone(),
            dns_provider_id: self.dns_provider_id.clone(),
            cert_path: self.cert_path.as_ref().map(|p| p.display().to_string()),
            key_path: self.key_path.as_ref().map(|p| p.display().to_string()),
            issuer: self.issuer.clone(),
            not_before: self.not_before.map(wire_secs),
            not_after: self.not_after.map(wire_secs),
            status: self.effective_status(now),
            error: self.error.clone(),
            auto_renew: self.auto_renew,
            last_renew_at: self.last_renew_at.map(wire_secs),
            days_remaining: self.days_remaining(now),
            created_at: wire_secs(self.created_at),
            updated_at: wire_secs(self.updated_at),
        }
    }
}

const SELECT_CERTIFICATE: &str = "SELECT
        id, domain, domains_json, dns_provider_id, cert_path, key_path, issuer,
        not_before, not_after, status, error, auto_renew, last_renew_at,
        created_at, updated_at
     FROM certificates";

struct CertificateRow {
    id: String,
    domain: String,
    domains_json: String,
    dns_provider_id: String,
    cert_path: Option<String>,
    key_path: Option<String>,
    issuer: Option<String>,
    not_before: Option<i64>,
    not_after: Option<i64>,
    status: String,
    error: Option<String>,
    auto_renew: bool,
    last_renew_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn certificate_from_row(row: &Row<'_>) -> rusqlite::Result<CertificateRow> {
    Ok(CertificateRow {
        id: row.get(0)?,
        domain: row.get(1)?,
        domains_json: row.get(2)?,
        dns_provider_id: row.get(3)?,
        cert_path: row.get(4)?,
        key_path: row.get(5)?,
        issuer: row.get(6)?,
        not_before: row.get(7)?,
        not_after: row.get(8)?,
        status: row.get(9)?,
        error: row.get(10)?,
        auto_renew: row.get(11)?,
        last_renew_at: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl TryFrom<CertificateRow> for CertificateRecord {
    type Error = StateStoreError;

    fn try_from(row: CertificateRow) -> Result<Self, Self::Error> {
        let domains: Vec<String> = serde_json::from_str(&row.domains_json).map_err(|e| {
            StateStoreError::InvalidData(format!("certificate {} domains_json: {e}", row.id))
        })?;
        Ok(CertificateRecord {
            domain: row.domain,
            domains,
            dns_provider_id: row.dns_provider_id,
            cert_path: row.cert_path.map(PathBuf::from),
            key_path: row.key_path.map(PathBuf::from),
            issuer: row.issuer,
            not_before: row.not_before.map(from_unix_secs),
            not_after: row.not_after.map(from_unix_secs),
            status: StoredStatus::parse(&row.status)?,
            error: row.error,
            auto_renew: row.auto_renew,
            last_renew_at: row.last_renew_at.map(from_unix_secs),
            created_at: from_unix_secs(row.created_at),
            updated_at: from_unix_secs(row.updated_at),
            id: row.id,
        })
    }
}

fn upsert_certificate(conn: &Connection, record: &CertificateRecord) -> Result<(), StateStoreError> {
    let domains_json = serde_json::to_string(&record.domains)
        .map_err(|e| StateStoreError::InvalidData(format!("serialize domains: {e}")))?;
    let path_text = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string());
    conn.execute(
        "INSERT INTO certificates (
            id, domain, domains_json, dns_provider_id, cert_path, key_path, issuer,
            not_before, not_after, status, error, auto_renew, last_renew_at,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
            domain = excluded.domain,
            domains_json = excluded.domains_json,
            dns_provider_id = excluded.dns_provider_id,
            cert_path = excluded.cert_path,
            key_path = excluded.key_path,
            issuer = excluded.issuer,
            not_before = excluded.not_before,
            not_after = excluded.not_after,
            status = excluded.status,
            error = excluded.error,
            auto_renew = excluded.auto_renew,
            last_renew_at = excluded.last_renew_at,
            updated_at = excluded.updated_at;",
        params![
            record.id,
            record.domain,
            domains_json,
            record.dns_provider_id,
            path_text(&record.cert_path),
            path_text(&record.key_path),
            record.issuer,
            record.not_before.map(unix_secs),
            record.not_after.map(unix_secs),
            record.status.as_str(),
            record.error,
            record.auto_renew,
            record.last_renew_at.map(unix_secs),
            unix_secs(record.created_at),
            unix_secs(record.updated_at),
        ],
    )?;
    Ok(())
}

fn insert_log(
    conn: &Connection,
    certificate_id: &str,
    action: LogAction,
    message: &str,
    at: SystemTime,
) -> Result<i64, StateStoreError> {
    conn.execute(
        "INSERT INTO certificate_logs (certificate_id, action, message, created_at)
         VALUES (?1, ?2, ?3, ?4);",
        params![certificate_id, action.as_str(), message, unix_secs(at)],
    )?;
    Ok(conn.last_insert_rowid())
}

impl SqliteStateStore {
    pub fn save_certificate(&self, record: &CertificateRecord) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        upsert_certificate(&conn, record)
    }

    /// Save `record` and append one log entry in the same transaction.
    pub fn save_certificate_with_log(
        &self,
        record: &CertificateRecord,
        action: LogAction,
        message: &str,
    ) -> Result<(), StateStoreError> {
        let mut conn = self.open_connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        upsert_certificate(&tx, record)?;
        insert_log(&tx, &record.id, action, message, record.updated_at)?;
        tx.commit()?;
        Ok(())
    }

    pub fn certificate(&self, id: &str) -> Result<Option<CertificateRecord>, StateStoreError> {
        let conn = self.open_connection()?;
        conn.query_row(
            &format!("{SELECT_CERTIFICATE} WHERE id = ?1;"),
            params![id],
            certificate_from_row,
        )
        .optional()?
        .map(CertificateRecord::try_from)
        .transpose()
    }

    pub fn certificate_by_domain(
        &self,
        domain: &str,
    ) -> Result<Option<CertificateRecord>, StateStoreError> {
        let conn = self.open_connection()?;
        conn.query_row(
            &format!("{SELECT_CERTIFICATE} WHERE domain = ?1 ORDER BY created_at ASC LIMIT 1;"),
            params![domain],
            certificate_from_row,
        )
        .optional()?
        .map(CertificateRecord::try_from)
        .transpose()
    }

    /// All certificates, newest first.
    pub fn list_certificates(&self) -> Result<Vec<CertificateRecord>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt =
            conn.prepare(&format!("{SELECT_CERTIFICATE} ORDER BY created_at DESC, id DESC;"))?;
        let rows = stmt.query_map([], certificate_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(CertificateRecord::try_from(row?)?);
        }
        Ok(records)
    }

    /// Remove a certificate and, through the foreign key, its log.
    pub fn delete_certificate(&self, id: &str) -> Result<bool, StateStoreError> {
        let conn = self.open_connection()?;
        let removed = conn.execute("DELETE FROM certificates WHERE id = ?1;", params![id])?;
        Ok(removed > 0)
    }

    pub fn append_certificate_log(
        &self,
        certificate_id: &str,
        action: LogAction,
        message: &str,
        at: SystemTime,
    ) -> Result<i64, StateStoreError> {
        let conn = self.open_connection()?;
        insert_log(&conn, certificate_id, action, message, at)
    }

    /// Newest entries first.
    pub fn certificate_logs(
        &self,
        certificate_id: &str,
        limit: u32,
    ) -> Result<Vec<CertificateLogEntry>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, certificate_id, action, message, created_at
             FROM certificate_logs
             WHERE certificate_id = ?1
             ORDER BY id DESC
             LIMIT ?2;",
        )?;
        let rows = stmt.query_map(params![certificate_id, i64::from(limit)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, certificate_id, action, message, created_at) = row?;
            let action = LogAction::parse(&action).ok_or_else(|| {
                StateStoreError::InvalidData(format!("unknown log action: {action}"))
            })?;
            entries.push(CertificateLogEntry {
                id,
                certificate_id,
                action,
                message,
                created_at: wire_secs(from_unix_secs(created_at)),
            });
        }
        Ok(entries)
    }

    pub fn set_certificate_auto_renew(
        &self,
        id: &str,
        auto_renew: bool,
        at: SystemTime,
    ) -> Result<bool, StateStoreError> {
        let conn = self.open_connection()?;
        let updated = conn.execute(
            "UPDATE certificates SET auto_renew = ?2, updated_at = ?3 WHERE id = ?1;",
            params![id, auto_renew, unix_secs(at)],
        )?;
        Ok(updated > 0)
    }
}
