use hop_core::DnsProviderKind;
use rusqlite::{OptionalExtension, Row, params};
use std::time::SystemTime;

use super::{SqliteStateStore, StateStoreError, from_unix_secs, unix_secs};

/// Provider row as persisted. `config_enc` is the sealed credential JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDnsProvider {
    pub id: String,
    pub name: String,
    pub kind: DnsProviderKind,
    pub config_enc: String,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

const SELECT_PROVIDER: &str =
    "SELECT id, name, kind, config_enc, created_at, updated_at FROM dns_providers";

struct ProviderRow {
    id: String,
    name: String,
    kind: String,
    config_enc: String,
    created_at: i64,
    updated_at: i64,
}

fn provider_from_row(row: &Row<'_>) -> rusqlite::Result<ProviderRow> {
    Ok(ProviderRow {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        config_enc: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

impl TryFrom<ProviderRow> for StoredDnsProvider {
    type Error = StateStoreError;

    fn try_from(row: ProviderRow) -> Result<Self, Self::Error> {
        let kind = DnsProviderKind::parse(&row.kind).ok_or_else(|| {
            StateStoreError::InvalidData(format!("unknown dns provider kind: {}", row.kind))
        })?;
        Ok(StoredDnsProvider {
            id: row.id,
            name: row.name,
            kind,
            config_enc: row.config_enc,
            created_at: from_unix_secs(row.created_at),
            updated_at: from_unix_secs(row.updated_at),
        })
    }
}

impl SqliteStateStore {
    pub fn upsert_dns_provider(&self, provider: &StoredDnsProvider) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO dns_providers (id, name, kind, config_enc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                config_enc = excluded.config_enc,
                updated_at = excluded.updated_at;",
            params![
                provider.id,
                provider.name,
                provider.kind.as_str(),
                provider.config_enc,
                unix_secs(provider.created_at),
                unix_secs(provider.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn dns_provider(&self, id: &str) -> Result<Option<StoredDnsProvider>, StateStoreError> {
        let conn = self.open_connection()?;
        let row = conn
            .query_row(
                &format!("{SELECT_PROVIDER} WHERE id = ?1;"),
                params![id],
                provider_from_row,
            )
            .optional()?;
        row.map(StoredDnsProvider::try_from).transpose()
    }

    /// All providers, newest first.
    pub fn list_dns_providers(&self) -> Result<Vec<StoredDnsProvider>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt =
            conn.prepare(&format!("{SELECT_PROVIDER} ORDER BY created_at DESC, id DESC;"))?;
        let rows = stmt.query_map([], provider_from_row)?;
        let mut providers = Vec::new();
        for row in rows {
            providers.push(StoredDnsProvider::try_from(row?)?);
        }
        Ok(providers)
    }

    /// Returns whether a row was removed.
    pub fn delete_dns_provider(&self, id: &str) -> Result<bool, StateStoreError> {
        let conn = self.open_connection()?;
        let removed = conn.execute("DELETE FROM dns_providers WHERE id = ?1;", params![id])?;
        Ok(removed > 0)
    }
}
