use hop_core::{DnsProviderInfo, DnsProviderKind, DnsProviderPatch, ErrorKind};
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;

use super::credentials::Credentials;
use crate::crypto::{self, CryptoError, EncryptionKey};
use crate::state_store::{SqliteStateStore, StateStoreError, StoredDnsProvider, wire_secs};
use crate::validation::ValidationError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("DNS provider not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("stored credentials are unreadable: {0}")]
    Crypto(#[from] CryptoError),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Validation(_) => ErrorKind::Validation,
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::Store(_) | RegistryError::Crypto(_) => ErrorKind::Internal,
        }
    }
}

/// A decrypted provider record.
#[derive(Debug, Clone)]
pub struct DnsProvider {
    pub id: String,
    pub name: String,
    pub credentials: Credentials,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl DnsProvider {
    /// Client view with secrets masked.
    pub fn info(&self) -> DnsProviderInfo {
        DnsProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.credentials.kind(),
            config: self.credentials.redacted(),
            created_at: wire_secs(self.created_at),
            updated_at: wire_secs(self.updated_at),
        }
    }
}

/// DNS provider credentials, validated on the way in and sealed at rest.
#[derive(Clone)]
pub struct DnsProviderRegistry {
    store: Arc<SqliteStateStore>,
    key: EncryptionKey,
}

fn validate_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Required { field: "name" });
    }
    Ok(name.to_string())
}

impl DnsProviderRegistry {
    pub fn new(store: Arc<SqliteStateStore>, key: EncryptionKey) -> Self {
        Self { store, key }
    }

    pub fn create(
        &self,
        name: &str,
        kind: DnsProviderKind,
        config: &Value,
    ) -> Result<DnsProvider, RegistryError> {
        let name = validate_name(name)?;
        let credentials = Credentials::parse(kind, config)?;
        let now = SystemTime::now();
        let provider = DnsProvider {
            id: nanoid::nanoid!(),
            name,
            credentials,
            created_at: now,
            updated_at: now,
        };
        self.persist(&provider)?;
        tracing::info!(id = %provider.id, kind = %kind, "Created DNS provider");
        Ok(provider)
    }

    pub fn get(&self, id: &str) -> Result<DnsProvider, RegistryError> {
        let stored = self
            .store
            .dns_provider(id)?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.open(stored)
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<DnsProvider>, RegistryError> {
        self.store
            .list_dns_providers()?
            .into_iter()
            .map(|stored| self.open(stored))
            .collect()
    }

    /// Apply a partial update. A config patch is merged over the stored config
    /// when the kind is unchanged; a kind change needs a complete config.
    pub fn update(&self, id: &str, patch: &DnsProviderPatch) -> Result<DnsProvider, RegistryError> {
        let mut provider = self.get(id)?;

        if let Some(name) = &patch.name {
            provider.name = validate_name(name)?;
        }

        let current_kind = provider.credentials.kind();
        let kind = patch.kind.unwrap_or(current_kind);
        let config = match (&patch.config, kind == current_kind) {
            (Some(config), true) => provider.credentials.merge_patch(config),
            (Some(config), false) => config.clone(),
            (None, true) => provider.credentials.to_config(),
            (None, false) => {
                return Err(ValidationError::Required { field: "config" }.into());
            }
        };
        provider.credentials = Credentials::parse(kind, &config)?;
        provider.updated_at = SystemTime::now();

        self.persist(&provider)?;
        tracing::info!(id = %provider.id, kind = %kind, "Updated DNS provider");
        Ok(provider)
    }

    /// Remove a provider. Certificates referencing it are left alone.
    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        if !self.store.delete_dns_provider(id)? {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        tracing::info!(id = %id, "Deleted DNS provider");
        Ok(())
    }

    /// Decrypted credentials for an ACME attempt.
    pub fn credentials(&self, id: &str) -> Result<Credentials, RegistryError> {
        Ok(self.get(id)?.credentials)
    }

    fn persist(&self, provider: &DnsProvider) -> Result<(), RegistryError> {
        let config_enc = crypto::encrypt(&provider.credentials.to_config().to_string(), &self.key)?;
        self.store.upsert_dns_provider(&StoredDnsProvider {
            id: provider.id.clone(),
            name: provider.name.clone(),
            kind: provider.credentials.kind(),
            config_enc,
            created_at: provider.created_at,
            updated_at: provider.updated_at,
        })?;
        Ok(())
    }

    fn open(&self, stored: StoredDnsProvider) -> Result<DnsProvider, RegistryError> {
        let json = crypto::decrypt(&stored.config_enc, &self.key)?;
        let config: Value = serde_json::from_str(&json).map_err(|e| {
            StateStoreError::InvalidData(format!("dns provider {} config: {e}", stored.id))
        })?;
        let credentials = Credentials::parse(stored.kind, &config).map_err(|e| {
            StateStoreError::InvalidData(format!("dns provider {} config: {e}", stored.id))
        })?;
        Ok(DnsProvider {
            id: stored.id,
            name: stored.name,
            credentials,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }
}
