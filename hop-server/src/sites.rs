//! Reverse-proxy sites: validation, certificate resolution and activation.

use hop_core::{CertificateStatus, ErrorKind, ProxySite};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::gateway::{
    ChangeSet, ConfigFile, GatewayError, ReloadCoordinator, RenderSettings, SiteTls,
    TemplateError, render_site,
};
use crate::state_store::{SqliteStateStore, StateStoreError};
use crate::validation::{ValidationError, sanitize_id, validate_id};

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("Site not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Certificate(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

impl SiteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SiteError::Validation(_) | SiteError::Template(_) | SiteError::Certificate(_) => {
                ErrorKind::Validation
            }
            SiteError::NotFound(_) => ErrorKind::NotFound,
            SiteError::Gateway(e) => e.kind(),
            SiteError::Store(_) => ErrorKind::Internal,
        }
    }
}

pub struct SiteService {
    store: Arc<SqliteStateStore>,
    gateway: Arc<ReloadCoordinator>,
    settings: RenderSettings,
    /// Held from render to persist so concurrent saves cannot interleave.
    write: Mutex<()>,
}

impl SiteService {
    pub fn new(
        store: Arc<SqliteStateStore>,
        gateway: Arc<ReloadCoordinator>,
        settings: RenderSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            write: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<Vec<ProxySite>, SiteError> {
        Ok(self.store.list_sites()?)
    }

    pub fn get(&self, id: &str) -> Result<ProxySite, SiteError> {
        self.store
            .site(id)?
            .ok_or_else(|| SiteError::NotFound(id.to_string()))
    }

    /// Render without writing anything.
    pub fn preview(&self, site: ProxySite) -> Result<String, SiteError> {
        let (_, text) = self.render(site)?;
        Ok(text)
    }

    /// Upsert a site. The record is stored once its file reached the live
    /// tree; a failed syntax test leaves both untouched.
    pub async fn save(&self, site: ProxySite) -> Result<ProxySite, SiteError> {
        let _write = self.write.lock().await;
        let (site, text) = self.render(site)?;

        let applied = self
            .gateway
            .apply(ChangeSet::new().write(ConfigFile::Site(site.id.clone()), text))
            .await;
        if applied.as_ref().map_or_else(GatewayError::promoted, |_| true) {
            self.store.save_site(&site, SystemTime::now())?;
            tracing::info!(id = %site.id, server_name = %site.server_name, "Saved site");
        }
        applied?;
        Ok(site)
    }

    /// Remove the site's file and record. Referenced certificates stay.
    pub async fn delete(&self, id: &str) -> Result<(), SiteError> {
        let _write = self.write.lock().await;
        let site = self.get(id)?;

        let applied = self
            .gateway
            .apply(ChangeSet::new().remove(ConfigFile::Site(site.id.clone())))
            .await;
        if applied.as_ref().map_or_else(GatewayError::promoted, |_| true) {
            self.store.delete_site(&site.id)?;
            tracing::info!(id = %site.id, "Deleted site");
        }
        applied?;
        Ok(())
    }

    /// Re-render every SSL site that uses `certificate_id` and apply them in
    /// one change set. Sites that no longer render are skipped with a warning.
    pub async fn refresh_for_certificate(&self, certificate_id: &str) -> Result<usize, SiteError> {
        let _write = self.write.lock().await;
        let mut changes = ChangeSet::new();
        for site in self.store.sites_using_certificate(certificate_id)? {
            if !site.ssl {
                continue;
            }
            match self.render(site.clone()) {
                Ok((site, text)) => changes = changes.write(ConfigFile::Site(site.id), text),
                Err(e) => {
                    tracing::warn!(id = %site.id, certificate_id = %certificate_id, error = %e, "Skipping site refresh")
                }
            }
        }

        let count = changes.len();
        if count > 0 {
            self.gateway.apply(changes).await?;
            tracing::info!(certificate_id = %certificate_id, sites = count, "Refreshed sites for renewed certificate");
        }
        Ok(count)
    }

    fn render(&self, site: ProxySite) -> Result<(ProxySite, String), SiteError> {
        let site = normalize(site)?;
        let tls = self.resolve_tls(&site)?;
        let text = render_site(&site, tls.as_ref(), &self.settings)?;
        Ok((site, text))
    }

    /// Certificate paths for an SSL site: a managed certificate wins over
    /// direct paths and must currently be active.
    fn resolve_tls(&self, site: &ProxySite) -> Result<Option<SiteTls>, SiteError> {
        if !site.ssl {
            return Ok(None);
        }

        if let Some(certificate_id) = &site.certificate_id {
            let record = self.store.certificate(certificate_id)?.ok_or_else(|| {
                SiteError::Certificate(format!("Certificate {certificate_id} does not exist"))
            })?;
            let status = record.effective_status(SystemTime::now());
            if status != CertificateStatus::Active {
                return Err(SiteError::Certificate(format!(
                    "Certificate {certificate_id} is {status}; choose an active certificate"
                )));
            }
            return match (&record.cert_path, &record.key_path) {
                (Some(cert), Some(key)) => Ok(Some(SiteTls {
                    cert_path: cert.display().to_string(),
                    key_path: key.display().to_string(),
                })),
                _ => Err(SiteError::Certificate(format!(
                    "Certificate {certificate_id} has no installed material"
                ))),
            };
        }

        Ok(match (&site.ssl_cert, &site.ssl_key) {
            (Some(cert), Some(key)) => Some(SiteTls {
                cert_path: cert.clone(),
                key_path: key.clone(),
            }),
            _ => None,
        })
    }
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize(mut site: ProxySite) -> Result<ProxySite, SiteError> {
    site.server_name = site.server_name.trim().to_ascii_lowercase();
    site.upstream_host = site.upstream_host.trim().to_string();
    site.certificate_id = blank_to_none(site.certificate_id);
    site.ssl_cert = blank_to_none(site.ssl_cert);
    site.ssl_key = blank_to_none(site.ssl_key);

    if site.server_name.is_empty() {
        return Err(ValidationError::Required {
            field: "server_name",
        }
        .into());
    }
    site.id = site.id.trim().to_string();
    if site.id.is_empty() {
        site.id = sanitize_id(&site.server_name);
    }
    validate_id(&site.id)?;
    Ok(site)
}
