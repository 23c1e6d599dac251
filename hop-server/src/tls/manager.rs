//! Certificate lifecycle: issue, renew, cleanup, delete and the renewal sweep.
//!
//! Every mutation of a certificate happens under its per-id lock. The lock is
//! taken with `try_lock`, so a second caller gets [`CertError::Busy`] instead
//! of queueing. Attempts run on a spawned task that owns the lock guard; a
//! caller that disconnects cannot release the lock while the ACME client is
//! still running.

use dashmap::DashMap;
use hop_core::{AcmeClientStatus, CertificateInfo, CertificateLogEntry, ErrorKind, LogAction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};

use super::acme::{AcmeError, AcmeIssuer, AttemptRequest, IssueMode, IssuedCertificate, file_stem};
use crate::defaults::{DEFAULT_LOG_LIMIT, MAX_LOG_LIMIT, RENEWAL_WINDOW_DAYS};
use crate::dns::{DnsProviderRegistry, RegistryError};
use crate::paths::write_atomic;
use crate::state_store::{CertificateRecord, SqliteStateStore, StateStoreError, StoredStatus};
use crate::validation::{ValidationError, normalize_domains, validate_email};

/// Placeholder account for revoke-based cleanup when no email is configured.
const CLEANUP_FALLBACK_EMAIL: &str = "cleanup@example.com";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Certificate not found: {0}")]
    NotFound(String),

    #[error("Certificate {0} has an operation in progress")]
    Busy(String),

    #[error(transparent)]
    Acme(#[from] AcmeError),

    #[error(transparent)]
    Provider(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error("Failed to install certificate material at {}: {source}", .path.display())]
    Install {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Certificate task failed: {0}")]
    Task(String),

    /// An attempt ran and failed; the record carries the error now.
    #[error("{source}")]
    Attempt {
        id: String,
        source: Box<CertError>,
    },
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CertError::Validation(_) => ErrorKind::Validation,
            CertError::NotFound(_) => ErrorKind::NotFound,
            CertError::Busy(_) => ErrorKind::Busy,
            CertError::Acme(e) => e.kind(),
            CertError::Provider(e) => e.kind(),
            CertError::Store(_) | CertError::Install { .. } | CertError::Task(_) => ErrorKind::Internal,
            CertError::Attempt { source, .. } => source.kind(),
        }
    }

    /// Id of the record a failed attempt was written to.
    pub fn certificate_id(&self) -> Option<&str> {
        match self {
            CertError::Attempt { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Emitted after a certificate gains new material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateEvent {
    Activated { id: String },
}

#[derive(Debug, Clone)]
pub struct CertificateManagerConfig {
    /// Where installed `.crt`/`.key` files live.
    pub ssl_dir: PathBuf,
    /// Account email for the sweep and for requests that omit one.
    pub default_email: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub renewed: usize,
    pub failed: usize,
}

pub struct CertificateManager {
    store: Arc<SqliteStateStore>,
    registry: DnsProviderRegistry,
    issuer: Arc<dyn AcmeIssuer>,
    config: CertificateManagerConfig,
    locks: Arc<LockTable>,
    events: Option<mpsc::UnboundedSender<CertificateEvent>>,
}

type LockTable = DashMap<String, Arc<Mutex<()>>>;

/// A held per-key lock. Dropping it unlocks the key and forgets the table
/// entry once no other caller references it.
struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockTable>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// What a finished attempt writes back besides the material.
struct AttemptPlan {
    /// Status restored when the client reports nothing to renew.
    prior: StoredStatus,
    action: LogAction,
    /// Provider the record switches to once the attempt succeeds.
    dns_provider_id: String,
}

impl CertificateManager {
    pub fn new(
        store: Arc<SqliteStateStore>,
        registry: DnsProviderRegistry,
        issuer: Arc<dyn AcmeIssuer>,
        config: CertificateManagerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            issuer,
            config,
            locks: Arc::new(DashMap::new()),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<CertificateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn try_lock(&self, key: &str) -> Result<KeyGuard, CertError> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // Built before locking so a failed attempt still prunes the entry.
        let mut held = KeyGuard {
            key: key.to_string(),
            guard: None,
            locks: Arc::clone(&self.locks),
        };
        held.guard = Some(
            lock.try_lock_owned()
                .map_err(|_| CertError::Busy(key.to_string()))?,
        );
        Ok(held)
    }

    fn resolve_email(&self, email: Option<String>) -> Result<String, ValidationError> {
        let email = email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .or_else(|| self.config.default_email.clone())
            .ok_or(ValidationError::Required { field: "email" })?;
        validate_email(&email)?;
        Ok(email)
    }

    fn require(&self, id: &str) -> Result<CertificateRecord, CertError> {
        self.store
            .certificate(id)?
            .ok_or_else(|| CertError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<CertificateInfo, CertError> {
        Ok(self.require(id)?.to_info(SystemTime::now()))
    }

    pub fn record(&self, id: &str) -> Result<CertificateRecord, CertError> {
        self.require(id)
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<CertificateInfo>, CertError> {
        let now = SystemTime::now();
        Ok(self
            .store
            .list_certificates()?
            .iter()
            .map(|record| record.to_info(now))
            .collect())
    }

    pub fn logs(&self, id: &str, limit: Option<u32>) -> Result<Vec<CertificateLogEntry>, CertError> {
        self.require(id)?;
        let limit = limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
        Ok(self.store.certificate_logs(id, limit)?)
    }

    pub fn set_auto_renew(&self, id: &str, auto_renew: bool) -> Result<CertificateInfo, CertError> {
        let now = SystemTime::now();
        if !self.store.set_certificate_auto_renew(id, auto_renew, now)? {
            return Err(CertError::NotFound(id.to_string()));
        }
        tracing::info!(id = %id, auto_renew, "Updated certificate auto-renew");
        self.get(id)
    }

    pub async fn acme_status(&self) -> AcmeClientStatus {
        self.issuer.status().await
    }

    /// Issue a certificate for `domains`, reusing the record that already has
    /// the same primary domain. Returns once the attempt has finished.
    pub async fn issue(
        self: &Arc<Self>,
        domains: &[String],
        dns_provider_id: &str,
        email: Option<String>,
    ) -> Result<CertificateInfo, CertError> {
        let domains = normalize_domains(domains)?;
        let email = self.resolve_email(email)?;
        let credentials = self.registry.credentials(dns_provider_id)?;
        let primary = domains[0].clone();

        let mut guards = vec![self.try_lock(&format!("domain:{primary}"))?];
        let now = SystemTime::now();
        // A reused record keeps its domains and provider until the attempt
        // succeeds, so they keep describing the installed material.
        let mut record = match self.store.certificate_by_domain(&primary)? {
            Some(existing) => {
                guards.push(self.try_lock(&existing.id)?);
                existing
            }
            None => {
                let record = CertificateRecord::new(
                    nanoid::nanoid!(),
                    domains.clone(),
                    dns_provider_id.to_string(),
                    now,
                );
                guards.push(self.try_lock(&record.id)?);
                record
            }
        };

        let prior = record.status;
        record.status = StoredStatus::Pending;
        record.updated_at = now;
        self.store.save_certificate_with_log(
            &record,
            LogAction::Create,
            &format!("Requesting certificate for {}", domains.join(", ")),
        )?;
        tracing::info!(id = %record.id, domains = ?domains, "Issuing certificate");

        let request = AttemptRequest {
            domains,
            credentials,
            email,
            mode: IssueMode::Issue,
        };
        let plan = AttemptPlan {
            prior,
            action: LogAction::Create,
            dns_provider_id: dns_provider_id.to_string(),
        };
        self.spawn_attempt(record, plan, request, guards).await
    }

    /// Renew an existing certificate. Material and validity survive a failed
    /// attempt.
    pub async fn renew(
        self: &Arc<Self>,
        id: &str,
        email: Option<String>,
    ) -> Result<CertificateInfo, CertError> {
        let record = self.require(id)?;
        let email = self.resolve_email(email)?;
        let credentials = self.registry.credentials(&record.dns_provider_id)?;

        let guard = self.try_lock(id)?;
        // Re-read under the lock; the first read may predate another attempt.
        let mut record = self.require(id)?;
        if record.status == StoredStatus::Pending {
            return Err(CertError::Busy(id.to_string()));
        }

        let prior = record.status;
        record.status = StoredStatus::Pending;
        record.updated_at = SystemTime::now();
        self.store.save_certificate_with_log(
            &record,
            LogAction::Renew,
            &format!("Renewing certificate for {}", record.domains.join(", ")),
        )?;
        tracing::info!(id = %id, domain = %record.domain, "Renewing certificate");

        let mode = if record.has_material() {
            IssueMode::Renew
        } else {
            IssueMode::Issue
        };
        let request = AttemptRequest {
            domains: record.domains.clone(),
            credentials,
            email,
            mode,
        };
        let plan = AttemptPlan {
            prior,
            action: LogAction::Renew,
            dns_provider_id: record.dns_provider_id.clone(),
        };
        self.spawn_attempt(record, plan, request, vec![guard]).await
    }

    async fn spawn_attempt(
        self: &Arc<Self>,
        record: CertificateRecord,
        plan: AttemptPlan,
        request: AttemptRequest,
        guards: Vec<KeyGuard>,
    ) -> Result<CertificateInfo, CertError> {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = manager.run_attempt(record, &plan, &request).await;
            drop(guards);
            result
        });
        task.await.map_err(|e| CertError::Task(e.to_string()))?
    }

    async fn run_attempt(
        &self,
        mut record: CertificateRecord,
        plan: &AttemptPlan,
        request: &AttemptRequest,
    ) -> Result<CertificateInfo, CertError> {
        let action = plan.action;
        let outcome = self.issuer.attempt(request).await;
        let now = SystemTime::now();
        record.updated_at = now;

        let failure = match outcome {
            Ok(issued) => match self.install(&record.domain, &issued) {
                Ok((cert_path, key_path)) => {
                    record.domains = request.domains.clone();
                    record.dns_provider_id = plan.dns_provider_id.clone();
                    record.cert_path = Some(cert_path);
                    record.key_path = Some(key_path);
                    record.issuer = issued.issuer.clone();
                    record.not_before = Some(issued.not_before);
                    record.not_after = Some(issued.not_after);
                    record.status = StoredStatus::Active;
                    record.error = None;
                    record.last_renew_at = Some(now);

                    let verb = match action {
                        LogAction::Renew => "renewed",
                        _ => "issued",
                    };
                    let message = format!(
                        "Certificate {verb}, valid until {}",
                        format_date(issued.not_after)
                    );
                    self.store
                        .save_certificate_with_log(&record, action, &message)?;
                    tracing::info!(
                        id = %record.id,
                        domain = %record.domain,
                        days_remaining = record.days_remaining(now),
                        "Certificate {verb}"
                    );
                    self.emit(CertificateEvent::Activated {
                        id: record.id.clone(),
                    });
                    return Ok(record.to_info(now));
                }
                Err(e) => e,
            },
            Err(AcmeError::NoRenewalNeeded) => {
                record.status = plan.prior;
                self.store.save_certificate_with_log(
                    &record,
                    LogAction::Renew,
                    "Certificate is not due for renewal, nothing changed",
                )?;
                tracing::info!(id = %record.id, domain = %record.domain, "Certificate not due for renewal");
                return Ok(record.to_info(now));
            }
            Err(e) => CertError::Acme(e),
        };

        let message = failure.to_string();
        record.status = StoredStatus::Error;
        record.error = Some(message.clone());
        self.store
            .save_certificate_with_log(&record, LogAction::Error, &message)?;
        tracing::warn!(id = %record.id, domain = %record.domain, error = %message, "Certificate attempt failed");
        Err(CertError::Attempt {
            id: record.id,
            source: Box::new(failure),
        })
    }

    /// Copy issued material into the gateway's ssl directory. The key is
    /// written with mode 0600.
    fn install(
        &self,
        domain: &str,
        issued: &IssuedCertificate,
    ) -> Result<(PathBuf, PathBuf), CertError> {
        let stem = file_stem(domain);
        let cert_path = self.config.ssl_dir.join(format!("{stem}.crt"));
        let key_path = self.config.ssl_dir.join(format!("{stem}.key"));
        write_atomic(&cert_path, &issued.cert_pem, Some(0o644)).map_err(|source| {
            CertError::Install {
                path: cert_path.clone(),
                source,
            }
        })?;
        write_atomic(&key_path, &issued.key_pem, Some(0o600)).map_err(|source| {
            CertError::Install {
                path: key_path.clone(),
                source,
            }
        })?;
        Ok((cert_path, key_path))
    }

    fn emit(&self, event: CertificateEvent) {
        if let Some(events) = &self.events
            && events.send(event).is_err()
        {
            tracing::debug!("Certificate event receiver is gone");
        }
    }

    /// Purge the ACME client's leftover state for this certificate's domains.
    pub async fn cleanup(self: &Arc<Self>, id: &str) -> Result<(), CertError> {
        let record = self.require(id)?;
        let credentials = self.registry.credentials(&record.dns_provider_id)?;
        let guard = self.try_lock(id)?;
        let email = self
            .config
            .default_email
            .clone()
            .unwrap_or_else(|| CLEANUP_FALLBACK_EMAIL.to_string());

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let report = manager
                .issuer
                .cleanup(&record.domains, &credentials, &email)
                .await;
            let mut message = format!(
                "Cleaned up ACME client state for {} ({} files removed)",
                record.domains.join(", "),
                report.removed_files.len()
            );
            if report.revoke_attempted {
                message.push_str(", leftover certificate revoked");
            }
            let result = manager.store.append_certificate_log(
                &record.id,
                LogAction::Cleanup,
                &message,
                SystemTime::now(),
            );
            drop(guard);
            tracing::info!(id = %record.id, removed = report.removed_files.len(), "Cleanup finished");
            result
        });
        task.await.map_err(|e| CertError::Task(e.to_string()))??;
        Ok(())
    }

    /// Remove the record and its log. Installed files and the CA-side
    /// certificate are left alone.
    pub async fn delete(&self, id: &str) -> Result<(), CertError> {
        let guard = self.try_lock(id)?;
        let removed = self.store.delete_certificate(id);
        drop(guard);
        if !removed? {
            return Err(CertError::NotFound(id.to_string()));
        }
        tracing::info!(id = %id, "Deleted certificate");
        Ok(())
    }

    pub fn renewal_eligible(record: &CertificateRecord, now: SystemTime) -> bool {
        record.auto_renew
            && record.status != StoredStatus::Pending
            && record
                .days_remaining(now)
                .is_some_and(|days| days < RENEWAL_WINDOW_DAYS)
    }

    /// Renew every eligible certificate once. Failures are logged and left for
    /// the next cycle.
    pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport, CertError> {
        let now = SystemTime::now();
        let due: Vec<CertificateRecord> = self
            .store
            .list_certificates()?
            .into_iter()
            .filter(|record| Self::renewal_eligible(record, now))
            .collect();

        let mut report = SweepReport::default();
        if due.is_empty() {
            tracing::info!("No certificates due for renewal");
            return Ok(report);
        }

        tracing::info!(count = due.len(), "Certificates due for renewal");
        for record in due {
            report.attempted += 1;
            match self.renew(&record.id, None).await {
                Ok(info) => {
                    report.renewed += 1;
                    tracing::info!(
                        domain = %info.domain,
                        expires_in_days = info.days_remaining,
                        "Certificate renewed successfully"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(domain = %record.domain, "Certificate renewal failed: {}", e);
                }
            }
        }
        Ok(report)
    }

    /// Mark records left `pending` by a previous process as failed.
    pub fn recover_interrupted(&self) -> Result<usize, CertError> {
        let mut recovered = 0;
        for mut record in self.store.list_certificates()? {
            if record.status != StoredStatus::Pending {
                continue;
            }
            let message = "Interrupted before completion (server restarted)";
            record.status = StoredStatus::Error;
            record.error = Some(message.to_string());
            record.updated_at = SystemTime::now();
            self.store
                .save_certificate_with_log(&record, LogAction::Error, message)?;
            tracing::warn!(id = %record.id, domain = %record.domain, "Recovered interrupted certificate attempt");
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn format_date(at: SystemTime) -> String {
    time::OffsetDateTime::from(at).date().to_string()
}

/// Background loop that runs [`CertificateManager::sweep`] at startup and then
/// every `interval`.
pub async fn certificate_renewal_task(manager: Arc<CertificateManager>, interval: Duration) {
    tracing::info!(
        interval_hours = interval.as_secs() / 3600,
        "Starting certificate renewal task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        // The first tick completes immediately.
        ticker.tick().await;
        tracing::info!("Checking for certificates needing renewal...");
        if let Err(e) = manager.sweep().await {
            tracing::error!("Certificate renewal sweep failed: {}", e);
        }
    }
}
