//! ACME DNS-01 issuance through the `lego` command-line client.
//!
//! One [`AcmeIssuer::attempt`] is one client run. The outcome is classified by
//! [`super::classify`]; on success the issued files are read back from the
//! client's certificate directory and inspected with `x509-parser`.

use async_trait::async_trait;
use hop_core::{AcmeClientStatus, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use super::classify::{Outcome, classify};
use crate::command::{CommandRunner, CommandSpec, RunError};
use crate::defaults::{ACME_VERSION_PROBE_TIMEOUT, RENEWAL_WINDOW_DAYS};
use crate::dns::Credentials;
use crate::state_store::from_unix_secs;

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error(
        "A DNS validation record already exists for this domain. Run cleanup, then retry: {0}"
    )]
    DomainConflict(String),

    #[error("DNS provider rejected the credentials: {0}")]
    ProviderAuthFailure(String),

    #[error("Certificate authority rate limit reached, retry later: {0}")]
    RateLimited(String),

    #[error("Certificate is not due for renewal")]
    NoRenewalNeeded,

    #[error("{0}")]
    IssuerFailure(String),

    #[error("ACME client timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Issued certificate is unusable: {0}")]
    Material(String),
}

impl AcmeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcmeError::DomainConflict(_) => ErrorKind::DomainConflict,
            AcmeError::ProviderAuthFailure(_) => ErrorKind::ProviderAuthFailure,
            AcmeError::RateLimited(_) => ErrorKind::RateLimited,
            AcmeError::NoRenewalNeeded
            | AcmeError::IssuerFailure(_)
            | AcmeError::Timeout(_)
            | AcmeError::Material(_) => ErrorKind::IssuerFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueMode {
    /// Order a new certificate.
    Issue,
    /// Renew the certificate the client already holds for these domains.
    Renew,
}

#[derive(Debug, Clone)]
pub struct AttemptRequest {
    /// First entry is the primary domain.
    pub domains: Vec<String>,
    pub credentials: Credentials,
    pub email: String,
    pub mode: IssueMode,
}

/// Material and metadata from a successful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub issuer: Option<String>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// Summary of a cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub revoke_attempted: bool,
    pub removed_files: Vec<PathBuf>,
}

#[async_trait]
pub trait AcmeIssuer: Send + Sync {
    async fn attempt(&self, request: &AttemptRequest) -> Result<IssuedCertificate, AcmeError>;

    /// Purge the client's leftover state for `domains`. Best effort.
    async fn cleanup(
        &self,
        domains: &[String],
        credentials: &Credentials,
        email: &str,
    ) -> CleanupReport;

    async fn status(&self) -> AcmeClientStatus;
}

/// Validity window and issuer of a PEM certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    pub issuer: Option<String>,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
}

/// Read the first certificate in a PEM bundle.
pub fn inspect_certificate(pem_data: &[u8]) -> Result<CertificateDetails, AcmeError> {
    use x509_parser::prelude::*;

    for pem in Pem::iter_from_buffer(pem_data) {
        let pem = pem.map_err(|e| AcmeError::Material(format!("invalid PEM: {e}")))?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| AcmeError::Material(format!("invalid certificate: {e}")))?;

        let issuer = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .or_else(|| {
                let text = cert.issuer().to_string();
                (!text.is_empty()).then_some(text)
            });
        let validity = cert.validity();
        return Ok(CertificateDetails {
            issuer,
            not_before: from_unix_secs(validity.not_before.timestamp()),
            not_after: from_unix_secs(validity.not_after.timestamp()),
        });
    }

    Err(AcmeError::Material(
        "no certificate found in PEM data".to_string(),
    ))
}

/// File stem the client uses for a domain: `*.example.com` → `_.example.com`.
pub fn file_stem(domain: &str) -> String {
    domain.replace('*', "_")
}

#[derive(Debug, Clone)]
pub struct LegoConfig {
    pub binary: String,
    /// The client's `--path` directory.
    pub lego_dir: PathBuf,
    pub timeout: Duration,
    pub disable_propagation_check: bool,
}

pub struct LegoIssuer {
    runner: Arc<dyn CommandRunner>,
    config: LegoConfig,
}

impl LegoIssuer {
    pub fn new(runner: Arc<dyn CommandRunner>, config: LegoConfig) -> Self {
        Self { runner, config }
    }

    fn certificates_dir(&self) -> PathBuf {
        self.config.lego_dir.join("certificates")
    }

    fn material_paths(&self, domain: &str) -> (PathBuf, PathBuf) {
        let stem = file_stem(domain);
        let dir = self.certificates_dir();
        (
            dir.join(format!("{stem}.crt")),
            dir.join(format!("{stem}.key")),
        )
    }

    fn base_command(&self, credentials: &Credentials, email: &str) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.config.binary, self.config.timeout)
            .args(["--accept-tos", "--email", email])
            .args(["--dns", credentials.lego_provider()])
            .arg("--path")
            .arg(self.config.lego_dir.display().to_string());
        if self.config.disable_propagation_check {
            spec = spec.arg("--dns.disable-cp");
        }
        for (key, value) in credentials.env_vars() {
            spec = spec.env(key, value);
        }
        spec
    }

    fn attempt_command(&self, request: &AttemptRequest, renew: bool) -> CommandSpec {
        let mut spec = self.base_command(&request.credentials, &request.email);
        for domain in &request.domains {
            spec = spec.args(["--domains", domain.as_str()]);
        }
        if renew {
            spec.args(["renew", "--days"]).arg(RENEWAL_WINDOW_DAYS.to_string())
        } else {
            spec.arg("run")
        }
    }

    fn read_material(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        let (cert_path, key_path) = self.material_paths(domain);
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                AcmeError::Material(format!("{} was not produced: {e}", path.display()))
            })
        };
        let cert_pem = read(&cert_path)?;
        let key_pem = read(&key_path)?;
        let details = inspect_certificate(&cert_pem)?;
        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            issuer: details.issuer,
            not_before: details.not_before,
            not_after: details.not_after,
        })
    }
}

#[async_trait]
impl AcmeIssuer for LegoIssuer {
    async fn attempt(&self, request: &AttemptRequest) -> Result<IssuedCertificate, AcmeError> {
        let primary = request
            .domains
            .first()
            .ok_or_else(|| AcmeError::IssuerFailure("no domains requested".to_string()))?;

        // The client can only renew what it already holds.
        let renew = request.mode == IssueMode::Renew && self.material_paths(primary).0.is_file();
        std::fs::create_dir_all(&self.config.lego_dir).map_err(|e| {
            AcmeError::IssuerFailure(format!(
                "failed to create {}: {e}",
                self.config.lego_dir.display()
            ))
        })?;

        let spec = self.attempt_command(request, renew);
        tracing::info!(
            domains = ?request.domains,
            provider = request.credentials.lego_provider(),
            renew,
            "Starting ACME client"
        );

        let output = match self.runner.run(spec).await {
            Ok(output) => output,
            Err(RunError::Timeout { after, .. }) => return Err(AcmeError::Timeout(after)),
            Err(e) => return Err(AcmeError::IssuerFailure(e.to_string())),
        };

        match classify(&output, renew) {
            Outcome::Success => {
                tracing::info!(domain = %primary, "ACME client finished");
                self.read_material(primary)
            }
            Outcome::NoRenewalNeeded => Err(AcmeError::NoRenewalNeeded),
            Outcome::DomainConflict(detail) => Err(AcmeError::DomainConflict(detail)),
            Outcome::ProviderAuthFailure(detail) => Err(AcmeError::ProviderAuthFailure(detail)),
            Outcome::RateLimited(detail) => Err(AcmeError::RateLimited(detail)),
            Outcome::IssuerFailure(detail) => Err(AcmeError::IssuerFailure(detail)),
        }
    }

    async fn cleanup(
        &self,
        domains: &[String],
        credentials: &Credentials,
        email: &str,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();

        for domain in domains {
            let (cert_path, key_path) = self.material_paths(domain);

            // Revoking a leftover certificate makes the client tear down its
            // challenge records.
            if cert_path.is_file() {
                report.revoke_attempted = true;
                let spec = self
                    .base_command(credentials, email)
                    .args(["revoke", "--cert"])
                    .arg(cert_path.display().to_string());
                match self.runner.run(spec).await {
                    Ok(output) if output.success() => {}
                    Ok(output) => tracing::debug!(
                        domain = %domain,
                        detail = output.detail(),
                        "Revoke during cleanup failed"
                    ),
                    Err(e) => tracing::debug!(domain = %domain, error = %e, "Revoke during cleanup failed"),
                }
            }

            let stem = file_stem(domain);
            let dir = self.certificates_dir();
            for path in [
                cert_path,
                key_path,
                dir.join(format!("{stem}.json")),
                dir.join(format!("{stem}.issuer.crt")),
            ] {
                match std::fs::remove_file(&path) {
                    Ok(()) => report.removed_files.push(path),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove ACME client file")
                    }
                }
            }
        }

        report
    }

    async fn status(&self) -> AcmeClientStatus {
        let spec = CommandSpec::new(&self.config.binary, ACME_VERSION_PROBE_TIMEOUT).arg("--version");
        let (installed, version) = match self.runner.run(spec).await {
            Ok(output) if output.success() => {
                let version = output
                    .stdout
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(str::to_string);
                (true, version)
            }
            _ => (false, None),
        };
        AcmeClientStatus {
            binary: self.config.binary.clone(),
            installed,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::dns::CloudflareAuth;
    use crate::test_support::{ScriptedRunner, output, pem_pair};
    use tempfile::TempDir;
    use time::{Duration as TimeDuration, OffsetDateTime};

    fn credentials() -> Credentials {
        Credentials::Cloudflare(CloudflareAuth::ApiToken("tok".to_string()))
    }

    fn request(domains: &[&str], mode: IssueMode) -> AttemptRequest {
        AttemptRequest {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            credentials: credentials(),
            email: "ops@example.com".to_string(),
            mode,
        }
    }

    fn issuer(temp: &TempDir, runner: Arc<ScriptedRunner>) -> LegoIssuer {
        LegoIssuer::new(
            runner,
            LegoConfig {
                binary: "lego".to_string(),
                lego_dir: temp.path().join("lego"),
                timeout: Duration::from_secs(30),
                disable_propagation_check: true,
            },
        )
    }

    /// Runner that behaves like the client: a run or renew writes material.
    fn writing_runner(lego_dir: PathBuf, domain: &str) -> Arc<ScriptedRunner> {
        let now = OffsetDateTime::now_utc();
        let (cert, key) = pem_pair(&[domain], now, now + TimeDuration::days(90));
        let stem = file_stem(domain);
        ScriptedRunner::new(move |spec| {
            let dir = lego_dir.join("certificates");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(format!("{stem}.crt")), &cert).unwrap();
            std::fs::write(dir.join(format!("{stem}.key")), &key).unwrap();
            assert!(spec.args.iter().any(|a| a == "run" || a == "renew"));
            Ok(output(0, "ok", ""))
        })
    }

    #[tokio::test]
    async fn issue_builds_command_and_reads_material() {
        let temp = TempDir::new().unwrap();
        let runner = writing_runner(temp.path().join("lego"), "*.example.com");
        let issuer = issuer(&temp, runner.clone());

        let issued = issuer
            .attempt(&request(&["*.example.com", "example.com"], IssueMode::Issue))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&issued.cert_pem).contains("BEGIN CERTIFICATE"));
        assert!(issued.not_after > SystemTime::now() + Duration::from_secs(89 * 86_400));
        assert!(issued.issuer.is_some());

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert_eq!(args.last().map(String::as_str), Some("run"));
        for expected in ["--accept-tos", "--dns.disable-cp", "cloudflare", "*.example.com", "example.com"] {
            assert!(args.iter().any(|a| a == expected), "missing {expected} in {args:?}");
        }
        assert_eq!(
            calls[0].env,
            vec![("CF_DNS_API_TOKEN".to_string(), "tok".to_string())]
        );
    }

    #[tokio::test]
    async fn renew_without_client_state_falls_back_to_run() {
        let temp = TempDir::new().unwrap();
        let runner = writing_runner(temp.path().join("lego"), "example.com");
        let issuer = issuer(&temp, runner.clone());

        issuer
            .attempt(&request(&["example.com"], IssueMode::Renew))
            .await
            .unwrap();
        assert_eq!(runner.calls()[0].args.last().map(String::as_str), Some("run"));

        issuer
            .attempt(&request(&["example.com"], IssueMode::Renew))
            .await
            .unwrap();
        let args = &runner.calls()[1].args;
        let renew_at = args.iter().position(|a| a == "renew").unwrap();
        assert_eq!(&args[renew_at..], &["renew", "--days", "30"]);
    }

    #[tokio::test]
    async fn classified_failures_map_to_errors() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(output(1, "", "acme: TXT record already exists")));
        let issuer = issuer(&temp, runner);
        let err = issuer
            .attempt(&request(&["example.com"], IssueMode::Issue))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DomainConflict);
        assert!(err.to_string().contains("cleanup"));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            Err(RunError::Timeout {
                program: spec.program.clone(),
                after: Duration::from_secs(300),
            })
        });
        let err = issuer(&temp, runner)
            .attempt(&request(&["example.com"], IssueMode::Issue))
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::Timeout(d) if d.as_secs() == 300));
        assert_eq!(err.kind(), ErrorKind::IssuerFailure);
    }

    #[tokio::test]
    async fn success_without_files_is_a_material_error() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(output(0, "", "")));
        let err = issuer(&temp, runner)
            .attempt(&request(&["example.com"], IssueMode::Issue))
            .await
            .unwrap_err();
        assert!(matches!(err, AcmeError::Material(_)));
    }

    #[tokio::test]
    async fn cleanup_revokes_and_removes_client_files() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("lego").join("certificates");
        std::fs::create_dir_all(&dir).unwrap();
        for ext in ["crt", "key", "json", "issuer.crt"] {
            std::fs::write(dir.join(format!("_.example.com.{ext}")), "x").unwrap();
        }

        let runner = ScriptedRunner::new(|_| Ok(output(1, "", "already revoked")));
        let issuer = issuer(&temp, runner.clone());
        let report = issuer
            .cleanup(&["*.example.com".to_string()], &credentials(), "ops@example.com")
            .await;

        assert!(report.revoke_attempted);
        assert_eq!(report.removed_files.len(), 4);
        assert!(std::fs::read_dir(&dir).unwrap().next().is_none());
        let args = &runner.calls()[0].args;
        assert!(args.iter().any(|a| a == "revoke"));
    }

    #[tokio::test]
    async fn cleanup_without_state_does_nothing() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::default()));
        let issuer = issuer(&temp, runner.clone());
        let report = issuer
            .cleanup(&["example.com".to_string()], &credentials(), "ops@example.com")
            .await;
        assert_eq!(report, CleanupReport::default());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn status_reports_version() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(output(0, "lego version 4.17.4 linux/amd64\n", "")));
        let status = issuer(&temp, runner).status().await;
        assert!(status.installed);
        assert_eq!(status.version.as_deref(), Some("lego version 4.17.4 linux/amd64"));

        let missing = ScriptedRunner::new(|spec| {
            Err(RunError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        });
        let status = issuer(&temp, missing).status().await;
        assert!(!status.installed);
        assert!(status.version.is_none());
    }

    #[test]
    fn inspect_certificate_reads_validity() {
        let not_before = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let not_after = not_before + TimeDuration::days(90);
        let (cert, _) = pem_pair(&["example.com"], not_before, not_after);

        let details = inspect_certificate(cert.as_bytes()).unwrap();
        assert_eq!(details.not_before, from_unix_secs(1_700_000_000));
        assert_eq!(details.not_after, from_unix_secs(1_700_000_000 + 90 * 86_400));
    }

    #[test]
    fn inspect_certificate_rejects_garbage() {
        assert!(inspect_certificate(b"not a pem").is_err());
    }

    #[test]
    fn wildcard_file_stem() {
        assert_eq!(file_stem("*.example.com"), "_.example.com");
        assert_eq!(file_stem("example.com"), "example.com");
    }
}
