//! Test doubles shared by unit tests.

use async_trait::async_trait;
use hop_core::AcmeClientStatus;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Notify;

use crate::command::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::dns::Credentials;
use crate::tls::{AcmeError, AcmeIssuer, AttemptRequest, CleanupReport, IssuedCertificate};

type Handler = dyn Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync;

/// Command runner that records every invocation and answers from a closure.
pub struct ScriptedRunner {
    handler: Box<Handler>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&CommandSpec) -> Result<CommandOutput, RunError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, RunError> {
        self.calls.lock().push(spec.clone());
        (self.handler)(&spec)
    }
}

pub fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

/// Self-signed certificate and key PEMs with the given validity window.
pub fn pem_pair(
    domains: &[&str],
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> (String, String) {
    let names: Vec<String> = domains.iter().map(|d| d.to_string()).collect();
    let mut params = CertificateParams::new(names).unwrap();
    params.not_before = not_before;
    params.not_after = not_after;
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// Issued material valid from now for `days`.
pub fn issued(domain: &str, days: i64) -> IssuedCertificate {
    let now = OffsetDateTime::now_utc();
    let not_after = now + time::Duration::days(days);
    let (cert, key) = pem_pair(&[domain], now, not_after);
    let details = crate::tls::inspect_certificate(cert.as_bytes()).unwrap();
    IssuedCertificate {
        cert_pem: cert.into_bytes(),
        key_pem: key.into_bytes(),
        issuer: details.issuer,
        not_before: details.not_before,
        not_after: details.not_after,
    }
}

/// Issuer that replays queued results and records every request.
#[derive(Default)]
pub struct StubIssuer {
    results: Mutex<VecDeque<Result<IssuedCertificate, AcmeError>>>,
    attempts: Mutex<Vec<AttemptRequest>>,
    cleanups: Mutex<Vec<Vec<String>>>,
    hold: Option<Arc<Notify>>,
}

impl StubIssuer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every attempt waits on `gate` before answering.
    pub fn held(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            hold: Some(gate),
            ..Default::default()
        })
    }

    pub fn push(&self, result: Result<IssuedCertificate, AcmeError>) {
        self.results.lock().push_back(result);
    }

    pub fn attempts(&self) -> Vec<AttemptRequest> {
        self.attempts.lock().clone()
    }

    pub fn cleanups(&self) -> Vec<Vec<String>> {
        self.cleanups.lock().clone()
    }
}

#[async_trait]
impl AcmeIssuer for StubIssuer {
    async fn attempt(&self, request: &AttemptRequest) -> Result<IssuedCertificate, AcmeError> {
        self.attempts.lock().push(request.clone());
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }
        let next = self.results.lock().pop_front();
        next.unwrap_or_else(|| Err(AcmeError::IssuerFailure("no scripted result".to_string())))
    }

    async fn cleanup(
        &self,
        domains: &[String],
        _credentials: &Credentials,
        _email: &str,
    ) -> CleanupReport {
        self.cleanups.lock().push(domains.to_vec());
        CleanupReport::default()
    }

    async fn status(&self) -> AcmeClientStatus {
        AcmeClientStatus {
            binary: "lego".to_string(),
            installed: true,
            version: Some("stub".to_string()),
        }
    }
}
