//! Certificate management
//!
//! Handles:
//! - ACME DNS-01 issuance and renewal through the `lego` client
//! - Failure classification of client output
//! - Certificate lifecycle with automatic renewal

mod acme;
mod classify;
mod manager;

pub use acme::{
    AcmeError, AcmeIssuer, AttemptRequest, CleanupReport, IssueMode, IssuedCertificate,
    LegoConfig, LegoIssuer, inspect_certificate,
};
pub use manager::{
    CertError, CertificateEvent, CertificateManager, CertificateManagerConfig, SweepReport,
    certificate_renewal_task,
};
