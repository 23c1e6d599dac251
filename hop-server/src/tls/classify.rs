//! Maps ACME client output onto failure classes.
//!
//! The client reports problems as free text, so classification is plain
//! substring matching. Keeping the patterns here lets them change without
//! touching the issuer or the lifecycle state machine.

use crate::command::{CommandOutput, format_process_failure};

/// What a finished client run means for the certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A leftover `_acme-challenge` record blocks validation.
    DomainConflict(String),
    ProviderAuthFailure(String),
    RateLimited(String),
    /// Renewal was skipped because the certificate is not close to expiry.
    NoRenewalNeeded,
    IssuerFailure(String),
}

const CONFLICT_PATTERNS: &[&str] = &["already exists"];
const AUTH_PATTERNS: &[&str] = &[
    "authentication",
    "unauthorized",
    "forbidden",
    "invalid credentials",
    "access denied",
];
const RATE_LIMIT_PATTERNS: &[&str] = &["rate limit", "too many"];
const NO_RENEWAL_PATTERNS: &[&str] = &["no renewal"];

fn matches_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// Classify one client run. `renewing` enables the no-renewal check, which the
/// client may report with either exit status.
pub fn classify(output: &CommandOutput, renewing: bool) -> Outcome {
    let text = format!("{}\n{}", output.stdout, output.stderr).to_ascii_lowercase();

    if renewing && matches_any(&text, NO_RENEWAL_PATTERNS) {
        return Outcome::NoRenewalNeeded;
    }
    if output.success() {
        return Outcome::Success;
    }

    let detail = output.detail().to_string();
    if matches_any(&text, CONFLICT_PATTERNS) {
        return Outcome::DomainConflict(detail);
    }
    if matches_any(&text, AUTH_PATTERNS) {
        return Outcome::ProviderAuthFailure(detail);
    }
    if matches_any(&text, RATE_LIMIT_PATTERNS) {
        return Outcome::RateLimited(detail);
    }
    Outcome::IssuerFailure(format_process_failure("ACME client failed", output))
}
