//! Input validation shared by the registry, the lifecycle manager and the
//! site/route services. Everything here runs before any external call.

use hop_core::TemplateParams;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("Invalid hostname '{0}'")]
    InvalidHostname(String),

    #[error("Hostname '{0}' must include a TLD (e.g. 'example.com' not 'example')")]
    MissingTld(String),

    #[error("Invalid backend '{0}': expected host:port")]
    InvalidBackend(String),

    #[error("Port {0} is out of range (1-65535)")]
    PortOutOfRange(u32),

    #[error("Invalid email address '{0}'")]
    InvalidEmail(String),

    #[error("Invalid id '{0}': use lowercase letters, digits, '.', '-' or '_'")]
    InvalidId(String),

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },
}

const MAX_LABEL_LEN: usize = 63;
const MAX_HOSTNAME_LEN: usize = 253;

/// Validate a DNS hostname with an optional `*.` wildcard prefix.
///
/// Rules: at least two labels, each 1-63 ASCII alphanumerics or hyphens, not
/// starting or ending with a hyphen.
pub fn validate_hostname(hostname: &str) -> Result<(), ValidationError> {
    if hostname.is_empty() {
        return Err(ValidationError::Required { field: "hostname" });
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(ValidationError::InvalidHostname(hostname.to_string()));
    }

    let bare = hostname.strip_prefix("*.").unwrap_or(hostname);
    if bare.is_empty() {
        return Err(ValidationError::InvalidHostname(hostname.to_string()));
    }
    if !bare.contains('.') {
        return Err(ValidationError::MissingTld(hostname.to_string()));
    }

    for label in bare.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(ValidationError::InvalidHostname(hostname.to_string()));
        }
    }

    Ok(())
}

/// Trim, lowercase and validate a list of certificate domains. Duplicates are
/// dropped, first occurrence wins.
pub fn normalize_domains(domains: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut out: Vec<String> = Vec::with_capacity(domains.len());
    for domain in domains {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            continue;
        }
        validate_hostname(&domain)?;
        if !out.contains(&domain) {
            out.push(domain);
        }
    }
    if out.is_empty() {
        return Err(ValidationError::Required { field: "domains" });
    }
    Ok(out)
}

pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    };
    let valid = !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !email.chars().any(|c| c.is_whitespace() || c == ';');
    if !valid {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }
    Ok(())
}

pub fn validate_port(port: u32) -> Result<u16, ValidationError> {
    match u16::try_from(port) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(ValidationError::PortOutOfRange(port)),
    }
}

/// A host the gateway connects to: hostname, IPv4 address or bracketed IPv6.
pub fn validate_upstream_host(host: &str) -> Result<(), ValidationError> {
    if host.is_empty() {
        return Err(ValidationError::Required {
            field: "upstream_host",
        });
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        return inner
            .parse::<std::net::Ipv6Addr>()
            .map(|_| ())
            .map_err(|_| ValidationError::InvalidHostname(host.to_string()));
    }
    let valid = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid || host.starts_with('-') || host.starts_with('.') {
        return Err(ValidationError::InvalidHostname(host.to_string()));
    }
    Ok(())
}

/// Validate a `host:port` backend, returning its parts.
pub fn parse_backend(backend: &str) -> Result<(&str, u16), ValidationError> {
    let invalid = || ValidationError::InvalidBackend(backend.to_string());
    let (host, port) = backend.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
        return Err(invalid());
    }
    validate_upstream_host(host).map_err(|_| invalid())?;
    let port: u32 = port.parse().map_err(|_| invalid())?;
    let port = validate_port(port)?;
    Ok((host, port))
}

/// Derive a filesystem-safe id from a server name: lowercase, with anything
/// outside `[a-z0-9.-_]` replaced by `_`.
pub fn sanitize_id(source: &str) -> String {
    let mapped: String = source
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    mapped.trim_start_matches('.').to_string()
}

/// Explicit ids become file names, so they must already be in sanitized form.
pub fn validate_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && sanitize_id(id) == id
        && !id.contains("..");
    if !valid {
        return Err(ValidationError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Reject values that could break out of an nginx directive.
pub fn validate_directive_value(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let unsafe_char = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, ';' | '{' | '}' | '"' | '\'' | '#'));
    if value.is_empty() || unsafe_char {
        return Err(ValidationError::InvalidValue {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

pub fn validate_template_params(params: &TemplateParams) -> Result<(), ValidationError> {
    let workers = params.worker_processes.as_str();
    let workers_ok = workers == "auto"
        || workers.parse::<u32>().is_ok_and(|n| n > 0);
    if !workers_ok {
        return Err(ValidationError::InvalidValue {
            field: "worker_processes",
            value: workers.to_string(),
        });
    }

    if params.worker_connections == 0 {
        return Err(ValidationError::InvalidValue {
            field: "worker_connections",
            value: "0".to_string(),
        });
    }

    let size = params.client_max_body_size.as_str();
    let digits = size.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    let size_ok = !digits.is_empty()
        && digits.len() + 1 >= size.len()
        && digits.chars().all(|c| c.is_ascii_digit());
    if !size_ok {
        return Err(ValidationError::InvalidValue {
            field: "client_max_body_size",
            value: size.to_string(),
        });
    }

    Ok(())
}
