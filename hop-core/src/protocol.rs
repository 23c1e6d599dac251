//! Hop management protocol types
//!
//! These types are shared between `hop-server` and any client that drives it
//! over the Unix management socket (the `hop-server call` subcommand, the web
//! API layer).

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Commands that can be sent to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Query protocol version and supported capabilities.
    Hello { protocol_version: u32 },

    ListDnsProviders,
    CreateDnsProvider {
        name: String,
        #[serde(rename = "type")]
        kind: DnsProviderKind,
        config: serde_json::Value,
    },
    GetDnsProvider {
        id: String,
    },
    UpdateDnsProvider {
        id: String,
        #[serde(flatten)]
        patch: DnsProviderPatch,
    },
    DeleteDnsProvider {
        id: String,
    },

    ListCertificates,
    /// Issue a certificate for `domains`; the first entry is the primary domain.
    IssueCertificate {
        domains: Vec<String>,
        dns_provider_id: String,
        /// ACME account email. Falls back to the server's configured email.
        #[serde(default)]
        email: Option<String>,
    },
    GetCertificate {
        id: String,
    },
    RenewCertificate {
        id: String,
        #[serde(default)]
        email: Option<String>,
    },
    /// Purge the ACME client's leftover state for a certificate's domains.
    CleanupCertificate {
        id: String,
    },
    DeleteCertificate {
        id: String,
    },
    CertificateLogs {
        id: String,
        #[serde(default)]
        limit: Option<u32>,
    },
    SetCertificateAutoRenew {
        id: String,
        auto_renew: bool,
    },
    /// Report whether the ACME client binary is installed and its version.
    AcmeStatus,

    ListSites,
    GetSite {
        id: String,
    },
    SaveSite {
        site: ProxySite,
    },
    DeleteSite {
        id: String,
    },
    /// Render a site without writing anything.
    PreviewSite {
        site: ProxySite,
    },

    ListStreamRoutes,
    GetStreamRoute {
        id: String,
    },
    SaveStreamRoute {
        route: StreamRoute,
    },
    DeleteStreamRoute {
        id: String,
    },
    ToggleStreamRoute {
        id: String,
    },

    /// Run the gateway's syntax test against the live configuration.
    GatewayTest,
    /// Signal the gateway to reload its configuration.
    GatewayReload,
    GetTemplateParams,
    SaveTemplateParams {
        params: TemplateParams,
    },
    /// Re-render the main configuration from the stored template parameters and apply it.
    RegenerateMainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    pub protocol_version: u32,
    pub server_version: String,
    pub capabilities: Vec<String>,
}

/// Response from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Command succeeded
    Ok { data: serde_json::Value },

    /// Command failed
    Error {
        message: String,
        #[serde(
            default,
            rename = "error_kind",
            skip_serializing_if = "Option::is_none"
        )]
        kind: Option<ErrorKind>,
        /// Record the failed operation left behind, e.g. a certificate in `error`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl Response {
    pub fn ok(data: impl Serialize) -> Self {
        Self::Ok {
            data: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind: None,
            id: None,
        }
    }

    /// Error response tagged with a failure class a client can act on.
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            kind: Some(kind),
            id: None,
        }
    }

    /// Attach the id of the record a failed operation touched.
    pub fn with_id(self, record_id: impl Into<String>) -> Self {
        match self {
            Self::Error { message, kind, .. } => Self::Error {
                message,
                kind,
                id: Some(record_id.into()),
            },
            ok => ok,
        }
    }

    /// Check if response is Ok
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Get data from Ok response
    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Ok { data } => Some(data),
            Self::Error { .. } => None,
        }
    }

    /// Get error message from Error response
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { message, .. } => Some(message),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { kind, .. } => *kind,
        }
    }

    pub fn error_id(&self) -> Option<&str> {
        match self {
            Self::Ok { .. } => None,
            Self::Error { id, .. } => id.as_deref(),
        }
    }
}

/// Failure classes surfaced to clients.
///
/// `DomainConflict` means a stale DNS-01 record blocks issuance; clients should
/// offer `cleanup_certificate` for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    DomainConflict,
    ProviderAuthFailure,
    RateLimited,
    IssuerFailure,
    ValidatorFailure,
    ValidatorTimeout,
    ReloadFailed,
    Busy,
    Internal,
}

/// Result of a mutating operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResult {
    pub fn created(id: impl Into<String>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            error: None,
        }
    }

    pub fn done() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }
}

/// Output of a gateway test or reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOutput {
    pub success: bool,
    pub output: String,
}

/// DNS API kinds supported for DNS-01 challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    Alidns,
    Tencentcloud,
    Cloudflare,
}

impl DnsProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DnsProviderKind::Alidns => "alidns",
            DnsProviderKind::Tencentcloud => "tencentcloud",
            DnsProviderKind::Cloudflare => "cloudflare",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alidns" => Some(DnsProviderKind::Alidns),
            "tencentcloud" => Some(DnsProviderKind::Tencentcloud),
            "cloudflare" => Some(DnsProviderKind::Cloudflare),
            _ => None,
        }
    }
}

impl std::fmt::Display for DnsProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partial update for a DNS provider. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsProviderPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<DnsProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// DNS provider as returned to clients. Secret values in `config` are masked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DnsProviderKind,
    pub config: serde_json::Value,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Certificate status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Pending,
    Active,
    Expired,
    Error,
}

impl std::fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateStatus::Pending => write!(f, "pending"),
            CertificateStatus::Active => write!(f, "active"),
            CertificateStatus::Expired => write!(f, "expired"),
            CertificateStatus::Error => write!(f, "error"),
        }
    }
}

/// Certificate as seen by clients. `status` and `days_remaining` are computed
/// at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub id: String,
    pub domain: String,
    pub domains: Vec<String>,
    pub dns_provider_id: String,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub issuer: Option<String>,
    /// Unix seconds
    pub not_before: Option<u64>,
    /// Unix seconds
    pub not_after: Option<u64>,
    pub status: CertificateStatus,
    pub error: Option<String>,
    pub auto_renew: bool,
    pub last_renew_at: Option<u64>,
    pub days_remaining: Option<i64>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Create,
    Renew,
    Error,
    Cleanup,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Create => "create",
            LogAction::Renew => "renew",
            LogAction::Error => "error",
            LogAction::Cleanup => "cleanup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(LogAction::Create),
            "renew" => Some(LogAction::Renew),
            "error" => Some(LogAction::Error),
            "cleanup" => Some(LogAction::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateLogEntry {
    pub id: i64,
    pub certificate_id: String,
    pub action: LogAction,
    pub message: String,
    pub created_at: u64,
}

/// ACME client installation status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeClientStatus {
    pub binary: String,
    pub installed: bool,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    #[default]
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }
}

/// HTTP reverse-proxy site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySite {
    /// Filesystem-safe token. Derived from `server_name` when empty.
    pub id: String,
    pub server_name: String,
    pub ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<String>,
    /// Managed certificate; takes precedence over `ssl_cert`/`ssl_key`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    pub upstream_scheme: UpstreamScheme,
    pub upstream_host: String,
    pub upstream_port: u32,
    pub websocket: bool,
    pub auth_enabled: bool,
}

/// SNI stream route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRoute {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// SNI hostname to match
    pub domain: String,
    /// `host:port`
    pub backend: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Global parameters of the gateway's main configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateParams {
    /// `auto` or a positive number
    pub worker_processes: String,
    pub worker_connections: u32,
    /// keepalive timeout in seconds
    pub keepalive: u32,
    pub client_max_body_size: String,
    pub gzip: bool,
    pub server_tokens: bool,
}

impl Default for TemplateParams {
    fn default() -> Self {
        Self {
            worker_processes: "auto".to_string(),
            worker_connections: 1024,
            keepalive: 65,
            client_max_body_size: "100m".to_string(),
            gzip: true,
            server_tokens: false,
        }
    }
}
