//! `hop.toml` server configuration.

use hop_core::TemplateParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::defaults;
use crate::validation::{validate_email, validate_template_params};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),

    #[error("{0} already exists (use --force to overwrite)")]
    AlreadyExists(PathBuf),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration from hop.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HopConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub data: DataSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub acme: AcmeSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub log: LogSection,
}

/// [server] section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// Management socket path
    pub socket: Option<PathBuf>,
}

/// [data] section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DataSection {
    /// Data directory. Relative paths resolve against the config file.
    pub dir: Option<PathBuf>,
}

/// [gateway] section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub binary: String,
    pub test_timeout_secs: u64,
    pub reload_timeout_secs: u64,
    pub site_listen_port: u16,
    pub stream_listen_port: u16,
    pub mime_types: String,
    /// Initial main-config parameters. Values saved over the socket win.
    pub template: TemplateParams,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            binary: "nginx".to_string(),
            test_timeout_secs: defaults::DEFAULT_GATEWAY_TEST_TIMEOUT.as_secs(),
            reload_timeout_secs: defaults::DEFAULT_GATEWAY_RELOAD_TIMEOUT.as_secs(),
            site_listen_port: defaults::DEFAULT_SITE_LISTEN_PORT,
            stream_listen_port: defaults::DEFAULT_STREAM_LISTEN_PORT,
            mime_types: "/etc/nginx/mime.types".to_string(),
            template: TemplateParams::default(),
        }
    }
}

impl GatewaySection {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_secs(self.reload_timeout_secs)
    }
}

/// [acme] section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AcmeSection {
    pub binary: String,
    /// Account email used by the renewal sweep and when a request omits one.
    pub email: Option<String>,
    pub timeout_secs: u64,
    pub renewal_interval_hours: u64,
    /// Skip the client's own DNS propagation pre-check.
    pub disable_propagation_check: bool,
}

impl Default for AcmeSection {
    fn default() -> Self {
        Self {
            binary: "lego".to_string(),
            email: None,
            timeout_secs: defaults::DEFAULT_ACME_TIMEOUT.as_secs(),
            renewal_interval_hours: defaults::DEFAULT_RENEWAL_INTERVAL.as_secs() / 3600,
            disable_propagation_check: true,
        }
    }
}

impl AcmeSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_hours.saturating_mul(3600))
    }
}

/// [auth] section: settings for sites with `auth_enabled`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    /// Where unauthenticated visitors are redirected.
    pub proxy_login_url: Option<String>,
    /// Endpoint the gateway asks via `auth_request`.
    pub validate_url: String,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            proxy_login_url: None,
            validate_url: "http://127.0.0.1:3000/api/auth/nginx".to_string(),
        }
    }
}

/// [log] section
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl HopConfig {
    /// Load a config file. Relative paths inside it are resolved against the
    /// file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_relative_to(base);
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: HopConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_relative_to(&mut self, base: &Path) {
        let resolve = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut().filter(|path| path.is_relative()) {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.data.dir);
        resolve(&mut self.server.socket);
        resolve(&mut self.log.file);
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.binary.trim().is_empty() {
            return Err(ConfigError::Validation("gateway.binary is empty".into()));
        }
        if self.acme.binary.trim().is_empty() {
            return Err(ConfigError::Validation("acme.binary is empty".into()));
        }
        if self.gateway.site_listen_port == 0 || self.gateway.stream_listen_port == 0 {
            return Err(ConfigError::Validation(
                "gateway listen ports must be non-zero".into(),
            ));
        }
        if self.gateway.site_listen_port == self.gateway.stream_listen_port {
            return Err(ConfigError::Validation(format!(
                "gateway.site_listen_port and gateway.stream_listen_port are both {}",
                self.gateway.site_listen_port
            )));
        }
        if self.acme.timeout_secs == 0
            || self.gateway.test_timeout_secs == 0
            || self.gateway.reload_timeout_secs == 0
        {
            return Err(ConfigError::Validation("timeouts must be non-zero".into()));
        }
        if !(1..=defaults::MAX_RENEWAL_INTERVAL_HOURS).contains(&self.acme.renewal_interval_hours) {
            return Err(ConfigError::Validation(format!(
                "acme.renewal_interval_hours must be between 1 and {}",
                defaults::MAX_RENEWAL_INTERVAL_HOURS
            )));
        }
        if let Some(email) = &self.acme.email {
            validate_email(email).map_err(|e| ConfigError::Validation(format!("acme.email: {e}")))?;
        }
        validate_template_params(&self.gateway.template)
            .map_err(|e| ConfigError::Validation(format!("gateway.template: {e}")))?;
        Ok(())
    }
}

/// Commented starter config written by `hop-server init`.
pub fn default_toml() -> String {
    let gateway = GatewaySection::default();
    let acme = AcmeSection::default();
    let auth = AuthSection::default();
    let template = &gateway.template;
    format!(
        r#"# hop-server configuration

[server]
# socket = "{socket}"

[data]
# Relative paths resolve against this file's directory.
# dir = "{data}"

[gateway]
binary = "{gw_binary}"
test_timeout_secs = {test_timeout}
reload_timeout_secs = {reload_timeout}
# Sites listen here; the SNI router owns the public port.
site_listen_port = {site_port}
stream_listen_port = {stream_port}
mime_types = "{mime}"

[gateway.template]
worker_processes = "{workers}"
worker_connections = {connections}
keepalive = {keepalive}
client_max_body_size = "{body}"
gzip = {gzip}
server_tokens = {tokens}

[acme]
binary = "{acme_binary}"
# email = "ops@example.com"
timeout_secs = {acme_timeout}
renewal_interval_hours = {interval}
disable_propagation_check = {disable_cp}

[auth]
# proxy_login_url = "https://login.example.com/login"
validate_url = "{validate_url}"

[log]
# file = "hop-server.log"
"#,
        socket = defaults::DEFAULT_SOCKET,
        data = defaults::DEFAULT_DATA_DIR,
        gw_binary = gateway.binary,
        test_timeout = gateway.test_timeout_secs,
        reload_timeout = gateway.reload_timeout_secs,
        site_port = gateway.site_listen_port,
        stream_port = gateway.stream_listen_port,
        mime = gateway.mime_types,
        workers = template.worker_processes,
        connections = template.worker_connections,
        keepalive = template.keepalive,
        body = template.client_max_body_size,
        gzip = template.gzip,
        tokens = template.server_tokens,
        acme_binary = acme.binary,
        acme_timeout = acme.timeout_secs,
        interval = acme.renewal_interval_hours,
        disable_cp = acme.disable_propagation_check,
        validate_url = auth.validate_url,
    )
}

/// Write the starter config to `path`, refusing to overwrite unless `force`.
pub fn write_default(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::FileWrite(parent.to_path_buf(), e))?;
    }
    std::fs::write(path, default_toml()).map_err(|e| ConfigError::FileWrite(path.to_path_buf(), e))
}
