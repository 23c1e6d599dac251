//! Assembles the engine components and answers management commands.

use hop_core::{
    Command, DnsProviderInfo, ErrorKind, HelloResponse, MutationResult, PROTOCOL_VERSION, Response,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::command::CommandRunner;
use crate::config::HopConfig;
use crate::crypto::{CryptoError, EncryptionKey};
use crate::dns::{DnsProviderRegistry, RegistryError};
use crate::gateway::{GatewayConfig, GatewayError, ReloadCoordinator, RenderSettings};
use crate::main_config::{MainConfigError, MainConfigService};
use crate::paths::DataPaths;
use crate::sites::{SiteError, SiteService};
use crate::state_store::{SqliteStateStore, StateStoreError};
use crate::streams::{RouteError, StreamService};
use crate::tls::{
    AcmeIssuer, CertError, CertificateEvent, CertificateManager, CertificateManagerConfig,
    certificate_renewal_task,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Failed to prepare data directory {0}: {1}")]
    DataDir(PathBuf, std::io::Error),

    #[error(transparent)]
    Store(#[from] StateStoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Failed to write initial gateway config: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    MainConfig(#[from] MainConfigError),

    #[error(transparent)]
    Routes(#[from] RouteError),

    #[error(transparent)]
    Certificates(#[from] CertError),
}

/// Errors that carry a client-facing failure class.
trait Failure: std::fmt::Display {
    fn kind(&self) -> ErrorKind;

    fn record_id(&self) -> Option<&str> {
        None
    }
}

impl Failure for RegistryError {
    fn kind(&self) -> ErrorKind {
        RegistryError::kind(self)
    }
}

impl Failure for SiteError {
    fn kind(&self) -> ErrorKind {
        SiteError::kind(self)
    }
}

impl Failure for RouteError {
    fn kind(&self) -> ErrorKind {
        RouteError::kind(self)
    }
}

impl Failure for MainConfigError {
    fn kind(&self) -> ErrorKind {
        MainConfigError::kind(self)
    }
}

impl Failure for GatewayError {
    fn kind(&self) -> ErrorKind {
        GatewayError::kind(self)
    }
}

impl Failure for CertError {
    fn kind(&self) -> ErrorKind {
        CertError::kind(self)
    }

    fn record_id(&self) -> Option<&str> {
        self.certificate_id()
    }
}

fn respond<T: Serialize, E: Failure>(result: Result<T, E>) -> Response {
    match result {
        Ok(data) => Response::ok(data),
        Err(e) => {
            let response = Response::failure(e.kind(), e.to_string());
            match e.record_id() {
                Some(id) => response.with_id(id),
                None => response,
            }
        }
    }
}

pub fn render_settings(config: &HopConfig) -> RenderSettings {
    RenderSettings {
        site_listen_port: config.gateway.site_listen_port,
        stream_listen_port: config.gateway.stream_listen_port,
        mime_types: config.gateway.mime_types.clone(),
        auth_validate_url: config.auth.validate_url.clone(),
        auth_login_url: config.auth.proxy_login_url.clone(),
    }
}

/// Server state shared by the socket handler and background tasks
pub struct ServerState {
    registry: DnsProviderRegistry,
    certificates: Arc<CertificateManager>,
    sites: Arc<SiteService>,
    streams: StreamService,
    main_config: MainConfigService,
    gateway: Arc<ReloadCoordinator>,
    renewal_interval: Duration,
}

impl ServerState {
    /// Open the data directory, write any missing gateway files and recover
    /// attempts interrupted by a previous process.
    pub async fn open(
        config: &HopConfig,
        paths: &DataPaths,
        runner: Arc<dyn CommandRunner>,
        issuer: Arc<dyn AcmeIssuer>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CertificateEvent>), StartupError> {
        paths
            .ensure()
            .map_err(|e| StartupError::DataDir(paths.root().to_path_buf(), e))?;

        let store = Arc::new(SqliteStateStore::new(paths.database()));
        store.init()?;
        let key = EncryptionKey::load_or_create(&paths.secret_key())?;
        let registry = DnsProviderRegistry::new(store.clone(), key);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let certificates = Arc::new(
            CertificateManager::new(
                store.clone(),
                registry.clone(),
                issuer,
                CertificateManagerConfig {
                    ssl_dir: paths.ssl_dir(),
                    default_email: config.acme.email.clone(),
                },
            )
            .with_events(events_tx),
        );

        let gateway = Arc::new(ReloadCoordinator::new(
            runner,
            GatewayConfig {
                binary: config.gateway.binary.clone(),
                live_dir: paths.nginx_dir(),
                staging_dir: paths.staging_dir(),
                test_timeout: config.gateway.test_timeout(),
                reload_timeout: config.gateway.reload_timeout(),
            },
        ));

        let settings = render_settings(config);
        let sites = Arc::new(SiteService::new(store.clone(), gateway.clone(), settings.clone()));
        let streams = StreamService::new(store.clone(), gateway.clone(), settings.clone());
        let main_config = MainConfigService::load(
            store.clone(),
            gateway.clone(),
            settings,
            config.gateway.template.clone(),
        )?;

        if gateway
            .bootstrap(&main_config.render()?, &streams.render()?)
            .await?
        {
            tracing::info!(dir = %paths.nginx_dir().display(), "Wrote initial gateway config");
        }

        let recovered = certificates.recover_interrupted()?;
        if recovered > 0 {
            tracing::warn!(count = recovered, "Marked interrupted certificate attempts as failed");
        }

        let state = Self {
            registry,
            certificates,
            sites,
            streams,
            main_config,
            gateway,
            renewal_interval: config.acme.renewal_interval(),
        };
        Ok((state, events_rx))
    }

    /// Start the renewal sweep and the site refresh on certificate activation.
    pub fn spawn_background(&self, mut events: mpsc::UnboundedReceiver<CertificateEvent>) {
        tokio::spawn(certificate_renewal_task(
            self.certificates.clone(),
            self.renewal_interval,
        ));

        let sites = self.sites.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    CertificateEvent::Activated { id } => {
                        if let Err(e) = sites.refresh_for_certificate(&id).await {
                            tracing::error!(certificate_id = %id, "Failed to refresh sites: {}", e);
                        }
                    }
                }
            }
        });
    }

    pub async fn handle_command(&self, cmd: Command) -> Response {
        match cmd {
            Command::Hello { protocol_version } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Response::failure(
                        ErrorKind::Validation,
                        format!(
                            "Protocol version mismatch: client={} server={}",
                            protocol_version, PROTOCOL_VERSION
                        ),
                    );
                }
                Response::ok(HelloResponse {
                    protocol_version: PROTOCOL_VERSION,
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                    capabilities: vec![
                        "dns_providers".to_string(),
                        "certificates".to_string(),
                        "certificate_cleanup".to_string(),
                        "proxy_sites".to_string(),
                        "stream_routes".to_string(),
                        "gateway_control".to_string(),
                    ],
                })
            }

            Command::ListDnsProviders => respond(self.list_providers()),
            Command::CreateDnsProvider { name, kind, config } => respond(
                self.registry
                    .create(&name, kind, &config)
                    .map(|p| MutationResult::created(p.id)),
            ),
            Command::GetDnsProvider { id } => respond(self.registry.get(&id).map(|p| p.info())),
            Command::UpdateDnsProvider { id, patch } => respond(
                self.registry
                    .update(&id, &patch)
                    .map(|p| MutationResult::created(p.id)),
            ),
            Command::DeleteDnsProvider { id } => {
                respond(self.registry.delete(&id).map(|_| MutationResult::done()))
            }

            Command::ListCertificates => respond(self.certificates.list()),
            Command::IssueCertificate {
                domains,
                dns_provider_id,
                email,
            } => respond(
                self.certificates
                    .issue(&domains, &dns_provider_id, email)
                    .await
                    .map(|info| MutationResult::created(info.id)),
            ),
            Command::GetCertificate { id } => respond(self.certificates.get(&id)),
            Command::RenewCertificate { id, email } => respond(
                self.certificates
                    .renew(&id, email)
                    .await
                    .map(|info| MutationResult::created(info.id)),
            ),
            Command::CleanupCertificate { id } => respond(
                self.certificates
                    .cleanup(&id)
                    .await
                    .map(|_| MutationResult::done()),
            ),
            Command::DeleteCertificate { id } => respond(
                self.certificates
                    .delete(&id)
                    .await
                    .map(|_| MutationResult::done()),
            ),
            Command::CertificateLogs { id, limit } => respond(self.certificates.logs(&id, limit)),
            Command::SetCertificateAutoRenew { id, auto_renew } => {
                respond(self.certificates.set_auto_renew(&id, auto_renew))
            }
            Command::AcmeStatus => Response::ok(self.certificates.acme_status().await),

            Command::ListSites => respond(self.sites.list()),
            Command::GetSite { id } => respond(self.sites.get(&id)),
            Command::SaveSite { site } => respond(
                self.sites
                    .save(site)
                    .await
                    .map(|site| MutationResult::created(site.id)),
            ),
            Command::DeleteSite { id } => {
                respond(self.sites.delete(&id).await.map(|_| MutationResult::done()))
            }
            Command::PreviewSite { site } => respond(self.sites.preview(site)),

            Command::ListStreamRoutes => respond(self.streams.list()),
            Command::GetStreamRoute { id } => respond(self.streams.get(&id)),
            Command::SaveStreamRoute { route } => respond(
                self.streams
                    .save(route)
                    .await
                    .map(|route| MutationResult::created(route.id)),
            ),
            Command::DeleteStreamRoute { id } => respond(
                self.streams
                    .delete(&id)
                    .await
                    .map(|_| MutationResult::done()),
            ),
            Command::ToggleStreamRoute { id } => respond(self.streams.toggle(&id).await),

            Command::GatewayTest => Response::ok(self.gateway.test().await),
            Command::GatewayReload => Response::ok(self.gateway.reload().await),
            Command::GetTemplateParams => Response::ok(self.main_config.params()),
            Command::SaveTemplateParams { params } => respond(
                self.main_config
                    .save(params)
                    .await
                    .map(|_| MutationResult::done()),
            ),
            Command::RegenerateMainConfig => respond(
                self.main_config
                    .regenerate()
                    .await
                    .map(|_| MutationResult::done()),
            ),
        }
    }

    fn list_providers(&self) -> Result<Vec<DnsProviderInfo>, RegistryError> {
        Ok(self.registry.list()?.iter().map(|p| p.info()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, StubIssuer, issued, output};
    use crate::tls::AcmeError;
    use hop_core::{CertificateInfo, CertificateStatus, ProxySite, StreamRoute};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    struct Harness {
        temp: TempDir,
        state: ServerState,
        issuer: Arc<StubIssuer>,
        runner: Arc<ScriptedRunner>,
        _events: mpsc::UnboundedReceiver<CertificateEvent>,
    }

    async fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        let mut config = HopConfig::default();
        config.acme.email = Some("ops@example.com".to_string());
        let paths = DataPaths::new(temp.path().join("data"));
        let runner = ScriptedRunner::new(|_| Ok(output(0, "", "syntax is ok")));
        let issuer = StubIssuer::new();
        let (state, events) = ServerState::open(&config, &paths, runner.clone(), issuer.clone())
            .await
            .unwrap();
        Harness {
            temp,
            state,
            issuer,
            runner,
            _events: events,
        }
    }

    impl Harness {
        async fn call(&self, cmd: Value) -> Response {
            let cmd: Command = serde_json::from_value(cmd).unwrap();
            self.state.handle_command(cmd).await
        }

        async fn ok(&self, cmd: Value) -> Value {
            let response = self.call(cmd).await;
            assert!(response.is_ok(), "{:?}", response);
            response.data().cloned().unwrap()
        }

        async fn provider(&self) -> String {
            let data = self
                .ok(json!({
                    "command": "create_dns_provider",
                    "name": "cf",
                    "type": "cloudflare",
                    "config": {"apiToken": "secret-token"}
                }))
                .await;
            data["id"].as_str().unwrap().to_string()
        }

        fn live(&self, rel: &str) -> PathBuf {
            self.temp.path().join("data").join("nginx").join(rel)
        }
    }

    #[tokio::test]
    async fn open_bootstraps_gateway_tree() {
        let h = harness().await;
        let main = std::fs::read_to_string(h.live("nginx.conf")).unwrap();
        assert!(main.contains("include stream.conf;"));
        assert!(h.live("stream.conf").is_file());
        assert!(h.live("conf.d").is_dir());
        assert!(h.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn hello_checks_protocol_version() {
        let h = harness().await;
        let data = h.ok(json!({"command": "hello", "protocol_version": 1})).await;
        assert_eq!(data["protocol_version"], 1);

        let response = h.call(json!({"command": "hello", "protocol_version": 99})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn provider_secrets_are_masked() {
        let h = harness().await;
        let id = h.provider().await;
        let data = h.ok(json!({"command": "get_dns_provider", "id": id})).await;
        assert_eq!(data["type"], "cloudflare");
        assert!(!data.to_string().contains("secret-token"));

        let response = h
            .call(json!({"command": "create_dns_provider", "name": "ali", "type": "alidns", "config": {}}))
            .await;
        assert_eq!(response.error_kind(), Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn issue_reports_active_certificate() {
        let h = harness().await;
        let provider = h.provider().await;
        h.issuer.push(Ok(issued("example.com", 60)));

        let data = h
            .ok(json!({
                "command": "issue_certificate",
                "domains": ["example.com"],
                "dns_provider_id": provider,
                "email": "a@b.com"
            }))
            .await;
        assert_eq!(data["success"], true);
        let id = data["id"].as_str().unwrap();

        let info: CertificateInfo =
            serde_json::from_value(h.ok(json!({"command": "get_certificate", "id": id})).await)
                .unwrap();
        assert_eq!(info.status, CertificateStatus::Active);
        assert!(matches!(info.days_remaining, Some(59) | Some(60)));
    }

    #[tokio::test]
    async fn conflict_then_cleanup_then_issue() {
        let h = harness().await;
        let provider = h.provider().await;
        h.issuer.push(Err(AcmeError::DomainConflict(
            "TXT record already exists".to_string(),
        )));

        let issue = json!({
            "command": "issue_certificate",
            "domains": ["example.com"],
            "dns_provider_id": provider
        });
        let response = h.call(issue.clone()).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::DomainConflict));
        let id = response.error_id().unwrap().to_string();

        let info = h.ok(json!({"command": "get_certificate", "id": id})).await;
        assert_eq!(info["status"], "error");
        assert!(info["error"].as_str().unwrap().contains("already exists"));

        h.ok(json!({"command": "cleanup_certificate", "id": id})).await;
        assert_eq!(h.issuer.cleanups(), vec![vec!["example.com".to_string()]]);

        h.issuer.push(Ok(issued("example.com", 90)));
        let data = h.ok(issue).await;
        assert_eq!(data["id"], id.as_str());
        let info = h.ok(json!({"command": "get_certificate", "id": id})).await;
        assert_eq!(info["status"], "active");
    }

    #[tokio::test]
    async fn site_preview_then_save() {
        let h = harness().await;
        let provider = h.provider().await;
        h.issuer.push(Ok(issued("app.example.com", 90)));
        let cert = h
            .ok(json!({
                "command": "issue_certificate",
                "domains": ["app.example.com"],
                "dns_provider_id": provider
            }))
            .await;

        let mut site = ProxySite {
            server_name: "app.example.com".to_string(),
            ssl: true,
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 8080,
            ..Default::default()
        };
        let response = h.call(json!({"command": "preview_site", "site": site})).await;
        assert_eq!(response.error_kind(), Some(ErrorKind::Validation));

        site.certificate_id = cert["id"].as_str().map(str::to_string);
        let text = h.ok(json!({"command": "preview_site", "site": site})).await;
        let cert_path = h.live("ssl/app.example.com.crt");
        assert!(text.as_str().unwrap().contains(cert_path.to_str().unwrap()));

        let saved = h.ok(json!({"command": "save_site", "site": site})).await;
        assert_eq!(saved["id"], "app.example.com");
        assert_eq!(
            std::fs::read_to_string(h.live("conf.d/app.example.com.conf")).unwrap(),
            text.as_str().unwrap()
        );
    }

    #[tokio::test]
    async fn stream_route_toggle_round_trip() {
        let h = harness().await;
        let route = StreamRoute {
            id: String::new(),
            name: "git".to_string(),
            domain: "git.example.com".to_string(),
            backend: "10.0.0.5:22".to_string(),
            enabled: true,
        };
        let data = h.ok(json!({"command": "save_stream_route", "route": route})).await;
        let id = data["id"].as_str().unwrap().to_string();
        let enabled = std::fs::read_to_string(h.live("stream.conf")).unwrap();
        assert!(enabled.contains("git.example.com 10.0.0.5:22;"));

        let toggled = h.ok(json!({"command": "toggle_stream_route", "id": id})).await;
        assert_eq!(toggled["enabled"], false);
        assert!(!std::fs::read_to_string(h.live("stream.conf")).unwrap().contains("10.0.0.5:22"));

        h.ok(json!({"command": "toggle_stream_route", "id": id})).await;
        assert_eq!(std::fs::read_to_string(h.live("stream.conf")).unwrap(), enabled);
    }

    #[tokio::test]
    async fn not_found_is_classified() {
        let h = harness().await;
        for cmd in [
            json!({"command": "get_certificate", "id": "nope"}),
            json!({"command": "get_site", "id": "nope"}),
            json!({"command": "get_stream_route", "id": "nope"}),
            json!({"command": "delete_dns_provider", "id": "nope"}),
            json!({"command": "certificate_logs", "id": "nope"}),
        ] {
            let response = h.call(cmd.clone()).await;
            assert_eq!(response.error_kind(), Some(ErrorKind::NotFound), "{cmd}");
        }
    }

    #[tokio::test]
    async fn gateway_commands_report_output() {
        let h = harness().await;
        let data = h.ok(json!({"command": "gateway_test"})).await;
        assert_eq!(data["success"], true);
        assert!(data["output"].as_str().unwrap().contains("syntax is ok"));

        let data = h.ok(json!({"command": "gateway_reload"})).await;
        assert_eq!(data["success"], true);

        let params = h.ok(json!({"command": "get_template_params"})).await;
        assert_eq!(params["worker_processes"], "auto");
        h.ok(json!({"command": "regenerate_main_config"})).await;
    }
}
