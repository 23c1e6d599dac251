//! nginx configuration text for sites, the SNI stream block and the main file.
//!
//! Rendering is pure: the same inputs always produce byte-identical output, so
//! a preview matches what an apply would write.

use hop_core::{ErrorKind, ProxySite, StreamRoute, TemplateParams};
use thiserror::Error;

use crate::defaults::{DEFAULT_SITE_LISTEN_PORT, DEFAULT_STREAM_LISTEN_PORT};
use crate::validation::{
    ValidationError, validate_directive_value, validate_hostname, validate_port,
    validate_template_params, validate_upstream_host,
};

const HEADER: &str = "# Generated by hop. Manual edits are overwritten on the next apply.\n";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(
        "Site {0} has SSL enabled but no usable certificate: set certificate_id, or ssl_cert and ssl_key"
    )]
    MissingCertificate(String),

    #[error("Site {0} enables auth but no login URL is configured ([auth] proxy_login_url)")]
    MissingLoginUrl(String),
}

impl TemplateError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Validation
    }
}

/// Server-wide values the templates need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    /// Port the HTTP sites listen on behind the SNI router.
    pub site_listen_port: u16,
    /// Public port of the SNI router.
    pub stream_listen_port: u16,
    pub mime_types: String,
    pub auth_validate_url: String,
    pub auth_login_url: Option<String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            site_listen_port: DEFAULT_SITE_LISTEN_PORT,
            stream_listen_port: DEFAULT_STREAM_LISTEN_PORT,
            mime_types: "/etc/nginx/mime.types".to_string(),
            auth_validate_url: "http://127.0.0.1:3000/api/auth/nginx".to_string(),
            auth_login_url: None,
        }
    }
}

/// Resolved certificate paths for an SSL site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteTls {
    pub cert_path: String,
    pub key_path: String,
}

pub fn render_site(
    site: &ProxySite,
    tls: Option<&SiteTls>,
    settings: &RenderSettings,
) -> Result<String, TemplateError> {
    validate_hostname(&site.server_name)?;
    validate_upstream_host(&site.upstream_host)?;
    let upstream_port = validate_port(site.upstream_port)?;

    let tls = match (site.ssl, tls) {
        (true, Some(tls)) => {
            validate_directive_value("ssl_cert", &tls.cert_path)?;
            validate_directive_value("ssl_key", &tls.key_path)?;
            Some(tls)
        }
        (true, None) => return Err(TemplateError::MissingCertificate(site.server_name.clone())),
        (false, _) => None,
    };

    let login_url = if site.auth_enabled {
        let url = settings
            .auth_login_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TemplateError::MissingLoginUrl(site.server_name.clone()))?;
        validate_directive_value("proxy_login_url", url)?;
        validate_directive_value("validate_url", &settings.auth_validate_url)?;
        Some(url)
    } else {
        None
    };

    let mut out = String::from(HEADER);
    out.push_str(&format!("# site: {}\n", site.server_name));
    out.push_str("server {\n");
    let ssl = if tls.is_some() { " ssl" } else { "" };
    out.push_str(&format!("    listen {}{ssl};\n", settings.site_listen_port));
    out.push_str(&format!("    server_name {};\n", site.server_name));

    if let Some(tls) = tls {
        out.push('\n');
        out.push_str(&format!("    ssl_certificate {};\n", tls.cert_path));
        out.push_str(&format!("    ssl_certificate_key {};\n", tls.key_path));
    }

    if let Some(login_url) = login_url {
        out.push_str("\n    location = /auth-validate {\n");
        out.push_str("        internal;\n");
        out.push_str(&format!("        proxy_pass {};\n", settings.auth_validate_url));
        out.push_str("        proxy_pass_request_body off;\n");
        out.push_str("        proxy_set_header Content-Length \"\";\n");
        out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
        out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
        out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
        out.push_str("        proxy_set_header X-Forwarded-Host $http_host;\n");
        out.push_str("        proxy_set_header X-Forwarded-URI $request_uri;\n");
        out.push_str("    }\n\n");
        out.push_str("    error_page 401 = @error401;\n");
        out.push_str("    location @error401 {\n");
        out.push_str(&format!(
            "        return 302 {login_url}?redirect_uri=$scheme://$http_host$request_uri;\n"
        ));
        out.push_str("    }\n");
    }

    out.push_str("\n    location / {\n");
    if login_url.is_some() {
        out.push_str("        auth_request /auth-validate;\n");
    }
    out.push_str(&format!(
        "        proxy_pass {}://{}:{upstream_port};\n",
        site.upstream_scheme.as_str(),
        site.upstream_host
    ));
    out.push_str("        proxy_set_header Host $host;\n");
    out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    if site.websocket {
        out.push_str("        proxy_http_version 1.1;\n");
        out.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
        out.push_str("        proxy_set_header Connection \"upgrade\";\n");
        out.push_str("        proxy_read_timeout 86400;\n");
    }
    out.push_str("    }\n");
    out.push_str("}\n");
    Ok(out)
}

/// The SNI router. Only enabled routes are emitted, ordered by domain then id;
/// unmatched names fall through to the local site listener.
pub fn render_stream(routes: &[StreamRoute], settings: &RenderSettings) -> String {
    let mut enabled: Vec<&StreamRoute> = routes.iter().filter(|r| r.enabled).collect();
    enabled.sort_by(|a, b| a.domain.cmp(&b.domain).then_with(|| a.id.cmp(&b.id)));

    let mut out = String::from(HEADER);
    out.push_str("stream {\n");
    out.push_str("    map $ssl_preread_server_name $hop_backend {\n");
    out.push_str("        hostnames;\n");
    for route in enabled {
        out.push_str(&format!("        {} {};\n", route.domain, route.backend));
    }
    out.push_str(&format!(
        "        default 127.0.0.1:{};\n",
        settings.site_listen_port
    ));
    out.push_str("    }\n\n");
    out.push_str("    server {\n");
    out.push_str(&format!("        listen {};\n", settings.stream_listen_port));
    out.push_str("        proxy_pass $hop_backend;\n");
    out.push_str("        ssl_preread on;\n");
    out.push_str("    }\n");
    out.push_str("}\n");
    out
}

pub fn render_main(
    params: &TemplateParams,
    settings: &RenderSettings,
) -> Result<String, TemplateError> {
    validate_template_params(params)?;
    validate_directive_value("mime_types", &settings.mime_types)?;

    let mut out = String::from(HEADER);
    out.push_str(&format!("worker_processes {};\n\n", params.worker_processes));
    out.push_str("error_log /var/log/nginx/error.log warn;\n");
    out.push_str("pid /var/run/nginx.pid;\n\n");

    out.push_str("events {\n");
    out.push_str(&format!(
        "    worker_connections {};\n",
        params.worker_connections
    ));
    out.push_str("    multi_accept on;\n");
    out.push_str("}\n\n");

    out.push_str("http {\n");
    out.push_str(&format!("    include {};\n", settings.mime_types));
    out.push_str("    default_type application/octet-stream;\n\n");
    out.push_str("    log_format main '$remote_addr - $remote_user [$time_local] \"$request\" '\n");
    out.push_str("                    '$status $body_bytes_sent \"$http_referer\" '\n");
    out.push_str("                    '\"$http_user_agent\" \"$http_x_forwarded_for\"';\n");
    out.push_str("    access_log /var/log/nginx/access.log main;\n\n");
    out.push_str("    sendfile on;\n");
    out.push_str("    tcp_nopush on;\n");
    out.push_str("    tcp_nodelay on;\n\n");
    out.push_str(&format!("    keepalive_timeout {};\n", params.keepalive));
    out.push_str("    types_hash_max_size 2048;\n");
    let tokens = if params.server_tokens { "on" } else { "off" };
    out.push_str(&format!("    server_tokens {tokens};\n"));
    out.push_str(&format!(
        "    client_max_body_size {};\n",
        params.client_max_body_size
    ));

    if params.gzip {
        out.push('\n');
        out.push_str("    gzip on;\n");
        out.push_str("    gzip_vary on;\n");
        out.push_str("    gzip_proxied any;\n");
        out.push_str("    gzip_comp_level 6;\n");
        out.push_str("    gzip_types text/plain text/css text/xml application/json application/javascript\n");
        out.push_str("               application/xml application/xml+rss text/javascript image/svg+xml;\n");
        out.push_str("    gzip_min_length 1000;\n");
    }

    out.push('\n');
    out.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
    out.push_str("    ssl_prefer_server_ciphers on;\n");
    out.push_str("    ssl_ciphers ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384;\n");
    out.push_str("    ssl_session_cache shared:SSL:10m;\n");
    out.push_str("    ssl_session_timeout 1d;\n");
    out.push_str("    ssl_session_tickets off;\n\n");
    out.push_str("    include conf.d/*.conf;\n");
    out.push_str("}\n\n");
    out.push_str("include stream.conf;\n");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hop_core::UpstreamScheme;

    fn site() -> ProxySite {
        ProxySite {
            id: "app.example.com".to_string(),
            server_name: "app.example.com".to_string(),
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 8080,
            ..Default::default()
        }
    }

    fn tls() -> SiteTls {
        SiteTls {
            cert_path: "/data/nginx/ssl/example.com.crt".to_string(),
            key_path: "/data/nginx/ssl/example.com.key".to_string(),
        }
    }

    fn route(id: &str, domain: &str, backend: &str, enabled: bool) -> StreamRoute {
        StreamRoute {
            id: id.to_string(),
            name: domain.to_string(),
            domain: domain.to_string(),
            backend: backend.to_string(),
            enabled,
        }
    }

    #[test]
    fn plain_site() {
        let text = render_site(&site(), None, &RenderSettings::default()).unwrap();
        assert!(text.contains("    listen 444;\n"));
        assert!(text.contains("server_name app.example.com;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:8080;"));
        assert!(!text.contains("ssl_certificate"));
        assert!(!text.contains("auth_request"));
        assert!(!text.contains("Upgrade"));
    }

    #[test]
    fn ssl_site_uses_resolved_paths() {
        let mut site = site();
        site.ssl = true;
        site.upstream_scheme = UpstreamScheme::Https;
        let text = render_site(&site, Some(&tls()), &RenderSettings::default()).unwrap();
        assert!(text.contains("    listen 444 ssl;\n"));
        assert!(text.contains("ssl_certificate /data/nginx/ssl/example.com.crt;"));
        assert!(text.contains("ssl_certificate_key /data/nginx/ssl/example.com.key;"));
        assert!(text.contains("proxy_pass https://127.0.0.1:8080;"));
    }

    #[test]
    fn ssl_without_certificate_is_rejected() {
        let mut site = site();
        site.ssl = true;
        let err = render_site(&site, None, &RenderSettings::default()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingCertificate(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn render_is_deterministic() {
        let mut site = site();
        site.ssl = true;
        site.websocket = true;
        let settings = RenderSettings::default();
        let first = render_site(&site, Some(&tls()), &settings).unwrap();
        let second = render_site(&site, Some(&tls()), &settings).unwrap();
        assert_eq!(first, second);

        let routes = vec![
            route("b", "b.example.com", "10.0.0.2:443", true),
            route("a", "a.example.com", "10.0.0.1:443", true),
        ];
        assert_eq!(
            render_stream(&routes, &settings),
            render_stream(&routes, &settings)
        );
    }

    #[test]
    fn websocket_headers() {
        let mut site = site();
        site.websocket = true;
        let text = render_site(&site, None, &RenderSettings::default()).unwrap();
        assert!(text.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(text.contains("proxy_read_timeout 86400;"));
    }

    #[test]
    fn auth_requires_login_url() {
        let mut site = site();
        site.auth_enabled = true;
        let err = render_site(&site, None, &RenderSettings::default()).unwrap_err();
        assert!(matches!(err, TemplateError::MissingLoginUrl(_)));

        let settings = RenderSettings {
            auth_login_url: Some("https://login.example.com/login".to_string()),
            ..Default::default()
        };
        let text = render_site(&site, None, &settings).unwrap();
        assert!(text.contains("auth_request /auth-validate;"));
        assert!(text.contains("proxy_pass http://127.0.0.1:3000/api/auth/nginx;"));
        assert!(text.contains(
            "return 302 https://login.example.com/login?redirect_uri=$scheme://$http_host$request_uri;"
        ));
    }

    #[test]
    fn site_input_is_validated() {
        let settings = RenderSettings::default();

        let mut bad_name = site();
        bad_name.server_name = "app.example.com; include /etc/passwd".to_string();
        assert!(render_site(&bad_name, None, &settings).is_err());

        let mut bad_port = site();
        bad_port.upstream_port = 70_000;
        assert!(matches!(
            render_site(&bad_port, None, &settings),
            Err(TemplateError::Validation(ValidationError::PortOutOfRange(70_000)))
        ));

        let mut bad_cert = site();
        bad_cert.ssl = true;
        let tls = SiteTls {
            cert_path: "/tmp/a.crt; evil".to_string(),
            key_path: "/tmp/a.key".to_string(),
        };
        assert!(render_site(&bad_cert, Some(&tls), &settings).is_err());
    }

    #[test]
    fn stream_emits_enabled_routes_sorted() {
        let routes = vec![
            route("2", "b.example.com", "10.0.0.2:443", true),
            route("1", "a.example.com", "10.0.0.1:443", true),
            route("3", "c.example.com", "10.0.0.3:443", false),
        ];
        let text = render_stream(&routes, &RenderSettings::default());

        let a = text.find("a.example.com 10.0.0.1:443;").unwrap();
        let b = text.find("b.example.com 10.0.0.2:443;").unwrap();
        assert!(a < b);
        assert!(!text.contains("10.0.0.3:443"));
        assert!(text.contains("default 127.0.0.1:444;"));
        assert!(text.contains("listen 443;"));
        assert!(text.contains("ssl_preread on;"));
    }

    #[test]
    fn empty_stream_still_routes_to_sites() {
        let text = render_stream(&[], &RenderSettings::default());
        assert!(text.contains("default 127.0.0.1:444;"));
    }

    #[test]
    fn main_config_reflects_params() {
        let params = TemplateParams {
            worker_processes: "4".to_string(),
            worker_connections: 2048,
            keepalive: 30,
            client_max_body_size: "10m".to_string(),
            gzip: false,
            server_tokens: true,
        };
        let text = render_main(&params, &RenderSettings::default()).unwrap();
        assert!(text.contains("worker_processes 4;"));
        assert!(text.contains("worker_connections 2048;"));
        assert!(text.contains("keepalive_timeout 30;"));
        assert!(text.contains("client_max_body_size 10m;"));
        assert!(text.contains("server_tokens on;"));
        assert!(!text.contains("gzip on;"));
        assert!(text.contains("include conf.d/*.conf;"));
        assert!(text.trim_end().ends_with("include stream.conf;"));

        let defaults = render_main(&TemplateParams::default(), &RenderSettings::default()).unwrap();
        assert!(defaults.contains("worker_processes auto;"));
        assert!(defaults.contains("gzip on;"));
        assert!(defaults.contains("server_tokens off;"));
    }

    #[test]
    fn main_config_rejects_bad_params() {
        let params = TemplateParams {
            worker_processes: "many".to_string(),
            ..Default::default()
        };
        assert!(render_main(&params, &RenderSettings::default()).is_err());
    }
}
