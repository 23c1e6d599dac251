use std::time::Duration;

/// Certificates with fewer whole days left than this are due for renewal.
pub const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Sweeps must run at least once per renewal window.
pub const MAX_RENEWAL_INTERVAL_HOURS: u64 = RENEWAL_WINDOW_DAYS as u64 * 24;

pub const DEFAULT_RENEWAL_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_ACME_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_GATEWAY_TEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GATEWAY_RELOAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const ACME_VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_SOCKET: &str = "/var/run/hop/hop.sock";
pub const DEFAULT_DATA_DIR: &str = "/var/lib/hop";

/// Port sites listen on behind the SNI stream router.
pub const DEFAULT_SITE_LISTEN_PORT: u16 = 444;
/// Public TLS port owned by the SNI stream router.
pub const DEFAULT_STREAM_LISTEN_PORT: u16 = 443;

pub const DEFAULT_LOG_LIMIT: u32 = 50;
pub const MAX_LOG_LIMIT: u32 = 1000;
