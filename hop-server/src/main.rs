// Some engine accessors are only reached from tests or the socket surface.
#![allow(dead_code)]

mod command;
mod config;
mod crypto;
mod defaults;
mod dns;
mod gateway;
mod main_config;
mod paths;
mod server_state;
mod sites;
mod socket;
mod state_store;
mod streams;
#[cfg(test)]
mod test_support;
mod tls;
mod validation;

use crate::command::{CommandRunner, ProcessRunner};
use crate::config::HopConfig;
use crate::paths::DataPaths;
use crate::server_state::ServerState;
use crate::socket::SocketServer;
use crate::tls::{LegoConfig, LegoIssuer};
use clap::{Parser, Subcommand};
use hop_core::Response;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Hop Server - certificate lifecycle and nginx gateway control
#[derive(Parser)]
#[command(name = "hop-server")]
#[command(version)]
#[command(about = "Hop Server - certificate lifecycle and nginx gateway control")]
pub struct Args {
    /// Config file (hop.toml)
    #[arg(short = 'C', long, env = "HOP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Unix socket path for management commands
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    /// Data directory for the database, certificates and gateway config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the server (default)
    Serve,

    /// Write a commented default config file
    Init {
        #[arg(default_value = "hop.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Send one JSON command to a running server and print the response
    Call {
        /// e.g. '{"command":"list_certificates"}'
        json: String,
    },
}

/// Flag, then config file, then the debug checkout default, then the system default.
fn resolve_path(
    flag: Option<&Path>,
    configured: Option<&Path>,
    debug_default: impl FnOnce(&Path) -> Option<PathBuf>,
    fallback: &str,
) -> PathBuf {
    if let Some(path) = flag.or(configured) {
        return path.to_path_buf();
    }
    if cfg!(debug_assertions)
        && let Ok(exe) = std::env::current_exe()
        && let Some(path) = debug_default(&exe)
    {
        return path;
    }
    PathBuf::from(fallback)
}

/// Console output with `RUST_LOG` filtering, plus JSON lines to `log_file`
/// when configured.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, std::io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "hop-server.log".into());
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(Commands::Init { path, force }) = &args.command {
        config::write_default(path, *force)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => HopConfig::load(path)?,
        None => HopConfig::default(),
    };
    let socket = resolve_path(
        args.socket.as_deref(),
        config.server.socket.as_deref(),
        paths::debug_default_socket_from_exe,
        defaults::DEFAULT_SOCKET,
    );
    let data_dir = resolve_path(
        args.data_dir.as_deref(),
        config.data.dir.as_deref(),
        paths::debug_default_data_dir_from_exe,
        defaults::DEFAULT_DATA_DIR,
    );

    let rt = tokio::runtime::Runtime::new()?;

    if let Some(Commands::Call { json }) = &args.command {
        let request: serde_json::Value = serde_json::from_str(json)?;
        let response: Response = rt.block_on(hop_socket::request(&socket, &request))?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        if !response.is_ok() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let _log_guard = init_tracing(config.log.file.as_deref())?;
    rt.block_on(serve(config, socket, data_dir))
}

async fn serve(
    config: HopConfig,
    socket: PathBuf,
    data_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Hop Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Socket: {}", socket.display());
    tracing::info!("Data directory: {}", data_dir.display());
    tracing::info!(
        gateway = %config.gateway.binary,
        acme = %config.acme.binary,
        site_port = config.gateway.site_listen_port,
        stream_port = config.gateway.stream_listen_port,
        "External tools"
    );

    let paths = DataPaths::new(&data_dir);
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let issuer = Arc::new(LegoIssuer::new(
        runner.clone(),
        LegoConfig {
            binary: config.acme.binary.clone(),
            lego_dir: paths.lego_dir(),
            timeout: config.acme.timeout(),
            disable_propagation_check: config.acme.disable_propagation_check,
        },
    ));

    let (state, events) = ServerState::open(&config, &paths, runner, issuer).await?;
    let state = Arc::new(state);
    state.spawn_background(events);

    let server = SocketServer::new(socket.clone());
    let socket_state = state.clone();
    tokio::select! {
        result = server.run(move |cmd| {
            let state = socket_state.clone();
            async move { state.handle_command(cmd).await }
        }) => result?,
        signal = shutdown_signal() => {
            signal?;
            tracing::info!("Shutting down");
        }
    }

    if let Err(e) = std::fs::remove_file(&socket)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %socket.display(), "Failed to remove socket: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() -> Result<(), std::io::Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
