//! Management socket: one JSON command per line, one JSON response per line.

use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};

use hop_core::{Command, Response};
use hop_socket::serve_jsonl_connection;

/// Only the owner (and root) may drive the server.
const SOCKET_MODE: u32 = 0o600;

pub struct SocketServer {
    path: PathBuf,
}

fn prepare_socket_path(path: &Path) -> Result<(), std::io::Error> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    Ok(())
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Accept connections until the task is dropped.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), std::io::Error>
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        prepare_socket_path(&self.path)?;

        let listener = UnixListener::bind(&self.path)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        tracing::info!(path = %self.path.display(), "Management socket listening");

        let handler = Arc::new(handler);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            tracing::error!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection<F, Fut>(stream: UnixStream, handler: Arc<F>) -> Result<(), std::io::Error>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    serve_jsonl_connection(
        stream,
        move |cmd| {
            let handler = handler.clone();
            async move {
                tracing::debug!(command = ?cmd, "Received command");
                handler(cmd).await
            }
        },
        |e| Response::failure(hop_core::ErrorKind::Validation, format!("Invalid command: {}", e)),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hop_core::ErrorKind;
    use std::os::unix::fs::FileTypeExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::sleep;

    #[test]
    fn prepare_socket_path_removes_stale_file_and_creates_parent() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("nested").join("hop.sock");
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        std::fs::write(&socket_path, b"stale").unwrap();

        prepare_socket_path(&socket_path).unwrap();

        assert!(socket_path.parent().unwrap().exists());
        assert!(!socket_path.exists(), "stale socket file should be removed");
    }

    #[tokio::test]
    async fn invalid_json_is_answered_with_validation_error() {
        let (mut client, server) = UnixStream::pair().unwrap();

        let handler = Arc::new(|_cmd: Command| async move { Response::ok(serde_json::json!({})) });
        let server_task = tokio::spawn(handle_connection(server, handler));

        client.write_all(b"not-json\n").await.unwrap();
        client.write_all(b"{\"command\":\"no_such_command\"}\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8(raw).unwrap();
        let responses: Vec<Response> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        for response in responses {
            assert_eq!(response.error_kind(), Some(ErrorKind::Validation));
            assert!(response.error_message().unwrap().contains("Invalid command"));
        }

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn run_replaces_stale_socket_and_restricts_mode() {
        let temp = TempDir::new().unwrap();
        let bind_check = temp.path().join("bind-check.sock");
        if std::os::unix::net::UnixListener::bind(&bind_check).is_err() {
            return;
        }
        let _ = std::fs::remove_file(&bind_check);

        let socket_path = temp.path().join("sockdir").join("hop.sock");
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        std::fs::write(&socket_path, b"stale-file").unwrap();

        let server = SocketServer::new(socket_path.clone());
        let server_task = tokio::spawn(async move {
            let _ = server
                .run(|cmd| async move {
                    match cmd {
                        Command::ListSites => Response::ok(serde_json::json!([])),
                        _ => Response::error("unexpected command"),
                    }
                })
                .await;
        });

        let mut ready = false;
        for _ in 0..100 {
            if let Ok(meta) = std::fs::metadata(&socket_path)
                && meta.file_type().is_socket()
            {
                ready = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(ready, "socket was not created at {}", socket_path.display());
        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let response: Response = hop_socket::request(&socket_path, &Command::ListSites)
            .await
            .unwrap();
        assert!(response.is_ok());

        server_task.abort();
        let _ = server_task.await;
    }
}
