//! External process execution.
//!
//! Everything that shells out (the ACME client, the gateway's syntax test and
//! reload) goes through [`CommandRunner`] so tests can substitute scripted
//! results.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A fully described process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program and arguments as one line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr when it has content, otherwise stdout.
    pub fn detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }

    /// stdout followed by stderr, as a terminal would show them.
    pub fn combined(&self) -> String {
        let stdout = self.stdout.trim_end();
        let stderr = self.stderr.trim_end();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion. A process that outlives `spec.timeout` is
    /// killed and reaped before this returns [`RunError::Timeout`].
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, RunError>;
}

/// Runs real processes with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, RunError> {
        let program = spec.program.clone();
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }

        tracing::debug!(command = %spec.display(), "Running external command");

        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let completion = async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(pipe) = stdout.as_mut() {
                    pipe.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(pipe) = stderr.as_mut() {
                    pipe.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (out, err) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let outcome = tokio::time::timeout(spec.timeout, completion).await;
        match outcome {
            Ok(Ok((status, out, err))) => Ok(CommandOutput {
                code: status.code(),
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
            }),
            Ok(Err(source)) => Err(RunError::Io { program, source }),
            Err(_) => {
                tracing::warn!(
                    command = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "External command timed out, killing it"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(RunError::Timeout {
                    program,
                    after: spec.timeout,
                })
            }
        }
    }
}

/// One-line summary of a failed process: exit status plus a bounded preview of
/// its most relevant output.
pub fn format_process_failure(context: &str, output: &CommandOutput) -> String {
    let status_text = match output.code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };

    let detail = output.detail();
    if detail.is_empty() {
        return format!("{context} ({status_text})");
    }

    let preview: String = detail.chars().take(400).collect();
    if detail.chars().count() > 400 {
        format!("{context} ({status_text}): {preview}...")
    } else {
        format!("{context} ({status_text}): {preview}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_prefers_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: "progress".to_string(),
            stderr: "  boom \n".to_string(),
        };
        assert_eq!(output.detail(), "boom");

        let quiet = CommandOutput {
            code: Some(1),
            stdout: "only stdout\n".to_string(),
            stderr: "   ".to_string(),
        };
        assert_eq!(quiet.detail(), "only stdout");
    }

    #[test]
    fn combined_joins_streams() {
        let output = CommandOutput {
            code: Some(0),
            stdout: "a\n".to_string(),
            stderr: "b\n".to_string(),
        };
        assert_eq!(output.combined(), "a\nb");
        assert_eq!(CommandOutput::default().combined(), "");
    }

    #[test]
    fn format_process_failure_truncates_long_output() {
        let output = CommandOutput {
            code: Some(2),
            stdout: String::new(),
            stderr: "x".repeat(500),
        };
        let message = format_process_failure("nginx -t failed", &output);
        assert!(message.starts_with("nginx -t failed (exit code 2): "));
        assert!(message.ends_with("..."));
        assert!(message.len() < 450);
    }

    #[test]
    fn format_process_failure_without_output() {
        let output = CommandOutput {
            code: None,
            ..Default::default()
        };
        assert_eq!(
            format_process_failure("reload", &output),
            "reload (terminated by signal)"
        );
    }

    #[test]
    fn spec_display_joins_program_and_args() {
        let spec = CommandSpec::new("nginx", Duration::from_secs(1)).args(["-s", "reload"]);
        assert_eq!(spec.display(), "nginx -s reload");
    }

    #[tokio::test]
    async fn process_runner_captures_output_and_exit_code() {
        let spec = CommandSpec::new("sh", Duration::from_secs(10))
            .arg("-c")
            .arg("echo out; echo err >&2; exit 3");
        let output = ProcessRunner.run(spec).await.unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn process_runner_passes_environment() {
        let spec = CommandSpec::new("sh", Duration::from_secs(10))
            .arg("-c")
            .arg("printf %s \"$HOP_TEST_VALUE\"")
            .env("HOP_TEST_VALUE", "secret-123");
        let output = ProcessRunner.run(spec).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "secret-123");
    }

    #[tokio::test]
    async fn process_runner_kills_on_timeout() {
        let spec = CommandSpec::new("sh", Duration::from_millis(200))
            .arg("-c")
            .arg("sleep 5");
        let started = std::time::Instant::now();
        let err = ProcessRunner.run(spec).await.unwrap_err();
        assert!(matches!(err, RunError::Timeout { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn process_runner_reports_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/hop-test-binary", Duration::from_secs(1));
        let err = ProcessRunner.run(spec).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }
}
