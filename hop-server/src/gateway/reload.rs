use hop_core::GatewayOutput;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::validator::remove_if_present;
use super::{ChangeSet, ConfigFile, ConfigValidator, GatewayError, MAIN_CONFIG, SITES_DIR};
use crate::command::{CommandRunner, CommandSpec, format_process_failure};
use crate::paths::write_atomic;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub binary: String,
    /// Root of the live tree (`nginx.conf`, `stream.conf`, `conf.d/`).
    pub live_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub test_timeout: Duration,
    pub reload_timeout: Duration,
}

/// Handle to the live configuration tree. Only reachable through the
/// coordinator's lock.
#[derive(Debug)]
struct LiveConfig {
    root: PathBuf,
}

impl LiveConfig {
    fn path(&self, file: &ConfigFile) -> PathBuf {
        self.root.join(file.relative_path())
    }

    fn main_config(&self) -> PathBuf {
        self.root.join(MAIN_CONFIG)
    }
}

/// Serializes every change to the live tree and every reload signal.
pub struct ReloadCoordinator {
    live: Arc<Mutex<LiveConfig>>,
    validator: ConfigValidator,
    runner: Arc<dyn CommandRunner>,
    binary: String,
    reload_timeout: Duration,
}

impl ReloadCoordinator {
    pub fn new(runner: Arc<dyn CommandRunner>, config: GatewayConfig) -> Self {
        let validator = ConfigValidator::new(
            runner.clone(),
            config.binary.clone(),
            config.test_timeout,
            config.staging_dir,
        );
        Self {
            live: Arc::new(Mutex::new(LiveConfig {
                root: config.live_dir,
            })),
            validator,
            runner,
            binary: config.binary,
            reload_timeout: config.reload_timeout,
        }
    }

    /// Stage, test, promote and reload. When the test fails nothing in the
    /// live tree changes and no reload is sent.
    ///
    /// Runs on a spawned task that owns the lock, so dropping the returned
    /// future does not cut an external process short.
    pub async fn apply(self: &Arc<Self>, changes: ChangeSet) -> Result<GatewayOutput, GatewayError> {
        let guard = self.live.clone().lock_owned().await;
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.apply_locked(&guard, &changes).await;
            drop(guard);
            result
        });
        task.await.map_err(|e| GatewayError::Task(e.to_string()))?
    }

    async fn apply_locked(
        &self,
        live: &LiveConfig,
        changes: &ChangeSet,
    ) -> Result<GatewayOutput, GatewayError> {
        if changes.is_empty() {
            return Ok(GatewayOutput {
                success: true,
                output: String::new(),
            });
        }

        let staged = self.validator.stage(&live.root, changes)?;
        let outcome = self.validator.test(&staged.main_config()).await?;
        drop(staged);
        if !outcome.success {
            tracing::warn!(output = %outcome.output, "Gateway rejected staged config");
            return Err(GatewayError::ValidatorFailure(outcome.output));
        }

        let mut promoted = 0;
        for (file, contents) in changes.iter() {
            let target = live.path(file);
            let written = match contents {
                Some(text) => write_atomic(&target, text.as_bytes(), None)
                    .map_err(|e| GatewayError::io(&target, e)),
                None => remove_if_present(&target),
            };
            match written {
                Ok(()) => promoted += 1,
                Err(e) if promoted == 0 => return Err(e),
                Err(e) => {
                    tracing::error!(promoted, total = changes.len(), error = %e, "Gateway config partially promoted");
                    return Err(GatewayError::PartialPromotion {
                        promoted,
                        total: changes.len(),
                        source: Box::new(e),
                    });
                }
            }
        }
        tracing::info!(files = changes.len(), "Promoted gateway config");

        let reload = self.signal_reload(live).await?;
        let output = [outcome.output, reload]
            .into_iter()
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(GatewayOutput {
            success: true,
            output,
        })
    }

    async fn signal_reload(&self, live: &LiveConfig) -> Result<String, GatewayError> {
        let spec = CommandSpec::new(&self.binary, self.reload_timeout)
            .args(["-s", "reload", "-c"])
            .arg(live.main_config().display().to_string());
        match self.runner.run(spec).await {
            Ok(output) if output.success() => {
                tracing::info!("Gateway reloaded");
                Ok(output.combined())
            }
            Ok(output) => Err(GatewayError::ReloadFailed(format_process_failure(
                "reload command failed",
                &output,
            ))),
            Err(e) => Err(GatewayError::ReloadFailed(e.to_string())),
        }
    }

    /// Re-send the reload signal for the current live tree.
    pub async fn reload(self: &Arc<Self>) -> GatewayOutput {
        let guard = self.live.clone().lock_owned().await;
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = this.signal_reload(&guard).await;
            drop(guard);
            result
        });
        let result = task
            .await
            .map_err(|e| GatewayError::Task(e.to_string()))
            .and_then(|r| r);
        match result {
            Ok(output) => GatewayOutput {
                success: true,
                output,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Manual gateway reload failed");
                GatewayOutput {
                    success: false,
                    output: e.to_string(),
                }
            }
        }
    }

    /// Run the syntax test against the live tree.
    pub async fn test(&self) -> GatewayOutput {
        let live = self.live.lock().await;
        match self.validator.test(&live.main_config()).await {
            Ok(outcome) => GatewayOutput {
                success: outcome.success,
                output: outcome.output,
            },
            Err(e) => GatewayOutput {
                success: false,
                output: e.to_string(),
            },
        }
    }

    /// Write `main` and `stream` into the live tree when they are missing.
    /// Existing files are left alone and nothing is reloaded.
    pub async fn bootstrap(&self, main: &str, stream: &str) -> Result<bool, GatewayError> {
        let live = self.live.lock().await;
        let sites = live.root.join(SITES_DIR);
        std::fs::create_dir_all(&sites).map_err(|e| GatewayError::io(&sites, e))?;

        let mut wrote = false;
        for (file, contents) in [(ConfigFile::Main, main), (ConfigFile::Stream, stream)] {
            let path = live.path(&file);
            if path.exists() {
                continue;
            }
            write_atomic(&path, contents.as_bytes(), None).map_err(|e| GatewayError::io(&path, e))?;
            tracing::info!(path = %path.display(), "Wrote initial gateway config");
            wrote = true;
        }
        Ok(wrote)
    }

    /// Path of a live file, for logs and tests.
    pub async fn live_path(&self, file: &ConfigFile) -> PathBuf {
        self.live.lock().await.path(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::test_support::{ScriptedRunner, output};
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn coordinator(temp: &TempDir, runner: Arc<ScriptedRunner>) -> Arc<ReloadCoordinator> {
        Arc::new(ReloadCoordinator::new(
            runner,
            GatewayConfig {
                binary: "nginx".to_string(),
                live_dir: temp.path().join("nginx"),
                staging_dir: temp.path().join("staging"),
                test_timeout: Duration::from_secs(5),
                reload_timeout: Duration::from_secs(5),
            },
        ))
    }

    fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut files = BTreeMap::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    files.insert(path.clone(), std::fs::read(&path).unwrap());
                }
            }
        }
        files
    }

    fn is_reload(args: &[String]) -> bool {
        args.iter().any(|a| a == "reload")
    }

    #[tokio::test]
    async fn failed_test_leaves_live_tree_untouched() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            if is_reload(&spec.args) {
                Ok(output(0, "", ""))
            } else {
                Ok(output(1, "", "nginx: [emerg] invalid port"))
            }
        });
        let coordinator = coordinator(&temp, runner.clone());
        coordinator.bootstrap("main v1", "stream v1").await.unwrap();
        let live = temp.path().join("nginx");
        std::fs::write(live.join("conf.d/site.conf"), "site v1").unwrap();
        let before = snapshot(&live);

        let changes = ChangeSet::new()
            .write(ConfigFile::Site("site".to_string()), "site v2")
            .write(ConfigFile::Stream, "stream v2")
            .remove(ConfigFile::Main);
        let err = coordinator.apply(changes).await.unwrap_err();

        assert!(matches!(&err, GatewayError::ValidatorFailure(out) if out.contains("invalid port")));
        assert_eq!(snapshot(&live), before);
        assert!(!runner.calls().iter().any(|c| is_reload(&c.args)));
        assert_eq!(
            std::fs::read_dir(temp.path().join("staging")).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn passing_test_promotes_and_reloads() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            if is_reload(&spec.args) {
                Ok(output(0, "", ""))
            } else {
                Ok(output(0, "", "nginx: configuration file test is successful"))
            }
        });
        let coordinator = coordinator(&temp, runner.clone());
        coordinator.bootstrap("main", "stream").await.unwrap();
        let live = temp.path().join("nginx");
        std::fs::write(live.join("conf.d/gone.conf"), "x").unwrap();

        let changes = ChangeSet::new()
            .write(ConfigFile::Site("app".to_string()), "site")
            .remove(ConfigFile::Site("gone".to_string()));
        let result = coordinator.apply(changes.clone()).await.unwrap();
        assert!(result.success);
        assert!(result.output.contains("test is successful"));

        assert_eq!(std::fs::read_to_string(live.join("conf.d/app.conf")).unwrap(), "site");
        assert!(!live.join("conf.d/gone.conf").exists());

        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args[0], "-t");
        assert!(calls[0].args[2].contains("staging"));
        assert_eq!(
            calls[1].args,
            vec![
                "-s".to_string(),
                "reload".to_string(),
                "-c".to_string(),
                live.join("nginx.conf").display().to_string()
            ]
        );

        // Same change set again: same files, one more test and reload.
        let before = snapshot(&live);
        coordinator.apply(changes).await.unwrap();
        assert_eq!(snapshot(&live), before);
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test]
    async fn reload_failure_after_promotion_is_reported() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            if is_reload(&spec.args) {
                Ok(output(1, "", "nginx: [error] invalid PID number \"\""))
            } else {
                Ok(output(0, "", ""))
            }
        });
        let coordinator = coordinator(&temp, runner);
        coordinator.bootstrap("main", "stream").await.unwrap();

        let err = coordinator
            .apply(ChangeSet::new().write(ConfigFile::Stream, "stream v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ReloadFailed(_)));
        assert_eq!(
            std::fs::read_to_string(temp.path().join("nginx/stream.conf")).unwrap(),
            "stream v2"
        );
    }

    #[tokio::test]
    async fn write_failure_after_first_file_reports_partial_promotion() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("nginx/conf.d/app.conf/busy");
        let runner = ScriptedRunner::new(move |spec| {
            if !is_reload(&spec.args) {
                // A directory now occupies the site file's path in the live tree.
                std::fs::create_dir_all(&blocker).unwrap();
            }
            Ok(output(0, "", ""))
        });
        let coordinator = coordinator(&temp, runner.clone());
        coordinator.bootstrap("main", "stream").await.unwrap();

        let changes = ChangeSet::new()
            .write(ConfigFile::Stream, "stream v2")
            .write(ConfigFile::Site("app".to_string()), "site");
        let err = coordinator.apply(changes).await.unwrap_err();

        assert!(matches!(
            &err,
            GatewayError::PartialPromotion { promoted: 1, total: 2, source }
                if matches!(**source, GatewayError::Io { .. })
        ));
        assert!(err.promoted());
        assert_eq!(err.kind(), hop_core::ErrorKind::Internal);
        assert_eq!(
            std::fs::read_to_string(temp.path().join("nginx/stream.conf")).unwrap(),
            "stream v2"
        );
        assert!(!runner.calls().iter().any(|c| is_reload(&c.args)));
    }

    #[tokio::test]
    async fn write_failure_before_any_promotion_is_plain_io() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("nginx/stream.conf/busy");
        let runner = ScriptedRunner::new(move |spec| {
            if !is_reload(&spec.args) {
                std::fs::remove_file(blocker.parent().unwrap()).ok();
                std::fs::create_dir_all(&blocker).unwrap();
            }
            Ok(output(0, "", ""))
        });
        let coordinator = coordinator(&temp, runner);
        coordinator.bootstrap("main", "stream").await.unwrap();

        let err = coordinator
            .apply(ChangeSet::new().write(ConfigFile::Stream, "stream v2"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Io { .. }));
        assert!(!err.promoted());
    }

    #[tokio::test]
    async fn empty_change_set_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::default()));
        let coordinator = coordinator(&temp, runner.clone());
        let result = coordinator.apply(ChangeSet::new()).await.unwrap();
        assert!(result.success);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn manual_test_and_reload_report_output() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            if is_reload(&spec.args) {
                Ok(output(1, "", "no running gateway"))
            } else {
                Ok(output(0, "", "syntax is ok"))
            }
        });
        let coordinator = coordinator(&temp, runner.clone());

        let test = coordinator.test().await;
        assert!(test.success);
        assert_eq!(test.output, "syntax is ok");
        assert_eq!(
            runner.calls()[0].args[2],
            temp.path().join("nginx/nginx.conf").display().to_string()
        );

        let reload = coordinator.reload().await;
        assert!(!reload.success);
        assert!(reload.output.contains("no running gateway"));
    }

    #[tokio::test]
    async fn bootstrap_keeps_existing_files() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| Ok(CommandOutput::default()));
        let coordinator = coordinator(&temp, runner.clone());

        assert!(coordinator.bootstrap("main v1", "stream v1").await.unwrap());
        assert!(!coordinator.bootstrap("main v2", "stream v2").await.unwrap());
        let live = coordinator.live_path(&ConfigFile::Main).await;
        assert_eq!(std::fs::read_to_string(live).unwrap(), "main v1");
        assert!(runner.calls().is_empty());
    }
}
