use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::{ChangeSet, GatewayError, MAIN_CONFIG, SITES_DIR, STREAM_CONFIG};
use crate::command::{CommandRunner, CommandSpec, RunError};
use crate::paths::write_atomic;

/// Result of one `nginx -t` run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestOutcome {
    pub success: bool,
    pub output: String,
}

/// A candidate copy of the gateway tree. Removed when dropped.
#[derive(Debug)]
pub struct StagedTree {
    dir: PathBuf,
}

impl StagedTree {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn main_config(&self) -> PathBuf {
        self.dir.join(MAIN_CONFIG)
    }
}

impl Drop for StagedTree {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to remove staged gateway config");
        }
    }
}

/// Stages candidate trees outside the live tree and runs the gateway's syntax
/// test against them.
pub struct ConfigValidator {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    timeout: Duration,
    staging_root: PathBuf,
}

impl ConfigValidator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<String>,
        timeout: Duration,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            timeout,
            staging_root: staging_root.into(),
        }
    }

    /// Copy the live tree into a fresh staging directory and apply `changes`
    /// there.
    pub fn stage(&self, live_root: &Path, changes: &ChangeSet) -> Result<StagedTree, GatewayError> {
        let staged = StagedTree {
            dir: self.staging_root.join(nanoid::nanoid!()),
        };
        let sites_dir = staged.dir.join(SITES_DIR);
        std::fs::create_dir_all(&sites_dir).map_err(|e| GatewayError::io(&sites_dir, e))?;

        for name in [MAIN_CONFIG, STREAM_CONFIG] {
            copy_if_present(&live_root.join(name), &staged.dir.join(name))?;
        }

        let live_sites = live_root.join(SITES_DIR);
        match std::fs::read_dir(&live_sites) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.map_err(|e| GatewayError::io(&live_sites, e))?;
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "conf") {
                        copy_if_present(&path, &sites_dir.join(entry.file_name()))?;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GatewayError::io(&live_sites, e)),
        }

        for (file, contents) in changes.iter() {
            let target = staged.dir.join(file.relative_path());
            match contents {
                Some(text) => write_atomic(&target, text.as_bytes(), None)
                    .map_err(|e| GatewayError::io(&target, e))?,
                None => remove_if_present(&target)?,
            }
        }

        tracing::debug!(dir = %staged.dir.display(), changes = changes.len(), "Staged gateway config");
        Ok(staged)
    }

    /// Run `<binary> -t -c <config>`.
    pub async fn test(&self, config: &Path) -> Result<TestOutcome, GatewayError> {
        let spec = CommandSpec::new(&self.binary, self.timeout)
            .arg("-t")
            .arg("-c")
            .arg(config.display().to_string());
        match self.runner.run(spec).await {
            Ok(output) => Ok(TestOutcome {
                success: output.success(),
                output: output.combined(),
            }),
            Err(RunError::Timeout { after, .. }) => Err(GatewayError::ValidatorTimeout(after)),
            Err(e) => Err(GatewayError::Command(e)),
        }
    }
}

fn copy_if_present(from: &Path, to: &Path) -> Result<(), GatewayError> {
    match std::fs::copy(from, to) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GatewayError::io(from, e)),
    }
}

pub(crate) fn remove_if_present(path: &Path) -> Result<(), GatewayError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GatewayError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ConfigFile;
    use crate::test_support::{ScriptedRunner, output};
    use tempfile::TempDir;

    fn live_tree(temp: &TempDir) -> PathBuf {
        let live = temp.path().join("nginx");
        std::fs::create_dir_all(live.join("conf.d")).unwrap();
        std::fs::write(live.join("nginx.conf"), "main").unwrap();
        std::fs::write(live.join("stream.conf"), "stream").unwrap();
        std::fs::write(live.join("conf.d/old.conf"), "old").unwrap();
        std::fs::write(live.join("conf.d/keep.conf"), "keep").unwrap();
        std::fs::write(live.join("conf.d/notes.txt"), "ignored").unwrap();
        live
    }

    #[test]
    fn stage_copies_live_tree_and_applies_changes() {
        let temp = TempDir::new().unwrap();
        let live = live_tree(&temp);
        let runner = ScriptedRunner::new(|_| Ok(output(0, "", "")));
        let validator = ConfigValidator::new(runner, "nginx", Duration::from_secs(5), temp.path().join("staging"));

        let changes = ChangeSet::new()
            .write(ConfigFile::Site("new".to_string()), "new site")
            .remove(ConfigFile::Site("old".to_string()))
            .write(ConfigFile::Stream, "stream v2");
        let staged = validator.stage(&live, &changes).unwrap();

        let read = |rel: &str| std::fs::read_to_string(staged.dir().join(rel)).unwrap();
        assert_eq!(read("nginx.conf"), "main");
        assert_eq!(read("stream.conf"), "stream v2");
        assert_eq!(read("conf.d/keep.conf"), "keep");
        assert_eq!(read("conf.d/new.conf"), "new site");
        assert!(!staged.dir().join("conf.d/old.conf").exists());
        assert!(!staged.dir().join("conf.d/notes.txt").exists());

        // The live tree is untouched.
        assert_eq!(std::fs::read_to_string(live.join("stream.conf")).unwrap(), "stream");
        assert!(live.join("conf.d/old.conf").exists());

        let dir = staged.dir().to_path_buf();
        drop(staged);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_runs_syntax_check_against_given_config() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|_| {
            Ok(output(1, "", "nginx: [emerg] unknown directive \"bogus\""))
        });
        let validator = ConfigValidator::new(runner.clone(), "/usr/sbin/nginx", Duration::from_secs(5), temp.path());

        let outcome = validator.test(Path::new("/tmp/x/nginx.conf")).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.output.contains("unknown directive"));

        let call = &runner.calls()[0];
        assert_eq!(call.program, "/usr/sbin/nginx");
        assert_eq!(call.args, vec!["-t", "-c", "/tmp/x/nginx.conf"]);
    }

    #[tokio::test]
    async fn timeout_is_distinct() {
        let temp = TempDir::new().unwrap();
        let runner = ScriptedRunner::new(|spec| {
            Err(RunError::Timeout {
                program: spec.program.clone(),
                after: spec.timeout,
            })
        });
        let validator = ConfigValidator::new(runner, "nginx", Duration::from_secs(7), temp.path());
        let err = validator.test(Path::new("nginx.conf")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ValidatorTimeout(d) if d.as_secs() == 7));
    }
}
