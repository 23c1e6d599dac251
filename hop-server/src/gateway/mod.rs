//! nginx configuration: rendering, staged validation and activation.
//!
//! The live tree under `<data>/nginx/` is only ever changed by
//! [`ReloadCoordinator::apply`], which stages a [`ChangeSet`] elsewhere, runs
//! the gateway's syntax test against the staged copy and promotes it only when
//! the test passes.

mod reload;
mod template;
mod validator;

use hop_core::ErrorKind;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::command::RunError;

pub use reload::{GatewayConfig, ReloadCoordinator};
pub use template::{
    RenderSettings, SiteTls, TemplateError, render_main, render_site, render_stream,
};
pub use validator::{ConfigValidator, StagedTree, TestOutcome};

pub const MAIN_CONFIG: &str = "nginx.conf";
pub const STREAM_CONFIG: &str = "stream.conf";
pub const SITES_DIR: &str = "conf.d";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway configuration test failed: {0}")]
    ValidatorFailure(String),

    #[error("Gateway configuration test timed out after {}s", .0.as_secs())]
    ValidatorTimeout(Duration),

    #[error("Gateway reload failed: {0}")]
    ReloadFailed(String),

    #[error("Failed to run gateway binary: {0}")]
    Command(#[from] RunError),

    #[error("Gateway configuration I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Some files of the change set reached the live tree before one failed.
    #[error("Gateway configuration partially promoted ({promoted} of {total} files): {source}")]
    PartialPromotion {
        promoted: usize,
        total: usize,
        source: Box<GatewayError>,
    },

    #[error("Gateway task failed: {0}")]
    Task(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::ValidatorFailure(_) => ErrorKind::ValidatorFailure,
            GatewayError::ValidatorTimeout(_) => ErrorKind::ValidatorTimeout,
            GatewayError::ReloadFailed(_) => ErrorKind::ReloadFailed,
            GatewayError::Command(_)
            | GatewayError::Io { .. }
            | GatewayError::PartialPromotion { .. }
            | GatewayError::Task(_) => ErrorKind::Internal,
        }
    }

    /// The change set reached the live tree even though the apply failed.
    pub fn promoted(&self) -> bool {
        matches!(
            self,
            GatewayError::ReloadFailed(_) | GatewayError::PartialPromotion { .. }
        )
    }

    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        GatewayError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A file of the gateway tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConfigFile {
    Main,
    Stream,
    /// `conf.d/<id>.conf`. The id must already be validated.
    Site(String),
}

impl ConfigFile {
    pub fn relative_path(&self) -> PathBuf {
        match self {
            ConfigFile::Main => PathBuf::from(MAIN_CONFIG),
            ConfigFile::Stream => PathBuf::from(STREAM_CONFIG),
            ConfigFile::Site(id) => Path::new(SITES_DIR).join(format!("{id}.conf")),
        }
    }
}

/// Files to write or remove in one apply. A later change to the same file
/// replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: BTreeMap<ConfigFile, Option<String>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, file: ConfigFile, contents: impl Into<String>) -> Self {
        self.changes.insert(file, Some(contents.into()));
        self
    }

    pub fn remove(mut self, file: ConfigFile) -> Self {
        self.changes.insert(file, None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// `None` contents mean removal.
    pub fn iter(&self) -> impl Iterator<Item = (&ConfigFile, Option<&str>)> {
        self.changes
            .iter()
            .map(|(file, contents)| (file, contents.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_paths() {
        assert_eq!(ConfigFile::Main.relative_path(), PathBuf::from("nginx.conf"));
        assert_eq!(ConfigFile::Stream.relative_path(), PathBuf::from("stream.conf"));
        assert_eq!(
            ConfigFile::Site("app.example.com".to_string()).relative_path(),
            PathBuf::from("conf.d/app.example.com.conf")
        );
    }

    #[test]
    fn later_change_to_same_file_wins() {
        let site = ConfigFile::Site("a".to_string());
        let changes = ChangeSet::new()
            .write(site.clone(), "first")
            .write(ConfigFile::Stream, "stream")
            .remove(site.clone());

        assert_eq!(changes.len(), 2);
        let collected: Vec<_> = changes.iter().collect();
        assert!(collected.contains(&(&site, None)));
        assert!(collected.contains(&(&ConfigFile::Stream, Some("stream"))));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            GatewayError::ValidatorFailure("x".to_string()).kind(),
            ErrorKind::ValidatorFailure
        );
        assert_eq!(
            GatewayError::ValidatorTimeout(Duration::from_secs(30)).kind(),
            ErrorKind::ValidatorTimeout
        );
        assert_eq!(
            GatewayError::ReloadFailed("x".to_string()).kind(),
            ErrorKind::ReloadFailed
        );
    }
}
