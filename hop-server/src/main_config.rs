//! Global gateway parameters and the main `nginx.conf` they render into.

use hop_core::{ErrorKind, TemplateParams};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::gateway::{
    ChangeSet, ConfigFile, GatewayError, ReloadCoordinator, RenderSettings, TemplateError,
    render_main,
};
use crate::state_store::{SqliteStateStore, StateStoreError};

#[derive(Debug, Error)]
pub enum MainConfigError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

impl MainConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MainConfigError::Template(e) => e.kind(),
            MainConfigError::Gateway(e) => e.kind(),
            MainConfigError::Store(_) => ErrorKind::Internal,
        }
    }
}

pub struct MainConfigService {
    store: Arc<SqliteStateStore>,
    gateway: Arc<ReloadCoordinator>,
    settings: RenderSettings,
    params: RwLock<TemplateParams>,
    write: Mutex<()>,
}

impl MainConfigService {
    /// Stored parameters win over `fallback`, which comes from the config file.
    pub fn load(
        store: Arc<SqliteStateStore>,
        gateway: Arc<ReloadCoordinator>,
        settings: RenderSettings,
        fallback: TemplateParams,
    ) -> Result<Self, MainConfigError> {
        let params = store.template_params()?.unwrap_or(fallback);
        Ok(Self {
            store,
            gateway,
            settings,
            params: RwLock::new(params),
            write: Mutex::new(()),
        })
    }

    pub fn params(&self) -> TemplateParams {
        self.params.read().clone()
    }

    pub fn render(&self) -> Result<String, MainConfigError> {
        Ok(render_main(&self.params.read(), &self.settings)?)
    }

    /// Validate, activate and then store new parameters.
    pub async fn save(&self, params: TemplateParams) -> Result<TemplateParams, MainConfigError> {
        let _write = self.write.lock().await;
        let text = render_main(&params, &self.settings)?;

        let applied = self
            .gateway
            .apply(ChangeSet::new().write(ConfigFile::Main, text))
            .await;
        if applied.as_ref().map_or_else(GatewayError::promoted, |_| true) {
            self.store.save_template_params(&params)?;
            *self.params.write() = params.clone();
            tracing::info!(
                worker_processes = %params.worker_processes,
                worker_connections = params.worker_connections,
                "Saved gateway template parameters"
            );
        }
        applied?;
        Ok(params)
    }

    /// Re-render `nginx.conf` from the current parameters.
    pub async fn regenerate(&self) -> Result<(), MainConfigError> {
        let _write = self.write.lock().await;
        let text = self.render()?;
        self.gateway
            .apply(ChangeSet::new().write(ConfigFile::Main, text))
            .await?;
        tracing::info!("Regenerated main gateway config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::state_store::test_util::temp_store;
    use crate::test_support::{ScriptedRunner, output};
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(temp: &TempDir, store: Arc<SqliteStateStore>, fallback: TemplateParams) -> MainConfigService {
        let runner = ScriptedRunner::new(|_| Ok(output(0, "", "")));
        let gateway = Arc::new(ReloadCoordinator::new(
            runner,
            GatewayConfig {
                binary: "nginx".to_string(),
                live_dir: temp.path().join("nginx"),
                staging_dir: temp.path().join("staging"),
                test_timeout: Duration::from_secs(5),
                reload_timeout: Duration::from_secs(5),
            },
        ));
        MainConfigService::load(store, gateway, RenderSettings::default(), fallback).unwrap()
    }

    #[tokio::test]
    async fn save_activates_and_persists() {
        let (temp, store) = temp_store();
        let store = Arc::new(store);
        let main = service(&temp, store.clone(), TemplateParams::default());

        let params = TemplateParams {
            worker_connections: 4096,
            ..TemplateParams::default()
        };
        main.save(params.clone()).await.unwrap();

        let live = std::fs::read_to_string(temp.path().join("nginx/nginx.conf")).unwrap();
        assert!(live.contains("worker_connections 4096;"));
        assert_eq!(main.params(), params);
        assert_eq!(store.template_params().unwrap(), Some(params.clone()));

        // A fresh service prefers the stored parameters over the fallback.
        let reloaded = service(&temp, store, TemplateParams::default());
        assert_eq!(reloaded.params(), params);
    }

    #[tokio::test]
    async fn invalid_params_are_rejected_without_changes() {
        let (temp, store) = temp_store();
        let store = Arc::new(store);
        let main = service(&temp, store.clone(), TemplateParams::default());

        let params = TemplateParams {
            client_max_body_size: "10m; evil".to_string(),
            ..TemplateParams::default()
        };
        let err = main.save(params).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!temp.path().join("nginx/nginx.conf").exists());
        assert_eq!(store.template_params().unwrap(), None);
    }

    #[tokio::test]
    async fn regenerate_writes_current_params() {
        let (temp, store) = temp_store();
        let fallback = TemplateParams {
            worker_processes: "4".to_string(),
            ..TemplateParams::default()
        };
        let main = service(&temp, Arc::new(store), fallback);
        main.regenerate().await.unwrap();
        let live = std::fs::read_to_string(temp.path().join("nginx/nginx.conf")).unwrap();
        assert_eq!(live, main.render().unwrap());
        assert!(live.contains("worker_processes 4;"));
    }
}
