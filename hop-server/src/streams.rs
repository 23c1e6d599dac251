//! SNI stream routes. Every mutation re-renders `stream.conf` from the full
//! route set and activates it through the reload coordinator.

use hop_core::{ErrorKind, StreamRoute};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::gateway::{ChangeSet, ConfigFile, GatewayError, ReloadCoordinator, RenderSettings, render_stream};
use crate::state_store::{SqliteStateStore, StateStoreError};
use crate::validation::{ValidationError, parse_backend, validate_hostname};

const MAX_ROUTE_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Domain {domain} is already routed by {existing}")]
    DuplicateDomain { domain: String, existing: String },

    #[error("Stream route not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StateStoreError),
}

impl RouteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouteError::Validation(_) | RouteError::DuplicateDomain { .. } => ErrorKind::Validation,
            RouteError::NotFound(_) => ErrorKind::NotFound,
            RouteError::Gateway(e) => e.kind(),
            RouteError::Store(_) => ErrorKind::Internal,
        }
    }
}

pub struct StreamService {
    store: Arc<SqliteStateStore>,
    gateway: Arc<ReloadCoordinator>,
    settings: RenderSettings,
    write: Mutex<()>,
}

impl StreamService {
    pub fn new(
        store: Arc<SqliteStateStore>,
        gateway: Arc<ReloadCoordinator>,
        settings: RenderSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            write: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<Vec<StreamRoute>, RouteError> {
        Ok(self.store.list_stream_routes()?)
    }

    pub fn get(&self, id: &str) -> Result<StreamRoute, RouteError> {
        self.store
            .stream_route(id)?
            .ok_or_else(|| RouteError::NotFound(id.to_string()))
    }

    /// Current `stream.conf` text for the stored routes.
    pub fn render(&self) -> Result<String, RouteError> {
        Ok(render_stream(&self.list()?, &self.settings))
    }

    pub async fn save(&self, route: StreamRoute) -> Result<StreamRoute, RouteError> {
        let _write = self.write.lock().await;
        let route = normalize(route)?;

        let mut routes = self.list()?;
        if let Some(existing) = routes
            .iter()
            .find(|r| r.domain == route.domain && r.id != route.id)
        {
            return Err(RouteError::DuplicateDomain {
                domain: route.domain,
                existing: existing.id.clone(),
            });
        }
        match routes.iter_mut().find(|r| r.id == route.id) {
            Some(slot) => *slot = route.clone(),
            None => routes.push(route.clone()),
        }

        self.activate(&routes, || self.store.save_stream_route(&route, SystemTime::now()))
            .await?;
        tracing::info!(id = %route.id, domain = %route.domain, backend = %route.backend, "Saved stream route");
        Ok(route)
    }

    pub async fn delete(&self, id: &str) -> Result<(), RouteError> {
        let _write = self.write.lock().await;
        let route = self.get(id)?;
        let routes: Vec<_> = self.list()?.into_iter().filter(|r| r.id != route.id).collect();

        self.activate(&routes, || self.store.delete_stream_route(&route.id).map(|_| ()))
            .await?;
        tracing::info!(id = %route.id, domain = %route.domain, "Deleted stream route");
        Ok(())
    }

    /// Flip `enabled`; the route's other fields are kept as they are.
    pub async fn toggle(&self, id: &str) -> Result<StreamRoute, RouteError> {
        let _write = self.write.lock().await;
        let mut route = self.get(id)?;
        route.enabled = !route.enabled;

        let mut routes = self.list()?;
        for slot in routes.iter_mut().filter(|r| r.id == route.id) {
            slot.enabled = route.enabled;
        }

        self.activate(&routes, || self.store.save_stream_route(&route, SystemTime::now()))
            .await?;
        tracing::info!(id = %route.id, enabled = route.enabled, "Toggled stream route");
        Ok(route)
    }

    /// Apply `stream.conf` for `routes` and run `persist` once the file is live.
    async fn activate<F>(&self, routes: &[StreamRoute], persist: F) -> Result<(), RouteError>
    where
        F: FnOnce() -> Result<(), StateStoreError>,
    {
        let text = render_stream(routes, &self.settings);
        let applied = self
            .gateway
            .apply(ChangeSet::new().write(ConfigFile::Stream, text))
            .await;
        if applied.as_ref().map_or_else(GatewayError::promoted, |_| true) {
            persist()?;
        }
        applied?;
        Ok(())
    }
}

fn normalize(mut route: StreamRoute) -> Result<StreamRoute, RouteError> {
    route.domain = route.domain.trim().to_ascii_lowercase();
    route.backend = route.backend.trim().to_string();
    route.name = route.name.trim().to_string();
    route.id = route.id.trim().to_string();

    validate_hostname(&route.domain)?;
    parse_backend(&route.backend)?;
    if route.name.is_empty() {
        route.name = route.domain.clone();
    }
    if route.id.is_empty() {
        route.id = nanoid::nanoid!();
    } else if route.id.len() > MAX_ROUTE_ID_LEN {
        return Err(ValidationError::InvalidId(route.id).into());
    }
    Ok(route)
}
