use hop_core::{ProxySite, StreamRoute, TemplateParams};
use rusqlite::{OptionalExtension, params};
use serde::{Serialize, de::DeserializeOwned};
use std::time::SystemTime;

use super::{SqliteStateStore, StateStoreError, unix_secs};

const TEMPLATE_PARAMS_KEY: &str = "template_params";

fn site_from_json(id: &str, json: &str) -> Result<ProxySite, StateStoreError> {
    serde_json::from_str(json)
        .map_err(|e| StateStoreError::InvalidData(format!("proxy site {id}: {e}")))
}

impl SqliteStateStore {
    pub fn save_site(&self, site: &ProxySite, at: SystemTime) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(site)
            .map_err(|e| StateStoreError::InvalidData(format!("serialize site: {e}")))?;
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO proxy_sites (id, site_json, certificate_id, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                site_json = excluded.site_json,
                certificate_id = excluded.certificate_id,
                updated_at = excluded.updated_at;",
            params![site.id, json, site.certificate_id, unix_secs(at)],
        )?;
        Ok(())
    }

    pub fn site(&self, id: &str) -> Result<Option<ProxySite>, StateStoreError> {
        let conn = self.open_connection()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT site_json FROM proxy_sites WHERE id = ?1;",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|json| site_from_json(id, &json)).transpose()
    }

    /// All sites ordered by id.
    pub fn list_sites(&self) -> Result<Vec<ProxySite>, StateStoreError> {
        self.query_sites("SELECT id, site_json FROM proxy_sites ORDER BY id;", None)
    }

    pub fn sites_using_certificate(
        &self,
        certificate_id: &str,
    ) -> Result<Vec<ProxySite>, StateStoreError> {
        self.query_sites(
            "SELECT id, site_json FROM proxy_sites WHERE certificate_id = ?1 ORDER BY id;",
            Some(certificate_id),
        )
    }

    fn query_sites(&self, sql: &str, arg: Option<&str>) -> Result<Vec<ProxySite>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(sql)?;
        let map = |row: &rusqlite::Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        let rows = match arg {
            Some(arg) => stmt.query_map(params![arg], map)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
        };
        rows.iter()
            .map(|(id, json)| site_from_json(id, json))
            .collect()
    }

    pub fn delete_site(&self, id: &str) -> Result<bool, StateStoreError> {
        let conn = self.open_connection()?;
        let removed = conn.execute("DELETE FROM proxy_sites WHERE id = ?1;", params![id])?;
        Ok(removed > 0)
    }

    pub fn save_stream_route(
        &self,
        route: &StreamRoute,
        at: SystemTime,
    ) -> Result<(), StateStoreError> {
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO stream_routes (id, name, domain, backend, enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                domain = excluded.domain,
                backend = excluded.backend,
                enabled = excluded.enabled;",
            params![
                route.id,
                route.name,
                route.domain,
                route.backend,
                route.enabled,
                unix_secs(at)
            ],
        )?;
        Ok(())
    }

    pub fn stream_route(&self, id: &str) -> Result<Option<StreamRoute>, StateStoreError> {
        let conn = self.open_connection()?;
        let route = conn
            .query_row(
                "SELECT id, name, domain, backend, enabled FROM stream_routes WHERE id = ?1;",
                params![id],
                |row| {
                    Ok(StreamRoute {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        domain: row.get(2)?,
                        backend: row.get(3)?,
                        enabled: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(route)
    }

    /// All routes, enabled or not, in creation order.
    pub fn list_stream_routes(&self) -> Result<Vec<StreamRoute>, StateStoreError> {
        let conn = self.open_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, domain, backend, enabled
             FROM stream_routes
             ORDER BY created_at ASC, id ASC;",
        )?;
        let routes = stmt
            .query_map([], |row| {
                Ok(StreamRoute {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    domain: row.get(2)?,
                    backend: row.get(3)?,
                    enabled: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routes)
    }

    pub fn delete_stream_route(&self, id: &str) -> Result<bool, StateStoreError> {
        let conn = self.open_connection()?;
        let removed = conn.execute("DELETE FROM stream_routes WHERE id = ?1;", params![id])?;
        Ok(removed > 0)
    }

    fn setting<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateStoreError> {
        let conn = self.open_connection()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1;",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|v| {
                serde_json::from_str(&v)
                    .map_err(|e| StateStoreError::InvalidData(format!("setting {key}: {e}")))
            })
            .transpose()
    }

    fn put_setting<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StateStoreError> {
        let json = serde_json::to_string(value)
            .map_err(|e| StateStoreError::InvalidData(format!("serialize setting {key}: {e}")))?;
        let conn = self.open_connection()?;
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![key, json],
        )?;
        Ok(())
    }

    /// Saved main-config parameters, if they were ever changed.
    pub fn template_params(&self) -> Result<Option<TemplateParams>, StateStoreError> {
        self.setting(TEMPLATE_PARAMS_KEY)
    }

    pub fn save_template_params(&self, params: &TemplateParams) -> Result<(), StateStoreError> {
        self.put_setting(TEMPLATE_PARAMS_KEY, params)
    }
}
