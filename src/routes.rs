//! Route store backed by SQLite
//! Maps (host, path prefix) to an upstream origin

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

const ROUTE_COLUMNS: &str = "id, host, path_prefix, upstream, skip_tls_verify, created_at, updated_at";

/// One proxy route. `path_prefix` is stored without surrounding slashes,
/// the empty prefix matches every path on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRoute {
    pub id: String,
    pub host: String,
    pub path_prefix: String,
    pub upstream: String,
    pub skip_tls_verify: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ProxyRoute {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            host: row.get(1)?,
            path_prefix: row.get(2)?,
            upstream: row.get(3)?,
            skip_tls_verify: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    pub fn upstream_url(&self) -> Result<Url> {
        Url::parse(&self.upstream).with_context(|| format!("Invalid upstream URL: {}", self.upstream))
    }

    /// Whether the upstream speaks TLS
    pub fn use_tls(&self) -> bool {
        self.upstream
            .get(..8)
            .map(|scheme| scheme.eq_ignore_ascii_case("https://"))
            .unwrap_or(false)
    }

    /// Mount point as seen by clients, e.g. `/api`; empty for the root route
    pub fn mount_point(&self) -> String {
        if self.path_prefix.is_empty() {
            String::new()
        } else {
            format!("/{}", self.path_prefix)
        }
    }

    /// Whole-segment prefix match
    pub fn matches_path(&self, path: &str) -> bool {
        if self.path_prefix.is_empty() {
            return true;
        }
        let mount = self.mount_point();
        match path.strip_prefix(mount.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Path left after removing the mount point, always rooted
    pub fn strip_prefix(&self, path: &str) -> String {
        let mount = self.mount_point();
        let rest = path.strip_prefix(mount.as_str()).unwrap_or(path);
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{}", rest)
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_start_matches('/').trim_end_matches('/').to_string()
}

fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}

fn validate_upstream(upstream: &str) -> Result<()> {
    let url = Url::parse(upstream).with_context(|| format!("Invalid upstream URL: {}", upstream))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("Upstream must use http or https: {}", upstream);
    }
    if url.host_str().is_none() {
        bail!("Upstream has no host: {}", upstream);
    }
    Ok(())
}

/// Thread-safe route store; clones share one connection
#[derive(Clone)]
pub struct RouteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl RouteStore {
    /// Open (or create) the store at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open route database {}", db_path_str))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path_str,
        };
        store.initialize()?;

        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                host TEXT NOT NULL,
                path_prefix TEXT NOT NULL DEFAULT '',
                upstream TEXT NOT NULL,
                skip_tls_verify INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(host, path_prefix)
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_routes_host ON routes(host)", [])?;

        Ok(())
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Route for `host` whose prefix is the longest whole-segment match of `path`
    pub fn find_route(&self, host: &str, path: &str) -> Result<Option<ProxyRoute>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM routes WHERE host = ?1 ORDER BY LENGTH(path_prefix) DESC, path_prefix",
            ROUTE_COLUMNS
        ))?;

        let mut rows = stmt.query(params![normalize_host(host)])?;
        while let Some(row) = rows.next()? {
            let route = ProxyRoute::from_row(row)?;
            if route.matches_path(path) {
                return Ok(Some(route));
            }
        }

        Ok(None)
    }

    /// Add a route; an existing (host, prefix) pair is an error
    pub fn add_route(
        &self,
        host: &str,
        path_prefix: &str,
        upstream: &str,
        skip_tls_verify: bool,
    ) -> Result<ProxyRoute> {
        validate_upstream(upstream)?;

        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();
        let host = normalize_host(host);
        let path_prefix = normalize_prefix(path_prefix);
        let upstream = upstream.trim_end_matches('/');

        conn.execute(
            "INSERT INTO routes (id, host, path_prefix, upstream, skip_tls_verify)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, host, path_prefix, upstream, skip_tls_verify],
        )
        .with_context(|| format!("Failed to add route {}/{}", host, path_prefix))?;

        let now = chrono::Utc::now().to_rfc3339();
        Ok(ProxyRoute {
            id,
            host,
            path_prefix,
            upstream: upstream.to_string(),
            skip_tls_verify,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Change upstream and/or TLS verification of a route
    pub fn update_route(&self, id: &str, upstream: Option<&str>, skip_tls_verify: Option<bool>) -> Result<bool> {
        if let Some(upstream) = upstream {
            validate_upstream(upstream)?;
        }
        if upstream.is_none() && skip_tls_verify.is_none() {
            return Ok(false);
        }

        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE routes SET
                upstream = COALESCE(?2, upstream),
                skip_tls_verify = COALESCE(?3, skip_tls_verify),
                updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![id, upstream.map(|u| u.trim_end_matches('/')), skip_tls_verify],
        )?;

        Ok(affected > 0)
    }

    /// Delete one route of a host, or all of them when no prefix is given
    pub fn delete_route(&self, host: &str, path_prefix: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock();
        let host = normalize_host(host);

        let affected = match path_prefix {
            Some(prefix) => conn.execute(
                "DELETE FROM routes WHERE host = ?1 AND path_prefix = ?2",
                params![host, normalize_prefix(prefix)],
            )?,
            None => conn.execute("DELETE FROM routes WHERE host = ?1", params![host])?,
        };

        Ok(affected)
    }

    /// List routes, optionally for one host
    pub fn list_routes(&self, host: Option<&str>) -> Result<Vec<ProxyRoute>> {
        let conn = self.conn.lock();

        let routes = match host {
            Some(host) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM routes WHERE host = ?1 ORDER BY host, path_prefix",
                    ROUTE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![normalize_host(host)], ProxyRoute::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM routes ORDER BY host, path_prefix",
                    ROUTE_COLUMNS
                ))?;
                let rows = stmt.query_map([], ProxyRoute::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(routes)
    }

    pub fn get_route_by_id(&self, id: &str) -> Result<Option<ProxyRoute>> {
        let conn = self.conn.lock();

        let route = conn
            .query_row(
                &format!("SELECT {} FROM routes WHERE id = ?1", ROUTE_COLUMNS),
                params![id],
                ProxyRoute::from_row,
            )
            .optional()?;

        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, RouteStore) {
        let dir = tempdir().unwrap();
        let store = RouteStore::new(dir.path().join("nested/routes.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("data/routes.db");
        let store = RouteStore::new(&db_path).unwrap();
        assert!(db_path.exists());
        assert!(store.db_path().ends_with("routes.db"));
    }

    #[test]
    fn test_add_and_find_route() {
        let (_dir, store) = open_store();
        store
            .add_route("Example.COM", "/api/v1/", "http://127.0.0.1:3000/", false)
            .unwrap();

        let route = store.find_route("example.com", "/api/v1/users").unwrap().unwrap();
        assert_eq!(route.host, "example.com");
        assert_eq!(route.path_prefix, "api/v1");
        assert_eq!(route.upstream, "http://127.0.0.1:3000");
        assert!(!route.use_tls());
        assert_eq!(route.strip_prefix("/api/v1/users"), "/users");
        assert_eq!(route.strip_prefix("/api/v1"), "/");

        assert!(store.find_route("other.com", "/api/v1").unwrap().is_none());
    }

    #[test]
    fn test_longest_match_first() {
        let (_dir, store) = open_store();
        store.add_route("example.com", "", "http://127.0.0.1:3000", false).unwrap();
        store.add_route("example.com", "api", "http://127.0.0.1:3001", false).unwrap();
        store.add_route("example.com", "api/v1", "https://127.0.0.1:3002", true).unwrap();

        let route = store.find_route("example.com", "/api/v1/users").unwrap().unwrap();
        assert_eq!(route.upstream, "https://127.0.0.1:3002");
        assert!(route.use_tls());
        assert!(route.skip_tls_verify);

        let route = store.find_route("example.com", "/api/v2/users").unwrap().unwrap();
        assert_eq!(route.upstream, "http://127.0.0.1:3001");

        // Prefixes only match whole segments
        let route = store.find_route("example.com", "/apiary").unwrap().unwrap();
        assert_eq!(route.upstream, "http://127.0.0.1:3000");
        assert_eq!(route.strip_prefix("/apiary"), "/apiary");
    }

    #[test]
    fn test_duplicate_route_rejected() {
        let (_dir, store) = open_store();
        store.add_route("example.com", "api", "http://127.0.0.1:3000", false).unwrap();
        assert!(store.add_route("example.com", "/api/", "http://127.0.0.1:3001", false).is_err());
    }

    #[test]
    fn test_invalid_upstream_rejected() {
        let (_dir, store) = open_store();
        assert!(store.add_route("example.com", "", "not a url", false).is_err());
        assert!(store.add_route("example.com", "", "ftp://files.example.com", false).is_err());
        assert!(store.list_routes(None).unwrap().is_empty());
    }

    #[test]
    fn test_update_and_get_by_id() {
        let (_dir, store) = open_store();
        let route = store.add_route("example.com", "", "http://127.0.0.1:3000", false).unwrap();

        assert!(!store.update_route(&route.id, None, None).unwrap());
        assert!(store
            .update_route(&route.id, Some("https://backend.internal/"), Some(true))
            .unwrap());

        let updated = store.get_route_by_id(&route.id).unwrap().unwrap();
        assert_eq!(updated.upstream, "https://backend.internal");
        assert!(updated.skip_tls_verify);

        assert!(!store.update_route("missing", Some("http://x.internal"), None).unwrap());
        assert!(store.get_route_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn test_delete_and_list() {
        let (_dir, store) = open_store();
        store.add_route("a.com", "", "http://127.0.0.1:1", false).unwrap();
        store.add_route("a.com", "x", "http://127.0.0.1:2", false).unwrap();
        store.add_route("b.com", "", "http://127.0.0.1:3", false).unwrap();

        assert_eq!(store.list_routes(Some("A.com")).unwrap().len(), 2);
        assert_eq!(store.delete_route("a.com", Some("/x")).unwrap(), 1);
        assert_eq!(store.delete_route("b.com", None).unwrap(), 1);

        let remaining = store.list_routes(None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].host, "a.com");
        assert_eq!(remaining[0].path_prefix, "");
    }

    #[test]
    fn test_reopen_keeps_routes() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("routes.db");
        {
            let store = RouteStore::new(&db_path).unwrap();
            store.add_route("example.com", "", "http://127.0.0.1:3000", false).unwrap();
        }
        let store = RouteStore::new(&db_path).unwrap();
        assert!(store.find_route("example.com", "/").unwrap().is_some());
    }
}
