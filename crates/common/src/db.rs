//! SQLite database for Fossorial state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that run their own queries
    /// against the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Organizations
            CREATE TABLE IF NOT EXISTS orgs (
                org_id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            -- Roles, scoped to an org
            CREATE TABLE IF NOT EXISTS roles (
                role_id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(org_id) REFERENCES orgs(org_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_roles_org ON roles(org_id);

            -- Actions granted to non-admin roles
            CREATE TABLE IF NOT EXISTS role_actions (
                role_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                PRIMARY KEY (role_id, action)
            );

            -- Users (identity is owned by the authenticating proxy)
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE
            );

            -- Org membership
            CREATE TABLE IF NOT EXISTS user_orgs (
                user_id TEXT NOT NULL,
                org_id TEXT NOT NULL,
                role_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, org_id)
            );

            -- Exit nodes
            CREATE TABLE IF NOT EXISTS exit_nodes (
                exit_node_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                address TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                public_key TEXT NOT NULL,
                listen_port INTEGER NOT NULL,
                reachable_at TEXT NOT NULL
            );

            -- Sites
            CREATE TABLE IF NOT EXISTS sites (
                site_id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id TEXT NOT NULL,
                exit_node_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                nice_id TEXT NOT NULL,
                type TEXT NOT NULL,
                pub_key TEXT,
                subnet TEXT NOT NULL,
                UNIQUE (org_id, nice_id),
                FOREIGN KEY(org_id) REFERENCES orgs(org_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_sites_org ON sites(org_id);

            CREATE TABLE IF NOT EXISTS role_sites (
                role_id INTEGER NOT NULL,
                site_id INTEGER NOT NULL,
                PRIMARY KEY (role_id, site_id)
            );

            CREATE TABLE IF NOT EXISTS user_sites (
                user_id TEXT NOT NULL,
                site_id INTEGER NOT NULL,
                PRIMARY KEY (user_id, site_id)
            );

            -- Newt credentials (1:1 with newt sites)
            CREATE TABLE IF NOT EXISTS newts (
                newt_id TEXT PRIMARY KEY,
                site_id INTEGER NOT NULL UNIQUE,
                secret_hash TEXT NOT NULL,
                date_created TEXT NOT NULL,
                FOREIGN KEY(site_id) REFERENCES sites(site_id) ON DELETE CASCADE
            );

            -- Resources
            CREATE TABLE IF NOT EXISTS resources (
                resource_id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL,
                org_id TEXT NOT NULL,
                name TEXT NOT NULL,
                protocol TEXT NOT NULL,
                http INTEGER NOT NULL DEFAULT 1,
                subdomain TEXT,
                proxy_port INTEGER,
                FOREIGN KEY(site_id) REFERENCES sites(site_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_resources_site ON resources(site_id);

            -- Targets
            CREATE TABLE IF NOT EXISTS targets (
                target_id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id INTEGER NOT NULL,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                method TEXT,
                internal_port INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                FOREIGN KEY(resource_id) REFERENCES resources(resource_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_targets_resource ON targets(resource_id);

            -- Access rules evaluated by the proxy in front of a resource
            CREATE TABLE IF NOT EXISTS resource_rules (
                rule_id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id INTEGER NOT NULL,
                action TEXT NOT NULL,
                match_type TEXT NOT NULL,
                value TEXT NOT NULL,
                FOREIGN KEY(resource_id) REFERENCES resources(resource_id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_resource_rules_resource ON resource_rules(resource_id);

            -- Pending invites
            CREATE TABLE IF NOT EXISTS user_invites (
                invite_id TEXT PRIMARY KEY,
                org_id TEXT NOT NULL,
                email TEXT NOT NULL,
                role_id INTEGER NOT NULL,
                token_hash TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_user_invites_email ON user_invites(email, org_id);

            -- Persistent invite rate windows
            CREATE TABLE IF NOT EXISTS invite_rate_windows (
                key TEXT NOT NULL,
                issued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_invite_rate_windows_key ON invite_rate_windows(key);

            -- Exit node calls awaiting retry
            CREATE TABLE IF NOT EXISTS peer_outbox (
                entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_peer_outbox_due ON peer_outbox(next_attempt_at);
            CREATE INDEX IF NOT EXISTS idx_peer_outbox_site ON peer_outbox(site_id, kind);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_created() {
        let db = Database::open_memory().unwrap();
        let conn = db.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('sites', 'resources', 'targets', 'newts', 'peer_outbox')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 5);
    }

    #[test]
    fn test_open_file_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let _ = Database::open(&path).unwrap();
        // Schema creation must tolerate an existing database
        let _ = Database::open(&path).unwrap();
    }
}
