//! Registry of orgs, sites, resources, targets and their credentials
//!
//! Thin query layer over the shared SQLite database. Every method takes the
//! connection lock once, so multi-query reads (e.g. a site's allow-list) see
//! a single consistent view.

use fossorial_common::{
    Database, Error, ExitNode, ExitNodeId, Newt, Org, Protocol, Resource, ResourceId,
    ResourceRule, Result, Role, RoleId, RuleAction, RuleMatch, Site, SiteId, SiteType, Target,
    TargetId, User, UserInvite,
};
use rusqlite::{params, OptionalExtension, Row};
use serde::Deserialize;
use std::collections::HashSet;
use std::str::FromStr;
use tracing::debug;

/// Registry wrapper
#[derive(Clone)]
pub struct Registry {
    db: Database,
}

// ============================================================================
// Insert parameters
// ============================================================================

#[derive(Debug, Clone)]
pub struct NewExitNode {
    pub name: String,
    pub address: String,
    pub endpoint: String,
    pub public_key: String,
    pub listen_port: u16,
    pub reachable_at: String,
}

#[derive(Debug, Clone)]
pub struct NewSite {
    pub org_id: String,
    pub exit_node_id: ExitNodeId,
    pub name: String,
    pub nice_id: String,
    pub site_type: SiteType,
    pub pub_key: Option<String>,
    pub subnet: String,
}

#[derive(Debug, Clone)]
pub struct NewNewt {
    pub newt_id: String,
    pub secret_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewResource {
    pub site_id: SiteId,
    pub name: String,
    pub protocol: Protocol,
    pub http: bool,
    pub subdomain: Option<String>,
    pub proxy_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct NewTarget {
    pub resource_id: ResourceId,
    pub ip: String,
    pub port: u16,
    pub method: Option<String>,
    pub internal_port: Option<u16>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewResourceRule {
    pub resource_id: ResourceId,
    pub action: RuleAction,
    pub match_type: RuleMatch,
    pub value: String,
}

// ============================================================================
// Paging
// ============================================================================

pub const DEFAULT_PAGE_LIMIT: i64 = 1000;

/// `limit`/`offset` window into a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    pub fn validate(self) -> Result<Self> {
        if self.limit <= 0 {
            return Err(Error::validation("limit must be a positive integer"));
        }
        if self.offset < 0 {
            return Err(Error::validation("offset must be a non-negative integer"));
        }
        Ok(self)
    }
}

/// One page of rows with the unpaged row count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paged<T> {
    pub rows: Vec<T>,
    pub total: i64,
}

// ============================================================================
// Row mapping
// ============================================================================

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

const SITE_COLUMNS: &str = "site_id, org_id, exit_node_id, name, nice_id, type, pub_key, subnet";

fn site_from_row(row: &Row<'_>) -> rusqlite::Result<Site> {
    Ok(Site {
        site_id: row.get(0)?,
        org_id: row.get(1)?,
        exit_node_id: row.get(2)?,
        name: row.get(3)?,
        nice_id: row.get(4)?,
        site_type: parse_col(row, 5)?,
        pub_key: row.get(6)?,
        subnet: row.get(7)?,
    })
}

const RESOURCE_COLUMNS: &str =
    "resource_id, site_id, org_id, name, protocol, http, subdomain, proxy_port";

fn resource_from_row(row: &Row<'_>) -> rusqlite::Result<Resource> {
    Ok(Resource {
        resource_id: row.get(0)?,
        site_id: row.get(1)?,
        org_id: row.get(2)?,
        name: row.get(3)?,
        protocol: parse_col(row, 4)?,
        http: row.get(5)?,
        subdomain: row.get(6)?,
        proxy_port: row.get(7)?,
    })
}

const TARGET_COLUMNS: &str = "target_id, resource_id, ip, port, method, internal_port, enabled";

fn target_from_row(row: &Row<'_>) -> rusqlite::Result<Target> {
    Ok(Target {
        target_id: row.get(0)?,
        resource_id: row.get(1)?,
        ip: row.get(2)?,
        port: row.get(3)?,
        method: row.get(4)?,
        internal_port: row.get(5)?,
        enabled: row.get(6)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<ResourceRule> {
    Ok(ResourceRule {
        rule_id: row.get(0)?,
        resource_id: row.get(1)?,
        action: parse_col(row, 2)?,
        match_type: parse_col(row, 3)?,
        value: row.get(4)?,
        resource_name: row.get(5)?,
    })
}

fn newt_from_row(row: &Row<'_>) -> rusqlite::Result<Newt> {
    Ok(Newt {
        newt_id: row.get(0)?,
        site_id: row.get(1)?,
        secret_hash: row.get(2)?,
        date_created: row.get(3)?,
    })
}

fn role_from_row(row: &Row<'_>) -> rusqlite::Result<Role> {
    Ok(Role {
        role_id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        is_admin: row.get(3)?,
    })
}

fn exit_node_from_row(row: &Row<'_>) -> rusqlite::Result<ExitNode> {
    Ok(ExitNode {
        exit_node_id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        endpoint: row.get(3)?,
        public_key: row.get(4)?,
        listen_port: row.get(5)?,
        reachable_at: row.get(6)?,
    })
}

fn invite_from_row(row: &Row<'_>) -> rusqlite::Result<UserInvite> {
    Ok(UserInvite {
        invite_id: row.get(0)?,
        org_id: row.get(1)?,
        email: row.get(2)?,
        role_id: row.get(3)?,
        token_hash: row.get(4)?,
        expires_at: row.get(5)?,
    })
}

impl Registry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Orgs, roles and users
    // ========================================================================

    /// Create an org together with its admin role
    pub fn create_org(&self, org_id: &str, name: &str) -> Result<(Org, Role)> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM orgs WHERE org_id = ?1", params![org_id], |row| row.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(Error::AlreadyExists {
                kind: "Org".to_string(),
                id: org_id.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO orgs (org_id, name) VALUES (?1, ?2)",
            params![org_id, name],
        )?;
        tx.execute(
            "INSERT INTO roles (org_id, name, is_admin) VALUES (?1, 'Admin', 1)",
            params![org_id],
        )?;
        let role_id = tx.last_insert_rowid();
        tx.commit()?;

        Ok((
            Org {
                org_id: org_id.to_string(),
                name: name.to_string(),
            },
            Role {
                role_id,
                org_id: org_id.to_string(),
                name: "Admin".to_string(),
                is_admin: true,
            },
        ))
    }

    pub fn get_org(&self, org_id: &str) -> Result<Option<Org>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT org_id, name FROM orgs WHERE org_id = ?1",
                params![org_id],
                |row| {
                    Ok(Org {
                        org_id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    /// Create a non-admin role granted the given actions
    pub fn create_role(&self, org_id: &str, name: &str, actions: &[&str]) -> Result<Role> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO roles (org_id, name, is_admin) VALUES (?1, ?2, 0)",
            params![org_id, name],
        )?;
        let role_id = tx.last_insert_rowid();
        for action in actions {
            tx.execute(
                "INSERT OR IGNORE INTO role_actions (role_id, action) VALUES (?1, ?2)",
                params![role_id, action],
            )?;
        }
        tx.commit()?;

        Ok(Role {
            role_id,
            org_id: org_id.to_string(),
            name: name.to_string(),
            is_admin: false,
        })
    }

    pub fn get_role(&self, role_id: RoleId) -> Result<Option<Role>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT role_id, org_id, name, is_admin FROM roles WHERE role_id = ?1",
                params![role_id],
                role_from_row,
            )
            .optional()?)
    }

    pub fn get_admin_role(&self, org_id: &str) -> Result<Option<Role>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT role_id, org_id, name, is_admin FROM roles WHERE org_id = ?1 AND is_admin = 1 LIMIT 1",
                params![org_id],
                role_from_row,
            )
            .optional()?)
    }

    pub fn role_allows(&self, role_id: RoleId, action: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM role_actions WHERE role_id = ?1 AND action = ?2",
                params![role_id, action],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert or refresh a user record as reported by the auth proxy
    pub fn upsert_user(&self, user_id: &str, email: &str) -> Result<User> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO users (user_id, email) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET email = excluded.email",
            params![user_id, email],
        )?;
        Ok(User {
            user_id: user_id.to_string(),
            email: email.to_string(),
        })
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT user_id, email FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        email: row.get(1)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn add_user_to_org(&self, user_id: &str, org_id: &str, role_id: RoleId) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO user_orgs (user_id, org_id, role_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, org_id) DO UPDATE SET role_id = excluded.role_id",
            params![user_id, org_id, role_id],
        )?;
        Ok(())
    }

    /// Role a user holds in an org, if any
    pub fn get_user_org_role(&self, user_id: &str, org_id: &str) -> Result<Option<RoleId>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT role_id FROM user_orgs WHERE user_id = ?1 AND org_id = ?2",
                params![user_id, org_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn is_member_by_email(&self, email: &str, org_id: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users u JOIN user_orgs uo ON uo.user_id = u.user_id
                 WHERE u.email = ?1 AND uo.org_id = ?2 LIMIT 1",
                params![email, org_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ========================================================================
    // Exit nodes
    // ========================================================================

    pub fn create_exit_node(&self, node: &NewExitNode) -> Result<ExitNode> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO exit_nodes (name, address, endpoint, public_key, listen_port, reachable_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                node.name,
                node.address,
                node.endpoint,
                node.public_key,
                node.listen_port,
                node.reachable_at
            ],
        )?;
        Ok(ExitNode {
            exit_node_id: conn.last_insert_rowid(),
            name: node.name.clone(),
            address: node.address.clone(),
            endpoint: node.endpoint.clone(),
            public_key: node.public_key.clone(),
            listen_port: node.listen_port,
            reachable_at: node.reachable_at.clone(),
        })
    }

    pub fn get_exit_node(&self, exit_node_id: ExitNodeId) -> Result<Option<ExitNode>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT exit_node_id, name, address, endpoint, public_key, listen_port, reachable_at
                 FROM exit_nodes WHERE exit_node_id = ?1",
                params![exit_node_id],
                exit_node_from_row,
            )
            .optional()?)
    }

    // ========================================================================
    // Sites
    // ========================================================================

    pub fn nice_id_taken(&self, org_id: &str, nice_id: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sites WHERE org_id = ?1 AND nice_id = ?2",
                params![org_id, nice_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a site with its access links and, for newt sites, its credential.
    ///
    /// `member_user_id` is linked through `user_sites` when the creator is not an admin.
    pub fn insert_site(
        &self,
        site: &NewSite,
        admin_role_id: RoleId,
        member_user_id: Option<&str>,
        newt: Option<&NewNewt>,
    ) -> Result<Site> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        if let Some(newt) = newt {
            let taken: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM newts WHERE newt_id = ?1",
                    params![newt.newt_id],
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(Error::AlreadyExists {
                    kind: "Newt".to_string(),
                    id: newt.newt_id.clone(),
                });
            }
        }

        tx.execute(
            "INSERT INTO sites (org_id, exit_node_id, name, nice_id, type, pub_key, subnet)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                site.org_id,
                site.exit_node_id,
                site.name,
                site.nice_id,
                site.site_type.to_string(),
                site.pub_key,
                site.subnet
            ],
        )?;
        let site_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO role_sites (role_id, site_id) VALUES (?1, ?2)",
            params![admin_role_id, site_id],
        )?;
        if let Some(user_id) = member_user_id {
            tx.execute(
                "INSERT INTO user_sites (user_id, site_id) VALUES (?1, ?2)",
                params![user_id, site_id],
            )?;
        }

        if let Some(newt) = newt {
            tx.execute(
                "INSERT INTO newts (newt_id, site_id, secret_hash, date_created) VALUES (?1, ?2, ?3, ?4)",
                params![newt.newt_id, site_id, newt.secret_hash, chrono::Utc::now().to_rfc3339()],
            )?;
        }

        tx.commit()?;
        debug!("Inserted site {} ({}) in org {}", site_id, site.nice_id, site.org_id);

        Ok(Site {
            site_id,
            org_id: site.org_id.clone(),
            exit_node_id: site.exit_node_id,
            name: site.name.clone(),
            nice_id: site.nice_id.clone(),
            site_type: site.site_type,
            pub_key: site.pub_key.clone(),
            subnet: site.subnet.clone(),
        })
    }

    pub fn get_site(&self, site_id: SiteId) -> Result<Option<Site>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM sites WHERE site_id = ?1", SITE_COLUMNS),
                params![site_id],
                site_from_row,
            )
            .optional()?)
    }

    pub fn list_sites(&self, org_id: &str, page: Page) -> Result<Paged<Site>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sites WHERE org_id = ?1 ORDER BY site_id LIMIT ?2 OFFSET ?3",
            SITE_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![org_id, page.limit, page.offset], site_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM sites WHERE org_id = ?1",
            params![org_id],
            |row| row.get(0),
        )?;
        Ok(Paged { rows, total })
    }

    /// Delete a site with everything it owns. Returns the deleted site.
    pub fn delete_site(&self, site_id: SiteId) -> Result<Option<Site>> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let site = tx
            .query_row(
                &format!("SELECT {} FROM sites WHERE site_id = ?1", SITE_COLUMNS),
                params![site_id],
                site_from_row,
            )
            .optional()?;
        let Some(site) = site else {
            return Ok(None);
        };

        tx.execute(
            "DELETE FROM targets WHERE resource_id IN (SELECT resource_id FROM resources WHERE site_id = ?1)",
            params![site_id],
        )?;
        tx.execute(
            "DELETE FROM resource_rules WHERE resource_id IN (SELECT resource_id FROM resources WHERE site_id = ?1)",
            params![site_id],
        )?;
        tx.execute("DELETE FROM resources WHERE site_id = ?1", params![site_id])?;
        tx.execute("DELETE FROM newts WHERE site_id = ?1", params![site_id])?;
        tx.execute("DELETE FROM role_sites WHERE site_id = ?1", params![site_id])?;
        tx.execute("DELETE FROM user_sites WHERE site_id = ?1", params![site_id])?;
        tx.execute("DELETE FROM sites WHERE site_id = ?1", params![site_id])?;
        tx.commit()?;

        Ok(Some(site))
    }

    pub fn get_newt_by_site(&self, site_id: SiteId) -> Result<Option<Newt>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT newt_id, site_id, secret_hash, date_created FROM newts WHERE site_id = ?1 LIMIT 1",
                params![site_id],
                newt_from_row,
            )
            .optional()?)
    }

    pub fn get_newt(&self, newt_id: &str) -> Result<Option<Newt>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT newt_id, site_id, secret_hash, date_created FROM newts WHERE newt_id = ?1",
                params![newt_id],
                newt_from_row,
            )
            .optional()?)
    }

    // ========================================================================
    // Resources
    // ========================================================================

    pub fn create_resource(&self, org_id: &str, resource: &NewResource) -> Result<Resource> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO resources (site_id, org_id, name, protocol, http, subdomain, proxy_port)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                resource.site_id,
                org_id,
                resource.name,
                resource.protocol.to_string(),
                resource.http,
                resource.subdomain,
                resource.proxy_port
            ],
        )?;
        Ok(Resource {
            resource_id: conn.last_insert_rowid(),
            site_id: resource.site_id,
            org_id: org_id.to_string(),
            name: resource.name.clone(),
            protocol: resource.protocol,
            http: resource.http,
            subdomain: resource.subdomain.clone(),
            proxy_port: resource.proxy_port,
        })
    }

    pub fn get_resource(&self, resource_id: ResourceId) -> Result<Option<Resource>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM resources WHERE resource_id = ?1", RESOURCE_COLUMNS),
                params![resource_id],
                resource_from_row,
            )
            .optional()?)
    }

    pub fn list_resources(&self, site_id: SiteId) -> Result<Vec<Resource>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM resources WHERE site_id = ?1 ORDER BY resource_id",
            RESOURCE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![site_id], resource_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Targets
    // ========================================================================

    pub fn create_target(&self, target: &NewTarget) -> Result<Target> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO targets (resource_id, ip, port, method, internal_port, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                target.resource_id,
                target.ip,
                target.port,
                target.method,
                target.internal_port,
                target.enabled
            ],
        )?;
        Ok(Target {
            target_id: conn.last_insert_rowid(),
            resource_id: target.resource_id,
            ip: target.ip.clone(),
            port: target.port,
            method: target.method.clone(),
            internal_port: target.internal_port,
            enabled: target.enabled,
        })
    }

    pub fn get_target(&self, target_id: TargetId) -> Result<Option<Target>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                &format!("SELECT {} FROM targets WHERE target_id = ?1", TARGET_COLUMNS),
                params![target_id],
                target_from_row,
            )
            .optional()?)
    }

    pub fn list_targets(&self, resource_id: ResourceId, page: Page) -> Result<Paged<Target>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE resource_id = ?1 ORDER BY target_id LIMIT ?2 OFFSET ?3",
            TARGET_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![resource_id, page.limit, page.offset], target_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE resource_id = ?1",
            params![resource_id],
            |row| row.get(0),
        )?;
        Ok(Paged { rows, total })
    }

    /// Delete a target, returning the deleted row
    pub fn delete_target(&self, target_id: TargetId) -> Result<Option<Target>> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        let target = tx
            .query_row(
                &format!("SELECT {} FROM targets WHERE target_id = ?1", TARGET_COLUMNS),
                params![target_id],
                target_from_row,
            )
            .optional()?;
        if target.is_some() {
            tx.execute("DELETE FROM targets WHERE target_id = ?1", params![target_id])?;
        }
        tx.commit()?;
        Ok(target)
    }

    /// `"{ip}/32"` for every target of every resource of the site.
    ///
    /// Ordered by resource then target; repeated IPs appear once.
    pub fn site_allowed_ips(&self, site_id: SiteId) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let conn = conn.lock();

        let mut resource_stmt =
            conn.prepare("SELECT resource_id FROM resources WHERE site_id = ?1 ORDER BY resource_id")?;
        let resource_ids = resource_stmt
            .query_map(params![site_id], |row| row.get::<_, ResourceId>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut target_stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE resource_id = ?1 ORDER BY target_id",
            TARGET_COLUMNS
        ))?;

        let mut seen = HashSet::new();
        let mut allowed_ips = Vec::new();
        for resource_id in resource_ids {
            let targets = target_stmt
                .query_map(params![resource_id], target_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for target in targets {
                let ip = target.allowed_ip();
                if seen.insert(ip.clone()) {
                    allowed_ips.push(ip);
                }
            }
        }

        Ok(allowed_ips)
    }

    // ========================================================================
    // Resource rules
    // ========================================================================

    pub fn create_resource_rule(&self, rule: &NewResourceRule) -> Result<ResourceRule> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO resource_rules (resource_id, action, match_type, value) VALUES (?1, ?2, ?3, ?4)",
            params![
                rule.resource_id,
                rule.action.to_string(),
                rule.match_type.to_string(),
                rule.value
            ],
        )?;
        let rule_id = conn.last_insert_rowid();
        Ok(conn.query_row(
            "SELECT r.rule_id, r.resource_id, r.action, r.match_type, r.value, res.name
             FROM resource_rules r JOIN resources res ON res.resource_id = r.resource_id
             WHERE r.rule_id = ?1",
            params![rule_id],
            rule_from_row,
        )?)
    }

    pub fn list_resource_rules(&self, resource_id: ResourceId, page: Page) -> Result<Paged<ResourceRule>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT r.rule_id, r.resource_id, r.action, r.match_type, r.value, res.name
             FROM resource_rules r JOIN resources res ON res.resource_id = r.resource_id
             WHERE r.resource_id = ?1 ORDER BY r.rule_id LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![resource_id, page.limit, page.offset], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let total = conn.query_row(
            "SELECT COUNT(*) FROM resource_rules WHERE resource_id = ?1",
            params![resource_id],
            |row| row.get(0),
        )?;
        Ok(Paged { rows, total })
    }

    // ========================================================================
    // Invites
    // ========================================================================

    /// Replace any pending invite for the same email and org with `invite`
    pub fn replace_invite(&self, invite: &UserInvite) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM user_invites WHERE email = ?1 AND org_id = ?2",
            params![invite.email, invite.org_id],
        )?;
        tx.execute(
            "INSERT INTO user_invites (invite_id, org_id, email, role_id, token_hash, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                invite.invite_id,
                invite.org_id,
                invite.email,
                invite.role_id,
                invite.token_hash,
                invite.expires_at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_invite(&self, invite_id: &str) -> Result<Option<UserInvite>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn
            .query_row(
                "SELECT invite_id, org_id, email, role_id, token_hash, expires_at
                 FROM user_invites WHERE invite_id = ?1",
                params![invite_id],
                invite_from_row,
            )
            .optional()?)
    }

    pub fn delete_invite(&self, invite_id: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let n = conn.execute("DELETE FROM user_invites WHERE invite_id = ?1", params![invite_id])?;
        Ok(n > 0)
    }
}
