//! Peer outbox
//!
//! Durable queue of exit node calls that failed after the client's retries.
//! The worker replays due entries with exponential backoff and drops them
//! once they are obsolete or have exhausted their attempts.
//!
//! Newt deltas of one site form a FIFO: only the oldest pending delta of a
//! site is ever handed to the worker.

use crate::config::OutboxConfig;
use crate::reconciler::{PeerCall, PeerReconciler};
use fossorial_common::{Database, Result, SiteId};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const ADD_PEER: &str = "add_peer";
const NEWT_TARGETS: &str = "newt_targets";

/// A parked call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub entry_id: i64,
    pub site_id: SiteId,
    pub call: PeerCall,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
}

/// Outbox store
#[derive(Clone)]
pub struct Outbox {
    db: Database,
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(db: Database, config: OutboxConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Park a failed call.
    ///
    /// A site has at most one pending full push; a newer one replaces it.
    pub fn enqueue(&self, site_id: SiteId, call: &PeerCall, last_error: &str) -> Result<i64> {
        self.enqueue_at(site_id, call, last_error, now_ms())
    }

    pub fn enqueue_at(
        &self,
        site_id: SiteId,
        call: &PeerCall,
        last_error: &str,
        now: i64,
    ) -> Result<i64> {
        let payload = serde_json::to_string(call)?;
        let next_attempt_at = now + self.backoff(0).as_millis() as i64;

        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        if call.kind() == ADD_PEER {
            tx.execute(
                "DELETE FROM peer_outbox WHERE site_id = ?1 AND kind = ?2",
                params![site_id, ADD_PEER],
            )?;
        }
        tx.execute(
            "INSERT INTO peer_outbox (site_id, kind, payload, attempts, next_attempt_at, last_error, created_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)",
            params![site_id, call.kind(), payload, next_attempt_at, last_error, now],
        )?;
        let entry_id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Queued {} for site {} as entry {}", call.kind(), site_id, entry_id);
        Ok(entry_id)
    }

    /// Drop the pending full push for a site, if any
    pub fn clear_full_push(&self, site_id: SiteId) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.execute(
            "DELETE FROM peer_outbox WHERE site_id = ?1 AND kind = ?2",
            params![site_id, ADD_PEER],
        )?)
    }

    /// Whether newt deltas for a site are still waiting to be delivered
    pub fn has_pending_deltas(&self, site_id: SiteId) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM peer_outbox WHERE site_id = ?1 AND kind = ?2)",
            params![site_id, NEWT_TARGETS],
            |row| row.get(0),
        )?)
    }

    /// Drop every pending call for a site
    pub fn clear_site(&self, site_id: SiteId) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        Ok(conn.execute(
            "DELETE FROM peer_outbox WHERE site_id = ?1",
            params![site_id],
        )?)
    }

    /// Entries whose next attempt is due, oldest first.
    ///
    /// A newt delta is only due once every older delta of its site is gone.
    pub fn due(&self, now: i64, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT o.entry_id, o.site_id, o.payload, o.attempts, o.next_attempt_at, o.last_error
             FROM peer_outbox o
             WHERE o.next_attempt_at <= ?1
               AND (o.kind != ?3 OR NOT EXISTS (
                   SELECT 1 FROM peer_outbox p
                   WHERE p.site_id = o.site_id AND p.kind = ?3 AND p.entry_id < o.entry_id))
             ORDER BY o.entry_id LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![now, limit as i64, NEWT_TARGETS], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, SiteId>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (entry_id, site_id, payload, attempts, next_attempt_at, last_error) in rows {
            entries.push(OutboxEntry {
                entry_id,
                site_id,
                call: serde_json::from_str(&payload)?,
                attempts,
                next_attempt_at,
                last_error,
            });
        }
        Ok(entries)
    }

    pub fn get(&self, entry_id: i64) -> Result<Option<OutboxEntry>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row = conn
            .query_row(
                "SELECT site_id, payload, attempts, next_attempt_at, last_error
                 FROM peer_outbox WHERE entry_id = ?1",
                params![entry_id],
                |row| {
                    Ok((
                        row.get::<_, SiteId>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(site_id, payload, attempts, next_attempt_at, last_error)| -> Result<OutboxEntry> {
            Ok(OutboxEntry {
                entry_id,
                site_id,
                call: serde_json::from_str(&payload)?,
                attempts,
                next_attempt_at,
                last_error,
            })
        })
        .transpose()
    }

    /// Record a failed replay and schedule the next one
    pub fn mark_failed(&self, entry: &OutboxEntry, err: &str, now: i64) -> Result<()> {
        let attempts = entry.attempts + 1;
        let next_attempt_at = now + self.backoff(attempts).as_millis() as i64;
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE peer_outbox SET attempts = ?1, next_attempt_at = ?2, last_error = ?3 WHERE entry_id = ?4",
            params![attempts, next_attempt_at, err, entry.entry_id],
        )?;
        Ok(())
    }

    pub fn remove(&self, entry_id: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute("DELETE FROM peer_outbox WHERE entry_id = ?1", params![entry_id])?;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM peer_outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `interval * 2^attempts`, capped at `max_backoff_secs`
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base = Duration::from_secs(self.config.interval_secs.max(1));
        let max = Duration::from_secs(self.config.max_backoff_secs);
        base.checked_mul(2u32.saturating_pow(attempts))
            .map(|d| d.min(max))
            .unwrap_or(max)
    }
}

/// Result of one worker pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub replayed: usize,
    pub failed: usize,
    pub dropped: usize,
}

/// Background replay loop
pub struct OutboxWorker {
    reconciler: Arc<PeerReconciler>,
}

impl OutboxWorker {
    pub fn new(reconciler: Arc<PeerReconciler>) -> Self {
        Self { reconciler }
    }

    /// Run until the task is cancelled
    pub async fn run(self) {
        let interval = Duration::from_secs(self.reconciler.outbox().config().interval_secs.max(1));
        info!("Starting peer outbox worker (interval: {:?})", interval);

        loop {
            match self.tick_at(now_ms()).await {
                Ok(report) if report != TickReport::default() => {
                    info!(
                        "Outbox pass: {} replayed, {} failed, {} dropped",
                        report.replayed, report.failed, report.dropped
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Outbox pass failed: {}", e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Replay everything due at `now`
    pub async fn tick_at(&self, now: i64) -> Result<TickReport> {
        let outbox = self.reconciler.outbox();
        let config = outbox.config().clone();
        let mut report = TickReport::default();

        for entry in outbox.due(now, config.batch_size)? {
            match self.reconciler.replay(entry.site_id, &entry.call).await {
                Ok(()) => {
                    outbox.remove(entry.entry_id)?;
                    report.replayed += 1;
                }
                Err(e) if !e.is_transient() => {
                    warn!(
                        "Dropping outbox entry {} for site {}: {}",
                        entry.entry_id, entry.site_id, e
                    );
                    outbox.remove(entry.entry_id)?;
                    report.dropped += 1;
                }
                Err(e) if entry.attempts + 1 >= config.max_attempts => {
                    error!(
                        "Giving up on outbox entry {} for site {} after {} attempts: {}",
                        entry.entry_id,
                        entry.site_id,
                        entry.attempts + 1,
                        e
                    );
                    outbox.remove(entry.entry_id)?;
                    report.dropped += 1;
                }
                Err(e) => {
                    outbox.mark_failed(&entry, &e.to_string(), now)?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_node::fake::{Call, RecordingClient};
    use crate::exit_node::{PeerConfig, TargetAction};
    use crate::reconciler::ReconcileOutcome;
    use crate::registry::{NewNewt, NewResource, NewSite, NewTarget, Registry};
    use fossorial_common::{Protocol, SiteType};

    fn config() -> OutboxConfig {
        OutboxConfig {
            interval_secs: 5,
            max_attempts: 3,
            max_backoff_secs: 60,
            batch_size: 10,
        }
    }

    fn add_peer(ips: &[&str]) -> PeerCall {
        PeerCall::AddPeer {
            exit_node_id: 1,
            peer: PeerConfig {
                public_key: "PK".into(),
                allowed_ips: ips.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_backoff_capped() {
        let outbox = Outbox::new(Database::open_memory().unwrap(), config());
        assert_eq!(outbox.backoff(0), Duration::from_secs(5));
        assert_eq!(outbox.backoff(2), Duration::from_secs(20));
        assert_eq!(outbox.backoff(10), Duration::from_secs(60));
        assert_eq!(outbox.backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn test_full_push_collapses_per_site() {
        let outbox = Outbox::new(Database::open_memory().unwrap(), config());
        outbox.enqueue_at(1, &add_peer(&[]), "down", 0).unwrap();
        outbox.enqueue_at(1, &add_peer(&["10.0.0.1/32"]), "down", 0).unwrap();
        outbox.enqueue_at(2, &add_peer(&[]), "down", 0).unwrap();
        assert_eq!(outbox.len().unwrap(), 2);

        let due = outbox.due(5_000, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].site_id, 1);
        assert_eq!(due[0].call, add_peer(&["10.0.0.1/32"]));
        assert!(outbox.due(4_999, 10).unwrap().is_empty());
    }

    #[test]
    fn test_mark_failed_reschedules() {
        let outbox = Outbox::new(Database::open_memory().unwrap(), config());
        let id = outbox.enqueue_at(1, &add_peer(&[]), "down", 0).unwrap();
        let entry = outbox.get(id).unwrap().unwrap();
        outbox.mark_failed(&entry, "still down", 5_000).unwrap();

        let entry = outbox.get(id).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_attempt_at, 15_000);
        assert_eq!(entry.last_error.as_deref(), Some("still down"));
    }

    fn wireguard_fixture() -> (Registry, Arc<RecordingClient>, Arc<PeerReconciler>, SiteId) {
        let db = Database::open_memory().unwrap();
        let registry = Registry::new(db.clone());
        let (_, admin) = registry.create_org("acme", "Acme").unwrap();
        let site = registry
            .insert_site(
                &NewSite {
                    org_id: "acme".into(),
                    exit_node_id: 1,
                    name: "edge".into(),
                    nice_id: "quiet-badger".into(),
                    site_type: SiteType::Wireguard,
                    pub_key: Some("PK".into()),
                    subnet: "100.90.128.0/24".into(),
                },
                admin.role_id,
                None,
                None,
            )
            .unwrap();
        let client = Arc::new(RecordingClient::default());
        let reconciler = Arc::new(PeerReconciler::new(
            registry.clone(),
            client.clone(),
            Outbox::new(db, config()),
        ));
        (registry, client, reconciler, site.site_id)
    }

    #[tokio::test]
    async fn test_replay_recomputes_allow_list() {
        let (registry, client, reconciler, site_id) = wireguard_fixture();
        reconciler
            .outbox()
            .enqueue_at(site_id, &add_peer(&[]), "down", 0)
            .unwrap();

        // Targets added while the push was parked are picked up on replay
        let resource = registry
            .create_resource(
                "acme",
                &NewResource {
                    site_id,
                    name: "web".into(),
                    protocol: Protocol::Tcp,
                    http: true,
                    subdomain: Some("web".into()),
                    proxy_port: None,
                },
            )
            .unwrap();
        registry
            .create_target(&NewTarget {
                resource_id: resource.resource_id,
                ip: "10.0.0.9".into(),
                port: 80,
                method: Some("http".into()),
                internal_port: None,
                enabled: true,
            })
            .unwrap();

        let worker = OutboxWorker::new(reconciler.clone());
        let report = worker.tick_at(10_000).await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(reconciler.outbox().is_empty().unwrap());
        assert_eq!(
            client.calls(),
            vec![Call::AddPeer(
                1,
                PeerConfig {
                    public_key: "PK".into(),
                    allowed_ips: vec!["10.0.0.9/32".into()],
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_dropped() {
        let (_, client, reconciler, site_id) = wireguard_fixture();
        let id = reconciler
            .outbox()
            .enqueue_at(site_id, &add_peer(&[]), "down", 0)
            .unwrap();
        client.set_failing(true);
        let worker = OutboxWorker::new(reconciler.clone());

        let report = worker.tick_at(10_000).await.unwrap();
        assert_eq!(report.failed, 1);
        let entry = reconciler.outbox().get(id).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);

        // Not due yet
        assert_eq!(worker.tick_at(10_001).await.unwrap(), TickReport::default());

        worker.tick_at(1_000_000).await.unwrap();
        let report = worker.tick_at(2_000_000).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(reconciler.outbox().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_entry_for_deleted_site_dropped() {
        let (registry, client, reconciler, site_id) = wireguard_fixture();
        reconciler
            .outbox()
            .enqueue_at(site_id, &add_peer(&[]), "down", 0)
            .unwrap();
        registry.delete_site(site_id).unwrap();

        let report = OutboxWorker::new(reconciler.clone())
            .tick_at(10_000)
            .await
            .unwrap();
        assert_eq!(report.dropped, 1);
        assert!(client.calls().is_empty());
    }

    fn newt_fixture() -> (Registry, Arc<RecordingClient>, Arc<PeerReconciler>, SiteId) {
        let db = Database::open_memory().unwrap();
        let registry = Registry::new(db.clone());
        let (_, admin) = registry.create_org("acme", "Acme").unwrap();
        let site = registry
            .insert_site(
                &NewSite {
                    org_id: "acme".into(),
                    exit_node_id: 1,
                    name: "branch".into(),
                    nice_id: "calm-mole".into(),
                    site_type: SiteType::Newt,
                    pub_key: None,
                    subnet: "100.90.129.0/24".into(),
                },
                admin.role_id,
                None,
                Some(&NewNewt {
                    newt_id: "N1".into(),
                    secret_hash: "hash".into(),
                }),
            )
            .unwrap();
        let client = Arc::new(RecordingClient::default());
        let reconciler = Arc::new(PeerReconciler::new(
            registry.clone(),
            client.clone(),
            Outbox::new(db, config()),
        ));
        (registry, client, reconciler, site.site_id)
    }

    #[tokio::test]
    async fn test_newt_deltas_delivered_in_order() {
        let (registry, client, reconciler, site_id) = newt_fixture();
        let site = registry.get_site(site_id).unwrap().unwrap();
        let resource = registry
            .create_resource(
                "acme",
                &NewResource {
                    site_id,
                    name: "ssh".into(),
                    protocol: Protocol::Tcp,
                    http: false,
                    subdomain: None,
                    proxy_port: Some(2222),
                },
            )
            .unwrap();
        let target = registry
            .create_target(&NewTarget {
                resource_id: resource.resource_id,
                ip: "192.168.1.20".into(),
                port: 22,
                method: None,
                internal_port: None,
                enabled: true,
            })
            .unwrap();

        client.set_failing(true);
        let added = reconciler
            .target_added(&site, &resource, &target)
            .await
            .unwrap();
        assert_eq!(added, ReconcileOutcome::Deferred);

        // The agent is reachable again, but the removal must wait its turn
        client.set_failing(false);
        let deleted = registry.delete_target(target.target_id).unwrap().unwrap();
        let removed = reconciler
            .target_removed(&site, &resource, &deleted)
            .await
            .unwrap();
        assert_eq!(removed, ReconcileOutcome::Deferred);
        assert!(client.calls().is_empty());
        assert_eq!(reconciler.outbox().len().unwrap(), 2);

        let worker = OutboxWorker::new(reconciler.clone());
        let later = now_ms() + 3_600_000;
        assert_eq!(worker.tick_at(later).await.unwrap().replayed, 1);
        assert_eq!(worker.tick_at(later).await.unwrap().replayed, 1);
        assert!(reconciler.outbox().is_empty().unwrap());

        assert_eq!(
            client.calls(),
            vec![
                Call::AddTargets("N1".into(), vec![target.clone()], Protocol::Tcp),
                Call::RemoveTargets("N1".into(), vec![target], Protocol::Tcp),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_head_delta_blocks_later_ones() {
        let (_, client, reconciler, site_id) = newt_fixture();
        let delta = |action| PeerCall::NewtTargets {
            newt_id: "N1".into(),
            action,
            protocol: Protocol::Udp,
            targets: Vec::new(),
        };
        let outbox = reconciler.outbox();
        let head = outbox
            .enqueue_at(site_id, &delta(TargetAction::Add), "down", 0)
            .unwrap();
        outbox
            .enqueue_at(site_id, &delta(TargetAction::Remove), "down", 0)
            .unwrap();
        assert!(outbox.has_pending_deltas(site_id).unwrap());

        let due = outbox.due(10_000, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].entry_id, head);

        client.set_failing(true);
        let worker = OutboxWorker::new(reconciler.clone());
        let report = worker.tick_at(10_000).await.unwrap();
        assert_eq!(report.failed, 1);

        // The head is backing off; its successor stays parked behind it
        assert!(outbox.due(10_001, 10).unwrap().is_empty());
        assert!(client.calls().is_empty());
    }
}
