//! Sliding-window limiter for invite issuance

use fossorial_common::{Database, Result};
use parking_lot::Mutex;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Storage for per-key issuance timestamps (epoch milliseconds)
pub trait RateWindowStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<i64>>;

    /// Drop timestamps at or before `cutoff` and return the rest
    fn prune(&self, key: &str, cutoff: i64) -> Result<Vec<i64>>;

    fn append(&self, key: &str, at: i64) -> Result<()>;
}

/// Process-local store; windows reset on restart
#[derive(Default)]
pub struct InMemoryRateWindowStore {
    windows: Mutex<HashMap<String, Vec<i64>>>,
}

impl RateWindowStore for InMemoryRateWindowStore {
    fn get(&self, key: &str) -> Result<Vec<i64>> {
        Ok(self.windows.lock().get(key).cloned().unwrap_or_default())
    }

    fn prune(&self, key: &str, cutoff: i64) -> Result<Vec<i64>> {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(key) else {
            return Ok(Vec::new());
        };
        window.retain(|&at| at > cutoff);
        let remaining = window.clone();
        if remaining.is_empty() {
            windows.remove(key);
        }
        Ok(remaining)
    }

    fn append(&self, key: &str, at: i64) -> Result<()> {
        self.windows.lock().entry(key.to_string()).or_default().push(at);
        Ok(())
    }
}

/// Store backed by the `invite_rate_windows` table
pub struct SqliteRateWindowStore {
    db: Database,
}

impl SqliteRateWindowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl RateWindowStore for SqliteRateWindowStore {
    fn get(&self, key: &str) -> Result<Vec<i64>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT issued_at FROM invite_rate_windows WHERE key = ?1 ORDER BY issued_at",
        )?;
        let window = stmt
            .query_map(params![key], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(window)
    }

    fn prune(&self, key: &str, cutoff: i64) -> Result<Vec<i64>> {
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            conn.execute(
                "DELETE FROM invite_rate_windows WHERE key = ?1 AND issued_at <= ?2",
                params![key, cutoff],
            )?;
        }
        self.get(key)
    }

    fn append(&self, key: &str, at: i64) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO invite_rate_windows (key, issued_at) VALUES (?1, ?2)",
            params![key, at],
        )?;
        Ok(())
    }
}

/// Allows `max` invites per key inside any `window_ms` span
pub struct InviteRateLimiter {
    store: Arc<dyn RateWindowStore>,
    max: usize,
    window_ms: i64,
    // Check and record must not interleave across requests
    guard: Mutex<()>,
}

impl InviteRateLimiter {
    pub fn new(store: Arc<dyn RateWindowStore>, max: usize, window_ms: i64) -> Self {
        Self {
            store,
            max,
            window_ms,
            guard: Mutex::new(()),
        }
    }

    pub fn max_per_window(&self) -> usize {
        self.max
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn check_and_record(&self, key: &str) -> Result<bool> {
        self.check_and_record_at(key, chrono::Utc::now().timestamp_millis())
    }

    /// Returns whether the issuance is allowed; rejections are not recorded
    pub fn check_and_record_at(&self, key: &str, now: i64) -> Result<bool> {
        let _guard = self.guard.lock();
        let recent = self.store.prune(key, now - self.window_ms)?;
        if recent.len() >= self.max {
            debug!("Invite rate limit hit for {}", key);
            return Ok(false);
        }
        self.store.append(key, now)?;
        Ok(true)
    }
}
