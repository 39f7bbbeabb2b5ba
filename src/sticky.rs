//! Sticky-session store: TTL-bound `(group, session) -> account` bindings.
//!
//! The store is a collaborator; the gateway only needs at-least-once
//! visibility across workers sharing the same backend. A missing or errored
//! read never fails a request — it degrades to "no affinity", which the
//! implementations express by returning `None` and logging.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait GatewayCache: Send + Sync {
    /// Bound account for a sticky key, or `None` (missing, expired, or a
    /// swallowed backend error).
    async fn get_session(&self, key: &str) -> Option<i64>;

    /// Bind (or rebind) a key. Last write wins — concurrent first-time
    /// requests on the same session may race, and either winner is valid.
    async fn set_session(&self, key: &str, account_id: i64, ttl: Duration);

    /// Extend the TTL of an existing binding; no-op when the key is gone.
    async fn refresh_session(&self, key: &str, ttl: Duration);

    async fn delete_session(&self, key: &str);

    /// Drop expired entries. Called by the maintenance watchdog; backends
    /// with native expiry leave this as the default no-op.
    async fn prune_expired(&self) {}
}

// ── In-memory implementation ────────────────────────────────────────────

struct Entry {
    account_id: i64,
    expires_at: Instant,
}

/// Single-process store used in standalone deployments and tests.
#[derive(Default)]
pub struct InMemorySessionStore {
    entries: DashMap<String, Entry>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl GatewayCache for InMemorySessionStore {
    async fn get_session(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.account_id)
    }

    async fn set_session(&self, key: &str, account_id: i64, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                account_id,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn refresh_session(&self, key: &str, ttl: Duration) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
    }

    async fn delete_session(&self, key: &str) {
        self.entries.remove(key);
    }

    async fn prune_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.expires_at > now);
    }
}
