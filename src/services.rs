//! Collaborator interfaces the core consumes.
//!
//! Everything stateful outside the request path hides behind one of these
//! traits: Postgres implementations live in `storage.rs`, in-memory ones in
//! `memory.rs` (standalone mode and tests).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::HeaderMap;
use tokio::sync::Mutex;

use crate::models::{Account, Group, Platform, UsageCounters};

// ── Repositories ────────────────────────────────────────────────────────

#[async_trait]
pub trait AccountRepository: Send + Sync {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Account>>;

    /// Schedulable accounts for any of `platforms`, optionally restricted to
    /// a group's membership. Results may be slightly stale; the scheduler
    /// re-checks schedulability per account.
    async fn list_schedulable(
        &self,
        platforms: &[Platform],
        group_id: Option<i64>,
    ) -> anyhow::Result<Vec<Account>>;

    async fn in_group(&self, account_id: i64, group_id: i64) -> anyhow::Result<bool>;

    /// Clear temporary-unschedulable deadlines that have passed.
    async fn clear_expired_unschedulable(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Batched last-used touch (the watchdog flushes the queue here).
    async fn touch_last_used(&self, ids: &[i64], at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Status flip driven by the rate-limit collaborator's verdicts.
    async fn mark_error(&self, account_id: i64) -> anyhow::Result<()>;

    async fn set_unschedulable_until(
        &self,
        account_id: i64,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GroupRepository: Send + Sync {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Group>>;
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub user_id: i64,
    pub group_id: Option<i64>,
    /// SHA-256 hex of the key secret.
    pub key_hash: String,
    pub disabled: bool,
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Lookup by SHA-256 hex of the presented secret.
    async fn find_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRecord>>;
}

// ── Rate limiting / account health ──────────────────────────────────────

#[async_trait]
pub trait RateLimitService: Send + Sync {
    /// Inspect a final upstream failure; returns true when the account was
    /// disabled as a result (repeated 403s, hard quota exhaustion, ...).
    async fn handle_upstream_error(
        &self,
        account: &Account,
        status: u16,
        headers: &HeaderMap,
        body: &str,
    ) -> bool;

    /// Feed rate-limit window headers from a successful response.
    async fn update_session_window(&self, account: &Account, headers: &HeaderMap);

    async fn handle_stream_timeout(&self, account: &Account, model: &str);
}

// ── Billing ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
    }
}

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn cost_for(&self, model: &str, usage: &UsageCounters) -> anyhow::Result<CostBreakdown>;

    async fn image_cost(&self, model: &str, count: u64, bytes: u64) -> anyhow::Result<f64>;

    /// Accumulated standard cost in the account's current 5-hour window.
    async fn window_cost(&self, account_id: i64) -> anyhow::Result<f64>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn deduct_balance(&self, user_id: i64, amount: f64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait UserSubscriptionRepository: Send + Sync {
    /// Active subscription id for the user, if any.
    async fn active_subscription(&self, user_id: i64) -> anyhow::Result<Option<i64>>;

    async fn add_usage(&self, subscription_id: i64, amount: f64) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BillingCacheService: Send + Sync {
    async fn invalidate_user(&self, user_id: i64);

    async fn refresh_subscription(&self, subscription_id: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingType {
    Balance,
    Subscription,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::Balance => "balance",
            BillingType::Subscription => "subscription",
        }
    }
}

/// One usage-log row, ready for insertion.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: i64,
    pub api_key_id: i64,
    pub account_id: i64,
    pub group_id: Option<i64>,
    pub model: String,
    pub usage: UsageCounters,
    pub cost: CostBreakdown,
    pub actual_cost: f64,
    pub rate_multiplier: f64,
    pub billing_type: BillingType,
    pub stream: bool,
    pub duration_ms: u64,
    pub first_token_ms: Option<u64>,
    pub client_disconnect: bool,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UsageLogRepository: Send + Sync {
    async fn insert(&self, record: &UsageRecord) -> anyhow::Result<()>;
}

// ── Tokens / sessions ───────────────────────────────────────────────────

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current access token for an account. Implementations may refresh
    /// synchronously; that machinery lives outside the core.
    async fn access_token(&self, account: &Account) -> anyhow::Result<String>;
}

/// Reads the credential blob directly — the default for API-key accounts
/// and for deployments whose refresh daemon keeps blobs current.
pub struct DirectTokenProvider;

#[async_trait]
impl TokenProvider for DirectTokenProvider {
    async fn access_token(&self, account: &Account) -> anyhow::Result<String> {
        if account.credential.is_empty() {
            anyhow::bail!("account {} has no live credential", account.id);
        }
        Ok(account.credential.clone())
    }
}

/// Memoizes tokens per account for a short TTL. Fronts the anthropic OAuth
/// path, where the refresh daemon rotates the underlying credential blob
/// out-of-band; other accounts pass straight through.
pub struct CachedTokenProvider<P> {
    inner: P,
    ttl: Duration,
    cache: dashmap::DashMap<i64, (String, std::time::Instant)>,
}

impl<P: TokenProvider> CachedTokenProvider<P> {
    pub fn new(inner: P, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: dashmap::DashMap::new(),
        }
    }
}

#[async_trait]
impl<P: TokenProvider> TokenProvider for CachedTokenProvider<P> {
    async fn access_token(&self, account: &Account) -> anyhow::Result<String> {
        if account.platform != Platform::Anthropic || !matches!(
            account.auth_kind,
            crate::models::AuthKind::Oauth | crate::models::AuthKind::SetupToken
        ) {
            return self.inner.access_token(account).await;
        }

        let now = std::time::Instant::now();
        if let Some(hit) = self.cache.get(&account.id)
            && hit.1 > now
        {
            return Ok(hit.0.clone());
        }
        let token = self.inner.access_token(account).await?;
        self.cache.insert(account.id, (token.clone(), now + self.ttl));
        Ok(token)
    }
}

#[async_trait]
pub trait SessionLimiter: Send + Sync {
    /// Register a session fingerprint against an account's max-sessions
    /// budget. `Ok(false)` = not allowed. Errors fail open at the call site.
    async fn register(
        &self,
        account_id: i64,
        session: &str,
        idle_timeout: Duration,
    ) -> anyhow::Result<bool>;
}

// ── Deferred last-used touches ──────────────────────────────────────────

/// Accounts that served a request since the last flush. The watchdog drains
/// the set into one batched repository write, avoiding a per-request UPDATE.
#[derive(Default)]
pub struct TouchQueue {
    pending: Mutex<HashSet<i64>>,
}

impl TouchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, account_id: i64) {
        self.pending.lock().await.insert(account_id);
    }

    pub async fn drain(&self) -> Vec<i64> {
        let mut guard = self.pending.lock().await;
        guard.drain().collect()
    }

    pub async fn flush(&self, repo: &Arc<dyn AccountRepository>) {
        let ids = self.drain().await;
        if ids.is_empty() {
            return;
        }
        if let Err(e) = repo.touch_last_used(&ids, Utc::now()).await {
            tracing::warn!(count = ids.len(), error = %e, "last-used touch flush failed");
        } else {
            tracing::debug!(count = ids.len(), "flushed last-used touches");
        }
    }
}
