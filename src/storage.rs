//! Postgres-backed collaborator implementations.
//!
//! Runtime sqlx only — no compile-time query macros, so the crate builds
//! without a live database. Credential blobs decrypt on read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::memory::FlatBillingService;
use crate::models::{Account, AccountStatus, AuthKind, Group, ModelRoute, Platform};
use crate::secrets::decrypt_secret;
use crate::services::{
    AccountRepository, ApiKeyRecord, ApiKeyRepository, BillingCacheService, BillingService,
    CostBreakdown, GroupRepository, UsageLogRepository, UsageRecord, UserRepository,
    UserSubscriptionRepository,
};

// ── Row types ───────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    name: String,
    platform: String,
    auth_kind: String,
    credential: String,
    proxy_url: Option<String>,
    base_url: Option<String>,
    priority: i32,
    concurrency_cap: i32,
    last_used_at: Option<DateTime<Utc>>,
    schedulable: bool,
    unschedulable_until: Option<DateTime<Utc>>,
    status: String,
    model_mapping: Value,
    supported_models: Value,
    rate_multiplier: f64,
    window_cost_limit: Option<f64>,
    max_sessions: Option<i32>,
    session_idle_secs: i64,
    mixed_scheduling: bool,
    tls_fingerprint: bool,
    handled_errors: Value,
    extra: Value,
}

impl AccountRow {
    fn into_account(self) -> anyhow::Result<Account> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| anyhow::anyhow!("account {}: unknown platform {}", self.id, self.platform))?;
        let auth_kind = AuthKind::parse(&self.auth_kind)
            .ok_or_else(|| anyhow::anyhow!("account {}: unknown auth kind {}", self.id, self.auth_kind))?;
        let status = match self.status.as_str() {
            "ok" => AccountStatus::Ok,
            "error" => AccountStatus::Error,
            "disabled" => AccountStatus::Disabled,
            other => anyhow::bail!("account {}: unknown status {other}", self.id),
        };
        let credential = decrypt_secret(&self.credential)
            .ok_or_else(|| anyhow::anyhow!("account {}: credential decryption failed", self.id))?;

        Ok(Account {
            id: self.id,
            name: self.name,
            platform,
            auth_kind,
            credential,
            proxy_url: self.proxy_url,
            base_url: self.base_url,
            priority: self.priority,
            concurrency_cap: self.concurrency_cap.max(1) as u32,
            last_used_at: self.last_used_at,
            schedulable: self.schedulable,
            unschedulable_until: self.unschedulable_until,
            status,
            model_mapping: serde_json::from_value(self.model_mapping).unwrap_or_default(),
            supported_models: serde_json::from_value(self.supported_models).unwrap_or_default(),
            rate_multiplier: self.rate_multiplier,
            window_cost_limit: self.window_cost_limit,
            max_sessions: self.max_sessions.map(|m| m.max(0) as u32),
            session_idle_timeout: std::time::Duration::from_secs(self.session_idle_secs.max(0) as u64),
            mixed_scheduling: self.mixed_scheduling,
            tls_fingerprint: self.tls_fingerprint,
            handled_errors: serde_json::from_value(self.handled_errors).unwrap_or_default(),
            extra: self.extra,
        })
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, platform, auth_kind, credential, proxy_url, base_url, \
     priority, concurrency_cap, last_used_at, schedulable, unschedulable_until, status, \
     model_mapping, supported_models, rate_multiplier, window_cost_limit, max_sessions, \
     session_idle_secs, mixed_scheduling, tls_fingerprint, handled_errors, extra";

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: i64,
    name: String,
    platform: String,
    fallback_group_id: Option<i64>,
    claude_code_only: bool,
    routing_enabled: bool,
    model_routing: Value,
    subscription_billing: bool,
    rate_multiplier: Option<f64>,
}

impl GroupRow {
    fn into_group(self) -> anyhow::Result<Group> {
        let platform = Platform::parse(&self.platform)
            .ok_or_else(|| anyhow::anyhow!("group {}: unknown platform {}", self.id, self.platform))?;
        let model_routing: Vec<ModelRoute> =
            serde_json::from_value(self.model_routing).unwrap_or_default();
        Ok(Group {
            id: self.id,
            name: self.name,
            platform,
            fallback_group_id: self.fallback_group_id,
            claude_code_only: self.claude_code_only,
            routing_enabled: self.routing_enabled,
            model_routing,
            subscription_billing: self.subscription_billing,
            rate_multiplier: self.rate_multiplier,
        })
    }
}

// ── Accounts ────────────────────────────────────────────────────────────

pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM gw_accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AccountRow::into_account).transpose()
    }

    async fn list_schedulable(
        &self,
        platforms: &[Platform],
        group_id: Option<i64>,
    ) -> anyhow::Result<Vec<Account>> {
        let platform_names: Vec<String> =
            platforms.iter().map(|p| p.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM gw_accounts \
             WHERE platform = ANY($1) AND schedulable AND status = 'ok' \
               AND ($2::bigint IS NULL OR id IN \
                    (SELECT account_id FROM gw_group_accounts WHERE group_id = $2)) \
             ORDER BY priority, id"
        ))
        .bind(&platform_names)
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match row.into_account() {
                Ok(account) => out.push(account),
                Err(e) => tracing::warn!(error = %e, "skipping undecodable account row"),
            }
        }
        Ok(out)
    }

    async fn in_group(&self, account_id: i64, group_id: i64) -> anyhow::Result<bool> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM gw_group_accounts WHERE account_id = $1 AND group_id = $2",
        )
        .bind(account_id)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_some())
    }

    async fn clear_expired_unschedulable(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE gw_accounts SET unschedulable_until = NULL \
             WHERE unschedulable_until IS NOT NULL AND unschedulable_until <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn touch_last_used(&self, ids: &[i64], at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE gw_accounts SET last_used_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_error(&self, account_id: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE gw_accounts SET status = 'error' WHERE id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_unschedulable_until(
        &self,
        account_id: i64,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE gw_accounts SET unschedulable_until = $2 WHERE id = $1")
            .bind(account_id)
            .bind(until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Groups / API keys ───────────────────────────────────────────────────

pub struct PgGroupRepository {
    pool: PgPool,
}

impl PgGroupRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupRepository for PgGroupRepository {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Group>> {
        let row = sqlx::query_as::<_, GroupRow>(
            "SELECT id, name, platform, fallback_group_id, claude_code_only, routing_enabled, \
                    model_routing, subscription_billing, rate_multiplier \
             FROM gw_groups WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(GroupRow::into_group).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    user_id: i64,
    group_id: Option<i64>,
    key_hash: String,
    disabled: bool,
}

pub struct PgApiKeyRepository {
    pool: PgPool,
}

impl PgApiKeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for PgApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT id, user_id, group_id, key_hash, disabled \
             FROM gw_api_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ApiKeyRecord {
            id: r.id,
            user_id: r.user_id,
            group_id: r.group_id,
            key_hash: r.key_hash,
            disabled: r.disabled,
        }))
    }
}

// ── Usage log / ledger ──────────────────────────────────────────────────

pub struct PgUsageLogRepository {
    pool: PgPool,
}

impl PgUsageLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageLogRepository for PgUsageLogRepository {
    async fn insert(&self, record: &UsageRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO gw_usage_logs \
             (request_id, user_id, api_key_id, account_id, group_id, model, \
              input_tokens, output_tokens, cache_creation_tokens, cache_read_tokens, \
              image_count, image_size_bytes, \
              input_cost, output_cost, cache_creation_cost, cache_read_cost, \
              total_cost, actual_cost, rate_multiplier, billing_type, \
              stream, duration_ms, first_token_ms, client_disconnect, user_agent, ip, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, \
                     $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)",
        )
        .bind(&record.request_id)
        .bind(record.user_id)
        .bind(record.api_key_id)
        .bind(record.account_id)
        .bind(record.group_id)
        .bind(&record.model)
        .bind(record.usage.input_tokens as i64)
        .bind(record.usage.output_tokens as i64)
        .bind(record.usage.cache_creation_tokens as i64)
        .bind(record.usage.cache_read_tokens as i64)
        .bind(record.usage.image_count.map(|v| v as i64))
        .bind(record.usage.image_size_bytes.map(|v| v as i64))
        .bind(record.cost.input_cost)
        .bind(record.cost.output_cost)
        .bind(record.cost.cache_creation_cost)
        .bind(record.cost.cache_read_cost)
        .bind(record.cost.total())
        .bind(record.actual_cost)
        .bind(record.rate_multiplier)
        .bind(record.billing_type.as_str())
        .bind(record.stream)
        .bind(record.duration_ms as i64)
        .bind(record.first_token_ms.map(|v| v as i64))
        .bind(record.client_disconnect)
        .bind(&record.user_agent)
        .bind(&record.ip)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn deduct_balance(&self, user_id: i64, amount: f64) -> anyhow::Result<()> {
        sqlx::query("UPDATE gw_users SET balance = balance - $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct PgSubscriptionRepository {
    pool: PgPool,
}

impl PgSubscriptionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserSubscriptionRepository for PgSubscriptionRepository {
    async fn active_subscription(&self, user_id: i64) -> anyhow::Result<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM gw_user_subscriptions \
             WHERE user_id = $1 AND status = 'active' AND expires_at > NOW() \
             ORDER BY expires_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn add_usage(&self, subscription_id: i64, amount: f64) -> anyhow::Result<()> {
        sqlx::query("UPDATE gw_user_subscriptions SET used_cost = used_cost + $2 WHERE id = $1")
            .bind(subscription_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Cache invalidation is a no-op without an external cache tier.
#[derive(Default)]
pub struct NoopBillingCache;

#[async_trait]
impl BillingCacheService for NoopBillingCache {
    async fn invalidate_user(&self, user_id: i64) {
        tracing::debug!(user_id, "billing cache invalidation skipped (no cache tier)");
    }

    async fn refresh_subscription(&self, subscription_id: i64) {
        tracing::debug!(subscription_id, "subscription cache refresh skipped (no cache tier)");
    }
}

// ── Billing with real window accounting ─────────────────────────────────

/// Flat unit prices (detailed pricing tables live outside the core) with
/// window costs computed from the usage log.
pub struct PgBillingService {
    pricing: FlatBillingService,
    pool: PgPool,
}

impl PgBillingService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pricing: FlatBillingService::new(),
            pool,
        }
    }
}

#[async_trait]
impl BillingService for PgBillingService {
    async fn cost_for(
        &self,
        model: &str,
        usage: &crate::models::UsageCounters,
    ) -> anyhow::Result<CostBreakdown> {
        self.pricing.cost_for(model, usage).await
    }

    async fn image_cost(&self, model: &str, count: u64, bytes: u64) -> anyhow::Result<f64> {
        self.pricing.image_cost(model, count, bytes).await
    }

    async fn window_cost(&self, account_id: i64) -> anyhow::Result<f64> {
        let cost: Option<f64> = sqlx::query_scalar(
            "SELECT SUM(total_cost) FROM gw_usage_logs \
             WHERE account_id = $1 AND created_at > NOW() - INTERVAL '5 hours'",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(cost.unwrap_or(0.0))
    }
}
