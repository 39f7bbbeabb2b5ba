//! In-memory collaborator implementations.
//!
//! Back the standalone (no-database) deployment mode and every test that
//! doesn't want Postgres. Shapes mirror the sqlx implementations in
//! `storage.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use http::HeaderMap;

use crate::models::{Account, Group, Platform, UsageCounters};
use crate::services::{
    AccountRepository, ApiKeyRecord, ApiKeyRepository, BillingCacheService, BillingService,
    CostBreakdown, GroupRepository, RateLimitService, SessionLimiter, UsageLogRepository,
    UsageRecord, UserRepository, UserSubscriptionRepository,
};

// ── Accounts ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryAccountRepository {
    accounts: Mutex<HashMap<i64, Account>>,
    /// group id -> member account ids
    memberships: Mutex<HashMap<i64, HashSet<i64>>>,
}

impl InMemoryAccountRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account, groups: &[i64]) {
        let id = account.id;
        self.accounts.lock().unwrap().insert(id, account);
        let mut memberships = self.memberships.lock().unwrap();
        for group in groups {
            memberships.entry(*group).or_default().insert(id);
        }
    }

}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Account>> {
        Ok(self.accounts.lock().unwrap().get(&id).cloned())
    }

    async fn list_schedulable(
        &self,
        platforms: &[Platform],
        group_id: Option<i64>,
    ) -> anyhow::Result<Vec<Account>> {
        let members: Option<HashSet<i64>> = group_id
            .map(|g| self.memberships.lock().unwrap().get(&g).cloned().unwrap_or_default());
        let now = Utc::now();
        let mut out: Vec<Account> = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .filter(|a| platforms.contains(&a.platform))
            .filter(|a| members.as_ref().map(|m| m.contains(&a.id)).unwrap_or(true))
            .filter(|a| a.is_schedulable(now))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.id);
        Ok(out)
    }

    async fn in_group(&self, account_id: i64, group_id: i64) -> anyhow::Result<bool> {
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(&group_id)
            .map(|m| m.contains(&account_id))
            .unwrap_or(false))
    }

    async fn clear_expired_unschedulable(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut cleared = 0;
        for account in self.accounts.lock().unwrap().values_mut() {
            if let Some(until) = account.unschedulable_until
                && until <= now
            {
                account.unschedulable_until = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn touch_last_used(&self, ids: &[i64], at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut accounts = self.accounts.lock().unwrap();
        for id in ids {
            if let Some(account) = accounts.get_mut(id) {
                account.last_used_at = Some(at);
            }
        }
        Ok(())
    }

    async fn mark_error(&self, account_id: i64) -> anyhow::Result<()> {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&account_id) {
            account.status = crate::models::AccountStatus::Error;
        }
        Ok(())
    }

    async fn set_unschedulable_until(
        &self,
        account_id: i64,
        until: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if let Some(account) = self.accounts.lock().unwrap().get_mut(&account_id) {
            account.unschedulable_until = Some(until);
        }
        Ok(())
    }
}

// ── Groups / API keys ───────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryGroupRepository {
    groups: Mutex<HashMap<i64, Group>>,
}

impl InMemoryGroupRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: Group) {
        self.groups.lock().unwrap().insert(group.id, group);
    }
}

#[async_trait]
impl GroupRepository for InMemoryGroupRepository {
    async fn get(&self, id: i64) -> anyhow::Result<Option<Group>> {
        Ok(self.groups.lock().unwrap().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyRepository {
    keys: Mutex<Vec<ApiKeyRecord>>,
}

impl InMemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ApiKeyRecord) {
        self.keys.lock().unwrap().push(record);
    }
}

#[async_trait]
impl ApiKeyRepository for InMemoryApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> anyhow::Result<Option<ApiKeyRecord>> {
        Ok(self
            .keys
            .lock()
            .unwrap()
            .iter()
            .find(|k| k.key_hash == key_hash)
            .cloned())
    }
}

// ── Rate limit ──────────────────────────────────────────────────────────

/// Records every upstream-error / stream-timeout notification.
#[derive(Default)]
pub struct RecordingRateLimitService {
    pub upstream_errors: Mutex<Vec<(i64, u16)>>,
    pub stream_timeouts: AtomicUsize,
    pub window_updates: AtomicUsize,
}

impl RecordingRateLimitService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_count(&self) -> usize {
        self.upstream_errors.lock().unwrap().len()
    }
}

#[async_trait]
impl RateLimitService for RecordingRateLimitService {
    async fn handle_upstream_error(
        &self,
        account: &Account,
        status: u16,
        _headers: &HeaderMap,
        _body: &str,
    ) -> bool {
        self.upstream_errors.lock().unwrap().push((account.id, status));
        false
    }

    async fn update_session_window(&self, _account: &Account, _headers: &HeaderMap) {
        self.window_updates.fetch_add(1, Ordering::SeqCst);
    }

    async fn handle_stream_timeout(&self, _account: &Account, _model: &str) {
        self.stream_timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Billing ─────────────────────────────────────────────────────────────

/// Flat per-million-token prices; window costs are set directly by tests
/// or by the deployment's own accounting.
pub struct FlatBillingService {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_creation_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub window_costs: DashMap<i64, f64>,
}

impl Default for FlatBillingService {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cache_creation_per_mtok: 3.75,
            cache_read_per_mtok: 0.30,
            window_costs: DashMap::new(),
        }
    }
}

impl FlatBillingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_window_cost(&self, account_id: i64, cost: f64) {
        self.window_costs.insert(account_id, cost);
    }
}

#[async_trait]
impl BillingService for FlatBillingService {
    async fn cost_for(&self, _model: &str, usage: &UsageCounters) -> anyhow::Result<CostBreakdown> {
        let per = |tokens: u64, rate: f64| tokens as f64 * rate / 1_000_000.0;
        Ok(CostBreakdown {
            input_cost: per(usage.input_tokens, self.input_per_mtok),
            output_cost: per(usage.output_tokens, self.output_per_mtok),
            cache_creation_cost: per(usage.cache_creation_tokens, self.cache_creation_per_mtok),
            cache_read_cost: per(usage.cache_read_tokens, self.cache_read_per_mtok),
        })
    }

    async fn image_cost(&self, _model: &str, count: u64, _bytes: u64) -> anyhow::Result<f64> {
        Ok(count as f64 * 0.02)
    }

    async fn window_cost(&self, account_id: i64) -> anyhow::Result<f64> {
        Ok(self.window_costs.get(&account_id).map(|c| *c).unwrap_or(0.0))
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryUserRepository {
    pub balances: DashMap<i64, f64>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn deduct_balance(&self, user_id: i64, amount: f64) -> anyhow::Result<()> {
        *self.balances.entry(user_id).or_insert(0.0) -= amount;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySubscriptionRepository {
    /// user id -> subscription id
    pub subscriptions: DashMap<i64, i64>,
    /// subscription id -> accumulated usage
    pub usage: DashMap<i64, f64>,
}

impl InMemorySubscriptionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserSubscriptionRepository for InMemorySubscriptionRepository {
    async fn active_subscription(&self, user_id: i64) -> anyhow::Result<Option<i64>> {
        Ok(self.subscriptions.get(&user_id).map(|s| *s))
    }

    async fn add_usage(&self, subscription_id: i64, amount: f64) -> anyhow::Result<()> {
        *self.usage.entry(subscription_id).or_insert(0.0) += amount;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBillingCache {
    pub invalidated_users: Mutex<Vec<i64>>,
    pub refreshed_subscriptions: Mutex<Vec<i64>>,
}

impl RecordingBillingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingCacheService for RecordingBillingCache {
    async fn invalidate_user(&self, user_id: i64) {
        self.invalidated_users.lock().unwrap().push(user_id);
    }

    async fn refresh_subscription(&self, subscription_id: i64) {
        self.refreshed_subscriptions.lock().unwrap().push(subscription_id);
    }
}

#[derive(Default)]
pub struct InMemoryUsageLog {
    pub records: Mutex<Vec<UsageRecord>>,
}

impl InMemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UsageLogRepository for InMemoryUsageLog {
    async fn insert(&self, record: &UsageRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ── Scripted HTTP upstream ──────────────────────────────────────────────

pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl ScriptedResponse {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
            body: body.to_string(),
        }
    }
}

pub struct SentRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Replays a scripted response queue and records every outbound request.
#[derive(Default)]
pub struct ScriptedUpstream {
    responses: Mutex<std::collections::VecDeque<ScriptedResponse>>,
    pub requests: Mutex<Vec<SentRequest>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::upstream::HttpUpstream for ScriptedUpstream {
    async fn send(
        &self,
        req: crate::upstream::UpstreamRequest,
        _proxy: Option<&str>,
        _account_id: i64,
        _tls_fingerprint: bool,
    ) -> anyhow::Result<reqwest::Response> {
        self.requests.lock().unwrap().push(SentRequest {
            url: req.url,
            headers: req.headers,
            body: req.body,
        });

        let scripted = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("scripted upstream: no responses left"))?;

        let mut builder = http::Response::builder().status(scripted.status);
        for (name, value) in &scripted.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let resp = builder.body(reqwest::Body::from(scripted.body))?;
        Ok(reqwest::Response::from(resp))
    }
}

// ── Session limiter ─────────────────────────────────────────────────────

/// Per-account session budgets; unconfigured accounts are unlimited.
#[derive(Default)]
pub struct InMemorySessionLimiter {
    limits: DashMap<i64, usize>,
    sessions: DashMap<i64, HashSet<String>>,
}

impl InMemorySessionLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_limit(&self, account_id: i64, max_sessions: usize) {
        self.limits.insert(account_id, max_sessions);
    }
}

#[async_trait]
impl SessionLimiter for InMemorySessionLimiter {
    async fn register(
        &self,
        account_id: i64,
        session: &str,
        _idle_timeout: Duration,
    ) -> anyhow::Result<bool> {
        let mut sessions = self.sessions.entry(account_id).or_default();
        if sessions.contains(session) {
            return Ok(true);
        }
        if let Some(limit) = self.limits.get(&account_id)
            && sessions.len() >= *limit
        {
            return Ok(false);
        }
        sessions.insert(session.to_string());
        Ok(true)
    }
}
