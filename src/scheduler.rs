//! Account selection.
//!
//! Layered: model routing (anthropic groups) dominates sticky sessions,
//! sticky sessions dominate load-aware selection, and a fallback wait plan
//! catches the saturated case. Window-cost and session-count gates are
//! advisory caps that fail open on collaborator errors.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::{Account, AuthKind, Group, Platform};
use crate::services::{AccountRepository, BillingService, GroupRepository, SessionLimiter};
use crate::session::sticky_key;
use crate::slots::{SlotAllocator, SlotToken, SlotWaitError};
use crate::sticky::GatewayCache;

pub struct Scheduler {
    accounts: Arc<dyn AccountRepository>,
    groups: Arc<dyn GroupRepository>,
    cache: Arc<dyn GatewayCache>,
    slots: Arc<SlotAllocator>,
    billing: Arc<dyn BillingService>,
    session_limiter: Arc<dyn SessionLimiter>,
    config: Arc<GatewayConfig>,
}

pub struct SelectionRequest<'a> {
    pub group_id: Option<i64>,
    pub session: Option<&'a str>,
    pub model: &'a str,
    pub excluded: &'a HashSet<i64>,
    /// Platform forced by a platform-specific URL prefix; skips fallback
    /// group resolution entirely.
    pub forced_platform: Option<Platform>,
    pub is_claude_code: bool,
    /// Sticky-store key namespace (`openai:` on the Responses path).
    pub cache_namespace: &'a str,
}

#[derive(Debug)]
pub struct SelectedAccount {
    pub account: Account,
    pub token: SlotToken,
    pub group: Option<Group>,
    pub platform: Platform,
    pub sticky_hit: bool,
}

struct WaitPlan {
    account: Account,
    timeout: Duration,
    max_waiters: u32,
    sticky: bool,
}

enum LayerOutcome {
    Acquired {
        account: Account,
        token: SlotToken,
        sticky_hit: bool,
    },
    Wait(WaitPlan),
    Exhausted,
}

impl Scheduler {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        groups: Arc<dyn GroupRepository>,
        cache: Arc<dyn GatewayCache>,
        slots: Arc<SlotAllocator>,
        billing: Arc<dyn BillingService>,
        session_limiter: Arc<dyn SessionLimiter>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            accounts,
            groups,
            cache,
            slots,
            billing,
            session_limiter,
            config,
        }
    }

    // ── Platform resolution ─────────────────────────────────────────

    async fn group(&self, id: i64) -> Result<Group, GatewayError> {
        self.groups
            .get(id)
            .await
            .map_err(GatewayError::Internal)?
            .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("group {id} not found")))
    }

    /// Resolve the target platform, following claude-code-only fallback
    /// chains (with cycle detection) unless a platform was forced.
    async fn resolve_platform(
        &self,
        req: &SelectionRequest<'_>,
    ) -> Result<(Platform, Option<Group>), GatewayError> {
        if let Some(forced) = req.forced_platform {
            let group = match req.group_id {
                Some(id) => Some(self.group(id).await?),
                None => None,
            };
            return Ok((forced, group));
        }

        let Some(mut group_id) = req.group_id else {
            return Ok((Platform::Anthropic, None));
        };

        let mut visited = HashSet::new();
        loop {
            if !visited.insert(group_id) {
                return Err(GatewayError::FallbackCycle);
            }
            let group = self.group(group_id).await?;
            if group.claude_code_only && !req.is_claude_code {
                match group.fallback_group_id {
                    Some(fallback) => {
                        if self.config.debug_model_routing {
                            tracing::debug!(
                                from = group.id,
                                to = fallback,
                                "claude-code-only group, redirecting to fallback"
                            );
                        }
                        group_id = fallback;
                        continue;
                    }
                    None => return Err(GatewayError::ClaudeCodeOnly),
                }
            }
            return Ok((group.platform, Some(group)));
        }
    }

    // ── Gates ───────────────────────────────────────────────────────

    /// Window-cost gate for anthropic OAuth/setup-token accounts.
    /// Sticky mode tolerates the band above the limit; strict mode does
    /// not. Lookup errors fail open.
    async fn window_allows(&self, account: &Account, sticky: bool) -> bool {
        if account.platform != Platform::Anthropic || !account.uses_oauth() {
            return true;
        }
        let Some(limit) = account.window_cost_limit.filter(|l| *l > 0.0) else {
            return true;
        };
        let cost = match self.billing.window_cost(account.id).await {
            Ok(cost) => cost,
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "window-cost lookup failed, allowing");
                return true;
            }
        };
        if cost < limit {
            true
        } else if cost < limit * self.config.window_cost_hard_factor {
            // sticky-only band
            sticky
        } else {
            false
        }
    }

    async fn admissible(
        &self,
        account: &Account,
        model: &str,
        excluded: &HashSet<i64>,
        sticky: bool,
    ) -> bool {
        if excluded.contains(&account.id) {
            return false;
        }
        if !account.is_schedulable(Utc::now()) {
            return false;
        }
        if !account.supports_model(model) {
            return false;
        }
        // A partial mapping table is a model gate for API-key accounts.
        if account.auth_kind == AuthKind::ApiKey
            && !account.model_mapping.is_empty()
            && !account.model_mapping.contains_key(model)
        {
            return false;
        }
        self.window_allows(account, sticky).await
    }

    /// Session-count gate; `false` means the slot must be released and the
    /// account excluded for this request. Collaborator errors fail open.
    async fn session_allowed(&self, account: &Account, session: Option<&str>) -> bool {
        if account.platform != Platform::Anthropic || !account.uses_oauth() {
            return true;
        }
        if account.max_sessions.filter(|m| *m > 0).is_none() {
            return true;
        }
        let Some(session) = session else {
            return true;
        };
        match self
            .session_limiter
            .register(account.id, session, account.session_idle_timeout)
            .await
        {
            Ok(allowed) => allowed,
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "session-limit registration failed, allowing");
                true
            }
        }
    }

    // ── Ranking ─────────────────────────────────────────────────────

    fn last_used_order(&self, a: &Account, b: &Account, platform: Platform) -> Ordering {
        match (a.last_used_at, b.last_used_at) {
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(ua), Some(ub)) => ua.cmp(&ub),
            (None, None) => {
                if platform == Platform::Gemini && self.config.gemini_prefer_oauth {
                    match (a.uses_oauth(), b.uses_oauth()) {
                        (true, false) => Ordering::Less,
                        (false, true) => Ordering::Greater,
                        _ => Ordering::Equal,
                    }
                } else {
                    Ordering::Equal
                }
            }
        }
    }

    /// Sort by (priority asc, load asc, last-used asc with tie-breaks).
    fn rank(&self, mut accounts: Vec<Account>, platform: Platform) -> Vec<Account> {
        let loads = self
            .slots
            .load_rates(&accounts.iter().map(|a| (a.id, a.concurrency_cap)).collect::<Vec<_>>());
        accounts.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| {
                    let la = loads.get(&a.id).copied().unwrap_or(0.0);
                    let lb = loads.get(&b.id).copied().unwrap_or(0.0);
                    la.partial_cmp(&lb).unwrap_or(Ordering::Equal)
                })
                .then_with(|| self.last_used_order(a, b, platform))
        });
        accounts
    }

    // ── Layers ──────────────────────────────────────────────────────

    async fn try_sticky_account(
        &self,
        account: &Account,
        model: &str,
        excluded: &HashSet<i64>,
        key: &str,
    ) -> Option<LayerOutcome> {
        if !self.admissible(account, model, excluded, true).await {
            return None;
        }
        if let Some(token) = self.slots.try_acquire(account.id, account.concurrency_cap) {
            self.cache.refresh_session(key, self.config.sticky_ttl).await;
            return Some(LayerOutcome::Acquired {
                account: account.clone(),
                token,
                sticky_hit: true,
            });
        }
        Some(LayerOutcome::Wait(WaitPlan {
            account: account.clone(),
            timeout: self.config.slot_wait_timeout,
            max_waiters: self.config.slot_max_waiters,
            sticky: true,
        }))
    }

    /// Layer 1: group model routing (anthropic only). Returns
    /// `(routing_matched, outcome)`.
    async fn layer_routing(
        &self,
        candidates: &[Account],
        group: Option<&Group>,
        platform: Platform,
        req: &SelectionRequest<'_>,
        key: Option<&str>,
        excluded: &HashSet<i64>,
    ) -> (bool, Option<LayerOutcome>) {
        if platform != Platform::Anthropic {
            return (false, None);
        }
        let Some(route) = group.and_then(|g| g.route_for(req.model)) else {
            return (false, None);
        };

        if self.config.debug_model_routing {
            tracing::info!(
                model = req.model,
                pattern = %route.pattern,
                accounts = ?route.account_ids,
                "model routing rule matched"
            );
        }

        let restricted: Vec<Account> = candidates
            .iter()
            .filter(|a| route.account_ids.contains(&a.id))
            .cloned()
            .collect();
        if restricted.is_empty() {
            return (true, None);
        }

        // Sticky binding only honored when it points into the routed set.
        if let Some(key) = key
            && let Some(bound) = self.cache.get_session(key).await
            && let Some(account) = restricted.iter().find(|a| a.id == bound)
            && let Some(outcome) = self.try_sticky_account(account, req.model, excluded, key).await
        {
            return (true, Some(outcome));
        }

        let mut admissible = Vec::new();
        for account in &restricted {
            if self.admissible(account, req.model, excluded, false).await {
                admissible.push(account.clone());
            }
        }
        let ranked = self.rank(admissible, platform);
        for account in &ranked {
            if let Some(token) = self.slots.try_acquire(account.id, account.concurrency_cap) {
                return (
                    true,
                    Some(LayerOutcome::Acquired {
                        account: account.clone(),
                        token,
                        sticky_hit: false,
                    }),
                );
            }
        }

        // All routed accounts are full: queue on the least-loaded one.
        match ranked.into_iter().next() {
            Some(account) => (
                true,
                Some(LayerOutcome::Wait(WaitPlan {
                    account,
                    timeout: self.config.slot_wait_timeout,
                    max_waiters: self.config.slot_max_waiters,
                    sticky: false,
                })),
            ),
            None => (true, None),
        }
    }

    /// Layer 1.5: sticky session (when no routing rule matched).
    async fn layer_sticky(
        &self,
        candidates: &[Account],
        req: &SelectionRequest<'_>,
        key: &str,
        excluded: &HashSet<i64>,
    ) -> Option<LayerOutcome> {
        let bound = self.cache.get_session(key).await?;

        match candidates.iter().find(|a| a.id == bound) {
            Some(account) => self.try_sticky_account(account, req.model, excluded, key).await,
            None => {
                // Binding points outside the candidate pool. Delete it when
                // the account is gone or unschedulable so future requests
                // stop chasing it.
                match self.accounts.get(bound).await {
                    Ok(Some(account)) if account.is_schedulable(Utc::now()) => {}
                    Ok(_) => self.cache.delete_session(key).await,
                    Err(e) => {
                        tracing::warn!(account_id = bound, error = %e, "sticky account lookup failed");
                    }
                }
                None
            }
        }
    }

    /// Layers 2 + 3: load-aware selection, then a fallback wait plan.
    async fn layer_load_aware(
        &self,
        candidates: &[Account],
        platform: Platform,
        req: &SelectionRequest<'_>,
        excluded: &HashSet<i64>,
    ) -> LayerOutcome {
        let mut admissible = Vec::new();
        for account in candidates {
            if self.admissible(account, req.model, excluded, false).await {
                admissible.push(account.clone());
            }
        }
        if admissible.is_empty() {
            return LayerOutcome::Exhausted;
        }

        let loads = self.slots.load_rates(
            &admissible.iter().map(|a| (a.id, a.concurrency_cap)).collect::<Vec<_>>(),
        );
        let available: Vec<Account> = admissible
            .iter()
            .filter(|a| loads.get(&a.id).copied().unwrap_or(0.0) < 100.0)
            .cloned()
            .collect();

        for account in self.rank(available, platform) {
            if let Some(token) = self.slots.try_acquire(account.id, account.concurrency_cap) {
                return LayerOutcome::Acquired {
                    account,
                    token,
                    sticky_hit: false,
                };
            }
        }

        // Layer 3: everything is busy. Queue on the configured pick with the
        // longer fallback timeout and a larger queue.
        let pick = if self.config.fallback_pick_random {
            let best_priority = admissible.iter().map(|a| a.priority).min().unwrap_or(0);
            let band: Vec<Account> = admissible
                .iter()
                .filter(|a| a.priority == best_priority)
                .cloned()
                .collect();
            band[rand::random::<usize>() % band.len()].clone()
        } else {
            self.rank(admissible, platform).remove(0)
        };

        LayerOutcome::Wait(WaitPlan {
            account: pick,
            timeout: self.config.fallback_wait_timeout,
            max_waiters: self.config.fallback_max_waiters,
            sticky: false,
        })
    }

    // ── Entry point ─────────────────────────────────────────────────

    pub async fn select(
        &self,
        req: &SelectionRequest<'_>,
    ) -> Result<SelectedAccount, GatewayError> {
        let (platform, group) = self.resolve_platform(req).await?;

        // Mixed mode: anthropic/gemini pools include opted-in antigravity
        // accounts, unless the platform was forced.
        let platforms: Vec<Platform> =
            if req.forced_platform.is_none() && matches!(platform, Platform::Anthropic | Platform::Gemini) {
                vec![platform, Platform::Antigravity]
            } else {
                vec![platform]
            };

        let now = Utc::now();
        let candidates: Vec<Account> = self
            .accounts
            .list_schedulable(&platforms, group.as_ref().map(|g| g.id))
            .await
            .map_err(GatewayError::Internal)?
            .into_iter()
            .filter(|a| a.platform != Platform::Antigravity || a.mixed_scheduling)
            .filter(|a| a.is_schedulable(now))
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::no_account(Some(req.model)));
        }

        let key = req
            .session
            .map(|s| sticky_key(req.cache_namespace, group.as_ref().map(|g| g.id).unwrap_or(0), s));

        let mut excluded: HashSet<i64> = req.excluded.clone();

        for _ in 0..candidates.len() + 2 {
            let (routing_matched, outcome) = self
                .layer_routing(&candidates, group.as_ref(), platform, req, key.as_deref(), &excluded)
                .await;

            let outcome = match outcome {
                Some(outcome) => outcome,
                None => {
                    let sticky_outcome = if !routing_matched && let Some(key) = key.as_deref() {
                        self.layer_sticky(&candidates, req, key, &excluded).await
                    } else {
                        None
                    };
                    match sticky_outcome {
                        Some(outcome) => outcome,
                        None => self.layer_load_aware(&candidates, platform, req, &excluded).await,
                    }
                }
            };

            match outcome {
                LayerOutcome::Acquired {
                    account,
                    token,
                    sticky_hit,
                } => {
                    if !self.session_allowed(&account, req.session).await {
                        // Release before retrying selection — the slot must
                        // not leak across the retry.
                        token.release();
                        excluded.insert(account.id);
                        continue;
                    }
                    if let Some(key) = key.as_deref()
                        && !sticky_hit
                    {
                        self.cache
                            .set_session(key, account.id, self.config.sticky_ttl)
                            .await;
                    }
                    return Ok(SelectedAccount {
                        account,
                        token,
                        group,
                        platform,
                        sticky_hit,
                    });
                }
                LayerOutcome::Wait(plan) => {
                    match self
                        .slots
                        .acquire_with_wait(
                            plan.account.id,
                            plan.account.concurrency_cap,
                            plan.timeout,
                            plan.max_waiters,
                        )
                        .await
                    {
                        Ok(token) => {
                            if !self.session_allowed(&plan.account, req.session).await {
                                token.release();
                                excluded.insert(plan.account.id);
                                continue;
                            }
                            if let Some(key) = key.as_deref() {
                                if plan.sticky {
                                    self.cache.refresh_session(key, self.config.sticky_ttl).await;
                                } else {
                                    self.cache
                                        .set_session(key, plan.account.id, self.config.sticky_ttl)
                                        .await;
                                }
                            }
                            return Ok(SelectedAccount {
                                account: plan.account,
                                token,
                                group,
                                platform,
                                sticky_hit: plan.sticky,
                            });
                        }
                        Err(SlotWaitError::Saturated) => {
                            // Queue registration failed; try the next pick.
                            excluded.insert(plan.account.id);
                            continue;
                        }
                        Err(SlotWaitError::Timeout) => return Err(GatewayError::SlotTimeout),
                    }
                }
                LayerOutcome::Exhausted => {
                    return Err(GatewayError::no_account(Some(req.model)));
                }
            }
        }

        Err(GatewayError::no_account(Some(req.model)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        FlatBillingService, InMemoryAccountRepository, InMemoryGroupRepository,
        InMemorySessionLimiter,
    };
    use crate::models::{AccountStatus, ModelRoute};
    use crate::sticky::InMemorySessionStore;

    struct Fixture {
        accounts: Arc<InMemoryAccountRepository>,
        groups: Arc<InMemoryGroupRepository>,
        cache: Arc<InMemorySessionStore>,
        slots: Arc<SlotAllocator>,
        billing: Arc<FlatBillingService>,
        limiter: Arc<InMemorySessionLimiter>,
        scheduler: Scheduler,
    }

    fn fixture() -> Fixture {
        let accounts = Arc::new(InMemoryAccountRepository::new());
        let groups = Arc::new(InMemoryGroupRepository::new());
        let cache = Arc::new(InMemorySessionStore::new());
        let slots = Arc::new(SlotAllocator::new());
        let billing = Arc::new(FlatBillingService::new());
        let limiter = Arc::new(InMemorySessionLimiter::new());
        let scheduler = Scheduler::new(
            accounts.clone(),
            groups.clone(),
            cache.clone(),
            slots.clone(),
            billing.clone(),
            limiter.clone(),
            Arc::new(GatewayConfig::default()),
        );
        Fixture {
            accounts,
            groups,
            cache,
            slots,
            billing,
            limiter,
            scheduler,
        }
    }

    fn account(id: i64, platform: Platform, auth: AuthKind) -> Account {
        Account {
            id,
            name: format!("acct-{id}"),
            platform,
            auth_kind: auth,
            credential: "tok".into(),
            proxy_url: None,
            base_url: None,
            priority: 50,
            concurrency_cap: 2,
            last_used_at: None,
            schedulable: true,
            unschedulable_until: None,
            status: AccountStatus::Ok,
            model_mapping: Default::default(),
            supported_models: Vec::new(),
            rate_multiplier: 1.0,
            window_cost_limit: None,
            max_sessions: None,
            session_idle_timeout: Duration::from_secs(3600),
            mixed_scheduling: false,
            tls_fingerprint: false,
            handled_errors: Vec::new(),
            extra: serde_json::Value::Null,
        }
    }

    fn group(id: i64) -> Group {
        Group {
            id,
            name: format!("group-{id}"),
            platform: Platform::Anthropic,
            fallback_group_id: None,
            claude_code_only: false,
            routing_enabled: false,
            model_routing: Vec::new(),
            subscription_billing: false,
            rate_multiplier: None,
        }
    }

    fn request<'a>(
        group_id: Option<i64>,
        session: Option<&'a str>,
        model: &'a str,
        excluded: &'a HashSet<i64>,
    ) -> SelectionRequest<'a> {
        SelectionRequest {
            group_id,
            session,
            model,
            excluded,
            forced_platform: None,
            is_claude_code: false,
            cache_namespace: "",
        }
    }

    #[tokio::test]
    async fn sticky_binding_is_honored_and_refreshed() {
        let fx = fixture();
        fx.groups.insert(group(10));
        fx.accounts.insert(account(7, Platform::Anthropic, AuthKind::Oauth), &[10]);
        fx.accounts.insert(account(8, Platform::Anthropic, AuthKind::Oauth), &[10]);
        fx.cache
            .set_session("sticky:10:abc", 7, Duration::from_secs(3600))
            .await;

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), Some("abc"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();

        assert_eq!(selected.account.id, 7);
        assert!(selected.sticky_hit);
        assert_eq!(fx.slots.in_use_count(7), 1);
        assert_eq!(fx.cache.get_session("sticky:10:abc").await, Some(7));
    }

    #[tokio::test]
    async fn model_routing_overrides_sticky() {
        let fx = fixture();
        let mut g = group(10);
        g.routing_enabled = true;
        g.model_routing = vec![ModelRoute {
            pattern: "claude-opus-*".into(),
            account_ids: vec![3, 4],
        }];
        fx.groups.insert(g);
        for id in [3, 4, 9] {
            fx.accounts.insert(account(id, Platform::Anthropic, AuthKind::Oauth), &[10]);
        }
        fx.cache
            .set_session("sticky:10:abc", 9, Duration::from_secs(3600))
            .await;

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), Some("abc"), "claude-opus-4-5", &excluded))
            .await
            .unwrap();

        assert!([3, 4].contains(&selected.account.id));
        // Binding moved to the routed account.
        assert_eq!(
            fx.cache.get_session("sticky:10:abc").await,
            Some(selected.account.id)
        );
    }

    #[tokio::test]
    async fn excluded_accounts_are_never_selected() {
        let fx = fixture();
        fx.groups.insert(group(10));
        fx.accounts.insert(account(1, Platform::Anthropic, AuthKind::Oauth), &[10]);
        fx.accounts.insert(account(2, Platform::Anthropic, AuthKind::Oauth), &[10]);

        let excluded: HashSet<i64> = [1].into_iter().collect();
        let selected = fx
            .scheduler
            .select(&request(Some(10), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.account.id, 2);

        let both: HashSet<i64> = [1, 2].into_iter().collect();
        let err = fx
            .scheduler
            .select(&request(Some(10), None, "claude-sonnet-4-5", &both))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountAvailable { .. }));
    }

    #[tokio::test]
    async fn claude_code_only_redirects_or_rejects() {
        let fx = fixture();
        let mut gated = group(1);
        gated.claude_code_only = true;
        gated.fallback_group_id = Some(2);
        fx.groups.insert(gated);
        fx.groups.insert(group(2));
        fx.accounts.insert(account(5, Platform::Anthropic, AuthKind::Oauth), &[2]);

        let excluded = HashSet::new();
        // Non-claude-code request: lands in the fallback group.
        let selected = fx
            .scheduler
            .select(&request(Some(1), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.group.as_ref().map(|g| g.id), Some(2));

        // No fallback: hard rejection.
        let mut lone = group(3);
        lone.claude_code_only = true;
        fx.groups.insert(lone);
        let err = fx
            .scheduler
            .select(&request(Some(3), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ClaudeCodeOnly));
    }

    #[tokio::test]
    async fn fallback_cycles_are_detected() {
        let fx = fixture();
        let mut a = group(1);
        a.claude_code_only = true;
        a.fallback_group_id = Some(2);
        let mut b = group(2);
        b.claude_code_only = true;
        b.fallback_group_id = Some(1);
        fx.groups.insert(a);
        fx.groups.insert(b);

        let excluded = HashSet::new();
        let err = fx
            .scheduler
            .select(&request(Some(1), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FallbackCycle));
    }

    #[tokio::test]
    async fn mixed_scheduling_includes_opted_in_antigravity() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut mixed = account(20, Platform::Antigravity, AuthKind::Oauth);
        mixed.mixed_scheduling = true;
        fx.accounts.insert(mixed, &[10]);
        let plain = account(21, Platform::Antigravity, AuthKind::Oauth);
        fx.accounts.insert(plain, &[10]);

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        // Only the opted-in antigravity account qualifies.
        assert_eq!(selected.account.id, 20);
    }

    #[tokio::test]
    async fn priority_and_never_used_win_ties() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut low = account(1, Platform::Anthropic, AuthKind::Oauth);
        low.priority = 10;
        low.last_used_at = Some(Utc::now());
        let mut high = account(2, Platform::Anthropic, AuthKind::Oauth);
        high.priority = 20;
        fx.accounts.insert(low, &[10]);
        fx.accounts.insert(high, &[10]);

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        // Lower priority number wins despite being recently used.
        assert_eq!(selected.account.id, 1);

        // Equal priority: never-used beats ever-used.
        let fx2 = fixture();
        fx2.groups.insert(group(10));
        let mut used = account(1, Platform::Anthropic, AuthKind::Oauth);
        used.last_used_at = Some(Utc::now());
        fx2.accounts.insert(used, &[10]);
        fx2.accounts.insert(account(2, Platform::Anthropic, AuthKind::Oauth), &[10]);
        let selected = fx2
            .scheduler
            .select(&request(Some(10), None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.account.id, 2);
    }

    #[tokio::test]
    async fn window_cost_sticky_only_band() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut capped = account(1, Platform::Anthropic, AuthKind::Oauth);
        capped.window_cost_limit = Some(10.0);
        fx.accounts.insert(capped, &[10]);
        // Over the limit but under limit * hard_factor (1.5).
        fx.billing.set_window_cost(1, 12.0);

        let excluded = HashSet::new();
        // Fresh request (no binding): blocked.
        let err = fx
            .scheduler
            .select(&request(Some(10), Some("sess"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountAvailable { .. }));

        // Sticky request keeps working.
        fx.cache
            .set_session("sticky:10:sess", 1, Duration::from_secs(3600))
            .await;
        let selected = fx
            .scheduler
            .select(&request(Some(10), Some("sess"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.account.id, 1);
        assert!(selected.sticky_hit);

        // Past the hard band: even sticky is refused.
        fx.billing.set_window_cost(1, 16.0);
        let err = fx
            .scheduler
            .select(&request(Some(10), Some("sess"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoAccountAvailable { .. }));
    }

    #[tokio::test]
    async fn session_limit_rejection_releases_slot_and_retries() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut limited = account(1, Platform::Anthropic, AuthKind::Oauth);
        limited.priority = 1;
        limited.max_sessions = Some(1);
        fx.accounts.insert(limited, &[10]);
        fx.accounts.insert(account(2, Platform::Anthropic, AuthKind::Oauth), &[10]);
        // Account 1 has no free session budget.
        fx.limiter.set_limit(1, 0);

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), Some("sess"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();

        assert_eq!(selected.account.id, 2);
        // The slot briefly held on account 1 was released.
        assert_eq!(fx.slots.in_use_count(1), 0);
        assert_eq!(fx.slots.in_use_count(2), 1);
    }

    #[tokio::test]
    async fn binding_to_unschedulable_account_is_deleted() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut dead = account(7, Platform::Anthropic, AuthKind::Oauth);
        dead.status = AccountStatus::Error;
        fx.accounts.insert(dead, &[10]);
        fx.accounts.insert(account(8, Platform::Anthropic, AuthKind::Oauth), &[10]);
        fx.cache
            .set_session("sticky:10:abc", 7, Duration::from_secs(3600))
            .await;

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), Some("abc"), "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();

        assert_eq!(selected.account.id, 8);
        // The stale binding was dropped, then rebound to the new account.
        assert_eq!(fx.cache.get_session("sticky:10:abc").await, Some(8));
    }

    #[tokio::test]
    async fn no_group_defaults_to_anthropic() {
        let fx = fixture();
        fx.accounts.insert(account(1, Platform::Anthropic, AuthKind::ApiKey), &[]);
        fx.accounts.insert(account(2, Platform::Openai, AuthKind::ApiKey), &[]);

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(None, None, "claude-sonnet-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.account.id, 1);
        assert_eq!(selected.platform, Platform::Anthropic);
    }

    #[tokio::test]
    async fn model_scope_filters_candidates() {
        let fx = fixture();
        fx.groups.insert(group(10));
        let mut narrow = account(1, Platform::Anthropic, AuthKind::Oauth);
        narrow.priority = 1;
        narrow.supported_models = vec!["claude-haiku-*".into()];
        fx.accounts.insert(narrow, &[10]);
        fx.accounts.insert(account(2, Platform::Anthropic, AuthKind::Oauth), &[10]);

        let excluded = HashSet::new();
        let selected = fx
            .scheduler
            .select(&request(Some(10), None, "claude-opus-4-5", &excluded))
            .await
            .unwrap();
        assert_eq!(selected.account.id, 2);
    }
}
