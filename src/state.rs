//! Shared application state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use sqlx::PgPool;

use crate::config::GatewayConfig;
use crate::identity::{IdentityService, StableIdentityService};
use crate::memory::{
    FlatBillingService, InMemoryAccountRepository, InMemoryApiKeyRepository,
    InMemoryGroupRepository, InMemorySessionLimiter, InMemorySubscriptionRepository,
    InMemoryUsageLog, InMemoryUserRepository, RecordingBillingCache, RecordingRateLimitService,
};
use crate::ratelimit::AccountHealthService;
use crate::scheduler::Scheduler;
use crate::services::{
    AccountRepository, ApiKeyRepository, BillingCacheService, BillingService, CachedTokenProvider,
    DirectTokenProvider, GroupRepository, RateLimitService, SessionLimiter, TokenProvider,
    TouchQueue, UsageLogRepository, UserRepository, UserSubscriptionRepository,
};
use crate::slots::SlotAllocator;
use crate::sticky::{GatewayCache, InMemorySessionStore};
use crate::storage::{
    NoopBillingCache, PgAccountRepository, PgApiKeyRepository, PgBillingService,
    PgGroupRepository, PgSubscriptionRepository, PgUsageLogRepository, PgUserRepository,
};
use crate::upstream::{HttpUpstream, ReqwestUpstream};
use crate::usage::UsageRecorder;

/// Everything one gateway worker shares across requests. Clone-friendly —
/// all fields are Arcs.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub accounts: Arc<dyn AccountRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub cache: Arc<dyn GatewayCache>,
    pub slots: Arc<SlotAllocator>,
    pub scheduler: Arc<Scheduler>,
    pub upstream: Arc<dyn HttpUpstream>,
    pub identity: Arc<dyn IdentityService>,
    pub tokens: Arc<dyn TokenProvider>,
    pub rate_limit: Arc<dyn RateLimitService>,
    pub recorder: Arc<UsageRecorder>,
    pub touch: Arc<TouchQueue>,
    /// `true` once startup wiring completes.
    pub ready: Arc<AtomicBool>,
    pub start_time: Instant,
}

/// Collaborator bundle for [`AppState::with_collaborators`].
pub struct Collaborators {
    pub accounts: Arc<dyn AccountRepository>,
    pub groups: Arc<dyn GroupRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub cache: Arc<dyn GatewayCache>,
    pub billing: Arc<dyn BillingService>,
    pub users: Arc<dyn UserRepository>,
    pub subscriptions: Arc<dyn UserSubscriptionRepository>,
    pub billing_cache: Arc<dyn BillingCacheService>,
    pub usage_log: Arc<dyn UsageLogRepository>,
    pub session_limiter: Arc<dyn SessionLimiter>,
    pub rate_limit: Arc<dyn RateLimitService>,
    pub upstream: Arc<dyn HttpUpstream>,
    pub identity: Arc<dyn IdentityService>,
    pub tokens: Arc<dyn TokenProvider>,
}

impl AppState {
    /// Wire the state from an explicit collaborator set. Production and
    /// tests both come through here.
    pub fn with_collaborators(config: GatewayConfig, c: Collaborators) -> Self {
        let config = Arc::new(config);
        let slots = Arc::new(SlotAllocator::new());
        let touch = Arc::new(TouchQueue::new());

        let scheduler = Arc::new(Scheduler::new(
            c.accounts.clone(),
            c.groups.clone(),
            c.cache.clone(),
            slots.clone(),
            c.billing.clone(),
            c.session_limiter.clone(),
            config.clone(),
        ));

        let recorder = Arc::new(UsageRecorder::new(
            c.billing,
            c.users,
            c.subscriptions,
            c.billing_cache,
            c.usage_log,
            touch.clone(),
            config.clone(),
        ));

        Self {
            config,
            accounts: c.accounts,
            groups: c.groups,
            api_keys: c.api_keys,
            cache: c.cache,
            slots,
            scheduler,
            upstream: c.upstream,
            identity: c.identity,
            tokens: c.tokens,
            rate_limit: c.rate_limit,
            recorder,
            touch,
            ready: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    /// Production wiring: Postgres-backed repositories, in-process sticky
    /// store and session limiter, pooled reqwest upstream.
    pub fn new(pool: PgPool, config: GatewayConfig) -> Self {
        let accounts: Arc<dyn AccountRepository> = Arc::new(PgAccountRepository::new(pool.clone()));
        let rate_limit = Arc::new(AccountHealthService::new(accounts.clone()));

        Self::with_collaborators(
            config,
            Collaborators {
                accounts: accounts.clone(),
                groups: Arc::new(PgGroupRepository::new(pool.clone())),
                api_keys: Arc::new(PgApiKeyRepository::new(pool.clone())),
                cache: Arc::new(InMemorySessionStore::new()),
                billing: Arc::new(PgBillingService::new(pool.clone())),
                users: Arc::new(PgUserRepository::new(pool.clone())),
                subscriptions: Arc::new(PgSubscriptionRepository::new(pool.clone())),
                billing_cache: Arc::new(NoopBillingCache),
                usage_log: Arc::new(PgUsageLogRepository::new(pool)),
                session_limiter: Arc::new(InMemorySessionLimiter::new()),
                rate_limit,
                upstream: Arc::new(ReqwestUpstream::new()),
                identity: Arc::new(StableIdentityService::new()),
                tokens: Arc::new(CachedTokenProvider::new(
                    DirectTokenProvider,
                    std::time::Duration::from_secs(300),
                )),
            },
        )
    }

    /// Test wiring — in-memory everything, no database, no network.
    /// Endpoints that reach the real upstream need a scripted one; see
    /// the integration tests.
    #[doc(hidden)]
    pub fn new_test() -> Self {
        let accounts = Arc::new(InMemoryAccountRepository::new());
        Self::with_collaborators(
            GatewayConfig::default(),
            Collaborators {
                accounts,
                groups: Arc::new(InMemoryGroupRepository::new()),
                api_keys: Arc::new(InMemoryApiKeyRepository::new()),
                cache: Arc::new(InMemorySessionStore::new()),
                billing: Arc::new(FlatBillingService::new()),
                users: Arc::new(InMemoryUserRepository::new()),
                subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
                billing_cache: Arc::new(RecordingBillingCache::new()),
                usage_log: Arc::new(InMemoryUsageLog::new()),
                session_limiter: Arc::new(InMemorySessionLimiter::new()),
                rate_limit: Arc::new(RecordingRateLimitService::new()),
                upstream: Arc::new(ReqwestUpstream::new()),
                identity: Arc::new(StableIdentityService::new()),
                tokens: Arc::new(DirectTokenProvider),
            },
        )
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("gateway marked READY");
    }
}
