//! Post-forward usage accounting.
//!
//! Computes cost from the collected counters, classifies the billing mode,
//! inserts the usage log, updates the ledger (unless simple mode), and
//! queues the deferred last-used touch.

use std::sync::Arc;

use chrono::Utc;

use crate::config::GatewayConfig;
use crate::models::{ClientInfo, ForwardResult, Group};
use crate::services::{
    BillingCacheService, BillingService, BillingType, TouchQueue, UsageLogRepository, UsageRecord,
    UserRepository, UserSubscriptionRepository,
};

pub struct UsageRecorder {
    billing: Arc<dyn BillingService>,
    users: Arc<dyn UserRepository>,
    subscriptions: Arc<dyn UserSubscriptionRepository>,
    billing_cache: Arc<dyn BillingCacheService>,
    usage_log: Arc<dyn UsageLogRepository>,
    touch: Arc<TouchQueue>,
    config: Arc<GatewayConfig>,
}

impl UsageRecorder {
    pub fn new(
        billing: Arc<dyn BillingService>,
        users: Arc<dyn UserRepository>,
        subscriptions: Arc<dyn UserSubscriptionRepository>,
        billing_cache: Arc<dyn BillingCacheService>,
        usage_log: Arc<dyn UsageLogRepository>,
        touch: Arc<TouchQueue>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        Self {
            billing,
            users,
            subscriptions,
            billing_cache,
            usage_log,
            touch,
            config,
        }
    }

    pub async fn record(
        &self,
        client: &ClientInfo,
        group: Option<&Group>,
        account_id: i64,
        result: &ForwardResult,
    ) -> anyhow::Result<()> {
        let mut cost = self.billing.cost_for(&result.model, &result.usage).await?;
        if let (Some(count), Some(bytes)) = (result.usage.image_count, result.usage.image_size_bytes)
            && count > 0
        {
            cost.output_cost += self.billing.image_cost(&result.model, count, bytes).await?;
        }

        let rate_multiplier = group
            .and_then(|g| g.rate_multiplier)
            .unwrap_or(self.config.default_rate_multiplier);
        let total_cost = cost.total();
        let actual_cost = total_cost * rate_multiplier;

        // Subscription billing only applies when the group opts in AND the
        // user actually has an active subscription attached.
        let subscription = match group {
            Some(g) if g.subscription_billing => {
                self.subscriptions.active_subscription(client.user_id).await?
            }
            _ => None,
        };
        let billing_type = match subscription {
            Some(_) => BillingType::Subscription,
            None => BillingType::Balance,
        };

        let record = UsageRecord {
            request_id: result.request_id.clone(),
            user_id: client.user_id,
            api_key_id: client.api_key_id,
            account_id,
            group_id: group.map(|g| g.id),
            model: result.model.clone(),
            usage: result.usage.clone(),
            cost,
            actual_cost,
            rate_multiplier,
            billing_type,
            stream: result.stream,
            duration_ms: result.duration.as_millis() as u64,
            first_token_ms: result.first_token_latency.map(|d| d.as_millis() as u64),
            client_disconnect: result.client_disconnect,
            user_agent: client.user_agent.clone(),
            ip: client.ip.clone(),
            created_at: Utc::now(),
        };
        self.usage_log.insert(&record).await?;

        if !self.config.simple_mode {
            match subscription {
                Some(subscription_id) => {
                    self.subscriptions.add_usage(subscription_id, total_cost).await?;
                    self.billing_cache.refresh_subscription(subscription_id).await;
                }
                None => {
                    self.users.deduct_balance(client.user_id, actual_cost).await?;
                    self.billing_cache.invalidate_user(client.user_id).await;
                }
            }
        }

        self.touch.push(account_id).await;

        tracing::debug!(
            request_id = %record.request_id,
            account_id,
            model = %record.model,
            total_tokens = record.usage.total_tokens(),
            actual_cost,
            billing = record.billing_type.as_str(),
            "usage recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{
        FlatBillingService, InMemorySubscriptionRepository, InMemoryUsageLog,
        InMemoryUserRepository, RecordingBillingCache,
    };
    use crate::models::{Platform, UsageCounters};
    use std::time::Duration;

    struct Fixture {
        users: Arc<InMemoryUserRepository>,
        subscriptions: Arc<InMemorySubscriptionRepository>,
        cache: Arc<RecordingBillingCache>,
        log: Arc<InMemoryUsageLog>,
        touch: Arc<TouchQueue>,
        recorder: UsageRecorder,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let users = Arc::new(InMemoryUserRepository::new());
        let subscriptions = Arc::new(InMemorySubscriptionRepository::new());
        let cache = Arc::new(RecordingBillingCache::new());
        let log = Arc::new(InMemoryUsageLog::new());
        let touch = Arc::new(TouchQueue::new());
        let recorder = UsageRecorder::new(
            Arc::new(FlatBillingService::new()),
            users.clone(),
            subscriptions.clone(),
            cache.clone(),
            log.clone(),
            touch.clone(),
            Arc::new(config),
        );
        Fixture {
            users,
            subscriptions,
            cache,
            log,
            touch,
            recorder,
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            api_key_id: 3,
            user_id: 42,
            group_id: Some(10),
            is_claude_code: false,
            user_agent: Some("test-agent".into()),
            ip: Some("10.0.0.9".into()),
        }
    }

    fn group(subscription_billing: bool) -> Group {
        Group {
            id: 10,
            name: "g".into(),
            platform: Platform::Anthropic,
            fallback_group_id: None,
            claude_code_only: false,
            routing_enabled: false,
            model_routing: Vec::new(),
            subscription_billing,
            rate_multiplier: Some(2.0),
        }
    }

    fn result() -> ForwardResult {
        ForwardResult {
            request_id: "req-1".into(),
            usage: UsageCounters {
                input_tokens: 1_000_000,
                output_tokens: 1_000_000,
                cache_creation_tokens: 0,
                cache_read_tokens: 0,
                image_count: None,
                image_size_bytes: None,
            },
            model: "claude-sonnet-4-5".into(),
            stream: true,
            duration: Duration::from_millis(1500),
            first_token_latency: Some(Duration::from_millis(120)),
            client_disconnect: false,
        }
    }

    #[tokio::test]
    async fn balance_mode_deducts_and_invalidates() {
        let fx = fixture(GatewayConfig::default());
        let g = group(false);
        fx.recorder
            .record(&client(), Some(&g), 7, &result())
            .await
            .unwrap();

        assert_eq!(fx.log.len(), 1);
        let record = fx.log.records.lock().unwrap()[0].clone();
        // 1 MTok in ($3) + 1 MTok out ($15) at 2.0x multiplier.
        assert!((record.actual_cost - 36.0).abs() < 1e-9);
        assert_eq!(record.billing_type, BillingType::Balance);
        assert_eq!(record.first_token_ms, Some(120));

        assert!((*fx.users.balances.get(&42).unwrap() + 36.0).abs() < 1e-9);
        assert_eq!(*fx.cache.invalidated_users.lock().unwrap(), vec![42]);
        assert_eq!(fx.touch.drain().await, vec![7]);
    }

    #[tokio::test]
    async fn subscription_mode_increments_usage() {
        let fx = fixture(GatewayConfig::default());
        fx.subscriptions.subscriptions.insert(42, 900);
        let g = group(true);
        fx.recorder
            .record(&client(), Some(&g), 7, &result())
            .await
            .unwrap();

        let record = fx.log.records.lock().unwrap()[0].clone();
        assert_eq!(record.billing_type, BillingType::Subscription);
        // Subscriptions accrue the unmultiplied total cost.
        assert!((*fx.subscriptions.usage.get(&900).unwrap() - 18.0).abs() < 1e-9);
        assert_eq!(*fx.cache.refreshed_subscriptions.lock().unwrap(), vec![900]);
        assert!(fx.users.balances.get(&42).is_none());
    }

    #[tokio::test]
    async fn subscription_group_without_subscription_falls_back_to_balance() {
        let fx = fixture(GatewayConfig::default());
        let g = group(true);
        fx.recorder
            .record(&client(), Some(&g), 7, &result())
            .await
            .unwrap();
        let record = fx.log.records.lock().unwrap()[0].clone();
        assert_eq!(record.billing_type, BillingType::Balance);
        assert!(fx.users.balances.get(&42).is_some());
    }

    #[tokio::test]
    async fn simple_mode_logs_without_ledger_updates() {
        let mut config = GatewayConfig::default();
        config.simple_mode = true;
        let fx = fixture(config);
        let g = group(false);
        fx.recorder
            .record(&client(), Some(&g), 7, &result())
            .await
            .unwrap();

        assert_eq!(fx.log.len(), 1);
        assert!(fx.users.balances.get(&42).is_none());
        assert!(fx.cache.invalidated_users.lock().unwrap().is_empty());
        // The last-used touch still queues.
        assert_eq!(fx.touch.drain().await, vec![7]);
    }
}
