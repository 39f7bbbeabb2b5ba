//! Default account-health reactions to upstream failures.
//!
//! 429s (and 529s) temporarily unschedule the account, honoring a
//! `retry-after` header when present; repeated auth failures flip the
//! account to error status.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use http::HeaderMap;

use crate::models::Account;
use crate::services::{AccountRepository, RateLimitService};

const DEFAULT_BACKOFF_SECS: i64 = 60;
const STREAM_TIMEOUT_BACKOFF_SECS: i64 = 30;
const AUTH_FAILURE_THRESHOLD: u32 = 3;

pub struct AccountHealthService {
    accounts: Arc<dyn AccountRepository>,
    auth_failures: DashMap<i64, u32>,
}

impl AccountHealthService {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self {
            accounts,
            auth_failures: DashMap::new(),
        }
    }

    fn retry_after_secs(headers: &HeaderMap) -> i64 {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_BACKOFF_SECS)
    }

    async fn unschedule_for(&self, account: &Account, secs: i64, reason: &str) {
        let until = Utc::now() + chrono::Duration::seconds(secs);
        if let Err(e) = self.accounts.set_unschedulable_until(account.id, until).await {
            tracing::warn!(account_id = account.id, error = %e, "failed to unschedule account");
        } else {
            tracing::info!(account_id = account.id, secs, reason, "account temporarily unscheduled");
        }
    }
}

#[async_trait]
impl RateLimitService for AccountHealthService {
    async fn handle_upstream_error(
        &self,
        account: &Account,
        status: u16,
        headers: &HeaderMap,
        _body: &str,
    ) -> bool {
        match status {
            429 | 529 => {
                self.unschedule_for(account, Self::retry_after_secs(headers), "rate limited")
                    .await;
                false
            }
            401 | 403 => {
                let failures = {
                    let mut entry = self.auth_failures.entry(account.id).or_insert(0);
                    *entry += 1;
                    *entry
                };
                if failures >= AUTH_FAILURE_THRESHOLD {
                    self.auth_failures.remove(&account.id);
                    if let Err(e) = self.accounts.mark_error(account.id).await {
                        tracing::warn!(account_id = account.id, error = %e, "failed to mark account error");
                    } else {
                        tracing::warn!(
                            account_id = account.id,
                            failures,
                            "repeated auth failures, account marked error"
                        );
                    }
                    return true;
                }
                self.unschedule_for(account, DEFAULT_BACKOFF_SECS, "auth failure").await;
                false
            }
            s if s >= 500 => {
                self.unschedule_for(account, DEFAULT_BACKOFF_SECS, "server error").await;
                false
            }
            _ => false,
        }
    }

    async fn update_session_window(&self, account: &Account, _headers: &HeaderMap) {
        // A successful response clears the auth-failure streak.
        self.auth_failures.remove(&account.id);
    }

    async fn handle_stream_timeout(&self, account: &Account, model: &str) {
        tracing::warn!(account_id = account.id, model, "upstream stream timeout");
        self.unschedule_for(account, STREAM_TIMEOUT_BACKOFF_SECS, "stream timeout")
            .await;
    }
}
