use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Platform / auth enums ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    Openai,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::Openai => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::Openai),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Oauth,
    SetupToken,
    ApiKey,
}

impl AuthKind {
    pub fn parse(s: &str) -> Option<AuthKind> {
        match s {
            "oauth" => Some(AuthKind::Oauth),
            "setup_token" | "setup-token" => Some(AuthKind::SetupToken),
            "api_key" | "api-key" => Some(AuthKind::ApiKey),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Ok,
    Error,
    Disabled,
}

// ── Account ─────────────────────────────────────────────────────────────

/// A credentialed upstream identity. Read-mostly: mutation goes through the
/// account repository (status flips, batched last-used touches).
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub auth_kind: AuthKind,
    /// Decrypted credential — an OAuth access token or an API key.
    /// At most one live credential per account.
    pub credential: String,
    pub proxy_url: Option<String>,
    pub base_url: Option<String>,
    /// Lower = preferred.
    pub priority: i32,
    /// Concurrent in-flight requests admitted for this account. Always >= 1.
    pub concurrency_cap: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub schedulable: bool,
    pub unschedulable_until: Option<DateTime<Utc>>,
    pub status: AccountStatus,
    /// Requested model -> upstream model, applied for API-key accounts.
    pub model_mapping: HashMap<String, String>,
    /// Glob patterns of models this account may serve. Empty = all models.
    pub supported_models: Vec<String>,
    pub rate_multiplier: f64,
    /// Standard-cost cap for the rolling 5-hour window. None/<=0 disables.
    pub window_cost_limit: Option<f64>,
    /// Concurrent sticky sessions admitted. None/<=0 disables the gate.
    pub max_sessions: Option<u32>,
    pub session_idle_timeout: Duration,
    /// Antigravity accounts opt into anthropic/gemini candidate pools.
    pub mixed_scheduling: bool,
    pub tls_fingerprint: bool,
    /// Upstream statuses this API-key account handles itself (no retry).
    pub handled_errors: Vec<u16>,
    /// Platform-specific extras: `project_id`, `chatgpt_account_id`, ...
    pub extra: Value,
}

impl Account {
    /// OAuth and setup-token credentials share the bearer-auth path.
    pub fn uses_oauth(&self) -> bool {
        matches!(self.auth_kind, AuthKind::Oauth | AuthKind::SetupToken)
    }

    /// Re-checked at selection time — repository caches may be stale.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        if self.status != AccountStatus::Ok || !self.schedulable {
            return false;
        }
        match self.unschedulable_until {
            Some(until) => now >= until,
            None => true,
        }
    }

    /// Model-scope check. An empty scope allows every model.
    pub fn supports_model(&self, model: &str) -> bool {
        if self.supported_models.is_empty() {
            return true;
        }
        self.supported_models.iter().any(|pat| {
            glob::Pattern::new(pat)
                .map(|p| p.matches(model))
                .unwrap_or(pat.as_str() == model)
        })
    }

    /// The model name actually sent upstream. Mapping applies to API-key
    /// accounts only; OAuth requests keep the client's model.
    pub fn mapped_model(&self, model: &str) -> String {
        if self.auth_kind == AuthKind::ApiKey
            && let Some(mapped) = self.model_mapping.get(model)
        {
            return mapped.clone();
        }
        model.to_string()
    }

    pub fn chatgpt_account_id(&self) -> Option<&str> {
        self.extra.get("chatgpt_account_id").and_then(|v| v.as_str())
    }

    pub fn gemini_project_id(&self) -> Option<&str> {
        self.extra.get("project_id").and_then(|v| v.as_str())
    }

    pub fn handles_status(&self, status: u16) -> bool {
        self.handled_errors.contains(&status)
    }
}

// ── Group ───────────────────────────────────────────────────────────────

/// One glob rule of a group's model-routing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub pattern: String,
    pub account_ids: Vec<i64>,
}

/// A named bundle of accounts exposed through one set of gateway API keys.
#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    pub fallback_group_id: Option<i64>,
    pub claude_code_only: bool,
    pub routing_enabled: bool,
    pub model_routing: Vec<ModelRoute>,
    /// Group bills against an attached subscription instead of balance.
    pub subscription_billing: bool,
    pub rate_multiplier: Option<f64>,
}

impl Group {
    /// First routing rule whose glob matches the requested model.
    pub fn route_for(&self, model: &str) -> Option<&ModelRoute> {
        if !self.routing_enabled {
            return None;
        }
        self.model_routing.iter().find(|r| {
            glob::Pattern::new(&r.pattern)
                .map(|p| p.matches(model))
                .unwrap_or(r.pattern == model)
        })
    }
}

// ── Usage / forward result ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size_bytes: Option<u64>,
}

impl UsageCounters {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Outcome of one forwarded request, handed to the usage recorder.
#[derive(Debug, Clone)]
pub struct ForwardResult {
    pub request_id: String,
    pub usage: UsageCounters,
    /// The model the client asked for (after any mapping was undone).
    pub model: String,
    pub stream: bool,
    pub duration: Duration,
    pub first_token_latency: Option<Duration>,
    pub client_disconnect: bool,
}

// ── Client identity (resolved by the auth middleware) ───────────────────

/// The authenticated caller of one request.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub api_key_id: i64,
    pub user_id: i64,
    pub group_id: Option<i64>,
    /// `user-agent` starts with `claude-cli` — drives mimic-mode decisions.
    pub is_claude_code: bool,
    pub user_agent: Option<String>,
    pub ip: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account {
            id: 1,
            name: "a1".into(),
            platform: Platform::Anthropic,
            auth_kind: AuthKind::ApiKey,
            credential: "sk-test".into(),
            proxy_url: None,
            base_url: None,
            priority: 10,
            concurrency_cap: 3,
            last_used_at: None,
            schedulable: true,
            unschedulable_until: None,
            status: AccountStatus::Ok,
            model_mapping: HashMap::new(),
            supported_models: Vec::new(),
            rate_multiplier: 1.0,
            window_cost_limit: None,
            max_sessions: None,
            session_idle_timeout: Duration::from_secs(3600),
            mixed_scheduling: false,
            tls_fingerprint: false,
            handled_errors: vec![400, 404],
            extra: Value::Null,
        }
    }

    #[test]
    fn schedulable_respects_status_and_deadline() {
        let now = Utc::now();
        let mut a = account();
        assert!(a.is_schedulable(now));

        a.status = AccountStatus::Error;
        assert!(!a.is_schedulable(now));

        a.status = AccountStatus::Ok;
        a.schedulable = false;
        assert!(!a.is_schedulable(now));

        a.schedulable = true;
        a.unschedulable_until = Some(now + chrono::Duration::seconds(60));
        assert!(!a.is_schedulable(now));

        a.unschedulable_until = Some(now - chrono::Duration::seconds(1));
        assert!(a.is_schedulable(now));
    }

    #[test]
    fn model_scope_globs() {
        let mut a = account();
        assert!(a.supports_model("claude-sonnet-4-5"));

        a.supported_models = vec!["claude-opus-*".into()];
        assert!(a.supports_model("claude-opus-4-5"));
        assert!(!a.supports_model("claude-sonnet-4-5"));
    }

    #[test]
    fn mapping_applies_to_api_key_only() {
        let mut a = account();
        a.model_mapping
            .insert("claude-sonnet-4-5".into(), "gpt-proxy-sonnet".into());
        assert_eq!(a.mapped_model("claude-sonnet-4-5"), "gpt-proxy-sonnet");

        a.auth_kind = AuthKind::Oauth;
        assert_eq!(a.mapped_model("claude-sonnet-4-5"), "claude-sonnet-4-5");
    }

    #[test]
    fn group_routing_matches_glob() {
        let g = Group {
            id: 10,
            name: "main".into(),
            platform: Platform::Anthropic,
            fallback_group_id: None,
            claude_code_only: false,
            routing_enabled: true,
            model_routing: vec![ModelRoute {
                pattern: "claude-opus-*".into(),
                account_ids: vec![3, 4],
            }],
            subscription_billing: false,
            rate_multiplier: None,
        };
        assert_eq!(
            g.route_for("claude-opus-4-5").map(|r| r.account_ids.clone()),
            Some(vec![3, 4])
        );
        assert!(g.route_for("claude-sonnet-4-5").is_none());
    }
}
