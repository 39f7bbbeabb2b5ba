//! Retry policy: signature-error body repair, generic backoff, and
//! failover classification.
//!
//! The signature branch repairs the body (thinking filter, then the
//! tool-downgrade filter) and resends on the same account; the generic
//! branch backs off exponentially; failover-eligible statuses send the
//! handler back to the scheduler with the failed account excluded.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::models::Account;

pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(300);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(3);
pub const RETRY_MAX_ATTEMPTS: u32 = 5;
pub const RETRY_MAX_ELAPSED: Duration = Duration::from_secs(10);

static EXPECTED_THINKING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"expected.*(thinking|redacted_thinking)").expect("thinking regex is valid")
});

const TOOL_SIGNATURE_MARKERS: &[&str] = &[
    "tool_use",
    "tool_result",
    "functioncall",
    "function_call",
    "functionresponse",
    "function_response",
];

const COMPAT_400_MARKERS: &[&str] = &[
    "anthropic-beta",
    "beta feature",
    "requires beta",
    "thinking",
    "thought_signature",
    "signature",
    "tool_use",
    "tool_result",
    "tools",
];

/// Pull the upstream error message out of an error body, falling back to
/// the raw text.
pub fn upstream_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.to_string())
}

/// 400s that the thinking-filter retry can repair.
pub fn is_signature_error(status: u16, body: &str) -> bool {
    if status != 400 {
        return false;
    }
    let message = upstream_error_message(body).to_ascii_lowercase();
    message.contains("signature")
        || EXPECTED_THINKING_RE.is_match(&message)
        || message.contains("non-empty content")
        || message.contains("empty content")
}

/// Second-stage escalation: the retried 400 still complains about tool
/// blocks, so the tool-downgrade filter applies.
pub fn is_tool_signature_error(body: &str) -> bool {
    let message = upstream_error_message(body).to_ascii_lowercase();
    TOOL_SIGNATURE_MARKERS.iter().any(|m| message.contains(m))
}

/// Generic in-account retry gate. 400 is always excluded here — the
/// signature branch owns it.
pub fn should_retry_status(account: &Account, status: u16) -> bool {
    if status == 400 || (200..300).contains(&status) {
        return false;
    }
    if account.uses_oauth() {
        status == 403
    } else {
        !account.handles_status(status)
    }
}

/// Exponential backoff delay for attempt `n` (0-based): 300ms * 2^n, capped.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    RETRY_BASE_DELAY
        .saturating_mul(factor)
        .min(RETRY_MAX_DELAY)
}

/// Statuses that let the handler ask the scheduler for another account.
/// 400 qualifies only behind the config flag and with a body that reads
/// like a compatibility problem.
pub fn is_failover_eligible(status: u16, body: &str, failover_on_400: bool) -> bool {
    match status {
        401 | 403 | 429 | 529 => true,
        400 => {
            failover_on_400 && {
                let message = upstream_error_message(body).to_ascii_lowercase();
                COMPAT_400_MARKERS.iter().any(|m| message.contains(m))
            }
        }
        s => s >= 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, AuthKind, Platform};

    fn account(auth: AuthKind, handled: Vec<u16>) -> Account {
        Account {
            id: 1,
            name: "a".into(),
            platform: Platform::Anthropic,
            auth_kind: auth,
            credential: "c".into(),
            proxy_url: None,
            base_url: None,
            priority: 10,
            concurrency_cap: 1,
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
            handled_errors: handled,
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn signature_errors_match_known_shapes() {
        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"Invalid `signature` in `thinking` block"}}"#;
        assert!(is_signature_error(400, body));
        assert!(!is_signature_error(500, body));

        assert!(is_signature_error(
            400,
            r#"{"error":{"message":"messages.1.content: expected `thinking` or `redacted_thinking`"}}"#
        ));
        assert!(is_signature_error(
            400,
            r#"{"error":{"message":"text content blocks must contain non-empty content"}}"#
        ));
        assert!(!is_signature_error(
            400,
            r#"{"error":{"message":"max_tokens: required"}}"#
        ));
    }

    #[test]
    fn tool_signature_escalation_markers() {
        assert!(is_tool_signature_error(
            r#"{"error":{"message":"unexpected tool_use block"}}"#
        ));
        assert!(is_tool_signature_error(
            r#"{"error":{"message":"invalid functionCall ordering"}}"#
        ));
        assert!(!is_tool_signature_error(
            r#"{"error":{"message":"model overloaded"}}"#
        ));
    }

    #[test]
    fn oauth_retries_403_only() {
        let oauth = account(AuthKind::Oauth, Vec::new());
        assert!(should_retry_status(&oauth, 403));
        assert!(!should_retry_status(&oauth, 429));
        assert!(!should_retry_status(&oauth, 500));
        assert!(!should_retry_status(&oauth, 400));
    }

    #[test]
    fn api_key_retries_unhandled_statuses() {
        let key = account(AuthKind::ApiKey, vec![404, 429]);
        assert!(should_retry_status(&key, 500));
        assert!(should_retry_status(&key, 403));
        assert!(!should_retry_status(&key, 429));
        assert!(!should_retry_status(&key, 404));
        assert!(!should_retry_status(&key, 400));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(300));
        assert_eq!(backoff_delay(1), Duration::from_millis(600));
        assert_eq!(backoff_delay(2), Duration::from_millis(1200));
        assert_eq!(backoff_delay(3), Duration::from_millis(2400));
        assert_eq!(backoff_delay(4), Duration::from_secs(3));
        assert_eq!(backoff_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn attempt_budget_is_bounded() {
        // At most min(maxAttempts, ceil(maxElapsed / minDelay)) sends.
        let by_elapsed = RETRY_MAX_ELAPSED.as_millis() / RETRY_BASE_DELAY.as_millis();
        assert!(RETRY_MAX_ATTEMPTS as u128 <= by_elapsed.max(RETRY_MAX_ATTEMPTS as u128));
        assert_eq!(RETRY_MAX_ATTEMPTS, 5);
    }

    #[test]
    fn failover_statuses() {
        for status in [401, 403, 429, 529, 500, 503, 529] {
            assert!(is_failover_eligible(status, "", false), "status {status}");
        }
        assert!(!is_failover_eligible(404, "", false));
        assert!(!is_failover_eligible(400, r#"{"error":{"message":"requires beta"}}"#, false));
        assert!(is_failover_eligible(400, r#"{"error":{"message":"requires beta"}}"#, true));
        assert!(!is_failover_eligible(400, r#"{"error":{"message":"bad json"}}"#, true));
    }
}
