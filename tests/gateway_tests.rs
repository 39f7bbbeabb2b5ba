//! End-to-end forward tests against a scripted upstream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use serde_json::Value;

use sub2api_gateway::config::GatewayConfig;
use sub2api_gateway::gateway::{self, ForwardOptions};
use sub2api_gateway::identity::StableIdentityService;
use sub2api_gateway::memory::{
    FlatBillingService, InMemoryAccountRepository, InMemoryApiKeyRepository,
    InMemoryGroupRepository, InMemorySessionLimiter, InMemorySubscriptionRepository,
    InMemoryUsageLog, InMemoryUserRepository, RecordingBillingCache, RecordingRateLimitService,
    ScriptedResponse, ScriptedUpstream,
};
use sub2api_gateway::models::{
    Account, AccountStatus, AuthKind, ClientInfo, Group, Platform,
};
use sub2api_gateway::services::DirectTokenProvider;
use sub2api_gateway::state::{AppState, Collaborators};
use sub2api_gateway::sticky::InMemorySessionStore;

struct TestEnv {
    state: AppState,
    accounts: Arc<InMemoryAccountRepository>,
    groups: Arc<InMemoryGroupRepository>,
    upstream: Arc<ScriptedUpstream>,
    usage_log: Arc<InMemoryUsageLog>,
    rate_limit: Arc<RecordingRateLimitService>,
}

fn env() -> TestEnv {
    let accounts = Arc::new(InMemoryAccountRepository::new());
    let groups = Arc::new(InMemoryGroupRepository::new());
    let upstream = Arc::new(ScriptedUpstream::new());
    let usage_log = Arc::new(InMemoryUsageLog::new());
    let rate_limit = Arc::new(RecordingRateLimitService::new());

    let state = AppState::with_collaborators(
        GatewayConfig::default(),
        Collaborators {
            accounts: accounts.clone(),
            groups: groups.clone(),
            api_keys: Arc::new(InMemoryApiKeyRepository::new()),
            cache: Arc::new(InMemorySessionStore::new()),
            billing: Arc::new(FlatBillingService::new()),
            users: Arc::new(InMemoryUserRepository::new()),
            subscriptions: Arc::new(InMemorySubscriptionRepository::new()),
            billing_cache: Arc::new(RecordingBillingCache::new()),
            usage_log: usage_log.clone(),
            session_limiter: Arc::new(InMemorySessionLimiter::new()),
            rate_limit: rate_limit.clone(),
            upstream: upstream.clone(),
            identity: Arc::new(StableIdentityService::new()),
            tokens: Arc::new(DirectTokenProvider),
        },
    );

    TestEnv {
        state,
        accounts,
        groups,
        upstream,
        usage_log,
        rate_limit,
    }
}

fn account(id: i64, auth: AuthKind) -> Account {
    Account {
        id,
        name: format!("acct-{id}"),
        platform: Platform::Anthropic,
        auth_kind: auth,
        credential: "tok-secret".into(),
        proxy_url: None,
        base_url: None,
        priority: id as i32,
        concurrency_cap: 4,
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
        handled_errors: Vec::new(),
        extra: Value::Null,
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

fn client(group_id: Option<i64>) -> ClientInfo {
    ClientInfo {
        api_key_id: 1,
        user_id: 42,
        group_id,
        is_claude_code: false,
        user_agent: Some("opencode/0.3.1".into()),
        ip: None,
    }
}

const SUCCESS_JSON: &str = r#"{"id":"msg_1","type":"message","model":"claude-sonnet-4-5",
    "content":[{"type":"text","text":"hello"}],
    "usage":{"input_tokens":10,"output_tokens":5,"cache_creation_input_tokens":0,"cache_read_input_tokens":0}}"#;

fn nonstream_body() -> axum::body::Bytes {
    axum::body::Bytes::from_static(
        br#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
    )
}

// ═══════════════════════════════════════════════════════════════════════
//  Non-streaming passthrough
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn nonstream_success_records_usage_and_releases_slot() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::new(200, SUCCESS_JSON));

    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        nonstream_body(),
        ForwardOptions::messages(),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["content"][0]["text"], "hello");

    assert_eq!(env.usage_log.len(), 1);
    let record = env.usage_log.records.lock().unwrap()[0].clone();
    assert_eq!(record.usage.input_tokens, 10);
    assert_eq!(record.usage.output_tokens, 5);
    assert_eq!(record.account_id, 1);
    assert!(!record.stream);

    // Successful responses feed the session-window tracker.
    assert!(env.rate_limit.window_updates.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    // No slot leak.
    assert_eq!(env.state.slots.in_use_count(1), 0);
}

#[tokio::test]
async fn mimic_request_carries_banner_bearer_and_betas() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::new(200, SUCCESS_JSON));

    gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        nonstream_body(),
        ForwardOptions::messages(),
    )
    .await
    .unwrap();

    let sent = env.upstream.requests.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].url, "https://api.anthropic.com/v1/messages?beta=true");
    assert_eq!(sent[0].headers["authorization"], "Bearer tok-secret");
    let betas = sent[0].headers["anthropic-beta"].to_str().unwrap();
    assert!(betas.contains("oauth-2025-04-20"));

    let body: Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(
        body["system"][0]["text"],
        "You are Claude Code, Anthropic's official CLI for Claude."
    );
    // Metadata was stamped with a stable synthetic identity.
    let user_id = body["metadata"]["user_id"].as_str().unwrap();
    assert!(user_id.starts_with("user_"));
    assert!(user_id.contains("_session_"));
}

#[tokio::test]
async fn count_tokens_is_not_billed() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream
        .push(ScriptedResponse::new(200, r#"{"input_tokens":128}"#));

    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        nonstream_body(),
        ForwardOptions::count_tokens(),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    let sent = env.upstream.requests.lock().unwrap();
    assert_eq!(
        sent[0].url,
        "https://api.anthropic.com/v1/messages/count_tokens?beta=true"
    );
    drop(sent);
    assert!(env.usage_log.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  S3 — thinking signature retry
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn signature_400_retries_with_thinking_filtered() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::new(
        400,
        r#"{"type":"error","error":{"type":"invalid_request_error","message":"Invalid `signature` in `thinking` block"}}"#,
    ));
    env.upstream.push(ScriptedResponse::new(200, SUCCESS_JSON));

    let body = axum::body::Bytes::from_static(
        br#"{"model":"claude-sonnet-4-5","messages":[
            {"role":"assistant","content":[
                {"type":"thinking","thinking":"...","signature":"sig"},
                {"type":"text","text":"previous answer"}]},
            {"role":"user","content":"continue"}]}"#,
    );

    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        body,
        ForwardOptions::messages(),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    let sent = env.upstream.requests.lock().unwrap();
    assert_eq!(sent.len(), 2, "exactly one repair retry");

    let first: Value = serde_json::from_slice(&sent[0].body).unwrap();
    let first_types: Vec<&str> = first["messages"][0]["content"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["type"].as_str().unwrap())
        .collect();
    assert!(first_types.contains(&"thinking"));

    let second: Value = serde_json::from_slice(&sent[1].body).unwrap();
    let second_types: Vec<&str> = second["messages"][0]["content"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["type"].as_str().unwrap())
        .collect();
    assert!(!second_types.contains(&"thinking"));
    drop(sent);

    // Usage came from the retry response.
    assert_eq!(env.usage_log.len(), 1);
    let record = env.usage_log.records.lock().unwrap()[0].clone();
    assert_eq!(record.usage.input_tokens, 10);
}

// ═══════════════════════════════════════════════════════════════════════
//  S6 — failover on 529
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failover_on_529_tries_second_account() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.accounts.insert(account(2, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::new(
        529,
        r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
    ));
    env.upstream.push(ScriptedResponse::new(200, SUCCESS_JSON));

    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        nonstream_body(),
        ForwardOptions::messages(),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);

    // Rate-limit collaborator saw the 529 on account 1.
    assert_eq!(
        *env.rate_limit.upstream_errors.lock().unwrap(),
        vec![(1, 529)]
    );
    // Usage was recorded against the account that actually served.
    let record = env.usage_log.records.lock().unwrap()[0].clone();
    assert_eq!(record.account_id, 2);
    // Both slots released.
    assert_eq!(env.state.slots.in_use_count(1), 0);
    assert_eq!(env.state.slots.in_use_count(2), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  Property: bounded retry budget
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn generic_retry_issues_at_most_five_requests() {
    let env = env();
    env.groups.insert(group(10));
    // API-key account with an empty handled set retries 5xx.
    env.accounts.insert(account(1, AuthKind::ApiKey), &[10]);
    for _ in 0..5 {
        env.upstream.push(ScriptedResponse::new(
            500,
            r#"{"type":"error","error":{"type":"api_error","message":"boom"}}"#,
        ));
    }

    let err = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        nonstream_body(),
        ForwardOptions::messages(),
    )
    .await
    .unwrap_err();

    // 5 attempts on the only account, then failover finds nothing.
    assert_eq!(env.upstream.request_count(), 5);
    assert!(matches!(
        err,
        sub2api_gateway::error::GatewayError::NoAccountAvailable { .. }
    ));
    assert_eq!(env.state.slots.in_use_count(1), 0);
}

// ═══════════════════════════════════════════════════════════════════════
//  S4 — client disconnect mid-stream
// ═══════════════════════════════════════════════════════════════════════

const STREAM_BODY: &str = "\
event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"a\"}}\n\
\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"b\"}}\n\
\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":12}}\n\
\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\
\n";

#[tokio::test]
async fn client_disconnect_still_drains_and_bills() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::sse(STREAM_BODY));

    let body = axum::body::Bytes::from_static(
        br#"{"model":"claude-sonnet-4-5","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
    );
    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        body,
        ForwardOptions::messages(),
    )
    .await
    .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");

    // Drop the response before the relay task ever runs: every client
    // write fails, but the upstream must still be drained for billing.
    drop(resp);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while env.usage_log.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "usage never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = env.usage_log.records.lock().unwrap()[0].clone();
    assert!(record.client_disconnect);
    assert!(record.stream);
    // Full usage despite the disconnect: 1 (start) + 12 (delta).
    assert_eq!(record.usage.output_tokens, 13);
    assert_eq!(record.usage.input_tokens, 25);
    // No slot leak.
    assert_eq!(env.state.slots.in_use_count(1), 0);
}

#[tokio::test]
async fn streaming_success_delivers_frames_in_order() {
    let env = env();
    env.groups.insert(group(10));
    env.accounts.insert(account(1, AuthKind::Oauth), &[10]);
    env.upstream.push(ScriptedResponse::sse(STREAM_BODY));

    let body = axum::body::Bytes::from_static(
        br#"{"model":"claude-sonnet-4-5","stream":true,"messages":[{"role":"user","content":"hi"}]}"#,
    );
    let resp = gateway::forward(
        env.state.clone(),
        client(Some(10)),
        HeaderMap::new(),
        body,
        ForwardOptions::messages(),
    )
    .await
    .unwrap();

    let mut stream = resp.into_body().into_data_stream();
    let mut collected = String::new();
    while let Some(chunk) = stream.next().await {
        collected.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
    }

    let start = collected.find("message_start").unwrap();
    let delta = collected.find("message_delta").unwrap();
    let stop = collected.find("message_stop").unwrap();
    assert!(start < delta && delta < stop);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while env.usage_log.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "usage never recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let record = env.usage_log.records.lock().unwrap()[0].clone();
    assert!(!record.client_disconnect);
    assert_eq!(record.usage.output_tokens, 13);
}
