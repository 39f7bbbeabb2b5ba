//! Per-account request identities for the OAuth path.
//!
//! Each OAuth account carries a stable client id and a browser-like header
//! set; the same account always presents the same identity upstream.

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::models::Account;
use crate::transform::{account_uuid, session_suffix};

#[derive(Debug, Clone)]
pub struct Fingerprint {
    /// Stable per-account client id woven into `metadata.user_id`.
    pub client_id: String,
    /// Headers applied after the allowlist pass — they override whatever
    /// the client supplied.
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Get-or-create the fingerprint for an account.
    async fn fingerprint(&self, account: &Account) -> Fingerprint;
}

/// Default implementation: the client id is derived from the account id, so
/// restarts keep identities stable without any storage.
#[derive(Default)]
pub struct StableIdentityService {
    cache: DashMap<i64, Fingerprint>,
}

impl StableIdentityService {
    pub fn new() -> Self {
        Self::default()
    }
}

const CLI_USER_AGENT: &str = "claude-cli/1.0.119 (external, cli)";

fn build_fingerprint(account: &Account) -> Fingerprint {
    let digest = Sha256::digest(format!("client::{}", account.id).as_bytes());
    let client_id = hex::encode(&digest[..8]);

    let headers = vec![
        (
            HeaderName::from_static("user-agent"),
            HeaderValue::from_static(CLI_USER_AGENT),
        ),
        (HeaderName::from_static("x-app"), HeaderValue::from_static("cli")),
        (
            HeaderName::from_static("anthropic-dangerous-direct-browser-access"),
            HeaderValue::from_static("true"),
        ),
        (
            HeaderName::from_static("sec-fetch-mode"),
            HeaderValue::from_static("cors"),
        ),
        (
            HeaderName::from_static("accept-language"),
            HeaderValue::from_static("en-US,*"),
        ),
    ];

    Fingerprint { client_id, headers }
}

#[async_trait]
impl IdentityService for StableIdentityService {
    async fn fingerprint(&self, account: &Account) -> Fingerprint {
        self.cache
            .entry(account.id)
            .or_insert_with(|| build_fingerprint(account))
            .clone()
    }
}

/// Rewrite `metadata.user_id` so the outbound body carries this account's
/// client id and account UUID while preserving the session suffix.
pub fn weave_user_id(body: &mut Value, account: &Account, fingerprint: &Fingerprint) {
    let Some(user_id) = body.pointer("/metadata/user_id").and_then(|v| v.as_str()) else {
        return;
    };
    let Some(session) = session_suffix(user_id) else {
        return;
    };
    let woven = format!(
        "user_{}_account_{}_session_{session}",
        fingerprint.client_id,
        account_uuid(account)
    );
    body["metadata"]["user_id"] = json!(woven);
}

/// Apply fingerprint headers on top of the allowlisted set.
pub fn apply_fingerprint_headers(headers: &mut HeaderMap, fingerprint: &Fingerprint) {
    for (name, value) in &fingerprint.headers {
        headers.insert(name.clone(), value.clone());
    }
}
