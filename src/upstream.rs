//! Outbound request construction and the pooled HTTP upstream.
//!
//! The builder composes the target URL per platform/auth-kind, filters
//! client headers through a fixed allowlist, negotiates anthropic-beta
//! values, and applies the account fingerprint last so it overrides
//! client-supplied identity headers.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use http::header::{ACCEPT, CONTENT_TYPE, HOST};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::json;
use url::Url;

use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::identity::{Fingerprint, apply_fingerprint_headers};
use crate::models::{Account, Platform};

// ── Fixed upstream endpoints ────────────────────────────────────────────

const ANTHROPIC_OAUTH_MESSAGES: &str = "https://api.anthropic.com/v1/messages?beta=true";
const ANTHROPIC_OAUTH_COUNT_TOKENS: &str =
    "https://api.anthropic.com/v1/messages/count_tokens?beta=true";
const ANTHROPIC_DEFAULT_BASE: &str = "https://api.anthropic.com";
const CHATGPT_RESPONSES: &str = "https://chatgpt.com/backend-api/codex/responses";
const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
const CODE_ASSIST_BASE: &str = "https://cloudcode-pa.googleapis.com";

pub const OAUTH_BETA: &str = "oauth-2025-04-20";
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";
const CLAUDE_CODE_BETA: &str = "claude-code-20250219";
const TOOL_STREAMING_BETA: &str = "fine-grained-tool-streaming-2025-05-14";

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Client headers allowed through to the upstream; everything else drops.
const HEADER_ALLOWLIST: &[&str] = &[
    "content-type",
    "anthropic-version",
    "anthropic-beta",
    "accept-language",
    "user-agent",
    "x-app",
    "anthropic-dangerous-direct-browser-access",
    "sec-fetch-mode",
    "accept",
];

#[derive(Debug, Clone)]
pub enum Endpoint {
    Messages,
    CountTokens,
    Responses,
    Gemini { model: String },
}

/// A fully-composed outbound request, ready for the HTTP upstream.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

pub struct BuildInput<'a> {
    pub account: &'a Account,
    pub endpoint: Endpoint,
    pub client_headers: &'a HeaderMap,
    pub body: Vec<u8>,
    pub stream: bool,
    pub mimic: bool,
    pub is_claude_code: bool,
    pub has_tools: bool,
    pub thinking_enabled: bool,
}

// ── URL gate ────────────────────────────────────────────────────────────

fn host_is_private(host: &str) -> bool {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_private()
                    || v4.is_link_local()
                    || v4.is_unspecified()
            }
            IpAddr::V6(v6) => {
                v6.is_loopback() || v6.is_unspecified() || (v6.segments()[0] & 0xfe00) == 0xfc00
            }
        };
    }
    let lowered = host.to_ascii_lowercase();
    lowered == "localhost" || lowered.ends_with(".local") || lowered.ends_with(".internal")
}

/// Validate an account's base-URL override against the configured gate.
pub fn validate_base_url(raw: &str, config: &GatewayConfig) -> Result<Url, GatewayError> {
    let url = Url::parse(raw)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("invalid base url: {e}")))?;

    match url.scheme() {
        "https" => {}
        "http" if config.allow_http_base_urls => {}
        other => {
            return Err(GatewayError::Internal(anyhow::anyhow!(
                "base url scheme {other} not allowed"
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("base url has no host")))?;

    if !config.allow_private_base_urls && host_is_private(host) {
        return Err(GatewayError::Internal(anyhow::anyhow!(
            "base url host is private/loopback"
        )));
    }

    if !config.base_url_allowlist.is_empty()
        && !config
            .base_url_allowlist
            .iter()
            .any(|allowed| allowed == &host.to_ascii_lowercase())
    {
        return Err(GatewayError::Internal(anyhow::anyhow!(
            "base url host not in allowlist"
        )));
    }

    Ok(url)
}

fn account_base<'a>(
    account: &'a Account,
    default: &'a str,
    config: &GatewayConfig,
) -> Result<String, GatewayError> {
    match account.base_url.as_deref() {
        Some(base) if !base.is_empty() => {
            let url = validate_base_url(base, config)?;
            Ok(url.as_str().trim_end_matches('/').to_string())
        }
        _ => Ok(default.to_string()),
    }
}

// ── Target URL resolution ───────────────────────────────────────────────

fn target_url(input: &BuildInput<'_>, config: &GatewayConfig) -> Result<String, GatewayError> {
    let account = input.account;
    match (&input.endpoint, account.platform) {
        (Endpoint::Messages, Platform::Anthropic | Platform::Antigravity) => {
            if account.uses_oauth() && account.base_url.is_none() {
                Ok(ANTHROPIC_OAUTH_MESSAGES.to_string())
            } else {
                let base = account_base(account, ANTHROPIC_DEFAULT_BASE, config)?;
                Ok(format!("{base}/v1/messages"))
            }
        }
        (Endpoint::CountTokens, Platform::Anthropic | Platform::Antigravity) => {
            if account.uses_oauth() && account.base_url.is_none() {
                Ok(ANTHROPIC_OAUTH_COUNT_TOKENS.to_string())
            } else {
                let base = account_base(account, ANTHROPIC_DEFAULT_BASE, config)?;
                Ok(format!("{base}/v1/messages/count_tokens"))
            }
        }
        (Endpoint::Responses, Platform::Openai) => {
            if account.uses_oauth() {
                Ok(CHATGPT_RESPONSES.to_string())
            } else {
                let base = account_base(account, OPENAI_DEFAULT_BASE, config)?;
                Ok(format!("{base}/responses"))
            }
        }
        (Endpoint::Gemini { model }, Platform::Gemini | Platform::Antigravity) => {
            if account.uses_oauth() && account.gemini_project_id().is_some() {
                let base = account_base(account, CODE_ASSIST_BASE, config)?;
                Ok(format!("{base}/v1internal:streamGenerateContent?alt=sse"))
            } else {
                let base = account_base(account, GEMINI_DEFAULT_BASE, config)?;
                Ok(format!(
                    "{base}/v1beta/models/{model}:streamGenerateContent?alt=sse"
                ))
            }
        }
        (endpoint, platform) => Err(GatewayError::Internal(anyhow::anyhow!(
            "endpoint {endpoint:?} unsupported for platform {}",
            platform.as_str()
        ))),
    }
}

// ── Header composition ──────────────────────────────────────────────────

fn filter_client_headers(client: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in client {
        let lowered = name.as_str();
        let allowed =
            HEADER_ALLOWLIST.contains(&lowered) || lowered.starts_with("x-stainless-");
        if allowed {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn split_betas(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Compose the `anthropic-beta` value for an anthropic-bound request.
pub fn negotiate_betas(
    client_beta: Option<&str>,
    account: &Account,
    mimic: bool,
    is_claude_code: bool,
    has_tools: bool,
    thinking_enabled: bool,
) -> Option<String> {
    if account.uses_oauth() {
        if is_claude_code {
            // Preserve the client's list; slot the oauth beta in after any
            // claude-code entry, else at the front.
            let mut betas = client_beta.map(split_betas).unwrap_or_default();
            if !betas.iter().any(|b| b == OAUTH_BETA) {
                match betas.iter().position(|b| b.starts_with("claude-code")) {
                    Some(idx) => betas.insert(idx + 1, OAUTH_BETA.to_string()),
                    None => betas.insert(0, OAUTH_BETA.to_string()),
                }
            }
            return Some(betas.join(","));
        }

        let mut betas = vec![OAUTH_BETA.to_string()];
        if mimic {
            if has_tools {
                betas.push(CLAUDE_CODE_BETA.to_string());
            }
            betas.push(INTERLEAVED_THINKING_BETA.to_string());
        }
        return Some(betas.join(","));
    }

    // API-key accounts: only inject when the request actually needs a beta.
    let mut betas = client_beta.map(split_betas).unwrap_or_default();
    if thinking_enabled && !betas.iter().any(|b| b == INTERLEAVED_THINKING_BETA) {
        betas.push(INTERLEAVED_THINKING_BETA.to_string());
    }
    if has_tools && !betas.iter().any(|b| b == TOOL_STREAMING_BETA) {
        betas.push(TOOL_STREAMING_BETA.to_string());
    }
    if betas.is_empty() { None } else { Some(betas.join(",")) }
}

/// Build the outbound request. `token` comes from the token provider;
/// `fingerprint` is present for OAuth accounts and applied last.
pub fn build_request(
    input: BuildInput<'_>,
    token: &str,
    fingerprint: Option<&Fingerprint>,
    config: &GatewayConfig,
) -> Result<UpstreamRequest, GatewayError> {
    let url = target_url(&input, config)?;
    let account = input.account;

    let mut headers = filter_client_headers(input.client_headers);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    // Auth.
    if account.uses_oauth() {
        let bearer = format!("Bearer {token}");
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad token: {e}")))?,
        );
        headers.remove("x-api-key");
    } else {
        match account.platform {
            Platform::Openai => {
                let bearer = format!("Bearer {token}");
                headers.insert(
                    http::header::AUTHORIZATION,
                    HeaderValue::from_str(&bearer)
                        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad key: {e}")))?,
                );
            }
            Platform::Gemini => {
                headers.insert(
                    HeaderName::from_static("x-goog-api-key"),
                    HeaderValue::from_str(token)
                        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad key: {e}")))?,
                );
            }
            _ => {
                headers.insert(
                    HeaderName::from_static("x-api-key"),
                    HeaderValue::from_str(token)
                        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad key: {e}")))?,
                );
                if !headers.contains_key("anthropic-version") {
                    headers.insert(
                        HeaderName::from_static("anthropic-version"),
                        HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION),
                    );
                }
            }
        }
    }

    // anthropic-beta negotiation (anthropic-family endpoints only).
    if matches!(input.endpoint, Endpoint::Messages | Endpoint::CountTokens) {
        let client_beta = input
            .client_headers
            .get("anthropic-beta")
            .and_then(|v| v.to_str().ok());
        match negotiate_betas(
            client_beta,
            account,
            input.mimic,
            input.is_claude_code,
            input.has_tools,
            input.thinking_enabled,
        ) {
            Some(betas) => {
                headers.insert(
                    HeaderName::from_static("anthropic-beta"),
                    HeaderValue::from_str(&betas)
                        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad beta: {e}")))?,
                );
            }
            None => {
                headers.remove("anthropic-beta");
            }
        }
    }

    // Stream negotiation.
    if input.stream {
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            HeaderName::from_static("x-stainless-helper-method"),
            HeaderValue::from_static("stream"),
        );
    } else {
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    }

    // ChatGPT backend wants an explicit host + account id.
    let mut body = input.body;
    if account.platform == Platform::Openai && account.uses_oauth() {
        headers.insert(HOST, HeaderValue::from_static("chatgpt.com"));
        if let Some(chatgpt_id) = account.chatgpt_account_id() {
            headers.insert(
                HeaderName::from_static("chatgpt-account-id"),
                HeaderValue::from_str(chatgpt_id)
                    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("bad account id: {e}")))?,
            );
        }
    }

    // Code-Assist wraps the native request.
    if let Endpoint::Gemini { model } = &input.endpoint
        && account.uses_oauth()
        && let Some(project) = account.gemini_project_id()
    {
        let inner: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("gemini body reparse: {e}")))?;
        let wrapped = json!({ "model": model, "project": project, "request": inner });
        body = serde_json::to_vec(&wrapped)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("gemini body rewrap: {e}")))?;
    }

    // Fingerprint last: it must win over anything the client supplied.
    if let Some(fp) = fingerprint
        && account.uses_oauth()
    {
        apply_fingerprint_headers(&mut headers, fp);
    }

    Ok(UpstreamRequest {
        url,
        headers,
        body,
        timeout: UPSTREAM_TIMEOUT,
    })
}

// ── HTTP upstream (pooled per account/proxy) ────────────────────────────

#[async_trait]
pub trait HttpUpstream: Send + Sync {
    /// Execute an outbound request. The response body is the caller's to
    /// drain and close.
    async fn send(
        &self,
        req: UpstreamRequest,
        proxy: Option<&str>,
        account_id: i64,
        tls_fingerprint: bool,
    ) -> anyhow::Result<reqwest::Response>;
}

/// Connection pools are partitioned per (account, proxy) so one account's
/// upstream affinity never leaks to another.
#[derive(Default)]
pub struct ReqwestUpstream {
    clients: DashMap<String, reqwest::Client>,
}

impl ReqwestUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, account_id: i64, proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
        let key = format!("{account_id}:{}", proxy.unwrap_or(""));
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy_url) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        let client = builder.build()?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl HttpUpstream for ReqwestUpstream {
    async fn send(
        &self,
        req: UpstreamRequest,
        proxy: Option<&str>,
        account_id: i64,
        _tls_fingerprint: bool,
    ) -> anyhow::Result<reqwest::Response> {
        let client = self.client_for(account_id, proxy)?;
        let resp = client
            .post(&req.url)
            .headers(req.headers)
            .body(req.body)
            .timeout(req.timeout)
            .send()
            .await?;
        Ok(resp)
    }
}
