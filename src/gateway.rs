//! The forward path: parse → fingerprint → select → transform → send →
//! relay → record.
//!
//! One request owns exactly one slot token at a time; the token travels
//! into the streaming task (or drops at the end of the buffered path) and
//! its drop guarantees release on every exit, including panics.

use std::collections::HashSet;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GatewayError;
use crate::identity::weave_user_id;
use crate::models::{ClientInfo, ForwardResult, Platform, UsageCounters};
use crate::parser::ParsedRequest;
use crate::retry;
use crate::scheduler::{SelectedAccount, SelectionRequest};
use crate::session::session_fingerprint;
use crate::sse::{ClientSink, StreamOptions, pump};
use crate::state::AppState;
use crate::transform::{
    PreparedBody, downgrade_tool_blocks, filter_thinking_blocks, prepare_body,
    rewrite_response_json,
};
use crate::upstream::{BuildInput, Endpoint};

const CLIENT_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Messages,
    CountTokens,
    Responses,
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    pub kind: EndpointKind,
    pub forced_platform: Option<Platform>,
    pub cache_namespace: &'static str,
    /// count_tokens is exempt from billing.
    pub billable: bool,
}

impl ForwardOptions {
    pub fn messages() -> Self {
        Self {
            kind: EndpointKind::Messages,
            forced_platform: None,
            cache_namespace: "",
            billable: true,
        }
    }

    pub fn count_tokens() -> Self {
        Self {
            kind: EndpointKind::CountTokens,
            forced_platform: None,
            cache_namespace: "",
            billable: false,
        }
    }

    pub fn responses() -> Self {
        Self {
            kind: EndpointKind::Responses,
            forced_platform: Some(Platform::Openai),
            cache_namespace: "openai:",
            billable: true,
        }
    }
}

enum AttemptOutcome {
    Success {
        resp: reqwest::Response,
        prepared: PreparedBody,
    },
    Failover {
        status: u16,
    },
    Terminal(GatewayError),
}

fn endpoint_for(kind: EndpointKind, platform: Platform, mapped_model: &str) -> Endpoint {
    match (kind, platform) {
        (EndpointKind::Responses, _) => Endpoint::Responses,
        (_, Platform::Gemini) => Endpoint::Gemini {
            model: mapped_model.to_string(),
        },
        (EndpointKind::CountTokens, _) => Endpoint::CountTokens,
        (EndpointKind::Messages, _) => Endpoint::Messages,
    }
}

/// Forward one client request, with in-account retries and account-level
/// failover.
pub async fn forward(
    state: AppState,
    client: ClientInfo,
    client_headers: HeaderMap,
    raw_body: Bytes,
    opts: ForwardOptions,
) -> Result<Response, GatewayError> {
    let started = Instant::now();
    let parsed = ParsedRequest::parse(&raw_body)?;
    let session = session_fingerprint(&parsed);
    let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());

    let mut excluded: HashSet<i64> = HashSet::new();

    for attempt in 0..state.config.max_failover_attempts {
        let selected = state
            .scheduler
            .select(&SelectionRequest {
                group_id: client.group_id,
                session: session.as_deref(),
                model: &parsed.model,
                excluded: &excluded,
                forced_platform: opts.forced_platform,
                is_claude_code: client.is_claude_code,
                cache_namespace: opts.cache_namespace,
            })
            .await?;
        let account_id = selected.account.id;

        match attempt_on_account(&state, &client, &client_headers, &parsed, &selected, session.as_deref(), opts)
            .await
        {
            AttemptOutcome::Success { resp, prepared } => {
                return finish_request(
                    state, client, parsed, selected, prepared, resp, request_id, started, opts,
                )
                .await;
            }
            AttemptOutcome::Failover { status } => {
                tracing::info!(
                    account_id,
                    status,
                    attempt,
                    "failing over to another account"
                );
                selected.token.release();
                excluded.insert(account_id);
            }
            AttemptOutcome::Terminal(err) => {
                selected.token.release();
                return Err(err);
            }
        }
    }

    Err(GatewayError::no_account(Some(&parsed.model)))
}

/// Send to one selected account, applying the signature-repair and generic
/// retry policies. Does not consume the slot token.
async fn attempt_on_account(
    state: &AppState,
    client: &ClientInfo,
    client_headers: &HeaderMap,
    parsed: &ParsedRequest,
    selected: &SelectedAccount,
    session: Option<&str>,
    opts: ForwardOptions,
) -> AttemptOutcome {
    let account = &selected.account;

    let fingerprint = if account.uses_oauth() {
        Some(state.identity.fingerprint(account).await)
    } else {
        None
    };
    let client_fp_id = fingerprint.as_ref().map(|f| f.client_id.as_str()).unwrap_or("");

    let mut prepared = prepare_body(
        parsed,
        account,
        client,
        session,
        client_fp_id,
        state.config.debug_claude_mimic,
    );
    if let Some(fp) = &fingerprint {
        weave_user_id(&mut prepared.body, account, fp);
    }

    let token = match state.tokens.access_token(account).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!(account_id = account.id, error = %e, "no usable credential, failing over");
            return AttemptOutcome::Failover { status: 401 };
        }
    };

    let endpoint = endpoint_for(opts.kind, selected.platform, &prepared.mapped_model);
    let attempt_started = Instant::now();
    // Body repair stages: 0 = original, 1 = thinking-filtered, 2 = +tool-downgraded.
    let mut repair_stage = 0u8;
    let mut body_value = prepared.body.clone();
    let mut backoff_attempt = 0u32;

    loop {
        let body_bytes = match serde_json::to_vec(&body_value) {
            Ok(bytes) => bytes,
            Err(e) => return AttemptOutcome::Terminal(GatewayError::Internal(e.into())),
        };
        let request = match crate::upstream::build_request(
            BuildInput {
                account,
                endpoint: endpoint.clone(),
                client_headers,
                body: body_bytes,
                stream: parsed.stream && opts.kind != EndpointKind::CountTokens,
                mimic: prepared.mimic,
                is_claude_code: client.is_claude_code,
                has_tools: parsed.has_tools(),
                thinking_enabled: parsed.thinking_enabled(),
            },
            &token,
            fingerprint.as_ref(),
            &state.config,
        ) {
            Ok(request) => request,
            Err(e) => return AttemptOutcome::Terminal(e),
        };

        let resp = match state
            .upstream
            .send(request, account.proxy_url.as_deref(), account.id, account.tls_fingerprint)
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(account_id = account.id, error = %e, "upstream transport error");
                return AttemptOutcome::Failover { status: 502 };
            }
        };

        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            state
                .rate_limit
                .update_session_window(account, resp.headers())
                .await;
            return AttemptOutcome::Success { resp, prepared };
        }

        let resp_headers = resp.headers().clone();
        let error_body = resp.text().await.unwrap_or_default();

        if state.config.log_upstream_errors {
            tracing::warn!(
                account_id = account.id,
                status,
                body = truncate_utf8(&error_body, state.config.upstream_error_log_cap),
                "upstream error body"
            );
        }

        // Signature-error branch: repair the body and resend, same account.
        if status == 400 && attempt_started.elapsed() < retry::RETRY_MAX_ELAPSED {
            if repair_stage == 0 && retry::is_signature_error(status, &error_body) {
                repair_stage = 1;
                body_value = prepared.body.clone();
                filter_thinking_blocks(&mut body_value);
                tracing::info!(account_id = account.id, "retrying with thinking blocks filtered");
                continue;
            }
            if repair_stage == 1 && retry::is_tool_signature_error(&error_body) {
                repair_stage = 2;
                downgrade_tool_blocks(&mut body_value);
                tracing::info!(account_id = account.id, "retrying with tool blocks downgraded");
                continue;
            }
        }

        // Generic retry (never 400): exponential backoff, bounded attempts
        // and elapsed time. The sleep cancels with the request future.
        if retry::should_retry_status(account, status)
            && backoff_attempt + 1 < retry::RETRY_MAX_ATTEMPTS
            && attempt_started.elapsed() < retry::RETRY_MAX_ELAPSED
        {
            let delay = retry::backoff_delay(backoff_attempt);
            backoff_attempt += 1;
            tracing::debug!(account_id = account.id, status, ?delay, "backing off before retry");
            tokio::time::sleep(delay).await;
            continue;
        }

        // Exhausted: let the rate-limit collaborator update account health,
        // then classify for failover.
        let disabled = state
            .rate_limit
            .handle_upstream_error(account, status, &resp_headers, &error_body)
            .await;
        tracing::warn!(
            account_id = account.id,
            status,
            disabled,
            "upstream error after retries"
        );

        if retry::is_failover_eligible(status, &error_body, state.config.failover_on_400) {
            return AttemptOutcome::Failover { status };
        }
        return AttemptOutcome::Terminal(GatewayError::Upstream {
            status,
            body: error_body,
        });
    }
}

/// Success path: stream or buffer the upstream response to the client and
/// record usage.
#[allow(clippy::too_many_arguments)]
async fn finish_request(
    state: AppState,
    client: ClientInfo,
    parsed: ParsedRequest,
    selected: SelectedAccount,
    prepared: PreparedBody,
    resp: reqwest::Response,
    request_id: String,
    started: Instant,
    opts: ForwardOptions,
) -> Result<Response, GatewayError> {
    let requested_model = parsed.model.clone();
    // count_tokens is always a buffered passthrough.
    let streaming = parsed.stream && opts.kind != EndpointKind::CountTokens;

    if !streaming {
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Internal(e.into()))?;

        let (payload, usage) = match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                rewrite_response_json(
                    &mut value,
                    &prepared.name_map,
                    &prepared.mapped_model,
                    &requested_model,
                );
                let usage = extract_usage(&value);
                (serde_json::to_vec(&value).unwrap_or_else(|_| bytes.to_vec()), usage)
            }
            Err(_) => (bytes.to_vec(), UsageCounters::default()),
        };

        if opts.billable {
            let result = ForwardResult {
                request_id,
                usage,
                model: requested_model,
                stream: false,
                duration: started.elapsed(),
                first_token_latency: None,
                client_disconnect: false,
            };
            if let Err(e) = state
                .recorder
                .record(&client, selected.group.as_ref(), selected.account.id, &result)
                .await
            {
                tracing::warn!(error = %e, "usage recording failed");
            }
        }
        drop(selected.token);

        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(payload))
            .map_err(|e| GatewayError::Internal(e.into()));
    }

    // Streaming: hand the relay to a background task that owns the slot
    // token; the response body is fed from the sink channel.
    let (mut sink, rx) = ClientSink::channel(CLIENT_CHANNEL_BUFFER);
    let stream_opts = StreamOptions {
        mimic: prepared.mimic,
        name_map: prepared.name_map,
        requested_model: requested_model.clone(),
        mapped_model: prepared.mapped_model.clone(),
        max_line_bytes: state.config.max_sse_line_bytes,
        idle_timeout: state.config.stream_idle_timeout,
    };

    tokio::spawn(async move {
        let token = selected.token;
        let outcome = pump(
            resp,
            &mut sink,
            &stream_opts,
            started,
            &selected.account,
            state.rate_limit.as_ref(),
        )
        .await;

        if opts.billable {
            let result = ForwardResult {
                request_id,
                usage: outcome.usage,
                model: requested_model,
                stream: true,
                duration: started.elapsed(),
                first_token_latency: outcome.first_token_latency,
                client_disconnect: outcome.client_disconnect,
            };
            if let Err(e) = state
                .recorder
                .record(&client, selected.group.as_ref(), selected.account.id, &result)
                .await
            {
                tracing::warn!(error = %e, "usage recording failed");
            }
        }
        token.release();
    });

    let body_stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body_stream))
        .map_err(|e| GatewayError::Internal(e.into()))
}

/// UTF-8 safe truncation for log output.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn extract_usage(body: &Value) -> UsageCounters {
    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    UsageCounters {
        input_tokens: usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        image_count: None,
        image_size_bytes: None,
    }
}
