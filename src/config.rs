//! Gateway configuration, read once from the environment at startup.

use std::time::Duration;

/// Truthy env values: `1|true|yes|on` (case-insensitive). Absence = false.
pub fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // ── debug switches ──────────────────────────────────────────────
    pub debug_model_routing: bool,
    pub debug_claude_mimic: bool,

    // ── SSE guards ──────────────────────────────────────────────────
    /// Hard cap on one upstream SSE line. Default 40 MiB.
    pub max_sse_line_bytes: usize,
    /// Max silence between upstream lines before the stream is aborted.
    pub stream_idle_timeout: Duration,

    // ── scheduling ──────────────────────────────────────────────────
    pub sticky_ttl: Duration,
    /// Bounded wait when a preferred (sticky/routed) account is slot-full.
    pub slot_wait_timeout: Duration,
    pub slot_max_waiters: u32,
    /// Layer-3 fallback wait: longer timeout, larger queue.
    pub fallback_wait_timeout: Duration,
    pub fallback_max_waiters: u32,
    /// Layer-3 candidate pick: random within the best priority band
    /// instead of least-recently-used.
    pub fallback_pick_random: bool,
    /// Equal-priority never-used gemini accounts: OAuth beats API-key.
    pub gemini_prefer_oauth: bool,
    /// Distinct accounts tried per request before giving up.
    pub max_failover_attempts: usize,
    /// Window-cost multiple past which even sticky sessions are refused.
    pub window_cost_hard_factor: f64,

    // ── retry / failover ────────────────────────────────────────────
    /// Allow failover on 400 when the body signals a compatibility issue.
    pub failover_on_400: bool,

    // ── upstream URL gate (API-key base overrides) ──────────────────
    pub allow_http_base_urls: bool,
    pub allow_private_base_urls: bool,
    /// Allowed hosts for base-URL overrides. Empty disables the host gate.
    pub base_url_allowlist: Vec<String>,

    // ── error surfacing ─────────────────────────────────────────────
    pub log_upstream_errors: bool,
    pub upstream_error_log_cap: usize,

    // ── billing ─────────────────────────────────────────────────────
    /// Record usage logs but skip ledger updates.
    pub simple_mode: bool,
    pub default_rate_multiplier: f64,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            debug_model_routing: env_truthy("SUB2API_DEBUG_MODEL_ROUTING"),
            debug_claude_mimic: env_truthy("SUB2API_DEBUG_CLAUDE_MIMIC"),
            max_sse_line_bytes: env_u64("SUB2API_MAX_SSE_LINE_BYTES", 40 * 1024 * 1024) as usize,
            stream_idle_timeout: Duration::from_secs(env_u64(
                "SUB2API_STREAM_IDLE_TIMEOUT_SECS",
                180,
            )),
            sticky_ttl: Duration::from_secs(env_u64("SUB2API_STICKY_TTL_SECS", 3600)),
            slot_wait_timeout: Duration::from_secs(env_u64("SUB2API_SLOT_WAIT_SECS", 30)),
            slot_max_waiters: env_u64("SUB2API_SLOT_MAX_WAITERS", 10) as u32,
            fallback_wait_timeout: Duration::from_secs(env_u64(
                "SUB2API_FALLBACK_WAIT_SECS",
                60,
            )),
            fallback_max_waiters: env_u64("SUB2API_FALLBACK_MAX_WAITERS", 50) as u32,
            fallback_pick_random: env_truthy("SUB2API_FALLBACK_PICK_RANDOM"),
            gemini_prefer_oauth: !matches!(
                std::env::var("SUB2API_GEMINI_PREFER_OAUTH").as_deref(),
                Ok("0") | Ok("false") | Ok("no") | Ok("off")
            ),
            max_failover_attempts: env_u64("SUB2API_MAX_FAILOVER_ATTEMPTS", 3) as usize,
            window_cost_hard_factor: env_f64("SUB2API_WINDOW_COST_HARD_FACTOR", 1.5),
            failover_on_400: env_truthy("SUB2API_FAILOVER_ON_400"),
            allow_http_base_urls: env_truthy("SUB2API_ALLOW_HTTP_BASE_URLS"),
            allow_private_base_urls: env_truthy("SUB2API_ALLOW_PRIVATE_BASE_URLS"),
            base_url_allowlist: std::env::var("SUB2API_BASE_URL_ALLOWLIST")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_ascii_lowercase())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_upstream_errors: env_truthy("SUB2API_LOG_UPSTREAM_ERRORS"),
            upstream_error_log_cap: env_u64("SUB2API_UPSTREAM_ERROR_LOG_CAP", 2048) as usize,
            simple_mode: env_truthy("SUB2API_SIMPLE_MODE"),
            default_rate_multiplier: env_f64("SUB2API_DEFAULT_RATE_MULTIPLIER", 1.0),
        }
    }
}

impl Default for GatewayConfig {
    /// Defaults used by tests — independent of the process environment.
    fn default() -> Self {
        Self {
            debug_model_routing: false,
            debug_claude_mimic: false,
            max_sse_line_bytes: 40 * 1024 * 1024,
            stream_idle_timeout: Duration::from_secs(180),
            sticky_ttl: Duration::from_secs(3600),
            slot_wait_timeout: Duration::from_secs(30),
            slot_max_waiters: 10,
            fallback_wait_timeout: Duration::from_secs(60),
            fallback_max_waiters: 50,
            fallback_pick_random: false,
            gemini_prefer_oauth: true,
            max_failover_attempts: 3,
            window_cost_hard_factor: 1.5,
            failover_on_400: false,
            allow_http_base_urls: false,
            allow_private_base_urls: false,
            base_url_allowlist: Vec::new(),
            log_upstream_errors: false,
            upstream_error_log_cap: 2048,
            simple_mode: false,
            default_rate_multiplier: 1.0,
        }
    }
}
