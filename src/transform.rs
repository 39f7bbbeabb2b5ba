//! Conditional request-body rewriting.
//!
//! Unconditional: cache_control capping and API-key model mapping. The
//! mimic path (OAuth/setup-token account serving a non-Claude-Code client)
//! additionally injects the Claude Code banner, normalizes tool identities,
//! sanitizes content, stamps metadata, and strips fields the OAuth upstream
//! rejects. Two extra filters repair bodies for signature-error retries.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Account, ClientInfo};
use crate::parser::{ParsedRequest, SystemField};
use crate::toolnames::{NameMap, canonical_model, is_haiku_model};

/// The canonical Claude Code system banner.
pub const CLAUDE_CODE_BANNER: &str = "You are Claude Code, Anthropic's official CLI for Claude.";

/// System prefixes already identifying a Claude Code client; no injection.
const RECOGNIZED_PREFIXES: &[&str] = &[
    CLAUDE_CODE_BANNER,
    "You are Claude Code",
];

const OPENCODE_SENTENCE: &str = "You are OpenCode, the best coding agent on the planet.";

/// Max blocks allowed to carry cache_control across system + messages.
const CACHE_CONTROL_CAP: usize = 4;

static OPENCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)opencode").expect("opencode regex is valid"));

static ABS_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:/[A-Za-z0-9_.@~-]+){2,}/?").expect("path regex is valid")
});

static SESSION_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"session_([0-9a-f-]{36})").expect("session suffix regex is valid")
});

// ── Entry point ─────────────────────────────────────────────────────────

pub struct PreparedBody {
    pub body: Value,
    pub name_map: NameMap,
    pub mimic: bool,
    /// Model actually sent upstream (post alias/mapping).
    pub mapped_model: String,
}

/// Rewrite the parsed request for one selected account.
pub fn prepare_body(
    parsed: &ParsedRequest,
    account: &Account,
    client: &ClientInfo,
    session: Option<&str>,
    client_fingerprint_id: &str,
    debug_mimic: bool,
) -> PreparedBody {
    let mut body = parsed.body.clone();
    let mut name_map = NameMap::new();
    let mimic = account.uses_oauth() && !client.is_claude_code;

    if mimic {
        apply_mimic(
            &mut body,
            parsed,
            account,
            session,
            &mut name_map,
            client_fingerprint_id,
        );
        if debug_mimic {
            tracing::debug!(
                account_id = account.id,
                tools = body.get("tools").and_then(|t| t.as_array()).map(|a| a.len()).unwrap_or(0),
                "claude mimic transforms applied"
            );
        }
    }

    // Model mapping (API-key accounts) runs regardless of mimic.
    let requested = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(parsed.model.as_str())
        .to_string();
    let mapped_model = account.mapped_model(&requested);
    if mapped_model != requested {
        body["model"] = json!(mapped_model);
    }

    // Cap runs last so the injected banner is counted (and protected).
    strip_thinking_cache_control(&mut body);
    cap_cache_control(&mut body);

    PreparedBody {
        body,
        name_map,
        mimic,
        mapped_model,
    }
}

// ── cache_control capping ───────────────────────────────────────────────

fn block_has_cache_control(block: &Value) -> bool {
    block.get("cache_control").map(|c| !c.is_null()).unwrap_or(false)
}

fn is_thinking_block(block: &Value) -> bool {
    matches!(
        block.get("type").and_then(|t| t.as_str()),
        Some("thinking") | Some("redacted_thinking")
    )
}

/// `thinking` blocks never carry cache_control; strip it silently.
fn strip_thinking_cache_control(body: &mut Value) {
    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages {
            if let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in blocks {
                    if is_thinking_block(block)
                        && let Some(obj) = block.as_object_mut()
                    {
                        obj.remove("cache_control");
                    }
                }
            }
        }
    }
}

fn count_cache_control(body: &Value) -> usize {
    let mut count = 0;
    if let Some(Value::Array(system)) = body.get("system") {
        count += system.iter().filter(|b| block_has_cache_control(b)).count();
    }
    if let Some(Value::Array(messages)) = body.get("messages") {
        for msg in messages {
            if let Some(Value::Array(blocks)) = msg.get("content") {
                count += blocks.iter().filter(|b| block_has_cache_control(b)).count();
            }
        }
    }
    count
}

/// Enforce the 4-breakpoint cap: drop markers from messages head-first
/// (keeping the most recent breakpoints), then from system tail-first,
/// never touching a banner block sitting at the system head.
pub fn cap_cache_control(body: &mut Value) {
    let mut excess = count_cache_control(body).saturating_sub(CACHE_CONTROL_CAP);
    if excess == 0 {
        return;
    }

    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        'messages: for msg in messages.iter_mut() {
            if let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for block in blocks {
                    if excess == 0 {
                        break 'messages;
                    }
                    if block_has_cache_control(block)
                        && let Some(obj) = block.as_object_mut()
                    {
                        obj.remove("cache_control");
                        excess -= 1;
                    }
                }
            }
        }
    }

    if excess > 0
        && let Some(system) = body.get_mut("system").and_then(|s| s.as_array_mut())
    {
        let protect_head = system
            .first()
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|t| t == CLAUDE_CODE_BANNER)
            .unwrap_or(false);
        let floor = if protect_head { 1 } else { 0 };

        for idx in (floor..system.len()).rev() {
            if excess == 0 {
                break;
            }
            if block_has_cache_control(&system[idx])
                && let Some(obj) = system[idx].as_object_mut()
            {
                obj.remove("cache_control");
                excess -= 1;
            }
        }
    }
}

// ── Mimic path ──────────────────────────────────────────────────────────

fn apply_mimic(
    body: &mut Value,
    parsed: &ParsedRequest,
    account: &Account,
    session: Option<&str>,
    name_map: &mut NameMap,
    client_fingerprint_id: &str,
) {
    // Canonicalize the model field via the alias table.
    let model = canonical_model(&parsed.model);
    body["model"] = json!(model);

    strip_system_cache_control(body);
    inject_banner(body, parsed, &model);
    normalize_tools(body, name_map);
    normalize_history_tool_names(body, name_map);
    sanitize_content(body);
    stamp_metadata(body, account, session, client_fingerprint_id);

    // The OAuth upstream rejects these in Claude Code mode.
    if let Some(obj) = body.as_object_mut() {
        obj.remove("temperature");
        obj.remove("tool_choice");
    }
}

/// Client-supplied cache_control on system blocks is dropped on the OAuth
/// path before the banner (which carries its own marker) is injected.
fn strip_system_cache_control(body: &mut Value) {
    if let Some(system) = body.get_mut("system").and_then(|s| s.as_array_mut()) {
        for block in system {
            if let Some(obj) = block.as_object_mut() {
                obj.remove("cache_control");
            }
        }
    }
}

fn banner_block() -> Value {
    json!({
        "type": "text",
        "text": CLAUDE_CODE_BANNER,
        "cache_control": { "type": "ephemeral" }
    })
}

fn starts_with_recognized_prefix(text: &str) -> bool {
    RECOGNIZED_PREFIXES.iter().any(|p| text.starts_with(p))
}

/// Prepend the Claude Code banner unless the system already identifies as
/// Claude Code, the model family is Haiku, or the client sent an explicit
/// null system.
fn inject_banner(body: &mut Value, parsed: &ParsedRequest, model: &str) {
    if is_haiku_model(model) || parsed.system == SystemField::Null {
        return;
    }

    match body.get("system").cloned() {
        Some(Value::String(s)) => {
            if starts_with_recognized_prefix(&s) {
                return;
            }
            body["system"] = json!([
                banner_block(),
                { "type": "text", "text": format!("{CLAUDE_CODE_BANNER}\n\n{s}") },
            ]);
        }
        Some(Value::Array(arr)) => {
            let first_text = arr
                .first()
                .and_then(|b| b.get("text"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            if starts_with_recognized_prefix(first_text) {
                return;
            }
            let mut out = vec![banner_block()];
            let mut prefixed = false;
            for mut block in arr {
                // Interop safeguard: some upstreams concatenate system
                // entries, so the first text block also gets the banner
                // as a prefix.
                if !prefixed
                    && block.get("type").and_then(|t| t.as_str()) == Some("text")
                    && let Some(text) = block.get("text").and_then(|t| t.as_str()).map(String::from)
                {
                    block["text"] = json!(format!("{CLAUDE_CODE_BANNER}\n\n{text}"));
                    prefixed = true;
                }
                out.push(block);
            }
            body["system"] = Value::Array(out);
        }
        _ => {
            body["system"] = json!([banner_block()]);
        }
    }
}

fn normalize_tools(body: &mut Value, name_map: &mut NameMap) {
    let Some(tools) = body.get_mut("tools").and_then(|t| t.as_array_mut()) else {
        return;
    };
    for tool in tools {
        if let Some(name) = tool.get("name").and_then(|n| n.as_str()).map(String::from) {
            tool["name"] = json!(name_map.normalize_tool(&name));
        }
        if let Some(desc) = tool.get("description").and_then(|d| d.as_str()) {
            let cleaned = redact_paths(&sanitize_text(desc));
            tool["description"] = json!(cleaned);
        }
        if let Some(schema) = tool.get_mut("input_schema") {
            name_map.normalize_schema(schema);
        }
    }
}

/// Historical assistant tool_use blocks must carry the same names as the
/// normalized tool table.
fn normalize_history_tool_names(body: &mut Value, name_map: &mut NameMap) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };
    for msg in messages {
        let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
                && let Some(name) = block.get("name").and_then(|n| n.as_str()).map(String::from)
            {
                block["name"] = json!(name_map.normalize_tool(&name));
            }
        }
    }
}

fn sanitize_text(text: &str) -> String {
    let replaced = text.replace(OPENCODE_SENTENCE, CLAUDE_CODE_BANNER);
    if OPENCODE_RE.is_match(&replaced) {
        OPENCODE_RE.replace_all(&replaced, "Claude").into_owned()
    } else {
        replaced
    }
}

fn redact_paths(text: &str) -> String {
    ABS_PATH_RE.replace_all(text, "[path]").into_owned()
}

/// Sweep system and message text blocks for client-branding leftovers.
fn sanitize_content(body: &mut Value) {
    let visit = |blocks: &mut Vec<Value>| {
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) == Some("text")
                && let Some(text) = block.get("text").and_then(|t| t.as_str())
            {
                let cleaned = sanitize_text(text);
                if cleaned != text {
                    block["text"] = json!(cleaned);
                }
            }
        }
    };

    if let Some(system) = body.get_mut("system").and_then(|s| s.as_array_mut()) {
        visit(system);
    }
    if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in messages {
            match msg.get_mut("content") {
                Some(Value::Array(blocks)) => visit(blocks),
                Some(Value::String(s)) => {
                    let cleaned = sanitize_text(s);
                    if cleaned != *s {
                        *s = cleaned;
                    }
                }
                _ => {}
            }
        }
    }
}

// ── Metadata stamping ───────────────────────────────────────────────────

/// Deterministic v4-shaped UUID from a seed — equivalent sessions always
/// stamp the same id.
pub fn stable_uuid(seed: &str) -> Uuid {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

pub fn account_uuid(account: &Account) -> Uuid {
    stable_uuid(&format!("account::{}", account.id))
}

fn stamp_metadata(
    body: &mut Value,
    account: &Account,
    session: Option<&str>,
    client_fingerprint_id: &str,
) {
    let existing = body
        .pointer("/metadata/user_id")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    if existing {
        return;
    }

    let session_uuid = match session {
        Some(sess) => stable_uuid(&format!("{}::{}", account.id, sess)),
        None => Uuid::new_v4(),
    };

    let user_id = if client_fingerprint_id.is_empty() {
        // Legacy shape for accounts without a fingerprint identity.
        format!("user__account__session_{session_uuid}")
    } else {
        format!(
            "user_{client_fingerprint_id}_account_{}_session_{session_uuid}",
            account_uuid(account)
        )
    };

    match body.get_mut("metadata") {
        Some(Value::Object(meta)) => {
            meta.insert("user_id".into(), json!(user_id));
        }
        _ => {
            body["metadata"] = json!({ "user_id": user_id });
        }
    }
}

/// Extract the session suffix of a stamped user_id, if present.
pub fn session_suffix(user_id: &str) -> Option<&str> {
    SESSION_SUFFIX_RE
        .captures(user_id)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

// ── Retry filters ───────────────────────────────────────────────────────

/// Stage-1 repair for signature 400s: drop `thinking`/`redacted_thinking`
/// blocks from historical assistant messages. The top-level `thinking`
/// setting is left alone. Emptied assistant messages are dropped; emptied
/// user messages get a placeholder block.
pub fn filter_thinking_blocks(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };

    messages.retain_mut(|msg| {
        let role = msg
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string();
        let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
            return true;
        };

        blocks.retain(|b| !is_thinking_block(b));

        if !blocks.is_empty() {
            return true;
        }
        match role.as_str() {
            "assistant" => false,
            _ => {
                msg["content"] = json!([{ "type": "text", "text": "(content removed)" }]);
                true
            }
        }
    });
}

/// Stage-2 repair: additionally downgrade tool_use / tool_result blocks to
/// plain text when the upstream complains about tool signatures.
pub fn downgrade_tool_blocks(body: &mut Value) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };

    for msg in messages.iter_mut() {
        let Some(blocks) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };
        for block in blocks.iter_mut() {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let text = format!(
                        "[tool call: {name} {}]",
                        serde_json::to_string(&input).unwrap_or_default()
                    );
                    *block = json!({ "type": "text", "text": text });
                }
                Some("tool_result") => {
                    let content = match block.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        Some(v) => serde_json::to_string(v).unwrap_or_default(),
                        None => String::new(),
                    };
                    *block = json!({ "type": "text", "text": format!("[tool result: {content}]") });
                }
                _ => {}
            }
        }
    }
}

// ── Response-side rewriting (non-streaming) ─────────────────────────────

/// Undo the request-side renames on a complete (non-SSE) response body.
pub fn rewrite_response_json(
    body: &mut Value,
    name_map: &NameMap,
    mapped_model: &str,
    requested_model: &str,
) {
    if mapped_model != requested_model {
        if body.get("model").and_then(|m| m.as_str()) == Some(mapped_model) {
            body["model"] = json!(requested_model);
        }
        if body.pointer("/message/model").and_then(|m| m.as_str()) == Some(mapped_model) {
            body["message"]["model"] = json!(requested_model);
        }
    }

    if let Some(content) = body.get_mut("content").and_then(|c| c.as_array_mut()) {
        for block in content {
            if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                if let Some(name) = block.get("name").and_then(|n| n.as_str())
                    && let Some(original) = name_map.original_tool(name)
                {
                    block["name"] = json!(original);
                }
                if let Some(input) = block.get_mut("input") {
                    name_map.restore_input_keys(input);
                }
            }
        }
    }
}
