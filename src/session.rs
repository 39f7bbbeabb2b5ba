//! Session fingerprint derivation.
//!
//! The fingerprint pins a conversation to one upstream account (sticky
//! sessions). Rules are tried in order; the first hit wins:
//!
//! 1. a `session_<uuid>` marker inside `metadata.user_id`
//! 2. SHA-256 over all content parts marked `cache_control.type=ephemeral`
//! 3. SHA-256 over the system text
//! 4. SHA-256 over the first message's text
//! 5. none — no affinity

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::parser::ParsedRequest;

static SESSION_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"session_([0-9a-f-]{36})").expect("session id regex is valid")
});

/// 32 lowercase hex chars — the truncated SHA-256 used for rules 2-4.
fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Text of a content value: plain strings pass through, arrays concatenate
/// their `text` fields.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn is_ephemeral(block: &Value) -> bool {
    block
        .pointer("/cache_control/type")
        .and_then(|v| v.as_str())
        .map(|t| t == "ephemeral")
        .unwrap_or(false)
}

/// Text of every ephemeral-cached block across system and messages, in
/// document order.
fn cacheable_text(req: &ParsedRequest) -> String {
    let mut out = String::new();

    if let Some(Value::Array(blocks)) = req.system_value() {
        for b in blocks {
            if is_ephemeral(b)
                && let Some(t) = b.get("text").and_then(|t| t.as_str())
            {
                out.push_str(t);
            }
        }
    }

    for msg in req.messages() {
        if let Some(Value::Array(blocks)) = msg.get("content") {
            for b in blocks {
                if is_ephemeral(b)
                    && let Some(t) = b.get("text").and_then(|t| t.as_str())
                {
                    out.push_str(t);
                }
            }
        }
    }

    out
}

/// Derive the session fingerprint for a request. `None` means no affinity.
pub fn session_fingerprint(req: &ParsedRequest) -> Option<String> {
    // 1. explicit session marker in metadata.user_id
    if let Some(user_id) = req.user_id.as_deref()
        && let Some(caps) = SESSION_ID_RE.captures(user_id)
    {
        return Some(caps[1].to_string());
    }

    // 2. ephemeral cache_control content
    let cacheable = cacheable_text(req);
    if !cacheable.is_empty() {
        return Some(short_hash(&cacheable));
    }

    // 3. system text
    if let Some(system) = req.system_value() {
        let text = content_text(system);
        if !text.is_empty() {
            return Some(short_hash(&text));
        }
    }

    // 4. first message text
    if let Some(first) = req.messages().first() {
        let text = first.get("content").map(content_text).unwrap_or_default();
        return Some(short_hash(&text));
    }

    // 5. nothing to key on
    None
}

/// Sticky-store key. The OpenAI path namespaces under `openai:`.
pub fn sticky_key(namespace: &str, group_id: i64, session: &str) -> String {
    format!("{namespace}sticky:{group_id}:{session}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> ParsedRequest {
        ParsedRequest::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn user_id_marker_wins_over_cacheable_content() {
        let req = parse(
            r#"{"model":"m",
                "metadata":{"user_id":"user_x_account__session_aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa"},
                "messages":[{"role":"user","content":[
                    {"type":"text","text":"cached","cache_control":{"type":"ephemeral"}}]}]}"#,
        );
        assert_eq!(
            session_fingerprint(&req).unwrap(),
            "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa"
        );
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let req = parse(r#"{"model":"m","messages":[{"role":"user","content":"hello"}]}"#);
        let a = session_fingerprint(&req).unwrap();
        let b = session_fingerprint(&req).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn non_cacheable_text_does_not_change_hash() {
        // Two payloads differ only in a non-cached block: same fingerprint.
        let a = parse(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"pinned","cache_control":{"type":"ephemeral"}},
                {"type":"text","text":"variant one"}]}]}"#,
        );
        let b = parse(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"pinned","cache_control":{"type":"ephemeral"}},
                {"type":"text","text":"variant two"}]}]}"#,
        );
        assert_eq!(session_fingerprint(&a), session_fingerprint(&b));

        // Differing cacheable content: different fingerprint.
        let c = parse(
            r#"{"model":"m","messages":[{"role":"user","content":[
                {"type":"text","text":"other pin","cache_control":{"type":"ephemeral"}},
                {"type":"text","text":"variant one"}]}]}"#,
        );
        assert_ne!(session_fingerprint(&a), session_fingerprint(&c));
    }

    #[test]
    fn falls_back_to_system_then_first_message() {
        let sys = parse(r#"{"model":"m","system":"be brief","messages":[]}"#);
        let by_system = session_fingerprint(&sys).unwrap();

        let msg = parse(r#"{"model":"m","messages":[{"role":"user","content":"be brief"}]}"#);
        let by_message = session_fingerprint(&msg).unwrap();

        // Same text, same hash — both reduce to SHA-256 of "be brief".
        assert_eq!(by_system, by_message);
    }

    #[test]
    fn empty_request_has_no_affinity() {
        let req = parse(r#"{"model":"m","messages":[]}"#);
        assert_eq!(session_fingerprint(&req), None);
    }

    #[test]
    fn sticky_key_namespacing() {
        assert_eq!(sticky_key("", 10, "abc"), "sticky:10:abc");
        assert_eq!(sticky_key("openai:", 10, "abc"), "openai:sticky:10:abc");
    }
}
