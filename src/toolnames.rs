//! Tool/model identity normalization for mimic mode.
//!
//! Request side: tool names are stripped of client prefixes and renamed to
//! the Claude Code set (Pascal-case fallback for unknown tools); schema keys
//! are snake_cased. The per-request [`NameMap`] records every rename so the
//! response side can rewrite names and keys back. The map is never shared
//! across requests.

use std::collections::HashMap;

use serde_json::Value;

/// Shorthand model names clients send, canonicalized before forwarding.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("sonnet", "claude-sonnet-4-5"),
    ("opus", "claude-opus-4-1"),
    ("haiku", "claude-haiku-4-5"),
    ("claude-sonnet-latest", "claude-sonnet-4-5"),
    ("claude-opus-latest", "claude-opus-4-1"),
    ("claude-3-5-haiku-latest", "claude-3-5-haiku-20241022"),
];

/// Fixed renames to the canonical Claude Code tool set.
const TOOL_OVERRIDES: &[(&str, &str)] = &[
    ("bash", "Bash"),
    ("read", "Read"),
    ("write", "Write"),
    ("edit", "Edit"),
    ("multiedit", "MultiEdit"),
    ("glob", "Glob"),
    ("grep", "Grep"),
    ("ls", "LS"),
    ("task", "Task"),
    ("webfetch", "WebFetch"),
    ("web_fetch", "WebFetch"),
    ("websearch", "WebSearch"),
    ("web_search", "WebSearch"),
    ("todowrite", "TodoWrite"),
    ("todoread", "TodoRead"),
    ("notebookedit", "NotebookEdit"),
    ("exitplanmode", "ExitPlanMode"),
];

const STRIP_PREFIXES: &[&str] = &["oc_", "mcp_"];

pub fn canonical_model(model: &str) -> String {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or_else(|| model.to_string())
}

pub fn is_haiku_model(model: &str) -> bool {
    model.contains("haiku")
}

/// `my_custom-tool` -> `MyCustomTool`.
pub fn pascal_case(name: &str) -> String {
    name.split(['_', '-'])
        .filter(|seg| !seg.is_empty())
        .map(|seg| {
            let mut chars = seg.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// `maxOutputTokens` / `MaxOutputTokens` / `max-output-tokens` -> snake.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c == '-' || c == ' ' {
            out.push('_');
            prev_lower = false;
        } else if c.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(c.to_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c != '_';
            out.push(c);
        }
    }
    out
}

// ── Per-request name map ────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
pub struct NameMap {
    /// normalized tool name -> original client name
    tools: HashMap<String, String>,
    /// snake_cased schema key -> original key
    props: HashMap<String, String>,
}

impl NameMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.props.is_empty()
    }

    /// Normalize a client tool name, recording the rename for the response
    /// path. Returns the name to send upstream.
    pub fn normalize_tool(&mut self, original: &str) -> String {
        let mut stripped = original;
        for prefix in STRIP_PREFIXES {
            if let Some(rest) = stripped.strip_prefix(prefix) {
                stripped = rest;
                break;
            }
        }

        let lowered = stripped.to_ascii_lowercase();
        let normalized = TOOL_OVERRIDES
            .iter()
            .find(|(from, _)| *from == lowered)
            .map(|(_, to)| to.to_string())
            .unwrap_or_else(|| pascal_case(stripped));

        if normalized != original {
            self.tools.insert(normalized.clone(), original.to_string());
        }
        normalized
    }

    pub fn original_tool(&self, normalized: &str) -> Option<&str> {
        self.tools.get(normalized).map(|s| s.as_str())
    }

    /// Snake_case every property / required name of a tool input schema,
    /// recording renames for response-side restoration.
    pub fn normalize_schema(&mut self, schema: &mut Value) {
        let Some(obj) = schema.as_object_mut() else {
            return;
        };

        if let Some(Value::Object(props)) = obj.get_mut("properties") {
            let keys: Vec<String> = props.keys().cloned().collect();
            for key in keys {
                let snake = snake_case(&key);
                let mut inner = props.remove(&key).unwrap_or(Value::Null);
                // Nested object schemas get the same treatment.
                self.normalize_schema(&mut inner);
                if snake != key {
                    self.props.insert(snake.clone(), key);
                }
                props.insert(snake, inner);
            }
        }

        if let Some(Value::Array(required)) = obj.get_mut("required") {
            for entry in required.iter_mut() {
                if let Value::String(name) = entry {
                    let snake = snake_case(name);
                    if snake != *name {
                        self.props.insert(snake.clone(), name.clone());
                    }
                    *name = snake;
                }
            }
        }

        if let Some(items) = obj.get_mut("items") {
            self.normalize_schema(items);
        }
    }

    /// Rewrite assembled tool-input JSON keys back to the client's originals.
    pub fn restore_input_keys(&self, input: &mut Value) {
        match input {
            Value::Object(map) => {
                let keys: Vec<String> = map.keys().cloned().collect();
                for key in keys {
                    let mut inner = map.remove(&key).unwrap_or(Value::Null);
                    self.restore_input_keys(&mut inner);
                    let restored = self.props.get(&key).cloned().unwrap_or(key);
                    map.insert(restored, inner);
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.restore_input_keys(item);
                }
            }
            _ => {}
        }
    }

    /// Substitute normalized tool names back into free text (used for
    /// non-JSON SSE payloads forwarded verbatim).
    pub fn restore_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (normalized, original) in &self.tools {
            if out.contains(normalized.as_str()) {
                out = out.replace(normalized.as_str(), original);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn override_table_round_trips() {
        let mut map = NameMap::new();
        for original in ["bash", "oc_read", "mcp_webfetch", "todowrite"] {
            let normalized = map.normalize_tool(original);
            assert_eq!(map.original_tool(&normalized), Some(original));
        }
        assert_eq!(map.normalize_tool("bash"), "Bash");
        assert_eq!(map.normalize_tool("oc_read"), "Read");
        assert_eq!(map.normalize_tool("mcp_webfetch"), "WebFetch");
    }

    #[test]
    fn generic_pascal_round_trips() {
        let mut map = NameMap::new();
        let normalized = map.normalize_tool("oc_my_custom_tool");
        assert_eq!(normalized, "MyCustomTool");
        assert_eq!(map.original_tool("MyCustomTool"), Some("oc_my_custom_tool"));
    }

    #[test]
    fn already_canonical_name_is_untouched() {
        let mut map = NameMap::new();
        assert_eq!(map.normalize_tool("Bash"), "Bash");
        assert!(map.original_tool("Bash").is_none());
    }

    #[test]
    fn snake_case_handles_camel_and_kebab() {
        assert_eq!(snake_case("maxOutputTokens"), "max_output_tokens");
        assert_eq!(snake_case("MaxOutputTokens"), "max_output_tokens");
        assert_eq!(snake_case("file-path"), "file_path");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn schema_keys_round_trip() {
        let mut map = NameMap::new();
        let mut schema = json!({
            "type": "object",
            "properties": {
                "filePath": { "type": "string" },
                "maxDepth": { "type": "integer" }
            },
            "required": ["filePath"]
        });
        map.normalize_schema(&mut schema);
        assert!(schema["properties"]["file_path"].is_object());
        assert_eq!(schema["required"][0], "file_path");

        let mut input = json!({ "file_path": "/tmp/x", "max_depth": 3 });
        map.restore_input_keys(&mut input);
        assert_eq!(input, json!({ "filePath": "/tmp/x", "maxDepth": 3 }));
    }

    #[test]
    fn model_aliases() {
        assert_eq!(canonical_model("sonnet"), "claude-sonnet-4-5");
        assert_eq!(canonical_model("claude-sonnet-4-5"), "claude-sonnet-4-5");
        assert!(is_haiku_model("claude-haiku-4-5"));
        assert!(!is_haiku_model("claude-sonnet-4-5"));
    }
}
