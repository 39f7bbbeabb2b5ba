//! One-shot parse of the client body into a structured view.
//!
//! The body JSON is parsed exactly once; everything downstream (session
//! hashing, transformation, forwarding) works off this view or a clone of
//! its tree.

use serde_json::Value;

use crate::error::GatewayError;

/// `system` distinguishes "absent" from "present-and-null": banner injection
/// must not overwrite an explicit null the client sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemField {
    Absent,
    Null,
    Present,
}

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub raw: Vec<u8>,
    pub body: Value,
    pub model: String,
    pub stream: bool,
    pub user_id: Option<String>,
    pub system: SystemField,
}

impl ParsedRequest {
    pub fn parse(raw: &[u8]) -> Result<ParsedRequest, GatewayError> {
        let body: Value = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::BadRequest(format!("malformed JSON body: {e}")))?;

        if !body.is_object() {
            return Err(GatewayError::BadRequest("body must be a JSON object".into()));
        }

        let model = match body.get("model") {
            Some(Value::String(m)) => m.clone(),
            Some(_) => return Err(GatewayError::BadRequest("model: expected string".into())),
            None => return Err(GatewayError::BadRequest("model: field required".into())),
        };

        let stream = match body.get("stream") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(_) => return Err(GatewayError::BadRequest("stream: expected boolean".into())),
        };

        let user_id = body
            .pointer("/metadata/user_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let system = match body.get("system") {
            None => SystemField::Absent,
            Some(Value::Null) => SystemField::Null,
            Some(_) => SystemField::Present,
        };

        Ok(ParsedRequest {
            raw: raw.to_vec(),
            body,
            model,
            stream,
            user_id,
            system,
        })
    }

    pub fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn system_value(&self) -> Option<&Value> {
        match self.system {
            SystemField::Present => self.body.get("system"),
            _ => None,
        }
    }

    pub fn has_tools(&self) -> bool {
        self.body
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    }

    pub fn thinking_enabled(&self) -> bool {
        self.body
            .pointer("/thinking/type")
            .and_then(|v| v.as_str())
            .map(|t| t == "enabled")
            .unwrap_or(false)
    }
}
