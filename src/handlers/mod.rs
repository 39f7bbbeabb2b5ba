//! Inbound HTTP handlers.
//!
//! - `messages` — Anthropic Messages relay (`/v1/messages`, count_tokens)
//! - `responses` — OpenAI Responses relay (`/responses`)
//! - `health` — health & readiness

pub mod health;
pub mod messages;
pub mod responses;

pub use health::*;
pub use messages::*;
pub use responses::*;
