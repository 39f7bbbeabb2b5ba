//! Upstream SSE → client relay with inline rewriting and usage capture.
//!
//! One reader worker splits the upstream body into lines and feeds a bounded
//! channel; a single merger assembles frames, rewrites them, accumulates
//! usage, enforces the oversize and idle guards, and is the only writer into
//! the client response. A client disconnect never stops the upstream drain —
//! billing counters must see the whole run.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::models::{Account, UsageCounters};
use crate::services::RateLimitService;
use crate::toolnames::NameMap;

const LINE_CHANNEL_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAbort {
    /// Upstream emitted `event: error` — failover-equivalent semantics.
    UpstreamError(String),
    LineTooLong,
    IdleTimeout,
}

#[derive(Debug, Default)]
pub struct StreamOutcome {
    pub usage: UsageCounters,
    pub first_token_latency: Option<Duration>,
    pub client_disconnect: bool,
    pub aborted: Option<StreamAbort>,
}

pub struct StreamOptions {
    pub mimic: bool,
    pub name_map: NameMap,
    pub requested_model: String,
    pub mapped_model: String,
    pub max_line_bytes: usize,
    pub idle_timeout: Duration,
}

// ── Client sink (single writer) ─────────────────────────────────────────

/// Write side of the client response body. Flips to broken on the first
/// failed send and stays broken — the merger keeps draining upstream.
pub struct ClientSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ClientSink {
    pub fn channel(buffer: usize) -> (ClientSink, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer);
        (ClientSink { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything — used by tests and the drain-only path.
    pub fn broken() -> ClientSink {
        ClientSink { tx: None }
    }

    pub fn is_broken(&self) -> bool {
        self.tx.is_none()
    }

    pub async fn send(&mut self, bytes: Bytes) -> bool {
        match &self.tx {
            None => false,
            Some(tx) => {
                if tx.send(bytes).await.is_err() {
                    self.tx = None;
                    false
                } else {
                    true
                }
            }
        }
    }
}

// ── Reader worker ───────────────────────────────────────────────────────

enum ReaderEvent {
    Line(String),
    Oversize,
    Eof,
}

/// Split the upstream byte stream into lines. Terminates as soon as the
/// merger stops receiving.
async fn read_lines(resp: reqwest::Response, tx: mpsc::Sender<ReaderEvent>, max_line_bytes: usize) {
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "upstream byte stream ended with error");
                break;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos > max_line_bytes {
                let _ = tx.send(ReaderEvent::Oversize).await;
                return;
            }
            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..pos])
                .trim_end_matches('\r')
                .to_string();
            if tx.send(ReaderEvent::Line(line)).await.is_err() {
                // Merger is gone — stop reading.
                break 'outer;
            }
        }

        if buf.len() > max_line_bytes {
            let _ = tx.send(ReaderEvent::Oversize).await;
            return;
        }
    }

    let _ = tx.send(ReaderEvent::Eof).await;
}

// ── Frame assembly ──────────────────────────────────────────────────────

#[derive(Default)]
struct FrameBuilder {
    event: Option<String>,
    data: Option<String>,
}

impl FrameBuilder {
    fn push_line(&mut self, line: &str) {
        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            // Some upstreams emit `data:` with no space after the colon.
            if self.data.is_none() {
                self.data = Some(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }
        // Comment and unknown field lines are ignored.
    }

    fn take(&mut self) -> Option<(Option<String>, String)> {
        let data = self.data.take()?;
        Some((self.event.take(), data))
    }

    fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_none()
    }
}

fn frame_bytes(event: Option<&str>, payload: &str) -> Bytes {
    match event {
        Some(name) => Bytes::from(format!("event: {name}\ndata: {payload}\n\n")),
        None => Bytes::from(format!("data: {payload}\n\n")),
    }
}

// ── The merger ──────────────────────────────────────────────────────────

enum Control {
    Continue,
    Finish,
    Abort(StreamAbort),
}

struct Merger<'a> {
    opts: &'a StreamOptions,
    sink: &'a mut ClientSink,
    outcome: StreamOutcome,
    started: Instant,
    /// Buffered tool-input fragments per content-block index (mimic mode).
    tool_input: HashMap<u64, String>,
}

impl<'a> Merger<'a> {
    async fn write(&mut self, bytes: Bytes) {
        if !self.sink.send(bytes).await && !self.outcome.client_disconnect {
            self.outcome.client_disconnect = true;
            tracing::debug!("client disconnected mid-stream, draining upstream for usage");
        }
    }

    fn note_first_token(&mut self) {
        if self.outcome.first_token_latency.is_none() {
            self.outcome.first_token_latency = Some(self.started.elapsed());
        }
    }

    fn merge_message_start(&mut self, event: &Value) {
        let usage = &mut self.outcome.usage;
        if let Some(u) = event.pointer("/message/usage") {
            if let Some(v) = u.get("input_tokens").and_then(|v| v.as_u64()) {
                usage.input_tokens = v;
            }
            if let Some(v) = u.get("cache_creation_input_tokens").and_then(|v| v.as_u64()) {
                usage.cache_creation_tokens = v;
            }
            if let Some(v) = u.get("cache_read_input_tokens").and_then(|v| v.as_u64()) {
                usage.cache_read_tokens = v;
            }
            if let Some(v) = u.get("output_tokens").and_then(|v| v.as_u64()) {
                usage.output_tokens = v;
            }
        }
    }

    fn merge_message_delta(&mut self, event: &Value) {
        let usage = &mut self.outcome.usage;
        if let Some(u) = event.get("usage") {
            if let Some(v) = u.get("output_tokens").and_then(|v| v.as_u64()) {
                usage.output_tokens += v;
            }
            if let Some(v) = u.get("cache_creation_input_tokens").and_then(|v| v.as_u64()) {
                usage.cache_creation_tokens += v;
            }
            if let Some(v) = u.get("cache_read_input_tokens").and_then(|v| v.as_u64()) {
                usage.cache_read_tokens += v;
            }
            // A positive input count is authoritative; zero never overwrites.
            if let Some(v) = u.get("input_tokens").and_then(|v| v.as_u64())
                && v > 0
            {
                usage.input_tokens = v;
            }
        }
    }

    /// Rewrite a mapped model name back to what the client asked for.
    fn rewrite_model(&self, event: &mut Value) {
        if self.opts.mapped_model == self.opts.requested_model {
            return;
        }
        for path in ["/message/model", "/model"] {
            if let Some(m) = event.pointer_mut(path)
                && m.as_str() == Some(self.opts.mapped_model.as_str())
            {
                *m = json!(self.opts.requested_model);
            }
        }
    }

    fn rewrite_tool_use_name(&self, event: &mut Value) {
        if !self.opts.mimic {
            return;
        }
        if let Some(block) = event.get_mut("content_block")
            && block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
            && let Some(name) = block.get("name").and_then(|n| n.as_str())
            && let Some(original) = self.opts.name_map.original_tool(name)
        {
            block["name"] = json!(original);
        }
    }

    async fn handle_frame(&mut self, event_name: Option<String>, payload: String) -> Control {
        if event_name.as_deref() == Some("error") {
            self.write(frame_bytes(Some("error"), &payload)).await;
            return Control::Abort(StreamAbort::UpstreamError(payload));
        }

        if payload == "[DONE]" {
            self.write(frame_bytes(event_name.as_deref(), "[DONE]")).await;
            return Control::Finish;
        }

        let Ok(mut event) = serde_json::from_str::<Value>(&payload) else {
            self.note_first_token();
            let text = if self.opts.mimic {
                self.opts.name_map.restore_text(&payload)
            } else {
                payload
            };
            self.write(frame_bytes(event_name.as_deref(), &text)).await;
            return Control::Continue;
        };

        self.note_first_token();
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("").to_string();

        match event_type.as_str() {
            "message_start" => self.merge_message_start(&event),
            "message_delta" => self.merge_message_delta(&event),
            "content_block_delta" => {
                if self.opts.mimic
                    && event.pointer("/delta/type").and_then(|t| t.as_str())
                        == Some("input_json_delta")
                {
                    // Buffer the fragment; the full transformed JSON goes out
                    // right before the matching content_block_stop.
                    let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                    let partial = event
                        .pointer("/delta/partial_json")
                        .and_then(|p| p.as_str())
                        .unwrap_or("");
                    self.tool_input.entry(index).or_default().push_str(partial);
                    return Control::Continue;
                }
            }
            "content_block_stop" => {
                let index = event.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                if self.opts.mimic
                    && let Some(buffered) = self.tool_input.remove(&index)
                {
                    let full = match serde_json::from_str::<Value>(&buffered) {
                        Ok(mut input) => {
                            self.opts.name_map.restore_input_keys(&mut input);
                            serde_json::to_string(&input).unwrap_or(buffered)
                        }
                        Err(_) => buffered,
                    };
                    let synthesized = json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "input_json_delta", "partial_json": full }
                    });
                    self.write(frame_bytes(
                        Some("content_block_delta"),
                        &synthesized.to_string(),
                    ))
                    .await;
                }
            }
            _ => {}
        }

        self.rewrite_model(&mut event);
        self.rewrite_tool_use_name(&mut event);

        self.write(frame_bytes(event_name.as_deref(), &event.to_string()))
            .await;

        if event_type == "message_stop" {
            return Control::Finish;
        }
        Control::Continue
    }
}

/// Relay one upstream SSE response into the client sink.
pub async fn pump(
    resp: reqwest::Response,
    sink: &mut ClientSink,
    opts: &StreamOptions,
    started: Instant,
    account: &Account,
    rate_limit: &dyn RateLimitService,
) -> StreamOutcome {
    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_BUFFER);
    let max_line_bytes = opts.max_line_bytes;
    let reader = tokio::spawn(read_lines(resp, tx, max_line_bytes));

    let mut merger = Merger {
        opts,
        sink,
        outcome: StreamOutcome::default(),
        started,
        tool_input: HashMap::new(),
    };
    let mut frame = FrameBuilder::default();

    let idle = tokio::time::sleep(opts.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            event = rx.recv() => {
                idle.as_mut().reset(tokio::time::Instant::now() + opts.idle_timeout);
                match event {
                    Some(ReaderEvent::Line(line)) => {
                        if line.is_empty() {
                            if let Some((name, payload)) = frame.take() {
                                match merger.handle_frame(name, payload).await {
                                    Control::Continue => {}
                                    Control::Finish => break,
                                    Control::Abort(reason) => {
                                        merger.outcome.aborted = Some(reason);
                                        break;
                                    }
                                }
                            }
                            frame = FrameBuilder::default();
                        } else if !line.starts_with(':') {
                            frame.push_line(&line);
                        }
                    }
                    Some(ReaderEvent::Oversize) => {
                        merger
                            .write(frame_bytes(Some("error"), r#"{"error":"response_too_large"}"#))
                            .await;
                        merger.outcome.aborted = Some(StreamAbort::LineTooLong);
                        break;
                    }
                    Some(ReaderEvent::Eof) | None => {
                        // Flush a final frame lacking its terminating blank line.
                        if !frame.is_empty()
                            && let Some((name, payload)) = frame.take()
                        {
                            match merger.handle_frame(name, payload).await {
                                Control::Abort(reason) => merger.outcome.aborted = Some(reason),
                                _ => {}
                            }
                        }
                        break;
                    }
                }
            }
            _ = &mut idle => {
                merger
                    .write(frame_bytes(Some("error"), r#"{"error":"stream_timeout"}"#))
                    .await;
                rate_limit
                    .handle_stream_timeout(account, &opts.requested_model)
                    .await;
                merger.outcome.aborted = Some(StreamAbort::IdleTimeout);
                break;
            }
        }
    }

    reader.abort();
    merger.outcome
}
