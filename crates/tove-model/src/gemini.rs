// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gemini driver — native Generative Language API.
//!
//! Uses the `generateContent` / `streamGenerateContent` endpoints.
//!
//! # Auth
//! API key via `?key=...` query param.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse`

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    client::{GenEventStream, ModelClient},
    schema::sanitize,
    sse::SseDecoder,
    FunctionCall, GenEvent, GenRequest, GenResponse, ProviderError, UsageMeta,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>, request_timeout: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            request_timeout,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, model: &str, streaming: bool) -> String {
        if streaming {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse&key={}",
                self.base_url, model, self.api_key
            )
        } else {
            format!(
                "{}/models/{}:generateContent?key={}",
                self.base_url, model, self.api_key
            )
        }
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, req: &GenRequest) -> Result<GenResponse, ProviderError> {
        let body = build_body(req);
        let url = self.url(&req.model, false);
        debug!(model = %req.model, "gemini generateContent");

        let fut = async {
            let resp = self.http.post(&url).json(&body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ProviderError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            let v: Value = resp
                .json()
                .await
                .map_err(|e| ProviderError::UnexpectedShape(e.to_string()))?;
            collect_response(&v)
        };

        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ProviderError::Timeout)?
    }

    async fn stream(
        &self,
        req: &GenRequest,
        cancel: CancellationToken,
    ) -> Result<GenEventStream, ProviderError> {
        let body = build_body(req);
        let url = self.url(&req.model, true);
        debug!(model = %req.model, tools = req.tools.len(), "gemini streamGenerateContent");

        let deadline = Instant::now() + self.request_timeout;
        let resp = tokio::time::timeout_at(deadline, self.http.post(&url).json(&body).send())
            .await
            .map_err(|_| ProviderError::Timeout)??;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(read_loop(resp, tx, cancel, deadline));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Emit the provider wire schema for one request.  Tool parameter schemas are
/// passed through the sanitizer here so no caller can leak a dialect the API
/// rejects.
fn build_body(req: &GenRequest) -> Value {
    let mut body = json!({ "contents": req.contents });

    if let Some(sys) = &req.system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": sys }] });
    }
    if !req.tools.is_empty() {
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": sanitize(&t.parameters),
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
        body["toolConfig"] = json!({
            "functionCallingConfig": { "mode": req.tool_mode.as_wire() }
        });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = req.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(m) = req.max_output_tokens {
        generation.insert("maxOutputTokens".into(), json!(m));
    }
    if let Some(b) = req.thinking_budget {
        generation.insert("thinkingConfig".into(), json!({ "thinkingBudget": b }));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

/// Drive the SSE body to completion, pushing decoded events into `tx`.
///
/// Exactly one `Done` is emitted on the success path; cancellation simply
/// ends the stream, and errors end it after one `Err` item.
async fn read_loop(
    mut resp: reqwest::Response,
    tx: mpsc::Sender<Result<GenEvent, ProviderError>>,
    cancel: CancellationToken,
    deadline: Instant,
) {
    let mut decoder = SseDecoder::new();
    let mut usage: Option<UsageMeta> = None;

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("gemini stream cancelled");
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                let _ = tx.send(Err(ProviderError::Timeout)).await;
                return;
            }
            c = resp.chunk() => c,
        };

        match chunk {
            Ok(Some(bytes)) => {
                for payload in decoder.feed(&bytes) {
                    if !forward_payload(&payload, &tx, &mut usage).await {
                        return;
                    }
                }
            }
            Ok(None) => {
                if let Some(payload) = decoder.finish() {
                    if !forward_payload(&payload, &tx, &mut usage).await {
                        return;
                    }
                }
                break;
            }
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }

    let _ = tx.send(Ok(GenEvent::Done { usage })).await;
}

/// Decode one SSE payload and forward its events.  Returns `false` when the
/// receiver is gone or the payload was fatally malformed.
async fn forward_payload(
    payload: &str,
    tx: &mpsc::Sender<Result<GenEvent, ProviderError>>,
    usage: &mut Option<UsageMeta>,
) -> bool {
    if payload == "[DONE]" {
        return true;
    }
    let v: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => {
            trace!("skipping malformed SSE payload");
            return true;
        }
    };
    if let Some(meta) = v.get("usageMetadata") {
        *usage = Some(parse_usage(meta));
    }
    match parse_chunk(&v) {
        Ok(events) => {
            for ev in events {
                if tx.send(Ok(ev)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            false
        }
    }
}

fn parse_usage(meta: &Value) -> UsageMeta {
    UsageMeta {
        prompt_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        candidates_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
        total_tokens: meta["totalTokenCount"].as_u64().unwrap_or(0) as u32,
    }
}

/// Project one validated response object onto [`GenEvent`]s.
fn parse_chunk(v: &Value) -> Result<Vec<GenEvent>, ProviderError> {
    let candidates = match v.get("candidates").and_then(Value::as_array) {
        Some(c) => c,
        // Usage-only frames carry no candidates.
        None if v.get("usageMetadata").is_some() => return Ok(vec![]),
        None => {
            return Err(ProviderError::UnexpectedShape(format!(
                "missing candidates: {}",
                truncate(&v.to_string(), 200)
            )))
        }
    };
    let Some(first) = candidates.first() else {
        return Ok(vec![]);
    };

    let mut events = Vec::new();
    if let Some(parts) = first["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fc) = part.get("functionCall") {
                events.push(GenEvent::FunctionCall {
                    name: fc["name"].as_str().unwrap_or("").to_string(),
                    args: fc.get("args").cloned().unwrap_or_else(|| json!({})),
                    thought_signature: part
                        .get("thoughtSignature")
                        .and_then(Value::as_str)
                        .map(String::from),
                });
            } else if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(GenEvent::TextDelta(text.to_string()));
                }
            }
        }
    }
    Ok(events)
}

/// Read a full non-streaming response body.
fn collect_response(v: &Value) -> Result<GenResponse, ProviderError> {
    let events = parse_chunk(v)?;
    let mut out = GenResponse {
        usage: v.get("usageMetadata").map(parse_usage),
        ..GenResponse::default()
    };
    for ev in events {
        match ev {
            GenEvent::TextDelta(t) => out.text.push_str(&t),
            GenEvent::FunctionCall { name, args, .. } => {
                out.function_calls.push(FunctionCall { name, args })
            }
            GenEvent::Done { .. } => {}
        }
    }
    Ok(out)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Content, Part, ToolDecl, ToolMode};

    fn req_with_tools() -> GenRequest {
        GenRequest {
            model: "gemini-2.0-flash".into(),
            contents: vec![Content::user(vec![Part::text("hi")])],
            system_instruction: Some("be terse".into()),
            tools: vec![ToolDecl {
                name: "read_file".into(),
                description: "read a file".into(),
                parameters: json!({
                    "type": "object",
                    "additionalProperties": false,
                    "properties": { "filename": { "type": "string", "minLength": 1 } },
                    "required": ["filename"]
                }),
            }],
            tool_mode: ToolMode::Auto,
            max_output_tokens: Some(2048),
            temperature: Some(0.4),
            thinking_budget: Some(512),
        }
    }

    #[test]
    fn url_patterns_match_both_endpoints() {
        let c = GeminiClient::new("KEY", None, Duration::from_secs(120));
        assert_eq!(
            c.url("gemini-2.0-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent?key=KEY"
        );
        assert!(c
            .url("gemini-2.0-flash", true)
            .contains(":streamGenerateContent?alt=sse&key=KEY"));
    }

    #[test]
    fn body_carries_system_instruction_and_generation_config() {
        let body = build_body(&req_with_tools());
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            512
        );
        assert_eq!(body["toolConfig"]["functionCallingConfig"]["mode"], "AUTO");
    }

    #[test]
    fn tool_parameters_are_sanitized_in_body() {
        let body = build_body(&req_with_tools());
        let params = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("additionalProperties").is_none());
        assert!(params["properties"]["filename"].get("minLength").is_none());
        assert_eq!(params["properties"]["filename"]["type"], "string");
    }

    #[test]
    fn body_omits_tools_section_when_registry_is_empty() {
        let req = GenRequest {
            model: "m".into(),
            contents: vec![Content::user(vec![Part::text("x")])],
            ..GenRequest::default()
        };
        let body = build_body(&req);
        assert!(body.get("tools").is_none());
        assert!(body.get("toolConfig").is_none());
    }

    // ── Chunk projection ──────────────────────────────────────────────────────

    #[test]
    fn text_part_projects_to_text_delta() {
        let v = json!({ "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }] });
        let evs = parse_chunk(&v).unwrap();
        assert!(matches!(&evs[0], GenEvent::TextDelta(t) if t == "hello"));
    }

    #[test]
    fn function_call_part_projects_with_thought_signature() {
        let v = json!({ "candidates": [{ "content": { "parts": [{
            "functionCall": { "name": "read_file", "args": { "filename": "a.md" } },
            "thoughtSignature": "sig-1"
        }] } }] });
        let evs = parse_chunk(&v).unwrap();
        match &evs[0] {
            GenEvent::FunctionCall {
                name,
                args,
                thought_signature,
            } => {
                assert_eq!(name, "read_file");
                assert_eq!(args["filename"], "a.md");
                assert_eq!(thought_signature.as_deref(), Some("sig-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn multiple_parts_project_in_order() {
        let v = json!({ "candidates": [{ "content": { "parts": [
            { "text": "a" },
            { "functionCall": { "name": "f", "args": {} } },
            { "text": "b" }
        ] } }] });
        let evs = parse_chunk(&v).unwrap();
        assert_eq!(evs.len(), 3);
        assert!(matches!(&evs[2], GenEvent::TextDelta(t) if t == "b"));
    }

    #[test]
    fn finish_reason_only_chunk_is_empty() {
        let v = json!({ "candidates": [{ "finishReason": "STOP" }] });
        assert!(parse_chunk(&v).unwrap().is_empty());
    }

    #[test]
    fn usage_only_chunk_is_valid() {
        let v = json!({ "usageMetadata": { "promptTokenCount": 3 } });
        assert!(parse_chunk(&v).unwrap().is_empty());
    }

    #[test]
    fn missing_candidates_is_unexpected_shape() {
        let v = json!({ "nonsense": true });
        assert!(matches!(
            parse_chunk(&v),
            Err(ProviderError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn collect_response_merges_text_and_calls() {
        let v = json!({
            "candidates": [{ "content": { "parts": [
                { "text": "partial " },
                { "text": "answer" },
                { "functionCall": { "name": "f", "args": { "k": 1 } } }
            ] } }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 4, "totalTokenCount": 14 }
        });
        let r = collect_response(&v).unwrap();
        assert_eq!(r.text, "partial answer");
        assert_eq!(r.function_calls.len(), 1);
        assert_eq!(r.usage.unwrap().total_tokens, 14);
    }
}
