//! OpenAI-compatible streaming reasoning adapter.
//!
//! Speaks the `/chat/completions` SSE protocol that most hosted and local
//! providers expose. The wire details stay here; the orchestrator only sees
//! [`LlmEvent`]s.

use crate::error::{AgentError, Result};
use crate::llm::{
    FinishReason, LlmEvent, LlmEventStream, Message, ReasoningEngine, Role, ToolDefinition,
};
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for an OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct HttpReasonerConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Bearer token, if the provider requires one.
    pub api_key: Option<String>,
    /// Model identifier sent with every request.
    pub model: String,
}

/// Reasoning engine backed by an OpenAI-compatible chat endpoint.
pub struct HttpReasoner {
    config: HttpReasonerConfig,
    client: reqwest::Client,
}

impl HttpReasoner {
    /// Create an adapter for the given provider.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the HTTP client cannot be built.
    pub fn new(config: HttpReasonerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl ReasoningEngine for HttpReasoner {
    async fn respond(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<LlmEventStream> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = build_request_body(&self.config.model, messages, tools);

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Connection(format!("provider request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AgentError::Llm(format!(
                "provider returned {status}: {detail}"
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut parser = SseParser::new();
            let mut buffer = String::new();
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = chunk
                    .map_err(|e| AgentError::Llm(format!("provider stream failed: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    for event in parser.push_line(line.trim_end())? {
                        let done = matches!(event, LlmEvent::StreamEnd { .. });
                        yield event;
                        if done {
                            break 'outer;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

fn build_request_body(
    model: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = messages.iter().map(message_to_json).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn message_to_json(message: &Message) -> serde_json::Value {
    match message.role {
        Role::System => json!({"role": "system", "content": message.content}),
        Role::User => json!({"role": "user", "content": message.content}),
        Role::Assistant => {
            let mut value = json!({"role": "assistant", "content": message.content});
            if !message.tool_calls.is_empty() {
                value["tool_calls"] = message
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.arguments},
                        })
                    })
                    .collect();
            }
            value
        }
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
    }
}

// ── SSE chunk parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Incremental SSE line parser, kept separate from I/O so it can be tested
/// with plain strings.
struct SseParser {
    /// Open tool calls: (provider index, call id).
    open_calls: Vec<(u32, String)>,
}

impl SseParser {
    fn new() -> Self {
        Self {
            open_calls: Vec::new(),
        }
    }

    /// Parse one SSE line into zero or more events.
    fn push_line(&mut self, line: &str) -> Result<Vec<LlmEvent>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            // Providers send finish_reason before DONE; a bare DONE ends
            // the reply cleanly.
            return Ok(vec![LlmEvent::StreamEnd {
                finish_reason: FinishReason::Stop,
            }]);
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| AgentError::Llm(format!("malformed stream chunk: {e}")))?;
        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content
                && !text.is_empty()
            {
                events.push(LlmEvent::TextDelta { text });
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                if let Some(id) = call.id {
                    let name = call
                        .function
                        .as_ref()
                        .and_then(|f| f.name.clone())
                        .unwrap_or_default();
                    self.open_calls.push((call.index, id.clone()));
                    events.push(LlmEvent::ToolCallStart { call_id: id, name });
                }
                if let Some(args) = call.function.and_then(|f| f.arguments)
                    && !args.is_empty()
                    && let Some((_, id)) = self.open_calls.iter().find(|(i, _)| *i == call.index)
                {
                    events.push(LlmEvent::ToolCallArgsDelta {
                        call_id: id.clone(),
                        args_fragment: args,
                    });
                }
            }
            if let Some(reason) = choice.finish_reason {
                for (_, id) in self.open_calls.drain(..) {
                    events.push(LlmEvent::ToolCallEnd { call_id: id });
                }
                let finish_reason = if reason == "tool_calls" {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                };
                events.push(LlmEvent::StreamEnd { finish_reason });
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(json: &str) -> String {
        format!("data: {json}")
    }

    #[test]
    fn parses_text_deltas() {
        let mut parser = SseParser::new();
        let events = parser
            .push_line(&data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#))
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [LlmEvent::TextDelta { text }] if text == "Hel"
        ));

        let events = parser
            .push_line(&data(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#))
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [LlmEvent::StreamEnd {
                finish_reason: FinishReason::Stop
            }]
        ));
    }

    #[test]
    fn parses_tool_call_rounds() {
        let mut parser = SseParser::new();
        let events = parser
            .push_line(&data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"lookup","arguments":""}}]}}]}"#,
            ))
            .unwrap();
        assert!(matches!(
            &events[0],
            LlmEvent::ToolCallStart { call_id, name } if call_id == "c1" && name == "lookup"
        ));

        let events = parser
            .push_line(&data(
                r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"q\":1}"}}]}}]}"#,
            ))
            .unwrap();
        assert!(matches!(
            &events[0],
            LlmEvent::ToolCallArgsDelta { call_id, args_fragment }
                if call_id == "c1" && args_fragment == "{\"q\":1}"
        ));

        let events = parser
            .push_line(&data(
                r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            ))
            .unwrap();
        assert!(matches!(&events[0], LlmEvent::ToolCallEnd { call_id } if call_id == "c1"));
        assert!(matches!(
            &events[1],
            LlmEvent::StreamEnd {
                finish_reason: FinishReason::ToolCalls
            }
        ));
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let mut parser = SseParser::new();
        assert!(parser.push_line(": keep-alive").unwrap().is_empty());
        assert!(parser.push_line("").unwrap().is_empty());
        assert!(parser.push_line("event: ping").unwrap().is_empty());
    }

    #[test]
    fn done_ends_the_stream() {
        let mut parser = SseParser::new();
        let events = parser.push_line("data: [DONE]").unwrap();
        assert!(matches!(events.as_slice(), [LlmEvent::StreamEnd { .. }]));
    }

    #[test]
    fn assistant_tool_calls_round_trip_into_request() {
        let message = Message::assistant(
            "",
            vec![crate::llm::ToolCallRecord {
                id: "c1".into(),
                name: "lookup".into(),
                arguments: "{}".into(),
            }],
        );
        let value = message_to_json(&message);
        assert_eq!(value["tool_calls"][0]["function"]["name"], "lookup");
        let tool_reply = Message::tool("c1", "42");
        let value = message_to_json(&tool_reply);
        assert_eq!(value["role"], "tool");
        assert_eq!(value["tool_call_id"], "c1");
    }
}
