//! Reasoning stage: provider contract, tool execution, and the bounded
//! reply loop.
//!
//! The loop is: send history to the provider, stream the reply, execute any
//! requested tool calls, and continue until the provider stops or the
//! tool-step cap is reached. Sentences are handed to synthesis as they
//! complete, so audio starts before the full reply exists.

pub mod http;

use crate::error::{AgentError, Result};
use crate::events::SessionEvent;
use crate::pipeline::messages::{ControlEvent, SentenceChunk};
use async_trait::async_trait;
use futures_util::Stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Why a provider stream finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the reply.
    Stop,
    /// The provider wants the accumulated tool calls executed.
    ToolCalls,
}

/// A single event streamed by a reasoning provider.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A decoded text fragment of the reply.
    TextDelta {
        /// Text fragment.
        text: String,
    },
    /// A tool call opened.
    ToolCallStart {
        /// Provider-assigned call id.
        call_id: String,
        /// Tool name.
        name: String,
    },
    /// A fragment of a tool call's JSON arguments.
    ToolCallArgsDelta {
        /// Call the fragment belongs to.
        call_id: String,
        /// Argument text fragment.
        args_fragment: String,
    },
    /// A tool call's arguments are complete.
    ToolCallEnd {
        /// Completed call.
        call_id: String,
    },
    /// The stream finished.
    StreamEnd {
        /// Why it finished.
        finish_reason: FinishReason,
    },
}

/// Stream of provider events.
pub type LlmEventStream = Pin<Box<dyn Stream<Item = Result<LlmEvent>> + Send>>;

/// Message role in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// System prompt.
    System,
    /// User turn.
    User,
    /// Agent reply.
    Assistant,
    /// Tool result.
    Tool,
}

/// A tool call recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// One message of the conversation history.
#[derive(Debug, Clone)]
pub struct Message {
    /// Role of the author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Tool calls attached to an assistant message.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Call id a tool-result message answers.
    pub tool_call_id: Option<String>,
}

impl Message {
    /// System prompt message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// User turn message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant reply message, optionally carrying tool calls.
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRecord>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool result message answering `call_id`.
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Declaration of a tool offered to the provider.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: serde_json::Value,
}

/// Outcome of executing one tool.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Textual result handed back to the provider.
    pub content: String,
    /// Whether the tool reported success.
    pub success: bool,
}

impl ToolOutcome {
    /// Successful outcome.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
        }
    }

    /// Failed outcome. Failures are conversation content, not errors; the
    /// provider decides how to proceed.
    pub fn failure(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: false,
        }
    }
}

/// A tool the reasoning stage may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declaration offered to the provider.
    fn definition(&self) -> ToolDefinition;

    /// Execute with parsed JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; domain-level
    /// failures should be a [`ToolOutcome::failure`].
    async fn execute(&self, args: serde_json::Value) -> Result<ToolOutcome>;
}

/// Registry of tools available to one session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its declared name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.definition().name, tool);
    }

    /// Declarations of every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool by name with raw JSON arguments.
    ///
    /// Unknown tools and malformed arguments produce failure outcomes so
    /// the conversation can continue.
    pub async fn execute(&self, name: &str, args_json: &str) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::failure(format!("unknown tool: {name}"));
        };
        let args: serde_json::Value = match serde_json::from_str(args_json) {
            Ok(v) => v,
            Err(e) => return ToolOutcome::failure(format!("invalid tool arguments: {e}")),
        };
        match tool.execute(args).await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::failure(format!("tool execution failed: {e}")),
        }
    }
}

/// Streaming reasoning provider contract.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Stream a reply to the given history, offering `tools`.
    ///
    /// # Errors
    ///
    /// Returns a connection or LLM error if the provider rejects the
    /// request.
    async fn respond(&self, messages: &[Message], tools: &[ToolDefinition])
    -> Result<LlmEventStream>;
}

/// Accumulates streamed text and emits complete sentences.
#[derive(Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    /// Fresh splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a text fragment; returns any sentences completed by it.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);
        let mut sentences = Vec::new();
        loop {
            let Some(end) = sentence_boundary(&self.buffer) else {
                break;
            };
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
        }
        sentences
    }

    /// Flush whatever remains as a final (possibly unterminated) sentence.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() { None } else { Some(rest.to_owned()) }
    }
}

/// Byte offset just past the first complete sentence, if any.
fn sentence_boundary(text: &str) -> Option<usize> {
    let mut iter = text.char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            // Only split when followed by whitespace (or more terminators),
            // so "3.5" and "v1.2" stay intact.
            match iter.peek() {
                Some((_, next)) if next.is_whitespace() => {
                    return Some(i + c.len_utf8() + 1);
                }
                _ => {}
            }
        }
    }
    None
}

/// Why [`run_reply`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The provider finished naturally.
    Complete,
    /// The tool-step cap terminated the loop; the partial reply was
    /// surfaced.
    ToolStepCapReached,
    /// Barge-in interrupted the stream mid-reply.
    Interrupted,
}

/// A tool call executed during one reply.
#[derive(Debug, Clone)]
pub struct ExecutedToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    pub args: String,
    /// Whether the tool reported success.
    pub success: bool,
}

/// Complete output of one reply loop.
#[derive(Debug, Clone)]
pub struct ReplyOutput {
    /// Full reply text (possibly partial when capped or interrupted).
    pub text: String,
    /// Tool calls executed, in order.
    pub tool_calls: Vec<ExecutedToolCall>,
    /// Why the loop stopped.
    pub stop: StopReason,
}

/// Everything the reply loop needs besides the provider and history.
pub struct ReplyContext<'a> {
    /// Tool registry for this session.
    pub registry: &'a ToolRegistry,
    /// Maximum number of tool executions for this reply.
    pub max_tool_steps: u32,
    /// Utterance id assigned to this reply.
    pub utterance_id: u64,
    /// Sink for completed sentences (drives synthesis).
    pub sentence_tx: &'a mpsc::Sender<SentenceChunk>,
    /// Control events to the state machine.
    pub control_tx: &'a mpsc::UnboundedSender<ControlEvent>,
    /// Session event broadcast, if anyone is listening.
    pub events: Option<&'a broadcast::Sender<SessionEvent>>,
    /// Barge-in flag; checked between stream events.
    pub interrupt: &'a AtomicBool,
}

/// In-progress tool call being accumulated from stream events.
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args: String,
}

/// Run one bounded reply loop: stream, hand off sentences, execute tools,
/// repeat until the provider stops or the cap is reached.
///
/// Appends the assistant turn (and any tool traffic) to `history`.
///
/// # Errors
///
/// Returns an error when the provider fails outright; tool failures and
/// the tool-step cap are recovered within the loop.
pub async fn run_reply(
    engine: &dyn ReasoningEngine,
    history: &mut Vec<Message>,
    ctx: ReplyContext<'_>,
) -> Result<ReplyOutput> {
    let definitions = ctx.registry.definitions();
    let mut splitter = SentenceSplitter::new();
    let mut reply_text = String::new();
    let mut executed: Vec<ExecutedToolCall> = Vec::new();
    let mut steps_used: u32 = 0;
    let mut announced = false;

    'rounds: loop {
        let mut stream = engine.respond(history, &definitions).await?;
        let mut round_text = String::new();
        let mut pending: Vec<PendingToolCall> = Vec::new();
        let mut finish = FinishReason::Stop;

        while let Some(event) = stream.next().await {
            if ctx.interrupt.load(Ordering::Relaxed) {
                drop(stream);
                let mut text = reply_text;
                text.push_str(&round_text);
                finalize_history(history, &text);
                return Ok(ReplyOutput {
                    text,
                    tool_calls: executed,
                    stop: StopReason::Interrupted,
                });
            }
            match event? {
                LlmEvent::TextDelta { text } => {
                    round_text.push_str(&text);
                    for sentence in splitter.push(&text) {
                        emit_sentence(&ctx, &mut announced, sentence, false).await?;
                    }
                }
                LlmEvent::ToolCallStart { call_id, name } => {
                    pending.push(PendingToolCall {
                        id: call_id,
                        name,
                        args: String::new(),
                    });
                }
                LlmEvent::ToolCallArgsDelta {
                    call_id,
                    args_fragment,
                } => {
                    if let Some(call) = pending.iter_mut().find(|c| c.id == call_id) {
                        call.args.push_str(&args_fragment);
                    }
                }
                LlmEvent::ToolCallEnd { .. } => {}
                LlmEvent::StreamEnd { finish_reason } => {
                    finish = finish_reason;
                    break;
                }
            }
        }

        reply_text.push_str(&round_text);

        match finish {
            FinishReason::Stop => {
                // Only the final round's text goes on the history here;
                // tool rounds already recorded theirs.
                finalize_history(history, &round_text);
                break 'rounds;
            }
            FinishReason::ToolCalls => {
                let records: Vec<ToolCallRecord> = pending
                    .iter()
                    .map(|c| ToolCallRecord {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        arguments: c.args.clone(),
                    })
                    .collect();
                history.push(Message::assistant(round_text.clone(), records));

                let mut pending_iter = pending.into_iter();
                while let Some(call) = pending_iter.next() {
                    if steps_used >= ctx.max_tool_steps {
                        // Cap reached: terminate the loop, surface what we
                        // have, and let the session continue. Unexecuted
                        // calls still get answers so the history stays
                        // well-formed for the next round-trip.
                        warn!(
                            max = ctx.max_tool_steps,
                            "tool-step cap reached, surfacing partial reply"
                        );
                        if let Some(events) = ctx.events {
                            let _ = events.send(SessionEvent::ToolStepCapReached {
                                max: ctx.max_tool_steps,
                            });
                        }
                        history.push(Message::tool(
                            call.id,
                            "not executed: tool-step cap reached",
                        ));
                        for rest in pending_iter {
                            history.push(Message::tool(
                                rest.id,
                                "not executed: tool-step cap reached",
                            ));
                        }
                        flush_final(&mut splitter, &ctx, &mut announced, &reply_text).await?;
                        return Ok(ReplyOutput {
                            text: reply_text,
                            tool_calls: executed,
                            stop: StopReason::ToolStepCapReached,
                        });
                    }
                    steps_used += 1;
                    if let Some(events) = ctx.events {
                        let _ = events.send(SessionEvent::ToolCall {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input_json: call.args.clone(),
                        });
                    }
                    let outcome = ctx.registry.execute(&call.name, &call.args).await;
                    info!(
                        tool = %call.name,
                        success = outcome.success,
                        "tool call executed"
                    );
                    if let Some(events) = ctx.events {
                        let _ = events.send(SessionEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            success: outcome.success,
                        });
                    }
                    history.push(Message::tool(call.id.clone(), outcome.content.clone()));
                    executed.push(ExecutedToolCall {
                        id: call.id,
                        name: call.name,
                        args: call.args,
                        success: outcome.success,
                    });
                }
            }
        }
    }

    flush_final(&mut splitter, &ctx, &mut announced, &reply_text).await?;
    Ok(ReplyOutput {
        text: reply_text,
        tool_calls: executed,
        stop: StopReason::Complete,
    })
}

/// Send one sentence downstream, announcing the reply on the first.
async fn emit_sentence(
    ctx: &ReplyContext<'_>,
    announced: &mut bool,
    text: String,
    is_final: bool,
) -> Result<()> {
    if !*announced {
        *announced = true;
        let _ = ctx.control_tx.send(ControlEvent::ReplyStarted {
            utterance_id: ctx.utterance_id,
        });
    }
    if let Some(events) = ctx.events {
        let _ = events.send(SessionEvent::AgentSentence {
            text: text.clone(),
            is_final,
            utterance_id: ctx.utterance_id,
        });
    }
    ctx.sentence_tx
        .send(SentenceChunk {
            text,
            is_final,
            utterance_id: ctx.utterance_id,
        })
        .await
        .map_err(|_| AgentError::Channel("sentence channel closed".to_owned()))
}

/// Flush the splitter and terminate the utterance downstream.
///
/// When the reply produced no text at all, nothing is sent; the caller
/// reports an empty reply instead.
async fn flush_final(
    splitter: &mut SentenceSplitter,
    ctx: &ReplyContext<'_>,
    announced: &mut bool,
    reply_text: &str,
) -> Result<()> {
    if let Some(rest) = splitter.flush() {
        return emit_sentence(ctx, announced, rest, true).await;
    }
    if reply_text.trim().is_empty() {
        return Ok(());
    }
    // All sentences already went out; send an empty end marker so synthesis
    // can close the utterance.
    emit_sentence(ctx, announced, String::new(), true).await
}

/// Record an assistant turn on the history (capped/interrupted replies
/// keep their partial text).
fn finalize_history(history: &mut Vec<Message>, text: &str) {
    if !text.trim().is_empty() {
        history.push(Message::assistant(text.to_owned(), Vec::new()));
    }
}
