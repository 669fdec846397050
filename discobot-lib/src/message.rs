//! UI message parts, the chat chunk protocol, and the chunk-to-message
//! assembler.
//!
//! Parts are an open union: the three known kinds round-trip as typed
//! values, anything else passes through as opaque JSON so newer agents can
//! emit part types this service does not know yet.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Message parts
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Known(KnownPart),
    /// Unrecognized part type, preserved verbatim.
    Other(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KnownPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "reasoning")]
    Reasoning { text: String },
    #[serde(rename = "dynamic-tool")]
    DynamicTool {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(
            rename = "errorText",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        error_text: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolState {
    #[serde(rename = "input-streaming")]
    InputStreaming,
    #[serde(rename = "input-available")]
    InputAvailable,
    #[serde(rename = "output-available")]
    OutputAvailable,
    #[serde(rename = "output-error")]
    OutputError,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Known(KnownPart::Text { text: text.into() })
    }

    /// Plain text content of a user message, concatenated over text parts.
    pub fn collect_text(parts: &[Part]) -> String {
        let mut out = String::new();
        for part in parts {
            if let Part::Known(KnownPart::Text { text }) = part {
                out.push_str(text);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Chat chunks (SSE wire protocol)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Chunk {
    Known(KnownChunk),
    /// Unknown chunk type: mirrored to clients, ignored by the assembler.
    Other(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KnownChunk {
    #[serde(rename = "start")]
    Start {
        #[serde(
            rename = "messageId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        message_id: Option<String>,
    },
    #[serde(rename = "text-start")]
    TextStart { id: String },
    #[serde(rename = "text-delta")]
    TextDelta { id: String, delta: String },
    #[serde(rename = "text-end")]
    TextEnd { id: String },
    #[serde(rename = "reasoning-start")]
    ReasoningStart { id: String },
    #[serde(rename = "reasoning-delta")]
    ReasoningDelta { id: String, delta: String },
    #[serde(rename = "reasoning-end")]
    ReasoningEnd { id: String },
    #[serde(rename = "tool-input-start")]
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    #[serde(rename = "tool-input-delta")]
    ToolInputDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "partialInput", default)]
        partial_input: String,
    },
    #[serde(rename = "tool-input-available")]
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    #[serde(rename = "tool-output-available")]
    ToolOutputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: Value,
    },
    #[serde(rename = "tool-output-error")]
    ToolOutputError {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "errorText", default)]
        error_text: String,
    },
    #[serde(rename = "finish")]
    Finish {
        #[serde(
            rename = "finishReason",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        finish_reason: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "errorText", default)]
        error_text: String,
    },
}

impl Chunk {
    pub fn parse(data: &str) -> Option<Chunk> {
        serde_json::from_str(data).ok()
    }

    /// `finish` and `error` end the completion.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Chunk::Known(KnownChunk::Finish { .. }) | Chunk::Known(KnownChunk::Error { .. })
        )
    }

    pub fn finish(reason: &str) -> Chunk {
        Chunk::Known(KnownChunk::Finish {
            finish_reason: Some(reason.to_string()),
        })
    }

    pub fn error(text: impl Into<String>) -> Chunk {
        Chunk::Known(KnownChunk::Error {
            error_text: text.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

struct OpenBlock {
    chunk_id: String,
    index: usize,
}

/// Folds a chunk sequence into the parts of one assistant message.
///
/// Invariants: one text part per text-start..text-end span, one reasoning
/// part per reasoning span, one dynamic-tool part per unique toolCallId.
/// A tool chunk arriving while a text block is open finalizes that block;
/// a subsequent delta for the same chunk id opens a fresh part.
#[derive(Default)]
pub struct MessageAssembler {
    pub message_id: Option<String>,
    parts: Vec<Part>,
    open_text: Option<OpenBlock>,
    open_reasoning: Option<OpenBlock>,
    tool_parts: HashMap<String, usize>,
    finish_reason: Option<String>,
    error_text: Option<String>,
    finished: bool,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub fn apply(&mut self, chunk: &Chunk) {
        let Chunk::Known(known) = chunk else {
            return;
        };
        match known {
            KnownChunk::Start { message_id } => {
                self.message_id = message_id.clone();
            }
            KnownChunk::TextStart { id } => {
                let index = self.push_part(Part::text(""));
                self.open_text = Some(OpenBlock {
                    chunk_id: id.clone(),
                    index,
                });
            }
            KnownChunk::TextDelta { id, delta } => {
                let index = match &self.open_text {
                    Some(open) if open.chunk_id == *id => open.index,
                    // No matching open block (interrupted by a tool call, or
                    // the start chunk was never seen): begin a new part.
                    _ => {
                        let index = self.push_part(Part::text(""));
                        self.open_text = Some(OpenBlock {
                            chunk_id: id.clone(),
                            index,
                        });
                        index
                    }
                };
                if let Part::Known(KnownPart::Text { text }) = &mut self.parts[index] {
                    text.push_str(delta);
                }
            }
            KnownChunk::TextEnd { id } => {
                if matches!(&self.open_text, Some(open) if open.chunk_id == *id) {
                    self.open_text = None;
                }
            }
            KnownChunk::ReasoningStart { id } => {
                let index = self.push_part(Part::Known(KnownPart::Reasoning {
                    text: String::new(),
                }));
                self.open_reasoning = Some(OpenBlock {
                    chunk_id: id.clone(),
                    index,
                });
            }
            KnownChunk::ReasoningDelta { id, delta } => {
                let index = match &self.open_reasoning {
                    Some(open) if open.chunk_id == *id => open.index,
                    _ => {
                        let index = self.push_part(Part::Known(KnownPart::Reasoning {
                            text: String::new(),
                        }));
                        self.open_reasoning = Some(OpenBlock {
                            chunk_id: id.clone(),
                            index,
                        });
                        index
                    }
                };
                if let Part::Known(KnownPart::Reasoning { text }) = &mut self.parts[index] {
                    text.push_str(delta);
                }
            }
            KnownChunk::ReasoningEnd { id } => {
                if matches!(&self.open_reasoning, Some(open) if open.chunk_id == *id) {
                    self.open_reasoning = None;
                }
            }
            KnownChunk::ToolInputStart {
                tool_call_id,
                tool_name,
            } => {
                self.interrupt_text();
                let part = Part::Known(KnownPart::DynamicTool {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    state: ToolState::InputStreaming,
                    input: None,
                    output: None,
                    error_text: None,
                });
                let index = self.push_part(part);
                self.tool_parts.insert(tool_call_id.clone(), index);
            }
            KnownChunk::ToolInputDelta {
                tool_call_id,
                partial_input,
            } => {
                self.interrupt_text();
                if let Some(KnownPart::DynamicTool { input, .. }) = self.tool_part(tool_call_id) {
                    // Partial input accumulates as a string until the full
                    // value arrives.
                    let mut buffer = match input.take() {
                        Some(Value::String(s)) => s,
                        _ => String::new(),
                    };
                    buffer.push_str(partial_input);
                    *input = Some(Value::String(buffer));
                }
            }
            KnownChunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => {
                self.interrupt_text();
                if !self.tool_parts.contains_key(tool_call_id) {
                    let part = Part::Known(KnownPart::DynamicTool {
                        tool_call_id: tool_call_id.clone(),
                        tool_name: tool_name.clone(),
                        state: ToolState::InputStreaming,
                        input: None,
                        output: None,
                        error_text: None,
                    });
                    let index = self.push_part(part);
                    self.tool_parts.insert(tool_call_id.clone(), index);
                }
                if let Some(KnownPart::DynamicTool {
                    state,
                    input: slot,
                    ..
                }) = self.tool_part(tool_call_id)
                {
                    *state = ToolState::InputAvailable;
                    *slot = Some(input.clone());
                }
            }
            KnownChunk::ToolOutputAvailable {
                tool_call_id,
                output,
            } => {
                if let Some(KnownPart::DynamicTool {
                    state,
                    output: slot,
                    ..
                }) = self.tool_part(tool_call_id)
                {
                    *state = ToolState::OutputAvailable;
                    *slot = Some(output.clone());
                }
            }
            KnownChunk::ToolOutputError {
                tool_call_id,
                error_text,
            } => {
                if let Some(KnownPart::DynamicTool {
                    state,
                    error_text: slot,
                    ..
                }) = self.tool_part(tool_call_id)
                {
                    *state = ToolState::OutputError;
                    *slot = Some(error_text.clone());
                }
            }
            KnownChunk::Finish { finish_reason } => {
                self.finish_reason = finish_reason.clone();
                self.finished = true;
            }
            KnownChunk::Error { error_text } => {
                self.error_text = Some(error_text.clone());
                self.finished = true;
            }
        }
    }

    /// Tool-call interruption rule: a tool chunk finalizes any open text
    /// block so later deltas start a fresh part.
    fn interrupt_text(&mut self) {
        self.open_text = None;
    }

    fn push_part(&mut self, part: Part) -> usize {
        self.parts.push(part);
        self.parts.len() - 1
    }

    fn tool_part(&mut self, tool_call_id: &str) -> Option<&mut KnownPart> {
        let index = *self.tool_parts.get(tool_call_id)?;
        match &mut self.parts[index] {
            Part::Known(known) => Some(known),
            Part::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply_all(chunks: &[Value]) -> MessageAssembler {
        let mut assembler = MessageAssembler::new();
        for raw in chunks {
            let chunk = Chunk::parse(&raw.to_string()).unwrap();
            assembler.apply(&chunk);
        }
        assembler
    }

    #[test]
    fn assembles_single_text_part() {
        let assembler = apply_all(&[
            json!({"type": "start", "messageId": "m1"}),
            json!({"type": "text-start", "id": "t1"}),
            json!({"type": "text-delta", "id": "t1", "delta": "Hello"}),
            json!({"type": "text-delta", "id": "t1", "delta": ", world"}),
            json!({"type": "text-end", "id": "t1"}),
            json!({"type": "finish", "finishReason": "stop"}),
        ]);
        assert!(assembler.is_finished());
        assert_eq!(assembler.finish_reason(), Some("stop"));
        assert_eq!(assembler.into_parts(), vec![Part::text("Hello, world")]);
    }

    #[test]
    fn tool_call_interrupts_open_text_part() {
        let assembler = apply_all(&[
            json!({"type": "text-start", "id": "t1"}),
            json!({"type": "text-delta", "id": "t1", "delta": "before"}),
            json!({"type": "tool-input-start", "toolCallId": "c1", "toolName": "bash"}),
            json!({"type": "tool-input-available", "toolCallId": "c1", "toolName": "bash", "input": {"cmd": "ls"}}),
            json!({"type": "tool-output-available", "toolCallId": "c1", "output": {"ok": true}}),
            json!({"type": "text-delta", "id": "t1", "delta": "after"}),
            json!({"type": "text-end", "id": "t1"}),
            json!({"type": "finish"}),
        ]);
        let parts = assembler.into_parts();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Part::text("before"));
        match &parts[1] {
            Part::Known(KnownPart::DynamicTool {
                tool_call_id,
                state,
                input,
                output,
                ..
            }) => {
                assert_eq!(tool_call_id, "c1");
                assert_eq!(*state, ToolState::OutputAvailable);
                assert_eq!(input.as_ref().unwrap(), &json!({"cmd": "ls"}));
                assert_eq!(output.as_ref().unwrap(), &json!({"ok": true}));
            }
            other => panic!("expected tool part, got {other:?}"),
        }
        assert_eq!(parts[2], Part::text("after"));
    }

    #[test]
    fn one_tool_part_per_call_id() {
        let assembler = apply_all(&[
            json!({"type": "tool-input-start", "toolCallId": "c1", "toolName": "bash"}),
            json!({"type": "tool-input-delta", "toolCallId": "c1", "partialInput": "{\"cm"}),
            json!({"type": "tool-input-delta", "toolCallId": "c1", "partialInput": "d\":1}"}),
            json!({"type": "tool-input-available", "toolCallId": "c1", "toolName": "bash", "input": {"cmd": 1}}),
            json!({"type": "tool-output-error", "toolCallId": "c1", "errorText": "boom"}),
            json!({"type": "finish"}),
        ]);
        let parts = assembler.into_parts();
        assert_eq!(parts.len(), 1);
        match &parts[0] {
            Part::Known(KnownPart::DynamicTool {
                state, error_text, ..
            }) => {
                assert_eq!(*state, ToolState::OutputError);
                assert_eq!(error_text.as_deref(), Some("boom"));
            }
            other => panic!("expected tool part, got {other:?}"),
        }
    }

    #[test]
    fn reasoning_mirrors_into_reasoning_part() {
        let assembler = apply_all(&[
            json!({"type": "reasoning-start", "id": "r1"}),
            json!({"type": "reasoning-delta", "id": "r1", "delta": "thinking"}),
            json!({"type": "reasoning-end", "id": "r1"}),
            json!({"type": "finish"}),
        ]);
        assert_eq!(
            assembler.into_parts(),
            vec![Part::Known(KnownPart::Reasoning {
                text: "thinking".into()
            })]
        );
    }

    #[test]
    fn error_chunk_terminates_assembly() {
        let assembler = apply_all(&[
            json!({"type": "text-start", "id": "t1"}),
            json!({"type": "error", "errorText": "agent died"}),
        ]);
        assert!(assembler.is_finished());
    }

    #[test]
    fn unknown_chunks_are_ignored_but_parse() {
        let chunk = Chunk::parse(r#"{"type":"telemetry","v":1}"#).unwrap();
        assert!(matches!(chunk, Chunk::Other(_)));
        assert!(!chunk.is_terminal());
        let mut assembler = MessageAssembler::new();
        assembler.apply(&chunk);
        assert!(assembler.into_parts().is_empty());
    }

    #[test]
    fn unknown_part_round_trips_verbatim() {
        let raw = json!({"type": "image", "url": "https://example.test/x.png", "alt": null});
        let part: Part = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(part, Part::Other(_)));
        assert_eq!(serde_json::to_value(&part).unwrap(), raw);
    }

    #[test]
    fn chunk_wire_shape_uses_camel_case() {
        let chunk = Chunk::Known(KnownChunk::ToolInputStart {
            tool_call_id: "c9".into(),
            tool_name: "grep".into(),
        });
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "tool-input-start", "toolCallId": "c9", "toolName": "grep"})
        );
    }
}
