//! Session transcripts: rendering and update notifications
//!
//! Transcripts are append-only JSONL files, one message per line. Indexing
//! works over a plain-text rendering (`role: text`), with a [`LineMap`] that
//! translates rendered line numbers back to the message's line in the
//! original file.
//!
//! The transcript *writer* lives in the host; this crate only consumes its
//! "a transcript file grew" notifications via a process-wide event bus.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::chunker::LineMap;

/// Notification that a session transcript file was appended to.
#[derive(Debug, Clone)]
pub struct SessionTranscriptEvent {
    pub session_file: PathBuf,
}

static SESSION_BUS: Lazy<broadcast::Sender<SessionTranscriptEvent>> =
    Lazy::new(|| broadcast::channel(256).0);

/// Subscribe to transcript-update notifications. Dropping the receiver
/// unsubscribes.
pub fn subscribe_session_transcript_updates() -> broadcast::Receiver<SessionTranscriptEvent> {
    SESSION_BUS.subscribe()
}

/// Emit a transcript-update notification. Whitespace is trimmed; empty paths
/// are dropped.
pub fn emit_session_transcript_update(session_file: &str) {
    let trimmed = session_file.trim();
    if trimmed.is_empty() {
        return;
    }
    // Send fails only when nobody is subscribed, which is fine.
    let _ = SESSION_BUS.send(SessionTranscriptEvent {
        session_file: PathBuf::from(trimmed),
    });
}

/// Per-agent state directory: `<state_dir>/agents/<agent_id>`.
pub fn resolve_agent_dir(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join("agents").join(agent_id)
}

/// Where an agent's session transcripts live.
pub fn resolve_session_transcripts_dir_for_agent(state_dir: &Path, agent_id: &str) -> PathBuf {
    resolve_agent_dir(state_dir, agent_id).join("sessions")
}

/// A transcript rendered to plain text for chunking.
#[derive(Debug, Clone, Default)]
pub struct RenderedTranscript {
    pub text: String,
    pub line_map: LineMap,
}

/// Render a JSONL transcript to `role: text` lines.
///
/// Each rendered line records the 1-based source line of the message it came
/// from. Lines that are not JSON objects (partial writes, headers) pass
/// through verbatim. Messages without extractable text are skipped.
pub fn render_transcript(raw: &str) -> RenderedTranscript {
    let mut rendered = RenderedTranscript::default();

    for (idx, line) in raw.lines().enumerate() {
        let source_line = idx as u32 + 1;
        if line.trim().is_empty() {
            continue;
        }

        let value: Option<Value> = serde_json::from_str(line).ok();
        match value {
            Some(Value::Object(obj)) => {
                let role = message_role(&obj).unwrap_or("message");
                let Some(text) = message_text(&obj) else {
                    continue;
                };
                for (i, text_line) in text.lines().enumerate() {
                    if i == 0 {
                        push_line(&mut rendered, &format!("{role}: {text_line}"), source_line);
                    } else {
                        push_line(&mut rendered, text_line, source_line);
                    }
                }
            }
            _ => push_line(&mut rendered, line, source_line),
        }
    }

    rendered
}

fn push_line(rendered: &mut RenderedTranscript, line: &str, source_line: u32) {
    if !rendered.text.is_empty() {
        rendered.text.push('\n');
    }
    rendered.text.push_str(line);
    rendered.line_map.push(source_line);
}

fn message_role(obj: &serde_json::Map<String, Value>) -> Option<&str> {
    if let Some(role) = obj.get("role").and_then(Value::as_str) {
        return Some(role);
    }
    obj.get("message")?.get("role")?.as_str()
}

/// Extract the text content of a message object. Content may be a plain
/// string or an array of `{type: "text", text}` parts.
fn message_text(obj: &serde_json::Map<String, Value>) -> Option<String> {
    let content = obj
        .get("content")
        .or_else(|| obj.get("message").and_then(|m| m.get("content")))?;

    let text = match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let collected: Vec<&str> = parts
                .iter()
                .filter(|p| {
                    p.get("type")
                        .and_then(Value::as_str)
                        .map(|t| t == "text")
                        .unwrap_or(true)
                })
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            collected.join("\n")
        }
        _ => return None,
    };

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
