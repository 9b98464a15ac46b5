//! Core data model: the artifacts one conversational turn produces and the
//! observable session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::detector::CompletionSignal;

/// Login state observed on the page; never mutated by credential entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginState {
    Unknown,
    LoggedIn,
    LoggedOut,
}

/// One remote conversation from the sidebar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub title: String,
    pub url: String,
    pub last_active: Option<DateTime<Utc>>,
}

/// A generated image observed in an assistant turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageInfo {
    pub url: String,
    pub alt: String,
    pub prompt_title: String,
    pub local_path: Option<PathBuf>,
}

/// One decoded tool invocation from assistant text.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    /// `call_` + 24 hex characters, generated locally; the remote app has
    /// no id concept.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool the caller offers for this turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// How echo recovery resolved the extracted text.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoStatus {
    /// No injected-instruction marker was present.
    Clean,
    /// Marker was present; a re-extract after the grace period succeeded.
    Recovered,
    /// Marker persisted; the reply is the best-effort remainder after
    /// stripping through the marker block.
    Stripped,
}

/// A single upload that failed without aborting the batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadFailure {
    pub source: String,
    pub reason: String,
}

/// Terminal artifact of one completed turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    pub thread_id: String,
    pub elapsed_ms: u64,
    /// Which detector watcher declared the turn complete.
    pub signal: CompletionSignal,
    pub images: Vec<ImageInfo>,
    pub tool_calls: Vec<ToolCall>,
    pub failed_attachments: Vec<UploadFailure>,
    pub echo: EchoStatus,
}

/// Snapshot surfaced by the status endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionStatus {
    pub logged_in: bool,
    pub login_state: LoginState,
    pub current_thread_id: Option<String>,
    pub busy: bool,
}

/// Role of a transcript turn supplied by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One flattened turn of caller-supplied history. The remote app has no
/// structured multi-turn input, so these get rendered into a single
/// transcript string before sending.
#[derive(Clone, Debug)]
pub struct TranscriptTurn {
    pub role: Role,
    pub text: String,
    /// Set on `Tool` turns: which call this result answers.
    pub tool_call_id: Option<String>,
    /// Set on assistant turns that previously requested tool calls:
    /// (name, serialized arguments).
    pub tool_calls: Vec<(String, String)>,
}

impl TranscriptTurn {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }
}
