use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// A boxed, send-able, owned stream — the shape every collaborator boundary
/// in this crate speaks in.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// A boxed, send-able, owned future — used for work items handed to the task
/// registry and the deadline scheduler.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// One update in a tool's execution, as reported by the host's tool runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProgress {
    pub state: ToolProgressState,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ToolProgress {
    pub fn new(state: ToolProgressState, tool_name: impl Into<String>) -> Self {
        Self {
            state,
            tool_name: tool_name.into(),
            message: None,
            result: None,
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolProgressState {
    Starting,
    Working,
    Completed,
    Cancelled,
    Error,
}

/// Token usage accounting, passed through from a language-model collaborator
/// when it is available. Entirely advisory — the core never acts on it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}
