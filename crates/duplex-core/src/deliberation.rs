use std::sync::Arc;

use duplex_domain::BoxStream;
use futures_util::StreamExt;

use crate::cancellation::CancelToken;
use crate::speech_planner::prefix_if_needed;

/// A token-streaming language model. Implementations surface mid-stream
/// failures as an `Err` item rather than ending the stream silently, so the
/// fast path can yield a fallback sentence instead of trailing off.
#[async_trait::async_trait]
pub trait LanguageModelCollaborator: Send + Sync {
    async fn stream(
        &self,
        prompt: &str,
        token: CancelToken,
    ) -> BoxStream<'static, Result<String, String>>;
}

/// A slower collaborator consulted only by Stage B's gather step. Results
/// are returned as ordered `(name, text)` pairs — ordering matters, since
/// the additive refinement is built from the first entry.
#[async_trait::async_trait]
pub trait ToolCollaborator: Send + Sync {
    async fn call(&self, input: &str, token: CancelToken) -> Vec<(String, String)>;
}

/// Gathered alongside the tool collaborator for completeness, but its
/// output never feeds the additive refinement — only the tool
/// collaborator's results do.
#[async_trait::async_trait]
pub trait AgentCollaborator: Send + Sync {
    async fn call(&self, input: &str, token: CancelToken) -> Vec<(String, String)>;
}

const NEGATION_TOKENS: [&str; 3] = [" not ", "incorrect", "wrong"];
const ABSOLUTE_TOKENS: [&str; 3] = ["always", "definitely", "certainly"];
const ADDITIVE_MAX_CHARS: usize = 180;

const FALLBACK_SENTENCE: &str =
    "I'm sorry, I hit a snag trying to think that through. Could you ask me again?";

/// Truncates to at most `max_chars` characters on a char boundary, then
/// trims whitespace from both ends.
fn truncate_and_trim(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect::<String>().trim().to_string()
}

/// Builds the additive refinement from the first available tool result,
/// suppressing it if it would contradict the fast response already spoken.
fn build_additive_refinement(fast_response: &str, tool_results: &[(String, String)]) -> Option<String> {
    let (_, raw) = tool_results.first()?;
    let additive = truncate_and_trim(raw, ADDITIVE_MAX_CHARS);
    if additive.is_empty() {
        return None;
    }

    let additive_lower = additive.to_lowercase();
    let fast_lower = fast_response.to_lowercase();
    let negates = NEGATION_TOKENS.iter().any(|t| additive_lower.contains(t));
    let was_absolute = ABSOLUTE_TOKENS.iter().any(|t| fast_lower.contains(t));
    if negates && was_absolute {
        tracing::debug!("additive refinement suppressed by contradiction guard");
        duplex_domain::TraceEvent::StageBRefinementSuppressed {
            reason: "negation vs absolute framing".to_string(),
        }
        .emit();
        return None;
    }

    Some(additive)
}

/// Produces a raw token stream in two stages: a fast path that speaks as
/// soon as the language model does, and a slower gather that may append one
/// more sentence once tool results are back. The gather races the fast
/// path rather than blocking it — Stage B's tokens only ever reach the
/// caller after Stage A's have been fully emitted.
///
/// Output is plain text tokens, not pre-built Speech Acts — the Speech
/// Planner downstream is what turns this into timed, interruptible acts.
pub struct ProgressiveDeliberation {
    llm: Arc<dyn LanguageModelCollaborator>,
    tools: Arc<dyn ToolCollaborator>,
    agents: Arc<dyn AgentCollaborator>,
}

impl ProgressiveDeliberation {
    pub fn new(
        llm: Arc<dyn LanguageModelCollaborator>,
        tools: Arc<dyn ToolCollaborator>,
        agents: Arc<dyn AgentCollaborator>,
    ) -> Self {
        Self { llm, tools, agents }
    }

    pub fn think_progressive(
        &self,
        fast_prompt: String,
        gather_input: String,
        token: CancelToken,
    ) -> BoxStream<'static, String> {
        let llm = self.llm.clone();
        let tools = self.tools.clone();
        let agents = self.agents.clone();

        Box::pin(async_stream::stream! {
            let gather_token = token.clone();
            let gather_input_clone = gather_input.clone();
            let gather_task = tokio::spawn(async move {
                let _agent_results = agents.call(&gather_input_clone, gather_token.clone()).await;
                tools.call(&gather_input_clone, gather_token).await
            });

            let mut fast_response = String::new();
            let mut fatal = false;

            let mut stream = llm.stream(&fast_prompt, token.clone()).await;
            while let Some(item) = stream.next().await {
                if token.is_cancelled() {
                    break;
                }
                match item {
                    Ok(tok) => {
                        fast_response.push_str(&tok);
                        yield tok;
                    }
                    Err(reason) => {
                        tracing::warn!(reason = %reason, "stage a collaborator failed");
                        duplex_domain::TraceEvent::StageATokenError { reason: reason.clone() }.emit();
                        yield FALLBACK_SENTENCE.to_string();
                        fatal = true;
                        break;
                    }
                }
            }

            if fatal || token.is_cancelled() {
                gather_task.abort();
                return;
            }

            let tool_results = gather_task.await.unwrap_or_default();
            if let Some(refinement) = build_additive_refinement(&fast_response, &tool_results) {
                yield "\n\n".to_string();
                yield prefix_if_needed(&refinement);
            }
        })
    }
}
