use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use duplex_core::{
    AgentCollaborator, CancelToken, ConversationState, DuplexSession, DuplexSessionConfig,
    LanguageModelCollaborator, ProgressiveDeliberation, SpeechAct, StopTtsSink, TaskCategory,
    TokenSource, ToolCollaborator, TtsSink,
};
use duplex_domain::{BoxStream, Config, ConfigSeverity, Error};
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "duplex-demo", about = "Exercises a Duplex Session against in-memory stub collaborators")]
struct Cli {
    /// Path to a TOML config file; falls back to built-in defaults if absent.
    #[arg(long, default_value = "duplex.toml")]
    config: PathBuf,

    /// What the "user" said, fed to the fast-path token source as a stand-in
    /// for a live microphone.
    #[arg(long, default_value = "What's the weather like in Boston today?")]
    prompt: String,
}

/// Feeds a fixed reply word by word, the way a streaming LLM hands the
/// planner whole-word tokens rather than characters.
struct WordTokenSource {
    words: std::vec::IntoIter<String>,
}

impl WordTokenSource {
    fn new(text: &str) -> Self {
        let words = text.split_inclusive(' ').map(str::to_string).collect::<Vec<_>>();
        Self {
            words: words.into_iter(),
        }
    }
}

#[async_trait::async_trait]
impl TokenSource for WordTokenSource {
    async fn next_token(&mut self) -> Option<String> {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        self.words.next()
    }
}

/// Wraps a boxed string stream (e.g. `ProgressiveDeliberation::think_progressive`'s
/// output) as a `TokenSource` the Speech Planner can consume.
struct StreamTokenSource {
    inner: BoxStream<'static, String>,
}

#[async_trait::async_trait]
impl TokenSource for StreamTokenSource {
    async fn next_token(&mut self) -> Option<String> {
        self.inner.next().await
    }
}

/// A language model stand-in that streams a fixed reply word by word.
struct StubLlm {
    reply: String,
}

#[async_trait::async_trait]
impl LanguageModelCollaborator for StubLlm {
    async fn stream(
        &self,
        _prompt: &str,
        _token: CancelToken,
    ) -> BoxStream<'static, Result<String, String>> {
        let words: Vec<Result<String, String>> = self
            .reply
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Box::pin(async_stream::stream! {
            for word in words {
                tokio::time::sleep(std::time::Duration::from_millis(15)).await;
                yield word;
            }
        })
    }
}

/// A tool collaborator stand-in returning one canned result, simulating a
/// weather lookup that finishes partway through the fast-path stream.
struct StubTools;

#[async_trait::async_trait]
impl ToolCollaborator for StubTools {
    async fn call(&self, _input: &str, _token: CancelToken) -> Vec<(String, String)> {
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        vec![("weather".to_string(), "Rain is expected after 4pm.".to_string())]
    }
}

struct StubAgents;

#[async_trait::async_trait]
impl AgentCollaborator for StubAgents {
    async fn call(&self, _input: &str, _token: CancelToken) -> Vec<(String, String)> {
        Vec::new()
    }
}

struct StdoutTtsSink;

#[async_trait::async_trait]
impl TtsSink for StdoutTtsSink {
    async fn send(&self, act: SpeechAct) -> Result<(), Error> {
        println!("[{:?}] {}", act.kind, act.text);
        Ok(())
    }
}

struct LoggingStopSink;

#[async_trait::async_trait]
impl StopTtsSink for LoggingStopSink {
    async fn stop(&self) {
        println!("(tts stopped)");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load_or_default(&cli.config);

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed, see logged errors above");
    }

    let session = Arc::new(DuplexSession::new(config, DuplexSessionConfig::default()));
    session.set_tts_sink(Arc::new(StdoutTtsSink));
    session.set_stop_tts_sink(Arc::new(LoggingStopSink));

    tracing::info!(session_id = session.session_id(), "session ready");
    session.record_user_turn(cli.prompt.clone());

    let speaking_session = session.clone();
    let source = Box::new(WordTokenSource::new(&cli.prompt));
    let speak_handle = tokio::spawn(async move { speaking_session.speak(source, true).await });

    // Demonstrate barge-in: interrupt the reply partway through.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    session.barge_in(Some("actually never mind".into())).await;

    let delivered = speak_handle.await?;
    println!("delivered {} act(s) before stopping", delivered.len());
    if let Some(draft) = session.get_interrupted_draft() {
        println!("interrupted draft: {draft}");
    }

    // Run a progressive deliberation turn: fast-path tokens stream straight
    // into the planner, and the tool collaborator's result (if any) lands
    // as a single additive refinement after the fast path closes.
    let deliberation = ProgressiveDeliberation::new(
        Arc::new(StubLlm {
            reply: "It will definitely be sunny this afternoon.".to_string(),
        }),
        Arc::new(StubTools),
        Arc::new(StubAgents),
    );
    let turn_token = CancelToken::new();
    let raw_tokens = deliberation.think_progressive(
        cli.prompt.clone(),
        cli.prompt.clone(),
        turn_token,
    );
    let source = Box::new(StreamTokenSource { inner: raw_tokens });
    let delivered = session.speak(source, false).await;
    println!("deliberated turn delivered {} act(s)", delivered.len());

    // Exercise the task registry's backpressure rejection path, then drain
    // the resulting event onto the speech channel.
    for i in 0..3 {
        let accepted = session
            .try_create_tracked_task(TaskCategory::Background, Default::default(), |token| async move {
                token.wait().await;
            })
            .is_some();
        tracing::info!(attempt = i, accepted, "background task submission");
    }
    let woven_in = session.drain_events_to_speech(5).await;
    for act in &woven_in {
        println!("[background] {}", act.text);
    }

    let metrics = session.get_metrics();
    println!(
        "final state: {:?}, barge-ins: {}, speech acts: {}",
        metrics.state, metrics.total_barge_ins, metrics.total_speech_acts
    );
    debug_assert_ne!(metrics.state, ConversationState::FullDuplex);

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
