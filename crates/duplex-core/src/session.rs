use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duplex_domain::{BoxStream, Config, Error, TraceEvent};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::cancellation::CancelToken;
use crate::controller::{ConversationController, ConversationState, StopTtsSink, TtsSink};
use crate::event_bus::{AttentionEvent, AttentionEventBus, EventBusStats};
use crate::registry::{TaskCategory, TaskHandle, TaskRegistry};
use crate::scheduler::{DeadlineScheduler, SchedulerPriority, SchedulerStats};
use crate::speech_planner::{SpeechAct, SpeechPlanner};
use crate::vad::VoiceActivityDetector;

/// Session-identity fields. Every component tunable lives on the shared
/// `Config` instead — this stays intentionally thin so there is exactly
/// one place (`Config`) that owns the numbers a host might want to tune.
#[derive(Debug, Clone)]
pub struct DuplexSessionConfig {
    pub conversation_id: String,
    pub user_id: Option<String>,
}

impl Default for DuplexSessionConfig {
    fn default() -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub session_id: String,
    pub conversation_id: String,
    pub state: ConversationState,
    pub is_tts_playing: bool,
    pub total_speech_acts: u64,
    pub total_barge_ins: u64,
    pub created_at: DateTime<Utc>,
    pub event_bus: EventBusStats,
    pub scheduler: SchedulerStats,
}

struct SessionInner {
    config: Config,
    session_id: String,
    conversation_id: String,
    created_at: DateTime<Utc>,
    registry: TaskRegistry,
    bus: Arc<AttentionEventBus>,
    scheduler: Arc<DeadlineScheduler>,
    tts_sink: RwLock<Option<Arc<dyn TtsSink>>>,
    stop_tts_sink: RwLock<Option<Arc<dyn StopTtsSink>>>,
    is_tts_playing: AtomicBool,
    last_barge_in: Mutex<Option<DateTime<Utc>>>,
    total_speech_acts: AtomicU64,
    total_barge_ins: AtomicU64,
}

impl SessionInner {
    /// Cancels in-flight tasks and jobs and stops any playing audio, gated
    /// by `barge_in_cooldown_ms` so a burst of barge-in signals (the VAD
    /// firing repeatedly, or a host calling `barge_in` in a loop) only
    /// produces bookkeeping once per cooldown window.
    async fn handle_barge_in(&self) {
        let now = Utc::now();
        {
            let mut last = self.last_barge_in.lock();
            if let Some(prev) = *last {
                let elapsed_ms = (now - prev).num_milliseconds().max(0) as u64;
                if elapsed_ms < self.config.session.barge_in_cooldown_ms {
                    tracing::debug!(elapsed_ms, "barge-in bookkeeping skipped, within cooldown");
                    return;
                }
            }
            *last = Some(now);
        }

        let count = self.total_barge_ins.fetch_add(1, Ordering::Relaxed) + 1;
        self.is_tts_playing.store(false, Ordering::Relaxed);
        self.registry.cancel_all(None);
        self.scheduler.cancel_all(None);

        if let Some(sink) = self.stop_tts_sink.read().clone() {
            sink.stop().await;
        }

        TraceEvent::BargeIn {
            session_id: self.session_id.clone(),
            barge_in_count: count,
        }
        .emit();
    }

    fn handle_state_change(&self, state: ConversationState) {
        match state {
            ConversationState::Speaking | ConversationState::FullDuplex => {
                self.is_tts_playing.store(true, Ordering::Relaxed);
            }
            _ => self.is_tts_playing.store(false, Ordering::Relaxed),
        }
    }
}

/// Aggregate root wiring the Speech Planner, VAD gate, Conversation
/// Controller, Task Registry, Attention Event Bus, and Deadline Scheduler
/// into one session. The Controller is constructed with closures bound
/// back into this session's bookkeeping rather than holding a reference to
/// it, avoiding a cyclic ownership between the two.
pub struct DuplexSession {
    inner: Arc<SessionInner>,
    controller: ConversationController,
}

impl DuplexSession {
    pub fn new(config: Config, session_config: DuplexSessionConfig) -> Self {
        let bus = Arc::new(AttentionEventBus::new(config.event_bus.capacity));
        let registry = TaskRegistry::new(config.clone(), bus.clone());
        let scheduler = DeadlineScheduler::new(config.scheduler.max_workers);

        let inner = Arc::new(SessionInner {
            config: config.clone(),
            session_id: Uuid::new_v4().to_string(),
            conversation_id: session_config.conversation_id,
            created_at: Utc::now(),
            registry,
            bus,
            scheduler,
            tts_sink: RwLock::new(None),
            stop_tts_sink: RwLock::new(None),
            is_tts_playing: AtomicBool::new(false),
            last_barge_in: Mutex::new(None),
            total_speech_acts: AtomicU64::new(0),
            total_barge_ins: AtomicU64::new(0),
        });

        let planner = SpeechPlanner::from_config(&config);
        let vad = VoiceActivityDetector::from_config(&config);

        let barge_in_inner = inner.clone();
        let on_barge_in: Box<dyn Fn() -> duplex_domain::BoxFuture<'static, ()> + Send + Sync> =
            Box::new(move || {
                let inner = barge_in_inner.clone();
                Box::pin(async move { inner.handle_barge_in().await })
            });

        let state_inner = inner.clone();
        let on_state_change: Box<dyn Fn(ConversationState) + Send + Sync> =
            Box::new(move |state| state_inner.handle_state_change(state));

        let controller = ConversationController::new(planner, vad, on_barge_in, on_state_change);

        Self { inner, controller }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn set_tts_sink(&self, sink: Arc<dyn TtsSink>) {
        *self.inner.tts_sink.write() = Some(sink);
    }

    pub fn set_stop_tts_sink(&self, sink: Arc<dyn StopTtsSink>) {
        *self.inner.stop_tts_sink.write() = Some(sink);
    }

    /// Streams `content` through the Controller to the registered TTS sink.
    /// Returns an empty vec without doing any work if no sink is set yet.
    pub async fn speak(
        &self,
        content: Box<dyn crate::speech_planner::TokenSource>,
        has_tools: bool,
    ) -> Vec<SpeechAct> {
        let Some(sink) = self.inner.tts_sink.read().clone() else {
            tracing::warn!("speak called with no tts sink registered");
            return Vec::new();
        };

        let delivered = self.controller.speak(content, sink, has_tools).await;
        self.inner
            .total_speech_acts
            .fetch_add(delivered.len() as u64, Ordering::Relaxed);
        for act in &delivered {
            TraceEvent::SpeechActDelivered {
                session_id: self.inner.session_id.clone(),
                act_type: format!("{:?}", act.kind),
            }
            .emit();
        }
        delivered
    }

    /// Maps a tool progress stream to Speech Acts and delivers each to the
    /// TTS sink as it arrives. Honors `token`: the upstream stream is
    /// abandoned (dropped, ending consumption) as soon as cancellation is
    /// observed.
    pub async fn stream_tool_progress(
        &self,
        mut progress: BoxStream<'static, duplex_domain::ToolProgress>,
        token: Option<CancelToken>,
    ) -> Vec<SpeechAct> {
        let Some(sink) = self.inner.tts_sink.read().clone() else {
            tracing::warn!("stream_tool_progress called with no tts sink registered");
            return Vec::new();
        };

        let mut emitted = Vec::new();
        while let Some(update) = progress.next().await {
            if let Some(t) = &token {
                if t.is_cancelled() {
                    break;
                }
            }
            if let Some(act) = tool_progress_to_act(&update) {
                if sink.send(act.clone()).await.is_ok() {
                    self.inner.total_speech_acts.fetch_add(1, Ordering::Relaxed);
                    emitted.push(act);
                } else {
                    TraceEvent::SinkFailure {
                        session_id: self.inner.session_id.clone(),
                        reason: "tool progress delivery failed".into(),
                    }
                    .emit();
                }
            }
        }
        emitted
    }

    /// Drains up to `max_items` (capped at 5) Attention Events and converts
    /// whichever of them map to speech into delivered Speech Acts.
    pub async fn drain_events_to_speech(&self, max_items: usize) -> Vec<SpeechAct> {
        let max_items = max_items.min(5);
        let Some(sink) = self.inner.tts_sink.read().clone() else {
            return Vec::new();
        };

        let events = self.inner.bus.drain(max_items);
        let mut emitted = Vec::new();
        for event in events {
            if let Some(act) = attention_event_to_act(&event) {
                if sink.send(act.clone()).await.is_ok() {
                    self.inner.total_speech_acts.fetch_add(1, Ordering::Relaxed);
                    emitted.push(act);
                }
            }
        }
        emitted
    }

    /// Throwing form: returns `Error::Rejected` if the category is at
    /// capacity. The registry itself publishes the `backpressure_rejection`
    /// event; this does not publish a second one.
    pub fn create_tracked_task<F, Fut>(
        &self,
        category: TaskCategory,
        metadata: HashMap<String, String>,
        work: F,
    ) -> Result<TaskHandle, Error>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .registry
            .submit(category, metadata, work)
            .ok_or_else(|| Error::Rejected {
                category: category.label().to_string(),
            })
    }

    /// Non-throwing form: `None` if the category is at capacity.
    pub fn try_create_tracked_task<F, Fut>(
        &self,
        category: TaskCategory,
        metadata: HashMap<String, String>,
        work: F,
    ) -> Option<TaskHandle>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.registry.submit(category, metadata, work)
    }

    pub fn submit_scheduled_job<F, Fut>(
        &self,
        category: impl Into<String>,
        job_fn: F,
        priority: SchedulerPriority,
        deadline_ms: i64,
        metadata: HashMap<String, String>,
    ) -> String
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .scheduler
            .submit(category, job_fn, priority, deadline_ms, metadata)
    }

    /// Feeds one PCM frame to the Controller's VAD gate.
    pub async fn on_audio(&self, chunk: &[i16]) -> bool {
        self.controller.on_audio_chunk(chunk).await
    }

    /// Forces a barge-in through both the Controller and the session's own
    /// stop-TTS path, regardless of whether the Controller was actually
    /// speaking at the time.
    pub async fn barge_in(&self, user_input: Option<String>) {
        self.controller.barge_in(user_input).await;
        self.inner.handle_barge_in().await;
    }

    pub fn record_user_turn(&self, content: impl Into<String>) {
        self.controller.record_user_turn(content);
    }

    pub fn get_interrupted_draft(&self) -> Option<String> {
        self.controller.get_interrupted_draft()
    }

    pub fn get_metrics(&self) -> SessionMetrics {
        SessionMetrics {
            session_id: self.inner.session_id.clone(),
            conversation_id: self.inner.conversation_id.clone(),
            state: self.controller.state(),
            is_tts_playing: self.inner.is_tts_playing.load(Ordering::Relaxed),
            total_speech_acts: self.inner.total_speech_acts.load(Ordering::Relaxed),
            total_barge_ins: self.inner.total_barge_ins.load(Ordering::Relaxed),
            created_at: self.inner.created_at,
            event_bus: self.inner.bus.stats(),
            scheduler: self.inner.scheduler.stats(),
        }
    }

    pub fn reset(&self) {
        self.controller.reset();
        self.inner.is_tts_playing.store(false, Ordering::Relaxed);
        *self.inner.last_barge_in.lock() = None;
        self.inner.registry.cancel_all(None);
        self.inner.scheduler.cancel_all(None);
    }
}

fn tool_progress_to_act(progress: &duplex_domain::ToolProgress) -> Option<SpeechAct> {
    use duplex_domain::ToolProgressState::*;
    let name = &progress.tool_name;
    let text = match progress.state {
        Starting => progress
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("I'm looking up {name} now.")),
        Working => progress.message.clone().filter(|m| !m.is_empty())?,
        Completed => progress
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Got it. {name} is done.")),
        Cancelled => progress
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("Stopping {name}.")),
        Error => progress
            .message
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("{name} hit an error.")),
    };
    Some(SpeechAct::status_text(text))
}

fn attention_event_to_act(event: &AttentionEvent) -> Option<SpeechAct> {
    match event.kind.as_str() {
        "backpressure_rejection" => Some(SpeechAct::status_text(event.message().unwrap_or(
            "I am already running several lookups. Want me to finish those first?",
        ))),
        "pattern_detected" => Some(SpeechAct::status_text(
            event
                .message()
                .unwrap_or("I noticed a new pattern in the background."),
        )),
        "world_update" => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_domain::ToolProgressState;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        sent: Arc<StdMutex<Vec<SpeechAct>>>,
    }

    #[async_trait::async_trait]
    impl TtsSink for RecordingSink {
        async fn send(&self, act: SpeechAct) -> Result<(), Error> {
            self.sent.lock().unwrap().push(act);
            Ok(())
        }
    }

    struct CountingStopSink {
        calls: Arc<AtomicU64>,
    }

    #[async_trait::async_trait]
    impl StopTtsSink for CountingStopSink {
        async fn stop(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct VecTokenSource {
        tokens: std::vec::IntoIter<String>,
    }

    impl VecTokenSource {
        fn words(text: &str) -> Self {
            let chunks: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
            Self {
                tokens: chunks.into_iter(),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::speech_planner::TokenSource for VecTokenSource {
        async fn next_token(&mut self) -> Option<String> {
            self.tokens.next()
        }
    }

    fn session() -> DuplexSession {
        DuplexSession::new(Config::default(), DuplexSessionConfig::default())
    }

    #[tokio::test]
    async fn speak_without_sink_returns_empty() {
        let session = session();
        let delivered = session
            .speak(Box::new(VecTokenSource::words("Hello there.")), false)
            .await;
        assert!(delivered.is_empty());
    }

    #[tokio::test]
    async fn speak_delivers_through_registered_sink() {
        let session = session();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        session.set_tts_sink(Arc::new(RecordingSink { sent: sent.clone() }));

        let delivered = session
            .speak(Box::new(VecTokenSource::words("Hello there.")), false)
            .await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(session.get_metrics().total_speech_acts, 1);
    }

    #[tokio::test]
    async fn create_tracked_task_rejects_over_capacity() {
        let mut config = Config::default();
        config.registry.tool_cap = 1;
        let session = DuplexSession::new(config, DuplexSessionConfig::default());

        let first = session.create_tracked_task(TaskCategory::Tool, HashMap::new(), |token| async move {
            token.wait().await;
        });
        assert!(first.is_ok());

        let second = session.create_tracked_task(TaskCategory::Tool, HashMap::new(), |_| async move {});
        assert!(matches!(second, Err(Error::Rejected { .. })));
        assert_eq!(session.get_metrics().event_bus.dropped, 0);
    }

    #[tokio::test]
    async fn try_create_tracked_task_returns_none_over_capacity() {
        let mut config = Config::default();
        config.registry.background_cap = 1;
        let session = DuplexSession::new(config, DuplexSessionConfig::default());

        session
            .try_create_tracked_task(TaskCategory::Background, HashMap::new(), |token| async move {
                token.wait().await;
            })
            .expect("first accepted");
        let rejected = session.try_create_tracked_task(TaskCategory::Background, HashMap::new(), |_| async move {});
        assert!(rejected.is_none());
    }

    #[tokio::test]
    async fn barge_in_invokes_stop_sink_and_increments_counter() {
        let session = session();
        let calls = Arc::new(AtomicU64::new(0));
        session.set_stop_tts_sink(Arc::new(CountingStopSink { calls: calls.clone() }));

        session.barge_in(Some("stop".into())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.get_metrics().total_barge_ins, 1);
    }

    #[tokio::test]
    async fn repeated_barge_in_within_cooldown_only_counts_once() {
        let session = session();
        let calls = Arc::new(AtomicU64::new(0));
        session.set_stop_tts_sink(Arc::new(CountingStopSink { calls: calls.clone() }));

        session.barge_in(None).await;
        session.barge_in(None).await;
        assert_eq!(session.get_metrics().total_barge_ins, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_events_to_speech_caps_at_five_and_maps_rejections() {
        let mut config = Config::default();
        config.registry.tool_cap = 0;
        // can_accept() with a zero cap always rejects; craft two explicit
        // rejections instead by calling submit below once cap is back to 1.
        config.registry.tool_cap = 1;
        let session = DuplexSession::new(config, DuplexSessionConfig::default());
        let sent = Arc::new(StdMutex::new(Vec::new()));
        session.set_tts_sink(Arc::new(RecordingSink { sent: sent.clone() }));

        session
            .try_create_tracked_task(TaskCategory::Tool, HashMap::new(), |token| async move {
                token.wait().await;
            })
            .expect("first accepted");
        for _ in 0..2 {
            let rejected =
                session.try_create_tracked_task(TaskCategory::Tool, HashMap::new(), |_| async move {});
            assert!(rejected.is_none());
        }

        let emitted = session.drain_events_to_speech(10).await;
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|a| a.kind == crate::speech_planner::SpeechActType::Status));
    }

    #[tokio::test]
    async fn stream_tool_progress_maps_states_to_status_acts() {
        let session = session();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        session.set_tts_sink(Arc::new(RecordingSink { sent: sent.clone() }));

        let updates = vec![
            duplex_domain::ToolProgress::new(ToolProgressState::Starting, "web_search"),
            duplex_domain::ToolProgress::new(ToolProgressState::Completed, "web_search"),
        ];
        let stream: BoxStream<'static, duplex_domain::ToolProgress> =
            Box::pin(futures_util::stream::iter(updates));

        let emitted = session.stream_tool_progress(stream, None).await;
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].text, "I'm looking up web_search now.");
        assert_eq!(emitted[1].text, "Got it. web_search is done.");
    }

    #[tokio::test]
    async fn reset_clears_barge_in_cooldown_and_returns_idle() {
        let session = session();
        session.barge_in(None).await;
        session.reset();
        assert_eq!(session.get_metrics().total_barge_ins, 1);
        assert_eq!(session.controller.state(), ConversationState::Idle);

        let calls = Arc::new(AtomicU64::new(0));
        session.set_stop_tts_sink(Arc::new(CountingStopSink { calls: calls.clone() }));
        session.barge_in(None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
