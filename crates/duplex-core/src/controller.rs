use chrono::{DateTime, Utc};
use duplex_domain::{BoxFuture, Error};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::cancellation::CancelToken;
use crate::speech_planner::{SpeechAct, SpeechPlanner, TokenSource};
use crate::vad::VoiceActivityDetector;

/// The capability a `speak` invocation delivers acts to. Held exclusively
/// by the Controller for the duration of one speech act — serialized by
/// the controller's own speaking lock, never by the sink itself.
#[async_trait::async_trait]
pub trait TtsSink: Send + Sync {
    async fn send(&self, act: SpeechAct) -> Result<(), Error>;
}

/// Silences any in-flight audio for the session. Must be idempotent and
/// safe to call concurrently with `TtsSink::send`.
#[async_trait::async_trait]
pub trait StopTtsSink: Send + Sync {
    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Speaking,
    FullDuplex,
}

impl ConversationState {
    fn is_speaking(self) -> bool {
        matches!(self, ConversationState::Speaking | ConversationState::FullDuplex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub was_interrupted: bool,
    pub speech_acts_count: usize,
}

/// Snapshot of what was being said at the instant of barge-in.
#[derive(Debug, Clone)]
pub struct InterruptedDraft {
    pub completed_acts: Vec<SpeechAct>,
    pub pending_text: String,
    pub interrupted_at: DateTime<Utc>,
    pub input_that_interrupted: Option<String>,
}

impl InterruptedDraft {
    pub fn full_text(&self) -> String {
        self.completed_acts
            .iter()
            .map(|a| a.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerMetrics {
    pub state: ConversationState,
    pub barge_in_count: u64,
    pub speech_acts_delivered: u64,
    pub turn_count: usize,
    pub has_interrupted_draft: bool,
}

type BargeInCallback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type StateChangeCallback = Box<dyn Fn(ConversationState) + Send + Sync>;

struct ControllerState {
    state: ConversationState,
    current_acts: Vec<SpeechAct>,
    pending_text: String,
    current_cancel: Option<CancelToken>,
    last_interrupted_draft: Option<InterruptedDraft>,
    turn_history: Vec<ConversationTurn>,
    barge_in_count: u64,
    speech_acts_delivered: u64,
}

/// Turn-taking state machine: streams Speech Acts from the planner to a
/// `TtsSink`, arbitrates barge-in, and preserves what was said up to the
/// point of interruption.
///
/// Owns the Speech Planner and the VAD gate exclusively — no other
/// component touches either. `speak` is serialized by an async exclusion
/// lock so only one speech generation runs at a time, matching the
/// concurrency model's "TTS sink held exclusively by the Controller for
/// one speech act" guarantee.
pub struct ConversationController {
    planner: SpeechPlanner,
    vad: Mutex<VoiceActivityDetector>,
    speaking_lock: AsyncMutex<()>,
    state: Mutex<ControllerState>,
    on_barge_in: BargeInCallback,
    on_state_change: StateChangeCallback,
}

impl ConversationController {
    pub fn new(
        planner: SpeechPlanner,
        vad: VoiceActivityDetector,
        on_barge_in: BargeInCallback,
        on_state_change: StateChangeCallback,
    ) -> Self {
        Self {
            planner,
            vad: Mutex::new(vad),
            speaking_lock: AsyncMutex::new(()),
            state: Mutex::new(ControllerState {
                state: ConversationState::Idle,
                current_acts: Vec::new(),
                pending_text: String::new(),
                current_cancel: None,
                last_interrupted_draft: None,
                turn_history: Vec::new(),
                barge_in_count: 0,
                speech_acts_delivered: 0,
            }),
            on_barge_in,
            on_state_change,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.state.lock().state
    }

    pub fn is_speaking(&self) -> bool {
        self.state.lock().state.is_speaking()
    }

    fn set_state(&self, guard: &mut ControllerState, new_state: ConversationState) {
        if guard.state != new_state {
            guard.state = new_state;
            (self.on_state_change)(new_state);
        }
    }

    /// Streams `content` to `tts_sink` one Speech Act at a time, honoring
    /// barge-in. Returns the acts actually delivered — a prefix of the
    /// planner's output when a barge-in or sink failure cut the turn short.
    pub async fn speak(
        &self,
        content: Box<dyn TokenSource>,
        tts_sink: std::sync::Arc<dyn TtsSink>,
        has_tools: bool,
    ) -> Vec<SpeechAct> {
        let _guard = self.speaking_lock.lock().await;

        let cancel_token = CancelToken::new();
        {
            let mut state = self.state.lock();
            self.set_state(&mut state, ConversationState::Speaking);
            state.current_cancel = Some(cancel_token.clone());
            state.current_acts.clear();
            state.pending_text.clear();
        }

        let mut delivered = Vec::new();
        let mut stream = self
            .planner
            .plan_with_status(content, has_tools, cancel_token.clone());

        while let Some(act) = stream.next().await {
            if cancel_token.is_cancelled() {
                tracing::info!("speech cancelled by barge-in");
                break;
            }

            self.state.lock().current_acts.push(act.clone());
            self.vad.lock().start_tts_cooldown();

            match tts_sink.send(act.clone()).await {
                Ok(()) => {
                    delivered.push(act);
                    self.state.lock().speech_acts_delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "tts sink failure, ending speech early");
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        self.set_state(&mut state, ConversationState::Listening);
        if !delivered.is_empty() {
            let content = delivered
                .iter()
                .map(|a| a.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let was_interrupted = cancel_token.is_cancelled();
            let speech_acts_count = delivered.len();
            state.turn_history.push(ConversationTurn {
                speaker: Speaker::Assistant,
                content,
                timestamp: Utc::now(),
                was_interrupted,
                speech_acts_count,
            });
        }

        delivered
    }

    /// Unconditional once speaking — ignored otherwise. Does not itself
    /// enforce a cooldown; repeated-invocation gating is the caller's
    /// responsibility (the Duplex Session gates its own bookkeeping on a
    /// per-session cooldown while this stays a direct, literal
    /// implementation of the state table).
    pub async fn barge_in(&self, user_input: Option<String>) -> bool {
        if !self.is_speaking() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if let Some(token) = &state.current_cancel {
                token.cancel();
            }
            state.barge_in_count += 1;
            state.last_interrupted_draft = Some(InterruptedDraft {
                completed_acts: state.current_acts.clone(),
                pending_text: state.pending_text.clone(),
                interrupted_at: Utc::now(),
                input_that_interrupted: user_input,
            });
        }

        tracing::info!("barge-in detected");
        (self.on_barge_in)().await;
        true
    }

    /// Feeds one PCM frame to the VAD gate. Returns true iff barge-in was
    /// triggered as a result.
    pub async fn on_audio_chunk(&self, chunk: &[i16]) -> bool {
        if !self.is_speaking() {
            return false;
        }
        let detected = self.vad.lock().detect(chunk);
        if detected {
            self.barge_in(None).await
        } else {
            false
        }
    }

    pub fn get_interrupted_draft(&self) -> Option<String> {
        self.state
            .lock()
            .last_interrupted_draft
            .as_ref()
            .map(InterruptedDraft::full_text)
    }

    pub fn record_user_turn(&self, content: impl Into<String>) {
        let mut state = self.state.lock();
        state.turn_history.push(ConversationTurn {
            speaker: Speaker::User,
            content: content.into(),
            timestamp: Utc::now(),
            was_interrupted: false,
            speech_acts_count: 0,
        });
    }

    pub fn get_metrics(&self) -> ControllerMetrics {
        let state = self.state.lock();
        ControllerMetrics {
            state: state.state,
            barge_in_count: state.barge_in_count,
            speech_acts_delivered: state.speech_acts_delivered,
            turn_count: state.turn_history.len(),
            has_interrupted_draft: state.last_interrupted_draft.is_some(),
        }
    }

    pub fn history(&self, limit: usize) -> Vec<ConversationTurn> {
        let state = self.state.lock();
        let start = state.turn_history.len().saturating_sub(limit);
        state.turn_history[start..].to_vec()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(token) = &state.current_cancel {
            token.cancel();
        }
        self.set_state(&mut state, ConversationState::Idle);
        state.current_acts.clear();
        state.pending_text.clear();
        state.last_interrupted_draft = None;
        drop(state);
        self.vad.lock().reset();
    }
}
