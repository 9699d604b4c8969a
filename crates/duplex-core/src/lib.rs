pub mod cancellation;
pub mod controller;
pub mod deliberation;
pub mod event_bus;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod speech_planner;
pub mod vad;

pub use cancellation::CancelToken;
pub use controller::{
    ConversationController, ConversationState, ConversationTurn, ControllerMetrics,
    InterruptedDraft, Speaker, StopTtsSink, TtsSink,
};
pub use deliberation::{AgentCollaborator, LanguageModelCollaborator, ProgressiveDeliberation, ToolCollaborator};
pub use event_bus::{AttentionEvent, AttentionEventBus, EventBusStats};
pub use registry::{TaskCategory, TaskHandle, TaskRegistry};
pub use scheduler::{DeadlineScheduler, SchedulerPriority, SchedulerStats, ScheduledJob};
pub use session::{DuplexSession, DuplexSessionConfig, SessionMetrics};
pub use speech_planner::{SpeechAct, SpeechActType, SpeechPlanner, TokenSource};
pub use vad::VoiceActivityDetector;
