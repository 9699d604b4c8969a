use serde::Serialize;

/// Structured trace events emitted across the duplex conversation engine,
/// for hosts that want machine-readable telemetry distinct from human log
/// lines. These are in addition to, not instead of, ordinary `tracing` calls.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    TaskRegistered {
        task_id: String,
        category: String,
    },
    TaskRejected {
        category: String,
    },
    TaskCancelled {
        task_id: String,
    },
    JobSubmitted {
        job_id: String,
        category: String,
        deadline_ms: u64,
    },
    JobDispatched {
        job_id: String,
    },
    BargeIn {
        session_id: String,
        barge_in_count: u64,
    },
    StageATokenError {
        reason: String,
    },
    StageBRefinementSuppressed {
        reason: String,
    },
    SpeechActDelivered {
        session_id: String,
        act_type: String,
    },
    SinkFailure {
        session_id: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "duplex_event");
    }
}
