use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duplex_domain::Config;
use parking_lot::RwLock;
use tracing::Instrument;

use crate::cancellation::CancelToken;
use crate::event_bus::{AttentionEvent, AttentionEventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskCategory {
    Conversation,
    Tool,
    Agent,
    Background,
}

impl TaskCategory {
    pub fn label(&self) -> &'static str {
        match self {
            TaskCategory::Conversation => "conversation",
            TaskCategory::Tool => "tool",
            TaskCategory::Agent => "agent",
            TaskCategory::Background => "background",
        }
    }

    fn cap(&self, config: &Config) -> usize {
        match self {
            TaskCategory::Conversation => config.registry.conversation_cap,
            TaskCategory::Tool => config.registry.tool_cap,
            TaskCategory::Agent => config.registry.agent_cap,
            TaskCategory::Background => config.registry.background_cap,
        }
    }
}

/// A registered async unit of work. Cloning shares the same underlying
/// cancellation token and completion flag; it does not spawn a second task.
#[derive(Clone)]
pub struct TaskHandle {
    pub task_id: String,
    pub category: TaskCategory,
    pub token: CancelToken,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    done: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Requests cancellation. Does not itself wait for the task to unwind.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Owns a mapping of `task_id -> handle` with per-category backpressure
/// caps. Registration never queues: a category at capacity rejects new
/// submissions immediately and surfaces a `backpressure_rejection` event on
/// the bus supplied at construction.
pub struct TaskRegistry {
    config: Config,
    bus: Arc<AttentionEventBus>,
    handles: Arc<RwLock<HashMap<String, TaskHandle>>>,
    next_id: AtomicU64,
}

impl TaskRegistry {
    pub fn new(config: Config, bus: Arc<AttentionEventBus>) -> Self {
        Self {
            config,
            bus,
            handles: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    fn live_count(&self, category: TaskCategory) -> usize {
        self.handles
            .read()
            .values()
            .filter(|h| h.category == category && !h.is_done())
            .count()
    }

    pub fn can_accept(&self, category: TaskCategory) -> bool {
        self.live_count(category) < category.cap(&self.config)
    }

    /// Spawns `work` as a tracked tokio task and registers its handle
    /// unconditionally — callers that need the backpressure cap enforced
    /// should use `submit` instead.
    pub fn register<F, Fut>(
        &self,
        category: TaskCategory,
        metadata: HashMap<String, String>,
        work: F,
    ) -> TaskHandle
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task_id = format!("{}-{id}", category.label());
        let token = CancelToken::new();
        let done = Arc::new(AtomicBool::new(false));

        let handle = TaskHandle {
            task_id: task_id.clone(),
            category,
            token: token.clone(),
            created_at: Utc::now(),
            metadata,
            done: done.clone(),
        };

        self.handles.write().insert(task_id.clone(), handle.clone());
        duplex_domain::TraceEvent::TaskRegistered {
            task_id: task_id.clone(),
            category: category.label().to_string(),
        }
        .emit();

        let handles = self.handles.clone();
        let span = tracing::info_span!("tracked_task", task_id = %task_id, category = category.label());
        let spawned_token = token.clone();
        tokio::spawn(
            async move {
                work(spawned_token).await;
                done.store(true, Ordering::Release);
                handles.write().remove(&task_id);
            }
            .instrument(span),
        );

        handle
    }

    /// Rejection-first submission: if the category is at capacity, the
    /// supplied work is dropped unexecuted, a `backpressure_rejection`
    /// event is published, and `None` is returned. Otherwise behaves like
    /// `register`.
    pub fn submit<F, Fut>(
        &self,
        category: TaskCategory,
        metadata: HashMap<String, String>,
        work: F,
    ) -> Option<TaskHandle>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.can_accept(category) {
            tracing::debug!(category = category.label(), "task submission rejected, category at capacity");
            duplex_domain::TraceEvent::TaskRejected {
                category: category.label().to_string(),
            }
            .emit();
            self.bus
                .publish(AttentionEvent::backpressure_rejection("task_registry", category.label()));
            return None;
        }
        Some(self.register(category, metadata, work))
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        match self.handles.read().get(task_id) {
            Some(handle) => {
                handle.cancel();
                duplex_domain::TraceEvent::TaskCancelled {
                    task_id: task_id.to_string(),
                }
                .emit();
                true
            }
            None => false,
        }
    }

    /// Cancels every live handle, optionally scoped to one category.
    /// Returns the count of handles reached — idempotent per call, no
    /// attempt is made to deduplicate handles cancelled by a prior call.
    pub fn cancel_all(&self, category: Option<TaskCategory>) -> usize {
        let handles = self.handles.read();
        let mut count = 0;
        for handle in handles.values() {
            if category_matches(category, handle.category) {
                handle.cancel();
                count += 1;
            }
        }
        count
    }

    pub fn active(&self, category: Option<TaskCategory>) -> Vec<TaskHandle> {
        self.handles
            .read()
            .values()
            .filter(|h| category_matches(category, h.category))
            .cloned()
            .collect()
    }
}

fn category_matches(filter: Option<TaskCategory>, category: TaskCategory) -> bool {
    match filter {
        None => true,
        Some(c) => c == category,
    }
}
