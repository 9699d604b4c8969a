use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use duplex_domain::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cancellation::CancelToken;

/// Secondary sort key for the dispatch heap. Lower values run first — note
/// this is the inverse of "higher priority wins" phrasing; `Critical` is
/// declared first so it sorts least, matching the data model's
/// `CRITICAL < HIGH < NORMAL < LOW` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedulerPriority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    deadline_ts: DateTime<Utc>,
    priority: SchedulerPriority,
    created_ts: DateTime<Utc>,
    job_id: String,
}

type JobFn = Box<dyn FnOnce(CancelToken) -> BoxFuture<'static, ()> + Send>;

pub struct ScheduledJob {
    pub job_id: String,
    pub category: String,
    pub priority: SchedulerPriority,
    pub deadline_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
    pub token: CancelToken,
    pub metadata: HashMap<String, String>,
    pub started_at: Mutex<Option<DateTime<Utc>>>,
    pub completed_at: Mutex<Option<DateTime<Utc>>>,
    job_fn: Mutex<Option<JobFn>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub pending: usize,
    pub running: usize,
    pub max_workers: usize,
    pub known_jobs: usize,
}

/// Earliest-deadline-first scheduler with priority as a secondary key and a
/// capped worker pool. The dispatch loop starts lazily on first submit and
/// runs until `stop()` is called.
///
/// Deadlines are advisory: a job past its deadline still runs unless its
/// token is cancelled. Expiration is the submitter's responsibility — e.g.
/// scheduling an auxiliary job that cancels the target's token.
pub struct DeadlineScheduler {
    max_workers: usize,
    pending: Mutex<BinaryHeap<Reverse<SortKey>>>,
    jobs: Mutex<HashMap<String, Arc<ScheduledJob>>>,
    running: AtomicUsize,
    notify: Notify,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DeadlineScheduler {
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            max_workers: max_workers.max(1),
            pending: Mutex::new(BinaryHeap::new()),
            jobs: Mutex::new(HashMap::new()),
            running: AtomicUsize::new(0),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut guard = self.dispatcher.lock();
        if guard.is_none() {
            let scheduler = self.clone();
            *guard = Some(tokio::spawn(scheduler.dispatch_loop()));
        }
    }

    /// Submits a job with a deadline expressed as milliseconds from now.
    /// Returns the assigned job id.
    pub fn submit<F, Fut>(
        self: &Arc<Self>,
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
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("job-{id}");
        let created_ts = Utc::now();
        let deadline_ts = created_ts + chrono::Duration::milliseconds(deadline_ms);
        let token = CancelToken::new();
        let job_category: String = category.into();

        let boxed_fn: JobFn = Box::new(move |token| Box::pin(job_fn(token)));

        let job = Arc::new(ScheduledJob {
            job_id: job_id.clone(),
            category: job_category.clone(),
            priority,
            deadline_ts,
            created_ts,
            token,
            metadata,
            started_at: Mutex::new(None),
            completed_at: Mutex::new(None),
            job_fn: Mutex::new(Some(boxed_fn)),
        });

        self.jobs.lock().insert(job_id.clone(), job);
        self.pending.lock().push(Reverse(SortKey {
            deadline_ts,
            priority,
            created_ts,
            job_id: job_id.clone(),
        }));

        self.ensure_started();
        self.notify.notify_one();
        tracing::debug!(job_id = %job_id, deadline_ms, "scheduled job submitted");
        duplex_domain::TraceEvent::JobSubmitted {
            job_id: job_id.clone(),
            category: job_category,
            deadline_ms: deadline_ms.max(0) as u64,
        }
        .emit();
        job_id
    }

    pub fn cancel(&self, job_id: &str) -> bool {
        let found = match self.jobs.lock().get(job_id) {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        };
        if found {
            self.notify.notify_one();
        }
        found
    }

    /// Cancels every known job, optionally scoped to one category. Returns
    /// the count of jobs reached.
    pub fn cancel_all(&self, category: Option<&str>) -> usize {
        let jobs = self.jobs.lock();
        let mut count = 0;
        for job in jobs.values() {
            if category.is_none() || category == Some(job.category.as_str()) {
                job.token.cancel();
                count += 1;
            }
        }
        drop(jobs);
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.pending.lock().len(),
            running: self.running.load(Ordering::Acquire),
            max_workers: self.max_workers,
            known_jobs: self.jobs.lock().len(),
        }
    }

    /// Cancels every job and stops the dispatch loop, joining the worker.
    pub async fn stop(self: &Arc<Self>) {
        self.stopped.store(true, Ordering::Release);
        self.cancel_all(None);
        self.notify.notify_waiters();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn pop_runnable(&self) -> Option<Arc<ScheduledJob>> {
        let mut pending = self.pending.lock();
        while let Some(Reverse(key)) = pending.pop() {
            let maybe_job = self.jobs.lock().get(&key.job_id).cloned();
            match maybe_job {
                None => continue,
                Some(job) => {
                    if job.token.is_cancelled() {
                        self.jobs.lock().remove(&key.job_id);
                        tracing::debug!(job_id = %key.job_id, "scheduled job dropped, token cancelled before dispatch");
                        continue;
                    }
                    return Some(job);
                }
            }
        }
        None
    }

    fn spawn_job(self: &Arc<Self>, job: Arc<ScheduledJob>) {
        self.running.fetch_add(1, Ordering::AcqRel);
        *job.started_at.lock() = Some(Utc::now());
        let scheduler = self.clone();
        tracing::debug!(job_id = %job.job_id, "scheduled job dispatched");
        duplex_domain::TraceEvent::JobDispatched {
            job_id: job.job_id.clone(),
        }
        .emit();
        tokio::spawn(async move {
            let job_fn = job.job_fn.lock().take();
            let token = job.token.clone();
            if let Some(job_fn) = job_fn {
                job_fn(token).await;
            }
            *job.completed_at.lock() = Some(Utc::now());
            scheduler.jobs.lock().remove(&job.job_id);
            scheduler.running.fetch_sub(1, Ordering::AcqRel);
            scheduler.notify.notify_one();
        });
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            let mut dispatched_any = false;
            while self.running.load(Ordering::Acquire) < self.max_workers {
                match self.pop_runnable() {
                    Some(job) => {
                        self.spawn_job(job);
                        dispatched_any = true;
                    }
                    None => break,
                }
            }
            if self.stopped.load(Ordering::Acquire) {
                break;
            }
            if !dispatched_any {
                let notified = self.notify.notified();
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn single_worker_runs_in_deadline_order() {
        let scheduler = DeadlineScheduler::new(1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        for (label, deadline_ms) in [("a", 300_i64), ("b", 100), ("c", 200)] {
            let order = order.clone();
            scheduler.submit(
                "background",
                move |_token| async move {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    order.lock().unwrap().push(label.to_string());
                },
                SchedulerPriority::Normal,
                deadline_ms,
                HashMap::new(),
            );
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock().unwrap(), vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn priority_breaks_ties_on_equal_deadline() {
        let scheduler = DeadlineScheduler::new(1);
        let order = Arc::new(StdMutex::new(Vec::new()));

        // Submit the low-priority job first so it occupies the single
        // worker; the next two share a deadline and differ only by
        // priority, so CRITICAL must be dispatched ahead of NORMAL once a
        // slot frees up.
        {
            let order = order.clone();
            scheduler.submit(
                "background",
                move |_token| async move {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    order.lock().unwrap().push("warmup".to_string());
                },
                SchedulerPriority::Low,
                50,
                HashMap::new(),
            );
        }
        tokio::time::sleep(Duration::from_millis(1)).await;

        for (label, priority) in [("normal", SchedulerPriority::Normal), ("critical", SchedulerPriority::Critical)] {
            let order = order.clone();
            scheduler.submit(
                "background",
                move |_token| async move {
                    order.lock().unwrap().push(label.to_string());
                },
                priority,
                200,
                HashMap::new(),
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let finished = order.lock().unwrap().clone();
        assert_eq!(finished[0], "warmup");
        assert_eq!(finished[1], "critical");
        assert_eq!(finished[2], "normal");
    }

    #[tokio::test]
    async fn max_workers_caps_concurrency() {
        let scheduler = DeadlineScheduler::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            scheduler.submit(
                "background",
                move |_token| async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                },
                SchedulerPriority::Normal,
                100,
                HashMap::new(),
            );
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_job_is_dropped_before_dispatch() {
        let scheduler = DeadlineScheduler::new(1);
        let ran = Arc::new(AtomicBool::new(false));

        // occupy the worker so the next job sits pending
        scheduler.submit(
            "background",
            |_token| async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
            },
            SchedulerPriority::Normal,
            10,
            HashMap::new(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;

        let ran_clone = ran.clone();
        let job_id = scheduler.submit(
            "background",
            move |_token| async move {
                ran_clone.store(true, Ordering::SeqCst);
            },
            SchedulerPriority::Normal,
            20,
            HashMap::new(),
        );
        scheduler.cancel(&job_id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_cancels_all_and_joins() {
        let scheduler = DeadlineScheduler::new(1);
        scheduler.submit(
            "background",
            |token| async move {
                token.wait().await;
            },
            SchedulerPriority::Normal,
            1000,
            HashMap::new(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        scheduler.stop().await;
        assert_eq!(scheduler.stats().running, 0);
    }
}
