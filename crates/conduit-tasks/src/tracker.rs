//! Background task tracker.
//!
//! Every task lives in one map guarded by a std `RwLock`. All transitions
//! are single critical sections with no `.await` inside, and a terminal
//! state is written at most once: whichever of completion, timeout or
//! cancellation gets there first wins, and later writers are discarded.
//!
//! A dispatched task holds at its start gate until the caller first reads
//! it back (status, correlation lookup, await or cancel) or a short start
//! hold elapses. The first observation of a fresh task is therefore always
//! `Pending`, regardless of runtime flavour.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use conduit_events::{ConduitEvent, EventBus, EventMetadata};
use serde_json::{Map, Value};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TaskError, TasksResult};
use crate::task::{AsyncTask, TaskConfig, TaskId, TaskStatus};
use crate::tool::{TaskTool, ToolContext, ToolTable};

const EVENT_SOURCE: &str = "task_tracker";
const CANCELLED: &str = "cancelled";

/// How long an unobserved task waits at its start gate.
pub const DEFAULT_START_HOLD: Duration = Duration::from_millis(5);

/// Outcome of [`AsyncTaskTracker::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// In-flight tasks that finished within the grace period.
    pub completed: usize,
    /// In-flight tasks cancelled when the grace period ran out.
    pub cancelled: usize,
}

struct Slot {
    task: AsyncTask,
    seq: u64,
    notify: watch::Sender<TaskStatus>,
    cancel: CancellationToken,
    start: Arc<Notify>,
}

impl Slot {
    /// Snapshot the task, then release its start gate.
    fn observe(&self) -> AsyncTask {
        let task = self.task.clone();
        self.start.notify_one();
        task
    }
}

struct Inner {
    tasks: RwLock<HashMap<TaskId, Slot>>,
    events: Option<EventBus>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Slot>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Slot>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, task: &AsyncTask) {
        if let Some(bus) = &self.events {
            bus.publish(ConduitEvent::TaskStatusChanged {
                metadata: EventMetadata::new(EVENT_SOURCE)
                    .with_correlation_id(task.correlation_id.clone()),
                task_id: task.id.as_uuid(),
                tool_name: task.tool_name.clone(),
                correlation_id: task.correlation_id.clone(),
                status: task.status.as_str().to_string(),
            });
        }
    }

    /// Apply `change` to a task. When it reports a change, waiters are
    /// notified and an event is published after the lock is released.
    fn transition(
        &self,
        id: TaskId,
        change: impl FnOnce(&mut AsyncTask) -> bool,
    ) -> Option<AsyncTask> {
        let snapshot = {
            let mut tasks = self.write();
            let slot = tasks.get_mut(&id)?;
            if !change(&mut slot.task) {
                return None;
            }
            slot.notify.send_replace(slot.task.status);
            slot.task.clone()
        };
        self.emit(&snapshot);
        Some(snapshot)
    }

    fn finish(
        &self,
        id: TaskId,
        status: TaskStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Option<AsyncTask> {
        self.transition(id, |task| task.finish(status, result, error))
    }
}

/// Tracks background tool invocations.
pub struct AsyncTaskTracker {
    inner: Arc<Inner>,
    tools: Arc<ToolTable>,
    default_timeout: Option<Duration>,
    start_hold: Duration,
    next_seq: AtomicU64,
    shutting_down: AtomicBool,
}

impl fmt::Debug for AsyncTaskTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskTracker")
            .field("tasks", &self.len())
            .field("active", &self.active_count())
            .field("default_timeout", &self.default_timeout)
            .field("start_hold", &self.start_hold)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl AsyncTaskTracker {
    /// Tracker dispatching to `tools`, with no default timeout.
    #[must_use]
    pub fn new(tools: Arc<ToolTable>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: RwLock::new(HashMap::new()),
                events: None,
            }),
            tools,
            default_timeout: None,
            start_hold: DEFAULT_START_HOLD,
            next_seq: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Timeout applied when a dispatch does not set one. `None` disables it.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Longest a task waits at its start gate when nobody reads it back.
    #[must_use]
    pub fn with_start_hold(mut self, hold: Duration) -> Self {
        self.start_hold = hold;
        self
    }

    /// Publish task transitions to `bus`.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = Some(bus);
        }
        self
    }

    /// The tool table used for dispatch.
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolTable> {
        &self.tools
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Dispatch `tool_name` in the background and return its id at once.
    ///
    /// The task is stored `Pending` before this returns and does not start
    /// until the caller reads it back or the start hold elapses. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnknownTool`] if no such tool is registered,
    /// [`TaskError::ShuttingDown`] after shutdown, and
    /// [`TaskError::NoRuntime`] outside a runtime.
    pub fn call_async(
        &self,
        tool_name: &str,
        input: Value,
        context: Map<String, Value>,
        config: TaskConfig,
    ) -> TasksResult<TaskId> {
        if self.is_shutting_down() {
            return Err(TaskError::ShuttingDown);
        }
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| TaskError::UnknownTool(tool_name.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TaskError::NoRuntime)?;

        let id = TaskId::new();
        let timeout = config
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);
        let timeout_ms = timeout.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let correlation_id = config.correlation_id.unwrap_or_else(|| id.to_string());
        let deadline = timeout.and_then(|d| Instant::now().checked_add(d));

        let task = AsyncTask::pending(
            id,
            tool_name,
            input.clone(),
            context.clone(),
            timeout_ms,
            correlation_id.clone(),
        );
        let cancel = CancellationToken::new();
        let (notify, _) = watch::channel(TaskStatus::Pending);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let start = Arc::new(Notify::new());

        self.inner.write().insert(
            id,
            Slot {
                task: task.clone(),
                seq,
                notify,
                cancel: cancel.clone(),
                start: Arc::clone(&start),
            },
        );
        self.inner.emit(&task);
        debug!(
            task_id = %id,
            tool = %tool_name,
            correlation_id = %correlation_id,
            "Task dispatched"
        );

        let ctx = ToolContext {
            task_id: id,
            correlation_id,
            context,
            cancellation: cancel,
        };
        let gate = StartGate {
            open: start,
            hold: self.start_hold,
        };
        runtime.spawn(run_task(
            Arc::clone(&self.inner),
            tool,
            input,
            ctx,
            gate,
            deadline,
        ));
        Ok(id)
    }

    /// Snapshot of a task.
    #[must_use]
    pub fn status(&self, id: TaskId) -> Option<AsyncTask> {
        self.inner.read().get(&id).map(Slot::observe)
    }

    /// Every task in a correlation group, oldest first.
    #[must_use]
    pub fn tasks_by_correlation(&self, correlation_id: &str) -> Vec<AsyncTask> {
        let tasks = self.inner.read();
        let mut group: Vec<&Slot> = tasks
            .values()
            .filter(|s| s.task.correlation_id == correlation_id)
            .collect();
        group.sort_by(|a, b| {
            a.task
                .created_at
                .cmp(&b.task.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        group.into_iter().map(Slot::observe).collect()
    }

    /// Wait until the task is terminal, for at most `timeout`.
    ///
    /// Timing out leaves the task untouched.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for an unknown id, [`TaskError::AwaitTimeout`]
    /// if the task is still running when `timeout` elapses.
    pub async fn await_completion(&self, id: TaskId, timeout: Duration) -> TasksResult<AsyncTask> {
        let deadline = Instant::now().checked_add(timeout);
        self.await_until(id, deadline, timeout).await
    }

    /// Wait until every task in a correlation group is terminal.
    ///
    /// # Errors
    ///
    /// [`TaskError::AwaitTimeout`] naming the first task still running when
    /// `timeout` elapses.
    pub async fn await_correlation(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> TasksResult<Vec<AsyncTask>> {
        let deadline = Instant::now().checked_add(timeout);
        let ids: Vec<TaskId> = self
            .tasks_by_correlation(correlation_id)
            .iter()
            .map(|t| t.id)
            .collect();

        let mut done = Vec::with_capacity(ids.len());
        for id in ids {
            done.push(self.await_until(id, deadline, timeout).await?);
        }
        Ok(done)
    }

    async fn await_until(
        &self,
        id: TaskId,
        deadline: Option<Instant>,
        waited: Duration,
    ) -> TasksResult<AsyncTask> {
        let mut rx = self
            .inner
            .read()
            .get(&id)
            .map(|s| {
                s.start.notify_one();
                s.notify.subscribe()
            })
            .ok_or(TaskError::NotFound(id))?;

        let wait = rx.wait_for(|s| s.is_terminal());
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, wait).await.ok(),
            None => Some(wait.await),
        };
        match outcome {
            Some(_) => self.status(id).ok_or(TaskError::NotFound(id)),
            None => Err(TaskError::AwaitTimeout {
                task_id: id,
                waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Cancel a pending or running task. The task becomes `Failed` with
    /// error `"cancelled"` and its tool is signalled through the
    /// cancellation token. Returns false for terminal or unknown tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let token = self.inner.read().get(&id).map(|s| s.cancel.clone());
        let cancelled = self
            .inner
            .finish(id, TaskStatus::Failed, None, Some(CANCELLED.to_string()))
            .is_some();
        if cancelled && let Some(token) = token {
            token.cancel();
            info!(task_id = %id, "Task cancelled");
        }
        cancelled
    }

    /// Remove terminal tasks created at least `max_age` ago. Pending and
    /// running tasks are never removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut tasks = self.inner.write();
        let before = tasks.len();
        tasks.retain(|_, slot| {
            !(slot.task.is_terminal() && now.signed_duration_since(slot.task.created_at) >= max_age)
        });
        let removed = before.saturating_sub(tasks.len());
        drop(tasks);
        if removed > 0 {
            debug!(removed, "Swept finished tasks");
        }
        removed
    }

    /// Number of pending or running tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .read()
            .values()
            .filter(|s| !s.task.is_terminal())
            .count()
    }

    /// Number of tracked tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// Whether no tasks are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Stop accepting work, wait up to `grace` for in-flight tasks, then
    /// cancel whatever is still running.
    pub async fn shutdown(&self, grace: Duration) -> DrainReport {
        self.shutting_down.store(true, Ordering::Release);
        let in_flight: Vec<TaskId> = self
            .inner
            .read()
            .iter()
            .filter(|(_, s)| !s.task.is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let deadline = Instant::now().checked_add(grace);
        let mut report = DrainReport::default();
        for id in in_flight {
            match self.await_until(id, deadline, grace).await {
                Ok(_) => report.completed = report.completed.saturating_add(1),
                Err(TaskError::AwaitTimeout { .. }) => {
                    if self.cancel(id) {
                        report.cancelled = report.cancelled.saturating_add(1);
                    } else {
                        report.completed = report.completed.saturating_add(1);
                    }
                },
                Err(_) => {},
            }
        }
        info!(
            completed = report.completed,
            cancelled = report.cancelled,
            "Task tracker drained"
        );
        report
    }
}

struct StartGate {
    open: Arc<Notify>,
    hold: Duration,
}

async fn run_task(
    inner: Arc<Inner>,
    tool: Arc<dyn TaskTool>,
    input: Value,
    ctx: ToolContext,
    gate: StartGate,
    deadline: Option<Instant>,
) {
    let id = ctx.task_id;

    tokio::select! {
        () = gate.open.notified() => {},
        () = tokio::time::sleep(gate.hold) => {},
        () = ctx.cancellation.cancelled() => return,
    }

    if let Some(deadline) = deadline
        && Instant::now() >= deadline
    {
        inner.finish(id, TaskStatus::TimedOut, None, Some("timed out before start".to_string()));
        warn!(task_id = %id, "Task timed out while pending");
        return;
    }
    if inner.transition(id, AsyncTask::start).is_none() {
        // Cancelled (or swept) before it could start.
        return;
    }

    let run = tool.execute(input, &ctx);
    let outcome = match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, run).await.ok(),
        None => Some(run.await),
    };

    let written = match outcome {
        Some(Ok(value)) => inner.finish(id, TaskStatus::Completed, Some(value), None),
        Some(Err(e)) => inner.finish(id, TaskStatus::Failed, None, Some(e.to_string())),
        None => {
            ctx.cancellation.cancel();
            warn!(task_id = %id, tool = %tool.name(), "Task timed out");
            inner.finish(id, TaskStatus::TimedOut, None, Some("timed out".to_string()))
        },
    };
    match written {
        Some(task) => debug!(task_id = %id, status = %task.status, "Task finished"),
        None => debug!(task_id = %id, "Late task result discarded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ToolError, ToolResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct Failing;

    #[async_trait]
    impl TaskTool for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
            Err(ToolError::Execution("upstream refused".into()))
        }
    }

    /// Ignores cancellation and never finishes on its own.
    struct Stubborn;

    #[async_trait]
    impl TaskTool for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn description(&self) -> &str {
            "sleeps forever"
        }

        async fn execute(&self, _input: Value, _ctx: &ToolContext) -> ToolResult {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    fn tracker() -> AsyncTaskTracker {
        let tools = ToolTable::with_builtins();
        tools.register(Arc::new(Failing)).unwrap();
        tools.register(Arc::new(Stubborn)).unwrap();
        AsyncTaskTracker::new(Arc::new(tools))
    }

    fn delay(ms: u64) -> Value {
        json!({"ms": ms, "value": ms})
    }

    #[tokio::test]
    async fn test_call_async_returns_pending_task() {
        let tracker = tracker();
        let id = tracker
            .call_async("echo", json!(1), Map::new(), TaskConfig::default())
            .unwrap();

        let task = tracker.status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.correlation_id, id.to_string());
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fresh_tasks_read_back_pending_on_multi_thread_runtime() {
        let tracker = tracker().with_start_hold(Duration::from_secs(60));
        let mut ids = Vec::new();
        for i in 0..2000 {
            let id = tracker
                .call_async("echo", json!(i), Map::new(), TaskConfig::default())
                .unwrap();
            let task = tracker.status(id).unwrap();
            assert_eq!(task.status, TaskStatus::Pending, "task {i} started early");
            assert!(task.started_at.is_none());
            ids.push(id);
        }

        for id in ids {
            let task = tracker.await_completion(id, Duration::from_secs(5)).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unobserved_task_starts_after_hold() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let tracker = tracker()
            .with_events(bus)
            .with_start_hold(Duration::from_millis(20));
        tracker
            .call_async("echo", json!(1), Map::new(), TaskConfig::default())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.active_count(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tracker.active_count(), 0);

        let statuses: Vec<String> = rx
            .drain()
            .iter()
            .filter_map(|e| match e.as_ref() {
                ConduitEvent::TaskStatusChanged { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, ["pending", "running", "completed"]);
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_fast() {
        let tracker = tracker();
        let err = tracker
            .call_async("nope", Value::Null, Map::new(), TaskConfig::default())
            .unwrap_err();
        assert!(matches!(err, TaskError::UnknownTool(name) if name == "nope"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_call_async_outside_runtime() {
        let tracker = tracker();
        let err = tracker
            .call_async("echo", Value::Null, Map::new(), TaskConfig::default())
            .unwrap_err();
        assert!(matches!(err, TaskError::NoRuntime));
    }

    #[tokio::test]
    async fn test_completion_and_failure() {
        let tracker = tracker();
        let ok = tracker
            .call_async("echo", json!("x"), Map::new(), TaskConfig::default())
            .unwrap();
        let bad = tracker
            .call_async("failing", Value::Null, Map::new(), TaskConfig::default())
            .unwrap();

        let ok = tracker.await_completion(ok, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.result, Some(json!("x")));
        assert!(ok.started_at.is_some() && ok.completed_at.is_some());

        let bad = tracker.await_completion(bad, Duration::from_secs(1)).await.unwrap();
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("upstream refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_terminal() {
        let tracker = tracker();
        let start = Instant::now();
        let id = tracker
            .call_async(
                "stubborn",
                Value::Null,
                Map::new(),
                TaskConfig::default().with_timeout_ms(500),
            )
            .unwrap();

        let task = tracker.await_completion(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(600));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(tracker.status(id).unwrap().status, TaskStatus::TimedOut);
        assert!(!tracker.cancel(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let tracker = tracker().with_default_timeout(Some(Duration::from_millis(100)));
        let id = tracker
            .call_async("stubborn", Value::Null, Map::new(), TaskConfig::default())
            .unwrap();
        assert_eq!(tracker.status(id).unwrap().timeout_ms, Some(100));
        let task = tracker.await_completion(id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_timeout_does_not_mutate_task() {
        let tracker = tracker();
        let id = tracker
            .call_async("delay", delay(10_000), Map::new(), TaskConfig::default())
            .unwrap();

        let err = tracker
            .await_completion(id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::AwaitTimeout { waited_ms: 50, .. }));
        assert_eq!(tracker.status(id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_await_unknown_task() {
        let tracker = tracker();
        let err = tracker
            .await_completion(TaskId::new(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task() {
        let tracker = tracker();
        let id = tracker
            .call_async("delay", delay(60_000), Map::new(), TaskConfig::default())
            .unwrap();
        assert_eq!(tracker.status(id).unwrap().status, TaskStatus::Pending);
        tokio::task::yield_now().await;
        assert_eq!(tracker.status(id).unwrap().status, TaskStatus::Running);

        assert!(tracker.cancel(id));
        let task = tracker.status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("cancelled"));

        // The tool stops on the token; its late error is discarded.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tracker.status(id).unwrap().error.as_deref(), Some("cancelled"));
        assert!(!tracker.cancel(id));
        assert!(!tracker.cancel(TaskId::new()));
    }

    #[tokio::test]
    async fn test_cancel_pending_task_never_starts() {
        let tracker = tracker();
        let id = tracker
            .call_async("echo", json!(1), Map::new(), TaskConfig::default())
            .unwrap();
        assert!(tracker.cancel(id));

        tokio::task::yield_now().await;
        let task = tracker.status(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.started_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlation_groups() {
        let tracker = tracker();
        let cfg = TaskConfig::default().with_correlation_id("req-1");
        let a = tracker
            .call_async("delay", delay(20), Map::new(), cfg.clone())
            .unwrap();
        let b = tracker
            .call_async("delay", delay(10), Map::new(), cfg)
            .unwrap();
        tracker
            .call_async("echo", json!(0), Map::new(), TaskConfig::default())
            .unwrap();

        let group: Vec<_> = tracker.tasks_by_correlation("req-1").iter().map(|t| t.id).collect();
        assert_eq!(group, [a, b]);

        let done = tracker
            .await_correlation("req-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(done.iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_unfinished_tasks() {
        let tracker = tracker();
        let done = tracker
            .call_async("echo", json!(1), Map::new(), TaskConfig::default())
            .unwrap();
        let running = tracker
            .call_async("delay", delay(60_000), Map::new(), TaskConfig::default())
            .unwrap();
        tracker.await_completion(done, Duration::from_secs(1)).await.unwrap();

        assert_eq!(tracker.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.sweep(Duration::ZERO), 1);
        assert!(tracker.status(done).is_none());
        assert!(tracker.status(running).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_then_cancels() {
        let tracker = tracker();
        tracker
            .call_async("delay", delay(100), Map::new(), TaskConfig::default())
            .unwrap();
        let slow = tracker
            .call_async("stubborn", Value::Null, Map::new(), TaskConfig::default())
            .unwrap();

        let report = tracker.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report, DrainReport { completed: 1, cancelled: 1 });
        assert_eq!(tracker.status(slow).unwrap().error.as_deref(), Some("cancelled"));
        assert!(matches!(
            tracker.call_async("echo", Value::Null, Map::new(), TaskConfig::default()),
            Err(TaskError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let tracker = tracker().with_events(bus);

        let id = tracker
            .call_async("echo", json!(1), Map::new(), TaskConfig::default())
            .unwrap();
        tracker.await_completion(id, Duration::from_secs(1)).await.unwrap();

        let statuses: Vec<String> = rx
            .drain()
            .iter()
            .filter_map(|e| match e.as_ref() {
                ConduitEvent::TaskStatusChanged { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, ["pending", "running", "completed"]);
    }
}
