use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use uuid::Uuid;

use crate::context::{Context, Millis};
use crate::debug::Category;
use crate::error::{FleetError, Result};
use crate::fleet::JobKind;
use crate::scheduler::task::{Deadline, Due, Task, TaskFn, TaskMeta};

struct Pending {
    id: Uuid,
    name: String,
    deadline: Deadline,
    what: TaskFn,
    meta: Option<TaskMeta>,
}

#[derive(Default)]
struct Inner {
    tasks: Vec<Pending>,
}

impl Inner {
    fn sort(&mut self) {
        self.tasks
            .sort_by(|a, b| a.deadline.resolve().total_cmp(&b.deadline.resolve()));
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// A pending task as seen from outside the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub name: String,
    pub due: Millis,
    pub meta: Option<TaskMeta>,
}

/// Cancellation handle returned by [`Scheduler::schedule`].
///
/// Cheap to clone. Cancelling removes the task if it has not fired yet; a task
/// that is already running finishes, but nothing can be scheduled under the
/// handle afterwards. That is what stops an interval from its own callback.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: Uuid,
    inner: Weak<Mutex<Inner>>,
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Remove the task from the queue and refuse later tasks under this
    /// handle. Returns false if the handle was already cancelled and nothing
    /// was left to remove.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        let Some(inner) = self.inner.upgrade() else {
            return first;
        };
        let mut inner = lock(&inner);
        let before = inner.tasks.len();
        inner.tasks.retain(|t| t.id != self.id);
        first || before != inner.tasks.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        !self.is_cancelled()
            && self
                .inner
                .upgrade()
                .is_some_and(|inner| lock(&inner).tasks.iter().any(|t| t.id == self.id))
    }
}

/// Single-threaded deferred-callback queue ordered by due time.
///
/// Cloning yields another handle onto the same queue, so tasks can schedule
/// follow-up work while they run.
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<Context>,
    inner: Arc<Mutex<Inner>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn insert(&self, id: Uuid, task: Task) {
        let pending = Pending {
            id,
            name: task.name,
            deadline: Deadline::from_due(task.due, self.ctx.now()),
            what: task.what,
            meta: task.meta,
        };
        let mut inner = lock(&self.inner);
        inner.tasks.retain(|t| t.id != id);
        let due = pending.deadline.resolve();
        let at = inner
            .tasks
            .iter()
            .position(|t| t.deadline.resolve() > due)
            .unwrap_or(inner.tasks.len());
        inner.tasks.insert(at, pending);
    }

    /// A handle with nothing scheduled under it yet.
    pub fn new_handle(&self) -> TaskHandle {
        TaskHandle {
            id: Uuid::new_v4(),
            inner: Arc::downgrade(&self.inner),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn schedule(&self, task: Task) -> TaskHandle {
        let handle = self.new_handle();
        self.insert(handle.id, task);
        handle
    }

    /// Schedule `task` under an existing handle, so cancelling that handle
    /// cancels `task`. Any task still pending under the handle is replaced.
    /// Dropped if the handle was already cancelled.
    pub fn schedule_under(&self, handle: &TaskHandle, task: Task) {
        if handle.is_cancelled() {
            tracing::debug!(task = %task.name, "Handle cancelled, not scheduling");
            return;
        }
        self.insert(handle.id, task);
    }

    pub fn set_timeout<F, Fut>(&self, name: impl Into<String>, delay: Millis, what: F) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule(Task::new(name, Due::In(delay), what))
    }

    /// Run `what` every `period` until the returned handle is cancelled.
    pub fn set_interval<F, Fut>(&self, name: impl Into<String>, period: Millis, what: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_interval_with(name, move || period, what)
    }

    /// Like [`Self::set_interval`], but `period` is asked again each time the
    /// next run is scheduled, so the interval follows a changing value.
    pub fn set_interval_with<P, F, Fut>(&self, name: impl Into<String>, period: P, what: F) -> TaskHandle
    where
        P: Fn() -> Millis + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.new_handle();
        self.schedule_interval(handle.clone(), name.into(), Arc::new(period), Arc::new(what));
        handle
    }

    fn schedule_interval<P, F, Fut>(&self, handle: TaskHandle, name: String, period: Arc<P>, what: Arc<F>)
    where
        P: Fn() -> Millis + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.clone();
        let next = handle.clone();
        let task_name = name.clone();
        let delay = (*period)();
        let task = Task::new(task_name, Due::In(delay), move || async move {
            (*what)().await;
            scheduler.schedule_interval(next, name, period, what);
        });
        self.schedule_under(&handle, task);
    }

    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        handle.cancel()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).tasks.is_empty()
    }

    /// Snapshot of pending tasks in due order.
    pub fn pending(&self) -> Vec<PendingTask> {
        let mut inner = lock(&self.inner);
        inner.sort();
        inner
            .tasks
            .iter()
            .map(|t| PendingTask {
                name: t.name.clone(),
                due: t.deadline.resolve(),
                meta: t.meta.clone(),
            })
            .collect()
    }

    /// Threads of `kind` against `target` that pending tasks intend to launch.
    pub fn queued_threads(&self, target: &str, kind: JobKind) -> u32 {
        lock(&self.inner)
            .tasks
            .iter()
            .filter_map(|t| t.meta.as_ref())
            .filter(|m| m.target == target && m.kind == kind)
            .map(|m| m.threads)
            .sum()
    }

    fn pop_due(&self) -> Option<Pending> {
        let mut inner = lock(&self.inner);
        inner.sort();
        let due = inner.tasks.first().map(|t| t.deadline.resolve())?;
        if due > self.ctx.now() {
            return None;
        }
        Some(inner.tasks.remove(0))
    }

    /// Run every task that is due, one at a time in due order, yielding
    /// between tasks. Tasks scheduled while running are picked up in the same
    /// call only if they are already due.
    ///
    /// Returns the time until the next task is due.
    pub async fn run(&self) -> Result<Millis> {
        let slow_task_ms = self.ctx.config().slow_task_ms;
        while let Some(task) = self.pop_due() {
            let started = std::time::Instant::now();
            self.ctx
                .log(Category::SchedulerRun, format_args!("Running {}", task.name));
            (task.what)().await;
            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
            if elapsed > slow_task_ms {
                tracing::info!(task = %task.name, elapsed_ms = elapsed.round(), "Slow scheduler task");
            }
            tokio::task::yield_now().await;
        }

        let next = lock(&self.inner)
            .tasks
            .iter()
            .map(|t| t.deadline.resolve())
            .min_by(|a, b| a.total_cmp(b))
            .ok_or(FleetError::SchedulerEmpty)?;
        let sleep = next - self.ctx.now();
        if sleep > 1000.0 {
            tracing::info!(seconds = (sleep / 1000.0).round(), "Scheduler will run again");
        }
        Ok(sleep)
    }
}
