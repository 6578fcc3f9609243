use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;

use crate::context::Millis;
use crate::fleet::JobKind;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TaskFn = Box<dyn FnOnce() -> TaskFuture + Send>;
/// Offset recomputed each time the queue looks at the task. Must not touch the
/// scheduler itself.
pub type DueFn = Arc<dyn Fn() -> Millis + Send + Sync>;

/// When a task becomes due, relative to the moment it is scheduled.
#[derive(Clone)]
pub enum Due {
    In(Millis),
    Dynamic(DueFn),
}

impl Due {
    pub fn dynamic(f: impl Fn() -> Millis + Send + Sync + 'static) -> Self {
        Due::Dynamic(Arc::new(f))
    }
}

impl std::fmt::Debug for Due {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Due::In(ms) => write!(f, "In({ms})"),
            Due::Dynamic(_) => write!(f, "Dynamic(..)"),
        }
    }
}

/// Absolute due time, fixed or re-evaluated against the scheduling instant.
#[derive(Clone)]
pub(crate) enum Deadline {
    Fixed(Millis),
    Dynamic { base: Millis, offset: DueFn },
}

impl Deadline {
    pub(crate) fn from_due(due: Due, now: Millis) -> Self {
        match due {
            Due::In(ms) => Deadline::Fixed(now + ms),
            Due::Dynamic(offset) => Deadline::Dynamic { base: now, offset },
        }
    }

    pub(crate) fn resolve(&self) -> Millis {
        match self {
            Deadline::Fixed(at) => *at,
            Deadline::Dynamic { base, offset } => base + offset(),
        }
    }
}

/// Which jobs a task is going to launch. Lets observers count queued work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMeta {
    pub target: String,
    pub kind: JobKind,
    pub threads: u32,
}

/// A deferred callback.
pub struct Task {
    pub name: String,
    pub due: Due,
    pub what: TaskFn,
    pub meta: Option<TaskMeta>,
}

impl Task {
    pub fn new<F, Fut>(name: impl Into<String>, due: Due, what: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            due,
            what: Box::new(move || Box::pin(what()) as TaskFuture),
            meta: None,
        }
    }

    pub fn with_meta(mut self, target: impl Into<String>, kind: JobKind, threads: u32) -> Self {
        self.meta = Some(TaskMeta {
            target: target.into(),
            kind,
            threads,
        });
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("due", &self.due)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}
