//! Category-scoped debug logging.
//!
//! Every category has a static `_`-separated path such as
//! `Planner_scheduleWork_noReplenishAfter`. A message is emitted when any
//! leading run of segments (`Planner`, `Planner_scheduleWork`, ...) is listed
//! in [`Config::debug`](crate::config::Config::debug).

use std::fmt::{self, Display};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    ExecutorUpdate,
    ExecutorLaunch,
    ExecutorNotEnoughThreads,
    ExecutorClusters,
    ExecutorCapacity,
    SchedulerRun,
    PlannerTransition,
    PlannerBootstrap,
    PlannerAlreadyScheduled,
    PlannerUndefined,
    PlannerDefenseTooHigh,
    PlannerNotEnoughThreads,
    PlannerNoReplenishBefore,
    PlannerNoReplenishAfter,
    PlannerExtract,
    PlannerNoExtractNeeded,
    DriverResults,
}

impl Category {
    pub const ALL: &'static [Category] = &[
        Category::ExecutorUpdate,
        Category::ExecutorLaunch,
        Category::ExecutorNotEnoughThreads,
        Category::ExecutorClusters,
        Category::ExecutorCapacity,
        Category::SchedulerRun,
        Category::PlannerTransition,
        Category::PlannerBootstrap,
        Category::PlannerAlreadyScheduled,
        Category::PlannerUndefined,
        Category::PlannerDefenseTooHigh,
        Category::PlannerNotEnoughThreads,
        Category::PlannerNoReplenishBefore,
        Category::PlannerNoReplenishAfter,
        Category::PlannerExtract,
        Category::PlannerNoExtractNeeded,
        Category::DriverResults,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Category::ExecutorUpdate => "Executor_update",
            Category::ExecutorLaunch => "Executor_launch",
            Category::ExecutorNotEnoughThreads => "Executor_notEnoughThreads",
            Category::ExecutorClusters => "Executor_clusters",
            Category::ExecutorCapacity => "Executor_capacity",
            Category::SchedulerRun => "Scheduler_run",
            Category::PlannerTransition => "Planner_transition",
            Category::PlannerBootstrap => "Planner_bootstrap",
            Category::PlannerAlreadyScheduled => "Planner_scheduleWork_alreadyScheduled",
            Category::PlannerUndefined => "Planner_scheduleWork_undefined",
            Category::PlannerDefenseTooHigh => "Planner_trySchedule_defense",
            Category::PlannerNotEnoughThreads => "Planner_trySchedule_notEnoughThreads",
            Category::PlannerNoReplenishBefore => "Planner_scheduleWork_noReplenishBefore",
            Category::PlannerNoReplenishAfter => "Planner_scheduleWork_noReplenishAfter",
            Category::PlannerExtract => "Planner_scheduleWork_extract",
            Category::PlannerNoExtractNeeded => "Planner_scheduleWork_noExtractNeeded",
            Category::DriverResults => "Driver_results",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Whether `path` or any of its leading segment runs is enabled.
pub fn is_enabled(enabled: &[String], path: &str) -> bool {
    if enabled.is_empty() {
        return false;
    }
    let mut end = 0;
    for segment in path.split('_') {
        end += segment.len();
        let candidate = &path[..end];
        if enabled.iter().any(|e| e == candidate) {
            return true;
        }
        end += 1;
    }
    false
}

pub fn log(enabled: &[String], category: Category, message: impl Display) {
    if is_enabled(enabled, category.path()) {
        tracing::info!(category = category.path(), "{}", message);
    }
}
