//! Single-target orchestration.
//!
//! A [`TargetRunner`] owns the executor, scheduler and planner for one
//! target and registers a recurring tick on the scheduler. Each tick polls
//! the fleet, forwards finished-job results, advances the planner and
//! triggers the emergency stop when the target is nearly drained.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::{Context, Millis};
use crate::debug::Category;
use crate::error::Result;
use crate::fleet::{Executor, JobKind, JobResult, SharedExecutor};
use crate::planner::{BatchPlanner, CyclePlan, PlannerState};
use crate::scheduler::{Scheduler, TaskHandle};

#[derive(Clone)]
pub struct TargetRunner {
    ctx: Arc<Context>,
    target: Arc<str>,
    executor: SharedExecutor,
    scheduler: Scheduler,
    planner: Arc<Mutex<BatchPlanner>>,
    results: Option<mpsc::Sender<JobResult>>,
    config_path: Option<PathBuf>,
}

impl TargetRunner {
    pub fn new(ctx: Arc<Context>, target: impl Into<String>) -> Self {
        let target: String = target.into();
        let executor = Executor::shared(ctx.clone());
        let scheduler = Scheduler::new(ctx.clone());
        let planner = BatchPlanner::new(ctx.clone(), executor.clone(), scheduler.clone(), target.clone());
        Self {
            ctx,
            target: target.into(),
            executor,
            scheduler,
            planner: Arc::new(Mutex::new(planner)),
            results: None,
            config_path: None,
        }
    }

    /// Forward every finished job's result to `tx`.
    pub fn with_results(mut self, tx: mpsc::Sender<JobResult>) -> Self {
        self.results = Some(tx);
        self
    }

    /// Re-read the configuration from `path` at the start of every tick.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn executor(&self) -> &SharedExecutor {
        &self.executor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub async fn planner_state(&self) -> PlannerState {
        self.planner.lock().await.state()
    }

    pub async fn plan_cycle(&self) -> Result<CyclePlan> {
        self.planner.lock().await.plan_cycle()
    }

    /// Register the recurring tick. Must be called once before [`Self::step`].
    ///
    /// The period is the configured tick length at the time each tick is
    /// scheduled, so a reloaded `tickLength` takes effect from the next tick.
    pub fn start(&self) -> TaskHandle {
        let runner = self.clone();
        let ctx = self.ctx.clone();
        self.scheduler.set_interval_with(
            "tick",
            move || ctx.tick_length(),
            move || {
                let runner = runner.clone();
                async move { runner.tick().await }
            },
        )
    }

    pub async fn tick(&self) {
        if let Some(path) = &self.config_path {
            if let Err(e) = self.ctx.reload_config(path) {
                tracing::warn!(error = %e, path = %path.display(), "Failed to reload configuration");
            }
        }

        let results = self.executor.lock().await.update();
        self.forward(results);

        self.planner.lock().await.tick().await;

        let config = self.ctx.config();
        let Some(state) = self.ctx.model().state(&self.target) else {
            return;
        };
        if state.value_ratio < config.emergency_value_ratio {
            self.executor.lock().await.emergency(&self.target);
        }
        if state.value_ratio <= 0.0 {
            tracing::warn!(target_id = %self.target, "Target has no value left");
        }
    }

    fn forward(&self, results: Vec<JobResult>) {
        if results.is_empty() {
            return;
        }
        let extracted: f64 = results
            .iter()
            .filter(|r| r.kind == JobKind::Extract)
            .map(|r| r.impact)
            .sum();
        self.ctx.log(
            Category::DriverResults,
            format_args!("{} results, {extracted:.0} extracted", results.len()),
        );
        let Some(tx) = &self.results else {
            return;
        };
        for result in results {
            if let Err(e) = tx.try_send(result) {
                tracing::warn!(error = %e, "Dropping job result");
            }
        }
    }

    /// Run all due scheduler tasks. Returns the time until the next one.
    pub async fn step(&self) -> Result<Millis> {
        self.scheduler.run().await
    }

    /// Kill every job against the target. Returns threads killed.
    pub async fn shutdown(&self) -> u32 {
        let killed = self.executor.lock().await.kill_workers(None, Some(&self.target));
        tracing::info!(target_id = %self.target, killed, "Runner stopped");
        killed
    }
}

/// Drive `runner` on the wall clock until `shutdown` is cancelled, then kill
/// its workers. Returns the threads killed on the way out.
pub async fn run_until_shutdown(runner: &TargetRunner, shutdown: CancellationToken) -> Result<u32> {
    let ticker = runner.start();
    tracing::info!(target_id = %runner.target(), "Runner started");

    let outcome = loop {
        let wait = match runner.step().await {
            Ok(wait) => wait,
            Err(e) => break Err(e),
        };
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, stopping runner");
                break Ok(());
            }
            _ = tokio::time::sleep(Duration::from_secs_f64(wait.max(0.0) / 1000.0)) => {}
        }
    };

    ticker.cancel();
    let killed = runner.shutdown().await;
    outcome.map(|()| killed)
}
