use std::sync::Arc;

use serde::Serialize;

use crate::context::{Context, Millis};
use crate::debug::Category;
use crate::error::{FleetError, Result};
use crate::fleet::{JobKind, SharedExecutor, TargetState};
use crate::planner::formulas::{self, DEFENSE_EPSILON, RATIO_EPSILON};
use crate::scheduler::{Due, Scheduler, Task, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlannerState {
    /// Drive defense to its minimum and value to its maximum.
    Bootstrap,
    /// Launch one overlapping four-step cycle per tick.
    SteadyState,
}

/// One step of a cycle. Times are absolute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub kind: JobKind,
    pub threads: u32,
    pub start_at: Millis,
    pub finish_at: Millis,
}

impl Step {
    fn new(kind: JobKind, threads: u32, finish_at: Millis, duration: Millis) -> Self {
        Self {
            kind,
            threads,
            start_at: finish_at - duration,
            finish_at,
        }
    }
}

/// The four steps of a cycle, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclePlan {
    pub target: String,
    pub planned_at: Millis,
    pub extract: Step,
    pub suppress_extract: Step,
    pub replenish: Step,
    pub suppress_replenish: Step,
}

impl CyclePlan {
    pub fn steps(&self) -> [&Step; 4] {
        [
            &self.extract,
            &self.suppress_extract,
            &self.replenish,
            &self.suppress_replenish,
        ]
    }
}

/// Everything a scheduled cycle task needs. Cheap to clone into closures.
#[derive(Clone)]
struct Crew {
    ctx: Arc<Context>,
    executor: SharedExecutor,
    scheduler: Scheduler,
    target: Arc<str>,
}

impl Crew {
    /// Launch `threads` of `kind` if the target and fleet allow all of them.
    async fn try_launch(&self, kind: JobKind, threads: u32) -> bool {
        if threads == 0 {
            return true;
        }
        let target = &*self.target;
        if kind.needs_low_defense() {
            let threshold = self.ctx.config().defense_threshold;
            match self.ctx.model().state(target) {
                Some(state) if state.defense > state.min_defense + threshold => {
                    self.ctx.log(
                        Category::PlannerDefenseTooHigh,
                        format_args!(
                            "Not starting {threads} {kind} against {target}: defense {:.3} > {:.3}",
                            state.defense,
                            state.min_defense + threshold
                        ),
                    );
                    return false;
                }
                Some(_) => {}
                None => {
                    tracing::warn!(target_id = %target, %kind, "Target state unavailable, not launching");
                    return false;
                }
            }
        }

        let mut executor = self.executor.lock().await;
        let available = executor.get_available_threads(kind);
        if available < threads {
            self.ctx.log(
                Category::PlannerNotEnoughThreads,
                format_args!("Not starting {kind} against {target}: wanted {threads}, {available} available"),
            );
            return false;
        }
        let started = executor.exec(target, kind, threads).await;
        if started < threads {
            tracing::warn!(
                target_id = %target,
                %kind,
                wanted = threads,
                started,
                "Could not start all threads"
            );
            return false;
        }
        true
    }

    /// Runs shortly after this cycle's Replenish has been launched. Re-reads
    /// the Replenish completions around the planned Extract finish and
    /// schedules the Extract launch so it lands just before the later one.
    async fn place_extract(&self, handle: TaskHandle, wanted: u32, planned_finish: Millis) {
        let target = &*self.target;
        if wanted == 0 {
            self.ctx.log(
                Category::PlannerNoExtractNeeded,
                format_args!("No extract wanted against {target}"),
            );
            return;
        }
        let eps = self.ctx.time_epsilon();
        let around = self
            .executor
            .lock()
            .await
            .count_threads_finishing_just_around(JobKind::Replenish, target, planned_finish);
        let Some(before) = around.before else {
            self.ctx.log(
                Category::PlannerNoReplenishBefore,
                format_args!("No replenish finishing before {planned_finish} against {target}"),
            );
            return;
        };
        let Some(after) = around.after else {
            self.ctx.log(
                Category::PlannerNoReplenishAfter,
                format_args!("No replenish finishing after {planned_finish} against {target}"),
            );
            return;
        };

        let finish_at = after.when - 4.0 * eps;
        if finish_at <= before.when {
            self.ctx.log(
                Category::PlannerNoReplenishBefore,
                format_args!(
                    "Replenish clusters at {} and {} leave no room for extract",
                    before.when, after.when
                ),
            );
            return;
        }
        let start_in = finish_at - self.ctx.now() - self.ctx.model().duration(JobKind::Extract, target);
        if start_in < -eps {
            self.ctx.log(
                Category::PlannerExtract,
                format_args!("Too late to land extract at {finish_at} against {target}"),
            );
            return;
        }
        self.ctx.log(
            Category::PlannerExtract,
            format_args!(
                "Extract against {target} starts in {:.0}ms, lands at {finish_at} (planned {planned_finish})",
                start_in.max(0.0)
            ),
        );

        let crew = self.clone();
        let (from, until) = (before.when, after.when);
        let task = Task::new("start-extract", Due::In(start_in.max(0.0)), move || async move {
            crew.launch_extract(wanted, from, until).await;
        })
        .with_meta(target, JobKind::Extract, wanted);
        self.scheduler.schedule_under(&handle, task);
    }

    async fn launch_extract(&self, wanted: u32, from: Millis, until: Millis) {
        let target = &*self.target;
        let existing = self
            .executor
            .lock()
            .await
            .count_threads_finishing_between(JobKind::Extract, target, from, until);
        if existing >= wanted {
            if existing > wanted {
                self.executor
                    .lock()
                    .await
                    .cap_workers(JobKind::Extract, target, wanted, from, until);
            }
            self.ctx.log(
                Category::PlannerNoExtractNeeded,
                format_args!("{existing} extract threads already land between {from} and {until}"),
            );
            return;
        }
        self.try_launch(JobKind::Extract, wanted - existing).await;
    }
}

/// Per-target batch planner.
pub struct BatchPlanner {
    crew: Crew,
    state: PlannerState,
    /// When the bootstrap wave in flight has fully landed.
    wave_lands_at: Option<Millis>,
}

impl BatchPlanner {
    /// Starts in Bootstrap unless the target is already close enough to its
    /// desired value ratio.
    pub fn new(
        ctx: Arc<Context>,
        executor: SharedExecutor,
        scheduler: Scheduler,
        target: impl Into<String>,
    ) -> Self {
        let target: String = target.into();
        let ratio = ctx.config().target_value_ratio;
        let state = match ctx.model().state(&target) {
            Some(s) if s.value_ratio >= ratio * ratio => PlannerState::SteadyState,
            _ => PlannerState::Bootstrap,
        };
        tracing::info!(target_id = %target, ?state, "Planner created");
        Self {
            crew: Crew {
                ctx,
                executor,
                scheduler,
                target: target.into(),
            },
            state,
            wave_lands_at: None,
        }
    }

    pub fn target(&self) -> &str {
        &self.crew.target
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn is_steady_state(&self) -> bool {
        self.state == PlannerState::SteadyState
    }

    /// Called once per tick.
    pub async fn tick(&mut self) {
        match self.state {
            PlannerState::Bootstrap => self.bootstrap().await,
            PlannerState::SteadyState => self.schedule_work().await,
        }
    }

    /// One bootstrap wave: Suppress to minimum defense now, Replenish landing
    /// two epsilons after it, then Suppress for the Replenish two epsilons
    /// later. The next wave is planned only once this one has landed.
    async fn bootstrap(&mut self) {
        let ctx = self.crew.ctx.clone();
        let target = self.crew.target.clone();
        if let Some(lands_at) = self.wave_lands_at {
            if ctx.now() < lands_at {
                return;
            }
            self.wave_lands_at = None;
        }
        let Some(state) = ctx.model().state(&target) else {
            tracing::warn!(target_id = %target, "Target state unavailable, skipping bootstrap tick");
            return;
        };

        if state.value_ratio >= 1.0 - RATIO_EPSILON && state.defense <= state.min_defense + DEFENSE_EPSILON {
            self.state = PlannerState::SteadyState;
            ctx.log(
                Category::PlannerTransition,
                format_args!("{target} bootstrapped, entering steady state"),
            );
            tracing::info!(target_id = %target, "Planner entered steady state");
            return;
        }

        let (suppress_before, replenish, suppress_after) = match self.bootstrap_threads(&state).await {
            Ok(counts) => counts,
            Err(e) => {
                ctx.log(Category::PlannerUndefined, format_args!("{target}: {e}"));
                return;
            }
        };

        let model = ctx.model();
        let eps = ctx.time_epsilon();
        let suppress_lands_in = model.duration(JobKind::Suppress, &target);
        let replenish_lands_in = suppress_lands_in + 2.0 * eps;
        let suppress_after_lands_in = replenish_lands_in + 2.0 * eps;

        let started = self
            .crew
            .executor
            .lock()
            .await
            .exec_up_to(&target, JobKind::Suppress, suppress_before)
            .await;
        self.schedule_bootstrap(
            "bootstrap-replenish",
            JobKind::Replenish,
            replenish,
            replenish_lands_in - model.duration(JobKind::Replenish, &target),
        );
        // counted together with the first Suppress wave, which is still running
        self.schedule_bootstrap(
            "bootstrap-suppress-after",
            JobKind::Suppress,
            suppress_before + suppress_after,
            suppress_after_lands_in - suppress_lands_in,
        );
        self.wave_lands_at = Some(ctx.now() + suppress_after_lands_in + 2.0 * eps);

        ctx.log(
            Category::PlannerBootstrap,
            format_args!(
                "{target}: ratio {:.4} defense {:.3}/{:.3}, suppress {suppress_before} (+{started}), replenish {replenish}, suppress after {suppress_after}",
                state.value_ratio, state.defense, state.min_defense
            ),
        );
    }

    fn schedule_bootstrap(&self, name: &str, kind: JobKind, threads: u32, delay: Millis) {
        let crew = self.crew.clone();
        let task = Task::new(name, Due::In(delay.max(0.0)), move || async move {
            crew.executor
                .lock()
                .await
                .exec_up_to(&crew.target, kind, threads)
                .await;
        })
        .with_meta(&*self.crew.target, kind, threads);
        self.crew.scheduler.schedule(task);
    }

    /// Thread counts for a bootstrap wave: Suppress to minimum defense, the
    /// Replenish to full value at minimum defense, and the Suppress that
    /// Replenish calls for.
    async fn bootstrap_threads(&self, state: &TargetState) -> Result<(u32, u32, u32)> {
        let model = self.crew.ctx.model();
        let target = &*self.crew.target;
        let replenish = match formulas::replenish_threads(
            model.as_ref(),
            target,
            state.value_ratio,
            1.0,
            Some(state.min_defense),
        ) {
            Ok(n) => n,
            // Nothing to multiply: throw every Replenish thread the fleet has at it.
            Err(_) if state.value_ratio <= 0.0 => self
                .crew
                .executor
                .lock()
                .await
                .get_maximum_threads(JobKind::Replenish),
            Err(e) => return Err(e),
        };
        let before = formulas::suppress_to_minimum(model.as_ref(), state)?;
        let after = formulas::suppress_after(model.as_ref(), JobKind::Replenish, replenish)?;
        Ok((before, replenish, after))
    }

    /// Compute the next cycle without launching anything.
    ///
    /// Suppress-for-extract lands one full Suppress duration from now; the
    /// other steps are spaced two time-epsilons apart around it.
    pub fn plan_cycle(&self) -> Result<CyclePlan> {
        let ctx = &self.crew.ctx;
        let target = &*self.crew.target;
        let config = ctx.config();
        let model = ctx.model().as_ref();
        let eps = config.time_epsilon;
        let now = ctx.now();

        let state = model
            .state(target)
            .ok_or_else(|| FleetError::ComputationUndefined(format!("no state for {target}")))?;

        let suppress_extract_at = now + model.duration(JobKind::Suppress, target);
        let extract_at = suppress_extract_at - 2.0 * eps;
        let replenish_at = suppress_extract_at + 2.0 * eps;
        let suppress_replenish_at = replenish_at + 2.0 * eps;

        let extract = formulas::extract_threads(model, target, 1.0, config.target_value_ratio)?;
        let suppress_extract = formulas::suppress_after(
            model,
            JobKind::Extract,
            formulas::with_margin(extract, config.suppress_margin)?,
        )?;
        let replenish = formulas::replenish_threads(
            model,
            target,
            config.target_value_ratio,
            1.0,
            Some(state.min_defense + config.defense_threshold),
        )?;
        let suppress_replenish = formulas::suppress_after(
            model,
            JobKind::Replenish,
            formulas::with_margin(replenish, config.suppress_margin)?,
        )?;

        let step = |kind, threads, finish_at| Step::new(kind, threads, finish_at, model.duration(kind, target));
        Ok(CyclePlan {
            target: target.to_string(),
            planned_at: now,
            extract: step(JobKind::Extract, extract, extract_at),
            suppress_extract: step(JobKind::Suppress, suppress_extract, suppress_extract_at),
            replenish: step(JobKind::Replenish, replenish, replenish_at),
            suppress_replenish: step(JobKind::Suppress, suppress_replenish, suppress_replenish_at),
        })
    }

    async fn schedule_work(&self) {
        let ctx = &self.crew.ctx;
        let target = &*self.crew.target;
        let plan = match self.plan_cycle() {
            Ok(plan) => plan,
            Err(e) => {
                ctx.log(Category::PlannerUndefined, format_args!("{target}: {e}"));
                return;
            }
        };

        let half_tick = ctx.tick_length() / 2.0;
        let in_flight = self.crew.executor.lock().await.count_threads_finishing_between(
            JobKind::Extract,
            target,
            plan.replenish.finish_at - half_tick,
            plan.replenish.finish_at + half_tick,
        );
        if in_flight > 0 {
            ctx.log(
                Category::PlannerAlreadyScheduled,
                format_args!("{in_flight} extract threads already land near {}", plan.replenish.finish_at),
            );
            return;
        }

        let extract = self.crew.scheduler.new_handle();
        let offset = |step: &Step| step.start_at - plan.planned_at;

        self.schedule_launch("start-suppress-extract", &plan.suppress_extract, offset(&plan.suppress_extract), &extract);
        self.schedule_launch("start-replenish", &plan.replenish, offset(&plan.replenish), &extract);
        self.schedule_launch(
            "start-suppress-replenish",
            &plan.suppress_replenish,
            offset(&plan.suppress_replenish),
            &extract,
        );

        // Fires just after this cycle's Replenish has been launched, tracking
        // the Replenish duration as defense drifts.
        let replenish_finish_in = plan.replenish.finish_at - plan.planned_at;
        let eps = ctx.time_epsilon();
        let model = ctx.model().clone();
        let due_target = self.crew.target.clone();
        let due = Due::dynamic(move || {
            replenish_finish_in - model.duration(JobKind::Replenish, &due_target) + eps
        });
        let crew = self.crew.clone();
        let handle = extract.clone();
        let (wanted, planned_finish) = (plan.extract.threads, plan.extract.finish_at);
        let wrapper = Task::new("place-extract", due, move || async move {
            crew.place_extract(handle, wanted, planned_finish).await;
        })
        .with_meta(target, JobKind::Extract, wanted);
        self.crew.scheduler.schedule_under(&extract, wrapper);
    }

    /// Schedule a launch of `step`. If the launch fails, the cycle's Extract
    /// is cancelled.
    fn schedule_launch(&self, name: &str, step: &Step, delay: Millis, extract: &TaskHandle) {
        let crew = self.crew.clone();
        let extract = extract.clone();
        let (kind, threads) = (step.kind, step.threads);
        let task = Task::new(name, Due::In(delay.max(0.0)), move || async move {
            if !crew.try_launch(kind, threads).await && extract.cancel() {
                tracing::debug!(target_id = %crew.target, %kind, "Launch failed, cancelled cycle extract");
            }
        })
        .with_meta(&*self.crew.target, kind, threads);
        self.crew.scheduler.schedule(task);
    }
}
