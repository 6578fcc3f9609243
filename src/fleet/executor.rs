use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::context::{Context, Millis};
use crate::debug::Category;
use crate::error::FleetError;
use crate::fleet::cluster::{self, Around, Cluster, Completion};
use crate::fleet::host::Host;
use crate::fleet::job::{JobKind, JobResult};

/// Executor shared between the driver and scheduled planner tasks.
pub type SharedExecutor = Arc<Mutex<Executor>>;

/// Fleet registry: launches, tracks and kills jobs across all reachable hosts.
pub struct Executor {
    ctx: Arc<Context>,
    hosts: Vec<Host>,
}

impl Executor {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            hosts: Vec::new(),
        }
    }

    pub fn shared(ctx: Arc<Context>) -> SharedExecutor {
        Arc::new(Mutex::new(Self::new(ctx)))
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get_available_threads(&self, kind: JobKind) -> u32 {
        self.hosts
            .iter()
            .map(|h| h.available_threads(&self.ctx, kind))
            .sum()
    }

    pub fn get_maximum_threads(&self, kind: JobKind) -> u32 {
        self.hosts
            .iter()
            .map(|h| h.maximum_threads(&self.ctx, kind))
            .sum()
    }

    /// Convert `n` threads of `from` into the number of `to` threads using the
    /// same capacity. Rounds down.
    pub fn equivalent_threads(&self, n: u32, from: JobKind, to: JobKind) -> u32 {
        let local = self.ctx.fleet().local_host();
        let program_dir = self.ctx.config().program_dir;
        let fleet = self.ctx.fleet();
        let from_cost = fleet.program_cost(&local, &from.program(&program_dir));
        let to_cost = fleet.program_cost(&local, &to.program(&program_dir));
        if from_cost <= 0.0 || to_cost <= 0.0 {
            return 0;
        }
        (n as f64 * from_cost / to_cost).floor() as u32
    }

    pub fn count_threads(&self, target: &str, kind: JobKind) -> u32 {
        self.hosts.iter().map(|h| h.count_threads(target, kind)).sum()
    }

    pub fn count_threads_by_type(&self, kind: JobKind) -> u32 {
        self.hosts.iter().map(|h| h.count_threads_by_kind(kind)).sum()
    }

    pub fn count_all_threads_equivalent(&self, kind: JobKind) -> u32 {
        self.hosts
            .iter()
            .map(|h| h.count_threads_equivalent(kind))
            .sum()
    }

    fn completions(&self, kind: JobKind, target: &str) -> Vec<Completion> {
        self.hosts
            .iter()
            .flat_map(|h| h.completions(kind, target))
            .collect()
    }

    pub fn count_threads_finishing_between(
        &self,
        kind: JobKind,
        target: &str,
        from: Millis,
        until: Millis,
    ) -> u32 {
        cluster::between(&self.completions(kind, target), from, until)
    }

    pub fn count_threads_finishing_at(&self, kind: JobKind, target: &str, time: Millis) -> Option<Cluster> {
        cluster::at(self.completions(kind, target), time, self.ctx.time_epsilon())
    }

    pub fn count_threads_finishing_just_before(
        &self,
        kind: JobKind,
        target: &str,
        time: Millis,
    ) -> Option<Cluster> {
        cluster::just_before(self.completions(kind, target), time, self.ctx.time_epsilon())
    }

    pub fn count_threads_finishing_just_after(
        &self,
        kind: JobKind,
        target: &str,
        time: Millis,
    ) -> Option<Cluster> {
        cluster::just_after(self.completions(kind, target), time, self.ctx.time_epsilon())
    }

    pub fn count_threads_finishing_just_around(&self, kind: JobKind, target: &str, time: Millis) -> Around {
        let around = cluster::just_around(self.completions(kind, target), time, self.ctx.time_epsilon());
        self.ctx.log(
            Category::ExecutorClusters,
            format_args!(
                "{kind} around {time}: before={:?} after={:?}",
                around.before, around.after
            ),
        );
        around
    }

    /// Poll the fleet once.
    ///
    /// Registers newly reachable hosts and forgets hosts that are gone (their
    /// outstanding jobs are lost without a result). Deploys the job programs
    /// to any host still missing them, then collects results for every job
    /// that disappeared since the last call.
    pub fn update(&mut self) -> Vec<JobResult> {
        let fleet = self.ctx.fleet().clone();
        let reachable = fleet.reachable_hosts();
        let reachable_set: HashSet<&str> = reachable.iter().map(String::as_str).collect();

        let ctx = &self.ctx;
        self.hosts.retain(|h| {
            if reachable_set.contains(h.name()) {
                return true;
            }
            if !h.jobs().is_empty() {
                let loss = FleetError::StaleJobLoss {
                    host: h.name().to_string(),
                    jobs: h.jobs().len(),
                };
                ctx.log(Category::ExecutorUpdate, loss);
            }
            tracing::info!(host = %h.name(), "Host no longer reachable, dropped");
            false
        });

        for name in &reachable {
            if self.hosts.iter().any(|h| h.name() == name.as_str()) {
                continue;
            }
            let capacity = fleet.max_capacity(name);
            if capacity <= 0.0 {
                continue;
            }
            tracing::info!(host = %name, capacity, "Discovered new host");
            self.hosts.push(Host::new(&self.ctx, name.clone()));
        }

        let mut results = Vec::new();
        for host in &mut self.hosts {
            // no-op once the programs are there; retries a failed copy
            host.deploy(&self.ctx);
            results.extend(host.update(&self.ctx));
        }
        if !results.is_empty() {
            self.ctx.log(
                Category::ExecutorUpdate,
                format_args!("{} jobs finished", results.len()),
            );
        }
        self.ctx.log(
            Category::ExecutorCapacity,
            format_args!(
                "{} hosts, {}/{} suppress-equivalent threads free",
                self.hosts.len(),
                self.get_available_threads(JobKind::Suppress),
                self.get_maximum_threads(JobKind::Suppress),
            ),
        );
        results
    }

    /// Forget a host that was removed from the fleet.
    pub fn host_deleted(&mut self, host: &str) {
        self.hosts.retain(|h| h.name() != host);
    }

    /// Start up to `threads` threads of `kind` against `target`.
    ///
    /// Hosts are tried in order of descending free capacity for `kind`; the
    /// home host goes last for Extract and first for the other kinds. Yields
    /// once per host attempted. Returns the number actually started, which may
    /// be short of `threads`.
    pub async fn exec(&mut self, target: &str, kind: JobKind, threads: u32) -> u32 {
        let ctx = self.ctx.clone();
        let home = ctx.config().home_host;

        let mut order: Vec<(usize, u32)> = self
            .hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (i, h.available_threads(&ctx, kind)))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1));
        if let Some(pos) = order.iter().position(|&(i, _)| self.hosts[i].name() == home) {
            let entry = order.remove(pos);
            if kind == JobKind::Extract {
                order.push(entry);
            } else {
                order.insert(0, entry);
            }
        }

        let mut started = 0;
        for (index, _) in order {
            if started >= threads {
                break;
            }
            let host = &mut self.hosts[index];
            let available = host.available_threads(&ctx, kind);
            if available == 0 {
                continue;
            }
            let to_exec = available.min(threads - started);
            match host.exec(&ctx, target, kind, to_exec) {
                Ok(()) => {
                    started += to_exec;
                    ctx.log(
                        Category::ExecutorLaunch,
                        format_args!("{} started {to_exec} {kind} threads against {target}", host.name()),
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        available,
                        free = ctx.fleet().max_capacity(host.name()) - ctx.fleet().used_capacity(host.name()),
                        "Failed to start threads"
                    );
                }
            }
            tokio::task::yield_now().await;
        }

        if started < threads {
            let shortfall = FleetError::CapacityShortfall {
                kind,
                requested: threads,
                started,
            };
            ctx.log(Category::ExecutorNotEnoughThreads, shortfall);
        }
        started
    }

    /// Top up to `threads` outstanding threads of `kind` against `target`.
    pub async fn exec_up_to(&mut self, target: &str, kind: JobKind, threads: u32) -> u32 {
        let current = self.count_threads(target, kind);
        if current >= threads {
            return 0;
        }
        self.exec(target, kind, threads - current).await
    }

    /// Kill Extract jobs against `target` that would land within the next two
    /// ticks. Returns threads killed.
    pub fn emergency(&mut self, target: &str) -> u32 {
        let horizon = self.ctx.now() + self.ctx.tick_length() * 2.0;
        let ctx = &self.ctx;
        let killed: u32 = self
            .hosts
            .iter_mut()
            .map(|h| {
                h.kill_matching(ctx, |j| {
                    j.kind == JobKind::Extract && j.target == target && j.expected_end < horizon
                })
            })
            .sum();
        if killed > 0 {
            tracing::warn!(target_id = %target, killed, "!!EMERGENCY!! Killed extract threads");
        }
        killed
    }

    /// Kill jobs, optionally restricted to a kind and/or target. Returns threads killed.
    pub fn kill_workers(&mut self, kind: Option<JobKind>, target: Option<&str>) -> u32 {
        let ctx = &self.ctx;
        let killed: u32 = self
            .hosts
            .iter_mut()
            .map(|h| {
                h.kill_matching(ctx, |j| {
                    kind.map_or(true, |k| j.kind == k) && target.map_or(true, |t| j.target == t)
                })
            })
            .sum();
        if killed > 0 {
            tracing::info!(kind = ?kind, target_id = ?target, killed, "Killed workers");
        }
        killed
    }

    pub fn kill_workers_on_host(&mut self, host: &str, kind: Option<JobKind>) -> u32 {
        let ctx = &self.ctx;
        self.hosts
            .iter_mut()
            .find(|h| h.name() == host)
            .map_or(0, |h| h.kill_matching(ctx, |j| kind.map_or(true, |k| j.kind == k)))
    }

    /// Trim the threads of `kind` against `target` finishing in `[from, until]`
    /// down to `cap`, killing the smallest jobs first. Returns threads killed.
    pub fn cap_workers(&mut self, kind: JobKind, target: &str, cap: u32, from: Millis, until: Millis) -> u32 {
        let mut candidates: Vec<(usize, u64, u32)> = self
            .hosts
            .iter()
            .enumerate()
            .flat_map(|(i, h)| {
                h.jobs()
                    .iter()
                    .filter(|j| {
                        j.kind == kind
                            && j.target == target
                            && j.expected_end >= from
                            && j.expected_end <= until
                    })
                    .map(move |j| (i, j.pid, j.threads))
            })
            .collect();
        candidates.sort_by_key(|&(_, _, threads)| threads);

        let running: u32 = candidates.iter().map(|&(_, _, t)| t).sum();
        let to_kill = running.saturating_sub(cap);
        if to_kill == 0 {
            return 0;
        }

        let ctx = &self.ctx;
        let mut killed = 0;
        for (index, pid, _) in candidates {
            if killed >= to_kill {
                break;
            }
            killed += self.hosts[index].kill_pid(ctx, pid);
        }
        if killed > 0 {
            tracing::info!(
                kind = %kind,
                target_id = %target,
                from = running,
                to = running - killed,
                killed,
                "Capped workers"
            );
        }
        killed
    }
}
