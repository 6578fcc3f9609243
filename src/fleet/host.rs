use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::context::{Context, Millis};
use crate::error::{FleetError, Result};
use crate::fleet::cluster::Completion;
use crate::fleet::job::{Job, JobKind, JobResult, ResultArtifact};
use crate::fleet::Pid;

/// Bookkeeping for one host: its per-kind thread cost and the jobs it runs.
#[derive(Debug, Clone)]
pub struct Host {
    name: String,
    jobs: Vec<Job>,
    costs: HashMap<JobKind, f64>,
}

impl Host {
    pub fn new(ctx: &Context, name: impl Into<String>) -> Self {
        let mut host = Self {
            name: name.into(),
            jobs: Vec::new(),
            costs: HashMap::new(),
        };
        host.refresh_costs(ctx);
        host
    }

    fn refresh_costs(&mut self, ctx: &Context) {
        let program_dir = ctx.config().program_dir;
        for kind in JobKind::ALL {
            let cost = ctx
                .fleet()
                .program_cost(&self.name, &kind.program(&program_dir));
            self.costs.insert(kind, cost);
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn cost(&self, kind: JobKind) -> f64 {
        self.costs.get(&kind).copied().unwrap_or(0.0)
    }

    /// Capacity usable for jobs: the local host keeps a reserve for itself.
    fn usable_capacity(&self, ctx: &Context) -> f64 {
        let max = ctx.fleet().max_capacity(&self.name);
        if self.name == ctx.fleet().local_host() {
            return max - ctx.config().reserved_capacity;
        }
        max
    }

    fn threads_for(&self, capacity: f64, kind: JobKind) -> u32 {
        let cost = self.cost(kind);
        if cost <= 0.0 || !capacity.is_finite() || capacity <= 0.0 {
            return 0;
        }
        (capacity / cost).floor() as u32
    }

    /// Threads of `kind` that fit in the currently uncommitted capacity.
    pub fn available_threads(&self, ctx: &Context, kind: JobKind) -> u32 {
        let free = self.usable_capacity(ctx) - ctx.fleet().used_capacity(&self.name);
        self.threads_for(free, kind)
    }

    /// Threads of `kind` that would fit on an idle host.
    pub fn maximum_threads(&self, ctx: &Context, kind: JobKind) -> u32 {
        self.threads_for(self.usable_capacity(ctx), kind)
    }

    pub fn count_threads(&self, target: &str, kind: JobKind) -> u32 {
        self.jobs
            .iter()
            .filter(|j| j.target == target && j.kind == kind)
            .map(|j| j.threads)
            .sum()
    }

    pub fn count_threads_by_kind(&self, kind: JobKind) -> u32 {
        self.jobs
            .iter()
            .filter(|j| j.kind == kind)
            .map(|j| j.threads)
            .sum()
    }

    /// All running threads expressed in units of `kind`.
    pub fn count_threads_equivalent(&self, kind: JobKind) -> u32 {
        let to = self.cost(kind);
        if to <= 0.0 {
            return 0;
        }
        self.jobs
            .iter()
            .map(|j| (j.threads as f64 * self.cost(j.kind) / to).floor() as u32)
            .sum()
    }

    pub(crate) fn completions(&self, kind: JobKind, target: &str) -> impl Iterator<Item = Completion> + '_ {
        let target = target.to_string();
        self.jobs
            .iter()
            .filter(move |j| j.kind == kind && j.target == target)
            .map(|j| Completion {
                when: j.expected_end,
                threads: j.threads,
            })
    }

    /// Copy the job programs over unless all of them are already present.
    pub fn deploy(&mut self, ctx: &Context) -> bool {
        let program_dir = ctx.config().program_dir;
        let programs: Vec<String> = JobKind::ALL
            .into_iter()
            .map(|k| k.program(&program_dir))
            .collect();
        let fleet = ctx.fleet();
        if programs.iter().all(|p| fleet.file_exists(&self.name, p)) {
            return true;
        }
        let copied = fleet.copy_files(&programs, &fleet.local_host(), &self.name);
        self.refresh_costs(ctx);
        if !copied {
            tracing::warn!(host = %self.name, "Failed to deploy job programs");
        }
        copied
    }

    /// Diff the live-process snapshot against tracked jobs.
    ///
    /// Unknown job processes are adopted. Tracked jobs no longer running have
    /// their result artifact collected (zero impact if absent) and deleted on
    /// both ends. Afterwards `jobs` holds exactly the live jobs.
    pub fn update(&mut self, ctx: &Context) -> Vec<JobResult> {
        let config = ctx.config();
        let fleet = ctx.fleet();
        let prefix = format!("{}/", config.program_dir);
        let live: Vec<_> = fleet
            .processes(&self.name)
            .into_iter()
            .filter(|p| p.program.starts_with(&prefix))
            .collect();
        let live_pids: HashSet<_> = live.iter().map(|p| p.pid).collect();

        for process in &live {
            if self.jobs.iter().any(|j| j.pid == process.pid) {
                continue;
            }
            if let Some(job) = Job::from_process(&config.program_dir, process) {
                tracing::debug!(host = %self.name, pid = job.pid, kind = %job.kind, "Adopted running job");
                self.jobs.push(job);
            }
        }

        let (running, stopped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|j| live_pids.contains(&j.pid));
        self.jobs = running;

        let local = fleet.local_host();
        let mut results = Vec::with_capacity(stopped.len());
        for job in stopped {
            let path = job.artifact_path(&config.result_dir);
            if self.name != local && fleet.file_exists(&self.name, &path) {
                fleet.copy_files(std::slice::from_ref(&path), &self.name, &local);
            }
            let artifact = ResultArtifact::parse(&fleet.read_file(&local, &path));
            results.push(JobResult::new(&job, artifact));
            fleet.remove_file(&local, &path);
            if self.name != local {
                fleet.remove_file(&self.name, &path);
            }
        }
        results
    }

    /// Launch one job. Records it on success.
    pub fn exec(&mut self, ctx: &Context, target: &str, kind: JobKind, threads: u32) -> Result<()> {
        let expected_end: Millis = ctx.now() + ctx.model().duration(kind, target);
        let nonce: u64 = rand::thread_rng().gen();
        let program = kind.program(&ctx.config().program_dir);
        let args = Job::launch_args(target, expected_end, nonce);
        let pid = ctx
            .fleet()
            .launch(&self.name, &program, threads, &args)
            .filter(|&pid| pid != 0)
            .ok_or_else(|| FleetError::LaunchRejected {
                host: self.name.clone(),
                kind,
                threads,
            })?;
        self.jobs.push(Job {
            target: target.to_string(),
            kind,
            threads,
            pid,
            expected_end,
            nonce,
        });
        Ok(())
    }

    fn kill(&self, ctx: &Context, job: &Job) -> bool {
        let fleet = ctx.fleet();
        if !fleet.is_running(&self.name, job.pid) {
            return false;
        }
        let killed = fleet.kill(&self.name, job.pid);
        if !killed {
            tracing::warn!(host = %self.name, pid = job.pid, kind = %job.kind, "Failed to kill job");
        }
        killed
    }

    /// Kill every job matching `pred`. Returns threads killed.
    ///
    /// Jobs that already exited are left alone so `update` still collects them.
    pub(crate) fn kill_matching(&mut self, ctx: &Context, pred: impl Fn(&Job) -> bool) -> u32 {
        let mut killed = 0;
        let mut gone = HashSet::new();
        for job in self.jobs.iter().filter(|j| pred(j)) {
            if self.kill(ctx, job) {
                killed += job.threads;
                gone.insert(job.pid);
            }
        }
        self.jobs.retain(|j| !gone.contains(&j.pid));
        killed
    }

    /// Kill a single job by pid. Returns its threads if it was killed.
    pub(crate) fn kill_pid(&mut self, ctx: &Context, pid: Pid) -> u32 {
        self.kill_matching(ctx, |j| j.pid == pid)
    }
}
