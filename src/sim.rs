//! In-process simulated fleet and target.
//!
//! [`SimWorld`] implements both [`Fleet`] and [`TargetModel`]. Jobs complete
//! on the world's clock: whenever the world is observed, every process whose
//! end time has passed applies its effect to its target, writes its result
//! artifact and disappears from the process list.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::context::{Clock, Millis};
use crate::fleet::job::artifact_path;
use crate::fleet::{Fleet, JobKind, Pid, ProcessInfo, ResultArtifact, TargetModel, TargetState};

const MAX_REPLENISH_THREADS: f64 = 10_000_000.0;

/// Tunables of one simulated target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimTarget {
    pub value_ratio: f64,
    pub max_value: f64,
    pub defense: f64,
    pub min_defense: f64,
    /// Suppress duration at minimum defense. Replenish takes 4/5 of it,
    /// Extract 1/4.
    pub suppress_time: Millis,
    /// Share of capacity one Extract thread removes at minimum defense.
    pub extract_fraction: f64,
    /// Per-thread growth factor of a Replenish job at minimum defense.
    pub replenish_rate: f64,
    /// Share of capacity each Replenish thread adds before growth applies.
    pub replenish_seed: f64,
}

impl Default for SimTarget {
    fn default() -> Self {
        Self {
            value_ratio: 1.0,
            max_value: 1_000_000.0,
            defense: 1.0,
            min_defense: 1.0,
            suppress_time: 20_000.0,
            extract_fraction: 0.01,
            replenish_rate: 0.0025,
            replenish_seed: 0.0001,
        }
    }
}

impl SimTarget {
    /// Effectiveness at `defense`, 1 at minimum defense and 0 at 100.
    fn efficiency(&self, defense: f64) -> f64 {
        let span = 100.0 - self.min_defense;
        if span <= 0.0 {
            return 0.0;
        }
        ((100.0 - defense) / span).clamp(0.0, 1.0)
    }

    fn grown(&self, from: f64, threads: f64, defense: f64) -> f64 {
        let rate = self.replenish_rate * self.efficiency(defense);
        (from + self.replenish_seed * threads) * (1.0 + rate).powf(threads)
    }

    fn duration(&self, kind: JobKind) -> Millis {
        let base = self.suppress_time * (1.0 + 0.01 * (self.defense - self.min_defense).max(0.0));
        match kind {
            JobKind::Extract => base / 4.0,
            JobKind::Replenish => base * 0.8,
            JobKind::Suppress => base,
        }
    }

    fn state(&self) -> TargetState {
        TargetState {
            value_ratio: self.value_ratio,
            defense: self.defense,
            min_defense: self.min_defense,
        }
    }
}

#[derive(Debug)]
struct SimHost {
    capacity: f64,
    reachable: bool,
    files: HashMap<String, String>,
}

#[derive(Debug)]
struct SimProcess {
    pid: Pid,
    host: String,
    program: String,
    kind: JobKind,
    threads: u32,
    args: Vec<String>,
    started_at: Millis,
    ends_at: Millis,
}

#[derive(Debug)]
struct World {
    hosts: BTreeMap<String, SimHost>,
    targets: HashMap<String, SimTarget>,
    processes: Vec<SimProcess>,
    next_pid: Pid,
    reject_launches: bool,
}

pub struct SimWorld {
    clock: Arc<dyn Clock>,
    local: String,
    program_dir: String,
    result_dir: String,
    costs: HashMap<JobKind, f64>,
    world: Mutex<World>,
}

impl SimWorld {
    /// A world holding only the local host, which has the job programs and
    /// no capacity.
    pub fn new(clock: Arc<dyn Clock>, config: &Config) -> Self {
        let mut files = HashMap::new();
        for kind in JobKind::ALL {
            files.insert(kind.program(&config.program_dir), String::new());
        }
        let mut hosts = BTreeMap::new();
        hosts.insert(
            config.home_host.clone(),
            SimHost {
                capacity: 0.0,
                reachable: true,
                files,
            },
        );
        Self {
            clock,
            local: config.home_host.clone(),
            program_dir: config.program_dir.clone(),
            result_dir: config.result_dir.clone(),
            costs: HashMap::from([
                (JobKind::Extract, 1.7),
                (JobKind::Replenish, 1.75),
                (JobKind::Suppress, 1.75),
            ]),
            world: Mutex::new(World {
                hosts,
                targets: HashMap::new(),
                processes: Vec::new(),
                next_pid: 1,
                reject_launches: false,
            }),
        }
    }

    pub fn with_host(self, name: &str, capacity: f64) -> Self {
        self.add_host(name, capacity);
        self
    }

    pub fn with_target(self, name: &str, target: SimTarget) -> Self {
        self.set_target(name, target);
        self
    }

    pub fn with_cost(mut self, kind: JobKind, cost: f64) -> Self {
        self.costs.insert(kind, cost);
        self
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        let mut world = self.world.lock().unwrap_or_else(|e| e.into_inner());
        self.settle(&mut world);
        world
    }

    /// Add a host, or change the capacity of an existing one.
    pub fn add_host(&self, name: &str, capacity: f64) {
        let mut world = self.lock();
        let host = world.hosts.entry(name.to_string()).or_insert_with(|| SimHost {
            capacity,
            reachable: true,
            files: HashMap::new(),
        });
        host.capacity = capacity;
        host.reachable = true;
    }

    /// Make a host unreachable. Its processes keep running but can no longer
    /// be observed or collected.
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        if let Some(host) = self.lock().hosts.get_mut(name) {
            host.reachable = reachable;
        }
    }

    pub fn set_target(&self, name: &str, target: SimTarget) {
        self.lock().targets.insert(name.to_string(), target);
    }

    pub fn target(&self, name: &str) -> Option<SimTarget> {
        self.lock().targets.get(name).cloned()
    }

    /// While set, every launch fails as if the host refused it.
    pub fn set_reject_launches(&self, reject: bool) {
        self.lock().reject_launches = reject;
    }

    pub fn write_file(&self, host: &str, path: &str, contents: &str) {
        if let Some(h) = self.lock().hosts.get_mut(host) {
            h.files.insert(path.to_string(), contents.to_string());
        }
    }

    pub fn files(&self, host: &str) -> Vec<String> {
        let world = self.lock();
        let mut files: Vec<String> = world
            .hosts
            .get(host)
            .map(|h| h.files.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Threads of `kind` currently running against `target` across all hosts.
    pub fn running_threads(&self, target: &str, kind: JobKind) -> u32 {
        self.lock()
            .processes
            .iter()
            .filter(|p| p.kind == kind && p.args.first().is_some_and(|t| t == target))
            .map(|p| p.threads)
            .sum()
    }

    fn kind_of(&self, program: &str) -> Option<JobKind> {
        JobKind::from_program(&self.program_dir, program)
    }

    /// Complete every process whose end time has passed, in end-time order.
    fn settle(&self, world: &mut World) {
        let now = self.clock.now();
        let (mut done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut world.processes)
            .into_iter()
            .partition(|p| p.ends_at <= now);
        world.processes = running;
        done.sort_by(|a, b| a.ends_at.total_cmp(&b.ends_at));

        for process in done {
            let impact = match process.args.first().and_then(|t| world.targets.get_mut(t)) {
                Some(target) => apply(target, process.kind, process.threads),
                None => 0.0,
            };
            let artifact = ResultArtifact {
                duration: process.ends_at - process.started_at,
                impact,
            };
            let path = match process.args.as_slice() {
                [_, end, nonce, ..] => match (end.parse::<Millis>(), nonce.parse::<u64>()) {
                    (Ok(end), Ok(nonce)) => Some(artifact_path(&self.result_dir, end, nonce)),
                    _ => None,
                },
                _ => None,
            };
            if let (Some(path), Some(host)) = (path, world.hosts.get_mut(&process.host)) {
                let contents = serde_json::to_string(&artifact).unwrap_or_default();
                host.files.insert(path, contents);
            }
        }
    }
}

/// Apply a finished job to its target. Returns the job's impact.
fn apply(target: &mut SimTarget, kind: JobKind, threads: u32) -> f64 {
    let threads_f = threads as f64;
    match kind {
        JobKind::Extract => {
            let share = threads_f * target.extract_fraction * target.efficiency(target.defense);
            let removed = share.min(target.value_ratio);
            target.value_ratio -= removed;
            target.defense += 0.002 * threads_f;
            removed * target.max_value
        }
        JobKind::Replenish => {
            let before = target.value_ratio;
            target.value_ratio = target.grown(before, threads_f, target.defense).min(1.0);
            target.defense += 0.004 * threads_f;
            if before > 0.0 {
                target.value_ratio / before
            } else {
                target.value_ratio
            }
        }
        JobKind::Suppress => {
            let before = target.defense;
            target.defense = (target.defense - 0.05 * threads_f).max(target.min_defense);
            before - target.defense
        }
    }
}

impl Fleet for SimWorld {
    fn reachable_hosts(&self) -> Vec<String> {
        self.lock()
            .hosts
            .iter()
            .filter(|(_, h)| h.reachable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn local_host(&self) -> String {
        self.local.clone()
    }

    fn max_capacity(&self, host: &str) -> f64 {
        self.lock().hosts.get(host).map_or(0.0, |h| h.capacity)
    }

    fn used_capacity(&self, host: &str) -> f64 {
        self.lock()
            .processes
            .iter()
            .filter(|p| p.host == host)
            .map(|p| p.threads as f64 * self.costs.get(&p.kind).copied().unwrap_or(0.0))
            .sum()
    }

    fn program_cost(&self, _host: &str, program: &str) -> f64 {
        self.kind_of(program)
            .and_then(|k| self.costs.get(&k).copied())
            .unwrap_or(0.0)
    }

    fn processes(&self, host: &str) -> Vec<ProcessInfo> {
        let world = self.lock();
        if !world.hosts.get(host).is_some_and(|h| h.reachable) {
            return Vec::new();
        }
        world
            .processes
            .iter()
            .filter(|p| p.host == host)
            .map(|p| ProcessInfo {
                pid: p.pid,
                program: p.program.clone(),
                threads: p.threads,
                args: p.args.clone(),
            })
            .collect()
    }

    fn launch(&self, host: &str, program: &str, threads: u32, args: &[String]) -> Option<Pid> {
        let kind = self.kind_of(program)?;
        let cost = self.costs.get(&kind).copied().unwrap_or(0.0);
        let now = self.clock.now();
        let mut world = self.lock();
        if world.reject_launches || threads == 0 {
            return None;
        }
        let used: f64 = world
            .processes
            .iter()
            .filter(|p| p.host == host)
            .map(|p| p.threads as f64 * self.costs.get(&p.kind).copied().unwrap_or(0.0))
            .sum();
        let h = world.hosts.get(host)?;
        if !h.reachable || !h.files.contains_key(program) || used + threads as f64 * cost > h.capacity + 1e-9 {
            return None;
        }
        let duration = args
            .first()
            .and_then(|t| world.targets.get(t))
            .map_or(0.0, |t| t.duration(kind));

        let pid = world.next_pid;
        world.next_pid += 1;
        world.processes.push(SimProcess {
            pid,
            host: host.to_string(),
            program: program.to_string(),
            kind,
            threads,
            args: args.to_vec(),
            started_at: now,
            ends_at: now + duration,
        });
        Some(pid)
    }

    fn is_running(&self, host: &str, pid: Pid) -> bool {
        self.lock()
            .processes
            .iter()
            .any(|p| p.host == host && p.pid == pid)
    }

    fn kill(&self, host: &str, pid: Pid) -> bool {
        let mut world = self.lock();
        let before = world.processes.len();
        world.processes.retain(|p| !(p.host == host && p.pid == pid));
        before != world.processes.len()
    }

    fn file_exists(&self, host: &str, path: &str) -> bool {
        self.lock()
            .hosts
            .get(host)
            .is_some_and(|h| h.files.contains_key(path))
    }

    fn copy_files(&self, paths: &[String], from: &str, to: &str) -> bool {
        let mut world = self.lock();
        let Some(source) = world.hosts.get(from) else {
            return false;
        };
        let mut copied = Vec::with_capacity(paths.len());
        for path in paths {
            match source.files.get(path) {
                Some(contents) => copied.push((path.clone(), contents.clone())),
                None => return false,
            }
        }
        let Some(dest) = world.hosts.get_mut(to) else {
            return false;
        };
        dest.files.extend(copied);
        true
    }

    fn read_file(&self, host: &str, path: &str) -> String {
        self.lock()
            .hosts
            .get(host)
            .and_then(|h| h.files.get(path).cloned())
            .unwrap_or_default()
    }

    fn remove_file(&self, host: &str, path: &str) {
        if let Some(h) = self.lock().hosts.get_mut(host) {
            h.files.remove(path);
        }
    }
}

impl TargetModel for SimWorld {
    fn state(&self, target: &str) -> Option<TargetState> {
        self.lock().targets.get(target).map(SimTarget::state)
    }

    fn duration(&self, kind: JobKind, target: &str) -> Millis {
        self.lock()
            .targets
            .get(target)
            .map_or(0.0, |t| t.duration(kind))
    }

    fn extract_fraction(&self, target: &str) -> f64 {
        self.lock()
            .targets
            .get(target)
            .map_or(0.0, |t| t.extract_fraction)
    }

    fn replenish_threads(&self, target: &str, from: f64, to: f64, at_defense: Option<f64>) -> f64 {
        let world = self.lock();
        let Some(t) = world.targets.get(target) else {
            return f64::NAN;
        };
        let defense = at_defense.unwrap_or(t.min_defense);
        if from >= to {
            return 0.0;
        }
        if t.grown(from, MAX_REPLENISH_THREADS, defense) < to {
            return f64::INFINITY;
        }
        let (mut low, mut high) = (0.0_f64, MAX_REPLENISH_THREADS);
        while high - low > 1.0 {
            let mid = ((low + high) / 2.0).floor();
            if t.grown(from, mid, defense) >= to {
                high = mid;
            } else {
                low = mid;
            }
        }
        high
    }

    fn defense_effect(&self, kind: JobKind, threads: u32) -> f64 {
        let per_thread = match kind {
            JobKind::Extract => 0.002,
            JobKind::Replenish => 0.004,
            JobKind::Suppress => 0.05,
        };
        per_thread * threads as f64
    }
}
