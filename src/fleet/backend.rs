use serde::{Deserialize, Serialize};

use crate::context::Millis;
use crate::fleet::JobKind;

/// Process handle on a host. Never zero for a live process.
pub type Pid = u64;

/// One entry of a host's live-process snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub program: String,
    pub threads: u32,
    pub args: Vec<String>,
}

/// Observable state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Available value over capacity, in `[0, 1]`.
    pub value_ratio: f64,
    pub defense: f64,
    pub min_defense: f64,
}

impl TargetState {
    pub fn defense_over_minimum(&self) -> f64 {
        self.defense - self.min_defense
    }
}

/// The compute fleet as seen from the machine the batcher runs on.
///
/// Discovery of reachable hosts and privilege bootstrapping happen behind
/// this trait; the batcher only consumes the results.
pub trait Fleet: Send + Sync {
    /// Hosts currently reachable and usable for jobs.
    fn reachable_hosts(&self) -> Vec<String>;

    /// The host the batcher itself runs on. Result artifacts are consumed here.
    fn local_host(&self) -> String;

    fn max_capacity(&self, host: &str) -> f64;

    fn used_capacity(&self, host: &str) -> f64;

    /// Per-thread capacity cost of `program` on `host`.
    fn program_cost(&self, host: &str, program: &str) -> f64;

    fn processes(&self, host: &str) -> Vec<ProcessInfo>;

    /// Start `program` with `threads` threads. `None` if the launch was rejected.
    fn launch(&self, host: &str, program: &str, threads: u32, args: &[String]) -> Option<Pid>;

    fn is_running(&self, host: &str, pid: Pid) -> bool;

    fn kill(&self, host: &str, pid: Pid) -> bool;

    fn file_exists(&self, host: &str, path: &str) -> bool;

    /// Copy `paths` from `from` to `to`. Returns false if any copy failed.
    fn copy_files(&self, paths: &[String], from: &str, to: &str) -> bool;

    /// Contents of a file, empty if it does not exist.
    fn read_file(&self, host: &str, path: &str) -> String;

    fn remove_file(&self, host: &str, path: &str);
}

/// Targets and the effect job kinds have on them.
pub trait TargetModel: Send + Sync {
    fn state(&self, target: &str) -> Option<TargetState>;

    /// How long a job of `kind` against `target` takes if started now.
    fn duration(&self, kind: JobKind, target: &str) -> Millis;

    /// Fraction of full value one Extract thread removes at minimum defense.
    fn extract_fraction(&self, target: &str) -> f64;

    /// Replenish threads needed to move the value ratio from `from` to `to`,
    /// evaluated at `at_defense` (the minimum when `None`). May be non-finite
    /// when the model cannot answer, e.g. growing from exactly zero.
    fn replenish_threads(&self, target: &str, from: f64, to: f64, at_defense: Option<f64>) -> f64;

    /// Magnitude of the defense change `threads` threads of `kind` cause.
    /// For Suppress this is the amount removed.
    fn defense_effect(&self, kind: JobKind, threads: u32) -> f64;
}
