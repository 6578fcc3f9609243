//! Fleet registry: hosts, their capacity and the jobs running on them.
//!
//! # Components
//!
//! - [`Executor`]: fleet-wide launch, kill, capacity and completion queries
//! - [`host`]: per-host bookkeeping and process diffing
//! - [`cluster`]: grouping of near-simultaneous completions
//! - [`backend`]: the [`Fleet`] and [`TargetModel`] collaborator traits
//!
//! # Completion discovery
//!
//! Jobs never report back. Each [`Executor::update`] call diffs the live
//! process list of every host against the jobs it knows about; anything
//! missing has finished, and its result artifact is collected and deleted.

pub mod backend;
pub mod cluster;
pub mod executor;
pub mod host;
pub mod job;

pub use backend::{Fleet, Pid, ProcessInfo, TargetModel, TargetState};
pub use cluster::{Around, Cluster};
pub use executor::{Executor, SharedExecutor};
pub use job::{Job, JobKind, JobResult, ResultArtifact};
