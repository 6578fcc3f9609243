use thiserror::Error;

use crate::fleet::JobKind;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Capacity shortfall: requested {requested} {kind} threads, started {started}")]
    CapacityShortfall {
        kind: JobKind,
        requested: u32,
        started: u32,
    },

    #[error("Launch rejected on {host}: {threads} {kind} threads")]
    LaunchRejected {
        host: String,
        kind: JobKind,
        threads: u32,
    },

    #[error("Host {host} vanished with {jobs} outstanding jobs")]
    StaleJobLoss { host: String, jobs: usize },

    #[error("Computation undefined: {0}")]
    ComputationUndefined(String),

    #[error("Scheduler is empty, a recurring task must always be registered")]
    SchedulerEmpty,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
