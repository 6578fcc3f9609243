use serde::{Deserialize, Serialize};

use crate::context::Millis;
use crate::fleet::{Pid, ProcessInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Lowers target value, raises defense.
    Extract,
    /// Raises target value toward capacity, raises defense.
    Replenish,
    /// Lowers defense.
    Suppress,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [JobKind::Extract, JobKind::Replenish, JobKind::Suppress];

    pub fn program_name(self) -> &'static str {
        match self {
            JobKind::Extract => "extract",
            JobKind::Replenish => "replenish",
            JobKind::Suppress => "suppress",
        }
    }

    /// Full path of the job program under `program_dir`.
    pub fn program(self, program_dir: &str) -> String {
        format!("{}/{}", program_dir, self.program_name())
    }

    pub fn from_program(program_dir: &str, program: &str) -> Option<JobKind> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.program(program_dir) == program)
    }

    /// Whether jobs of this kind are blocked while defense is too high.
    pub fn needs_low_defense(self) -> bool {
        matches!(self, JobKind::Extract | JobKind::Replenish)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Extract => write!(f, "extract"),
            JobKind::Replenish => write!(f, "replenish"),
            JobKind::Suppress => write!(f, "suppress"),
        }
    }
}

/// A launched job. `expected_end` is fixed at launch.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub target: String,
    pub kind: JobKind,
    pub threads: u32,
    pub pid: Pid,
    pub expected_end: Millis,
    /// Disambiguates jobs with identical `expected_end`.
    pub nonce: u64,
}

impl Job {
    /// Arguments handed to the job program: `target expectedEnd nonce`.
    pub fn launch_args(target: &str, expected_end: Millis, nonce: u64) -> Vec<String> {
        vec![
            target.to_string(),
            expected_end.to_string(),
            nonce.to_string(),
        ]
    }

    /// Reconstruct a job from a process we did not launch ourselves.
    pub fn from_process(program_dir: &str, process: &ProcessInfo) -> Option<Job> {
        let kind = JobKind::from_program(program_dir, &process.program)?;
        let [target, expected_end, nonce] = process.args.as_slice() else {
            return None;
        };
        Some(Job {
            target: target.clone(),
            kind,
            threads: process.threads,
            pid: process.pid,
            expected_end: expected_end.parse().ok()?,
            nonce: nonce.parse().ok()?,
        })
    }

    pub fn artifact_path(&self, result_dir: &str) -> String {
        artifact_path(result_dir, self.expected_end, self.nonce)
    }
}

/// Where a job with this expected end and nonce writes its result.
pub fn artifact_path(result_dir: &str, expected_end: Millis, nonce: u64) -> String {
    format!("{}/{}-{}.txt", result_dir, expected_end, nonce)
}

/// Contents of a result artifact as written by a job program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultArtifact {
    pub duration: Millis,
    pub impact: f64,
}

impl ResultArtifact {
    /// Parse artifact contents. Empty or malformed contents yield zeros.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Malformed result artifact, assuming zero impact");
            Self::default()
        })
    }
}

/// Outcome of one finished job. Produced at most once per job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub target: String,
    pub kind: JobKind,
    pub threads: u32,
    pub duration: Millis,
    pub impact: f64,
}

impl JobResult {
    pub fn new(job: &Job, artifact: ResultArtifact) -> Self {
        Self {
            target: job.target.clone(),
            kind: job.kind,
            threads: job.threads,
            duration: artifact.duration,
            impact: artifact.impact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopt_process_with_valid_args() {
        let process = ProcessInfo {
            pid: 7,
            program: "/jobs/replenish".to_string(),
            threads: 12,
            args: Job::launch_args("alpha", 1500.5, 42),
        };
        let job = Job::from_process("/jobs", &process).unwrap();
        assert_eq!(job.kind, JobKind::Replenish);
        assert_eq!(job.target, "alpha");
        assert_eq!(job.expected_end, 1500.5);
        assert_eq!(job.nonce, 42);
        assert_eq!(job.artifact_path("/results"), "/results/1500.5-42.txt");
    }

    #[test]
    fn foreign_process_is_not_adopted() {
        let process = ProcessInfo {
            pid: 7,
            program: "/other/thing".to_string(),
            threads: 1,
            args: vec![],
        };
        assert!(Job::from_process("/jobs", &process).is_none());

        let process = ProcessInfo {
            pid: 8,
            program: "/jobs/extract".to_string(),
            threads: 1,
            args: vec!["alpha".to_string()],
        };
        assert!(Job::from_process("/jobs", &process).is_none());
    }

    #[test]
    fn artifact_tolerates_empty_and_garbage() {
        assert_eq!(ResultArtifact::parse(""), ResultArtifact::default());
        assert_eq!(ResultArtifact::parse("nope"), ResultArtifact::default());
        let parsed = ResultArtifact::parse(r#"{"duration": 120.0, "impact": 3.5}"#);
        assert_eq!(parsed.duration, 120.0);
        assert_eq!(parsed.impact, 3.5);
    }
}
