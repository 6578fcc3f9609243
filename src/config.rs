use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::context::Millis;
use crate::error::{FleetError, Result};

/// Runtime configuration for the batcher.
///
/// Loaded from a JSON file with camelCase keys. Every field is optional in the
/// file; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Length of one driver tick. Ideally `time_epsilon * 8`.
    #[serde(deserialize_with = "deserialize_millis")]
    pub tick_length: Millis,
    /// Tolerance for treating completions as simultaneous.
    #[serde(deserialize_with = "deserialize_millis")]
    pub time_epsilon: Millis,
    /// Extract/Replenish refuse to start while defense exceeds minimum by more than this.
    pub defense_threshold: f64,
    /// Value ratio the target is drained to by each cycle.
    pub target_value_ratio: f64,
    /// Capacity withheld on the home host.
    pub reserved_capacity: f64,
    /// The high-effectiveness host.
    pub home_host: String,
    /// Below this value ratio in-flight extractions are killed.
    pub emergency_value_ratio: f64,
    /// Multiplier applied to thread counts before sizing their Suppress counterpart.
    pub suppress_margin: f64,
    /// Directory the three job programs live in.
    pub program_dir: String,
    /// Directory result artifacts are written to.
    pub result_dir: String,
    /// Scheduler tasks running longer than this get logged.
    #[serde(deserialize_with = "deserialize_millis")]
    pub slow_task_ms: Millis,
    /// Enabled debug categories, matched by prefix.
    pub debug: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_length: 400.0,
            time_epsilon: 50.0,
            defense_threshold: 5.0,
            target_value_ratio: 0.75,
            reserved_capacity: 16.0,
            home_host: "home".to_string(),
            emergency_value_ratio: 0.1,
            suppress_margin: 2.0,
            program_dir: "/bin/fleet/jobs".to_string(),
            result_dir: "/fleet/results".to_string(),
            slow_task_ms: 50.0,
            debug: Vec::new(),
        }
    }
}

impl Config {
    /// Reject values the planner cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !(self.tick_length > 0.0) {
            return Err(FleetError::Config(format!("tickLength must be positive, got {}", self.tick_length)));
        }
        if !(self.time_epsilon >= 0.0) {
            return Err(FleetError::Config(format!("timeEpsilon must not be negative, got {}", self.time_epsilon)));
        }
        if !(0.0..=1.0).contains(&self.target_value_ratio) {
            return Err(FleetError::Config(format!(
                "targetValueRatio must be within [0, 1], got {}",
                self.target_value_ratio
            )));
        }
        if !(self.suppress_margin > 0.0) {
            return Err(FleetError::Config(format!(
                "suppressMargin must be positive, got {}",
                self.suppress_margin
            )));
        }
        Ok(())
    }

    /// Read a config file.
    ///
    /// A missing or empty file yields `Ok(None)`. So does a file that fails to
    /// parse: it is logged and ignored rather than aborting the caller. A file
    /// that parses but holds unusable values is an error.
    pub fn load(path: &Path) -> Result<Option<Config>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if raw.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty");
            return Ok(None);
        }
        match serde_json::from_str::<Config>(&raw) {
            Ok(config) => {
                config.validate()?;
                Ok(Some(config))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Error parsing config, ignoring the file");
                Ok(None)
            }
        }
    }
}

/// Parse a humanized duration like `"1.5s"` or `"2m"` into milliseconds.
///
/// A bare number is taken as milliseconds. Anything unparseable is 0.
pub fn parse_time(s: &str) -> Millis {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let Ok(value) = num.parse::<f64>() else {
        return 0.0;
    };
    let unit = match suffix.to_ascii_lowercase().as_str() {
        "" | "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60.0 * 1000.0,
        _ => return 0.0,
    };
    value * unit
}

fn deserialize_millis<'de, D>(deserializer: D) -> std::result::Result<Millis, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => parse_time(&s),
    })
}
