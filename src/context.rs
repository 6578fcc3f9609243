//! Shared context handed to every component.
//!
//! Replaces ambient globals: the configuration, the clock and the two
//! collaborator backends all live here, and a config reload is an explicit
//! [`Context::reload_config`] call.

use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;

use crate::config::Config;
use crate::debug::{self, Category};
use crate::error::Result;
use crate::fleet::{Fleet, TargetModel};

/// Milliseconds, either as a wall-clock timestamp or as a span.
pub type Millis = f64;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Millis;
}

/// Wall clock in milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        Utc::now().timestamp_millis() as Millis
    }
}

/// A clock that only moves when told to. Used by the simulator and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Millis>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: Millis) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Millis) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Context {
    config: RwLock<Config>,
    clock: Arc<dyn Clock>,
    fleet: Arc<dyn Fleet>,
    model: Arc<dyn TargetModel>,
}

impl Context {
    pub fn new(
        config: Config,
        clock: Arc<dyn Clock>,
        fleet: Arc<dyn Fleet>,
        model: Arc<dyn TargetModel>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            clock,
            fleet,
            model,
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: Config) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    /// Replace the configuration with the file at `path`, if it holds one.
    ///
    /// Returns whether a new configuration was applied.
    pub fn reload_config(&self, path: &Path) -> Result<bool> {
        match Config::load(path)? {
            Some(config) => {
                self.set_config(config);
                tracing::info!(path = %path.display(), "Configuration reloaded");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn now(&self) -> Millis {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn fleet(&self) -> &Arc<dyn Fleet> {
        &self.fleet
    }

    pub fn model(&self) -> &Arc<dyn TargetModel> {
        &self.model
    }

    pub fn tick_length(&self) -> Millis {
        self.config.read().unwrap_or_else(|e| e.into_inner()).tick_length
    }

    pub fn time_epsilon(&self) -> Millis {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .time_epsilon
    }

    /// Emit a category debug message if the category is enabled in the config.
    pub fn log(&self, category: Category, message: impl Display) {
        let enabled = self.config.read().unwrap_or_else(|e| e.into_inner());
        debug::log(&enabled.debug, category, message);
    }
}
