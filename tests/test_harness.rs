//! Test harness for fleet integration tests.
//!
//! Wires a [`SimWorld`] to a [`Context`] over a [`ManualClock`] so tests can
//! move time explicitly.

#![allow(dead_code)]

use std::sync::Arc;

use fleet_batcher::config::Config;
use fleet_batcher::context::{Context, ManualClock, Millis};
use fleet_batcher::fleet::{Executor, Fleet, JobKind, SharedExecutor};
use fleet_batcher::sim::{SimTarget, SimWorld};

pub const TARGET: &str = "alpha";

/// Defaults with the home reserve removed, so capacities in tests are exact.
pub fn test_config() -> Config {
    Config {
        reserved_capacity: 0.0,
        ..Config::default()
    }
}

pub struct TestWorld {
    pub clock: Arc<ManualClock>,
    pub sim: Arc<SimWorld>,
    pub ctx: Arc<Context>,
}

impl TestWorld {
    pub fn new(config: Config, hosts: &[(&str, f64)], target: SimTarget) -> Self {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut sim = SimWorld::new(clock.clone(), &config).with_target(TARGET, target);
        for (name, capacity) in hosts {
            sim = sim.with_host(name, *capacity);
        }
        let sim = Arc::new(sim);
        let ctx = Arc::new(Context::new(config, clock.clone(), sim.clone(), sim.clone()));
        Self { clock, sim, ctx }
    }

    /// One worker host with room for `threads` Replenish/Suppress threads.
    pub fn single_host(threads: u32, target: SimTarget) -> Self {
        Self::new(test_config(), &[("node-1", threads as f64 * 1.75)], target)
    }

    pub fn executor(&self) -> SharedExecutor {
        Executor::shared(self.ctx.clone())
    }

    pub fn advance(&self, by: Millis) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> Millis {
        self.ctx.now()
    }

    /// Launch a job program directly, bypassing the executor.
    pub fn launch_raw(&self, host: &str, kind: JobKind, threads: u32, end: Millis, nonce: u64) -> Option<u64> {
        let program = kind.program(&self.ctx.config().program_dir);
        let args = vec![TARGET.to_string(), end.to_string(), nonce.to_string()];
        self.sim.launch(host, &program, threads, &args)
    }
}
