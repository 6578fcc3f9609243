mod test_harness;

use std::io::Write;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_batcher::context::Millis;
use fleet_batcher::driver::{run_until_shutdown, TargetRunner};
use fleet_batcher::fleet::{JobKind, TargetModel};
use fleet_batcher::planner::PlannerState;
use fleet_batcher::sim::SimTarget;
use test_harness::{TestWorld, TARGET};

/// Drive a started runner on the manual clock until `until`.
async fn run_until(world: &TestWorld, runner: &TargetRunner, until: Millis) {
    while world.now() < until {
        let wait = runner.step().await.unwrap();
        world.advance(wait.max(1.0).min(until - world.now()).max(1.0));
    }
    runner.step().await.unwrap();
}

#[tokio::test]
async fn test_runner_bootstraps_then_extracts() {
    let world = TestWorld::single_host(
        20_000,
        SimTarget {
            value_ratio: 0.3,
            defense: 4.0,
            ..SimTarget::default()
        },
    );
    let (tx, mut rx) = mpsc::channel(100_000);
    let runner = TargetRunner::new(world.ctx.clone(), TARGET).with_results(tx);
    assert_eq!(runner.planner_state().await, PlannerState::Bootstrap);

    runner.start();
    run_until(&world, &runner, 120_000.0).await;

    assert_eq!(runner.planner_state().await, PlannerState::SteadyState);

    let mut extracted = 0.0;
    let mut kinds = std::collections::HashSet::new();
    while let Ok(result) = rx.try_recv() {
        assert_eq!(result.target, TARGET);
        kinds.insert(result.kind);
        if result.kind == JobKind::Extract {
            extracted += result.impact;
        }
    }
    assert_eq!(kinds.len(), 3);
    assert!(extracted > 0.0);

    // steady state never drains the target
    let state = world.sim.state(TARGET).unwrap();
    assert!(state.value_ratio >= 0.7, "ratio {}", state.value_ratio);
}

#[tokio::test]
async fn test_emergency_kills_imminent_extracts() {
    let world = TestWorld::single_host(
        1000,
        SimTarget {
            value_ratio: 0.05,
            ..SimTarget::default()
        },
    );
    let runner = TargetRunner::new(world.ctx.clone(), TARGET);
    {
        let mut executor = runner.executor().lock().await;
        executor.update();
        assert_eq!(executor.exec(TARGET, JobKind::Extract, 5).await, 5);
    }

    // lands beyond two ticks: left alone
    runner.tick().await;
    assert_eq!(runner.executor().lock().await.count_threads(TARGET, JobKind::Extract), 5);

    let extract_time = world.sim.duration(JobKind::Extract, TARGET);
    world.advance(extract_time - world.ctx.tick_length());
    runner.tick().await;
    assert_eq!(runner.executor().lock().await.count_threads(TARGET, JobKind::Extract), 0);
}

#[tokio::test]
async fn test_shutdown_kills_target_workers() {
    let world = TestWorld::single_host(
        4000,
        SimTarget {
            value_ratio: 0.3,
            ..SimTarget::default()
        },
    );
    let runner = TargetRunner::new(world.ctx.clone(), TARGET);
    runner.start();
    run_until(&world, &runner, 2_000.0).await;

    let running = {
        let executor = runner.executor().lock().await;
        JobKind::ALL
            .into_iter()
            .map(|k| executor.count_threads(TARGET, k))
            .sum::<u32>()
    };
    assert!(running > 0);

    assert_eq!(runner.shutdown().await, running);
    for kind in JobKind::ALL {
        assert_eq!(world.sim.running_threads(TARGET, kind), 0);
    }
}

#[tokio::test]
async fn test_config_reloaded_every_tick() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"targetValueRatio": 0.5, "debug": ["Planner"]}}"#).unwrap();

    let runner = TargetRunner::new(world.ctx.clone(), TARGET).with_config_path(file.path().to_path_buf());
    runner.tick().await;

    let config = world.ctx.config();
    assert_eq!(config.target_value_ratio, 0.5);
    assert_eq!(config.debug, vec!["Planner".to_string()]);
    // fields missing from the file keep their defaults
    assert_eq!(config.tick_length, 400.0);
}

#[tokio::test]
async fn test_run_until_shutdown_stops_on_cancel() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let runner = TargetRunner::new(world.ctx.clone(), TARGET);
    let token = CancellationToken::new();
    token.cancel();

    let killed = run_until_shutdown(&runner, token).await.unwrap();

    assert_eq!(killed, 0);
    assert!(runner.scheduler().is_empty());
}

#[tokio::test]
async fn test_invalid_config_keeps_previous() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"tickLength": -5, "targetValueRatio": 0.5}}"#).unwrap();

    let runner = TargetRunner::new(world.ctx.clone(), TARGET).with_config_path(file.path().to_path_buf());
    runner.tick().await;

    let config = world.ctx.config();
    assert_eq!(config.tick_length, 400.0);
    assert_eq!(config.target_value_ratio, 0.75);
}

#[tokio::test]
async fn test_reloaded_tick_length_changes_tick_period() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"tickLength": "0.8s"}}"#).unwrap();

    // an unknown target plans nothing, leaving the tick as the only task
    let runner = TargetRunner::new(world.ctx.clone(), "unknown").with_config_path(file.path().to_path_buf());
    runner.start();

    // the first tick was scheduled under the old length and picks up the new one
    world.advance(400.0);
    let wait = runner.step().await.unwrap();
    assert_eq!(world.ctx.tick_length(), 800.0);
    assert_eq!(wait, 800.0);
}
