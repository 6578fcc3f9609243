mod test_harness;

use fleet_batcher::config::Config;
use fleet_batcher::fleet::{Fleet, JobKind, TargetModel};
use fleet_batcher::sim::SimTarget;
use test_harness::{test_config, TestWorld, TARGET};

#[tokio::test]
async fn test_update_with_no_hosts() {
    let world = TestWorld::new(test_config(), &[], SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;

    let results = executor.update();

    assert!(results.is_empty());
    assert!(executor.hosts().is_empty());
    assert_eq!(executor.get_available_threads(JobKind::Suppress), 0);
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 5).await, 0);
}

#[tokio::test]
async fn test_update_deploys_to_new_hosts() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;

    executor.update();

    assert_eq!(executor.hosts().len(), 1);
    let files = world.sim.files("node-1");
    for kind in JobKind::ALL {
        assert!(files.contains(&kind.program("/bin/fleet/jobs")));
    }
    assert_eq!(executor.get_available_threads(JobKind::Suppress), 10);
    assert_eq!(executor.get_available_threads(JobKind::Extract), 10);
    assert_eq!(executor.get_maximum_threads(JobKind::Replenish), 10);
}

#[tokio::test]
async fn test_exec_never_exceeds_request() {
    let world = TestWorld::new(
        test_config(),
        &[("node-1", 17.5), ("node-2", 17.5)],
        SimTarget::default(),
    );
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 15).await, 15);
    assert_eq!(executor.count_threads(TARGET, JobKind::Suppress), 15);
    // both hosts had to be used
    assert!(executor.hosts().iter().all(|h| !h.jobs().is_empty()));

    // only 5 left
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 8).await, 5);
    assert_eq!(executor.get_available_threads(JobKind::Suppress), 0);
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 1).await, 0);
}

#[tokio::test]
async fn test_exec_up_to_counts_running_threads() {
    let world = TestWorld::single_host(40, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    assert_eq!(executor.exec_up_to(TARGET, JobKind::Replenish, 12).await, 12);
    assert_eq!(executor.exec_up_to(TARGET, JobKind::Replenish, 12).await, 0);
    assert_eq!(executor.exec_up_to(TARGET, JobKind::Replenish, 20).await, 8);
    assert_eq!(executor.count_threads(TARGET, JobKind::Replenish), 20);
}

#[tokio::test]
async fn test_home_host_ordering() {
    let config = Config {
        reserved_capacity: 16.0,
        ..Config::default()
    };
    // home: 17.5 usable after the reserve, same as node-1
    let world = TestWorld::new(
        config,
        &[("home", 33.5), ("node-1", 17.5)],
        SimTarget::default(),
    );
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    let on = |executor: &fleet_batcher::fleet::Executor, host: &str, kind: JobKind| -> u32 {
        executor
            .hosts()
            .iter()
            .find(|h| h.name() == host)
            .map_or(0, |h| h.count_threads(TARGET, kind))
    };

    assert_eq!(executor.exec(TARGET, JobKind::Replenish, 4).await, 4);
    assert_eq!(on(&executor, "home", JobKind::Replenish), 4);

    assert_eq!(executor.exec(TARGET, JobKind::Extract, 4).await, 4);
    assert_eq!(on(&executor, "node-1", JobKind::Extract), 4);
    assert_eq!(on(&executor, "home", JobKind::Extract), 0);
}

#[tokio::test]
async fn test_update_collects_results() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 4).await, 4);
    assert!(executor.update().is_empty());

    world.advance(world.sim.duration(JobKind::Suppress, TARGET));
    let results = executor.update();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, JobKind::Suppress);
    assert_eq!(results[0].threads, 4);
    assert_eq!(results[0].target, TARGET);
    assert_eq!(executor.count_threads(TARGET, JobKind::Suppress), 0);

    // artifacts are removed on both ends
    for host in ["home", "node-1"] {
        assert!(world
            .sim
            .files(host)
            .iter()
            .all(|f| !f.starts_with("/fleet/results")));
    }

    // a result is produced at most once
    assert!(executor.update().is_empty());
}

#[tokio::test]
async fn test_missing_artifact_means_zero_impact() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    let end = world.now() + world.sim.duration(JobKind::Extract, TARGET);
    world.launch_raw("node-1", JobKind::Extract, 2, end, 99).unwrap();
    executor.update();
    assert_eq!(executor.count_threads(TARGET, JobKind::Extract), 2);

    world.advance(world.sim.duration(JobKind::Extract, TARGET));
    world
        .sim
        .remove_file("node-1", &format!("/fleet/results/{end}-99.txt"));
    let results = executor.update();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].impact, 0.0);
}

#[tokio::test]
async fn test_unreachable_host_drops_jobs() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 3).await, 3);

    world.sim.set_reachable("node-1", false);
    let results = executor.update();

    assert!(results.is_empty());
    assert!(executor.hosts().is_empty());
    assert_eq!(executor.count_threads(TARGET, JobKind::Suppress), 0);
}

#[tokio::test]
async fn test_update_retries_failed_deploy() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let program = JobKind::Suppress.program(&world.ctx.config().program_dir);
    world.sim.remove_file("home", &program);

    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();
    assert_eq!(executor.hosts().len(), 1);
    assert!(!world.sim.files("node-1").contains(&program));
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 3).await, 0);

    world.sim.write_file("home", &program, "");
    executor.update();

    assert!(world.sim.files("node-1").contains(&program));
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 3).await, 3);
}

#[tokio::test]
async fn test_rejected_launch_starts_nothing() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    world.sim.set_reject_launches(true);
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 3).await, 0);
    assert_eq!(executor.count_threads(TARGET, JobKind::Suppress), 0);
}

#[tokio::test]
async fn test_cap_workers_kills_smallest_first() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    for threads in [1, 1, 1, 5] {
        assert_eq!(executor.exec(TARGET, JobKind::Extract, threads).await, threads);
    }
    let end = world.now() + world.sim.duration(JobKind::Extract, TARGET);
    assert_eq!(executor.count_threads_finishing_between(JobKind::Extract, TARGET, end, end), 8);

    // the smallest job of all, but landing outside the window
    world.advance(500.0);
    assert_eq!(executor.exec(TARGET, JobKind::Extract, 1).await, 1);
    let outside = world.now() + world.sim.duration(JobKind::Extract, TARGET);

    let killed = executor.cap_workers(JobKind::Extract, TARGET, 5, end - 1.0, end + 1.0);

    assert_eq!(killed, 3);
    assert_eq!(executor.count_threads(TARGET, JobKind::Extract), 6);
    assert_eq!(executor.count_threads_finishing_between(JobKind::Extract, TARGET, end, end), 5);
    assert_eq!(
        executor.count_threads_finishing_between(JobKind::Extract, TARGET, outside, outside),
        1
    );
    let mut remaining: Vec<u32> = executor.hosts()[0].jobs().iter().map(|j| j.threads).collect();
    remaining.sort();
    assert_eq!(remaining, vec![1, 5]);
}

#[tokio::test]
async fn test_emergency_kills_imminent_extracts() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    assert_eq!(executor.exec(TARGET, JobKind::Extract, 6).await, 6);
    assert_eq!(executor.exec(TARGET, JobKind::Suppress, 2).await, 2);

    // nothing lands within two ticks yet
    assert_eq!(executor.emergency(TARGET), 0);

    let extract_time = world.sim.duration(JobKind::Extract, TARGET);
    world.advance(extract_time - world.ctx.tick_length());
    assert_eq!(executor.emergency(TARGET), 6);
    assert_eq!(executor.count_threads(TARGET, JobKind::Extract), 0);
    assert_eq!(executor.count_threads(TARGET, JobKind::Suppress), 2);
}

#[tokio::test]
async fn test_kill_workers_filters() {
    let world = TestWorld::new(
        test_config(),
        &[("node-1", 100.0), ("node-2", 100.0)],
        SimTarget::default(),
    );
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    executor.exec(TARGET, JobKind::Suppress, 80).await;
    executor.exec(TARGET, JobKind::Replenish, 10).await;

    let on_node_1 = executor.hosts().iter().find(|h| h.name() == "node-1").unwrap().count_threads_by_kind(JobKind::Suppress);
    assert_eq!(executor.kill_workers_on_host("node-1", Some(JobKind::Suppress)), on_node_1);
    assert_eq!(executor.count_threads_by_type(JobKind::Suppress), 80 - on_node_1);

    assert_eq!(executor.kill_workers(Some(JobKind::Replenish), None), 10);
    assert_eq!(executor.kill_workers(None, Some(TARGET)), 80 - on_node_1);
    assert_eq!(executor.count_all_threads_equivalent(JobKind::Suppress), 0);
}

#[tokio::test]
async fn test_equivalent_threads_round_trip() {
    let world = TestWorld::single_host(10, SimTarget::default());
    let executor = world.executor();
    let executor = executor.lock().await;

    for n in 0..1000 {
        for a in JobKind::ALL {
            for b in JobKind::ALL {
                let there = executor.equivalent_threads(n, a, b);
                let back = executor.equivalent_threads(there, b, a);
                assert!(back.abs_diff(n) <= 1, "{n} {a} -> {b} -> {a} gave {back}");
            }
        }
    }
    assert_eq!(executor.equivalent_threads(100, JobKind::Replenish, JobKind::Suppress), 100);
    assert_eq!(executor.equivalent_threads(100, JobKind::Replenish, JobKind::Extract), 102);
}

#[tokio::test]
async fn test_completion_clusters() {
    let world = TestWorld::single_host(100, SimTarget::default());
    let executor = world.executor();
    let mut executor = executor.lock().await;
    executor.update();

    let replenish_time = world.sim.duration(JobKind::Replenish, TARGET);
    executor.exec(TARGET, JobKind::Replenish, 3).await;
    world.advance(400.0);
    executor.exec(TARGET, JobKind::Replenish, 4).await;
    world.advance(20.0);
    executor.exec(TARGET, JobKind::Replenish, 2).await;

    let first = replenish_time;
    let second = replenish_time + 400.0;

    let at = executor
        .count_threads_finishing_at(JobKind::Replenish, TARGET, second)
        .unwrap();
    assert_eq!(at.threads, 6);

    let around = executor.count_threads_finishing_just_around(JobKind::Replenish, TARGET, first + 200.0);
    assert_eq!(around.before.unwrap().threads, 3);
    assert_eq!(around.before.unwrap().when, first);
    assert_eq!(around.after.unwrap().threads, 6);
    assert_eq!(around.after.unwrap().when, second);

    assert!(executor
        .count_threads_finishing_just_before(JobKind::Replenish, TARGET, first)
        .is_none());
    assert!(executor
        .count_threads_finishing_just_after(JobKind::Replenish, TARGET, second + 20.0)
        .is_none());
}
