//! Concurrent spawn attempts for one orchestration launch exactly one
//! workflow.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use orchestrator::spawner::{SpawnOutcome, Spawner};
use orchestrator::test_support::{FakeLauncher, FakeWorkflows, FixedClock, TestProject};

#[test]
fn concurrent_spawns_launch_once() {
    let project = TestProject::initialized("orch-1");
    let paths = project.paths();
    let workflows = Arc::new(FakeWorkflows::default());
    let launcher = Arc::new(FakeLauncher::new("orch-1", workflows.clone()));
    launcher.set_delay(Duration::from_millis(50));
    let clock = Arc::new(FixedClock::default());

    let outcomes: Vec<SpawnOutcome> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let spawner = Spawner::new(
                    &paths,
                    "orch-1",
                    Duration::from_secs(30),
                    workflows.clone(),
                    launcher.clone(),
                    clock.clone(),
                );
                scope.spawn(move || spawner.spawn_with_intent("design", None).expect("spawn"))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect()
    });

    let spawned = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, SpawnOutcome::Spawned(_)))
        .count();
    assert_eq!(spawned, 1);
    assert_eq!(launcher.skills(), vec!["design".to_string()]);
    assert!(
        outcomes
            .iter()
            .all(|outcome| matches!(outcome, SpawnOutcome::Spawned(_) | SpawnOutcome::Skipped(_)))
    );
}

#[test]
fn sequential_spawn_after_the_workflow_ends_launches_again() {
    let project = TestProject::initialized("orch-1");
    let workflows = Arc::new(FakeWorkflows::default());
    let launcher = Arc::new(FakeLauncher::new("orch-1", workflows.clone()));
    let spawner = Spawner::new(
        &project.paths(),
        "orch-1",
        Duration::from_secs(30),
        workflows.clone(),
        launcher.clone(),
        Arc::new(FixedClock::default()),
    );

    let SpawnOutcome::Spawned(first) = spawner.spawn_with_intent("design", None).expect("first")
    else {
        panic!("first spawn should launch");
    };
    assert!(matches!(
        spawner.spawn_with_intent("design", None).expect("second"),
        SpawnOutcome::Skipped(_)
    ));

    workflows.set_status(&first.id, orchestrator::state::WorkflowStatus::Completed);
    assert!(matches!(
        spawner.spawn_with_intent("analyze", None).expect("third"),
        SpawnOutcome::Spawned(_)
    ));
    assert_eq!(launcher.skills(), vec!["design", "analyze"]);
}
