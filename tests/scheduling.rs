// tests/scheduling.rs

mod common;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use common::Project;
use kiln::build::{BuildSession, CollectingListener};
use kiln::config::BuildSettings;
use kiln::graph::{OutputSpec, TaskDeclaration, TaskId};
use kiln::types::{CacheMode, HistoryStorageMode, TaskState};
use kiln_test_utils::fake_actions::{ActionLog, FailingAction, RecordingAction};
use kiln_test_utils::with_timeout;
use proptest::prelude::*;
use std::sync::Arc;

fn quiet_settings(project: &Project, workers: usize) -> BuildSettings {
    let mut settings = project.settings();
    settings.max_workers = workers;
    settings.cache_mode = CacheMode::Off;
    settings.history_storage = HistoryStorageMode::Memory;
    settings
}

// Acyclic by construction: task i may only depend on tasks 0..i.
fn dag_strategy(max_tasks: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_tasks).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..4), n).prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, deps)| {
                    let unique: HashSet<usize> = deps.into_iter().filter(|_| i > 0).map(|d| d % i.max(1)).collect();
                    let mut deps: Vec<usize> = unique.into_iter().collect();
                    deps.sort();
                    deps
                })
                .collect()
        })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn dependencies_finish_before_dependents_start(deps in dag_strategy(10), workers in 1usize..5) {
        let project = Project::new();
        let log = ActionLog::new();
        let mut session = project.session_with(quiet_settings(&project, workers));
        for (i, task_deps) in deps.iter().enumerate() {
            let mut decl = TaskDeclaration::new(
                TaskId::new(format!("t{i}")).unwrap(),
                RecordingAction::new(&log).with_delay(Duration::from_millis((i % 3) as u64)),
            );
            for d in task_deps {
                decl = decl.depends_on(TaskId::new(format!("t{d}")).unwrap());
            }
            session.register(decl).unwrap();
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let outcome = runtime.block_on(session.execute()).unwrap();

        prop_assert_eq!(outcome.exit_code(), 0);
        prop_assert_eq!(outcome.summary.executed, deps.len());

        let mut terminal_at = HashMap::new();
        let mut running_at = HashMap::new();
        for t in &outcome.timeline {
            match t.state {
                TaskState::Running => { running_at.insert(t.task.to_string(), t.seq); }
                s if s.is_terminal() => { terminal_at.insert(t.task.to_string(), t.seq); }
                _ => {}
            }
        }
        for (i, task_deps) in deps.iter().enumerate() {
            let started = running_at[&format!("t{i}")];
            for d in task_deps {
                let finished = terminal_at[&format!("t{d}")];
                prop_assert!(finished < started, "t{} finished at {} but t{} started at {}", d, finished, i, started);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_pool_is_bounded() {
    let project = Project::new();
    let log = ActionLog::new();
    let mut session = project.session_with(quiet_settings(&project, 2));
    for i in 0..6 {
        session
            .register_task(
                &format!("t{i}"),
                vec![],
                vec![],
                &[],
                RecordingAction::new(&log).with_delay(Duration::from_millis(30)),
            )
            .unwrap();
    }
    let outcome = with_timeout(session.execute()).await.unwrap();
    assert_eq!(outcome.summary.executed, 6);
    assert!(log.max_concurrency() <= 2, "saw {}", log.max_concurrency());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_resource_serialises_tasks() {
    let project = Project::new();
    let log = ActionLog::new();
    let mut session = project.session_with(quiet_settings(&project, 4));
    for i in 0..4 {
        session
            .register(
                TaskDeclaration::new(
                    TaskId::new(format!("t{i}")).unwrap(),
                    RecordingAction::new(&log).with_delay(Duration::from_millis(20)),
                )
                .resource("database"),
            )
            .unwrap();
    }
    let outcome = with_timeout(session.execute()).await.unwrap();
    assert_eq!(outcome.summary.executed, 4);
    assert_eq!(log.max_concurrency(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_outputs_never_run_together() {
    let project = Project::new();
    let log = ActionLog::new();
    let mut session = project.session_with(quiet_settings(&project, 4));
    session
        .register_task(
            "all",
            vec![],
            vec![OutputSpec::new("dir", "build")],
            &[],
            RecordingAction::new(&log).with_delay(Duration::from_millis(40)),
        )
        .unwrap();
    session
        .register_task(
            "one",
            vec![],
            vec![OutputSpec::new("obj", "build/one.o")],
            &[],
            RecordingAction::new(&log).with_delay(Duration::from_millis(40)),
        )
        .unwrap();
    let outcome = with_timeout(session.execute()).await.unwrap();
    assert_eq!(outcome.summary.executed, 2);
    assert_eq!(log.max_concurrency(), 1);
}

fn register_failure_graph(session: &mut BuildSession, log: &ActionLog) {
    // broken -> after_broken -> after_after; independent stands alone.
    session
        .register_task("broken", vec![], vec![], &[], FailingAction::new(log, 2))
        .unwrap();
    session
        .register_task("after_broken", vec![], vec![], &["broken"], RecordingAction::new(log))
        .unwrap();
    session
        .register_task("after_after", vec![], vec![], &["after_broken"], RecordingAction::new(log))
        .unwrap();
    session
        .register_task(
            "independent",
            vec![],
            vec![],
            &[],
            RecordingAction::new(log).with_delay(Duration::from_millis(50)),
        )
        .unwrap();
}

#[tokio::test]
async fn failure_skips_dependents_and_fails_the_build() {
    let project = Project::new();
    let log = ActionLog::new();
    let events = Arc::new(CollectingListener::new());
    let mut session = project
        .session_with(quiet_settings(&project, 1))
        .with_listener(events.clone());
    register_failure_graph(&mut session, &log);

    let outcome = with_timeout(session.execute()).await.unwrap();
    assert_eq!(outcome.state_of("broken"), Some(TaskState::Failed));
    assert_eq!(outcome.state_of("after_broken"), Some(TaskState::Skipped));
    assert_eq!(outcome.state_of("after_after"), Some(TaskState::Skipped));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(log.count("after_broken"), 0);
    assert!(events.skipped().contains(&"after_broken".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continue_on_failure_runs_independent_work() {
    let project = Project::new();
    let log = ActionLog::new();
    let mut settings = quiet_settings(&project, 2);
    settings.continue_on_failure = true;
    let mut session = project.session_with(settings);
    register_failure_graph(&mut session, &log);

    let outcome = with_timeout(session.execute()).await.unwrap();
    assert_eq!(outcome.state_of("broken"), Some(TaskState::Failed));
    assert_eq!(outcome.state_of("after_broken"), Some(TaskState::Skipped));
    assert_eq!(outcome.state_of("after_after"), Some(TaskState::Skipped));
    assert_eq!(outcome.state_of("independent"), Some(TaskState::Executed));
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_dispatch_and_reports_cancelled() {
    let project = Project::new();
    let log = ActionLog::new();
    let mut session = project.session_with(quiet_settings(&project, 2));
    session
        .register_task(
            "slow",
            vec![],
            vec![],
            &[],
            RecordingAction::new(&log).with_delay(Duration::from_secs(30)),
        )
        .unwrap();
    session
        .register_task("after_slow", vec![], vec![], &["slow"], RecordingAction::new(&log))
        .unwrap();

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let outcome = with_timeout(session.execute()).await.unwrap();
    assert!(outcome.cancelled);
    assert!(outcome.fatal.is_none());
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(outcome.summary.failed, 0);
    assert_eq!(log.count("after_slow"), 0);
    assert!(!outcome.state_of("after_slow").unwrap().is_terminal());
}
