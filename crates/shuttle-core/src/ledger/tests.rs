use rstest::rstest;
use serde_json::json;

use super::*;
use crate::impls::InMemoryGraphStore;
use crate::ports::REQUIRES;

fn id(s: &str) -> JobId {
    JobId::new(s)
}

fn ty() -> JobType {
    JobType::new("test")
}

fn ledger() -> DependencyLedger {
    DependencyLedger::default()
}

fn with_policy(policy: FailurePolicy) -> DependencyLedger {
    DependencyLedger::new(LedgerOptions {
        failure_policy: policy,
        ..LedgerOptions::default()
    })
}

/// Declare + finalize in one go.
fn add(l: &mut DependencyLedger, name: &str, deps: &[&str]) -> Effects {
    let deps: Vec<JobId> = deps.iter().map(|d| id(d)).collect();
    l.declare(id(name), ty(), json!(null), &deps).unwrap();
    l.finalize(&id(name)).unwrap()
}

/// Ready -> Dispatched -> Running -> Completed.
fn run_to_completion(l: &mut DependencyLedger, name: &str) -> Effects {
    l.mark_dispatched(&id(name)).unwrap();
    l.mark_running(&id(name)).unwrap();
    l.mark_completed(&id(name)).unwrap()
}

#[test]
fn job_without_dependencies_is_ready_on_finalize() {
    let mut l = ledger();
    let effects = add(&mut l, "a", &[]);

    assert_eq!(effects.ready_ids(), vec![id("a")]);
    assert_eq!(l.state(&id("a")), Some(JobState::Ready));
    assert!(l.is_ready(&id("a")));
}

#[test]
fn declared_job_is_not_ready_before_finalize() {
    let mut l = ledger();
    l.declare(id("a"), ty(), json!({"n": 1}), &[]).unwrap();

    assert_eq!(l.state(&id("a")), Some(JobState::Declared));
    assert!(!l.is_ready(&id("a")));
    assert_eq!(l.record(&id("a")).unwrap().payload, json!({"n": 1}));
}

#[test]
fn dependent_becomes_ready_after_dependency_completes() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    let effects = add(&mut l, "b", &["a"]);

    assert!(effects.is_empty());
    assert_eq!(l.state(&id("b")), Some(JobState::Waiting));
    assert_eq!(l.remaining(&id("b")), Some(1));

    let effects = run_to_completion(&mut l, "a");
    assert_eq!(effects.ready_ids(), vec![id("b")]);
    assert_eq!(l.state(&id("a")), Some(JobState::Completed));
    assert_eq!(l.remaining(&id("b")), Some(0));
}

#[test]
fn fan_in_with_dependencies_completing_before_finalize() {
    let mut l = ledger();
    l.declare(id("join"), ty(), json!(null), &[]).unwrap();
    for i in 0..3 {
        let split = format!("split-{i}");
        add(&mut l, &split, &[]);
        l.add_deps(&id("join"), &[id(&split)]).unwrap();
    }

    // Every split finishes while the join is still open.
    for i in 0..3 {
        let effects = run_to_completion(&mut l, &format!("split-{i}"));
        assert!(effects.is_empty());
    }
    assert_eq!(l.state(&id("join")), Some(JobState::Declared));
    assert_eq!(l.remaining(&id("join")), Some(0));

    let effects = l.finalize(&id("join")).unwrap();
    assert_eq!(effects.ready_ids(), vec![id("join")]);
}

#[test]
fn edge_to_completed_job_is_resolved_immediately() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    run_to_completion(&mut l, "a");

    let effects = add(&mut l, "b", &["a"]);
    assert_eq!(effects.ready_ids(), vec![id("b")]);
    assert_eq!(l.dependencies_of(&id("b")), vec![id("a")]);
}

#[test]
fn finalize_twice_is_a_no_op() {
    let mut l = ledger();
    let first = add(&mut l, "a", &[]);
    let second = l.finalize(&id("a")).unwrap();

    assert_eq!(first.ready.len(), 1);
    assert!(second.is_empty());
    assert_eq!(l.state(&id("a")), Some(JobState::Ready));
}

#[test]
fn redeclaring_a_job_is_rejected() {
    let mut l = ledger();
    add(&mut l, "a", &[]);

    let err = l.declare(id("a"), ty(), json!(null), &[]).unwrap_err();
    assert!(matches!(err, ShuttleError::DuplicateJob(j) if j == id("a")));

    run_to_completion(&mut l, "a");
    let err = l.declare(id("a"), ty(), json!(null), &[]).unwrap_err();
    assert!(matches!(err, ShuttleError::DuplicateJob(_)));
}

#[test]
fn adding_dependencies_after_finalize_is_rejected() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    add(&mut l, "b", &[]);

    let err = l.add_deps(&id("b"), &[id("a")]).unwrap_err();
    assert!(matches!(err, ShuttleError::AlreadyFinalized(_)));
}

#[test]
fn duplicate_edges_count_once() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    l.declare(id("b"), ty(), json!(null), &[id("a"), id("a")])
        .unwrap();
    l.add_deps(&id("b"), &[id("a")]).unwrap();

    assert_eq!(l.remaining(&id("b")), Some(1));
    assert_eq!(l.dependencies_of(&id("b")), vec![id("a")]);
}

#[test]
fn forward_reference_waits_for_later_declaration() {
    let mut l = ledger();
    add(&mut l, "b", &["a"]);

    assert_eq!(l.state(&id("a")), None);
    assert_eq!(l.counts().placeholders, 1);

    let effects = add(&mut l, "a", &[]);
    assert_eq!(effects.ready_ids(), vec![id("a")]);
    assert_eq!(l.counts().placeholders, 0);

    let effects = run_to_completion(&mut l, "a");
    assert_eq!(effects.ready_ids(), vec![id("b")]);
}

#[test]
fn strict_mode_rejects_forward_references() {
    let mut l = DependencyLedger::new(LedgerOptions {
        strict_dependencies: true,
        ..LedgerOptions::default()
    });
    let err = l
        .declare(id("b"), ty(), json!(null), &[id("a")])
        .unwrap_err();

    assert!(matches!(
        err,
        ShuttleError::UnknownDependency { ref job, ref dependency }
            if *job == id("b") && *dependency == id("a")
    ));
    // Nothing was recorded for the rejected declaration.
    assert_eq!(l.state(&id("b")), None);
    assert_eq!(l.live_len(), 0);
}

#[test]
fn self_dependency_is_a_cycle() {
    let mut l = ledger();
    let err = l
        .declare(id("a"), ty(), json!(null), &[id("a")])
        .unwrap_err();
    assert!(matches!(err, ShuttleError::DependencyCycle(_)));
}

#[test]
fn closing_a_cycle_through_a_placeholder_is_rejected() {
    let mut l = ledger();
    l.declare(id("a"), ty(), json!(null), &[id("b")]).unwrap();
    l.declare(id("b"), ty(), json!(null), &[id("c")]).unwrap();

    let err = l
        .declare(id("c"), ty(), json!(null), &[id("a")])
        .unwrap_err();
    match err {
        ShuttleError::DependencyCycle(path) => {
            assert_eq!(path, vec![id("c"), id("a"), id("b"), id("c")]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(l.detect_cycle().is_none());
}

#[test]
fn cycles_are_accepted_when_rejection_is_disabled() {
    let mut l = DependencyLedger::new(LedgerOptions {
        reject_cycles: false,
        ..LedgerOptions::default()
    });
    l.declare(id("a"), ty(), json!(null), &[id("b")]).unwrap();
    l.declare(id("b"), ty(), json!(null), &[id("a")]).unwrap();

    let cycle = l.detect_cycle().expect("cycle should be detected");
    assert_eq!(cycle.first(), cycle.last());
    assert_eq!(cycle.len(), 3);
}

fn chain(l: &mut DependencyLedger, len: usize) {
    for i in 0..len {
        let next = id(&format!("j{}", i + 1));
        l.declare(id(&format!("j{i}")), ty(), json!(null), &[next])
            .unwrap();
    }
}

#[test]
fn long_chain_cycle_scan_runs_on_a_small_stack() {
    let mut l = ledger();
    chain(&mut l, 100_000);

    // Scan on a thread far smaller than the chain would need if walked recursively.
    let found = std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(move || l.detect_cycle())
        .unwrap()
        .join()
        .unwrap();
    assert!(found.is_none());
}

#[test]
fn cycle_closing_a_long_chain_is_found() {
    let mut l = DependencyLedger::new(LedgerOptions {
        reject_cycles: false,
        ..LedgerOptions::default()
    });
    chain(&mut l, 50_000);
    l.declare(id("j50000"), ty(), json!(null), &[id("j0")])
        .unwrap();

    let cycle = std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(move || l.detect_cycle())
        .unwrap()
        .join()
        .unwrap()
        .expect("cycle should be detected");
    assert_eq!(cycle.len(), 50_002);
    assert_eq!(cycle.first(), cycle.last());
}

#[test]
fn block_policy_fails_finalized_dependents_transitively() {
    let mut l = with_policy(FailurePolicy::Block);
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);
    add(&mut l, "c", &["b"]);

    l.mark_dispatched(&id("a")).unwrap();
    let effects = l.mark_failed(&id("a"), JobState::Failed, "boom").unwrap();

    let mut failed = effects.failed_ids();
    failed.sort();
    assert_eq!(failed, vec![id("b"), id("c")]);
    assert!(effects.ready.is_empty());
    assert_eq!(l.state(&id("c")), Some(JobState::Failed));
}

#[test]
fn block_policy_fails_open_join_on_finalize() {
    let mut l = with_policy(FailurePolicy::Block);
    add(&mut l, "a", &[]);
    l.declare(id("join"), ty(), json!(null), &[id("a")]).unwrap();

    let effects = l.mark_failed(&id("a"), JobState::Failed, "boom").unwrap();
    assert!(effects.is_empty());
    assert_eq!(l.state(&id("join")), Some(JobState::Declared));

    let effects = l.finalize(&id("join")).unwrap();
    assert_eq!(effects.failed_ids(), vec![id("join")]);
    assert!(effects.failed[0].reason.contains("a"));
    assert_eq!(l.state(&id("join")), Some(JobState::Failed));
}

#[test]
fn block_policy_handles_diamond_without_double_failure() {
    let mut l = with_policy(FailurePolicy::Block);
    add(&mut l, "root", &[]);
    add(&mut l, "left", &["root"]);
    add(&mut l, "right", &["root"]);
    add(&mut l, "bottom", &["left", "right"]);

    let effects = l
        .mark_failed(&id("root"), JobState::Failed, "boom")
        .unwrap();
    let mut failed = effects.failed_ids();
    failed.sort();
    assert_eq!(failed, vec![id("bottom"), id("left"), id("right")]);
}

#[test]
fn release_policy_treats_failure_as_resolved() {
    let mut l = with_policy(FailurePolicy::Release);
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);

    let effects = l
        .mark_failed(&id("a"), JobState::Cancelled, "cancelled")
        .unwrap();
    assert_eq!(effects.ready_ids(), vec![id("b")]);
    assert_eq!(l.state(&id("a")), Some(JobState::Cancelled));
}

#[test]
fn release_policy_resolves_edge_to_already_failed_job() {
    let mut l = with_policy(FailurePolicy::Release);
    add(&mut l, "a", &[]);
    l.mark_failed(&id("a"), JobState::Failed, "boom").unwrap();

    let effects = add(&mut l, "b", &["a"]);
    assert_eq!(effects.ready_ids(), vec![id("b")]);
}

#[test]
fn completion_is_idempotent() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);

    let first = l.mark_completed(&id("a")).unwrap();
    let second = l.mark_completed(&id("a")).unwrap();
    assert_eq!(first.ready.len(), 1);
    assert!(second.is_empty());
}

#[rstest]
#[case::declared(false)]
#[case::waiting(true)]
fn completion_of_unready_job_is_rejected(#[case] finalize: bool) {
    let mut l = ledger();
    l.declare(id("a"), ty(), json!(null), &[id("x")]).unwrap();
    if finalize {
        l.finalize(&id("a")).unwrap();
    }

    let err = l.mark_completed(&id("a")).unwrap_err();
    assert!(matches!(
        err,
        ShuttleError::InvalidTransition { to: JobState::Completed, .. }
    ));
}

#[test]
fn running_requires_dispatch_first() {
    let mut l = ledger();
    add(&mut l, "a", &[]);

    let err = l.mark_running(&id("a")).unwrap_err();
    assert!(matches!(
        err,
        ShuttleError::InvalidTransition {
            from: JobState::Ready,
            to: JobState::Running,
            ..
        }
    ));
}

#[test]
fn unknown_job_operations_fail() {
    let mut l = ledger();
    assert!(matches!(
        l.finalize(&id("nope")),
        Err(ShuttleError::UnknownJob(_))
    ));
    assert!(matches!(
        l.add_deps(&id("nope"), &[]),
        Err(ShuttleError::UnknownJob(_))
    ));
}

#[test]
fn cancelling_waiting_job_frees_orphaned_placeholder() {
    let mut l = ledger();
    add(&mut l, "b", &["ghost"]);
    assert_eq!(l.live_len(), 2);

    l.mark_failed(&id("b"), JobState::Cancelled, "cancelled")
        .unwrap();
    assert_eq!(l.live_len(), 0);
    assert_eq!(l.state(&id("b")), Some(JobState::Cancelled));
}

#[test]
fn counts_cover_live_and_retired_jobs() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);
    l.declare(id("c"), ty(), json!(null), &[]).unwrap();
    run_to_completion(&mut l, "a");

    let counts = l.counts();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.ready, 1);
    assert_eq!(counts.declared, 1);
    assert_eq!(counts.unfinished(), 2);
}

#[test]
fn dependents_are_listed_until_resolved() {
    let mut l = ledger();
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);
    add(&mut l, "c", &["a"]);

    let mut dependents = l.dependents_of(&id("a"));
    dependents.sort();
    assert_eq!(dependents, vec![id("b"), id("c")]);
}

#[test]
fn store_mirrors_vertices_edges_and_states() {
    let store = InMemoryGraphStore::new();
    let mut l = ledger().with_store(Box::new(store.clone()));
    add(&mut l, "a", &[]);
    add(&mut l, "b", &["a"]);
    run_to_completion(&mut l, "a");

    assert_eq!(store.vertex_count(), 2);
    assert_eq!(store.edges(REQUIRES), vec![(id("b"), id("a"))]);
    let vertex = store.get_vertex(&id("a")).unwrap();
    assert_eq!(vertex.state, Some(JobState::Completed));
    assert!(store.commit_count() > 0);
}
