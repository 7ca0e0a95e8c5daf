use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde_json::json;
use shuttle_core::domain::JobOutcome;
use shuttle_core::impls::InMemoryGraphStore;
use shuttle_core::ports::REQUIRES;
use shuttle_core::{
    FailurePolicy, JobEvent, JobId, JobState, ManagerBuilder, ManagerHandle, NewJob, Outcome,
    ShuttleError, processor_fn,
};
use tokio::sync::broadcast;

/// Blocks job bodies until opened.
#[derive(Clone, Default)]
struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    fn open(&self) {
        let (lock, cvar) = &*self.0;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &*self.0;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

async fn wait_finished(
    rx: &mut broadcast::Receiver<JobEvent>,
    id: &str,
) -> JobOutcome {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("event channel closed");
        if let JobEvent::Finished(outcome) = event
            && outcome.id.as_str() == id
        {
            return outcome;
        }
    }
}

async fn wait_state(manager: &ManagerHandle, id: &str, state: JobState) {
    for _ in 0..500 {
        if manager.status(id).await.unwrap() == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {state}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependent_waits_while_dependency_runs() {
    let gate = Gate::default();
    let started = Arc::new(Mutex::new(Vec::new()));

    let (g, log) = (gate.clone(), started.clone());
    let log_b = started.clone();
    let manager = ManagerBuilder::new()
        .processor(
            "typeA",
            processor_fn(move |ctx| {
                log.lock().unwrap().push(ctx.id().clone());
                g.wait();
                Ok(true)
            }),
        )
        .unwrap()
        .processor(
            "typeB",
            processor_fn(move |ctx| {
                log_b.lock().unwrap().push(ctx.id().clone());
                Ok(true)
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("A", "typeA", json!({})))
        .await
        .unwrap();
    let state = manager
        .add_job(NewJob::new("B", "typeB", json!({})).depends_on(["A"]))
        .await
        .unwrap();
    assert_eq!(state, JobState::Waiting);

    wait_state(&manager, "A", JobState::Running).await;
    assert_eq!(manager.status("B").await.unwrap(), Some(JobState::Waiting));

    gate.open();
    let b = wait_finished(&mut events, "B").await;
    assert!(b.success);
    assert_eq!(
        *started.lock().unwrap(),
        vec![JobId::new("A"), JobId::new("B")]
    );
    manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_runs_only_after_inputs_and_finalize() {
    let runs = Arc::new(AtomicUsize::new(0));
    let join_runs = runs.clone();
    let manager = ManagerBuilder::new()
        .processor("split", processor_fn(|_| Ok(true)))
        .unwrap()
        .processor(
            "join",
            processor_fn(move |_| {
                join_runs.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("JOIN", "join", json!({})).join())
        .await
        .unwrap();
    for id in ["X", "Y"] {
        manager
            .add_job(NewJob::new(id, "split", json!({})))
            .await
            .unwrap();
        manager.add_dependent_jobs("JOIN", [id]).await.unwrap();
    }

    wait_finished(&mut events, "X").await;
    wait_finished(&mut events, "Y").await;
    assert_eq!(manager.status("JOIN").await.unwrap(), Some(JobState::Declared));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    manager.finalize("JOIN").await.unwrap();
    let join = wait_finished(&mut events, "JOIN").await;
    assert!(join.success);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Second finalize changes nothing.
    manager.finalize("JOIN").await.unwrap();
    assert_eq!(
        manager.status("JOIN").await.unwrap(),
        Some(JobState::Completed)
    );
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn declaration_errors_are_returned_to_the_caller() {
    let manager = ManagerBuilder::new()
        .processor("t", processor_fn(|_| Ok(true)))
        .unwrap()
        .build()
        .unwrap();

    manager
        .add_job(NewJob::new("a", "t", json!({})).depends_on(["later"]))
        .await
        .unwrap();
    let err = manager
        .add_job(NewJob::new("a", "t", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, ShuttleError::DuplicateJob(_)));

    let err = manager.add_dependent_jobs("a", ["b"]).await.unwrap_err();
    assert!(matches!(err, ShuttleError::AlreadyFinalized(_)));

    let err = manager
        .add_job(NewJob::new("later", "t", json!({})).depends_on(["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ShuttleError::DependencyCycle(_)));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn strict_mode_rejects_undeclared_dependencies() {
    let manager = ManagerBuilder::new()
        .strict_dependencies(true)
        .processor("t", processor_fn(|_| Ok(true)))
        .unwrap()
        .build()
        .unwrap();

    let err = manager
        .add_job(NewJob::new("b", "t", json!({})).depends_on(["a"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ShuttleError::UnknownDependency { .. }));
    assert_eq!(manager.status("b").await.unwrap(), None);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn unregistered_type_is_a_failed_completion() {
    let manager = ManagerBuilder::new().build().unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("x", "nobody", json!({})))
        .await
        .unwrap();
    let outcome = wait_finished(&mut events, "x").await;

    assert!(!outcome.success);
    assert_eq!(outcome.state, JobState::Failed);
    assert!(outcome.error.unwrap().contains("no processor registered"));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn block_policy_fails_dependents() {
    let manager = ManagerBuilder::new()
        .failure_policy(FailurePolicy::Block)
        .processor("bad", processor_fn(|_| Ok(false)))
        .unwrap()
        .processor("good", processor_fn(|_| Ok(true)))
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("a", "bad", json!({})))
        .await
        .unwrap();
    manager
        .add_job(NewJob::new("b", "good", json!({})).depends_on(["a"]))
        .await
        .unwrap();

    let a = wait_finished(&mut events, "a").await;
    assert_eq!(a.error.as_deref(), Some("processor returned false"));
    let b = wait_finished(&mut events, "b").await;
    assert_eq!(b.state, JobState::Failed);
    assert!(b.error.unwrap().contains("dependency a"));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn release_policy_runs_dependents_anyway() {
    let manager = ManagerBuilder::new()
        .failure_policy(FailurePolicy::Release)
        .processor("bad", processor_fn(|_| Ok(false)))
        .unwrap()
        .processor("good", processor_fn(|_| Ok(true)))
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("a", "bad", json!({})))
        .await
        .unwrap();
    manager
        .add_job(NewJob::new("b", "good", json!({})).depends_on(["a"]))
        .await
        .unwrap();

    let b = wait_finished(&mut events, "b").await;
    assert!(b.success);
    manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_running_job_calls_processor_cancel_once() {
    struct Spinner {
        cancels: AtomicUsize,
    }

    impl shuttle_core::Processor for Spinner {
        fn run(&self, ctx: &shuttle_core::JobContext) -> Result<Outcome, ShuttleError> {
            loop {
                ctx.check_cancelled()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        fn cancel(&self, _id: &JobId) -> bool {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    let spinner = Arc::new(Spinner {
        cancels: AtomicUsize::new(0),
    });
    let manager = ManagerBuilder::new()
        .processor("spin", spinner.clone())
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("s", "spin", json!({})))
        .await
        .unwrap();
    wait_state(&manager, "s", JobState::Running).await;

    assert!(manager.cancel_job("s").await.unwrap());
    assert!(manager.cancel_job("s").await.unwrap());

    let outcome = wait_finished(&mut events, "s").await;
    assert_eq!(outcome.state, JobState::Cancelled);
    assert_eq!(spinner.cancels.load(Ordering::SeqCst), 1);

    // Terminal now.
    assert!(!manager.cancel_job("s").await.unwrap());
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_waiting_job_never_runs_it() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let manager = ManagerBuilder::new()
        .processor(
            "t",
            processor_fn(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("b", "t", json!({})).depends_on(["a"]))
        .await
        .unwrap();
    assert!(manager.cancel_job("b").await.unwrap());

    let outcome = wait_finished(&mut events, "b").await;
    assert_eq!(outcome.state, JobState::Cancelled);

    manager
        .add_job(NewJob::new("a", "t", json!({})))
        .await
        .unwrap();
    wait_finished(&mut events, "a").await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let err = manager.cancel_job("nope").await.unwrap_err();
    assert!(matches!(err, ShuttleError::UnknownJob(_)));
    manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_pool_never_exceeds_worker_threads() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (running.clone(), peak.clone());
    let manager = ManagerBuilder::new()
        .worker_threads(2)
        .processor(
            "slow",
            processor_fn(move |_| {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(true)
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    for i in 0..6 {
        manager
            .add_job(NewJob::new(format!("j{i}"), "slow", json!({})))
            .await
            .unwrap();
    }
    for _ in 0..6 {
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(JobEvent::Finished(o)) = events.recv().await {
                    return o;
                }
            }
        })
        .await
        .unwrap();
        assert!(event.success);
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(manager.counts().await.unwrap().completed, 6);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn panics_and_precheck_rejections_fail_the_job() {
    struct Picky;

    impl shuttle_core::Processor for Picky {
        fn run(&self, _ctx: &shuttle_core::JobContext) -> Result<Outcome, ShuttleError> {
            Ok(Outcome::success())
        }

        fn precheck(&self, _id: &JobId, payload: &serde_json::Value) -> bool {
            payload.get("ok").is_some()
        }
    }

    let manager = ManagerBuilder::new()
        .processor("picky", Arc::new(Picky))
        .unwrap()
        .processor(
            "boom",
            processor_fn(|_| -> Result<bool, ShuttleError> { panic!("exploded") }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("p", "picky", json!({})))
        .await
        .unwrap();
    let p = wait_finished(&mut events, "p").await;
    assert!(p.error.unwrap().contains("precheck"));

    manager
        .add_job(NewJob::new("x", "boom", json!({})))
        .await
        .unwrap();
    let x = wait_finished(&mut events, "x").await;
    assert!(x.error.unwrap().contains("exploded"));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn progress_is_pushed_and_queryable() {
    let manager = ManagerBuilder::new()
        .processor(
            "t",
            processor_fn(|ctx| {
                ctx.send_progress(shuttle_core::ProgressState::running(60, "copying"));
                Ok(true)
            }),
        )
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("j", "t", json!({})))
        .await
        .unwrap();

    let mut saw_progress = false;
    loop {
        match events.recv().await.unwrap() {
            JobEvent::Progress { id, progress } => {
                assert_eq!(id, JobId::new("j"));
                assert_eq!(progress.percent, 60);
                saw_progress = true;
            }
            JobEvent::Finished(_) => break,
            _ => {}
        }
    }
    assert!(saw_progress);
    let last = manager.progress("j").await.unwrap().unwrap();
    assert!(last.is_done());
    assert_eq!(last.message, "copying");
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn graph_store_mirrors_the_dependency_graph() {
    let store = InMemoryGraphStore::new();
    let manager = ManagerBuilder::new()
        .graph_store(store.clone())
        .processor("t", processor_fn(|_| Ok(true)))
        .unwrap()
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    manager
        .add_job(NewJob::new("a", "t", json!({})))
        .await
        .unwrap();
    manager
        .add_job(NewJob::new("b", "t", json!({})).depends_on(["a"]))
        .await
        .unwrap();
    wait_finished(&mut events, "b").await;

    assert_eq!(
        store.edges(REQUIRES),
        vec![(JobId::new("b"), JobId::new("a"))]
    );
    assert_eq!(
        manager.dependencies("b").await.unwrap_or_default(),
        Vec::<JobId>::new()
    );
    manager.shutdown().await.unwrap();
}
