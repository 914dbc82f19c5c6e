//! Runtime behavior under load and over time: the concurrency bound, deadline
//! sweeps, cancellation, memory reconciliation and on-disk state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use conductor::core::fingerprint::TaskFingerprint;
use conductor::core::session::Session;
use conductor::core::types::{AdmissionPolicy, ExecutionContext, SessionId, SessionState, TaskRequest};
use conductor::io::config::load_config;
use conductor::io::store::{FileStateStore, StateStore};
use conductor::tracker::CallTracker;
use conductor::test_support::{
    Reply, ScriptedCompletion, TempWorkspace, TestRig, envelope, spec,
};
use conductor::{Conductor, ConductorError};
use futures::future::join_all;
use serde_json::json;

fn request(rig: &TestRig, topic: &str) -> TaskRequest {
    TaskRequest::new("analyst", format!("study {topic}"), rig.root_context()).with_input("topic", topic)
}

#[tokio::test]
async fn blocking_admission_never_exceeds_the_limit() {
    let completion = ScriptedCompletion::with_fallback(envelope(json!({"summary": "ok"})))
        .with_delay(Duration::from_millis(60));
    let rig = TestRig::builder()
        .max_concurrent(2)
        .build(vec![spec("analyst")], completion.clone());

    let spawns = ["a", "b", "c"].map(|topic| rig.spawner.spawn("analyst", request(&rig, topic)));
    let results = join_all(spawns).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(completion.peak_in_flight(), 2);
    assert_eq!(rig.limiter().running(), 0);
    assert_eq!(rig.limiter().available(), 2);
}

#[tokio::test]
async fn reject_admission_refuses_the_extra_spawn() {
    let completion = ScriptedCompletion::with_fallback(envelope(json!({"summary": "ok"})))
        .with_delay(Duration::from_millis(60));
    let rig = TestRig::builder()
        .max_concurrent(2)
        .admission(AdmissionPolicy::Reject)
        .build(vec![spec("analyst")], completion.clone());

    let spawns = ["a", "b", "c"].map(|topic| rig.spawner.spawn("analyst", request(&rig, topic)));
    let results = join_all(spawns).await;

    let rejected: Vec<&ConductorError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].kind(), "concurrency_rejected");
    assert!(completion.peak_in_flight() <= 2);
    assert_eq!(completion.calls(), 2);
}

#[tokio::test]
async fn deadline_sweep_frees_the_slot() {
    let completion = ScriptedCompletion::new();
    completion.push(Reply::Hang);
    completion.set_fallback(envelope(json!({"summary": "after"})));
    let rig = TestRig::builder()
        .max_concurrent(1)
        .session_timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(20))
        .build(vec![spec("analyst")], completion);

    let started = Instant::now();
    let err = rig
        .spawner
        .spawn("analyst", request(&rig, "slow"))
        .await
        .unwrap_err();
    let ConductorError::SessionTimedOut(session) = err else {
        panic!("expected a timeout, got {err:?}");
    };
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(rig.sessions().state(session), Some(SessionState::TimedOut));
    assert_eq!(rig.limiter().running(), 0);

    rig.spawner
        .spawn("analyst", request(&rig, "next"))
        .await
        .expect("slot is free again");
}

#[tokio::test]
async fn cancelling_the_root_stops_in_flight_work() {
    let completion = ScriptedCompletion::new();
    completion.push(Reply::Hang);
    let rig = TestRig::new(vec![spec("analyst")], completion);
    let request = request(&rig, "stuck");
    let root = request.context.root;

    let (outcome, stopped) = tokio::join!(rig.spawner.spawn("analyst", request), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.conductor.cancel_root(root)
    });

    assert_eq!(stopped, 1);
    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), "cancelled");
    assert_eq!(rig.limiter().running(), 0);
    let sessions = rig.store().list_sessions().expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Cancelled);
}

#[tokio::test]
async fn memory_proposals_are_checked_against_their_own_request() {
    let completion = ScriptedCompletion::new();
    completion.push(Reply::Content(
        json!({
            "output": {"summary": "billing reviewed"},
            "memory": [
                {"op": "create", "entity": "Billing", "kind": "service", "observations": ["charges cards"]},
                {"op": "relate", "from": "Billing", "relation": "depends_on", "to": "ledger"},
                {"op": "create", "entity": "weather", "kind": "topic"}
            ]
        })
        .to_string(),
    ));
    let rig = TestRig::new(vec![spec("analyst")], completion);
    let request = TaskRequest::new("analyst", "review the billing service", rig.root_context())
        .with_input("topic", "billing")
        .with_subject("billing");

    let outcome = rig.conductor.run("analyst", request).await.expect("run");
    assert_eq!(outcome.memory.total(), 3);
    assert_eq!(outcome.memory.applied.len(), 1);
    let reasons: Vec<&str> = outcome
        .memory
        .rejected
        .iter()
        .map(|r| r.reason.as_str())
        .collect();
    // Relating needs both endpoints; the unrelated topic never reaches the writer.
    assert!(reasons.iter().any(|r| r.contains("ledger")));
    assert!(reasons.iter().any(|r| r.contains("unrelated")));

    let graph = rig.conductor.knowledge().await.expect("knowledge");
    assert_eq!(graph.entities.len(), 1);
    assert!(graph.entities["Billing"].sources.contains(&outcome.result.session));
}

#[tokio::test]
async fn runs_persist_sessions_and_knowledge_on_disk() {
    let workspace = TempWorkspace::with_specs(&[spec("analyst")]);
    let completion = ScriptedCompletion::with_fallback(
        json!({
            "output": {"summary": "auth uses jwt"},
            "memory": [{"op": "create", "entity": "auth", "kind": "module", "observations": ["jwt"]}]
        })
        .to_string(),
    );
    let config = load_config(&workspace.paths.config_path).expect("config");
    let conductor = Conductor::open_with(&workspace.paths, config, Arc::new(completion))
        .expect("open conductor");

    let request = TaskRequest::new("analyst", "summarize auth", conductor.new_root())
        .with_input("topic", "auth");
    let outcome = conductor.run("analyst", request).await.expect("run");
    assert_eq!(outcome.memory.applied.len(), 1);
    conductor.shutdown().await;

    let store = FileStateStore::new(&workspace.paths.state_dir);
    let sessions = store.list_sessions().expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Accepted);
    assert_eq!(sessions[0].transcript.len(), 3);

    let knowledge = std::fs::read_to_string(&workspace.paths.knowledge_path).expect("knowledge file");
    assert!(knowledge.contains("\"auth\""));
}

#[tokio::test]
async fn reopening_closes_sessions_left_running_by_a_crash() {
    let workspace = TempWorkspace::with_specs(&[spec("analyst")]);
    let config = load_config(&workspace.paths.config_path).expect("config");
    let store = FileStateStore::new(&workspace.paths.state_dir);
    let request = TaskRequest::new("analyst", "summarize auth", ExecutionContext::root(config.max_calls))
        .with_input("topic", "auth");
    let root = request.context.root;
    let id = SessionId::new();
    let fingerprint = TaskFingerprint::of(&request);
    CallTracker::new(config.limits(), Arc::new(store.clone()))
        .admit(&request, id, &fingerprint)
        .expect("admit");
    let mut session = Session::open(id, &request, fingerprint);
    session.transition(SessionState::Running).expect("run");
    store.save_session(&session).expect("save");

    let conductor = Conductor::open_with(&workspace.paths, config, Arc::new(ScriptedCompletion::new()))
        .expect("open conductor");
    let recovered = conductor.session(id).expect("session");
    assert_eq!(recovered.state, SessionState::TimedOut);
    assert_eq!(recovered.error.as_deref(), Some("abandoned by a previous process"));
    let record = conductor
        .spawner()
        .runtime()
        .tracker
        .snapshot(root)
        .expect("record");
    assert!(record.open.is_empty());
    assert_eq!(record.total_calls, 1);
    conductor.shutdown().await;
}
