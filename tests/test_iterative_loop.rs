//! Iterative convergence scenarios
//!
//! Covers S6 (fix task converges on pass 2 with a stable artifact path) and
//! the hard iteration bound.


use algoforge::agents::Agent;
use algoforge::iterate::{FinalStatus, IterativeLoop, IterativeLoopConfig};
use algoforge::testing::mocks::{
    coder_output, coder_tester_todo, failing_test_failure, passing_test_output, FnAgent,
    ScriptedAgent,
};
use algoforge::workflow::{AgentRole, FailureClass};
use std::sync::Arc;
use test_helpers::harness_with_agents;

fn mock_coder() -> Arc<dyn Agent> {
    Arc::new(FnAgent::new(AgentRole::Coder, |assignment| {
        Ok(coder_output(&assignment))
    }))
}

#[tokio::test]
async fn test_s6_iterative_convergence() {
    // auto_fix_mode off: branching stays out of the way so recovery is the
    // iterative loop's job. Pass 1 fails with a syntax error, pass 2 passes
    // after the fix task rewrites the same file.
    let tester: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(
        AgentRole::Tester,
        vec![Err(failing_test_failure(
            FailureClass::SyntaxError,
            "SyntaxError: invalid syntax",
        ))],
        Ok(passing_test_output()),
    ));
    let harness = harness_with_agents(vec![mock_coder(), tester]).await;

    let todo = coder_tester_todo("wf-s6", false, 2);
    let workflow_id = harness.orchestrator.load_workflow(todo).await.unwrap();

    let driver = IterativeLoop::new(
        harness.orchestrator.clone(),
        harness.store.clone(),
        IterativeLoopConfig { max_iterations: 5 },
    );
    let report = driver.run_to_convergence(&workflow_id).await.unwrap();

    assert_eq!(report.passes.len(), 2);
    assert_eq!(report.final_status, FinalStatus::Converged { passes: 2 });

    // Pass 1 failed and injected exactly one fix task.
    assert!(!report.passes[0].completed);
    assert_eq!(report.passes[0].failures.len(), 1);
    assert_eq!(report.passes[0].failures[0].class, FailureClass::SyntaxError);
    assert_eq!(
        report.passes[0].injected_fix_tasks,
        vec!["t2_fix_p1".to_string()]
    );
    assert!(report.passes[1].completed);

    // Original-artifact-path invariant across passes: the fix task mutated
    // the same file identity t1 produced.
    let snapshot = harness.orchestrator.status(&workflow_id).await.unwrap();
    let t1 = snapshot.tasks.iter().find(|t| t.id == "t1").unwrap();
    let fix = snapshot.tasks.iter().find(|t| t.id == "t2_fix_p1").unwrap();
    assert_eq!(
        fix.original_artifact_path.as_deref(),
        t1.original_artifact_path.as_deref()
    );
    assert_eq!(
        t1.original_artifact_path.as_deref(),
        Some("artifacts/strategy_t1.py")
    );

    // The report was mirrored to the store.
    use algoforge::persistence::StateStore;
    let stored = harness
        .store
        .load_report(&workflow_id)
        .await
        .unwrap()
        .expect("report persisted");
    assert_eq!(stored.passes.len(), 2);
}

#[tokio::test]
async fn test_iteration_bound_is_hard() {
    // The tester never passes; the loop must stop at max_iterations and
    // report the leftovers.
    let tester: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(
        AgentRole::Tester,
        vec![],
        Err(failing_test_failure(
            FailureClass::LogicError,
            "metric assertion failed: sharpe",
        )),
    ));
    let harness = harness_with_agents(vec![mock_coder(), tester]).await;

    let todo = coder_tester_todo("wf-bound", false, 2);
    let workflow_id = harness.orchestrator.load_workflow(todo).await.unwrap();

    let driver = IterativeLoop::new(
        harness.orchestrator.clone(),
        harness.store.clone(),
        IterativeLoopConfig { max_iterations: 3 },
    );
    let report = driver.run_to_convergence(&workflow_id).await.unwrap();

    assert_eq!(report.passes.len(), 3);
    match &report.final_status {
        FinalStatus::Exhausted { remaining_failures } => {
            assert!(remaining_failures.contains(&"t2".to_string()));
        }
        other => panic!("expected exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_fix_task_reload_is_idempotent() {
    let tester: Arc<dyn Agent> = Arc::new(ScriptedAgent::new(
        AgentRole::Tester,
        vec![Err(failing_test_failure(
            FailureClass::SyntaxError,
            "SyntaxError: invalid syntax",
        ))],
        Ok(passing_test_output()),
    ));
    let harness = harness_with_agents(vec![mock_coder(), tester]).await;

    let todo = coder_tester_todo("wf-reload", false, 2);
    let workflow_id = harness.orchestrator.load_workflow(todo).await.unwrap();
    harness.orchestrator.run(&workflow_id).await.unwrap();

    let fix = {
        let mut fix = algoforge::workflow::Task::new("t2_fix_p1", "fix t2", AgentRole::Coder);
        fix.parent_id = Some("t2".to_string());
        fix.is_temporary = true;
        fix
    };

    let merged = harness
        .orchestrator
        .reload_workflow_tasks(&workflow_id, vec![fix.clone()])
        .await
        .unwrap();
    assert_eq!(merged, 1);

    // Replaying the same reload adds nothing.
    let merged = harness
        .orchestrator
        .reload_workflow_tasks(&workflow_id, vec![fix])
        .await
        .unwrap();
    assert_eq!(merged, 0);
}
