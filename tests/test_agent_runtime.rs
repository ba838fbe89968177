//! Agent runtime contract: dedup, result publication, shutdown drain


use algoforge::agents::{Agent, AgentRuntime, AgentRuntimeConfig};
use algoforge::bus::{channels, InMemoryBus, MessageBus};
use algoforge::protocol::{Event, EventKind, EventPayload, TaskAssignment};
use algoforge::testing::mocks::{coder_output, FnAgent};
use algoforge::workflow::{AcceptanceCriteria, AgentRole};
use std::sync::Arc;
use test_helpers::{collect_channel, drain};

fn dispatch_event(task_id: &str) -> Event {
    let assignment = TaskAssignment {
        task_id: task_id.to_string(),
        role: AgentRole::Coder,
        title: "implement".to_string(),
        description: "a strategy".to_string(),
        acceptance: AcceptanceCriteria::default(),
        fixtures: vec![],
        artifact: None,
        debug_instructions: None,
        attempt: 1,
        timeout_secs: 60,
    };
    Event::new(
        "orchestrator",
        "wf-rt",
        Some(task_id.to_string()),
        EventPayload::TaskDispatched { assignment },
    )
}

async fn start_coder_runtime(bus: &Arc<InMemoryBus>) -> Arc<AgentRuntime> {
    let agent: Arc<dyn Agent> = Arc::new(FnAgent::new(AgentRole::Coder, |assignment| {
        Ok(coder_output(&assignment))
    }));
    let bus: Arc<dyn MessageBus> = bus.clone();
    let runtime = AgentRuntime::new(agent, bus, AgentRuntimeConfig::new("coder-1"));
    runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn test_runtime_publishes_started_and_completed() {
    let bus = Arc::new(InMemoryBus::new());
    let runtime = start_coder_runtime(&bus).await;
    let mut results = collect_channel(&bus, channels::AGENT_RESULTS).await;

    let dispatch = dispatch_event("t1");
    let correlation_id = dispatch.correlation_id;
    bus.publish(&channels::task_channel(AgentRole::Coder), dispatch)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let events = drain(&mut results);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), EventKind::AgentTaskStarted);
    assert_eq!(events[1].kind(), EventKind::AgentTaskCompleted);
    // Responses correlate with the dispatch.
    assert_eq!(events[0].correlation_id, correlation_id);
    assert_eq!(events[1].correlation_id, correlation_id);

    match &events[1].payload {
        EventPayload::AgentTaskCompleted { agent_id, output } => {
            assert_eq!(agent_id, "coder-1");
            assert_eq!(output.artifact.as_deref(), Some("artifacts/strategy_t1.py"));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_dispatch_processed_once() {
    let bus = Arc::new(InMemoryBus::new());
    let runtime = start_coder_runtime(&bus).await;
    let mut results = collect_channel(&bus, channels::AGENT_RESULTS).await;

    // At-least-once delivery: the same dispatch arrives twice with one
    // correlation id. The runtime must absorb the replay.
    let dispatch = dispatch_event("t1");
    for _ in 0..2 {
        bus.publish(&channels::task_channel(AgentRole::Coder), dispatch.clone())
            .await
            .unwrap();
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let events = drain(&mut results);
    let completions = events
        .iter()
        .filter(|e| e.kind() == EventKind::AgentTaskCompleted)
        .count();
    assert_eq!(completions, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_distinct_dispatches_both_processed() {
    let bus = Arc::new(InMemoryBus::new());
    let runtime = start_coder_runtime(&bus).await;
    let mut results = collect_channel(&bus, channels::AGENT_RESULTS).await;

    bus.publish(&channels::task_channel(AgentRole::Coder), dispatch_event("t1"))
        .await
        .unwrap();
    bus.publish(&channels::task_channel(AgentRole::Coder), dispatch_event("t2"))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let events = drain(&mut results);
    let completions = events
        .iter()
        .filter(|e| e.kind() == EventKind::AgentTaskCompleted)
        .count();
    assert_eq!(completions, 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_wrong_role_dispatch_ignored() {
    let bus = Arc::new(InMemoryBus::new());
    let runtime = start_coder_runtime(&bus).await;
    let mut results = collect_channel(&bus, channels::AGENT_RESULTS).await;

    // A tester assignment published onto the coder channel must not run.
    let mut event = dispatch_event("t1");
    if let EventPayload::TaskDispatched { assignment } = &mut event.payload {
        assignment.role = AgentRole::Tester;
    }
    bus.publish(&channels::task_channel(AgentRole::Coder), event)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(drain(&mut results).is_empty());

    runtime.shutdown().await;
}
