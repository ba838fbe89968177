//! Canonical event envelopes for the agent bus
//!
//! Every message crossing the bus is an [`Event`]: a fixed envelope plus one
//! variant of a closed payload set. Payloads are tagged serde variants, so a
//! message that does not match a known kind fails to deserialize instead of
//! flowing through the system as an untyped blob. Validation runs again at
//! publish time; a malformed event is rejected and logged, never routed.

use crate::workflow::{AcceptanceCriteria, AgentRole, ArtifactPath, FailureClass};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

/// Process-wide sequence counter so event timestamps order deterministically
/// even when wall-clock resolution collapses two events onto the same instant.
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskDispatched,
    AgentTaskStarted,
    AgentTaskCompleted,
    AgentTaskFailed,
    TestPassed,
    TestFailed,
    WorkflowBranchCreated,
    WorkflowCompleted,
    WorkflowBlocked,
    TaskCancelRequested,
    HandlerError,
}

/// Work handed to an agent with a `TASK_DISPATCHED` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub role: AgentRole,
    pub title: String,
    pub description: String,
    pub acceptance: AcceptanceCriteria,
    /// Fixture files the acceptance run depends on.
    #[serde(default)]
    pub fixtures: Vec<String>,
    /// Set when this task belongs to a fix chain: the agent must overwrite
    /// exactly this path instead of inventing a new one.
    pub artifact: Option<ArtifactPath>,
    pub debug_instructions: Option<String>,
    pub attempt: u32,
    pub timeout_secs: u64,
}

/// What an agent produced for a completed task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub artifact: Option<String>,
    pub summary: String,
    pub test_report: Option<TestReport>,
}

/// Why an agent gave up on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    pub class: Option<FailureClass>,
    pub stderr_excerpt: Option<String>,
    pub test_report: Option<TestReport>,
}

/// Per-case outcome inside a test report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCaseStatus {
    Passed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseRecord {
    pub name: String,
    pub status: TestCaseStatus,
    pub duration_seconds: f64,
    pub message: Option<String>,
    pub stderr_excerpt: Option<String>,
}

/// Extracted context for a wall-time-exceeded run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutAnalysis {
    pub last_executed_line: Option<String>,
    pub candidate_fix: Option<String>,
}

/// Structured result of running a task's acceptance suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub cases: Vec<TestCaseRecord>,
    pub suggested_class: Option<FailureClass>,
    pub timeout_analysis: Option<TimeoutAnalysis>,
}

impl TestReport {
    pub fn failing_cases(&self) -> impl Iterator<Item = &TestCaseRecord> {
        self.cases
            .iter()
            .filter(|c| c.status != TestCaseStatus::Passed)
    }
}

/// Typed payloads, one per event kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    TaskDispatched {
        assignment: TaskAssignment,
    },
    AgentTaskStarted {
        agent_id: String,
    },
    AgentTaskCompleted {
        agent_id: String,
        output: TaskOutput,
    },
    AgentTaskFailed {
        agent_id: String,
        failure: TaskFailure,
    },
    TestPassed {
        report: TestReport,
    },
    TestFailed {
        report: TestReport,
    },
    WorkflowBranchCreated {
        branch_task_id: String,
        parent_task_id: String,
        reason: FailureClass,
        target_role: AgentRole,
        depth: u32,
    },
    WorkflowCompleted {
        completed_tasks: usize,
    },
    WorkflowBlocked {
        reason: String,
        blocked_tasks: Vec<String>,
    },
    TaskCancelRequested {
        reason: String,
    },
    HandlerError {
        channel: String,
        message: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::TaskDispatched { .. } => EventKind::TaskDispatched,
            EventPayload::AgentTaskStarted { .. } => EventKind::AgentTaskStarted,
            EventPayload::AgentTaskCompleted { .. } => EventKind::AgentTaskCompleted,
            EventPayload::AgentTaskFailed { .. } => EventKind::AgentTaskFailed,
            EventPayload::TestPassed { .. } => EventKind::TestPassed,
            EventPayload::TestFailed { .. } => EventKind::TestFailed,
            EventPayload::WorkflowBranchCreated { .. } => EventKind::WorkflowBranchCreated,
            EventPayload::WorkflowCompleted { .. } => EventKind::WorkflowCompleted,
            EventPayload::WorkflowBlocked { .. } => EventKind::WorkflowBlocked,
            EventPayload::TaskCancelRequested { .. } => EventKind::TaskCancelRequested,
            EventPayload::HandlerError { .. } => EventKind::HandlerError,
        }
    }

    /// Whether this kind must carry a task id in its envelope.
    fn requires_task_id(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::TaskDispatched
                | EventKind::AgentTaskStarted
                | EventKind::AgentTaskCompleted
                | EventKind::AgentTaskFailed
                | EventKind::TestPassed
                | EventKind::TestFailed
                | EventKind::TaskCancelRequested
        )
    }
}

/// The envelope every bus message travels in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    /// Agent or component that emitted this event.
    pub source: String,
    pub workflow_id: String,
    pub task_id: Option<String>,
    /// Correlates one dispatch with its started/completed/failed responses.
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Monotone per-process ordinal; ties on `timestamp` break by sequence.
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        workflow_id: impl Into<String>,
        task_id: Option<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            source: source.into(),
            workflow_id: workflow_id.into(),
            task_id,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sequence: EVENT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            payload,
        }
    }

    /// Same envelope fields, correlated with an earlier event.
    pub fn correlated(
        source: impl Into<String>,
        workflow_id: impl Into<String>,
        task_id: Option<String>,
        correlation_id: Uuid,
        payload: EventPayload,
    ) -> Self {
        let mut event = Event::new(source, workflow_id, task_id, payload);
        event.correlation_id = correlation_id;
        event
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Schema validation run at publish time.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.source.is_empty() {
            return Err(EventValidationError::MissingSource);
        }
        if self.workflow_id.is_empty() && self.kind() != EventKind::HandlerError {
            return Err(EventValidationError::MissingWorkflowId(self.kind()));
        }
        if self.payload.requires_task_id() && self.task_id.as_deref().unwrap_or("").is_empty() {
            return Err(EventValidationError::MissingTaskId(self.kind()));
        }
        if let EventPayload::TaskDispatched { assignment } = &self.payload {
            if Some(assignment.task_id.as_str()) != self.task_id.as_deref() {
                return Err(EventValidationError::TaskIdMismatch {
                    envelope: self.task_id.clone().unwrap_or_default(),
                    payload: assignment.task_id.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Reasons an event is refused at the bus boundary.
#[derive(Debug, Error, PartialEq)]
pub enum EventValidationError {
    #[error("event has no source agent id")]
    MissingSource,
    #[error("{0:?} event has no workflow id")]
    MissingWorkflowId(EventKind),
    #[error("{0:?} event has no task id")]
    MissingTaskId(EventKind),
    #[error("envelope task id '{envelope}' does not match payload task id '{payload}'")]
    TaskIdMismatch { envelope: String, payload: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch_event() -> Event {
        let assignment = TaskAssignment {
            task_id: "t1".to_string(),
            role: AgentRole::Coder,
            title: "implement strategy".to_string(),
            description: "mean-reversion on daily bars".to_string(),
            acceptance: AcceptanceCriteria::default(),
            fixtures: vec![],
            artifact: None,
            debug_instructions: None,
            attempt: 1,
            timeout_secs: 300,
        };
        Event::new(
            "orchestrator",
            "wf-1",
            Some("t1".to_string()),
            EventPayload::TaskDispatched { assignment },
        )
    }

    #[test]
    fn test_event_roundtrip() {
        let event = dispatch_event();
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(event, parsed);
        assert_eq!(parsed.kind(), EventKind::TaskDispatched);
        assert!(json.contains("\"TASK_DISPATCHED\""));
    }

    #[test]
    fn test_unknown_kind_fails_to_parse() {
        let raw = r#"{
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "source": "orchestrator",
            "workflow_id": "wf-1",
            "task_id": "t1",
            "correlation_id": "550e8400-e29b-41d4-a716-446655440001",
            "timestamp": "2024-01-01T12:00:00Z",
            "sequence": 0,
            "kind": "TASK_EXPLODED"
        }"#;

        assert!(serde_json::from_str::<Event>(raw).is_err());
    }

    #[test]
    fn test_validation_rejects_missing_task_id() {
        let mut event = dispatch_event();
        event.task_id = None;

        assert_eq!(
            event.validate(),
            Err(EventValidationError::MissingTaskId(
                EventKind::TaskDispatched
            ))
        );
    }

    #[test]
    fn test_validation_rejects_task_id_mismatch() {
        let mut event = dispatch_event();
        event.task_id = Some("other".to_string());

        assert!(matches!(
            event.validate(),
            Err(EventValidationError::TaskIdMismatch { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_missing_source() {
        let mut event = dispatch_event();
        event.source = String::new();

        assert_eq!(event.validate(), Err(EventValidationError::MissingSource));
    }

    #[test]
    fn test_workflow_completed_needs_no_task_id() {
        let event = Event::new(
            "orchestrator",
            "wf-1",
            None,
            EventPayload::WorkflowCompleted { completed_tasks: 2 },
        );
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_sequence_is_monotone() {
        let a = dispatch_event();
        let b = dispatch_event();
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_correlated_keeps_correlation_id() {
        let dispatch = dispatch_event();
        let started = Event::correlated(
            "coder-1",
            "wf-1",
            Some("t1".to_string()),
            dispatch.correlation_id,
            EventPayload::AgentTaskStarted {
                agent_id: "coder-1".to_string(),
            },
        );
        assert_eq!(started.correlation_id, dispatch.correlation_id);
        assert_ne!(started.event_id, dispatch.event_id);
    }
}
