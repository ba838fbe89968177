//! Workflow orchestrator
//!
//! Owns one `WorkflowState` per active workflow and drives it to completion:
//! compute the ready set, dispatch to agent channels, react to completion
//! and failure events, and convert test failures into branch tasks while the
//! depth budget lasts. Mutation of a workflow happens only under its own
//! lock; concurrent workflows are fully independent, each with its own event
//! queue fed by one shared bus subscription.

pub mod classify;

use crate::bus::{channels, EventHandler, HandlerError, MessageBus, SubscriptionToken};
use crate::error::{sanitize_error_message, OrchestrationError, OrchestrationResult};
use crate::observability::metrics::metrics;
use crate::persistence::StateStore;
use crate::protocol::{
    Event, EventPayload, TaskAssignment, TaskFailure, TaskOutput, TestReport,
};
use crate::workflow::{
    AgentRole, ArtifactPath, FailureClass, Task, TaskStatus, TodoList, WorkflowSnapshot,
    WorkflowState,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const SOURCE: &str = "orchestrator";

/// A task that ended a pass in failure, with everything the iterative loop
/// needs to mint a fix task for it.
#[derive(Debug, Clone)]
pub struct FailedTask {
    pub task_id: String,
    pub class: FailureClass,
    pub target_role: AgentRole,
    pub artifact: Option<ArtifactPath>,
    pub report: Option<TestReport>,
    pub message: String,
}

/// Outcome of one orchestrator pass.
#[derive(Debug, Clone)]
pub struct PassSummary {
    pub workflow_id: String,
    pub completed: bool,
    pub dispatched: usize,
    pub branches_created: usize,
    pub failed_tasks: Vec<FailedTask>,
}

struct WorkflowHandle {
    state: Arc<Mutex<WorkflowState>>,
    events: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

/// Routes bus events into per-workflow queues.
struct EventRouter {
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>,
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        let routes = self.routes.lock().await;
        if let Some(tx) = routes.get(&event.workflow_id) {
            // A dropped receiver means the workflow was torn down.
            let _ = tx.send(event);
        }
        Ok(())
    }
}

/// The workflow engine.
pub struct Orchestrator {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn StateStore>,
    workflows: Mutex<HashMap<String, WorkflowHandle>>,
    routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>,
    _subscriptions: Vec<SubscriptionToken>,
}

impl Orchestrator {
    /// Construct and subscribe to the agent and test result channels.
    pub async fn new(
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn StateStore>,
    ) -> OrchestrationResult<Self> {
        let routes: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut subscriptions = Vec::new();
        for channel in [channels::AGENT_RESULTS, channels::TEST_RESULTS] {
            let handler = Arc::new(EventRouter {
                routes: routes.clone(),
            });
            subscriptions.push(bus.subscribe(channel, handler).await?);
        }

        Ok(Self {
            bus,
            store,
            workflows: Mutex::new(HashMap::new()),
            routes,
            _subscriptions: subscriptions,
        })
    }

    /// Load a planner TodoList into a fresh workflow.
    pub async fn load_workflow(&self, todo: TodoList) -> OrchestrationResult<String> {
        let state = WorkflowState::from_todo_list(todo)?;
        let workflow_id = state.workflow_id.clone();

        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.lock().await.insert(workflow_id.clone(), tx);
        self.workflows.lock().await.insert(
            workflow_id.clone(),
            WorkflowHandle {
                state: Arc::new(Mutex::new(state)),
                events: Arc::new(Mutex::new(rx)),
            },
        );

        info!(workflow_id = %workflow_id, "workflow loaded");
        Ok(workflow_id)
    }

    /// Idempotently merge tasks appended by the iterative loop.
    pub async fn reload_workflow_tasks(
        &self,
        workflow_id: &str,
        new_tasks: Vec<Task>,
    ) -> OrchestrationResult<usize> {
        let handle = self.handle(workflow_id).await?;
        let mut state = handle.state.lock().await;
        let merged = state.merge_tasks(new_tasks);
        info!(workflow_id = %workflow_id, merged, "reloaded workflow tasks");
        Ok(merged)
    }

    pub async fn status(&self, workflow_id: &str) -> OrchestrationResult<WorkflowSnapshot> {
        let handle = self.handle(workflow_id).await?;
        let state = handle.state.lock().await;
        Ok(state.snapshot())
    }

    /// The workflow's append-only event journal, for audit.
    pub async fn journal(&self, workflow_id: &str) -> OrchestrationResult<Vec<Event>> {
        let handle = self.handle(workflow_id).await?;
        let state = handle.state.lock().await;
        Ok(state.journal().to_vec())
    }

    /// Remove a workflow and its event route.
    pub async fn teardown(&self, workflow_id: &str) {
        self.routes.lock().await.remove(workflow_id);
        self.workflows.lock().await.remove(workflow_id);
    }

    async fn handle(&self, workflow_id: &str) -> OrchestrationResult<WorkflowHandle> {
        let workflows = self.workflows.lock().await;
        workflows
            .get(workflow_id)
            .map(|h| WorkflowHandle {
                state: h.state.clone(),
                events: h.events.clone(),
            })
            .ok_or_else(|| {
                OrchestrationError::internal(format!("unknown workflow: {workflow_id}"))
            })
    }

    /// Run one pass: dispatch until nothing is ready or running.
    #[tracing::instrument(name = "workflow_pass", skip(self))]
    pub async fn run(&self, workflow_id: &str) -> OrchestrationResult<PassSummary> {
        let handle = self.handle(workflow_id).await?;
        metrics().record_workflow_pass();

        let mut deadlines: HashMap<String, Instant> = HashMap::new();
        let mut summary = PassSummary {
            workflow_id: workflow_id.to_string(),
            completed: false,
            dispatched: 0,
            branches_created: 0,
            failed_tasks: Vec::new(),
        };

        loop {
            // Dispatch phase: collect under the lock, publish after.
            let dispatch_events = {
                let mut state = handle.state.lock().await;
                let mut events = Vec::new();
                for task_id in state.ready_tasks() {
                    let attempt = state.mark_running(&task_id)?;
                    let task = state
                        .task(&task_id)
                        .expect("ready task must exist")
                        .clone();
                    let assignment = TaskAssignment {
                        task_id: task.id.clone(),
                        role: task.role,
                        title: task.title.clone(),
                        description: task.description.clone(),
                        acceptance: task.acceptance.clone(),
                        fixtures: task.fixtures.clone(),
                        artifact: task.metadata.original_artifact_path.clone(),
                        debug_instructions: task.debug_instructions.clone(),
                        attempt,
                        timeout_secs: task.timeout_secs,
                    };
                    let event = Event::new(
                        SOURCE,
                        workflow_id,
                        Some(task.id.clone()),
                        EventPayload::TaskDispatched { assignment },
                    );
                    state.record_event(event.clone());
                    deadlines.insert(
                        task.id.clone(),
                        Instant::now() + Duration::from_secs(task.timeout_secs),
                    );
                    events.push((task.role, event));
                }
                events
            };

            for (role, event) in dispatch_events {
                summary.dispatched += 1;
                metrics().record_task_dispatched();
                debug!(task_id = ?event.task_id, role = %role, "dispatching task");
                self.bus.publish(&channels::task_channel(role), event).await?;
            }

            // Terminal check: with nothing running, either newly-ready work
            // exists (dispatch it) or the pass is over.
            {
                let mut state = handle.state.lock().await;
                if !state.has_running() {
                    if !state.ready_tasks().is_empty() {
                        continue;
                    }
                    if state.all_completed() {
                        let event = Event::new(
                            SOURCE,
                            workflow_id,
                            None,
                            EventPayload::WorkflowCompleted {
                                completed_tasks: state.tasks().len(),
                            },
                        );
                        state.record_event(event.clone());
                        drop(state);
                        self.bus.publish(channels::WORKFLOW_STATUS, event).await?;
                        summary.completed = true;
                    }
                    break;
                }
            }

            // Await phase: next event or the nearest running-task deadline.
            let nearest = deadlines.values().min().copied();
            let wait = nearest
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(60));

            let event = {
                let mut events = handle.events.lock().await;
                match tokio::time::timeout(wait, events.recv()).await {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => {
                        return Err(OrchestrationError::internal(
                            "workflow event channel closed",
                        ))
                    }
                    Err(_elapsed) => None,
                }
            };

            match event {
                Some(event) => {
                    self.process_event(workflow_id, &handle, event, &mut deadlines, &mut summary)
                        .await?;
                }
                None => {
                    self.expire_overdue(workflow_id, &handle, &mut deadlines, &mut summary)
                        .await?;
                }
            }
        }

        // Mirror the final state of the pass.
        let snapshot = {
            let state = handle.state.lock().await;
            state.snapshot()
        };
        self.store.save_workflow(snapshot).await?;
        Ok(summary)
    }

    /// Synthesise timeout failures for running tasks past their deadline and
    /// tell agents to abandon them.
    async fn expire_overdue(
        &self,
        workflow_id: &str,
        handle: &WorkflowHandle,
        deadlines: &mut HashMap<String, Instant>,
        summary: &mut PassSummary,
    ) -> OrchestrationResult<()> {
        let now = Instant::now();
        let overdue: Vec<String> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for task_id in overdue {
            warn!(workflow_id = %workflow_id, task_id = %task_id, "task timed out");
            let cancel = Event::new(
                SOURCE,
                workflow_id,
                Some(task_id.clone()),
                EventPayload::TaskCancelRequested {
                    reason: "task timeout expired".to_string(),
                },
            );
            self.bus.publish(channels::SYSTEM_CONTROL, cancel).await?;

            let failure = TaskFailure {
                message: "task timed out before the agent reported a result".to_string(),
                class: Some(FailureClass::Timeout),
                stderr_excerpt: None,
                test_report: None,
            };
            self.handle_failure(workflow_id, handle, &task_id, failure, deadlines, summary)
                .await?;
        }
        Ok(())
    }

    async fn process_event(
        &self,
        workflow_id: &str,
        handle: &WorkflowHandle,
        event: Event,
        deadlines: &mut HashMap<String, Instant>,
        summary: &mut PassSummary,
    ) -> OrchestrationResult<()> {
        {
            let mut state = handle.state.lock().await;
            state.record_event(event.clone());
        }

        match event.payload.clone() {
            EventPayload::AgentTaskCompleted { agent_id, output } => {
                let task_id = event.task_id.clone().unwrap_or_default();
                debug!(task_id = %task_id, agent_id = %agent_id, "agent completed task");
                self.handle_completion(workflow_id, handle, &task_id, output, deadlines)
                    .await?;
            }
            EventPayload::AgentTaskFailed { agent_id, failure } => {
                let task_id = event.task_id.clone().unwrap_or_default();
                debug!(task_id = %task_id, agent_id = %agent_id, "agent failed task");
                self.handle_failure(workflow_id, handle, &task_id, failure, deadlines, summary)
                    .await?;
            }
            // Test results are journaled for the audit trail; the driving
            // signal is the agent completion/failure pair.
            EventPayload::TestPassed { .. }
            | EventPayload::TestFailed { .. }
            | EventPayload::AgentTaskStarted { .. } => {}
            other => {
                debug!(kind = ?other.kind(), "ignoring event kind");
            }
        }
        Ok(())
    }

    async fn handle_completion(
        &self,
        workflow_id: &str,
        handle: &WorkflowHandle,
        task_id: &str,
        output: TaskOutput,
        deadlines: &mut HashMap<String, Instant>,
    ) -> OrchestrationResult<()> {
        let mut state = handle.state.lock().await;
        let Some(task) = state.task(task_id) else {
            warn!(task_id = %task_id, "completion for unknown task");
            return Ok(());
        };
        if task.status != TaskStatus::Running {
            // Replayed or stale event: at-least-once delivery makes this
            // normal, and completion must be idempotent.
            debug!(task_id = %task_id, status = ?task.status, "ignoring stale completion");
            return Ok(());
        }

        let was_temporary = task.is_temporary;
        let parent_id = task.parent_id.clone();

        state.complete_task(task_id, output.artifact.as_deref())?;
        deadlines.remove(task_id);
        metrics().record_task_completed();

        // A parent whose re-test just passed releases its branch slot.
        if state.close_branch(task_id) {
            debug!(task_id = %task_id, "branch repaired parent, depth released");
        }

        state.unblock_dependents(task_id);

        // A completed branch sends its parent back through its acceptance
        // suite; the next dispatch phase picks it up.
        if was_temporary {
            if let Some(parent_id) = parent_id {
                if state.open_branch(&parent_id).is_some() {
                    info!(
                        workflow_id = %workflow_id,
                        parent = %parent_id,
                        branch = %task_id,
                        "branch complete, re-running parent acceptance"
                    );
                    state.reopen_task(&parent_id)?;
                }
            }
        }
        Ok(())
    }

    async fn handle_failure(
        &self,
        workflow_id: &str,
        handle: &WorkflowHandle,
        task_id: &str,
        failure: TaskFailure,
        deadlines: &mut HashMap<String, Instant>,
        summary: &mut PassSummary,
    ) -> OrchestrationResult<()> {
        let mut state = handle.state.lock().await;
        let Some(task) = state.task(task_id) else {
            warn!(task_id = %task_id, "failure for unknown task");
            return Ok(());
        };
        if task.status != TaskStatus::Running {
            debug!(task_id = %task_id, status = ?task.status, "ignoring stale failure");
            return Ok(());
        }

        let task = task.clone();
        deadlines.remove(task_id);
        metrics().record_task_failed();

        let diagnostics = format!(
            "{}\n{}",
            failure.message,
            failure.stderr_excerpt.as_deref().unwrap_or("")
        );
        let class = failure
            .class
            .unwrap_or_else(|| classify::classify_failure(failure.test_report.as_ref(), &diagnostics));

        // A failing branch retries until its debug-attempt budget runs out.
        if task.is_temporary {
            let attempts = state.dispatch_count(task_id);
            if attempts < task.max_debug_attempts {
                info!(
                    task_id = %task_id,
                    attempts,
                    max = task.max_debug_attempts,
                    "branch attempt failed, retrying"
                );
                state.reopen_task(task_id)?;
                return Ok(());
            }
            warn!(task_id = %task_id, "branch exceeded debug attempts");
            state.mark_failed(task_id)?;
            if let Some(parent_id) = task.parent_id.clone() {
                state.mark_failed(&parent_id)?;
                state.block_dependents(&parent_id);
            }
            self.publish_blocked(
                workflow_id,
                &mut state,
                format!("branch {task_id} exceeded its debug attempts"),
            )
            .await?;
            summary.failed_tasks.push(FailedTask {
                task_id: task.id.clone(),
                class,
                target_role: task.route_failure(class),
                artifact: artifact_for_branch(&state, &task),
                report: failure.test_report.clone(),
                message: failure.message.clone(),
            });
            return Ok(());
        }

        // Branch creation path.
        if state.auto_fix_mode && state.current_branch_depth < state.max_branch_depth {
            let target_role = task.route_failure(class);
            let artifact = artifact_for_branch(&state, &task);
            let Some(artifact) = artifact else {
                // Without an artifact identity there is nothing a fix task
                // could safely mutate.
                return self
                    .fail_without_branch(workflow_id, &mut state, &task, class, failure, summary)
                    .await;
            };

            let ordinal = state.next_branch_ordinal(task_id);
            let instructions = build_debug_instructions(&task, &failure, class);
            let branch = Task::branch(&task, ordinal, class, target_role, instructions, artifact);
            let branch_id = branch.id.clone();
            let depth_after = state.current_branch_depth + 1;
            state.append_branch(branch)?;
            summary.branches_created += 1;
            metrics().record_branch_created();

            info!(
                workflow_id = %workflow_id,
                parent = %task_id,
                branch = %branch_id,
                class = %class,
                role = %target_role,
                depth = depth_after,
                "created branch task"
            );

            let event = Event::new(
                SOURCE,
                workflow_id,
                Some(task_id.to_string()),
                EventPayload::WorkflowBranchCreated {
                    branch_task_id: branch_id,
                    parent_task_id: task_id.to_string(),
                    reason: class,
                    target_role,
                    depth: depth_after,
                },
            );
            state.record_event(event.clone());
            drop(state);
            self.bus
                .publish(channels::WORKFLOW_BRANCH_CREATED, event)
                .await?;
            return Ok(());
        }

        self.fail_without_branch(workflow_id, &mut state, &task, class, failure, summary)
            .await
    }

    /// Terminal failure path: no branch budget or no fix target.
    async fn fail_without_branch(
        &self,
        workflow_id: &str,
        state: &mut WorkflowState,
        task: &Task,
        class: FailureClass,
        failure: TaskFailure,
        summary: &mut PassSummary,
    ) -> OrchestrationResult<()> {
        state.mark_failed(&task.id)?;
        let blocked = state.block_dependents(&task.id);
        info!(
            workflow_id = %workflow_id,
            task_id = %task.id,
            class = %class,
            blocked = blocked.len(),
            "task failed without branch budget"
        );
        summary.failed_tasks.push(FailedTask {
            task_id: task.id.clone(),
            class,
            target_role: task.route_failure(class),
            artifact: artifact_for_branch(state, task),
            report: failure.test_report.clone(),
            message: failure.message.clone(),
        });
        self.publish_blocked(
            workflow_id,
            state,
            format!("task {} failed with {}", task.id, class),
        )
        .await
    }

    async fn publish_blocked(
        &self,
        workflow_id: &str,
        state: &mut WorkflowState,
        reason: String,
    ) -> OrchestrationResult<()> {
        let blocked_tasks: Vec<String> = state
            .tasks()
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Blocked | TaskStatus::Failed))
            .map(|t| t.id.clone())
            .collect();
        let event = Event::new(
            SOURCE,
            workflow_id,
            None,
            EventPayload::WorkflowBlocked {
                reason: sanitize_error_message(&reason),
                blocked_tasks,
            },
        );
        state.record_event(event.clone());
        self.bus.publish(channels::WORKFLOW_STATUS, event).await?;
        Ok(())
    }
}

/// The artifact identity a fix chain for `task` must mutate: the task's own
/// recorded identity first, then its produced artifact, then the nearest
/// dependency's identity (a tester usually exercises its upstream coder's
/// file).
fn artifact_for_branch(state: &WorkflowState, task: &Task) -> Option<ArtifactPath> {
    if let Some(artifact) = &task.metadata.original_artifact_path {
        return Some(artifact.carry());
    }
    if let Some(produced) = task.metadata.produced_artifacts.first() {
        return Some(ArtifactPath::original(produced.clone()));
    }
    for dep in &task.depends_on {
        if let Some(dep_task) = state.task(dep) {
            if let Some(artifact) = &dep_task.metadata.original_artifact_path {
                return Some(artifact.carry());
            }
        }
    }
    None
}

/// Diagnostic summary handed to the repairing agent.
fn build_debug_instructions(task: &Task, failure: &TaskFailure, class: FailureClass) -> String {
    let mut lines = vec![
        format!("Failure class: {class}"),
        format!("Failed task: {} ({})", task.id, task.title),
        format!("Reason: {}", sanitize_error_message(&failure.message)),
    ];
    if let Some(stderr) = &failure.stderr_excerpt {
        lines.push(format!("Stderr: {}", sanitize_error_message(stderr)));
    }
    if let Some(report) = &failure.test_report {
        for case in report.failing_cases() {
            let detail = case.message.as_deref().unwrap_or("no message");
            lines.push(format!(
                "Failing test {}: {}",
                case.name,
                sanitize_error_message(detail)
            ));
        }
        if let Some(analysis) = &report.timeout_analysis {
            if let Some(line) = &analysis.last_executed_line {
                lines.push(format!("Last executed line: {line}"));
            }
            if let Some(fix) = &analysis.candidate_fix {
                lines.push(format!("Candidate fix: {fix}"));
            }
        }
    }
    for command in &task.acceptance.test_commands {
        lines.push(format!("Acceptance command: {}", command.command));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tasks::TodoListMetadata;
    use chrono::Utc;

    fn tester_task() -> Task {
        let mut task = Task::new("t2", "run backtests", AgentRole::Tester);
        task.depends_on = vec!["t1".to_string()];
        task.failure_routing
            .insert(FailureClass::ImplementationBug, AgentRole::Coder);
        task
    }

    fn state_with_artifact() -> WorkflowState {
        let t1 = Task::new("t1", "implement strategy", AgentRole::Coder);
        let list = TodoList {
            workflow_id: "wf-1".to_string(),
            metadata: TodoListMetadata::default(),
            items: vec![t1, tester_task()],
            created_at: Utc::now(),
        };
        let mut state = WorkflowState::from_todo_list(list).unwrap();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        state
    }

    #[test]
    fn test_artifact_for_branch_walks_dependencies() {
        let state = state_with_artifact();
        let tester = state.task("t2").unwrap();

        let artifact = artifact_for_branch(&state, tester).unwrap();
        assert_eq!(artifact.as_str(), "artifacts/strategy.py");
        assert!(artifact.is_original());
    }

    #[test]
    fn test_artifact_for_branch_prefers_own_identity() {
        let mut state = state_with_artifact();
        state
            .task_mut("t2")
            .unwrap()
            .metadata
            .original_artifact_path = Some(ArtifactPath::original("artifacts/other.py"));

        let tester = state.task("t2").unwrap();
        let artifact = artifact_for_branch(&state, tester).unwrap();
        assert_eq!(artifact.as_str(), "artifacts/other.py");
    }

    #[test]
    fn test_debug_instructions_include_diagnostics_and_commands() {
        let mut task = tester_task();
        task.acceptance.test_commands.push(crate::workflow::TestCommand {
            command: "python -m pytest tests/".to_string(),
            timeout_secs: 60,
        });
        let failure = TaskFailure {
            message: "assertion failed in momentum signal".to_string(),
            class: Some(FailureClass::ImplementationBug),
            stderr_excerpt: Some("AssertionError: expected 1 got -1".to_string()),
            test_report: None,
        };

        let instructions =
            build_debug_instructions(&task, &failure, FailureClass::ImplementationBug);
        assert!(instructions.contains("implementation_bug"));
        assert!(instructions.contains("assertion failed in momentum signal"));
        assert!(instructions.contains("python -m pytest tests/"));
    }

    #[test]
    fn test_debug_instructions_redact_secrets() {
        let failure = TaskFailure {
            message: "request failed: api_key=supersecret123".to_string(),
            class: None,
            stderr_excerpt: None,
            test_report: None,
        };
        let instructions =
            build_debug_instructions(&tester_task(), &failure, FailureClass::Unknown);
        assert!(!instructions.contains("supersecret123"));
    }
}
