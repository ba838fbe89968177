//! Workflow state: the task graph and its execution bookkeeping
//!
//! One `WorkflowState` exists per active workflow and is mutated only by the
//! orchestrator, under a per-workflow lock. The state enforces the structural
//! invariants directly: a task becomes ready only when every dependency is
//! completed, a parent with an open branch stays blocked, the branch depth
//! counter never exceeds its bound, and a completed task is never handed out
//! again.

use crate::protocol::Event;
use crate::workflow::tasks::{Task, TaskStatus, TodoList, TodoListError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by workflow state transitions.
#[derive(Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid status transition for task {task}: {from:?} -> {to:?}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("task {task} cannot run: dependency {dependency} is not completed")]
    DependencyNotCompleted { task: String, dependency: String },
    #[error("branch depth {current} already at maximum {max}")]
    BranchDepthExceeded { current: u32, max: u32 },
    #[error("branch {task} exceeded its {max} debug attempts")]
    DebugAttemptsExceeded { task: String, max: u32 },
    #[error(transparent)]
    TodoList(#[from] TodoListError),
}

/// Serializable view of one task inside a status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: String,
    pub status: TaskStatus,
    pub role: String,
    pub is_temporary: bool,
    pub original_artifact_path: Option<String>,
}

/// Serializable view of a whole workflow.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub tasks: Vec<TaskSnapshot>,
    pub current_branch_depth: u32,
    pub max_branch_depth: u32,
    pub auto_fix_mode: bool,
    pub journal_len: usize,
    pub created_at: DateTime<Utc>,
}

/// The task graph plus execution bookkeeping for one workflow.
#[derive(Debug)]
pub struct WorkflowState {
    pub workflow_id: String,
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    pub auto_fix_mode: bool,
    pub max_branch_depth: u32,
    pub max_debug_attempts: u32,
    pub current_branch_depth: u32,
    /// Branches ever created per parent, for stable `_branch_{n}` ids.
    branch_counts: HashMap<String, u32>,
    /// Parent id -> branch id for branches that have not yet repaired their parent.
    open_branches: HashMap<String, String>,
    dispatch_counts: HashMap<String, u32>,
    journal: Vec<Event>,
    created_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn from_todo_list(list: TodoList) -> Result<Self, WorkflowError> {
        list.validate()?;

        let mut index = HashMap::new();
        for (i, task) in list.items.iter().enumerate() {
            index.insert(task.id.clone(), i);
        }

        Ok(Self {
            workflow_id: list.workflow_id,
            tasks: list.items,
            index,
            auto_fix_mode: list.metadata.auto_fix_mode,
            max_branch_depth: list.metadata.max_branch_depth,
            max_debug_attempts: list.metadata.max_debug_attempts,
            current_branch_depth: 0,
            branch_counts: HashMap::new(),
            open_branches: HashMap::new(),
            dispatch_counts: HashMap::new(),
            journal: Vec::new(),
            created_at: Utc::now(),
        })
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        let i = *self.index.get(id)?;
        Some(&mut self.tasks[i])
    }

    fn require(&self, id: &str) -> Result<&Task, WorkflowError> {
        self.task(id)
            .ok_or_else(|| WorkflowError::UnknownTask(id.to_string()))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Pending tasks whose dependencies are all completed, highest priority
    /// first. Completed tasks are skipped by construction, which is what
    /// keeps repeated passes from re-dispatching finished work.
    pub fn ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on.iter().all(|dep| {
                    self.task(dep)
                        .map(|d| d.status == TaskStatus::Completed)
                        .unwrap_or(false)
                })
            })
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Transition a task to running, checking the dependency invariant.
    /// Returns the 1-based attempt number for this dispatch.
    pub fn mark_running(&mut self, id: &str) -> Result<u32, WorkflowError> {
        let task = self.require(id)?;
        if task.status != TaskStatus::Pending {
            return Err(WorkflowError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::Running,
            });
        }
        for dep in task.depends_on.clone() {
            let dep_task = self.require(&dep)?;
            if dep_task.status != TaskStatus::Completed {
                return Err(WorkflowError::DependencyNotCompleted {
                    task: id.to_string(),
                    dependency: dep,
                });
            }
        }

        let attempt = self.dispatch_counts.entry(id.to_string()).or_insert(0);
        *attempt += 1;
        let attempt = *attempt;

        if let Some(task) = self.task_mut(id) {
            task.status = TaskStatus::Running;
        }
        Ok(attempt)
    }

    pub fn dispatch_count(&self, id: &str) -> u32 {
        self.dispatch_counts.get(id).copied().unwrap_or(0)
    }

    /// Mark a running task completed and record any produced artifact.
    ///
    /// The first artifact an original task produces becomes the stable
    /// identity for its whole fix chain. Completing an already-completed task
    /// is a no-op so replayed completion events cannot corrupt state.
    pub fn complete_task(
        &mut self,
        id: &str,
        artifact: Option<&str>,
    ) -> Result<bool, WorkflowError> {
        let task = self.require(id)?;
        if task.status == TaskStatus::Completed {
            return Ok(false);
        }
        if task.status != TaskStatus::Running {
            return Err(WorkflowError::InvalidTransition {
                task: id.to_string(),
                from: task.status,
                to: TaskStatus::Completed,
            });
        }

        let task = self.task_mut(id).expect("task existence checked above");
        task.status = TaskStatus::Completed;
        if let Some(path) = artifact {
            task.metadata.produced_artifacts.push(path.to_string());
            if task.metadata.original_artifact_path.is_none() {
                task.metadata.original_artifact_path =
                    Some(crate::workflow::ArtifactPath::original(path));
            }
        }
        Ok(true)
    }

    pub fn mark_failed(&mut self, id: &str) -> Result<(), WorkflowError> {
        let task = self.require(id)?;
        if task.is_terminal() {
            return Ok(());
        }
        let task = self.task_mut(id).expect("checked above");
        task.status = TaskStatus::Failed;
        Ok(())
    }

    /// Put a blocked or failed task back into the pool for a re-run.
    pub fn reopen_task(&mut self, id: &str) -> Result<(), WorkflowError> {
        let task = self.require(id)?;
        match task.status {
            TaskStatus::Blocked | TaskStatus::Failed | TaskStatus::Running => {
                let task = self.task_mut(id).expect("checked above");
                task.status = TaskStatus::Pending;
                Ok(())
            }
            from => Err(WorkflowError::InvalidTransition {
                task: id.to_string(),
                from,
                to: TaskStatus::Pending,
            }),
        }
    }

    /// Transitively block every non-terminal task downstream of `failed_id`.
    pub fn block_dependents(&mut self, failed_id: &str) -> Vec<String> {
        let mut frontier = vec![failed_id.to_string()];
        let mut blocked = Vec::new();
        while let Some(current) = frontier.pop() {
            let dependents: Vec<String> = self
                .tasks
                .iter()
                .filter(|t| t.depends_on.iter().any(|d| d == &current))
                .filter(|t| t.status == TaskStatus::Pending)
                .map(|t| t.id.clone())
                .collect();
            for id in dependents {
                if let Some(task) = self.task_mut(&id) {
                    task.status = TaskStatus::Blocked;
                }
                blocked.push(id.clone());
                frontier.push(id);
            }
        }
        blocked
    }

    /// Release dependents that were blocked behind a now-completed task.
    pub fn unblock_dependents(&mut self, completed_id: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .filter(|t| t.depends_on.iter().any(|d| d == completed_id))
            .map(|t| t.id.clone())
            .collect();
        for id in &ids {
            if let Some(task) = self.task_mut(id) {
                task.status = TaskStatus::Pending;
            }
        }
        ids
    }

    /// Next `_branch_{n}` ordinal for a parent, stable across reloads.
    pub fn next_branch_ordinal(&self, parent_id: &str) -> u32 {
        self.branch_counts.get(parent_id).copied().unwrap_or(0) + 1
    }

    /// Append a branch task, block its parent, and take a depth slot.
    pub fn append_branch(&mut self, branch: Task) -> Result<(), WorkflowError> {
        if self.current_branch_depth >= self.max_branch_depth {
            return Err(WorkflowError::BranchDepthExceeded {
                current: self.current_branch_depth,
                max: self.max_branch_depth,
            });
        }
        let parent_id = branch
            .parent_id
            .clone()
            .ok_or_else(|| WorkflowError::UnknownTask("<no parent>".to_string()))?;
        self.require(&parent_id)?;

        *self.branch_counts.entry(parent_id.clone()).or_insert(0) += 1;
        self.open_branches.insert(parent_id.clone(), branch.id.clone());
        self.current_branch_depth += 1;

        if let Some(parent) = self.task_mut(&parent_id) {
            parent.status = TaskStatus::Blocked;
        }

        self.index.insert(branch.id.clone(), self.tasks.len());
        self.tasks.push(branch);
        Ok(())
    }

    /// Whether a parent currently has an unrepaired branch outstanding.
    pub fn open_branch(&self, parent_id: &str) -> Option<&str> {
        self.open_branches.get(parent_id).map(String::as_str)
    }

    /// Called when a parent's acceptance finally passes: the branch slot is
    /// given back. Returns true when there was an open branch to close.
    pub fn close_branch(&mut self, parent_id: &str) -> bool {
        if self.open_branches.remove(parent_id).is_some() {
            self.current_branch_depth = self.current_branch_depth.saturating_sub(1);
            true
        } else {
            false
        }
    }

    /// Idempotently merge appended tasks (used after the iterative loop mints
    /// fix tasks). Tasks whose id already exists are skipped. A merged fix
    /// task that names a failed or blocked parent reopens that parent with a
    /// dependency on the fix, so the next pass re-runs its acceptance suite
    /// only after the fix lands.
    pub fn merge_tasks(&mut self, new_tasks: Vec<Task>) -> usize {
        let mut merged = 0;
        for task in new_tasks {
            if self.index.contains_key(&task.id) {
                continue;
            }
            let parent_id = task.parent_id.clone();
            let task_id = task.id.clone();
            self.index.insert(task_id.clone(), self.tasks.len());
            self.tasks.push(task);
            merged += 1;

            if let Some(parent_id) = parent_id {
                let reopen = self
                    .task(&parent_id)
                    .map(|p| matches!(p.status, TaskStatus::Failed | TaskStatus::Blocked))
                    .unwrap_or(false);
                if reopen {
                    if let Some(parent) = self.task_mut(&parent_id) {
                        parent.status = TaskStatus::Pending;
                        if !parent.depends_on.contains(&task_id) {
                            parent.depends_on.push(task_id.clone());
                        }
                    }
                }
            }
        }
        merged
    }

    pub fn record_event(&mut self, event: Event) {
        self.journal.push(event);
    }

    pub fn journal(&self) -> &[Event] {
        &self.journal
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn all_completed(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn has_running(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Running)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|t| TaskSnapshot {
                    id: t.id.clone(),
                    status: t.status,
                    role: t.role.to_string(),
                    is_temporary: t.is_temporary,
                    original_artifact_path: t
                        .metadata
                        .original_artifact_path
                        .as_ref()
                        .map(|a| a.as_str().to_string()),
                })
                .collect(),
            current_branch_depth: self.current_branch_depth,
            max_branch_depth: self.max_branch_depth,
            auto_fix_mode: self.auto_fix_mode,
            journal_len: self.journal.len(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tasks::{AgentRole, ArtifactPath, FailureClass, TodoListMetadata};

    fn state_with_pair() -> WorkflowState {
        let t1 = Task::new("t1", "implement strategy", AgentRole::Coder);
        let mut t2 = Task::new("t2", "run backtests", AgentRole::Tester);
        t2.depends_on = vec!["t1".to_string()];
        let list = TodoList {
            workflow_id: "wf-1".to_string(),
            metadata: TodoListMetadata::default(),
            items: vec![t1, t2],
            created_at: Utc::now(),
        };
        WorkflowState::from_todo_list(list).unwrap()
    }

    #[test]
    fn test_ready_set_respects_dependencies() {
        let mut state = state_with_pair();
        assert_eq!(state.ready_tasks(), vec!["t1".to_string()]);

        state.mark_running("t1").unwrap();
        assert!(state.ready_tasks().is_empty());

        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        assert_eq!(state.ready_tasks(), vec!["t2".to_string()]);
    }

    #[test]
    fn test_running_requires_completed_dependencies() {
        let mut state = state_with_pair();
        let err = state.mark_running("t2").unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::DependencyNotCompleted { .. }
        ));
    }

    #[test]
    fn test_first_artifact_becomes_original() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();

        let artifact = state
            .task("t1")
            .unwrap()
            .metadata
            .original_artifact_path
            .clone()
            .unwrap();
        assert_eq!(artifact.as_str(), "artifacts/strategy.py");
        assert!(artifact.is_original());
    }

    #[test]
    fn test_replayed_completion_is_noop() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        assert!(state.complete_task("t1", Some("a.py")).unwrap());
        assert!(!state.complete_task("t1", Some("b.py")).unwrap());

        // The replay must not have touched the artifact record.
        let task = state.task("t1").unwrap();
        assert_eq!(task.metadata.produced_artifacts, vec!["a.py".to_string()]);
    }

    #[test]
    fn test_branch_blocks_parent_and_takes_depth_slot() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        state.mark_running("t2").unwrap();

        let parent = state.task("t2").unwrap().clone();
        let branch = Task::branch(
            &parent,
            state.next_branch_ordinal("t2"),
            FailureClass::ImplementationBug,
            AgentRole::Coder,
            "fix the momentum signal".to_string(),
            ArtifactPath::original("artifacts/strategy.py"),
        );
        state.append_branch(branch).unwrap();

        assert_eq!(state.current_branch_depth, 1);
        assert_eq!(state.task("t2").unwrap().status, TaskStatus::Blocked);
        assert_eq!(state.open_branch("t2"), Some("t2_branch_1"));
        assert_eq!(state.ready_tasks(), vec!["t2_branch_1".to_string()]);
    }

    #[test]
    fn test_branch_depth_cap_enforced() {
        let mut state = state_with_pair();
        state.max_branch_depth = 0;
        state.mark_running("t1").unwrap();
        state.complete_task("t1", None).unwrap();
        state.mark_running("t2").unwrap();

        let parent = state.task("t2").unwrap().clone();
        let branch = Task::branch(
            &parent,
            1,
            FailureClass::Unknown,
            AgentRole::Debugger,
            "diagnose".to_string(),
            ArtifactPath::original("artifacts/strategy.py"),
        );
        assert!(matches!(
            state.append_branch(branch),
            Err(WorkflowError::BranchDepthExceeded { current: 0, max: 0 })
        ));
    }

    #[test]
    fn test_close_branch_returns_depth_slot() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        state.mark_running("t2").unwrap();

        let parent = state.task("t2").unwrap().clone();
        let branch = Task::branch(
            &parent,
            1,
            FailureClass::LogicError,
            AgentRole::Coder,
            "fix".to_string(),
            ArtifactPath::original("artifacts/strategy.py"),
        );
        state.append_branch(branch).unwrap();
        assert_eq!(state.current_branch_depth, 1);

        assert!(state.close_branch("t2"));
        assert_eq!(state.current_branch_depth, 0);
        assert!(!state.close_branch("t2"));
    }

    #[test]
    fn test_branch_ordinals_are_stable() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        state.mark_running("t2").unwrap();

        assert_eq!(state.next_branch_ordinal("t2"), 1);
        let parent = state.task("t2").unwrap().clone();
        let branch = Task::branch(
            &parent,
            1,
            FailureClass::LogicError,
            AgentRole::Coder,
            "fix".to_string(),
            ArtifactPath::original("artifacts/strategy.py"),
        );
        state.append_branch(branch).unwrap();
        assert_eq!(state.next_branch_ordinal("t2"), 2);
    }

    #[test]
    fn test_merge_is_idempotent_and_reopens_parent() {
        let mut state = state_with_pair();
        state.mark_running("t1").unwrap();
        state.complete_task("t1", Some("artifacts/strategy.py")).unwrap();
        state.mark_running("t2").unwrap();
        state.mark_failed("t2").unwrap();

        let parent = state.task("t2").unwrap().clone();
        let fix = Task::branch(
            &parent,
            1,
            FailureClass::SyntaxError,
            AgentRole::Coder,
            "repair syntax".to_string(),
            ArtifactPath::original("artifacts/strategy.py"),
        );

        assert_eq!(state.merge_tasks(vec![fix.clone()]), 1);
        // Second merge of the same task is a no-op.
        assert_eq!(state.merge_tasks(vec![fix.clone()]), 0);

        let parent = state.task("t2").unwrap();
        assert_eq!(parent.status, TaskStatus::Pending);
        assert!(parent.depends_on.contains(&fix.id));
        // The dependency was not duplicated by the replay.
        assert_eq!(
            parent.depends_on.iter().filter(|d| **d == fix.id).count(),
            1
        );
    }

    #[test]
    fn test_block_and_unblock_dependents() {
        let mut state = state_with_pair();
        let blocked = state.block_dependents("t1");
        assert_eq!(blocked, vec!["t2".to_string()]);
        assert_eq!(state.task("t2").unwrap().status, TaskStatus::Blocked);

        let released = state.unblock_dependents("t1");
        assert_eq!(released, vec!["t2".to_string()]);
        assert_eq!(state.task("t2").unwrap().status, TaskStatus::Pending);
    }
}
