//! Task model for strategy-generation workflows
//!
//! Tasks form a directed acyclic graph at creation time. Branch tasks extend
//! the graph after a test failure but stay leaves until their parent is
//! retried, so no cycle can be introduced after load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Roles an agent can take inside a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Architect,
    Coder,
    Tester,
    Debugger,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Architect => "architect",
            AgentRole::Coder => "coder",
            AgentRole::Tester => "tester",
            AgentRole::Debugger => "debugger",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

/// Failure taxonomy used for branch routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    ImplementationBug,
    SpecMismatch,
    Timeout,
    MissingDependency,
    FlakyTest,
    SyntaxError,
    ImportError,
    LogicError,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::ImplementationBug => "implementation_bug",
            FailureClass::SpecMismatch => "spec_mismatch",
            FailureClass::Timeout => "timeout",
            FailureClass::MissingDependency => "missing_dependency",
            FailureClass::FlakyTest => "flaky_test",
            FailureClass::SyntaxError => "syntax_error",
            FailureClass::ImportError => "import_error",
            FailureClass::LogicError => "logic_error",
            FailureClass::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact identity carried through a chain of fix tasks.
///
/// The first task that produces a file records it as `original`. Every
/// descendant fix task inherits the same value and overwrites the same path,
/// so a chain of fixes never fans out into `fix_of_fix_of_...` files. Branch
/// constructors demand this type, which makes the invariant hard to lose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPath {
    path: String,
    original: bool,
}

impl ArtifactPath {
    /// Record a freshly produced artifact as the original for its chain.
    pub fn original(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            original: true,
        }
    }

    /// The file path every descendant task must write to.
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn is_original(&self) -> bool {
        self.original
    }

    /// The value handed to a descendant fix task: same path, still original.
    pub fn carry(&self) -> ArtifactPath {
        ArtifactPath {
            path: self.path.clone(),
            original: true,
        }
    }
}

impl std::fmt::Display for ArtifactPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}

/// One shell command in an acceptance suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCommand {
    pub command: String,
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,
}

fn default_test_timeout() -> u64 {
    60
}

/// Comparison operator for a metric assertion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricOp {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
}

impl MetricOp {
    pub fn holds(&self, observed: f64, expected: f64) -> bool {
        match self {
            MetricOp::Gte => observed >= expected,
            MetricOp::Lte => observed <= expected,
            MetricOp::Gt => observed > expected,
            MetricOp::Lt => observed < expected,
            MetricOp::Eq => (observed - expected).abs() < f64::EPSILON,
        }
    }
}

/// Assertion over a metric printed by the acceptance run, e.g. `sharpe >= 1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAssertion {
    pub metric: String,
    pub op: MetricOp,
    pub value: f64,
}

/// What it takes for a task to count as done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceCriteria {
    #[serde(default)]
    pub test_commands: Vec<TestCommand>,
    #[serde(default)]
    pub expected_artifacts: Vec<String>,
    #[serde(default)]
    pub metric_assertions: Vec<MetricAssertion>,
}

impl AcceptanceCriteria {
    pub fn is_empty(&self) -> bool {
        self.test_commands.is_empty()
            && self.expected_artifacts.is_empty()
            && self.metric_assertions.is_empty()
    }
}

/// Mutable per-task bookkeeping kept outside the task definition fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Stable artifact identity for the fix chain rooted at this task.
    pub original_artifact_path: Option<ArtifactPath>,
    /// Every artifact path this task reported producing.
    #[serde(default)]
    pub produced_artifacts: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub role: AgentRole,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub acceptance: AcceptanceCriteria,
    /// Fixture references resolved to files on disk before tests run.
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub failure_routing: HashMap<FailureClass, AgentRole>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_task_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub metadata: TaskMetadata,

    // Branch-task fields; unset on original tasks.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub branch_reason: Option<FailureClass>,
    #[serde(default)]
    pub debug_instructions: Option<String>,
    #[serde(default)]
    pub is_temporary: bool,
    #[serde(default = "default_max_debug_attempts")]
    pub max_debug_attempts: u32,
}

fn default_max_retries() -> u32 {
    1
}

fn default_task_timeout() -> u64 {
    300
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

fn default_max_debug_attempts() -> u32 {
    3
}

impl Task {
    /// Create a plain (non-branch) task with defaults for the optional fields.
    pub fn new(id: impl Into<String>, title: impl Into<String>, role: AgentRole) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            role,
            depends_on: Vec::new(),
            priority: 0,
            acceptance: AcceptanceCriteria::default(),
            fixtures: Vec::new(),
            failure_routing: HashMap::new(),
            max_retries: default_max_retries(),
            timeout_secs: default_task_timeout(),
            status: TaskStatus::Pending,
            metadata: TaskMetadata::default(),
            parent_id: None,
            branch_reason: None,
            debug_instructions: None,
            is_temporary: false,
            max_debug_attempts: default_max_debug_attempts(),
        }
    }

    /// Construct a branch task repairing `parent` after a classified failure.
    ///
    /// The artifact identity is a required argument: callers must decide what
    /// the chain's original path is before a branch can exist.
    pub fn branch(
        parent: &Task,
        ordinal: u32,
        reason: FailureClass,
        target_role: AgentRole,
        debug_instructions: String,
        artifact: ArtifactPath,
    ) -> Self {
        let mut metadata = TaskMetadata::default();
        metadata.original_artifact_path = Some(artifact.carry());

        Self {
            id: format!("{}_branch_{}", parent.id, ordinal),
            title: format!("fix: {}", parent.title),
            description: format!(
                "Repair the failure ({}) observed while running '{}'",
                reason, parent.title
            ),
            role: target_role,
            depends_on: Vec::new(),
            priority: parent.priority,
            acceptance: AcceptanceCriteria::default(),
            fixtures: parent.fixtures.clone(),
            failure_routing: parent.failure_routing.clone(),
            max_retries: 1,
            timeout_secs: parent.timeout_secs,
            status: TaskStatus::Pending,
            metadata,
            parent_id: Some(parent.id.clone()),
            branch_reason: Some(reason),
            debug_instructions: Some(debug_instructions),
            is_temporary: true,
            max_debug_attempts: parent.max_debug_attempts,
        }
    }

    /// Route a failure class to the agent that should repair it.
    pub fn route_failure(&self, class: FailureClass) -> AgentRole {
        self.failure_routing
            .get(&class)
            .copied()
            .unwrap_or(AgentRole::Debugger)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Workflow-level knobs carried by a TodoList document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoListMetadata {
    #[serde(default = "default_auto_fix")]
    pub auto_fix_mode: bool,
    #[serde(default = "default_max_branch_depth")]
    pub max_branch_depth: u32,
    #[serde(default = "default_max_debug_attempts")]
    pub max_debug_attempts: u32,
}

fn default_auto_fix() -> bool {
    true
}

fn default_max_branch_depth() -> u32 {
    2
}

impl Default for TodoListMetadata {
    fn default() -> Self {
        Self {
            auto_fix_mode: default_auto_fix(),
            max_branch_depth: default_max_branch_depth(),
            max_debug_attempts: default_max_debug_attempts(),
        }
    }
}

/// Planner output: an ordered set of tasks for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoList {
    pub workflow_id: String,
    #[serde(default)]
    pub metadata: TodoListMetadata,
    pub items: Vec<Task>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TodoList {
    pub fn from_json(raw: &str) -> Result<Self, TodoListError> {
        let list: TodoList = serde_json::from_str(raw)?;
        list.validate()?;
        Ok(list)
    }

    /// Structural validation: unique ids, known dependencies, no cycles.
    pub fn validate(&self) -> Result<(), TodoListError> {
        if self.workflow_id.is_empty() {
            return Err(TodoListError::MissingWorkflowId);
        }

        let mut seen = std::collections::HashSet::new();
        for task in &self.items {
            if !seen.insert(task.id.as_str()) {
                return Err(TodoListError::DuplicateTaskId(task.id.clone()));
            }
        }
        for task in &self.items {
            for dep in &task.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(TodoListError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), TodoListError> {
        let index: HashMap<&str, &Task> =
            self.items.iter().map(|t| (t.id.as_str(), t)).collect();

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();

        fn visit<'a>(
            id: &'a str,
            index: &HashMap<&'a str, &'a Task>,
            state: &mut HashMap<&'a str, u8>,
        ) -> Result<(), TodoListError> {
            match state.get(id) {
                Some(1) => return Err(TodoListError::DependencyCycle(id.to_string())),
                Some(2) => return Ok(()),
                _ => {}
            }
            state.insert(id, 1);
            if let Some(task) = index.get(id) {
                for dep in &task.depends_on {
                    visit(dep, index, state)?;
                }
            }
            state.insert(id, 2);
            Ok(())
        }

        for task in &self.items {
            visit(task.id.as_str(), &index, &mut state)?;
        }
        Ok(())
    }
}

/// Errors raised while parsing or validating a TodoList document.
#[derive(Debug, Error)]
pub enum TodoListError {
    #[error("todo list is missing a workflow id")]
    MissingWorkflowId,
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("dependency cycle involving task {0}")]
    DependencyCycle(String),
    #[error("failed to parse todo list: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PartialEq for TodoListError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::MissingWorkflowId, Self::MissingWorkflowId) => true,
            (Self::DuplicateTaskId(a), Self::DuplicateTaskId(b)) => a == b,
            (
                Self::UnknownDependency { task: t1, dependency: d1 },
                Self::UnknownDependency { task: t2, dependency: d2 },
            ) => t1 == t2 && d1 == d2,
            (Self::DependencyCycle(a), Self::DependencyCycle(b)) => a == b,
            (Self::Parse(a), Self::Parse(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_task_list() -> TodoList {
        let t1 = Task::new("t1", "implement strategy", AgentRole::Coder);
        let mut t2 = Task::new("t2", "run backtest suite", AgentRole::Tester);
        t2.depends_on = vec!["t1".to_string()];

        TodoList {
            workflow_id: "wf-1".to_string(),
            metadata: TodoListMetadata::default(),
            items: vec![t1, t2],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_todo_list_roundtrip() {
        let list = two_task_list();
        let json = serde_json::to_string(&list).unwrap();
        let parsed = TodoList::from_json(&json).unwrap();

        assert_eq!(parsed.workflow_id, "wf-1");
        assert_eq!(parsed.items.len(), 2);
        assert_eq!(parsed.items[1].depends_on, vec!["t1".to_string()]);
        assert!(parsed.metadata.auto_fix_mode);
        assert_eq!(parsed.metadata.max_branch_depth, 2);
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let mut list = two_task_list();
        list.items[1].id = "t1".to_string();

        assert!(matches!(
            list.validate(),
            Err(TodoListError::DuplicateTaskId(_))
        ));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let mut list = two_task_list();
        list.items[1].depends_on = vec!["ghost".to_string()];

        assert!(matches!(
            list.validate(),
            Err(TodoListError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut list = two_task_list();
        list.items[0].depends_on = vec!["t2".to_string()];

        assert!(matches!(
            list.validate(),
            Err(TodoListError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_branch_task_shape() {
        let mut parent = Task::new("t2", "run backtest suite", AgentRole::Tester);
        parent
            .failure_routing
            .insert(FailureClass::ImplementationBug, AgentRole::Coder);

        let artifact = ArtifactPath::original("artifacts/strategy_t1.py");
        let branch = Task::branch(
            &parent,
            1,
            FailureClass::ImplementationBug,
            parent.route_failure(FailureClass::ImplementationBug),
            "assertion failed in test_momentum_signal".to_string(),
            artifact.clone(),
        );

        assert_eq!(branch.id, "t2_branch_1");
        assert_eq!(branch.parent_id.as_deref(), Some("t2"));
        assert_eq!(branch.role, AgentRole::Coder);
        assert!(branch.is_temporary);
        assert_eq!(branch.max_debug_attempts, 3);
        assert_eq!(
            branch.metadata.original_artifact_path.as_ref().unwrap(),
            &artifact
        );
    }

    #[test]
    fn test_route_failure_falls_back_to_debugger() {
        let task = Task::new("t1", "implement", AgentRole::Coder);
        assert_eq!(
            task.route_failure(FailureClass::SyntaxError),
            AgentRole::Debugger
        );
    }

    #[test]
    fn test_artifact_path_carry_preserves_identity() {
        let original = ArtifactPath::original("artifacts/strategy.py");
        let carried = original.carry();

        assert_eq!(carried.as_str(), original.as_str());
        assert!(carried.is_original());
    }

    #[test]
    fn test_failure_class_serializes_snake_case() {
        let json = serde_json::to_string(&FailureClass::ImplementationBug).unwrap();
        assert_eq!(json, "\"implementation_bug\"");

        let routing: HashMap<FailureClass, AgentRole> =
            serde_json::from_str(r#"{"syntax_error": "coder"}"#).unwrap();
        assert_eq!(routing[&FailureClass::SyntaxError], AgentRole::Coder);
    }
}
