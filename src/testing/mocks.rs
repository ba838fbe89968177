//! Mock implementations for testing
//!
//! Provides a scripted `ProviderAdapter`, closure- and script-driven agents,
//! and TodoList builders so router and orchestrator behaviour can be tested
//! end-to-end over the in-memory bus.

use crate::agents::Agent;
use crate::llm::{
    Completion, InvokeRequest, ProviderAdapter, ProviderError, TokenUsage,
};
use crate::protocol::{
    TaskAssignment, TaskFailure, TaskOutput, TestCaseRecord, TestCaseStatus, TestReport,
};
use crate::workflow::{
    AcceptanceCriteria, AgentRole, FailureClass, Task, TodoList, TodoListMetadata,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Scripted provider: pops one outcome per call, falling back to a default
/// response once the script is exhausted. Every invocation is captured.
pub struct MockProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    default_response: String,
    pub invocations: Arc<Mutex<Vec<InvokeRequest>>>,
}

impl MockProvider {
    pub fn always_succeeding(content: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_response: content.into(),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_script(script: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_response: "ok".to_string(),
            invocations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// First call hits a policy block, the retry succeeds (scenario S4).
    pub fn safety_block_then_success(content: impl Into<String>) -> Self {
        Self::with_script(vec![
            Err(ProviderError::SafetyBlock {
                reason: "HARM_CATEGORY_DANGEROUS_CONTENT".to_string(),
            }),
            Ok(content.into()),
        ])
    }

    /// First call is rate limited, the retry succeeds (scenario S5).
    pub fn rate_limited_then_success(content: impl Into<String>) -> Self {
        Self::with_script(vec![
            Err(ProviderError::RateLimited("HTTP 429".to_string())),
            Ok(content.into()),
        ])
    }

    pub async fn invocation_count(&self) -> usize {
        self.invocations.lock().await.len()
    }

    pub async fn credentials_used(&self) -> Vec<String> {
        self.invocations
            .lock()
            .await
            .iter()
            .map(|i| i.credential.clone())
            .collect()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<Completion, ProviderError> {
        self.invocations.lock().await.push(request.clone());

        let outcome = self
            .script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(self.default_response.clone()));

        outcome.map(|content| {
            let completion_tokens = (content.len() as u64).div_ceil(4);
            Completion {
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens,
                    total_tokens: 10 + completion_tokens,
                },
                model: request.model,
                content,
            }
        })
    }
}

/// Agent driven by a plain closure.
pub struct FnAgent {
    role: AgentRole,
    handler: Box<dyn Fn(TaskAssignment) -> Result<TaskOutput, TaskFailure> + Send + Sync>,
}

impl FnAgent {
    pub fn new(
        role: AgentRole,
        handler: impl Fn(TaskAssignment) -> Result<TaskOutput, TaskFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            role,
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        (self.handler)(assignment)
    }
}

/// Agent that pops scripted outcomes, then keeps returning the last default.
pub struct ScriptedAgent {
    role: AgentRole,
    script: Mutex<VecDeque<Result<TaskOutput, TaskFailure>>>,
    default: Result<TaskOutput, TaskFailure>,
    pub assignments: Arc<Mutex<Vec<TaskAssignment>>>,
}

impl ScriptedAgent {
    pub fn new(
        role: AgentRole,
        script: Vec<Result<TaskOutput, TaskFailure>>,
        default: Result<TaskOutput, TaskFailure>,
    ) -> Self {
        Self {
            role,
            script: Mutex::new(script.into()),
            default,
            assignments: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn assignment_count(&self) -> usize {
        self.assignments.lock().await.len()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        self.assignments.lock().await.push(assignment);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// A mock coder output: honours the artifact invariant the way the real
/// coder does, overwriting the assigned path or minting a fresh one.
pub fn coder_output(assignment: &TaskAssignment) -> TaskOutput {
    let path = assignment
        .artifact
        .as_ref()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| format!("artifacts/strategy_{}.py", assignment.task_id));
    TaskOutput {
        artifact: Some(path),
        summary: "mock artifact written".to_string(),
        test_report: None,
    }
}

pub fn passing_report() -> TestReport {
    TestReport {
        passed: true,
        cases: vec![TestCaseRecord {
            name: "pytest tests/".to_string(),
            status: TestCaseStatus::Passed,
            duration_seconds: 0.1,
            message: None,
            stderr_excerpt: None,
        }],
        suggested_class: None,
        timeout_analysis: None,
    }
}

pub fn passing_test_output() -> TaskOutput {
    TaskOutput {
        artifact: None,
        summary: "all checks passed".to_string(),
        test_report: Some(passing_report()),
    }
}

pub fn failing_test_failure(class: FailureClass, message: &str) -> TaskFailure {
    TaskFailure {
        message: message.to_string(),
        class: Some(class),
        stderr_excerpt: Some(message.to_string()),
        test_report: Some(TestReport {
            passed: false,
            cases: vec![TestCaseRecord {
                name: "pytest tests/".to_string(),
                status: TestCaseStatus::Failed,
                duration_seconds: 0.2,
                message: Some(message.to_string()),
                stderr_excerpt: Some(message.to_string()),
            }],
            suggested_class: Some(class),
            timeout_analysis: None,
        }),
    }
}

/// The canonical coder+tester pair used by the end-to-end scenarios.
pub fn coder_tester_todo(
    workflow_id: &str,
    auto_fix_mode: bool,
    max_branch_depth: u32,
) -> TodoList {
    let t1 = Task::new("t1", "implement strategy", AgentRole::Coder);
    let mut t2 = Task::new("t2", "run backtest suite", AgentRole::Tester);
    t2.depends_on = vec!["t1".to_string()];
    t2.acceptance = AcceptanceCriteria::default();
    t2.failure_routing
        .insert(FailureClass::ImplementationBug, AgentRole::Coder);
    t2.failure_routing
        .insert(FailureClass::SyntaxError, AgentRole::Coder);

    TodoList {
        workflow_id: workflow_id.to_string(),
        metadata: TodoListMetadata {
            auto_fix_mode,
            max_branch_depth,
            max_debug_attempts: 3,
        },
        items: vec![t1, t2],
        created_at: Utc::now(),
    }
}
