//! Debugger agent
//!
//! Two duties: turn a failing test report into a branch-task proposal
//! (classification, routing role, repair instructions) for the
//! orchestrator, and execute fix tasks routed to the `debugger` role by
//! rewriting the failing artifact in place.

use crate::agents::{extract_code_block, Agent};
use crate::keys::WorkloadClass;
use crate::orchestrator::classify::classify_failure;
use crate::protocol::{TaskAssignment, TaskFailure, TaskOutput, TestReport};
use crate::router::{ChatRequest, RequestRouter};
use crate::workflow::{AgentRole, FailureClass, Task};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const SYSTEM_PROMPT: &str = "You are a debugging specialist for algorithmic-trading code. \
Given a failing artifact and the diagnostics from its test run, return the \
complete corrected file as a single fenced code block. Change as little as \
possible beyond what the failure requires.";

/// What the orchestrator needs to construct a branch task.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchProposal {
    pub class: FailureClass,
    pub target_role: AgentRole,
    pub instructions: String,
}

pub struct DebuggerAgent {
    router: Arc<RequestRouter>,
}

impl DebuggerAgent {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }

    /// Classify a failing report and pick the agent that should repair it,
    /// honouring the failing task's routing table.
    pub fn propose_branch(parent: &Task, report: &TestReport) -> BranchProposal {
        let class = classify_failure(Some(report), "");
        let target_role = parent.route_failure(class);

        let mut lines = vec![format!(
            "Repair '{}' after a {} failure.",
            parent.title, class
        )];
        for case in report.failing_cases() {
            lines.push(format!(
                "- {}: {}",
                case.name,
                case.message.as_deref().unwrap_or("no diagnostic")
            ));
        }
        if let Some(analysis) = &report.timeout_analysis {
            if let Some(line) = &analysis.last_executed_line {
                lines.push(format!("- last executed line: {line}"));
            }
        }

        BranchProposal {
            class,
            target_role,
            instructions: lines.join("\n"),
        }
    }
}

#[async_trait]
impl Agent for DebuggerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Debugger
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        let Some(artifact) = &assignment.artifact else {
            return Err(TaskFailure {
                message: "debugger task has no artifact to repair".to_string(),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            });
        };
        let target = PathBuf::from(artifact.as_str());

        let current = tokio::fs::read_to_string(&target).await.map_err(|e| TaskFailure {
            message: format!("cannot read artifact {}: {e}", target.display()),
            class: Some(FailureClass::MissingDependency),
            stderr_excerpt: None,
            test_report: None,
        })?;

        let mut prompt = format!(
            "Failing file {}:\n```\n{}\n```\n",
            target.display(),
            current
        );
        if let Some(instructions) = &assignment.debug_instructions {
            prompt.push_str("\nDiagnostics:\n");
            prompt.push_str(instructions);
        }

        let reply = self
            .router
            .send_chat(
                ChatRequest::new(prompt)
                    .in_conversation(format!("debugger::{}", target.display()))
                    .with_workload(WorkloadClass::Heavy)
                    .with_system_prompt(SYSTEM_PROMPT),
            )
            .await
            .map_err(|e| TaskFailure {
                message: format!("debugger model call failed: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        let fixed = extract_code_block(&reply.content);
        if fixed.is_empty() {
            return Err(TaskFailure {
                message: "model reply contained no code".to_string(),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            });
        }

        // The whole point: the repaired file replaces the original in place.
        tokio::fs::write(&target, fixed.as_bytes())
            .await
            .map_err(|e| TaskFailure {
                message: format!("could not rewrite artifact: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        info!(
            task_id = %assignment.task_id,
            path = %target.display(),
            "artifact repaired in place"
        );

        Ok(TaskOutput {
            artifact: Some(target.to_string_lossy().into_owned()),
            summary: format!("repaired {}", target.display()),
            test_report: None,
        })
    }
}
