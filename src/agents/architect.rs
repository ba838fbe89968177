//! Architect agent
//!
//! Turns a requirements description into a contract artifact: function
//! signatures, data models, example cases, a test skeleton, and the
//! fixtures the implementation will need.

use crate::agents::Agent;
use crate::keys::WorkloadClass;
use crate::protocol::{TaskAssignment, TaskFailure, TaskOutput};
use crate::router::{ChatRequest, RequestRouter};
use crate::workflow::AgentRole;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const SYSTEM_PROMPT: &str = "You are a software architect for algorithmic-trading systems. \
Given a requirements description, produce a contract document containing: \
function signatures, data models, example input/output cases, a test \
skeleton, and required fixtures. Be precise and implementation-ready.";

pub struct ArchitectAgent {
    router: Arc<RequestRouter>,
    workspace: PathBuf,
}

impl ArchitectAgent {
    pub fn new(router: Arc<RequestRouter>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            router,
            workspace: workspace.into(),
        }
    }
}

#[async_trait]
impl Agent for ArchitectAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Architect
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        let prompt = format!(
            "Requirements for '{}':\n\n{}",
            assignment.title, assignment.description
        );

        let reply = self
            .router
            .send_one_shot(
                ChatRequest::new(prompt)
                    .with_workload(WorkloadClass::Light)
                    .with_system_prompt(SYSTEM_PROMPT),
            )
            .await
            .map_err(|e| TaskFailure {
                message: format!("architect model call failed: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        let target = self
            .workspace
            .join(format!("{}_contract.md", assignment.task_id));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| TaskFailure {
                message: format!("could not create workspace: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;
        }
        tokio::fs::write(&target, reply.content.as_bytes())
            .await
            .map_err(|e| TaskFailure {
                message: format!("could not write contract: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        info!(
            task_id = %assignment.task_id,
            path = %target.display(),
            "contract artifact written"
        );

        Ok(TaskOutput {
            artifact: Some(target.to_string_lossy().into_owned()),
            summary: format!("contract for '{}'", assignment.title),
            test_report: None,
        })
    }
}
