//! Coder agent
//!
//! Turns a task description (plus optional contract and debug instructions)
//! into a source artifact. When the assignment carries an artifact identity
//! the coder overwrites exactly that path; new files exist only for tasks
//! that have never produced one.

use crate::agents::{extract_code_block, Agent};
use crate::keys::WorkloadClass;
use crate::protocol::{TaskAssignment, TaskFailure, TaskOutput};
use crate::router::{ChatRequest, RequestRouter};
use crate::workflow::AgentRole;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str = "You are a senior quantitative developer. Produce a single, \
complete, runnable source file implementing the requested trading-strategy \
component. Reply with exactly one fenced code block.";

pub struct CoderAgent {
    router: Arc<RequestRouter>,
    workspace: PathBuf,
}

impl CoderAgent {
    pub fn new(router: Arc<RequestRouter>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            router,
            workspace: workspace.into(),
        }
    }

    fn build_prompt(&self, assignment: &TaskAssignment, existing: Option<&str>) -> String {
        let mut prompt = format!(
            "Task: {}\n\n{}\n",
            assignment.title, assignment.description
        );
        if let Some(instructions) = &assignment.debug_instructions {
            prompt.push_str("\nThis is a fix task. Diagnostics from the failing run:\n");
            prompt.push_str(instructions);
            prompt.push('\n');
        }
        if let Some(existing) = existing {
            prompt.push_str("\nCurrent content of the file you must rewrite in full:\n```\n");
            prompt.push_str(existing);
            prompt.push_str("\n```\n");
        }
        for expected in &assignment.acceptance.expected_artifacts {
            prompt.push_str(&format!("\nThe build must produce: {expected}"));
        }
        prompt
    }
}

#[async_trait]
impl Agent for CoderAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    async fn execute(&self, assignment: TaskAssignment) -> Result<TaskOutput, TaskFailure> {
        // The artifact identity decides the target: fix chains mutate one
        // path forever, fresh tasks mint one.
        let target = match &assignment.artifact {
            Some(artifact) => PathBuf::from(artifact.as_str()),
            None => self
                .workspace
                .join(format!("strategy_{}.py", assignment.task_id)),
        };

        let existing = match tokio::fs::read_to_string(&target).await {
            Ok(content) => Some(content),
            Err(_) => None,
        };

        let prompt = self.build_prompt(&assignment, existing.as_deref());
        // Fix chains share a conversation keyed on the artifact so later
        // attempts see what earlier ones tried.
        let conv_id = format!("coder::{}", target.display());
        let workload = if assignment.debug_instructions.is_some() {
            WorkloadClass::Heavy
        } else {
            WorkloadClass::Standard
        };

        let reply = self
            .router
            .send_chat(
                ChatRequest::new(prompt)
                    .in_conversation(conv_id)
                    .with_workload(workload)
                    .with_system_prompt(SYSTEM_PROMPT),
            )
            .await
            .map_err(|e| TaskFailure {
                message: format!("coder model call failed: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        let source = extract_code_block(&reply.content);
        if source.is_empty() {
            return Err(TaskFailure {
                message: "model reply contained no code".to_string(),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| TaskFailure {
                message: format!("could not create artifact directory: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;
        }
        tokio::fs::write(&target, source.as_bytes())
            .await
            .map_err(|e| TaskFailure {
                message: format!("could not write artifact: {e}"),
                class: None,
                stderr_excerpt: None,
                test_report: None,
            })?;

        let overwrote = assignment.artifact.is_some();
        debug!(task_id = %assignment.task_id, path = %target.display(), overwrote, "artifact written");
        info!(
            task_id = %assignment.task_id,
            model = %reply.model,
            bytes = source.len(),
            "coder produced artifact"
        );

        Ok(TaskOutput {
            artifact: Some(target.to_string_lossy().into_owned()),
            summary: format!("wrote {}", target.display()),
            test_report: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{AcceptanceCriteria, ArtifactPath};

    fn assignment(artifact: Option<ArtifactPath>, instructions: Option<String>) -> TaskAssignment {
        TaskAssignment {
            task_id: "t1".to_string(),
            role: AgentRole::Coder,
            title: "implement momentum strategy".to_string(),
            description: "20-day lookback, daily bars".to_string(),
            acceptance: AcceptanceCriteria::default(),
            fixtures: vec![],
            artifact,
            debug_instructions: instructions,
            attempt: 1,
            timeout_secs: 300,
        }
    }

    #[test]
    fn test_prompt_carries_debug_instructions_and_existing_code() {
        let coder = CoderAgent::new(test_router(), "artifacts");
        let prompt = coder.build_prompt(
            &assignment(
                Some(ArtifactPath::original("artifacts/strategy.py")),
                Some("AssertionError in test_signal".to_string()),
            ),
            Some("def signal():\n    return 0"),
        );

        assert!(prompt.contains("fix task"));
        assert!(prompt.contains("AssertionError in test_signal"));
        assert!(prompt.contains("def signal():"));
    }

    #[test]
    fn test_prompt_for_fresh_task_has_no_fix_framing() {
        let coder = CoderAgent::new(test_router(), "artifacts");
        let prompt = coder.build_prompt(&assignment(None, None), None);
        assert!(!prompt.contains("fix task"));
        assert!(prompt.contains("momentum"));
    }

    fn test_router() -> Arc<RequestRouter> {
        use crate::keys::{KeyManager, KeyManagerConfig, KeyRecord};
        use crate::llm::HeuristicEstimator;
        use crate::router::RouterConfig;
        use crate::testing::mocks::MockProvider;

        let keys = Arc::new(
            KeyManager::new(
                vec![KeyRecord {
                    key_id: "k1".to_string(),
                    credential: "c".to_string(),
                    model_name: "gemini-2.0-flash".to_string(),
                    priority_tags: vec!["flash".to_string()],
                    rpm_budget: 10,
                    tpm_budget: 100_000,
                    active: true,
                }],
                KeyManagerConfig::default(),
            )
            .unwrap(),
        );
        Arc::new(RequestRouter::new(
            keys,
            Arc::new(MockProvider::always_succeeding("ok")),
            Box::new(HeuristicEstimator),
            RouterConfig::default(),
        ))
    }
}
