//! Iterative convergence loop
//!
//! Wraps the orchestrator: run a pass, collect what failed, mint fix tasks
//! that inherit the failing chain's artifact identity, reload, and run
//! again until everything passes or the iteration budget is spent. Each run
//! leaves behind a structured iteration report.

use crate::error::OrchestrationResult;
use crate::orchestrator::{FailedTask, Orchestrator, PassSummary};
use crate::persistence::StateStore;
use crate::workflow::{FailureClass, Task};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct IterativeLoopConfig {
    pub max_iterations: u32,
}

impl Default for IterativeLoopConfig {
    fn default() -> Self {
        Self { max_iterations: 5 }
    }
}

/// One orchestrator pass as recorded in the report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_number: u32,
    pub dispatched: usize,
    pub branches_created: usize,
    pub completed: bool,
    pub failures: Vec<FailureSummary>,
    pub injected_fix_tasks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSummary {
    pub task_id: String,
    pub class: FailureClass,
    pub message: String,
}

/// Terminal outcome of a convergence run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FinalStatus {
    Converged { passes: u32 },
    Exhausted { remaining_failures: Vec<String> },
}

/// Persisted artifact of one convergence run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationReport {
    pub workflow_id: String,
    pub passes: Vec<PassReport>,
    pub final_status: FinalStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Outer controller driving a workflow to convergence.
pub struct IterativeLoop {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn StateStore>,
    config: IterativeLoopConfig,
}

impl IterativeLoop {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn StateStore>,
        config: IterativeLoopConfig,
    ) -> Self {
        Self {
            orchestrator,
            store,
            config,
        }
    }

    /// Run passes until success or the iteration cap, then persist and
    /// return the report.
    pub async fn run_to_convergence(
        &self,
        workflow_id: &str,
    ) -> OrchestrationResult<IterationReport> {
        let started_at = Utc::now();
        let mut passes = Vec::new();
        let mut final_status = FinalStatus::Exhausted {
            remaining_failures: Vec::new(),
        };

        for pass_number in 1..=self.config.max_iterations {
            info!(workflow_id = %workflow_id, pass = pass_number, "starting workflow pass");
            let summary = self.orchestrator.run(workflow_id).await?;

            let mut pass_report = PassReport {
                pass_number,
                dispatched: summary.dispatched,
                branches_created: summary.branches_created,
                completed: summary.completed,
                failures: summary
                    .failed_tasks
                    .iter()
                    .map(|f| FailureSummary {
                        task_id: f.task_id.clone(),
                        class: f.class,
                        message: f.message.clone(),
                    })
                    .collect(),
                injected_fix_tasks: Vec::new(),
            };

            if summary.completed {
                info!(workflow_id = %workflow_id, pass = pass_number, "workflow converged");
                passes.push(pass_report);
                final_status = FinalStatus::Converged {
                    passes: pass_number,
                };
                break;
            }

            if pass_number == self.config.max_iterations {
                warn!(
                    workflow_id = %workflow_id,
                    pass = pass_number,
                    "iteration budget exhausted with failures remaining"
                );
                final_status = FinalStatus::Exhausted {
                    remaining_failures: summary
                        .failed_tasks
                        .iter()
                        .map(|f| f.task_id.clone())
                        .collect(),
                };
                passes.push(pass_report);
                break;
            }

            let fix_tasks = mint_fix_tasks(pass_number, &summary);
            pass_report.injected_fix_tasks = fix_tasks.iter().map(|t| t.id.clone()).collect();
            passes.push(pass_report);

            if fix_tasks.is_empty() {
                warn!(workflow_id = %workflow_id, "no fixable failures, stopping early");
                final_status = FinalStatus::Exhausted {
                    remaining_failures: summary
                        .failed_tasks
                        .iter()
                        .map(|f| f.task_id.clone())
                        .collect(),
                };
                break;
            }

            self.orchestrator
                .reload_workflow_tasks(workflow_id, fix_tasks)
                .await?;
        }

        let report = IterationReport {
            workflow_id: workflow_id.to_string(),
            passes,
            final_status,
            started_at,
            finished_at: Utc::now(),
        };
        self.store.save_report(report.clone()).await?;
        Ok(report)
    }
}

/// Build fix tasks for a failed pass. Each inherits the failing chain's
/// artifact identity and targets the role the failure routes to; its parent
/// is reopened with a dependency on the fix when the tasks merge in.
fn mint_fix_tasks(pass_number: u32, summary: &PassSummary) -> Vec<Task> {
    summary
        .failed_tasks
        .iter()
        .map(|failed| fix_task_for(pass_number, failed))
        .collect()
}

fn fix_task_for(pass_number: u32, failed: &FailedTask) -> Task {
    let mut fix = Task::new(
        format!("{}_fix_p{}", failed.task_id, pass_number),
        format!("fix {} ({})", failed.task_id, failed.class),
        failed.target_role,
    );
    fix.description = format!(
        "Repair the {} failure observed in task {} during pass {}",
        failed.class, failed.task_id, pass_number
    );
    fix.parent_id = Some(failed.task_id.clone());
    fix.branch_reason = Some(failed.class);
    fix.is_temporary = true;

    let mut instructions = failed.message.clone();
    if let Some(report) = &failed.report {
        for case in report.failing_cases() {
            instructions.push_str(&format!(
                "\n{}: {}",
                case.name,
                case.message.as_deref().unwrap_or("no diagnostic")
            ));
        }
    }
    fix.debug_instructions = Some(instructions);
    fix.metadata.original_artifact_path = failed.artifact.as_ref().map(|a| a.carry());
    fix
}
