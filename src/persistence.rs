//! Optional state mirroring
//!
//! Workflow snapshots and iteration reports can be mirrored to a store so an
//! operator can inspect a run after the fact. The in-memory implementation
//! is the default and carries no external dependency; tests run entirely
//! against it.

use crate::iterate::IterationReport;
use crate::workflow::WorkflowSnapshot;
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Mirror of workflow state and iteration reports.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_workflow(&self, snapshot: WorkflowSnapshot) -> Result<(), StoreError>;
    async fn load_workflow(&self, workflow_id: &str) -> Result<Option<WorkflowSnapshot>, StoreError>;
    async fn save_report(&self, report: IterationReport) -> Result<(), StoreError>;
    async fn load_report(&self, workflow_id: &str) -> Result<Option<IterationReport>, StoreError>;
}

/// Fully functional in-memory store.
#[derive(Default)]
pub struct InMemoryStateStore {
    workflows: RwLock<HashMap<String, WorkflowSnapshot>>,
    reports: RwLock<HashMap<String, IterationReport>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_workflow(&self, snapshot: WorkflowSnapshot) -> Result<(), StoreError> {
        self.workflows
            .write()
            .await
            .insert(snapshot.workflow_id.clone(), snapshot);
        Ok(())
    }

    async fn load_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowSnapshot>, StoreError> {
        Ok(self.workflows.read().await.get(workflow_id).cloned())
    }

    async fn save_report(&self, report: IterationReport) -> Result<(), StoreError> {
        self.reports
            .write()
            .await
            .insert(report.workflow_id.clone(), report);
        Ok(())
    }

    async fn load_report(&self, workflow_id: &str) -> Result<Option<IterationReport>, StoreError> {
        Ok(self.reports.read().await.get(workflow_id).cloned())
    }
}
