//! Task graph and workflow state for strategy-generation runs

pub mod state;
pub mod tasks;

pub use state::{TaskSnapshot, WorkflowError, WorkflowSnapshot, WorkflowState};
pub use tasks::{
    AcceptanceCriteria, AgentRole, ArtifactPath, FailureClass, MetricAssertion, MetricOp, Task,
    TaskMetadata, TaskStatus, TestCommand, TodoList, TodoListError, TodoListMetadata,
};
