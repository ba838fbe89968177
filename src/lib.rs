//! algoforge - multi-agent strategy generation platform
//!
//! Takes a natural-language request for an algorithmic-trading strategy,
//! decomposes it into a dependency-ordered task list, and drives
//! specialised agents (architect, coder, tester, debugger) through those
//! tasks until the result passes its acceptance suite.
//!
//! # Overview
//!
//! Three subsystems carry the weight:
//! - The workflow engine: a task-graph executor with dependency scheduling,
//!   automatic failure branching, depth-limited retry, and an outer
//!   convergence loop. Fix tasks always mutate the same artifact path as
//!   the task they repair.
//! - The request router: a multi-key scheduler enforcing per-key RPM/TPM
//!   budgets, with cool-downs on capacity failures and a hard guarantee
//!   that safety-policy blocks never demote a key.
//! - The agent-bus contract: a typed event protocol over pub/sub with
//!   idempotent delivery and per-channel FIFO ordering.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use algoforge::bus::InMemoryBus;
//! use algoforge::orchestrator::Orchestrator;
//! use algoforge::persistence::InMemoryStateStore;
//! use algoforge::workflow::TodoList;
//! use std::sync::Arc;
//!
//! # async fn run(todo: TodoList) -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(InMemoryBus::new());
//! let store = Arc::new(InMemoryStateStore::new());
//! let orchestrator = Orchestrator::new(bus, store).await?;
//!
//! let workflow_id = orchestrator.load_workflow(todo).await?;
//! let summary = orchestrator.run(&workflow_id).await?;
//! println!("completed: {}", summary.completed);
//! # Ok(())
//! # }
//! ```

pub mod agents;
pub mod bus;
pub mod config;
pub mod error;
pub mod iterate;
pub mod keys;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod router;
pub mod secrets;
pub mod testing;
pub mod workflow;

pub use config::PlatformConfig;
pub use error::{OrchestrationError, OrchestrationResult};
pub use iterate::{IterationReport, IterativeLoop};
pub use orchestrator::Orchestrator;
pub use router::RequestRouter;
