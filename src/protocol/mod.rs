//! Typed event protocol linking planner, orchestrator, and agents
//!
//! This module defines the canonical event envelope and the closed payload
//! set carried over the message bus.

pub mod events;

pub use events::{
    Event, EventKind, EventPayload, EventValidationError, TaskAssignment, TaskFailure, TaskOutput,
    TestCaseRecord, TestCaseStatus, TestReport, TimeoutAnalysis,
};
