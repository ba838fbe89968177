//! Test support
//!
//! Mock provider and scripted agents for exercising the router and
//! orchestrator without external dependencies.

pub mod mocks;
