//! Channel naming rules for the message bus
//!
//! Channels are dot-separated names. Canonicalization keeps subscribers and
//! publishers agreeing on a single spelling regardless of how the name was
//! assembled: separators collapse, surrounding separators drop, case folds
//! to lowercase.

use crate::workflow::AgentRole;
use thiserror::Error;

pub const PLANNER_OUTPUT: &str = "planner.output";
pub const ORCHESTRATOR_TASKS: &str = "orchestrator.tasks";
pub const AGENT_RESULTS: &str = "agent.results";
pub const TEST_RESULTS: &str = "test.results";
pub const WORKFLOW_BRANCH_CREATED: &str = "workflow.branch.created";
pub const WORKFLOW_STATUS: &str = "workflow.status";
pub const SYSTEM_CONTROL: &str = "system.control";
pub const SYSTEM_ERRORS: &str = "system.errors";

/// Dispatch channel for one agent role, e.g. `orchestrator.tasks.coder`.
pub fn task_channel(role: AgentRole) -> String {
    format!("{}.{}", ORCHESTRATOR_TASKS, role.as_str())
}

pub fn canonicalize_channel(channel: &str) -> String {
    let mut result: String = channel.to_ascii_lowercase();

    // Collapse consecutive separators.
    while result.contains("..") {
        result = result.replace("..", ".");
    }

    // Strip leading and trailing separators.
    let result = result.trim_matches('.');

    result.to_string()
}

pub fn validate_channel(channel: &str) -> Result<(), ChannelError> {
    if channel.is_empty() {
        return Err(ChannelError::Empty);
    }
    for ch in channel.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ChannelError::InvalidChar(ch));
        }
    }
    Ok(())
}

/// Channel naming errors.
#[derive(Debug, Error, PartialEq)]
pub enum ChannelError {
    #[error("channel name cannot be empty")]
    Empty,
    #[error("channel name contains invalid character: '{0}'")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn canonicalize_channel_is_idempotent(channel in ".*") {
            let first = canonicalize_channel(&channel);
            let second = canonicalize_channel(&first);
            prop_assert_eq!(first, second, "canonicalize_channel should be idempotent");
        }

        #[test]
        fn canonicalize_channel_has_no_consecutive_separators(channel in ".*") {
            let result = canonicalize_channel(&channel);
            prop_assert!(!result.contains(".."), "no consecutive dots allowed: {}", result);
        }

        #[test]
        fn canonicalize_channel_has_no_surrounding_separators(channel in ".*") {
            let result = canonicalize_channel(&channel);
            prop_assert!(!result.starts_with('.'), "no leading dot: {}", result);
            prop_assert!(!result.ends_with('.'), "no trailing dot: {}", result);
        }

        #[test]
        fn valid_channel_names_pass(channel in "[a-z0-9_-]{1,16}(\\.[a-z0-9_-]{1,16}){0,4}") {
            prop_assert!(validate_channel(&channel).is_ok(), "should accept: {}", channel);
        }
    }

    #[test]
    fn test_canonicalization_examples() {
        assert_eq!(canonicalize_channel("Planner.Output"), "planner.output");
        assert_eq!(canonicalize_channel(".agent..results."), "agent.results");
        assert_eq!(canonicalize_channel("test.results"), "test.results");
        assert_eq!(canonicalize_channel("..."), "");
    }

    #[test]
    fn test_well_known_channels_are_canonical() {
        for channel in [
            PLANNER_OUTPUT,
            ORCHESTRATOR_TASKS,
            AGENT_RESULTS,
            TEST_RESULTS,
            WORKFLOW_BRANCH_CREATED,
            WORKFLOW_STATUS,
            SYSTEM_CONTROL,
            SYSTEM_ERRORS,
        ] {
            assert_eq!(canonicalize_channel(channel), channel);
            assert!(validate_channel(channel).is_ok());
        }
    }

    #[test]
    fn test_task_channel_per_role() {
        assert_eq!(task_channel(AgentRole::Coder), "orchestrator.tasks.coder");
        assert_eq!(
            task_channel(AgentRole::Debugger),
            "orchestrator.tasks.debugger"
        );
    }

    #[test]
    fn test_invalid_channel_names() {
        assert_eq!(validate_channel(""), Err(ChannelError::Empty));
        assert_eq!(
            validate_channel("agent/results"),
            Err(ChannelError::InvalidChar('/'))
        );
        assert_eq!(
            validate_channel("agent results"),
            Err(ChannelError::InvalidChar(' '))
        );
    }
}
