//! LLM provider abstraction and adapters
//!
//! Defines the uniform invoke interface the router drives, the token
//! estimation seam, and the concrete provider backends.

pub mod adapter;
pub mod estimator;
pub mod providers;

pub use adapter::{
    ChatTurn, Completion, InvokeRequest, ProviderAdapter, ProviderError, ProviderErrorKind,
    TokenUsage, TurnRole,
};
pub use estimator::{HeuristicEstimator, TokenEstimator};
