//! Observability: logging, metrics, and the health endpoint

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthServer, PlatformHealth};
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsSnapshot};
