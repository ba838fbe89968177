//! Health check HTTP server
//!
//! Exposes the router, key-manager, and bus connectivity snapshots for
//! operators and container orchestration platforms.

use crate::bus::MessageBus;
use crate::keys::KeyManager;
use crate::observability::metrics::metrics;
use crate::router::RequestRouter;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::Filter;

/// Overall platform health document served at `/health`.
#[derive(Debug, Serialize)]
pub struct PlatformHealth {
    pub status: String,
    pub bus_connected: bool,
    pub router: crate::router::RouterSnapshot,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// HTTP health check server.
pub struct HealthServer {
    port: u16,
    router: Arc<RequestRouter>,
    keys: Arc<KeyManager>,
    bus: Arc<dyn MessageBus>,
}

impl HealthServer {
    pub fn new(
        port: u16,
        router: Arc<RequestRouter>,
        keys: Arc<KeyManager>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            port,
            router,
            keys,
            bus,
        }
    }

    async fn platform_health(&self) -> PlatformHealth {
        let bus_connected = self.bus.is_connected();
        let router = self.router.health().await;
        let serviceable = self.keys.health().any_serviceable();
        let status = if bus_connected && serviceable {
            "healthy"
        } else {
            "degraded"
        };
        PlatformHealth {
            status: status.to_string(),
            bus_connected,
            router,
            timestamp: current_timestamp(),
        }
    }

    /// Start the HTTP health server; runs until the process exits.
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - full platform snapshot
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let health = server.platform_health().await;
                let status_code = if health.status == "healthy" { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&health),
                    warp::http::StatusCode::from_u16(status_code)
                        .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
                ))
            }
        });

        // GET /metrics - counter export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || async move {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - readiness probe
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.bus.is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready { 200 } else { 503 };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    warp::http::StatusCode::from_u16(status_code)
                        .unwrap_or(warp::http::StatusCode::INTERNAL_SERVER_ERROR),
                ))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).and_then(move || async move {
            Ok::<_, Infallible>(warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            }))
        });

        // GET / - endpoint index
        let root_route = warp::path::end().and(warp::get()).and_then(move || async move {
            let mut endpoints = HashMap::new();
            endpoints.insert("/health", "Router, key manager, and bus snapshot");
            endpoints.insert("/metrics", "Counter export");
            endpoints.insert("/ready", "Readiness probe");
            endpoints.insert("/live", "Liveness probe");
            Ok::<_, Infallible>(warp::reply::json(&endpoints))
        });

        let routes = health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route);

        tracing::info!(port = self.port, "health server listening");
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
        Ok(())
    }
}
