//! Health check HTTP server for container orchestration
//!
//! Exposes the broker reachability flag that the supervisor and coordinator
//! maintain, so probes see exactly what the event loop uses to pause.

use crate::health::HealthSink;
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service_name: String,
    port: u16,
    broker: Arc<dyn HealthSink>,
}

impl HealthServer {
    /// Create new health server reporting on `broker`
    pub fn new(service_name: impl Into<String>, port: u16, broker: Arc<dyn HealthSink>) -> Self {
        Self {
            service_name: service_name.into(),
            port,
            broker,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route table, split out so it can be exercised without binding a port
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - comprehensive health status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status();
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        // GET /ready - readiness follows broker reachability
        let ready_route = warp::path("ready").and(warp::get()).map(move || {
            let ready = ready_server.broker.status();
            let response = ReadinessResponse {
                ready,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

        // GET /live - the process is up
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
        Ok(())
    }

    fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("broker".to_string(), self.check_broker_health());

        let overall_healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            service: self.service_name.clone(),
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            checks,
        }
    }

    fn check_broker_health(&self) -> HealthCheck {
        let (status, message) = if self.broker.status() {
            ("healthy", "Broker connection established")
        } else {
            ("unhealthy", "Broker unreachable or consumers rebuilding")
        };

        HealthCheck {
            status: status.to_string(),
            message: Some(message.to_string()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
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
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::SharedHealth;

    fn server(reachable: bool) -> (Arc<HealthServer>, Arc<SharedHealth>) {
        let health = Arc::new(SharedHealth::with_status(reachable));
        let server = Arc::new(HealthServer::new("mqlink-test", 8080, health.clone()));
        (server, health)
    }

    #[tokio::test]
    async fn test_ready_follows_health_sink() {
        let (server, health) = server(false);
        let routes = server.routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        health.set_status(true);
        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["ready"], true);
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let (server, _) = server(false);
        let response = warp::test::request()
            .path("/live")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_broker_check() {
        let (server, _) = server(true);
        let response = warp::test::request()
            .path("/health")
            .reply(&server.clone().routes())
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["service"], "mqlink-test");
        assert_eq!(body["checks"]["broker"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_unreachable_broker_degrades_health() {
        let (server, health) = server(false);
        let response = warp::test::request()
            .path("/health")
            .reply(&server.clone().routes())
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(server.get_health_status().status, "degraded");

        health.set_status(true);
        assert_eq!(server.get_health_status().status, "healthy");
    }

    #[tokio::test]
    async fn test_metrics_route_serves_snapshot() {
        let (server, _) = server(true);
        let response = warp::test::request()
            .path("/metrics")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert!(body["connection"].is_object());
    }
}
