//! Mesh integration test harness.
//!
//! Everything runs in-process over loopback: a scripted game server for
//! sessions, an axum mock of the registry agent's HTTP API, and the real
//! gateway router. No external services are required:
//!
//!   cargo test --test integration
//!
//! Each test binds its own ephemeral ports and owns the tasks it spawns.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use mesh_core::config::{RegistryConfig, RetryConfig};

mod gateway;
mod registry;
mod sessions;

// ── Timing ────────────────────────────────────────────────────────────────────

/// Retry settings with the reference attempt counts but a short backoff.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        backoff_ms: 10,
        ..RetryConfig::default()
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(within, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("condition not reached in time")
}

// ── Mock registry agent ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct AgentState {
    /// id -> registration body as sent by the client.
    pub services: HashMap<String, Value>,
    pub kv: HashMap<String, String>,
    pub deregistrations: Vec<String>,
    pub tokens: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockAgent {
    pub state: Arc<Mutex<AgentState>>,
}

impl MockAgent {
    pub fn with<T>(&self, f: impl FnOnce(&mut AgentState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn registry_config(&self, addr: SocketAddr) -> RegistryConfig {
        RegistryConfig {
            address: format!("http://{addr}"),
            ..RegistryConfig::default()
        }
    }

    fn record_token(&self, headers: &HeaderMap) {
        if let Some(token) = headers.get("X-Consul-Token").and_then(|v| v.to_str().ok()) {
            self.with(|s| s.tokens.push(token.to_string()));
        }
    }
}

async fn agent_self(State(agent): State<MockAgent>, headers: HeaderMap) -> Json<Value> {
    agent.record_token(&headers);
    Json(json!({ "Config": { "NodeName": "mock" } }))
}

async fn agent_register(
    State(agent): State<MockAgent>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    agent.record_token(&headers);
    let Some(id) = body["ID"].as_str().map(str::to_string) else {
        return StatusCode::BAD_REQUEST;
    };
    agent.with(|s| s.services.insert(id, body));
    StatusCode::OK
}

async fn agent_deregister(State(agent): State<MockAgent>, Path(id): Path<String>) -> StatusCode {
    agent.with(|s| {
        s.services.remove(&id);
        s.deregistrations.push(id);
    });
    StatusCode::OK
}

async fn health_service(State(agent): State<MockAgent>, Path(name): Path<String>) -> Json<Value> {
    let entries: Vec<Value> = agent.with(|s| {
        s.services
            .values()
            .filter(|svc| svc["Name"] == name.as_str())
            .map(|svc| {
                json!({
                    "Node": { "Node": "mock" },
                    "Service": {
                        "ID": svc["ID"],
                        "Service": svc["Name"],
                        "Address": svc["Address"],
                        "Port": svc["Port"],
                        "Tags": svc["Tags"],
                    },
                    "Checks": [],
                })
            })
            .collect()
    });
    Json(Value::Array(entries))
}

async fn kv_get(State(agent): State<MockAgent>, Path(key): Path<String>) -> impl IntoResponse {
    match agent.with(|s| s.kv.get(&key).cloned()) {
        Some(value) => (StatusCode::OK, value),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

/// Serve a mock agent on an ephemeral loopback port.
pub async fn spawn_agent() -> Result<(MockAgent, SocketAddr)> {
    let agent = MockAgent::default();
    let app = Router::new()
        .route("/v1/agent/self", get(agent_self))
        .route("/v1/agent/service/register", put(agent_register))
        .route("/v1/agent/service/deregister/{id}", put(agent_deregister))
        .route("/v1/health/service/{name}", get(health_service))
        .route("/v1/kv/{*key}", get(kv_get))
        .with_state(agent.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok((agent, addr))
}
