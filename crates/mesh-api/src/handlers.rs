//! HTTP API handlers — connector lookup for clients.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use mesh_services::{Discoverer, TransportKind};

#[derive(Clone)]
pub struct ApiState {
    pub discoverer: Arc<Discoverer>,
    /// Untagged connector service name, e.g. `Connector`.
    pub connector_service: String,
}

// ── /GetConnector ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ConnectorQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// Endpoints of the connector service for the requested transport.
///
/// Always 200: an unknown type or an unavailable service yields `[]`.
pub async fn handle_get_connector(
    State(state): State<ApiState>,
    Query(query): Query<ConnectorQuery>,
) -> Json<Vec<String>> {
    let requested = query.kind.unwrap_or_default();
    let Some(kind) = TransportKind::parse(&requested) else {
        tracing::warn!(kind = %requested, "invalid connector type");
        return Json(Vec::new());
    };

    let service = kind.namespaced(&state.connector_service);
    let endpoints = state.discoverer.discover(&service).await;
    if endpoints.is_empty() {
        tracing::warn!(service = %service, "no connector available");
    }
    Json(endpoints)
}
