//! Peer health server
//!
//! Answers "is this node unhealthy?" for other agents, over mTLS. The
//! verdict is derived purely from the cluster store: a node is unhealthy
//! iff a RemediationRequest naming it exists.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::{api::Api, Client, ResourceExt};
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::certificates::{self, MtlsMaterial};
use crate::controller;
use crate::crd::RemediationRequest;
use crate::error::Result;

use super::{HealthRequest, HealthResponse, HealthStatus, PEER_API_SERVER_ACCESS_TIMEOUT};

#[derive(Clone)]
struct ServerState {
    client: Client,
}

pub struct PeerHealthServer {
    client: Client,
    material: MtlsMaterial,
    port: u16,
}

impl PeerHealthServer {
    pub fn new(client: Client, material: MtlsMaterial, port: u16) -> Self {
        Self {
            client,
            material,
            port,
        }
    }

    /// Serve until the process shuts down
    pub async fn run(self) -> Result<()> {
        let app = Router::new()
            .route("/health", post(is_healthy))
            .layer(TraceLayer::new_for_http())
            .with_state(ServerState {
                client: self.client,
            });

        let server_config = certificates::server_tls_config(&self.material)?;
        let rustls_config = RustlsConfig::from_config(Arc::new(server_config));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!(%addr, "peer health server listening with mTLS");

        axum_server::bind_rustls(addr, rustls_config)
            .serve(app.into_make_service())
            .await
            .map_err(|e| crate::Error::ConfigError(format!("peer health server error: {e}")))?;
        Ok(())
    }
}

async fn is_healthy(
    State(state): State<ServerState>,
    Json(request): Json<HealthRequest>,
) -> std::result::Result<Json<HealthResponse>, StatusCode> {
    if request.node_name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let requests: Api<RemediationRequest> = Api::all(state.client.clone());
    let all = match timeout(PEER_API_SERVER_ACCESS_TIMEOUT, requests.list(&Default::default())).await
    {
        Ok(Ok(list)) => list,
        Ok(Err(err)) => {
            warn!(%err, "failed to list remediation requests");
            return Ok(Json(HealthStatus::ApiError.into()));
        }
        Err(_) => {
            warn!("listing remediation requests timed out");
            return Ok(Json(HealthStatus::ApiError.into()));
        }
    };

    // Healthy only if every request's namespace is free of a request naming
    // the queried node (or its machine, for machine-authored requests)
    for existing in &all {
        let lookup_name = if controller::is_owned_by_health_detector(existing) {
            &request.node_name
        } else {
            &request.machine_name
        };
        if lookup_name.is_empty() {
            continue;
        }
        let namespace = existing.namespace().unwrap_or_else(|| "default".to_string());
        let status = is_healthy_by_request(&state.client, lookup_name, &namespace).await;
        if status != HealthStatus::Healthy {
            return Ok(Json(status.into()));
        }
    }

    debug!(node = %request.node_name, "no remediation request found, node is healthy");
    Ok(Json(HealthStatus::Healthy.into()))
}

async fn is_healthy_by_request(
    client: &Client,
    name: &str,
    namespace: &str,
) -> HealthStatus {
    let requests: Api<RemediationRequest> = Api::namespaced(client.clone(), namespace);
    match timeout(PEER_API_SERVER_ACCESS_TIMEOUT, requests.get_opt(name)).await {
        Ok(Ok(Some(_))) => {
            info!(node = name, namespace, "remediation request exists, node is unhealthy");
            HealthStatus::Unhealthy
        }
        Ok(Ok(None)) => HealthStatus::Healthy,
        Ok(Err(err)) => {
            warn!(%err, "api error while answering peer health query");
            HealthStatus::ApiError
        }
        Err(_) => {
            warn!("peer health lookup timed out");
            HealthStatus::ApiError
        }
    }
}
