//! Peer health client
//!
//! Dials one peer per call over mTLS: the client presents the shared leaf
//! certificate and pins the cluster CA. Peers are reached by IP but
//! addressed by the certificate's DNS name so hostname verification holds.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use crate::certificates::{MtlsMaterial, PEER_DNS_NAME};
use crate::error::{Error, Result};
use crate::peers::Peer;

use super::{HealthRequest, HealthResponse, HealthStatus};

#[derive(Clone)]
pub struct PeerHealthClient {
    identity_pem: Vec<u8>,
    ca_pem: Vec<u8>,
    port: u16,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl PeerHealthClient {
    pub fn new(
        material: &MtlsMaterial,
        port: u16,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let mut identity_pem = material.cert_pem.clone();
        identity_pem.extend_from_slice(&material.key_pem);
        Self {
            identity_pem,
            ca_pem: material.ca_pem.clone(),
            port,
            dial_timeout,
            request_timeout,
        }
    }

    /// Ask one peer whether it considers the given node unhealthy
    pub async fn is_healthy(&self, peer: &Peer, request: &HealthRequest) -> Result<HealthStatus> {
        let addr: SocketAddr = format!("{}:{}", peer.address, self.port)
            .parse()
            .map_err(|e| Error::PeerError(format!("bad peer address {}: {e}", peer.address)))?;

        let identity = reqwest::Identity::from_pem(&self.identity_pem)
            .map_err(|e| Error::PeerError(format!("invalid client identity: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&self.ca_pem)
            .map_err(|e| Error::PeerError(format!("invalid pinned CA: {e}")))?;

        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .add_root_certificate(ca)
            .tls_built_in_root_certs(false)
            .resolve(PEER_DNS_NAME, addr)
            .connect_timeout(self.dial_timeout)
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| Error::PeerError(format!("failed to build peer client: {e}")))?;

        let url = format!("https://{}:{}/health", PEER_DNS_NAME, self.port);
        debug!(peer = %peer.node_name, %url, "querying peer health");

        let response = http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::PeerError(format!("peer {} unreachable: {e}", peer.node_name)))?
            .error_for_status()
            .map_err(|e| Error::PeerError(format!("peer {} refused: {e}", peer.node_name)))?;

        let body: HealthResponse = response
            .json()
            .await
            .map_err(|e| Error::PeerError(format!("bad response from {}: {e}", peer.node_name)))?;

        HealthStatus::from_code(body.status).ok_or_else(|| {
            Error::PeerError(format!(
                "peer {} returned unknown status {}",
                peer.node_name, body.status
            ))
        })
    }
}
