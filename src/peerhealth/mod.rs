//! Peer health protocol
//!
//! A mutually authenticated RPC with a single call: "is this node
//! unhealthy?". A node that has lost control-plane access asks a random
//! batch of peers; each peer answers from its own view of the cluster
//! store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

mod client;
mod server;

pub use client::PeerHealthClient;
pub use server::PeerHealthServer;

pub const PEER_HEALTH_DEFAULT_PORT: u16 = 30001;

/// Timeout for the API lookups a peer performs while answering a health
/// query. Must stay below the client's request timeout by enough margin for
/// one network round trip, so a peer can never hold a client past its
/// deadline.
pub const PEER_API_SERVER_ACCESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Verdict a peer returns about a queried node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// The peer could not consult the cluster store
    ApiError,
}

impl HealthStatus {
    pub fn code(self) -> i32 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unhealthy => 1,
            HealthStatus::ApiError => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(HealthStatus::Healthy),
            1 => Some(HealthStatus::Unhealthy),
            2 => Some(HealthStatus::ApiError),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRequest {
    pub node_name: String,
    /// Set when the upstream detector authors requests against machines
    /// instead of nodes
    #[serde(default)]
    pub machine_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: i32,
}

impl From<HealthStatus> for HealthResponse {
    fn from(status: HealthStatus) -> Self {
        Self {
            status: status.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            HealthStatus::Healthy,
            HealthStatus::Unhealthy,
            HealthStatus::ApiError,
        ] {
            assert_eq!(HealthStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(HealthStatus::from_code(42), None);
    }

    #[test]
    fn test_request_wire_format() {
        let request = HealthRequest {
            node_name: "worker-1".to_string(),
            machine_name: String::new(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["nodeName"], "worker-1");
        assert_eq!(value["machineName"], "");

        // machineName may be omitted on the wire
        let parsed: HealthRequest =
            serde_json::from_str(r#"{"nodeName":"worker-2"}"#).unwrap();
        assert_eq!(parsed.node_name, "worker-2");
        assert_eq!(parsed.machine_name, "");
    }

    #[test]
    fn test_response_carries_numeric_status() {
        let response: HealthResponse = HealthStatus::Unhealthy.into();
        assert_eq!(serde_json::to_value(&response).unwrap()["status"], 1);
    }
}
