//! RemediationConfig Custom Resource Definition
//!
//! Cluster-scoped, one per cluster with a pinned name. The agents read it at
//! process start; changing it requires an agent restart.

use std::time::Duration;

use kube::{api::Api, Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::peerhealth::PEER_API_SERVER_ACCESS_TIMEOUT;

pub const CONFIG_CR_NAME: &str = "remediation-config";
pub const DEFAULT_WATCHDOG_PATH: &str = "/dev/watchdog";
pub const DEFAULT_SAFE_REBOOT_TIMEOUT_SECONDS: u64 = 180;

/// Margin the peer request timeout must keep above the peer's internal API
/// timeout, to allow for one network round trip
const PEER_REQUEST_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "fencing.medik8s.io",
    version = "v1alpha1",
    kind = "RemediationConfig",
    shortname = "rc"
)]
#[serde(rename_all = "camelCase")]
pub struct RemediationConfigSpec {
    /// Watchdog device path expected on each node, e.g. /dev/watchdog
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog_file_path: Option<String>,

    /// Time after which healthy agents assume the unhealthy node has been
    /// rebooted and it is safe to remove its workloads. Deleting workloads
    /// while they might still be running risks data corruption and violates
    /// run-once semantics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_time_to_assume_node_rebooted_seconds: Option<u64>,

    /// Timeout for the API probe performed inside a peer while it answers a
    /// health query. Accepts unit suffixes ms/s/m/h.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_api_server_timeout: Option<String>,

    /// Frequency of the control-plane connectivity check
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_check_interval: Option<String>,

    /// Frequency of the peer registry refresh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_update_interval: Option<String>,

    /// Timeout for each connectivity probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_timeout: Option<String>,

    /// Timeout for establishing a connection to a peer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dial_timeout: Option<String>,

    /// Timeout for each peer health request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_request_timeout: Option<String>,

    /// Number of consecutive probe failures before the node starts
    /// consulting its peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_api_error_threshold: Option<u32>,

    /// Whether to fall back to a software reboot when the watchdog device
    /// cannot be used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_software_reboot_enabled: Option<bool>,

    /// TCP port the peer health server listens on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_health_port: Option<u16>,
}

/// Parsed runtime settings, defaults applied
#[derive(Clone, Debug)]
pub struct Settings {
    pub watchdog_file_path: String,
    pub safe_reboot_timeout: Duration,
    pub peer_api_server_timeout: Duration,
    pub api_check_interval: Duration,
    pub peer_update_interval: Duration,
    pub api_server_timeout: Duration,
    pub peer_dial_timeout: Duration,
    pub peer_request_timeout: Duration,
    pub max_api_error_threshold: u32,
    pub is_software_reboot_enabled: bool,
    pub peer_health_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            watchdog_file_path: DEFAULT_WATCHDOG_PATH.to_string(),
            safe_reboot_timeout: Duration::from_secs(DEFAULT_SAFE_REBOOT_TIMEOUT_SECONDS),
            peer_api_server_timeout: Duration::from_secs(5),
            api_check_interval: Duration::from_secs(15),
            peer_update_interval: Duration::from_secs(15 * 60),
            api_server_timeout: Duration::from_secs(5),
            peer_dial_timeout: Duration::from_secs(5),
            peer_request_timeout: Duration::from_secs(5),
            max_api_error_threshold: 3,
            is_software_reboot_enabled: true,
            peer_health_port: crate::peerhealth::PEER_HEALTH_DEFAULT_PORT,
        }
    }
}

impl Settings {
    /// Resolve a config spec into runtime settings.
    ///
    /// Malformed durations are an error; a too-small peer request timeout is
    /// clamped so that a peer can never hold a client past its deadline.
    pub fn resolve(spec: &RemediationConfigSpec) -> Result<Self> {
        let defaults = Settings::default();
        let mut settings = Settings {
            watchdog_file_path: spec
                .watchdog_file_path
                .clone()
                .unwrap_or(defaults.watchdog_file_path),
            safe_reboot_timeout: spec
                .safe_time_to_assume_node_rebooted_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.safe_reboot_timeout),
            peer_api_server_timeout: parse_duration_field(
                "peerApiServerTimeout",
                spec.peer_api_server_timeout.as_deref(),
                defaults.peer_api_server_timeout,
            )?,
            api_check_interval: parse_duration_field(
                "apiCheckInterval",
                spec.api_check_interval.as_deref(),
                defaults.api_check_interval,
            )?,
            peer_update_interval: parse_duration_field(
                "peerUpdateInterval",
                spec.peer_update_interval.as_deref(),
                defaults.peer_update_interval,
            )?,
            api_server_timeout: parse_duration_field(
                "apiServerTimeout",
                spec.api_server_timeout.as_deref(),
                defaults.api_server_timeout,
            )?,
            peer_dial_timeout: parse_duration_field(
                "peerDialTimeout",
                spec.peer_dial_timeout.as_deref(),
                defaults.peer_dial_timeout,
            )?,
            peer_request_timeout: parse_duration_field(
                "peerRequestTimeout",
                spec.peer_request_timeout.as_deref(),
                defaults.peer_request_timeout,
            )?,
            max_api_error_threshold: spec
                .max_api_error_threshold
                .unwrap_or(defaults.max_api_error_threshold),
            is_software_reboot_enabled: spec
                .is_software_reboot_enabled
                .unwrap_or(defaults.is_software_reboot_enabled),
            peer_health_port: spec.peer_health_port.unwrap_or(defaults.peer_health_port),
        };

        let min_request_timeout = PEER_API_SERVER_ACCESS_TIMEOUT + PEER_REQUEST_TIMEOUT_MARGIN;
        if settings.peer_request_timeout < min_request_timeout {
            warn!(
                configured = ?settings.peer_request_timeout,
                minimum = ?min_request_timeout,
                "peerRequestTimeout must exceed the peer's internal API timeout, clamping"
            );
            settings.peer_request_timeout = min_request_timeout;
        }

        Ok(settings)
    }

    /// Load the pinned config object from the cluster, falling back to
    /// defaults when it does not exist
    pub async fn load(client: &Client) -> Result<Self> {
        let configs: Api<RemediationConfig> = Api::all(client.clone());
        match configs.get_opt(CONFIG_CR_NAME).await.map_err(Error::KubeError)? {
            Some(config) => {
                info!(name = CONFIG_CR_NAME, "loaded remediation config");
                Settings::resolve(&config.spec)
            }
            None => {
                info!(
                    name = CONFIG_CR_NAME,
                    "remediation config not found, using defaults"
                );
                Ok(Settings::default())
            }
        }
    }
}

fn parse_duration_field(field: &str, raw: Option<&str>, default: Duration) -> Result<Duration> {
    match raw {
        None => Ok(default),
        Some(raw) => humantime::parse_duration(raw)
            .map_err(|e| Error::ConfigError(format!("invalid duration in {field}: {raw}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.watchdog_file_path, "/dev/watchdog");
        assert_eq!(s.safe_reboot_timeout, Duration::from_secs(180));
        assert_eq!(s.api_check_interval, Duration::from_secs(15));
        assert_eq!(s.peer_update_interval, Duration::from_secs(900));
        assert_eq!(s.max_api_error_threshold, 3);
        assert!(s.is_software_reboot_enabled);
    }

    #[test]
    fn test_resolve_parses_unit_suffixes() {
        let spec = RemediationConfigSpec {
            api_check_interval: Some("30s".into()),
            peer_update_interval: Some("10m".into()),
            peer_dial_timeout: Some("1500ms".into()),
            peer_request_timeout: Some("1h".into()),
            ..Default::default()
        };
        let s = Settings::resolve(&spec).unwrap();
        assert_eq!(s.api_check_interval, Duration::from_secs(30));
        assert_eq!(s.peer_update_interval, Duration::from_secs(600));
        assert_eq!(s.peer_dial_timeout, Duration::from_millis(1500));
        assert_eq!(s.peer_request_timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_resolve_rejects_malformed_duration() {
        let spec = RemediationConfigSpec {
            api_server_timeout: Some("five seconds".into()),
            ..Default::default()
        };
        assert!(Settings::resolve(&spec).is_err());
    }

    #[test]
    fn test_peer_request_timeout_clamped_above_peer_internal_timeout() {
        let spec = RemediationConfigSpec {
            peer_request_timeout: Some("1s".into()),
            ..Default::default()
        };
        let s = Settings::resolve(&spec).unwrap();
        assert!(s.peer_request_timeout > PEER_API_SERVER_ACCESS_TIMEOUT);
    }
}
