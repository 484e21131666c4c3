//! Self-reboot engine
//!
//! Primary path is the hardware watchdog: rebooting means no longer petting
//! it. The software reboot syscall is the fallback for nodes without a
//! usable watchdog device. The safe-time calculator guarantees that any
//! reboot this node initiates completes strictly before peers assume it
//! has.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::crd::Settings;
use crate::error::{Error, Result};

mod watchdog;

pub use watchdog::Watchdog;

/// Delay between "we triggered the reboot" and "the OS has begun shutting
/// down". The reconciler requeues by at least this much after triggering a
/// reboot so it does not re-enter the reboot step during the shutdown
/// window.
pub const TIME_TO_ASSUME_REBOOT_HAS_STARTED: Duration = Duration::from_secs(30);

/// Slack added on top of the worst-case detection-plus-reboot path
const SAFE_TIME_BUFFER: Duration = Duration::from_secs(15);

pub trait Rebooter: Send + Sync {
    /// Trigger an irreversible reboot of this host
    fn reboot(&self) -> Result<()>;
}

/// Reboots by letting the hardware watchdog expire
pub struct WatchdogRebooter {
    watchdog: Arc<Watchdog>,
}

impl WatchdogRebooter {
    pub fn new(watchdog: Arc<Watchdog>) -> Self {
        Self { watchdog }
    }
}

impl Rebooter for WatchdogRebooter {
    fn reboot(&self) -> Result<()> {
        self.watchdog.disarm();
        Ok(())
    }
}

/// Reboots through the OS when no watchdog device is available
pub struct SoftwareRebooter;

impl Rebooter for SoftwareRebooter {
    fn reboot(&self) -> Result<()> {
        warn!("triggering software reboot");
        if let Err(errno) = nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT) {
            warn!(%errno, "reboot syscall failed, falling back to systemctl");
            let status = std::process::Command::new("systemctl")
                .args(["reboot", "--force"])
                .status()
                .map_err(|e| Error::RebootError(format!("failed to run systemctl reboot: {e}")))?;
            if !status.success() {
                return Err(Error::RebootError(format!(
                    "systemctl reboot exited with {status}"
                )));
            }
        }
        Ok(())
    }
}

/// Pick the reboot mechanism for this node, watchdog first. `None` means
/// the node is not reboot-capable and must not be remediated.
pub fn select_rebooter(
    watchdog: Option<Arc<Watchdog>>,
    software_reboot_enabled: bool,
) -> Option<Arc<dyn Rebooter>> {
    match watchdog {
        Some(watchdog) => Some(Arc::new(WatchdogRebooter::new(watchdog))),
        None if software_reboot_enabled => Some(Arc::new(SoftwareRebooter)),
        None => None,
    }
}

/// Computes how long peers must wait before assuming this node rebooted.
///
/// The floor covers the worst case end to end: the node takes the full
/// error threshold to notice the API is gone, a full peer consultation
/// round, and then the watchdog timeout before the hardware actually
/// resets.
#[derive(Clone, Debug)]
pub struct SafeTimeCalculator {
    configured: Duration,
    watchdog_timeout: Duration,
    api_check_interval: Duration,
    api_server_timeout: Duration,
    peer_dial_timeout: Duration,
    peer_request_timeout: Duration,
    max_error_threshold: u32,
}

impl SafeTimeCalculator {
    pub fn new(settings: &Settings, watchdog_timeout: Option<Duration>) -> Self {
        Self {
            configured: settings.safe_reboot_timeout,
            watchdog_timeout: watchdog_timeout.unwrap_or(Duration::ZERO),
            api_check_interval: settings.api_check_interval,
            api_server_timeout: settings.api_server_timeout,
            peer_dial_timeout: settings.peer_dial_timeout,
            peer_request_timeout: settings.peer_request_timeout,
            max_error_threshold: settings.max_api_error_threshold,
        }
    }

    /// Minimum interval that keeps the reboot-before-deletion invariant
    pub fn min_safe_time(&self) -> Duration {
        self.api_check_interval * self.max_error_threshold
            + self.api_server_timeout
            + self.peer_dial_timeout
            + self.peer_request_timeout
            + self.watchdog_timeout
            + SAFE_TIME_BUFFER
    }

    /// The configured safe time, floored at the computed minimum
    pub fn time_to_assume_node_rebooted(&self) -> Duration {
        let min = self.min_safe_time();
        if self.configured < min {
            warn!(
                configured = ?self.configured,
                minimum = ?min,
                "configured safe reboot time is below the safe minimum, using the minimum"
            );
            return min;
        }
        self.configured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_min_safe_time_covers_detection_and_reset() {
        let calc = SafeTimeCalculator::new(&settings(), Some(Duration::from_secs(60)));
        // 3 * 15s checks + 5s api + 5s dial + 5s request + 60s watchdog + 15s buffer
        assert_eq!(calc.min_safe_time(), Duration::from_secs(135));
    }

    #[test]
    fn test_configured_value_wins_when_above_minimum() {
        let calc = SafeTimeCalculator::new(&settings(), Some(Duration::from_secs(10)));
        // default 180s configured > 85s minimum
        assert_eq!(
            calc.time_to_assume_node_rebooted(),
            Duration::from_secs(180)
        );
    }

    #[test]
    fn test_low_configured_value_is_floored() {
        let mut s = settings();
        s.safe_reboot_timeout = Duration::from_secs(30);
        let calc = SafeTimeCalculator::new(&s, Some(Duration::from_secs(120)));
        assert_eq!(calc.time_to_assume_node_rebooted(), calc.min_safe_time());
        assert!(calc.time_to_assume_node_rebooted() > Duration::from_secs(30));
    }

    #[test]
    fn test_rebooter_selection_prefers_watchdog_then_software() {
        assert!(select_rebooter(None, true).is_some());
        assert!(select_rebooter(None, false).is_none());
    }

    #[test]
    fn test_reboot_started_watermark_is_below_safe_time() {
        let calc = SafeTimeCalculator::new(&settings(), None);
        assert!(TIME_TO_ASSUME_REBOOT_HAS_STARTED < calc.time_to_assume_node_rebooted());
    }
}
