//! Hardware watchdog device
//!
//! The device contract: keep writing to the file ("petting") and nothing
//! happens; stop petting and the hardware resets the host within the device
//! timeout. Closing the file after writing the magic character disables the
//! timer, so an orderly shutdown does not reboot the node, while a crashed
//! process does.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::libc::c_int;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Assumed when the device does not answer the timeout query
const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

// WDIOC_GETTIMEOUT from the Linux watchdog API
nix::ioctl_read!(watchdog_get_timeout, b'W', 7, c_int);

pub struct Watchdog {
    file: File,
    timeout: Duration,
    armed: AtomicBool,
}

impl Watchdog {
    /// Open the device and read its timeout. Opening arms the timer, so the
    /// caller must start the pet loop promptly.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().write(true).open(path).map_err(|e| {
            Error::RebootError(format!("failed to open watchdog {}: {e}", path.display()))
        })?;

        let mut seconds: c_int = 0;
        let timeout = match unsafe { watchdog_get_timeout(file.as_raw_fd(), &mut seconds) } {
            Ok(_) if seconds > 0 => Duration::from_secs(seconds as u64),
            _ => {
                warn!(
                    path = %path.display(),
                    assumed = ?DEFAULT_WATCHDOG_TIMEOUT,
                    "watchdog did not report a timeout"
                );
                DEFAULT_WATCHDOG_TIMEOUT
            }
        };

        info!(path = %path.display(), ?timeout, "watchdog armed");
        Ok(Self {
            file,
            timeout,
            armed: AtomicBool::new(true),
        })
    }

    /// The hardware reset delay once petting stops
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Stop petting. The hardware resets the host within `timeout()`.
    pub fn disarm(&self) {
        warn!("watchdog disarmed, hardware reset is now imminent");
        self.armed.store(false, Ordering::SeqCst);
    }

    fn pet(&self) -> std::io::Result<()> {
        (&self.file).write_all(b"\0")
    }

    fn magic_close(&self) {
        // 'V' tells the driver the close is deliberate and the timer should
        // be disabled rather than fire
        if let Err(err) = (&self.file).write_all(b"V") {
            warn!(%err, "failed to write watchdog magic close");
        }
    }

    /// Pet the device at half its timeout until disarmed or shut down.
    ///
    /// Disarming exits without the magic close, letting the hardware fire;
    /// an orderly shutdown disables the timer first.
    pub async fn run_pet_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = (self.timeout / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.is_armed() {
                        info!("watchdog pet loop stopped, reset pending");
                        return;
                    }
                    if let Err(err) = self.pet() {
                        warn!(%err, "failed to pet watchdog");
                    }
                }
                _ = shutdown.changed() => {
                    self.magic_close();
                    info!("watchdog disabled for orderly shutdown");
                    return;
                }
            }
        }
    }
}
