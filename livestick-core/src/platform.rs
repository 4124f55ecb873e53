//! Platform-specific device discovery.
//!
//! The rest of the engine only sees the [`Prober`] trait. Each supported
//! platform exposes an implementation under the same names, selected with
//! `#[cfg]`.
use crate::device::DeviceSnapshot;
use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;

/// Resolves kernel device names into snapshots.
pub trait Prober: Send + Sync {
    /// Probes the block device called `name` (e.g. "sdb").
    ///
    /// Returns `Ok(None)` when the device is gone or not eligible for
    /// selection under the configured device filter.
    fn probe(&self, name: &str) -> Result<Option<DeviceSnapshot>>;

    /// Names of all block devices currently attached.
    fn device_names(&self) -> Result<Vec<String>>;

    /// Probes every attached device and returns the eligible ones, in name
    /// order. A device failing to probe is skipped.
    fn scan(&self) -> Result<Vec<DeviceSnapshot>> {
        let mut names = self.device_names()?;
        names.sort();

        let mut devices = Vec::new();
        for name in names {
            match self.probe(&name) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => tracing::warn!(device = %name, "probe failed: {e}"),
            }
        }
        Ok(devices)
    }
}
