//! Device selection policy
//!
//! Resolution order (first match wins):
//! 1. The index the caller asked for, if it is in the registry
//! 2. The configured device id override
//! 3. The configured device name override (case-insensitive substring)
//! 4. The platform default: a platform-conventional loopback source, then
//!    any loopback source, then any input, then the first device

use crate::audio::DeviceDescriptor;
use crate::config::DeviceConfig;
use crate::error::CaptureError;
use crate::registry::{DeviceMap, DeviceRegistry};
use std::sync::Arc;

/// Host platform, used to pick the conventional loopback source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }

    /// Whether a loopback descriptor follows this platform's convention:
    /// WASAPI loopback on Windows, PulseAudio/PipeWire monitors on Linux,
    /// virtual loopback drivers on macOS.
    fn is_preferred(self, device: &DeviceDescriptor) -> bool {
        if !device.is_loopback {
            return false;
        }
        let name = device.display_name.to_lowercase();
        match self {
            Platform::Windows => device
                .host_api
                .as_deref()
                .is_some_and(|api| api.to_lowercase().contains("wasapi")),
            Platform::Linux => name.contains("monitor"),
            Platform::MacOs => ["blackhole", "soundflower", "loopback"]
                .iter()
                .any(|driver| name.contains(driver)),
            Platform::Other => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSelector {
    registry: Arc<DeviceRegistry>,
    overrides: DeviceConfig,
    platform: Platform,
}

impl DeviceSelector {
    pub fn new(registry: Arc<DeviceRegistry>, overrides: DeviceConfig) -> Self {
        Self::with_platform(registry, overrides, Platform::current())
    }

    pub fn with_platform(
        registry: Arc<DeviceRegistry>,
        overrides: DeviceConfig,
        platform: Platform,
    ) -> Self {
        Self {
            registry,
            overrides,
            platform,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Pick a device, refreshing the registry once if it is empty
    pub fn resolve(
        &self,
        requested_index: Option<usize>,
    ) -> Result<(usize, DeviceDescriptor), CaptureError> {
        let mut devices = self.registry.get(false);
        if devices.is_empty() {
            devices = self.registry.get(true);
        }
        if devices.is_empty() {
            return Err(CaptureError::NoDeviceAvailable);
        }

        let (index, device) = self
            .pick(&devices, requested_index)
            .ok_or(CaptureError::NoDeviceAvailable)?;
        tracing::debug!("Resolved audio device {}: {}", index, device);
        Ok((index, device.clone()))
    }

    fn pick<'a>(
        &self,
        devices: &'a DeviceMap,
        requested_index: Option<usize>,
    ) -> Option<(usize, &'a DeviceDescriptor)> {
        if let Some(index) = requested_index {
            match devices.get(&index) {
                Some(d) => return Some((index, d)),
                None => tracing::warn!("Requested device {} not found, using default", index),
            }
        }

        if let Some(index) = self.overrides.id {
            match devices.get(&index) {
                Some(d) => return Some((index, d)),
                None => tracing::warn!("Configured device id {} not found", index),
            }
        }

        if let Some(ref name) = self.overrides.name {
            let needle = name.to_lowercase();
            match devices
                .iter()
                .find(|(_, d)| d.display_name.to_lowercase().contains(&needle))
            {
                Some((&i, d)) => return Some((i, d)),
                None => tracing::warn!("No device name matches '{}'", name),
            }
        }

        platform_default(self.platform, devices)
    }
}

/// The platform default device of a non-empty registry
pub fn platform_default(
    platform: Platform,
    devices: &DeviceMap,
) -> Option<(usize, &DeviceDescriptor)> {
    let first = |pred: &dyn Fn(&DeviceDescriptor) -> bool| {
        devices.iter().find(|(_, d)| pred(d)).map(|(&i, d)| (i, d))
    };

    first(&|d| platform.is_preferred(d))
        .or_else(|| first(&|d| d.is_loopback))
        .or_else(|| first(&|d| d.is_input_capable))
        .or_else(|| devices.iter().next().map(|(&i, d)| (i, d)))
}
