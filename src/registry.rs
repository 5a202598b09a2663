//! Device registry
//!
//! Enumerates every configured capture backend, concatenates the results in
//! first-seen order, removes duplicates and assigns indices 0..N-1. The map
//! is rebuilt wholesale on every refresh and swapped in atomically; callers
//! holding an older snapshot keep a consistent view.

use crate::audio::{
    default_backends, BackendKind, DeviceDescriptor, DeviceListing, SharedBackend,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

/// Index → descriptor, valid for the lifetime of one refresh
pub type DeviceMap = BTreeMap<usize, DeviceDescriptor>;

pub struct DeviceRegistry {
    backends: Vec<SharedBackend>,
    devices: Mutex<Arc<DeviceMap>>,
}

impl DeviceRegistry {
    pub fn new(backends: Vec<SharedBackend>) -> Self {
        Self {
            backends,
            devices: Mutex::new(Arc::new(DeviceMap::new())),
        }
    }

    /// Registry over the native backends of this host
    pub fn with_default_backends() -> Self {
        Self::new(default_backends())
    }

    /// Re-enumerate all backends and replace the registry.
    ///
    /// A backend that fails to enumerate contributes nothing; if all of them
    /// fail the registry is simply empty.
    pub fn refresh(&self) -> Arc<DeviceMap> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();

        for backend in &self.backends {
            match backend.enumerate() {
                Ok(devices) => {
                    tracing::debug!("{}: {} device(s)", backend.name(), devices.len());
                    found.extend(devices);
                }
                Err(e) => {
                    tracing::warn!("{} enumeration unavailable: {}", backend.name(), e);
                }
            }
        }

        let map: DeviceMap = found
            .into_iter()
            .filter(|d| d.is_input_capable)
            .filter(|d| {
                seen.insert((
                    d.backend_kind,
                    d.host_api.clone(),
                    d.display_name.to_lowercase(),
                ))
            })
            .enumerate()
            .collect();

        if map.is_empty() {
            tracing::warn!("No audio capture devices found");
        } else {
            tracing::info!("Device registry refreshed: {} device(s)", map.len());
        }

        let map = Arc::new(map);
        *self.devices.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&map);
        map
    }

    /// Cached registry, refreshed when empty or when `force_refresh` is set
    pub fn get(&self, force_refresh: bool) -> Arc<DeviceMap> {
        if !force_refresh {
            let cached = Arc::clone(&self.devices.lock().unwrap_or_else(|e| e.into_inner()));
            if !cached.is_empty() {
                return cached;
            }
        }
        self.refresh()
    }

    /// The backend able to open descriptors of `kind`
    pub fn backend_for(&self, kind: BackendKind) -> Option<SharedBackend> {
        self.backends.iter().find(|b| b.kind() == kind).cloned()
    }

    /// Device listing payload for UI/API layers
    pub fn listing(&self, force_refresh: bool) -> Vec<DeviceListing> {
        self.get(force_refresh)
            .iter()
            .map(|(&id, d)| d.listing(id))
            .collect()
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("DeviceRegistry")
            .field("backends", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{SimulatedBackend, SimulatedDevice};

    #[test]
    fn test_refresh_concatenates_in_order() {
        let registry = DeviceRegistry::new(vec![
            Arc::new(SimulatedBackend::new(
                BackendKind::StreamCapture,
                vec![SimulatedDevice::new("Mic A"), SimulatedDevice::new("Mic B")],
            )),
            Arc::new(SimulatedBackend::new(
                BackendKind::LoopbackCapture,
                vec![SimulatedDevice::new("Speakers").loopback()],
            )),
        ]);

        let devices = registry.refresh();
        let names: Vec<&str> = devices.values().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, vec!["Mic A", "Mic B", "Speakers"]);
        assert_eq!(devices.keys().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(devices[&2].backend_kind, BackendKind::LoopbackCapture);
    }

    #[test]
    fn test_refresh_skips_unavailable_backend() {
        let registry = DeviceRegistry::new(vec![
            Arc::new(SimulatedBackend::new(BackendKind::LoopbackCapture, vec![]).unavailable()),
            Arc::new(SimulatedBackend::new(
                BackendKind::StreamCapture,
                vec![SimulatedDevice::new("Mic")],
            )),
        ]);
        assert_eq!(registry.refresh().len(), 1);
    }

    #[test]
    fn test_all_backends_failing_yields_empty() {
        let registry = DeviceRegistry::new(vec![Arc::new(
            SimulatedBackend::new(BackendKind::StreamCapture, vec![]).unavailable(),
        )]);
        assert!(registry.refresh().is_empty());
        assert!(registry.listing(true).is_empty());
    }

    #[test]
    fn test_excludes_devices_without_input() {
        let registry = DeviceRegistry::new(vec![Arc::new(SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![
                SimulatedDevice::new("HDMI").without_input(),
                SimulatedDevice::new("Mic"),
            ],
        ))]);
        let devices = registry.refresh();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[&0].display_name, "Mic");
    }

    #[test]
    fn test_deduplicates_same_name() {
        let registry = DeviceRegistry::new(vec![Arc::new(SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![
                SimulatedDevice::new("USB Mic"),
                SimulatedDevice::new("usb mic"),
                SimulatedDevice::new("Other"),
            ],
        ))]);
        let devices = registry.refresh();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[&1].display_name, "Other");
    }

    #[test]
    fn test_get_uses_cache_until_forced() {
        let backend = Arc::new(SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![SimulatedDevice::new("Mic")],
        ));
        let registry = DeviceRegistry::new(vec![backend]);
        let first = registry.get(false);
        let second = registry.get(false);
        assert!(Arc::ptr_eq(&first, &second));
        let forced = registry.get(true);
        assert!(!Arc::ptr_eq(&first, &forced));
    }

    #[test]
    fn test_backend_for_kind() {
        let registry = DeviceRegistry::new(vec![Arc::new(SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![],
        ))]);
        assert!(registry.backend_for(BackendKind::StreamCapture).is_some());
        assert!(registry.backend_for(BackendKind::LoopbackCapture).is_none());
    }
}
