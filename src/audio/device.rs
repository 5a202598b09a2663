//! Backend-agnostic device descriptions
//!
//! A [`DeviceDescriptor`] is produced by exactly one capture backend during
//! enumeration and is only meaningful to that backend: the [`BackendHandle`]
//! it carries is resolved back into a native device object when the device
//! is opened.

use serde::{Deserialize, Serialize};

/// Which capture backend produced (and can open) a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// General-purpose input streaming
    StreamCapture,
    /// OS-level loopback / monitor capture
    LoopbackCapture,
}

impl BackendKind {
    /// Short label used in the device listing payload
    pub fn label(self) -> &'static str {
        match self {
            BackendKind::StreamCapture => "stream",
            BackendKind::LoopbackCapture => "loopback",
        }
    }
}

/// Opaque native identifier, resolvable only by the backend that produced it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendHandle {
    /// Input device `index` of the cpal host named `host`
    Input { host: String, index: usize },
    /// Output device `index` of the cpal host named `host`, captured as loopback
    OutputLoopback { host: String, index: usize },
    /// PulseAudio/PipeWire monitor source, captured through parec
    Monitor { source: String },
    /// Scripted device of the simulated backend
    Simulated { index: usize },
}

/// Normalized description of one capturable audio endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub backend_kind: BackendKind,
    pub backend_handle: BackendHandle,
    pub display_name: String,
    pub is_loopback: bool,
    pub is_input_capable: bool,
    pub is_output_capable: bool,
    pub host_api: Option<String>,
    pub preferred_sample_rate: Option<u32>,
    pub max_input_channels: Option<u16>,
}

impl DeviceDescriptor {
    /// Build the listing payload entry for this descriptor
    pub fn listing(&self, id: usize) -> DeviceListing {
        let device_type = if self.is_loopback && self.is_output_capable {
            DeviceType::Output
        } else {
            DeviceType::Input
        };

        DeviceListing {
            id,
            name: self.display_name.clone(),
            device_type,
            is_loopback: self.is_loopback,
            backend: self.backend_kind.label().to_string(),
            host_api: self.host_api.clone(),
            default_sample_rate: self.preferred_sample_rate,
            channels: self.max_input_channels,
        }
    }
}

impl std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name)?;
        if let Some(ref api) = self.host_api {
            write!(f, " [{}]", api)?;
        }
        if self.is_loopback {
            write!(f, " (loopback)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Input,
    Output,
}

/// Device listing payload consumed by UI/API layers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceListing {
    pub id: usize,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub is_loopback: bool,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_api: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
}

/// Check if a device name indicates a loopback/virtual audio device
///
/// Used for descriptors that come out of plain input enumeration, where
/// virtual drivers show up as ordinary microphones.
pub fn looks_like_loopback(name: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "blackhole",
        "loopback",
        "soundflower",
        "monitor of",
        ".monitor",
        "stereo mix",
        "wave out mix",
    ];
    let lower = name.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, loopback: bool, output: bool) -> DeviceDescriptor {
        DeviceDescriptor {
            backend_kind: BackendKind::LoopbackCapture,
            backend_handle: BackendHandle::OutputLoopback {
                host: "WASAPI".into(),
                index: 0,
            },
            display_name: name.into(),
            is_loopback: loopback,
            is_input_capable: true,
            is_output_capable: output,
            host_api: Some("WASAPI".into()),
            preferred_sample_rate: Some(48000),
            max_input_channels: Some(2),
        }
    }

    #[test]
    fn test_loopback_name_heuristics() {
        assert!(looks_like_loopback("BlackHole 2ch"));
        assert!(looks_like_loopback("Monitor of Built-in Audio"));
        assert!(looks_like_loopback("alsa_output.pci-0000_00_1f.3.analog-stereo.monitor"));
        assert!(looks_like_loopback("Stereo Mix (Realtek Audio)"));
        assert!(!looks_like_loopback("USB Microphone"));
    }

    #[test]
    fn test_listing_output_loopback() {
        let listing = descriptor("Speakers", true, true).listing(3);
        assert_eq!(listing.id, 3);
        assert_eq!(listing.device_type, DeviceType::Output);
        assert_eq!(listing.backend, "loopback");

        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["default_sample_rate"], 48000);
    }

    #[test]
    fn test_listing_skips_missing_optionals() {
        let mut d = descriptor("Mic", false, false);
        d.host_api = None;
        d.preferred_sample_rate = None;
        d.max_input_channels = None;
        let json = serde_json::to_value(d.listing(0)).unwrap();
        assert_eq!(json["type"], "input");
        assert!(json.get("host_api").is_none());
        assert!(json.get("channels").is_none());
    }

    #[test]
    fn test_display() {
        let d = descriptor("Speakers", true, true);
        assert_eq!(d.to_string(), "Speakers [WASAPI] (loopback)");
    }
}
