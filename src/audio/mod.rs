//! Audio capture module
//!
//! Two native capture backends share one capability contract:
//! - [`cpal_capture::StreamBackend`]: input streaming through cpal
//!   (PipeWire, PulseAudio, ALSA, WASAPI, CoreAudio)
//! - [`loopback::LoopbackBackend`]: WASAPI output loopback and
//!   PulseAudio/PipeWire monitor sources
//!
//! Device capability reporting is unreliable, so both backends treat the
//! requested rate/channel count as a preference and negotiate down an
//! ordered candidate list until the device accepts one.

pub mod cpal_capture;
pub mod device;
pub mod loopback;
pub mod queue;
pub mod simulated;
pub mod wav;

pub use device::{BackendHandle, BackendKind, DeviceDescriptor, DeviceListing, DeviceType};

use crate::error::CaptureError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What the caller would like the device to deliver
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub sample_rate: u32,
    pub channels: u16,
    /// Upper bound on a single blocking read before it is declared failed
    pub read_timeout: Duration,
}

/// What the device actually granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NegotiatedConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

/// A native capture subsystem: enumerates its devices and opens them
pub trait CaptureBackend: Send + Sync {
    /// Kind of descriptors this backend produces
    fn kind(&self) -> BackendKind;

    /// Human-readable subsystem name for logs
    fn name(&self) -> &'static str;

    /// List capturable devices. An unavailable subsystem returns an error,
    /// which the registry treats as "no devices".
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Open a device, negotiating rate and channel count.
    ///
    /// The returned stream owns the native handle and releases it on drop.
    fn open(
        &self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// An open native capture handle
///
/// Not required to be `Send`: cpal streams must stay on the thread that
/// created them, so sessions open their stream on the worker thread.
pub trait CaptureStream {
    /// The configuration the device granted
    fn config(&self) -> NegotiatedConfig;

    /// Block until `frames` frames are available and return them
    /// channel-interleaved as f32 in [-1, 1]
    fn read(&mut self, frames: usize) -> Result<Vec<f32>, CaptureError>;

    /// Drop audio the device delivered while nobody was reading
    fn discard_pending(&mut self) {}
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn CaptureBackend>;

/// The native backends available on this host
pub fn default_backends() -> Vec<SharedBackend> {
    vec![
        Arc::new(cpal_capture::StreamBackend::new()),
        Arc::new(loopback::LoopbackBackend::new()),
    ]
}

/// Build the ordered list of (rate, channels) combinations to try.
///
/// Rates: requested, device-preferred, 48000, 44100.
/// Channels: requested, device maximum, 2, 1.
/// Every rate is tried with every channel count before moving on to the
/// next rate; duplicates are removed keeping the first occurrence.
pub fn candidate_configs(
    request: &StreamRequest,
    device: &DeviceDescriptor,
) -> Vec<NegotiatedConfig> {
    let rates = dedup(
        [
            Some(request.sample_rate),
            device.preferred_sample_rate,
            Some(48000),
            Some(44100),
        ]
        .into_iter()
        .flatten()
        .filter(|r| *r > 0),
    );

    let channels = dedup(
        [
            Some(request.channels),
            device.max_input_channels,
            Some(2),
            Some(1),
        ]
        .into_iter()
        .flatten()
        .filter(|c| *c > 0),
    );

    rates
        .iter()
        .flat_map(|&sample_rate| {
            channels.iter().map(move |&channels| NegotiatedConfig {
                sample_rate,
                channels,
            })
        })
        .collect()
}

fn dedup<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<T> {
    let mut out = Vec::new();
    for v in values {
        if !out.contains(&v) {
            out.push(v);
        }
    }
    out
}

/// Try each candidate in order and keep the first one the device accepts.
///
/// `attempt` returns the opened native object or the native error text.
/// When every candidate fails, the last native error is reported.
pub fn negotiate<T, F>(
    device_name: &str,
    candidates: &[NegotiatedConfig],
    mut attempt: F,
) -> Result<(T, NegotiatedConfig), CaptureError>
where
    F: FnMut(NegotiatedConfig) -> Result<T, String>,
{
    let mut last_error = String::from("no candidate configurations");

    for &candidate in candidates {
        match attempt(candidate) {
            Ok(opened) => {
                tracing::debug!(
                    "Opened '{}' at {} Hz, {} channel(s)",
                    device_name,
                    candidate.sample_rate,
                    candidate.channels
                );
                return Ok((opened, candidate));
            }
            Err(e) => {
                tracing::trace!(
                    "'{}' rejected {} Hz / {} ch: {}",
                    device_name,
                    candidate.sample_rate,
                    candidate.channels,
                    e
                );
                last_error = e;
            }
        }
    }

    Err(CaptureError::DeviceOpenFailed {
        device: device_name.to_string(),
        reason: last_error,
    })
}

/// Root-mean-square level of a block of samples
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}
