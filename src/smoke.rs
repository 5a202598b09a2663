//! Audio capture smoke test
//!
//! Opens a device directly (no session), records a few seconds in one
//! second batches and reports whether anything was audible. Useful to
//! check that a loopback driver is installed and actually carries sound.

use crate::audio::rms;
use crate::error::CaptureError;
use crate::session::CaptureSession;
use serde::Serialize;
use std::time::{Duration, Instant};

/// RMS level above which a recording counts as audible
pub const AUDIBLE_RMS: f32 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmokeReport {
    pub device: String,
    pub device_id: usize,
    pub is_loopback: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames: usize,
    pub duration_secs: f64,
    pub rms_level: f32,
    pub is_audible: bool,
}

impl SmokeReport {
    pub fn passes(&self, min_rms: f32) -> bool {
        self.rms_level >= min_rms
    }
}

/// Record `duration` from a device and measure its level.
///
/// Refuses to run while `session` is recording, since both would need the
/// same native device.
pub fn run(
    session: &CaptureSession,
    duration: Duration,
    device_index: Option<usize>,
) -> Result<SmokeReport, CaptureError> {
    session.exclusive(|session| {
        let selector = session.selector();
        let (device_id, device) = selector.resolve(device_index)?;
        let backend = selector
            .registry()
            .backend_for(device.backend_kind)
            .ok_or_else(|| CaptureError::DeviceOpenFailed {
                device: device.display_name.clone(),
                reason: format!("no {} backend configured", device.backend_kind.label()),
            })?;

        let mut request = session.stream_request();
        // Batches are one second regardless of the session segment length
        request.read_timeout = Duration::from_secs(1) + request.read_timeout;

        tracing::info!("Smoke test on [{}] {} for {:?}", device_id, device, duration);
        let mut stream = backend.open(&device, &request)?;
        let config = stream.config();

        let total_frames = (duration.as_secs_f64() * config.sample_rate as f64).round() as usize;
        let batch = config.sample_rate as usize;
        let mut samples = Vec::with_capacity(total_frames * config.channels as usize);
        let started = Instant::now();

        let mut remaining = total_frames;
        while remaining > 0 {
            let frames = remaining.min(batch);
            samples.extend(stream.read(frames)?);
            remaining -= frames;
        }
        drop(stream);

        let level = rms(&samples);
        let report = SmokeReport {
            device: device.display_name.clone(),
            device_id,
            is_loopback: device.is_loopback,
            sample_rate: config.sample_rate,
            channels: config.channels,
            frames: total_frames,
            duration_secs: started.elapsed().as_secs_f64(),
            rms_level: level,
            is_audible: level > AUDIBLE_RMS,
        };
        tracing::debug!("Smoke test result: {:?}", report);
        Ok(report)
    })
}
