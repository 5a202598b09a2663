//! Simulated capture backend
//!
//! Scripted devices that behave like native ones: they enumerate, negotiate
//! against a list of accepted configurations, and produce silence or a sine
//! tone, optionally paced in real time. Used by the test suite and by the
//! `--simulate` CLI flag to exercise the engine without audio hardware.

use super::device::{BackendHandle, BackendKind, DeviceDescriptor};
use super::{
    candidate_configs, negotiate, CaptureBackend, CaptureStream, NegotiatedConfig, StreamRequest,
};
use crate::error::CaptureError;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a simulated device "hears"
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    Sine { frequency: f32, amplitude: f32 },
}

/// One scripted device
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub name: String,
    pub is_loopback: bool,
    pub is_input_capable: bool,
    pub host_api: Option<String>,
    pub preferred_sample_rate: Option<u32>,
    pub max_input_channels: Option<u16>,
    /// Configurations the device grants; empty grants anything
    pub accepts: Vec<NegotiatedConfig>,
    pub signal: Signal,
    /// Reads succeed this many times, then fail
    pub fail_after_reads: Option<usize>,
}

impl SimulatedDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_loopback: false,
            is_input_capable: true,
            host_api: None,
            preferred_sample_rate: None,
            max_input_channels: Some(2),
            accepts: Vec::new(),
            signal: Signal::Silence,
            fail_after_reads: None,
        }
    }

    pub fn loopback(mut self) -> Self {
        self.is_loopback = true;
        self
    }

    pub fn host_api(mut self, api: &str) -> Self {
        self.host_api = Some(api.to_string());
        self
    }

    pub fn without_input(mut self) -> Self {
        self.is_input_capable = false;
        self.max_input_channels = Some(0);
        self
    }

    pub fn accepting(mut self, configs: &[(u32, u16)]) -> Self {
        self.accepts = configs
            .iter()
            .map(|&(sample_rate, channels)| NegotiatedConfig {
                sample_rate,
                channels,
            })
            .collect();
        self
    }

    /// A device that refuses every configuration
    pub fn refusing_all(mut self) -> Self {
        self.accepts = vec![NegotiatedConfig {
            sample_rate: 1,
            channels: 99,
        }];
        self
    }

    pub fn signal(mut self, signal: Signal) -> Self {
        self.signal = signal;
        self
    }

    pub fn failing_after(mut self, reads: usize) -> Self {
        self.fail_after_reads = Some(reads);
        self
    }

    fn grants(&self, config: NegotiatedConfig) -> bool {
        self.accepts.is_empty() || self.accepts.contains(&config)
    }
}

#[derive(Debug, Default)]
struct Counters {
    open_attempts: AtomicUsize,
    opens: AtomicUsize,
    frames: AtomicU64,
}

/// Backend serving [`SimulatedDevice`]s
#[derive(Debug)]
pub struct SimulatedBackend {
    kind: BackendKind,
    devices: Vec<SimulatedDevice>,
    realtime: bool,
    available: bool,
    counters: Arc<Counters>,
}

impl SimulatedBackend {
    pub fn new(kind: BackendKind, devices: Vec<SimulatedDevice>) -> Self {
        Self {
            kind,
            devices,
            realtime: true,
            available: true,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Deliver reads immediately instead of pacing them like a device
    pub fn instant(mut self) -> Self {
        self.realtime = false;
        self
    }

    /// Make enumeration fail as if the native subsystem were missing
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Configuration attempts across all opens
    pub fn open_attempts(&self) -> usize {
        self.counters.open_attempts.load(Ordering::SeqCst)
    }

    /// Successful opens
    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Frames delivered by all streams
    pub fn frames_delivered(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }
}

impl CaptureBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &'static str {
        "simulated"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        if !self.available {
            return Err(CaptureError::Enumeration(
                "simulated subsystem unavailable".to_string(),
            ));
        }

        Ok(self
            .devices
            .iter()
            .enumerate()
            .map(|(index, d)| DeviceDescriptor {
                backend_kind: self.kind,
                backend_handle: BackendHandle::Simulated { index },
                display_name: d.name.clone(),
                is_loopback: d.is_loopback,
                is_input_capable: d.is_input_capable,
                is_output_capable: d.is_loopback && self.kind == BackendKind::LoopbackCapture,
                host_api: d.host_api.clone(),
                preferred_sample_rate: d.preferred_sample_rate,
                max_input_channels: d.max_input_channels,
            })
            .collect())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let scripted = match device.backend_handle {
            BackendHandle::Simulated { index } => self.devices.get(index),
            _ => None,
        }
        .ok_or_else(|| CaptureError::DeviceOpenFailed {
            device: device.display_name.clone(),
            reason: "unknown simulated device".to_string(),
        })?;

        let candidates = candidate_configs(request, device);
        let counters = Arc::clone(&self.counters);
        let ((), granted) = negotiate(&device.display_name, &candidates, |c| {
            counters.open_attempts.fetch_add(1, Ordering::SeqCst);
            if scripted.grants(c) {
                Ok(())
            } else {
                Err(format!(
                    "Invalid sample rate or channel count ({} Hz, {} ch)",
                    c.sample_rate, c.channels
                ))
            }
        })?;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimulatedStream {
            config: granted,
            signal: scripted.signal,
            realtime: self.realtime,
            reads_left: scripted.fail_after_reads,
            position: 0,
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct SimulatedStream {
    config: NegotiatedConfig,
    signal: Signal,
    realtime: bool,
    reads_left: Option<usize>,
    position: u64,
    counters: Arc<Counters>,
}

impl CaptureStream for SimulatedStream {
    fn config(&self) -> NegotiatedConfig {
        self.config
    }

    fn read(&mut self, frames: usize) -> Result<Vec<f32>, CaptureError> {
        if let Some(ref mut left) = self.reads_left {
            if *left == 0 {
                return Err(CaptureError::AudioReadFailed(
                    "simulated device disconnected".to_string(),
                ));
            }
            *left -= 1;
        }

        if self.realtime {
            std::thread::sleep(Duration::from_secs_f64(
                frames as f64 / self.config.sample_rate as f64,
            ));
        }

        let channels = self.config.channels as usize;
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames as u64 {
            let value = match self.signal {
                Signal::Silence => 0.0,
                Signal::Sine {
                    frequency,
                    amplitude,
                } => {
                    let t = (self.position + i) as f32 / self.config.sample_rate as f32;
                    amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
                }
            };
            out.extend(std::iter::repeat(value).take(channels));
        }

        self.position += frames as u64;
        self.counters.frames.fetch_add(frames as u64, Ordering::SeqCst);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StreamRequest {
        StreamRequest {
            sample_rate: 44100,
            channels: 2,
            read_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_negotiates_down_to_accepted_config() {
        let backend = SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![SimulatedDevice::new("mic").accepting(&[(48000, 1)])],
        )
        .instant();
        let device = backend.enumerate().unwrap().remove(0);
        let stream = backend.open(&device, &request()).unwrap();
        assert_eq!(
            stream.config(),
            NegotiatedConfig {
                sample_rate: 48000,
                channels: 1
            }
        );
        // 44100x{2,1}, then 48000x2, then 48000x1
        assert_eq!(backend.open_attempts(), 4);
    }

    #[test]
    fn test_refusing_device_fails_open() {
        let backend = SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![SimulatedDevice::new("broken").refusing_all()],
        );
        let device = backend.enumerate().unwrap().remove(0);
        let err = backend.open(&device, &request()).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceOpenFailed { .. }));
        assert_eq!(backend.opens(), 0);
    }

    #[test]
    fn test_sine_is_interleaved_and_bounded() {
        let backend = SimulatedBackend::new(
            BackendKind::LoopbackCapture,
            vec![SimulatedDevice::new("tone").loopback().signal(Signal::Sine {
                frequency: 440.0,
                amplitude: 0.5,
            })],
        )
        .instant();
        let device = backend.enumerate().unwrap().remove(0);
        assert!(device.is_output_capable);
        let mut stream = backend.open(&device, &request()).unwrap();
        let block = stream.read(100).unwrap();
        assert_eq!(block.len(), 200);
        assert_eq!(block[2], block[3]);
        assert!(block.iter().all(|s| s.abs() <= 0.5));
        assert_eq!(backend.frames_delivered(), 100);
    }

    #[test]
    fn test_fail_after_reads() {
        let backend = SimulatedBackend::new(
            BackendKind::StreamCapture,
            vec![SimulatedDevice::new("flaky").failing_after(1)],
        )
        .instant();
        let device = backend.enumerate().unwrap().remove(0);
        let mut stream = backend.open(&device, &request()).unwrap();
        assert!(stream.read(10).is_ok());
        assert!(matches!(
            stream.read(10),
            Err(CaptureError::AudioReadFailed(_))
        ));
    }

    #[test]
    fn test_unavailable_enumeration_errors() {
        let backend = SimulatedBackend::new(BackendKind::StreamCapture, vec![]).unavailable();
        assert!(backend.enumerate().is_err());
    }
}
