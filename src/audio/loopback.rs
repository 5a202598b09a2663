//! Native loopback capture
//!
//! Two kinds of loopback targets are supported:
//! - Output loopback: render devices of the WASAPI host. cpal captures them
//!   by building an input stream on the output device.
//! - Input monitors: PulseAudio/PipeWire `.monitor` sources. These are not
//!   always visible through ALSA, so they are listed with `pactl` and
//!   recorded with `parec` (PulseAudio recording client), which works with
//!   PipeWire's PulseAudio compatibility layer.

use super::cpal_capture::{find_host, open_cpal_stream, open_failed, pick_device, queue_capacity};
use super::device::{BackendHandle, BackendKind, DeviceDescriptor};
use super::queue::{PopError, SampleQueue};
use super::{
    candidate_configs, negotiate, CaptureBackend, CaptureStream, NegotiatedConfig, StreamRequest,
};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait};
use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// Name cpal gives the Windows audio session host
const WASAPI_HOST: &str = "WASAPI";

/// How long a freshly spawned parec gets to reject its arguments
const PAREC_STARTUP_GRACE: Duration = Duration::from_millis(150);

/// Bytes pulled from the parec pipe per read
const PIPE_READ_BYTES: usize = 16 * 1024;

/// Loopback/monitor capture backend
#[derive(Debug, Default)]
pub struct LoopbackBackend;

impl LoopbackBackend {
    pub fn new() -> Self {
        Self
    }

    fn output_loopback_devices(&self) -> Result<Vec<DeviceDescriptor>, String> {
        let host = find_host(WASAPI_HOST)?;
        let devices = host.output_devices().map_err(|e| e.to_string())?;

        let mut descriptors = Vec::new();
        for (index, device) in devices.enumerate() {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("Output device {}", index));
            let default = device.default_output_config().ok();

            descriptors.push(DeviceDescriptor {
                backend_kind: BackendKind::LoopbackCapture,
                backend_handle: BackendHandle::OutputLoopback {
                    host: WASAPI_HOST.to_string(),
                    index,
                },
                display_name: name,
                is_loopback: true,
                is_input_capable: true,
                is_output_capable: true,
                host_api: Some(WASAPI_HOST.to_string()),
                preferred_sample_rate: default.as_ref().map(|c| c.sample_rate().0),
                max_input_channels: default.as_ref().map(|c| c.channels()),
            });
        }
        Ok(descriptors)
    }

    fn monitor_devices(&self) -> Result<Vec<DeviceDescriptor>, String> {
        which::which("parec").map_err(|_| "parec not found in PATH".to_string())?;
        let pactl = which::which("pactl").map_err(|_| "pactl not found in PATH".to_string())?;

        let output = Command::new(pactl)
            .args(["list", "short", "sources"])
            .output()
            .map_err(|e| format!("Failed to run pactl: {}", e))?;
        if !output.status.success() {
            return Err(format!("pactl exited with {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_monitor_sources(&stdout)
            .into_iter()
            .map(|source| DeviceDescriptor {
                backend_kind: BackendKind::LoopbackCapture,
                backend_handle: BackendHandle::Monitor {
                    source: source.name.clone(),
                },
                display_name: source.name,
                is_loopback: true,
                is_input_capable: true,
                is_output_capable: false,
                host_api: Some("PulseAudio".to_string()),
                preferred_sample_rate: source.sample_rate,
                max_input_channels: source.channels,
            })
            .collect())
    }
}

impl CaptureBackend for LoopbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LoopbackCapture
    }

    fn name(&self) -> &'static str {
        "loopback"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let outputs = self.output_loopback_devices();
        let monitors = self.monitor_devices();

        match (outputs, monitors) {
            (Err(a), Err(b)) => Err(CaptureError::Enumeration(format!(
                "no loopback subsystem available ({}; {})",
                a, b
            ))),
            (outputs, monitors) => {
                let mut descriptors = Vec::new();
                for part in [outputs, monitors] {
                    match part {
                        Ok(found) => descriptors.extend(found),
                        Err(e) => tracing::debug!("Loopback subsystem skipped: {}", e),
                    }
                }
                Ok(descriptors)
            }
        }
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        match &device.backend_handle {
            BackendHandle::OutputLoopback { host, index } => {
                let host = find_host(host).map_err(|e| open_failed(device, &e))?;
                let devices = host
                    .output_devices()
                    .map_err(|e| open_failed(device, &e.to_string()))?;
                let native = pick_device(devices, *index, &device.display_name)
                    .ok_or_else(|| open_failed(device, "device disappeared since enumeration"))?;
                let sample_format = native
                    .default_output_config()
                    .map(|c| c.sample_format())
                    .unwrap_or(cpal::SampleFormat::F32);

                open_cpal_stream(&native, sample_format, device, request)
            }
            BackendHandle::Monitor { source } => {
                let candidates = candidate_configs(request, device);
                let (stream, granted) = negotiate(&device.display_name, &candidates, |c| {
                    ParecStream::spawn("parec", source, c, request.read_timeout)
                })?;
                tracing::info!(
                    "Loopback capture started via parec: {} ({} Hz, {} ch)",
                    source,
                    granted.sample_rate,
                    granted.channels
                );
                Ok(Box::new(stream))
            }
            _ => Err(open_failed(device, "not a loopback device")),
        }
    }
}

/// A PulseAudio source line from `pactl list short sources`
#[derive(Debug, Clone, PartialEq)]
struct MonitorSource {
    name: String,
    sample_rate: Option<u32>,
    channels: Option<u16>,
    running: bool,
}

/// Extract monitor sources, running ones first.
///
/// Line format: `ID\tNAME\tDRIVER\tSAMPLE_SPEC\tSTATE`, where the sample
/// spec looks like `s16le 2ch 44100Hz`.
fn parse_monitor_sources(stdout: &str) -> Vec<MonitorSource> {
    let mut sources: Vec<MonitorSource> = stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            let name = fields.get(1)?.trim();
            if !name.contains(".monitor") {
                return None;
            }

            let spec = fields.get(3).copied().unwrap_or("");
            let channels = spec
                .split_whitespace()
                .find_map(|t| t.strip_suffix("ch"))
                .and_then(|n| n.parse().ok());
            let sample_rate = spec
                .split_whitespace()
                .find_map(|t| t.strip_suffix("Hz"))
                .and_then(|n| n.parse().ok());

            Some(MonitorSource {
                name: name.to_string(),
                sample_rate,
                channels,
                running: fields.get(4).is_some_and(|s| s.trim() == "RUNNING"),
            })
        })
        .collect();

    // Stable: keeps pactl order within each group
    sources.sort_by_key(|s| !s.running);
    sources
}

/// Monitor capture through a parec subprocess emitting raw float32le.
///
/// A pump thread moves the pipe into a [`SampleQueue`] so reads are bounded
/// by the read timeout even when parec stalls.
struct ParecStream {
    child: Child,
    queue: Arc<SampleQueue>,
    config: NegotiatedConfig,
    read_timeout: Duration,
}

impl ParecStream {
    fn spawn(
        program: impl AsRef<OsStr>,
        source: &str,
        config: NegotiatedConfig,
        read_timeout: Duration,
    ) -> Result<Self, String> {
        let channels_arg = format!("--channels={}", config.channels);
        let rate_arg = format!("--rate={}", config.sample_rate);
        let mut child = Command::new(program)
            .args([
                "--device",
                source,
                "--format=float32le",
                channels_arg.as_str(),
                rate_arg.as_str(),
                "--raw",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to start parec: {}", e))?;

        std::thread::sleep(PAREC_STARTUP_GRACE);
        if let Ok(Some(status)) = child.try_wait() {
            return Err(format!("parec exited with {}", status));
        }

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err("Failed to capture parec stdout".to_string());
            }
        };

        let queue = Arc::new(SampleQueue::new(queue_capacity(config, read_timeout)));
        let pump_queue = Arc::clone(&queue);
        let pumped = std::thread::Builder::new()
            .name("loopcap-parec".to_string())
            .spawn(move || pump(stdout, &pump_queue));
        if let Err(e) = pumped {
            let _ = child.kill();
            let _ = child.wait();
            return Err(format!("Failed to start parec reader: {}", e));
        }

        Ok(Self {
            child,
            queue,
            config,
            read_timeout,
        })
    }
}

/// Copy parec output into `queue` until the pipe closes.
///
/// Exits once the child is killed, since that closes the pipe.
fn pump(mut stdout: ChildStdout, queue: &SampleQueue) {
    let mut buf = vec![0u8; PIPE_READ_BYTES];
    let mut pending: Vec<u8> = Vec::with_capacity(PIPE_READ_BYTES + 4);

    loop {
        match stdout.read(&mut buf) {
            Ok(0) => {
                queue.fail("parec stream ended");
                return;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let whole = pending.len() - pending.len() % 4;
                let samples: Vec<f32> = pending[..whole]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                pending.drain(..whole);
                queue.push(&samples);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                queue.fail(format!("parec stream ended: {}", e));
                return;
            }
        }
    }
}

impl CaptureStream for ParecStream {
    fn config(&self) -> NegotiatedConfig {
        self.config
    }

    fn read(&mut self, frames: usize) -> Result<Vec<f32>, CaptureError> {
        let wanted = frames * self.config.channels as usize;
        self.queue
            .pop(wanted, self.read_timeout)
            .map_err(|e| match e {
                PopError::Failed(reason) => CaptureError::AudioReadFailed(reason),
                PopError::TimedOut { available } => CaptureError::AudioReadFailed(format!(
                    "parec delivered {} of {} samples within {:.1}s",
                    available,
                    wanted,
                    self.read_timeout.as_secs_f32()
                )),
            })
    }

    fn discard_pending(&mut self) {
        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::debug!("Discarded {} samples buffered during pause", discarded);
        }
    }
}

impl Drop for ParecStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        tracing::debug!("Loopback capture stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACTL_OUTPUT: &str = "\
45\talsa_output.pci-0000_00_1f.3.analog-stereo.monitor\tPipeWire\ts16le 2ch 48000Hz\tSUSPENDED
46\talsa_input.pci-0000_00_1f.3.analog-stereo\tPipeWire\ts16le 2ch 48000Hz\tSUSPENDED
51\tbluez_output.AA_BB.1.monitor\tPipeWire\tfloat32le 1ch 44100Hz\tRUNNING
";

    #[test]
    fn test_parse_monitor_sources_filters_and_orders() {
        let sources = parse_monitor_sources(PACTL_OUTPUT);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name, "bluez_output.AA_BB.1.monitor");
        assert!(sources[0].running);
        assert_eq!(sources[0].channels, Some(1));
        assert_eq!(sources[0].sample_rate, Some(44100));
        assert_eq!(
            sources[1].name,
            "alsa_output.pci-0000_00_1f.3.analog-stereo.monitor"
        );
        assert_eq!(sources[1].sample_rate, Some(48000));
    }

    #[test]
    fn test_parse_monitor_sources_tolerates_short_lines() {
        let sources = parse_monitor_sources("garbage\n7\tfoo.monitor\n");
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].channels, None);
        assert!(!sources[0].running);
    }

    #[cfg(unix)]
    fn fake_parec(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("parec");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Spawn against a script that was just written; another test forking
    /// at the same moment can briefly hold it open for writing
    #[cfg(unix)]
    fn spawn_fake(parec: &std::path::Path, read_timeout: Duration) -> ParecStream {
        let config = NegotiatedConfig {
            sample_rate: 8000,
            channels: 1,
        };
        let mut attempts = 0;
        loop {
            match ParecStream::spawn(parec, "x.monitor", config, read_timeout) {
                Ok(stream) => return stream,
                Err(e) if e.contains("busy") && attempts < 10 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("{}", e),
            }
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_stalled_parec_read_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let parec = fake_parec(dir.path(), "exec sleep 30");
        let mut stream = spawn_fake(&parec, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = stream.read(800).unwrap_err();
        assert!(matches!(err, CaptureError::AudioReadFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    #[cfg(unix)]
    fn test_parec_samples_are_decoded() {
        let dir = tempfile::tempdir().unwrap();
        // 800 mono float32le zeros, then silence without closing the pipe
        let parec = fake_parec(dir.path(), "head -c 3200 /dev/zero\nexec sleep 30");
        let mut stream = spawn_fake(&parec, Duration::from_millis(500));

        let block = stream.read(800).unwrap();
        assert_eq!(block.len(), 800);
        assert!(block.iter().all(|&s| s == 0.0));
        assert!(stream.read(1).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn test_parec_exit_fails_reads() {
        let dir = tempfile::tempdir().unwrap();
        let parec = fake_parec(dir.path(), "sleep 0.4");
        let mut stream = spawn_fake(&parec, Duration::from_secs(5));

        let started = std::time::Instant::now();
        let err = stream.read(800).unwrap_err();
        assert_eq!(
            err,
            CaptureError::AudioReadFailed("parec stream ended".to_string())
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_open_rejects_stream_handle() {
        let descriptor = DeviceDescriptor {
            backend_kind: BackendKind::StreamCapture,
            backend_handle: BackendHandle::Input {
                host: "ALSA".into(),
                index: 0,
            },
            display_name: "mic".into(),
            is_loopback: false,
            is_input_capable: true,
            is_output_capable: false,
            host_api: None,
            preferred_sample_rate: None,
            max_input_channels: None,
        };
        let request = StreamRequest {
            sample_rate: 44100,
            channels: 2,
            read_timeout: Duration::from_secs(1),
        };
        let err = LoopbackBackend::new().open(&descriptor, &request).err().unwrap();
        assert!(matches!(err, CaptureError::DeviceOpenFailed { .. }));
    }
}
