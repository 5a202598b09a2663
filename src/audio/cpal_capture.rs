//! cpal-based input streaming
//!
//! Uses the cpal crate for cross-platform audio input.
//! Works with PipeWire, PulseAudio, ALSA, WASAPI and CoreAudio hosts.
//!
//! cpal pushes audio from its own callback thread; samples are handed to a
//! [`SampleQueue`] so the session worker can do blocking, fixed-size reads.
//! Note: cpal::Stream is not Send, so streams are opened and dropped on the
//! thread that reads them.

use super::device::{looks_like_loopback, BackendHandle, BackendKind, DeviceDescriptor};
use super::queue::{PopError, SampleQueue};
use super::{
    candidate_configs, negotiate, CaptureBackend, CaptureStream, NegotiatedConfig, StreamRequest,
};
use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::time::Duration;

/// Seconds of audio a stream may buffer while nobody reads it. Raised to
/// the read timeout when a single read may wait longer than this.
const QUEUE_SECONDS: f64 = 30.0;

/// General-purpose input capture through every available cpal host
#[derive(Debug, Default)]
pub struct StreamBackend;

impl StreamBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for StreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::StreamCapture
    }

    fn name(&self) -> &'static str {
        "cpal input"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let mut descriptors = Vec::new();
        let mut last_error = None;
        let mut any_host = false;

        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(host) => host,
                Err(e) => {
                    tracing::debug!("Audio host {} unavailable: {}", host_id.name(), e);
                    last_error = Some(e.to_string());
                    continue;
                }
            };

            let devices = match host.input_devices() {
                Ok(devices) => devices,
                Err(e) => {
                    tracing::warn!("Cannot list input devices of {}: {}", host_id.name(), e);
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            any_host = true;

            for (index, device) in devices.enumerate() {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Input device {}", index));
                let default = device.default_input_config().ok();
                let max_channels = device
                    .supported_input_configs()
                    .ok()
                    .and_then(|configs| configs.map(|c| c.channels()).max())
                    .or_else(|| default.as_ref().map(|c| c.channels()));

                descriptors.push(DeviceDescriptor {
                    backend_kind: BackendKind::StreamCapture,
                    backend_handle: BackendHandle::Input {
                        host: host_id.name().to_string(),
                        index,
                    },
                    is_loopback: looks_like_loopback(&name),
                    display_name: name,
                    is_input_capable: max_channels.is_some_and(|c| c > 0),
                    is_output_capable: false,
                    host_api: Some(host_id.name().to_string()),
                    preferred_sample_rate: default.as_ref().map(|c| c.sample_rate().0),
                    max_input_channels: max_channels,
                });
            }
        }

        match (any_host, last_error) {
            (false, Some(e)) => Err(CaptureError::Enumeration(e)),
            _ => Ok(descriptors),
        }
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let BackendHandle::Input { host, index } = &device.backend_handle else {
            return Err(open_failed(device, "not an input stream device"));
        };

        let host = find_host(host).map_err(|e| open_failed(device, &e))?;
        let devices = host
            .input_devices()
            .map_err(|e| open_failed(device, &e.to_string()))?;
        let native = pick_device(devices, *index, &device.display_name)
            .ok_or_else(|| open_failed(device, "device disappeared since enumeration"))?;

        let sample_format = native
            .default_input_config()
            .map(|c| c.sample_format())
            .unwrap_or(cpal::SampleFormat::F32);

        open_cpal_stream(&native, sample_format, device, request)
    }
}

pub(crate) fn open_failed(device: &DeviceDescriptor, reason: &str) -> CaptureError {
    CaptureError::DeviceOpenFailed {
        device: device.display_name.clone(),
        reason: reason.to_string(),
    }
}

/// Find an available cpal host by its display name
pub(crate) fn find_host(name: &str) -> Result<cpal::Host, String> {
    let id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name() == name)
        .ok_or_else(|| format!("audio host '{}' is not available", name))?;
    cpal::host_from_id(id).map_err(|e| e.to_string())
}

/// Resolve a device by enumeration index, falling back to a name match if
/// the device list was reordered since the registry was refreshed.
pub(crate) fn pick_device<I>(devices: I, index: usize, name: &str) -> Option<cpal::Device>
where
    I: Iterator<Item = cpal::Device>,
{
    let devices: Vec<cpal::Device> = devices.collect();
    let named = |d: &cpal::Device| d.name().map(|n| n == name).unwrap_or(false);

    if devices.get(index).is_some_and(named) {
        return devices.into_iter().nth(index);
    }
    tracing::debug!("Device index {} moved, searching for '{}' by name", index, name);
    devices.into_iter().find(named)
}

/// Negotiate and start a cpal stream on `native`.
///
/// Output devices of the WASAPI host are captured as loopback by building
/// an input stream on them, so the same path serves both backends.
pub(crate) fn open_cpal_stream(
    native: &cpal::Device,
    sample_format: cpal::SampleFormat,
    descriptor: &DeviceDescriptor,
    request: &StreamRequest,
) -> Result<Box<dyn CaptureStream>, CaptureError> {
    let candidates = candidate_configs(request, descriptor);

    let ((stream, queue), granted) = negotiate(&descriptor.display_name, &candidates, |c| {
        let queue = Arc::new(SampleQueue::new(queue_capacity(c, request.read_timeout)));
        let stream_config = cpal::StreamConfig {
            channels: c.channels,
            sample_rate: cpal::SampleRate(c.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(native, &stream_config, &queue),
            cpal::SampleFormat::I16 => build_stream::<i16>(native, &stream_config, &queue),
            cpal::SampleFormat::U16 => build_stream::<u16>(native, &stream_config, &queue),
            cpal::SampleFormat::I32 => build_stream::<i32>(native, &stream_config, &queue),
            format => Err(format!("Unsupported sample format: {:?}", format)),
        }?;

        stream.play().map_err(|e| e.to_string())?;
        Ok((stream, queue))
    })?;

    tracing::info!(
        "Capturing from '{}' at {} Hz, {} channel(s), format: {:?}",
        descriptor.display_name,
        granted.sample_rate,
        granted.channels,
        sample_format
    );

    Ok(Box::new(CpalStream {
        _stream: stream,
        queue,
        config: granted,
        read_timeout: request.read_timeout,
    }))
}

/// Samples a queue must hold so one read of up to `read_timeout` worth of
/// audio can complete without overflowing
pub(crate) fn queue_capacity(config: NegotiatedConfig, read_timeout: Duration) -> usize {
    let seconds = QUEUE_SECONDS.max(read_timeout.as_secs_f64()).ceil();
    (config.sample_rate as f64 * config.channels as f64 * seconds) as usize
}

/// Build an input stream for a specific sample type
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
) -> Result<cpal::Stream, String>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let data_queue = Arc::clone(queue);
    let err_queue = Arc::clone(queue);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let converted: Vec<f32> = data
                    .iter()
                    .map(|&s| <f32 as cpal::FromSample<T>>::from_sample_(s))
                    .collect();
                data_queue.push(&converted);
            },
            move |err| {
                tracing::error!("Audio stream error: {}", err);
                err_queue.fail(err.to_string());
            },
            None,
        )
        .map_err(|e| e.to_string())
}

/// A running cpal stream; dropping it stops capture and releases the device
struct CpalStream {
    _stream: cpal::Stream,
    queue: Arc<SampleQueue>,
    config: NegotiatedConfig,
    read_timeout: Duration,
}

impl CaptureStream for CpalStream {
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
                    "device delivered {} of {} samples within {:.1}s",
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

impl Drop for CpalStream {
    fn drop(&mut self) {
        let dropped = self.queue.dropped();
        if dropped > 0 {
            tracing::debug!("Stream overflowed, {} samples were dropped", dropped);
        }
    }
}
