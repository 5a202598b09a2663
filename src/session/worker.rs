//! Background recording thread
//!
//! The worker owns the open capture stream for the whole session. It reads
//! short segments, accumulates them in a [`ChunkBuffer`], and writes a chunk
//! whenever the buffer reaches the chunk length. The session lock is only
//! taken to publish results, never across a device read or a file write.

use super::handler::{deliver, ChunkHandler, ChunkReady};
use super::state::SessionState;
use crate::audio::wav::write_chunk_in;
use crate::audio::{rms, DeviceDescriptor, NegotiatedConfig, SharedBackend, StreamRequest};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long the worker parks on a closed gate before re-checking for stop
const GATE_POLL: Duration = Duration::from_millis(100);

/// Gate the worker waits on while paused
#[derive(Debug)]
pub(crate) struct ResumeGate {
    open: Mutex<bool>,
    changed: Condvar,
}

impl ResumeGate {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(true),
            changed: Condvar::new(),
        }
    }

    pub fn set(&self, open: bool) {
        *self.open.lock().unwrap_or_else(|e| e.into_inner()) = open;
        self.changed.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `timeout` for the gate to open; true if it is open
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let guard = self.open.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |open| !*open)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// Signals shared between the control side and one worker
#[derive(Debug)]
pub(crate) struct WorkerControl {
    stop: AtomicBool,
    pub gate: ResumeGate,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            gate: ResumeGate::new(),
        }
    }

    /// Set the stop flag and open the gate so a paused worker sees it
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.gate.set(true);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Audio accumulated since the last emitted chunk
#[derive(Debug)]
pub struct ChunkBuffer {
    /// Interleaved samples in arrival order
    samples: Vec<f32>,
    channels: usize,
}

impl ChunkBuffer {
    pub fn new(channels: u16) -> Self {
        Self {
            samples: Vec::new(),
            channels: channels.max(1) as usize,
        }
    }

    /// Append one segment
    pub fn add_samples(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Complete frames buffered
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    /// Take ownership of the samples, leaving buffer empty
    pub fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    /// Check if buffer has any audio
    pub fn has_audio(&self) -> bool {
        !self.samples.is_empty()
    }
}

/// Everything one recording thread needs
pub(crate) struct Worker {
    pub generation: u64,
    pub session_id: String,
    pub chunk_dir: PathBuf,
    pub backend: SharedBackend,
    pub device: DeviceDescriptor,
    pub request: StreamRequest,
    pub capture: CaptureConfig,
    pub handler: Box<dyn ChunkHandler>,
    pub control: Arc<WorkerControl>,
    pub state: Arc<Mutex<SessionState>>,
}

impl Worker {
    /// Start the recording thread.
    ///
    /// `ready` receives the negotiated configuration once the stream is
    /// open (or the open error). `done` is dropped when the thread exits,
    /// however it exits.
    pub fn spawn(
        self,
        ready: SyncSender<Result<NegotiatedConfig, CaptureError>>,
        done: Sender<()>,
    ) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("loopcap-capture".to_string())
            .spawn(move || {
                let _done = done;
                let state = Arc::clone(&self.state);
                let generation = self.generation;
                if catch_unwind(AssertUnwindSafe(|| self.run(ready))).is_err() {
                    tracing::error!("Capture worker panicked");
                    publish(&state, generation, |s| {
                        s.fail("capture worker panicked".to_string())
                    });
                }
            })
    }

    fn run(mut self, ready: SyncSender<Result<NegotiatedConfig, CaptureError>>) {
        // Opened here: native streams are bound to the thread that built them
        let mut stream = match self.backend.open(&self.device, &self.request) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let config = stream.config();
        let _ = ready.send(Ok(config));

        let chunk_frames = self.capture.chunk_frames(config.sample_rate);
        let segment_frames = self.capture.segment_frames(config.sample_rate);
        let mut buffer = ChunkBuffer::new(config.channels);
        let mut chunk_index = 0u32;
        let mut was_paused = false;

        tracing::debug!(
            "Capture worker running: {} frames/chunk, {} frames/segment",
            chunk_frames,
            segment_frames
        );

        loop {
            // Stopping always opens the gate, so this cannot miss a stop
            if !self.control.gate.wait_open(GATE_POLL) {
                was_paused = true;
                continue;
            }
            if self.control.stop_requested() {
                break;
            }
            if was_paused {
                stream.discard_pending();
                was_paused = false;
            }

            let wanted = segment_frames.min(chunk_frames.saturating_sub(buffer.frames()).max(1));
            match stream.read(wanted) {
                Ok(block) => {
                    if self.control.stop_requested() {
                        tracing::debug!("Discarding segment that completed after stop");
                        break;
                    }
                    buffer.add_samples(&block);
                    if buffer.frames() >= chunk_frames {
                        self.flush(&mut buffer, &mut chunk_index, config);
                    }
                }
                Err(e) => {
                    tracing::error!("Recording stopped: {}", e);
                    if buffer.has_audio() {
                        self.flush(&mut buffer, &mut chunk_index, config);
                    }
                    self.publish(|s| {
                        s.fail(e.to_string());
                        s.failure = Some(e);
                    });
                    return;
                }
            }
        }

        if buffer.has_audio() {
            tracing::debug!("Flushing final partial chunk ({} frames)", buffer.frames());
            self.flush(&mut buffer, &mut chunk_index, config);
        }
        tracing::debug!("Capture worker exiting after {} chunk(s)", chunk_index);
    }

    /// Write the buffer as chunk `chunk_index` and hand it to the handler
    fn flush(&mut self, buffer: &mut ChunkBuffer, chunk_index: &mut u32, config: NegotiatedConfig) {
        let frames = buffer.frames();
        let samples = buffer.take_samples();
        let level = rms(&samples);

        let path = match write_chunk_in(
            &self.chunk_dir,
            &self.session_id,
            *chunk_index,
            &samples,
            config,
        ) {
            Ok(path) => path,
            Err(e) => {
                // The audio is lost but the index is not consumed
                tracing::error!("Dropping chunk {}: {}", chunk_index, e);
                self.publish(|s| s.last_error = Some(e.to_string()));
                return;
            }
        };

        tracing::info!(
            "Chunk {} written: {:?} ({} frames, rms {:.5})",
            chunk_index,
            path,
            frames,
            level
        );

        let ready = ChunkReady {
            path,
            chunk_index: *chunk_index,
            session_id: self.session_id.clone(),
            frames,
            sample_rate: config.sample_rate,
            channels: config.channels,
            rms_level: level,
        };
        if let Err(e) = deliver(self.handler.as_ref(), &ready) {
            tracing::warn!("{}", e);
        }

        *chunk_index += 1;
        let next = *chunk_index;
        self.publish(|s| {
            s.chunk_index = next;
            s.last_chunk_level = Some(level);
        });
    }

    fn publish(&self, update: impl FnOnce(&mut SessionState)) {
        publish(&self.state, self.generation, update);
    }
}

/// Apply `update` unless the session has moved on to another generation
fn publish(
    state: &Mutex<SessionState>,
    generation: u64,
    update: impl FnOnce(&mut SessionState),
) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    if state.generation == generation {
        update(&mut state);
    } else {
        tracing::debug!("Ignoring update from a retired capture worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_chunk_buffer_counts_frames() {
        let mut buffer = ChunkBuffer::new(2);
        assert!(!buffer.has_audio());
        buffer.add_samples(&[0.1; 10]);
        buffer.add_samples(&[0.2; 6]);
        assert_eq!(buffer.frames(), 8);

        let samples = buffer.take_samples();
        assert_eq!(samples.len(), 16);
        assert_eq!(samples[9], 0.1);
        assert_eq!(samples[10], 0.2);
        assert!(!buffer.has_audio());
        assert_eq!(buffer.frames(), 0);
    }

    #[test]
    fn test_gate_blocks_until_opened() {
        let gate = Arc::new(ResumeGate::new());
        assert!(gate.wait_open(Duration::from_millis(1)));

        gate.set(false);
        let start = Instant::now();
        assert!(!gate.wait_open(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(45));

        let opener = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            opener.set(true);
        });
        assert!(gate.wait_open(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_request_stop_opens_gate() {
        let control = WorkerControl::new();
        control.gate.set(false);
        assert!(!control.stop_requested());
        control.request_stop();
        assert!(control.stop_requested());
        assert!(control.gate.is_open());
    }

    #[test]
    fn test_publish_ignores_stale_generation() {
        let state = Mutex::new(SessionState {
            generation: 3,
            ..SessionState::default()
        });
        publish(&state, 2, |s| s.chunk_index = 7);
        assert_eq!(state.lock().unwrap().chunk_index, 0);
        publish(&state, 3, |s| s.chunk_index = 7);
        assert_eq!(state.lock().unwrap().chunk_index, 7);
    }
}
